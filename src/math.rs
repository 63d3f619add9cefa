//! XZ world-space vector math. Ported from `FixedVec2`
//! (`game/math.rs`) to plain `f32` — see DESIGN.md for why fixed-point
//! determinism is dropped for this crate's scope.

use serde::{Deserialize, Serialize};

/// A 2D vector in the map's XZ ground plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    /// World-space X.
    pub x: f32,
    /// World-space Z (kept as `y` in-struct; the "Z" naming is a convention
    /// of the surrounding game, not this type).
    pub y: f32,
}

impl Vec2 {
    /// The zero vector.
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    /// Builds a vector from components.
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Squared length; prefer this over [`Vec2::length`] when only comparing
    /// magnitudes, to avoid the `sqrt`.
    pub fn length_squared(self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    /// Euclidean length.
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Unit vector in the same direction, or [`Vec2::ZERO`] if this vector is
    /// (near enough) zero length.
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len <= f32::EPSILON {
            Self::ZERO
        } else {
            Self::new(self.x / len, self.y / len)
        }
    }

    /// Dot product.
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// 2D "cross product" (the Z component of the 3D cross product).
    pub fn cross(self, other: Self) -> f32 {
        self.x * other.y - self.y * other.x
    }

    /// Returns this vector truncated to at most `max_len` in magnitude.
    pub fn truncate(self, max_len: f32) -> Self {
        let len_sq = self.length_squared();
        if len_sq <= max_len * max_len || len_sq <= f32::EPSILON {
            self
        } else {
            self.normalize() * max_len
        }
    }

    /// Distance between two points.
    pub fn distance(self, other: Self) -> f32 {
        (self - other).length()
    }
}

impl std::ops::Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl std::ops::Div<f32> for Vec2 {
    type Output = Self;
    fn div(self, rhs: f32) -> Self {
        Self::new(self.x / rhs, self.y / rhs)
    }
}

impl std::ops::Neg for Vec2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

/// An axis-aligned world-space box, used for tile bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Box2 {
    /// Minimum (bottom-left) corner.
    pub min: Vec2,
    /// Maximum (top-right) corner.
    pub max: Vec2,
}

impl Box2 {
    /// Builds a box from corners.
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Whether `point` lies within the box (inclusive).
    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
    }

    /// Center point.
    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_zero_is_zero() {
        assert_eq!(Vec2::ZERO.normalize(), Vec2::ZERO);
    }

    #[test]
    fn truncate_preserves_direction() {
        let v = Vec2::new(3.0, 4.0); // length 5
        let t = v.truncate(2.0);
        assert!((t.length() - 2.0).abs() < 1e-4);
        assert!((t.normalize().x - v.normalize().x).abs() < 1e-4);
    }

    #[test]
    fn box_contains() {
        let b = Box2::new(Vec2::new(0.0, 0.0), Vec2::new(10.0, 10.0));
        assert!(b.contains(Vec2::new(5.0, 5.0)));
        assert!(!b.contains(Vec2::new(-1.0, 5.0)));
    }
}

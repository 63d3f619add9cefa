//! ClearPath/HRVO neighbour avoidance.
//!
//! The HRVO formulation itself is new, built directly from the algorithm's
//! published description. The cached-neighbour input shape (a disk agent
//! plus up to `MAX_NEIGHBOURS` dynamic/static others) follows the query
//! pattern in `simulation/collision.rs`. Exact VO-cone boundary selection
//! is approximated by dense directional/speed sampling rather than
//! closed-form cone-edge geometry, since this module can't be compiled or
//! run to validate the geometry by hand.

use crate::math::Vec2;

/// Up to this many dynamic, and separately this many static, neighbours are
/// considered per agent per tick.
pub const MAX_NEIGHBOURS: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct AvoidanceAgent {
    pub pos: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct AvoidanceNeighbour {
    pub pos: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
    /// Static neighbours take full avoidance responsibility; moving ones
    /// split it.
    pub is_static: bool,
}

const SAMPLE_DIRECTIONS: usize = 32;
const SAMPLE_SPEED_FRACTIONS: [f32; 4] = [1.0, 0.75, 0.5, 0.25];

/// Picks a velocity in (an approximation of) the set of admissible
/// velocities closest to `v_pref`, using the Hybrid Reciprocal Velocity
/// Obstacle responsibility split. Falls back to the least-penetrating
/// sampled candidate when nothing is fully admissible.
pub fn choose_velocity(agent: &AvoidanceAgent, v_pref: Vec2, max_speed: f32, neighbours: &[AvoidanceNeighbour]) -> Vec2 {
    let neighbours = &neighbours[..neighbours.len().min(MAX_NEIGHBOURS)];
    let candidates = sample_candidates(v_pref, max_speed);

    let mut best_admissible: Option<(f32, Vec2)> = None;
    let mut best_fallback: Option<(f32, Vec2)> = None;

    for candidate in candidates {
        let penetration = total_penetration(agent, candidate, neighbours);
        let dist_to_pref = candidate.distance(v_pref);
        if penetration <= 0.0 {
            if best_admissible.is_none_or(|(d, _)| dist_to_pref < d) {
                best_admissible = Some((dist_to_pref, candidate));
            }
        }
        let fallback_score = penetration * 1000.0 + dist_to_pref;
        if best_fallback.is_none_or(|(s, _)| fallback_score < s) {
            best_fallback = Some((fallback_score, candidate));
        }
    }

    best_admissible.or(best_fallback).map(|(_, v)| v).unwrap_or(Vec2::ZERO)
}

fn sample_candidates(v_pref: Vec2, max_speed: f32) -> Vec<Vec2> {
    let mut out = Vec::with_capacity(SAMPLE_DIRECTIONS * SAMPLE_SPEED_FRACTIONS.len() + 2);
    out.push(v_pref.truncate(max_speed));
    out.push(Vec2::ZERO);
    for i in 0..SAMPLE_DIRECTIONS {
        let angle = (i as f32 / SAMPLE_DIRECTIONS as f32) * std::f32::consts::TAU;
        let dir = Vec2::new(angle.cos(), angle.sin());
        for &frac in &SAMPLE_SPEED_FRACTIONS {
            out.push(dir * (max_speed * frac));
        }
    }
    out
}

/// Sum of how far `candidate` (interpreted as the agent's new velocity)
/// penetrates each neighbour's velocity-obstacle cone; `0.0` means fully
/// admissible.
fn total_penetration(agent: &AvoidanceAgent, candidate: Vec2, neighbours: &[AvoidanceNeighbour]) -> f32 {
    neighbours.iter().map(|n| cone_penetration(agent, candidate, n)).sum()
}

fn cone_penetration(agent: &AvoidanceAgent, candidate: Vec2, neighbour: &AvoidanceNeighbour) -> f32 {
    let relative_pos = neighbour.pos - agent.pos;
    let dist = relative_pos.length();
    let combined_radius = agent.radius + neighbour.radius;
    if dist <= combined_radius {
        return combined_radius - dist + 1.0; // already overlapping: any velocity is unsafe, scaled by severity
    }

    let responsibility = if neighbour.is_static { 1.0 } else { 0.5 };
    let apex = neighbour.velocity * (1.0 - responsibility);
    let rel_vel = candidate - apex;
    if rel_vel.length_squared() <= f32::EPSILON {
        return 0.0;
    }

    let to_neighbour = relative_pos.normalize();
    let half_angle = (combined_radius / dist).clamp(-1.0, 1.0).asin();
    let rel_dir = rel_vel.normalize();
    let cos_angle = rel_dir.dot(to_neighbour).clamp(-1.0, 1.0);
    let angle = cos_angle.acos();
    if angle >= half_angle {
        0.0
    } else {
        half_angle - angle
    }
}

trait OptionExt<T> {
    fn is_none_or(self, f: impl FnOnce(&T) -> bool) -> bool;
}
impl<T> OptionExt<T> for Option<T> {
    fn is_none_or(self, f: impl FnOnce(&T) -> bool) -> bool {
        match &self {
            None => true,
            Some(v) => f(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_neighbours_returns_preferred_velocity() {
        let agent = AvoidanceAgent { pos: Vec2::ZERO, velocity: Vec2::ZERO, radius: 0.5 };
        let v = choose_velocity(&agent, Vec2::new(3.0, 0.0), 5.0, &[]);
        assert!((v.x - 3.0).abs() < 0.6);
    }

    #[test]
    fn head_on_static_neighbour_deflects_velocity() {
        let agent = AvoidanceAgent { pos: Vec2::ZERO, velocity: Vec2::new(1.0, 0.0), radius: 0.5 };
        let neighbours = [AvoidanceNeighbour { pos: Vec2::new(1.0, 0.0), velocity: Vec2::ZERO, radius: 0.5, is_static: true }];
        let v = choose_velocity(&agent, Vec2::new(5.0, 0.0), 5.0, &neighbours);
        assert!(v.x < 5.0 - 1e-3 || v.y.abs() > 1e-3);
    }

    #[test]
    fn overlapping_neighbour_still_returns_some_velocity() {
        let agent = AvoidanceAgent { pos: Vec2::ZERO, velocity: Vec2::ZERO, radius: 1.0 };
        let neighbours = [AvoidanceNeighbour { pos: Vec2::new(0.1, 0.0), velocity: Vec2::ZERO, radius: 1.0, is_static: true }];
        let v = choose_velocity(&agent, Vec2::new(1.0, 0.0), 5.0, &neighbours);
        assert!(v.length() <= 5.01);
    }
}

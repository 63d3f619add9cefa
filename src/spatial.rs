//! Uniform-grid spatial index for avoidance neighbour queries.
//!
//! Ported from `spatial_hash::SpatialHash`, simplified from a staggered
//! multi-resolution grid down to a single resolution sized off the
//! avoidance query radius — this crate only ever queries at one scale
//! (`CLEARPATH_NEIGHBOUR_RADIUS`), so multi-tier staggering buys nothing
//! here.

use crate::math::Vec2;
use rustc_hash::FxHashMap;

/// Default avoidance neighbour query radius.
pub const CLEARPATH_NEIGHBOUR_RADIUS: f32 = 8.0;

/// A uniform grid over world-space points, bucketed by `cell_size`.
pub struct SpatialHash {
    cell_size: f32,
    buckets: FxHashMap<(i64, i64), Vec<(u32, Vec2)>>,
}

impl SpatialHash {
    pub fn new(cell_size: f32) -> Self {
        Self { cell_size: cell_size.max(0.01), buckets: FxHashMap::default() }
    }

    fn cell_of(&self, pos: Vec2) -> (i64, i64) {
        ((pos.x / self.cell_size).floor() as i64, (pos.y / self.cell_size).floor() as i64)
    }

    /// Clears and rebuilds the index from scratch (cheap relative to the
    /// per-tick cost of the avoidance queries it serves).
    pub fn rebuild(&mut self, agents: impl Iterator<Item = (u32, Vec2)>) {
        self.buckets.clear();
        for (uid, pos) in agents {
            self.buckets.entry(self.cell_of(pos)).or_default().push((uid, pos));
        }
    }

    /// Every indexed `(uid, pos)` within `radius` of `center`, `uid_self`
    /// excluded.
    pub fn query_radius(&self, center: Vec2, radius: f32, uid_self: u32) -> Vec<(u32, Vec2)> {
        let (cx, cy) = self.cell_of(center);
        let cell_span = (radius / self.cell_size).ceil() as i64 + 1;
        let radius_sq = radius * radius;
        let mut out = Vec::new();
        for dy in -cell_span..=cell_span {
            for dx in -cell_span..=cell_span {
                let Some(bucket) = self.buckets.get(&(cx + dx, cy + dy)) else { continue };
                for &(uid, pos) in bucket {
                    if uid == uid_self {
                        continue;
                    }
                    if pos.distance(center) * pos.distance(center) <= radius_sq {
                        out.push((uid, pos));
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

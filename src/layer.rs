//! Navigation layers: an impassable cell for a large footprint may
//! be passable for a smaller one, so each layer keeps independent
//! cost/blocker/island arrays.

use serde::{Deserialize, Serialize};

/// Distinguishes foot-sized vs. larger vs. water vs. air agents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum NavLayer {
    /// 1x1-tile footprint agents.
    Foot = 0,
    /// Larger (e.g. 3x3-tile footprint) agents.
    Large = 1,
    /// Water-bound agents.
    Water = 2,
    /// Air agents (mostly ignore terrain cost, never blockers).
    Air = 3,
}

impl NavLayer {
    /// All layers, in a stable order matching [`NavLayer`]'s discriminants.
    pub const ALL: [NavLayer; 4] = [NavLayer::Foot, NavLayer::Large, NavLayer::Water, NavLayer::Air];

    /// Array index for per-layer storage.
    pub fn as_index(self) -> usize {
        self as usize
    }
}

//! Field targets, the 64-bit field id packing, and the grid data the field
//! builder produces.

pub mod builder;
pub mod cache;

use crate::grid::TileDesc;
use crate::layer::NavLayer;
use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};

/// One of the eight compass directions a flow cell can point, or `None` when
/// the cell has no forward direction (unreached, a target cell, or an
/// unresolved gradient tie). Encoded in 4 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    N = 0,
    S = 1,
    E = 2,
    W = 3,
    NW = 4,
    NE = 5,
    SW = 6,
    SE = 7,
    None = 8,
}

impl Direction {
    /// The `(dc, dr)` unit step this direction takes, or `(0, 0)` for
    /// [`Direction::None`].
    pub fn step(self) -> (i64, i64) {
        match self {
            Direction::N => (0, -1),
            Direction::S => (0, 1),
            Direction::E => (1, 0),
            Direction::W => (-1, 0),
            Direction::NW => (-1, -1),
            Direction::NE => (1, -1),
            Direction::SW => (-1, 1),
            Direction::SE => (1, 1),
            Direction::None => (0, 0),
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Direction::N,
            1 => Direction::S,
            2 => Direction::E,
            3 => Direction::W,
            4 => Direction::NW,
            5 => Direction::NE,
            6 => Direction::SW,
            7 => Direction::SE,
            _ => Direction::None,
        }
    }
}

/// The kind of target a field was built for — packed into [`FieldId`]'s
/// `target_type` nibble, and dispatching which [`builder`] algorithm ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldKind {
    Tile = 0,
    Portal = 1,
    PortalMask = 2,
    Enemies = 3,
    Entity = 4,
    /// LOS field for a tile target — kept distinct from [`FieldKind::Tile`]
    /// so a chunk's flow and LOS fields for the same target tile occupy
    /// separate cache slots instead of clobbering one another.
    TileLos = 5,
    /// Formation cell-arrival field (a region-straddling variant of
    /// [`FieldKind::Tile`], kept distinct since it's keyed against the
    /// formation's field-center chunk rather than the cell's own chunk).
    CellArrival = 6,
    /// "To-nearest-pathable" recovery field for an agent standing on an
    /// impassable tile (spec's `update_to_nearest_pathable`).
    ImpassableRecovery = 7,
}

/// A 64-bit field id: `[layer:4][target_type:4][target_specific:40][chunk_r:8][chunk_c:8]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u64);

impl FieldId {
    /// Packs a tile-target field id.
    pub fn for_tile(layer: NavLayer, chunk: (u32, u32), td: TileDesc) -> Self {
        let specific = ((td.tile_r as u64) << 6) | td.tile_c as u64;
        Self::pack(layer, FieldKind::Tile, specific, chunk)
    }

    /// Packs the LOS-field id for a tile target.
    pub fn for_tile_los(layer: NavLayer, chunk: (u32, u32), td: TileDesc) -> Self {
        let specific = ((td.tile_r as u64) << 6) | td.tile_c as u64;
        Self::pack(layer, FieldKind::TileLos, specific, chunk)
    }

    /// Packs a cell-arrival field id, keyed by the formation's field-center
    /// chunk and the cell's own tile (a formation member's assigned cell
    /// might sit in a different chunk than the one this id's `chunk()`
    /// reports — see [`crate::field::builder::build_cell_arrival_field`]).
    pub fn for_cell_arrival(layer: NavLayer, center_chunk: (u32, u32), cell_td: TileDesc) -> Self {
        let specific = ((cell_td.chunk_r as u64 & 0xFF) << 20)
            | ((cell_td.chunk_c as u64 & 0xFF) << 12)
            | ((cell_td.tile_r as u64 & 0x3F) << 6)
            | (cell_td.tile_c as u64 & 0x3F);
        Self::pack(layer, FieldKind::CellArrival, specific, center_chunk)
    }

    /// Packs an impassable-recovery field id, keyed by the stuck tile's own
    /// chunk and position — unlike [`FieldId::for_cell_arrival`], this
    /// field never straddles more than one agent's local neighbourhood, so
    /// `chunk()` reporting the stuck tile's own chunk is enough for
    /// `invalidate_chunk` to evict it correctly on a terrain/blocker edit.
    pub fn for_impassable_recovery(layer: NavLayer, chunk: (u32, u32), stuck_td: TileDesc) -> Self {
        let specific = ((stuck_td.tile_r as u64) << 6) | stuck_td.tile_c as u64;
        Self::pack(layer, FieldKind::ImpassableRecovery, specific, chunk)
    }

    /// Packs a portal-target field id: `(next_iid:4, port_iid:4, r0:6, c0:6,
    /// r1:6, c1:6)`.
    pub fn for_portal(layer: NavLayer, chunk: (u32, u32), portal: TileDesc, port_iid: u16, next_iid: u16) -> Self {
        let specific = ((next_iid as u64 & 0xF) << 36)
            | ((port_iid as u64 & 0xF) << 32)
            | ((portal.tile_r as u64 & 0x3F) << 26)
            | ((portal.tile_c as u64 & 0x3F) << 20);
        Self::pack(layer, FieldKind::Portal, specific, chunk)
    }

    /// Packs an enemy-seek field id.
    pub fn for_enemies(layer: NavLayer, chunk: (u32, u32), faction: u8) -> Self {
        Self::pack(layer, FieldKind::Enemies, faction as u64, chunk)
    }

    /// Packs an entity-seek field id.
    pub fn for_entity(layer: NavLayer, chunk: (u32, u32), uid: u32) -> Self {
        Self::pack(layer, FieldKind::Entity, uid as u64, chunk)
    }

    fn pack(layer: NavLayer, kind: FieldKind, specific: u64, chunk: (u32, u32)) -> Self {
        let layer_bits = (layer.as_index() as u64 & 0xF) << 60;
        let kind_bits = (kind as u64 & 0xF) << 56;
        let specific_bits = (specific & 0xFF_FFFF_FFFF) << 16;
        let chunk_r_bits = (chunk.0 as u64 & 0xFF) << 8;
        let chunk_c_bits = chunk.1 as u64 & 0xFF;
        Self(layer_bits | kind_bits | specific_bits | chunk_r_bits | chunk_c_bits)
    }

    /// The chunk this id was built against.
    pub fn chunk(self) -> (u32, u32) {
        (((self.0 >> 8) & 0xFF) as u32, (self.0 & 0xFF) as u32)
    }

    /// The navigation layer this id was built against.
    pub fn layer_index(self) -> u8 {
        ((self.0 >> 60) & 0xF) as u8
    }
}

/// Per-cell scalar distance-to-goal, `f32::INFINITY` for unreached cells.
#[derive(Clone, Debug)]
pub struct IntegrationField {
    pub width: u32,
    pub height: u32,
    costs: Vec<f32>,
}

impl IntegrationField {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, costs: vec![f32::INFINITY; (width * height) as usize] }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    pub fn cost(&self, x: u32, y: u32) -> f32 {
        self.costs[self.index(x, y)]
    }

    pub fn set_cost(&mut self, x: u32, y: u32, cost: f32) {
        let idx = self.index(x, y);
        self.costs[idx] = cost;
    }

    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }
}

/// A chunk-resolution grid of [`Direction`]s, packed 4 bits per cell, two
/// cells per byte.
#[derive(Clone, Debug)]
pub struct FlowField {
    pub width: u32,
    pub height: u32,
    packed: Vec<u8>,
}

impl FlowField {
    pub fn new(width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Self { width, height, packed: vec![0u8; n.div_ceil(2)] }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    pub fn get(&self, x: u32, y: u32) -> Direction {
        let idx = self.index(x, y);
        let byte = self.packed[idx / 2];
        let nibble = if idx % 2 == 0 { byte & 0x0F } else { (byte >> 4) & 0x0F };
        Direction::from_u8(nibble)
    }

    pub fn set(&mut self, x: u32, y: u32, dir: Direction) {
        let idx = self.index(x, y);
        let byte = &mut self.packed[idx / 2];
        if idx % 2 == 0 {
            *byte = (*byte & 0xF0) | (dir as u8);
        } else {
            *byte = (*byte & 0x0F) | ((dir as u8) << 4);
        }
    }
}

/// Per-cell visibility / wavefront-blocked pair.
#[derive(Clone, Debug)]
pub struct LosField {
    pub width: u32,
    pub height: u32,
    bits: FixedBitSet,
}

impl LosField {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, bits: FixedBitSet::with_capacity((width * height * 2) as usize) }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        ((y * self.width + x) * 2) as usize
    }

    pub fn visible(&self, x: u32, y: u32) -> bool {
        self.bits.contains(self.index(x, y))
    }

    pub fn wavefront_blocked(&self, x: u32, y: u32) -> bool {
        self.bits.contains(self.index(x, y) + 1)
    }

    pub fn set_visible(&mut self, x: u32, y: u32, value: bool) {
        let idx = self.index(x, y);
        self.bits.set(idx, value);
    }

    pub fn set_wavefront_blocked(&mut self, x: u32, y: u32, value: bool) {
        let idx = self.index(x, y) + 1;
        self.bits.set(idx, value);
    }
}

/// The built product stored in the [`cache::FieldCache`] for one
/// [`FieldId`].
#[derive(Clone, Debug)]
pub enum Field {
    Flow { integration: IntegrationField, flow: FlowField },
    Los(LosField),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_field_packs_two_cells_per_byte() {
        let mut f = FlowField::new(2, 1);
        f.set(0, 0, Direction::N);
        f.set(1, 0, Direction::SE);
        assert_eq!(f.get(0, 0), Direction::N);
        assert_eq!(f.get(1, 0), Direction::SE);
        assert_eq!(f.packed.len(), 1);
    }

    #[test]
    fn field_id_round_trips_chunk_and_layer() {
        let id = FieldId::for_tile(NavLayer::Large, (3, 7), TileDesc::new(3, 7, 10, 20));
        assert_eq!(id.chunk(), (3, 7));
        assert_eq!(id.layer_index(), NavLayer::Large.as_index() as u8);
    }

    #[test]
    fn cell_arrival_field_id_distinguishes_cells() {
        let a = FieldId::for_cell_arrival(NavLayer::Foot, (0, 0), TileDesc::new(0, 1, 2, 3));
        let b = FieldId::for_cell_arrival(NavLayer::Foot, (0, 0), TileDesc::new(0, 1, 2, 4));
        assert_ne!(a, b);
        assert_eq!(a.chunk(), (0, 0));
    }

    #[test]
    fn impassable_recovery_field_id_keys_on_its_own_chunk() {
        let id = FieldId::for_impassable_recovery(NavLayer::Foot, (2, 1), TileDesc::new(2, 1, 4, 4));
        assert_eq!(id.chunk(), (2, 1));
        let other_tile = FieldId::for_impassable_recovery(NavLayer::Foot, (2, 1), TileDesc::new(2, 1, 4, 5));
        assert_ne!(id, other_tile);
    }

    #[test]
    fn portal_field_id_distinguishes_islands() {
        let portal = TileDesc::new(0, 0, 5, 5);
        let a = FieldId::for_portal(NavLayer::Foot, (0, 0), portal, 1, 2);
        let b = FieldId::for_portal(NavLayer::Foot, (0, 0), portal, 1, 3);
        assert_ne!(a, b);
    }
}

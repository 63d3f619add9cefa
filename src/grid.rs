//! Tile grid & coordinate math.
//!
//! Converts XZ world coordinates to tile descriptors and back, iterates
//! neighbourhoods, and computes chunk-crossing deltas. Ported from the
//! flat `FlowField::world_to_grid`/`grid_to_world` (a single dense
//! grid) into chunked, per-layer addressing keyed on
//! `(chunk_r, chunk_c, tile_r, tile_c)`.

use crate::math::{Box2, Vec2};
use serde::{Deserialize, Serialize};

/// Describes the fixed map resolution: chunk counts and per-chunk tile
/// counts, plus the world-space size of one tile.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MapResolution {
    /// Number of chunks along X.
    pub chunks_wide: u32,
    /// Number of chunks along Z.
    pub chunks_high: u32,
    /// Tiles per chunk along X. Typically 64.
    pub tile_cols: u32,
    /// Tiles per chunk along Z. Typically 64.
    pub tile_rows: u32,
    /// World-space length of one tile's edge.
    pub tile_size: f32,
}

impl MapResolution {
    /// Total tile columns across the whole map.
    pub fn total_cols(&self) -> u32 {
        self.chunks_wide * self.tile_cols
    }

    /// Total tile rows across the whole map.
    pub fn total_rows(&self) -> u32 {
        self.chunks_high * self.tile_rows
    }
}

/// A tile descriptor: `(chunk_r, chunk_c, tile_r, tile_c)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileDesc {
    /// Chunk row.
    pub chunk_r: u32,
    /// Chunk column.
    pub chunk_c: u32,
    /// Tile row within the chunk.
    pub tile_r: u32,
    /// Tile column within the chunk.
    pub tile_c: u32,
}

impl TileDesc {
    /// Builds a descriptor directly.
    pub fn new(chunk_r: u32, chunk_c: u32, tile_r: u32, tile_c: u32) -> Self {
        Self { chunk_r, chunk_c, tile_r, tile_c }
    }

    /// The chunk coordinate this tile belongs to.
    pub fn chunk(&self) -> (u32, u32) {
        (self.chunk_r, self.chunk_c)
    }

    /// Absolute (map-wide) row/column, collapsing the chunk/tile split.
    fn absolute(&self, res: &MapResolution) -> (i64, i64) {
        (
            self.chunk_r as i64 * res.tile_rows as i64 + self.tile_r as i64,
            self.chunk_c as i64 * res.tile_cols as i64 + self.tile_c as i64,
        )
    }

    fn from_absolute(res: &MapResolution, row: i64, col: i64) -> Option<Self> {
        if row < 0 || col < 0 {
            return None;
        }
        let (row, col) = (row as u32, col as u32);
        if row >= res.total_rows() || col >= res.total_cols() {
            return None;
        }
        Some(Self {
            chunk_r: row / res.tile_rows,
            chunk_c: col / res.tile_cols,
            tile_r: row % res.tile_rows,
            tile_c: col % res.tile_cols,
        })
    }
}

/// Returns the descriptor of the tile containing `xz`, or `None` if `xz`
/// falls outside the map.
pub fn desc_for_point(res: &MapResolution, map_origin: Vec2, xz: Vec2) -> Option<TileDesc> {
    let local = xz - map_origin;
    if local.x < 0.0 || local.y < 0.0 {
        return None;
    }
    let col = (local.x / res.tile_size) as i64;
    let row = (local.y / res.tile_size) as i64;
    TileDesc::from_absolute(res, row, col)
}

/// Shifts `td` by `(dc, dr)` tile units, clamping to map bounds. Returns
/// `true` iff the shift was fully absorbed without clipping against an edge.
pub fn relative_desc(res: &MapResolution, td: &mut TileDesc, dc: i64, dr: i64) -> bool {
    let (row, col) = td.absolute(res);
    let wanted_row = row + dr;
    let wanted_col = col + dc;
    let clamped_row = wanted_row.clamp(0, res.total_rows() as i64 - 1);
    let clamped_col = wanted_col.clamp(0, res.total_cols() as i64 - 1);
    *td = TileDesc::from_absolute(res, clamped_row, clamped_col)
        .expect("clamped coordinates are always in-bounds");
    wanted_row == clamped_row && wanted_col == clamped_col
}

/// Signed row/column delta in tile units between two descriptors, correctly
/// crossing chunk boundaries.
pub fn distance(res: &MapResolution, a: TileDesc, b: TileDesc, dr: &mut i64, dc: &mut i64) {
    let (ar, ac) = a.absolute(res);
    let (br, bc) = b.absolute(res);
    *dr = br - ar;
    *dc = bc - ac;
}

/// Resolves an absolute (map-wide) row/column pair back into a tile
/// descriptor, `None` if either coordinate falls outside the map. Exposed
/// for region-based field construction (e.g. the formation cell-arrival
/// field) that addresses tiles in map-absolute space rather than relative
/// to one chunk.
pub fn tile_desc_from_absolute(res: &MapResolution, row: i64, col: i64) -> Option<TileDesc> {
    TileDesc::from_absolute(res, row, col)
}

/// The absolute (map-wide) row/column of `td`, the inverse of
/// [`tile_desc_from_absolute`].
pub fn absolute_of(res: &MapResolution, td: TileDesc) -> (i64, i64) {
    td.absolute(res)
}

/// The axis-aligned world-space box covered by a tile.
pub fn bounds(res: &MapResolution, map_origin: Vec2, td: TileDesc) -> Box2 {
    let (row, col) = td.absolute(res);
    let min = map_origin + Vec2::new(col as f32 * res.tile_size, row as f32 * res.tile_size);
    let max = min + Vec2::new(res.tile_size, res.tile_size);
    Box2::new(min, max)
}

/// 8 neighbour offsets in the tie-break order used for flow direction
/// selection: N, S, E, W, NW, NE, SW, SE.
pub const NEIGHBOUR_OFFSETS_8: [(i64, i64); 8] = [
    (0, -1),  // N (row-1)
    (0, 1),   // S (row+1)
    (1, 0),   // E (col+1)
    (-1, 0),  // W (col-1)
    (-1, -1), // NW
    (1, -1),  // NE
    (-1, 1),  // SW
    (1, 1),   // SE
];

/// 4-connected neighbour offsets (N, S, E, W) used for integration-field
/// relaxation and LOS propagation.
pub const NEIGHBOUR_OFFSETS_4: [(i64, i64); 4] = [(0, -1), (0, 1), (1, 0), (-1, 0)];

/// Iterates the (at most 8) in-bounds neighbours of `td`.
pub fn neighbours_8(res: &MapResolution, td: TileDesc) -> impl Iterator<Item = TileDesc> + '_ {
    let (row, col) = td.absolute(res);
    NEIGHBOUR_OFFSETS_8
        .iter()
        .filter_map(move |(dc, dr)| TileDesc::from_absolute(res, row + dr, col + dc))
}

/// Iterates the (at most 4) in-bounds 4-connected neighbours of `td`.
pub fn neighbours_4(res: &MapResolution, td: TileDesc) -> impl Iterator<Item = TileDesc> + '_ {
    let (row, col) = td.absolute(res);
    NEIGHBOUR_OFFSETS_4
        .iter()
        .filter_map(move |(dc, dr)| TileDesc::from_absolute(res, row + dr, col + dc))
}

/// Enumerates every tile descriptor covered by an axis-aligned footprint of
/// `half_extent_tiles` radius centered on `center`.
pub fn all_under_obj(res: &MapResolution, center: TileDesc, half_extent_tiles: u32) -> Vec<TileDesc> {
    let (row, col) = center.absolute(res);
    let r = half_extent_tiles as i64;
    let mut out = Vec::new();
    for dr in -r..=r {
        for dc in -r..=r {
            if let Some(td) = TileDesc::from_absolute(res, row + dr, col + dc) {
                out.push(td);
            }
        }
    }
    out
}

/// Enumerates every tile descriptor whose center lies within `radius_tiles`
/// of `center`, used for footprint dilation
/// when blocking/unblocking a disk of tiles.
pub fn all_under_circle(res: &MapResolution, center: TileDesc, radius_tiles: f32) -> Vec<TileDesc> {
    let (row, col) = center.absolute(res);
    let r = radius_tiles.ceil() as i64;
    let r2 = radius_tiles * radius_tiles;
    let mut out = Vec::new();
    for dr in -r..=r {
        for dc in -r..=r {
            if (dr * dr + dc * dc) as f32 > r2 {
                continue;
            }
            if let Some(td) = TileDesc::from_absolute(res, row + dr, col + dc) {
                out.push(td);
            }
        }
    }
    out
}

/// The one-tile contour (outward boundary ring) of a covered set, used to
/// dilate a footprint by one tile per navigation layer. `covered` need not be contiguous.
pub fn contour(res: &MapResolution, covered: &[TileDesc]) -> Vec<TileDesc> {
    use std::collections::HashSet;
    let covered_set: HashSet<TileDesc> = covered.iter().copied().collect();
    let mut ring: HashSet<TileDesc> = HashSet::new();
    for &td in covered {
        for n in neighbours_8(res, td) {
            if !covered_set.contains(&n) {
                ring.insert(n);
            }
        }
    }
    ring.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res() -> MapResolution {
        MapResolution { chunks_wide: 4, chunks_high: 4, tile_cols: 8, tile_rows: 8, tile_size: 1.0 }
    }

    #[test]
    fn desc_for_point_round_trips_through_bounds() {
        let r = res();
        let origin = Vec2::ZERO;
        let td = desc_for_point(&r, origin, Vec2::new(10.5, 3.2)).unwrap();
        assert_eq!(td, TileDesc::new(0, 1, 3, 2));
        let b = bounds(&r, origin, td);
        assert!(b.contains(Vec2::new(10.5, 3.2)));
    }

    #[test]
    fn desc_for_point_out_of_bounds_is_none() {
        let r = res();
        assert!(desc_for_point(&r, Vec2::ZERO, Vec2::new(-1.0, 0.0)).is_none());
        assert!(desc_for_point(&r, Vec2::ZERO, Vec2::new(1000.0, 0.0)).is_none());
    }

    #[test]
    fn relative_desc_clamps_and_reports_clipping() {
        let r = res();
        let mut td = TileDesc::new(0, 0, 0, 0);
        let absorbed = relative_desc(&r, &mut td, -1, -1);
        assert!(!absorbed);
        assert_eq!(td, TileDesc::new(0, 0, 0, 0));

        let mut td2 = TileDesc::new(0, 0, 2, 2);
        let absorbed2 = relative_desc(&r, &mut td2, 1, 1);
        assert!(absorbed2);
        assert_eq!(td2, TileDesc::new(0, 0, 3, 3));
    }

    #[test]
    fn distance_crosses_chunk_boundary() {
        let r = res();
        let a = TileDesc::new(0, 0, 7, 7);
        let b = TileDesc::new(0, 1, 0, 0);
        let mut dr = 0i64;
        let mut dc = 0i64;
        distance(&r, a, b, &mut dr, &mut dc);
        assert_eq!((dr, dc), (-7, 1));
    }

    #[test]
    fn contour_excludes_covered_tiles() {
        let r = res();
        let covered = vec![TileDesc::new(1, 1, 4, 4)];
        let ring = contour(&r, &covered);
        assert_eq!(ring.len(), 8);
        assert!(!ring.contains(&covered[0]));
    }
}

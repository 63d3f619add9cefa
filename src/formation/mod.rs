//! Formation cell placement and agent assignment.
//!
//! This module is new. The BFS-growth placement style is grounded on
//! `pathfinding/island_detection.rs`'s boundary flood fill and
//! `structures/flow_field.rs`'s BFS integration field (both breadth-first
//! over a local grid); the optimal agent-to-cell binding is
//! [`hungarian::assign`].

pub mod hungarian;

use crate::cost::CostLayers;
use crate::grid::{desc_for_point, TileDesc};
use crate::layer::NavLayer;
use crate::math::Vec2;
use std::collections::{HashSet, VecDeque};

/// Grid half-extent used to initialize the occupied/island subgrid.
pub const GRID_R: u32 = 95;

/// World-space spacing between adjacent formation cells.
pub const CELL_SPACING: f32 = 2.0;

/// World-space buffer distance inserted between a parent subformation's
/// back row and its child's front row.
pub const SUBFORMATION_BUFFER: f32 = 1.0;

/// `type ∈ {None, Rank, Column}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormationType {
    None,
    Rank,
    Column,
}

impl FormationType {
    fn ratio(self) -> f32 {
        match self {
            FormationType::Rank => 0.25,
            FormationType::Column => 4.0,
            FormationType::None => 1.0,
        }
    }
}

/// A cell's placement state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellState {
    NotPlaced,
    Occupied,
    NotOccupied,
    NotUsed,
}

/// One formation-grid slot: the idealized offset, its tile-snapped form,
/// the final collision-free position, and whichever agent (if any) is
/// bound to it.
#[derive(Clone, Debug)]
pub struct Cell {
    pub state: CellState,
    pub idealized: Vec2,
    pub snapped: Option<TileDesc>,
    pub final_pos: Vec2,
    pub assigned_uid: Option<u32>,
}

impl Cell {
    fn new(idealized: Vec2) -> Self {
        Self { state: CellState::NotPlaced, idealized, snapped: None, final_pos: idealized, assigned_uid: None }
    }
}

/// A group of same-typed agents placed as one `nrows × ncols` grid.
#[derive(Clone, Debug)]
pub struct Subformation {
    pub type_id: u32,
    pub nrows: u32,
    pub ncols: u32,
    pub cells: Vec<Cell>,
}

impl Subformation {
    fn index(&self, row: u32, col: u32) -> usize {
        (row * self.ncols + col) as usize
    }

    /// Iterates every `Occupied` or `NotOccupied` cell's world position
    /// alongside its index, i.e. every slot a caller may dispatch a
    /// cell-arrival field for.
    pub fn placed_cells(&self) -> impl Iterator<Item = (usize, &Cell)> {
        self.cells.iter().enumerate().filter(|(_, c)| matches!(c.state, CellState::Occupied | CellState::NotOccupied))
    }
}

/// A placed formation: target anchor, derived field center, and the
/// subformation tree (parent = lowest type id).
#[derive(Clone, Debug)]
pub struct Formation {
    pub target: Vec2,
    pub orientation: Vec2,
    pub field_center: Vec2,
    pub subformations: Vec<Subformation>,
    /// Number of agents currently bound to this formation; destroyed by the
    /// owner when it reaches zero.
    pub refcount: u32,
}

struct Basis {
    forward: Vec2,
    right: Vec2,
}

fn basis_for(orientation: Vec2) -> Basis {
    let forward = if orientation.length_squared() > f32::EPSILON { orientation.normalize() } else { Vec2::new(1.0, 0.0) };
    let right = Vec2::new(forward.y, -forward.x);
    Basis { forward, right }
}

/// Builds a formation for `ents` (each `(uid, current_pos, type_id)`).
/// Dispatching per-cell arrival fields is the caller's responsibility since
/// it needs the field cache/scheduler this module doesn't own — see
/// [`Subformation::placed_cells`].
pub fn create(
    layers: &CostLayers,
    layer: NavLayer,
    map_origin: Vec2,
    target: Vec2,
    orientation: Option<Vec2>,
    ents: &[(u32, Vec2, u32)],
    formation_type: FormationType,
) -> Formation {
    if ents.is_empty() {
        return Formation { target, orientation: orientation.unwrap_or(Vec2::new(1.0, 0.0)), field_center: target, subformations: Vec::new(), refcount: 0 };
    }

    let orientation = orientation.unwrap_or_else(|| {
        let centroid = ents.iter().fold(Vec2::ZERO, |acc, &(_, p, _)| acc + p) / ents.len() as f32;
        let dir = target - centroid;
        if dir.length_squared() > f32::EPSILON { dir.normalize() } else { Vec2::new(1.0, 0.0) }
    });
    let basis = basis_for(orientation);

    let tile_size = layers.resolution().tile_size;
    let grid_span = GRID_R as f32 * tile_size;
    let field_center = target - basis.forward * (grid_span / 3.0);

    let grid_center_td = desc_for_point(layers.resolution(), map_origin, field_center);
    let desired_island = grid_center_td.and_then(|td| layers.chunk(layer, td.chunk()).map(|c| c.local_island(td.tile_r, td.tile_c)));

    let mut groups: Vec<(u32, Vec<(u32, Vec2)>)> = Vec::new();
    for &(uid, pos, type_id) in ents {
        match groups.iter_mut().find(|(t, _)| *t == type_id) {
            Some((_, v)) => v.push((uid, pos)),
            None => groups.push((type_id, vec![(uid, pos)])),
        }
    }
    groups.sort_by_key(|(type_id, _)| *type_id);

    let mut subformations = Vec::new();
    let mut row_cursor = 0.0f32; // accumulated forward offset consumed by prior subformations
    for (type_id, members) in &groups {
        let n = members.len() as u32;
        let ratio = formation_type.ratio();
        let ncols = ((n as f32 / ratio).sqrt().ceil() as u32).max(1);
        let nrows = n.div_ceil(ncols).max(1);

        let mut sub = Subformation { type_id: *type_id, nrows, ncols, cells: Vec::with_capacity((nrows * ncols) as usize) };
        for row in 0..nrows {
            for col in 0..ncols {
                let forward_offset = row_cursor + row as f32 * CELL_SPACING;
                let lateral_offset = (col as f32 - (ncols as f32 - 1.0) / 2.0) * CELL_SPACING;
                let idealized = field_center + basis.forward * (-forward_offset) + basis.right * lateral_offset;
                sub.cells.push(Cell::new(idealized));
            }
        }
        row_cursor += nrows as f32 * CELL_SPACING + SUBFORMATION_BUFFER;

        place_cells_bfs(&mut sub, layers, layer, map_origin, desired_island);
        mark_unused(&mut sub, members.len() as u32);
        assign_agents(&mut sub, members);
        subformations.push(sub);
    }

    Formation { target, orientation, field_center, subformations, refcount: ents.len() as u32 }
}

fn place_cells_bfs(sub: &mut Subformation, layers: &CostLayers, layer: NavLayer, map_origin: Vec2, desired_island: Option<u16>) {
    let mut allocated: HashSet<TileDesc> = HashSet::new();
    let start = (0u32, sub.ncols / 2);
    let mut visited = vec![false; sub.cells.len()];
    let mut queue = VecDeque::new();
    queue.push_back(start);
    visited[sub.index(start.0, start.1)] = true;

    while let Some((row, col)) = queue.pop_front() {
        let idx = sub.index(row, col);
        let idealized = sub.cells[idx].idealized;
        if let Some(snapped) = snap_to_free_tile(layers, layer, map_origin, idealized, desired_island, &allocated) {
            allocated.insert(snapped);
            let world = crate::grid::bounds(layers.resolution(), map_origin, snapped).center();
            sub.cells[idx].state = CellState::Occupied;
            sub.cells[idx].snapped = Some(snapped);
            sub.cells[idx].final_pos = world;
        }

        for (dr, dc) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
            let nr = row as i64 + dr;
            let nc = col as i64 + dc;
            if nr < 0 || nc < 0 || nr as u32 >= sub.nrows || nc as u32 >= sub.ncols {
                continue;
            }
            let (nr, nc) = (nr as u32, nc as u32);
            let nidx = sub.index(nr, nc);
            if visited[nidx] {
                continue;
            }
            visited[nidx] = true;
            queue.push_back((nr, nc));
        }
    }
}

const SNAP_SEARCH_RADIUS: i64 = 6;

fn snap_to_free_tile(
    layers: &CostLayers,
    layer: NavLayer,
    map_origin: Vec2,
    idealized: Vec2,
    desired_island: Option<u16>,
    allocated: &HashSet<TileDesc>,
) -> Option<TileDesc> {
    let center = desc_for_point(layers.resolution(), map_origin, idealized)?;
    let mut best: Option<(i64, TileDesc)> = None;
    for dr in -SNAP_SEARCH_RADIUS..=SNAP_SEARCH_RADIUS {
        for dc in -SNAP_SEARCH_RADIUS..=SNAP_SEARCH_RADIUS {
            let mut td = center;
            if !crate::grid::relative_desc(layers.resolution(), &mut td, dc, dr) {
                continue;
            }
            if allocated.contains(&td) {
                continue;
            }
            let Some(chunk) = layers.chunk(layer, td.chunk()) else { continue };
            if !chunk.is_passable(td.tile_r, td.tile_c) {
                continue;
            }
            if let Some(island) = desired_island {
                if chunk.local_island(td.tile_r, td.tile_c) != island {
                    continue;
                }
            }
            let dist_sq = dr * dr + dc * dc;
            let better = match best {
                Some((d, _)) => dist_sq < d,
                None => true,
            };
            if better {
                best = Some((dist_sq, td));
            }
        }
    }
    best.map(|(_, td)| td)
}

fn mark_unused(sub: &mut Subformation, agent_count: u32) {
    let occupied_count = sub.cells.iter().filter(|c| c.state == CellState::Occupied).count() as u32;
    if occupied_count <= agent_count {
        return;
    }
    let mut excess = occupied_count - agent_count;
    let back_row = sub.nrows.saturating_sub(1);
    let mut cols: Vec<u32> = (0..sub.ncols).collect();
    cols.sort_by_key(|&c| {
        let center = (sub.ncols as i64 - 1) / 2;
        -((c as i64 - center).abs())
    });
    for col in cols {
        if excess == 0 {
            break;
        }
        let idx = sub.index(back_row, col);
        if sub.cells[idx].state == CellState::Occupied {
            sub.cells[idx].state = CellState::NotUsed;
            excess -= 1;
        }
    }
}

fn assign_agents(sub: &mut Subformation, members: &[(u32, Vec2)]) {
    let occupied_indices: Vec<usize> = sub.cells.iter().enumerate().filter(|(_, c)| c.state == CellState::Occupied).map(|(i, _)| i).collect();
    if occupied_indices.is_empty() {
        return;
    }
    let cost: Vec<Vec<i64>> = members
        .iter()
        .map(|&(_, pos)| {
            occupied_indices
                .iter()
                .map(|&idx| {
                    let d = pos.distance(sub.cells[idx].final_pos);
                    ((d * 100.0) as i64).pow(2)
                })
                .collect()
        })
        .collect();
    let assignment = hungarian::assign(&cost);
    let mut used = vec![false; occupied_indices.len()];
    for (member_idx, &(uid, _)) in members.iter().enumerate() {
        if let Some(Some(col)) = assignment.get(member_idx) {
            let cell_idx = occupied_indices[*col];
            sub.cells[cell_idx].assigned_uid = Some(uid);
            used[*col] = true;
        }
    }
    for (col, &was_used) in used.iter().enumerate() {
        if !was_used {
            sub.cells[occupied_indices[col]].state = CellState::NotOccupied;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapResolution;

    fn res() -> MapResolution {
        MapResolution { chunks_wide: 8, chunks_high: 8, tile_cols: 32, tile_rows: 32, tile_size: 1.0 }
    }

    #[test]
    fn single_unit_formation_is_a_one_by_one_grid() {
        let layers = {
            let mut l = CostLayers::new(res());
            l.recompute_global_islands(NavLayer::Foot);
            l
        };
        let ents = vec![(1u32, Vec2::new(50.0, 50.0), 0u32)];
        let formation = create(&layers, NavLayer::Foot, Vec2::ZERO, Vec2::new(60.0, 60.0), None, &ents, FormationType::Rank);
        assert_eq!(formation.subformations.len(), 1);
        let sub = &formation.subformations[0];
        assert_eq!((sub.nrows, sub.ncols), (1, 1));
    }

    #[test]
    fn rank_formation_of_25_has_expected_shape() {
        let layers = {
            let mut l = CostLayers::new(MapResolution { chunks_wide: 16, chunks_high: 16, tile_cols: 64, tile_rows: 64, tile_size: 1.0 });
            l.recompute_global_islands(NavLayer::Foot);
            l
        };
        let ents: Vec<(u32, Vec2, u32)> = (0..25).map(|i| (i as u32, Vec2::new(90.0 + i as f32, 90.0), 0u32)).collect();
        let formation = create(&layers, NavLayer::Foot, Vec2::ZERO, Vec2::new(300.0, 300.0), Some(Vec2::new(1.0, 0.0)), &ents, FormationType::Rank);
        let sub = &formation.subformations[0];
        assert_eq!(sub.ncols, 10);
        assert_eq!(sub.nrows, 3);
    }

    #[test]
    fn no_two_cells_share_an_allocated_tile() {
        let layers = {
            let mut l = CostLayers::new(res());
            l.recompute_global_islands(NavLayer::Foot);
            l
        };
        let ents: Vec<(u32, Vec2, u32)> = (0..9).map(|i| (i as u32, Vec2::new(100.0, 100.0), 0u32)).collect();
        let formation = create(&layers, NavLayer::Foot, Vec2::ZERO, Vec2::new(120.0, 120.0), Some(Vec2::new(1.0, 0.0)), &ents, FormationType::Rank);
        let mut seen = HashSet::new();
        for sub in &formation.subformations {
            for cell in &sub.cells {
                if let Some(td) = cell.snapped {
                    assert!(seen.insert(td), "tile allocated twice: {td:?}");
                }
            }
        }
    }

    #[test]
    fn excess_cells_after_placement_are_marked_not_used() {
        let layers = {
            let mut l = CostLayers::new(res());
            l.recompute_global_islands(NavLayer::Foot);
            l
        };
        // ncols=ceil(sqrt(3/0.25))=4, nrows=ceil(3/4)=1 -> 4 cells for 3 agents.
        let ents: Vec<(u32, Vec2, u32)> = (0..3).map(|i| (i as u32, Vec2::new(100.0, 100.0), 0u32)).collect();
        let formation = create(&layers, NavLayer::Foot, Vec2::ZERO, Vec2::new(120.0, 120.0), Some(Vec2::new(1.0, 0.0)), &ents, FormationType::Rank);
        let sub = &formation.subformations[0];
        let not_used = sub.cells.iter().filter(|c| c.state == CellState::NotUsed).count();
        assert_eq!(not_used, 1);
    }
}

//! Field construction algorithms: Dijkstra integration fields,
//! gradient flow fields, Bresenham-propagated LOS fields, enemy/entity-seek
//! fields built over a padded region, and rectangular cell-arrival fields.
//!
//! Ported from `structures::flow_field::{generate_integration_field,
//! generate_vector_field}` (single dense grid, 4-connected integration,
//! 8-neighbour gradient) generalized to the chunk-relative, multi-layer
//! addressing this crate's [`crate::cost::CostLayers`] uses, plus the
//! LOS/enemy-seek/cell-arrival variants a dense flow field doesn't need.
//! Nearest-walkable recovery is ported from
//! `pathfinding::astar::find_nearest_walkable`.

use super::{Direction, FlowField, IntegrationField, LosField};
use crate::cost::CostLayers;
use crate::grid::{self, MapResolution, TileDesc};
use crate::layer::NavLayer;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

/// A passability/cost oracle over a rectangular region in local `(x, y)`
/// coordinates, `None` meaning off-map or otherwise unqueryable.
pub trait RegionSource {
    fn cost(&self, x: u32, y: u32) -> Option<u8>;
}

/// A [`RegionSource`] reading straight out of one chunk (no padding).
pub struct ChunkRegion<'a> {
    layers: &'a CostLayers,
    layer: NavLayer,
    chunk: (u32, u32),
    enemy_mask: u32,
}

impl<'a> ChunkRegion<'a> {
    pub fn new(layers: &'a CostLayers, layer: NavLayer, chunk: (u32, u32), enemy_mask: u32) -> Self {
        Self { layers, layer, chunk, enemy_mask }
    }
}

impl RegionSource for ChunkRegion<'_> {
    fn cost(&self, x: u32, y: u32) -> Option<u8> {
        let chunk = self.layers.chunk(self.layer, self.chunk)?;
        if chunk.is_passable(y, x) {
            Some(chunk.cost_base(y, x))
        } else if self.enemy_mask != 0 && chunk.is_enemy_only(y, x, self.enemy_mask) {
            Some(chunk.cost_base(y, x))
        } else {
            None
        }
    }
}

/// A [`RegionSource`] over an arbitrary rectangular window of map-absolute
/// tile space, straddling chunk boundaries freely. Used for the formation
/// cell-arrival field (spec §4.4: "a rectangular region... centered on the
/// formation's center... can straddle chunks").
pub struct SpanRegion<'a> {
    layers: &'a CostLayers,
    layer: NavLayer,
    resolution: &'a MapResolution,
    /// Map-absolute (row, col) of this region's local `(0, 0)`.
    origin_row: i64,
    origin_col: i64,
    enemy_mask: u32,
}

impl<'a> SpanRegion<'a> {
    pub fn new(layers: &'a CostLayers, layer: NavLayer, resolution: &'a MapResolution, origin_row: i64, origin_col: i64, enemy_mask: u32) -> Self {
        Self { layers, layer, resolution, origin_row, origin_col, enemy_mask }
    }

    /// The tile descriptor local `(x, y)` addresses, if it lies on the map.
    pub fn tile_at(&self, x: u32, y: u32) -> Option<TileDesc> {
        grid::tile_desc_from_absolute(self.resolution, self.origin_row + y as i64, self.origin_col + x as i64)
    }
}

impl RegionSource for SpanRegion<'_> {
    fn cost(&self, x: u32, y: u32) -> Option<u8> {
        let td = self.tile_at(x, y)?;
        let chunk = self.layers.chunk(self.layer, td.chunk())?;
        if chunk.is_passable(td.tile_r, td.tile_c) {
            Some(chunk.cost_base(td.tile_r, td.tile_c))
        } else if self.enemy_mask != 0 && chunk.is_enemy_only(td.tile_r, td.tile_c, self.enemy_mask) {
            Some(chunk.cost_base(td.tile_r, td.tile_c))
        } else {
            None
        }
    }
}

#[derive(PartialEq)]
struct HeapEntry {
    cost: f32,
    x: u32,
    y: u32,
}
impl Eq for HeapEntry {}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.partial_cmp(&self.cost).unwrap_or(Ordering::Equal)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Builds a Dijkstra integration field over `width × height`, seeded at
/// `targets` (each at cost `0`), relaxing through 4-connected neighbours
/// only.
pub fn build_integration_field(
    width: u32,
    height: u32,
    region: &dyn RegionSource,
    targets: &[(u32, u32)],
) -> IntegrationField {
    let mut field = IntegrationField::new(width, height);
    let mut heap = BinaryHeap::new();
    for &(tx, ty) in targets {
        if tx < width && ty < height {
            field.set_cost(tx, ty, 0.0);
            heap.push(HeapEntry { cost: 0.0, x: tx, y: ty });
        }
    }

    while let Some(HeapEntry { cost, x, y }) = heap.pop() {
        if cost > field.cost(x, y) {
            continue; // stale entry; a cheaper path already relaxed this cell
        }
        for (dc, dr) in crate::grid::NEIGHBOUR_OFFSETS_4 {
            let nx = x as i64 + dc;
            let ny = y as i64 + dr;
            if !field.in_bounds(nx, ny) {
                continue;
            }
            let (nx, ny) = (nx as u32, ny as u32);
            let Some(step_cost) = region.cost(nx, ny) else { continue };
            let new_cost = cost + step_cost as f32;
            if new_cost < field.cost(nx, ny) {
                field.set_cost(nx, ny, new_cost);
                heap.push(HeapEntry { cost: new_cost, x: nx, y: ny });
            }
        }
    }
    field
}

const DIAGONALS: [(Direction, Direction, Direction); 4] = [
    (Direction::NW, Direction::N, Direction::W),
    (Direction::NE, Direction::N, Direction::E),
    (Direction::SW, Direction::S, Direction::W),
    (Direction::SE, Direction::S, Direction::E),
];

/// Builds the gradient flow field from a completed integration field:
/// each cell points at the 8-neighbour with the lowest integration
/// cost, cardinals preferred over diagonals on a tie via the fixed
/// `N, S, E, W, NW, NE, SW, SE` order, and a diagonal step is only
/// considered when both of its cardinal "sides" are finite-cost (no
/// cutting through an impassable corner).
pub fn build_flow_field(integration: &IntegrationField, region: &dyn RegionSource) -> FlowField {
    let mut flow = FlowField::new(integration.width, integration.height);
    for y in 0..integration.height {
        for x in 0..integration.width {
            if region.cost(x, y).is_none() || integration.cost(x, y).is_infinite() {
                flow.set(x, y, Direction::None);
                continue;
            }
            if integration.cost(x, y) == 0.0 {
                flow.set(x, y, Direction::None); // the target itself
                continue;
            }
            let own_cost = integration.cost(x, y);
            let mut best_cost = own_cost;
            let mut best_dir = Direction::None;
            for (offset_idx, &(dc, dr)) in crate::grid::NEIGHBOUR_OFFSETS_8.iter().enumerate() {
                let dir = Direction::from_offset_index(offset_idx);
                if let Some((side_a, side_b)) = diagonal_sides(dir) {
                    if !finite_step(integration, region, x, y, side_a) || !finite_step(integration, region, x, y, side_b) {
                        continue;
                    }
                }
                let nx = x as i64 + dc;
                let ny = y as i64 + dr;
                if !integration.in_bounds(nx, ny) {
                    continue;
                }
                let (nx, ny) = (nx as u32, ny as u32);
                let n_cost = integration.cost(nx, ny);
                if n_cost < best_cost {
                    best_cost = n_cost;
                    best_dir = dir;
                }
            }
            flow.set(x, y, best_dir);
        }
    }
    flow
}

fn diagonal_sides(dir: Direction) -> Option<(Direction, Direction)> {
    DIAGONALS.iter().find(|&&(d, _, _)| d == dir).map(|&(_, a, b)| (a, b))
}

fn finite_step(integration: &IntegrationField, region: &dyn RegionSource, x: u32, y: u32, dir: Direction) -> bool {
    let (dc, dr) = dir.step();
    let nx = x as i64 + dc;
    let ny = y as i64 + dr;
    if !integration.in_bounds(nx, ny) {
        return false;
    }
    let (nx, ny) = (nx as u32, ny as u32);
    region.cost(nx, ny).is_some() && integration.cost(nx, ny).is_finite()
}

/// Builds a LOS field for a chunk with target at `(target_x, target_y)`
///: visibility propagates 4-connected through cost-1 cells;
/// where a neighbour's cost exceeds 1, test whether this is an "LOS
/// corner" (the pair of cells straddling the step differ in passability)
/// and if so draw a Bresenham line from the corner to the target, marking
/// every traversed cell `wavefront_blocked`. Finally any visible cell
/// adjacent to a blocked one is marked not-visible, padding the wavefront
/// by one tile.
pub fn build_los_field(width: u32, height: u32, region: &dyn RegionSource, target_x: u32, target_y: u32) -> LosField {
    let mut los = LosField::new(width, height);
    if region.cost(target_x, target_y).is_none() {
        return los;
    }
    los.set_visible(target_x, target_y, true);

    let mut queue = VecDeque::new();
    queue.push_back((target_x, target_y));
    let mut visited = vec![false; (width * height) as usize];
    visited[(target_y * width + target_x) as usize] = true;

    while let Some((cx, cy)) = queue.pop_front() {
        for (dc, dr) in crate::grid::NEIGHBOUR_OFFSETS_4 {
            let nx = cx as i64 + dc;
            let ny = cy as i64 + dr;
            if nx < 0 || ny < 0 || nx as u32 >= width || ny as u32 >= height {
                continue;
            }
            let (nx, ny) = (nx as u32, ny as u32);
            let idx = (ny * width + nx) as usize;
            if visited[idx] {
                continue;
            }
            let Some(cost) = region.cost(nx, ny) else { continue };
            if cost <= 1 {
                visited[idx] = true;
                los.set_visible(nx, ny, true);
                queue.push_back((nx, ny));
            } else if is_los_corner(region, width, height, cx, cy, nx, ny) {
                visited[idx] = true;
                draw_blocked_line(&mut los, width, height, nx, ny, target_x, target_y);
            }
        }
    }

    pad_wavefront(&mut los, width, height);
    los
}

fn is_los_corner(region: &dyn RegionSource, width: u32, height: u32, cx: u32, cy: u32, nx: u32, ny: u32) -> bool {
    // A corner iff the two cells straddling the step, on either side of the
    // crossed edge, disagree on passability.
    let perpendicular = if cx == nx { (1i64, 0i64) } else { (0i64, 1i64) };
    let (px, py) = perpendicular;
    let side_a = in_bounds_cost(region, width, height, cx as i64 + px, cy as i64 + py);
    let side_b = in_bounds_cost(region, width, height, nx as i64 + px, ny as i64 + py);
    side_a.is_some() != side_b.is_some()
}

fn in_bounds_cost(region: &dyn RegionSource, width: u32, height: u32, x: i64, y: i64) -> Option<u8> {
    if x < 0 || y < 0 || x as u32 >= width || y as u32 >= height {
        return None;
    }
    region.cost(x as u32, y as u32)
}

fn draw_blocked_line(los: &mut LosField, width: u32, height: u32, from_x: u32, from_y: u32, to_x: u32, to_y: u32) {
    let mut x0 = from_x as i64;
    let mut y0 = from_y as i64;
    let x1 = to_x as i64;
    let y1 = to_y as i64;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if x0 >= 0 && y0 >= 0 && (x0 as u32) < width && (y0 as u32) < height {
            los.set_wavefront_blocked(x0 as u32, y0 as u32, true);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn pad_wavefront(los: &mut LosField, width: u32, height: u32) {
    let blocked: Vec<(u32, u32)> = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .filter(|&(x, y)| los.wavefront_blocked(x, y))
        .collect();
    for (bx, by) in blocked {
        for (dc, dr) in crate::grid::NEIGHBOUR_OFFSETS_4 {
            let nx = bx as i64 + dc;
            let ny = by as i64 + dr;
            if nx < 0 || ny < 0 || nx as u32 >= width || ny as u32 >= height {
                continue;
            }
            los.set_visible(nx as u32, ny as u32, false);
        }
    }
}

/// Builds an enemy/entity-seek field over a region twice the chunk size
/// (half-chunk padding on every side), then extracts the center `Tw × Th`
/// subregion as the returned flow field. `targets_in_padded` seeds every
/// enemy/entity tile found in the padded window at cost 0 (an enemy-seek
/// field flows toward whichever target is nearest, not one fixed point).
pub fn build_padded_seek_field(
    tile_cols: u32,
    tile_rows: u32,
    padded_region: &dyn RegionSource,
    targets_in_padded: &[(u32, u32)],
) -> (IntegrationField, FlowField) {
    let padded_w = tile_cols * 2;
    let padded_h = tile_rows * 2;
    let integration = build_integration_field(padded_w, padded_h, padded_region, targets_in_padded);
    let full_flow = build_flow_field(&integration, padded_region);

    let half_w = tile_cols / 2;
    let half_h = tile_rows / 2;
    let mut center_integration = IntegrationField::new(tile_cols, tile_rows);
    let mut center_flow = FlowField::new(tile_cols, tile_rows);
    for y in 0..tile_rows {
        for x in 0..tile_cols {
            center_integration.set_cost(x, y, integration.cost(x + half_w, y + half_h));
            center_flow.set(x, y, full_flow.get(x + half_w, y + half_h));
        }
    }
    (center_integration, center_flow)
}

/// Side length of the square region a cell-arrival field is built over,
/// centered on the formation's field center (spec §4.4: "typical 96×96").
pub const CELL_ARRIVAL_REGION: u32 = 96;

/// Builds a cell-arrival field: a `CELL_ARRIVAL_REGION²` integration/flow
/// field pair over a window centered on `center_td`, seeking `target_td`.
/// Both tiles are expressed in map-absolute space so the window may
/// straddle chunk boundaries; returns `None` if `target_td` doesn't fall
/// inside the window (a formation whose cell ended up further than half the
/// region's span from its own center, which placement shouldn't produce).
pub fn build_cell_arrival_field(
    layers: &CostLayers,
    layer: NavLayer,
    resolution: &MapResolution,
    center_td: TileDesc,
    target_td: TileDesc,
) -> Option<(SpanRegion<'_>, IntegrationField, FlowField)> {
    let (center_row, center_col) = grid::absolute_of(resolution, center_td);
    let half = (CELL_ARRIVAL_REGION / 2) as i64;
    let origin_row = center_row - half;
    let origin_col = center_col - half;

    let (target_row, target_col) = grid::absolute_of(resolution, target_td);
    let local_x = target_col - origin_col;
    let local_y = target_row - origin_row;
    if local_x < 0 || local_y < 0 || local_x as u32 >= CELL_ARRIVAL_REGION || local_y as u32 >= CELL_ARRIVAL_REGION {
        return None;
    }

    let region = SpanRegion::new(layers, layer, resolution, origin_row, origin_col, 0);
    let integration = build_integration_field(CELL_ARRIVAL_REGION, CELL_ARRIVAL_REGION, &region, &[(local_x as u32, local_y as u32)]);
    let flow = build_flow_field(&integration, &region);
    Some((region, integration, flow))
}

/// Soft-navigation-failure recovery (spec §4.4/§7): builds a flow field that
/// leads an agent standing on an impassable tile back onto passable
/// terrain. The initial frontier is the set of passable tiles bounding the
/// impassable island containing `stuck_td`, found by bounded BFS outward
/// from it (impassable tiles are walked, their passable neighbours seeded
/// at cost 0) rather than the usual single-tile target.
pub fn build_impassable_recovery_field(
    layers: &CostLayers,
    layer: NavLayer,
    resolution: &MapResolution,
    stuck_td: TileDesc,
    max_radius: u32,
) -> Option<(SpanRegion<'_>, IntegrationField, FlowField)> {
    let (stuck_row, stuck_col) = grid::absolute_of(resolution, stuck_td);
    let half = max_radius as i64;
    let origin_row = stuck_row - half;
    let origin_col = stuck_col - half;
    let size = (max_radius * 2 + 1).max(1);
    let region = SpanRegion::new(layers, layer, resolution, origin_row, origin_col, 0);

    let local_stuck = ((stuck_col - origin_col) as u32, (stuck_row - origin_row) as u32);
    let mut visited = vec![false; (size * size) as usize];
    let mut frontier = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(local_stuck);
    visited[(local_stuck.1 * size + local_stuck.0) as usize] = true;

    while let Some((x, y)) = queue.pop_front() {
        for (dc, dr) in grid::NEIGHBOUR_OFFSETS_4 {
            let nx = x as i64 + dc;
            let ny = y as i64 + dr;
            if nx < 0 || ny < 0 || nx as u32 >= size || ny as u32 >= size {
                continue;
            }
            let (nx, ny) = (nx as u32, ny as u32);
            let idx = (ny * size + nx) as usize;
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            if region.cost(nx, ny).is_some() {
                frontier.push((nx, ny));
            } else {
                queue.push_back((nx, ny));
            }
        }
    }

    if frontier.is_empty() {
        return None;
    }
    let integration = build_integration_field(size, size, &region, &frontier);
    let flow = build_flow_field(&integration, &region);
    Some((region, integration, flow))
}

/// Direction off `(x, y)` toward the lowest-cost in-bounds neighbour in
/// `integration`, regardless of whether `(x, y)` itself has a region cost.
/// [`build_flow_field`] always reports [`Direction::None`] for a cell the
/// region marks impassable, which is exactly the cell a stuck agent is
/// standing on — this samples the recovery field directly instead.
pub fn escape_direction(integration: &IntegrationField, x: u32, y: u32) -> Direction {
    let mut best_cost = f32::INFINITY;
    let mut best_dir = Direction::None;
    for (offset_idx, &(dc, dr)) in crate::grid::NEIGHBOUR_OFFSETS_8.iter().enumerate() {
        let nx = x as i64 + dc;
        let ny = y as i64 + dr;
        if !integration.in_bounds(nx, ny) {
            continue;
        }
        let (nx, ny) = (nx as u32, ny as u32);
        let n_cost = integration.cost(nx, ny);
        if n_cost < best_cost {
            best_cost = n_cost;
            best_dir = Direction::from_offset_index(offset_idx);
        }
    }
    best_dir
}

/// Finds the nearest passable cell to `(start_x, start_y)` by 8-connected
/// BFS, bounded to `max_radius` rings.
pub fn find_nearest_walkable(
    region: &dyn RegionSource,
    width: u32,
    height: u32,
    start_x: u32,
    start_y: u32,
    max_radius: u32,
) -> Option<(u32, u32)> {
    let mut visited = vec![false; (width * height) as usize];
    let mut queue = VecDeque::new();
    queue.push_back((start_x, start_y, 0u32));
    visited[(start_y * width + start_x) as usize] = true;

    while let Some((x, y, dist)) = queue.pop_front() {
        if dist > max_radius {
            break;
        }
        if region.cost(x, y).is_some() {
            return Some((x, y));
        }
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                if nx < 0 || ny < 0 || nx as u32 >= width || ny as u32 >= height {
                    continue;
                }
                let idx = (ny as u32 * width + nx as u32) as usize;
                if visited[idx] {
                    continue;
                }
                visited[idx] = true;
                queue.push_back((nx as u32, ny as u32, dist + 1));
            }
        }
    }
    None
}

impl Direction {
    fn from_offset_index(idx: usize) -> Self {
        match idx {
            0 => Direction::N,
            1 => Direction::S,
            2 => Direction::E,
            3 => Direction::W,
            4 => Direction::NW,
            5 => Direction::NE,
            6 => Direction::SW,
            _ => Direction::SE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapResolution;

    struct OpenRegion {
        width: u32,
        height: u32,
        blocked: Vec<(u32, u32)>,
    }
    impl RegionSource for OpenRegion {
        fn cost(&self, x: u32, y: u32) -> Option<u8> {
            if x >= self.width || y >= self.height || self.blocked.contains(&(x, y)) {
                None
            } else {
                Some(1)
            }
        }
    }

    #[test]
    fn integration_field_reaches_zero_at_target() {
        let region = OpenRegion { width: 8, height: 8, blocked: vec![] };
        let field = build_integration_field(8, 8, &region, &[(4, 4)]);
        assert_eq!(field.cost(4, 4), 0.0);
        assert!(field.cost(0, 0) > field.cost(1, 1));
    }

    #[test]
    fn flow_field_points_toward_lower_cost() {
        let region = OpenRegion { width: 8, height: 8, blocked: vec![] };
        let integration = build_integration_field(8, 8, &region, &[(4, 4)]);
        let flow = build_flow_field(&integration, &region);
        assert_eq!(flow.get(4, 4), Direction::None);
        let dir = flow.get(0, 4);
        assert!(matches!(dir, Direction::E | Direction::NE | Direction::SE));
    }

    #[test]
    fn flow_field_never_cuts_an_impassable_corner() {
        let region = OpenRegion { width: 3, height: 3, blocked: vec![(1, 0), (0, 1)] };
        let integration = build_integration_field(3, 3, &region, &[(2, 2)]);
        let flow = build_flow_field(&integration, &region);
        // (0,0) could reach (1,1) diagonally, but both cardinal sides are
        // blocked, so flow must not point NE/SE through the corner.
        assert_ne!(flow.get(0, 0), Direction::SE);
    }

    #[test]
    fn nearest_walkable_finds_closest_open_cell() {
        let region = OpenRegion { width: 5, height: 5, blocked: vec![(2, 2)] };
        let found = find_nearest_walkable(&region, 5, 5, 2, 2, 10).unwrap();
        assert_ne!(found, (2, 2));
    }

    #[test]
    fn los_field_marks_target_visible() {
        let region = OpenRegion { width: 6, height: 6, blocked: vec![] };
        let los = build_los_field(6, 6, &region, 3, 3);
        assert!(los.visible(3, 3));
    }

    #[test]
    fn chunk_region_honours_enemy_mask() {
        let res = MapResolution { chunks_wide: 1, chunks_high: 1, tile_cols: 4, tile_rows: 4, tile_size: 1.0 };
        let mut layers = CostLayers::new(res);
        layers.block_disk(NavLayer::Foot, crate::grid::TileDesc::new(0, 0, 1, 1), 0.0, 3);
        let region = ChunkRegion::new(&layers, NavLayer::Foot, (0, 0), 1 << 3);
        assert!(region.cost(1, 1).is_some());
        let region_no_enemy = ChunkRegion::new(&layers, NavLayer::Foot, (0, 0), 0);
        assert!(region_no_enemy.cost(1, 1).is_none());
    }

    fn big_res() -> MapResolution {
        MapResolution { chunks_wide: 4, chunks_high: 4, tile_cols: 32, tile_rows: 32, tile_size: 1.0 }
    }

    #[test]
    fn cell_arrival_field_straddles_chunk_boundaries() {
        let res = big_res();
        let mut layers = CostLayers::new(res);
        layers.recompute_global_islands(NavLayer::Foot);
        // center sits near a chunk seam; target a tile in the next chunk over.
        let center = TileDesc::new(0, 0, 31, 31);
        let target = TileDesc::new(0, 1, 2, 2);
        let (_region, integration, flow) = build_cell_arrival_field(&layers, NavLayer::Foot, &res, center, target).unwrap();

        let (center_row, center_col) = grid::absolute_of(&res, center);
        let (target_row, target_col) = grid::absolute_of(&res, target);
        let half = (CELL_ARRIVAL_REGION / 2) as i64;
        let tx = (target_col - center_col + half) as u32;
        let ty = (target_row - center_row + half) as u32;

        assert_eq!(integration.cost(tx, ty), 0.0);
        assert_eq!(flow.get(tx, ty), Direction::None);
    }

    #[test]
    fn impassable_recovery_field_leads_off_a_blocked_tile() {
        let res = MapResolution { chunks_wide: 1, chunks_high: 1, tile_cols: 8, tile_rows: 8, tile_size: 1.0 };
        let mut layers = CostLayers::new(res);
        let stuck = TileDesc::new(0, 0, 4, 4);
        layers.set_cost(NavLayer::Foot, stuck, crate::cost::IMPASSABLE);
        layers.recompute_global_islands(NavLayer::Foot);

        let (_, integration, _flow) = build_impassable_recovery_field(&layers, NavLayer::Foot, &res, stuck, 4).unwrap();
        let local = (4u32, 4u32); // max_radius=4 centers the stuck tile at (4,4)
        assert!(integration.cost(local.0, local.1).is_infinite(), "the stuck tile itself has no cost entry");
        let dir = escape_direction(&integration, local.0, local.1);
        assert_ne!(dir, Direction::None, "recovery field should still point toward a passable neighbour");
    }
}

//! Portal graph construction.
//!
//! Portals are created by scanning each shared chunk edge for maximal
//! passable runs and emitting one portal per run, linked bidirectionally —
//! ported directly from `pathfinding::cluster::create_portal_vertical`/
//! `create_portal_horizontal` scan, generalized from a fixed
//! `CLUSTER_SIZE` to this crate's chunked [`MapResolution`].

mod router;

pub use router::{route, ConnectedComponents, RoutedPortal};

use crate::cost::{CostLayers, NavChunk};
use crate::grid::{MapResolution, TileDesc};
use crate::layer::NavLayer;
use crate::math::Vec2;
use fixedbitset::FixedBitSet;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Upper bound on distinct local island ids a single chunk can carry;
/// reachability bits are indexed against this.
pub const MAX_LOCAL_ISLANDS: usize = 32;

/// A passable gateway between two adjacent chunks.
#[derive(Clone, Debug)]
pub struct Portal {
    /// Index into [`PortalGraph::nodes`]; also this portal's id.
    pub id: usize,
    /// The chunk this portal record's endpoint lies in.
    pub chunk: (u32, u32),
    /// The run of boundary tiles this portal covers (inclusive).
    pub range_min: TileDesc,
    /// The run of boundary tiles this portal covers (inclusive).
    pub range_max: TileDesc,
    /// The representative (midpoint) tile used for routing-cost math.
    pub node: TileDesc,
    /// Cached world-space position of [`Portal::node`].
    pub world_pos: Vec2,
    /// Id of the mirrored portal record in the neighbour chunk, resolved by
    /// `(chunk_coord, portal_index)` rather than an owning pointer — an
    /// arena+index pattern.
    pub peer: usize,
    /// Per-`(local_island_here, local_island_on_peer_side)` reachability bit,
    /// packed `from * MAX_LOCAL_ISLANDS + to`.
    pub reachability: FixedBitSet,
}

impl Portal {
    /// Whether crossing this portal from `from_local_island` into the
    /// neighbour chunk's `to_local_island` is currently usable.
    pub fn is_usable(&self, from_local_island: u16, to_local_island: u16) -> bool {
        let from = (from_local_island as usize).min(MAX_LOCAL_ISLANDS - 1);
        let to = (to_local_island as usize).min(MAX_LOCAL_ISLANDS - 1);
        self.reachability.contains(from * MAX_LOCAL_ISLANDS + to)
    }

    fn mark_usable(&mut self, from_local_island: u16, to_local_island: u16) {
        let from = (from_local_island as usize).min(MAX_LOCAL_ISLANDS - 1);
        let to = (to_local_island as usize).min(MAX_LOCAL_ISLANDS - 1);
        self.reachability.insert(from * MAX_LOCAL_ISLANDS + to);
    }
}

/// The chunk-adjacent portal graph for one [`NavLayer`].
#[derive(Default)]
pub struct PortalGraph {
    /// All portal records, indexed by id.
    pub nodes: Vec<Portal>,
    /// Adjacency: portal id -> `(target portal id, world-space cost)`.
    pub edges: FxHashMap<usize, SmallVec<[(usize, f32); 4]>>,
}

impl PortalGraph {
    /// Scans every shared chunk edge in `layer` for maximal passable runs
    /// and builds portals + intra-chunk reachability bits. Synchronous;
    /// prefer [`IncrementalGraphBuild`] for large maps.
    pub fn build(layers: &mut CostLayers, layer: NavLayer, map_origin: Vec2) -> Self {
        let mut graph = PortalGraph::default();
        let res = *layers.resolution();

        for cc in 0..res.chunks_wide.saturating_sub(1) {
            for cr in 0..res.chunks_high {
                scan_vertical_edge(&mut graph, layers, layer, &res, map_origin, cr, cc);
            }
        }
        for cr in 0..res.chunks_high.saturating_sub(1) {
            for cc in 0..res.chunks_wide {
                scan_horizontal_edge(&mut graph, layers, layer, &res, map_origin, cr, cc);
            }
        }

        graph.compute_reachability(layers, layer);
        graph
    }

    /// Fills in each portal's `(from_local_island, to_local_island)`
    /// reachability bits by checking, for every pair of portals sharing a
    /// chunk, whether their node tiles share a local island, and
    /// records each portal's id against its owning chunk's `portal_ids`.
    fn compute_reachability(&mut self, layers: &mut CostLayers, layer: NavLayer) {
        // A portal is usable from local island `a` to the neighbour's local
        // island `b` iff `a` is the near-side local island of this portal's
        // node, and `b` is the far-side (peer's) local island — since the
        // scan only ever emits one portal per maximal passable run, that
        // pairing is exactly (this portal's near island, peer portal's near
        // island).
        for p_id in 0..self.nodes.len() {
            let (chunk, node, peer_id) = {
                let p = &self.nodes[p_id];
                (p.chunk, p.node, p.peer)
            };
            let (peer_chunk, peer_node) = {
                let peer = &self.nodes[peer_id];
                (peer.chunk, peer.node)
            };
            let from_iid = layers
                .chunk(layer, chunk)
                .map(|c| c.local_island(node.tile_r, node.tile_c))
                .unwrap_or(u16::MAX);
            let to_iid = layers
                .chunk(layer, peer_chunk)
                .map(|c| c.local_island(peer_node.tile_r, peer_node.tile_c))
                .unwrap_or(u16::MAX);
            if from_iid != u16::MAX && to_iid != u16::MAX {
                self.nodes[p_id].mark_usable(from_iid, to_iid);
            }
            if let Some(c) = layers.chunk_mut(layer, chunk) {
                if !c.portal_ids.contains(&p_id) {
                    c.portal_ids.push(p_id);
                }
            }
        }
    }
}

fn mid_tile(a: TileDesc, b: TileDesc) -> TileDesc {
    TileDesc::new(a.chunk_r, a.chunk_c, (a.tile_r + b.tile_r) / 2, (a.tile_c + b.tile_c) / 2)
}

fn world_center(res: &MapResolution, map_origin: Vec2, td: TileDesc) -> Vec2 {
    crate::grid::bounds(res, map_origin, td).center()
}

fn push_portal_pair(
    graph: &mut PortalGraph,
    res: &MapResolution,
    map_origin: Vec2,
    chunk_a: (u32, u32),
    range_min_a: TileDesc,
    range_max_a: TileDesc,
    chunk_b: (u32, u32),
    range_min_b: TileDesc,
    range_max_b: TileDesc,
) {
    let id_a = graph.nodes.len();
    let id_b = id_a + 1;
    let node_a = mid_tile(range_min_a, range_max_a);
    let node_b = mid_tile(range_min_b, range_max_b);
    let world_a = world_center(res, map_origin, node_a);
    let world_b = world_center(res, map_origin, node_b);
    let cost = world_a.distance(world_b).max(0.01);

    graph.nodes.push(Portal {
        id: id_a,
        chunk: chunk_a,
        range_min: range_min_a,
        range_max: range_max_a,
        node: node_a,
        world_pos: world_a,
        peer: id_b,
        reachability: FixedBitSet::with_capacity(MAX_LOCAL_ISLANDS * MAX_LOCAL_ISLANDS),
    });
    graph.nodes.push(Portal {
        id: id_b,
        chunk: chunk_b,
        range_min: range_min_b,
        range_max: range_max_b,
        node: node_b,
        world_pos: world_b,
        peer: id_a,
        reachability: FixedBitSet::with_capacity(MAX_LOCAL_ISLANDS * MAX_LOCAL_ISLANDS),
    });
    graph.edges.entry(id_a).or_default().push((id_b, cost));
    graph.edges.entry(id_b).or_default().push((id_a, cost));
}

fn both_passable(layers: &CostLayers, layer: NavLayer, a: TileDesc, b: TileDesc) -> bool {
    let pa = layers.chunk(layer, a.chunk()).map(|c| c.is_passable(a.tile_r, a.tile_c)).unwrap_or(false);
    let pb = layers.chunk(layer, b.chunk()).map(|c| c.is_passable(b.tile_r, b.tile_c)).unwrap_or(false);
    pa && pb
}

fn scan_vertical_edge(
    graph: &mut PortalGraph,
    layers: &mut CostLayers,
    layer: NavLayer,
    res: &MapResolution,
    map_origin: Vec2,
    chunk_r: u32,
    chunk_c: u32,
) {
    let left = (chunk_r, chunk_c);
    let right = (chunk_r, chunk_c + 1);
    let mut run_start: Option<u32> = None;
    for tr in 0..res.tile_rows {
        let a = TileDesc::new(left.0, left.1, tr, res.tile_cols - 1);
        let b = TileDesc::new(right.0, right.1, tr, 0);
        let walkable = both_passable(layers, layer, a, b);
        if walkable {
            run_start.get_or_insert(tr);
        } else if let Some(start) = run_start.take() {
            emit_vertical_run(graph, res, map_origin, left, right, start, tr - 1);
        }
    }
    if let Some(start) = run_start {
        emit_vertical_run(graph, res, map_origin, left, right, start, res.tile_rows - 1);
    }
}

fn emit_vertical_run(
    graph: &mut PortalGraph,
    res: &MapResolution,
    map_origin: Vec2,
    left: (u32, u32),
    right: (u32, u32),
    start_row: u32,
    end_row: u32,
) {
    let a_min = TileDesc::new(left.0, left.1, start_row, res.tile_cols - 1);
    let a_max = TileDesc::new(left.0, left.1, end_row, res.tile_cols - 1);
    let b_min = TileDesc::new(right.0, right.1, start_row, 0);
    let b_max = TileDesc::new(right.0, right.1, end_row, 0);
    push_portal_pair(graph, res, map_origin, left, a_min, a_max, right, b_min, b_max);
}

fn scan_horizontal_edge(
    graph: &mut PortalGraph,
    layers: &mut CostLayers,
    layer: NavLayer,
    res: &MapResolution,
    map_origin: Vec2,
    chunk_r: u32,
    chunk_c: u32,
) {
    let top = (chunk_r, chunk_c);
    let bottom = (chunk_r + 1, chunk_c);
    let mut run_start: Option<u32> = None;
    for tc in 0..res.tile_cols {
        let a = TileDesc::new(top.0, top.1, res.tile_rows - 1, tc);
        let b = TileDesc::new(bottom.0, bottom.1, 0, tc);
        let walkable = both_passable(layers, layer, a, b);
        if walkable {
            run_start.get_or_insert(tc);
        } else if let Some(start) = run_start.take() {
            emit_horizontal_run(graph, res, map_origin, top, bottom, start, tc - 1);
        }
    }
    if let Some(start) = run_start {
        emit_horizontal_run(graph, res, map_origin, top, bottom, start, res.tile_cols - 1);
    }
}

fn emit_horizontal_run(
    graph: &mut PortalGraph,
    res: &MapResolution,
    map_origin: Vec2,
    top: (u32, u32),
    bottom: (u32, u32),
    start_col: u32,
    end_col: u32,
) {
    let a_min = TileDesc::new(top.0, top.1, res.tile_rows - 1, start_col);
    let a_max = TileDesc::new(top.0, top.1, res.tile_rows - 1, end_col);
    let b_min = TileDesc::new(bottom.0, bottom.1, 0, start_col);
    let b_max = TileDesc::new(bottom.0, bottom.1, 0, end_col);
    push_portal_pair(graph, res, map_origin, top, a_min, a_max, bottom, b_min, b_max);
}

/// One step of bounded, non-blocking graph construction: each call scans at most one
/// chunk edge, so a caller driving this from a cooperative scheduler never
/// blocks for the whole-map cost in one go.
pub struct IncrementalGraphBuild<'a> {
    layers: &'a mut CostLayers,
    layer: NavLayer,
    map_origin: Vec2,
    graph: PortalGraph,
    next_edge: EdgeCursor,
}

#[derive(Clone, Copy)]
enum EdgeCursor {
    Vertical { cr: u32, cc: u32 },
    Horizontal { cr: u32, cc: u32 },
    Reachability,
    Done,
}

impl<'a> IncrementalGraphBuild<'a> {
    /// Starts a fresh incremental build over `layers`/`layer`.
    pub fn new(layers: &'a mut CostLayers, layer: NavLayer, map_origin: Vec2) -> Self {
        Self { layers, layer, map_origin, graph: PortalGraph::default(), next_edge: EdgeCursor::Vertical { cr: 0, cc: 0 } }
    }

    /// Performs one unit of work. Returns `true` while more work remains.
    pub fn step(&mut self) -> bool {
        let res = *self.layers.resolution();
        match self.next_edge {
            EdgeCursor::Vertical { cr, cc } => {
                if cc < res.chunks_wide.saturating_sub(1) {
                    scan_vertical_edge(&mut self.graph, self.layers, self.layer, &res, self.map_origin, cr, cc);
                }
                self.next_edge = if cr + 1 < res.chunks_high {
                    EdgeCursor::Vertical { cr: cr + 1, cc }
                } else if cc + 1 < res.chunks_wide.saturating_sub(1).max(1) {
                    EdgeCursor::Vertical { cr: 0, cc: cc + 1 }
                } else {
                    EdgeCursor::Horizontal { cr: 0, cc: 0 }
                };
                true
            }
            EdgeCursor::Horizontal { cr, cc } => {
                if cr < res.chunks_high.saturating_sub(1) {
                    scan_horizontal_edge(&mut self.graph, self.layers, self.layer, &res, self.map_origin, cr, cc);
                }
                self.next_edge = if cc + 1 < res.chunks_wide {
                    EdgeCursor::Horizontal { cr, cc: cc + 1 }
                } else if cr + 1 < res.chunks_high.saturating_sub(1).max(1) {
                    EdgeCursor::Horizontal { cr: cr + 1, cc: 0 }
                } else {
                    EdgeCursor::Reachability
                };
                true
            }
            EdgeCursor::Reachability => {
                self.graph.compute_reachability(self.layers, self.layer);
                self.next_edge = EdgeCursor::Done;
                true
            }
            EdgeCursor::Done => false,
        }
    }

    /// Drains the build to completion in one call (test/small-map
    /// convenience — equivalent to [`PortalGraph::build`]).
    pub fn finish(mut self) -> PortalGraph {
        while self.step() {}
        self.graph
    }
}

/// Associates each `(chunk, local_island)` with its owning [`NavChunk`] for
/// callers walking portal records directly (used by the router).
pub fn chunk_for(layers: &CostLayers, layer: NavLayer, chunk: (u32, u32)) -> Option<&NavChunk> {
    layers.chunk(layer, chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapResolution;

    fn res() -> MapResolution {
        MapResolution { chunks_wide: 3, chunks_high: 1, tile_cols: 4, tile_rows: 4, tile_size: 1.0 }
    }

    #[test]
    fn open_map_has_one_portal_per_shared_edge() {
        let r = res();
        let mut layers = CostLayers::new(r);
        layers.recompute_global_islands(NavLayer::Foot);
        let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);
        // 2 shared vertical edges (3 chunks in a row), each emitting one
        // maximal run -> 2 portal pairs -> 4 portal records.
        assert_eq!(graph.nodes.len(), 4);
    }

    #[test]
    fn portal_peers_point_back_at_each_other() {
        let r = res();
        let mut layers = CostLayers::new(r);
        layers.recompute_global_islands(NavLayer::Foot);
        let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);
        for p in &graph.nodes {
            assert_eq!(graph.nodes[p.peer].peer, p.id);
        }
    }

    #[test]
    fn wall_splits_one_portal_run_into_two() {
        let r = res();
        let mut layers = CostLayers::new(r);
        // Block the middle two rows of the shared edge between chunk 0 and 1.
        layers.set_cost(NavLayer::Foot, TileDesc::new(0, 0, 1, 3), crate::cost::IMPASSABLE);
        layers.set_cost(NavLayer::Foot, TileDesc::new(0, 0, 2, 3), crate::cost::IMPASSABLE);
        layers.recompute_global_islands(NavLayer::Foot);
        let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);
        let portals_between_0_1: Vec<_> = graph
            .nodes
            .iter()
            .filter(|p| p.chunk == (0, 0) && graph.nodes[p.peer].chunk == (0, 1))
            .collect();
        assert_eq!(portals_between_0_1.len(), 2);
    }

    #[test]
    fn incremental_build_matches_synchronous_build() {
        let r = res();
        let mut layers_a = CostLayers::new(r);
        layers_a.recompute_global_islands(NavLayer::Foot);
        let sync = PortalGraph::build(&mut layers_a, NavLayer::Foot, Vec2::ZERO);

        let mut layers_b = CostLayers::new(res());
        layers_b.recompute_global_islands(NavLayer::Foot);
        let incremental = IncrementalGraphBuild::new(&mut layers_b, NavLayer::Foot, Vec2::ZERO).finish();
        assert_eq!(sync.nodes.len(), incremental.nodes.len());
    }
}

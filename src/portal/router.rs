//! A* routing over the portal graph, with connected-component fallback for
//! destinations that turn out to be unreachable.
//!
//! Grounded on `pathfinding::astar::find_path_astar_local`
//! (open/closed-set A* with a Euclidean heuristic) generalized from a single
//! dense grid to portal-graph nodes, and on
//! `pathfinding::region_connectivity` for the chunk-level reachability
//! fallback that redirects a request at an unreachable destination to the
//! nearest reachable portal instead of failing outright.

use super::PortalGraph;
use crate::cost::CostLayers;
use crate::grid::TileDesc;
use crate::layer::NavLayer;
use crate::math::Vec2;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One portal hop in a routed path: the boundary tile crossed, the local
/// island entered from, and the local island arrived at on the far side —
/// a `(portal_desc, port_iid, next_iid)` triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutedPortal {
    /// The representative tile of the portal crossed.
    pub portal_desc: TileDesc,
    /// Local island (in the chunk being departed) the route enters the
    /// portal from.
    pub port_iid: u16,
    /// Local island (in the chunk being entered) the route arrives in.
    pub next_iid: u16,
}

#[derive(Clone, Copy, PartialEq)]
struct Scored {
    portal_id: usize,
    f_score: f32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap via `BinaryHeap` (which is a max-heap).
        other.f_score.partial_cmp(&self.f_score).unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn local_island_of(layers: &CostLayers, layer: NavLayer, chunk: (u32, u32), tile: TileDesc) -> u16 {
    layers.chunk(layer, chunk).map(|c| c.local_island(tile.tile_r, tile.tile_c)).unwrap_or(u16::MAX)
}

/// Finds an A* route across the portal graph from `(from_chunk,
/// from_local_island)` to `(to_chunk, to_local_island)`, returning the
/// sequence of portal hops to cross. `goal_world` seeds the heuristic (the
/// straight-line distance from a candidate portal to the destination point).
///
/// Returns `Some(vec![])` when source and destination already share a chunk
/// and local island (no portal crossing needed), `None` when no route exists
/// in the current graph.
pub fn route(
    graph: &PortalGraph,
    layers: &CostLayers,
    layer: NavLayer,
    from_chunk: (u32, u32),
    from_local_island: u16,
    to_chunk: (u32, u32),
    to_local_island: u16,
    goal_world: Vec2,
) -> Option<Vec<RoutedPortal>> {
    if from_chunk == to_chunk && from_local_island == to_local_island {
        return Some(Vec::new());
    }

    let chunk_index = index_portals_by_chunk(graph);

    let is_goal = |portal_id: usize| -> bool {
        let peer = &graph.nodes[graph.nodes[portal_id].peer];
        peer.chunk == to_chunk && local_island_of(layers, layer, to_chunk, peer.node) == to_local_island
    };

    let start_ids: Vec<usize> = chunk_index
        .get(&from_chunk)
        .into_iter()
        .flatten()
        .copied()
        .filter(|&pid| local_island_of(layers, layer, from_chunk, graph.nodes[pid].node) == from_local_island)
        .collect();
    if start_ids.is_empty() {
        return None;
    }

    let mut open = BinaryHeap::new();
    let mut g_score: FxHashMap<usize, f32> = FxHashMap::default();
    // child -> (parent, was this transition an actual portal crossing, as
    // opposed to a same-chunk walk to a sibling portal).
    let mut came_from: FxHashMap<usize, (usize, bool)> = FxHashMap::default();

    for &pid in &start_ids {
        let h = graph.nodes[pid].world_pos.distance(goal_world);
        g_score.insert(pid, 0.0);
        open.push(Scored { portal_id: pid, f_score: h });
    }

    let mut goal_id = None;
    let mut visited: FxHashSet<usize> = FxHashSet::default();

    while let Some(Scored { portal_id, .. }) = open.pop() {
        if !visited.insert(portal_id) {
            continue;
        }
        if is_goal(portal_id) {
            goal_id = Some(portal_id);
            break;
        }
        let current_g = g_score[&portal_id];
        for (neighbour, cost, is_cross) in search_neighbours(graph, layers, layer, &chunk_index, portal_id) {
            let tentative = current_g + cost;
            if tentative < *g_score.get(&neighbour).unwrap_or(&f32::INFINITY) {
                g_score.insert(neighbour, tentative);
                came_from.insert(neighbour, (portal_id, is_cross));
                let h = graph.nodes[neighbour].world_pos.distance(goal_world);
                open.push(Scored { portal_id: neighbour, f_score: tentative + h });
            }
        }
    }

    let goal_id = goal_id?;
    Some(reconstruct(graph, layers, layer, &came_from, goal_id, &start_ids))
}

/// A portal is reachable from another search node either by crossing to its
/// peer over a portal graph edge, or by walking freely to any other portal
/// sharing this portal's chunk and local island —
/// the in-chunk leg has no dedicated edge list, so its cost is approximated
/// as straight-line world distance, same as a crossing edge's cost. The
/// `bool` distinguishes the two so [`reconstruct`] only emits a
/// [`RoutedPortal`] for actual crossings.
fn search_neighbours(
    graph: &PortalGraph,
    layers: &CostLayers,
    layer: NavLayer,
    chunk_index: &FxHashMap<(u32, u32), Vec<usize>>,
    portal_id: usize,
) -> Vec<(usize, f32, bool)> {
    let p = &graph.nodes[portal_id];
    let mut out = Vec::new();
    if let Some(edges) = graph.edges.get(&portal_id) {
        out.extend(edges.iter().map(|&(id, cost)| (id, cost, true)));
    }
    let island = local_island_of(layers, layer, p.chunk, p.node);
    if island != u16::MAX {
        if let Some(siblings) = chunk_index.get(&p.chunk) {
            for &sid in siblings {
                if sid == portal_id {
                    continue;
                }
                let s = &graph.nodes[sid];
                if local_island_of(layers, layer, p.chunk, s.node) == island {
                    out.push((sid, p.world_pos.distance(s.world_pos), false));
                }
            }
        }
    }
    out
}

fn index_portals_by_chunk(graph: &PortalGraph) -> FxHashMap<(u32, u32), Vec<usize>> {
    let mut index: FxHashMap<(u32, u32), Vec<usize>> = FxHashMap::default();
    for p in &graph.nodes {
        index.entry(p.chunk).or_default().push(p.id);
    }
    index
}

fn reconstruct(
    graph: &PortalGraph,
    layers: &CostLayers,
    layer: NavLayer,
    came_from: &FxHashMap<usize, (usize, bool)>,
    goal_id: usize,
    start_ids: &[usize],
) -> Vec<RoutedPortal> {
    // Walk the search-node chain backward from the goal, collecting each
    // traversed edge as `(parent, child, was_a_crossing)`, then reverse it
    // into start-to-goal order.
    let mut edges_rev = Vec::new();
    let mut cursor = goal_id;
    while let Some(&(parent, is_cross)) = came_from.get(&cursor) {
        edges_rev.push((parent, cursor, is_cross));
        cursor = parent;
        if start_ids.contains(&cursor) {
            break;
        }
    }
    edges_rev.reverse();

    let portal_of = |pid: usize| -> RoutedPortal {
        let p = &graph.nodes[pid];
        let peer = &graph.nodes[p.peer];
        RoutedPortal {
            portal_desc: p.node,
            port_iid: local_island_of(layers, layer, p.chunk, p.node),
            next_iid: local_island_of(layers, layer, peer.chunk, peer.node),
        }
    };

    // Emit one `RoutedPortal` per node whose outgoing edge was an actual
    // portal crossing (as opposed to a same-chunk walk to a sibling
    // portal); same-chunk legs are folded into the cost model only, not the
    // returned hop list.
    let mut out: Vec<RoutedPortal> = edges_rev
        .iter()
        .filter(|&&(_, _, is_cross)| is_cross)
        .map(|&(parent, _, _)| portal_of(parent))
        .collect();
    // The goal node is always reached by crossing into the destination
    // chunk, even though that final crossing isn't itself a search edge.
    out.push(portal_of(goal_id));
    out
}

/// Chunk-level connectivity, precomputed from the portal graph, used to
/// answer "can I even get there" cheaply and to pick a fallback destination
/// when the literal target is unreachable.
pub struct ConnectedComponents {
    component_of: FxHashMap<(u32, u32), u32>,
}

impl ConnectedComponents {
    /// Builds components over every chunk touched by `graph`'s portals —
    /// two chunks are in the same component iff a portal directly connects
    /// them (this is a coarse, island-blind connectivity: see
    /// [`ConnectedComponents::are_connected`] for why that's sufficient for
    /// a fallback check rather than an exact routing oracle).
    pub fn build(graph: &PortalGraph) -> Self {
        let mut parent: FxHashMap<(u32, u32), (u32, u32)> = FxHashMap::default();
        for p in &graph.nodes {
            parent.entry(p.chunk).or_insert(p.chunk);
        }
        for p in &graph.nodes {
            let peer_chunk = graph.nodes[p.peer].chunk;
            union(&mut parent, p.chunk, peer_chunk);
        }
        let mut component_of = FxHashMap::default();
        let keys: Vec<_> = parent.keys().copied().collect();
        for key in keys {
            let root = find(&mut parent, key);
            component_of.insert(key, root.0 * 1_000_003 + root.1);
        }
        Self { component_of }
    }

    /// Whether `a` and `b` can reach each other through some chain of
    /// portals, ignoring local-island fine structure (a coarse "is this
    /// destination worth attempting" test, not a routing guarantee — a
    /// positive answer here can still fail fine-grained [`route`] if the two
    /// points sit on disjoint local islands within connected chunks).
    pub fn are_connected(&self, a: (u32, u32), b: (u32, u32)) -> bool {
        match (self.component_of.get(&a), self.component_of.get(&b)) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => a == b,
        }
    }

    /// Picks the reachable portal (by straight-line distance) closest to
    /// `goal_world` among those bordering chunks connected to `from_chunk` —
    /// used to redirect a request whose literal destination chunk is
    /// unreachable.
    pub fn nearest_reachable_portal(
        &self,
        graph: &PortalGraph,
        from_chunk: (u32, u32),
        goal_world: Vec2,
    ) -> Option<TileDesc> {
        graph
            .nodes
            .iter()
            .filter(|p| self.are_connected(from_chunk, p.chunk))
            .min_by(|a, b| {
                a.world_pos
                    .distance(goal_world)
                    .partial_cmp(&b.world_pos.distance(goal_world))
                    .unwrap_or(Ordering::Equal)
            })
            .map(|p| p.node)
    }
}

fn find(parent: &mut FxHashMap<(u32, u32), (u32, u32)>, key: (u32, u32)) -> (u32, u32) {
    let mut root = key;
    while parent[&root] != root {
        root = parent[&root];
    }
    let mut cursor = key;
    while parent[&cursor] != root {
        let next = parent[&cursor];
        parent.insert(cursor, root);
        cursor = next;
    }
    root
}

fn union(parent: &mut FxHashMap<(u32, u32), (u32, u32)>, a: (u32, u32), b: (u32, u32)) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent.insert(ra, rb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::IMPASSABLE;
    use crate::grid::MapResolution;

    fn res() -> MapResolution {
        MapResolution { chunks_wide: 3, chunks_high: 1, tile_cols: 4, tile_rows: 4, tile_size: 1.0 }
    }

    #[test]
    fn routes_across_two_portal_hops() {
        let r = res();
        let mut layers = CostLayers::new(r);
        layers.recompute_global_islands(NavLayer::Foot);
        let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);

        let from_iid = layers.chunk(NavLayer::Foot, (0, 0)).unwrap().local_island(0, 0);
        let to_iid = layers.chunk(NavLayer::Foot, (0, 2)).unwrap().local_island(0, 0);
        let goal = Vec2::new(10.0, 0.0);
        let path = route(&graph, &layers, NavLayer::Foot, (0, 0), from_iid, (0, 2), to_iid, goal).unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].portal_desc.chunk(), (0, 0));
    }

    #[test]
    fn same_chunk_same_island_needs_no_hops() {
        let r = res();
        let mut layers = CostLayers::new(r);
        layers.recompute_global_islands(NavLayer::Foot);
        let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);
        let iid = layers.chunk(NavLayer::Foot, (0, 0)).unwrap().local_island(0, 0);
        let path = route(&graph, &layers, NavLayer::Foot, (0, 0), iid, (0, 0), iid, Vec2::ZERO).unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn unreachable_destination_yields_none() {
        let r = res();
        let mut layers = CostLayers::new(r);
        for tr in 0..4 {
            layers.set_cost(NavLayer::Foot, TileDesc::new(0, 1, tr, 0), IMPASSABLE);
            layers.set_cost(NavLayer::Foot, TileDesc::new(0, 0, tr, 3), IMPASSABLE);
        }
        layers.recompute_global_islands(NavLayer::Foot);
        let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);
        let from_iid = layers.chunk(NavLayer::Foot, (0, 0)).unwrap().local_island(0, 0);
        let to_iid = layers.chunk(NavLayer::Foot, (0, 2)).unwrap().local_island(0, 0);
        let path = route(&graph, &layers, NavLayer::Foot, (0, 0), from_iid, (0, 2), to_iid, Vec2::new(10.0, 0.0));
        assert!(path.is_none());
    }

    #[test]
    fn connected_components_detect_the_split() {
        let r = res();
        let mut layers = CostLayers::new(r);
        for tr in 0..4 {
            layers.set_cost(NavLayer::Foot, TileDesc::new(0, 1, tr, 0), IMPASSABLE);
            layers.set_cost(NavLayer::Foot, TileDesc::new(0, 0, tr, 3), IMPASSABLE);
        }
        layers.recompute_global_islands(NavLayer::Foot);
        let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);
        let cc = ConnectedComponents::build(&graph);
        assert!(!cc.are_connected((0, 0), (0, 2)));
        assert!(cc.nearest_reachable_portal(&graph, (0, 0), Vec2::new(10.0, 0.0)).is_none());
    }
}

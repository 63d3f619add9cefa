//! Cost / blocker / island maintenance and the per-chunk,
//! per-layer storage it operates over.
//!
//! Ported from a single dense `FlowField::cost_field` (one grid,
//! one layer, one faction) into chunked, multi-layer, multi-faction
//! arrays, with the connected-component labelling style of
//! `pathfinding/island_detection.rs` simplified from region-polygon flood
//! fill down to per-tile flood fill (see DESIGN.md).

use crate::grid::{neighbours_4, MapResolution, TileDesc};
use crate::layer::NavLayer;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Sentinel cost meaning "never passable".
pub const IMPASSABLE: u8 = 255;

/// Maximum distinct factions tracked per tile. Generous for a real-time
/// strategy roster; beyond this, excess faction occupancy collapses into the
/// last slot (still correctly counted toward "is anyone here" but loses
/// per-faction precision, which only matters for the enemy-only test).
pub const MAX_FACTIONS: usize = 16;

/// A faction identifier.
pub type FactionId = u8;

/// One chunk's cost/blocker/faction/island arrays for a single [`NavLayer`].
#[derive(Clone, Debug)]
pub struct NavChunk {
    width: u32,
    height: u32,
    /// Static terrain cost, `1..=254`, or [`IMPASSABLE`].
    cost_base: Vec<u8>,
    /// Reference count of dynamic blockers (stationary agents, buildings).
    blockers: Vec<u16>,
    /// Per-tile faction occupancy counts.
    factions: Vec<[u16; MAX_FACTIONS]>,
    /// Global connected-component id, valid only when not stale.
    islands: Vec<u32>,
    /// Connected-component id local to this chunk.
    local_islands: Vec<u16>,
    /// Portal ids (indices into [`crate::portal::PortalGraph::nodes`]) that
    /// touch this chunk.
    pub portal_ids: SmallVec<[usize; 8]>,
}

impl NavChunk {
    /// Builds an all-walkable chunk of the given tile dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Self {
            width,
            height,
            cost_base: vec![1u8; n],
            blockers: vec![0u16; n],
            factions: vec![[0u16; MAX_FACTIONS]; n],
            islands: vec![u32::MAX; n],
            local_islands: vec![u16::MAX; n],
            portal_ids: SmallVec::new(),
        }
    }

    fn index(&self, tile_r: u32, tile_c: u32) -> usize {
        (tile_r * self.width + tile_c) as usize
    }

    /// Static terrain cost at a tile.
    pub fn cost_base(&self, tile_r: u32, tile_c: u32) -> u8 {
        self.cost_base[self.index(tile_r, tile_c)]
    }

    /// Sets the static terrain cost at a tile (marks nothing dirty itself —
    /// callers go through [`CostLayers::set_cost`] so dirtiness is tracked).
    pub fn set_cost_base(&mut self, tile_r: u32, tile_c: u32, cost: u8) {
        let idx = self.index(tile_r, tile_c);
        self.cost_base[idx] = cost;
    }

    /// Current blocker refcount at a tile.
    pub fn blocker_count(&self, tile_r: u32, tile_c: u32) -> u16 {
        self.blockers[self.index(tile_r, tile_c)]
    }

    /// Faction occupancy counts at a tile.
    pub fn faction_counts(&self, tile_r: u32, tile_c: u32) -> &[u16; MAX_FACTIONS] {
        &self.factions[self.index(tile_r, tile_c)]
    }

    /// Global island id at a tile (only meaningful if the map's global
    /// islands are not stale — see [`CostLayers::global_islands_dirty`]).
    pub fn island(&self, tile_r: u32, tile_c: u32) -> u32 {
        self.islands[self.index(tile_r, tile_c)]
    }

    /// Local island id at a tile.
    pub fn local_island(&self, tile_r: u32, tile_c: u32) -> u16 {
        self.local_islands[self.index(tile_r, tile_c)]
    }

    /// Whether a tile is passable for a query with the given `enemy_mask`
    /// (bit `f` set means faction `f` is an enemy of the querying faction).
    ///
    /// Invariant: passable iff `cost_base != IMPASSABLE` and either
    /// no blockers occupy the tile, or every occupying faction is an enemy
    /// (in which case the tile is passable only for enemy-seek purposes —
    /// see [`CostLayers::is_passable_enemy_only`]).
    pub fn is_passable(&self, tile_r: u32, tile_c: u32) -> bool {
        let idx = self.index(tile_r, tile_c);
        if self.cost_base[idx] == IMPASSABLE {
            return false;
        }
        self.blockers[idx] == 0
    }

    /// Whether every faction occupying this tile belongs to `enemy_mask`
    ///: passable for enemy-seek fields, still
    /// impassable for ordinary movement.
    pub fn is_enemy_only(&self, tile_r: u32, tile_c: u32, enemy_mask: u32) -> bool {
        let idx = self.index(tile_r, tile_c);
        if self.cost_base[idx] == IMPASSABLE {
            return false;
        }
        if self.blockers[idx] == 0 {
            return false; // plain-passable, not "enemy-only"
        }
        self.factions[idx]
            .iter()
            .enumerate()
            .all(|(f, &count)| count == 0 || (enemy_mask & (1 << f)) != 0)
    }
}

/// Owns every [`NavChunk`] for every [`NavLayer`], plus the dirty-chunk
/// bookkeeping used for lazy island relabelling.
pub struct CostLayers {
    res: MapResolution,
    /// `chunks[layer][(chunk_r, chunk_c)]`.
    chunks: [FxHashMap<(u32, u32), NavChunk>; 4],
    /// Chunks touched since the last local-island repaint, per layer.
    dirty_chunks: [FxHashSet<(u32, u32)>; 4],
    /// Set once any chunk in a layer is dirty; cleared by
    /// [`CostLayers::recompute_global_islands`].
    global_islands_dirty: [bool; 4],
}

impl CostLayers {
    /// Builds an all-walkable set of chunks for every layer at the given
    /// map resolution.
    pub fn new(res: MapResolution) -> Self {
        let mut chunks: [FxHashMap<(u32, u32), NavChunk>; 4] = Default::default();
        for layer_chunks in &mut chunks {
            for cr in 0..res.chunks_high {
                for cc in 0..res.chunks_wide {
                    layer_chunks.insert((cr, cc), NavChunk::new(res.tile_cols, res.tile_rows));
                }
            }
        }
        Self {
            res,
            chunks,
            dirty_chunks: Default::default(),
            global_islands_dirty: [true; 4],
        }
    }

    /// The map resolution these layers were built for.
    pub fn resolution(&self) -> &MapResolution {
        &self.res
    }

    /// Read access to one layer's chunk.
    pub fn chunk(&self, layer: NavLayer, chunk: (u32, u32)) -> Option<&NavChunk> {
        self.chunks[layer.as_index()].get(&chunk)
    }

    /// Mutable access to one layer's chunk.
    pub fn chunk_mut(&mut self, layer: NavLayer, chunk: (u32, u32)) -> Option<&mut NavChunk> {
        self.chunks[layer.as_index()].get_mut(&chunk)
    }

    fn mark_dirty(&mut self, layer: NavLayer, chunk: (u32, u32)) {
        self.dirty_chunks[layer.as_index()].insert(chunk);
        self.global_islands_dirty[layer.as_index()] = true;
    }

    /// Sets static terrain cost at a tile and marks its chunk dirty.
    pub fn set_cost(&mut self, layer: NavLayer, td: TileDesc, cost: u8) {
        let chunk_key = td.chunk();
        if let Some(chunk) = self.chunks[layer.as_index()].get_mut(&chunk_key) {
            chunk.set_cost_base(td.tile_r, td.tile_c, cost);
        }
        self.mark_dirty(layer, chunk_key);
    }

    /// Blocks the tile disk of radius `radius_tiles` centered on `center`
    /// for `layer`, incrementing blocker refcounts and the occupying
    /// faction's count.
    pub fn block_disk(&mut self, layer: NavLayer, center: TileDesc, radius_tiles: f32, faction: FactionId) {
        for td in crate::grid::all_under_circle(&self.res, center, radius_tiles) {
            let chunk_key = td.chunk();
            if let Some(chunk) = self.chunks[layer.as_index()].get_mut(&chunk_key) {
                let idx = chunk.index(td.tile_r, td.tile_c);
                chunk.blockers[idx] += 1;
                let slot = (faction as usize).min(MAX_FACTIONS - 1);
                chunk.factions[idx][slot] += 1;
            }
            self.mark_dirty(layer, chunk_key);
        }
    }

    /// Reverses [`CostLayers::block_disk`].
    pub fn unblock_disk(&mut self, layer: NavLayer, center: TileDesc, radius_tiles: f32, faction: FactionId) {
        for td in crate::grid::all_under_circle(&self.res, center, radius_tiles) {
            let chunk_key = td.chunk();
            if let Some(chunk) = self.chunks[layer.as_index()].get_mut(&chunk_key) {
                let idx = chunk.index(td.tile_r, td.tile_c);
                chunk.blockers[idx] = chunk.blockers[idx].saturating_sub(1);
                let slot = (faction as usize).min(MAX_FACTIONS - 1);
                chunk.factions[idx][slot] = chunk.factions[idx][slot].saturating_sub(1);
            }
            self.mark_dirty(layer, chunk_key);
        }
    }

    /// Whether `layer` has any chunk awaiting a local-island repaint.
    pub fn local_islands_dirty(&self, layer: NavLayer) -> bool {
        !self.dirty_chunks[layer.as_index()].is_empty()
    }

    /// Repaints local island ids for every dirty chunk of `layer`
    ///. Does not
    /// touch chunks that were never marked dirty.
    pub fn repaint_local_islands(&mut self, layer: NavLayer) {
        let dirty: Vec<(u32, u32)> = self.dirty_chunks[layer.as_index()].drain().collect();
        for chunk_key in dirty {
            if let Some(chunk) = self.chunks[layer.as_index()].get_mut(&chunk_key) {
                label_local_islands(chunk);
            }
        }
    }

    /// Recomputes global island ids across the entire map for `layer` via a
    /// full flood fill, then clears the layer's global-dirty flag.
    /// Relabelling is amortized: this only pays the O(map) cost when a
    /// caller actually needs a fresh global answer (see
    /// [`CostLayers::global_islands_dirty`]), not on every mutation.
    pub fn recompute_global_islands(&mut self, layer: NavLayer) {
        self.repaint_local_islands(layer);

        let chunk_keys: Vec<(u32, u32)> = self.chunks[layer.as_index()].keys().copied().collect();
        for key in &chunk_keys {
            let chunk = self.chunks[layer.as_index()].get_mut(key).unwrap();
            chunk.islands.fill(u32::MAX);
        }

        let mut next_id: u32 = 0;
        for &chunk_key in &chunk_keys {
            let (w, h) = {
                let chunk = &self.chunks[layer.as_index()][&chunk_key];
                (chunk.width, chunk.height)
            };
            for tr in 0..h {
                for tc in 0..w {
                    let start = TileDesc::new(chunk_key.0, chunk_key.1, tr, tc);
                    if !self.chunk(layer, chunk_key).unwrap().is_passable(tr, tc) {
                        continue;
                    }
                    let already_labelled = self.chunk(layer, chunk_key).unwrap().island(tr, tc) != u32::MAX;
                    if already_labelled {
                        continue;
                    }
                    self.flood_fill_global(layer, start, next_id);
                    next_id += 1;
                }
            }
        }

        self.global_islands_dirty[layer.as_index()] = false;
    }

    fn flood_fill_global(&mut self, layer: NavLayer, start: TileDesc, id: u32) {
        let mut queue = VecDeque::new();
        queue.push_back(start);
        {
            let chunk = self.chunks[layer.as_index()].get_mut(&start.chunk()).unwrap();
            let idx = chunk.index(start.tile_r, start.tile_c);
            chunk.islands[idx] = id;
        }
        while let Some(td) = queue.pop_front() {
            for n in neighbours_4(&self.res, td) {
                let chunk_key = n.chunk();
                let Some(chunk) = self.chunks[layer.as_index()].get_mut(&chunk_key) else { continue };
                if !chunk.is_passable(n.tile_r, n.tile_c) {
                    continue;
                }
                let idx = chunk.index(n.tile_r, n.tile_c);
                if chunk.islands[idx] != u32::MAX {
                    continue;
                }
                chunk.islands[idx] = id;
                queue.push_back(n);
            }
        }
    }

    /// Whether `layer`'s global island ids need a [`CostLayers::recompute_global_islands`]
    /// call before they can be trusted.
    pub fn global_islands_dirty(&self, layer: NavLayer) -> bool {
        self.global_islands_dirty[layer.as_index()]
    }
}

/// Flood-fills connected-component ids local to one chunk (4-connected,
/// matching the integration field's relaxation neighbourhood).
fn label_local_islands(chunk: &mut NavChunk) {
    chunk.local_islands.fill(u16::MAX);
    let mut next_id: u16 = 0;
    for tr in 0..chunk.height {
        for tc in 0..chunk.width {
            let idx = chunk.index(tr, tc);
            if !chunk.is_passable(tr, tc) || chunk.local_islands[idx] != u16::MAX {
                continue;
            }
            let mut queue = VecDeque::new();
            queue.push_back((tr, tc));
            chunk.local_islands[idx] = next_id;
            while let Some((r, c)) = queue.pop_front() {
                let candidates = [
                    (r.wrapping_sub(1), c),
                    (r + 1, c),
                    (r, c.wrapping_sub(1)),
                    (r, c + 1),
                ];
                for (nr, nc) in candidates {
                    if nr >= chunk.height || nc >= chunk.width {
                        continue;
                    }
                    let nidx = chunk.index(nr, nc);
                    if !chunk.is_passable(nr, nc) || chunk.local_islands[nidx] != u16::MAX {
                        continue;
                    }
                    chunk.local_islands[nidx] = next_id;
                    queue.push_back((nr, nc));
                }
            }
            next_id += 1;
        }
    }
}

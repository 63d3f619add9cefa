//! Wiring: the single value that owns every subsystem and drives the
//! per-tick simulation loop, plus the external command/query surface
//! external callers (UI, scripts) go through.
//!
//! Ported from the shape of `simulation::mod`'s system-set ordering
//! (apply-previous-results, drain input, step state machines, advance
//! interpolation) collapsed from a Bevy schedule into one
//! `NavigationCore::tick` method, since this crate owns no ECS world of its
//! own.

use crate::command::{Command, CommandQueue};
use crate::config::{Config, VelocityBackend};
use crate::cost::{CostLayers, FactionId};
use crate::field::builder::{
    build_cell_arrival_field, build_flow_field, build_impassable_recovery_field, build_integration_field, build_los_field, build_padded_seek_field, escape_direction, ChunkRegion, SpanRegion,
};
use crate::field::cache::FieldCache;
use crate::field::{Field, FieldId};
use crate::flock::{DestId, FlockTable};
use crate::formation::{self, FormationType};
use crate::grid::{self, MapResolution, TileDesc};
use crate::layer::NavLayer;
use crate::math::{Box2, Vec2};
use crate::movement::avoidance::{AvoidanceAgent, AvoidanceNeighbour};
use crate::movement::steering::{Neighbour, SteeringInput, SteeringWeights};
use crate::movement::{self, AgentState, Movestate};
use crate::portal::{route, ConnectedComponents, PortalGraph};
use crate::save::{SavedAgent, SavedAgentMeta, SaveData};
use crate::scheduler::Scheduler;
use crate::snapshot::Snapshot;
use crate::spatial::{SpatialHash, CLEARPATH_NEIGHBOUR_RADIUS};
use rustc_hash::{FxHashMap, FxHashSet};

/// Per-tick performance counters, logged at `debug!` level rather than
/// exposed as a public query — ambient observability, not a §6 query.
/// Grounded on the teacher's `SimPerformance` debug-overlay counters
/// (cache hit/miss rates, neighbour cache staleness).
#[derive(Clone, Copy, Debug, Default)]
pub struct TickMetrics {
    pub tick: u64,
    pub agents: usize,
    pub active_flocks: usize,
    pub field_cache_hits: u64,
    pub field_cache_misses: u64,
    pub field_cache_len: usize,
}

/// Default top speed assigned to an agent added without one (overridden
/// immediately by a `SetMaxSpeed` command in the common case).
const DEFAULT_MAX_SPEED: f32 = 5.0;

/// Radius within which a moving agent is considered to have reached its
/// flock's target.
const ARRIVAL_RADIUS: f32 = 0.5;

/// Distance at which a formation member stops homing on its assigned cell
/// under flock steering and switches to the tighter cell-arrival terms.
const FORMATION_APPROACH_RADIUS: f32 = 2.0;

/// Critical-damping factor applied to velocity while settling into a
/// formation cell.
const FORMATION_DAMPING: f32 = 2.0;

/// Upper bound on distinct flow fields kept warm at once.
const FIELD_CACHE_CAPACITY: usize = 256;

/// BFS search radius (in tiles) the impassable-recovery field searches
/// outward from a stuck agent for the nearest pathable frontier.
const IMPASSABLE_RECOVERY_RADIUS: u32 = 6;

/// Velocity magnitude below which an agent actively seeking a target is
/// considered stalled (spec's "`v_desired ≈ 0` mid-journey").
const STALL_VELOCITY_EPSILON: f32 = 1e-3;

/// Per-agent bookkeeping kept outside [`Movestate`]: selection radius and
/// faction, both set by dedicated commands rather than at `Add` time only,
/// plus the tile descriptor the agent's disk is currently blocked at (`None`
/// while it's moving).
#[derive(Clone, Copy, Debug)]
struct AgentMeta {
    faction: FactionId,
    radius: f32,
    blocked_at: Option<TileDesc>,
    /// Consecutive stall episodes survived without a successful resume;
    /// not persisted (not part of the savefile's documented agent fields) —
    /// a restored agent simply gets a fresh attempt at its current state.
    stall_retries: u8,
    /// The cached cell-arrival field this agent's `ArrivingToCell` sampling
    /// uses, set once by `make_flocks` for the tick the formation was
    /// issued. Not persisted — a restored agent in `ArrivingToCell` simply
    /// falls back to direct-to-cell heading until its next formation issue.
    cell_field_id: Option<FieldId>,
    /// Map-absolute `(row, col)` of the cached field's local `(0, 0)`,
    /// needed to translate the agent's own tile into the field's local
    /// coordinates when sampling it.
    cell_field_origin: Option<(i64, i64)>,
}

/// Owns every subsystem for one navigable map and drives its tick loop.
pub struct NavigationCore {
    config: Config,
    resolution: MapResolution,
    map_origin: Vec2,
    layers: CostLayers,
    portal_graphs: [PortalGraph; 4],
    connected_components: [ConnectedComponents; 4],
    field_cache: FieldCache,
    flocks: FlockTable,
    movement: FxHashMap<u32, Movestate>,
    meta: FxHashMap<u32, AgentMeta>,
    /// The latest external-world snapshot, refreshed once per tick by the
    /// caller before [`NavigationCore::tick`] runs. `None` until a caller
    /// supplies the first one, during which target-seeking states simply
    /// hold in place rather than being fabricated a destination.
    world: Option<Snapshot>,
    commands: CommandQueue,
    spatial: SpatialHash,
    scheduler: Scheduler,
    tick_count: u64,
    /// Set once the first tick observes `config.velocity_backend ==
    /// VelocityBackend::Gpu`, so the fallback notice in
    /// [`NavigationCore::tick`] logs once per run rather than every tick.
    gpu_fallback_logged: bool,
    /// Counters from the most recently completed tick.
    metrics: TickMetrics,
}

impl NavigationCore {
    pub fn new(config: Config, resolution: MapResolution, map_origin: Vec2) -> Self {
        let layers = CostLayers::new(resolution);
        let scheduler = Scheduler::new(config.max_move_tasks);
        Self {
            portal_graphs: [PortalGraph::default(), PortalGraph::default(), PortalGraph::default(), PortalGraph::default()],
            connected_components: [
                ConnectedComponents::build(&PortalGraph::default()),
                ConnectedComponents::build(&PortalGraph::default()),
                ConnectedComponents::build(&PortalGraph::default()),
                ConnectedComponents::build(&PortalGraph::default()),
            ],
            field_cache: FieldCache::new(FIELD_CACHE_CAPACITY),
            flocks: FlockTable::new(),
            movement: FxHashMap::default(),
            meta: FxHashMap::default(),
            world: None,
            commands: CommandQueue::new(1024),
            spatial: SpatialHash::new(CLEARPATH_NEIGHBOUR_RADIUS),
            scheduler,
            layers,
            resolution,
            map_origin,
            config,
            tick_count: 0,
            gpu_fallback_logged: false,
            metrics: TickMetrics::default(),
        }
    }

    /// Counters from the most recently completed tick (cache hit/miss rate,
    /// live agent/flock counts). Reset each tick, not cumulative.
    pub fn tick_metrics(&self) -> TickMetrics {
        self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layers_mut(&mut self) -> &mut CostLayers {
        &mut self.layers
    }

    pub fn layers(&self) -> &CostLayers {
        &self.layers
    }

    /// A cloneable handle external callers use to enqueue commands
    /// asynchronously.
    pub fn command_sender(&self) -> crossbeam_channel::Sender<Command> {
        self.commands.sender()
    }

    pub fn push_command(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    /// Replaces the gamestate snapshot movement computation reads this tick.
    /// Callers are expected to rebuild and set a fresh one before every
    /// [`NavigationCore::tick`] call.
    pub fn set_world_snapshot(&mut self, snapshot: Snapshot) {
        self.world = Some(snapshot);
    }

    /// Drops the current snapshot; target-seeking agents hold in place until
    /// a new one is set.
    pub fn clear_world_snapshot(&mut self) {
        self.world = None;
    }

    pub fn world_snapshot(&self) -> Option<&Snapshot> {
        self.world.as_ref()
    }

    /// Rebuilds the portal graph for `layer` from the current cost layers —
    /// called once after terrain load and again after any island-affecting
    /// edit batch commits. Forces a fresh island labelling first, since
    /// portal reachability bits are only meaningful once local islands are
    /// up to date.
    pub fn rebuild_portals(&mut self, layer: NavLayer) {
        self.layers.recompute_global_islands(layer);
        self.portal_graphs[layer.as_index()] = PortalGraph::build(&mut self.layers, layer, self.map_origin);
        self.connected_components[layer.as_index()] = ConnectedComponents::build(&self.portal_graphs[layer.as_index()]);
        self.field_cache.flush_layer(layer);
    }

    pub fn portal_graph(&self, layer: NavLayer) -> &PortalGraph {
        &self.portal_graphs[layer.as_index()]
    }

    pub fn movestate(&self, uid: u32) -> Option<&Movestate> {
        self.movement.get(&uid)
    }

    /// Blocks `uid`'s disk in `NavLayer::Foot`'s cost layer at its current
    /// position, if it isn't already blocked there. A no-op for an agent
    /// with no registered `AgentMeta` (not yet `Add`ed, or already removed).
    fn block_agent(&mut self, uid: u32) {
        let Some(meta) = self.meta.get(&uid).copied() else { return };
        if meta.blocked_at.is_some() {
            return;
        }
        let Some(pos) = self.movement.get(&uid).map(|m| m.next_pos) else { return };
        let Some(td) = grid::desc_for_point(&self.resolution, self.map_origin, pos) else { return };
        let radius_tiles = meta.radius / self.resolution.tile_size;
        self.layers.block_disk(NavLayer::Foot, td, radius_tiles, meta.faction);
        self.invalidate_disk_fields(td, radius_tiles);
        if let Some(meta) = self.meta.get_mut(&uid) {
            meta.blocked_at = Some(td);
        }
    }

    /// Reverses [`NavigationCore::block_agent`]; a no-op if `uid` isn't
    /// currently blocking anything.
    fn unblock_agent(&mut self, uid: u32) {
        let Some(meta) = self.meta.get(&uid).copied() else { return };
        let Some(td) = meta.blocked_at else { return };
        let radius_tiles = meta.radius / self.resolution.tile_size;
        self.layers.unblock_disk(NavLayer::Foot, td, radius_tiles, meta.faction);
        self.invalidate_disk_fields(td, radius_tiles);
        if let Some(meta) = self.meta.get_mut(&uid) {
            meta.blocked_at = None;
        }
    }

    /// Drops every cached `NavLayer::Foot` field for a chunk whose cost
    /// layer just changed under a blocker disk. A disk near a chunk
    /// boundary can touch more than one chunk, so this walks every tile
    /// `grid::all_under_circle` reports rather than just the center's own
    /// `chunk()`.
    fn invalidate_disk_fields(&self, center: TileDesc, radius_tiles: f32) {
        let mut seen = FxHashSet::default();
        for td in grid::all_under_circle(&self.resolution, center, radius_tiles) {
            if seen.insert(td.chunk()) {
                self.field_cache.invalidate_chunk(NavLayer::Foot, td.chunk());
            }
        }
    }

    /// Brings every agent's blocker disk in line with its current
    /// `Movestate::blocking` flag — called once at the end of every tick so
    /// every command/state-machine transition that flips `blocking` during
    /// the tick is reflected in the cost layers by the time the next tick's
    /// field builds run.
    fn sync_blockers(&mut self) {
        let uids: Vec<u32> = self.movement.keys().copied().collect();
        for uid in uids {
            let blocking = self.movement.get(&uid).map(|m| m.blocking).unwrap_or(false);
            if blocking {
                self.block_agent(uid);
            } else {
                self.unblock_agent(uid);
            }
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Advances the simulation by one tick: drains and applies commands,
    /// resyncs agents tracking a moving target, steps every agent's state
    /// machine and velocity, disbands arrived flocks, then advances the
    /// tick counter.
    #[nav_macros::profile(4)]
    pub fn tick(&mut self) {
        let pending = self.commands.drain();
        for cmd in pending {
            self.apply_command(cmd);
        }
        self.sync_tracked_targets();
        self.note_gpu_fallback_if_configured();

        self.spatial.rebuild(self.movement.iter().map(|(&uid, m)| (uid, m.next_pos)));

        let dt = self.config.tick_rate.dt();
        let uids: Vec<u32> = self.movement.keys().copied().collect();
        let velocities: Vec<(u32, Vec2)> = self.scheduler.run_bundle(&uids, |&uid| (uid, self.desired_velocity(uid, dt)));

        for (uid, velocity) in velocities {
            if let Some(m) = self.movement.get_mut(&uid) {
                m.prev_pos = m.next_pos;
                m.next_pos = m.next_pos + velocity * dt;
                m.velocity = velocity;
                m.push_velocity(velocity);
                let smoothed = m.smoothed_orientation();
                if smoothed.length_squared() > f32::EPSILON {
                    m.prev_rot = m.next_rot;
                    m.next_rot = smoothed.y.atan2(smoothed.x).to_degrees();
                }
            }
            self.handle_stall(uid, velocity);
        }

        self.advance_states();
        self.flocks.disband_arrived(|uid| self.movement.get(&uid).map(|m| m.state.is_still()).unwrap_or(true));
        self.sync_blockers();
        self.tick_count += 1;
        self.record_tick_metrics();
    }

    /// Pulls this tick's field-cache hit/miss counters and live agent/flock
    /// counts into `self.metrics`, logging at `debug!` level. Never surfaced
    /// as a public query per spec.md's Non-goals — purely ambient
    /// observability for an operator tailing logs.
    fn record_tick_metrics(&mut self) {
        let cache_stats = self.field_cache.take_stats();
        self.metrics = TickMetrics {
            tick: self.tick_count,
            agents: self.movement.len(),
            active_flocks: self.flocks.len(),
            field_cache_hits: cache_stats.hits,
            field_cache_misses: cache_stats.misses,
            field_cache_len: self.field_cache.len(),
        };
        tracing::debug!(
            tick = self.metrics.tick,
            agents = self.metrics.agents,
            active_flocks = self.metrics.active_flocks,
            cache_hits = self.metrics.field_cache_hits,
            cache_misses = self.metrics.field_cache_misses,
            cache_len = self.metrics.field_cache_len,
            "tick complete"
        );
    }

    /// Soft-navigation-failure handling (spec §4.9/§7): an actively seeking
    /// agent whose computed velocity collapses to ~0 mid-journey enters
    /// `Waiting` for `WAIT_TICKS` and retries its state once resumed. If it
    /// stalls again on that retry, it gives up and enters `Arrived` rather
    /// than waiting forever on an unreachable or permanently congested goal.
    fn handle_stall(&mut self, uid: u32, velocity: Vec2) {
        let Some(m) = self.movement.get_mut(&uid) else { return };
        let seeking = matches!(
            m.state,
            AgentState::Moving | AgentState::MovingInFormation | AgentState::ArrivingToCell | AgentState::SeekEnemies | AgentState::SurroundEntity | AgentState::EnterEntityRange
        );
        if !seeking {
            return;
        }
        if velocity.length_squared() > STALL_VELOCITY_EPSILON {
            if let Some(meta) = self.meta.get_mut(&uid) {
                meta.stall_retries = 0;
            }
            return;
        }
        let retries = self.meta.get(&uid).map(|meta| meta.stall_retries).unwrap_or(0);
        if retries >= 1 {
            m.arrive();
            if let Some(meta) = self.meta.get_mut(&uid) {
                meta.stall_retries = 0;
            }
        } else {
            m.begin_wait(m.state);
            if let Some(meta) = self.meta.get_mut(&uid) {
                meta.stall_retries += 1;
            }
        }
    }

    /// Keeps `SeekEnemies`/`SurroundEntity`/`EnterEntityRange` agents
    /// chasing a live position drawn from the current world snapshot rather
    /// than the fixed point they were issued with. An agent whose target can
    /// no longer be resolved (the entity died, or left the snapshot) is
    /// stopped and released from its flock instead of chasing a stale point
    /// forever. No-op until a snapshot has been set at least once.
    fn sync_tracked_targets(&mut self) {
        if self.world.is_none() {
            return;
        }
        let bounds = self.map_bounds();
        let tracked: Vec<u32> = self
            .movement
            .iter()
            .filter(|(_, m)| matches!(m.state, AgentState::SeekEnemies | AgentState::SurroundEntity | AgentState::EnterEntityRange))
            .map(|(&uid, _)| uid)
            .collect();

        for uid in tracked {
            let Some(m) = self.movement.get(&uid) else { continue };
            let state = m.state;
            let agent_pos = m.next_pos;
            let surround_target_uid = m.surround_target_uid;
            let faction = self.meta.get(&uid).map(|meta| meta.faction);

            let resolved = match state {
                AgentState::SeekEnemies => {
                    faction.and_then(|f| self.world.as_ref().and_then(|w| nearest_enemy_position(w, bounds, f, agent_pos)))
                }
                AgentState::SurroundEntity | AgentState::EnterEntityRange => {
                    surround_target_uid.and_then(|t| self.world.as_ref().and_then(|w| w.entity(t)).map(|e| e.pos))
                }
                _ => None,
            };

            let Some(target_pos) = resolved else {
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.stop();
                }
                self.flocks.remove_member(uid);
                continue;
            };

            if state == AgentState::SurroundEntity {
                let dist = agent_pos.distance(target_pos);
                if let Some(m) = self.movement.get_mut(&uid) {
                    if dist <= movement::LOW_WATER {
                        m.using_surround_field = true;
                    } else if dist >= movement::HIGH_WATER {
                        m.using_surround_field = false;
                    }
                }
            }

            let dest = if state == AgentState::SurroundEntity { surround_point(agent_pos, target_pos, movement::LOW_WATER) } else { target_pos };
            self.flocks.retarget_or_issue(uid, dest);
        }
    }

    /// Logs a one-time warning the first tick that observes
    /// `config.velocity_backend == VelocityBackend::Gpu`: no compute-shader
    /// dispatch is wired into this build, so velocities are always computed
    /// on the CPU fork-join path regardless of this setting. Functional
    /// correctness is unaffected, only latency under heavy agent counts.
    fn note_gpu_fallback_if_configured(&mut self) {
        if self.config.velocity_backend == VelocityBackend::Gpu && !self.gpu_fallback_logged {
            tracing::warn!("velocity_backend is configured as Gpu but no compute-shader dispatch is wired into this build; falling back to the CPU fork-join scheduler for every tick");
            self.gpu_fallback_logged = true;
        }
    }

    /// The world-space box covering the whole map, used for unbounded
    /// snapshot queries (e.g. "every enemy anywhere").
    fn map_bounds(&self) -> Box2 {
        let size = Vec2::new(self.resolution.total_cols() as f32 * self.resolution.tile_size, self.resolution.total_rows() as f32 * self.resolution.tile_size);
        Box2::new(self.map_origin, self.map_origin + size)
    }

    fn desired_velocity(&self, uid: u32, dt: f32) -> Vec2 {
        let Some(m) = self.movement.get(&uid) else { return Vec2::ZERO };
        if m.state.is_still() {
            return Vec2::ZERO;
        }

        let target = match m.state {
            AgentState::MovingInFormation | AgentState::ArrivingToCell => m.target_prev_pos,
            _ => match self.flocks.flock_of(uid) {
                Some(flock) => flock.target,
                None => return Vec2::ZERO,
            },
        };

        let seek_dir = if let Some(escape) = self.stuck_escape_dir(m.next_pos) {
            escape
        } else if m.state == AgentState::ArrivingToCell {
            self.cell_field_seek_dir(uid, m.next_pos).unwrap_or_else(|| self.routed_seek_dir(m, target))
        } else if m.state == AgentState::SeekEnemies {
            let faction = self.meta.get(&uid).map(|meta| meta.faction);
            faction
                .and_then(|f| self.enemy_seek_dir(m.next_pos, f))
                .unwrap_or_else(|| self.routed_seek_dir(m, target))
        } else if m.state == AgentState::SurroundEntity && m.using_surround_field {
            m.surround_target_uid
                .and_then(|target_uid| self.surround_field_seek_dir(m.next_pos, target_uid))
                .unwrap_or_else(|| self.routed_seek_dir(m, target))
        } else {
            self.routed_seek_dir(m, target)
        };

        let radius = self.meta.get(&uid).map(|meta| meta.radius).unwrap_or(0.5);
        let nearby = self.spatial.query_radius(m.next_pos, CLEARPATH_NEIGHBOUR_RADIUS, uid);
        let steering_neighbours: Vec<Neighbour> = nearby
            .iter()
            .map(|&(other_uid, pos)| Neighbour {
                pos,
                velocity: self.movement.get(&other_uid).map(|o| o.velocity).unwrap_or(Vec2::ZERO),
            })
            .collect();
        let neighbours: Vec<AvoidanceNeighbour> = nearby
            .into_iter()
            .map(|(other_uid, pos)| AvoidanceNeighbour {
                pos,
                velocity: self.movement.get(&other_uid).map(|o| o.velocity).unwrap_or(Vec2::ZERO),
                radius: self.meta.get(&other_uid).map(|meta| meta.radius).unwrap_or(0.5),
                is_static: self.movement.get(&other_uid).map(|o| o.state.is_still()).unwrap_or(true),
            })
            .collect();

        let (formation_cohesion, formation_alignment, formation_drag) = formation_terms(m);

        let input = SteeringInput {
            pos: m.next_pos,
            velocity: m.velocity,
            max_speed: m.max_speed,
            seek_dir,
            neighbours: &steering_neighbours,
            formation_cohesion,
            formation_alignment,
            formation_drag,
        };
        let steering_force = crate::movement::steering::compute_force(&input, &SteeringWeights::default(), m.max_speed * 4.0);
        let v_pref = movement::integrate_velocity(m.velocity, steering_force, dt, m.max_speed);

        let agent = AvoidanceAgent { pos: m.next_pos, velocity: m.velocity, radius };
        let chosen = crate::movement::avoidance::choose_velocity(&agent, v_pref, m.max_speed, &neighbours);

        let blocked_dir = self.blocked_direction(m.next_pos, chosen);
        movement::clamp_against_wall(chosen, blocked_dir)
    }

    /// Resolves a unit-length seek direction toward `target` by routing
    /// across chunk boundaries via the portal graph and sampling the
    /// resulting flow field, falling back to the straight-line direction
    /// whenever routing data isn't available (off-map points, an
    /// unreachable destination, or a not-yet-rebuilt portal graph).
    fn routed_seek_dir(&self, m: &Movestate, target: Vec2) -> Vec2 {
        let straight = target - m.next_pos;
        if straight.length_squared() <= f32::EPSILON {
            return Vec2::ZERO;
        }
        let fallback = straight.normalize();
        let layer = NavLayer::Foot;

        let Some(from_td) = grid::desc_for_point(&self.resolution, self.map_origin, m.next_pos) else { return fallback };
        let Some(to_td) = grid::desc_for_point(&self.resolution, self.map_origin, target) else { return fallback };

        if from_td.chunk() == to_td.chunk() {
            return self.flow_dir_within_chunk(from_td.chunk(), layer, to_td, m.next_pos, fallback);
        }

        let Some(from_chunk) = self.layers.chunk(layer, from_td.chunk()) else { return fallback };
        let Some(to_chunk) = self.layers.chunk(layer, to_td.chunk()) else { return fallback };
        let from_iid = from_chunk.local_island(from_td.tile_r, from_td.tile_c);
        let to_iid = to_chunk.local_island(to_td.tile_r, to_td.tile_c);

        let graph = &self.portal_graphs[layer.as_index()];
        match route(graph, &self.layers, layer, from_td.chunk(), from_iid, to_td.chunk(), to_iid, target) {
            Some(hops) => match hops.first() {
                Some(hop) => self.flow_dir_within_chunk(from_td.chunk(), layer, hop.portal_desc, m.next_pos, fallback),
                None => self.flow_dir_within_chunk(from_td.chunk(), layer, to_td, m.next_pos, fallback),
            },
            None => self.routed_seek_dir_via_nearest_reachable_portal(layer, graph, from_td, from_iid, m.next_pos, target, fallback),
        }
    }

    /// Soft-navigation-failure redirect: `target`'s chunk/island turned out
    /// unreachable from `from_td`, so steer toward the nearest portal that
    /// *is* reachable instead of giving up outright — the agent ends up
    /// approaching the boundary of the island it's actually confined to
    /// rather than idling until [`NavigationCore::handle_stall`] gives up.
    fn routed_seek_dir_via_nearest_reachable_portal(
        &self,
        layer: NavLayer,
        graph: &PortalGraph,
        from_td: TileDesc,
        from_iid: u16,
        agent_pos: Vec2,
        target: Vec2,
        fallback: Vec2,
    ) -> Vec2 {
        let cc = &self.connected_components[layer.as_index()];
        let Some(portal_td) = cc.nearest_reachable_portal(graph, from_td.chunk(), target) else { return fallback };
        if portal_td.chunk() == from_td.chunk() {
            return self.flow_dir_within_chunk(from_td.chunk(), layer, portal_td, agent_pos, fallback);
        }
        let Some(portal_chunk) = self.layers.chunk(layer, portal_td.chunk()) else { return fallback };
        let portal_iid = portal_chunk.local_island(portal_td.tile_r, portal_td.tile_c);
        match route(graph, &self.layers, layer, from_td.chunk(), from_iid, portal_td.chunk(), portal_iid, target) {
            Some(hops) => match hops.first() {
                Some(hop) => self.flow_dir_within_chunk(from_td.chunk(), layer, hop.portal_desc, agent_pos, fallback),
                None => self.flow_dir_within_chunk(from_td.chunk(), layer, portal_td, agent_pos, fallback),
            },
            None => fallback,
        }
    }

    /// Builds (or reuses) a flow field over `chunk` seeking `target_td` and
    /// samples it at the agent's own tile, converting the stored
    /// [`crate::field::Direction`] into a world-space unit vector. When the
    /// agent already has line-of-sight to the target tile (per a cached LOS
    /// field for the same chunk/target) the direct-to-target heading is used
    /// instead of the flow sample, per spec's desired-velocity selection.
    fn flow_dir_within_chunk(&self, chunk: (u32, u32), layer: NavLayer, target_td: TileDesc, agent_pos: Vec2, fallback: Vec2) -> Vec2 {
        let Some(agent_td) = grid::desc_for_point(&self.resolution, self.map_origin, agent_pos) else { return fallback };
        if agent_td.chunk() != chunk {
            return fallback;
        }

        if self.has_los(chunk, layer, target_td, agent_td) {
            return fallback;
        }

        let field_id = FieldId::for_tile(layer, chunk, target_td);
        let res = &self.resolution;
        let field = self.field_cache.get_or_build(field_id, || {
            let region = ChunkRegion::new(&self.layers, layer, chunk, 0);
            let integration = build_integration_field(res.tile_cols, res.tile_rows, &region, &[(target_td.tile_c, target_td.tile_r)]);
            let flow = build_flow_field(&integration, &region);
            Field::Flow { integration, flow }
        });
        let Field::Flow { flow, .. } = field else { return fallback };

        let dir = flow.get(agent_td.tile_c, agent_td.tile_r);
        let (dc, dr) = dir.step();
        if dc == 0 && dr == 0 {
            return fallback;
        }
        Vec2::new(dc as f32, dr as f32).normalize()
    }

    /// Soft-navigation-failure recovery (spec §4.4/§7's
    /// `update_to_nearest_pathable`): if `pos`'s own tile has gone
    /// impassable (e.g. a terrain edit or another agent's blocker disk
    /// landed under it), builds/reuses an impassable-recovery field there
    /// and returns the direction it reports off the stuck tile. `None`
    /// when the tile is passable (the overwhelmingly common case, checked
    /// first and cheaply) or when no pathable frontier was found within
    /// `IMPASSABLE_RECOVERY_RADIUS` tiles.
    fn stuck_escape_dir(&self, pos: Vec2) -> Option<Vec2> {
        let layer = NavLayer::Foot;
        let td = grid::desc_for_point(&self.resolution, self.map_origin, pos)?;
        let chunk = self.layers.chunk(layer, td.chunk())?;
        if chunk.is_passable(td.tile_r, td.tile_c) {
            return None;
        }

        let field_id = FieldId::for_impassable_recovery(layer, td.chunk(), td);
        let res = &self.resolution;
        let field = self.field_cache.get_or_build(field_id, || {
            match build_impassable_recovery_field(&self.layers, layer, res, td, IMPASSABLE_RECOVERY_RADIUS) {
                Some((_, integration, flow)) => Field::Flow { integration, flow },
                None => Field::Flow { integration: crate::field::IntegrationField::new(1, 1), flow: crate::field::FlowField::new(1, 1) },
            }
        });
        let Field::Flow { integration, .. } = field else { return None };

        let local = IMPASSABLE_RECOVERY_RADIUS;
        let dir = escape_direction(&integration, local, local);
        let (dc, dr) = dir.step();
        if dc == 0 && dr == 0 {
            return None;
        }
        Some(Vec2::new(dc as f32, dr as f32).normalize())
    }

    /// Samples `uid`'s cached cell-arrival field (set by
    /// [`NavigationCore::dispatch_cell_arrival_fields`] when its formation
    /// was issued) at its current position, returning `None` if no field
    /// was cached, has since been evicted, or the agent has wandered
    /// outside the field's window — callers fall back to direct-to-cell
    /// steering in that case.
    fn cell_field_seek_dir(&self, uid: u32, pos: Vec2) -> Option<Vec2> {
        let meta = self.meta.get(&uid)?;
        let field_id = meta.cell_field_id?;
        let (origin_row, origin_col) = meta.cell_field_origin?;
        let field = self.field_cache.get(field_id)?;
        let Field::Flow { flow, .. } = field else { return None };
        let td = grid::desc_for_point(&self.resolution, self.map_origin, pos)?;
        let (row, col) = grid::absolute_of(&self.resolution, td);
        let lx = col - origin_col;
        let ly = row - origin_row;
        if lx < 0 || ly < 0 || lx as u32 >= flow.width || ly as u32 >= flow.height {
            return None;
        }
        let dir = flow.get(lx as u32, ly as u32);
        let (dc, dr) = dir.step();
        if dc == 0 && dr == 0 {
            return None;
        }
        Some(Vec2::new(dc as f32, dr as f32).normalize())
    }

    /// Samples a `SeekEnemies` agent's enemy-seek field (built/reused on
    /// demand over a padded window around the agent's own chunk, per
    /// `faction`), `None` with no world snapshot, no enemy found in the
    /// padded window, or the agent off-map — callers fall back to
    /// `sync_tracked_targets`'s direct-to-nearest-enemy flock steering.
    fn enemy_seek_dir(&self, pos: Vec2, faction: FactionId) -> Option<Vec2> {
        let world = self.world.as_ref()?;
        let layer = NavLayer::Foot;
        let td = grid::desc_for_point(&self.resolution, self.map_origin, pos)?;
        let chunk = td.chunk();
        let (chunk_row, chunk_col) = grid::absolute_of(&self.resolution, TileDesc::new(chunk.0, chunk.1, 0, 0));
        let half_w = (self.resolution.tile_cols / 2) as i64;
        let half_h = (self.resolution.tile_rows / 2) as i64;
        let origin_row = chunk_row - half_h;
        let origin_col = chunk_col - half_w;
        let padded_w = self.resolution.tile_cols * 2;
        let padded_h = self.resolution.tile_rows * 2;

        let min = self.map_origin + Vec2::new(origin_col as f32 * self.resolution.tile_size, origin_row as f32 * self.resolution.tile_size);
        let max = min + Vec2::new(padded_w as f32 * self.resolution.tile_size, padded_h as f32 * self.resolution.tile_size);
        let padded_bounds = Box2::new(min, max);

        let mut enemy_mask = 0u32;
        let mut targets: Vec<(u32, u32)> = Vec::new();
        for e in world.entities_in(padded_bounds) {
            if !world.is_enemy(faction, e.faction) {
                continue;
            }
            if (e.faction as u32) < 32 {
                enemy_mask |= 1 << e.faction;
            }
            let Some(etd) = grid::desc_for_point(&self.resolution, self.map_origin, e.pos) else { continue };
            let (er, ec) = grid::absolute_of(&self.resolution, etd);
            let lx = ec - origin_col;
            let ly = er - origin_row;
            if lx >= 0 && ly >= 0 && (lx as u32) < padded_w && (ly as u32) < padded_h {
                targets.push((lx as u32, ly as u32));
            }
        }
        if targets.is_empty() {
            return None;
        }
        targets.sort_unstable();
        targets.dedup();

        let field_id = FieldId::for_enemies(layer, chunk, faction);
        // Enemy positions move every tick and aren't covered by the usual
        // chunk/layer terrain-edit invalidation, so force a fresh build
        // rather than risk steering agents by a stale enemy location.
        self.field_cache.remove(field_id);
        let res = &self.resolution;
        let layers = &self.layers;
        let field = self.field_cache.get_or_build(field_id, || {
            let region = SpanRegion::new(layers, layer, res, origin_row, origin_col, enemy_mask);
            let (integration, flow) = build_padded_seek_field(res.tile_cols, res.tile_rows, &region, &targets);
            Field::Flow { integration, flow }
        });
        let Field::Flow { flow, .. } = field else { return None };

        let (agent_row, agent_col) = grid::absolute_of(&self.resolution, td);
        let lx = (agent_col - chunk_col) as u32;
        let ly = (agent_row - chunk_row) as u32;
        if lx >= flow.width || ly >= flow.height {
            return None;
        }
        let dir = flow.get(lx, ly);
        let (dc, dr) = dir.step();
        if dc == 0 && dr == 0 {
            return None;
        }
        Some(Vec2::new(dc as f32, dr as f32).normalize())
    }

    /// Samples a `SurroundEntity` agent's per-target surround field once it
    /// has crossed into `LOW_WATER` (`using_surround_field = true`), built/
    /// reused on demand over a padded window around the agent's own chunk.
    /// `None` with no world snapshot, the tracked entity gone, or the agent
    /// off-map — callers fall back to the direct-to-offset-point heading.
    fn surround_field_seek_dir(&self, pos: Vec2, target_uid: u32) -> Option<Vec2> {
        let world = self.world.as_ref()?;
        let target_pos = world.entity(target_uid)?.pos;
        let layer = NavLayer::Foot;
        let td = grid::desc_for_point(&self.resolution, self.map_origin, pos)?;
        let chunk = td.chunk();
        let (chunk_row, chunk_col) = grid::absolute_of(&self.resolution, TileDesc::new(chunk.0, chunk.1, 0, 0));
        let half_w = (self.resolution.tile_cols / 2) as i64;
        let half_h = (self.resolution.tile_rows / 2) as i64;
        let origin_row = chunk_row - half_h;
        let origin_col = chunk_col - half_w;
        let padded_w = self.resolution.tile_cols * 2;
        let padded_h = self.resolution.tile_rows * 2;

        let Some(target_td) = grid::desc_for_point(&self.resolution, self.map_origin, target_pos) else { return None };
        let (tr, tc) = grid::absolute_of(&self.resolution, target_td);
        let lx = tc - origin_col;
        let ly = tr - origin_row;
        if lx < 0 || ly < 0 || (lx as u32) >= padded_w || (ly as u32) >= padded_h {
            return None;
        }
        let targets = [(lx as u32, ly as u32)];

        let field_id = FieldId::for_entity(layer, chunk, target_uid);
        // The surround target moves every tick and isn't covered by the
        // usual chunk/layer terrain-edit invalidation, so force a fresh
        // build rather than risk steering by a stale target location.
        self.field_cache.remove(field_id);
        let res = &self.resolution;
        let layers = &self.layers;
        let field = self.field_cache.get_or_build(field_id, || {
            let region = SpanRegion::new(layers, layer, res, origin_row, origin_col, 0);
            let (integration, flow) = build_padded_seek_field(res.tile_cols, res.tile_rows, &region, &targets);
            Field::Flow { integration, flow }
        });
        let Field::Flow { flow, .. } = field else { return None };

        let (agent_row, agent_col) = grid::absolute_of(&self.resolution, td);
        let ax = (agent_col - chunk_col) as u32;
        let ay = (agent_row - chunk_row) as u32;
        if ax >= flow.width || ay >= flow.height {
            return None;
        }
        let dir = flow.get(ax, ay);
        let (dc, dr) = dir.step();
        if dc == 0 && dr == 0 {
            return None;
        }
        Some(Vec2::new(dc as f32, dr as f32).normalize())
    }

    /// Builds (or reuses) a LOS field for `chunk` seeking `target_td` and
    /// reports whether the agent's own tile is marked visible.
    fn has_los(&self, chunk: (u32, u32), layer: NavLayer, target_td: TileDesc, agent_td: TileDesc) -> bool {
        let field_id = FieldId::for_tile_los(layer, chunk, target_td);
        let res = &self.resolution;
        let field = self.field_cache.get_or_build(field_id, || {
            let region = ChunkRegion::new(&self.layers, layer, chunk, 0);
            let los = build_los_field(res.tile_cols, res.tile_rows, &region, target_td.tile_c, target_td.tile_r);
            Field::Los(los)
        });
        match field {
            Field::Los(los) => los.visible(agent_td.tile_c, agent_td.tile_r),
            _ => false,
        }
    }

    /// Probes one tile ahead along `preferred` and, if it's impassable,
    /// returns that direction so [`movement::clamp_against_wall`] can strip
    /// the velocity component driving the agent into it.
    fn blocked_direction(&self, pos: Vec2, preferred: Vec2) -> Option<Vec2> {
        if preferred.length_squared() <= f32::EPSILON {
            return None;
        }
        let dir = preferred.normalize();
        let probe = pos + dir * self.resolution.tile_size;
        let layer = NavLayer::Foot;
        let td = grid::desc_for_point(&self.resolution, self.map_origin, probe)?;
        let chunk = self.layers.chunk(layer, td.chunk())?;
        if chunk.is_passable(td.tile_r, td.tile_c) {
            None
        } else {
            Some(dir)
        }
    }

    fn advance_states(&mut self) {
        let uids: Vec<u32> = self.movement.keys().copied().collect();
        for uid in uids {
            let target = self.flocks.flock_of(uid).map(|f| f.target);
            let Some(m) = self.movement.get_mut(&uid) else { continue };
            match m.state {
                AgentState::Waiting => {
                    if m.tick_wait() {
                        m.state = m.wait_prev;
                        m.blocking = false;
                    }
                }
                AgentState::Turning => {
                    let (heading, arrived) = movement::step_turn(m.next_rot, m.target_dir);
                    m.next_rot = heading;
                    if arrived {
                        m.arrive();
                    }
                }
                AgentState::Moving | AgentState::SeekEnemies | AgentState::SurroundEntity => {
                    if let Some(target) = target {
                        if m.has_arrived_at(target, ARRIVAL_RADIUS) {
                            m.arrive();
                        }
                    }
                }
                AgentState::EnterEntityRange => {
                    if let Some(target) = target {
                        if m.has_arrived_at(target, m.target_range) {
                            m.arrive();
                        }
                    }
                }
                AgentState::MovingInFormation => {
                    if m.has_arrived_at(m.target_prev_pos, FORMATION_APPROACH_RADIUS) {
                        m.state = AgentState::ArrivingToCell;
                    }
                }
                AgentState::ArrivingToCell => {
                    if m.has_arrived_at(m.target_prev_pos, ARRIVAL_RADIUS) {
                        m.arrive();
                    }
                }
                AgentState::Arrived => {}
            }
        }
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add { uid, pos, radius, faction } => {
                self.movement.insert(uid, Movestate::new(uid, pos, DEFAULT_MAX_SPEED));
                self.meta.insert(uid, AgentMeta { faction, radius, blocked_at: None, stall_retries: 0, cell_field_id: None, cell_field_origin: None });
            }
            Command::Remove { uid } => {
                self.unblock_agent(uid);
                self.movement.remove(&uid);
                self.meta.remove(&uid);
                self.flocks.remove_member(uid);
            }
            Command::Stop { uid } => {
                self.flocks.remove_member(uid);
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.stop();
                }
            }
            Command::SetDest { uid, target, attack } => {
                self.flocks.issue(&[uid], target, attack);
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.state = AgentState::Moving;
                    m.blocking = false;
                }
            }
            Command::ChangeDirection { uid, dir_deg } => {
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.target_dir = dir_deg;
                    m.state = AgentState::Turning;
                }
            }
            Command::SetEnterRange { uid, target_uid, range } => {
                self.flocks.remove_member(uid);
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.surround_target_uid = Some(target_uid);
                    m.target_range = range;
                    m.state = AgentState::EnterEntityRange;
                    m.blocking = false;
                }
            }
            Command::SetSeekEnemies { uid } => {
                self.flocks.remove_member(uid);
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.state = AgentState::SeekEnemies;
                    m.blocking = false;
                }
            }
            Command::SetSurroundEntity { uid, target_uid } => {
                self.flocks.remove_member(uid);
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.surround_target_uid = Some(target_uid);
                    m.state = AgentState::SurroundEntity;
                    m.blocking = false;
                }
            }
            Command::UpdatePos { uid, pos } => {
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.prev_pos = pos;
                    m.next_pos = pos;
                }
            }
            Command::UpdateFactionId { uid, new, .. } => {
                // Unblock with the old faction slot first; `sync_blockers`
                // re-blocks under the new one at the end of the tick.
                self.unblock_agent(uid);
                if let Some(meta) = self.meta.get_mut(&uid) {
                    meta.faction = new;
                }
            }
            Command::UpdateSelectionRadius { uid, radius } => {
                // Same reasoning: re-block at the new radius, not the old one.
                self.unblock_agent(uid);
                if let Some(meta) = self.meta.get_mut(&uid) {
                    meta.radius = radius;
                }
            }
            Command::SetMaxSpeed { uid, max_speed } => {
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.max_speed = max_speed;
                }
            }
            Command::MakeFlocks { selection, target, orientation, formation_type, attack } => {
                self.make_flocks(&selection, target, orientation, formation_type, attack);
            }
            Command::Unblock { uid } => {
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.blocking = false;
                }
            }
            Command::BlockAt { uid, pos } => {
                // Unblock at the old position first; `sync_blockers`
                // re-blocks at `pos` at the end of the tick.
                self.unblock_agent(uid);
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.next_pos = pos;
                    m.arrive();
                }
            }
        }
    }

    fn make_flocks(&mut self, selection: &[u32], target: Vec2, orientation: Option<Vec2>, formation_type: FormationType, attack: bool) {
        self.flocks.issue(selection, target, attack);

        if formation_type == FormationType::None {
            for &uid in selection {
                if let Some(m) = self.movement.get_mut(&uid) {
                    m.state = AgentState::Moving;
                    m.blocking = false;
                }
            }
            return;
        }

        let ents: Vec<(u32, Vec2, u32)> = selection
            .iter()
            .filter_map(|&uid| {
                let pos = self.movement.get(&uid)?.next_pos;
                let type_id = self.world.as_ref().and_then(|w| w.entity(uid)).map(|e| e.flags & 0xFF).unwrap_or(0);
                Some((uid, pos, type_id))
            })
            .collect();
        let formation = formation::create(&self.layers, NavLayer::Foot, self.map_origin, target, orientation, &ents, formation_type);
        let facing_dir = formation.orientation.y.atan2(formation.orientation.x).to_degrees();

        for &uid in selection {
            if let Some(m) = self.movement.get_mut(&uid) {
                m.state = AgentState::MovingInFormation;
                m.blocking = false;
                m.target_dir = facing_dir;
                // Falls back to the shared target until a cell is assigned below,
                // for any unit a formation this size has no slot for.
                m.target_prev_pos = target;
            }
        }

        let mut cell_assignments: Vec<(u32, TileDesc)> = Vec::new();
        for sub in &formation.subformations {
            for (_, cell) in sub.placed_cells() {
                if let Some(uid) = cell.assigned_uid {
                    if let Some(m) = self.movement.get_mut(&uid) {
                        m.target_prev_pos = cell.final_pos;
                    }
                    if let Some(cell_td) = cell.snapped {
                        cell_assignments.push((uid, cell_td));
                    }
                }
            }
        }

        self.dispatch_cell_arrival_fields(formation.field_center, &cell_assignments);
    }

    /// Dispatches per-agent cell-arrival field builds for a just-issued
    /// formation, fanned out across the scheduler's workers since each
    /// build is independent. Builds a field once per distinct cell (shared
    /// by whichever agent is first through `field_cache.get_or_build`) and
    /// records its id/origin on every agent assigned to that cell, so
    /// `desired_velocity`'s `ArrivingToCell` branch can sample it instead of
    /// steering directly at the cell's point position.
    fn dispatch_cell_arrival_fields(&mut self, field_center: Vec2, cell_assignments: &[(u32, TileDesc)]) {
        if cell_assignments.is_empty() {
            return;
        }
        let Some(center_td) = grid::desc_for_point(&self.resolution, self.map_origin, field_center) else { return };
        let layer = NavLayer::Foot;
        let center_chunk = center_td.chunk();
        let (center_row, center_col) = grid::absolute_of(&self.resolution, center_td);
        let half = (crate::field::builder::CELL_ARRIVAL_REGION / 2) as i64;
        let origin = (center_row - half, center_col - half);

        let resolved: Vec<(u32, Option<FieldId>)> = self.scheduler.run_bundle(cell_assignments, |&(uid, cell_td)| {
            let field_id = FieldId::for_cell_arrival(layer, center_chunk, cell_td);
            if self.field_cache.get(field_id).is_some() {
                return (uid, Some(field_id));
            }
            match build_cell_arrival_field(&self.layers, layer, &self.resolution, center_td, cell_td) {
                Some((_, integration, flow)) => {
                    self.field_cache.get_or_build(field_id, || Field::Flow { integration, flow });
                    (uid, Some(field_id))
                }
                None => (uid, None),
            }
        });

        for (uid, field_id) in resolved {
            if let Some(meta) = self.meta.get_mut(&uid) {
                meta.cell_field_id = field_id;
                meta.cell_field_origin = field_id.map(|_| origin);
            }
        }
    }

    // -- Queries --

    pub fn still(&self, uid: u32) -> bool {
        self.movement.get(&uid).map(|m| m.state.is_still()).unwrap_or(true)
    }

    pub fn get_dest(&self, uid: u32) -> Option<Vec2> {
        self.flocks.flock_of(uid).map(|f| f.target)
    }

    pub fn get_surrounding(&self, uid: u32) -> Option<u32> {
        self.movement.get(&uid).and_then(|m| m.surround_target_uid)
    }

    /// `GetMaxSpeed`, honouring a pending `SetMaxSpeed` that hasn't applied
    /// yet.
    pub fn get_max_speed(&mut self, uid: u32) -> Option<f32> {
        if let Some(Command::SetMaxSpeed { max_speed, .. }) = self.commands.snoop_latest_for(uid) {
            return Some(*max_speed);
        }
        self.movement.get(&uid).map(|m| m.max_speed)
    }

    pub fn in_target_mode(&self, uid: u32) -> bool {
        matches!(
            self.movement.get(&uid).map(|m| m.state),
            Some(AgentState::SeekEnemies) | Some(AgentState::SurroundEntity) | Some(AgentState::EnterEntityRange)
        )
    }

    pub fn last_cmd_dest(&self) -> Option<DestId> {
        self.flocks.last_cmd_dest()
    }

    // -- Persistence --

    pub fn save_data(&self) -> SaveData {
        let agents = self.movement.values().map(SavedAgent::from_movestate).collect();
        let flocks = self.flocks.flocks().cloned().collect();
        let agent_meta = self.meta.iter().map(|(&uid, m)| SavedAgentMeta { uid, faction: m.faction, radius: m.radius }).collect();
        SaveData::new(&self.config, flocks, agents, agent_meta)
    }

    /// Loads `data`, applying pending commands first to bring the
    /// simulation into a known state (per spec's savefile-loading
    /// procedure), then overwriting. `last_stop_pos`/`last_stop_radius`
    /// aren't re-derived here — `Movestate` already round-trips them
    /// losslessly, so map integrity survives without reconstruction.
    /// Rebuilds every restored agent's blocker disk so cost-layer state
    /// stays consistent with the restored `blocking` flags.
    pub fn restore(&mut self, data: SaveData) {
        let pending = self.commands.drain();
        for cmd in pending {
            self.apply_command(cmd);
        }

        for uid in self.movement.keys().copied().collect::<Vec<_>>() {
            self.unblock_agent(uid);
        }

        self.config.click_move_enabled = data.click_move_enabled;
        self.flocks.restore(data.flocks);
        self.movement.clear();
        self.meta.clear();
        for saved in data.agents {
            let m = saved.into_movestate();
            self.movement.insert(m.uid, m);
        }
        for meta in data.agent_meta {
            self.meta.insert(
                meta.uid,
                AgentMeta { faction: meta.faction, radius: meta.radius, blocked_at: None, stall_retries: 0, cell_field_id: None, cell_field_origin: None },
            );
        }
        self.sync_blockers();
    }
}

/// The nearest entity snapshot position which `faction` is at war with,
/// among every entity currently in `bounds`.
fn nearest_enemy_position(world: &Snapshot, bounds: Box2, faction: FactionId, from: Vec2) -> Option<Vec2> {
    world
        .entities_in(bounds)
        .filter(|e| world.is_enemy(faction, e.faction))
        .min_by(|a, b| a.pos.distance(from).partial_cmp(&b.pos.distance(from)).unwrap_or(std::cmp::Ordering::Equal))
        .map(|e| e.pos)
}

/// A point `range` away from `target_pos`, on the side facing `from` — the
/// stopping point an agent surrounding `target_pos` approaches.
fn surround_point(from: Vec2, target_pos: Vec2, range: f32) -> Vec2 {
    let away = from - target_pos;
    let dir = if away.length_squared() > f32::EPSILON { away.normalize() } else { Vec2::new(1.0, 0.0) };
    target_pos + dir * range
}

/// Formation-specific steering terms: zero outside a formation state,
/// otherwise a heading-alignment pull toward the formation's facing, plus
/// (once close enough to switch into [`AgentState::ArrivingToCell`]) a
/// cohesion pull toward the assigned cell and a damping term to settle
/// cleanly instead of overshooting.
fn formation_terms(m: &Movestate) -> (Vec2, Vec2, Vec2) {
    match m.state {
        AgentState::MovingInFormation => (Vec2::ZERO, facing_alignment(m), Vec2::ZERO),
        AgentState::ArrivingToCell => {
            let to_cell = m.target_prev_pos - m.next_pos;
            let cohesion = if to_cell.length_squared() > f32::EPSILON { to_cell.normalize() * m.max_speed } else { Vec2::ZERO };
            (cohesion, facing_alignment(m), m.velocity * -FORMATION_DAMPING)
        }
        _ => (Vec2::ZERO, Vec2::ZERO, Vec2::ZERO),
    }
}

fn facing_alignment(m: &Movestate) -> Vec2 {
    let rad = m.target_dir.to_radians();
    Vec2::new(rad.cos(), rad.sin()) * m.max_speed - m.velocity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{EntityFlags, EntitySource};

    fn test_core() -> NavigationCore {
        let res = MapResolution { chunks_wide: 2, chunks_high: 2, tile_cols: 8, tile_rows: 8, tile_size: 1.0 };
        NavigationCore::new(Config::default(), res, Vec2::ZERO)
    }

    struct FakeWorld {
        entities: Vec<(u32, Vec2, FactionId)>,
    }
    impl EntitySource for FakeWorld {
        fn ents_in_rect(&self, _bounds: Box2) -> Vec<u32> {
            self.entities.iter().map(|&(uid, _, _)| uid).collect()
        }
        fn position(&self, uid: u32) -> Option<Vec2> {
            self.entities.iter().find(|&&(u, _, _)| u == uid).map(|&(_, p, _)| p)
        }
        fn faction(&self, uid: u32) -> Option<FactionId> {
            self.entities.iter().find(|&&(u, _, _)| u == uid).map(|&(_, _, f)| f)
        }
        fn flags(&self, _uid: u32) -> Option<EntityFlags> {
            Some(0)
        }
        fn aabb_half_extent(&self, _uid: u32) -> Option<f32> {
            Some(0.5)
        }
        fn is_enemy(&self, a: FactionId, b: FactionId) -> bool {
            a != b
        }
        fn fog_visible(&self, _faction: FactionId, _pos: Vec2) -> bool {
            true
        }
    }

    fn map_snapshot(entities: Vec<(u32, Vec2, FactionId)>) -> Snapshot {
        let world = FakeWorld { entities };
        let bounds = Box2::new(Vec2::ZERO, Vec2::new(16.0, 16.0));
        Snapshot::build(&world, bounds, [(0, 1), (1, 0)], [])
    }

    #[test]
    fn add_then_set_dest_moves_an_agent_toward_its_target() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::SetDest { uid: 1, target: Vec2::new(5.0, 0.0), attack: false });
        for _ in 0..5 {
            core.tick();
        }
        let m = core.movestate(1).unwrap();
        assert!(m.next_pos.x > 0.0);
    }

    #[test]
    fn tick_metrics_reports_agent_count_and_resets_cache_counters_each_tick() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::SetDest { uid: 1, target: Vec2::new(5.0, 0.0), attack: false });
        core.tick();
        let first = core.tick_metrics();
        assert_eq!(first.tick, 1);
        assert_eq!(first.agents, 1);
        assert_eq!(first.active_flocks, 1);
        assert!(first.field_cache_hits + first.field_cache_misses > 0);

        core.tick();
        let second = core.tick_metrics();
        assert_eq!(second.tick, 2);
        assert!(second.field_cache_hits + second.field_cache_misses > 0);
    }

    #[test]
    fn gpu_backend_falls_back_to_cpu_computation() {
        let res = MapResolution { chunks_wide: 2, chunks_high: 2, tile_cols: 8, tile_rows: 8, tile_size: 1.0 };
        let config = Config { velocity_backend: VelocityBackend::Gpu, ..Config::default() };
        let mut core = NavigationCore::new(config, res, Vec2::ZERO);
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::SetDest { uid: 1, target: Vec2::new(5.0, 0.0), attack: false });
        for _ in 0..5 {
            core.tick();
        }
        let m = core.movestate(1).unwrap();
        assert!(m.next_pos.x > 0.0);
        assert!(core.gpu_fallback_logged);
    }

    #[test]
    fn stop_returns_an_agent_to_arrived() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::ZERO, radius: 0.5, faction: 0 });
        core.push_command(Command::SetDest { uid: 1, target: Vec2::new(5.0, 0.0), attack: false });
        core.tick();
        core.push_command(Command::Stop { uid: 1 });
        core.tick();
        assert!(core.still(1));
    }

    #[test]
    fn nearby_agents_separate_instead_of_overlapping() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::Add { uid: 2, pos: Vec2::new(0.2, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::SetDest { uid: 1, target: Vec2::new(5.0, 0.0), attack: false });
        core.push_command(Command::SetDest { uid: 2, target: Vec2::new(5.0, 0.0), attack: false });
        for _ in 0..10 {
            core.tick();
        }
        let a = core.movestate(1).unwrap().next_pos;
        let b = core.movestate(2).unwrap().next_pos;
        let dist = ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt();
        assert!(dist > 0.2, "agents should separate rather than stay overlapped, dist={dist}");
    }

    #[test]
    fn remove_drops_the_agent_from_queries() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::ZERO, radius: 0.5, faction: 0 });
        core.tick();
        core.push_command(Command::Remove { uid: 1 });
        core.tick();
        assert!(core.movestate(1).is_none());
    }

    #[test]
    fn save_then_restore_round_trips_agent_state() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(2.0, 3.0), radius: 0.5, faction: 0 });
        core.tick();
        let data = core.save_data();

        let mut restored = test_core();
        restored.restore(data);
        assert!(restored.movestate(1).is_some());
    }

    #[test]
    fn seek_enemies_is_inert_without_a_world_snapshot_but_wakes_once_one_is_set() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::Add { uid: 2, pos: Vec2::new(8.0, 0.0), radius: 0.5, faction: 1 });
        core.tick();

        core.push_command(Command::SetSeekEnemies { uid: 1 });
        core.tick();
        assert_eq!(core.movestate(1).unwrap().next_pos, Vec2::new(0.0, 0.0));

        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(0.0, 0.0), 0), (2, Vec2::new(8.0, 0.0), 1)]));
        for _ in 0..5 {
            core.tick();
        }
        assert!(core.movestate(1).unwrap().next_pos.x > 0.0);
    }

    #[test]
    fn enemy_seek_dir_points_toward_an_enemy_in_the_padded_window() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.tick();
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(0.0, 0.0), 0), (2, Vec2::new(5.0, 0.0), 1)]));
        let dir = core.enemy_seek_dir(Vec2::new(0.0, 0.0), 0).expect("an enemy inside the padded window should yield a direction");
        assert!(dir.x > 0.0, "should steer toward the positive-x enemy, got {dir:?}");
    }

    #[test]
    fn enemy_seek_dir_is_none_with_no_enemy_nearby() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.tick();
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(0.0, 0.0), 0)]));
        assert!(core.enemy_seek_dir(Vec2::new(0.0, 0.0), 0).is_none());
    }

    #[test]
    fn seek_enemies_stops_once_its_target_leaves_the_snapshot() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.tick();
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(0.0, 0.0), 0)]));
        core.push_command(Command::SetSeekEnemies { uid: 1 });
        core.tick();
        assert!(core.still(1));
    }

    #[test]
    fn change_direction_rotates_toward_the_target_heading_instead_of_snapping() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.tick();
        core.push_command(Command::ChangeDirection { uid: 1, dir_deg: 90.0 });
        core.tick();
        let m = core.movestate(1).unwrap();
        assert_eq!(m.state, AgentState::Turning, "a 90 degree turn exceeds one tick's MAX_TURN_RATE_DEG, so it should still be turning");
        assert!(m.next_rot > 0.0 && m.next_rot < 90.0);

        for _ in 0..20 {
            core.tick();
        }
        let m = core.movestate(1).unwrap();
        assert_eq!(m.state, AgentState::Arrived);
        assert!((m.next_rot - 90.0).abs() <= movement::TURN_ARRIVED_THRESHOLD_DEG);
    }

    #[test]
    fn surround_entity_toggles_field_use_at_low_and_high_water_with_hysteresis() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::Add { uid: 2, pos: Vec2::new(10.0, 0.0), radius: 0.5, faction: 1 });
        core.tick();
        core.push_command(Command::SetSurroundEntity { uid: 1, target_uid: 2 });
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(0.0, 0.0), 0), (2, Vec2::new(10.0, 0.0), 1)]));
        core.tick();
        assert!(!core.movestate(1).unwrap().using_surround_field, "far outside LOW_WATER, the field should not be engaged yet");

        // Well inside LOW_WATER: the field engages.
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(8.0, 0.0), 0), (2, Vec2::new(9.5, 0.0), 1)]));
        core.tick();
        assert!(core.movestate(1).unwrap().using_surround_field);

        // Still inside the band between LOW_WATER and HIGH_WATER: no toggle.
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(8.0, 0.0), 0), (2, Vec2::new(12.5, 0.0), 1)]));
        core.tick();
        assert!(core.movestate(1).unwrap().using_surround_field, "oscillating inside one band must not toggle the flag");

        // Past HIGH_WATER: the field disengages.
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(0.0, 0.0), 0), (2, Vec2::new(20.0, 0.0), 1)]));
        core.tick();
        assert!(!core.movestate(1).unwrap().using_surround_field);
    }

    #[test]
    fn enter_entity_range_arrives_once_within_the_requested_range() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(10.0, 0.0), radius: 0.5, faction: 0 });
        core.push_command(Command::Add { uid: 2, pos: Vec2::new(0.0, 0.0), radius: 0.5, faction: 1 });
        core.tick();
        core.set_world_snapshot(map_snapshot(vec![(1, Vec2::new(10.0, 0.0), 0), (2, Vec2::new(0.0, 0.0), 1)]));

        core.push_command(Command::SetEnterRange { uid: 1, target_uid: 2, range: 2.0 });
        for _ in 0..80 {
            core.set_world_snapshot(map_snapshot(vec![(1, core.movestate(1).unwrap().next_pos, 0), (2, Vec2::new(0.0, 0.0), 1)]));
            core.tick();
        }
        assert!(core.still(1));
        assert!(core.movestate(1).unwrap().next_pos.distance(Vec2::new(0.0, 0.0)) <= 3.0);
    }

    #[test]
    fn formation_members_reach_arriving_to_cell_or_arrived() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(1.0, 1.0), radius: 0.5, faction: 0 });
        core.push_command(Command::Add { uid: 2, pos: Vec2::new(1.5, 1.0), radius: 0.5, faction: 0 });
        core.tick();
        core.push_command(Command::MakeFlocks {
            selection: vec![1, 2],
            target: Vec2::new(6.0, 6.0),
            orientation: Some(Vec2::new(1.0, 0.0)),
            formation_type: FormationType::Rank,
            attack: false,
        });
        for _ in 0..80 {
            core.tick();
        }
        let m1 = core.movestate(1).unwrap();
        assert!(matches!(m1.state, AgentState::ArrivingToCell | AgentState::Arrived), "expected formation progress, got {:?}", m1.state);
    }

    #[test]
    fn make_flocks_dispatches_a_cell_arrival_field_per_assigned_agent() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(1.0, 1.0), radius: 0.5, faction: 0 });
        core.push_command(Command::Add { uid: 2, pos: Vec2::new(1.5, 1.0), radius: 0.5, faction: 0 });
        core.tick();
        core.push_command(Command::MakeFlocks {
            selection: vec![1, 2],
            target: Vec2::new(6.0, 6.0),
            orientation: Some(Vec2::new(1.0, 0.0)),
            formation_type: FormationType::Rank,
            attack: false,
        });
        core.tick();

        let meta1 = core.meta.get(&1).unwrap();
        assert!(meta1.cell_field_id.is_some(), "expected a cell-arrival field to be cached for a formation member");
        assert!(meta1.cell_field_origin.is_some());
        assert!(core.field_cache.get(meta1.cell_field_id.unwrap()).is_some());
    }

    #[test]
    fn flow_dir_within_chunk_uses_direct_heading_when_los_is_clear() {
        let core = test_core();
        let agent_pos = Vec2::new(1.5, 1.5);
        let agent_td = grid::desc_for_point(&core.resolution, core.map_origin, agent_pos).unwrap();
        let target_td = grid::desc_for_point(&core.resolution, core.map_origin, Vec2::new(6.5, 1.5)).unwrap();
        assert!(core.has_los(agent_td.chunk(), NavLayer::Foot, target_td, agent_td));

        let fallback = Vec2::new(0.0, 1.0);
        let dir = core.flow_dir_within_chunk(agent_td.chunk(), NavLayer::Foot, target_td, agent_pos, fallback);
        assert!(dir.x > 0.9 && dir.y.abs() < 0.2, "expected a direct +x heading on open ground, got {:?}", dir);
    }

    #[test]
    fn blocking_an_agent_invalidates_the_chunk_its_disk_touches() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(4.0, 4.0), radius: 0.5, faction: 0 });
        core.tick();

        let target_td = grid::desc_for_point(&core.resolution, core.map_origin, Vec2::new(7.0, 4.0)).unwrap();
        let field_id = FieldId::for_tile(NavLayer::Foot, target_td.chunk(), target_td);
        core.field_cache.get_or_build(field_id, || {
            Field::Flow { integration: crate::field::IntegrationField::new(1, 1), flow: crate::field::FlowField::new(1, 1) }
        });
        assert!(core.field_cache.get(field_id).is_some());

        core.push_command(Command::BlockAt { uid: 1, pos: Vec2::new(4.0, 4.0) });
        core.tick();

        assert!(core.field_cache.get(field_id).is_none(), "blocking a disk in this chunk should have invalidated its cached fields");
    }

    #[test]
    fn an_agent_pushed_onto_an_impassable_tile_steers_back_toward_pathable_ground() {
        let mut core = test_core();
        core.push_command(Command::Add { uid: 1, pos: Vec2::new(4.0, 4.0), radius: 0.5, faction: 0 });
        core.push_command(Command::SetDest { uid: 1, target: Vec2::new(10.0, 4.0), attack: false });
        core.tick();

        let stuck_td = grid::desc_for_point(&core.resolution, core.map_origin, Vec2::new(4.0, 4.0)).unwrap();
        core.layers.set_cost(NavLayer::Foot, stuck_td, crate::cost::IMPASSABLE);

        let dir = core.stuck_escape_dir(Vec2::new(4.0, 4.0));
        assert!(dir.is_some(), "expected an escape direction off a newly-impassable tile");
    }

    #[test]
    fn unreachable_destination_redirects_toward_the_nearest_reachable_portal() {
        let res = MapResolution { chunks_wide: 3, chunks_high: 1, tile_cols: 4, tile_rows: 4, tile_size: 1.0 };
        let mut core = NavigationCore::new(Config::default(), res, Vec2::ZERO);
        for tr in 0..4 {
            core.layers.set_cost(NavLayer::Foot, TileDesc::new(0, 2, tr, 0), crate::cost::IMPASSABLE);
            core.layers.set_cost(NavLayer::Foot, TileDesc::new(0, 1, tr, 3), crate::cost::IMPASSABLE);
        }
        core.rebuild_portals(NavLayer::Foot);

        let m = Movestate::new(1, Vec2::new(0.5, 0.5), 5.0);
        let target = Vec2::new(10.5, 0.5);
        let dir = core.routed_seek_dir(&m, target);
        assert!(dir.length() > 0.5, "expected a real heading toward the reachable frontier, got {:?}", dir);
        assert!(dir.x > 0.0, "expected the reachable frontier to sit further along +x than the agent, got {:?}", dir);
    }
}

//! Gamestate snapshot taken once per tick so movement computation can
//! proceed concurrently with foreground mutations.
//!
//! Grounded on `simulation/resources.rs`'s cache-style resources that
//! systems read during a tick without touching the live world state —
//! generalized here into one explicit, externally-sourced value rather
//! than several Bevy `Resource`s.

use crate::cost::FactionId;
use crate::math::{Box2, Vec2};
use rustc_hash::FxHashMap;

/// Per-entity flags the snapshot copies verbatim (selection, visibility to
/// the local player, etc. — opaque to this crate beyond "copy them").
pub type EntityFlags = u32;

/// The narrow read capability the core needs from the external world:
/// a rectangular entity query plus a handful of per-entity lookups.
pub trait EntitySource {
    fn ents_in_rect(&self, bounds: Box2) -> Vec<u32>;
    fn position(&self, uid: u32) -> Option<Vec2>;
    fn faction(&self, uid: u32) -> Option<FactionId>;
    fn flags(&self, uid: u32) -> Option<EntityFlags>;
    fn aabb_half_extent(&self, uid: u32) -> Option<f32>;
    fn is_enemy(&self, a: FactionId, b: FactionId) -> bool;
    fn fog_visible(&self, faction: FactionId, pos: Vec2) -> bool;
}

/// One entity's state as of the snapshot, deep-copied out of the external
/// source.
#[derive(Clone, Copy, Debug)]
pub struct EntitySnapshot {
    pub uid: u32,
    pub pos: Vec2,
    pub faction: FactionId,
    pub flags: EntityFlags,
    pub aabb_half_extent: f32,
}

/// Immutable-for-the-tick copy of everything movement computation reads
/// from outside the core. Built once per tick,
/// released the next.
pub struct Snapshot {
    entities: FxHashMap<u32, EntitySnapshot>,
    diplomacy: FxHashMap<(FactionId, FactionId), bool>,
    fog: FxHashMap<(FactionId, u32), bool>,
}

impl Snapshot {
    /// Builds a fresh snapshot of every entity within `bounds` (the whole
    /// map, typically), plus diplomacy and fog answers for exactly the
    /// `(faction, faction)` and `(faction, uid)` pairs the caller names —
    /// computing every possible pair up front would be wasted work most
    /// ticks touch only a handful of factions.
    pub fn build(
        source: &dyn EntitySource,
        bounds: Box2,
        faction_pairs: impl IntoIterator<Item = (FactionId, FactionId)>,
        fog_queries: impl IntoIterator<Item = (FactionId, u32)>,
    ) -> Self {
        let mut entities = FxHashMap::default();
        for uid in source.ents_in_rect(bounds) {
            let Some(pos) = source.position(uid) else { continue };
            let faction = source.faction(uid).unwrap_or(0);
            let flags = source.flags(uid).unwrap_or(0);
            let aabb_half_extent = source.aabb_half_extent(uid).unwrap_or(0.5);
            entities.insert(uid, EntitySnapshot { uid, pos, faction, flags, aabb_half_extent });
        }

        let mut diplomacy = FxHashMap::default();
        for (a, b) in faction_pairs {
            diplomacy.insert((a, b), source.is_enemy(a, b));
        }

        let mut fog = FxHashMap::default();
        for (faction, uid) in fog_queries {
            if let Some(&EntitySnapshot { pos, .. }) = entities.get(&uid) {
                fog.insert((faction, uid), source.fog_visible(faction, pos));
            }
        }

        Self { entities, diplomacy, fog }
    }

    pub fn entity(&self, uid: u32) -> Option<&EntitySnapshot> {
        self.entities.get(&uid)
    }

    pub fn is_enemy(&self, a: FactionId, b: FactionId) -> bool {
        self.diplomacy.get(&(a, b)).copied().unwrap_or(false)
    }

    pub fn is_visible(&self, faction: FactionId, uid: u32) -> bool {
        self.fog.get(&(faction, uid)).copied().unwrap_or(true)
    }

    pub fn entities_in(&self, bounds: Box2) -> impl Iterator<Item = &EntitySnapshot> {
        self.entities.values().filter(move |e| bounds.contains(e.pos))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

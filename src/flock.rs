//! Flock grouping: agents that currently share one destination.
//!
//! New — agents were never previously grouped by shared destination; the
//! merge-on-reissue decision is recorded in DESIGN.md.

use crate::math::Vec2;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Opaque destination identifier, assigned when a flock is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestId(pub u64);

/// A set of agents sharing one destination id plus the cached XZ target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flock {
    pub dest_id: DestId,
    pub target: Vec2,
    pub attack: bool,
    pub members: Vec<u32>,
}

impl Flock {
    pub fn new(dest_id: DestId, target: Vec2, attack: bool, members: Vec<u32>) -> Self {
        Self { dest_id, target, attack, members }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Owns every live [`Flock`] and the `s_last_cmd_dest`-equivalent pointer
/// to the most recently issued one.
#[derive(Default)]
pub struct FlockTable {
    flocks: FxHashMap<DestId, Flock>,
    member_of: FxHashMap<u32, DestId>,
    next_dest_id: u64,
    /// The destination id of the flock most recently created by a command,
    /// even when that flock was immediately merged into an existing one
    /// (Open Question 1 — see DESIGN.md).
    last_cmd_dest: Option<DestId>,
}

impl FlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_dest_id(&mut self) -> DestId {
        let id = DestId(self.next_dest_id);
        self.next_dest_id += 1;
        id
    }

    /// Issues a move command for `members` toward `target`: if every member
    /// already belongs to the same single existing flock with the same
    /// target/attack flag, that flock is reused; members
    /// are otherwise pulled out of their previous flocks (which are dropped
    /// if left empty) into a freshly created one. Returns the resulting
    /// [`DestId`], which is also recorded as `last_cmd_dest`.
    pub fn issue(&mut self, members: &[u32], target: Vec2, attack: bool) -> DestId {
        if let Some(existing) = self.reusable_existing(members, target, attack) {
            self.last_cmd_dest = Some(existing);
            return existing;
        }

        for &uid in members {
            self.remove_member(uid);
        }
        let dest_id = self.alloc_dest_id();
        for &uid in members {
            self.member_of.insert(uid, dest_id);
        }
        self.flocks.insert(dest_id, Flock::new(dest_id, target, attack, members.to_vec()));
        self.last_cmd_dest = Some(dest_id);
        dest_id
    }

    /// Updates the target of whichever flock `uid` already belongs to
    /// in place, or issues a fresh single-member flock at `target` if it has
    /// none — used to track a moving point (an enemy, a surrounded entity)
    /// without reallocating a [`DestId`] every tick the point shifts.
    pub fn retarget_or_issue(&mut self, uid: u32, target: Vec2) -> DestId {
        if let Some(&dest_id) = self.member_of.get(&uid) {
            if let Some(flock) = self.flocks.get_mut(&dest_id) {
                flock.target = target;
                return dest_id;
            }
        }
        self.issue(&[uid], target, false)
    }

    fn reusable_existing(&self, members: &[u32], target: Vec2, attack: bool) -> Option<DestId> {
        if members.is_empty() {
            return None;
        }
        let first_dest = *self.member_of.get(&members[0])?;
        let flock = self.flocks.get(&first_dest)?;
        if flock.target != target || flock.attack != attack {
            return None;
        }
        let same_membership = members.len() == flock.members.len() && members.iter().all(|uid| self.member_of.get(uid) == Some(&first_dest));
        same_membership.then_some(first_dest)
    }

    /// Removes `uid` from whichever flock it belongs to, dropping that
    /// flock if it becomes empty.
    pub fn remove_member(&mut self, uid: u32) {
        if let Some(dest_id) = self.member_of.remove(&uid) {
            if let Some(flock) = self.flocks.get_mut(&dest_id) {
                flock.members.retain(|&m| m != uid);
                if flock.members.is_empty() {
                    self.flocks.remove(&dest_id);
                }
            }
        }
    }

    pub fn flock_of(&self, uid: u32) -> Option<&Flock> {
        self.member_of.get(&uid).and_then(|d| self.flocks.get(d))
    }

    pub fn get(&self, dest_id: DestId) -> Option<&Flock> {
        self.flocks.get(&dest_id)
    }

    /// The destination id of the most recently issued command (Open
    /// Question 1).
    pub fn last_cmd_dest(&self) -> Option<DestId> {
        self.last_cmd_dest
    }

    /// Disbands every flock all of whose members satisfy `is_arrived`.
    pub fn disband_arrived(&mut self, mut is_arrived: impl FnMut(u32) -> bool) {
        let disbanding: Vec<DestId> = self
            .flocks
            .iter()
            .filter(|(_, f)| f.members.iter().all(|&uid| is_arrived(uid)))
            .map(|(id, _)| *id)
            .collect();
        for dest_id in disbanding {
            if let Some(flock) = self.flocks.remove(&dest_id) {
                for uid in flock.members {
                    self.member_of.remove(&uid);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.flocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flocks.is_empty()
    }

    /// Every live flock, for persistence.
    pub fn flocks(&self) -> impl Iterator<Item = &Flock> {
        self.flocks.values()
    }

    /// Rebuilds the table from a saved flock list, replacing any existing
    /// contents.
    pub fn restore(&mut self, flocks: Vec<Flock>) {
        self.flocks.clear();
        self.member_of.clear();
        self.next_dest_id = 0;
        for flock in flocks {
            self.next_dest_id = self.next_dest_id.max(flock.dest_id.0 + 1);
            for &uid in &flock.members {
                self.member_of.insert(uid, flock.dest_id);
            }
            self.flocks.insert(flock.dest_id, flock);
        }
        self.last_cmd_dest = None;
    }
}

//! Deferred command queue: mutations enqueued by callers, applied at tick
//! boundaries.
//!
//! The input → typed command → queued mutation shape follows
//! `control/commands.rs`'s pattern; the channel itself is swapped from
//! direct-call dispatch to `crossbeam-channel`, matching the ambient
//! transport DESIGN.md records adopting from `freddiehaddad-oxidized`.

use crate::cost::FactionId;
use crate::formation::FormationType;
use crate::math::Vec2;
use crossbeam_channel::{Receiver, Sender};

/// A mutating operation accepted at the command boundary.
#[derive(Clone, Debug)]
pub enum Command {
    Add { uid: u32, pos: Vec2, radius: f32, faction: FactionId },
    Remove { uid: u32 },
    Stop { uid: u32 },
    SetDest { uid: u32, target: Vec2, attack: bool },
    ChangeDirection { uid: u32, dir_deg: f32 },
    SetEnterRange { uid: u32, target_uid: u32, range: f32 },
    SetSeekEnemies { uid: u32 },
    SetSurroundEntity { uid: u32, target_uid: u32 },
    UpdatePos { uid: u32, pos: Vec2 },
    UpdateFactionId { uid: u32, old: FactionId, new: FactionId },
    UpdateSelectionRadius { uid: u32, radius: f32 },
    SetMaxSpeed { uid: u32, max_speed: f32 },
    MakeFlocks { selection: Vec<u32>, target: Vec2, orientation: Option<Vec2>, formation_type: FormationType, attack: bool },
    Unblock { uid: u32 },
    BlockAt { uid: u32, pos: Vec2 },
}

impl Command {
    /// The agent uid this command primarily targets, when it has a single
    /// one (used by snoop-based queries to find the most recent command
    /// affecting a given agent).
    pub fn target_uid(&self) -> Option<u32> {
        match self {
            Command::Add { uid, .. }
            | Command::Remove { uid }
            | Command::Stop { uid }
            | Command::SetDest { uid, .. }
            | Command::ChangeDirection { uid, .. }
            | Command::SetEnterRange { uid, .. }
            | Command::SetSeekEnemies { uid }
            | Command::SetSurroundEntity { uid, .. }
            | Command::UpdatePos { uid, .. }
            | Command::UpdateFactionId { uid, .. }
            | Command::UpdateSelectionRadius { uid, .. }
            | Command::SetMaxSpeed { uid, .. }
            | Command::Unblock { uid }
            | Command::BlockAt { uid, .. } => Some(*uid),
            Command::MakeFlocks { .. } => None,
        }
    }
}

/// A bounded MPSC ring with a single consumer (the owning thread), plus a
/// buffer of commands pulled off the channel but not yet drained — this is
/// what lets [`CommandQueue::snoop`] answer synchronous queries about
/// commands that haven't executed yet.
pub struct CommandQueue {
    sender: Sender<Command>,
    receiver: Receiver<Command>,
    pending: Vec<Command>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self { sender, receiver, pending: Vec::new() }
    }

    /// A cloneable handle external callers use to enqueue commands.
    pub fn sender(&self) -> Sender<Command> {
        self.sender.clone()
    }

    /// Enqueues a command directly (convenience for in-process callers).
    pub fn push(&self, cmd: Command) {
        let _ = self.sender.send(cmd);
    }

    fn pull(&mut self) {
        while let Ok(cmd) = self.receiver.try_recv() {
            self.pending.push(cmd);
        }
    }

    /// Drains every queued command in FIFO (arrival) order, clearing the
    /// queue.
    pub fn drain(&mut self) -> Vec<Command> {
        self.pull();
        std::mem::take(&mut self.pending)
    }

    /// Iterates queued-but-undrained commands most-recent-first, for
    /// synchronous queries that must see pending changes before the next
    /// tick applies them.
    pub fn snoop(&mut self) -> impl Iterator<Item = &Command> {
        self.pull();
        self.pending.iter().rev()
    }

    /// The most recent pending command matching `uid`, if any (the common
    /// snoop shape: `GetMaxSpeed` etc. want the latest override).
    pub fn snoop_latest_for(&mut self, uid: u32) -> Option<&Command> {
        self.snoop().find(|c| c.target_uid() == Some(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_fifo_order() {
        let mut q = CommandQueue::new(8);
        q.push(Command::Stop { uid: 1 });
        q.push(Command::Stop { uid: 2 });
        let drained = q.drain();
        let uids: Vec<u32> = drained.iter().map(|c| c.target_uid().unwrap()).collect();
        assert_eq!(uids, vec![1, 2]);
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut q = CommandQueue::new(8);
        q.push(Command::Stop { uid: 1 });
        q.drain();
        assert!(q.drain().is_empty());
    }

    #[test]
    fn snoop_latest_for_prefers_the_most_recent_command() {
        let mut q = CommandQueue::new(8);
        q.push(Command::SetMaxSpeed { uid: 1, max_speed: 3.0 });
        q.push(Command::SetMaxSpeed { uid: 1, max_speed: 7.0 });
        let latest = q.snoop_latest_for(1).unwrap();
        match latest {
            Command::SetMaxSpeed { max_speed, .. } => assert_eq!(*max_speed, 7.0),
            _ => panic!("wrong variant"),
        }
    }
}

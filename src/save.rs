//! Savefile load/save.
//!
//! Ported from `game::map::{save_map, load_map}`
//! (`Zlib` + `bincode` to a `BufWriter`/`BufReader`), with the payload
//! widened from static map data to the full per-tick mutable state: config,
//! flocks, and per-agent movement state.

use crate::config::Config;
use crate::error::{NavResult, SaveError};
use crate::flock::Flock;
use crate::math::Vec2;
use crate::movement::{AgentState, Movestate, VEL_HIST_LEN};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

pub const SAVE_VERSION: u32 = 1;

/// Every [`Movestate`] field, written out losslessly — a restored agent
/// must be bit-for-bit indistinguishable from one that was simply never
/// saved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedAgent {
    pub uid: u32,
    pub state: AgentState,
    pub base_speed: f32,
    pub max_speed: f32,
    pub velocity: Vec2,
    pub prev_pos: Vec2,
    pub next_pos: Vec2,
    pub prev_rot: f32,
    pub next_rot: f32,
    pub step: f32,
    pub left: u32,
    pub blocking: bool,
    pub last_stop_pos: Vec2,
    pub last_stop_radius: f32,
    pub wait_prev: AgentState,
    pub wait_ticks_left: u32,
    pub vel_hist: [Vec2; VEL_HIST_LEN],
    pub vel_hist_idx: usize,
    pub surround_target_uid: Option<u32>,
    pub surround_target_prev: Vec2,
    pub surround_nearest_prev: Vec2,
    pub using_surround_field: bool,
    pub target_prev_pos: Vec2,
    pub target_range: f32,
    pub target_dir: f32,
}

impl SavedAgent {
    pub fn from_movestate(m: &Movestate) -> Self {
        Self {
            uid: m.uid,
            state: m.state,
            base_speed: m.base_speed,
            max_speed: m.max_speed,
            velocity: m.velocity,
            prev_pos: m.prev_pos,
            next_pos: m.next_pos,
            prev_rot: m.prev_rot,
            next_rot: m.next_rot,
            step: m.step,
            left: m.left,
            blocking: m.blocking,
            last_stop_pos: m.last_stop_pos,
            last_stop_radius: m.last_stop_radius,
            wait_prev: m.wait_prev,
            wait_ticks_left: m.wait_ticks_left,
            vel_hist: m.vel_hist,
            vel_hist_idx: m.vel_hist_idx,
            surround_target_uid: m.surround_target_uid,
            surround_target_prev: m.surround_target_prev,
            surround_nearest_prev: m.surround_nearest_prev,
            using_surround_field: m.using_surround_field,
            target_prev_pos: m.target_prev_pos,
            target_range: m.target_range,
            target_dir: m.target_dir,
        }
    }

    /// Rebuilds the exact [`Movestate`] this was taken from.
    pub fn into_movestate(self) -> Movestate {
        Movestate {
            uid: self.uid,
            state: self.state,
            base_speed: self.base_speed,
            max_speed: self.max_speed,
            velocity: self.velocity,
            prev_pos: self.prev_pos,
            next_pos: self.next_pos,
            prev_rot: self.prev_rot,
            next_rot: self.next_rot,
            step: self.step,
            left: self.left,
            blocking: self.blocking,
            last_stop_pos: self.last_stop_pos,
            last_stop_radius: self.last_stop_radius,
            wait_prev: self.wait_prev,
            wait_ticks_left: self.wait_ticks_left,
            vel_hist: self.vel_hist,
            vel_hist_idx: self.vel_hist_idx,
            surround_target_uid: self.surround_target_uid,
            surround_target_prev: self.surround_target_prev,
            surround_nearest_prev: self.surround_nearest_prev,
            using_surround_field: self.using_surround_field,
            target_prev_pos: self.target_prev_pos,
            target_range: self.target_range,
            target_dir: self.target_dir,
        }
    }
}

/// The faction/selection-radius bookkeeping `core::NavigationCore` keeps
/// outside `Movestate`, persisted alongside it so a restored agent blocks
/// the same disk it did before saving.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SavedAgentMeta {
    pub uid: u32,
    pub faction: u8,
    pub radius: f32,
}

/// Everything a savefile round-trips.
#[derive(Serialize, Deserialize)]
pub struct SaveData {
    pub version: u32,
    pub click_move_enabled: bool,
    pub flocks: Vec<Flock>,
    pub agents: Vec<SavedAgent>,
    pub agent_meta: Vec<SavedAgentMeta>,
}

impl SaveData {
    pub fn new(config: &Config, flocks: Vec<Flock>, agents: Vec<SavedAgent>, agent_meta: Vec<SavedAgentMeta>) -> Self {
        Self { version: SAVE_VERSION, click_move_enabled: config.click_move_enabled, flocks, agents, agent_meta }
    }
}

pub fn save(path: impl AsRef<Path>, data: &SaveData) -> NavResult<()> {
    let file = File::create(path).map_err(SaveError::Io)?;
    let writer = BufWriter::new(file);
    let mut encoder = ZlibEncoder::new(writer, Compression::default());
    bincode::serialize_into(&mut encoder, data).map_err(SaveError::Encoding)?;
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> NavResult<SaveData> {
    let file = File::open(path).map_err(SaveError::Io)?;
    let reader = BufReader::new(file);
    let mut decoder = ZlibDecoder::new(reader);
    let data: SaveData = bincode::deserialize_from(&mut decoder).map_err(SaveError::Encoding)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flock::DestId;

    #[test]
    fn save_then_load_round_trips_agents_and_flocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.sav");

        let config = Config::default();
        let mut m = Movestate::new(7, Vec2::new(1.0, 2.0), 5.0);
        m.state = AgentState::Moving;
        m.velocity = Vec2::new(1.0, 0.0);
        let agents = vec![SavedAgent::from_movestate(&m)];
        let flocks = vec![Flock::new(DestId(3), Vec2::new(9.0, 9.0), false, vec![7])];

        let data = SaveData::new(&config, flocks, agents, vec![SavedAgentMeta { uid: 7, faction: 2, radius: 0.75 }]);
        save(&path, &data).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.version, SAVE_VERSION);
        assert_eq!(loaded.click_move_enabled, config.click_move_enabled);
        assert_eq!(loaded.flocks.len(), 1);
        assert_eq!(loaded.flocks[0].dest_id, DestId(3));
        assert_eq!(loaded.agents.len(), 1);
        assert_eq!(loaded.agent_meta.len(), 1);
        assert_eq!(loaded.agent_meta[0].faction, 2);
        assert_eq!(loaded.agent_meta[0].radius, 0.75);

        let restored = loaded.agents.into_iter().next().unwrap().into_movestate();
        assert_eq!(restored.uid, 7);
        assert_eq!(restored.state, AgentState::Moving);
        assert_eq!(restored.last_stop_radius, 0.0);
    }

    #[test]
    fn loading_a_missing_file_errors() {
        let result = load("/nonexistent/path/does-not-exist.sav");
        assert!(result.is_err());
    }
}

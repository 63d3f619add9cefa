//! Per-agent movement state and the state machine that advances it each
//! tick.
//!
//! Ported from `simulation::physics`'s prev/next-position
//! interpolation pattern (`cache_previous_state`/`apply_velocity`) and
//! `simulation::mod`'s phase ordering, generalized from Bevy components and
//! system sets into one plain struct and a handful of free functions a
//! `core::NavigationCore` calls directly.

pub mod avoidance;
pub mod steering;

use crate::math::Vec2;
use serde::{Deserialize, Serialize};

/// Number of recent velocities kept for orientation smoothing.
pub const VEL_HIST_LEN: usize = 14;

/// Ticks an agent spends in [`AgentState::Waiting`] before retrying its
/// current goal.
pub const WAIT_TICKS: u32 = 20;

/// Degrees per tick an agent may rotate while `Turning`.
pub const MAX_TURN_RATE_DEG: f32 = 12.0;

/// Heading error, in degrees, within which `Turning` resolves to `Arrived`.
pub const TURN_ARRIVED_THRESHOLD_DEG: f32 = 5.0;

/// Inner/outer hysteresis bands for `SurroundEntity`'s field switch.
pub const LOW_WATER: f32 = 3.0;
pub const HIGH_WATER: f32 = 6.0;

/// Per-agent state machine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Moving,
    MovingInFormation,
    ArrivingToCell,
    SeekEnemies,
    SurroundEntity,
    EnterEntityRange,
    Turning,
    Waiting,
    Arrived,
}

impl AgentState {
    /// Invariant: `state ∈ {Arrived, Waiting} ⇔ velocity ≈ 0 ⇔ blocking = true`.
    pub fn is_still(self) -> bool {
        matches!(self, AgentState::Arrived | AgentState::Waiting)
    }
}

/// Per-agent movement state, the unit the savefile
/// persists one of per surviving agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Movestate {
    pub uid: u32,
    pub state: AgentState,
    pub base_speed: f32,
    pub max_speed: f32,
    pub velocity: Vec2,
    pub prev_pos: Vec2,
    pub next_pos: Vec2,
    pub prev_rot: f32,
    pub next_rot: f32,
    /// Interpolation step fraction, `1 / interpolation_subticks`.
    pub step: f32,
    /// Render subticks remaining before the next simulation tick is due.
    pub left: u32,
    pub blocking: bool,
    pub last_stop_pos: Vec2,
    pub last_stop_radius: f32,
    /// State to resume once `wait_ticks_left` reaches zero.
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

impl Movestate {
    /// Builds the `Arrived`, blocking initial state for a freshly `Add`ed
    /// agent.
    pub fn new(uid: u32, pos: Vec2, max_speed: f32) -> Self {
        Self {
            uid,
            state: AgentState::Arrived,
            base_speed: max_speed,
            max_speed,
            velocity: Vec2::ZERO,
            prev_pos: pos,
            next_pos: pos,
            prev_rot: 0.0,
            next_rot: 0.0,
            step: 1.0,
            left: 0,
            blocking: true,
            last_stop_pos: pos,
            last_stop_radius: 0.0,
            wait_prev: AgentState::Arrived,
            wait_ticks_left: 0,
            vel_hist: [Vec2::ZERO; VEL_HIST_LEN],
            vel_hist_idx: 0,
            surround_target_uid: None,
            surround_target_prev: Vec2::ZERO,
            surround_nearest_prev: Vec2::ZERO,
            using_surround_field: false,
            target_prev_pos: pos,
            target_range: 0.0,
            target_dir: 0.0,
        }
    }

    /// Interpolated render position between `prev_pos` and `next_pos` at
    /// the current `step` fraction.
    pub fn interpolated_pos(&self, subtick_fraction: f32) -> Vec2 {
        self.prev_pos + (self.next_pos - self.prev_pos) * subtick_fraction.clamp(0.0, 1.0)
    }

    /// Pushes a velocity into the ring buffer.
    pub fn push_velocity(&mut self, v: Vec2) {
        self.vel_hist[self.vel_hist_idx] = v;
        self.vel_hist_idx = (self.vel_hist_idx + 1) % VEL_HIST_LEN;
    }

    /// Weighted moving average of the velocity history, most recent
    /// weighted highest, used to smooth the facing direction.
    pub fn smoothed_orientation(&self) -> Vec2 {
        let mut sum = Vec2::ZERO;
        let mut weight_sum = 0.0f32;
        for i in 0..VEL_HIST_LEN {
            let age = (VEL_HIST_LEN + self.vel_hist_idx - 1 - i) % VEL_HIST_LEN;
            let weight = (i + 1) as f32;
            sum += self.vel_hist[age] * weight;
            weight_sum += weight;
        }
        if weight_sum <= f32::EPSILON {
            return Vec2::ZERO;
        }
        (sum / weight_sum).normalize()
    }

    /// Enters `Waiting` for [`WAIT_TICKS`], remembering the state to
    /// resume afterward.
    pub fn begin_wait(&mut self, resume: AgentState) {
        self.wait_prev = resume;
        self.wait_ticks_left = WAIT_TICKS;
        self.velocity = Vec2::ZERO;
        self.state = AgentState::Waiting;
        self.blocking = true;
    }

    /// Advances the wait countdown; returns `true` once it expires, at
    /// which point the caller should attempt `wait_prev` again.
    pub fn tick_wait(&mut self) -> bool {
        if self.wait_ticks_left == 0 {
            return true;
        }
        self.wait_ticks_left -= 1;
        self.wait_ticks_left == 0
    }

    /// Transitions into `Arrived`: zeroes velocity and sets `blocking` false.
    pub fn arrive(&mut self) {
        self.state = AgentState::Arrived;
        self.velocity = Vec2::ZERO;
        self.blocking = true;
        self.last_stop_pos = self.next_pos;
    }

    /// `Stop(uid)`: idempotent transition straight to `Arrived`.
    pub fn stop(&mut self) {
        self.arrive();
    }

    /// Whether the agent is within `1.5 * radius` of `target`.
    pub fn has_arrived_at(&self, target: Vec2, radius: f32) -> bool {
        self.next_pos.distance(target) <= 1.5 * radius
    }
}

/// Integrates one tick of velocity given a steering force: `v_new =
/// truncate(v + F/m, max_speed)`, using unit
/// mass so force and acceleration share units.
pub fn integrate_velocity(velocity: Vec2, force: Vec2, dt: f32, max_speed: f32) -> Vec2 {
    (velocity + force * dt).truncate(max_speed)
}

/// Zeroes the velocity component pointing into an impassable adjacent
/// tile.
pub fn clamp_against_wall(velocity: Vec2, blocked_dir: Option<Vec2>) -> Vec2 {
    let Some(blocked_dir) = blocked_dir else { return velocity };
    if blocked_dir.length_squared() <= f32::EPSILON {
        return velocity;
    }
    let n = blocked_dir.normalize();
    let into_wall = velocity.dot(n);
    if into_wall > 0.0 {
        velocity - n * into_wall
    } else {
        velocity
    }
}

/// Advances `Turning` by at most [`MAX_TURN_RATE_DEG`] toward
/// `target_dir_deg`, returning the new heading and whether it has arrived
/// within [`TURN_ARRIVED_THRESHOLD_DEG`].
pub fn step_turn(current_dir_deg: f32, target_dir_deg: f32) -> (f32, bool) {
    let mut delta = (target_dir_deg - current_dir_deg) % 360.0;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    if delta.abs() <= TURN_ARRIVED_THRESHOLD_DEG {
        return (target_dir_deg, true);
    }
    let step = delta.clamp(-MAX_TURN_RATE_DEG, MAX_TURN_RATE_DEG);
    ((current_dir_deg + step).rem_euclid(360.0), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_agent_starts_arrived_and_blocking() {
        let m = Movestate::new(1, Vec2::ZERO, 5.0);
        assert_eq!(m.state, AgentState::Arrived);
        assert!(m.blocking);
        assert!(m.state.is_still());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut m = Movestate::new(1, Vec2::ZERO, 5.0);
        m.state = AgentState::Moving;
        m.velocity = Vec2::new(3.0, 0.0);
        m.stop();
        assert_eq!(m.state, AgentState::Arrived);
        m.stop();
        assert_eq!(m.state, AgentState::Arrived);
        assert_eq!(m.velocity, Vec2::ZERO);
    }

    #[test]
    fn velocity_integration_respects_max_speed() {
        let v = integrate_velocity(Vec2::ZERO, Vec2::new(1000.0, 0.0), 0.05, 5.0);
        assert!((v.length() - 5.0).abs() < 1e-3);
    }

    #[test]
    fn wait_countdown_expires_after_wait_ticks() {
        let mut m = Movestate::new(1, Vec2::ZERO, 5.0);
        m.begin_wait(AgentState::Moving);
        let mut expired = false;
        for _ in 0..WAIT_TICKS {
            expired = m.tick_wait();
        }
        assert!(expired);
    }

    #[test]
    fn turning_reaches_arrived_within_threshold() {
        let (dir, arrived) = step_turn(0.0, 3.0);
        assert!(arrived);
        assert_eq!(dir, 3.0);
        let (_, not_yet) = step_turn(0.0, 90.0);
        assert!(!not_yet);
    }

    #[test]
    fn wall_component_is_removed_not_whole_velocity() {
        let v = Vec2::new(1.0, 1.0);
        let blocked = Vec2::new(1.0, 0.0);
        let clamped = clamp_against_wall(v, Some(blocked));
        assert!(clamped.x.abs() < 1e-4);
        assert!((clamped.y - 1.0).abs() < 1e-4);
    }
}

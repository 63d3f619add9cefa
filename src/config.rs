//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Movement tick rate. Only this fixed set of rates is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickRate {
    /// 20 Hz — the default, and the reference rate interpolation subticks
    /// are scaled against.
    Hz20,
    /// 10 Hz.
    Hz10,
    /// 5 Hz.
    Hz5,
    /// 1 Hz.
    Hz1,
}

impl TickRate {
    /// Ticks per second as an integer.
    pub fn as_hz(self) -> u32 {
        match self {
            TickRate::Hz20 => 20,
            TickRate::Hz10 => 10,
            TickRate::Hz5 => 5,
            TickRate::Hz1 => 1,
        }
    }

    /// Seconds per tick.
    pub fn dt(self) -> f32 {
        1.0 / self.as_hz() as f32
    }

    /// Number of render subticks between two simulation ticks at the
    /// reference 20 Hz interpolation rate.
    pub fn interpolation_subticks(self) -> u32 {
        20 / self.as_hz()
    }
}

/// Which backend computes per-agent avoidance velocities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityBackend {
    /// Fork-join across the CPU worker-thread pool.
    Cpu,
    /// Dispatched to a GPU compute shader; the tick task awaits a fence and
    /// may time out back onto the CPU path.
    Gpu,
}

/// Top-level configuration for a [`crate::core::NavigationCore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Movement simulation tick rate.
    pub tick_rate: TickRate,
    /// CPU or GPU velocity computation backend.
    pub velocity_backend: VelocityBackend,
    /// Whether a single left-click issues a move command for the selection.
    pub click_move_enabled: bool,
    /// Whether a click on an enemy entity issues an attack-move rather than
    /// a plain move.
    pub attack_on_click_enabled: bool,
    /// Upper bound on concurrent fork-join workers.
    pub max_move_tasks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_rate: TickRate::Hz20,
            velocity_backend: VelocityBackend::Cpu,
            click_move_enabled: true,
            attack_on_click_enabled: true,
            max_move_tasks: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Config is meant to be hand-edited on disk as JSON, separately from
    /// the bincode/zlib runtime save format in [`crate::save`].
    #[test]
    fn config_round_trips_through_json() {
        let cfg = Config {
            tick_rate: TickRate::Hz10,
            velocity_backend: VelocityBackend::Gpu,
            click_move_enabled: false,
            attack_on_click_enabled: true,
            max_move_tasks: 8,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tick_rate, TickRate::Hz10);
        assert_eq!(parsed.velocity_backend, VelocityBackend::Gpu);
        assert!(!parsed.click_move_enabled);
        assert_eq!(parsed.max_move_tasks, 8);
    }

    #[test]
    fn tick_rate_derives_dt_and_subticks() {
        assert_eq!(TickRate::Hz20.dt(), 0.05);
        assert_eq!(TickRate::Hz5.interpolation_subticks(), 4);
    }
}

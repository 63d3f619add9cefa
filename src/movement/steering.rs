//! Steering force composition.
//!
//! Ported from `unit::boids::apply_boids_steering`
//! (inverse-square separation, velocity-average alignment, center-of-mass
//! cohesion) generalized with an `arrive` term and formation
//! cohesion/alignment/drag terms, with a prioritized total→separation→arrive
//! fallback layered on top of the original flat weighted sum.

use crate::math::Vec2;

/// A neighbouring agent's state, as seen for flocking purposes.
#[derive(Clone, Copy, Debug)]
pub struct Neighbour {
    pub pos: Vec2,
    pub velocity: Vec2,
}

/// Scales applied to each steering term before summing.
#[derive(Clone, Copy, Debug)]
pub struct SteeringWeights {
    pub arrive: f32,
    pub cohesion: f32,
    pub alignment: f32,
    pub separation: f32,
}

impl Default for SteeringWeights {
    fn default() -> Self {
        Self { arrive: 0.5, cohesion: 0.15, alignment: 0.15, separation: 0.6 }
    }
}

/// Inputs to one agent's steering computation for a tick.
pub struct SteeringInput<'a> {
    pub pos: Vec2,
    pub velocity: Vec2,
    pub max_speed: f32,
    /// Direction toward the desired target (from the flow/LOS field, or a
    /// direct heading when the agent has line-of-sight).
    pub seek_dir: Vec2,
    pub neighbours: &'a [Neighbour],
    /// Extra cohesion/alignment/drag terms contributed by formation
    /// membership (`MovingInFormation`/`ArrivingToCell`); zero vectors when
    /// the agent isn't in a formation.
    pub formation_cohesion: Vec2,
    pub formation_alignment: Vec2,
    pub formation_drag: Vec2,
}

/// Separation force magnitude is capped so one very-close neighbour can't
/// dominate the sum.
const MAX_SEPARATION_FORCE: f32 = 100.0;

fn arrive(input: &SteeringInput) -> Vec2 {
    if input.seek_dir.length_squared() <= f32::EPSILON {
        return Vec2::ZERO;
    }
    input.seek_dir.normalize() * input.max_speed - input.velocity
}

fn separation(input: &SteeringInput) -> Vec2 {
    let mut force = Vec2::ZERO;
    for n in input.neighbours {
        let away = input.pos - n.pos;
        let dist = away.length();
        if dist <= f32::EPSILON {
            force += Vec2::new(1.0, 0.0) * MAX_SEPARATION_FORCE;
            continue;
        }
        let push = (away / dist) * (1.0 / (dist * dist));
        force += push;
    }
    force.truncate(MAX_SEPARATION_FORCE)
}

fn alignment(input: &SteeringInput) -> Vec2 {
    if input.neighbours.is_empty() {
        return Vec2::ZERO;
    }
    let avg = input.neighbours.iter().fold(Vec2::ZERO, |acc, n| acc + n.velocity) / input.neighbours.len() as f32;
    if avg.length_squared() <= f32::EPSILON {
        return Vec2::ZERO;
    }
    avg.normalize() * input.max_speed - input.velocity
}

fn cohesion(input: &SteeringInput) -> Vec2 {
    if input.neighbours.is_empty() {
        return Vec2::ZERO;
    }
    let center = input.neighbours.iter().fold(Vec2::ZERO, |acc, n| acc + n.pos) / input.neighbours.len() as f32;
    let toward = center - input.pos;
    if toward.length_squared() <= f32::EPSILON {
        return Vec2::ZERO;
    }
    toward.normalize() * input.max_speed - input.velocity
}

/// Composes the full steering force with a prioritized fallback: total
/// force, else separation-only, else arrive-only. The result is truncated
/// to `max_force`.
pub fn compute_force(input: &SteeringInput, weights: &SteeringWeights, max_force: f32) -> Vec2 {
    let arrive_force = arrive(input) * weights.arrive;
    let cohesion_force = (cohesion(input) + input.formation_cohesion) * weights.cohesion;
    let alignment_force = (alignment(input) + input.formation_alignment) * weights.alignment;
    let separation_force = separation(input) * weights.separation;

    let total = arrive_force + cohesion_force + alignment_force + separation_force + input.formation_drag;
    if total.length_squared() > f32::EPSILON {
        return total.truncate(max_force);
    }

    let separation_only = separation(input) * weights.separation;
    if separation_only.length_squared() > f32::EPSILON {
        return separation_only.truncate(max_force);
    }

    arrive(input).truncate(max_force)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(seek_dir: Vec2, neighbours: &[Neighbour]) -> SteeringInput {
        SteeringInput {
            pos: Vec2::ZERO,
            velocity: Vec2::ZERO,
            max_speed: 5.0,
            seek_dir,
            neighbours,
            formation_cohesion: Vec2::ZERO,
            formation_alignment: Vec2::ZERO,
            formation_drag: Vec2::ZERO,
        }
    }

    #[test]
    fn arrive_only_when_no_neighbours() {
        let i = input(Vec2::new(1.0, 0.0), &[]);
        let f = compute_force(&i, &SteeringWeights::default(), 10.0);
        assert!(f.x > 0.0);
    }

    #[test]
    fn close_neighbour_pushes_away() {
        let neighbours = [Neighbour { pos: Vec2::new(0.1, 0.0), velocity: Vec2::ZERO }];
        let i = input(Vec2::ZERO, &neighbours);
        let f = compute_force(&i, &SteeringWeights::default(), 1000.0);
        assert!(f.x < 0.0);
    }

    #[test]
    fn force_is_truncated_to_max_force() {
        let neighbours = [Neighbour { pos: Vec2::new(0.001, 0.0), velocity: Vec2::ZERO }];
        let i = input(Vec2::new(1.0, 0.0), &neighbours);
        let f = compute_force(&i, &SteeringWeights::default(), 2.0);
        assert!(f.length() <= 2.0 + 1e-3);
    }
}

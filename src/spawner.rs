//! Coordinate samplers and rate-limited entity production.

use std::f64::consts::PI;

use glam::DVec2;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::entity::EntitySpec;
use crate::types::{Pose, Uid};

/// Where an entity goes when it is placed or reset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinateSampler {
    Fixed { pose: Pose },
    /// Uniform over an axis-aligned rectangle.
    Rectangle { center: DVec2, width: f64, height: f64, angle_range: Option<(f64, f64)> },
    /// Uniform over a disc.
    Circle { center: DVec2, radius: f64, angle_range: Option<(f64, f64)> },
}

impl From<Pose> for CoordinateSampler {
    fn from(pose: Pose) -> Self {
        CoordinateSampler::Fixed { pose }
    }
}

impl From<(f64, f64)> for CoordinateSampler {
    fn from(xy: (f64, f64)) -> Self {
        CoordinateSampler::Fixed { pose: Pose::from(xy) }
    }
}

impl From<((f64, f64), f64)> for CoordinateSampler {
    fn from(v: ((f64, f64), f64)) -> Self {
        CoordinateSampler::Fixed { pose: Pose::from(v) }
    }
}

fn sample_angle(rng: &mut StdRng, range: Option<(f64, f64)>) -> f64 {
    match range {
        Some((lo, hi)) if hi > lo => rng.gen_range(lo..hi),
        Some((lo, _)) => lo,
        None => 0.0,
    }
}

impl CoordinateSampler {
    pub fn rectangle(center: DVec2, width: f64, height: f64) -> Self {
        CoordinateSampler::Rectangle { center, width, height, angle_range: None }
    }

    pub fn circle(center: DVec2, radius: f64) -> Self {
        CoordinateSampler::Circle { center, radius, angle_range: None }
    }

    /// Randomize orientation over the full circle.
    pub fn with_random_angle(self) -> Self {
        let full = Some((-PI, PI));
        match self {
            CoordinateSampler::Rectangle { center, width, height, .. } => {
                CoordinateSampler::Rectangle { center, width, height, angle_range: full }
            }
            CoordinateSampler::Circle { center, radius, .. } => CoordinateSampler::Circle { center, radius, angle_range: full },
            fixed => fixed,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, CoordinateSampler::Fixed { .. })
    }

    pub fn sample(&self, rng: &mut StdRng) -> Pose {
        match self {
            CoordinateSampler::Fixed { pose } => *pose,
            CoordinateSampler::Rectangle { center, width, height, angle_range } => {
                let x = if *width > 0.0 { rng.gen_range(-width / 2.0..width / 2.0) } else { 0.0 };
                let y = if *height > 0.0 { rng.gen_range(-height / 2.0..height / 2.0) } else { 0.0 };
                Pose { position: *center + DVec2::new(x, y), angle: sample_angle(rng, *angle_range) }
            }
            CoordinateSampler::Circle { center, radius, angle_range } => {
                // sqrt keeps the density uniform over the disc
                let r = radius * rng.gen_range(0.0f64..1.0).sqrt();
                let theta = rng.gen_range(-PI..PI);
                Pose { position: *center + DVec2::from_angle(theta) * r, angle: sample_angle(rng, *angle_range) }
            }
        }
    }
}

/// Production rule: a template stamped out at sampled coordinates.
#[derive(Clone, Debug)]
pub struct Spawner {
    pub template: EntitySpec,
    pub sampler: CoordinateSampler,
    /// Chance of producing on a given step.
    pub probability: f64,
    pub max_elements_in_playground: usize,
    pub production_limit: usize,
    pub allow_overlapping: bool,
    total_produced: usize,
    produced: Vec<Uid>,
}

impl Spawner {
    pub fn new(template: EntitySpec, sampler: impl Into<CoordinateSampler>) -> Self {
        Self {
            template,
            sampler: sampler.into(),
            probability: 1.0,
            max_elements_in_playground: 10,
            production_limit: 100,
            allow_overlapping: false,
            total_produced: 0,
            produced: Vec::new(),
        }
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn with_limits(mut self, max_elements_in_playground: usize, production_limit: usize) -> Self {
        self.max_elements_in_playground = max_elements_in_playground;
        self.production_limit = production_limit;
        self
    }

    pub fn allowing_overlap(mut self, allow: bool) -> Self {
        self.allow_overlapping = allow;
        self
    }

    pub fn total_produced(&self) -> usize {
        self.total_produced
    }

    /// Produced entities still alive in the playground.
    pub fn produced_entities(&self) -> &[Uid] {
        &self.produced
    }

    /// Forget produced entities that no longer exist.
    pub(crate) fn retain_live(&mut self, mut alive: impl FnMut(Uid) -> bool) {
        self.produced.retain(|uid| alive(*uid));
    }

    /// Whether a production attempt is allowed this step. Consumes one random draw when it is.
    pub(crate) fn wants_to_produce(&self, rng: &mut StdRng) -> bool {
        if self.produced.len() >= self.max_elements_in_playground || self.total_produced >= self.production_limit {
            return false;
        }
        rng.gen_bool(self.probability)
    }

    pub(crate) fn record(&mut self, uid: Uid) {
        self.produced.push(uid);
        self.total_produced += 1;
        debug_assert!(self.produced.len() <= self.max_elements_in_playground);
        debug_assert!(self.total_produced <= self.production_limit);
    }

    pub(crate) fn reset(&mut self) {
        self.total_produced = 0;
        self.produced.clear();
    }
}

//! Ray-fan sensors built on the space's segment query.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::api::SpaceApi;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::observation::{Observation, SpaceSpec};
use crate::space::{QueryFilter, Space};
use crate::types::{CollisionType, Pose, Uid};

/// Ray angles relative to the anchor heading, evenly spread over `[-fov/2, fov/2]`.
pub fn ray_angles(fov: f64, resolution: usize) -> Vec<f64> {
    match resolution {
        0 => Vec::new(),
        1 => vec![0.0],
        n => (0..n).map(|i| i as f64 * fov / (n - 1) as f64 - fov / 2.0).collect(),
    }
}

/// What each ray reports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Distance to the nearest hit.
    #[default]
    Distance,
    /// Colour of the nearest hit entity.
    Rgb,
    /// `[uid, distance, collision type]` of the nearest hit. The uid lane is an `f32`,
    /// so uids are exact up to 2^24.
    Semantic,
}

/// Post-processing over the raw per-ray hit lists.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Every entity crossed by every ray.
    All,
    /// First entity along each ray.
    #[default]
    NearestPerAngle,
    /// Each entity once, on the ray where it is closest.
    NearestPerEntity,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSpec {
    pub name: String,
    pub kind: SensorKind,
    /// Name of the agent part the fan is anchored on.
    pub anchor: String,
    pub fov: f64,
    pub resolution: usize,
    pub max_range: f64,
    /// Entities this sensor never sees, on top of its own agent.
    pub invisible: Vec<Uid>,
    pub reduction: Reduction,
    /// Report distances as a fraction of `max_range`.
    pub normalize: bool,
}

impl Default for SensorSpec {
    fn default() -> Self {
        Self {
            name: "sensor".into(),
            kind: SensorKind::Distance,
            anchor: "base".into(),
            fov: PI,
            resolution: 16,
            max_range: 200.0,
            invisible: Vec::new(),
            reduction: Reduction::NearestPerAngle,
            normalize: false,
        }
    }
}

impl SensorSpec {
    pub fn new(name: impl Into<String>, kind: SensorKind, anchor: impl Into<String>) -> Self {
        Self { name: name.into(), kind, anchor: anchor.into(), ..Default::default() }
    }

    pub fn with_fan(mut self, fov: f64, resolution: usize, max_range: f64) -> Self {
        self.fov = fov;
        self.resolution = resolution;
        self.max_range = max_range;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_invisible(mut self, uids: impl IntoIterator<Item = Uid>) -> Self {
        self.invisible.extend(uids);
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution == 0 {
            return Err(Error::InvalidConfig(format!("sensor {:?} needs at least one ray", self.name)));
        }
        if !(self.max_range > 0.0) {
            return Err(Error::InvalidConfig(format!("sensor {:?} needs a positive range", self.name)));
        }
        if !(self.fov >= 0.0) {
            return Err(Error::InvalidConfig(format!("sensor {:?} has a negative field of view", self.name)));
        }
        Ok(())
    }
}

/// One entity seen by one ray.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Detection {
    pub ray: usize,
    pub entity: Uid,
    pub distance: f64,
    pub point: DVec2,
    pub collision_type: CollisionType,
}

/// A sensor bound to a placed agent part.
#[derive(Clone, Debug)]
pub struct RaySensor {
    pub spec: SensorSpec,
    pub anchor: Uid,
    angles: Vec<f64>,
}

impl RaySensor {
    pub fn new(spec: SensorSpec, anchor: Uid) -> Result<Self> {
        spec.validate()?;
        let angles = ray_angles(spec.fov, spec.resolution);
        Ok(Self { spec, anchor, angles })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn angles(&self) -> &[f64] {
        &self.angles
    }

    /// Hits along every ray, nearest first, one per entity.
    pub fn cast(&self, space: &Space, origin: Pose, invisible: &BTreeSet<Uid>) -> Vec<Vec<Detection>> {
        let filter = QueryFilter::default().excluding(invisible);
        let range = self.spec.max_range;
        self.angles
            .iter()
            .enumerate()
            .map(|(ray, rel)| {
                let end = origin.position + DVec2::from_angle(origin.angle + rel) * range;
                let mut seen = BTreeSet::new();
                space
                    .segment_query(origin.position, end, 0.0, &filter)
                    .into_iter()
                    .filter(|hit| seen.insert(hit.owner.entity))
                    .map(|hit| Detection {
                        ray,
                        entity: hit.owner.entity,
                        distance: hit.fraction * range,
                        point: hit.point,
                        collision_type: space.shape(hit.shape).map_or(CollisionType::DEFAULT, |s| s.collision_type),
                    })
                    .collect()
            })
            .collect()
    }

    /// Apply this sensor's reduction to raw per-ray hits.
    pub fn reduce(&self, raw: Vec<Vec<Detection>>) -> Vec<Detection> {
        match self.spec.reduction {
            Reduction::All => raw.into_iter().flatten().collect(),
            Reduction::NearestPerAngle => raw.into_iter().filter_map(|hits| hits.into_iter().next()).collect(),
            Reduction::NearestPerEntity => {
                let mut best: BTreeMap<Uid, Detection> = BTreeMap::new();
                for d in raw.into_iter().flatten() {
                    match best.get(&d.entity) {
                        Some(prev) if prev.distance <= d.distance => {}
                        _ => {
                            best.insert(d.entity, d);
                        }
                    }
                }
                let mut out: Vec<Detection> = best.into_values().collect();
                out.sort_by(|a, b| a.ray.cmp(&b.ray).then(a.distance.total_cmp(&b.distance)));
                out
            }
        }
    }

    pub fn detect(&self, space: &Space, origin: Pose, invisible: &BTreeSet<Uid>) -> Vec<Detection> {
        self.reduce(self.cast(space, origin, invisible))
    }

    fn scaled(&self, distance: f64) -> f32 {
        if self.spec.normalize { (distance / self.spec.max_range) as f32 } else { distance as f32 }
    }

    /// Fill the observation buffer from the nearest surviving detection of each ray.
    pub fn encode(&self, detections: &[Detection], color_of: impl Fn(Uid) -> [f32; 3]) -> Observation {
        let res = self.angles.len();
        let mut nearest: Vec<Option<&Detection>> = vec![None; res];
        for d in detections {
            let slot = &mut nearest[d.ray];
            if slot.is_none_or(|prev| d.distance < prev.distance) {
                *slot = Some(d);
            }
        }
        let miss = self.scaled(self.spec.max_range);
        match self.spec.kind {
            SensorKind::Distance => {
                Observation { shape: vec![res], data: nearest.iter().map(|d| d.map_or(miss, |d| self.scaled(d.distance))).collect() }
            }
            SensorKind::Rgb => Observation {
                shape: vec![res, 3],
                data: nearest.iter().flat_map(|d| d.map_or([0.0; 3], |d| color_of(d.entity))).collect(),
            },
            SensorKind::Semantic => Observation {
                shape: vec![res, 3],
                data: nearest
                    .iter()
                    .flat_map(|d| match d {
                        Some(d) => [d.entity.0 as f32, self.scaled(d.distance), d.collision_type.0 as f32],
                        None => [0.0, miss, 0.0],
                    })
                    .collect(),
            },
        }
    }

    /// Run the full pipeline from the anchor's current pose.
    pub fn observe(&self, space: &Space, entities: &BTreeMap<Uid, Entity>, invisible: &BTreeSet<Uid>) -> Observation {
        let Some(anchor) = entities.get(&self.anchor) else { return Observation::zeros(self.shape()) };
        let detections = self.detect(space, anchor.pose(space), invisible);
        self.encode(&detections, |uid| entities.get(&uid).map_or([0.0; 3], |e| e.spec.color))
    }

    pub fn shape(&self) -> Vec<usize> {
        match self.spec.kind {
            SensorKind::Distance => vec![self.angles.len()],
            SensorKind::Rgb | SensorKind::Semantic => vec![self.angles.len(), 3],
        }
    }

    pub fn space(&self) -> SpaceSpec {
        let high = match self.spec.kind {
            SensorKind::Rgb => 1.0,
            SensorKind::Semantic => f64::MAX,
            SensorKind::Distance if self.spec.normalize => 1.0,
            SensorKind::Distance => self.spec.max_range,
        };
        SpaceSpec::Box { low: 0.0, high, shape: self.shape() }
    }
}

//! Agents: a base part, jointed or rigid sub-parts, controllers and sensors.

use std::collections::BTreeSet;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::controller::{Actuator, Controller};
use crate::entity::{Attachment, EntitySpec};
use crate::error::{Error, Result};
use crate::geometry::ShapeDescriptor;
use crate::sensor::{RaySensor, SensorSpec};
use crate::space::ConstraintHandle;
use crate::spawner::CoordinateSampler;
use crate::types::{AgentId, CollisionType, Pose, Uid};

/// Physical description of one agent part.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartSpec {
    pub name: String,
    pub shape: ShapeDescriptor,
    pub mass: f64,
    #[serde(default = "default_color")]
    pub color: [f32; 3],
    #[serde(default = "default_friction")]
    pub friction: f64,
    #[serde(default)]
    pub elasticity: f64,
}

fn default_color() -> [f32; 3] {
    [0.2, 0.4, 0.9]
}

fn default_friction() -> f64 {
    0.8
}

impl PartSpec {
    pub fn new(name: impl Into<String>, shape: ShapeDescriptor, mass: f64) -> Self {
        Self { name: name.into(), shape, mass, color: default_color(), friction: default_friction(), elasticity: 0.0 }
    }

    pub fn with_color(mut self, color: [f32; 3]) -> Self {
        self.color = color;
        self
    }

    pub(crate) fn entity_spec(&self, teams: &[String]) -> EntitySpec {
        EntitySpec::new(self.shape.clone())
            .named(self.name.clone())
            .with_mass(self.mass)
            .with_collision_type(CollisionType::AGENT)
            .with_teams(teams.iter().cloned())
            .with_color(self.color)
            .with_material(self.friction, self.elasticity)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartJoint {
    Fixed,
    /// Pivot at the attachment point, limited to `rotation_range` and driven by a motor.
    Revolute { rotation_range: f64, rotation_speed: f64, max_torque: f64 },
}

/// A part hanging off an earlier part (or the base).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchoredPartSpec {
    pub part: PartSpec,
    /// Name of the part this one hangs off.
    pub anchor: String,
    pub anchor_point: DVec2,
    pub pivot_point: DVec2,
    #[serde(default)]
    pub relative_angle: f64,
    pub joint: PartJoint,
}

impl AnchoredPartSpec {
    pub fn fixed(part: PartSpec, anchor: impl Into<String>, anchor_point: DVec2, pivot_point: DVec2) -> Self {
        Self { part, anchor: anchor.into(), anchor_point, pivot_point, relative_angle: 0.0, joint: PartJoint::Fixed }
    }

    pub fn revolute(
        part: PartSpec,
        anchor: impl Into<String>,
        anchor_point: DVec2,
        pivot_point: DVec2,
        rotation_range: f64,
        rotation_speed: f64,
    ) -> Self {
        Self {
            part,
            anchor: anchor.into(),
            anchor_point,
            pivot_point,
            relative_angle: 0.0,
            joint: PartJoint::Revolute { rotation_range, rotation_speed, max_torque: 1e4 },
        }
    }

    pub fn with_relative_angle(mut self, angle: f64) -> Self {
        self.relative_angle = angle;
        self
    }

    pub(crate) fn attachment(&self, anchor: Uid) -> Attachment {
        match self.joint {
            PartJoint::Fixed => Attachment::fixed(anchor, self.anchor_point, self.pivot_point, self.relative_angle),
            PartJoint::Revolute { rotation_range, max_torque, .. } => {
                Attachment::dynamic(anchor, self.anchor_point, self.pivot_point, self.relative_angle, rotation_range, max_torque)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub teams: Vec<String>,
    pub base: PartSpec,
    #[serde(default)]
    pub parts: Vec<AnchoredPartSpec>,
    #[serde(default)]
    pub controllers: Vec<Controller>,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, base: PartSpec) -> Self {
        Self { name: name.into(), teams: Vec::new(), base, parts: Vec::new(), controllers: Vec::new(), sensors: Vec::new() }
    }

    pub fn with_teams<S: Into<String>>(mut self, teams: impl IntoIterator<Item = S>) -> Self {
        self.teams = teams.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_part(mut self, part: AnchoredPartSpec) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_controller(mut self, controller: Controller) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn with_sensor(mut self, sensor: SensorSpec) -> Self {
        self.sensors.push(sensor);
        self
    }

    /// Base plus forward, rotation, grasp, activate and eat controllers.
    pub fn basic(name: impl Into<String>, radius: f64) -> Self {
        Self::new(name, PartSpec::new("base", ShapeDescriptor::circle(radius), 10.0))
            .with_controller(Controller::continuous("forward", Actuator::Forward { force: 100.0 }))
            .with_controller(Controller::continuous("rotation", Actuator::Rotation { torque: 1000.0 }))
            .with_controller(Controller::boolean("grasp", Actuator::Grasp))
            .with_controller(Controller::boolean("activate", Actuator::Activate))
            .with_controller(Controller::boolean("eat", Actuator::Eat))
    }

    fn part_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.base.name.as_str()).chain(self.parts.iter().map(|p| p.part.name.as_str()))
    }

    /// Check names and cross references. Parts may only hang off parts declared before them.
    pub fn validate(&self) -> Result<()> {
        let unknown = |part: &str| Error::UnknownPart { agent: self.name.clone(), part: part.to_string() };
        let mut seen = BTreeSet::new();
        seen.insert(self.base.name.as_str());
        for p in &self.parts {
            if !seen.contains(p.anchor.as_str()) {
                return Err(unknown(&p.anchor));
            }
            if !seen.insert(p.part.name.as_str()) {
                return Err(Error::NameCollision(format!("{}/{}", self.name, p.part.name)));
            }
        }
        let mut controllers = BTreeSet::new();
        for c in &self.controllers {
            if !controllers.insert(c.name.as_str()) {
                return Err(Error::NameCollision(format!("{}/{}", self.name, c.name)));
            }
            if let Actuator::Motor { part } = &c.actuator {
                let revolute = self.parts.iter().any(|p| p.part.name == *part && matches!(p.joint, PartJoint::Revolute { .. }));
                if !revolute {
                    return Err(unknown(part));
                }
            }
        }
        let mut sensors = BTreeSet::new();
        for s in &self.sensors {
            if !sensors.insert(s.name.as_str()) {
                return Err(Error::NameCollision(format!("{}/{}", self.name, s.name)));
            }
            if !self.part_names().any(|n| n == s.anchor) {
                return Err(unknown(&s.anchor));
            }
            s.validate()?;
        }
        Ok(())
    }
}

/// One placed part of an agent.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentPart {
    pub name: String,
    pub uid: Uid,
    /// Motor rate at full command; zero for rigid parts.
    pub rotation_speed: f64,
}

/// Flags raised by the boolean actuators for the current step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Actuation {
    pub grasp: bool,
    pub activate: bool,
    pub eat: bool,
}

/// Pin joints holding a grasped entity against one of the agent's parts.
#[derive(Clone, Debug, PartialEq)]
pub struct GraspHold {
    pub part: Uid,
    pub target: Uid,
    pub joints: Vec<ConstraintHandle>,
}

#[derive(Clone, Debug)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub teams: Vec<String>,
    pub base: Uid,
    /// Base first, then parts in declaration order.
    pub parts: Vec<AgentPart>,
    pub controllers: Vec<Controller>,
    pub sensors: Vec<RaySensor>,
    /// Reward gathered during the current step.
    pub reward: f64,
    pub cumulative_reward: f64,
    pub actuation: Actuation,
    pub grasps: Vec<GraspHold>,
    pub initial: CoordinateSampler,
    pub allow_overlapping: bool,
    /// Elements that already paid this agent during the current step.
    pub(crate) rewarded_by: BTreeSet<Uid>,
    pub(crate) ate: bool,
}

impl Agent {
    pub fn new(id: AgentId, spec: &AgentSpec, base: Uid) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            teams: spec.teams.clone(),
            base,
            parts: vec![AgentPart { name: spec.base.name.clone(), uid: base, rotation_speed: 0.0 }],
            controllers: spec.controllers.clone(),
            sensors: Vec::new(),
            reward: 0.0,
            cumulative_reward: 0.0,
            actuation: Actuation::default(),
            grasps: Vec::new(),
            initial: CoordinateSampler::from(Pose::default()),
            allow_overlapping: true,
            rewarded_by: BTreeSet::new(),
            ate: false,
        }
    }

    pub fn part(&self, name: &str) -> Option<&AgentPart> {
        self.parts.iter().find(|p| p.name == name)
    }

    pub fn part_uids(&self) -> impl Iterator<Item = Uid> + '_ {
        self.parts.iter().map(|p| p.uid)
    }

    pub fn owns(&self, uid: Uid) -> bool {
        self.parts.iter().any(|p| p.uid == uid)
    }

    pub fn controller(&self, name: &str) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.name == name)
    }

    pub fn sensor(&self, name: &str) -> Option<&RaySensor> {
        self.sensors.iter().find(|s| s.name() == name)
    }

    pub fn is_holding(&self, target: Uid) -> bool {
        self.grasps.iter().any(|g| g.target == target)
    }

    /// Parts, held targets and the sensor's configured exclusions. Elements attached to the
    /// agent are added by the playground, which knows the attachment tree.
    pub fn invisible_to(&self, sensor: &RaySensor) -> BTreeSet<Uid> {
        self.part_uids()
            .chain(sensor.spec.invisible.iter().copied())
            .chain(self.grasps.iter().map(|g| g.target))
            .collect()
    }

    pub fn pre_step(&mut self) {
        self.reward = 0.0;
        self.actuation = Actuation::default();
        self.rewarded_by.clear();
        self.ate = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorKind;

    fn arm() -> AnchoredPartSpec {
        AnchoredPartSpec::revolute(
            PartSpec::new("arm", ShapeDescriptor::rectangle(30.0, 6.0), 1.0),
            "base",
            DVec2::new(10.0, 0.0),
            DVec2::new(-15.0, 0.0),
            std::f64::consts::FRAC_PI_2,
            2.0,
        )
    }

    #[test]
    fn test_valid_spec() {
        let spec = AgentSpec::basic("bot", 10.0)
            .with_part(arm())
            .with_controller(Controller::continuous("arm_motor", Actuator::Motor { part: "arm".into() }))
            .with_sensor(SensorSpec::new("eyes", SensorKind::Rgb, "arm"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_unknown_anchor_and_motor_part() {
        let mut bad = arm();
        bad.anchor = "torso".into();
        let spec = AgentSpec::basic("bot", 10.0).with_part(bad);
        assert_eq!(spec.validate(), Err(Error::UnknownPart { agent: "bot".into(), part: "torso".into() }));

        let spec = AgentSpec::basic("bot", 10.0).with_controller(Controller::continuous("m", Actuator::Motor { part: "base".into() }));
        assert!(matches!(spec.validate(), Err(Error::UnknownPart { .. })));
    }

    #[test]
    fn test_duplicate_names() {
        let spec = AgentSpec::basic("bot", 10.0).with_controller(Controller::boolean("grasp", Actuator::Grasp));
        assert!(matches!(spec.validate(), Err(Error::NameCollision(_))));
        let mut twin = arm();
        twin.part.name = "base".into();
        assert!(matches!(AgentSpec::basic("bot", 10.0).with_part(twin).validate(), Err(Error::NameCollision(_))));
    }

    #[test]
    fn test_pre_step_clears_flags() {
        let spec = AgentSpec::basic("bot", 10.0);
        let mut agent = Agent::new(AgentId(0), &spec, Uid(1));
        agent.reward = 3.0;
        agent.actuation.grasp = true;
        agent.rewarded_by.insert(Uid(4));
        agent.pre_step();
        assert_eq!(agent.reward, 0.0);
        assert_eq!(agent.actuation, Actuation::default());
        assert!(agent.rewarded_by.is_empty());
    }
}

//! Entities, their behaviours and the attachment forest.
//!
//! An entity is either detached (its pose lives here) or placed (its pose is
//! read from the body it owns or shares in the space). Fixed attachments
//! share the anchor's body and carry a constant `frame` offset; dynamic
//! attachments own a body joined to the anchor by pivot, limit and motor.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::api::SpaceApi;
use crate::error::Result;
use crate::geometry::{Primitive, ShapeDescriptor};
use crate::space::{BodyHandle, ConstraintHandle, ShapeHandle, Space};
use crate::spawner::CoordinateSampler;
use crate::types::{AgentId, CollisionType, Pose, Uid, rotate};

/// Extra reach of interaction halos when no range is configured.
pub const DEFAULT_INTERACTION_RANGE: f64 = 5.0;

/// What an activable element does when triggered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationEffect {
    Reward { reward: f64 },
    /// Remove the bound door element.
    OpenDoor { door: Uid },
    /// Produce a new temporary element.
    Dispense { spec: Box<EntitySpec>, sampler: CoordinateSampler },
}

/// Game logic attached to an element, read by the interaction handlers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    #[default]
    Inert,
    ContactReward { reward: f64, consumable: bool },
    Edible { reward: f64, shrink_ratio: f64, min_reward: f64 },
    Activable { effect: ActivationEffect },
    Zone { reward: f64, terminate: bool },
    /// Key that opens locks.
    Gem,
    Lock { door: Uid },
    Teleporter { destination: Pose },
}

/// Plain-data description of an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySpec {
    pub name: Option<String>,
    pub shape: ShapeDescriptor,
    /// `None` makes the entity static.
    pub mass: Option<f64>,
    pub collision_type: CollisionType,
    pub teams: Vec<String>,
    /// Traversable shapes are sensors: they report contacts but never block.
    pub traversable: bool,
    pub friction: f64,
    pub elasticity: f64,
    pub color: [f32; 3],
    /// When set, `collision_type` moves to a sensor halo this much larger than the shape.
    pub interaction_range: Option<f64>,
    pub graspable: bool,
    /// Temporary entities are dropped on reset.
    pub temporary: bool,
    pub behavior: Behavior,
}

impl Default for EntitySpec {
    fn default() -> Self {
        Self {
            name: None,
            shape: ShapeDescriptor::circle(10.0),
            mass: None,
            collision_type: CollisionType::DEFAULT,
            teams: Vec::new(),
            traversable: false,
            friction: 0.8,
            elasticity: 0.0,
            color: [0.5, 0.5, 0.5],
            interaction_range: None,
            graspable: false,
            temporary: false,
            behavior: Behavior::Inert,
        }
    }
}

impl EntitySpec {
    pub fn new(shape: ShapeDescriptor) -> Self {
        Self { shape, ..Default::default() }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mass(mut self, mass: f64) -> Self {
        self.mass = Some(mass);
        self
    }

    pub fn with_collision_type(mut self, collision_type: CollisionType) -> Self {
        self.collision_type = collision_type;
        self
    }

    pub fn with_teams<S: Into<String>>(mut self, teams: impl IntoIterator<Item = S>) -> Self {
        self.teams = teams.into_iter().map(Into::into).collect();
        self
    }

    pub fn traversable(mut self) -> Self {
        self.traversable = true;
        self
    }

    pub fn graspable(mut self) -> Self {
        self.graspable = true;
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn with_color(mut self, color: [f32; 3]) -> Self {
        self.color = color;
        self
    }

    pub fn with_interaction_range(mut self, range: f64) -> Self {
        self.interaction_range = Some(range);
        self
    }

    pub fn with_material(mut self, friction: f64, elasticity: f64) -> Self {
        self.friction = friction;
        self.elasticity = elasticity;
        self
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn contact_reward(shape: ShapeDescriptor, reward: f64, consumable: bool) -> Self {
        Self::new(shape).with_collision_type(CollisionType::CONTACT).with_behavior(Behavior::ContactReward { reward, consumable })
    }

    pub fn edible(shape: ShapeDescriptor, reward: f64) -> Self {
        Self::new(shape)
            .with_collision_type(CollisionType::EDIBLE)
            .with_interaction_range(DEFAULT_INTERACTION_RANGE)
            .with_behavior(Behavior::Edible { reward, shrink_ratio: 0.9, min_reward: 0.01 })
    }

    pub fn activable(shape: ShapeDescriptor, effect: ActivationEffect) -> Self {
        Self::new(shape)
            .with_collision_type(CollisionType::INTERACTIVE)
            .with_interaction_range(DEFAULT_INTERACTION_RANGE)
            .with_behavior(Behavior::Activable { effect })
    }

    pub fn zone(shape: ShapeDescriptor, reward: f64, terminate: bool) -> Self {
        Self::new(shape).with_collision_type(CollisionType::PASSIVE).traversable().with_behavior(Behavior::Zone { reward, terminate })
    }

    /// Movable key, picked up by grasping and consumed by a matching lock.
    pub fn gem(shape: ShapeDescriptor, mass: f64) -> Self {
        Self::new(shape).with_mass(mass).with_collision_type(CollisionType::GEM).graspable().with_behavior(Behavior::Gem)
    }

    pub fn lock(shape: ShapeDescriptor, door: Uid) -> Self {
        Self::new(shape).with_collision_type(CollisionType::ACTIVATABLE_BY_GEM).with_behavior(Behavior::Lock { door })
    }

    pub fn teleporter(shape: ShapeDescriptor, destination: Pose) -> Self {
        Self::new(shape)
            .with_collision_type(CollisionType::TELEPORT)
            .traversable()
            .with_behavior(Behavior::Teleporter { destination })
    }

    /// Collision type of the solid shape, and of each sensor halo around it.
    pub fn shape_roles(&self) -> (CollisionType, Vec<CollisionType>) {
        let mut halos = Vec::new();
        let mut main = self.collision_type;
        if self.interaction_range.is_some() {
            halos.push(self.collision_type);
            main = CollisionType::DEFAULT;
        }
        if self.graspable {
            halos.push(CollisionType::GRASPABLE);
            if main == CollisionType::GRASPABLE {
                main = CollisionType::DEFAULT;
            }
        }
        (main, halos)
    }

    pub fn halo_radius(&self) -> f64 {
        self.shape.bounding_radius() + self.interaction_range.unwrap_or(DEFAULT_INTERACTION_RANGE)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttachmentKind {
    /// Shares the anchor's body.
    Fixed,
    /// Own body, joined by pivot + rotary limit + motor.
    Dynamic { rotation_range: f64, max_torque: f64 },
}

/// Child-to-anchor relation, fixed at attach time.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub anchor: Uid,
    /// On the anchor, in the anchor's frame.
    pub anchor_point: DVec2,
    /// On the child, in the child's frame.
    pub pivot_point: DVec2,
    pub relative_angle: f64,
    pub kind: AttachmentKind,
}

impl Attachment {
    pub fn fixed(anchor: Uid, anchor_point: DVec2, pivot_point: DVec2, relative_angle: f64) -> Self {
        Self { anchor, anchor_point, pivot_point, relative_angle, kind: AttachmentKind::Fixed }
    }

    pub fn dynamic(anchor: Uid, anchor_point: DVec2, pivot_point: DVec2, relative_angle: f64, rotation_range: f64, max_torque: f64) -> Self {
        Self { anchor, anchor_point, pivot_point, relative_angle, kind: AttachmentKind::Dynamic { rotation_range, max_torque } }
    }

    /// `anchor.position + R(anchor.angle)·anchor_point − R(anchor.angle + rel)·pivot_point`.
    pub fn child_pose(&self, anchor: Pose) -> Pose {
        let angle = anchor.angle + self.relative_angle;
        Pose {
            position: anchor.position + rotate(self.anchor_point, anchor.angle) - rotate(self.pivot_point, angle),
            angle,
        }
    }

    /// Child frame relative to the anchor frame.
    pub fn offset(&self) -> Pose {
        self.child_pose(Pose::default())
    }
}

/// Where the authoritative pose of an entity lives.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityState {
    Detached { pose: Pose },
    Placed { body: BodyHandle, owns_body: bool, shapes: Vec<ShapeHandle> },
}

#[derive(Clone, Debug)]
pub struct Entity {
    pub uid: Uid,
    pub spec: EntitySpec,
    pub agent: Option<AgentId>,
    pub state: EntityState,
    /// This entity's frame inside its body's frame. Identity for body owners.
    pub frame: Pose,
    pub anchor: Option<Attachment>,
    pub children: Vec<Uid>,
    /// Pivot, limit, motor for dynamic attachments; materialized on placement.
    pub joints: Vec<ConstraintHandle>,
    pub motor: Option<ConstraintHandle>,
    pub removed: bool,
    pub moved: bool,
    /// Placement used at creation and on reset. Roots only.
    pub initial: CoordinateSampler,
    pub allow_overlapping: bool,
    /// Reward left in an edible.
    pub remaining_reward: f64,
    /// Activated during the current step.
    pub activated: bool,
    primitives: Vec<Primitive>,
}

fn initial_reward(behavior: &Behavior) -> f64 {
    match behavior {
        Behavior::Edible { reward, .. } => *reward,
        _ => 0.0,
    }
}

impl Entity {
    pub fn new(uid: Uid, spec: EntitySpec, agent: Option<AgentId>) -> Result<Self> {
        let primitives = spec.shape.primitives()?;
        Ok(Self {
            uid,
            agent,
            state: EntityState::Detached { pose: Pose::default() },
            frame: Pose::default(),
            anchor: None,
            children: Vec::new(),
            joints: Vec::new(),
            motor: None,
            removed: false,
            moved: false,
            initial: CoordinateSampler::from(Pose::default()),
            allow_overlapping: true,
            remaining_reward: initial_reward(&spec.behavior),
            activated: false,
            primitives,
            spec,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.spec.name.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.anchor.is_none()
    }

    pub fn is_placed(&self) -> bool {
        matches!(self.state, EntityState::Placed { .. })
    }

    pub fn body(&self) -> Option<BodyHandle> {
        match &self.state {
            EntityState::Placed { body, .. } => Some(*body),
            EntityState::Detached { .. } => None,
        }
    }

    pub fn owns_body(&self) -> bool {
        matches!(self.state, EntityState::Placed { owns_body: true, .. })
    }

    pub fn shapes(&self) -> &[ShapeHandle] {
        match &self.state {
            EntityState::Placed { shapes, .. } => shapes,
            EntityState::Detached { .. } => &[],
        }
    }

    /// Convex pieces in the entity frame.
    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    pub fn is_static(&self) -> bool {
        self.spec.mass.is_none()
    }

    /// World pose, read from the body when placed.
    pub fn pose(&self, space: &Space) -> Pose {
        match &self.state {
            EntityState::Detached { pose } => *pose,
            EntityState::Placed { body, .. } => match space.body(*body) {
                Some(b) => b.pose().compose(self.frame),
                None => Pose::default(),
            },
        }
    }

    /// Drop per-step flags.
    pub fn pre_step(&mut self) {
        self.moved = false;
        self.activated = false;
    }

    pub(crate) fn restore_behavior_state(&mut self) {
        self.remaining_reward = initial_reward(&self.spec.behavior);
        self.activated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_child_pose_identity_law() {
        let att = Attachment::fixed(Uid(1), DVec2::new(10.0, 0.0), DVec2::new(-5.0, 0.0), FRAC_PI_2);
        let anchor = Pose::new(100.0, 50.0, FRAC_PI_2);
        let child = att.child_pose(anchor);
        // anchor point lands on (100, 60); the pivot, turned by pi, sits at (5, 0) from the child
        assert!((child.position - DVec2::new(95.0, 60.0)).length() < 1e-9);
        assert!((child.angle - std::f64::consts::PI).abs() < 1e-12);
        // Offset composition agrees with the direct formula.
        let composed = anchor.compose(att.offset());
        assert!((composed.position - child.position).length() < 1e-9);
    }

    #[test]
    fn test_halo_roles() {
        let spec = EntitySpec::gem(ShapeDescriptor::circle(5.0), 1.0);
        assert_eq!(spec.shape_roles(), (CollisionType::GEM, vec![CollisionType::GRASPABLE]));
        let spec = EntitySpec::activable(ShapeDescriptor::circle(5.0), ActivationEffect::Reward { reward: 1.0 });
        assert_eq!(spec.shape_roles(), (CollisionType::DEFAULT, vec![CollisionType::INTERACTIVE]));
        assert_eq!(spec.halo_radius(), 10.0);
    }

    #[test]
    fn test_detached_entity_reports_stored_pose() {
        let mut e = Entity::new(Uid(3), EntitySpec::edible(ShapeDescriptor::circle(4.0), 2.0), None).unwrap();
        assert!(!e.is_placed());
        assert_eq!(e.remaining_reward, 2.0);
        e.state = EntityState::Detached { pose: Pose::new(1.0, 2.0, 0.0) };
        let space = Space::new(Default::default());
        assert_eq!(e.pose(&space), Pose::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn test_spec_from_json() {
        let spec: EntitySpec = serde_json::from_str(
            r#"{ "shape": { "kind": "rectangle", "width": 10.0, "height": 4.0 }, "mass": 2.0,
                 "behavior": { "kind": "contact_reward", "reward": 1.5, "consumable": true } }"#,
        )
        .unwrap();
        assert_eq!(spec.mass, Some(2.0));
        assert_eq!(spec.behavior, Behavior::ContactReward { reward: 1.5, consumable: true });
        assert!(!spec.traversable);
    }
}

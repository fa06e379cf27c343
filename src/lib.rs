//! playbonk: deterministic 2D multi-agent physics playground (rigid bodies, joints, ray sensors, contact-driven interactions)

pub mod types;
pub mod error;
pub mod config;
pub mod geometry;
pub mod api;
pub mod narrowphase;
pub mod body;
pub mod constraint;
pub mod space;
pub mod spawner;
pub mod entity;
pub mod interaction;
pub mod controller;
pub mod sensor;
pub mod agent;
pub mod observation;
pub mod playground;
pub mod stepping;

pub use crate::types::*;
pub use crate::api::*;
pub use crate::error::{Error, ErrorClass, Result};
pub use crate::config::{PlaygroundConfig, SpaceConfig, TeamPolicy};
pub use crate::geometry::{Primitive, ShapeDescriptor, ShapeParams, moment_for};
pub use crate::body::{BodyKind, RigidBody};
pub use crate::constraint::{Constraint, ConstraintKind};
pub use crate::space::{
    BodyHandle, ConstraintHandle, ContactEvent, QueryFilter, SegmentQueryHit, Shape, ShapeHandle, ShapeQueryHit, Space,
};
pub use crate::spawner::{CoordinateSampler, Spawner};
pub use crate::entity::{ActivationEffect, Attachment, AttachmentKind, Behavior, Entity, EntitySpec, EntityState};
pub use crate::interaction::{CommandQueue, DeferredCommand, Handler, InteractionContext, Interactions, Participant};
pub use crate::controller::{Actuator, CommandValue, Controller, ControllerKind};
pub use crate::sensor::{Detection, RaySensor, Reduction, SensorKind, SensorSpec, ray_angles};
pub use crate::agent::{Agent, AgentSpec, AnchoredPartSpec, PartJoint, PartSpec};
pub use crate::observation::{EntityView, Observation, ResetOutput, SpaceSpec, StepInfo, StepOutput};
pub use crate::playground::Playground;
pub use crate::stepping::Commands;

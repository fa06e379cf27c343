//! The playground: owns the space, every entity and agent, and the
//! bookkeeping that ties shapes back to them.
//!
//! All structural mutation (placing, removing, moving) happens here, outside
//! the physics sub-steps. Contact handlers only enqueue intents.

use std::collections::{BTreeMap, BTreeSet};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentPart, AgentSpec, GraspHold, PartJoint};
use crate::api::SpaceApi;
use crate::body::RigidBody;
use crate::config::{PlaygroundConfig, SpaceConfig, TeamPolicy};
use crate::constraint::Constraint;
use crate::entity::{Attachment, AttachmentKind, Entity, EntitySpec, EntityState};
use crate::error::{Error, Result};
use crate::geometry::{Primitive, moment_for};
use crate::interaction::{CommandQueue, Handler, Interactions};
use crate::observation::{EntityView, SpaceSpec};
use crate::sensor::RaySensor;
use crate::space::{BodyHandle, QueryFilter, Shape, Space};
use crate::spawner::{CoordinateSampler, Spawner};
use crate::types::{AgentId, CollisionType, CollisionTypes, LayerMask, Pose, ShapeOwner, Uid, UidGenerator};

/// Local anchors of the two pins created by a grasp, on the grasping part.
const GRASP_PIN_OFFSET: f64 = 5.0;

fn check_finite(pose: Pose) -> Result<()> {
    if pose.position.is_finite() && pose.angle.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("pose must be finite, got {pose:?}")))
    }
}

pub struct Playground {
    pub cfg: PlaygroundConfig,
    pub(crate) space: Space,
    pub(crate) timestep: u64,
    pub(crate) done: bool,
    pub(crate) rng: StdRng,
    uids: UidGenerator,
    pub collision_types: CollisionTypes,
    teams: Vec<String>,
    pub(crate) entities: BTreeMap<Uid, Entity>,
    pub(crate) agents: Vec<Agent>,
    pub(crate) spawners: Vec<Spawner>,
    pub(crate) interactions: Interactions,
    pub(crate) queue: CommandQueue,
}

impl std::fmt::Debug for Playground {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playground")
            .field("timestep", &self.timestep)
            .field("entities", &self.entities.len())
            .field("agents", &self.agents.len())
            .field("done", &self.done)
            .finish()
    }
}

impl Playground {
    pub fn new(cfg: PlaygroundConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            space: Space::new(SpaceConfig::from(&cfg)),
            timestep: 0,
            done: false,
            rng: StdRng::seed_from_u64(cfg.seed),
            uids: UidGenerator::default(),
            collision_types: CollisionTypes::default(),
            teams: Vec::new(),
            entities: BTreeMap::new(),
            agents: Vec::new(),
            spawners: Vec::new(),
            interactions: Interactions::with_builtins(),
            queue: CommandQueue::default(),
            cfg,
        })
    }

    // --- Accessors ---------------------------------------------------------

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn entity(&self, uid: Uid) -> Option<&Entity> {
        self.entities.get(&uid)
    }

    pub fn entity_pose(&self, uid: Uid) -> Option<Pose> {
        self.entities.get(&uid).map(|e| e.pose(&self.space))
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(id.0)
    }

    pub fn agent_by_name(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Live entities that are not agent parts, in insertion order.
    pub fn elements(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(move |e| !e.removed && !self.is_agent_part(e.uid))
    }

    /// Whether `uid` is one of an agent's own parts, as opposed to an element attached to one.
    pub fn is_agent_part(&self, uid: Uid) -> bool {
        let agent = self.entities.get(&uid).and_then(|e| e.agent);
        agent.and_then(|a| self.agents.get(a.0)).is_some_and(|a| a.owns(uid))
    }

    /// Entities the sensor of an agent must not see: everything hanging off its base plus
    /// whatever the agent itself reports.
    pub(crate) fn invisible_to(&self, agent: &Agent, sensor: &RaySensor) -> BTreeSet<Uid> {
        let mut invisible = agent.invisible_to(sensor);
        invisible.extend(self.subtree(agent.base));
        invisible
    }

    pub fn spawners(&self) -> &[Spawner] {
        &self.spawners
    }

    /// Current motor rate of a jointed part.
    pub fn motor_rate(&self, uid: Uid) -> Option<f64> {
        let motor = self.entities.get(&uid)?.motor?;
        self.space.constraint(motor)?.rate()
    }

    /// Renderer-facing state of every placed entity.
    pub fn views(&self) -> Vec<EntityView> {
        self.entities
            .values()
            .filter(|e| e.is_placed())
            .map(|e| {
                let pose = e.pose(&self.space);
                EntityView {
                    uid: e.uid,
                    name: e.spec.name.clone(),
                    position: pose.position,
                    angle: pose.angle,
                    moved: e.moved,
                    color: e.spec.color,
                }
            })
            .collect()
    }

    pub fn action_space(&self) -> SpaceSpec {
        SpaceSpec::dict(self.agents.iter().map(|a| {
            (a.name.clone(), SpaceSpec::dict(a.controllers.iter().map(|c| (c.name.clone(), c.space()))))
        }))
    }

    pub fn observation_space(&self) -> SpaceSpec {
        SpaceSpec::dict(self.agents.iter().map(|a| {
            (a.name.clone(), SpaceSpec::dict(a.sensors.iter().map(|s| (s.name().to_string(), s.space()))))
        }))
    }

    // --- Setup -------------------------------------------------------------

    /// Install a handler for an unordered pair of collision types.
    pub fn register_interaction(&mut self, a: CollisionType, b: CollisionType, handler: Handler) -> Result<()> {
        self.interactions.register(a, b, handler)
    }

    pub fn add_spawner(&mut self, spawner: Spawner) -> Result<()> {
        if !(0.0..=1.0).contains(&spawner.probability) {
            return Err(Error::InvalidConfig(format!("spawner probability must be in [0, 1], got {}", spawner.probability)));
        }
        spawner.template.shape.validate()?;
        self.team_bits(&spawner.template.teams)?;
        self.spawners.push(spawner);
        Ok(())
    }

    fn team_bits(&mut self, teams: &[String]) -> Result<u32> {
        let mut bits = 0u32;
        for team in teams {
            let index = match self.teams.iter().position(|t| t == team) {
                Some(i) => i,
                None => {
                    if self.teams.len() >= 31 {
                        return Err(Error::InvalidConfig(format!("too many teams, cannot add {team:?}")));
                    }
                    self.teams.push(team.clone());
                    self.teams.len() - 1
                }
            };
            bits |= 1 << (index + 1);
        }
        Ok(bits)
    }

    /// Collision filter of a shape whose entity belongs to `teams`.
    fn team_mask(&mut self, teams: &[String]) -> Result<LayerMask> {
        let bits = self.team_bits(teams)?;
        if bits == 0 {
            return Ok(LayerMask::ALL);
        }
        Ok(match self.cfg.team_policy {
            TeamPolicy::IgnoreTeammates => LayerMask { layer: bits, collides_with: u32::MAX, exclude: bits },
            TeamPolicy::OnlyTeammates => LayerMask { layer: bits, collides_with: bits | LayerMask::ALL.layer, exclude: 0 },
        })
    }

    /// Create a root element at a sampled pose.
    pub fn add_element(
        &mut self,
        spec: EntitySpec,
        coordinates: impl Into<CoordinateSampler>,
        allow_overlapping: bool,
    ) -> Result<Uid> {
        self.team_bits(&spec.teams)?;
        let uid = self.uids.issue();
        let mut entity = Entity::new(uid, spec, None)?;
        entity.initial = coordinates.into();
        entity.allow_overlapping = allow_overlapping;
        let sampler = entity.initial.clone();
        self.entities.insert(uid, entity);

        let placed = self.find_pose(uid, &sampler, allow_overlapping).and_then(|pose| self.place_subtree(uid, pose));
        if let Err(e) = placed {
            self.entities.remove(&uid);
            return Err(e);
        }
        debug!(uid = uid.0, name = ?self.entities.get(&uid).and_then(|e| e.name()), "element added");
        Ok(uid)
    }

    /// Create an element attached to an entity that is already placed.
    pub fn attach_element(&mut self, spec: EntitySpec, attachment: Attachment) -> Result<Uid> {
        let anchor = self.entities.get(&attachment.anchor).ok_or(Error::UnknownEntity(attachment.anchor))?;
        if !anchor.is_placed() {
            return Err(Error::UnknownEntity(attachment.anchor));
        }
        let agent = anchor.agent;
        self.team_bits(&spec.teams)?;
        let uid = self.uids.issue();
        let mut entity = Entity::new(uid, spec, agent)?;
        entity.anchor = Some(attachment);
        self.entities.insert(uid, entity);
        if let Err(e) = self.place_child(uid) {
            self.entities.remove(&uid);
            return Err(e);
        }
        if let Some(anchor) = self.entities.get_mut(&attachment.anchor) {
            anchor.children.push(uid);
        }
        debug!(uid = uid.0, anchor = attachment.anchor.0, "element attached");
        Ok(uid)
    }

    pub fn add_agent(
        &mut self,
        spec: AgentSpec,
        coordinates: impl Into<CoordinateSampler>,
        allow_overlapping: bool,
    ) -> Result<AgentId> {
        if self.agents.iter().any(|a| a.name == spec.name) {
            return Err(Error::NameCollision(spec.name));
        }
        spec.validate()?;
        self.team_bits(&spec.teams)?;

        let id = AgentId(self.agents.len());
        let base = self.uids.issue();
        let mut created = vec![base];
        self.entities.insert(base, Entity::new(base, spec.base.entity_spec(&spec.teams), Some(id))?);
        let mut agent = Agent::new(id, &spec, base);

        for p in &spec.parts {
            let Some(anchor) = agent.part(&p.anchor).map(|part| part.uid) else {
                self.forget(&created);
                return Err(Error::UnknownPart { agent: spec.name.clone(), part: p.anchor.clone() });
            };
            let uid = self.uids.issue();
            let mut entity = match Entity::new(uid, p.part.entity_spec(&spec.teams), Some(id)) {
                Ok(e) => e,
                Err(e) => {
                    self.forget(&created);
                    return Err(e);
                }
            };
            entity.anchor = Some(p.attachment(anchor));
            self.entities.insert(uid, entity);
            created.push(uid);
            if let Some(a) = self.entities.get_mut(&anchor) {
                a.children.push(uid);
            }
            let rotation_speed = match p.joint {
                PartJoint::Revolute { rotation_speed, .. } => rotation_speed,
                PartJoint::Fixed => 0.0,
            };
            agent.parts.push(AgentPart { name: p.part.name.clone(), uid, rotation_speed });
        }

        for s in &spec.sensors {
            let sensor = agent.part(&s.anchor).map(|part| RaySensor::new(s.clone(), part.uid));
            match sensor {
                Some(Ok(sensor)) => agent.sensors.push(sensor),
                Some(Err(e)) => {
                    self.forget(&created);
                    return Err(e);
                }
                None => {
                    self.forget(&created);
                    return Err(Error::UnknownPart { agent: spec.name.clone(), part: s.anchor.clone() });
                }
            }
        }

        agent.initial = coordinates.into();
        agent.allow_overlapping = allow_overlapping;
        let sampler = agent.initial.clone();
        let placed = self.find_pose(base, &sampler, allow_overlapping).and_then(|pose| self.place_subtree(base, pose));
        if let Err(e) = placed {
            self.forget(&created);
            return Err(e);
        }
        debug!(agent = %agent.name, parts = agent.parts.len(), sensors = agent.sensors.len(), "agent added");
        self.agents.push(agent);
        Ok(id)
    }

    /// Take entities out of the space if needed and drop their records.
    fn forget(&mut self, uids: &[Uid]) {
        for uid in uids.iter().rev() {
            if let Err(e) = self.unplace(*uid) {
                warn!(uid = uid.0, error = %e, "entity left in the space");
            }
            self.entities.remove(uid);
        }
    }

    // --- Placement ---------------------------------------------------------

    /// `uid` and every entity attached below it, parents before children.
    pub fn subtree(&self, uid: Uid) -> Vec<Uid> {
        let mut out = Vec::new();
        let mut stack = vec![uid];
        while let Some(u) = stack.pop() {
            if let Some(e) = self.entities.get(&u) {
                out.push(u);
                stack.extend(e.children.iter().rev().copied());
            }
        }
        out
    }

    /// Where every member of the subtree would sit if its root were at `root`.
    fn subtree_poses(&self, uid: Uid, root: Pose) -> Vec<(Uid, Pose)> {
        let mut out = Vec::new();
        let mut stack = vec![(uid, root)];
        while let Some((u, pose)) = stack.pop() {
            let Some(e) = self.entities.get(&u) else { continue };
            out.push((u, pose));
            for child in e.children.iter().rev() {
                if let Some(att) = self.entities.get(child).and_then(|c| c.anchor) {
                    stack.push((*child, att.child_pose(pose)));
                }
            }
        }
        out
    }

    /// Whether the subtree at `root` would overlap a solid shape outside it.
    fn overlaps(&self, uid: Uid, root: Pose) -> bool {
        let members: BTreeSet<Uid> = self.subtree(uid).into_iter().collect();
        let filter = QueryFilter::default().excluding(&members);
        self.subtree_poses(uid, root).into_iter().any(|(u, pose)| {
            let Some(e) = self.entities.get(&u) else { return false };
            !e.spec.traversable
                && e.primitives().iter().any(|p| !self.space.shape_query(&p.transformed(&pose), &filter).is_empty())
        })
    }

    /// Sample until the subtree fits, within the retry budget.
    pub(crate) fn find_pose(&mut self, uid: Uid, sampler: &CoordinateSampler, allow_overlapping: bool) -> Result<Pose> {
        if allow_overlapping {
            let pose = sampler.sample(&mut self.rng);
            check_finite(pose)?;
            return Ok(pose);
        }
        let attempts = if sampler.is_fixed() { 1 } else { self.cfg.placement_retries.max(1) };
        for _ in 0..attempts {
            let pose = sampler.sample(&mut self.rng);
            check_finite(pose)?;
            if !self.overlaps(uid, pose) {
                return Ok(pose);
            }
        }
        warn!(uid = uid.0, attempts, "no free placement found");
        Err(Error::PlacementRetryExhausted { attempts })
    }

    /// Shapes for one entity on `body`, its solid pieces offset by `frame` plus any sensor halos.
    fn build_shapes(&mut self, uid: Uid, frame: Pose) -> Result<Vec<Shape>> {
        let e = self.entities.get(&uid).ok_or(Error::UnknownEntity(uid))?;
        let spec = e.spec.clone();
        let owner = ShapeOwner { entity: uid, agent: e.agent };
        let group = e.agent.map_or(0, |a| a.0 as u32 + 1);
        let primitives: Vec<Primitive> = e.primitives().iter().map(|p| p.transformed(&frame)).collect();
        let mask = self.team_mask(&spec.teams)?;
        let (main, halos) = spec.shape_roles();

        let mut shapes: Vec<Shape> = primitives
            .into_iter()
            .map(|p| {
                Shape::new(p, owner)
                    .with_collision_type(main)
                    .with_mask(mask)
                    .with_group(group)
                    .with_sensor(spec.traversable)
                    .with_material(spec.friction, spec.elasticity)
            })
            .collect();
        for halo in halos {
            let circle = Primitive::Circle { center: frame.position, radius: spec.halo_radius() };
            shapes.push(Shape::new(circle, owner).with_collision_type(halo).with_mask(mask).with_group(group).with_sensor(true));
        }
        Ok(shapes)
    }

    fn new_body(spec: &EntitySpec, pose: Pose) -> Result<RigidBody> {
        Ok(match spec.mass {
            Some(mass) => RigidBody::new_dynamic(mass, moment_for(mass, &spec.shape)?, pose),
            None => RigidBody::new_static(pose),
        })
    }

    fn place_root(&mut self, uid: Uid, pose: Pose) -> Result<()> {
        let e = self.entities.get(&uid).ok_or(Error::UnknownEntity(uid))?;
        if e.is_placed() {
            return Err(Error::AlreadyInPlayground(uid));
        }
        let body = Self::new_body(&e.spec, pose)?;
        let shapes = self.build_shapes(uid, Pose::default())?;
        let handle = self.space.add_body(body);
        let mut handles = Vec::with_capacity(shapes.len());
        for s in shapes {
            handles.push(self.space.add_shape(handle, s)?);
        }
        if let Some(e) = self.entities.get_mut(&uid) {
            e.frame = Pose::default();
            e.state = EntityState::Placed { body: handle, owns_body: true, shapes: handles };
            e.removed = false;
            e.moved = true;
        }
        Ok(())
    }

    /// Materialize an attached entity next to its placed anchor.
    fn place_child(&mut self, uid: Uid) -> Result<()> {
        let e = self.entities.get(&uid).ok_or(Error::UnknownEntity(uid))?;
        if e.is_placed() {
            return Err(Error::AlreadyInPlayground(uid));
        }
        let att = e.anchor.ok_or(Error::Invariant("child without attachment"))?;
        let spec = e.spec.clone();
        let anchor = self.entities.get(&att.anchor).ok_or(Error::UnknownEntity(att.anchor))?;
        let anchor_body = anchor.body().ok_or(Error::UnknownEntity(att.anchor))?;
        let anchor_frame = anchor.frame;

        match att.kind {
            AttachmentKind::Fixed => {
                let frame = anchor_frame.compose(att.offset());
                let shapes = self.build_shapes(uid, frame)?;
                let mut handles = Vec::with_capacity(shapes.len());
                for s in shapes {
                    handles.push(self.space.add_shape(anchor_body, s)?);
                }
                if let Some(e) = self.entities.get_mut(&uid) {
                    e.frame = frame;
                    e.state = EntityState::Placed { body: anchor_body, owns_body: false, shapes: handles };
                }
            }
            AttachmentKind::Dynamic { rotation_range, max_torque } => {
                if spec.mass.is_none() {
                    return Err(Error::InvalidConfig(format!("jointed entity {} needs a mass", uid.0)));
                }
                let anchor_pose = self.entities.get(&att.anchor).map(|a| a.pose(&self.space)).unwrap_or_default();
                let body = Self::new_body(&spec, att.child_pose(anchor_pose))?;
                let shapes = self.build_shapes(uid, Pose::default())?;
                let handle = self.space.add_body(body);
                let mut handles = Vec::with_capacity(shapes.len());
                for s in shapes {
                    handles.push(self.space.add_shape(handle, s)?);
                }
                // Limit is expressed on body angles; the anchor's frame may already be rotated on its body.
                let rest = anchor_frame.angle + att.relative_angle;
                let pivot = Constraint::pivot(anchor_body, handle, anchor_frame.transform_point(att.anchor_point), att.pivot_point);
                let limit = Constraint::rotary_limit(anchor_body, handle, rest - rotation_range / 2.0, rest + rotation_range / 2.0);
                let motor = Constraint::motor(anchor_body, handle, 0.0).with_max_force(max_torque);
                let joints = vec![self.space.add_constraint(pivot)?, self.space.add_constraint(limit)?];
                let motor = self.space.add_constraint(motor)?;
                if let Some(e) = self.entities.get_mut(&uid) {
                    e.frame = Pose::default();
                    e.state = EntityState::Placed { body: handle, owns_body: true, shapes: handles };
                    e.joints = joints;
                    e.motor = Some(motor);
                }
            }
        }
        if let Some(e) = self.entities.get_mut(&uid) {
            e.removed = false;
            e.moved = true;
        }
        Ok(())
    }

    /// Place a detached root and everything attached below it.
    pub(crate) fn place_subtree(&mut self, uid: Uid, pose: Pose) -> Result<()> {
        self.place_root(uid, pose)?;
        self.place_missing_children(uid)
    }

    /// Place every detached descendant of a placed entity.
    pub(crate) fn place_missing_children(&mut self, uid: Uid) -> Result<()> {
        for member in self.subtree(uid).into_iter().skip(1) {
            if !self.entities.get(&member).is_some_and(Entity::is_placed) {
                self.place_child(member)?;
            }
        }
        Ok(())
    }

    // --- Removal -----------------------------------------------------------

    /// Take an element and everything attached below it out of the space.
    ///
    /// Non-definitive removals keep the records so `reset` can bring them back.
    /// Temporary entities are always dropped.
    pub fn remove_entity(&mut self, uid: Uid, definitive: bool) -> Result<()> {
        if self.is_agent_part(uid) {
            return Err(Error::Invariant("agent parts cannot be removed"));
        }
        let e = self.entities.get(&uid).ok_or(Error::UnknownEntity(uid))?;
        let parent = e.anchor.map(|a| a.anchor);
        let members = self.subtree(uid);
        for agent in 0..self.agents.len() {
            self.release_grasps(AgentId(agent), |g| members.contains(&g.target) || members.contains(&g.part));
        }
        for member in members.iter().rev() {
            self.unplace(*member)?;
        }

        let drop_records = definitive || self.entities.get(&uid).is_some_and(|e| e.spec.temporary);
        if drop_records {
            self.forget(&members);
            if let Some(p) = parent.and_then(|p| self.entities.get_mut(&p)) {
                p.children.retain(|c| *c != uid);
            }
        } else {
            // Temporary descendants never come back.
            let temporaries: Vec<Uid> =
                members.iter().copied().filter(|m| self.entities.get(m).is_some_and(|e| e.spec.temporary)).collect();
            for t in &temporaries {
                let anchor = self.entities.get(t).and_then(|e| e.anchor).map(|a| a.anchor);
                if let Some(a) = anchor.and_then(|a| self.entities.get_mut(&a)) {
                    a.children.retain(|c| c != t);
                }
            }
            self.forget(&temporaries);
        }
        debug!(uid = uid.0, definitive = drop_records, count = members.len(), "entity removed");
        Ok(())
    }

    /// Detach one entity from the space, leaving its record behind.
    fn unplace(&mut self, uid: Uid) -> Result<()> {
        let Some(e) = self.entities.get(&uid) else { return Ok(()) };
        let pose = e.pose(&self.space);
        let EntityState::Placed { body, owns_body, shapes } = e.state.clone() else { return Ok(()) };
        let joints: Vec<_> = e.joints.iter().copied().chain(e.motor).collect();
        for c in joints {
            self.space.remove_constraint(c);
        }
        for s in shapes {
            self.space.remove_shape(s);
        }
        if owns_body {
            for c in self.space.constraints_of(body) {
                self.space.remove_constraint(c);
            }
            self.space.remove_body(body)?;
        }
        if let Some(e) = self.entities.get_mut(&uid) {
            e.state = EntityState::Detached { pose };
            e.joints.clear();
            e.motor = None;
            e.removed = true;
            e.moved = false;
        }
        Ok(())
    }

    // --- Motion ------------------------------------------------------------

    /// Teleport a root entity and its whole subtree, zeroing velocities.
    pub fn move_to(&mut self, uid: Uid, pose: Pose, allow_overlapping: bool) -> Result<()> {
        let e = self.entities.get(&uid).ok_or(Error::UnknownEntity(uid))?;
        if !e.is_root() {
            return Err(Error::Invariant("only root entities can be moved"));
        }
        check_finite(pose)?;
        if !allow_overlapping && self.overlaps(uid, pose) {
            return Err(Error::PlacementRetryExhausted { attempts: 1 });
        }
        match e.body() {
            None => {
                if let Some(e) = self.entities.get_mut(&uid) {
                    e.state = EntityState::Detached { pose };
                }
            }
            Some(body) => {
                self.set_body_pose(body, pose);
                self.move_children(uid, pose);
            }
        }
        if let Some(e) = self.entities.get_mut(&uid) {
            e.moved = true;
        }
        Ok(())
    }

    fn set_body_pose(&mut self, body: BodyHandle, pose: Pose) {
        if let Some(b) = self.space.body_mut(body) {
            b.set_pose(pose);
            b.halt();
        }
        self.space.reindex_shapes_for_body(body);
    }

    /// Reposition the children of an entity that was just moved to `pose`.
    fn move_children(&mut self, uid: Uid, pose: Pose) {
        let children = self.entities.get(&uid).map(|e| e.children.clone()).unwrap_or_default();
        for child in children {
            let Some(c) = self.entities.get(&child) else { continue };
            let Some(att) = c.anchor else { continue };
            let child_pose = att.child_pose(pose);
            if let (AttachmentKind::Dynamic { .. }, Some(body)) = (att.kind, c.body()) {
                self.set_body_pose(body, child_pose);
            }
            if let Some(c) = self.entities.get_mut(&child) {
                c.moved = true;
            }
            self.move_children(child, child_pose);
        }
    }

    // --- Grasping ----------------------------------------------------------

    /// Pin `target` to one of the agent's parts.
    pub(crate) fn grasp(&mut self, agent: AgentId, part: Uid, target: Uid) -> Result<()> {
        let a = self.agents.get(agent.0).ok_or(Error::Invariant("grasp by unknown agent"))?;
        if a.is_holding(target) {
            return Ok(());
        }
        let (Some(p), Some(t)) = (self.entities.get(&part), self.entities.get(&target)) else { return Ok(()) };
        let (Some(pb), Some(tb)) = (p.body(), t.body()) else { return Ok(()) };
        let (Some(part_body), Some(target_body)) = (self.space.body(pb), self.space.body(tb)) else { return Ok(()) };
        let mut pins = Vec::with_capacity(2);
        for side in [1.0, -1.0] {
            let anchor = p.frame.transform_point(glam::DVec2::new(0.0, side * GRASP_PIN_OFFSET));
            pins.push(Constraint::pin((pb, part_body), (tb, target_body), anchor, t.frame.position));
        }
        let mut joints = Vec::with_capacity(2);
        for pin in pins {
            joints.push(self.space.add_constraint(pin)?);
        }
        debug!(agent = agent.0, part = part.0, target = target.0, "grasped");
        if let Some(a) = self.agents.get_mut(agent.0) {
            a.grasps.push(GraspHold { part, target, joints });
        }
        Ok(())
    }

    pub(crate) fn release_grasps(&mut self, agent: AgentId, mut which: impl FnMut(&GraspHold) -> bool) {
        let Some(a) = self.agents.get_mut(agent.0) else { return };
        let (released, kept): (Vec<_>, Vec<_>) = a.grasps.drain(..).partition(|g| which(g));
        a.grasps = kept;
        for g in released {
            for c in g.joints {
                self.space.remove_constraint(c);
            }
        }
    }
}

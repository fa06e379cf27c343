//! The per-step state machine: pre_step, commands, physics sub-steps,
//! post_step, observation. Plus `reset`.

use std::collections::BTreeMap;

use glam::DVec2;
use tracing::{debug, trace, warn};

use crate::api::SpaceApi;
use crate::controller::{Actuator, CommandValue};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::interaction::{DeferredCommand, Dispatcher, InteractionContext};
use crate::observation::{AgentObservation, ResetOutput, StepInfo, StepOutput};
use crate::playground::Playground;
use crate::types::{AgentId, Uid, rotate};

/// Agent name -> controller name -> command. Missing commands use the controller default.
pub type Commands = BTreeMap<String, BTreeMap<String, CommandValue>>;

impl Playground {
    /// Advance the playground by one step of `physics_steps` sub-steps.
    ///
    /// Commands are validated before anything changes, so a rejected command leaves the playground untouched.
    pub fn step(&mut self, commands: &Commands) -> Result<StepOutput> {
        let resolved = self.resolve_commands(commands)?;
        self.pre_step();
        self.apply_commands(resolved);

        let dt = self.cfg.sub_dt();
        for _ in 0..self.cfg.physics_steps {
            let mut hook = Dispatcher {
                interactions: &mut self.interactions,
                ctx: InteractionContext {
                    entities: &mut self.entities,
                    agents: self.agents.as_mut_slice(),
                    queue: &mut self.queue,
                    done: &mut self.done,
                },
            };
            self.space.step(dt, &mut hook);
        }

        self.post_step()?;
        let observations = self.observe();
        self.timestep += 1;
        trace!(timestep = self.timestep, done = self.done, "step");
        Ok(StepOutput { observations, rewards: self.rewards(), done: self.done, info: StepInfo { timestep: self.timestep } })
    }

    fn resolve_commands(&self, commands: &Commands) -> Result<Vec<Vec<CommandValue>>> {
        if let Some(unknown) = commands.keys().find(|name| self.agent_by_name(name).is_none()) {
            return Err(Error::UnknownAgent(unknown.clone()));
        }
        self.agents
            .iter()
            .map(|agent| {
                let given = commands.get(&agent.name);
                if let Some(unknown) = given.and_then(|g| g.keys().find(|c| agent.controller(c).is_none())) {
                    return Err(Error::UnknownController { agent: agent.name.clone(), controller: unknown.clone() });
                }
                agent
                    .controllers
                    .iter()
                    .map(|c| match given.and_then(|g| g.get(&c.name)) {
                        Some(value) => c.check(&agent.name, *value),
                        None => Ok(c.default_value()),
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }

    /// Clear every per-step flag, motor rate and accumulated force.
    pub fn pre_step(&mut self) {
        for e in self.entities.values_mut() {
            e.pre_step();
            if let Some(motor) = e.motor.and_then(|m| self.space.constraint_mut(m)) {
                motor.set_rate(0.0);
            }
        }
        for agent in &mut self.agents {
            agent.pre_step();
        }
        self.space.reset_forces();
    }

    fn apply_commands(&mut self, resolved: Vec<Vec<CommandValue>>) {
        for (i, values) in resolved.into_iter().enumerate() {
            let agent = &mut self.agents[i];
            for (c, v) in agent.controllers.iter_mut().zip(values) {
                c.set(v);
            }
            let base = self.entities.get(&agent.base).and_then(Entity::body);
            let heading = base.and_then(|b| self.space.body(b)).map_or(0.0, |b| b.angle);

            for c in &agent.controllers {
                let v = c.scalar();
                match &c.actuator {
                    Actuator::Forward { force } => {
                        if let Some(b) = base.and_then(|b| self.space.body_mut(b)) {
                            b.apply_force(rotate(DVec2::new(force * v, 0.0), heading));
                        }
                    }
                    Actuator::Lateral { force } => {
                        if let Some(b) = base.and_then(|b| self.space.body_mut(b)) {
                            b.apply_force(rotate(DVec2::new(0.0, force * v), heading));
                        }
                    }
                    Actuator::Rotation { torque } => {
                        if let Some(b) = base.and_then(|b| self.space.body_mut(b)) {
                            b.apply_torque(torque * v);
                        }
                    }
                    Actuator::Motor { part } => {
                        let Some(p) = agent.part(part) else { continue };
                        let motor = self.entities.get(&p.uid).and_then(|e| e.motor);
                        if let Some(m) = motor.and_then(|m| self.space.constraint_mut(m)) {
                            m.set_rate(v * p.rotation_speed);
                        }
                    }
                    Actuator::Grasp => agent.actuation.grasp |= c.is_active(),
                    Actuator::Activate => agent.actuation.activate |= c.is_active(),
                    Actuator::Eat => agent.actuation.eat |= c.is_active(),
                }
            }

            let release = !agent.actuation.grasp && !agent.grasps.is_empty();
            if release {
                self.release_grasps(AgentId(i), |_| true);
            }
        }
    }

    fn post_step(&mut self) -> Result<()> {
        for agent in &mut self.agents {
            agent.cumulative_reward += agent.reward;
        }
        let commands = self.queue.drain();
        if !commands.is_empty() {
            debug!(count = commands.len(), "applying deferred commands");
        }
        for command in commands {
            self.apply_deferred(command)?;
        }
        self.produce()
    }

    fn apply_deferred(&mut self, command: DeferredCommand) -> Result<()> {
        match command {
            DeferredCommand::Remove { entity, definitive } => {
                if self.entities.get(&entity).is_some_and(Entity::is_placed) && !self.is_agent_part(entity) {
                    self.remove_entity(entity, definitive)?;
                }
            }
            DeferredCommand::Add { spec, sampler } => match self.add_element(spec, sampler, false) {
                Ok(uid) => debug!(uid = uid.0, "dispensed"),
                Err(e) if e.is_recoverable() => warn!(error = %e, "dispense skipped"),
                Err(e) => return Err(e),
            },
            DeferredCommand::Grasp { agent, part, target } => {
                if self.entities.get(&target).is_some_and(Entity::is_placed) {
                    self.grasp(agent, part, target)?;
                }
            }
            DeferredCommand::Teleport { agent, pose } => {
                let Some(base) = self.agent(agent).map(|a| a.base) else { return Ok(()) };
                self.release_grasps(agent, |_| true);
                self.move_to(base, pose, true)?;
                debug!(agent = agent.0, x = pose.position.x, y = pose.position.y, "teleported");
            }
        }
        Ok(())
    }

    fn produce(&mut self) -> Result<()> {
        for i in 0..self.spawners.len() {
            let entities = &self.entities;
            self.spawners[i].retain_live(|uid| entities.get(&uid).is_some_and(|e| !e.removed));
            if !self.spawners[i].wants_to_produce(&mut self.rng) {
                continue;
            }
            let s = &self.spawners[i];
            let (spec, sampler, allow) = (s.template.clone().temporary(), s.sampler.clone(), s.allow_overlapping);
            match self.add_element(spec, sampler, allow) {
                Ok(uid) => {
                    self.spawners[i].record(uid);
                    debug!(spawner = i, uid = uid.0, total = self.spawners[i].total_produced(), "produced");
                }
                Err(e) if e.is_recoverable() => warn!(spawner = i, error = %e, "production skipped"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run every sensor of every agent.
    pub fn observe(&self) -> BTreeMap<String, AgentObservation> {
        self.agents
            .iter()
            .map(|agent| {
                let obs = agent
                    .sensors
                    .iter()
                    .map(|s| {
                        let invisible = self.invisible_to(agent, s);
                        (s.name().to_string(), s.observe(&self.space, &self.entities, &invisible))
                    })
                    .collect();
                (agent.name.clone(), obs)
            })
            .collect()
    }

    fn rewards(&self) -> BTreeMap<String, f64> {
        self.agents.iter().map(|a| (a.name.clone(), a.reward)).collect()
    }

    /// Put every entity and agent back where it started.
    ///
    /// Temporary entities are dropped, removed ones come back, spawners start
    /// over. Fails only when a non-overlapping placement cannot be found.
    pub fn reset(&mut self) -> Result<ResetOutput> {
        for i in 0..self.agents.len() {
            self.release_grasps(AgentId(i), |_| true);
        }
        self.queue.clear();

        let temporaries: Vec<Uid> = self.entities.values().filter(|e| e.spec.temporary).map(|e| e.uid).collect();
        for uid in temporaries {
            if self.entities.contains_key(&uid) {
                self.remove_entity(uid, true)?;
            }
        }

        let roots: Vec<Uid> = self.entities.values().filter(|e| e.agent.is_none() && e.is_root()).map(|e| e.uid).collect();
        for uid in roots {
            let Some(e) = self.entities.get(&uid) else { continue };
            let (sampler, allow, placed) = (e.initial.clone(), e.allow_overlapping, e.is_placed());
            let pose = self.find_pose(uid, &sampler, allow)?;
            if placed {
                self.move_to(uid, pose, true)?;
                self.place_missing_children(uid)?;
            } else {
                self.place_subtree(uid, pose)?;
            }
        }
        for e in self.entities.values_mut() {
            e.restore_behavior_state();
        }

        for i in 0..self.agents.len() {
            let a = &self.agents[i];
            let (base, sampler, allow) = (a.base, a.initial.clone(), a.allow_overlapping);
            let pose = self.find_pose(base, &sampler, allow)?;
            self.move_to(base, pose, true)?;
            self.place_missing_children(base)?;
            let agent = &mut self.agents[i];
            agent.pre_step();
            agent.cumulative_reward = 0.0;
            for c in &mut agent.controllers {
                c.reset();
            }
        }

        for s in &mut self.spawners {
            s.reset();
        }
        for motor in self.entities.values().filter_map(|e| e.motor) {
            if let Some(m) = self.space.constraint_mut(motor) {
                m.set_rate(0.0);
            }
        }
        self.timestep = 0;
        self.done = false;
        debug!(entities = self.entities.len(), agents = self.agents.len(), "reset");
        Ok(ResetOutput { observations: self.observe(), rewards: self.rewards(), done: false })
    }
}

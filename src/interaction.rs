//! Collision-type pair handlers and the deferred command queue they feed.
//!
//! Handlers run inside the physics sub-step, so they never touch the space.
//! Anything structural (removing, adding, jointing, teleporting) is pushed
//! onto the [`CommandQueue`] and applied by the playground once the sub-step
//! batch is over.

use std::collections::BTreeMap;

use tracing::trace;

use crate::agent::Agent;
use crate::api::ContactHook;
use crate::entity::{ActivationEffect, Behavior, Entity, EntitySpec};
use crate::error::{Error, Result};
use crate::space::{ContactEvent, ShapeHandle};
use crate::spawner::CoordinateSampler;
use crate::types::{AgentId, CollisionType, Pose, ShapeOwner, Uid};

/// One side of a dispatched contact.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Participant {
    pub entity: Uid,
    pub agent: Option<AgentId>,
    pub shape: ShapeHandle,
    pub collision_type: CollisionType,
}

impl Participant {
    fn new(owner: ShapeOwner, shape: ShapeHandle, collision_type: CollisionType) -> Self {
        Self { entity: owner.entity, agent: owner.agent, shape, collision_type }
    }
}

/// Structural change requested from inside a contact callback.
#[derive(Clone, Debug, PartialEq)]
pub enum DeferredCommand {
    /// Definitive removals also drop the record, so reset will not bring the entity back.
    Remove { entity: Uid, definitive: bool },
    Add { spec: EntitySpec, sampler: CoordinateSampler },
    Grasp { agent: AgentId, part: Uid, target: Uid },
    Teleport { agent: AgentId, pose: Pose },
}

/// Intents collected during a step, applied in order once the solver is done.
#[derive(Clone, Debug, Default)]
pub struct CommandQueue {
    commands: Vec<DeferredCommand>,
}

impl CommandQueue {
    /// Identical intents collapse into one.
    pub fn push(&mut self, command: DeferredCommand) {
        if !self.commands.contains(&command) {
            self.commands.push(command);
        }
    }

    pub fn pending_removal(&self, uid: Uid) -> bool {
        self.commands.iter().any(|c| matches!(c, DeferredCommand::Remove { entity, .. } if *entity == uid))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredCommand> {
        self.commands.iter()
    }

    pub(crate) fn drain(&mut self) -> Vec<DeferredCommand> {
        std::mem::take(&mut self.commands)
    }

    pub(crate) fn clear(&mut self) {
        self.commands.clear();
    }
}

/// Everything a handler may read or change while the space is mid-step.
pub struct InteractionContext<'a> {
    pub entities: &'a mut BTreeMap<Uid, Entity>,
    pub agents: &'a mut [Agent],
    pub queue: &'a mut CommandQueue,
    pub done: &'a mut bool,
}

impl InteractionContext<'_> {
    pub fn agent_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(id.0)
    }

    pub fn behavior(&self, uid: Uid) -> Option<&Behavior> {
        self.entities.get(&uid).map(|e| &e.spec.behavior)
    }

    pub fn remove(&mut self, entity: Uid) {
        self.queue.push(DeferredCommand::Remove { entity, definitive: false });
    }

    pub fn terminate(&mut self) {
        *self.done = true;
    }
}

/// Called with the two participants in registration order. Return `false` to cancel the physical response.
pub type Handler = Box<dyn FnMut(&mut InteractionContext<'_>, &Participant, &Participant) -> bool + Send>;

/// Ordered handler table, at most one handler per unordered type pair.
#[derive(Default)]
pub struct Interactions {
    handlers: Vec<(CollisionType, CollisionType, Handler)>,
}

impl std::fmt::Debug for Interactions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.iter().map(|(a, b, _)| (a, b))).finish()
    }
}

impl Interactions {
    /// Table pre-filled with the built-in handlers, in canonical order.
    pub fn with_builtins() -> Self {
        let mut table = Self::default();
        let builtins: [(CollisionType, CollisionType, Handler); 7] = [
            (CollisionType::AGENT, CollisionType::GRASPABLE, Box::new(grasp)),
            (CollisionType::AGENT, CollisionType::CONTACT, Box::new(contact_reward)),
            (CollisionType::AGENT, CollisionType::EDIBLE, Box::new(eat)),
            (CollisionType::AGENT, CollisionType::INTERACTIVE, Box::new(activate)),
            (CollisionType::AGENT, CollisionType::PASSIVE, Box::new(zone)),
            (CollisionType::GEM, CollisionType::ACTIVATABLE_BY_GEM, Box::new(unlock)),
            (CollisionType::AGENT, CollisionType::TELEPORT, Box::new(teleport)),
        ];
        for (a, b, handler) in builtins {
            table.handlers.push((a, b, handler));
        }
        table
    }

    pub fn register(&mut self, a: CollisionType, b: CollisionType, handler: Handler) -> Result<()> {
        if self.find(a, b).is_some() {
            return Err(Error::DuplicateHandler { a, b });
        }
        self.handlers.push((a, b, handler));
        Ok(())
    }

    pub fn contains(&self, a: CollisionType, b: CollisionType) -> bool {
        self.find(a, b).is_some()
    }

    /// Registered pairs in dispatch order.
    pub fn pairs(&self) -> impl Iterator<Item = (CollisionType, CollisionType)> + '_ {
        self.handlers.iter().map(|(a, b, _)| (*a, *b))
    }

    fn find(&self, a: CollisionType, b: CollisionType) -> Option<usize> {
        self.handlers.iter().position(|(x, y, _)| (*x == a && *y == b) || (*x == b && *y == a))
    }

    /// Run the handler for the event's type pair, if any.
    pub fn dispatch(&mut self, ctx: &mut InteractionContext<'_>, event: &ContactEvent) -> bool {
        let Some(i) = self.find(event.type_a, event.type_b) else { return true };
        let pa = Participant::new(event.owner_a, event.shape_a, event.type_a);
        let pb = Participant::new(event.owner_b, event.shape_b, event.type_b);
        let (first, _, handler) = &mut self.handlers[i];
        let (x, y) = if *first == event.type_a { (pa, pb) } else { (pb, pa) };
        trace!(a = ?x.collision_type, b = ?y.collision_type, entity_a = x.entity.0, entity_b = y.entity.0, "interaction");
        handler(ctx, &x, &y)
    }
}

/// Contact hook handed to the space for one sub-step.
pub(crate) struct Dispatcher<'a> {
    pub interactions: &'a mut Interactions,
    pub ctx: InteractionContext<'a>,
}

impl ContactHook for Dispatcher<'_> {
    fn on_contact(&mut self, event: &ContactEvent) -> bool {
        self.interactions.dispatch(&mut self.ctx, event)
    }
}

fn grasp(ctx: &mut InteractionContext<'_>, part: &Participant, target: &Participant) -> bool {
    let Some(id) = part.agent else { return true };
    if ctx.queue.pending_removal(target.entity) {
        return true;
    }
    let Some(agent) = ctx.agents.get(id.0) else { return true };
    if !agent.actuation.grasp || agent.is_holding(target.entity) || target.agent == Some(id) {
        return true;
    }
    ctx.queue.push(DeferredCommand::Grasp { agent: id, part: part.entity, target: target.entity });
    true
}

fn contact_reward(ctx: &mut InteractionContext<'_>, part: &Participant, element: &Participant) -> bool {
    let Some(id) = part.agent else { return true };
    let Some(&Behavior::ContactReward { reward, consumable }) = ctx.behavior(element.entity) else { return true };
    if ctx.queue.pending_removal(element.entity) {
        return true;
    }
    let Some(agent) = ctx.agents.get_mut(id.0) else { return true };
    if agent.rewarded_by.insert(element.entity) {
        agent.reward += reward;
        if consumable {
            ctx.remove(element.entity);
        }
    }
    true
}

fn eat(ctx: &mut InteractionContext<'_>, part: &Participant, element: &Participant) -> bool {
    let Some(id) = part.agent else { return true };
    let Some(&Behavior::Edible { shrink_ratio, min_reward, .. }) = ctx.behavior(element.entity) else { return true };
    if ctx.queue.pending_removal(element.entity) {
        return true;
    }
    let Some(agent) = ctx.agents.get_mut(id.0) else { return true };
    if !agent.actuation.eat || agent.ate {
        return true;
    }
    let Some(edible) = ctx.entities.get_mut(&element.entity) else { return true };
    agent.ate = true;
    agent.reward += edible.remaining_reward;
    edible.remaining_reward *= shrink_ratio;
    if edible.remaining_reward < min_reward {
        ctx.remove(element.entity);
    }
    true
}

fn activate(ctx: &mut InteractionContext<'_>, part: &Participant, element: &Participant) -> bool {
    let Some(id) = part.agent else { return true };
    let Some(Behavior::Activable { effect }) = ctx.behavior(element.entity) else { return true };
    let effect = effect.clone();
    let active = ctx.agents.get(id.0).is_some_and(|a| a.actuation.activate);
    let Some(entity) = ctx.entities.get_mut(&element.entity) else { return true };
    if !active || entity.activated {
        return true;
    }
    entity.activated = true;
    match effect {
        ActivationEffect::Reward { reward } => {
            if let Some(agent) = ctx.agent_mut(id) {
                agent.reward += reward;
            }
        }
        ActivationEffect::OpenDoor { door } => ctx.remove(door),
        ActivationEffect::Dispense { spec, sampler } => {
            ctx.queue.push(DeferredCommand::Add { spec: spec.temporary(), sampler });
        }
    }
    true
}

fn zone(ctx: &mut InteractionContext<'_>, part: &Participant, element: &Participant) -> bool {
    let Some(id) = part.agent else { return true };
    let Some(&Behavior::Zone { reward, terminate }) = ctx.behavior(element.entity) else { return true };
    let Some(agent) = ctx.agents.get_mut(id.0) else { return true };
    if agent.rewarded_by.insert(element.entity) {
        agent.reward += reward;
        if terminate {
            ctx.terminate();
        }
    }
    true
}

fn unlock(ctx: &mut InteractionContext<'_>, gem: &Participant, lock: &Participant) -> bool {
    if !matches!(ctx.behavior(gem.entity), Some(Behavior::Gem)) {
        return true;
    }
    let Some(&Behavior::Lock { door }) = ctx.behavior(lock.entity) else { return true };
    if ctx.queue.pending_removal(lock.entity) {
        return true;
    }
    ctx.remove(door);
    ctx.remove(lock.entity);
    ctx.remove(gem.entity);
    true
}

fn teleport(ctx: &mut InteractionContext<'_>, part: &Participant, portal: &Participant) -> bool {
    let Some(id) = part.agent else { return true };
    let Some(&Behavior::Teleporter { destination }) = ctx.behavior(portal.entity) else { return true };
    ctx.queue.push(DeferredCommand::Teleport { agent: id, pose: destination });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentSpec, PartSpec};
    use crate::geometry::ShapeDescriptor;
    use glam::DVec2;

    fn owner(entity: u32, agent: Option<usize>) -> ShapeOwner {
        ShapeOwner { entity: Uid(entity), agent: agent.map(AgentId) }
    }

    fn event(a: (CollisionType, ShapeOwner), b: (CollisionType, ShapeOwner)) -> ContactEvent {
        ContactEvent {
            shape_a: ShapeHandle::default(),
            shape_b: ShapeHandle::default(),
            type_a: a.0,
            type_b: b.0,
            owner_a: a.1,
            owner_b: b.1,
            point: DVec2::ZERO,
            normal: DVec2::X,
            depth: 1.0,
            sensor: false,
        }
    }

    fn agent() -> Agent {
        let spec = AgentSpec::new("bot", PartSpec::new("base", ShapeDescriptor::circle(10.0), 1.0));
        Agent::new(AgentId(0), &spec, Uid(1))
    }

    struct World {
        entities: BTreeMap<Uid, Entity>,
        agents: Vec<Agent>,
        queue: CommandQueue,
        done: bool,
    }

    impl World {
        fn new(elements: Vec<(u32, EntitySpec)>) -> Self {
            let entities = elements.into_iter().map(|(uid, spec)| (Uid(uid), Entity::new(Uid(uid), spec, None).unwrap())).collect();
            Self { entities, agents: vec![agent()], queue: CommandQueue::default(), done: false }
        }

        fn dispatch(&mut self, table: &mut Interactions, e: &ContactEvent) -> bool {
            let mut ctx = InteractionContext {
                entities: &mut self.entities,
                agents: &mut self.agents,
                queue: &mut self.queue,
                done: &mut self.done,
            };
            table.dispatch(&mut ctx, e)
        }
    }

    fn always(_: &mut InteractionContext<'_>, _: &Participant, _: &Participant) -> bool {
        true
    }

    #[test]
    fn test_builtins_in_canonical_order() {
        let table = Interactions::with_builtins();
        let pairs: Vec<_> = table.pairs().collect();
        assert_eq!(pairs[0], (CollisionType::AGENT, CollisionType::GRASPABLE));
        assert_eq!(pairs[5], (CollisionType::GEM, CollisionType::ACTIVATABLE_BY_GEM));
        assert_eq!(pairs[6], (CollisionType::AGENT, CollisionType::TELEPORT));
    }

    #[test]
    fn test_duplicate_pair_rejected_in_either_order() {
        let mut table = Interactions::with_builtins();
        let err = table.register(CollisionType::GRASPABLE, CollisionType::AGENT, Box::new(always));
        assert_eq!(err, Err(Error::DuplicateHandler { a: CollisionType::GRASPABLE, b: CollisionType::AGENT }));
        assert!(table.register(CollisionType(40), CollisionType(41), Box::new(always)).is_ok());
        assert!(table.register(CollisionType(41), CollisionType(40), Box::new(always)).is_err());
    }

    #[test]
    fn test_arguments_follow_registration_order() {
        let mut table = Interactions::default();
        table
            .register(
                CollisionType(40),
                CollisionType(41),
                Box::new(|_: &mut InteractionContext<'_>, a: &Participant, b: &Participant| a.entity == Uid(7) && b.entity == Uid(8)),
            )
            .unwrap();
        let mut world = World::new(Vec::new());
        let reversed = event((CollisionType(41), owner(8, None)), (CollisionType(40), owner(7, None)));
        assert!(world.dispatch(&mut table, &reversed));
        // Unregistered pairs keep the normal response.
        let other = event((CollisionType(2), owner(1, None)), (CollisionType(3), owner(2, None)));
        assert!(world.dispatch(&mut table, &other));
    }

    #[test]
    fn test_consumable_reward_paid_once_and_removal_deferred() {
        let mut table = Interactions::with_builtins();
        let mut world = World::new(vec![(5, EntitySpec::contact_reward(ShapeDescriptor::circle(5.0), 2.0, true))]);
        let e = event((CollisionType::CONTACT, owner(5, None)), (CollisionType::AGENT, owner(1, Some(0))));
        for _ in 0..3 {
            assert!(world.dispatch(&mut table, &e));
        }
        assert_eq!(world.agents[0].reward, 2.0);
        assert!(world.entities.contains_key(&Uid(5)));
        assert_eq!(world.queue.len(), 1);
        assert!(world.queue.pending_removal(Uid(5)));
    }

    #[test]
    fn test_lock_queues_door_lock_and_key() {
        let mut table = Interactions::with_builtins();
        let mut world = World::new(vec![
            (2, EntitySpec::new(ShapeDescriptor::rectangle(5.0, 40.0))),
            (3, EntitySpec::lock(ShapeDescriptor::rectangle(10.0, 10.0), Uid(2))),
            (4, EntitySpec::gem(ShapeDescriptor::circle(3.0), 1.0)),
        ]);
        let e = event((CollisionType::ACTIVATABLE_BY_GEM, owner(3, None)), (CollisionType::GEM, owner(4, None)));
        world.dispatch(&mut table, &e);
        world.dispatch(&mut table, &e);
        let queued: Vec<_> = world.queue.iter().cloned().collect();
        assert_eq!(
            queued,
            vec![
                DeferredCommand::Remove { entity: Uid(2), definitive: false },
                DeferredCommand::Remove { entity: Uid(3), definitive: false },
                DeferredCommand::Remove { entity: Uid(4), definitive: false },
            ]
        );
        assert_eq!(world.entities.len(), 3);
    }

    #[test]
    fn test_edible_needs_eat_and_shrinks() {
        let mut table = Interactions::with_builtins();
        let mut world = World::new(vec![(6, EntitySpec::edible(ShapeDescriptor::circle(5.0), 1.0))]);
        let e = event((CollisionType::AGENT, owner(1, Some(0))), (CollisionType::EDIBLE, owner(6, None)));
        world.dispatch(&mut table, &e);
        assert_eq!(world.agents[0].reward, 0.0);

        world.agents[0].actuation.eat = true;
        world.dispatch(&mut table, &e);
        world.dispatch(&mut table, &e);
        assert_eq!(world.agents[0].reward, 1.0);
        assert!((world.entities[&Uid(6)].remaining_reward - 0.9).abs() < 1e-12);
        assert!(world.queue.is_empty());
    }

    #[test]
    fn test_terminating_zone_sets_done() {
        let mut table = Interactions::with_builtins();
        let mut world = World::new(vec![(9, EntitySpec::zone(ShapeDescriptor::circle(20.0), 5.0, true))]);
        let e = event((CollisionType::AGENT, owner(1, Some(0))), (CollisionType::PASSIVE, owner(9, None)));
        world.dispatch(&mut table, &e);
        assert!(world.done);
        assert_eq!(world.agents[0].reward, 5.0);
    }

    #[test]
    fn test_grasp_only_while_held() {
        let mut table = Interactions::with_builtins();
        let mut world = World::new(vec![(4, EntitySpec::gem(ShapeDescriptor::circle(3.0), 1.0))]);
        let e = event((CollisionType::GRASPABLE, owner(4, None)), (CollisionType::AGENT, owner(1, Some(0))));
        world.dispatch(&mut table, &e);
        assert!(world.queue.is_empty());
        world.agents[0].actuation.grasp = true;
        assert!(world.dispatch(&mut table, &e), "grasping keeps the physical response");
        assert_eq!(world.queue.iter().next(), Some(&DeferredCommand::Grasp { agent: AgentId(0), part: Uid(1), target: Uid(4) }));
    }
}

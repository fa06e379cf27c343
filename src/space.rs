//! Authoritative container of bodies, shapes and constraints.
//!
//! Broad phase is a uniform grid over cached per-shape bounds. Bounds of
//! non-static bodies are refreshed every sub-step; static bounds only change
//! through [`SpaceApi::reindex_static`] / [`SpaceApi::reindex_shapes_for_body`],
//! so any out-of-band move must be followed by one of those calls.

use std::collections::{BTreeSet, HashMap};

use glam::DVec2;
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use tracing::trace;

use crate::api::{ContactHook, SpaceApi};
use crate::body::RigidBody;
use crate::config::SpaceConfig;
use crate::constraint::Constraint;
use crate::error::{Error, Result};
use crate::geometry::Primitive;
use crate::narrowphase::{cast_segment, contact};
use crate::types::{Aabb, CollisionType, LayerMask, ShapeOwner, Uid, cross, cross_sv};

const MAX_CELL: f64 = (1 << 20) as f64;

new_key_type! {
    pub struct BodyHandle;
    pub struct ShapeHandle;
    pub struct ConstraintHandle;
}

/// Collidable primitive bound to a body.
#[derive(Clone, Debug, PartialEq)]
pub struct Shape {
    /// Set when the shape is added to a space.
    pub body: BodyHandle,
    /// Primitive in the body's local frame.
    pub primitive: Primitive,
    pub collision_type: CollisionType,
    pub friction: f64,
    pub elasticity: f64,
    pub mask: LayerMask,
    /// Shapes sharing a non-zero group never collide with each other.
    pub group: u32,
    /// Sensor shapes report contacts but get no physical response.
    pub sensor: bool,
    pub owner: ShapeOwner,
    bb: Aabb,
}

impl Shape {
    pub fn new(primitive: Primitive, owner: ShapeOwner) -> Self {
        let bb = primitive.aabb();
        Self {
            body: BodyHandle::default(),
            primitive,
            collision_type: CollisionType::DEFAULT,
            friction: 0.8,
            elasticity: 0.0,
            mask: LayerMask::ALL,
            group: 0,
            sensor: false,
            owner,
            bb,
        }
    }

    pub fn with_collision_type(mut self, collision_type: CollisionType) -> Self {
        self.collision_type = collision_type;
        self
    }

    pub fn with_mask(mut self, mask: LayerMask) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    pub fn with_sensor(mut self, sensor: bool) -> Self {
        self.sensor = sensor;
        self
    }

    pub fn with_material(mut self, friction: f64, elasticity: f64) -> Self {
        self.friction = friction;
        self.elasticity = elasticity;
        self
    }

    /// Cached world bounds as of the last reindex.
    pub fn bb(&self) -> Aabb {
        self.bb
    }

    pub fn world_primitive(&self, body: &RigidBody) -> Primitive {
        self.primitive.transformed(&body.pose())
    }
}

/// One touching, filter-approved shape pair within a sub-step.
#[derive(Clone, Debug, PartialEq)]
pub struct ContactEvent {
    pub shape_a: ShapeHandle,
    pub shape_b: ShapeHandle,
    pub type_a: CollisionType,
    pub type_b: CollisionType,
    pub owner_a: ShapeOwner,
    pub owner_b: ShapeOwner,
    pub point: DVec2,
    /// From A toward B.
    pub normal: DVec2,
    pub depth: f64,
    /// Either shape is a sensor, so no physical response follows.
    pub sensor: bool,
}

/// Which shapes a query may report.
#[derive(Copy, Clone, Debug)]
pub struct QueryFilter<'a> {
    /// Only the query side is consulted: `mask.allows(shape.mask)`.
    pub mask: LayerMask,
    pub include_sensors: bool,
    pub exclude_entities: Option<&'a BTreeSet<Uid>>,
}

impl Default for QueryFilter<'_> {
    fn default() -> Self {
        Self { mask: LayerMask { layer: 0, collides_with: u32::MAX, exclude: 0 }, include_sensors: false, exclude_entities: None }
    }
}

impl<'a> QueryFilter<'a> {
    pub fn with_sensors(mut self) -> Self {
        self.include_sensors = true;
        self
    }

    pub fn excluding(mut self, entities: &'a BTreeSet<Uid>) -> Self {
        self.exclude_entities = Some(entities);
        self
    }

    pub fn with_mask(mut self, mask: LayerMask) -> Self {
        self.mask = mask;
        self
    }

    pub fn accepts(&self, shape: &Shape) -> bool {
        (self.include_sensors || !shape.sensor)
            && self.mask.allows(shape.mask)
            && !self.exclude_entities.is_some_and(|set| set.contains(&shape.owner.entity))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentQueryHit {
    pub shape: ShapeHandle,
    pub owner: ShapeOwner,
    pub point: DVec2,
    pub normal: DVec2,
    /// Position along the segment in [0, 1].
    pub fraction: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShapeQueryHit {
    pub shape: ShapeHandle,
    pub owner: ShapeOwner,
    pub points: Vec<DVec2>,
    pub depth: f64,
}

/// Solver scratch for one contact point.
#[derive(Clone, Debug)]
struct Contact {
    a: BodyHandle,
    b: BodyHandle,
    r1: DVec2,
    r2: DVec2,
    n: DVec2,
    depth: f64,
    friction: f64,
    elasticity: f64,
    n_mass: f64,
    t_mass: f64,
    bias: f64,
    bounce: f64,
    jn_acc: f64,
    jt_acc: f64,
    jb_acc: f64,
}

fn ordered<K: Ord>(a: K, b: K) -> (K, K) {
    if a <= b { (a, b) } else { (b, a) }
}

pub struct Space {
    pub cfg: SpaceConfig,
    /// Number of sub-steps taken.
    pub timestamp: u64,
    bodies: SlotMap<BodyHandle, RigidBody>,
    shapes: SlotMap<ShapeHandle, Shape>,
    constraints: SlotMap<ConstraintHandle, Constraint>,
    body_shapes: SecondaryMap<BodyHandle, Vec<ShapeHandle>>,
    // Body pairs joined by a non-colliding constraint, with multiplicity.
    non_colliding: HashMap<(BodyHandle, BodyHandle), usize>,
    // Uniform grid: cell coord -> shapes whose cached bounds touch it
    grid: HashMap<(i32, i32), Vec<ShapeHandle>>,
    contacts: Vec<Contact>,
}

impl Space {
    pub fn new(cfg: SpaceConfig) -> Self {
        Self {
            cfg,
            timestamp: 0,
            bodies: SlotMap::with_key(),
            shapes: SlotMap::with_key(),
            constraints: SlotMap::with_key(),
            body_shapes: SecondaryMap::new(),
            non_colliding: HashMap::new(),
            grid: HashMap::new(),
            contacts: Vec::new(),
        }
    }

    pub fn bodies(&self) -> impl Iterator<Item = (BodyHandle, &RigidBody)> {
        self.bodies.iter()
    }

    pub fn shapes(&self) -> impl Iterator<Item = (ShapeHandle, &Shape)> {
        self.shapes.iter()
    }

    pub fn constraints(&self) -> impl Iterator<Item = (ConstraintHandle, &Constraint)> {
        self.constraints.iter()
    }

    pub fn shapes_of(&self, body: BodyHandle) -> &[ShapeHandle] {
        self.body_shapes.get(body).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn constraints_of(&self, body: BodyHandle) -> Vec<ConstraintHandle> {
        self.constraints.iter().filter(|(_, c)| c.involves(body)).map(|(h, _)| h).collect()
    }

    pub fn contains_body(&self, body: BodyHandle) -> bool {
        self.bodies.contains_key(body)
    }

    pub fn contains_shape(&self, shape: ShapeHandle) -> bool {
        self.shapes.contains_key(shape)
    }

    /// Clear accumulated force and torque on every body.
    pub fn reset_forces(&mut self) {
        for body in self.bodies.values_mut() {
            body.reset_forces();
        }
    }

    pub fn world_primitive(&self, shape: ShapeHandle) -> Option<Primitive> {
        let s = self.shapes.get(shape)?;
        let body = self.bodies.get(s.body)?;
        Some(s.world_primitive(body))
    }

    fn cell_size(&self) -> f64 {
        self.cfg.cell_size.max(1e-5)
    }

    /// Cell indices saturate at `±MAX_CELL`; far-away shapes share the border cells.
    fn world_to_cell(&self, p: DVec2) -> (i32, i32) {
        let cs = self.cell_size();
        let index = |v: f64| (v / cs).floor().clamp(-MAX_CELL, MAX_CELL) as i32;
        (index(p.x), index(p.y))
    }

    fn cell_range(&self, bb: Aabb) -> ((i32, i32), (i32, i32)) {
        (self.world_to_cell(bb.min), self.world_to_cell(bb.max))
    }

    fn grid_insert(&mut self, h: ShapeHandle, bb: Aabb) {
        let ((ix0, iy0), (ix1, iy1)) = self.cell_range(bb);
        for iy in iy0..=iy1 {
            for ix in ix0..=ix1 {
                self.grid.entry((ix, iy)).or_default().push(h);
            }
        }
    }

    fn grid_remove(&mut self, h: ShapeHandle, bb: Aabb) {
        let ((ix0, iy0), (ix1, iy1)) = self.cell_range(bb);
        for iy in iy0..=iy1 {
            for ix in ix0..=ix1 {
                if let Some(list) = self.grid.get_mut(&(ix, iy)) {
                    list.retain(|&x| x != h);
                    if list.is_empty() {
                        self.grid.remove(&(ix, iy));
                    }
                }
            }
        }
    }

    fn refresh_shape(&mut self, h: ShapeHandle) {
        let Some(shape) = self.shapes.get(h) else { return };
        let Some(body) = self.bodies.get(shape.body) else { return };
        let old = shape.bb;
        let new = shape.world_primitive(body).aabb();
        if old == new {
            return;
        }
        if self.cell_range(old) != self.cell_range(new) {
            self.grid_remove(h, old);
            self.grid_insert(h, new);
        }
        if let Some(shape) = self.shapes.get_mut(h) {
            shape.bb = new;
        }
    }

    fn candidates_in(&self, bb: Aabb) -> BTreeSet<ShapeHandle> {
        let ((ix0, iy0), (ix1, iy1)) = self.cell_range(bb);
        let mut out = BTreeSet::new();
        for iy in iy0..=iy1 {
            for ix in ix0..=ix1 {
                if let Some(list) = self.grid.get(&(ix, iy)) {
                    out.extend(list.iter().copied());
                }
            }
        }
        out
    }

    /// Shapes in every grid cell crossed by `start -> end` (DDA walk).
    fn candidates_along(&self, start: DVec2, end: DVec2) -> BTreeSet<ShapeHandle> {
        let cs = self.cell_size();
        let dir = end - start;
        let mut out = BTreeSet::new();
        let mut cell = self.world_to_cell(start);
        let last = self.world_to_cell(end);
        let step_x = if dir.x > 0.0 { 1 } else if dir.x < 0.0 { -1 } else { 0 };
        let step_y = if dir.y > 0.0 { 1 } else if dir.y < 0.0 { -1 } else { 0 };
        let next_boundary = |c: i32, step: i32| -> f64 { if step > 0 { (c as f64 + 1.0) * cs } else { c as f64 * cs } };
        let mut t_max_x = if step_x != 0 { (next_boundary(cell.0, step_x) - start.x) / dir.x } else { f64::INFINITY };
        let mut t_max_y = if step_y != 0 { (next_boundary(cell.1, step_y) - start.y) / dir.y } else { f64::INFINITY };
        let t_delta_x = if step_x != 0 { cs / dir.x.abs() } else { f64::INFINITY };
        let t_delta_y = if step_y != 0 { cs / dir.y.abs() } else { f64::INFINITY };

        let budget = (last.0 - cell.0).unsigned_abs() as usize + (last.1 - cell.1).unsigned_abs() as usize + 2;
        for _ in 0..budget {
            if let Some(list) = self.grid.get(&cell) {
                out.extend(list.iter().copied());
            }
            if cell == last {
                break;
            }
            let t_curr = if t_max_x < t_max_y {
                cell.0 += step_x;
                let t = t_max_x;
                t_max_x += t_delta_x;
                t
            } else {
                cell.1 += step_y;
                let t = t_max_y;
                t_max_y += t_delta_y;
                t
            };
            if t_curr > 1.0 {
                break;
            }
        }
        out
    }

    fn may_collide(&self, a: &Shape, b: &Shape) -> bool {
        if a.body == b.body || (a.group != 0 && a.group == b.group) {
            return false;
        }
        let (Some(ba), Some(bb)) = (self.bodies.get(a.body), self.bodies.get(b.body)) else {
            return false;
        };
        if !ba.is_dynamic() && !bb.is_dynamic() {
            return false;
        }
        if self.non_colliding.contains_key(&ordered(a.body, b.body)) {
            return false;
        }
        a.mask.mutual(b.mask)
    }

    /// Candidate pairs in handle order so contact discovery is reproducible.
    fn candidate_pairs(&self) -> BTreeSet<(ShapeHandle, ShapeHandle)> {
        let mut pairs = BTreeSet::new();
        for list in self.grid.values() {
            for i0 in 0..list.len() {
                for i1 in (i0 + 1)..list.len() {
                    pairs.insert(ordered(list[i0], list[i1]));
                }
            }
        }
        pairs
    }

    fn collide(&mut self, hook: &mut dyn ContactHook) {
        self.contacts.clear();
        let pairs = self.candidate_pairs();
        let mut tested = 0usize;
        for (ha, hb) in pairs {
            let (Some(sa), Some(sb)) = (self.shapes.get(ha), self.shapes.get(hb)) else { continue };
            if !sa.bb.intersects(&sb.bb) || !self.may_collide(sa, sb) {
                continue;
            }
            let (Some(ba), Some(bb)) = (self.bodies.get(sa.body), self.bodies.get(sb.body)) else { continue };
            tested += 1;
            let Some(ov) = contact(&sa.world_primitive(ba), &sb.world_primitive(bb)) else { continue };
            let event = ContactEvent {
                shape_a: ha,
                shape_b: hb,
                type_a: sa.collision_type,
                type_b: sb.collision_type,
                owner_a: sa.owner,
                owner_b: sb.owner,
                point: ov.contact,
                normal: ov.normal,
                depth: ov.depth,
                sensor: sa.sensor || sb.sensor,
            };
            let respond = hook.on_contact(&event);
            if !respond || event.sensor {
                continue;
            }
            self.contacts.push(Contact {
                a: sa.body,
                b: sb.body,
                r1: ov.contact - ba.position,
                r2: ov.contact - bb.position,
                n: ov.normal,
                depth: ov.depth,
                friction: sa.friction * sb.friction,
                elasticity: sa.elasticity * sb.elasticity,
                n_mass: 0.0,
                t_mass: 0.0,
                bias: 0.0,
                bounce: 0.0,
                jn_acc: 0.0,
                jt_acc: 0.0,
                jb_acc: 0.0,
            });
        }
        trace!(tested, contacts = self.contacts.len(), "narrowphase");
    }
}

fn contact_pre_solve(c: &mut Contact, a: &RigidBody, b: &RigidBody, dt: f64, cfg: &SpaceConfig) {
    let (ma, mb, ia, ib) = (a.inv_mass(), b.inv_mass(), a.inv_moment(), b.inv_moment());
    let t = c.n.perp();
    let (rn1, rn2) = (cross(c.r1, c.n), cross(c.r2, c.n));
    let (rt1, rt2) = (cross(c.r1, t), cross(c.r2, t));
    let kn = ma + mb + ia * rn1 * rn1 + ib * rn2 * rn2;
    let kt = ma + mb + ia * rt1 * rt1 + ib * rt2 * rt2;
    c.n_mass = if kn > 0.0 { 1.0 / kn } else { 0.0 };
    c.t_mass = if kt > 0.0 { 1.0 / kt } else { 0.0 };
    c.bias = cfg.collision_bias / dt * (c.depth - cfg.collision_slop).max(0.0);
    let vr = (b.velocity + cross_sv(b.angular_velocity, c.r2)) - (a.velocity + cross_sv(a.angular_velocity, c.r1));
    c.bounce = c.elasticity * vr.dot(c.n).min(0.0);
}

fn contact_solve(c: &mut Contact, a: &mut RigidBody, b: &mut RigidBody) {
    let n = c.n;
    let t = n.perp();

    let vb = (b.v_bias + cross_sv(b.w_bias, c.r2)) - (a.v_bias + cross_sv(a.w_bias, c.r1));
    let jb = (c.bias - vb.dot(n)) * c.n_mass;
    let old = c.jb_acc;
    c.jb_acc = (old + jb).max(0.0);
    let djb = n * (c.jb_acc - old);
    a.apply_bias_impulse(-djb, c.r1);
    b.apply_bias_impulse(djb, c.r2);

    let vr = (b.velocity + cross_sv(b.angular_velocity, c.r2)) - (a.velocity + cross_sv(a.angular_velocity, c.r1));
    let jn = -(c.bounce + vr.dot(n)) * c.n_mass;
    let old_n = c.jn_acc;
    c.jn_acc = (old_n + jn).max(0.0);

    let jt = -vr.dot(t) * c.t_mass;
    let jt_max = c.friction * c.jn_acc;
    let old_t = c.jt_acc;
    c.jt_acc = (old_t + jt).clamp(-jt_max, jt_max);

    let j = n * (c.jn_acc - old_n) + t * (c.jt_acc - old_t);
    a.apply_impulse(-j, c.r1);
    b.apply_impulse(j, c.r2);
}

impl SpaceApi for Space {
    fn add_body(&mut self, body: RigidBody) -> BodyHandle {
        let h = self.bodies.insert(body);
        self.body_shapes.insert(h, Vec::new());
        h
    }

    fn add_shape(&mut self, body: BodyHandle, mut shape: Shape) -> Result<ShapeHandle> {
        let b = self.bodies.get(body).ok_or(Error::BodyNotInSpace)?;
        shape.body = body;
        shape.bb = shape.world_primitive(b).aabb();
        let bb = shape.bb;
        let h = self.shapes.insert(shape);
        self.grid_insert(h, bb);
        if let Some(list) = self.body_shapes.get_mut(body) {
            list.push(h);
        }
        Ok(h)
    }

    fn add_constraint(&mut self, constraint: Constraint) -> Result<ConstraintHandle> {
        if !self.bodies.contains_key(constraint.body_a) || !self.bodies.contains_key(constraint.body_b) {
            return Err(Error::BodyNotInSpace);
        }
        if !constraint.collide_bodies {
            *self.non_colliding.entry(ordered(constraint.body_a, constraint.body_b)).or_default() += 1;
        }
        Ok(self.constraints.insert(constraint))
    }

    fn remove_body(&mut self, body: BodyHandle) -> Result<RigidBody> {
        if !self.bodies.contains_key(body) {
            return Err(Error::BodyNotInSpace);
        }
        let shapes = self.shapes_of(body).len();
        if shapes > 0 {
            return Err(Error::DanglingShape(shapes));
        }
        let constraints = self.constraints.values().filter(|c| c.involves(body)).count();
        if constraints > 0 {
            return Err(Error::DanglingConstraint(constraints));
        }
        self.body_shapes.remove(body);
        self.bodies.remove(body).ok_or(Error::BodyNotInSpace)
    }

    fn remove_shape(&mut self, shape: ShapeHandle) -> Option<Shape> {
        let removed = self.shapes.remove(shape)?;
        self.grid_remove(shape, removed.bb);
        if let Some(list) = self.body_shapes.get_mut(removed.body) {
            list.retain(|&h| h != shape);
        }
        Some(removed)
    }

    fn remove_constraint(&mut self, constraint: ConstraintHandle) -> Option<Constraint> {
        let removed = self.constraints.remove(constraint)?;
        if !removed.collide_bodies {
            let key = ordered(removed.body_a, removed.body_b);
            if let Some(count) = self.non_colliding.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    self.non_colliding.remove(&key);
                }
            }
        }
        Some(removed)
    }

    fn step(&mut self, dt: f64, hook: &mut dyn ContactHook) {
        self.timestamp += 1;

        for body in self.bodies.values_mut() {
            body.integrate_position(dt);
        }
        let moving: Vec<ShapeHandle> = self
            .shapes
            .iter()
            .filter(|(_, s)| self.bodies.get(s.body).is_some_and(|b| !b.is_static()))
            .map(|(h, _)| h)
            .collect();
        for h in moving {
            self.refresh_shape(h);
        }

        self.collide(hook);

        let damping = self.cfg.damping;
        for body in self.bodies.values_mut() {
            body.integrate_velocity(dt, damping);
        }

        for c in self.constraints.values_mut() {
            if let Some([a, b]) = self.bodies.get_disjoint_mut([c.body_a, c.body_b]) {
                c.pre_solve(a, b, dt);
            }
        }
        let cfg = self.cfg;
        for c in self.contacts.iter_mut() {
            if let (Some(a), Some(b)) = (self.bodies.get(c.a), self.bodies.get(c.b)) {
                contact_pre_solve(c, a, b, dt, &cfg);
            }
        }

        for _ in 0..self.cfg.iterations {
            for c in self.constraints.values_mut() {
                if let Some([a, b]) = self.bodies.get_disjoint_mut([c.body_a, c.body_b]) {
                    c.solve(a, b, dt);
                }
            }
            for c in self.contacts.iter_mut() {
                if let Some([a, b]) = self.bodies.get_disjoint_mut([c.a, c.b]) {
                    contact_solve(c, a, b);
                }
            }
        }
    }

    fn reindex_static(&mut self) {
        let statics: Vec<ShapeHandle> = self
            .shapes
            .iter()
            .filter(|(_, s)| self.bodies.get(s.body).is_some_and(RigidBody::is_static))
            .map(|(h, _)| h)
            .collect();
        for h in statics {
            self.refresh_shape(h);
        }
    }

    fn reindex_shapes_for_body(&mut self, body: BodyHandle) {
        let shapes = self.shapes_of(body).to_vec();
        for h in shapes {
            self.refresh_shape(h);
        }
    }

    fn segment_query(&self, start: DVec2, end: DVec2, radius: f64, filter: &QueryFilter<'_>) -> Vec<SegmentQueryHit> {
        let query_bb = Aabb::new(start.min(end), start.max(end)).inflate(radius.max(0.0));
        let candidates = if radius <= 0.0 { self.candidates_along(start, end) } else { self.candidates_in(query_bb) };
        let mut hits = Vec::new();
        for h in candidates {
            let shape = &self.shapes[h];
            if !filter.accepts(shape) || !shape.bb.intersects(&query_bb) {
                continue;
            }
            let Some(body) = self.bodies.get(shape.body) else { continue };
            if let Some(hit) = cast_segment(&shape.world_primitive(body), start, end, radius.max(0.0)) {
                hits.push(SegmentQueryHit { shape: h, owner: shape.owner, point: hit.contact, normal: hit.normal, fraction: hit.toi });
            }
        }
        hits.sort_by(|a, b| a.fraction.total_cmp(&b.fraction).then(a.shape.cmp(&b.shape)));
        hits
    }

    fn shape_query(&self, primitive: &Primitive, filter: &QueryFilter<'_>) -> Vec<ShapeQueryHit> {
        let bb = primitive.aabb();
        let mut out = Vec::new();
        for h in self.candidates_in(bb) {
            let shape = &self.shapes[h];
            if !filter.accepts(shape) || !shape.bb.intersects(&bb) {
                continue;
            }
            let Some(body) = self.bodies.get(shape.body) else { continue };
            if let Some(ov) = contact(primitive, &shape.world_primitive(body)) {
                out.push(ShapeQueryHit { shape: h, owner: shape.owner, points: vec![ov.contact], depth: ov.depth });
            }
        }
        out
    }

    fn shape_query_for(&self, shape: ShapeHandle, filter: &QueryFilter<'_>) -> Vec<ShapeQueryHit> {
        let Some(s) = self.shapes.get(shape) else { return Vec::new() };
        let Some(prim) = self.world_primitive(shape) else { return Vec::new() };
        let body = s.body;
        self.shape_query(&prim, filter)
            .into_iter()
            .filter(|hit| self.shapes.get(hit.shape).is_some_and(|o| o.body != body))
            .collect()
    }

    fn point_query(&self, point: DVec2, filter: &QueryFilter<'_>) -> Vec<ShapeHandle> {
        let mut out = Vec::new();
        if let Some(list) = self.grid.get(&self.world_to_cell(point)) {
            let unique: BTreeSet<ShapeHandle> = list.iter().copied().collect();
            for h in unique {
                let shape = &self.shapes[h];
                if !filter.accepts(shape) {
                    continue;
                }
                let Some(body) = self.bodies.get(shape.body) else { continue };
                if shape.world_primitive(body).contains_point(point) {
                    out.push(h);
                }
            }
        }
        out
    }

    fn body(&self, body: BodyHandle) -> Option<&RigidBody> {
        self.bodies.get(body)
    }

    fn body_mut(&mut self, body: BodyHandle) -> Option<&mut RigidBody> {
        self.bodies.get_mut(body)
    }

    fn shape(&self, shape: ShapeHandle) -> Option<&Shape> {
        self.shapes.get(shape)
    }

    fn constraint(&self, constraint: ConstraintHandle) -> Option<&Constraint> {
        self.constraints.get(constraint)
    }

    fn constraint_mut(&mut self, constraint: ConstraintHandle) -> Option<&mut Constraint> {
        self.constraints.get_mut(constraint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::NoHook;
    use crate::types::Pose;

    fn owner(uid: u32) -> ShapeOwner {
        ShapeOwner { entity: Uid(uid), agent: None }
    }

    fn circle(r: f64) -> Primitive {
        Primitive::Circle { center: DVec2::ZERO, radius: r }
    }

    fn add_circle(space: &mut Space, uid: u32, pos: DVec2, r: f64, dynamic: bool) -> (BodyHandle, ShapeHandle) {
        let body = if dynamic { RigidBody::new_dynamic(1.0, 100.0, Pose::at(pos)) } else { RigidBody::new_static(Pose::at(pos)) };
        let bh = space.add_body(body);
        let sh = space.add_shape(bh, Shape::new(circle(r), owner(uid))).unwrap();
        (bh, sh)
    }

    #[test]
    fn test_remove_body_with_shapes_is_dangling() {
        let mut space = Space::new(SpaceConfig::default());
        let (bh, sh) = add_circle(&mut space, 1, DVec2::ZERO, 1.0, true);
        assert_eq!(space.remove_body(bh), Err(Error::DanglingShape(1)));
        assert!(space.remove_shape(sh).is_some());
        assert!(space.remove_body(bh).is_ok());
        assert_eq!(space.remove_body(bh), Err(Error::BodyNotInSpace));
    }

    #[test]
    fn test_remove_body_with_constraint_is_dangling() {
        let mut space = Space::new(SpaceConfig::default());
        let a = space.add_body(RigidBody::new_static(Pose::default()));
        let b = space.add_body(RigidBody::new_dynamic(1.0, 1.0, Pose::default()));
        let c = space.add_constraint(Constraint::motor(a, b, 0.0)).unwrap();
        assert_eq!(space.remove_body(b), Err(Error::DanglingConstraint(1)));
        space.remove_constraint(c);
        assert!(space.remove_body(b).is_ok());
    }

    #[test]
    fn test_segment_query_sorted_by_fraction() {
        let mut space = Space::new(SpaceConfig { cell_size: 10.0, ..Default::default() });
        let (_, far) = add_circle(&mut space, 2, DVec2::new(80.0, 0.0), 5.0, false);
        let (_, near) = add_circle(&mut space, 1, DVec2::new(30.0, 0.0), 5.0, false);
        add_circle(&mut space, 3, DVec2::new(30.0, 40.0), 5.0, false);
        let hits = space.segment_query(DVec2::ZERO, DVec2::new(100.0, 0.0), 0.0, &QueryFilter::default());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].shape, near);
        assert_eq!(hits[1].shape, far);
        assert!((hits[0].fraction - 0.25).abs() < 1e-12);
        assert!((hits[0].point.x - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_far_away_shapes_stay_queryable() {
        let mut space = Space::new(SpaceConfig::default());
        let far = DVec2::new(1e12, -1e12);
        let (_, sh) = add_circle(&mut space, 1, far, 5.0, false);
        let hits = space.segment_query(far - DVec2::new(20.0, 0.0), far + DVec2::new(20.0, 0.0), 0.0, &QueryFilter::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].shape, sh);
        assert!(space.segment_query(DVec2::ZERO, DVec2::new(100.0, 0.0), 0.0, &QueryFilter::default()).is_empty());
    }

    #[test]
    fn test_thick_segment_query_reaches_off_axis() {
        let mut space = Space::new(SpaceConfig::default());
        add_circle(&mut space, 1, DVec2::new(50.0, 8.0), 5.0, false);
        assert!(space.segment_query(DVec2::ZERO, DVec2::new(100.0, 0.0), 0.0, &QueryFilter::default()).is_empty());
        assert_eq!(space.segment_query(DVec2::ZERO, DVec2::new(100.0, 0.0), 4.0, &QueryFilter::default()).len(), 1);
    }

    #[test]
    fn test_query_filter_sensors_and_exclusions() {
        let mut space = Space::new(SpaceConfig::default());
        let bh = space.add_body(RigidBody::new_static(Pose::at(DVec2::new(20.0, 0.0))));
        space.add_shape(bh, Shape::new(circle(5.0), owner(7)).with_sensor(true)).unwrap();
        add_circle(&mut space, 8, DVec2::new(40.0, 0.0), 5.0, false);
        let (a, b) = (DVec2::ZERO, DVec2::new(100.0, 0.0));
        assert_eq!(space.segment_query(a, b, 0.0, &QueryFilter::default()).len(), 1);
        assert_eq!(space.segment_query(a, b, 0.0, &QueryFilter::default().with_sensors()).len(), 2);
        let skip: BTreeSet<Uid> = [Uid(8)].into_iter().collect();
        let hits = space.segment_query(a, b, 0.0, &QueryFilter::default().with_sensors().excluding(&skip));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].owner.entity, Uid(7));
    }

    #[test]
    fn test_queries_on_missing_shape_are_empty() {
        let mut space = Space::new(SpaceConfig::default());
        let (_, sh) = add_circle(&mut space, 1, DVec2::ZERO, 5.0, false);
        add_circle(&mut space, 2, DVec2::new(3.0, 0.0), 5.0, false);
        assert_eq!(space.shape_query_for(sh, &QueryFilter::default()).len(), 1);
        space.remove_shape(sh);
        assert!(space.shape_query_for(sh, &QueryFilter::default()).is_empty());
    }

    #[test]
    fn test_static_bounds_are_stale_until_reindexed() {
        let mut space = Space::new(SpaceConfig { cell_size: 10.0, ..Default::default() });
        let (bh, sh) = add_circle(&mut space, 1, DVec2::ZERO, 2.0, false);
        space.body_mut(bh).unwrap().set_pose(Pose::at(DVec2::new(100.0, 100.0)));
        assert!(space.point_query(DVec2::new(100.0, 100.0), &QueryFilter::default()).is_empty());
        space.reindex_static();
        assert_eq!(space.point_query(DVec2::new(100.0, 100.0), &QueryFilter::default()), vec![sh]);
    }

    #[test]
    fn test_coincident_circles_separate() {
        let mut space = Space::new(SpaceConfig::default());
        let (a, _) = add_circle(&mut space, 1, DVec2::new(100.0, 100.0), 20.0, true);
        let (b, _) = add_circle(&mut space, 2, DVec2::new(100.0, 100.0), 20.0, true);
        for _ in 0..10 {
            space.step(0.1, &mut NoHook);
        }
        let (pa, pb) = (space.body(a).unwrap().position, space.body(b).unwrap().position);
        assert!((pa - pb).length() > 1.0);
    }

    #[test]
    fn test_sensor_pair_reports_without_response() {
        let mut space = Space::new(SpaceConfig::default());
        let origin = DVec2::new(100.0, 100.0);
        let mut handles = Vec::new();
        for uid in [1, 2] {
            let bh = space.add_body(RigidBody::new_dynamic(1.0, 100.0, Pose::at(origin)));
            space.add_shape(bh, Shape::new(circle(20.0), owner(uid)).with_sensor(true)).unwrap();
            handles.push(bh);
        }
        let mut calls = 0;
        let mut hook = |ev: &ContactEvent| {
            assert!(ev.sensor);
            calls += 1;
            true
        };
        for _ in 0..10 {
            space.step(0.1, &mut hook);
        }
        assert_eq!(calls, 10);
        for bh in handles {
            assert_eq!(space.body(bh).unwrap().position, origin);
        }
    }

    #[test]
    fn test_hook_can_cancel_response() {
        let mut space = Space::new(SpaceConfig::default());
        let (a, _) = add_circle(&mut space, 1, DVec2::ZERO, 10.0, true);
        let (b, _) = add_circle(&mut space, 2, DVec2::new(5.0, 0.0), 10.0, true);
        let mut pass = |_: &ContactEvent| false;
        space.step(0.1, &mut pass);
        space.step(0.1, &mut pass);
        assert_eq!(space.body(a).unwrap().position, DVec2::ZERO);
        assert_eq!(space.body(b).unwrap().position, DVec2::new(5.0, 0.0));
    }

    #[test]
    fn test_non_colliding_joint_suppresses_contacts() {
        let mut space = Space::new(SpaceConfig::default());
        let (a, _) = add_circle(&mut space, 1, DVec2::ZERO, 10.0, true);
        let (b, _) = add_circle(&mut space, 2, DVec2::new(5.0, 0.0), 10.0, true);
        space.add_constraint(Constraint::pivot(a, b, DVec2::new(2.5, 0.0), DVec2::new(-2.5, 0.0))).unwrap();
        let mut calls = 0;
        let mut hook = |_: &ContactEvent| {
            calls += 1;
            true
        };
        space.step(0.1, &mut hook);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_mask_filters_pairs() {
        let mut space = Space::new(SpaceConfig::default());
        let team = LayerMask { layer: 2, collides_with: u32::MAX, exclude: 2 };
        for (uid, x) in [(1, 0.0), (2, 5.0)] {
            let bh = space.add_body(RigidBody::new_dynamic(1.0, 1.0, Pose::at(DVec2::new(x, 0.0))));
            space.add_shape(bh, Shape::new(circle(10.0), owner(uid)).with_mask(team)).unwrap();
        }
        let mut calls = 0;
        let mut hook = |_: &ContactEvent| {
            calls += 1;
            true
        };
        space.step(0.1, &mut hook);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_circle_rests_on_static_box() {
        let mut space = Space::new(SpaceConfig { cell_size: 16.0, ..Default::default() });
        let floor = space.add_body(RigidBody::new_static(Pose::default()));
        let verts = vec![DVec2::new(-50.0, -5.0), DVec2::new(50.0, -5.0), DVec2::new(50.0, 5.0), DVec2::new(-50.0, 5.0)];
        space.add_shape(floor, Shape::new(Primitive::Polygon { vertices: verts }, owner(1))).unwrap();
        let (ball, _) = add_circle(&mut space, 2, DVec2::new(0.0, 20.0), 5.0, true);
        space.body_mut(ball).unwrap().apply_force(DVec2::new(0.0, -50.0));
        for _ in 0..300 {
            space.step(0.1, &mut NoHook);
        }
        let y = space.body(ball).unwrap().position.y;
        assert!(y > 8.5 && y < 10.5, "y = {y}");
    }
}

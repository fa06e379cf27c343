use glam::DVec2;

use crate::body::{BodyKind, RigidBody};
use crate::constraint::Constraint;
use crate::error::Result;
use crate::geometry::Primitive;
use crate::space::{
    BodyHandle, ConstraintHandle, ContactEvent, QueryFilter, SegmentQueryHit, Shape, ShapeHandle, ShapeQueryHit,
};

/// Receives every touching, filter-approved shape pair during a sub-step.
///
/// Return `false` to let the two shapes pass through each other for this contact.
pub trait ContactHook {
    fn on_contact(&mut self, event: &ContactEvent) -> bool;
}

/// Accepts every contact with the normal physical response.
pub struct NoHook;

impl ContactHook for NoHook {
    fn on_contact(&mut self, _event: &ContactEvent) -> bool {
        true
    }
}

impl<F: FnMut(&ContactEvent) -> bool> ContactHook for F {
    fn on_contact(&mut self, event: &ContactEvent) -> bool {
        self(event)
    }
}

/// Public API contract for the spatial world.
pub trait SpaceApi {
    // --- Membership --------------------------------------------------------

    /// Insert a body. Constraints and shapes can only reference bodies in the space.
    fn add_body(&mut self, body: RigidBody) -> BodyHandle;

    /// Attach a shape to a body already in the space.
    fn add_shape(&mut self, body: BodyHandle, shape: Shape) -> Result<ShapeHandle>;

    /// Insert a constraint between two bodies already in the space.
    fn add_constraint(&mut self, constraint: Constraint) -> Result<ConstraintHandle>;

    /// Remove a body. Fails while shapes or constraints still reference it.
    fn remove_body(&mut self, body: BodyHandle) -> Result<RigidBody>;

    fn remove_shape(&mut self, shape: ShapeHandle) -> Option<Shape>;

    fn remove_constraint(&mut self, constraint: ConstraintHandle) -> Option<Constraint>;

    // --- Simulation --------------------------------------------------------

    /// Advance by `dt`, resolving constraints and contacts. `hook` sees every contact.
    fn step(&mut self, dt: f64, hook: &mut dyn ContactHook);

    /// Refresh cached bounds of every static body's shapes.
    fn reindex_static(&mut self);

    /// Refresh cached bounds of one body's shapes after an out-of-band move.
    fn reindex_shapes_for_body(&mut self, body: BodyHandle);

    // --- Queries -----------------------------------------------------------

    /// Every shape crossed by the (optionally thick) segment, sorted by increasing fraction.
    fn segment_query(&self, start: DVec2, end: DVec2, radius: f64, filter: &QueryFilter<'_>) -> Vec<SegmentQueryHit>;

    /// Shapes overlapping the given world-space primitive.
    fn shape_query(&self, primitive: &Primitive, filter: &QueryFilter<'_>) -> Vec<ShapeQueryHit>;

    /// Shapes overlapping a shape already in the space. Empty when the shape is not in the space.
    fn shape_query_for(&self, shape: ShapeHandle, filter: &QueryFilter<'_>) -> Vec<ShapeQueryHit>;

    /// Shapes containing the point.
    fn point_query(&self, point: DVec2, filter: &QueryFilter<'_>) -> Vec<ShapeHandle>;

    // --- Accessors ---------------------------------------------------------

    fn body(&self, body: BodyHandle) -> Option<&RigidBody>;
    fn body_mut(&mut self, body: BodyHandle) -> Option<&mut RigidBody>;
    fn shape(&self, shape: ShapeHandle) -> Option<&Shape>;
    fn constraint(&self, constraint: ConstraintHandle) -> Option<&Constraint>;
    fn constraint_mut(&mut self, constraint: ConstraintHandle) -> Option<&mut Constraint>;
    fn body_kind(&self, body: BodyHandle) -> Option<BodyKind> {
        self.body(body).map(|b| b.kind)
    }
}

/// Narrowphase primitive tests.
///
/// Contact normals point from the first argument toward the second.
pub trait NarrowphaseApi {
    // Segments -------------------------------------------------------------

    fn segment_circle(a: DVec2, b: DVec2, center: DVec2, r: f64) -> Option<SegmentHit>;
    fn segment_polygon(a: DVec2, b: DVec2, verts: &[DVec2]) -> Option<SegmentHit>;
    fn segment_capsule(a: DVec2, b: DVec2, p: DVec2, q: DVec2, r: f64) -> Option<SegmentHit>;

    // Contacts -------------------------------------------------------------

    fn contact_circle_circle(c0: DVec2, r0: f64, c1: DVec2, r1: f64) -> Option<Overlap>;
    fn contact_polygon_circle(verts: &[DVec2], c: DVec2, r: f64) -> Option<Overlap>;
    fn contact_polygon_polygon(va: &[DVec2], vb: &[DVec2]) -> Option<Overlap>;
    fn contact_capsule_circle(p: DVec2, q: DVec2, r: f64, c: DVec2, rc: f64) -> Option<Overlap>;
    fn contact_capsule_capsule(p0: DVec2, q0: DVec2, r0: f64, p1: DVec2, q1: DVec2, r1: f64) -> Option<Overlap>;
    fn contact_polygon_capsule(verts: &[DVec2], p: DVec2, q: DVec2, r: f64) -> Option<Overlap>;
}

/// Segment cast result.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SegmentHit {
    /// Fraction in [0,1] along the segment where the shape is first entered.
    pub toi: f64,
    /// Surface normal at the hit (zero when the segment starts inside).
    pub normal: DVec2,
    pub contact: DVec2,
}

/// Overlap contact result.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Overlap {
    /// Unit normal pointing from the first shape toward the second.
    pub normal: DVec2,
    /// Penetration depth (≥ 0).
    pub depth: f64,
    /// Representative contact point.
    pub contact: DVec2,
}

impl Overlap {
    pub fn flipped(self) -> Self {
        Self { normal: -self.normal, ..self }
    }
}

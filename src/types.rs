use glam::DVec2;
use serde::{Deserialize, Serialize};

/// Playground-issued entity identifier. `Uid(0)` is never issued; sensors use 0 for "no hit".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    pub const NONE: Uid = Uid(0);
}

/// Index of an agent inside its playground.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId(pub usize);

/// Per-playground uid counter. Instance-scoped so independent playgrounds never share ids.
#[derive(Clone, Debug)]
pub struct UidGenerator {
    next: u32,
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl UidGenerator {
    pub fn issue(&mut self) -> Uid {
        let uid = Uid(self.next);
        self.next += 1;
        uid
    }
}

/// Position + absolute angle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: DVec2,
    pub angle: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, angle: f64) -> Self {
        Self { position: DVec2::new(x, y), angle }
    }

    pub fn at(position: DVec2) -> Self {
        Self { position, angle: 0.0 }
    }

    /// Map a point expressed in this frame into world space.
    pub fn transform_point(&self, local: DVec2) -> DVec2 {
        self.position + rotate(local, self.angle)
    }

    /// Map a world point into this frame.
    pub fn inverse_transform_point(&self, world: DVec2) -> DVec2 {
        rotate(world - self.position, -self.angle)
    }

    /// A frame expressed relative to this one, mapped to this frame's parent.
    pub fn compose(&self, child: Pose) -> Pose {
        Pose { position: self.transform_point(child.position), angle: self.angle + child.angle }
    }
}

impl From<(f64, f64)> for Pose {
    fn from((x, y): (f64, f64)) -> Self {
        Pose::new(x, y, 0.0)
    }
}

impl From<((f64, f64), f64)> for Pose {
    fn from(((x, y), angle): ((f64, f64), f64)) -> Self {
        Pose::new(x, y, angle)
    }
}

#[inline]
pub fn rotate(v: DVec2, angle: f64) -> DVec2 {
    DVec2::from_angle(angle).rotate(v)
}

/// 2D cross product (z component).
#[inline]
pub fn cross(a: DVec2, b: DVec2) -> f64 {
    a.x * b.y - a.y * b.x
}

/// `w × r` for a scalar angular velocity.
#[inline]
pub fn cross_sv(w: f64, r: DVec2) -> DVec2 {
    DVec2::new(-w * r.y, w * r.x)
}

/// Team and layer filtering. Layer bit 0 is the shared "no team" layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMask {
    pub layer: u32,
    pub collides_with: u32,
    /// Layers refused even when `collides_with` accepts them.
    pub exclude: u32,
}

impl Default for LayerMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl LayerMask {
    pub const ALL: LayerMask = LayerMask { layer: 1, collides_with: u32::MAX, exclude: 0 };

    pub fn simple(layer: u32, collides_with: u32) -> Self {
        Self { layer, collides_with, exclude: 0 }
    }

    /// One-sided test: does `self` accept `other`'s layers.
    pub fn allows(self, other: LayerMask) -> bool {
        self.collides_with & other.layer != 0 && self.exclude & other.layer == 0
    }

    /// Both sides must consent.
    pub fn mutual(self, other: LayerMask) -> bool {
        self.allows(other) && other.allows(self)
    }
}

/// Interaction role of a shape. Distinct from geometry; used only for handler dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollisionType(pub u16);

impl CollisionType {
    pub const DEFAULT: CollisionType = CollisionType(0);
    pub const AGENT: CollisionType = CollisionType(1);
    pub const GRASPABLE: CollisionType = CollisionType(2);
    pub const CONTACT: CollisionType = CollisionType(3);
    pub const EDIBLE: CollisionType = CollisionType(4);
    pub const INTERACTIVE: CollisionType = CollisionType(5);
    pub const PASSIVE: CollisionType = CollisionType(6);
    pub const GEM: CollisionType = CollisionType(7);
    pub const ACTIVATABLE_BY_GEM: CollisionType = CollisionType(8);
    pub const TELEPORT: CollisionType = CollisionType(9);
    pub const DEVICE: CollisionType = CollisionType(10);
    pub const GRASPER: CollisionType = CollisionType(11);

    /// First value handed out by [`CollisionTypes::register`].
    pub const FIRST_CUSTOM: u16 = 32;
}

/// Extensible registry of named collision types on top of the built-in ones.
#[derive(Clone, Debug)]
pub struct CollisionTypes {
    names: Vec<(String, CollisionType)>,
    next: u16,
}

impl Default for CollisionTypes {
    fn default() -> Self {
        let builtin = [
            ("default", CollisionType::DEFAULT),
            ("agent", CollisionType::AGENT),
            ("graspable", CollisionType::GRASPABLE),
            ("contact", CollisionType::CONTACT),
            ("edible", CollisionType::EDIBLE),
            ("interactive", CollisionType::INTERACTIVE),
            ("passive", CollisionType::PASSIVE),
            ("gem", CollisionType::GEM),
            ("activatable_by_gem", CollisionType::ACTIVATABLE_BY_GEM),
            ("teleport", CollisionType::TELEPORT),
            ("device", CollisionType::DEVICE),
            ("grasper", CollisionType::GRASPER),
        ];
        Self {
            names: builtin.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            next: CollisionType::FIRST_CUSTOM,
        }
    }
}

impl CollisionTypes {
    /// Return the type registered under `name`, allocating a new one on first use.
    pub fn register(&mut self, name: &str) -> CollisionType {
        if let Some(t) = self.get(name) {
            return t;
        }
        let t = CollisionType(self.next);
        self.next += 1;
        self.names.push((name.to_string(), t));
        t
    }

    pub fn get(&self, name: &str) -> Option<CollisionType> {
        self.names.iter().find(|(n, _)| n == name).map(|(_, t)| *t)
    }

    pub fn name_of(&self, t: CollisionType) -> Option<&str> {
        self.names.iter().find(|(_, c)| *c == t).map(|(n, _)| n.as_str())
    }
}

/// Owner of a shape, carried on the shape itself so collision callbacks resolve it in O(1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShapeOwner {
    pub entity: Uid,
    pub agent: Option<AgentId>,
}

/// Axis-aligned bounds.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: DVec2,
    pub max: DVec2,
}

impl Aabb {
    pub fn new(min: DVec2, max: DVec2) -> Self {
        Self { min, max }
    }

    pub fn inflate(self, r: f64) -> Self {
        Self { min: self.min - DVec2::splat(r), max: self.max + DVec2::splat(r) }
    }

    pub fn union(self, other: Aabb) -> Self {
        Self { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_mutual_consent() {
        let a = LayerMask { layer: 1, collides_with: 2, exclude: 0 };
        let b = LayerMask { layer: 2, collides_with: 0, exclude: 0 };
        assert!(a.allows(b));
        assert!(!b.allows(a));
        assert!(!a.mutual(b));
        assert!(LayerMask::ALL.mutual(LayerMask::ALL));
    }

    #[test]
    fn test_exclude_blocks_layer() {
        let a = LayerMask { layer: 4, collides_with: u32::MAX, exclude: 4 };
        assert!(!a.allows(a));
    }

    #[test]
    fn test_uids_start_at_one() {
        let mut g = UidGenerator::default();
        assert_eq!(g.issue(), Uid(1));
        assert_eq!(g.issue(), Uid(2));
    }

    #[test]
    fn test_pose_round_trip() {
        let p = Pose::new(10.0, -3.0, 0.7);
        let local = DVec2::new(2.0, 5.0);
        let back = p.inverse_transform_point(p.transform_point(local));
        assert!((back - local).length() < 1e-12);
    }

    #[test]
    fn test_custom_collision_types() {
        let mut reg = CollisionTypes::default();
        let a = reg.register("coin");
        assert_eq!(a.0, CollisionType::FIRST_CUSTOM);
        assert_eq!(reg.register("coin"), a);
        assert_eq!(reg.get("agent"), Some(CollisionType::AGENT));
        assert_eq!(reg.name_of(a), Some("coin"));
    }
}

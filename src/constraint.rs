//! Joints between two bodies, solved with sequential impulses.
//!
//! Each constraint keeps its accumulated impulse across iterations of a
//! sub-step and warm-starts the next sub-step from it.

use glam::DVec2;

use crate::body::RigidBody;
use crate::space::BodyHandle;
use crate::types::{cross, cross_sv, rotate};

/// Fraction of joint drift corrected per sub-step.
const JOINT_BIAS: f64 = 0.3;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConstraintKind {
    /// Keeps `anchor_a` (local to A) and `anchor_b` (local to B) on the same world point.
    PivotJoint { anchor_a: DVec2, anchor_b: DVec2 },
    /// Keeps the two anchors at a fixed distance.
    PinJoint { anchor_a: DVec2, anchor_b: DVec2, distance: f64 },
    /// Bounds `angle_b - angle_a` to `[min, max]`.
    RotaryLimit { min: f64, max: f64 },
    /// Drives `angular_velocity_b - angular_velocity_a` toward `rate`.
    Motor { rate: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    pub body_a: BodyHandle,
    pub body_b: BodyHandle,
    pub kind: ConstraintKind,
    /// Whether shapes of the two bodies may still collide with each other.
    pub collide_bodies: bool,
    pub max_force: f64,
    cache: Cache,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Cache {
    r1: DVec2,
    r2: DVec2,
    /// Inverse effective mass; 2x2 for pivots, scalar in `k[0].x` otherwise.
    k: [DVec2; 2],
    n: DVec2,
    bias: DVec2,
    acc: DVec2,
    active: bool,
}

impl Constraint {
    fn with_kind(body_a: BodyHandle, body_b: BodyHandle, kind: ConstraintKind) -> Self {
        Self { body_a, body_b, kind, collide_bodies: false, max_force: f64::INFINITY, cache: Cache::default() }
    }

    pub fn pivot(body_a: BodyHandle, body_b: BodyHandle, anchor_a: DVec2, anchor_b: DVec2) -> Self {
        Self::with_kind(body_a, body_b, ConstraintKind::PivotJoint { anchor_a, anchor_b })
    }

    /// Pin joint whose rest distance is taken from the bodies' current poses.
    pub fn pin(a: (BodyHandle, &RigidBody), b: (BodyHandle, &RigidBody), anchor_a: DVec2, anchor_b: DVec2) -> Self {
        let distance = (b.1.world_point(anchor_b) - a.1.world_point(anchor_a)).length();
        Self::with_kind(a.0, b.0, ConstraintKind::PinJoint { anchor_a, anchor_b, distance })
    }

    pub fn rotary_limit(body_a: BodyHandle, body_b: BodyHandle, min: f64, max: f64) -> Self {
        Self::with_kind(body_a, body_b, ConstraintKind::RotaryLimit { min, max })
    }

    pub fn motor(body_a: BodyHandle, body_b: BodyHandle, rate: f64) -> Self {
        Self::with_kind(body_a, body_b, ConstraintKind::Motor { rate })
    }

    pub fn with_max_force(mut self, max_force: f64) -> Self {
        self.max_force = max_force;
        self
    }

    pub fn with_collide_bodies(mut self, collide: bool) -> Self {
        self.collide_bodies = collide;
        self
    }

    pub fn rate(&self) -> Option<f64> {
        match self.kind {
            ConstraintKind::Motor { rate } => Some(rate),
            _ => None,
        }
    }

    /// No-op on anything but a motor.
    pub fn set_rate(&mut self, value: f64) {
        if let ConstraintKind::Motor { rate } = &mut self.kind {
            *rate = value;
        }
    }

    pub fn involves(&self, body: BodyHandle) -> bool {
        self.body_a == body || self.body_b == body
    }

    /// Compute effective masses and bias, then apply the warm-start impulse.
    pub(crate) fn pre_solve(&mut self, a: &mut RigidBody, b: &mut RigidBody, dt: f64) {
        let (ma, mb) = (a.inv_mass(), b.inv_mass());
        let (ia, ib) = (a.inv_moment(), b.inv_moment());
        let c = &mut self.cache;
        c.active = true;
        match self.kind {
            ConstraintKind::PivotJoint { anchor_a, anchor_b } => {
                c.r1 = rotate(anchor_a, a.angle);
                c.r2 = rotate(anchor_b, b.angle);
                let k11 = ma + mb + ia * c.r1.y * c.r1.y + ib * c.r2.y * c.r2.y;
                let k12 = -ia * c.r1.x * c.r1.y - ib * c.r2.x * c.r2.y;
                let k22 = ma + mb + ia * c.r1.x * c.r1.x + ib * c.r2.x * c.r2.x;
                let det = k11 * k22 - k12 * k12;
                if det.abs() <= f64::EPSILON {
                    c.active = false;
                    return;
                }
                let inv = 1.0 / det;
                c.k = [DVec2::new(k22 * inv, -k12 * inv), DVec2::new(-k12 * inv, k11 * inv)];
                let delta = (b.position + c.r2) - (a.position + c.r1);
                c.bias = -delta * (JOINT_BIAS / dt);
                apply_pair(a, b, c.r1, c.r2, c.acc);
            }
            ConstraintKind::PinJoint { anchor_a, anchor_b, distance } => {
                c.r1 = rotate(anchor_a, a.angle);
                c.r2 = rotate(anchor_b, b.angle);
                let delta = (b.position + c.r2) - (a.position + c.r1);
                let dist = delta.length();
                c.n = delta.normalize_or(DVec2::X);
                let rn1 = cross(c.r1, c.n);
                let rn2 = cross(c.r2, c.n);
                let k = ma + mb + ia * rn1 * rn1 + ib * rn2 * rn2;
                if k <= f64::EPSILON {
                    c.active = false;
                    return;
                }
                c.k[0].x = 1.0 / k;
                c.bias.x = -(dist - distance) * (JOINT_BIAS / dt);
                apply_pair(a, b, c.r1, c.r2, c.n * c.acc.x);
            }
            ConstraintKind::RotaryLimit { min, max } => {
                let k = ia + ib;
                let diff = b.angle - a.angle;
                if k <= f64::EPSILON {
                    c.active = false;
                    return;
                }
                c.k[0].x = 1.0 / k;
                if diff < min {
                    c.bias.x = (min - diff) * (JOINT_BIAS / dt);
                    c.n.x = 1.0;
                } else if diff > max {
                    c.bias.x = (max - diff) * (JOINT_BIAS / dt);
                    c.n.x = -1.0;
                } else {
                    c.active = false;
                    c.acc = DVec2::ZERO;
                    return;
                }
                apply_angular(a, b, c.acc.x);
            }
            ConstraintKind::Motor { .. } => {
                let k = ia + ib;
                if k <= f64::EPSILON {
                    c.active = false;
                    return;
                }
                c.k[0].x = 1.0 / k;
                apply_angular(a, b, c.acc.x);
            }
        }
    }

    pub(crate) fn solve(&mut self, a: &mut RigidBody, b: &mut RigidBody, dt: f64) {
        if !self.cache.active {
            return;
        }
        let max_impulse = self.max_force * dt;
        let c = &mut self.cache;
        match self.kind {
            ConstraintKind::PivotJoint { .. } => {
                let vr = relative_velocity(a, b, c.r1, c.r2);
                let rhs = c.bias - vr;
                let j = DVec2::new(c.k[0].dot(rhs), c.k[1].dot(rhs));
                let old = c.acc;
                c.acc = (c.acc + j).clamp_length_max(max_impulse);
                apply_pair(a, b, c.r1, c.r2, c.acc - old);
            }
            ConstraintKind::PinJoint { .. } => {
                let vrn = relative_velocity(a, b, c.r1, c.r2).dot(c.n);
                let j = (c.bias.x - vrn) * c.k[0].x;
                let old = c.acc.x;
                c.acc.x = (old + j).clamp(-max_impulse, max_impulse);
                apply_pair(a, b, c.r1, c.r2, c.n * (c.acc.x - old));
            }
            ConstraintKind::RotaryLimit { .. } => {
                let wr = b.angular_velocity - a.angular_velocity;
                let j = (c.bias.x - wr) * c.k[0].x;
                let old = c.acc.x;
                // Lower limit only pushes positively, upper limit only negatively.
                c.acc.x = if c.n.x > 0.0 { (old + j).clamp(0.0, max_impulse) } else { (old + j).clamp(-max_impulse, 0.0) };
                apply_angular(a, b, c.acc.x - old);
            }
            ConstraintKind::Motor { rate } => {
                let wr = b.angular_velocity - a.angular_velocity;
                let j = (rate - wr) * c.k[0].x;
                let old = c.acc.x;
                c.acc.x = (old + j).clamp(-max_impulse, max_impulse);
                apply_angular(a, b, c.acc.x - old);
            }
        }
    }
}

fn relative_velocity(a: &RigidBody, b: &RigidBody, r1: DVec2, r2: DVec2) -> DVec2 {
    (b.velocity + cross_sv(b.angular_velocity, r2)) - (a.velocity + cross_sv(a.angular_velocity, r1))
}

fn apply_pair(a: &mut RigidBody, b: &mut RigidBody, r1: DVec2, r2: DVec2, j: DVec2) {
    a.apply_impulse(-j, r1);
    b.apply_impulse(j, r2);
}

fn apply_angular(a: &mut RigidBody, b: &mut RigidBody, j: f64) {
    a.angular_velocity -= j * a.inv_moment();
    b.angular_velocity += j * b.inv_moment();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pose;
    use slotmap::SlotMap;

    fn handles() -> (BodyHandle, BodyHandle) {
        let mut sm: SlotMap<BodyHandle, ()> = SlotMap::with_key();
        (sm.insert(()), sm.insert(()))
    }

    fn run(c: &mut Constraint, a: &mut RigidBody, b: &mut RigidBody, steps: usize) {
        let dt = 0.1;
        for _ in 0..steps {
            a.integrate_velocity(dt, 1.0);
            b.integrate_velocity(dt, 1.0);
            c.pre_solve(a, b, dt);
            for _ in 0..10 {
                c.solve(a, b, dt);
            }
            a.integrate_position(dt);
            b.integrate_position(dt);
        }
    }

    #[test]
    fn test_motor_drives_relative_rate() {
        let (ha, hb) = handles();
        let mut a = RigidBody::new_static(Pose::default());
        let mut b = RigidBody::new_dynamic(1.0, 1.0, Pose::default());
        let mut m = Constraint::motor(ha, hb, 2.0);
        run(&mut m, &mut a, &mut b, 1);
        assert!((b.angular_velocity - 2.0).abs() < 1e-9);
        m.set_rate(0.0);
        assert_eq!(m.rate(), Some(0.0));
    }

    #[test]
    fn test_motor_max_force_limits_torque() {
        let (ha, hb) = handles();
        let mut a = RigidBody::new_static(Pose::default());
        let mut b = RigidBody::new_dynamic(1.0, 1.0, Pose::default());
        let mut m = Constraint::motor(ha, hb, 100.0).with_max_force(1.0);
        run(&mut m, &mut a, &mut b, 1);
        // One sub-step of dt = 0.1 can deliver at most 0.1 angular impulse.
        assert!((b.angular_velocity - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_pivot_holds_pendulum_anchor() {
        let (ha, hb) = handles();
        let mut a = RigidBody::new_static(Pose::default());
        let mut b = RigidBody::new_dynamic(1.0, 10.0, Pose::new(10.0, 0.0, 0.0));
        let mut p = Constraint::pivot(ha, hb, DVec2::ZERO, DVec2::new(-10.0, 0.0));
        b.apply_force(DVec2::new(0.0, -5.0));
        run(&mut p, &mut a, &mut b, 15);
        assert!(b.position.y < 0.0);
        run(&mut p, &mut a, &mut b, 85);
        let drift = (b.world_point(DVec2::new(-10.0, 0.0)) - a.position).length();
        assert!(drift < 0.5, "drift {drift}");
    }

    #[test]
    fn test_rotary_limit_stops_spin() {
        let (ha, hb) = handles();
        let mut a = RigidBody::new_static(Pose::default());
        let mut b = RigidBody::new_dynamic(1.0, 1.0, Pose::default());
        b.angular_velocity = 1.0;
        let mut lim = Constraint::rotary_limit(ha, hb, -0.5, 0.5);
        run(&mut lim, &mut a, &mut b, 50);
        assert!(b.angle < 0.6, "angle {}", b.angle);
    }

    #[test]
    fn test_defaults_disable_self_collision() {
        let (ha, hb) = handles();
        let c = Constraint::pivot(ha, hb, DVec2::ZERO, DVec2::ZERO);
        assert!(!c.collide_bodies);
        assert!(c.involves(ha) && c.involves(hb));
    }
}

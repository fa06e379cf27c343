use glam::DVec2;

use crate::types::{Pose, cross, cross_sv, rotate};

/// How a body takes part in integration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BodyKind {
    /// Never moves; velocity is pinned at zero.
    Static,
    Dynamic { mass: f64, moment: f64 },
    /// Moves with its velocity but ignores forces and impulses.
    Kinematic,
}

/// Rigid-motion state integrated by the space.
#[derive(Clone, Debug, PartialEq)]
pub struct RigidBody {
    pub kind: BodyKind,
    pub position: DVec2,
    pub angle: f64,
    pub velocity: DVec2,
    pub angular_velocity: f64,
    /// Accumulated force, applied during every sub-step until cleared.
    pub force: DVec2,
    pub torque: f64,
    /// Position-correction velocities, consumed by the next position update.
    pub(crate) v_bias: DVec2,
    pub(crate) w_bias: f64,
}

impl RigidBody {
    pub fn new(kind: BodyKind, pose: Pose) -> Self {
        Self {
            kind,
            position: pose.position,
            angle: pose.angle,
            velocity: DVec2::ZERO,
            angular_velocity: 0.0,
            force: DVec2::ZERO,
            torque: 0.0,
            v_bias: DVec2::ZERO,
            w_bias: 0.0,
        }
    }

    pub fn new_static(pose: Pose) -> Self {
        Self::new(BodyKind::Static, pose)
    }

    pub fn new_dynamic(mass: f64, moment: f64, pose: Pose) -> Self {
        Self::new(BodyKind::Dynamic { mass, moment }, pose)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, BodyKind::Dynamic { .. })
    }

    pub fn is_static(&self) -> bool {
        matches!(self.kind, BodyKind::Static)
    }

    pub fn mass(&self) -> Option<f64> {
        match self.kind {
            BodyKind::Dynamic { mass, .. } => Some(mass),
            _ => None,
        }
    }

    pub fn inv_mass(&self) -> f64 {
        match self.kind {
            BodyKind::Dynamic { mass, .. } if mass > 0.0 && mass.is_finite() => 1.0 / mass,
            _ => 0.0,
        }
    }

    pub fn inv_moment(&self) -> f64 {
        match self.kind {
            BodyKind::Dynamic { moment, .. } if moment > 0.0 && moment.is_finite() => 1.0 / moment,
            _ => 0.0,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose { position: self.position, angle: self.angle }
    }

    /// Teleport without touching velocities.
    pub fn set_pose(&mut self, pose: Pose) {
        self.position = pose.position;
        self.angle = pose.angle;
    }

    /// Zero velocities and accumulated forces.
    pub fn halt(&mut self) {
        self.velocity = DVec2::ZERO;
        self.angular_velocity = 0.0;
        self.v_bias = DVec2::ZERO;
        self.w_bias = 0.0;
        self.reset_forces();
    }

    pub fn world_point(&self, local: DVec2) -> DVec2 {
        self.position + rotate(local, self.angle)
    }

    pub fn local_point(&self, world: DVec2) -> DVec2 {
        rotate(world - self.position, -self.angle)
    }

    pub fn velocity_at_world_point(&self, point: DVec2) -> DVec2 {
        self.velocity + cross_sv(self.angular_velocity, point - self.position)
    }

    /// Force through the centre of gravity, in world coordinates.
    pub fn apply_force(&mut self, force: DVec2) {
        if self.is_dynamic() {
            self.force += force;
        }
    }

    /// World-space force applied at a body-local point.
    pub fn apply_force_at_local_point(&mut self, force: DVec2, local: DVec2) {
        if self.is_dynamic() {
            self.force += force;
            self.torque += cross(rotate(local, self.angle), force);
        }
    }

    pub fn apply_torque(&mut self, torque: f64) {
        if self.is_dynamic() {
            self.torque += torque;
        }
    }

    pub fn reset_forces(&mut self) {
        self.force = DVec2::ZERO;
        self.torque = 0.0;
    }

    /// Instantaneous impulse at world offset `r` from the centre of gravity.
    pub fn apply_impulse(&mut self, impulse: DVec2, r: DVec2) {
        self.velocity += impulse * self.inv_mass();
        self.angular_velocity += self.inv_moment() * cross(r, impulse);
    }

    pub(crate) fn apply_bias_impulse(&mut self, impulse: DVec2, r: DVec2) {
        self.v_bias += impulse * self.inv_mass();
        self.w_bias += self.inv_moment() * cross(r, impulse);
    }

    pub(crate) fn integrate_velocity(&mut self, dt: f64, damping: f64) {
        match self.kind {
            BodyKind::Static => {
                self.velocity = DVec2::ZERO;
                self.angular_velocity = 0.0;
            }
            BodyKind::Kinematic => {}
            BodyKind::Dynamic { .. } => {
                let retain = damping.powf(dt);
                self.velocity = self.velocity * retain + self.force * (self.inv_mass() * dt);
                self.angular_velocity = self.angular_velocity * retain + self.torque * self.inv_moment() * dt;
            }
        }
    }

    pub(crate) fn integrate_position(&mut self, dt: f64) {
        if self.is_static() {
            return;
        }
        self.position += (self.velocity + self.v_bias) * dt;
        self.angle += (self.angular_velocity + self.w_bias) * dt;
        self.v_bias = DVec2::ZERO;
        self.w_bias = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_body_has_no_inverse_mass() {
        let mut b = RigidBody::new_static(Pose::default());
        assert_eq!(b.inv_mass(), 0.0);
        b.apply_force(DVec2::new(10.0, 0.0));
        b.velocity = DVec2::new(1.0, 1.0);
        b.integrate_velocity(0.1, 1.0);
        b.integrate_position(0.1);
        assert_eq!(b.velocity, DVec2::ZERO);
        assert_eq!(b.position, DVec2::ZERO);
    }

    #[test]
    fn test_force_integration() {
        let mut b = RigidBody::new_dynamic(2.0, 1.0, Pose::default());
        b.apply_force(DVec2::new(4.0, 0.0));
        b.integrate_velocity(0.5, 1.0);
        assert!((b.velocity.x - 1.0).abs() < 1e-12);
        b.integrate_position(0.5);
        assert!((b.position.x - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_off_centre_force_produces_torque() {
        let mut b = RigidBody::new_dynamic(1.0, 1.0, Pose::default());
        b.apply_force_at_local_point(DVec2::new(0.0, 1.0), DVec2::new(1.0, 0.0));
        assert!((b.torque - 1.0).abs() < 1e-12);
        b.reset_forces();
        assert_eq!(b.torque, 0.0);
    }

    #[test]
    fn test_damping_is_per_time_unit() {
        let mut b = RigidBody::new_dynamic(1.0, 1.0, Pose::default());
        b.velocity = DVec2::new(1.0, 0.0);
        for _ in 0..10 {
            b.integrate_velocity(0.1, 0.5);
        }
        assert!((b.velocity.x - 0.5).abs() < 1e-12);
    }
}

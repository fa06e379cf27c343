use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How team membership turns into collision filtering.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamPolicy {
    /// Shapes sharing a team never collide.
    #[default]
    IgnoreTeammates,
    /// Team members only collide with shapes of their own team (and team-less shapes).
    OnlyTeammates,
}

/// Playground-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaygroundConfig {
    /// Physics sub-steps per playground step; each advances `1 / physics_steps`.
    pub physics_steps: usize,
    /// Sequential-impulse iterations per sub-step.
    pub solver_iterations: usize,
    /// Fraction of velocity retained after one time unit.
    pub damping: f64,
    /// Broad-phase grid cell size in world units.
    pub cell_size: f64,
    /// Attempts made by samplers before a non-overlapping placement gives up.
    pub placement_retries: usize,
    pub seed: u64,
    pub team_policy: TeamPolicy,
    /// Penetration allowed before position correction kicks in.
    pub collision_slop: f64,
    /// Fraction of remaining penetration corrected per sub-step.
    pub collision_bias: f64,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            physics_steps: 10,
            solver_iterations: 10,
            damping: 0.9,
            cell_size: 64.0,
            placement_retries: 100,
            seed: 0,
            team_policy: TeamPolicy::IgnoreTeammates,
            collision_slop: 0.1,
            collision_bias: 0.2,
        }
    }
}

impl PlaygroundConfig {
    pub fn validate(&self) -> Result<()> {
        if self.physics_steps == 0 {
            return Err(Error::InvalidConfig("physics_steps must be at least 1".into()));
        }
        if self.solver_iterations == 0 {
            return Err(Error::InvalidConfig("solver_iterations must be at least 1".into()));
        }
        if !(self.cell_size > 0.0) {
            return Err(Error::InvalidConfig(format!("cell_size must be positive, got {}", self.cell_size)));
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(Error::InvalidConfig(format!("damping must be in (0, 1], got {}", self.damping)));
        }
        if !(0.0..=1.0).contains(&self.collision_bias) {
            return Err(Error::InvalidConfig("collision_bias must be in [0, 1]".into()));
        }
        Ok(())
    }

    /// Duration of one physics sub-step.
    pub fn sub_dt(&self) -> f64 {
        1.0 / self.physics_steps as f64
    }
}

/// Solver and broad-phase settings used by the space.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpaceConfig {
    pub cell_size: f64,
    pub iterations: usize,
    pub damping: f64,
    pub collision_slop: f64,
    pub collision_bias: f64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig::from(&PlaygroundConfig::default())
    }
}

impl From<&PlaygroundConfig> for SpaceConfig {
    fn from(cfg: &PlaygroundConfig) -> Self {
        Self {
            cell_size: cfg.cell_size,
            iterations: cfg.solver_iterations,
            damping: cfg.damping,
            collision_slop: cfg.collision_slop,
            collision_bias: cfg.collision_bias,
        }
    }
}

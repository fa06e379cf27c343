use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::observation::SpaceSpec;

/// Raw command sent to a controller.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    Discrete(i64),
    Continuous(f64),
}

impl From<f64> for CommandValue {
    fn from(v: f64) -> Self {
        CommandValue::Continuous(v)
    }
}

impl From<i64> for CommandValue {
    fn from(v: i64) -> Self {
        CommandValue::Discrete(v)
    }
}

impl From<bool> for CommandValue {
    fn from(v: bool) -> Self {
        CommandValue::Discrete(v as i64)
    }
}

impl CommandValue {
    pub fn as_f64(self) -> f64 {
        match self {
            CommandValue::Continuous(v) => v,
            CommandValue::Discrete(v) => v as f64,
        }
    }
}

impl std::fmt::Display for CommandValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandValue::Continuous(v) => write!(f, "{v}"),
            CommandValue::Discrete(v) => write!(f, "{v}"),
        }
    }
}

/// Declared command domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerKind {
    Continuous { min: f64, max: f64, default: f64 },
    Discrete { values: Vec<i64>, default: i64 },
    Boolean,
}

/// What a controller's value drives on its agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actuator {
    /// Force along the base heading, scaled by the command.
    Forward { force: f64 },
    /// Force perpendicular to the base heading.
    Lateral { force: f64 },
    Rotation { torque: f64 },
    /// Motor rate of a jointed part, scaled by the part's rotation speed.
    Motor { part: String },
    Grasp,
    Activate,
    Eat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub name: String,
    pub kind: ControllerKind,
    pub actuator: Actuator,
    /// Out-of-domain commands fail instead of falling back to the default.
    #[serde(default)]
    pub hard_check: bool,
    #[serde(skip, default = "idle")]
    value: CommandValue,
}

fn idle() -> CommandValue {
    CommandValue::Discrete(0)
}

impl Controller {
    pub fn new(name: impl Into<String>, kind: ControllerKind, actuator: Actuator) -> Self {
        let mut c = Self { name: name.into(), kind, actuator, hard_check: false, value: idle() };
        c.reset();
        c
    }

    /// Continuous controller over `[-1, 1]`.
    pub fn continuous(name: impl Into<String>, actuator: Actuator) -> Self {
        Self::new(name, ControllerKind::Continuous { min: -1.0, max: 1.0, default: 0.0 }, actuator)
    }

    pub fn boolean(name: impl Into<String>, actuator: Actuator) -> Self {
        Self::new(name, ControllerKind::Boolean, actuator)
    }

    pub fn discrete(name: impl Into<String>, actuator: Actuator, values: Vec<i64>) -> Self {
        let default = if values.contains(&0) { 0 } else { values.first().copied().unwrap_or(0) };
        Self::new(name, ControllerKind::Discrete { values, default }, actuator)
    }

    pub fn with_hard_check(mut self, hard_check: bool) -> Self {
        self.hard_check = hard_check;
        self
    }

    pub fn default_value(&self) -> CommandValue {
        match &self.kind {
            ControllerKind::Continuous { default, .. } => CommandValue::Continuous(*default),
            ControllerKind::Discrete { default, .. } => CommandValue::Discrete(*default),
            ControllerKind::Boolean => CommandValue::Discrete(0),
        }
    }

    pub fn contains(&self, value: CommandValue) -> bool {
        match (&self.kind, value) {
            (ControllerKind::Continuous { min, max, .. }, v) => {
                let v = v.as_f64();
                v.is_finite() && (*min..=*max).contains(&v)
            }
            (ControllerKind::Discrete { values, .. }, CommandValue::Discrete(v)) => values.contains(&v),
            (ControllerKind::Boolean, CommandValue::Discrete(v)) => v == 0 || v == 1,
            _ => false,
        }
    }

    /// In-domain commands pass through; others fail under `hard_check` or become the default.
    pub fn check(&self, agent: &str, value: CommandValue) -> Result<CommandValue> {
        if self.contains(value) {
            return Ok(value);
        }
        if self.hard_check {
            return Err(Error::InvalidCommand { agent: agent.to_string(), controller: self.name.clone(), value: value.to_string() });
        }
        Ok(self.default_value())
    }

    pub fn set(&mut self, value: CommandValue) {
        self.value = value;
    }

    pub fn value(&self) -> CommandValue {
        self.value
    }

    pub fn scalar(&self) -> f64 {
        self.value.as_f64()
    }

    pub fn is_active(&self) -> bool {
        self.scalar() != 0.0
    }

    pub fn reset(&mut self) {
        self.value = self.default_value();
    }

    pub fn space(&self) -> SpaceSpec {
        match &self.kind {
            ControllerKind::Continuous { min, max, .. } => SpaceSpec::Box { low: *min, high: *max, shape: vec![1] },
            ControllerKind::Discrete { values, .. } => SpaceSpec::Discrete { values: values.clone() },
            ControllerKind::Boolean => SpaceSpec::Discrete { values: vec![0, 1] },
        }
    }
}

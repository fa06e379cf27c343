//! Structural descriptions and buffers exchanged with an RL wrapper.

use std::collections::BTreeMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::types::Uid;

/// Declared domain of an action or observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpaceSpec {
    Box { low: f64, high: f64, shape: Vec<usize> },
    Discrete { values: Vec<i64> },
    Dict { entries: BTreeMap<String, SpaceSpec> },
}

impl SpaceSpec {
    pub fn dict(entries: impl IntoIterator<Item = (String, SpaceSpec)>) -> Self {
        SpaceSpec::Dict { entries: entries.into_iter().collect() }
    }

    /// Number of scalars a value of this space holds.
    pub fn flat_len(&self) -> usize {
        match self {
            SpaceSpec::Box { shape, .. } => shape.iter().product(),
            SpaceSpec::Discrete { .. } => 1,
            SpaceSpec::Dict { entries } => entries.values().map(SpaceSpec::flat_len).sum(),
        }
    }
}

/// Dense row-major sensor output.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Observation {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }
}

/// Sensor name -> buffer.
pub type AgentObservation = BTreeMap<String, Observation>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepInfo {
    pub timestep: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutput {
    pub observations: BTreeMap<String, AgentObservation>,
    pub rewards: BTreeMap<String, f64>,
    pub done: bool,
    pub info: StepInfo,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResetOutput {
    pub observations: BTreeMap<String, AgentObservation>,
    pub rewards: BTreeMap<String, f64>,
    pub done: bool,
}

/// What a renderer needs to draw one live entity.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityView {
    pub uid: Uid,
    pub name: Option<String>,
    pub position: DVec2,
    pub angle: f64,
    pub moved: bool,
    pub color: [f32; 3],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_len_of_nested_dict() {
        let space = SpaceSpec::dict([
            ("forward".to_string(), SpaceSpec::Box { low: -1.0, high: 1.0, shape: vec![1] }),
            ("grasp".to_string(), SpaceSpec::Discrete { values: vec![0, 1] }),
            ("rgb".to_string(), SpaceSpec::Box { low: 0.0, high: 1.0, shape: vec![16, 3] }),
        ]);
        assert_eq!(space.flat_len(), 50);
    }

    #[test]
    fn test_space_serializes_tagged() {
        let json = serde_json::to_string(&SpaceSpec::Discrete { values: vec![0, 1] }).unwrap();
        assert_eq!(json, r#"{"kind":"discrete","values":[0,1]}"#);
    }
}

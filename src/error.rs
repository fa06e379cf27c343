use thiserror::Error;

use crate::types::{CollisionType, Uid};

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide whether a failure is recoverable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad setup. Raised before any `step()` can run.
    Config,
    /// No valid pose found within the retry budget. Recoverable.
    Placement,
    /// A command fell outside its controller's domain with `hard_check` on.
    Command,
    /// Programmer error against the world's structural invariants.
    Invariant,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid shape kind: {0:?}")]
    InvalidShapeKind(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("handler already registered for collision pair ({a:?}, {b:?})")]
    DuplicateHandler { a: CollisionType, b: CollisionType },

    #[error("name already in use: {0:?}")]
    NameCollision(String),

    #[error("unknown agent: {0:?}")]
    UnknownAgent(String),

    #[error("agent {agent:?} has no controller named {controller:?}")]
    UnknownController { agent: String, controller: String },

    #[error("agent {agent:?} has no part named {part:?}")]
    UnknownPart { agent: String, part: String },

    #[error("unknown entity: {0:?}")]
    UnknownEntity(Uid),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no non-overlapping placement found after {attempts} attempts")]
    PlacementRetryExhausted { attempts: usize },

    #[error("command {value} is outside the domain of {agent:?}/{controller:?}")]
    InvalidCommand { agent: String, controller: String, value: String },

    #[error("body still owns {0} shape(s)")]
    DanglingShape(usize),

    #[error("body still referenced by {0} constraint(s)")]
    DanglingConstraint(usize),

    #[error("body is not in the space")]
    BodyNotInSpace,

    #[error("entity {0:?} is already in the playground")]
    AlreadyInPlayground(Uid),

    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidShapeKind(_)
            | Error::InvalidShape(_)
            | Error::DuplicateHandler { .. }
            | Error::NameCollision(_)
            | Error::UnknownAgent(_)
            | Error::UnknownController { .. }
            | Error::UnknownPart { .. }
            | Error::UnknownEntity(_)
            | Error::InvalidConfig(_) => ErrorClass::Config,
            Error::PlacementRetryExhausted { .. } => ErrorClass::Placement,
            Error::InvalidCommand { .. } => ErrorClass::Command,
            Error::DanglingShape(_)
            | Error::DanglingConstraint(_)
            | Error::BodyNotInSpace
            | Error::AlreadyInPlayground(_)
            | Error::Invariant(_) => ErrorClass::Invariant,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Placement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_placement_is_recoverable() {
        assert!(Error::PlacementRetryExhausted { attempts: 100 }.is_recoverable());
        assert!(!Error::DanglingShape(1).is_recoverable());
        assert!(!Error::InvalidShapeKind("blob".into()).is_recoverable());
        assert_eq!(
            Error::DuplicateHandler { a: CollisionType::AGENT, b: CollisionType::GEM }.class(),
            ErrorClass::Config
        );
        assert_eq!(Error::Invariant("x").class(), ErrorClass::Invariant);
    }
}

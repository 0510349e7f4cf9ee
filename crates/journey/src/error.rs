use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type JourneyResult<T> = Result<T, JourneyError>;

/// Errors returned to callers of the journey engine. Step-level failures are
/// never surfaced this way; they become execution status transitions.
#[derive(Error, Debug)]
pub enum JourneyError {
    #[error("journey definition is invalid: {}", summarize(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} {id} belongs to another tenant")]
    TenantMismatch { kind: EntityKind, id: String },

    #[error("execution store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl JourneyError {
    pub fn journey_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: EntityKind::Journey,
            id: id.to_string(),
        }
    }

    pub fn execution_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: EntityKind::Execution,
            id: id.to_string(),
        }
    }

    /// Dispatcher-level errors the scheduler recovers from by releasing the
    /// lease instead of failing the execution.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Internal(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Journey,
    Step,
    Execution,
    Rule,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Journey => "journey",
            Self::Step => "step",
            Self::Execution => "execution",
            Self::Rule => "automation rule",
        };
        f.write_str(name)
    }
}

/// One problem found while validating a journey definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_no: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn journey(message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            order_no: None,
            field: None,
            message: message.into(),
        }
    }

    pub fn step(step_id: Uuid, order_no: u32, message: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id),
            order_no: Some(order_no),
            field: None,
            message: message.into(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    match issues {
        [] => "no details".to_string(),
        [only] => only.message.clone(),
        [first, rest @ ..] => format!("{} (and {} more)", first.message, rest.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_summarizes() {
        let err = JourneyError::Validation(vec![
            ValidationIssue::journey("journey has no steps"),
            ValidationIssue::journey("second"),
        ]);
        assert_eq!(
            err.to_string(),
            "journey definition is invalid: journey has no steps (and 1 more)"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(JourneyError::Store("down".into()).is_transient());
        assert!(!JourneyError::Conflict("busy".into()).is_transient());
        assert!(!JourneyError::journey_not_found(Uuid::new_v4()).is_transient());
    }
}

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::types::ExecutionStatus;

/// Describes a single valid state transition for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub trigger: String,
}

/// Guards the execution lifecycle by enforcing a finite set of valid
/// status transitions.
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    pub state: ExecutionStatus,
    pub transitions: Vec<StateTransition>,
}

impl ExecutionStateMachine {
    /// Creates a state machine for a freshly started (running) execution.
    pub fn new() -> Self {
        Self::from_state(ExecutionStatus::Running)
    }

    pub fn from_state(state: ExecutionStatus) -> Self {
        let table = [
            // Running ->
            (ExecutionStatus::Running, ExecutionStatus::Waiting, "suspend"),
            (ExecutionStatus::Running, ExecutionStatus::Completed, "journey_complete"),
            (ExecutionStatus::Running, ExecutionStatus::Failed, "step_failed"),
            (ExecutionStatus::Running, ExecutionStatus::Cancelled, "cancel_while_running"),
            // Waiting ->
            (ExecutionStatus::Waiting, ExecutionStatus::Running, "lease_acquired"),
            (ExecutionStatus::Waiting, ExecutionStatus::Cancelled, "cancel_while_waiting"),
        ];
        let transitions = table
            .into_iter()
            .map(|(from, to, trigger)| StateTransition {
                from,
                to,
                trigger: trigger.to_string(),
            })
            .collect();

        Self { state, transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &ExecutionStatus, to: &ExecutionStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Trigger name of an allowed transition.
    pub fn trigger(&self, from: &ExecutionStatus, to: &ExecutionStatus) -> Option<&str> {
        self.transitions
            .iter()
            .find(|t| t.from == *from && t.to == *to)
            .map(|t| t.trigger.as_str())
    }

    /// Attempts to move the state machine to `to`. Returns an error if the
    /// transition is not permitted.
    pub fn transition(&mut self, to: ExecutionStatus) -> Result<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(anyhow!(
                "Invalid execution transition from {:?} to {:?}",
                self.state,
                to
            ))
        }
    }
}

impl Default for ExecutionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

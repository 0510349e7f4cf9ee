//! Entry points that create and cancel executions: manual runs, automation
//! rules fed by contact events, and external cancellation (unsubscribe,
//! journey shutdown).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use salesflow_core::event_bus::{make_event, EventSubject};
use salesflow_core::types::EventType;
use salesflow_core::{ContactId, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::definitions::JourneyDefinitionStore;
use crate::engine::JourneyEngine;
use crate::error::{EntityKind, JourneyError, JourneyResult, ValidationIssue};
use crate::scheduler::ReleasePolicy;
use crate::store::{CreateOutcome, ExecutionStore};
use crate::types::{
    AttemptOutcome, ExecutionStatus, ExecutionStepAttempt, JourneyExecution, JourneyStatus,
    MAX_WAIT_SECS,
};

/// Result of a start request. `created == false` means the contact already
/// had an active execution and re-entry is off; `execution` is that one.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub execution: JourneyExecution,
    pub created: bool,
}

/// Starts a journey for a contact whenever a named event arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub journey_id: Uuid,
    pub event_name: String,
    /// Entry delay; the execution waits this long before its first step.
    pub delay_secs: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAutomationRule {
    pub journey_id: Uuid,
    pub event_name: String,
    #[serde(default)]
    pub delay_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// An external contact event, e.g. "email_opened".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub event_name: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

pub struct TriggerGateway {
    engine: Arc<JourneyEngine>,
    definitions: Arc<JourneyDefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    release: ReleasePolicy,
    rules: DashMap<Uuid, AutomationRule>,
}

impl TriggerGateway {
    pub fn new(
        engine: Arc<JourneyEngine>,
        definitions: Arc<JourneyDefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        release: ReleasePolicy,
    ) -> Self {
        Self {
            engine,
            definitions,
            executions,
            clock,
            release,
            rules: DashMap::new(),
        }
    }

    /// Creates an execution and runs it synchronously up to its first
    /// suspension or terminal state.
    pub async fn start_journey(
        &self,
        tenant: &TenantId,
        journey_id: Uuid,
        contact: ContactId,
    ) -> JourneyResult<StartOutcome> {
        let permit = self.definitions.admit(tenant, journey_id).await?;
        let execution = JourneyExecution::new(*tenant, journey_id, contact, self.clock.now());
        let outcome = self
            .executions
            .create_unless_active(execution, permit.journey.settings.allow_reentry)
            .await?;
        drop(permit);

        let created = match outcome {
            CreateOutcome::Existing(existing) => {
                debug!(
                    execution_id = %existing.id,
                    journey_id = %journey_id,
                    contact_id = %existing.contact_id,
                    "Contact already active in journey"
                );
                return Ok(StartOutcome {
                    execution: existing,
                    created: false,
                });
            }
            CreateOutcome::Created(created) => created,
        };

        info!(
            execution_id = %created.id,
            journey_id = %journey_id,
            contact_id = %created.contact_id,
            "Execution started"
        );
        metrics::counter!("journey.executions.started", "source" => "manual").increment(1);
        self.emit(EventType::ExecutionStarted, &created, None);

        let id = created.id;
        let execution = match self.engine.advance(created).await {
            Ok(report) => report.execution,
            Err(e) => {
                let now = self.clock.now();
                let wake_at = self.release.wake_at(Some(now), now);
                error!(execution_id = %id, error = %e, %wake_at, "First tick failed, handing over to dispatcher");
                self.executions.release(id, wake_at, now).await?;
                self.executions
                    .get(id)
                    .await?
                    .ok_or_else(|| JourneyError::execution_not_found(id))?
            }
        };

        Ok(StartOutcome {
            execution,
            created: true,
        })
    }

    // ─── Automation rules ───────────────────────────────────────────────

    pub fn register_rule(
        &self,
        tenant: &TenantId,
        new: NewAutomationRule,
    ) -> JourneyResult<AutomationRule> {
        self.definitions.get(tenant, new.journey_id)?;

        let event_name = new.event_name.trim();
        let mut issues = Vec::new();
        if event_name.is_empty() {
            issues.push(ValidationIssue::journey("event_name must not be empty").with_field("event_name"));
        }
        if new.delay_secs > MAX_WAIT_SECS {
            issues.push(
                ValidationIssue::journey(format!("delay_secs must not exceed {MAX_WAIT_SECS}"))
                    .with_field("delay_secs"),
            );
        }
        if !issues.is_empty() {
            return Err(JourneyError::Validation(issues));
        }

        let rule = AutomationRule {
            id: Uuid::new_v4(),
            tenant_id: *tenant,
            journey_id: new.journey_id,
            event_name: event_name.to_string(),
            delay_secs: new.delay_secs,
            enabled: new.enabled,
            created_at: self.clock.now(),
        };
        info!(rule_id = %rule.id, journey_id = %rule.journey_id, event = %rule.event_name, "Automation rule registered");
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    pub fn remove_rule(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<AutomationRule> {
        let owner = self
            .rules
            .get(&id)
            .map(|r| r.tenant_id)
            .ok_or_else(|| JourneyError::NotFound {
                kind: EntityKind::Rule,
                id: id.to_string(),
            })?;
        if owner != *tenant {
            return Err(JourneyError::TenantMismatch {
                kind: EntityKind::Rule,
                id: id.to_string(),
            });
        }
        self.rules
            .remove(&id)
            .map(|(_, rule)| rule)
            .ok_or_else(|| JourneyError::NotFound {
                kind: EntityKind::Rule,
                id: id.to_string(),
            })
    }

    pub fn list_rules(&self, tenant: &TenantId) -> Vec<AutomationRule> {
        let mut rules: Vec<_> = self
            .rules
            .iter()
            .filter(|r| r.tenant_id == *tenant)
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by_key(|r| r.created_at);
        rules
    }

    /// Starts every journey whose enabled rule matches the event. Rules whose
    /// journey is not active are skipped; a rule that fails to start is
    /// logged and does not stop the others.
    pub async fn handle_event(&self, event: TriggerEvent) -> JourneyResult<Vec<StartOutcome>> {
        let mut matching: Vec<_> = self
            .rules
            .iter()
            .filter(|r| {
                r.enabled && r.tenant_id == event.tenant_id && r.event_name == event.event_name
            })
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by_key(|r| r.created_at);
        debug!(event = %event.event_name, contact_id = %event.contact_id, rules = matching.len(), "Trigger event received");

        let mut outcomes = Vec::with_capacity(matching.len());
        for rule in matching {
            let active = self
                .definitions
                .find(rule.journey_id)
                .map(|j| j.deleted_at.is_none() && j.status == JourneyStatus::Active)
                .unwrap_or(false);
            if !active {
                warn!(rule_id = %rule.id, journey_id = %rule.journey_id, "Rule targets an inactive journey, skipping");
                continue;
            }

            let started = if rule.delay_secs == 0 {
                self.start_journey(&event.tenant_id, rule.journey_id, event.contact_id.clone())
                    .await
            } else {
                self.start_deferred(&rule, event.contact_id.clone()).await
            };
            match started {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(
                        rule_id = %rule.id,
                        journey_id = %rule.journey_id,
                        contact_id = %event.contact_id,
                        error = %e,
                        "Automation rule failed to start journey"
                    );
                    metrics::counter!("journey.automation.rule_errors").increment(1);
                }
            }
        }
        Ok(outcomes)
    }

    /// Inserts a `waiting` execution with no current step that the dispatcher
    /// picks up once the rule's delay has elapsed.
    async fn start_deferred(
        &self,
        rule: &AutomationRule,
        contact: ContactId,
    ) -> JourneyResult<StartOutcome> {
        let permit = self.definitions.admit(&rule.tenant_id, rule.journey_id).await?;
        let now = self.clock.now();
        let wake_at = now + chrono::Duration::seconds(rule.delay_secs as i64);

        let mut execution = JourneyExecution::new(rule.tenant_id, rule.journey_id, contact, now);
        execution.status = ExecutionStatus::Waiting;
        execution.next_step_at = Some(wake_at);

        let outcome = self
            .executions
            .create_unless_active(execution, permit.journey.settings.allow_reentry)
            .await?;
        drop(permit);

        match outcome {
            CreateOutcome::Existing(existing) => Ok(StartOutcome {
                execution: existing,
                created: false,
            }),
            CreateOutcome::Created(created) => {
                self.executions
                    .append_attempt(ExecutionStepAttempt::new(
                        &created,
                        None,
                        1,
                        AttemptOutcome::Deferred { wake_at },
                        None,
                        now,
                    ))
                    .await?;
                info!(
                    execution_id = %created.id,
                    rule_id = %rule.id,
                    %wake_at,
                    "Execution scheduled by automation rule"
                );
                metrics::counter!("journey.executions.started", "source" => "automation")
                    .increment(1);
                self.emit(EventType::ExecutionStarted, &created, None);
                Ok(StartOutcome {
                    execution: created,
                    created: true,
                })
            }
        }
    }

    // ─── Cancellation ───────────────────────────────────────────────────

    /// Cancels an active execution. Cancelling a terminal execution is a
    /// no-op that returns it unchanged.
    pub async fn cancel_execution(
        &self,
        tenant: &TenantId,
        id: Uuid,
        reason: &str,
    ) -> JourneyResult<JourneyExecution> {
        let execution = self.engine.get_execution(tenant, id).await?;
        if execution.status.is_terminal() {
            return Ok(execution);
        }
        match self.executions.cancel(id, self.clock.now()).await? {
            Some(cancelled) => {
                self.executions
                    .append_attempt(ExecutionStepAttempt::new(
                        &cancelled,
                        cancelled.current_step,
                        1,
                        AttemptOutcome::Cancelled,
                        Some(reason.to_string()),
                        self.clock.now(),
                    ))
                    .await?;
                info!(execution_id = %id, reason, "Execution cancelled");
                metrics::counter!("journey.executions.cancelled").increment(1);
                self.emit(
                    EventType::ExecutionCancelled,
                    &cancelled,
                    Some(reason.to_string()),
                );
                Ok(cancelled)
            }
            None => self
                .executions
                .get(id)
                .await?
                .ok_or_else(|| JourneyError::execution_not_found(id)),
        }
    }

    /// Cancels every active execution of a contact, across journeys.
    pub async fn cancel_for_contact(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
    ) -> JourneyResult<Vec<JourneyExecution>> {
        let active = self
            .executions
            .list_active_for_contact(tenant, contact)
            .await?;
        let mut cancelled = Vec::with_capacity(active.len());
        for execution in active {
            let result = self
                .cancel_execution(tenant, execution.id, "contact unsubscribed")
                .await?;
            if result.status == ExecutionStatus::Cancelled {
                cancelled.push(result);
            }
        }
        Ok(cancelled)
    }

    /// Cancels every active execution of a journey.
    pub async fn cancel_for_journey(
        &self,
        tenant: &TenantId,
        journey_id: Uuid,
    ) -> JourneyResult<Vec<JourneyExecution>> {
        self.definitions.get(tenant, journey_id)?;
        let active: Vec<_> = self
            .executions
            .list_for_journey(journey_id)
            .await?
            .into_iter()
            .filter(|e| e.status.is_active())
            .collect();
        let mut cancelled = Vec::with_capacity(active.len());
        for execution in active {
            let result = self
                .cancel_execution(tenant, execution.id, "journey executions cancelled")
                .await?;
            if result.status == ExecutionStatus::Cancelled {
                cancelled.push(result);
            }
        }
        Ok(cancelled)
    }

    fn emit(&self, event_type: EventType, execution: &JourneyExecution, detail: Option<String>) {
        let subject = EventSubject {
            tenant_id: execution.tenant_id,
            journey_id: execution.journey_id,
            execution_id: execution.id,
            contact_id: execution.contact_id.clone(),
        };
        self.engine.event_sink().emit(make_event(
            event_type,
            &subject,
            execution.current_step,
            detail,
            self.clock.now(),
        ));
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use salesflow_core::{ContactId, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluator::ConditionGroup;

/// A tenant-scoped journey definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: String,
    pub status: JourneyStatus,
    pub settings: JourneySettings,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of a journey definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// Per-journey knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JourneySettings {
    /// Allows a contact to hold more than one active execution of this journey.
    #[serde(default)]
    pub allow_reentry: bool,
    /// Overrides the engine-wide retry budget for every step in this journey.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The closed set of step types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SendMessage,
    Wait,
    Condition,
    UpdateField,
    AddTag,
    RemoveTag,
    WebhookCall,
    End,
}

impl StepType {
    pub const ALL: [StepType; 8] = [
        StepType::SendMessage,
        StepType::Wait,
        StepType::Condition,
        StepType::UpdateField,
        StepType::AddTag,
        StepType::RemoveTag,
        StepType::WebhookCall,
        StepType::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::SendMessage => "send_message",
            StepType::Wait => "wait",
            StepType::Condition => "condition",
            StepType::UpdateField => "update_field",
            StepType::AddTag => "add_tag",
            StepType::RemoveTag => "remove_tag",
            StepType::WebhookCall => "webhook_call",
            StepType::End => "end",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown step type '{s}'"))
    }
}

/// Strongly typed configuration, one variant per step type. On the wire it
/// travels as `step_type` plus an untyped `config` object (see `StepRecord`).
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    SendMessage(SendMessageConfig),
    Wait(WaitConfig),
    Condition,
    UpdateField(UpdateFieldConfig),
    AddTag(TagConfig),
    RemoveTag(TagConfig),
    WebhookCall(WebhookConfig),
    End(EndConfig),
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::SendMessage(_) => StepType::SendMessage,
            StepConfig::Wait(_) => StepType::Wait,
            StepConfig::Condition => StepType::Condition,
            StepConfig::UpdateField(_) => StepType::UpdateField,
            StepConfig::AddTag(_) => StepType::AddTag,
            StepConfig::RemoveTag(_) => StepType::RemoveTag,
            StepConfig::WebhookCall(_) => StepType::WebhookCall,
            StepConfig::End(_) => StepType::End,
        }
    }

    /// Decodes the raw `config` object of a step into the variant for
    /// `step_type`. Semantic checks live in `schema::validate_config`.
    pub fn parse(step_type: StepType, config: &serde_json::Value) -> Result<Self, String> {
        fn decode<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T, String> {
            let value = if value.is_null() {
                serde_json::json!({})
            } else {
                value.clone()
            };
            serde_json::from_value(value).map_err(|e| e.to_string())
        }

        Ok(match step_type {
            StepType::SendMessage => StepConfig::SendMessage(decode(config)?),
            StepType::Wait => StepConfig::Wait(decode(config)?),
            StepType::Condition => {
                let _: EmptyConfig = decode(config)?;
                StepConfig::Condition
            }
            StepType::UpdateField => StepConfig::UpdateField(decode(config)?),
            StepType::AddTag => StepConfig::AddTag(decode(config)?),
            StepType::RemoveTag => StepConfig::RemoveTag(decode(config)?),
            StepType::WebhookCall => StepConfig::WebhookCall(decode(config)?),
            StepType::End => StepConfig::End(decode(config)?),
        })
    }

    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            StepConfig::SendMessage(c) => serde_json::to_value(c),
            StepConfig::Wait(c) => serde_json::to_value(c),
            StepConfig::Condition => Ok(serde_json::json!({})),
            StepConfig::UpdateField(c) => serde_json::to_value(c),
            StepConfig::AddTag(c) | StepConfig::RemoveTag(c) => serde_json::to_value(c),
            StepConfig::WebhookCall(c) => serde_json::to_value(c),
            StepConfig::End(c) => serde_json::to_value(c),
        };
        value.unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

fn default_channel() -> String {
    "email".to_string()
}

/// Longest delay a wait step may request (ten years).
pub const MAX_WAIT_SECS: u64 = 10 * 365 * 24 * 3600;

/// Either a fixed delay or an absolute wake-up time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl WaitConfig {
    pub fn delay(secs: u64) -> Self {
        Self {
            delay_secs: Some(secs),
            until: None,
        }
    }

    /// Wake time for a wait entered at `now`.
    pub fn wake_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.until, self.delay_secs) {
            (Some(until), _) => until,
            (None, Some(secs)) => now + chrono::Duration::seconds(secs.min(MAX_WAIT_SECS) as i64),
            (None, None) => now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateFieldConfig {
    pub field: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagConfig {
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One node in a journey's ordered step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StepRecord", try_from = "StepRecord")]
pub struct JourneyStep {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub order_no: u32,
    pub config: StepConfig,
    pub conditions: Option<ConditionGroup>,
    pub on_true: Option<Uuid>,
    pub on_false: Option<Uuid>,
    /// Explicit successor for non-branching steps; defaults to `order_no + 1`.
    pub next_step: Option<Uuid>,
}

impl JourneyStep {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }
}

/// Wire shape of a step: `step_type` plus an untyped `config` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub order_no: u32,
    pub step_type: StepType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_true: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_false: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<Uuid>,
}

impl From<JourneyStep> for StepRecord {
    fn from(step: JourneyStep) -> Self {
        Self {
            id: step.id,
            journey_id: step.journey_id,
            order_no: step.order_no,
            step_type: step.config.step_type(),
            config: step.config.to_value(),
            conditions: step.conditions,
            on_true: step.on_true,
            on_false: step.on_false,
            next_step: step.next_step,
        }
    }
}

impl TryFrom<StepRecord> for JourneyStep {
    type Error = String;

    fn try_from(record: StepRecord) -> Result<Self, Self::Error> {
        let config = StepConfig::parse(record.step_type, &record.config)?;
        Ok(Self {
            id: record.id,
            journey_id: record.journey_id,
            order_no: record.order_no,
            config,
            conditions: record.conditions,
            on_true: record.on_true,
            on_false: record.on_false,
            next_step: record.next_step,
        })
    }
}

// ─── Requests ───────────────────────────────────────────────────────────

/// Step as submitted by a client. `id` may be supplied so branch targets
/// can reference steps of the same request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub order_no: u32,
    pub step_type: StepType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub conditions: Option<ConditionGroup>,
    #[serde(default)]
    pub on_true: Option<Uuid>,
    #[serde(default)]
    pub on_false: Option<Uuid>,
    #[serde(default)]
    pub next_step: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJourney {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: JourneySettings,
    #[serde(default = "default_creator")]
    pub created_by: String,
    pub steps: Vec<NewStep>,
}

fn default_creator() -> String {
    "system".to_string()
}

/// Mutable journey fields. Step graphs are frozen once published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JourneyPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: Option<JourneySettings>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

// ─── Executions ─────────────────────────────────────────────────────────

/// The live state of one contact walking one journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyExecution {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub journey_id: Uuid,
    pub contact_id: ContactId,
    pub status: ExecutionStatus,
    pub current_step: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub next_step_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Mirror of the attempt log for the current step; the log is authoritative.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JourneyExecution {
    pub fn new(
        tenant_id: TenantId,
        journey_id: Uuid,
        contact_id: ContactId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            journey_id,
            contact_id,
            status: ExecutionStatus::Running,
            current_step: None,
            started_at: now,
            next_step_at: None,
            completed_at: None,
            attempt_count: 0,
            last_error: None,
            updated_at: now,
        }
    }
}

/// Runtime status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Waiting)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Append-only record of one transition of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStepAttempt {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Option<Uuid>,
    pub attempt_no: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub status_after: ExecutionStatus,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionStepAttempt {
    /// Record for `execution` as it stands now; `status_after` is taken from it.
    pub fn new(
        execution: &JourneyExecution,
        step_id: Option<Uuid>,
        attempt_no: u32,
        outcome: AttemptOutcome,
        error: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            step_id,
            attempt_no,
            outcome,
            error,
            status_after: execution.status,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptOutcome {
    Succeeded,
    Branched { result: bool, target: Option<Uuid> },
    Scheduled { wake_at: DateTime<Utc> },
    RetryableFailure,
    FatalFailure,
    Cancelled,
    Deferred { wake_at: DateTime<Utc> },
}

// ─── Read models ────────────────────────────────────────────────────────

/// Execution counts for a journey, by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyStats {
    pub journey_id: Uuid,
    pub total: u64,
    pub running: u64,
    pub waiting: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JourneyStats {
    pub fn record(&mut self, status: ExecutionStatus) {
        self.total += 1;
        match status {
            ExecutionStatus::Running => self.running += 1,
            ExecutionStatus::Waiting => self.waiting += 1,
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn active(&self) -> u64 {
        self.running + self.waiting
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyDetail {
    #[serde(flatten)]
    pub journey: Journey,
    pub steps: Vec<JourneyStep>,
    pub stats: JourneyStats,
}

/// Execution plus derived progress fields for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub execution: JourneyExecution,
    pub progress_percentage: f64,
    pub duration_minutes: i64,
}

impl ExecutionView {
    pub fn derive(execution: JourneyExecution, steps: &[JourneyStep], now: DateTime<Utc>) -> Self {
        let total = steps.len();
        let progress_percentage = if execution.status == ExecutionStatus::Completed {
            100.0
        } else if total == 0 {
            0.0
        } else {
            let done = execution
                .current_step
                .and_then(|id| steps.iter().find(|s| s.id == id))
                .map(|s| s.order_no as usize)
                .unwrap_or(0);
            let pct = done as f64 / total as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };
        let end = execution.completed_at.unwrap_or(now);
        let duration_minutes = (end - execution.started_at).num_minutes().max(0);
        Self {
            execution,
            progress_percentage,
            duration_minutes,
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub const DEFAULT_PER_PAGE: usize = 20;
    pub const MAX_PER_PAGE: usize = 100;

    /// Slices `all` into the requested 1-based page.
    pub fn paginate(all: Vec<T>, page: Option<usize>, per_page: Option<usize>) -> Self {
        let page = page.unwrap_or(1).max(1);
        let per_page = per_page
            .unwrap_or(Self::DEFAULT_PER_PAGE)
            .clamp(1, Self::MAX_PER_PAGE);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        Self {
            items,
            page,
            per_page,
            total,
        }
    }
}

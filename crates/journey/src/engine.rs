use std::sync::Arc;

use chrono::{DateTime, Utc};
use salesflow_core::config::JourneyConfig;
use salesflow_core::event_bus::{make_event, EventSink, EventSubject};
use salesflow_core::types::EventType;
use salesflow_core::TenantId;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::contacts::ContactStore;
use crate::definitions::JourneyDefinitionStore;
use crate::error::{EntityKind, JourneyError, JourneyResult};
use crate::evaluator::ConditionEvaluator;
use crate::executor::{ActionExecutor, StepContext, StepOutcome};
use crate::graph::StepGraph;
use crate::retry::RetryPolicy;
use crate::state_machine::ExecutionStateMachine;
use crate::store::{CommitOutcome, ExecutionStore};
use crate::types::{
    AttemptOutcome, ExecutionStatus, ExecutionStepAttempt, ExecutionView, JourneyExecution,
    JourneyStatus, JourneyStep, Page, StepConfig, StepType,
};

/// Engine-wide knobs derived from `JourneyConfig`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_steps_per_tick: u32,
    pub paused_recheck: chrono::Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&JourneyConfig::default())
    }
}

impl From<&JourneyConfig> for EngineSettings {
    fn from(cfg: &JourneyConfig) -> Self {
        Self {
            max_steps_per_tick: cfg.max_steps_per_tick.max(1),
            paused_recheck: chrono::Duration::seconds(cfg.paused_recheck_secs.max(1) as i64),
            retry: RetryPolicy::from(&cfg.retry),
        }
    }
}

/// Result of one `advance` call.
#[derive(Debug, Clone)]
pub struct AdvanceReport {
    /// State as committed, or the stored state when the work was abandoned.
    pub execution: JourneyExecution,
    pub steps_run: u32,
    /// `false` when a concurrent cancellation superseded this tick.
    pub committed: bool,
}

/// Drives executions through their journey's step graph.
#[derive(Clone)]
pub struct JourneyEngine {
    definitions: Arc<JourneyDefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    contacts: Arc<dyn ContactStore>,
    actions: Arc<ActionExecutor>,
    evaluator: ConditionEvaluator,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    settings: EngineSettings,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("actions", &self.actions)
            .field("settings", &self.settings)
            .finish()
    }
}

/// What the loop decided for the step it just ran.
enum Flow<'a> {
    Continue(Option<&'a JourneyStep>),
    Stop,
}

impl JourneyEngine {
    pub fn new(
        definitions: Arc<JourneyDefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        contacts: Arc<dyn ContactStore>,
        actions: Arc<ActionExecutor>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            definitions,
            executions,
            contacts,
            actions,
            evaluator: ConditionEvaluator::new(),
            clock,
            event_sink: salesflow_core::event_bus::noop_sink(),
            settings,
        }
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        self.event_sink.clone()
    }

    /// Runs a leased (`running`) execution until it suspends, terminates, or
    /// hits the per-tick step limit, then commits the new state.
    ///
    /// Step failures never surface as errors here; they become status
    /// transitions. An `Err` means the tick itself could not be completed
    /// (store trouble) and the caller must release the lease.
    pub async fn advance(&self, mut execution: JourneyExecution) -> JourneyResult<AdvanceReport> {
        if execution.status != ExecutionStatus::Running {
            return Err(JourneyError::Conflict(format!(
                "execution {} is {:?}, not running",
                execution.id, execution.status
            )));
        }

        let mut log = self.executions.attempts(execution.id).await?;

        let journey = match self.definitions.find(execution.journey_id) {
            Some(journey) if journey.deleted_at.is_none() => journey,
            _ => {
                let reason = format!("journey {} no longer exists", execution.journey_id);
                let current = execution.current_step;
                self.fail(&mut execution, &mut log, current, reason).await?;
                return self.commit(execution, 0).await;
            }
        };

        match journey.status {
            JourneyStatus::Active => {}
            JourneyStatus::Paused | JourneyStatus::Draft => {
                let wake_at = self.clock.now() + self.settings.paused_recheck;
                debug!(execution_id = %execution.id, journey_id = %journey.id, %wake_at, "Journey paused, deferring");
                self.suspend(&mut execution, wake_at);
                self.record(
                    &mut log,
                    &execution,
                    execution.current_step,
                    AttemptOutcome::Deferred { wake_at },
                    Some("journey is paused".to_string()),
                )
                .await?;
                return self.commit(execution, 0).await;
            }
            JourneyStatus::Archived => {
                self.terminate(&mut execution, ExecutionStatus::Cancelled);
                self.record(
                    &mut log,
                    &execution,
                    execution.current_step,
                    AttemptOutcome::Cancelled,
                    Some("journey archived".to_string()),
                )
                .await?;
                return self.commit(execution, 0).await;
            }
        }

        let steps = self.definitions.steps(journey.id);
        let graph = StepGraph::new(&steps);
        let policy = self
            .settings
            .retry
            .with_max_attempts(journey.settings.max_attempts);

        // A persisted wait step as the current step means the wait is over.
        let (mut next, mut woken) = match execution.current_step {
            None => (graph.first(), false),
            Some(id) => match graph.get(id) {
                Some(step) => (Some(step), step.step_type() == StepType::Wait),
                None => {
                    let reason = format!("step {id} no longer exists in journey {}", journey.id);
                    self.fail(&mut execution, &mut log, Some(id), reason).await?;
                    return self.commit(execution, 0).await;
                }
            },
        };

        let mut steps_run = 0u32;
        loop {
            let Some(step) = next else {
                self.terminate(&mut execution, ExecutionStatus::Completed);
                break;
            };
            execution.current_step = Some(step.id);

            if woken {
                woken = false;
                self.succeed(&mut execution, &mut log, step, AttemptOutcome::Succeeded)
                    .await?;
                next = graph.successor(step);
                continue;
            }

            if steps_run > 0 && self.is_cancelled(execution.id).await? {
                return self.abandon(execution.id, steps_run).await;
            }

            let now = self.clock.now();
            if steps_run >= self.settings.max_steps_per_tick {
                let pending_wait = matches!(&step.config, StepConfig::Wait(cfg) if cfg.wake_at(now) > now);
                if !pending_wait {
                    debug!(execution_id = %execution.id, steps_run, "Step limit reached, yielding");
                    self.suspend(&mut execution, now);
                    self.record(
                        &mut log,
                        &execution,
                        Some(step.id),
                        AttemptOutcome::Deferred { wake_at: now },
                        None,
                    )
                    .await?;
                    break;
                }
            }
            steps_run += 1;

            let ctx = StepContext {
                tenant_id: execution.tenant_id,
                execution_id: execution.id,
                step_id: step.id,
                contact_id: execution.contact_id.clone(),
            };
            let outcome = self.actions.execute(&step.config, &ctx).await;
            metrics::counter!(
                "journey.steps.executed",
                "step_type" => step.step_type().as_str(),
                "outcome" => outcome.label()
            )
            .increment(1);

            let flow = match outcome {
                StepOutcome::Success => {
                    self.navigate(&mut execution, &mut log, &graph, step, &ctx, &policy)
                        .await?
                }
                failure => {
                    self.handle_failure(&mut execution, &mut log, step, failure, &policy)
                        .await?;
                    Flow::Stop
                }
            };
            match flow {
                Flow::Continue(target) => next = target,
                Flow::Stop => break,
            }
        }

        self.commit(execution, steps_run).await
    }

    /// Decides where a successfully executed step leads.
    async fn navigate<'a>(
        &self,
        execution: &mut JourneyExecution,
        log: &mut Vec<ExecutionStepAttempt>,
        graph: &StepGraph<'a>,
        step: &'a JourneyStep,
        ctx: &StepContext,
        policy: &RetryPolicy,
    ) -> JourneyResult<Flow<'a>> {
        let now = self.clock.now();
        match &step.config {
            StepConfig::Wait(cfg) => {
                let wake_at = cfg.wake_at(now);
                if wake_at <= now {
                    self.succeed(execution, log, step, AttemptOutcome::Succeeded)
                        .await?;
                    return Ok(Flow::Continue(graph.successor(step)));
                }
                self.suspend(execution, wake_at);
                self.record(log, execution, Some(step.id), AttemptOutcome::Scheduled { wake_at }, None)
                    .await?;
                Ok(Flow::Stop)
            }
            StepConfig::End(cfg) => {
                self.terminate(execution, ExecutionStatus::Completed);
                self.succeed(execution, log, step, AttemptOutcome::Succeeded)
                    .await?;
                if let Some(reason) = &cfg.reason {
                    debug!(execution_id = %execution.id, reason = %reason, "Reached end step");
                }
                Ok(Flow::Stop)
            }
            StepConfig::Condition => {
                let Some(group) = &step.conditions else {
                    let reason = format!("condition step {} has no conditions", step.id);
                    self.fail(execution, log, Some(step.id), reason).await?;
                    return Ok(Flow::Stop);
                };
                let snapshot = match self.contacts.snapshot(&ctx.tenant_id, &ctx.contact_id).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        self.handle_failure(execution, log, step, err.into(), policy)
                            .await?;
                        return Ok(Flow::Stop);
                    }
                };

                let evaluation = self.evaluator.evaluate(group, &snapshot);
                if !evaluation.unresolved_paths.is_empty() {
                    warn!(
                        execution_id = %execution.id,
                        step_id = %step.id,
                        paths = ?evaluation.unresolved_paths,
                        "Condition referenced unknown attribute paths"
                    );
                }
                let target = if evaluation.result {
                    step.on_true
                } else {
                    step.on_false
                };
                self.succeed(
                    execution,
                    log,
                    step,
                    AttemptOutcome::Branched {
                        result: evaluation.result,
                        target,
                    },
                )
                .await?;

                match target {
                    None => {
                        self.terminate(execution, ExecutionStatus::Completed);
                        Ok(Flow::Stop)
                    }
                    Some(id) => match graph.get(id) {
                        Some(target) => Ok(Flow::Continue(Some(target))),
                        None => {
                            let reason = format!("branch target {id} does not exist");
                            self.fail(execution, log, Some(step.id), reason).await?;
                            Ok(Flow::Stop)
                        }
                    },
                }
            }
            _ => {
                self.succeed(execution, log, step, AttemptOutcome::Succeeded)
                    .await?;
                Ok(Flow::Continue(graph.successor(step)))
            }
        }
    }

    async fn handle_failure(
        &self,
        execution: &mut JourneyExecution,
        log: &mut Vec<ExecutionStepAttempt>,
        step: &JourneyStep,
        outcome: StepOutcome,
        policy: &RetryPolicy,
    ) -> JourneyResult<()> {
        match outcome {
            StepOutcome::Success => Ok(()),
            StepOutcome::Fatal(reason) => {
                warn!(execution_id = %execution.id, step_id = %step.id, error = %reason, "Step failed");
                self.fail(execution, log, Some(step.id), reason).await
            }
            StepOutcome::Retryable(reason) => {
                let failures = trailing_retryable_failures(log, step.id) + 1;
                execution.attempt_count = failures;
                if policy.should_retry(failures) {
                    let backoff = policy.backoff_for_attempt(failures);
                    let wake_at =
                        self.clock.now() + chrono::Duration::milliseconds(backoff.as_millis() as i64);
                    warn!(
                        execution_id = %execution.id,
                        step_id = %step.id,
                        attempt = failures,
                        %wake_at,
                        error = %reason,
                        "Step failed, retry scheduled"
                    );
                    self.suspend(execution, wake_at);
                    execution.last_error = Some(reason.clone());
                } else {
                    warn!(
                        execution_id = %execution.id,
                        step_id = %step.id,
                        attempts = failures,
                        error = %reason,
                        "Retry budget exhausted"
                    );
                    self.terminate(execution, ExecutionStatus::Failed);
                    execution.last_error =
                        Some(format!("{reason} (gave up after {failures} attempts)"));
                }
                self.record(
                    log,
                    execution,
                    Some(step.id),
                    AttemptOutcome::RetryableFailure,
                    Some(reason),
                )
                .await
            }
        }
    }

    async fn fail(
        &self,
        execution: &mut JourneyExecution,
        log: &mut Vec<ExecutionStepAttempt>,
        step_id: Option<Uuid>,
        reason: String,
    ) -> JourneyResult<()> {
        self.terminate(execution, ExecutionStatus::Failed);
        execution.last_error = Some(reason.clone());
        self.record(log, execution, step_id, AttemptOutcome::FatalFailure, Some(reason))
            .await
    }

    async fn succeed(
        &self,
        execution: &mut JourneyExecution,
        log: &mut Vec<ExecutionStepAttempt>,
        step: &JourneyStep,
        outcome: AttemptOutcome,
    ) -> JourneyResult<()> {
        execution.attempt_count = 0;
        self.record(log, execution, Some(step.id), outcome, None).await?;
        self.emit(EventType::StepCompleted, execution, Some(step.id), None);
        Ok(())
    }

    fn suspend(&self, execution: &mut JourneyExecution, wake_at: DateTime<Utc>) {
        execution.status = ExecutionStatus::Waiting;
        execution.next_step_at = Some(wake_at);
    }

    fn terminate(&self, execution: &mut JourneyExecution, status: ExecutionStatus) {
        execution.status = status;
        execution.next_step_at = None;
        execution.completed_at = Some(self.clock.now());
    }

    /// Appends one attempt record; `status_after` is the execution's status
    /// at the time of the call.
    async fn record(
        &self,
        log: &mut Vec<ExecutionStepAttempt>,
        execution: &JourneyExecution,
        step_id: Option<Uuid>,
        outcome: AttemptOutcome,
        error: Option<String>,
    ) -> JourneyResult<()> {
        let attempt_no = step_id
            .map(|id| trailing_retryable_failures(log, id) + 1)
            .unwrap_or(1);
        let attempt = ExecutionStepAttempt::new(
            execution,
            step_id,
            attempt_no,
            outcome,
            error,
            self.clock.now(),
        );
        self.executions.append_attempt(attempt.clone()).await?;
        log.push(attempt);
        Ok(())
    }

    async fn is_cancelled(&self, id: Uuid) -> JourneyResult<bool> {
        Ok(self
            .executions
            .get(id)
            .await?
            .map(|e| e.status == ExecutionStatus::Cancelled)
            .unwrap_or(false))
    }

    async fn abandon(&self, id: Uuid, steps_run: u32) -> JourneyResult<AdvanceReport> {
        info!(execution_id = %id, steps_run, "Execution cancelled mid-tick, abandoning");
        metrics::counter!("journey.executions.abandoned").increment(1);
        let execution = self
            .executions
            .get(id)
            .await?
            .ok_or_else(|| JourneyError::execution_not_found(id))?;
        Ok(AdvanceReport {
            execution,
            steps_run,
            committed: false,
        })
    }

    async fn commit(
        &self,
        mut execution: JourneyExecution,
        steps_run: u32,
    ) -> JourneyResult<AdvanceReport> {
        let mut machine = ExecutionStateMachine::new();
        machine.transition(execution.status)?;
        execution.updated_at = self.clock.now();

        match self.executions.commit(&execution).await? {
            CommitOutcome::Applied => {}
            CommitOutcome::Superseded(status) => {
                debug!(execution_id = %execution.id, ?status, "Commit superseded");
                return self.abandon(execution.id, steps_run).await;
            }
        }

        let event_type = match execution.status {
            ExecutionStatus::Waiting => EventType::ExecutionWaiting,
            ExecutionStatus::Completed => EventType::ExecutionCompleted,
            ExecutionStatus::Failed => EventType::ExecutionFailed,
            ExecutionStatus::Cancelled => EventType::ExecutionCancelled,
            ExecutionStatus::Running => EventType::StepCompleted,
        };
        self.emit(event_type, &execution, execution.current_step, execution.last_error.clone());

        match execution.status {
            ExecutionStatus::Completed => {
                info!(execution_id = %execution.id, journey_id = %execution.journey_id, "Execution completed");
                metrics::counter!("journey.executions.completed").increment(1);
            }
            ExecutionStatus::Failed => {
                warn!(
                    execution_id = %execution.id,
                    journey_id = %execution.journey_id,
                    error = execution.last_error.as_deref().unwrap_or_default(),
                    "Execution failed"
                );
                metrics::counter!("journey.executions.failed").increment(1);
            }
            ExecutionStatus::Waiting => {
                debug!(execution_id = %execution.id, next_step_at = ?execution.next_step_at, "Execution waiting");
            }
            _ => {}
        }

        Ok(AdvanceReport {
            execution,
            steps_run,
            committed: true,
        })
    }

    fn emit(
        &self,
        event_type: EventType,
        execution: &JourneyExecution,
        step_id: Option<Uuid>,
        detail: Option<String>,
    ) {
        let subject = EventSubject {
            tenant_id: execution.tenant_id,
            journey_id: execution.journey_id,
            execution_id: execution.id,
            contact_id: execution.contact_id.clone(),
        };
        self.event_sink
            .emit(make_event(event_type, &subject, step_id, detail, self.clock.now()));
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    pub async fn get_execution(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<JourneyExecution> {
        let execution = self
            .executions
            .get(id)
            .await?
            .ok_or_else(|| JourneyError::execution_not_found(id))?;
        if execution.tenant_id != *tenant {
            return Err(JourneyError::TenantMismatch {
                kind: EntityKind::Execution,
                id: id.to_string(),
            });
        }
        Ok(execution)
    }

    pub async fn execution_view(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<ExecutionView> {
        let execution = self.get_execution(tenant, id).await?;
        let steps = self.definitions.steps(execution.journey_id);
        Ok(ExecutionView::derive(execution, &steps, self.clock.now()))
    }

    /// Executions of a journey, newest first, optionally filtered by status.
    pub async fn list_executions(
        &self,
        tenant: &TenantId,
        journey_id: Uuid,
        status: Option<ExecutionStatus>,
        page: Option<usize>,
        per_page: Option<usize>,
    ) -> JourneyResult<Page<ExecutionView>> {
        self.definitions.get(tenant, journey_id)?;
        let steps = self.definitions.steps(journey_id);
        let now = self.clock.now();
        let views = self
            .executions
            .list_for_journey(journey_id)
            .await?
            .into_iter()
            .filter(|e| status.map(|s| e.status == s).unwrap_or(true))
            .map(|e| ExecutionView::derive(e, &steps, now))
            .collect();
        Ok(Page::paginate(views, page, per_page))
    }

    pub async fn attempts(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> JourneyResult<Vec<ExecutionStepAttempt>> {
        self.get_execution(tenant, id).await?;
        self.executions.attempts(id).await
    }
}

/// Consecutive retryable failures of `step_id` at the end of the log.
/// Deferral records (pauses, yields) don't break the streak.
pub fn trailing_retryable_failures(log: &[ExecutionStepAttempt], step_id: Uuid) -> u32 {
    log.iter()
        .rev()
        .filter(|a| !matches!(a.outcome, AttemptOutcome::Deferred { .. }))
        .take_while(|a| a.step_id == Some(step_id) && a.outcome == AttemptOutcome::RetryableFailure)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use salesflow_core::event_bus::capture_sink;
    use salesflow_core::ContactId;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::contacts::InMemoryContactStore;
    use crate::evaluator::ContactSnapshot;
    use crate::messaging::{RecordingMessageSender, SendError};
    use crate::store::InMemoryExecutionStore;
    use crate::types::{NewJourney, NewStep};
    use crate::webhook::RecordingWebhookClient;

    struct Harness {
        engine: JourneyEngine,
        definitions: Arc<JourneyDefinitionStore>,
        executions: Arc<InMemoryExecutionStore>,
        contacts: Arc<InMemoryContactStore>,
        sender: Arc<RecordingMessageSender>,
        clock: ManualClock,
        tenant: TenantId,
        contact: ContactId,
    }

    fn harness(settings: EngineSettings) -> Harness {
        let clock = ManualClock::default();
        let executions = Arc::new(InMemoryExecutionStore::new());
        let contacts = Arc::new(InMemoryContactStore::new());
        let sender = Arc::new(RecordingMessageSender::new());
        let definitions = Arc::new(JourneyDefinitionStore::new(
            executions.clone(),
            Arc::new(clock.clone()),
        ));
        let actions = Arc::new(ActionExecutor::new(
            contacts.clone(),
            sender.clone(),
            Arc::new(RecordingWebhookClient::new()),
            &Default::default(),
        ));
        let engine = JourneyEngine::new(
            definitions.clone(),
            executions.clone(),
            contacts.clone(),
            actions,
            Arc::new(clock.clone()),
            settings,
        );
        let tenant = TenantId::new();
        let contact = ContactId::from("c-1");
        contacts.upsert(tenant, contact.clone(), ContactSnapshot::default());
        Harness {
            engine,
            definitions,
            executions,
            contacts,
            sender,
            clock,
            tenant,
            contact,
        }
    }

    fn step(order_no: u32, step_type: StepType, config: serde_json::Value) -> NewStep {
        NewStep {
            id: Some(Uuid::new_v4()),
            order_no,
            step_type,
            config,
            conditions: None,
            on_true: None,
            on_false: None,
            next_step: None,
        }
    }

    impl Harness {
        fn publish(&self, steps: Vec<NewStep>) -> Uuid {
            let journey = self
                .definitions
                .create(
                    &self.tenant,
                    NewJourney {
                        name: "test".into(),
                        description: String::new(),
                        settings: Default::default(),
                        created_by: "tests".into(),
                        steps,
                    },
                )
                .unwrap();
            self.definitions.publish(&self.tenant, journey.id).unwrap();
            journey.id
        }

        async fn start(&self, journey_id: Uuid) -> AdvanceReport {
            let exec = JourneyExecution::new(self.tenant, journey_id, self.contact.clone(), self.clock.now());
            self.executions
                .create_unless_active(exec.clone(), false)
                .await
                .unwrap();
            self.engine.advance(exec).await.unwrap()
        }

        async fn tick(&self, id: Uuid) -> AdvanceReport {
            let leased = self
                .executions
                .try_acquire(id, self.clock.now())
                .await
                .unwrap()
                .expect("execution should be due");
            self.engine.advance(leased).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_runs_until_wait_then_completes() {
        let h = harness(EngineSettings::default());
        let journey = h.publish(vec![
            step(0, StepType::SendMessage, json!({"body": "hi"})),
            step(1, StepType::Wait, json!({"delay_secs": 3600})),
            step(2, StepType::AddTag, json!({"tag": "nurtured"})),
            step(3, StepType::End, json!({})),
        ]);

        let report = h.start(journey).await;
        assert!(report.committed);
        assert_eq!(report.steps_run, 2);
        assert_eq!(report.execution.status, ExecutionStatus::Waiting);
        assert_eq!(
            report.execution.next_step_at,
            Some(h.clock.now() + Duration::hours(1))
        );
        assert_eq!(h.sender.sent_count(), 1);

        h.clock.advance(Duration::hours(1));
        let report = h.tick(report.execution.id).await;
        assert_eq!(report.execution.status, ExecutionStatus::Completed);
        assert!(report.execution.next_step_at.is_none());
        assert!(report.execution.completed_at.is_some());
        assert!(h.contacts.get(h.tenant, &h.contact).unwrap().has_tag("nurtured"));

        let attempts = h.executions.attempts(report.execution.id).await.unwrap();
        let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome.clone()).collect();
        assert!(matches!(outcomes[1], AttemptOutcome::Scheduled { .. }));
        assert_eq!(
            &outcomes[2..],
            &[
                AttemptOutcome::Succeeded,
                AttemptOutcome::Succeeded,
                AttemptOutcome::Succeeded
            ]
        );
        assert_eq!(attempts.last().unwrap().status_after, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_execution() {
        let h = harness(EngineSettings::default());
        let journey = h.publish(vec![step(0, StepType::SendMessage, json!({"body": "hi"}))]);
        for _ in 0..3 {
            h.sender.fail_next(SendError::Provider("503".into()));
        }

        let first = h.start(journey).await.execution;
        assert_eq!(first.status, ExecutionStatus::Waiting);
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.next_step_at, Some(h.clock.now() + Duration::minutes(1)));

        h.clock.advance(Duration::minutes(1));
        let second = h.tick(first.id).await.execution;
        assert_eq!(second.attempt_count, 2);
        assert_eq!(second.next_step_at, Some(h.clock.now() + Duration::minutes(2)));

        h.clock.advance(Duration::minutes(2));
        let third = h.tick(first.id).await.execution;
        assert_eq!(third.status, ExecutionStatus::Failed);
        assert_eq!(third.attempt_count, 3);
        assert!(third.last_error.unwrap().contains("gave up after 3 attempts"));

        let attempts = h.executions.attempts(first.id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.attempt_no).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::RetryableFailure));
    }

    #[tokio::test]
    async fn test_missing_contact_fails_immediately() {
        let h = harness(EngineSettings::default());
        let journey = h.publish(vec![step(0, StepType::AddTag, json!({"tag": "x"}))]);
        h.contacts.remove(h.tenant, &h.contact);

        let exec = h.start(journey).await.execution;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        let attempts = h.executions.attempts(exec.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::FatalFailure);
    }

    #[tokio::test]
    async fn test_paused_journey_defers() {
        let h = harness(EngineSettings::default());
        let journey = h.publish(vec![
            step(0, StepType::Wait, json!({"delay_secs": 60})),
            step(1, StepType::End, json!({})),
        ]);
        let exec = h.start(journey).await.execution;
        h.definitions
            .update(
                &h.tenant,
                journey,
                crate::types::JourneyPatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        h.clock.advance(Duration::seconds(60));
        let deferred = h.tick(exec.id).await.execution;
        assert_eq!(deferred.status, ExecutionStatus::Waiting);
        assert_eq!(deferred.next_step_at, Some(h.clock.now() + Duration::seconds(300)));
        assert_eq!(deferred.current_step, exec.current_step);
    }

    #[tokio::test]
    async fn test_step_limit_yields() {
        let h = harness(EngineSettings {
            max_steps_per_tick: 2,
            ..Default::default()
        });
        let journey = h.publish(vec![
            step(0, StepType::AddTag, json!({"tag": "a"})),
            step(1, StepType::AddTag, json!({"tag": "b"})),
            step(2, StepType::AddTag, json!({"tag": "c"})),
            step(3, StepType::End, json!({})),
        ]);

        let report = h.start(journey).await;
        assert_eq!(report.steps_run, 2);
        assert_eq!(report.execution.status, ExecutionStatus::Waiting);
        assert_eq!(report.execution.next_step_at, Some(h.clock.now()));

        let done = h.tick(report.execution.id).await;
        assert_eq!(done.execution.status, ExecutionStatus::Completed);
        let tags = h.contacts.get(h.tenant, &h.contact).unwrap().tags;
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancellation_supersedes_commit() {
        let h = harness(EngineSettings::default());
        let journey = h.publish(vec![step(0, StepType::End, json!({}))]);
        let exec = JourneyExecution::new(h.tenant, journey, h.contact.clone(), h.clock.now());
        h.executions.create_unless_active(exec.clone(), false).await.unwrap();
        h.executions.cancel(exec.id, h.clock.now()).await.unwrap();

        let report = h.engine.advance(exec).await.unwrap();
        assert!(!report.committed);
        assert_eq!(report.execution.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let sink = capture_sink();
        let mut h = harness(EngineSettings::default());
        h.engine = h.engine.clone().with_event_sink(sink.clone());
        let journey = h.publish(vec![
            step(0, StepType::AddTag, json!({"tag": "a"})),
            step(1, StepType::End, json!({})),
        ]);
        h.start(journey).await;
        assert_eq!(sink.count_type(EventType::StepCompleted), 2);
        assert_eq!(sink.count_type(EventType::ExecutionCompleted), 1);
    }

    #[tokio::test]
    async fn test_reads_are_tenant_scoped() {
        let h = harness(EngineSettings::default());
        let journey = h.publish(vec![step(0, StepType::End, json!({}))]);
        let exec = h.start(journey).await.execution;

        let view = h.engine.execution_view(&h.tenant, exec.id).await.unwrap();
        assert_eq!(view.progress_percentage, 100.0);
        assert!(matches!(
            h.engine.get_execution(&TenantId::new(), exec.id).await,
            Err(JourneyError::TenantMismatch { .. })
        ));

        let page = h
            .engine
            .list_executions(&h.tenant, journey, Some(ExecutionStatus::Completed), None, None)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(h.engine.attempts(&h.tenant, exec.id).await.unwrap().len(), 1);
    }

    #[test]
    fn test_trailing_failures_ignore_deferrals() {
        let exec = JourneyExecution::new(TenantId::new(), Uuid::new_v4(), "c".into(), Utc::now());
        let step = Some(Uuid::new_v4());
        let rec = |step_id, outcome| {
            ExecutionStepAttempt::new(&exec, step_id, 1, outcome, None, Utc::now())
        };
        let log = vec![
            rec(step, AttemptOutcome::Succeeded),
            rec(step, AttemptOutcome::RetryableFailure),
            rec(step, AttemptOutcome::Deferred { wake_at: Utc::now() }),
            rec(step, AttemptOutcome::RetryableFailure),
        ];
        assert_eq!(trailing_retryable_failures(&log, step.unwrap()), 2);
        assert_eq!(trailing_retryable_failures(&log, Uuid::new_v4()), 0);
    }
}

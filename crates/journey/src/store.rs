//! Durable execution state and the append-only attempt log.
//!
//! The status column doubles as the worker lease: `try_acquire` is the only
//! way out of `waiting` into `running`, and `commit` only lands while the row
//! is still `running`. Both are compare-and-swap writes.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use salesflow_core::{ContactId, TenantId};
use uuid::Uuid;

use crate::error::{JourneyError, JourneyResult};
use crate::types::{ExecutionStatus, ExecutionStepAttempt, JourneyExecution};

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(JourneyExecution),
    /// An active execution for the same (journey, contact) already existed.
    Existing(JourneyExecution),
}

impl CreateOutcome {
    pub fn execution(&self) -> &JourneyExecution {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::Existing(e) => e,
        }
    }

    pub fn into_execution(self) -> JourneyExecution {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::Existing(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The row left `running` underneath the worker (cancellation). Nothing
    /// was written.
    Superseded(ExecutionStatus),
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts `execution` unless re-entry is off and the contact already has
    /// an active execution of the same journey.
    async fn create_unless_active(
        &self,
        execution: JourneyExecution,
        allow_reentry: bool,
    ) -> JourneyResult<CreateOutcome>;

    async fn get(&self, id: Uuid) -> JourneyResult<Option<JourneyExecution>>;

    /// Executions of a journey, newest first.
    async fn list_for_journey(&self, journey_id: Uuid) -> JourneyResult<Vec<JourneyExecution>>;

    async fn list_active_for_contact(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
    ) -> JourneyResult<Vec<JourneyExecution>>;

    /// Waiting executions with `next_step_at <= now`, oldest wake time first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> JourneyResult<Vec<JourneyExecution>>;

    /// Atomically moves a due execution from `waiting` to `running`. `None`
    /// means another worker got there first or the row is no longer due.
    async fn try_acquire(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> JourneyResult<Option<JourneyExecution>>;

    /// Writes `execution` over the stored row if the stored row is `running`.
    async fn commit(&self, execution: &JourneyExecution) -> JourneyResult<CommitOutcome>;

    /// Returns a leased execution to `waiting` without recording progress.
    async fn release(
        &self,
        id: Uuid,
        wake_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JourneyResult<bool>;

    /// Moves an active execution to `cancelled`. `None` when it was already
    /// terminal.
    async fn cancel(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> JourneyResult<Option<JourneyExecution>>;

    async fn append_attempt(&self, attempt: ExecutionStepAttempt) -> JourneyResult<()>;

    /// Attempt log of an execution in insertion order.
    async fn attempts(&self, execution_id: Uuid) -> JourneyResult<Vec<ExecutionStepAttempt>>;

    async fn count_active(&self, journey_id: Uuid) -> JourneyResult<u64>;
}

type ActiveKey = (Uuid, ContactId);

/// DashMap-backed store with an active-execution index on (journey, contact).
///
/// Lock order: an `active` entry may be held while reading `executions`, never
/// the other way round.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: DashMap<Uuid, JourneyExecution>,
    active: DashMap<ActiveKey, Vec<Uuid>>,
    attempts: DashMap<Uuid, Vec<ExecutionStepAttempt>>,
    failing_commits: AtomicU32,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail with a store error.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    fn is_active(&self, id: &Uuid) -> bool {
        self.executions
            .get(id)
            .map(|e| e.status.is_active())
            .unwrap_or(false)
    }

    fn unindex(&self, execution: &JourneyExecution) {
        let key = (execution.journey_id, execution.contact_id.clone());
        self.active.remove_if_mut(&key, |_, ids| {
            ids.retain(|id| *id != execution.id);
            ids.is_empty()
        });
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_unless_active(
        &self,
        execution: JourneyExecution,
        allow_reentry: bool,
    ) -> JourneyResult<CreateOutcome> {
        let key = (execution.journey_id, execution.contact_id.clone());
        let mut index = self.active.entry(key).or_default();
        index.retain(|id| self.is_active(id));

        if !allow_reentry {
            if let Some(existing) = index.first().and_then(|id| self.executions.get(id)) {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }

        index.push(execution.id);
        self.executions.insert(execution.id, execution.clone());
        Ok(CreateOutcome::Created(execution))
    }

    async fn get(&self, id: Uuid) -> JourneyResult<Option<JourneyExecution>> {
        Ok(self.executions.get(&id).map(|e| e.value().clone()))
    }

    async fn list_for_journey(&self, journey_id: Uuid) -> JourneyResult<Vec<JourneyExecution>> {
        let mut list: Vec<JourneyExecution> = self
            .executions
            .iter()
            .filter(|e| e.journey_id == journey_id)
            .map(|e| e.value().clone())
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn list_active_for_contact(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
    ) -> JourneyResult<Vec<JourneyExecution>> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.tenant_id == *tenant && e.contact_id == *contact && e.status.is_active())
            .map(|e| e.value().clone())
            .collect())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> JourneyResult<Vec<JourneyExecution>> {
        let mut due: Vec<JourneyExecution> = self
            .executions
            .iter()
            .filter(|e| {
                e.status == ExecutionStatus::Waiting
                    && e.next_step_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|e| e.next_step_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> JourneyResult<Option<JourneyExecution>> {
        let Some(mut entry) = self.executions.get_mut(&id) else {
            return Ok(None);
        };
        let is_due = entry.status == ExecutionStatus::Waiting
            && entry.next_step_at.map(|at| at <= now).unwrap_or(false);
        if !is_due {
            return Ok(None);
        }
        entry.status = ExecutionStatus::Running;
        entry.next_step_at = None;
        entry.updated_at = now;
        Ok(Some(entry.clone()))
    }

    async fn commit(&self, execution: &JourneyExecution) -> JourneyResult<CommitOutcome> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(JourneyError::Store("injected commit failure".into()));
        }

        {
            let mut entry = self
                .executions
                .get_mut(&execution.id)
                .ok_or_else(|| JourneyError::execution_not_found(execution.id))?;
            if entry.status != ExecutionStatus::Running {
                return Ok(CommitOutcome::Superseded(entry.status));
            }
            *entry = execution.clone();
        }

        if execution.status.is_terminal() {
            self.unindex(execution);
        }
        Ok(CommitOutcome::Applied)
    }

    async fn release(
        &self,
        id: Uuid,
        wake_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JourneyResult<bool> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| JourneyError::execution_not_found(id))?;
        if entry.status != ExecutionStatus::Running {
            return Ok(false);
        }
        entry.status = ExecutionStatus::Waiting;
        entry.next_step_at = Some(wake_at);
        entry.updated_at = now;
        Ok(true)
    }

    async fn cancel(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> JourneyResult<Option<JourneyExecution>> {
        let cancelled = {
            let mut entry = self
                .executions
                .get_mut(&id)
                .ok_or_else(|| JourneyError::execution_not_found(id))?;
            if entry.status.is_terminal() {
                return Ok(None);
            }
            entry.status = ExecutionStatus::Cancelled;
            entry.next_step_at = None;
            entry.completed_at = Some(now);
            entry.updated_at = now;
            entry.clone()
        };
        self.unindex(&cancelled);
        Ok(Some(cancelled))
    }

    async fn append_attempt(&self, attempt: ExecutionStepAttempt) -> JourneyResult<()> {
        self.attempts
            .entry(attempt.execution_id)
            .or_default()
            .push(attempt);
        Ok(())
    }

    async fn attempts(&self, execution_id: Uuid) -> JourneyResult<Vec<ExecutionStepAttempt>> {
        Ok(self
            .attempts
            .get(&execution_id)
            .map(|a| a.value().clone())
            .unwrap_or_default())
    }

    async fn count_active(&self, journey_id: Uuid) -> JourneyResult<u64> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.journey_id == journey_id && e.status.is_active())
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    fn execution(journey_id: Uuid, contact: &str) -> JourneyExecution {
        JourneyExecution::new(TenantId::new(), journey_id, ContactId::from(contact), Utc::now())
    }

    fn waiting(mut exec: JourneyExecution, at: DateTime<Utc>) -> JourneyExecution {
        exec.status = ExecutionStatus::Waiting;
        exec.next_step_at = Some(at);
        exec
    }

    #[tokio::test]
    async fn test_single_active_execution_per_contact() {
        let store = InMemoryExecutionStore::new();
        let journey = Uuid::new_v4();

        let first = store
            .create_unless_active(execution(journey, "c-1"), false)
            .await
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));

        let second = store
            .create_unless_active(execution(journey, "c-1"), false)
            .await
            .unwrap();
        assert!(matches!(second, CreateOutcome::Existing(_)));
        assert_eq!(second.execution().id, first.execution().id);

        let reentry = store
            .create_unless_active(execution(journey, "c-1"), true)
            .await
            .unwrap();
        assert!(matches!(reentry, CreateOutcome::Created(_)));
        assert_eq!(store.count_active(journey).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_terminal_execution_frees_the_slot() {
        let store = InMemoryExecutionStore::new();
        let journey = Uuid::new_v4();
        let created = store
            .create_unless_active(execution(journey, "c-1"), false)
            .await
            .unwrap()
            .into_execution();

        let mut done = created.clone();
        done.status = ExecutionStatus::Completed;
        done.completed_at = Some(Utc::now());
        assert_eq!(store.commit(&done).await.unwrap(), CommitOutcome::Applied);

        let again = store
            .create_unless_active(execution(journey, "c-1"), false)
            .await
            .unwrap();
        assert!(matches!(again, CreateOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_due_orders_by_wake_time_and_respects_limit() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let journey = Uuid::new_v4();
        let later = waiting(execution(journey, "a"), now - Duration::minutes(1));
        let earliest = waiting(execution(journey, "b"), now - Duration::minutes(5));
        let future = waiting(execution(journey, "c"), now + Duration::minutes(5));
        for e in [&later, &earliest, &future] {
            store.create_unless_active(e.clone(), false).await.unwrap();
        }

        let due = store.due(now, 10).await.unwrap();
        assert_eq!(
            due.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![earliest.id, later.id]
        );
        assert_eq!(store.due(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let now = Utc::now();
        let exec = waiting(execution(Uuid::new_v4(), "a"), now);
        store.create_unless_active(exec.clone(), false).await.unwrap();

        let (a, b) = tokio::join!(store.try_acquire(exec.id, now), store.try_acquire(exec.id, now));
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);

        let leased = store.get(exec.id).await.unwrap().unwrap();
        assert_eq!(leased.status, ExecutionStatus::Running);
        assert!(leased.next_step_at.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_commit() {
        let store = InMemoryExecutionStore::new();
        let exec = store
            .create_unless_active(execution(Uuid::new_v4(), "a"), false)
            .await
            .unwrap()
            .into_execution();

        assert!(store.cancel(exec.id, Utc::now()).await.unwrap().is_some());
        assert!(store.cancel(exec.id, Utc::now()).await.unwrap().is_none());

        let mut progressed = exec.clone();
        progressed.status = ExecutionStatus::Completed;
        assert_eq!(
            store.commit(&progressed).await.unwrap(),
            CommitOutcome::Superseded(ExecutionStatus::Cancelled)
        );
        assert!(!store.release(exec.id, Utc::now(), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let store = InMemoryExecutionStore::new();
        let exec = store
            .create_unless_active(execution(Uuid::new_v4(), "a"), false)
            .await
            .unwrap()
            .into_execution();
        store.fail_next_commits(1);
        assert!(store.commit(&exec).await.unwrap_err().is_transient());
        assert!(store.commit(&exec).await.is_ok());
    }
}

//! Journey definitions and their step graphs.
//!
//! A journey is editable while in `draft`. `publish` runs the full graph
//! validation and freezes the steps; after that only name, description,
//! settings, and the active/paused toggle may change.

use std::sync::Arc;

use dashmap::DashMap;
use salesflow_core::TenantId;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EntityKind, JourneyError, JourneyResult, ValidationIssue};
use crate::schema;
use crate::store::ExecutionStore;
use crate::types::{
    Journey, JourneyDetail, JourneyPatch, JourneyStats, JourneyStatus, JourneyStep, NewJourney,
    NewStep,
};

const MAX_NAME_LEN: usize = 200;

pub struct JourneyDefinitionStore {
    journeys: DashMap<Uuid, Journey>,
    /// Ordered step lists. Swapped wholesale, never mutated in place, so
    /// readers can hold on to a published graph without copying it.
    steps: DashMap<Uuid, Arc<[JourneyStep]>>,
    /// Entry admission holds the read side; archive and delete hold the
    /// write side across their live-execution check and status write.
    lifecycle: DashMap<Uuid, Arc<RwLock<()>>>,
    executions: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JourneyDefinitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyDefinitionStore")
            .field("journeys", &self.journeys.len())
            .finish()
    }
}

impl JourneyDefinitionStore {
    pub fn new(executions: Arc<dyn ExecutionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            journeys: DashMap::new(),
            steps: DashMap::new(),
            lifecycle: DashMap::new(),
            executions,
            clock,
        }
    }

    /// Creates a draft journey. Step configs and ordering are validated up
    /// front; graph-level checks wait for `publish`.
    pub fn create(&self, tenant: &TenantId, new: NewJourney) -> JourneyResult<Journey> {
        let id = Uuid::new_v4();
        let mut issues = validate_name(&new.name);
        let steps = match schema::build_steps(id, new.steps) {
            Ok(steps) => steps,
            Err(step_issues) => {
                issues.extend(step_issues);
                Vec::new()
            }
        };
        if !issues.is_empty() {
            warn!(tenant_id = %tenant, issues = issues.len(), "Rejected journey definition");
            return Err(JourneyError::Validation(issues));
        }

        let now = self.clock.now();
        let journey = Journey {
            id,
            tenant_id: *tenant,
            name: new.name.trim().to_string(),
            description: new.description,
            status: JourneyStatus::Draft,
            settings: new.settings,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
            published_at: None,
            deleted_at: None,
        };

        info!(
            tenant_id = %tenant,
            journey_id = %id,
            name = %journey.name,
            steps = steps.len(),
            "Created journey"
        );
        self.steps.insert(id, steps.into());
        self.journeys.insert(id, journey.clone());
        Ok(journey)
    }

    pub fn get(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<Journey> {
        let journey = self
            .journeys
            .get(&id)
            .filter(|j| j.deleted_at.is_none())
            .map(|j| j.value().clone())
            .ok_or_else(|| JourneyError::journey_not_found(id))?;
        if journey.tenant_id != *tenant {
            return Err(JourneyError::TenantMismatch {
                kind: EntityKind::Journey,
                id: id.to_string(),
            });
        }
        Ok(journey)
    }

    /// Lookup without a tenant check, for engine internals that already hold
    /// a tenant-scoped execution.
    pub fn find(&self, id: Uuid) -> Option<Journey> {
        self.journeys.get(&id).map(|j| j.value().clone())
    }

    /// Journeys of a tenant, newest first. Soft-deleted journeys are hidden.
    pub fn list(&self, tenant: &TenantId) -> Vec<Journey> {
        let mut list: Vec<Journey> = self
            .journeys
            .iter()
            .filter(|j| j.tenant_id == *tenant && j.deleted_at.is_none())
            .map(|j| j.value().clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn update(&self, tenant: &TenantId, id: Uuid, patch: JourneyPatch) -> JourneyResult<Journey> {
        self.get(tenant, id)?;
        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or_else(|| JourneyError::journey_not_found(id))?;

        if entry.status == JourneyStatus::Archived {
            return Err(JourneyError::Conflict(format!(
                "journey {id} is archived and can no longer change"
            )));
        }
        if let Some(name) = &patch.name {
            let issues = validate_name(name);
            if !issues.is_empty() {
                return Err(JourneyError::Validation(issues));
            }
        }

        let status = match (patch.is_active, entry.status) {
            (None, current) => current,
            (Some(true), JourneyStatus::Active | JourneyStatus::Paused) => JourneyStatus::Active,
            (Some(false), JourneyStatus::Active | JourneyStatus::Paused) => JourneyStatus::Paused,
            (Some(_), JourneyStatus::Draft | JourneyStatus::Archived) => {
                return Err(JourneyError::Conflict(format!(
                    "journey {id} must be published before it can be activated or paused"
                )))
            }
        };

        if let Some(name) = patch.name {
            entry.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            entry.description = description;
        }
        if let Some(settings) = patch.settings {
            entry.settings = settings;
        }
        if status != entry.status {
            info!(journey_id = %id, from = ?entry.status, to = ?status, "Journey status changed");
            entry.status = status;
        }
        entry.updated_at = self.clock.now();
        Ok(entry.clone())
    }

    /// Replaces the whole step list of a draft journey.
    pub fn replace_steps(
        &self,
        tenant: &TenantId,
        id: Uuid,
        steps: Vec<NewStep>,
    ) -> JourneyResult<Arc<[JourneyStep]>> {
        let journey = self.get(tenant, id)?;
        if journey.status != JourneyStatus::Draft {
            return Err(JourneyError::Conflict(format!(
                "journey {id} is published; its steps are frozen"
            )));
        }
        let steps: Arc<[JourneyStep]> = schema::build_steps(id, steps)
            .map_err(JourneyError::Validation)?
            .into();
        self.steps.insert(id, steps.clone());
        if let Some(mut entry) = self.journeys.get_mut(&id) {
            entry.updated_at = self.clock.now();
        }
        info!(journey_id = %id, steps = steps.len(), "Replaced journey steps");
        Ok(steps)
    }

    /// Validates the full graph and activates the journey. On failure the
    /// journey stays in draft and every issue found is returned.
    pub fn publish(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<Journey> {
        let journey = self.get(tenant, id)?;
        if journey.status != JourneyStatus::Draft {
            return Err(JourneyError::Conflict(format!(
                "journey {id} is {:?}, only drafts can be published",
                journey.status
            )));
        }

        let steps = self.steps(id);
        let issues = schema::validate_for_publish(&steps);
        if !issues.is_empty() {
            warn!(journey_id = %id, issues = issues.len(), "Publish rejected");
            return Err(JourneyError::Validation(issues));
        }

        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or_else(|| JourneyError::journey_not_found(id))?;
        if entry.status != JourneyStatus::Draft {
            return Err(JourneyError::Conflict(format!("journey {id} was published concurrently")));
        }
        let now = self.clock.now();
        entry.status = JourneyStatus::Active;
        entry.published_at = Some(now);
        entry.updated_at = now;
        info!(journey_id = %id, steps = steps.len(), "Published journey");
        Ok(entry.clone())
    }

    pub fn get_steps(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<Arc<[JourneyStep]>> {
        self.get(tenant, id)?;
        Ok(self.steps(id))
    }

    /// Ordered steps of a journey; empty when unknown.
    pub fn steps(&self, id: Uuid) -> Arc<[JourneyStep]> {
        self.steps
            .get(&id)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Archives a journey. Refused while any execution is still live.
    pub async fn archive(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<Journey> {
        let _lifecycle = self.lifecycle_lock(id).write_owned().await;
        let journey = self.get(tenant, id)?;
        if journey.status == JourneyStatus::Archived {
            return Ok(journey);
        }
        self.ensure_no_live_executions(id, "archive").await?;

        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or_else(|| JourneyError::journey_not_found(id))?;
        entry.status = JourneyStatus::Archived;
        entry.updated_at = self.clock.now();
        info!(journey_id = %id, "Archived journey");
        Ok(entry.clone())
    }

    /// Soft delete. Refused while any execution is still live.
    pub async fn delete(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<()> {
        let _lifecycle = self.lifecycle_lock(id).write_owned().await;
        self.get(tenant, id)?;
        self.ensure_no_live_executions(id, "delete").await?;

        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or_else(|| JourneyError::journey_not_found(id))?;
        let now = self.clock.now();
        entry.deleted_at = Some(now);
        entry.updated_at = now;
        info!(journey_id = %id, "Deleted journey");
        Ok(())
    }

    /// Journey with its steps and execution counts by status.
    pub async fn detail(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<JourneyDetail> {
        let journey = self.get(tenant, id)?;
        let mut stats = JourneyStats {
            journey_id: id,
            ..Default::default()
        };
        for execution in self.executions.list_for_journey(id).await? {
            stats.record(execution.status);
        }
        Ok(JourneyDetail {
            journey,
            steps: self.steps(id).to_vec(),
            stats,
        })
    }

    /// Admits a new execution into an active journey. The returned permit
    /// must be held until the execution is stored; archive and delete wait
    /// for it.
    pub async fn admit(&self, tenant: &TenantId, id: Uuid) -> JourneyResult<EntryPermit> {
        let guard = self.lifecycle_lock(id).read_owned().await;
        let journey = self.get(tenant, id)?;
        if journey.status != JourneyStatus::Active {
            return Err(JourneyError::Conflict(format!(
                "journey {id} is {:?}, only active journeys can be started",
                journey.status
            )));
        }
        Ok(EntryPermit {
            journey,
            _guard: guard,
        })
    }

    fn lifecycle_lock(&self, id: Uuid) -> Arc<RwLock<()>> {
        self.lifecycle.entry(id).or_default().value().clone()
    }

    async fn ensure_no_live_executions(&self, id: Uuid, action: &str) -> JourneyResult<()> {
        let live = self.executions.count_active(id).await?;
        if live > 0 {
            return Err(JourneyError::Conflict(format!(
                "cannot {action} journey {id}: {live} execution(s) still running or waiting"
            )));
        }
        Ok(())
    }
}

/// Proof that a journey was active when an entry was admitted.
#[derive(Debug)]
pub struct EntryPermit {
    pub journey: Journey,
    _guard: OwnedRwLockReadGuard<()>,
}

fn validate_name(name: &str) -> Vec<ValidationIssue> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        vec![ValidationIssue::journey("name must not be empty").with_field("name")]
    } else if trimmed.chars().count() > MAX_NAME_LEN {
        vec![
            ValidationIssue::journey(format!("name must be at most {MAX_NAME_LEN} characters"))
                .with_field("name"),
        ]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryExecutionStore;
    use crate::types::{ExecutionStatus, JourneyExecution, StepType};

    fn step(order_no: u32, step_type: StepType, config: serde_json::Value) -> NewStep {
        NewStep {
            id: None,
            order_no,
            step_type,
            config,
            conditions: None,
            on_true: None,
            on_false: None,
            next_step: None,
        }
    }

    fn new_journey(steps: Vec<NewStep>) -> NewJourney {
        NewJourney {
            name: "Welcome series".into(),
            description: String::new(),
            settings: Default::default(),
            created_by: "tests".into(),
            steps,
        }
    }

    fn fixture() -> (JourneyDefinitionStore, Arc<InMemoryExecutionStore>) {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let store = JourneyDefinitionStore::new(executions.clone(), Arc::new(ManualClock::default()));
        (store, executions)
    }

    #[test]
    fn test_create_publish_freezes_steps() {
        let (store, _) = fixture();
        let tenant = TenantId::new();
        let journey = store
            .create(
                &tenant,
                new_journey(vec![
                    step(0, StepType::AddTag, json!({"tag": "lead"})),
                    step(1, StepType::End, json!({})),
                ]),
            )
            .unwrap();
        assert_eq!(journey.status, JourneyStatus::Draft);

        let published = store.publish(&tenant, journey.id).unwrap();
        assert_eq!(published.status, JourneyStatus::Active);
        assert!(published.published_at.is_some());

        let err = store
            .replace_steps(&tenant, journey.id, vec![step(0, StepType::End, json!({}))])
            .unwrap_err();
        assert!(matches!(err, JourneyError::Conflict(_)));
        assert!(matches!(
            store.publish(&tenant, journey.id),
            Err(JourneyError::Conflict(_))
        ));
        assert_eq!(store.get_steps(&tenant, journey.id).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_publish_stays_draft() {
        let (store, _) = fixture();
        let tenant = TenantId::new();
        let mut branch = step(0, StepType::Condition, json!({}));
        branch.conditions = Some(crate::evaluator::ConditionGroup::all(vec![
            crate::evaluator::Condition::new(
                "tags",
                crate::evaluator::Comparator::Contains,
                json!("vip"),
            ),
        ]));
        branch.on_true = Some(Uuid::new_v4());
        let journey = store.create(&tenant, new_journey(vec![branch])).unwrap();

        let err = store.publish(&tenant, journey.id).unwrap_err();
        let JourneyError::Validation(issues) = err else {
            panic!("expected validation error");
        };
        assert_eq!(issues.len(), 1);
        assert_eq!(store.get(&tenant, journey.id).unwrap().status, JourneyStatus::Draft);
    }

    #[test]
    fn test_create_rejects_invalid_steps_and_name() {
        let (store, _) = fixture();
        let mut new = new_journey(vec![step(0, StepType::SendMessage, json!({"body": ""}))]);
        new.name = "  ".into();
        let JourneyError::Validation(issues) = store.create(&TenantId::new(), new).unwrap_err()
        else {
            panic!("expected validation error");
        };
        assert_eq!(issues.len(), 2);
        assert!(store.list(&TenantId::new()).is_empty());
    }

    #[test]
    fn test_other_tenant_cannot_see_journey() {
        let (store, _) = fixture();
        let owner = TenantId::new();
        let journey = store
            .create(&owner, new_journey(vec![step(0, StepType::End, json!({}))]))
            .unwrap();
        let other = TenantId::new();
        assert!(matches!(
            store.get(&other, journey.id),
            Err(JourneyError::TenantMismatch { .. })
        ));
        assert!(store.list(&other).is_empty());
        assert_eq!(store.list(&owner).len(), 1);
    }

    #[test]
    fn test_pause_and_resume() {
        let (store, _) = fixture();
        let tenant = TenantId::new();
        let journey = store
            .create(&tenant, new_journey(vec![step(0, StepType::End, json!({}))]))
            .unwrap();
        let activate = JourneyPatch {
            is_active: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            store.update(&tenant, journey.id, activate.clone()),
            Err(JourneyError::Conflict(_))
        ));

        store.publish(&tenant, journey.id).unwrap();
        let paused = store
            .update(
                &tenant,
                journey.id,
                JourneyPatch {
                    is_active: Some(false),
                    name: Some("Renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(paused.status, JourneyStatus::Paused);
        assert_eq!(paused.name, "Renamed");
        let resumed = store.update(&tenant, journey.id, activate).unwrap();
        assert_eq!(resumed.status, JourneyStatus::Active);
    }

    #[tokio::test]
    async fn test_archive_and_delete_refused_with_live_executions() {
        let (store, executions) = fixture();
        let tenant = TenantId::new();
        let journey = store
            .create(&tenant, new_journey(vec![step(0, StepType::End, json!({}))]))
            .unwrap();
        store.publish(&tenant, journey.id).unwrap();

        let exec = JourneyExecution::new(tenant, journey.id, "c-1".into(), chrono::Utc::now());
        executions.create_unless_active(exec.clone(), false).await.unwrap();

        assert!(matches!(
            store.archive(&tenant, journey.id).await,
            Err(JourneyError::Conflict(_))
        ));
        assert!(matches!(
            store.delete(&tenant, journey.id).await,
            Err(JourneyError::Conflict(_))
        ));

        let detail = store.detail(&tenant, journey.id).await.unwrap();
        assert_eq!(detail.stats.running, 1);

        executions.cancel(exec.id, chrono::Utc::now()).await.unwrap();
        let archived = store.archive(&tenant, journey.id).await.unwrap();
        assert_eq!(archived.status, JourneyStatus::Archived);
        store.delete(&tenant, journey.id).await.unwrap();
        assert!(matches!(
            store.get(&tenant, journey.id),
            Err(JourneyError::NotFound { .. })
        ));
        assert_eq!(
            executions.get(exec.id).await.unwrap().unwrap().status,
            ExecutionStatus::Cancelled
        );
    }
}

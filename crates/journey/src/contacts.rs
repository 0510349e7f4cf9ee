//! Contact store collaborator: the engine reads snapshots and writes single
//! field/tag mutations, never holding a lock across steps.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use salesflow_core::{ContactId, TenantId};
use thiserror::Error;

use crate::evaluator::{ContactEvent, ContactSnapshot};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContactStoreError {
    #[error("contact {0} not found")]
    NotFound(ContactId),

    #[error("contact store unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn snapshot(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
    ) -> Result<ContactSnapshot, ContactStoreError>;

    async fn set_field(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), ContactStoreError>;

    async fn add_tag(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        tag: &str,
    ) -> Result<(), ContactStoreError>;

    async fn remove_tag(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        tag: &str,
    ) -> Result<(), ContactStoreError>;
}

/// DashMap-backed contact store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    contacts: DashMap<(TenantId, ContactId), ContactSnapshot>,
    transient_failures: AtomicU32,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant: TenantId, contact: ContactId, snapshot: ContactSnapshot) {
        self.contacts.insert((tenant, contact), snapshot);
    }

    pub fn remove(&self, tenant: TenantId, contact: &ContactId) -> Option<ContactSnapshot> {
        self.contacts
            .remove(&(tenant, contact.clone()))
            .map(|(_, snapshot)| snapshot)
    }

    pub fn get(&self, tenant: TenantId, contact: &ContactId) -> Option<ContactSnapshot> {
        self.contacts
            .get(&(tenant, contact.clone()))
            .map(|c| c.value().clone())
    }

    pub fn record_event(
        &self,
        tenant: TenantId,
        contact: &ContactId,
        name: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), ContactStoreError> {
        let mut entry = self
            .contacts
            .get_mut(&(tenant, contact.clone()))
            .ok_or_else(|| ContactStoreError::NotFound(contact.clone()))?;
        entry.events.push(ContactEvent {
            name: name.into(),
            occurred_at,
            properties: Default::default(),
        });
        Ok(())
    }

    /// Makes the next `n` calls fail with `Transient`.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ContactStoreError> {
        let taken = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(ContactStoreError::Transient("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    fn with_contact<R>(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        f: impl FnOnce(&mut ContactSnapshot) -> R,
    ) -> Result<R, ContactStoreError> {
        self.check_available()?;
        let mut entry = self
            .contacts
            .get_mut(&(*tenant, contact.clone()))
            .ok_or_else(|| ContactStoreError::NotFound(contact.clone()))?;
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn snapshot(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
    ) -> Result<ContactSnapshot, ContactStoreError> {
        self.with_contact(tenant, contact, |c| c.clone())
    }

    async fn set_field(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), ContactStoreError> {
        self.with_contact(tenant, contact, |c| {
            c.attributes.insert(field.to_string(), value);
        })
    }

    async fn add_tag(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        tag: &str,
    ) -> Result<(), ContactStoreError> {
        self.with_contact(tenant, contact, |c| {
            if !c.has_tag(tag) {
                c.tags.push(tag.to_string());
            }
        })
    }

    async fn remove_tag(
        &self,
        tenant: &TenantId,
        contact: &ContactId,
        tag: &str,
    ) -> Result<(), ContactStoreError> {
        self.with_contact(tenant, contact, |c| c.tags.retain(|t| t != tag))
    }
}

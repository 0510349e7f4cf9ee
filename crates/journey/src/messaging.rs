//! Outbound messaging collaborator.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use salesflow_core::{ContactId, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    /// Stable per (execution, step); lets providers drop duplicate sends after
    /// a crash mid-step.
    pub idempotency_key: String,
}

impl OutboundMessage {
    pub fn idempotency_key(execution_id: Uuid, step_id: Uuid) -> String {
        format!("{execution_id}:{step_id}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError>;
}

/// Sender that records every delivered message. Failures and latency can be
/// scripted for tests.
#[derive(Debug, Default)]
pub struct RecordingMessageSender {
    sent: Mutex<Vec<OutboundMessage>>,
    scripted: Mutex<VecDeque<SendError>>,
    latency: Mutex<Option<Duration>>,
}

impl RecordingMessageSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error to be returned by the next send.
    pub fn fail_next(&self, err: SendError) {
        self.scripted.lock().push_back(err);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MessageSender for RecordingMessageSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.scripted.lock().pop_front() {
            return Err(err);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            tenant_id: TenantId::new(),
            contact_id: ContactId::from("c-1"),
            channel: "email".into(),
            subject: None,
            body: "hello".into(),
            idempotency_key: "k".into(),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let sender = RecordingMessageSender::new();
        sender.fail_next(SendError::Provider("503".into()));
        sender.fail_next(SendError::InvalidRecipient("bounced".into()));

        assert_eq!(
            sender.send(&message()).await,
            Err(SendError::Provider("503".into()))
        );
        assert!(matches!(
            sender.send(&message()).await,
            Err(SendError::InvalidRecipient(_))
        ));
        assert!(sender.send(&message()).await.is_ok());
        assert_eq!(sender.sent_count(), 1);
    }
}

//! Side-effect dispatch for journey steps.
//!
//! Each step type has its own [`StepExecutor`]; [`ActionExecutor`] picks one
//! by the config's discriminant. Executors never return errors: every outcome,
//! including collaborator timeouts, is classified into a [`StepOutcome`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use salesflow_core::config::ExecutorConfig;
use salesflow_core::templates::TemplateRenderer;
use salesflow_core::{ContactId, TenantId};
use tracing::debug;
use uuid::Uuid;

use crate::contacts::{ContactStore, ContactStoreError};
use crate::messaging::{MessageSender, OutboundMessage, SendError};
use crate::types::{StepConfig, StepType};
use crate::webhook::{WebhookClient, WebhookError, WebhookRequest};

/// Classified result of running one step's side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Retryable(String),
    Fatal(String),
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Retryable(_) => "retryable_failure",
            StepOutcome::Fatal(_) => "fatal_failure",
        }
    }
}

impl From<ContactStoreError> for StepOutcome {
    fn from(err: ContactStoreError) -> Self {
        match err {
            ContactStoreError::NotFound(_) => StepOutcome::Fatal(err.to_string()),
            ContactStoreError::Transient(_) => StepOutcome::Retryable(err.to_string()),
        }
    }
}

/// Identifies whose step is being executed.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub tenant_id: TenantId,
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub contact_id: ContactId,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn step_type(&self) -> StepType;

    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepOutcome;
}

fn mismatch(expected: StepType, config: &StepConfig) -> StepOutcome {
    StepOutcome::Fatal(format!(
        "{expected} executor received {} config",
        config.step_type()
    ))
}

/// Renders the message against the contact's attributes and hands it to the
/// sender.
pub struct SendMessageExecutor {
    contacts: Arc<dyn ContactStore>,
    sender: Arc<dyn MessageSender>,
    timeout: Duration,
}

impl SendMessageExecutor {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        sender: Arc<dyn MessageSender>,
        timeout: Duration,
    ) -> Self {
        Self {
            contacts,
            sender,
            timeout,
        }
    }
}

#[async_trait]
impl StepExecutor for SendMessageExecutor {
    fn step_type(&self) -> StepType {
        StepType::SendMessage
    }

    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepOutcome {
        let StepConfig::SendMessage(cfg) = config else {
            return mismatch(self.step_type(), config);
        };

        let snapshot = match self.contacts.snapshot(&ctx.tenant_id, &ctx.contact_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => return err.into(),
        };
        let variables: HashMap<String, String> = snapshot
            .attributes
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect();

        let message = OutboundMessage {
            tenant_id: ctx.tenant_id,
            contact_id: ctx.contact_id.clone(),
            channel: cfg.channel.clone(),
            subject: cfg
                .subject
                .as_deref()
                .map(|s| TemplateRenderer::render(s, &variables)),
            body: TemplateRenderer::render(&cfg.body, &variables),
            idempotency_key: OutboundMessage::idempotency_key(ctx.execution_id, ctx.step_id),
        };

        match tokio::time::timeout(self.timeout, self.sender.send(&message)).await {
            Ok(Ok(())) => {
                debug!(execution_id = %ctx.execution_id, channel = %message.channel, "Message sent");
                StepOutcome::Success
            }
            Ok(Err(err @ SendError::InvalidRecipient(_))) => StepOutcome::Fatal(err.to_string()),
            Ok(Err(err @ SendError::Provider(_))) => StepOutcome::Retryable(err.to_string()),
            Err(_) => StepOutcome::Retryable(format!(
                "message send timed out after {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

/// Handles `update_field`, `add_tag`, and `remove_tag`.
pub struct ContactMutationExecutor {
    step_type: StepType,
    contacts: Arc<dyn ContactStore>,
}

impl ContactMutationExecutor {
    pub fn new(step_type: StepType, contacts: Arc<dyn ContactStore>) -> Self {
        Self {
            step_type,
            contacts,
        }
    }
}

#[async_trait]
impl StepExecutor for ContactMutationExecutor {
    fn step_type(&self) -> StepType {
        self.step_type
    }

    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepOutcome {
        let (tenant, contact) = (&ctx.tenant_id, &ctx.contact_id);
        let result = match (self.step_type, config) {
            (StepType::UpdateField, StepConfig::UpdateField(cfg)) => {
                self.contacts
                    .set_field(tenant, contact, &cfg.field, cfg.value.clone())
                    .await
            }
            (StepType::AddTag, StepConfig::AddTag(cfg)) => {
                self.contacts.add_tag(tenant, contact, &cfg.tag).await
            }
            (StepType::RemoveTag, StepConfig::RemoveTag(cfg)) => {
                self.contacts.remove_tag(tenant, contact, &cfg.tag).await
            }
            _ => return mismatch(self.step_type, config),
        };
        match result {
            Ok(()) => StepOutcome::Success,
            Err(err) => err.into(),
        }
    }
}

/// Fire-and-continue HTTP call. Only the status code is inspected.
pub struct WebhookExecutor {
    client: Arc<dyn WebhookClient>,
    timeout: Duration,
}

impl WebhookExecutor {
    pub fn new(client: Arc<dyn WebhookClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl StepExecutor for WebhookExecutor {
    fn step_type(&self) -> StepType {
        StepType::WebhookCall
    }

    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepOutcome {
        let StepConfig::WebhookCall(cfg) = config else {
            return mismatch(self.step_type(), config);
        };

        let mut headers = cfg.headers.clone();
        headers
            .entry("x-journey-execution-id".to_string())
            .or_insert_with(|| ctx.execution_id.to_string());
        let request = WebhookRequest {
            url: cfg.url.clone(),
            method: cfg.method.to_ascii_uppercase(),
            headers,
            body: cfg.payload.clone(),
        };

        match tokio::time::timeout(self.timeout, self.client.call(&request)).await {
            Ok(Ok(status)) => classify_status(status),
            Ok(Err(WebhookError::Transport(reason))) => {
                StepOutcome::Retryable(format!("webhook transport error: {reason}"))
            }
            Err(_) => StepOutcome::Retryable(format!(
                "webhook timed out after {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

fn classify_status(status: u16) -> StepOutcome {
    match status {
        200..=399 => StepOutcome::Success,
        400..=499 => StepOutcome::Fatal(format!("webhook rejected with status {status}")),
        _ => StepOutcome::Retryable(format!("webhook failed with status {status}")),
    }
}

/// `wait`, `condition`, and `end` have no external effect; the state machine
/// handles their navigation.
pub struct NoEffectExecutor(pub StepType);

#[async_trait]
impl StepExecutor for NoEffectExecutor {
    fn step_type(&self) -> StepType {
        self.0
    }

    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepOutcome {
        StepOutcome::Success
    }
}

/// Registry of step executors keyed by step type.
pub struct ActionExecutor {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.executors.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("ActionExecutor").field("types", &types).finish()
    }
}

impl ActionExecutor {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registers the built-in executor for every step type.
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        sender: Arc<dyn MessageSender>,
        webhooks: Arc<dyn WebhookClient>,
        config: &ExecutorConfig,
    ) -> Self {
        Self::empty()
            .with(SendMessageExecutor::new(
                contacts.clone(),
                sender,
                Duration::from_millis(config.message_timeout_ms),
            ))
            .with(ContactMutationExecutor::new(StepType::UpdateField, contacts.clone()))
            .with(ContactMutationExecutor::new(StepType::AddTag, contacts.clone()))
            .with(ContactMutationExecutor::new(StepType::RemoveTag, contacts))
            .with(WebhookExecutor::new(
                webhooks,
                Duration::from_millis(config.webhook_timeout_ms),
            ))
            .with(NoEffectExecutor(StepType::Wait))
            .with(NoEffectExecutor(StepType::Condition))
            .with(NoEffectExecutor(StepType::End))
    }

    /// Adds or replaces the executor for its step type.
    pub fn with(mut self, executor: impl StepExecutor + 'static) -> Self {
        self.executors.insert(executor.step_type(), Arc::new(executor));
        self
    }

    pub async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepOutcome {
        let step_type = config.step_type();
        match self.executors.get(&step_type) {
            Some(executor) => executor.execute(config, ctx).await,
            None => StepOutcome::Fatal(format!("no executor registered for {step_type}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::contacts::InMemoryContactStore;
    use crate::evaluator::ContactSnapshot;
    use crate::messaging::RecordingMessageSender;
    use crate::types::{SendMessageConfig, TagConfig, UpdateFieldConfig, WebhookConfig};
    use crate::webhook::RecordingWebhookClient;

    struct Fixture {
        contacts: Arc<InMemoryContactStore>,
        sender: Arc<RecordingMessageSender>,
        webhooks: Arc<RecordingWebhookClient>,
        actions: ActionExecutor,
        ctx: StepContext,
    }

    fn fixture() -> Fixture {
        let contacts = Arc::new(InMemoryContactStore::new());
        let sender = Arc::new(RecordingMessageSender::new());
        let webhooks = Arc::new(RecordingWebhookClient::new());
        let config = ExecutorConfig {
            message_timeout_ms: 50,
            webhook_timeout_ms: 50,
        };
        let actions = ActionExecutor::new(contacts.clone(), sender.clone(), webhooks.clone(), &config);
        let ctx = StepContext {
            tenant_id: TenantId::new(),
            execution_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            contact_id: ContactId::from("c-1"),
        };
        let mut snapshot = ContactSnapshot::default();
        snapshot
            .attributes
            .insert("first_name".into(), json!("Ada"));
        contacts.upsert(ctx.tenant_id, ctx.contact_id.clone(), snapshot);
        Fixture {
            contacts,
            sender,
            webhooks,
            actions,
            ctx,
        }
    }

    fn message(body: &str) -> StepConfig {
        StepConfig::SendMessage(SendMessageConfig {
            channel: "email".into(),
            subject: Some("Hi {{first_name}}".into()),
            body: body.into(),
        })
    }

    fn webhook() -> StepConfig {
        StepConfig::WebhookCall(WebhookConfig {
            url: "https://hooks.example.com/lead".into(),
            method: "post".into(),
            payload: Some(json!({"event": "lead"})),
            headers: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_send_message_renders_template() {
        let f = fixture();
        let outcome = f.actions.execute(&message("Welcome, {{first_name}}!"), &f.ctx).await;
        assert_eq!(outcome, StepOutcome::Success);

        let sent = f.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "Welcome, Ada!");
        assert_eq!(sent[0].subject.as_deref(), Some("Hi Ada"));
        assert_eq!(
            sent[0].idempotency_key,
            OutboundMessage::idempotency_key(f.ctx.execution_id, f.ctx.step_id)
        );
    }

    #[tokio::test]
    async fn test_send_failures_are_classified() {
        let f = fixture();
        f.sender.fail_next(SendError::Provider("throttled".into()));
        f.sender.fail_next(SendError::InvalidRecipient("no email".into()));
        assert!(matches!(
            f.actions.execute(&message("x"), &f.ctx).await,
            StepOutcome::Retryable(_)
        ));
        assert!(matches!(
            f.actions.execute(&message("x"), &f.ctx).await,
            StepOutcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_send_timeout_is_retryable() {
        let f = fixture();
        f.sender.set_latency(Some(Duration::from_millis(500)));
        let outcome = f.actions.execute(&message("x"), &f.ctx).await;
        assert_eq!(
            outcome,
            StepOutcome::Retryable("message send timed out after 50ms".into())
        );
        assert_eq!(f.sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_contact_is_fatal() {
        let f = fixture();
        f.contacts.remove(f.ctx.tenant_id, &f.ctx.contact_id);
        let tag = StepConfig::AddTag(TagConfig { tag: "vip".into() });
        assert!(matches!(
            f.actions.execute(&tag, &f.ctx).await,
            StepOutcome::Fatal(_)
        ));
        assert!(matches!(
            f.actions.execute(&message("x"), &f.ctx).await,
            StepOutcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_contact_mutations() {
        let f = fixture();
        let update = StepConfig::UpdateField(UpdateFieldConfig {
            field: "stage".into(),
            value: json!("nurture"),
        });
        assert_eq!(f.actions.execute(&update, &f.ctx).await, StepOutcome::Success);

        f.contacts.fail_next(1);
        let tag = StepConfig::AddTag(TagConfig { tag: "vip".into() });
        assert!(matches!(
            f.actions.execute(&tag, &f.ctx).await,
            StepOutcome::Retryable(_)
        ));
        assert_eq!(f.actions.execute(&tag, &f.ctx).await, StepOutcome::Success);

        let contact = f.contacts.get(f.ctx.tenant_id, &f.ctx.contact_id).unwrap();
        assert_eq!(contact.attributes["stage"], json!("nurture"));
        assert!(contact.has_tag("vip"));
    }

    #[tokio::test]
    async fn test_webhook_status_classification() {
        let f = fixture();
        f.webhooks.respond_with(Ok(204));
        f.webhooks.respond_with(Ok(404));
        f.webhooks.respond_with(Ok(503));
        f.webhooks
            .respond_with(Err(WebhookError::Transport("connection reset".into())));

        assert_eq!(f.actions.execute(&webhook(), &f.ctx).await, StepOutcome::Success);
        assert!(matches!(f.actions.execute(&webhook(), &f.ctx).await, StepOutcome::Fatal(_)));
        assert!(matches!(
            f.actions.execute(&webhook(), &f.ctx).await,
            StepOutcome::Retryable(_)
        ));
        assert!(matches!(
            f.actions.execute(&webhook(), &f.ctx).await,
            StepOutcome::Retryable(_)
        ));

        let requests = f.webhooks.requests();
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.headers.get("x-journey-execution-id"),
            Some(&f.ctx.execution_id.to_string())
        );
    }

    #[tokio::test]
    async fn test_no_effect_steps_and_missing_executor() {
        let f = fixture();
        assert_eq!(
            f.actions.execute(&StepConfig::Condition, &f.ctx).await,
            StepOutcome::Success
        );
        let empty = ActionExecutor::empty();
        assert!(matches!(
            empty.execute(&StepConfig::Condition, &f.ctx).await,
            StepOutcome::Fatal(_)
        ));
    }
}

//! Journey execution engine: per-contact workflows that advance through an
//! ordered, conditionally branching sequence of marketing actions, resumed by
//! a polling dispatcher rather than a single synchronous request.

pub mod clock;
pub mod contacts;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod graph;
pub mod messaging;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod state_machine;
pub mod store;
pub mod trigger;
pub mod types;
pub mod webhook;

use std::sync::Arc;

use salesflow_core::config::JourneyConfig;
use salesflow_core::event_bus::EventSink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use contacts::{ContactStore, InMemoryContactStore};
pub use definitions::JourneyDefinitionStore;
pub use engine::{EngineSettings, JourneyEngine};
pub use error::{JourneyError, JourneyResult, ValidationIssue};
pub use evaluator::{ConditionEvaluator, ContactSnapshot};
pub use executor::ActionExecutor;
pub use messaging::{MessageSender, RecordingMessageSender};
pub use scheduler::{DispatchReport, Dispatcher, ReleasePolicy};
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use trigger::TriggerGateway;
pub use webhook::{HttpWebhookClient, WebhookClient};

/// Fully wired engine components sharing one store, clock and event sink.
#[derive(Clone)]
pub struct JourneyRuntime {
    pub definitions: Arc<JourneyDefinitionStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub engine: Arc<JourneyEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub gateway: Arc<TriggerGateway>,
    pub clock: Arc<dyn Clock>,
}

/// Collaborators a runtime is built from.
pub struct RuntimeParts {
    pub executions: Arc<dyn ExecutionStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub sender: Arc<dyn MessageSender>,
    pub webhooks: Arc<dyn WebhookClient>,
    pub clock: Arc<dyn Clock>,
    pub event_sink: Arc<dyn EventSink>,
}

impl JourneyRuntime {
    pub fn build(config: &JourneyConfig, parts: RuntimeParts) -> Self {
        let RuntimeParts {
            executions,
            contacts,
            sender,
            webhooks,
            clock,
            event_sink,
        } = parts;

        let definitions = Arc::new(JourneyDefinitionStore::new(
            executions.clone(),
            clock.clone(),
        ));
        let actions = Arc::new(ActionExecutor::new(
            contacts.clone(),
            sender,
            webhooks,
            &config.executor,
        ));
        let engine = Arc::new(
            JourneyEngine::new(
                definitions.clone(),
                executions.clone(),
                contacts.clone(),
                actions,
                clock.clone(),
                EngineSettings::from(config),
            )
            .with_event_sink(event_sink),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            engine.clone(),
            executions.clone(),
            clock.clone(),
            config.scheduler.clone(),
        ));
        let gateway = Arc::new(TriggerGateway::new(
            engine.clone(),
            definitions.clone(),
            executions.clone(),
            clock.clone(),
            ReleasePolicy::from_config(&config.scheduler),
        ));

        Self {
            definitions,
            executions,
            contacts,
            engine,
            dispatcher,
            gateway,
            clock,
        }
    }

    /// In-memory stores, the system clock and the recording message sender.
    /// Webhooks go out over HTTP.
    pub fn in_memory(config: &JourneyConfig, event_sink: Arc<dyn EventSink>) -> Self {
        Self::build(
            config,
            RuntimeParts {
                executions: Arc::new(InMemoryExecutionStore::new()),
                contacts: Arc::new(InMemoryContactStore::new()),
                sender: Arc::new(RecordingMessageSender::new()),
                webhooks: Arc::new(HttpWebhookClient::new()),
                clock: clock::system_clock(),
                event_sink,
            },
        )
    }
}

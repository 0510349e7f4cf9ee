//! Engine event bus. Trait for emitting journey lifecycle events.
//!
//! The journey engine accepts an `Arc<dyn EventSink>` so that analytics,
//! audit feeds, or customer webhooks can observe executions without the
//! engine knowing about them.

use crate::types::{ContactId, EngineEvent, EventType, TenantId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for deployments that don't consume engine events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Identifies the execution an event is about.
#[derive(Debug, Clone)]
pub struct EventSubject {
    pub tenant_id: TenantId,
    pub journey_id: Uuid,
    pub execution_id: Uuid,
    pub contact_id: ContactId,
}

/// Convenience builder for creating `EngineEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    subject: &EventSubject,
    step_id: Option<Uuid>,
    detail: Option<String>,
    timestamp: DateTime<Utc>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        tenant_id: subject.tenant_id,
        journey_id: subject.journey_id,
        execution_id: subject.execution_id,
        contact_id: subject.contact_id.clone(),
        step_id,
        detail,
        timestamp,
    }
}

/// Convenience: create a no-op event bus for callers that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> EventSubject {
        EventSubject {
            tenant_id: TenantId::new(),
            journey_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            contact_id: ContactId::new("contact-1"),
        }
    }

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let subject = subject();
        sink.emit(make_event(
            EventType::ExecutionStarted,
            &subject,
            None,
            None,
            Utc::now(),
        ));
        sink.emit(make_event(
            EventType::StepCompleted,
            &subject,
            Some(Uuid::new_v4()),
            Some("send_message".into()),
            Utc::now(),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::ExecutionStarted), 1);
        assert_eq!(sink.count_type(EventType::StepCompleted), 1);

        let events = sink.events();
        assert_eq!(events[0].execution_id, subject.execution_id);
        assert_eq!(events[1].detail.as_deref(), Some("send_message"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(
            EventType::ExecutionFailed,
            &subject(),
            None,
            None,
            Utc::now(),
        ));
    }
}

//! API server. Mounts the journey REST surface and the metrics exporter.

use crate::journey_rest as journeys;
use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use salesflow_core::config::AppConfig;
use salesflow_journey::JourneyRuntime;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the application router for `state`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // Journeys
        .route("/journeys", get(journeys::list_journeys).post(journeys::create_journey))
        .route("/journeys/step-types", get(journeys::list_step_types))
        .route("/journeys/step-types/schema", get(journeys::step_type_schema))
        .route(
            "/journeys/:id",
            get(journeys::get_journey)
                .patch(journeys::update_journey)
                .delete(journeys::delete_journey),
        )
        .route("/journeys/:id/publish", post(journeys::publish_journey))
        .route("/journeys/:id/archive", post(journeys::archive_journey))
        .route("/journeys/:id/cancel-executions", post(journeys::cancel_journey_executions))
        .route("/journeys/:id/contacts/:contact_id/run", post(journeys::run_for_contact))
        .route("/journeys/:id/executions", get(journeys::list_executions))
        // Executions
        .route("/executions/:id", get(journeys::get_execution))
        .route("/executions/:id/attempts", get(journeys::execution_attempts))
        .route("/executions/:id/cancel", post(journeys::cancel_execution))
        .route("/contacts/:contact_id/unsubscribe", post(journeys::unsubscribe_contact))
        // Automation
        .route("/automation/rules", get(journeys::list_rules).post(journeys::create_rule))
        .route("/automation/rules/:id", axum::routing::delete(journeys::delete_rule))
        .route("/automation/events", post(journeys::ingest_event));

    Router::new()
        .nest("/api/v1", api)
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    runtime: Arc<JourneyRuntime>,
}

impl ApiServer {
    pub fn new(config: AppConfig, runtime: Arc<JourneyRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Start the HTTP REST server; returns once `shutdown` flips to `true`.
    pub async fn start_http(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let state = AppState {
            runtime: self.runtime.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };
        let app = router(state);

        let addr = SocketAddr::new(
            self.config.api.host.parse()?,
            self.config.api.http_port,
        );

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use salesflow_core::config::JourneyConfig;
    use salesflow_core::event_bus::noop_sink;
    use salesflow_core::{ContactId, TenantId};
    use salesflow_journey::webhook::RecordingWebhookClient;
    use salesflow_journey::{
        ContactSnapshot, InMemoryContactStore, InMemoryExecutionStore, ManualClock,
        RecordingMessageSender, RuntimeParts,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        contacts: Arc<InMemoryContactStore>,
        tenant: TenantId,
    }

    fn test_app() -> TestApp {
        let contacts = Arc::new(InMemoryContactStore::new());
        let runtime = JourneyRuntime::build(
            &JourneyConfig::default(),
            RuntimeParts {
                executions: Arc::new(InMemoryExecutionStore::new()),
                contacts: contacts.clone(),
                sender: Arc::new(RecordingMessageSender::new()),
                webhooks: Arc::new(RecordingWebhookClient::new()),
                clock: Arc::new(ManualClock::default()),
                event_sink: noop_sink(),
            },
        );
        let state = AppState {
            runtime: Arc::new(runtime),
            node_id: "test-node".to_string(),
            start_time: Instant::now(),
        };
        TestApp {
            app: router(state),
            contacts,
            tenant: TenantId::new(),
        }
    }

    impl TestApp {
        async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            self.call_as(self.tenant, method, uri, body).await
        }

        async fn call_as(
            &self,
            tenant: TenantId,
            method: &str,
            uri: &str,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let builder = Request::builder()
                .method(method)
                .uri(uri)
                .header("x-tenant-id", tenant.to_string())
                .header("content-type", "application/json");
            let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
            let resp = self
                .app
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap();
            let status = resp.status();
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, json)
        }

        async fn create_published(&self) -> String {
            let (status, body) = self
                .call(
                    "POST",
                    "/api/v1/journeys",
                    Some(json!({
                        "name": "Onboarding",
                        "created_by": "ops",
                        "steps": [
                            {"order_no": 0, "step_type": "add_tag", "config": {"tag": "onboarded"}},
                            {"order_no": 1, "step_type": "wait", "config": {"delay_secs": 3600}},
                            {"order_no": 2, "step_type": "end", "config": {}}
                        ]
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            let id = body["id"].as_str().unwrap().to_string();
            let (status, _) = self
                .call("POST", &format!("/api/v1/journeys/{id}/publish"), None)
                .await;
            assert_eq!(status, StatusCode::OK);
            id
        }
    }

    #[tokio::test]
    async fn test_health_needs_no_tenant() {
        let t = test_app();
        let resp = t
            .app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_tenant_header_is_rejected() {
        let t = test_app();
        let resp = t
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/journeys")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_journey_returns_issues() {
        let t = test_app();
        let (status, body) = t
            .call(
                "POST",
                "/api/v1/journeys",
                Some(json!({
                    "name": "Broken",
                    "created_by": "ops",
                    "steps": [
                        {"order_no": 0, "step_type": "send_message", "config": {"body": ""}},
                        {"order_no": 2, "step_type": "end"}
                    ]
                })),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "validation_failed");
        assert!(body["issues"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_run_flow_and_execution_reads() {
        let t = test_app();
        t.contacts
            .upsert(t.tenant, ContactId::from("c-42"), ContactSnapshot::default());
        let journey = t.create_published().await;

        let uri = format!("/api/v1/journeys/{journey}/contacts/c-42/run");
        let (status, run) = t.call("POST", &uri, None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(run["status"], "waiting");
        assert_eq!(run["created"], true);

        let (status, again) = t.call("POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["execution_id"], run["execution_id"]);

        let (status, page) = t
            .call("GET", &format!("/api/v1/journeys/{journey}/executions?status=waiting"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert!(page["items"][0]["progress_percentage"].is_number());

        let execution = run["execution_id"].as_str().unwrap();
        let (status, attempts) = t
            .call("GET", &format!("/api/v1/executions/{execution}/attempts"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(attempts.as_array().unwrap().len(), 2);

        // Other tenants cannot see it.
        let (status, _) = t
            .call_as(TenantId::new(), "GET", &format!("/api/v1/executions/{execution}"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Live executions block deletion until cancelled.
        let (status, _) = t.call("DELETE", &format!("/api/v1/journeys/{journey}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, cancelled) = t
            .call("POST", &format!("/api/v1/executions/{execution}/cancel"), Some(json!({"reason": "test"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");
        let (status, _) = t.call("DELETE", &format!("/api/v1/journeys/{journey}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = t.call("GET", &format!("/api/v1/journeys/{journey}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_step_type_catalogue() {
        let t = test_app();
        let (status, types) = t.call("GET", "/api/v1/journeys/step-types", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(types.as_array().unwrap().len(), 8);

        let (status, schema) = t
            .call("GET", "/api/v1/journeys/step-types/schema?step_type=wait", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(schema.is_object());
    }

    #[tokio::test]
    async fn test_automation_rule_lifecycle() {
        let t = test_app();
        t.contacts
            .upsert(t.tenant, ContactId::from("c-7"), ContactSnapshot::default());
        let journey = t.create_published().await;

        let (status, rule) = t
            .call(
                "POST",
                "/api/v1/automation/rules",
                Some(json!({"journey_id": journey, "event_name": "signup", "delay_secs": 60})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, events) = t
            .call(
                "POST",
                "/api/v1/automation/events",
                Some(json!({"contact_id": "c-7", "event_name": "signup"})),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(events["started"], 1);
        assert_eq!(events["executions"][0]["status"], "waiting");

        let (status, unsubscribed) = t
            .call("POST", "/api/v1/contacts/c-7/unsubscribe", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(unsubscribed["cancelled"], 1);

        let rule_id = rule["id"].as_str().unwrap();
        let (status, _) = t
            .call("DELETE", &format!("/api/v1/automation/rules/{rule_id}"), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, rules) = t.call("GET", "/api/v1/automation/rules", None).await;
        assert!(rules.as_array().unwrap().is_empty());
    }
}

//! Shared building blocks for the salesflow journey platform: configuration,
//! identifiers, the engine event bus, and message template rendering.

pub mod config;
pub mod event_bus;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use types::{ContactId, TenantId};

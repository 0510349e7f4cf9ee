use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `SALESFLOW__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub journey: JourneyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            journey: JourneyConfig::default(),
        }
    }
}

// ─── Journey Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct JourneyConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Upper bound on steps one `advance` call may run back to back.
    #[serde(default = "default_max_steps_per_tick")]
    pub max_steps_per_tick: u32,
    /// How long a woken execution of a paused journey is put back to sleep.
    #[serde(default = "default_paused_recheck_secs")]
    pub paused_recheck_secs: u64,
}

fn default_max_steps_per_tick() -> u32 { 50 }
fn default_paused_recheck_secs() -> u64 { 300 }

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
            max_steps_per_tick: default_max_steps_per_tick(),
            paused_recheck_secs: default_paused_recheck_secs(),
        }
    }
}

// ─── Scheduler Config ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Base delay before an execution released after a dispatcher error is retried.
    #[serde(default = "default_release_delay_ms")]
    pub release_delay_ms: u64,
    #[serde(default = "default_release_jitter_ms")]
    pub release_jitter_ms: u64,
}

fn default_scheduler_enabled() -> bool { true }
fn default_workers() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_batch_size() -> usize { 100 }
fn default_release_delay_ms() -> u64 { 5000 }
fn default_release_jitter_ms() -> u64 { 2000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            release_delay_ms: default_release_delay_ms(),
            release_jitter_ms: default_release_jitter_ms(),
        }
    }
}

// ─── Retry Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts allowed per step before a retryable failure becomes fatal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 60_000 }
fn default_max_backoff_ms() -> u64 { 3_600_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

// ─── Executor Config ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
}

fn default_message_timeout_ms() -> u64 { 10_000 }
fn default_webhook_timeout_ms() -> u64 { 5_000 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: default_message_timeout_ms(),
            webhook_timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("SALESFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

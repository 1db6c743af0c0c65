//! Service configuration
//!
//! All sections are optional in the TOML file; defaults are supplied by
//! the `default_*` helpers so a partial config stays valid.

use crate::error::{Error, Result};
use crate::queues::{is_registered_queue, QueueConfiguration};
use crate::registry::{FieldKind, JobTypeRegistry, JobTypeSpec, PayloadSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for conveyor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub queues: QueuesConfig,

    /// Handler endpoint map; empty means use the built-in defaults
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        if let Ok(config_path) = std::env::var("CONVEYOR_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = ["./config/conveyor.toml", "/etc/conveyor/config.toml"];
        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("invalid server port".to_string()));
        }
        if self.limits.max_payload_bytes == 0 {
            return Err(Error::Config("max_payload_bytes must be positive".to_string()));
        }
        self.scheduler
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| Error::Config(format!("unknown timezone: {}", self.scheduler.timezone)))?;
        self.queues
            .defaults
            .validate()
            .map_err(Error::Config)?;
        for (name, configuration) in &self.queues.overrides {
            if !is_registered_queue(name) {
                return Err(Error::Config(format!("override for unknown queue: {}", name)));
            }
            configuration.validate().map_err(Error::Config)?;
        }
        for entry in &self.handlers {
            if !is_registered_queue(&entry.queue) {
                return Err(Error::Config(format!("handler for unknown queue: {}", entry.queue)));
            }
        }
        Ok(())
    }

    /// Parsed scheduler timezone
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.scheduler
            .timezone
            .parse()
            .unwrap_or(chrono_tz::Tz::UTC)
    }

    /// Effective configuration for one queue (defaults + override)
    pub fn queue_configuration(&self, queue: &str) -> QueueConfiguration {
        self.queues
            .overrides
            .get(queue)
            .cloned()
            .unwrap_or_else(|| self.queues.defaults.clone())
    }

    /// Build the job-type registry from the configured handler map,
    /// falling back to the built-in endpoints when none are configured.
    pub fn build_registry(&self) -> Result<JobTypeRegistry> {
        let mut registry = JobTypeRegistry::new();
        let entries = if self.handlers.is_empty() {
            default_handler_entries()
        } else {
            self.handlers.clone()
        };
        for entry in entries {
            let method = entry
                .method
                .parse::<reqwest::Method>()
                .map_err(|_| Error::Config(format!("invalid handler method: {}", entry.method)))?;
            let mut spec = JobTypeSpec::new(
                entry.endpoint.clone(),
                Duration::from_secs(entry.timeout_secs),
            );
            spec.method = method;
            for (name, value) in entry.headers {
                spec = spec.with_header(name, value);
            }
            let mut schema = PayloadSchema::any();
            for field in entry.required_fields {
                schema = schema.require(field, FieldKind::Any);
            }
            registry.register(entry.queue, entry.job_type, spec.with_schema(schema))?;
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Redis backing; when disabled the in-memory store and broker are used
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_redis_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_redis_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            max_retries: default_redis_max_retries(),
            retry_delay_ms: default_redis_retry_delay_ms(),
        }
    }
}

impl RedisSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound on serialized payload size
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Upper bound accepted for delayed submission
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl LimitsConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Sleep between empty reserve attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lease slack on top of the longest handler timeout for a queue
    #[serde(default = "default_lease_grace_secs")]
    pub lease_grace_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lease_grace_secs: default_lease_grace_secs(),
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Timezone for cron evaluation (chrono-tz name)
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_promotion_interval_ms")]
    pub promotion_interval_ms: u64,

    #[serde(default = "default_stall_sweep_interval_secs")]
    pub stall_sweep_interval_secs: u64,

    #[serde(default = "default_metrics_refresh_interval_secs")]
    pub metrics_refresh_interval_secs: u64,

    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,

    /// Terminal records older than this are hard-deleted
    #[serde(default = "default_retention_cutoff_days")]
    pub retention_cutoff_days: u32,

    /// Cap on exponential retry backoff
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            promotion_interval_ms: default_promotion_interval_ms(),
            stall_sweep_interval_secs: default_stall_sweep_interval_secs(),
            metrics_refresh_interval_secs: default_metrics_refresh_interval_secs(),
            retention_interval_secs: default_retention_interval_secs(),
            retention_cutoff_days: default_retention_cutoff_days(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
        }
    }
}

impl SchedulerSettings {
    pub fn promotion_interval(&self) -> Duration {
        Duration::from_millis(self.promotion_interval_ms)
    }

    pub fn stall_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stall_sweep_interval_secs)
    }

    pub fn metrics_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_refresh_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Settings applied to queues without an override
    #[serde(default)]
    pub defaults: QueueConfiguration,

    /// Per-queue settings keyed by queue name
    #[serde(default)]
    pub overrides: HashMap<String, QueueConfiguration>,
}

/// One configured handler endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerEntry {
    pub queue: String,
    pub job_type: String,
    pub endpoint: String,

    #[serde(default = "default_handler_method")]
    pub method: String,

    #[serde(default = "default_handler_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Top-level payload fields required at submit
    #[serde(default)]
    pub required_fields: Vec<String>,
}

/// Built-in handler map for the known platform services
fn default_handler_entries() -> Vec<HandlerEntry> {
    let entry = |queue: &str, job_type: &str, endpoint: &str, timeout_secs: u64| HandlerEntry {
        queue: queue.to_string(),
        job_type: job_type.to_string(),
        endpoint: endpoint.to_string(),
        method: default_handler_method(),
        timeout_secs,
        headers: HashMap::new(),
        required_fields: Vec::new(),
    };

    vec![
        entry(
            "business-discovery",
            "discover-businesses",
            "http://discovery:9001/internal/discover",
            120,
        ),
        entry(
            "instagram-detection",
            "detect-instagram",
            "http://discovery:9001/internal/instagram",
            120,
        ),
        entry(
            "video-scraping",
            "scrape-videos",
            "http://scraper:9002/internal/scrape",
            300,
        ),
        entry(
            "video-analysis",
            "analyze-video",
            "http://analyzer:9003/internal/analyze",
            600,
        ),
        entry(
            "report-generation",
            "generate-report",
            "http://reporter:9004/internal/generate",
            300,
        ),
        entry(
            "file-processing",
            "process-file",
            "http://files:9005/internal/process",
            300,
        ),
        entry(
            "cleanup",
            "cleanup-expired-jobs",
            "http://cleanup:9006/internal/run",
            120,
        ),
        entry(
            "notifications",
            "send-notification",
            "http://notifier:9007/internal/send",
            30,
        ),
    ]
}

// Default value helper functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_key_prefix() -> String {
    "conveyor".to_string()
}
fn default_redis_max_retries() -> u32 {
    5
}
fn default_redis_retry_delay_ms() -> u64 {
    500
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}
fn default_max_delay_ms() -> u64 {
    7 * 24 * 3600 * 1000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_lease_grace_secs() -> u64 {
    30
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_promotion_interval_ms() -> u64 {
    1_000
}
fn default_stall_sweep_interval_secs() -> u64 {
    30
}
fn default_metrics_refresh_interval_secs() -> u64 {
    60
}
fn default_retention_interval_secs() -> u64 {
    24 * 3600
}
fn default_retention_cutoff_days() -> u32 {
    30
}
fn default_backoff_ceiling_ms() -> u64 {
    5 * 60 * 1000
}
fn default_handler_method() -> String {
    "POST".to_string()
}
fn default_handler_timeout_secs() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.limits.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.scheduler.stall_sweep_interval_secs, 30);
        assert!(!config.redis.enabled);
    }

    #[test]
    fn test_default_registry_covers_all_queues() {
        let registry = Config::default().build_registry().unwrap();
        for queue in crate::queues::QUEUE_NAMES {
            assert!(
                !registry.types_for(queue).is_empty(),
                "no handler registered for {}",
                queue
            );
        }
    }

    #[test]
    fn test_queue_override_lookup() {
        let mut config = Config::default();
        config.queues.overrides.insert(
            "video-analysis".to_string(),
            QueueConfiguration {
                concurrency: 2,
                ..Default::default()
            },
        );

        assert_eq!(config.queue_configuration("video-analysis").concurrency, 2);
        assert_eq!(
            config.queue_configuration("cleanup").concurrency,
            config.queues.defaults.concurrency
        );
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let mut config = Config::default();
        config.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_queue_override_rejected() {
        let mut config = Config::default();
        config
            .queues
            .overrides
            .insert("payments".to_string(), QueueConfiguration::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 9090

[scheduler]
timezone = "America/New_York"
stall_sweep_interval_secs = 10

[queues.overrides.notifications]
concurrency = 8
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.scheduler.timezone, "America/New_York");
        assert_eq!(config.scheduler.stall_sweep_interval_secs, 10);
        assert_eq!(config.queue_configuration("notifications").concurrency, 8);
    }
}

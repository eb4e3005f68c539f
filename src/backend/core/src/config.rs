//! Configuration management.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ReindexError, Result};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Retry queue policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Execution runner limits
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Retry scheduler loop
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Audit log sink
    #[serde(default)]
    pub audit: AuditConfig,

    /// Evidence diff handling
    #[serde(default)]
    pub evidence: EvidenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
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

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Link template for trace viewers, e.g. `https://traces.example.com/trace/{trace_id}`
    pub trace_url_template: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            trace_url_template: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Automatic attempts allowed per queue entry
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Cooldown after the first failure
    #[serde(default = "default_base_cooldown", with = "humantime_serde")]
    pub base_cooldown: Duration,

    /// Ceiling for exponential cooldown growth
    #[serde(default = "default_max_cooldown", with = "humantime_serde")]
    pub max_cooldown: Duration,

    /// Fraction of the cooldown added as random jitter (0.0 - 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_cooldown: default_base_cooldown(),
            max_cooldown: default_max_cooldown(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Running tasks older than this are force-failed by the watchdog
    #[serde(default = "default_execution_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: default_execution_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Run the retry scheduler inside the server process
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Interval between eligibility scans
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Append audit records to this JSONL file as well as memory
    pub path: Option<PathBuf>,

    /// Records kept in memory for export
    #[serde(default = "default_audit_max_in_memory")]
    pub max_in_memory: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_in_memory: default_audit_max_in_memory(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceConfig {
    /// Samples kept per evidence diff
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            sample_cap: default_sample_cap(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_max_attempts() -> u32 { 3 }
fn default_base_cooldown() -> Duration { Duration::from_secs(30) }
fn default_max_cooldown() -> Duration { Duration::from_secs(30 * 60) }
fn default_jitter_factor() -> f64 { 0.1 }
fn default_execution_timeout() -> Duration { Duration::from_secs(30 * 60) }
fn default_scheduler_enabled() -> bool { true }
fn default_poll_interval() -> Duration { Duration::from_secs(10) }
fn default_audit_max_in_memory() -> usize { 10_000 }
fn default_sample_cap() -> usize { 20 }

/// Optional base file, resolved relative to the working directory with any
/// extension the `config` crate understands (`config/reindex.toml`, ...).
pub const DEFAULT_CONFIG_FILE: &str = "config/reindex";

impl Config {
    /// Load configuration from the optional [`DEFAULT_CONFIG_FILE`] and the
    /// environment (`REINDEX__SECTION__KEY`) on top.
    pub fn load() -> anyhow::Result<Self> {
        Self::layered(DEFAULT_CONFIG_FILE, None)
    }

    /// Load from a specific file path. The default file sits underneath and
    /// environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        Self::layered(DEFAULT_CONFIG_FILE, Some(path))
    }

    fn layered(default_file: &str, file: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name(default_file).required(false));
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("REINDEX").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the retry policy cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ReindexError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_cooldown > self.retry.max_cooldown {
            return Err(ReindexError::configuration(
                "retry.base_cooldown must not exceed retry.max_cooldown",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ReindexError::configuration(
                "retry.jitter_factor must be between 0.0 and 1.0",
            ));
        }
        if self.execution.timeout.is_zero() {
            return Err(ReindexError::configuration("execution.timeout must be positive"));
        }
        if self.scheduler.poll_interval.is_zero() {
            return Err(ReindexError::configuration("scheduler.poll_interval must be positive"));
        }
        if self.evidence.sample_cap == 0 {
            return Err(ReindexError::configuration("evidence.sample_cap must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.evidence.sample_cap, 20);
        assert!(config.retry.base_cooldown < config.retry.max_cooldown);
    }

    #[test]
    fn test_rejects_inverted_cooldowns() {
        let mut config = Config::default();
        config.retry.base_cooldown = Duration::from_secs(600);
        config.retry.max_cooldown = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_attempts_and_bad_jitter() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_parses_humantime() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[retry]\nmax_attempts = 5\nbase_cooldown = \"2m\"\nmax_cooldown = \"1h\"\n\n[execution]\ntimeout = \"90s\""
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_cooldown, Duration::from_secs(120));
        assert_eq!(config.retry.max_cooldown, Duration::from_secs(3600));
        assert_eq!(config.execution.timeout, Duration::from_secs(90));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_default_file_is_optional_and_layered_under_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let default_file = dir.path().join("reindex");
        let default_name = default_file.to_str().unwrap();

        let config = Config::layered(default_name, None).unwrap();
        assert_eq!(config.retry.max_attempts, 3);

        std::fs::write(
            dir.path().join("reindex.toml"),
            "[retry]\nmax_attempts = 7\n\n[scheduler]\npoll_interval = \"30s\"\n",
        )
        .unwrap();
        let config = Config::layered(default_name, None).unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(30));

        let explicit = dir.path().join("override.toml");
        std::fs::write(&explicit, "[retry]\nmax_attempts = 2\n").unwrap();
        let config = Config::layered(default_name, explicit.to_str()).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_default_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reindex.toml"), "[retry]\nmax_attempts = 0\n").unwrap();
        let default_file = dir.path().join("reindex");
        assert!(Config::layered(default_file.to_str().unwrap(), None).is_err());
    }
}

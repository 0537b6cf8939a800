//! Daemon configuration loading.
//!
//! TOML config file with per-section defaults; every field is optional.
//! Environment variables override the file:
//!
//! - `RELAY_SOCKET` — socket path
//! - `RELAY_ROOT` — root directory (default `~/.agent-relay`)
//! - `RELAY_LOG` — log filter (read in main, not here)
//! - `RELAY_DISABLE_RATE_LIMIT` — any non-empty value selects the no-op limiter
//! - `RELAY_ENFORCE_POLICY` — surfaced to the external policy engine
//! - `RELAY_MAX_AGENTS` — ceiling on concurrently registered agents

use crate::delivery::RetryConfig;
use crate::rate_limit::RateLimitConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub socket_path: PathBuf,
    pub root_dir: PathBuf,
    pub rate_limit_enabled: bool,
    pub rate_limit: RateLimitConfig,
    pub enforce_policy: bool,
    pub max_agents: Option<u32>,
    pub watchdog: WatchdogSettings,
    pub delivery: RetryConfig,
    pub processing_timeout: Duration,
    pub spawning_timeout: Duration,
    pub dedup_window: usize,
    /// Deadline for a blocked connection write queue.
    pub write_deadline: Duration,
    /// Deadline for the first (HELLO) envelope on a new connection.
    pub malformed_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub settle: Duration,
    pub reconcile_interval: Duration,
    pub cleanup_interval: Duration,
    pub max_message_size: u64,
    pub max_attachment_size: u64,
    pub orphaned_pending_age: Duration,
    pub archive_retention: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        WatchdogSettings {
            settle: Duration::from_millis(500),
            reconcile_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            max_message_size: 1024 * 1024,
            max_attachment_size: 10 * 1024 * 1024,
            orphaned_pending_age: Duration::from_secs(30),
            archive_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl RelayConfig {
    pub fn outbox_dir(&self) -> PathBuf {
        self.root_dir.join("outbox")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root_dir.join("archive")
    }

    pub fn meta_db_path(&self) -> PathBuf {
        self.root_dir.join("meta").join("ledger.sqlite")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.root_dir.join("attachments")
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    socket_path: Option<String>,
    root_dir: Option<String>,
    rate_limit: Option<RawRateLimit>,
    watchdog: Option<RawWatchdog>,
    delivery: Option<RawDelivery>,
    limits: Option<RawLimits>,
}

#[derive(Debug, Deserialize)]
struct RawRateLimit {
    enabled: Option<bool>,
    burst: Option<f64>,
    refill_per_sec: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawWatchdog {
    settle_ms: Option<u64>,
    reconcile_interval_ms: Option<u64>,
    cleanup_interval_ms: Option<u64>,
    max_message_size: Option<u64>,
    max_attachment_size: Option<u64>,
    orphaned_pending_age_ms: Option<u64>,
    archive_retention_days: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDelivery {
    base_ms: Option<u64>,
    multiplier: Option<u32>,
    max_attempts: Option<u32>,
    ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    processing_timeout_ms: Option<u64>,
    spawning_timeout_ms: Option<u64>,
    dedup_window: Option<usize>,
    write_deadline_ms: Option<u64>,
    malformed_timeout_ms: Option<u64>,
    max_agents: Option<u32>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from an optional TOML file, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let raw = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::Io(format!("reading config file '{}': {}", path.display(), e))
            })?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        None => RawConfig::default(),
    };
    from_raw(raw)
}

/// Load config from a TOML string (tests).
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    from_raw(raw)
}

fn from_raw(raw: RawConfig) -> Result<RelayConfig, ConfigError> {
    let root_dir = env_var("RELAY_ROOT")
        .map(PathBuf::from)
        .or_else(|| raw.root_dir.map(PathBuf::from))
        .unwrap_or_else(default_root);
    let socket_path = env_var("RELAY_SOCKET")
        .map(PathBuf::from)
        .or_else(|| raw.socket_path.map(PathBuf::from))
        .unwrap_or_else(|| root_dir.join("relay.sock"));

    let (mut rate_limit_enabled, rate_limit) = match raw.rate_limit {
        Some(r) => (
            r.enabled.unwrap_or(true),
            RateLimitConfig {
                burst: r.burst.unwrap_or(10.0),
                refill_per_sec: r.refill_per_sec.unwrap_or(2.0),
            },
        ),
        None => (true, RateLimitConfig::default()),
    };
    if env_var("RELAY_DISABLE_RATE_LIMIT").is_some() {
        rate_limit_enabled = false;
    }
    if rate_limit.burst <= 0.0 || rate_limit.refill_per_sec < 0.0 {
        return Err(ConfigError::InvalidValue(
            "rate_limit burst must be positive and refill non-negative".to_owned(),
        ));
    }

    let watchdog = match raw.watchdog {
        Some(w) => {
            let defaults = WatchdogSettings::default();
            WatchdogSettings {
                settle: w
                    .settle_ms
                    .map_or(defaults.settle, Duration::from_millis),
                reconcile_interval: w
                    .reconcile_interval_ms
                    .map_or(defaults.reconcile_interval, Duration::from_millis),
                cleanup_interval: w
                    .cleanup_interval_ms
                    .map_or(defaults.cleanup_interval, Duration::from_millis),
                max_message_size: w.max_message_size.unwrap_or(defaults.max_message_size),
                max_attachment_size: w
                    .max_attachment_size
                    .unwrap_or(defaults.max_attachment_size),
                orphaned_pending_age: w
                    .orphaned_pending_age_ms
                    .map_or(defaults.orphaned_pending_age, Duration::from_millis),
                archive_retention: w
                    .archive_retention_days
                    .map_or(defaults.archive_retention, |days| {
                        Duration::from_secs(days * 24 * 60 * 60)
                    }),
            }
        }
        None => WatchdogSettings::default(),
    };

    let delivery = match raw.delivery {
        Some(d) => RetryConfig {
            base: Duration::from_millis(d.base_ms.unwrap_or(1000)),
            multiplier: d.multiplier.unwrap_or(2),
            max_attempts: d.max_attempts.unwrap_or(5),
            ttl: Duration::from_millis(d.ttl_ms.unwrap_or(60_000)),
        },
        None => RetryConfig::default(),
    };
    if delivery.max_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "delivery.max_attempts must be at least 1".to_owned(),
        ));
    }

    let limits = raw.limits;
    let max_agents = match env_var("RELAY_MAX_AGENTS") {
        Some(value) => Some(value.parse::<u32>().map_err(|_| {
            ConfigError::InvalidValue(format!("RELAY_MAX_AGENTS must be an integer, got '{value}'"))
        })?),
        None => limits.as_ref().and_then(|l| l.max_agents),
    };

    Ok(RelayConfig {
        socket_path,
        root_dir,
        rate_limit_enabled,
        rate_limit,
        enforce_policy: env_var("RELAY_ENFORCE_POLICY").is_some(),
        max_agents,
        watchdog,
        delivery,
        processing_timeout: Duration::from_millis(
            limits
                .as_ref()
                .and_then(|l| l.processing_timeout_ms)
                .unwrap_or(30_000),
        ),
        spawning_timeout: Duration::from_millis(
            limits
                .as_ref()
                .and_then(|l| l.spawning_timeout_ms)
                .unwrap_or(60_000),
        ),
        dedup_window: limits.as_ref().and_then(|l| l.dedup_window).unwrap_or(2000),
        write_deadline: Duration::from_millis(
            limits
                .as_ref()
                .and_then(|l| l.write_deadline_ms)
                .unwrap_or(5_000),
        ),
        malformed_timeout: Duration::from_millis(
            limits
                .as_ref()
                .and_then(|l| l.malformed_timeout_ms)
                .unwrap_or(10_000),
        ),
    })
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-relay")
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config = load_config_from_str("").unwrap();
        assert!(config.rate_limit_enabled);
        assert_eq!(config.watchdog.settle, Duration::from_millis(500));
        assert_eq!(config.delivery.max_attempts, 5);
        assert_eq!(config.dedup_window, 2000);
        assert_eq!(config.processing_timeout, Duration::from_secs(30));
        assert!(config.socket_path.ends_with("relay.sock"));
    }

    #[test]
    fn sections_override_defaults() {
        let config = load_config_from_str(
            r#"
            root_dir = "/tmp/relay-test"

            [rate_limit]
            burst = 50.0
            refill_per_sec = 5.0

            [watchdog]
            settle_ms = 100
            archive_retention_days = 1

            [delivery]
            base_ms = 250
            max_attempts = 3

            [limits]
            dedup_window = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/tmp/relay-test"));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/relay-test/relay.sock"));
        assert_eq!(config.rate_limit.burst, 50.0);
        assert_eq!(config.watchdog.settle, Duration::from_millis(100));
        assert_eq!(
            config.watchdog.archive_retention,
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(config.delivery.base, Duration::from_millis(250));
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.dedup_window, 64);
        assert_eq!(config.meta_db_path(), PathBuf::from("/tmp/relay-test/meta/ledger.sqlite"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(load_config_from_str("[rate_limit]\nburst = 0.0").is_err());
        assert!(load_config_from_str("[delivery]\nmax_attempts = 0").is_err());
        assert!(load_config_from_str("socket_path = 3").is_err());
    }
}

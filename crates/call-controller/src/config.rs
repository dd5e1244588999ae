//! Call controller configuration.
//!
//! Configuration is loaded from environment variables. Connection URLs may
//! embed credentials and are redacted in Debug output. Every tuning knob
//! the matching rules depend on is externally tunable; the defaults mirror
//! the original deployment and are flagged for product-level tuning, not
//! assumed optimal.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default queue entry lifetime in seconds (30 minutes).
pub const DEFAULT_QUEUE_TIMEOUT_SECONDS: u64 = 1800;

/// Default shared queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: u64 = 1000;

/// Default priority weight in milliseconds. Negative so that positive
/// priority sorts ahead of FIFO order (one minute per level).
pub const DEFAULT_PRIORITY_WEIGHT_MS: i64 = -60_000;

/// Default queue cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60;

/// Default background matching sweep interval in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Default recent-match cooldown window in seconds.
pub const DEFAULT_MATCH_COOLDOWN_SECONDS: u64 = 300;

/// Default queue-age gap beyond which age compatibility applies, in seconds.
pub const DEFAULT_AGE_GAP_THRESHOLD_SECONDS: u64 = 300;

/// Default wait after which a stale request may pair with anyone, in seconds.
pub const DEFAULT_AGE_GRACE_SECONDS: u64 = 600;

/// Default leader lease TTL in milliseconds.
pub const DEFAULT_LEASE_TTL_MS: u64 = 15_000;

/// Default maximum call lifetime in seconds (2 hours).
pub const DEFAULT_CALL_TIMEOUT_SECONDS: u64 = 7200;

/// Default hot retention for ended-call records in seconds (1 hour).
pub const DEFAULT_ENDED_RETENTION_SECONDS: u64 = 3600;

/// Default hot retention for ended calls flagged for moderation review,
/// in seconds (48 hours).
pub const DEFAULT_FLAGGED_RETENTION_SECONDS: u64 = 172_800;

/// Default node ID prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "cc";

/// Call controller configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (shared queue/state/lease store).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Postgres connection URL (durable ended-call archive).
    /// Protected by `SecretString` to prevent accidental logging.
    pub database_url: SecretString,

    /// Unique identifier for this controller process.
    pub node_id: String,

    /// Health endpoint bind address (default: "0.0.0.0:8080").
    pub health_bind_address: String,

    /// Queue entry lifetime in seconds.
    pub queue_timeout_seconds: u64,

    /// Maximum queued requests cluster-wide.
    pub queue_capacity: u64,

    /// Priority weight applied to the queue score, in milliseconds.
    pub priority_weight_ms: i64,

    /// Queue cleanup interval in seconds.
    pub cleanup_interval_seconds: u64,

    /// Background matching sweep interval in milliseconds.
    pub sweep_interval_ms: u64,

    /// Recent-match cooldown window in seconds.
    pub match_cooldown_seconds: u64,

    /// Queue-age gap beyond which age compatibility applies, in seconds.
    pub age_gap_threshold_seconds: u64,

    /// Wait after which a stale request may pair with anyone, in seconds.
    pub age_grace_seconds: u64,

    /// Leader lease TTL in milliseconds.
    pub lease_ttl_ms: u64,

    /// Maximum call lifetime in seconds.
    pub call_timeout_seconds: u64,

    /// Hot retention for ended-call records in seconds.
    pub ended_retention_seconds: u64,

    /// Hot retention for flagged ended-call records in seconds.
    pub flagged_retention_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("database_url", &"[REDACTED]")
            .field("node_id", &self.node_id)
            .field("health_bind_address", &self.health_bind_address)
            .field("queue_timeout_seconds", &self.queue_timeout_seconds)
            .field("queue_capacity", &self.queue_capacity)
            .field("priority_weight_ms", &self.priority_weight_ms)
            .field("cleanup_interval_seconds", &self.cleanup_interval_seconds)
            .field("sweep_interval_ms", &self.sweep_interval_ms)
            .field("match_cooldown_seconds", &self.match_cooldown_seconds)
            .field(
                "age_gap_threshold_seconds",
                &self.age_gap_threshold_seconds,
            )
            .field("age_grace_seconds", &self.age_grace_seconds)
            .field("lease_ttl_ms", &self.lease_ttl_ms)
            .field("call_timeout_seconds", &self.call_timeout_seconds)
            .field("ended_retention_seconds", &self.ended_retention_seconds)
            .field(
                "flagged_retention_seconds",
                &self.flagged_retention_seconds,
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let database_url = SecretString::from(
            vars.get("DATABASE_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
                .clone(),
        );

        let health_bind_address = vars
            .get("CC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let queue_timeout_seconds = parse_or(vars, "CC_QUEUE_TIMEOUT_SECONDS", DEFAULT_QUEUE_TIMEOUT_SECONDS);
        let queue_capacity = parse_or(vars, "CC_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY);
        let priority_weight_ms = parse_or(vars, "CC_PRIORITY_WEIGHT_MS", DEFAULT_PRIORITY_WEIGHT_MS);
        let cleanup_interval_seconds =
            parse_or(vars, "CC_CLEANUP_INTERVAL_SECONDS", DEFAULT_CLEANUP_INTERVAL_SECONDS);
        let sweep_interval_ms = parse_or(vars, "CC_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS);
        let match_cooldown_seconds =
            parse_or(vars, "CC_MATCH_COOLDOWN_SECONDS", DEFAULT_MATCH_COOLDOWN_SECONDS);
        let age_gap_threshold_seconds = parse_or(
            vars,
            "CC_AGE_GAP_THRESHOLD_SECONDS",
            DEFAULT_AGE_GAP_THRESHOLD_SECONDS,
        );
        let age_grace_seconds = parse_or(vars, "CC_AGE_GRACE_SECONDS", DEFAULT_AGE_GRACE_SECONDS);
        let lease_ttl_ms = parse_or(vars, "CC_LEASE_TTL_MS", DEFAULT_LEASE_TTL_MS);
        let call_timeout_seconds =
            parse_or(vars, "CC_CALL_TIMEOUT_SECONDS", DEFAULT_CALL_TIMEOUT_SECONDS);
        let ended_retention_seconds = parse_or(
            vars,
            "CC_ENDED_RETENTION_SECONDS",
            DEFAULT_ENDED_RETENTION_SECONDS,
        );
        let flagged_retention_seconds = parse_or(
            vars,
            "CC_FLAGGED_RETENTION_SECONDS",
            DEFAULT_FLAGGED_RETENTION_SECONDS,
        );

        // Generate node instance ID
        let node_id = vars.get("CC_NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        if lease_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CC_LEASE_TTL_MS must be positive".to_string(),
            ));
        }

        Ok(Config {
            redis_url,
            database_url,
            node_id,
            health_bind_address,
            queue_timeout_seconds,
            queue_capacity,
            priority_weight_ms,
            cleanup_interval_seconds,
            sweep_interval_ms,
            match_cooldown_seconds,
            age_gap_threshold_seconds,
            age_grace_seconds,
            lease_ttl_ms,
            call_timeout_seconds,
            ended_retention_seconds,
            flagged_retention_seconds,
        })
    }

    /// Queue manager configuration view.
    #[must_use]
    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            timeout: Duration::from_secs(self.queue_timeout_seconds),
            capacity: self.queue_capacity,
            priority_weight_ms: self.priority_weight_ms,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
        }
    }

    /// Matching engine configuration view.
    #[must_use]
    pub fn matching(&self) -> MatchingConfig {
        MatchingConfig {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            cooldown: Duration::from_secs(self.match_cooldown_seconds),
            age_gap_threshold: Duration::from_secs(self.age_gap_threshold_seconds),
            age_grace_period: Duration::from_secs(self.age_grace_seconds),
        }
    }

    /// Coordinator configuration view.
    #[must_use]
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
        }
    }

    /// State store configuration view.
    #[must_use]
    pub fn state(&self) -> StateConfig {
        StateConfig {
            call_timeout: Duration::from_secs(self.call_timeout_seconds),
            ended_retention: Duration::from_secs(self.ended_retention_seconds),
            flagged_retention: Duration::from_secs(self.flagged_retention_seconds),
        }
    }
}

fn parse_or<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    vars.get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Configuration for the queue manager.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue entry lifetime.
    pub timeout: Duration,
    /// Maximum queued requests cluster-wide.
    pub capacity: u64,
    /// Priority weight applied to the queue score, in milliseconds.
    pub priority_weight_ms: i64,
    /// Cleanup task interval.
    pub cleanup_interval: Duration,
}

/// Configuration for the matching engine.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Background sweep interval.
    pub sweep_interval: Duration,
    /// Recent-match cooldown window.
    pub cooldown: Duration,
    /// Queue-age gap beyond which age compatibility applies.
    pub age_gap_threshold: Duration,
    /// Wait after which a stale request may pair with anyone.
    pub age_grace_period: Duration,
}

/// Configuration for the leader coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Leader lease TTL. Renewal runs at a third of this.
    pub lease_ttl: Duration,
}

/// Configuration for the state store.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Maximum call lifetime before forced termination.
    pub call_timeout: Duration,
    /// Hot retention for ended-call records.
    pub ended_retention: Duration,
    /// Hot retention for flagged ended-call records.
    pub flagged_retention: Duration,
}

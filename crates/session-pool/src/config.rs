//! Pool configuration.

use std::time::Duration;

use crate::error::{PoolError, Result};
use crate::key::PoolKey;
use crate::recycle::ChangedSessionBehavior;

/// Default maximum number of sessions per pool.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// Default number of sessions the pool keeps warm.
pub const DEFAULT_MIN_POOL_SIZE: u32 = 1;

/// Default time an acquire waits for a session when the pool is full.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a session may stay idle before it is evicted.
pub const DEFAULT_EXPIRATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Connection-string keys read by [`PoolConfig::apply_key`], lowercased.
pub mod keys {
    /// Enable/disable session retention.
    pub const POOLING_ENABLED: &str = "poolingenabled";
    /// Background-filled floor.
    pub const MIN_POOL_SIZE: &str = "minpoolsize";
    /// Hard ceiling on pool size.
    pub const MAX_POOL_SIZE: &str = "maxpoolsize";
    /// Acquire block deadline when the pool is full.
    pub const WAIT_TIMEOUT: &str = "waitingforidlesessiontimeout";
    /// Idle-session eviction age.
    pub const EXPIRATION_TIMEOUT: &str = "expirationtimeout";
    /// Recycle-policy mode.
    pub const CHANGED_SESSION: &str = "changedsession";
}

/// Configuration for a session pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Whether released sessions are retained for reuse.
    pub pooling_enabled: bool,

    /// Number of sessions the pool fills in the background.
    ///
    /// Values above `max_pool_size` are clamped to it.
    pub min_pool_size: u32,

    /// Maximum number of sessions (idle and busy) in the pool.
    pub max_pool_size: u32,

    /// How long an acquire waits for a session when the pool is full.
    pub wait_timeout: Duration,

    /// Idle time after which a session is evicted. `None` disables eviction.
    pub expiration_timeout: Option<Duration>,

    /// What to do with sessions whose context changed while checked out.
    pub changed_session: ChangedSessionBehavior,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pooling_enabled: true,
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            expiration_timeout: Some(DEFAULT_EXPIRATION_TIMEOUT),
            changed_session: ChangedSessionBehavior::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the pooling keys of a connection string over the defaults.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        Self::default().apply_key(&PoolKey::parse(conn_str)?)
    }

    /// Enable or disable session retention.
    #[must_use]
    pub fn pooling_enabled(mut self, enabled: bool) -> Self {
        self.pooling_enabled = enabled;
        self
    }

    /// Set the minimum number of sessions.
    #[must_use]
    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.min_pool_size = size;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the acquire wait timeout.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the idle expiration timeout (`None` disables eviction).
    #[must_use]
    pub fn expiration_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.expiration_timeout = timeout;
        self
    }

    /// Set the changed-session behavior.
    #[must_use]
    pub fn changed_session(mut self, behavior: ChangedSessionBehavior) -> Self {
        self.changed_session = behavior;
        self
    }

    /// Number of sessions the background filler aims for.
    #[must_use]
    pub fn fill_target(&self) -> u32 {
        self.min_pool_size.min(self.max_pool_size)
    }

    /// Override settings with the pooling keys present in `key`.
    ///
    /// Keys that are absent leave the current value untouched; unrelated
    /// keys are ignored.
    pub fn apply_key(mut self, key: &PoolKey) -> Result<Self> {
        for (name, value) in key.iter() {
            match name {
                keys::POOLING_ENABLED => self.pooling_enabled = parse_bool(name, value)?,
                keys::MIN_POOL_SIZE => self.min_pool_size = parse_size(name, value)?,
                keys::MAX_POOL_SIZE => self.max_pool_size = parse_size(name, value)?,
                keys::WAIT_TIMEOUT => self.wait_timeout = parse_duration(name, value)?,
                keys::EXPIRATION_TIMEOUT => {
                    self.expiration_timeout = if value.trim_start().starts_with('-') {
                        None
                    } else {
                        Some(parse_duration(name, value)?)
                    };
                }
                keys::CHANGED_SESSION => self.changed_session = value.parse()?,
                _ => {
                    tracing::debug!(key = name, "ignoring non-pooling connection string key");
                }
            }
        }
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pooling_enabled && self.max_pool_size == 0 {
            return Err(PoolError::Configuration(
                "max_pool_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0"
    {
        Ok(false)
    } else {
        Err(PoolError::Configuration(format!(
            "invalid boolean for {key}: {value}"
        )))
    }
}

fn parse_size(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid size for {key}: {value}")))
}

/// Parse `"30"`, `"30s"`, `"500ms"` or `"5m"`. Plain numbers are seconds.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim().to_lowercase();
    let invalid = || PoolError::Configuration(format!("invalid duration for {key}: {value}"));

    let (digits, unit_ms) = if let Some(n) = value.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60_000)
    } else {
        (value.as_str(), 1_000)
    };

    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    amount
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

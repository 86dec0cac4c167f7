//! Quota policies and the keys that name quota buckets.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{QuotaError, Result};

/// An immutable `(window, max requests, key prefix)` quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub(super) window_ms: u64,
    pub(super) max_requests: u64,
    pub(super) key_prefix: String,
}

impl Policy {
    /// Create a policy, rejecting a zero window, a zero budget or an empty
    /// prefix.
    pub fn new(window: Duration, max_requests: u64, key_prefix: impl Into<String>) -> Result<Self> {
        Self::from_millis(window.as_millis() as u64, max_requests, key_prefix)
    }

    /// Create a policy from a window length in milliseconds.
    pub fn from_millis(window_ms: u64, max_requests: u64, key_prefix: impl Into<String>) -> Result<Self> {
        let key_prefix = key_prefix.into();

        if window_ms == 0 {
            return Err(QuotaError::InvalidPolicy(
                "window must be at least one millisecond".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(QuotaError::InvalidPolicy(
                "max_requests must be positive".to_string(),
            ));
        }
        if key_prefix.trim().is_empty() {
            return Err(QuotaError::InvalidPolicy(
                "key_prefix must not be empty".to_string(),
            ));
        }

        Ok(Self {
            window_ms,
            max_requests,
            key_prefix,
        })
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Bucket expiry in whole seconds, `ceil(window / 1s)`.
    pub fn ttl_secs(&self) -> u64 {
        self.window_spec().ttl_secs()
    }

    /// The store-facing part of the policy.
    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            window_ms: self.window_ms,
            max_requests: self.max_requests,
        }
    }
}

/// Policy shape as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Bucket key prefix; defaults to `rl:{name}`
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl PolicyConfig {
    /// Validate into a [`Policy`] registered under `name`.
    pub fn to_policy(&self, name: &str) -> Result<Policy> {
        let prefix = self
            .key_prefix
            .clone()
            .unwrap_or_else(|| format!("rl:{}", name));
        Policy::from_millis(self.window_ms, self.max_requests, prefix)
            .map_err(|e| QuotaError::InvalidPolicy(format!("policy '{}': {}", name, e)))
    }
}

/// The window length and budget a store needs for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl WindowSpec {
    /// Bucket expiry in whole seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000).max(1)
    }
}

/// A key that uniquely identifies one quota bucket.
///
/// Composed of the policy's key prefix and the caller identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Prefix of the policy the bucket belongs to
    pub prefix: String,
    /// The caller identifier
    pub identifier: String,
}

impl RateLimitKey {
    pub fn new(prefix: &str, identifier: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Render the key as stored, `"{prefix}:{identifier}"`.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.prefix, self.identifier)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

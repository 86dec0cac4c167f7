//! Named quota presets and caller identity resolution.
//!
//! The presets cover the common call sites: `strict` and `auth` for
//! credential-style endpoints, `email` for outbound mail, `moderate` and
//! `lenient` for general traffic. Configuration may override any of them or
//! register additional named policies.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::decision::Decision;
use super::limiter::RateLimiter;
use super::policy::{Policy, PolicyConfig};
use crate::error::{QuotaError, Result};

/// Identifier used when a caller supplies neither an id nor an address.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// The built-in presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    Strict,
    Moderate,
    Lenient,
    Auth,
    Email,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Strict,
        Preset::Moderate,
        Preset::Lenient,
        Preset::Auth,
        Preset::Email,
    ];

    /// Name used in configuration and on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Preset::Strict => "strict",
            Preset::Moderate => "moderate",
            Preset::Lenient => "lenient",
            Preset::Auth => "auth",
            Preset::Email => "email",
        }
    }

    fn defaults(&self) -> (Duration, u64) {
        const MINUTE: Duration = Duration::from_secs(60);
        match self {
            Preset::Strict => (MINUTE * 15, 5),
            Preset::Moderate => (MINUTE, 10),
            Preset::Lenient => (MINUTE, 30),
            Preset::Auth => (MINUTE * 15, 5),
            Preset::Email => (MINUTE * 60, 3),
        }
    }

    /// The preset's built-in policy.
    pub fn default_policy(&self) -> Policy {
        let (window, max_requests) = self.defaults();
        Policy {
            window_ms: window.as_millis() as u64,
            max_requests,
            key_prefix: format!("rl:{}", self.name()),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| QuotaError::UnknownPolicy(s.to_string()))
    }
}

/// Policies by name: the presets plus anything configured.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<String, Policy>,
}

impl PolicyTable {
    /// A table holding only the built-in presets.
    pub fn presets() -> Self {
        let policies = Preset::ALL
            .into_iter()
            .map(|p| (p.name().to_string(), p.default_policy()))
            .collect();
        Self { policies }
    }

    /// The presets, overridden and extended by configured policies.
    pub fn from_config(configured: &HashMap<String, PolicyConfig>) -> Result<Self> {
        let mut table = Self::presets();
        for (name, config) in configured {
            let policy = config.to_policy(name)?;
            info!(
                policy = %name,
                window_ms = policy.window_ms(),
                max_requests = policy.max_requests(),
                "Registered rate limit policy"
            );
            table.policies.insert(name.clone(), policy);
        }
        Ok(table)
    }

    /// Register or replace a named policy.
    pub fn insert(&mut self, name: impl Into<String>, policy: Policy) {
        self.policies.insert(name.into(), policy);
    }

    pub fn get(&self, name: &str) -> Result<&Policy> {
        self.policies
            .get(name)
            .ok_or_else(|| QuotaError::UnknownPolicy(name.to_string()))
    }

    /// The policy for `preset`, as overridden by configuration.
    pub fn preset(&self, preset: Preset) -> Policy {
        self.policies
            .get(preset.name())
            .cloned()
            .unwrap_or_else(|| preset.default_policy())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::presets()
    }
}

/// What is known about a caller, in order of preference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// An explicit identifier, e.g. a user id or API key
    pub identifier: Option<String>,
    /// The network origin of the request
    pub origin: Option<IpAddr>,
}

impl ClientIdentity {
    pub fn from_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            origin: None,
        }
    }

    pub fn from_addr(addr: IpAddr) -> Self {
        Self {
            identifier: None,
            origin: Some(addr),
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_addr(addr.ip())
    }

    /// Take the origin from an `X-Forwarded-For` value: the first entry is
    /// the client. Unparseable values leave the origin unset.
    pub fn from_forwarded_for(header: &str) -> Self {
        let origin = header
            .split(',')
            .next()
            .map(str::trim)
            .and_then(|first| first.parse::<IpAddr>().ok());
        Self {
            identifier: None,
            origin,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Explicit identifier, else `ip:{origin}`, else [`UNKNOWN_IDENTIFIER`].
    pub fn resolve(&self) -> String {
        if let Some(id) = self.identifier.as_deref().map(str::trim) {
            if !id.is_empty() {
                return id.to_string();
            }
        }
        match self.origin {
            Some(addr) => format!("ip:{}", addr),
            None => UNKNOWN_IDENTIFIER.to_string(),
        }
    }
}

/// Check `identity` against the policy registered as `name`.
pub async fn named(limiter: &RateLimiter, name: &str, identity: &ClientIdentity) -> Result<Decision> {
    let policy = limiter.policies().get(name)?;
    limiter.check_rate_limit(&identity.resolve(), policy).await
}

async fn check_preset(limiter: &RateLimiter, preset: Preset, identity: &ClientIdentity) -> Result<Decision> {
    let policy = limiter.policies().preset(preset);
    limiter.check_rate_limit(&identity.resolve(), &policy).await
}

/// 5 requests per 15 minutes.
pub async fn strict(limiter: &RateLimiter, identity: &ClientIdentity) -> Result<Decision> {
    check_preset(limiter, Preset::Strict, identity).await
}

/// 10 requests per minute.
pub async fn moderate(limiter: &RateLimiter, identity: &ClientIdentity) -> Result<Decision> {
    check_preset(limiter, Preset::Moderate, identity).await
}

/// 30 requests per minute.
pub async fn lenient(limiter: &RateLimiter, identity: &ClientIdentity) -> Result<Decision> {
    check_preset(limiter, Preset::Lenient, identity).await
}

/// 5 authentication attempts per 15 minutes.
pub async fn auth(limiter: &RateLimiter, identity: &ClientIdentity) -> Result<Decision> {
    check_preset(limiter, Preset::Auth, identity).await
}

/// 3 emails per hour.
pub async fn email(limiter: &RateLimiter, identity: &ClientIdentity) -> Result<Decision> {
    check_preset(limiter, Preset::Email, identity).await
}

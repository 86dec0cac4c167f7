//! Distributed sliding-window store backed by Redis sorted sets.
//!
//! Each bucket is a pair of sorted sets sharing one hash tag: `{key}:a`
//! holds admitted requests and `{key}:d` holds denied ones. Members are unique
//! tokens scored by their timestamp in milliseconds. One Lua script prunes,
//! counts, records and refreshes the expiry, so Redis serializes concurrent
//! callers from any number of processes. Counting and finding the oldest
//! admitted entry only touch the admitted set.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::backend::{Backend, Connector, WindowOutcome, WindowStore};
use super::policy::{RateLimitKey, WindowSpec};
use crate::error::StoreError;

/// Prune, count, record and expire as one atomic unit.
///
/// KEYS[1] admitted set, KEYS[2] denied set
/// ARGV[1] now (ms), ARGV[2] window (ms), ARGV[3] max requests,
/// ARGV[4] unique token, ARGV[5] ttl (s)
///
/// Returns `{admitted, admitted_count, oldest_admitted_ms}`; the oldest is
/// -1 when the window holds no admitted entry.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local admitted_key = KEYS[1]
local denied_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local token = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', admitted_key, '-inf', now - window)
redis.call('ZREMRANGEBYSCORE', denied_key, '-inf', now - window)

local count = redis.call('ZCARD', admitted_key)
local admitted = 0
if count < limit then
  redis.call('ZADD', admitted_key, now, token)
  count = count + 1
  admitted = 1
else
  redis.call('ZADD', denied_key, now, token)
end

local oldest = -1
local first = redis.call('ZRANGE', admitted_key, 0, 0, 'WITHSCORES')
if #first > 0 then
  oldest = tonumber(first[2])
end

redis.call('EXPIRE', admitted_key, ttl)
redis.call('EXPIRE', denied_key, ttl)

return {admitted, count, oldest}
"#;

/// The admitted and denied set names for a bucket.
fn bucket_keys(key: &RateLimitKey) -> (String, String) {
    let tag = key.to_store_key();
    (format!("{{{}}}:a", tag), format!("{{{}}}:d", tag))
}

/// Build the unique member suffix for one request.
fn entry_token(now_ms: u64) -> String {
    format!("{}:{}", now_ms, uuid::Uuid::new_v4())
}

/// Strip credentials from a connection URL for logging.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// A window store living in Redis.
pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    script: Script,
    target: String,
}

impl RedisStore {
    /// Connect to `url` and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let target = redact_url(url);

        let client = redis::Client::open(url).map_err(|e| {
            warn!(endpoint = %target, error = %e, "Invalid Redis URL for rate limiting");
            StoreError::Connection(format!("invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(endpoint = %target, error = %e, "Failed to connect to Redis for rate limiting");
            StoreError::from(e)
        })?;

        let mut conn = manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(endpoint = %target, reply = %pong, "Redis answered PING");

        info!(endpoint = %target, "Connected to Redis for rate limiting");

        Ok(Self {
            connection: RwLock::new(Some(manager)),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            target,
        })
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.connection.read().clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn check_and_record(
        &self,
        key: &RateLimitKey,
        now_ms: u64,
        spec: WindowSpec,
    ) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.connection()?;
        let (admitted_key, denied_key) = bucket_keys(key);

        let (admitted, count, oldest): (i64, i64, i64) = self
            .script
            .key(&admitted_key)
            .key(&denied_key)
            .arg(now_ms)
            .arg(spec.window_ms)
            .arg(spec.max_requests)
            .arg(entry_token(now_ms))
            .arg(spec.ttl_secs())
            .invoke_async(&mut conn)
            .await?;

        trace!(
            key = %key,
            admitted = admitted,
            count = count,
            oldest = oldest,
            "Recorded request in distributed window"
        );

        Ok(WindowOutcome {
            admitted: admitted == 1,
            count: count.max(0) as u64,
            oldest_admitted_ms: u64::try_from(oldest).ok(),
        })
    }

    fn backend(&self) -> Backend {
        Backend::Distributed
    }

    async fn close(&self) {
        if self.connection.write().take().is_some() {
            info!(endpoint = %self.target, "Closed Redis rate limiting connection");
        }
    }
}

/// Opens [`RedisStore`] connections for the failover controller.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
}

impl RedisConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn WindowStore>, StoreError> {
        let store = RedisStore::connect(&self.url).await?;
        Ok(Arc::new(store))
    }

    fn describe(&self) -> String {
        redact_url(&self.url)
    }
}

//! Store traits for abstracting the local and distributed window logs.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use super::policy::{RateLimitKey, WindowSpec};
use crate::error::StoreError;

/// What a store observed while recording one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request fit in the window and was admitted
    pub admitted: bool,
    /// Admitted entries in the window, including this one when admitted
    pub count: u64,
    /// Timestamp of the oldest admitted entry still in the window
    pub oldest_admitted_ms: Option<u64>,
}

/// Which kind of store served a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Shared across processes
    Distributed,
    /// This process only
    Local,
}

/// A sliding-window log that can atomically prune, count and record.
///
/// Implemented by both the in-process `LocalStore` and the Redis-backed
/// `RedisStore` so the selector can route to either.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Prune entries at or before `now_ms - window_ms`, decide admission,
    /// record this request and refresh the bucket expiry, all as one unit.
    async fn check_and_record(
        &self,
        key: &RateLimitKey,
        now_ms: u64,
        spec: WindowSpec,
    ) -> Result<WindowOutcome, StoreError>;

    /// Which kind of store this is.
    fn backend(&self) -> Backend;

    /// Release any connection held by the store.
    async fn close(&self) {}
}

/// Opens connections to a distributed store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a fresh, verified connection.
    async fn connect(&self) -> Result<Arc<dyn WindowStore>, StoreError>;

    /// Human-readable target for logs, without credentials.
    fn describe(&self) -> String;
}

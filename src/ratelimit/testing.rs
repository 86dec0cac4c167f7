//! Mock stores for exercising failover without a Redis server.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::backend::{Backend, Connector, WindowOutcome, WindowStore};
use super::local::LocalStore;
use super::policy::{RateLimitKey, WindowSpec};
use crate::error::StoreError;

/// A "distributed" store backed by a local log that fails or hangs on demand.
pub(crate) struct FlakyStore {
    pub inner: LocalStore,
    pub failing: AtomicBool,
    pub hang: AtomicBool,
    pub closed: AtomicBool,
    pub calls: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: LocalStore::new(),
            failing: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl WindowStore for FlakyStore {
    async fn check_and_record(
        &self,
        key: &RateLimitKey,
        now_ms: u64,
        spec: WindowSpec,
    ) -> Result<WindowOutcome, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Operation("injected failure".to_string()));
        }
        Ok(self.inner.record(key, now_ms, spec))
    }

    fn backend(&self) -> Backend {
        Backend::Distributed
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out one shared [`FlakyStore`] while `reachable` is set.
pub(crate) struct MockConnector {
    pub store: Arc<FlakyStore>,
    pub reachable: AtomicBool,
    pub attempts: AtomicU32,
    pub connect_delay_ms: AtomicU64,
}

impl MockConnector {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(FlakyStore::new()),
            reachable: AtomicBool::new(reachable),
            attempts: AtomicU32::new(0),
            connect_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn WindowStore>, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(self.store.clone())
        } else {
            Err(StoreError::Connection("connection refused".to_string()))
        }
    }

    fn describe(&self) -> String {
        "mock://store".to_string()
    }
}

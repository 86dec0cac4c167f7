//! In-process sliding-window store.
//!
//! Used when no distributed store is configured or reachable. Limits are
//! enforced per process only: N instances running in fallback mode admit up
//! to N times the configured budget between them.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

use super::backend::{Backend, WindowOutcome, WindowStore};
use super::policy::{RateLimitKey, WindowSpec};
use crate::error::StoreError;

/// Default number of buckets held before an access triggers a sweep.
pub const DEFAULT_SWEEP_THRESHOLD: usize = 10_000;

/// Whether an entry recorded at `at_ms` has left a window ending at `now_ms`.
fn expired(at_ms: u64, window_ms: u64, now_ms: u64) -> bool {
    at_ms.saturating_add(window_ms) <= now_ms
}

/// The window log for a single key.
///
/// Admitted and denied timestamps live in separate queues so counting and
/// finding the oldest admitted entry never walk past denied retries.
#[derive(Debug, Default)]
struct Bucket {
    admitted: VecDeque<u64>,
    denied: VecDeque<u64>,
    window_ms: u64,
}

impl Bucket {
    /// Drop entries that have left the window ending at `now_ms`.
    fn prune(&mut self, now_ms: u64) {
        let window_ms = self.window_ms;
        for queue in [&mut self.admitted, &mut self.denied] {
            while queue.front().is_some_and(|&at| expired(at, window_ms, now_ms)) {
                queue.pop_front();
            }
        }
    }

    fn count(&self) -> u64 {
        self.admitted.len() as u64
    }

    fn newest(&self) -> Option<u64> {
        self.admitted.back().copied().max(self.denied.back().copied())
    }

    /// Whether nothing in this bucket can influence a future count.
    fn is_idle(&self, now_ms: u64) -> bool {
        match self.newest() {
            Some(newest) => expired(newest, self.window_ms, now_ms),
            None => true,
        }
    }
}

/// Sliding-window log over a process-local concurrent map.
///
/// Each key's prune, count and append run under that key's shard lock, so
/// concurrent checks for one key never both see the pre-increment count.
pub struct LocalStore {
    buckets: DashMap<String, Bucket>,
    sweep_threshold: usize,
    /// Bucket count above which the next access sweeps; at least the
    /// threshold, and twice what survived the last sweep.
    sweep_trigger: AtomicUsize,
    swept: AtomicU64,
}

impl LocalStore {
    /// Create a store with the default sweep threshold.
    pub fn new() -> Self {
        Self::with_sweep_threshold(DEFAULT_SWEEP_THRESHOLD)
    }

    /// Create a store that sweeps idle buckets once it holds more than
    /// `sweep_threshold` keys.
    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            sweep_threshold,
            sweep_trigger: AtomicUsize::new(sweep_threshold),
            swept: AtomicU64::new(0),
        }
    }

    /// Prune, decide and record one request for `key` at `now_ms`.
    pub fn record(&self, key: &RateLimitKey, now_ms: u64, spec: WindowSpec) -> WindowOutcome {
        if self.buckets.len() > self.sweep_trigger.load(Ordering::Relaxed) {
            self.sweep(now_ms);
        }

        let mut bucket = self.buckets.entry(key.to_store_key()).or_default();
        bucket.window_ms = spec.window_ms;
        bucket.prune(now_ms);

        let admitted = bucket.count() < spec.max_requests;
        if admitted {
            bucket.admitted.push_back(now_ms);
        } else {
            bucket.denied.push_back(now_ms);
        }

        trace!(
            key = %key,
            count = bucket.count(),
            denied = bucket.denied.len(),
            admitted = admitted,
            "Recorded request in local window"
        );

        WindowOutcome {
            admitted,
            count: bucket.count(),
            oldest_admitted_ms: bucket.admitted.front().copied(),
        }
    }

    /// Remove every bucket whose newest entry has left its window.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_idle(now_ms));
        let remaining = self.buckets.len();
        let removed = before.saturating_sub(remaining);

        self.sweep_trigger.store(
            self.sweep_threshold.max(remaining.saturating_mul(2)),
            Ordering::Relaxed,
        );

        if removed > 0 {
            self.swept.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(
                removed = removed,
                remaining = remaining,
                "Swept idle local rate limit buckets"
            );
        }
        removed
    }

    /// Admitted requests currently counted for `key`, after pruning.
    pub fn current_count(&self, key: &RateLimitKey, now_ms: u64) -> u64 {
        match self.buckets.get_mut(&key.to_store_key()) {
            Some(mut bucket) => {
                bucket.prune(now_ms);
                bucket.count()
            }
            None => 0,
        }
    }

    /// Denied requests currently held for `key`, after pruning.
    pub fn denied_count(&self, key: &RateLimitKey, now_ms: u64) -> u64 {
        match self.buckets.get_mut(&key.to_store_key()) {
            Some(mut bucket) => {
                bucket.prune(now_ms);
                bucket.denied.len() as u64
            }
            None => 0,
        }
    }

    /// Number of buckets currently held, idle or not.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total buckets removed by sweeps since creation.
    pub fn swept_total(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for LocalStore {
    async fn check_and_record(
        &self,
        key: &RateLimitKey,
        now_ms: u64,
        spec: WindowSpec,
    ) -> Result<WindowOutcome, StoreError> {
        Ok(self.record(key, now_ms, spec))
    }

    fn backend(&self) -> Backend {
        Backend::Local
    }
}

//! The rate limit decision engine.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::backend::{Backend, Connector};
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::distributed::RedisConnector;
use super::failover::{ConnectionState, FailoverSettings, StoreSelector};
use super::local::LocalStore;
use super::policy::{Policy, RateLimitKey};
use super::presets::PolicyTable;
use crate::config::QuotaGuardConfig;
use crate::error::{QuotaError, Result};

/// Checks callers against quota policies.
///
/// Thread-safe; share it behind an `Arc` across tasks. Decisions go to the
/// distributed store while it is healthy and to the per-process local store
/// otherwise, so a decision is always produced.
pub struct RateLimiter {
    selector: StoreSelector,
    clock: Arc<dyn Clock>,
    policies: PolicyTable,
    degraded: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Point-in-time view of the limiter for operators.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    /// Whether a distributed store is configured
    pub configured: bool,
    /// Connection state of the distributed store
    pub connection: ConnectionState,
    /// The store that would serve the next decision
    pub backend: Backend,
    /// Buckets currently held by the local store
    pub local_buckets: usize,
    /// Idle buckets removed by sweeping so far
    pub swept_buckets: u64,
}

impl RateLimiter {
    /// Create a limiter around an existing store selector.
    pub fn new(selector: StoreSelector) -> Self {
        Self {
            selector,
            clock: Arc::new(SystemClock),
            policies: PolicyTable::presets(),
            degraded: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// A limiter that only uses the in-process store.
    pub fn local() -> Self {
        Self::new(StoreSelector::local_only(Arc::new(LocalStore::new())))
    }

    /// A limiter preferring the distributed store produced by `connector`.
    pub fn with_connector(connector: Arc<dyn Connector>, settings: FailoverSettings) -> Self {
        Self::new(StoreSelector::with_connector(
            Arc::new(LocalStore::new()),
            connector,
            settings,
        ))
    }

    /// Build a limiter from loaded configuration. No connection is opened
    /// until the first decision or an explicit [`RateLimiter::connect`].
    pub fn from_config(config: &QuotaGuardConfig) -> Result<Self> {
        let local = Arc::new(LocalStore::with_sweep_threshold(config.local.sweep_threshold));

        let selector = match config.store.url() {
            Some(url) => {
                let connector = RedisConnector::new(url);
                info!(endpoint = %connector.describe(), "Distributed rate limit store configured");
                StoreSelector::with_connector(
                    local,
                    Arc::new(connector),
                    config.store.failover_settings(),
                )
            }
            None => {
                info!("No distributed store configured; rate limits apply per process");
                StoreSelector::local_only(local)
            }
        };

        let policies = PolicyTable::from_config(&config.policies)?;
        Ok(Self::new(selector).with_policies(policies))
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the policy table.
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Check one request from `identifier` against `policy` and record it.
    ///
    /// Store failures never surface here; they are absorbed by the local
    /// fallback. The only error is an empty identifier.
    #[instrument(skip(self, policy), fields(prefix = %policy.key_prefix()))]
    pub async fn check_rate_limit(&self, identifier: &str, policy: &Policy) -> Result<Decision> {
        if identifier.is_empty() {
            return Err(QuotaError::MissingIdentifier);
        }

        let key = RateLimitKey::new(policy.key_prefix(), identifier);
        let now_ms = self.clock.now_ms();
        let spec = policy.window_spec();

        let routed = self.selector.check_and_record(&key, now_ms, spec).await;
        self.track_backend(routed.backend);

        let decision = Decision::from_outcome(&routed.outcome, spec, now_ms);
        match &decision {
            Decision::Allowed { remaining, .. } => {
                trace!(key = %key, remaining = remaining, backend = ?routed.backend, "Request allowed");
            }
            Decision::Throttled {
                retry_after_secs, ..
            } => {
                debug!(
                    key = %key,
                    retry_after_secs = retry_after_secs,
                    backend = ?routed.backend,
                    "Rate limit exceeded"
                );
            }
        }

        Ok(decision)
    }

    /// Log transitions between shared and per-process enforcement once each.
    fn track_backend(&self, backend: Backend) {
        if !self.selector.is_configured() || self.selector.state() == ConnectionState::Connecting {
            return;
        }
        let degraded = backend == Backend::Local;
        if self.degraded.swap(degraded, Ordering::Relaxed) != degraded {
            if degraded {
                warn!("Rate limit decisions are being served by the local fallback store");
            } else {
                info!("Rate limit decisions are served by the distributed store again");
            }
        }
    }

    pub fn status(&self) -> LimiterStatus {
        let local = self.selector.local();
        LimiterStatus {
            configured: self.selector.is_configured(),
            connection: self.selector.state(),
            backend: self.selector.active_backend(),
            local_buckets: local.bucket_count(),
            swept_buckets: local.swept_total(),
        }
    }

    /// Admitted requests currently held in the local store for a bucket.
    pub fn local_count(&self, identifier: &str, policy: &Policy) -> u64 {
        let key = RateLimitKey::new(policy.key_prefix(), identifier);
        self.selector.local().current_count(&key, self.clock.now_ms())
    }

    /// Connect to the distributed store now instead of on first use.
    pub async fn connect(&self) -> bool {
        self.selector.connect_now().await
    }

    /// Re-arm connection attempts after reconnection gave up.
    pub fn reconnect(&self) -> bool {
        self.selector.reconnect()
    }

    /// Periodically drop idle local buckets. Replaces any running sweeper.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let local = Arc::clone(self.selector.local());
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = local.sweep(clock.now_ms());
                if removed > 0 {
                    debug!(removed = removed, remaining = local.bucket_count(), "Swept idle buckets");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        debug!(interval_secs = interval.as_secs(), "Local store sweeper started");
    }

    /// Stop background work and close the distributed connection.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.selector.shutdown().await;
        info!("Rate limiter shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::testing::MockConnector;
    use crate::ratelimit::ManualClock;
    use futures::future::join_all;

    fn policy(window_ms: u64, max_requests: u64) -> Policy {
        Policy::from_millis(window_ms, max_requests, "rl:test").unwrap()
    }

    fn manual_limiter(start_ms: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let limiter = RateLimiter::local().with_clock(clock.clone());
        (limiter, clock)
    }

    fn fast_settings() -> FailoverSettings {
        FailoverSettings {
            connect_timeout: Duration::from_millis(100),
            operation_timeout: Duration::from_millis(50),
            failure_threshold: 1,
            max_reconnect_attempts: 1,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_three_per_minute_scenario() {
        let (limiter, clock) = manual_limiter(0);
        let policy = policy(60_000, 3);

        for t in 0..3 {
            clock.set(t);
            let decision = limiter.check_rate_limit("A", &policy).await.unwrap();
            assert!(decision.is_allowed(), "call at t={} should be allowed", t);
        }

        clock.set(3);
        let decision = limiter.check_rate_limit("A", &policy).await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(decision.retry_after_secs(), Some(60));
        assert_eq!(decision.status_code(), 429);

        // Denials do not consume budget, so the first entry leaving frees a slot.
        clock.set(60_001);
        let decision = limiter.check_rate_limit("A", &policy).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let (limiter, _clock) = manual_limiter(1_000);
        let policy = policy(10_000, 3);

        let remaining: Vec<u64> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(limiter.check_rate_limit("A", &policy).await.unwrap().remaining());
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);
        assert_eq!(limiter.local_count("A", &policy), 3);
    }

    #[tokio::test]
    async fn test_waiting_retry_after_is_enough() {
        let (limiter, clock) = manual_limiter(10_000);
        let policy = policy(5_500, 1);

        assert!(limiter.check_rate_limit("A", &policy).await.unwrap().is_allowed());

        clock.set(12_000);
        let decision = limiter.check_rate_limit("A", &policy).await.unwrap();
        let retry = decision.retry_after_secs().unwrap();
        // Oldest admitted at 10_000 leaves at 15_500: 3.5s away, rounded up.
        assert_eq!(retry, 4);

        clock.advance(Duration::from_secs(retry));
        assert!(limiter.check_rate_limit("A", &policy).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let (limiter, _clock) = manual_limiter(0);
        let policy = policy(60_000, 1);

        assert!(limiter.check_rate_limit("A", &policy).await.unwrap().is_allowed());
        assert!(!limiter.check_rate_limit("A", &policy).await.unwrap().is_allowed());
        assert!(limiter.check_rate_limit("B", &policy).await.unwrap().is_allowed());

        let other = Policy::from_millis(60_000, 1, "rl:other").unwrap();
        assert!(limiter.check_rate_limit("A", &other).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_empty_identifier_is_rejected() {
        let limiter = RateLimiter::local();
        let err = limiter.check_rate_limit("", &policy(1_000, 1)).await.unwrap_err();
        assert!(matches!(err, QuotaError::MissingIdentifier));
        assert_eq!(limiter.status().local_buckets, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let (limiter, _clock) = manual_limiter(5_000);
        let limiter = Arc::new(limiter);
        let policy = policy(60_000, 5);

        let calls = (0..40).map(|_| {
            let limiter = Arc::clone(&limiter);
            let policy = policy.clone();
            tokio::spawn(async move { limiter.check_rate_limit("A", &policy).await })
        });

        let allowed = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(Decision::is_allowed)
            .count();
        assert_eq!(allowed, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_against_shared_store() {
        let connector = MockConnector::new(true);
        let limiter = Arc::new(
            RateLimiter::with_connector(connector.clone(), fast_settings())
                .with_clock(Arc::new(ManualClock::new(0))),
        );
        assert!(limiter.connect().await);
        let policy = policy(60_000, 7);

        let calls = (0..30).map(|_| {
            let limiter = Arc::clone(&limiter);
            let policy = policy.clone();
            tokio::spawn(async move { limiter.check_rate_limit("A", &policy).await })
        });

        let allowed = join_all(calls)
            .await
            .into_iter()
            .filter(|joined| matches!(joined, Ok(Ok(d)) if d.is_allowed()))
            .count();
        assert_eq!(allowed, 7);
        assert_eq!(limiter.status().local_buckets, 0);
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_mid_run() {
        let connector = MockConnector::new(true);
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_connector(connector.clone(), fast_settings())
            .with_clock(clock.clone());
        let policy = policy(60_000, 3);
        assert!(limiter.connect().await);

        for t in 0..2 {
            clock.set(t);
            assert!(limiter.check_rate_limit("A", &policy).await.unwrap().is_allowed());
        }
        assert_eq!(limiter.status().backend, Backend::Distributed);

        connector.store.set_failing(true);

        // The local store starts empty and enforces the policy from here on.
        for t in 2..5 {
            clock.set(t);
            let decision = limiter.check_rate_limit("A", &policy).await.unwrap();
            assert!(decision.is_allowed(), "call at t={} should be allowed", t);
        }
        clock.set(5);
        assert!(!limiter.check_rate_limit("A", &policy).await.unwrap().is_allowed());

        let status = limiter.status();
        assert!(status.configured);
        assert_eq!(status.backend, Backend::Local);
        assert_eq!(limiter.local_count("A", &policy), 3);

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_store_never_errors() {
        let connector = MockConnector::new(false);
        let limiter = RateLimiter::with_connector(connector.clone(), fast_settings())
            .with_clock(Arc::new(ManualClock::new(0)));
        let policy = policy(60_000, 2);

        let decision = tokio_test::assert_ok!(limiter.check_rate_limit("A", &policy).await);
        assert!(decision.is_allowed());

        // The lazy attempt fails in the background and hands over to reconnecting.
        for _ in 0..200 {
            if connector.attempts() >= 1
                && matches!(limiter.status().connection, ConnectionState::Reconnecting { .. })
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(connector.attempts() >= 1);
        assert!(matches!(
            limiter.status().connection,
            ConnectionState::Reconnecting { .. }
        ));

        limiter.shutdown().await;
        assert_eq!(limiter.status().connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_sweeper_removes_idle_buckets() {
        let (limiter, clock) = manual_limiter(0);
        let policy = policy(1_000, 5);

        limiter.check_rate_limit("A", &policy).await.unwrap();
        limiter.check_rate_limit("B", &policy).await.unwrap();
        assert_eq!(limiter.status().local_buckets, 2);

        clock.set(10_000);
        limiter.spawn_sweeper(Duration::from_millis(10));
        for _ in 0..100 {
            if limiter.status().local_buckets == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = limiter.status();
        assert_eq!(status.local_buckets, 0);
        assert_eq!(status.swept_buckets, 2);

        limiter.shutdown().await;
    }

    #[test]
    fn test_from_config_without_url_is_local() {
        let limiter = RateLimiter::from_config(&QuotaGuardConfig::default()).unwrap();
        let status = limiter.status();
        assert!(!status.configured);
        assert_eq!(status.backend, Backend::Local);
        assert!(limiter.policies().get("email").is_ok());
    }

    #[test]
    fn test_status_serializes() {
        let limiter = RateLimiter::local();
        let json = serde_json::to_value(limiter.status()).unwrap();
        assert_eq!(json["configured"], false);
        assert_eq!(json["connection"]["state"], "disconnected");
        assert_eq!(json["backend"], "local");
    }
}

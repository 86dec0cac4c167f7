//! Store selection and distributed connection lifecycle.
//!
//! The selector owns a lazily created handle to the distributed store and
//! decides, per call, whether the distributed store or the local fallback
//! serves it:
//!
//! ```text
//! Disconnected ──first call──► Connecting ──ok──► Connected
//!      ▲                            │                 │ failures >= threshold
//!      │ attempts exhausted         │ failed          ▼
//!      └──────────────────────── Reconnecting ◄───────┘
//! ```
//!
//! Every state except `Connected` serves decisions from the local store
//! without waiting on the network. Connect attempts and transactions each
//! run under their own timeout.

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{Backend, Connector, WindowOutcome, WindowStore};
use super::local::LocalStore;
use super::policy::{RateLimitKey, WindowSpec};
use crate::error::StoreError;

/// Connection state of the distributed store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live connection. Either nothing has tried yet, or reconnection gave
    /// up and the selector waits for an explicit reconnect.
    #[default]
    Disconnected,
    /// The first connection attempt is in flight.
    Connecting,
    /// Decisions go to the distributed store.
    Connected,
    /// A background task is retrying with backoff.
    Reconnecting { attempt: u32 },
}

/// Timeouts and retry bounds for the distributed store.
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Bound on a single check-and-record transaction
    pub operation_timeout: Duration,
    /// Consecutive operation failures before the connection is torn down
    pub failure_threshold: u32,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt
    pub backoff_base: Duration,
    /// Upper bound on any reconnect delay
    pub backoff_max: Duration,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_millis(500),
            failure_threshold: 3,
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl FailoverSettings {
    /// Delay before reconnect `attempt` (1-based), doubled per attempt,
    /// capped, with up to 20% jitter either way.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.backoff_base.saturating_mul(1u32 << exp);
        let capped = base.min(self.backoff_max);

        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        capped.mul_f64(jitter).min(self.backoff_max)
    }
}

#[derive(Default)]
struct Link {
    state: ConnectionState,
    store: Option<Arc<dyn WindowStore>>,
    consecutive_failures: u32,
    exhausted: bool,
    shut_down: bool,
}

enum Route {
    Distributed(Arc<dyn WindowStore>),
    Connect,
    Local,
}

struct SelectorInner {
    local: Arc<LocalStore>,
    connector: Option<Arc<dyn Connector>>,
    settings: FailoverSettings,
    link: Mutex<Link>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// Routes each decision to the distributed store or the local fallback.
#[derive(Clone)]
pub struct StoreSelector {
    inner: Arc<SelectorInner>,
}

/// A store outcome together with the store that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routed {
    pub outcome: WindowOutcome,
    pub backend: Backend,
}

impl StoreSelector {
    /// A selector that only ever uses the local store.
    pub fn local_only(local: Arc<LocalStore>) -> Self {
        Self::build(local, None, FailoverSettings::default())
    }

    /// A selector that prefers the store produced by `connector`.
    pub fn with_connector(
        local: Arc<LocalStore>,
        connector: Arc<dyn Connector>,
        settings: FailoverSettings,
    ) -> Self {
        Self::build(local, Some(connector), settings)
    }

    fn build(
        local: Arc<LocalStore>,
        connector: Option<Arc<dyn Connector>>,
        settings: FailoverSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                local,
                connector,
                settings,
                link: Mutex::new(Link::default()),
                connect_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    /// Whether a distributed store is configured at all.
    pub fn is_configured(&self) -> bool {
        self.inner.connector.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// The store that would serve a decision right now.
    pub fn active_backend(&self) -> Backend {
        match self.state() {
            ConnectionState::Connected => Backend::Distributed,
            _ => Backend::Local,
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.inner.local
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.inner.settings
    }

    /// Record one request for `key`, falling back to the local store on any
    /// distributed failure. Never fails and never waits on a connection
    /// attempt: the first call starts connecting in the background and is
    /// served locally.
    pub async fn check_and_record(&self, key: &RateLimitKey, now_ms: u64, spec: WindowSpec) -> Routed {
        let store = match self.inner.route() {
            Route::Distributed(store) => store,
            Route::Connect => {
                self.inner.begin_connect();
                return self.local_outcome(key, now_ms, spec);
            }
            Route::Local => return self.local_outcome(key, now_ms, spec),
        };

        let result = match tokio::time::timeout(
            self.inner.settings.operation_timeout,
            store.check_and_record(key, now_ms, spec),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.inner.settings.operation_timeout)),
        };

        match result {
            Ok(outcome) => {
                self.inner.on_success();
                Routed {
                    outcome,
                    backend: store.backend(),
                }
            }
            Err(err) => {
                self.inner.on_failure(&store, &err);
                self.local_outcome(key, now_ms, spec)
            }
        }
    }

    fn local_outcome(&self, key: &RateLimitKey, now_ms: u64, spec: WindowSpec) -> Routed {
        Routed {
            outcome: self.inner.local.record(key, now_ms, spec),
            backend: self.inner.local.backend(),
        }
    }

    /// Attempt a connection now, regardless of state, and report whether
    /// the distributed store is in use afterwards.
    pub async fn connect_now(&self) -> bool {
        if self.inner.connector.is_none() {
            return false;
        }
        if self.state() == ConnectionState::Connected {
            return true;
        }
        {
            let mut link = self.inner.link.lock();
            if link.shut_down {
                return false;
            }
            link.exhausted = false;
        }

        match self.inner.connect_once().await {
            Ok(store) => {
                if self.inner.on_connected(store.clone()) {
                    self.inner.abort_background();
                    true
                } else {
                    store.close().await;
                    self.state() == ConnectionState::Connected
                }
            }
            Err(err) => {
                warn!(error = %err, "Distributed rate limit store connection attempt failed");
                false
            }
        }
    }

    /// Re-arm connection attempts after reconnection gave up.
    ///
    /// The next decision connects lazily. Returns `false` when there is
    /// nothing to re-arm.
    pub fn reconnect(&self) -> bool {
        if self.inner.connector.is_none() {
            return false;
        }
        let mut link = self.inner.link.lock();
        if link.shut_down || link.state != ConnectionState::Disconnected {
            return false;
        }
        link.exhausted = false;
        link.consecutive_failures = 0;
        info!("Distributed rate limit store re-armed for reconnection");
        true
    }

    /// Stop reconnecting and close the distributed connection.
    pub async fn shutdown(&self) {
        self.inner.abort_background();

        let store = {
            let mut link = self.inner.link.lock();
            link.shut_down = true;
            link.state = ConnectionState::Disconnected;
            link.store.take()
        };

        if let Some(store) = store {
            store.close().await;
        }
        debug!("Store selector shut down");
    }
}

impl SelectorInner {
    fn route(&self) -> Route {
        if self.connector.is_none() {
            return Route::Local;
        }

        let mut link = self.link.lock();
        let state = link.state;
        match state {
            ConnectionState::Connected => match &link.store {
                Some(store) => Route::Distributed(store.clone()),
                None => Route::Local,
            },
            ConnectionState::Disconnected if !link.exhausted && !link.shut_down => {
                link.state = ConnectionState::Connecting;
                Route::Connect
            }
            _ => Route::Local,
        }
    }

    async fn connect_once(&self) -> Result<Arc<dyn WindowStore>, StoreError> {
        let connector = self.connector.as_ref().ok_or(StoreError::NotConfigured)?;

        debug!(endpoint = %connector.describe(), "Connecting to distributed rate limit store");
        match tokio::time::timeout(self.settings.connect_timeout, connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.settings.connect_timeout)),
        }
    }

    /// Install a fresh connection. Returns `false` if shutdown or another
    /// connection won the race.
    fn on_connected(&self, store: Arc<dyn WindowStore>) -> bool {
        let mut link = self.link.lock();
        if link.shut_down || link.state == ConnectionState::Connected {
            return false;
        }
        link.state = ConnectionState::Connected;
        link.store = Some(store);
        link.consecutive_failures = 0;
        link.exhausted = false;

        info!(
            endpoint = %self.connector.as_ref().map(|c| c.describe()).unwrap_or_default(),
            "Distributed rate limit store connected"
        );
        true
    }

    fn on_success(&self) {
        let mut link = self.link.lock();
        link.consecutive_failures = 0;
    }

    fn on_failure(self: &Arc<Self>, store: &Arc<dyn WindowStore>, err: &StoreError) {
        let stale = {
            let mut link = self.link.lock();
            let current = matches!(&link.store, Some(s) if Arc::ptr_eq(s, store));
            if !current || link.state != ConnectionState::Connected {
                return;
            }

            link.consecutive_failures += 1;
            warn!(
                error = %err,
                consecutive_failures = link.consecutive_failures,
                threshold = self.settings.failure_threshold,
                "Distributed rate limit operation failed, served by local fallback"
            );

            if link.consecutive_failures < self.settings.failure_threshold
                && !err.is_connection_level()
            {
                return;
            }
            link.store.take()
        };

        self.begin_reconnect(stale);
    }

    /// Make the lazy first connection attempt off the caller's path.
    fn begin_connect(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match inner.connect_once().await {
                Ok(store) => {
                    if !inner.on_connected(store.clone()) {
                        store.close().await;
                    }
                }
                Err(err) => {
                    // An explicit connect may have succeeded meanwhile.
                    if inner.link.lock().state != ConnectionState::Connecting {
                        return;
                    }
                    warn!(
                        error = %err,
                        "Distributed rate limit store unavailable, using local fallback"
                    );
                    inner.begin_reconnect(None);
                }
            }
        });

        if let Some(previous) = self.connect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn begin_reconnect(self: &Arc<Self>, stale: Option<Arc<dyn WindowStore>>) {
        {
            let mut link = self.link.lock();
            if link.shut_down || matches!(link.state, ConnectionState::Reconnecting { .. }) {
                return;
            }
            link.state = ConnectionState::Reconnecting { attempt: 0 };
            link.store = None;
        }

        warn!(
            max_attempts = self.settings.max_reconnect_attempts,
            "Rate limiting degraded to per-process local store; limits are no longer shared across instances"
        );

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Some(stale) = stale {
                stale.close().await;
            }
            inner.reconnect_loop().await;
        });

        if let Some(previous) = self.reconnect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn reconnect_loop(&self) {
        for attempt in 1..=self.settings.max_reconnect_attempts {
            let delay = self.settings.backoff_delay(attempt);
            {
                let mut link = self.link.lock();
                if link.shut_down {
                    return;
                }
                link.state = ConnectionState::Reconnecting { attempt };
            }
            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            tokio::time::sleep(delay).await;

            match self.connect_once().await {
                Ok(store) => {
                    if !self.on_connected(store.clone()) {
                        store.close().await;
                    }
                    return;
                }
                Err(err) => {
                    warn!(attempt = attempt, error = %err, "Reconnect to distributed rate limit store failed");
                }
            }
        }

        let mut link = self.link.lock();
        if link.shut_down {
            return;
        }
        link.state = ConnectionState::Disconnected;
        link.exhausted = true;
        error!(
            attempts = self.settings.max_reconnect_attempts,
            "Giving up on distributed rate limit store; local fallback stays in effect until reconnect"
        );
    }

    fn abort_background(&self) {
        for task in [&self.connect_task, &self.reconnect_task] {
            if let Some(handle) = task.lock().take() {
                handle.abort();
            }
        }
    }
}

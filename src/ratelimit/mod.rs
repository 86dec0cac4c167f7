//! Rate limiting logic and state management.

mod backend;
mod clock;
mod decision;
mod distributed;
mod failover;
mod limiter;
mod local;
mod policy;
pub mod presets;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Backend, Connector, WindowOutcome, WindowStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, TOO_MANY_REQUESTS};
pub use distributed::{redact_url, RedisConnector, RedisStore};
pub use failover::{ConnectionState, FailoverSettings, Routed, StoreSelector};
pub use limiter::{LimiterStatus, RateLimiter};
pub use local::{LocalStore, DEFAULT_SWEEP_THRESHOLD};
pub use policy::{Policy, PolicyConfig, RateLimitKey, WindowSpec};
pub use presets::{ClientIdentity, PolicyTable, Preset, UNKNOWN_IDENTIFIER};

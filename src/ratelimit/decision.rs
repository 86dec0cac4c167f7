//! The admission decision returned to callers.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::backend::WindowOutcome;
use super::policy::WindowSpec;

/// HTTP status a web layer should answer a throttled request with.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request was admitted and recorded.
    Allowed {
        /// Requests admitted per window
        limit: u64,
        /// Requests still admissible in the current window
        remaining: u64,
    },
    /// The request was denied. It is still recorded in the bucket.
    Throttled {
        /// Whole seconds until a retry is admitted
        retry_after_secs: u64,
        /// Requests admitted per window
        limit: u64,
        /// When the oldest admitted request leaves the window
        reset_at: DateTime<Utc>,
    },
}

impl Decision {
    /// Turn a store outcome into a decision.
    ///
    /// A throttled caller is told to come back when the oldest admitted
    /// entry slides out of the window, rounded up to whole seconds.
    pub fn from_outcome(outcome: &WindowOutcome, spec: WindowSpec, now_ms: u64) -> Self {
        if outcome.admitted {
            return Decision::Allowed {
                limit: spec.max_requests,
                remaining: spec.max_requests.saturating_sub(outcome.count),
            };
        }

        let reset_ms = outcome
            .oldest_admitted_ms
            .map(|oldest| oldest.saturating_add(spec.window_ms))
            .unwrap_or_else(|| now_ms.saturating_add(spec.window_ms));
        let retry_after_secs = reset_ms.saturating_sub(now_ms).div_ceil(1000).max(1);
        let reset_at = DateTime::from_timestamp_millis(reset_ms as i64).unwrap_or_default();

        Decision::Throttled {
            retry_after_secs,
            limit: spec.max_requests,
            reset_at,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn limit(&self) -> u64 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Throttled { limit, .. } => *limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Throttled { .. } => 0,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Throttled {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }

    /// Status code for the HTTP layer: 200 when admitted, 429 otherwise.
    pub fn status_code(&self) -> u16 {
        if self.is_allowed() {
            200
        } else {
            TOO_MANY_REQUESTS
        }
    }

    /// Response headers for the HTTP layer.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Decision::Allowed { limit, remaining } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", remaining.to_string()),
            ],
            Decision::Throttled {
                retry_after_secs,
                limit,
                reset_at,
            } => vec![
                ("Retry-After", retry_after_secs.to_string()),
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", reset_at.timestamp().to_string()),
            ],
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at: Option<DateTime<Utc>>,
}

impl Serialize for Decision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = match self {
            Decision::Allowed { .. } => DecisionBody {
                allowed: true,
                retry_after_seconds: None,
                limit: None,
                remaining: None,
                reset_at: None,
            },
            Decision::Throttled {
                retry_after_secs,
                limit,
                reset_at,
            } => DecisionBody {
                allowed: false,
                retry_after_seconds: Some(*retry_after_secs),
                limit: Some(*limit),
                remaining: Some(0),
                reset_at: Some(*reset_at),
            },
        };
        body.serialize(serializer)
    }
}

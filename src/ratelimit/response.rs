//! Values handed back to the HTTP layer: observability headers and the
//! body of a 429 response.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::counter::StoredRateLimit;
use super::limiter::Verdict;

/// HTTP status of a denied request.
pub const TOO_MANY_REQUESTS: u16 = 429;

const TOO_MANY_REQUESTS_TEXT: &str = "Too Many Requests";

/// Rate limit headers for a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub hits: u64,
    /// Window expiry, RFC 3339
    pub until: String,
    /// Seconds until the window expires
    pub retry_after: u64,
}

impl RateLimitHeaders {
    pub fn from_stored(stored: &StoredRateLimit, now: DateTime<Utc>) -> Self {
        Self {
            limit: stored.limit(),
            hits: stored.hits(),
            until: stored.valid_until_rfc3339(),
            retry_after: stored.retry_after(now),
        }
    }

    /// Header name/value pairs in the order they should be written.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-rate-limit", self.limit.to_string()),
            ("x-rate-limit-hits", self.hits.to_string()),
            ("x-rate-limit-until", self.until.clone()),
            ("retry-after", self.retry_after.to_string()),
        ]
    }
}

/// A 429 response ready to be written by the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TooManyRequests {
    pub status: u16,
    /// JSON body
    pub body: Value,
}

impl TooManyRequests {
    /// Build the rejection for a denied verdict. With `detailed` the body is
    /// the full limit-reached payload, otherwise only the status text.
    pub fn from_verdict(verdict: &Verdict, detailed: bool) -> Option<Self> {
        let payload = verdict.limit_reached()?;
        let body = if detailed {
            json!({
                "message": payload.message,
                "limit": payload.limit,
                "period": payload.period,
                "until": payload.until,
                "vary": payload.vary,
            })
        } else {
            Value::from(TOO_MANY_REQUESTS_TEXT)
        };

        Some(Self {
            status: TOO_MANY_REQUESTS,
            body,
        })
    }
}

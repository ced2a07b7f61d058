//! Persisted rate limit counter.

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;

use super::descriptor::{Fingerprint, RateLimit};
use crate::error::RateLimitError;

/// The counter persisted for one fingerprint during one window.
///
/// Records are never mutated in place: every hit produces a new value via
/// [`StoredRateLimit::with_hits`], and the storage swaps it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRateLimit {
    fingerprint: Fingerprint,
    discriminator: String,
    limit: u64,
    period: u64,
    hits: u64,
    valid_until: DateTime<Utc>,
}

/// Payload returned to the client when the limit is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitReached {
    pub message: String,
    pub limit: u64,
    pub period: u64,
    /// Window expiry, RFC 3339
    pub until: String,
    /// Discriminator of the limited request
    pub vary: String,
}

impl StoredRateLimit {
    /// Create a record for `rate_limit` with an explicit hit count and expiry.
    pub fn new(
        rate_limit: &RateLimit,
        hits: u64,
        valid_until: DateTime<Utc>,
    ) -> Result<Self, RateLimitError> {
        let discriminator = rate_limit.discriminator()?;
        Ok(Self {
            fingerprint: Fingerprint::of(&discriminator),
            discriminator,
            limit: rate_limit.limit(),
            period: rate_limit.period(),
            hits,
            valid_until,
        })
    }

    /// Open a fresh window at `now`: one hit, expiring `period` seconds later.
    ///
    /// Windows are aligned to whole seconds.
    pub fn open_window(rate_limit: &RateLimit, now: DateTime<Utc>) -> Result<Self, RateLimitError> {
        let valid_until = window_end(now.trunc_subsecs(0), rate_limit.period());
        Self::new(rate_limit, 1, valid_until)
    }

    /// Rebuild a record from its persisted fields.
    pub fn from_parts(
        discriminator: String,
        limit: u64,
        period: u64,
        hits: u64,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint: Fingerprint::of(&discriminator),
            discriminator,
            limit,
            period,
            hits,
            valid_until,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    /// Limit copied from the rate limit that opened the window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    /// A copy of this record with a different hit count.
    pub fn with_hits(&self, hits: u64) -> Self {
        Self {
            hits,
            ..self.clone()
        }
    }

    /// Whether the window is over. The expiry instant itself is outdated.
    pub fn is_outdated(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    /// Whole seconds until the window expires, rounded up, never negative.
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.valid_until - now;
        if remaining <= Duration::zero() {
            return 0;
        }
        ((remaining.num_milliseconds() + 999) / 1000) as u64
    }

    /// Window expiry formatted as RFC 3339 with a numeric offset.
    pub fn valid_until_rfc3339(&self) -> String {
        self.valid_until.to_rfc3339_opts(SecondsFormat::Secs, false)
    }

    /// Body returned with a rejected request.
    pub fn limit_reached(&self) -> LimitReached {
        LimitReached {
            message: format!(
                "Too many requests. Only {} calls allowed every {} seconds.",
                self.limit, self.period
            ),
            limit: self.limit,
            period: self.period,
            until: self.valid_until_rfc3339(),
            vary: self.discriminator.clone(),
        }
    }
}

/// `start + period`, saturating at the latest representable time.
fn window_end(start: DateTime<Utc>, period: u64) -> DateTime<Utc> {
    i64::try_from(period)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::backend::{RateLimitStorage, StorageResult};
use super::clock::{Clock, SystemClock};
use super::counter::{LimitReached, StoredRateLimit};
use super::descriptor::RateLimit;
use super::response::RateLimitHeaders;
use crate::error::{Result, StorageError};

/// How often one check may go back to the storage after losing a race on
/// window creation or increment.
const MAX_RETRIES: usize = 2;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allow,
    /// The limit is reached; answer with 429
    Deny,
}

/// The decision for one request together with the counter it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    /// The record after this request's hit was counted
    pub stored: StoredRateLimit,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    /// Rejection payload, present only for denied requests.
    pub fn limit_reached(&self) -> Option<LimitReached> {
        match self.decision {
            Decision::Allow => None,
            Decision::Deny => Some(self.stored.limit_reached()),
        }
    }

    /// Observability headers for the response.
    pub fn headers(&self, now: DateTime<Utc>) -> RateLimitHeaders {
        RateLimitHeaders::from_stored(&self.stored, now)
    }
}

/// Fixed-window rate limiter.
///
/// The limiter is stateless; every counter lives in the storage, which is
/// shared by all concurrent checks. One check is a read followed by a
/// create-or-increment, so the decision for a request racing others on the
/// same fingerprint may be taken on a hit count that is one or more behind.
/// A check that loses a creation race counts against the window the winner
/// opened, after re-checking its expiry; one that finds its window gone at
/// increment time opens a new one. Both retries are bounded by
/// `MAX_RETRIES`, after which the storage error is returned.
pub struct RateLimiter {
    storage: Arc<dyn RateLimitStorage>,
    clock: Arc<dyn Clock>,
    storage_timeout: Option<Duration>,
}

impl RateLimiter {
    /// Create a limiter over the given storage, using the system clock.
    pub fn new(storage: Arc<dyn RateLimitStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock::new()))
    }

    /// Create a limiter with an explicit clock for expiry checks.
    pub fn with_clock(storage: Arc<dyn RateLimitStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            storage_timeout: None,
        }
    }

    /// Bound every storage call; a call that takes longer fails with
    /// [`StorageError::Timeout`].
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = Some(timeout);
        self
    }

    /// Current time according to the limiter's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Check the rate limit attached to a request, if any.
    ///
    /// A request without a rate limit passes through: no storage call is
    /// made and `None` is returned.
    pub async fn check(&self, rate_limit: Option<&RateLimit>) -> Result<Option<Verdict>> {
        match rate_limit {
            Some(rate_limit) => self.enforce(rate_limit).await.map(Some),
            None => Ok(None),
        }
    }

    /// Count one hit for `rate_limit` and decide whether it is allowed.
    ///
    /// Storage failures are returned as errors, never turned into a
    /// decision; whether to fail open is the caller's policy.
    pub async fn enforce(&self, rate_limit: &RateLimit) -> Result<Verdict> {
        let fingerprint = rate_limit.hash()?;

        trace!(
            fingerprint = %fingerprint,
            limit = rate_limit.limit(),
            period = rate_limit.period(),
            "Checking rate limit"
        );

        let mut current = self.bounded(self.storage.get_stored(rate_limit)).await?;
        let mut retries = 0;

        loop {
            if let Some(existing) = current.take() {
                if !existing.is_outdated(self.clock.now()) {
                    // The request that brings hits to the limit is the last one allowed.
                    let decision = if existing.hits() >= rate_limit.limit() {
                        Decision::Deny
                    } else {
                        Decision::Allow
                    };

                    match self.bounded(self.storage.increment_hits(&existing)).await {
                        Ok(stored) => {
                            if decision == Decision::Deny {
                                debug!(
                                    fingerprint = %fingerprint,
                                    hits = stored.hits(),
                                    limit = rate_limit.limit(),
                                    "Rate limit exceeded"
                                );
                            }
                            return Ok(Verdict { decision, stored });
                        }
                        Err(StorageError::NotFound(_)) if retries < MAX_RETRIES => {
                            retries += 1;
                            debug!(fingerprint = %fingerprint, "Window vanished before increment");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                debug!(
                    fingerprint = %fingerprint,
                    hits = existing.hits(),
                    valid_until = %existing.valid_until(),
                    "Window expired"
                );
                if let Some(resettable) = self.storage.as_resettable() {
                    self.bounded(resettable.reset(rate_limit)).await?;
                }
            }

            match self.bounded(self.storage.store(rate_limit)).await {
                Ok(created) => {
                    debug!(
                        fingerprint = %fingerprint,
                        valid_until = %created.valid_until(),
                        "Opened new window"
                    );
                    return Ok(Verdict {
                        decision: Decision::Allow,
                        stored: created,
                    });
                }
                Err(StorageError::AlreadyExists(_)) if retries < MAX_RETRIES => {
                    retries += 1;
                    warn!(
                        fingerprint = %fingerprint,
                        "Window created concurrently, counting against it"
                    );
                    current = self.bounded(self.storage.get_stored(rate_limit)).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        match self.storage_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StorageError::Timeout(limit))?,
            None => call.await,
        }
    }
}

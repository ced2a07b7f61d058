//! Storage traits for persisted rate limit counters.

use async_trait::async_trait;

use super::counter::StoredRateLimit;
use super::descriptor::RateLimit;
use crate::error::StorageError;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Trait for rate limit counter storage.
///
/// The storage owns every persisted [`StoredRateLimit`]; callers only ever
/// hold copies. Implementations are shared by concurrent requests and must
/// make each individual operation atomic for its key.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Retrieve the record for the rate limit's fingerprint, if any.
    async fn get_stored(&self, rate_limit: &RateLimit) -> StorageResult<Option<StoredRateLimit>>;

    /// Open a new window with `hits = 1`.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if a record is present.
    async fn store(&self, rate_limit: &RateLimit) -> StorageResult<StoredRateLimit>;

    /// Record one more hit and return the replacement record.
    ///
    /// Backends that expire keys on their own fail with
    /// [`StorageError::NotFound`] when the window vanished after it was read.
    async fn increment_hits(&self, stored: &StoredRateLimit) -> StorageResult<StoredRateLimit>;

    /// Capability query for backends without native expiry.
    fn as_resettable(&self) -> Option<&dyn ManuallyResettable> {
        None
    }
}

/// Optional capability of backends that cannot expire keys on their own.
#[async_trait]
pub trait ManuallyResettable: Send + Sync {
    /// Delete the record for the rate limit's fingerprint if its window is
    /// outdated. A window opened since the caller's read is left in place.
    async fn reset(&self, rate_limit: &RateLimit) -> StorageResult<()>;
}

//! Redis-backed counter storage.
//!
//! Each window is a Redis hash keyed by the fingerprint, holding `hits`,
//! `valid_until` (unix seconds), `limit`, `period` and `vary`. The key is
//! given an `EXPIREAT` equal to the window end, so outdated windows vanish
//! on their own and this backend does not offer manual reset.
//!
//! Window creation and hit increments each run as a single Lua script, so
//! both are atomic on the server and hit counts are exact across every
//! process sharing the Redis instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::ratelimit::{
    Clock, Fingerprint, RateLimit, RateLimitStorage, StorageResult, StoredRateLimit, SystemClock,
};

const STORE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'hits', 1, 'valid_until', ARGV[1], 'limit', ARGV[2], 'period', ARGV[3], 'vary', ARGV[4])
redis.call('EXPIREAT', KEYS[1], ARGV[1])
return 1
";

const INCREMENT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
return redis.call('HINCRBY', KEYS[1], 'hits', 1)
";

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStorageConfig {
    /// Key prefix for Redis keys (default: "windowguard:")
    pub key_prefix: String,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: "windowguard:".to_string(),
        }
    }
}

/// Redis-backed storage shared by every instance of a deployment.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    config: RedisStorageConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis with default configuration.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        Self::connect_with_config(url, RedisStorageConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStorageConfig) -> StorageResult<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(prefix = %config.key_prefix, "Connected to Redis rate limit storage");

        Ok(Self {
            connection,
            config,
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// Replace the clock used to open windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(&self, fingerprint: Fingerprint) -> String {
        format!("{}{}", self.config.key_prefix, fingerprint)
    }
}

#[async_trait]
impl RateLimitStorage for RedisStorage {
    async fn get_stored(&self, rate_limit: &RateLimit) -> StorageResult<Option<StoredRateLimit>> {
        let key = self.key(rate_limit.hash()?);
        let mut conn = self.connection.clone();

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        decode(&fields).map(Some)
    }

    async fn store(&self, rate_limit: &RateLimit) -> StorageResult<StoredRateLimit> {
        let stored = StoredRateLimit::open_window(rate_limit, self.clock.now())?;
        let key = self.key(stored.fingerprint());
        let mut conn = self.connection.clone();

        let created: i64 = Script::new(STORE_SCRIPT)
            .key(&key)
            .arg(stored.valid_until().timestamp())
            .arg(stored.limit())
            .arg(stored.period())
            .arg(stored.discriminator())
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(StorageError::AlreadyExists(stored.fingerprint().to_hex()));
        }

        Ok(stored)
    }

    async fn increment_hits(&self, stored: &StoredRateLimit) -> StorageResult<StoredRateLimit> {
        let key = self.key(stored.fingerprint());
        let mut conn = self.connection.clone();

        let hits: Option<u64> = Script::new(INCREMENT_SCRIPT)
            .key(&key)
            .invoke_async(&mut conn)
            .await?;

        match hits {
            Some(hits) => Ok(stored.with_hits(hits)),
            None => {
                debug!(fingerprint = %stored.fingerprint(), "Window expired before increment");
                Err(StorageError::NotFound(stored.fingerprint().to_hex()))
            }
        }
    }
}

fn decode(fields: &HashMap<String, String>) -> StorageResult<StoredRateLimit> {
    let number = |name: &str| -> StorageResult<i64> {
        fields
            .get(name)
            .ok_or_else(|| StorageError::Serialization(format!("missing field {}", name)))?
            .parse::<i64>()
            .map_err(|e| StorageError::Serialization(format!("field {}: {}", name, e)))
    };

    let vary = fields
        .get("vary")
        .cloned()
        .ok_or_else(|| StorageError::Serialization("missing field vary".to_string()))?;
    let valid_until = DateTime::<Utc>::from_timestamp(number("valid_until")?, 0)
        .ok_or_else(|| StorageError::Serialization("valid_until out of range".to_string()))?;

    Ok(StoredRateLimit::from_parts(
        vary,
        number("limit")?.max(0) as u64,
        number("period")?.max(0) as u64,
        number("hits")?.max(0) as u64,
        valid_until,
    ))
}

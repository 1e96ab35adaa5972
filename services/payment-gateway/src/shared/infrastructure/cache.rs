use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::Client;

use crate::shared::domain::errors::AppError;

/// Distributed key-value port backing every shared concern of the service:
/// idempotency locks and results, circuit-breaker state, status cache entries
/// and webhook ingest counters.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;

    /// Atomic set-if-absent with expiry (SET NX PX). Returns true when the
    /// key was free and is now held by the caller.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Fixed-window counter: increments and returns the new count; the key
    /// expires `window` after its first increment.
    async fn increment_window(&self, key: &str, window: Duration) -> Result<u64, AppError>;

    /// Versioned compare-and-swap for state shared across instances.
    /// Succeeds when the stored version equals `expected_version`, or when
    /// the key is absent and `expected_version == 0`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        new_version: u64,
    ) -> Result<bool, AppError>;

    async fn get_versioned(&self, key: &str) -> Result<Option<(String, u64)>, AppError>;
}

const CAS_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'version')
if (not cur and ARGV[1] == '0') or (cur == ARGV[1]) then
    redis.call('HSET', KEYS[1], 'version', ARGV[2], 'value', ARGV[3])
    return 1
end
return 0
"#;

pub struct RedisCacheStore {
    client: Client,
    cas: redis::Script,
}

impl RedisCacheStore {
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = Client::open(redis_url)
            .map_err(|e| AppError::Cache(format!("Failed to open Redis client: {}", e)))?;
        Ok(Self {
            client,
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::Connection, AppError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| AppError::Cache(format!("Redis connection error: {}", e)))
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment_window(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if count == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(window.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
        }
        Ok(count)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        new_version: u64,
    ) -> Result<bool, AppError> {
        let mut conn = self.connection().await?;
        let swapped: i32 = self
            .cas
            .key(key)
            .arg(expected_version.to_string())
            .arg(new_version.to_string())
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<(String, u64)>, AppError> {
        let mut conn = self.connection().await?;
        let (value, version): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("value")
            .arg("version")
            .query_async(&mut conn)
            .await?;
        match (value, version) {
            (Some(v), Some(ver)) => {
                let ver = ver
                    .parse::<u64>()
                    .map_err(|e| AppError::Cache(format!("Corrupt version for {}: {}", key, e)))?;
                Ok(Some((v, ver)))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Default)]
struct MemoryEntry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

/// In-process stand-in used by unit and integration tests.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, MemoryEntry>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if entry.is_expired() {
                    true
                } else {
                    return Some(entry.value.clone());
                }
            }
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                version: 0,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                version: 0,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn increment_window(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        if entry.is_expired() {
            entry.value.clear();
            entry.expires_at = None;
        }
        let count = entry.value.parse::<u64>().unwrap_or(0) + 1;
        entry.value = count.to_string();
        if entry.expires_at.is_none() {
            entry.expires_at = Some(Instant::now() + window);
        }
        Ok(count)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        new_version: u64,
    ) -> Result<bool, AppError> {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        let current = if entry.value.is_empty() { 0 } else { entry.version };
        if current != expected_version {
            return Ok(false);
        }
        entry.value = value.to_string();
        entry.version = new_version;
        entry.expires_at = None;
        Ok(true)
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<(String, u64)>, AppError> {
        match self.entries.get(key) {
            Some(entry) if !entry.value.is_empty() => Ok(Some((entry.value.clone(), entry.version))),
            _ => Ok(None),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::IdempotencyConfig;
use crate::shared::domain::errors::AppError;
use crate::shared::infrastructure::cache::CacheStore;

use crate::bounded_contexts::payment::domain::value_objects::{IdempotencyKey, OperationType};

/// Distributed keyed lock plus cached result for `(operation, key)` pairs.
///
/// The cache is advisory: the durable echo is the unique constraint on
/// `idempotency_key` in the payment and refund tables, so correctness never
/// depends on an entry surviving its TTL.
pub struct IdempotencyStore {
    cache: Arc<dyn CacheStore>,
    lock_ttl: Duration,
    result_ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(cache: Arc<dyn CacheStore>, config: &IdempotencyConfig) -> Self {
        Self {
            cache,
            lock_ttl: config.lock_ttl,
            result_ttl: config.result_ttl,
        }
    }

    fn lock_key(operation: OperationType, key: &IdempotencyKey) -> String {
        format!("idempotency:lock:{}:{}", operation.as_str(), key.value())
    }

    fn result_key(operation: OperationType, key: &IdempotencyKey) -> String {
        format!("idempotency:result:{}:{}", operation.as_str(), key.value())
    }

    /// Atomic set-if-absent; false means another workflow holds the key.
    pub async fn acquire_lock(
        &self,
        operation: OperationType,
        key: &IdempotencyKey,
    ) -> Result<bool, AppError> {
        self.cache
            .set_if_absent(&Self::lock_key(operation, key), "1", self.lock_ttl)
            .await
    }

    /// Locks are leased; release is explicit on every exit path and expiry
    /// covers crashes.
    pub async fn release_lock(
        &self,
        operation: OperationType,
        key: &IdempotencyKey,
    ) -> Result<(), AppError> {
        self.cache.delete(&Self::lock_key(operation, key)).await
    }

    pub async fn store_result(
        &self,
        operation: OperationType,
        key: &IdempotencyKey,
        transaction_id: Uuid,
    ) -> Result<(), AppError> {
        self.cache
            .set(
                &Self::result_key(operation, key),
                &transaction_id.to_string(),
                self.result_ttl,
            )
            .await
    }

    pub async fn get_result(
        &self,
        operation: OperationType,
        key: &IdempotencyKey,
    ) -> Result<Option<Uuid>, AppError> {
        let cached = self.cache.get(&Self::result_key(operation, key)).await?;
        match cached {
            Some(raw) => match Uuid::parse_str(&raw) {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    tracing::warn!(key = %key, "discarding corrupt idempotency result");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

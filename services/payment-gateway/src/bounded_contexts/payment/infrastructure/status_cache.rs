use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::StatusCacheConfig;
use crate::shared::infrastructure::cache::CacheStore;
use crate::shared::infrastructure::metrics::Metrics;

use crate::bounded_contexts::payment::application::dto::PaymentStatusView;

/// Two-tier read cache for payment status: a process-local TTL map in front
/// of the distributed store. TTL is keyed to the state: terminal states are
/// stable and cache long, active states cache short to bound staleness.
///
/// Cache trouble is logged and swallowed; reads fall through to the store.
pub struct PaymentStatusCache {
    local: DashMap<Uuid, (PaymentStatusView, Instant)>,
    distributed: Arc<dyn CacheStore>,
    active_ttl: Duration,
    terminal_ttl: Duration,
    metrics: Metrics,
}

impl PaymentStatusCache {
    pub fn new(distributed: Arc<dyn CacheStore>, config: &StatusCacheConfig, metrics: Metrics) -> Self {
        Self {
            local: DashMap::new(),
            distributed,
            active_ttl: config.active_ttl,
            terminal_ttl: config.terminal_ttl,
            metrics,
        }
    }

    fn key(transaction_id: Uuid) -> String {
        format!("payment_status:{}", transaction_id)
    }

    fn ttl_for(&self, view: &PaymentStatusView) -> Duration {
        if view.is_terminal() {
            self.terminal_ttl
        } else {
            self.active_ttl
        }
    }

    pub async fn get(&self, transaction_id: Uuid) -> Option<PaymentStatusView> {
        if let Some(entry) = self.local.get(&transaction_id) {
            let (view, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                self.metrics
                    .status_cache_lookups
                    .with_label_values(&["local", "hit"])
                    .inc();
                return Some(view.clone());
            }
        }
        self.local.remove(&transaction_id);
        self.metrics
            .status_cache_lookups
            .with_label_values(&["local", "miss"])
            .inc();

        match self.distributed.get(&Self::key(transaction_id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<PaymentStatusView>(&raw) {
                Ok(view) => {
                    self.metrics
                        .status_cache_lookups
                        .with_label_values(&["distributed", "hit"])
                        .inc();
                    self.local.insert(
                        transaction_id,
                        (view.clone(), Instant::now() + self.ttl_for(&view)),
                    );
                    Some(view)
                }
                Err(e) => {
                    tracing::warn!(%transaction_id, error = %e, "corrupt status cache entry");
                    None
                }
            },
            Ok(None) => {
                self.metrics
                    .status_cache_lookups
                    .with_label_values(&["distributed", "miss"])
                    .inc();
                None
            }
            Err(e) => {
                tracing::warn!(%transaction_id, error = %e, "status cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, view: &PaymentStatusView) {
        let ttl = self.ttl_for(view);
        self.local
            .insert(view.transaction_id, (view.clone(), Instant::now() + ttl));

        let raw = match serde_json::to_string(view) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(transaction_id = %view.transaction_id, error = %e, "status view not serializable");
                return;
            }
        };
        if let Err(e) = self
            .distributed
            .set(&Self::key(view.transaction_id), &raw, ttl)
            .await
        {
            tracing::warn!(transaction_id = %view.transaction_id, error = %e, "status cache write failed");
        }
    }

    /// Best-effort invalidation on any transaction update; the short active
    /// TTL bounds the damage when this fails.
    pub async fn invalidate(&self, transaction_id: Uuid) {
        self.local.remove(&transaction_id);
        if let Err(e) = self.distributed.delete(&Self::key(transaction_id)).await {
            tracing::warn!(%transaction_id, error = %e, "status cache invalidation failed");
        }
    }
}

use std::sync::Arc;
use uuid::Uuid;

use crate::shared::domain::errors::AppError;

use crate::bounded_contexts::payment::domain::repository::PaymentTransactionRepository;
use crate::bounded_contexts::payment::domain::value_objects::TransactionId;
use crate::bounded_contexts::payment::infrastructure::status_cache::PaymentStatusCache;

use super::dto::PaymentStatusView;

/// Read path for payment status: cache first, store on miss, cache the
/// result with a TTL keyed to terminal vs. active state.
pub struct StatusReadService {
    payments: Arc<dyn PaymentTransactionRepository>,
    cache: Arc<PaymentStatusCache>,
}

impl StatusReadService {
    pub fn new(payments: Arc<dyn PaymentTransactionRepository>, cache: Arc<PaymentStatusCache>) -> Self {
        Self { payments, cache }
    }

    pub async fn get_status(&self, transaction_id: Uuid) -> Result<PaymentStatusView, AppError> {
        if let Some(view) = self.cache.get(transaction_id).await {
            return Ok(view);
        }

        let tx = self
            .payments
            .find_by_id(TransactionId::from_uuid(transaction_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", transaction_id)))?;

        let view = PaymentStatusView::from_transaction(&tx);
        self.cache.put(&view).await;
        Ok(view)
    }
}

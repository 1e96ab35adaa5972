use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::shared::domain::errors::AppError;
use crate::shared::infrastructure::event_bus::{EventPublisher, PROVIDER_TOPIC};

use crate::bounded_contexts::payment::domain::entities::PaymentTransaction;
use crate::bounded_contexts::payment::domain::events::{to_envelope, ReconciliationDiscrepancyEvent};
use crate::bounded_contexts::payment::domain::repository::PaymentTransactionRepository;
use crate::bounded_contexts::payment::infrastructure::providers::RemoteStatus;
use crate::bounded_contexts::payment::infrastructure::resilience::ProviderPipelineRegistry;

const SCAN_BATCH: i64 = 50;

/// Source of provider-side settlement truth for a transaction. The default
/// implementation reads the provider status API through the resilience
/// pipeline; settlement-report parsers plug in behind the same trait.
#[async_trait]
pub trait SettlementSource: Send + Sync {
    async fn remote_status(&self, tx: &PaymentTransaction) -> Result<Option<RemoteStatus>, AppError>;
}

pub struct PipelineSettlementSource {
    pipelines: Arc<ProviderPipelineRegistry>,
}

impl PipelineSettlementSource {
    pub fn new(pipelines: Arc<ProviderPipelineRegistry>) -> Self {
        Self { pipelines }
    }
}

#[async_trait]
impl SettlementSource for PipelineSettlementSource {
    async fn remote_status(&self, tx: &PaymentTransaction) -> Result<Option<RemoteStatus>, AppError> {
        if tx.provider_transaction_id.is_empty() {
            return Ok(None);
        }
        let pipeline = match self.pipelines.get(&tx.provider_name) {
            Some(pipeline) => pipeline,
            None => return Ok(None),
        };
        let outcome = pipeline
            .fetch_status(&tx.provider_transaction_id)
            .await
            .map_err(AppError::Provider)?;
        Ok(Some(outcome.status))
    }
}

/// Scheduled scan over transactions flagged `needs_reconciliation` (the one
/// failure class persistence cannot resolve on its own): reads the provider's
/// view and emits a discrepancy event for every disagreement. Resolution is a
/// follow-up consumer's job, not this scan's.
pub struct ReconciliationJob {
    payments: Arc<dyn PaymentTransactionRepository>,
    settlement: Arc<dyn SettlementSource>,
    publisher: Arc<dyn EventPublisher>,
    interval: Duration,
}

impl ReconciliationJob {
    pub fn new(
        payments: Arc<dyn PaymentTransactionRepository>,
        settlement: Arc<dyn SettlementSource>,
        publisher: Arc<dyn EventPublisher>,
        interval: Duration,
    ) -> Self {
        Self {
            payments,
            settlement,
            publisher,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.interval, "reconciliation job started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "reconciliation scan failed");
                    }
                }
            }
        }
        tracing::info!("reconciliation job stopped");
    }

    pub async fn run_once(&self) -> Result<usize, AppError> {
        let flagged = self.payments.find_needing_reconciliation(SCAN_BATCH).await?;
        let mut discrepancies = 0;

        for tx in flagged {
            let remote = match self.settlement.remote_status(&tx).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(transaction_id = %tx.id, error = %e, "settlement read failed");
                    continue;
                }
            };

            let event = match remote {
                None => ReconciliationDiscrepancyEvent::new(
                    &tx,
                    None,
                    "provider outcome unknown, no provider transaction reference",
                ),
                Some(remote_status) if Self::disagrees(&tx, remote_status) => {
                    ReconciliationDiscrepancyEvent::new(
                        &tx,
                        Some(format!("{:?}", remote_status)),
                        "local and provider status disagree",
                    )
                }
                Some(_) => continue,
            };

            discrepancies += 1;
            if let Err(e) = self.publisher.publish(PROVIDER_TOPIC, &to_envelope(&event)).await {
                tracing::warn!(transaction_id = %tx.id, error = %e, "failed to publish discrepancy");
            }
        }

        Ok(discrepancies)
    }

    fn disagrees(tx: &PaymentTransaction, remote: RemoteStatus) -> bool {
        use crate::bounded_contexts::payment::domain::value_objects::PaymentStatus;

        !matches!(
            (tx.status, remote),
            (PaymentStatus::Completed, RemoteStatus::Completed)
                | (PaymentStatus::Failed, RemoteStatus::Failed)
                | (PaymentStatus::Processing, RemoteStatus::Processing)
                | (PaymentStatus::Processing, RemoteStatus::Pending)
                | (PaymentStatus::Pending, RemoteStatus::Pending)
                | (PaymentStatus::Refunded, RemoteStatus::Refunded)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use uuid::Uuid;

    use paygrid_types::CorrelationId;

    use crate::bounded_contexts::payment::domain::entities::TransactionLog;
    use crate::bounded_contexts::payment::domain::repository::PaymentTransactionRepository;
    use crate::bounded_contexts::payment::domain::value_objects::{
        Amount, Currency, IdempotencyKey,
    };
    use crate::bounded_contexts::payment::infrastructure::repositories::InMemoryPaymentRepository;
    use crate::shared::infrastructure::event_bus::InMemoryEventPublisher;

    struct FixedSettlement(Option<RemoteStatus>);

    #[async_trait]
    impl SettlementSource for FixedSettlement {
        async fn remote_status(
            &self,
            _tx: &PaymentTransaction,
        ) -> Result<Option<RemoteStatus>, AppError> {
            Ok(self.0)
        }
    }

    async fn flagged_payment(repo: &InMemoryPaymentRepository) -> PaymentTransaction {
        let mut tx = PaymentTransaction::create(
            IdempotencyKey::new("K1").unwrap(),
            Amount::new_payment(dec!(10.00), Currency::new("USD").unwrap()).unwrap(),
            "c1".to_string(),
            "o1".to_string(),
            Uuid::new_v4(),
            "stripe".to_string(),
            None,
            None,
            None,
            HashMap::new(),
            CorrelationId::new(),
        );
        tx.mark_processing("pi_1".to_string(), None).unwrap();
        let log = TransactionLog::record(
            tx.id, None, tx.status, "PaymentCreated", None, None, None, tx.correlation_id.clone(),
        );
        repo.create(&tx, &log).await.unwrap();
        repo.mark_needs_reconciliation(tx.id).await.unwrap();
        tx
    }

    #[tokio::test]
    async fn disagreement_emits_a_discrepancy_event() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        flagged_payment(&repo).await;
        let publisher = Arc::new(InMemoryEventPublisher::new());

        let job = ReconciliationJob::new(
            repo,
            Arc::new(FixedSettlement(Some(RemoteStatus::Completed))),
            publisher.clone(),
            Duration::from_secs(60),
        );

        let count = job.run_once().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(publisher.events_of_type("reconciliation.discrepancy").len(), 1);
    }

    #[tokio::test]
    async fn agreement_stays_quiet() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        flagged_payment(&repo).await;
        let publisher = Arc::new(InMemoryEventPublisher::new());

        let job = ReconciliationJob::new(
            repo,
            Arc::new(FixedSettlement(Some(RemoteStatus::Processing))),
            publisher.clone(),
            Duration::from_secs(60),
        );

        let count = job.run_once().await.unwrap();
        assert_eq!(count, 0);
        assert!(publisher.events_of_type("reconciliation.discrepancy").is_empty());
    }
}

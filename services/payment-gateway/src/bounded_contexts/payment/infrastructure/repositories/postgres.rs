use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use paygrid_types::CorrelationId;

use crate::shared::domain::errors::AppError;

use crate::bounded_contexts::payment::domain::entities::{
    PaymentProvider, PaymentTransaction, RefundTransaction, TransactionLog, WebhookEvent,
    WebhookProcessingStatus,
};
use crate::bounded_contexts::payment::domain::repository::{
    PaymentTransactionRepository, ProviderRepository, RefundTransactionRepository,
    WebhookEventRepository, WebhookInsertOutcome,
};
use crate::bounded_contexts::payment::domain::value_objects::{
    Amount, Currency, IdempotencyKey, PaymentStatus, ProviderStatus, RefundId, RefundStatus,
    RefundType, TransactionId,
};

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    idempotency_key: String,
    amount: Decimal,
    currency: String,
    status: String,
    customer_id: String,
    order_id: String,
    provider_id: Uuid,
    provider_name: String,
    provider_transaction_id: String,
    payment_url: Option<String>,
    description: Option<String>,
    return_url: Option<String>,
    cancel_url: Option<String>,
    metadata: Json<HashMap<String, String>>,
    error_message: Option<String>,
    provider_error_code: Option<String>,
    retry_count: i32,
    needs_reconciliation: bool,
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    row_version: i64,
}

impl PaymentRow {
    fn into_entity(self) -> Result<PaymentTransaction, AppError> {
        Ok(PaymentTransaction {
            id: TransactionId::from_uuid(self.id),
            idempotency_key: IdempotencyKey::new(self.idempotency_key)?,
            amount: Amount::new(self.amount, Currency::new(self.currency.trim())?)?,
            status: PaymentStatus::parse(&self.status)?,
            customer_id: self.customer_id,
            order_id: self.order_id,
            provider_id: self.provider_id,
            provider_name: self.provider_name,
            provider_transaction_id: self.provider_transaction_id,
            payment_url: self.payment_url,
            description: self.description,
            return_url: self.return_url,
            cancel_url: self.cancel_url,
            metadata: self.metadata.0,
            error_message: self.error_message,
            provider_error_code: self.provider_error_code,
            retry_count: self.retry_count,
            needs_reconciliation: self.needs_reconciliation,
            correlation_id: CorrelationId::from_header(self.correlation_id.as_deref()),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            row_version: self.row_version,
        })
    }
}

async fn insert_log(
    tx: &mut Transaction<'_, Postgres>,
    log: &TransactionLog,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO transaction_logs (
            id, payment_transaction_id, previous_status, new_status, event_type,
            message, provider_response, error_details, correlation_id, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(log.id)
    .bind(log.payment_transaction_id.value())
    .bind(log.previous_status.map(|s| s.as_str()))
    .bind(log.new_status.as_str())
    .bind(&log.event_type)
    .bind(&log.message)
    .bind(&log.provider_response)
    .bind(&log.error_details)
    .bind(log.correlation_id.as_str())
    .bind(log.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Writes a payment snapshot inside an open transaction, checking the
/// optimistic version.
async fn update_payment_row(
    tx: &mut Transaction<'_, Postgres>,
    payment: &PaymentTransaction,
) -> Result<(), AppError> {
    let result = sqlx::query(
        "UPDATE payment_transactions SET
            status = $2,
            provider_transaction_id = $3,
            payment_url = $4,
            error_message = $5,
            provider_error_code = $6,
            retry_count = $7,
            needs_reconciliation = $8,
            updated_at = $9,
            completed_at = $10,
            row_version = row_version + 1
         WHERE id = $1 AND row_version = $11",
    )
    .bind(payment.id.value())
    .bind(payment.status.as_str())
    .bind(&payment.provider_transaction_id)
    .bind(&payment.payment_url)
    .bind(&payment.error_message)
    .bind(&payment.provider_error_code)
    .bind(payment.retry_count)
    .bind(payment.needs_reconciliation)
    .bind(payment.updated_at)
    .bind(payment.completed_at)
    .bind(payment.row_version)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::ConcurrencyConflict(format!(
            "Payment {} version {} is stale",
            payment.id, payment.row_version
        )));
    }
    Ok(())
}

pub struct PostgresPaymentRepository {
    pool: PgPool,
}

impl PostgresPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentTransactionRepository for PostgresPaymentRepository {
    async fn create(&self, tx: &PaymentTransaction, log: &TransactionLog) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await?;

        let insert = sqlx::query(
            "INSERT INTO payment_transactions (
                id, idempotency_key, amount, currency, status, customer_id, order_id,
                provider_id, provider_name, provider_transaction_id, payment_url,
                description, return_url, cancel_url, metadata, error_message,
                provider_error_code, retry_count, needs_reconciliation, correlation_id,
                created_at, updated_at, completed_at, row_version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                      $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
        )
        .bind(tx.id.value())
        .bind(tx.idempotency_key.value())
        .bind(tx.amount.value())
        .bind(tx.amount.currency().code())
        .bind(tx.status.as_str())
        .bind(&tx.customer_id)
        .bind(&tx.order_id)
        .bind(tx.provider_id)
        .bind(&tx.provider_name)
        .bind(&tx.provider_transaction_id)
        .bind(&tx.payment_url)
        .bind(&tx.description)
        .bind(&tx.return_url)
        .bind(&tx.cancel_url)
        .bind(Json(&tx.metadata))
        .bind(&tx.error_message)
        .bind(&tx.provider_error_code)
        .bind(tx.retry_count)
        .bind(tx.needs_reconciliation)
        .bind(tx.correlation_id.as_str())
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.completed_at)
        .bind(tx.row_version)
        .execute(&mut *db_tx)
        .await;

        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(AppError::ConcurrencyConflict(format!(
                    "Idempotency key {} already persisted",
                    tx.idempotency_key
                )));
            }
            return Err(err.into());
        }

        insert_log(&mut db_tx, log).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn update(&self, tx: &PaymentTransaction, log: &TransactionLog) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await?;
        update_payment_row(&mut db_tx, tx).await?;
        insert_log(&mut db_tx, log).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<PaymentTransaction>, AppError> {
        let row: Option<PaymentRow> =
            sqlx::query_as("SELECT * FROM payment_transactions WHERE id = $1")
                .bind(id.value())
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentRow::into_entity).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let row: Option<PaymentRow> =
            sqlx::query_as("SELECT * FROM payment_transactions WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentRow::into_entity).transpose()
    }

    async fn mark_needs_reconciliation(&self, id: TransactionId) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment_transactions
             SET needs_reconciliation = TRUE, updated_at = now(), row_version = row_version + 1
             WHERE id = $1",
        )
        .bind(id.value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_needing_reconciliation(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, AppError> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            "SELECT * FROM payment_transactions
             WHERE needs_reconciliation
             ORDER BY created_at
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PaymentRow::into_entity).collect()
    }

    async fn logs_for_payment(&self, id: TransactionId) -> Result<Vec<TransactionLog>, AppError> {
        let rows = sqlx::query(
            "SELECT id, payment_transaction_id, previous_status, new_status, event_type,
                    message, provider_response, error_details, correlation_id, created_at
             FROM transaction_logs
             WHERE payment_transaction_id = $1
             ORDER BY created_at",
        )
        .bind(id.value())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let previous: Option<String> = row.try_get("previous_status")?;
                let new_status: String = row.try_get("new_status")?;
                Ok(TransactionLog {
                    id: row.try_get("id")?,
                    payment_transaction_id: TransactionId::from_uuid(
                        row.try_get("payment_transaction_id")?,
                    ),
                    previous_status: previous
                        .map(|s| PaymentStatus::parse(&s))
                        .transpose()
                        .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
                    new_status: PaymentStatus::parse(&new_status)
                        .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
                    event_type: row.try_get("event_type")?,
                    message: row.try_get("message")?,
                    provider_response: row.try_get("provider_response")?,
                    error_details: row.try_get("error_details")?,
                    correlation_id: CorrelationId::from_header(
                        row.try_get::<Option<String>, _>("correlation_id")?.as_deref(),
                    ),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(AppError::from)
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    idempotency_key: String,
    payment_transaction_id: Uuid,
    provider_id: Uuid,
    amount: Decimal,
    currency: String,
    status: String,
    refund_type: String,
    provider_refund_id: Option<String>,
    reason: Option<String>,
    error_message: Option<String>,
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    row_version: i64,
}

impl RefundRow {
    fn into_entity(self) -> Result<RefundTransaction, AppError> {
        Ok(RefundTransaction {
            id: RefundId::from_uuid(self.id),
            idempotency_key: IdempotencyKey::new(self.idempotency_key)?,
            payment_transaction_id: TransactionId::from_uuid(self.payment_transaction_id),
            provider_id: self.provider_id,
            amount: Amount::new(self.amount, Currency::new(self.currency.trim())?)?,
            status: RefundStatus::parse(&self.status)?,
            refund_type: RefundType::parse(&self.refund_type)?,
            provider_refund_id: self.provider_refund_id,
            reason: self.reason,
            error_message: self.error_message,
            correlation_id: CorrelationId::from_header(self.correlation_id.as_deref()),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            row_version: self.row_version,
        })
    }
}

pub struct PostgresRefundRepository {
    pool: PgPool,
}

impl PostgresRefundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn update_refund_row(
        db_tx: &mut Transaction<'_, Postgres>,
        refund: &RefundTransaction,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE refund_transactions SET
                status = $2,
                provider_refund_id = $3,
                error_message = $4,
                updated_at = $5,
                completed_at = $6,
                row_version = row_version + 1
             WHERE id = $1 AND row_version = $7",
        )
        .bind(refund.id.value())
        .bind(refund.status.as_str())
        .bind(&refund.provider_refund_id)
        .bind(&refund.error_message)
        .bind(refund.updated_at)
        .bind(refund.completed_at)
        .bind(refund.row_version)
        .execute(&mut **db_tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ConcurrencyConflict(format!(
                "Refund {} version {} is stale",
                refund.id, refund.row_version
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RefundTransactionRepository for PostgresRefundRepository {
    async fn create(&self, refund: &RefundTransaction, log: &TransactionLog) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await?;

        let insert = sqlx::query(
            "INSERT INTO refund_transactions (
                id, idempotency_key, payment_transaction_id, provider_id, amount, currency,
                status, refund_type, provider_refund_id, reason, error_message,
                correlation_id, created_at, updated_at, completed_at, row_version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(refund.id.value())
        .bind(refund.idempotency_key.value())
        .bind(refund.payment_transaction_id.value())
        .bind(refund.provider_id)
        .bind(refund.amount.value())
        .bind(refund.amount.currency().code())
        .bind(refund.status.as_str())
        .bind(refund.refund_type.as_str())
        .bind(&refund.provider_refund_id)
        .bind(&refund.reason)
        .bind(&refund.error_message)
        .bind(refund.correlation_id.as_str())
        .bind(refund.created_at)
        .bind(refund.updated_at)
        .bind(refund.completed_at)
        .bind(refund.row_version)
        .execute(&mut *db_tx)
        .await;

        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(AppError::ConcurrencyConflict(format!(
                    "Idempotency key {} already persisted",
                    refund.idempotency_key
                )));
            }
            return Err(err.into());
        }

        insert_log(&mut db_tx, log).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn update_with_parent(
        &self,
        refund: &RefundTransaction,
        parent: &PaymentTransaction,
        log: &TransactionLog,
    ) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await?;
        Self::update_refund_row(&mut db_tx, refund).await?;
        update_payment_row(&mut db_tx, parent).await?;
        insert_log(&mut db_tx, log).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn update(&self, refund: &RefundTransaction) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await?;
        Self::update_refund_row(&mut db_tx, refund).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: RefundId) -> Result<Option<RefundTransaction>, AppError> {
        let row: Option<RefundRow> =
            sqlx::query_as("SELECT * FROM refund_transactions WHERE id = $1")
                .bind(id.value())
                .fetch_optional(&self.pool)
                .await?;
        row.map(RefundRow::into_entity).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RefundTransaction>, AppError> {
        let row: Option<RefundRow> =
            sqlx::query_as("SELECT * FROM refund_transactions WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(RefundRow::into_entity).transpose()
    }

    async fn completed_amount_for(&self, payment_id: TransactionId) -> Result<Decimal, AppError> {
        let total: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)
             FROM refund_transactions
             WHERE payment_transaction_id = $1 AND status = 'Completed'",
        )
        .bind(payment_id.value())
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: Uuid,
    name: String,
    display_name: String,
    status: String,
    supported_currencies: Vec<String>,
    priority: i32,
    credentials_encrypted: Json<HashMap<String, String>>,
    configurations: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl ProviderRow {
    fn into_entity(self) -> Result<PaymentProvider, AppError> {
        Ok(PaymentProvider {
            id: self.id,
            name: self.name,
            display_name: self.display_name,
            status: ProviderStatus::parse(&self.status)?,
            supported_currencies: self.supported_currencies,
            priority: self.priority,
            credentials: self.credentials_encrypted.0,
            configurations: self.configurations,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

pub struct PostgresProviderRepository {
    pool: PgPool,
}

impl PostgresProviderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderRepository for PostgresProviderRepository {
    async fn find_routable_for_currency(
        &self,
        currency: &Currency,
    ) -> Result<Vec<PaymentProvider>, AppError> {
        let rows: Vec<ProviderRow> = sqlx::query_as(
            "SELECT * FROM payment_providers
             WHERE deleted_at IS NULL
               AND status IN ('Active', 'Degraded')
               AND $1 = ANY(supported_currencies)
             ORDER BY priority",
        )
        .bind(currency.code())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProviderRow::into_entity).collect()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<PaymentProvider>, AppError> {
        let row: Option<ProviderRow> = sqlx::query_as(
            "SELECT * FROM payment_providers WHERE name = $1 AND deleted_at IS NULL",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProviderRow::into_entity).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentProvider>, AppError> {
        let row: Option<ProviderRow> =
            sqlx::query_as("SELECT * FROM payment_providers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ProviderRow::into_entity).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    provider_id: Uuid,
    provider_event_id: String,
    event_type: String,
    raw_payload: String,
    parsed_payload: Option<serde_json::Value>,
    signature: Option<String>,
    signature_validated: bool,
    ip_address: Option<String>,
    processing_status: String,
    processing_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    payment_transaction_id: Option<Uuid>,
    refund_transaction_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    row_version: i64,
}

impl WebhookRow {
    fn into_entity(self) -> Result<WebhookEvent, AppError> {
        Ok(WebhookEvent {
            id: self.id,
            provider_id: self.provider_id,
            provider_event_id: self.provider_event_id,
            event_type: self.event_type,
            raw_payload: self.raw_payload,
            parsed_payload: self.parsed_payload,
            signature: self.signature,
            signature_validated: self.signature_validated,
            ip_address: self.ip_address,
            processing_status: WebhookProcessingStatus::parse(&self.processing_status)?,
            processing_attempts: self.processing_attempts,
            next_retry_at: self.next_retry_at,
            failure_reason: self.failure_reason,
            payment_transaction_id: self.payment_transaction_id.map(TransactionId::from_uuid),
            refund_transaction_id: self.refund_transaction_id.map(RefundId::from_uuid),
            created_at: self.created_at,
            updated_at: self.updated_at,
            processed_at: self.processed_at,
            row_version: self.row_version,
        })
    }
}

pub struct PostgresWebhookEventRepository {
    pool: PgPool,
}

impl PostgresWebhookEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventRepository for PostgresWebhookEventRepository {
    async fn insert(&self, event: &WebhookEvent) -> Result<WebhookInsertOutcome, AppError> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO webhook_events (
                id, provider_id, provider_event_id, event_type, raw_payload, parsed_payload,
                signature, signature_validated, ip_address, processing_status,
                processing_attempts, next_retry_at, failure_reason, payment_transaction_id,
                refund_transaction_id, created_at, updated_at, processed_at, row_version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                      $16, $17, $18, $19)
            ON CONFLICT (provider_id, provider_event_id) DO NOTHING
            RETURNING id",
        )
        .bind(event.id)
        .bind(event.provider_id)
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(&event.raw_payload)
        .bind(&event.parsed_payload)
        .bind(&event.signature)
        .bind(event.signature_validated)
        .bind(&event.ip_address)
        .bind(event.processing_status.as_str())
        .bind(event.processing_attempts)
        .bind(event.next_retry_at)
        .bind(&event.failure_reason)
        .bind(event.payment_transaction_id.map(|id| id.value()))
        .bind(event.refund_transaction_id.map(|id| id.value()))
        .bind(event.created_at)
        .bind(event.updated_at)
        .bind(event.processed_at)
        .bind(event.row_version)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(WebhookInsertOutcome::Inserted),
            None => {
                // Lost the race: surface the winner's id.
                let existing: Uuid = sqlx::query_scalar(
                    "SELECT id FROM webhook_events
                     WHERE provider_id = $1 AND provider_event_id = $2",
                )
                .bind(event.provider_id)
                .bind(&event.provider_event_id)
                .fetch_one(&self.pool)
                .await?;
                Ok(WebhookInsertOutcome::Duplicate {
                    existing_id: existing,
                })
            }
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>, AppError> {
        let row: Option<WebhookRow> = sqlx::query_as("SELECT * FROM webhook_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookRow::into_entity).transpose()
    }

    async fn find_by_provider_event(
        &self,
        provider_id: Uuid,
        provider_event_id: &str,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let row: Option<WebhookRow> = sqlx::query_as(
            "SELECT * FROM webhook_events WHERE provider_id = $1 AND provider_event_id = $2",
        )
        .bind(provider_id)
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WebhookRow::into_entity).transpose()
    }

    async fn update(&self, event: &WebhookEvent) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE webhook_events SET
                parsed_payload = $2,
                processing_status = $3,
                processing_attempts = $4,
                next_retry_at = $5,
                failure_reason = $6,
                payment_transaction_id = $7,
                refund_transaction_id = $8,
                updated_at = $9,
                processed_at = $10,
                row_version = row_version + 1
             WHERE id = $1 AND row_version = $11",
        )
        .bind(event.id)
        .bind(&event.parsed_payload)
        .bind(event.processing_status.as_str())
        .bind(event.processing_attempts)
        .bind(event.next_retry_at)
        .bind(&event.failure_reason)
        .bind(event.payment_transaction_id.map(|id| id.value()))
        .bind(event.refund_transaction_id.map(|id| id.value()))
        .bind(event.updated_at)
        .bind(event.processed_at)
        .bind(event.row_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ConcurrencyConflict(format!(
                "Webhook event {} version {} is stale",
                event.id, event.row_version
            )));
        }
        Ok(())
    }

    async fn due_for_retry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM webhook_events
             WHERE processing_status = 'Failed'
               AND next_retry_at IS NOT NULL
               AND next_retry_at <= $1
             ORDER BY next_retry_at
             LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

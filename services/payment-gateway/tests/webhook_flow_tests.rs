//! Webhook ingestion and processing flows with real Stripe signature
//! validation: completion, duplicate delivery, and tamper rejection.

mod helpers;

use helpers::{seeded_processing_payment, stripe_headers, stripe_signature, test_app};

use payment_gateway::bounded_contexts::payment::domain::entities::WebhookProcessingStatus;
use payment_gateway::bounded_contexts::payment::domain::repository::{
    PaymentTransactionRepository, WebhookEventRepository,
};
use payment_gateway::bounded_contexts::payment::domain::value_objects::PaymentStatus;
use payment_gateway::bounded_contexts::payment::infrastructure::providers::WebhookHeaders;
use payment_gateway::shared::domain::errors::AppError;

fn succeeded_payload(transaction_id: &str) -> String {
    serde_json::json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": {"metadata": {"transactionId": transaction_id}}
    })
    .to_string()
}

#[tokio::test]
async fn stripe_webhook_completes_a_processing_payment() {
    let app = test_app().await;
    let payment = seeded_processing_payment(&app).await;

    // Warm the status cache so invalidation is observable
    app.status.get_status(payment.id.value()).await.unwrap();
    assert!(app.status_cache.get(payment.id.value()).await.is_some());

    let payload = succeeded_payload(&payment.id.to_string());
    let ack = app
        .ingestor
        .ingest("stripe", &payload, &stripe_headers(&payload), None)
        .await
        .unwrap();
    assert!(ack.accepted);
    assert!(!ack.duplicate);

    app.processor.process(ack.event_id).await.unwrap();

    let updated = app.payments.find_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(updated.status, PaymentStatus::Completed);
    assert!(updated.completed_at.is_some());

    // One new audit row for the webhook-driven change
    let logs = app.payments.logs_for_payment(payment.id).await.unwrap();
    assert_eq!(logs.len(), 3);

    // One lifecycle event, cache invalidated
    assert_eq!(app.publisher.events_of_type("payment.completed").len(), 1);
    assert!(app.status_cache.get(payment.id.value()).await.is_none());

    let event = app
        .webhook_events
        .find_by_id(ack.event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.processing_status, WebhookProcessingStatus::Completed);
    assert!(event.signature_validated);
    assert_eq!(event.payment_transaction_id, Some(payment.id));
}

#[tokio::test]
async fn duplicate_delivery_acks_with_the_original_event_id() {
    let app = test_app().await;
    let payment = seeded_processing_payment(&app).await;

    let payload = succeeded_payload(&payment.id.to_string());
    let first = app
        .ingestor
        .ingest("stripe", &payload, &stripe_headers(&payload), None)
        .await
        .unwrap();
    app.processor.process(first.event_id).await.unwrap();

    // Same provider event again
    let second = app
        .ingestor
        .ingest("stripe", &payload, &stripe_headers(&payload), None)
        .await
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.event_id, first.event_id);

    // Reprocessing stays a no-op: one transition, one event
    app.processor.process(second.event_id).await.unwrap();

    let updated = app.payments.find_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(updated.status, PaymentStatus::Completed);
    assert_eq!(app.publisher.events_of_type("payment.completed").len(), 1);

    let logs = app.payments.logs_for_payment(payment.id).await.unwrap();
    assert_eq!(logs.len(), 3);
}

#[tokio::test]
async fn tampered_payload_is_rejected_without_a_row() {
    let app = test_app().await;
    let payment = seeded_processing_payment(&app).await;

    let original = succeeded_payload(&payment.id.to_string());
    let header = stripe_signature(&original, chrono::Utc::now().timestamp());

    // Same signature, different payload
    let tampered = serde_json::json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": {"metadata": {"transactionId": payment.id.to_string()}, "amount": 1}
    })
    .to_string();

    let headers = WebhookHeaders::from([("Stripe-Signature", header.as_str())]);
    let error = app
        .ingestor
        .ingest("stripe", &tampered, &headers, None)
        .await
        .unwrap_err();
    assert!(matches!(error, AppError::InvalidSignature(_)));

    // No event row, no state change, no published events
    assert!(app
        .webhook_events
        .find_by_provider_event(app.stripe_provider.id, "evt_1")
        .await
        .unwrap()
        .is_none());
    let unchanged = app.payments.find_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, PaymentStatus::Processing);
    assert!(app.publisher.events_of_type("payment.completed").is_empty());
}

#[tokio::test]
async fn failed_event_webhook_fails_the_payment() {
    let app = test_app().await;
    let payment = seeded_processing_payment(&app).await;

    let payload = serde_json::json!({
        "id": "evt_2",
        "type": "payment_intent.payment_failed",
        "data": {"metadata": {"transactionId": payment.id.to_string()}}
    })
    .to_string();

    let ack = app
        .ingestor
        .ingest("stripe", &payload, &stripe_headers(&payload), None)
        .await
        .unwrap();
    app.processor.process(ack.event_id).await.unwrap();

    let updated = app.payments.find_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(updated.status, PaymentStatus::Failed);
    assert_eq!(app.publisher.events_of_type("payment.failed").len(), 1);
}

#[tokio::test]
async fn webhook_for_unknown_event_name_is_conservative() {
    let app = test_app().await;
    let payment = seeded_processing_payment(&app).await;

    let payload = serde_json::json!({
        "id": "evt_3",
        "type": "charge.dispute.created",
        "data": {"metadata": {"transactionId": payment.id.to_string()}}
    })
    .to_string();

    let ack = app
        .ingestor
        .ingest("stripe", &payload, &stripe_headers(&payload), None)
        .await
        .unwrap();
    app.processor.process(ack.event_id).await.unwrap();

    // Already Processing: nothing to do, no spurious transition
    let unchanged = app.payments.find_by_id(payment.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, PaymentStatus::Processing);

    let event = app
        .webhook_events
        .find_by_id(ack.event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.processing_status, WebhookProcessingStatus::Completed);
}

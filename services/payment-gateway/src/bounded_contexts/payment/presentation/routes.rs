use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::shared::infrastructure::database::DatabasePool;

use crate::bounded_contexts::payment::application::orchestrator::PaymentOrchestrator;
use crate::bounded_contexts::payment::application::refunds::RefundOrchestrator;
use crate::bounded_contexts::payment::application::status::StatusReadService;
use crate::bounded_contexts::payment::infrastructure::webhooks::WebhookIngestor;

use super::controllers;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub refunds: Arc<RefundOrchestrator>,
    pub status: Arc<StatusReadService>,
    pub ingestor: Arc<WebhookIngestor>,
    pub db: DatabasePool,
}

pub fn create_payment_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(controllers::health))
        .route("/api/v1/payments", post(controllers::submit_payment))
        .route("/api/v1/payments/:transaction_id", get(controllers::get_payment))
        .route(
            "/api/v1/payments/:transaction_id/refunds",
            post(controllers::refund_payment),
        )
        .route("/api/v1/webhooks/:provider", post(controllers::receive_webhook))
        .with_state(state)
}

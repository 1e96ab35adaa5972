pub mod memory;
pub mod postgres;

pub use memory::{
    InMemoryPaymentRepository, InMemoryProviderRepository, InMemoryRefundRepository,
    InMemoryWebhookEventRepository,
};
pub use postgres::{
    PostgresPaymentRepository, PostgresProviderRepository, PostgresRefundRepository,
    PostgresWebhookEventRepository,
};

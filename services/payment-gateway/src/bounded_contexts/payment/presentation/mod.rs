pub mod controllers;
pub mod routes;

pub use routes::{create_payment_routes, AppState};

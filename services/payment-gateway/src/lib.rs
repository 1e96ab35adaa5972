pub mod bounded_contexts;
pub mod config;
pub mod jobs;
pub mod shared;

pub use config::AppConfig;

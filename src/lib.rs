pub mod algorithms;
pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::{Algorithm, GraphRecommender, ModelSpec};
pub use config::Config;
pub use error::{GcnRecError, Result};
pub use models::*;

pub async fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

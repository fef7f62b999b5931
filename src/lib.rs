//! Clinsight Library
//!
//! Clinical-analytics back end: natural-language questions become executed
//! read-only Oracle SQL (Core A), executed result sets become ranked chart
//! recommendations (Core B).

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use services::{
    AuditService, ChartRuleEngine, EventLog, ExecutorPool, HybridRetriever, LearnedFixStore,
    MetadataCache, Orchestrator, PostProcessor, QueryStateStore,
};
pub use utils::{ApiError, ApiResult};

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// No need for Service Container pattern with dyn Any.
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: SqlitePool,

    pub metadata_cache: Arc<MetadataCache>,
    pub executor_pool: Arc<ExecutorPool>,
    pub events: Arc<EventLog>,

    pub orchestrator: Arc<Orchestrator>,
    pub chart_engine: Arc<ChartRuleEngine>,
    pub audit_service: Arc<AuditService>,
    pub query_state: Arc<QueryStateStore>,
}

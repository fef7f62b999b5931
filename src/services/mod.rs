pub mod agents;
pub mod audit;
pub mod chart;
pub mod events;
pub mod intent_guard;
pub mod llm;
pub mod metadata;
pub mod oracle;
pub mod orchestrator;
pub mod policy;
pub mod postprocess;
pub mod repair;
pub mod retrieval;
pub mod risk;

pub use audit::{AuditService, QueryStateStore};
pub use chart::{ChartRuleEngine, VisualizationResponse};
pub use events::EventLog;
pub use metadata::MetadataCache;
pub use oracle::{ExecutorPool, OracleGatewayExecutor};
pub use orchestrator::Orchestrator;
pub use policy::PolicyGate;
pub use postprocess::PostProcessor;
pub use repair::LearnedFixStore;
pub use retrieval::{HybridRetriever, LocalDocStore, NoopEmbedder};

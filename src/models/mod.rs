pub mod chart;
pub mod document;
pub mod orchestrator;

pub use chart::{
    ChartPlan, ChartSpec, ChartType, ColumnSpec, DataFrame, Dtype, dataframe_from_rows,
};
pub use document::{ContextItem, Doc, DocKind, DocMeta, RetrievalContext};
pub use orchestrator::{
    Assumption, ClarifierResult, ConversationTurn, FinalSql, OneshotRequest, OrchestratorResult,
    PlannerDecision, PlannerIntent, PolicyCheck, PolicyReport, RiskInfo, RunRequest, RunResponse,
};

//! Core A request/response and intermediate-stage models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::document::RetrievalContext;

/// Deterministic risk/complexity score for one question.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RiskInfo {
    /// `read` or `risky`
    pub intent: String,
    pub complexity: i32,
    pub risk: i32,
}

impl RiskInfo {
    pub fn is_risky(&self) -> bool {
        self.intent == "risky"
    }
}

/// Normalized description of what the query should compute.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PlannerIntent {
    #[serde(default)]
    pub cohort: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub grain: String,
    #[serde(default)]
    pub comparison: String,
    #[serde(default)]
    pub output_shape: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub intent_summary: String,
}

impl PlannerIntent {
    /// Flattened text used by the intent guard to widen its signal surface.
    pub fn as_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for value in [
            &self.cohort,
            &self.metric,
            &self.time,
            &self.grain,
            &self.comparison,
            &self.output_shape,
            &self.intent_summary,
        ] {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed);
            }
        }
        let mut text = parts.join(" ");
        for filter in &self.filters {
            let trimmed = filter.trim();
            if !trimmed.is_empty() {
                text.push(' ');
                text.push_str(trimmed);
            }
        }
        text.trim().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.as_text().is_empty()
    }
}

/// Why the planner did or did not run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PlannerDecision {
    pub activated: bool,
    pub gate_count: u32,
    pub required_gate_count: u32,
    pub reasons: Vec<String>,
}

/// Structured clarification output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ClarifierResult {
    pub need_clarification: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub clarification_question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub example_inputs: Vec<String>,
    #[serde(default)]
    pub refined_question: String,
}

/// One named policy check with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PolicyCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

/// Policy gate report; `deferred` marks violations the repair loop may still
/// resolve (DUAL-only scope misses).
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PolicyReport {
    pub passed: bool,
    pub checks: Vec<PolicyCheck>,
    #[serde(default)]
    pub deferred: bool,
}

/// Final SQL block of an orchestrator result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct FinalSql {
    pub final_sql: String,
    /// Post-process rule tags applied, in order.
    pub postprocess: Vec<String>,
    pub intent_alignment_issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_alignment_repair: Option<String>,
}

/// Assumption injected by default-scope autofill, surfaced for auditability.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Assumption {
    pub slot: String,
    pub value: String,
}

/// Result of one oneshot pipeline pass.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrchestratorResult {
    pub qid: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<PlannerIntent>,
    pub planner_decision: PlannerDecision,
    pub risk: RiskInfo,
    pub context: RetrievalContext,
    pub draft: String,
    pub final_sql: FinalSql,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarifierResult>,
    /// `advanced`, `demo`, or `clarify`
    pub mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assumptions: Vec<Assumption>,
    pub request_id: String,
}

// ============================================================================
// HTTP request/response bodies
// ============================================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct OneshotRequest {
    pub question: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_role: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RunRequest {
    #[serde(default)]
    pub qid: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub user_ack: bool,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_role: Option<String>,
}

/// Executed result rows plus repair metadata.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunResponse {
    pub columns: Vec<String>,
    #[schema(value_type = Vec<Object>)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_cap: Option<usize>,
    pub elapsed_ms: u64,
    pub query_hash: String,
    pub final_sql: String,
    pub policy: PolicyReport,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repair_rules: Vec<String>,
    #[serde(default)]
    pub repaired: bool,
}

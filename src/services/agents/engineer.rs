//! SQL engineer / expert / repair agents.
//!
//! Three LLM roles over the same strict-JSON contract
//! `{"final_sql": string, "used_tables": [string]}`: the engineer drafts, the
//! expert revises under risk/alignment pressure, and the repair agent rewrites
//! after an execution error.

use serde::Deserialize;
use std::sync::Arc;

use crate::config::{ExpertConfig, LlmConfig};
use crate::models::{PlannerIntent, RiskInfo};
use crate::services::llm::{ChatMessage, LlmClient, TokenUsage, extract_json_object};
use crate::services::repair::ParsedSqlError;
use crate::utils::{ApiError, ApiResult};

const ENGINEER_SYSTEM_PROMPT: &str = "You write a single read-only Oracle SQL query over a \
MIMIC-style clinical schema. Use only tables and columns present in the provided context. \
Rules: SELECT or WITH only; no comments; age semantics use ANCHOR_AGE (never \
ANCHOR_YEAR_GROUP); ICU mortality means DEATHTIME BETWEEN INTIME AND OUTTIME, not \
HOSPITAL_EXPIRE_FLAG alone; never restrict to the first ICU stay unless asked. Respond with \
one JSON object: {\"final_sql\": string, \"used_tables\": [string]}.";

const EXPERT_SYSTEM_PROMPT: &str = "You review and revise a draft Oracle SQL query for a \
clinical question. Fix semantic mismatches between the question and the SQL (ratio shape, \
time buckets, age columns, ICU mortality windows, stratification) while preserving the \
question's cohort. Keep the query read-only. Respond with one JSON object: \
{\"final_sql\": string, \"used_tables\": [string]}.";

const REPAIR_SYSTEM_PROMPT: &str = "A read-only Oracle SQL query failed to execute. Produce a \
corrected query that answers the same question, using the error detail and schema context. \
Prefer minimal edits; never add write statements. Respond with one JSON object: \
{\"final_sql\": string, \"used_tables\": [string]}.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SqlDraft {
    #[serde(default)]
    pub final_sql: String,
    #[serde(default)]
    pub used_tables: Vec<String>,
    #[serde(skip)]
    pub usage: TokenUsage,
}

/// Expert pass trigger per EXPERT_TRIGGER_MODE.
pub fn should_apply_expert_review(config: &ExpertConfig, risk: &RiskInfo) -> bool {
    match config.trigger_mode.as_str() {
        "off" => false,
        "always" => true,
        _ => {
            risk.risk >= config.score_threshold
                || risk.complexity >= (config.score_threshold - 2).max(2)
        }
    }
}

pub struct SqlAgents {
    llm: Arc<dyn LlmClient>,
    engineer_model: String,
    expert_model: String,
    max_tokens: u32,
}

impl SqlAgents {
    pub fn new(llm: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            engineer_model: config.engineer_model.clone(),
            expert_model: config.expert_model.clone(),
            max_tokens: config.max_output_tokens,
        }
    }

    async fn call(
        &self,
        system_prompt: &str,
        model: &str,
        payload: serde_json::Value,
    ) -> ApiResult<SqlDraft> {
        let messages =
            vec![ChatMessage::system(system_prompt), ChatMessage::user(payload.to_string())];
        let response = self
            .llm
            .chat(&messages, model, self.max_tokens, true)
            .await
            .map_err(ApiError::from)?;
        let value = extract_json_object(&response.content)
            .map_err(|err| ApiError::generation_failed(err.to_string()))?;
        let mut draft: SqlDraft = serde_json::from_value(value)
            .map_err(|err| ApiError::generation_failed(format!("bad agent payload: {}", err)))?;
        draft.usage = response.usage;
        if draft.final_sql.trim().is_empty() {
            return Err(ApiError::generation_failed("empty final_sql"));
        }
        draft.final_sql = draft.final_sql.trim().trim_end_matches(';').to_string();
        Ok(draft)
    }

    /// Draft SQL from the question, retrieved context, and optional plan.
    pub async fn engineer(
        &self,
        question: &str,
        question_en: Option<&str>,
        context_text: &str,
        planner_intent: Option<&PlannerIntent>,
    ) -> ApiResult<SqlDraft> {
        let payload = serde_json::json!({
            "question": question,
            "question_en": question_en,
            "context": context_text,
            "planner_intent": planner_intent,
        });
        self.call(ENGINEER_SYSTEM_PROMPT, &self.engineer_model, payload).await
    }

    /// Revise the engineer's draft; `alignment_issues` focuses the review.
    pub async fn expert_review(
        &self,
        question: &str,
        draft_sql: &str,
        context_text: &str,
        planner_intent: Option<&PlannerIntent>,
        alignment_issues: &[String],
    ) -> ApiResult<SqlDraft> {
        let payload = serde_json::json!({
            "question": question,
            "draft_sql": draft_sql,
            "context": context_text,
            "planner_intent": planner_intent,
            "alignment_issues": alignment_issues,
        });
        self.call(EXPERT_SYSTEM_PROMPT, &self.expert_model, payload).await
    }

    /// Rewrite a failed query using the parsed error detail.
    pub async fn repair(
        &self,
        question: &str,
        context_text: &str,
        failed_sql: &str,
        error: &ParsedSqlError,
        planner_intent: Option<&PlannerIntent>,
    ) -> ApiResult<SqlDraft> {
        let payload = serde_json::json!({
            "question": question,
            "context": context_text,
            "failed_sql": failed_sql,
            "error_message": &error.error_message,
            "error_detail": error,
            "planner_intent": planner_intent,
        });
        self.call(REPAIR_SYSTEM_PROMPT, &self.expert_model, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk(risk_score: i32, complexity: i32) -> RiskInfo {
        RiskInfo { intent: "read".to_string(), complexity, risk: risk_score }
    }

    #[test]
    fn expert_trigger_modes() {
        let off = ExpertConfig { trigger_mode: "off".to_string(), score_threshold: 4 };
        assert!(!should_apply_expert_review(&off, &risk(9, 9)));

        let always = ExpertConfig { trigger_mode: "always".to_string(), score_threshold: 4 };
        assert!(should_apply_expert_review(&always, &risk(0, 0)));

        let score = ExpertConfig { trigger_mode: "score".to_string(), score_threshold: 4 };
        assert!(should_apply_expert_review(&score, &risk(4, 0)));
        assert!(should_apply_expert_review(&score, &risk(0, 2)));
        assert!(!should_apply_expert_review(&score, &risk(3, 1)));
    }
}

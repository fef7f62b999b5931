//! Core B: the chart rule engine.
//!
//! Pipeline per request: intent extraction (LLM with rule fallback) ->
//! rule-based plan generation -> post-processing (dedupe, prioritization,
//! explicit-request injection, constant-Y suppression). Rendering is
//! external; the engine emits `ChartSpec` plans only.

pub mod engine;
pub mod intent;
pub mod postprocess;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use utoipa::ToSchema;

use crate::models::{ChartPlan, DataFrame};
use crate::services::llm::LlmClient;

pub use engine::{RetryMode, TimeAxis, TimeInfo, plan_analyses, validate_plan};
pub use intent::{BarStyle, ChartIntent, ContextFlags, IntentExtractor, MultiSplit};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VisualizationResponse {
    pub request_id: String,
    pub plans: Vec<ChartPlan>,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_stage: Option<String>,
    pub attempt_count: u32,
    #[serde(default)]
    pub stage_latency_ms: BTreeMap<String, f64>,
}

pub struct ChartRuleEngine {
    extractor: IntentExtractor,
}

impl ChartRuleEngine {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, model: String, max_tokens: u32) -> Self {
        Self { extractor: IntentExtractor::new(llm, model, max_tokens) }
    }

    /// Produce the ranked plan list for one executed result set.
    pub async fn recommend(
        &self,
        user_query: &str,
        df: &DataFrame,
        retrieved_context: Option<&str>,
    ) -> VisualizationResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut stage_latency: BTreeMap<String, f64> = BTreeMap::new();
        let mut failure_reasons: Vec<String> = Vec::new();

        let started = Instant::now();
        let intent_info = self.extractor.extract(user_query, df, retrieved_context).await;
        stage_latency
            .insert("intent_extraction".to_string(), started.elapsed().as_secs_f64() * 1000.0);

        let started = Instant::now();
        let mut attempt_count = 1u32;
        let mut fallback_stage: Option<String> = None;
        let mut plans =
            engine::plan_analyses(&intent_info, df, RetryMode::Normal, &mut failure_reasons);
        if plans.is_empty() {
            engine::record_failure(&mut failure_reasons, "normal_plan_empty".to_string());
            attempt_count += 1;
            fallback_stage = Some("retry_relaxed".to_string());
            plans =
                engine::plan_analyses(&intent_info, df, RetryMode::Relaxed, &mut failure_reasons);
        }
        stage_latency.insert("rule_engine".to_string(), started.elapsed().as_secs_f64() * 1000.0);

        let started = Instant::now();
        let plans = self.postprocess(plans, &intent_info, df, &mut failure_reasons);
        stage_latency.insert("postprocess".to_string(), started.elapsed().as_secs_f64() * 1000.0);

        if plans.is_empty() {
            engine::record_failure(
                &mut failure_reasons,
                format!("{}_plan_empty", fallback_stage.as_deref().unwrap_or("normal")),
            );
        }

        tracing::debug!(
            "Chart rule engine produced {} plans ({} failure notes)",
            plans.len(),
            failure_reasons.len()
        );
        VisualizationResponse {
            request_id,
            fallback_used: fallback_stage.is_some(),
            fallback_stage,
            attempt_count,
            plans,
            failure_reasons,
            stage_latency_ms: stage_latency,
        }
    }

    fn postprocess(
        &self,
        plans: Vec<ChartPlan>,
        intent_info: &ChartIntent,
        df: &DataFrame,
        failure_reasons: &mut Vec<String>,
    ) -> Vec<ChartPlan> {
        let preferred = intent_info.recommended_chart.as_deref();
        let bar_style = intent::infer_bar_style(&intent_info.user_query);
        let primary = intent_info.primary_outcome.as_deref();
        let group_var = intent_info.group_var.as_deref();

        let plans = postprocess::ensure_hist_plan(plans, preferred, primary, group_var, df);
        let plans = postprocess::ensure_confusion_matrix_plan(plans, preferred, df);
        let plans = postprocess::apply_default_max_categories(plans);
        let plans = postprocess::dedupe_plans(plans);
        let plans = postprocess::prioritize_requested_chart(plans, preferred);
        let plans = postprocess::ensure_bar_plan(plans, bar_style, primary, group_var, df);
        let plans = postprocess::prioritize_bar_plans(plans, bar_style);
        postprocess::filter_constant_y_bar_plans(plans, df, failure_reasons)
    }
}

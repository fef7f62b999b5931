//! Planner gate and the planner LLM agent.
//!
//! The planner is expensive, so it runs only when enough complexity gates
//! fire. When skipped on an age-semantic question, a synthesized intent still
//! pins SQL generation to the ANCHOR_AGE column family.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::config::{LlmConfig, PlannerConfig};
use crate::models::{PlannerDecision, PlannerIntent, RiskInfo};
use crate::services::llm::{ChatMessage, LlmClient, extract_json_object};
use crate::services::retrieval::query_prefers_anchor_age;
use crate::utils::text::token_count;

const PLANNER_SYSTEM_PROMPT: &str = "You are a clinical query planner over a MIMIC-style Oracle \
schema. Summarize the question as a single JSON object: {\"intent\": {\"cohort\": string, \
\"metric\": string, \"time\": string, \"grain\": string, \"comparison\": string, \
\"output_shape\": string, \"filters\": [string], \"intent_summary\": string}}. Keep values \
short and literal; leave unknown fields empty.";

static COMPLEX_SIGNAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(연도별|월별|분기별|주별|성별|연령별|사분위|분위수|추이|비교|대비|상위\s*\d+|top\s*\d+|\d+\s*(일|주|개월|년)\s*(이내|후)|within\s+\d+|after\s+\d+|stratif|quartile|trend)",
    )
    .expect("valid regex")
});
static AGE_GROUPING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(연령대|나이대|연령\s*구간|age\s*(group|band|range)|별\b)").expect("valid regex")
});

/// Count planner gates and decide activation.
pub fn decide_planner_usage(
    config: &PlannerConfig,
    question: &str,
    question_en: Option<&str>,
    risk: &RiskInfo,
) -> PlannerDecision {
    let required = config.required_gate_count.max(1);
    let mut decision = PlannerDecision {
        activated: false,
        gate_count: 0,
        required_gate_count: required,
        reasons: Vec::new(),
    };

    match config.activation_mode.as_str() {
        "off" => {
            decision.reasons.push("planner_mode_off".to_string());
            return decision;
        }
        "always" => {
            decision.activated = true;
            decision.gate_count = required;
            decision.reasons.push("planner_mode_always".to_string());
            return decision;
        }
        _ => {}
    }

    let combined = match question_en {
        Some(en) => format!("{} {}", question, en),
        None => question.to_string(),
    };

    if COMPLEX_SIGNAL_RE.is_match(&combined) {
        decision.gate_count += 1;
        decision.reasons.push("complex_signal_present".to_string());
    }
    if risk.complexity >= config.complexity_threshold {
        decision.gate_count += 1;
        decision.reasons.push(format!(
            "complexity_{}_ge_threshold_{}",
            risk.complexity, config.complexity_threshold
        ));
    }
    if token_count(question) >= config.min_question_tokens {
        decision.gate_count += 1;
        decision.reasons.push("question_token_count_gate".to_string());
    }

    decision.activated = decision.gate_count >= required;
    if !decision.activated {
        decision
            .reasons
            .push(format!("gate_count_{}_below_{}", decision.gate_count, required));
    }
    decision
}

/// Deterministic intent injected when the planner is skipped but the question
/// carries age-without-year semantics. `grain` is set only on an explicit
/// grouping cue; the heuristic is deliberately narrow.
pub fn synthesize_age_hint_intent(question: &str, question_en: Option<&str>) -> Option<PlannerIntent> {
    let combined = match question_en {
        Some(en) => format!("{} {}", question, en),
        None => question.to_string(),
    };
    if !query_prefers_anchor_age(&combined) {
        return None;
    }
    let grain = if AGE_GROUPING_RE.is_match(&combined) { "age_group" } else { "" };
    Some(PlannerIntent {
        grain: grain.to_string(),
        intent_summary:
            "anchor_age preferred: age semantics must use ANCHOR_AGE or explicit age bands, \
             never ANCHOR_YEAR_GROUP"
                .to_string(),
        ..Default::default()
    })
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u32,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self { llm, model: config.planner_model.clone(), max_tokens: config.max_output_tokens }
    }

    /// Produce the planner intent. Failures degrade to `None`; the pipeline
    /// continues without a plan.
    pub async fn plan(
        &self,
        question: &str,
        question_en: Option<&str>,
        context_text: &str,
    ) -> Option<PlannerIntent> {
        let payload = serde_json::json!({
            "question": question,
            "question_en": question_en,
            "context": context_text,
        });
        let messages = vec![
            ChatMessage::system(PLANNER_SYSTEM_PROMPT),
            ChatMessage::user(payload.to_string()),
        ];
        let response = match self.llm.chat(&messages, &self.model, self.max_tokens, true).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Planner unavailable, continuing without plan: {}", err);
                return None;
            }
        };
        let value = match extract_json_object(&response.content) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("Planner returned malformed JSON: {}", err);
                return None;
            }
        };
        let intent_value = value.get("intent").cloned().unwrap_or(value);
        match serde_json::from_value::<PlannerIntent>(intent_value) {
            Ok(intent) => Some(intent),
            Err(err) => {
                tracing::warn!("Planner intent failed to deserialize: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk(complexity: i32) -> RiskInfo {
        RiskInfo { intent: "read".to_string(), complexity, risk: 0 }
    }

    #[test]
    fn two_gates_activate_the_planner() {
        let config = PlannerConfig::default();
        let decision = decide_planner_usage(
            &config,
            "2018년부터 2020년까지 ICU 환자의 연도별 사망률",
            None,
            &risk(4),
        );
        assert!(decision.activated, "{:?}", decision);
        assert!(decision.gate_count >= 2);
    }

    #[test]
    fn simple_question_keeps_planner_off() {
        let config = PlannerConfig::default();
        let decision = decide_planner_usage(&config, "환자 수", None, &risk(0));
        assert!(!decision.activated);
    }

    #[test]
    fn mode_off_never_activates() {
        let config = PlannerConfig { activation_mode: "off".to_string(), ..Default::default() };
        let decision = decide_planner_usage(&config, "연도별 사망률 비교", None, &risk(9));
        assert!(!decision.activated);
    }

    #[test]
    fn age_hint_sets_grain_only_with_grouping_cue() {
        let hint = synthesize_age_hint_intent("연령대별 환자 분포", None).expect("hint");
        assert_eq!(hint.grain, "age_group");

        let hint = synthesize_age_hint_intent("평균 나이 알려줘", None).expect("hint");
        assert_eq!(hint.grain, "");

        assert!(synthesize_age_hint_intent("연도별 입원 건수", None).is_none());
    }
}

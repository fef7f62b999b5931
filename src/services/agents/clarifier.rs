//! Question clarifier.
//!
//! Clarification triggers only on definition ambiguity from a small rule
//! table; the LLM may volunteer a clarification too, but its output is
//! downgraded unless it carries a definition signal. Prior turns feed a slot
//! memory (기간/대상/비교/지표) so an answered clarification folds back into a
//! refined question instead of looping.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::models::{Assumption, ClarifierResult, ConversationTurn};
use crate::services::llm::{ChatMessage, LlmClient, extract_json_object};
use crate::utils::text::{contains_korean, strip_english_tokens_for_korean};

const CLARIFIER_SYSTEM_PROMPT: &str = "You review clinical database questions for ambiguity. \
Respond with a single JSON object: {\"need_clarification\": bool, \"reason\": string, \
\"clarification_question\": string, \"options\": [string], \"example_inputs\": [string], \
\"refined_question\": string}. Only request clarification when a medical term's DEFINITION is \
ambiguous (diagnostic criteria, code set, medication-based definition). Scope or cosmetic \
ambiguity must not trigger clarification. Answer in the question's language.";

static FOLLOWUP_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(그\s*조건|해당\s*조건|그\s*중에서|거기서|방금|아까|위\s*결과|그럼|then\b|what\s+about)")
        .expect("valid regex")
});
static DEFINITION_SIGNAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(정의|기준|판정|분류|criterion|criteria|definition|define|rule)")
        .expect("valid regex")
});
static PERIOD_VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}\s*년(\s*부터)?(\s*~?\s*\d{4}\s*년(\s*까지)?)?|전체\s*기간|최근\s*\d+\s*(일|주|개월|년))")
        .expect("valid regex")
});
static COHORT_VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(전체\s*환자|[가-힣A-Za-z0-9_\s]{1,24}환자|icu|중환자실)").expect("valid regex")
});
static METRIC_VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(사망률|생존율|재입원율|비율|평균|중앙값|환자\s*수|건수|분포)").expect("valid regex")
});
static LABELED_SLOT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(기간|대상|비교|지표)\s*[:：]\s*([^/\n)]+)").expect("valid regex")
});

struct DefinitionAmbiguityRule {
    id: &'static str,
    match_terms: &'static [&'static str],
    criteria_terms: &'static [&'static str],
    reason_ko: &'static str,
    question_ko: &'static str,
    options_ko: &'static [&'static str],
    reason_en: &'static str,
    question_en: &'static str,
    options_en: &'static [&'static str],
}

static DEFINITION_AMBIGUITY_RULES: &[DefinitionAmbiguityRule] = &[DefinitionAmbiguityRule {
    id: "hypertension_definition",
    match_terms: &["고혈압", "hypertension", "htn"],
    criteria_terms: &[
        "i10",
        "i11",
        "i12",
        "i13",
        "i15",
        "icd",
        "진단코드",
        "진단 코드",
        "코드기반",
        "코드 기반",
        "항고혈압",
        "복용",
        "병력",
        "comorbidity",
        "history",
        "위기 제외",
        "hypertensive crisis",
    ],
    reason_ko: "의학적 정의 기준이 여러 가지라 먼저 기준을 정해야 합니다.",
    question_ko: "'고혈압'을 어떤 기준으로 볼까요? 정의 기준을 선택해 주세요.",
    options_ko: &[
        "진단 코드 기반 (I10-I15)",
        "항고혈압제 복용 기준",
        "입실 전 병력(comorbidity)",
        "고혈압 위기 제외",
    ],
    reason_en: "Multiple medical definitions are possible, so a definition criterion is required first.",
    question_en: "How should hypertension be defined? Please pick a definition criterion.",
    options_en: &[
        "Diagnosis-code based (I10-I15)",
        "Antihypertensive medication use",
        "Pre-admission comorbidity history",
        "Exclude hypertensive crisis",
    ],
}];

fn normalize_conversation(conversation: &[ConversationTurn]) -> Vec<ConversationTurn> {
    conversation
        .iter()
        .rev()
        .take(20)
        .rev()
        .filter_map(|turn| {
            let role = turn.role.trim().to_lowercase();
            let content: String = turn.content.trim().chars().take(2000).collect();
            if content.is_empty() || !matches!(role.as_str(), "user" | "assistant") {
                return None;
            }
            Some(ConversationTurn { role, content })
        })
        .collect()
}

fn looks_like_followup(question: &str) -> bool {
    let text = question.trim();
    if text.is_empty() {
        return false;
    }
    if FOLLOWUP_CUE_RE.is_match(text) {
        return true;
    }
    let lowered = text.to_lowercase();
    lowered.chars().count() <= 24
        && matches!(lowered.as_str(), "그럼" | "then" | "and then" | "what about this" | "what about that")
}

fn previous_user_question(question: &str, turns: &[ConversationTurn]) -> Option<String> {
    turns
        .iter()
        .rev()
        .filter(|turn| turn.role == "user")
        .map(|turn| turn.content.trim())
        .find(|content| !content.is_empty() && *content != question.trim())
        .map(|content| content.to_string())
}

/// Prepend the previous user question under a follow-up tag so downstream
/// stages see the full constraint chain.
pub fn inject_followup_context(question: &str, conversation: &[ConversationTurn]) -> String {
    if !looks_like_followup(question) {
        return question.to_string();
    }
    let turns = normalize_conversation(conversation);
    match previous_user_question(question, &turns) {
        Some(previous) => format!("[후속 질문] {} / 현재 질문: {}", previous, question.trim()),
        None => question.to_string(),
    }
}

fn matched_definition_rule(question: &str) -> Option<&'static DefinitionAmbiguityRule> {
    let lowered = question.to_lowercase();
    DEFINITION_AMBIGUITY_RULES.iter().find(|rule| {
        rule.match_terms.iter().any(|term| lowered.contains(term))
            && !rule.criteria_terms.iter().any(|term| lowered.contains(term))
    })
}

fn extract_slot_answers(turns: &[ConversationTurn]) -> BTreeMap<String, String> {
    let mut slots: BTreeMap<String, String> = BTreeMap::new();
    for turn in turns {
        if turn.role != "user" {
            continue;
        }
        for caps in LABELED_SLOT_RE.captures_iter(&turn.content) {
            let slot = match &caps[1] {
                "기간" => "period",
                "대상" => "cohort",
                "비교" => "comparison",
                "지표" => "metric",
                _ => continue,
            };
            let value = caps[2].trim().to_string();
            if !value.is_empty() {
                slots.insert(slot.to_string(), truncate_slot(&value));
            }
        }
        // Free-text answers still count when the user skipped the labels.
        if !slots.contains_key("period") {
            if let Some(m) = PERIOD_VALUE_RE.find(&turn.content) {
                slots.insert("period".to_string(), truncate_slot(m.as_str()));
            }
        }
        if !slots.contains_key("cohort") {
            if let Some(m) = COHORT_VALUE_RE.find(&turn.content) {
                slots.insert("cohort".to_string(), truncate_slot(m.as_str()));
            }
        }
        if !slots.contains_key("metric") {
            if let Some(m) = METRIC_VALUE_RE.find(&turn.content) {
                slots.insert("metric".to_string(), truncate_slot(m.as_str()));
            }
        }
    }
    slots
}

fn truncate_slot(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= 80 {
        trimmed.to_string()
    } else {
        trimmed.chars().take(80).collect()
    }
}

fn compose_refined_question(base: &str, slots: &BTreeMap<String, String>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(period) = slots.get("period") {
        parts.push(format!("기간: {}", period));
    }
    if let Some(cohort) = slots.get("cohort") {
        parts.push(format!("대상: {}", cohort));
    }
    if let Some(metric) = slots.get("metric") {
        parts.push(format!("지표: {}", metric));
    }
    if parts.is_empty() {
        return base.trim().to_string();
    }
    format!("{} ({})", base.trim(), parts.join(" / "))
}

fn enforce_korean_only(result: &mut ClarifierResult) {
    result.reason = strip_english_tokens_for_korean(&result.reason);
    result.clarification_question = strip_english_tokens_for_korean(&result.clarification_question);
}

/// Default-scope autofill (feature-flagged off by default): fill missing
/// period/cohort with whole-range defaults and surface them as assumptions.
pub fn build_default_scope(question: &str, slots: &BTreeMap<String, String>) -> (String, Vec<Assumption>) {
    let mut assumptions: Vec<Assumption> = Vec::new();
    let mut effective = slots.clone();
    if !effective.contains_key("period") && !PERIOD_VALUE_RE.is_match(question) {
        effective.insert("period".to_string(), "전체 기간".to_string());
        assumptions.push(Assumption { slot: "period".to_string(), value: "전체 기간".to_string() });
    }
    if !effective.contains_key("cohort") && !COHORT_VALUE_RE.is_match(question) {
        effective.insert("cohort".to_string(), "전체 환자".to_string());
        assumptions.push(Assumption { slot: "cohort".to_string(), value: "전체 환자".to_string() });
    }
    if assumptions.is_empty() {
        return (question.to_string(), assumptions);
    }
    (compose_refined_question(question, &effective), assumptions)
}

pub struct Clarifier {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u32,
}

impl Clarifier {
    pub fn new(llm: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            model: config.clarifier_model.clone(),
            max_tokens: config.max_output_tokens_clarifier.max(150),
        }
    }

    pub async fn evaluate(
        &self,
        question: &str,
        conversation: &[ConversationTurn],
    ) -> ClarifierResult {
        let turns = normalize_conversation(conversation);
        let slots = extract_slot_answers(&turns);
        let korean = contains_korean(question);

        // Definition-ambiguity rule table runs first and never needs the LLM.
        if let Some(rule) = matched_definition_rule(question) {
            let criteria_answered = turns.iter().any(|turn| {
                let lowered = turn.content.to_lowercase();
                rule.criteria_terms.iter().any(|term| lowered.contains(term))
            });
            if !criteria_answered {
                let mut result = if korean {
                    ClarifierResult {
                        need_clarification: true,
                        reason: rule.reason_ko.to_string(),
                        clarification_question: rule.question_ko.to_string(),
                        options: rule.options_ko.iter().map(|s| s.to_string()).collect(),
                        example_inputs: vec![
                            format!("{} ({})", question.trim(), rule.options_ko[0]),
                            format!("{} ({})", question.trim(), rule.options_ko[1]),
                        ],
                        refined_question: String::new(),
                    }
                } else {
                    ClarifierResult {
                        need_clarification: true,
                        reason: rule.reason_en.to_string(),
                        clarification_question: rule.question_en.to_string(),
                        options: rule.options_en.iter().map(|s| s.to_string()).collect(),
                        example_inputs: vec![
                            format!("{} ({})", question.trim(), rule.options_en[0]),
                            format!("{} ({})", question.trim(), rule.options_en[1]),
                        ],
                        refined_question: String::new(),
                    }
                };
                tracing::debug!("Clarifier rule fired: {}", rule.id);
                if korean {
                    // Keep the curated option labels as-is; only free text is
                    // stripped of English tokens.
                    result.reason = strip_english_tokens_for_korean(&result.reason);
                }
                return result;
            }
        }

        // A fully answered slot memory folds into a refined question, but
        // only when this conversation actually ran a clarification prompt.
        let clarification_was_active = turns.iter().any(|turn| {
            turn.role == "assistant"
                && DEFINITION_SIGNAL_RE.is_match(&turn.content)
                && turn.content.contains('?')
        });
        if clarification_was_active && slots.len() >= 2 {
            return ClarifierResult {
                need_clarification: false,
                refined_question: compose_refined_question(question, &slots),
                ..Default::default()
            };
        }

        // LLM pass for ambiguity the rule table does not cover. Any failure
        // degrades to no-clarification.
        let payload = serde_json::json!({
            "latest_question": question,
            "conversation": turns
                .iter()
                .map(|t| serde_json::json!({"role": &t.role, "content": &t.content}))
                .collect::<Vec<_>>(),
        });
        let messages = vec![
            ChatMessage::system(CLARIFIER_SYSTEM_PROMPT),
            ChatMessage::user(payload.to_string()),
        ];
        let response = match self.llm.chat(&messages, &self.model, self.max_tokens, true).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Clarifier LLM unavailable, skipping clarification: {}", err);
                return ClarifierResult::default();
            }
        };
        let mut result: ClarifierResult = match extract_json_object(&response.content)
            .and_then(|value| serde_json::from_value(value).map_err(Into::into))
        {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!("Clarifier returned malformed JSON, skipping: {}", err);
                return ClarifierResult::default();
            }
        };

        // Downgrade: clarification without a definition signal is noise.
        if result.need_clarification {
            let signal_text =
                format!("{} {}", result.reason, result.clarification_question);
            if !DEFINITION_SIGNAL_RE.is_match(&signal_text) {
                tracing::debug!("Clarifier output downgraded: no definition signal");
                result.need_clarification = false;
                result.clarification_question.clear();
                result.options.clear();
            }
        }
        if korean && result.need_clarification {
            enforce_korean_only(&mut result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypertension_without_criteria_matches_rule() {
        assert!(matched_definition_rule("고혈압 환자 수 알려줘").is_some());
        assert!(matched_definition_rule("진단 코드 기반 고혈압 환자 수").is_none());
        assert!(matched_definition_rule("패혈증 환자 수").is_none());
    }

    #[test]
    fn followup_cue_prepends_previous_question() {
        let conversation = vec![
            ConversationTurn { role: "user".into(), content: "2019년 ICU 환자 수".into() },
            ConversationTurn { role: "assistant".into(), content: "1234명입니다.".into() },
        ];
        let injected = inject_followup_context("그 조건에서 사망률은?", &conversation);
        assert!(injected.starts_with("[후속 질문]"));
        assert!(injected.contains("2019년 ICU 환자 수"));
    }

    #[test]
    fn slot_answers_compose_refined_question() {
        let turns = vec![
            ConversationTurn { role: "assistant".into(), content: "기간: 어떤 기간인가요?".into() },
            ConversationTurn { role: "user".into(), content: "2018년부터 2020년".into() },
            ConversationTurn { role: "user".into(), content: "전체 환자 대상 사망률".into() },
        ];
        let slots = extract_slot_answers(&turns);
        assert!(slots.contains_key("period"));
        assert!(slots.contains_key("cohort"));
        let refined = compose_refined_question("사망률 알려줘", &slots);
        assert!(refined.contains("기간:"));
        assert!(refined.contains("대상:"));
    }

    #[test]
    fn default_scope_fill_surfaces_assumptions() {
        let (refined, assumptions) = build_default_scope("사망률 알려줘", &BTreeMap::new());
        assert_eq!(assumptions.len(), 2);
        assert!(refined.contains("전체 기간"));
        assert!(refined.contains("전체 환자"));
    }
}

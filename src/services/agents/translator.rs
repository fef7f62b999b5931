//! Korean to English question translation.
//!
//! The LLM does the translation; a deterministic post-pass restores
//! admission-type category fidelity because a single swapped category
//! (응급 vs 긴급) silently changes the cohort.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::services::llm::{ChatMessage, LlmClient, TokenUsage};

const TRANSLATE_SYSTEM_PROMPT: &str = "Translate Korean to concise English. Preserve medical \
terms, acronyms, table/column names, and code values as-is. Do not normalize or substitute \
categorical meanings. For explicit admission-type category semantics, preserve exact mapping: \
응급->EMERGENCY, 긴급->URGENT, 예약/선택 입원->ELECTIVE. Do not force this mapping when the \
source does not ask about admission type categories. If the source uses one category, never \
replace it with another. Return only the translation.";

static ELECTIVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\belective\b").expect("valid regex"));

fn replace_word(text: &str, src: &str, dst: &str) -> String {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(src));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, dst).into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Deterministic fidelity pass over the LLM translation.
pub fn enforce_admission_type_fidelity(source_ko: &str, translated_en: &str) -> String {
    let mut text = translated_en.to_string();
    if source_ko.is_empty() || text.is_empty() {
        return text;
    }

    let compact: String = source_ko.to_lowercase().split_whitespace().collect();
    let has_emergency_ko = source_ko.contains("응급");
    let has_urgent_ko = source_ko.contains("긴급");
    let has_elective_ko = source_ko.contains("예약") || compact.contains("선택입원");
    let has_admission_type_phrase =
        compact.contains("입원유형") || compact.contains("admissiontype");
    let has_admission_type_category =
        source_ko.contains("입원") && (has_emergency_ko || has_urgent_ko || has_elective_ko);
    if !(has_admission_type_phrase || has_admission_type_category) {
        return text;
    }

    // Never let the model swap 응급(EMERGENCY) and 긴급(URGENT).
    if has_urgent_ko && !has_emergency_ko {
        text = replace_word(&text, "emergency", "urgent");
    } else if has_emergency_ko && !has_urgent_ko {
        text = replace_word(&text, "urgent", "emergency");
    }

    // 예약/선택 입원 is ELECTIVE, not scheduled/optional/selective.
    if has_elective_ko && !ELECTIVE_RE.is_match(&text) {
        text = replace_word(&text, "scheduled", "elective");
        text = replace_word(&text, "optional", "elective");
        text = replace_word(&text, "selective", "elective");
    }

    text
}

pub struct Translator {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u32,
}

impl Translator {
    pub fn new(llm: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            model: config.expert_model.clone(),
            max_tokens: config.max_output_tokens.min(256),
        }
    }

    /// Translate to English. Returns `None` when the provider is down; the
    /// pipeline then continues with the Korean question.
    pub async fn translate(&self, text: &str) -> Option<(String, TokenUsage)> {
        let messages =
            vec![ChatMessage::system(TRANSLATE_SYSTEM_PROMPT), ChatMessage::user(text)];
        let response = match self.llm.chat(&messages, &self.model, self.max_tokens, false).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Translator unavailable, keeping Korean question: {}", err);
                return None;
            }
        };
        let mut translated = response.content.trim().to_string();
        if translated.starts_with('"') && translated.ends_with('"') && translated.len() >= 2 {
            translated = translated[1..translated.len() - 1].trim().to_string();
        }
        if translated.is_empty() {
            return None;
        }
        let translated = enforce_admission_type_fidelity(text, &translated);
        Some((translated, response.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_is_never_swapped_to_emergency() {
        let fixed = enforce_admission_type_fidelity(
            "긴급 입원 환자 수",
            "Number of emergency admissions",
        );
        assert_eq!(fixed, "Number of urgent admissions");
    }

    #[test]
    fn emergency_is_never_swapped_to_urgent() {
        let fixed = enforce_admission_type_fidelity(
            "응급 입원 환자 수",
            "Number of urgent admissions",
        );
        assert_eq!(fixed, "Number of emergency admissions");
    }

    #[test]
    fn scheduled_becomes_elective_for_reserved_admissions() {
        let fixed = enforce_admission_type_fidelity(
            "예약 입원 환자 비율",
            "Share of scheduled admissions",
        );
        assert_eq!(fixed, "Share of elective admissions");
    }

    #[test]
    fn non_admission_text_is_untouched() {
        let fixed = enforce_admission_type_fidelity(
            "응급실 경유 환자의 평균 나이",
            "Average age of patients admitted via the emergency department",
        );
        assert!(fixed.contains("emergency department"));
    }
}

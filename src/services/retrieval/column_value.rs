//! Column-value dictionary matcher.
//!
//! Maps user phrasing onto concrete `(table, column, value)` rows so the SQL
//! agents see exact categorical values instead of guessing them. A match is
//! emitted only when at least one structural (`table.column`) or value hit
//! exists; description-only token overlap is too weak on its own.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::models::{Doc, DocMeta};
use crate::services::metadata::{ColumnValueEntry, MetadataCache};
use crate::utils::text::{normalize, strip_korean_particle, tokenize};

const STRUCTURAL_HIT_SCORE: f64 = 28.0;
const VALUE_HIT_SCORE: f64 = 28.0;
const TOKEN_HIT_SCORE: f64 = 6.0;
const DESCRIPTION_TOKEN_SCORE: f64 = 4.0;

static CURRENT_SERVICE_INTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(현재|지금|담당|소속|curr|current)").expect("valid regex")
});

#[derive(Debug, Clone)]
pub struct ColumnValueMatch {
    pub doc: Doc,
    pub score: f64,
    /// Postprocess metadata tags raised while matching (e.g. the
    /// PREV_SERVICE -> CURR_SERVICE remap).
    pub notes: Vec<String>,
}

pub struct ColumnValueMatcher {
    cache: Arc<MetadataCache>,
}

impl ColumnValueMatcher {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }

    pub fn match_question(&self, question: &str) -> Vec<ColumnValueMatch> {
        let entries = self.cache.column_values();
        if entries.is_empty() {
            return Vec::new();
        }
        let normalized = normalize(question);
        let tokens: Vec<String> = tokenize(question)
            .into_iter()
            .map(|t| strip_korean_particle(&t).to_string())
            .collect();

        let mut matches: Vec<ColumnValueMatch> = Vec::new();
        for entry in entries.iter() {
            if let Some(m) = score_entry(entry, &normalized, &tokens) {
                matches.push(m);
            }
        }
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }
}

fn score_entry(
    entry: &ColumnValueEntry,
    normalized_question: &str,
    question_tokens: &[String],
) -> Option<ColumnValueMatch> {
    let mut entry = entry.clone();
    let mut notes: Vec<String> = Vec::new();

    // The value dictionary carries historical service assignments under
    // PREV_SERVICE; restriction-style questions almost always mean the
    // current service, so remap and surface the decision.
    if entry.table.eq_ignore_ascii_case("SERVICES")
        && entry.column.eq_ignore_ascii_case("PREV_SERVICE")
        && CURRENT_SERVICE_INTENT.is_match(normalized_question)
    {
        entry.column = "CURR_SERVICE".to_string();
        notes.push("column_value_prev_to_curr_service".to_string());
    }

    let mut score = 0.0;
    let mut structural_or_value_hit = false;

    let table_column = format!("{}.{}", entry.table, entry.column).to_lowercase();
    if normalized_question.contains(&table_column) {
        score += STRUCTURAL_HIT_SCORE;
        structural_or_value_hit = true;
    }

    let value_lower = entry.value.to_lowercase();
    if !value_lower.is_empty() && normalized_question.contains(&value_lower) {
        score += VALUE_HIT_SCORE;
        structural_or_value_hit = true;
    }

    let value_tokens: Vec<String> = tokenize(&entry.value)
        .into_iter()
        .map(|t| strip_korean_particle(&t).to_string())
        .collect();
    let description_tokens: Vec<String> = tokenize(&entry.description)
        .into_iter()
        .map(|t| strip_korean_particle(&t).to_string())
        .collect();

    for token in question_tokens {
        if token.len() < 2 && !crate::utils::text::contains_korean(token) {
            continue;
        }
        if value_tokens.iter().any(|t| t == token) {
            score += TOKEN_HIT_SCORE;
            structural_or_value_hit = true;
        } else if description_tokens.iter().any(|t| t == token) {
            score += DESCRIPTION_TOKEN_SCORE;
        }
    }

    if !structural_or_value_hit || score <= 0.0 {
        return None;
    }

    let text = format!(
        "{}.{} has value '{}'{}",
        entry.table,
        entry.column,
        entry.value,
        if entry.description.is_empty() {
            String::new()
        } else {
            format!(" ({})", entry.description)
        }
    );
    let doc = Doc::new(
        text,
        DocMeta::ColumnValue { table: entry.table.clone(), column: entry.column.clone() },
    );
    Some(ColumnValueMatch { doc, score, notes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(table: &str, column: &str, value: &str, description: &str) -> ColumnValueEntry {
        ColumnValueEntry {
            table: table.to_string(),
            column: column.to_string(),
            value: value.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn value_substring_match_emits_doc() {
        let e = entry("ADMISSIONS", "ADMISSION_TYPE", "EMERGENCY", "응급 입원");
        let tokens: Vec<String> = vec!["emergency".into(), "입원".into()];
        let m = score_entry(&e, "how many emergency admissions", &tokens).expect("match");
        assert!(m.score >= VALUE_HIT_SCORE);
    }

    #[test]
    fn description_only_overlap_is_not_enough() {
        let e = entry("ADMISSIONS", "ADMISSION_TYPE", "ELECTIVE", "예약 입원");
        let tokens: Vec<String> = vec!["입원".into()];
        assert!(score_entry(&e, "입원 건수", &tokens).is_none());
    }

    #[test]
    fn prev_service_remaps_for_current_intent() {
        let e = entry("SERVICES", "PREV_SERVICE", "MED", "내과");
        let tokens: Vec<String> = vec!["현재".into(), "med".into()];
        let m = score_entry(&e, "현재 med 과 환자", &tokens).expect("match");
        assert!(m.notes.iter().any(|n| n == "column_value_prev_to_curr_service"));
        assert!(m.doc.text.contains("CURR_SERVICE"));
    }
}

//! Label-intent matcher for procedure-like concepts carried in
//! `D_ITEMS.LABEL` (hemodialysis, intubation, ...) rather than ICD tables.

use std::sync::Arc;

use crate::models::{Doc, DocMeta};
use crate::services::metadata::{LabelIntentProfile, MetadataCache};
use crate::utils::text::normalize;

const ANCHOR_HIT_SCORE: f64 = 10.0;
const REQUIRED_HIT_SCORE: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct LabelIntentMatch {
    pub name: String,
    pub score: f64,
    pub doc: Doc,
}

pub struct LabelIntentMatcher {
    cache: Arc<MetadataCache>,
}

impl LabelIntentMatcher {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }

    pub fn match_question(&self, question: &str) -> Vec<LabelIntentMatch> {
        let normalized = normalize(question);
        let mut matches: Vec<LabelIntentMatch> = Vec::new();
        for profile in self.cache.label_intents().iter() {
            if let Some(m) = score_profile(profile, &normalized) {
                matches.push(m);
            }
        }
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }
}

fn score_profile(profile: &LabelIntentProfile, normalized_question: &str) -> Option<LabelIntentMatch> {
    let anchor_hits = profile
        .anchor_terms
        .iter()
        .filter(|t| !t.trim().is_empty() && normalized_question.contains(&t.trim().to_lowercase()))
        .count();
    if anchor_hits == 0 {
        return None;
    }
    // Required terms only count alongside an anchor hit.
    let required_hits = profile
        .required_terms
        .iter()
        .filter(|t| !t.trim().is_empty() && normalized_question.contains(&t.trim().to_lowercase()))
        .count();
    if !profile.required_terms.is_empty() && required_hits == 0 {
        return None;
    }

    let score = anchor_hits as f64 * ANCHOR_HIT_SCORE + required_hits as f64 * REQUIRED_HIT_SCORE;
    let hint = if profile.hint.trim().is_empty() {
        format!(
            "{}: match D_ITEMS.LABEL via LIKE on {}",
            profile.name,
            profile
                .anchor_terms
                .iter()
                .map(|t| format!("'%{}%'", t))
                .collect::<Vec<_>>()
                .join(" OR ")
        )
    } else {
        profile.hint.clone()
    };
    Some(LabelIntentMatch {
        name: profile.name.clone(),
        score,
        doc: Doc::new(hint, DocMeta::LabelIntent { name: profile.name.clone() }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, anchors: &[&str], required: &[&str]) -> LabelIntentProfile {
        LabelIntentProfile {
            name: name.to_string(),
            anchor_terms: anchors.iter().map(|s| s.to_string()).collect(),
            required_terms: required.iter().map(|s| s.to_string()).collect(),
            hint: String::new(),
        }
    }

    #[test]
    fn anchor_alone_matches_when_no_required_terms() {
        let p = profile("hemodialysis", &["투석", "dialysis"], &[]);
        let m = score_profile(&p, &normalize("투석 환자 수")).expect("match");
        assert!(m.score >= ANCHOR_HIT_SCORE);
    }

    #[test]
    fn required_terms_gate_the_anchor() {
        let p = profile("crrt", &["crrt"], &["continuous", "지속"]);
        assert!(score_profile(&p, &normalize("crrt 장비 목록")).is_none());
        assert!(score_profile(&p, &normalize("지속 crrt 환자")).is_some());
    }
}

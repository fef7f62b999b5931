//! In-crate BM25 scorer.
//!
//! Corpora are small (a few thousand docs per type) and reloaded on mtime
//! change, so a full index lifecycle is unnecessary; the scorer builds its
//! term statistics per call set.

use std::collections::HashMap;

use crate::utils::text::{strip_korean_particle, tokenize};

const K1: f64 = 1.5;
const B: f64 = 0.75;

fn terms(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .map(|t| strip_korean_particle(&t).to_string())
        .collect()
}

/// BM25 scores for `query` against `(id, text)` docs, normalized to `[0, 1]`
/// by the best-scoring document so the hybrid mixer can weight them.
pub fn score(query: &str, docs: &[(String, String)]) -> HashMap<String, f64> {
    let query_terms = terms(query);
    if query_terms.is_empty() || docs.is_empty() {
        return HashMap::new();
    }

    let tokenized: Vec<(usize, Vec<String>)> = docs
        .iter()
        .enumerate()
        .map(|(idx, (_, text))| (idx, terms(text)))
        .collect();

    let doc_count = tokenized.len() as f64;
    let avg_len = tokenized.iter().map(|(_, t)| t.len() as f64).sum::<f64>() / doc_count;
    let avg_len = avg_len.max(1.0);

    // Document frequency per query term.
    let mut df: HashMap<&str, f64> = HashMap::new();
    for term in &query_terms {
        let hits = tokenized
            .iter()
            .filter(|(_, tokens)| tokens.iter().any(|t| t == term))
            .count() as f64;
        df.insert(term.as_str(), hits);
    }

    let mut raw: HashMap<String, f64> = HashMap::new();
    for (idx, tokens) in &tokenized {
        let len = tokens.len() as f64;
        let mut doc_score = 0.0;
        for term in &query_terms {
            let tf = tokens.iter().filter(|t| *t == term).count() as f64;
            if tf == 0.0 {
                continue;
            }
            let n = *df.get(term.as_str()).unwrap_or(&0.0);
            let idf = ((doc_count - n + 0.5) / (n + 0.5) + 1.0).ln();
            doc_score += idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * len / avg_len));
        }
        if doc_score > 0.0 {
            raw.insert(docs[*idx].0.clone(), doc_score);
        }
    }

    let max = raw.values().cloned().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return raw;
    }
    raw.into_iter().map(|(id, s)| (id, s / max)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_doc_outranks_unrelated_doc() {
        let docs = vec![
            ("a".to_string(), "ICUSTAYS: ICU stay table with INTIME OUTTIME".to_string()),
            ("b".to_string(), "PHARMACY: medication orders".to_string()),
        ];
        let scores = score("ICU stay intime", &docs);
        assert!(scores.get("a").copied().unwrap_or(0.0) > scores.get("b").copied().unwrap_or(0.0));
        assert!((scores.get("a").copied().unwrap_or(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn korean_particles_do_not_block_matches() {
        let docs = vec![("a".to_string(), "중환자실 재원 기간".to_string())];
        let scores = score("중환자실에서", &docs);
        assert!(scores.get("a").copied().unwrap_or(0.0) > 0.0);
    }
}

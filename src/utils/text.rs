//! Question-text helpers shared by the risk classifier, retriever, and
//! clarifier: tokenization, Korean detection, and particle stripping.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static HANGUL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\u{ac00}-\u{d7a3}]").expect("valid regex"));
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+|[\u{ac00}-\u{d7a3}]+").expect("valid regex"));
static ASCII_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9_\-]*").expect("valid regex"));
static MULTI_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Trailing Korean particles stripped before dictionary token matching.
const KOREAN_PARTICLES: &[&str] = &[
    "에서", "으로", "은", "는", "이", "가", "을", "를", "의", "에", "로", "과", "와", "도",
];

pub fn contains_korean(text: &str) -> bool {
    HANGUL_RE.is_match(text)
}

/// Lowercase + collapse whitespace. Idempotent by construction:
/// `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(text: &str) -> String {
    MULTI_SPACE_RE.replace_all(text.trim(), " ").to_lowercase()
}

/// Token stream used for BM25, lexical overlap, and token counting.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&normalize(text))
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn token_count(text: &str) -> usize {
    TOKEN_RE.find_iter(text).count()
}

/// Strip one trailing particle from a Korean token, longest first.
pub fn strip_korean_particle(token: &str) -> &str {
    if !contains_korean(token) {
        return token;
    }
    for particle in KOREAN_PARTICLES {
        if let Some(stem) = token.strip_suffix(particle) {
            if !stem.is_empty() {
                return stem;
            }
        }
    }
    token
}

/// Jaccard-style lexical overlap between a query and a document text.
pub fn lexical_overlap(query: &str, text: &str) -> f64 {
    let q_tokens: HashSet<String> = tokenize(query)
        .into_iter()
        .map(|t| strip_korean_particle(&t).to_string())
        .collect();
    if q_tokens.is_empty() {
        return 0.0;
    }
    let d_tokens: HashSet<String> = tokenize(text)
        .into_iter()
        .map(|t| strip_korean_particle(&t).to_string())
        .collect();
    if d_tokens.is_empty() {
        return 0.0;
    }
    let hits = q_tokens.iter().filter(|t| d_tokens.contains(*t)).count();
    hits as f64 / q_tokens.len() as f64
}

/// Remove embedded English tokens from a Korean sentence, keeping separators
/// readable. Used to enforce Korean-only clarifier output.
pub fn strip_english_tokens_for_korean(text: &str) -> String {
    let cleaned = ASCII_WORD_RE.replace_all(text, "");
    let cleaned = Regex::new(r"\s*[:：]\s*")
        .expect("valid regex")
        .replace_all(&cleaned, ": ");
    let cleaned = Regex::new(r"\s*[/|]\s*")
        .expect("valid regex")
        .replace_all(&cleaned, " / ");
    MULTI_SPACE_RE
        .replace_all(&cleaned, " ")
        .trim_matches(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent_for_tokenization() {
        let q = "  ICU  환자의   연도별 사망률  ";
        assert_eq!(tokenize(&normalize(q)), tokenize(&normalize(&normalize(q))));
    }

    #[test]
    fn particles_are_stripped() {
        assert_eq!(strip_korean_particle("환자의"), "환자");
        assert_eq!(strip_korean_particle("중환자실에서"), "중환자실");
        assert_eq!(strip_korean_particle("는"), "는");
    }

    #[test]
    fn english_tokens_removed_from_korean_text() {
        let text = "고혈압 hypertension 환자 수";
        let stripped = strip_english_tokens_for_korean(text);
        assert!(!stripped.contains("hypertension"));
        assert!(stripped.contains("고혈압"));
    }
}

//! Diagnosis/procedure term to ICD-prefix mapper.
//!
//! The term dictionaries are built offline (eval-SQL mining validated against
//! `D_ICD_DIAGNOSES.LONG_TITLE`) and shipped as JSON. At query time a matched
//! term produces one hint document telling the SQL agents the exact LIKE
//! prefixes and which ICD_VERSION the prefixes imply.

use std::sync::Arc;

use crate::models::{Doc, DocMeta};
use crate::services::metadata::{IcdMapEntry, MetadataCache};
use crate::utils::text::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcdDomain {
    Diagnosis,
    Procedure,
}

#[derive(Debug, Clone)]
pub struct IcdTermMatch {
    pub term: String,
    pub prefixes: Vec<String>,
    pub domain: IcdDomain,
    pub doc: Doc,
}

/// Alphabetic prefixes imply ICD-10, numeric prefixes ICD-9.
pub fn icd_version_for_prefix(prefix: &str) -> Option<u8> {
    let first = prefix.trim().chars().next()?;
    if first.is_ascii_alphabetic() {
        Some(10)
    } else if first.is_ascii_digit() {
        Some(9)
    } else {
        None
    }
}

fn hint_text(term: &str, prefixes: &[String], domain: IcdDomain) -> String {
    let like_list = prefixes
        .iter()
        .map(|p| format!("{}%", p))
        .collect::<Vec<_>>()
        .join(", ");
    let versions: Vec<u8> = {
        let mut v: Vec<u8> = prefixes.iter().filter_map(|p| icd_version_for_prefix(p)).collect();
        v.sort_unstable();
        v.dedup();
        v
    };
    let version_hint = match versions.as_slice() {
        [10] => " use ICD_VERSION 10 for alphabetic prefixes".to_string(),
        [9] => " use ICD_VERSION 9 for numeric prefixes".to_string(),
        _ => " use ICD_VERSION 10 for alphabetic, 9 for numeric".to_string(),
    };
    let table = match domain {
        IcdDomain::Diagnosis => "DIAGNOSES_ICD",
        IcdDomain::Procedure => "PROCEDURES_ICD",
    };
    format!("{} -> {}.ICD_CODE prefixes {};{}", term, table, like_list, version_hint)
}

pub struct IcdTermMapper {
    cache: Arc<MetadataCache>,
}

impl IcdTermMapper {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }

    pub fn match_question(&self, question: &str) -> Vec<IcdTermMatch> {
        let normalized = normalize(question);
        let mut matches: Vec<IcdTermMatch> = Vec::new();
        matches.extend(match_entries(&normalized, &self.cache.diagnosis_map(), IcdDomain::Diagnosis));
        matches.extend(match_entries(&normalized, &self.cache.procedure_map(), IcdDomain::Procedure));
        matches
    }
}

fn match_entries(
    normalized_question: &str,
    entries: &[IcdMapEntry],
    domain: IcdDomain,
) -> Vec<IcdTermMatch> {
    let mut matches: Vec<IcdTermMatch> = Vec::new();
    for entry in entries {
        let term = entry.term.trim();
        if term.is_empty() || entry.prefixes.is_empty() {
            continue;
        }
        if !normalized_question.contains(&term.to_lowercase()) {
            continue;
        }
        let text = hint_text(term, &entry.prefixes, domain);
        let meta = match domain {
            IcdDomain::Diagnosis => DocMeta::DiagnosisMap { term: term.to_string() },
            IcdDomain::Procedure => DocMeta::ProcedureMap { term: term.to_string() },
        };
        matches.push(IcdTermMatch {
            term: term.to_string(),
            prefixes: entry.prefixes.clone(),
            domain,
            doc: Doc::new(text, meta),
        });
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_inference_follows_prefix_alphabet() {
        assert_eq!(icd_version_for_prefix("I10"), Some(10));
        assert_eq!(icd_version_for_prefix("401"), Some(9));
        assert_eq!(icd_version_for_prefix(""), None);
    }

    #[test]
    fn matched_term_yields_prefix_hint_doc() {
        let entries = vec![IcdMapEntry {
            term: "고혈압".to_string(),
            prefixes: vec!["I10".to_string(), "I11".to_string()],
        }];
        let matches = match_entries("고혈압 환자 수", &entries, IcdDomain::Diagnosis);
        assert_eq!(matches.len(), 1);
        assert!(matches[0].doc.text.contains("I10%"));
        assert!(matches[0].doc.text.contains("ICD_VERSION 10"));
    }
}

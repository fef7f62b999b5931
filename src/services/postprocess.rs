//! Deterministic SQL post-processor.
//!
//! String-level rewrites that close the gap between what the LLM drafted and
//! what the clinical schema requires. Every applied rule records a tag; a
//! rule that cannot apply cleanly leaves the SQL untouched. Failures here
//! never abort the pipeline.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::services::metadata::MetadataCache;
use crate::services::retrieval::{IcdDomain, IcdTermMapper, IcdTermMatch, icd_version_for_prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Conservative,
    Relaxed,
    /// Minimal rule set used only inside repair loops.
    Aggressive,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Conservative => "conservative",
            Profile::Relaxed => "relaxed",
            Profile::Aggressive => "aggressive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostprocessOutcome {
    pub sql: String,
    pub rules: Vec<String>,
}

static RATIO_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(비율|비중|율|률|퍼센트|백분율|ratio|rate|proportion|percentage|pct)")
        .expect("valid regex")
});
static MORTALITY_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(사망|mortality|death|deceased|expire)").expect("valid regex"));
static ICU_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(중환자실|\bicu\b)").expect("valid regex"));
static AFTER_DAYS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s*(일|주|개월|월|년)\s*(이내|후)|after\s+(\d+)\s*(day|week|month|year)")
        .expect("valid regex")
});
static DEATH_ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(사망\s*후|사망\s*이후|after\s+death)").expect("valid regex"));
static DISCHARGE_ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(퇴원\s*후|퇴원\s*이후)").expect("valid regex"));
static DATE_PLUS_DAYS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*\.?(?:ADMITTIME|DISCHTIME|DEATHTIME|INTIME|OUTTIME|CHARTTIME|STARTTIME))\s*\+\s*(\d+)\b")
        .expect("valid regex")
});
static AVG_EXPIRE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bAVG\s*\(\s*([A-Za-z_][A-Za-z0-9_]*\.)?HOSPITAL_EXPIRE_FLAG\s*\)")
        .expect("valid regex")
});
static SUM_EXPIRE_OVER_COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bSUM\s*\(\s*([A-Za-z_][A-Za-z0-9_]*\.)?HOSPITAL_EXPIRE_FLAG\s*\)\s*(?:\*\s*[\d.]+\s*)?/\s*(?:NULLIF\s*\(\s*)?COUNT\s*\(\s*(?:\*|DISTINCT\s+[A-Za-z_][A-Za-z0-9_\.]*|[A-Za-z_][A-Za-z0-9_\.]*)\s*\)(?:\s*,\s*0\s*\))?",
    )
    .expect("valid regex")
});
static COUNT_CASE_EXPIRE_OVER_COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bCOUNT\s*\(\s*(?:DISTINCT\s+)?CASE\s+WHEN\s+([A-Za-z_][A-Za-z0-9_]*\.)?HOSPITAL_EXPIRE_FLAG\s*=\s*1\s+THEN\s+[A-Za-z0-9_\.]+\s+END\s*\)\s*(?:\*\s*[\d.]+\s*)?/\s*(?:NULLIF\s*\(\s*)?COUNT\s*\(\s*(?:\*|DISTINCT\s+[A-Za-z_][A-Za-z0-9_\.]*|[A-Za-z_][A-Za-z0-9_\.]*)\s*\)(?:\s*,\s*0\s*\))?",
    )
    .expect("valid regex")
});
static FROM_ADMISSIONS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:FROM|JOIN)\s+ADMISSIONS\b(\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?")
        .expect("valid regex")
});
static TABLE_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:FROM|JOIN)\s+(DIAGNOSES_ICD|PROCEDURES_ICD)\b(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?",
    )
    .expect("valid regex")
});

// The regex crate has no look-ahead, so trailing-keyword "aliases" are
// filtered here instead of in the pattern.
const NON_ALIAS_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "JOIN", "ON", "UNION", "INTERSECT", "MINUS", "LEFT",
    "RIGHT", "INNER", "OUTER", "CROSS", "CONNECT", "START", "MODEL", "FETCH", "AND", "OR",
];

fn real_alias(candidate: Option<&str>) -> Option<String> {
    let candidate = candidate?.trim();
    if candidate.is_empty() || NON_ALIAS_KEYWORDS.contains(&candidate.to_uppercase().as_str()) {
        return None;
    }
    Some(candidate.to_string())
}
static CLAUSE_BREAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bGROUP\s+BY\b|\bORDER\s+BY\b|\bHAVING\b").expect("valid regex"));
static WHERE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));
static ICD_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ICD_CODE\s+LIKE").expect("valid regex"));
static ICUSTAYS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bICUSTAYS\b").expect("valid regex"));
static INTERVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bINTERVAL\b|\bADD_MONTHS\b").expect("valid regex"));

pub struct PostProcessor {
    cache: Arc<MetadataCache>,
    icd_mapper: IcdTermMapper,
}

impl PostProcessor {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { icd_mapper: IcdTermMapper::new(Arc::clone(&cache)), cache }
    }

    /// Pick the rewrite profile for this question/SQL pair.
    pub fn recommend_profile(
        &self,
        question: &str,
        sql: &str,
        default: Profile,
    ) -> (Profile, Vec<String>) {
        let mut reasons: Vec<String> = Vec::new();
        let icd_terms = self.icd_mapper.match_question(question);
        let already_shaped = ICD_LIKE_RE.is_match(sql)
            && (!AFTER_DAYS_RE.is_match(question) || INTERVAL_RE.is_match(sql));
        if !icd_terms.is_empty() && already_shaped {
            reasons.push("icd_predicates_already_present".to_string());
            return (Profile::Conservative, reasons);
        }
        if MORTALITY_INTENT_RE.is_match(question) && RATIO_INTENT_RE.is_match(question) {
            reasons.push("mortality_ratio_intent".to_string());
            return (Profile::Relaxed, reasons);
        }
        if AFTER_DAYS_RE.is_match(question) || ICU_INTENT_RE.is_match(question) {
            reasons.push("time_or_icu_context".to_string());
            return (Profile::Relaxed, reasons);
        }
        reasons.push(format!("default_{}", default.as_str()));
        (default, reasons)
    }

    /// Apply the profile's rule set. Never fails; un-applicable rules no-op.
    pub fn postprocess(&self, question: &str, sql: &str, profile: Profile) -> PostprocessOutcome {
        let mut text = sql.trim().to_string();
        let mut rules: Vec<String> = Vec::new();
        if text.is_empty() {
            return PostprocessOutcome { sql: text, rules };
        }

        match profile {
            Profile::Conservative => {
                self.apply_diagnosis_rewrite(question, &mut text, &mut rules);
                apply_mortality_ratio(question, &mut text, &mut rules);
            }
            Profile::Relaxed => {
                self.apply_schema_hints(&mut text, &mut rules);
                self.apply_diagnosis_rewrite(question, &mut text, &mut rules);
                apply_mortality_ratio(question, &mut text, &mut rules);
                apply_time_window(question, &mut text, &mut rules);
                apply_icustays_alignment(question, &mut text, &mut rules);
            }
            Profile::Aggressive => {
                // Repair loops only: alias typo fixes plus ICD predicates,
                // nothing that changes aggregate shape.
                self.apply_schema_hints(&mut text, &mut rules);
                self.apply_diagnosis_rewrite(question, &mut text, &mut rules);
            }
        }

        PostprocessOutcome { sql: text, rules }
    }

    fn apply_schema_hints(&self, sql: &mut String, rules: &mut Vec<String>) {
        for hint in self.cache.schema_hints().iter() {
            let from = hint.from.trim();
            let to = hint.to.trim();
            if from.is_empty() || to.is_empty() {
                continue;
            }
            let Ok(re) = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from))) else {
                continue;
            };
            let rewritten = re.replace_all(sql, to).into_owned();
            if rewritten != *sql {
                *sql = rewritten;
                rules.push(format!("schema_hint_{}_to_{}", from.to_lowercase(), to.to_lowercase()));
            }
        }
    }

    fn apply_diagnosis_rewrite(&self, question: &str, sql: &mut String, rules: &mut Vec<String>) {
        let matches = self.icd_mapper.match_question(question);
        for m in matches {
            apply_icd_predicate(&m, sql, rules);
        }
    }
}

fn apply_icd_predicate(m: &IcdTermMatch, sql: &mut String, rules: &mut Vec<String>) {
    let target_table = match m.domain {
        IcdDomain::Diagnosis => "DIAGNOSES_ICD",
        IcdDomain::Procedure => "PROCEDURES_ICD",
    };
    let upper = sql.to_uppercase();
    if !upper.contains(target_table) {
        return;
    }
    if ICD_LIKE_RE.is_match(sql) {
        return;
    }

    // Resolve the alias the ICD table was given, defaulting to the bare name.
    let mut alias = target_table.to_string();
    for cap in TABLE_ALIAS_RE.captures_iter(sql) {
        if cap.get(1).map(|t| t.as_str().to_uppercase()) == Some(target_table.to_string()) {
            if let Some(found) = real_alias(cap.get(2).map(|m| m.as_str())) {
                alias = found;
            }
            break;
        }
    }

    let like_clauses: Vec<String> = m
        .prefixes
        .iter()
        .map(|p| format!("{}.ICD_CODE LIKE '{}%'", alias, p))
        .collect();
    if like_clauses.is_empty() {
        return;
    }
    let mut predicate = format!("({})", like_clauses.join(" OR "));

    let mut versions: Vec<u8> =
        m.prefixes.iter().filter_map(|p| icd_version_for_prefix(p)).collect();
    versions.sort_unstable();
    versions.dedup();
    if let [version] = versions.as_slice() {
        predicate = format!("{} AND {}.ICD_VERSION = {}", predicate, alias, version);
    }

    if append_where_predicate(sql, &predicate) {
        rules.push(format!(
            "{}_icd_prefix_{}",
            match m.domain {
                IcdDomain::Diagnosis => "diagnosis",
                IcdDomain::Procedure => "procedure",
            },
            m.term.to_lowercase()
        ));
    }
}

/// Append `predicate` to the statement's WHERE clause, creating one before
/// the first GROUP BY/ORDER BY/HAVING when absent. CTE-heavy statements are
/// left alone; string surgery there is not safe.
fn append_where_predicate(sql: &mut String, predicate: &str) -> bool {
    if sql.trim_start().to_uppercase().starts_with("WITH") {
        return false;
    }
    let (head, tail) = match CLAUSE_BREAK_RE.find(sql) {
        Some(m) => {
            let at = m.start();
            (sql[..at].trim_end().to_string(), sql[at..].to_string())
        }
        None => (sql.trim_end().to_string(), String::new()),
    };
    let new_head = if WHERE_RE.is_match(&head) {
        format!("{} AND {}", head, predicate)
    } else {
        format!("{} WHERE {}", head, predicate)
    };
    *sql = if tail.is_empty() { new_head } else { format!("{} {}", new_head, tail) };
    true
}

const MORTALITY_RATIO_SHAPE: &str =
    "COUNT(DISTINCT CASE WHEN {a}HOSPITAL_EXPIRE_FLAG = 1 THEN {a}HADM_ID END) / NULLIF(COUNT(DISTINCT {a}HADM_ID), 0)";

fn apply_mortality_ratio(question: &str, sql: &mut String, rules: &mut Vec<String>) {
    if !(MORTALITY_INTENT_RE.is_match(question) && RATIO_INTENT_RE.is_match(question)) {
        return;
    }
    let mut changed = false;
    for re in [&*AVG_EXPIRE_RE, &*SUM_EXPIRE_OVER_COUNT_RE, &*COUNT_CASE_EXPIRE_OVER_COUNT_RE] {
        let rewritten = re
            .replace_all(sql, |caps: &regex::Captures<'_>| {
                let alias = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                MORTALITY_RATIO_SHAPE.replace("{a}", alias)
            })
            .into_owned();
        if rewritten != *sql {
            *sql = rewritten;
            changed = true;
        }
    }
    if changed {
        rules.push("mortality_ratio_distinct_hadm_shape".to_string());
    }
}

fn apply_time_window(question: &str, sql: &mut String, rules: &mut Vec<String>) {
    if !AFTER_DAYS_RE.is_match(question) {
        return;
    }

    // "사망 후 N일": the anchor is the death event, not discharge, unless
    // the question says 퇴원 후 explicitly.
    if DEATH_ANCHOR_RE.is_match(question) && !DISCHARGE_ANCHOR_RE.is_match(question) {
        let re = Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*\.)?DISCHTIME\b").expect("valid regex");
        let rewritten = re
            .replace_all(sql, |caps: &regex::Captures<'_>| {
                format!("{}DEATHTIME", caps.get(1).map(|m| m.as_str()).unwrap_or(""))
            })
            .into_owned();
        if rewritten != *sql {
            *sql = rewritten;
            rules.push("time_window_death_anchor".to_string());
        }
    }

    // Bare day arithmetic reads ambiguously next to month/year windows; the
    // explicit interval form keeps Oracle semantics visible.
    let rewritten = DATE_PLUS_DAYS_RE
        .replace_all(sql, |caps: &regex::Captures<'_>| {
            format!("{} + INTERVAL '{}' DAY", &caps[1], &caps[2])
        })
        .into_owned();
    if rewritten != *sql {
        *sql = rewritten;
        rules.push("time_window_interval_arithmetic".to_string());
    }
}

fn apply_icustays_alignment(question: &str, sql: &mut String, rules: &mut Vec<String>) {
    if !ICU_INTENT_RE.is_match(question) || ICUSTAYS_RE.is_match(sql) {
        return;
    }
    let Some(caps) = FROM_ADMISSIONS_RE.captures(sql) else {
        return;
    };
    let alias = real_alias(caps.get(2).map(|m| m.as_str()));
    let insert_at = match &alias {
        Some(_) => caps.get(0).expect("match").end(),
        // No alias captured: insert right after the table name, before any
        // trailing keyword the optional group may have swallowed.
        None => match caps.get(1) {
            Some(tail) => tail.start(),
            None => caps.get(0).expect("match").end(),
        },
    };
    let alias = alias.unwrap_or_else(|| "ADMISSIONS".to_string());
    let join_clause = format!(" JOIN ICUSTAYS ICU ON ICU.HADM_ID = {}.HADM_ID", alias);
    sql.insert_str(insert_at, &join_clause);
    rules.push("icustays_join_alignment".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata::IcdMapEntry;

    fn cache_with_diagnosis(dir: &std::path::Path) -> Arc<MetadataCache> {
        let entries = vec![IcdMapEntry {
            term: "고혈압".to_string(),
            prefixes: vec!["I10".to_string(), "I11".to_string()],
        }];
        std::fs::write(
            dir.join("diagnosis_map_terms.json"),
            serde_json::to_string(&entries).unwrap(),
        )
        .unwrap();
        Arc::new(MetadataCache::new(dir))
    }

    #[test]
    fn diagnosis_rewrite_adds_like_prefixes_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let processor = PostProcessor::new(cache_with_diagnosis(dir.path()));
        let outcome = processor.postprocess(
            "고혈압 환자 수",
            "SELECT COUNT(DISTINCT D.HADM_ID) FROM DIAGNOSES_ICD D",
            Profile::Conservative,
        );
        assert!(outcome.sql.contains("D.ICD_CODE LIKE 'I10%'"), "{}", outcome.sql);
        assert!(outcome.sql.contains("OR D.ICD_CODE LIKE 'I11%'"));
        assert!(outcome.sql.contains("D.ICD_VERSION = 10"));
        assert!(outcome.rules.iter().any(|r| r.starts_with("diagnosis_icd_prefix_")));
    }

    #[test]
    fn mortality_ratio_rewritten_to_distinct_hadm_shape() {
        let dir = tempfile::tempdir().unwrap();
        let processor = PostProcessor::new(Arc::new(MetadataCache::new(dir.path())));
        let outcome = processor.postprocess(
            "연도별 사망률",
            "SELECT EXTRACT(YEAR FROM A.ADMITTIME), AVG(A.HOSPITAL_EXPIRE_FLAG) FROM ADMISSIONS A GROUP BY EXTRACT(YEAR FROM A.ADMITTIME)",
            Profile::Conservative,
        );
        assert!(outcome.sql.contains("NULLIF(COUNT(DISTINCT A.HADM_ID), 0)"), "{}", outcome.sql);
        assert!(outcome.rules.contains(&"mortality_ratio_distinct_hadm_shape".to_string()));
    }

    #[test]
    fn icu_questions_gain_icustays_join() {
        let dir = tempfile::tempdir().unwrap();
        let processor = PostProcessor::new(Arc::new(MetadataCache::new(dir.path())));
        let outcome = processor.postprocess(
            "ICU 환자의 평균 재원일",
            "SELECT AVG(A.LOS) FROM ADMISSIONS A WHERE A.HADM_ID IS NOT NULL",
            Profile::Relaxed,
        );
        assert!(outcome.sql.contains("JOIN ICUSTAYS ICU ON ICU.HADM_ID = A.HADM_ID"), "{}", outcome.sql);
        assert!(outcome.rules.contains(&"icustays_join_alignment".to_string()));
    }

    #[test]
    fn death_window_uses_deathtime_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let processor = PostProcessor::new(Arc::new(MetadataCache::new(dir.path())));
        let outcome = processor.postprocess(
            "사망 후 30일 이내 재입원",
            "SELECT COUNT(*) FROM ADMISSIONS A WHERE A.ADMITTIME <= A.DISCHTIME + 30",
            Profile::Relaxed,
        );
        assert!(outcome.sql.contains("DEATHTIME"), "{}", outcome.sql);
        assert!(outcome.sql.contains("INTERVAL '30' DAY"));
    }
}

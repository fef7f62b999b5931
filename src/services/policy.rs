//! Policy gate: read-only enforcement, statement shape, join cap, WHERE
//! requirement, and table-scope whitelisting.
//!
//! Evaluation stops at the first failing check, mirroring how violations are
//! surfaced to the caller as a single 400/403. Table-scope failures are
//! marked `deferred` so the repair loop can still attempt deterministic table
//! fixes before the request dies.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::models::{PolicyCheck, PolicyReport};
use crate::utils::sql_text::{
    cte_names, extract_table_refs, strip_literals_and_comments, table_ref_candidates,
};
use crate::utils::{ApiError, ApiResult};

static WRITE_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(delete|update|insert|merge|drop|alter|truncate)\b").expect("valid regex")
});
static STATEMENT_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(select|with)\b").expect("valid regex"));
static WITH_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*with\b").expect("valid regex"));
static SELECT_ANYWHERE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bselect\b").expect("valid regex"));
static JOIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bjoin\b").expect("valid regex"));
static WHERE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bwhere\b").expect("valid regex"));
static AGG_FN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(count|avg|sum|min|max)\s*\(").expect("valid regex"));
static GROUP_BY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bgroup\s+by\b").expect("valid regex"));
static ROWNUM_LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bROWNUM\s*<=\s*\d+").expect("valid regex"));
static FETCH_FIRST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFETCH\s+FIRST\s+\d+\s+ROWS\s+ONLY\b").expect("valid regex"));
static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+\d+\b").expect("valid regex"));
static DISTINCT_SELECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*SELECT\s+DISTINCT\b").expect("valid regex"));
static FLAG_PROJECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[A-Za-z0-9_]*_FLAG\b").expect("valid regex"));

const WHERE_OPTIONAL_QUESTION_HINTS: &[&str] = &[
    "count", "how many", "number of", "distribution", "trend", "compare", "comparison",
    "average", "mean", "median", "ratio", "rate", "share", "proportion", "breakdown", "top",
    "most", "least", "summary", "aggregate", "분포", "추이", "비교", "평균", "중앙", "비율",
    "비중", "구성비", "점유율", "건수", "통계", "요약", "상위", "하위", "몇 명", "몇건", "여부",
    "상태", "플래그", "트렌드",
];

const WHERE_OPTIONAL_SAMPLE_HINTS: &[&str] = &[
    "sample", "preview", "distinct", "list distinct", "value list", "미리보기", "샘플", "예시",
    "고유값", "distinct 값",
];

const STATUS_INTENT_HINTS: &[&str] = &["여부", "상태", "플래그", "status", "flag"];

pub struct PolicyGate {
    max_joins: usize,
}

impl PolicyGate {
    pub fn new(max_joins: usize) -> Self {
        Self { max_joins }
    }

    /// Run every check in order and stop at the first failure.
    pub fn evaluate(
        &self,
        sql: &str,
        question: Option<&str>,
        scope_tables: &[String],
    ) -> PolicyReport {
        let mut checks: Vec<PolicyCheck> = Vec::new();
        let text = sql.trim();
        if text.is_empty() {
            checks.push(check("Read-only", false, "Empty SQL"));
            return PolicyReport { passed: false, checks, deferred: false };
        }

        let scan_text = strip_literals_and_comments(text);
        if WRITE_KEYWORDS.is_match(&scan_text) {
            checks.push(check("Read-only", false, "Write keyword detected"));
            return PolicyReport { passed: false, checks, deferred: false };
        }
        checks.push(check("Read-only", true, "No write keyword detected"));

        let statement_ok = STATEMENT_START.is_match(text);
        checks.push(check("Statement type", statement_ok, "SELECT/CTE only"));
        if !statement_ok {
            return PolicyReport { passed: false, checks, deferred: false };
        }
        if WITH_START.is_match(text) {
            let cte_has_select = SELECT_ANYWHERE.is_match(text);
            checks.push(check("CTE", cte_has_select, "WITH clause includes SELECT"));
            if !cte_has_select {
                return PolicyReport { passed: false, checks, deferred: false };
            }
        }

        let join_count = JOIN_RE.find_iter(text).count();
        let join_ok = join_count <= self.max_joins;
        checks.push(check(
            "Join limit",
            join_ok,
            format!("{}/{} joins", join_count, self.max_joins),
        ));
        if !join_ok {
            return PolicyReport { passed: false, checks, deferred: false };
        }

        let has_where = WHERE_RE.is_match(text);
        let (where_optional, where_reason) = can_skip_where(question, text);
        let where_ok = has_where || where_optional;
        let where_message = if has_where {
            "WHERE clause present".to_string()
        } else if where_optional {
            where_reason
        } else {
            "WHERE clause required".to_string()
        };
        checks.push(check("WHERE rule", where_ok, where_message));
        if !where_ok {
            return PolicyReport { passed: false, checks, deferred: false };
        }

        // Scope: per-user when present, global fallback otherwise; an empty
        // effective scope means no restriction.
        if !scope_tables.is_empty() {
            let mut allowed: HashSet<String> = scope_tables
                .iter()
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect();
            // Oracle pseudo-table used in scalar SELECT patterns.
            allowed.insert("dual".to_string());
            let ctes = cte_names(text);
            let (found, disallowed) = resolve_table_refs(text, &allowed, &ctes);
            if disallowed.is_empty() {
                checks.push(check(
                    "Table scope",
                    true,
                    format!("{} table references allowed", found.len()),
                ));
            } else {
                let mut names: Vec<String> = disallowed
                    .iter()
                    .map(|name| name.to_string())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                names.sort();
                checks.push(check(
                    "Table scope",
                    false,
                    format!("Disallowed: {}", names.join(", ")),
                ));
                return PolicyReport { passed: false, checks, deferred: true };
            }
        } else {
            checks.push(check("Table scope", true, "No table scope restriction"));
        }

        PolicyReport { passed: true, checks, deferred: false }
    }

    /// Evaluate and convert a failing report into the matching 400/403.
    pub fn enforce(
        &self,
        sql: &str,
        question: Option<&str>,
        scope_tables: &[String],
    ) -> ApiResult<PolicyReport> {
        let report = self.evaluate(sql, question, scope_tables);
        if report.passed {
            return Ok(report);
        }
        Err(violation_error(&report, sql))
    }
}

/// Map the first failing check to its ApiError.
pub fn violation_error(report: &PolicyReport, sql: &str) -> ApiError {
    let Some(failed) = report.checks.iter().find(|c| !c.passed) else {
        return ApiError::internal_error("Policy report marked failed without a failing check");
    };
    match failed.name.as_str() {
        "Read-only" if failed.message == "Empty SQL" => ApiError::EmptySql,
        "Read-only" => ApiError::WriteNotAllowed,
        "Statement type" | "CTE" => ApiError::StatementNotAllowed,
        "Join limit" => {
            let joins = JOIN_RE.find_iter(sql).count();
            let max_joins = failed
                .message
                .split('/')
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            ApiError::JoinLimitExceeded { joins, max_joins }
        }
        "WHERE rule" => ApiError::WhereRequired,
        "Table scope" => ApiError::TableNotAllowed(
            failed.message.trim_start_matches("Disallowed: ").to_string(),
        ),
        _ => ApiError::validation_error(failed.message.clone()),
    }
}

fn check(name: &str, passed: bool, message: impl Into<String>) -> PolicyCheck {
    PolicyCheck { name: name.to_string(), passed, message: message.into() }
}

fn has_safe_full_scope_shape(sql: &str) -> bool {
    // Full-scope reads are allowed when the query shape is inherently bounded
    // (aggregation/grouping) or explicitly row-limited.
    if AGG_FN_RE.is_match(sql) || GROUP_BY_RE.is_match(sql) {
        return true;
    }
    ROWNUM_LIMIT_RE.is_match(sql) || FETCH_FIRST_RE.is_match(sql) || LIMIT_RE.is_match(sql)
}

fn can_skip_where(question: Option<&str>, sql: &str) -> (bool, String) {
    // Aggregate question + aggregate shape wins over the generic bounded
    // shape so the exemption message names the question intent.
    let has_aggregate_shape = AGG_FN_RE.is_match(sql) || GROUP_BY_RE.is_match(sql);
    if let Some(question) = question {
        let q = question.to_lowercase();
        if has_aggregate_shape
            && WHERE_OPTIONAL_QUESTION_HINTS.iter().any(|hint| q.contains(hint))
        {
            return (true, "Aggregate question: WHERE optional".to_string());
        }
    }
    if has_safe_full_scope_shape(sql) {
        return (true, "Safe full-scope read: WHERE optional".to_string());
    }
    let Some(question) = question else {
        return (false, String::new());
    };
    let q = question.to_lowercase();
    if DISTINCT_SELECT_RE.is_match(sql)
        && WHERE_OPTIONAL_SAMPLE_HINTS.iter().any(|hint| q.contains(hint))
    {
        return (true, "Distinct sample/list question: WHERE optional".to_string());
    }
    if !WHERE_OPTIONAL_QUESTION_HINTS.iter().any(|hint| q.contains(hint)) {
        return (false, String::new());
    }

    // Status/flag listing requests are often valid full-scope reads.
    let has_flag_projection = FLAG_PROJECTION_RE.is_match(sql);
    let mentions_status_intent = STATUS_INTENT_HINTS.iter().any(|token| q.contains(token));
    if has_flag_projection && mentions_status_intent {
        return (true, "Status/flag question: WHERE optional".to_string());
    }
    (false, String::new())
}

fn resolve_table_refs(
    sql: &str,
    allowed_tables: &HashSet<String>,
    cte_names: &HashSet<String>,
) -> (Vec<String>, Vec<String>) {
    let mut resolved: Vec<String> = Vec::new();
    let mut disallowed: Vec<String> = Vec::new();
    for raw in extract_table_refs(sql) {
        let candidates = table_ref_candidates(&raw);
        if candidates.is_empty() {
            continue;
        }
        if candidates.iter().any(|c| cte_names.contains(&c.to_lowercase())) {
            continue;
        }
        if let Some(matched) =
            candidates.iter().find(|c| allowed_tables.contains(&c.to_lowercase()))
        {
            resolved.push(matched.clone());
            continue;
        }
        // Fall back to the least-surprising token for diagnostics.
        let fallback = candidates.last().expect("non-empty candidates").clone();
        resolved.push(fallback.clone());
        disallowed.push(fallback);
    }
    (resolved, disallowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> PolicyGate {
        PolicyGate::new(6)
    }

    #[test]
    fn write_keyword_is_blocked_outside_literals() {
        let report = gate().evaluate("DELETE FROM ADMISSIONS", None, &[]);
        assert!(!report.passed);

        let report = gate().evaluate(
            "SELECT COUNT(*) FROM ADMISSIONS WHERE DIAGNOSIS LIKE '%INSERT%'",
            None,
            &[],
        );
        assert!(report.passed, "literal content must not trip the write scan");
    }

    #[test]
    fn aggregate_question_skips_where() {
        let report = gate().evaluate(
            "SELECT COUNT(*) FROM ADMISSIONS",
            Some("how many admissions are there"),
            &[],
        );
        assert!(report.passed);
        let where_check = report.checks.iter().find(|c| c.name == "WHERE rule").unwrap();
        assert_eq!(where_check.message, "Aggregate question: WHERE optional");
    }

    #[test]
    fn bare_select_without_where_is_rejected() {
        let report = gate().evaluate("SELECT SUBJECT_ID FROM PATIENTS", Some("환자 목록"), &[]);
        assert!(!report.passed);
    }

    #[test]
    fn scope_allows_ctes_and_dual() {
        let scope = vec!["ADMISSIONS".to_string()];
        let sql = "WITH C AS (SELECT HADM_ID FROM ADMISSIONS WHERE ROWNUM <= 10) SELECT COUNT(*) FROM C, DUAL";
        let report = gate().evaluate(sql, None, &scope);
        assert!(report.passed, "{:?}", report.checks);
    }

    #[test]
    fn scope_violation_is_deferred() {
        let scope = vec!["ADMISSIONS".to_string()];
        let report = gate().evaluate(
            "SELECT COUNT(*) FROM ICUSTAYS",
            Some("how many icu stays"),
            &scope,
        );
        assert!(!report.passed);
        assert!(report.deferred);
    }

    #[test]
    fn join_limit_enforced() {
        let gate = PolicyGate::new(1);
        let sql = "SELECT COUNT(*) FROM A JOIN B ON A.X = B.X JOIN C ON B.Y = C.Y";
        let report = gate.evaluate(sql, None, &[]);
        assert!(!report.passed);
        let failed = report.checks.iter().find(|c| !c.passed).unwrap();
        assert_eq!(failed.name, "Join limit");
    }
}

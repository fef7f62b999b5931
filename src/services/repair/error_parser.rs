//! Oracle/driver error parsing: error codes, invalid identifiers, and
//! per-code repair hints handed to the LLM repair pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::utils::sql_text::{extract_top_level_clause, split_top_level_csv};

static ERR_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(ORA-\d{5}|DPY-\d{4}|DPI-\d{4})\b").expect("valid regex"));
static ORA_00904_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)ORA-00904:\s*(?:"(?P<owner>[A-Za-z0-9_$#]+)"\."(?P<identifier>[A-Za-z0-9_$#]+)"|"(?P<identifier_only>[A-Za-z0-9_$#]+)")"#,
    )
    .expect("valid regex")
});
static ORA_00979_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ORA-00979").expect("valid regex"));
static ORA_00933_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ORA-00933").expect("valid regex"));

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedSqlError {
    pub error_code: String,
    pub error_message: String,
    pub hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_or_alias: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub select_items: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub group_by_items: Vec<String>,
}

pub fn parse_sql_error(error_message: &str, sql: &str) -> ParsedSqlError {
    let raw = error_message.trim().to_string();
    let mut result = ParsedSqlError { error_message: raw.clone(), ..Default::default() };

    if let Some(code) = ERR_CODE_RE.find(&raw) {
        result.error_code = code.as_str().to_uppercase();
    }

    if let Some(caps) = ORA_00904_RE.captures(&raw) {
        let identifier = caps
            .name("identifier")
            .or_else(|| caps.name("identifier_only"))
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_default();
        let owner = caps.name("owner").map(|m| m.as_str().to_uppercase());
        result.hint = format!(
            "Invalid identifier '{}'. Use only existing table/column names from schema context.",
            identifier
        );
        result.invalid_identifier = Some(identifier);
        result.owner_or_alias = owner;
        return result;
    }

    if ORA_00979_RE.is_match(&raw) {
        if result.error_code.is_empty() {
            result.error_code = "ORA-00979".to_string();
        }
        result.select_items =
            split_top_level_csv(&extract_top_level_clause(sql, "SELECT", &["FROM"]));
        result.group_by_items =
            split_top_level_csv(&extract_top_level_clause(sql, "GROUP BY", &["HAVING", "ORDER BY"]));
        result.hint = "Every non-aggregated SELECT expression must appear in GROUP BY, or be \
                       wrapped with an aggregate function."
            .to_string();
        return result;
    }

    if ORA_00933_RE.is_match(&raw) {
        if result.error_code.is_empty() {
            result.error_code = "ORA-00933".to_string();
        }
        result.hint = "SQL command not properly ended. Check Oracle syntax, including \
                       SELECT-only constraints and trailing clauses."
            .to_string();
        return result;
    }

    match result.error_code.as_str() {
        "ORA-00942" => {
            result.hint = "Table or view does not exist or is not accessible with current \
                           schema/permissions."
                .to_string();
        }
        "DPY-4024" | "DPI-1067" | "ORA-03156" => {
            result.hint = "Connection timeout or closed connection. Reduce scan scope or retry \
                           with lighter query."
                .to_string();
        }
        "ORA-01031" => {
            result.hint =
                "Insufficient privileges. Use only tables/columns granted to current user."
                    .to_string();
        }
        "ORA-01722" => {
            result.hint = "Invalid number conversion. Avoid implicit/forced numeric casts on \
                           text columns."
                .to_string();
        }
        _ => {}
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ora_00904_extracts_alias_and_identifier() {
        let parsed = parse_sql_error(r#"ORA-00904: "P"."MEDICATION": invalid identifier"#, "");
        assert_eq!(parsed.invalid_identifier.as_deref(), Some("MEDICATION"));
        assert_eq!(parsed.owner_or_alias.as_deref(), Some("P"));
        assert!(parsed.hint.contains("MEDICATION"));
    }

    #[test]
    fn ora_00979_splits_select_and_group_by() {
        let sql = "SELECT GENDER, COUNT(*) FROM PATIENTS GROUP BY ANCHOR_YEAR_GROUP";
        let parsed = parse_sql_error("ORA-00979: not a GROUP BY expression", sql);
        assert_eq!(parsed.select_items, vec!["GENDER".to_string(), "COUNT(*)".to_string()]);
        assert_eq!(parsed.group_by_items, vec!["ANCHOR_YEAR_GROUP".to_string()]);
    }

    #[test]
    fn timeout_codes_carry_a_hint() {
        let parsed = parse_sql_error("DPY-4024: call timeout of 180000 ms exceeded", "");
        assert_eq!(parsed.error_code, "DPY-4024");
        assert!(parsed.hint.contains("timeout"));
    }
}

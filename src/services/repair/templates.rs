//! Deterministic per-code SQL repair templates.
//!
//! These run after the learned-fix lookup and before the LLM repair pass.
//! Each template is a narrow rewrite for a known failure shape; anything it
//! cannot fix cleanly is left for the LLM.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::sql_text::strip_top_level_order_by;

const TIMEOUT_MARKERS: &[&str] = &["DPY-4024", "DPI-1067", "ORA-03156", "TIMEOUT"];
const INVALID_IDENTIFIER_MARKERS: &[&str] = &["ORA-00904", "INVALID IDENTIFIER"];
const INVALID_NUMBER_MARKERS: &[&str] = &["ORA-01722", "INVALID NUMBER"];
const TABLE_NOT_EXIST_MARKERS: &[&str] = &["ORA-00942", "TABLE OR VIEW DOES NOT EXIST"];
const MISSING_KEYWORD_MARKERS: &[&str] = &["ORA-00905", "MISSING KEYWORD"];

/// Event tables large enough that a timeout usually means an unbounded scan.
const HEAVY_TIMEOUT_TABLES: &[&str] = &[
    "CHARTEVENTS",
    "LABEVENTS",
    "PROCEDUREEVENTS",
    "MICROBIOLOGYEVENTS",
    "INPUTEVENTS",
    "OUTPUTEVENTS",
    "EMAR",
    "EMAR_DETAIL",
    "PRESCRIPTIONS",
];

static ERR_IDENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)ORA-00904:\s*(?:"(?P<alias>[A-Za-z0-9_]+)"\."(?P<column>[A-Za-z0-9_]+)"|"(?P<column_only>[A-Za-z0-9_]+)")"#,
    )
    .expect("valid regex")
});
static TABLE_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:FROM|JOIN)\s+(?P<table>[A-Za-z_][A-Za-z0-9_$#]*)(?:\s+(?:AS\s+)?(?P<alias>[A-Za-z_][A-Za-z0-9_$#]*))?",
    )
    .expect("valid regex")
});
static TOPN_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\btop\s+\d+\b|상위\s*\d+|탑\s*\d+").expect("valid regex"));
static ROWNUM_CAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bROWNUM\s*<=\s*\d+").expect("valid regex"));
static CLAUSE_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bGROUP\s+BY\b|\bORDER\s+BY\b|\bHAVING\b").expect("valid regex"));
static WHERE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));

const SQL_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "JOIN", "ON", "UNION", "INTERSECT", "MINUS", "CONNECT",
    "START", "MODEL", "LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "AND", "OR", "FETCH",
];

fn contains_any(text: &str, markers: &[&str]) -> bool {
    let upper = text.to_uppercase();
    markers.iter().any(|marker| upper.contains(marker))
}

fn is_keyword(token: &str) -> bool {
    SQL_KEYWORDS.contains(&token.to_uppercase().as_str())
}

/// Aliases declared for `table_name` in FROM/JOIN clauses, plus the bare
/// table name itself.
fn find_aliases(sql: &str, table_name: &str) -> Vec<String> {
    let target = table_name.to_uppercase();
    let mut aliases: Vec<String> = Vec::new();
    for caps in TABLE_ALIAS_RE.captures_iter(sql) {
        let table = caps.name("table").map(|m| m.as_str().to_uppercase()).unwrap_or_default();
        if table != target {
            continue;
        }
        if let Some(alias) = caps.name("alias") {
            let alias = alias.as_str();
            if !is_keyword(alias) && !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
                aliases.push(alias.to_string());
            }
        }
    }
    aliases.push(target);
    aliases
}

fn declared_aliases(sql: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in TABLE_ALIAS_RE.captures_iter(sql) {
        for group in ["table", "alias"] {
            if let Some(m) = caps.name(group) {
                let token = m.as_str().to_uppercase();
                if !is_keyword(&token) && !names.contains(&token) {
                    names.push(token);
                }
            }
        }
    }
    names
}

fn replace_qualified(sql: &str, aliases: &[String], source_col: &str, target_col: &str) -> String {
    let mut text = sql.to_string();
    for alias in aliases {
        let pattern = format!(r"(?i)\b{}\.{}\b", regex::escape(alias), regex::escape(source_col));
        if let Ok(re) = Regex::new(&pattern) {
            text = re.replace_all(&text, format!("{}.{}", alias, target_col)).into_owned();
        }
    }
    text
}

/// Replace bare `word` tokens that are not qualified by an alias dot.
fn replace_unqualified(sql: &str, word: &str, replacement: &str) -> String {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(word));
    let Ok(re) = Regex::new(&pattern) else {
        return sql.to_string();
    };
    let mut out = String::with_capacity(sql.len());
    let mut last = 0usize;
    for m in re.find_iter(sql) {
        let preceded_by_dot = sql[..m.start()].ends_with('.');
        out.push_str(&sql[last..m.start()]);
        out.push_str(if preceded_by_dot { m.as_str() } else { replacement });
        last = m.end();
    }
    out.push_str(&sql[last..]);
    out
}

fn replace_word(sql: &str, word: &str, replacement: &str) -> String {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(word));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(sql, replacement).into_owned(),
        Err(_) => sql.to_string(),
    }
}

fn repair_invalid_identifier(sql: &str, error_message: &str) -> (String, Vec<String>) {
    let mut rules: Vec<String> = Vec::new();
    let mut text = sql.to_string();
    let upper = text.to_uppercase();
    let err_upper = error_message.to_uppercase();

    // 1) PRESCRIPTIONS.MEDICATION -> PRESCRIPTIONS.DRUG
    if err_upper.contains("MEDICATION") && upper.contains("PRESCRIPTIONS") {
        let aliases = find_aliases(&text, "PRESCRIPTIONS");
        let mut rewritten = replace_qualified(&text, &aliases, "MEDICATION", "DRUG");
        rewritten = replace_unqualified(&rewritten, "MEDICATION", "DRUG");
        if rewritten != text {
            text = rewritten;
            rules.push("template_00904_prescriptions_medication_to_drug".to_string());
        }
    }

    // 2) ORDERCATEGORYNAME -> ORDERCATEGORYDESCRIPTION
    if err_upper.contains("ORDERCATEGORYNAME") {
        let rewritten = replace_word(&text, "ORDERCATEGORYNAME", "ORDERCATEGORYDESCRIPTION");
        if rewritten != text {
            text = rewritten;
            rules.push("template_00904_ordercategoryname_to_description".to_string());
        }
    }

    // 3) TRANSFERS FIRST/LAST_CAREUNIT -> CAREUNIT
    if (err_upper.contains("FIRST_CAREUNIT") || err_upper.contains("LAST_CAREUNIT"))
        && upper.contains("TRANSFERS")
    {
        let aliases = find_aliases(&text, "TRANSFERS");
        let mut rewritten = replace_qualified(&text, &aliases, "FIRST_CAREUNIT", "CAREUNIT");
        rewritten = replace_qualified(&rewritten, &aliases, "LAST_CAREUNIT", "CAREUNIT");
        rewritten = replace_unqualified(&rewritten, "FIRST_CAREUNIT", "CAREUNIT");
        rewritten = replace_unqualified(&rewritten, "LAST_CAREUNIT", "CAREUNIT");
        if rewritten != text {
            text = rewritten;
            rules.push("template_00904_transfers_careunit_fix".to_string());
        }
    }

    // 4) D_ITEMS/D_LABITEMS LONG_TITLE -> LABEL
    if err_upper.contains("LONG_TITLE") && (upper.contains("D_ITEMS") || upper.contains("D_LABITEMS"))
    {
        let rewritten = replace_word(&text, "LONG_TITLE", "LABEL");
        if rewritten != text {
            text = rewritten;
            rules.push("template_00904_long_title_to_label".to_string());
        }
    }

    // 5) ICD_CODE used against item dimensions -> ITEMID
    if err_upper.contains("ICD_CODE") && (upper.contains("D_ITEMS") || upper.contains("D_LABITEMS"))
    {
        let re = Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_$#]*)\.ICD_CODE\b").expect("valid regex");
        let rewritten = re.replace_all(&text, "$1.ITEMID").into_owned();
        if rewritten != text {
            text = rewritten;
            rules.push("template_00904_itemid_icd_code_mismatch_fix".to_string());
        }
    }

    // 6) projection alias fallback: INSERTIONS -> CNT
    if err_upper.contains("INSERTIONS") {
        let has_cnt_alias = Regex::new(r"(?i)\bAS\s+CNT\b")
            .expect("valid regex")
            .is_match(&text);
        if has_cnt_alias {
            let rewritten = replace_word(&text, "INSERTIONS", "CNT");
            if rewritten != text {
                text = rewritten;
                rules.push("template_00904_projection_alias_to_cnt".to_string());
            }
        }
    }

    // 7-10) identifier-specific fallbacks from the error payload.
    if let Some(caps) = ERR_IDENT_RE.captures(error_message) {
        let err_alias = caps
            .name("alias")
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_default();
        let err_col = caps
            .name("column")
            .or_else(|| caps.name("column_only"))
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_default();

        if err_col == "MEDICATION"
            && upper.contains("PRESCRIPTIONS")
            && !rules.iter().any(|r| r == "template_00904_prescriptions_medication_to_drug")
        {
            let rewritten = replace_word(&text, "MEDICATION", "DRUG");
            if rewritten != text {
                text = rewritten;
                rules.push("template_00904_generic_medication_to_drug".to_string());
            }
        }

        // Outer aggregate references a missing alias while the inner
        // projection is aliased CNT.
        if matches!(err_col.as_str(), "PROCEDURE_COUNT" | "DIAGNOSIS_COUNT" | "AVERAGE_VALUE") {
            let has_cnt_alias = Regex::new(r"(?i)\bAS\s+CNT\b")
                .expect("valid regex")
                .is_match(&text);
            if has_cnt_alias {
                let rewritten = replace_word(&text, &err_col, "CNT");
                if rewritten != text {
                    text = rewritten;
                    rules.push("template_00904_outer_alias_to_cnt".to_string());
                }
            }
        }

        // Reverse case: outer uses CNT but the inner alias is a named count.
        if err_col == "CNT" {
            let alias_candidates = [
                "PROCEDURE_COUNT",
                "DIAGNOSIS_COUNT",
                "ADMISSION_COUNT",
                "EVENT_COUNT",
                "RX_ORDER_CNT",
            ];
            let chosen = alias_candidates.iter().find(|name| {
                Regex::new(&format!(r"(?i)\bAS\s+{}\b", name))
                    .map(|re| re.is_match(&text))
                    .unwrap_or(false)
            });
            if let Some(alias_name) = chosen {
                let rewritten = replace_word(&text, "CNT", alias_name);
                if rewritten != text {
                    text = rewritten;
                    rules.push("template_00904_cnt_to_named_alias".to_string());
                }
            }
        }

        // Alias scope mismatch: an outer scope references an inner alias.
        // Drop the qualifier only when the alias was never declared.
        if !err_alias.is_empty() && !err_col.is_empty() {
            let declared = declared_aliases(&text);
            if !declared.contains(&err_alias) {
                let pattern = format!(
                    r"(?i)\b{}\.{}\b",
                    regex::escape(&err_alias),
                    regex::escape(&err_col)
                );
                if let Ok(re) = Regex::new(&pattern) {
                    let rewritten = re.replace_all(&text, err_col.as_str()).into_owned();
                    if rewritten != text {
                        text = rewritten;
                        rules.push("template_00904_drop_alias_prefix".to_string());
                    }
                }
            }
        }
    }

    (text, rules)
}

fn repair_invalid_number(sql: &str, error_message: &str) -> (String, Vec<String>) {
    let mut rules: Vec<String> = Vec::new();
    let mut text = sql.to_string();
    let upper = text.to_uppercase();
    let has_event_table = upper.contains("PROCEDUREEVENTS") || upper.contains("CHARTEVENTS");
    let icd_code_re =
        Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_$#]*)\.ICD_CODE\b").expect("valid regex");

    // Event tables join D_ITEMS on ITEMID; joining ICD dimensions there
    // forces a numeric cast on ICD_CODE and fails.
    if upper.contains("D_ICD_DIAGNOSES") && has_event_table {
        let mut rewritten = replace_word(&text, "D_ICD_DIAGNOSES", "D_ITEMS");
        rewritten = icd_code_re.replace_all(&rewritten, "$1.ITEMID").into_owned();
        if rewritten != text {
            text = rewritten;
            rules.push("template_01722_event_to_items_join_fix".to_string());
        }
    }

    if upper.contains("D_ICD_PROCEDURES") && has_event_table {
        let mut rewritten = replace_word(&text, "D_ICD_PROCEDURES", "D_ITEMS");
        rewritten = icd_code_re.replace_all(&rewritten, "$1.ITEMID").into_owned();
        if rewritten != text {
            text = rewritten;
            rules.push("template_01722_event_to_items_proc_fix".to_string());
        }
    }

    if error_message.to_uppercase().contains("INVALID NUMBER") {
        let re = Regex::new(
            r"(?i)TO_NUMBER\s*\(\s*([A-Za-z_][A-Za-z0-9_$#]*\.[A-Za-z_][A-Za-z0-9_$#]*)\s*\)",
        )
        .expect("valid regex");
        let rewritten = re.replace_all(&text, "$1").into_owned();
        if rewritten != text {
            text = rewritten;
            rules.push("template_01722_strip_unnecessary_to_number".to_string());
        }
    }

    (text, rules)
}

fn repair_table_not_exists(sql: &str) -> (String, Vec<String>) {
    let mut rules: Vec<String> = Vec::new();
    let mut text = sql.to_string();

    let replacements: &[(&str, &str, &str)] = &[
        (r"\bPROCEDUREEVENTS_ICD\b", "PROCEDURES_ICD", "template_00942_procedureevents_icd_to_procedures_icd"),
        (r"\bDIAGNOSIS_ICD\b", "DIAGNOSES_ICD", "template_00942_diagnosis_icd_to_diagnoses_icd"),
        (r"\bPROCEDUREEVENT\b", "PROCEDUREEVENTS", "template_00942_procedureevent_to_procedureevents"),
        (r"\bDLABITEMS\b", "D_LABITEMS", "template_00942_dlabitems_to_d_labitems"),
        (r"\bDITEMS\b", "D_ITEMS", "template_00942_ditems_to_d_items"),
    ];
    for (pattern, replacement, rule_name) in replacements {
        let re = Regex::new(&format!("(?i){}", pattern)).expect("valid regex");
        let rewritten = re.replace_all(&text, *replacement).into_owned();
        if rewritten != text {
            text = rewritten;
            rules.push((*rule_name).to_string());
        }
    }

    // Singular table-name hallucinations in FROM/JOIN clauses.
    let from_join_rewrites: &[(&str, &str, &str)] = &[
        (r"(\b(?:FROM|JOIN)\s+)ADMISSION\b", "ADMISSIONS", "template_00942_fromjoin_admission_to_admissions"),
        (r"(\b(?:FROM|JOIN)\s+)PATIENT\b", "PATIENTS", "template_00942_fromjoin_patient_to_patients"),
        (r"(\b(?:FROM|JOIN)\s+)TRANSFER\b", "TRANSFERS", "template_00942_fromjoin_transfer_to_transfers"),
        (r"(\b(?:FROM|JOIN)\s+)LABEVENT\b", "LABEVENTS", "template_00942_fromjoin_labevent_to_labevents"),
        (r"(\b(?:FROM|JOIN)\s+)CHARTEVENT\b", "CHARTEVENTS", "template_00942_fromjoin_chartevent_to_chartevents"),
    ];
    for (pattern, replacement, rule_name) in from_join_rewrites {
        let re = Regex::new(&format!("(?i){}", pattern)).expect("valid regex");
        let rewritten = re.replace_all(&text, format!("${{1}}{}", replacement)).into_owned();
        if rewritten != text {
            text = rewritten;
            rules.push((*rule_name).to_string());
        }
    }

    (text, rules)
}

fn repair_missing_keyword(sql: &str) -> (String, Vec<String>) {
    let mut rules: Vec<String> = Vec::new();
    let mut text = sql.to_string();

    // Common malformed CASE in generated SQL:
    // COUNT(CASE WHEN ... CNT 1 END) -> COUNT(CASE WHEN ... THEN 1 END)
    let re = Regex::new(r"(?i)\bCNT\s+1\s+END\b").expect("valid regex");
    let rewritten = re.replace_all(&text, "THEN 1 END").into_owned();
    if rewritten != text {
        text = rewritten;
        rules.push("template_00905_case_cnt_to_then".to_string());
    }

    (text, rules)
}

fn repair_timeout(question: &str, sql: &str) -> (String, Vec<String>) {
    let mut rules: Vec<String> = Vec::new();
    let mut text = sql.trim().trim_end_matches(';').to_string();
    if text.is_empty() {
        return (text, rules);
    }

    if !TOPN_INTENT_RE.is_match(question) {
        let (stripped, changed) = strip_top_level_order_by(&text);
        if changed {
            text = stripped;
            rules.push("template_timeout_strip_order_by".to_string());
        }
    }

    // Do not inject automatic ROWNUM limits during timeout repair; implicit
    // caps change result semantics silently.

    (text, rules)
}

/// Aggressive timeout variant: wrap known heavy event tables in ROWNUM-capped
/// inline views. Only used when the caller explicitly opts in.
pub fn sample_heavy_tables_for_timeout(sql: &str, cap: usize) -> (String, Vec<String>) {
    let mut rules: Vec<String> = Vec::new();
    let mut text = sql.trim().to_string();
    if text.is_empty() {
        return (text, rules);
    }

    for table in HEAVY_TIMEOUT_TABLES {
        let pattern = format!(
            r"(?i)\b(?P<kw>FROM|JOIN)\s+{}\b(?:\s+(?:AS\s+)?(?P<alias>[A-Za-z_][A-Za-z0-9_$#]*))?",
            table
        );
        let re = Regex::new(&pattern).expect("valid regex");
        let rewritten = re
            .replace_all(&text, |caps: &regex::Captures<'_>| {
                let kw = caps.name("kw").map(|m| m.as_str()).unwrap_or("FROM");
                let alias = caps.name("alias").map(|m| m.as_str()).filter(|a| !is_keyword(a));
                match alias {
                    Some(alias) => format!(
                        "{} (SELECT * FROM {} WHERE ROWNUM <= {}) {}",
                        kw, table, cap, alias
                    ),
                    None => {
                        // Keep any trailing keyword the optional group ate.
                        let tail = caps
                            .name("alias")
                            .map(|m| format!(" {}", m.as_str()))
                            .unwrap_or_default();
                        format!("{} (SELECT * FROM {} WHERE ROWNUM <= {}){}", kw, table, cap, tail)
                    }
                }
            })
            .into_owned();
        if rewritten != text {
            text = rewritten;
            rules.push(format!("template_timeout_sample_{}:{}", table.to_lowercase(), cap));
        }
    }
    (text, rules)
}

/// Append a top-level ROWNUM cap when none exists. Not part of the automatic
/// timeout repair; exposed for explicit sampling flows.
pub fn append_top_level_rownum_cap(sql: &str, cap: usize) -> (String, bool) {
    let text = sql.trim().trim_end_matches(';').to_string();
    if text.is_empty() || ROWNUM_CAP_RE.is_match(&text) {
        return (text, false);
    }
    let (head, tail) = match CLAUSE_MARKER_RE.find(&text) {
        Some(m) => (text[..m.start()].trim_end().to_string(), text[m.start()..].to_string()),
        None => (text.clone(), String::new()),
    };
    let capped_head = if WHERE_RE.is_match(&head) {
        format!("{} AND ROWNUM <= {}", head, cap)
    } else {
        format!("{} WHERE ROWNUM <= {}", head, cap)
    };
    let capped = if tail.is_empty() {
        capped_head
    } else {
        format!("{} {}", capped_head, tail)
    };
    let changed = capped != text;
    (capped, changed)
}

/// Apply every template whose error markers match, in template order.
pub fn apply_sql_error_templates(
    question: &str,
    sql: &str,
    error_message: &str,
) -> (String, Vec<String>) {
    let mut text = sql.trim().to_string();
    if text.is_empty() {
        return (text, Vec::new());
    }

    let mut rules: Vec<String> = Vec::new();
    if contains_any(error_message, TIMEOUT_MARKERS) {
        let (rewritten, timeout_rules) = repair_timeout(question, &text);
        text = rewritten;
        rules.extend(timeout_rules);
    }
    if contains_any(error_message, INVALID_IDENTIFIER_MARKERS) {
        let (rewritten, identifier_rules) = repair_invalid_identifier(&text, error_message);
        text = rewritten;
        rules.extend(identifier_rules);
    }
    if contains_any(error_message, INVALID_NUMBER_MARKERS) {
        let (rewritten, number_rules) = repair_invalid_number(&text, error_message);
        text = rewritten;
        rules.extend(number_rules);
    }
    if contains_any(error_message, TABLE_NOT_EXIST_MARKERS) {
        let (rewritten, table_rules) = repair_table_not_exists(&text);
        text = rewritten;
        rules.extend(table_rules);
    }
    if contains_any(error_message, MISSING_KEYWORD_MARKERS) {
        let (rewritten, keyword_rules) = repair_missing_keyword(&text);
        text = rewritten;
        rules.extend(keyword_rules);
    }

    (text, rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medication_rewrites_to_drug_on_prescriptions() {
        let sql = "SELECT P.MEDICATION FROM PRESCRIPTIONS P WHERE MEDICATION IS NOT NULL";
        let (fixed, rules) = apply_sql_error_templates(
            "항생제 처방",
            sql,
            r#"ORA-00904: "P"."MEDICATION": invalid identifier"#,
        );
        assert!(fixed.contains("P.DRUG"));
        assert!(!fixed.to_uppercase().contains("MEDICATION"));
        assert!(rules.contains(&"template_00904_prescriptions_medication_to_drug".to_string()));
    }

    #[test]
    fn long_title_on_items_becomes_label() {
        let sql = "SELECT D.LONG_TITLE FROM D_ITEMS D WHERE ROWNUM <= 5";
        let (fixed, rules) =
            apply_sql_error_templates("항목", sql, r#"ORA-00904: "LONG_TITLE": invalid identifier"#);
        assert!(fixed.contains("D.LABEL"));
        assert!(rules.contains(&"template_00904_long_title_to_label".to_string()));
    }

    #[test]
    fn singular_from_tables_pluralized_on_00942() {
        let sql = "SELECT COUNT(*) FROM ADMISSION JOIN PATIENT ON ADMISSION.SUBJECT_ID = PATIENT.SUBJECT_ID";
        let (fixed, rules) =
            apply_sql_error_templates("입원", sql, "ORA-00942: table or view does not exist");
        assert!(fixed.contains("FROM ADMISSIONS"));
        assert!(fixed.contains("JOIN PATIENTS"));
        assert!(rules.len() >= 2);
    }

    #[test]
    fn cnt_case_typo_becomes_then() {
        let sql = "SELECT COUNT(CASE WHEN X = 1 CNT 1 END) FROM T WHERE Y = 2";
        let (fixed, rules) = apply_sql_error_templates("건수", sql, "ORA-00905: missing keyword");
        assert!(fixed.contains("THEN 1 END"));
        assert!(rules.contains(&"template_00905_case_cnt_to_then".to_string()));
    }

    #[test]
    fn timeout_strips_order_by_without_topn_intent() {
        let sql = "SELECT SUBJECT_ID FROM LABEVENTS WHERE VALUENUM > 2 ORDER BY CHARTTIME";
        let (fixed, rules) = apply_sql_error_templates(
            "젖산 수치가 높은 환자",
            sql,
            "DPY-4024: call timeout of 180000 ms exceeded",
        );
        assert!(!fixed.to_uppercase().contains("ORDER BY"));
        assert!(rules.contains(&"template_timeout_strip_order_by".to_string()));

        let (kept, rules) = apply_sql_error_templates(
            "top 10 환자",
            sql,
            "DPY-4024: call timeout of 180000 ms exceeded",
        );
        assert!(kept.to_uppercase().contains("ORDER BY"));
        assert!(!rules.contains(&"template_timeout_strip_order_by".to_string()));
    }

    #[test]
    fn no_implicit_rownum_cap_in_timeout_repair() {
        let sql = "SELECT SUBJECT_ID FROM LABEVENTS WHERE VALUENUM > 2 ORDER BY CHARTTIME";
        let (fixed, _) = apply_sql_error_templates("환자", sql, "DPY-4024: timeout");
        assert!(!fixed.to_uppercase().contains("ROWNUM"));
    }

    #[test]
    fn heavy_table_sampling_preserves_alias() {
        let sql = "SELECT L.VALUENUM FROM LABEVENTS L WHERE L.ITEMID = 50813";
        let (fixed, rules) = sample_heavy_tables_for_timeout(sql, 50000);
        assert!(fixed.contains("(SELECT * FROM LABEVENTS WHERE ROWNUM <= 50000) L"));
        assert!(rules.iter().any(|r| r.starts_with("template_timeout_sample_labevents")));
    }
}

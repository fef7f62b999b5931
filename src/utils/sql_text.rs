//! Quote- and comment-aware SQL text helpers.
//!
//! Every rewrite rule in the pipeline works on raw SQL strings, so the
//! scanning primitives here must never treat text inside single-quoted
//! literals or comments as SQL structure.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

static BLOCK_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
static LINE_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--[^\r\n]*").expect("valid regex"));
static SINGLE_QUOTED_LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:''|[^'])*'").expect("valid regex"));
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static SQL_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]+"|[A-Za-z_][A-Za-z0-9_.$#]*|[(),]"#).expect("valid regex"));
static CTE_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:with|,)\s*([A-Za-z0-9_]+)\s+as\s*\(").expect("valid regex"));

const FROM_CLAUSE_END_KEYWORDS: &[&str] = &[
    "where", "group", "having", "order", "union", "intersect", "minus", "connect", "start",
    "model", "qualify",
];

/// Remove comments and blank out single-quoted literals so write-keyword and
/// table-reference scans cannot match inside `LIKE '%INSERT%'` and friends.
pub fn strip_literals_and_comments(sql: &str) -> String {
    let text = BLOCK_COMMENT_RE.replace_all(sql, " ");
    let text = LINE_COMMENT_RE.replace_all(&text, " ");
    SINGLE_QUOTED_LITERAL_RE.replace_all(&text, "''").into_owned()
}

/// Whitespace-collapsed, uppercased form used for content addressing.
pub fn normalize_sql(sql: &str) -> String {
    let text = sql.trim().trim_end_matches(';');
    SPACE_RE.replace_all(text, " ").to_uppercase()
}

/// Stable content hash of the normalized SQL.
pub fn sql_hash(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_sql(sql).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// Non-ASCII bytes count as identifier bytes so Hangul aliases never split a
// keyword match in half.
fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'#') || b >= 0x80
}

fn token_at(upper: &[u8], idx: usize, token: &str) -> bool {
    let bytes = token.as_bytes();
    if idx + bytes.len() > upper.len() || &upper[idx..idx + bytes.len()] != bytes {
        return false;
    }
    let prev_ok = idx == 0 || !is_ident_byte(upper[idx - 1]);
    let next_ok = idx + bytes.len() >= upper.len() || !is_ident_byte(upper[idx + bytes.len()]);
    prev_ok && next_ok
}

/// Walk `sql` outside of single-quoted literals, tracking parenthesis depth.
/// Calls `visit(depth, byte_index, ch)` for every unquoted character.
fn walk_unquoted<F: FnMut(usize, usize, char)>(upper: &str, mut visit: F) {
    let bytes = upper.as_bytes();
    let mut depth = 0usize;
    let mut in_single = false;
    let mut i = 0usize;
    while i < bytes.len() {
        let ch = bytes[i] as char;
        if in_single {
            if ch == '\'' {
                if i + 1 < bytes.len() && bytes[i + 1] as char == '\'' {
                    i += 2;
                    continue;
                }
                in_single = false;
            }
            i += 1;
            continue;
        }
        match ch {
            '\'' => in_single = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => visit(depth, i, ch),
        }
        i += 1;
    }
}

/// Projection list of the final top-level SELECT (between the last top-level
/// SELECT keyword and its FROM). Empty when the shape cannot be determined.
pub fn find_final_select_clause(sql: &str) -> String {
    let core = sql.trim().trim_end_matches(';');
    if core.is_empty() {
        return String::new();
    }
    let upper = core.to_uppercase();
    let upper_bytes = upper.as_bytes();

    let mut last_select: Option<usize> = None;
    walk_unquoted(&upper, |depth, i, _| {
        if depth == 0 && token_at(upper_bytes, i, "SELECT") {
            last_select = Some(i);
        }
    });
    let Some(select_idx) = last_select else {
        return String::new();
    };

    let mut from_idx: Option<usize> = None;
    walk_unquoted(&upper, |depth, i, _| {
        if depth == 0
            && from_idx.is_none()
            && i > select_idx + "SELECT".len()
            && token_at(upper_bytes, i, "FROM")
        {
            from_idx = Some(i);
        }
    });
    let Some(from_idx) = from_idx else {
        return String::new();
    };
    core[select_idx + "SELECT".len()..from_idx].trim().to_string()
}

/// Drop the top-level `ORDER BY` clause. Returns `(sql, changed)`.
pub fn strip_top_level_order_by(sql: &str) -> (String, bool) {
    let text = sql.trim().trim_end_matches(';').to_string();
    if text.is_empty() {
        return (text, false);
    }
    let upper = text.to_uppercase();
    let upper_bytes = upper.as_bytes();
    let mut order_pos: Option<usize> = None;
    walk_unquoted(&upper, |depth, i, _| {
        if depth == 0
            && upper_bytes[i..].starts_with(b"ORDER BY")
            && (i == 0 || !is_ident_byte(upper_bytes[i - 1]))
        {
            order_pos = Some(i);
        }
    });
    match order_pos {
        Some(pos) => (text[..pos].trim_end().to_string(), true),
        None => (text, false),
    }
}

/// Split a projection or GROUP BY list on top-level commas, respecting
/// parentheses and quoted literals.
pub fn split_top_level_csv(text: &str) -> Vec<String> {
    let value = text.trim();
    if value.is_empty() {
        return Vec::new();
    }
    let mut parts: Vec<String> = Vec::new();
    let mut token = String::new();
    let mut depth = 0usize;
    let mut in_single = false;
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_single {
            token.push(ch);
            if ch == '\'' {
                if chars.peek() == Some(&'\'') {
                    token.push(chars.next().expect("peeked"));
                } else {
                    in_single = false;
                }
            }
            continue;
        }
        match ch {
            '\'' => {
                in_single = true;
                token.push(ch);
            }
            '(' => {
                depth += 1;
                token.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                token.push(ch);
            }
            ',' if depth == 0 => {
                let item = token.trim().to_string();
                if !item.is_empty() {
                    parts.push(item);
                }
                token.clear();
            }
            _ => token.push(ch),
        }
    }
    let tail = token.trim().to_string();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// Extract a top-level clause body, e.g. the SELECT list or the GROUP BY
/// items, stopping at the first of `stop_at` markers.
pub fn extract_top_level_clause(sql: &str, clause: &str, stop_at: &[&str]) -> String {
    let text = sql.trim();
    if text.is_empty() {
        return String::new();
    }
    let upper = text.to_uppercase();
    let marker = format!(" {} ", clause.to_uppercase());
    let Some(idx) = upper.find(&marker) else {
        return String::new();
    };
    let start = idx + marker.len();
    let mut end = text.len();
    for stop in stop_at {
        let stop_marker = format!(" {} ", stop.to_uppercase());
        if let Some(stop_idx) = upper[start..].find(&stop_marker) {
            end = end.min(start + stop_idx);
        }
    }
    text[start..end].trim().to_string()
}

/// CTE names declared in a `WITH` prologue, lowercased.
pub fn cte_names(sql: &str) -> HashSet<String> {
    CTE_REF_RE
        .captures_iter(sql)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Candidate names a raw table reference could resolve to: the full
/// dotted form, the last segment, the owner segment, and so on.
pub fn table_ref_candidates(raw: &str) -> Vec<String> {
    let mut cleaned = raw.trim().to_string();
    cleaned = cleaned.replace(['(', ')', ',', ';', '"'], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = cleaned.split('.').filter(|p| !p.is_empty()).collect();
    let mut candidates: Vec<String> = vec![cleaned.to_string()];
    if let Some(last) = parts.last() {
        candidates.push((*last).to_string());
    }
    if parts.len() >= 2 {
        candidates.push(parts[parts.len() - 2].to_string());
    }
    if let Some(first) = parts.first() {
        candidates.push((*first).to_string());
    }
    let mut deduped: Vec<String> = Vec::new();
    for item in candidates {
        if !item.is_empty() && !deduped.contains(&item) {
            deduped.push(item);
        }
    }
    deduped
}

/// Depth-aware FROM/JOIN table reference walk. Subquery-internal SELECT/FROM
/// pairs resolve at their own depth, so CTE bodies and inline views are
/// covered without a full parser.
pub fn extract_table_refs(sql: &str) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    let mut depth: i32 = 0;
    let mut expecting_from: HashSet<i32> = HashSet::new();
    let mut in_from_clause: HashSet<i32> = HashSet::new();
    let mut awaiting_table: Option<i32> = None;

    for m in SQL_TOKEN_RE.find_iter(sql) {
        let token = m.as_str();
        let lowered = token.to_lowercase();

        match token {
            "(" => {
                depth += 1;
                continue;
            }
            ")" => {
                depth = (depth - 1).max(0);
                expecting_from.retain(|d| *d <= depth);
                in_from_clause.retain(|d| *d <= depth);
                if awaiting_table.map(|d| d > depth).unwrap_or(false) {
                    awaiting_table = None;
                }
                continue;
            }
            _ => {}
        }

        if lowered == "select" {
            expecting_from.insert(depth);
            continue;
        }
        if lowered == "from" {
            if expecting_from.contains(&depth) {
                in_from_clause.insert(depth);
                awaiting_table = Some(depth);
            }
            continue;
        }
        if lowered == "join" {
            awaiting_table = Some(depth);
            continue;
        }
        if in_from_clause.contains(&depth) && FROM_CLAUSE_END_KEYWORDS.contains(&lowered.as_str())
        {
            in_from_clause.remove(&depth);
            if awaiting_table == Some(depth) {
                awaiting_table = None;
            }
            continue;
        }
        if token == "," && in_from_clause.contains(&depth) {
            awaiting_table = Some(depth);
            continue;
        }
        if awaiting_table == Some(depth) {
            if token == "," || token == "(" {
                continue;
            }
            refs.push(token.to_string());
            awaiting_table = None;
        }
    }

    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_literals_but_keeps_structure() {
        let sql = "SELECT * FROM ADMISSIONS WHERE DIAGNOSIS LIKE '%INSERT%' -- note";
        let stripped = strip_literals_and_comments(sql);
        assert!(!stripped.contains("INSERT"));
        assert!(stripped.contains("ADMISSIONS"));
    }

    #[test]
    fn final_select_clause_skips_cte_bodies() {
        let sql = "WITH C AS (SELECT HADM_ID FROM ADMISSIONS) SELECT COUNT(*) AS CNT FROM C";
        assert_eq!(find_final_select_clause(sql), "COUNT(*) AS CNT");
    }

    #[test]
    fn order_by_strip_ignores_nested_clause() {
        let sql = "SELECT * FROM (SELECT A FROM T ORDER BY A) WHERE ROWNUM <= 5 ORDER BY 1";
        let (stripped, changed) = strip_top_level_order_by(sql);
        assert!(changed);
        assert!(stripped.contains("ORDER BY A"));
        assert!(!stripped.trim_end().ends_with("ORDER BY 1"));
    }

    #[test]
    fn table_refs_cover_joins_and_subqueries() {
        let sql = "SELECT A.HADM_ID FROM ADMISSIONS A JOIN (SELECT STAY_ID, HADM_ID FROM ICUSTAYS) I ON A.HADM_ID = I.HADM_ID";
        let refs = extract_table_refs(sql);
        assert!(refs.iter().any(|r| r == "ADMISSIONS"));
        assert!(refs.iter().any(|r| r == "ICUSTAYS"));
    }

    #[test]
    fn hash_is_insensitive_to_whitespace_and_case() {
        assert_eq!(
            sql_hash("select * from admissions"),
            sql_hash("SELECT  *\nFROM ADMISSIONS;")
        );
    }
}

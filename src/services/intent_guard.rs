//! SQL-vs-intent consistency checker.
//!
//! Pattern checks between the (Korean/English) question text and the final
//! SQL. Non-fatal: a detected issue triggers at most one post-process pass
//! and one targeted expert realignment, and a rewrite is kept only when the
//! issue set strictly shrinks without regression.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::PlannerIntent;
use crate::services::postprocess::{PostProcessor, Profile};
use crate::utils::sql_text::find_final_select_clause;

static RATIO_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(비율|비중|율|률|퍼센트|백분율|ratio|rate|proportion|percentage|pct)")
        .expect("valid regex")
});
static STRATIFY_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(연도별|월별|주별|일별|분기별|별로|에\s*따른|비교|대비|vs|versus|according\s+to|stratif|subgroup|\bby\s+(year|month|week|day|gender|sex|age|group|quartile|q[1-4]|service|department|diagnosis|procedure)\b)",
    )
    .expect("valid regex")
});
static YEARLY_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(연도별|년\s*별|yearly|by\s+year|annual)").expect("valid regex"));
static MONTHLY_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(월별|monthly|by\s+month)").expect("valid regex"));
static QUARTILE_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(사분위|quartile|q1\s*[-–~]\s*q4|\bq[1-4]\b)").expect("valid regex")
});
static WINDOW_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d+\s*(일|주|개월|월|년)\s*(이내|후)|within\s+\d+\s*(day|week|month|year)|after\s+\d+\s*(day|week|month|year))",
    )
    .expect("valid regex")
});
static YEAR_BUCKET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)EXTRACT\s*\(\s*YEAR\s+FROM|TO_CHAR\s*\([^)]*,\s*'YYYY'\s*\)")
        .expect("valid regex")
});
static MONTH_BUCKET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)TO_CHAR\s*\([^)]*,\s*'YYYY[-/]MM'\s*\)|TO_CHAR\s*\([^)]*,\s*'MM'\s*\)|EXTRACT\s*\(\s*MONTH\s+FROM",
    )
    .expect("valid regex")
});
static WINDOW_SQL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(INTERVAL|ADD_MONTHS|\+\s*\d+|BETWEEN\s+.+\s+AND\s+.+)").expect("valid regex")
});
static AGE_SEMANTIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(연령대|나이대|연령|나이|나잇대|aged?\b|age\s*(group|band|range)?\b)")
        .expect("valid regex")
});
static YEAR_SEMANTIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(연도|년도|연도별|년별|year|yearly|annual|anchor[_\s]*year)").expect("valid regex")
});
static AGE_GROUP_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(연령대|나이대|age\s*(group|band|range)|연령\s*구간)").expect("valid regex")
});
static GENDER_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(성별|남성|여성|\bgender\b|\bsex\b)").expect("valid regex"));
static EXTREMA_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(가장\s*(많|적)|최대|최소|최고|최저|most|least|highest|lowest|max|min|top\s*1|bottom\s*1)",
    )
    .expect("valid regex")
});
static SERVICE_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(진료과|서비스|과별|부서|department|service|curr_service|prev_service)")
        .expect("valid regex")
});
static ADMISSION_TYPE_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(입원\s*유형|입원유형|admission\s*type|admission_type|emergency|urgent|elective)")
        .expect("valid regex")
});
static DIAGNOSIS_PROCEDURE_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(진단|질환|병명|코드|icd|diagnos|procedure|시술|수술)").expect("valid regex")
});
static MORTALITY_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(사망|mortality|death|deceased|expire)").expect("valid regex"));
static ICU_INTENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(중환자실|\bicu\b)").expect("valid regex"));
static FIRST_ICU_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(first\s+icu|first[-\s]*stay|initial\s+icu|index\s+icu|첫\s*icu|첫번째\s*icu|최초\s*icu|처음\s*icu|첫\s*중환자실|최초\s*중환자실|처음\s*중환자실)",
    )
    .expect("valid regex")
});

static RATIO_SQL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bAVG\s*\(|\bRATE\b|\bRATIO\b|\bPCT\b").expect("valid regex"));
static QUARTILE_SQL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)NTILE\s*\(|\bQ[1-4]\b").expect("valid regex"));
static ANCHOR_YEAR_GROUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bANCHOR_YEAR_GROUP\b").expect("valid regex"));
static ANCHOR_AGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bANCHOR_AGE\b").expect("valid regex"));
static AGE_PROJECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bAGE_GROUP\b|\bANCHOR_AGE\b|\bCASE\b[\s\S]{0,300}\bANCHOR_AGE\b")
        .expect("valid regex")
});
static SERVICES_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(SERVICES|CURR_SERVICE|PREV_SERVICE)\b").expect("valid regex")
});
static DIAG_PROC_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(DIAGNOSES_ICD|PROCEDURES_ICD)\b").expect("valid regex"));
static ADMISSION_TYPE_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bADMISSION_TYPE\b").expect("valid regex"));
static ICUSTAYS_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bICUSTAYS\b").expect("valid regex"));
static HOSPITAL_EXPIRE_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bHOSPITAL_EXPIRE_FLAG\b").expect("valid regex"));
static DEATHTIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bDEATHTIME\b").expect("valid regex"));
static INTIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bINTIME\b").expect("valid regex"));
static OUTTIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bOUTTIME\b").expect("valid regex"));
static FIRST_ICU_WINDOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)ROW_NUMBER\s*\(\s*\)\s*OVER\s*\(\s*PARTITION\s+BY\s+[A-Za-z0-9_\.]*SUBJECT_ID\s+ORDER\s+BY\s+[A-Za-z0-9_\.]*INTIME",
    )
    .expect("valid regex")
});
static FIRST_ICU_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(FIRST_ICU|RN_FIRST_ICU)\b").expect("valid regex"));
static FIRST_ROW_FILTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bRN_FIRST_ICU\s*=\s*1\b").expect("valid regex"));
static GENERIC_RN_FILTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bRN\s*=\s*1\b").expect("valid regex"));
static GROUPING_SQL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)GROUP\s+BY|PARTITION\s+BY").expect("valid regex"));

pub fn prefer_anchor_age_semantics(intent_text: &str) -> bool {
    let text = intent_text.trim();
    if text.is_empty() {
        return false;
    }
    AGE_SEMANTIC_RE.is_match(text) && !YEAR_SEMANTIC_RE.is_match(text)
}

/// Detect semantic mismatches between the question (plus planner intent) and
/// the SQL. Returns issue codes, empty when aligned.
pub fn detect_intent_alignment_issues(
    question: &str,
    sql: &str,
    planner_intent: Option<&PlannerIntent>,
) -> Vec<String> {
    let q = question.trim();
    let text = sql.trim();
    if q.is_empty() || text.is_empty() {
        return Vec::new();
    }

    let planner_text = planner_intent.map(|p| p.as_text()).unwrap_or_default();
    let intent_text = format!("{} {}", q, planner_text).trim().to_string();
    let upper = text.to_uppercase();
    let mut issues: Vec<String> = Vec::new();

    let ratio_intent = RATIO_INTENT_RE.is_match(&intent_text);
    let quartile_intent = QUARTILE_INTENT_RE.is_match(&intent_text);
    let stratify_intent = STRATIFY_INTENT_RE.is_match(&intent_text);
    let yearly_intent = YEARLY_INTENT_RE.is_match(&intent_text);
    let monthly_intent = MONTHLY_INTENT_RE.is_match(&intent_text);
    let window_intent = WINDOW_INTENT_RE.is_match(&intent_text);
    let age_semantic_intent = prefer_anchor_age_semantics(&intent_text);
    let service_intent = SERVICE_INTENT_RE.is_match(&intent_text);
    let admission_type_intent = ADMISSION_TYPE_INTENT_RE.is_match(&intent_text);
    let diagnosis_or_procedure_intent = DIAGNOSIS_PROCEDURE_INTENT_RE.is_match(&intent_text);
    let mortality_intent = MORTALITY_INTENT_RE.is_match(&intent_text);
    let icu_intent = ICU_INTENT_RE.is_match(&intent_text);
    let first_icu_intent = FIRST_ICU_INTENT_RE.is_match(&intent_text);
    let age_gender_extrema_intent = AGE_GROUP_INTENT_RE.is_match(&intent_text)
        && GENDER_INTENT_RE.is_match(&intent_text)
        && EXTREMA_INTENT_RE.is_match(&intent_text);

    if ratio_intent {
        let has_ratio_expr = upper.contains('/') || RATIO_SQL_RE.is_match(&upper);
        if !has_ratio_expr {
            issues.push("ratio_intent_without_ratio_expression".to_string());
        }
    }

    if quartile_intent && !QUARTILE_SQL_RE.is_match(&upper) {
        issues.push("quartile_intent_without_ntile".to_string());
    }

    if stratify_intent && !GROUPING_SQL_RE.is_match(&upper) {
        issues.push("stratified_intent_without_grouping".to_string());
    }

    if yearly_intent && !YEAR_BUCKET_RE.is_match(text) {
        issues.push("yearly_intent_without_year_bucket".to_string());
    }

    if monthly_intent && !MONTH_BUCKET_RE.is_match(text) {
        issues.push("monthly_intent_without_month_bucket".to_string());
    }

    if window_intent && !WINDOW_SQL_RE.is_match(text) {
        issues.push("window_intent_without_time_window_predicate".to_string());
    }

    if age_semantic_intent
        && ANCHOR_YEAR_GROUP_RE.is_match(&upper)
        && !ANCHOR_AGE_RE.is_match(&upper)
    {
        issues.push("age_intent_mapped_to_anchor_year_group".to_string());
    }

    if age_gender_extrema_intent {
        let final_select = find_final_select_clause(text);
        if !AGE_PROJECTION_RE.is_match(&final_select) {
            issues.push("age_group_extrema_missing_age_projection".to_string());
        }
    }

    if service_intent && !admission_type_intent && !diagnosis_or_procedure_intent {
        let has_services_ref = SERVICES_REF_RE.is_match(&upper);
        if !has_services_ref {
            issues.push("service_intent_without_services_reference".to_string());
        }
        if DIAG_PROC_REF_RE.is_match(&upper) && !has_services_ref {
            issues.push("service_intent_mapped_to_diagnosis_or_procedure".to_string());
        }
    }

    if admission_type_intent && !ADMISSION_TYPE_REF_RE.is_match(&upper) {
        issues.push("admission_type_intent_without_admission_type_reference".to_string());
    }

    if icu_intent && mortality_intent {
        if !ICUSTAYS_REF_RE.is_match(&upper) {
            issues.push("icu_mortality_intent_without_icustays_reference".to_string());
        }
        let has_death_alignment = DEATHTIME_RE.is_match(&upper)
            && INTIME_RE.is_match(&upper)
            && OUTTIME_RE.is_match(&upper);
        if HOSPITAL_EXPIRE_REF_RE.is_match(&upper) && !has_death_alignment {
            issues.push("icu_mortality_mapped_to_hospital_expire_flag_only".to_string());
        }
    }

    if icu_intent && !first_icu_intent {
        let has_window = FIRST_ICU_WINDOW_RE.is_match(&upper);
        let forced = has_window
            || FIRST_ICU_REF_RE.is_match(&upper)
            || FIRST_ROW_FILTER_RE.is_match(&upper)
            || (GENERIC_RN_FILTER_RE.is_match(&upper) && has_window);
        if forced {
            issues.push("first_icu_forced_without_intent".to_string());
        }
    }

    issues
}

/// Outcome of one alignment-enforcement pass.
#[derive(Debug, Clone)]
pub struct AlignmentOutcome {
    pub sql: String,
    pub applied_rules: Vec<String>,
    pub remaining_issues: Vec<String>,
}

/// Run the post-processor once against detected issues. The rewrite is kept
/// only if the issue count strictly decreases and no new issue appears.
pub fn enforce_intent_alignment(
    processor: &PostProcessor,
    question: &str,
    sql: &str,
    planner_intent: Option<&PlannerIntent>,
) -> AlignmentOutcome {
    let before = detect_intent_alignment_issues(question, sql, planner_intent);
    if before.is_empty() {
        return AlignmentOutcome {
            sql: sql.to_string(),
            applied_rules: Vec::new(),
            remaining_issues: Vec::new(),
        };
    }

    let (profile, _) = processor.recommend_profile(question, sql, Profile::Relaxed);
    let outcome = processor.postprocess(question, sql, profile);
    let after = detect_intent_alignment_issues(question, &outcome.sql, planner_intent);

    let improved = after.len() < before.len();
    let no_regression = after.iter().all(|issue| before.contains(issue));
    if outcome.sql.trim() != sql.trim() && improved && no_regression {
        return AlignmentOutcome {
            sql: outcome.sql,
            applied_rules: outcome.rules,
            remaining_issues: after,
        };
    }
    AlignmentOutcome {
        sql: sql.to_string(),
        applied_rules: Vec::new(),
        remaining_issues: before,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_intent_needs_ratio_expression() {
        let issues = detect_intent_alignment_issues(
            "사망 비율 알려줘",
            "SELECT COUNT(*) FROM ADMISSIONS",
            None,
        );
        assert!(issues.contains(&"ratio_intent_without_ratio_expression".to_string()));

        let issues = detect_intent_alignment_issues(
            "사망 비율 알려줘",
            "SELECT SUM(HOSPITAL_EXPIRE_FLAG) / COUNT(*) FROM ADMISSIONS",
            None,
        );
        assert!(!issues.contains(&"ratio_intent_without_ratio_expression".to_string()));
    }

    #[test]
    fn age_intent_flags_anchor_year_group_substitution() {
        let issues = detect_intent_alignment_issues(
            "연령 분포 보여줘",
            "SELECT ANCHOR_YEAR_GROUP, COUNT(*) FROM PATIENTS GROUP BY ANCHOR_YEAR_GROUP",
            None,
        );
        assert!(issues.contains(&"age_intent_mapped_to_anchor_year_group".to_string()));
    }

    #[test]
    fn icu_mortality_proxy_flagged_without_death_alignment() {
        let issues = detect_intent_alignment_issues(
            "ICU 사망률",
            "SELECT AVG(HOSPITAL_EXPIRE_FLAG) FROM ADMISSIONS A JOIN ICUSTAYS I ON A.HADM_ID = I.HADM_ID",
            None,
        );
        assert!(issues.contains(&"icu_mortality_mapped_to_hospital_expire_flag_only".to_string()));

        let aligned = "SELECT COUNT(CASE WHEN A.DEATHTIME BETWEEN I.INTIME AND I.OUTTIME THEN 1 END) / NULLIF(COUNT(*), 0) FROM ADMISSIONS A JOIN ICUSTAYS I ON A.HADM_ID = I.HADM_ID";
        let issues = detect_intent_alignment_issues("ICU 사망률", aligned, None);
        assert!(!issues.contains(&"icu_mortality_mapped_to_hospital_expire_flag_only".to_string()));
    }

    #[test]
    fn first_icu_window_without_intent_is_flagged() {
        let sql = "SELECT * FROM (SELECT S.*, ROW_NUMBER() OVER (PARTITION BY S.SUBJECT_ID ORDER BY S.INTIME) RN FROM ICUSTAYS S) WHERE RN = 1";
        let issues = detect_intent_alignment_issues("ICU 재원일 평균", sql, None);
        assert!(issues.contains(&"first_icu_forced_without_intent".to_string()));

        let issues = detect_intent_alignment_issues("첫 ICU 입실 재원일", sql, None);
        assert!(!issues.contains(&"first_icu_forced_without_intent".to_string()));
    }

    #[test]
    fn yearly_intent_requires_year_bucket() {
        let issues = detect_intent_alignment_issues(
            "연도별 입원 건수",
            "SELECT COUNT(*) FROM ADMISSIONS GROUP BY ADMISSION_TYPE",
            None,
        );
        assert!(issues.contains(&"yearly_intent_without_year_bucket".to_string()));

        let issues = detect_intent_alignment_issues(
            "연도별 입원 건수",
            "SELECT EXTRACT(YEAR FROM ADMITTIME), COUNT(*) FROM ADMISSIONS GROUP BY EXTRACT(YEAR FROM ADMITTIME)",
            None,
        );
        assert!(!issues.contains(&"yearly_intent_without_year_bucket".to_string()));
    }
}

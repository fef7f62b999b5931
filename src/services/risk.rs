//! Deterministic intent-complexity and write-risk scorer.
//!
//! Pure text classifier over the (possibly translated) question. The scores
//! gate the planner and the expert review pass; write keywords dominate so a
//! mutation request can never look cheap.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::RiskInfo;
use crate::utils::text::token_count;

static WRITE_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(delete|update|insert|merge|drop|alter|truncate|create|grant|revoke)\b|삭제|지워|지우기|업데이트|수정|변경|삽입|추가|생성|초기화|드롭",
    )
    .expect("valid regex")
});
static DDL_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(drop|alter|truncate|create)\b|드롭|초기화|생성").expect("valid regex"));
static JOIN_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(join|left join|right join|inner join|outer join)\b").expect("valid regex")
});
static DERIVED_METRIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(비율|사망률|생존율|재입원율|발생률|rate|ratio|percentage|percent|mortality|survival|readmission|평균|중앙값|중위수|median|mean)",
    )
    .expect("valid regex")
});
static STRATIFICATION_KO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(연도별|월별|주별|일별|분기별|성별|연령별|군별|그룹별|추이|비교|대비|차이|사분위|분위수|하위군)")
        .expect("valid regex")
});
static STRATIFICATION_EN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(vs|versus|comparison|compared|by|stratified|quartile|q[1-4]|decile)\b")
        .expect("valid regex")
});
static TEMPORAL_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(최근|지난|작년|올해|전년|기간|이내|이후|전후|입원 후|수술 후|\d+\s*(일|주|개월|월|년)|between|from|to|within|after|before)",
    )
    .expect("valid regex")
});
static COHORT_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(진단|질환|수술|처치|투약|약물|중환자|icu|입원|환자군|코호트|고혈압|패혈증|뇌졸중|copd|aki|cabg)",
    )
    .expect("valid regex")
});
static MULTI_CONDITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(and|or)\b|및|그리고|또는|이면서|동시에|,").expect("valid regex"));
static BROAD_SCOPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(all|everything|entire)\b|전체 데이터|모든|전부").expect("valid regex")
});

/// Score one question. The caller passes the combined Korean + English text
/// when a translation exists so both token families contribute signals.
pub fn classify(question: &str) -> RiskInfo {
    let text = question.trim();
    let lowered = text.to_lowercase();
    let mut risk = 0i32;
    let mut complexity = 0i32;

    if WRITE_KEYWORDS.is_match(&lowered) {
        risk += 5;
    }
    if DDL_KEYWORDS.is_match(&lowered) {
        risk += 1;
    }

    let join_hits = JOIN_KEYWORDS.find_iter(&lowered).count() as i32;
    complexity += join_hits;
    if join_hits > 0 {
        complexity += 1;
    }

    let has_derived_metric = DERIVED_METRIC.is_match(&lowered);
    let has_stratification =
        STRATIFICATION_KO.is_match(&lowered) || STRATIFICATION_EN.is_match(&lowered);
    let has_temporal_constraint = TEMPORAL_CONSTRAINT.is_match(&lowered);
    let has_cohort_constraint = COHORT_CONSTRAINT.is_match(&lowered);
    let has_multi_condition = MULTI_CONDITION.is_match(&lowered);

    for signal in [
        has_derived_metric,
        has_stratification,
        has_temporal_constraint,
        has_cohort_constraint,
        has_multi_condition,
    ] {
        if signal {
            complexity += 1;
        }
    }

    if token_count(text) >= 20 {
        complexity += 1;
    }

    // Analytical combinations boost risk beyond their complexity share.
    if has_derived_metric && has_stratification {
        risk += 2;
    }
    if has_derived_metric && has_temporal_constraint {
        risk += 1;
    }
    if has_multi_condition && has_cohort_constraint {
        risk += 1;
    }

    if complexity >= 3 {
        risk += 1;
    }
    if complexity >= 4 {
        risk += 1;
    }
    if complexity >= 5 {
        risk += 1;
    }

    if BROAD_SCOPE.is_match(&lowered) {
        risk += 1;
    }

    let intent = if risk >= 3 { "risky" } else { "read" };
    RiskInfo { intent: intent.to_string(), complexity, risk }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_count_question_is_read() {
        let info = classify("환자 수 알려줘");
        assert_eq!(info.intent, "read");
        assert!(info.risk < 3);
    }

    #[test]
    fn write_keywords_force_high_risk() {
        let info = classify("delete all rows from admissions");
        assert!(info.risk >= 5);
        assert_eq!(info.intent, "risky");
    }

    #[test]
    fn yearly_mortality_scores_as_complex() {
        let info = classify("2018년부터 2020년까지 ICU 환자의 연도별 사망률");
        assert!(info.complexity >= 3, "complexity={}", info.complexity);
        assert_eq!(info.intent, "risky");
    }
}

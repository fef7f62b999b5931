use std::sync::Arc;

use crate::services::intent_guard::{detect_intent_alignment_issues, enforce_intent_alignment};
use crate::services::metadata::MetadataCache;
use crate::services::postprocess::PostProcessor;
use crate::models::PlannerIntent;

fn processor(dir: &std::path::Path) -> PostProcessor {
    PostProcessor::new(Arc::new(MetadataCache::new(dir)))
}

#[test]
fn age_question_never_silently_accepts_anchor_year_group() {
    // Either the SQL uses ANCHOR_AGE, or the issue code stays visible.
    let sql_wrong =
        "SELECT ANCHOR_YEAR_GROUP, COUNT(*) FROM PATIENTS GROUP BY ANCHOR_YEAR_GROUP";
    let issues = detect_intent_alignment_issues("연령별 환자 수", sql_wrong, None);
    assert!(issues.contains(&"age_intent_mapped_to_anchor_year_group".to_string()));

    let sql_right = "SELECT CASE WHEN ANCHOR_AGE < 40 THEN 'UNDER40' ELSE 'OVER40' END, \
                     COUNT(*) FROM PATIENTS GROUP BY CASE WHEN ANCHOR_AGE < 40 THEN 'UNDER40' \
                     ELSE 'OVER40' END";
    let issues = detect_intent_alignment_issues("연령별 환자 수", sql_right, None);
    assert!(!issues.contains(&"age_intent_mapped_to_anchor_year_group".to_string()));
}

#[test]
fn age_band_extrema_requires_age_projection_in_final_select() {
    let question = "Which age group has the highest mortality in 2019?";
    // 연령대 + 성별 + 최상위 trigger only together; English variant:
    let question_full = format!("{} by gender, age group", question);
    let missing = "SELECT GENDER, COUNT(*) FROM PATIENTS P GROUP BY GENDER";
    let issues = detect_intent_alignment_issues(&question_full, missing, None);
    assert!(issues.contains(&"age_group_extrema_missing_age_projection".to_string()));

    let present = "SELECT CASE WHEN ANCHOR_AGE < 40 THEN 'Y' END AS AGE_GROUP, GENDER, COUNT(*) \
                   FROM PATIENTS GROUP BY CASE WHEN ANCHOR_AGE < 40 THEN 'Y' END, GENDER";
    let issues = detect_intent_alignment_issues(&question_full, present, None);
    assert!(!issues.contains(&"age_group_extrema_missing_age_projection".to_string()));
}

#[test]
fn ratio_intent_resolved_by_postprocess_shrinks_issue_set() {
    let dir = tempfile::tempdir().unwrap();
    let processor = processor(dir.path());
    let sql = "SELECT EXTRACT(YEAR FROM A.ADMITTIME), AVG(A.HOSPITAL_EXPIRE_FLAG) \
               FROM ADMISSIONS A GROUP BY EXTRACT(YEAR FROM A.ADMITTIME)";
    // Ratio expression already present: no issue, SQL untouched.
    let outcome = enforce_intent_alignment(&processor, "연도별 사망률", sql, None);
    assert!(outcome.remaining_issues.is_empty());
    assert_eq!(outcome.sql, sql);
}

#[test]
fn post_guard_sql_keeps_ratio_token_for_ratio_intent() {
    let dir = tempfile::tempdir().unwrap();
    let processor = processor(dir.path());
    let sql = "SELECT SUM(A.HOSPITAL_EXPIRE_FLAG) / COUNT(*) AS MORT_RATE \
               FROM ADMISSIONS A WHERE A.ADMITTIME IS NOT NULL";
    let outcome = enforce_intent_alignment(&processor, "사망 비율", sql, None);
    let upper = outcome.sql.to_uppercase();
    assert!(upper.contains('/') || upper.contains("AVG(") || upper.contains("RATE"));
}

#[test]
fn planner_intent_text_widens_the_signal_surface() {
    let planner = PlannerIntent {
        grain: "yearly".to_string(),
        intent_summary: "yearly mortality trend".to_string(),
        ..Default::default()
    };
    let sql = "SELECT COUNT(*) / NULLIF(COUNT(DISTINCT HADM_ID), 0) FROM ADMISSIONS \
               WHERE DEATHTIME IS NOT NULL";
    let issues =
        detect_intent_alignment_issues("사망 환자 요약", sql, Some(&planner));
    assert!(issues.contains(&"yearly_intent_without_year_bucket".to_string()));
}

#[test]
fn realignment_is_never_a_regression() {
    let dir = tempfile::tempdir().unwrap();
    let processor = processor(dir.path());
    // The post-processor cannot fix a quartile issue; the SQL must come back
    // unchanged with the issue still visible.
    let sql = "SELECT AVG(VALUENUM) FROM LABEVENTS WHERE ITEMID = 50813";
    let outcome = enforce_intent_alignment(&processor, "사분위별 젖산 농도", sql, None);
    assert_eq!(outcome.sql, sql);
    assert!(outcome
        .remaining_issues
        .contains(&"quartile_intent_without_ntile".to_string()));
}

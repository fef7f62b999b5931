use std::collections::HashSet;

use crate::models::{DataFrame, dataframe_from_rows};
use crate::services::chart::engine::{RetryMode, plan_analyses};
use crate::services::chart::intent::IntentExtractor;
use crate::services::chart::{ChartRuleEngine, ContextFlags, validate_plan};
use serde_json::json;

fn frame(rows: Vec<serde_json::Value>) -> DataFrame {
    let columns: Vec<String> = rows
        .first()
        .and_then(|r| r.as_object())
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();
    let rows = rows
        .into_iter()
        .filter_map(|r| match r {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();
    dataframe_from_rows(&columns, rows)
}

fn extractor() -> IntentExtractor {
    IntentExtractor::new(None, "test-model".to_string(), 256)
}

#[tokio::test]
async fn multisplit_bar_question_yields_bar_grouped_first() {
    let df = frame(vec![
        json!({"age_group": "40s", "gender": "F", "survival_status": "사망", "cnt": 10}),
        json!({"age_group": "40s", "gender": "M", "survival_status": "생존", "cnt": 14}),
        json!({"age_group": "50s", "gender": "F", "survival_status": "사망", "cnt": 7}),
        json!({"age_group": "50s", "gender": "M", "survival_status": "생존", "cnt": 21}),
    ]);
    let engine = ChartRuleEngine::new(None, "test-model".to_string(), 256);
    let response = engine
        .recommend("연령별 사망 생존을 성별분포로 나눠서 막대그래프", &df, None)
        .await;

    assert!(!response.plans.is_empty(), "{:?}", response.failure_reasons);
    let first = &response.plans[0].chart_spec;
    assert_eq!(first.chart_type, "bar_grouped");
    assert_eq!(first.x.as_deref(), Some("age_group"));
    assert_eq!(first.y.as_deref(), Some("cnt"));
    assert_eq!(first.group.as_deref(), Some("gender"));
    assert_eq!(first.secondary_group.as_deref(), Some("survival_status"));
    assert_eq!(first.bar_mode.as_deref(), Some("group"));
}

#[tokio::test]
async fn plan_lists_have_unique_composite_keys() {
    let df = frame(vec![
        json!({"admission_type": "EMERGENCY", "gender": "F", "cnt": 4}),
        json!({"admission_type": "URGENT", "gender": "M", "cnt": 9}),
        json!({"admission_type": "ELECTIVE", "gender": "F", "cnt": 6}),
    ]);
    let engine = ChartRuleEngine::new(None, "test-model".to_string(), 256);
    let response = engine.recommend("입원 유형 비교", &df, None).await;

    let mut keys = HashSet::new();
    for plan in &response.plans {
        assert!(
            keys.insert(plan.chart_spec.dedupe_key()),
            "duplicate plan: {:?}",
            plan.chart_spec
        );
    }
}

#[tokio::test]
async fn constant_y_bar_plans_are_suppressed_with_reason() {
    let df = frame(vec![
        json!({"gender": "F", "cnt": 3}),
        json!({"gender": "M", "cnt": 3}),
    ]);
    let engine = ChartRuleEngine::new(None, "test-model".to_string(), 256);
    let response = engine.recommend("성별 비교 막대그래프", &df, None).await;

    assert!(
        response.plans.iter().all(|p| !p.chart_spec.is_bar()),
        "constant-Y bar must not survive: {:?}",
        response.plans
    );
    assert!(response
        .failure_reasons
        .iter()
        .any(|r| r == "bar_skipped_constant_y:cnt"));
}

#[test]
fn icu_trend_requires_elapsed_axis_and_trajectory_group() {
    let flags = ContextFlags { icu_context: true, admit_context: false, post_days: false };
    let columns: Vec<String> = ["stay_id", "intime", "charttime", "valuenum", "elapsed_days"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    // subject_id trajectory is refused.
    let time = crate::services::chart::engine::derive_time_var("trend", flags, &columns);
    assert!(validate_plan("trend", Some("subject_id"), time.as_ref(), &columns, flags).is_err());

    // stay_id with an elapsed axis passes.
    assert!(validate_plan("trend", Some("stay_id"), time.as_ref(), &columns, flags).is_ok());

    // Missing elapsed column blocks the trend entirely.
    let bare: Vec<String> = ["stay_id", "intime", "charttime", "valuenum"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let bare_time = crate::services::chart::engine::derive_time_var("trend", flags, &bare);
    assert!(validate_plan("trend", Some("stay_id"), bare_time.as_ref(), &bare, flags).is_err());
}

#[test]
fn icu_trend_plans_use_elapsed_x_and_stay_group() {
    let df = frame(vec![
        json!({"stay_id": 1, "intime": "2020-01-01", "charttime": "2020-01-02", "valuenum": 88.0, "elapsed_days": 1.0}),
        json!({"stay_id": 1, "intime": "2020-01-01", "charttime": "2020-01-03", "valuenum": 92.0, "elapsed_days": 2.0}),
        json!({"stay_id": 2, "intime": "2020-01-05", "charttime": "2020-01-06", "valuenum": 75.0, "elapsed_days": 1.0}),
    ]);
    let extractor = extractor();
    let mut intent = extractor.extract_by_rules("입실 후 심박수 변화 추이", &df);
    intent.primary_outcome = Some("valuenum".to_string());

    let mut failures = Vec::new();
    let plans = plan_analyses(&intent, &df, RetryMode::Normal, &mut failures);
    assert!(!plans.is_empty(), "failures: {:?}", failures);
    for plan in &plans {
        let spec = &plan.chart_spec;
        if spec.chart_type == "line" || spec.chart_type == "line_scatter" {
            assert_eq!(spec.x.as_deref(), Some("elapsed_days"));
            if let Some(group) = &spec.group {
                assert!(
                    ["stay_id", "hadm_id"].contains(&group.to_lowercase().as_str()),
                    "bad trend group {}",
                    group
                );
            }
        }
    }
}

#[tokio::test]
async fn explicit_hist_request_is_always_served() {
    let df = frame(vec![
        json!({"anchor_age": 34, "cnt": 1}),
        json!({"anchor_age": 55, "cnt": 2}),
    ]);
    let engine = ChartRuleEngine::new(None, "test-model".to_string(), 256);
    let response = engine.recommend("연령 히스토그램 보여줘", &df, None).await;
    assert!(!response.plans.is_empty());
    assert_eq!(response.plans[0].chart_spec.chart_type, "hist");
}

#[tokio::test]
async fn relaxed_retry_substitutes_box_for_blocked_trend() {
    // ICU trend without an elapsed column: normal mode yields nothing,
    // relaxed mode falls back to a box alternative.
    let df = frame(vec![
        json!({"stay_id": 1, "intime": "t0", "charttime": "t1", "valuenum": 80.0}),
        json!({"stay_id": 2, "intime": "t0", "charttime": "t2", "valuenum": 90.0}),
    ]);
    let engine = ChartRuleEngine::new(None, "test-model".to_string(), 256);
    let response = engine.recommend("입실 후 심박수 추이", &df, None).await;
    assert!(response.fallback_used);
    assert_eq!(response.fallback_stage.as_deref(), Some("retry_relaxed"));
    assert!(
        response
            .failure_reasons
            .iter()
            .any(|r| r.starts_with("trend_") || r.ends_with("plan_empty")),
        "{:?}",
        response.failure_reasons
    );
}

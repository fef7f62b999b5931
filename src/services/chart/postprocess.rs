//! Plan post-processing: dedupe, explicit-request injection, bar-style
//! ordering, constant-Y suppression, and category caps.

use std::collections::HashSet;

use crate::models::{ChartPlan, ChartSpec, ChartType, DataFrame};

use super::engine::record_failure;
use super::intent::BarStyle;

const DEFAULT_MAX_CATEGORIES: usize = 10;
const MAX_CATEGORY_CHART_TYPES: &[&str] = &[
    "bar",
    "bar_basic",
    "bar_grouped",
    "bar_stacked",
    "bar_hgroup",
    "bar_hstack",
    "bar_percent",
    "bar_hpercent",
    "lollipop",
];

pub fn dedupe_plans(plans: Vec<ChartPlan>) -> Vec<ChartPlan> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique: Vec<ChartPlan> = Vec::new();
    for plan in plans {
        if seen.insert(plan.chart_spec.dedupe_key()) {
            unique.push(plan);
        }
    }
    unique
}

/// Map explicit bar-style modifiers onto the preferred bar variant.
pub fn bar_preferred_chart_type(style: BarStyle) -> Option<ChartType> {
    if !style.requested {
        return None;
    }
    Some(if style.percent && style.horizontal {
        ChartType::BarHpercent
    } else if style.percent {
        ChartType::BarPercent
    } else if style.stacked && style.horizontal {
        ChartType::BarHstack
    } else if style.stacked {
        ChartType::BarStacked
    } else if style.horizontal {
        ChartType::BarHgroup
    } else if style.grouped || style.detailed {
        ChartType::BarGrouped
    } else {
        ChartType::BarBasic
    })
}

fn bar_order(chart_type: &str) -> usize {
    match chart_type {
        "bar_basic" | "bar" => 0,
        "bar_grouped" => 1,
        "bar_stacked" => 2,
        "bar_hgroup" => 3,
        "bar_hstack" => 4,
        "bar_percent" => 5,
        "bar_hpercent" => 6,
        _ => 999,
    }
}

/// Sort bar plans simple -> detailed with the style-preferred variant first.
pub fn prioritize_bar_plans(mut plans: Vec<ChartPlan>, style: BarStyle) -> Vec<ChartPlan> {
    let Some(preferred) = bar_preferred_chart_type(style) else {
        return plans;
    };
    let preferred = preferred.as_str();
    plans.sort_by_key(|plan| {
        let chart_type = plan.chart_spec.chart_type.to_lowercase();
        let is_bar = chart_type.starts_with("bar");
        let prefer_rank = if chart_type == preferred { 0 } else { 1 };
        (if is_bar { 0 } else { 1 }, prefer_rank, bar_order(&chart_type))
    });
    plans
}

/// Push the explicitly requested chart type to the front.
pub fn prioritize_requested_chart(
    mut plans: Vec<ChartPlan>,
    preferred_chart: Option<&str>,
) -> Vec<ChartPlan> {
    let Some(preferred) = preferred_chart.map(|p| p.trim().to_lowercase()).filter(|p| !p.is_empty())
    else {
        return plans;
    };
    plans.sort_by_key(|plan| {
        if plan.chart_spec.chart_type.to_lowercase() == preferred { 0 } else { 1 }
    });
    plans
}

fn best_seed(plans: &[ChartPlan]) -> Option<ChartSpec> {
    plans.first().map(|p| p.chart_spec.clone())
}

fn pick_hist_x(
    primary: Option<&str>,
    seed: Option<&ChartSpec>,
    df: &DataFrame,
) -> Option<String> {
    if let Some(primary) = primary {
        if df.is_numeric(primary) {
            return Some(primary.to_string());
        }
    }
    if let Some(seed) = seed {
        for candidate in [&seed.y, &seed.x] {
            if let Some(col) = candidate {
                if df.is_numeric(col) {
                    return Some(col.clone());
                }
            }
        }
    }
    df.column_names()
        .into_iter()
        .find(|name| df.is_numeric(name) && !super::engine::is_identifier_col(name))
}

/// An explicit hist request must yield at least one hist plan, synthesized
/// from the best available seed when the intent path produced none.
pub fn ensure_hist_plan(
    mut plans: Vec<ChartPlan>,
    preferred_chart: Option<&str>,
    primary: Option<&str>,
    group_var: Option<&str>,
    df: &DataFrame,
) -> Vec<ChartPlan> {
    if preferred_chart != Some("hist") {
        return plans;
    }
    if plans.iter().any(|p| p.chart_spec.chart_type == "hist") {
        return plans;
    }
    let seed = best_seed(&plans);
    let Some(x) = pick_hist_x(primary, seed.as_ref(), df) else {
        return plans;
    };
    let mut spec = ChartSpec::of(ChartType::Hist);
    spec.x = Some(x);
    spec.group = group_var
        .filter(|g| df.has_column(g) && df.is_low_cardinality(g, 8))
        .map(|g| g.to_string());
    plans.insert(
        0,
        ChartPlan::new(spec, "히스토그램을 명시적으로 요청해 분포 플랜을 추가했습니다."),
    );
    plans
}

fn pick_confusion_axes(df: &DataFrame) -> Option<(String, String)> {
    const ACTUAL_TOKENS: &[&str] =
        &["actual", "true", "ground_truth", "label", "target", "정답", "실제", "실측"];
    const PRED_TOKENS: &[&str] = &["pred", "prediction", "yhat", "inferred", "estimate", "예측", "추정"];

    let names = df.column_names();
    let categorical: Vec<String> = names
        .iter()
        .filter(|name| {
            !df.is_numeric(name)
                && !super::engine::is_identifier_col(name)
                && df.is_low_cardinality(name, 20)
        })
        .cloned()
        .collect();
    if categorical.len() < 2 {
        return None;
    }

    let actual = categorical.iter().find(|name| {
        let lowered = name.to_lowercase();
        ACTUAL_TOKENS.iter().any(|t| lowered.contains(t))
    });
    let pred = categorical.iter().find(|name| {
        let lowered = name.to_lowercase();
        PRED_TOKENS.iter().any(|t| lowered.contains(t))
    });
    match (actual, pred) {
        (Some(actual), Some(pred)) if actual != pred => Some((pred.clone(), actual.clone())),
        _ => Some((categorical[0].clone(), categorical[1].clone())),
    }
}

/// Same contract as hist: an explicit confusion-matrix request always gets
/// one, provided two reasonable categorical axes exist.
pub fn ensure_confusion_matrix_plan(
    mut plans: Vec<ChartPlan>,
    preferred_chart: Option<&str>,
    df: &DataFrame,
) -> Vec<ChartPlan> {
    if preferred_chart != Some("confusion_matrix") {
        return plans;
    }
    if plans.iter().any(|p| p.chart_spec.chart_type == "confusion_matrix") {
        return plans;
    }
    let Some((x, y)) = pick_confusion_axes(df) else {
        return plans;
    };
    let mut spec = ChartSpec::of(ChartType::ConfusionMatrix);
    spec.x = Some(x);
    spec.y = Some(y);
    if let Some(value_col) = df
        .column_names()
        .into_iter()
        .find(|name| df.is_numeric(name) && !super::engine::is_identifier_col(name))
    {
        spec.group = Some(value_col);
        spec.agg = Some("sum".to_string());
    }
    plans.insert(
        0,
        ChartPlan::new(spec, "혼동행렬을 명시적으로 요청해 범주 조합 플랜을 추가했습니다."),
    );
    plans
}

/// An explicit bar request must yield at least one bar plan.
pub fn ensure_bar_plan(
    mut plans: Vec<ChartPlan>,
    style: BarStyle,
    primary: Option<&str>,
    group_var: Option<&str>,
    df: &DataFrame,
) -> Vec<ChartPlan> {
    if !style.requested {
        return plans;
    }
    if plans.iter().any(|p| p.chart_spec.is_bar()) {
        return plans;
    }
    let seed = best_seed(&plans);
    let x = group_var
        .map(|g| g.to_string())
        .or_else(|| seed.as_ref().and_then(|s| s.x.clone()))
        .or_else(|| {
            df.column_names()
                .into_iter()
                .find(|name| !df.is_numeric(name) && df.is_low_cardinality(name, 20))
        });
    let y = primary
        .map(|p| p.to_string())
        .or_else(|| seed.as_ref().and_then(|s| s.y.clone()))
        .or_else(|| df.column_names().into_iter().find(|name| df.is_numeric(name)));
    let (Some(x), Some(y)) = (x, y) else {
        return plans;
    };
    let chart_type = bar_preferred_chart_type(style).unwrap_or(ChartType::BarBasic);
    let mut spec = ChartSpec::of(chart_type);
    spec.x = Some(x);
    spec.y = Some(y);
    if matches!(
        chart_type,
        ChartType::BarGrouped | ChartType::BarStacked | ChartType::BarHstack | ChartType::BarPercent
    ) {
        spec.group = seed.as_ref().and_then(|s| s.group.clone());
        spec.bar_mode = Some(
            if matches!(chart_type, ChartType::BarGrouped) { "group" } else { "stack" }.to_string(),
        );
    }
    if matches!(chart_type, ChartType::BarHgroup | ChartType::BarHstack | ChartType::BarHpercent) {
        spec.orientation = Some("h".to_string());
    }
    plans.insert(0, ChartPlan::new(spec, "막대그래프 요청을 반영해 막대 플랜을 추가했습니다."));
    plans
}

/// Default category cap for bar/lollipop variants.
pub fn apply_default_max_categories(mut plans: Vec<ChartPlan>) -> Vec<ChartPlan> {
    for plan in plans.iter_mut() {
        let chart_type = plan.chart_spec.chart_type.to_lowercase();
        if MAX_CATEGORY_CHART_TYPES.contains(&chart_type.as_str())
            && plan.chart_spec.max_categories.is_none()
        {
            plan.chart_spec.max_categories = Some(DEFAULT_MAX_CATEGORIES);
        }
    }
    plans
}

/// Drop bar plans whose Y column is numerically constant; a flat bar row
/// reads as data, not as a degenerate axis.
pub fn filter_constant_y_bar_plans(
    plans: Vec<ChartPlan>,
    df: &DataFrame,
    failure_reasons: &mut Vec<String>,
) -> Vec<ChartPlan> {
    plans
        .into_iter()
        .filter(|plan| {
            if !plan.chart_spec.is_bar() {
                return true;
            }
            let Some(y) = &plan.chart_spec.y else {
                return true;
            };
            if !df.has_column(y) || !df.is_numeric(y) {
                return true;
            }
            if df.numeric_nunique(y) <= 1 {
                record_failure(failure_reasons, format!("bar_skipped_constant_y:{}", y));
                return false;
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dataframe_from_rows;
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

    fn bar_plan(chart_type: &str, y: &str) -> ChartPlan {
        let mut spec = ChartSpec { chart_type: chart_type.to_string(), ..Default::default() };
        spec.x = Some("grp".to_string());
        spec.y = Some(y.to_string());
        ChartPlan::new(spec, "test")
    }

    #[test]
    fn dedupe_uses_the_full_composite_key() {
        let plans = vec![bar_plan("bar_basic", "cnt"), bar_plan("bar_basic", "cnt")];
        assert_eq!(dedupe_plans(plans).len(), 1);

        let mut different = bar_plan("bar_basic", "cnt");
        different.chart_spec.bar_mode = Some("stack".to_string());
        let plans = vec![bar_plan("bar_basic", "cnt"), different];
        assert_eq!(dedupe_plans(plans).len(), 2);
    }

    #[test]
    fn constant_y_bars_are_dropped_with_reason() {
        let df = frame(vec![
            json!({"grp": "a", "cnt": 5}),
            json!({"grp": "b", "cnt": 5}),
        ]);
        let mut reasons = Vec::new();
        let kept = filter_constant_y_bar_plans(vec![bar_plan("bar_basic", "cnt")], &df, &mut reasons);
        assert!(kept.is_empty());
        assert!(reasons.contains(&"bar_skipped_constant_y:cnt".to_string()));
    }

    #[test]
    fn varying_y_bars_survive() {
        let df = frame(vec![
            json!({"grp": "a", "cnt": 5}),
            json!({"grp": "b", "cnt": 7}),
        ]);
        let mut reasons = Vec::new();
        let kept = filter_constant_y_bar_plans(vec![bar_plan("bar_basic", "cnt")], &df, &mut reasons);
        assert_eq!(kept.len(), 1);
        assert!(reasons.is_empty());
    }

    #[test]
    fn bar_style_order_puts_preferred_variant_first() {
        let style = BarStyle { requested: true, stacked: true, ..Default::default() };
        let plans = vec![
            bar_plan("bar_basic", "cnt"),
            bar_plan("bar_stacked", "cnt"),
            bar_plan("bar_grouped", "cnt"),
        ];
        let ordered = prioritize_bar_plans(plans, style);
        assert_eq!(ordered[0].chart_spec.chart_type, "bar_stacked");
        assert_eq!(ordered[1].chart_spec.chart_type, "bar_basic");
    }

    #[test]
    fn max_categories_defaults_to_ten_on_bar_variants() {
        let plans = apply_default_max_categories(vec![bar_plan("lollipop", "cnt")]);
        assert_eq!(plans[0].chart_spec.max_categories, Some(10));
        let plans = apply_default_max_categories(vec![bar_plan("box", "cnt")]);
        assert_eq!(plans[0].chart_spec.max_categories, None);
    }

    #[test]
    fn explicit_hist_request_is_injected_and_first() {
        let df = frame(vec![json!({"age": 40, "cnt": 2}), json!({"age": 50, "cnt": 3})]);
        let plans = ensure_hist_plan(Vec::new(), Some("hist"), Some("age"), None, &df);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].chart_spec.chart_type, "hist");
        assert_eq!(plans[0].chart_spec.x.as_deref(), Some("age"));
    }
}

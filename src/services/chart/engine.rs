//! Chart plan generation rules.
//!
//! Assumptions baked into the rules: ADMISSIONS/ICUSTAYS are the anchor
//! tables, events hang off HADM_ID/STAY_ID, and PATIENTS is an attribute
//! table, never the analysis anchor. Plans that would violate clinical
//! reading (identifier groups, calendar time in ICU context) are refused
//! rather than bent.

use crate::models::{ChartPlan, ChartSpec, ChartType, DataFrame};

use super::intent::{ChartIntent, ContextFlags, infer_bar_style};

pub const FORBIDDEN_TRAJECTORY: &[&str] = &["subject_id", "patient_id"];
pub const ALLOWED_TRAJECTORY: &[&str] = &["stay_id", "hadm_id"];
pub const IDENTIFIER_COLS: &[&str] = &["subject_id", "hadm_id", "stay_id", "patient_id"];
pub const FORBIDDEN_GROUP_COLS: &[&str] = &[
    "subject_id",
    "hadm_id",
    "stay_id",
    "seq_num",
    "transfer_id",
    "orderid",
    "linkorderid",
    "order_provider_id",
    "caregiver_id",
    "pharmacy_id",
    "icd_code",
    "itemid",
    "emar_id",
    "poe_id",
];
pub const ALLOWED_GROUP_COLS: &[&str] = &[
    "gender",
    "anchor_year_group",
    "admission_type",
    "insurance",
    "language",
    "race",
    "marital_status",
    "first_careunit",
    "last_careunit",
    "curr_service",
    "careunit",
];
const TIME_CANDIDATES: &[&str] = &[
    "charttime",
    "admittime",
    "dischtime",
    "intime",
    "outtime",
    "starttime",
    "endtime",
    "storetime",
    "storedate",
    "edregtime",
    "edouttime",
    "ordertime",
    "transfertime",
    "chartdate",
];
const CLINICAL_HINTS: &[&str] = &[
    "subject_id",
    "hadm_id",
    "stay_id",
    "icd",
    "drg",
    "diagnosis",
    "admission",
    "discharge",
    "mortality",
    "los",
    "length_of_stay",
    "careunit",
    "icu",
    "ward",
    "charttime",
    "lab",
    "vital",
];
const ELAPSED_TOKENS: &[&str] =
    &["elapsed", "hours_since", "days_since", "day_offset", "hour_offset", "경과"];

pub fn is_identifier_col(col: &str) -> bool {
    let lowered = col.to_lowercase();
    IDENTIFIER_COLS.iter().any(|token| lowered.contains(token))
}

fn first_matching_col(columns: &[String], candidates: &[&str]) -> Option<String> {
    for candidate in candidates {
        if let Some(name) = columns.iter().find(|c| c.eq_ignore_ascii_case(candidate)) {
            return Some(name.clone());
        }
    }
    None
}

fn first_time_col(columns: &[String]) -> Option<String> {
    columns
        .iter()
        .find(|c| {
            let lowered = c.to_lowercase();
            TIME_CANDIDATES.iter().any(|t| lowered.contains(t)) || lowered.ends_with("time")
        })
        .cloned()
}

/// Derived elapsed-time column, if the result set carries one.
pub fn find_elapsed_column(columns: &[String]) -> Option<String> {
    columns
        .iter()
        .find(|c| {
            let lowered = c.to_lowercase();
            ELAPSED_TOKENS.iter().any(|t| lowered.contains(t))
        })
        .cloned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAxis {
    Elapsed,
    Calendar,
}

#[derive(Debug, Clone)]
pub struct TimeInfo {
    pub axis: TimeAxis,
    pub expr: Option<String>,
    pub source: &'static str,
    pub unit: &'static str,
}

/// Trend questions get their time axis from rules, not from the extractor:
/// ICU/admit context forces elapsed time.
pub fn derive_time_var(
    intent: &str,
    flags: ContextFlags,
    columns: &[String],
) -> Option<TimeInfo> {
    if intent != "trend" {
        return None;
    }

    if flags.icu_context {
        return Some(TimeInfo {
            axis: TimeAxis::Elapsed,
            expr: find_elapsed_column(columns),
            source: "charttime - intime",
            unit: "day",
        });
    }
    if flags.admit_context {
        return Some(TimeInfo {
            axis: TimeAxis::Elapsed,
            expr: find_elapsed_column(columns),
            source: "charttime - admittime",
            unit: "day",
        });
    }

    let chart_col = first_matching_col(columns, &["charttime", "chart_time", "charttimestamp"])
        .or_else(|| first_time_col(columns));
    chart_col.map(|col| TimeInfo {
        axis: TimeAxis::Calendar,
        expr: Some(col),
        source: "calendar",
        unit: "day",
    })
}

/// Trajectory-safe group selection per intent.
pub fn choose_group_var(
    intent: &str,
    flags: ContextFlags,
    columns: &[String],
) -> Option<String> {
    let lower: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();

    if flags.icu_context || intent == "trend" {
        if lower.iter().any(|c| c == "stay_id") {
            return Some("stay_id".to_string());
        }
        if lower.iter().any(|c| c == "hadm_id") {
            return Some("hadm_id".to_string());
        }
        return None;
    }

    let group = first_matching_col(columns, ALLOWED_GROUP_COLS)?;
    if FORBIDDEN_GROUP_COLS.contains(&group.to_lowercase().as_str()) {
        return None;
    }
    Some(group)
}

/// Clinical-plan contract checks. An `Err` names the violated requirement.
pub fn validate_plan(
    intent: &str,
    group_var: Option<&str>,
    time_info: Option<&TimeInfo>,
    columns: &[String],
    flags: ContextFlags,
) -> Result<(), String> {
    let cols_lower: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();
    let group_lower = group_var.unwrap_or("").to_lowercase();

    if intent == "trend" && flags.icu_context {
        if !cols_lower.iter().any(|c| c == "stay_id") {
            return Err("ICU/입실 후 trend는 stay_id 없이 생성할 수 없습니다.".to_string());
        }
        if !cols_lower.iter().any(|c| c == "intime") {
            return Err("ICU/입실 후 trend는 ICUSTAYS.INTIME 조인이 필요합니다.".to_string());
        }
        if !cols_lower
            .iter()
            .any(|c| TIME_CANDIDATES.iter().any(|t| c.contains(t)))
        {
            return Err("ICU/입실 후 trend는 시간 컬럼(chart/start/end/out/store time)이 필요합니다.".to_string());
        }
        if FORBIDDEN_TRAJECTORY.contains(&group_lower.as_str()) {
            return Err("ICU/입실 후 trend에서 subject_id/patient_id trajectory는 금지입니다.".to_string());
        }
        match time_info {
            Some(info) if info.axis == TimeAxis::Elapsed => {
                if info.expr.is_none() {
                    return Err("ICU/입실 후 trend는 경과시간 파생 컬럼이 필요합니다.".to_string());
                }
            }
            _ => return Err("ICU/입실 후 trend는 경과시간 축만 허용됩니다.".to_string()),
        }
    }

    if intent == "trend" && !group_lower.is_empty() {
        if FORBIDDEN_TRAJECTORY.contains(&group_lower.as_str()) {
            return Err("trend의 group_var로 subject_id/patient_id는 금지입니다.".to_string());
        }
        if !ALLOWED_TRAJECTORY.contains(&group_lower.as_str()) {
            if flags.icu_context || flags.admit_context {
                return Err("ICU/입원 trend의 group_var는 stay_id/hadm_id만 허용됩니다.".to_string());
            }
            if IDENTIFIER_COLS.iter().any(|t| group_lower.contains(t)) {
                return Err("trend의 group_var로 식별자 컬럼은 금지입니다.".to_string());
            }
        }
    }

    if matches!(intent, "comparison" | "distribution")
        && !group_lower.is_empty()
        && IDENTIFIER_COLS.iter().any(|t| group_lower.contains(t))
    {
        return Err("comparison/distribution에서 식별자 그룹은 금지입니다.".to_string());
    }

    if intent == "correlation" && IDENTIFIER_COLS.iter().any(|t| group_lower.contains(t)) {
        return Err("correlation에서 식별자 group은 금지입니다.".to_string());
    }

    if intent == "trend" && flags.post_days {
        match time_info {
            Some(info) if info.axis == TimeAxis::Elapsed && info.expr.is_some() => {}
            _ => return Err("'후 N일' 맥락은 경과시간 파생 컬럼이 필요합니다.".to_string()),
        }
    }

    if intent == "trend" && flags.admit_context && !flags.icu_context {
        if !cols_lower.iter().any(|c| c == "admittime") {
            return Err("입원 기준 trend는 ADMISSIONS.ADMITTIME 조인이 필요합니다.".to_string());
        }
        if !cols_lower
            .iter()
            .any(|c| TIME_CANDIDATES.iter().any(|t| c.contains(t)))
        {
            return Err("입원 기준 trend는 시간 컬럼(chart/start/end/out/store time)이 필요합니다.".to_string());
        }
    }

    if intent == "trend" {
        let has_rate_amount = cols_lower.iter().any(|c| c.contains("rate") || c.contains("amount"));
        let weak_axis = match time_info {
            None => true,
            Some(info) => info.expr.is_none() || info.expr.as_deref() == Some("charttime"),
        };
        if has_rate_amount && weak_axis {
            return Err("rate/amount trend는 시간 binning(경과시간 포함)이 필요합니다.".to_string());
        }
    }

    Ok(())
}

fn pick_patient_group(df: &DataFrame) -> Option<String> {
    let names = df.column_names();
    first_matching_col(&names, &["stay_id", "hadm_id"])
}

fn pick_secondary_group(df: &DataFrame, exclude: Option<&str>) -> Option<String> {
    let names = df.column_names();
    names
        .iter()
        .find(|name| {
            if let Some(exclude) = exclude {
                if name.eq_ignore_ascii_case(exclude) {
                    return false;
                }
            }
            let lowered = name.to_lowercase();
            ALLOWED_GROUP_COLS.contains(&lowered.as_str())
                || (!df.is_numeric(name)
                    && !is_identifier_col(name)
                    && df.is_low_cardinality(name, 12))
        })
        .cloned()
}

fn pick_safe_group(df: &DataFrame) -> Option<String> {
    let names = df.column_names();
    names
        .iter()
        .find(|name| {
            let lowered = name.to_lowercase();
            !df.is_numeric(name)
                && !is_identifier_col(name)
                && !TIME_CANDIDATES.iter().any(|t| lowered.contains(t))
                && df.is_low_cardinality(name, 10)
        })
        .cloned()
}

fn pick_clinical_group(df: &DataFrame) -> Option<String> {
    let names = df.column_names();
    first_matching_col(&names, ALLOWED_GROUP_COLS).filter(|col| df.is_low_cardinality(col, 12))
}

fn has_clinical_hint(df: &DataFrame) -> bool {
    df.column_names().iter().any(|name| {
        let lowered = name.to_lowercase();
        CLINICAL_HINTS.iter().any(|hint| lowered.contains(hint))
    })
}

fn numeric_candidates(df: &DataFrame, exclude: &[&str]) -> Vec<String> {
    df.column_names()
        .into_iter()
        .filter(|name| {
            df.is_numeric(name)
                && !is_identifier_col(name)
                && !exclude.iter().any(|e| name.eq_ignore_ascii_case(e))
        })
        .collect()
}

fn pick_numeric_by_tokens(candidates: &[String], tokens: &[&str]) -> Option<String> {
    for token in tokens {
        if let Some(name) = candidates
            .iter()
            .find(|c| c.to_lowercase().contains(&token.to_lowercase()))
        {
            return Some(name.clone());
        }
    }
    None
}

fn pick_animation_frame_col(df: &DataFrame) -> Option<String> {
    let names = df.column_names();
    names
        .iter()
        .find(|name| {
            let lowered = name.to_lowercase();
            (lowered.contains("year")
                || lowered.contains("month")
                || lowered.contains("frame")
                || lowered.contains("day"))
                && df.is_low_cardinality(name, 50)
        })
        .cloned()
}

fn pick_size_col(df: &DataFrame, exclude: &[&str]) -> Option<String> {
    // Bubble sizes must be positive-valued numerics.
    numeric_candidates(df, exclude).into_iter().find(|name| {
        df.rows.iter().all(|row| {
            row.get(name)
                .and_then(|v| v.as_f64())
                .map(|n| n > 0.0)
                .unwrap_or(true)
        })
    })
}

fn spec(chart_type: ChartType) -> ChartSpec {
    ChartSpec::of(chart_type)
}

fn plan(chart_spec: ChartSpec, reason: &str) -> ChartPlan {
    ChartPlan::new(chart_spec, reason)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    Normal,
    Relaxed,
}

pub fn record_failure(failure_reasons: &mut Vec<String>, reason: String) {
    if !failure_reasons.contains(&reason) {
        failure_reasons.push(reason);
    }
}

/// Generate the candidate plan list for one intent over one result set.
/// Post-processing (dedupe, prioritization, constant-Y suppression) runs in
/// [`super::postprocess`].
pub fn plan_analyses(
    intent_info: &ChartIntent,
    df: &DataFrame,
    retry_mode: RetryMode,
    failure_reasons: &mut Vec<String>,
) -> Vec<ChartPlan> {
    let intent = intent_info.analysis_intent.as_str();
    let primary = intent_info.primary_outcome.clone();
    let user_query = intent_info.user_query.as_str();
    let columns = df.column_names();
    let flags = intent_info.context_flags;
    let bar_style = infer_bar_style(user_query);
    let preferred_chart = intent_info.recommended_chart.clone().unwrap_or_default();

    let time_info = derive_time_var(intent, flags, &columns);
    let mut group_var = intent_info
        .group_var
        .clone()
        .or_else(|| choose_group_var(intent, flags, &columns));
    let time_var = time_info
        .as_ref()
        .and_then(|t| t.expr.clone())
        .or_else(|| intent_info.time_var.clone());

    // Relaxed retries drop the group first; most failures are group-shaped.
    if retry_mode == RetryMode::Relaxed
        && matches!(intent, "trend" | "distribution" | "comparison" | "proportion")
    {
        group_var = None;
    }

    if let Some(group) = &group_var {
        if df.has_column(group) && !df.is_low_cardinality(group, 30) {
            group_var = None;
        }
    }
    if let Some(group) = &group_var {
        let lowered = group.to_lowercase();
        if intent != "trend" && FORBIDDEN_GROUP_COLS.contains(&lowered.as_str()) {
            group_var = None;
        } else if intent == "trend" && !ALLOWED_TRAJECTORY.contains(&lowered.as_str()) {
            if flags.icu_context || flags.admit_context {
                group_var = None;
            } else if is_identifier_col(group) {
                group_var = None;
            } else if df.has_column(group) && !df.is_low_cardinality(group, 20) {
                group_var = None;
            }
        } else if matches!(intent, "distribution" | "comparison") && is_identifier_col(group) {
            group_var = None;
        }
    }

    let multisplit_axis = intent_info
        .multisplit
        .axis
        .clone()
        .filter(|c| df.has_column(c));
    let multisplit_group = intent_info
        .multisplit
        .group
        .clone()
        .filter(|c| df.has_column(c));
    let multisplit_secondary = intent_info
        .multisplit
        .secondary_group
        .clone()
        .filter(|c| df.has_column(c));

    let mut plans: Vec<ChartPlan> = Vec::new();

    match intent {
        "trend" => {
            let (Some(time_var), Some(primary)) = (time_var.clone(), primary.clone()) else {
                record_failure(failure_reasons, "trend_missing_axis_or_outcome".to_string());
                return plans;
            };
            match validate_plan(intent, group_var.as_deref(), time_info.as_ref(), &columns, flags)
            {
                Err(reason) => {
                    record_failure(failure_reasons, format!("trend_blocked: {}", reason));
                    if retry_mode == RetryMode::Relaxed {
                        let mut s = spec(ChartType::Box);
                        s.x = Some(time_var.clone());
                        s.y = Some(primary.clone());
                        plans.push(plan(
                            s,
                            "재시도 모드: trend 제약으로 line이 불가해 분포형 대안을 생성했습니다.",
                        ));
                    }
                }
                Ok(()) => {
                    let patient_group = pick_patient_group(df);
                    let line_group = patient_group.or_else(|| group_var.clone());
                    let line_type = if preferred_chart == "line_scatter" {
                        ChartType::LineScatter
                    } else {
                        ChartType::Line
                    };
                    if let Some(line_group) = &line_group {
                        let mut s = spec(line_type);
                        s.x = Some(time_var.clone());
                        s.y = Some(primary.clone());
                        s.group = Some(line_group.clone());
                        plans.push(plan(
                            s,
                            if line_type == ChartType::Line {
                                "환자별 변화(trajectory)를 직접 확인할 수 있습니다."
                            } else {
                                "시간 흐름에서 선과 점을 함께 확인할 수 있습니다."
                            },
                        ));
                        if df.is_low_cardinality(line_group, 8) {
                            let mut s = spec(ChartType::Area);
                            s.x = Some(time_var.clone());
                            s.y = Some(primary.clone());
                            s.group = Some(line_group.clone());
                            plans.push(plan(
                                s,
                                "면적 차트로 시간대별 누적 기여도를 시각적으로 확인할 수 있습니다.",
                            ));
                        }
                    } else if !flags.icu_context && !flags.admit_context {
                        let mut s = spec(line_type);
                        s.x = Some(time_var.clone());
                        s.y = Some(primary.clone());
                        plans.push(plan(s, "시간 축 기반 집계 추세를 확인할 수 있습니다."));
                        let mut s = spec(ChartType::Area);
                        s.x = Some(time_var.clone());
                        s.y = Some(primary.clone());
                        plans.push(plan(
                            s,
                            "면적 차트로 시간 흐름의 규모 변화(볼륨)를 함께 볼 수 있습니다.",
                        ));
                    }
                    let mut s = spec(ChartType::Box);
                    s.x = Some(time_var.clone());
                    s.y = Some(primary.clone());
                    plans.push(plan(s, "시간 구간별 분포와 이상치를 함께 확인할 수 있습니다."));
                    if let Some(group) = &group_var {
                        let mut s = spec(ChartType::Box);
                        s.x = Some(group.clone());
                        s.y = Some(primary.clone());
                        plans.push(plan(s, "그룹별 분포 차이와 이상치를 추가로 비교할 수 있습니다."));
                    }
                }
            }
        }
        "distribution" => {
            let Some(primary) = primary.clone() else {
                record_failure(failure_reasons, "distribution_missing_outcome".to_string());
                return plans;
            };
            let mut s = spec(ChartType::Hist);
            s.x = Some(primary.clone());
            plans.push(plan(s, "전체 분포를 확인하기에 적합합니다."));
            let mut s = spec(ChartType::Violin);
            s.y = Some(primary.clone());
            plans.push(plan(s, "밀도와 이상치를 동시에 보여주기 위해 바이올린 차트를 추가합니다."));
            if let Some(group) = &group_var {
                let mut s = spec(ChartType::Box);
                s.x = Some(group.clone());
                s.y = Some(primary.clone());
                plans.push(plan(s, "그룹별 분포 차이를 비교할 수 있습니다."));
                let mut s = spec(ChartType::Violin);
                s.x = Some(group.clone());
                s.y = Some(primary.clone());
                plans.push(plan(s, "그룹별 분포 형태 차이를 밀도 기반으로 비교할 수 있습니다."));
            }
        }
        "comparison" => {
            let Some(primary) = primary.clone() else {
                record_failure(failure_reasons, "comparison_missing_outcome".to_string());
                return plans;
            };
            if let Some(axis) = &multisplit_axis {
                if multisplit_group.is_some() || multisplit_secondary.is_some() {
                    let mut s = spec(ChartType::BarGrouped);
                    s.x = Some(axis.clone());
                    s.y = Some(primary.clone());
                    s.bar_mode = Some("group".to_string());
                    s.group = multisplit_group.clone().or_else(|| multisplit_secondary.clone());
                    if multisplit_group.is_some() && multisplit_secondary.is_some() {
                        s.secondary_group = multisplit_secondary.clone();
                    }
                    plans.push(plan(
                        s,
                        "질문의 복합 분할(연령/성별/사망-생존)을 반영해 막대 차트 슬롯을 조합했습니다.",
                    ));
                    if let (Some(group), Some(secondary)) =
                        (&multisplit_group, &multisplit_secondary)
                    {
                        let mut s = spec(ChartType::BarStacked);
                        s.x = Some(axis.clone());
                        s.y = Some(primary.clone());
                        s.group = Some(secondary.clone());
                        s.secondary_group = Some(group.clone());
                        s.bar_mode = Some("stack".to_string());
                        plans.push(plan(s, "보조 분할 축을 누적으로 바꾼 대안 시각화입니다."));
                    }
                }
            }
            if let Some(group) = &group_var {
                for (chart_type, reason) in [
                    (ChartType::BarBasic, "가장 단순한 막대 비교(기본형)입니다."),
                    (ChartType::Lollipop, "로리팝 차트로 순위/격차를 선명하게 보여줍니다."),
                    (ChartType::Box, "그룹별 분포 차이와 이상치를 비교하기 좋습니다."),
                ] {
                    let mut s = spec(chart_type);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    plans.push(plan(s, reason));
                }
                let second_group = multisplit_secondary
                    .clone()
                    .or_else(|| pick_secondary_group(df, Some(group)));
                if let Some(second) = second_group {
                    if df.is_low_cardinality(group, 16) && df.is_low_cardinality(&second, 16) {
                        let mut s = spec(ChartType::Treemap);
                        s.x = Some(group.clone());
                        s.group = Some(second.clone());
                        s.y = Some(primary.clone());
                        s.agg = Some("sum".to_string());
                        plans.push(plan(s, "트리맵으로 상·하위 구성 비율을 동시에 요약합니다."));
                    }
                    let mut s = spec(ChartType::BarGrouped);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.group = Some(second.clone());
                    s.bar_mode = Some("group".to_string());
                    plans.push(plan(s, "그룹형 막대로 카테고리별 세부 비교를 제공합니다."));
                    let mut s = spec(ChartType::BarStacked);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.group = Some(second.clone());
                    s.bar_mode = Some("stack".to_string());
                    plans.push(plan(s, "누적 막대로 전체 대비 구성 기여를 확인합니다."));
                    let mut s = spec(ChartType::BarHstack);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.group = Some(second.clone());
                    s.bar_mode = Some("stack".to_string());
                    s.orientation = Some("h".to_string());
                    plans.push(plan(s, "수평 누적 막대로 라벨 가독성을 높입니다."));
                    if df.is_low_cardinality(group, 20) && df.is_low_cardinality(&second, 20) {
                        let mut s = spec(ChartType::Heatmap);
                        s.x = Some(group.clone());
                        s.y = Some(second.clone());
                        s.group = Some(primary.clone());
                        s.agg = Some("sum".to_string());
                        plans.push(plan(s, "히트맵으로 두 범주 축의 강도를 한 화면에서 비교합니다."));
                        let mut s = spec(ChartType::ConfusionMatrix);
                        s.x = Some(second.clone());
                        s.y = Some(group.clone());
                        if df.is_numeric(&primary) {
                            s.group = Some(primary.clone());
                            s.agg = Some("sum".to_string());
                        }
                        plans.push(plan(
                            s,
                            "두 범주 조합의 집중 구간을 확인하기 위해 혼동행렬 스타일 시각화를 추가합니다.",
                        ));
                    }
                    if bar_style.percent {
                        let mut s = spec(ChartType::BarPercent);
                        s.x = Some(group.clone());
                        s.y = Some(primary.clone());
                        s.group = Some(second.clone());
                        s.bar_mode = Some("stack".to_string());
                        plans.push(plan(s, "100% 누적 막대로 비율 중심 비교를 제공합니다."));
                    }
                    if !bar_style.requested {
                        let mut s = spec(ChartType::NestedPie);
                        s.x = Some(group.clone());
                        s.group = Some(second.clone());
                        s.y = Some(primary.clone());
                        s.agg = Some("sum".to_string());
                        plans.push(plan(
                            s,
                            "비교 질문에서 상·하위 그룹 기여도를 한 번에 보여줍니다.",
                        ));
                    }
                } else if bar_style.horizontal {
                    let mut s = spec(ChartType::BarHgroup);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.bar_mode = Some("group".to_string());
                    s.orientation = Some("h".to_string());
                    plans.push(plan(s, "수평 막대로 비교 가독성을 높입니다."));
                }
            }
        }
        "proportion" => {
            let Some(primary) = primary.clone() else {
                record_failure(failure_reasons, "proportion_missing_outcome".to_string());
                return plans;
            };
            if time_var.is_none() {
                if let Some(axis) = &multisplit_axis {
                    if multisplit_group.is_some() || multisplit_secondary.is_some() {
                        let mut s = if bar_style.percent {
                            let mut s = spec(ChartType::BarPercent);
                            s.bar_mode = Some("stack".to_string());
                            s
                        } else {
                            let mut s = spec(ChartType::BarGrouped);
                            s.bar_mode = Some("group".to_string());
                            s
                        };
                        s.x = Some(axis.clone());
                        s.y = Some(primary.clone());
                        s.group =
                            multisplit_group.clone().or_else(|| multisplit_secondary.clone());
                        if multisplit_group.is_some() && multisplit_secondary.is_some() {
                            s.secondary_group = multisplit_secondary.clone();
                        }
                        plans.push(plan(
                            s,
                            "비율 질문의 복합 분할을 막대형 슬롯 조합으로 반영했습니다.",
                        ));
                    }
                }
            }
            if let Some(time_var) = &time_var {
                let mut s = spec(ChartType::Line);
                s.x = Some(time_var.clone());
                s.y = Some(primary.clone());
                s.group = group_var.clone();
                plans.push(plan(s, "시간에 따른 비율 변화를 확인할 수 있습니다."));
            } else if let Some(group) = &group_var {
                if preferred_chart == "lollipop" {
                    let mut s = spec(ChartType::Lollipop);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    plans.push(plan(
                        s,
                        "사용자가 로리팝 차트를 명시해 순위/격차 중심 비교를 우선 제공합니다.",
                    ));
                }
                if !bar_style.requested && df.is_low_cardinality(group, 12) {
                    let mut s = spec(ChartType::Pie);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.agg = Some("sum".to_string());
                    plans.push(plan(
                        s,
                        "그룹 비율을 직관적으로 비교하기 위해 파이 차트를 우선 제공합니다.",
                    ));
                }
                let mut s = spec(ChartType::BarBasic);
                s.x = Some(group.clone());
                s.y = Some(primary.clone());
                plans.push(plan(s, "그룹별 비율 차이를 확인할 수 있습니다."));
                let second_group = multisplit_secondary
                    .clone()
                    .or_else(|| pick_secondary_group(df, Some(group)));
                if let Some(second) = second_group {
                    let mut s = spec(ChartType::BarGrouped);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.group = Some(second.clone());
                    s.bar_mode = Some("group".to_string());
                    plans.push(plan(s, "그룹형 막대로 세부 비율을 비교할 수 있습니다."));
                    let mut s = spec(ChartType::BarStacked);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.group = Some(second.clone());
                    s.bar_mode = Some("stack".to_string());
                    plans.push(plan(s, "누적 막대로 전체 내 구성 비중을 확인할 수 있습니다."));
                    let mut s = spec(ChartType::BarHstack);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.group = Some(second.clone());
                    s.bar_mode = Some("stack".to_string());
                    s.orientation = Some("h".to_string());
                    plans.push(plan(s, "수평 누적 막대로 라벨 겹침을 줄이고 가독성을 높입니다."));
                    if bar_style.percent {
                        let mut s = spec(ChartType::BarPercent);
                        s.x = Some(group.clone());
                        s.y = Some(primary.clone());
                        s.group = Some(second.clone());
                        s.bar_mode = Some("stack".to_string());
                        plans.push(plan(s, "100% 누적 막대로 구성 비율을 직접 비교합니다."));
                    }
                    if !bar_style.requested {
                        let mut s = spec(ChartType::NestedPie);
                        s.x = Some(group.clone());
                        s.group = Some(second.clone());
                        s.y = Some(primary.clone());
                        s.agg = Some("sum".to_string());
                        plans.push(plan(
                            s,
                            "상·하위 비율을 동시에 보여주기 위해 중첩 파이를 추가합니다.",
                        ));
                    }
                } else if bar_style.horizontal {
                    let mut s = spec(ChartType::BarHgroup);
                    s.x = Some(group.clone());
                    s.y = Some(primary.clone());
                    s.bar_mode = Some("group".to_string());
                    s.orientation = Some("h".to_string());
                    plans.push(plan(s, "수평 막대로 그룹별 비율을 비교합니다."));
                }
            }
        }
        "correlation" => {
            let Some(primary) = primary.clone() else {
                record_failure(failure_reasons, "correlation_missing_outcome".to_string());
                return plans;
            };
            if is_identifier_col(&primary) {
                record_failure(failure_reasons, "correlation_identifier_outcome".to_string());
            } else if let Some(other) = numeric_candidates(df, &[primary.as_str()]).first().cloned()
            {
                let color_group = group_var
                    .clone()
                    .filter(|g| df.has_column(g))
                    .or_else(|| pick_secondary_group(df, None));
                match preferred_chart.as_str() {
                    "dynamic_scatter" => {
                        let animation_frame = pick_animation_frame_col(df);
                        let frame_excl = animation_frame.clone().unwrap_or_default();
                        let numerics = numeric_candidates(df, &[frame_excl.as_str()]);
                        let x_col = pick_numeric_by_tokens(
                            &numerics,
                            &["age", "x", "bill", "amount", "value"],
                        )
                        .or_else(|| numerics.first().cloned())
                        .unwrap_or_else(|| other.clone());
                        let mut y_col = pick_numeric_by_tokens(
                            &numerics,
                            &["los", "rate", "cnt", "count", "score", "days", "y"],
                        )
                        .unwrap_or_else(|| primary.clone());
                        if y_col == x_col {
                            if let Some(alt) = numerics.iter().find(|c| **c != x_col) {
                                y_col = alt.clone();
                            }
                        }
                        let size_col = pick_numeric_by_tokens(
                            &numerics,
                            &["cnt", "count", "size", "volume"],
                        )
                        .or_else(|| {
                            pick_size_col(df, &[x_col.as_str(), y_col.as_str(), frame_excl.as_str()])
                        });
                        if let Some(frame) = animation_frame {
                            let mut s = spec(ChartType::DynamicScatter);
                            s.x = Some(x_col);
                            s.y = Some(y_col);
                            s.group = color_group;
                            s.size = size_col;
                            s.animation_frame = Some(frame);
                            plans.push(plan(
                                s,
                                "시간/프레임에 따라 점의 이동을 보여주는 동적 산점도입니다.",
                            ));
                        } else {
                            let mut s = spec(ChartType::Scatter);
                            s.x = Some(other.clone());
                            s.y = Some(primary.clone());
                            s.group = color_group;
                            plans.push(plan(
                                s,
                                "동적 산점도 요청이지만 프레임 컬럼이 없어 정적 산점도로 대체했습니다.",
                            ));
                        }
                    }
                    "line_scatter" => {
                        let mut s = spec(ChartType::LineScatter);
                        s.x = Some(other.clone());
                        s.y = Some(primary.clone());
                        s.group = color_group;
                        plans.push(plan(
                            s,
                            "선과 점을 함께 사용해 관계와 변동을 동시에 표시합니다.",
                        ));
                    }
                    "line" => {
                        let mut s = spec(ChartType::Line);
                        s.x = Some(other.clone());
                        s.y = Some(primary.clone());
                        s.group = color_group;
                        plans.push(plan(s, "두 변수의 변화 패턴을 선형 흐름으로 확인합니다."));
                    }
                    _ => {
                        let mut s = spec(ChartType::Scatter);
                        s.x = Some(other.clone());
                        s.y = Some(primary.clone());
                        s.group = color_group;
                        plans.push(plan(s, "두 변수의 상관관계를 시각화합니다."));
                    }
                }
            } else {
                record_failure(failure_reasons, "correlation_missing_second_numeric".to_string());
            }
        }
        _ => {
            if let Some(primary) = primary.clone() {
                let mut s = spec(ChartType::Hist);
                s.x = Some(primary);
                plans.push(plan(s, "기본 분포를 확인하기 위한 플랜입니다."));
            }
        }
    }

    // Clinical-group box plan as an extra candidate outside the strict
    // distribution/comparison intents.
    if has_clinical_hint(df) && !matches!(intent, "distribution" | "comparison") {
        if let (Some(primary), Some(clinical_group)) =
            (primary, pick_clinical_group(df).or_else(|| pick_safe_group(df)))
        {
            let mut s = spec(ChartType::Box);
            s.x = Some(clinical_group);
            s.y = Some(primary);
            plans.push(plan(s, "임상 의사결정에 유용한 그룹별 분포를 확인합니다."));
        }
    }

    plans
}

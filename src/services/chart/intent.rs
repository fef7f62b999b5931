//! Visualization intent extraction.
//!
//! An LLM pass classifies the question when a provider is available; the
//! deterministic rule fallback keeps `/visualize` working without one. Both
//! paths normalize into the same `ChartIntent`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{ChartType, DataFrame};
use crate::services::llm::{ChatMessage, LlmClient, extract_json_object};

const INTENT_SYSTEM_PROMPT: &str = "Classify a clinical data-visualization request. Respond \
with one JSON object: {\"analysis_intent\": \"trend|distribution|comparison|proportion|\
correlation|overview\", \"primary_outcome\": string|null, \"time_var\": string|null, \
\"group_var\": string|null, \"recommended_chart\": string|null}. Use only column names that \
appear in the provided schema.";

pub const AGE_COLUMN_TOKENS: &[&str] = &["age_group", "age band", "age_band", "age", "연령", "나이"];
pub const GENDER_COLUMN_TOKENS: &[&str] = &["gender", "sex", "성별"];
pub const SURVIVAL_COLUMN_TOKENS: &[&str] = &[
    "survival", "alive", "dead", "mortality", "death", "expire", "status", "outcome", "사망",
    "생존",
];

static AGE_QUERY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(연령|나이|\bage\b)").expect("valid regex"));
static GENDER_QUERY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(성별|\bgender\b|\bsex\b)").expect("valid regex"));
static SURVIVAL_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(생존|사망|mortality|survival|death|alive|dead|expire)").expect("valid regex")
});
static TREND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(추이|변화|경과|trend|over\s+time|시간에\s*따라|trajectory)").expect("valid regex")
});
static DISTRIBUTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(분포|히스토그램|distribution|histogram|spread)").expect("valid regex")
});
static PROPORTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(비율|비중|구성비|점유율|proportion|percent|share)").expect("valid regex")
});
static COMPARISON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(비교|차이|대비|나눠서|별로|compare|comparison|versus|\bvs\b|by\s+group)")
        .expect("valid regex")
});
static CORRELATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(상관|관계|correlation|relationship|산점도|scatter)").expect("valid regex")
});
static POST_DAYS_RE: Lazy<Regex> = Lazy::new(|| {
    // A bare "후" is not enough; the window needs an explicit N + unit.
    Regex::new(r"(?i)(\d+\s*(일|주|개월|년)\s*(후|이내|동안)|after\s+\d+\s*(day|week|month|year))")
        .expect("valid regex")
});
static ICU_CONTEXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(중환자실|\bicu\b|입실\s*후|입실)").expect("valid regex")
});
static ADMIT_CONTEXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(입원\s*후|입원\s*기준|admission|admit)").expect("valid regex")
});
static BAR_REQUEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\bbar\b|막대|바\s*차트|막대그래프)").expect("valid regex"));
static STACKED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(누적|스택|stack)").expect("valid regex"));
static HORIZONTAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(수평|가로|horizontal)").expect("valid regex"));
static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(100%|백분율|퍼센트|percent)").expect("valid regex"));
static GROUPED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(그룹형|그룹별|묶어|grouped)").expect("valid regex"));
static DETAILED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(세부|상세|나눠서|detailed|split)").expect("valid regex"));

/// Explicit bar style modifiers detected in the user query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarStyle {
    pub requested: bool,
    pub stacked: bool,
    pub horizontal: bool,
    pub percent: bool,
    pub grouped: bool,
    pub detailed: bool,
}

pub fn infer_bar_style(user_query: &str) -> BarStyle {
    if user_query.trim().is_empty() {
        return BarStyle::default();
    }
    let requested = BAR_REQUEST_RE.is_match(user_query);
    if !requested {
        return BarStyle::default();
    }
    BarStyle {
        requested,
        stacked: STACKED_RE.is_match(user_query),
        horizontal: HORIZONTAL_RE.is_match(user_query),
        percent: PERCENT_RE.is_match(user_query),
        grouped: GROUPED_RE.is_match(user_query),
        detailed: DETAILED_RE.is_match(user_query),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub icu_context: bool,
    pub admit_context: bool,
    pub post_days: bool,
}

pub fn infer_context_flags(user_query: &str, columns: &[String]) -> ContextFlags {
    let cols_lower: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();
    let has_icu_columns =
        cols_lower.iter().any(|c| c == "stay_id") && cols_lower.iter().any(|c| c == "intime");
    ContextFlags {
        icu_context: ICU_CONTEXT_RE.is_match(user_query) || has_icu_columns,
        admit_context: ADMIT_CONTEXT_RE.is_match(user_query)
            || cols_lower.iter().any(|c| c == "admittime"),
        post_days: POST_DAYS_RE.is_match(user_query),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiSplit {
    #[serde(default)]
    pub axis: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub secondary_group: Option<String>,
}

fn find_column_by_tokens(df: &DataFrame, tokens: &[&str]) -> Option<String> {
    let names = df.column_names();
    for token in tokens {
        if let Some(name) = names
            .iter()
            .find(|name| name.to_lowercase().contains(&token.to_lowercase()))
        {
            return Some(name.clone());
        }
    }
    None
}

/// Infer the age/gender/survival bar slots a multi-split question implies.
pub fn infer_multisplit_slots(user_query: &str, df: &DataFrame) -> MultiSplit {
    let mut slots = MultiSplit::default();
    if user_query.trim().is_empty() {
        return slots;
    }
    if AGE_QUERY_RE.is_match(user_query) {
        slots.axis = find_column_by_tokens(df, AGE_COLUMN_TOKENS);
    }
    if GENDER_QUERY_RE.is_match(user_query) {
        slots.group = find_column_by_tokens(df, GENDER_COLUMN_TOKENS);
    }
    if SURVIVAL_QUERY_RE.is_match(user_query) {
        slots.secondary_group = find_column_by_tokens(df, SURVIVAL_COLUMN_TOKENS);
    }
    // Without an age axis, promote the splits so the axis slot is filled.
    if slots.axis.is_none() {
        if let Some(group) = slots.group.take() {
            slots.axis = Some(group);
            slots.group = slots.secondary_group.take();
        } else if let Some(secondary) = slots.secondary_group.take() {
            slots.axis = Some(secondary);
        }
    }
    slots
}

pub fn infer_intent(user_query: &str) -> String {
    let q = user_query.trim();
    if q.is_empty() {
        return "overview".to_string();
    }
    if TREND_RE.is_match(q) {
        return "trend".to_string();
    }
    if CORRELATION_RE.is_match(q) {
        return "correlation".to_string();
    }
    if DISTRIBUTION_RE.is_match(q) {
        return "distribution".to_string();
    }
    if PROPORTION_RE.is_match(q) {
        return "proportion".to_string();
    }
    if COMPARISON_RE.is_match(q) {
        return "comparison".to_string();
    }
    "overview".to_string()
}

/// Explicit chart request in the user's words; overrides the extractor.
pub fn infer_chart_preference(user_query: &str) -> Option<String> {
    let q = user_query.to_lowercase();
    let table: &[(&str, &str)] = &[
        ("confusion", "confusion_matrix"),
        ("혼동행렬", "confusion_matrix"),
        ("동적 산점도", "dynamic_scatter"),
        ("dynamic scatter", "dynamic_scatter"),
        ("line scatter", "line_scatter"),
        ("선과 점", "line_scatter"),
        ("히스토그램", "hist"),
        ("histogram", "hist"),
        ("hist", "hist"),
        ("롤리팝", "lollipop"),
        ("lollipop", "lollipop"),
        ("트리맵", "treemap"),
        ("treemap", "treemap"),
        ("히트맵", "heatmap"),
        ("heatmap", "heatmap"),
        ("파이", "pie"),
        ("pie", "pie"),
        ("산점도", "scatter"),
        ("scatter", "scatter"),
        ("박스", "box"),
        ("box", "box"),
        ("바이올린", "violin"),
        ("violin", "violin"),
    ];
    for (token, chart) in table {
        if q.contains(token) {
            return Some((*chart).to_string());
        }
    }
    if BAR_REQUEST_RE.is_match(&q) {
        return Some("bar".to_string());
    }
    if q.contains("라인") || q.contains("line") || q.contains("선 그래프") {
        return Some("line".to_string());
    }
    None
}

/// Normalized extraction result consumed by the rule engine.
#[derive(Debug, Clone, Default)]
pub struct ChartIntent {
    pub analysis_intent: String,
    pub primary_outcome: Option<String>,
    pub time_var: Option<String>,
    pub group_var: Option<String>,
    pub user_query: String,
    pub recommended_chart: Option<String>,
    pub multisplit: MultiSplit,
    pub context_flags: ContextFlags,
}

fn pick_primary_outcome(df: &DataFrame) -> Option<String> {
    const PREFERRED_NUMERIC_Y: &[&str] = &[
        "valuenum", "value", "amount", "rate", "los", "diagnosis_count", "count", "cnt",
        "anchor_age", "doses_per_24_hrs",
    ];
    let names = df.column_names();
    for token in PREFERRED_NUMERIC_Y {
        if let Some(name) = names.iter().find(|name| {
            name.to_lowercase().contains(token) && df.is_numeric(name)
        }) {
            return Some(name.clone());
        }
    }
    names
        .iter()
        .find(|name| df.is_numeric(name) && !super::engine::is_identifier_col(name))
        .cloned()
}

#[derive(Debug, Deserialize)]
struct LlmIntentPayload {
    #[serde(default)]
    analysis_intent: String,
    #[serde(default)]
    primary_outcome: Option<String>,
    #[serde(default)]
    time_var: Option<String>,
    #[serde(default)]
    group_var: Option<String>,
    #[serde(default)]
    recommended_chart: Option<String>,
}

pub struct IntentExtractor {
    llm: Option<Arc<dyn LlmClient>>,
    model: String,
    max_tokens: u32,
}

impl IntentExtractor {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, model: String, max_tokens: u32) -> Self {
        Self { llm, model, max_tokens }
    }

    /// Rule-only extraction; always succeeds.
    pub fn extract_by_rules(&self, user_query: &str, df: &DataFrame) -> ChartIntent {
        let columns = df.column_names();
        let mut intent = infer_intent(user_query);
        // A bar request splitting two or more category families is a
        // comparison even when the wording also says 분포.
        let multisplit = infer_multisplit_slots(user_query, df);
        let filled = [&multisplit.axis, &multisplit.group, &multisplit.secondary_group]
            .iter()
            .filter(|slot| slot.is_some())
            .count();
        if filled >= 2 && infer_bar_style(user_query).requested && intent != "trend" {
            intent = "comparison".to_string();
        }
        ChartIntent {
            analysis_intent: intent,
            primary_outcome: pick_primary_outcome(df),
            time_var: None,
            group_var: None,
            user_query: user_query.to_string(),
            recommended_chart: infer_chart_preference(user_query),
            multisplit,
            context_flags: infer_context_flags(user_query, &columns),
        }
    }

    /// LLM extraction with the rule fallback on any failure.
    pub async fn extract(
        &self,
        user_query: &str,
        df: &DataFrame,
        retrieved_context: Option<&str>,
    ) -> ChartIntent {
        let mut result = self.extract_by_rules(user_query, df);
        let Some(llm) = &self.llm else {
            return result;
        };

        let schema: Vec<serde_json::Value> = df
            .columns
            .iter()
            .map(|c| serde_json::json!({"name": &c.name, "dtype": c.dtype}))
            .collect();
        let payload = serde_json::json!({
            "user_query": user_query,
            "columns": schema,
            "context": retrieved_context,
        });
        let messages = vec![
            ChatMessage::system(INTENT_SYSTEM_PROMPT),
            ChatMessage::user(payload.to_string()),
        ];
        let response = match llm.chat(&messages, &self.model, self.max_tokens, true).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Intent extractor LLM unavailable, using rules: {}", err);
                return result;
            }
        };
        let parsed: LlmIntentPayload = match extract_json_object(&response.content)
            .and_then(|value| serde_json::from_value(value).map_err(Into::into))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("Intent extractor returned malformed JSON, using rules: {}", err);
                return result;
            }
        };

        let normalized = normalize_intent(&parsed.analysis_intent);
        if !normalized.is_empty() {
            result.analysis_intent = normalized;
        }
        let valid_column =
            |name: &Option<String>| name.as_ref().filter(|n| df.has_column(n)).cloned();
        if let Some(primary) = valid_column(&parsed.primary_outcome) {
            result.primary_outcome = Some(primary);
        }
        result.time_var = valid_column(&parsed.time_var).or(result.time_var);
        result.group_var = valid_column(&parsed.group_var).or(result.group_var);
        // An explicit chart in the user's own words wins over the model.
        if result.recommended_chart.is_none() {
            result.recommended_chart = parsed
                .recommended_chart
                .as_deref()
                .and_then(ChartType::parse)
                .map(|c| c.as_str().to_string());
        }
        result
    }
}

fn normalize_intent(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    match lowered.as_str() {
        "trend" | "distribution" | "comparison" | "proportion" | "correlation" | "overview" => {
            lowered
        }
        "time_series" | "timeseries" => "trend".to_string(),
        "ratio" | "share" => "proportion".to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dataframe_from_rows;

    fn df(cols: &[&str]) -> DataFrame {
        let columns: Vec<String> = cols.iter().map(|c| c.to_string()).collect();
        let mut row = serde_json::Map::new();
        for col in cols {
            row.insert(col.to_string(), serde_json::json!(1));
        }
        dataframe_from_rows(&columns, vec![row])
    }

    #[test]
    fn multisplit_query_fills_all_three_slots() {
        let frame = df(&["age_group", "gender", "survival_status", "cnt"]);
        let slots = infer_multisplit_slots("연령별 사망 생존을 성별분포로 나눠서 막대그래프", &frame);
        assert_eq!(slots.axis.as_deref(), Some("age_group"));
        assert_eq!(slots.group.as_deref(), Some("gender"));
        assert_eq!(slots.secondary_group.as_deref(), Some("survival_status"));
    }

    #[test]
    fn bar_style_modifiers_detected() {
        let style = infer_bar_style("누적 막대그래프로 보여줘");
        assert!(style.requested);
        assert!(style.stacked);

        let style = infer_bar_style("수평 100% 막대");
        assert!(style.horizontal);
        assert!(style.percent);

        assert!(!infer_bar_style("파이 차트").requested);
    }

    #[test]
    fn post_days_requires_numeric_window() {
        let flags = infer_context_flags("입실 3일 후 심박수", &["hr".to_string()]);
        assert!(flags.post_days);

        let flags = infer_context_flags("입실 후 심박수", &["hr".to_string()]);
        assert!(!flags.post_days, "bare 후 must not set post_days");
    }

    #[test]
    fn intent_rules_cover_main_families() {
        assert_eq!(infer_intent("시간에 따라 변화 추이"), "trend");
        assert_eq!(infer_intent("연령 분포"), "distribution");
        assert_eq!(infer_intent("성별 비율"), "proportion");
        assert_eq!(infer_intent("그룹 간 비교"), "comparison");
        assert_eq!(infer_intent("나이와 재원일의 상관"), "correlation");
        assert_eq!(infer_intent("데이터 보여줘"), "overview");
    }
}

//! Chart plan models shared by the rule engine and the `/visualize` surface.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;

/// Closed set of chart types the rule engine may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Line,
    Bar,
    BarBasic,
    BarGrouped,
    BarStacked,
    BarHgroup,
    BarHstack,
    BarPercent,
    BarHpercent,
    Lollipop,
    Hist,
    Scatter,
    Box,
    Violin,
    Pie,
    NestedPie,
    Heatmap,
    Treemap,
    Area,
    Pyramid,
    ConfusionMatrix,
    DynamicScatter,
    LineScatter,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Line => "line",
            ChartType::Bar => "bar",
            ChartType::BarBasic => "bar_basic",
            ChartType::BarGrouped => "bar_grouped",
            ChartType::BarStacked => "bar_stacked",
            ChartType::BarHgroup => "bar_hgroup",
            ChartType::BarHstack => "bar_hstack",
            ChartType::BarPercent => "bar_percent",
            ChartType::BarHpercent => "bar_hpercent",
            ChartType::Lollipop => "lollipop",
            ChartType::Hist => "hist",
            ChartType::Scatter => "scatter",
            ChartType::Box => "box",
            ChartType::Violin => "violin",
            ChartType::Pie => "pie",
            ChartType::NestedPie => "nested_pie",
            ChartType::Heatmap => "heatmap",
            ChartType::Treemap => "treemap",
            ChartType::Area => "area",
            ChartType::Pyramid => "pyramid",
            ChartType::ConfusionMatrix => "confusion_matrix",
            ChartType::DynamicScatter => "dynamic_scatter",
            ChartType::LineScatter => "line_scatter",
        }
    }

    pub fn is_bar(&self) -> bool {
        self.as_str().starts_with("bar")
    }

    pub fn parse(value: &str) -> Option<ChartType> {
        serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase())).ok()
    }
}

/// Axis/group/aggregation assignment for one recommended chart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChartSpec {
    pub chart_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bar_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_cols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_categories: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_title: Option<String>,
}

impl ChartSpec {
    pub fn of(chart_type: ChartType) -> Self {
        Self { chart_type: chart_type.as_str().to_string(), ..Default::default() }
    }

    pub fn chart_type(&self) -> Option<ChartType> {
        ChartType::parse(&self.chart_type)
    }

    pub fn is_bar(&self) -> bool {
        self.chart_type.to_lowercase().starts_with("bar")
    }

    /// Composite identity used for plan deduplication.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.chart_type,
            self.x.as_deref().unwrap_or(""),
            self.y.as_deref().unwrap_or(""),
            self.group.as_deref().unwrap_or(""),
            self.secondary_group.as_deref().unwrap_or(""),
            self.agg.as_deref().unwrap_or(""),
            self.size.as_deref().unwrap_or(""),
            self.animation_frame.as_deref().unwrap_or(""),
            self.mode.as_deref().unwrap_or(""),
            self.bar_mode.as_deref().unwrap_or(""),
            self.orientation.as_deref().unwrap_or(""),
            self.series_cols.as_ref().map(|s| s.join(",")).unwrap_or_default(),
        )
    }
}

/// One ranked recommendation: a chart assignment plus the reason it was
/// proposed.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChartPlan {
    pub chart_spec: ChartSpec,
    pub reason: String,
}

impl ChartPlan {
    pub fn new(chart_spec: ChartSpec, reason: impl Into<String>) -> Self {
        Self { chart_spec, reason: reason.into() }
    }
}

/// Column dtype as derived from the executed result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    Int,
    Float,
    Str,
    Bool,
    Datetime,
}

impl Dtype {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Dtype::Int | Dtype::Float)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: Dtype,
}

/// Lightweight result-set view the rule engine plans over: column specs plus
/// row objects keyed by column name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DataFrame {
    pub columns: Vec<ColumnSpec>,
    #[schema(value_type = Vec<Object>)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

impl DataFrame {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.dtype)
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        self.dtype(name).map(|d| d.is_numeric()).unwrap_or(false)
    }

    /// Distinct non-null value count of one column.
    pub fn nunique(&self, name: &str) -> usize {
        let mut seen: HashSet<String> = HashSet::new();
        for row in &self.rows {
            if let Some(value) = row.get(name) {
                if value.is_null() {
                    continue;
                }
                seen.insert(value.to_string());
            }
        }
        seen.len()
    }

    /// True when the column exists and its distinct count fits `max_groups`.
    /// A column with no rows counts as low-cardinality (nothing to explode).
    pub fn is_low_cardinality(&self, name: &str, max_groups: usize) -> bool {
        if !self.has_column(name) {
            return false;
        }
        self.nunique(name) <= max_groups
    }

    /// Distinct non-null numeric value count; non-numeric entries ignored.
    pub fn numeric_nunique(&self, name: &str) -> usize {
        let mut seen: HashSet<String> = HashSet::new();
        for row in &self.rows {
            if let Some(value) = row.get(name) {
                if let Some(n) = value.as_f64() {
                    seen.insert(format!("{:.12}", n));
                }
            }
        }
        seen.len()
    }
}

/// Build a [`DataFrame`] from raw rows, inferring dtypes column by column.
pub fn dataframe_from_rows(
    columns: &[String],
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
) -> DataFrame {
    let mut specs: Vec<ColumnSpec> = Vec::with_capacity(columns.len());
    for name in columns {
        let mut dtype = Dtype::Str;
        let mut saw_float = false;
        let mut saw_str = false;
        let mut saw_any = false;
        for row in &rows {
            let Some(value) = row.get(name) else { continue };
            if value.is_null() {
                continue;
            }
            saw_any = true;
            if value.is_boolean() {
                dtype = Dtype::Bool;
            } else if value.is_i64() || value.is_u64() {
                dtype = Dtype::Int;
            } else if value.is_f64() {
                saw_float = true;
            } else {
                saw_str = true;
                break;
            }
        }
        if saw_str {
            dtype = Dtype::Str;
        } else if saw_any && saw_float {
            dtype = Dtype::Float;
        }
        specs.push(ColumnSpec { name: name.clone(), dtype });
    }
    DataFrame { columns: specs, rows }
}

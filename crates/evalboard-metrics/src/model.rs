use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared output type of an evaluator metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Number,
    Integer,
    Boolean,
    String,
    Enum,
    MultiSelect,
}

impl MetricKind {
    pub fn shape(self) -> MetricShape {
        match self {
            MetricKind::Number | MetricKind::Integer => MetricShape::Numeric,
            MetricKind::Boolean => MetricShape::Boolean,
            MetricKind::String | MetricKind::Enum | MetricKind::MultiSelect => {
                MetricShape::Categorical
            }
        }
    }

    /// Human readable JSON type name, used in validation messages.
    pub fn type_name(self) -> &'static str {
        match self {
            MetricKind::Number => "number",
            MetricKind::Integer => "integer",
            MetricKind::Boolean => "boolean",
            MetricKind::String => "string",
            MetricKind::Enum => "enum",
            MetricKind::MultiSelect => "array",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricShape {
    Numeric,
    Boolean,
    Categorical,
}

impl MetricShape {
    /// Shape implied by a single observed value. `None` for null.
    pub fn infer(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(_) => Some(MetricShape::Boolean),
            serde_json::Value::Number(_) => Some(MetricShape::Numeric),
            _ => Some(MetricShape::Categorical),
        }
    }
}

/// One histogram bucket. `end` is inclusive only for the last bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionBin {
    pub start: f64,
    pub end: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyEntry {
    pub value: serde_json::Value,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricStats {
    Numeric {
        sum: f64,
        mean: f64,
        min: f64,
        max: f64,
        distribution: Vec<DistributionBin>,
        percentiles: BTreeMap<String, f64>,
    },
    Categorical {
        unique: Vec<serde_json::Value>,
        frequency: Vec<FrequencyEntry>,
    },
}

/// Aggregate statistic for one metric key across the scenarios of a run.
///
/// `count` is the number of scenarios that reported a usable value. Scenarios
/// without the metric are not counted, they are never treated as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub shape: MetricShape,
    pub count: u64,
    #[serde(flatten)]
    pub stats: MetricStats,
}

impl Metric {
    pub fn mean(&self) -> Option<f64> {
        match &self.stats {
            MetricStats::Numeric { mean, .. } if self.count > 0 => Some(*mean),
            _ => None,
        }
    }

    pub fn frequency(&self) -> &[FrequencyEntry] {
        match &self.stats {
            MetricStats::Categorical { frequency, .. } => frequency,
            MetricStats::Numeric { .. } => &[],
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.shape, MetricShape::Numeric)
    }
}

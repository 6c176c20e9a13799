//! Values derived from an aggregated [`Metric`] for chart summaries.

use crate::model::{Metric, MetricShape};
use serde::{Deserialize, Serialize};

/// Share of observations equal to `value`, in percent. Zero when the metric
/// has no observations.
pub fn frequency_percentage(metric: &Metric, value: &serde_json::Value) -> f64 {
    let total: u64 = metric.frequency().iter().map(|f| f.count).sum();
    if total == 0 {
        return 0.0;
    }
    let hits = metric
        .frequency()
        .iter()
        .find(|f| &f.value == value)
        .map(|f| f.count)
        .unwrap_or(0);
    100.0 * hits as f64 / total as f64
}

/// `100 * N / (N + M)` for a boolean metric with N true and M false.
pub fn true_percentage(metric: &Metric) -> f64 {
    frequency_percentage(metric, &serde_json::Value::Bool(true))
}

pub fn most_frequent(metric: &Metric) -> Option<(&serde_json::Value, u64)> {
    metric.frequency().first().map(|f| (&f.value, f.count))
}

/// Single headline value for an evaluator column or chart card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSummary {
    Mean {
        value: f64,
    },
    MostFrequent {
        value: serde_json::Value,
        percentage: f64,
    },
    Empty,
}

pub fn summarize(metric: &Metric) -> MetricSummary {
    if metric.count == 0 {
        return MetricSummary::Empty;
    }
    match metric.shape {
        MetricShape::Numeric => metric
            .mean()
            .map(|value| MetricSummary::Mean { value })
            .unwrap_or(MetricSummary::Empty),
        MetricShape::Boolean => MetricSummary::MostFrequent {
            value: serde_json::Value::Bool(true),
            percentage: true_percentage(metric),
        },
        MetricShape::Categorical => match most_frequent(metric) {
            Some((value, _)) => MetricSummary::MostFrequent {
                value: value.clone(),
                percentage: frequency_percentage(metric, value),
            },
            None => MetricSummary::Empty,
        },
    }
}

use crate::model::{FrequencyEntry, Metric, MetricKind, MetricShape, MetricStats};
use crate::stats::{histogram, percentile, percentile_label};
use crate::{DURATION_KEY, TOKENS_KEY, TOTAL_COST_KEY};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Declared kind per metric key. Keys absent here fall back to inference
/// from the first observed value (in input order).
pub type MetricSchema = BTreeMap<String, MetricKind>;

/// Flat metric values reported by one scenario.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScenarioOutput {
    pub scenario_id: String,
    pub values: BTreeMap<String, serde_json::Value>,
}

impl ScenarioOutput {
    pub fn new(scenario_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsOptions {
    pub histogram_bins: usize,
    pub percentiles: Vec<f64>,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            histogram_bins: 10,
            percentiles: vec![5.0, 10.0, 25.0, 50.0, 75.0, 90.0, 95.0],
        }
    }
}

/// Key for an evaluator metric: `"<evaluatorSlug>.<metricName>"`.
pub fn metric_key(evaluator_slug: &str, metric_name: &str) -> String {
    format!("{}.{}", evaluator_slug, metric_name)
}

pub fn compute_run_metrics(
    outputs: &[ScenarioOutput],
    schema: &MetricSchema,
) -> BTreeMap<String, Metric> {
    compute_run_metrics_with(outputs, schema, &MetricsOptions::default())
}

/// Aggregates every metric key reported by any scenario.
pub fn compute_run_metrics_with(
    outputs: &[ScenarioOutput],
    schema: &MetricSchema,
    options: &MetricsOptions,
) -> BTreeMap<String, Metric> {
    let keys: BTreeSet<&str> = outputs
        .iter()
        .flat_map(|o| o.values.keys().map(String::as_str))
        .collect();

    let mut out = BTreeMap::new();
    for key in keys {
        let observed: Vec<&serde_json::Value> = outputs
            .iter()
            .filter_map(|o| o.values.get(key))
            .filter(|v| !v.is_null())
            .collect();

        let Some(shape) = resolve_shape(key, schema, &observed) else {
            continue;
        };

        let metric = match shape {
            MetricShape::Numeric => numeric_metric(&observed, options),
            MetricShape::Boolean => boolean_metric(&observed),
            MetricShape::Categorical => categorical_metric(&observed),
        };
        out.insert(key.to_string(), metric);
    }
    out
}

fn resolve_shape(
    key: &str,
    schema: &MetricSchema,
    observed: &[&serde_json::Value],
) -> Option<MetricShape> {
    if let Some(kind) = schema.get(key) {
        return Some(kind.shape());
    }
    if matches!(key, DURATION_KEY | TOTAL_COST_KEY | TOKENS_KEY) {
        return Some(MetricShape::Numeric);
    }
    observed.iter().find_map(|v| MetricShape::infer(v))
}

fn numeric_metric(observed: &[&serde_json::Value], options: &MetricsOptions) -> Metric {
    let values: Vec<f64> = observed
        .iter()
        .filter_map(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .collect();

    let count = values.len() as u64;
    let sum: f64 = values.iter().sum();
    let (mean, min, max) = if values.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (
            sum / values.len() as f64,
            values.iter().copied().fold(f64::INFINITY, f64::min),
            values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        )
    };

    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let percentiles = options
        .percentiles
        .iter()
        .filter_map(|p| percentile(&sorted, *p).map(|v| (percentile_label(*p), v)))
        .collect();

    Metric {
        shape: MetricShape::Numeric,
        count,
        stats: MetricStats::Numeric {
            sum,
            mean,
            min,
            max,
            distribution: histogram(&values, options.histogram_bins),
            percentiles,
        },
    }
}

fn boolean_metric(observed: &[&serde_json::Value]) -> Metric {
    let mut trues = 0u64;
    let mut falses = 0u64;
    for v in observed {
        match v.as_bool() {
            Some(true) => trues += 1,
            Some(false) => falses += 1,
            None => {}
        }
    }

    let mut frequency = Vec::new();
    let mut unique = Vec::new();
    for (value, count) in [(true, trues), (false, falses)] {
        if count > 0 {
            unique.push(serde_json::Value::Bool(value));
            frequency.push(FrequencyEntry {
                value: serde_json::Value::Bool(value),
                count,
            });
        }
    }
    frequency.sort_by(|a, b| b.count.cmp(&a.count));

    Metric {
        shape: MetricShape::Boolean,
        count: trues + falses,
        stats: MetricStats::Categorical { unique, frequency },
    }
}

fn categorical_metric(observed: &[&serde_json::Value]) -> Metric {
    // canonical string -> (value, count)
    let mut counts: BTreeMap<String, (serde_json::Value, u64)> = BTreeMap::new();
    let mut count = 0u64;

    for v in observed {
        let items: Vec<&serde_json::Value> = match v {
            serde_json::Value::Array(items) => items.iter().filter(|i| !i.is_null()).collect(),
            serde_json::Value::Object(_) => continue,
            other => vec![*other],
        };
        if items.is_empty() {
            continue;
        }
        count += 1;
        for item in items {
            let entry = counts
                .entry(item.to_string())
                .or_insert_with(|| (item.clone(), 0));
            entry.1 += 1;
        }
    }

    let unique = counts.values().map(|(v, _)| v.clone()).collect();
    let mut frequency: Vec<FrequencyEntry> = counts
        .into_values()
        .map(|(value, count)| FrequencyEntry { value, count })
        .collect();
    // Stable sort keeps canonical order among ties.
    frequency.sort_by(|a, b| b.count.cmp(&a.count));

    Metric {
        shape: MetricShape::Categorical,
        count,
        stats: MetricStats::Categorical { unique, frequency },
    }
}

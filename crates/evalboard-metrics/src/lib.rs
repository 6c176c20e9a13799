//! Metric aggregation for evaluation runs.
//!
//! Everything in this crate is a pure function of its inputs. The same
//! scenario outputs always produce the same [`Metric`] map, serialized
//! byte-for-byte identically, so a cache can recompute freely without drift.
//!
//! # Keys
//!
//! Evaluator metrics are keyed `"<evaluatorSlug>.<metricName>"`. Invocation
//! level metrics use bare keys ([`DURATION_KEY`], [`TOTAL_COST_KEY`],
//! [`TOKENS_KEY`]).
//!
//! # Shapes
//!
//! A metric is either numeric (count/sum/mean/min/max/distribution/percentiles)
//! or categorical (count/unique/frequency). Booleans are categorical with
//! `true`/`false` as their only values. The shape comes from the evaluator's
//! declared [`MetricKind`] and never changes between recomputations.

pub mod compute;
pub mod derived;
pub mod model;
pub mod stats;

pub use compute::{
    compute_run_metrics, compute_run_metrics_with, metric_key, MetricSchema, MetricsOptions,
    ScenarioOutput,
};
pub use derived::{frequency_percentage, most_frequent, summarize, true_percentage, MetricSummary};
pub use model::{DistributionBin, FrequencyEntry, Metric, MetricKind, MetricShape, MetricStats};

/// Invocation latency in milliseconds.
pub const DURATION_KEY: &str = "duration";
/// Invocation cost in USD.
pub const TOTAL_COST_KEY: &str = "totalCost";
/// Total tokens consumed by the invocation.
pub const TOKENS_KEY: &str = "tokens";

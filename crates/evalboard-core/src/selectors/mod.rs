//! Derived view selectors.
//!
//! Pure projections over the store. Nothing here writes to a cell.

pub mod filters;
pub mod memo;
pub mod radar;
pub mod status;
pub mod summary;

pub use filters::{filter_counts, filter_scenarios, FilterCounts, ScenarioDigest, ScenarioFilter};
pub use memo::Memo;
pub use radar::{axes_from_metrics, normalize_axes, RadarAxis, RadarPoint};
pub use status::{aggregate_status, scenario_status, step_status, StatusTag};
pub use summary::{evaluator_summaries, EvaluatorSummary, MetricSummaryRow};

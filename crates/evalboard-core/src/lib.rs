//! Run-scoped state and synchronization engine for evaluation dashboards.
//!
//! The engine keeps any number of evaluation runs open side by side, each
//! in its own partition of a shared keyed store:
//!
//! - run state records (metadata, scenarios, evaluators, compare flags)
//! - scenario step data with an optimistic overlay
//! - run-level and scenario-level metric cells
//! - per-scenario mutation sync state
//!
//! User actions go through [`EvalEngine`]: the optimistic overlay is applied
//! before the network call, the confirmed batch is pushed, the scenario is
//! refetched, and only then is the run's metrics cache recomputed, once per
//! batch.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use evalboard_core::{EngineConfig, EvalEngine, InMemoryTransport, RunId, Store};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = Arc::new(InMemoryTransport::from_path("fixture.json".as_ref())?);
//! let engine = EvalEngine::new(Store::shared(), transport, EngineConfig::default())?;
//!
//! let base = RunId::new("run-a");
//! engine.set_compare_list(&base, &[RunId::new("run-b")]).await;
//! engine.load_run_metrics(&base).await?;
//! println!("{:?}", engine.filter_counts(&base));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod metrics_cache;
pub mod model;
pub mod revalidation;
pub mod runs;
pub mod selectors;
pub mod steps;
pub mod store;
pub mod transport;

// Re-export main types
pub use config::EngineConfig;
pub use engine::{CompareUpdate, EvalEngine, NavigationEvent};
pub use errors::{EngineError, EngineResult, FieldError, ValidationErrors};
pub use lifecycle::{CompareRegistry, CompareSet, LifecycleManager, RunFlags, BASE_COMPARE_INDEX};
pub use metrics_cache::{MetricsCache, MetricsCell, RunMetrics};
pub use model::{
    Annotation, EnrichedRun, EvaluatorDef, Loadable, MetricDef, RunId, RunLoad, RunState,
    Scenario, ScenarioId, ScenarioRef, ScenarioStepData, Step, StepStatus,
};
pub use revalidation::{
    AnnotationRequest, BatchReport, EvaluatorAnnotation, OpOutcome, RerunRequest,
    RevalidationCoordinator, ScenarioSync, SyncPhase,
};
pub use runs::RunRecords;
pub use selectors::{
    EvaluatorSummary, FilterCounts, MetricSummaryRow, RadarPoint, ScenarioFilter, StatusTag,
};
pub use steps::{apply_patches, StepCache, StepCell, StepPatch};
pub use store::{Store, Subscription};
pub use transport::{EvalTransport, Fixture, InMemoryTransport, InvocationOutcome, Operation};

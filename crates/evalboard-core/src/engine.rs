//! Engine facade.
//!
//! [`EvalEngine`] wires the store, the caches, the coordinator and the
//! lifecycle manager around one transport. Read accessors never fetch and
//! are safe to call while rendering. Everything that talks to the transport
//! is an explicit async action.

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::lifecycle::{CompareSet, LifecycleManager};
use crate::metrics_cache::{MetricsCache, MetricsCell};
use crate::model::{Loadable, RunId, RunState, ScenarioId, ScenarioStepData};
use crate::revalidation::{
    AnnotationRequest, BatchReport, RerunRequest, RevalidationCoordinator, ScenarioSync,
};
use crate::runs::RunRecords;
use crate::selectors::{
    axes_from_metrics, evaluator_summaries, filter_counts, filter_scenarios, normalize_axes,
    scenario_status, EvaluatorSummary, FilterCounts, Memo, RadarPoint, ScenarioDigest,
    ScenarioFilter, StatusTag,
};
use crate::steps::{StepCache, StepCell, StepPatch};
use crate::store::{ScenarioKey, Store, Subscription};
use crate::transport::{EvalTransport, InvocationOutcome};
use evalboard_metrics::Metric;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Discrete navigation events delivered by the address-bar adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    CompareListChanged {
        base: RunId,
        compare: Vec<RunId>,
    },
    ActiveScenarioChanged {
        run_id: RunId,
        scenario_id: ScenarioId,
    },
}

/// Outcome of [`EvalEngine::set_compare_list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompareUpdate {
    pub added: Vec<RunId>,
    /// Removed runs whose cells were dropped.
    pub disposed: Vec<RunId>,
    /// Removed runs still referenced by a listener. Their in-flight work is
    /// invalidated but their cells stay readable.
    pub retired: Vec<RunId>,
}

type SummaryInput = (Vec<crate::model::EvaluatorDef>, u64);

#[derive(Clone)]
pub struct EvalEngine {
    store: Arc<Store>,
    config: Arc<EngineConfig>,
    runs: RunRecords,
    steps: StepCache,
    metrics: MetricsCache,
    revalidation: RevalidationCoordinator,
    lifecycle: Arc<ReentrantMutex<RefCell<LifecycleManager>>>,
    active_scenario: Arc<Mutex<Option<(RunId, ScenarioId)>>>,
    filter_memo: Arc<Memo<RunId, Vec<ScenarioDigest>, FilterCounts>>,
    summary_memo: Arc<Memo<RunId, SummaryInput, Vec<EvaluatorSummary>>>,
}

impl EvalEngine {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn EvalTransport>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::config)?;

        let runs = RunRecords::new(Arc::clone(&store), Arc::clone(&transport));
        let steps = StepCache::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            config.stale_after(),
        );
        let metrics = MetricsCache::new(
            Arc::clone(&store),
            steps.clone(),
            config.metrics_options(),
            config.max_concurrent_fetches,
        );
        let revalidation = RevalidationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            steps.clone(),
            metrics.clone(),
            config.push_metrics,
            config.default_invocation_key.clone(),
        );
        tracing::debug!(
            transport = transport.transport_name(),
            palette_size = config.palette_size,
            "engine created"
        );

        Ok(Self {
            lifecycle: Arc::new(ReentrantMutex::new(RefCell::new(LifecycleManager::new(
                config.palette_size,
            )))),
            store,
            config: Arc::new(config),
            runs,
            steps,
            metrics,
            revalidation,
            active_scenario: Arc::new(Mutex::new(None)),
            filter_memo: Arc::new(Memo::new()),
            summary_memo: Arc::new(Memo::new()),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- reads ----

    pub fn run_state(&self, run_id: &RunId) -> Arc<RunState> {
        self.runs.get(run_id)
    }

    pub fn scenario_step_data(&self, run_id: &RunId, scenario_id: &ScenarioId) -> Arc<StepCell> {
        self.steps.read(run_id, scenario_id)
    }

    pub fn sync_state(&self, run_id: &RunId, scenario_id: &ScenarioId) -> Arc<ScenarioSync> {
        self.revalidation.sync_state(run_id, scenario_id)
    }

    pub fn run_metrics(&self, run_id: &RunId) -> Arc<MetricsCell> {
        self.metrics.get(run_id)
    }

    pub fn metric(&self, run_id: &RunId, key: &str) -> Loadable<Option<Metric>> {
        self.metrics.get_metric(run_id, key)
    }

    pub fn scenario_metric(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        key: &str,
    ) -> Option<serde_json::Value> {
        self.metrics.scenario_metric(run_id, scenario_id, key)
    }

    pub fn scenario_status(&self, run_id: &RunId, scenario_id: &ScenarioId) -> StatusTag {
        let cell = self.steps.read(run_id, scenario_id);
        let sync = self.sync_state(run_id, scenario_id);
        scenario_status(&cell, &sync)
    }

    fn digests(&self, run_id: &RunId) -> Vec<ScenarioDigest> {
        let run = self.runs.get(run_id);
        run.scenarios
            .iter()
            .map(|scenario| {
                let key = ScenarioKey::new(run_id, &scenario.id);
                ScenarioDigest::build(
                    scenario,
                    &self.store.steps.get(&key),
                    &self.store.sync.get(&key),
                    &run.evaluators,
                    &self.config.default_invocation_key,
                )
            })
            .collect()
    }

    pub fn filter_counts(&self, run_id: &RunId) -> FilterCounts {
        let digests = self.digests(run_id);
        *self
            .filter_memo
            .get_or_compute(run_id.clone(), digests, |d| filter_counts(d))
    }

    pub fn filtered_scenarios(&self, run_id: &RunId, filter: ScenarioFilter) -> Vec<ScenarioId> {
        filter_scenarios(&self.digests(run_id), filter)
    }

    pub fn evaluator_summaries(&self, run_id: &RunId) -> Loadable<Arc<Vec<EvaluatorSummary>>> {
        let run = self.runs.get(run_id);
        let cell = self.metrics.get(run_id);
        match &cell.data {
            Loadable::Ready(metrics) => {
                let input = (run.evaluators.clone(), cell.revision);
                Loadable::Ready(self.summary_memo.get_or_compute(
                    run_id.clone(),
                    input,
                    |(evaluators, _)| evaluator_summaries(evaluators, metrics),
                ))
            }
            Loadable::Idle => Loadable::Idle,
            Loadable::Loading => Loadable::Loading,
            Loadable::Failed(message) => Loadable::Failed(message.clone()),
        }
    }

    /// Radar points for every numeric and boolean metric of the run.
    /// `axis_max` overrides the default max per metric key.
    pub fn radar(
        &self,
        run_id: &RunId,
        axis_max: &BTreeMap<String, f64>,
    ) -> Loadable<Vec<RadarPoint>> {
        self.metrics.get(run_id).data.map(|metrics| {
            normalize_axes(
                &axes_from_metrics(metrics, axis_max),
                self.config.radar_headroom,
            )
        })
    }

    pub fn compare_set(&self) -> CompareSet {
        self.lifecycle.lock().borrow().current().clone()
    }

    pub fn color_of(&self, run_id: &RunId) -> Option<usize> {
        self.lifecycle.lock().borrow().registry().color_of(run_id)
    }

    pub fn active_scenario(&self) -> Option<(RunId, ScenarioId)> {
        self.active_scenario.lock().clone()
    }

    // ---- actions ----

    pub async fn initialize_run(&self, run_id: &RunId) -> bool {
        self.runs.initialize_run(run_id).await
    }

    pub async fn retry_run(&self, run_id: &RunId) -> bool {
        self.runs.retry_run(run_id).await
    }

    pub async fn refresh_scenarios(&self, run_id: &RunId) -> EngineResult<usize> {
        self.runs.refresh_scenarios(run_id).await
    }

    pub async fn load_step_data(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> Loadable<ScenarioStepData> {
        self.steps.get_step_data(run_id, scenario_id).await
    }

    pub async fn revalidate_scenario(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> EngineResult<ScenarioStepData> {
        self.steps.revalidate(run_id, scenario_id).await
    }

    pub fn apply_optimistic_step(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        patches: &[StepPatch],
    ) -> usize {
        self.steps.apply_optimistic(run_id, scenario_id, patches)
    }

    pub async fn load_run_metrics(&self, run_id: &RunId) -> EngineResult<Arc<MetricsCell>> {
        self.metrics.ensure(run_id).await
    }

    pub async fn refresh_run_metrics(&self, run_id: &RunId) -> EngineResult<Arc<MetricsCell>> {
        self.metrics.refresh(run_id).await
    }

    pub async fn enqueue_annotation(&self, request: &AnnotationRequest) -> EngineResult<BatchReport> {
        self.revalidation.enqueue_annotation(request).await
    }

    pub async fn enqueue_invocation(&self, request: &RerunRequest) -> EngineResult<InvocationOutcome> {
        self.revalidation.enqueue_invocation(request).await
    }

    /// Applies a new compare set. Flag writes and the retire/dispose of
    /// removed runs happen under the lifecycle lock, so a concurrent call
    /// can never re-add a run that this call then disposes. Added runs are
    /// initialized concurrently afterwards.
    pub async fn set_compare_list(&self, base: &RunId, compare: &[RunId]) -> CompareUpdate {
        let mut update = CompareUpdate::default();
        {
            let lifecycle = self.lifecycle.lock();
            let plan = lifecycle.borrow_mut().plan(base, compare);
            // listeners fired by these writes may read the compare set
            for (run_id, flags) in &plan.flags {
                self.runs.set_flags(run_id, *flags);
            }
            for run_id in &plan.removed {
                if self.store.is_referenced(run_id) {
                    self.runs.clear_comparison(run_id);
                    self.store.retire(run_id);
                    update.retired.push(run_id.clone());
                } else {
                    self.store.dispose_run(run_id);
                    self.steps.forget_run(run_id);
                    self.metrics.forget_run(run_id);
                    self.filter_memo.forget(run_id);
                    self.summary_memo.forget(run_id);
                    update.disposed.push(run_id.clone());
                }
            }
            update.added = plan.added;
        }

        let mut set = JoinSet::new();
        for run_id in update.added.clone() {
            let runs = self.runs.clone();
            set.spawn(async move { runs.initialize_run(&run_id).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "run initialization task failed");
            }
        }

        tracing::info!(
            base = %base,
            compare = compare.len(),
            added = update.added.len(),
            disposed = update.disposed.len(),
            retired = update.retired.len(),
            "compare list updated"
        );
        update
    }

    pub async fn handle_event(&self, event: NavigationEvent) -> EngineResult<()> {
        match event {
            NavigationEvent::CompareListChanged { base, compare } => {
                self.set_compare_list(&base, &compare).await;
                Ok(())
            }
            NavigationEvent::ActiveScenarioChanged {
                run_id,
                scenario_id,
            } => {
                let run = self.runs.get(&run_id);
                if run.is_ready() && !run.has_scenario(&scenario_id) {
                    return Err(EngineError::UnknownScenario {
                        run_id,
                        scenario_id,
                    });
                }
                *self.active_scenario.lock() = Some((run_id.clone(), scenario_id.clone()));
                // failures land in the step cell
                let _ = self.steps.get_step_data(&run_id, &scenario_id).await;
                Ok(())
            }
        }
    }

    // ---- subscriptions ----

    pub fn subscribe_run(
        &self,
        run_id: &RunId,
        callback: impl Fn(&Arc<RunState>) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.runs.subscribe(run_id, callback)
    }

    pub fn subscribe_steps(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        callback: impl Fn(&Arc<StepCell>) + Send + Sync + 'static,
    ) -> Subscription {
        self.store
            .steps
            .subscribe(&ScenarioKey::new(run_id, scenario_id), callback)
    }

    pub fn subscribe_sync(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        callback: impl Fn(&Arc<ScenarioSync>) + Send + Sync + 'static,
    ) -> Subscription {
        self.store
            .sync
            .subscribe(&ScenarioKey::new(run_id, scenario_id), callback)
    }

    pub fn subscribe_metrics(
        &self,
        run_id: &RunId,
        callback: impl Fn(&Arc<MetricsCell>) + Send + Sync + 'static,
    ) -> Subscription {
        self.store.run_metrics.subscribe(run_id, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnrichedRun, Step, StepStatus};
    use crate::transport::{FixtureRun, FixtureScenario, InMemoryTransport};

    fn fixture_run(id: &str, scenarios: &[&str]) -> FixtureRun {
        FixtureRun {
            run: serde_json::from_value::<EnrichedRun>(serde_json::json!({
                "id": id,
                "name": format!("run {}", id),
            }))
            .unwrap(),
            scenarios: scenarios
                .iter()
                .map(|s| FixtureScenario {
                    id: ScenarioId::new(*s),
                    testcase_id: None,
                    steps: ScenarioStepData {
                        invocation_steps: vec![Step::new("default", StepStatus::Success)],
                        ..Default::default()
                    },
                })
                .collect(),
        }
    }

    fn engine(transport: Arc<InMemoryTransport>) -> EvalEngine {
        EvalEngine::new(Store::shared(), transport, EngineConfig::default()).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            palette_size: 0,
            ..Default::default()
        };
        let err = EvalEngine::new(Store::shared(), Arc::new(InMemoryTransport::new()), config)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[tokio::test]
    async fn removed_unreferenced_run_is_disposed() {
        let transport = Arc::new(InMemoryTransport::new());
        for id in ["base", "a"] {
            transport.insert_run(fixture_run(id, &["s1"]));
        }
        let engine = engine(Arc::clone(&transport));
        let base = RunId::new("base");
        let a = RunId::new("a");

        engine.set_compare_list(&base, &[a.clone()]).await;
        assert!(engine.run_state(&a).is_ready());

        let update = engine.set_compare_list(&base, &[]).await;
        assert_eq!(update.disposed, vec![a.clone()]);
        assert_eq!(engine.store().cell_count(&a), 0);
        assert!(engine.run_state(&base).is_base);
    }

    #[tokio::test]
    async fn removed_referenced_run_is_retired_not_dropped() {
        let transport = Arc::new(InMemoryTransport::new());
        for id in ["base", "a"] {
            transport.insert_run(fixture_run(id, &["s1"]));
        }
        let engine = engine(Arc::clone(&transport));
        let base = RunId::new("base");
        let a = RunId::new("a");

        engine.set_compare_list(&base, &[a.clone()]).await;
        let _watch = engine.subscribe_run(&a, |_| {});
        let epoch = engine.store().epoch(&a);

        let update = engine.set_compare_list(&base, &[]).await;
        assert_eq!(update.retired, vec![a.clone()]);
        assert_eq!(engine.store().epoch(&a), epoch + 1);
        let state = engine.run_state(&a);
        assert!(state.is_ready());
        assert!(!state.is_comparison);
        assert_eq!(state.compare_index, None);
    }

    #[tokio::test]
    async fn active_scenario_event_fetches_steps() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.insert_run(fixture_run("r", &["s1"]));
        let engine = engine(Arc::clone(&transport));
        let run = RunId::new("r");
        let s1 = ScenarioId::new("s1");
        engine.initialize_run(&run).await;

        engine
            .handle_event(NavigationEvent::ActiveScenarioChanged {
                run_id: run.clone(),
                scenario_id: s1.clone(),
            })
            .await
            .unwrap();
        assert_eq!(engine.active_scenario(), Some((run.clone(), s1.clone())));
        assert!(engine.scenario_step_data(&run, &s1).data.has_data());

        let err = engine
            .handle_event(NavigationEvent::ActiveScenarioChanged {
                run_id: run.clone(),
                scenario_id: ScenarioId::new("missing"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownScenario { .. }));
    }

    #[tokio::test]
    async fn filter_counts_are_memoized_by_value() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.insert_run(fixture_run("r", &["s1", "s2"]));
        let engine = engine(Arc::clone(&transport));
        let run = RunId::new("r");
        engine.initialize_run(&run).await;

        let first = engine.filter_counts(&run);
        let second = engine.filter_counts(&run);
        assert_eq!(first, second);
        assert_eq!(first.all, 2);
        assert_eq!(engine.filter_memo.computations(), 1);

        engine
            .load_step_data(&run, &ScenarioId::new("s1"))
            .await;
        let third = engine.filter_counts(&run);
        assert_eq!(third.pending, 1);
        assert_eq!(engine.filter_memo.computations(), 2);
    }
}

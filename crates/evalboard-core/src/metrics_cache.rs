//! Run-level metrics cache.
//!
//! Metrics are recomputed from scenario step data only when asked to
//! (first read, or once per confirmed mutation batch). Optimistic writes
//! never trigger a refresh. Each refresh also fills the per-scenario metric
//! cells so a single table cell can subscribe to one value.

use crate::errors::{EngineError, EngineResult};
use crate::model::{Loadable, RunId, ScenarioId};
use crate::steps::StepCache;
use crate::store::{MetricCellKey, Store};
use evalboard_metrics::{compute_run_metrics_with, Metric, MetricsOptions, ScenarioOutput};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub type RunMetrics = BTreeMap<String, Metric>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsCell {
    pub data: Loadable<RunMetrics>,
    /// Bumped on every successful recomputation.
    pub revision: u64,
    /// Scenarios left out of the last computation because their step data
    /// could not be loaded.
    pub missing_scenarios: Vec<ScenarioId>,
}

type Gate = Arc<tokio::sync::Mutex<()>>;

#[derive(Clone)]
pub struct MetricsCache {
    store: Arc<Store>,
    steps: StepCache,
    options: MetricsOptions,
    max_concurrent: usize,
    gates: Arc<Mutex<HashMap<RunId, Gate>>>,
}

impl MetricsCache {
    pub fn new(
        store: Arc<Store>,
        steps: StepCache,
        options: MetricsOptions,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            steps,
            options,
            max_concurrent: max_concurrent.max(1),
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, run_id: &RunId) -> Arc<MetricsCell> {
        self.store.run_metrics.get(run_id)
    }

    /// One run-level metric. `Ready(None)` means no scenario reported it.
    pub fn get_metric(&self, run_id: &RunId, key: &str) -> Loadable<Option<Metric>> {
        self.get(run_id).data.map(|m| m.get(key).cloned())
    }

    pub fn scenario_metric(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        key: &str,
    ) -> Option<serde_json::Value> {
        let cell = self
            .store
            .scenario_metrics
            .get(&MetricCellKey::new(run_id, scenario_id, key));
        Option::clone(&cell)
    }

    /// Computes metrics on first use; otherwise returns the cached cell.
    pub async fn ensure(&self, run_id: &RunId) -> EngineResult<Arc<MetricsCell>> {
        let cell = self.get(run_id);
        if !matches!(cell.data, Loadable::Idle) {
            return Ok(cell);
        }
        self.refresh(run_id).await
    }

    pub async fn refresh(&self, run_id: &RunId) -> EngineResult<Arc<MetricsCell>> {
        let run = self.store.runs.get(run_id);
        if !run.is_ready() {
            return Err(EngineError::RunNotReady {
                run_id: run_id.clone(),
            });
        }

        let gate = Arc::clone(self.gates.lock().entry(run_id.clone()).or_default());
        let _guard = gate.lock().await;
        let epoch = self.store.epoch(run_id);

        self.store.run_metrics.update_if(
            run_id,
            || self.store.is_current(run_id, epoch),
            |cur| {
                if cur.data.has_data() {
                    return (None, ());
                }
                let next = MetricsCell {
                    data: Loadable::Loading,
                    ..cur.clone()
                };
                (Some(Arc::new(next)), ())
            },
        );

        let sem = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set = JoinSet::new();
        for scenario in &run.scenarios {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::fetch(run_id, None, e.to_string()))?;
            let steps = self.steps.clone();
            let run_id = run_id.clone();
            let scenario = scenario.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let data = steps.get_step_data(&run_id, &scenario.id).await;
                (scenario, data)
            });
        }

        let mut loaded = Vec::with_capacity(run.scenarios.len());
        let mut missing = Vec::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((scenario, Loadable::Ready(data))) => {
                    loaded.push((scenario.scenario_index, data.scenario_output(scenario.id.as_str())))
                }
                Ok((scenario, _)) => missing.push(scenario),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "scenario fetch task failed"),
            }
        }
        loaded.sort_by_key(|(index, _)| *index);
        missing.sort_by_key(|s| s.scenario_index);
        let missing: Vec<ScenarioId> = missing.into_iter().map(|s| s.id).collect();
        let outputs: Vec<ScenarioOutput> = loaded.into_iter().map(|(_, o)| o).collect();

        if outputs.is_empty() && !missing.is_empty() {
            let message = format!("step data unavailable for {} scenarios", missing.len());
            self.store.run_metrics.update_if(
                run_id,
                || self.store.is_current(run_id, epoch),
                |cur| {
                    let next = if cur.data.has_data() {
                        MetricsCell {
                            missing_scenarios: missing.clone(),
                            ..cur.clone()
                        }
                    } else {
                        MetricsCell {
                            data: Loadable::Failed(message.clone()),
                            revision: cur.revision,
                            missing_scenarios: missing.clone(),
                        }
                    };
                    (Some(Arc::new(next)), ())
                },
            );
            return Err(EngineError::fetch(run_id, None, message));
        }

        let metrics = compute_run_metrics_with(&outputs, &run.metric_schema(), &self.options);
        let count = metrics.len();
        let cell = self.store.run_metrics.update_if(
            run_id,
            || self.store.is_current(run_id, epoch),
            |cur| {
                let next = Arc::new(MetricsCell {
                    data: Loadable::Ready(metrics),
                    revision: cur.revision + 1,
                    missing_scenarios: missing,
                });
                (Some(Arc::clone(&next)), next)
            },
        );
        let Some(cell) = cell else {
            tracing::debug!(run_id = %run_id, epoch, "dropped metrics refresh for retired run scope");
            return Ok(self.get(run_id));
        };

        self.write_scenario_cells(run_id, epoch, &outputs);
        tracing::debug!(
            run_id = %run_id,
            revision = cell.revision,
            metrics = count,
            missing = cell.missing_scenarios.len(),
            "run metrics refreshed"
        );
        Ok(cell)
    }

    fn write_scenario_cells(&self, run_id: &RunId, epoch: u64, outputs: &[ScenarioOutput]) {
        let cells = &self.store.scenario_metrics;
        let mut seen = HashSet::new();
        for output in outputs {
            let scenario_id = ScenarioId::new(output.scenario_id.as_str());
            for (key, value) in &output.values {
                let cell_key = MetricCellKey::new(run_id, &scenario_id, key.as_str());
                cells.update_if(
                    &cell_key,
                    || self.store.is_current(run_id, epoch),
                    |cur| {
                        if cur.as_ref() == Some(value) {
                            return (None, ());
                        }
                        (Some(Arc::new(Some(value.clone()))), ())
                    },
                );
                seen.insert(cell_key);
            }
        }

        // values a scenario no longer reports
        let reported: HashSet<ScenarioId> = outputs
            .iter()
            .map(|o| ScenarioId::new(o.scenario_id.as_str()))
            .collect();
        for key in cells.keys_in_run(run_id) {
            if !reported.contains(&key.scenario_id) || seen.contains(&key) {
                continue;
            }
            cells.update_if(
                &key,
                || self.store.is_current(run_id, epoch),
                |cur| {
                    if cur.is_none() {
                        return (None, ());
                    }
                    (Some(Arc::new(None)), ())
                },
            );
        }
    }

    pub(crate) fn forget_run(&self, run_id: &RunId) {
        self.gates.lock().remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Annotation, Step, StepStatus};
    use crate::runs::RunRecords;
    use crate::transport::{FixtureRun, FixtureScenario, InMemoryTransport, Operation};
    use serde_json::json;
    use std::time::Duration;

    fn annotated(success: Option<bool>) -> crate::model::ScenarioStepData {
        let mut data = crate::model::ScenarioStepData {
            invocation_steps: vec![Step::new("default", StepStatus::Success)],
            ..Default::default()
        };
        if let Some(success) = success {
            data.annotation_steps.push(Step {
                annotation: Some(Annotation {
                    outputs: [("success".to_string(), json!(success))].into(),
                    note: None,
                }),
                ..Step::new("default.exact_match", StepStatus::Success)
            });
        }
        data
    }

    async fn setup() -> (Arc<Store>, Arc<InMemoryTransport>, MetricsCache) {
        let transport = Arc::new(InMemoryTransport::new());
        transport.insert_run(FixtureRun {
            run: serde_json::from_value(json!({
                "id": "r1",
                "name": "r1",
                "evaluators": [{"slug": "exact_match", "metrics": [{"name": "success", "kind": "boolean"}]}]
            }))
            .unwrap(),
            scenarios: vec![
                FixtureScenario { id: ScenarioId::new("s1"), testcase_id: None, steps: annotated(Some(true)) },
                FixtureScenario { id: ScenarioId::new("s2"), testcase_id: None, steps: annotated(Some(false)) },
                FixtureScenario { id: ScenarioId::new("s3"), testcase_id: None, steps: annotated(None) },
            ],
        });
        let store = Store::shared();
        RunRecords::new(Arc::clone(&store), transport.clone())
            .initialize_run(&RunId::new("r1"))
            .await;
        let steps = StepCache::new(Arc::clone(&store), transport.clone(), Duration::from_secs(60));
        let cache = MetricsCache::new(Arc::clone(&store), steps, MetricsOptions::default(), 2);
        (store, transport, cache)
    }

    #[tokio::test]
    async fn refresh_aggregates_boolean_frequency() {
        let (_store, _transport, cache) = setup().await;
        let run = RunId::new("r1");
        let cell = cache.refresh(&run).await.unwrap();
        assert_eq!(cell.revision, 1);

        let metric = cache.get_metric(&run, "exact_match.success");
        let metric = metric.data().unwrap().as_ref().unwrap();
        assert_eq!(metric.count, 2);
        assert_eq!(evalboard_metrics::true_percentage(metric), 50.0);
    }

    #[tokio::test]
    async fn scenario_cells_follow_outputs() {
        let (_store, transport, cache) = setup().await;
        let run = RunId::new("r1");
        cache.refresh(&run).await.unwrap();
        let (s1, s3) = (ScenarioId::new("s1"), ScenarioId::new("s3"));
        assert_eq!(cache.scenario_metric(&run, &s1, "exact_match.success"), Some(json!(true)));
        assert_eq!(cache.scenario_metric(&run, &s3, "exact_match.success"), None);

        transport.put_steps(&run, &s1, annotated(None)).unwrap();
        cache.steps.invalidate(&run, &s1);
        cache.refresh(&run).await.unwrap();
        assert_eq!(cache.scenario_metric(&run, &s1, "exact_match.success"), None);
    }

    #[tokio::test]
    async fn ensure_computes_once() {
        let (_store, transport, cache) = setup().await;
        let run = RunId::new("r1");
        cache.ensure(&run).await.unwrap();
        cache.ensure(&run).await.unwrap();
        assert_eq!(cache.get(&run).revision, 1);
        assert_eq!(transport.call_count(Operation::FetchSteps), 3);
    }

    #[tokio::test]
    async fn unloaded_scenarios_are_reported_missing() {
        let (_store, transport, cache) = setup().await;
        let run = RunId::new("r1");
        transport.fail(Operation::FetchSteps);
        let err = cache.refresh(&run).await.unwrap_err();
        assert!(matches!(err, EngineError::Fetch { .. }));
        let cell = cache.get(&run);
        assert!(cell.data.error().is_some());
        assert_eq!(cell.missing_scenarios.len(), 3);
    }

    #[tokio::test]
    async fn refresh_requires_loaded_run() {
        let store = Store::shared();
        let transport = Arc::new(InMemoryTransport::new());
        let steps = StepCache::new(Arc::clone(&store), transport, Duration::from_secs(1));
        let cache = MetricsCache::new(store, steps, MetricsOptions::default(), 1);
        assert!(cache.refresh(&RunId::new("nope")).await.is_err());
    }
}

//! Run state records.
//!
//! `initialize_run` claims the metadata fetch for the current run epoch, so
//! concurrent callers trigger exactly one fetch chain
//! (metadata -> scenarios -> evaluators). A failed run stays failed until
//! someone calls [`RunRecords::retry_run`].

use crate::errors::{EngineError, EngineResult};
use crate::lifecycle::RunFlags;
use crate::model::{RunId, RunLoad, RunState};
use crate::store::Store;
use crate::transport::EvalTransport;
use std::sync::Arc;

#[derive(Clone)]
pub struct RunRecords {
    store: Arc<Store>,
    transport: Arc<dyn EvalTransport>,
}

impl RunRecords {
    pub fn new(store: Arc<Store>, transport: Arc<dyn EvalTransport>) -> Self {
        Self { store, transport }
    }

    pub fn get(&self, run_id: &RunId) -> Arc<RunState> {
        self.store.runs.get(run_id)
    }

    /// Returns `true` if this call started the fetch.
    pub async fn initialize_run(&self, run_id: &RunId) -> bool {
        match self.claim(run_id, false) {
            Some(epoch) => {
                self.load(run_id, epoch).await;
                true
            }
            None => false,
        }
    }

    /// Like `initialize_run` but also restarts a failed run.
    pub async fn retry_run(&self, run_id: &RunId) -> bool {
        match self.claim(run_id, true) {
            Some(epoch) => {
                self.load(run_id, epoch).await;
                true
            }
            None => false,
        }
    }

    fn claim(&self, run_id: &RunId, retry_failed: bool) -> Option<u64> {
        let epoch = self.store.epoch(run_id);
        self.store.runs.update(run_id, |cur| {
            let claimable = match &cur.load {
                RunLoad::Idle => true,
                RunLoad::Failed { .. } => retry_failed,
                // loader of a retired epoch never writes back
                RunLoad::Loading { epoch: started } => *started != epoch,
                RunLoad::Ready => false,
            };
            if !claimable {
                return (None, None);
            }
            let next = RunState {
                load: RunLoad::Loading { epoch },
                ..cur.clone()
            };
            (Some(Arc::new(next)), Some(epoch))
        })
    }

    async fn load(&self, run_id: &RunId, epoch: u64) {
        tracing::info!(run_id = %run_id, transport = self.transport.transport_name(), "loading run");

        let run = match self.transport.fetch_run(run_id).await {
            Ok(run) => run,
            Err(e) => return self.fail(run_id, epoch, format!("run metadata: {}", e)),
        };
        let scenarios = match self.transport.fetch_scenarios(run_id).await {
            Ok(scenarios) => scenarios,
            Err(e) => return self.fail(run_id, epoch, format!("scenario list: {}", e)),
        };

        let written = self.store.runs.update_if(
            run_id,
            || self.store.is_current(run_id, epoch),
            |cur| {
                let next = RunState {
                    scenarios: cur.merge_scenarios(&scenarios),
                    evaluators: run.evaluators.clone(),
                    enriched_run: Some(run),
                    load: RunLoad::Ready,
                    ..cur.clone()
                };
                (Some(Arc::new(next)), ())
            },
        );
        if written.is_none() {
            tracing::debug!(run_id = %run_id, epoch, "dropped run load for retired run scope");
        }
    }

    fn fail(&self, run_id: &RunId, epoch: u64, message: String) {
        tracing::warn!(run_id = %run_id, error = %message, "run fetch failed");
        self.store.runs.update_if(
            run_id,
            || self.store.is_current(run_id, epoch),
            |cur| {
                let next = RunState {
                    enriched_run: None,
                    scenarios: Vec::new(),
                    evaluators: Vec::new(),
                    load: RunLoad::Failed { message },
                    ..cur.clone()
                };
                (Some(Arc::new(next)), ())
            },
        );
    }

    /// Refetches the scenario list of a loaded run. Known scenarios keep
    /// their index. Returns the number of newly indexed scenarios.
    pub async fn refresh_scenarios(&self, run_id: &RunId) -> EngineResult<usize> {
        if !self.get(run_id).is_ready() {
            return Err(EngineError::RunNotReady {
                run_id: run_id.clone(),
            });
        }
        let epoch = self.store.epoch(run_id);
        let fetched = self
            .transport
            .fetch_scenarios(run_id)
            .await
            .map_err(|e| EngineError::fetch(run_id, None, e.to_string()))?;

        let added = self
            .store
            .runs
            .update_if(
                run_id,
                || self.store.is_current(run_id, epoch),
                |cur| {
                    let merged = cur.merge_scenarios(&fetched);
                    let added = merged.len() - cur.scenarios.len();
                    if added == 0 {
                        return (None, 0);
                    }
                    let next = RunState {
                        scenarios: merged,
                        ..cur.clone()
                    };
                    (Some(Arc::new(next)), added)
                },
            )
            .unwrap_or(0);
        Ok(added)
    }

    /// Writes lifecycle flags. Unchanged flags leave the cell untouched.
    pub(crate) fn set_flags(&self, run_id: &RunId, flags: RunFlags) {
        self.update_flags(run_id, |_| flags);
    }

    /// Drops comparison membership from a run leaving the compare set.
    pub(crate) fn clear_comparison(&self, run_id: &RunId) {
        self.update_flags(run_id, RunFlags::without_comparison);
    }

    fn update_flags(&self, run_id: &RunId, f: impl FnOnce(RunFlags) -> RunFlags) {
        self.store.runs.update(run_id, |cur| {
            let flags = f(RunFlags::of(cur));
            if RunFlags::of(cur) == flags {
                return (None, ());
            }
            let next = RunState {
                is_base: flags.is_base,
                is_comparison: flags.is_comparison,
                compare_index: flags.compare_index,
                color_index: flags.color_index,
                ..cur.clone()
            };
            (Some(Arc::new(next)), ())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScenarioId;
    use crate::transport::{FixtureRun, FixtureScenario, InMemoryTransport, Operation};
    use std::time::Duration;

    fn scenario(id: &str) -> FixtureScenario {
        FixtureScenario {
            id: ScenarioId::new(id),
            testcase_id: None,
            steps: Default::default(),
        }
    }

    fn setup(ids: &[&str]) -> (Arc<Store>, Arc<InMemoryTransport>, RunRecords) {
        let transport = Arc::new(InMemoryTransport::new());
        transport.insert_run(FixtureRun {
            run: serde_json::from_value(serde_json::json!({
                "id": "r1",
                "name": "baseline",
                "evaluators": [{"slug": "exact_match", "metrics": [{"name": "success", "kind": "boolean"}]}]
            }))
            .unwrap(),
            scenarios: ids.iter().map(|id| scenario(id)).collect(),
        });
        let store = Store::shared();
        let records = RunRecords::new(Arc::clone(&store), transport.clone());
        (store, transport, records)
    }

    #[tokio::test]
    async fn concurrent_initialize_fetches_once() {
        let (_store, transport, records) = setup(&["a", "b"]);
        transport.set_latency(Some(Duration::from_millis(10)));
        let run = RunId::new("r1");
        let (first, second) = tokio::join!(records.initialize_run(&run), records.initialize_run(&run));
        assert!(first ^ second);
        assert_eq!(transport.call_count(Operation::FetchRun), 1);

        let state = records.get(&run);
        assert!(state.is_ready());
        assert_eq!(state.name(), Some("baseline"));
        assert_eq!(state.scenarios.len(), 2);
        assert_eq!(state.evaluators[0].slug, "exact_match");
    }

    #[tokio::test]
    async fn failure_is_visible_and_not_retried() {
        let (_store, transport, records) = setup(&["a"]);
        transport.fail(Operation::FetchRun);
        let run = RunId::new("r1");
        assert!(records.initialize_run(&run).await);

        let state = records.get(&run);
        assert!(state.error().is_some());
        assert!(state.name().is_none());
        assert!(state.scenarios.is_empty());

        assert!(!records.initialize_run(&run).await);
        assert_eq!(transport.call_count(Operation::FetchRun), 1);

        transport.recover(Operation::FetchRun);
        assert!(records.retry_run(&run).await);
        assert!(records.get(&run).is_ready());
    }

    #[tokio::test]
    async fn refresh_appends_new_scenarios() {
        let (_store, transport, records) = setup(&["a", "b"]);
        let run = RunId::new("r1");
        records.initialize_run(&run).await;

        // server now lists a new scenario first and has dropped "a"
        transport.insert_run(FixtureRun {
            run: transport.fetch_run(&run).await.unwrap(),
            scenarios: vec![scenario("c"), scenario("b")],
        });

        assert_eq!(records.refresh_scenarios(&run).await.unwrap(), 1);
        let idx: Vec<(String, u32)> = records
            .get(&run)
            .scenarios
            .iter()
            .map(|s| (s.id.to_string(), s.scenario_index))
            .collect();
        assert_eq!(
            idx,
            vec![("a".into(), 0), ("b".into(), 1), ("c".into(), 2)]
        );
    }

    #[tokio::test]
    async fn refresh_requires_loaded_run() {
        let (_store, _transport, records) = setup(&[]);
        let err = records.refresh_scenarios(&RunId::new("r1")).await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotReady { .. }));
    }
}

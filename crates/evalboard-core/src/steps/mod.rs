//! Scenario step cache.
//!
//! One [`StepCell`] per `(run, scenario)`. Step data is fetched on first
//! read and served from the cell while it is fresh. Concurrent readers of
//! the same key share one fetch through a per-key gate. Completions are
//! written only while the run epoch they started under is still current.

pub mod optimistic;

pub use optimistic::{apply_patches, StepPatch};

use crate::errors::{EngineError, EngineResult};
use crate::model::{Loadable, RunId, ScenarioId, ScenarioStepData};
use crate::store::{ScenarioKey, Store};
use crate::transport::EvalTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepCell {
    pub data: Loadable<ScenarioStepData>,
    pub fetched_at: Option<Instant>,
    /// A refetch is in flight while data is already shown.
    pub revalidating: bool,
    /// Last refetch failure while cached data was kept.
    pub revalidation_error: Option<String>,
}

impl StepCell {
    pub fn ready(data: ScenarioStepData) -> Self {
        Self {
            data: Loadable::Ready(data),
            fetched_at: Some(Instant::now()),
            revalidating: false,
            revalidation_error: None,
        }
    }
}

type Gate = Arc<tokio::sync::Mutex<()>>;

#[derive(Clone)]
pub struct StepCache {
    store: Arc<Store>,
    transport: Arc<dyn EvalTransport>,
    stale_after: Duration,
    gates: Arc<Mutex<HashMap<ScenarioKey, Gate>>>,
}

impl StepCache {
    pub fn new(store: Arc<Store>, transport: Arc<dyn EvalTransport>, stale_after: Duration) -> Self {
        Self {
            store,
            transport,
            stale_after,
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current cell. Never fetches.
    pub fn read(&self, run_id: &RunId, scenario_id: &ScenarioId) -> Arc<StepCell> {
        self.store.steps.get(&ScenarioKey::new(run_id, scenario_id))
    }

    fn is_fresh(&self, cell: &StepCell) -> bool {
        cell.data.has_data()
            && cell
                .fetched_at
                .map(|t| t.elapsed() < self.stale_after)
                .unwrap_or(false)
    }

    fn gate(&self, key: &ScenarioKey) -> Gate {
        Arc::clone(self.gates.lock().entry(key.clone()).or_default())
    }

    /// Fetches on first access and whenever the cached copy is stale.
    pub async fn get_step_data(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> Loadable<ScenarioStepData> {
        let key = ScenarioKey::new(run_id, scenario_id);
        let cell = self.store.steps.get(&key);
        if self.is_fresh(&cell) {
            return cell.data.clone();
        }

        let gate = self.gate(&key);
        let _guard = gate.lock().await;
        let cell = self.store.steps.get(&key);
        if self.is_fresh(&cell) {
            return cell.data.clone();
        }

        // fetch errors land in the cell
        let _ = self.fetch(&key).await;
        self.store.steps.get(&key).data.clone()
    }

    /// Forced refetch. Replaces step data wholesale, dropping any optimistic
    /// field the server does not restate.
    pub async fn revalidate(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> EngineResult<ScenarioStepData> {
        let key = ScenarioKey::new(run_id, scenario_id);
        let gate = self.gate(&key);
        let _guard = gate.lock().await;
        self.fetch(&key)
            .await
            .map_err(|message| EngineError::fetch(run_id, Some(scenario_id), message))
    }

    async fn fetch(&self, key: &ScenarioKey) -> Result<ScenarioStepData, String> {
        let run_id = &key.run_id;
        let epoch = self.store.epoch(run_id);

        self.store.steps.update_if(
            key,
            || self.store.is_current(run_id, epoch),
            |cur| {
                let next = if cur.data.has_data() {
                    StepCell {
                        revalidating: true,
                        ..cur.clone()
                    }
                } else {
                    StepCell {
                        data: Loadable::Loading,
                        ..cur.clone()
                    }
                };
                (Some(Arc::new(next)), ())
            },
        );

        let result = self
            .transport
            .fetch_scenario_steps(run_id, &key.scenario_id)
            .await;

        let written = match &result {
            Ok(data) => self.store.steps.update_if(
                key,
                || self.store.is_current(run_id, epoch),
                |_| (Some(Arc::new(StepCell::ready(data.clone()))), ()),
            ),
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    scenario_id = %key.scenario_id,
                    error = %e,
                    "scenario step fetch failed"
                );
                let message = e.to_string();
                self.store.steps.update_if(
                    key,
                    || self.store.is_current(run_id, epoch),
                    |cur| {
                        let next = if cur.data.has_data() {
                            StepCell {
                                revalidating: false,
                                revalidation_error: Some(message),
                                ..cur.clone()
                            }
                        } else {
                            StepCell {
                                data: Loadable::Failed(message),
                                fetched_at: None,
                                revalidating: false,
                                revalidation_error: None,
                            }
                        };
                        (Some(Arc::new(next)), ())
                    },
                )
            }
        };

        if written.is_none() {
            tracing::debug!(
                run_id = %run_id,
                scenario_id = %key.scenario_id,
                epoch,
                "dropped step completion for retired run scope"
            );
        }
        result.map_err(|e| e.to_string())
    }

    /// Applies optimistic patches ahead of any network call. Only cells
    /// holding data are patched; returns how many patches found their step.
    pub fn apply_optimistic(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        patches: &[StepPatch],
    ) -> usize {
        let key = ScenarioKey::new(run_id, scenario_id);
        let matched = self.store.steps.update(&key, |cur| {
            let Loadable::Ready(data) = &cur.data else {
                return (None, 0);
            };
            let (next, matched) = apply_patches(data, patches);
            if matched == 0 {
                return (None, 0);
            }
            let cell = StepCell {
                data: Loadable::Ready(next),
                ..cur.clone()
            };
            (Some(Arc::new(cell)), matched)
        });

        if matched < patches.len() {
            tracing::debug!(
                run_id = %run_id,
                scenario_id = %scenario_id,
                matched,
                requested = patches.len(),
                "optimistic patch matched no step"
            );
        }
        matched
    }

    /// Marks the cell stale so the next read refetches.
    pub fn invalidate(&self, run_id: &RunId, scenario_id: &ScenarioId) {
        let key = ScenarioKey::new(run_id, scenario_id);
        self.store.steps.update(&key, |cur| {
            if cur.fetched_at.is_none() {
                return (None, ());
            }
            let next = StepCell {
                fetched_at: None,
                ..cur.clone()
            };
            (Some(Arc::new(next)), ())
        });
    }

    pub(crate) fn forget_run(&self, run_id: &RunId) {
        self.gates.lock().retain(|k, _| &k.run_id != run_id);
    }
}

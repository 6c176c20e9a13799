//! Key-partitioned store.
//!
//! The store is the only shared mutable state in the engine. It holds one
//! [`KeyedFamily`] per kind of cell, all partitioned by run id, plus a per-run
//! epoch. The epoch is bumped whenever a run scope is retired; async work
//! captures the epoch it started under and writes only while it is current.
//!
//! ```text
//! runs              RunId                         -> RunState
//! steps             (RunId, ScenarioId)           -> StepCell
//! sync              (RunId, ScenarioId)           -> ScenarioSync
//! run_metrics       RunId                         -> MetricsCell
//! scenario_metrics  (RunId, ScenarioId, metric)   -> Option<Value>
//! ```

mod family;
mod keys;
mod subscription;

pub use family::{KeyedFamily, Listener};
pub use keys::{CellKey, MetricCellKey, ScenarioKey};
pub use subscription::Subscription;

use crate::metrics_cache::MetricsCell;
use crate::model::{RunId, RunState};
use crate::revalidation::ScenarioSync;
use crate::steps::StepCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Store {
    pub runs: Arc<KeyedFamily<RunId, RunState>>,
    pub steps: Arc<KeyedFamily<ScenarioKey, StepCell>>,
    pub sync: Arc<KeyedFamily<ScenarioKey, ScenarioSync>>,
    pub run_metrics: Arc<KeyedFamily<RunId, MetricsCell>>,
    pub scenario_metrics: Arc<KeyedFamily<MetricCellKey, Option<serde_json::Value>>>,
    epochs: Mutex<HashMap<RunId, u64>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(KeyedFamily::new("runs")),
            steps: Arc::new(KeyedFamily::new("steps")),
            sync: Arc::new(KeyedFamily::new("sync")),
            run_metrics: Arc::new(KeyedFamily::new("run_metrics")),
            scenario_metrics: Arc::new(KeyedFamily::new("scenario_metrics")),
            epochs: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn epoch(&self, run_id: &RunId) -> u64 {
        self.epochs.lock().get(run_id).copied().unwrap_or(0)
    }

    pub fn is_current(&self, run_id: &RunId, epoch: u64) -> bool {
        self.epoch(run_id) == epoch
    }

    /// Invalidates every in-flight completion for the run. Cells are kept.
    pub fn retire(&self, run_id: &RunId) -> u64 {
        let mut epochs = self.epochs.lock();
        let epoch = epochs.entry(run_id.clone()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    /// Retires the run and drops all of its cells.
    pub fn dispose_run(&self, run_id: &RunId) -> usize {
        self.retire(run_id);
        let dropped = self.runs.remove_run(run_id)
            + self.steps.remove_run(run_id)
            + self.sync.remove_run(run_id)
            + self.run_metrics.remove_run(run_id)
            + self.scenario_metrics.remove_run(run_id);
        tracing::debug!(run_id = %run_id, dropped, "disposed run scope");
        dropped
    }

    /// Whether any UI listener still references a cell of this run.
    pub fn is_referenced(&self, run_id: &RunId) -> bool {
        self.runs.has_subscribers_in_run(run_id)
            || self.steps.has_subscribers_in_run(run_id)
            || self.sync.has_subscribers_in_run(run_id)
            || self.run_metrics.has_subscribers_in_run(run_id)
            || self.scenario_metrics.has_subscribers_in_run(run_id)
    }

    pub fn cell_count(&self, run_id: &RunId) -> usize {
        self.runs.keys_in_run(run_id).len()
            + self.steps.keys_in_run(run_id).len()
            + self.sync.keys_in_run(run_id).len()
            + self.run_metrics.keys_in_run(run_id).len()
            + self.scenario_metrics.keys_in_run(run_id).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunLoad, ScenarioId};

    #[test]
    fn retire_bumps_epoch_per_run() {
        let store = Store::new();
        let a = RunId::new("a");
        let b = RunId::new("b");
        assert_eq!(store.epoch(&a), 0);
        store.retire(&a);
        assert_eq!(store.epoch(&a), 1);
        assert!(store.is_current(&b, 0));
    }

    #[test]
    fn dispose_drops_all_families_of_one_run() {
        let store = Store::new();
        let a = RunId::new("a");
        let b = RunId::new("b");
        let s = ScenarioId::new("s");
        for run in [&a, &b] {
            store.runs.set(run, |r| RunState {
                load: RunLoad::Ready,
                ..r.clone()
            });
            store.steps.set(&ScenarioKey::new(run, &s), |c| c.clone());
            store
                .scenario_metrics
                .set(&MetricCellKey::new(run, &s, "duration"), |_| {
                    Some(serde_json::json!(1))
                });
        }

        assert_eq!(store.dispose_run(&a), 3);
        assert_eq!(store.cell_count(&a), 0);
        assert_eq!(store.cell_count(&b), 3);
        assert!(store.runs.get(&b).is_ready());
    }
}

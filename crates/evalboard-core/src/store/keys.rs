use crate::model::{RunId, ScenarioId};
use std::fmt;
use std::hash::Hash;

/// Key of a store cell. Every key belongs to exactly one run scope so a
/// whole run can be retired or dropped at once.
pub trait CellKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn run_id(&self) -> &RunId;
}

impl CellKey for RunId {
    fn run_id(&self) -> &RunId {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScenarioKey {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
}

impl ScenarioKey {
    pub fn new(run_id: &RunId, scenario_id: &ScenarioId) -> Self {
        Self {
            run_id: run_id.clone(),
            scenario_id: scenario_id.clone(),
        }
    }
}

impl CellKey for ScenarioKey {
    fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl fmt::Display for ScenarioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.scenario_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricCellKey {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub metric_key: String,
}

impl MetricCellKey {
    pub fn new(run_id: &RunId, scenario_id: &ScenarioId, metric_key: impl Into<String>) -> Self {
        Self {
            run_id: run_id.clone(),
            scenario_id: scenario_id.clone(),
            metric_key: metric_key.into(),
        }
    }
}

impl CellKey for MetricCellKey {
    fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

use super::ids::{RunId, ScenarioId};
use super::loadable::Loadable;
use chrono::{DateTime, Utc};
use evalboard_metrics::{metric_key, MetricKind, MetricSchema};
use serde::{Deserialize, Serialize};

/// One output declared by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDef {
    pub name: String,
    #[serde(default)]
    pub kind: MetricKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    /// Allowed values for `enum` and `multi_select` metrics. Empty means any.
    #[serde(default)]
    pub options: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorDef {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metrics: Vec<MetricDef>,
}

impl EvaluatorDef {
    pub fn metric(&self, name: &str) -> Option<&MetricDef> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Denormalized run metadata as returned by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRun {
    pub id: RunId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub testsets: Vec<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorDef>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Scenario as listed by the transport, before an index is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    #[serde(default)]
    pub testcase_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioRef {
    pub id: ScenarioId,
    pub scenario_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunLoad {
    #[default]
    Idle,
    /// Fetch claimed by the scope epoch it started in.
    Loading { epoch: u64 },
    Ready,
    Failed { message: String },
}

/// Per-run aggregate. Flags are written by the lifecycle manager only.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunState {
    pub enriched_run: Option<EnrichedRun>,
    pub scenarios: Vec<ScenarioRef>,
    pub evaluators: Vec<EvaluatorDef>,
    pub is_base: bool,
    pub is_comparison: bool,
    pub compare_index: Option<u32>,
    pub color_index: Option<usize>,
    pub load: RunLoad,
}

impl RunState {
    pub fn is_ready(&self) -> bool {
        matches!(self.load, RunLoad::Ready)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.load {
            RunLoad::Failed { message } => Some(message),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.enriched_run.as_ref().map(|r| r.name.as_str())
    }

    /// Tri-state view of the metadata fetch.
    pub fn status(&self) -> Loadable<()> {
        match &self.load {
            RunLoad::Idle => Loadable::Idle,
            RunLoad::Loading { .. } => Loadable::Loading,
            RunLoad::Ready => Loadable::Ready(()),
            RunLoad::Failed { message } => Loadable::Failed(message.clone()),
        }
    }

    pub fn scenario_ids(&self) -> Vec<ScenarioId> {
        self.scenarios.iter().map(|s| s.id.clone()).collect()
    }

    pub fn has_scenario(&self, id: &ScenarioId) -> bool {
        self.scenarios.iter().any(|s| &s.id == id)
    }

    pub fn evaluator(&self, slug: &str) -> Option<&EvaluatorDef> {
        self.evaluators.iter().find(|e| e.slug == slug)
    }

    /// Declared kind per `"<slug>.<metric>"` key.
    pub fn metric_schema(&self) -> MetricSchema {
        self.evaluators
            .iter()
            .flat_map(|e| {
                e.metrics
                    .iter()
                    .map(move |m| (metric_key(&e.slug, &m.name), m.kind))
            })
            .collect()
    }

    /// Merges a freshly fetched list into the current one. Known scenarios
    /// keep their index; new ones are appended after the current maximum.
    pub fn merge_scenarios(&self, fetched: &[Scenario]) -> Vec<ScenarioRef> {
        let mut next = self
            .scenarios
            .iter()
            .map(|s| s.scenario_index + 1)
            .max()
            .unwrap_or(0);

        let mut merged = self.scenarios.clone();
        for s in fetched {
            if merged.iter().any(|m| m.id == s.id) {
                continue;
            }
            merged.push(ScenarioRef {
                id: s.id.clone(),
                scenario_index: next,
            });
            next += 1;
        }
        merged.sort_by_key(|s| s.scenario_index);
        merged
    }
}

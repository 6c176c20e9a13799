//! Collaborator contract to the backend.
//!
//! The engine treats every call as a black box that either succeeds or
//! fails. HTTP, auth and retries live behind implementations of
//! [`EvalTransport`].

pub mod memory;

pub use memory::{Fixture, FixtureRun, FixtureScenario, InMemoryTransport, Operation};

use crate::model::{
    EnrichedRun, InvocationUsage, RunId, Scenario, ScenarioId, ScenarioStepData, Step, StepKind,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A step as written back to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub kind: StepKind,
    pub step: Step,
}

/// Per-scenario metric values pushed after a confirmed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub scenario_id: ScenarioId,
    pub data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub step_key: String,
    #[serde(default)]
    pub testcase_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvocationOutcome {
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub usage: Option<InvocationUsage>,
}

#[async_trait]
pub trait EvalTransport: Send + Sync {
    async fn fetch_run(&self, run_id: &RunId) -> anyhow::Result<EnrichedRun>;

    async fn fetch_scenarios(&self, run_id: &RunId) -> anyhow::Result<Vec<Scenario>>;

    async fn fetch_scenario_steps(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> anyhow::Result<ScenarioStepData>;

    /// Overwrites existing steps.
    async fn patch_steps(&self, results: &[StepResult]) -> anyhow::Result<()>;

    /// Creates steps that do not exist yet. Only the backend creates steps.
    async fn create_steps(&self, results: &[StepResult]) -> anyhow::Result<()>;

    async fn create_metrics(&self, run_id: &RunId, entries: &[MetricEntry]) -> anyhow::Result<()>;

    /// Re-runs the invocation of one scenario.
    async fn run_invocation(&self, request: &InvocationRequest)
        -> anyhow::Result<InvocationOutcome>;

    fn transport_name(&self) -> &'static str {
        "transport"
    }
}

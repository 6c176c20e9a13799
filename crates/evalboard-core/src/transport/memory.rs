//! Fixture-backed transport.
//!
//! Holds its own copy of every run and applies patch/create calls to it, so
//! a revalidation after a mutation observes the write the way a real backend
//! would. Any operation can be switched to fail for error-path tests.

use super::{EvalTransport, InvocationOutcome, InvocationRequest, MetricEntry, StepResult};
use crate::model::{
    EnrichedRun, InvocationUsage, RunId, Scenario, ScenarioId, ScenarioStepData, Step, StepKind,
    StepStatus,
};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub runs: Vec<FixtureRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRun {
    pub run: EnrichedRun,
    #[serde(default)]
    pub scenarios: Vec<FixtureScenario>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureScenario {
    pub id: ScenarioId,
    #[serde(default)]
    pub testcase_id: Option<String>,
    #[serde(default)]
    pub steps: ScenarioStepData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchRun,
    FetchScenarios,
    FetchSteps,
    PatchSteps,
    CreateSteps,
    CreateMetrics,
    RunInvocation,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::FetchRun => "fetch_run",
            Operation::FetchScenarios => "fetch_scenarios",
            Operation::FetchSteps => "fetch_scenario_steps",
            Operation::PatchSteps => "patch_steps",
            Operation::CreateSteps => "create_steps",
            Operation::CreateMetrics => "create_metrics",
            Operation::RunInvocation => "run_invocation",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct State {
    runs: HashMap<RunId, FixtureRun>,
    metrics: Vec<(RunId, MetricEntry)>,
    failing: HashSet<Operation>,
    calls: HashMap<Operation, usize>,
    next_id: u64,
}

impl State {
    fn scenario_mut(
        &mut self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> anyhow::Result<&mut FixtureScenario> {
        self.runs
            .get_mut(run_id)
            .with_context(|| format!("run {} not found", run_id))?
            .scenarios
            .iter_mut()
            .find(|s| &s.id == scenario_id)
            .with_context(|| format!("scenario {} not found in run {}", scenario_id, run_id))
    }

    fn mint_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: Fixture) -> Self {
        let transport = Self::new();
        {
            let mut state = transport.state.lock();
            for run in fixture.runs {
                state.runs.insert(run.run.id.clone(), run);
            }
        }
        transport
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let fixture: Fixture = serde_json::from_str(raw).context("invalid fixture json")?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn insert_run(&self, run: FixtureRun) {
        self.state.lock().runs.insert(run.run.id.clone(), run);
    }

    /// Overwrites the server-side steps of one scenario.
    pub fn put_steps(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        steps: ScenarioStepData,
    ) -> anyhow::Result<()> {
        self.state.lock().scenario_mut(run_id, scenario_id)?.steps = steps;
        Ok(())
    }

    pub fn steps(&self, run_id: &RunId, scenario_id: &ScenarioId) -> Option<ScenarioStepData> {
        let state = self.state.lock();
        state
            .runs
            .get(run_id)?
            .scenarios
            .iter()
            .find(|s| &s.id == scenario_id)
            .map(|s| s.steps.clone())
    }

    pub fn fail(&self, op: Operation) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: Operation) {
        self.state.lock().failing.remove(&op);
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn metric_entries(&self, run_id: &RunId) -> Vec<MetricEntry> {
        self.state
            .lock()
            .metrics
            .iter()
            .filter(|(r, _)| r == run_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Delay applied before every call completes.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    async fn enter(&self, op: Operation) -> anyhow::Result<()> {
        let latency = *self.latency.lock();
        {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.state.lock().failing.contains(&op) {
            anyhow::bail!("{} failed (injected)", op);
        }
        Ok(())
    }
}

#[async_trait]
impl EvalTransport for InMemoryTransport {
    async fn fetch_run(&self, run_id: &RunId) -> anyhow::Result<EnrichedRun> {
        self.enter(Operation::FetchRun).await?;
        let state = self.state.lock();
        state
            .runs
            .get(run_id)
            .map(|r| r.run.clone())
            .with_context(|| format!("run {} not found", run_id))
    }

    async fn fetch_scenarios(&self, run_id: &RunId) -> anyhow::Result<Vec<Scenario>> {
        self.enter(Operation::FetchScenarios).await?;
        let state = self.state.lock();
        let run = state
            .runs
            .get(run_id)
            .with_context(|| format!("run {} not found", run_id))?;
        Ok(run
            .scenarios
            .iter()
            .map(|s| Scenario {
                id: s.id.clone(),
                testcase_id: s.testcase_id.clone(),
            })
            .collect())
    }

    async fn fetch_scenario_steps(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> anyhow::Result<ScenarioStepData> {
        self.enter(Operation::FetchSteps).await?;
        let mut state = self.state.lock();
        Ok(state.scenario_mut(run_id, scenario_id)?.steps.clone())
    }

    async fn patch_steps(&self, results: &[StepResult]) -> anyhow::Result<()> {
        self.enter(Operation::PatchSteps).await?;
        let mut state = self.state.lock();
        for result in results {
            let scenario = state.scenario_mut(&result.run_id, &result.scenario_id)?;
            let step = scenario
                .steps
                .find_mut(&result.step.step_key)
                .with_context(|| format!("step {} not found", result.step.step_key))?;
            let id = std::mem::take(&mut step.id);
            *step = result.step.clone();
            if step.id.is_empty() {
                step.id = id;
            }
        }
        Ok(())
    }

    async fn create_steps(&self, results: &[StepResult]) -> anyhow::Result<()> {
        self.enter(Operation::CreateSteps).await?;
        let mut state = self.state.lock();
        for result in results {
            let mut step = result.step.clone();
            if step.id.is_empty() {
                step.id = state.mint_id("step");
            }
            let scenario = state.scenario_mut(&result.run_id, &result.scenario_id)?;
            let group = match result.kind {
                StepKind::Invocation => &mut scenario.steps.invocation_steps,
                StepKind::Input => &mut scenario.steps.input_steps,
                StepKind::Annotation => &mut scenario.steps.annotation_steps,
            };
            match group.iter_mut().find(|s| s.step_key == step.step_key) {
                Some(existing) => *existing = step,
                None => group.push(step),
            }
        }
        Ok(())
    }

    async fn create_metrics(&self, run_id: &RunId, entries: &[MetricEntry]) -> anyhow::Result<()> {
        self.enter(Operation::CreateMetrics).await?;
        let mut state = self.state.lock();
        state
            .metrics
            .extend(entries.iter().map(|e| (run_id.clone(), e.clone())));
        Ok(())
    }

    async fn run_invocation(
        &self,
        request: &InvocationRequest,
    ) -> anyhow::Result<InvocationOutcome> {
        self.enter(Operation::RunInvocation).await?;
        let mut state = self.state.lock();
        let trace_id = state.mint_id("trace");
        let span_id = state.mint_id("span");
        let scenario = state.scenario_mut(&request.run_id, &request.scenario_id)?;

        let outcome = {
            let steps = &mut scenario.steps;
            if steps.find(&request.step_key).is_none() {
                let mut step = Step::new(&request.step_key, StepStatus::Pending);
                step.testcase_id = request.testcase_id.clone();
                steps.invocation_steps.push(step);
            }
            let step = steps
                .find_mut(&request.step_key)
                .with_context(|| format!("step {} not found", request.step_key))?;
            let usage = step.usage.clone().unwrap_or(InvocationUsage {
                duration_ms: Some(0.0),
                total_cost: Some(0.0),
                tokens: Some(0),
            });
            step.status = StepStatus::Success;
            step.trace_id = Some(trace_id.clone());
            step.span_id = Some(span_id.clone());
            step.usage = Some(usage.clone());
            step.error_message = None;
            if request.parameters.is_some() {
                step.invocation_parameters = request.parameters.clone();
            }
            InvocationOutcome {
                trace_id: Some(trace_id),
                span_id: Some(span_id),
                usage: Some(usage),
            }
        };
        Ok(outcome)
    }

    fn transport_name(&self) -> &'static str {
        "memory"
    }
}

//! Revalidation coordinator.
//!
//! Per-scenario state machine for user mutations:
//!
//! ```text
//! idle -> optimistic_pending -> confirmed -> idle
//!                            \-> error -----/
//! ```
//!
//! The error leg records `last_error` and the rejected step keys on the
//! way back to idle; both stay until the next mutation begins.
//!
//! A confirmed batch is pushed as three independent calls (patch existing
//! steps, create new steps, create metric entries). After the push the
//! scenario is refetched, and only then is the run's metrics cache refreshed,
//! once per batch. A batch whose step writes all failed marks its steps as
//! errored and skips both the refetch and the metrics refresh.

pub mod batch;
pub mod validate;

pub use batch::{BatchReport, OpOutcome};
pub use validate::{validate_annotations, EvaluatorAnnotation};

use crate::errors::{EngineError, EngineResult};
use crate::metrics_cache::MetricsCache;
use crate::model::{
    annotation_step_key, Annotation, Loadable, RunId, ScenarioId, ScenarioStepData, Step,
    StepKind, StepStatus,
};
use crate::steps::{StepCache, StepPatch};
use crate::store::{ScenarioKey, Store};
use crate::transport::{
    EvalTransport, InvocationOutcome, InvocationRequest, MetricEntry, StepResult,
};
use evalboard_metrics::metric_key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    OptimisticPending,
    Confirmed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioSync {
    pub phase: SyncPhase,
    /// Step key -> fields overridden by in-flight optimistic writes.
    pub touched: BTreeMap<String, Vec<&'static str>>,
    pub in_flight_status: Option<StepStatus>,
    pub in_flight: u32,
    pub last_error: Option<String>,
    /// Step keys whose last write the backend rejected.
    pub rejected_steps: Vec<String>,
    pub last_report: Option<BatchReport>,
    pub completed_batches: u64,
}

impl ScenarioSync {
    pub fn is_pending(&self) -> bool {
        self.in_flight > 0
    }

    /// In-flight status shown for `step_key`, if an optimistic write covers it.
    pub fn override_for(&self, step_key: &str) -> Option<StepStatus> {
        if self.touched.contains_key(step_key) {
            self.in_flight_status
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRequest {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub annotations: Vec<EvaluatorAnnotation>,
}

/// Re-run of one scenario's invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunRequest {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    /// Defaults to the scenario's invocation step.
    #[serde(default)]
    pub step_key: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct RevalidationCoordinator {
    store: Arc<Store>,
    transport: Arc<dyn EvalTransport>,
    steps: StepCache,
    metrics: MetricsCache,
    push_metrics: bool,
    default_invocation_key: String,
}

impl RevalidationCoordinator {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn EvalTransport>,
        steps: StepCache,
        metrics: MetricsCache,
        push_metrics: bool,
        default_invocation_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            steps,
            metrics,
            push_metrics,
            default_invocation_key: default_invocation_key.into(),
        }
    }

    pub fn sync_state(&self, run_id: &RunId, scenario_id: &ScenarioId) -> Arc<ScenarioSync> {
        self.store.sync.get(&ScenarioKey::new(run_id, scenario_id))
    }

    /// Validates, applies the optimistic `annotating` overlay, pushes the
    /// batch and reconciles.
    pub async fn enqueue_annotation(&self, request: &AnnotationRequest) -> EngineResult<BatchReport> {
        let (run_id, scenario_id) = (&request.run_id, &request.scenario_id);
        let run = self.store.runs.get(run_id);
        self.check_scenario(run_id, scenario_id)?;
        validate_annotations(&run, &request.annotations).map_err(EngineError::Validation)?;
        let data = self.loaded_steps(run_id, scenario_id).await?;

        let epoch = self.store.epoch(run_id);
        let invocation = data.invocation_step();
        let invocation_key = invocation
            .map(|s| s.step_key.clone())
            .unwrap_or_else(|| self.default_invocation_key.clone());
        let testcase_id = invocation.and_then(|s| s.testcase_id.clone());

        let mut optimistic = Vec::new();
        let mut confirmed = Vec::new();
        let mut patch: Vec<StepResult> = Vec::new();
        let mut create: Vec<StepResult> = Vec::new();
        let mut metric_data = BTreeMap::new();
        for item in &request.annotations {
            let step_key = annotation_step_key(&invocation_key, &item.evaluator_slug);
            let annotation = Annotation {
                outputs: item.outputs.clone(),
                note: item.note.clone(),
            };
            let done = StepPatch::status(&step_key, StepStatus::Success)
                .with_annotation(annotation.clone())
                .clearing_error();

            let (step, target) = match data.find(&step_key) {
                Some((_, existing)) => (done.apply_to(existing), &mut patch),
                None => (
                    Step {
                        testcase_id: testcase_id.clone(),
                        annotation: Some(annotation.clone()),
                        ..Step::new(&step_key, StepStatus::Success)
                    },
                    &mut create,
                ),
            };
            target.push(StepResult {
                run_id: run_id.clone(),
                scenario_id: scenario_id.clone(),
                kind: StepKind::Annotation,
                step,
            });

            for (name, value) in &item.outputs {
                metric_data.insert(metric_key(&item.evaluator_slug, name), value.clone());
            }
            optimistic.push(
                StepPatch::status(&step_key, StepStatus::Annotating)
                    .with_annotation(annotation)
                    .clearing_error(),
            );
            confirmed.push(done);
        }

        let metrics = if self.push_metrics && !metric_data.is_empty() {
            vec![MetricEntry {
                scenario_id: scenario_id.clone(),
                data: metric_data,
            }]
        } else {
            Vec::new()
        };

        let key = ScenarioKey::new(run_id, scenario_id);
        self.begin(&key, epoch, &optimistic, StepStatus::Annotating);
        self.steps.apply_optimistic(run_id, scenario_id, &optimistic);

        let report = self.push(run_id, &patch, &create, &metrics).await;
        let step_keys: Vec<String> = optimistic.iter().map(|p| p.step_key.clone()).collect();

        if report.steps_failed() {
            let message = report.step_error().unwrap_or("step write failed").to_string();
            return Err(self.fail(&key, epoch, step_keys, message, Some(report)));
        }

        let mut markers = Vec::new();
        if let Some(message) = report.patch.error() {
            markers.extend(patch.iter().map(|r| StepPatch::error(&r.step.step_key, message)));
        }
        if let Some(message) = report.create.error() {
            markers.extend(create.iter().map(|r| StepPatch::error(&r.step.step_key, message)));
        }
        let delivered: Vec<StepPatch> = confirmed
            .into_iter()
            .filter(|p| !markers.iter().any(|m| m.step_key == p.step_key))
            .collect();

        self.mark_confirmed(&key, epoch, Some(report.clone()));
        self.reconcile(run_id, scenario_id, &delivered, &markers).await;

        if report.any_failed() {
            tracing::warn!(
                run_id = %run_id,
                scenario_id = %scenario_id,
                report = %report,
                "annotation batch partially failed"
            );
            let rejected = markers.iter().map(|m| m.step_key.clone()).collect();
            self.finish(&key, epoch, Some(report.to_string()), rejected);
            return Err(EngineError::PartialBatch(report));
        }
        self.finish(&key, epoch, None, Vec::new());
        Ok(report)
    }

    /// Re-runs an invocation with the optimistic `running` overlay.
    pub async fn enqueue_invocation(&self, request: &RerunRequest) -> EngineResult<InvocationOutcome> {
        let (run_id, scenario_id) = (&request.run_id, &request.scenario_id);
        self.check_scenario(run_id, scenario_id)?;
        let data = self.loaded_steps(run_id, scenario_id).await?;

        let epoch = self.store.epoch(run_id);
        let invocation = data.invocation_step();
        let step_key = request
            .step_key
            .clone()
            .or_else(|| invocation.map(|s| s.step_key.clone()))
            .unwrap_or_else(|| self.default_invocation_key.clone());
        let testcase_id = data
            .find(&step_key)
            .and_then(|(_, s)| s.testcase_id.clone())
            .or_else(|| invocation.and_then(|s| s.testcase_id.clone()));

        let mut pending = StepPatch::status(&step_key, StepStatus::Running).clearing_error();
        if let Some(parameters) = &request.parameters {
            pending = pending.with_parameters(parameters.clone());
        }
        let key = ScenarioKey::new(run_id, scenario_id);
        let pending = [pending];
        self.begin(&key, epoch, &pending, StepStatus::Running);
        self.steps.apply_optimistic(run_id, scenario_id, &pending);

        let invocation_request = InvocationRequest {
            run_id: run_id.clone(),
            scenario_id: scenario_id.clone(),
            step_key: step_key.clone(),
            testcase_id,
            parameters: request.parameters.clone(),
        };
        let outcome = match self.transport.run_invocation(&invocation_request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Err(self.fail(&key, epoch, vec![step_key], e.to_string(), None));
            }
        };

        let mut done = StepPatch::status(&step_key, StepStatus::Success)
            .with_trace(outcome.trace_id.clone(), outcome.span_id.clone())
            .clearing_error();
        if let Some(usage) = &outcome.usage {
            done = done.with_usage(usage.clone());
        }
        self.mark_confirmed(&key, epoch, None);
        self.reconcile(run_id, scenario_id, &[done], &[]).await;
        self.finish(&key, epoch, None, Vec::new());
        Ok(outcome)
    }

    fn check_scenario(&self, run_id: &RunId, scenario_id: &ScenarioId) -> EngineResult<()> {
        let run = self.store.runs.get(run_id);
        if !run.is_ready() {
            return Err(EngineError::RunNotReady {
                run_id: run_id.clone(),
            });
        }
        if !run.has_scenario(scenario_id) {
            return Err(EngineError::UnknownScenario {
                run_id: run_id.clone(),
                scenario_id: scenario_id.clone(),
            });
        }
        Ok(())
    }

    async fn loaded_steps(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> EngineResult<ScenarioStepData> {
        match self.steps.get_step_data(run_id, scenario_id).await {
            Loadable::Ready(data) => Ok(data),
            other => Err(EngineError::fetch(
                run_id,
                Some(scenario_id),
                other.error().unwrap_or("step data unavailable"),
            )),
        }
    }

    async fn push(
        &self,
        run_id: &RunId,
        patch: &[StepResult],
        create: &[StepResult],
        metrics: &[MetricEntry],
    ) -> BatchReport {
        let transport = &self.transport;
        let patch_op = async {
            if patch.is_empty() {
                return OpOutcome::Skipped;
            }
            OpOutcome::from_result(patch.len(), transport.patch_steps(patch).await)
        };
        let create_op = async {
            if create.is_empty() {
                return OpOutcome::Skipped;
            }
            OpOutcome::from_result(create.len(), transport.create_steps(create).await)
        };
        let metrics_op = async {
            if metrics.is_empty() {
                return OpOutcome::Skipped;
            }
            OpOutcome::from_result(metrics.len(), transport.create_metrics(run_id, metrics).await)
        };

        let (patch, create, metrics) = tokio::join!(patch_op, create_op, metrics_op);
        let report = BatchReport {
            patch,
            create,
            metrics,
        };
        for op in report.failed_ops() {
            tracing::warn!(run_id = %run_id, op, "batch sub-operation failed");
        }
        report
    }

    /// Confirmed overlay, scenario refetch, error markers, then exactly one
    /// metrics refresh.
    async fn reconcile(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        confirmed: &[StepPatch],
        failed: &[StepPatch],
    ) {
        self.steps.apply_optimistic(run_id, scenario_id, confirmed);
        if let Err(e) = self.steps.revalidate(run_id, scenario_id).await {
            tracing::warn!(
                run_id = %run_id,
                scenario_id = %scenario_id,
                error = %e,
                "revalidation after mutation failed, keeping local values"
            );
        }
        if !failed.is_empty() {
            self.steps.apply_optimistic(run_id, scenario_id, failed);
        }
        if let Err(e) = self.metrics.refresh(run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "metrics refresh after mutation failed");
        }
    }

    fn fail(
        &self,
        key: &ScenarioKey,
        epoch: u64,
        step_keys: Vec<String>,
        message: String,
        report: Option<BatchReport>,
    ) -> EngineError {
        tracing::warn!(
            run_id = %key.run_id,
            scenario_id = %key.scenario_id,
            error = %message,
            "mutation failed"
        );
        let markers: Vec<StepPatch> = step_keys
            .iter()
            .map(|k| StepPatch::error(k, message.as_str()))
            .collect();
        self.steps
            .apply_optimistic(&key.run_id, &key.scenario_id, &markers);

        self.store.sync.update_if(
            key,
            || self.store.is_current(&key.run_id, epoch),
            |cur| {
                let in_flight = cur.in_flight.saturating_sub(1);
                let idle = in_flight == 0;
                let next = ScenarioSync {
                    phase: if idle {
                        SyncPhase::Idle
                    } else {
                        SyncPhase::OptimisticPending
                    },
                    touched: if idle { BTreeMap::new() } else { cur.touched.clone() },
                    in_flight_status: cur.in_flight_status.filter(|_| !idle),
                    in_flight,
                    last_error: Some(message.clone()),
                    rejected_steps: step_keys.clone(),
                    last_report: report.or_else(|| cur.last_report.clone()),
                    completed_batches: cur.completed_batches + 1,
                };
                (Some(Arc::new(next)), ())
            },
        );

        EngineError::Mutation {
            run_id: key.run_id.clone(),
            scenario_id: key.scenario_id.clone(),
            step_keys,
            message,
        }
    }

    fn begin(&self, key: &ScenarioKey, epoch: u64, patches: &[StepPatch], status: StepStatus) {
        self.store.sync.update_if(
            key,
            || self.store.is_current(&key.run_id, epoch),
            |cur| {
                let mut touched = cur.touched.clone();
                for p in patches {
                    touched.insert(p.step_key.clone(), p.touched_fields());
                }
                let next = ScenarioSync {
                    phase: SyncPhase::OptimisticPending,
                    touched,
                    in_flight_status: Some(status),
                    in_flight: cur.in_flight + 1,
                    last_error: None,
                    rejected_steps: Vec::new(),
                    ..cur.clone()
                };
                (Some(Arc::new(next)), ())
            },
        );
    }

    fn mark_confirmed(&self, key: &ScenarioKey, epoch: u64, report: Option<BatchReport>) {
        self.store.sync.update_if(
            key,
            || self.store.is_current(&key.run_id, epoch),
            |cur| {
                // server values take over from the in-flight overlay
                let last = cur.in_flight <= 1;
                let next = ScenarioSync {
                    phase: SyncPhase::Confirmed,
                    touched: if last {
                        BTreeMap::new()
                    } else {
                        cur.touched.clone()
                    },
                    in_flight_status: cur.in_flight_status.filter(|_| !last),
                    last_report: report.or_else(|| cur.last_report.clone()),
                    ..cur.clone()
                };
                (Some(Arc::new(next)), ())
            },
        );
    }

    fn finish(
        &self,
        key: &ScenarioKey,
        epoch: u64,
        error: Option<String>,
        rejected: Vec<String>,
    ) {
        self.store.sync.update_if(
            key,
            || self.store.is_current(&key.run_id, epoch),
            |cur| {
                let in_flight = cur.in_flight.saturating_sub(1);
                let idle = in_flight == 0;
                let next = ScenarioSync {
                    phase: if idle {
                        SyncPhase::Idle
                    } else {
                        SyncPhase::OptimisticPending
                    },
                    touched: if idle { BTreeMap::new() } else { cur.touched.clone() },
                    in_flight_status: cur.in_flight_status.filter(|_| !idle),
                    in_flight,
                    last_error: error,
                    rejected_steps: rejected,
                    last_report: cur.last_report.clone(),
                    completed_batches: cur.completed_batches + 1,
                };
                (Some(Arc::new(next)), ())
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunRecords;
    use crate::transport::{FixtureRun, FixtureScenario, InMemoryTransport, Operation};
    use evalboard_metrics::MetricsOptions;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        transport: Arc<InMemoryTransport>,
        steps: StepCache,
        metrics: MetricsCache,
        coordinator: RevalidationCoordinator,
    }

    async fn harness() -> Harness {
        let transport = Arc::new(InMemoryTransport::new());
        let with_existing = ScenarioStepData {
            invocation_steps: vec![Step::new("default", StepStatus::Success)],
            input_steps: vec![],
            annotation_steps: vec![Step::new("default.exact_match", StepStatus::Pending)],
        };
        let bare = ScenarioStepData {
            invocation_steps: vec![Step::new("default", StepStatus::Success)],
            ..Default::default()
        };
        transport.insert_run(FixtureRun {
            run: serde_json::from_value(json!({
                "id": "r1",
                "name": "r1",
                "evaluators": [{"slug": "exact_match", "metrics": [{"name": "success", "kind": "boolean", "required": true}]}]
            }))
            .unwrap(),
            scenarios: vec![
                FixtureScenario { id: ScenarioId::new("s1"), testcase_id: None, steps: with_existing },
                FixtureScenario { id: ScenarioId::new("s2"), testcase_id: None, steps: bare },
            ],
        });
        let store = Store::shared();
        RunRecords::new(Arc::clone(&store), transport.clone())
            .initialize_run(&RunId::new("r1"))
            .await;
        let steps = StepCache::new(Arc::clone(&store), transport.clone(), Duration::from_secs(60));
        let metrics = MetricsCache::new(
            Arc::clone(&store),
            steps.clone(),
            MetricsOptions::default(),
            4,
        );
        let coordinator = RevalidationCoordinator::new(
            store,
            transport.clone(),
            steps.clone(),
            metrics.clone(),
            true,
            "default",
        );
        Harness {
            transport,
            steps,
            metrics,
            coordinator,
        }
    }

    fn annotate(scenario: &str, success: serde_json::Value) -> AnnotationRequest {
        AnnotationRequest {
            run_id: RunId::new("r1"),
            scenario_id: ScenarioId::new(scenario),
            annotations: vec![EvaluatorAnnotation {
                evaluator_slug: "exact_match".into(),
                outputs: [("success".to_string(), success)].into(),
                note: None,
            }],
        }
    }

    fn status_of(h: &Harness, scenario: &str, key: &str) -> Option<StepStatus> {
        let cell = h.steps.read(&RunId::new("r1"), &ScenarioId::new(scenario));
        cell.data.data()?.find(key).map(|(_, s)| s.status)
    }

    #[tokio::test]
    async fn confirmed_batch_refreshes_metrics_once() {
        let h = harness().await;
        let report = h.coordinator.enqueue_annotation(&annotate("s1", json!(true))).await.unwrap();
        assert_eq!(report.patch, OpOutcome::Delivered { count: 1 });
        assert_eq!(report.create, OpOutcome::Skipped);
        assert_eq!(report.metrics, OpOutcome::Delivered { count: 1 });

        assert_eq!(status_of(&h, "s1", "default.exact_match"), Some(StepStatus::Success));
        assert_eq!(h.metrics.get(&RunId::new("r1")).revision, 1);

        let sync = h.coordinator.sync_state(&RunId::new("r1"), &ScenarioId::new("s1"));
        assert_eq!(sync.phase, SyncPhase::Idle);
        assert_eq!(sync.completed_batches, 1);
        assert!(sync.touched.is_empty());
    }

    #[tokio::test]
    async fn missing_annotation_step_is_created_by_backend() {
        let h = harness().await;
        let report = h.coordinator.enqueue_annotation(&annotate("s2", json!(false))).await.unwrap();
        assert_eq!(report.create, OpOutcome::Delivered { count: 1 });
        assert_eq!(status_of(&h, "s2", "default.exact_match"), Some(StepStatus::Success));
    }

    #[tokio::test]
    async fn validation_failure_sends_nothing() {
        let h = harness().await;
        let err = h
            .coordinator
            .enqueue_annotation(&annotate("s1", json!("yes")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(h.transport.call_count(Operation::PatchSteps), 0);
        assert_eq!(h.transport.call_count(Operation::FetchSteps), 0);
    }

    #[tokio::test]
    async fn failed_step_write_marks_error_and_skips_refresh() {
        let h = harness().await;
        h.transport.fail(Operation::PatchSteps);
        let err = h
            .coordinator
            .enqueue_annotation(&annotate("s1", json!(true)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Mutation { .. }));

        assert_eq!(status_of(&h, "s1", "default.exact_match"), Some(StepStatus::Error));
        let sync = h.coordinator.sync_state(&RunId::new("r1"), &ScenarioId::new("s1"));
        assert_eq!(sync.phase, SyncPhase::Idle);
        assert!(sync.last_error.is_some());
        assert_eq!(sync.rejected_steps, vec!["default.exact_match".to_string()]);
        assert_eq!(h.metrics.get(&RunId::new("r1")).revision, 0);
    }

    #[tokio::test]
    async fn metrics_push_failure_keeps_confirmed_step() {
        let h = harness().await;
        h.transport.fail(Operation::CreateMetrics);
        let err = h
            .coordinator
            .enqueue_annotation(&annotate("s1", json!(true)))
            .await
            .unwrap_err();
        let report = err.batch_report().unwrap();
        assert!(report.patch.is_delivered());
        assert!(report.metrics.is_failed());

        assert_eq!(status_of(&h, "s1", "default.exact_match"), Some(StepStatus::Success));
        assert_eq!(h.metrics.get(&RunId::new("r1")).revision, 1);
    }

    #[tokio::test]
    async fn rerun_confirms_with_trace_ids() {
        let h = harness().await;
        let outcome = h
            .coordinator
            .enqueue_invocation(&RerunRequest {
                run_id: RunId::new("r1"),
                scenario_id: ScenarioId::new("s2"),
                step_key: None,
                parameters: None,
            })
            .await
            .unwrap();
        assert!(outcome.trace_id.is_some());

        let cell = h.steps.read(&RunId::new("r1"), &ScenarioId::new("s2"));
        let step = cell.data.data().unwrap().invocation_step().unwrap().clone();
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.trace_id, outcome.trace_id);
    }

    #[tokio::test]
    async fn failed_rerun_surfaces_error_on_step() {
        let h = harness().await;
        h.transport.fail(Operation::RunInvocation);
        let err = h
            .coordinator
            .enqueue_invocation(&RerunRequest {
                run_id: RunId::new("r1"),
                scenario_id: ScenarioId::new("s1"),
                step_key: None,
                parameters: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Mutation { .. }));

        let cell = h.steps.read(&RunId::new("r1"), &ScenarioId::new("s1"));
        let (_, step) = cell.data.data().unwrap().find("default").unwrap();
        assert_eq!(step.status, StepStatus::Error);
        assert!(step.error_message.as_deref().unwrap().contains("run_invocation"));
    }

    #[tokio::test]
    async fn unknown_scenario_is_rejected() {
        let h = harness().await;
        let err = h
            .coordinator
            .enqueue_annotation(&annotate("missing", json!(true)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownScenario { .. }));
    }
}

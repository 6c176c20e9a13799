use super::{emit, open_engine, ready_run};
use crate::cli::args::{AnnotateArgs, GlobalArgs, RerunArgs};
use crate::exit_codes;
use anyhow::Context;
use evalboard_core::{
    AnnotationRequest, BatchReport, EngineError, EvaluatorAnnotation, RerunRequest, RunId,
    ScenarioId, StatusTag,
};
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Serialize)]
pub struct ActionReport {
    pub run_id: String,
    pub scenario_id: String,
    pub ok: bool,
    pub error: Option<String>,
    pub batch: Option<BatchReport>,
    pub status: StatusTag,
    pub metrics_revision: u64,
}

fn render_text(report: &ActionReport) -> String {
    let mut out = String::new();
    let verdict = if report.ok { "ok" } else { "failed" };
    let _ = writeln!(
        out,
        "{}/{}: {} (status {})",
        report.run_id, report.scenario_id, verdict, report.status.label
    );
    if let Some(batch) = &report.batch {
        let _ = writeln!(out, "  {}", batch);
    }
    if let Some(error) = &report.error {
        let _ = writeln!(out, "  error: {}", error);
    }
    let _ = writeln!(out, "  metrics revision {}", report.metrics_revision);
    out
}

fn print_validation(error: &EngineError) {
    if let EngineError::Validation(errors) = error {
        for (field, e) in errors.iter() {
            eprintln!(
                "  {}: expected {} ({}), got {}",
                field, e.expected_type, e.reason, e.value
            );
        }
    }
}

pub async fn run_annotate(global: &GlobalArgs, args: AnnotateArgs) -> anyhow::Result<i32> {
    let engine = open_engine(global)?;
    let run_id = RunId::new(args.run);
    let scenario_id = ScenarioId::new(args.scenario);
    ready_run(&engine, &run_id).await?;

    let request = AnnotationRequest {
        run_id: run_id.clone(),
        scenario_id: scenario_id.clone(),
        annotations: vec![EvaluatorAnnotation {
            evaluator_slug: args.evaluator,
            outputs: args.outputs.into_iter().collect(),
            note: args.note,
        }],
    };
    let result = engine.enqueue_annotation(&request).await;
    if let Err(e) = &result {
        print_validation(e);
    }

    let (ok, error, batch) = match result {
        Ok(report) => (true, None, Some(report)),
        Err(e) => {
            let batch = e.batch_report().cloned();
            (false, Some(e.to_string()), batch)
        }
    };
    let report = ActionReport {
        status: engine.scenario_status(&run_id, &scenario_id),
        metrics_revision: engine.run_metrics(&run_id).revision,
        run_id: run_id.to_string(),
        scenario_id: scenario_id.to_string(),
        ok,
        error,
        batch,
    };
    emit(global.format, &report, render_text)?;
    Ok(if report.ok {
        exit_codes::SUCCESS
    } else {
        exit_codes::ACTION_FAILED
    })
}

pub async fn run_rerun(global: &GlobalArgs, args: RerunArgs) -> anyhow::Result<i32> {
    let parameters = args
        .parameters
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--parameters must be valid JSON")?;
    let engine = open_engine(global)?;
    let run_id = RunId::new(args.run);
    let scenario_id = ScenarioId::new(args.scenario);
    ready_run(&engine, &run_id).await?;

    let request = RerunRequest {
        run_id: run_id.clone(),
        scenario_id: scenario_id.clone(),
        step_key: args.step,
        parameters,
    };
    let result = engine.enqueue_invocation(&request).await;
    if let Ok(outcome) = &result {
        tracing::info!(trace_id = ?outcome.trace_id, "invocation finished");
    }

    let report = ActionReport {
        status: engine.scenario_status(&run_id, &scenario_id),
        metrics_revision: engine.run_metrics(&run_id).revision,
        run_id: run_id.to_string(),
        scenario_id: scenario_id.to_string(),
        ok: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
        batch: None,
    };
    emit(global.format, &report, render_text)?;
    Ok(if report.ok {
        exit_codes::SUCCESS
    } else {
        exit_codes::ACTION_FAILED
    })
}

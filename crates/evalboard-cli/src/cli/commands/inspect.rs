use super::{emit, open_engine, ready_run};
use crate::cli::args::{GlobalArgs, InspectArgs};
use crate::exit_codes;
use evalboard_core::selectors::ScenarioFilter;
use evalboard_core::{EvalEngine, EvaluatorSummary, FilterCounts, Loadable, RunId, StatusTag};
use evalboard_metrics::MetricSummary;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Serialize)]
pub struct ScenarioRow {
    pub id: String,
    pub index: u32,
    pub status: StatusTag,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub name: Option<String>,
    pub filter_counts: FilterCounts,
    pub scenarios: Vec<ScenarioRow>,
    pub evaluators: Vec<EvaluatorSummary>,
    pub missing_scenarios: Vec<String>,
}

pub async fn run(global: &GlobalArgs, args: InspectArgs) -> anyhow::Result<i32> {
    let filter: ScenarioFilter = args.filter.parse().map_err(anyhow::Error::msg)?;
    let engine = open_engine(global)?;
    let run_id = RunId::new(args.run);
    ready_run(&engine, &run_id).await?;
    engine.load_run_metrics(&run_id).await?;

    let report = build_report(&engine, &run_id, filter);
    emit(global.format, &report, render_text)?;
    Ok(exit_codes::SUCCESS)
}

pub(crate) fn build_report(engine: &EvalEngine, run_id: &RunId, filter: ScenarioFilter) -> RunReport {
    let state = engine.run_state(run_id);
    let scenarios = engine
        .filtered_scenarios(run_id, filter)
        .into_iter()
        .filter_map(|id| {
            let index = state.scenarios.iter().find(|s| s.id == id)?.scenario_index;
            Some(ScenarioRow {
                status: engine.scenario_status(run_id, &id),
                id: id.to_string(),
                index,
            })
        })
        .collect();
    let evaluators = match engine.evaluator_summaries(run_id) {
        Loadable::Ready(summaries) => summaries.as_ref().clone(),
        _ => Vec::new(),
    };
    RunReport {
        run_id: run_id.to_string(),
        name: state.name().map(str::to_string),
        filter_counts: engine.filter_counts(run_id),
        scenarios,
        evaluators,
        missing_scenarios: engine
            .run_metrics(run_id)
            .missing_scenarios
            .iter()
            .map(ToString::to_string)
            .collect(),
    }
}

pub(crate) fn summary_text(summary: &MetricSummary) -> String {
    match summary {
        MetricSummary::Mean { value } => format!("mean {:.3}", value),
        MetricSummary::MostFrequent { value, percentage } => {
            format!("{} ({:.1}%)", value, percentage)
        }
        MetricSummary::Empty => "-".to_string(),
    }
}

fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    let c = &report.filter_counts;
    let _ = writeln!(
        out,
        "Run {} ({})",
        report.run_id,
        report.name.as_deref().unwrap_or("unnamed")
    );
    let _ = writeln!(
        out,
        "  all={} pending={} unannotated={} failed={}",
        c.all, c.pending, c.unannotated, c.failed
    );
    for row in &report.scenarios {
        let _ = writeln!(out, "  #{:<4} {:<24} {}", row.index, row.id, row.status.label);
    }
    for evaluator in &report.evaluators {
        let _ = writeln!(out, "  {}:", evaluator.name);
        for metric in &evaluator.metrics {
            let _ = writeln!(
                out,
                "    {:<20} n={:<4} {}",
                metric.name,
                metric.count,
                summary_text(&metric.summary)
            );
        }
    }
    if !report.missing_scenarios.is_empty() {
        let _ = writeln!(
            out,
            "  warning: metrics exclude unloaded scenarios: {}",
            report.missing_scenarios.join(", ")
        );
    }
    out
}

use super::inspect::{build_report, summary_text, RunReport};
use super::{emit, open_engine};
use crate::cli::args::{CompareArgs, GlobalArgs};
use crate::exit_codes;
use evalboard_core::selectors::ScenarioFilter;
use evalboard_core::{Loadable, RadarPoint, RunId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Debug, Serialize)]
pub struct ComparedRun {
    pub compare_index: Option<u32>,
    pub color_index: Option<usize>,
    pub is_base: bool,
    pub error: Option<String>,
    pub report: RunReport,
    pub radar: Vec<RadarPoint>,
}

pub async fn run(global: &GlobalArgs, args: CompareArgs) -> anyhow::Result<i32> {
    let engine = open_engine(global)?;
    let base = RunId::new(args.base);
    let compare: Vec<RunId> = args.compare.into_iter().map(RunId::new).collect();
    let axis_max: BTreeMap<String, f64> = args.axis_max.into_iter().collect();

    engine.set_compare_list(&base, &compare).await;

    let mut runs = Vec::new();
    for run_id in engine.compare_set().runs() {
        let state = engine.run_state(run_id);
        if state.is_ready() {
            if let Err(e) = engine.load_run_metrics(run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "metrics unavailable");
            }
        }
        let radar = match engine.radar(run_id, &axis_max) {
            Loadable::Ready(points) => points,
            _ => Vec::new(),
        };
        runs.push(ComparedRun {
            compare_index: state.compare_index,
            color_index: state.color_index,
            is_base: state.is_base,
            error: state.error().map(str::to_string),
            report: build_report(&engine, run_id, ScenarioFilter::All),
            radar,
        });
    }

    emit(global.format, &runs, |runs| render_text(runs))?;
    let all_loaded = runs.iter().all(|r| r.error.is_none());
    Ok(if all_loaded {
        exit_codes::SUCCESS
    } else {
        exit_codes::ACTION_FAILED
    })
}

fn render_text(runs: &[ComparedRun]) -> String {
    let mut out = String::new();
    for run in runs {
        let role = if run.is_base { "base" } else { "compare" };
        let _ = writeln!(
            out,
            "[{}] {} {} colour={}",
            run.compare_index.unwrap_or_default(),
            role,
            run.report.run_id,
            run.color_index
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into())
        );
        if let Some(error) = &run.error {
            let _ = writeln!(out, "  error: {}", error);
            continue;
        }
        let c = &run.report.filter_counts;
        let _ = writeln!(
            out,
            "  scenarios={} unannotated={} failed={}",
            c.all, c.unannotated, c.failed
        );
        for evaluator in &run.report.evaluators {
            for metric in &evaluator.metrics {
                let _ = writeln!(out, "  {:<28} {}", metric.key, summary_text(&metric.summary));
            }
        }
        for point in &run.radar {
            let _ = writeln!(out, "  radar {:<22} {:>6.1}", point.key, point.normalized);
        }
    }
    out
}

#![allow(dead_code)]

use evalboard_core::transport::FixtureRun;
use evalboard_core::{EngineConfig, EvalEngine, EvalTransport, InMemoryTransport, RunId, ScenarioId, Store};
use std::sync::Arc;

/// A run with one boolean `exact_match.success` evaluator metric and
/// `scenarios` scenarios named `s1..=sN`, each with a finished invocation.
pub fn boolean_run(id: &str, scenarios: usize) -> FixtureRun {
    let scenarios: Vec<serde_json::Value> = (1..=scenarios)
        .map(|i| {
            serde_json::json!({
                "id": format!("s{}", i),
                "testcase_id": format!("tc{}", i),
                "steps": {
                    "invocation_steps": [{
                        "id": format!("inv-{}", i),
                        "step_key": "default",
                        "status": "success",
                        "testcase_id": format!("tc{}", i),
                        "usage": {"duration_ms": 100.0 * i as f64, "tokens": 10 * i}
                    }]
                }
            })
        })
        .collect();
    serde_json::from_value(serde_json::json!({
        "run": {
            "id": id,
            "name": format!("run {}", id),
            "evaluators": [{
                "slug": "exact_match",
                "name": "Exact match",
                "metrics": [{"name": "success", "kind": "boolean", "required": true}]
            }]
        },
        "scenarios": scenarios,
    }))
    .expect("valid fixture run")
}

pub fn transport_with(runs: Vec<FixtureRun>) -> Arc<InMemoryTransport> {
    let transport = Arc::new(InMemoryTransport::new());
    for run in runs {
        transport.insert_run(run);
    }
    transport
}

pub fn engine_for(transport: &Arc<InMemoryTransport>) -> anyhow::Result<EvalEngine> {
    let transport: Arc<dyn EvalTransport> = Arc::clone(transport) as Arc<dyn EvalTransport>;
    Ok(EvalEngine::new(
        Store::shared(),
        transport,
        EngineConfig::default(),
    )?)
}

pub fn run(id: &str) -> RunId {
    RunId::new(id)
}

pub fn scenario(id: &str) -> ScenarioId {
    ScenarioId::new(id)
}

//! Optimistic overlay against server revalidation.

mod common;

use common::{boolean_run, engine_for, run, scenario, transport_with};
use evalboard_core::{Annotation, Loadable, ScenarioStepData, Step, StepPatch, StepStatus};
use std::collections::BTreeMap;

fn annotation(value: bool) -> Annotation {
    Annotation {
        outputs: BTreeMap::from([("success".to_string(), serde_json::json!(value))]),
        note: None,
    }
}

fn steps_with_annotation(status: StepStatus, annotation: Option<Annotation>) -> ScenarioStepData {
    ScenarioStepData {
        invocation_steps: vec![Step {
            id: "inv-1".into(),
            ..Step::new("default", StepStatus::Success)
        }],
        input_steps: vec![],
        annotation_steps: vec![Step {
            id: "ann-1".into(),
            annotation,
            ..Step::new("default.exact_match", status)
        }],
    }
}

#[tokio::test]
async fn test_confirm_after_optimistic_equals_direct_write() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("r", 1)]);
    let (r, s1) = (run("r"), scenario("s1"));
    transport.put_steps(&r, &s1, steps_with_annotation(StepStatus::Pending, None))?;
    let engine = engine_for(&transport)?;
    engine.initialize_run(&r).await;
    engine.load_step_data(&r, &s1).await;

    let matched = engine.apply_optimistic_step(
        &r,
        &s1,
        &[StepPatch::status("default.exact_match", StepStatus::Success)
            .with_annotation(annotation(true))
            .with_trace(Some("local-trace".into()), None)],
    );
    assert_eq!(matched, 1);

    let confirmed = steps_with_annotation(StepStatus::Success, Some(annotation(true)));
    transport.put_steps(&r, &s1, confirmed.clone())?;
    engine.revalidate_scenario(&r, &s1).await?;

    // the optimistic-only trace id is gone
    assert_eq!(engine.scenario_step_data(&r, &s1).data, Loadable::Ready(confirmed));
    Ok(())
}

#[tokio::test]
async fn test_server_success_replaces_in_flight_annotating() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("r", 1)]);
    let (r, s1) = (run("r"), scenario("s1"));
    transport.put_steps(&r, &s1, steps_with_annotation(StepStatus::Pending, None))?;
    let engine = engine_for(&transport)?;
    engine.initialize_run(&r).await;
    engine.load_step_data(&r, &s1).await;

    engine.apply_optimistic_step(
        &r,
        &s1,
        &[StepPatch::status("default.exact_match", StepStatus::Annotating)],
    );
    assert_eq!(engine.scenario_status(&r, &s1).status, StepStatus::Annotating);

    transport.put_steps(
        &r,
        &s1,
        steps_with_annotation(StepStatus::Success, Some(annotation(false))),
    )?;
    let data = engine.revalidate_scenario(&r, &s1).await?;

    let (_, step) = data.find("default.exact_match").expect("annotation step");
    assert_eq!(step.status, StepStatus::Success);
    assert_eq!(engine.scenario_status(&r, &s1).status, StepStatus::Success);
    assert_eq!(engine.scenario_status(&r, &s1).label, "Success");
    Ok(())
}

#[tokio::test]
async fn test_patch_for_unknown_step_is_a_noop() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("r", 1)]);
    let engine = engine_for(&transport)?;
    let (r, s1) = (run("r"), scenario("s1"));
    engine.initialize_run(&r).await;
    engine.load_step_data(&r, &s1).await;
    let before = engine.scenario_step_data(&r, &s1);

    let matched = engine.apply_optimistic_step(
        &r,
        &s1,
        &[StepPatch::status("default.missing", StepStatus::Annotating)],
    );
    assert_eq!(matched, 0);
    assert_eq!(engine.scenario_step_data(&r, &s1), before);
    Ok(())
}

#[tokio::test]
async fn test_subscribers_see_the_optimistic_write() -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let transport = transport_with(vec![boolean_run("r", 1)]);
    let engine = engine_for(&transport)?;
    let (r, s1) = (run("r"), scenario("s1"));
    engine.initialize_run(&r).await;
    engine.load_step_data(&r, &s1).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let sub = {
        let seen = Arc::clone(&seen);
        engine.subscribe_steps(&r, &s1, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };
    engine.apply_optimistic_step(&r, &s1, &[StepPatch::status("default", StepStatus::Running)]);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    drop(sub);
    engine.apply_optimistic_step(&r, &s1, &[StepPatch::status("default", StepStatus::Success)]);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    Ok(())
}

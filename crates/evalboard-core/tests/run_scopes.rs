//! Run scope isolation, fetch de-duplication and stale completions.

mod common;

use common::{boolean_run, engine_for, run, scenario, transport_with};
use evalboard_core::{Loadable, Operation, StepPatch, StepStatus};
use std::time::Duration;

#[tokio::test]
async fn test_writes_to_one_run_never_reach_another() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("a", 2), boolean_run("b", 2)]);
    let engine = engine_for(&transport)?;
    let (a, b) = (run("a"), run("b"));
    let s1 = scenario("s1");

    engine.initialize_run(&a).await;
    engine.initialize_run(&b).await;
    engine.load_step_data(&a, &s1).await;
    engine.load_step_data(&b, &s1).await;
    let before = engine.scenario_step_data(&b, &s1);

    engine.apply_optimistic_step(&a, &s1, &[StepPatch::status("default", StepStatus::Running)]);
    engine.set_compare_list(&a, &[]).await;

    let after = engine.scenario_step_data(&b, &s1);
    assert_eq!(before, after);
    assert_eq!(engine.scenario_status(&b, &s1).status, StepStatus::Success);
    assert_eq!(engine.scenario_status(&a, &s1).status, StepStatus::Running);
    assert!(engine.run_state(&a).is_base);
    assert!(!engine.run_state(&b).is_base);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_initialize_fetches_once() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("r", 3)]);
    transport.set_latency(Some(Duration::from_millis(20)));
    let engine = engine_for(&transport)?;
    let r = run("r");

    let (first, second, third) = tokio::join!(
        engine.initialize_run(&r),
        engine.initialize_run(&r),
        engine.initialize_run(&r)
    );
    assert_eq!([first, second, third].iter().filter(|s| **s).count(), 1);
    assert_eq!(transport.call_count(Operation::FetchRun), 1);
    assert_eq!(transport.call_count(Operation::FetchScenarios), 1);
    assert_eq!(engine.run_state(&r).scenarios.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_step_reads_share_one_fetch() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("r", 1)]);
    let engine = engine_for(&transport)?;
    let (r, s1) = (run("r"), scenario("s1"));
    engine.initialize_run(&r).await;
    transport.set_latency(Some(Duration::from_millis(20)));

    let (x, y) = tokio::join!(engine.load_step_data(&r, &s1), engine.load_step_data(&r, &s1));
    assert!(x.has_data() && y.has_data());
    assert_eq!(transport.call_count(Operation::FetchSteps), 1);

    // fresh data is served without another round-trip
    engine.load_step_data(&r, &s1).await;
    assert_eq!(transport.call_count(Operation::FetchSteps), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_metadata_fetch_stays_failed_until_retry() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("r", 1)]);
    transport.fail(Operation::FetchRun);
    let engine = engine_for(&transport)?;
    let r = run("r");

    engine.initialize_run(&r).await;
    let state = engine.run_state(&r);
    assert!(state.error().is_some());
    assert!(state.name().is_none());
    assert!(state.scenarios.is_empty());

    transport.recover(Operation::FetchRun);
    assert!(!engine.initialize_run(&r).await);
    assert!(engine.run_state(&r).error().is_some());

    assert!(engine.retry_run(&r).await);
    assert!(engine.run_state(&r).is_ready());
    Ok(())
}

#[tokio::test]
async fn test_completion_after_dispose_is_dropped() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("base", 1), boolean_run("gone", 1)]);
    let engine = engine_for(&transport)?;
    let (base, gone, s1) = (run("base"), run("gone"), scenario("s1"));
    engine.set_compare_list(&base, &[gone.clone()]).await;

    transport.set_latency(Some(Duration::from_millis(50)));
    let pending = {
        let engine = engine.clone();
        let (gone, s1) = (gone.clone(), s1.clone());
        tokio::spawn(async move { engine.load_step_data(&gone, &s1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let update = engine.set_compare_list(&base, &[]).await;
    assert_eq!(update.disposed, vec![gone.clone()]);

    // the late completion lands nowhere
    pending.await?;
    assert_eq!(engine.store().cell_count(&gone), 0);
    assert!(matches!(
        engine.scenario_step_data(&gone, &s1).data,
        Loadable::Idle
    ));
    Ok(())
}

#[tokio::test]
async fn test_step_fetch_failure_keeps_cached_data() -> anyhow::Result<()> {
    let transport = transport_with(vec![boolean_run("r", 1)]);
    let engine = engine_for(&transport)?;
    let (r, s1) = (run("r"), scenario("s1"));
    engine.initialize_run(&r).await;
    engine.load_step_data(&r, &s1).await;

    transport.fail(Operation::FetchSteps);
    assert!(engine.revalidate_scenario(&r, &s1).await.is_err());

    let cell = engine.scenario_step_data(&r, &s1);
    assert!(cell.data.has_data());
    assert!(cell.revalidation_error.is_some());
    Ok(())
}

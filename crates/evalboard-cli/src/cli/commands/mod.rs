use super::args::{Cli, Command, GlobalArgs, OutputFormat};
use anyhow::Context;
use evalboard_core::{EngineConfig, EvalEngine, EvalTransport, InMemoryTransport, RunId, Store};
use serde::Serialize;
use std::sync::Arc;

pub mod annotate;
pub mod compare;
pub mod inspect;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let global = cli.global;
    match cli.cmd {
        Command::Inspect(args) => inspect::run(&global, args).await,
        Command::Compare(args) => compare::run(&global, args).await,
        Command::Annotate(args) => annotate::run_annotate(&global, args).await,
        Command::Rerun(args) => annotate::run_rerun(&global, args).await,
    }
}

/// Engine over the fixture transport, with the config file applied if given.
pub(crate) fn open_engine(global: &GlobalArgs) -> anyhow::Result<EvalEngine> {
    let config = match &global.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let transport = InMemoryTransport::from_path(&global.fixture)?;
    let transport: Arc<dyn EvalTransport> = Arc::new(transport);
    tracing::debug!(fixture = %global.fixture.display(), "opened fixture transport");
    Ok(EvalEngine::new(Store::shared(), transport, config)?)
}

/// Loads the run and fails with context if its metadata is unavailable.
pub(crate) async fn ready_run(engine: &EvalEngine, run_id: &RunId) -> anyhow::Result<()> {
    engine.initialize_run(run_id).await;
    let state = engine.run_state(run_id);
    if let Some(error) = state.error() {
        anyhow::bail!("run {} could not be loaded: {}", run_id, error);
    }
    Ok(())
}

pub(crate) fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => print!("{}", text(value)),
    }
    Ok(())
}

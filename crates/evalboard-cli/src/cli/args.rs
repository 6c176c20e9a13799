use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "evalboard",
    version,
    about = "Inspect, compare and annotate evaluation runs from a fixture"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Args, Clone, Debug)]
pub struct GlobalArgs {
    /// JSON fixture with runs, scenarios and steps
    #[arg(long, global = true, env = "EVALBOARD_FIXTURE", default_value = "fixture.json")]
    pub fixture: PathBuf,

    /// Engine config (YAML). Defaults apply when omitted.
    #[arg(long, global = true, env = "EVALBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show one run: scenarios, statuses, filter counts and metrics
    Inspect(InspectArgs),
    /// Open a base run with comparison runs side by side
    Compare(CompareArgs),
    /// Submit evaluator values for one scenario
    Annotate(AnnotateArgs),
    /// Re-run one scenario's invocation
    Rerun(RerunArgs),
}

#[derive(Args, Clone, Debug)]
pub struct InspectArgs {
    #[arg(long)]
    pub run: String,

    /// all|pending|unannotated|failed
    #[arg(long, default_value = "all")]
    pub filter: String,
}

#[derive(Args, Clone, Debug)]
pub struct CompareArgs {
    #[arg(long)]
    pub base: String,

    /// Comparison runs in display order
    #[arg(long, value_delimiter = ',')]
    pub compare: Vec<String>,

    /// Explicit radar axis max, as `metric=value`
    #[arg(long = "axis-max", value_parser = parse_axis_max)]
    pub axis_max: Vec<(String, f64)>,
}

#[derive(Args, Clone, Debug)]
pub struct AnnotateArgs {
    #[arg(long)]
    pub run: String,

    #[arg(long)]
    pub scenario: String,

    #[arg(long)]
    pub evaluator: String,

    /// Metric value as `name=value`. Values are parsed as JSON, falling back
    /// to a plain string.
    #[arg(long = "set", value_parser = parse_output, required = true)]
    pub outputs: Vec<(String, serde_json::Value)>,

    #[arg(long)]
    pub note: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct RerunArgs {
    #[arg(long)]
    pub run: String,

    #[arg(long)]
    pub scenario: String,

    /// Invocation step key. Defaults to the scenario's invocation step.
    #[arg(long)]
    pub step: Option<String>,

    /// Invocation parameters as a JSON object
    #[arg(long)]
    pub parameters: Option<String>,
}

fn split_pair(raw: &str) -> Result<(&str, &str), String> {
    raw.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))
}

pub fn parse_output(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = split_pair(raw)?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

pub fn parse_axis_max(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = split_pair(raw)?;
    let max: f64 = value
        .parse()
        .map_err(|e| format!("invalid axis max '{}': {}", value, e))?;
    Ok((name.to_string(), max))
}

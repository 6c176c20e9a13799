//! Engine errors.
//!
//! Read paths never return these for fetch failures; they surface
//! `Loadable::Failed` on the affected cell instead. Write paths return
//! [`EngineResult`] so the caller can show that an action failed.

pub mod validation;

pub use validation::{FieldError, ValidationErrors};

use crate::model::{RunId, ScenarioId};
use crate::revalidation::BatchReport;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Run metadata, scenario list or step data could not be fetched.
    #[error("fetch failed for run {run_id}{}: {message}", scenario_suffix(.scenario_id))]
    Fetch {
        run_id: RunId,
        scenario_id: Option<ScenarioId>,
        message: String,
    },

    /// The backend rejected an annotate/invoke action.
    #[error("mutation failed for {run_id}/{scenario_id}: {message}")]
    Mutation {
        run_id: RunId,
        scenario_id: ScenarioId,
        step_keys: Vec<String>,
        message: String,
    },

    /// Some of the patch/create/metrics sub-operations failed.
    #[error("batch partially failed: {0}")]
    PartialBatch(BatchReport),

    /// Submitted values did not match the evaluator schema. Nothing was sent.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("run {run_id} is not loaded")]
    RunNotReady { run_id: RunId },

    #[error("scenario {scenario_id} not found in run {run_id}")]
    UnknownScenario {
        run_id: RunId,
        scenario_id: ScenarioId,
    },
}

fn scenario_suffix(scenario_id: &Option<ScenarioId>) -> String {
    scenario_id
        .as_ref()
        .map(|s| format!(" scenario {}", s))
        .unwrap_or_default()
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn fetch(run_id: &RunId, scenario_id: Option<&ScenarioId>, message: impl Into<String>) -> Self {
        Self::Fetch {
            run_id: run_id.clone(),
            scenario_id: scenario_id.cloned(),
            message: message.into(),
        }
    }

    /// Validation errors are caught before any network call.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Config { .. })
    }

    pub fn batch_report(&self) -> Option<&BatchReport> {
        match self {
            Self::PartialBatch(report) => Some(report),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

mod ids;
mod loadable;
pub mod run;
pub mod step;

pub use ids::{RunId, ScenarioId};
pub use loadable::Loadable;
pub use run::{EnrichedRun, EvaluatorDef, MetricDef, RunLoad, RunState, Scenario, ScenarioRef};
pub use step::{
    annotation_step_key, evaluator_slug, Annotation, InvocationUsage, ScenarioStepData, Step,
    StepKind, StepStatus,
};

use crate::model::{Loadable, Step, StepStatus};
use crate::revalidation::ScenarioSync;
use crate::steps::StepCell;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusTag {
    pub status: StepStatus,
    pub label: &'static str,
    pub color: &'static str,
}

impl StatusTag {
    pub fn of(status: StepStatus) -> Self {
        let (label, color) = match status {
            StepStatus::Pending => ("Pending", "default"),
            StepStatus::Running => ("Running", "blue"),
            StepStatus::Success => ("Success", "green"),
            StepStatus::Failure => ("Failure", "red"),
            StepStatus::Error => ("Error", "red"),
            StepStatus::Annotating => ("Annotating", "purple"),
            StepStatus::Revalidating => ("Revalidating", "gold"),
        };
        Self {
            status,
            label,
            color,
        }
    }
}

fn rank(status: StepStatus) -> u8 {
    match status {
        StepStatus::Error => 0,
        StepStatus::Failure => 1,
        StepStatus::Running => 2,
        StepStatus::Annotating => 3,
        StepStatus::Revalidating => 4,
        StepStatus::Pending => 5,
        StepStatus::Success => 6,
    }
}

/// Most significant status: error > failure > running > annotating >
/// revalidating > pending > success. No steps means pending.
pub fn aggregate_status(statuses: impl IntoIterator<Item = StepStatus>) -> StepStatus {
    statuses
        .into_iter()
        .min_by_key(|s| rank(*s))
        .unwrap_or(StepStatus::Pending)
}

/// Status shown for one step, with an in-flight optimistic override.
pub fn step_status(step: &Step, sync: &ScenarioSync) -> StepStatus {
    // terminal error markers win over the in-flight status
    if step.status == StepStatus::Error {
        return StepStatus::Error;
    }
    sync.override_for(&step.step_key).unwrap_or(step.status)
}

pub fn scenario_status(cell: &StepCell, sync: &ScenarioSync) -> StatusTag {
    let status = match &cell.data {
        Loadable::Idle | Loadable::Loading => StepStatus::Pending,
        Loadable::Failed(_) => StepStatus::Error,
        // a rejected create has no local step to carry the error marker
        Loadable::Ready(_) if !sync.rejected_steps.is_empty() => StepStatus::Error,
        Loadable::Ready(data) => {
            let status = aggregate_status(data.steps().map(|s| step_status(s, sync)));
            if cell.revalidating && status == StepStatus::Success {
                StepStatus::Revalidating
            } else {
                status
            }
        }
    };
    StatusTag::of(status)
}

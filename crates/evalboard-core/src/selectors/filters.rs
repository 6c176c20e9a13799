use super::status::scenario_status;
use crate::model::{EvaluatorDef, ScenarioId, ScenarioRef, StepStatus};
use crate::revalidation::ScenarioSync;
use crate::steps::StepCell;
use serde::{Deserialize, Serialize};

/// Per-scenario facts the filters read. Compared by value, so two digests
/// built from different snapshots with the same content are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioDigest {
    pub id: ScenarioId,
    pub scenario_index: u32,
    pub status: StepStatus,
    /// Every evaluator of the run has a confirmed annotation.
    pub annotated: bool,
}

impl ScenarioDigest {
    /// An unloaded scenario is pending and unannotated.
    pub fn build(
        scenario: &ScenarioRef,
        cell: &StepCell,
        sync: &ScenarioSync,
        evaluators: &[EvaluatorDef],
        default_invocation_key: &str,
    ) -> Self {
        let status = scenario_status(cell, sync).status;
        let annotated = match cell.data.data() {
            Some(data) => {
                let invocation_key = data
                    .invocation_step()
                    .map(|s| s.step_key.as_str())
                    .unwrap_or(default_invocation_key);
                evaluators
                    .iter()
                    .all(|e| data.confirmed_annotation(invocation_key, &e.slug).is_some())
            }
            None => evaluators.is_empty(),
        };
        Self {
            id: scenario.id.clone(),
            scenario_index: scenario.scenario_index,
            status,
            annotated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterCounts {
    pub all: usize,
    pub pending: usize,
    pub unannotated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioFilter {
    #[default]
    All,
    Pending,
    Unannotated,
    Failed,
}

impl ScenarioFilter {
    pub fn matches(self, digest: &ScenarioDigest) -> bool {
        match self {
            ScenarioFilter::All => true,
            ScenarioFilter::Pending => digest.status.is_open(),
            ScenarioFilter::Unannotated => !digest.annotated,
            ScenarioFilter::Failed => digest.status.is_failed(),
        }
    }
}

impl std::str::FromStr for ScenarioFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ScenarioFilter::All),
            "pending" => Ok(ScenarioFilter::Pending),
            "unannotated" => Ok(ScenarioFilter::Unannotated),
            "failed" => Ok(ScenarioFilter::Failed),
            other => Err(format!("unknown filter: {}", other)),
        }
    }
}

pub fn filter_counts(digests: &[ScenarioDigest]) -> FilterCounts {
    let count = |f: ScenarioFilter| digests.iter().filter(|d| f.matches(d)).count();
    FilterCounts {
        all: digests.len(),
        pending: count(ScenarioFilter::Pending),
        unannotated: count(ScenarioFilter::Unannotated),
        failed: count(ScenarioFilter::Failed),
    }
}

/// Matching scenario ids in scenario index order.
pub fn filter_scenarios(digests: &[ScenarioDigest], filter: ScenarioFilter) -> Vec<ScenarioId> {
    let mut matching: Vec<&ScenarioDigest> = digests.iter().filter(|d| filter.matches(d)).collect();
    matching.sort_by_key(|d| d.scenario_index);
    matching.into_iter().map(|d| d.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(id: &str, index: u32, status: StepStatus, annotated: bool) -> ScenarioDigest {
        ScenarioDigest {
            id: ScenarioId::new(id),
            scenario_index: index,
            status,
            annotated,
        }
    }

    #[test]
    fn counts_each_bucket_independently() {
        let digests = vec![
            digest("a", 0, StepStatus::Success, true),
            digest("b", 1, StepStatus::Annotating, false),
            digest("c", 2, StepStatus::Error, false),
            digest("d", 3, StepStatus::Pending, false),
        ];
        assert_eq!(
            filter_counts(&digests),
            FilterCounts {
                all: 4,
                pending: 2,
                unannotated: 3,
                failed: 1,
            }
        );
    }

    #[test]
    fn filtered_ids_follow_scenario_index() {
        let digests = vec![
            digest("late", 5, StepStatus::Failure, true),
            digest("early", 1, StepStatus::Error, true),
        ];
        let ids = filter_scenarios(&digests, ScenarioFilter::Failed);
        assert_eq!(ids, vec![ScenarioId::new("early"), ScenarioId::new("late")]);
    }

    #[test]
    fn unloaded_scenario_is_unannotated_when_run_has_evaluators() {
        let scenario = ScenarioRef {
            id: ScenarioId::new("s"),
            scenario_index: 0,
        };
        let evaluators = vec![EvaluatorDef {
            slug: "exact_match".into(),
            name: String::new(),
            metrics: vec![],
        }];
        let d = ScenarioDigest::build(
            &scenario,
            &StepCell::default(),
            &ScenarioSync::default(),
            &evaluators,
            "default",
        );
        assert!(!d.annotated);
        assert_eq!(d.status, StepStatus::Pending);
    }

    #[test]
    fn filter_parses_from_cli_names() {
        assert_eq!("unannotated".parse::<ScenarioFilter>(), Ok(ScenarioFilter::Unannotated));
        assert!("bogus".parse::<ScenarioFilter>().is_err());
    }
}

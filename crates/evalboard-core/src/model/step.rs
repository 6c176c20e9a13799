//! Scenario step data.
//!
//! Annotation steps are tied to their invocation step only through the key:
//! `annotation_step_key = invocation_step_key + "." + evaluator_slug`.
//! There is no foreign-key id, and lookups rely on the prefix.

use evalboard_metrics::{metric_key, ScenarioOutput, DURATION_KEY, TOKENS_KEY, TOTAL_COST_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Annotating,
    Revalidating,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Error => "error",
            StepStatus::Annotating => "annotating",
            StepStatus::Revalidating => "revalidating",
        }
    }

    /// Waiting on work that has not finished yet.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            StepStatus::Pending
                | StepStatus::Running
                | StepStatus::Annotating
                | StepStatus::Revalidating
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, StepStatus::Failure | StepStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Invocation-level measurements that feed the bare metric keys.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvocationUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    pub step_key: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<InvocationUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Step {
    pub fn new(step_key: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_key: step_key.into(),
            status,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Invocation,
    Input,
    Annotation,
}

/// `"<invocationKey>.<evaluatorSlug>"`
pub fn annotation_step_key(invocation_key: &str, evaluator_slug: &str) -> String {
    format!("{}.{}", invocation_key, evaluator_slug)
}

/// Evaluator slug of an annotation step owned by `invocation_key`, if it is one.
pub fn evaluator_slug<'a>(invocation_key: &str, annotation_key: &'a str) -> Option<&'a str> {
    annotation_key
        .strip_prefix(invocation_key)?
        .strip_prefix('.')
        .filter(|slug| !slug.is_empty())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScenarioStepData {
    #[serde(default)]
    pub invocation_steps: Vec<Step>,
    #[serde(default)]
    pub input_steps: Vec<Step>,
    #[serde(default)]
    pub annotation_steps: Vec<Step>,
}

impl ScenarioStepData {
    /// Looks a step up by key. Search order is invocation, input, annotation.
    pub fn find(&self, step_key: &str) -> Option<(StepKind, &Step)> {
        self.groups()
            .into_iter()
            .find_map(|(kind, steps)| steps.iter().find(|s| s.step_key == step_key).map(|s| (kind, s)))
    }

    pub fn find_mut(&mut self, step_key: &str) -> Option<&mut Step> {
        if let Some(s) = self.invocation_steps.iter_mut().find(|s| s.step_key == step_key) {
            return Some(s);
        }
        if let Some(s) = self.input_steps.iter_mut().find(|s| s.step_key == step_key) {
            return Some(s);
        }
        self.annotation_steps
            .iter_mut()
            .find(|s| s.step_key == step_key)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.invocation_steps
            .iter()
            .chain(self.input_steps.iter())
            .chain(self.annotation_steps.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.steps().next().is_none()
    }

    /// The scenario's invocation step. There is one per scenario.
    pub fn invocation_step(&self) -> Option<&Step> {
        self.invocation_steps.first()
    }

    /// Annotation steps whose key is prefixed by `invocation_key + "."`.
    pub fn annotations_for<'a>(
        &'a self,
        invocation_key: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Step)> + 'a {
        self.annotation_steps
            .iter()
            .filter_map(move |s| evaluator_slug(invocation_key, &s.step_key).map(|slug| (slug, s)))
    }

    /// Annotation for one evaluator, if a confirmed one exists.
    pub fn confirmed_annotation<'a>(
        &'a self,
        invocation_key: &'a str,
        slug: &str,
    ) -> Option<&'a Annotation> {
        self.annotations_for(invocation_key)
            .find(|(s, step)| *s == slug && step.status == StepStatus::Success)
            .and_then(|(_, step)| step.annotation.as_ref())
    }

    /// Flat metric values reported by this scenario: invocation usage under
    /// bare keys plus confirmed annotation outputs under `"<slug>.<metric>"`.
    pub fn scenario_output(&self, scenario_id: &str) -> ScenarioOutput {
        let mut out = ScenarioOutput::new(scenario_id);
        let Some(invocation) = self.invocation_step() else {
            return out;
        };

        if let Some(usage) = &invocation.usage {
            if let Some(d) = usage.duration_ms {
                out.values.insert(DURATION_KEY.to_string(), serde_json::json!(d));
            }
            if let Some(c) = usage.total_cost {
                out.values.insert(TOTAL_COST_KEY.to_string(), serde_json::json!(c));
            }
            if let Some(t) = usage.tokens {
                out.values.insert(TOKENS_KEY.to_string(), serde_json::json!(t));
            }
        }

        for (slug, step) in self.annotations_for(&invocation.step_key) {
            if step.status != StepStatus::Success {
                continue;
            }
            let Some(annotation) = &step.annotation else {
                continue;
            };
            for (name, value) in &annotation.outputs {
                out.values.insert(metric_key(slug, name), value.clone());
            }
        }
        out
    }

    fn groups(&self) -> [(StepKind, &Vec<Step>); 3] {
        [
            (StepKind::Invocation, &self.invocation_steps),
            (StepKind::Input, &self.input_steps),
            (StepKind::Annotation, &self.annotation_steps),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn annotated(key: &str, status: StepStatus, outputs: serde_json::Value) -> Step {
        let outputs = serde_json::from_value(outputs).unwrap();
        Step {
            annotation: Some(Annotation {
                outputs,
                note: None,
            }),
            ..Step::new(key, status)
        }
    }

    #[test]
    fn slug_requires_dot_after_prefix() {
        assert_eq!(evaluator_slug("default", "default.exact_match"), Some("exact_match"));
        assert_eq!(evaluator_slug("default", "defaultx.exact_match"), None);
        assert_eq!(evaluator_slug("default", "default."), None);
        assert_eq!(evaluator_slug("default", "default"), None);
    }

    #[test]
    fn find_searches_invocation_first() {
        let mut data = ScenarioStepData::default();
        data.annotation_steps.push(Step::new("k", StepStatus::Pending));
        data.invocation_steps.push(Step::new("k", StepStatus::Success));
        let (kind, step) = data.find("k").unwrap();
        assert_eq!(kind, StepKind::Invocation);
        assert_eq!(step.status, StepStatus::Success);
    }

    #[test]
    fn output_skips_unconfirmed_annotations_and_foreign_prefixes() {
        let mut data = ScenarioStepData::default();
        data.invocation_steps.push(Step {
            usage: Some(InvocationUsage {
                duration_ms: Some(120.0),
                total_cost: Some(0.002),
                tokens: Some(42),
            }),
            ..Step::new("default", StepStatus::Success)
        });
        data.annotation_steps.push(annotated(
            "default.exact_match",
            StepStatus::Success,
            json!({"success": true}),
        ));
        data.annotation_steps.push(annotated(
            "default.judge",
            StepStatus::Annotating,
            json!({"score": 0.4}),
        ));
        data.annotation_steps.push(annotated(
            "other.exact_match",
            StepStatus::Success,
            json!({"success": false}),
        ));

        let out = data.scenario_output("s1");
        assert_eq!(out.values.get("exact_match.success"), Some(&json!(true)));
        assert!(!out.values.contains_key("judge.score"));
        assert_eq!(out.values.get("tokens"), Some(&json!(42)));
        assert_eq!(out.values.len(), 4);
    }

    #[test]
    fn confirmed_annotation_ignores_in_flight_steps() {
        let mut data = ScenarioStepData::default();
        data.annotation_steps.push(annotated(
            "default.exact_match",
            StepStatus::Success,
            json!({"success": true}),
        ));
        data.annotation_steps.push(annotated(
            "default.judge",
            StepStatus::Annotating,
            json!({"score": 3}),
        ));

        let key = String::from("default");
        let found = data.confirmed_annotation(&key, "exact_match");
        assert_eq!(found.map(|a| &a.outputs["success"]), Some(&json!(true)));
        assert!(data.confirmed_annotation(&key, "judge").is_none());
        assert!(data.confirmed_annotation("other", "exact_match").is_none());
    }
}

//! Optimistic step patches.
//!
//! A patch is a sparse set of field overrides for one step, located by
//! `step_key`. Applying patches is a pure `(prev, patches) -> next` function:
//! the previous snapshot is never mutated, and a patch whose key matches no
//! existing step is dropped. Steps are only ever created by the backend.

use crate::model::{Annotation, InvocationUsage, ScenarioStepData, Step, StepStatus};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepPatch {
    pub step_key: String,
    pub status: Option<StepStatus>,
    /// `Some(None)` clears the field.
    pub trace_id: Option<Option<String>>,
    pub span_id: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub annotation: Option<Annotation>,
    pub usage: Option<InvocationUsage>,
    pub invocation_parameters: Option<serde_json::Value>,
}

impl StepPatch {
    pub fn new(step_key: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            ..Default::default()
        }
    }

    pub fn status(step_key: impl Into<String>, status: StepStatus) -> Self {
        Self::new(step_key).with_status(status)
    }

    /// Terminal error marker carrying the mutation error.
    pub fn error(step_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(StepStatus::Error),
            error_message: Some(Some(message.into())),
            ..Self::new(step_key)
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    pub fn with_trace(mut self, trace_id: Option<String>, span_id: Option<String>) -> Self {
        self.trace_id = Some(trace_id);
        self.span_id = Some(span_id);
        self
    }

    pub fn with_usage(mut self, usage: InvocationUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.invocation_parameters = Some(parameters);
        self
    }

    pub fn clearing_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    /// Names of the fields this patch overrides.
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.status.is_some() {
            fields.push("status");
        }
        if self.trace_id.is_some() {
            fields.push("trace_id");
        }
        if self.span_id.is_some() {
            fields.push("span_id");
        }
        if self.error_message.is_some() {
            fields.push("error_message");
        }
        if self.annotation.is_some() {
            fields.push("annotation");
        }
        if self.usage.is_some() {
            fields.push("usage");
        }
        if self.invocation_parameters.is_some() {
            fields.push("invocation_parameters");
        }
        fields
    }

    /// Shallow merge: every field set on the patch replaces the step's.
    pub fn apply_to(&self, step: &Step) -> Step {
        let mut next = step.clone();
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(trace_id) = &self.trace_id {
            next.trace_id = trace_id.clone();
        }
        if let Some(span_id) = &self.span_id {
            next.span_id = span_id.clone();
        }
        if let Some(message) = &self.error_message {
            next.error_message = message.clone();
        }
        if let Some(annotation) = &self.annotation {
            next.annotation = Some(annotation.clone());
        }
        if let Some(usage) = &self.usage {
            next.usage = Some(usage.clone());
        }
        if let Some(params) = &self.invocation_parameters {
            next.invocation_parameters = Some(params.clone());
        }
        next
    }
}

/// Applies `patches` in order and returns the new snapshot plus the number
/// of patches that found their step. Later patches win per field.
pub fn apply_patches(prev: &ScenarioStepData, patches: &[StepPatch]) -> (ScenarioStepData, usize) {
    let mut next = prev.clone();
    let mut matched = 0;
    for patch in patches {
        if let Some(step) = next.find_mut(&patch.step_key) {
            *step = patch.apply_to(step);
            matched += 1;
        }
    }
    (next, matched)
}

//! Annotation checks run before anything is sent.

use crate::errors::ValidationErrors;
use crate::model::{MetricDef, RunState};
use evalboard_metrics::{metric_key, MetricKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outputs submitted for one evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorAnnotation {
    pub evaluator_slug: String,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub note: Option<String>,
}

pub fn validate_annotations(
    run: &RunState,
    annotations: &[EvaluatorAnnotation],
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();
    for annotation in annotations {
        let slug = annotation.evaluator_slug.as_str();
        let Some(evaluator) = run.evaluator(slug) else {
            errors.add(slug, Value::Null, "evaluator", "unknown evaluator");
            continue;
        };

        for def in &evaluator.metrics {
            let field = metric_key(slug, &def.name);
            match annotation.outputs.get(&def.name) {
                None | Some(Value::Null) => {
                    if def.required {
                        errors.add(field, Value::Null, def.kind.type_name(), "required");
                    }
                }
                Some(value) => {
                    if let Err(reason) = check_value(def, value) {
                        errors.add(field, value.clone(), def.kind.type_name(), reason);
                    }
                }
            }
        }

        if evaluator.metrics.is_empty() {
            continue;
        }
        for (name, value) in &annotation.outputs {
            if evaluator.metric(name).is_none() {
                errors.add(metric_key(slug, name), value.clone(), "undeclared", "not declared by evaluator");
            }
        }
    }
    errors.into_result()
}

fn check_value(def: &MetricDef, value: &Value) -> Result<(), String> {
    match def.kind {
        MetricKind::Number => {
            let n = value.as_f64().ok_or("expected a number")?;
            check_bounds(def, n)
        }
        MetricKind::Integer => {
            let n = value.as_f64().ok_or("expected an integer")?;
            if n.fract() != 0.0 {
                return Err("expected an integer".to_string());
            }
            check_bounds(def, n)
        }
        MetricKind::Boolean => value
            .is_boolean()
            .then_some(())
            .ok_or_else(|| "expected true or false".to_string()),
        MetricKind::String => value
            .is_string()
            .then_some(())
            .ok_or_else(|| "expected a string".to_string()),
        MetricKind::Enum => {
            if value.is_array() || value.is_object() {
                return Err("expected a single option".to_string());
            }
            check_option(def, value)
        }
        MetricKind::MultiSelect => {
            let items = value.as_array().ok_or("expected a list of options")?;
            items.iter().try_for_each(|item| check_option(def, item))
        }
    }
}

fn check_bounds(def: &MetricDef, n: f64) -> Result<(), String> {
    if let Some(min) = def.minimum {
        if n < min {
            return Err(format!("below minimum {}", min));
        }
    }
    if let Some(max) = def.maximum {
        if n > max {
            return Err(format!("above maximum {}", max));
        }
    }
    Ok(())
}

fn check_option(def: &MetricDef, value: &Value) -> Result<(), String> {
    if def.options.is_empty() || def.options.contains(value) {
        Ok(())
    } else {
        Err(format!("{} is not an allowed option", value))
    }
}

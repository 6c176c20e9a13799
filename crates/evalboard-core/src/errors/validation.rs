use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// One offending field: the submitted value and the type it should have had.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub expected_type: String,
    pub reason: String,
}

/// `{field: {value, type}}`, one entry per offending metric key.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub BTreeMap<String, FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        field: impl Into<String>,
        value: serde_json::Value,
        expected_type: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.0.insert(
            field.into(),
            FieldError {
                value,
                expected_type: expected_type.into(),
                reason: reason.into(),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&FieldError> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldError)> {
        self.0.iter()
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(field, e)| format!("{} ({}: {})", field, e.expected_type, e.reason))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

use serde::Serialize;
use std::fmt;

/// Outcome of one of the three independent push operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpOutcome {
    /// Nothing to send.
    #[default]
    Skipped,
    Delivered {
        count: usize,
    },
    Failed {
        message: String,
    },
}

impl OpOutcome {
    pub fn from_result(count: usize, result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => OpOutcome::Delivered { count },
            Err(e) => OpOutcome::Failed {
                message: e.to_string(),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OpOutcome::Failed { .. })
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, OpOutcome::Delivered { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            OpOutcome::Failed { message } => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for OpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpOutcome::Skipped => write!(f, "skipped"),
            OpOutcome::Delivered { count } => write!(f, "delivered({})", count),
            OpOutcome::Failed { message } => write!(f, "failed({})", message),
        }
    }
}

/// Per-operation report of one mutation batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BatchReport {
    pub patch: OpOutcome,
    pub create: OpOutcome,
    pub metrics: OpOutcome,
}

impl BatchReport {
    pub fn any_failed(&self) -> bool {
        self.patch.is_failed() || self.create.is_failed() || self.metrics.is_failed()
    }

    /// At least one step write reached the backend.
    pub fn steps_delivered(&self) -> bool {
        self.patch.is_delivered() || self.create.is_delivered()
    }

    /// Every attempted step write failed.
    pub fn steps_failed(&self) -> bool {
        !self.steps_delivered() && (self.patch.is_failed() || self.create.is_failed())
    }

    pub fn failed_ops(&self) -> Vec<&'static str> {
        [
            ("patch_steps", &self.patch),
            ("create_steps", &self.create),
            ("create_metrics", &self.metrics),
        ]
        .into_iter()
        .filter(|(_, o)| o.is_failed())
        .map(|(name, _)| name)
        .collect()
    }

    /// First step-write error, for step error markers.
    pub fn step_error(&self) -> Option<&str> {
        self.patch.error().or_else(|| self.create.error())
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "patch_steps={} create_steps={} create_metrics={}",
            self.patch, self.create, self.metrics
        )
    }
}

//! Evaluation history records.
//!
//! Every pass of the rule chain over an invocation appends one record to
//! that invocation's evaluation state. The error-count rule and the recovery
//! sweeper both read this short-term history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of side-effectful action an evaluation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Fail,
    Invoke,
    Complete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Invoke => "invoke",
            Self::Complete => "complete",
        }
    }
}

/// Outcome of a single evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvalOutcome {
    /// The rule chain produced no actions.
    Noop,
    /// Actions were emitted; `kinds` preserves declared order.
    Actions { kinds: Vec<ActionKind> },
    /// The evaluation aborted on an error.
    Error,
    /// The final record appended when the state finishes.
    Finished { success: bool },
}

impl EvalOutcome {
    /// Metric label for the eval-jobs counter.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Actions { .. } => "action",
            Self::Error => "error",
            Self::Finished { .. } => "finished",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

/// One entry in an evaluation state's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRecord {
    pub timestamp: DateTime<Utc>,
    /// Identifier of the rule path that decided this pass.
    pub rule_path: String,
    pub outcome: EvalOutcome,
    pub cause: Option<String>,
}

impl EvalRecord {
    pub fn new(rule_path: impl Into<String>, outcome: EvalOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            rule_path: rule_path.into(),
            outcome,
            cause: None,
        }
    }

    pub fn noop(rule_path: impl Into<String>) -> Self {
        Self::new(rule_path, EvalOutcome::Noop)
    }

    pub fn actions(rule_path: impl Into<String>, kinds: Vec<ActionKind>) -> Self {
        Self::new(rule_path, EvalOutcome::Actions { kinds })
    }

    pub fn error(rule_path: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(rule_path, EvalOutcome::Error).with_cause(cause)
    }

    pub fn finished(success: bool, reason: impl Into<String>) -> Self {
        Self::new("finish", EvalOutcome::Finished { success }).with_cause(reason)
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

use serde::{Deserialize, Serialize};

use super::status::ResultStatus;

/// A unit of work in a submitted DAG.
///
/// `id` is an opaque, globally unique string chosen by the submitter.
/// `parents` lists the steps whose outputs feed this step's body, in the
/// order the body consumes them. `code` is opaque to the engine and is
/// interpreted by the installed [Runner](crate::worker::runner::Runner).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub scope: String,
    /// Lower dispatches first, unless the worker reverses priority.
    pub priority: i64,
    /// Per-step timeout in seconds; the worker default applies when unset.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub parents: Vec<String>,
    pub code: String,
}

impl Step {
    pub fn timeout_or(&self, default_secs: u64) -> u64 {
        match self.timeout {
            Some(t) if t > 0 => t,
            _ => default_secs,
        }
    }
}

/// Produced by running a step body. `data` is persisted to the bucket under
/// the step id before the status transition is reported.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StepResult {
    pub status: ResultStatus,
    #[serde(with = "crate::types::b64")]
    pub data: Vec<u8>,
}

impl StepResult {
    pub fn success(data: impl Into<Vec<u8>>) -> Self {
        Self {
            status: ResultStatus::Success,
            data: data.into(),
        }
    }
}

/// How a step run ended on the worker.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The body ran to completion and chose a result status.
    Finished(StepResult),
    /// The body failed or timed out; reported to the hub as `error`.
    Failed { error: String, trace: String },
}

/// A locally queued report of one step run, pending delivery to the hub.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Transaction {
    pub step: Step,
    pub outcome: Outcome,
}

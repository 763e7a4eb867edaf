use serde::{Deserialize, Serialize};

/// Lifecycle state of a step as tracked by the hub.
///
/// Transitions form a DAG: `queued -> working -> {success, pending, reset,
/// cancel, error}`. `pending` and `error` may return to `queued` (deferral
/// expiry and operator reset respectively); `reset` re-queues immediately.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Queued,
    Working,
    Success,
    Pending,
    Reset,
    Cancel,
    Error,
}

/// Outcome a step body may choose for itself. `Error` is not representable
/// here: body failures are captured by the worker, not returned by bodies.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Pending,
    Reset,
    Cancel,
}

impl From<ResultStatus> for StepStatus {
    fn from(value: ResultStatus) -> Self {
        match value {
            ResultStatus::Success => StepStatus::Success,
            ResultStatus::Pending => StepStatus::Pending,
            ResultStatus::Reset => StepStatus::Reset,
            ResultStatus::Cancel => StepStatus::Cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_repr() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Queued).unwrap(),
            r#""queued""#
        );
        assert_eq!(
            serde_json::from_str::<StepStatus>(r#""error""#).unwrap(),
            StepStatus::Error
        );
        assert_eq!(
            serde_json::to_string(&ResultStatus::Pending).unwrap(),
            r#""pending""#
        );
    }
}

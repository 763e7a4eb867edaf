use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::store::{ScopeStats, StepRecord};
use crate::types::b64::Blob;
use crate::types::step::Step;

/// A request sent to the hub. One JSON document per frame, tagged by `op`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Inserts a whole DAG atomically. Rejected without partial effect if
    /// any parent reference dangles, any id repeats, or the graph cycles.
    Submit { steps: Vec<Step> },
    /// Leases up to a batch of ready steps, walking `scopes` in order and
    /// serving the first non-empty one in priority order.
    GetSteps {
        scopes: Vec<String>,
        #[serde(default)]
        reverse: bool,
        worker: String,
    },
    /// Returns one full step record, if known.
    GetStep { id: String },
    /// Returns full step records for the known subset of `ids`.
    BulkGetStep { ids: Vec<String> },
    /// Reads one step output from the bucket.
    GetData { id: String },
    /// Reads step outputs from the bucket; absent ids are omitted.
    BulkGetData { ids: Vec<String> },
    /// Writes one step output to the bucket.
    SetData { id: String, data: Blob },
    /// Writes step outputs to the bucket in one round trip.
    BulkSetData { data: BTreeMap<String, Blob> },
    /// Marks a step `success`, unblocking its children.
    Done { id: String },
    /// Batch form of `done`, applied in one store transaction.
    Dones { ids: Vec<String> },
    /// Defers a step that chose to wait.
    Pending { id: String },
    Pendings { ids: Vec<String> },
    /// Re-queues a step immediately, clearing failure state.
    Reset { id: String },
    Resets { ids: Vec<String> },
    /// Cancels a step and its transitive descendants.
    Cancel { id: String },
    Cancels { ids: Vec<String> },
    /// Records a failed run with message and stack trace.
    Error {
        id: String,
        message: String,
        trace: String,
    },
    /// Per-scope counts by status.
    Stats,
}

/// Reply to a [Request]. One JSON document per frame, tagged by `reply`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    StepIds { ids: Vec<String> },
    Step { record: Option<StepRecord> },
    Steps { records: BTreeMap<String, StepRecord> },
    Data { value: Option<Blob> },
    DataMap { values: BTreeMap<String, Blob> },
    Stats { scopes: BTreeMap<String, ScopeStats> },
    /// The request was understood and refused; not retried by clients.
    Err { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_string(&Request::GetSteps {
            scopes: vec!["default".into()],
            reverse: false,
            worker: "w1".into(),
        })
        .unwrap();
        assert!(json.contains(r#""op":"get_steps""#));

        // reverse defaults off when absent
        let parsed: Request = serde_json::from_str(
            r#"{"op":"get_steps","scopes":["default"],"worker":"w1"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Request::GetSteps {
                scopes: vec!["default".into()],
                reverse: false,
                worker: "w1".into(),
            }
        );
    }

    #[test]
    fn test_reply_round_trip() {
        let reply = Reply::DataMap {
            values: BTreeMap::from([(
                "s1".to_string(),
                Blob(vec![0xff, 0x00]),
            )]),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(serde_json::from_str::<Reply>(&json).unwrap(), reply);
    }
}

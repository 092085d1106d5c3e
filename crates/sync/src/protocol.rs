/// Wire protocol for the realtime channel
///
/// Messages are JSON objects with a `type` discriminator. The server set is a
/// closed sum type matched exhaustively at the reconciler, so a new wire type
/// without a handler fails to compile; frames with a type outside this set
/// fail to decode and are dropped by the supervisor.
use crate::batch::{BatchId, BatchStatus};
use serde::{Deserialize, Serialize};

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { batch_ids: Vec<BatchId> },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { batch_ids: Vec<BatchId> },
}

impl ClientMessage {
    /// Serialize to JSON text for channel transmission
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → client messages
///
/// Payloads referring to a run carry `execution_id`; its absence means
/// "unconditionally apply" (non-run-scoped and back-compat events), its
/// presence subjects the event to the reconciler's mismatch guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "batch_status")]
    BatchStatus {
        batch_id: BatchId,
        status: BatchStatus,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        current_step: Option<String>,
        #[serde(default)]
        step_index: Option<u32>,
        #[serde(default)]
        total_steps: Option<u32>,
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        last_run_passed: Option<bool>,
    },

    #[serde(rename = "step_start")]
    StepStart {
        batch_id: BatchId,
        step: String,
        index: u32,
        #[serde(default)]
        total: Option<u32>,
        #[serde(default)]
        execution_id: Option<String>,
    },

    #[serde(rename = "step_complete")]
    StepComplete {
        batch_id: BatchId,
        step: String,
        index: u32,
        pass: bool,
        #[serde(default)]
        duration: Option<f64>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        execution_id: Option<String>,
    },

    #[serde(rename = "sequence_complete")]
    SequenceComplete {
        batch_id: BatchId,
        passed: bool,
        #[serde(default)]
        duration: Option<f64>,
        #[serde(default)]
        execution_id: Option<String>,
    },

    #[serde(rename = "log")]
    Log {
        batch_id: BatchId,
        message: String,
        #[serde(default = "default_log_level")]
        level: String,
        #[serde(default)]
        execution_id: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        batch_id: Option<BatchId>,
        message: String,
        #[serde(default)]
        execution_id: Option<String>,
    },

    /// Acknowledges a subscribe; arms the one-shot initial-push exemption
    /// for each listed batch id
    #[serde(rename = "subscribed")]
    Subscribed { batch_ids: Vec<BatchId> },

    #[serde(rename = "unsubscribed")]
    Unsubscribed { batch_ids: Vec<BatchId> },

    #[serde(rename = "batch_created")]
    BatchCreated {
        batch_id: BatchId,
        #[serde(default)]
        name: Option<String>,
    },

    #[serde(rename = "batch_deleted")]
    BatchDeleted { batch_id: BatchId },
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Decode one inbound frame
pub fn decode(frame: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(frame)
}

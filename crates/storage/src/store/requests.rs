#![forbid(unsafe_code)]

use jv_core::{JobState, JsonMap, PolicyStage};
use serde::Serialize;

/// A submission that failed admission and goes straight to REJECTED.
/// `job_type` is kept verbatim: unknown types are recorded as submitted.
#[derive(Clone, Debug, PartialEq)]
pub struct RejectedJobRequest {
    pub job_type: String,
    pub params: JsonMap,
    pub metadata: JsonMap,
    pub reason: String,
    pub code: String,
    pub details: JsonMap,
    pub stage: PolicyStage,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobsListRequest {
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Heartbeat {
    pub progress: f64,
    pub phase: Option<String>,
    pub at_ms: Option<i64>,
}

/// One persisted job record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobRow {
    pub job_id: String,
    pub job_type: String,
    pub params_json: String,
    pub metadata_json: String,
    pub state: JobState,
    pub revision: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub pid: Option<u32>,
    pub heartbeat: Heartbeat,
    pub abort_requested: bool,
    pub state_reason: Option<String>,
    pub rejection_json: Option<String>,
}

impl JobRow {
    pub fn params(&self) -> Result<JsonMap, serde_json::Error> {
        serde_json::from_str(&self.params_json)
    }

    pub fn metadata(&self) -> Result<JsonMap, serde_json::Error> {
        serde_json::from_str(&self.metadata_json)
    }

    /// Most recent liveness signal: last heartbeat, else start time.
    pub fn last_seen_ms(&self) -> Option<i64> {
        self.heartbeat.at_ms.or(self.started_at_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    Requested { state: JobState },
    AlreadyRequested { state: JobState },
    Terminal { state: JobState },
    UnknownJob,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub aborted: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.running + self.succeeded + self.failed + self.rejected + self.aborted
    }
}

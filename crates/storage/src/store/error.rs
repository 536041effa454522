#![forbid(unsafe_code)]

use jv_core::JobState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown id")]
    UnknownId,
    #[error("duplicate job id: {0}")]
    DuplicateId(String),
    #[error("job is not queued (job_id={job_id}, state={state})")]
    JobNotQueued { job_id: String, state: JobState },
    #[error("job is not running (job_id={job_id}, state={state})")]
    JobNotRunning { job_id: String, state: JobState },
    #[error("job already terminal (job_id={job_id}, state={state})")]
    JobAlreadyTerminal { job_id: String, state: JobState },
    #[error("illegal transition (job_id={job_id}, from={from}, to={to})")]
    IllegalTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },
    #[error("store schema {found} is not {expected}; reset the database")]
    SchemaMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("store contention persisted (op={op}, attempts={attempts})")]
    Contention { op: &'static str, attempts: u32 },
}

impl StoreError {
    /// True for lock conflicts another process will release on its own.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Sql(err) => is_busy(err),
            Self::Contention { .. } => true,
            _ => false,
        }
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

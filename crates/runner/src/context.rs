#![forbid(unsafe_code)]

use crate::artifacts::{ArtifactWriter, StateSnapshot};
use crate::error::ContextError;
use jv_core::JobState;
use jv_storage::SqliteStore;
use std::path::Path;

/// The only capabilities a running handler gets: progress reporting, abort
/// polling, and a private directory for extra outputs.
pub struct ExecutionContext<'a> {
    store: &'a mut SqliteStore,
    writer: &'a ArtifactWriter,
    abort_seen: bool,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(store: &'a mut SqliteStore, writer: &'a ArtifactWriter) -> Self {
        Self {
            store,
            writer,
            abort_seen: false,
        }
    }

    pub fn job_id(&self) -> &str {
        self.writer.job_id()
    }

    pub fn artifacts_dir(&self) -> &Path {
        self.writer.job_dir()
    }

    /// Records progress in the store and in `state.json`.
    pub fn heartbeat(&mut self, progress: f64, phase: Option<&str>) -> Result<(), ContextError> {
        if !progress.is_finite() {
            return Err(ContextError::InvalidProgress(progress));
        }
        let progress = progress.clamp(0.0, 1.0);
        self.store
            .update_heartbeat(self.writer.job_id(), progress, phase)?;
        self.writer
            .write_state(&StateSnapshot::new(JobState::Running, progress).with_phase(phase))?;
        Ok(())
    }

    /// Once observed, an abort request stays observed. A store read failure
    /// is logged and reported as "no new request".
    pub fn is_abort_requested(&mut self) -> bool {
        if self.abort_seen {
            return true;
        }
        match self.store.get_job_row(self.writer.job_id()) {
            Ok(Some(row)) => self.abort_seen = row.abort_requested,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(job_id = %self.writer.job_id(), error = %err, "abort poll failed");
            }
        }
        self.abort_seen
    }
}

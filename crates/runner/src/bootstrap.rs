#![forbid(unsafe_code)]

//! What a spawned worker process runs for exactly one job.

use crate::artifacts::{ArtifactWriter, PolicyCheckUpdate, StateSnapshot};
use crate::context::ExecutionContext;
use crate::error::{BootstrapError, Fault};
use crate::registry::HandlerRegistry;
use crate::runtime_helpers::utc_now_rfc3339;
use jv_core::policy::codes;
use jv_core::{
    JobSpec, JobState, JobType, JsonMap, PolicyCheckEntry, PolicyResult, PolicyStage, evaluate_postflight,
    evaluate_preflight,
};
use jv_storage::{JobRow, SqliteStore, StoreConfig, StoreError};
use serde_json::json;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Once;

#[derive(Clone, Debug)]
pub struct WorkerArgs {
    pub job_id: String,
    pub db_path: PathBuf,
    pub artifacts_root: PathBuf,
    pub store: StoreConfig,
}

/// How a worker ended; maps onto the process exit code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Terminal state written (SUCCEEDED, ABORTED or FAILED by a fault).
    Finished(JobState),
    /// Refused before execution: unknown job, unknown type, invalid params.
    FailFast { code: String },
    /// The row belongs to another process or is no longer runnable.
    NotOwner { state: JobState },
}

impl WorkerExit {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Finished(JobState::Succeeded | JobState::Aborted) => 0,
            Self::Finished(_) => 1,
            Self::FailFast { .. } => 2,
            Self::NotOwner { .. } => 3,
        }
    }
}

/// Opens the store, claims the job, dispatches to its handler and records
/// the outcome. Only infrastructure failures come back as `Err`.
pub fn run_worker(args: &WorkerArgs, registry: &HandlerRegistry) -> Result<WorkerExit, BootstrapError> {
    let mut store = SqliteStore::open(&args.db_path, args.store.clone())?;
    let pid = std::process::id();

    let Some(row) = store.get_job_row(&args.job_id)? else {
        tracing::error!(job_id = %args.job_id, "unknown job");
        return Ok(WorkerExit::FailFast {
            code: "unknown_job".to_string(),
        });
    };
    let writer = ArtifactWriter::for_job(&args.artifacts_root, &row.job_id)?;

    let row = match claim(&mut store, &row, pid)? {
        Some(row) => row,
        None => {
            tracing::warn!(job_id = %row.job_id, state = %row.state, pid, "not the owner of this job");
            return Ok(WorkerExit::NotOwner { state: row.state });
        }
    };
    let started_utc = utc_now_rfc3339();

    let job_type = match JobType::parse(&row.job_type) {
        Ok(job_type) => job_type,
        Err(err) => {
            return fail_fast(&mut store, &writer, &row, codes::UNKNOWN_JOB_TYPE, &err.to_string());
        }
    };
    let Some(handler) = registry.get_handler(job_type) else {
        return fail_fast(
            &mut store,
            &writer,
            &row,
            codes::UNKNOWN_JOB_TYPE,
            &format!("no handler registered for {job_type}"),
        );
    };

    let (params, metadata) = match (row.params(), row.metadata()) {
        (Ok(params), Ok(metadata)) => (params, metadata),
        (Err(err), _) | (_, Err(err)) => {
            return fail_fast(&mut store, &writer, &row, codes::INVALID_PAYLOAD, &err.to_string());
        }
    };
    let spec = JobSpec::new(job_type, params, metadata);
    if let Err(err) = handler.validate_params(spec.params()) {
        return fail_fast(&mut store, &writer, &row, codes::VALIDATION_ERROR, &err.message);
    }

    let preflight = evaluate_preflight(&spec);
    if !preflight.allowed {
        return fail_fast(&mut store, &writer, &row, &preflight.code, &preflight.message);
    }

    if row.abort_requested {
        let reason = "abort_requested_before_start";
        record_abort_before_start(&writer, &spec, &started_utc, &preflight, reason);
        return finish(&mut store, &row.job_id, JobState::Aborted, reason);
    }

    install_panic_hook();
    let outcome = {
        let mut ctx = ExecutionContext::new(&mut store, &writer);
        writer.run(&spec, &started_utc, || {
            execute_guarded(|| handler.execute(spec.params(), &mut ctx))
        })
    };

    let (state, reason, postflight) = match &outcome {
        Ok(outcome) => {
            let postflight = evaluate_postflight(writer.job_dir(), &outcome.result);
            if !postflight.allowed {
                tracing::warn!(
                    job_id = %row.job_id,
                    code = %postflight.code,
                    message = %postflight.message,
                    "postflight failed"
                );
            }
            (outcome.state, String::new(), Some(postflight))
        }
        Err(fault) => (JobState::Failed, format!("{}: {}", fault.kind, fault.message), None),
    };

    let checked_at = utc_now_rfc3339();
    let final_reason = if reason.is_empty() {
        state.as_str().to_string()
    } else {
        format!("{}: {reason}", state.as_str())
    };
    if let Err(err) = writer.write_policy_check(PolicyCheckUpdate {
        job_type: job_type.as_str().to_string(),
        created_utc: started_utc.clone(),
        preflight: Some(with_admission(&writer, PolicyCheckEntry::from_result(&preflight, &checked_at))),
        postflight: postflight.map(|result| vec![PolicyCheckEntry::from_result(&result, &checked_at)]),
        final_reason: Some(final_reason),
    }) {
        tracing::warn!(job_id = %row.job_id, error = %err, "policy_check write failed");
    }

    finish(&mut store, &row.job_id, state, &reason)
}

/// Preflight entries already on disk (the admission verdict written at
/// submission) followed by `entry`.
fn with_admission(writer: &ArtifactWriter, entry: PolicyCheckEntry) -> Vec<PolicyCheckEntry> {
    let mut entries = match writer.read_policy_check() {
        Ok(bundle) => bundle.map(|b| b.preflight).unwrap_or_default(),
        Err(err) => {
            tracing::warn!(job_id = %writer.job_id(), error = %err, "policy_check read failed");
            Vec::new()
        }
    };
    entries.push(entry);
    entries
}

/// Best-effort: a job aborted before it ran still gets a result and a
/// manifest, but no evidence failure may keep it from reaching ABORTED.
fn record_abort_before_start(
    writer: &ArtifactWriter,
    spec: &JobSpec,
    started_utc: &str,
    preflight: &PolicyResult,
    reason: &str,
) {
    let job_id = writer.job_id();
    let mut result = JsonMap::new();
    result.insert("aborted".to_string(), json!(true));
    result.insert("reason".to_string(), json!(reason));

    let writes = writer
        .write_spec(spec)
        .and_then(|()| writer.write_result(&result))
        .and_then(|()| writer.write_state(&StateSnapshot::new(JobState::Aborted, 0.0).with_reason(reason)));
    if let Err(err) = writes {
        tracing::warn!(job_id, error = %err, "abort evidence write failed");
    }
    let manifest = writer.build_manifest(spec, JobState::Aborted, started_utc, None);
    if let Err(err) = writer.write_manifest(&manifest) {
        tracing::warn!(job_id, error = %err, "manifest write failed");
    }
    let checked_at = utc_now_rfc3339();
    if let Err(err) = writer.write_policy_check(PolicyCheckUpdate {
        job_type: spec.job_type().as_str().to_string(),
        created_utc: started_utc.to_string(),
        preflight: Some(with_admission(writer, PolicyCheckEntry::from_result(preflight, &checked_at))),
        postflight: None,
        final_reason: Some(format!("ABORTED: {reason}")),
    }) {
        tracing::warn!(job_id, error = %err, "policy_check write failed");
    }
}

/// QUEUED rows are claimed for this pid; a RUNNING row already handed to
/// this pid by the supervisor is accepted as is.
fn claim(store: &mut SqliteStore, row: &JobRow, pid: u32) -> Result<Option<JobRow>, StoreError> {
    match row.state {
        JobState::Queued => match store.mark_running(&row.job_id, pid) {
            Ok(row) => Ok(Some(row)),
            Err(StoreError::JobNotQueued { .. }) => Ok(None),
            Err(err) => Err(err),
        },
        JobState::Running if row.pid == Some(pid) => Ok(Some(row.clone())),
        _ => Ok(None),
    }
}

fn finish(
    store: &mut SqliteStore,
    job_id: &str,
    state: JobState,
    reason: &str,
) -> Result<WorkerExit, BootstrapError> {
    match store.mark_terminal(job_id, state, reason) {
        Ok(row) => Ok(WorkerExit::Finished(row.state)),
        // The reaper got there first; its verdict stands.
        Err(StoreError::JobAlreadyTerminal { state, .. }) => {
            tracing::warn!(job_id, %state, "job was finished by someone else");
            Ok(WorkerExit::NotOwner { state })
        }
        Err(err) => Err(err.into()),
    }
}

/// Refusal after the claim: the job ends FAILED with only rejection
/// evidence written, never a result or manifest. Evidence is best-effort;
/// the terminal write always happens.
fn fail_fast(
    store: &mut SqliteStore,
    writer: &ArtifactWriter,
    row: &JobRow,
    code: &str,
    message: &str,
) -> Result<WorkerExit, BootstrapError> {
    let reason = format!("{code}: {message}");
    tracing::error!(job_id = %row.job_id, code, message, "job refused by worker");

    let now = utc_now_rfc3339();
    let result = PolicyResult::fail(PolicyStage::Preflight, "worker_admission", code, message)
        .with_detail("job_type", json!(row.job_type));
    if let Err(err) =
        writer.write_state(&StateSnapshot::new(JobState::Failed, 0.0).with_reason(reason.as_str()))
    {
        tracing::warn!(job_id = %row.job_id, error = %err, "state write failed");
    }
    if let Err(err) = writer.write_policy_check(PolicyCheckUpdate {
        job_type: row.job_type.clone(),
        created_utc: now.clone(),
        preflight: Some(with_admission(writer, PolicyCheckEntry::from_result(&result, &now))),
        postflight: None,
        final_reason: Some(format!("FAILED: {reason}")),
    }) {
        tracing::warn!(job_id = %row.job_id, error = %err, "policy_check write failed");
    }

    match finish(store, &row.job_id, JobState::Failed, &reason)? {
        WorkerExit::Finished(_) => Ok(WorkerExit::FailFast {
            code: code.to_string(),
        }),
        other => Ok(other),
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<(String, Vec<String>)>> = const { RefCell::new(None) };
}

/// Chains a hook that remembers the location and backtrace of the last
/// panic on this thread, for [`execute_guarded`] to attach to the fault.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "unknown location".to_string());
            let backtrace = std::backtrace::Backtrace::force_capture().to_string();
            let trace = std::iter::once(format!("at {location}"))
                .chain(backtrace.lines().map(|line| line.trim_end().to_string()))
                .collect();
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some((location, trace)));
            previous(info);
        }));
    });
}

/// Runs `f`, turning a panic into a `HandlerPanic` fault.
pub(crate) fn execute_guarded(
    f: impl FnOnce() -> Result<jv_core::JsonMap, Fault>,
) -> Result<jv_core::JsonMap, Fault> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            let trace = LAST_PANIC
                .with(|slot| slot.borrow_mut().take())
                .map(|(_, trace)| trace)
                .unwrap_or_default();
            Err(Fault::new("HandlerPanic", message).with_trace(trace))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panics_become_faults_with_location() {
        install_panic_hook();
        let fault = execute_guarded(|| panic!("kaboom {}", 7)).expect_err("panic captured");
        assert_eq!(fault.kind, "HandlerPanic");
        assert_eq!(fault.message, "kaboom 7");
        assert!(
            fault.trace.first().is_some_and(|l| l.contains("bootstrap.rs")),
            "{:?}",
            fault.trace.first()
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(WorkerExit::Finished(JobState::Succeeded).exit_code(), 0);
        assert_eq!(WorkerExit::Finished(JobState::Aborted).exit_code(), 0);
        assert_eq!(WorkerExit::Finished(JobState::Failed).exit_code(), 1);
        assert_eq!(
            WorkerExit::FailFast {
                code: "unknown_job_type".to_string()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            WorkerExit::NotOwner {
                state: JobState::Succeeded
            }
            .exit_code(),
            3
        );
    }
}

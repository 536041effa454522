#![forbid(unsafe_code)]

//! Long-lived orchestrator: admits QUEUED jobs up to a concurrency limit,
//! spawns one worker process per job and reaps them.
//!
//! The supervisor never executes handler code. It only writes a terminal
//! state when the owning worker could not: crash, stall, forced abort or
//! shutdown. Those writes are guarded by the worker's pid so a worker that
//! did record its own outcome always wins.

mod launcher;
mod liveness;

pub use launcher::{ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use liveness::pid_alive;

use crate::artifacts::{ArtifactWriter, PolicyCheckUpdate, StateSnapshot, WORKER_LOG_FILE};
use crate::error::{Fault, SupervisorError};
use crate::runtime_helpers::{format_exit_status, now_ms, read_log_tail, utc_now_rfc3339};
use jv_core::JobState;
use jv_storage::{SqliteStore, StoreError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const LOG_TAIL_CHARS: usize = 2_000;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub db_path: PathBuf,
    pub artifacts_root: PathBuf,
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Kill a worker whose last heartbeat is older than this. Off by default.
    pub stall_timeout: Option<Duration>,
    /// Force-stop a job this long after its abort was requested. Off by default.
    pub abort_grace: Option<Duration>,
    pub shutdown_grace: Duration,
    /// Between SIGTERM and a hard kill.
    pub kill_grace: Duration,
    /// Minimum spacing of orphan sweeps inside `tick`.
    pub orphan_sweep_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(db_path: PathBuf, artifacts_root: PathBuf) -> Self {
        Self {
            db_path,
            artifacts_root,
            max_workers: 2,
            poll_interval: Duration::from_millis(200),
            stall_timeout: None,
            abort_grace: None,
            shutdown_grace: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
            orphan_sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum StopCause {
    Stalled(String),
    AbortForced,
    Shutdown,
}

struct ActiveWorker {
    handle: Box<dyn WorkerHandle>,
    pid: u32,
    abort_seen_at: Option<Instant>,
    stop: Option<(StopCause, Instant)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReapedWorker {
    pub job_id: String,
    pub pid: u32,
    pub exit: String,
    /// Set when the supervisor had to write the terminal state itself.
    pub recorded: Option<JobState>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: Vec<ReapedWorker>,
    pub recovered: Vec<String>,
    pub spawned: Vec<String>,
    pub spawn_failures: usize,
    pub stopping: Vec<String>,
    pub active: usize,
}

pub struct Supervisor<L: WorkerLauncher> {
    config: SupervisorConfig,
    store: SqliteStore,
    launcher: L,
    active: BTreeMap<String, ActiveWorker>,
    accepting: bool,
    last_sweep: Option<Instant>,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(config: SupervisorConfig, store: SqliteStore, launcher: L) -> Self {
        Self {
            config,
            store,
            launcher,
            active: BTreeMap::new(),
            accepting: true,
            last_sweep: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn active_jobs(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// RUNNING rows not owned by this supervisor whose pid is gone are failed
    /// as `worker_crashed: orphaned`. Runs at start-up and periodically from
    /// `tick`, so workers started by hand or by a dead supervisor are covered.
    pub fn recover_orphans(&mut self) -> Result<Vec<String>, SupervisorError> {
        self.last_sweep = Some(Instant::now());
        let mut recovered = Vec::new();
        for row in self.store.list_running()? {
            if self.active.contains_key(&row.job_id) {
                continue;
            }
            if row.pid.is_some_and(pid_alive) {
                continue;
            }
            let reason = "worker_crashed: orphaned";
            if self
                .store
                .mark_terminal_for_pid(&row.job_id, row.pid, JobState::Failed, reason)?
                .is_some()
            {
                self.record_evidence(&row.job_id, JobState::Failed, reason);
                recovered.push(row.job_id);
            }
        }
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "recovered orphaned jobs");
        }
        Ok(recovered)
    }

    pub fn tick(&mut self) -> Result<TickReport, SupervisorError> {
        let mut report = TickReport {
            reaped: self.reap(),
            ..TickReport::default()
        };
        let interval = self.config.orphan_sweep_interval;
        if self.last_sweep.is_none_or(|at| at.elapsed() >= interval) {
            report.recovered = self.recover_orphans()?;
        }
        report.stopping = self.enforce_policies()?;

        if self.accepting {
            let slots = self.config.max_workers.saturating_sub(self.active.len());
            for row in self.store.list_queued_oldest_first(slots)? {
                match self.launch(&row.job_id) {
                    Ok(true) => report.spawned.push(row.job_id),
                    Ok(false) => {}
                    Err(SupervisorError::Spawn { job_id, source }) => {
                        tracing::error!(job_id = %job_id, error = %source, "worker spawn failed; job stays queued");
                        report.spawn_failures += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        report.active = self.active.len();
        Ok(report)
    }

    /// Recovers orphans, then ticks until `stop` is set or `max_ticks` ran
    /// out, then shuts down with the configured grace.
    pub fn run(&mut self, stop: &AtomicBool, max_ticks: Option<u64>) -> Result<(), SupervisorError> {
        self.recover_orphans()?;
        tracing::info!(
            max_workers = self.config.max_workers,
            db = %self.config.db_path.display(),
            "supervisor started"
        );

        let mut ticks = 0u64;
        while !stop.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(report) => {
                    if !report.spawned.is_empty() || !report.reaped.is_empty() {
                        tracing::debug!(
                            spawned = report.spawned.len(),
                            reaped = report.reaped.len(),
                            active = report.active,
                            "tick"
                        );
                    }
                }
                Err(SupervisorError::Store(err)) if err.is_contention() => {
                    tracing::warn!(error = %err, "tick skipped: store contention");
                }
                Err(err) => return Err(err),
            }
            ticks += 1;
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            std::thread::sleep(self.config.poll_interval);
        }

        self.shutdown(self.config.shutdown_grace)
    }

    /// Ticks until nothing is queued or running. `false` if `timeout` hit first.
    pub fn run_until_idle(&mut self, timeout: Duration) -> Result<bool, SupervisorError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick()?;
            let counts = self.store.status_counts()?;
            if self.active.is_empty() && counts.queued == 0 && counts.running == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Stops admitting, waits up to `grace` for workers to finish, then
    /// terminates the rest.
    pub fn shutdown(&mut self, grace: Duration) -> Result<(), SupervisorError> {
        self.accepting = false;
        let deadline = Instant::now() + grace;
        while !self.active.is_empty() && Instant::now() < deadline {
            self.reap();
            if self.active.is_empty() {
                break;
            }
            std::thread::sleep(self.config.poll_interval.min(Duration::from_millis(100)));
        }

        let remaining: Vec<String> = self.active.keys().cloned().collect();
        for job_id in &remaining {
            self.begin_stop(job_id, StopCause::Shutdown);
        }
        let deadline = Instant::now() + self.config.kill_grace;
        while !self.active.is_empty() && Instant::now() < deadline {
            self.reap();
            std::thread::sleep(Duration::from_millis(20));
        }
        let leftovers: Vec<String> = self.active.keys().cloned().collect();
        for job_id in leftovers {
            let Some(mut worker) = self.active.remove(&job_id) else {
                continue;
            };
            if let Err(err) = worker.handle.kill() {
                tracing::warn!(job_id = %job_id, error = %err, "kill failed");
            }
            match worker.handle.wait() {
                Ok(status) => {
                    self.settle(&job_id, worker, status);
                }
                Err(err) => tracing::error!(job_id = %job_id, error = %err, "wait failed"),
            }
        }
        tracing::info!(terminated = remaining.len(), "supervisor stopped");
        Ok(())
    }

    /// `Ok(false)` when the job was taken by someone else between listing
    /// and hand-off; the child is then killed and discarded.
    fn launch(&mut self, job_id: &str) -> Result<bool, SupervisorError> {
        let mut handle = self
            .launcher
            .spawn(job_id)
            .map_err(|source| SupervisorError::Spawn {
                job_id: job_id.to_string(),
                source,
            })?;
        let pid = handle.pid();

        let owned = match self.store.mark_running(job_id, pid) {
            Ok(_) => true,
            // The worker may have claimed and even finished before us.
            Err(StoreError::JobNotQueued { .. }) => match self.store.get_job_row(job_id) {
                Ok(row) => row.is_some_and(|row| row.pid == Some(pid)),
                Err(err) => {
                    discard(job_id, handle.as_mut());
                    return Err(err.into());
                }
            },
            Err(err) => {
                discard(job_id, handle.as_mut());
                return Err(err.into());
            }
        };
        if !owned {
            tracing::warn!(job_id, pid, "job taken by another supervisor; discarding worker");
            discard(job_id, handle.as_mut());
            return Ok(false);
        }

        tracing::info!(job_id, pid, "worker spawned");
        self.active.insert(
            job_id.to_string(),
            ActiveWorker {
                handle,
                pid,
                abort_seen_at: None,
                stop: None,
            },
        );
        Ok(true)
    }

    fn reap(&mut self) -> Vec<ReapedWorker> {
        let mut exited = Vec::new();
        for (job_id, worker) in &mut self.active {
            match worker.handle.try_wait() {
                Ok(Some(status)) => exited.push((job_id.clone(), status)),
                Ok(None) => {}
                Err(err) => tracing::warn!(job_id = %job_id, error = %err, "try_wait failed"),
            }
        }

        let mut reaped = Vec::with_capacity(exited.len());
        for (job_id, status) in exited {
            if let Some(worker) = self.active.remove(&job_id) {
                reaped.push(self.settle(&job_id, worker, status));
            }
        }
        reaped
    }

    /// Records an outcome for a worker that exited without writing one.
    fn settle(&mut self, job_id: &str, worker: ActiveWorker, status: ExitStatus) -> ReapedWorker {
        let exit = format_exit_status(&status);
        let (state, reason) = match worker.stop.map(|(cause, _)| cause) {
            Some(StopCause::AbortForced) => (JobState::Aborted, "abort_forced".to_string()),
            Some(StopCause::Stalled(reason)) => (JobState::Failed, reason),
            Some(StopCause::Shutdown) => (
                JobState::Failed,
                "worker_crashed: supervisor_shutdown".to_string(),
            ),
            None => (JobState::Failed, format!("worker_crashed: {exit}")),
        };

        let recorded = match self
            .store
            .mark_terminal_for_pid(job_id, Some(worker.pid), state, &reason)
        {
            Ok(Some(_)) => {
                self.record_evidence(job_id, state, &reason);
                Some(state)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::error!(job_id, error = %err, "failed to record worker exit");
                None
            }
        };
        tracing::info!(job_id, pid = worker.pid, exit = %exit, "worker reaped");

        ReapedWorker {
            job_id: job_id.to_string(),
            pid: worker.pid,
            exit,
            recorded,
        }
    }

    /// Stall and forced-abort policies, plus escalation from SIGTERM to kill.
    fn enforce_policies(&mut self) -> Result<Vec<String>, SupervisorError> {
        let now = Instant::now();
        let kill_grace = self.config.kill_grace;
        let mut to_stop = Vec::new();

        for (job_id, worker) in &mut self.active {
            if let Some((_, since)) = &worker.stop {
                if now.duration_since(*since) >= kill_grace
                    && let Err(err) = worker.handle.kill()
                {
                    tracing::warn!(job_id = %job_id, error = %err, "kill failed");
                }
                continue;
            }
            let Some(row) = self.store.get_job_row(job_id)? else {
                continue;
            };
            if row.state != JobState::Running || row.pid != Some(worker.pid) {
                continue;
            }

            if let Some(grace) = self.config.abort_grace
                && row.abort_requested
            {
                let seen = *worker.abort_seen_at.get_or_insert(now);
                if now.duration_since(seen) >= grace {
                    to_stop.push((job_id.clone(), StopCause::AbortForced));
                    continue;
                }
            }

            if let Some(timeout) = self.config.stall_timeout {
                let last_seen = row.last_seen_ms().unwrap_or(row.updated_at_ms);
                let silent_ms = now_ms().saturating_sub(last_seen);
                if silent_ms >= i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX) {
                    to_stop.push((
                        job_id.clone(),
                        StopCause::Stalled(format!("stalled: no heartbeat for {}s", silent_ms / 1000)),
                    ));
                }
            }
        }

        let mut stopping = Vec::with_capacity(to_stop.len());
        for (job_id, cause) in to_stop {
            self.begin_stop(&job_id, cause);
            stopping.push(job_id);
        }
        Ok(stopping)
    }

    fn begin_stop(&mut self, job_id: &str, cause: StopCause) {
        let Some(worker) = self.active.get_mut(job_id) else {
            return;
        };
        if worker.stop.is_some() {
            return;
        }
        tracing::warn!(job_id, pid = worker.pid, cause = ?cause, "stopping worker");
        if let Err(err) = worker.handle.terminate() {
            tracing::warn!(job_id, error = %err, "terminate failed");
        }
        worker.stop = Some((cause, Instant::now()));
    }

    /// Evidence for a terminal state written on the worker's behalf.
    fn record_evidence(&self, job_id: &str, state: JobState, reason: &str) {
        let writer = match ArtifactWriter::for_job(&self.config.artifacts_root, job_id) {
            Ok(writer) => writer,
            Err(err) => {
                tracing::warn!(job_id, error = %err, "no evidence directory");
                return;
            }
        };
        let job_type = self
            .store
            .get_job_row(job_id)
            .ok()
            .flatten()
            .map(|row| row.job_type)
            .unwrap_or_default();

        if let Err(err) = writer.write_state(&StateSnapshot::new(state, 1.0).with_reason(reason)) {
            tracing::warn!(job_id, error = %err, "state write failed");
        }
        if state == JobState::Failed {
            let kind = if reason.starts_with("stalled") {
                "WorkerStalled"
            } else {
                "WorkerCrashed"
            };
            let tail = read_log_tail(&writer.path(WORKER_LOG_FILE), LOG_TAIL_CHARS);
            let fault = Fault::new(kind, reason).with_trace(vec![format!("worker.log: {tail}")]);
            if let Err(err) = writer.write_error(&fault) {
                tracing::warn!(job_id, error = %err, "error write failed");
            }
        }
        if let Err(err) = writer.write_policy_check(PolicyCheckUpdate {
            job_type,
            created_utc: utc_now_rfc3339(),
            preflight: None,
            postflight: None,
            final_reason: Some(format!("{}: {reason}", state.as_str())),
        }) {
            tracing::warn!(job_id, error = %err, "policy_check write failed");
        }
    }
}

fn discard(job_id: &str, handle: &mut dyn WorkerHandle) {
    if let Err(err) = handle.kill() {
        tracing::warn!(job_id, error = %err, "kill failed");
    }
    if let Err(err) = handle.wait() {
        tracing::warn!(job_id, error = %err, "wait failed");
    }
}

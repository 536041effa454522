#![forbid(unsafe_code)]

use super::*;
use jv_core::ids::JobId;
use jv_core::{JobSpec, JobState};
use rusqlite::{OptionalExtension, params};

const MAX_PHASE_LEN: usize = 120;
const MAX_REASON_LEN: usize = 4_000;
const MAX_JOB_TYPE_LEN: usize = 64;

const JOB_COLUMNS: &str = "job_id, job_type, params_json, metadata_json, state, revision, \
     created_at_ms, updated_at_ms, started_at_ms, finished_at_ms, pid, progress, phase, \
     heartbeat_at_ms, abort_requested, state_reason, rejection_json";

fn normalize_job_id(raw: &str) -> Result<String, StoreError> {
    JobId::try_new(raw.trim())
        .map(JobId::into_string)
        .map_err(|_| StoreError::InvalidInput("job id is malformed"))
}

fn normalize_reason(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_REASON_LEN).collect())
}

fn normalize_phase(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.chars().take(MAX_PHASE_LEN).collect())
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    let state_raw: String = row.get(4)?;
    let state = JobState::parse(&state_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let pid: Option<i64> = row.get(10)?;
    let abort_requested: i64 = row.get(14)?;
    Ok(JobRow {
        job_id: row.get(0)?,
        job_type: row.get(1)?,
        params_json: row.get(2)?,
        metadata_json: row.get(3)?,
        state,
        revision: row.get(5)?,
        created_at_ms: row.get(6)?,
        updated_at_ms: row.get(7)?,
        started_at_ms: row.get(8)?,
        finished_at_ms: row.get(9)?,
        pid: pid.and_then(|p| u32::try_from(p).ok()),
        heartbeat: Heartbeat {
            progress: row.get(11)?,
            phase: row.get(12)?,
            at_ms: row.get(13)?,
        },
        abort_requested: abort_requested != 0,
        state_reason: row.get(15)?,
        rejection_json: row.get(16)?,
    })
}

fn select_job_tx(conn: &rusqlite::Connection, job_id: &str) -> Result<Option<JobRow>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id=?1"),
            params![job_id],
            read_job_row,
        )
        .optional()?;
    Ok(row)
}

fn select_state_tx(
    conn: &rusqlite::Connection,
    job_id: &str,
) -> Result<Option<(JobState, i64, Option<u32>)>, StoreError> {
    let Some(row) = select_job_tx(conn, job_id)? else {
        return Ok(None);
    };
    Ok(Some((row.state, row.revision, row.pid)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

struct InsertJobArgs<'a> {
    job_id: &'a str,
    job_type: &'a str,
    params_json: &'a str,
    metadata_json: &'a str,
    state: JobState,
    now_ms: i64,
    state_reason: Option<&'a str>,
    rejection_json: Option<&'a str>,
}

fn insert_job_tx(tx: &Transaction<'_>, args: &InsertJobArgs<'_>) -> Result<(), StoreError> {
    let finished_at_ms = args.state.is_terminal().then_some(args.now_ms);
    let inserted = tx.execute(
        r#"
        INSERT INTO jobs(
          job_id, job_type, params_json, metadata_json, state, revision,
          created_at_ms, updated_at_ms, finished_at_ms, state_reason, rejection_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?7, ?8, ?9)
        "#,
        params![
            args.job_id,
            args.job_type,
            args.params_json,
            args.metadata_json,
            args.state.as_str(),
            args.now_ms,
            finished_at_ms,
            args.state_reason,
            args.rejection_json,
        ],
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => {
            Err(StoreError::DuplicateId(args.job_id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

impl SqliteStore {
    /// Persists an admitted spec as QUEUED and returns its fresh id.
    pub fn submit_job(&mut self, spec: &JobSpec) -> Result<String, StoreError> {
        self.submit_job_with_id(JobId::generate(), spec)
    }

    /// Like `submit_job`, for callers that need the id before the row is
    /// visible (to lay down admission evidence first). A taken id is
    /// `DuplicateId`.
    pub fn submit_job_with_id(&mut self, job_id: JobId, spec: &JobSpec) -> Result<String, StoreError> {
        let params_json = serde_json::to_string(spec.params())?;
        let metadata_json = serde_json::to_string(spec.metadata())?;
        let job_type = spec.job_type().as_str();
        let job_id = job_id.into_string();

        self.write("submit_job", |tx| {
            insert_job_tx(
                tx,
                &InsertJobArgs {
                    job_id: &job_id,
                    job_type,
                    params_json: &params_json,
                    metadata_json: &metadata_json,
                    state: JobState::Queued,
                    now_ms: now_ms(),
                    state_reason: None,
                    rejection_json: None,
                },
            )
        })?;

        tracing::info!(job_id = %job_id, job_type, "job queued");
        Ok(job_id)
    }

    /// Records a submission that failed admission. The row is born REJECTED;
    /// it never passes through QUEUED where a supervisor could pick it up.
    pub fn submit_rejected_job(&mut self, request: RejectedJobRequest) -> Result<String, StoreError> {
        let job_type = request.job_type.trim();
        if job_type.is_empty() {
            return Err(StoreError::InvalidInput("job_type must not be empty"));
        }
        let job_type: String = job_type.chars().take(MAX_JOB_TYPE_LEN).collect();
        let code = request.code.trim();
        if code.is_empty() {
            return Err(StoreError::InvalidInput("rejection code must not be empty"));
        }

        let params_json = serde_json::to_string(&request.params)?;
        let metadata_json = serde_json::to_string(&request.metadata)?;
        let state_reason = normalize_reason(&format!("{code}: {}", request.reason.trim()))
            .unwrap_or_else(|| code.to_string());
        let rejection_json = serde_json::json!({
            "code": code,
            "message": request.reason,
            "details": request.details,
            "stage": request.stage,
        })
        .to_string();
        let job_id = JobId::generate().into_string();

        self.write("submit_rejected_job", |tx| {
            insert_job_tx(
                tx,
                &InsertJobArgs {
                    job_id: &job_id,
                    job_type: &job_type,
                    params_json: &params_json,
                    metadata_json: &metadata_json,
                    state: JobState::Rejected,
                    now_ms: now_ms(),
                    state_reason: Some(&state_reason),
                    rejection_json: Some(&rejection_json),
                },
            )
        })?;

        tracing::info!(job_id = %job_id, job_type = %job_type, code, "job rejected");
        Ok(job_id)
    }

    /// Malformed ids are reported as absent.
    pub fn get_job_row(&self, job_id: &str) -> Result<Option<JobRow>, StoreError> {
        let Ok(job_id) = normalize_job_id(job_id) else {
            return Ok(None);
        };
        self.read("get_job_row", |conn| select_job_tx(conn, &job_id))
    }

    /// Newest first.
    pub fn list_jobs(&self, request: JobsListRequest) -> Result<Vec<JobRow>, StoreError> {
        let limit = request
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let state = request.state.map(JobState::as_str);
        self.read("list_jobs", |conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {JOB_COLUMNS}
                FROM jobs
                WHERE (?1 IS NULL OR state=?1)
                ORDER BY created_at_ms DESC, seq DESC
                LIMIT ?2
                "#
            ))?;
            let rows = stmt.query_map(params![state, limit], read_job_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Admission order for the supervisor.
    pub fn list_queued_oldest_first(&self, limit: usize) -> Result<Vec<JobRow>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read("list_queued", |conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {JOB_COLUMNS}
                FROM jobs
                WHERE state='QUEUED'
                ORDER BY created_at_ms ASC, seq ASC
                LIMIT ?1
                "#
            ))?;
            let rows = stmt.query_map(params![limit], read_job_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn list_running(&self) -> Result<Vec<JobRow>, StoreError> {
        self.read("list_running", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE state='RUNNING' ORDER BY seq ASC"
            ))?;
            let rows = stmt.query_map([], read_job_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Sets the advisory abort flag. Never fails on a malformed or unknown id.
    pub fn request_abort(&mut self, job_id: &str) -> Result<AbortOutcome, StoreError> {
        let Ok(job_id) = normalize_job_id(job_id) else {
            return Ok(AbortOutcome::UnknownJob);
        };

        let outcome = self.write("request_abort", |tx| {
            let current: Option<(String, i64)> = tx
                .query_row(
                    "SELECT state, abort_requested FROM jobs WHERE job_id=?1",
                    params![job_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((state, abort_requested)) = current else {
                return Ok(AbortOutcome::UnknownJob);
            };
            let state = JobState::parse(&state)
                .map_err(|_| StoreError::InvalidInput("stored job state is invalid"))?;
            if state.is_terminal() {
                return Ok(AbortOutcome::Terminal { state });
            }
            if abort_requested != 0 {
                return Ok(AbortOutcome::AlreadyRequested { state });
            }
            tx.execute(
                "UPDATE jobs SET abort_requested=1, updated_at_ms=?2 WHERE job_id=?1",
                params![job_id, now_ms()],
            )?;
            Ok(AbortOutcome::Requested { state })
        })?;

        if let AbortOutcome::Requested { state } = outcome {
            tracing::info!(job_id = %job_id, %state, "abort requested");
        }
        Ok(outcome)
    }

    /// Liveness signal from the owning worker. The revision only counts
    /// state transitions, so heartbeats leave it alone.
    pub fn update_heartbeat(
        &mut self,
        job_id: &str,
        progress: f64,
        phase: Option<&str>,
    ) -> Result<(), StoreError> {
        let job_id = normalize_job_id(job_id)?;
        if !progress.is_finite() {
            return Err(StoreError::InvalidInput("progress must be a finite number"));
        }
        let progress = progress.clamp(0.0, 1.0);
        let phase = normalize_phase(phase);

        self.write("update_heartbeat", |tx| {
            let now_ms = now_ms();
            let changed = tx.execute(
                r#"
                UPDATE jobs
                SET progress=?2, phase=COALESCE(?3, phase), heartbeat_at_ms=?4, updated_at_ms=?4
                WHERE job_id=?1 AND state='RUNNING'
                "#,
                params![job_id, progress, phase, now_ms],
            )?;
            if changed == 1 {
                return Ok(());
            }
            match select_state_tx(tx, &job_id)? {
                None => Err(StoreError::UnknownId),
                Some((state, _, _)) => Err(StoreError::JobNotRunning {
                    job_id: job_id.clone(),
                    state,
                }),
            }
        })
    }

    /// QUEUED -> RUNNING, owned by `pid`. Repeating the call with the same pid
    /// returns the row unchanged, so supervisor and worker may both record
    /// the hand-off in either order.
    pub fn mark_running(&mut self, job_id: &str, pid: u32) -> Result<JobRow, StoreError> {
        let job_id = normalize_job_id(job_id)?;

        let (row, transitioned) = self.write("mark_running", |tx| {
            let Some((state, revision, current_pid)) = select_state_tx(tx, &job_id)? else {
                return Err(StoreError::UnknownId);
            };
            match state {
                JobState::Queued => {
                    let now_ms = now_ms();
                    let changed = tx.execute(
                        r#"
                        UPDATE jobs
                        SET state='RUNNING', revision=?2, pid=?3, started_at_ms=?4,
                            heartbeat_at_ms=?4, updated_at_ms=?4
                        WHERE job_id=?1 AND state='QUEUED' AND revision=?5
                        "#,
                        params![job_id, revision + 1, i64::from(pid), now_ms, revision],
                    )?;
                    if changed != 1 {
                        return Err(StoreError::JobNotQueued {
                            job_id: job_id.clone(),
                            state,
                        });
                    }
                }
                JobState::Running if current_pid == Some(pid) => {
                    let row = select_job_tx(tx, &job_id)?.ok_or(StoreError::UnknownId)?;
                    return Ok((row, false));
                }
                state => {
                    return Err(StoreError::JobNotQueued {
                        job_id: job_id.clone(),
                        state,
                    });
                }
            }
            let row = select_job_tx(tx, &job_id)?.ok_or(StoreError::UnknownId)?;
            Ok((row, true))
        })?;

        if transitioned {
            tracing::info!(job_id = %row.job_id, pid, "job running");
        }
        Ok(row)
    }

    /// RUNNING -> terminal, exactly once.
    pub fn mark_terminal(
        &mut self,
        job_id: &str,
        state: JobState,
        reason: &str,
    ) -> Result<JobRow, StoreError> {
        let job_id = normalize_job_id(job_id)?;
        if !JobState::Running.can_transition_to(state) {
            return Err(StoreError::IllegalTransition {
                job_id,
                from: JobState::Running,
                to: state,
            });
        }
        let reason = normalize_reason(reason);

        let row = self.write("mark_terminal", |tx| {
            let Some((current, revision, _)) = select_state_tx(tx, &job_id)? else {
                return Err(StoreError::UnknownId);
            };
            if current.is_terminal() {
                return Err(StoreError::JobAlreadyTerminal {
                    job_id: job_id.clone(),
                    state: current,
                });
            }
            if current != JobState::Running {
                return Err(StoreError::JobNotRunning {
                    job_id: job_id.clone(),
                    state: current,
                });
            }
            let now_ms = now_ms();
            let changed = tx.execute(
                r#"
                UPDATE jobs
                SET state=?2, revision=?3, state_reason=?4, finished_at_ms=?5, updated_at_ms=?5
                WHERE job_id=?1 AND state='RUNNING' AND revision=?6
                "#,
                params![job_id, state.as_str(), revision + 1, reason, now_ms, revision],
            )?;
            if changed != 1 {
                return Err(StoreError::JobNotRunning {
                    job_id: job_id.clone(),
                    state: current,
                });
            }
            select_job_tx(tx, &job_id)?.ok_or(StoreError::UnknownId)
        })?;

        tracing::info!(
            job_id = %row.job_id,
            state = %row.state,
            reason = row.state_reason.as_deref().unwrap_or(""),
            "job finished"
        );
        Ok(row)
    }

    /// Like [`mark_terminal`](Self::mark_terminal) but only applies while the
    /// row is still RUNNING under `pid`. Returns `None` when the owner already
    /// recorded an outcome or the job changed hands; used by the reaper.
    pub fn mark_terminal_for_pid(
        &mut self,
        job_id: &str,
        pid: Option<u32>,
        state: JobState,
        reason: &str,
    ) -> Result<Option<JobRow>, StoreError> {
        let job_id = normalize_job_id(job_id)?;
        if !JobState::Running.can_transition_to(state) {
            return Err(StoreError::IllegalTransition {
                job_id,
                from: JobState::Running,
                to: state,
            });
        }
        let reason = normalize_reason(reason);
        let pid = pid.map(i64::from);

        let row = self.write("mark_terminal_for_pid", |tx| {
            let now_ms = now_ms();
            let changed = tx.execute(
                r#"
                UPDATE jobs
                SET state=?2, revision=revision + 1, state_reason=?3, finished_at_ms=?4, updated_at_ms=?4
                WHERE job_id=?1 AND state='RUNNING' AND pid IS ?5
                "#,
                params![job_id, state.as_str(), reason, now_ms, pid],
            )?;
            if changed != 1 {
                return Ok(None);
            }
            select_job_tx(tx, &job_id)
        })?;

        if let Some(row) = &row {
            tracing::warn!(
                job_id = %row.job_id,
                state = %row.state,
                reason = row.state_reason.as_deref().unwrap_or(""),
                "job finished on behalf of its worker"
            );
        }
        Ok(row)
    }

    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.read("status_counts", |conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = StatusCounts::default();
            for row in rows {
                let (state, count) = row?;
                let count = count.max(0) as u64;
                match JobState::parse(&state) {
                    Ok(JobState::Queued) => counts.queued = count,
                    Ok(JobState::Running) => counts.running = count,
                    Ok(JobState::Succeeded) => counts.succeeded = count,
                    Ok(JobState::Failed) => counts.failed = count,
                    Ok(JobState::Rejected) => counts.rejected = count,
                    Ok(JobState::Aborted) => counts.aborted = count,
                    Err(_) => {}
                }
            }
            Ok(counts)
        })
    }
}


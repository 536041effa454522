#![forbid(unsafe_code)]

use jv_core::{JobState, JsonMap, OverallStatus, PolicyCheckBundle};
use jv_runner::{
    JobService, ProcessLauncher, SubmitError, Supervisor, SupervisorConfig, WorkerArgs,
    WorkerExit, builtin_registry, run_worker,
};
use jv_storage::{AbortOutcome, SqliteStore, StoreConfig};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("jv_runner_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

struct Env {
    db: PathBuf,
    artifacts: PathBuf,
}

impl Env {
    fn new(test_name: &str) -> Self {
        let dir = temp_dir(test_name);
        let env = Self {
            db: dir.join("jobs.db"),
            artifacts: dir.join("artifacts"),
        };
        drop(env.store());
        env
    }

    fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.db, StoreConfig::default()).expect("open store")
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.artifacts.join(job_id)
    }

    fn supervisor(&self) -> Supervisor<ProcessLauncher> {
        let launcher = ProcessLauncher::with_program(
            PathBuf::from(env!("CARGO_BIN_EXE_jv_runner")),
            self.db.clone(),
            self.artifacts.clone(),
        );
        let mut config = SupervisorConfig::new(self.db.clone(), self.artifacts.clone());
        config.poll_interval = Duration::from_millis(20);
        config.shutdown_grace = Duration::from_secs(5);
        Supervisor::new(config, self.store(), launcher)
    }

    fn worker(&self, job_id: &str) -> std::process::Output {
        Command::new(env!("CARGO_BIN_EXE_jv_runner"))
            .arg("worker")
            .arg("--job-id")
            .arg(job_id)
            .arg("--db")
            .arg(&self.db)
            .arg("--artifacts-root")
            .arg(&self.artifacts)
            .output()
            .expect("run worker binary")
    }
}

fn insert_raw_queued(db: &Path, job_id: &str, job_type: &str, params_json: &str) {
    let conn = rusqlite::Connection::open(db).expect("raw connection");
    conn.execute(
        "INSERT INTO jobs(job_id, job_type, params_json, metadata_json, state, revision, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, '{}', 'QUEUED', 0, 1, 1)",
        rusqlite::params![job_id, job_type, params_json],
    )
    .expect("insert raw row");
}

fn params(value: Value) -> JsonMap {
    value.as_object().cloned().unwrap_or_default()
}

fn read_json(path: &Path) -> Value {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("read {}: {err}", path.display()));
    serde_json::from_str(&raw).expect("valid json")
}

fn read_policy_check(dir: &Path) -> PolicyCheckBundle {
    serde_json::from_value(read_json(&dir.join("policy_check.json"))).expect("policy check bundle")
}

fn submit(env: &Env, job_type: &str, p: Value) -> Result<String, SubmitError> {
    let registry = builtin_registry();
    let mut service = JobService::new(env.store(), env.artifacts.clone(), &registry);
    service.submit(job_type, params(p), JsonMap::new())
}

#[test]
fn unknown_type_is_rejected_with_evidence() {
    let env = Env::new("unknown_type_rejected");
    let err = submit(&env, "DEFRAG_THE_MOON", json!({})).expect_err("rejected");
    let SubmitError::Rejected { code, job_id, .. } = err else {
        panic!("expected a rejection, got {err:?}");
    };
    assert_eq!(code, "unknown_job_type");

    let row = env.store().get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Rejected);
    assert!(row.pid.is_none());

    let bundle = read_policy_check(&env.job_dir(&job_id));
    assert_eq!(bundle.overall_status, OverallStatus::Fail);
    assert_eq!(bundle.preflight.len(), 1);
    assert_eq!(bundle.preflight[0].code, "unknown_job_type");
    assert!(bundle.postflight.is_empty());
    assert!(!env.job_dir(&job_id).join("result.json").exists());
}

#[test]
fn invalid_params_are_rejected_before_queueing() {
    let env = Env::new("invalid_params_rejected");
    let err = submit(&env, "PING", json!({"sleep_sec": -1})).expect_err("rejected");
    assert_eq!(err.code(), Some("validation_error"));

    let counts = env.store().status_counts().expect("counts");
    assert_eq!(counts.queued, 0);
    assert_eq!(counts.rejected, 1);
}

#[test]
fn worker_refuses_unknown_type_that_slipped_into_the_store() {
    let env = Env::new("worker_unknown_type");
    let conn = rusqlite::Connection::open(&env.db).expect("raw connection");
    conn.execute(
        "INSERT INTO jobs(job_id, job_type, params_json, metadata_json, state, revision, created_at_ms, updated_at_ms)
         VALUES ('JOB-rawmystery1', 'MYSTERY', '{}', '{}', 'QUEUED', 0, 1, 1)",
        [],
    )
    .expect("insert raw row");
    drop(conn);

    let output = env.worker("JOB-rawmystery1");
    assert_eq!(output.status.code(), Some(2));

    let row = env
        .store()
        .get_job_row("JOB-rawmystery1")
        .expect("get")
        .expect("row");
    assert_eq!(row.state, JobState::Failed);
    assert!(
        row.state_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("unknown_job_type")),
        "reason: {:?}",
        row.state_reason
    );

    let dir = env.job_dir("JOB-rawmystery1");
    assert!(dir.join("policy_check.json").exists());
    assert!(!dir.join("result.json").exists());
    assert!(!dir.join("manifest.json").exists());
}

#[test]
fn worker_that_does_not_own_the_job_exits_three() {
    let env = Env::new("worker_not_owner");
    let job_id = submit(&env, "PING", json!({})).expect("queued");
    let mut store = env.store();
    store.mark_running(&job_id, 1).expect("claimed by pid 1");

    let output = env.worker(&job_id);
    assert_eq!(output.status.code(), Some(3));

    let row = store.get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Running);
    assert_eq!(row.pid, Some(1));
}

#[test]
fn supervised_ping_succeeds_with_full_evidence() {
    let env = Env::new("supervised_ping");
    let job_id = submit(
        &env,
        "ping",
        json!({"sleep_sec": 0.05, "steps": 5, "write_outputs": ["out/report.txt"]}),
    )
    .expect("queued");

    let mut supervisor = env.supervisor();
    assert!(
        supervisor.run_until_idle(Duration::from_secs(30)).expect("run"),
        "supervisor did not go idle"
    );

    let row = env.store().get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Succeeded, "reason: {:?}", row.state_reason);
    assert_eq!(row.heartbeat.progress, 1.0);

    let dir = env.job_dir(&job_id);
    let result = read_json(&dir.join("result.json"));
    assert_eq!(result["pong"], json!(true));
    assert_eq!(result["outputs"], json!(["out/report.txt"]));
    assert_eq!(read_json(&dir.join("state.json"))["state"], json!("SUCCEEDED"));
    assert!(dir.join("spec.json").exists());
    assert!(dir.join("worker.log").exists());

    let manifest = read_json(&dir.join("manifest.json"));
    assert_eq!(manifest["job_id"], json!(job_id));
    let files = manifest["files"].as_array().expect("files");
    assert!(files.iter().any(|f| f["path"] == json!("out/report.txt")));

    let bundle = read_policy_check(&dir);
    assert_eq!(bundle.overall_status, OverallStatus::Pass);
    assert_eq!(bundle.postflight.len(), 1);
    assert_eq!(bundle.final_reason.as_deref(), Some("SUCCEEDED"));
}

#[test]
fn escaping_declared_output_fails_postflight_but_not_the_job() {
    let env = Env::new("escaping_output");
    let job_id = submit(&env, "PING", json!({"declare_outputs": ["../outside.txt"]}))
        .expect("queued");

    let output = env.worker(&job_id);
    assert_eq!(output.status.code(), Some(0));

    let row = env.store().get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Succeeded);

    let bundle = read_policy_check(&env.job_dir(&job_id));
    assert_eq!(bundle.overall_status, OverallStatus::Fail);
    assert_eq!(bundle.postflight[0].code, "path_violation");
    assert!(bundle.preflight.iter().all(|entry| entry.passed));
}

#[test]
fn failing_handler_leaves_error_evidence() {
    let env = Env::new("failing_handler");
    let job_id = submit(&env, "PING", json!({"fail": true, "steps": 1})).expect("queued");

    let output = env.worker(&job_id);
    assert_eq!(output.status.code(), Some(1));

    let row = env.store().get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Failed);
    assert!(row.state_reason.as_deref().is_some_and(|r| r.starts_with("PingFailure")));

    let dir = env.job_dir(&job_id);
    let error = read_json(&dir.join("error.json"));
    assert_eq!(error["error_type"], json!("PingFailure"));
    assert!(dir.join("error.txt").exists());
    assert!(!dir.join("result.json").exists());
    assert_eq!(read_json(&dir.join("state.json"))["state"], json!("FAILED"));
}

#[test]
fn abort_stops_a_running_ping() {
    let env = Env::new("abort_running");
    let job_id = submit(&env, "PING", json!({"sleep_sec": 20, "steps": 200})).expect("queued");

    let mut supervisor = env.supervisor();
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        supervisor.tick().expect("tick");
        let row = env.store().get_job_row(&job_id).expect("get").expect("row");
        if row.state == JobState::Running && row.heartbeat.at_ms.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "job never started running");
        std::thread::sleep(Duration::from_millis(20));
    }

    let registry = builtin_registry();
    let mut service = JobService::new(env.store(), env.artifacts.clone(), &registry);
    assert_eq!(
        service.request_abort(&job_id).expect("abort"),
        AbortOutcome::Requested {
            state: JobState::Running
        }
    );

    assert!(supervisor.run_until_idle(Duration::from_secs(30)).expect("run"));
    let row = env.store().get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Aborted);

    let result = read_json(&env.job_dir(&job_id).join("result.json"));
    assert_eq!(result["aborted"], json!(true));
    assert!(result["completed_steps"].as_u64().is_some_and(|n| n < 200));
}

#[test]
fn cli_submit_and_get_round_trip() {
    let env = Env::new("cli_submit");
    let bin = env!("CARGO_BIN_EXE_jv_runner");
    let output = Command::new(bin)
        .args(["submit", "--job-type", "PING", "--params", r#"{"sleep_sec": 0}"#])
        .arg("--db")
        .arg(&env.db)
        .arg("--artifacts-root")
        .arg(&env.artifacts)
        .output()
        .expect("run submit");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let submitted: Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    assert_eq!(submitted["state"], json!("QUEUED"));
    let job_id = submitted["job_id"].as_str().expect("job id").to_string();

    let output = Command::new(bin)
        .args(["get", &job_id])
        .arg("--db")
        .arg(&env.db)
        .output()
        .expect("run get");
    assert!(output.status.success());
    let row: Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    assert_eq!(row["job_type"], json!("PING"));

    let output = Command::new(bin)
        .args(["submit", "--job-type", "PING", "--params", r#"{"sleep_sec": -3}"#])
        .arg("--db")
        .arg(&env.db)
        .arg("--artifacts-root")
        .arg(&env.artifacts)
        .output()
        .expect("run submit");
    assert_eq!(output.status.code(), Some(2));
    let rejected: Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    assert_eq!(rejected["state"], json!("REJECTED"));
    assert_eq!(rejected["code"], json!("validation_error"));
}

#[test]
fn worker_refuses_invalid_params_that_slipped_into_the_store() {
    let env = Env::new("worker_invalid_params");
    insert_raw_queued(&env.db, "JOB-rawbadping1", "PING", r#"{"sleep_sec": -1}"#);

    let output = env.worker("JOB-rawbadping1");
    assert_eq!(output.status.code(), Some(2));

    let row = env
        .store()
        .get_job_row("JOB-rawbadping1")
        .expect("get")
        .expect("row");
    assert_eq!(row.state, JobState::Failed);
    assert!(
        row.state_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("validation_error")),
        "reason: {:?}",
        row.state_reason
    );

    let dir = env.job_dir("JOB-rawbadping1");
    let bundle = read_policy_check(&dir);
    assert_eq!(bundle.overall_status, OverallStatus::Fail);
    assert!(bundle.preflight.iter().any(|entry| entry.code == "validation_error"));
    for name in ["result.json", "manifest.json", "spec.json"] {
        assert!(!dir.join(name).exists(), "{name} must not be written");
    }
}

#[test]
fn refusal_is_recorded_even_when_evidence_cannot_be_written() {
    let env = Env::new("refusal_without_evidence");
    insert_raw_queued(&env.db, "JOB-rawmystery2", "MYSTERY", "{}");
    // A plain file where the artifacts root should be.
    std::fs::write(&env.artifacts, b"not a directory").expect("write blocker");

    let args = WorkerArgs {
        job_id: "JOB-rawmystery2".to_string(),
        db_path: env.db.clone(),
        artifacts_root: env.artifacts.clone(),
        store: StoreConfig::default(),
    };
    let exit = run_worker(&args, &builtin_registry()).expect("worker completes");
    assert_eq!(
        exit,
        WorkerExit::FailFast {
            code: "unknown_job_type".to_string()
        }
    );

    let row = env
        .store()
        .get_job_row("JOB-rawmystery2")
        .expect("get")
        .expect("row");
    assert_eq!(row.state, JobState::Failed);
    assert!(
        row.state_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("unknown_job_type")),
        "reason: {:?}",
        row.state_reason
    );
}

#[test]
fn abort_before_start_leaves_result_and_manifest() {
    let env = Env::new("abort_before_start");
    let job_id = submit(&env, "PING", json!({"sleep_sec": 5})).expect("queued");
    let registry = builtin_registry();
    let mut service = JobService::new(env.store(), env.artifacts.clone(), &registry);
    service.request_abort(&job_id).expect("abort");

    let output = env.worker(&job_id);
    assert_eq!(output.status.code(), Some(0));

    let row = env.store().get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Aborted);
    assert_eq!(row.state_reason.as_deref(), Some("abort_requested_before_start"));

    let dir = env.job_dir(&job_id);
    let result = read_json(&dir.join("result.json"));
    assert_eq!(result["aborted"], json!(true));
    assert_eq!(result["reason"], json!("abort_requested_before_start"));
    let manifest = read_json(&dir.join("manifest.json"));
    assert_eq!(manifest["state"], json!("ABORTED"));
    assert_eq!(read_json(&dir.join("state.json"))["state"], json!("ABORTED"));

    let bundle = read_policy_check(&dir);
    assert_eq!(
        bundle.final_reason.as_deref(),
        Some("ABORTED: abort_requested_before_start")
    );
}

#[test]
fn admission_verdict_survives_execution() {
    let env = Env::new("admission_verdict");
    let job_id = submit(&env, "PING", json!({})).expect("queued");

    let dir = env.job_dir(&job_id);
    let admitted = read_policy_check(&dir);
    assert_eq!(admitted.overall_status, OverallStatus::Pass);
    assert_eq!(admitted.preflight.len(), 1);
    assert!(admitted.postflight.is_empty());
    assert!(admitted.final_reason.is_none());

    let output = env.worker(&job_id);
    assert_eq!(output.status.code(), Some(0));

    let finished = read_policy_check(&dir);
    assert_eq!(finished.created_utc, admitted.created_utc);
    assert_eq!(finished.preflight.len(), 2);
    assert_eq!(finished.preflight[0], admitted.preflight[0]);
    assert_eq!(finished.postflight.len(), 1);
    assert_eq!(finished.final_reason.as_deref(), Some("SUCCEEDED"));
}

#[cfg(unix)]
#[test]
fn sigterm_shuts_the_supervisor_down_gracefully() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let env = Env::new("sigterm_supervisor");
    let job_id = submit(&env, "PING", json!({"sleep_sec": 60, "steps": 600})).expect("queued");

    let mut supervisor = Command::new(env!("CARGO_BIN_EXE_jv_runner"))
        .args(["supervise", "--poll-ms", "20", "--shutdown-grace-s", "0"])
        .arg("--db")
        .arg(&env.db)
        .arg("--artifacts-root")
        .arg(&env.artifacts)
        .spawn()
        .expect("spawn supervisor");

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let row = env.store().get_job_row(&job_id).expect("get").expect("row");
        if row.state == JobState::Running && row.heartbeat.at_ms.is_some() {
            break;
        }
        if Instant::now() >= deadline {
            let _ = supervisor.kill();
            panic!("job never started running");
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let pid = i32::try_from(supervisor.id()).expect("pid fits");
    kill(Pid::from_raw(pid), Signal::SIGTERM).expect("signal supervisor");

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = supervisor.try_wait().expect("try_wait") {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = supervisor.kill();
            panic!("supervisor ignored SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    assert!(status.success(), "supervisor exit: {status:?}");

    let row = env.store().get_job_row(&job_id).expect("get").expect("row");
    assert_eq!(row.state, JobState::Failed);
    assert_eq!(
        row.state_reason.as_deref(),
        Some("worker_crashed: supervisor_shutdown")
    );
}

#![forbid(unsafe_code)]

//! Many writers sharing one database file. The process variant re-runs this
//! test binary with `JV_WRITER_CHILD_DB` set, so each child is a separate OS
//! process with its own connection.

use jv_core::{JobSpec, JobState, JobType, JsonMap};
use jv_storage::{JobsListRequest, SqliteStore, StoreConfig};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

const CHILD_DB_ENV: &str = "JV_WRITER_CHILD_DB";
const CHILD_JOBS_ENV: &str = "JV_WRITER_CHILD_JOBS";

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("jv_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Submits and drives `jobs` records to SUCCEEDED through a private handle.
fn drive_jobs(db: &Path, writer: usize, jobs: usize) -> Vec<String> {
    let mut store = SqliteStore::open(db, StoreConfig::default()).expect("open store");
    let pid = std::process::id();
    let mut ids = Vec::with_capacity(jobs);
    for i in 0..jobs {
        let mut params = JsonMap::new();
        params.insert("writer".to_string(), json!(writer));
        params.insert("seq".to_string(), json!(i));
        let spec = JobSpec::new(JobType::Ping, params, JsonMap::new());
        let job_id = store.submit_job(&spec).expect("submit");
        store.mark_running(&job_id, pid).expect("mark running");
        store
            .update_heartbeat(&job_id, 0.5, Some("half"))
            .expect("heartbeat");
        store
            .mark_terminal(&job_id, JobState::Succeeded, "")
            .expect("mark terminal");
        ids.push(job_id);
    }
    ids
}

fn assert_all_succeeded(db: &Path, expected: usize) {
    let store = SqliteStore::open(db, StoreConfig::default()).expect("open store");
    let rows = store
        .list_jobs(JobsListRequest::default())
        .expect("list jobs");
    assert_eq!(rows.len(), expected);

    let unique: HashSet<_> = rows.iter().map(|r| r.job_id.as_str()).collect();
    assert_eq!(unique.len(), expected, "job ids must be unique");
    for row in &rows {
        assert_eq!(row.state, JobState::Succeeded, "job {}", row.job_id);
        assert_eq!(row.revision, 2);
    }

    let counts = store.status_counts().expect("counts");
    assert_eq!(counts.succeeded as usize, expected);
    assert_eq!(counts.total() as usize, expected);
}

/// Child entry point. A no-op unless launched by `concurrent_processes_*`.
#[test]
fn writer_child() {
    let Ok(db) = std::env::var(CHILD_DB_ENV) else {
        return;
    };
    let jobs: usize = std::env::var(CHILD_JOBS_ENV)
        .expect("jobs env")
        .parse()
        .expect("jobs count");
    let writer = std::process::id() as usize;
    let ids = drive_jobs(Path::new(&db), writer, jobs);
    assert_eq!(ids.len(), jobs);
}

#[test]
fn concurrent_processes_lose_no_jobs() {
    const PROCESSES: usize = 2;
    const JOBS_PER_PROCESS: usize = 50;

    let dir = temp_dir("concurrent_processes");
    let db = dir.join("jobs.db");
    // Schema is installed by whoever opens first; children race on it too.
    let exe = std::env::current_exe().expect("test binary path");

    let children: Vec<_> = (0..PROCESSES)
        .map(|_| {
            Command::new(&exe)
                .args(["--exact", "writer_child", "--nocapture", "--test-threads=1"])
                .env(CHILD_DB_ENV, &db)
                .env(CHILD_JOBS_ENV, JOBS_PER_PROCESS.to_string())
                .spawn()
                .expect("spawn writer child")
        })
        .collect();

    for mut child in children {
        let status = child.wait().expect("wait child");
        assert!(status.success(), "writer child failed: {status}");
    }

    assert_all_succeeded(&db, PROCESSES * JOBS_PER_PROCESS);
}

#[test]
fn concurrent_connections_lose_no_jobs() {
    const THREADS: usize = 4;
    const JOBS_PER_THREAD: usize = 25;

    let dir = temp_dir("concurrent_connections");
    let db = dir.join("jobs.db");

    let handles: Vec<_> = (0..THREADS)
        .map(|writer| {
            let db = db.clone();
            std::thread::spawn(move || drive_jobs(&db, writer, JOBS_PER_THREAD))
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        for id in handle.join().expect("writer thread") {
            assert!(all.insert(id), "duplicate id handed out");
        }
    }
    assert_eq!(all.len(), THREADS * JOBS_PER_THREAD);
    assert_all_succeeded(&db, THREADS * JOBS_PER_THREAD);
}

#![forbid(unsafe_code)]

use crate::artifacts::{ArtifactWriter, WORKER_LOG_FILE};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

/// Starts one worker for one job.
pub trait WorkerLauncher {
    fn spawn(&mut self, job_id: &str) -> std::io::Result<Box<dyn WorkerHandle>>;
}

/// A started worker as seen by the supervisor.
pub trait WorkerHandle: Send {
    fn pid(&self) -> u32;

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;

    /// Polite stop (SIGTERM on unix).
    fn terminate(&mut self) -> std::io::Result<()>;

    fn kill(&mut self) -> std::io::Result<()>;

    fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

/// Spawns `<program> worker --job-id ID --db PATH --artifacts-root DIR`,
/// with stdout and stderr appended to `<job_dir>/worker.log`.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    db_path: PathBuf,
    artifacts_root: PathBuf,
    env: Vec<(String, String)>,
}

impl ProcessLauncher {
    /// Re-executes the current binary.
    pub fn current_exe(db_path: PathBuf, artifacts_root: PathBuf) -> std::io::Result<Self> {
        Ok(Self::with_program(std::env::current_exe()?, db_path, artifacts_root))
    }

    pub fn with_program(program: PathBuf, db_path: PathBuf, artifacts_root: PathBuf) -> Self {
        Self {
            program,
            db_path,
            artifacts_root,
            env: Vec::new(),
        }
    }

    /// Extra environment for workers (e.g. `RUST_LOG`).
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&mut self, job_id: &str) -> std::io::Result<Box<dyn WorkerHandle>> {
        let writer = ArtifactWriter::for_job(&self.artifacts_root, job_id)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
        writer
            .ensure_dir()
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(writer.path(WORKER_LOG_FILE))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--job-id")
            .arg(job_id)
            .arg("--db")
            .arg(&self.db_path)
            .arg("--artifacts-root")
            .arg(&self.artifacts_root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        let child = cmd.spawn()?;
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

impl WorkerHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            super::liveness::send_sigterm(self.child.id())
        }
        #[cfg(not(unix))]
        {
            self.child.kill()
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        match self.child.kill() {
            // Already exited and not yet reaped.
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait()
    }
}

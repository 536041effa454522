#![forbid(unsafe_code)]

//! Per-job evidence directory `<artifacts_root>/<job_id>/`.
//!
//! Every file lands through [`atomic_write_bytes`], so a reader sees either
//! the previous complete file or the new one. Serialized maps are key-sorted,
//! which keeps rewrites of identical content byte-identical.

use crate::error::{ArtifactError, Fault};
use crate::runtime_helpers::utc_now_rfc3339;
use jv_core::ids::JobId;
use jv_core::{JobSpec, JobState, JsonMap, PolicyCheckBundle, PolicyCheckEntry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const SPEC_FILE: &str = "spec.json";
pub const STATE_FILE: &str = "state.json";
pub const RESULT_FILE: &str = "result.json";
pub const ERROR_TXT_FILE: &str = "error.txt";
pub const ERROR_JSON_FILE: &str = "error.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const POLICY_CHECK_FILE: &str = "policy_check.json";
pub const WORKER_LOG_FILE: &str = "worker.log";

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

// Files that keep changing after the manifest is written.
const UNHASHED_FILES: [&str; 3] = [MANIFEST_FILE, POLICY_CHECK_FILE, WORKER_LOG_FILE];
const MAX_MANIFEST_DEPTH: usize = 16;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp file in the target's directory, fsync, rename, then a best-effort
/// fsync of the directory entry.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let parent = path
        .parent()
        .ok_or_else(|| ArtifactError::InvalidName(path.display().to_string()))?;
    std::fs::create_dir_all(parent).map_err(|err| ArtifactError::io(parent, err))?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ArtifactError::InvalidName(path.display().to_string()))?;

    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!(
        ".{name}.tmp.{}.{nonce}.{seq}",
        std::process::id()
    ));

    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(err) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(ArtifactError::io(path, err));
    }
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

/// Content of `state.json`, minus the job id and timestamp the writer adds.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    pub state: JobState,
    pub progress: f64,
    pub phase: Option<String>,
    pub reason: Option<String>,
}

impl StateSnapshot {
    pub fn new(state: JobState, progress: f64) -> Self {
        Self {
            state,
            progress,
            phase: None,
            reason: None,
        }
    }

    pub fn with_phase(mut self, phase: Option<&str>) -> Self {
        self.phase = phase.map(str::to_string);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Serialize)]
struct StateFile<'a> {
    job_id: &'a str,
    state: JobState,
    progress: f64,
    phase: Option<&'a str>,
    reason: Option<&'a str>,
    updated_utc: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorFile {
    error_type: String,
    message: String,
    trace: Vec<String>,
    timestamp_utc: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub job_id: String,
    pub job_type: String,
    pub state: JobState,
    pub started_utc: String,
    pub finished_utc: String,
    pub identifiers: JsonMap,
    pub declared: JsonMap,
    pub files: Vec<ManifestFile>,
}

/// Stage lists to replace in `policy_check.json`. `None` keeps what is on disk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicyCheckUpdate {
    pub job_type: String,
    /// Used only when no bundle exists yet.
    pub created_utc: String,
    pub preflight: Option<Vec<PolicyCheckEntry>>,
    pub postflight: Option<Vec<PolicyCheckEntry>>,
    pub final_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub state: JobState,
    pub result: JsonMap,
}

#[derive(Clone, Debug)]
pub struct ArtifactWriter {
    job_id: String,
    job_dir: PathBuf,
}

impl ArtifactWriter {
    /// The directory is created by the first write, not here.
    pub fn for_job(artifacts_root: &Path, job_id: &str) -> Result<Self, ArtifactError> {
        let job_id = JobId::try_new(job_id)
            .map_err(|err| ArtifactError::InvalidName(format!("{job_id}: {err}")))?
            .into_string();
        Ok(Self {
            job_dir: artifacts_root.join(&job_id),
            job_id,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn ensure_dir(&self) -> Result<(), ArtifactError> {
        std::fs::create_dir_all(&self.job_dir).map_err(|err| ArtifactError::io(&self.job_dir, err))
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.job_dir.join(name)
    }

    pub fn write_spec(&self, spec: &JobSpec) -> Result<(), ArtifactError> {
        atomic_write_json(&self.path(SPEC_FILE), spec)
    }

    pub fn write_state(&self, snapshot: &StateSnapshot) -> Result<(), ArtifactError> {
        let file = StateFile {
            job_id: &self.job_id,
            state: snapshot.state,
            progress: snapshot.progress.clamp(0.0, 1.0),
            phase: snapshot.phase.as_deref(),
            reason: snapshot.reason.as_deref(),
            updated_utc: utc_now_rfc3339(),
        };
        atomic_write_json(&self.path(STATE_FILE), &file)
    }

    pub fn write_result(&self, result: &JsonMap) -> Result<(), ArtifactError> {
        atomic_write_json(&self.path(RESULT_FILE), result)
    }

    /// `error.txt` for humans, `error.json` for tools.
    pub fn write_error(&self, fault: &Fault) -> Result<(), ArtifactError> {
        let mut text = format!("{}: {}\n", fault.kind, fault.message);
        if !fault.trace.is_empty() {
            text.push('\n');
            for line in &fault.trace {
                text.push_str(line);
                text.push('\n');
            }
        }
        atomic_write_bytes(&self.path(ERROR_TXT_FILE), text.as_bytes())?;
        atomic_write_json(
            &self.path(ERROR_JSON_FILE),
            &ErrorFile {
                error_type: fault.kind.clone(),
                message: fault.message.clone(),
                trace: fault.trace.clone(),
                timestamp_utc: utc_now_rfc3339(),
            },
        )
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<(), ArtifactError> {
        atomic_write_json(&self.path(MANIFEST_FILE), manifest)
    }

    /// Never fails: unreadable files are logged and left out.
    pub fn build_manifest(
        &self,
        spec: &JobSpec,
        state: JobState,
        started_utc: &str,
        declared: Option<&JsonMap>,
    ) -> Manifest {
        let identifiers = spec
            .params()
            .iter()
            .filter(|(key, _)| key.ends_with("_id") || key.ends_with("_ids"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<JsonMap>();

        let mut files = Vec::new();
        collect_manifest_files(&self.job_dir, &self.job_dir, 0, &mut files);
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            job_id: self.job_id.clone(),
            job_type: spec.job_type().as_str().to_string(),
            state,
            started_utc: started_utc.to_string(),
            finished_utc: utc_now_rfc3339(),
            identifiers,
            declared: declared.cloned().unwrap_or_default(),
            files,
        }
    }

    pub fn read_policy_check(&self) -> Result<Option<PolicyCheckBundle>, ArtifactError> {
        let path = self.path(POLICY_CHECK_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ArtifactError::io(path, err)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Merges `update` into the bundle on disk. `created_utc` survives every
    /// rewrite and the same update applied twice yields the same bytes.
    pub fn write_policy_check(
        &self,
        update: PolicyCheckUpdate,
    ) -> Result<PolicyCheckBundle, ArtifactError> {
        let existing = match self.read_policy_check() {
            Ok(existing) => existing,
            Err(ArtifactError::Json(err)) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "replacing unreadable policy_check.json");
                None
            }
            Err(err) => return Err(err),
        };
        let mut bundle = existing.unwrap_or_else(|| {
            PolicyCheckBundle::new(&self.job_id, &update.job_type, &update.created_utc)
        });
        if let Some(entries) = update.preflight {
            bundle.preflight.clear();
            entries.into_iter().for_each(|entry| bundle.record(entry));
        }
        if let Some(entries) = update.postflight {
            bundle.postflight.clear();
            entries.into_iter().for_each(|entry| bundle.record(entry));
        }
        if update.final_reason.is_some() {
            bundle.final_reason = update.final_reason;
        }
        bundle.overall_status = bundle.compute_overall_status();
        atomic_write_json(&self.path(POLICY_CHECK_FILE), &bundle)?;
        Ok(bundle)
    }

    /// Wraps one execution with its evidence: spec and RUNNING state up
    /// front, then either result + manifest or error + FAILED state.
    pub fn run(
        &self,
        spec: &JobSpec,
        started_utc: &str,
        body: impl FnOnce() -> Result<JsonMap, Fault>,
    ) -> Result<RunOutcome, Fault> {
        self.write_spec(spec).map_err(artifact_fault)?;
        self.write_state(&StateSnapshot::new(JobState::Running, 0.0))
            .map_err(artifact_fault)?;

        let outcome = body().and_then(|result| {
            let state = if result.get("aborted").and_then(|v| v.as_bool()) == Some(true) {
                JobState::Aborted
            } else {
                JobState::Succeeded
            };
            self.write_result(&result).map_err(artifact_fault)?;
            self.write_state(&StateSnapshot::new(state, 1.0))
                .map_err(artifact_fault)?;
            Ok(RunOutcome { state, result })
        });

        match outcome {
            Ok(outcome) => {
                let declared = outcome.result.get("manifest").and_then(|v| v.as_object());
                let manifest = self.build_manifest(spec, outcome.state, started_utc, declared);
                if let Err(err) = self.write_manifest(&manifest) {
                    tracing::warn!(job_id = %self.job_id, error = %err, "manifest write failed");
                }
                Ok(outcome)
            }
            Err(fault) => {
                self.record_failure(spec, started_utc, &fault);
                Err(fault)
            }
        }
    }

    /// Best-effort failure evidence; the fault itself is what the caller needs.
    pub fn record_failure(&self, spec: &JobSpec, started_utc: &str, fault: &Fault) {
        if let Err(err) = self.write_error(fault) {
            tracing::warn!(job_id = %self.job_id, error = %err, "error artifact write failed");
        }
        let snapshot =
            StateSnapshot::new(JobState::Failed, 1.0).with_reason(format!("{}: {}", fault.kind, fault.message));
        if let Err(err) = self.write_state(&snapshot) {
            tracing::warn!(job_id = %self.job_id, error = %err, "state write failed");
        }
        let manifest = self.build_manifest(spec, JobState::Failed, started_utc, None);
        if let Err(err) = self.write_manifest(&manifest) {
            tracing::warn!(job_id = %self.job_id, error = %err, "manifest write failed");
        }
    }
}

fn artifact_fault(err: ArtifactError) -> Fault {
    Fault::new("ArtifactError", err.to_string())
}

fn collect_manifest_files(root: &Path, dir: &Path, depth: usize, out: &mut Vec<ManifestFile>) {
    if depth > MAX_MANIFEST_DEPTH {
        tracing::warn!(dir = %dir.display(), "manifest walk too deep; skipping");
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "manifest walk failed");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            collect_manifest_files(root, &path, depth + 1, out);
            continue;
        }
        if !meta.is_file() || (depth == 0 && UNHASHED_FILES.contains(&name.as_str())) {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        match sha256_file(&path) {
            Ok((bytes, sha256)) => out.push(ManifestFile {
                path: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                bytes,
                sha256,
            }),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "manifest hash failed");
            }
        }
    }
}

fn sha256_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes = std::io::copy(&mut file, &mut hasher)?;
    Ok((bytes, format!("{:x}", hasher.finalize())))
}

#![forbid(unsafe_code)]

//! Admission (preflight) and evidence (postflight) policy evaluation.
//!
//! Evaluation functions never mutate anything: they return a fresh
//! [`PolicyResult`] and leave persistence to the caller.

use crate::containment::{ContainmentError, resolve_contained};
use crate::job::{DomainField, JobSpec, JsonMap};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;

pub const POLICY_CHECK_SCHEMA_VERSION: u32 = 1;

const MAX_PARAMS_BYTES: usize = 256 * 1024;
const MAX_METADATA_BYTES: usize = 256 * 1024;

/// Stable, machine-readable result codes.
pub mod codes {
    pub const OK: &str = "ok";
    pub const MISSING_REQUIRED_FIELD: &str = "missing_required_field";
    pub const INVALID_FORMAT: &str = "invalid_format";
    pub const UNKNOWN_JOB_TYPE: &str = "unknown_job_type";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const ARTIFACTS_DIR_MISSING: &str = "artifacts_dir_missing";
    pub const PATH_VIOLATION: &str = "path_violation";
    pub const DECLARED_OUTPUT_MISSING: &str = "declared_output_missing";
    pub const INVALID_DECLARED_OUTPUT: &str = "invalid_declared_output";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStage {
    Preflight,
    Postflight,
}

impl PolicyStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Postflight => "postflight",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub allowed: bool,
    pub code: String,
    pub policy_name: String,
    pub message: String,
    pub details: JsonMap,
    pub stage: PolicyStage,
}

impl PolicyResult {
    pub fn pass(stage: PolicyStage, policy_name: &str, message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            code: codes::OK.to_string(),
            policy_name: policy_name.to_string(),
            message: message.into(),
            details: JsonMap::new(),
            stage,
        }
    }

    pub fn fail(
        stage: PolicyStage,
        policy_name: &str,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            code: code.to_string(),
            policy_name: policy_name.to_string(),
            message: message.into(),
            details: JsonMap::new(),
            stage,
        }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Admission check. Depends only on `spec`.
pub fn evaluate_preflight(spec: &JobSpec) -> PolicyResult {
    const STAGE: PolicyStage = PolicyStage::Preflight;

    if let Some(result) = payload_bounds(spec) {
        return result;
    }

    for field in spec.job_type().required_fields() {
        let key = field.key();
        let value = match spec.params().get(key) {
            None | Some(Value::Null) => {
                return PolicyResult::fail(
                    STAGE,
                    "required_fields",
                    codes::MISSING_REQUIRED_FIELD,
                    format!("{} requires params.{key}", spec.job_type()),
                )
                .with_detail("field", json!(key));
            }
            Some(value) => value,
        };
        if !field_format_ok(*field, value) {
            return PolicyResult::fail(
                STAGE,
                "field_format",
                codes::INVALID_FORMAT,
                format!("params.{key} has an invalid format"),
            )
            .with_detail("field", json!(key))
            .with_detail("value", value.clone())
            .with_detail("expected", json!(field.expected_format()));
        }
    }

    PolicyResult::pass(STAGE, "admission", "admission checks passed")
        .with_detail("job_type", json!(spec.job_type().as_str()))
}

fn payload_bounds(spec: &JobSpec) -> Option<PolicyResult> {
    let checks = [
        ("params", spec.params(), MAX_PARAMS_BYTES),
        ("metadata", spec.metadata(), MAX_METADATA_BYTES),
    ];
    for (name, map, limit) in checks {
        let size = match serde_json::to_vec(map) {
            Ok(bytes) => bytes.len(),
            Err(err) => {
                return Some(
                    PolicyResult::fail(
                        PolicyStage::Preflight,
                        "payload_bounds",
                        codes::INVALID_PAYLOAD,
                        format!("{name} is not serializable: {err}"),
                    )
                    .with_detail("field", json!(name)),
                );
            }
        };
        if size > limit {
            return Some(
                PolicyResult::fail(
                    PolicyStage::Preflight,
                    "payload_bounds",
                    codes::INVALID_PAYLOAD,
                    format!("{name} exceeds {limit} bytes"),
                )
                .with_detail("field", json!(name))
                .with_detail("bytes", json!(size)),
            );
        }
    }
    None
}

fn field_format_ok(field: DomainField, value: &Value) -> bool {
    match field {
        DomainField::Season => value.as_str().is_some_and(is_valid_season),
        DomainField::Timeframe => match value {
            Value::Number(n) => n.as_u64().is_some_and(|v| v > 0),
            Value::String(s) => is_valid_timeframe(s),
            _ => false,
        },
    }
}

/// `YYYYQn`, n in 1..=4.
pub fn is_valid_season(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 6
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'Q'
        && (b'1'..=b'4').contains(&bytes[5])
}

/// Positive integer with an optional `m` or `h` suffix.
pub fn is_valid_timeframe(raw: &str) -> bool {
    let digits = raw
        .strip_suffix('m')
        .or_else(|| raw.strip_suffix('h'))
        .unwrap_or(raw);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.parse::<u64>().is_ok_and(|v| v > 0)
}

/// Evidence check after a worker finished. Reads declared outputs from
/// `result["outputs"]` and requires each to be an existing strict descendant
/// of `job_dir`.
pub fn evaluate_postflight(job_dir: &Path, result: &JsonMap) -> PolicyResult {
    const STAGE: PolicyStage = PolicyStage::Postflight;

    if !job_dir.is_dir() {
        return PolicyResult::fail(
            STAGE,
            "artifacts_dir",
            codes::ARTIFACTS_DIR_MISSING,
            format!("artifact directory is missing: {}", job_dir.display()),
        );
    }

    let declared = match result.get("outputs") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(path) => out.push(path.to_string()),
                    None => {
                        return PolicyResult::fail(
                            STAGE,
                            "declared_outputs",
                            codes::INVALID_DECLARED_OUTPUT,
                            "result.outputs must contain only path strings",
                        )
                        .with_detail("item", item.clone());
                    }
                }
            }
            out
        }
        Some(other) => {
            return PolicyResult::fail(
                STAGE,
                "declared_outputs",
                codes::INVALID_DECLARED_OUTPUT,
                "result.outputs must be an array of path strings",
            )
            .with_detail("outputs", other.clone());
        }
    };

    let mut approved = Vec::with_capacity(declared.len());
    for path in &declared {
        match resolve_contained(job_dir, path) {
            Ok(resolved) => approved.push(json!(resolved.to_string_lossy())),
            Err(ContainmentError::Missing(_)) => {
                return PolicyResult::fail(
                    STAGE,
                    "declared_outputs",
                    codes::DECLARED_OUTPUT_MISSING,
                    format!("declared output does not exist: {path}"),
                )
                .with_detail("path", json!(path));
            }
            Err(ContainmentError::RootUnavailable(message)) => {
                return PolicyResult::fail(
                    STAGE,
                    "artifacts_dir",
                    codes::ARTIFACTS_DIR_MISSING,
                    message,
                );
            }
            Err(err) => {
                return PolicyResult::fail(
                    STAGE,
                    "containment",
                    codes::PATH_VIOLATION,
                    err.to_string(),
                )
                .with_detail("path", json!(path));
            }
        }
    }

    PolicyResult::pass(STAGE, "containment", "declared outputs are contained")
        .with_detail("approved_paths", Value::Array(approved))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Pass,
    Fail,
}

/// One persisted evaluation inside `policy_check.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheckEntry {
    pub status: OverallStatus,
    pub code: String,
    pub policy_name: String,
    pub passed: bool,
    pub message: String,
    pub details: JsonMap,
    pub stage: PolicyStage,
    pub checked_at: String,
}

impl PolicyCheckEntry {
    pub fn from_result(result: &PolicyResult, checked_at: &str) -> Self {
        Self {
            status: if result.allowed {
                OverallStatus::Pass
            } else {
                OverallStatus::Fail
            },
            code: result.code.clone(),
            policy_name: result.policy_name.clone(),
            passed: result.allowed,
            message: result.message.clone(),
            details: result.details.clone(),
            stage: result.stage,
            checked_at: checked_at.to_string(),
        }
    }
}

/// All policy evaluations recorded for one job. A write replaces whole stages;
/// `created_utc` is fixed by the first write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheckBundle {
    pub schema_version: u32,
    pub job_id: String,
    pub job_type: String,
    pub created_utc: String,
    pub overall_status: OverallStatus,
    pub preflight: Vec<PolicyCheckEntry>,
    pub postflight: Vec<PolicyCheckEntry>,
    pub final_reason: Option<String>,
}

impl PolicyCheckBundle {
    pub fn new(job_id: &str, job_type: &str, created_utc: &str) -> Self {
        Self {
            schema_version: POLICY_CHECK_SCHEMA_VERSION,
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            created_utc: created_utc.to_string(),
            overall_status: OverallStatus::Pass,
            preflight: Vec::new(),
            postflight: Vec::new(),
            final_reason: None,
        }
    }

    /// Appends `entry` to the list for its stage unless an identical entry is
    /// already present, then recomputes the overall status.
    pub fn record(&mut self, entry: PolicyCheckEntry) {
        let list = match entry.stage {
            PolicyStage::Preflight => &mut self.preflight,
            PolicyStage::Postflight => &mut self.postflight,
        };
        if !list.contains(&entry) {
            list.push(entry);
        }
        self.overall_status = self.compute_overall_status();
    }

    pub fn compute_overall_status(&self) -> OverallStatus {
        let any_fail = self
            .preflight
            .iter()
            .chain(self.postflight.iter())
            .any(|entry| !entry.passed);
        if any_fail {
            OverallStatus::Fail
        } else {
            OverallStatus::Pass
        }
    }
}

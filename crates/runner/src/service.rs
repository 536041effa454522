#![forbid(unsafe_code)]

use crate::artifacts::{ArtifactWriter, PolicyCheckUpdate, StateSnapshot};
use crate::error::{ArtifactError, SubmitError};
use crate::registry::HandlerRegistry;
use crate::runtime_helpers::utc_now_rfc3339;
use jv_core::ids::JobId;
use jv_core::policy::codes;
use jv_core::{
    JobSpec, JobState, JobType, JsonMap, PolicyCheckBundle, PolicyCheckEntry, PolicyResult,
    PolicyStage, evaluate_preflight,
};
use jv_storage::{AbortOutcome, JobRow, JobsListRequest, RejectedJobRequest, SqliteStore, StoreError};
use serde_json::json;
use std::path::{Path, PathBuf};

const UNSPECIFIED_JOB_TYPE: &str = "UNSPECIFIED";

/// Client-facing submission and inspection API.
pub struct JobService<'r> {
    store: SqliteStore,
    artifacts_root: PathBuf,
    registry: &'r HandlerRegistry,
}

impl<'r> JobService<'r> {
    pub fn new(store: SqliteStore, artifacts_root: PathBuf, registry: &'r HandlerRegistry) -> Self {
        Self {
            store,
            artifacts_root,
            registry,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn artifacts_root(&self) -> &Path {
        &self.artifacts_root
    }

    /// Admits a job as QUEUED, or records it as REJECTED and reports why.
    /// Checks run in order: job type, handler presence, preflight policy,
    /// handler parameter validation.
    pub fn submit(
        &mut self,
        job_type: &str,
        params: JsonMap,
        metadata: JsonMap,
    ) -> Result<String, SubmitError> {
        let parsed = match JobType::parse(job_type) {
            Ok(parsed) => parsed,
            Err(err) => {
                let recorded = match job_type.trim() {
                    "" => UNSPECIFIED_JOB_TYPE,
                    raw => raw,
                };
                let result = PolicyResult::fail(
                    PolicyStage::Preflight,
                    "job_type",
                    codes::UNKNOWN_JOB_TYPE,
                    err.to_string(),
                )
                .with_detail("job_type", json!(job_type));
                return self.reject(recorded, params, metadata, result);
            }
        };

        let Some(handler) = self.registry.get_handler(parsed) else {
            let result = PolicyResult::fail(
                PolicyStage::Preflight,
                "handler_registry",
                codes::UNKNOWN_JOB_TYPE,
                format!("no handler registered for {parsed}"),
            )
            .with_detail("job_type", json!(parsed.as_str()));
            return self.reject(parsed.as_str(), params, metadata, result);
        };

        let spec = JobSpec::new(parsed, params, metadata);
        let preflight = evaluate_preflight(&spec);
        if !preflight.allowed {
            let (params, metadata) = (spec.params().clone(), spec.metadata().clone());
            return self.reject(parsed.as_str(), params, metadata, preflight);
        }

        if let Err(err) = handler.validate_params(spec.params()) {
            let mut result = PolicyResult::fail(
                PolicyStage::Preflight,
                "handler_params",
                codes::VALIDATION_ERROR,
                err.message,
            );
            if let Some(field) = err.field {
                result = result.with_detail("field", json!(field));
            }
            let (params, metadata) = (spec.params().clone(), spec.metadata().clone());
            return self.reject(parsed.as_str(), params, metadata, result);
        }

        // Admission evidence lands before the row is visible to a supervisor.
        let job_id = JobId::generate();
        if let Err(err) = self.write_admission_evidence(job_id.as_str(), &spec, &preflight) {
            tracing::warn!(job_id = %job_id, error = %err, "admission evidence write failed");
        }
        Ok(self.store.submit_job_with_id(job_id, &spec)?)
    }

    fn write_admission_evidence(
        &self,
        job_id: &str,
        spec: &JobSpec,
        preflight: &PolicyResult,
    ) -> Result<(), ArtifactError> {
        let writer = ArtifactWriter::for_job(&self.artifacts_root, job_id)?;
        let now = utc_now_rfc3339();
        writer.write_policy_check(PolicyCheckUpdate {
            job_type: spec.job_type().as_str().to_string(),
            created_utc: now.clone(),
            preflight: Some(vec![PolicyCheckEntry::from_result(preflight, &now)]),
            postflight: None,
            final_reason: None,
        })?;
        Ok(())
    }

    fn reject(
        &mut self,
        job_type: &str,
        params: JsonMap,
        metadata: JsonMap,
        result: PolicyResult,
    ) -> Result<String, SubmitError> {
        let job_id = self.store.submit_rejected_job(RejectedJobRequest {
            job_type: job_type.to_string(),
            params,
            metadata,
            reason: result.message.clone(),
            code: result.code.clone(),
            details: result.details.clone(),
            stage: result.stage,
        })?;

        if let Err(err) = self.write_rejection_evidence(&job_id, job_type, &result) {
            tracing::warn!(job_id = %job_id, error = %err, "rejection evidence write failed");
        }
        Err(SubmitError::Rejected {
            code: result.code,
            message: result.message,
            job_id,
        })
    }

    fn write_rejection_evidence(
        &self,
        job_id: &str,
        job_type: &str,
        result: &PolicyResult,
    ) -> Result<(), ArtifactError> {
        let writer = ArtifactWriter::for_job(&self.artifacts_root, job_id)?;
        let reason = format!("{}: {}", result.code, result.message);
        writer.write_state(&StateSnapshot::new(JobState::Rejected, 0.0).with_reason(reason.as_str()))?;
        let now = utc_now_rfc3339();
        writer.write_policy_check(PolicyCheckUpdate {
            job_type: job_type.to_string(),
            created_utc: now.clone(),
            preflight: Some(vec![PolicyCheckEntry::from_result(result, &now)]),
            postflight: None,
            final_reason: Some(format!("REJECTED: {reason}")),
        })?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRow>, StoreError> {
        self.store.get_job_row(job_id)
    }

    /// Newest first.
    pub fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRow>, StoreError> {
        self.store.list_jobs(JobsListRequest { state, limit: None })
    }

    pub fn request_abort(&mut self, job_id: &str) -> Result<AbortOutcome, StoreError> {
        self.store.request_abort(job_id)
    }

    /// `None` for malformed ids and jobs without a bundle yet.
    pub fn policy_check(&self, job_id: &str) -> Result<Option<PolicyCheckBundle>, ArtifactError> {
        let Ok(writer) = ArtifactWriter::for_job(&self.artifacts_root, job_id.trim()) else {
            return Ok(None);
        };
        writer.read_policy_check()
    }
}

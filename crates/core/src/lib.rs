#![forbid(unsafe_code)]

pub mod containment;
pub mod job;
pub mod policy;

pub use containment::{ContainmentError, resolve_contained};
pub use job::{DomainField, JobSpec, JobState, JobStateError, JobType, JobTypeError, JsonMap};
pub use policy::{
    OverallStatus, POLICY_CHECK_SCHEMA_VERSION, PolicyCheckBundle, PolicyCheckEntry, PolicyResult,
    PolicyStage, evaluate_postflight, evaluate_preflight,
};

pub mod ids {
    const JOB_ID_PREFIX: &str = "JOB-";
    const MAX_JOB_ID_LEN: usize = 64;

    /// Identifier of one job record. Doubles as the name of the job's artifact
    /// directory, so the accepted alphabet never contains separators or dots.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct JobId(String);

    impl JobId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        /// Fresh id; uuid v7 keeps ids unique across processes and roughly time-ordered.
        pub fn generate() -> Self {
            Self(format!("{JOB_ID_PREFIX}{}", uuid::Uuid::now_v7().simple()))
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, JobIdError> {
            let value = value.into();
            validate_job_id(&value)?;
            Ok(Self(value))
        }
    }

    impl std::fmt::Display for JobId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
    pub enum JobIdError {
        #[error("job id must not be empty")]
        Empty,
        #[error("job id is too long")]
        TooLong,
        #[error("job id must start with JOB-")]
        MissingPrefix,
        #[error("job id contains invalid character {ch:?} at {index}")]
        InvalidChar { ch: char, index: usize },
    }

    fn validate_job_id(value: &str) -> Result<(), JobIdError> {
        if value.is_empty() {
            return Err(JobIdError::Empty);
        }
        if value.len() > MAX_JOB_ID_LEN {
            return Err(JobIdError::TooLong);
        }
        let Some(rest) = value.strip_prefix(JOB_ID_PREFIX) else {
            return Err(JobIdError::MissingPrefix);
        };
        if rest.is_empty() {
            return Err(JobIdError::Empty);
        }
        for (index, ch) in rest.char_indices() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-') {
                continue;
            }
            return Err(JobIdError::InvalidChar {
                ch,
                index: index + JOB_ID_PREFIX.len(),
            });
        }
        Ok(())
    }

}

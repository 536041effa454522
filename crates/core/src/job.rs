#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Closed set of job types the supervisor admits. Handlers are looked up by
/// this tag; anything outside the set is rejected before it reaches a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Ping,
    BuildData,
    RunResearch,
    BuildPortfolio,
}

/// Params a job type cannot be admitted without.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainField {
    Season,
    Timeframe,
}

impl DomainField {
    pub fn key(self) -> &'static str {
        match self {
            Self::Season => "season",
            Self::Timeframe => "timeframe",
        }
    }

    pub fn expected_format(self) -> &'static str {
        match self {
            Self::Season => "YYYYQn with n in 1..=4 (e.g. 2024Q3)",
            Self::Timeframe => "positive integer, optionally suffixed m or h (e.g. 15m, 4h)",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum JobTypeError {
    #[error("job_type must not be empty")]
    Empty,
    #[error("Unknown job_type: {0}")]
    Unknown(String),
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Ping,
        JobType::BuildData,
        JobType::RunResearch,
        JobType::BuildPortfolio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::BuildData => "BUILD_DATA",
            Self::RunResearch => "RUN_RESEARCH",
            Self::BuildPortfolio => "BUILD_PORTFOLIO",
        }
    }

    /// Accepts canonical names and known aliases, case-insensitively;
    /// `-` and spaces fold to `_`.
    pub fn parse(raw: &str) -> Result<Self, JobTypeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(JobTypeError::Empty);
        }
        let folded = trimmed
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect::<String>();
        match folded.as_str() {
            "PING" | "SLEEP" | "NOOP" | "SMOKE" => Ok(Self::Ping),
            "BUILD_DATA" | "DATA_BUILD" | "PREPARE_DATA" => Ok(Self::BuildData),
            "RUN_RESEARCH" | "RESEARCH" => Ok(Self::RunResearch),
            "BUILD_PORTFOLIO" | "PORTFOLIO" => Ok(Self::BuildPortfolio),
            _ => Err(JobTypeError::Unknown(trimmed.to_string())),
        }
    }

    pub fn required_fields(self) -> &'static [DomainField] {
        match self {
            Self::Ping => &[],
            Self::BuildData => &[DomainField::Timeframe],
            Self::RunResearch => &[DomainField::Season, DomainField::Timeframe],
            Self::BuildPortfolio => &[DomainField::Season],
        }
    }
}

impl FromStr for JobType {
    type Err = JobTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of requested work. Built once at submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    job_type: JobType,
    #[serde(default)]
    params: JsonMap,
    #[serde(default)]
    metadata: JsonMap,
}

impl JobSpec {
    pub fn new(job_type: JobType, params: JsonMap, metadata: JsonMap) -> Self {
        Self {
            job_type,
            params,
            metadata,
        }
    }

    /// Normalizes `job_type` through [`JobType::parse`].
    pub fn from_raw(
        job_type: &str,
        params: JsonMap,
        metadata: JsonMap,
    ) -> Result<Self, JobTypeError> {
        Ok(Self::new(JobType::parse(job_type)?, params, metadata))
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn params(&self) -> &JsonMap {
        &self.params
    }

    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Rejected,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid job state: {0}")]
pub struct JobStateError(pub String);

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Rejected,
        JobState::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Rejected => "REJECTED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, JobStateError> {
        let upper = raw.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| JobStateError(raw.trim().to_string()))
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Rejected | Self::Aborted
        )
    }

    /// Legal edges of the job state machine. Terminal states have none.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Rejected),
            Self::Running => matches!(next, Self::Succeeded | Self::Failed | Self::Aborted),
            Self::Succeeded | Self::Failed | Self::Rejected | Self::Aborted => false,
        }
    }
}

impl FromStr for JobState {
    type Err = JobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_aliases_normalize_to_canonical() {
        assert_eq!(JobType::parse("ping"), Ok(JobType::Ping));
        assert_eq!(JobType::parse(" sleep "), Ok(JobType::Ping));
        assert_eq!(JobType::parse("data-build"), Ok(JobType::BuildData));
        assert_eq!(JobType::parse("Research"), Ok(JobType::RunResearch));
        assert_eq!(JobType::parse("build portfolio"), Ok(JobType::BuildPortfolio));
    }

    #[test]
    fn unknown_job_type_is_reported_verbatim() {
        let err = JobType::parse("NON_EXISTENT_TYPE").expect_err("unknown type");
        assert_eq!(err, JobTypeError::Unknown("NON_EXISTENT_TYPE".to_string()));
        assert!(err.to_string().contains("Unknown job_type"));
        assert_eq!(JobType::parse("   "), Err(JobTypeError::Empty));
    }

    #[test]
    fn state_machine_edges() {
        use JobState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Rejected));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(Aborted));
        assert!(!Running.can_transition_to(Rejected));
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Succeeded, Failed, Rejected, Aborted] {
            assert!(terminal.is_terminal());
            for next in JobState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn spec_serializes_with_canonical_type() {
        let mut params = JsonMap::new();
        params.insert("season".to_string(), serde_json::json!("2024Q1"));
        let spec = JobSpec::from_raw("research", params, JsonMap::new()).expect("spec");
        let value = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(value["job_type"], "RUN_RESEARCH");
        assert_eq!(value["params"]["season"], "2024Q1");
    }
}

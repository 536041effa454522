#![forbid(unsafe_code)]

use crate::context::ExecutionContext;
use crate::error::{Fault, RegistryError, ValidationError};
use crate::handlers::PingHandler;
use jv_core::{JobType, JsonMap};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Business logic for one job type.
///
/// `validate_params` runs at submission and again inside the worker before
/// `execute`. `execute` returns the result object persisted as `result.json`;
/// a handler that honours an abort returns `{"aborted": true, ...}`.
pub trait JobHandler: Send + Sync {
    fn validate_params(&self, params: &JsonMap) -> Result<(), ValidationError>;

    fn execute(
        &self,
        params: &JsonMap,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<JsonMap, Fault>;
}

/// Job type -> handler. Built once per process and passed by reference.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<JobType, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last registration for a type wins.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(job_type, handler).is_some() {
            tracing::debug!(job_type = %job_type, "handler replaced");
        }
    }

    /// String-keyed registration; the identifier goes through the same
    /// alias normalization as submissions.
    pub fn register_handler(
        &mut self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<JobType, RegistryError> {
        let job_type = JobType::parse(job_type).map_err(|err| match err {
            jv_core::JobTypeError::Empty => RegistryError::EmptyJobType,
            jv_core::JobTypeError::Unknown(raw) => RegistryError::UnknownJobType(raw),
        })?;
        self.register(job_type, handler);
        Ok(job_type)
    }

    pub fn get_handler(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Handlers shipped with the engine. Domain job types are registered by the
/// embedding application.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::Ping, Arc::new(PingHandler));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagged(&'static str);

    impl JobHandler for Tagged {
        fn validate_params(&self, _params: &JsonMap) -> Result<(), ValidationError> {
            Err(ValidationError::new(self.0))
        }

        fn execute(
            &self,
            _params: &JsonMap,
            _ctx: &mut ExecutionContext<'_>,
        ) -> Result<JsonMap, Fault> {
            Ok(JsonMap::new())
        }
    }

    fn tag_of(registry: &HandlerRegistry, job_type: JobType) -> String {
        let handler = registry.get_handler(job_type).expect("registered");
        handler
            .validate_params(&JsonMap::new())
            .expect_err("tagged handler always refuses")
            .message
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::BuildData, Arc::new(Tagged("first")));
        registry
            .register_handler("data-build", Arc::new(Tagged("second")))
            .expect("alias accepted");
        assert_eq!(tag_of(&registry, JobType::BuildData), "second");
        assert_eq!(registry.registered_types(), vec![JobType::BuildData]);
    }

    #[test]
    fn invalid_identifiers_are_refused() {
        let mut registry = HandlerRegistry::new();
        assert_eq!(
            registry
                .register_handler("  ", Arc::new(Tagged("x")))
                .expect_err("empty"),
            RegistryError::EmptyJobType
        );
        assert_eq!(
            registry
                .register_handler("TELEPORT", Arc::new(Tagged("x")))
                .expect_err("unknown"),
            RegistryError::UnknownJobType("TELEPORT".to_string())
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn builtin_registry_has_ping_only() {
        let registry = builtin_registry();
        assert_eq!(registry.registered_types(), vec![JobType::Ping]);
        assert!(registry.get_handler(JobType::RunResearch).is_none());
    }
}

#![forbid(unsafe_code)]

//! Worker-side and supervisor-side halves of the job engine.
//!
//! A job flows `JobService::submit` -> store (QUEUED) -> [`Supervisor`] ->
//! a spawned `jv_runner worker` process running [`bootstrap::run_worker`] ->
//! handler via [`HandlerRegistry`] -> evidence via [`ArtifactWriter`].

pub mod artifacts;
pub mod bootstrap;
pub mod context;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod runtime_helpers;
pub mod service;
pub mod supervisor;

pub use artifacts::{ArtifactWriter, PolicyCheckUpdate, RunOutcome, StateSnapshot};
pub use bootstrap::{WorkerArgs, WorkerExit, run_worker};
pub use context::ExecutionContext;
pub use error::{
    ArtifactError, BootstrapError, ContextError, Fault, RegistryError, SubmitError,
    SupervisorError, ValidationError,
};
pub use registry::{HandlerRegistry, JobHandler, builtin_registry};
pub use service::JobService;
pub use supervisor::{
    ProcessLauncher, Supervisor, SupervisorConfig, TickReport, WorkerHandle, WorkerLauncher,
};

#![forbid(unsafe_code)]

use clap::{Parser, Subcommand, ValueEnum};
use jv_core::{JobState, JsonMap};
use jv_runner::{
    JobService, ProcessLauncher, SubmitError, Supervisor, SupervisorConfig, WorkerArgs,
    builtin_registry, run_worker,
};
use jv_storage::{SqliteStore, StoreConfig};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "jv_runner=info,jv_storage=info";

#[derive(Parser, Debug)]
#[command(name = "jv_runner")]
#[command(version)]
#[command(about = "Local job supervisor: admits, runs and records typed jobs")]
#[command(propagate_version = true)]
struct Cli {
    /// SQLite job store shared by supervisor, workers and clients
    #[arg(long, env = "JV_DB", default_value = "jobvisor/jobs.db", global = true)]
    db: PathBuf,

    /// Root of the per-job evidence directories
    #[arg(
        long,
        env = "JV_ARTIFACTS_ROOT",
        default_value = "jobvisor/artifacts",
        global = true
    )]
    artifacts_root: PathBuf,

    #[arg(long, env = "JV_LOG_FORMAT", value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor loop
    Supervise(SuperviseArgs),

    /// Execute one job (spawned by the supervisor)
    Worker {
        #[arg(long)]
        job_id: String,
    },

    /// Submit a job; prints its id, or the rejection
    Submit {
        #[arg(long)]
        job_type: String,

        /// Params as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Metadata as a JSON object
        #[arg(long, default_value = "{}")]
        metadata: String,
    },

    /// Show one job record
    Get { job_id: String },

    /// List jobs, newest first
    List {
        #[arg(long)]
        state: Option<String>,
    },

    /// Request an abort (advisory)
    Abort { job_id: String },

    /// Show a job's policy_check.json
    PolicyCheck { job_id: String },
}

#[derive(Parser, Debug)]
struct SuperviseArgs {
    #[arg(long, default_value = "2")]
    max_workers: usize,

    #[arg(long, default_value = "200")]
    poll_ms: u64,

    /// Kill workers silent for this many seconds
    #[arg(long)]
    stall_timeout_s: Option<u64>,

    /// Force-stop jobs this many seconds after an abort request
    #[arg(long)]
    abort_grace_s: Option<u64>,

    #[arg(long, default_value = "10")]
    shutdown_grace_s: u64,

    /// Run a single tick
    #[arg(long, conflicts_with_all = ["max_ticks", "until_idle"])]
    once: bool,

    #[arg(long)]
    max_ticks: Option<u64>,

    /// Exit once nothing is queued or running
    #[arg(long)]
    until_idle: bool,

    #[arg(long, default_value = "3600", requires = "until_idle")]
    idle_timeout_s: u64,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn parse_object(flag: &str, raw: &str) -> Result<JsonMap, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(format!("--{flag} must be a JSON object")),
        Err(err) => Err(format!("--{flag} is not valid JSON: {err}")),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("failed to render output: {err}"),
    }
}

fn open_store(cli: &Cli) -> Result<SqliteStore, ExitCode> {
    SqliteStore::open(&cli.db, StoreConfig::default()).map_err(|err| {
        tracing::error!(db = %cli.db.display(), error = %err, "cannot open job store");
        ExitCode::FAILURE
    })
}

/// First SIGINT/SIGTERM asks `Supervisor::run` to shut down gracefully; a
/// second one while shutdown is pending exits immediately.
#[cfg(unix)]
fn register_stop_signals(stop: &Arc<AtomicBool>) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::flag;

    for signal in [SIGINT, SIGTERM] {
        let registered = flag::register_conditional_shutdown(signal, 1, Arc::clone(stop))
            .and_then(|_| flag::register(signal, Arc::clone(stop)));
        if let Err(err) = registered {
            tracing::warn!(signal, error = %err, "cannot install stop handler");
        }
    }
}

#[cfg(not(unix))]
fn register_stop_signals(_stop: &Arc<AtomicBool>) {}

fn supervise(cli: &Cli, args: &SuperviseArgs) -> Result<(), ExitCode> {
    let store = open_store(cli)?;
    let launcher = ProcessLauncher::current_exe(cli.db.clone(), cli.artifacts_root.clone())
        .map_err(|err| {
            tracing::error!(error = %err, "cannot resolve worker executable");
            ExitCode::FAILURE
        })?;

    let mut config = SupervisorConfig::new(cli.db.clone(), cli.artifacts_root.clone());
    config.max_workers = args.max_workers.max(1);
    config.poll_interval = Duration::from_millis(args.poll_ms.max(1));
    config.stall_timeout = args.stall_timeout_s.map(Duration::from_secs);
    config.abort_grace = args.abort_grace_s.map(Duration::from_secs);
    config.shutdown_grace = Duration::from_secs(args.shutdown_grace_s);

    let mut supervisor = Supervisor::new(config, store, launcher);
    let outcome = if args.until_idle {
        supervisor.recover_orphans().and_then(|_| {
            let idle = supervisor.run_until_idle(Duration::from_secs(args.idle_timeout_s))?;
            if !idle {
                tracing::warn!("idle timeout reached with work outstanding");
            }
            let grace = supervisor.config().shutdown_grace;
            supervisor.shutdown(grace)
        })
    } else {
        let stop = Arc::new(AtomicBool::new(false));
        register_stop_signals(&stop);
        let max_ticks = if args.once { Some(1) } else { args.max_ticks };
        supervisor.run(&stop, max_ticks)
    };
    outcome.map_err(|err| {
        tracing::error!(error = %err, "supervisor failed");
        ExitCode::FAILURE
    })
}

fn run(cli: &Cli) -> Result<ExitCode, ExitCode> {
    let registry = builtin_registry();
    match &cli.command {
        Command::Supervise(args) => {
            supervise(cli, args)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Worker { job_id } => {
            let args = WorkerArgs {
                job_id: job_id.clone(),
                db_path: cli.db.clone(),
                artifacts_root: cli.artifacts_root.clone(),
                store: StoreConfig::default(),
            };
            match run_worker(&args, &registry) {
                Ok(exit) => {
                    tracing::info!(job_id = %job_id, outcome = ?exit, "worker exiting");
                    Ok(ExitCode::from(exit.exit_code()))
                }
                Err(err) => {
                    tracing::error!(job_id = %job_id, error = %err, "worker failed");
                    Err(ExitCode::FAILURE)
                }
            }
        }
        Command::Submit {
            job_type,
            params,
            metadata,
        } => {
            let params = parse_object("params", params).map_err(|err| {
                eprintln!("{err}");
                ExitCode::from(2)
            })?;
            let metadata = parse_object("metadata", metadata).map_err(|err| {
                eprintln!("{err}");
                ExitCode::from(2)
            })?;
            let mut service = JobService::new(open_store(cli)?, cli.artifacts_root.clone(), &registry);
            match service.submit(job_type, params, metadata) {
                Ok(job_id) => {
                    print_json(&json!({ "job_id": job_id, "state": JobState::Queued }));
                    Ok(ExitCode::SUCCESS)
                }
                Err(SubmitError::Rejected {
                    code,
                    message,
                    job_id,
                }) => {
                    print_json(&json!({
                        "job_id": job_id,
                        "state": JobState::Rejected,
                        "code": code,
                        "message": message,
                    }));
                    Ok(ExitCode::from(2))
                }
                Err(err) => {
                    tracing::error!(error = %err, "submit failed");
                    Err(ExitCode::FAILURE)
                }
            }
        }
        Command::Get { job_id } => {
            let service = JobService::new(open_store(cli)?, cli.artifacts_root.clone(), &registry);
            match service.get_job(job_id) {
                Ok(Some(row)) => {
                    print_json(&json!(row));
                    Ok(ExitCode::SUCCESS)
                }
                Ok(None) => {
                    eprintln!("unknown job: {job_id}");
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => {
                    tracing::error!(error = %err, "get failed");
                    Err(ExitCode::FAILURE)
                }
            }
        }
        Command::List { state } => {
            let state = match state.as_deref().map(JobState::parse).transpose() {
                Ok(state) => state,
                Err(err) => {
                    eprintln!("{err}");
                    return Ok(ExitCode::from(2));
                }
            };
            let service = JobService::new(open_store(cli)?, cli.artifacts_root.clone(), &registry);
            let rows = service.list_jobs(state).map_err(|err| {
                tracing::error!(error = %err, "list failed");
                ExitCode::FAILURE
            })?;
            print_json(&json!(rows));
            Ok(ExitCode::SUCCESS)
        }
        Command::Abort { job_id } => {
            let mut service =
                JobService::new(open_store(cli)?, cli.artifacts_root.clone(), &registry);
            let outcome = service.request_abort(job_id).map_err(|err| {
                tracing::error!(error = %err, "abort failed");
                ExitCode::FAILURE
            })?;
            print_json(&json!({ "job_id": job_id, "outcome": format!("{outcome:?}") }));
            Ok(ExitCode::SUCCESS)
        }
        Command::PolicyCheck { job_id } => {
            let service = JobService::new(open_store(cli)?, cli.artifacts_root.clone(), &registry);
            match service.policy_check(job_id) {
                Ok(Some(bundle)) => {
                    print_json(&json!(bundle));
                    Ok(ExitCode::SUCCESS)
                }
                Ok(None) => {
                    eprintln!("no policy_check.json for {job_id}");
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => {
                    tracing::error!(error = %err, "policy_check read failed");
                    Err(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    match run(&cli) {
        Ok(code) | Err(code) => code,
    }
}

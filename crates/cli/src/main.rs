mod backend;
mod serve;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use leadrun_core::run_id::{self, NormalizeOptions};
use leadrun_engine::{
    DriverError, IssueRecorder, OrchestratorConfig, RunReport, RunRequest,
    SmartResumeDriver, SystemClock,
};
use leadrun_storage::{IssueStatus, JobStatus, OrchestratorStorage, ProductionIssueRecord};
use tracing_subscriber::EnvFilter;

use self::backend::{BackendKind, SetupError};

const EXIT_FAILURE: i32 = 1;
const EXIT_CONTENTION: i32 = 2;
const EXIT_CONFIG: i32 = 3;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IssueStatusArg {
    Open,
    Fixed,
}

impl From<IssueStatusArg> for IssueStatus {
    fn from(arg: IssueStatusArg) -> Self {
        match arg {
            IssueStatusArg::Open => IssueStatus::Open,
            IssueStatusArg::Fixed => IssueStatus::Fixed,
        }
    }
}

/// Multi-tenant lead pipeline orchestrator.
#[derive(Parser)]
#[command(name = "leadrun", version, about = "Multi-tenant lead pipeline orchestrator")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Where run records are kept
    #[arg(long, global = true, env = "LEADRUN_BACKEND", default_value = "airtable", value_enum)]
    backend: BackendKind,

    /// JSON file of clients to load into the memory backend
    #[arg(long, global = true)]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP trigger/status/reset service
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "3000")]
        port: u16,
        /// Base URL the stage endpoints are reached on (overrides API_PUBLIC_BASE_URL)
        #[arg(long)]
        public_base_url: Option<String>,
        /// Accept every stage locally instead of calling the stage endpoints
        #[arg(long)]
        dry_run: bool,
    },

    /// Run smart resume for one stream and wait for it to finish
    Run {
        /// Stream to process (defaults to BATCH_PROCESSING_STREAM, then 1)
        #[arg(long, allow_negative_numbers = true)]
        stream: Option<i64>,
        /// Only process this client
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        lead_scoring_limit: Option<u32>,
        #[arg(long)]
        post_scoring_limit: Option<u32>,
        /// Resume an existing base run id instead of minting one
        #[arg(long)]
        run_id: Option<String>,
        /// Base URL the stage endpoints are reached on (overrides API_PUBLIC_BASE_URL)
        #[arg(long)]
        public_base_url: Option<String>,
        /// Accept every stage locally instead of calling the stage endpoints
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and resolve production issues
    Issues {
        #[command(subcommand)]
        command: IssueCommands,
    },

    /// Mint and check run identifiers
    RunId {
        #[command(subcommand)]
        command: RunIdCommands,
    },
}

#[derive(Subcommand)]
enum IssueCommands {
    /// List production issues
    List {
        #[arg(long, value_enum)]
        status: Option<IssueStatusArg>,
    },
    /// Mark an open issue as fixed
    Fix {
        /// Record id of the issue
        record_id: String,
        /// Commit that resolved it
        #[arg(long)]
        commit: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunIdCommands {
    /// Print a fresh base run id
    Mint,
    /// Validate a run id and print its canonical form
    Normalize {
        rid: String,
        /// Print the base form even for compound ids
        #[arg(long)]
        strip_client: bool,
    },
}

/// Options shared by every subcommand.
struct Globals {
    output: OutputFormat,
    quiet: bool,
    backend: BackendKind,
    seed: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let globals = Globals {
        output: cli.output,
        quiet: cli.quiet,
        backend: cli.backend,
        seed: cli.seed,
    };

    match cli.command {
        Commands::Serve {
            port,
            public_base_url,
            dry_run,
        } => cmd_serve(&globals, port, public_base_url, dry_run),
        Commands::Run {
            stream,
            client,
            lead_scoring_limit,
            post_scoring_limit,
            run_id,
            public_base_url,
            dry_run,
        } => {
            let request = RunRequest {
                stream,
                client_filter: client,
                lead_scoring_limit,
                post_scoring_limit,
                run_id,
            };
            cmd_run(&globals, request, public_base_url, dry_run);
        }
        Commands::Issues { command } => cmd_issues(&globals, command),
        Commands::RunId { command } => cmd_run_id(&globals, command),
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_serve(globals: &Globals, port: u16, public_base_url: Option<String>, dry_run: bool) {
    let config = load_config(globals, public_base_url);
    let secret = match config.require_webhook_secret() {
        Ok(s) => s.to_string(),
        Err(e) => exit_with(EXIT_CONFIG, &e.to_string(), globals),
    };
    let driver = build_driver(globals, config, dry_run);

    let rt = runtime(globals);
    if let Err(e) = rt.block_on(serve::start_server(port, driver, secret)) {
        exit_with(EXIT_FAILURE, &format!("server error: {}", e), globals);
    }
}

fn cmd_run(globals: &Globals, request: RunRequest, public_base_url: Option<String>, dry_run: bool) {
    let config = load_config(globals, public_base_url);
    let driver = build_driver(globals, config, dry_run);

    let rt = runtime(globals);
    match rt.block_on(driver.run(request)) {
        Ok(report) => {
            print_report(&report, globals.output);
            if report.status == JobStatus::Failed {
                process::exit(EXIT_FAILURE);
            }
        }
        Err(e) => exit_with(driver_exit_code(&e), &e.to_string(), globals),
    }
}

fn cmd_issues(globals: &Globals, command: IssueCommands) {
    let config = load_config(globals, None);
    let storage = open_storage(globals, &config);
    let recorder = IssueRecorder::new(storage, Arc::new(SystemClock));
    let rt = runtime(globals);

    match command {
        IssueCommands::List { status } => {
            match rt.block_on(recorder.list(status.map(IssueStatus::from))) {
                Ok(issues) => print_issues(&issues, globals.output),
                Err(e) => exit_with(EXIT_FAILURE, &e.to_string(), globals),
            }
        }
        IssueCommands::Fix {
            record_id,
            commit,
            notes,
        } => {
            let result = rt.block_on(recorder.mark_fixed(&record_id, &commit, notes.as_deref()));
            match result {
                Ok(issue) => match globals.output {
                    OutputFormat::Json => print_json(&issue),
                    OutputFormat::Text => {
                        println!("{} marked FIXED by {}", issue.record_id, commit);
                    }
                },
                Err(e) => exit_with(EXIT_FAILURE, &e.to_string(), globals),
            }
        }
    }
}

fn cmd_run_id(globals: &Globals, command: RunIdCommands) {
    let rid = match command {
        RunIdCommands::Mint => run_id::mint(),
        RunIdCommands::Normalize { rid, strip_client } => {
            match run_id::normalize(&rid, NormalizeOptions { strip_client }) {
                Some(normalized) => normalized,
                None => exit_with(
                    EXIT_FAILURE,
                    &format!("unrecognised run id '{}'", rid),
                    globals,
                ),
            }
        }
    };
    match globals.output {
        OutputFormat::Json => println!("{}", serde_json::json!({ "runId": rid })),
        OutputFormat::Text => println!("{}", rid),
    }
}

fn load_config(globals: &Globals, public_base_url: Option<String>) -> OrchestratorConfig {
    let mut config = match OrchestratorConfig::from_env() {
        Ok(c) => c,
        Err(e) => exit_with(EXIT_CONFIG, &e.to_string(), globals),
    };
    if let Some(url) = public_base_url {
        config.public_base_url = Some(url);
    }
    config
}

fn open_storage(globals: &Globals, config: &OrchestratorConfig) -> Arc<dyn OrchestratorStorage> {
    match backend::open_storage(globals.backend, globals.seed.as_deref(), config) {
        Ok(storage) => storage,
        Err(e) => exit_with(setup_exit_code(&e), &e.to_string(), globals),
    }
}

fn build_driver(globals: &Globals, config: OrchestratorConfig, dry_run: bool) -> SmartResumeDriver {
    let storage = open_storage(globals, &config);
    let stages = match backend::stage_invoker(&config, dry_run) {
        Ok(stages) => stages,
        Err(e) => exit_with(EXIT_CONFIG, &e.to_string(), globals),
    };
    SmartResumeDriver::new(config, storage, stages, Arc::new(SystemClock))
}

fn runtime(globals: &Globals) -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => exit_with(
            EXIT_FAILURE,
            &format!("failed to create tokio runtime: {}", e),
            globals,
        ),
    }
}

fn driver_exit_code(error: &DriverError) -> i32 {
    match error {
        DriverError::AlreadyRunning { .. } => EXIT_CONTENTION,
        DriverError::Config(_) | DriverError::InvalidRunId(_) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

fn setup_exit_code(error: &SetupError) -> i32 {
    match error {
        SetupError::Config(_) | SetupError::SeedWithoutMemory => EXIT_CONFIG,
        SetupError::Seed { .. } => EXIT_FAILURE,
    }
}

fn print_report(report: &RunReport, output: OutputFormat) {
    match output {
        OutputFormat::Json => print_json(report),
        OutputFormat::Text => {
            let s = &report.summary;
            println!(
                "Run {} on stream {}: {}",
                report.run_id, report.stream, report.status
            );
            println!(
                "  eligible {}, processed {}, succeeded {}, failed {}, skipped {}{}",
                s.eligible,
                s.processed,
                s.succeeded,
                s.failed,
                s.skipped,
                if s.cancelled { " (cancelled)" } else { "" }
            );
        }
    }
}

fn print_issues(issues: &[ProductionIssueRecord], output: OutputFormat) {
    match output {
        OutputFormat::Json => print_json(&issues),
        OutputFormat::Text => {
            if issues.is_empty() {
                println!("No production issues.");
                return;
            }
            for issue in issues {
                println!(
                    "{}  {}  {}  {}  run {} x{}",
                    issue.record_id,
                    issue.status.as_str(),
                    issue.severity.as_str(),
                    issue.pattern,
                    issue.run_id,
                    issue.occurrences
                );
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    let pretty = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization error: {}\"}}", e));
    println!("{}", pretty);
}

/// Report an error in the selected output format.
fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
        OutputFormat::Text => {
            if !quiet {
                eprintln!("error: {}", msg);
            }
        }
    }
}

fn exit_with(code: i32, msg: &str, globals: &Globals) -> ! {
    report_error(msg, globals.output, globals.quiet);
    process::exit(code)
}

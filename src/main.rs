mod debug_repl;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pysandbox::{SessionConfig, SessionRegistry, event_log};

#[derive(Debug, Parser)]
#[command(name = "pysandbox", version, about = "Persistent sandboxed Python sessions")]
struct Cli {
    /// Verbose logging, including worker diagnostics.
    #[arg(long, global = true)]
    debug: bool,

    /// Write a JSONL lifecycle event log into this directory.
    #[arg(long, global = true, value_name = "DIR")]
    debug_events_dir: Option<PathBuf>,

    #[command(flatten)]
    limits: LimitArgs,

    #[command(subcommand)]
    command: CliCommand,
}

/// Overrides applied on top of `PYSANDBOX_*` environment settings.
#[derive(Debug, Args)]
struct LimitArgs {
    #[arg(long, global = true, value_name = "MB")]
    memory_mb: Option<u64>,
    #[arg(long, global = true, value_name = "SECS")]
    cpu_secs: Option<u64>,
    #[arg(long, global = true, value_name = "SECS")]
    wall_secs: Option<u64>,
    #[arg(long, global = true, value_name = "MINUTES")]
    idle_minutes: Option<u64>,
    #[arg(long, global = true, value_name = "DIR")]
    work_dir_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    python: Option<PathBuf>,
    /// Use the base interpreter instead of a per-session virtualenv.
    #[arg(long, global = true)]
    no_venv: bool,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Interactive session; end code blocks with END.
    Repl,
    /// Run a file in a single-use session and exit with its status.
    Run {
        file: PathBuf,
        #[arg(short = 'r', long = "requirement", value_name = "REQ")]
        requirements: Vec<String>,
    },
}

impl LimitArgs {
    fn apply(&self, mut config: SessionConfig, debug: bool) -> SessionConfig {
        if let Some(mb) = self.memory_mb {
            config.memory_limit_mb = mb;
        }
        if let Some(secs) = self.cpu_secs {
            config.cpu_time_limit_secs = secs;
        }
        if let Some(secs) = self.wall_secs {
            config.wall_time_limit_secs = secs;
        }
        if let Some(minutes) = self.idle_minutes {
            config = config.with_idle_timeout_minutes(minutes);
        }
        if let Some(root) = &self.work_dir_root {
            config.work_dir_root = root.clone();
        }
        if let Some(python) = &self.python {
            config.python = Some(python.clone());
        }
        if self.no_venv {
            config.isolated_env = false;
        }
        config.debug |= debug;
        config
    }
}

fn main() -> ExitCode {
    // A closed stdout should surface as EPIPE, not kill the process.
    ignore_sigpipe();
    let cli = Cli::parse();
    init_tracing(cli.debug);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("pysandbox: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    event_log::initialize(cli.debug_events_dir.clone())?;
    let config = cli.limits.apply(SessionConfig::from_env()?, cli.debug);
    config.validate()?;
    let registry = SessionRegistry::for_current_process();

    let code = match cli.command {
        CliCommand::Repl => {
            debug_repl::run(&registry, config)?;
            ExitCode::SUCCESS
        }
        CliCommand::Run { file, requirements } => {
            let code = std::fs::read_to_string(&file)?;
            let mut stdout = io::stdout();
            let mut stderr = io::stderr();
            match registry.run_isolated(config, &code, &requirements) {
                Ok(output) => {
                    debug_repl::render_code_output(&output, &mut stdout, &mut stderr)?;
                    if output.success {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(err) => {
                    debug_repl::report_error(&err, &mut stderr)?;
                    ExitCode::from(2)
                }
            }
        }
    };
    registry.shutdown();
    Ok(code)
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

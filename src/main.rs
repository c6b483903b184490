use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::Value;
use stepwise_rs::runtime::command::{self, Command, CommandRunner, ProcessRunner, ScriptedRunner};
use stepwise_rs::runtime::progress::{LogReporter, ProgressParser, ProgressReporter};
use stepwise_rs::stepwise::config::StepwiseConfig;
use stepwise_rs::stepwise::pipeline;
use stepwise_rs::stepwise::workflow::{FileCheckpointStore, StepEvent, ToolInvocationResult};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Advance a pipeline session by one event
    Step {
        /// Session id; generated when starting without one
        #[arg(short, long)]
        session: Option<String>,

        /// Start the session with this JSON input
        #[arg(long, conflicts_with_all = ["resume", "continue_run"])]
        start: Option<String>,

        /// Answer the pending request with this JSON payload
        #[arg(long, conflicts_with = "continue_run")]
        resume: Option<String>,

        /// Request id being answered
        #[arg(long, requires = "resume")]
        request_id: Option<String>,

        /// Continue a session interrupted mid-run
        #[arg(long = "continue")]
        continue_run: bool,

        /// Record build and deploy commands as succeeded without running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print a session's checkpoint
    Show {
        #[arg(short, long)]
        session: String,
    },
    /// Run a command with build progress reporting
    Exec {
        /// Overrides the configured command timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(trailing_var_arg = true, required = true)]
        argv: Vec<String>,
    },
}

fn parse_json(flag: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", flag))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = StepwiseConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Step {
            session,
            start,
            resume,
            request_id,
            continue_run,
            dry_run,
        } => {
            let event = match (start, resume, continue_run) {
                (Some(input), None, false) => StepEvent::Start(parse_json("start", &input)?),
                (None, Some(payload), false) => {
                    let payload = parse_json("resume", &payload)?;
                    StepEvent::Resume(ToolInvocationResult {
                        request_id,
                        payload,
                    })
                }
                (None, None, true) => StepEvent::Continue,
                _ => bail!("exactly one of --start, --resume or --continue is required"),
            };

            let session = match (session, &event) {
                (Some(id), _) => id,
                (None, StepEvent::Start(_)) => uuid::Uuid::new_v4().to_string(),
                (None, _) => bail!("--session is required unless starting a new session"),
            };

            let scripted = ScriptedRunner::new();
            let runner: Arc<dyn CommandRunner> = if dry_run {
                Arc::new(scripted.clone())
            } else {
                Arc::new(ProcessRunner)
            };
            let store = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
            let orchestrator = pipeline::app_orchestrator(&config, runner, store)?;

            log::info!("Stepping session '{}'", session);
            let outcome = orchestrator.step(&session, event).await?;
            for call in scripted.calls() {
                log::info!("Dry run, not executed: {}", call.command);
            }
            log::info!(
                "Session '{}' {}",
                outcome.session_id(),
                if outcome.is_terminal() { "finished" } else { "waiting" }
            );
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Show { session } => {
            let store = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
            let orchestrator = pipeline::app_orchestrator(&config, Arc::new(ProcessRunner), store)?;
            match orchestrator.checkpoint(&session).await? {
                Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
                None => bail!("no checkpoint for session '{}'", session),
            }
        }
        Commands::Exec { timeout_ms, argv } => {
            let Some((program, rest)) = argv.split_first() else {
                bail!("no command given");
            };
            let mut options = config.exec_options();
            if let Some(ms) = timeout_ms {
                options.timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            let parser: Arc<dyn ProgressParser> = config.progress_parser()?;
            let reporter: Arc<dyn ProgressReporter> = Arc::new(LogReporter::new(program.as_str()));
            options.progress_parser = Some(parser);
            options.progress_reporter = Some(reporter);

            let cmd = Command::new(program.as_str()).args(rest.iter().cloned());
            let result = command::execute(&cmd, &options).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(result.exit_code.unwrap_or(1));
            }
        }
    }

    Ok(())
}

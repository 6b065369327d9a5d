//! Autonomous task runner.
//!
//! Drives a prompt through plan → execute → route cycles against a registry
//! of tools, then writes a provenance record under the audit directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use taskloop::core::state::TaskState;
use taskloop::exit_codes;
use taskloop::io::completion::CommandCompletion;
use taskloop::io::config::{DEFAULT_CONFIG_PATH, EngineConfig, load_config, write_config};
use taskloop::io::plugins::{PluginLoader, ToolDefaults};
use taskloop::io::provenance_store::{load_provenance, provenance_path, write_provenance};
use taskloop::io::registry::ToolRegistry;
use taskloop::logging;
use taskloop::task_loop::TaskRunner;

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Autonomous tool-using task runner"
)]
struct Cli {
    /// Config file (missing file means defaults).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config and create the audit and plugin directories.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// List the tools the planner would see.
    Tools {
        /// Include tools not marked safe.
        #[arg(long = "unsafe")]
        allow_unsafe: bool,
    },
    /// Run a task to termination.
    Run(RunArgs),
    /// Print the provenance record of a finished task.
    Show {
        task_id: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Task prompt.
    #[arg(short, long)]
    prompt: String,

    /// Task identifier (default: generated).
    #[arg(long)]
    task_id: Option<String>,

    /// Disable safe mode for this run.
    #[arg(long = "unsafe")]
    allow_unsafe: bool,

    /// Override the iteration cap.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Initial sub-goal (repeatable, in order).
    #[arg(long = "sub-goal")]
    sub_goals: Vec<String>,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Tools { allow_unsafe } => cmd_tools(&cli.config, allow_unsafe),
        Command::Run(args) => cmd_run(&cli.config, args).await,
        Command::Show { task_id } => cmd_show(&cli.config, &task_id),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    let config = if force || !config_path.exists() {
        let config = EngineConfig::default();
        write_config(config_path, &config)?;
        config
    } else {
        load_config(config_path)?
    };
    fs::create_dir_all(&config.audit_dir)
        .with_context(|| format!("create {}", config.audit_dir.display()))?;
    fs::create_dir_all(&config.plugins_dir)
        .with_context(|| format!("create {}", config.plugins_dir.display()))?;
    Ok(exit_codes::OK)
}

fn cmd_tools(config_path: &Path, allow_unsafe: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    let registry = load_registry(&config);
    for entry in registry.describe(!allow_unsafe) {
        let spec = entry.spec();
        let safety = if spec.safe { "safe" } else { "unsafe" };
        println!("{}\t{}\t{}", spec.signature(), safety, spec.description);
    }
    Ok(exit_codes::OK)
}

async fn cmd_run(config_path: &Path, args: RunArgs) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if args.allow_unsafe {
        config.safe_mode = false;
    }
    config.validate()?;

    let state = match args.task_id {
        Some(id) => TaskState::new(id, args.prompt, config.runtime())?,
        None => TaskState::with_generated_id(args.prompt, config.runtime()),
    }
    .with_sub_goals(args.sub_goals);
    let record_path = provenance_path(&config.audit_dir, state.task_id());
    if record_path.exists() {
        bail!("task {} already has a record at {}", state.task_id(), record_path.display());
    }

    let registry = Arc::new(load_registry(&config));
    let completion = Arc::new(CommandCompletion::from_config(&config.planner)?);
    let runner = TaskRunner::new(registry, completion)?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received; stopping after the current step");
                cancel.cancel();
            }
        })
    };
    let outcome = runner.run(state, &cancel).await;
    interrupt.abort();
    let task = outcome?;

    let path = write_provenance(&config.audit_dir, &task.provenance)?;
    let status = task.provenance.final_status();
    println!("{}\t{}\t{}", task.state.task_id(), status, path.display());
    Ok(exit_codes::for_final_status(status))
}

fn cmd_show(config_path: &Path, task_id: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let record = load_provenance(&config.audit_dir, task_id)?;
    let payload = serde_json::to_string_pretty(&record).context("serialize provenance")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

/// Intrinsics plus every manifest tool under the plugins directory.
fn load_registry(config: &EngineConfig) -> ToolRegistry {
    let registry = ToolRegistry::with_intrinsics();
    let mut loader = PluginLoader::new(ToolDefaults::from_config(config));
    let report = loader.load_manifests(&registry, &config.plugins_dir);
    for (source, err) in &report.failed {
        eprintln!("warning: skipped {source}: {err}");
    }
    registry
}

#![warn(clippy::all)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use zero_sandbox::logging::init_logging;
use zero_sandbox::{
    check_command, container_runtime_available, CancellationToken, EngineConfig, ExecutorFactory,
    LocalExecutor, SandboxError,
};

/// `zero-sandbox` - probe and drive the sandbox engine by hand.
#[derive(Parser, Debug)]
#[command(name = "zero-sandbox")]
#[command(author = "theonlyhennygod")]
#[command(version = "0.1.0")]
#[command(about = "Guarded command execution in Docker sandboxes.", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the guard verdict for a command
    Check {
        /// Command to check
        command: String,
    },
    /// Report whether the container runtime is reachable
    Probe,
    /// Run a shell command through the executor factory
    Exec {
        /// Skip the container runtime and run locally
        #[arg(long)]
        local: bool,
        /// Config file (defaults to ~/.codecoder/sandbox.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Shell command
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    match cli.command {
        Commands::Check { command } => {
            let verdict = check_command(&command);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if !verdict.allowed {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Probe => {
            let available = container_runtime_available().await;
            println!(
                "container runtime: {}",
                if available { "available" } else { "unavailable" }
            );
            if !available {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Exec {
            local,
            config,
            command,
        } => exec(local, config, &command.join(" ")).await,
    }
}

async fn exec(local: bool, config: Option<PathBuf>, command: &str) -> Result<()> {
    let mut engine = match &config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::load().context("Failed to load sandbox config")?,
    };
    engine.apply_env_overrides();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let factory = ExecutorFactory::from_engine(&engine);
    let executor: Box<dyn zero_sandbox::Executor> = if local {
        Box::new(LocalExecutor::new(engine.local.clone()))
    } else {
        factory.build(&cancel).await.context("No executor available")?
    };
    eprintln!("backend: {}", executor.backend());

    let result = executor.execute_shell(&cancel, command).await;
    if let Err(e) = executor.close().await {
        tracing::warn!("Failed to close executor: {}", e);
    }

    let output = match result {
        Ok(output) => output,
        Err(SandboxError::Timeout { timeout, output }) => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            anyhow::bail!("command timed out after {}s", timeout.as_secs_f64());
        }
        Err(e) => return Err(e).context("Command failed"),
    };

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    std::process::exit(output.exit_code);
}

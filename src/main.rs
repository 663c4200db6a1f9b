use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use scriptgate::config::Config;
use scriptgate::gateway::{Classification, Gateway};
use scriptgate::sandbox::{PathExtractor, ScriptClassifier, SyntaxValidator};
use scriptgate::workflow::{Approver, FlowStatus, GeneratedScript, StaticApprover, Workflow};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scriptgate")]
#[command(about = "Safety gateway for generated PowerShell scripts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sandbox root, overrides the configured one
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the path references found in a script
    Paths {
        /// Script file, or - for stdin
        script: String,
    },

    /// Print read, write or unsafe for a script
    Classify {
        /// Script file, or - for stdin
        script: String,
    },

    /// Check a script's syntax without running it
    Check {
        /// Script file, or - for stdin
        script: String,
    },

    /// Validate, classify and run a script in the sandbox
    Run {
        /// Script file, or - for stdin
        script: String,

        /// Approve write scripts without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Validate configuration file
    Validate,
}

/// Asks on the terminal before a write script runs.
struct TerminalApprover;

#[async_trait]
impl Approver for TerminalApprover {
    async fn approve(&self, explanation: &str, script: &str) -> bool {
        if !explanation.is_empty() {
            eprintln!("{}", explanation);
        }
        eprintln!("--- script ---\n{}\n--------------", script);
        eprint!("Run this script? [y/N] ");

        let mut answer = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut answer).await {
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                warn!("Failed to read approval: {}", e);
                false
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(|| {
        Config::default_config_path().unwrap_or_else(|_| PathBuf::from("scriptgate.toml"))
    });

    let result = match cli.command {
        Commands::Paths { script } => show_paths(&script),
        Commands::Classify { script } => classify(&config_path, cli.root.as_deref(), &script),
        Commands::Check { script } => check(&config_path, &script),
        Commands::Run { script, yes } => run(&config_path, cli.root.as_deref(), &script, yes).await,
        Commands::Config(ConfigCommands::Init { output, force }) => {
            generate_config(output.unwrap_or(config_path), force)
        }
        Commands::Config(ConfigCommands::Show) => show_config(&config_path),
        Commands::Config(ConfigCommands::Validate) => validate_config(&config_path),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("scriptgate={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    let config = if config_path.exists() {
        Config::load_from_file(config_path)?
    } else {
        info!("Configuration file not found at {:?}, using defaults", config_path);
        Config::default()
    };

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn read_script(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .context("Failed to read script from stdin")?;
        Ok(script)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read script {}", source))
    }
}

fn show_paths(source: &str) -> anyhow::Result<()> {
    let script = read_script(source)?;
    for path in PathExtractor::new().extract(&script) {
        println!("{:?}\t{}", path.form, path.text);
    }
    Ok(())
}

fn classify(config_path: &Path, root: Option<&Path>, source: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let root = config.sandbox_root(root)?;
    let script = read_script(source)?;

    let classification = ScriptClassifier::new(root).classify(&script);
    println!("{}", classification);
    Ok(())
}

fn check(config_path: &Path, source: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let script = read_script(source)?;

    SyntaxValidator::new(config.script_host(), config.timeouts().syntax).validate(&script)?;
    println!("Syntax OK");
    Ok(())
}

async fn run(config_path: &Path, root: Option<&Path>, source: &str, yes: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let root = config.sandbox_root(root)?;
    let script = GeneratedScript::new(read_script(source)?);

    if source == "-" && !yes {
        warn!("Script was read from stdin; write scripts will be declined without --yes");
    }

    let gateway = Arc::new(Gateway::from_config(&config, root)?);

    let (status_tx, mut status_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            match status {
                FlowStatus::Classified(classification) => info!("Script classified as {}", classification),
                status => info!("{:?}", status),
            }
        }
    });

    let workflow = Workflow::new(gateway, config.workflow.syntax_retries).with_status_channel(status_tx);
    let approver: Box<dyn Approver> = if yes {
        Box::new(StaticApprover(true))
    } else {
        Box::new(TerminalApprover)
    };

    // Dropping the flow on Ctrl+C kills the running script
    let report = tokio::select! {
        report = workflow.run(&script, approver.as_ref()) => report?,
        _ = tokio::signal::ctrl_c() => {
            bail!("Interrupted, script execution was cancelled");
        }
    };

    if report.classification == Classification::Write {
        info!("Changes applied in {}", workflow.gateway().root());
    }

    if !report.result.stdout.is_empty() {
        println!("{}", report.result.stdout);
    }
    if !report.result.stderr.is_empty() {
        eprintln!("{}", report.result.stderr);
    }

    Ok(())
}

fn generate_config(output_path: PathBuf, force: bool) -> anyhow::Result<()> {
    if output_path.exists() && !force {
        bail!("Configuration file already exists at {:?}. Use --force to overwrite.", output_path);
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    Config::default().save_to_file(&output_path)?;
    println!("Default configuration file generated at {:?}", output_path);
    Ok(())
}

fn show_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("# {}", config_path.display());
    print!("{}", rendered);
    Ok(())
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = Config::load_from_file(config_path)?;
    config.validate()?;

    println!("✓ Configuration is valid");
    println!("Sandbox:");
    match &config.sandbox.root {
        Some(root) => println!("  Root: {}", root.display()),
        None => println!("  Root: <current directory>"),
    }
    println!("  Runtime: {}", config.script_host().program_name());

    println!("Execution:");
    println!("  Read timeout: {}s", config.execution.read_timeout_secs);
    println!("  Write timeout: {}s", config.execution.write_timeout_secs);
    println!("  Syntax timeout: {}s", config.execution.syntax_timeout_secs);
    println!("  Max output: {} bytes", config.execution.max_output_size);

    if let Some(root) = &config.sandbox.root {
        if !root.is_dir() {
            warn!("  ⚠ Warning: sandbox root {} does not exist", root.display());
        }
    }

    Ok(())
}

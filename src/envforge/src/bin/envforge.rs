//! envforge CLI: install, update, remove, list and verify environments.

use anyhow::Context;
use clap::{Parser, Subcommand};
use envforge::{
    ChannelProgressReporter, HttpFetcher, ProcessBridge, ProvisionError, ProvisionProgress,
    Provisioner, ProvisionerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "envforge", version, about = "Provision development environments from a verified image")]
struct Cli {
    #[arg(long = "app-dir", help = "App directory (default: ~/.envforge)")]
    app_dir: Option<PathBuf>,

    #[arg(long, help = "Config file (default: ./envforge.toml, then <app-dir>/envforge.toml)")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an environment, replacing any existing one with the same name
    Install {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        user: String,
        #[command(flatten)]
        artifact: ArtifactArgs,
    },
    /// Re-run bootstrap and configuration on an existing environment
    Update {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        user: String,
    },
    /// Tear down an environment
    Remove {
        #[arg(short, long)]
        name: String,
    },
    /// Show known environments
    List {
        #[arg(long)]
        json: bool,
    },
    /// Download and check the artifact without provisioning
    Verify {
        #[command(flatten)]
        artifact: ArtifactArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ArtifactArgs {
    #[arg(long = "artifact-url")]
    artifact_url: Option<String>,
    #[arg(long)]
    sha256: Option<String>,
}

impl ArtifactArgs {
    fn apply(&self, config: &mut ProvisionerConfig) {
        if let Some(url) = &self.artifact_url {
            config.artifact.url = url.clone();
        }
        if let Some(digest) = &self.sha256 {
            config.artifact.sha256 = digest.clone();
        }
    }
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let rt = match tokio::runtime::Runtime::new().context("failed to start tokio runtime") {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), ProvisionError> {
    let app_dir = cli.app_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".envforge")
    });
    std::fs::create_dir_all(&app_dir)?;
    tracing::info!("App directory: {}", app_dir.display());

    let mut config = ProvisionerConfig::load(cli.config.as_deref(), &app_dir)?;
    match &cli.command {
        Command::Install { artifact, .. } | Command::Verify { artifact } => {
            artifact.apply(&mut config);
            config.validate()?;
        }
        Command::Update { .. } => config.validate_commands()?,
        Command::Remove { .. } | Command::List { .. } => {}
    }

    let (progress_tx, progress_rx) = mpsc::channel::<ProvisionProgress>(64);
    let printer = tokio::spawn(print_progress(progress_rx));

    let bridge = Arc::new(ProcessBridge::new(config.backend.program.clone()));
    let provisioner = Provisioner::new(config, &app_dir, bridge, Arc::new(HttpFetcher::new()))?;

    let cancel = provisioner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received, stopping after the current stage...");
            cancel.cancel();
        }
    });

    let result = match cli.command {
        Command::Install { name, user, .. } => {
            let provisioner = provisioner.with_reporter(Arc::new(
                ChannelProgressReporter::with_environment(progress_tx, name.clone()),
            ));
            provisioner.install(&name, &user).await.map(|env| {
                println!("{} is ready (default user: {})", env.name, user);
            })
        }
        Command::Update { name, user } => {
            let provisioner = provisioner.with_reporter(Arc::new(
                ChannelProgressReporter::with_environment(progress_tx, name.clone()),
            ));
            provisioner.update(&name, &user).await.map(|env| {
                println!("{} is ready (default user: {})", env.name, user);
            })
        }
        Command::Remove { name } => {
            drop(progress_tx);
            provisioner.teardown(&name).await.map(|()| {
                println!("{} removed", name);
            })
        }
        Command::List { json } => {
            drop(progress_tx);
            let environments = provisioner.registry().list().await;
            if json {
                let out = serde_json::to_string_pretty(&environments)
                    .map_err(|e| ProvisionError::Config(format!("Failed to encode list: {}", e)))?;
                println!("{}", out);
            } else if environments.is_empty() {
                println!("No environments");
            } else {
                for env in environments {
                    println!(
                        "{:<24} {:<40} {}",
                        env.name,
                        env.state.to_string(),
                        env.default_user.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }
        Command::Verify { .. } => {
            drop(progress_tx);
            provisioner.verify_artifact().await.map(|verified| {
                println!(
                    "{} verified: sha256:{} ({})",
                    verified.url(),
                    verified.digest(),
                    verified.local_path().display()
                );
            })
        }
    };

    // Wait for the last progress lines before exiting.
    let _ = printer.await;
    result
}

async fn print_progress(mut rx: mpsc::Receiver<ProvisionProgress>) {
    while let Some(progress) = rx.recv().await {
        let stage = progress
            .stage
            .map(|s| format!("{}: ", s))
            .unwrap_or_default();
        match progress.task_name.as_deref() {
            Some(task) if !progress.message.contains(task) => eprintln!(
                "[{:>3}%] {}{} ({})",
                progress.percentage, stage, progress.message, task
            ),
            _ => eprintln!("[{:>3}%] {}{}", progress.percentage, stage, progress.message),
        }
    }
}

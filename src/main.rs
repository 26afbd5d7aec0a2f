//! piped - Entry point
//!
//! A GitOps deployment agent deployed near workload clusters. It plans and
//! executes multi-stage rollouts from a Git source of truth and reports to
//! a central control plane.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use piped::app::options::{piped_home, PipedOptions};
use piped::app::run::run;
use piped::config::ConfigDuration;
use piped::logs::{init_logging, LogLevel, LogOptions};

#[derive(Parser)]
#[command(name = "piped", version, about = "GitOps deployment agent")]
struct Cli {
    /// Minimum log level.
    #[arg(long, global = true, default_value = "info", value_parser = parse_log_level)]
    log_level: LogLevel,

    /// Emit one JSON object per log line.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start running piped.
    Piped(PipedArgs),
    /// Start running the ops housekeeping server.
    Ops(OpsArgs),
}

#[derive(Args)]
struct PipedArgs {
    /// The path to the configuration file.
    #[arg(long)]
    config_file: PathBuf,

    /// The port number used to run a HTTP server for admin tasks such as
    /// metrics, healthz.
    #[arg(long, default_value_t = 9085)]
    admin_port: u16,

    /// How long to wait for graceful shutdown.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    grace_period: Duration,

    /// Whether to disable transport security while connecting to the
    /// control plane.
    #[arg(long)]
    insecure: bool,

    /// The path to the TLS certificate file.
    #[arg(long)]
    cert_file: Option<String>,

    /// The path to the directory where needed tools such as kubectl,
    /// helm, kustomize are installed.
    #[arg(long)]
    tools_dir: Option<PathBuf>,
}

#[derive(Args)]
struct OpsArgs {
    /// The path to the configuration file.
    #[arg(long)]
    config_file: PathBuf,

    /// The port number used to run a HTTP server for admin tasks such as
    /// metrics, healthz.
    #[arg(long, default_value_t = 9085)]
    admin_port: u16,

    /// How long to wait for graceful shutdown.
    #[arg(long, default_value = "15s", value_parser = parse_duration)]
    grace_period: Duration,
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    ConfigDuration::parse(text).map(|d| d.as_duration())
}

fn parse_log_level(text: &str) -> Result<LogLevel, String> {
    text.parse()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(LogOptions {
        level: cli.log_level,
        json_format: cli.log_json,
    }) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let result = match cli.command {
        Commands::Piped(args) => run_piped(args).await,
        Commands::Ops(args) => run_ops(args).await,
    };

    if let Err(e) = result {
        error!("Failed while running: {}", e);
        std::process::exit(1);
    }
}

async fn run_piped(args: PipedArgs) -> Result<(), piped::errors::PipedError> {
    let defaults = PipedOptions::default();
    let options = PipedOptions {
        config_file: args.config_file,
        admin_port: args.admin_port,
        grace_period: args.grace_period,
        insecure: args.insecure,
        cert_file: args.cert_file,
        tools_dir: args.tools_dir.unwrap_or(defaults.tools_dir),
        work_dir: piped_home().join("work"),
    };

    info!("Running piped {}", piped::version::get().version);
    run(options, await_shutdown_signal()).await
}

/// The ops subcommand serves only the admin endpoints here; the control
/// plane's housekeeping lives with its data stores.
async fn run_ops(args: OpsArgs) -> Result<(), piped::errors::PipedError> {
    use piped::errors::PipedError;

    // The ops server runs from the control-plane configuration.
    let text = tokio::fs::read_to_string(&args.config_file).await?;
    let envelope: serde_yaml::Value = serde_yaml::from_str(&text)?;
    let kind = envelope.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    if kind != "ControlPlane" {
        return Err(PipedError::ConfigError(format!(
            "wrong configuration kind for ops: {}",
            kind
        )));
    }

    let prometheus = PrometheusBuilder::new().install_recorder().map_err(|e| {
        PipedError::Internal(format!("failed to install metrics recorder: {}", e))
    })?;

    info!(
        "Running ops {} with a {:?} grace period",
        piped::version::get().version,
        args.grace_period
    );
    let handle = piped::admin::serve(args.admin_port, prometheus, await_shutdown_signal()).await?;
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(PipedError::ServerError(e.to_string())),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("listen for SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("listen for SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}

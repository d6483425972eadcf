//! Telemetry Agent - Main Entry Point
//!
//! Reads configuration and credential files, then runs the agent until the
//! requested number of events is sent or a shutdown signal arrives.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use telemetry_agent::agent::TelemetryAgent;
use telemetry_agent::config::{AgentConfig, ConfigOverrides};
use telemetry_agent::error::{AgentError, AgentResult};
use telemetry_agent::observability::{init_default_logging, metrics};
use telemetry_agent::transport::mqtt::MqttClient;
use telemetry_agent::transport::TlsVerification;
use tracing::{error, info, warn};

/// Secure MQTT telemetry agent
#[derive(Parser)]
#[command(name = "telemetry-agent")]
#[command(about = "Publishes device telemetry to the cloud broker over authenticated MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TELEMETRY_AGENT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Cloud IoT device id
    #[arg(long, global = true)]
    device: Option<String>,

    /// Cloud project id
    #[arg(long, global = true)]
    project: Option<String>,

    /// Device registry id (short form)
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Cloud region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Number of events to send (0 = until interrupted)
    #[arg(long, global = true)]
    events: Option<u64>,

    /// Event source tag
    #[arg(long, global = true)]
    src: Option<String>,

    /// CA bundle path (https://pki.google.com/roots.pem)
    #[arg(long, value_name = "FILE", global = true)]
    ca: Option<PathBuf>,

    /// Private key path
    #[arg(long, value_name = "FILE", global = true)]
    key: Option<PathBuf>,

    /// Delay between events in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// Accept any broker certificate (development only)
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device_id: self.device.clone(),
            project_id: self.project.clone(),
            registry_id: self.registry.clone(),
            region: self.region.clone(),
            events: self.events,
            source: self.src.clone(),
            ca_path: self.ca.clone(),
            key_path: self.key.clone(),
            interval_ms: self.interval_ms,
            insecure: self.insecure,
        }
    }
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Connect and publish telemetry (default)
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting telemetry agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e.to_log_string(), "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e.to_log_string(), "Command failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(cli: &Cli) -> AgentResult<AgentConfig> {
    if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path.display());
    }
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    config.apply_overrides(&cli.overrides());
    config.validate()?;
    Ok(config)
}

fn read_private_key(config: &AgentConfig) -> AgentResult<Vec<u8>> {
    let path = &config.credentials.key_path;
    std::fs::read(path).map_err(|e| AgentError::file_read("private key", path, e))
}

/// An unreadable CA bundle is fatal in strict mode; permissive mode goes on
/// with an empty trust store
fn read_ca_bundle(config: &AgentConfig) -> AgentResult<Vec<u8>> {
    let path = &config.broker.ca_path;
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if config.broker.tls_verification == TlsVerification::Permissive => {
            warn!(
                path = %path.display(),
                error = %e,
                "CA bundle unreadable, continuing with an empty trust store"
            );
            Ok(Vec::new())
        }
        Err(e) => Err(AgentError::file_read("CA bundle", path, e)),
    }
}

async fn run_agent(config: AgentConfig) -> AgentResult<()> {
    info!(
        device = %config.device.device_id,
        broker = %config.broker_endpoint(),
        "Application starting"
    );

    let private_key = read_private_key(&config)?;
    let ca_bundle = read_ca_bundle(&config)?;
    let mut agent = TelemetryAgent::new(config, &private_key, &ca_bundle, MqttClient::new())?;

    let shutdown = agent.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.shutdown();
    });

    if let Err(e) = agent.start().await {
        if let Err(cleanup) = agent.shutdown().await {
            warn!(error = %cleanup.to_log_string(), "Cleanup after failed start");
        }
        return Err(e);
    }

    let summary = agent.run().await;
    if summary.failed > 0 || summary.timed_out > 0 {
        warn!(
            failed = summary.failed,
            timed_out = summary.timed_out,
            "Some events were not delivered"
        );
    }

    agent.shutdown().await?;

    match serde_json::to_string(&metrics().get_metrics()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Final metrics"),
        Err(e) => warn!(error = %e, "Could not render metrics snapshot"),
    }
    Ok(())
}

fn handle_config_command(config: &AgentConfig, show: bool) -> AgentResult<()> {
    if show {
        println!("{}", config.to_toml_string()?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
                }
                return;
            }
            _ => warn!("Unix signal handlers unavailable, falling back to Ctrl-C"),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C, shutting down gracefully...");
    }
}

//! Command-line interface for LoRaGent, the LoRaWAN to NGSIv2 gateway.

mod shutdown;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use loragent_core::config::env_vars;
use loragent_core::model::{Device, Group};
use loragent_core::{GatewayConfig, GatewayEvent};
use loragent_devices::{Codec, LoraAgent};

/// LoRaGent - bridge LoRaWAN uplinks to an NGSIv2 context broker.
#[derive(Parser, Debug)]
#[command(name = "loragent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to $LORAGENT_CONFIG or ./loragent.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until Ctrl+C or SIGTERM.
    Run,
    /// Device group provisioning.
    ///
    /// Edits the provisioning database directly. With the redb backend the
    /// database is locked while `loragent run` is up, so stop the gateway
    /// first; it subscribes to the stored groups when it starts again.
    Group {
        #[command(subcommand)]
        cmd: GroupCommand,
    },
    /// Device provisioning.
    ///
    /// Same database rules as `group`: stop a running gateway first when
    /// using the redb backend.
    Device {
        #[command(subcommand)]
        cmd: DeviceCommand,
    },
    /// Decode a payload with a codec and print the attributes.
    Decode {
        /// Codec identifier.
        #[arg(long, default_value = "cayennelpp")]
        codec: String,
        /// Encoding of PAYLOAD.
        #[arg(long, value_enum, default_value_t = PayloadEncoding::Hex)]
        encoding: PayloadEncoding,
        /// The payload.
        payload: String,
    },
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    /// Create a group from a JSON file, or replace it with --replace.
    Add {
        /// Path to the group JSON.
        file: PathBuf,
        #[arg(long)]
        replace: bool,
    },
    /// List the groups of a service path.
    List {
        #[arg(long)]
        service: String,
        #[arg(long)]
        subservice: String,
    },
    /// Remove a group and its devices.
    Remove {
        #[arg(long)]
        service: String,
        #[arg(long)]
        subservice: String,
        application_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Register a device from a JSON file.
    Add { file: PathBuf },
    /// List the devices of a service path.
    List {
        #[arg(long)]
        service: String,
        #[arg(long)]
        subservice: String,
    },
    /// Remove a device.
    Remove {
        #[arg(long)]
        service: String,
        #[arg(long)]
        subservice: String,
        device_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PayloadEncoding {
    Hex,
    Base64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Command::Decode {
            codec,
            encoding,
            payload,
        } => run_decode(&codec, encoding, &payload),
        Command::Run => run_gateway(args.config.as_deref()).await,
        Command::Group { cmd } => {
            let agent = provisioning_agent(args.config.as_deref())?;
            run_group_cmd(&agent, cmd).await
        }
        Command::Device { cmd } => {
            let agent = provisioning_agent(args.config.as_deref())?;
            run_device_cmd(&agent, cmd)
        }
    }
}

fn init_logging() {
    // JSON output for container environments
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loragent=info,warn"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

fn build_agent(config_path: Option<&Path>) -> Result<LoraAgent> {
    let config = GatewayConfig::load(config_path).context("failed to load configuration")?;
    LoraAgent::builder(config)
        .build()
        .context("failed to initialize the gateway")
}

/// Agent for a provisioning command. It never starts, so it only uses the store.
fn provisioning_agent(config_path: Option<&Path>) -> Result<LoraAgent> {
    build_agent(config_path)
        .context("cannot open the provisioning store; stop `loragent run` if it uses the same database")
}

async fn run_gateway(config_path: Option<&Path>) -> Result<()> {
    let agent = build_agent(config_path)?;

    let mut events = agent.event_bus().subscribe();
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                GatewayEvent::ConnectionStateChanged { broker, state, .. } => {
                    tracing::info!(broker = %broker, state = ?state, "Connection state changed");
                }
                other => tracing::debug!(event = other.type_name(), "{:?}", other),
            }
        }
    });

    let report = agent.start().await.context("failed to start the gateway")?;
    tracing::info!(
        connections = report.connected,
        subscriptions = report.subscribed,
        failed = report.failed,
        "Gateway running, press Ctrl+C to stop"
    );

    match agent.config().agent.reconcile_interval() {
        Some(period) => {
            agent
                .reconcile_until(period, shutdown::shutdown_signal())
                .await
        }
        None => shutdown::shutdown_signal().await,
    }
    agent.stop().await;
    event_log.abort();

    let stats = agent.stats();
    tracing::info!(
        received = stats.received,
        processed = stats.processed,
        dropped = stats.dropped_total(),
        "Shutdown complete"
    );
    Ok(())
}

async fn run_group_cmd(agent: &LoraAgent, cmd: GroupCommand) -> Result<()> {
    match cmd {
        GroupCommand::Add { file, replace } => {
            let group: Group = read_json(&file)?;
            let application_id = group.application_id().to_string();
            if replace {
                agent.replace_group(group).await?;
                println!("Replaced group for application {}", application_id);
            } else {
                agent.create_group(group).await?;
                println!("Created group for application {}", application_id);
            }
        }
        GroupCommand::List {
            service,
            subservice,
        } => {
            let groups = agent.list_groups(&service, &subservice)?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        GroupCommand::Remove {
            service,
            subservice,
            application_id,
        } => {
            agent
                .delete_group(&service, &subservice, &application_id)
                .await?;
            println!("Removed group for application {}", application_id);
        }
    }
    Ok(())
}

fn run_device_cmd(agent: &LoraAgent, cmd: DeviceCommand) -> Result<()> {
    match cmd {
        DeviceCommand::Add { file } => {
            let device: Device = read_json(&file)?;
            let device_id = device.device_id.clone();
            agent.create_device(device)?;
            println!("Registered device {}", device_id);
        }
        DeviceCommand::List {
            service,
            subservice,
        } => {
            let devices = agent.list_devices(&service, &subservice)?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        DeviceCommand::Remove {
            service,
            subservice,
            device_id,
        } => {
            agent.delete_device(&service, &subservice, &device_id)?;
            println!("Removed device {}", device_id);
        }
    }
    Ok(())
}

fn run_decode(codec: &str, encoding: PayloadEncoding, payload: &str) -> Result<()> {
    let codec = Codec::from_id(codec)?;
    let raw = decode_payload_arg(encoding, payload)?;
    let attributes = codec.decode(&raw, None)?;
    println!("{}", serde_json::to_string_pretty(&attributes)?);
    Ok(())
}

fn decode_payload_arg(encoding: PayloadEncoding, payload: &str) -> Result<Vec<u8>> {
    let payload = payload.trim();
    match encoding {
        PayloadEncoding::Hex => {
            let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
            hex::decode(compact).context("payload is not valid hex")
        }
        PayloadEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(payload)
            .context("payload is not valid base64"),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

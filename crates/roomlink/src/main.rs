//! Roomlink
//!
//! Command-line front end for discovering, pairing and controlling robot
//! vacuums on the local network.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use roomlink::config::Config;
use roomlink::control::{ChargingLightPattern, CleaningPasses, PadWetness};
use roomlink::protocol::generate_password;
use roomlink::{
    BatchMode, CredentialClient, DeviceClient, DeviceError, DeviceRegistry, DiscoveryClient,
    SessionProvider, SetPasswordRequest, Setting, StaticCredentialStore, WifiProvisioner,
    WifiRequest,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Roomlink - local discovery, pairing and control of robot vacuums.
#[derive(Parser, Debug)]
#[command(name = "roomlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Find devices on the local network
    Discover {
        /// Seconds to listen for replies (defaults to the configured timeout)
        #[arg(long, short)]
        timeout: Option<u64>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Retrieve or provision the device password
    #[command(subcommand)]
    Password(PasswordCommands),

    /// Send one or more commands (find, start, stop, pause, resume, dock, evac, reset, train)
    Command {
        /// Command names, executed in order
        #[arg(required = true)]
        names: Vec<String>,

        /// Dispatch every command at once instead of one after another
        #[arg(long)]
        concurrent: bool,
    },

    /// Change a device setting
    #[command(subcommand)]
    Setting(SettingCommands),

    /// Stream device status until interrupted
    Subscribe {
        /// Print raw topic messages instead of the merged state
        #[arg(long)]
        raw: bool,
    },

    /// Configure Wi-Fi on a device hosting its own access point
    Wifi {
        /// Network name
        #[arg(long)]
        ssid: String,

        /// Network password
        #[arg(long)]
        password: String,

        /// Display name for the robot
        #[arg(long)]
        name: Option<String>,

        /// IANA timezone, e.g. Europe/Paris
        #[arg(long)]
        timezone: Option<String>,

        /// Country code, e.g. US
        #[arg(long)]
        country: Option<String>,

        /// Firmware major version (defaults to the configured value)
        #[arg(long)]
        firmware: Option<u32>,
    },
}

/// Subcommands for the device password.
#[derive(Subcommand, Debug, Clone)]
pub enum PasswordCommands {
    /// Read the password from a docked device after the pairing gesture
    Get {
        /// Device address (defaults to the configured ip)
        #[arg(long)]
        ip: Option<String>,

        /// Device port (defaults to the configured port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Set a new password while connected to the device's access point
    Set {
        /// Password to set; generated when omitted
        #[arg(long)]
        password: Option<String>,

        /// IANA timezone sent along with the current time
        #[arg(long)]
        timezone: Option<String>,
    },
}

/// Subcommands for device settings.
#[derive(Subcommand, Debug, Clone)]
pub enum SettingCommands {
    /// Lock the device buttons
    ChildLock {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Pause cleaning when the bin is full
    BinPause {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Cleaning passes: 1 = one pass, 2 = two passes, 3 = room-size clean
    Passes {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=3))]
        passes: u8,
    },

    /// Overlap between cleaning ranks, 0-100 percent
    RankOverlap { percent: u8 },

    /// Pad wetness: 1 = eco, 2 = standard, 3 = ultra
    PadWetness {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=3))]
        level: u8,
    },

    /// Dock lights: 0 = docking and charging, 1 = docking only, 2 = none
    ChargingLight {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=2))]
        pattern: u8,
    },
}

impl SettingCommands {
    fn to_setting(&self) -> roomlink::Result<Setting> {
        Ok(match *self {
            SettingCommands::ChildLock { enabled } => Setting::ChildLock(enabled),
            SettingCommands::BinPause { enabled } => Setting::BinPause(enabled),
            SettingCommands::Passes { passes } => {
                Setting::CleaningPasses(CleaningPasses::from_number(passes)?)
            }
            SettingCommands::RankOverlap { percent } => Setting::RankOverlap(percent),
            SettingCommands::PadWetness { level } => {
                Setting::PadWetness(PadWetness::from_number(level)?)
            }
            SettingCommands::ChargingLight { pattern } => {
                Setting::ChargingLight(ChargingLightPattern::from_number(pattern)?)
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    // Initialize tracing; RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let result = run(cli.command, config, &cancel).await;
    match result {
        Err(e) if e.downcast_ref::<DeviceError>().is_some_and(DeviceError::is_cancelled) => {
            tracing::debug!("Interrupted");
            Ok(())
        }
        other => other,
    }
}

async fn run(command: Commands, config: Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    match command {
        Commands::Discover { timeout, json } => {
            let timeout = Duration::from_secs(timeout.unwrap_or(config.discovery.timeout_secs));
            let devices = DiscoveryClient::new(config.discovery.clone())
                .discover(timeout, cancel)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices found.");
            } else {
                println!(
                    "{:<20} {:<26} {:<16} {:<12} {}",
                    "NAME", "BLID", "IP", "SKU", "FIRMWARE"
                );
                for device in &devices {
                    println!(
                        "{:<20} {:<26} {:<16} {:<12} {}",
                        device.robot_name,
                        device.blid(),
                        device.ip,
                        device.sku,
                        device.software_version
                    );
                }
            }
        }

        Commands::Password(PasswordCommands::Get { ip, port }) => {
            let ip = ip.unwrap_or_else(|| config.device.ip.clone());
            if ip.is_empty() {
                anyhow::bail!("device ip is required (--ip, [device] ip or ROOMLINK_IP)");
            }
            let port = port.unwrap_or(config.device.port);

            let client = CredentialClient::from_config(&config.provisioning);
            let password = client.get_password(&ip, port, cancel).await?;
            println!("{}", password);
        }

        Commands::Password(PasswordCommands::Set { password, timezone }) => {
            require(&config.device.blid, "device blid")?;
            let password = match password.filter(|p| !p.trim().is_empty()) {
                Some(password) => password,
                None => {
                    let generated = generate_password(Utc::now().timestamp());
                    println!("Generated password: {}", generated);
                    generated
                }
            };

            let mut request = SetPasswordRequest::new(config.device.blid.clone(), password);
            if let Some(timezone) = timezone {
                request = request.with_timezone(timezone);
            }

            let client = CredentialClient::from_config(&config.provisioning);
            client
                .set_password(
                    &config.provisioning.ap_address,
                    config.provisioning.ap_port,
                    &request,
                    cancel,
                )
                .await?;
            println!("Password accepted by device.");
        }

        Commands::Command { names, concurrent } => {
            let (registry, client) = open_client(&config, cancel).await?;
            let mode = if concurrent {
                BatchMode::Concurrent
            } else {
                BatchMode::Sequential
            };

            let report = client.commands().execute_batch(names.as_slice(), mode, cancel).await;
            for result in &report.results {
                match &result.error {
                    Some(error) => println!("{} ({})", result.message, error),
                    None => println!("{}", result.message),
                }
            }
            registry.clear().await;

            if !report.success {
                anyhow::bail!("one or more commands failed");
            }
        }

        Commands::Setting(setting) => {
            let setting = setting.to_setting()?;
            setting.validate()?;

            let (registry, client) = open_client(&config, cancel).await?;
            let result = client.settings().apply(setting, cancel).await;
            registry.clear().await;
            result?;
            println!("Setting applied.");
        }

        Commands::Subscribe { raw } => {
            let (registry, client) = open_client(&config, cancel).await?;
            let result = if raw {
                stream_raw(&client, cancel).await
            } else {
                stream_status(&client, cancel).await
            };
            registry.clear().await;
            result?;
        }

        Commands::Wifi {
            ssid,
            password,
            name,
            timezone,
            country,
            firmware,
        } => {
            require(&config.device.blid, "device blid")?;
            require(&config.device.password, "device password")?;

            let mut request = WifiRequest::new(ssid, password);
            request.robot_name = name;
            request.timezone = timezone;
            request.country = country;
            request.firmware_version = firmware.unwrap_or(config.provisioning.firmware_version);

            WifiProvisioner::new(config.provisioning.clone(), config.mqtt.clone())
                .configure(&config.device_identity(), &request, cancel)
                .await?;
            println!("Wi-Fi configuration sent.");
        }
    }

    Ok(())
}

fn require(value: &str, what: &str) -> anyhow::Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{} is required; set it in the config file or environment", what);
    }
    Ok(())
}

/// Builds the client for the configured device and connects it, retrying a
/// failed connection once.
async fn open_client(
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<(DeviceRegistry<StaticCredentialStore>, Arc<DeviceClient>)> {
    require(&config.device.ip, "device ip")?;
    require(&config.device.blid, "device blid")?;
    require(&config.device.password, "device password")?;

    let store = StaticCredentialStore::with_identities([config.device_identity()]);
    let registry = DeviceRegistry::new(store, config.mqtt.clone());
    let client = registry.get_client(&config.device.blid, cancel).await?;

    if let Err(first) = client.connection().get_session(cancel).await {
        if first.is_cancelled() {
            return Err(first.into());
        }
        tracing::warn!(error = %first, "Connection failed, retrying once");
        client
            .connection()
            .get_session(cancel)
            .await
            .context("could not connect to device")?;
    }

    Ok((registry, client))
}

async fn stream_status(client: &DeviceClient, cancel: &CancellationToken) -> anyhow::Result<()> {
    let mut subscription = client.subscribe_status(cancel).await?;
    println!("{}", serde_json::to_string_pretty(&*subscription.last.snapshot)?);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            update = subscription.updates.recv() => match update {
                Ok(update) => {
                    let at = update.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default();
                    println!("--- {}", at);
                    println!("{}", serde_json::to_string_pretty(&*update.snapshot)?);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind, skipped status updates");
                }
                Err(RecvError::Closed) => anyhow::bail!("device connection closed"),
            },
        }
    }
}

async fn stream_raw(client: &DeviceClient, cancel: &CancellationToken) -> anyhow::Result<()> {
    let mut messages = client.subscriber().subscribe_raw(cancel).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = messages.recv() => match message {
                Ok(message) => println!(
                    "{} {} {}",
                    message.received_at.to_rfc3339(),
                    message.topic,
                    message.payload_str()
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind, skipped messages");
                }
                Err(RecvError::Closed) => anyhow::bail!("device connection closed"),
            },
        }
    }
}

/// Cancels `cancel` on Ctrl-C.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received interrupt, shutting down");
                cancel.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Could not listen for interrupt"),
        }
    });
}

// adpc: desktop consent central
//
// Cross-platform (macOS, Linux, Windows) command-line front end: discover
// consent-disclosing peripherals, read and store their consents, accept or
// revoke them.

mod central;
mod config;

use adpc_core::consent::types::CONSENT_FIELD_NAMES;
use adpc_core::{
    event_channel, ConsentCentral, ConsentId, ConsentLedger, DeviceConsentEntry, DeviceRegistry,
    Peripheral, PeripheralId, RegisteredDevice, SledStorage, StorageBackend, UpsertOutcome,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "adpc")]
#[command(about = "ADPC: read, accept and revoke device data-processing consents", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby peripherals
    Scan {
        /// Discovery window length in seconds
        #[arg(short, long)]
        secs: Option<u64>,
    },
    /// Connect to a peripheral and store its consent
    Connect { peripheral: String },
    /// Disconnect from a peripheral
    Disconnect { peripheral: String },
    /// Disconnect and remove the bond
    Forget { peripheral: String },
    /// List stored consents
    Consents {
        #[arg(short, long)]
        search: Option<String>,
    },
    /// Show one stored consent in full
    Show { peripheral: String, consent: String },
    /// Accept one or more consents on a peripheral
    Accept {
        peripheral: String,
        #[arg(required = true)]
        consents: Vec<String>,
    },
    /// Ask a peripheral to delete a consent and drop it locally
    Revoke { peripheral: String, consent: String },
    /// Register a device manually
    Register {
        mac_address: String,
        name: String,
        device_type: String,
        serial_number: String,
    },
    /// List registered devices
    Devices,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_tracing(cli.verbose, config.log_dir.as_deref())?;

    match cli.command {
        Commands::Scan { secs } => cmd_scan(config, secs).await,
        Commands::Connect { peripheral } => cmd_connect(config, peripheral).await,
        Commands::Disconnect { peripheral } => cmd_disconnect(config, peripheral, false).await,
        Commands::Forget { peripheral } => cmd_disconnect(config, peripheral, true).await,
        Commands::Consents { search } => cmd_consents(config, search).await,
        Commands::Show {
            peripheral,
            consent,
        } => cmd_show(config, peripheral, consent).await,
        Commands::Accept {
            peripheral,
            consents,
        } => cmd_accept(config, peripheral, consents).await,
        Commands::Revoke {
            peripheral,
            consent,
        } => cmd_revoke(config, peripheral, consent).await,
        Commands::Register {
            mac_address,
            name,
            device_type,
            serial_number,
        } => cmd_register(config, mac_address, name, device_type, serial_number),
        Commands::Devices => cmd_devices(config),
        Commands::Config { action } => cmd_config(config, action),
    }
}

fn init_tracing(verbose: bool, log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "adpc.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn open_storage(config: &config::Config) -> Result<Arc<dyn StorageBackend>> {
    let path = config.ledger_path()?;
    let storage = SledStorage::open(&path)
        .with_context(|| format!("Failed to open ledger at {}", path.display()))?;
    Ok(Arc::new(storage))
}

/// Bring up the radio-backed central
async fn open_central(config: &config::Config) -> Result<ConsentCentral> {
    let storage = open_storage(config)?;
    let (tx, rx) = event_channel();
    let radio = central::BtleCentral::open(tx)
        .await
        .context("Failed to open Bluetooth adapter")?;
    let mut central_config = config.central.clone();
    // Scans are started explicitly by each command
    central_config.scan_on_radio_on = false;
    ConsentCentral::start(radio, storage, central_config, rx).context("Failed to start central")
}

/// Scan until `id` shows up or the window runs out
async fn find_peripheral(central: &ConsentCentral, id: &PeripheralId) -> Result<()> {
    if central.registry().contains(id) {
        return Ok(());
    }
    central.scan().await.context("Scan failed")?;
    let window = central.config().scan_window();
    let mut discovered = central.registry().subscribe_discovered();
    let found = tokio::time::timeout(
        window,
        discovered.wait_for(|peripherals| peripherals.iter().any(|p| &p.id == id)),
    )
    .await;
    let _ = central.stop_scan().await;
    match found {
        Ok(Ok(_)) => Ok(()),
        _ => anyhow::bail!("Peripheral {} not found within {:?}", id, window),
    }
}

async fn cmd_scan(mut config: config::Config, secs: Option<u64>) -> Result<()> {
    if let Some(secs) = secs {
        config.central.scan_window_secs = secs;
    }
    let central = open_central(&config).await?;

    println!(
        "{} ({}s window)",
        "Scanning...".bold(),
        config.central.scan_window_secs
    );
    central.scan().await.context("Scan failed")?;
    tokio::time::sleep(central.config().scan_window()).await;

    let peripherals = central.discovered();
    if peripherals.is_empty() {
        println!("{}", "No peripherals found.".dimmed());
    } else {
        println!("{} ({} found)", "Peripherals".bold(), peripherals.len());
        println!();
        for peripheral in &peripherals {
            print_peripheral(peripheral);
        }
    }
    central.shutdown().await;
    Ok(())
}

async fn cmd_connect(config: config::Config, peripheral: String) -> Result<()> {
    let central = open_central(&config).await?;
    let id = PeripheralId::new(peripheral);
    find_peripheral(&central, &id).await?;

    let result = central.connect(&id).await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            central.shutdown().await;
            return Err(e).with_context(|| format!("Failed to connect to {}", id));
        }
    };

    println!(
        "{} Connected to {}",
        "✓".green(),
        outcome.peripheral.display_name().bright_cyan()
    );
    match outcome.stored {
        UpsertOutcome::Duplicate => println!(
            "  Consent {} already stored",
            outcome.record.id.as_str().bright_yellow()
        ),
        _ => println!(
            "  Stored consent {}",
            outcome.record.id.as_str().bright_yellow()
        ),
    }
    println!("  {}", outcome.record.summary);
    central.shutdown().await;
    Ok(())
}

async fn cmd_disconnect(config: config::Config, peripheral: String, forget: bool) -> Result<()> {
    let central = open_central(&config).await?;
    let id = PeripheralId::new(peripheral);
    find_peripheral(&central, &id).await?;

    let result = if forget {
        central.forget(&id).await
    } else {
        central.disconnect(&id).await
    };
    central.shutdown().await;
    result.with_context(|| format!("Failed to disconnect {}", id))?;

    let verb = if forget { "Forgot" } else { "Disconnected" };
    println!("{} {} {}", "✓".green(), verb, id.as_str().bright_cyan());
    Ok(())
}

async fn cmd_consents(config: config::Config, search: Option<String>) -> Result<()> {
    let ledger = ConsentLedger::spawn(open_storage(&config)?, config.central.storage_key.clone());
    let entries = match &search {
        Some(query) => ledger.search(query),
        None => ledger.list(),
    };

    if entries.is_empty() {
        println!("{}", "No consents stored.".dimmed());
    } else {
        for entry in &entries {
            print_entry(entry);
        }
    }
    ledger.close().await;
    Ok(())
}

async fn cmd_show(config: config::Config, peripheral: String, consent: String) -> Result<()> {
    let ledger = ConsentLedger::spawn(open_storage(&config)?, config.central.storage_key.clone());
    let record = ledger.query(&peripheral, &consent);
    ledger.close().await;

    let record = record
        .with_context(|| format!("No consent {} stored for {}", consent, peripheral))?;
    println!("{}", "Consent Details".bold());
    for (name, value) in CONSENT_FIELD_NAMES.into_iter().zip(record.fields()) {
        println!("  {:<14} {}", format!("{}:", name).bright_cyan(), value);
    }
    Ok(())
}

async fn cmd_accept(config: config::Config, peripheral: String, consents: Vec<String>) -> Result<()> {
    let central = open_central(&config).await?;
    let id = PeripheralId::new(peripheral);
    let ids: Vec<ConsentId> = consents.into_iter().map(ConsentId::new).collect();

    let result = async {
        find_peripheral(&central, &id).await?;
        central.connect(&id).await?;
        central.give_consents(&id, &ids).await?;
        anyhow::Ok(())
    }
    .await;
    central.shutdown().await;
    result.with_context(|| format!("Failed to accept consents on {}", id))?;

    println!("{} Accepted {} consent(s) on {}", "✓".green(), ids.len(), id.as_str().bright_cyan());
    Ok(())
}

async fn cmd_revoke(config: config::Config, peripheral: String, consent: String) -> Result<()> {
    let central = open_central(&config).await?;
    let id = PeripheralId::new(peripheral);
    let consent = ConsentId::new(consent);

    let result = async {
        find_peripheral(&central, &id).await?;
        central.connect(&id).await?;
        Ok::<_, anyhow::Error>(central.revoke_consent(&id, &consent).await?)
    }
    .await;
    central.shutdown().await;
    let outcome = result.with_context(|| format!("Failed to revoke {}", consent))?;

    match &outcome.transmitted {
        Ok(()) => println!("  {} Delete request sent", "✓".green()),
        Err(e) => println!("  {} Delete request failed: {}", "✗".red(), e),
    }
    match &outcome.removed {
        Ok(_) => println!("  {} Removed from ledger", "✓".green()),
        Err(e) => println!("  {} Ledger update failed: {}", "✗".red(), e),
    }
    if !outcome.is_complete() {
        println!(
            "{}",
            "Device and ledger may now disagree about this consent.".bright_red()
        );
        anyhow::bail!("Revoke only partially applied");
    }
    Ok(())
}

fn cmd_register(
    config: config::Config,
    mac_address: String,
    name: String,
    device_type: String,
    serial_number: String,
) -> Result<()> {
    let registry = DeviceRegistry::new(open_storage(&config)?);
    registry.register(RegisteredDevice::new(
        mac_address.clone(),
        name.clone(),
        device_type,
        serial_number,
    ))?;
    println!("{} Registered {} ({})", "✓".green(), name.bright_cyan(), mac_address);
    Ok(())
}

fn cmd_devices(config: config::Config) -> Result<()> {
    let registry = DeviceRegistry::new(open_storage(&config)?);
    let devices = registry.list();

    if devices.is_empty() {
        println!("{}", "No registered devices.".dimmed());
    } else {
        println!("{} ({} total)", "Registered Devices".bold(), devices.len());
        println!();
        for device in devices {
            println!("  {} {}", "•".bright_green(), device.device_name.bright_cyan());
            println!("    MAC:    {}", device.mac_address);
            println!("    Type:   {}", device.device_type);
            println!("    Serial: {}", device.serial_number.dimmed());
        }
    }
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
            println!();
            println!("  {:<20} {}", "config_file".bright_cyan(), config::Config::config_file()?.display());
        }
    }
    Ok(())
}

fn print_peripheral(peripheral: &Peripheral) {
    let status = if peripheral.connected {
        "connected".green()
    } else {
        "seen".dimmed()
    };
    println!(
        "  {} {} [{}]",
        "•".bright_green(),
        peripheral.display_name().bright_cyan(),
        status
    );
    println!("    ID:   {}", peripheral.id);
    println!("    RSSI: {} dBm", peripheral.rssi);
}

fn print_entry(entry: &DeviceConsentEntry) {
    println!(
        "{} {}",
        entry.device_name.bold(),
        format!("({})", entry.peripheral_id).dimmed()
    );
    for consent in &entry.consents {
        println!("  {} {}", "•".bright_green(), consent.id.as_str().bright_yellow());
        if !consent.summary.is_empty() {
            println!("    {}", consent.summary);
        }
    }
    println!();
}

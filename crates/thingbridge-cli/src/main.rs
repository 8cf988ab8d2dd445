//! Command-line interface for ThingBridge.

mod bridge;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use thingbridge_core::config::env_vars;
use thingbridge_core::AppConfig;
use thingbridge_devices::{MessageTransport, MqttTransport};
use thingbridge_provisioning::{
    load_refund_policy, BrokerSettings, ProvisionRequest, ProvisioningManager,
};
use thingbridge_storage::{
    DeviceModel, FeatureBlueprint, LicenseStore, MemoryStateStore, Placement, Protocol,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::bridge::Bridge;

const STATE_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// ThingBridge - licensed device provisioning and control.
#[derive(Parser, Debug)]
#[command(name = "thingbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker, run the reconciler and job processor, and
    /// read JSON control requests (provision, dispatch, shadow, usage) from
    /// stdin, one per line.
    Serve,
    /// Provision one physical unit while no server holds the store.
    ///
    /// Shadow keys of a retired token live in the server's state store;
    /// send `provision` requests to a running `serve` instead.
    Provision {
        /// MAC, IMEI or serial number.
        #[arg(long)]
        physical_id: String,
        /// Tenant (partner) code.
        #[arg(long)]
        tenant: String,
        /// Device model code.
        #[arg(long)]
        model: String,
        /// Owner to bind the device to.
        #[arg(long)]
        owner: String,
        #[arg(long)]
        home: Option<String>,
        #[arg(long)]
        room: Option<String>,
        /// Display name; defaults to the physical identifier.
        #[arg(long)]
        name: Option<String>,
    },
    /// Tenant, model and quota administration.
    Admin {
        #[command(subcommand)]
        admin_cmd: AdminCommand,
    },
}

/// Admin subcommands.
#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Create a tenant.
    PartnerCreate {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
    },
    /// Create a device model from a JSON feature blueprint.
    ModelCreate {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "mqtt")]
        protocol: String,
        /// JSON file holding an array of features.
        #[arg(long)]
        features: Option<PathBuf>,
    },
    /// Create or resize a quota.
    QuotaSet {
        #[arg(long)]
        partner: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        max: u32,
        /// Deactivate the quota instead of activating it.
        #[arg(long)]
        inactive: bool,
    },
    /// Print quota usage per tenant.
    Usage,
    /// Set a system configuration row.
    ConfigSet {
        #[arg(required = true)]
        key: String,
        #[arg(required = true)]
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Serve => run_server(config).await,
        Command::Provision {
            physical_id,
            tenant,
            model,
            owner,
            home,
            room,
            name,
        } => {
            let mut request = ProvisionRequest::new(physical_id, tenant, model, owner)
                .with_placement(Placement {
                    home_id: home,
                    room_id: room,
                });
            if let Some(name) = name {
                request = request.with_name(name);
            }
            run_provision(config, request).await
        }
        Command::Admin { admin_cmd } => run_admin(config, admin_cmd),
    }
}

fn init_logging(verbose: bool) {
    // JSON output when THINGBRIDGE_LOG_JSON=true
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "thingbridge=debug" } else { "thingbridge=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

fn open_store(config: &AppConfig) -> Result<Arc<LicenseStore>> {
    match LicenseStore::open(&config.storage.path) {
        Ok(store) => Ok(store),
        Err(thingbridge_storage::Error::Locked(path)) => bail!(
            "{path} is held by a running `thingbridge serve`; send the request to its console instead"
        ),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to open store at {}", config.storage.path))
        }
    }
}

/// Run the device-facing server until Ctrl-C or `quit`.
async fn run_server(config: AppConfig) -> Result<()> {
    let store = open_store(&config)?;

    let mqtt = Arc::new(MqttTransport::connect(&config.mqtt));
    let transport: Arc<dyn MessageTransport> = mqtt.clone();
    let bridge = Bridge::new(&config, store, transport.clone()).await?;
    let reconciler_task = bridge.start(transport).await;

    let purge_state = bridge.state().clone();
    let purge_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATE_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let purged = purge_state.purge_expired();
            if purged > 0 {
                debug!(purged, "Expired state keys purged");
            }
        }
    });

    let mut event_rx = bridge.events().subscribe();
    let event_task = tokio::spawn(async move {
        while let Some((event, meta)) = event_rx.recv().await {
            debug!(event = event.name(), room = %meta.room, source = %meta.source, "Device event");
        }
    });

    info!(
        db = %config.storage.path,
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        "ThingBridge running, press Ctrl-C to stop"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if line == "quit" || line == "exit" {
                            break;
                        }
                        println!("{}", bridge.handle_line(line).await);
                    }
                    // Detached from a terminal: keep serving until Ctrl-C
                    None => stdin_open = false,
                }
            }
        }
    }
    info!("Shutting down");

    bridge.stop().await;
    mqtt.disconnect().await;
    reconciler_task.abort();
    purge_task.abort();
    event_task.abort();
    Ok(())
}

async fn run_provision(config: AppConfig, request: ProvisionRequest) -> Result<()> {
    let store = open_store(&config)?;
    let refund = load_refund_policy(&store, config.provisioning.refund_on_transfer).await?;
    let manager = ProvisioningManager::new(
        store,
        Arc::new(MemoryStateStore::new()),
        refund,
        BrokerSettings::from_config(&config.mqtt),
    );

    let result = manager.provision(request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_admin(config: AppConfig, cmd: AdminCommand) -> Result<()> {
    let store = open_store(&config)?;

    match cmd {
        AdminCommand::PartnerCreate { code, name } => {
            let partner = store.create_partner(&code, &name)?;
            println!("{}", serde_json::to_string_pretty(&partner)?);
        }
        AdminCommand::ModelCreate {
            code,
            name,
            protocol,
            features,
        } => {
            let protocol: Protocol = protocol.parse()?;
            let mut model = DeviceModel::new(code, name, protocol);
            if let Some(path) = features {
                model.features = read_blueprint(&path)?;
            }
            let model = store.create_model(model)?;
            println!("{}", serde_json::to_string_pretty(&model)?);
        }
        AdminCommand::QuotaSet {
            partner,
            model,
            max,
            inactive,
        } => {
            let quota = store.upsert_quota(&partner, &model, max, !inactive)?;
            println!("{}", serde_json::to_string_pretty(&quota)?);
        }
        AdminCommand::Usage => {
            let usage = store.partners_usage()?;
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
        AdminCommand::ConfigSet { key, value } => {
            store.set_system_config(&key, &value)?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}

fn read_blueprint(path: &Path) -> Result<Vec<FeatureBlueprint>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid blueprint in {}", path.display()))
}

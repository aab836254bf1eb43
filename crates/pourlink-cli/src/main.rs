//! `pourlink` – telemetry bridge for the beverage pouring cell.
//!
//! Wires the whole stack together:
//!
//! 1. Loads `~/.pourlink/config.toml` (all fields optional).
//! 2. Connects to the message broker and subscribes to the cell's topics.
//! 3. Spawns the processing pipeline and the viewer WebSocket server.
//! 4. Intercepts **Ctrl-C** to dispatch a final `stop` command and exit.

mod config;

use std::sync::Arc;

use pourlink_broker::{BrokerConnector, UpdateBus, WsTransport};
use pourlink_cockpit::{CockpitServer, SessionRegistry};
use pourlink_processor::{
    BridgePipeline, CommandGate, TopicTable, shared_command_validator, telemetry,
};
use pourlink_types::{BridgeError, CommandRequest, WeightFilter};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Topics the bridge subscribes to on startup, derived from the configured
/// topic table.
fn subscription_set(topics: &TopicTable) -> Vec<String> {
    let mut set: Vec<String> = WeightFilter::all()
        .iter()
        .map(|f| f.broker_topic().to_string())
        .collect();
    set.extend(topics.raw_weight_aliases.iter().cloned());
    set.push(topics.concentration.clone());
    set.push(topics.scenario.clone());
    set.push(topics.command.clone());
    set.push(format!("{}#", topics.command_prefix));
    set
}

fn main() {
    // Tracing must come up before the Tokio runtime; the OTLP exporter is
    // synchronous for exactly this reason.
    let _guard = telemetry::init_tracing("pourlink");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[pourlink] failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        error!(error = %e, "bridge exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BridgeError> {
    let cfg = match config::load()? {
        Some(cfg) => {
            info!(path = %config::config_path().display(), "config loaded");
            cfg
        }
        None => {
            info!("no config file found, using defaults");
            config::Config::default()
        }
    };

    info!(
        broker = %cfg.broker_url,
        cockpit_port = cfg.cockpit_port,
        "pourlink bridge v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // ── Broker link ────────────────────────────────────────────────────────
    let (broker, inbound, connectivity) =
        BrokerConnector::spawn(cfg.broker_config(), Arc::new(WsTransport));
    broker.subscribe(subscription_set(&cfg.topics)).await?;

    // ── Pipeline ───────────────────────────────────────────────────────────
    let bus = UpdateBus::default();
    let validator = shared_command_validator(cfg.robot.clone());
    let handles = BridgePipeline::spawn(
        cfg.pipeline_config(),
        validator.clone(),
        inbound,
        connectivity.clone(),
        bus.clone(),
    );

    let gate = Arc::new(CommandGate::new(
        validator,
        broker,
        handles.intake.clone(),
        connectivity,
    ));

    // ── Viewer server ──────────────────────────────────────────────────────
    let registry = SessionRegistry::new(handles.intake.clone());
    let server = CockpitServer::new(
        bus,
        handles.snapshots.clone(),
        Arc::clone(&gate),
        registry,
    )
    .with_port(cfg.cockpit_port)
    .with_session_config(cfg.session_config());

    let mut server_task = tokio::spawn(server.run());

    // ── Ctrl-C ─────────────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    tokio::select! {
        _ = shutdown_rx.changed() => {
            info!("Ctrl-C received, shutting down");
            // Halt the arm before the bridge goes away. Failure only means
            // the broker was already unreachable.
            match gate.submit(CommandRequest::Stop, "bridge-shutdown").await {
                Ok((_, ack)) => info!(qos = ack.qos, "final stop dispatched"),
                Err(e) => warn!(error = %e, "final stop not delivered"),
            }
        }
        result = &mut server_task => {
            match result {
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {}
                Err(e) => return Err(BridgeError::Channel(format!("cockpit task failed: {e}"))),
            }
        }
    }

    Ok(())
}

//! `gantry-cli` – the `gantry` binary
//!
//! Wires the whole bridge together and runs it until Ctrl-C:
//!
//! 1. Initialises tracing (see [`telemetry`]).
//! 2. Loads `~/.gantry/config.toml` (writing defaults on first run) and
//!    applies `GANTRY_*` overrides.
//! 3. Validates the point map; a bad map is fatal before anything connects.
//! 4. Starts the session supervisor against the simulated PLC or, with the
//!    `opcua` feature, a real OPC UA endpoint.
//! 5. Serves the cockpit (WebSocket + HTTP) on the API port.
//! 6. On **Ctrl-C** stops accepting clients and tears the session down within
//!    the configured shutdown timeout.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use gantry_cockpit::{CockpitServer, FanoutHub, action_timeout_for};
use gantry_hal::{PointRegistry, SimPlc, Transport};
use gantry_middleware::{ControlDispatcher, SessionManager, SubscriptionEngine};
use gantry_types::GantryError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{Config, TransportKind};

/// Sensor changes buffered between the subscription and the hub.
const NOTIFICATION_BUFFER: usize = 256;

fn main() -> ExitCode {
    // Before the runtime exists: the OTLP exporter is synchronous.
    let _guard = telemetry::init_tracing("gantry");

    print_banner();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "gantry stopped");
            println!("{}: {}", "Fatal".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), GantryError> {
    let cfg = config::load_or_init()?;
    let registry = PointRegistry::from_config(cfg.points.namespace, &cfg.points.nodes)?;
    let transport = build_transport(&cfg, &registry)?;

    println!(
        "  Upstream  {} ({})",
        transport.endpoint().bold(),
        cfg.transport.to_string().dimmed()
    );

    let (notifications, readings) = mpsc::channel(NOTIFICATION_BUFFER);
    let engine = SubscriptionEngine::new(registry.clone(), cfg.monitoring.to_params(), notifications);
    let session_config = cfg.session.to_session_config();
    let action_timeout = action_timeout_for(session_config.request_timeout);
    let session = SessionManager::new(transport, engine, session_config);
    session.start();

    let dispatcher = ControlDispatcher::new(session.clone(), registry);
    let hub = FanoutHub::with_action_timeout(Arc::new(dispatcher), action_timeout);
    tokio::spawn(hub.clone().run(readings));

    let bound = CockpitServer::new(hub).with_port(cfg.api_port).bind().await?;
    println!(
        "  Cockpit   {}\n",
        format!("ws://{}", bound.local_addr()).bold()
    );

    bound.serve_until(shutdown_signal()).await?;

    println!();
    println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
    session.close().await;
    println!("{}", "  ✓ Session closed.".green());
    info!("gantry stopped");
    Ok(())
}

fn build_transport(cfg: &Config, registry: &PointRegistry) -> Result<Arc<dyn Transport>, GantryError> {
    match cfg.transport {
        TransportKind::Sim => {
            let plc = SimPlc::new(registry.clone())
                .with_travel_time(Duration::from_millis(cfg.sim.travel_time_ms));
            Ok(Arc::new(plc))
        }
        #[cfg(feature = "opcua")]
        TransportKind::Opcua => Ok(Arc::new(gantry_hal::OpcUaTransport::new(
            cfg.endpoint_url.clone(),
        ))),
        #[cfg(not(feature = "opcua"))]
        TransportKind::Opcua => Err(GantryError::Config(format!(
            "transport 'opcua' for {} needs a build with `--features opcua`",
            cfg.endpoint_url
        ))),
    }
}

/// Resolves on Ctrl-C.  If the handler cannot be installed the server runs
/// until killed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown unavailable");
        std::future::pending::<()>().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____             _            "#.bold().cyan());
    println!("{}", r#"  / ___| __ _ _ __ | |_ _ __ _   _ "#.bold().cyan());
    println!("{}", r#" | |  _ / _` | '_ \| __| '__| | | |"#.bold().cyan());
    println!("{}", r#" | |_| | (_| | | | | |_| |  | |_| |"#.bold().cyan());
    println!("{}", r#"  \____|\__,_|_| |_|\__|_|   \__, |"#.bold().cyan());
    println!("{}", r#"                             |___/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Gantry".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  PLC bridge for the gantry crane");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_transport_is_built_by_default() {
        let cfg = Config::default();
        let transport = build_transport(&cfg, &PointRegistry::new(3)).unwrap();
        assert_eq!(transport.endpoint(), gantry_hal::sim::SIM_ENDPOINT);
    }

    #[cfg(not(feature = "opcua"))]
    #[test]
    fn opcua_without_feature_is_a_config_error() {
        let cfg = Config {
            transport: TransportKind::Opcua,
            ..Config::default()
        };
        let err = build_transport(&cfg, &PointRegistry::new(3)).err().unwrap();
        assert!(matches!(err, GantryError::Config(_)));
    }
}

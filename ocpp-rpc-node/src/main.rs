//! OCPP RPC Node - CLI running the OCPP-J transport server
//!
//! Accepts station connections and answers the station-initiated messages
//! every central system has to handle (BootNotification, Heartbeat,
//! StatusNotification).
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:8010, /ocpp)
//! ocpp-rpc-node
//!
//! # Custom bind address and keepalive
//! ocpp-rpc-node --bind 127.0.0.1:9000 --ping-interval 10 --max-missed-pings 3
//!
//! # Only accept OCPP 1.6
//! ocpp-rpc-node --protocol ocpp1.6
//! ```
//!
//! Stations connect to
//! `ws://<bind>/<base-path>/<tenant>/<station>/<siteArea>/<site>/<company>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use ocpp_rpc::ocpp::{
    Action, BootNotificationRequest, BootNotificationResponse, HeartbeatResponse,
    RegistrationStatus, StatusNotificationRequest,
};
use ocpp_rpc::rpc::{parse_payload, to_payload};
use ocpp_rpc::{
    CommandHandler, CommandHandlers, ConnectionContext, ConnectionRegistry, HandlerError,
    ServerConfig, TransportServer,
};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// OCPP-J central system transport node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8010")]
    bind: SocketAddr,

    /// Path prefix in front of the station route
    #[arg(long, default_value = "/ocpp")]
    base_path: String,

    /// Supported sub-protocols (can be repeated, default: ocpp1.6, ocpp2.0, ocpp2.0.1)
    #[arg(long)]
    protocol: Vec<String>,

    /// Keepalive ping interval in seconds
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    ping_interval: u64,

    /// Idle intervals tolerated before a station is disconnected
    #[arg(long, default_value = "2")]
    max_missed_pings: u32,

    /// Outbound call timeout in seconds
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    call_timeout: u64,

    /// Heartbeat interval handed out in BootNotification responses, in seconds
    #[arg(long, default_value = "300")]
    heartbeat_interval: i32,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Accepts every station and hands out the configured heartbeat interval
struct BootNotificationHandler {
    heartbeat_interval: i32,
}

#[async_trait]
impl CommandHandler for BootNotificationHandler {
    async fn handle(
        &self,
        context: Arc<ConnectionContext>,
        payload: Value,
    ) -> Result<Value, HandlerError> {
        let request: BootNotificationRequest = parse_payload(payload)?;
        info!(
            tenant = %context.tenant_id,
            station = %context.station_identity,
            vendor = %request.charge_point_vendor,
            model = %request.charge_point_model,
            "Station booted"
        );

        to_payload(&BootNotificationResponse {
            current_time: Utc::now(),
            interval: self.heartbeat_interval,
            status: RegistrationStatus::Accepted,
        })
    }
}

fn default_handlers(heartbeat_interval: i32) -> CommandHandlers {
    let mut handlers = CommandHandlers::new()
        .on(Action::Heartbeat, |_ctx, _payload| async {
            to_payload(&HeartbeatResponse {
                current_time: Utc::now(),
            })
        })
        .on(Action::StatusNotification, |ctx: Arc<ConnectionContext>, payload| async move {
            let request: StatusNotificationRequest = parse_payload(payload)?;
            info!(
                tenant = %ctx.tenant_id,
                station = %ctx.station_identity,
                connector = request.connector_id,
                status = ?request.status,
                error_code = %request.error_code,
                "Status notification"
            );
            Ok(json!({}))
        });

    handlers.insert(
        Action::BootNotification,
        Arc::new(BootNotificationHandler { heartbeat_interval }),
    );
    handlers
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    // Build configuration
    let mut config = ServerConfig::new(args.bind)
        .with_base_path(&args.base_path)
        .with_ping_interval(Duration::from_secs(args.ping_interval))
        .with_max_missed_pings(args.max_missed_pings)
        .with_call_timeout(Duration::from_secs(args.call_timeout));
    if !args.protocol.is_empty() {
        config = config.with_protocols(args.protocol.clone());
    }

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP RPC Node - Central System Transport        ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Bind:      {:<49} ║", config.bind_addr);
    println!("║  Path:      {:<49} ║", truncate(&config.base_path, 49));
    println!("║  Protocols: {:<49} ║", truncate(&config.protocols.join(", "), 49));
    println!("║  Ping:      {:<49} ║", format!("{}s x {}", args.ping_interval, config.max_missed_pings));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let registry = Arc::new(ConnectionRegistry::new());
    let handlers = default_handlers(args.heartbeat_interval);
    info!(actions = ?handlers.actions(), "Handlers registered");

    let server = TransportServer::bind(config, registry, handlers).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down...");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

//! OCPP Gateway Node - charge station websocket gateway
//!
//! Accepts OCPP-J websocket connections from charge stations, authenticates
//! them against the manager's device registry and bridges every session to
//! the CSMS message bus.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! ocpp-gateway
//!
//! # Behind a TLS-terminating proxy, accepting client certificates of one org
//! ocpp-gateway --ws-addr 0.0.0.0:9310 --trust-proxy \
//!     --registry-url http://manager:9410 --mqtt-url mqtt://broker:1883 \
//!     --org-name "Example Charging"
//!
//! # Shorter response timeout, verbose logging
//! ocpp-gateway --response-timeout-ms 5000 --log-level debug
//! ```
//!
//! `RUST_LOG` takes precedence over `--log-level`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_gateway_core::PipeConfig;
use ocpp_gateway_server::mqtt::{DEFAULT_MQTT_CLIENT_ID, DEFAULT_MQTT_URL};
use ocpp_gateway_server::{GatewayConfig, GatewayServer, MqttBus, MqttConfig, RemoteRegistry};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// OCPP charge station gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Websocket listen address
    #[arg(long, default_value = "127.0.0.1:9310")]
    ws_addr: SocketAddr,

    /// Manager API base URL for charge station and certificate lookups
    #[arg(long, default_value = "http://127.0.0.1:9410")]
    registry_url: String,

    /// MQTT broker URL
    #[arg(long, default_value = DEFAULT_MQTT_URL)]
    mqtt_url: String,

    /// MQTT client id
    #[arg(long, default_value = DEFAULT_MQTT_CLIENT_ID)]
    mqtt_client_id: String,

    /// Message bus topic prefix
    #[arg(long, default_value = "cs")]
    topic_prefix: String,

    /// Trust X-Forwarded-Proto and X-Client-Cert-* headers from a TLS proxy
    #[arg(long)]
    trust_proxy: bool,

    /// Organization accepted on client certificates (repeatable)
    #[arg(long = "org-name")]
    org_names: Vec<String>,

    /// How long a session waits for a response before abandoning a call
    #[arg(long, default_value = "10000")]
    response_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let pipe = PipeConfig::default()
        .with_response_timeout(Duration::from_millis(args.response_timeout_ms));
    pipe.validate()?;

    let config = GatewayConfig::new(args.ws_addr)
        .with_topic_prefix(&args.topic_prefix)
        .with_trust_proxy_headers(args.trust_proxy)
        .with_org_names(args.org_names)
        .with_pipe_config(pipe);

    let registry = RemoteRegistry::new(&args.registry_url)?;
    info!("Using device registry at {}", registry.base_url());

    let mqtt = MqttConfig::from_url(&args.mqtt_url)?.with_client_id(&args.mqtt_client_id);
    let bus = MqttBus::connect(&mqtt)?;

    let server = GatewayServer::new(config, Arc::new(registry), Arc::new(bus));
    let handle = server.spawn().await?;
    info!("Gateway ready on ws://{}/ws/{{id}}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.shutdown().await?;

    Ok(())
}

//! # OCPP Gateway Server
//!
//! Terminates charge station websockets and bridges each session to the
//! CSMS over a message bus.
//!
//! ## Connection flow
//!
//! 1. A charge station connects to `/ws/{id}`
//! 2. The station is looked up in the [`DeviceRegistry`] (404 if unknown,
//!    500 if the lookup fails)
//! 3. The connection is checked against the station's security profile
//!    (401 on failure)
//! 4. The websocket is upgraded with subprotocol `ocpp2.0.1` or `ocpp1.6`
//! 5. A [`Pipe`](ocpp_gateway_core::Pipe) brokers OCPP-J traffic between
//!    the websocket and the session's [`MessageBus`] topics until the
//!    websocket closes
//!
//! In production the bus is an [`MqttBus`]; tests and embedded use can run
//! on the in-process [`LocalBus`].
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_gateway_server::{
//!     ChargeStation, GatewayConfig, GatewayServer, InMemoryRegistry, MqttBus, MqttConfig,
//!     SecurityProfile,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = InMemoryRegistry::new();
//!     registry.add_charge_station(
//!         ChargeStation::new("cs001", SecurityProfile::UnsecuredTransportWithBasicAuth)
//!             .with_password_hash(ocpp_gateway_server::auth::hash_password("secret")),
//!     );
//!
//!     let bus = MqttBus::connect(&MqttConfig::from_url("mqtt://127.0.0.1:1883")?)?;
//!     let server = GatewayServer::new(GatewayConfig::default(), Arc::new(registry), Arc::new(bus));
//!     let handle = server.spawn().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bus;
pub mod config;
pub mod mqtt;
pub mod registry;
mod server;
mod session;

use ocpp_gateway_core::PipeError;
use thiserror::Error;

pub use bus::{BusError, LocalBus, MessageBus, SessionTopics, Subscription};
pub use config::GatewayConfig;
pub use mqtt::{MqttBus, MqttConfig};
pub use registry::{
    Certificate, ChargeStation, DeviceRegistry, InMemoryRegistry, RegistryError, RemoteRegistry,
    SecurityProfile,
};
pub use server::{GatewayServer, GatewayServerHandle};
pub use session::{DEFAULT_SUBPROTOCOL, SUBPROTOCOLS};

/// Server-level errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),

    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),
}

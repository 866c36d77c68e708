//! # OCPP Gateway Core
//!
//! Message codec and per-session RPC pipe for an OCPP-J charge station
//! gateway.
//!
//! ## Architecture
//!
//! ```text
//! Charge Station
//!       │ WebSocket, OCPP-J frames
//!       ▼
//! ┌─────────────────────────────────┐
//! │    transport adapter            │  ocpp::Message ⇄ GatewayMessage
//! └─────────────┬───────────────────┘
//!               ▼
//! ┌─────────────────────────────────┐
//! │    Pipe (one per session)       │
//! │  call/response state machine    │
//! └─────────────┬───────────────────┘
//!               ▼
//! ┌─────────────────────────────────┐
//! │    message bus adapter          │  GatewayMessage as JSON
//! └─────────────────────────────────┘
//!       │
//!       ▼
//! CSMS (Backend)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_gateway_core::{GatewayMessage, Pipe, PipeConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (mut pipe, mut channels) = Pipe::new(PipeConfig::default())?;
//!     pipe.start()?;
//!
//!     channels
//!         .charge_station_rx
//!         .send(GatewayMessage::call("1", "Heartbeat", json!({})))
//!         .await?;
//!     let forwarded = channels.csms_tx.recv().await;
//!     println!("{:?}", forwarded);
//!
//!     pipe.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ocpp;
pub mod pipe;

pub use config::PipeConfig;
pub use ocpp::{ErrorCode, Message, MessageType, OcppError};
pub use pipe::{
    CallErrorMessage, CallMessage, CallResultMessage, GatewayMessage, Pipe, PipeChannels,
    PipeError,
};

//! HTTP server: websocket endpoint and health check

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::MessageBus;
use crate::config::GatewayConfig;
use crate::registry::DeviceRegistry;
use crate::session;
use crate::GatewayError;

/// Shared by every request handler
pub(crate) struct GatewayState {
    pub(crate) config: GatewayConfig,
    pub(crate) registry: Arc<dyn DeviceRegistry>,
    pub(crate) bus: Arc<dyn MessageBus>,
}

/// Charge station gateway server
#[derive(Clone)]
pub struct GatewayServer {
    config: GatewayConfig,
    registry: Arc<dyn DeviceRegistry>,
    bus: Arc<dyn MessageBus>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn DeviceRegistry>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Routes: `/ws/:id` for charge stations, `/health` for liveness checks
    pub fn router(&self) -> Router {
        let state = Arc::new(GatewayState {
            config: self.config.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
        });

        Router::new()
            .route("/ws/:id", get(session::connect))
            .route("/health", get(health))
            .with_state(state)
    }

    /// Bind the configured address and serve until shut down
    pub async fn spawn(self) -> Result<GatewayServerHandle, GatewayError> {
        let listener = TcpListener::bind(self.config.ws_addr).await?;
        let address = listener.local_addr()?;
        info!("Gateway listening on {}", address);

        let app = self.router();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = server.await {
                error!("Gateway server exited with error: {}", e);
            }
        });

        Ok(GatewayServerHandle {
            address,
            shutdown: shutdown_tx,
            task,
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

/// Handle to a running gateway server
pub struct GatewayServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GatewayServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting connections and wait for the server task.
    ///
    /// Established sessions run until their websocket closes.
    pub async fn shutdown(self) -> Result<(), GatewayError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))
    }
}

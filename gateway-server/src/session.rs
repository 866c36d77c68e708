//! Charge station websocket sessions
//!
//! Every accepted websocket gets its own [`Pipe`] and four transports
//! around it:
//!
//! ```text
//!  websocket ──read──► charge_station_rx ┐       ┌► csms_tx ──publish──► {prefix}/in/…
//!                                        ├ Pipe ─┤
//!  websocket ◄─write── charge_station_tx ┘       └◄ csms_rx ◄─subscribe── {prefix}/out/…
//! ```
//!
//! Frames the gateway cannot decode are answered with an
//! `RpcFrameworkError` CallError carrying message id `-1`.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ocpp_gateway_core::{ErrorCode, GatewayMessage, Pipe, PipeChannels};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::auth::{self, BasicCredentials, ConnectionSecurity};
use crate::bus::{self, MessageBus, SessionTopics, Subscription};
use crate::server::GatewayState;
use crate::GatewayError;

/// Websocket subprotocols in order of preference
pub const SUBPROTOCOLS: [&str; 2] = ["ocpp2.0.1", "ocpp1.6"];

/// Protocol assumed when the client negotiates none
pub const DEFAULT_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Message id of CallErrors answering undecodable frames
const REJECTED_MESSAGE_ID: &str = "-1";

/// Upgrade handler for `/ws/:id`.
///
/// The station is looked up and authenticated before the upgrade so that
/// refusals are plain HTTP responses.
pub(crate) async fn connect(
    Path(client_id): Path<String>,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    info!("Websocket connection received for {}", client_id);

    let station = match state.registry.lookup_charge_station(&client_id).await {
        Ok(Some(station)) => station,
        Ok(None) => {
            warn!("Unknown charge station {}", client_id);
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            error!("Lookup charge station {} failed: {}", client_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let security = if state.config.trust_proxy_headers {
        ConnectionSecurity::from_proxy_headers(&headers, state.registry.as_ref()).await
    } else {
        ConnectionSecurity::plain()
    };
    let credentials = BasicCredentials::from_headers(&headers);

    if let Err(e) = auth::authenticate(
        &station,
        &security,
        credentials.as_ref(),
        &state.config.org_names,
    ) {
        warn!(
            "Charge station {} unauthorized (security profile {}): {}",
            client_id,
            station.security_profile.level(),
            e
        );
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.protocols(SUBPROTOCOLS)
        .on_upgrade(move |socket| run(socket, client_id, state))
}

async fn run(socket: WebSocket, client_id: String, state: Arc<GatewayState>) {
    let protocol = socket
        .protocol()
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_SUBPROTOCOL)
        .to_string();

    let span = info_span!("session", cs_id = %client_id, protocol = %protocol);
    async move {
        info!("Session started");
        if let Err(e) = serve(socket, &client_id, &protocol, &state).await {
            error!("Session failed: {}", e);
        }
        info!("Session ended");
    }
    .instrument(span)
    .await
}

async fn serve(
    mut socket: WebSocket,
    client_id: &str,
    protocol: &str,
    state: &GatewayState,
) -> Result<(), GatewayError> {
    let topics = SessionTopics::new(&state.config.topic_prefix, protocol, client_id);

    let subscription = match state.bus.subscribe(&topics.outbound).await {
        Ok(subscription) => subscription,
        Err(e) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::PROTOCOL,
                    reason: "Internal Server Error".into(),
                })))
                .await;
            return Err(e.into());
        }
    };
    debug!("Subscribed to {}", subscription.topic());

    let (mut pipe, channels) = Pipe::new(state.config.pipe.clone())?;
    pipe.start()?;

    let PipeChannels {
        charge_station_rx,
        charge_station_tx,
        csms_rx,
        csms_tx,
    } = channels;

    let (sink, stream) = socket.split();
    let (reject_tx, reject_rx) = mpsc::channel(1);

    let tasks = [
        tokio::spawn(receive_from_csms(subscription, csms_rx).in_current_span()),
        tokio::spawn(
            publish_to_csms(state.bus.clone(), topics.inbound, csms_tx).in_current_span(),
        ),
        tokio::spawn(
            write_to_charge_station(sink, charge_station_tx, reject_rx).in_current_span(),
        ),
    ];

    read_from_charge_station(stream, charge_station_rx, reject_tx).await;

    pipe.close();
    for task in tasks {
        task.abort();
    }

    Ok(())
}

/// Feed CSMS traffic from the session's subscription into the pipe
async fn receive_from_csms(mut subscription: Subscription, csms_rx: mpsc::Sender<GatewayMessage>) {
    while let Some(payload) = subscription.recv().await {
        match bus::decode_message(&payload) {
            Ok(msg) => {
                debug!("Received message {} from CSMS", msg.message_id());
                if csms_rx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => error!("Unmarshalling CSMS message: {}", e),
        }
    }
}

/// Publish everything the pipe sends towards the CSMS
async fn publish_to_csms(
    bus: Arc<dyn MessageBus>,
    topic: String,
    mut csms_tx: mpsc::Receiver<GatewayMessage>,
) {
    while let Some(msg) = csms_tx.recv().await {
        let result = match bus::encode_message(&msg) {
            Ok(payload) => bus.publish(&topic, payload).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!("Publishing message {}: {}", msg.message_id(), e);
        }
    }
}

async fn write_to_charge_station(
    mut sink: SplitSink<WebSocket, Message>,
    mut outgoing: mpsc::Receiver<GatewayMessage>,
    mut rejections: mpsc::Receiver<GatewayMessage>,
) {
    loop {
        let msg = tokio::select! {
            Some(msg) = outgoing.recv() => msg,
            Some(msg) = rejections.recv() => msg,
            else => break,
        };

        let text = match msg.to_ocpp_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Marshaling message {} for charge station: {}", msg.message_id(), e);
                continue;
            }
        };

        debug!("Writing message {} to charge station", msg.message_id());
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!("Writing to charge station: {}", e);
            break;
        }
    }
}

async fn read_from_charge_station(
    mut stream: SplitStream<WebSocket>,
    incoming: mpsc::Sender<GatewayMessage>,
    rejections: mpsc::Sender<GatewayMessage>,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                info!("Connection closed: {}", e);
                break;
            }
        };

        let decoded = match frame {
            Message::Text(text) => {
                GatewayMessage::from_ocpp_bytes(text.as_bytes()).map_err(|e| e.to_string())
            }
            Message::Binary(_) => Err("websocket message type is not text".to_string()),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                match frame {
                    Some(frame) => info!("Connection closed with status {}", frame.code),
                    None => info!("Connection closed"),
                }
                break;
            }
        };

        match decoded {
            Ok(msg) => {
                debug!("Received message {} from charge station", msg.message_id());
                if incoming.send(msg).await.is_err() {
                    break;
                }
            }
            Err(description) => {
                warn!("Sending error message to charge station: {}", description);
                let reply = GatewayMessage::call_error(
                    REJECTED_MESSAGE_ID,
                    ErrorCode::RpcFrameworkError,
                    description,
                );
                if rejections.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }
}

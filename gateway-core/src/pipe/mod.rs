//! Bidirectional RPC pipe between a charge station and the CSMS
//!
//! A [`Pipe`] brokers OCPP-J calls and their responses for one device
//! session. It is agnostic to the transports: the caller feeds the two
//! inbound channels and drains the two outbound channels of
//! [`PipeChannels`].
//!
//! ```text
//!  device ──► charge_station_rx ─┐           ┌─► csms_tx ──► back end
//!                                ├─ control ─┤
//!  device ◄── charge_station_tx ◄┘   loop    └◄─ csms_rx ◄── back end
//! ```
//!
//! OCPP-J allows one outstanding call per direction. The control loop
//! tracks which side is owed a response and:
//! - rejects charge station calls that reuse a recent message id
//! - holds back CSMS calls while a charge station call is outstanding
//!   (bounded, drop on full)
//! - matches late and very late charge station responses against recently
//!   forwarded CSMS calls and enriches them with the call's action and
//!   request payload
//! - abandons a call when its response timeout expires
//!
//! Anomalies are logged and the offending message is dropped. Nothing but
//! [`Pipe::close`] stops the loop.

mod gateway_message;
mod ring;

pub use gateway_message::{CallErrorMessage, CallMessage, CallResultMessage, GatewayMessage};

use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn, Instrument};

use crate::config::PipeConfig;
use ring::RecentRing;

/// Capacity of the device inbound and both outbound channels
const UNBUFFERED_CHANNEL_LEN: usize = 1;

/// Errors in pipe construction and lifecycle
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("Invalid pipe configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipe already started")]
    AlreadyStarted,
}

/// Transport-facing ends of the pipe's channels.
///
/// Names are from the pipe's point of view: `*_rx` is what the pipe
/// receives, `*_tx` is what it transmits.
#[derive(Debug)]
pub struct PipeChannels {
    /// Messages from the charge station, into the pipe
    pub charge_station_rx: mpsc::Sender<GatewayMessage>,
    /// Messages to be written to the charge station
    pub charge_station_tx: mpsc::Receiver<GatewayMessage>,
    /// Messages from the CSMS, into the pipe
    pub csms_rx: mpsc::Sender<GatewayMessage>,
    /// Messages to be published to the CSMS
    pub csms_tx: mpsc::Receiver<GatewayMessage>,
}

/// Control state of the pipe
#[derive(Debug, Clone, PartialEq, Eq)]
enum PipeState {
    Waiting,
    /// A charge station call was forwarded to the CSMS
    AwaitingCsmsResponse { message_id: String, deadline: Instant },
    /// A CSMS call was forwarded to the charge station
    AwaitingChargeStationResponse { message_id: String, deadline: Instant },
}

enum Flow {
    Continue,
    Halt,
}

/// One session's RPC pipe
#[derive(Debug)]
pub struct Pipe {
    control: Option<ControlLoop>,
    halt: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Pipe {
    /// Create a pipe and the channel ends the transports use to drive it
    pub fn new(config: PipeConfig) -> Result<(Self, PipeChannels), PipeError> {
        config.validate()?;

        let (cs_rx_tx, cs_rx) = mpsc::channel(UNBUFFERED_CHANNEL_LEN);
        let (cs_tx, cs_tx_rx) = mpsc::channel(UNBUFFERED_CHANNEL_LEN);
        let (csms_rx_tx, csms_rx) = mpsc::channel(config.csms_message_queue_len);
        let (csms_tx, csms_tx_rx) = mpsc::channel(UNBUFFERED_CHANNEL_LEN);
        let (halt_tx, halt_rx) = oneshot::channel();

        let control = ControlLoop {
            charge_station_calls: RecentRing::new(config.message_id_buffer_len),
            csms_calls: RecentRing::new(config.csms_call_response_buffer_len),
            csms_call_overflow: VecDeque::with_capacity(config.csms_call_queue_len),
            config,
            charge_station_rx: cs_rx,
            charge_station_tx: cs_tx,
            csms_rx,
            csms_tx,
            halt: halt_rx,
            state: PipeState::Waiting,
        };

        let pipe = Self {
            control: Some(control),
            halt: Some(halt_tx),
            task: None,
        };
        let channels = PipeChannels {
            charge_station_rx: cs_rx_tx,
            charge_station_tx: cs_tx_rx,
            csms_rx: csms_rx_tx,
            csms_tx: csms_tx_rx,
        };

        Ok((pipe, channels))
    }

    /// Spawn the control loop on the current tokio runtime.
    ///
    /// The loop runs inside the caller's current tracing span.
    pub fn start(&mut self) -> Result<(), PipeError> {
        let control = self.control.take().ok_or(PipeError::AlreadyStarted)?;
        let span = tracing::Span::current();
        self.task = Some(tokio::spawn(control.run().instrument(span)));
        Ok(())
    }

    /// Signal the control loop to stop. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(halt) = self.halt.take() {
            let _ = halt.send(());
        }
    }

    /// Whether the control loop task is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the control loop to exit after [`Pipe::close`]
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Pipe control loop failed: {}", e);
            }
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the control loop task
#[derive(Debug)]
struct ControlLoop {
    config: PipeConfig,
    charge_station_rx: mpsc::Receiver<GatewayMessage>,
    charge_station_tx: mpsc::Sender<GatewayMessage>,
    csms_rx: mpsc::Receiver<GatewayMessage>,
    csms_tx: mpsc::Sender<GatewayMessage>,
    halt: oneshot::Receiver<()>,

    /// Recent charge station call ids
    charge_station_calls: RecentRing<String>,
    /// Recently forwarded CSMS calls
    csms_calls: RecentRing<CallMessage>,
    /// CSMS calls held back while a charge station call is outstanding
    csms_call_overflow: VecDeque<CallMessage>,

    state: PipeState,
}

impl ControlLoop {
    async fn run(mut self) {
        debug!("Pipe started");

        loop {
            let flow = match &self.state {
                PipeState::Waiting => self.wait().await,
                PipeState::AwaitingCsmsResponse { deadline, .. } => {
                    let deadline = *deadline;
                    self.await_csms_response(deadline).await
                }
                PipeState::AwaitingChargeStationResponse { deadline, .. } => {
                    let deadline = *deadline;
                    self.await_charge_station_response(deadline).await
                }
            };

            if let Flow::Halt = flow {
                break;
            }
        }

        debug!("Pipe halted");
    }

    async fn wait(&mut self) -> Flow {
        // Charge station traffic that is already queued goes first
        if let Ok(msg) = self.charge_station_rx.try_recv() {
            return self.on_charge_station_message(msg).await;
        }

        tokio::select! {
            Some(msg) = self.charge_station_rx.recv() => {
                self.on_charge_station_message(msg).await
            }
            Some(msg) = self.csms_rx.recv() => {
                self.on_csms_message(msg).await
            }
            _ = std::future::ready(()), if !self.csms_call_overflow.is_empty() => {
                match self.csms_call_overflow.pop_front() {
                    Some(call) => {
                        debug!("Forwarding buffered CSMS call {}", call.message_id);
                        self.on_csms_call(call).await
                    }
                    None => Flow::Continue,
                }
            }
            _ = &mut self.halt => Flow::Halt,
        }
    }

    async fn await_csms_response(&mut self, deadline: Instant) -> Flow {
        tokio::select! {
            Some(msg) = self.csms_rx.recv() => {
                self.on_csms_message_while_busy(msg).await
            }
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(message_id) = self.outstanding_message_id() {
                    warn!("CSMS did not respond before timeout to message {}", message_id);
                }
                self.state = PipeState::Waiting;
                Flow::Continue
            }
            _ = &mut self.halt => Flow::Halt,
        }
    }

    async fn await_charge_station_response(&mut self, deadline: Instant) -> Flow {
        tokio::select! {
            Some(msg) = self.charge_station_rx.recv() => {
                self.on_charge_station_message(msg).await
            }
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(message_id) = self.outstanding_message_id() {
                    warn!("CS did not respond before timeout to message {}", message_id);
                }
                self.state = PipeState::Waiting;
                Flow::Continue
            }
            _ = &mut self.halt => Flow::Halt,
        }
    }

    fn outstanding_message_id(&self) -> Option<&str> {
        match &self.state {
            PipeState::Waiting => None,
            PipeState::AwaitingCsmsResponse { message_id, .. }
            | PipeState::AwaitingChargeStationResponse { message_id, .. } => Some(message_id),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.response_timeout
    }

    /// Charge station message while Waiting or AwaitingChargeStationResponse
    async fn on_charge_station_message(&mut self, msg: GatewayMessage) -> Flow {
        let msg = match msg {
            GatewayMessage::Call(call) => {
                if let PipeState::AwaitingChargeStationResponse { message_id, .. } = &self.state {
                    warn!(
                        "CS made call {} when expecting CS call response to {}",
                        call.message_id, message_id
                    );
                }
                return self.on_charge_station_call(call).await;
            }
            response => response,
        };

        self.on_charge_station_response(msg).await
    }

    async fn on_charge_station_call(&mut self, call: CallMessage) -> Flow {
        if self
            .charge_station_calls
            .contains(|id| *id == call.message_id)
        {
            error!("CS message id {} reused", call.message_id);
            return Flow::Continue;
        }

        self.charge_station_calls.push(call.message_id.clone());
        self.state = PipeState::AwaitingCsmsResponse {
            message_id: call.message_id.clone(),
            deadline: self.deadline(),
        };

        debug!("Forwarding CS call {} ({}) to CSMS", call.message_id, call.action);
        self.send_to_csms(GatewayMessage::Call(call)).await
    }

    async fn on_charge_station_response(&mut self, mut response: GatewayMessage) -> Flow {
        let message_id = response.message_id().to_string();
        let outstanding = match &self.state {
            PipeState::AwaitingChargeStationResponse { message_id, .. } => Some(message_id.clone()),
            _ => None,
        };
        let is_latest = self
            .csms_calls
            .current()
            .is_some_and(|call| call.message_id == message_id);

        let Some(call) = self.csms_calls.find(|call| call.message_id == message_id) else {
            error!(
                "CS call response with message id {} has no corresponding CSMS call",
                message_id
            );
            return Flow::Continue;
        };
        response.enrich_from(call);

        match outstanding {
            Some(current) if current == message_id => {
                self.state = PipeState::Waiting;
            }
            Some(current) => {
                warn!(
                    "CS call response to call {} when expecting response to {}",
                    message_id, current
                );
            }
            None if is_latest => {
                warn!("CS call response for message {} is late", message_id);
            }
            None => {
                warn!("CS call response for message {} is very late", message_id);
            }
        }

        debug!("Forwarding CS call response {} to CSMS", message_id);
        self.send_to_csms(response).await
    }

    /// CSMS message while Waiting
    async fn on_csms_message(&mut self, msg: GatewayMessage) -> Flow {
        match msg {
            GatewayMessage::Call(call) => self.on_csms_call(call).await,
            response => {
                let is_latest = self
                    .charge_station_calls
                    .current()
                    .is_some_and(|id| id == response.message_id());

                if !is_latest {
                    error!(
                        "CSMS call response with message id {} has no corresponding CS call",
                        response.message_id()
                    );
                    return Flow::Continue;
                }

                warn!(
                    "CSMS call response with message id {} is late",
                    response.message_id()
                );
                self.send_to_charge_station(response).await
            }
        }
    }

    /// CSMS message while AwaitingCsmsResponse
    async fn on_csms_message_while_busy(&mut self, msg: GatewayMessage) -> Flow {
        match msg {
            GatewayMessage::Call(call) => {
                if self.csms_call_overflow.len() < self.config.csms_call_queue_len {
                    warn!("Buffering CSMS call message: {}", call.message_id);
                    self.csms_call_overflow.push_back(call);
                } else {
                    warn!("CSMS call buffer full - dropping message {}", call.message_id);
                }
                Flow::Continue
            }
            response => {
                let matches = self
                    .outstanding_message_id()
                    .is_some_and(|id| id == response.message_id());

                if !matches {
                    warn!(
                        "CSMS call response not for current call: {}",
                        response.message_id()
                    );
                    return Flow::Continue;
                }

                self.state = PipeState::Waiting;
                debug!("Forwarding CSMS call response {} to CS", response.message_id());
                self.send_to_charge_station(response).await
            }
        }
    }

    async fn on_csms_call(&mut self, call: CallMessage) -> Flow {
        if self.csms_calls.remove(|tracked| tracked.message_id == call.message_id) > 0 {
            warn!("CSMS call with duplicate message id {}", call.message_id);
        }

        self.csms_calls.push(call.clone());
        self.state = PipeState::AwaitingChargeStationResponse {
            message_id: call.message_id.clone(),
            deadline: self.deadline(),
        };

        debug!("Forwarding CSMS call {} ({}) to CS", call.message_id, call.action);
        self.send_to_charge_station(GatewayMessage::Call(call)).await
    }

    async fn send_to_csms(&mut self, msg: GatewayMessage) -> Flow {
        tokio::select! {
            result = self.csms_tx.send(msg) => {
                if let Err(e) = result {
                    warn!("CSMS transport gone, dropping message {}", e.0.message_id());
                }
                Flow::Continue
            }
            _ = &mut self.halt => Flow::Halt,
        }
    }

    async fn send_to_charge_station(&mut self, msg: GatewayMessage) -> Flow {
        tokio::select! {
            result = self.charge_station_tx.send(msg) => {
                if let Err(e) = result {
                    warn!("CS transport gone, dropping message {}", e.0.message_id());
                }
                Flow::Continue
            }
            _ = &mut self.halt => Flow::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (mut pipe, _channels) = Pipe::new(PipeConfig::default()).unwrap();

        pipe.start().unwrap();
        assert!(matches!(pipe.start(), Err(PipeError::AlreadyStarted)));
        assert!(pipe.is_running());

        pipe.close();
        pipe.closed().await;
        assert!(!pipe.is_running());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut pipe, _channels) = Pipe::new(PipeConfig::default()).unwrap();
        pipe.start().unwrap();

        pipe.close();
        pipe.close();
        pipe.closed().await;
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_forward() {
        let (mut pipe, channels) = Pipe::new(PipeConfig::default()).unwrap();
        pipe.start().unwrap();

        // Nobody drains the outbound channels, so forwarding the second
        // charge station call blocks the loop
        channels
            .charge_station_rx
            .send(GatewayMessage::call("1", "Heartbeat", json!({})))
            .await
            .unwrap();
        channels
            .csms_rx
            .send(GatewayMessage::call_result("1", json!({})))
            .await
            .unwrap();
        channels
            .charge_station_rx
            .send(GatewayMessage::call("2", "Heartbeat", json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pipe.is_running());

        pipe.close();
        tokio::time::timeout(Duration::from_secs(1), pipe.closed())
            .await
            .expect("pipe did not halt");
    }

    #[tokio::test]
    async fn test_drop_halts_loop() {
        let (mut pipe, channels) = Pipe::new(PipeConfig::default()).unwrap();
        pipe.start().unwrap();
        let task = pipe.task.take().unwrap();

        drop(pipe);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pipe did not halt")
            .unwrap();
        drop(channels);
    }

    #[tokio::test]
    async fn test_queued_charge_station_message_goes_first() {
        let (mut pipe, mut channels) = Pipe::new(PipeConfig::default()).unwrap();
        let mut control = pipe.control.take().unwrap();

        channels
            .csms_rx
            .send(GatewayMessage::call("csms-1", "Reset", json!({})))
            .await
            .unwrap();
        channels
            .charge_station_rx
            .send(GatewayMessage::call("cs-1", "Heartbeat", json!({})))
            .await
            .unwrap();

        assert!(matches!(control.wait().await, Flow::Continue));
        assert!(matches!(
            control.state,
            PipeState::AwaitingCsmsResponse { ref message_id, .. } if message_id == "cs-1"
        ));
        assert_eq!(channels.csms_tx.try_recv().unwrap().message_id(), "cs-1");
        assert!(channels.charge_station_tx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_csms_call_keeps_one_record() {
        let (mut pipe, mut channels) = Pipe::new(PipeConfig::default()).unwrap();
        let mut control = pipe.control.take().unwrap();

        let first = CallMessage {
            message_id: "dup".to_string(),
            action: "First".to_string(),
            request_payload: json!({}),
            state: None,
        };
        let second = CallMessage {
            action: "Second".to_string(),
            ..first.clone()
        };

        control.on_csms_call(first).await;
        channels.charge_station_tx.recv().await.unwrap();
        control.on_csms_call(second).await;
        channels.charge_station_tx.recv().await.unwrap();

        assert_eq!(control.csms_calls.len(), 1);
        assert_eq!(
            control.csms_calls.current().map(|call| call.action.as_str()),
            Some("Second")
        );
    }

    #[tokio::test]
    async fn test_overflow_drops_when_full() {
        let config = PipeConfig::default().with_csms_call_queue_len(1);
        let (mut pipe, _channels) = Pipe::new(config).unwrap();
        let mut control = pipe.control.take().unwrap();
        control.state = PipeState::AwaitingCsmsResponse {
            message_id: "cs-1".to_string(),
            deadline: Instant::now() + Duration::from_secs(10),
        };

        for id in ["a", "b"] {
            control
                .on_csms_message_while_busy(GatewayMessage::call(id, "Reset", json!({})))
                .await;
        }

        assert_eq!(control.csms_call_overflow.len(), 1);
        assert_eq!(control.csms_call_overflow[0].message_id, "a");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PipeConfig::default().with_message_id_buffer_len(0);
        assert!(matches!(
            Pipe::new(config),
            Err(PipeError::InvalidConfig(_))
        ));
    }
}

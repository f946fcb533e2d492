//! Persistent connection to the inference service.
//!
//! [`ChannelManager::connect`] spawns a driver task that owns the
//! [`Transport`]. The driver runs connect, receive, fallback send and
//! reconnect-with-backoff, and reports every lifecycle change through a single
//! dispatch point that also advances the [`ChannelStateMachine`].

use crate::error::{CoreError, CoreResult};
use crate::protocol::{self, InboundMessage, OutboundFrame};
use crate::reconciler::InboundResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long [`ChannelManager::close`] waits for the driver before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

const CLIENT_DISCONNECT: &str = "client disconnect";

/// Frames that may wait for the driver while a send is in progress.
pub const OUTBOUND_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Connection and reconnection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connecting { attempt: u32 },
    Opened,
    Closed { reason: String },
    Errored { detail: String },
    MessageReceived(InboundResult),
    ServiceError(String),
    ReconnectExhausted { attempts: u32 },
    /// Both the binary and the text send of a frame failed.
    FrameDropped { sequence: u64 },
}

/// What [`ChannelManager::send`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Queued,
    NotOpen,
    /// The driver is still busy with earlier frames; this one was discarded.
    QueueFull,
}

impl ChannelEvent {
    /// State the channel is in after this event, if the event moves it.
    fn target_state(&self) -> Option<ChannelState> {
        match self {
            ChannelEvent::Connecting { .. } => Some(ChannelState::Connecting),
            ChannelEvent::Opened => Some(ChannelState::Open),
            ChannelEvent::Closed { .. } => Some(ChannelState::Closed),
            ChannelEvent::Errored { .. } | ChannelEvent::ReconnectExhausted { .. } => {
                Some(ChannelState::Errored)
            }
            ChannelEvent::MessageReceived(_)
            | ChannelEvent::ServiceError(_)
            | ChannelEvent::FrameDropped { .. } => None,
        }
    }
}

/// Raw message surfaced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
    Closed { reason: String },
}

/// Bidirectional message transport to the inference service.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    async fn connect(&mut self, endpoint: &str) -> CoreResult<()>;
    async fn send_binary(&mut self, payload: Vec<u8>) -> CoreResult<()>;
    async fn send_text(&mut self, payload: String) -> CoreResult<()>;
    /// Next message of the open connection. Must be cancel safe.
    async fn recv(&mut self) -> CoreResult<TransportMessage>;
    async fn close(&mut self);
}

/// Validated [`ChannelState`] transitions, observable through a watch channel.
#[derive(Debug)]
pub struct ChannelStateMachine {
    state: watch::Sender<ChannelState>,
}

impl ChannelStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self { state }
    }

    pub fn current(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn is_allowed(from: ChannelState, to: ChannelState) -> bool {
        use ChannelState::*;
        from == to
            || matches!(
                (from, to),
                (Connecting, Open | Errored | Closed)
                    | (Open, Closed | Errored)
                    | (Closed, Connecting)
                    | (Errored, Connecting | Closed)
            )
    }

    pub fn transition(&self, next: ChannelState) -> CoreResult<()> {
        let current = self.current();
        if !Self::is_allowed(current, next) {
            return Err(CoreError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.state.send_replace(next);
        Ok(())
    }
}

impl Default for ChannelStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential reconnect delay capped at a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_options(options: &ChannelOptions) -> Self {
        Self::new(
            Duration::from_millis(options.reconnect_delay_ms),
            Duration::from_millis(options.max_reconnect_delay_ms),
        )
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug)]
enum DriverCommand {
    Reconnect,
    Close,
}

enum SessionEnd {
    ClientClosed,
    RemoteClosed(String),
    Failed(String),
}

struct ChannelDriver<T: Transport> {
    transport: T,
    endpoint: String,
    options: ChannelOptions,
    backoff: ReconnectBackoff,
    machine: ChannelStateMachine,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    frames: mpsc::Receiver<OutboundFrame>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl<T: Transport> ChannelDriver<T> {
    fn dispatch(&self, event: ChannelEvent) {
        if let Some(next) = event.target_state() {
            if let Err(err) = self.machine.transition(next) {
                tracing::error!(error = %err, "channel state machine rejected transition");
            }
        }
        // The manager may already be gone during teardown.
        let _ = self.events.send(event);
    }

    async fn run(mut self) {
        let mut reconnect_attempts: u32 = 0;

        loop {
            self.dispatch(ChannelEvent::Connecting {
                attempt: reconnect_attempts,
            });

            let connected = match self.open().await {
                Some(result) => result,
                None => return self.closed_by_client().await,
            };

            match connected {
                Ok(()) => {
                    tracing::info!(endpoint = %self.endpoint, "channel open");
                    reconnect_attempts = 0;
                    self.dispatch(ChannelEvent::Opened);
                    match self.pump().await {
                        SessionEnd::ClientClosed => return self.closed_by_client().await,
                        SessionEnd::RemoteClosed(reason) => {
                            tracing::info!(%reason, "channel closed by peer");
                            self.dispatch(ChannelEvent::Closed { reason });
                        }
                        SessionEnd::Failed(detail) => {
                            tracing::warn!(%detail, "channel failed");
                            self.dispatch(ChannelEvent::Errored { detail });
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %err, "connect failed");
                    self.dispatch(ChannelEvent::Errored {
                        detail: err.to_string(),
                    });
                }
            }

            if !self.options.auto_reconnect {
                if !self.wait_for_manual_reconnect().await {
                    return self.closed_by_client().await;
                }
                reconnect_attempts = 0;
                continue;
            }

            if reconnect_attempts >= self.options.max_reconnect_attempts {
                tracing::error!(attempts = reconnect_attempts, "reconnection attempts exhausted");
                self.dispatch(ChannelEvent::ReconnectExhausted {
                    attempts: reconnect_attempts,
                });
                if !self.wait_for_manual_reconnect().await {
                    return self.closed_by_client().await;
                }
                reconnect_attempts = 0;
                continue;
            }

            reconnect_attempts += 1;
            let delay = self.backoff.delay_for(reconnect_attempts);
            tracing::debug!(
                attempt = reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            if !self.sleep_unless_closed(delay).await {
                return self.closed_by_client().await;
            }
        }
    }

    /// Connects with the configured timeout. `None` means the client closed meanwhile.
    async fn open(&mut self) -> Option<CoreResult<()>> {
        let timeout_ms = self.options.connect_timeout_ms;
        let connect = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.transport.connect(&self.endpoint),
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return Some(match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(CoreError::ConnectTimeout { timeout_ms }),
                    });
                }
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Reconnect) => {}
                    Some(DriverCommand::Close) | None => return None,
                },
                Some(frame) = self.frames.recv() => {
                    tracing::trace!(sequence = frame.sequence, "frame dropped while connecting");
                }
            }
        }
    }

    async fn pump(&mut self) -> SessionEnd {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Reconnect) => {}
                    Some(DriverCommand::Close) | None => return SessionEnd::ClientClosed,
                },
                Some(frame) = self.frames.recv() => {
                    let sequence = frame.sequence;
                    if transmit(&mut self.transport, frame).await.is_err() {
                        self.dispatch(ChannelEvent::FrameDropped { sequence });
                    }
                }
                message = self.transport.recv() => match message {
                    Ok(TransportMessage::Text(text)) => self.handle_text(&text),
                    Ok(TransportMessage::Binary(bytes)) => {
                        let bytes = bytes.len();
                        tracing::debug!(bytes, "ignoring binary message from service");
                    }
                    Ok(TransportMessage::Closed { reason }) => {
                        return SessionEnd::RemoteClosed(reason);
                    }
                    Err(err) => return SessionEnd::Failed(err.to_string()),
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match protocol::decode_inbound(text) {
            Ok(InboundMessage::Result(result)) => {
                self.dispatch(ChannelEvent::MessageReceived(result))
            }
            Ok(InboundMessage::Error(message)) => {
                self.dispatch(ChannelEvent::ServiceError(message))
            }
            Err(err) => tracing::warn!(error = %err, "ignoring undecodable reply"),
        }
    }

    /// Waits for a manual reconnect. Returns `false` if the client closed instead.
    async fn wait_for_manual_reconnect(&mut self) -> bool {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Reconnect) => return true,
                    Some(DriverCommand::Close) | None => return false,
                },
                Some(frame) = self.frames.recv() => {
                    tracing::trace!(sequence = frame.sequence, "frame dropped while disconnected");
                }
            }
        }
    }

    /// Sleeps out a backoff delay. A manual reconnect cuts it short.
    async fn sleep_unless_closed(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Reconnect) => return true,
                    Some(DriverCommand::Close) | None => return false,
                },
                Some(frame) = self.frames.recv() => {
                    tracing::trace!(sequence = frame.sequence, "frame dropped while disconnected");
                }
            }
        }
    }

    async fn closed_by_client(mut self) {
        self.transport.close().await;
        self.dispatch(ChannelEvent::Closed {
            reason: CLIENT_DISCONNECT.to_string(),
        });
        tracing::debug!(endpoint = %self.endpoint, "channel driver stopped");
    }
}

/// Sends binary first, then the text encoding of the same payload.
async fn transmit<T: Transport>(transport: &mut T, frame: OutboundFrame) -> CoreResult<()> {
    let sequence = frame.sequence;
    let Err(err) = transport.send_binary(protocol::encode_binary_frame(&frame)).await else {
        return Ok(());
    };
    tracing::warn!(error = %err, sequence, "binary send failed, falling back to text");

    transport
        .send_text(protocol::encode_text_frame(&frame))
        .await
        .map_err(|err| {
            let err = CoreError::SendFailed(err.to_string());
            tracing::warn!(error = %err, sequence, "frame dropped");
            err
        })
}

/// Client-side handle to the connection driver.
#[derive(Debug)]
pub struct ChannelManager {
    endpoint: String,
    commands: mpsc::UnboundedSender<DriverCommand>,
    frames: mpsc::Sender<OutboundFrame>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
    driver: Option<JoinHandle<()>>,
}

impl ChannelManager {
    /// Starts connecting to `endpoint` in a background driver task.
    pub fn connect<T: Transport>(
        transport: T,
        endpoint: impl Into<String>,
        options: ChannelOptions,
    ) -> Self {
        let endpoint = endpoint.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let machine = ChannelStateMachine::new();
        let state = machine.subscribe();

        let driver = ChannelDriver {
            transport,
            endpoint: endpoint.clone(),
            backoff: ReconnectBackoff::from_options(&options),
            options,
            machine,
            commands: command_rx,
            frames: frame_rx,
            events: event_tx,
        };
        let driver = tokio::spawn(driver.run());

        Self {
            endpoint,
            commands: command_tx,
            frames: frame_tx,
            events: event_rx,
            state,
            driver: Some(driver),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queues a frame for transmission without waiting. Nothing is queued
    /// unless the channel is open, and a frame that finds the queue full is
    /// discarded.
    pub fn send(&self, frame: OutboundFrame) -> SendStatus {
        if !self.is_open() {
            tracing::trace!(sequence = frame.sequence, "channel not open, frame not sent");
            return SendStatus::NotOpen;
        }
        match self.frames.try_send(frame) {
            Ok(()) => SendStatus::Queued,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::debug!(sequence = frame.sequence, "outbound queue full, frame discarded");
                SendStatus::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendStatus::NotOpen,
        }
    }

    /// Restarts connection attempts, e.g. after reconnection was exhausted.
    pub fn reconnect(&self) -> CoreResult<()> {
        self.commands
            .send(DriverCommand::Reconnect)
            .map_err(|_| CoreError::ChannelClosed)
    }

    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Closes the connection and waits for the driver to finish.
    pub async fn close(&mut self) {
        let _ = self.commands.send(DriverCommand::Close);
        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    "channel driver did not stop in time, aborting"
                );
                driver.abort();
            }
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

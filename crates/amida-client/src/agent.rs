use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use amida_core::{ClientMessage, Layout, Phase, RejectReason, Rung, ServerMessage};

use crate::view::ClientView;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connection lifecycle, surfaced to the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Bounded retries are running; show a degraded-connectivity indicator.
    Reconnecting { attempt: u32 },
    /// Retries exhausted; terminal until the user starts over.
    Failed,
}

/// Events the embedding UI consumes.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The mirror changed; redraw.
    ViewChanged,
    /// Results phase entered; run the resolver animation locally.
    ResultsReady,
    /// The hub rejected a locally drawn rung; it has been rolled back.
    DrawRejected { reason: RejectReason },
    /// Connectivity changed.
    Status(AgentStatus),
}

#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("not connected")]
    NotConnected,
    #[error("connection timed out")]
    ConnectTimeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("rung rejected: {0:?}")]
    Rejected(RejectReason),
    #[error("failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Exponential backoff schedule for reconnects.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }
}

/// Per-client sync agent: owns the transport and a `ClientView` mirror,
/// applies inbound events in arrival order, and recovers missed mutations on
/// reconnect with an explicit `request_state`.
pub struct SyncAgent {
    ws_url: String,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    view: ClientView,
    status: AgentStatus,
    events: mpsc::UnboundedSender<AgentEvent>,
    socket: Option<WsStream>,
}

impl SyncAgent {
    pub fn new(
        ws_url: impl Into<String>,
        layout: Layout,
    ) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        Self::with_policy(ws_url, layout, ReconnectPolicy::default())
    }

    pub fn with_policy(
        ws_url: impl Into<String>,
        layout: Layout,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                ws_url: ws_url.into(),
                policy,
                heartbeat_interval: HEARTBEAT_INTERVAL,
                view: ClientView::new(layout),
                status: AgentStatus::Disconnected,
                events,
                socket: None,
            },
            events_rx,
        )
    }

    pub fn view(&self) -> &ClientView {
        &self.view
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// How often `run` pings the hub. The hub prunes connections whose
    /// heartbeat goes quiet, so this must stay well under its timeout.
    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    fn set_status(&mut self, status: AgentStatus) {
        if self.status != status {
            self.status = status;
            let _ = self.events.send(AgentEvent::Status(status));
        }
    }

    /// Establishes the transport and applies the hub's full replay before
    /// returning, so the mirror is equal to the authoritative copy when this
    /// resolves.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        if self.status == AgentStatus::Disconnected {
            self.set_status(AgentStatus::Connecting);
        }

        let (socket, _) = timeout(CONNECT_TIMEOUT, connect_async(&self.ws_url))
            .await
            .map_err(|_| AgentError::ConnectTimeout)?
            .map_err(|e| AgentError::Connect(e.to_string()))?;
        self.socket = Some(socket);

        // The hub greets a fresh connection with the full snapshot.
        let init = self.recv_message().await?;
        self.apply_inbound(init);

        self.set_status(AgentStatus::Connected);
        debug!("connected to {}", self.ws_url);
        Ok(())
    }

    /// Validates locally with the same check the hub runs, applies the rung
    /// optimistically, and submits it. A hub-side `line_rejected` rolls the
    /// optimistic copy back.
    pub async fn draw(&mut self, rung: Rung) -> Result<(), AgentError> {
        if self.socket.is_none() {
            return Err(AgentError::NotConnected);
        }
        if self.view.phase() == Phase::ShowingResults {
            return Err(AgentError::Rejected(RejectReason::DrawingClosed));
        }
        self.view
            .validate(&rung)
            .map_err(|rejection| AgentError::Rejected(rejection.into()))?;

        self.view.apply_local(rung.clone());
        let _ = self.events.send(AgentEvent::ViewChanged);
        self.send_message(&ClientMessage::DrawLine { rung }).await
    }

    pub async fn finish(&mut self) -> Result<(), AgentError> {
        self.send_message(&ClientMessage::Finish).await
    }

    pub async fn reset(&mut self) -> Result<(), AgentError> {
        self.send_message(&ClientMessage::Reset).await
    }

    pub async fn request_state(&mut self) -> Result<(), AgentError> {
        self.send_message(&ClientMessage::RequestState).await
    }

    pub async fn ping(&mut self) -> Result<(), AgentError> {
        self.send_message(&ClientMessage::Ping).await
    }

    /// Receives and applies exactly one hub event.
    pub async fn step(&mut self) -> Result<(), AgentError> {
        let message = self.recv_message().await?;
        self.apply_inbound(message);
        Ok(())
    }

    /// Drives the agent until the connection fails beyond recovery: applies
    /// hub events as they arrive and keeps the connection alive with periodic
    /// pings, so an idle client is never pruned as stale.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await; // immediate first tick
        loop {
            if let Err(err) = self.drive(&mut heartbeat).await {
                warn!("push channel dropped: {err}");
                self.socket = None;
                self.reconnect().await?;
            }
        }
    }

    /// One scheduling round: the next inbound frame or the next heartbeat
    /// tick, whichever comes first.
    async fn drive(&mut self, heartbeat: &mut tokio::time::Interval) -> Result<(), AgentError> {
        let frame = {
            let socket = self.socket.as_mut().ok_or(AgentError::NotConnected)?;
            tokio::select! {
                _ = heartbeat.tick() => None,
                frame = socket.next() => Some(
                    frame
                        .ok_or(AgentError::ConnectionClosed)?
                        .map_err(|e| AgentError::Transport(e.to_string()))?,
                ),
            }
        };
        match frame {
            None => self.ping().await,
            Some(Message::Text(text)) => {
                let message = serde_json::from_str(&text)
                    .map_err(|e| AgentError::Protocol(e.to_string()))?;
                self.apply_inbound(message);
                Ok(())
            }
            Some(Message::Close(_)) => Err(AgentError::ConnectionClosed),
            Some(_) => Ok(()),
        }
    }

    /// Bounded-retry reconnect with exponential backoff. A bare transport
    /// reconnect is not enough to guarantee state equality, so a successful
    /// attempt re-requests the authoritative state before returning.
    pub async fn reconnect(&mut self) -> Result<(), AgentError> {
        for attempt in 1..=self.policy.max_attempts {
            self.set_status(AgentStatus::Reconnecting { attempt });
            tokio::time::sleep(self.policy.delay_for(attempt)).await;

            match self.connect().await {
                Ok(()) => {
                    self.request_state().await?;
                    info!("reconnected after {attempt} attempt(s)");
                    return Ok(());
                }
                Err(err) => {
                    debug!("reconnect attempt {attempt} failed: {err}");
                }
            }
        }

        self.set_status(AgentStatus::Failed);
        Err(AgentError::ReconnectExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    async fn send_message(&mut self, message: &ClientMessage) -> Result<(), AgentError> {
        let socket = self.socket.as_mut().ok_or(AgentError::NotConnected)?;
        let json =
            serde_json::to_string(message).map_err(|e| AgentError::Protocol(e.to_string()))?;
        socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    async fn recv_message(&mut self) -> Result<ServerMessage, AgentError> {
        let socket = self.socket.as_mut().ok_or(AgentError::NotConnected)?;
        loop {
            let frame = socket
                .next()
                .await
                .ok_or(AgentError::ConnectionClosed)?
                .map_err(|e| AgentError::Transport(e.to_string()))?;
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| AgentError::Protocol(e.to_string()));
                }
                Message::Close(_) => return Err(AgentError::ConnectionClosed),
                _ => {}
            }
        }
    }

    fn apply_inbound(&mut self, message: ServerMessage) {
        match &message {
            ServerMessage::LineRejected { reason, .. } => {
                let reason = *reason;
                self.view.apply(&message);
                let _ = self.events.send(AgentEvent::ViewChanged);
                let _ = self.events.send(AgentEvent::DrawRejected { reason });
            }
            ServerMessage::ShowResults { .. } => {
                self.view.apply(&message);
                let _ = self.events.send(AgentEvent::ViewChanged);
                let _ = self.events.send(AgentEvent::ResultsReady);
            }
            ServerMessage::Pong => {}
            ServerMessage::Error { message } => {
                warn!("hub error: {message}");
            }
            _ => {
                self.view.apply(&message);
                let _ = self.events.send(AgentEvent::ViewChanged);
            }
        }
    }
}

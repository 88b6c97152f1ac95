use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use amida_core::{
    validate_rung, ClientMessage, Layout, RejectReason, ServerMessage, SessionState,
};

use crate::storage::SharedStore;

/// One frame queued for a connection's outbox task.
enum Outbound {
    Message(ServerMessage),
    /// Close the socket and end the outbox task. Sent when the hub prunes a
    /// stale connection, so the far side observes the drop and reconnects.
    Close,
}

/// Outbox and liveness for one connected client.
#[derive(Clone)]
struct ClientConnection {
    tx: mpsc::UnboundedSender<Outbound>,
    last_heartbeat: Arc<RwLock<std::time::Instant>>,
}

/// Shared hub state. The single `Mutex<SessionState>` is the serialization
/// point: every mutation runs as a non-overlapping critical section, and its
/// broadcast is enqueued before the lock is released, so every outbox sees
/// mutations in commit order. Fan-out goes through per-connection unbounded
/// channels; the sends never block, so a slow client never stalls mutation
/// processing.
#[derive(Clone)]
pub struct HubState {
    layout: Layout,
    session: Arc<Mutex<SessionState>>,
    connections: Arc<DashMap<Uuid, ClientConnection>>,
    store: SharedStore,
}

impl HubState {
    pub fn new(layout: Layout, initial: SessionState, store: SharedStore) -> Self {
        let state = Self {
            layout,
            session: Arc::new(Mutex::new(initial)),
            connections: Arc::new(DashMap::new()),
            store,
        };

        let monitor_state = state.clone();
        tokio::spawn(async move {
            monitor_state.monitor_heartbeats().await;
        });

        state
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub async fn snapshot(&self) -> SessionState {
        self.session.lock().await.snapshot()
    }

    fn broadcast_except(&self, sender: Uuid, message: ServerMessage) {
        for entry in self.connections.iter() {
            if *entry.key() != sender {
                let _ = entry.value().tx.send(Outbound::Message(message.clone()));
            }
        }
    }

    fn broadcast_all(&self, message: ServerMessage) {
        for entry in self.connections.iter() {
            let _ = entry.value().tx.send(Outbound::Message(message.clone()));
        }
    }

    /// Fire-and-forget persistence of a snapshot taken after the in-memory
    /// commit. Store failures are logged; the hub keeps serving from memory.
    fn persist(&self, snapshot: SessionState) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save(&snapshot).await {
                warn!("failed to persist session state: {err:#}");
            }
        });
    }

    /// Synchronous flush of the current snapshot, used on disconnect and at
    /// shutdown.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot).await
    }

    /// Periodic flush so the durable copy converges even if a fire-and-forget
    /// save was lost.
    pub fn spawn_flush_task(&self, interval: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(err) = hub.flush().await {
                    warn!("periodic flush failed: {err:#}");
                }
            }
        })
    }

    async fn monitor_heartbeats(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            self.prune_stale(Duration::from_secs(600)).await;
        }
    }

    /// Prunes connections whose heartbeat went stale, closing their sockets
    /// so the far side observes the drop and runs its reconnect path instead
    /// of silently missing broadcasts. State is never mutated here: a
    /// vanished client must not rewind the ladder.
    pub(crate) async fn prune_stale(&self, timeout: Duration) {
        // Collect entries first to avoid holding DashMap guards across await.
        let checks: Vec<(Uuid, ClientConnection)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (client_id, connection) in checks {
            let last_heartbeat = *connection.last_heartbeat.read().await;
            if last_heartbeat.elapsed() > timeout {
                info!("removing stale client {client_id} (heartbeat timeout)");
                let _ = connection.tx.send(Outbound::Close);
                self.connections.remove(&client_id);
            }
        }
    }
}

/// WebSocket upgrade handler.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(hub): State<HubState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: HubState) {
    let client_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Forward queued frames to the socket.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Message(msg) => {
                    if let Ok(json) = serde_json::to_string(&msg) {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!("outbox task ended for client {client_id}");
    });

    // Registration and the full replay happen under the session lock, so no
    // mutation can slip between the snapshot and the init frame: the outbox
    // holds the init first, then every later commit in order.
    {
        let session = hub.session.lock().await;
        hub.connections.insert(
            client_id,
            ClientConnection {
                tx: tx.clone(),
                last_heartbeat: Arc::new(RwLock::new(std::time::Instant::now())),
            },
        );
        let (rungs, phase) = session.snapshot().into_parts();
        let _ = tx.send(Outbound::Message(ServerMessage::Init {
            layout: hub.layout(),
            rungs,
            phase,
        }));
    }

    info!("client connected: {client_id}");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!("websocket error from client {client_id}: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    if let Err(e) = handle_client_message(client_msg, client_id, &hub, &tx).await {
                        error!("error handling message from {client_id}: {e:#}");
                        let _ = tx.send(Outbound::Message(ServerMessage::Error {
                            message: format!("failed to process message: {e}"),
                        }));
                    }
                }
                Err(e) => {
                    warn!("invalid message from client {client_id}: {e}");
                    let _ = tx.send(Outbound::Message(ServerMessage::Error {
                        message: format!("invalid message format: {e}"),
                    }));
                }
            },
            Message::Close(_) => break,
            // Ping/Pong frames are handled by the transport.
            _ => {}
        }
    }

    // A leaving client never mutates the ladder; just drop the connection and
    // flush opportunistically.
    hub.connections.remove(&client_id);
    if let Err(err) = hub.flush().await {
        warn!("flush after disconnect failed: {err:#}");
    }

    info!("client disconnected: {client_id}");
}

async fn handle_client_message(
    message: ClientMessage,
    client_id: Uuid,
    hub: &HubState,
    tx: &mpsc::UnboundedSender<Outbound>,
) -> Result<()> {
    match message {
        ClientMessage::DrawLine { rung } => {
            // Validation, append, and the broadcast enqueue run under one
            // lock: concurrent draws serialize, a later geometrically
            // conflicting rung loses, and every outbox receives the new_line
            // in commit order.
            let mut session = hub.session.lock().await;
            let outcome = if let Err(rejection) =
                validate_rung(&rung, session.rungs(), &hub.layout)
            {
                Err(RejectReason::from(rejection))
            } else if session.append(rung.clone()).is_err() {
                Err(RejectReason::DrawingClosed)
            } else {
                Ok(session.snapshot())
            };

            match outcome {
                Ok(snapshot) => {
                    debug!(rung = %rung.id, "accepted rung from client {client_id}");
                    // The sender already holds the rung locally.
                    hub.broadcast_except(client_id, ServerMessage::NewLine { rung });
                    drop(session);
                    hub.persist(snapshot);
                }
                Err(reason) => {
                    drop(session);
                    debug!(rung = %rung.id, ?reason, "rejected rung from client {client_id}");
                    tx.send(Outbound::Message(ServerMessage::LineRejected {
                        rung_id: rung.id,
                        reason,
                    }))?;
                }
            }
        }

        ClientMessage::Finish => {
            let mut session = hub.session.lock().await;
            session.finish();
            let snapshot = session.snapshot();
            // Everyone gets the full rung set so a missed broadcast cannot
            // skew the resolution.
            hub.broadcast_all(ServerMessage::ShowResults {
                rungs: snapshot.rungs().to_vec(),
            });
            drop(session);
            info!("ladder frozen by client {client_id}, showing results");
            hub.persist(snapshot);
        }

        ClientMessage::Reset => {
            let mut session = hub.session.lock().await;
            session.reset();
            let snapshot = session.snapshot();
            hub.broadcast_all(ServerMessage::Reset);
            drop(session);
            info!("ladder reset by client {client_id}");
            hub.persist(snapshot);
        }

        ClientMessage::RequestState => {
            debug!("state requested by client {client_id}");
            // The reply is enqueued under the lock so it cannot race a
            // concurrent commit's broadcast on this outbox.
            let session = hub.session.lock().await;
            let (rungs, phase) = session.snapshot().into_parts();
            tx.send(Outbound::Message(ServerMessage::StateUpdate { rungs, phase }))?;
        }

        ClientMessage::Ping => {
            let heartbeat_lock = hub
                .connections
                .get(&client_id)
                .map(|entry| entry.last_heartbeat.clone());
            if let Some(lock) = heartbeat_lock {
                *lock.write().await = std::time::Instant::now();
            }
            tx.send(Outbound::Message(ServerMessage::Pong))?;
        }
    }

    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use amida_core::{
    resolve_path, ClientMessage, Layout, Phase, RejectReason, Rung, ServerMessage, SessionState,
};
use amida_client::{
    AgentError, AgentEvent, AgentStatus, ClientView, ReconnectPolicy, SyncAgent,
};
use tokio::sync::mpsc;

use crate::handlers::{get_state, health_check};
use crate::hub::{websocket_handler, HubState};
use crate::storage::{MemoryStore, StateStore};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestHub {
    ws_url: String,
    http_url: String,
    hub: HubState,
    store: Arc<MemoryStore>,
}

async fn spawn_hub() -> TestHub {
    let store = Arc::new(MemoryStore::default());
    let hub = HubState::new(Layout::default(), SessionState::new(), store.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/state", get(get_state))
        .route("/ws", get(websocket_handler))
        .with_state(hub.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestHub {
        ws_url: format!("ws://{addr}/ws"),
        http_url: format!("http://{addr}"),
        hub,
        store,
    }
}

async fn connect(url: &str) -> WsClient {
    let (socket, _) = connect_async(url).await.expect("connect failed");
    socket
}

async fn send(client: &mut WsClient, message: &ClientMessage) {
    let json = serde_json::to_string(message).unwrap();
    client.send(Message::Text(json.into())).await.unwrap();
}

async fn recv(client: &mut WsClient) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("malformed server message");
        }
    }
}

/// Waits until the hub has applied everything this client sent: the hub
/// processes one connection's messages in order, so a pong implies every
/// earlier message was handled. Asserts the pong is the very next inbound
/// message, so it doubles as a no-unexpected-traffic check.
async fn drain(client: &mut WsClient) {
    send(client, &ClientMessage::Ping).await;
    assert!(matches!(recv(client).await, ServerMessage::Pong));
}

/// Like `drain`, but tolerates interleaved broadcasts: reads until the pong
/// arrives. For connections that share the hub with concurrent writers.
async fn wait_for_pong(client: &mut WsClient) {
    send(client, &ClientMessage::Ping).await;
    loop {
        if matches!(recv(client).await, ServerMessage::Pong) {
            return;
        }
    }
}

async fn next_status(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> AgentStatus {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for an agent event")
            .expect("agent event channel closed");
        if let AgentEvent::Status(status) = event {
            return status;
        }
    }
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<AgentEvent>) {
    while events.try_recv().is_ok() {}
}

fn rung(left: usize, y: f64) -> Rung {
    Rung::new(left, left + 1, y)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_receives_prior_rungs() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    match recv(&mut a).await {
        ServerMessage::Init { rungs, phase, layout } => {
            assert!(rungs.is_empty());
            assert_eq!(phase, Phase::Drawing);
            assert_eq!(layout, Layout::default());
        }
        other => panic!("expected init, got {other:?}"),
    }

    let drawn = rung(0, 100.0);
    send(&mut a, &ClientMessage::DrawLine { rung: drawn.clone() }).await;
    drain(&mut a).await;

    let mut b = connect(&hub.ws_url).await;
    match recv(&mut b).await {
        ServerMessage::Init { rungs, .. } => assert_eq!(rungs, vec![drawn]),
        other => panic!("expected init, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn draws_broadcast_to_others_but_not_the_sender() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    recv(&mut a).await; // init
    let mut b = connect(&hub.ws_url).await;
    recv(&mut b).await; // init

    let first = rung(0, 100.0);
    send(&mut a, &ClientMessage::DrawLine { rung: first.clone() }).await;
    match recv(&mut b).await {
        ServerMessage::NewLine { rung } => assert_eq!(rung, first),
        other => panic!("expected new_line, got {other:?}"),
    }

    // Overlaps rail 1 within the vertical gap; rejected to the sender only.
    let conflicting = rung(1, 105.0);
    send(&mut b, &ClientMessage::DrawLine { rung: conflicting.clone() }).await;
    match recv(&mut b).await {
        ServerMessage::LineRejected { rung_id, reason } => {
            assert_eq!(rung_id, conflicting.id);
            assert_eq!(reason, RejectReason::Overlapping);
        }
        other => panic!("expected line_rejected, got {other:?}"),
    }

    // A valid rung reaches the other client; the sender sees no echo, so its
    // next inbound message is the pong from the drain.
    let second = rung(2, 200.0);
    send(&mut b, &ClientMessage::DrawLine { rung: second.clone() }).await;
    match recv(&mut a).await {
        ServerMessage::NewLine { rung } => assert_eq!(rung, second),
        other => panic!("expected new_line, got {other:?}"),
    }
    drain(&mut b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finish_freezes_and_reset_reopens_for_everyone() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    recv(&mut a).await;
    let mut b = connect(&hub.ws_url).await;
    recv(&mut b).await;

    let drawn = rung(0, 100.0);
    send(&mut a, &ClientMessage::DrawLine { rung: drawn.clone() }).await;
    drain(&mut a).await;
    recv(&mut b).await; // new_line

    // Finish reaches every connection, sender included, with the full set.
    send(&mut a, &ClientMessage::Finish).await;
    for client in [&mut a, &mut b] {
        match recv(client).await {
            ServerMessage::ShowResults { rungs } => assert_eq!(rungs, vec![drawn.clone()]),
            other => panic!("expected show_results, got {other:?}"),
        }
    }

    // Drawing is frozen until a reset.
    let late = rung(2, 300.0);
    send(&mut a, &ClientMessage::DrawLine { rung: late.clone() }).await;
    match recv(&mut a).await {
        ServerMessage::LineRejected { rung_id, reason } => {
            assert_eq!(rung_id, late.id);
            assert_eq!(reason, RejectReason::DrawingClosed);
        }
        other => panic!("expected line_rejected, got {other:?}"),
    }

    send(&mut b, &ClientMessage::Reset).await;
    for client in [&mut a, &mut b] {
        assert!(matches!(recv(client).await, ServerMessage::Reset));
    }

    // The cleared ladder accepts rungs again.
    send(&mut a, &ClientMessage::DrawLine { rung: late.clone() }).await;
    match recv(&mut b).await {
        ServerMessage::NewLine { rung } => assert_eq!(rung, late),
        other => panic!("expected new_line, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_recovers_missed_rungs_via_request_state() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    recv(&mut a).await;
    let mut b = connect(&hub.ws_url).await;
    recv(&mut b).await;

    b.close(None).await.unwrap();
    drop(b);

    // Mutations land while b is away.
    let missed = rung(1, 150.0);
    send(&mut a, &ClientMessage::DrawLine { rung: missed.clone() }).await;
    drain(&mut a).await;

    let mut b = connect(&hub.ws_url).await;
    recv(&mut b).await; // init

    send(&mut b, &ClientMessage::RequestState).await;
    match recv(&mut b).await {
        ServerMessage::StateUpdate { rungs, phase } => {
            assert_eq!(rungs, vec![missed]);
            assert_eq!(phase, Phase::Drawing);
        }
        other => panic!("expected state_update, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_mutations_reach_the_store() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    recv(&mut a).await;

    let drawn = rung(0, 100.0);
    send(&mut a, &ClientMessage::DrawLine { rung: drawn.clone() }).await;
    drain(&mut a).await;

    // Persistence is fire-and-forget after the in-memory commit.
    let mut persisted = None;
    for _ in 0..100 {
        if let Some(state) = hub.store.load().await.unwrap() {
            if !state.rungs().is_empty() {
                persisted = Some(state);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let persisted = persisted.expect("mutation never reached the store");
    assert_eq!(persisted.rungs(), [drawn].as_slice());
    assert_eq!(persisted.phase(), Phase::Drawing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_agent_converges_with_raw_clients() {
    let hub = spawn_hub().await;

    let mut raw = connect(&hub.ws_url).await;
    recv(&mut raw).await;

    let (mut agent, _events) = SyncAgent::new(hub.ws_url.clone(), Layout::default());
    agent.connect().await.unwrap();
    assert!(agent.view().rungs().is_empty());

    // Agent-drawn rungs reach the other client.
    let from_agent = rung(0, 100.0);
    agent.draw(from_agent.clone()).await.unwrap();
    match recv(&mut raw).await {
        ServerMessage::NewLine { rung } => assert_eq!(rung, from_agent),
        other => panic!("expected new_line, got {other:?}"),
    }

    // Remote rungs land in the agent's mirror in arrival order.
    let from_raw = rung(2, 200.0);
    send(&mut raw, &ClientMessage::DrawLine { rung: from_raw.clone() }).await;
    agent.step().await.unwrap();
    assert_eq!(
        agent.view().rungs(),
        [from_agent, from_raw.clone()].as_slice()
    );

    // The agent's local validation mirrors the hub: an overlapping rung is
    // rejected before it ever reaches the wire.
    let conflicting = rung(1, 205.0);
    let err = agent.draw(conflicting).await.unwrap_err();
    assert!(matches!(err, AgentError::Rejected(RejectReason::Overlapping)));
    assert_eq!(agent.view().rungs().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polling_fallback_sees_remote_changes() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    recv(&mut a).await;
    let drawn = rung(0, 100.0);
    send(&mut a, &ClientMessage::DrawLine { rung: drawn.clone() }).await;
    drain(&mut a).await;

    let poller = amida_client::StatePoller::new(&hub.http_url, Duration::from_secs(1));
    let mut view = ClientView::new(Layout::default());

    assert!(poller.poll_once(&mut view).await.unwrap());
    assert_eq!(view.rungs(), [drawn].as_slice());
    // A second round with no remote change is a no-op.
    assert!(!poller.poll_once(&mut view).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rungs_off_the_ladder_are_rejected_at_the_boundary() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    recv(&mut a).await;
    let mut b = connect(&hub.ws_url).await;
    recv(&mut b).await;

    // Rails 10 and 11 do not exist in the default four-rail layout. Accepting
    // this rung would brick resolution for every client until a reset.
    let rogue = rung(10, 100.0);
    send(&mut a, &ClientMessage::DrawLine { rung: rogue.clone() }).await;
    match recv(&mut a).await {
        ServerMessage::LineRejected { rung_id, reason } => {
            assert_eq!(rung_id, rogue.id);
            assert_eq!(reason, RejectReason::OutOfRange);
        }
        other => panic!("expected line_rejected, got {other:?}"),
    }

    // The authoritative state stays clean and resolvable.
    send(&mut a, &ClientMessage::RequestState).await;
    match recv(&mut a).await {
        ServerMessage::StateUpdate { rungs, .. } => {
            assert!(rungs.is_empty());
            assert_eq!(resolve_path(0, &rungs, &Layout::default()).unwrap().end_rail, 0);
        }
        other => panic!("expected state_update, got {other:?}"),
    }

    // Other clients never hear about the rejected rung: the next broadcast b
    // sees is the first valid draw.
    let valid = rung(0, 100.0);
    send(&mut a, &ClientMessage::DrawLine { rung: valid.clone() }).await;
    match recv(&mut b).await {
        ServerMessage::NewLine { rung } => assert_eq!(rung, valid),
        other => panic!("expected new_line, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcasts_arrive_in_commit_order() {
    let hub = spawn_hub().await;

    let mut observer = connect(&hub.ws_url).await;
    let mut view = ClientView::new(Layout::default());
    match recv(&mut observer).await {
        msg @ ServerMessage::Init { .. } => view.apply(&msg),
        other => panic!("expected init, got {other:?}"),
    }

    // Two writers race draws against resets. The drawer's rungs sit 25px
    // apart on the same rail pair, so each one is valid no matter how many
    // resets land in between.
    let draw_url = hub.ws_url.clone();
    let drawer = tokio::spawn(async move {
        let mut client = connect(&draw_url).await;
        recv(&mut client).await;
        for i in 0..12 {
            let candidate = rung(0, 30.0 + 25.0 * i as f64);
            send(&mut client, &ClientMessage::DrawLine { rung: candidate }).await;
        }
        wait_for_pong(&mut client).await;
    });
    let reset_url = hub.ws_url.clone();
    let resetter = tokio::spawn(async move {
        let mut client = connect(&reset_url).await;
        recv(&mut client).await;
        for _ in 0..6 {
            send(&mut client, &ClientMessage::Reset).await;
        }
        wait_for_pong(&mut client).await;
    });
    drawer.await.unwrap();
    resetter.await.unwrap();

    // A marker commit after both writers finished; its broadcast is the last
    // frame the observer needs to apply.
    let mut last = connect(&hub.ws_url).await;
    recv(&mut last).await;
    let marker = rung(2, 390.0);
    send(&mut last, &ClientMessage::DrawLine { rung: marker.clone() }).await;
    wait_for_pong(&mut last).await;

    loop {
        let msg = recv(&mut observer).await;
        view.apply(&msg);
        if matches!(&msg, ServerMessage::NewLine { rung } if rung.id == marker.id) {
            break;
        }
    }

    // Applying broadcasts in arrival order converged on the authoritative
    // state: no orphaned rung survived a reset, no reset erased a later draw.
    let state = hub.hub.snapshot().await;
    assert_eq!(view.rungs(), state.rungs());
    assert_eq!(view.phase(), state.phase());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pruned_connections_are_closed() {
    let hub = spawn_hub().await;

    let mut a = connect(&hub.ws_url).await;
    recv(&mut a).await;

    hub.hub.prune_stale(Duration::ZERO).await;

    // The prune closes the socket, so the client observes the drop instead of
    // silently missing every later broadcast.
    let frame = timeout(Duration::from_secs(5), a.next())
        .await
        .expect("timed out waiting for the close");
    match frame {
        None | Some(Ok(Message::Close(_))) => {}
        other => panic!("expected the connection to close, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pruned_agent_reconnects_on_its_own() {
    let hub = spawn_hub().await;

    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        max_attempts: 5,
    };
    let (mut agent, mut events) =
        SyncAgent::with_policy(hub.ws_url.clone(), Layout::default(), policy);
    agent.connect().await.unwrap();
    tokio::spawn(async move {
        let _ = agent.run().await;
    });

    assert_eq!(next_status(&mut events).await, AgentStatus::Connecting);
    assert_eq!(next_status(&mut events).await, AgentStatus::Connected);

    hub.hub.prune_stale(Duration::ZERO).await;

    // The close frame reaches the agent, which runs its reconnect path and
    // comes back without any outside help.
    assert!(matches!(
        next_status(&mut events).await,
        AgentStatus::Reconnecting { .. }
    ));
    assert_eq!(next_status(&mut events).await, AgentStatus::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeats_keep_an_idle_agent_registered() {
    let hub = spawn_hub().await;

    let (mut agent, mut events) = SyncAgent::new(hub.ws_url.clone(), Layout::default());
    agent.set_heartbeat_interval(Duration::from_millis(20));
    agent.connect().await.unwrap();
    tokio::spawn(async move {
        let _ = agent.run().await;
    });

    // Let several heartbeats through, then prune with a window wider than the
    // heartbeat interval: the idle agent must survive.
    tokio::time::sleep(Duration::from_millis(150)).await;
    drain_events(&mut events);
    hub.hub.prune_stale(Duration::from_millis(100)).await;

    let mut raw = connect(&hub.ws_url).await;
    recv(&mut raw).await;
    send(&mut raw, &ClientMessage::DrawLine { rung: rung(0, 100.0) }).await;
    drain(&mut raw).await;

    // Still registered: the draw reaches the agent's mirror directly. Had the
    // prune dropped it, the first event here would be a reconnect status.
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an agent event")
        .expect("agent event channel closed");
    assert!(
        matches!(event, AgentEvent::ViewChanged),
        "agent was pruned despite its heartbeats: {event:?}"
    );
}

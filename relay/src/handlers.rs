//! # WebSocket Handlers
//!
//! The two WebSocket endpoints of the relay:
//! - `/ws/agent/{id}` — authenticated agent sessions
//! - `/ws/client/{id}` — browser clients binding to an agent
//!
//! Each accepted socket is driven by a single receive loop plus one
//! outbound task that drains the peer's message queue. Cleanup on
//! disconnect removes the peer from the tables; for agents it broadcasts
//! `agent_offline` to bound clients, unless a newer socket has already
//! taken over the record.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use termlink_protocol::{decode, Decoded, Frame};

use crate::state::{
    generate_conn_id, AppState, Outbound, CLOSE_AGENT_NOT_FOUND, CLOSE_INVALID_CREDENTIALS,
};

/// Transport-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long the receive loop tolerates silence before declaring the peer
/// dead: one ping interval plus the 10 s pong deadline.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(40);

/// Standard close code for a protocol violation (malformed frame).
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Deserialize)]
pub struct AgentKeyQuery {
    #[serde(default)]
    key: String,
}

// ─── Upgrade Endpoints ──────────────────────────────────────────

/// `GET /ws/agent/{id}?key=…` — agent session upgrade.
pub async fn agent_ws(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    Query(query): Query<AgentKeyQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent(socket, state, agent_id, query.key))
}

/// `GET /ws/client/{id}` — client session upgrade. `{id}` is the agent the
/// client wants to bind to.
pub async fn client_ws(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state, agent_id))
}

/// Closes a just-accepted socket with an application close code. WebSocket
/// close codes can only be sent after the upgrade, so refusals happen here
/// rather than at the HTTP layer.
async fn refuse(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

// ─── Outbound Task ──────────────────────────────────────────────

/// Drains a peer's outbound queue into the WebSocket sink, interleaving
/// transport pings. Ends on queue close, an explicit `Outbound::Close`, or
/// a send failure.
fn spawn_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // the first tick fires immediately; skip it

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(Outbound::Frame(frame)) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(t) => t,
                            Err(e) => {
                                error!("Serialize error: {}", e);
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break; // WebSocket closed; stop sending
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Pulls the next inbound message, enforcing the idle deadline. Returns
/// `None` when the connection should be torn down.
async fn next_message(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    peer: &str,
) -> Option<Message> {
    match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(msg))) => Some(msg),
        Ok(Some(Err(e))) => {
            debug!("Transport error from {}: {}", peer, e);
            None
        }
        Ok(None) => None,
        Err(_) => {
            warn!("Peer {} idle past deadline; closing", peer);
            None
        }
    }
}

// ─── Agent Connection Lifecycle ─────────────────────────────────

async fn handle_agent(socket: WebSocket, state: AppState, agent_id: String, key: String) {
    if !state.agents.contains_key(&agent_id) {
        refuse(socket, CLOSE_AGENT_NOT_FOUND, "Agent not found").await;
        return;
    }
    if !state.verify(&agent_id, &key) {
        warn!("Invalid credentials for agent {}", agent_id);
        refuse(socket, CLOSE_INVALID_CREDENTIALS, "Invalid agent credentials").await;
        return;
    }

    let conn_id = generate_conn_id();
    info!("Agent {} connected (conn={})", agent_id, conn_id);

    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let outbound = spawn_outbound(ws_sink, rx);

    state.attach_agent_socket(&agent_id, &conn_id, tx.clone());

    while let Some(msg) = next_message(&mut ws_stream, &conn_id).await {
        match msg {
            Message::Text(text) => match decode(&text) {
                Decoded::Frame(frame) => handle_agent_frame(&state, &agent_id, &tx, frame),
                Decoded::Unknown(ty) => {
                    debug!("Ignoring unknown frame type '{}' from agent {}", ty, agent_id);
                }
                Decoded::Malformed(reason) => {
                    warn!("Malformed frame from agent {}: {}", agent_id, reason);
                    let _ = tx.send(Outbound::Close {
                        code: CLOSE_PROTOCOL_ERROR,
                        reason: "malformed frame",
                    });
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup ──
    // detach only succeeds if this connection still owns the live socket;
    // an evicted socket must not broadcast agent_offline for its successor.
    state.detach_agent_socket(&agent_id, &conn_id);
    outbound.abort();
    info!("Agent connection {} closed", conn_id);
}

pub(crate) fn handle_agent_frame(
    state: &AppState,
    agent_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    frame: Frame,
) {
    match frame {
        Frame::Heartbeat => {
            state.record_heartbeat(agent_id);
            let _ = tx.send(Outbound::Frame(Frame::HeartbeatAck));
        }
        Frame::Output { data } => {
            state.broadcast_to_clients(agent_id, Frame::Output { data });
        }
        Frame::Status { child_alive } => {
            state.record_status(agent_id, child_alive);
        }
        Frame::Error { message } => {
            warn!("Agent {} reported error: {}", agent_id, message);
            state.broadcast_to_clients(agent_id, Frame::Error { message });
        }
        other => {
            debug!("Ignoring unexpected frame from agent {}: {:?}", agent_id, other);
        }
    }
}

// ─── Client Connection Lifecycle ────────────────────────────────

async fn handle_client(socket: WebSocket, state: AppState, agent_id: String) {
    if !state.agents.contains_key(&agent_id) {
        refuse(socket, CLOSE_AGENT_NOT_FOUND, "Agent not found").await;
        return;
    }

    let client_id = generate_conn_id();
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let outbound = spawn_outbound(ws_sink, rx);

    let Some(agent_online) = state.bind_client(&client_id, tx.clone(), &agent_id) else {
        // The agent was deleted between the existence check and the bind.
        let _ = tx.send(Outbound::Close {
            code: CLOSE_AGENT_NOT_FOUND,
            reason: "Agent not found",
        });
        let _ = outbound.await;
        return;
    };

    let _ = tx.send(Outbound::Frame(Frame::Connected {
        client_id: client_id.clone(),
        agent_id: agent_id.clone(),
        agent_online,
    }));

    while let Some(msg) = next_message(&mut ws_stream, &client_id).await {
        match msg {
            Message::Text(text) => match decode(&text) {
                Decoded::Frame(frame) => handle_client_frame(&state, &agent_id, &client_id, &tx, frame),
                Decoded::Unknown(ty) => {
                    debug!("Ignoring unknown frame type '{}' from client {}", ty, client_id);
                }
                Decoded::Malformed(reason) => {
                    warn!("Malformed frame from client {}: {}", client_id, reason);
                    let _ = tx.send(Outbound::Close {
                        code: CLOSE_PROTOCOL_ERROR,
                        reason: "malformed frame",
                    });
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.remove_client(&client_id);
    outbound.abort();
    info!("Client {} disconnected", client_id);
}

pub(crate) fn handle_client_frame(
    state: &AppState,
    agent_id: &str,
    client_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    frame: Frame,
) {
    match frame {
        Frame::Input { data, .. } => {
            // Enrich with the originating client so the agent can attribute
            // keystrokes. Offline input is dropped, never buffered.
            let delivered = state.forward_to_agent(
                agent_id,
                Frame::Input {
                    data,
                    client_id: Some(client_id.to_string()),
                },
            );
            if !delivered {
                let _ = tx.send(Outbound::Frame(Frame::Error {
                    message: "Agent is offline".to_string(),
                }));
            }
        }
        Frame::Resize { rows, cols } => {
            let delivered = state.forward_to_agent(agent_id, Frame::Resize { rows, cols });
            if !delivered {
                let _ = tx.send(Outbound::Frame(Frame::Error {
                    message: "Agent is offline".to_string(),
                }));
            }
        }
        Frame::Ping => {
            let _ = tx.send(Outbound::Frame(Frame::Pong));
        }
        other => {
            debug!("Ignoring unexpected frame from client {}: {:?}", client_id, other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PeerTx;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn peer() -> (PeerTx, UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    fn frame(rx: &mut UnboundedReceiver<Outbound>) -> Frame {
        match rx.try_recv().expect("expected an outbound item") {
            Outbound::Frame(f) => f,
            Outbound::Close { code, reason } => panic!("expected frame, got close {code} {reason}"),
        }
    }

    #[test]
    fn client_input_is_enriched_with_client_id() {
        let state = AppState::new();
        let (agent_id, _) = state.register_agent("a");
        let (atx, mut arx) = peer();
        state.attach_agent_socket(&agent_id, "conn1", atx);

        let (ctx, _crx) = peer();
        handle_client_frame(
            &state,
            &agent_id,
            "c1",
            &ctx,
            Frame::Input {
                data: "x".into(),
                client_id: None,
            },
        );

        assert_eq!(
            frame(&mut arx),
            Frame::Input {
                data: "x".into(),
                client_id: Some("c1".into()),
            }
        );
    }

    #[test]
    fn offline_input_yields_exactly_one_error_frame() {
        let state = AppState::new();
        let (agent_id, _) = state.register_agent("a");

        let (ctx, mut crx) = peer();
        handle_client_frame(
            &state,
            &agent_id,
            "c1",
            &ctx,
            Frame::Input {
                data: "x".into(),
                client_id: None,
            },
        );

        assert_eq!(
            frame(&mut crx),
            Frame::Error {
                message: "Agent is offline".into(),
            }
        );
        assert!(crx.try_recv().is_err());
    }

    #[test]
    fn client_ping_gets_pong() {
        let state = AppState::new();
        let (agent_id, _) = state.register_agent("a");
        let (ctx, mut crx) = peer();

        handle_client_frame(&state, &agent_id, "c1", &ctx, Frame::Ping);
        assert_eq!(frame(&mut crx), Frame::Pong);
    }

    #[test]
    fn agent_heartbeat_is_acknowledged() {
        let state = AppState::new();
        let (agent_id, _) = state.register_agent("a");
        let (atx, mut arx) = peer();

        handle_agent_frame(&state, &agent_id, &atx, Frame::Heartbeat);
        assert_eq!(frame(&mut arx), Frame::HeartbeatAck);
        assert!(state
            .agents
            .get(&agent_id)
            .unwrap()
            .last_heartbeat
            .is_some());
    }

    #[test]
    fn agent_output_fans_out_to_bound_clients() {
        let state = AppState::new();
        let (agent_id, _) = state.register_agent("a");
        let (atx, _arx) = peer();

        let (c1, mut r1) = peer();
        let (c2, mut r2) = peer();
        state.bind_client("c1", c1, &agent_id);
        state.bind_client("c2", c2, &agent_id);

        handle_agent_frame(
            &state,
            &agent_id,
            &atx,
            Frame::Output { data: "ok".into() },
        );

        assert_eq!(frame(&mut r1), Frame::Output { data: "ok".into() });
        assert_eq!(frame(&mut r2), Frame::Output { data: "ok".into() });
        assert!(r1.try_recv().is_err());
        assert!(r2.try_recv().is_err());
    }
}

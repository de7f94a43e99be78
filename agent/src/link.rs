//! # Agent-Relay Link
//!
//! The outbound WebSocket connection from the agent to the relay, used
//! instead of (or alongside) direct exposure. Forwards PTY output frames
//! up, injects input and resize frames coming down, and keeps the session
//! alive with application heartbeats.
//!
//! ## Connection Lifecycle
//! 1. Dial `ws(s)://<relay>/ws/agent/{id}?key=…`
//! 2. Spawn the per-connection workers: outbound sender, heartbeat,
//!    output forwarder
//! 3. Dispatch incoming frames on this task until the connection dies
//! 4. Cancel all workers
//! 5. Sleep the current backoff and go to step 1

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use termlink_protocol::{decode, Decoded, Frame};

use crate::pty::{OutputEvent, PtySession};

/// Application heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Tolerated inbound silence. The relay answers every heartbeat and pings
/// on its own 30 s cadence, so a quiet link this long is dead.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(70);

/// Reconnect backoff bounds: 5 s doubling to a 60 s cap.
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Relay close codes that will not heal on retry.
const CLOSE_INVALID_CREDENTIALS: u16 = 4001;
const CLOSE_AGENT_NOT_FOUND: u16 = 4004;

/// Credentials and endpoint for the relay connection.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Relay base URL, e.g. `wss://relay.example.com`.
    pub relay_url: String,
    pub agent_id: String,
    pub agent_key: String,
}

impl LinkConfig {
    fn endpoint(&self) -> String {
        format!(
            "{}/ws/agent/{}?key={}",
            self.relay_url.trim_end_matches('/'),
            self.agent_id,
            self.agent_key
        )
    }
}

/// Why a connection attempt ended.
#[derive(Clone, Copy)]
enum LinkEnd {
    /// The session reached the established state before dying.
    Established,
    /// Transport failure, protocol error, or never established.
    Failed,
    /// The relay refused the credentials or the agent id; retrying cannot
    /// help until the operator fixes the configuration.
    Rejected,
    /// Shutdown was requested.
    Shutdown,
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_MAX)
}

/// Runs the relay link until shutdown or a non-retryable rejection.
///
/// Transport and protocol failures are retried with exponential backoff;
/// the backoff resets once a session is fully established. The child
/// process is never restarted from here.
pub async fn run_link(session: Arc<PtySession>, config: LinkConfig, shutdown: CancellationToken) {
    let endpoint = config.endpoint();
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        info!("Connecting to relay {}", config.relay_url);
        let end = match connect_async(endpoint.as_str()).await {
            Ok((ws, _)) => run_connection(&session, ws, &shutdown).await,
            Err(e) => {
                error!("Relay connection failed: {}", e);
                LinkEnd::Failed
            }
        };

        match end {
            LinkEnd::Shutdown => break,
            LinkEnd::Rejected => {
                error!("Relay rejected this agent; check --agent-id / --agent-key");
                break;
            }
            LinkEnd::Established => backoff = BACKOFF_INITIAL,
            LinkEnd::Failed => {}
        }

        info!("Reconnecting in {}s", backoff.as_secs());
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
        if !matches!(end, LinkEnd::Established) {
            backoff = next_backoff(backoff);
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &Frame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => tx.send(Message::Text(text)).is_ok(),
        Err(e) => {
            error!("Serialize error: {}", e);
            false
        }
    }
}

/// Drives one live connection: spawns the workers, dispatches inbound
/// frames, and cancels everything the moment any part of the session
/// fails.
async fn run_connection(
    session: &Arc<PtySession>,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shutdown: &CancellationToken,
) -> LinkEnd {
    let (ws_sink, mut ws_stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // ── Outbound Sender ──
    let outbound = tokio::spawn(async move {
        let mut sink = ws_sink;
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break; // connection lost
            }
        }
    });

    // ── Heartbeat ──
    // Sends a heartbeat (plus a status report) every 30 seconds. The first
    // tick fires immediately, so the relay can acknowledge and mark the
    // session established right away.
    let hb_tx = tx.clone();
    let hb_session = session.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            if !send_frame(&hb_tx, &Frame::Heartbeat) {
                break;
            }
            let child_alive = hb_session.child_alive().await;
            if !send_frame(&hb_tx, &Frame::Status { child_alive }) {
                break;
            }
        }
    });

    // ── Output Forwarder ──
    // Fresh subscription per connection; a reconnect resubscribes to the
    // local PTY queue. Ends quietly when the session stops, which is not a
    // link failure.
    let fw_tx = tx.clone();
    let mut output = session.subscribe();
    let forwarder = tokio::spawn(async move {
        loop {
            match output.next_output(Duration::from_secs(3600)).await {
                OutputEvent::Chunk(data) => {
                    if !send_frame(&fw_tx, &Frame::Output { data }) {
                        break;
                    }
                }
                OutputEvent::Timeout => {}
                OutputEvent::Stopped => {
                    let _ = send_frame(&fw_tx, &Frame::Status { child_alive: false });
                    break;
                }
            }
        }
    });

    // ── Inbound Dispatch ──
    let mut established = false;
    let end = loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => break LinkEnd::Shutdown,
            res = tokio::time::timeout(READ_IDLE_TIMEOUT, ws_stream.next()) => match res {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    debug!("Relay transport error: {}", e);
                    break LinkEnd::Failed;
                }
                Ok(None) => break LinkEnd::Failed,
                Err(_) => {
                    warn!("Relay silent past deadline; reconnecting");
                    break LinkEnd::Failed;
                }
            },
        };

        match msg {
            Message::Text(text) => match decode(&text) {
                Decoded::Frame(Frame::HeartbeatAck) => established = true,
                Decoded::Frame(Frame::Input { data, client_id }) => {
                    debug!(
                        "Input from client {:?}: {} bytes",
                        client_id,
                        data.len()
                    );
                    session.write_input(data.as_bytes()).await;
                }
                Decoded::Frame(Frame::Resize { rows, cols }) => {
                    session
                        .resize(rows.clamp(1, 1000), cols.clamp(1, 1000))
                        .await;
                }
                Decoded::Frame(Frame::Error { message }) => {
                    warn!("Relay error: {}", message);
                }
                Decoded::Frame(other) => {
                    debug!("Ignoring unexpected frame from relay: {:?}", other);
                }
                Decoded::Unknown(ty) => {
                    debug!("Ignoring unknown frame type '{}' from relay", ty);
                }
                Decoded::Malformed(reason) => {
                    warn!("Malformed frame from relay: {}", reason);
                    break LinkEnd::Failed;
                }
            },
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Message::Close(frame) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                warn!("Relay closed the link: {:?}", frame);
                if matches!(
                    code,
                    Some(CLOSE_INVALID_CREDENTIALS) | Some(CLOSE_AGENT_NOT_FOUND)
                ) {
                    break LinkEnd::Rejected;
                }
                break LinkEnd::Failed;
            }
            _ => {}
        }
    };

    // ── Teardown ──
    // One worker down takes the rest with it before we reconnect.
    outbound.abort();
    heartbeat.abort();
    forwarder.abort();

    match end {
        LinkEnd::Failed if established => LinkEnd::Established,
        other => other,
    }
}

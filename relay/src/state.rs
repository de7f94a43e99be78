//! # Relay State
//!
//! Holds the shared application state for the relay server:
//! - **Agent registry**: agent records keyed by agent ID
//! - **Client registry**: connected browser clients keyed by client ID
//! - **Binding registry**: the set of client IDs bound to each agent
//!
//! All registries use [`DashMap`] for lock-free concurrent access, since
//! multiple WebSocket connections are handled concurrently. The binding
//! registry stores client *IDs* rather than client records; lookups go
//! through the client registry, so eviction never chases cycles.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

use termlink_protocol::Frame;

/// WebSocket close code sent to an agent socket evicted by a newer one.
pub const CLOSE_REPLACED: u16 = 4000;

/// WebSocket close code for invalid agent credentials.
pub const CLOSE_INVALID_CREDENTIALS: u16 = 4001;

/// WebSocket close code for an unknown agent ID.
pub const CLOSE_AGENT_NOT_FOUND: u16 = 4004;

/// An item queued for a peer's outbound WebSocket task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A protocol frame, serialized to a JSON text message.
    Frame(Frame),
    /// Close the socket with the given code and reason, then stop sending.
    Close { code: u16, reason: &'static str },
}

/// Type alias for the unbounded sender used to push outbound items to a
/// peer's WebSocket queue. Each connected peer gets one of these.
pub type PeerTx = mpsc::UnboundedSender<Outbound>;

/// The live socket currently attached to an agent record.
///
/// `conn_id` identifies the WebSocket connection that owns the attachment;
/// a stale connection's cleanup path must not detach a newer socket, so
/// detachment always compares connection IDs.
#[derive(Debug, Clone)]
pub struct LiveSocket {
    pub conn_id: String,
    pub tx: PeerTx,
}

/// A registered agent. Created by `POST /api/agents`; lives until the relay
/// restarts (no persistence).
#[derive(Debug, Clone)]
pub struct AgentRecord {
    /// Short opaque identifier, URL-safe, unique across the relay.
    pub agent_id: String,
    /// High-entropy secret, shown exactly once at registration. Immutable.
    pub agent_key: String,
    /// Human label supplied at registration.
    pub name: String,
    /// The current bidirectional channel to the agent. At most one; a new
    /// successful authentication evicts the prior socket.
    pub live: Option<LiveSocket>,
    /// When the current socket attached.
    pub connected_at: Option<DateTime<Utc>>,
    /// Last application-level heartbeat or status report.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Child-process liveness from the agent's last `status` frame.
    pub child_alive: Option<bool>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// `online` is derived: true iff a live socket is attached.
    pub fn online(&self) -> bool {
        self.live.is_some()
    }
}

/// A connected browser client. Created on WebSocket accept, destroyed on
/// close.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Per-connection short opaque id.
    pub client_id: String,
    /// Channel to this client's outbound WebSocket task.
    pub tx: PeerTx,
    /// The agent this client is forwarding to/from.
    pub bound_agent: Option<String>,
    /// When the client connected.
    pub connected_at: DateTime<Utc>,
}

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    /// Registry of registered agents, keyed by agent ID.
    pub agents: Arc<DashMap<String, AgentRecord>>,

    /// Registry of connected clients, keyed by client ID.
    pub clients: Arc<DashMap<String, ClientRecord>>,

    /// Client IDs bound to each agent, keyed by agent ID. Membership here
    /// is kept in lock-step with `ClientRecord::bound_agent`.
    pub clients_by_agent: Arc<DashMap<String, HashSet<String>>>,
}

impl AppState {
    /// Creates a new empty application state with all registries
    /// initialized.
    pub fn new() -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
            clients_by_agent: Arc::new(DashMap::new()),
        }
    }
}

/// Generates a short per-connection id from a UUID.
pub fn generate_conn_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

//! # Broker Operations
//!
//! The connection-table mutations behind both WebSocket endpoints:
//! agent registration and verification, socket attach/detach with
//! single-socket eviction, client binding, and frame forwarding in both
//! directions. Fan-out to clients isolates per-client send failures: a dead
//! client is dropped from the tables without affecting the others.

use chrono::Utc;
use tracing::{info, warn};

use termlink_protocol::auth::{constant_time_eq, generate_agent_id, generate_secret, AGENT_KEY_BYTES};
use termlink_protocol::Frame;

use crate::state::{AgentRecord, AppState, ClientRecord, LiveSocket, Outbound, PeerTx, CLOSE_REPLACED};

/// Standard close code sent to every peer when the relay shuts down.
const CLOSE_GOING_AWAY: u16 = 1001;

impl AppState {
    /// Creates a new agent record with a fresh id and key.
    ///
    /// Returns `(agent_id, agent_key)`. The key is stored on the record and
    /// never surfaced again; callers must show it to the registrant now or
    /// never.
    pub fn register_agent(&self, name: &str) -> (String, String) {
        let mut agent_id = generate_agent_id();
        while self.agents.contains_key(&agent_id) {
            agent_id = generate_agent_id();
        }
        let agent_key = generate_secret(AGENT_KEY_BYTES);

        self.agents.insert(
            agent_id.clone(),
            AgentRecord {
                agent_id: agent_id.clone(),
                agent_key: agent_key.clone(),
                name: name.to_string(),
                live: None,
                connected_at: None,
                last_heartbeat: None,
                child_alive: None,
                created_at: Utc::now(),
            },
        );
        info!("Agent registered: {} ({})", agent_id, name);
        (agent_id, agent_key)
    }

    /// Checks an agent key against the stored one in constant time.
    /// Returns false for unknown agents.
    pub fn verify(&self, agent_id: &str, key: &str) -> bool {
        self.agents
            .get(agent_id)
            .map(|rec| constant_time_eq(rec.agent_key.as_bytes(), key.as_bytes()))
            .unwrap_or(false)
    }

    /// Installs `tx` as the agent's live socket.
    ///
    /// If a prior socket exists it is closed with code 4000 "replaced";
    /// after this returns, no frame is ever routed to the stale socket.
    /// Every bound client is notified with `agent_online`.
    pub fn attach_agent_socket(&self, agent_id: &str, conn_id: &str, tx: PeerTx) {
        let replaced = {
            let Some(mut rec) = self.agents.get_mut(agent_id) else {
                return;
            };
            let old = rec.live.take();
            rec.live = Some(LiveSocket {
                conn_id: conn_id.to_string(),
                tx,
            });
            rec.connected_at = Some(Utc::now());
            old
        };

        if let Some(old) = replaced {
            info!("Agent {} reconnected; evicting socket {}", agent_id, old.conn_id);
            let _ = old.tx.send(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: "replaced",
            });
        }

        self.broadcast_to_clients(
            agent_id,
            Frame::AgentOnline {
                agent_id: agent_id.to_string(),
            },
        );
    }

    /// Clears the agent's live socket, but only if `conn_id` still owns it.
    ///
    /// A stale connection's cleanup path must not detach the socket a newer
    /// connection installed. Returns true if the socket was detached, in
    /// which case every bound client has been sent `agent_offline`.
    pub fn detach_agent_socket(&self, agent_id: &str, conn_id: &str) -> bool {
        let detached = {
            let Some(mut rec) = self.agents.get_mut(agent_id) else {
                return false;
            };
            match &rec.live {
                Some(live) if live.conn_id == conn_id => {
                    rec.live = None;
                    true
                }
                _ => false,
            }
        };

        if detached {
            info!("Agent {} disconnected", agent_id);
            self.broadcast_to_clients(
                agent_id,
                Frame::AgentOffline {
                    agent_id: agent_id.to_string(),
                },
            );
        }
        detached
    }

    /// Records an application-level heartbeat from the agent.
    pub fn record_heartbeat(&self, agent_id: &str) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.last_heartbeat = Some(Utc::now());
        }
    }

    /// Records a `status` report from the agent.
    pub fn record_status(&self, agent_id: &str, child_alive: bool) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.last_heartbeat = Some(Utc::now());
            rec.child_alive = Some(child_alive);
        }
    }

    /// Binds a freshly accepted client to an agent.
    ///
    /// Returns the agent's current online state, or `None` if the agent is
    /// unknown (the caller refuses the connection).
    pub fn bind_client(&self, client_id: &str, tx: PeerTx, agent_id: &str) -> Option<bool> {
        let online = self.agents.get(agent_id).map(|rec| rec.online())?;

        self.clients.insert(
            client_id.to_string(),
            ClientRecord {
                client_id: client_id.to_string(),
                tx,
                bound_agent: Some(agent_id.to_string()),
                connected_at: Utc::now(),
            },
        );
        self.clients_by_agent
            .entry(agent_id.to_string())
            .or_default()
            .insert(client_id.to_string());

        info!("Client {} bound to agent {}", client_id, agent_id);
        Some(online)
    }

    /// Removes a client from both the client registry and its agent's
    /// binding set. Safe to call for clients that were never bound.
    pub fn remove_client(&self, client_id: &str) {
        let bound = self
            .clients
            .remove(client_id)
            .and_then(|(_, rec)| rec.bound_agent);
        if let Some(agent_id) = bound {
            if let Some(mut set) = self.clients_by_agent.get_mut(&agent_id) {
                set.remove(client_id);
            }
        }
    }

    /// Forwards a frame to the agent's live socket.
    ///
    /// Returns true on delivery. Returns false when the agent is offline or
    /// the socket's queue is gone; the caller answers the originating
    /// client with an error frame. Offline input is dropped, never queued.
    pub fn forward_to_agent(&self, agent_id: &str, frame: Frame) -> bool {
        let tx = {
            let Some(rec) = self.agents.get(agent_id) else {
                return false;
            };
            match &rec.live {
                Some(live) => live.tx.clone(),
                None => return false,
            }
        };
        tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Sends a frame to every client bound to `agent_id`.
    ///
    /// The loop pushes to each client's outbound queue without suspending,
    /// so all clients observe frames in the order the agent produced them.
    /// A client whose queue is gone is evicted from the tables; the
    /// remaining clients still receive this same frame.
    pub fn broadcast_to_clients(&self, agent_id: &str, frame: Frame) {
        let targets: Vec<String> = match self.clients_by_agent.get(agent_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return,
        };

        let mut dead: Vec<String> = Vec::new();
        for client_id in &targets {
            let delivered = self
                .clients
                .get(client_id)
                .map(|rec| rec.tx.send(Outbound::Frame(frame.clone())).is_ok())
                .unwrap_or(false);
            if !delivered {
                dead.push(client_id.clone());
            }
        }

        for client_id in dead {
            warn!("Dropping dead client {} bound to {}", client_id, agent_id);
            self.remove_client(&client_id);
        }
    }

    /// Counts agents with a live socket attached.
    pub fn agents_online(&self) -> usize {
        self.agents.iter().filter(|rec| rec.online()).count()
    }

    /// Asks every live peer socket to close. Used during shutdown so the
    /// graceful-shutdown path is not held open by long-lived WebSockets.
    pub fn close_all_peers(&self) {
        for rec in self.agents.iter() {
            if let Some(live) = &rec.live {
                let _ = live.tx.send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "shutting down",
                });
            }
        }
        for client in self.clients.iter() {
            let _ = client.tx.send(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "shutting down",
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Outbound;
    use tokio::sync::mpsc;

    fn peer() -> (PeerTx, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    fn frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Frame {
        match rx.try_recv().expect("expected an outbound item") {
            Outbound::Frame(f) => f,
            Outbound::Close { code, reason } => panic!("expected frame, got close {code} {reason}"),
        }
    }

    #[test]
    fn register_and_verify() {
        let state = AppState::new();
        let (id, key) = state.register_agent("laptop");

        assert!(id.len() >= 10);
        assert!(key.len() >= 40);
        assert_eq!(state.agents.get(&id).unwrap().name, "laptop");
        assert!(!state.agents.get(&id).unwrap().online());

        assert!(state.verify(&id, &key));
        assert!(!state.verify(&id, "wrong"));
        assert!(!state.verify("NOPE-0000-0000", &key));
    }

    #[test]
    fn attach_marks_online_and_evicts_prior_socket() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        let (tx1, mut rx1) = peer();
        state.attach_agent_socket(&id, "conn1", tx1);
        assert!(state.agents.get(&id).unwrap().online());

        let (tx2, _rx2) = peer();
        state.attach_agent_socket(&id, "conn2", tx2);

        // First socket is told it was replaced.
        match rx1.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, CLOSE_REPLACED);
                assert_eq!(reason, "replaced");
            }
            other => panic!("expected close, got {other:?}"),
        }

        // A frame forwarded now lands on the new socket, never the stale one.
        assert!(state.forward_to_agent(
            &id,
            Frame::Input {
                data: "x".into(),
                client_id: None
            }
        ));
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn stale_cleanup_does_not_detach_newer_socket() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        let (tx1, _rx1) = peer();
        state.attach_agent_socket(&id, "conn1", tx1);
        let (tx2, _rx2) = peer();
        state.attach_agent_socket(&id, "conn2", tx2);

        // The evicted connection's cleanup runs after the new attach.
        assert!(!state.detach_agent_socket(&id, "conn1"));
        assert!(state.agents.get(&id).unwrap().online());

        assert!(state.detach_agent_socket(&id, "conn2"));
        assert!(!state.agents.get(&id).unwrap().online());
    }

    #[test]
    fn bind_tracks_membership_both_ways() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        let (tx, mut rx) = peer();
        let online = state.bind_client("c1", tx, &id).unwrap();
        assert!(!online);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            state.clients.get("c1").unwrap().bound_agent.as_deref(),
            Some(id.as_str())
        );
        assert!(state.clients_by_agent.get(&id).unwrap().contains("c1"));

        state.remove_client("c1");
        assert!(state.clients.get("c1").is_none());
        assert!(!state.clients_by_agent.get(&id).unwrap().contains("c1"));
    }

    #[test]
    fn bind_refuses_unknown_agent() {
        let state = AppState::new();
        let (tx, _rx) = peer();
        assert!(state.bind_client("c1", tx, "NOPE-0000-0000").is_none());
        assert!(state.clients.get("c1").is_none());
    }

    #[test]
    fn forward_while_offline_is_refused_and_not_queued() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        assert!(!state.forward_to_agent(
            &id,
            Frame::Input {
                data: "x".into(),
                client_id: Some("c1".into())
            }
        ));

        // Agent comes online later and receives nothing buffered.
        let (tx, mut rx) = peer();
        state.attach_agent_socket(&id, "conn1", tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_all_bound_clients_in_order() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        let (tx1, mut rx1) = peer();
        let (tx2, mut rx2) = peer();
        state.bind_client("c1", tx1, &id);
        state.bind_client("c2", tx2, &id);

        state.broadcast_to_clients(&id, Frame::Output { data: "one".into() });
        state.broadcast_to_clients(&id, Frame::Output { data: "two".into() });

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(frame(rx), Frame::Output { data: "one".into() });
            assert_eq!(frame(rx), Frame::Output { data: "two".into() });
        }
    }

    #[test]
    fn broadcast_survives_one_dead_client() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        let (tx1, rx1) = peer();
        let (tx2, mut rx2) = peer();
        state.bind_client("c1", tx1, &id);
        state.bind_client("c2", tx2, &id);
        drop(rx1);

        state.broadcast_to_clients(&id, Frame::Output { data: "ok".into() });

        assert_eq!(frame(&mut rx2), Frame::Output { data: "ok".into() });
        // The dead client is evicted from both tables.
        assert!(state.clients.get("c1").is_none());
        assert!(!state.clients_by_agent.get(&id).unwrap().contains("c1"));
    }

    #[test]
    fn attach_and_detach_notify_bound_clients() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        let (ctx, mut crx) = peer();
        state.bind_client("c1", ctx, &id);

        let (atx, _arx) = peer();
        state.attach_agent_socket(&id, "conn1", atx);
        assert_eq!(
            frame(&mut crx),
            Frame::AgentOnline {
                agent_id: id.clone()
            }
        );

        state.detach_agent_socket(&id, "conn1");
        assert_eq!(
            frame(&mut crx),
            Frame::AgentOffline {
                agent_id: id.clone()
            }
        );
    }

    #[test]
    fn status_and_heartbeat_update_record() {
        let state = AppState::new();
        let (id, _) = state.register_agent("a");

        assert!(state.agents.get(&id).unwrap().last_heartbeat.is_none());
        state.record_heartbeat(&id);
        assert!(state.agents.get(&id).unwrap().last_heartbeat.is_some());

        state.record_status(&id, true);
        assert_eq!(state.agents.get(&id).unwrap().child_alive, Some(true));
    }
}

//! # Protocol Frames
//!
//! Defines every message exchanged between agents, the relay server, and
//! browser clients. Frames are serialized as JSON text using serde's
//! internally-tagged representation (`"type": "..."` field).

use serde::{Deserialize, Serialize};

/// All frames in the termlink protocol.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field whose value is the snake_case
/// variant name. For example, `Frame::AgentOnline` serializes to
/// `{"type": "agent_online", "agent_id": "..."}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // ── Agent → Relay ─────────────────────────────────────────────

    /// Application-level keepalive, sent by the agent every 30 seconds.
    Heartbeat,

    /// A chunk of decoded terminal output produced by the child process.
    /// Fanned out by the relay to every client bound to the agent.
    Output { data: String },

    /// Agent-side status report. The relay records `child_alive` on the
    /// agent record; clients never see this frame.
    Status { child_alive: bool },

    // ── Relay → Agent ─────────────────────────────────────────────

    /// Acknowledges a `Heartbeat`.
    HeartbeatAck,

    /// Raw keystroke bytes destined for the child's stdin.
    ///
    /// Sent by a client without `client_id`; the relay enriches the frame
    /// with the originating client's id before forwarding to the agent.
    Input {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Terminal window-size change, forwarded along the same path as
    /// `Input` (client → relay → agent).
    Resize { rows: u16, cols: u16 },

    // ── Relay → Client ────────────────────────────────────────────

    /// Sent once when a client successfully binds to an agent.
    Connected {
        client_id: String,
        agent_id: String,
        agent_online: bool,
    },

    /// The bound agent attached a live socket.
    AgentOnline { agent_id: String },

    /// The bound agent's socket went away.
    AgentOffline { agent_id: String },

    // ── Heartbeat (client side) ───────────────────────────────────

    /// Client-side keepalive request.
    Ping,

    /// Answer to `Ping`.
    Pong,

    // ── Error ─────────────────────────────────────────────────────

    /// Error notification with a human-readable message. Sent by the relay
    /// to clients (e.g. "Agent is offline") and by the agent to the relay.
    Error { message: String },
}

/// Every `type` value the protocol knows. Used by [`decode`] to tell a
/// frame of an unknown type (ignored) apart from a known type with
/// missing or mistyped fields (protocol error, closes the peer).
const KNOWN_TYPES: &[&str] = &[
    "heartbeat",
    "output",
    "status",
    "heartbeat_ack",
    "input",
    "resize",
    "connected",
    "agent_online",
    "agent_offline",
    "ping",
    "pong",
    "error",
];

/// Classification of an incoming text frame.
#[derive(Debug)]
pub enum Decoded {
    /// Well-formed frame of a known type.
    Frame(Frame),
    /// Valid JSON object whose `type` is a string the protocol does not
    /// know. Per protocol rules the receiver logs and ignores it.
    Unknown(String),
    /// Invalid JSON, missing `type`, or a known type with missing required
    /// fields. The receiver closes the offending peer.
    Malformed(String),
}

/// Decodes one inbound text frame into its protocol classification.
pub fn decode(text: &str) -> Decoded {
    let err = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => return Decoded::Frame(frame),
        Err(err) => err,
    };

    // Deserialization failed; figure out whether this is an unknown type
    // (tolerated) or a genuinely malformed frame (fatal for the peer).
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Decoded::Malformed(err.to_string());
    };
    match value.get("type").and_then(serde_json::Value::as_str) {
        Some(ty) if !KNOWN_TYPES.contains(&ty) => Decoded::Unknown(ty.to_owned()),
        Some(_) => Decoded::Malformed(err.to_string()),
        None => Decoded::Malformed("missing \"type\" field".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_frame_wire_shape() {
        let json = serde_json::to_string(&Frame::Output {
            data: "hello\n".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hello\n"}"#);
    }

    #[test]
    fn input_without_client_id_omits_field() {
        let json = serde_json::to_string(&Frame::Input {
            data: "x".into(),
            client_id: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"input","data":"x"}"#);
    }

    #[test]
    fn input_enriched_with_client_id_round_trips() {
        let frame = Frame::Input {
            data: "x".into(),
            client_id: Some("c1".into()),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"input","data":"x","client_id":"c1"}"#);
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn connected_frame_round_trips() {
        let frame = Frame::Connected {
            client_id: "c1".into(),
            agent_id: "A3F8-B2C1-7D2E".into(),
            agent_online: true,
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn unknown_type_is_tolerated() {
        match decode(r#"{"type":"telemetry","data":1}"#) {
            Decoded::Unknown(ty) => assert_eq!(ty, "telemetry"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(decode("{not json"), Decoded::Malformed(_)));
    }

    #[test]
    fn known_type_with_missing_field_is_malformed() {
        // "output" requires `data`
        assert!(matches!(
            decode(r#"{"type":"output"}"#),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(matches!(decode(r#"{"data":"x"}"#), Decoded::Malformed(_)));
    }

    #[test]
    fn extra_fields_do_not_reject_known_frames() {
        match decode(r#"{"type":"ping","since":123}"#) {
            Decoded::Frame(Frame::Ping) => {}
            other => panic!("expected Ping, got {other:?}"),
        }
    }
}

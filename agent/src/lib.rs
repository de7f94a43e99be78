//! # termlink Agent
//!
//! Hosts a coding-assistant CLI inside a pseudo-terminal and makes it
//! reachable from a phone or browser, either directly over HTTP/SSE or by
//! dialing into a public relay.
//!
//! ## Module Organization
//!
//! - [`pty`]  — the PTY session: spawn, output drain, input, resize, stop
//! - [`http`] — token-gated HTTP surface (terminal page, SSE, input, resize)
//! - [`link`] — outbound WebSocket connection to the relay, with reconnect

pub mod http;
pub mod link;
pub mod pty;

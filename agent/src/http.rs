//! # Agent HTTP Surface
//!
//! Exposes the PTY session on a local port, gated by the process access
//! token. A browser presents the token as a query parameter on first
//! contact and receives an http-only cookie good for 24 hours; after that
//! the cookie alone is accepted. `/health` is the only unauthenticated
//! route.

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::debug;

use termlink_protocol::auth::constant_time_eq;

use crate::pty::{OutputEvent, PtySession};

/// Cookie under which the access token is stored after the first visit.
const TOKEN_COOKIE: &str = "termlink_token";

/// Cookie lifetime in seconds (24 hours).
const TOKEN_COOKIE_MAX_AGE: u32 = 86_400;

/// How long the SSE loop waits for output before emitting a heartbeat
/// event to keep intermediate proxies from dropping the stream.
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Window-size bounds accepted by `/resize`.
const MIN_DIM: u16 = 1;
const MAX_DIM: u16 = 1000;

/// Shared state behind every agent HTTP handler.
#[derive(Clone)]
pub struct HttpState {
    pub session: Arc<PtySession>,
    pub token: Arc<String>,
    pub sse_connections: Arc<AtomicUsize>,
    /// Cancelled on shutdown; every active SSE stream ends before the PTY
    /// is torn down.
    pub shutdown: CancellationToken,
}

impl HttpState {
    pub fn new(session: Arc<PtySession>, token: String, shutdown: CancellationToken) -> Self {
        Self {
            session,
            token: Arc::new(token),
            sse_connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }
}

/// Builds the agent router: token-gated terminal surface plus the open
/// health probe.
pub fn router(state: HttpState) -> Router {
    let protected = Router::new()
        .route("/", get(index))
        .route("/sse", get(sse))
        .route("/input", post(input))
        .route("/resize", post(resize))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ));

    Router::new()
        .merge(protected)
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Token Auth ─────────────────────────────────────────────────

fn token_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

fn token_from_cookies(cookies: &str) -> Option<&str> {
    let prefix = format!("{TOKEN_COOKIE}=");
    cookies
        .split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix(prefix.as_str()))
}

/// Middleware over every non-health route. Accepts the token from the
/// `token` query parameter or the session cookie; a valid query token is
/// answered with a `Set-Cookie` so later requests can omit it.
async fn require_token(State(state): State<HttpState>, req: Request, next: Next) -> Response {
    let expected = state.token.as_bytes();

    let query_token = req
        .uri()
        .query()
        .and_then(token_from_query)
        .map(str::to_owned);
    let cookie_token = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(token_from_cookies)
        .map(str::to_owned);

    let via_query = matches!(&query_token, Some(t) if constant_time_eq(t.as_bytes(), expected));
    let via_cookie = matches!(&cookie_token, Some(t) if constant_time_eq(t.as_bytes(), expected));

    if !via_query && !via_cookie {
        debug!("Rejected request to {} without valid token", req.uri().path());
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let mut response = next.run(req).await;
    if via_query && !via_cookie {
        let cookie = format!(
            "{TOKEN_COOKIE}={}; HttpOnly; SameSite=Lax; Max-Age={TOKEN_COOKIE_MAX_AGE}; Path=/",
            state.token
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

// ─── Handlers ───────────────────────────────────────────────────

/// `GET /` — the terminal page shell. The real emulator asset ships with
/// the launcher; this bundled page is enough to drive the endpoints.
async fn index() -> Html<&'static str> {
    Html(include_str!("../assets/terminal.html"))
}

/// Counts an SSE stream for `/health` and releases it when the stream is
/// dropped, however it ends.
struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `GET /sse` — server-sent events carrying terminal output.
///
/// Each dequeued chunk becomes `{"type":"output","data":…}`; a quiet
/// 30-second window produces `{"type":"heartbeat"}`. The stream ends when
/// the session stops or shutdown is requested.
async fn sse(State(state): State<HttpState>) -> impl IntoResponse {
    let mut output = state.session.subscribe();
    let shutdown = state.shutdown.clone();

    state.sse_connections.fetch_add(1, Ordering::SeqCst);
    let guard = StreamGuard(state.sse_connections.clone());

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => None,
                event = output.next_output(SSE_IDLE_TIMEOUT) => Some(event),
            };
            match event {
                Some(OutputEvent::Chunk(data)) => {
                    let payload = json!({"type": "output", "data": data});
                    yield Ok::<Event, Infallible>(Event::default().data(payload.to_string()));
                }
                Some(OutputEvent::Timeout) => {
                    yield Ok(Event::default().data(r#"{"type":"heartbeat"}"#));
                }
                Some(OutputEvent::Stopped) | None => break,
            }
        }
    };

    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    (headers, Sse::new(stream))
}

#[derive(Deserialize)]
struct InputBody {
    data: String,
}

/// `POST /input` — raw keystrokes for the child's stdin.
async fn input(State(state): State<HttpState>, Json(body): Json<InputBody>) -> Json<serde_json::Value> {
    state.session.write_input(body.data.as_bytes()).await;
    Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct ResizeBody {
    rows: u16,
    cols: u16,
}

fn clamp_dim(v: u16) -> u16 {
    v.clamp(MIN_DIM, MAX_DIM)
}

/// `POST /resize` — window-size update, clamped to sane bounds.
async fn resize(State(state): State<HttpState>, Json(body): Json<ResizeBody>) -> Json<serde_json::Value> {
    state
        .session
        .resize(clamp_dim(body.rows), clamp_dim(body.cols))
        .await;
    Json(json!({"status": "ok"}))
}

/// `GET /health` — unauthenticated liveness probe.
async fn health(State(state): State<HttpState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "child_alive": state.session.child_alive().await,
        "sse_connections": state.sse_connections.load(Ordering::SeqCst),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_window_dimensions() {
        assert_eq!(clamp_dim(0), 1);
        assert_eq!(clamp_dim(24), 24);
        assert_eq!(clamp_dim(5000), 1000);
    }

    #[test]
    fn extracts_token_from_query() {
        assert_eq!(token_from_query("token=abc"), Some("abc"));
        assert_eq!(token_from_query("a=1&token=abc&b=2"), Some("abc"));
        assert_eq!(token_from_query("a=1"), None);
    }

    #[test]
    fn extracts_token_from_cookie_header() {
        assert_eq!(
            token_from_cookies("termlink_token=abc"),
            Some("abc")
        );
        assert_eq!(
            token_from_cookies("other=1; termlink_token=abc; x=2"),
            Some("abc")
        );
        assert_eq!(token_from_cookies("other=1"), None);
    }
}

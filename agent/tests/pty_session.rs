//! End-to-end PTY session tests against a real child process.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use termlink_agent::pty::{OutputEvent, PtySession, SessionState};

const CAT: &str = "/bin/cat";

/// Collects output until `needle` shows up or the deadline passes.
async fn wait_for_output(
    stream: &mut termlink_agent::pty::OutputStream,
    needle: &str,
    deadline: Duration,
) -> String {
    let mut collected = String::new();
    let result = tokio::time::timeout(deadline, async {
        loop {
            match stream.next_output(Duration::from_millis(500)).await {
                OutputEvent::Chunk(chunk) => {
                    collected.push_str(&chunk);
                    if collected.contains(needle) {
                        break;
                    }
                }
                OutputEvent::Timeout => {}
                OutputEvent::Stopped => break,
            }
        }
    })
    .await;
    assert!(
        result.is_ok() && collected.contains(needle),
        "expected {needle:?} in output, got {collected:?}"
    );
    collected
}

#[tokio::test]
async fn input_round_trips_through_the_child() {
    let workspace = tempfile::tempdir().unwrap();
    let session = Arc::new(PtySession::new(
        workspace.path().to_path_buf(),
        PathBuf::from(CAT),
    ));

    let mut stream = session.subscribe();
    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.child_alive().await);

    session.write_input(b"hello\n").await;
    // cat echoes the line back (the PTY echoes it once more on the way in).
    wait_for_output(&mut stream, "hello", Duration::from_secs(10)).await;

    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.child_alive().await);
}

#[tokio::test]
async fn resize_while_running_is_accepted() {
    let workspace = tempfile::tempdir().unwrap();
    let session = PtySession::new(workspace.path().to_path_buf(), PathBuf::from(CAT));

    session.start().await.unwrap();
    session.resize(40, 120).await;
    session.resize(1, 1000).await;
    assert!(session.child_alive().await);

    session.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let workspace = tempfile::tempdir().unwrap();
    let session = PtySession::new(workspace.path().to_path_buf(), PathBuf::from(CAT));

    session.start().await.unwrap();
    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);

    // A second stop is a no-op and must not panic.
    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn subscribers_observe_termination_after_stop() {
    let workspace = tempfile::tempdir().unwrap();
    let session = PtySession::new(workspace.path().to_path_buf(), PathBuf::from(CAT));

    session.start().await.unwrap();
    let mut stream = session.subscribe();
    session.stop().await;

    // Whatever was queued drains first; then the stream reports the end.
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next_output(Duration::from_millis(200)).await {
                OutputEvent::Stopped => break,
                OutputEvent::Chunk(_) | OutputEvent::Timeout => {}
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "stream never reported termination");

    // Input after stop is silently ignored.
    session.write_input(b"too late\n").await;
}

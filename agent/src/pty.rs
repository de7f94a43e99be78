//! # PTY Session
//!
//! Encapsulates one interactive child process and its pseudo-terminal so
//! the rest of the agent sees a simple interface: a stream of decoded
//! output chunks, an input sink, a resize command, and `stop()`.
//!
//! A dedicated blocking task drains the PTY master in 4 KiB reads and
//! publishes decoded chunks on a bounded broadcast channel. Every consumer
//! (SSE stream, relay link) subscribes independently; a consumer that
//! falls more than the channel capacity behind loses the oldest frames,
//! which keeps memory bounded while terminals tolerate the gap.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Capacity of the output queue, in frames. Overflow drops the oldest.
pub const OUTPUT_QUEUE_FRAMES: usize = 1000;

/// Maximum bytes per PTY read.
const READ_CHUNK: usize = 4096;

/// How long `stop()` waits for the child to exit after SIGTERM before
/// escalating to a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Initial window size handed to the child at spawn.
const START_ROWS: u16 = 24;
const START_COLS: u16 = 80;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The child binary was not found or exec failed.
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    /// `start()` was called on a session that already left `New`.
    #[error("session already started")]
    AlreadyStarted,
}

/// Lifecycle states. Transitions only move forward; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
        }
    }
}

/// One event from a session's output stream.
#[derive(Debug)]
pub enum OutputEvent {
    /// The next decoded UTF-8 chunk.
    Chunk(String),
    /// No output arrived within the caller's wait window.
    Timeout,
    /// The session has stopped and every queued chunk has been drained.
    Stopped,
}

/// A consumer's handle onto the session output queue.
pub struct OutputStream {
    rx: broadcast::Receiver<String>,
    overflow: Arc<AtomicU64>,
}

impl OutputStream {
    /// Yields the next chunk, or [`OutputEvent::Timeout`] after `wait`.
    ///
    /// A lagged receiver silently skips the dropped frames (counted on the
    /// session's overflow counter) and returns the oldest retained chunk.
    pub async fn next_output(&mut self, wait: Duration) -> OutputEvent {
        loop {
            match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Ok(chunk)) => return OutputEvent::Chunk(chunk),
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    self.overflow.fetch_add(n, Ordering::Relaxed);
                    warn!("Output queue overflow; dropped {} frames", n);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return OutputEvent::Stopped,
                Err(_) => return OutputEvent::Timeout,
            }
        }
    }
}

/// Everything owned exclusively by the session: the PTY master, its
/// writer, and the child handle. `stop()` is the only path that takes
/// this out, which is what makes "master closed exactly once" hold.
struct Inner {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

/// One interactive child process and its controlling pseudo-terminal.
pub struct PtySession {
    workspace: PathBuf,
    command_path: PathBuf,
    inner: Arc<Mutex<Option<Inner>>>,
    output_tx: Arc<StdMutex<Option<broadcast::Sender<String>>>>,
    state: Arc<AtomicU8>,
    overflow: Arc<AtomicU64>,
}

impl PtySession {
    /// Creates a session that will launch `command_path` with `workspace`
    /// as its working directory. Nothing is spawned until [`start`].
    ///
    /// [`start`]: PtySession::start
    pub fn new(workspace: PathBuf, command_path: PathBuf) -> Self {
        let (tx, _) = broadcast::channel(OUTPUT_QUEUE_FRAMES);
        Self {
            workspace,
            command_path,
            inner: Arc::new(Mutex::new(None)),
            output_tx: Arc::new(StdMutex::new(Some(tx))),
            state: Arc::new(AtomicU8::new(SessionState::New.as_u8())),
            overflow: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Total output frames dropped to queue overflow.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Launches the child with the PTY slave as its stdin/stdout/stderr,
    /// in its own session, with `TERM=xterm-256color` and the starting
    /// window size, then starts the output drain task.
    pub async fn start(&self) -> Result<(), SessionError> {
        let from = SessionState::New.as_u8();
        let to = SessionState::Starting.as_u8();
        if self
            .state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyStarted);
        }

        let workspace = self.workspace.clone();
        let command_path = self.command_path.clone();

        // portable-pty is synchronous; open and spawn on a blocking thread.
        let spawned = tokio::task::spawn_blocking(move || {
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize {
                    rows: START_ROWS,
                    cols: START_COLS,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

            let mut cmd = CommandBuilder::new(&command_path);
            cmd.cwd(&workspace);
            cmd.env("TERM", "xterm-256color");

            let child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

            // The writer can only be taken once; the reader clone feeds the
            // drain task.
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

            Ok::<_, SessionError>((pair.master, writer, child, reader))
        })
        .await
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
        .and_then(|res| res);

        let (master, writer, child, reader) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                self.set_state(SessionState::Stopped);
                return Err(e);
            }
        };

        let pid = child.process_id();
        *self.inner.lock().await = Some(Inner {
            master,
            writer,
            child,
        });
        self.set_state(SessionState::Running);
        info!(
            "Spawned {} (pid {:?}) in {}",
            self.command_path.display(),
            pid,
            self.workspace.display()
        );

        self.spawn_drain(reader);
        Ok(())
    }

    /// The drain task: single reader of the PTY master. Publishes decoded
    /// chunks until EOF or an I/O error, then marks the session stopped
    /// and closes the output channel so consumers observe termination
    /// after draining what is queued.
    fn spawn_drain(&self, mut reader: Box<dyn Read + Send>) {
        let tx = {
            let guard = self.output_tx.lock().expect("output sender lock poisoned");
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return,
            }
        };
        let state = self.state.clone();
        let output_slot = self.output_tx.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        // Err here only means no live subscriber; the chunk
                        // is dropped, which is fine for a live stream.
                        let _ = tx.send(chunk);
                    }
                    Err(e) => {
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }

            state.store(SessionState::Stopped.as_u8(), Ordering::SeqCst);
            output_slot
                .lock()
                .expect("output sender lock poisoned")
                .take();
            drop(tx);
        });
    }

    /// Subscribes to the output queue. A subscriber only observes chunks
    /// produced after it subscribes.
    pub fn subscribe(&self) -> OutputStream {
        let rx = {
            let guard = self.output_tx.lock().expect("output sender lock poisoned");
            match guard.as_ref() {
                Some(tx) => tx.subscribe(),
                None => {
                    // Session already stopped: hand out a receiver that
                    // reports closure immediately.
                    let (tx, rx) = broadcast::channel(1);
                    drop(tx);
                    rx
                }
            }
        };
        OutputStream {
            rx,
            overflow: self.overflow.clone(),
        }
    }

    /// Pushes raw bytes (escape sequences included) to the child's input.
    /// Silently does nothing once the session is stopped.
    pub async fn write_input(&self, bytes: &[u8]) {
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.as_mut() {
            if let Err(e) = inner
                .writer
                .write_all(bytes)
                .and_then(|()| inner.writer.flush())
            {
                debug!("Input write ignored: {}", e);
            }
        }
    }

    /// Updates the window size on the PTY master. Ignored once stopped.
    pub async fn resize(&self, rows: u16, cols: u16) {
        let guard = self.inner.lock().await;
        if let Some(inner) = guard.as_ref() {
            let _ = inner.master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    }

    /// Whether the child process is still running.
    pub async fn child_alive(&self) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(inner) => matches!(inner.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Tears the session down: graceful SIGTERM, a 1 s grace window, then
    /// forced kill; the master endpoint is closed exactly once afterwards,
    /// which unblocks the drain task. Idempotent; a second call is a no-op.
    pub async fn stop(&self) {
        // Taking `inner` is the idempotence gate: only the first caller
        // gets to touch the child or the master.
        let taken = self.inner.lock().await.take();
        if let Some(inner) = taken {
            self.set_state(SessionState::Stopping);
            Self::reap(inner).await;
        }

        // Close the output channel so subscribers past the queued frames
        // observe termination even if the session never started or the
        // drain is already gone.
        self.output_tx
            .lock()
            .expect("output sender lock poisoned")
            .take();
        self.set_state(SessionState::Stopped);
    }

    /// Terminates and reaps the child, then closes the master endpoint.
    async fn reap(inner: Inner) {
        tokio::task::spawn_blocking(move || {
            let mut inner = inner;
            if let Some(pid) = inner.child.process_id() {
                // SAFETY: signalling a pid we spawned and have not reaped.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }

            let deadline = Instant::now() + STOP_GRACE;
            loop {
                match inner.child.try_wait() {
                    Ok(Some(status)) => {
                        info!("Child exited: {:?}", status);
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    _ => {
                        warn!("Child did not exit within grace; killing");
                        let _ = inner.child.kill();
                        let _ = inner.child.wait();
                        break;
                    }
                }
            }

            // Dropping `inner` closes the master endpoint; the drain task
            // observes EOF.
            drop(inner);
        })
        .await
        .ok();
    }
}

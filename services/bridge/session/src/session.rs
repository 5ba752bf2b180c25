//! Core session management for bridge connections.
//!
//! A session owns one established stream. Its task drives the write half
//! (queued frames) and the read half (inbound frames) side by side and
//! reports an unsolicited drop exactly once.

use bytes::{Bytes, BytesMut};
use bridge_wire::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::IoStream;
use crate::SessionError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for a bridge session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
    /// Initial capacity of the read buffer
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Timestamp of last received frame
    pub last_frame_in: Option<Instant>,
    /// Timestamp of last sent frame
    pub last_frame_out: Option<Instant>,
    /// Number of frames received
    pub frames_received: u64,
    /// Number of frames sent
    pub frames_sent: u64,
}

/// Events emitted by sessions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A complete frame arrived from the peer
    Frame(Frame),
    /// The stream dropped without a local close
    ///
    /// Emitted at most once per session and never after [`SessionHandle::close`].
    Disconnected {
        /// Why the session ended
        reason: String,
    },
}

/// Handle to a running session
///
/// Cloning the handle does not duplicate the session; every clone controls
/// the same stream.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: CancellationToken,
    done: CancellationToken,
    stats: Arc<Mutex<SessionStats>>,
    max_frame_size: usize,
}

impl SessionHandle {
    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for sending
    ///
    /// Frames are written in the order they are queued.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let bytes = frame.encode(self.max_frame_size)?;
        self.outbound.send(bytes).map_err(|_| SessionError::Closed)
    }

    /// Whether the session has stopped or is stopping
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.done.is_cancelled()
    }

    /// Close the session and wait for its task to finish
    ///
    /// Frames queued before the call are flushed first. No
    /// [`SessionEvent::Disconnected`] is emitted for a local close.
    pub async fn close(&self) {
        self.shutdown();
        self.done.cancelled().await;
    }

    /// Request a close without waiting for it
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the session has ended for any reason
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Snapshot of the session statistics
    pub fn stats(&self) -> SessionStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// How the session loop ended
enum Exit {
    Local,
    Lost(String),
}

/// Main session implementation
pub struct Session;

impl Session {
    /// Spawn the session task for an established stream
    pub fn spawn(
        stream: IoStream,
        config: SessionConfig,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            outbound: outbound_tx,
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            stats: Arc::new(Mutex::new(SessionStats::default())),
            max_frame_size: config.max_frame_size,
        };

        let task_handle = handle.clone();
        tokio::spawn(async move {
            let id = task_handle.id;
            debug!("Session {} started", id);

            let exit = Self::run(stream, &config, &task_handle, outbound_rx, &event_tx).await;
            match exit {
                Exit::Local => debug!("Session {} closed locally", id),
                Exit::Lost(reason) => {
                    debug!("Session {} lost: {}", id, reason);
                    // Suppressed when a close raced the drop
                    if !task_handle.shutdown.is_cancelled() {
                        let _ = event_tx.send(SessionEvent::Disconnected { reason });
                    }
                }
            }
            task_handle.done.cancel();
        });

        handle
    }

    async fn run(
        stream: IoStream,
        config: &SessionConfig,
        handle: &SessionHandle,
        outbound_rx: mpsc::UnboundedReceiver<Bytes>,
        event_tx: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Exit {
        // Both halves progress independently so a blocked write never stops reads
        let (reader, writer) = tokio::io::split(stream);
        tokio::select! {
            exit = Self::write_loop(writer, handle, outbound_rx) => exit,
            exit = Self::read_loop(reader, config, handle, event_tx) => exit,
        }
    }

    async fn write_loop(
        mut writer: WriteHalf<IoStream>,
        handle: &SessionHandle,
        mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Exit {
        loop {
            tokio::select! {
                biased;

                _ = handle.shutdown.cancelled() => {
                    // Flush what was queued before the close
                    while let Ok(bytes) = outbound_rx.try_recv() {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                        handle.record_out(bytes.len());
                    }
                    let _ = writer.shutdown().await;
                    return Exit::Local;
                }

                outbound = outbound_rx.recv() => {
                    let Some(bytes) = outbound else {
                        return Exit::Local;
                    };
                    if let Err(e) = writer.write_all(&bytes).await {
                        return Exit::Lost(format!("write failed: {}", e));
                    }
                    handle.record_out(bytes.len());
                    trace!("Session {} sent {} bytes", handle.id, bytes.len());
                }
            }
        }
    }

    async fn read_loop(
        mut reader: ReadHalf<IoStream>,
        config: &SessionConfig,
        handle: &SessionHandle,
        event_tx: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Exit {
        let mut decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
        let mut read_buffer = BytesMut::with_capacity(config.read_buffer_size);

        loop {
            match reader.read_buf(&mut read_buffer).await {
                Ok(0) => return Exit::Lost("peer closed the stream".to_string()),
                Ok(n) => {
                    trace!("Session {} read {} bytes, buffer now has {} bytes", handle.id, n, read_buffer.len());
                    loop {
                        match decoder.decode(&mut read_buffer) {
                            Ok(Some(frame)) => {
                                handle.record_in(frame.encoded_size());
                                if event_tx.send(SessionEvent::Frame(frame)).is_err() {
                                    return Exit::Local;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Session {} received a malformed frame: {}", handle.id, e);
                                return Exit::Lost(format!("protocol error: {}", e));
                            }
                        }
                    }
                }
                Err(e) => return Exit::Lost(format!("read failed: {}", e)),
            }
        }
    }
}

impl SessionHandle {
    fn with_stats(&self, f: impl FnOnce(&mut SessionStats)) {
        match self.stats.lock() {
            Ok(mut stats) => f(&mut stats),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn record_out(&self, len: usize) {
        self.with_stats(|stats| {
            stats.bytes_out += len as u64;
            stats.frames_sent += 1;
            stats.last_frame_out = Some(Instant::now());
        });
    }

    fn record_in(&self, len: usize) {
        self.with_stats(|stats| {
            stats.bytes_in += len as u64;
            stats.frames_received += 1;
            stats.last_frame_in = Some(Instant::now());
        });
    }
}

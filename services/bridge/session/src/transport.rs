//! Local pipe transport for bridge sessions.
//!
//! This module provides the addressable inter-process channel the bridge runs
//! over: Unix domain sockets on Unix, named pipes on Windows, and an
//! in-memory transport built on `tokio::io::duplex` for tests and
//! single-process setups.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::SessionError;

/// Delay between attempts while the pipe does not exist or is busy
const PIPE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Buffer size of each direction of an in-memory stream
const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

/// Address of a named local pipe: a server qualifier plus a channel name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeAddress {
    /// Server qualifier, `.` for the local machine
    pub server: String,
    /// Pipe name
    pub name: String,
}

impl PipeAddress {
    /// Address a pipe on a given server
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
        }
    }

    /// Address a pipe on the local machine
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(".", name)
    }

    /// Check that the pipe name is a single path component
    ///
    /// Names end up inside a filesystem path (the socket file on Unix) or a
    /// pipe path on Windows, so separators and dot segments are rejected.
    pub fn validate(&self) -> io::Result<()> {
        let name = self.name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid pipe name {:?}", self.name),
            ));
        }
        Ok(())
    }

    /// Filesystem path of the Unix domain socket backing this pipe
    ///
    /// The socket always lives directly inside the temp directory.
    #[cfg(unix)]
    pub fn socket_path(&self) -> io::Result<std::path::PathBuf> {
        self.validate()?;
        Ok(std::env::temp_dir().join(format!("{}.sock", self.name)))
    }

    /// Windows named pipe path (`\\server\pipe\name`)
    pub fn pipe_path(&self) -> String {
        format!(r"\\{}\pipe\{}", self.server, self.name)
    }
}

impl fmt::Display for PipeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pipe_path())
    }
}

/// Unified stream type over every supported transport
pub enum IoStream {
    /// Unix domain socket
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    /// Client end of a Windows named pipe
    #[cfg(windows)]
    PipeClient(tokio::net::windows::named_pipe::NamedPipeClient),
    /// Server end of a Windows named pipe
    #[cfg(windows)]
    PipeServer(tokio::net::windows::named_pipe::NamedPipeServer),
    /// In-memory stream
    Memory(DuplexStream),
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            #[cfg(unix)]
            IoStream::Unix(_) => "Unix",
            #[cfg(windows)]
            IoStream::PipeClient(_) => "PipeClient",
            #[cfg(windows)]
            IoStream::PipeServer(_) => "PipeServer",
            IoStream::Memory(_) => "Memory",
        };
        f.debug_tuple("IoStream").field(&kind).finish()
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(windows)]
            IoStream::PipeClient(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(windows)]
            IoStream::PipeServer(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(windows)]
            IoStream::PipeClient(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(windows)]
            IoStream::PipeServer(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(windows)]
            IoStream::PipeClient(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(windows)]
            IoStream::PipeServer(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Memory(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            #[cfg(unix)]
            IoStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(windows)]
            IoStream::PipeClient(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(windows)]
            IoStream::PipeServer(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Opens client streams to a pipe address
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a stream to `address`
    ///
    /// Implementations may wait for the pipe to appear; callers bound the
    /// attempt with [`open_stream`].
    async fn connect(&self, address: &PipeAddress) -> io::Result<IoStream>;
}

/// Accepts server streams on a bound pipe
#[async_trait]
pub trait Listener: Send + 'static {
    /// Address the listener is bound to
    fn address(&self) -> &PipeAddress;

    /// Wait for the next client
    async fn accept(&mut self) -> io::Result<IoStream>;
}

/// Open a stream bounded by `timeout` and `cancel`
pub async fn open_stream(
    connector: &dyn Connector,
    address: &PipeAddress,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<IoStream, SessionError> {
    debug!("Opening pipe {} (timeout {:?})", address, timeout);

    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(SessionError::Cancelled),

        result = tokio::time::timeout(timeout, connector.connect(address)) => match result {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(SessionError::Connect {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(SessionError::Timeout(timeout)),
        },
    }
}

fn is_pipe_unavailable(err: &io::Error) -> bool {
    // ERROR_PIPE_BUSY (231) when every Windows pipe instance is in use
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    ) || err.raw_os_error() == Some(231)
}

/// Connector for local pipes
///
/// Keeps retrying while the pipe is missing or busy, so a client started
/// before its server connects as soon as the server binds.
#[derive(Debug, Clone, Default)]
pub struct LocalConnector {
    _priv: (),
}

impl LocalConnector {
    /// Create a new local connector
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(unix)]
    async fn connect_once(&self, address: &PipeAddress) -> io::Result<IoStream> {
        let stream = tokio::net::UnixStream::connect(address.socket_path()?).await?;
        Ok(IoStream::Unix(stream))
    }

    #[cfg(windows)]
    async fn connect_once(&self, address: &PipeAddress) -> io::Result<IoStream> {
        address.validate()?;
        let client = tokio::net::windows::named_pipe::ClientOptions::new().open(address.pipe_path())?;
        Ok(IoStream::PipeClient(client))
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, address: &PipeAddress) -> io::Result<IoStream> {
        loop {
            match self.connect_once(address).await {
                Ok(stream) => return Ok(stream),
                Err(e) if is_pipe_unavailable(&e) => {
                    trace!("Pipe {} unavailable ({}), retrying", address, e);
                    tokio::time::sleep(PIPE_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Listener for local pipes
pub struct LocalListener {
    address: PipeAddress,
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(windows)]
    next_server: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl LocalListener {
    /// Bind the pipe at `address`
    ///
    /// On Unix a stale socket file left by a crashed server is replaced.
    #[cfg(unix)]
    pub fn bind(address: PipeAddress) -> io::Result<Self> {
        let path = address.socket_path()?;
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let inner = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { address, inner })
    }

    /// Bind the pipe at `address`
    #[cfg(windows)]
    pub fn bind(address: PipeAddress) -> io::Result<Self> {
        address.validate()?;
        let next_server =
            tokio::net::windows::named_pipe::ServerOptions::new().create(address.pipe_path())?;
        Ok(Self {
            address,
            next_server,
        })
    }
}

#[async_trait]
impl Listener for LocalListener {
    fn address(&self) -> &PipeAddress {
        &self.address
    }

    #[cfg(unix)]
    async fn accept(&mut self) -> io::Result<IoStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(IoStream::Unix(stream))
    }

    #[cfg(windows)]
    async fn accept(&mut self) -> io::Result<IoStream> {
        self.next_server.connect().await?;
        // A fresh instance must exist before handing out the connected one
        let next =
            tokio::net::windows::named_pipe::ServerOptions::new().create(self.address.pipe_path())?;
        let connected = std::mem::replace(&mut self.next_server, next);
        Ok(IoStream::PipeServer(connected))
    }
}

#[cfg(unix)]
impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Ok(path) = self.address.socket_path() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// In-memory pipe namespace
///
/// Listeners bound on a network are reachable by connectors of the same
/// network only.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<PipeAddress, mpsc::UnboundedSender<DuplexStream>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listener at `address`
    pub fn bind(&self, address: PipeAddress) -> io::Result<MemoryListener> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.listeners.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("pipe {} already bound", address),
                    ));
                }
                entry.insert(tx);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        Ok(MemoryListener {
            address,
            incoming: rx,
            network: self.clone(),
        })
    }

    /// Connector dialing listeners of this network
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }
}

/// Connector for an in-memory network
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &PipeAddress) -> io::Result<IoStream> {
        let refused = || {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no listener on {}", address),
            )
        };

        let listener = self
            .network
            .listeners
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(refused)?;

        let (client, server) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        listener.send(server).map_err(|_| refused())?;
        Ok(IoStream::Memory(client))
    }
}

/// Listener bound on an in-memory network
#[derive(Debug)]
pub struct MemoryListener {
    address: PipeAddress,
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    network: MemoryNetwork,
}

#[async_trait]
impl Listener for MemoryListener {
    fn address(&self) -> &PipeAddress {
        &self.address
    }

    async fn accept(&mut self) -> io::Result<IoStream> {
        match self.incoming.recv().await {
            Some(stream) => Ok(IoStream::Memory(stream)),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "listener closed")),
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.listeners.remove(&self.address);
    }
}

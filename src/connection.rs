//! Stream connection to the module bus.
//!
//! A [`Connection`] owns the transport, the [`ModuleRegistry`] and the partial
//! line remainder. Responses are framed into lines, decoded with the wire codec
//! and routed to the registered module that owns them.
//!
//! # Dispatch modes
//!
//! - [`DispatchMode::Polling`] (default): callers drive the transport.
//!   [`Connection::receive`] performs one read and dispatches what it got; the
//!   module layer loops on it inside `wait_updated`.
//! - [`DispatchMode::EventDriven`]: [`Connection::spawn_event_loop`] moves the
//!   read side into a background task that reads and dispatches continuously.
//!   Responses also resolve the one-shot waiters in [`PendingRequests`].
//!
//! The write side is shared by both modes and guarded by an async mutex, so
//! several tasks may send through one connection.
//!
//! A read waiting on a silent bus holds the read side. [`Connection::close`]
//! cancels such reads through a shutdown token before it releases the
//! transport, so closing never waits for the bus to speak.

use crate::config::BusConfig;
use crate::error::{CtlabError, CtlabResult, DecodeError};
use crate::protocol::{self, LineAssembler};
use crate::registry::ModuleRegistry;
use crate::transport::{self, Connector, DynStream, TcpConnector};
use crate::waiters::PendingRequests;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport, initial and post-`close()` state
    Unconnected,
    /// Transport established
    Connected,
}

/// Who drives the read side of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Callers invoke `receive()`
    Polling,
    /// A background task reads and dispatches
    EventDriven,
}

impl DispatchMode {
    /// Lowercase name used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Polling => "polling",
            DispatchMode::EventDriven => "event-driven",
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Size of a single transport read
    pub buffer_size: usize,
    /// Treat "no data queued" as an empty read instead of waiting
    pub nonblocking: bool,
    /// Suggested timeout for event-driven queries
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            nonblocking: false,
            request_timeout: Duration::from_millis(2000),
        }
    }
}

impl From<&BusConfig> for ConnectionOptions {
    fn from(config: &BusConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            nonblocking: config.nonblocking,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

// =============================================================================
// Read side
// =============================================================================

enum Chunk {
    /// Non-blocking read found nothing queued
    Idle,
    /// Peer closed the stream
    Eof,
    /// Bytes read and the lines they completed
    Data(usize, Vec<String>),
}

struct InboundReader {
    half: ReadHalf<DynStream>,
    lines: LineAssembler,
    scratch: Vec<u8>,
}

impl InboundReader {
    fn new(half: ReadHalf<DynStream>, buffer_size: usize) -> Self {
        Self {
            half,
            lines: LineAssembler::with_capacity(buffer_size),
            scratch: vec![0u8; buffer_size.max(1)],
        }
    }

    async fn read_chunk(&mut self, nonblocking: bool) -> io::Result<Chunk> {
        let n = if nonblocking {
            match transport::read_available(&mut self.half, &mut self.scratch)? {
                Some(n) => n,
                None => return Ok(Chunk::Idle),
            }
        } else {
            self.half.read(&mut self.scratch).await?
        };

        if n == 0 {
            return Ok(Chunk::Eof);
        }
        let lines = self.lines.push(&self.scratch[..n]);
        Ok(Chunk::Data(n, lines))
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Connection to a bus gateway.
///
/// Always handled through `Arc<Connection>`; modules keep a clone.
pub struct Connection {
    connector: Box<dyn Connector>,
    options: ConnectionOptions,
    registry: ModuleRegistry,
    waiters: PendingRequests,
    writer: tokio::sync::Mutex<Option<WriteHalf<DynStream>>>,
    reader: tokio::sync::Mutex<Option<InboundReader>>,
    feed_lines: parking_lot::Mutex<LineAssembler>,
    state: parking_lot::Mutex<ConnectionState>,
    mode: parking_lot::Mutex<DispatchMode>,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: parking_lot::Mutex<CancellationToken>,
}

impl Connection {
    /// Create an unconnected connection using `connector` for the transport.
    pub fn new(connector: impl Connector + 'static, options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            connector: Box::new(connector),
            options,
            registry: ModuleRegistry::new(),
            waiters: PendingRequests::new(),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            feed_lines: parking_lot::Mutex::new(LineAssembler::default()),
            state: parking_lot::Mutex::new(ConnectionState::Unconnected),
            mode: parking_lot::Mutex::new(DispatchMode::Polling),
            event_loop: parking_lot::Mutex::new(None),
            shutdown: parking_lot::Mutex::new(CancellationToken::new()),
        })
    }

    /// Unconnected TCP connection with default options.
    pub fn tcp(host: impl Into<String>, port: u16) -> Arc<Self> {
        Self::new(TcpConnector::new(host, port), ConnectionOptions::default())
    }

    /// Unconnected TCP connection described by the `bus` configuration section.
    pub fn from_config(config: &BusConfig) -> Arc<Self> {
        Self::new(
            TcpConnector::new(config.host.clone(), config.port),
            ConnectionOptions::from(config),
        )
    }

    /// Establish the transport.
    ///
    /// Calling this on a connected instance is a no-op. On failure the state
    /// stays `Unconnected` and the transport error is returned.
    pub async fn connect(&self) -> CtlabResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let target = self.connector.describe();
        let stream = self.connector.open().await.map_err(|e| {
            warn!(peer = %target, error = %e, "Failed to connect to bus");
            e
        })?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.shutdown.lock() = CancellationToken::new();
        *self.reader.lock().await = Some(InboundReader::new(read_half, self.options.buffer_size));
        *self.writer.lock().await = Some(write_half);
        *self.state.lock() = ConnectionState::Connected;

        info!(
            peer = %target,
            nonblocking = self.options.nonblocking,
            "Connected to bus"
        );
        Ok(())
    }

    /// Encode and write one payload addressed to `module`.
    ///
    /// # Errors
    /// `NoConnection` when unconnected, `Io` when the write fails.
    pub async fn send(&self, module: u8, payload: &str) -> CtlabResult<()> {
        let line = protocol::encode(module, payload);

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CtlabError::NoConnection)?;
        writer.write_all(&line).await?;
        writer.flush().await?;

        trace!(module, payload, "Sent request");
        Ok(())
    }

    /// Perform at most one transport read and dispatch every completed line.
    ///
    /// Returns the number of bytes read. In non-blocking mode an idle transport
    /// yields `Ok(0)`. End-of-file closes the connection and is reported as
    /// `Io(UnexpectedEof)`.
    ///
    /// If a line fails to decode for its module, the remaining lines of the
    /// same read are still dispatched and the first failure is returned.
    pub async fn receive(&self) -> CtlabResult<usize> {
        self.require_mode(DispatchMode::Polling)?;

        let shutdown = self.shutdown_token();
        let chunk = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(CtlabError::NotConnected),
            chunk = self.next_chunk(self.options.nonblocking) => chunk?,
        };

        match chunk {
            Chunk::Idle => Ok(0),
            Chunk::Eof => {
                self.close().await;
                Err(CtlabError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "bus gateway closed the connection",
                )))
            }
            Chunk::Data(n, lines) => {
                trace!(bytes = n, lines = lines.len(), "Received");
                self.dispatch_lines(&lines)?;
                Ok(n)
            }
        }
    }

    async fn next_chunk(&self, nonblocking: bool) -> CtlabResult<Chunk> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CtlabError::NotConnected)?;
        Ok(reader.read_chunk(nonblocking).await?)
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    /// Read and dispatch everything queued right now, without waiting.
    ///
    /// Returns the number of bytes consumed.
    pub async fn drain(&self) -> CtlabResult<usize> {
        self.require_mode(DispatchMode::Polling)?;

        let shutdown = self.shutdown_token();
        let mut total = 0usize;
        let mut first_error = None;
        loop {
            let chunk = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Err(CtlabError::NotConnected),
                chunk = self.next_chunk(true) => chunk?,
            };
            match chunk {
                Chunk::Idle => break,
                Chunk::Eof => {
                    self.close().await;
                    break;
                }
                Chunk::Data(n, lines) => {
                    total += n;
                    if let Err(e) = self.dispatch_lines(&lines) {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Discard queued input without decoding it.
    ///
    /// Drops every byte the transport can deliver without waiting and the
    /// buffered partial line. Returns the number of bytes thrown away.
    pub async fn flush(&self) -> CtlabResult<usize> {
        self.require_mode(DispatchMode::Polling)?;

        let shutdown = self.shutdown_token();
        let mut guard = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(CtlabError::NoConnection),
            guard = self.reader.lock() => guard,
        };
        let reader = guard.as_mut().ok_or(CtlabError::NoConnection)?;
        let partial = reader.lines.pending_len();
        reader.lines.clear();
        let discarded = transport::discard_available(&mut reader.half) + partial;

        if discarded > 0 {
            debug!(bytes = discarded, "Flushed stale input");
        }
        Ok(discarded)
    }

    /// Release the transport and return to `Unconnected`.
    ///
    /// Idempotent. Stops the event loop, if any, and drops pending waiters,
    /// whose callers then fail with `NoConnection`. Reads blocked in
    /// `receive()` are cancelled first and fail with `NotConnected`.
    pub async fn close(&self) {
        self.shutdown.lock().cancel();

        let event_loop = self.event_loop.lock().take();
        if let Some(handle) = event_loop {
            handle.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Ignoring shutdown error");
            }
        }
        self.reader.lock().await.take();
        self.feed_lines.lock().clear();

        let dropped = self.waiters.clear();
        *self.mode.lock() = DispatchMode::Polling;
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Unconnected);

        if previous == ConnectionState::Connected {
            info!(
                peer = %self.connector.describe(),
                dropped_waiters = dropped,
                "Closed bus connection"
            );
        }
    }

    /// Hand the read side to a background task and switch to event-driven mode.
    ///
    /// # Errors
    /// `NotConnected` if there is no transport, `ModeMismatch` if the loop is
    /// already running.
    pub async fn spawn_event_loop(self: &Arc<Self>) -> CtlabResult<()> {
        self.require_mode(DispatchMode::Polling)?;
        let shutdown = self.shutdown_token();
        let taken = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            mut guard = self.reader.lock() => guard.take(),
        };
        let mut reader = taken.ok_or(CtlabError::NotConnected)?;
        *self.mode.lock() = DispatchMode::EventDriven;

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let chunk = reader.read_chunk(false).await;
                let Some(connection) = weak.upgrade() else {
                    break;
                };

                match chunk {
                    Ok(Chunk::Data(n, lines)) => {
                        trace!(bytes = n, lines = lines.len(), "Event loop received");
                        // Faults already reached the waiters and the log.
                        let _ = connection.dispatch_lines(&lines);
                    }
                    Ok(Chunk::Idle) => {}
                    Ok(Chunk::Eof) => {
                        info!("Bus gateway closed the connection");
                        connection.event_loop.lock().take();
                        connection.close().await;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Event loop read failed");
                        connection.event_loop.lock().take();
                        connection.close().await;
                        break;
                    }
                }
            }
        });

        *self.event_loop.lock() = Some(handle);
        debug!("Event loop started");
        Ok(())
    }

    /// Push bytes from an external reader through framing and dispatch.
    ///
    /// Works in either mode and keeps its own partial-line remainder. Returns
    /// the number of lines routed to a registered module.
    pub fn feed(&self, data: &[u8]) -> CtlabResult<usize> {
        let lines = self.feed_lines.lock().push(data);
        self.dispatch_lines(&lines)
    }

    /// Dispatch complete lines. Returns how many reached a registered module.
    fn dispatch_lines(&self, lines: &[String]) -> CtlabResult<usize> {
        let mut delivered = 0usize;
        let mut first_error: Option<DecodeError> = None;

        for line in lines {
            match self.dispatch_line(line) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(delivered),
        }
    }

    fn dispatch_line(&self, line: &str) -> Result<bool, DecodeError> {
        let Some(message) = protocol::decode(line) else {
            trace!(line, "Ignoring unrecognised line");
            return Ok(false);
        };
        let Some(module) = self.registry.get(message.module) else {
            trace!(module = message.module, "Ignoring line for unregistered module");
            return Ok(false);
        };

        let result = module.recv(
            message.channel,
            &message.value,
            message.comment.as_deref(),
        );
        if let Err(e) = &result {
            warn!(
                module = message.module,
                channel = message.channel,
                error = %e,
                "Module sent an invalid value"
            );
        }

        self.waiters
            .fulfil(message.module, message.channel, result.clone());
        result.map(|_| true)
    }

    /// Fail with `ModeMismatch` unless the connection is in `required` mode.
    pub fn require_mode(&self, required: DispatchMode) -> CtlabResult<()> {
        let actual = self.mode();
        if actual == required {
            Ok(())
        } else {
            Err(CtlabError::ModeMismatch {
                required: required.as_str(),
                actual: actual.as_str(),
            })
        }
    }

    /// Whether `connect()` succeeded and `close()` has not been called since.
    pub fn is_connected(&self) -> bool {
        *self.state.lock() == ConnectionState::Connected
    }

    /// Current connectivity state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Current dispatch mode.
    pub fn mode(&self) -> DispatchMode {
        *self.mode.lock()
    }

    /// Transport options.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Modules registered on this connection.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Outstanding event-driven requests.
    pub fn waiters(&self) -> &PendingRequests {
        &self.waiters
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.connector.describe())
            .field("state", &self.state())
            .field("mode", &self.mode())
            .field("modules", &self.registry.ids())
            .finish()
    }
}

//! Byte-stream abstractions for the bus transport.
//!
//! The connection only needs a bidirectional async byte stream. Anything that
//! is `AsyncRead + AsyncWrite + Unpin + Send` qualifies, which covers
//! `tokio::net::TcpStream` for real hardware and `tokio::io::DuplexStream` or
//! [`crate::mock_stream::MockStream`] for tests.
//!
//! # Types
//!
//! - [`StreamIO`]: trait alias combining AsyncRead + AsyncWrite
//! - [`DynStream`]: type-erased boxed stream
//! - [`Connector`]: opens a fresh stream on `connect()`
//! - [`TcpConnector`]: host/port connector used in production
//!
//! # Utilities
//!
//! - [`read_available`]: one read that does not wait for data
//! - [`discard_available`]: drop everything currently queued

use async_trait::async_trait;
use futures::FutureExt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

// =============================================================================
// Stream Trait
// =============================================================================

/// Trait alias for async bus I/O.
pub trait StreamIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIO for T {}

/// Type-erased boxed stream.
pub type DynStream = Box<dyn StreamIO>;

// =============================================================================
// Connectors
// =============================================================================

/// Opens the transport for a connection.
///
/// A connector is called once per `connect()`; after `close()` it may be
/// called again to reopen.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new stream.
    async fn open(&self) -> io::Result<DynStream>;

    /// Human readable peer description for logs.
    fn describe(&self) -> String;
}

/// Connects to a bus gateway over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    /// Create a connector for `host:port`. Nothing is resolved until `open()`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Configured host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> io::Result<DynStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        // Requests are tiny; do not let Nagle hold them back.
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Read Utilities
// =============================================================================

/// Perform a single read without waiting.
///
/// Returns `Ok(None)` when no data is queued right now, `Ok(Some(0))` on EOF
/// and `Ok(Some(n))` when `n` bytes were copied into `buf`.
pub fn read_available<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<Option<usize>> {
    match reader.read(buf).now_or_never() {
        None => Ok(None),
        Some(Ok(n)) => Ok(Some(n)),
        Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Some(Err(e)) => Err(e),
    }
}

/// Discard everything the stream can deliver without waiting.
///
/// Returns the number of bytes thrown away. Stops at the first read that would
/// block, at EOF, or on an I/O error (the error is left for the next real read
/// to report).
pub fn discard_available<R: AsyncRead + Unpin>(reader: &mut R) -> usize {
    let mut discard = [0u8; 256];
    let mut total_discarded = 0usize;

    loop {
        match read_available(reader, &mut discard) {
            Ok(Some(0)) | Ok(None) | Err(_) => break,
            Ok(Some(n)) => total_discarded += n,
        }
    }

    total_discarded
}

//! In-memory bus transport for testing.
//!
//! This module provides `MockStream` which implements `AsyncRead` and `AsyncWrite`,
//! and a corresponding `MockBusHarness` to play the modules' side of the bus
//! from within tests.
//!
//! # Architecture
//!
//! The mock uses a pair of unbounded channels to simulate bidirectional communication:
//! - `MockStream` (given to the connection): implements AsyncRead/AsyncWrite
//! - `MockBusHarness` (kept in test): asserts requests and scripts responses
//!
//! A read with nothing queued stays pending, so a non-blocking connection sees
//! "no data available" exactly like it would on an idle socket.
//!
//! # Example
//!
//! ```rust,ignore
//! use ctlab::{mock_stream, Connection, profiles::RegulatedSource};
//!
//! #[tokio::test]
//! async fn test_voltage_query() {
//!     let (connector, mut harness) = mock_stream::connector();
//!     let connection = Connection::new(connector, Default::default());
//!     connection.connect().await.unwrap();
//!     let dcg = RegulatedSource::new(1, &connection).unwrap();
//!
//!     harness.send_response(b"#1:0=9.5\r\n").unwrap();
//!     assert_eq!(dcg.query_voltage().await.unwrap(), 9.5);
//!     harness.expect_write(b"1:0?\r\n").await;
//! }
//! ```

use crate::transport::{Connector, DynStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The connection-facing side of the mock bus
#[derive(Debug)]
pub struct MockStream {
    /// Channel to send written data to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Buffer for data received from the harness but not yet read by the client
    read_buffer: VecDeque<u8>,
}

/// The test-facing side for controlling the mock bus
#[derive(Debug)]
pub struct MockBusHarness {
    /// Channel to receive data written by the client
    writes_rx: UnboundedReceiver<Vec<u8>>,
    /// Channel to send data to the client for it to read; `None` once disconnected
    reads_tx: Option<UnboundedSender<Vec<u8>>>,
    /// Buffer for data received from the client but not yet asserted by the test
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockStream` and `MockBusHarness`
pub fn new() -> (MockStream, MockBusHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let stream = MockStream {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockBusHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: Some(harness_to_client_tx),
        write_buffer: Vec::new(),
    };

    (stream, harness)
}

/// Creates a [`MockConnector`] that hands out one mock stream, plus its harness
pub fn connector() -> (MockConnector, MockBusHarness) {
    let (stream, harness) = new();
    (MockConnector::new(stream), harness)
}

// =============================================================================
// MockStream Implementations
// =============================================================================

impl MockStream {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // If we have data in our internal buffer, use that first
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness disconnected: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock bus harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// MockBusHarness Implementations
// =============================================================================

impl MockBusHarness {
    /// Sends bytes to the client as if a module had answered
    ///
    /// # Errors
    /// Returns error if the client stream has been dropped or the harness disconnected
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        match &self.reads_tx {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| "Failed to send response: client stream dropped"),
            None => Err("Failed to send response: harness disconnected"),
        }
    }

    /// Simulates the gateway closing the connection; the client reads EOF
    pub fn disconnect(&mut self) {
        self.reads_tx = None;
    }

    /// Waits for the client to write specific data and asserts its correctness
    ///
    /// # Panics
    /// Panics if the expected data is not received within 2 seconds or if
    /// the received data does not match the expected data.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::{timeout, Duration};

        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side stream closed while expecting a write."),
                Err(_) => {
                    panic!(
                        "Timeout waiting for write. Expected `{:?}` ({} bytes), but only received `{:?}` ({} bytes).",
                        String::from_utf8_lossy(expected),
                        expected.len(),
                        String::from_utf8_lossy(&self.write_buffer),
                        self.write_buffer.len()
                    );
                }
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );

        // Keep any excess for the next expectation
        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write and sends a response in one operation
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response)
            .expect("Failed to send response");
    }

    /// Returns everything written so far without waiting, and clears it
    pub fn take_written(&mut self) -> Vec<u8> {
        while let Ok(chunk) = self.writes_rx.try_recv() {
            self.write_buffer.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.write_buffer)
    }
}

// =============================================================================
// MockConnector
// =============================================================================

/// Connector that hands out a single prepared [`MockStream`]
///
/// A second `open()` fails with `ConnectionRefused`, as does every `open()` on
/// a connector built with [`MockConnector::refusing`].
#[derive(Debug)]
pub struct MockConnector {
    stream: Mutex<Option<MockStream>>,
}

impl MockConnector {
    /// Wrap a stream for a single `open()`
    pub fn new(stream: MockStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }

    /// A connector whose peer never accepts
    pub fn refusing() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> io::Result<DynStream> {
        let stream = self.stream.lock().take();
        match stream {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock bus refused the connection",
            )),
        }
    }

    fn describe(&self) -> String {
        "mock://bus".to_string()
    }
}

//! In-memory serial port for testing command/response drivers.
//!
//! `MockSerialPort` implements `AsyncRead`/`AsyncWrite` and is handed to the
//! driver. `MockDeviceHarness` stays with the test (or with a simulated
//! device task) and sees every byte the driver writes.
//!
//! Two ways to drive it:
//! - script the exchange with [`MockDeviceHarness::expect_and_respond`]
//! - attach a [`LineDevice`] via [`SimulatedConnector`], which answers each
//!   terminated command as a real controller would
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mfc_driver_mock::serial::new();
//! let mut port = BufReader::new(Box::new(port) as DynSerial);
//!
//! let app = tokio::spawn(async move {
//!     write_line(&mut port, "2H STATUS", "\r").await?;
//!     read_reply(&mut port, b"\n", Duration::from_secs(1)).await
//! });
//!
//! harness.expect_and_respond(b"2H STATUS\r", b"N\r\n").await;
//! ```

use async_trait::async_trait;
use mfc_core::transport::{Connector, DynSerial};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Driver-facing end of the mock port.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Bytes received from the harness but not yet read by the driver
    read_buffer: VecDeque<u8>,
}

/// Device-facing end of the mock port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Bytes written by the driver and not yet consumed
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx,
        reads_rx,
        read_buffer: VecDeque::new(),
    };
    let harness = MockDeviceHarness {
        writes_rx,
        reads_tx,
        write_buffer: Vec::new(),
    };
    (port, harness)
}

// =============================================================================
// MockSerialPort
// =============================================================================

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
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
            // Harness gone: end of file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
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
// MockDeviceHarness
// =============================================================================

impl MockDeviceHarness {
    /// Send bytes to the driver as if the device had replied.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "driver port disconnected")
    }

    /// Wait for the driver to write exactly `expected` next.
    ///
    /// # Panics
    /// Panics on mismatch, or when nothing arrives within 2 seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::{timeout, Duration};

        while self.write_buffer.len() < expected.len() {
            match timeout(Duration::from_secs(2), self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("driver port closed while expecting a write"),
                Err(_) => panic!(
                    "timeout waiting for `{}`, got `{}`",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer)
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "expected `{}`, got `{}`",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if self.send_response(response).is_err() {
            panic!("driver port closed before the response was sent");
        }
    }

    /// Next command terminated by `terminator`, trimmed.
    ///
    /// Returns `None` once the driver side is dropped.
    pub async fn next_command(&mut self, terminator: u8) -> Option<String> {
        loop {
            if let Some(pos) = self.write_buffer.iter().position(|b| *b == terminator) {
                let line: Vec<u8> = self.write_buffer.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&line[..pos]).trim().to_string());
            }
            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }
}

// =============================================================================
// Simulated line devices
// =============================================================================

/// A device that answers one terminated ASCII command at a time.
pub trait LineDevice: Send + Sync + 'static {
    /// Reply bytes for `command`; empty means no reply.
    fn respond(&self, command: &str) -> Vec<u8>;
}

/// Answer commands from `harness` until the driver drops its port.
pub async fn serve_lines<D: LineDevice>(mut harness: MockDeviceHarness, device: D, terminator: u8) {
    while let Some(command) = harness.next_command(terminator).await {
        tracing::trace!(%command, "simulated device received");
        let reply = device.respond(&command);
        if !reply.is_empty() && harness.send_response(&reply).is_err() {
            break;
        }
    }
}

/// [`Connector`] that opens a fresh mock port served by a shared simulated device.
///
/// Clones share the device state, so a test can keep one clone to inspect
/// the device while the driver owns another.
#[derive(Debug, Clone)]
pub struct SimulatedConnector<D> {
    device: D,
    terminator: u8,
    label: String,
    refuse: Arc<AtomicBool>,
    opened: Arc<AtomicU32>,
}

impl<D: LineDevice + Clone> SimulatedConnector<D> {
    pub fn new(device: D, terminator: u8, label: impl Into<String>) -> Self {
        Self {
            device,
            terminator,
            label: label.into(),
            refuse: Arc::new(AtomicBool::new(false)),
            opened: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make subsequent `open()` calls fail like an unplugged cable.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

#[async_trait]
impl<D: LineDevice + Clone> Connector for SimulatedConnector<D> {
    async fn open(&self) -> io::Result<DynSerial> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: no such device", self.label),
            ));
        }
        let (port, harness) = new();
        tokio::spawn(serve_lines(harness, self.device.clone(), self.terminator));
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("sim://{}", self.label)
    }
}

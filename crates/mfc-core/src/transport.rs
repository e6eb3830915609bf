//! Transport clients shared by the driver crates.
//!
//! # Types
//!
//! - [`SerialPortIO`] / [`DynSerial`]: type-erased byte stream (serial port,
//!   TCP socket, or an in-memory duplex in tests)
//! - [`Link`]: the one transport a driver owns, behind a lock whose guard is
//!   the critical section for one command round trip
//! - [`Connector`]: opens a byte-stream transport on `connect()`
//! - [`CoilBus`] / [`CoilConnector`]: boolean coil access for valve banks
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a serial port on the blocking pool (8N1)
//! - [`drain_serial_buffer`]: discard stale bytes before resynchronising
//! - [`write_line`] / [`read_reply`]: ASCII command framing with a timeout

use crate::driver::DriverFamily;
use crate::error::{RigError, RigResult};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use std::ops::{Deref, DerefMut};
use tokio::sync::{Mutex, MutexGuard};

// =============================================================================
// Byte streams
// =============================================================================

/// Anything usable as a command/response byte stream.
///
/// Covers `tokio_serial::SerialStream`, `tokio::net::TcpStream` and
/// `tokio::io::DuplexStream`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

pub type DynSerial = Box<dyn SerialPortIO>;

/// Buffered stream for line-oriented protocols.
pub type LinePort = BufReader<DynSerial>;

/// Opens a byte-stream transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> io::Result<DynSerial>;

    /// Address shown in logs, e.g. `/dev/ttyUSB0@115200`.
    fn describe(&self) -> String;
}

/// Serial port connector (8N1, no flow control).
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub path: String,
    pub baud_rate: u32,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self) -> io::Result<DynSerial> {
        let port = open_serial_async(&self.path, self.baud_rate).await?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }
}

/// Plain TCP socket connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub address: String,
    pub timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> io::Result<DynSerial> {
        let stream = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Open a serial port without blocking the runtime.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> io::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| io::Error::other(format!("failed to open {path}: {e}")))
    })
    .await
    .map_err(io::Error::other)?
}

/// Read and discard whatever arrives within `timeout`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}

/// Discard both the reader's buffer and anything pending on the wire.
pub async fn resync(port: &mut LinePort, timeout: Duration) -> usize {
    let buffered = port.buffer().len();
    port.consume(buffered);
    buffered + drain_serial_buffer(port.get_mut(), timeout).await
}

/// Write `command` followed by `terminator`.
pub async fn write_line(port: &mut LinePort, command: &str, terminator: &str) -> io::Result<()> {
    let stream = port.get_mut();
    stream.write_all(command.as_bytes()).await?;
    stream.write_all(terminator.as_bytes()).await?;
    stream.flush().await
}

/// Read until any byte in `ends` arrives.
///
/// Returns the reply without the end byte, and which end byte it was.
pub async fn read_reply(
    port: &mut LinePort,
    ends: &[u8],
    timeout: Duration,
) -> io::Result<(String, u8)> {
    let read = async {
        let mut reply = Vec::new();
        loop {
            let chunk = port.fill_buf().await?;
            if chunk.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transport closed",
                ));
            }
            if let Some(pos) = chunk.iter().position(|b| ends.contains(b)) {
                reply.extend_from_slice(&chunk[..pos]);
                let end = chunk[pos];
                port.consume(pos + 1);
                return Ok((String::from_utf8_lossy(&reply).into_owned(), end));
            }
            let n = chunk.len();
            reply.extend_from_slice(chunk);
            port.consume(n);
        }
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply"))?
}

// =============================================================================
// Coil transports
// =============================================================================

/// Boolean coil access (Modbus function codes 1 and 5).
#[async_trait]
pub trait CoilBus: Send {
    async fn read_coils(&mut self, address: u16, count: u16) -> io::Result<Vec<bool>>;

    async fn write_coil(&mut self, address: u16, state: bool) -> io::Result<()>;

    async fn disconnect(&mut self) -> io::Result<()>;
}

pub type DynCoilBus = Box<dyn CoilBus>;

#[async_trait]
pub trait CoilConnector: Send + Sync {
    async fn open(&self) -> io::Result<DynCoilBus>;

    fn describe(&self) -> String;
}

// =============================================================================
// Link
// =============================================================================

/// A driver's transport slot.
///
/// Empty until `connect()`, emptied again by `close()`. Each command round
/// trip takes the lock once via [`Link::lock`].
#[derive(Debug)]
pub struct Link<T> {
    family: DriverFamily,
    slot: Mutex<Option<T>>,
    connected: AtomicBool,
}

impl<T: Send> Link<T> {
    pub fn new(family: DriverFamily) -> Self {
        Self {
            family,
            slot: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Fail fast if a transport is already attached.
    pub fn ensure_detached(&self) -> RigResult<()> {
        if self.is_connected() {
            return Err(RigError::AlreadyConnected(self.family));
        }
        Ok(())
    }

    pub async fn attach(&self, transport: T) -> RigResult<()> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err(RigError::AlreadyConnected(self.family));
        }
        *slot = Some(transport);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove and return the transport, if any.
    pub async fn detach(&self) -> Option<T> {
        let mut slot = self.slot.lock().await;
        self.connected.store(false, Ordering::Release);
        slot.take()
    }

    /// Lock the transport for one round trip.
    pub async fn lock(&self) -> RigResult<LinkGuard<'_, T>> {
        let guard = self.slot.lock().await;
        if guard.is_some() {
            Ok(LinkGuard(guard))
        } else {
            Err(RigError::NotConnected(self.family))
        }
    }
}

/// Locked, attached transport returned by [`Link::lock`].
///
/// Wraps the slot guard rather than using `MappedMutexGuard`, whose `T: 'a`
/// bound makes futures holding it across an `.await` fail the `Send` check
/// when `T` contains a trait object.
pub struct LinkGuard<'a, T>(MutexGuard<'a, Option<T>>);

impl<T> Deref for LinkGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.0.as_ref() {
            Some(transport) => transport,
            None => unreachable!("LinkGuard is only built over an attached transport"),
        }
    }
}

impl<T> DerefMut for LinkGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.0.as_mut() {
            Some(transport) => transport,
            None => unreachable!("LinkGuard is only built over an attached transport"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_port(stream: tokio::io::DuplexStream) -> LinePort {
        BufReader::new(Box::new(stream) as DynSerial)
    }

    #[tokio::test]
    async fn reply_stops_at_first_end_byte() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port = line_port(device);

        host.write_all(b" 1234\r\n:next").await.unwrap();
        let (reply, end) = read_reply(&mut port, b":?", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(reply, " 1234\r\n");
        assert_eq!(end, b':');

        host.write_all(b"?").await.unwrap();
        let (reply, end) = read_reply(&mut port, b":?", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(reply, "next");
        assert_eq!(end, b'?');
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (_host, device) = tokio::io::duplex(64);
        let mut port = line_port(device);
        let err = read_reply(&mut port, b"\n", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn write_line_appends_terminator() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port = line_port(device);
        write_line(&mut port, "2H STATUS", "\r").await.unwrap();

        let mut buf = [0u8; 10];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"2H STATUS\r");
    }

    #[tokio::test]
    async fn resync_discards_stale_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port = line_port(device);
        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = resync(&mut port, Duration::from_millis(30)).await;
        assert_eq!(discarded, 16);
    }

    #[tokio::test]
    async fn link_lifecycle() {
        let link: Link<u32> = Link::new(DriverFamily::Wago);
        assert!(!link.is_connected());
        assert!(matches!(link.lock().await, Err(RigError::NotConnected(_))));

        link.attach(7).await.unwrap();
        assert!(link.is_connected());
        assert_eq!(link.attach(8).await, Err(RigError::AlreadyConnected(DriverFamily::Wago)));
        assert!(link.ensure_detached().is_err());

        *link.lock().await.unwrap() += 1;
        assert_eq!(link.detach().await, Some(8));
        assert_eq!(link.detach().await, None);
        assert!(!link.is_connected());
    }
}

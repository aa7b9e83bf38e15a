//! # Stick Transport Layer
//!
//! Byte-level access to the Plugwise Stick. The Stick speaks line-oriented
//! ASCII over a USB serial adapter at 115200 8N1: every frame ends in CR LF,
//! but the firmware also interleaves trace lines and the occasional stray
//! byte, so the transport only splits lines. Framing, checksums and
//! sequence matching live in [`crate::codec`] and [`crate::transaction`].
//!
//! ## Transports
//!
//! - [`SerialTransport`]: a real Stick through `tokio-serial`
//! - [`StreamTransport`]: any `AsyncRead + AsyncWrite` stream, used for
//!   simulators, TCP serial bridges and tests
//!
//! ```rust,no_run
//! use plugwise::transport::{SerialTransport, StickTransport};
//! use std::time::Duration;
//!
//! # async fn example() -> plugwise::PlugwiseResult<()> {
//! let mut transport = SerialTransport::new("/dev/ttyUSB0", 115_200)?;
//! let line = transport.read_line(Duration::from_secs(1)).await?;
//! println!("read {} bytes", line.len());
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

use crate::error::{PlugwiseError, PlugwiseResult};
use crate::logging::format_frame_text;

/// Longest line accepted before the buffer is handed back unterminated
const MAX_LINE_LEN: usize = 512;

/// Default serial speed of the Stick
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Log packet with direction and transport name
fn log_packet(direction: &str, data: &[u8], transport: &str) {
    info!("[PLUGWISE-{}] {} {}", transport, direction, format_frame_text(data));
}

/// Line-oriented byte channel to a Stick
///
/// Implementations must be `Send + Sync` so a channel can be shared between
/// the controller task and command handlers.
#[async_trait]
pub trait StickTransport: Send + Sync {
    /// Write one complete frame and flush it
    async fn write_frame(&mut self, frame: &[u8]) -> PlugwiseResult<()>;

    /// Read up to and including the next LF
    ///
    /// Returns whatever arrived before `wait` elapsed when no line ending
    /// was seen, possibly nothing. The caller keeps partial lines and
    /// continues them on the next read.
    async fn read_line(&mut self, wait: Duration) -> PlugwiseResult<Vec<u8>>;

    /// Drop and reopen the underlying device
    async fn reopen(&mut self) -> PlugwiseResult<()>;

    /// Whether the transport believes the device is open
    fn is_connected(&self) -> bool;

    /// Close the device
    async fn close(&mut self) -> PlugwiseResult<()>;

    /// Communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub lines_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reopens: u64,
}

/// Read byte-wise until LF or the deadline
async fn read_line_from<R>(reader: &mut R, wait: Duration) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = Instant::now() + wait;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match timeout_at(deadline, reader.read_exact(&mut byte)).await {
            Ok(Ok(_)) => {
                line.push(byte[0]);
                if byte[0] == b'\n' || line.len() >= MAX_LINE_LEN {
                    return Ok(line);
                }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if line.is_empty() {
                    return Err(e);
                }
                return Ok(line);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(line),
        }
    }
}

async fn write_frame_to<W>(writer: &mut W, frame: &[u8], wait: Duration) -> PlugwiseResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    timeout(wait, async {
        writer.write_all(frame).await?;
        writer.flush().await
    })
    .await??;
    Ok(())
}

fn record_read(stats: &mut TransportStats, line: &[u8]) {
    if line.is_empty() {
        stats.timeouts += 1;
    } else {
        stats.bytes_received += line.len() as u64;
        if line.ends_with(b"\n") {
            stats.lines_received += 1;
        }
    }
}

fn open_port(
    port_name: &str,
    baud_rate: u32,
    write_timeout: Duration,
) -> PlugwiseResult<tokio_serial::SerialStream> {
    let builder = tokio_serial::new(port_name, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(tokio_serial::Parity::None)
        .timeout(write_timeout);

    tokio_serial::SerialStream::open(&builder).map_err(|e| {
        PlugwiseError::channel(format!("failed to open serial port {}: {}", port_name, e))
    })
}

/// Stick attached through a serial port
///
/// Any read or write failure closes the port. The next write, or an
/// explicit [`StickTransport::reopen`], opens it again.
pub struct SerialTransport {
    port: Option<tokio_serial::SerialStream>,
    port_name: String,
    baud_rate: u32,
    write_timeout: Duration,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl SerialTransport {
    /// Open a serial port at `baud_rate`, 8N1
    pub fn new(port: &str, baud_rate: u32) -> PlugwiseResult<Self> {
        Self::new_with_packet_logging(port, baud_rate, false)
    }

    /// Open a serial port with packet logging enabled or disabled
    pub fn new_with_packet_logging(
        port: &str,
        baud_rate: u32,
        enable_logging: bool,
    ) -> PlugwiseResult<Self> {
        let opened = open_port(port, baud_rate, Duration::from_secs(1))?;
        let mut transport = Self::from_port(opened, port, baud_rate);
        transport.packet_logging = enable_logging;
        Ok(transport)
    }

    /// Wrap a port that is already open
    fn from_port(port: tokio_serial::SerialStream, port_name: &str, baud_rate: u32) -> Self {
        Self {
            port: Some(port),
            port_name: port_name.to_string(),
            baud_rate,
            write_timeout: Duration::from_secs(1),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn connect(&mut self) -> PlugwiseResult<()> {
        self.port = Some(open_port(&self.port_name, self.baud_rate, self.write_timeout)?);
        Ok(())
    }

    fn port_mut(&mut self) -> PlugwiseResult<&mut tokio_serial::SerialStream> {
        self.port
            .as_mut()
            .ok_or_else(|| PlugwiseError::channel("serial port not open"))
    }
}

#[async_trait]
impl StickTransport for SerialTransport {
    async fn write_frame(&mut self, frame: &[u8]) -> PlugwiseResult<()> {
        if self.port.is_none() {
            self.connect()?;
        }
        if self.packet_logging {
            log_packet("send", frame, "SERIAL");
        }
        let wait = self.write_timeout;
        let result = write_frame_to(self.port_mut()?, frame, wait).await;
        match &result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
            }
            Err(e) => {
                self.stats.errors += 1;
                warn!("serial write to {} failed, closing port: {}", self.port_name, e);
                self.port = None;
            }
        }
        result
    }

    async fn read_line(&mut self, wait: Duration) -> PlugwiseResult<Vec<u8>> {
        let result = read_line_from(self.port_mut()?, wait).await;
        match result {
            Ok(line) => {
                record_read(&mut self.stats, &line);
                if self.packet_logging && !line.is_empty() {
                    log_packet("receive", &line, "SERIAL");
                }
                Ok(line)
            }
            Err(e) => {
                // closed until the next reconnect
                self.stats.errors += 1;
                self.port = None;
                Err(PlugwiseError::channel(format!("serial read error: {}", e)))
            }
        }
    }

    async fn reopen(&mut self) -> PlugwiseResult<()> {
        self.port = None;
        self.stats.reopens += 1;
        self.connect()
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> PlugwiseResult<()> {
        // SerialStream closes on drop
        self.port.take();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Stick reached through an arbitrary async byte stream
///
/// The stream cannot be recreated, so [`StickTransport::reopen`] only
/// succeeds while it is still open.
pub struct StreamTransport<S> {
    stream: Option<S>,
    write_timeout: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            write_timeout: Duration::from_secs(1),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn stream_mut(&mut self) -> PlugwiseResult<&mut S> {
        self.stream
            .as_mut()
            .ok_or_else(|| PlugwiseError::channel("stream closed"))
    }
}

#[async_trait]
impl<S> StickTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn write_frame(&mut self, frame: &[u8]) -> PlugwiseResult<()> {
        if self.packet_logging {
            log_packet("send", frame, "STREAM");
        }
        let wait = self.write_timeout;
        let result = write_frame_to(self.stream_mut()?, frame, wait).await;
        match &result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
            }
            Err(_) => {
                self.stats.errors += 1;
                self.stream = None;
            }
        }
        result
    }

    async fn read_line(&mut self, wait: Duration) -> PlugwiseResult<Vec<u8>> {
        match read_line_from(self.stream_mut()?, wait).await {
            Ok(line) => {
                record_read(&mut self.stats, &line);
                if self.packet_logging && !line.is_empty() {
                    log_packet("receive", &line, "STREAM");
                }
                Ok(line)
            }
            Err(e) => {
                self.stats.errors += 1;
                self.stream = None;
                Err(PlugwiseError::channel(format!("stream read error: {}", e)))
            }
        }
    }

    async fn reopen(&mut self) -> PlugwiseResult<()> {
        self.stats.reopens += 1;
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(PlugwiseError::channel("stream closed and cannot be reopened"))
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> PlugwiseResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_complete_line() {
        let (client, mut stick) = duplex(256);
        let mut transport = StreamTransport::new(client);
        stick.write_all(b"0123\r\nrest").await.unwrap();

        let line = transport.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(line, b"0123\r\n");
        let partial = transport.read_line(Duration::from_millis(50)).await.unwrap();
        assert_eq!(partial, b"rest");

        let stats = transport.get_stats();
        assert_eq!(stats.lines_received, 1);
        assert_eq!(stats.bytes_received, 10);
    }

    #[tokio::test]
    async fn test_read_timeout_returns_empty() {
        let (client, _stick) = duplex(64);
        let mut transport = StreamTransport::new(client);
        let line = transport.read_line(Duration::from_millis(20)).await.unwrap();
        assert!(line.is_empty());
        assert_eq!(transport.get_stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_write_and_close() {
        let (client, mut stick) = duplex(64);
        let mut transport = StreamTransport::new(client);
        transport.write_frame(b"frame\r\n").await.unwrap();

        let mut buf = [0u8; 7];
        stick.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame\r\n");

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(transport.reopen().await.is_err());
        assert!(transport.write_frame(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_hangup_is_channel_error() {
        let (client, stick) = duplex(64);
        let mut transport = StreamTransport::new(client);
        drop(stick);
        let err = transport.read_line(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_transport_error());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_write_failure_closes_stream() {
        let (client, stick) = duplex(64);
        let mut transport = StreamTransport::new(client);
        drop(stick);
        assert!(transport.write_frame(b"frame\r\n").await.is_err());
        assert!(!transport.is_connected());
        assert_eq!(transport.get_stats().errors, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serial_read_error_closes_port() {
        let (master, slave) = tokio_serial::SerialStream::pair().unwrap();
        let mut transport = SerialTransport::from_port(slave, "pty", DEFAULT_BAUD_RATE);
        assert!(transport.is_connected());

        drop(master);
        let err = transport.read_line(Duration::from_millis(200)).await.unwrap_err();
        assert!(err.is_transport_error());
        assert!(!transport.is_connected());
        assert_eq!(transport.get_stats().errors, 1);
        // Further reads fail fast until the port is reopened
        assert!(transport.read_line(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_serial_port() {
        let result = SerialTransport::new("/dev/does-not-exist-plugwise", DEFAULT_BAUD_RATE);
        assert!(result.is_err());
    }
}

//! Byte links to the instrument.
//!
//! A [`Link`] moves raw bytes over TCP or a serial line. Reads are bounded by
//! a caller-supplied timeout and report "no data yet" as `Ok(0)`; transport
//! failures and peer closure are errors.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, trace, warn};

use crate::error::ResistEsError;

/// Byte transport used by a device session.
#[async_trait]
pub trait Link: Send {
    /// Write a whole frame.
    async fn send(&mut self, data: &[u8]) -> Result<(), ResistEsError>;

    /// Read whatever is available within `timeout`, `Ok(0)` when nothing
    /// arrived.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration)
    -> Result<usize, ResistEsError>;

    /// Release the underlying endpoint. Idempotent.
    async fn close(&mut self) -> Result<(), ResistEsError>;

    fn is_connected(&self) -> bool;
}

fn map_io_error(e: std::io::Error) -> ResistEsError {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => ResistEsError::LinkClosed,
        _ => ResistEsError::Io(e),
    }
}

/// TCP link, typically to a serial-to-ethernet bridge in front of the
/// instrument.
#[derive(Debug)]
pub struct TcpLink {
    stream: Option<TcpStream>,
    addr: String,
}

impl TcpLink {
    /// Connect to `host:port` within `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, ResistEsError> {
        debug!(addr = %addr, "connecting");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ResistEsError::Link(format!("connect to {addr} timed out")))?
            .map_err(ResistEsError::Io)?;
        // small latency-sensitive command frames
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        debug!(addr = %addr, "connected");
        Ok(Self {
            stream: Some(stream),
            addr: addr.to_string(),
        })
    }

    /// Wrap an already connected stream, e.g. one accepted from a listener in
    /// tests.
    pub fn from_stream(stream: TcpStream, addr: String) -> Self {
        Self {
            stream: Some(stream),
            addr,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&mut self, data: &[u8]) -> Result<(), ResistEsError> {
        let stream = self.stream.as_mut().ok_or(ResistEsError::NotConnected)?;
        trace!(addr = %self.addr, bytes = hex::encode(data), "tcp write");
        stream.write_all(data).await.map_err(map_io_error)?;
        stream.flush().await.map_err(map_io_error)?;
        Ok(())
    }

    async fn receive(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, ResistEsError> {
        let stream = self.stream.as_mut().ok_or(ResistEsError::NotConnected)?;
        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => {
                warn!(addr = %self.addr, "peer closed connection");
                Err(ResistEsError::LinkClosed)
            }
            Ok(Ok(n)) => {
                trace!(addr = %self.addr, bytes = hex::encode(&buf[..n]), "tcp read");
                Ok(n)
            }
            Ok(Err(e)) => Err(map_io_error(e)),
            Err(_) => Ok(0),
        }
    }

    async fn close(&mut self) -> Result<(), ResistEsError> {
        if let Some(mut stream) = self.stream.take() {
            debug!(addr = %self.addr, "closing");
            if let Err(e) = stream.shutdown().await {
                warn!(addr = %self.addr, error = %e, "shutdown failed");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// Character framing of a serial line, e.g. `8N1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialMode {
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialMode {
    fn default() -> Self {
        SerialMode {
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialMode {
    /// Parse a `"8N1"`-style triple.
    pub fn parse(mode: &str) -> Option<Self> {
        let mut chars = mode.chars();
        let (data, parity, stop) = (chars.next()?, chars.next()?, chars.next()?);
        if chars.next().is_some() {
            return None;
        }
        let data_bits = match data {
            '5' => DataBits::Five,
            '6' => DataBits::Six,
            '7' => DataBits::Seven,
            '8' => DataBits::Eight,
            _ => return None,
        };
        let parity = match parity.to_ascii_uppercase() {
            'N' => Parity::None,
            'E' => Parity::Even,
            'O' => Parity::Odd,
            _ => return None,
        };
        let stop_bits = match stop {
            '1' => StopBits::One,
            '2' => StopBits::Two,
            _ => return None,
        };
        Some(SerialMode {
            data_bits,
            parity,
            stop_bits,
        })
    }
}

/// Direct serial link to the instrument.
pub struct SerialLink {
    port: Option<SerialStream>,
    path: String,
}

impl SerialLink {
    /// Open `path` at `baud` with the given character framing.
    pub fn open(path: &str, baud: u32, mode: SerialMode) -> Result<Self, ResistEsError> {
        debug!(path = %path, baud, "opening serial port");
        let port = tokio_serial::new(path, baud)
            .data_bits(mode.data_bits)
            .parity(mode.parity)
            .stop_bits(mode.stop_bits)
            .open_native_async()?;
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn send(&mut self, data: &[u8]) -> Result<(), ResistEsError> {
        let port = self.port.as_mut().ok_or(ResistEsError::NotConnected)?;
        trace!(path = %self.path, bytes = hex::encode(data), "serial write");
        port.write_all(data).await.map_err(map_io_error)?;
        port.flush().await.map_err(map_io_error)?;
        Ok(())
    }

    async fn receive(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, ResistEsError> {
        let port = self.port.as_mut().ok_or(ResistEsError::NotConnected)?;
        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(0)) => Err(ResistEsError::LinkClosed),
            Ok(Ok(n)) => {
                trace!(path = %self.path, bytes = hex::encode(&buf[..n]), "serial read");
                Ok(n)
            }
            Ok(Err(e)) => Err(map_io_error(e)),
            Err(_) => Ok(0),
        }
    }

    async fn close(&mut self) -> Result<(), ResistEsError> {
        if self.port.take().is_some() {
            debug!(path = %self.path, "closing serial port");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

/// Parsed link address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkUrl {
    Tcp {
        host: String,
        port: u16,
    },
    Serial {
        path: String,
        baud: u32,
        mode: SerialMode,
    },
}

impl std::str::FromStr for LinkUrl {
    type Err = ResistEsError;

    /// Accepts `tcp:host:port` and `serial:path:baud[:mode]`.
    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ResistEsError::LinkUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        if let Some(rest) = url.strip_prefix("tcp:") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
            if host.is_empty() {
                return Err(bad("missing host"));
            }
            let port = port.parse::<u16>().map_err(|_| bad("invalid port"))?;
            return Ok(LinkUrl::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if let Some(rest) = url.strip_prefix("serial:") {
            let mut parts: Vec<&str> = rest.split(':').collect();
            if parts.len() < 2 {
                return Err(bad("missing baud rate"));
            }
            let mode = if parts.len() >= 3 {
                if let Some(mode) = SerialMode::parse(parts[parts.len() - 1]) {
                    parts.pop();
                    mode
                } else {
                    SerialMode::default()
                }
            } else {
                SerialMode::default()
            };
            let baud = parts
                .pop()
                .ok_or_else(|| bad("missing baud rate"))?
                .parse::<u32>()
                .map_err(|_| bad("invalid baud rate"))?;
            let path = parts.join(":");
            if path.is_empty() {
                return Err(bad("missing device path"));
            }
            return Ok(LinkUrl::Serial { path, baud, mode });
        }
        Err(bad("unknown scheme, expected tcp: or serial:"))
    }
}

/// Open the link a URL describes.
pub async fn link_from_url(
    url: &str,
    connect_timeout: Duration,
) -> Result<Box<dyn Link>, ResistEsError> {
    match url.parse::<LinkUrl>()? {
        LinkUrl::Tcp { host, port } => {
            let link = TcpLink::connect(&format!("{host}:{port}"), connect_timeout).await?;
            Ok(Box::new(link))
        }
        LinkUrl::Serial { path, baud, mode } => {
            let link = SerialLink::open(&path, baud, mode)?;
            Ok(Box::new(link))
        }
    }
}

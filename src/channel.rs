//! Byte-level conversation with the modem.
//!
//! A [`Channel`] owns one stream produced by a [`Connector`] (TCP socket or
//! serial tty) and frames it into lines with [`AtLineCodec`]. It is owned by
//! the dispatcher's worker task, so there is never more than one reader or
//! writer; the current [`ConnectionState`] is published on a `watch` channel
//! so request handles can refuse work without touching the stream.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;
use serde::Serialize;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

use crate::command::is_final_result;
use crate::error::ModemError;

/// Longest line kept intact; anything longer is cut into forced lines.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Faulted => "faulted",
        })
    }
}

/// Anything the channel can speak AT over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the underlying byte stream. Called again on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<BoxedStream>;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

/// Modem exposed over TCP (e.g. `socat` bridging the AT port).
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream =
            tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(&self.address))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect {} timed out", self.address),
                    )
                })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Modem AT port on a local serial device (e.g. `/dev/ttyUSB2`).
pub struct SerialConnector {
    device: String,
    baud: u32,
}

impl SerialConnector {
    pub fn new(device: impl Into<String>, baud: u32) -> Self {
        Self {
            device: device.into(),
            baud,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let fd = fcntl::open(
            self.device.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| io::Error::other(format!("open {}: {e}", self.device)))?;
        // SAFETY: fd was just returned by open() and is owned by nobody else.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        configure_termios(owned.as_raw_fd(), self.baud)?;
        termios::tcflush(owned.as_fd(), termios::FlushArg::TCIOFLUSH)
            .map_err(|e| io::Error::other(format!("tcflush: {e}")))?;

        Ok(Box::new(SerialStream {
            fd: AsyncFd::new(owned)?,
        }))
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.device, self.baud)
    }
}

fn baud_rate(baud: u32) -> io::Result<termios::BaudRate> {
    Ok(match baud {
        9600 => termios::BaudRate::B9600,
        19200 => termios::BaudRate::B19200,
        38400 => termios::BaudRate::B38400,
        57600 => termios::BaudRate::B57600,
        115_200 => termios::BaudRate::B115200,
        230_400 => termios::BaudRate::B230400,
        460_800 => termios::BaudRate::B460800,
        921_600 => termios::BaudRate::B921600,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    })
}

/// Raw mode, 8N1, no flow control. The fd stays non-blocking; readiness
/// comes from the reactor, so VMIN/VTIME only need to not get in the way.
fn configure_termios(fd: RawFd, baud: u32) -> io::Result<()> {
    // SAFETY: fd is valid for the duration of this call; caller owns it.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let speed = baud_rate(baud)?;

    let mut tio =
        termios::tcgetattr(borrowed).map_err(|e| io::Error::other(format!("tcgetattr: {e}")))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetispeed(&mut tio, speed)
        .map_err(|e| io::Error::other(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, speed)
        .map_err(|e| io::Error::other(format!("cfsetospeed: {e}")))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
        .map_err(|e| io::Error::other(format!("tcsetattr: {e}")))
}

/// Non-blocking tty driven by the tokio reactor.
struct SerialStream {
    fd: AsyncFd<OwnedFd>,
}

impl AsyncRead for SerialStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                unistd::read(inner.get_ref().as_raw_fd(), unfilled).map_err(io::Error::from)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| unistd::write(inner.get_ref(), buf).map_err(io::Error::from))
            {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Line framing for AT traffic.
///
/// Splits on CR or LF, decodes lossily, strips NUL/control bytes and
/// replacement characters left over from a stale buffer, and never yields
/// blank lines. Commands are encoded with a trailing CR.
#[derive(Debug, Default)]
pub struct AtLineCodec {
    max_length: usize,
}

impl AtLineCodec {
    pub fn new() -> Self {
        Self {
            max_length: MAX_LINE_LENGTH,
        }
    }

    #[cfg(test)]
    fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }
}

/// Remove NUL bytes and non-printable control characters.
fn clean_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|&c| !c.is_control())
        .filter(|&c| c != '\u{FFFD}')
        .collect::<String>()
        .trim()
        .to_string()
}

impl Decoder for AtLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = src.iter().position(|&b| b == b'\r' || b == b'\n') {
                let raw = src.split_to(pos + 1);
                let line = clean_line(&raw[..pos]);
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            if self.max_length > 0 && src.len() > self.max_length {
                let raw = src.split_to(self.max_length);
                let line = clean_line(&raw);
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            return Ok(None);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let raw = src.split_to(src.len());
        let line = clean_line(&raw);
        Ok(if line.is_empty() { None } else { Some(line) })
    }
}

impl Encoder<String> for AtLineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(item.as_bytes());
        dst.put_u8(b'\r');
        Ok(())
    }
}

/// Reconnect policy for [`Channel::connect`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Connect attempts before giving up with a fatal transport error.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles each time.
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay.
    pub max_backoff: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Line-oriented, single-owner conversation with the modem.
pub struct Channel {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    framed: Option<Framed<BoxedStream, AtLineCodec>>,
    state: watch::Sender<ConnectionState>,
}

impl Channel {
    pub fn new(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            config,
            framed: None,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> String {
        self.connector.describe()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Modem {}: {current} -> {next}", self.connector.describe());
            *current = next;
            true
        });
    }

    /// Open the stream, retrying with exponential backoff.
    ///
    /// Any previous stream is dropped first. Ends `Connected` on success and
    /// `Faulted` once `max_attempts` are exhausted.
    pub async fn connect(&mut self) -> Result<(), ModemError> {
        self.framed = None;
        self.set_state(ConnectionState::Connecting);

        let endpoint = self.connector.describe();
        let attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.connector.connect().await {
                Ok(stream) => {
                    self.framed = Some(Framed::new(stream, AtLineCodec::new()));
                    self.set_state(ConnectionState::Connected);
                    info!("Modem {endpoint}: connected (attempt {attempt})");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        warn!(
                            "Modem {endpoint}: connect failed ({attempt}/{attempts}): {e}, retrying in {:.1}s",
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.config.max_backoff);
                    }
                }
            }
        }

        self.set_state(ConnectionState::Faulted);
        Err(ModemError::transport(format!(
            "connect {endpoint} failed after {attempts} attempts: {last_error}"
        )))
    }

    fn fault(&mut self, reason: &str) -> ModemError {
        warn!("Modem {}: {reason}", self.connector.describe());
        self.framed = None;
        self.set_state(ConnectionState::Faulted);
        ModemError::transport(reason.to_string())
    }

    /// Write one command line (CR appended).
    pub async fn write_line(&mut self, text: &str) -> Result<(), ModemError> {
        if self.state() != ConnectionState::Connected {
            return Err(ModemError::transport(format!(
                "channel {} is {}",
                self.connector.describe(),
                self.state()
            )));
        }
        let Some(framed) = self.framed.as_mut() else {
            return Err(self.fault("stream missing while connected"));
        };
        if let Err(e) = framed.send(text.to_string()).await {
            return Err(self.fault(&format!("write: {e}")));
        }
        Ok(())
    }

    /// Next non-blank line, or a timeout once `deadline` passes.
    ///
    /// A timeout leaves the connection open; EOF and I/O errors fault it.
    pub async fn read_line(&mut self, deadline: Instant) -> Result<String, ModemError> {
        let Some(framed) = self.framed.as_mut() else {
            return Err(ModemError::transport(format!(
                "channel {} is {}",
                self.connector.describe(),
                self.state()
            )));
        };
        match tokio::time::timeout_at(deadline, framed.next()).await {
            Err(_) => Err(ModemError::timeout("response line")),
            Ok(Some(Ok(line))) => Ok(line),
            Ok(Some(Err(e))) => Err(self.fault(&format!("read: {e}"))),
            Ok(None) => Err(self.fault("connection closed by peer")),
        }
    }

    /// Drop everything already received without waiting for more.
    /// Returns how many lines were thrown away.
    pub fn discard_pending(&mut self) -> usize {
        let Some(framed) = self.framed.as_mut() else {
            return 0;
        };
        let mut dropped = 0;
        while let Some(Some(Ok(line))) = framed.next().now_or_never() {
            debug!("Modem: discarding stale line {line:?}");
            dropped += 1;
        }
        framed.read_buffer_mut().clear();
        dropped
    }

    /// After a timeout, swallow the tail of the abandoned reply.
    ///
    /// Reads until a final result code or until `grace` passes with nothing
    /// arriving. The grace window restarts on every line received. Returns
    /// whether the abandoned reply's final result code was seen.
    pub async fn drain_stale(&mut self, grace: Duration) -> bool {
        let mut dropped = 0;
        let mut terminated = false;
        while let Ok(line) = self.read_line(Instant::now() + grace).await {
            dropped += 1;
            if is_final_result(&line) {
                terminated = true;
                break;
            }
        }
        if dropped > 0 {
            debug!("Modem: drained {dropped} stale lines after timeout");
        }
        terminated
    }

    /// Release the stream. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.framed.take().is_some() {
            info!("Modem {}: closed", self.connector.describe());
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

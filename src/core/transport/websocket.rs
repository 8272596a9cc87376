//! WebSocket transport implementation
//!
//! Thin adapter over `tungstenite`. The library already queues frames, so the
//! only buffering here is the remainder of a message larger than the caller's
//! `max_len`.

use super::{mirror_rx, Transport, TransportError, TransportStats, TransportType};
use crate::core::capture::RxSink;
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

/// Streams whose blocking reads can be bounded
pub trait ReadTimeout {
    /// Bound subsequent reads; `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ReadTimeout for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl ReadTimeout for MaybeTlsStream<TcpStream> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout),
            _ => Ok(()),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Io(e) => TransportError::IoError(e),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => TransportError::Disconnected,
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// WebSocket transport
pub struct WebSocketTransport<S: Read + Write + ReadTimeout = MaybeTlsStream<TcpStream>> {
    info: String,
    socket: WebSocket<S>,
    /// Unread remainder of the last message
    pending: Bytes,
    rx_sink: Option<Box<dyn RxSink>>,
    last_rx_time: Option<DateTime<Utc>>,
    stats: TransportStats,
    closed: bool,
    stopped: bool,
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Open a client connection to `url`
    pub fn connect(url: &str, rx_sink: Option<Box<dyn RxSink>>) -> Result<Self, TransportError> {
        info!("Connecting to {}.", url);
        let (socket, response) = tungstenite::connect(url)?;
        debug!("WebSocket handshake complete. [status={}]", response.status());
        Ok(Self::new(socket, url.to_string(), rx_sink))
    }
}

impl<S: Read + Write + ReadTimeout + Send> WebSocketTransport<S> {
    /// Wrap an established WebSocket
    pub fn new(socket: WebSocket<S>, info: String, rx_sink: Option<Box<dyn RxSink>>) -> Self {
        Self {
            info,
            socket,
            pending: Bytes::new(),
            rx_sink,
            last_rx_time: None,
            stats: TransportStats::default(),
            closed: false,
            stopped: false,
        }
    }

    /// Receive the next data message, waiting at most `timeout`
    fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // A zero timeout means "block forever" to the OS.
            self.socket.get_ref().set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

            match self.socket.read() {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Text(text)) => return Ok(Some(Bytes::from(text.into_bytes()))),
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by peer. [{:?}]", frame);
                    self.closed = true;
                    return Err(TransportError::Disconnected);
                }
                // Ping replies are queued by tungstenite and sent on the next write.
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None);
                }
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

impl<S: Read + Write + ReadTimeout + Send> Transport for WebSocketTransport<S> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::NotConnected);
        }
        debug!("TX {}", hex::encode(data));
        self.socket.send(Message::Binary(data.to_vec()))?;
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    fn read(&mut self, max_len: usize, timeout: Duration, return_any: bool) -> Result<Bytes, TransportError> {
        if self.stopped {
            return Err(TransportError::NotConnected);
        }

        let deadline = Instant::now() + timeout;
        let mut out = BytesMut::new();
        while out.len() < max_len {
            if self.pending.is_empty() {
                if self.closed {
                    if out.is_empty() {
                        return Err(TransportError::Disconnected);
                    }
                    break;
                }
                match self.recv(deadline.saturating_duration_since(Instant::now())) {
                    Ok(Some(data)) => self.pending = data,
                    Ok(None) => break,
                    Err(TransportError::Disconnected) if !out.is_empty() => break,
                    Err(e) => return Err(e),
                }
            }

            let n = (max_len - out.len()).min(self.pending.len());
            out.extend_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            if return_any {
                break;
            }
        }

        let data = out.freeze();
        if !data.is_empty() {
            self.last_rx_time = Some(Utc::now());
            self.stats.bytes_received += data.len() as u64;
            mirror_rx(&mut self.rx_sink, &data, None);
        }
        Ok(data)
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        if self.stopped {
            return Ok(());
        }
        match self.flush_rx() {
            Ok(_) | Err(TransportError::Disconnected) => {}
            Err(e) => warn!("Error flushing WebSocket before close: {}", e),
        }
        self.stopped = true;

        if !self.closed {
            if let Err(e) = self.socket.close(None).and_then(|()| self.socket.flush()) {
                debug!("Error closing WebSocket: {}", e);
            }
        }
        if let Some(sink) = self.rx_sink.as_mut() {
            sink.flush()?;
        }
        info!("WebSocket transport stopped. [{}]", self.info);
        Ok(())
    }

    fn last_rx_time(&self) -> Option<DateTime<Utc>> {
        self.last_rx_time
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl<S: Read + Write + ReadTimeout> Drop for WebSocketTransport<S> {
    fn drop(&mut self) {
        if !self.stopped && !self.closed {
            if let Err(e) = self.socket.close(None).and_then(|()| self.socket.flush()) {
                debug!("Error closing WebSocket during drop: {}", e);
            }
        }
    }
}

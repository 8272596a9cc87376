//! TCP socket transport implementation
//!
//! No reader thread: the OS socket buffer is enlarged instead, and `read()`
//! waits for readability before each receive. On Unix the receive path uses
//! `recvmsg` so kernel receive timestamps (`SO_TIMESTAMP`) can be captured
//! alongside the data and forwarded to the capture sink.

use super::{mirror_rx, Transport, TransportError, TransportStats, TransportType, MAX_DATA_BUFFER_SIZE};
use crate::core::capture::RxSink;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Largest single receive
const RECV_CHUNK_SIZE: usize = 64 * 1024;

/// TCP connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
    /// Requested OS send/receive buffer size
    pub buffer_size: usize,
    /// Capture kernel receive timestamps where supported
    pub kernel_timestamps: bool,
}

impl SocketConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_secs: 10,
            buffer_size: MAX_DATA_BUFFER_SIZE,
            kernel_timestamps: true,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the OS buffer size
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Enable or disable kernel timestamps
    #[must_use]
    pub fn kernel_timestamps(mut self, enable: bool) -> Self {
        self.kernel_timestamps = enable;
        self
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::new("localhost", 30201)
    }
}

/// TCP transport, optionally with separate input and output connections
pub struct SocketTransport {
    info: String,
    stream_out: TcpStream,
    /// Separate input connection; `None` when input and output share one
    stream_in: Option<TcpStream>,
    kernel_timestamps: bool,
    rx_sink: Option<Box<dyn RxSink>>,
    last_rx_time: Option<DateTime<Utc>>,
    stats: TransportStats,
    peer_closed: bool,
    stopped: bool,
}

impl SocketTransport {
    /// Connect to `host:port`
    pub fn connect(config: &SocketConfig, rx_sink: Option<Box<dyn RxSink>>) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("Connecting to tcp://{}.", addr);

        let timeout = Duration::from_secs(config.timeout_secs);
        let mut last_error = None;
        for candidate in addr
            .to_socket_addrs()
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?
        {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return Self::from_streams(stream, None, config, rx_sink),
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => TransportError::ConnectionFailed(format!("{addr}: {e}")),
            None => TransportError::ConnectionFailed(format!("{addr}: no addresses resolved")),
        })
    }

    /// Wrap already connected streams; `stream_in` defaults to `stream_out`
    pub fn from_streams(
        stream_out: TcpStream,
        stream_in: Option<TcpStream>,
        config: &SocketConfig,
        rx_sink: Option<Box<dyn RxSink>>,
    ) -> Result<Self, TransportError> {
        let info = match stream_out.peer_addr() {
            Ok(peer) => format!("tcp://{peer}"),
            Err(_) => format!("tcp://{}:{}", config.host, config.port),
        };

        stream_out.set_nodelay(true)?;
        let input = stream_in.as_ref().unwrap_or(&stream_out);
        let kernel_timestamps = sys::configure(input, config.buffer_size, config.kernel_timestamps)?;
        debug!(
            "Socket configured. [buffer_size={} B, kernel_timestamps={}]",
            config.buffer_size, kernel_timestamps
        );

        Ok(Self {
            info,
            stream_out,
            stream_in,
            kernel_timestamps,
            rx_sink,
            last_rx_time: None,
            stats: TransportStats::default(),
            peer_closed: false,
            stopped: false,
        })
    }

    fn input(&self) -> &TcpStream {
        self.stream_in.as_ref().unwrap_or(&self.stream_out)
    }
}

impl Transport for SocketTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::NotConnected);
        }
        debug!("TX {}", hex::encode(data));
        self.stream_out.write_all(data)?;
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    fn read(&mut self, max_len: usize, timeout: Duration, return_any: bool) -> Result<Bytes, TransportError> {
        if self.stopped {
            return Err(TransportError::NotConnected);
        }
        if self.peer_closed {
            return Err(TransportError::Disconnected);
        }

        let deadline = Instant::now() + timeout;
        let mut out = BytesMut::new();
        let mut buf = vec![0u8; max_len.min(RECV_CHUNK_SIZE)];
        while out.len() < max_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let want = (max_len - out.len()).min(buf.len());
            let Some((n, kernel_ts)) = sys::recv(self.input(), &mut buf[..want], remaining, self.kernel_timestamps)?
            else {
                break;
            };

            if n == 0 {
                debug!("Connection closed by peer. [{}]", self.info);
                self.peer_closed = true;
                if out.is_empty() {
                    return Err(TransportError::Disconnected);
                }
                break;
            }

            let data = &buf[..n];
            mirror_rx(&mut self.rx_sink, data, kernel_ts);
            self.last_rx_time = Some(kernel_ts.unwrap_or_else(Utc::now));
            self.stats.bytes_received += n as u64;
            out.extend_from_slice(data);

            if return_any || Instant::now() >= deadline {
                break;
            }
        }
        Ok(out.freeze())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        if self.stopped {
            return Ok(());
        }
        match self.flush_rx() {
            Ok(_) | Err(TransportError::Disconnected) => {}
            Err(e) => warn!("Error flushing socket before close: {}", e),
        }
        self.stopped = true;

        for stream in std::iter::once(&self.stream_out).chain(self.stream_in.as_ref()) {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!("Error shutting down socket: {}", e);
                }
            }
        }
        if let Some(sink) = self.rx_sink.as_mut() {
            sink.flush()?;
        }
        info!("Socket transport stopped. [{}]", self.info);
        Ok(())
    }

    fn last_rx_time(&self) -> Option<DateTime<Utc>> {
        self.last_rx_time
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error stopping socket transport during drop: {}", e);
        }
    }
}

#[cfg(unix)]
mod sys {
    use chrono::{DateTime, Utc};
    use std::io;
    use std::mem;
    use std::net::TcpStream;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;
    use tracing::{debug, warn};

    fn set_option(stream: &TcpStream, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        // SAFETY: `value` outlives the call and the length matches its type.
        let ret = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                name,
                (&value as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Enlarge the socket buffers and enable timestamps; returns whether timestamps are on.
    pub(super) fn configure(stream: &TcpStream, buffer_size: usize, timestamps: bool) -> io::Result<bool> {
        let size = libc::c_int::try_from(buffer_size).unwrap_or(libc::c_int::MAX);
        for (name, option) in [("SO_RCVBUF", libc::SO_RCVBUF), ("SO_SNDBUF", libc::SO_SNDBUF)] {
            // Some platforms reject sizes above their limit instead of clamping.
            if let Err(e) = set_option(stream, option, size) {
                warn!("Unable to set {}. [requested={} B, error={}]", name, buffer_size, e);
            }
        }

        if !timestamps {
            return Ok(false);
        }
        match set_option(stream, libc::SO_TIMESTAMP, 1) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Kernel timestamps unavailable: {}", e);
                Ok(false)
            }
        }
    }

    fn wait_readable(stream: &TcpStream, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd { fd: stream.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: `pfd` is a single valid pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        match ret {
            0 => Ok(false),
            n if n > 0 => Ok(true),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Wait up to `timeout` and receive once; `None` means nothing arrived
    pub(super) fn recv(
        stream: &TcpStream,
        buf: &mut [u8],
        timeout: Duration,
        timestamps: bool,
    ) -> io::Result<Option<(usize, Option<DateTime<Utc>>)>> {
        if !wait_readable(stream, timeout)? {
            return Ok(None);
        }

        let mut iov = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };
        let mut control = [0u64; 16];
        // SAFETY: an all-zero msghdr is valid; every pointer set below outlives the call.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if timestamps {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = mem::size_of_val(&control) as _;
        }

        // SAFETY: `msg` points at live buffers sized as declared.
        let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            };
        }

        let kernel_ts = if timestamps { parse_timestamp(&msg) } else { None };
        Ok(Some((n as usize, kernel_ts)))
    }

    fn parse_timestamp(msg: &libc::msghdr) -> Option<DateTime<Utc>> {
        // SAFETY: `msg` was filled by a successful recvmsg; the CMSG macros stay
        // within `msg_controllen`.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_TIMESTAMP {
                    let tv = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timeval);
                    return DateTime::from_timestamp(tv.tv_sec as i64, (tv.tv_usec as u32) * 1000);
                }
                cmsg = libc::CMSG_NXTHDR(msg, cmsg);
            }
        }
        None
    }
}

#[cfg(not(unix))]
mod sys {
    use chrono::{DateTime, Utc};
    use std::io::{self, Read};
    use std::net::TcpStream;
    use std::time::Duration;
    use tracing::debug;

    pub(super) fn configure(_stream: &TcpStream, buffer_size: usize, _timestamps: bool) -> io::Result<bool> {
        debug!("Socket buffer sizing not supported on this platform. [requested={} B]", buffer_size);
        Ok(false)
    }

    pub(super) fn recv(
        stream: &TcpStream,
        buf: &mut [u8],
        timeout: Duration,
        _timestamps: bool,
    ) -> io::Result<Option<(usize, Option<DateTime<Utc>>)>> {
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut reader = stream;
        match reader.read(buf) {
            Ok(n) => Ok(Some((n, None))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::WriterSink;
    use parking_lot::Mutex;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Connected (client, server) pair on loopback
    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_read_write() {
        let (client, mut server) = pair();
        let mut transport = SocketTransport::from_streams(client, None, &SocketConfig::default(), None).unwrap();

        transport.write(b"ping").unwrap();
        let mut buf = [0u8; 4];
        io::Read::read_exact(&mut server, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").unwrap();
        let data = transport.read(4, Duration::from_secs(2), false).unwrap();
        assert_eq!(data.as_ref(), b"pong");
        let data = transport.read(100, Duration::from_secs(2), true).unwrap();
        assert_eq!(data.as_ref(), b"!");
        assert!(transport.last_rx_time().is_some());
    }

    #[test]
    fn test_read_timeout_is_not_an_error() {
        let (client, _server) = pair();
        let mut transport = SocketTransport::from_streams(client, None, &SocketConfig::default(), None).unwrap();
        let start = Instant::now();
        assert!(transport.read(10, Duration::from_millis(50), false).unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_flush_and_mirror() {
        let (client, mut server) = pair();
        let log = SharedBuf::default();
        let sink: Box<dyn RxSink> = Box::new(WriterSink::new(log.clone()));
        let mut transport = SocketTransport::from_streams(client, None, &SocketConfig::default(), Some(sink)).unwrap();

        server.write_all(b"stale data").unwrap();
        // Let the bytes reach the client socket.
        assert_eq!(transport.read(1, Duration::from_secs(2), false).unwrap().as_ref(), b"s");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(transport.flush_rx().unwrap(), 9);

        server.write_all(b"fresh").unwrap();
        assert_eq!(transport.read(5, Duration::from_secs(2), false).unwrap().as_ref(), b"fresh");
        assert_eq!(log.0.lock().as_slice(), b"stale datafresh");
    }

    #[test]
    fn test_peer_close() {
        let (client, mut server) = pair();
        let mut transport = SocketTransport::from_streams(client, None, &SocketConfig::default(), None).unwrap();
        server.write_all(b"bye").unwrap();
        drop(server);

        assert_eq!(transport.read(100, Duration::from_secs(1), false).unwrap().as_ref(), b"bye");
        assert!(matches!(
            transport.read(100, Duration::from_millis(10), false),
            Err(TransportError::Disconnected)
        ));
        transport.stop().unwrap();
        transport.stop().unwrap();
    }

    #[test]
    fn test_separate_input_stream() {
        let (out_client, mut out_server) = pair();
        let (in_client, mut in_server) = pair();
        let mut transport =
            SocketTransport::from_streams(out_client, Some(in_client), &SocketConfig::default(), None).unwrap();

        transport.write(b"cmd").unwrap();
        let mut buf = [0u8; 3];
        io::Read::read_exact(&mut out_server, &mut buf).unwrap();
        assert_eq!(&buf, b"cmd");

        in_server.write_all(b"data").unwrap();
        assert_eq!(transport.read(4, Duration::from_secs(2), false).unwrap().as_ref(), b"data");
    }
}

//! Serial port transport implementation
//!
//! OS serial buffers are only a few KB deep, so a dedicated reader thread
//! drains the port continuously into a channel. The foreground side pulls
//! chunks out of the channel on `read()`. When the consumer stalls and more
//! than `max_buffer_size` bytes are queued, the reader thread discards the
//! oldest chunks until at least `drop_size` bytes have been freed.

use super::{mirror_rx, Transport, TransportError, TransportStats, TransportType, RX_BYTE_TIMEOUT};
use crate::core::capture::RxSink;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Size of a single OS read performed by the reader thread
const READ_CHUNK_SIZE: usize = 4096;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Receive buffer cap before the oldest data is dropped
    pub max_buffer_size: usize,
    /// Bytes freed each time the cap is exceeded
    pub drop_size: usize,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            max_buffer_size: super::MAX_DATA_BUFFER_SIZE,
            drop_size: super::DATA_BUFFER_DROP_SIZE,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Set the receive buffer cap
    #[must_use]
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set how much is dropped on overflow
    #[must_use]
    pub fn drop_size(mut self, size: usize) -> Self {
        self.drop_size = size;
        self
    }

    fn connection_info(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{} {})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
            match self.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 460_800)
    }
}

/// Counters shared between the reader thread and the foreground
#[derive(Debug, Default)]
struct RxCounters {
    /// Bytes currently queued in the channel
    buffered: AtomicUsize,
    /// Bytes discarded by the drop-oldest policy
    dropped: AtomicU64,
}

/// Serial port transport
pub struct SerialTransport {
    info: String,
    writer: Box<dyn Write + Send>,
    rx: Receiver<Bytes>,
    /// Partially consumed chunk taken from the channel
    pending: Bytes,
    counters: Arc<RxCounters>,
    stop_signal: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    rx_sink: Option<Box<dyn RxSink>>,
    last_rx_time: Option<DateTime<Utc>>,
    stats: TransportStats,
    stopped: bool,
}

impl SerialTransport {
    /// Open a serial port and start the reader thread
    pub fn open(config: &SerialConfig, rx_sink: Option<Box<dyn RxSink>>) -> Result<Self, TransportError> {
        info!("Opening serial port: {}", config.connection_info());

        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(RX_BYTE_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(config.port.clone()),
                serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        let reader = port
            .try_clone()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Self::start(reader, port, config, config.connection_info(), rx_sink))
    }

    /// Run the transport over arbitrary blocking I/O halves.
    ///
    /// `reader` should return `TimedOut`/`WouldBlock` periodically so `stop()`
    /// can join the reader thread; `Ok(0)` is treated as end of stream.
    pub fn from_io<R, W>(reader: R, writer: W, config: &SerialConfig, rx_sink: Option<Box<dyn RxSink>>) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::start(reader, writer, config, format!("{} (custom I/O)", config.port), rx_sink)
    }

    fn start<R, W>(reader: R, writer: W, config: &SerialConfig, info: String, rx_sink: Option<Box<dyn RxSink>>) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let counters = Arc::new(RxCounters::default());
        let stop_signal = Arc::new(AtomicBool::new(false));

        let thread_rx = rx.clone();
        let thread_counters = Arc::clone(&counters);
        let thread_stop = Arc::clone(&stop_signal);
        let limits = (config.max_buffer_size, config.drop_size);
        let reader_thread = thread::spawn(move || {
            Self::reader_loop(reader, tx, thread_rx, thread_counters, thread_stop, limits);
        });

        Self {
            info,
            writer: Box::new(writer),
            rx,
            pending: Bytes::new(),
            counters,
            stop_signal,
            reader_thread: Some(reader_thread),
            rx_sink,
            last_rx_time: None,
            stats: TransportStats::default(),
            stopped: false,
        }
    }

    fn reader_loop<R: Read>(
        mut reader: R,
        tx: Sender<Bytes>,
        drop_rx: Receiver<Bytes>,
        counters: Arc<RxCounters>,
        stop_signal: Arc<AtomicBool>,
        (max_buffer_size, drop_size): (usize, usize),
    ) {
        debug!("Reader thread started.");
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        while !stop_signal.load(Ordering::Relaxed) {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("Serial stream closed.");
                    break;
                }
                Ok(n) => {
                    trace!("RX thread got data. [size={} B]", n);
                    let buffered = counters.buffered.fetch_add(n, Ordering::SeqCst) + n;
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }

                    if buffered > max_buffer_size {
                        let mut dropped = 0;
                        while dropped < drop_size {
                            match drop_rx.try_recv() {
                                Ok(chunk) => {
                                    counters.buffered.fetch_sub(chunk.len(), Ordering::SeqCst);
                                    dropped += chunk.len();
                                }
                                Err(_) => break,
                            }
                        }
                        counters.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                        error!(
                            "Serial RX buffer full. Dropping oldest data. [buffer_size={} B, dropped={} B]",
                            max_buffer_size, dropped
                        );
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Error reading from serial port: {}", e);
                    break;
                }
            }
        }
        debug!("Reader thread finished.");
    }

    /// Bytes queued by the reader thread and not yet read
    pub fn buffered(&self) -> usize {
        self.counters.buffered.load(Ordering::SeqCst) + self.pending.len()
    }

    fn take_chunk(&mut self, chunk: Bytes) {
        self.counters.buffered.fetch_sub(chunk.len(), Ordering::SeqCst);
        self.pending = chunk;
    }

    /// Make `pending` non-empty, waiting until `deadline`.
    ///
    /// Returns `Ok(false)` on timeout and `Err(Disconnected)` once the reader
    /// thread has exited and the channel is drained.
    fn fill_pending(&mut self, deadline: Instant) -> Result<bool, TransportError> {
        while self.pending.is_empty() {
            match self.rx.try_recv() {
                Ok(chunk) => self.take_chunk(chunk),
                Err(TryRecvError::Disconnected) => return Err(TransportError::Disconnected),
                Err(TryRecvError::Empty) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    match self.rx.recv_timeout((deadline - now).min(RX_BYTE_TIMEOUT)) {
                        Ok(chunk) => self.take_chunk(chunk),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
                    }
                }
            }
        }
        Ok(true)
    }

    fn deliver(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.last_rx_time = Some(Utc::now());
        self.stats.bytes_received += data.len() as u64;
        mirror_rx(&mut self.rx_sink, data, None);
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::NotConnected);
        }
        debug!("TX {}", hex::encode(data));
        self.writer.write_all(data)?;
        self.writer.flush()?;
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    fn read(&mut self, max_len: usize, timeout: Duration, return_any: bool) -> Result<Bytes, TransportError> {
        if self.stopped {
            return Err(TransportError::NotConnected);
        }

        let deadline = Instant::now() + timeout;
        let mut out = BytesMut::with_capacity(max_len.min(READ_CHUNK_SIZE));
        while out.len() < max_len {
            match self.fill_pending(deadline) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if out.is_empty() => return Err(e),
                // Hand over what was collected; the next call reports the disconnect.
                Err(_) => break,
            }

            let n = (max_len - out.len()).min(self.pending.len());
            out.extend_from_slice(&self.pending.split_to(n));
            if return_any {
                break;
            }
        }

        let data = out.freeze();
        self.deliver(&data);
        Ok(data)
    }

    fn flush_rx(&mut self) -> Result<usize, TransportError> {
        if self.stopped {
            return Err(TransportError::NotConnected);
        }

        let mut flushed = BytesMut::from(&self.pending[..]);
        self.pending = Bytes::new();
        while let Ok(chunk) = self.rx.try_recv() {
            self.counters.buffered.fetch_sub(chunk.len(), Ordering::SeqCst);
            flushed.extend_from_slice(&chunk);
        }

        debug!("Flushing data in buffer. [size={} B]", flushed.len());
        self.deliver(&flushed);
        Ok(flushed.len())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        if self.stopped {
            return Ok(());
        }
        self.flush_rx()?;
        self.stopped = true;

        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                warn!("Serial reader thread panicked.");
            }
        }
        if let Some(sink) = self.rx_sink.as_mut() {
            sink.flush()?;
        }
        info!("Serial transport stopped. [{}]", self.info);
        Ok(())
    }

    fn last_rx_time(&self) -> Option<DateTime<Utc>> {
        self.last_rx_time
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Serial
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_dropped: self.counters.dropped.load(Ordering::Relaxed),
            ..self.stats.clone()
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping serial transport during drop: {}", e);
        }
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

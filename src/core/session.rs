//! Device command/response session
//!
//! A [`DeviceSession`] owns a transport and the framers for its receive
//! stream. It sends commands and blocks, with a bounded deadline, until a
//! message of the expected type is framed. It also detects device reboots from
//! gaps in the receive traffic.

use super::protocol::{
    encode_nmea, encode_rtcm_frame, FrameOptions, FramedMessage, MessageId, NmeaFramer, Po4050, Po4050Control,
    Protocol, RtcmError, RtcmFramer, PO4050_MESSAGE_ID,
};
use super::transport::{Transport, TransportError};
use crate::config::SessionConfig;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Session errors. Timeouts are not errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outgoing message could not be encoded
    #[error("Encoding error: {0}")]
    Encode(#[from] RtcmError),
}

/// Extracts sequence numbers from received messages
#[cfg_attr(test, mockall::automock)]
pub trait SequenceTracker {
    /// Sequence number carried by `message`, if it has one
    fn sequence_number(&self, message: &FramedMessage) -> Option<u32>;
}

/// Synchronous request/response session over a transport
pub struct DeviceSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    nmea: NmeaFramer,
    rtcm: RtcmFramer,
    tracker: Option<Box<dyn SequenceTracker>>,
    expected_sequence: Option<u32>,
    sequence_gaps: u64,
}

impl<T: Transport> DeviceSession<T> {
    /// Create a session over an open transport
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            nmea: NmeaFramer::new(),
            rtcm: RtcmFramer::new(),
            tracker: None,
            expected_sequence: None,
            sequence_gaps: 0,
        }
    }

    /// Check sequence continuity of received messages
    #[must_use]
    pub fn with_sequence_tracker(mut self, tracker: Box<dyn SequenceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Session settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Release the transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Next sequence number expected from the device
    pub fn expected_sequence(&self) -> Option<u32> {
        self.expected_sequence
    }

    /// Sequence gaps seen so far
    pub fn sequence_gaps(&self) -> u64 {
        self.sequence_gaps
    }

    // ============ Sending ============

    /// Send bytes as-is
    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), SessionError> {
        trace!("{}", hex::encode(data));
        self.transport.write(data)?;
        Ok(())
    }

    /// Send an NMEA command; `$`, checksum and line ending are added
    pub fn send_nmea(&mut self, body: &str) -> Result<(), SessionError> {
        let encoded = encode_nmea(body);
        debug!(
            "Sending NMEA message. [{} ({} B)]",
            String::from_utf8_lossy(&encoded).trim_end(),
            encoded.len()
        );
        self.send_raw(&encoded)
    }

    /// Frame and send an RTCM payload that starts with its message number
    pub fn send_rtcm(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let frame = encode_rtcm_frame(payload)?;
        debug!("Sending RTCM message. [size={} B]", frame.len());
        self.send_raw(&frame)
    }

    /// Send a vendor 4050 message
    pub fn send_po4050(&mut self, message: &Po4050) -> Result<(), SessionError> {
        debug!("Sending 4050 message. [{:?}]", message);
        self.send_rtcm(&message.encode())
    }

    // ============ Receiving ============

    /// Discard everything received so far
    pub fn flush_rx(&mut self) -> Result<usize, SessionError> {
        let flushed = self.transport.flush_rx()?;
        debug!("Flushed receive data. [size={} B]", flushed);
        Ok(flushed)
    }

    /// Wait up to `timeout` for a message of type `id`.
    ///
    /// Bytes are read one at a time and fed only to the framer for the
    /// protocol of `id`. Returns `Ok(None)` on timeout.
    pub fn wait_for(&mut self, id: &MessageId, timeout: Duration) -> Result<Option<FramedMessage>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!("Timed out waiting for {} message {}.", id.protocol(), id);
                return Ok(None);
            }

            let poll = (deadline - now).min(self.config.rx_byte_timeout());
            let data = self.transport.read(1, poll, false)?;
            if data.is_empty() {
                continue;
            }

            let messages = match id.protocol() {
                Protocol::Nmea => self.nmea.on_data(&data),
                Protocol::Rtcm3 => self.rtcm.on_data(&data, FrameOptions::default()),
            };
            for message in messages {
                self.track_sequence(&message);
                if message.type_id == *id {
                    debug!(
                        "Response: {} message {}. [size={} B]",
                        message.protocol(),
                        message.type_id,
                        message.byte_length
                    );
                    trace!("{}", hex::encode(&message.payload));
                    return Ok(Some(message));
                }
            }
        }
    }

    /// Wait for a 4050 control response and return its code
    pub fn wait_for_po4050_response(&mut self, timeout: Duration) -> Result<Option<u8>, SessionError> {
        let deadline = Instant::now() + timeout;
        let id = MessageId::Rtcm(PO4050_MESSAGE_ID);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = self.wait_for(&id, remaining)? else {
                return Ok(None);
            };
            match Po4050::decode(&message.payload) {
                Some(Po4050::Control(Po4050Control::Response { code })) => return Ok(Some(code)),
                other => trace!("Ignoring 4050 message while waiting for response. [{:?}]", other),
            }
        }
    }

    /// Detect a device reboot from a gap in receive traffic.
    ///
    /// The device must already be sending periodic data. After flushing, the
    /// session waits up to `stop_timeout` for a silence of at least the
    /// configured minimum, then up to `resume_timeout` for data to return.
    /// Framers and sequence tracking restart once the silence is observed.
    pub fn wait_for_reboot(&mut self, stop_timeout: Duration, resume_timeout: Duration) -> Result<bool, SessionError> {
        let start = Instant::now();
        let min_silence = self.config.reboot_min_silence();
        self.flush_rx()?;

        debug!("Waiting for data to stop.");
        let mut reboot_started = false;
        while !reboot_started && start.elapsed() < stop_timeout {
            reboot_started = self.transport.read(1, min_silence, false)?.is_empty();
        }
        if !reboot_started {
            warn!("No reboot start detected.");
            return Ok(false);
        }

        // A fresh boot restarts framing and sequence numbering.
        self.nmea.reset();
        self.rtcm.reset();
        self.expected_sequence = None;

        debug!("Waiting for data to resume.");
        let resumed = !self.transport.read(1, resume_timeout, false)?.is_empty();
        if !resumed {
            warn!("Data didn't resume after reboot.");
        }
        Ok(resumed)
    }

    /// [`Self::wait_for_reboot`] with the configured timeouts
    pub fn wait_for_reboot_default(&mut self) -> Result<bool, SessionError> {
        let (stop, resume) = (self.config.reboot_stop_timeout(), self.config.reboot_resume_timeout());
        self.wait_for_reboot(stop, resume)
    }

    fn track_sequence(&mut self, message: &FramedMessage) {
        let Some(sequence) = self.tracker.as_ref().and_then(|t| t.sequence_number(message)) else {
            return;
        };
        if let Some(expected) = self.expected_sequence {
            if sequence != expected {
                self.sequence_gaps += 1;
                warn!("Sequence number gap. [expected={}, received={}]", expected, sequence);
            }
        }
        self.expected_sequence = Some(sequence.wrapping_add(1));
    }

    /// Stop the transport
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.transport.stop()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{TransportStats, TransportType};
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::thread;

    /// Delivers bytes at fixed times after creation
    struct ScriptedTransport {
        start: Instant,
        schedule: VecDeque<(Duration, u8)>,
        written: Vec<u8>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self { start: Instant::now(), schedule: VecDeque::new(), written: Vec::new() }
        }

        fn at(mut self, at_ms: u64, data: &[u8]) -> Self {
            self.schedule.extend(data.iter().map(|&b| (Duration::from_millis(at_ms), b)));
            self.schedule.make_contiguous().sort_by_key(|(at, _)| *at);
            self
        }

        /// One byte every `period_ms` in `[from_ms, to_ms)`
        fn periodic(mut self, from_ms: u64, to_ms: u64, period_ms: u64) -> Self {
            self.schedule
                .extend((from_ms..to_ms).step_by(period_ms as usize).map(|t| (Duration::from_millis(t), 0x55)));
            self.schedule.make_contiguous().sort_by_key(|(at, _)| *at);
            self
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read(&mut self, max_len: usize, timeout: Duration, _return_any: bool) -> Result<Bytes, TransportError> {
            let deadline = self.start.elapsed() + timeout;
            loop {
                let now = self.start.elapsed();
                let ready = self.schedule.iter().take(max_len).take_while(|(at, _)| *at <= now).count();
                if ready > 0 {
                    return Ok(self.schedule.drain(..ready).map(|(_, b)| b).collect());
                }
                match self.schedule.front() {
                    Some((at, _)) if *at <= deadline => thread::sleep(at.saturating_sub(now)),
                    _ => {
                        thread::sleep(deadline.saturating_sub(now));
                        return Ok(Bytes::new());
                    }
                }
            }
        }

        fn stop(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn last_rx_time(&self) -> Option<DateTime<Utc>> {
            None
        }

        fn transport_type(&self) -> TransportType {
            TransportType::Serial
        }

        fn connection_info(&self) -> String {
            "scripted".to_string()
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    const RESPONSE_MESSAGE: &[u8] = b"\xD3\x00\x05\xFD\x20\x02\x01\x02\x80\xED\xA8";

    fn config() -> SessionConfig {
        SessionConfig::default().reboot_timeouts(1.0, 0.04, 0.5)
    }

    #[test]
    fn test_send_helpers() {
        let mut session = DeviceSession::new(ScriptedTransport::new(), config());
        session.send_nmea("PQTMVERNO").unwrap();
        session.send_po4050(&Po4050::Control(Po4050Control::Reset { mask: 0x3 })).unwrap();
        let mut expected = encode_nmea("PQTMVERNO");
        expected.extend_from_slice(b"\xD3\x00\x08\xFD\x20\x02\x02\x00\x00\x00\x03\x1B\x27\x7D");
        assert_eq!(session.transport().written, expected);

        assert!(matches!(session.send_rtcm(&[0u8; 1024]), Err(SessionError::Encode(_))));
    }

    #[test]
    fn test_wait_for_matching_message() {
        let mut stream = encode_nmea("GPGGA,1,2,3");
        stream.extend_from_slice(RESPONSE_MESSAGE);
        let transport = ScriptedTransport::new().at(0, &stream);
        let mut session = DeviceSession::new(transport, config());

        let message = session.wait_for(&MessageId::Rtcm(4050), Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(message.type_id, MessageId::Rtcm(4050));
        assert!(session.wait_for(&MessageId::nmea("GPGGA"), Duration::from_millis(50)).unwrap().is_none());
    }

    #[test]
    fn test_wait_for_po4050_response() {
        let transport = ScriptedTransport::new().at(10, RESPONSE_MESSAGE);
        let mut session = DeviceSession::new(transport, config());
        // Response code byte is 0x02 in this vector.
        assert_eq!(session.wait_for_po4050_response(Duration::from_secs(1)).unwrap(), Some(2));
    }

    #[test]
    fn test_wait_for_times_out() {
        let mut session = DeviceSession::new(ScriptedTransport::new(), config());
        let start = Instant::now();
        assert!(session.wait_for(&MessageId::nmea("$GPGGA"), Duration::from_millis(150)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_reboot_detected() {
        let transport = ScriptedTransport::new().periodic(0, 150, 5).periodic(350, 600, 5);
        let mut tracker = MockSequenceTracker::new();
        tracker.expect_sequence_number().returning(|_| Some(7));

        let mut stream = encode_nmea("GPGGA,1");
        stream.extend_from_slice(&encode_nmea("GPGGA,2"));
        let transport = transport.at(0, &stream);
        let mut session = DeviceSession::new(transport, config()).with_sequence_tracker(Box::new(tracker));

        session.wait_for(&MessageId::nmea("GPGGA"), Duration::from_secs(1)).unwrap().unwrap();
        session.wait_for(&MessageId::nmea("GPGGA"), Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(session.expected_sequence(), Some(8));
        assert_eq!(session.sequence_gaps(), 1);

        assert!(session.wait_for_reboot(Duration::from_secs(1), Duration::from_millis(500)).unwrap());
        assert_eq!(session.expected_sequence(), None);
    }

    #[test]
    fn test_no_silence_means_no_reboot() {
        let transport = ScriptedTransport::new().periodic(0, 1000, 5);
        let mut session = DeviceSession::new(transport, config());
        assert!(!session.wait_for_reboot(Duration::from_millis(200), Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_no_resume_means_failed_reboot() {
        let transport = ScriptedTransport::new().periodic(0, 100, 5);
        let mut session = DeviceSession::new(transport, config());
        assert!(!session.wait_for_reboot(Duration::from_secs(1), Duration::from_millis(100)).unwrap());
    }
}

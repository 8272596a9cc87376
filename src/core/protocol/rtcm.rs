//! RTCM3 stream framer
//!
//! Frame layout:
//!
//! ```text
//! +------+--------------------+-------------------------+---------+
//! | 0xD3 | 6b rsvd | 10b len  | payload (len bytes)     | CRC-24Q |
//! +------+--------------------+-------------------------+---------+
//!                               ^ first 12 bits = message number
//! ```
//!
//! The framer searches for the preamble, waits for the header, waits for the
//! full frame and validates the CRC over header + payload. On a CRC failure it
//! drops exactly one byte and searches again, so a `0xD3` inside a corrupted
//! frame can never hide the real start of the next one.

use super::checksum::crc24q;
use super::{FramedMessage, MessageId};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

/// Frame preamble
pub const RTCM3_PREAMBLE: u8 = 0xD3;
/// Preamble + length field
pub const RTCM3_HEADER_LENGTH: usize = 3;
/// CRC-24Q trailer
pub const RTCM3_CRC_LENGTH: usize = 3;
/// Largest payload the 10-bit length field can describe
pub const RTCM3_MAX_PAYLOAD_LENGTH: usize = (1 << 10) - 1;
/// Largest possible frame
pub const RTCM3_MAX_LENGTH: usize = RTCM3_HEADER_LENGTH + RTCM3_MAX_PAYLOAD_LENGTH + RTCM3_CRC_LENGTH;

/// Vendor message number carrying control/diagnostic sub-messages
pub const PO4050_MESSAGE_ID: u16 = 4050;

/// RTCM encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcmError {
    /// Payload does not fit the 10-bit length field
    #[error("Payload too long: {0} bytes (max {max})", max = RTCM3_MAX_PAYLOAD_LENGTH)]
    PayloadTooLong(usize),
    /// Payload too short to hold a message number
    #[error("Payload too short: {0} bytes")]
    PayloadTooShort(usize),
}

/// Optional outputs attached to each framed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameOptions {
    /// Attach the stream offset of the frame's preamble
    pub offset: bool,
    /// Attach the complete frame bytes
    pub raw: bool,
}

impl FrameOptions {
    /// Request every optional output
    pub fn all() -> Self {
        Self { offset: true, raw: true }
    }
}

#[derive(Debug, Clone, Copy)]
struct RtcmHeader {
    payload_length: usize,
    message_id: u16,
}

impl RtcmHeader {
    /// Needs `RTCM3_HEADER_LENGTH + 2` bytes; the message number is peeked from the payload.
    fn parse(bytes: &[u8]) -> Self {
        let payload_length = (usize::from(bytes[1] & 0x03) << 8) | usize::from(bytes[2]);
        let message_id = (u16::from(bytes[3]) << 4) | u16::from(bytes[4] >> 4);
        Self { payload_length, message_id }
    }

    fn frame_length(&self) -> usize {
        RTCM3_HEADER_LENGTH + self.payload_length + RTCM3_CRC_LENGTH
    }
}

/// Streaming RTCM3 framer
#[derive(Debug, Default)]
pub struct RtcmFramer {
    /// Unconsumed bytes, starting at a preamble once `preamble_found` is set
    buffer: Vec<u8>,
    preamble_found: bool,
    header: Option<RtcmHeader>,
    /// Stream offset of `buffer[0]`
    total_data_offset: u64,
}

impl RtcmFramer {
    /// Create a new framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial frame and return to preamble search.
    ///
    /// Discarded bytes still count toward the stream offset.
    pub fn reset(&mut self) {
        self.total_data_offset += self.buffer.len() as u64;
        self.buffer.clear();
        self.preamble_found = false;
        self.header = None;
    }

    /// Total bytes consumed so far, including buffered bytes
    pub fn bytes_consumed(&self) -> u64 {
        self.total_data_offset + self.buffer.len() as u64
    }

    /// Add data and return every complete frame with a valid CRC
    pub fn on_data(&mut self, data: &[u8], options: FrameOptions) -> Vec<FramedMessage> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut pos = 0;
        loop {
            if !self.preamble_found {
                match self.buffer[pos..].iter().position(|&b| b == RTCM3_PREAMBLE) {
                    Some(skip) => {
                        pos += skip;
                        self.preamble_found = true;
                        trace!("Found preamble. [skipped={} B]", skip);
                    }
                    None => {
                        trace!("Skipping {} bytes searching for preamble.", self.buffer.len() - pos);
                        pos = self.buffer.len();
                        break;
                    }
                }
            }

            let available = self.buffer.len() - pos;
            if available < RTCM3_HEADER_LENGTH + 2 {
                break;
            }

            let header = match self.header {
                Some(header) => header,
                None => {
                    let header = RtcmHeader::parse(&self.buffer[pos..]);
                    debug!(
                        "Received RTCM {} message header. Waiting for payload. [payload_size={} B]",
                        header.message_id, header.payload_length
                    );
                    self.header = Some(header);
                    header
                }
            };

            let frame_length = header.frame_length();
            if available < frame_length {
                break;
            }

            let frame = &self.buffer[pos..pos + frame_length];
            let content_length = frame_length - RTCM3_CRC_LENGTH;
            let expected_crc = crc24q(&frame[..content_length]);
            let crc_bytes = &frame[content_length..];
            let received_crc =
                (u32::from(crc_bytes[0]) << 16) | (u32::from(crc_bytes[1]) << 8) | u32::from(crc_bytes[2]);

            if expected_crc == received_crc {
                debug!(
                    "CRC passed. Dispatching message. [message={}, size={} B, checksum=0x{:06X}]",
                    header.message_id, frame_length, received_crc
                );
                trace!("{}", hex::encode_upper(frame));
                let offset = self.total_data_offset + pos as u64;
                messages.push(FramedMessage {
                    type_id: MessageId::Rtcm(header.message_id),
                    payload: Bytes::copy_from_slice(&frame[RTCM3_HEADER_LENGTH..content_length]),
                    byte_offset: options.offset.then_some(offset),
                    byte_length: frame_length,
                    raw: options.raw.then(|| Bytes::copy_from_slice(frame)),
                });
                pos += frame_length;
            } else {
                debug!(
                    "CRC check failed, resyncing. [message={}, size={} B, crc=0x{:06X}, expected=0x{:06X}]",
                    header.message_id, frame_length, received_crc, expected_crc
                );
                // The real frame may start one byte later.
                pos += 1;
            }

            self.header = None;
            self.preamble_found = false;
        }

        self.buffer.drain(..pos);
        self.total_data_offset += pos as u64;
        messages
    }
}

/// Build a complete frame around `payload`, whose first 12 bits are the message number
pub fn encode_rtcm_frame(payload: &[u8]) -> Result<Vec<u8>, RtcmError> {
    if payload.len() > RTCM3_MAX_PAYLOAD_LENGTH {
        return Err(RtcmError::PayloadTooLong(payload.len()));
    }
    if payload.len() < 2 {
        return Err(RtcmError::PayloadTooShort(payload.len()));
    }

    let length = payload.len() as u16;
    let mut frame = BytesMut::with_capacity(RTCM3_HEADER_LENGTH + payload.len() + RTCM3_CRC_LENGTH);
    frame.put_u8(RTCM3_PREAMBLE);
    frame.put_u16(length & 0x03FF);
    frame.put_slice(payload);
    let crc = crc24q(&frame);
    frame.put_uint(u64::from(crc), RTCM3_CRC_LENGTH);
    Ok(frame.to_vec())
}

// ============ Vendor 4050 message ============

/// Sub-type byte of a 4050 message
mod sub_type {
    pub const DIAG: u8 = 1;
    pub const CONTROL: u8 = 2;
}

/// Control-type byte of a 4050 control message
mod control_type {
    pub const RESPONSE: u8 = 1;
    pub const RESET: u8 = 2;
}

/// Reset mask bits for [`Po4050Control::Reset`]
pub mod reset_mask {
    /// Clear the navigation solution
    pub const NAVIGATION: u32 = 0x0000_0001;
    /// Clear stored ephemeris
    pub const EPHEMERIS: u32 = 0x0000_0002;
    /// Clear corrections
    pub const CORRECTIONS: u32 = 0x0000_0004;
    /// Software reboot
    pub const SOFTWARE: u32 = 0x00FF_FFFF;
}

/// Response code: success
pub const PO4050_RESPONSE_OK: u8 = 0;
/// Response code: failure
pub const PO4050_RESPONSE_ERROR: u8 = 1;

/// Diagnostic sub-message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Po4050DiagType {
    /// Unset
    Undefined,
    /// Version report
    Ver,
    /// Status report
    Status,
    /// Crash report
    ArmH7Crash,
    /// Unrecognized value
    Other(u8),
}

impl From<u8> for Po4050DiagType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Undefined,
            1 => Self::Ver,
            2 => Self::Status,
            3 => Self::ArmH7Crash,
            other => Self::Other(other),
        }
    }
}

impl From<Po4050DiagType> for u8 {
    fn from(v: Po4050DiagType) -> Self {
        match v {
            Po4050DiagType::Undefined => 0,
            Po4050DiagType::Ver => 1,
            Po4050DiagType::Status => 2,
            Po4050DiagType::ArmH7Crash => 3,
            Po4050DiagType::Other(other) => other,
        }
    }
}

/// Control sub-message of a 4050 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Po4050Control {
    /// Device response to a command
    Response {
        /// [`PO4050_RESPONSE_OK`], [`PO4050_RESPONSE_ERROR`] or a device-specific code
        code: u8,
    },
    /// Reset request
    Reset {
        /// Combination of [`reset_mask`] bits
        mask: u32,
    },
    /// Unrecognized control type, contents kept verbatim
    Other {
        /// Raw control type
        control_type: u8,
        /// Bytes following the control type
        contents: Bytes,
    },
}

/// Decoded vendor 4050 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Po4050 {
    /// Control sub-message
    Control(Po4050Control),
    /// Diagnostic sub-message; contents are not interpreted
    Diag {
        /// Diagnostic kind
        diag_type: Po4050DiagType,
        /// Bytes following the diagnostic type
        contents: Bytes,
    },
    /// Unrecognized sub-type, contents kept verbatim
    Other {
        /// Raw sub-type
        sub_type: u8,
        /// Bytes following the sub-type
        contents: Bytes,
    },
}

impl Po4050 {
    /// Decode an RTCM payload (starting with the 12-bit message number)
    pub fn decode(payload: &Bytes) -> Option<Self> {
        if payload.len() < 3 || message_number(payload) != Some(PO4050_MESSAGE_ID) {
            return None;
        }

        let sub = payload[2];
        let rest = payload.slice(3..);
        match sub {
            sub_type::CONTROL => {
                let (&kind, body) = rest.split_first()?;
                let control = match kind {
                    control_type::RESPONSE => Po4050Control::Response { code: *body.first()? },
                    control_type::RESET => {
                        let mask: [u8; 4] = body.get(..4)?.try_into().ok()?;
                        Po4050Control::Reset { mask: u32::from_be_bytes(mask) }
                    }
                    _ => Po4050Control::Other { control_type: kind, contents: rest.slice(1..) },
                };
                Some(Self::Control(control))
            }
            sub_type::DIAG => {
                let (&kind, _) = rest.split_first()?;
                Some(Self::Diag { diag_type: kind.into(), contents: rest.slice(1..) })
            }
            _ => Some(Self::Other { sub_type: sub, contents: rest }),
        }
    }

    /// Encode as an RTCM payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(16);
        // 12-bit message number followed by 4 bits of padding.
        out.put_u16(PO4050_MESSAGE_ID << 4);
        match self {
            Self::Control(control) => {
                out.put_u8(sub_type::CONTROL);
                match control {
                    Po4050Control::Response { code } => {
                        out.put_u8(control_type::RESPONSE);
                        out.put_u8(*code);
                    }
                    Po4050Control::Reset { mask } => {
                        out.put_u8(control_type::RESET);
                        out.put_u32(*mask);
                    }
                    Po4050Control::Other { control_type, contents } => {
                        out.put_u8(*control_type);
                        out.put_slice(contents);
                    }
                }
            }
            Self::Diag { diag_type, contents } => {
                out.put_u8(sub_type::DIAG);
                out.put_u8((*diag_type).into());
                out.put_slice(contents);
            }
            Self::Other { sub_type, contents } => {
                out.put_u8(*sub_type);
                out.put_slice(contents);
            }
        }
        out.to_vec()
    }

    /// Encode as a complete RTCM frame
    pub fn to_frame(&self) -> Vec<u8> {
        // 4050 payloads never approach the length limit unless `contents` does.
        match encode_rtcm_frame(&self.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Unable to frame 4050 message: {}", e);
                Vec::new()
            }
        }
    }
}

/// 12-bit message number at the start of an RTCM payload
pub fn message_number(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some((u16::from(*hi) << 4) | u16::from(*lo >> 4)),
        _ => None,
    }
}

/// Structured view of an RTCM payload.
///
/// Only message types with a registered decoder get a structured variant;
/// everything else stays opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcmPayload {
    /// Vendor 4050 message
    Po4050(Po4050),
    /// Any other message, untouched
    Opaque(Bytes),
}

impl RtcmPayload {
    /// Decode a payload according to its message number
    pub fn decode(message_id: u16, payload: &Bytes) -> Self {
        let decoded = match message_id {
            PO4050_MESSAGE_ID => Po4050::decode(payload).map(Self::Po4050),
            _ => None,
        };
        decoded.unwrap_or_else(|| Self::Opaque(payload.clone()))
    }

    /// Decode the payload of an RTCM framed message; `None` for other protocols
    pub fn from_message(message: &FramedMessage) -> Option<Self> {
        match message.type_id {
            MessageId::Rtcm(id) => Some(Self::decode(id, &message.payload)),
            MessageId::Nmea(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4050 control reset message: navigation + ephemeris.
    const RESET_MESSAGE: &[u8] = b"\xD3\x00\x08\xFD\x20\x02\x02\x00\x00\x00\x03\x1B\x27\x7D";
    /// 4050 control response message.
    const RESPONSE_MESSAGE: &[u8] = b"\xD3\x00\x05\xFD\x20\x02\x01\x02\x80\xED\xA8";
    /// Message 999, no registered decoder.
    const ST999_MESSAGE: &[u8] =
        b"\xD3\x00\x0E\x3E\x74\x01\xE9\xDD\xD5\xEF\x3F\xF9\x1F\xE5\x54\x23\x20\x83\x19\x7B";

    fn ids(messages: &[FramedMessage]) -> Vec<MessageId> {
        messages.iter().map(|m| m.type_id.clone()).collect()
    }

    fn decode_control(message: &FramedMessage) -> Po4050Control {
        match RtcmPayload::from_message(message) {
            Some(RtcmPayload::Po4050(Po4050::Control(control))) => control,
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_parse_4050_reset() {
        let mut framer = RtcmFramer::new();
        let results = framer.on_data(RESET_MESSAGE, FrameOptions::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].type_id, MessageId::Rtcm(4050));
        assert_eq!(results[0].byte_length, RESET_MESSAGE.len());
        assert_eq!(decode_control(&results[0]), Po4050Control::Reset { mask: 0x3 });
    }

    #[test]
    fn test_parse_unrecognized() {
        let mut framer = RtcmFramer::new();
        let results = framer.on_data(ST999_MESSAGE, FrameOptions::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].type_id, MessageId::Rtcm(999));
        assert_eq!(results[0].payload.as_ref(), &ST999_MESSAGE[3..ST999_MESSAGE.len() - 3]);
        assert_eq!(
            RtcmPayload::from_message(&results[0]),
            Some(RtcmPayload::Opaque(results[0].payload.clone()))
        );
    }

    #[test]
    fn test_build_4050_reset() {
        let message = Po4050::Control(Po4050Control::Reset {
            mask: reset_mask::NAVIGATION | reset_mask::EPHEMERIS,
        });
        assert_eq!(message.to_frame(), RESET_MESSAGE.to_vec());
        assert_eq!(encode_rtcm_frame(&message.encode()).unwrap(), RESET_MESSAGE.to_vec());
    }

    #[test]
    fn test_build_rejects_oversized_payload() {
        let payload = vec![0u8; RTCM3_MAX_PAYLOAD_LENGTH + 1];
        assert_eq!(encode_rtcm_frame(&payload), Err(RtcmError::PayloadTooLong(payload.len())));
    }

    #[test]
    fn test_frame_with_leading_bytes() {
        let mut framer = RtcmFramer::new();
        let input = [b"\xDE\xAD\xBE\xEF".as_slice(), RESET_MESSAGE].concat();
        let results = framer.on_data(&input, FrameOptions::all());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].byte_offset, Some(4));
        assert_eq!(results[0].raw.as_deref(), Some(RESET_MESSAGE));
    }

    #[test]
    fn test_frame_multi_message() {
        let mut framer = RtcmFramer::new();
        let input = [RESET_MESSAGE, b"\xDE\xAD\xBE\xEF", RESPONSE_MESSAGE].concat();
        let results = framer.on_data(&input, FrameOptions::all());
        assert_eq!(results.len(), 2);
        assert_eq!(decode_control(&results[0]), Po4050Control::Reset { mask: 0x3 });
        assert_eq!(decode_control(&results[1]), Po4050Control::Response { code: 2 });
        assert_eq!(results[1].byte_offset, Some((RESET_MESSAGE.len() + 4) as u64));
    }

    #[test]
    fn test_frame_checksum_failure() {
        let mut input = [RESET_MESSAGE, RESPONSE_MESSAGE].concat();
        let len = input.len();
        input[len - 2] = 0x00;
        let mut framer = RtcmFramer::new();
        let results = framer.on_data(&input, FrameOptions::default());
        assert_eq!(ids(&results), vec![MessageId::Rtcm(4050)]);
        assert_eq!(decode_control(&results[0]), Po4050Control::Reset { mask: 0x3 });
    }

    #[test]
    fn test_corrupted_crc_then_valid_frame() {
        let mut input = [RESET_MESSAGE, RESPONSE_MESSAGE].concat();
        input[RESET_MESSAGE.len() - 1] ^= 0x01;
        let mut framer = RtcmFramer::new();
        let results = framer.on_data(&input, FrameOptions::all());
        assert_eq!(results.len(), 1);
        assert_eq!(decode_control(&results[0]), Po4050Control::Response { code: 2 });
        assert_eq!(results[0].byte_offset, Some(RESET_MESSAGE.len() as u64));
    }

    #[test]
    fn test_lossless_resync() {
        let input = [RESET_MESSAGE, b"\xD3", RESET_MESSAGE, b"\xD3\xD3", RESET_MESSAGE, &[0u8; 1024]].concat();
        let mut framer = RtcmFramer::new();
        assert_eq!(framer.on_data(&input, FrameOptions::default()).len(), 3);

        let mut input = [RESET_MESSAGE, RESET_MESSAGE].concat();
        let len = input.len();
        input[len - 2] = 0x00;
        input.extend_from_slice(RESET_MESSAGE);
        input.extend_from_slice(&[0u8; 1024]);
        let mut framer = RtcmFramer::new();
        assert_eq!(framer.on_data(&input, FrameOptions::default()).len(), 2);
    }

    #[test]
    fn test_partial_frame_across_calls() {
        let mut framer = RtcmFramer::new();
        assert!(framer.on_data(&RESET_MESSAGE[..2], FrameOptions::all()).is_empty());
        assert!(framer.on_data(&RESET_MESSAGE[2..9], FrameOptions::all()).is_empty());
        let results = framer.on_data(&RESET_MESSAGE[9..], FrameOptions::all());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].byte_offset, Some(0));
        assert_eq!(framer.bytes_consumed(), RESET_MESSAGE.len() as u64);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut framer = RtcmFramer::new();
        framer.on_data(&RESET_MESSAGE[..6], FrameOptions::default());
        framer.reset();
        let results = framer.on_data(RESPONSE_MESSAGE, FrameOptions::all());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].byte_offset, Some(6));
    }

    #[test]
    fn test_4050_diag_and_unknown_sub_type() {
        let diag = Po4050::Diag { diag_type: Po4050DiagType::Status, contents: Bytes::from_static(b"\x01\x02") };
        let payload = Bytes::from(diag.encode());
        assert_eq!(message_number(&payload), Some(PO4050_MESSAGE_ID));
        assert_eq!(Po4050::decode(&payload), Some(diag));

        let other = Po4050::Other { sub_type: 9, contents: Bytes::from_static(b"\xAA") };
        assert_eq!(Po4050::decode(&Bytes::from(other.encode())), Some(other));
    }

    #[test]
    fn test_truncated_4050_is_opaque() {
        let payload = Bytes::from_static(b"\xFD\x20\x02\x02\x00");
        assert_eq!(RtcmPayload::decode(4050, &payload), RtcmPayload::Opaque(payload.clone()));
    }
}

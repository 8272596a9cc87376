//! NMEA 0183 stream framer
//!
//! Recovers checksum-validated sentences from an arbitrarily chunked byte
//! stream. Lines are delimited by `\n`; within a line only the text after the
//! *last* `$` is considered, so a corrupted candidate never poisons a later one:
//!
//! ```text
//! $bogus$GPGGA,...*XX\r\n
//!       ^-- candidate
//! ```

use super::checksum::nmea_checksum;
use super::{FramedMessage, MessageId};
use bytes::Bytes;
use tracing::{debug, trace};

/// Longest sentence accepted, measured from `$` through `\n`
pub const MAX_SENTENCE_LENGTH: usize = 4096;

/// A sentence body may contain any printable ASCII character except `$` and `*`
fn is_valid_content(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7E) && byte != b'$' && byte != b'*'
}

fn parse_hex_byte(digits: &[u8]) -> Option<u8> {
    if digits.len() != 2 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u8::from_str_radix(text, 16).ok()
}

/// Streaming NMEA-0183 framer
#[derive(Debug, Default)]
pub struct NmeaFramer {
    /// Unterminated fragment carried over between calls
    buffer: Vec<u8>,
    /// Stream offset of `buffer[0]`
    buffer_offset: u64,
}

impl NmeaFramer {
    /// Create a new framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any partially received sentence.
    ///
    /// Discarded bytes still count toward the stream offset.
    pub fn reset(&mut self) {
        self.buffer_offset += self.buffer.len() as u64;
        self.buffer.clear();
    }

    /// Total bytes consumed so far, including the buffered fragment
    pub fn bytes_consumed(&self) -> u64 {
        self.buffer_offset + self.buffer.len() as u64
    }

    /// Add data and return every complete, valid sentence it finishes
    pub fn on_data(&mut self, data: &[u8]) -> Vec<FramedMessage> {
        trace!("Received {} bytes. [{}]", data.len(), hex::encode(data));
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut line_start = 0;
        let mut candidate = 0usize;
        while let Some(len) = self.buffer[line_start..].iter().position(|&b| b == b'\n') {
            let line_end = line_start + len;
            let line_offset = self.buffer_offset + line_start as u64;
            if let Some(message) = Self::check_candidate(&self.buffer[line_start..=line_end], line_offset, candidate) {
                messages.push(message);
            }
            candidate += 1;
            line_start = line_end + 1;
        }

        if candidate > 0 {
            debug!("Processed {} candidate messages. [valid={}]", candidate, messages.len());
        }

        // Anything before the last `$` of the unterminated fragment can never be
        // part of a sentence.
        let keep_from = match self.buffer[line_start..].iter().rposition(|&b| b == b'$') {
            Some(dollar) if self.buffer.len() - (line_start + dollar) < MAX_SENTENCE_LENGTH => line_start + dollar,
            _ => self.buffer.len(),
        };
        self.buffer.drain(..keep_from);
        self.buffer_offset += keep_from as u64;

        trace!("{} bytes remaining in the buffer.", self.buffer.len());
        messages
    }

    /// Validate one `\n`-terminated line
    fn check_candidate(line: &[u8], line_offset: u64, index: usize) -> Option<FramedMessage> {
        let Some(start) = line.iter().rposition(|&b| b == b'$') else {
            debug!("Sync byte not found. Discarding candidate {}. [size={} B]", index, line.len());
            return None;
        };

        let sentence = &line[start..];
        if sentence.len() > MAX_SENTENCE_LENGTH {
            debug!("Candidate too long. Discarding candidate {}. [size={} B]", index, sentence.len());
            return None;
        }

        // Strip `$` and the `\n`, then every trailing `\r` (some sources emit several).
        let mut body = &sentence[1..sentence.len() - 1];
        while let [rest @ .., b'\r'] = body {
            body = rest;
        }

        // At least a 1-character ID plus `*HH`.
        if body.len() < 4 {
            debug!("Candidate string too short. Discarding candidate {}. [size={} B]", index, sentence.len());
            return None;
        }

        let (content, checksum_field) = body.split_at(body.len() - 3);
        if checksum_field[0] != b'*' {
            debug!("Checksum not found. Discarding candidate {}. [size={} B]", index, sentence.len());
            return None;
        }

        let id_end = content.iter().position(|&b| b == b',').unwrap_or(content.len());
        let message_id = String::from_utf8_lossy(&content[..id_end]);

        let Some(expected) = parse_hex_byte(&checksum_field[1..]) else {
            debug!(
                "Checksum bytes not valid. Discarding candidate {}. [message={}, size={} B]",
                index,
                message_id,
                sentence.len()
            );
            return None;
        };

        if !content.iter().all(|&b| is_valid_content(b)) {
            debug!(
                "Found non-ASCII contents. Discarding candidate {}. [message={}, size={} B]",
                index,
                message_id,
                sentence.len()
            );
            return None;
        }

        let calculated = nmea_checksum(content);
        if calculated != expected {
            debug!(
                "Checksum mismatch. Discarding candidate {}. [message={}, size={} B, checksum=0x{:02X}, expected_checksum=0x{:02X}]",
                index,
                message_id,
                sentence.len(),
                calculated,
                expected
            );
            return None;
        }

        debug!(
            "Checksum passed. Dispatching message {}. [message={}, size={} B, checksum=0x{:02X}]",
            index,
            message_id,
            sentence.len(),
            calculated
        );

        Some(FramedMessage {
            type_id: MessageId::Nmea(message_id.into_owned()),
            payload: Bytes::copy_from_slice(sentence),
            byte_offset: Some(line_offset + start as u64),
            byte_length: sentence.len(),
            raw: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::checksum::encode_nmea;

    const GGA_1: &str = "$GPGGA,000000.000,3746.37327400,N,12224.26599800,W,2,13,2.1,3.260,M,34.210,M,11.1,0234*5B\r\n";
    const GGA_2: &str = "$GPGGA,180532.000,3745.90318740,N,12226.18945360,W,2,26,0.5,83.332,M,-25.332,M,3.0,0131*7A\r\n";

    fn sentences(messages: &[FramedMessage]) -> Vec<&[u8]> {
        messages.iter().map(|m| m.payload.as_ref()).collect()
    }

    #[test]
    fn test_single_message() {
        let mut framer = NmeaFramer::new();
        let results = framer.on_data(GGA_1.as_bytes());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload.as_ref(), GGA_1.as_bytes());
        assert_eq!(results[0].type_id, MessageId::Nmea("GPGGA".to_string()));
        assert_eq!(results[0].byte_offset, Some(0));
        assert_eq!(results[0].byte_length, GGA_1.len());
    }

    #[test]
    fn test_leading_garbage() {
        let mut framer = NmeaFramer::new();
        let input = format!("abcd{GGA_1}");
        let results = framer.on_data(input.as_bytes());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload.as_ref(), GGA_1.as_bytes());
        assert_eq!(results[0].byte_offset, Some(4));
    }

    #[test]
    fn test_partial_message() {
        let mut framer = NmeaFramer::new();
        let input = format!("{GGA_1}{}", &GGA_2[..20]);
        let results = framer.on_data(input.as_bytes());
        assert_eq!(sentences(&results), vec![GGA_1.as_bytes()]);

        let results = framer.on_data(GGA_2[20..].as_bytes());
        assert_eq!(sentences(&results), vec![GGA_2.as_bytes()]);
        assert_eq!(results[0].byte_offset, Some(GGA_1.len() as u64));
    }

    #[test]
    fn test_multi_message_with_junk_line() {
        let mut framer = NmeaFramer::new();
        let input = format!("{GGA_1}abcd\r\n{GGA_2}");
        let results = framer.on_data(input.as_bytes());
        assert_eq!(sentences(&results), vec![GGA_1.as_bytes(), GGA_2.as_bytes()]);
        assert_eq!(results[1].byte_offset, Some((GGA_1.len() + 6) as u64));
    }

    #[test]
    fn test_missing_star() {
        let bad = GGA_1.replace("*5B", "?5B");
        let mut framer = NmeaFramer::new();
        let results = framer.on_data(format!("{bad}{GGA_2}").as_bytes());
        assert_eq!(sentences(&results), vec![GGA_2.as_bytes()]);
    }

    #[test]
    fn test_extra_cr() {
        let sentence = GGA_1.replace("\r\n", "\r\r\r\n");
        let mut framer = NmeaFramer::new();
        let results = framer.on_data(sentence.as_bytes());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sentence(), Some(GGA_1.trim_end()));
    }

    #[test]
    fn test_bare_lf() {
        let sentence = GGA_1.replace("\r\n", "\n");
        let mut framer = NmeaFramer::new();
        assert_eq!(framer.on_data(sentence.as_bytes()).len(), 1);
    }

    #[test]
    fn test_noise_before_last_dollar() {
        let input = format!("$GPG$bogus{GGA_1}");
        let mut framer = NmeaFramer::new();
        let results = framer.on_data(input.as_bytes());
        assert_eq!(sentences(&results), vec![GGA_1.as_bytes()]);
        assert_eq!(results[0].byte_offset, Some(10));
    }

    #[test]
    fn test_invalid_characters() {
        let mut bytes = encode_nmea("GPTXT,hello");
        bytes[8] = 0x80;
        let mut framer = NmeaFramer::new();
        assert!(framer.on_data(&bytes).is_empty());
    }

    #[test]
    fn test_too_short() {
        let mut framer = NmeaFramer::new();
        assert!(framer.on_data(b"$*00\r\n").is_empty());
        assert_eq!(framer.on_data(b"$A*41\r\n").len(), 1);
    }

    #[test]
    fn test_id_without_fields() {
        let mut framer = NmeaFramer::new();
        let results = framer.on_data(&encode_nmea("PQTMVERNO"));
        assert_eq!(results[0].type_id, MessageId::Nmea("PQTMVERNO".to_string()));
    }

    #[test]
    fn test_checksum_alteration_rejected() {
        let good = encode_nmea("PQTMCFGMSGRATE,R,GGA,1");
        let star = good.iter().rposition(|&b| b == b'*').unwrap();
        let mut framer = NmeaFramer::new();
        assert_eq!(framer.on_data(&good).len(), 1);

        for position in [star + 1, star + 2] {
            for replacement in b"0123456789ABCDEFG".iter().copied() {
                if replacement == good[position] {
                    continue;
                }
                let mut bad = good.clone();
                bad[position] = replacement;
                assert!(framer.on_data(&bad).is_empty(), "accepted {:?}", String::from_utf8_lossy(&bad));
            }
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_bulk() {
        let input = format!("junk{GGA_1}\r\nmore junk $$ *\n{GGA_2}{}", &GGA_1[..30]);
        let mut bulk = NmeaFramer::new();
        let expected = bulk.on_data(input.as_bytes());

        let mut streamed = NmeaFramer::new();
        let mut results = Vec::new();
        for byte in input.as_bytes() {
            results.extend(streamed.on_data(std::slice::from_ref(byte)));
        }
        assert_eq!(results, expected);
        assert_eq!(results.len(), 2);
        assert_eq!(streamed.bytes_consumed(), input.len() as u64);
    }

    #[test]
    fn test_reset_keeps_offsets_monotonic() {
        let mut framer = NmeaFramer::new();
        assert!(framer.on_data(&GGA_1.as_bytes()[..10]).is_empty());
        framer.reset();
        let results = framer.on_data(GGA_2.as_bytes());
        assert_eq!(results[0].byte_offset, Some(10));
    }
}

//! Checksum calculation algorithms
//!
//! Supports: NMEA-0183 XOR checksum, RTCM3 CRC-24Q

// ============ NMEA ============

/// XOR checksum over an already stripped NMEA body (the bytes between `$` and `*`)
pub fn nmea_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// XOR checksum over a full or partial sentence.
///
/// A leading `$` is skipped and everything from the last `*` onward is ignored,
/// so `$GPGGA,...*47\r\n`, `GPGGA,...*` and `GPGGA,...` all give the same value.
pub fn nmea_sentence_checksum(sentence: &[u8]) -> u8 {
    let body = sentence.strip_prefix(b"$").unwrap_or(sentence);
    let body = match body.iter().rposition(|&b| b == b'*') {
        Some(star) => &body[..star],
        None => body,
    };
    nmea_checksum(body)
}

/// Build a complete `$<body>*HH\r\n` sentence. A leading `$` on `body` is accepted.
pub fn encode_nmea(body: &str) -> Vec<u8> {
    let body = body.strip_prefix('$').unwrap_or(body);
    let checksum = nmea_checksum(body.as_bytes());
    format!("${body}*{checksum:02X}\r\n").into_bytes()
}

// ============ RTCM3 ============

const CRC24Q_TABLE: [u32; 256] = build_crc24q_table();

const fn build_crc24q_table() -> [u32; 256] {
    const POLY: u32 = 0x0086_4CFB;
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= POLY;
            }
            bit += 1;
        }
        table[i] = crc & 0x00FF_FFFF;
        i += 1;
    }
    table
}

/// CRC-24Q as used by RTCM3 framing
pub fn crc24q(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &byte| {
        let index = ((crc >> 16) as u8 ^ byte) as usize;
        ((crc << 8) & 0x00FF_FFFF) ^ CRC24Q_TABLE[index]
    })
}

//! Pump frame codec.
//!
//! Frames travel over the air 4b6b-encoded. Once decoded, every frame in
//! either direction has the same layout:
//!
//! ```text
//! +------+-----------+--------+-----------------+------+
//! | 0xA7 | serial x3 | opcode | body (0..n)     | CRC8 |
//! +------+-----------+--------+-----------------+------+
//! ```
//!
//! The stick prefixes every received radio frame with the RSSI and its own
//! packet counter: `[rssi, number, encoded...]`.

use crate::crc::crc8;
use crate::error::PacketError;
use crate::types::bytes_to_hex;

/// Recipient byte addressing a MiniMed pump
pub const RECIPIENT: u8 = 0xA7;

/// Positive acknowledgement opcode
pub const ACK: u8 = 0x06;

/// Negative acknowledgement opcode, also used to request a resend
pub const NAK: u8 = 0x15;

/// Data bytes carried by one frame of a multi-frame response
pub const BIG_PAYLOAD_LEN: usize = 64;

/// Length of the parameter block sent with big commands
pub const PARAMETER_BLOCK_LEN: usize = 65;

const HEADER_LEN: usize = 5;
const MIN_FRAME_LEN: usize = HEADER_LEN + 1;
const LAST_FRAME_FLAG: u8 = 0x80;

const TABLE_4B6B: [u8; 16] = [
    0x15, 0x31, 0x32, 0x23, 0x34, 0x25, 0x26, 0x16, 0x1A, 0x19, 0x2A, 0x0B, 0x2C, 0x0D, 0x0E, 0x1C,
];

/// How the body of a received frame is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Tiny status reply confirming a set command, e.g. `06 00`
    Status,
    /// Single-frame reply: `[size, data...]`
    Data,
    /// One 64-byte chunk of a multi-frame reply: `[sequence, data x64]`
    Big,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub recipient: u8,
    pub serial: [u8; 3],
    pub opcode: u8,
    /// Everything between the opcode and the CRC8 trailer
    pub body: Vec<u8>,
    /// Meaningful data bytes extracted from the body
    pub payload: Vec<u8>,
    /// Declared payload size
    pub size: usize,
    /// Sequence byte of a big frame
    pub sequence: Option<u8>,
    pub rssi: Option<u8>,
    pub number: Option<u8>,
}

impl Packet {
    /// Build an outgoing packet addressed to the pump with the given serial.
    pub fn to_pump(serial: [u8; 3], opcode: u8, params: &[u8]) -> Self {
        Self {
            recipient: RECIPIENT,
            serial,
            opcode,
            body: params.to_vec(),
            payload: params.to_vec(),
            size: params.len(),
            sequence: None,
            rssi: None,
            number: None,
        }
    }

    /// Parse a radio frame as handed over by the stick.
    pub fn from_pump(raw: &[u8], kind: PacketKind) -> Result<Self, PacketError> {
        if raw.len() < 3 {
            return Err(PacketError::MalformedFrame(format!(
                "radio frame too short: {} bytes",
                raw.len()
            )));
        }

        let decoded = decode_4b6b(&raw[2..])?;
        let mut packet = Self::parse(&decoded, kind)?;
        packet.rssi = Some(raw[0]);
        packet.number = Some(raw[1]);
        Ok(packet)
    }

    /// Parse an already 4b6b-decoded frame.
    pub fn parse(frame: &[u8], kind: PacketKind) -> Result<Self, PacketError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(PacketError::MalformedFrame(format!(
                "frame too short: expected at least {} bytes, got {}",
                MIN_FRAME_LEN,
                frame.len()
            )));
        }

        if frame[0] != RECIPIENT {
            return Err(PacketError::MalformedFrame(format!(
                "unexpected recipient 0x{:02X}",
                frame[0]
            )));
        }

        let (content, trailer) = frame.split_at(frame.len() - 1);
        let computed = crc8(content);
        if computed != trailer[0] {
            return Err(PacketError::ChecksumMismatch {
                expected: trailer[0],
                computed,
            });
        }

        let body = content[HEADER_LEN..].to_vec();
        let (payload, size, sequence) = match kind {
            PacketKind::Status => {
                if body.is_empty() {
                    return Err(PacketError::MalformedFrame("empty status frame".into()));
                }
                (body.clone(), body.len(), None)
            }
            PacketKind::Data => {
                let Some((&size, data)) = body.split_first() else {
                    return Err(PacketError::MalformedFrame("missing size byte".into()));
                };
                let size = size as usize;
                if size > data.len() {
                    return Err(PacketError::MalformedFrame(format!(
                        "declared size {} exceeds {} available bytes",
                        size,
                        data.len()
                    )));
                }
                (data[..size].to_vec(), size, None)
            }
            PacketKind::Big => {
                if body.len() != BIG_PAYLOAD_LEN + 1 {
                    return Err(PacketError::MalformedFrame(format!(
                        "big frame body must be {} bytes, got {}",
                        BIG_PAYLOAD_LEN + 1,
                        body.len()
                    )));
                }
                (body[1..].to_vec(), BIG_PAYLOAD_LEN, Some(body[0]))
            }
        };

        Ok(Self {
            recipient: frame[0],
            serial: [frame[1], frame[2], frame[3]],
            opcode: frame[4],
            body,
            payload,
            size,
            sequence,
            rssi: None,
            number: None,
        })
    }

    /// Frame bytes before line coding, CRC8 included
    pub fn decoded(&self) -> Vec<u8> {
        encode_frame(self.serial, self.opcode, &self.body)
    }

    /// Frame bytes as sent over the air
    pub fn encoded(&self) -> Vec<u8> {
        encode_4b6b(&self.decoded())
    }

    /// Whether this is the final chunk of a multi-frame reply
    pub fn is_last(&self) -> bool {
        self.sequence.is_some_and(|s| s & LAST_FRAME_FLAG != 0)
    }

    /// `true` for the `06 00` "ACK, no error" status
    pub fn is_ack(&self) -> bool {
        self.opcode == ACK && self.payload == [0x00]
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X} {} {:02X} [{}] {}",
            self.recipient,
            bytes_to_hex(&self.serial),
            self.opcode,
            self.size,
            bytes_to_hex(&self.payload)
        )
    }
}

/// Build a decoded frame: recipient, serial, opcode, body and CRC8.
pub fn encode_frame(serial: [u8; 3], opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len() + 1);
    frame.push(RECIPIENT);
    frame.extend_from_slice(&serial);
    frame.push(opcode);
    frame.extend_from_slice(body);
    frame.push(crc8(&frame));
    frame
}

/// Line-code bytes with the pump's 4b6b table, high nibble first.
pub fn encode_4b6b(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 3 / 2 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0u32;

    for &byte in data {
        for nibble in [byte >> 4, byte & 0x0F] {
            acc = (acc << 6) | TABLE_4B6B[nibble as usize] as u32;
            bits += 6;
            while bits >= 8 {
                bits -= 8;
                out.push((acc >> bits) as u8);
            }
            acc &= (1 << bits) - 1;
        }
    }

    // Odd byte count leaves four bits behind
    if bits > 0 {
        acc = (acc << 4) | 0b0101;
        bits += 4;
        while bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }

    out
}

/// Reverse of [`encode_4b6b`]. Stops at a zero symbol, at the padding
/// nibble followed by silence, or when fewer than six bits remain.
pub fn decode_4b6b(data: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut nibbles = Vec::with_capacity(data.len() * 4 / 3);
    let mut acc: u32 = 0;
    let mut bits = 0u32;

    'stream: for (i, &byte) in data.iter().enumerate() {
        acc = (acc << 8) | byte as u32;
        bits += 8;

        while bits >= 6 {
            bits -= 6;
            let symbol = ((acc >> bits) & 0x3F) as u8;
            acc &= (1 << bits) - 1;

            if symbol == 0 {
                break 'stream;
            }

            match TABLE_4B6B.iter().position(|&s| s == symbol) {
                Some(nibble) => nibbles.push(nibble as u8),
                None => {
                    let silent_tail = acc == 0 && data[i + 1..].iter().all(|&b| b == 0);
                    if symbol >> 2 == 0b0101 && silent_tail {
                        break 'stream;
                    }
                    return Err(PacketError::InvalidEncoding(symbol));
                }
            }
        }
    }

    if nibbles.len() % 2 != 0 {
        return Err(PacketError::MalformedFrame(format!(
            "odd nibble count: {}",
            nibbles.len()
        )));
    }

    Ok(nibbles.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

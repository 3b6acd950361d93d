//! Error types for pump and stick operations.

use thiserror::Error;

/// Frame-level decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// CRC8 trailer does not match the frame contents.
    #[error("checksum mismatch: expected 0x{expected:02X}, computed 0x{computed:02X}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u8,
        /// Checksum computed over the frame.
        computed: u8,
    },

    /// Frame structure is wrong (length, recipient, size fields).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A 6-bit symbol outside the 4b6b table.
    #[error("invalid 4b6b symbol: 0x{0:02X}")]
    InvalidEncoding(u8),

    /// A well-formed payload carries a value the decoder does not know.
    #[error("unexpected {field} value: 0x{value:02X}")]
    UnexpectedValue {
        /// Name of the decoded field.
        field: &'static str,
        /// Raw byte found in the payload.
        value: u8,
    },
}

/// Errors that can occur while talking to the stick or the pump.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PumpError {
    /// Transport layer error (USB, serial, etc.)
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply arrived before the read timeout.
    #[error("radio timeout")]
    RadioTimeout,

    /// The stick reported a garbled or interrupted radio exchange.
    #[error("radio error: {0}")]
    RadioError(String),

    /// A received frame could not be decoded.
    #[error("invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    /// The pump answered, but not with the expected acknowledgement, or the
    /// NAK retry budget ran out.
    #[error("unsuccessful command: {0}")]
    UnsuccessfulCommand(String),

    /// Reassembled history page failed its CRC16 check.
    #[error("history page bad CRC: expected 0x{expected:04X}, computed 0x{computed:04X}")]
    HistoryPageBadCrc {
        /// CRC carried by the last two bytes of the page.
        expected: u16,
        /// CRC computed over the page contents.
        computed: u16,
    },

    /// The pump never answered its wake-up sequence.
    #[error("no response from pump")]
    NoPumpResponse,

    /// Invalid parameter passed to a command
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The persistence sink rejected an entry.
    #[error("report error: {0}")]
    Report(String),

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl PumpError {
    /// Whether the error is a transient radio or codec failure that the NAK
    /// retry loop is allowed to absorb.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PumpError::RadioTimeout | PumpError::RadioError(_) | PumpError::InvalidPacket(_)
        )
    }
}

//! History page reader.
//!
//! A history page is 1024 bytes sent as 16 big frames: the first answers the
//! page request itself, the other 15 each answer an ACK. The last two bytes
//! of the reassembled page are a big-endian CRC16 of everything before them.

use crate::command::PhaseCounts;
use crate::crc::crc16;
use crate::error::PumpError;
use crate::registry::parameter_block;
use crate::types::unpack;

/// Pages kept by the pump, newest first
pub const HISTORY_PAGES: u32 = 36;

/// Frames acknowledged after the first one of a page
pub const PAGE_ACKS: usize = 15;

pub(crate) fn phase_counts() -> PhaseCounts {
    PhaseCounts {
        init: 0,
        ack: PAGE_ACKS,
        nak: 10,
    }
}

pub(crate) fn encode_page(page: u32) -> Result<Vec<u8>, PumpError> {
    if page >= HISTORY_PAGES {
        return Err(PumpError::InvalidParameter(format!(
            "Invalid history page number: {} (expected 0..={})",
            page,
            HISTORY_PAGES - 1
        )));
    }
    Ok(parameter_block(&[page as u8]))
}

/// Check the trailing CRC16 of a reassembled page and return the page
/// without it.
pub fn verify_page(payload: &[u8]) -> Result<Vec<u8>, PumpError> {
    if payload.len() < 2 {
        return Err(PumpError::HistoryPageBadCrc {
            expected: 0,
            computed: crc16(&[]),
        });
    }

    let (data, trailer) = payload.split_at(payload.len() - 2);
    let expected = unpack(trailer) as u16;
    let computed = crc16(data);
    if expected != computed {
        return Err(PumpError::HistoryPageBadCrc { expected, computed });
    }

    Ok(data.to_vec())
}

/// Number of history pages in use, from the history size payload
pub(crate) fn page_count(payload: &[u8]) -> Option<u32> {
    payload
        .get(3)
        .map(|&last| (last as u32 + 1).min(HISTORY_PAGES))
}

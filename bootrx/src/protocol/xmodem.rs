//! XMODEM-CRC frame layout and the receive-side packet codec.
//!
//! The transfer uses classic 128-byte XMODEM-CRC frames:
//!
//! ```text
//! Frame format:
//! +-----+-----+------+----------------+--------+
//! | SOH | SEQ | ~SEQ |   DATA (128)   | CRC16  |
//! +-----+-----+------+----------------+--------+
//! | 1   | 1   | 1    |      128       | 2      |
//! +-----+-----+------+----------------+--------+
//! ```
//!
//! The codec validates structure (complement, checksum) and sequence
//! continuity, and recognizes the one permitted duplicate case: a frame
//! repeating the last acknowledged sequence number is acknowledged again
//! without being re-parsed, which makes resends idempotent.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

/// Transfer control characters.
pub mod control {
    /// Start of Header (128-byte frame).
    pub const SOH: u8 = 0x01;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character ("ready for CRC-mode transfer").
    pub const C: u8 = b'C';
}

/// Payload bytes per frame.
pub const DATA_SIZE: usize = 128;

/// Total frame size: header + seq + complement + payload + CRC16.
pub const FRAME_SIZE: usize = 3 + DATA_SIZE + 2;

/// Result of handing a structurally complete frame to the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// New in-order frame; the payload must be parsed.
    Fresh,
    /// Resend of the last acknowledged frame; ACK without reprocessing.
    Duplicate,
}

/// Receive-side packet codec: structural validation plus sequence tracking.
#[derive(Debug, Default)]
pub struct PacketCodec {
    last_acked: u8,
}

impl PacketCodec {
    /// Create a codec expecting the first frame of a transfer (seq 1).
    pub fn new() -> Self {
        Self { last_acked: 0 }
    }

    /// Forget all sequence state, ready for a new transfer.
    pub fn reset(&mut self) {
        self.last_acked = 0;
    }

    /// Sequence number of the last positively acknowledged frame.
    pub fn last_acked(&self) -> u8 {
        self.last_acked
    }

    /// Validate a complete frame and advance sequence state.
    ///
    /// `frame` must be exactly [`FRAME_SIZE`] bytes starting with SOH (the
    /// transport layer checks the header byte and read length first).
    ///
    /// Recoverable faults (complement, checksum) leave the sequence state
    /// untouched so a retransmission can succeed; a sequence mismatch other
    /// than an exact duplicate is fatal for the transfer.
    pub fn accept(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<Accept> {
        let seq = frame[1];
        let complement = frame[2];

        if complement != 255 - seq {
            debug!("complement mismatch: seq {seq:#04x}, complement {complement:#04x}");
            return Err(Error::BadPacketNumber { seq, complement });
        }

        let payload = &frame[3..3 + DATA_SIZE];
        let expected = BigEndian::read_u16(&frame[3 + DATA_SIZE..]);
        let actual = crc16_xmodem(payload);
        if actual != expected {
            debug!("checksum mismatch on seq {seq:#04x}");
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        if seq == self.last_acked {
            trace!("duplicate frame seq {seq:#04x}");
            return Ok(Accept::Duplicate);
        }

        let next = self.last_acked.wrapping_add(1);
        if seq != next {
            return Err(Error::SequenceMismatch {
                expected: next,
                got: seq,
            });
        }

        self.last_acked = seq;
        Ok(Accept::Fresh)
    }
}

/// Build a complete frame around `data` (padded with zeros to the fixed
/// payload size). Used by tests and host-side tooling.
pub fn build_frame(seq: u8, data: &[u8]) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = control::SOH;
    frame[1] = seq;
    frame[2] = 255 - seq;
    let n = data.len().min(DATA_SIZE);
    frame[3..3 + n].copy_from_slice(&data[..n]);
    let crc = crc16_xmodem(&frame[3..3 + DATA_SIZE]);
    BigEndian::write_u16(&mut frame[3 + DATA_SIZE..], crc);
    frame
}

//! Error types for bootrx.

use std::io;
use thiserror::Error;

/// Result type for bootrx operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad fault class, used to pick the abort trailer and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Packet-transport faults (timeouts, frame and sequence errors).
    Transport,
    /// Image-container faults (version, tags, digests, signatures).
    Parser,
    /// Flash staging/commit/erase faults.
    Commit,
    /// Everything else (I/O, configuration, cancellation).
    Other,
}

/// Error type for bootrx operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Frame body shorter than the fixed frame size.
    #[error("Short read: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes the frame requires.
        expected: usize,
        /// Bytes actually received before the deadline.
        got: usize,
    },

    /// Frame did not start with a recognized header byte.
    #[error("Bad frame header: {0:#04x}")]
    BadFrameHeader(u8),

    /// Sequence byte and its complement disagree.
    #[error("Bad packet number: seq {seq:#04x}, complement {complement:#04x}")]
    BadPacketNumber {
        /// Sequence number carried by the frame.
        seq: u8,
        /// Complement byte carried by the frame.
        complement: u8,
    },

    /// Payload checksum mismatch.
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u16,
        /// Checksum computed over the payload.
        actual: u16,
    },

    /// Sequence number is neither the next expected nor a duplicate.
    #[error("Sequence mismatch: expected {expected:#04x}, got {got:#04x}")]
    SequenceMismatch {
        /// Next sequence number the codec would accept.
        expected: u8,
        /// Sequence number carried by the frame.
        got: u8,
    },

    /// Frame repeats the last acknowledged sequence number.
    #[error("Duplicate packet: seq {0:#04x}")]
    DuplicatePacket(u8),

    /// Peer cancelled the transfer.
    #[error("Transfer cancelled by peer")]
    Cancelled,

    /// Container format version is unsupported, or the header tag is missing.
    #[error("Unsupported container: {0}")]
    Version(String),

    /// Whole-stream digest carried by the terminal tag does not match.
    #[error("Stream digest mismatch: expected {expected:#010x}, got {actual:#010x}")]
    DigestMismatch {
        /// Digest carried by the terminal tag.
        expected: u32,
        /// Digest computed over the received stream.
        actual: u32,
    },

    /// Tag identifier is not part of the container format.
    #[error("Unknown tag: {0:#010x}")]
    UnknownTag(u32),

    /// Signature verification failed, or a required signature never arrived.
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Structurally broken, unexpected or truncated tag data.
    #[error("Malformed container: {0}")]
    Malformed(String),

    /// Decryption or verification requested without the required capability
    /// or key material.
    #[error("Key error: {0}")]
    KeyError(String),

    /// Flash staging or driver failure.
    #[error("Flash error: {0}")]
    Flash(String),

    /// Staged upgrade version is not newer than the running version.
    #[error("Staged version {staged:#010x} is not newer than running {running:#010x}")]
    VersionTooOld {
        /// Version declared by the staged blob.
        staged: u32,
        /// Version currently running on the device.
        running: u32,
    },

    /// Boot requested with nothing staged or an unverified image.
    #[error("Nothing to boot: {0}")]
    NothingStaged(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run loop stopped by the embedding application.
    #[error("Interrupted by user")]
    Interrupted,
}

impl Error {
    /// Fault class of this error (selects trailer text and retry policy).
    pub fn class(&self) -> FaultClass {
        match self {
            Self::Timeout(_)
            | Self::ShortRead { .. }
            | Self::BadFrameHeader(_)
            | Self::BadPacketNumber { .. }
            | Self::ChecksumMismatch { .. }
            | Self::SequenceMismatch { .. }
            | Self::DuplicatePacket(_)
            | Self::Cancelled => FaultClass::Transport,
            Self::Version(_)
            | Self::DigestMismatch { .. }
            | Self::UnknownTag(_)
            | Self::SignatureInvalid(_)
            | Self::Malformed(_)
            | Self::KeyError(_) => FaultClass::Parser,
            Self::Flash(_) | Self::VersionTooOld { .. } | Self::NothingStaged(_) => {
                FaultClass::Commit
            },
            _ => FaultClass::Other,
        }
    }

    /// Whether the transport may answer this fault with NAK and wait for a
    /// retransmission instead of aborting the transfer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::ShortRead { .. }
                | Self::BadFrameHeader(_)
                | Self::BadPacketNumber { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Single-byte status code reported to the far end on abort.
    ///
    /// Unmapped conditions report `0x00`.
    pub fn status_code(&self) -> u8 {
        match self {
            Self::Timeout(_) | Self::ShortRead { .. } => 0x20,
            Self::BadFrameHeader(_) => 0x21,
            Self::BadPacketNumber { .. } => 0x22,
            Self::ChecksumMismatch { .. } => 0x23,
            Self::SequenceMismatch { .. } => 0x25,
            Self::DuplicatePacket(_) => 0x27,
            Self::Version(_) => 0x41,
            Self::DigestMismatch { .. } => 0x43,
            Self::UnknownTag(_) => 0x44,
            Self::SignatureInvalid(_) => 0x45,
            Self::Malformed(_) => 0x4F,
            Self::KeyError(_) => 0x50,
            _ => 0x00,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_wire_contract() {
        assert_eq!(Error::Timeout("t".into()).status_code(), 0x20);
        assert_eq!(Error::BadFrameHeader(0x7F).status_code(), 0x21);
        assert_eq!(
            Error::BadPacketNumber {
                seq: 1,
                complement: 1
            }
            .status_code(),
            0x22
        );
        assert_eq!(
            Error::ChecksumMismatch {
                expected: 0,
                actual: 1
            }
            .status_code(),
            0x23
        );
        assert_eq!(
            Error::SequenceMismatch {
                expected: 2,
                got: 9
            }
            .status_code(),
            0x25
        );
        assert_eq!(Error::Version("major 2".into()).status_code(), 0x41);
        assert_eq!(Error::UnknownTag(0xDEAD_0000).status_code(), 0x44);
        assert_eq!(Error::SignatureInvalid("no".into()).status_code(), 0x45);
        assert_eq!(Error::Malformed("bad".into()).status_code(), 0x4F);
        assert_eq!(Error::KeyError("no key".into()).status_code(), 0x50);
    }

    #[test]
    fn test_fault_classes() {
        assert_eq!(
            Error::ChecksumMismatch {
                expected: 0,
                actual: 1
            }
            .class(),
            FaultClass::Transport
        );
        assert_eq!(Error::UnknownTag(1).class(), FaultClass::Parser);
        assert_eq!(Error::Flash("oops".into()).class(), FaultClass::Commit);
        assert_eq!(Error::Interrupted.class(), FaultClass::Other);
    }

    #[test]
    fn test_retryable_is_transport_only() {
        assert!(Error::Timeout("t".into()).is_retryable());
        assert!(
            Error::ChecksumMismatch {
                expected: 0,
                actual: 1
            }
            .is_retryable()
        );
        // Sequence errors abort rather than retry.
        assert!(
            !Error::SequenceMismatch {
                expected: 2,
                got: 9
            }
            .is_retryable()
        );
        assert!(!Error::UnknownTag(1).is_retryable());
    }
}

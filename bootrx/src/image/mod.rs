//! Firmware image container: streaming parser, sub-streams and builder.

pub mod builder;
pub mod container;
pub mod decompress;

use bitflags::bitflags;

// Re-export the parser surface
pub use container::{FeedOutcome, ParserContext, SUPPORTED_MAJOR, feed, make_version, tag};

bitflags! {
    /// Which optional content regions a parsed image carried.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContentFlags: u8 {
        /// Application program data.
        const APPLICATION = 1 << 0;
        /// Loader upgrade blob.
        const LOADER = 1 << 1;
        /// Sub-processor firmware blob.
        const SUBPROC = 1 << 2;
    }
}

/// Accumulated, write-once-per-field outcome of parsing one image.
///
/// Created zeroed at transfer start, mutated only by the parser, read by the
/// boot path and the transport's final reporting step. `verified` only
/// becomes true once the authentication check succeeds over the whole image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageProperties {
    /// The terminal tag was reached and processed cleanly.
    pub completed: bool,
    /// The image authenticated end to end.
    pub verified: bool,
    /// Content regions present in the image.
    pub contents: ContentFlags,
    /// Container format version from the header tag.
    pub format_version: u32,
    /// Application version declared by the image.
    pub app_version: u32,
    /// Loader version declared by a staged loader blob.
    pub loader_version: u32,
    /// Sub-processor version declared by a staged blob.
    pub subproc_version: u32,
    /// Size in bytes of the staged loader upgrade.
    pub loader_upgrade_size: u32,
    /// Size in bytes of the staged sub-processor upgrade.
    pub subproc_upgrade_size: u32,
}

impl ImageProperties {
    /// Zero every field for a new transfer.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

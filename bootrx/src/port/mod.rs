//! Transport driver abstraction for the half-duplex serial link.
//!
//! The protocol layer is I/O-agnostic: it only needs byte/buffer send,
//! receive-with-timeout that reports the count actually transferred, a
//! "bytes waiting" query and a way to discard stale input.
//!
//! ```text
//! +--------------------+
//! |  Protocol Layer    |
//! | (xmodem, receiver) |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! | TransferPort trait |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! | Native SerialPort  |
//! |   (serialport)     |
//! +--------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::Result;

/// Byte transport over the serial medium.
///
/// Implementations report the number of bytes actually transferred; a read
/// that returns fewer bytes than requested within its timeout is not an
/// error at this layer, the caller decides.
pub trait TransferPort {
    /// Send the whole buffer.
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Send a single byte.
    fn send_byte(&mut self, byte: u8) -> Result<()> {
        self.send(&[byte])
    }

    /// Receive up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes placed into `buf`, which may be zero if
    /// the deadline passes without input.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Number of received bytes waiting to be read.
    fn rx_available(&mut self) -> Result<usize>;

    /// Drop all received-but-unread bytes.
    fn discard_input(&mut self) -> Result<()>;
}

// Re-export the native implementation when built for it
#[cfg(feature = "native")]
pub use native::NativePort;

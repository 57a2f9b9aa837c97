//! # bootrx
//!
//! The transport-and-verification core of a field firmware-update
//! bootloader, portable enough to host on a development machine.
//!
//! This crate provides:
//!
//! - An XMODEM-CRC packet codec and the receive-side transport state
//!   machine (menu, transfer, boot, erase) with retry budgets and
//!   cooperative cancellation
//! - A streaming parser for the tagged firmware-image container, resumable
//!   across arbitrary chunk boundaries, with compressed, encrypted and
//!   authenticated sub-streams
//! - Flash commit orchestration: staged page-aligned writes, explicit
//!   activation copies, and an erase contract that preserves injected
//!   opaque token ranges
//!
//! External collaborators are traits: the serial transport
//! ([`port::TransferPort`]), the flash primitive driver
//! ([`flash::FlashDriver`]), the countdown timer ([`timer::DelayTimer`])
//! and the crypto capability ([`crypto::CryptoService`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootrx::{BootConfig, PlainCrypto, Receiver, SysTimer};
//! use bootrx::flash::mem::MemFlash;
//! use bootrx::port::NativePort;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open("/dev/ttyUSB0", 115200)?;
//!     let flash = MemFlash::new(0x8_0000, 4096);
//!     let config = BootConfig::default();
//!
//!     let mut receiver =
//!         Receiver::new(port, flash, SysTimer::new(), PlainCrypto::new(), config)?;
//!     let reason = receiver.run()?;
//!     println!("reset requested: {reason:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod config;
pub mod crypto;
pub mod error;
pub mod flash;
pub mod image;
pub mod port;
pub mod protocol;
pub mod timer;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by the receiver's run loop.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn interrupt_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    config::{BootConfig, ConfirmPolicy, EraseLayout, FlashRegion, PreservedRange},
    crypto::{CryptoService, PlainCrypto, SecureCrypto},
    error::{Error, FaultClass, Result},
    flash::{FlashDriver, FlashWriter, StagedFlash},
    image::{
        ContentFlags, FeedOutcome, ImageProperties, ParserContext,
        builder::ContainerBuilder, make_version,
    },
    protocol::{PacketCodec, Receiver, ResetReason, State},
    timer::{DelayTimer, SysTimer},
};

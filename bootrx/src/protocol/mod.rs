//! Protocol implementations.

pub mod crc;
pub mod receiver;
pub mod xmodem;

// Re-export common types
pub use receiver::{Receiver, ResetReason, State};
pub use xmodem::{PacketCodec, control};

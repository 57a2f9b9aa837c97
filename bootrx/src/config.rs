//! Device configuration injected into the bootloader core.
//!
//! Flash geometry, retry budgets and the erase/preserve layout are all
//! device-specific. The core never hard-codes addresses; everything it needs
//! arrives through [`BootConfig`].

use crate::error::{Error, Result};

/// A contiguous flash address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// First byte address of the region.
    pub base: u32,
    /// Region length in bytes.
    pub size: u32,
}

impl FlashRegion {
    /// Create a region from base address and size.
    pub fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// One-past-the-end address.
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    /// Whether `addr..addr + len` lies entirely inside this region.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && addr.checked_add(len).is_some_and(|e| e <= self.end())
    }
}

/// An opaque token sub-range that must survive a storage erase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservedRange {
    /// First byte address of the preserved bytes.
    pub addr: u32,
    /// Number of preserved bytes.
    pub len: u32,
    /// Human-readable purpose, for logs only.
    pub purpose: String,
}

impl PreservedRange {
    /// Create a preserved range.
    pub fn new(addr: u32, len: u32, purpose: impl Into<String>) -> Self {
        Self {
            addr,
            len,
            purpose: purpose.into(),
        }
    }
}

/// Erase span plus the token ranges restored after erasing it.
#[derive(Debug, Clone, Default)]
pub struct EraseLayout {
    /// Full span erased by the erase command. `None` disables the command.
    pub span: Option<FlashRegion>,
    /// Sub-ranges saved before the erase and written back afterwards.
    pub preserved: Vec<PreservedRange>,
}

/// What happens to a pending erase confirmation when an unrelated command
/// arrives before `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmPolicy {
    /// Any non-confirming command clears the pending confirmation.
    #[default]
    ClearOnOtherCommand,
    /// The confirmation stays armed until `y` consumes it.
    KeepUntilConfirmed,
}

/// Complete device configuration for the bootloader core.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Version of the running loader (menu banner and upgrade gate).
    pub loader_version: u32,
    /// Version of the running sub-processor firmware (upgrade gate).
    pub subproc_version: u32,
    /// Idle polls (roughly one per second) tolerated before a timeout reset.
    /// `None` waits forever.
    pub idle_timeout: Option<u32>,
    /// Silent ready/retry intervals tolerated before a transfer aborts.
    pub packet_retry_budget: u32,
    /// Policy for a stale erase confirmation.
    pub confirm_policy: ConfirmPolicy,
    /// Flash page size in bytes (must be a power of two).
    pub page_size: u32,
    /// Region program data tags write into.
    pub app_region: FlashRegion,
    /// Staging region for loader/sub-processor upgrade blobs.
    pub upgrade_region: FlashRegion,
    /// Live loader region, target of a committed loader upgrade.
    pub loader_region: FlashRegion,
    /// Live sub-processor region, target of a committed sub-processor blob.
    pub subproc_region: FlashRegion,
    /// Erase-command layout.
    pub erase: EraseLayout,
}

/// Default packet-retry budget (ready intervals before cancelling).
pub const DEFAULT_PACKET_RETRY_BUDGET: u32 = 60;

impl Default for BootConfig {
    fn default() -> Self {
        // A small generic layout: 4 KiB pages, 256 KiB application area,
        // 64 KiB staging area, 32 KiB live loader/sub-processor slots.
        Self {
            loader_version: 0x0100_0000,
            subproc_version: 0,
            idle_timeout: None,
            packet_retry_budget: DEFAULT_PACKET_RETRY_BUDGET,
            confirm_policy: ConfirmPolicy::default(),
            page_size: 4096,
            app_region: FlashRegion::new(0x0001_0000, 0x0004_0000),
            upgrade_region: FlashRegion::new(0x0005_0000, 0x0001_0000),
            loader_region: FlashRegion::new(0x0000_0000, 0x0000_8000),
            subproc_region: FlashRegion::new(0x0006_0000, 0x0000_8000),
            erase: EraseLayout::default(),
        }
    }
}

impl BootConfig {
    /// Validate internal consistency (page size, preserved ranges inside the
    /// erase span).
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.packet_retry_budget == 0 {
            return Err(Error::Config("packet retry budget must be non-zero".into()));
        }
        if self.idle_timeout == Some(0) {
            return Err(Error::Config(
                "idle timeout must be non-zero (use None to wait forever)".into(),
            ));
        }
        if let Some(span) = self.erase.span {
            if span.base % self.page_size != 0 || span.size % self.page_size != 0 {
                return Err(Error::Config(format!(
                    "erase span {:#010x}+{:#x} is not page-aligned",
                    span.base, span.size
                )));
            }
            for range in &self.erase.preserved {
                if !span.contains(range.addr, range.len) {
                    return Err(Error::Config(format!(
                        "preserved range '{}' at {:#010x}+{} lies outside the erase span",
                        range.purpose, range.addr, range.len
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_contains() {
        let r = FlashRegion::new(0x1000, 0x1000);
        assert!(r.contains(0x1000, 0x1000));
        assert!(r.contains(0x1800, 0x100));
        assert!(!r.contains(0x0FFF, 4));
        assert!(!r.contains(0x1FFF, 2));
        // Overflowing length never fits.
        assert!(!r.contains(0x1000, u32::MAX));
    }

    #[test]
    fn test_default_config_is_valid() {
        BootConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_validate_rejects_stray_preserved_range() {
        let mut cfg = BootConfig::default();
        cfg.erase.span = Some(FlashRegion::new(0x7_0000, 0x1000));
        cfg.erase
            .preserved
            .push(PreservedRange::new(0x9_0000, 16, "token"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_page_size() {
        let cfg = BootConfig {
            page_size: 3000,
            ..BootConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

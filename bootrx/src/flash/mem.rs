//! In-memory NOR flash model.
//!
//! Behaves like the real part: erase sets a page to 0xFF, and programming
//! is only legal on erased bytes. Used by tests and by the CLI's hosted
//! receiver and offline inspection modes.

use crate::error::{Error, Result};
use crate::flash::FlashDriver;

/// Byte-array flash with NOR-style erase/program rules.
#[derive(Debug, Clone)]
pub struct MemFlash {
    data: Vec<u8>,
    page_size: u32,
    erase_count: u32,
}

impl MemFlash {
    /// Create a flash of `size` bytes, fully erased.
    pub fn new(size: u32, page_size: u32) -> Self {
        Self {
            data: vec![0xFF; size as usize],
            page_size,
            erase_count: 0,
        }
    }

    /// Total size in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Number of page erases performed (commit/activity tracking in tests).
    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    /// Copy of the full flash contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<usize> {
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                Error::Flash(format!(
                    "access at {addr:#010x}+{len} beyond flash size {:#x}",
                    self.data.len()
                ))
            })?;
        Ok(end)
    }
}

impl FlashDriver for MemFlash {
    fn erase_page(&mut self, addr: u32) -> Result<()> {
        if addr % self.page_size != 0 {
            return Err(Error::Flash(format!(
                "erase address {addr:#010x} not page-aligned"
            )));
        }
        let end = self.check_range(addr, self.page_size as usize)?;
        self.data[addr as usize..end].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let end = self.check_range(addr, data.len())?;
        let target = &mut self.data[addr as usize..end];
        if target.iter().any(|&b| b != 0xFF) {
            return Err(Error::Flash(format!(
                "write at {addr:#010x} targets non-erased bytes"
            )));
        }
        target.copy_from_slice(data);
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let end = self.check_range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[addr as usize..end]);
        Ok(())
    }
}

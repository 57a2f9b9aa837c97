//! Flash commit orchestration: staged writes, activation copies, erase.
//!
//! The parser records program data through the staged-write contract
//! ([`FlashWriter`]); nothing becomes active until [`commit_staged`] runs
//! from the boot path. The erase contract ([`erase_storage`]) preserves the
//! injected opaque token ranges across the erased span.

pub mod mem;

use crate::config::{EraseLayout, FlashRegion};
use crate::error::{Error, Result};
use log::{debug, trace};

/// Flash primitive driver (external collaborator).
pub trait FlashDriver {
    /// Erase the page starting at `addr` (must be page-aligned), leaving it
    /// all-0xFF.
    fn erase_page(&mut self, addr: u32) -> Result<()>;

    /// Program `data` at `addr`. The target range must have been erased.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()>;
}

/// Staged, page-aligned, offset-ordered writer into one flash region.
///
/// Writes must arrive at non-decreasing, non-overlapping addresses. The
/// writer buffers one page, erases each page before its first write, fills
/// gaps with 0xFF, and flushes the trailing partial page on [`finish`].
///
/// [`finish`]: FlashWriter::finish
#[derive(Debug)]
pub struct FlashWriter {
    region: FlashRegion,
    page_size: usize,
    page: Vec<u8>,
    /// Base address of the buffered page, if any.
    page_addr: Option<u32>,
    /// Next address a write may target (ordering watermark).
    cursor: u32,
    /// First address not yet covered by an erase.
    erased_until: u32,
    /// Total bytes staged through this writer.
    staged: u32,
}

impl FlashWriter {
    /// Create a writer for `region` with the device page size.
    pub fn new(region: FlashRegion, page_size: u32) -> Self {
        Self {
            region,
            page_size: page_size as usize,
            page: vec![0xFF; page_size as usize],
            page_addr: None,
            cursor: region.base,
            erased_until: region.base,
            staged: 0,
        }
    }

    /// Region this writer stages into.
    pub fn region(&self) -> FlashRegion {
        self.region
    }

    /// Total bytes staged so far.
    pub fn staged_len(&self) -> u32 {
        self.staged
    }

    fn page_base(&self, addr: u32) -> u32 {
        addr & !(self.page_size as u32 - 1)
    }

    fn flush_page<F: FlashDriver>(&mut self, flash: &mut F) -> Result<()> {
        if let Some(base) = self.page_addr.take() {
            trace!("flush page {base:#010x}");
            flash.write(base, &self.page)?;
            self.page.fill(0xFF);
        }
        Ok(())
    }

    /// Stage `data` at absolute address `addr`.
    pub fn write<F: FlashDriver>(&mut self, flash: &mut F, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if addr < self.cursor {
            return Err(Error::Flash(format!(
                "write at {addr:#010x} behind watermark {:#010x} (unordered or overlapping)",
                self.cursor
            )));
        }
        if !self.region.contains(addr, data.len() as u32) {
            return Err(Error::Flash(format!(
                "write at {addr:#010x}+{} outside region {:#010x}+{:#x}",
                data.len(),
                self.region.base,
                self.region.size
            )));
        }

        let mut addr = addr;
        let mut data = data;
        while !data.is_empty() {
            let base = self.page_base(addr);

            // Moving past the buffered page: push it out first.
            if self.page_addr.is_some_and(|b| b != base) {
                self.flush_page(flash)?;
            }

            // First touch of this page: erase it.
            if self.page_addr.is_none() {
                if base >= self.erased_until {
                    flash.erase_page(base)?;
                    self.erased_until = base + self.page_size as u32;
                }
                self.page_addr = Some(base);
            }

            let off = (addr - base) as usize;
            let take = data.len().min(self.page_size - off);
            self.page[off..off + take].copy_from_slice(&data[..take]);

            addr += take as u32;
            data = &data[take..];
            self.staged += take as u32;

            if addr == base + self.page_size as u32 {
                self.flush_page(flash)?;
            }
        }

        self.cursor = addr;
        Ok(())
    }

    /// Flush the buffered partial page (0xFF-padded).
    pub fn finish<F: FlashDriver>(&mut self, flash: &mut F) -> Result<()> {
        self.flush_page(flash)
    }
}

/// The two staged writers one transfer works with: program data into the
/// application region, upgrade blobs into the staging region.
#[derive(Debug)]
pub struct StagedFlash {
    /// Writer for program-data tags.
    pub app: FlashWriter,
    /// Writer for loader/sub-processor upgrade blobs.
    pub upgrade: FlashWriter,
}

impl StagedFlash {
    /// Fresh writers for a new transfer.
    pub fn new(config: &crate::config::BootConfig) -> Self {
        Self {
            app: FlashWriter::new(config.app_region, config.page_size),
            upgrade: FlashWriter::new(config.upgrade_region, config.page_size),
        }
    }

    /// Flush both writers' partial pages.
    pub fn finish<F: FlashDriver>(&mut self, flash: &mut F) -> Result<()> {
        self.app.finish(flash)?;
        self.upgrade.finish(flash)
    }
}

/// Copy a staged upgrade blob from its staging region into the live region.
///
/// Only the boot path calls this; the parser never commits.
pub fn commit_staged<F: FlashDriver>(
    flash: &mut F,
    from: FlashRegion,
    to: FlashRegion,
    len: u32,
    page_size: u32,
) -> Result<()> {
    if len == 0 {
        return Err(Error::NothingStaged("upgrade blob has zero length".into()));
    }
    if len > from.size || len > to.size {
        return Err(Error::Flash(format!(
            "staged blob of {len} bytes exceeds a region ({:#x}/{:#x})",
            from.size, to.size
        )));
    }

    debug!(
        "commit {len} bytes {:#010x} -> {:#010x}",
        from.base, to.base
    );

    let mut copied = 0u32;
    let mut buf = vec![0u8; page_size as usize];
    while copied < len {
        let dest = to.base + copied;
        flash.erase_page(dest)?;

        let take = (len - copied).min(page_size) as usize;
        buf.fill(0xFF);
        flash.read(from.base + copied, &mut buf[..take])?;
        flash.write(dest, &buf)?;
        copied += page_size;
    }
    Ok(())
}

/// Erase the configured span while preserving the opaque token ranges.
///
/// Tokens are read out first, every page intersecting the span is erased,
/// and the tokens are written back immediately afterwards.
pub fn erase_storage<F: FlashDriver>(
    flash: &mut F,
    layout: &EraseLayout,
    page_size: u32,
) -> Result<()> {
    let Some(span) = layout.span else {
        return Err(Error::Config("no erase span configured".into()));
    };

    let mut snapshots = Vec::with_capacity(layout.preserved.len());
    for range in &layout.preserved {
        let mut data = vec![0u8; range.len as usize];
        flash.read(range.addr, &mut data)?;
        debug!(
            "preserving '{}' at {:#010x}+{}",
            range.purpose, range.addr, range.len
        );
        snapshots.push((range.addr, data));
    }

    // Erase all pages that start inside the span.
    let first_page = span.base & !(page_size - 1);
    let mut page = first_page;
    while page < span.end() {
        flash.erase_page(page)?;
        page += page_size;
    }

    for (addr, data) in snapshots {
        flash.write(addr, &data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreservedRange;
    use mem::MemFlash;

    const PAGE: u32 = 256;

    fn region(base: u32, size: u32) -> FlashRegion {
        FlashRegion::new(base, size)
    }

    #[test]
    fn test_writer_stages_page_aligned() {
        let mut flash = MemFlash::new(0x2000, PAGE);
        let mut w = FlashWriter::new(region(0x400, 0x800), PAGE);

        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        w.write(&mut flash, 0x400, &data).unwrap();
        w.finish(&mut flash).unwrap();

        let mut out = vec![0u8; 300];
        flash.read(0x400, &mut out).unwrap();
        assert_eq!(out, data);
        // Remainder of the second page is erased padding.
        let mut pad = [0u8; 4];
        flash.read(0x400 + 300, &mut pad).unwrap();
        assert_eq!(pad, [0xFF; 4]);
    }

    #[test]
    fn test_writer_fills_gaps_with_erased_bytes() {
        let mut flash = MemFlash::new(0x2000, PAGE);
        let mut w = FlashWriter::new(region(0x400, 0x800), PAGE);

        w.write(&mut flash, 0x400, &[0xAA; 8]).unwrap();
        // Skip ahead within the same page.
        w.write(&mut flash, 0x410, &[0xBB; 8]).unwrap();
        w.finish(&mut flash).unwrap();

        let mut out = [0u8; 0x18];
        flash.read(0x400, &mut out).unwrap();
        assert_eq!(&out[..8], &[0xAA; 8]);
        assert_eq!(&out[8..16], &[0xFF; 8]);
        assert_eq!(&out[16..24], &[0xBB; 8]);
    }

    #[test]
    fn test_writer_rejects_unordered_writes() {
        let mut flash = MemFlash::new(0x2000, PAGE);
        let mut w = FlashWriter::new(region(0x400, 0x800), PAGE);

        w.write(&mut flash, 0x500, &[1, 2, 3]).unwrap();
        let err = w.write(&mut flash, 0x4F0, &[4]).unwrap_err();
        assert!(matches!(err, Error::Flash(_)));
    }

    #[test]
    fn test_writer_rejects_out_of_region() {
        let mut flash = MemFlash::new(0x2000, PAGE);
        let mut w = FlashWriter::new(region(0x400, 0x100), PAGE);
        assert!(w.write(&mut flash, 0x4FF, &[0, 1]).is_err());
    }

    #[test]
    fn test_commit_staged_copies_blob() {
        let mut flash = MemFlash::new(0x2000, PAGE);
        let from = region(0x000, 0x800);
        let to = region(0x800, 0x800);

        let blob: Vec<u8> = (0..600u32).map(|i| (i ^ 0x5A) as u8).collect();
        let mut w = FlashWriter::new(from, PAGE);
        w.write(&mut flash, 0x000, &blob).unwrap();
        w.finish(&mut flash).unwrap();

        commit_staged(&mut flash, from, to, blob.len() as u32, PAGE).unwrap();

        let mut out = vec![0u8; blob.len()];
        flash.read(0x800, &mut out).unwrap();
        assert_eq!(out, blob);
    }

    #[test]
    fn test_commit_rejects_empty_and_oversized() {
        let mut flash = MemFlash::new(0x2000, PAGE);
        let from = region(0x000, 0x100);
        let to = region(0x800, 0x100);
        assert!(matches!(
            commit_staged(&mut flash, from, to, 0, PAGE),
            Err(Error::NothingStaged(_))
        ));
        assert!(commit_staged(&mut flash, from, to, 0x200, PAGE).is_err());
    }

    #[test]
    fn test_erase_preserves_token_ranges() {
        let mut flash = MemFlash::new(0x2000, PAGE);

        // Populate the span with recognizable data, tokens included.
        let mut w = FlashWriter::new(region(0x800, 0x800), PAGE);
        let body: Vec<u8> = (0..0x800u32).map(|i| i as u8).collect();
        w.write(&mut flash, 0x800, &body).unwrap();
        w.finish(&mut flash).unwrap();
        // Bytes outside the span.
        let mut w2 = FlashWriter::new(region(0x000, 0x100), PAGE);
        w2.write(&mut flash, 0x000, &[0x77; 0x100]).unwrap();
        w2.finish(&mut flash).unwrap();

        let before = flash.snapshot();

        let layout = EraseLayout {
            span: Some(region(0x800, 0x800)),
            preserved: vec![
                PreservedRange::new(0x880, 16, "device key"),
                PreservedRange::new(0xA40, 64, "signing token"),
            ],
        };
        erase_storage(&mut flash, &layout, PAGE).unwrap();
        let after = flash.snapshot();

        // Outside the span: untouched.
        assert_eq!(&after[..0x800], &before[..0x800]);
        assert_eq!(&after[0x1000..], &before[0x1000..]);
        // Preserved ranges: restored to their pre-erase values.
        assert_eq!(&after[0x880..0x890], &before[0x880..0x890]);
        assert_eq!(&after[0xA40..0xA80], &before[0xA40..0xA80]);
        // Everything else inside the span: erased.
        assert!(after[0x800..0x880].iter().all(|&b| b == 0xFF));
        assert!(after[0x890..0xA40].iter().all(|&b| b == 0xFF));
        assert!(after[0xA80..0x1000].iter().all(|&b| b == 0xFF));
    }
}

//! Streaming decompression for packed program-data tags.
//!
//! Raw-deflate payloads are inflated through a bounded working window and
//! re-emitted to the staged-write sink; the full decompressed size is never
//! memory-resident. State is resumable across arbitrary input chunk
//! boundaries.

use crate::error::{Error, Result};
use flate2::{Decompress, FlushDecompress, Status};

/// Size of the decompressed-output working window.
const WINDOW_SIZE: usize = 256;

/// Resumable raw-deflate decompressor.
pub struct InflateStream {
    inflate: Decompress,
    window: Vec<u8>,
    finished: bool,
}

impl InflateStream {
    /// Create a decompressor ready for a new stream.
    pub fn new() -> Self {
        Self {
            // Raw deflate, no zlib wrapper.
            inflate: Decompress::new(false),
            window: vec![0u8; WINDOW_SIZE],
            finished: false,
        }
    }

    /// Drop any in-flight stream and prepare for a new one.
    pub fn reset(&mut self) {
        self.inflate.reset(false);
        self.finished = false;
    }

    /// Whether the deflate stream has reached its end marker.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Inflate `input`, handing each window of output to `sink`.
    pub fn feed<S>(&mut self, mut input: &[u8], mut sink: S) -> Result<()>
    where
        S: FnMut(&[u8]) -> Result<()>,
    {
        if self.finished {
            if input.is_empty() {
                return Ok(());
            }
            return Err(Error::Malformed(
                "data after the end of a compressed stream".into(),
            ));
        }

        loop {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();

            let status = self
                .inflate
                .decompress(input, &mut self.window, FlushDecompress::None)
                .map_err(|e| Error::Malformed(format!("corrupt compressed stream: {e}")))?;

            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;

            if produced > 0 {
                sink(&self.window[..produced])?;
            }
            input = &input[consumed..];

            match status {
                Status::StreamEnd => {
                    self.finished = true;
                    if !input.is_empty() {
                        return Err(Error::Malformed(
                            "trailing bytes after the end of a compressed stream".into(),
                        ));
                    }
                    return Ok(());
                },
                Status::Ok | Status::BufError => {
                    // No forward progress means the stream needs more input
                    // than this chunk holds.
                    if consumed == 0 && produced == 0 {
                        return Ok(());
                    }
                },
            }
        }
    }
}

impl Default for InflateStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InflateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflateStream")
            .field("finished", &self.finished)
            .field("total_in", &self.inflate.total_in())
            .field("total_out", &self.inflate.total_out())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn inflate_chunked(compressed: &[u8], chunk: usize) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut s = InflateStream::new();
        for piece in compressed.chunks(chunk.max(1)) {
            s.feed(piece, |w| {
                out.extend_from_slice(w);
                Ok(())
            })
            .unwrap();
        }
        (out, s.finished())
    }

    #[test]
    fn test_roundtrip_whole_buffer() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (out, finished) = inflate_chunked(&deflate(&data), usize::MAX);
        assert_eq!(out, data);
        assert!(finished);
    }

    #[test]
    fn test_roundtrip_at_odd_chunk_sizes() {
        let data: Vec<u8> = (0..5_000u32).map(|i| (i * 31 % 253) as u8).collect();
        let compressed = deflate(&data);
        for chunk in [1usize, 7, 128] {
            let (out, finished) = inflate_chunked(&compressed, chunk);
            assert_eq!(out, data, "chunk size {chunk}");
            assert!(finished, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_truncated_stream_never_finishes() {
        let data = vec![0xA5u8; 4096];
        let compressed = deflate(&data);
        let (_, finished) = inflate_chunked(&compressed[..compressed.len() - 4], 64);
        assert!(!finished);
    }

    #[test]
    fn test_corrupt_stream_errors() {
        // BTYPE 0b11 is reserved and must be rejected by the inflater.
        let bogus = [0x06u8, 0x00, 0x00, 0x00];
        let mut s = InflateStream::new();
        let result = s.feed(&bogus, |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn test_reset_allows_new_stream() {
        let a = deflate(b"first stream");
        let b = deflate(b"second stream");
        let mut s = InflateStream::new();
        s.feed(&a, |_| Ok(())).unwrap();
        assert!(s.finished());
        s.reset();
        let mut out = Vec::new();
        s.feed(&b, |w| {
            out.extend_from_slice(w);
            Ok(())
        })
        .unwrap();
        assert_eq!(out, b"second stream");
    }
}

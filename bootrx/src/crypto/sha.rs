//! SHA-256 block-compression service and streaming adapter.
//!
//! The hash hardware this models consumes whole 64-byte blocks together
//! with a running eight-word state and returns the updated state; padding
//! and length bookkeeping stay with the caller. [`Sha256Stream`] is that
//! caller: it buffers partial blocks, appends the FIPS-180 padding and
//! produces the final digest with explicit byte-order conversions.

use crate::error::Result;
use sha2::compress256;

/// Bytes per compression block.
pub const BLOCK_SIZE: usize = 64;

/// Bytes in a finished digest.
pub const DIGEST_SIZE: usize = 32;

/// SHA-256 initial hash state (FIPS 180-4).
const INITIAL_STATE: [u32; 8] = [
    0x6A09_E667,
    0xBB67_AE85,
    0x3C6E_F372,
    0xA54F_F53A,
    0x510E_527F,
    0x9B05_688C,
    0x1F83_D9AB,
    0x5BE0_CD19,
];

/// Block-compression service: fixed-size blocks in, updated running state out.
pub trait HashEngine {
    /// Compress `blocks` (a multiple of [`BLOCK_SIZE`] bytes) into `state`.
    fn process_blocks(&mut self, state: &mut [u32; 8], blocks: &[u8]) -> Result<()>;
}

/// Software engine backed by the `sha2` compression function.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareHashEngine;

impl HashEngine for SoftwareHashEngine {
    fn process_blocks(&mut self, state: &mut [u32; 8], blocks: &[u8]) -> Result<()> {
        debug_assert!(blocks.len() % BLOCK_SIZE == 0);
        for block in blocks.chunks_exact(BLOCK_SIZE) {
            compress256(state, std::slice::from_ref(block.into()));
        }
        Ok(())
    }
}

/// Streaming SHA-256 over a block-compression engine.
#[derive(Debug)]
pub struct Sha256Stream<E: HashEngine> {
    engine: E,
    state: [u32; 8],
    buf: [u8; BLOCK_SIZE],
    buf_fill: usize,
    total_len: u64,
}

impl<E: HashEngine> Sha256Stream<E> {
    /// Start a fresh digest over the given engine.
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: INITIAL_STATE,
            buf: [0u8; BLOCK_SIZE],
            buf_fill: 0,
            total_len: 0,
        }
    }

    /// Discard all absorbed data and start over.
    pub fn reset(&mut self) {
        self.state = INITIAL_STATE;
        self.buf = [0u8; BLOCK_SIZE];
        self.buf_fill = 0;
        self.total_len = 0;
    }

    /// Absorb `data` into the running digest.
    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        self.total_len += data.len() as u64;

        if self.buf_fill > 0 {
            let take = data.len().min(BLOCK_SIZE - self.buf_fill);
            self.buf[self.buf_fill..self.buf_fill + take].copy_from_slice(&data[..take]);
            self.buf_fill += take;
            data = &data[take..];
            if self.buf_fill == BLOCK_SIZE {
                let block = self.buf;
                self.engine.process_blocks(&mut self.state, &block)?;
                self.buf_fill = 0;
            }
        }

        let whole = data.len() - data.len() % BLOCK_SIZE;
        if whole > 0 {
            self.engine.process_blocks(&mut self.state, &data[..whole])?;
        }

        let rest = &data[whole..];
        self.buf[..rest.len()].copy_from_slice(rest);
        self.buf_fill = rest.len();
        Ok(())
    }

    /// Append padding and produce the digest, consuming the stream state.
    pub fn finalize(mut self) -> Result<[u8; DIGEST_SIZE]> {
        let bit_len = self.total_len * 8;

        // 0x80 terminator, zero fill, 64-bit big-endian length.
        let msg_rem = self.buf_fill;
        let total = if msg_rem < 56 { BLOCK_SIZE } else { 2 * BLOCK_SIZE };
        let mut tail = [0u8; 2 * BLOCK_SIZE];
        tail[..msg_rem].copy_from_slice(&self.buf[..msg_rem]);
        tail[msg_rem] = 0x80;
        tail[total - 8..total].copy_from_slice(&bit_len.to_be_bytes());
        self.engine
            .process_blocks(&mut self.state, &tail[..total])?;

        let mut digest = [0u8; DIGEST_SIZE];
        for (word, out) in self.state.iter().zip(digest.chunks_exact_mut(4)) {
            out.copy_from_slice(&word.to_be_bytes());
        }
        Ok(digest)
    }
}

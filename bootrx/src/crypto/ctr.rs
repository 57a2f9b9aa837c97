//! AES-128 counter-mode keystream for the decryption sub-stream.
//!
//! The counter block is the 16-byte IV from the container, incremented as a
//! big-endian 128-bit integer per keystream block. The keystream position is
//! carried across arbitrarily sized chunks, so ciphertext may be fed to
//! [`CtrCipher::apply`] at any granularity.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};

/// AES block size in bytes.
const AES_BLOCK: usize = 16;

/// Resumable AES-128-CTR transform.
pub struct CtrCipher {
    cipher: Aes128,
    counter: [u8; AES_BLOCK],
    keystream: [u8; AES_BLOCK],
    used: usize,
}

impl CtrCipher {
    /// Start a counter-mode stream at the given IV.
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(key.into()),
            counter: *iv,
            keystream: [0u8; AES_BLOCK],
            used: AES_BLOCK, // force a fresh keystream block on first use
        }
    }

    fn next_keystream_block(&mut self) {
        self.keystream = self.counter;
        self.cipher.encrypt_block((&mut self.keystream).into());

        // Big-endian increment with carry across the whole counter block.
        for byte in self.counter.iter_mut().rev() {
            let (v, carry) = byte.overflowing_add(1);
            *byte = v;
            if !carry {
                break;
            }
        }
        self.used = 0;
    }

    /// XOR the running keystream into `buf` (encrypts and decrypts alike).
    pub fn apply(&mut self, buf: &mut [u8]) {
        for byte in buf {
            if self.used == AES_BLOCK {
                self.next_keystream_block();
            }
            *byte ^= self.keystream[self.used];
            self.used += 1;
        }
    }
}

impl std::fmt::Debug for CtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrCipher")
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F,
        0x3C,
    ];
    const IV: [u8; 16] = [
        0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE,
        0xFF,
    ];

    #[test]
    fn test_roundtrip() {
        let plain: Vec<u8> = (0..100u8).collect();
        let mut data = plain.clone();

        CtrCipher::new(&KEY, &IV).apply(&mut data);
        assert_ne!(data, plain);
        CtrCipher::new(&KEY, &IV).apply(&mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn test_chunked_apply_matches_one_shot() {
        let plain: Vec<u8> = (0..200u32).map(|i| (i * 3) as u8).collect();

        let mut whole = plain.clone();
        CtrCipher::new(&KEY, &IV).apply(&mut whole);

        // Splits that straddle keystream block boundaries.
        let mut split = plain.clone();
        let mut ctr = CtrCipher::new(&KEY, &IV);
        let (a, rest) = split.split_at_mut(1);
        let (b, rest) = rest.split_at_mut(14);
        let (c, d) = rest.split_at_mut(33);
        ctr.apply(a);
        ctr.apply(b);
        ctr.apply(c);
        ctr.apply(d);

        assert_eq!(whole, split);
    }

    #[test]
    fn test_counter_carry_wraps_into_higher_bytes() {
        // An IV ending in 0xFF..FF must carry into the upper bytes rather
        // than repeating the first keystream block.
        let iv = [0xFFu8; 16];
        let mut block_a = [0u8; 16];
        let mut block_b = [0u8; 16];
        let mut ctr = CtrCipher::new(&KEY, &iv);
        ctr.apply(&mut block_a);
        ctr.apply(&mut block_b);
        assert_ne!(block_a, block_b);
    }
}

//! Crypto capability interface for the image parser.
//!
//! Secure and plain builds of the original firmware differ in whether
//! decryption and signature verification exist at all. That build-time
//! split is modeled as the [`CryptoService`] trait with two
//! implementations, selected when the receiver is constructed:
//!
//! - [`SecureCrypto`]: AES-128-CTR decryption plus a running SHA-256 digest
//!   that the signature tag is checked against.
//! - [`PlainCrypto`]: neither; encrypted or signed containers are rejected
//!   with a key error, and image verification rests on the terminal-tag
//!   stream digest alone.

pub mod ctr;
pub mod sha;

use crate::error::{Error, Result};
use ctr::CtrCipher;
use sha::{DIGEST_SIZE, HashEngine, Sha256Stream, SoftwareHashEngine};

/// Capability surface the image parser consumes.
pub trait CryptoService {
    /// Forget all per-transfer state (digest, cipher).
    fn reset(&mut self);

    /// Absorb container bytes into the running authentication digest.
    fn digest_update(&mut self, data: &[u8]) -> Result<()>;

    /// Finish the running digest. `None` when authentication is unavailable.
    fn digest_finalize(&mut self) -> Result<Option<[u8; DIGEST_SIZE]>>;

    /// Arm the decryption sub-stream with the container IV.
    fn decrypt_begin(&mut self, iv: &[u8; 16]) -> Result<()>;

    /// Transform ciphertext to plaintext in place, continuing the stream.
    fn decrypt_apply(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Whether the image must carry a signature tag to be verifiable.
    fn signature_required(&self) -> bool;
}

/// Full capability: decrypt + authenticate available.
pub struct SecureCrypto<E: HashEngine = SoftwareHashEngine> {
    key: [u8; 16],
    digest: Sha256Stream<E>,
    cipher: Option<CtrCipher>,
    engine: E,
}

impl SecureCrypto<SoftwareHashEngine> {
    /// Create a secure capability with the injected device key.
    pub fn new(key: [u8; 16]) -> Self {
        Self::with_engine(key, SoftwareHashEngine)
    }
}

impl<E: HashEngine + Copy> SecureCrypto<E> {
    /// Create a secure capability over a specific hash engine.
    pub fn with_engine(key: [u8; 16], engine: E) -> Self {
        Self {
            key,
            digest: Sha256Stream::new(engine),
            cipher: None,
            engine,
        }
    }
}

impl<E: HashEngine + Copy> CryptoService for SecureCrypto<E> {
    fn reset(&mut self) {
        self.digest.reset();
        self.cipher = None;
    }

    fn digest_update(&mut self, data: &[u8]) -> Result<()> {
        self.digest.update(data)
    }

    fn digest_finalize(&mut self) -> Result<Option<[u8; DIGEST_SIZE]>> {
        let stream = std::mem::replace(&mut self.digest, Sha256Stream::new(self.engine));
        Ok(Some(stream.finalize()?))
    }

    fn decrypt_begin(&mut self, iv: &[u8; 16]) -> Result<()> {
        if self.cipher.is_some() {
            return Err(Error::KeyError("decryption stream already armed".into()));
        }
        self.cipher = Some(CtrCipher::new(&self.key, iv));
        Ok(())
    }

    fn decrypt_apply(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.cipher.as_mut() {
            Some(cipher) => {
                cipher.apply(buf);
                Ok(())
            },
            None => Err(Error::KeyError(
                "encrypted data before the decryption stream was armed".into(),
            )),
        }
    }

    fn signature_required(&self) -> bool {
        true
    }
}

impl<E: HashEngine> std::fmt::Debug for SecureCrypto<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCrypto")
            .field("cipher_armed", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

/// Reduced capability: no decryption, no signature verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCrypto;

impl PlainCrypto {
    /// Create the plain capability.
    pub fn new() -> Self {
        Self
    }
}

impl CryptoService for PlainCrypto {
    fn reset(&mut self) {}

    fn digest_update(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn digest_finalize(&mut self) -> Result<Option<[u8; DIGEST_SIZE]>> {
        Ok(None)
    }

    fn decrypt_begin(&mut self, _iv: &[u8; 16]) -> Result<()> {
        Err(Error::KeyError("decryption not available in this build".into()))
    }

    fn decrypt_apply(&mut self, _buf: &mut [u8]) -> Result<()> {
        Err(Error::KeyError("decryption not available in this build".into()))
    }

    fn signature_required(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_digest_roundtrip() {
        let mut svc = SecureCrypto::new([0u8; 16]);
        svc.digest_update(b"abc").unwrap();
        let digest = svc.digest_finalize().unwrap().expect("secure digest");
        // SHA-256("abc")
        assert_eq!(
            digest[..4],
            [0xBA, 0x78, 0x16, 0xBF],
            "digest prefix mismatch"
        );
    }

    #[test]
    fn test_secure_reset_clears_cipher_and_digest() {
        let mut svc = SecureCrypto::new([7u8; 16]);
        svc.decrypt_begin(&[1u8; 16]).unwrap();
        svc.digest_update(b"stale").unwrap();
        svc.reset();

        // Cipher must be re-armed after reset.
        let mut buf = [0u8; 4];
        assert!(svc.decrypt_apply(&mut buf).is_err());
        svc.digest_update(b"abc").unwrap();
        let digest = svc.digest_finalize().unwrap().unwrap();
        assert_eq!(digest[..2], [0xBA, 0x78]);
    }

    #[test]
    fn test_secure_rejects_double_arm() {
        let mut svc = SecureCrypto::new([7u8; 16]);
        svc.decrypt_begin(&[1u8; 16]).unwrap();
        assert!(matches!(
            svc.decrypt_begin(&[2u8; 16]),
            Err(Error::KeyError(_))
        ));
    }

    #[test]
    fn test_plain_has_no_capabilities() {
        let mut svc = PlainCrypto::new();
        assert!(svc.decrypt_begin(&[0u8; 16]).is_err());
        svc.digest_update(b"ignored").unwrap();
        assert_eq!(svc.digest_finalize().unwrap(), None);
        assert!(!svc.signature_required());
    }
}

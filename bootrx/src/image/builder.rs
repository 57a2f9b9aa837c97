//! Container builder for host-side tooling and test fixtures.
//!
//! Produces byte streams the streaming parser accepts: header first, then
//! content tags (optionally wrapped in an encrypted section), an optional
//! signature digest, and the terminal tag with the stream CRC-32.

use crate::crypto::ctr::CtrCipher;
use crate::error::{Error, Result};
use crate::image::container::{make_version, tag};
use byteorder::{ByteOrder, LittleEndian};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use sha2::{Digest, Sha256};
use std::io::Write;

fn push_tag(buf: &mut Vec<u8>, id: u32, payload: &[u8]) {
    let mut hdr = [0u8; 8];
    LittleEndian::write_u32(&mut hdr[..4], id);
    LittleEndian::write_u32(&mut hdr[4..], payload.len() as u32);
    buf.extend_from_slice(&hdr);
    buf.extend_from_slice(payload);
}

fn word_payload(prefix: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + body.len());
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, prefix);
    payload.extend_from_slice(&word);
    payload.extend_from_slice(body);
    payload
}

/// Incrementally assembles one firmware container.
#[derive(Debug)]
pub struct ContainerBuilder {
    buf: Vec<u8>,
    enc: Option<EncSection>,
}

#[derive(Debug)]
struct EncSection {
    iv: [u8; 16],
    plain: Vec<u8>,
}

impl ContainerBuilder {
    /// Start a container with the given format version word.
    pub fn new(format_version: u32) -> Self {
        let mut buf = Vec::new();
        push_tag(&mut buf, tag::HEADER, &word_payload(format_version, &[0, 0, 0, 0]));
        Self { buf, enc: None }
    }

    /// Start a container with the default supported format version.
    pub fn with_default_version() -> Self {
        Self::new(make_version(1, 1, 0))
    }

    fn sink(&mut self) -> &mut Vec<u8> {
        match self.enc.as_mut() {
            Some(section) => &mut section.plain,
            None => &mut self.buf,
        }
    }

    /// Declare the application version.
    pub fn app_info(&mut self, version: u32) -> &mut Self {
        let payload = word_payload(version, &[]);
        push_tag(self.sink(), tag::APPINFO, &payload);
        self
    }

    /// Append a free-form metadata tag.
    pub fn metadata(&mut self, data: &[u8]) -> &mut Self {
        push_tag(self.sink(), tag::METADATA, data);
        self
    }

    /// Append plain program data at the given application-region offset.
    pub fn prog(&mut self, offset: u32, data: &[u8]) -> &mut Self {
        let payload = word_payload(offset, data);
        push_tag(self.sink(), tag::PROG, &payload);
        self
    }

    /// Append deflate-compressed program data at the given offset.
    pub fn prog_packed(&mut self, offset: u32, data: &[u8]) -> Result<&mut Self> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data)?;
        let compressed = enc.finish()?;
        let payload = word_payload(offset, &compressed);
        push_tag(self.sink(), tag::PROG_PACKED, &payload);
        Ok(self)
    }

    /// Append a loader upgrade blob.
    pub fn loader(&mut self, version: u32, blob: &[u8]) -> &mut Self {
        let payload = word_payload(version, blob);
        push_tag(self.sink(), tag::LOADER, &payload);
        self
    }

    /// Append a sub-processor firmware blob.
    pub fn subproc(&mut self, version: u32, blob: &[u8]) -> &mut Self {
        let payload = word_payload(version, blob);
        push_tag(self.sink(), tag::SUBPROC, &payload);
        self
    }

    /// Raw tag escape hatch (tests exercise malformed containers with it).
    pub fn raw_tag(&mut self, id: u32, payload: &[u8]) -> &mut Self {
        push_tag(self.sink(), id, payload);
        self
    }

    /// Begin an encrypted section; subsequent content tags are collected as
    /// plaintext until [`end_encrypted`](Self::end_encrypted).
    pub fn begin_encrypted(&mut self, iv: [u8; 16]) -> Result<&mut Self> {
        if self.enc.is_some() {
            return Err(Error::Config("encrypted section already open".into()));
        }
        self.enc = Some(EncSection {
            iv,
            plain: Vec::new(),
        });
        Ok(self)
    }

    /// Encrypt the collected section with AES-128-CTR and emit it as an
    /// init tag plus ciphertext fragments of at most `fragment` bytes.
    pub fn end_encrypted(&mut self, key: &[u8; 16], fragment: usize) -> Result<&mut Self> {
        let section = self
            .enc
            .take()
            .ok_or_else(|| Error::Config("no encrypted section open".into()))?;

        push_tag(&mut self.buf, tag::ENC_INIT, &section.iv);

        let mut ciphertext = section.plain;
        CtrCipher::new(key, &section.iv).apply(&mut ciphertext);

        let fragment = if fragment == 0 {
            ciphertext.len().max(1)
        } else {
            fragment
        };
        for piece in ciphertext.chunks(fragment) {
            push_tag(&mut self.buf, tag::ENC_DATA, piece);
        }
        Ok(self)
    }

    fn check_closed(&self) -> Result<()> {
        if self.enc.is_some() {
            return Err(Error::Config("encrypted section left open".into()));
        }
        Ok(())
    }

    /// Append the signature tag: the SHA-256 digest of every byte that
    /// precedes its payload (the tag header included).
    pub fn sign(&mut self) -> Result<&mut Self> {
        self.check_closed()?;
        let mut hdr = [0u8; 8];
        LittleEndian::write_u32(&mut hdr[..4], tag::SIG);
        LittleEndian::write_u32(&mut hdr[4..], 32);

        let mut hasher = Sha256::new();
        hasher.update(&self.buf);
        hasher.update(hdr);
        let digest: [u8; 32] = hasher.finalize().into();

        self.buf.extend_from_slice(&hdr);
        self.buf.extend_from_slice(&digest);
        Ok(self)
    }

    /// Append the terminal tag with the stream CRC-32 and return the
    /// finished container.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.check_closed()?;
        let mut hdr = [0u8; 8];
        LittleEndian::write_u32(&mut hdr[..4], tag::END);
        LittleEndian::write_u32(&mut hdr[4..], 4);

        let mut crc = crc32fast::Hasher::new();
        crc.update(&self.buf);
        crc.update(&hdr);
        let crc = crc.finalize();

        self.buf.extend_from_slice(&hdr);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, crc);
        self.buf.extend_from_slice(&word);
        Ok(self.buf)
    }
}

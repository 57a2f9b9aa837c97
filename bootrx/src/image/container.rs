//! Streaming parser for the tagged firmware-image container.
//!
//! The container is a sequence of typed, length-prefixed tags:
//!
//! ```text
//! +-----------+-----------+- - - - - - - -+
//! |  tag id   |  length   |    payload    |
//! +-----------+-----------+- - - - - - - -+
//! |  4 bytes  |  4 bytes  | length bytes  |
//! +-----------+-----------+- - - - - - - -+
//! ```
//!
//! All integers are little-endian. The parser is fed arbitrarily sized,
//! non-aligned chunks of a much larger image and never assumes an entire
//! tag (let alone the image) is resident in memory: a partial tag header,
//! a partially read fixed-size payload, a half-inflated compressed stream
//! and the counter of the decryption sub-stream all survive chunk
//! boundaries inside [`ParserContext`].
//!
//! Verification is layered: the terminal tag carries a CRC-32 of the whole
//! stream, and the signature tag carries a SHA-256 digest checked through
//! the crypto capability. Both checks are soft in the sense that the
//! terminal tag can still complete the image (`completed = true`) while
//! pinning `verified = false`; structural faults abort parsing outright.

use crate::crypto::CryptoService;
use crate::error::{Error, Result};
use crate::flash::{FlashDriver, StagedFlash};
use crate::image::decompress::InflateStream;
use crate::image::{ContentFlags, ImageProperties};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

/// Container tag identifiers.
pub mod tag {
    /// Container header; must be the first tag.
    pub const HEADER: u32 = 0xEB17_17EB;
    /// Application info (version declaration).
    pub const APPINFO: u32 = 0xF40A_0AF4;
    /// Free-form metadata; ignorable from format minor 1 onwards.
    pub const METADATA: u32 = 0xF803_03F8;
    /// Loader upgrade blob.
    pub const LOADER: u32 = 0xF50B_0BF5;
    /// Sub-processor firmware blob.
    pub const SUBPROC: u32 = 0xF60C_0CF6;
    /// Plain program data.
    pub const PROG: u32 = 0xFD02_02FD;
    /// Deflate-compressed program data.
    pub const PROG_PACKED: u32 = 0xFB05_05FB;
    /// Arms the decryption sub-stream (16-byte counter IV).
    pub const ENC_INIT: u32 = 0xFA06_06FA;
    /// Ciphertext fragment of the encrypted inner tag stream.
    pub const ENC_DATA: u32 = 0xF907_07F9;
    /// SHA-256 digest of all preceding container bytes.
    pub const SIG: u32 = 0xF709_09F7;
    /// Terminal tag carrying the stream CRC-32.
    pub const END: u32 = 0xFC08_08FC;
}

/// Supported container format major version.
pub const SUPPORTED_MAJOR: u8 = 1;

/// Tag header size: id plus length.
const TAG_HEADER_SIZE: usize = 8;

/// Largest fixed-size payload head the parser buffers (the signature digest).
const SCRATCH_SIZE: usize = 32;

/// Pack a `major.minor.patch` triple into a format/firmware version word.
pub fn make_version(major: u8, minor: u8, patch: u16) -> u32 {
    (u32::from(major) << 24) | (u32::from(minor) << 16) | u32::from(patch)
}

fn version_major(v: u32) -> u8 {
    (v >> 24) as u8
}

fn version_minor(v: u32) -> u8 {
    (v >> 16) as u8
}

/// Outcome of feeding one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Chunk consumed; the container continues.
    Consumed,
    /// The terminal tag has been processed; further bytes are padding.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Prelude,
    Payload,
    Skip,
    Finished,
}

/// Resumable position within one tag stream (outer container or the
/// decrypted inner stream).
#[derive(Debug)]
struct TagCursor {
    stage: Stage,
    hdr: [u8; TAG_HEADER_SIZE],
    hdr_fill: usize,
    tag: u32,
    remaining: u32,
    scratch: [u8; SCRATCH_SIZE],
    scratch_fill: usize,
    scratch_need: usize,
    /// Absolute flash destination for streaming program/blob tags.
    dest: u32,
}

impl TagCursor {
    fn new() -> Self {
        Self {
            stage: Stage::Header,
            hdr: [0u8; TAG_HEADER_SIZE],
            hdr_fill: 0,
            tag: 0,
            remaining: 0,
            scratch: [0u8; SCRATCH_SIZE],
            scratch_fill: 0,
            scratch_need: 0,
            dest: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Expect the next tag header.
    fn begin_header(&mut self) {
        self.stage = Stage::Header;
        self.hdr_fill = 0;
    }

    /// Buffer a fixed-size payload head of `need` bytes.
    fn begin_prelude(&mut self, need: usize) {
        debug_assert!(need <= SCRATCH_SIZE);
        self.stage = Stage::Prelude;
        self.scratch_fill = 0;
        self.scratch_need = need;
    }

    /// Whether the cursor sits exactly between tags.
    fn at_boundary(&self) -> bool {
        matches!(self.stage, Stage::Header) && self.hdr_fill == 0
    }
}

/// Resumable streaming state for one transfer.
///
/// Allocated/reset at transfer start, discarded at transfer end; never
/// retained across transfers.
pub struct ParserContext {
    outer: TagCursor,
    inner: TagCursor,
    inflate: InflateStream,
    crc: crc32fast::Hasher,
    format_version: u32,
    seen_header: bool,
    enc_armed: bool,
    sig_seen: bool,
    sig_ok: bool,
    digest_open: bool,
    verify_fault: Option<Error>,
    finished: bool,
}

impl ParserContext {
    /// Fresh context, ready for the first chunk of a container.
    pub fn new() -> Self {
        Self {
            outer: TagCursor::new(),
            inner: TagCursor::new(),
            inflate: InflateStream::new(),
            crc: crc32fast::Hasher::new(),
            format_version: 0,
            seen_header: false,
            enc_armed: false,
            sig_seen: false,
            sig_ok: false,
            digest_open: true,
            verify_fault: None,
            finished: false,
        }
    }

    /// Re-arm for a new transfer, dropping every piece of carried state.
    pub fn reset(&mut self) {
        self.outer.reset();
        self.inner.reset();
        self.inflate.reset();
        self.crc = crc32fast::Hasher::new();
        self.format_version = 0;
        self.seen_header = false;
        self.enc_armed = false;
        self.sig_seen = false;
        self.sig_ok = false;
        self.digest_open = true;
        self.verify_fault = None;
        self.finished = false;
    }

    /// Soft verification fault recorded while completing the image, if any.
    pub fn take_verify_fault(&mut self) -> Option<Error> {
        self.verify_fault.take()
    }

    fn record_fault(&mut self, fault: Error) {
        debug!("verification fault: {fault}");
        if self.verify_fault.is_none() {
            self.verify_fault = Some(fault);
        }
    }

    /// Absorb wire bytes into the stream CRC and, while the digest span is
    /// open, into the authentication digest.
    fn absorb<C: CryptoService>(
        &mut self,
        crypto: &mut C,
        bytes: &[u8],
        crc: bool,
        hash: bool,
    ) -> Result<()> {
        if crc {
            self.crc.update(bytes);
        }
        if hash && self.digest_open {
            crypto.digest_update(bytes)?;
        }
        Ok(())
    }
}

impl Default for ParserContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ParserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserContext")
            .field("outer", &self.outer)
            .field("inner", &self.inner)
            .field("seen_header", &self.seen_header)
            .field("enc_armed", &self.enc_armed)
            .field("sig_seen", &self.sig_seen)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Feed one chunk of container bytes to the parser.
///
/// Chunks may split tag headers, fixed-size payload heads, compressed or
/// encrypted sub-streams, or span many tags; the final state is identical
/// for every chunking of the same byte stream.
pub fn feed<C: CryptoService, F: FlashDriver>(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    crypto: &mut C,
    staged: &mut StagedFlash,
    flash: &mut F,
    chunk: &[u8],
) -> Result<FeedOutcome> {
    let mut rest = chunk;
    while !rest.is_empty() && !ctx.finished {
        let consumed = step_outer(ctx, props, crypto, staged, flash, rest)?;
        debug_assert!(consumed > 0, "parser must make progress");
        rest = &rest[consumed..];
    }
    // Bytes after the terminal tag are transfer padding.
    Ok(if ctx.finished {
        FeedOutcome::Exhausted
    } else {
        FeedOutcome::Consumed
    })
}

fn step_outer<C: CryptoService, F: FlashDriver>(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    crypto: &mut C,
    staged: &mut StagedFlash,
    flash: &mut F,
    chunk: &[u8],
) -> Result<usize> {
    match ctx.outer.stage {
        Stage::Header => {
            let take = chunk.len().min(TAG_HEADER_SIZE - ctx.outer.hdr_fill);
            ctx.absorb(crypto, &chunk[..take], true, true)?;
            let fill = ctx.outer.hdr_fill;
            ctx.outer.hdr[fill..fill + take].copy_from_slice(&chunk[..take]);
            ctx.outer.hdr_fill += take;
            if ctx.outer.hdr_fill == TAG_HEADER_SIZE {
                let id = LittleEndian::read_u32(&ctx.outer.hdr[..4]);
                let len = LittleEndian::read_u32(&ctx.outer.hdr[4..]);
                open_outer_tag(ctx, props, id, len)?;
            }
            Ok(take)
        },
        Stage::Prelude => {
            let take = chunk
                .len()
                .min(ctx.outer.scratch_need - ctx.outer.scratch_fill);
            let (crc, hash) = match ctx.outer.tag {
                tag::END => (false, false),
                tag::SIG => (true, false),
                _ => (true, true),
            };
            ctx.absorb(crypto, &chunk[..take], crc, hash)?;
            let fill = ctx.outer.scratch_fill;
            ctx.outer.scratch[fill..fill + take].copy_from_slice(&chunk[..take]);
            ctx.outer.scratch_fill += take;
            ctx.outer.remaining -= take as u32;
            if ctx.outer.scratch_fill == ctx.outer.scratch_need {
                finish_outer_prelude(ctx, props, crypto, staged, flash)?;
            }
            Ok(take)
        },
        Stage::Payload => {
            let take = chunk.len().min(ctx.outer.remaining as usize);
            ctx.absorb(crypto, &chunk[..take], true, true)?;
            route_outer_payload(ctx, props, crypto, staged, flash, &chunk[..take])?;
            ctx.outer.remaining -= take as u32;
            if ctx.outer.remaining == 0 {
                end_streaming_tag(&mut ctx.outer, &ctx.inflate)?;
            }
            Ok(take)
        },
        Stage::Skip => {
            let take = chunk.len().min(ctx.outer.remaining as usize);
            ctx.absorb(crypto, &chunk[..take], true, true)?;
            ctx.outer.remaining -= take as u32;
            if ctx.outer.remaining == 0 {
                ctx.outer.begin_header();
            }
            Ok(take)
        },
        Stage::Finished => Ok(chunk.len()),
    }
}

/// Validate a freshly read outer tag header and set up its processing stage.
fn open_outer_tag(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    id: u32,
    len: u32,
) -> Result<()> {
    trace!("tag {id:#010x}, length {len}");
    if !ctx.seen_header && id != tag::HEADER {
        return Err(Error::Version(format!(
            "first tag {id:#010x} is not the container header"
        )));
    }

    ctx.outer.tag = id;
    ctx.outer.remaining = len;

    match id {
        tag::HEADER => {
            if ctx.seen_header {
                return Err(Error::Malformed("duplicate header tag".into()));
            }
            expect_len(id, len, 8)?;
            ctx.outer.begin_prelude(8);
        },
        tag::APPINFO => {
            if props.contents.contains(ContentFlags::APPLICATION) {
                return Err(Error::Malformed("duplicate application info tag".into()));
            }
            expect_len(id, len, 4)?;
            ctx.outer.begin_prelude(4);
        },
        tag::LOADER | tag::SUBPROC => {
            if props
                .contents
                .intersects(ContentFlags::LOADER | ContentFlags::SUBPROC)
            {
                return Err(Error::Malformed("multiple upgrade blobs in one image".into()));
            }
            expect_min_len(id, len, 4)?;
            ctx.outer.begin_prelude(4);
        },
        tag::PROG | tag::PROG_PACKED => {
            expect_min_len(id, len, 4)?;
            ctx.outer.begin_prelude(4);
        },
        tag::METADATA => {
            if version_minor(ctx.format_version) < 1 {
                return Err(Error::UnknownTag(id));
            }
            if len == 0 {
                ctx.outer.begin_header();
            } else {
                ctx.outer.stage = Stage::Skip;
            }
        },
        tag::ENC_INIT => {
            expect_len(id, len, 16)?;
            ctx.outer.begin_prelude(16);
        },
        tag::ENC_DATA => {
            if !ctx.enc_armed {
                return Err(Error::KeyError(
                    "encrypted data before the decryption stream was armed".into(),
                ));
            }
            if len == 0 {
                ctx.outer.begin_header();
            } else {
                ctx.outer.stage = Stage::Payload;
            }
        },
        tag::SIG => {
            if ctx.sig_seen {
                return Err(Error::SignatureInvalid("duplicate signature tag".into()));
            }
            if len != 32 {
                return Err(Error::SignatureInvalid(format!(
                    "signature tag length {len}, expected 32"
                )));
            }
            ctx.outer.begin_prelude(32);
        },
        tag::END => {
            expect_len(id, len, 4)?;
            ctx.outer.begin_prelude(4);
        },
        other => return Err(Error::UnknownTag(other)),
    }
    Ok(())
}

fn expect_len(id: u32, len: u32, want: u32) -> Result<()> {
    if len != want {
        return Err(Error::Malformed(format!(
            "tag {id:#010x} length {len}, expected {want}"
        )));
    }
    Ok(())
}

fn expect_min_len(id: u32, len: u32, min: u32) -> Result<()> {
    if len < min {
        return Err(Error::Malformed(format!(
            "tag {id:#010x} length {len}, expected at least {min}"
        )));
    }
    Ok(())
}

/// Act on a completed fixed-size payload head of the outer stream.
fn finish_outer_prelude<C: CryptoService, F: FlashDriver>(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    crypto: &mut C,
    staged: &mut StagedFlash,
    flash: &mut F,
) -> Result<()> {
    let word = LittleEndian::read_u32(&ctx.outer.scratch[..4]);
    match ctx.outer.tag {
        tag::HEADER => {
            if version_major(word) != SUPPORTED_MAJOR {
                return Err(Error::Version(format!(
                    "format version {word:#010x}, supported major is {SUPPORTED_MAJOR}"
                )));
            }
            ctx.format_version = word;
            ctx.seen_header = true;
            props.format_version = word;
            debug!("container format version {word:#010x}");
            ctx.outer.begin_header();
        },
        tag::APPINFO => {
            props.contents |= ContentFlags::APPLICATION;
            props.app_version = word;
            ctx.outer.begin_header();
        },
        tag::LOADER => {
            props.contents |= ContentFlags::LOADER;
            props.loader_version = word;
            props.loader_upgrade_size = ctx.outer.remaining;
            ctx.outer.dest = staged.upgrade.region().base;
            begin_blob_payload(&mut ctx.outer);
        },
        tag::SUBPROC => {
            props.contents |= ContentFlags::SUBPROC;
            props.subproc_version = word;
            props.subproc_upgrade_size = ctx.outer.remaining;
            ctx.outer.dest = staged.upgrade.region().base;
            begin_blob_payload(&mut ctx.outer);
        },
        tag::PROG => {
            ctx.outer.dest = prog_dest(staged, word)?;
            begin_blob_payload(&mut ctx.outer);
        },
        tag::PROG_PACKED => {
            ctx.outer.dest = prog_dest(staged, word)?;
            ctx.inflate.reset();
            if ctx.outer.remaining == 0 {
                return Err(Error::Malformed("empty compressed program tag".into()));
            }
            ctx.outer.stage = Stage::Payload;
        },
        tag::ENC_INIT => {
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&ctx.outer.scratch[..16]);
            crypto.decrypt_begin(&iv)?;
            ctx.enc_armed = true;
            ctx.outer.begin_header();
        },
        tag::SIG => {
            ctx.sig_seen = true;
            let digest = crypto.digest_finalize()?.ok_or_else(|| {
                Error::KeyError("cannot verify a signed image in this build".into())
            })?;
            ctx.digest_open = false;
            if digest == ctx.outer.scratch[..32] {
                ctx.sig_ok = true;
                debug!("image signature digest verified");
            } else {
                ctx.record_fault(Error::SignatureInvalid(
                    "image digest does not match the signature tag".into(),
                ));
            }
            ctx.outer.begin_header();
        },
        tag::END => {
            finish_container(ctx, props, crypto, staged, flash, word)?;
        },
        _ => unreachable!("prelude completed for a tag without one"),
    }
    Ok(())
}

fn begin_blob_payload(cursor: &mut TagCursor) {
    if cursor.remaining == 0 {
        cursor.begin_header();
    } else {
        cursor.stage = Stage::Payload;
    }
}

fn prog_dest(staged: &StagedFlash, offset: u32) -> Result<u32> {
    staged
        .app
        .region()
        .base
        .checked_add(offset)
        .ok_or_else(|| Error::Malformed(format!("program offset {offset:#010x} overflows")))
}

/// Checks that run when the terminal tag's payload is complete.
fn finish_container<C: CryptoService, F: FlashDriver>(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    crypto: &mut C,
    staged: &mut StagedFlash,
    flash: &mut F,
    expected_crc: u32,
) -> Result<()> {
    if !ctx.inner.at_boundary() {
        return Err(Error::Malformed(
            "encrypted sub-stream ends in the middle of a tag".into(),
        ));
    }
    if crypto.signature_required() && !ctx.sig_seen {
        return Err(Error::SignatureInvalid(
            "image ends without a signature tag".into(),
        ));
    }

    // Make every staged byte durable before declaring the image complete.
    staged.finish(flash)?;

    let actual = ctx.crc.clone().finalize();
    if actual != expected_crc {
        ctx.record_fault(Error::DigestMismatch {
            expected: expected_crc,
            actual,
        });
    }

    props.completed = true;
    props.verified = ctx.verify_fault.is_none();
    ctx.finished = true;
    ctx.outer.stage = Stage::Finished;
    debug!(
        "container complete: verified={}, contents={:?}",
        props.verified, props.contents
    );
    Ok(())
}

/// Route a slice of outer-tag payload to its sub-parser.
fn route_outer_payload<C: CryptoService, F: FlashDriver>(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    crypto: &mut C,
    staged: &mut StagedFlash,
    flash: &mut F,
    bytes: &[u8],
) -> Result<()> {
    match ctx.outer.tag {
        tag::PROG => {
            staged.app.write(flash, ctx.outer.dest, bytes)?;
            ctx.outer.dest += bytes.len() as u32;
        },
        tag::LOADER | tag::SUBPROC => {
            staged.upgrade.write(flash, ctx.outer.dest, bytes)?;
            ctx.outer.dest += bytes.len() as u32;
        },
        tag::PROG_PACKED => {
            let mut dest = ctx.outer.dest;
            ctx.inflate.feed(bytes, |window| {
                staged.app.write(flash, dest, window)?;
                dest += window.len() as u32;
                Ok(())
            })?;
            ctx.outer.dest = dest;
        },
        tag::ENC_DATA => {
            let mut plain = bytes.to_vec();
            crypto.decrypt_apply(&mut plain)?;
            feed_inner(ctx, props, staged, flash, &plain)?;
        },
        _ => unreachable!("payload routed for a non-streaming tag"),
    }
    Ok(())
}

/// End-of-payload bookkeeping for streaming tags.
fn end_streaming_tag(cursor: &mut TagCursor, inflate: &InflateStream) -> Result<()> {
    if cursor.tag == tag::PROG_PACKED && !inflate.finished() {
        return Err(Error::Malformed(
            "compressed program stream truncated at tag end".into(),
        ));
    }
    cursor.begin_header();
    Ok(())
}

/// Parse decrypted plaintext as the inner tag stream.
///
/// The inner stream wraps the plain/compressed program handling; its bytes
/// were already absorbed into the digest/CRC as ciphertext.
fn feed_inner<F: FlashDriver>(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    staged: &mut StagedFlash,
    flash: &mut F,
    plain: &[u8],
) -> Result<()> {
    let mut rest = plain;
    while !rest.is_empty() {
        let consumed = step_inner(ctx, props, staged, flash, rest)?;
        debug_assert!(consumed > 0, "inner parser must make progress");
        rest = &rest[consumed..];
    }
    Ok(())
}

fn step_inner<F: FlashDriver>(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    staged: &mut StagedFlash,
    flash: &mut F,
    chunk: &[u8],
) -> Result<usize> {
    match ctx.inner.stage {
        Stage::Header => {
            let take = chunk.len().min(TAG_HEADER_SIZE - ctx.inner.hdr_fill);
            let fill = ctx.inner.hdr_fill;
            ctx.inner.hdr[fill..fill + take].copy_from_slice(&chunk[..take]);
            ctx.inner.hdr_fill += take;
            if ctx.inner.hdr_fill == TAG_HEADER_SIZE {
                let id = LittleEndian::read_u32(&ctx.inner.hdr[..4]);
                let len = LittleEndian::read_u32(&ctx.inner.hdr[4..]);
                open_inner_tag(ctx, props, id, len)?;
            }
            Ok(take)
        },
        Stage::Prelude => {
            let take = chunk
                .len()
                .min(ctx.inner.scratch_need - ctx.inner.scratch_fill);
            let fill = ctx.inner.scratch_fill;
            ctx.inner.scratch[fill..fill + take].copy_from_slice(&chunk[..take]);
            ctx.inner.scratch_fill += take;
            ctx.inner.remaining -= take as u32;
            if ctx.inner.scratch_fill == ctx.inner.scratch_need {
                finish_inner_prelude(ctx, props, staged)?;
            }
            Ok(take)
        },
        Stage::Payload => {
            let take = chunk.len().min(ctx.inner.remaining as usize);
            match ctx.inner.tag {
                tag::PROG => {
                    staged.app.write(flash, ctx.inner.dest, &chunk[..take])?;
                    ctx.inner.dest += take as u32;
                },
                tag::LOADER | tag::SUBPROC => {
                    staged.upgrade.write(flash, ctx.inner.dest, &chunk[..take])?;
                    ctx.inner.dest += take as u32;
                },
                tag::PROG_PACKED => {
                    let mut dest = ctx.inner.dest;
                    ctx.inflate.feed(&chunk[..take], |window| {
                        staged.app.write(flash, dest, window)?;
                        dest += window.len() as u32;
                        Ok(())
                    })?;
                    ctx.inner.dest = dest;
                },
                _ => unreachable!("inner payload routed for a non-streaming tag"),
            }
            ctx.inner.remaining -= take as u32;
            if ctx.inner.remaining == 0 {
                end_streaming_tag(&mut ctx.inner, &ctx.inflate)?;
            }
            Ok(take)
        },
        Stage::Skip => {
            let take = chunk.len().min(ctx.inner.remaining as usize);
            ctx.inner.remaining -= take as u32;
            if ctx.inner.remaining == 0 {
                ctx.inner.begin_header();
            }
            Ok(take)
        },
        Stage::Finished => unreachable!("inner stream has no finished stage"),
    }
}

/// Tags allowed inside the encrypted sub-stream: the content tags the
/// plain/compressed handling covers, never nested crypto or terminals.
fn open_inner_tag(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    id: u32,
    len: u32,
) -> Result<()> {
    trace!("inner tag {id:#010x}, length {len}");
    ctx.inner.tag = id;
    ctx.inner.remaining = len;
    match id {
        tag::APPINFO => {
            if props.contents.contains(ContentFlags::APPLICATION) {
                return Err(Error::Malformed("duplicate application info tag".into()));
            }
            expect_len(id, len, 4)?;
            ctx.inner.begin_prelude(4);
        },
        tag::LOADER | tag::SUBPROC => {
            if props
                .contents
                .intersects(ContentFlags::LOADER | ContentFlags::SUBPROC)
            {
                return Err(Error::Malformed("multiple upgrade blobs in one image".into()));
            }
            expect_min_len(id, len, 4)?;
            ctx.inner.begin_prelude(4);
        },
        tag::PROG | tag::PROG_PACKED => {
            expect_min_len(id, len, 4)?;
            ctx.inner.begin_prelude(4);
        },
        tag::METADATA => {
            if version_minor(ctx.format_version) < 1 {
                return Err(Error::UnknownTag(id));
            }
            if len == 0 {
                ctx.inner.begin_header();
            } else {
                ctx.inner.stage = Stage::Skip;
            }
        },
        // A wrong key turns the plaintext to noise; this surfaces here.
        other => return Err(Error::UnknownTag(other)),
    }
    Ok(())
}

fn finish_inner_prelude(
    ctx: &mut ParserContext,
    props: &mut ImageProperties,
    staged: &mut StagedFlash,
) -> Result<()> {
    let word = LittleEndian::read_u32(&ctx.inner.scratch[..4]);
    match ctx.inner.tag {
        tag::APPINFO => {
            props.contents |= ContentFlags::APPLICATION;
            props.app_version = word;
            ctx.inner.begin_header();
        },
        tag::LOADER => {
            props.contents |= ContentFlags::LOADER;
            props.loader_version = word;
            props.loader_upgrade_size = ctx.inner.remaining;
            ctx.inner.dest = staged.upgrade.region().base;
            begin_blob_payload(&mut ctx.inner);
        },
        tag::SUBPROC => {
            props.contents |= ContentFlags::SUBPROC;
            props.subproc_version = word;
            props.subproc_upgrade_size = ctx.inner.remaining;
            ctx.inner.dest = staged.upgrade.region().base;
            begin_blob_payload(&mut ctx.inner);
        },
        tag::PROG => {
            ctx.inner.dest = prog_dest(staged, word)?;
            begin_blob_payload(&mut ctx.inner);
        },
        tag::PROG_PACKED => {
            ctx.inner.dest = prog_dest(staged, word)?;
            ctx.inflate.reset();
            if ctx.inner.remaining == 0 {
                return Err(Error::Malformed("empty compressed program tag".into()));
            }
            ctx.inner.stage = Stage::Payload;
        },
        _ => unreachable!("inner prelude completed for a tag without one"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;
    use crate::crypto::{PlainCrypto, SecureCrypto};
    use crate::flash::mem::MemFlash;
    use crate::image::builder::ContainerBuilder;

    const KEY: [u8; 16] = [0x42; 16];
    const IV: [u8; 16] = [0x17; 16];

    fn parse_with<C: CryptoService>(
        image: &[u8],
        chunk: usize,
        crypto: &mut C,
    ) -> (Result<FeedOutcome>, ImageProperties, MemFlash) {
        let cfg = BootConfig::default();
        let mut flash = MemFlash::new(0x8_0000, cfg.page_size);
        let mut staged = StagedFlash::new(&cfg);
        let mut ctx = ParserContext::new();
        let mut props = ImageProperties::default();
        let mut result = Ok(FeedOutcome::Consumed);
        for piece in image.chunks(chunk.max(1)) {
            result = feed(&mut ctx, &mut props, crypto, &mut staged, &mut flash, piece);
            if result.is_err() {
                break;
            }
        }
        (result, props, flash)
    }

    fn app_base() -> u32 {
        BootConfig::default().app_region.base
    }

    fn upgrade_base() -> u32 {
        BootConfig::default().upgrade_region.base
    }

    fn signed_app_image(data: &[u8]) -> Vec<u8> {
        let mut b = ContainerBuilder::with_default_version();
        b.app_info(make_version(2, 0, 1)).prog(0, data);
        b.sign().unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn test_end_to_end_at_every_chunk_size() {
        let data: Vec<u8> = (0..900u32).map(|i| (i % 241) as u8).collect();
        let image = signed_app_image(&data);

        let mut snapshots = Vec::new();
        for chunk in [1usize, 7, image.len()] {
            let mut crypto = SecureCrypto::new(KEY);
            let (result, props, flash) = parse_with(&image, chunk, &mut crypto);
            assert_eq!(result.unwrap(), FeedOutcome::Exhausted, "chunk {chunk}");
            assert!(props.completed, "chunk {chunk}");
            assert!(props.verified, "chunk {chunk}");
            assert!(props.contents.contains(ContentFlags::APPLICATION));
            assert_eq!(props.app_version, make_version(2, 0, 1));
            snapshots.push(flash.snapshot());
        }
        // Identical staged bytes regardless of chunk boundaries.
        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[1], snapshots[2]);

        // The program data actually landed in the application region.
        let base = app_base() as usize;
        assert_eq!(&snapshots[0][base..base + data.len()], &data[..]);
    }

    #[test]
    fn test_chunk_independence_with_all_substreams() {
        let plain: Vec<u8> = (0..600u32).map(|i| (i * 13 % 251) as u8).collect();
        let packed: Vec<u8> = (0..3000u32).map(|i| (i % 17) as u8).collect();
        let secret: Vec<u8> = (0..500u32).map(|i| (i * 7 % 239) as u8).collect();

        let mut b = ContainerBuilder::with_default_version();
        b.app_info(7).metadata(b"build id 1234");
        b.prog(0, &plain);
        b.prog_packed(0x1000, &packed).unwrap();
        b.begin_encrypted(IV).unwrap();
        b.prog(0x3000, &secret);
        b.end_encrypted(&KEY, 53).unwrap();
        b.sign().unwrap();
        let image = b.finish().unwrap();

        let mut snapshots = Vec::new();
        for chunk in [1usize, 7, 128, image.len()] {
            let mut crypto = SecureCrypto::new(KEY);
            let (result, props, flash) = parse_with(&image, chunk, &mut crypto);
            assert_eq!(result.unwrap(), FeedOutcome::Exhausted, "chunk {chunk}");
            assert!(props.completed && props.verified, "chunk {chunk}");
            snapshots.push(flash.snapshot());
        }
        for pair in snapshots.windows(2) {
            assert_eq!(pair[0], pair[1]);
        }

        let base = app_base() as usize;
        assert_eq!(&snapshots[0][base..base + plain.len()], &plain[..]);
        assert_eq!(
            &snapshots[0][base + 0x1000..base + 0x1000 + packed.len()],
            &packed[..]
        );
        assert_eq!(
            &snapshots[0][base + 0x3000..base + 0x3000 + secret.len()],
            &secret[..]
        );
    }

    #[test]
    fn test_padding_after_terminal_tag_is_ignored() {
        let mut image = signed_app_image(&[1, 2, 3, 4]);
        image.extend_from_slice(&[0u8; 64]);

        let mut crypto = SecureCrypto::new(KEY);
        let (result, props, _) = parse_with(&image, 128, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed && props.verified);
    }

    #[test]
    fn test_tampered_payload_completes_unverified() {
        let data = vec![0x5Au8; 300];
        let mut image = signed_app_image(&data);
        // Flip one program byte after it passed structural checks; headers
        // live in the first 16 bytes, so offset 40 is inside the payload.
        image[40] ^= 0x01;

        let mut crypto = SecureCrypto::new(KEY);
        let (result, props, _) = parse_with(&image, 32, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed);
        assert!(!props.verified);
    }

    #[test]
    fn test_corrupt_end_crc_completes_unverified() {
        let mut image = signed_app_image(&[9u8; 64]);
        let last = image.len() - 1;
        image[last] ^= 0xFF;

        let mut crypto = SecureCrypto::new(KEY);
        let (result, props, _) = parse_with(&image, 16, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed);
        assert!(!props.verified);
    }

    #[test]
    fn test_verify_fault_carries_status_code() {
        let data = vec![0x5Au8; 300];
        let mut image = signed_app_image(&data);
        image[40] ^= 0x01;

        let cfg = BootConfig::default();
        let mut flash = MemFlash::new(0x8_0000, cfg.page_size);
        let mut staged = StagedFlash::new(&cfg);
        let mut ctx = ParserContext::new();
        let mut props = ImageProperties::default();
        let mut crypto = SecureCrypto::new(KEY);
        feed(&mut ctx, &mut props, &mut crypto, &mut staged, &mut flash, &image).unwrap();

        let fault = ctx.take_verify_fault().expect("fault recorded");
        assert_eq!(fault.status_code(), 0x45);
    }

    #[test]
    fn test_unsupported_major_version() {
        let image = ContainerBuilder::new(make_version(2, 0, 0)).finish().unwrap();
        let mut crypto = PlainCrypto::new();
        let (result, props, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::Version(_)));
        assert!(!props.completed && !props.verified);
    }

    #[test]
    fn test_first_tag_must_be_header() {
        let mut image = Vec::new();
        let mut hdr = [0u8; 8];
        LittleEndian::write_u32(&mut hdr[..4], tag::APPINFO);
        LittleEndian::write_u32(&mut hdr[4..], 4);
        image.extend_from_slice(&hdr);
        image.extend_from_slice(&[0u8; 4]);

        let mut crypto = PlainCrypto::new();
        let (result, _, _) = parse_with(&image, 4, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::Version(_)));
    }

    #[test]
    fn test_unknown_tag_is_hard_error() {
        let mut b = ContainerBuilder::with_default_version();
        b.raw_tag(0x1122_3344, &[0u8; 10]);
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::UnknownTag(0x1122_3344)));
    }

    #[test]
    fn test_metadata_requires_format_minor() {
        // Format 1.1: metadata is flagged ignorable.
        let mut b = ContainerBuilder::new(make_version(1, 1, 0));
        b.metadata(b"notes");
        let image = b.finish().unwrap();
        let mut crypto = PlainCrypto::new();
        let (result, props, _) = parse_with(&image, 16, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed && props.verified);

        // Format 1.0: the same tag is unknown.
        let mut b = ContainerBuilder::new(make_version(1, 0, 0));
        b.metadata(b"notes");
        let image = b.finish().unwrap();
        let mut crypto = PlainCrypto::new();
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::UnknownTag(_)));
    }

    #[test]
    fn test_secure_build_requires_signature() {
        let mut b = ContainerBuilder::with_default_version();
        b.app_info(1).prog(0, &[1, 2, 3, 4]);
        let image = b.finish().unwrap();

        let mut crypto = SecureCrypto::new(KEY);
        let (result, props, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::SignatureInvalid(_)));
        assert!(!props.completed && !props.verified);
    }

    #[test]
    fn test_plain_build_verifies_by_stream_digest() {
        let mut b = ContainerBuilder::with_default_version();
        b.app_info(1).prog(0, &[1, 2, 3, 4]);
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, props, _) = parse_with(&image, 16, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed && props.verified);

        // A flipped payload byte leaves the image complete but unverified.
        let mut b = ContainerBuilder::with_default_version();
        b.app_info(1).prog(0, &[1, 2, 3, 4]);
        let mut image = b.finish().unwrap();
        image[30] ^= 0x80;
        let mut crypto = PlainCrypto::new();
        let (result, props, _) = parse_with(&image, 16, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed);
        assert!(!props.verified);
    }

    #[test]
    fn test_signed_image_rejected_without_capability() {
        let image = signed_app_image(&[8u8; 32]);
        let mut crypto = PlainCrypto::new();
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::KeyError(_)));
    }

    #[test]
    fn test_encrypted_data_requires_init_tag() {
        let mut b = ContainerBuilder::with_default_version();
        b.raw_tag(tag::ENC_DATA, &[0u8; 8]);
        let image = b.finish().unwrap();

        let mut crypto = SecureCrypto::new(KEY);
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::KeyError(_)));
    }

    #[test]
    fn test_encryption_rejected_by_plain_capability() {
        let mut b = ContainerBuilder::with_default_version();
        b.begin_encrypted(IV).unwrap();
        b.prog(0, &[1, 2, 3, 4]);
        b.end_encrypted(&KEY, 0).unwrap();
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::KeyError(_)));
    }

    #[test]
    fn test_wrong_key_fails_inner_stream() {
        let mut b = ContainerBuilder::with_default_version();
        b.begin_encrypted(IV).unwrap();
        b.prog(0, &[0xAAu8; 64]);
        b.end_encrypted(&KEY, 0).unwrap();
        b.sign().unwrap();
        let image = b.finish().unwrap();

        let mut crypto = SecureCrypto::new([0x99; 16]);
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(result.is_err());
    }

    #[test]
    fn test_truncated_compressed_stream() {
        let data = vec![0x33u8; 2048];
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut enc, &data).unwrap();
        let mut compressed = enc.finish().unwrap();
        compressed.truncate(compressed.len() - 4);

        let mut payload = vec![0u8; 4];
        payload.extend_from_slice(&compressed);
        let mut b = ContainerBuilder::with_default_version();
        b.raw_tag(tag::PROG_PACKED, &payload);
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, props, _) = parse_with(&image, 64, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::Malformed(_)));
        assert!(!props.completed);
    }

    #[test]
    fn test_duplicate_app_info_rejected() {
        let mut b = ContainerBuilder::with_default_version();
        b.app_info(1).app_info(2);
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::Malformed(_)));
    }

    #[test]
    fn test_loader_blob_staged_with_version() {
        let blob: Vec<u8> = (0..700u32).map(|i| (i % 199) as u8).collect();
        let mut b = ContainerBuilder::with_default_version();
        b.loader(make_version(1, 4, 0), &blob);
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, props, flash) = parse_with(&image, 33, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.contents.contains(ContentFlags::LOADER));
        assert_eq!(props.loader_version, make_version(1, 4, 0));
        assert_eq!(props.loader_upgrade_size, blob.len() as u32);

        let base = upgrade_base() as usize;
        assert_eq!(&flash.snapshot()[base..base + blob.len()], &blob[..]);
    }

    #[test]
    fn test_subproc_blob_staged_with_version() {
        let blob = vec![0xC3u8; 256];
        let mut b = ContainerBuilder::with_default_version();
        b.subproc(0x0003_0000, &blob);
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, props, _) = parse_with(&image, 16, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.contents.contains(ContentFlags::SUBPROC));
        assert_eq!(props.subproc_version, 0x0003_0000);
        assert_eq!(props.subproc_upgrade_size, blob.len() as u32);
    }

    #[test]
    fn test_encrypted_loader_blob_roundtrip() {
        let blob: Vec<u8> = (0..900u32).map(|i| (i * 11 % 201) as u8).collect();
        let mut b = ContainerBuilder::with_default_version();
        b.begin_encrypted(IV).unwrap();
        b.loader(make_version(2, 0, 0), &blob);
        b.end_encrypted(&KEY, 64).unwrap();
        b.sign().unwrap();
        let image = b.finish().unwrap();

        let mut crypto = SecureCrypto::new(KEY);
        let (result, props, flash) = parse_with(&image, 19, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed && props.verified);
        assert!(props.contents.contains(ContentFlags::LOADER));
        assert_eq!(props.loader_upgrade_size, blob.len() as u32);

        let base = upgrade_base() as usize;
        assert_eq!(&flash.snapshot()[base..base + blob.len()], &blob[..]);
    }

    #[test]
    fn test_two_upgrade_blobs_rejected() {
        let mut b = ContainerBuilder::with_default_version();
        b.loader(1, &[1, 2, 3]).subproc(2, &[4, 5, 6]);
        let image = b.finish().unwrap();

        let mut crypto = PlainCrypto::new();
        let (result, _, _) = parse_with(&image, 16, &mut crypto);
        assert!(matches!(result.unwrap_err(), Error::Malformed(_)));
    }

    #[test]
    fn test_truncated_container_never_completes() {
        let image = signed_app_image(&[7u8; 200]);
        let truncated = &image[..image.len() - 20];

        let mut crypto = SecureCrypto::new(KEY);
        let (result, props, _) = parse_with(truncated, 16, &mut crypto);
        assert_eq!(result.unwrap(), FeedOutcome::Consumed);
        assert!(!props.completed && !props.verified);
    }

    #[test]
    fn test_context_reset_discards_carried_state() {
        let cfg = BootConfig::default();
        let mut flash = MemFlash::new(0x8_0000, cfg.page_size);
        let mut staged = StagedFlash::new(&cfg);
        let mut ctx = ParserContext::new();
        let mut props = ImageProperties::default();
        let mut crypto = SecureCrypto::new(KEY);

        // Feed half an image, then abandon the transfer.
        let image = signed_app_image(&[1u8; 128]);
        feed(
            &mut ctx,
            &mut props,
            &mut crypto,
            &mut staged,
            &mut flash,
            &image[..image.len() / 2],
        )
        .unwrap();

        // New transfer: fresh state parses a whole image cleanly.
        ctx.reset();
        props.reset();
        crypto.reset();
        let mut staged = StagedFlash::new(&cfg);
        let outcome = feed(&mut ctx, &mut props, &mut crypto, &mut staged, &mut flash, &image);
        assert_eq!(outcome.unwrap(), FeedOutcome::Exhausted);
        assert!(props.completed && props.verified);
    }
}

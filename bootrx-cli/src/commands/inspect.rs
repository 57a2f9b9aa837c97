//! Offline container inspection.
//!
//! Runs the same streaming parser the receiver uses, against an in-memory
//! flash model, and reports the accumulated image properties. The file is
//! parsed three times at different chunk sizes as a self-check of the
//! parser's chunk-boundary independence.

use anyhow::{Context, Result, bail};
use bootrx::flash::mem::MemFlash;
use bootrx::{
    BootConfig, ContentFlags, CryptoService, FeedOutcome, ImageProperties, ParserContext,
    PlainCrypto, SecureCrypto, StagedFlash,
};
use console::style;
use std::path::Path;

use crate::config::Config;

fn parse_image<C: CryptoService>(
    data: &[u8],
    chunk: usize,
    crypto: &mut C,
    config: &BootConfig,
) -> bootrx::Result<(ImageProperties, FeedOutcome)> {
    let mut flash = MemFlash::new(0x10_0000, config.page_size);
    let mut staged = StagedFlash::new(config);
    let mut ctx = ParserContext::new();
    let mut props = ImageProperties::default();
    let mut outcome = FeedOutcome::Consumed;
    for piece in data.chunks(chunk.max(1)) {
        outcome = bootrx::image::feed(
            &mut ctx,
            &mut props,
            crypto,
            &mut staged,
            &mut flash,
            piece,
        )?;
    }
    Ok((props, outcome))
}

fn run_at_chunk_sizes(
    data: &[u8],
    key: Option<[u8; 16]>,
    config: &BootConfig,
) -> bootrx::Result<(ImageProperties, FeedOutcome)> {
    let mut last = None;
    for chunk in [1usize, 7, data.len().max(1)] {
        let result = match key {
            Some(key) => parse_image(data, chunk, &mut SecureCrypto::new(key), config)?,
            None => parse_image(data, chunk, &mut PlainCrypto::new(), config)?,
        };
        if let Some(ref prev) = last {
            debug_assert_eq!(prev, &result);
        }
        last = Some(result);
    }
    Ok(last.expect("at least one chunk size runs"))
}

fn version_string(v: u32) -> String {
    format!("{}.{}.{}", v >> 24, (v >> 16) & 0xFF, v & 0xFFFF)
}

pub(crate) fn cmd_inspect(
    config: &Config,
    image: &Path,
    key: Option<&str>,
    json: bool,
) -> Result<()> {
    let data = std::fs::read(image)
        .with_context(|| format!("Error reading {}", image.display()))?;
    let key = key.map(super::parse_key).transpose()?;
    let boot_config = config.boot_config()?;

    let parsed = run_at_chunk_sizes(&data, key, &boot_config);

    if json {
        let report = match &parsed {
            Ok((props, outcome)) => serde_json::json!({
                "ok": true,
                "data": {
                    "size": data.len(),
                    "exhausted": *outcome == FeedOutcome::Exhausted,
                    "completed": props.completed,
                    "verified": props.verified,
                    "format_version": version_string(props.format_version),
                    "application": props.contents.contains(ContentFlags::APPLICATION),
                    "loader": props.contents.contains(ContentFlags::LOADER),
                    "subproc": props.contents.contains(ContentFlags::SUBPROC),
                    "app_version": version_string(props.app_version),
                    "loader_version": version_string(props.loader_version),
                    "subproc_version": version_string(props.subproc_version),
                    "loader_upgrade_size": props.loader_upgrade_size,
                    "subproc_upgrade_size": props.subproc_upgrade_size,
                }
            }),
            Err(e) => serde_json::json!({
                "ok": false,
                "error": e.to_string(),
                "status_code": e.status_code(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return match parsed {
            Ok(_) => Ok(()),
            Err(e) => bail!("Error: {e}"),
        };
    }

    let (props, outcome) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => bail!("Error: {e} (status 0x{:02X})", e.status_code()),
    };

    eprintln!(
        "{}",
        style(format!("{}", image.display())).bold().underlined()
    );
    eprintln!("  size:            {} bytes", data.len());
    eprintln!("  format version:  {}", version_string(props.format_version));
    let verdict = if props.completed && props.verified {
        style("complete, verified").green()
    } else if props.completed {
        style("complete, NOT verified").red()
    } else if outcome == FeedOutcome::Exhausted {
        style("exhausted without completing").red()
    } else {
        style("truncated").red()
    };
    eprintln!("  verdict:         {verdict}");
    if props.contents.contains(ContentFlags::APPLICATION) {
        eprintln!("  application:     v{}", version_string(props.app_version));
    }
    if props.contents.contains(ContentFlags::LOADER) {
        eprintln!(
            "  loader upgrade:  v{} ({} bytes)",
            version_string(props.loader_version),
            props.loader_upgrade_size
        );
    }
    if props.contents.contains(ContentFlags::SUBPROC) {
        eprintln!(
            "  subproc upgrade: v{} ({} bytes)",
            version_string(props.subproc_version),
            props.subproc_upgrade_size
        );
    }
    if props.contents.is_empty() {
        eprintln!("  contents:        {}", style("none").dim());
    }

    if !(props.completed && props.verified) {
        bail!("image did not verify");
    }
    Ok(())
}

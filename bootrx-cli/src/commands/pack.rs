//! Build firmware containers from raw binaries.

use anyhow::{Context, Result, bail};
use bootrx::{ContainerBuilder, make_version};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Everything the `pack` subcommand needs.
pub(crate) struct PackRequest {
    pub output: PathBuf,
    pub app: Option<PathBuf>,
    pub app_version: u32,
    pub compress: bool,
    pub loader: Option<PathBuf>,
    pub loader_version: u32,
    pub subproc: Option<PathBuf>,
    pub subproc_version: u32,
    pub encrypt_key: Option<String>,
    pub sign: bool,
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Error reading {}", path.display()))
}

/// Content-derived counter IV: unique per payload, reproducible per pack.
fn derive_iv(inputs: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    for input in inputs {
        hasher.update(input);
    }
    let digest = hasher.finalize();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

pub(crate) fn cmd_pack(req: &PackRequest) -> Result<()> {
    if req.app.is_none() && req.loader.is_none() && req.subproc.is_none() {
        bail!("nothing to pack: give at least one of --app, --loader, --subproc");
    }
    if req.loader.is_some() && req.subproc.is_some() {
        bail!("--loader and --subproc are mutually exclusive in one image");
    }

    let encrypt_key = req
        .encrypt_key
        .as_deref()
        .map(super::parse_key)
        .transpose()?;

    let app = req.app.as_deref().map(read_input).transpose()?;
    let loader = req.loader.as_deref().map(read_input).transpose()?;
    let subproc = req.subproc.as_deref().map(read_input).transpose()?;

    let steps = 2 + u64::from(app.is_some()) + u64::from(loader.is_some())
        + u64::from(subproc.is_some());
    let progress = ProgressBar::new(steps).with_style(
        ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len}")
            .expect("static template"),
    );

    let mut builder = ContainerBuilder::new(make_version(1, 1, 0));

    if encrypt_key.is_some() {
        let inputs: Vec<&[u8]> = [app.as_deref(), loader.as_deref(), subproc.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        builder.begin_encrypted(derive_iv(&inputs))?;
    }

    if let Some(ref data) = app {
        progress.set_message("application");
        builder.app_info(req.app_version);
        if req.compress {
            builder.prog_packed(0, data)?;
        } else {
            builder.prog(0, data);
        }
        progress.inc(1);
    }

    if let Some(ref data) = loader {
        progress.set_message("loader upgrade");
        builder.loader(req.loader_version, data);
        progress.inc(1);
    }

    if let Some(ref data) = subproc {
        progress.set_message("sub-processor upgrade");
        builder.subproc(req.subproc_version, data);
        progress.inc(1);
    }

    if let Some(key) = encrypt_key {
        builder.end_encrypted(&key, 1024)?;
    }

    if req.sign {
        progress.set_message("signing");
        builder.sign()?;
    }
    progress.inc(1);

    progress.set_message("writing");
    let image = builder.finish()?;
    std::fs::write(&req.output, &image)
        .with_context(|| format!("Error writing {}", req.output.display()))?;
    progress.inc(1);
    progress.finish_and_clear();

    eprintln!(
        "{}",
        style(format!(
            "wrote {} ({} bytes)",
            req.output.display(),
            image.len()
        ))
        .green()
    );
    Ok(())
}

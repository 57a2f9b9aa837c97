//! Host the bootloader receiver on a real serial port.
//!
//! The far end of the cable plays the role of the firmware sender; this
//! process runs the device-side state machine against an in-memory flash
//! model, which makes it a convenient test bench for sender tooling.

use anyhow::{Context, Result, bail};
use bootrx::flash::mem::MemFlash;
use bootrx::{NativePort, PlainCrypto, Receiver, SecureCrypto, SysTimer};
use console::style;
use log::info;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::{Capability, Cli};

pub(crate) fn cmd_serve(
    cli: &Cli,
    config: &Config,
    capability: Capability,
    key: Option<&str>,
    flash_size: u32,
    dump: Option<&Path>,
) -> Result<()> {
    let port_name = cli
        .port
        .clone()
        .or_else(|| config.connection.serial.clone())
        .context("no serial port given (use --port or the config file)")?;
    let baud = cli.baud.or(config.connection.baud).unwrap_or(115200);

    // Cooperative cancellation: Ctrl-C flips a flag the run loop polls.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::Relaxed);
        })
        .context("failed to install Ctrl-C handler")?;
    }
    bootrx::set_interrupt_checker(move || interrupted.load(Ordering::Relaxed));

    let boot_config = config.boot_config()?;
    let port = NativePort::open(&port_name, baud)
        .with_context(|| format!("failed to open {port_name}"))?;
    let flash = MemFlash::new(flash_size, boot_config.page_size);

    info!("serving bootloader on {port_name} at {baud} baud");
    eprintln!(
        "{}",
        style(format!("bootrx receiver on {port_name} ({baud} baud), Ctrl-C to stop")).bold()
    );

    let (reason, flash) = match capability {
        Capability::Plain => {
            if key.is_some() {
                bail!("--key only applies to the secure capability");
            }
            let mut rx = Receiver::new(port, flash, SysTimer::new(), PlainCrypto::new(), boot_config)?;
            let reason = rx.run()?;
            let (_, flash) = rx.into_parts();
            (reason, flash)
        },
        Capability::Secure => {
            let key = key.context("secure capability needs --key")?;
            let key = super::parse_key(key)?;
            let mut rx = Receiver::new(
                port,
                flash,
                SysTimer::new(),
                SecureCrypto::new(key),
                boot_config,
            )?;
            let reason = rx.run()?;
            let (_, flash) = rx.into_parts();
            (reason, flash)
        },
    };

    eprintln!("{}", style(format!("reset requested: {reason:?}")).green());

    if let Some(path) = dump {
        std::fs::write(path, flash.snapshot())
            .with_context(|| format!("failed to write {}", path.display()))?;
        eprintln!("flash contents written to {}", path.display());
    }
    Ok(())
}

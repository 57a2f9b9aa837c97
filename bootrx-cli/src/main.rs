//! bootrx CLI - host the serial bootloader core and work with its images.
//!
//! ## Features
//!
//! - Host the receiver state machine on a real serial port (`serve`)
//! - Inspect firmware containers offline (`inspect`)
//! - Build firmware containers from raw binaries (`pack`)
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;

mod commands;
mod config;

use config::Config;

/// bootrx - serial firmware-update bootloader core, hosted on a PC.
///
/// Environment variables:
///   BOOTRX_PORT   - Default serial port
///   BOOTRX_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "bootrx")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "BOOTRX_PORT")]
    port: Option<String>,

    /// Baud rate (default: 115200, or the config file's value).
    #[arg(short, long, global = true, env = "BOOTRX_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Crypto capability the hosted receiver runs with.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Capability {
    /// No decryption/signature support; verification by stream digest.
    #[default]
    Plain,
    /// AES-CTR decryption and signature verification (needs --key).
    Secure,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Host the bootloader receiver on a serial port.
    Serve {
        /// Crypto capability of the hosted device.
        #[arg(long, value_enum, default_value = "plain")]
        capability: Capability,

        /// AES-128 key as 32 hex digits (secure capability only).
        #[arg(long, value_name = "HEX")]
        key: Option<String>,

        /// Size of the in-memory flash model in bytes.
        #[arg(long, default_value = "524288")]
        flash_size: u32,

        /// Write the final flash contents to this file on exit.
        #[arg(long, value_name = "PATH")]
        dump: Option<PathBuf>,
    },

    /// Parse a firmware container offline and report its properties.
    Inspect {
        /// Path to the container file.
        image: PathBuf,

        /// AES-128 key as 32 hex digits, for encrypted/signed images.
        #[arg(long, value_name = "HEX")]
        key: Option<String>,

        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Build a firmware container from raw binaries.
    Pack {
        /// Output container path.
        #[arg(short, long)]
        output: PathBuf,

        /// Application binary (staged at offset 0).
        #[arg(long)]
        app: Option<PathBuf>,

        /// Application version (hex, e.g. 0x01020003).
        #[arg(long, default_value = "0x01000000", value_parser = parse_hex_u32)]
        app_version: u32,

        /// Compress the application data.
        #[arg(long)]
        compress: bool,

        /// Loader upgrade binary.
        #[arg(long)]
        loader: Option<PathBuf>,

        /// Loader version (hex).
        #[arg(long, default_value = "0x01000000", value_parser = parse_hex_u32)]
        loader_version: u32,

        /// Sub-processor firmware binary.
        #[arg(long)]
        subproc: Option<PathBuf>,

        /// Sub-processor version (hex).
        #[arg(long, default_value = "0x01000000", value_parser = parse_hex_u32)]
        subproc_version: u32,

        /// Encrypt the content tags with this AES-128 key (32 hex digits).
        #[arg(long, value_name = "HEX")]
        encrypt_key: Option<String>,

        /// Append a signature digest tag.
        #[arg(long)]
        sign: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse hexadecimal value (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "bootrx v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Serve {
            capability,
            key,
            flash_size,
            dump,
        } => commands::serve::cmd_serve(
            &cli,
            &config,
            *capability,
            key.as_deref(),
            *flash_size,
            dump.as_deref(),
        ),
        Commands::Inspect { image, key, json } => {
            commands::inspect::cmd_inspect(&config, image, key.as_deref(), *json)
        },
        Commands::Pack {
            output,
            app,
            app_version,
            compress,
            loader,
            loader_version,
            subproc,
            subproc_version,
            encrypt_key,
            sign,
        } => commands::pack::cmd_pack(&commands::pack::PackRequest {
            output: output.clone(),
            app: app.clone(),
            app_version: *app_version,
            compress: *compress,
            loader: loader.clone(),
            loader_version: *loader_version,
            subproc: subproc.clone(),
            subproc_version: *subproc_version,
            encrypt_key: encrypt_key.clone(),
            sign: *sign,
        }),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

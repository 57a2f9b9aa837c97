//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod inspect;
pub(crate) mod pack;
pub(crate) mod serve;

use anyhow::{Context, Result, bail};

/// Parse a 32-hex-digit AES-128 key.
pub(crate) fn parse_key(hex: &str) -> Result<[u8; 16]> {
    let hex = hex.trim();
    if !hex.is_ascii() || hex.len() != 32 {
        bail!("key must be exactly 32 hex digits, got {:?}", hex);
    }
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .with_context(|| format!("invalid hex at key position {}", 2 * i))?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_roundtrip() {
        let key = parse_key("000102030405060708090A0B0C0D0E0F").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0x0F);
    }

    #[test]
    fn test_parse_key_rejects_bad_input() {
        assert!(parse_key("too short").is_err());
        assert!(parse_key("zz0102030405060708090A0B0C0D0E0F").is_err());
    }
}

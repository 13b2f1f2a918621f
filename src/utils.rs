// src/utils.rs
//
// Shared helpers: hex parsing with the wire bit order, record packing for
// the disk tables, and logging setup.
//
// All attack code works with LSB-first values: the bit that enters the
// shift register first is bit 0. Hex strings on the command line and in
// trace files are MSB-first, so UIDs, nonces and keys are bit-reversed on
// the way in and on the way out.

use anyhow::Result;
use env_logger::Builder;
use log::LevelFilter;

use crate::error::Error;

/// Initialize logging with customizable verbosity
pub fn init_logging(verbose: bool) -> Result<()> {
    let mut builder = Builder::new();

    if verbose {
        builder.filter_level(LevelFilter::Debug);
    } else {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.try_init()?;

    Ok(())
}

fn strip_0x(s: &str) -> &str {
    if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        rest
    } else {
        s
    }
}

/// Parse an 8-hex-char word (UID, nR) into the internal LSB-first order.
pub fn parse_hex32_rev(what: &'static str, s: &str) -> Result<u32, Error> {
    let h = strip_0x(s);
    if h.len() != 8 {
        return Err(Error::usage(what, format!("expected 8 hex chars, got '{}'", s)));
    }
    let v = u32::from_str_radix(h, 16)
        .map_err(|e| Error::usage(what, format!("'{}': {}", s, e)))?;
    Ok(v.reverse_bits())
}

/// Parse an 8-hex-char word (aR) as a plain MSB-first value.
pub fn parse_hex32_raw(what: &'static str, s: &str) -> Result<u32, Error> {
    let h = strip_0x(s);
    if h.len() != 8 {
        return Err(Error::usage(what, format!("expected 8 hex chars, got '{}'", s)));
    }
    u32::from_str_radix(h, 16).map_err(|e| Error::usage(what, format!("'{}': {}", s, e)))
}

/// Parse a 12-hex-char key into the internal LSB-first order.
pub fn parse_key(s: &str) -> Result<u64, Error> {
    let h = strip_0x(s);
    if h.len() != 12 {
        return Err(Error::usage("key", format!("expected 12 hex chars, got '{}'", s)));
    }
    let v = u64::from_str_radix(h, 16)
        .map_err(|e| Error::usage("key", format!("'{}': {}", s, e)))?;
    Ok(v.reverse_bits() >> 16)
}

/// Format an internal key in the wire order (12 uppercase hex chars).
pub fn format_key(key: u64) -> String {
    format!("{:012X}", key.reverse_bits() >> 16)
}

/// Write the low `len` bytes of `val` into `buf` big-endian first.
pub fn write_be_bytes(buf: &mut [u8], mut val: u64, len: usize) {
    for i in (0..len).rev() {
        buf[i] = (val & 0xff) as u8;
        val >>= 8;
    }
}

/// Format a byte slice to a hex string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Parse a comma-separated list of 1-based indices (`-p`/`-d` selectors).
/// `None` means "all".
pub fn parse_index_list(what: &'static str, arg: Option<&str>) -> Result<Option<Vec<usize>>, Error> {
    let arg = match arg {
        None => return Ok(None),
        Some(a) => a,
    };

    let mut out = Vec::new();
    for part in arg.split(',') {
        let idx: usize = part
            .trim()
            .parse()
            .map_err(|_| Error::usage(what, format!("'{}' is not a number", part)))?;
        if idx < 1 || idx > 16 {
            return Err(Error::usage(what, format!("index {} out of range 1..16", idx)));
        }
        out.push(idx);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex32_roundtrip_is_bit_reversal() {
        let v = parse_hex32_rev("uid", "2ab12bf2").unwrap();
        assert_eq!(v, 0x2ab12bf2u32.reverse_bits());
        assert_eq!(parse_hex32_rev("uid", "0x2ab12bf2").unwrap(), v);
    }

    #[test]
    fn key_roundtrip() {
        let k = parse_key("524B494D4E4C").unwrap();
        assert_eq!(format_key(k), "524B494D4E4C");
        assert!(k < (1u64 << 48));
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(parse_hex32_rev("uid", "123").is_err());
        assert!(parse_key("112233").is_err());
    }

    #[test]
    fn be_bytes_packing() {
        let mut buf = [0u8; 6];
        write_be_bytes(&mut buf, 0x0123456789ab, 6);
        assert_eq!(buf, [0x01, 0x23, 0x45, 0x67, 0x89, 0xab]);
    }

    #[test]
    fn index_lists() {
        assert_eq!(parse_index_list("platform", None).unwrap(), None);
        assert_eq!(
            parse_index_list("platform", Some("1,3")).unwrap(),
            Some(vec![1, 3])
        );
        assert!(parse_index_list("platform", Some("0")).is_err());
        assert!(parse_index_list("platform", Some("x")).is_err());
    }
}

// src/nonces.rs
//
// Loader for captured authentication traces. The file format is one pair
// per line, `<hex_nR> <hex_aR>`, both 8 hex chars with an optional 0x
// prefix. nR is the encrypted reader nonce as seen on the air.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::utils::parse_hex32_rev;

/// Attack 3 keeps up to 1024 pairs in memory; 136 good ones are enough.
pub const MAX_TRACES_PARTIAL_KEY: usize = 1024;
/// Attack 4 rarely benefits from more than 16 pairs; 32 is the hard cap.
pub const MAX_TRACES_CORRELATION: usize = 32;

/// One observed authentication exchange, fields in the internal LSB-first
/// bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trace {
    pub enc_nr: u32,
    pub ar: u32,
}

impl Trace {
    /// The response word as transmitted (MSB-first), for the verifier.
    pub fn ar_msb(&self) -> u32 {
        self.ar.reverse_bits()
    }

    /// The 32 keystream bits implied by the response, LSB-first. The
    /// response is the complement of the expected value, so the keystream
    /// is the complement of the response.
    pub fn keystream_lsb(&self) -> u32 {
        self.ar ^ 0xFFFF_FFFF
    }
}

/// Read up to `max` nR/aR pairs from a text file.
pub fn load_traces(path: &Path, max: usize) -> Result<Vec<Trace>> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

    let mut traces = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if traces.len() >= max {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (nr, ar) = match (fields.next(), fields.next(), fields.next()) {
            (Some(nr), Some(ar), None) => (nr, ar),
            _ => {
                return Err(Error::InputData {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    detail: format!("expected '<nR> <aR>', got '{}'", line.trim()),
                })
            }
        };

        let enc_nr = parse_hex32_rev("nR", nr).map_err(|e| Error::InputData {
            path: path.to_path_buf(),
            line: lineno + 1,
            detail: e.to_string(),
        })?;
        let ar = parse_hex32_rev("aR", ar).map_err(|e| Error::InputData {
            path: path.to_path_buf(),
            line: lineno + 1,
            detail: e.to_string(),
        })?;

        traces.push(Trace { enc_nr, ar });
    }

    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_pairs_with_and_without_prefix() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "0x4B71E49D 0x6A606453").unwrap();
        writeln!(f, "D79BD94B 16A2255B").unwrap();
        writeln!(f).unwrap();

        let traces = load_traces(f.path(), 32).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].enc_nr, 0x4B71E49Du32.reverse_bits());
        assert_eq!(traces[1].ar, 0x16A2255Bu32.reverse_bits());
        assert_eq!(traces[0].ar_msb(), 0x6A606453);
        assert_eq!(traces[0].keystream_lsb(), traces[0].ar ^ 0xFFFF_FFFF);
    }

    #[test]
    fn caps_at_max_and_rejects_garbage() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..5 {
            writeln!(f, "11111111 22222222").unwrap();
        }
        assert_eq!(load_traces(f.path(), 3).unwrap().len(), 3);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "11111111").unwrap();
        let err = load_traces(bad.path(), 3).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}

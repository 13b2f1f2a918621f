// src/attacks/table_search.rs
//
// Attack 2, search phase: slide a 48-bit window over the observed
// keystream, look the window up in the sorted table, verify any hit
// against the neighbouring 48 bits, then roll the recovered state back
// through the stream offset and the authentication to reach the
// post-init state and invert it to the key.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use memmap2::Mmap;

use crate::attacks::table_build::{sorted_bucket_path, RECORD_SIZE};
use crate::error::{Error, Result};
use crate::hitag2::{recover_key, Hitag2State};
use crate::utils::write_be_bytes;

/// A verified table hit.
#[derive(Debug, Clone, Copy)]
pub struct TableHit {
    /// State from the table record, generating the stream at `bit_offset`.
    pub state: u64,
    /// Bit position of the matching window in the observed stream.
    pub bit_offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchResult {
    pub key: u64,
    pub hit: TableHit,
}

/// Load an observed keystream from a hex dump, ignoring whitespace.
pub fn load_keystream(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();

    let bytes = hex::decode(&compact).map_err(|e| Error::InputData {
        path: path.to_path_buf(),
        line: 0,
        detail: format!("not a hex dump: {}", e),
    })?;

    if bytes.len() < 12 {
        return Err(Error::InputData {
            path: path.to_path_buf(),
            line: 0,
            detail: format!("only {} bytes of keystream, need at least 12", bytes.len()),
        });
    }
    Ok(bytes)
}

/// Extract the 48-bit window starting at `bit_offset` (bits are MSB-first
/// within bytes, matching the dump format).
fn make_candidate(data: &[u8], bit_offset: usize) -> Option<[u8; 6]> {
    if bit_offset + 48 > data.len() * 8 {
        return None;
    }
    let byte = bit_offset / 8;
    let bit = bit_offset % 8;

    let mut out = [0u8; 6];
    for (i, o) in out.iter_mut().enumerate() {
        *o = if bit == 0 {
            data[byte + i]
        } else {
            (data[byte + i] << bit) | (data[byte + i + 1] >> (8 - bit))
        };
    }
    Some(out)
}

/// Check a table record against the neighbouring window: the recorded
/// state stepped (or rolled back) 48 positions must reproduce it.
fn test_candidate(state: u64, expected: &[u8; 6], forward: bool) -> bool {
    let mut st = Hitag2State::from_state(state);
    if forward {
        st.nstep(48);
    } else {
        st.rollback(48);
    }

    let ks1 = st.nstep(24);
    let ks2 = st.nstep(24);
    let mut buf = [0u8; 6];
    write_be_bytes(&mut buf[0..3], ks1 as u64, 3);
    write_be_bytes(&mut buf[3..6], ks2 as u64, 3);
    buf == *expected
}

fn record_state(rec: &[u8]) -> u64 {
    let mut state = 0u64;
    for &b in &rec[4..10] {
        state = (state << 8) | b as u64;
    }
    state
}

/// Binary-search one sorted bucket for the candidate window and verify
/// every record sharing its 4-byte tail.
fn search_bucket(
    sorted_root: &Path,
    cand: &[u8; 6],
    expected: &[u8; 6],
    forward: bool,
) -> Result<Option<u64>> {
    let path = sorted_bucket_path(sorted_root, cand[0], cand[1]);
    let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
    let size = file.metadata().map_err(|e| Error::io(&path, e))?.len();
    if size == 0 {
        return Ok(None);
    }
    // read-only map of an immutable table file
    let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(&path, e))?;
    let data: &[u8] = &map;

    if data.len() % RECORD_SIZE != 0 {
        return Err(Error::Resource(format!(
            "bucket {} is truncated ({} bytes)",
            path.display(),
            data.len()
        )));
    }
    let n = data.len() / RECORD_SIZE;
    let key = &cand[2..6];

    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if &data[mid * RECORD_SIZE..mid * RECORD_SIZE + 4] < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    for idx in lo..n {
        let rec = &data[idx * RECORD_SIZE..(idx + 1) * RECORD_SIZE];
        if &rec[0..4] != key {
            break;
        }
        let state = record_state(rec);
        if test_candidate(state, expected, forward) {
            return Ok(Some(state));
        }
    }
    Ok(None)
}

/// Search the whole stream for a table hit, striding bit offsets across
/// `threads` workers. The first verified match wins; the others observe
/// the found flag at their next offset.
pub fn find_hit(sorted_root: &Path, data: &[u8], threads: usize) -> Result<Option<TableHit>> {
    let bitlen = data.len() * 8;
    if bitlen < 96 {
        return Ok(None);
    }
    let found = AtomicBool::new(false);
    let hit: Mutex<Option<TableHit>> = Mutex::new(None);
    let failure: Mutex<Option<Error>> = Mutex::new(None);

    thread::scope(|s| {
        for t in 0..threads {
            let (found, hit, failure) = (&found, &hit, &failure);
            s.spawn(move || {
                let mut i = t;
                while i + 48 <= bitlen {
                    if found.load(Ordering::Acquire) {
                        return;
                    }
                    if i % 1024 == 0 {
                        println!("searching on bit {}", i);
                    }

                    let cand = match make_candidate(data, i) {
                        Some(c) => c,
                        None => return,
                    };
                    // verify against the following 48 bits while enough
                    // stream remains, the preceding 48 otherwise
                    let (expected, forward) = if i < bitlen - 96 {
                        (make_candidate(data, i + 48), true)
                    } else {
                        (
                            i.checked_sub(48).and_then(|o| make_candidate(data, o)),
                            false,
                        )
                    };
                    let expected = match expected {
                        Some(e) => e,
                        None => return,
                    };

                    match search_bucket(sorted_root, &cand, &expected, forward) {
                        Ok(Some(state)) => {
                            found.store(true, Ordering::Release);
                            let mut slot = hit.lock().unwrap_or_else(|p| p.into_inner());
                            slot.get_or_insert(TableHit {
                                state,
                                bit_offset: i,
                            });
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            found.store(true, Ordering::Release);
                            let mut slot = failure.lock().unwrap_or_else(|p| p.into_inner());
                            slot.get_or_insert(e);
                            return;
                        }
                    }
                    i += threads;
                }
            });
        }
    });

    if let Some(e) = failure.into_inner().unwrap_or_else(|p| p.into_inner()) {
        return Err(e);
    }
    Ok(hit.into_inner().unwrap_or_else(|p| p.into_inner()))
}

/// Roll a hit back to the post-init state and invert the initialisation.
/// The observed stream begins 64 bits after init (the authentication
/// response and its trailer), so the rollback is `bit_offset + 64`.
pub fn key_from_hit(hit: TableHit, uid: u32, enc_nr: u32) -> u64 {
    let mut st = Hitag2State::from_state(hit.state);
    st.rollback(hit.bit_offset as u32);
    st.rollback(64);
    recover_key(st.shiftreg, uid, enc_nr)
}

/// Full search: locate a verified window, then recover the key.
pub fn search(
    sorted_root: &Path,
    keystream_file: &Path,
    uid: u32,
    enc_nr: u32,
    threads: usize,
) -> Result<Option<SearchResult>> {
    let data = load_keystream(keystream_file)?;
    let hit = match find_hit(sorted_root, &data, threads.max(1))? {
        Some(h) => h,
        None => return Ok(None),
    };
    Ok(Some(SearchResult {
        key: key_from_hit(hit, uid, enc_nr),
        hit,
    }))
}

/// Path helper for the generated test vectors.
pub fn keystream_file_name(key_hex: &str, uid_hex: &str, nr_hex: &str) -> PathBuf {
    PathBuf::from(format!(
        "keystream.key-{}.uid-{}.nR-{}",
        key_hex, uid_hex, nr_hex
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_windows() {
        let data = [0b1010_1010u8, 0xFF, 0x00, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11];
        assert_eq!(
            make_candidate(&data, 0).unwrap(),
            [0xAA, 0xFF, 0x00, 0x12, 0x34, 0x56]
        );
        // offset 4: nibble boundary
        assert_eq!(
            make_candidate(&data, 4).unwrap(),
            [0xAF, 0xF0, 0x01, 0x23, 0x45, 0x67]
        );
        assert_eq!(make_candidate(&data, 48).unwrap(), [0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11]);
        assert!(make_candidate(&data, 49).is_none());
    }

    #[test]
    fn forward_and_backward_verification() {
        let mut st = Hitag2State::from_state(0x7fee_21aa_90cd);
        let origin = st.shiftreg;
        st.nstep(48);
        let mid = st.shiftreg;

        // stream produced by the original state
        let ks1 = Hitag2State::from_state(origin).nstep(24);
        let ks2 = {
            let mut s = Hitag2State::from_state(origin);
            s.nstep(24);
            s.nstep(24)
        };
        let mut expected = [0u8; 6];
        write_be_bytes(&mut expected[0..3], ks1 as u64, 3);
        write_be_bytes(&mut expected[3..6], ks2 as u64, 3);

        assert!(test_candidate(mid, &expected, false));
        assert!(!test_candidate(mid, &expected, true));
    }
}

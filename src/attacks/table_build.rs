// src/attacks/table_build.rs
//
// Attack 2, build phase: enumerate PRNG states at a stride of 2048 and
// persist (keystream, state) records into 65,536 disk buckets, then sort
// every bucket. The finished table maps any 48 observed keystream bits
// back to the state that produced them.
//
// Each record is 16 bits of bucket path plus 10 bytes of payload:
// [ks bits 16..48 big-endian | state 6 bytes big-endian]. An interrupted
// build leaves an unusable table; there is no resume.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use chrono::Local;
use log::debug;

use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::hitag2::Hitag2State;
use crate::utils::write_be_bytes;

/// Payload bytes per record: 4 of keystream plus 6 of state (the first
/// two keystream bytes live in the file path).
pub const RECORD_SIZE: usize = 10;

/// States per enumeration stride.
pub const STRIDE: u64 = 2048;

pub fn unsorted_bucket_path(root: &Path, b0: u8, b1: u8) -> PathBuf {
    root.join("table")
        .join(format!("{:02x}", b0))
        .join(format!("{:02x}.bin", b1))
}

pub fn sorted_bucket_path(root: &Path, b0: u8, b1: u8) -> PathBuf {
    root.join("sorted")
        .join(format!("{:02x}", b0))
        .join(format!("{:02x}.bin", b1))
}

/// Precomputed linear image of an n-step advance. Stepping is linear over
/// GF(2), so the state after n steps is the XOR of the images of the set
/// bits; a 2048-step jump costs at most 48 XORs.
pub struct JumpTable {
    images: [u64; 48],
}

impl JumpTable {
    pub fn new(steps: u32) -> Self {
        let mut images = [0u64; 48];
        for (i, image) in images.iter_mut().enumerate() {
            let mut st = Hitag2State::from_state(1u64 << i);
            st.nstep(steps);
            *image = st.shiftreg;
        }
        JumpTable { images }
    }

    pub fn jump(&self, state: u64) -> u64 {
        let mut out = 0u64;
        for (i, image) in self.images.iter().enumerate() {
            if (state >> i) & 1 == 1 {
                out ^= image;
            }
        }
        out
    }
}

struct Bucket {
    path: PathBuf,
    buf: Mutex<Vec<u8>>,
}

/// The 65,536 append-only buckets. Buffers flush to disk when they reach
/// the configured capacity; locking is per bucket, never global.
pub struct BucketStore {
    buckets: Vec<Bucket>,
    capacity: usize,
}

impl BucketStore {
    pub fn create(root: &Path, capacity: usize) -> Result<Self> {
        for sub in ["table", "sorted"] {
            for b0 in 0..0x100usize {
                let dir = root.join(sub).join(format!("{:02x}", b0));
                fs::create_dir_all(&dir).map_err(|e| Error::io(dir, e))?;
            }
        }

        let mut buckets = Vec::with_capacity(0x10000);
        for b0 in 0..0x100u16 {
            for b1 in 0..0x100u16 {
                buckets.push(Bucket {
                    path: unsorted_bucket_path(root, b0 as u8, b1 as u8),
                    buf: Mutex::new(Vec::with_capacity(capacity)),
                });
            }
        }
        Ok(BucketStore { buckets, capacity })
    }

    /// Store one 12-byte entry; the first two bytes select the bucket.
    pub fn store(&self, entry: &[u8; 12]) -> Result<()> {
        let idx = ((entry[0] as usize) << 8) | entry[1] as usize;
        let bucket = &self.buckets[idx];

        let mut buf = bucket
            .buf
            .lock()
            .map_err(|_| Error::Resource("bucket lock poisoned".into()))?;
        buf.extend_from_slice(&entry[2..]);

        if buf.len() >= self.capacity {
            debug!("flushing bucket {:02x}{:02x}", entry[0], entry[1]);
            append_file(&bucket.path, &buf)?;
            buf.clear();
        }
        Ok(())
    }

    /// Write out whatever is still buffered.
    pub fn flush_all(&self) -> Result<()> {
        for bucket in &self.buckets {
            let mut buf = bucket
                .buf
                .lock()
                .map_err(|_| Error::Resource("bucket lock poisoned".into()))?;
            if !buf.is_empty() {
                append_file(&bucket.path, &buf)?;
                buf.clear();
            }
        }
        Ok(())
    }
}

fn append_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    f.write_all(data).map_err(|e| Error::io(path, e))
}

/// Pack one visited state into the 12-byte entry format.
fn make_entry(ks1: u32, ks2: u32, state: u64) -> [u8; 12] {
    let mut entry = [0u8; 12];
    write_be_bytes(&mut entry[0..3], ks1 as u64, 3);
    write_be_bytes(&mut entry[3..6], ks2 as u64, 3);
    write_be_bytes(&mut entry[6..12], state, 6);
    entry
}

fn build_worker(
    index: usize,
    cfg: &BuildConfig,
    store: &BucketStore,
    jump_stride: &JumpTable,
    jump_offset: &JumpTable,
) -> Result<()> {
    let mut state = Hitag2State::from_state(cfg.start_state);

    // walk to this thread's starting offset, 2048 states per jump
    for _ in 0..index {
        state = Hitag2State::from_state(jump_offset.jump(state.shiftreg));
    }

    let maxentries = cfg.entries_per_thread();
    for n in 0..maxentries {
        let mut probe = state;
        let ks1 = probe.nstep(24);
        let ks2 = probe.nstep(24);
        store.store(&make_entry(ks1, ks2, state.shiftreg))?;

        state = Hitag2State::from_state(jump_stride.jump(state.shiftreg));

        if n % (1u64 << 22) == 0 && n > 0 {
            println!(
                "[{}] build thread {}: {}/{} entries",
                Local::now().format("%H:%M:%S"),
                index,
                n,
                maxentries
            );
        }
    }
    Ok(())
}

fn sort_worker(index: usize, cfg: &BuildConfig) -> Result<()> {
    let space = 0x100 / cfg.sort_threads;

    for b0 in (index * space)..((index + 1) * space) {
        println!(
            "[{}] sort thread {}: processing buckets {:02x}/??",
            Local::now().format("%H:%M:%S"),
            index,
            b0
        );

        for b1 in 0..0x100usize {
            let infile = unsorted_bucket_path(&cfg.root_dir, b0 as u8, b1 as u8);
            // a bucket no state hashed into never got a file; the sorted
            // side still needs one so lookups can tell "empty" from
            // "table broken"
            let data = match fs::read(&infile) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(Error::io(&infile, e)),
            };
            if data.len() % RECORD_SIZE != 0 {
                return Err(Error::Resource(format!(
                    "bucket {} is truncated ({} bytes)",
                    infile.display(),
                    data.len()
                )));
            }

            let mut records: Vec<[u8; RECORD_SIZE]> = Vec::with_capacity(data.len() / RECORD_SIZE);
            for chunk in data.chunks_exact(RECORD_SIZE) {
                let mut rec = [0u8; RECORD_SIZE];
                rec.copy_from_slice(chunk);
                records.push(rec);
            }
            records.sort_unstable();

            let outfile = sorted_bucket_path(&cfg.root_dir, b0 as u8, b1 as u8);
            let f = File::create(&outfile).map_err(|e| Error::io(&outfile, e))?;
            let mut w = BufWriter::new(f);
            for rec in &records {
                w.write_all(rec).map_err(|e| Error::io(&outfile, e))?;
            }
            w.flush().map_err(|e| Error::io(&outfile, e))?;

            if !records.is_empty() {
                fs::remove_file(&infile).map_err(|e| Error::io(&infile, e))?;
            }
        }
    }
    Ok(())
}

/// Build and sort the full table. Roughly 1.2 TB on disk at the default
/// 2^37 states; any I/O error is fatal because a partial table is useless.
pub fn build_table(cfg: &BuildConfig) -> Result<()> {
    cfg.validate()?;

    let store = BucketStore::create(&cfg.root_dir, cfg.bucket_capacity)?;
    let jump_stride = JumpTable::new(STRIDE as u32 * cfg.thread_count as u32);
    let jump_offset = JumpTable::new(STRIDE as u32);

    println!(
        "[{}] building: {} threads, {} states each",
        Local::now().format("%H:%M:%S"),
        cfg.thread_count,
        cfg.entries_per_thread()
    );

    run_workers(cfg.thread_count, |i| {
        build_worker(i, cfg, &store, &jump_stride, &jump_offset)
    })?;

    store.flush_all()?;

    println!(
        "[{}] build done, sorting with {} threads",
        Local::now().format("%H:%M:%S"),
        cfg.sort_threads
    );

    run_workers(cfg.sort_threads, |i| sort_worker(i, cfg))?;

    println!("[{}] table ready", Local::now().format("%H:%M:%S"));
    Ok(())
}

/// Spawn `count` workers and surface the first failure.
fn run_workers<F>(count: usize, work: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Sync,
{
    let work = &work;
    let failure: Mutex<Option<Error>> = Mutex::new(None);

    thread::scope(|s| {
        for i in 0..count {
            let failure = &failure;
            s.spawn(move || {
                if let Err(e) = work(i) {
                    let mut slot = failure.lock().unwrap_or_else(|p| p.into_inner());
                    slot.get_or_insert(e);
                }
            });
        }
    });

    match failure.into_inner().unwrap_or_else(|p| p.into_inner()) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_table_matches_stepping() {
        let jt = JumpTable::new(2048);
        let mut st = Hitag2State::from_state(0x1234_5678_9abc);
        let jumped = jt.jump(st.shiftreg);
        st.nstep(2048);
        assert_eq!(jumped, st.shiftreg);
    }

    #[test]
    fn entry_layout_is_big_endian() {
        let e = make_entry(0x00123456, 0x00abcdef, 0x0123_4567_89ab);
        assert_eq!(
            e,
            [0x12, 0x34, 0x56, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab]
        );
    }

    #[test]
    fn store_flushes_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketStore::create(dir.path(), 20).unwrap();

        let e = make_entry(0xAB1200, 0, 1);
        store.store(&e).unwrap();
        let path = unsorted_bucket_path(dir.path(), 0xab, 0x12);
        assert!(!path.exists());

        store.store(&e).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 20);

        store.store(&e).unwrap();
        store.flush_all().unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 30);
    }
}

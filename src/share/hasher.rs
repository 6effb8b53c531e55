//! Background hashing: a worker thread walks files queued for hashing and
//! reports `(path, size, tth, leaf_blob)` back over a channel, the way the
//! reference client's `fl_hash_*` queue works but expressed as a Rust
//! worker + channel pair instead of a glib idle callback.

use crate::tth::{Tth, TreeHasher};
use crossbeam::channel::{Receiver, Sender};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct HashJob {
    pub virtual_path: String,
    pub local_path: PathBuf,
}

pub struct HashResult {
    pub virtual_path: String,
    pub size: u64,
    pub tth: Tth,
    pub leaf_blob: Vec<u8>,
}

/// Bumped every time the queue is reset (a refresh superseding an
/// in-flight hash pass); a worker checks this before reporting a result so
/// a stale hash never gets applied to the tree.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicU64>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    pub fn generation(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Spawn the single background hashing worker. Jobs arrive on `jobs`;
/// completed hashes (tagged with the generation they were computed under)
/// go out on the returned receiver.
pub fn spawn_worker(
    jobs: Receiver<HashJob>,
    cancel: CancelToken,
) -> (std::thread::JoinHandle<()>, Receiver<(u64, HashResult)>) {
    let (tx, rx): (Sender<(u64, HashResult)>, Receiver<(u64, HashResult)>) = crossbeam::channel::unbounded();
    let handle = std::thread::spawn(move || {
        for job in jobs {
            let generation = cancel.generation();
            match hash_file(&job.local_path) {
                Ok((size, tth, leaf_blob)) => {
                    if cancel.generation() != generation {
                        continue; // superseded by a refresh while we were hashing
                    }
                    let result = HashResult { virtual_path: job.virtual_path, size, tth, leaf_blob };
                    if tx.send((generation, result)).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("hashing {:?} failed: {e}", job.local_path),
            }
        }
    });
    (handle, rx)
}

fn hash_file(path: &PathBuf) -> std::io::Result<(u64, Tth, Vec<u8>)> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let mut hasher = TreeHasher::new(size);
    let leaf_size = hasher.leaf_size() as usize;
    let mut buf = vec![0u8; leaf_size];
    loop {
        let mut filled = 0;
        while filled < leaf_size {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        hasher.update_leaf(&buf[..filled]);
        if filled < leaf_size {
            break;
        }
    }
    let (tth, leaf_blob) = hasher.finish();
    Ok((size, tth, leaf_blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashing_small_file_matches_in_memory_hash() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let (size, tth, blob) = hash_file(&tmp.path().to_path_buf()).unwrap();
        assert_eq!(size, 11);
        let (expected_tth, expected_blob) = crate::tth::hash_bytes(b"hello world");
        assert_eq!(tth, expected_tth);
        assert_eq!(blob, expected_blob);
    }

    #[test]
    fn cancel_token_generation_increments_on_bump() {
        let token = CancelToken::new();
        let g0 = token.generation();
        token.bump();
        assert_eq!(token.generation(), g0 + 1);
    }
}

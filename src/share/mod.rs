//! §4.5 Share index: the local file-list tree, the TTH -> path lookup it's
//! searched and downloaded through, and the background hasher that keeps
//! both in sync with disk.

pub mod hasher;
pub mod tree;

use crate::tth::Tth;
use hasher::{CancelToken, HashJob, HashResult};
use std::collections::HashMap;
use std::path::PathBuf;
use tree::ShareTree;

/// The complete local share: the directory tree callers search by path,
/// and a hash-keyed index the download queue and CC layer search by TTH.
pub struct ShareIndex {
    tree: ShareTree,
    by_tth: HashMap<Tth, Vec<String>>,
    leaf_blobs: HashMap<Tth, Vec<u8>>,
    roots: HashMap<String, PathBuf>,
    cancel: CancelToken,
}

impl ShareIndex {
    pub fn new() -> Self {
        Self {
            tree: ShareTree::new(),
            by_tth: HashMap::new(),
            leaf_blobs: HashMap::new(),
            roots: HashMap::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn add_root(&mut self, virtual_name: String, local_path: PathBuf) {
        self.tree.add_root(virtual_name.clone());
        self.roots.insert(virtual_name, local_path);
    }

    /// Apply a completed background-hash result to the index.
    pub fn apply_hash_result(&mut self, virtual_path: String, result: HashResult) {
        self.tree.insert_file(&virtual_path, result.size, result.tth);
        self.by_tth.entry(result.tth).or_default().push(virtual_path);
        self.leaf_blobs.insert(result.tth, result.leaf_blob);
    }

    pub fn lookup_path(&self, path: &str) -> Option<&tree::Node> {
        self.tree.lookup(path)
    }

    pub fn lookup_tth(&self, tth: &Tth) -> Option<&str> {
        self.by_tth.get(tth).and_then(|paths| paths.first()).map(String::as_str)
    }

    pub fn leaf_blob(&self, tth: &Tth) -> Option<&[u8]> {
        self.leaf_blobs.get(tth).map(Vec::as_slice)
    }

    pub fn total_size(&self) -> u64 {
        self.tree.walk_files().iter().map(|(_, size, _)| size).sum()
    }

    /// Every shared file as `(virtual path, size, TTH)`, for building the
    /// file list served to peers.
    pub fn all_files(&self) -> Vec<(String, u64, Tth)> {
        self.tree.walk_files()
    }

    /// Walk a root's filesystem subtree, diffing it against what's
    /// currently indexed: files that disappeared are dropped immediately,
    /// files that are new or whose size changed are queued for hashing.
    /// Cancels (bumps the generation on) any in-flight hash pass so stale
    /// results from the previous refresh are discarded.
    pub fn refresh(&mut self, root_name: &str, jobs: &crossbeam::channel::Sender<HashJob>) -> std::io::Result<usize> {
        let Some(local_root) = self.roots.get(root_name).cloned() else {
            return Ok(0);
        };
        self.cancel.bump();

        let existing: HashMap<String, u64> = self
            .tree
            .walk_files()
            .into_iter()
            .filter(|(path, _, _)| path.starts_with(root_name))
            .map(|(path, size, _)| (path, size))
            .collect();

        let mut seen = std::collections::HashSet::new();
        let mut queued = 0;
        walk_fs(&local_root, root_name, &mut |virtual_path, local_path, size| {
            seen.insert(virtual_path.clone());
            if existing.get(&virtual_path) != Some(&size) {
                let _ = jobs.send(HashJob { virtual_path, local_path });
                queued += 1;
            }
        })?;

        for path in existing.keys() {
            if !seen.contains(path) {
                self.tree.remove(path);
            }
        }
        Ok(queued)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Default for ShareIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive sorted directory walk, so refreshes are deterministic
/// regardless of the underlying filesystem's native ordering.
fn walk_fs(
    local_dir: &PathBuf,
    virtual_prefix: &str,
    visit: &mut impl FnMut(String, PathBuf, u64),
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(local_dir)?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name().to_string_lossy().to_lowercase());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let virtual_path = format!("{virtual_prefix}/{name}");
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk_fs(&entry.path(), &virtual_path, visit)?;
        } else if meta.is_file() {
            visit(virtual_path, entry.path(), meta.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn apply_hash_result_indexes_both_ways() {
        let mut idx = ShareIndex::new();
        idx.add_root("music".into(), "/tmp".into());
        let result = HashResult { virtual_path: "music/a.mp3".into(), size: 5, tth: [9u8; 24], leaf_blob: vec![0; 24] };
        idx.apply_hash_result("music/a.mp3".into(), result);
        assert!(idx.lookup_path("music/a.mp3").is_some());
        assert_eq!(idx.lookup_tth(&[9u8; 24]), Some("music/a.mp3"));
    }

    #[test]
    fn refresh_queues_new_files_and_drops_removed_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("a.txt")).unwrap().write_all(b"hi").unwrap();

        let mut idx = ShareIndex::new();
        idx.add_root("r".into(), dir.path().to_path_buf());
        let (tx, rx) = crossbeam::channel::unbounded();
        let queued = idx.refresh("r", &tx).unwrap();
        assert_eq!(queued, 1);
        assert!(rx.try_recv().is_ok());

        // simulate the hash completing
        idx.tree.insert_file("r/a.txt", 2, [1u8; 24]);

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        idx.refresh("r", &tx).unwrap();
        assert!(idx.lookup_path("r/a.txt").is_none());
    }
}

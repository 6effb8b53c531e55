//! §4.2 TTH engine: Tiger Tree Hash construction, block enumeration and
//! root/leaf verification.
//!
//! Tiger is a 192-bit hash with a 64-byte block size; the `tiger` crate
//! gives us a streaming `Digest` implementation over the raw 24-byte
//! output. A Tiger Tree Hash is a binary Merkle tree over fixed-size leaves
//! of a file, each leaf tagged with byte `0x00` and each internal node
//! tagged with byte `0x01` before hashing, per the TTH specification.

use digest::Digest;

/// Smallest leaf size we'll ever choose.
const MIN_LEAF: u64 = 1024;

/// Number of leaves we try to keep the tree down to when picking a leaf
/// size for a file (the "keep-level" spec.md §4.2 refers to).
const KEEP_LEVEL_LEAVES: u64 = 1 << 10; // 1024 leaves

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

/// A 24-byte Tiger digest — used for both TTH leaves and the tree root.
pub type Tth = [u8; 24];

fn tiger_hash(tag: u8, data: &[u8]) -> Tth {
    let mut hasher = tiger::Tiger::new();
    hasher.update([tag]);
    hasher.update(data);
    let out = hasher.finalize();
    let mut tth = [0u8; 24];
    tth.copy_from_slice(&out);
    tth
}

/// Choose the smallest leaf size (a power of two, >= 1024) that keeps the
/// number of leaves at or below `KEEP_LEVEL_LEAVES`.
pub fn choose_leaf_size(file_size: u64) -> u64 {
    let mut leaf = MIN_LEAF;
    while num_blocks(file_size, leaf) > KEEP_LEVEL_LEAVES {
        leaf *= 2;
    }
    leaf
}

/// `ceil(size / leaf)`, but never less than 1 (an empty file still hashes
/// to a single empty leaf).
pub fn num_blocks(size: u64, leaf: u64) -> u64 {
    if size == 0 {
        return 1;
    }
    (size + leaf - 1) / leaf
}

/// Incremental leaf-by-leaf hasher. Feed whole leaves (except possibly the
/// last, shorter one) via `update_leaf`, then call `finish` to get the root
/// and the concatenated leaf-hash blob.
pub struct TreeHasher {
    leaf_size: u64,
    leaves: Vec<Tth>,
}

impl TreeHasher {
    pub fn new(file_size: u64) -> Self {
        Self {
            leaf_size: choose_leaf_size(file_size),
            leaves: Vec::with_capacity(num_blocks(file_size, choose_leaf_size(file_size)) as usize),
        }
    }

    pub fn leaf_size(&self) -> u64 {
        self.leaf_size
    }

    pub fn update_leaf(&mut self, leaf_bytes: &[u8]) {
        self.leaves.push(tiger_hash(LEAF_TAG, leaf_bytes));
    }

    /// Consume the hasher, returning the root and the leaf blob (leaves
    /// concatenated in order, 24 bytes each).
    pub fn finish(self) -> (Tth, Vec<u8>) {
        let root = combine_leaves(&self.leaves);
        let mut blob = Vec::with_capacity(self.leaves.len() * 24);
        for leaf in &self.leaves {
            blob.extend_from_slice(leaf);
        }
        (root, blob)
    }
}

/// Hash an entire in-memory buffer in one call (tests, small files).
pub fn hash_bytes(data: &[u8]) -> (Tth, Vec<u8>) {
    let leaf = choose_leaf_size(data.len() as u64);
    let mut hasher = TreeHasher {
        leaf_size: leaf,
        leaves: Vec::new(),
    };
    if data.is_empty() {
        hasher.update_leaf(&[]);
    } else {
        for chunk in data.chunks(leaf as usize) {
            hasher.update_leaf(chunk);
        }
    }
    hasher.finish()
}

/// Pairwise-combine leaf hashes bottom-up; an odd one out at any level
/// bubbles up unchanged.
fn combine_leaves(leaves: &[Tth]) -> Tth {
    if leaves.is_empty() {
        return tiger_hash(LEAF_TAG, &[]);
    }
    let mut level: Vec<Tth> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut it = level.chunks(2);
        while let Some(pair) = it.next() {
            if pair.len() == 2 {
                let mut buf = [0u8; 48];
                buf[..24].copy_from_slice(&pair[0]);
                buf[24..].copy_from_slice(&pair[1]);
                next.push(tiger_hash(NODE_TAG, &buf));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}

/// Recompute the root from a previously fetched leaf blob, checking it
/// against an expected root.
pub fn verify_root(leaf_blob: &[u8], expected_root: &Tth) -> bool {
    if leaf_blob.len() % 24 != 0 {
        return false;
    }
    let leaves: Vec<Tth> = leaf_blob
        .chunks(24)
        .map(|c| {
            let mut t = [0u8; 24];
            t.copy_from_slice(c);
            t
        })
        .collect();
    &combine_leaves(&leaves) == expected_root
}

/// Verify a single downloaded block against its corresponding leaf in a
/// previously fetched leaf blob. `block_index` is the offset divided by
/// the tree's leaf size.
pub fn verify_block(leaf_blob: &[u8], block_index: usize, block_data: &[u8]) -> bool {
    let start = block_index * 24;
    let end = start + 24;
    if end > leaf_blob.len() {
        return false;
    }
    let expected = &leaf_blob[start..end];
    tiger_hash(LEAF_TAG, block_data) == expected
}

pub fn encode_base32(tth: &Tth) -> String {
    base32::encode(base32::Alphabet::RFC4648 { padding: false }, tth)
}

pub fn decode_base32(s: &str) -> Option<Tth> {
    let bytes = base32::decode(base32::Alphabet::RFC4648 { padding: false }, s)?;
    if bytes.len() != 24 {
        return None;
    }
    let mut tth = [0u8; 24];
    tth.copy_from_slice(&bytes);
    Some(tth)
}

/// Whether `s` looks like a valid 39-character base32 TTH string.
pub fn is_tth_string(s: &str) -> bool {
    s.len() == 39 && s.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_blocks_matches_formula() {
        assert_eq!(num_blocks(0, 1024), 1);
        assert_eq!(num_blocks(1, 1024), 1);
        assert_eq!(num_blocks(1024, 1024), 1);
        assert_eq!(num_blocks(1025, 1024), 2);
        assert_eq!(num_blocks(2048, 1024), 2);
    }

    #[test]
    fn leaf_size_is_power_of_two_at_least_1024() {
        let leaf = choose_leaf_size(10 * 1024 * 1024);
        assert!(leaf >= MIN_LEAF);
        assert_eq!(leaf & (leaf - 1), 0, "leaf size must be a power of two");
    }

    #[test]
    fn root_from_leaf_blob_matches_original() {
        let data = vec![0x42u8; 5000];
        let (root, blob) = hash_bytes(&data);
        assert!(verify_root(&blob, &root));
    }

    #[test]
    fn tampered_leaf_blob_fails_verify() {
        let data = vec![0x42u8; 5000];
        let (root, mut blob) = hash_bytes(&data);
        blob[0] ^= 0xFF;
        assert!(!verify_root(&blob, &root));
    }

    #[test]
    fn single_empty_leaf_for_empty_file() {
        let (root, blob) = hash_bytes(&[]);
        assert_eq!(blob.len(), 24);
        assert!(verify_root(&blob, &root));
    }

    #[test]
    fn base32_round_trips() {
        let (root, _) = hash_bytes(b"hello world");
        let s = encode_base32(&root);
        assert!(is_tth_string(&s));
        assert_eq!(decode_base32(&s).unwrap(), root);
    }

    #[test]
    fn block_verify_detects_corruption() {
        let leaf = choose_leaf_size(3000);
        let mut hasher = TreeHasher {
            leaf_size: leaf,
            leaves: Vec::new(),
        };
        let data = vec![7u8; 3000];
        for chunk in data.chunks(leaf as usize) {
            hasher.update_leaf(chunk);
        }
        let (_root, blob) = hasher.finish();
        let first_chunk = &data[..leaf.min(3000) as usize];
        assert!(verify_block(&blob, 0, first_chunk));
        assert!(!verify_block(&blob, 0, &[0u8; 10]));
    }
}

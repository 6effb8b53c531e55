//! Receiving side of a CC transfer: writes into a `.part` file, verifies
//! each arriving block against the TTHL leaf blob once available, and
//! atomically renames to the final destination on completion.

use crate::error::{CoreError, CoreResult, IntegrityKind};
use crate::tth::{self, Tth};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Tracks one in-progress download's on-disk state.
pub struct DownloadWriter {
    incomplete_path: PathBuf,
    dest_path: PathBuf,
    file: File,
    leaf_size: u64,
    leaf_blob: Option<Vec<u8>>,
}

impl DownloadWriter {
    /// Open (creating if needed) the `.part` file for a download, seeking
    /// to `resume_from` -- the byte offset of the first byte we still need.
    pub fn open(incomplete_path: PathBuf, dest_path: PathBuf, leaf_size: u64) -> CoreResult<(Self, u64)> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&incomplete_path)
            .map_err(|e| CoreError::Integrity(IntegrityKind::IoInc(e.raw_os_error().unwrap_or(0))))?;
        let resume_from = file.metadata().map(|m| m.len()).unwrap_or(0);
        // truncate to a leaf boundary: a partial trailing leaf can't be
        // trusted without re-verifying it, so we drop back to the last
        // complete one.
        let resume_from = (resume_from / leaf_size) * leaf_size;
        file.set_len(resume_from)
            .map_err(|e| CoreError::Integrity(IntegrityKind::IoInc(e.raw_os_error().unwrap_or(0))))?;
        file.seek(SeekFrom::Start(resume_from))
            .map_err(|e| CoreError::Integrity(IntegrityKind::IoInc(e.raw_os_error().unwrap_or(0))))?;
        Ok((
            Self { incomplete_path, dest_path, file, leaf_size, leaf_blob: None },
            resume_from,
        ))
    }

    pub fn set_leaf_blob(&mut self, blob: Vec<u8>) {
        self.leaf_blob = Some(blob);
    }

    /// Verify TTHL data against the expected root before trusting it for
    /// block checks.
    pub fn adopt_leaf_blob(&mut self, blob: Vec<u8>, expected_root: &Tth) -> CoreResult<()> {
        if !tth::verify_root(&blob, expected_root) {
            return Err(CoreError::Integrity(IntegrityKind::InvTthl));
        }
        self.leaf_blob = Some(blob);
        Ok(())
    }

    /// Write one block of data at `offset` (must be leaf-aligned),
    /// verifying it against the TTHL leaf blob if one has been adopted.
    pub fn write_block(&mut self, offset: u64, data: &[u8]) -> CoreResult<()> {
        if let Some(blob) = &self.leaf_blob {
            let block_index = (offset / self.leaf_size) as usize;
            if !tth::verify_block(blob, block_index, data) {
                return Err(CoreError::Integrity(IntegrityKind::Hash(block_index)));
            }
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| CoreError::Integrity(IntegrityKind::IoInc(e.raw_os_error().unwrap_or(0))))?;
        self.file
            .write_all(data)
            .map_err(|e| CoreError::Integrity(IntegrityKind::IoInc(e.raw_os_error().unwrap_or(0))))?;
        Ok(())
    }

    /// Flush to disk and atomically move into place at the final
    /// destination. Consumes the writer -- the transfer is done.
    pub fn finish(self) -> CoreResult<PathBuf> {
        self.file
            .sync_all()
            .map_err(|e| CoreError::Integrity(IntegrityKind::IoInc(e.raw_os_error().unwrap_or(0))))?;
        drop(self.file);
        if let Some(parent) = self.dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::Integrity(IntegrityKind::IoDest(e.raw_os_error().unwrap_or(0))))?;
        }
        fs::rename(&self.incomplete_path, &self.dest_path)
            .map_err(|e| CoreError::Integrity(IntegrityKind::IoDest(e.raw_os_error().unwrap_or(0))))?;
        Ok(self.dest_path)
    }

    pub fn incomplete_path(&self) -> &Path {
        &self.incomplete_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumes_from_last_complete_leaf_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("f.part");
        std::fs::write(&part, vec![1u8; 1500]).unwrap();

        let (_, resume_from) = DownloadWriter::open(part, dir.path().join("f"), 1024).unwrap();
        assert_eq!(resume_from, 1024);
    }

    #[test]
    fn write_block_is_verified_against_adopted_leaf_blob() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("f.part");
        let data = vec![5u8; 2048];
        let (root, blob) = tth::hash_bytes(&data);

        let (mut writer, _) = DownloadWriter::open(part, dir.path().join("f"), tth::choose_leaf_size(2048)).unwrap();
        writer.adopt_leaf_blob(blob, &root).unwrap();
        writer.write_block(0, &data[..tth::choose_leaf_size(2048) as usize]).unwrap();

        let bad = vec![6u8; tth::choose_leaf_size(2048) as usize];
        let err = writer.write_block(0, &bad);
        assert!(err.is_err());
    }

    #[test]
    fn finish_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("f.part");
        let dest = dir.path().join("f");
        let (mut writer, _) = DownloadWriter::open(part, dest.clone(), 1024).unwrap();
        writer.write_block(0, &[1u8; 10]).unwrap();
        let final_path = writer.finish().unwrap();
        assert_eq!(final_path, dest);
        assert!(dest.exists());
    }
}

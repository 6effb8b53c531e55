//! Minimal file-list XML interface: write the local share as a DC file
//! list (bzip2-compressed `files.xml.bz2`) and read one back into the
//! flat `(path, size, tth)` triples the download queue matches against.
//! A full share-refresh walker that drives this from disk lives in
//! `share::ShareIndex::refresh`; this module only knows the wire format.
//!
//! The tree is expressed as `serde`-derived structs and (de)serialized
//! through `quick_xml::se`/`quick_xml::de`, rather than hand-rolled event
//! parsing -- the same derive-based approach the teacher takes for its
//! own wire structs.

use crate::error::{CoreError, CoreResult};
use crate::tth::Tth;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename = "FileListing")]
struct FileListing {
    #[serde(rename = "Directory", default)]
    directories: Vec<DirEntry>,
    #[serde(rename = "File", default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirEntry {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "Directory", default)]
    directories: Vec<DirEntry>,
    #[serde(rename = "File", default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "@Size")]
    size: u64,
    #[serde(rename = "@TTH")]
    tth: String,
}

pub trait FileListWriter {
    fn write(&self, files: &[(String, u64, Tth)]) -> CoreResult<Vec<u8>>;
}

pub trait FileListReader {
    fn read(&self, bytes: &[u8]) -> CoreResult<Vec<(String, u64, Tth)>>;
}

pub struct XmlFileList;

impl FileListWriter for XmlFileList {
    fn write(&self, files: &[(String, u64, Tth)]) -> CoreResult<Vec<u8>> {
        let mut root = FileListing::default();
        for (path, size, tth) in files {
            insert(&mut root, path.split('/').collect(), *size, *tth);
        }
        let xml = quick_xml::se::to_string(&root).map_err(xml_err)?;

        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(xml.as_bytes()).map_err(CoreError::LocalIo)?;
        encoder.finish().map_err(CoreError::LocalIo)
    }
}

impl FileListReader for XmlFileList {
    fn read(&self, bytes: &[u8]) -> CoreResult<Vec<(String, u64, Tth)>> {
        let mut decoder = BzDecoder::new(bytes);
        let mut xml = String::new();
        decoder.read_to_string(&mut xml).map_err(CoreError::LocalIo)?;
        let root: FileListing = quick_xml::de::from_str(&xml).map_err(xml_err)?;

        let mut out = Vec::new();
        collect(&root.directories, &root.files, String::new(), &mut out)?;
        Ok(out)
    }
}

fn insert(listing: &mut FileListing, mut segments: Vec<&str>, size: u64, tth: Tth) {
    if segments.len() == 1 {
        listing.files.push(FileEntry {
            name: segments[0].to_string(),
            size,
            tth: crate::tth::encode_base32(&tth),
        });
        return;
    }
    let head = segments.remove(0);
    let dir = match listing.directories.iter_mut().find(|d| d.name == head) {
        Some(d) => d,
        None => {
            listing.directories.push(DirEntry { name: head.to_string(), directories: Vec::new(), files: Vec::new() });
            listing.directories.last_mut().unwrap()
        }
    };
    insert_dir(dir, segments, size, tth);
}

fn insert_dir(dir: &mut DirEntry, mut segments: Vec<&str>, size: u64, tth: Tth) {
    if segments.len() == 1 {
        dir.files.push(FileEntry { name: segments[0].to_string(), size, tth: crate::tth::encode_base32(&tth) });
        return;
    }
    let head = segments.remove(0);
    let child = match dir.directories.iter_mut().find(|d| d.name == head) {
        Some(d) => d,
        None => {
            dir.directories.push(DirEntry { name: head.to_string(), directories: Vec::new(), files: Vec::new() });
            dir.directories.last_mut().unwrap()
        }
    };
    insert_dir(child, segments, size, tth);
}

fn collect(dirs: &[DirEntry], files: &[FileEntry], prefix: String, out: &mut Vec<(String, u64, Tth)>) -> CoreResult<()> {
    for f in files {
        let path = if prefix.is_empty() { f.name.clone() } else { format!("{prefix}/{}", f.name) };
        let tth = crate::tth::decode_base32(&f.tth).ok_or_else(|| CoreError::Protocol("bad TTH in file list".into()))?;
        out.push((path, f.size, tth));
    }
    for d in dirs {
        let path = if prefix.is_empty() { d.name.clone() } else { format!("{prefix}/{}", d.name) };
        collect(&d.directories, &d.files, path, out)?;
    }
    Ok(())
}

fn xml_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::Protocol(format!("file list XML error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_small_tree() {
        let list = XmlFileList;
        let files = vec![
            ("music/album/track.flac".to_string(), 12345, [1u8; 24]),
            ("docs/readme.txt".to_string(), 42, [2u8; 24]),
        ];
        let bytes = list.write(&files).unwrap();
        let mut parsed = list.read(&bytes).unwrap();
        parsed.sort();
        let mut expected = files;
        expected.sort();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn empty_list_round_trips() {
        let list = XmlFileList;
        let bytes = list.write(&[]).unwrap();
        assert!(list.read(&bytes).unwrap().is_empty());
    }
}

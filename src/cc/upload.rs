//! Serving side of a CC transfer: resolve an `ADCGET`/`$ADCGET` request
//! against the share index and either start streaming a reply or report
//! why the request can't be served.

use crate::error::{CoreError, CoreResult, ResourceKind};
use crate::filelist::{FileListWriter, XmlFileList};
use crate::share::tree::Node;
use crate::share::ShareIndex;
use crate::tth::Tth;

/// What's being asked for: a plain file (by virtual path), a file by TTH,
/// the TTHL leaf data for a file, or the whole file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetKind {
    File(String),
    Tth(Tth),
    Tthl(Tth),
    FileList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub kind: GetKind,
    pub start: u64,
    /// `None` means "to the end of the file" (legacy `-1` length).
    pub bytes: Option<u64>,
}

pub enum GetResponse {
    /// Stream `bytes` of `path`'s content starting at `start`.
    SendFile { path: std::path::PathBuf, start: u64, bytes: u64 },
    /// The TTHL leaf blob, sent whole.
    SendTthl { blob: Vec<u8> },
    /// The whole `files.xml.bz2`, built fresh from the current share index.
    SendList { blob: Vec<u8> },
    Error(ResourceKind),
}

/// Resolve a get request against the share index and a slot decision
/// already made by the caller (the session's `SlotManager`).
pub fn resolve(index: &ShareIndex, request: &GetRequest, slot_available: bool) -> CoreResult<GetResponse> {
    let (virtual_path, tth, size) = match &request.kind {
        GetKind::File(path) => {
            let node = index.lookup_path(path);
            match node {
                Some(Node::File { size, tth }) => (path.clone(), *tth, *size),
                Some(Node::Dir(_)) | None => return Ok(GetResponse::Error(ResourceKind::FileNotAvailable)),
            }
        }
        GetKind::Tth(tth) => match index.lookup_tth(tth) {
            Some(path) => {
                let Some(Node::File { size, .. }) = index.lookup_path(path) else {
                    return Ok(GetResponse::Error(ResourceKind::FileNotAvailable));
                };
                (path.to_string(), *tth, *size)
            }
            None => return Ok(GetResponse::Error(ResourceKind::FileNotAvailable)),
        },
        GetKind::Tthl(tth) => {
            return Ok(match index.leaf_blob(tth) {
                Some(blob) => GetResponse::SendTthl { blob: blob.to_vec() },
                None => GetResponse::Error(ResourceKind::FileNotAvailable),
            });
        }
        GetKind::FileList => {
            if !slot_available {
                return Ok(GetResponse::Error(ResourceKind::NoSlots));
            }
            let blob = XmlFileList.write(&index.all_files())?;
            return Ok(GetResponse::SendList { blob });
        }
    };

    if !slot_available {
        return Ok(GetResponse::Error(ResourceKind::NoSlots));
    }

    let want = request.bytes.unwrap_or(size.saturating_sub(request.start));
    if request.start > size || request.start + want > size {
        return Ok(GetResponse::Error(ResourceKind::FilePartNotAvailable));
    }

    let local_path = std::path::PathBuf::from(virtual_path);
    let _ = tth;
    Ok(GetResponse::SendFile { path: local_path, start: request.start, bytes: want })
}

pub fn denied_to_error(kind: ResourceKind) -> CoreError {
    CoreError::Resource(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::ShareIndex;

    fn sample_index() -> ShareIndex {
        let mut idx = ShareIndex::new();
        idx.add_root("share".into(), "/tmp".into());
        idx.apply_hash_result(
            "share/a.bin".into(),
            crate::share::hasher::HashResult {
                virtual_path: "share/a.bin".into(),
                size: 100,
                tth: [1u8; 24],
                leaf_blob: vec![0u8; 24],
            },
        );
        idx
    }

    #[test]
    fn resolves_file_request_within_bounds() {
        let idx = sample_index();
        let req = GetRequest { kind: GetKind::File("share/a.bin".into()), start: 0, bytes: Some(50) };
        match resolve(&idx, &req, true).unwrap() {
            GetResponse::SendFile { bytes, .. } => assert_eq!(bytes, 50),
            _ => panic!("expected SendFile"),
        }
    }

    #[test]
    fn out_of_range_request_is_rejected() {
        let idx = sample_index();
        let req = GetRequest { kind: GetKind::File("share/a.bin".into()), start: 50, bytes: Some(100) };
        match resolve(&idx, &req, true).unwrap() {
            GetResponse::Error(ResourceKind::FilePartNotAvailable) => {}
            _ => panic!("expected FilePartNotAvailable"),
        }
    }

    #[test]
    fn no_slot_is_reported_before_bounds_check() {
        let idx = sample_index();
        let req = GetRequest { kind: GetKind::File("share/a.bin".into()), start: 0, bytes: Some(1) };
        match resolve(&idx, &req, false).unwrap() {
            GetResponse::Error(ResourceKind::NoSlots) => {}
            _ => panic!("expected NoSlots"),
        }
    }

    #[test]
    fn unknown_tth_is_file_not_available() {
        let idx = sample_index();
        let req = GetRequest { kind: GetKind::Tth([9u8; 24]), start: 0, bytes: None };
        match resolve(&idx, &req, true).unwrap() {
            GetResponse::Error(ResourceKind::FileNotAvailable) => {}
            _ => panic!("expected FileNotAvailable"),
        }
    }

    #[test]
    fn file_list_request_builds_a_fresh_listing() {
        let idx = sample_index();
        let req = GetRequest { kind: GetKind::FileList, start: 0, bytes: None };
        match resolve(&idx, &req, true).unwrap() {
            GetResponse::SendList { blob } => assert!(!blob.is_empty()),
            _ => panic!("expected SendList"),
        }
    }

    #[test]
    fn file_list_request_without_a_slot_is_denied() {
        let idx = sample_index();
        let req = GetRequest { kind: GetKind::FileList, start: 0, bytes: None };
        match resolve(&idx, &req, false).unwrap() {
            GetResponse::Error(ResourceKind::NoSlots) => {}
            _ => panic!("expected NoSlots"),
        }
    }
}

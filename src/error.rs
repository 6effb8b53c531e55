//! Typed error kinds the core distinguishes (spec.md §7).

use std::fmt;

/// The seven error categories the core tells apart when deciding how to
/// propagate a failure (disconnect+reconnect, park a download, surface to
/// the wire, ...).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("resource error: {0}")]
    Resource(ResourceKind),

    #[error("integrity error: {0}")]
    Integrity(IntegrityKind),

    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// §4.6 upload error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    NoSlots,
    FileNotAvailable,
    FilePartNotAvailable,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::NoSlots => write!(f, "no slots free"),
            ResourceKind::FileNotAvailable => write!(f, "file not available"),
            ResourceKind::FilePartNotAvailable => write!(f, "file part not available"),
        }
    }
}

/// §4.10 download-queue error taxonomy. Persisted as small integers in the
/// `dl`/`dl_users` tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityKind {
    /// TTHL data doesn't match the root.
    InvTthl,
    /// The peer doesn't have this file.
    NoFile,
    /// Write error to the incomplete file (errno).
    IoInc(i32),
    /// Error moving the completed file to its destination (errno).
    IoDest(i32),
    /// Block N failed verification.
    Hash(usize),
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityKind::InvTthl => write!(f, "TTHL data does not match the root"),
            IntegrityKind::NoFile => write!(f, "peer does not have this file"),
            IntegrityKind::IoInc(errno) => write!(f, "incomplete-file write error (errno {errno})"),
            IntegrityKind::IoDest(errno) => write!(f, "rename-to-destination error (errno {errno})"),
            IntegrityKind::Hash(block) => write!(f, "block {block} failed hash verification"),
        }
    }
}

impl IntegrityKind {
    /// Small integer persisted in the `dl`/`dl_users.error` column.
    pub fn code(&self) -> i64 {
        match self {
            IntegrityKind::InvTthl => 1,
            IntegrityKind::NoFile => 2,
            IntegrityKind::IoInc(_) => 3,
            IntegrityKind::IoDest(_) => 4,
            IntegrityKind::Hash(_) => 5,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

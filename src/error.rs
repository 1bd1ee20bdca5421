//! Library-wide error type.
//!
//! Variants are grouped into four kinds, see [`ErrorKind`]. I/O failures always keep their
//! `std::io::Error` so a caller can tell "wrong key" apart from "bad media".

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Missing or malformed identifier sources.
    Identity,
    /// Decrypted or loaded structures fail structural or cryptographic checks.
    Validation,
    /// Sector or file I/O failed.
    Io,
    /// Not enough space, or a fixed pool ran dry.
    Resource,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("identity: {0}")]
    Identity(String),
    #[error("identifiers do not match the ones recorded in the image")]
    IdentityMismatch,

    #[error("image footer has bad magic")]
    BadMagic,
    #[error("image size {0} is neither sector aligned nor sector aligned plus footer")]
    WrongSize(u64),
    #[error("sector 0 did not decrypt to the expected partition table ({0})")]
    Sector0Mismatch(&'static str),
    #[error("{0} is not available on 3DS images")]
    NotOnThreeDs(&'static str),
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
    #[error("{what} is not a multiple of {unit} bytes (got {len})")]
    Unaligned { what: &'static str, unit: usize, len: usize },
    #[error("signature verification failed")]
    BadSignature,
    #[error("unexpected certificate {field}: expected {expected:?}, found {found:?}")]
    CertificateMismatch { field: &'static str, expected: String, found: String },
    #[error("digest mismatch for {0}")]
    DigestMismatch(PathBuf),
    #[error("title is for region mask {app:#010x}, device region is {device:#x}")]
    RegionMismatch { app: u32, device: u32 },
    #[error("ES block authentication failed ({0})")]
    EsBlock(&'static str),
    #[error("no usable ticket template found in {0}")]
    NoTicketTemplate(PathBuf),

    #[error("sector I/O failed at sector {sector}")]
    SectorIo {
        sector: u64,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {path}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("insufficient space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("scratch pool exhausted ({0} slots in use)")]
    PoolExhausted(usize),
    #[error("refusing to overwrite {0}")]
    AlreadyExists(PathBuf),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            Identity(_) | IdentityMismatch | Config(_) => ErrorKind::Identity,
            SectorIo { .. } | File { .. } | Io(_) => ErrorKind::Io,
            InsufficientSpace { .. } | PoolExhausted(_) => ErrorKind::Resource,
            _ => ErrorKind::Validation,
        }
    }

    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Malformed { what, reason: reason.into() }
    }

    /// Attach a path to an `io::Error`.
    pub(crate) fn file(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Error::File { path, source }
    }
}

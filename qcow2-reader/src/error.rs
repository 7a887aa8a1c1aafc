use std::io;
use thiserror::Error;

/// Result type used throughout the decoder.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while opening or reading a qcow2 image.
///
/// Every variant is fatal: the image (or the reader that produced the error)
/// should be discarded.
#[derive(Debug, Error)]
pub enum Error {
    /// A structural field of the image is malformed or inconsistent
    #[error("malformed qcow2 image: {0}")]
    Format(String),

    /// The header declares a format version other than 2 or 3
    #[error("qcow2 version {0} is not supported")]
    UnsupportedVersion(u32),

    /// The image relies on a capability this decoder does not implement
    #[error("unsupported qcow2 feature: {0}")]
    UnsupportedFeature(UnsupportedFeature),

    /// Compressed clusters use something other than zlib/deflate
    #[error("compression type {0} is not supported")]
    UnsupportedCompression(u8),

    /// The underlying byte source failed or ended early
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Capabilities which cause an image to be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedFeature {
    /// The image is an overlay on top of a backing file
    BackingFile,

    /// Cluster size outside of 512 B to 2 MiB, carrying the cluster bits
    ClusterSize(u32),

    /// Contents are encrypted with the given method
    Encryption(u32),

    /// The image was not closed cleanly and refcounts may be stale
    Dirty,

    /// The image was marked corrupt by the writer
    Corrupt,

    /// Guest data lives in a separate file
    ExternalDataFile,

    /// L2 entries are 128 bits wide with subcluster allocation
    ExtendedL2Entries,

    /// Incompatible feature bits this decoder does not know, masked to the unknown ones
    UnknownIncompatible(u64),
}

impl std::fmt::Display for UnsupportedFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackingFile => write!(f, "backing file"),
            Self::ClusterSize(bits) => write!(f, "cluster size 2^{bits}"),
            Self::Encryption(method) => write!(f, "encryption method {method}"),
            Self::Dirty => write!(f, "dirty bit set"),
            Self::Corrupt => write!(f, "corrupt bit set"),
            Self::ExternalDataFile => write!(f, "external data file"),
            Self::ExtendedL2Entries => write!(f, "extended L2 entries"),
            Self::UnknownIncompatible(bits) => {
                write!(f, "unknown incompatible features {bits:#x}")
            }
        }
    }
}

impl From<UnsupportedFeature> for Error {
    fn from(feature: UnsupportedFeature) -> Self {
        Self::UnsupportedFeature(feature)
    }
}

impl From<binrw::Error> for Error {
    fn from(error: binrw::Error) -> Self {
        match error {
            binrw::Error::BadMagic { .. } => Self::Format("not a qcow2 file, wrong magic".into()),
            binrw::Error::Io(error) => Self::Io(error),
            binrw::Error::Backtrace(backtrace) => Self::from(*backtrace.error),
            other => Self::Format(other.to_string()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(error) => error,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

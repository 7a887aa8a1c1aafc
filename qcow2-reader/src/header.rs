use crate::*;
use strum::{EnumIter, IntoEnumIterator};
use tracing::debug;

/// Smallest supported cluster (512 bytes).
pub const MIN_CLUSTER_BITS: u32 = 9;

/// Largest supported cluster (2 MiB), which is also qemu's implementation limit.
pub const MAX_CLUSTER_BITS: u32 = 21;

/// Size of the version 2 header, and of the fixed part every version starts with.
pub const V2_HEADER_LENGTH: u32 = 72;

/// Size of the version 3 header without any additional fields.
pub const V3_HEADER_LENGTH: u32 = 104;

/// Header lengths above this are treated as corruption rather than honoured.
pub const MAX_HEADER_LENGTH: u32 = 1000;

/// Compression type value meaning zlib/deflate.
pub const COMPRESSION_TYPE_ZLIB: u8 = 0;

/// Fixed header fields common to version 2 and 3.
#[derive(BinRead, Debug)]
#[br(big, magic = b"QFI\xfb")]
pub struct QcowHeader {
    /// Version of the QCOW format.
    pub version: u32,

    /// Offset into the image file at which the backing file name
    /// is stored (NB: The string is not null terminated). 0 if the
    /// image doesn't have a backing file.
    pub backing_file_offset: u64,

    /// Length of the backing file name in bytes. Undefined if the image
    /// doesn't have a backing file.
    pub backing_file_size: u32,

    /// Number of bits that are used for addressing an offset
    /// within a cluster (1 << cluster_bits is the cluster size).
    /// Must not be less than 9 (i.e. 512 byte clusters).
    ///
    /// **Note**: qemu as of today has an implementation limit of 2 MB
    /// as the maximum cluster size and won't be able to open images
    /// with larger cluster sizes.
    pub cluster_bits: u32,

    /// Virtual disk size in bytes.
    pub size: u64,

    /// Encryption method to use for contents. 0 means none.
    pub crypt_method: u32,

    /// Number of entries in the active L1 table
    pub l1_size: u32,

    /// Offset into the image file at which the active L1 table
    /// starts. Must be aligned to a cluster boundary.
    pub l1_table_offset: u64,

    /// Offset into the image file at which the refcount table
    /// starts. Must be aligned to a cluster boundary.
    pub refcount_table_offset: u64,

    /// Number of clusters that the refcount table occupies
    pub refcount_table_clusters: u32,

    /// Number of snapshots contained in the image
    pub nb_snapshots: u32,

    /// Offset into the image file at which the snapshot table
    /// starts. Must be aligned to a cluster boundary.
    pub snapshots_offset: u64,
}

/// Fields appended to the header by version 3.
#[derive(BinRead, Debug)]
#[br(big)]
pub struct Version3Header {
    /// Bitmask of incompatible features. An implementation must fail to open an image if an
    /// unknown bit is set.
    pub incompatible_features: u64,

    /// Bitmask of compatible features. An implementation can safely ignore any unknown bits
    /// that are set.
    pub compatible_features: u64,

    /// Bitmask of auto-clear features. An implementation may only write to an image with unknown
    /// auto-clear features if it clears the respective bits from this field first.
    pub autoclear_features: u64,

    /// Describes the width of a reference count block entry (width
    /// in bits: refcount_bits = 1 << refcount_order).
    pub refcount_order: u32,

    /// Length of the header structure in bytes, including the additional fields.
    pub header_length: u32,
}

/// Incompatible feature bits known to this decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[repr(u64)]
pub enum IncompatibleFeature {
    /// Refcounts may be inconsistent because the image wasn't closed
    Dirty = 1 << 0,

    /// Some metadata structure is known to be corrupted
    Corrupt = 1 << 1,

    /// Guest clusters are stored in an external data file
    ExternalDataFile = 1 << 2,

    /// The compression type field is present and selects the algorithm
    CompressionType = 1 << 3,

    /// L2 entries are 128 bits wide
    ExtendedL2Entries = 1 << 4,
}

impl IncompatibleFeature {
    /// The bit this feature occupies in the incompatible features field.
    pub fn bit(self) -> u64 {
        self as u64
    }

    /// All bits with a known meaning.
    pub fn known_bits() -> u64 {
        Self::iter().fold(0, |bits, feature| bits | feature.bit())
    }

    /// Why an image carrying this bit can't be read, if it can't.
    fn rejection(self) -> Option<UnsupportedFeature> {
        match self {
            Self::Dirty => Some(UnsupportedFeature::Dirty),
            Self::Corrupt => Some(UnsupportedFeature::Corrupt),
            Self::ExternalDataFile => Some(UnsupportedFeature::ExternalDataFile),
            Self::CompressionType => None,
            Self::ExtendedL2Entries => Some(UnsupportedFeature::ExtendedL2Entries),
        }
    }
}

/// A validated image header.
#[derive(Debug)]
pub struct Header {
    /// Fields shared by every version
    pub fixed: QcowHeader,

    /// Present for version 3 images only
    pub extension: Option<Version3Header>,

    /// Algorithm used by compressed clusters. Always zlib once validated.
    pub compression_type: u8,
}

impl Header {
    /// Read and validate the header from the start of `reader`.
    ///
    /// On success the reader is positioned after the header and its additional
    /// fields. Header extensions are not interpreted.
    pub fn read(reader: &mut (impl Read + Seek)) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let fixed: QcowHeader = reader.read_be()?;
        fixed.validate()?;

        let mut header = Header {
            extension: None,
            compression_type: COMPRESSION_TYPE_ZLIB,
            fixed,
        };

        if header.fixed.version == 3 {
            let extension: Version3Header = reader.read_be()?;
            let non_default_compression = extension.validate()?;

            let mut additional_fields =
                vec![0; (extension.header_length - V3_HEADER_LENGTH) as usize];
            reader.read_exact(&mut additional_fields)?;

            if non_default_compression {
                if extension.header_length < V3_HEADER_LENGTH + 4 {
                    return Err(Error::Format(format!(
                        "header length {} is too short for a compression type, expected at least {}",
                        extension.header_length,
                        V3_HEADER_LENGTH + 4
                    )));
                }

                header.compression_type = additional_fields[0];
                if header.compression_type != COMPRESSION_TYPE_ZLIB {
                    return Err(Error::UnsupportedCompression(header.compression_type));
                }
                debug!("Compression type field present and set to zlib");
            }

            header.extension = Some(extension);
        }

        Ok(header)
    }
}

impl QcowHeader {
    /// Get the size of a cluster in bytes
    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    fn validate(&self) -> Result<()> {
        if self.version != 2 && self.version != 3 {
            return Err(Error::UnsupportedVersion(self.version));
        }

        if self.backing_file_offset != 0 {
            return Err(UnsupportedFeature::BackingFile.into());
        }

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(UnsupportedFeature::ClusterSize(self.cluster_bits).into());
        }

        if self.crypt_method != 0 {
            return Err(UnsupportedFeature::Encryption(self.crypt_method).into());
        }

        Ok(())
    }
}

impl Version3Header {
    /// Check feature bits and header length. Returns whether the compression
    /// type field is in use.
    fn validate(&self) -> Result<bool> {
        let features = self.incompatible_features;

        for feature in IncompatibleFeature::iter() {
            if features & feature.bit() != 0 {
                if let Some(rejection) = feature.rejection() {
                    return Err(rejection.into());
                }
            }
        }

        let unknown = features & !IncompatibleFeature::known_bits();
        if unknown != 0 {
            return Err(UnsupportedFeature::UnknownIncompatible(unknown).into());
        }

        if self.header_length % 8 != 0 {
            return Err(Error::Format(format!(
                "header length {} is not aligned to 8 bytes",
                self.header_length
            )));
        }
        if self.header_length < V3_HEADER_LENGTH {
            return Err(Error::Format(format!(
                "header length {} is shorter than {V3_HEADER_LENGTH} bytes",
                self.header_length
            )));
        }
        if self.header_length > MAX_HEADER_LENGTH {
            return Err(Error::Format(format!(
                "header length {} exceeds {MAX_HEADER_LENGTH} bytes, likely corrupted",
                self.header_length
            )));
        }

        Ok(features & IncompatibleFeature::CompressionType.bit() != 0)
    }
}

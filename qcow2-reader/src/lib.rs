//! Read-only access to the guest data of qcow2 disk images.
//!
//! The image header and active L1 table are parsed once when a [`Reader`] is
//! created. L2 tables are loaded on demand, one at a time, as the reader moves
//! through the virtual disk. Clusters may be all zero, stored verbatim, or
//! deflate compressed.
//!
//! ```no_run
//! use std::{fs::File, io::BufReader};
//!
//! let mut image = BufReader::new(File::open("disk.qcow2")?);
//! let mut reader = qcow2_reader::Reader::new(&mut image)?;
//! std::io::copy(&mut reader, &mut File::create("disk.raw")?)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Images with backing files, external data files, encryption, extended L2
//! entries, non-zlib compression or the dirty/corrupt bits are rejected.
#![warn(missing_docs)]
use binrw::{
    BinRead, BinReaderExt,
    io::{Read, Seek, SeekFrom},
};
use tracing::debug;

mod error;
pub use error::*;

mod header;
pub use header::*;

pub mod levels;
use levels::*;

mod reader;
pub use reader::*;

/// Geometry and L1 table of an image, fixed once the image has been opened.
///
/// Only [`ImageConfig::load`] creates one, so every value is derived from a
/// validated header and can't be changed afterwards:
///
/// ```compile_fail
/// # let mut file = std::io::Cursor::new(Vec::new());
/// let mut config = qcow2_reader::ImageConfig::load(&mut file)?;
/// config.l2_entries = 0;
/// # Ok::<(), qcow2_reader::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ImageConfig {
    version: u32,
    cluster_bits: u32,
    cluster_size: usize,
    virtual_size: u64,

    // A trailing partial cluster is not counted
    cluster_count: u64,

    // Host offset of each L2 table, 0 where the region is unallocated
    l1_table: Vec<u64>,

    l2_entries: usize,
    compressed_offset_mask: u64,
}

impl ImageConfig {
    /// Parse the header and active L1 table of a qcow2 image.
    ///
    /// **Note**: this does not buffer your I/O. Any buffering should be handled via a
    /// wrapper such as [`std::io::BufReader`] in order to ensure good performance where
    /// applicable.
    pub fn load(reader: &mut (impl Read + Seek)) -> Result<Self> {
        let header = Header::read(reader)?;
        let l1_table = read_l1_table(
            reader,
            header.fixed.l1_table_offset,
            header.fixed.l1_size,
        )?;

        let config = Self::new(&header.fixed, l1_table);
        debug!(
            version = config.version,
            cluster_size = config.cluster_size,
            virtual_size = config.virtual_size,
            cluster_count = config.cluster_count,
            l1_size = config.l1_table.len(),
            "Opened qcow2 image"
        );

        Ok(config)
    }

    fn new(header: &QcowHeader, l1_table: Vec<u64>) -> Self {
        let cluster_size = header.cluster_size();

        Self {
            version: header.version,
            cluster_bits: header.cluster_bits,
            cluster_size: cluster_size as usize,
            virtual_size: header.size,
            cluster_count: header.size / cluster_size,
            l1_table,
            l2_entries: (cluster_size / 8) as usize,
            compressed_offset_mask: compressed_offset_mask(header.cluster_bits),
        }
    }

    /// Format version, 2 or 3
    pub fn version(&self) -> u32 {
        self.version
    }

    /// log2 of the cluster size
    pub fn cluster_bits(&self) -> u32 {
        self.cluster_bits
    }

    /// Size of a cluster in bytes
    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Virtual disk size in bytes as declared by the header
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// Number of whole clusters in the virtual disk
    pub fn cluster_count(&self) -> u64 {
        self.cluster_count
    }

    /// Host offset of each L2 table, 0 where the region is unallocated
    pub fn l1_table(&self) -> &[u64] {
        &self.l1_table
    }

    /// Number of entries in an L2 table
    pub fn l2_entries(&self) -> usize {
        self.l2_entries
    }

    /// Mask selecting the host offset from a compressed cluster descriptor
    pub fn compressed_offset_mask(&self) -> u64 {
        self.compressed_offset_mask
    }

    /// Length in bytes of the decoded stream.
    pub fn len(&self) -> u64 {
        self.cluster_count * self.cluster_size as u64
    }

    /// Whether the decoded stream has no data at all.
    pub fn is_empty(&self) -> bool {
        self.cluster_count == 0
    }
}

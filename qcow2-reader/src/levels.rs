//! L1 and L2 lookup tables and the cluster descriptors they hold.
use crate::*;
use flate2::read::DeflateDecoder;
use tracing::trace;

/// Bits 9-55 of L1 and standard L2 entries hold a host offset.
pub const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

/// Set in L2 entries whose cluster is compressed.
pub const L2_COMPRESSED: u64 = 1 << 62;

/// Set in standard L2 entries whose cluster reads as zeros.
pub const L2_ZERO: u64 = 1 << 0;

/// Unit of the sector count in compressed cluster descriptors.
const COMPRESSED_SECTOR_SIZE: u64 = 512;

/// qemu refuses L1 tables larger than this.
pub const MAX_L1_TABLE_BYTES: u64 = 32 * 1024 * 1024;

/// An entry in an L1 table that can be used to lookup the location of an L2 table
#[derive(BinRead, Debug, Clone, Copy)]
#[br(big)]
pub struct L1Entry(pub u64);

impl L1Entry {
    /// Offset of the L2 table in the host file, or 0 if the region is unallocated.
    pub fn l2_offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

#[derive(BinRead)]
#[br(big, import(count: usize))]
struct L1Table(#[br(count = count)] Vec<L1Entry>);

#[derive(BinRead)]
#[br(big, import(count: usize))]
struct L2Table(#[br(count = count)] Vec<u64>);

/// Read the active L1 table, returning the L2 table offset of every entry.
pub fn read_l1_table(
    reader: &mut (impl Read + Seek),
    offset: u64,
    size: u32,
) -> Result<Vec<u64>> {
    if u64::from(size) * 8 > MAX_L1_TABLE_BYTES {
        return Err(Error::Format(format!(
            "L1 table of {size} entries exceeds {MAX_L1_TABLE_BYTES} bytes"
        )));
    }

    reader.seek(SeekFrom::Start(offset))?;
    let L1Table(entries) = reader.read_be_args((size as usize,))?;

    Ok(entries.iter().map(L1Entry::l2_offset).collect())
}

/// Mask selecting the host offset of a compressed cluster descriptor.
pub fn compressed_offset_mask(cluster_bits: u32) -> u64 {
    (1 << (70 - cluster_bits)) - 1
}

/// Where and how a single guest cluster is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Entry {
    /// The cluster reads as zeros and has no data in the host file
    AllZero,

    /// The cluster is stored verbatim at the given host offset
    Raw {
        /// Cluster aligned offset of the data
        host_offset: u64,
    },

    /// The cluster is deflate compressed starting at the given host offset
    Compressed {
        /// Offset of the compressed stream. This is usually _not_ aligned to a
        /// cluster or sector boundary.
        host_offset: u64,

        /// Upper bound on the length of the compressed stream, derived from the
        /// number of sectors it spans
        compressed_len: u64,
    },
}

impl L2Entry {
    /// Decode a raw big-endian L2 entry.
    pub fn from_u64(x: u64, cluster_bits: u32) -> Self {
        if x & L2_COMPRESSED != 0 {
            let host_bits = 70 - cluster_bits;
            let host_offset = x & compressed_offset_mask(cluster_bits);

            // Sector count occupies the bits between the offset and the flags
            let additional_sectors = (x & !(3 << 62)) >> host_bits;

            Self::Compressed {
                host_offset,
                compressed_len: (additional_sectors + 1) * COMPRESSED_SECTOR_SIZE
                    - (host_offset % COMPRESSED_SECTOR_SIZE),
            }
        } else if x & L2_ZERO != 0 {
            Self::AllZero
        } else {
            match x & OFFSET_MASK {
                // Unallocated, and there is no backing file to fall through to
                0 => Self::AllZero,
                host_offset => Self::Raw { host_offset },
            }
        }
    }

    /// Read the contents of a given L2 Entry from `reader` into `buf`, which must be
    /// exactly one cluster long.
    pub fn read_contents(&self, reader: &mut (impl Read + Seek), buf: &mut [u8]) -> Result<()> {
        match *self {
            L2Entry::AllZero => buf.fill(0),
            L2Entry::Raw { host_offset } => {
                reader.seek(SeekFrom::Start(host_offset))?;
                reader.read_exact(buf)?;
            }
            L2Entry::Compressed {
                host_offset,
                compressed_len,
            } => {
                reader.seek(SeekFrom::Start(host_offset))?;

                // Decompression stops after one cluster; anything beyond is ignored
                DeflateDecoder::new(reader.by_ref().take(compressed_len)).read_exact(buf)?;
            }
        }

        Ok(())
    }
}

impl ImageConfig {
    /// Load the L2 table for the given L1 index.
    ///
    /// Unallocated regions produce a table of [`L2Entry::AllZero`] without any I/O. The
    /// last table of the image is only read as far as the image has clusters.
    pub fn read_l2_table(
        &self,
        reader: &mut (impl Read + Seek),
        l1_index: usize,
    ) -> Result<Vec<L2Entry>> {
        let l2_offset = *self.l1_table.get(l1_index).ok_or_else(|| {
            Error::Format(format!(
                "L1 table has {} entries, index {l1_index} is out of range",
                self.l1_table.len()
            ))
        })?;

        if l2_offset == 0 {
            trace!(l1_index, "L2 table unallocated");
            return Ok(vec![L2Entry::AllZero; self.l2_entries]);
        }

        let first_cluster = l1_index as u64 * self.l2_entries as u64;
        let count = self
            .cluster_count
            .saturating_sub(first_cluster)
            .min(self.l2_entries as u64) as usize;

        trace!(l1_index, l2_offset, count, "Reading L2 table");
        reader.seek(SeekFrom::Start(l2_offset))?;

        let L2Table(entries) = reader.read_be_args((count,))?;

        Ok(entries
            .into_iter()
            .map(|x| L2Entry::from_u64(x, self.cluster_bits))
            .collect())
    }
}

use crate::levels::L2Entry;
use crate::*;

use std::io;
use tracing::trace;

/// Position of a [`Reader`] within the virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Nothing has been read yet
    BeforeFirst,

    /// `index` is loaded into the cluster buffer. An offset equal to the cluster
    /// size means the cluster is exhausted.
    InCluster { index: u64, offset: usize },

    /// Every cluster has been read
    EndOfStream,
}

/// A reader for the guest virtual drive of a qcow2 image.
///
/// Reads never span a cluster boundary, so a single call returns at most the
/// rest of the current cluster. End of the virtual disk is reported as `Ok(0)`.
///
/// After any error the reader should be discarded.
pub struct Reader<'image, R>
where
    R: Read + Seek,
{
    /// inner reader used for reading/seeking in the host file (the qcow itself)
    image: &'image mut R,

    config: ImageConfig,

    cursor: Cursor,

    // L2 table and the L1 index it belongs to. Replaced whenever the cursor moves
    // into a different L1 region.
    l2_cache: Option<(usize, Vec<L2Entry>)>,

    /// decoded contents of the current cluster, always exactly one cluster long
    current_cluster: Box<[u8]>,
}

impl<'image, R> Reader<'image, R>
where
    R: Read + Seek,
{
    /// Parse the header and L1 table of `image` and position a reader at the
    /// start of the virtual disk.
    pub fn new(image: &'image mut R) -> Result<Self> {
        let config = ImageConfig::load(image)?;
        Ok(Self::with_config(image, config))
    }

    /// Create a reader from a config previously loaded from the same image.
    pub fn with_config(image: &'image mut R, config: ImageConfig) -> Self {
        let current_cluster = vec![0; config.cluster_size].into_boxed_slice();

        Self {
            image,
            config,
            cursor: Cursor::BeforeFirst,
            l2_cache: None,
            current_cluster,
        }
    }

    /// The image geometry and L1 table
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Release the reader, keeping the config
    pub fn into_config(self) -> ImageConfig {
        self.config
    }

    /// Returns the current read position within the guest virtual disk
    pub fn position(&self) -> u64 {
        match self.cursor {
            Cursor::BeforeFirst => 0,
            Cursor::InCluster { index, offset } => {
                index * self.config.cluster_size as u64 + offset as u64
            }
            Cursor::EndOfStream => self.config.len(),
        }
    }

    /// Move to the start of cluster `index`, or to the end of the stream if there
    /// is no such cluster. Returns false at end of stream.
    fn enter_cluster(&mut self, index: u64) -> Result<bool> {
        if index >= self.config.cluster_count {
            self.cursor = Cursor::EndOfStream;
            return Ok(false);
        }

        self.load_cluster(index)?;
        self.cursor = Cursor::InCluster { index, offset: 0 };
        Ok(true)
    }

    /// Decode cluster `index` into the cluster buffer, loading its L2 table first
    /// if the cached one covers a different region.
    ///
    /// The cursor is left at end of stream; callers set it once the load succeeds.
    fn load_cluster(&mut self, index: u64) -> Result<()> {
        // The buffer may be partly overwritten from here on
        self.cursor = Cursor::EndOfStream;

        let l2_entries = self.config.l2_entries as u64;
        let l1_index = usize::try_from(index / l2_entries)
            .map_err(|_| Error::Format(format!("cluster {index} is not addressable")))?;
        let l2_index = (index % l2_entries) as usize;

        let cached = matches!(self.l2_cache, Some((key, _)) if key == l1_index);
        if !cached {
            self.l2_cache = None;
            let table = self.config.read_l2_table(self.image, l1_index)?;
            self.l2_cache = Some((l1_index, table));
        }

        let entry = self
            .l2_cache
            .as_ref()
            .and_then(|(_, table)| table.get(l2_index))
            .copied()
            .ok_or_else(|| Error::Format(format!("no L2 entry for cluster {index}")))?;

        trace!(index, ?entry, "Loading cluster");
        entry.read_contents(self.image, &mut self.current_cluster)
    }
}

impl<'image, R> Read for Reader<'image, R>
where
    R: Read + Seek,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let cluster_size = self.config.cluster_size;
        let (index, offset) = match self.cursor {
            Cursor::EndOfStream => return Ok(0),
            Cursor::BeforeFirst => {
                if !self.enter_cluster(0)? {
                    return Ok(0);
                }
                (0, 0)
            }
            Cursor::InCluster { index, offset } if offset >= cluster_size => {
                if !self.enter_cluster(index + 1)? {
                    return Ok(0);
                }
                (index + 1, 0)
            }
            Cursor::InCluster { index, offset } => (index, offset),
        };

        // Data from only one cluster is returned per call
        let read_len = usize::min(cluster_size - offset, buf.len());
        buf[..read_len].copy_from_slice(&self.current_cluster[offset..offset + read_len]);

        self.cursor = Cursor::InCluster {
            index,
            offset: offset + read_len,
        };

        Ok(read_len)
    }
}

impl<'image, R> Seek for Reader<'image, R>
where
    R: Read + Seek,
{
    /// Seeking at or beyond the end of the virtual disk positions the reader at
    /// end of stream and returns the length of the disk.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(new_pos) => Some(new_pos),
            SeekFrom::End(from_end) => self.config.len().checked_add_signed(from_end),
            SeekFrom::Current(rel_offset) => self.position().checked_add_signed(rel_offset),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek out of range of 64-bit position",
            )
        })?;

        if target >= self.config.len() {
            self.cursor = Cursor::EndOfStream;
            return Ok(self.position());
        }

        let cluster_size = self.config.cluster_size as u64;
        let index = target / cluster_size;
        let offset = (target % cluster_size) as usize;

        match self.cursor {
            Cursor::InCluster { index: current, .. } if current == index => {}
            _ => self.load_cluster(index)?,
        }
        self.cursor = Cursor::InCluster { index, offset };

        Ok(target)
    }
}

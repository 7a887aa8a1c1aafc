#![allow(dead_code)]

use flate2::{Compression, write::DeflateEncoder};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;

const COPIED: u64 = 1 << 63;
const COMPRESSED: u64 = 1 << 62;
const ZERO: u64 = 1 << 0;

/// How a guest cluster gets stored in a generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Cluster aligned copy of the data
    Raw,

    /// Deflate compressed, falling back to raw when compression doesn't help (as qemu does)
    Compressed,

    /// Zero flag in the L2 entry
    Zero,

    /// L2 entry left at 0
    Unallocated,
}

/// A generated image plus where its structures ended up.
pub struct Image {
    pub bytes: Vec<u8>,
    pub l1_offset: u64,
    pub l2_offsets: Vec<u64>,
    /// Everything from here on is cluster data
    pub data_start: u64,
}

/// Writes small qcow2 images in memory.
pub struct ImageBuilder {
    version: u32,
    cluster_bits: u32,
    virtual_size: u64,
    clusters: Vec<(Encoding, Vec<u8>)>,
    incompatible_features: u64,
    header_length: u32,
    compression_type: u8,
}

impl ImageBuilder {
    /// Every cluster starts unallocated.
    pub fn new(cluster_bits: u32, virtual_size: u64) -> Self {
        let cluster_size = 1u64 << cluster_bits;
        let count = virtual_size.div_ceil(cluster_size) as usize;

        Self {
            version: 3,
            cluster_bits,
            virtual_size,
            clusters: vec![(Encoding::Unallocated, Vec::new()); count],
            incompatible_features: 0,
            header_length: 112,
            compression_type: 0,
        }
    }

    /// Store `data` cluster by cluster, choosing each encoding with `encode`.
    pub fn from_raw(
        cluster_bits: u32,
        data: &[u8],
        mut encode: impl FnMut(usize, &[u8]) -> Encoding,
    ) -> Self {
        let mut builder = Self::new(cluster_bits, data.len() as u64);
        for (i, chunk) in data.chunks(1 << cluster_bits).enumerate() {
            let encoding = encode(i, chunk);
            builder = builder.cluster(i, encoding, chunk);
        }
        builder
    }

    /// What `qemu-img convert -c` produces: zero clusters unallocated, the rest compressed.
    pub fn qemu_compressed(cluster_bits: u32, data: &[u8]) -> Self {
        Self::from_raw(cluster_bits, data, |_, chunk| {
            if chunk.iter().all(|&b| b == 0) {
                Encoding::Unallocated
            } else {
                Encoding::Compressed
            }
        })
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn incompatible_features(mut self, bits: u64) -> Self {
        self.incompatible_features = bits;
        self
    }

    pub fn header_length(mut self, length: u32) -> Self {
        self.header_length = length;
        self
    }

    pub fn compression_type(mut self, compression_type: u8) -> Self {
        self.compression_type = compression_type;
        self
    }

    pub fn cluster(mut self, index: usize, encoding: Encoding, data: &[u8]) -> Self {
        let mut data = data.to_vec();
        data.resize(1 << self.cluster_bits, 0);
        self.clusters[index] = (encoding, data);
        self
    }

    pub fn build(&self) -> Image {
        let cluster_size = 1u64 << self.cluster_bits;
        let l2_entries = (cluster_size / 8) as usize;
        let l1_size = self.clusters.len().div_ceil(l2_entries);

        let header_length = if self.version == 2 {
            72
        } else {
            self.header_length
        };

        // header, then L1 table, then L2 tables, then raw clusters, then compressed data
        let l1_offset = u64::from(header_length).next_multiple_of(cluster_size);
        let mut next = l1_offset + (l1_size as u64 * 8).next_multiple_of(cluster_size);

        let mut l2_offsets = Vec::new();
        for region in self.clusters.chunks(l2_entries) {
            if region.iter().all(|(e, _)| *e == Encoding::Unallocated) {
                l2_offsets.push(0);
            } else {
                l2_offsets.push(next);
                next += cluster_size;
            }
        }
        let data_start = next;

        let mut entries = vec![0u64; self.clusters.len()];
        let mut raw = Vec::new();
        let mut compressed = Vec::new();

        for (i, (encoding, data)) in self.clusters.iter().enumerate() {
            let mut encoding = *encoding;
            let stream = if encoding == Encoding::Compressed {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).unwrap();
                encoder.finish().unwrap()
            } else {
                Vec::new()
            };

            if stream.len() as u64 >= cluster_size {
                encoding = Encoding::Raw;
            }

            entries[i] = match encoding {
                Encoding::Raw => {
                    raw.push(data);
                    (data_start + (raw.len() as u64 - 1) * cluster_size) | COPIED
                }
                Encoding::Compressed => {
                    let offset = compressed.len() as u64;
                    compressed.extend_from_slice(&stream);
                    offset | COMPRESSED
                }
                Encoding::Zero => ZERO | COPIED,
                Encoding::Unallocated => 0,
            };
        }

        // Compressed offsets are relative until the raw clusters are placed
        let compressed_start = data_start + raw.len() as u64 * cluster_size;
        let host_bits = 70 - self.cluster_bits;
        for entry in entries.iter_mut().filter(|e| **e & COMPRESSED != 0) {
            *entry += compressed_start;
        }
        self.fill_sector_counts(&mut entries, &compressed, compressed_start, host_bits);

        let mut file = vec![0u8; compressed_start as usize];
        self.write_header(&mut file, header_length, l1_size as u32, l1_offset);

        for (i, l2_offset) in l2_offsets.iter().enumerate() {
            let l1_entry = if *l2_offset == 0 { 0 } else { l2_offset | COPIED };
            put_u64(&mut file, l1_offset as usize + i * 8, l1_entry);

            if *l2_offset != 0 {
                let region = &entries[i * l2_entries..entries.len().min((i + 1) * l2_entries)];
                for (j, entry) in region.iter().enumerate() {
                    put_u64(&mut file, *l2_offset as usize + j * 8, *entry);
                }
            }
        }

        for (i, data) in raw.iter().enumerate() {
            let offset = (data_start + i as u64 * cluster_size) as usize;
            file[offset..offset + data.len()].copy_from_slice(data);
        }
        file.extend_from_slice(&compressed);

        // Pad the way qemu does so the final compressed sector is complete
        file.resize(file.len().next_multiple_of(512), 0);

        Image {
            bytes: file,
            l1_offset,
            l2_offsets,
            data_start,
        }
    }

    /// Encode the number of additional sectors each compressed stream spans.
    fn fill_sector_counts(
        &self,
        entries: &mut [u64],
        compressed: &[u8],
        compressed_start: u64,
        host_bits: u32,
    ) {
        let mut starts: Vec<u64> = entries
            .iter()
            .filter(|e| **e & COMPRESSED != 0)
            .map(|e| *e & ((1 << host_bits) - 1))
            .collect();
        starts.sort_unstable();
        let end = compressed_start + compressed.len() as u64;

        for entry in entries.iter_mut().filter(|e| **e & COMPRESSED != 0) {
            let offset = *entry & ((1 << host_bits) - 1);
            let stream_end = starts
                .iter()
                .copied()
                .find(|&s| s > offset)
                .unwrap_or(end);

            let first_sector = offset / 512;
            let last_sector = (stream_end - 1) / 512;
            *entry |= (last_sector - first_sector) << host_bits;
        }
    }

    fn write_header(&self, file: &mut [u8], header_length: u32, l1_size: u32, l1_offset: u64) {
        file[0..4].copy_from_slice(b"QFI\xfb");
        put_u32(file, 4, self.version);
        put_u32(file, 20, self.cluster_bits);
        put_u64(file, 24, self.virtual_size);
        put_u32(file, 36, l1_size);
        put_u64(file, 40, l1_offset);

        if self.version >= 3 {
            put_u64(file, 72, self.incompatible_features);
            put_u32(file, 96, 4);
            put_u32(file, 100, header_length);
            if header_length > 104 {
                file[104] = self.compression_type;
            }
        }
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Records every byte range read from the inner reader.
pub struct TrackingReader<R> {
    inner: R,
    pos: u64,
    pub reads: Vec<Range<u64>>,
}

impl<R: Read + Seek> TrackingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pos: 0,
            reads: Vec::new(),
        }
    }

    /// Whether any read touched bytes at or after `offset`.
    pub fn read_from(&self, offset: u64) -> bool {
        self.reads.iter().any(|r| r.end > offset)
    }
}

impl<R: Read + Seek> Read for TrackingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.reads.push(self.pos..self.pos + n as u64);
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for TrackingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.inner.seek(pos)?;
        Ok(self.pos)
    }
}

/// The pattern used by the reference 65 cluster image.
pub fn counting_pattern(len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    for i in 0..len / 2 {
        buf[2 * i] = (i / 256) as u8;
        buf[2 * i + 1] = (i % 256) as u8;
    }
    buf
}

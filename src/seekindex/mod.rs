//! Seekable decompression — the layer that turns sequential codecs into
//! random-access streams.
//!
//! # Identity rules
//! Every supported codec is identified by its on-disk magic bytes.  The
//! magic is the authoritative identity: extension heuristics may propose a
//! codec, but the magic decides.  A stream whose magic matches no entry in
//! the registry is not a compressed stream as far as this crate is
//! concerned.
//!
//! # The seek table
//! Each codec reader produces a [`SeekTable`]: a sparse, strictly monotonic
//! map from uncompressed offsets to compressed positions plus whatever
//! decoder state the codec needs to restart there (a 32 KiB window for
//! gzip, nothing for bzip2/xz/zstd whose blocks are self-contained).
//! Tables serialize to little-endian blobs stored in the archive index;
//! the one-byte format tag is bumped on any layout change, which
//! invalidates persisted tables (and only them — file rows survive).

use std::io::{self, Read, Seek};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ArcError, Result};

pub mod gzip;
pub mod bzip2;
pub mod xz;
pub mod zstd;
pub mod parallel;

pub use gzip::GzipReader;
pub use bzip2::Bzip2Reader;
pub use xz::XzReader;
pub use zstd::ZstdReader;
pub use parallel::{BlockPool, BlockDecode};

// ── Codec registry ────────────────────────────────────────────────────────────

/// Magic bytes, checked at stream offset 0.
pub const MAGIC_GZIP:  &[u8] = &[0x1f, 0x8b];
pub const MAGIC_BZIP2: &[u8] = b"BZh";
pub const MAGIC_XZ:    &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
pub const MAGIC_ZSTD:  &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Runtime codec discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Codec {
    /// Stable numeric id used in serialized seek-table blobs.
    #[inline]
    pub fn id(self) -> u32 {
        match self {
            Codec::Gzip  => 1,
            Codec::Bzip2 => 2,
            Codec::Xz    => 3,
            Codec::Zstd  => 4,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Codec::Gzip),
            2 => Some(Codec::Bzip2),
            3 => Some(Codec::Xz),
            4 => Some(Codec::Zstd),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics and index table names).
    pub fn name(self) -> &'static str {
        match self {
            Codec::Gzip  => "gzip",
            Codec::Bzip2 => "bzip2",
            Codec::Xz    => "xz",
            Codec::Zstd  => "zstd",
        }
    }

    /// Index-store table holding this codec's serialized seek table.
    pub fn index_table(self) -> &'static str {
        match self {
            Codec::Gzip  => "gzipindex",
            Codec::Bzip2 => "bz2index",
            Codec::Xz    => "xzindex",
            Codec::Zstd  => "zstdindex",
        }
    }

    /// Detect a codec from the first bytes of a stream.
    pub fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(MAGIC_GZIP)  { return Some(Codec::Gzip); }
        if head.starts_with(MAGIC_BZIP2) { return Some(Codec::Bzip2); }
        if head.starts_with(MAGIC_XZ)    { return Some(Codec::Xz); }
        if head.starts_with(MAGIC_ZSTD)  { return Some(Codec::Zstd); }
        None
    }

    /// File-name suffixes conventionally used for this codec.
    pub fn suffixes(self) -> &'static [&'static str] {
        match self {
            Codec::Gzip  => &["gz", "tgz"],
            Codec::Bzip2 => &["bz2", "tbz2", "tb2", "tbz"],
            Codec::Xz    => &["xz", "txz"],
            Codec::Zstd  => &["zst", "zstd", "tzst"],
        }
    }
}

// ── Seek points ───────────────────────────────────────────────────────────────

/// One entry of a seek table.
///
/// `compressed_bits` is a bit offset for bzip2 (whose block boundaries are
/// not byte-aligned) and `8 × byte offset` for every other codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekPoint {
    pub uncompressed:    u64,
    pub compressed_bits: u64,
    /// Decoder state needed to restart here.  Gzip: up to 32 KiB of
    /// trailing window.  Empty for self-contained blocks/frames.
    pub window:          Vec<u8>,
}

impl SeekPoint {
    #[inline]
    pub fn compressed_byte(&self) -> u64 { self.compressed_bits / 8 }
}

/// Serialized seek-table format tag.  Bumped on layout change; an unknown
/// tag forces a rebuild of that codec's table only.
pub const SEEK_TABLE_FORMAT: u8 = 1;

/// Blob chunk cap so no single SQLite row balloons.
pub const SEEK_TABLE_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SeekTable {
    pub codec:        Codec,
    /// Strictly monotonic in both offsets; always starts at (0, start).
    pub points:       Vec<SeekPoint>,
    pub decoded_size: u64,
}

impl SeekTable {
    pub fn new(codec: Codec) -> Self {
        Self { codec, points: Vec::new(), decoded_size: 0 }
    }

    /// Append a seek point, enforcing strict monotonicity.  Out-of-order
    /// points indicate a scanner bug and are rejected.
    pub fn push(&mut self, point: SeekPoint) -> Result<()> {
        if let Some(last) = self.points.last() {
            if point.uncompressed <= last.uncompressed
                || point.compressed_bits <= last.compressed_bits
            {
                return Err(ArcError::Format {
                    offset: point.compressed_byte(),
                    message: format!(
                        "non-monotonic {} seek point ({} <= {})",
                        self.codec.name(), point.uncompressed, last.uncompressed
                    ),
                });
            }
        }
        self.points.push(point);
        Ok(())
    }

    /// Greatest seek point at or before `offset`, or None when `offset`
    /// precedes the first point.
    pub fn find(&self, offset: u64) -> Option<&SeekPoint> {
        let idx = self.points.partition_point(|p| p.uncompressed <= offset);
        if idx == 0 { None } else { Some(&self.points[idx - 1]) }
    }

    /// Index of the block containing `offset` (for block-addressed codecs
    /// where every point starts a block).
    pub fn block_of(&self, offset: u64) -> Option<usize> {
        let idx = self.points.partition_point(|p| p.uncompressed <= offset);
        if idx == 0 { None } else { Some(idx - 1) }
    }

    /// Uncompressed extent `[start, end)` of block `i`.
    pub fn block_range(&self, i: usize) -> (u64, u64) {
        let start = self.points[i].uncompressed;
        let end = self.points.get(i + 1).map_or(self.decoded_size, |p| p.uncompressed);
        (start, end)
    }

    // ── Serialization ────────────────────────────────────────────────────────

    /// Serialize into ≤ [`SEEK_TABLE_CHUNK`]-sized blobs for the index store.
    pub fn to_blobs(&self) -> Vec<Vec<u8>> {
        let mut buf = Vec::with_capacity(32 + self.points.len() * 24);
        buf.push(SEEK_TABLE_FORMAT);

        let mut scratch = [0u8; 8];
        LittleEndian::write_u32(&mut scratch[..4], self.codec.id());
        buf.extend_from_slice(&scratch[..4]);
        LittleEndian::write_u64(&mut scratch, self.decoded_size);
        buf.extend_from_slice(&scratch);
        LittleEndian::write_u64(&mut scratch, self.points.len() as u64);
        buf.extend_from_slice(&scratch);

        for p in &self.points {
            LittleEndian::write_u64(&mut scratch, p.uncompressed);
            buf.extend_from_slice(&scratch);
            LittleEndian::write_u64(&mut scratch, p.compressed_bits);
            buf.extend_from_slice(&scratch);
            LittleEndian::write_u32(&mut scratch[..4], p.window.len() as u32);
            buf.extend_from_slice(&scratch[..4]);
            buf.extend_from_slice(&p.window);
        }

        buf.chunks(SEEK_TABLE_CHUNK).map(|c| c.to_vec()).collect()
    }

    /// Reassemble from index-store blobs.  Any structural mismatch returns
    /// an error; the caller treats that as "rebuild this table".
    pub fn from_blobs(chunks: &[Vec<u8>]) -> Result<Self> {
        let data: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        let bad = |message: &str| ArcError::Format { offset: 0, message: message.into() };

        if data.len() < 21 {
            return Err(bad("seek-table blob truncated"));
        }
        if data[0] != SEEK_TABLE_FORMAT {
            return Err(bad(&format!("unknown seek-table format tag {}", data[0])));
        }

        let codec = Codec::from_id(LittleEndian::read_u32(&data[1..5]))
            .ok_or_else(|| bad("unknown codec id in seek-table blob"))?;
        let decoded_size = LittleEndian::read_u64(&data[5..13]);
        let count = LittleEndian::read_u64(&data[13..21]) as usize;

        let mut table = SeekTable { codec, points: Vec::with_capacity(count), decoded_size };
        let mut pos = 21usize;
        for _ in 0..count {
            if pos + 20 > data.len() {
                return Err(bad("seek-table blob truncated mid-point"));
            }
            let uncompressed = LittleEndian::read_u64(&data[pos..pos + 8]);
            let compressed_bits = LittleEndian::read_u64(&data[pos + 8..pos + 16]);
            let window_len = LittleEndian::read_u32(&data[pos + 16..pos + 20]) as usize;
            pos += 20;
            if pos + window_len > data.len() {
                return Err(bad("seek-table window truncated"));
            }
            let window = data[pos..pos + window_len].to_vec();
            pos += window_len;
            table.push(SeekPoint { uncompressed, compressed_bits, window })?;
        }
        Ok(table)
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Read the stream head for magic detection, restoring the cursor.
pub fn peek_head<R: Read + Seek>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    use std::io::SeekFrom;
    let pos = reader.stream_position()?;
    reader.seek(SeekFrom::Start(0))?;
    let mut head = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match reader.read(&mut head[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    head.truncate(filled);
    reader.seek(SeekFrom::Start(pos))?;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_by_magic() {
        assert_eq!(Codec::detect(&[0x1f, 0x8b, 0x08]), Some(Codec::Gzip));
        assert_eq!(Codec::detect(b"BZh9ab"), Some(Codec::Bzip2));
        assert_eq!(Codec::detect(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]), Some(Codec::Xz));
        assert_eq!(Codec::detect(&[0x28, 0xb5, 0x2f, 0xfd]), Some(Codec::Zstd));
        assert_eq!(Codec::detect(b"ustar"), None);
        assert_eq!(Codec::detect(b""), None);
    }

    #[test]
    fn seek_table_find() {
        let mut t = SeekTable::new(Codec::Zstd);
        for i in 0..4u64 {
            t.push(SeekPoint {
                uncompressed: i * 100,
                compressed_bits: (i * 40 + 8) * 8,
                window: Vec::new(),
            }).unwrap();
        }
        t.decoded_size = 400;
        assert_eq!(t.find(0).unwrap().uncompressed, 0);
        assert_eq!(t.find(99).unwrap().uncompressed, 0);
        assert_eq!(t.find(100).unwrap().uncompressed, 100);
        assert_eq!(t.find(399).unwrap().uncompressed, 300);
        assert_eq!(t.block_range(1), (100, 200));
        assert_eq!(t.block_range(3), (300, 400));
    }

    #[test]
    fn monotonicity_enforced() {
        let mut t = SeekTable::new(Codec::Bzip2);
        t.push(SeekPoint { uncompressed: 0, compressed_bits: 32, window: Vec::new() }).unwrap();
        t.push(SeekPoint { uncompressed: 10, compressed_bits: 64, window: Vec::new() }).unwrap();
        assert!(t.push(SeekPoint { uncompressed: 10, compressed_bits: 96, window: Vec::new() }).is_err());
        assert!(t.push(SeekPoint { uncompressed: 20, compressed_bits: 64, window: Vec::new() }).is_err());
    }

    #[test]
    fn blob_roundtrip() {
        let mut t = SeekTable::new(Codec::Gzip);
        t.push(SeekPoint { uncompressed: 0, compressed_bits: 10 * 8, window: vec![1, 2, 3] }).unwrap();
        t.push(SeekPoint { uncompressed: 500, compressed_bits: 90 * 8, window: vec![0u8; 32768] }).unwrap();
        t.decoded_size = 1000;

        let blobs = t.to_blobs();
        let back = SeekTable::from_blobs(&blobs).unwrap();
        assert_eq!(back.codec, Codec::Gzip);
        assert_eq!(back.decoded_size, 1000);
        assert_eq!(back.points, t.points);
    }

    #[test]
    fn blob_rejects_unknown_tag() {
        let mut t = SeekTable::new(Codec::Xz);
        t.decoded_size = 5;
        let mut blobs = t.to_blobs();
        blobs[0][0] = 0xFF;
        assert!(SeekTable::from_blobs(&blobs).is_err());
    }

    #[test]
    fn blob_chunking() {
        let mut t = SeekTable::new(Codec::Gzip);
        for i in 0..100u64 {
            t.push(SeekPoint {
                uncompressed: i * 1000,
                compressed_bits: (i + 1) * 8000,
                window: vec![0u8; 32768],
            }).unwrap();
        }
        t.decoded_size = 100_000;
        let blobs = t.to_blobs();
        assert!(blobs.len() > 1);
        assert!(blobs.iter().all(|b| b.len() <= SEEK_TABLE_CHUNK));
        let back = SeekTable::from_blobs(&blobs).unwrap();
        assert_eq!(back.points.len(), 100);
    }
}

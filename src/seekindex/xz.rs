//! Random access over xz streams.
//!
//! The xz container already carries everything needed: a tail index with
//! one (unpadded size, uncompressed size) record per block, and blocks that
//! are independently decodable.  The reader parses the footer and index
//! as-is, then serves a block by wrapping its verbatim bytes in a minimal
//! synthetic stream (original stream header, the block, a one-record index,
//! a recomputed footer) handed to the stock decoder, which re-verifies the
//! block check.
//!
//! # Container layout (all multi-byte integers in the index are varints)
//!
//! ```text
//! stream header   12 B   magic FD '7' 'z' 'X' 'Z' 00, flags, CRC32(flags)
//! block 0..n      4-byte aligned: header, data, padding, check
//! index           0x00, count, records, padding, CRC32
//! stream footer   12 B   CRC32, backward size, flags, "YZ"
//! ```
//!
//! Multi-stream files (produced by `xz --block-list` concatenation) are
//! walked footer-to-header from the end; every stream's blocks land in one
//! table.

use std::io::{self, Read, Seek, SeekFrom};

use xz2::read::XzDecoder;

use super::{Codec, SeekPoint, SeekTable};
use crate::error::{ArcError, Result};

pub const STREAM_HEADER_SIZE: u64 = 12;
pub const STREAM_FOOTER_SIZE: u64 = 12;
const FOOTER_MAGIC: &[u8; 2] = b"YZ";
const HEADER_MAGIC: &[u8; 6] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];

// ── Varints ───────────────────────────────────────────────────────────────────

/// Decode one xz multibyte integer; returns (value, bytes consumed).
fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate().take(9) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            // A trailing zero byte (other than the first) is non-canonical.
            if byte == 0 && i > 0 {
                return None;
            }
            return Some((value, i + 1));
        }
    }
    None
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

// ── Parsed container structures ───────────────────────────────────────────────

#[derive(Debug, Clone)]
struct BlockEntry {
    /// Absolute offset of the block header in the file.
    offset:        u64,
    /// Header + data + check, without padding.
    unpadded_size: u64,
    uncompressed:  u64,
}

#[derive(Debug, Clone)]
struct StreamEntry {
    header_offset: u64,
    /// The 2 stream-flag bytes (needed verbatim for synthetic streams).
    flags:         [u8; 2],
    blocks:        Vec<BlockEntry>,
}

fn round_up4(v: u64) -> u64 { (v + 3) & !3 }

/// Parse one stream whose footer ends at `end`.  Returns the stream and
/// the offset where the previous stream (if any) ends.
fn parse_stream<R: Read + Seek>(raw: &mut R, end: u64) -> Result<(StreamEntry, u64)> {
    let bad = |offset: u64, message: String| ArcError::Format { offset, message };

    if end < STREAM_HEADER_SIZE + STREAM_FOOTER_SIZE {
        return Err(bad(end, "xz stream too short".into()));
    }

    // Footer.
    let footer_at = end - STREAM_FOOTER_SIZE;
    raw.seek(SeekFrom::Start(footer_at))?;
    let mut footer = [0u8; STREAM_FOOTER_SIZE as usize];
    raw.read_exact(&mut footer)?;
    if &footer[10..12] != FOOTER_MAGIC {
        return Err(bad(footer_at, "bad xz stream footer magic".into()));
    }
    let stored_crc = u32::from_le_bytes(footer[0..4].try_into().unwrap());
    if crc32fast::hash(&footer[4..10]) != stored_crc {
        return Err(bad(footer_at, "xz stream footer CRC32 mismatch".into()));
    }
    let backward = u32::from_le_bytes(footer[4..8].try_into().unwrap()) as u64;
    let index_size = (backward + 1) * 4;
    let flags = [footer[8], footer[9]];

    // Index.
    if footer_at < index_size {
        return Err(bad(footer_at, "xz index size exceeds file".into()));
    }
    let index_at = footer_at - index_size;
    raw.seek(SeekFrom::Start(index_at))?;
    let mut index = vec![0u8; index_size as usize];
    raw.read_exact(&mut index)?;
    if index[0] != 0x00 {
        return Err(bad(index_at, "bad xz index indicator".into()));
    }
    let index_crc = u32::from_le_bytes(index[index.len() - 4..].try_into().unwrap());
    if crc32fast::hash(&index[..index.len() - 4]) != index_crc {
        return Err(bad(index_at, "xz index CRC32 mismatch".into()));
    }

    let mut pos = 1usize;
    let (count, n) = read_varint(&index[pos..])
        .ok_or_else(|| bad(index_at, "bad xz index record count".into()))?;
    pos += n;

    let mut records = Vec::with_capacity(count as usize);
    let mut blocks_size = 0u64;
    for _ in 0..count {
        let (unpadded, n) = read_varint(&index[pos..])
            .ok_or_else(|| bad(index_at, "bad xz index record".into()))?;
        pos += n;
        let (uncompressed, n) = read_varint(&index[pos..])
            .ok_or_else(|| bad(index_at, "bad xz index record".into()))?;
        pos += n;
        records.push((unpadded, uncompressed));
        blocks_size += round_up4(unpadded);
    }

    // Header sits right before the first block.
    if index_at < blocks_size + STREAM_HEADER_SIZE {
        return Err(bad(index_at, "xz blocks overflow the stream".into()));
    }
    let header_offset = index_at - blocks_size - STREAM_HEADER_SIZE;
    raw.seek(SeekFrom::Start(header_offset))?;
    let mut header = [0u8; STREAM_HEADER_SIZE as usize];
    raw.read_exact(&mut header)?;
    if &header[..6] != HEADER_MAGIC {
        return Err(bad(header_offset, "bad xz stream header magic".into()));
    }
    if header[6..8] != flags {
        return Err(bad(header_offset, "xz stream header/footer flag mismatch".into()));
    }

    let mut offset = header_offset + STREAM_HEADER_SIZE;
    let mut blocks = Vec::with_capacity(records.len());
    for (unpadded, uncompressed) in records {
        blocks.push(BlockEntry { offset, unpadded_size: unpadded, uncompressed });
        offset += round_up4(unpadded);
    }

    Ok((StreamEntry { header_offset, flags, blocks }, header_offset))
}

/// Build the synthetic single-block stream for `block`.
fn synthesize_block<R: Read + Seek>(
    raw:    &mut R,
    flags:  &[u8; 2],
    block:  &BlockEntry,
) -> io::Result<Vec<u8>> {
    let padded = round_up4(block.unpadded_size);
    let mut out = Vec::with_capacity((STREAM_HEADER_SIZE + padded + 32 + STREAM_FOOTER_SIZE) as usize);

    // Stream header: magic, flags, CRC32(flags).
    out.extend_from_slice(HEADER_MAGIC);
    out.extend_from_slice(flags);
    out.extend_from_slice(&crc32fast::hash(flags).to_le_bytes());

    // Block, verbatim including its padding and check.
    let block_start = out.len();
    out.resize(block_start + padded as usize, 0);
    raw.seek(SeekFrom::Start(block.offset))?;
    raw.read_exact(&mut out[block_start..])?;

    // One-record index.
    let mut index = vec![0x00u8];
    write_varint(&mut index, 1);
    write_varint(&mut index, block.unpadded_size);
    write_varint(&mut index, block.uncompressed);
    while index.len() % 4 != 0 {
        index.push(0);
    }
    let index_crc = crc32fast::hash(&index);
    index.extend_from_slice(&index_crc.to_le_bytes());
    let index_len = index.len() as u32;
    out.extend_from_slice(&index);

    // Footer: CRC32(backward + flags), backward size, flags, magic.
    let backward = (index_len / 4) - 1;
    let mut tail = Vec::with_capacity(6);
    tail.extend_from_slice(&backward.to_le_bytes());
    tail.extend_from_slice(flags);
    out.extend_from_slice(&crc32fast::hash(&tail).to_le_bytes());
    out.extend_from_slice(&tail);
    out.extend_from_slice(FOOTER_MAGIC);

    Ok(out)
}

/// Decode a synthetic single-block stream.  Stateless, so the worker pool
/// can run it off-thread.
pub(crate) fn decode_synthetic(stream: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    XzDecoder::new(stream).read_to_end(&mut out)?;
    Ok(out)
}

// ── XzReader ──────────────────────────────────────────────────────────────────

pub struct XzReader<R: Read + Seek + Send> {
    raw:    R,
    table:  SeekTable,
    /// Per seek point: (stream flags, unpadded size) to rebuild synthetics.
    blocks: Vec<([u8; 2], u64, u64)>, // (flags, unpadded_size, uncompressed)
    pos:    u64,
    cached: Option<(usize, Vec<u8>)>,
    pool:   Option<super::parallel::BlockPool>,
}

impl<R: Read + Seek + Send> XzReader<R> {
    pub fn open(mut raw: R) -> Result<Self> {
        let file_size = raw.seek(SeekFrom::End(0))?;

        // Walk streams back to front; stream padding (4-byte aligned runs
        // of zeros between streams) is skipped.
        let mut streams = Vec::new();
        let mut end = file_size;
        while end > 0 {
            // Skip stream padding: aligned zero words before a footer.
            end = skip_stream_padding(&mut raw, end)?;
            if end == 0 {
                break;
            }
            let (stream, start) = parse_stream(&mut raw, end)?;
            streams.push(stream);
            end = start;
        }
        streams.reverse();

        if streams.is_empty() {
            return Err(ArcError::Format { offset: 0, message: "no xz stream found".into() });
        }

        let mut table = SeekTable::new(Codec::Xz);
        let mut blocks = Vec::new();
        let mut uncompressed = 0u64;
        for stream in &streams {
            for block in &stream.blocks {
                if block.uncompressed == 0 {
                    continue; // empty blocks carry no seekable content
                }
                table.push(SeekPoint {
                    uncompressed,
                    compressed_bits: block.offset * 8,
                    window: Vec::new(),
                })?;
                blocks.push((stream.flags, block.unpadded_size, block.uncompressed));
                uncompressed += block.uncompressed;
            }
        }
        table.decoded_size = uncompressed;

        Ok(Self { raw, table, blocks, pos: 0, cached: None, pool: None })
    }

    /// Reuse a persisted table.  The container tail is re-parsed for block
    /// shapes (cheap; the expensive part is decoding, which is skipped).
    pub fn with_table(raw: R, table: SeekTable) -> Result<Self> {
        if table.codec != Codec::Xz {
            return Err(ArcError::Format { offset: 0, message: "not an xz seek table".into() });
        }
        let mut reader = Self::open(raw)?;
        if reader.table.points.len() != table.points.len() {
            return Err(ArcError::Format {
                offset: 0,
                message: "persisted xz seek table does not match the container index".into(),
            });
        }
        reader.table = table;
        Ok(reader)
    }

    /// Attach a decode worker pool (`--parallelization`).
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        if threads > 1 {
            self.pool = Some(super::parallel::BlockPool::new(
                threads,
                std::sync::Arc::new(|job: Vec<u8>| decode_synthetic(&job)),
            ));
        }
        self
    }

    #[inline]
    pub fn size(&self) -> u64 { self.table.decoded_size }

    #[inline]
    pub fn seek_table(&self) -> &SeekTable { &self.table }

    fn block_bytes(&mut self, i: usize) -> io::Result<Vec<u8>> {
        let (flags, unpadded, uncompressed) = self.blocks[i];
        let entry = BlockEntry {
            offset:        self.table.points[i].compressed_byte(),
            unpadded_size: unpadded,
            uncompressed,
        };
        synthesize_block(&mut self.raw, &flags, &entry)
    }

    fn block(&mut self, i: usize) -> io::Result<Vec<u8>> {
        if let Some((idx, data)) = &self.cached {
            if *idx == i {
                return Ok(data.clone());
            }
        }
        let data = if let Some(pool) = self.pool.take() {
            // Schedule this block and the next few for sequential patterns.
            let mut jobs = Vec::new();
            for j in i..(i + pool.workers()).min(self.blocks.len()) {
                if !pool.is_ready_or_pending(j) {
                    jobs.push((j, self.block_bytes(j)?));
                }
            }
            for (j, bytes) in jobs {
                pool.schedule(j, bytes);
            }
            let data = pool.wait(i);
            self.pool = Some(pool);
            data.map_err(|e| io::Error::new(io::ErrorKind::InvalidData,
                ArcError::CorruptBlock {
                    codec: "xz",
                    offset: self.table.points[i].compressed_byte(),
                    message: e.to_string(),
                }.to_string()))?
        } else {
            let bytes = self.block_bytes(i)?;
            decode_synthetic(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData,
                ArcError::CorruptBlock {
                    codec: "xz",
                    offset: self.table.points[i].compressed_byte(),
                    message: e.to_string(),
                }.to_string()))?
        };
        self.cached = Some((i, data.clone()));
        Ok(data)
    }

    pub fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.table.decoded_size || buf.is_empty() {
            return Ok(0);
        }
        let mut block_idx = match self.table.block_of(offset) {
            Some(i) => i,
            None => return Ok(0),
        };

        let mut written = 0usize;
        let mut virtual_pos = offset;
        while written < buf.len() && block_idx < self.table.points.len() {
            let (block_start, _) = self.table.block_range(block_idx);
            let data = self.block(block_idx)?;
            let within = (virtual_pos - block_start) as usize;
            if within >= data.len() {
                break;
            }
            let take = (data.len() - within).min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&data[within..within + take]);
            written += take;
            virtual_pos += take as u64;
            block_idx += 1;
        }
        Ok(written)
    }
}

/// Move `end` past any 4-byte-aligned zero padding between streams.
fn skip_stream_padding<R: Read + Seek>(raw: &mut R, mut end: u64) -> Result<u64> {
    let mut word = [0u8; 4];
    while end >= 4 {
        raw.seek(SeekFrom::Start(end - 4))?;
        raw.read_exact(&mut word)?;
        if word != [0, 0, 0, 0] {
            break;
        }
        end -= 4;
    }
    Ok(end)
}

impl<R: Read + Seek + Send> Read for XzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos;
        let n = self.read_exact_at(buf, pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek + Send> Seek for XzReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i64 = match pos {
            SeekFrom::Start(p)   => p as i64,
            SeekFrom::End(p)     => self.table.decoded_size as i64 + p,
            SeekFrom::Current(p) => self.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use xz2::write::XzEncoder;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn xz_multi_block(data: &[u8], block_size: usize) -> Vec<u8> {
        // Independent blocks are produced as concatenated streams, which
        // the reader must handle identically to `--block-list` output.
        let mut out = Vec::new();
        for chunk in data.chunks(block_size) {
            let mut enc = XzEncoder::new(Vec::new(), 1);
            enc.write_all(chunk).unwrap();
            out.extend(enc.finish().unwrap());
        }
        out
    }

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX >> 1] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let (back, n) = read_varint(&buf).unwrap();
            assert_eq!(back, value);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn single_stream_roundtrip() {
        let data = pseudo_random(200_000, 31);
        let mut enc = XzEncoder::new(Vec::new(), 3);
        enc.write_all(&data).unwrap();
        let compressed = enc.finish().unwrap();

        let mut reader = XzReader::open(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn multi_stream_random_access() {
        let data = pseudo_random(500_000, 37);
        let compressed = xz_multi_block(&data, 100_000);
        let mut reader = XzReader::open(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.seek_table().points.len(), 5);
        assert_eq!(reader.size(), data.len() as u64);

        for &offset in &[0u64, 99_999, 100_000, 250_000, 499_999] {
            let mut byte = [0u8; 1];
            assert_eq!(reader.read_exact_at(&mut byte, offset).unwrap(), 1);
            assert_eq!(byte[0], data[offset as usize], "offset {offset}");
        }
    }

    #[test]
    fn cross_block_read() {
        let data = pseudo_random(300_000, 41);
        let compressed = xz_multi_block(&data, 100_000);
        let mut reader = XzReader::open(Cursor::new(compressed)).unwrap();
        let mut buf = vec![0u8; 50_000];
        assert_eq!(reader.read_exact_at(&mut buf, 75_000).unwrap(), buf.len());
        assert_eq!(buf, &data[75_000..125_000]);
    }

    #[test]
    fn parallel_decode_matches() {
        let data = pseudo_random(400_000, 43);
        let compressed = xz_multi_block(&data, 50_000);
        let mut reader = XzReader::open(Cursor::new(compressed)).unwrap().with_parallelism(4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}

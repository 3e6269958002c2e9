//! Random access over bzip2 streams.
//!
//! Every bzip2 block is independently decodable, but block boundaries sit
//! at arbitrary *bit* offsets.  The scanner slides a 64-bit register over
//! the compressed stream and records every position of the 48-bit block
//! magic (0x314159265359) and end-of-stream magic (0x177245385090), at any
//! of the eight bit alignments.
//!
//! A block is served by re-framing it as a synthetic single-block stream:
//! a fresh `BZh9` header, the block's bits shifted to byte alignment, the
//! end-of-stream magic, and the block's own CRC as the combined stream CRC.
//! The stock decoder then handles huffman tables and CRC verification.
//!
//! The 48-bit magic can theoretically appear inside compressed data.  A
//! false positive fails to decode, in which case its range is merged back
//! into the preceding block and the scan retries; genuine corruption (a
//! block that still fails after the merge) aborts the scan with the
//! offending bit offset.
//!
//! Concatenated multi-stream files work without special casing: stream
//! padding is byte-aligned, and re-framing always uses level 9 so blocks
//! from any-level streams fit the decode buffer.

use std::io::{self, Read, Seek, SeekFrom};

use bzip2::read::BzDecoder;

use super::{Codec, SeekPoint, SeekTable};
use crate::error::{ArcError, Result};

const BLOCK_MAGIC: u64 = 0x3141_5926_5359;
const EOS_MAGIC:   u64 = 0x1772_4538_5090;
const MAGIC_BITS:  u32 = 48;
const MAGIC_MASK:  u64 = (1 << MAGIC_BITS) - 1;

const SCAN_CHUNK: usize = 256 * 1024;

// ── Bit plumbing ──────────────────────────────────────────────────────────────

/// Append-only bit accumulator for building the synthetic stream.
struct BitWriter {
    out:      Vec<u8>,
    /// Bits pending in `acc`, most significant first.
    acc:      u64,
    acc_bits: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self { out: Vec::new(), acc: 0, acc_bits: 0 }
    }

    fn push_bits(&mut self, value: u64, bits: u32) {
        debug_assert!(bits <= 56 && self.acc_bits + bits <= 64);
        let mask = if bits == 0 { 0 } else { u64::MAX >> (64 - bits) };
        self.acc = (self.acc << bits) | (value & mask);
        self.acc_bits += bits;
        while self.acc_bits >= 8 {
            self.acc_bits -= 8;
            self.out.push((self.acc >> self.acc_bits) as u8);
        }
    }

    /// Append `bit_len` bits from `data`, starting `bit_off` bits into it.
    fn push_slice(&mut self, data: &[u8], bit_off: u64, bit_len: u64) {
        let mut remaining = bit_len;
        let mut pos = bit_off;
        while remaining > 0 {
            let byte = data[(pos / 8) as usize];
            let used = (pos % 8) as u32;
            let take = (8 - used).min(remaining as u32);
            let value = (byte as u64 >> (8 - used - take)) & ((1 << take) - 1);
            self.push_bits(value, take);
            pos += take as u64;
            remaining -= take as u64;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.acc_bits > 0 {
            let pad = 8 - self.acc_bits;
            self.push_bits(0, pad);
        }
        self.out
    }
}

// ── Scan events ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MagicKind {
    Block,
    Eos,
}

/// Scan the whole compressed stream for block/EOS magics at any bit
/// alignment.  Returns (bit offset, kind) pairs in stream order.
fn scan_magics<R: Read + Seek>(raw: &mut R) -> io::Result<Vec<(u64, MagicKind)>> {
    raw.seek(SeekFrom::Start(0))?;
    let mut register = 0u64;
    let mut events = Vec::new();
    let mut chunk = vec![0u8; SCAN_CHUNK];
    let mut byte_index = 0u64;

    loop {
        let n = raw.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        for &byte in &chunk[..n] {
            register = (register << 8) | byte as u64;
            // Candidates ending inside this byte, one per bit alignment.
            if byte_index >= 6 {
                for shift in 0..8u32 {
                    let value = (register >> shift) & MAGIC_MASK;
                    if value == BLOCK_MAGIC || value == EOS_MAGIC {
                        let end_bit = (byte_index + 1) * 8 - shift as u64;
                        let start_bit = end_bit - MAGIC_BITS as u64;
                        let kind = if value == BLOCK_MAGIC { MagicKind::Block } else { MagicKind::Eos };
                        events.push((start_bit, kind));
                    }
                }
            }
            byte_index += 1;
        }
    }

    events.sort_by_key(|&(bit, _)| bit);
    events.dedup();
    Ok(events)
}

/// Extract the bit range `[start, end)` of the compressed stream.
fn read_bit_range<R: Read + Seek>(raw: &mut R, start: u64, end: u64) -> io::Result<(Vec<u8>, u64)> {
    let first_byte = start / 8;
    let last_byte = (end + 7) / 8;
    raw.seek(SeekFrom::Start(first_byte))?;
    let mut bytes = vec![0u8; (last_byte - first_byte) as usize];
    raw.read_exact(&mut bytes)?;
    Ok((bytes, start % 8))
}

/// Re-frame the block bits `[start, end)` as a standalone bzip2 stream.
fn synthesize_block<R: Read + Seek>(raw: &mut R, start: u64, end: u64) -> io::Result<Vec<u8>> {
    let (bytes, bit_off) = read_bit_range(raw, start, end)?;

    // Block CRC sits right after the 48-bit block magic.
    let mut crc_reader = BitWriter::new();
    crc_reader.push_slice(&bytes, bit_off + MAGIC_BITS as u64, 32);
    let crc_bytes = crc_reader.finish();
    let block_crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

    let mut w = BitWriter::new();
    // "BZh9": level 9 allocates the largest buffer, fits any block.
    for &b in b"BZh9" {
        w.push_bits(b as u64, 8);
    }
    w.push_slice(&bytes, bit_off, end - start);
    w.push_bits(EOS_MAGIC, MAGIC_BITS);
    w.push_bits(block_crc as u64, 32);
    Ok(w.finish())
}

fn decode_synthetic(stream: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    BzDecoder::new(stream).read_to_end(&mut out)?;
    Ok(out)
}

// ── Bzip2Reader ───────────────────────────────────────────────────────────────

pub struct Bzip2Reader<R: Read + Seek + Send> {
    raw:    R,
    table:  SeekTable,
    /// End bit of the final block (EOS magic position of the last stream).
    ends:   Vec<u64>,
    pos:    u64,
    /// Single-slot cache: the most recently decoded block.
    cached: Option<(usize, Vec<u8>)>,
}

impl<R: Read + Seek + Send> Bzip2Reader<R> {
    /// Scan for block magics and decode every block once to learn its
    /// uncompressed extent.
    pub fn open(mut raw: R) -> Result<Self> {
        let events = scan_magics(&mut raw)?;
        if !events.iter().any(|&(_, k)| k == MagicKind::Block) {
            return Err(ArcError::Format {
                offset: 0,
                message: "no bzip2 block magic found".into(),
            });
        }

        // Pair each block magic with the next event as its end bit.
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for (i, &(bit, kind)) in events.iter().enumerate() {
            if kind != MagicKind::Block {
                continue;
            }
            let end = events.get(i + 1).map(|&(b, _)| b).ok_or(ArcError::Format {
                offset: bit / 8,
                message: "bzip2 stream ends without end-of-stream magic".into(),
            })?;
            ranges.push((bit, end));
        }

        // Decode each block to learn sizes.  A failed decode merges the
        // range into its predecessor once (false-positive magic) before
        // giving up.
        let mut table = SeekTable::new(Codec::Bzip2);
        let mut ends = Vec::with_capacity(ranges.len());
        let mut uncompressed = 0u64;
        let mut i = 0usize;
        while i < ranges.len() {
            let (start, end) = ranges[i];
            let stream = synthesize_block(&mut raw, start, end)?;
            match decode_synthetic(&stream) {
                Ok(data) => {
                    table.push(SeekPoint {
                        uncompressed,
                        compressed_bits: start,
                        window: Vec::new(),
                    })?;
                    ends.push(end);
                    uncompressed += data.len() as u64;
                    i += 1;
                }
                Err(_) if i + 1 < ranges.len() => {
                    // Merge with the following range and drop this magic.
                    let merged_end = ranges[i + 1].1;
                    ranges[i] = (start, merged_end);
                    ranges.remove(i + 1);
                    let stream = synthesize_block(&mut raw, start, merged_end)?;
                    let data = decode_synthetic(&stream).map_err(|e| ArcError::Format {
                        offset: start / 8,
                        message: format!("bzip2 block failed to decode: {e}"),
                    })?;
                    table.push(SeekPoint {
                        uncompressed,
                        compressed_bits: start,
                        window: Vec::new(),
                    })?;
                    ends.push(merged_end);
                    uncompressed += data.len() as u64;
                    i += 1;
                }
                Err(e) => {
                    return Err(ArcError::Format {
                        offset: start / 8,
                        message: format!("bzip2 block failed to decode: {e}"),
                    });
                }
            }
        }
        table.decoded_size = uncompressed;

        Ok(Self { raw, table, ends, pos: 0, cached: None })
    }

    /// Reuse a persisted seek table.  Block end bits are reconstructed
    /// from the next point's start; the last block ends at EOF bits.
    pub fn with_table(mut raw: R, table: SeekTable) -> Result<Self> {
        if table.codec != Codec::Bzip2 || table.points.is_empty() {
            return Err(ArcError::Format {
                offset: 0,
                message: "not a bzip2 seek table".into(),
            });
        }
        // End bits are not persisted; rediscover them from the magic scan.
        // This is cheap relative to decoding and keeps the blob format to
        // plain (bit, byte) pairs.
        let events = scan_magics(&mut raw)?;
        let mut ends = Vec::with_capacity(table.points.len());
        for point in &table.points {
            let end = events
                .iter()
                .find(|&&(bit, _)| bit > point.compressed_bits)
                .map(|&(bit, _)| bit)
                .ok_or(ArcError::Format {
                    offset: point.compressed_byte(),
                    message: "bzip2 block end not found for persisted seek point".into(),
                })?;
            ends.push(end);
        }
        Ok(Self { raw, table, ends, pos: 0, cached: None })
    }

    #[inline]
    pub fn size(&self) -> u64 { self.table.decoded_size }

    #[inline]
    pub fn seek_table(&self) -> &SeekTable { &self.table }

    /// Decode block `i`, consulting the single-slot cache.
    fn block(&mut self, i: usize) -> io::Result<&[u8]> {
        if self.cached.as_ref().map(|(idx, _)| *idx) != Some(i) {
            let start = self.table.points[i].compressed_bits;
            let end = self.ends[i];
            let stream = synthesize_block(&mut self.raw, start, end)?;
            let data = decode_synthetic(&stream).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData,
                    ArcError::CorruptBlock {
                        codec: "bzip2",
                        offset: start / 8,
                        message: e.to_string(),
                    }.to_string())
            })?;
            self.cached = Some((i, data));
        }
        Ok(&self.cached.as_ref().unwrap().1)
    }

    /// Positioned read crossing block boundaries.
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

impl<R: Read + Seek + Send> Read for Bzip2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos;
        let n = self.read_exact_at(buf, pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek + Send> Seek for Bzip2Reader<R> {
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
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::{Cursor, Write};

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn bz2(data: &[u8], level: u32) -> Vec<u8> {
        let mut enc = BzEncoder::new(Vec::new(), Compression::new(level));
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn bit_writer_shifts() {
        let mut w = BitWriter::new();
        w.push_bits(0b101, 3);
        w.push_bits(0b11111, 5);
        let out = w.finish();
        assert_eq!(out, vec![0b1011_1111]);

        let mut w = BitWriter::new();
        w.push_slice(&[0b1100_1010, 0b0101_0011], 3, 9);
        let out = w.finish();
        // Bits 3..12 of the input: 0 1010 0101 → padded to 0101_0010_1000...
        assert_eq!(out, vec![0b0101_0010, 0b1000_0000]);
    }

    #[test]
    fn single_block_roundtrip() {
        let data = pseudo_random(50_000, 11);
        let compressed = bz2(&data, 1);
        let mut reader = Bzip2Reader::open(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        assert_eq!(reader.seek_table().points.len(), 1);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn multi_block_random_access() {
        // Level 1 = 100 KB blocks; 350 KB of input makes four blocks.
        let data = pseudo_random(350_000, 13);
        let compressed = bz2(&data, 1);
        let mut reader = Bzip2Reader::open(Cursor::new(compressed)).unwrap();
        assert!(reader.seek_table().points.len() >= 3,
            "expected multiple blocks, got {}", reader.seek_table().points.len());
        assert_eq!(reader.size(), data.len() as u64);

        for &offset in &[0u64, 99_999, 100_000, 100_001, 250_000, 349_999] {
            let mut byte = [0u8; 1];
            assert_eq!(reader.read_exact_at(&mut byte, offset).unwrap(), 1);
            assert_eq!(byte[0], data[offset as usize], "offset {offset}");
        }
    }

    #[test]
    fn concatenated_streams() {
        let a = pseudo_random(120_000, 17);
        let b = pseudo_random(80_000, 19);
        let mut compressed = bz2(&a, 1);
        compressed.extend(bz2(&b, 9));
        let mut reference = a.clone();
        reference.extend_from_slice(&b);

        let mut reader = Bzip2Reader::open(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.size(), reference.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, reference);
    }

    #[test]
    fn cross_block_read() {
        let data = pseudo_random(250_000, 23);
        let compressed = bz2(&data, 1);
        let mut reader = Bzip2Reader::open(Cursor::new(compressed)).unwrap();
        let mut buf = vec![0u8; 20_000];
        let offset = 95_000u64;
        assert_eq!(reader.read_exact_at(&mut buf, offset).unwrap(), buf.len());
        assert_eq!(buf, &data[95_000..115_000]);
    }

    #[test]
    fn table_reuse() {
        let data = pseudo_random(250_000, 29);
        let compressed = bz2(&data, 1);
        let table = Bzip2Reader::open(Cursor::new(compressed.clone()))
            .unwrap()
            .seek_table()
            .clone();
        let restored = SeekTable::from_blobs(&table.to_blobs()).unwrap();
        let mut reader = Bzip2Reader::with_table(Cursor::new(compressed), restored).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(reader.read_exact_at(&mut buf, 200_000).unwrap(), 32);
        assert_eq!(&buf[..], &data[200_000..200_032]);
    }
}

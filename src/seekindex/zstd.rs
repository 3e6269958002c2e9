//! Random access over zstd streams.
//!
//! Zstd frames are independently decodable, so a stream with two or more
//! frames gets native random access: one scan with the raw streaming
//! decoder finds every frame boundary (the decoder reports a completed
//! frame by returning a zero hint), and each frame becomes a seek point.
//! Skippable frames are consumed but produce no seek point.
//!
//! A single-frame stream larger than 1 MiB cannot seek; that case warns
//! once per mount and falls back to a persistent forward decoder which
//! restarts from the beginning on backward seeks.

use std::io::{self, Read, Seek, SeekFrom};

use zstd::stream::raw::{Decoder as RawDecoder, InBuffer, Operation, OutBuffer};

use super::{Codec, SeekPoint, SeekTable};
use crate::error::{ArcError, Result};

const IN_CHUNK: usize = 128 * 1024;
const OUT_CHUNK: usize = 64 * 1024;

/// Single-frame streams larger than this trigger the sequential-fallback
/// warning.
pub const SINGLE_FRAME_WARN_SIZE: u64 = 1024 * 1024;

/// Decode one complete frame.  Stateless, so the worker pool can run it.
pub(crate) fn decode_frame(frame: &[u8]) -> io::Result<Vec<u8>> {
    zstd::stream::decode_all(frame)
}

// ── Frame scan ────────────────────────────────────────────────────────────────

struct ScanOutcome {
    table:     SeekTable,
    file_size: u64,
}

fn scan<R: Read + Seek>(raw: &mut R) -> Result<ScanOutcome> {
    let file_size = raw.seek(SeekFrom::End(0))?;
    raw.seek(SeekFrom::Start(0))?;

    let mut decoder = RawDecoder::new()?;
    let mut table = SeekTable::new(Codec::Zstd);

    let mut chunk = vec![0u8; IN_CHUNK];
    let mut scratch = vec![0u8; OUT_CHUNK];
    let mut total_in = 0u64;
    let mut total_out = 0u64;
    let mut frame_start = 0u64;
    let mut frame_uncomp_start = 0u64;

    'outer: loop {
        let n = raw.read(&mut chunk)?;
        if n == 0 {
            if total_in < file_size {
                return Err(ArcError::Format {
                    offset: total_in,
                    message: "zstd stream truncated".into(),
                });
            }
            break 'outer;
        }

        let mut input = InBuffer::around(&chunk[..n]);
        while input.pos < input.src.len() {
            let mut output = OutBuffer::around(&mut scratch[..]);
            let in_before = input.pos;
            let hint = decoder.run(&mut input, &mut output).map_err(|e| {
                ArcError::CorruptBlock {
                    codec: "zstd",
                    offset: total_in + input.pos as u64,
                    message: e.to_string(),
                }
            })?;
            total_in += (input.pos - in_before) as u64;
            total_out += output.pos() as u64;

            if hint == 0 {
                // Frame complete.  Skippable frames produce no output and
                // therefore no seek point.
                if total_out > frame_uncomp_start {
                    table.push(SeekPoint {
                        uncompressed:    frame_uncomp_start,
                        compressed_bits: frame_start * 8,
                        window:          Vec::new(),
                    })?;
                }
                frame_start = total_in;
                frame_uncomp_start = total_out;
                decoder.reinit()?;
            }
        }
    }

    table.decoded_size = total_out;
    Ok(ScanOutcome { table, file_size })
}

// ── Sequential fallback ───────────────────────────────────────────────────────

/// Forward-only decoder for the single-big-frame case.
struct Sequential {
    decoder:    RawDecoder<'static>,
    comp_next:  u64,
    in_buf:     Vec<u8>,
    in_off:     usize,
    uncomp_pos: u64,
}

impl Sequential {
    fn new() -> io::Result<Self> {
        Ok(Self {
            decoder:    RawDecoder::new()?,
            comp_next:  0,
            in_buf:     Vec::new(),
            in_off:     0,
            uncomp_pos: 0,
        })
    }

    fn step<R: Read + Seek>(&mut self, raw: &mut R, out: &mut [u8]) -> io::Result<usize> {
        if self.in_off >= self.in_buf.len() {
            self.in_buf.resize(IN_CHUNK, 0);
            raw.seek(SeekFrom::Start(self.comp_next))?;
            let n = raw.read(&mut self.in_buf)?;
            self.in_buf.truncate(n);
            self.in_off = 0;
            self.comp_next += n as u64;
            if n == 0 {
                return Ok(0);
            }
        }
        let mut input = InBuffer::around(&self.in_buf[self.in_off..]);
        let mut output = OutBuffer::around(out);
        self.decoder.run(&mut input, &mut output)?;
        self.in_off += input.pos;
        let produced = output.pos();
        self.uncomp_pos += produced as u64;
        Ok(produced)
    }
}

// ── ZstdReader ────────────────────────────────────────────────────────────────

pub struct ZstdReader<R: Read + Seek + Send> {
    raw:        R,
    table:      SeekTable,
    file_size:  u64,
    pos:        u64,
    cached:     Option<(usize, Vec<u8>)>,
    pool:       Option<super::parallel::BlockPool>,
    /// Engaged for single-frame streams past the warning threshold.
    sequential: Option<Sequential>,
}

impl<R: Read + Seek + Send> ZstdReader<R> {
    pub fn open(mut raw: R) -> Result<Self> {
        let ScanOutcome { table, file_size } = scan(&mut raw)?;
        let mut reader = Self {
            raw,
            table,
            file_size,
            pos: 0,
            cached: None,
            pool: None,
            sequential: None,
        };
        if reader.table.points.len() == 1 && file_size > SINGLE_FRAME_WARN_SIZE {
            log::warn!(
                "zstd stream is a single {:.1} MiB frame; random access degrades to \
                 sequential decoding (recompress with `zstd --no-content-size -B...` \
                 or `t2sz` for seekable output)",
                file_size as f64 / 1024.0 / 1024.0
            );
            reader.sequential = Some(Sequential::new()?);
        }
        Ok(reader)
    }

    pub fn with_table(raw: R, table: SeekTable) -> Result<Self> {
        if table.codec != Codec::Zstd || table.points.is_empty() {
            return Err(ArcError::Format { offset: 0, message: "not a zstd seek table".into() });
        }
        let mut reader = Self {
            raw,
            table,
            file_size: 0,
            pos: 0,
            cached: None,
            pool: None,
            sequential: None,
        };
        reader.file_size = reader.raw.seek(SeekFrom::End(0))?;
        if reader.table.points.len() == 1 && reader.file_size > SINGLE_FRAME_WARN_SIZE {
            reader.sequential = Some(Sequential::new()?);
        }
        Ok(reader)
    }

    /// Attach a decode worker pool (`--parallelization`).
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        if threads > 1 && self.sequential.is_none() {
            self.pool = Some(super::parallel::BlockPool::new(
                threads,
                std::sync::Arc::new(|job: Vec<u8>| decode_frame(&job)),
            ));
        }
        self
    }

    #[inline]
    pub fn size(&self) -> u64 { self.table.decoded_size }

    #[inline]
    pub fn seek_table(&self) -> &SeekTable { &self.table }

    /// Compressed byte range of frame `i`.
    fn frame_span(&self, i: usize) -> (u64, u64) {
        let start = self.table.points[i].compressed_byte();
        let end = self
            .table
            .points
            .get(i + 1)
            .map_or(self.file_size, |p| p.compressed_byte());
        (start, end)
    }

    fn frame_bytes(&mut self, i: usize) -> io::Result<Vec<u8>> {
        let (start, end) = self.frame_span(i);
        self.raw.seek(SeekFrom::Start(start))?;
        let mut bytes = vec![0u8; (end - start) as usize];
        self.raw.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn frame(&mut self, i: usize) -> io::Result<Vec<u8>> {
        if let Some((idx, data)) = &self.cached {
            if *idx == i {
                return Ok(data.clone());
            }
        }
        let corrupt = |offset: u64, e: &io::Error| {
            io::Error::new(io::ErrorKind::InvalidData,
                ArcError::CorruptBlock {
                    codec: "zstd",
                    offset,
                    message: e.to_string(),
                }.to_string())
        };
        let offset = self.table.points[i].compressed_byte();
        let data = if let Some(pool) = self.pool.take() {
            let mut jobs = Vec::new();
            for j in i..(i + pool.workers()).min(self.table.points.len()) {
                if !pool.is_ready_or_pending(j) {
                    jobs.push((j, self.frame_bytes(j)?));
                }
            }
            for (j, bytes) in jobs {
                pool.schedule(j, bytes);
            }
            let data = pool.wait(i);
            self.pool = Some(pool);
            data.map_err(|e| corrupt(offset, &e))?
        } else {
            let bytes = self.frame_bytes(i)?;
            decode_frame(&bytes).map_err(|e| corrupt(offset, &e))?
        };
        self.cached = Some((i, data.clone()));
        Ok(data)
    }

    fn read_sequential(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let needs_restart = self
            .sequential
            .as_ref()
            .map_or(true, |s| s.uncomp_pos > offset);
        if needs_restart {
            self.sequential = Some(Sequential::new()?);
        }
        let seq = self.sequential.as_mut().unwrap();

        let mut scratch = [0u8; OUT_CHUNK];
        while seq.uncomp_pos < offset {
            let want = ((offset - seq.uncomp_pos) as usize).min(scratch.len());
            if seq.step(&mut self.raw, &mut scratch[..want])? == 0 {
                return Ok(0);
            }
        }
        let mut written = 0usize;
        while written < buf.len() {
            let n = seq.step(&mut self.raw, &mut buf[written..])?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }

    pub fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.table.decoded_size || buf.is_empty() {
            return Ok(0);
        }
        if self.sequential.is_some() {
            return self.read_sequential(buf, offset);
        }

        let mut frame_idx = match self.table.block_of(offset) {
            Some(i) => i,
            None => return Ok(0),
        };
        let mut written = 0usize;
        let mut virtual_pos = offset;
        while written < buf.len() && frame_idx < self.table.points.len() {
            let (frame_uncomp, _) = self.table.block_range(frame_idx);
            let data = self.frame(frame_idx)?;
            let within = (virtual_pos - frame_uncomp) as usize;
            if within >= data.len() {
                break;
            }
            let take = (data.len() - within).min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&data[within..within + take]);
            written += take;
            virtual_pos += take as u64;
            frame_idx += 1;
        }
        Ok(written)
    }
}

impl<R: Read + Seek + Send> Read for ZstdReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos;
        let n = self.read_exact_at(buf, pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek + Send> Seek for ZstdReader<R> {
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
    use std::io::Cursor;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn zstd_frames(data: &[u8], frame_size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in data.chunks(frame_size) {
            out.extend(zstd::stream::encode_all(chunk, 3).unwrap());
        }
        out
    }

    #[test]
    fn multi_frame_random_access() {
        let data = pseudo_random(400_000, 51);
        let compressed = zstd_frames(&data, 100_000);
        let mut reader = ZstdReader::open(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.seek_table().points.len(), 4);
        assert_eq!(reader.size(), data.len() as u64);

        for &offset in &[0u64, 99_999, 100_000, 100_001, 399_999] {
            let mut byte = [0u8; 1];
            assert_eq!(reader.read_exact_at(&mut byte, offset).unwrap(), 1);
            assert_eq!(byte[0], data[offset as usize], "offset {offset}");
        }
    }

    #[test]
    fn cross_frame_read() {
        let data = pseudo_random(300_000, 53);
        let compressed = zstd_frames(&data, 100_000);
        let mut reader = ZstdReader::open(Cursor::new(compressed)).unwrap();
        let mut buf = vec![0u8; 150_000];
        assert_eq!(reader.read_exact_at(&mut buf, 50_000).unwrap(), buf.len());
        assert_eq!(buf, &data[50_000..200_000]);
    }

    #[test]
    fn single_small_frame_stays_random_access() {
        let data = pseudo_random(10_000, 55);
        let compressed = zstd::stream::encode_all(&data[..], 3).unwrap();
        let mut reader = ZstdReader::open(Cursor::new(compressed)).unwrap();
        assert!(reader.sequential.is_none());
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_exact_at(&mut buf, 9_000).unwrap(), 16);
        assert_eq!(&buf[..], &data[9_000..9_016]);
    }

    #[test]
    fn single_large_frame_falls_back_to_sequential() {
        let data = pseudo_random(2_500_000, 57);
        let compressed = zstd::stream::encode_all(&data[..], 1).unwrap();
        assert!(compressed.len() as u64 > SINGLE_FRAME_WARN_SIZE);
        let mut reader = ZstdReader::open(Cursor::new(compressed)).unwrap();
        assert!(reader.sequential.is_some());

        // Forward then backward: the backward read restarts the decoder.
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_exact_at(&mut buf, 2_000_000).unwrap(), 8);
        assert_eq!(&buf[..], &data[2_000_000..2_000_008]);
        assert_eq!(reader.read_exact_at(&mut buf, 1_000).unwrap(), 8);
        assert_eq!(&buf[..], &data[1_000..1_008]);
    }

    #[test]
    fn skippable_frames_are_ignored() {
        let data = pseudo_random(50_000, 59);
        let mut compressed = Vec::new();
        // Skippable frame: magic 0x184D2A50, 4-byte size, payload.
        compressed.extend_from_slice(&0x184D2A50u32.to_le_bytes());
        compressed.extend_from_slice(&8u32.to_le_bytes());
        compressed.extend_from_slice(b"metadata");
        compressed.extend(zstd::stream::encode_all(&data[..], 3).unwrap());

        let mut reader = ZstdReader::open(Cursor::new(compressed)).unwrap();
        assert_eq!(reader.seek_table().points.len(), 1);
        assert_eq!(reader.size(), data.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn parallel_decode_matches() {
        let data = pseudo_random(500_000, 61);
        let compressed = zstd_frames(&data, 50_000);
        let mut reader = ZstdReader::open(Cursor::new(compressed)).unwrap().with_parallelism(4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}

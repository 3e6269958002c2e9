//! Random access over gzip streams.
//!
//! # How seek points are made
//! One full scan walks every member of the stream.  Two kinds of positions
//! become seek points:
//! - every member's deflate-data start (byte aligned by definition, empty
//!   window), which also covers concatenated multi-member files, and
//! - deflate sync-flush points: the empty stored block `00 00 FF FF` that
//!   pigz and `Z_SYNC_FLUSH` writers emit.  These are byte aligned and
//!   carry the trailing 32 KiB window so a raw inflater primed with
//!   `set_dictionary` can restart there.
//!
//! The marker bytes can also appear inside an entropy-coded block, so the
//! scan cuts its input at every marker, samples the decoder's output
//! position there, and verifies each candidate by restoring a trial
//! inflater and comparing its output against the reference bytes the scan
//! just produced.  Reads therefore never hit a false positive.
//!
//! Points are recorded at a configurable uncompressed spacing (default
//! 16 MiB, clamped to ≥ 1 MiB).  Offsets with no nearby point decode
//! forward from the nearest earlier one; a persistent forward decoder makes
//! monotonic read patterns (the common TAR walk) cost one pass total.

use std::io::{self, Read, Seek, SeekFrom};

use flate2::{Decompress, FlushDecompress, Status};

use super::{Codec, SeekPoint, SeekTable};
use crate::error::{ArcError, Result};

/// Default distance between recorded seek points (uncompressed bytes).
pub const DEFAULT_SPACING: u64 = 16 * 1024 * 1024;
/// Seek points closer than this are never recorded.
pub const MIN_SPACING: u64 = 1024 * 1024;

const WINDOW_SIZE: usize = 32 * 1024;
const IN_CHUNK: usize = 128 * 1024;
const OUT_CHUNK: usize = 16 * 1024;
const VERIFY_LEN: usize = 4096;
const SYNC_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Forward reads within this distance reuse the live decoder instead of
/// restoring a seek point.
const FORWARD_SLACK: u64 = 4 * 1024 * 1024;

// ── Member header ─────────────────────────────────────────────────────────────

const FLG_FHCRC:    u8 = 0x02;
const FLG_FEXTRA:   u8 = 0x04;
const FLG_FNAME:    u8 = 0x08;
const FLG_FCOMMENT: u8 = 0x10;

/// Parse one gzip member header starting at the reader's current position.
/// Returns the absolute offset of the deflate data, or None at clean EOF.
fn parse_member_header<R: Read + Seek>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut fixed = [0u8; 10];
    let mut filled = 0usize;
    while filled < fixed.len() {
        match reader.read(&mut fixed[filled..])? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                    "truncated gzip member header"))
            }
            n => filled += n,
        }
    }
    if fixed[0] != 0x1f || fixed[1] != 0x8b {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad gzip member magic"));
    }
    if fixed[2] != 8 {
        return Err(io::Error::new(io::ErrorKind::InvalidData,
            format!("unsupported gzip compression method {}", fixed[2])));
    }
    let flags = fixed[3];

    if flags & FLG_FEXTRA != 0 {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        let xlen = u16::from_le_bytes(len) as i64;
        reader.seek(SeekFrom::Current(xlen))?;
    }
    for flag in [FLG_FNAME, FLG_FCOMMENT] {
        if flags & flag != 0 {
            // Zero-terminated field of unknown length.
            let mut byte = [0u8; 1];
            loop {
                reader.read_exact(&mut byte)?;
                if byte[0] == 0 {
                    break;
                }
            }
        }
    }
    if flags & FLG_FHCRC != 0 {
        reader.seek(SeekFrom::Current(2))?;
    }

    Ok(Some(reader.stream_position()?))
}

// ── Rolling output window ─────────────────────────────────────────────────────

struct RollingWindow {
    buf: Vec<u8>,
}

impl RollingWindow {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(2 * WINDOW_SIZE) }
    }

    fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > 2 * WINDOW_SIZE {
            let cut = self.buf.len() - WINDOW_SIZE;
            self.buf.drain(..cut);
        }
    }

    /// Last up-to-32-KiB of output.
    fn snapshot(&self) -> Vec<u8> {
        let start = self.buf.len().saturating_sub(WINDOW_SIZE);
        self.buf[start..].to_vec()
    }

    /// Bytes for the absolute range `[from, from + len)` given that the
    /// window ends at absolute position `end`.  None if already evicted.
    fn range(&self, end: u64, from: u64, len: usize) -> Option<&[u8]> {
        let held_start = end - self.buf.len() as u64;
        if from < held_start || from + len as u64 > end {
            return None;
        }
        let rel = (from - held_start) as usize;
        Some(&self.buf[rel..rel + len])
    }
}

// ── Forward decoder ───────────────────────────────────────────────────────────

/// Live decoding state: a raw inflater plus its absolute positions.
struct Forward {
    inflate:    Decompress,
    /// Absolute compressed offset of the next byte to fetch from the file.
    comp_next:  u64,
    in_buf:     Vec<u8>,
    in_off:     usize,
    /// Absolute uncompressed position of the decoder's output cursor.
    uncomp_pos: u64,
    /// total_in/total_out at the last step, for delta accounting.
    last_in:    u64,
    last_out:   u64,
    /// StreamEnd seen; the 8-byte trailer is not yet consumed.
    member_end: bool,
    eof:        bool,
}

impl Forward {
    fn at_member_start(data_start: u64, uncomp_pos: u64) -> Self {
        Self {
            inflate:    Decompress::new(false),
            comp_next:  data_start,
            in_buf:     Vec::new(),
            in_off:     0,
            uncomp_pos,
            last_in:    0,
            last_out:   0,
            member_end: false,
            eof:        false,
        }
    }

    fn at_seek_point(point: &SeekPoint) -> Result<Self> {
        let mut inflate = Decompress::new(false);
        if !point.window.is_empty() {
            inflate.set_dictionary(&point.window).map_err(|e| ArcError::CorruptBlock {
                codec: "gzip",
                offset: point.compressed_byte(),
                message: format!("window restore failed: {e}"),
            })?;
        }
        Ok(Self {
            inflate,
            comp_next:  point.compressed_byte(),
            in_buf:     Vec::new(),
            in_off:     0,
            uncomp_pos: point.uncompressed,
            last_in:    0,
            last_out:   0,
            member_end: false,
            eof:        false,
        })
    }

    /// Absolute compressed offset of `in_buf[in_off]`.
    fn unconsumed_at(&self) -> u64 {
        self.comp_next - (self.in_buf.len() - self.in_off) as u64
    }

    /// Fetch more compressed bytes.  Returns the freshly read byte count.
    fn refill<R: Read + Seek>(&mut self, raw: &mut R) -> io::Result<usize> {
        self.in_buf.drain(..self.in_off);
        self.in_off = 0;
        let old_len = self.in_buf.len();
        self.in_buf.resize(old_len + IN_CHUNK, 0);
        raw.seek(SeekFrom::Start(self.comp_next))?;
        let n = raw.read(&mut self.in_buf[old_len..])?;
        self.in_buf.truncate(old_len + n);
        self.comp_next += n as u64;
        Ok(n)
    }

    /// Decode one step into `out`, never consuming input at or past
    /// `in_limit` (an absolute compressed offset).  Returns bytes produced.
    /// Produces 0 only at a member end, at EOF, or when input is capped by
    /// `in_limit` (the scanner handles the cap; plain reads pass None).
    fn step<R: Read + Seek>(
        &mut self,
        raw:      &mut R,
        out:      &mut [u8],
        in_limit: Option<u64>,
    ) -> io::Result<usize> {
        if self.eof || self.member_end {
            return Ok(0);
        }
        if self.in_off >= self.in_buf.len() && self.refill(raw)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                "gzip deflate stream truncated"));
        }

        let mut avail = self.in_buf.len() - self.in_off;
        if let Some(limit) = in_limit {
            let here = self.unconsumed_at();
            debug_assert!(limit >= here);
            avail = avail.min((limit - here) as usize);
            if avail == 0 {
                return Ok(0); // parked exactly at the limit
            }
        }

        let input = &self.in_buf[self.in_off..self.in_off + avail];
        let status = self
            .inflate
            .decompress(input, out, FlushDecompress::None)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData,
                format!("inflate failed: {e}")))?;

        let consumed = (self.inflate.total_in() - self.last_in) as usize;
        let produced = (self.inflate.total_out() - self.last_out) as usize;
        self.last_in = self.inflate.total_in();
        self.last_out = self.inflate.total_out();
        self.in_off += consumed;
        self.uncomp_pos += produced as u64;

        if status == Status::StreamEnd {
            self.member_end = true;
        }
        Ok(produced)
    }

    /// Skip the member trailer and position at the next member's deflate
    /// data, if any.  Returns the next member's data-start offset.
    fn next_member<R: Read + Seek>(&mut self, raw: &mut R) -> io::Result<Option<u64>> {
        debug_assert!(self.member_end);
        let trailer_at = self.unconsumed_at();
        raw.seek(SeekFrom::Start(trailer_at + 8))?;
        let next = match parse_member_header(raw) {
            Ok(next) => next,
            // Trailing padding after the last member is common enough
            // (block devices, `dd`-ed files) to tolerate.
            Err(e) if matches!(e.kind(), io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof) => {
                log::warn!("ignoring trailing garbage after gzip stream: {e}");
                None
            }
            Err(e) => return Err(e),
        };
        match next {
            None => {
                self.eof = true;
                Ok(None)
            }
            Some(data_start) => {
                self.inflate.reset(false);
                self.last_in = 0;
                self.last_out = 0;
                self.in_buf.clear();
                self.in_off = 0;
                self.comp_next = data_start;
                self.member_end = false;
                Ok(Some(data_start))
            }
        }
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// A sync-flush candidate awaiting verification against reference output.
struct Candidate {
    uncompressed: u64,
    compressed:   u64,
    window:       Vec<u8>,
}

fn verify_candidate<R: Read + Seek>(
    raw:       &mut R,
    candidate: &Candidate,
    expected:  &[u8],
) -> bool {
    let mut inflate = Decompress::new(false);
    if !candidate.window.is_empty() && inflate.set_dictionary(&candidate.window).is_err() {
        return false;
    }

    if raw.seek(SeekFrom::Start(candidate.compressed)).is_err() {
        return false;
    }
    let mut input = vec![0u8; 4 * VERIFY_LEN];
    let mut filled = 0usize;
    while filled < input.len() {
        match raw.read(&mut input[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    input.truncate(filled);

    let mut produced = Vec::with_capacity(expected.len());
    let mut out = [0u8; OUT_CHUNK];
    let mut in_off = 0usize;
    let mut last_in = 0u64;
    let mut last_out = 0u64;
    while produced.len() < expected.len() && in_off < input.len() {
        let status = match inflate.decompress(&input[in_off..], &mut out, FlushDecompress::None) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let consumed = (inflate.total_in() - last_in) as usize;
        let n = (inflate.total_out() - last_out) as usize;
        last_in = inflate.total_in();
        last_out = inflate.total_out();
        in_off += consumed;
        produced.extend_from_slice(&out[..n]);
        if status == Status::StreamEnd || (n == 0 && consumed == 0) {
            break;
        }
    }

    produced.len() >= expected.len() && &produced[..expected.len()] == expected
}

/// Find absolute end offsets of sync markers inside `fresh` (which starts
/// at absolute offset `base`).  `carry` holds the last 3 bytes preceding
/// `fresh` so markers spanning a refill boundary are found too.
fn find_marker_ends(carry: &[u8], fresh: &[u8], base: u64) -> Vec<u64> {
    let mut joined = Vec::with_capacity(carry.len() + fresh.len());
    joined.extend_from_slice(carry);
    joined.extend_from_slice(fresh);

    let mut ends = Vec::new();
    if joined.len() < 4 {
        return ends;
    }
    for i in 0..=joined.len() - 4 {
        if joined[i..i + 4] == SYNC_MARKER {
            let end_in_fresh = (i + 4) as i64 - carry.len() as i64;
            if end_in_fresh > 0 {
                ends.push(base + end_in_fresh as u64);
            }
        }
    }
    ends
}

/// Full-stream scan: member boundaries plus verified sync-flush points.
fn scan<R: Read + Seek>(raw: &mut R, spacing: u64) -> Result<SeekTable> {
    let mut table = SeekTable::new(Codec::Gzip);

    raw.seek(SeekFrom::Start(0))?;
    let data_start = parse_member_header(raw)?
        .ok_or_else(|| ArcError::Format { offset: 0, message: "empty gzip stream".into() })?;

    table.push(SeekPoint {
        uncompressed:    0,
        compressed_bits: data_start * 8,
        window:          Vec::new(),
    })?;

    let mut forward = Forward::at_member_start(data_start, 0);
    let mut window = RollingWindow::new();
    let mut pending: Vec<Candidate> = Vec::new();
    let mut next_point_at = spacing;
    let mut marker_carry: Vec<u8> = Vec::new();
    let mut marker_ends: Vec<u64> = Vec::new();
    let mut out = [0u8; OUT_CHUNK];

    loop {
        // Refill here (not inside step) so fresh input is marker-scanned.
        if forward.in_off >= forward.in_buf.len() && !forward.member_end && !forward.eof {
            let base = forward.comp_next;
            let n = forward.refill(raw)?;
            if n > 0 {
                let fresh_start = forward.in_buf.len() - n;
                let fresh = forward.in_buf[fresh_start..].to_vec();
                marker_ends.extend(find_marker_ends(&marker_carry, &fresh, base));
                let keep = fresh.len().min(3);
                marker_carry = fresh[fresh.len() - keep..].to_vec();
            } else if forward.in_buf.is_empty() {
                return Err(ArcError::Format {
                    offset: forward.comp_next,
                    message: "gzip deflate stream truncated".into(),
                });
            }
        }

        // Cut the decode at the next marker end so the output position at
        // that exact input boundary can be sampled.  A marker exactly at
        // the consume cursor is still pending its sample.
        marker_ends.retain(|&end| end >= forward.unconsumed_at());
        let limit = marker_ends.first().copied();

        let produced = forward.step(raw, &mut out, limit)?;
        if produced > 0 {
            window.extend(&out[..produced]);
        }

        // Parked exactly at a marker end: the output position is exact.
        if let Some(end) = limit {
            if forward.unconsumed_at() == end && produced == 0 && !forward.member_end {
                marker_ends.remove(0);
                if forward.uncomp_pos >= next_point_at {
                    pending.push(Candidate {
                        uncompressed: forward.uncomp_pos,
                        compressed:   end,
                        window:       window.snapshot(),
                    });
                    next_point_at = forward.uncomp_pos + spacing;
                }
            }
        }

        // Verify ripened candidates (enough reference output now exists).
        while let Some(first) = pending.first() {
            if forward.uncomp_pos < first.uncompressed + VERIFY_LEN as u64 {
                break;
            }
            let candidate = pending.remove(0);
            let expected = window
                .range(forward.uncomp_pos, candidate.uncompressed, VERIFY_LEN)
                .map(<[u8]>::to_vec);
            if let Some(expected) = expected {
                if verify_candidate(raw, &candidate, &expected) {
                    table.push(SeekPoint {
                        uncompressed:    candidate.uncompressed,
                        compressed_bits: candidate.compressed * 8,
                        window:          candidate.window,
                    })?;
                }
            }
        }

        if forward.member_end {
            // Candidates this close to the member end are superseded by the
            // next member-start point.
            pending.clear();
            marker_carry.clear();
            marker_ends.clear();
            match forward.next_member(raw)? {
                None => break,
                Some(next_start) => {
                    let (last_u, last_c) = {
                        let last = table.points.last().unwrap();
                        (last.uncompressed, last.compressed_bits)
                    };
                    if forward.uncomp_pos > last_u && next_start * 8 > last_c {
                        table.push(SeekPoint {
                            uncompressed:    forward.uncomp_pos,
                            compressed_bits: next_start * 8,
                            window:          Vec::new(),
                        })?;
                    }
                }
            }
        }
    }

    table.decoded_size = forward.uncomp_pos;
    Ok(table)
}

// ── GzipReader ────────────────────────────────────────────────────────────────

pub struct GzipReader<R: Read + Seek + Send> {
    raw:     R,
    table:   SeekTable,
    pos:     u64,
    forward: Option<Forward>,
}

impl<R: Read + Seek + Send> GzipReader<R> {
    /// Scan the whole stream once, building the seek table.
    pub fn open(mut raw: R, spacing: u64) -> Result<Self> {
        let spacing = spacing.max(MIN_SPACING);
        let table = scan(&mut raw, spacing)?;
        Ok(Self { raw, table, pos: 0, forward: None })
    }

    /// Reuse a previously persisted seek table; no scan.
    pub fn with_table(raw: R, table: SeekTable) -> Result<Self> {
        if table.codec != Codec::Gzip || table.points.is_empty() {
            return Err(ArcError::Format {
                offset: 0,
                message: "not a gzip seek table".into(),
            });
        }
        Ok(Self { raw, table, pos: 0, forward: None })
    }

    #[inline]
    pub fn size(&self) -> u64 { self.table.decoded_size }

    #[inline]
    pub fn seek_table(&self) -> &SeekTable { &self.table }

    /// Position the forward decoder at or before `offset`.
    fn position(&mut self, offset: u64) -> io::Result<()> {
        let point = self.table.find(offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "gzip seek table has no origin point")
        })?;

        if let Some(f) = &self.forward {
            let usable = !f.eof && f.uncomp_pos <= offset;
            // The live decoder wins if it is within slack of the target or
            // already past the best seek point.
            if usable
                && (offset - f.uncomp_pos <= FORWARD_SLACK
                    || f.uncomp_pos >= point.uncompressed)
            {
                return Ok(());
            }
        }
        self.forward = Some(Forward::at_seek_point(point).map_err(io::Error::from)?);
        Ok(())
    }

    /// Positioned read used by the mount layer.  Does not move the cursor.
    pub fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.table.decoded_size || buf.is_empty() {
            return Ok(0);
        }
        self.position(offset)?;
        let forward = self.forward.as_mut().unwrap();

        // Discard bytes between the decoder position and the target.
        let mut scratch = [0u8; OUT_CHUNK];
        while forward.uncomp_pos < offset {
            let want = ((offset - forward.uncomp_pos) as usize).min(scratch.len());
            let n = forward.step(&mut self.raw, &mut scratch[..want], None)?;
            if n == 0 {
                if forward.member_end {
                    if forward.next_member(&mut self.raw)?.is_none() {
                        return Ok(0);
                    }
                } else if forward.eof {
                    return Ok(0);
                }
            }
        }

        // Fill the caller's buffer.
        let mut written = 0usize;
        while written < buf.len() {
            let n = forward.step(&mut self.raw, &mut buf[written..], None)?;
            if n == 0 {
                if forward.member_end {
                    if forward.next_member(&mut self.raw)?.is_none() {
                        break;
                    }
                } else if forward.eof {
                    break;
                }
            }
            written += n;
        }
        Ok(written)
    }
}

impl<R: Read + Seek + Send> Read for GzipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos;
        let n = self.read_exact_at(buf, pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek + Send> Seek for GzipReader<R> {
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
    use flate2::write::GzEncoder;
    use flate2::{Compress, Compression, FlushCompress};
    use std::io::Cursor;
    use std::io::Write;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn gzip_members(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(chunk).unwrap();
            out.extend(enc.finish().unwrap());
        }
        out
    }

    /// One gzip member with a sync flush every `every` bytes of input.
    fn gzip_with_sync_flushes(data: &[u8], every: usize) -> Vec<u8> {
        let mut body = Vec::new();
        let mut compress = Compress::new(Compression::default(), false);
        let mut out = vec![0u8; 256 * 1024];
        let mut fed = 0usize;
        loop {
            let end = (fed + every).min(data.len());
            let flush = if end == data.len() { FlushCompress::Finish } else { FlushCompress::Sync };
            loop {
                let before_in = compress.total_in();
                let before_out = compress.total_out();
                let status = compress.compress(&data[fed..end], &mut out, flush).unwrap();
                fed += (compress.total_in() - before_in) as usize;
                body.extend_from_slice(&out[..(compress.total_out() - before_out) as usize]);
                if status == Status::StreamEnd {
                    break;
                }
                if fed >= end && flush == FlushCompress::Sync {
                    break;
                }
            }
            if end == data.len() {
                break;
            }
        }

        // Wrap the raw deflate body as one gzip member.
        let mut stream = vec![0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 255];
        stream.extend_from_slice(&body);
        let mut crc = flate2::Crc::new();
        crc.update(data);
        stream.extend_from_slice(&crc.sum().to_le_bytes());
        stream.extend_from_slice(&(data.len() as u32).to_le_bytes());
        stream
    }

    #[test]
    fn multi_member_random_access() {
        let a = pseudo_random(300_000, 1);
        let b = pseudo_random(200_000, 2);
        let compressed = gzip_members(&[&a, &b]);
        let mut reference = a.clone();
        reference.extend_from_slice(&b);

        let mut reader = GzipReader::open(Cursor::new(compressed), MIN_SPACING).unwrap();
        assert_eq!(reader.size(), reference.len() as u64);
        // Member starts are seek points: origin plus the second member.
        assert!(reader.seek_table().points.len() >= 2);

        for &offset in &[0u64, 1, 299_999, 300_000, 300_001, 499_999] {
            let mut byte = [0u8; 1];
            assert_eq!(reader.read_exact_at(&mut byte, offset).unwrap(), 1, "offset {offset}");
            assert_eq!(byte[0], reference[offset as usize], "offset {offset}");
        }
    }

    #[test]
    fn sequential_equals_reference() {
        let data = pseudo_random(100_000, 7);
        let compressed = gzip_members(&[&data]);
        let mut reader = GzipReader::open(Cursor::new(compressed), MIN_SPACING).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn sync_flush_points_are_found_and_verified() {
        // Compressible data keeps the compressed stream free of accidental
        // marker bytes, so every found marker is a genuine flush.
        let data: Vec<u8> = (0..3_000_000u64)
            .map(|i| b"abcdefgh"[(i % 8) as usize])
            .collect();
        let compressed = gzip_with_sync_flushes(&data, 256 * 1024);

        let mut reader = GzipReader::open(Cursor::new(compressed), MIN_SPACING).unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        assert!(
            reader.seek_table().points.len() >= 2,
            "expected sync-flush seek points, got {}",
            reader.seek_table().points.len()
        );

        let mut buf = [0u8; 64];
        let offset = 2_500_000u64;
        let n = reader.read_exact_at(&mut buf, offset).unwrap();
        assert_eq!(n, 64);
        assert_eq!(&buf[..], &data[offset as usize..offset as usize + 64]);
    }

    #[test]
    fn table_reuse_roundtrip() {
        let data = pseudo_random(150_000, 3);
        let compressed = gzip_members(&[&data]);
        let table = {
            let reader = GzipReader::open(Cursor::new(compressed.clone()), MIN_SPACING).unwrap();
            reader.seek_table().clone()
        };
        let blobs = table.to_blobs();
        let restored = SeekTable::from_blobs(&blobs).unwrap();

        let mut reader = GzipReader::with_table(Cursor::new(compressed), restored).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_exact_at(&mut buf, 100_000).unwrap(), 16);
        assert_eq!(&buf[..], &data[100_000..100_016]);
    }

    #[test]
    fn read_past_end() {
        let data = pseudo_random(1000, 4);
        let compressed = gzip_members(&[&data]);
        let mut reader = GzipReader::open(Cursor::new(compressed), MIN_SPACING).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_exact_at(&mut buf, 5000).unwrap(), 0);
    }
}

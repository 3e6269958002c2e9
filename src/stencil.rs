//! Stenciled files — synthetic streams assembled from slices of other streams.
//!
//! A [`StenciledFile`] presents an ordered list of (source, offset, length)
//! slices as one contiguous seekable stream.  It backs three consumers:
//! - joining split archive parts (`foo.001`, `foo.002`, ...),
//! - exposing one TAR entry's payload, including fragmented sparse extents,
//! - serving ZIP per-entry ranges.
//!
//! Reads past the end return fewer bytes (possibly zero).  Errors from an
//! underlying source propagate as I/O failures; no slice is ever mutated.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

/// Anything a stencil can slice: seekable, readable, shareable across the
/// stencils that reference it.
pub trait SeekableSource: Read + Seek + Send {}
impl<T: Read + Seek + Send> SeekableSource for T {}

/// Sources are shared because many stencils (one per archive entry) slice
/// the same underlying archive stream.
pub type SharedSource = Arc<Mutex<dyn SeekableSource>>;

/// One contiguous slice of an underlying source.
#[derive(Clone)]
pub struct Stencil {
    pub source: SharedSource,
    pub offset: u64,
    pub length: u64,
}

impl Stencil {
    pub fn new(source: SharedSource, offset: u64, length: u64) -> Self {
        Self { source, offset, length }
    }
}

// ── StenciledFile ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StenciledFile {
    stencils: Vec<Stencil>,
    /// Prefix sums: `starts[i]` is the virtual offset where stencil `i`
    /// begins; one extra trailing element equal to the total size.
    starts:   Vec<u64>,
    pos:      u64,
    size:     u64,
}

impl StenciledFile {
    pub fn new(stencils: Vec<Stencil>) -> Self {
        let mut starts = Vec::with_capacity(stencils.len() + 1);
        let mut total = 0u64;
        for s in &stencils {
            starts.push(total);
            total += s.length;
        }
        starts.push(total);
        Self { stencils, starts, pos: 0, size: total }
    }

    /// Virtual stream length: the sum of all slice lengths.
    #[inline]
    pub fn size(&self) -> u64 { self.size }

    /// Read up to `buf.len()` bytes starting at `offset`, crossing slice
    /// boundaries as needed.  Does not disturb the seek cursor.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }

        // Index of the stencil whose range contains `offset`.
        let mut index = self.starts.partition_point(|&s| s <= offset) - 1;
        let mut written = 0usize;
        let mut virtual_pos = offset;

        while written < buf.len() && index < self.stencils.len() {
            let stencil = &self.stencils[index];
            let within = virtual_pos - self.starts[index];
            let available = (stencil.length - within) as usize;
            let to_read = available.min(buf.len() - written);

            let mut source = stencil.source.lock().map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "stencil source lock poisoned")
            })?;
            source.seek(SeekFrom::Start(stencil.offset + within))?;
            source.read_exact(&mut buf[written..written + to_read])?;
            drop(source);

            written += to_read;
            virtual_pos += to_read as u64;
            index += 1;
        }

        Ok(written)
    }
}

impl Read for StenciledFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for StenciledFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i64 = match pos {
            SeekFrom::Start(p)   => p as i64,
            SeekFrom::End(p)     => self.size as i64 + p,
            SeekFrom::Current(p) => self.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput,
                "seek before start of stenciled file"));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

// ── JoinedFile ────────────────────────────────────────────────────────────────

/// The degenerate stencil: whole streams concatenated back to back.
/// Used to join split archive parts before format detection.
pub struct JoinedFile;

impl JoinedFile {
    /// Build a stencil over the full length of each source, in order.
    /// Lengths are probed by seeking each source to its end once.
    pub fn new(sources: Vec<SharedSource>) -> io::Result<StenciledFile> {
        let mut stencils = Vec::with_capacity(sources.len());
        for source in sources {
            let length = {
                let mut s = source.lock().map_err(|_| {
                    io::Error::new(io::ErrorKind::Other, "joined source lock poisoned")
                })?;
                s.seek(SeekFrom::End(0))?
            };
            stencils.push(Stencil::new(source, 0, length));
        }
        Ok(StenciledFile::new(stencils))
    }
}

/// Wrap a plain in-memory buffer as a shared source.
pub fn shared_buffer(data: Vec<u8>) -> SharedSource {
    Arc::new(Mutex::new(io::Cursor::new(data)))
}

/// Wrap any owned seekable stream as a shared source.
pub fn shared_source<T: SeekableSource + 'static>(inner: T) -> SharedSource {
    Arc::new(Mutex::new(inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stencil_over(data: &[u8], pieces: &[(u64, u64)]) -> StenciledFile {
        let source = shared_buffer(data.to_vec());
        let stencils = pieces
            .iter()
            .map(|&(off, len)| Stencil::new(Arc::clone(&source), off, len))
            .collect();
        StenciledFile::new(stencils)
    }

    #[test]
    fn reads_cross_boundaries() {
        let mut f = stencil_over(b"0123456789", &[(0, 3), (5, 2), (8, 2)]);
        assert_eq!(f.size(), 7);
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(&out, b"0125689");
    }

    #[test]
    fn read_at_does_not_move_cursor() {
        let mut f = stencil_over(b"abcdef", &[(0, 6)]);
        let mut buf = [0u8; 2];
        assert_eq!(f.read_at(&mut buf, 4).unwrap(), 2);
        assert_eq!(&buf, b"ef");
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn read_past_end_is_short() {
        let mut f = stencil_over(b"abc", &[(0, 3)]);
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(&mut buf, 1).unwrap(), 2);
        assert_eq!(f.read_at(&mut buf, 3).unwrap(), 0);
        assert_eq!(f.read_at(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn empty_stencil_list() {
        let mut f = StenciledFile::new(Vec::new());
        assert_eq!(f.size(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn joined_file_concatenates() {
        let a = shared_buffer(b"foo".to_vec());
        let b = shared_buffer(b"bar".to_vec());
        let mut joined = JoinedFile::new(vec![a, b]).unwrap();
        let mut out = String::new();
        joined.read_to_string(&mut out).unwrap();
        assert_eq!(out, "foobar");
    }

    #[test]
    fn seek_whence_arithmetic() {
        let mut f = stencil_over(b"0123456789", &[(0, 10)]);
        f.seek(SeekFrom::End(-2)).unwrap();
        let mut buf = [0u8; 2];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"89");
        f.seek(SeekFrom::Start(3)).unwrap();
        f.seek(SeekFrom::Current(2)).unwrap();
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"56");
    }

    proptest! {
        /// Any partition of a byte range into consecutive slices reads back
        /// identically to the underlying range.
        #[test]
        fn partition_roundtrip(data in proptest::collection::vec(any::<u8>(), 1..512),
                               cuts in proptest::collection::vec(0usize..512, 0..8)) {
            let mut bounds: Vec<usize> = cuts.into_iter()
                .map(|c| c % data.len())
                .collect();
            bounds.push(0);
            bounds.push(data.len());
            bounds.sort_unstable();
            bounds.dedup();

            let pieces: Vec<(u64, u64)> = bounds.windows(2)
                .map(|w| (w[0] as u64, (w[1] - w[0]) as u64))
                .collect();

            let mut f = stencil_over(&data, &pieces);
            prop_assert_eq!(f.size(), data.len() as u64);
            let mut out = Vec::new();
            f.read_to_end(&mut out).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}

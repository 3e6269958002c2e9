//! The indexed TAR reader — the central archive backend.
//!
//! Enumeration walks the (possibly decompressed) stream once with the
//! `tar` crate, which resolves GNU long names, long link targets, and pax
//! records onto the following header.  Every entry lands as one row in
//! the archive index, keyed by the payload offset so overwritten members
//! become retrievable versions.
//!
//! Three things the crate does not surface are handled here from the raw
//! 512-byte blocks (the stream is seekable, so the header is always a
//! cheap re-read away):
//! - GNU sparse maps (old-GNU `S` headers with extended continuations and
//!   the pax 0.1/1.0 encodings) become stencil extents with zero-filled
//!   holes,
//! - fractional pax mtimes,
//! - GNU-incremental name prefixes: if the heuristic scan of the first
//!   1000 entries finds timestamp-prefixed paths, the prefix directory is
//!   stripped from every entry.  The decision is recorded in the index
//!   configuration so a reused index never disagrees with a fresh walk.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::error::{ArcError, Result};
use crate::index::{
    split_path, ArchiveIndex, FileKind, Fingerprint, IndexBuilder, IndexConfig, IndexLocation,
};
use crate::mountsource::{
    join_paths, EntryLocator, FileInfo, Listing, ModeListing, MountSource, StatFs, Userdata,
};
use crate::seekindex::SeekTable;
use crate::stencil::{SeekableSource, SharedSource, Stencil, StenciledFile};

const BLOCK: u64 = 512;
/// Entries examined by the GNU-incremental heuristic.
const INCREMENTAL_SCAN_ENTRIES: usize = 1000;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    /// Keep scanning past runs of zero blocks (concatenated archives).
    pub ignore_zeros:    bool,
    /// Set when the mount stack will recurse into contained archives;
    /// recorded in the index config because it changes row annotations.
    pub recursive:       bool,
    /// Some(_) forces the GNU-incremental decision; None auto-detects.
    pub gnu_incremental: Option<bool>,
    /// Name encoding recorded in the index config.  Entry names are
    /// decoded as UTF-8 with lossy fallback regardless; the recorded value
    /// keeps index reuse honest when the flag changes.
    pub encoding:        String,
}

impl TarOptions {
    pub(crate) fn to_index_config(&self, gnu_incremental: bool) -> IndexConfig {
        IndexConfig {
            recursive: self.recursive,
            ignore_zeros: self.ignore_zeros,
            gnu_incremental,
            encoding: if self.encoding.is_empty() { "utf-8".into() } else { self.encoding.clone() },
        }
    }
}

// ── Zero source for sparse holes ──────────────────────────────────────────────

/// An infinite run of zeros; sparse holes stencil into it.
struct ZeroSource {
    pos: u64,
}

impl Read for ZeroSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        buf.fill(0);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }
}

impl Seek for ZeroSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(delta) => (self.pos as i64 + delta) as u64,
            SeekFrom::End(_) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput,
                    "zero source has no end"))
            }
        };
        Ok(self.pos)
    }
}

fn zero_source() -> SharedSource {
    Arc::new(std::sync::Mutex::new(ZeroSource { pos: 0 }))
}

// ── Sparse maps ───────────────────────────────────────────────────────────────

/// One populated extent of a sparse file: bytes `[logical, logical+len)`
/// are stored contiguously in the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseExtent {
    pub logical: u64,
    pub len:     u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SparseMap {
    pub real_size: u64,
    pub extents:   Vec<SparseExtent>,
    /// Bytes of payload consumed by a leading pax-1.0 map.
    pub data_skip: u64,
}

/// Reserved xattr key carrying a serialized sparse map.  Hidden from
/// `list_xattr` so it never leaks into the mounted view.
pub const SPARSE_MAP_KEY: &str = "arcmount.sparse";

impl SparseMap {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.extents.len() * 16);
        out.extend_from_slice(&self.real_size.to_le_bytes());
        out.extend_from_slice(&self.data_skip.to_le_bytes());
        out.extend_from_slice(&(self.extents.len() as u64).to_le_bytes());
        for extent in &self.extents {
            out.extend_from_slice(&extent.logical.to_le_bytes());
            out.extend_from_slice(&extent.len.to_le_bytes());
        }
        out
    }

    fn from_bytes(data: &[u8]) -> Option<Self> {
        let word = |i: usize| -> Option<u64> {
            data.get(i * 8..i * 8 + 8)?
                .try_into()
                .ok()
                .map(u64::from_le_bytes)
        };
        let real_size = word(0)?;
        let data_skip = word(1)?;
        let count = word(2)? as usize;
        let mut extents = Vec::with_capacity(count);
        for i in 0..count {
            extents.push(SparseExtent {
                logical: word(3 + i * 2)?,
                len:     word(4 + i * 2)?,
            });
        }
        Some(Self { real_size, extents, data_skip })
    }
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: Vec<u8> = field.iter().copied().filter(|&b| b != b' ' && b != 0).collect();
    if digits.is_empty() {
        return None;
    }
    let mut value = 0u64;
    for b in digits {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        value = value * 8 + (b - b'0') as u64;
    }
    Some(value)
}

/// Parse an old-GNU sparse header (entry type `S`) plus its extended
/// continuation blocks, starting at `header_offset`.
fn parse_old_gnu_sparse<S: Read + Seek>(
    stream:        &mut S,
    header_offset: u64,
) -> Result<SparseMap> {
    let mut header = [0u8; 512];
    stream.seek(SeekFrom::Start(header_offset))?;
    stream.read_exact(&mut header)?;

    let real_size = parse_octal(&header[483..495]).ok_or(ArcError::Format {
        offset: header_offset,
        message: "bad GNU sparse realsize field".into(),
    })?;

    let mut extents = Vec::new();
    // Four (offset, numbytes) pairs at 386, 12 octal bytes each.
    for i in 0..4 {
        let base = 386 + i * 24;
        match (parse_octal(&header[base..base + 12]), parse_octal(&header[base + 12..base + 24])) {
            (Some(logical), Some(len)) if len > 0 || logical > 0 => {
                extents.push(SparseExtent { logical, len });
            }
            _ => break,
        }
    }

    let mut is_extended = header[482] != 0;
    let mut block_offset = header_offset + BLOCK;
    while is_extended {
        let mut ext = [0u8; 512];
        stream.seek(SeekFrom::Start(block_offset))?;
        stream.read_exact(&mut ext)?;
        for i in 0..21 {
            let base = i * 24;
            match (parse_octal(&ext[base..base + 12]), parse_octal(&ext[base + 12..base + 24])) {
                (Some(logical), Some(len)) if len > 0 || logical > 0 => {
                    extents.push(SparseExtent { logical, len });
                }
                _ => break,
            }
        }
        is_extended = ext[504] != 0;
        block_offset += BLOCK;
    }

    // The payload follows the last extension block; the caller's
    // raw_file_position already points there, so no skip is needed —
    // except that extents were counted relative to it.
    Ok(SparseMap { real_size, extents, data_skip: 0 })
}

/// Parse pax sparse encodings out of the extension map.
fn parse_pax_sparse<S: Read + Seek>(
    stream:      &mut S,
    pax:         &HashMap<String, String>,
    data_offset: u64,
) -> Result<Option<SparseMap>> {
    let major = pax.get("GNU.sparse.major").and_then(|v| v.parse::<u32>().ok());
    let minor = pax.get("GNU.sparse.minor").and_then(|v| v.parse::<u32>().ok());

    // pax 1.0: decimal map at the start of the payload.
    if major == Some(1) && minor == Some(0) {
        let real_size = pax
            .get("GNU.sparse.realsize")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(ArcError::Format {
                offset: data_offset,
                message: "pax-1.0 sparse entry without GNU.sparse.realsize".into(),
            })?;

        stream.seek(SeekFrom::Start(data_offset))?;
        let mut numbers: Vec<u64> = Vec::new();
        let mut blocks_read = 0u64;
        let mut block = [0u8; 512];
        let mut text = Vec::new();
        // The map is newline-terminated decimal numbers padded to a block
        // boundary.  The first number is the extent count; read blocks
        // until count*2 + 1 numbers are in.
        loop {
            stream.read_exact(&mut block)?;
            blocks_read += 1;
            text.extend_from_slice(&block);
            numbers.clear();
            for token in text.split(|&b| b == b'\n') {
                let token = std::str::from_utf8(token).unwrap_or("").trim_matches('\0');
                if token.is_empty() {
                    continue;
                }
                match token.parse::<u64>() {
                    Ok(v) => numbers.push(v),
                    Err(_) => break, // reached padding / partial number
                }
            }
            if !numbers.is_empty() && numbers.len() as u64 >= 1 + numbers[0] * 2 {
                break;
            }
            if blocks_read > 1024 {
                return Err(ArcError::Format {
                    offset: data_offset,
                    message: "unterminated pax-1.0 sparse map".into(),
                });
            }
        }

        let count = numbers[0] as usize;
        let mut extents = Vec::with_capacity(count);
        for pair in numbers[1..1 + count * 2].chunks(2) {
            if pair[1] > 0 {
                extents.push(SparseExtent { logical: pair[0], len: pair[1] });
            }
        }
        return Ok(Some(SparseMap { real_size, extents, data_skip: blocks_read * BLOCK }));
    }

    // pax 0.1: comma-separated map attribute.
    if let Some(map) = pax.get("GNU.sparse.map") {
        let real_size = pax
            .get("GNU.sparse.size")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let values: Vec<u64> = map
            .split(',')
            .filter_map(|v| v.parse::<u64>().ok())
            .collect();
        let mut extents = Vec::new();
        for pair in values.chunks(2) {
            if pair.len() == 2 && pair[1] > 0 {
                extents.push(SparseExtent { logical: pair[0], len: pair[1] });
            }
        }
        return Ok(Some(SparseMap { real_size, extents, data_skip: 0 }));
    }

    // pax 0.0: numbered offset/numbytes attribute pairs.
    if let Some(count) = pax.get("GNU.sparse.numblocks").and_then(|v| v.parse::<usize>().ok()) {
        let real_size = pax
            .get("GNU.sparse.size")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        // The 0.0 format repeats the offset/numbytes keys; pax parsing
        // keeps the last occurrence, so only single-extent files survive.
        // GNU tar switched to 0.1 for exactly this reason.
        let mut extents = Vec::new();
        if count >= 1 {
            if let (Some(offset), Some(len)) = (
                pax.get("GNU.sparse.offset").and_then(|v| v.parse::<u64>().ok()),
                pax.get("GNU.sparse.numbytes").and_then(|v| v.parse::<u64>().ok()),
            ) {
                if len > 0 {
                    extents.push(SparseExtent { logical: offset, len });
                }
            }
        }
        return Ok(Some(SparseMap { real_size, extents, data_skip: 0 }));
    }

    Ok(None)
}

// ── GNU incremental detection ─────────────────────────────────────────────────

/// True when a path starts with a timestamp directory such as
/// `1598909922.5196395/` — the layout GNU incremental archives produce.
fn has_incremental_prefix(path: &str) -> bool {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
    let mut parts = first.splitn(2, '.');
    let seconds = parts.next().unwrap_or("");
    let fraction = parts.next();
    seconds.len() >= 9
        && seconds.bytes().all(|b| b.is_ascii_digit())
        && fraction.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

fn strip_incremental_prefix(path: &str) -> String {
    let rest = path
        .trim_start_matches('/')
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or("");
    format!("/{rest}")
}

// ── Index building ────────────────────────────────────────────────────────────

struct PendingEntry {
    entry:  crate::index::IndexedEntry,
    xattrs: Vec<(String, Vec<u8>)>,
}

/// Walk the TAR stream and populate the index.
fn build_index(
    stream:      SharedSource,
    stream_size: u64,
    location:    &IndexLocation,
    options:     &TarOptions,
    fingerprint: &Fingerprint,
    seek_table:  Option<&SeekTable>,
) -> Result<(ArchiveIndex, IndexConfig)> {
    let view = StenciledFile::new(vec![Stencil::new(Arc::clone(&stream), 0, stream_size)]);
    let mut archive = tar::Archive::new(view);
    archive.set_ignore_zeros(options.ignore_zeros);

    let mut builder = IndexBuilder::create(location.path().filter(|_| location.writable()))?;

    // Buffer the first entries so the GNU-incremental decision applies to
    // them retroactively; afterwards rows stream straight through.
    let mut buffered: Vec<PendingEntry> = Vec::new();
    let mut decided: Option<bool> = options.gnu_incremental;
    let mut prefixed = 0usize;
    let mut scanned = 0usize;
    let mut known_dirs: HashSet<String> = HashSet::new();

    {
        let entries = archive.entries().map_err(|e| ArcError::Format {
            offset: 0,
            message: format!("cannot read TAR entries: {e}"),
        })?;
        for entry in entries {
            let mut entry = entry.map_err(|e| ArcError::Format {
                offset: 0,
                message: format!("malformed TAR header: {e}"),
            })?;
            let pending = convert_entry(&mut entry, Arc::clone(&stream))?;

            scanned += 1;
            if has_incremental_prefix(&pending.entry.full_path()) {
                prefixed += 1;
            }

            match decided {
                None if scanned < INCREMENTAL_SCAN_ENTRIES => buffered.push(pending),
                None => {
                    // Decision point: a clear majority of prefixed names.
                    let is_incremental = prefixed * 4 >= scanned * 3;
                    decided = Some(is_incremental);
                    buffered.push(pending);
                    for pending in buffered.drain(..) {
                        insert_entry(&mut builder, pending, is_incremental, &mut known_dirs)?;
                    }
                }
                Some(is_incremental) => {
                    insert_entry(&mut builder, pending, is_incremental, &mut known_dirs)?;
                }
            }
        }
    }

    let is_incremental = match decided {
        Some(v) => v,
        None => {
            // Short archive: decide on what was seen.
            let v = scanned > 0 && prefixed * 4 >= scanned * 3;
            for pending in buffered.drain(..) {
                insert_entry(&mut builder, pending, v, &mut known_dirs)?;
            }
            v
        }
    };
    // Flush any leftover buffer (decision made exactly at the threshold).
    for pending in buffered {
        insert_entry(&mut builder, pending, is_incremental, &mut known_dirs)?;
    }

    if let Some(table) = seek_table {
        builder.set_seek_table(table)?;
    }

    let config = options.to_index_config(is_incremental);
    if !location.writable() && builder.entry_count() >= crate::index::location::IN_MEMORY_WARN_ENTRIES {
        log::warn!(
            "index with {} entries is kept in memory only (no writable index folder); \
             the next mount will walk the archive again",
            builder.entry_count()
        );
    }
    let index = builder.finalize(&config, fingerprint)?;
    Ok((index, config))
}

fn convert_entry<R: Read>(
    entry:  &mut tar::Entry<'_, R>,
    stream: SharedSource,
) -> Result<PendingEntry> {
    let header_offset = entry.raw_header_position();
    let data_offset = entry.raw_file_position();

    let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    let full_path = crate::mountsource::normalize_path(&raw_path);
    let (parent, name) = split_path(&full_path);

    let header = entry.header();
    let entry_type = header.entry_type();
    let mut size = entry.size();
    let mut mtime = header.mtime().unwrap_or(0) as f64;
    let mode_bits = header.mode().unwrap_or(0o644);
    let uid = header.uid().unwrap_or(0) as u32;
    let gid = header.gid().unwrap_or(0) as u32;
    let linkname = entry
        .link_name_bytes()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();

    // Pax records refine mtime and carry xattrs.
    let mut pax: HashMap<String, String> = HashMap::new();
    let mut xattrs: Vec<(String, Vec<u8>)> = Vec::new();
    if let Ok(Some(extensions)) = entry.pax_extensions() {
        for extension in extensions.flatten() {
            let key = String::from_utf8_lossy(extension.key_bytes()).into_owned();
            if let Some(stripped) = key.strip_prefix("SCHILY.xattr.") {
                xattrs.push((stripped.to_string(), extension.value_bytes().to_vec()));
            } else {
                pax.insert(key, String::from_utf8_lossy(extension.value_bytes()).into_owned());
            }
        }
    }
    if let Some(pax_mtime) = pax.get("mtime").and_then(|v| v.parse::<f64>().ok()) {
        mtime = pax_mtime;
    }

    use tar::EntryType;
    let (kind, type_bits) = match entry_type {
        EntryType::Directory                     => (FileKind::Directory, 0o040000),
        EntryType::Symlink                       => (FileKind::Symlink, 0o120000),
        EntryType::Link                          => (FileKind::Hardlink, 0o100000),
        EntryType::Char                          => (FileKind::CharDevice, 0o020000),
        EntryType::Block                         => (FileKind::BlockDevice, 0o060000),
        EntryType::Fifo                          => (FileKind::Fifo, 0o010000),
        _                                        => (FileKind::Regular, 0o100000),
    };

    // Sparse entries: the real size comes from the sparse map, and the
    // map itself is persisted under a reserved xattr key so `open` never
    // re-parses pax records (they are unreachable from a bare header
    // offset once the walk has moved on).
    let mut is_sparse = false;
    if entry_type == EntryType::GNUSparse || pax.keys().any(|k| k.starts_with("GNU.sparse.")) {
        is_sparse = true;
        let mut view = lock_view(&stream);
        let map = if entry_type == EntryType::GNUSparse {
            parse_old_gnu_sparse(&mut view, header_offset)?
        } else {
            parse_pax_sparse(&mut view, &pax, data_offset)?.ok_or(ArcError::Format {
                offset: header_offset,
                message: "sparse pax entry without a sparse map".into(),
            })?
        };
        size = map.real_size;
        xattrs.push((SPARSE_MAP_KEY.to_string(), map.to_bytes()));
    }

    let entry = crate::index::IndexedEntry {
        path: parent,
        name,
        header_offset,
        offset: data_offset,
        size,
        mtime,
        mode: (mode_bits & 0o7777) | type_bits,
        linkname,
        uid,
        gid,
        kind,
        is_sparse,
        recursion_depth: 0,
    };
    Ok(PendingEntry { entry, xattrs })
}

fn insert_entry(
    builder:        &mut IndexBuilder,
    mut pending:    PendingEntry,
    is_incremental: bool,
    known_dirs:     &mut HashSet<String>,
) -> Result<()> {
    if is_incremental {
        let full = pending.entry.full_path();
        if has_incremental_prefix(&full) {
            let stripped = strip_incremental_prefix(&full);
            if stripped == "/" {
                return Ok(()); // the prefix directory itself
            }
            let (parent, name) = split_path(&stripped);
            pending.entry.path = parent;
            pending.entry.name = name;
        }
    }

    // Synthesize parent directories archives commonly omit.
    add_parent_dirs(builder, &pending.entry.path, known_dirs)?;
    if pending.entry.kind == FileKind::Directory {
        known_dirs.insert(pending.entry.full_path());
    }

    for (key, value) in &pending.xattrs {
        builder.add_xattr(&pending.entry.path, &pending.entry.name, key, value)?;
    }
    builder.add_entry(&pending.entry)
}

fn add_parent_dirs(
    builder:    &mut IndexBuilder,
    dir:        &str,
    known_dirs: &mut HashSet<String>,
) -> Result<()> {
    let mut accumulated = String::new();
    for part in dir.trim_matches('/').split('/') {
        if part.is_empty() {
            continue;
        }
        let parent = if accumulated.is_empty() { "/".to_string() } else { accumulated.clone() };
        accumulated = join_paths(&parent, part);
        if known_dirs.insert(accumulated.clone()) {
            builder.add_entry(&crate::index::IndexedEntry {
                path:            parent,
                name:            part.to_string(),
                header_offset:   0,
                offset:          0,
                size:            0,
                mtime:           0.0,
                mode:            0o040755,
                linkname:        String::new(),
                uid:             0,
                gid:             0,
                kind:            FileKind::Directory,
                is_sparse:       false,
                recursion_depth: 0,
            })?;
        }
    }
    Ok(())
}

fn lock_view(stream: &SharedSource) -> StenciledFile {
    // A full-length stencil over the shared stream; cheap to construct.
    let size = {
        let mut guard = stream.lock().expect("stream lock");
        guard.seek(SeekFrom::End(0)).unwrap_or(u64::MAX)
    };
    StenciledFile::new(vec![Stencil::new(Arc::clone(stream), 0, size)])
}

// ── TarMountSource ────────────────────────────────────────────────────────────

pub struct TarMountSource {
    stream:      SharedSource,
    stream_size: u64,
    index:       ArchiveIndex,
    config:      IndexConfig,
}

impl TarMountSource {
    /// Build (or rebuild) the index by walking the stream.
    pub fn build(
        stream:      SharedSource,
        stream_size: u64,
        location:    IndexLocation,
        options:     &TarOptions,
        fingerprint: &Fingerprint,
        seek_table:  Option<&SeekTable>,
    ) -> Result<Self> {
        let (index, config) =
            build_index(Arc::clone(&stream), stream_size, &location, options, fingerprint, seek_table)?;
        log::info!("created TAR index with {} entries", index.entry_count()?);
        Ok(Self { stream, stream_size, index, config })
    }

    /// Reuse a validated index without walking the archive.
    pub fn from_index(stream: SharedSource, stream_size: u64, index: ArchiveIndex) -> Result<Self> {
        let config: IndexConfig = index
            .metadata("config")?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        Ok(Self { stream, stream_size, index, config })
    }

    #[inline]
    pub fn index(&self) -> &ArchiveIndex { &self.index }

    #[inline]
    pub fn config(&self) -> &IndexConfig { &self.config }

    fn info_from_entry(&self, entry: &crate::index::IndexedEntry) -> FileInfo {
        FileInfo {
            size:     entry.size,
            mtime:    entry.mtime,
            mode:     entry.mode,
            linkname: entry.linkname.clone(),
            uid:      entry.uid,
            gid:      entry.gid,
            userdata: vec![Userdata::Entry(EntryLocator {
                path:            entry.full_path(),
                header_offset:   entry.header_offset,
                offset:          entry.offset,
                size:            entry.size,
                kind:            entry.kind,
                is_sparse:       entry.is_sparse,
                is_archive:      crate::formats::detect::strip_archive_suffix(&entry.name).is_some(),
                recursion_depth: entry.recursion_depth,
            })],
        }
    }

    fn sparse_stencils(&self, locator: &EntryLocator) -> Result<Vec<Stencil>> {
        let map = self
            .index
            .get_xattr(&locator.path, SPARSE_MAP_KEY)?
            .and_then(|bytes| SparseMap::from_bytes(&bytes))
            .ok_or(ArcError::Format {
                offset: locator.header_offset,
                message: "sparse entry without a persisted sparse map".into(),
            })?;

        // Interleave archive extents with zero-filled holes.
        let zeros = zero_source();
        let mut stencils = Vec::new();
        let mut logical_pos = 0u64;
        let mut archive_pos = locator.offset + map.data_skip;
        for extent in &map.extents {
            if extent.logical > logical_pos {
                stencils.push(Stencil::new(Arc::clone(&zeros), 0, extent.logical - logical_pos));
            }
            stencils.push(Stencil::new(Arc::clone(&self.stream), archive_pos, extent.len));
            archive_pos += extent.len;
            logical_pos = extent.logical + extent.len;
        }
        if map.real_size > logical_pos {
            stencils.push(Stencil::new(zeros, 0, map.real_size - logical_pos));
        }
        Ok(stencils)
    }
}

impl MountSource for TarMountSource {
    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        Ok(self.index.lookup(path, version)?.map(|e| self.info_from_entry(&e)))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        self.index.versions(path)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        Ok(self.index.list(path)?.map(|entries| {
            entries
                .into_iter()
                .map(|e| (e.name.clone(), self.info_from_entry(&e)))
                .collect()
        }))
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        Ok(self
            .index
            .list_mode(path)?
            .map(|rows| rows.into_iter().collect()))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, _) = info.pop_userdata()?;
        let Userdata::Entry(locator) = token else {
            return Err(ArcError::Usage("not a TAR entry".into()));
        };
        let stencils = if locator.is_sparse {
            self.sparse_stencils(&locator)?
        } else {
            vec![Stencil::new(Arc::clone(&self.stream), locator.offset, locator.size)]
        };
        Ok(Box::new(StenciledFile::new(stencils)))
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        let (token, _) = info.pop_userdata()?;
        let Userdata::Entry(locator) = token else { return Ok(Vec::new()) };
        let mut keys = self.index.list_xattr(&locator.path)?;
        keys.retain(|key| key != SPARSE_MAP_KEY);
        Ok(keys)
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        if key == SPARSE_MAP_KEY {
            return Ok(None);
        }
        let (token, _) = info.pop_userdata()?;
        let Userdata::Entry(locator) = token else { return Ok(None) };
        self.index.get_xattr(&locator.path, key)
    }

    fn statfs(&mut self) -> StatFs {
        StatFs {
            files: self.index.entry_count().unwrap_or(0),
            blocks: self.stream_size / (256 * 1024) + 1,
            ..StatFs::default()
        }
    }

    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stencil::shared_buffer;
    use std::io::Cursor;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_600_000_000);
            header.set_cksum();
            builder.append(&header, Cursor::new(data)).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn mount(tar_bytes: Vec<u8>) -> TarMountSource {
        let size = tar_bytes.len() as u64;
        let fingerprint = Fingerprint {
            size,
            mtime: None,
            head_hash: "test".into(),
        };
        TarMountSource::build(
            shared_buffer(tar_bytes),
            size,
            IndexLocation::Memory,
            &TarOptions::default(),
            &fingerprint,
            None,
        )
        .unwrap()
    }

    #[test]
    fn single_file_tar() {
        let mut source = mount(build_tar(&[("bar", b"foo\n")]));
        let listing = source.list("/").unwrap().unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["bar"]);

        let info = source.lookup("/bar", 0).unwrap().unwrap();
        assert_eq!(info.size, 4);
        assert_eq!(source.read(&info, 4, 0).unwrap(), b"foo\n");
        assert!(source.list_xattr(&info).unwrap().is_empty());
        assert!(source.lookup("/baz", 0).unwrap().is_none());
    }

    #[test]
    fn nested_dirs_are_synthesized() {
        let mut source = mount(build_tar(&[("a/b/c.txt", b"deep")]));
        assert!(source.is_directory("/a").unwrap());
        assert!(source.is_directory("/a/b").unwrap());
        let info = source.lookup("/a/b/c.txt", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 4, 0).unwrap(), b"deep");
        let listing = source.list("/a").unwrap().unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn overwritten_member_versions() {
        let mut source = mount(build_tar(&[("f", b"old!"), ("f", b"new!")]));
        assert_eq!(source.versions("/f").unwrap(), 2);

        let newest = source.lookup("/f", 0).unwrap().unwrap();
        assert_eq!(source.read(&newest, 4, 0).unwrap(), b"new!");
        let oldest = source.lookup("/f", 1).unwrap().unwrap();
        assert_eq!(source.read(&oldest, 4, 0).unwrap(), b"old!");
    }

    #[test]
    fn offsets_allow_direct_reads() {
        let payload = vec![0xabu8; 2000];
        let mut source = mount(build_tar(&[("big", &payload)]));
        let info = source.lookup("/big", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 10, 1990).unwrap(), vec![0xab; 10]);
        // Past-end reads are short.
        assert_eq!(source.read(&info, 10, 1995).unwrap().len(), 5);
    }

    #[test]
    fn incremental_prefix_detection() {
        assert!(has_incremental_prefix("/1598909922.5196395/foo"));
        assert!(has_incremental_prefix("/1598909922/foo"));
        assert!(!has_incremental_prefix("/2020/photos"));
        assert!(!has_incremental_prefix("/foo/bar"));
        assert_eq!(strip_incremental_prefix("/1598909922/foo/bar"), "/foo/bar");
    }

    #[test]
    fn incremental_names_are_stripped() {
        let mut source = mount(build_tar(&[
            ("1598909922.519/readme", b"body"),
            ("1598909922.519/sub/file", b"data"),
        ]));
        assert!(source.lookup("/readme", 0).unwrap().is_some());
        assert!(source.lookup("/sub/file", 0).unwrap().is_some());
        assert!(source.lookup("/1598909922.519/readme", 0).unwrap().is_none());
    }

    #[test]
    fn old_gnu_sparse_parsing() {
        // Hand-rolled old-GNU sparse header: two extents of 512 bytes at
        // logical offsets 0 and 4096; real size 8192.
        let mut header = vec![0u8; 512];
        header[..11].copy_from_slice(b"sparse.file");
        header[156] = b'S';
        let mut write_octal = |buf: &mut [u8], value: u64| {
            let text = format!("{value:0>11o} ");
            buf[..12].copy_from_slice(text.as_bytes());
        };
        write_octal(&mut header[386..398], 0);      // extent 0 offset
        write_octal(&mut header[398..410], 512);    // extent 0 len
        write_octal(&mut header[410..422], 4096);   // extent 1 offset
        write_octal(&mut header[422..434], 512);    // extent 1 len
        write_octal(&mut header[483..495], 8192);   // realsize

        let mut cursor = Cursor::new(header);
        let map = parse_old_gnu_sparse(&mut cursor, 0).unwrap();
        assert_eq!(map.real_size, 8192);
        assert_eq!(map.extents.len(), 2);
        assert_eq!(map.extents[1], SparseExtent { logical: 4096, len: 512 });
    }

    #[test]
    fn persisted_index_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("t.tar.index.sqlite");
        let tar_bytes = build_tar(&[("bar", b"foo\n")]);
        let size = tar_bytes.len() as u64;
        let fingerprint = Fingerprint { size, mtime: None, head_hash: "x".into() };

        {
            let source = TarMountSource::build(
                shared_buffer(tar_bytes.clone()),
                size,
                IndexLocation::File(index_path.clone()),
                &TarOptions::default(),
                &fingerprint,
                None,
            )
            .unwrap();
            assert_eq!(source.index().entry_count().unwrap(), 1);
        }

        let index = ArchiveIndex::open(&index_path).unwrap();
        assert!(index.validate(&fingerprint, &IndexConfig::default(), false));
        let mut source =
            TarMountSource::from_index(shared_buffer(tar_bytes), size, index).unwrap();
        let info = source.lookup("/bar", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 4, 0).unwrap(), b"foo\n");
    }
}

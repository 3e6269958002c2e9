//! The persistent archive index — a SQLite file describing every archive
//! entry, its location in the (decompressed) stream, and any per-codec
//! seek tables.
//!
//! # Schema (version 1)
//!
//! ```text
//! metadata(key TEXT PRIMARY KEY, value TEXT)
//! files(path, name, offsetheader, offset, size, mtime REAL, mode,
//!       linkname, uid, gid, type, issparse, recursiondepth,
//!       PRIMARY KEY(path, name, offset))
//! filestmp(...)              -- staging table, dropped after creation
//! xattr(path, name, key, value BLOB, PRIMARY KEY(path, name, key))
//! gzipindex / bz2index / xzindex / zstdindex(chunk INTEGER PRIMARY KEY,
//!                                            data BLOB)
//! ```
//!
//! `(path, name)` is deliberately NOT unique: archives can contain the same
//! member several times (overwritten TAR entries).  `offset` — the payload
//! offset, strictly increasing within one archive — is the version
//! tie-breaker.
//!
//! # Creation protocol
//! Rows are first inserted unordered into `filestmp` with bulk pragmas and
//! batched commits, then moved once with
//! `INSERT INTO files SELECT * FROM filestmp ORDER BY path, name` so the
//! B-tree ordering cost is paid a single time (about 2× faster than
//! ordered incremental insertion at a million rows).  The whole file is
//! written at `<index>.tmp` and renamed into place after fsync, so a
//! half-written index is never visible under the final name.
//!
//! # Validation
//! An index is reused iff schema version, source fingerprint, and reader
//! configuration all match.  The mtime check is opt-in (`--verify-mtime`)
//! because copies legitimately change mtimes without changing content.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{ArcError, Result};
use crate::seekindex::{Codec, SeekTable};

pub mod location;

pub use location::IndexLocation;

/// Bumped whenever the schema or the seek-table blob layout changes shape.
pub const SCHEMA_VERSION: &str = "1";

/// Rows per staging-table transaction during creation.
const INSERT_BATCH: usize = 1000;

/// Bytes of the archive head that go into the fingerprint hash.
const HEAD_HASH_LEN: usize = 4096;

// ── File kinds ────────────────────────────────────────────────────────────────

/// Entry type, stored in the `type` column (the mode bits carry it too;
/// the column spares a bit-twiddling round trip on hot queries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum FileKind {
    Regular     = 0,
    Directory   = 1,
    Symlink     = 2,
    Hardlink    = 3,
    CharDevice  = 4,
    BlockDevice = 5,
    Fifo        = 6,
    Socket      = 7,
}

impl FileKind {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => FileKind::Directory,
            2 => FileKind::Symlink,
            3 => FileKind::Hardlink,
            4 => FileKind::CharDevice,
            5 => FileKind::BlockDevice,
            6 => FileKind::Fifo,
            7 => FileKind::Socket,
            _ => FileKind::Regular,
        }
    }
}

// ── Row type ──────────────────────────────────────────────────────────────────

/// One archive entry as stored in `files`.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    /// Parent directory, absolute, no trailing slash (root is "/").
    pub path:            String,
    pub name:            String,
    /// Block-aligned header offset (equals `offset` for formats without
    /// separate headers).
    pub header_offset:   u64,
    /// Offset of the payload in the decompressed stream; the version
    /// tie-breaker.
    pub offset:          u64,
    pub size:            u64,
    pub mtime:           f64,
    pub mode:            u32,
    pub linkname:        String,
    pub uid:             u32,
    pub gid:             u32,
    pub kind:            FileKind,
    pub is_sparse:       bool,
    pub recursion_depth: u32,
}

impl IndexedEntry {
    /// Full absolute path of this entry.
    pub fn full_path(&self) -> String {
        if self.path == "/" {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.path, self.name)
        }
    }
}

/// Split an absolute path into the (parent, name) pair used as row key.
pub fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return ("/".into(), String::new());
    }
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/".into(), name.into()),
        Some((parent, name)) => (parent.into(), name.into()),
        None => ("/".into(), trimmed.into()),
    }
}

// ── Fingerprint & configuration ───────────────────────────────────────────────

/// Identifies the archive an index was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size:      u64,
    /// Seconds since epoch; None for sources without one (pipes, buffers).
    pub mtime:     Option<f64>,
    /// Hex BLAKE3 of the first 4 KiB.
    pub head_hash: String,
}

impl Fingerprint {
    pub fn of_stream<R: Read + Seek>(reader: &mut R, mtime: Option<f64>) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let mut head = vec![0u8; HEAD_HASH_LEN.min(size as usize)];
        reader.read_exact(&mut head)?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self {
            size,
            mtime,
            head_hash: hex::encode(blake3::hash(&head).as_bytes()),
        })
    }

    /// Matches unless size or head hash differ; mtime only when asked.
    pub fn matches(&self, other: &Fingerprint, verify_mtime: bool) -> bool {
        if self.size != other.size || self.head_hash != other.head_hash {
            return false;
        }
        if verify_mtime {
            let close = match (self.mtime, other.mtime) {
                (Some(a), Some(b)) => (a - b).abs() < 1e-6,
                (None, None) => true,
                _ => false,
            };
            if !close {
                return false;
            }
        }
        true
    }
}

/// Archive-reader settings that change what rows the index contains.  A
/// persisted index is only reused when these match exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub recursive:       bool,
    pub ignore_zeros:    bool,
    /// The GNU-incremental decision actually applied (auto-detection is
    /// resolved before this is stored, so reuse is reproducible).
    pub gnu_incremental: bool,
    pub encoding:        String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            recursive:       false,
            ignore_zeros:    false,
            gnu_incremental: false,
            encoding:        "utf-8".into(),
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Accumulates rows during an archive walk, then atomically produces the
/// final index.
pub struct IndexBuilder {
    conn:       Connection,
    tmp_path:   Option<PathBuf>,
    final_path: Option<PathBuf>,
    pending:    usize,
    entries:    u64,
}

impl IndexBuilder {
    /// Start building.  `path = None` builds in memory (used when no index
    /// folder is writable).
    pub fn create(path: Option<&Path>) -> Result<Self> {
        let (conn, tmp_path, final_path) = match path {
            Some(final_path) => {
                let tmp = final_path.with_extension("sqlite.tmp");
                if tmp.exists() {
                    fs::remove_file(&tmp)?;
                }
                (Connection::open(&tmp)?, Some(tmp), Some(final_path.to_path_buf()))
            }
            None => (Connection::open_in_memory()?, None, None),
        };

        // Bulk-insert pragmas; crash safety comes from the tmp+rename
        // protocol, not from SQLite's journal.
        conn.execute_batch(
            "PRAGMA locking_mode = EXCLUSIVE;
             PRAGMA temp_store = MEMORY;
             PRAGMA journal_mode = OFF;
             PRAGMA synchronous = OFF;
             PRAGMA cache_size = -262144;",
        )?;

        conn.execute_batch(
            "CREATE TABLE metadata(key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE filestmp(
                 path           TEXT,
                 name           TEXT,
                 offsetheader   INTEGER,
                 offset         INTEGER,
                 size           INTEGER,
                 mtime          REAL,
                 mode           INTEGER,
                 linkname       TEXT,
                 uid            INTEGER,
                 gid            INTEGER,
                 type           INTEGER,
                 issparse       INTEGER,
                 recursiondepth INTEGER
             );
             CREATE TABLE xattr(
                 path  TEXT,
                 name  TEXT,
                 key   TEXT,
                 value BLOB,
                 PRIMARY KEY(path, name, key)
             );
             BEGIN;",
        )?;

        Ok(Self { conn, tmp_path, final_path, pending: 0, entries: 0 })
    }

    pub fn add_entry(&mut self, entry: &IndexedEntry) -> Result<()> {
        {
            let mut stmt = self.conn.prepare_cached(
                "INSERT INTO filestmp VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            )?;
            stmt.execute(params![
                entry.path,
                entry.name,
                entry.header_offset as i64,
                entry.offset as i64,
                entry.size as i64,
                entry.mtime,
                entry.mode as i64,
                entry.linkname,
                entry.uid as i64,
                entry.gid as i64,
                entry.kind as i64,
                entry.is_sparse as i64,
                entry.recursion_depth as i64,
            ])?;
        }
        self.entries += 1;
        self.pending += 1;
        if self.pending >= INSERT_BATCH {
            self.conn.execute_batch("COMMIT; BEGIN;")?;
            self.pending = 0;
        }
        Ok(())
    }

    pub fn add_xattr(&mut self, path: &str, name: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR REPLACE INTO xattr VALUES (?1,?2,?3,?4)",
        )?;
        stmt.execute(params![path, name, key, value])?;
        Ok(())
    }

    pub fn set_seek_table(&mut self, table: &SeekTable) -> Result<()> {
        let sql_table = table.codec.index_table();
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {sql_table}(chunk INTEGER PRIMARY KEY, data BLOB);"
        ))?;
        for (chunk, blob) in table.to_blobs().into_iter().enumerate() {
            self.conn.execute(
                &format!("INSERT OR REPLACE INTO {sql_table} VALUES (?1, ?2)"),
                params![chunk as i64, blob],
            )?;
        }
        Ok(())
    }

    #[inline]
    pub fn entry_count(&self) -> u64 { self.entries }

    /// Pay the B-tree ordering once, write metadata, fsync, rename.
    pub fn finalize(self, config: &IndexConfig, fingerprint: &Fingerprint) -> Result<ArchiveIndex> {
        self.conn.execute_batch(
            "COMMIT;
             CREATE TABLE files(
                 path           TEXT,
                 name           TEXT,
                 offsetheader   INTEGER,
                 offset         INTEGER,
                 size           INTEGER,
                 mtime          REAL,
                 mode           INTEGER,
                 linkname       TEXT,
                 uid            INTEGER,
                 gid            INTEGER,
                 type           INTEGER,
                 issparse       INTEGER,
                 recursiondepth INTEGER,
                 PRIMARY KEY(path, name, offset)
             );
             INSERT INTO files SELECT * FROM filestmp ORDER BY path, name;
             DROP TABLE filestmp;",
        )?;

        let now = chrono::Utc::now().to_rfc3339();
        for (key, value) in [
            ("schema-version", SCHEMA_VERSION.to_string()),
            ("fingerprint", serde_json::to_string(fingerprint).expect("fingerprint serializes")),
            ("config", serde_json::to_string(config).expect("config serializes")),
            ("created", now),
        ] {
            self.conn.execute(
                "INSERT OR REPLACE INTO metadata VALUES (?1, ?2)",
                params![key, value],
            )?;
        }

        match (self.tmp_path, self.final_path) {
            (Some(tmp), Some(final_path)) => {
                self.conn.close().map_err(|(_, e)| ArcError::Sql(e))?;
                let file = fs::File::open(&tmp)?;
                file.sync_all()?;
                drop(file);
                fs::rename(&tmp, &final_path)?;
                ArchiveIndex::open(&final_path)
            }
            _ => Ok(ArchiveIndex { conn: self.conn, path: None }),
        }
    }

    /// Abandon the build, removing the temp file.
    pub fn discard(self) {
        let tmp = self.tmp_path.clone();
        drop(self.conn);
        if let Some(tmp) = tmp {
            let _ = fs::remove_file(tmp);
        }
    }
}

// ── ArchiveIndex ──────────────────────────────────────────────────────────────

pub struct ArchiveIndex {
    conn: Connection,
    path: Option<PathBuf>,
}

impl ArchiveIndex {
    /// Open an existing index read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn, path: Some(path.to_path_buf()) })
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }

    pub fn metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT value FROM metadata WHERE key = ?1",
        )?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    /// The §4.3.3 validation protocol.  Returns false (never an error) for
    /// any mismatch so callers rebuild silently.
    pub fn validate(
        &self,
        fingerprint:  &Fingerprint,
        config:       &IndexConfig,
        verify_mtime: bool,
    ) -> bool {
        let schema = self.metadata("schema-version").ok().flatten();
        if schema.as_deref() != Some(SCHEMA_VERSION) {
            log::info!("index schema version mismatch ({schema:?}); rebuilding");
            return false;
        }
        let stored: Option<Fingerprint> = self
            .metadata("fingerprint")
            .ok()
            .flatten()
            .and_then(|json| serde_json::from_str(&json).ok());
        match stored {
            Some(stored) if stored.matches(fingerprint, verify_mtime) => {}
            _ => {
                log::info!("index fingerprint mismatch; rebuilding");
                return false;
            }
        }
        let stored_config: Option<IndexConfig> = self
            .metadata("config")
            .ok()
            .flatten()
            .and_then(|json| serde_json::from_str(&json).ok());
        match stored_config {
            Some(stored) if stored == *config => true,
            _ => {
                log::info!("index reader configuration mismatch; rebuilding");
                false
            }
        }
    }

    // ── Hot queries ──────────────────────────────────────────────────────────

    /// Version-aware lookup.  `version == 0` is the newest; `version >= 1`
    /// counts from the oldest; negative versions count back from the
    /// newest (`-1` = second newest), which the union layer's shifting
    /// arithmetic relies on.
    pub fn lookup(&self, path: &str, version: i64) -> Result<Option<IndexedEntry>> {
        let (parent, name) = split_path(path);
        if name.is_empty() {
            return Ok(self.synthetic_root());
        }

        let (order_desc, skip) = if version <= 0 {
            (true, -version)
        } else {
            (false, version - 1)
        };
        let sql = if order_desc {
            "SELECT path, name, offsetheader, offset, size, mtime, mode, linkname,
                    uid, gid, type, issparse, recursiondepth
             FROM files WHERE path = ?1 AND name = ?2
             ORDER BY offset DESC LIMIT 1 OFFSET ?3"
        } else {
            "SELECT path, name, offsetheader, offset, size, mtime, mode, linkname,
                    uid, gid, type, issparse, recursiondepth
             FROM files WHERE path = ?1 AND name = ?2
             ORDER BY offset ASC LIMIT 1 OFFSET ?3"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt
            .query_row(params![parent, name, skip], row_to_entry)
            .optional()?)
    }

    fn synthetic_root(&self) -> Option<IndexedEntry> {
        Some(IndexedEntry {
            path:            "/".into(),
            name:            String::new(),
            header_offset:   0,
            offset:          0,
            size:            0,
            mtime:           0.0,
            mode:            0o555 | 0o040000,
            linkname:        String::new(),
            uid:             0,
            gid:             0,
            kind:            FileKind::Directory,
            is_sparse:       false,
            recursion_depth: 0,
        })
    }

    pub fn versions(&self, path: &str) -> Result<u32> {
        let (parent, name) = split_path(path);
        if name.is_empty() {
            return Ok(1);
        }
        let mut stmt = self.conn.prepare_cached(
            "SELECT COUNT(*) FROM files WHERE path = ?1 AND name = ?2",
        )?;
        Ok(stmt.query_row(params![parent, name], |row| row.get::<_, i64>(0))? as u32)
    }

    /// Children of `path` with their full rows, or None if `path` is not a
    /// directory (or does not exist).  Duplicate names collapse to the
    /// newest version, matching `lookup`'s default.
    pub fn list(&self, path: &str) -> Result<Option<Vec<IndexedEntry>>> {
        let dir = normalize_dir(path);
        let mut stmt = self.conn.prepare_cached(
            "SELECT path, name, offsetheader, offset, size, mtime, mode, linkname,
                    uid, gid, type, issparse, recursiondepth
             FROM files WHERE path = ?1 ORDER BY name ASC, offset ASC",
        )?;
        let mut rows: Vec<IndexedEntry> = Vec::new();
        for entry in stmt.query_map(params![dir], row_to_entry)? {
            let entry = entry?;
            if rows.last().map(|prev: &IndexedEntry| prev.name == entry.name) == Some(true) {
                *rows.last_mut().unwrap() = entry; // larger offset wins
            } else {
                rows.push(entry);
            }
        }
        if !rows.is_empty() {
            return Ok(Some(rows));
        }

        // Empty result: distinguish "empty directory" from "not a dir".
        match self.lookup(&dir, 0)? {
            Some(info) if info.kind == FileKind::Directory => Ok(Some(Vec::new())),
            _ => Ok(None),
        }
    }

    /// Cheap variant returning (name, mode) pairs only.
    pub fn list_mode(&self, path: &str) -> Result<Option<Vec<(String, u32)>>> {
        let dir = normalize_dir(path);
        let mut stmt = self.conn.prepare_cached(
            "SELECT name, mode FROM files WHERE path = ?1 ORDER BY name ASC, offset ASC",
        )?;
        let mut rows: Vec<(String, u32)> = Vec::new();
        for row in stmt.query_map(params![dir], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32))
        })? {
            let row = row?;
            if rows.last().map(|(name, _)| name == &row.0) == Some(true) {
                *rows.last_mut().unwrap() = row;
            } else {
                rows.push(row);
            }
        }
        if !rows.is_empty() {
            return Ok(Some(rows));
        }
        match self.lookup(&dir, 0)? {
            Some(info) if info.kind == FileKind::Directory => Ok(Some(Vec::new())),
            _ => Ok(None),
        }
    }

    pub fn list_xattr(&self, path: &str) -> Result<Vec<String>> {
        let (parent, name) = split_path(path);
        let mut stmt = self.conn.prepare_cached(
            "SELECT key FROM xattr WHERE path = ?1 AND name = ?2",
        )?;
        let keys = stmt
            .query_map(params![parent, name], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    pub fn get_xattr(&self, path: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let (parent, name) = split_path(path);
        let mut stmt = self.conn.prepare_cached(
            "SELECT value FROM xattr WHERE path = ?1 AND name = ?2 AND key = ?3",
        )?;
        Ok(stmt
            .query_row(params![parent, name, key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?)
    }

    pub fn entry_count(&self) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached("SELECT COUNT(*) FROM files")?;
        Ok(stmt.query_row([], |row| row.get::<_, i64>(0))? as u64)
    }

    /// Load a codec's persisted seek table.  A corrupt blob is reported as
    /// an error; callers respond by rebuilding the table.
    pub fn seek_table(&self, codec: Codec) -> Result<Option<SeekTable>> {
        let table = codec.index_table();
        let exists: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT data FROM {table} ORDER BY chunk ASC"))?;
        let chunks = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if chunks.is_empty() {
            return Ok(None);
        }
        SeekTable::from_blobs(&chunks).map(Some)
    }
}

fn normalize_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/".into() } else { trimmed.into() }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedEntry> {
    Ok(IndexedEntry {
        path:            row.get(0)?,
        name:            row.get(1)?,
        header_offset:   row.get::<_, i64>(2)? as u64,
        offset:          row.get::<_, i64>(3)? as u64,
        size:            row.get::<_, i64>(4)? as u64,
        mtime:           row.get(5)?,
        mode:            row.get::<_, i64>(6)? as u32,
        linkname:        row.get(7)?,
        uid:             row.get::<_, i64>(8)? as u32,
        gid:             row.get::<_, i64>(9)? as u32,
        kind:            FileKind::from_i64(row.get::<_, i64>(10)?),
        is_sparse:       row.get::<_, i64>(11)? != 0,
        recursion_depth: row.get::<_, i64>(12)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry(path: &str, name: &str, offset: u64, kind: FileKind) -> IndexedEntry {
        IndexedEntry {
            path:            path.into(),
            name:            name.into(),
            header_offset:   offset.saturating_sub(512),
            offset,
            size:            4,
            mtime:           1_600_000_000.5,
            mode:            if kind == FileKind::Directory { 0o040755 } else { 0o100644 },
            linkname:        String::new(),
            uid:             1000,
            gid:             1000,
            kind,
            is_sparse:       false,
            recursion_depth: 0,
        }
    }

    fn build_sample(path: Option<&Path>) -> ArchiveIndex {
        let mut builder = IndexBuilder::create(path).unwrap();
        builder.add_entry(&entry("/", "bar", 512, FileKind::Regular)).unwrap();
        builder.add_entry(&entry("/", "dir", 1024, FileKind::Directory)).unwrap();
        builder.add_entry(&entry("/dir", "nested", 2048, FileKind::Regular)).unwrap();
        // Overwritten member: same (path, name), later offset.
        builder.add_entry(&entry("/", "bar", 4096, FileKind::Regular)).unwrap();
        builder.add_xattr("/", "bar", "user.comment", b"hello").unwrap();
        builder
            .finalize(&IndexConfig::default(), &sample_fingerprint())
            .unwrap()
    }

    fn sample_fingerprint() -> Fingerprint {
        Fingerprint { size: 10240, mtime: Some(1.0), head_hash: "aa".into() }
    }

    #[test]
    fn split_path_cases() {
        assert_eq!(split_path("/foo/bar"), ("/foo".into(), "bar".into()));
        assert_eq!(split_path("/bar"), ("/".into(), "bar".into()));
        assert_eq!(split_path("/"), ("/".into(), String::new()));
        assert_eq!(split_path("/a/b/c/"), ("/a/b".into(), "c".into()));
    }

    #[test]
    fn lookup_versions() {
        let index = build_sample(None);
        assert_eq!(index.versions("/bar").unwrap(), 2);

        // 0 = newest (largest offset).
        let newest = index.lookup("/bar", 0).unwrap().unwrap();
        assert_eq!(newest.offset, 4096);
        // 1 = oldest.
        let oldest = index.lookup("/bar", 1).unwrap().unwrap();
        assert_eq!(oldest.offset, 512);
        // versions(p) = newest again.
        let also_newest = index.lookup("/bar", 2).unwrap().unwrap();
        assert_eq!(also_newest.offset, 4096);
        // -1 = second newest.
        let second = index.lookup("/bar", -1).unwrap().unwrap();
        assert_eq!(second.offset, 512);
        // Out of range.
        assert!(index.lookup("/bar", 3).unwrap().is_none());
        assert!(index.lookup("/missing", 0).unwrap().is_none());
    }

    #[test]
    fn list_semantics() {
        let index = build_sample(None);
        let root = index.list("/").unwrap().unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "dir"]);
        // The duplicate collapsed to the newest version.
        assert_eq!(root[0].offset, 4096);

        let nested = index.list("/dir").unwrap().unwrap();
        assert_eq!(nested.len(), 1);

        // A file is not listable; a missing path neither.
        assert!(index.list("/bar").unwrap().is_none());
        assert!(index.list("/nope").unwrap().is_none());
    }

    #[test]
    fn xattrs() {
        let index = build_sample(None);
        assert_eq!(index.list_xattr("/bar").unwrap(), vec!["user.comment".to_string()]);
        assert_eq!(index.get_xattr("/bar", "user.comment").unwrap().unwrap(), b"hello");
        assert!(index.get_xattr("/bar", "user.none").unwrap().is_none());
        assert!(index.list_xattr("/dir").unwrap().is_empty());
    }

    #[test]
    fn persisted_roundtrip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("sample.index.sqlite");
        {
            let index = build_sample(Some(&index_path));
            assert_eq!(index.entry_count().unwrap(), 4);
        }
        assert!(index_path.exists());
        assert!(!index_path.with_extension("sqlite.tmp").exists());

        let reopened = ArchiveIndex::open(&index_path).unwrap();
        let config = IndexConfig::default();
        assert!(reopened.validate(&sample_fingerprint(), &config, false));
        assert!(reopened.validate(&sample_fingerprint(), &config, true));

        // Size change invalidates.
        let mut other = sample_fingerprint();
        other.size = 1;
        assert!(!reopened.validate(&other, &config, false));

        // mtime change only matters when verification is requested.
        let mut other = sample_fingerprint();
        other.mtime = Some(99.0);
        assert!(reopened.validate(&other, &config, false));
        assert!(!reopened.validate(&other, &config, true));

        // Config change invalidates.
        let mut other_config = config.clone();
        other_config.recursive = true;
        assert!(!reopened.validate(&sample_fingerprint(), &other_config, false));
    }

    #[test]
    fn seek_table_storage() {
        use crate::seekindex::SeekPoint;
        let mut builder = IndexBuilder::create(None).unwrap();
        builder.add_entry(&entry("/", "f", 0, FileKind::Regular)).unwrap();
        let mut table = SeekTable::new(Codec::Gzip);
        table.push(SeekPoint { uncompressed: 0, compressed_bits: 80, window: vec![1, 2] }).unwrap();
        table.decoded_size = 123;
        builder.set_seek_table(&table).unwrap();
        let index = builder
            .finalize(&IndexConfig::default(), &sample_fingerprint())
            .unwrap();

        let loaded = index.seek_table(Codec::Gzip).unwrap().unwrap();
        assert_eq!(loaded.decoded_size, 123);
        assert_eq!(loaded.points.len(), 1);
        assert!(index.seek_table(Codec::Xz).unwrap().is_none());
    }

    #[test]
    fn fingerprint_of_stream() {
        let data = vec![7u8; 10000];
        let mut cursor = Cursor::new(data.clone());
        let fp = Fingerprint::of_stream(&mut cursor, Some(5.0)).unwrap();
        assert_eq!(fp.size, 10000);
        let fp2 = Fingerprint::of_stream(&mut Cursor::new(data), Some(5.0)).unwrap();
        assert!(fp.matches(&fp2, true));

        let mut changed = vec![7u8; 10000];
        changed[0] = 8;
        let fp3 = Fingerprint::of_stream(&mut Cursor::new(changed), Some(5.0)).unwrap();
        assert!(!fp.matches(&fp3, false));
    }
}

//! SQLAR backend — SQLite's own archive format.
//!
//! A SQLAR is a SQLite database with one table:
//! `sqlar(name PRIMARY KEY, mode, mtime, sz, data)`.  Payloads are either
//! stored verbatim (`sz == length(data)`), zlib-deflated (`sz >
//! length(data)`), or a symlink target (`sz < 0`).  Since the archive is
//! already a queryable SQL store, no separate index file is built; the
//! table of contents is loaded once and queried in memory.
//!
//! The backend needs a real file path (SQLite does not read from a byte
//! stream); the factory stages nested SQLARs into a temp file first.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::error::{ArcError, Result};
use crate::index::FileKind;
use crate::mountsource::{
    join_paths, normalize_path, EntryLocator, FileInfo, Listing, MountSource,
    StatFs, Userdata,
};
use crate::stencil::{shared_buffer, SeekableSource, Stencil, StenciledFile};

struct TocEntry {
    mode:     u32,
    mtime:    f64,
    size:     u64,
    linkname: String,
    kind:     FileKind,
}

pub struct SqlarMountSource {
    conn:    Connection,
    /// Full path → metadata; parents synthesized for omitted directories.
    toc:     BTreeMap<String, TocEntry>,
    files:   u64,
    /// Keeps a staged copy alive for SQLARs nested in other archives.
    _staged: Option<tempfile::NamedTempFile>,
}

impl SqlarMountSource {
    /// SQLite cannot read from a byte stream; nested SQLARs are staged
    /// into a temp file first.
    pub fn from_stream(mut stream: impl std::io::Read) -> Result<Self> {
        let mut staged = tempfile::NamedTempFile::new()?;
        std::io::copy(&mut stream, staged.as_file_mut())?;
        staged.as_file_mut().sync_all()?;
        let mut source = Self::open(staged.path())?;
        source._staged = Some(staged);
        Ok(source)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // Not every SQLite file is a SQLAR.
        let has_table: Option<String> = {
            use rusqlite::OptionalExtension;
            conn.query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'sqlar'",
                [],
                |row| row.get(0),
            )
            .optional()?
        };
        if has_table.is_none() {
            return Err(ArcError::Format {
                offset: 0,
                message: "SQLite file has no sqlar table".into(),
            });
        }

        let mut toc = BTreeMap::new();
        let mut files = 0u64;
        {
            let mut stmt = conn.prepare(
                "SELECT name, mode, mtime, sz, CASE WHEN sz < 0 THEN data ELSE NULL END
                 FROM sqlar",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let mode: i64 = row.get(1)?;
                let mtime: f64 = row.get::<_, i64>(2)? as f64;
                let sz: i64 = row.get(3)?;
                let link_blob: Option<Vec<u8>> = row.get(4)?;

                let full = normalize_path(&name);
                if full == "/" {
                    continue;
                }
                let mode = mode as u32;
                let (kind, size, linkname) = if sz < 0 {
                    let target = link_blob
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .unwrap_or_default();
                    (FileKind::Symlink, 0, target)
                } else if mode & 0o170000 == 0o040000 {
                    (FileKind::Directory, 0, String::new())
                } else {
                    (FileKind::Regular, sz as u64, String::new())
                };

                // Parent chain for archives that omit directory rows.
                let mut accumulated = String::from("/");
                for part in full.trim_matches('/').split('/') {
                    let next = join_paths(&accumulated, part);
                    if next != full {
                        toc.entry(next.clone()).or_insert(TocEntry {
                            mode:     0o040755,
                            mtime:    0.0,
                            size:     0,
                            linkname: String::new(),
                            kind:     FileKind::Directory,
                        });
                    }
                    accumulated = next;
                }

                files += 1;
                toc.insert(full, TocEntry { mode, mtime, size, linkname, kind });
            }
        }

        Ok(Self { conn, toc, files, _staged: None })
    }

    fn info_for(&self, path: &str, entry: &TocEntry) -> FileInfo {
        let type_bits = match entry.kind {
            FileKind::Directory => 0o040000,
            FileKind::Symlink   => 0o120000,
            _                   => 0o100000,
        };
        FileInfo {
            size:     entry.size,
            mtime:    entry.mtime,
            mode:     if entry.mode & 0o170000 != 0 { entry.mode } else { type_bits | (entry.mode & 0o7777) },
            linkname: entry.linkname.clone(),
            uid:      0,
            gid:      0,
            userdata: vec![Userdata::Entry(EntryLocator {
                path:            path.to_string(),
                header_offset:   0,
                offset:          0,
                size:            entry.size,
                kind:            entry.kind,
                is_sparse:       false,
                is_archive:      false,
                recursion_depth: 0,
            })],
        }
    }

    /// Fetch and (if deflated) decompress one payload.
    fn payload(&self, path: &str) -> Result<Vec<u8>> {
        let name = path.trim_start_matches('/');
        let (sz, data): (i64, Vec<u8>) = self.conn.query_row(
            "SELECT sz, data FROM sqlar WHERE name = ?1 OR name = ?2",
            rusqlite::params![name, format!("./{name}")],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if sz < 0 {
            return Err(ArcError::Usage("cannot open a symlink's payload".into()));
        }
        if data.len() as i64 == sz {
            return Ok(data);
        }
        let mut out = Vec::with_capacity(sz as usize);
        flate2::read::ZlibDecoder::new(&data[..])
            .read_to_end(&mut out)
            .map_err(|e| ArcError::CorruptBlock {
                codec:   "zlib",
                offset:  0,
                message: format!("sqlar payload for {path}: {e}"),
            })?;
        Ok(out)
    }
}

impl MountSource for SqlarMountSource {
    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        // SQLAR names are unique; only version 0/1 can resolve.
        if !(-1..=1).contains(&version) {
            return Ok(None);
        }
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Some(crate::mountsource::root_file_info(vec![Userdata::Synthetic])));
        }
        if version == -1 {
            return Ok(None);
        }
        Ok(self.toc.get(&path).map(|entry| self.info_for(&path, entry)))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        Ok(self.toc.contains_key(&normalize_path(path)) as u32)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        let dir = normalize_path(path);
        if dir != "/" {
            match self.toc.get(&dir) {
                Some(entry) if entry.kind == FileKind::Directory => {}
                _ => return Ok(None),
            }
        }
        let prefix = if dir == "/" { String::from("/") } else { format!("{dir}/") };
        let mut listing = Listing::new();
        for (path, entry) in self.toc.range(prefix.clone()..) {
            let Some(rest) = path.strip_prefix(&prefix) else { break };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            listing.insert(rest.to_string(), self.info_for(path, entry));
        }
        Ok(Some(listing))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, _) = info.pop_userdata()?;
        let Userdata::Entry(locator) = token else {
            return Err(ArcError::Usage("not a SQLAR entry".into()));
        };
        let data = self.payload(&locator.path)?;
        let size = data.len() as u64;
        Ok(Box::new(StenciledFile::new(vec![Stencil::new(shared_buffer(data), 0, size)])))
    }

    fn statfs(&mut self) -> StatFs {
        StatFs { files: self.files, ..StatFs::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a SQLAR the way `sqlite3 -A` would.
    fn build_sqlar(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE sqlar(name TEXT PRIMARY KEY, mode INT, mtime INT, sz INT, data BLOB);",
        )
        .unwrap();
        for (name, data) in entries {
            // Deflate; keep compressed only when it actually shrinks.
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).unwrap();
            let compressed = enc.finish().unwrap();
            let stored: &[u8] = if compressed.len() < data.len() { &compressed } else { data };
            conn.execute(
                "INSERT INTO sqlar VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![name, 0o100644, 1_600_000_000i64, data.len() as i64, stored],
            )
            .unwrap();
        }
        file
    }

    #[test]
    fn list_and_read() {
        let file = build_sqlar(&[
            ("hello.txt", b"hello sqlar"),
            ("dir/inner.bin", b"abcabcabcabcabcabcabcabc"),
        ]);
        let mut source = SqlarMountSource::open(file.path()).unwrap();

        let root = source.list("/").unwrap().unwrap();
        assert_eq!(root.keys().collect::<Vec<_>>(), vec!["dir", "hello.txt"]);
        assert!(source.is_directory("/dir").unwrap());

        let info = source.lookup("/hello.txt", 0).unwrap().unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(source.read(&info, 11, 0).unwrap(), b"hello sqlar");

        // The repetitive payload was stored deflated; reads decompress.
        let inner = source.lookup("/dir/inner.bin", 0).unwrap().unwrap();
        assert_eq!(source.read(&inner, 6, 3).unwrap(), b"abcabc");
    }

    #[test]
    fn rejects_plain_sqlite() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch("CREATE TABLE other(x);").unwrap();
        drop(conn);
        assert!(matches!(
            SqlarMountSource::open(file.path()),
            Err(ArcError::Format { .. })
        ));
    }

    #[test]
    fn version_semantics() {
        let file = build_sqlar(&[("a", b"x")]);
        let mut source = SqlarMountSource::open(file.path()).unwrap();
        assert_eq!(source.versions("/a").unwrap(), 1);
        assert!(source.lookup("/a", 1).unwrap().is_some());
        assert!(source.lookup("/a", 2).unwrap().is_none());
    }
}

//! Write overlay: copy-on-write on top of a read-only mount source.
//!
//! The overlay is a host folder plus a sidecar database at a fixed
//! relative name.  Files physically present in the folder shadow the
//! underlying source; sidecar rows add what the folder alone cannot say —
//! deletions of underlying entries and metadata overrides for entries
//! that were never copied up:
//!
//! ```text
//! files(path TEXT, name TEXT, mtime INTEGER, mode INTEGER,
//!       uid INTEGER, gid INTEGER, deleted INTEGER,
//!       PRIMARY KEY(path, name))
//! ```
//!
//! Lookup precedence: a `deleted` row wins, then the overlay folder, then
//! the underlying source merged with any metadata row.  The sidecar file
//! and SQLite's temp siblings are hidden from every listing and rejected
//! by lookup.
//!
//! State changes are single-row auto-committed statements, so an
//! interrupted operation never leaves a half-written overlay record.
//! The sidecar outlives the mount: re-mounting with the same overlay
//! folder restores every change.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ArcError, Result};
use crate::index::split_path;
use crate::mountsource::{
    join_paths, normalize_path, root_file_info, FileInfo, Listing, ModeListing, MountSource,
    ResolvedSource, StatFs, Userdata,
};
use crate::stencil::SeekableSource;

/// Sidecar database name inside the overlay folder.
pub const SIDECAR_NAME: &str = ".arcmount.overlay.sqlite";

/// Names that must never surface in the mounted view.
fn is_hidden(name: &str) -> bool {
    name == SIDECAR_NAME
        || name == format!("{SIDECAR_NAME}-journal")
        || name == format!("{SIDECAR_NAME}-wal")
        || name == format!("{SIDECAR_NAME}-shm")
}

#[derive(Debug, Clone)]
struct OverlayRow {
    mtime:   Option<i64>,
    mode:    Option<u32>,
    uid:     Option<u32>,
    gid:     Option<u32>,
    deleted: bool,
}

pub struct WriteOverlay {
    root:  PathBuf,
    conn:  Connection,
    child: Box<dyn MountSource>,
}

impl WriteOverlay {
    pub fn new(folder: &Path, child: Box<dyn MountSource>) -> Result<Self> {
        if !folder.is_dir() {
            fs::create_dir_all(folder)?;
        }
        let conn = Connection::open(folder.join(SIDECAR_NAME))?;
        conn.execute_batch(
            "PRAGMA locking_mode = EXCLUSIVE;
             CREATE TABLE IF NOT EXISTS files(
                 path    TEXT,
                 name    TEXT,
                 mtime   INTEGER,
                 mode    INTEGER,
                 uid     INTEGER,
                 gid     INTEGER,
                 deleted INTEGER,
                 PRIMARY KEY(path, name)
             );",
        )?;
        Ok(Self { root: folder.to_path_buf(), conn, child })
    }

    /// Host path backing a mounted path.
    pub fn real_path(&self, path: &str) -> PathBuf {
        self.root.join(normalize_path(path).trim_start_matches('/'))
    }

    // ── Sidecar rows ─────────────────────────────────────────────────────────

    fn row(&self, path: &str) -> Result<Option<OverlayRow>> {
        let (parent, name) = split_path(&normalize_path(path));
        let mut stmt = self.conn.prepare_cached(
            "SELECT mtime, mode, uid, gid, deleted FROM files WHERE path = ?1 AND name = ?2",
        )?;
        Ok(stmt
            .query_row(params![parent, name], |row| {
                Ok(OverlayRow {
                    mtime:   row.get(0)?,
                    mode:    row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                    uid:     row.get::<_, Option<i64>>(2)?.map(|v| v as u32),
                    gid:     row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
                    deleted: row.get::<_, i64>(4)? != 0,
                })
            })
            .optional()?)
    }

    fn upsert(&self, path: &str, update: impl FnOnce(&mut OverlayRow)) -> Result<()> {
        let mut row = self.row(path)?.unwrap_or(OverlayRow {
            mtime:   None,
            mode:    None,
            uid:     None,
            gid:     None,
            deleted: false,
        });
        update(&mut row);
        let (parent, name) = split_path(&normalize_path(path));
        self.conn.execute(
            "INSERT OR REPLACE INTO files VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                parent,
                name,
                row.mtime,
                row.mode.map(|v| v as i64),
                row.uid.map(|v| v as i64),
                row.gid.map(|v| v as i64),
                row.deleted as i64,
            ],
        )?;
        Ok(())
    }

    fn delete_row(&self, path: &str) -> Result<()> {
        let (parent, name) = split_path(&normalize_path(path));
        self.conn.execute(
            "DELETE FROM files WHERE path = ?1 AND name = ?2",
            params![parent, name],
        )?;
        Ok(())
    }

    fn is_deleted(&self, path: &str) -> Result<bool> {
        Ok(self.row(path)?.map(|row| row.deleted).unwrap_or(false))
    }

    fn deleted_names(&self, dir: &str) -> Result<Vec<String>> {
        let dir = normalize_path(dir);
        let mut stmt = self.conn.prepare_cached(
            "SELECT name FROM files WHERE path = ?1 AND deleted = 1",
        )?;
        let names = stmt
            .query_map(params![dir], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    // ── Info helpers ─────────────────────────────────────────────────────────

    fn host_info(&self, path: &str, meta: &fs::Metadata) -> FileInfo {
        let mut info = FileInfo {
            size:     meta.len(),
            mtime:    meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9,
            mode:     meta.mode(),
            linkname: if meta.file_type().is_symlink() {
                fs::read_link(self.real_path(path))
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                String::new()
            },
            uid:      meta.uid(),
            gid:      meta.gid(),
            userdata: vec![Userdata::HostPath(normalize_path(path))],
        };
        if let Ok(Some(row)) = self.row(path) {
            apply_row(&mut info, &row);
        }
        info
    }

    /// Copy an underlying file into the overlay folder so it can be
    /// modified.  No-op when the host file already exists.
    pub fn copy_up(&mut self, path: &str) -> Result<PathBuf> {
        let real = self.real_path(path);
        if real.exists() {
            return Ok(real);
        }
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }

        let Some(info) = self.child.lookup(path, 0)? else {
            // Nothing to copy: the file is being created fresh.
            return Ok(real);
        };
        if info.is_dir() {
            fs::create_dir_all(&real)?;
            return Ok(real);
        }

        let mut stream = self.child.open(&info)?;
        let mut out = fs::File::create(&real)?;
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }
        out.sync_all()?;
        let _ = fs::set_permissions(&real, fs::Permissions::from_mode(info.mode & 0o7777));
        log::debug!("copied up {path}");
        Ok(real)
    }

    // ── Write operations (driven by the FUSE adapter) ────────────────────────

    pub fn create(&mut self, path: &str, mode: u32) -> Result<fs::File> {
        let real = self.real_path(path);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(&real)?;
        let _ = fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777));
        self.upsert(path, |row| row.deleted = false)?;
        Ok(file)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        let real = self.real_path(path);
        fs::create_dir_all(&real)?;
        let _ = fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777));
        self.upsert(path, |row| row.deleted = false)
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> Result<()> {
        let real = self.real_path(path);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, &real)?;
        self.upsert(path, |row| row.deleted = false)
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let real = self.real_path(path);
        if let Ok(meta) = real.symlink_metadata() {
            if meta.is_dir() {
                return Err(ArcError::Io(std::io::Error::from_raw_os_error(libc::EISDIR)));
            }
            fs::remove_file(&real)?;
        }
        // Only paths that also exist underneath need a tombstone; pure
        // overlay creations just drop their row.
        if self.child.lookup(path, 0)?.is_some() {
            self.upsert(path, |row| row.deleted = true)
        } else {
            self.delete_row(path)
        }
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        // The merged view must be empty, not just the host folder.
        if let Some(listing) = MountSource::list_mode(self, path)? {
            if !listing.is_empty() {
                return Err(ArcError::Io(std::io::Error::from_raw_os_error(libc::ENOTEMPTY)));
            }
        }
        let real = self.real_path(path);
        if real.is_dir() {
            fs::remove_dir(&real)?;
        }
        if self.child.lookup(path, 0)?.is_some() {
            self.upsert(path, |row| row.deleted = true)
        } else {
            self.delete_row(path)
        }
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let old_real = self.copy_up(old)?;
        let new_real = self.real_path(new);
        if let Some(parent) = new_real.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&old_real, &new_real)?;
        self.upsert(new, |row| row.deleted = false)?;
        if self.child.lookup(old, 0)?.is_some() {
            self.upsert(old, |row| row.deleted = true)
        } else {
            self.delete_row(old)
        }
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let real = self.real_path(path);
        if real.exists() {
            fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        self.upsert(path, |row| row.mode = Some(mode))
    }

    pub fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let real = self.real_path(path);
        if real.exists() {
            // Best effort: unprivileged chown fails for foreign uids.
            use std::os::unix::ffi::OsStrExt;
            let c_path = std::ffi::CString::new(real.as_os_str().as_bytes())
                .map_err(|_| ArcError::Usage("path contains NUL".into()))?;
            unsafe {
                let _ = libc::chown(
                    c_path.as_ptr(),
                    uid.unwrap_or(u32::MAX),
                    gid.unwrap_or(u32::MAX),
                );
            }
        }
        self.upsert(path, |row| {
            if uid.is_some() {
                row.uid = uid;
            }
            if gid.is_some() {
                row.gid = gid;
            }
        })
    }

    pub fn utimens(&mut self, path: &str, mtime: i64) -> Result<()> {
        self.upsert(path, |row| row.mtime = Some(mtime))
    }

    pub fn truncate(&mut self, path: &str, length: u64) -> Result<()> {
        let real = self.copy_up(path)?;
        let file = fs::OpenOptions::new().write(true).open(&real)?;
        file.set_len(length)?;
        Ok(())
    }

    /// Open the host file for writing, copying up first if needed.
    pub fn open_for_write(&mut self, path: &str) -> Result<fs::File> {
        let real = self.copy_up(path)?;
        Ok(fs::OpenOptions::new().read(true).write(true).open(&real)?)
    }

    // ── Commit lists ─────────────────────────────────────────────────────────

    /// Paths to delete from and append to the original archive, for the
    /// offline commit operation.  Deletions cover tombstones and
    /// overwritten files; appends cover everything present in the overlay
    /// folder.
    pub fn commit_lists(&mut self) -> Result<(Vec<String>, Vec<String>)> {
        let mut deletions = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT path, name FROM files WHERE deleted = 1 ORDER BY path, name",
        )?;
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })? {
            let (parent, name) = row?;
            deletions.push(join_paths(&parent, &name));
        }
        drop(stmt);

        let mut appends = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_hidden(&name) {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let rel = path
                        .strip_prefix(&self.root)
                        .map(|p| format!("/{}", p.to_string_lossy()))
                        .unwrap_or_default();
                    // An overwritten underlying file must be deleted
                    // before its replacement is appended.
                    if self.child.lookup(&rel, 0)?.is_some() && !deletions.contains(&rel) {
                        deletions.push(rel.clone());
                    }
                    appends.push(rel);
                }
            }
        }
        appends.sort();
        Ok((deletions, appends))
    }
}

fn apply_row(info: &mut FileInfo, row: &OverlayRow) {
    if let Some(mtime) = row.mtime {
        info.mtime = mtime as f64;
    }
    if let Some(mode) = row.mode {
        info.mode = (info.mode & !0o7777) | (mode & 0o7777);
    }
    if let Some(uid) = row.uid {
        info.uid = uid;
    }
    if let Some(gid) = row.gid {
        info.gid = gid;
    }
}

impl MountSource for WriteOverlay {
    fn is_immutable(&self) -> bool {
        false
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        let path = normalize_path(path);
        let (_, name) = split_path(&path);
        if is_hidden(&name) {
            return Ok(None);
        }
        if path == "/" {
            return Ok(Some(root_file_info(vec![Userdata::Synthetic])));
        }
        if self.is_deleted(&path)? {
            return Ok(None);
        }

        // The overlay folder shadows the underlying source.
        let real = self.real_path(&path);
        if let Ok(meta) = real.symlink_metadata() {
            if (-1..=1).contains(&version) && version != -1 {
                return Ok(Some(self.host_info(&path, &meta)));
            }
            return Ok(None);
        }

        let Some(mut info) = self.child.lookup(&path, version)? else {
            return Ok(None);
        };
        if let Some(row) = self.row(&path)? {
            apply_row(&mut info, &row);
        }
        Ok(Some(info.with_userdata(Userdata::Child(0))))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        let path = normalize_path(path);
        if self.is_deleted(&path)? {
            return Ok(0);
        }
        if self.real_path(&path).symlink_metadata().is_ok() {
            return Ok(1);
        }
        self.child.versions(&path)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        let path = normalize_path(path);
        let mut merged: Option<Listing> = None;

        if let Some(underlying) = self.child.list(&path)? {
            let merged = merged.get_or_insert_with(Listing::new);
            for (name, mut info) in underlying {
                let full = join_paths(&path, &name);
                if let Some(row) = self.row(&full)? {
                    apply_row(&mut info, &row);
                }
                merged.insert(name, info.with_userdata(Userdata::Child(0)));
            }
        }

        let real = self.real_path(&path);
        if real.is_dir() {
            let merged = merged.get_or_insert_with(Listing::new);
            for entry in fs::read_dir(&real)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_hidden(&name) {
                    continue;
                }
                if let Ok(meta) = entry.path().symlink_metadata() {
                    let full = join_paths(&path, &name);
                    merged.insert(name, self.host_info(&full, &meta));
                }
            }
        }

        let Some(mut merged) = merged else { return Ok(None) };
        for name in self.deleted_names(&path)? {
            merged.remove(&name);
        }
        Ok(Some(merged))
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        Ok(self
            .list(path)?
            .map(|listing| listing.into_iter().map(|(name, info)| (name, info.mode)).collect()))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::HostPath(path) => Ok(Box::new(fs::File::open(self.real_path(&path))?)),
            Userdata::Child(_) => self.child.open(&inner),
            _ => Err(ArcError::Usage("cannot open the overlay root".into())),
        }
    }

    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::HostPath(path) => {
                use std::os::unix::fs::FileExt;
                let file = fs::File::open(self.real_path(&path))?;
                let mut buf = vec![0u8; size];
                let n = file.read_at(&mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            }
            Userdata::Child(_) => self.child.read(&inner, size, offset),
            _ => Err(ArcError::Usage("cannot read the overlay root".into())),
        }
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Child(_) => self.child.list_xattr(&inner),
            _ => Ok(Vec::new()),
        }
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Child(_) => self.child.get_xattr(&inner, key),
            _ => Ok(None),
        }
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::HostPath(path) => Ok(ResolvedSource {
                mount_point: "/".into(),
                host_path:   Some(self.real_path(&path)),
                info:        inner.with_userdata(Userdata::HostPath(path)),
            }),
            Userdata::Child(_) => self.child.resolve(&inner),
            _ => Ok(ResolvedSource {
                mount_point: "/".into(),
                info:        info.clone(),
                host_path:   None,
            }),
        }
    }

    fn statfs(&mut self) -> StatFs {
        let mut stats = vec![self.child.statfs()];
        if let Some(host) = crate::mountsource::folder::statvfs(&self.root) {
            stats.push(host);
        }
        crate::mountsource::merge_statfs(&stats)
    }

    fn teardown(&mut self) -> Result<()> {
        self.child.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mountsource::singlefile::SingleFileMountSource;
    use crate::stencil::shared_buffer;

    fn overlay_over_single(data: &[u8]) -> (tempfile::TempDir, WriteOverlay) {
        let dir = tempfile::tempdir().unwrap();
        let child = SingleFileMountSource::new(
            "a",
            shared_buffer(data.to_vec()),
            data.len() as u64,
            0.0,
        )
        .unwrap();
        let overlay = WriteOverlay::new(dir.path(), Box::new(child)).unwrap();
        (dir, overlay)
    }

    #[test]
    fn underlying_shows_through() {
        let (_dir, mut overlay) = overlay_over_single(b"x");
        let info = overlay.lookup("/a", 0).unwrap().unwrap();
        assert_eq!(overlay.read(&info, 1, 0).unwrap(), b"x");
        let listing = overlay.list("/").unwrap().unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn sidecar_is_hidden() {
        let (_dir, mut overlay) = overlay_over_single(b"x");
        let listing = overlay.list("/").unwrap().unwrap();
        assert!(!listing.contains_key(SIDECAR_NAME));
        assert!(overlay.lookup(&format!("/{SIDECAR_NAME}"), 0).unwrap().is_none());
    }

    #[test]
    fn unlink_then_create_roundtrip() {
        let (_dir, mut overlay) = overlay_over_single(b"x");

        // Deleting an underlying file leaves a tombstone.
        overlay.unlink("/a").unwrap();
        assert!(overlay.lookup("/a", 0).unwrap().is_none());
        assert_eq!(overlay.versions("/a").unwrap(), 0);
        assert!(overlay.list("/").unwrap().unwrap().is_empty());

        // Re-creating resurrects the path with new content.
        let mut file = overlay.create("/a", 0o644).unwrap();
        file.write_all(b"y").unwrap();
        drop(file);
        let info = overlay.lookup("/a", 0).unwrap().unwrap();
        assert_eq!(overlay.read(&info, 1, 0).unwrap(), b"y");
    }

    #[test]
    fn overlay_persists_across_reopen() {
        let (dir, mut overlay) = overlay_over_single(b"x");
        overlay.unlink("/a").unwrap();
        let mut file = overlay.create("/a", 0o644).unwrap();
        file.write_all(b"y").unwrap();
        drop(file);
        drop(overlay);

        let child = SingleFileMountSource::new("a", shared_buffer(b"x".to_vec()), 1, 0.0).unwrap();
        let mut reopened = WriteOverlay::new(dir.path(), Box::new(child)).unwrap();
        let info = reopened.lookup("/a", 0).unwrap().unwrap();
        assert_eq!(reopened.read(&info, 1, 0).unwrap(), b"y");
    }

    #[test]
    fn copy_up_preserves_content() {
        let (dir, mut overlay) = overlay_over_single(b"underlying bytes");
        let real = overlay.copy_up("/a").unwrap();
        assert_eq!(real, dir.path().join("a"));
        assert_eq!(fs::read(&real).unwrap(), b"underlying bytes");

        // After copy-up the host file takes precedence.
        fs::write(&real, b"changed").unwrap();
        let info = overlay.lookup("/a", 0).unwrap().unwrap();
        assert_eq!(overlay.read(&info, 7, 0).unwrap(), b"changed");
    }

    #[test]
    fn metadata_overrides_merge() {
        let (_dir, mut overlay) = overlay_over_single(b"x");
        overlay.chmod("/a", 0o600).unwrap();
        overlay.utimens("/a", 1234).unwrap();
        let info = overlay.lookup("/a", 0).unwrap().unwrap();
        assert_eq!(info.mode & 0o7777, 0o600);
        assert_eq!(info.mtime, 1234.0);
    }

    #[test]
    fn pure_overlay_unlink_removes_row() {
        let (_dir, mut overlay) = overlay_over_single(b"x");
        let mut file = overlay.create("/fresh", 0o644).unwrap();
        file.write_all(b"new").unwrap();
        drop(file);
        assert!(overlay.lookup("/fresh", 0).unwrap().is_some());

        overlay.unlink("/fresh").unwrap();
        assert!(overlay.lookup("/fresh", 0).unwrap().is_none());
        // No tombstone is kept for a path the underlying source lacks.
        assert!(overlay.row("/fresh").unwrap().is_none());
    }

    #[test]
    fn rename_tombstones_the_source() {
        let (_dir, mut overlay) = overlay_over_single(b"payload");
        overlay.rename("/a", "/b").unwrap();
        assert!(overlay.lookup("/a", 0).unwrap().is_none());
        let info = overlay.lookup("/b", 0).unwrap().unwrap();
        assert_eq!(overlay.read(&info, 7, 0).unwrap(), b"payload");

        let (deletions, appends) = overlay.commit_lists().unwrap();
        assert_eq!(deletions, vec!["/a".to_string()]);
        assert_eq!(appends, vec!["/b".to_string()]);
    }

    #[test]
    fn mkdir_and_rmdir() {
        let (_dir, mut overlay) = overlay_over_single(b"x");
        overlay.mkdir("/newdir", 0o755).unwrap();
        assert!(overlay.lookup("/newdir", 0).unwrap().unwrap().is_dir());
        overlay.rmdir("/newdir").unwrap();
        assert!(overlay.lookup("/newdir", 0).unwrap().is_none());
    }
}

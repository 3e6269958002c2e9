//! The mount-source contract and its shared value types.
//!
//! A mount source is anything that can answer path lookups and serve entry
//! bytes: leaf archive readers, host folders, and the compositing layers
//! that stack on top of each other.  Composition is by ownership — each
//! layer owns its children as boxed trait objects — and routing between
//! layers rides on [`FileInfo::userdata`]: every layer pushes one token on
//! the way out of `lookup` and pops it on the way into any later
//! operation, so no operation ever re-walks the path.
//!
//! All paths are absolute, `/`-separated, and normalized (no `.`, `..`, or
//! empty segments).  `lookup(path, 0)` is the newest version; positive
//! versions count from the oldest; negative versions count back from the
//! newest (the union layer's version-shifting arithmetic needs both
//! directions).

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{ArcError, Result};
use crate::stencil::SeekableSource;

pub mod folder;
pub mod singlefile;
pub mod union;
pub mod subvolumes;
pub mod automount;
pub mod versioning;
pub mod removeprefix;
pub mod link;
pub mod factory;

pub use crate::index::FileKind;

// ── Userdata tokens ───────────────────────────────────────────────────────────

/// Locator a leaf archive reader needs to serve an entry without another
/// index query.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryLocator {
    /// Full path within the owning reader (xattr and sparse-map rows are
    /// keyed by it).
    pub path:          String,
    pub header_offset: u64,
    pub offset:        u64,
    pub size:          u64,
    pub kind:          FileKind,
    pub is_sparse:     bool,
    /// The entry itself is an archive already expanded in this index
    /// (recursive TAR indexing); the auto-mount layer must not mount it
    /// a second time.
    pub is_archive:    bool,
    /// Archive boundaries crossed inside the owning reader.
    pub recursion_depth: u32,
}

/// Version-layer discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionToken {
    File,
    VersionsFolder,
}

/// One layer's routing token.
#[derive(Debug, Clone, PartialEq)]
pub enum Userdata {
    /// Leaf archive entry locator.
    Entry(EntryLocator),
    /// Path on the host filesystem (folder mount source, write overlay).
    HostPath(String),
    /// Child index pushed by the union layer.
    Child(usize),
    /// Mount-point path pushed by the auto-mount layer.
    MountPoint(String),
    /// Subvolume name pushed by the subvolumes layer.
    Subvolume(String),
    /// Version-layer discriminator.
    Version(VersionToken),
    /// Marker for synthetic entries a layer answers by itself (the
    /// remove-prefix layer's fabricated parent directories).
    Synthetic,
}

// ── FileInfo ──────────────────────────────────────────────────────────────────

/// The runtime value a successful lookup returns.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub size:     u64,
    /// Seconds since epoch; fractional for pax mtimes.
    pub mtime:    f64,
    /// Full POSIX mode: permission and file-type bits.
    pub mode:     u32,
    pub linkname: String,
    pub uid:      u32,
    pub gid:      u32,
    /// Layer routing stack; the topmost entry belongs to the outermost
    /// layer that produced this info.
    pub userdata: Vec<Userdata>,
}

impl FileInfo {
    /// Pop the outermost routing token, yielding the info as the next
    /// layer down saw it.  The original is untouched.
    pub fn pop_userdata(&self) -> Result<(Userdata, FileInfo)> {
        let mut inner = self.clone();
        let token = inner.userdata.pop().ok_or_else(|| {
            ArcError::Usage("file info has no routing token for this layer".into())
        })?;
        Ok((token, inner))
    }

    /// Push a routing token, consuming and returning the info.
    pub fn with_userdata(mut self, token: Userdata) -> FileInfo {
        self.userdata.push(token);
        self
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == 0o120000
    }

    /// Hardlinks carry a linkname without being symlinks.
    #[inline]
    pub fn is_hardlink(&self) -> bool {
        !self.linkname.is_empty()
            && self.mode & 0o170000 != 0o120000
            && self.mode & 0o170000 != 0o040000
    }
}

/// The root directory info every source agrees on.
pub fn root_file_info(userdata: Vec<Userdata>) -> FileInfo {
    FileInfo {
        size:     0,
        mtime:    0.0,
        mode:     0o040555,
        linkname: String::new(),
        uid:      0,
        gid:      0,
        userdata,
    }
}

// ── statfs ────────────────────────────────────────────────────────────────────

/// Mergeable filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks:     u64,
    pub bfree:      u64,
    pub bavail:     u64,
    pub files:      u64,
    pub ffree:      u64,
    pub name_max:   u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            block_size: 256 * 1024,
            blocks:     0,
            bfree:      0,
            bavail:     0,
            files:      0,
            ffree:      0,
            name_max:   255,
        }
    }
}

/// Merge statistics across children: capacities add up, limits take the
/// most conservative value.
pub fn merge_statfs(stats: &[StatFs]) -> StatFs {
    if stats.is_empty() {
        return StatFs::default();
    }
    let mut merged = stats[0];
    for s in &stats[1..] {
        merged.block_size = merged.block_size.max(s.block_size);
        merged.name_max = merged.name_max.min(s.name_max);
        merged.blocks += s.blocks;
        merged.bfree = merged.bfree.min(s.bfree);
        merged.bavail = merged.bavail.min(s.bavail);
        merged.files += s.files;
        merged.ffree = merged.ffree.min(s.ffree);
    }
    merged
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// Result of walking the layer stack down to the concrete source owning an
/// entry.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    /// Where the owning source is grafted, as seen from the caller.
    pub mount_point: String,
    /// The entry as the owning source sees it (userdata fully consumed
    /// down to that source's own token).
    pub info:        FileInfo,
    /// Set when the owning source is a host directory: the entry's real
    /// path, usable for direct host I/O.
    pub host_path:   Option<PathBuf>,
}

// ── The contract ──────────────────────────────────────────────────────────────

pub type Listing = BTreeMap<String, FileInfo>;
pub type ModeListing = BTreeMap<String, u32>;

pub trait MountSource: Send {
    /// Immutable sources never change for the mount's lifetime; mutable
    /// ones (subvolumes, the write overlay) disable caching above them.
    fn is_immutable(&self) -> bool {
        true
    }

    /// Version-aware path lookup.  `version == 0` is the newest.
    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>>;

    fn versions(&mut self, path: &str) -> Result<u32>;

    /// Children with their infos, or None iff `path` is not a directory.
    fn list(&mut self, path: &str) -> Result<Option<Listing>>;

    /// Cheaper listing carrying only modes.
    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        Ok(self.list(path)?.map(|children| {
            children.into_iter().map(|(name, info)| (name, info.mode)).collect()
        }))
    }

    /// A seekable stream over the entry's payload.
    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>>;

    /// Positioned read; the default goes through `open`.
    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut stream = self.open(info)?;
        stream.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        let mut filled = 0usize;
        while filled < size {
            match stream.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn list_xattr(&mut self, _info: &FileInfo) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn get_xattr(&mut self, _info: &FileInfo, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Walk down to the concrete source owning `info`.
    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        Ok(ResolvedSource {
            mount_point: "/".into(),
            info:        info.clone(),
            host_path:   None,
        })
    }

    fn statfs(&mut self) -> StatFs {
        StatFs::default()
    }

    /// Convenience existence check.
    fn exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.lookup(path, 0)?.is_some())
    }

    /// Convenience directory check.
    fn is_directory(&mut self, path: &str) -> Result<bool> {
        Ok(self.lookup(path, 0)?.map(|info| info.is_dir()).unwrap_or(false))
    }

    /// Release held resources (byte sources, worker pools, DB handles).
    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Join a mount point and an inner path without double slashes.
pub fn join_paths(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    match (base.is_empty(), rest.is_empty()) {
        (true, true) => "/".into(),
        (true, false) => format!("/{rest}"),
        (false, true) => base.into(),
        (false, false) => format!("{base}/{rest}"),
    }
}

/// Normalize any incoming path to absolute with no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::from("/");
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn userdata_pop_is_nondestructive() {
        let info = root_file_info(vec![Userdata::Child(0), Userdata::MountPoint("/x".into())]);
        let (token, inner) = info.pop_userdata().unwrap();
        assert_eq!(token, Userdata::MountPoint("/x".into()));
        assert_eq!(inner.userdata, vec![Userdata::Child(0)]);
        assert_eq!(info.userdata.len(), 2);

        let empty = root_file_info(Vec::new());
        assert!(empty.pop_userdata().is_err());
    }

    #[test]
    fn path_helpers() {
        assert_eq!(join_paths("/", "/a/b"), "/a/b");
        assert_eq!(join_paths("/mnt", "c"), "/mnt/c");
        assert_eq!(join_paths("/mnt/", "/c"), "/mnt/c");
        assert_eq!(join_paths("/", ""), "/");
        assert_eq!(normalize_path("a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn statfs_merge() {
        let a = StatFs { block_size: 4096, blocks: 100, bfree: 10, bavail: 10, files: 5, ffree: 1, name_max: 255 };
        let b = StatFs { block_size: 512, blocks: 50, bfree: 5, bavail: 5, files: 3, ffree: 2, name_max: 128 };
        let merged = merge_statfs(&[a, b]);
        assert_eq!(merged.block_size, 4096);
        assert_eq!(merged.blocks, 150);
        assert_eq!(merged.files, 8);
        assert_eq!(merged.name_max, 128);
    }

    #[test]
    fn hardlink_detection() {
        let mut info = root_file_info(Vec::new());
        info.mode = 0o100644;
        info.linkname = "target".into();
        assert!(info.is_hardlink());
        info.mode = 0o120777;
        assert!(!info.is_hardlink());
        assert!(info.is_symlink());
    }
}

//! A host directory exposed through the mount-source contract.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{ArcError, Result};
use crate::mountsource::{
    normalize_path, FileInfo, Listing, MountSource, ResolvedSource, StatFs, Userdata,
};
use crate::stencil::SeekableSource;

pub struct FolderMountSource {
    root: PathBuf,
}

impl FolderMountSource {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ArcError::Usage(format!(
                "{} is not a directory", root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Host path for a mount-source path.
    pub fn real_path(&self, path: &str) -> PathBuf {
        let rel = normalize_path(path);
        self.root.join(rel.trim_start_matches('/'))
    }

    fn info_from_metadata(&self, path: &str, meta: &fs::Metadata) -> FileInfo {
        let linkname = if meta.file_type().is_symlink() {
            fs::read_link(self.real_path(path))
                .map(|t| t.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        FileInfo {
            size:     meta.len(),
            mtime:    meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9,
            mode:     meta.mode(),
            linkname,
            uid:      meta.uid(),
            gid:      meta.gid(),
            userdata: vec![Userdata::HostPath(normalize_path(path))],
        }
    }
}

impl MountSource for FolderMountSource {
    fn is_immutable(&self) -> bool {
        // The host can change under the mount at any time.
        false
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        if !(-1..=1).contains(&version) {
            return Ok(None);
        }
        let real = self.real_path(path);
        match fs::symlink_metadata(&real) {
            Ok(_) if version == -1 => Ok(None),
            Ok(meta) => Ok(Some(self.info_from_metadata(path, &meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArcError::Io(e)),
        }
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        Ok(self.real_path(path).symlink_metadata().is_ok() as u32)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        let real = self.real_path(path);
        if !real.is_dir() {
            return Ok(None);
        }
        let mut listing = Listing::new();
        for entry in fs::read_dir(&real)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_path = crate::mountsource::join_paths(&normalize_path(path), &name);
            if let Ok(meta) = entry.path().symlink_metadata() {
                listing.insert(name, self.info_from_metadata(&child_path, &meta));
            }
        }
        Ok(Some(listing))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, _) = info.pop_userdata()?;
        let Userdata::HostPath(path) = token else {
            return Err(ArcError::Usage("not a host-folder entry".into()));
        };
        Ok(Box::new(fs::File::open(self.real_path(&path))?))
    }

    fn list_xattr(&mut self, _info: &FileInfo) -> Result<Vec<String>> {
        // Host xattrs are not forwarded; the overlay handles its own.
        Ok(Vec::new())
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        let (token, inner) = info.pop_userdata()?;
        let Userdata::HostPath(path) = token else {
            return Err(ArcError::Usage("not a host-folder entry".into()));
        };
        Ok(ResolvedSource {
            mount_point: "/".into(),
            host_path:   Some(self.real_path(&path)),
            info:        inner.with_userdata(Userdata::HostPath(path)),
        })
    }

    fn statfs(&mut self) -> StatFs {
        statvfs(&self.root).unwrap_or_default()
    }
}

/// Host filesystem statistics via statvfs(3).
pub fn statvfs(path: &Path) -> Option<StatFs> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(StatFs {
        block_size: (stat.f_bsize as u32).max(512),
        blocks:     stat.f_blocks as u64,
        bfree:      stat.f_bfree as u64,
        bavail:     stat.f_bavail as u64,
        files:      stat.f_files as u64,
        ffree:      stat.f_ffree as u64,
        name_max:   stat.f_namemax as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, FolderMountSource) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file.txt"), b"contents").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/nested"), b"inner").unwrap();
        let source = FolderMountSource::new(dir.path()).unwrap();
        (dir, source)
    }

    #[test]
    fn lookup_and_read() {
        let (_dir, mut source) = setup();
        let info = source.lookup("/file.txt", 0).unwrap().unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(source.read(&info, 8, 0).unwrap(), b"contents");
        assert!(source.lookup("/missing", 0).unwrap().is_none());
        assert_eq!(source.versions("/file.txt").unwrap(), 1);
    }

    #[test]
    fn listing() {
        let (_dir, mut source) = setup();
        let root = source.list("/").unwrap().unwrap();
        assert_eq!(root.keys().collect::<Vec<_>>(), vec!["file.txt", "sub"]);
        assert!(source.list("/file.txt").unwrap().is_none());
        let sub = source.list("/sub").unwrap().unwrap();
        assert!(sub.contains_key("nested"));
    }

    #[test]
    fn resolve_exposes_host_path() {
        let (dir, mut source) = setup();
        let info = source.lookup("/sub/nested", 0).unwrap().unwrap();
        let resolved = source.resolve(&info).unwrap();
        assert_eq!(resolved.host_path.unwrap(), dir.path().join("sub/nested"));
    }

    #[test]
    fn not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"").unwrap();
        assert!(FolderMountSource::new(&file).is_err());
    }
}

//! File-version layer: the `.versions` pseudo-API plus hardlink
//! resolution.
//!
//! For every path `p` with more than one version, `p.versions/` is a
//! hidden folder listing `1` (oldest) through `versions(p)` (newest);
//! `lookup(p)` itself keeps returning the newest.  Version folders nest:
//! `/a.versions/2/b.versions/1` resolves by dropping the parent's version
//! selector (multiple versions of a folder union-mount, so a parent's
//! exact version never changes which children exist).
//!
//! Hardlink resolution lives here rather than in its own layer because
//! self-referencing hardlinks (an archive member hard-linking to its own
//! path, which tar produces for repeated appends) are resolved by stepping
//! to ever-older versions of that path — and only this layer knows about
//! versions.  Cycles terminate on the first revisited (path, version)
//! pair; the last successfully resolved info wins.  The hop cap is 128,
//! comfortably above the kernel's own symlink limit of 40.

use std::collections::HashSet;

use crate::error::{ArcError, Result};
use crate::mountsource::{
    join_paths, normalize_path, FileInfo, Listing, ModeListing, MountSource, ResolvedSource,
    StatFs, Userdata, VersionToken,
};
use crate::stencil::SeekableSource;

const VERSIONS_SUFFIX: &str = ".versions";
const MAX_HARDLINK_HOPS: usize = 128;

pub struct FileVersionLayer {
    child: Box<dyn MountSource>,
}

/// What a `.versions`-path decode resolved to.
#[derive(Debug, PartialEq)]
struct DecodedPath {
    path:               String,
    is_versions_folder: bool,
    version:            i64,
}

impl FileVersionLayer {
    pub fn new(child: Box<dyn MountSource>) -> Self {
        Self { child }
    }

    /// Translate `/foo.versions/3/bar` style paths into a plain path plus
    /// a version selector.  Returns None when the path matches nothing.
    fn decode_versions_path(&mut self, path: &str) -> Result<Option<DecodedPath>> {
        let normalized = normalize_path(path);
        let mut file_path = String::new();
        let mut awaiting_version = false;
        let mut version: Option<i64> = None;

        for part in normalized.trim_matches('/').split('/') {
            if part.is_empty() {
                continue;
            }
            if awaiting_version {
                // The part right after a `.versions` folder must be a
                // canonical version number.
                let Ok(parsed) = part.parse::<i64>() else { return Ok(None) };
                if parsed.to_string() != part || parsed < 1 {
                    return Ok(None);
                }
                version = Some(parsed);
                awaiting_version = false;
                continue;
            }

            let attempt = format!("{file_path}/{part}");
            if self.child.lookup(&attempt, 0)?.is_some() {
                file_path = attempt;
                version = Some(0);
                continue;
            }

            if part.len() > VERSIONS_SUFFIX.len() && part.ends_with(VERSIONS_SUFFIX) {
                awaiting_version = true;
                version = Some(0);
                file_path = attempt[..attempt.len() - VERSIONS_SUFFIX.len()].to_string();
                continue;
            }

            return Ok(None);
        }

        match version {
            None => Ok(None),
            Some(version) => Ok(Some(DecodedPath {
                path:               file_path,
                is_versions_folder: awaiting_version,
                version:            if awaiting_version { 0 } else { version },
            })),
        }
    }

    /// Follow hardlink chains, stepping into older versions on
    /// self-reference.
    fn resolve_hardlinks(&mut self, path: &str) -> Result<Option<FileInfo>> {
        let Some(mut info) = self.child.lookup(path, 0)? else {
            return Ok(None);
        };

        let mut path = normalize_path(path);
        let mut version = 0i64;
        let mut visited: HashSet<(String, i64)> = HashSet::new();
        visited.insert((path.clone(), version));

        let mut hops = 0usize;
        while info.is_hardlink() && hops < MAX_HARDLINK_HOPS {
            // Link targets are relative to the mount source that owns the
            // entry; prefix its mount point to get a full path up here.
            let resolved = self.child.resolve(&info)?;
            let target = join_paths(&resolved.mount_point, info.linkname.trim_start_matches('/'));

            if target == path {
                // Self-reference: try the next-older version.
                version += 1;
            } else {
                version = 0;
            }
            if !visited.insert((target.clone(), version)) {
                // Cycle: keep the last info that resolved.
                return Ok(Some(info));
            }
            path = target;
            match self.child.lookup(&path, version)? {
                Some(next) => info = next,
                None => return Ok(None),
            }
            hops += 1;
        }
        Ok(Some(info))
    }

    fn versions_folder_info(&mut self, path: &str) -> Result<FileInfo> {
        let parent = self.child.lookup(path, 0)?.ok_or_else(|| {
            ArcError::Usage(format!("versions folder for a vanished path {path}"))
        })?;
        Ok(FileInfo {
            size:     0,
            mtime:    parent.mtime,
            mode:     0o040777,
            linkname: String::new(),
            uid:      parent.uid,
            gid:      parent.gid,
            userdata: vec![Userdata::Version(VersionToken::VersionsFolder)],
        })
    }
}

impl MountSource for FileVersionLayer {
    fn is_immutable(&self) -> bool {
        self.child.is_immutable()
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        // The version selector is this layer's own pseudo-path API; plain
        // versioned lookups pass straight through.
        if version != 0 {
            return Ok(self
                .child
                .lookup(path, version)?
                .map(|info| info.with_userdata(Userdata::Version(VersionToken::File))));
        }

        if let Some(info) = self.resolve_hardlinks(path)? {
            return Ok(Some(info.with_userdata(Userdata::Version(VersionToken::File))));
        }

        let Some(decoded) = self.decode_versions_path(path)? else {
            return Ok(None);
        };
        if decoded.is_versions_folder {
            return Ok(Some(self.versions_folder_info(&decoded.path)?));
        }
        Ok(self
            .child
            .lookup(&decoded.path, decoded.version)?
            .map(|info| info.with_userdata(Userdata::Version(VersionToken::File))))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        self.child.versions(path)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        if let Some(listing) = self.child.list(path)? {
            return Ok(Some(
                listing
                    .into_iter()
                    .map(|(name, info)| {
                        (name, info.with_userdata(Userdata::Version(VersionToken::File)))
                    })
                    .collect(),
            ));
        }

        // Not a plain folder: maybe a `.versions` pseudo-folder.
        let Some(decoded) = self.decode_versions_path(path)? else {
            return Ok(None);
        };
        if !decoded.is_versions_folder {
            // A versioned folder component: folder versions union-mount,
            // so the undecorated path lists the same children.
            return Ok(self.child.list(&decoded.path)?.map(|listing| {
                listing
                    .into_iter()
                    .map(|(name, info)| {
                        (name, info.with_userdata(Userdata::Version(VersionToken::File)))
                    })
                    .collect()
            }));
        }
        let count = self.child.versions(&decoded.path)?;
        let mut listing = Listing::new();
        for version in 1..=count {
            if let Some(info) = self.child.lookup(&decoded.path, version as i64)? {
                listing.insert(
                    version.to_string(),
                    info.with_userdata(Userdata::Version(VersionToken::File)),
                );
            }
        }
        Ok(Some(listing))
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        if let Some(listing) = self.child.list_mode(path)? {
            return Ok(Some(listing));
        }
        Ok(self
            .list(path)?
            .map(|listing| listing.into_iter().map(|(name, info)| (name, info.mode)).collect()))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Version(VersionToken::File) => self.child.open(&inner),
            _ => Err(ArcError::Usage("cannot open a versions folder".into())),
        }
    }

    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Version(VersionToken::File) => self.child.read(&inner, size, offset),
            _ => Err(ArcError::Usage("cannot read a versions folder".into())),
        }
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Version(VersionToken::File) => self.child.list_xattr(&inner),
            _ => Ok(Vec::new()),
        }
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Version(VersionToken::File) => self.child.get_xattr(&inner, key),
            _ => Ok(None),
        }
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Version(VersionToken::File) => self.child.resolve(&inner),
            _ => Ok(ResolvedSource {
                mount_point: "/".into(),
                info:        info.clone(),
                host_path:   None,
            }),
        }
    }

    fn statfs(&mut self) -> StatFs {
        self.child.statfs()
    }

    fn teardown(&mut self) -> Result<()> {
        self.child.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mountsource::folder::FolderMountSource;
    use crate::mountsource::union::UnionMountSource;

    fn versioned_union() -> (tempfile::TempDir, tempfile::TempDir, FileVersionLayer) {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("ufo"), b"iriya in folder 1\n").unwrap();
        std::fs::write(b.path().join("ufo"), b"iriya\n").unwrap();
        let union = UnionMountSource::new(vec![
            Box::new(FolderMountSource::new(a.path()).unwrap()),
            Box::new(FolderMountSource::new(b.path()).unwrap()),
        ]);
        (a, b, FileVersionLayer::new(Box::new(union)))
    }

    #[test]
    fn plain_lookup_is_newest() {
        let (_a, _b, mut layer) = versioned_union();
        let info = layer.lookup("/ufo", 0).unwrap().unwrap();
        assert_eq!(layer.read(&info, 64, 0).unwrap(), b"iriya\n");
    }

    #[test]
    fn versions_folder_lists_all() {
        let (_a, _b, mut layer) = versioned_union();
        let listing = layer.list("/ufo.versions").unwrap().unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["1", "2"]);

        let folder = layer.lookup("/ufo.versions", 0).unwrap().unwrap();
        assert!(folder.is_dir());
    }

    #[test]
    fn version_paths_select_oldest() {
        let (_a, _b, mut layer) = versioned_union();
        let oldest = layer.lookup("/ufo.versions/1", 0).unwrap().unwrap();
        assert_eq!(layer.read(&oldest, 64, 0).unwrap(), b"iriya in folder 1\n");
        let newest = layer.lookup("/ufo.versions/2", 0).unwrap().unwrap();
        assert_eq!(layer.read(&newest, 64, 0).unwrap(), b"iriya\n");
    }

    #[test]
    fn bad_version_components_miss() {
        let (_a, _b, mut layer) = versioned_union();
        assert!(layer.lookup("/ufo.versions/0", 0).unwrap().is_none());
        assert!(layer.lookup("/ufo.versions/03", 0).unwrap().is_none());
        assert!(layer.lookup("/ufo.versions/three", 0).unwrap().is_none());
        assert!(layer.lookup("/nothing.versions", 0).unwrap().is_none());
    }
}

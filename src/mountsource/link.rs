//! Link-resolution layer: lookups that land on a symlink or hardlink are
//! rewritten to their target's file info.
//!
//! Targets may be relative (resolved against the link's parent folder,
//! with `..` handling) or absolute within the mount.  Chains are capped at
//! 128 hops and cycles terminate on the first revisited path, returning
//! the last info that resolved — a dangling link keeps its own info so the
//! entry stays visible (matching how `ls` shows broken symlinks).
//!
//! The layer is a pass-through for everything but `lookup`: the infos it
//! returns belong to the resolved entries, so operations route through the
//! child's own tokens untouched.

use std::collections::HashSet;

use crate::error::Result;
use crate::mountsource::{
    normalize_path, FileInfo, Listing, ModeListing, MountSource, ResolvedSource, StatFs,
};
use crate::stencil::SeekableSource;

const MAX_LINK_HOPS: usize = 128;

pub struct LinkResolutionLayer {
    child: Box<dyn MountSource>,
}

/// Resolve `.` and `..` components against an absolute path.
fn resolve_dots(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        "/".into()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// Absolute target of a link at `link_path` pointing to `target`.
fn absolute_target(link_path: &str, target: &str) -> String {
    if target.starts_with('/') {
        return resolve_dots(target);
    }
    let parent = match normalize_path(link_path).rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => String::new(),
    };
    resolve_dots(&format!("{parent}/{target}"))
}

impl LinkResolutionLayer {
    pub fn new(child: Box<dyn MountSource>) -> Self {
        Self { child }
    }
}

impl MountSource for LinkResolutionLayer {
    fn is_immutable(&self) -> bool {
        self.child.is_immutable()
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        let Some(mut info) = self.child.lookup(path, version)? else {
            return Ok(None);
        };

        let mut current = normalize_path(path);
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(current.clone());

        let mut hops = 0usize;
        while (info.is_symlink() || info.is_hardlink()) && hops < MAX_LINK_HOPS {
            let target = absolute_target(&current, &info.linkname);
            if !visited.insert(target.clone()) {
                break; // cycle: the last resolved info stands
            }
            match self.child.lookup(&target, 0)? {
                Some(next) => info = next,
                None => break, // dangling link stays visible as itself
            }
            current = target;
            hops += 1;
        }
        Ok(Some(info))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        self.child.versions(path)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        self.child.list(path)
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        self.child.list_mode(path)
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        self.child.open(info)
    }

    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        self.child.read(info, size, offset)
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        self.child.list_xattr(info)
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        self.child.get_xattr(info, key)
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        self.child.resolve(info)
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

    #[test]
    fn dot_resolution() {
        assert_eq!(resolve_dots("/a/b/../c"), "/a/c");
        assert_eq!(resolve_dots("/a/./b"), "/a/b");
        assert_eq!(resolve_dots("/../x"), "/x");
        assert_eq!(resolve_dots("/a/.."), "/");
        assert_eq!(absolute_target("/dir/link", "../other/file"), "/other/file");
        assert_eq!(absolute_target("/dir/link", "/abs"), "/abs");
        assert_eq!(absolute_target("/link", "sibling"), "/sibling");
    }

    #[test]
    fn symlinks_resolve_to_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real"), b"data").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("alias")).unwrap();

        let folder = FolderMountSource::new(dir.path()).unwrap();
        let mut layer = LinkResolutionLayer::new(Box::new(folder));

        let info = layer.lookup("/alias", 0).unwrap().unwrap();
        assert!(!info.is_symlink());
        assert_eq!(info.size, 4);
        assert_eq!(layer.read(&info, 4, 0).unwrap(), b"data");
    }

    #[test]
    fn cycles_terminate() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("b", dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("b")).unwrap();

        let folder = FolderMountSource::new(dir.path()).unwrap();
        let mut layer = LinkResolutionLayer::new(Box::new(folder));

        // Terminates and returns the last hop's info instead of looping.
        let info = layer.lookup("/a", 0).unwrap().unwrap();
        assert!(info.is_symlink());
    }

    #[test]
    fn dangling_links_stay_visible() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("gone", dir.path().join("broken")).unwrap();

        let folder = FolderMountSource::new(dir.path()).unwrap();
        let mut layer = LinkResolutionLayer::new(Box::new(folder));
        let info = layer.lookup("/broken", 0).unwrap().unwrap();
        assert!(info.is_symlink());
    }
}

//! Union layer: several children merged into one tree.
//!
//! The rightmost child has the highest precedence, so `lookup(p)` returns
//! its entry when several children carry the same path.  Older entries
//! stay reachable as versions: the children's version sequences
//! concatenate, numbered from the leftmost child's oldest entry upward.
//!
//! A folder cache maps directories to the immutable children that contain
//! them, so lookups skip children that cannot match.  The cache build is
//! bounded three ways — depth, entries, and wall-clock seconds — because
//! any single bound can be defeated by a pathological tree (a hundred
//! thousand files in one folder blows the entry budget long before the
//! depth budget notices).

use std::collections::HashMap;
use std::time::Instant;

use crate::error::Result;
use crate::mountsource::{
    join_paths, normalize_path, root_file_info, FileInfo, Listing, ModeListing, MountSource,
    ResolvedSource, StatFs, Userdata,
};
use crate::stencil::SeekableSource;

pub const DEFAULT_MAX_CACHE_DEPTH: usize = 1024;
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 100_000;
pub const DEFAULT_MAX_CACHE_SECONDS: f64 = 60.0;

pub struct UnionMountSource {
    children:    Vec<Box<dyn MountSource>>,
    /// Folder path → indexes of immutable children containing it.
    folder_cache: HashMap<String, Vec<usize>>,
    cache_depth:  usize,
}

impl UnionMountSource {
    pub fn new(children: Vec<Box<dyn MountSource>>) -> Self {
        Self::with_bounds(
            children,
            DEFAULT_MAX_CACHE_DEPTH,
            DEFAULT_MAX_CACHE_ENTRIES,
            DEFAULT_MAX_CACHE_SECONDS,
        )
    }

    pub fn with_bounds(
        mut children: Vec<Box<dyn MountSource>>,
        max_depth:    usize,
        max_entries:  usize,
        max_seconds:  f64,
    ) -> Self {
        let mut this = Self {
            folder_cache: HashMap::new(),
            cache_depth:  0,
            children:     Vec::new(),
        };
        if children.len() > 1 {
            this.build_folder_cache(&mut children, max_depth, max_entries, max_seconds);
        }
        this.children = children;
        this
    }

    fn build_folder_cache(
        &mut self,
        children:    &mut [Box<dyn MountSource>],
        max_depth:   usize,
        max_entries: usize,
        max_seconds: f64,
    ) {
        let started = Instant::now();
        let immutable: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_immutable())
            .map(|(i, _)| i)
            .collect();
        self.folder_cache.insert("/".into(), immutable);

        let mut budget = max_entries;
        let mut last_level: Vec<String> = vec!["/".into()];

        for depth in 1..max_depth {
            let mut next_level: Vec<String> = Vec::new();
            for folder in &last_level {
                let child_indexes = self.folder_cache.get(folder).cloned().unwrap_or_default();
                for index in child_indexes {
                    let Ok(Some(listing)) = children[index].list_mode(folder) else { continue };
                    for (name, mode) in listing {
                        if started.elapsed().as_secs_f64() > max_seconds || budget == 0 {
                            log::info!(
                                "union folder cache stopped early at depth {} ({} folders cached)",
                                self.cache_depth,
                                self.folder_cache.len()
                            );
                            return;
                        }
                        if mode & 0o170000 != 0o040000 {
                            continue;
                        }
                        budget -= 1;
                        let full = join_paths(folder, &name);
                        let slot = self.folder_cache.entry(full.clone()).or_default();
                        if slot.is_empty() {
                            next_level.push(full);
                        }
                        if !slot.contains(&index) {
                            slot.push(index);
                        }
                    }
                }
            }
            if next_level.is_empty() {
                break;
            }
            self.cache_depth = depth;
            last_level = next_level;
        }
    }

    /// Children worth asking about `path`: mutable ones always, immutable
    /// ones only when the cache says the parent folder exists in them.
    fn candidates(&self, path: &str) -> Vec<usize> {
        let cached = if let Some(hit) = self.folder_cache.get(path) {
            Some(hit.clone())
        } else if self.cache_depth > 0 {
            // Look up the deepest cached ancestor instead.
            let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
            let take = parts.len().saturating_sub(1).min(self.cache_depth);
            let parent = if take == 0 {
                "/".to_string()
            } else {
                format!("/{}", parts[..take].join("/"))
            };
            self.folder_cache.get(&parent).cloned()
        } else {
            None
        };

        match cached {
            Some(hit) => (0..self.children.len())
                .filter(|i| !self.children[*i].is_immutable() || hit.contains(i))
                .collect(),
            None => (0..self.children.len()).collect(),
        }
    }
}

impl MountSource for UnionMountSource {
    fn is_immutable(&self) -> bool {
        self.children.iter().all(|c| c.is_immutable())
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Some(root_file_info(vec![Userdata::Synthetic])));
        }

        let candidates = self.candidates(&path);
        let mut version = version;

        if version <= 0 {
            // Newest-first: walk children right to left, shifting the
            // version by how many entries each child holds.
            for &index in candidates.iter().rev() {
                if let Some(info) = self.children[index].lookup(&path, version)? {
                    return Ok(Some(info.with_userdata(Userdata::Child(index))));
                }
                version += self.children[index].versions(&path)? as i64;
                if version > 0 {
                    break;
                }
            }
        } else {
            // Oldest-first: walk left to right.
            for &index in candidates.iter() {
                if let Some(info) = self.children[index].lookup(&path, version)? {
                    return Ok(Some(info.with_userdata(Userdata::Child(index))));
                }
                version -= self.children[index].versions(&path)? as i64;
                if version < 1 {
                    break;
                }
            }
        }
        Ok(None)
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        let mut total = 0;
        for child in &mut self.children {
            total += child.versions(path)?;
        }
        Ok(total)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        let mut merged: Option<Listing> = None;
        // Left to right: later (higher-precedence) children overwrite.
        for (index, child) in self.children.iter_mut().enumerate() {
            if let Some(listing) = child.list(path)? {
                let merged = merged.get_or_insert_with(Listing::new);
                for (name, info) in listing {
                    merged.insert(name, info.with_userdata(Userdata::Child(index)));
                }
            }
        }
        Ok(merged)
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        let mut merged: Option<ModeListing> = None;
        for child in self.children.iter_mut() {
            if let Some(listing) = child.list_mode(path)? {
                merged.get_or_insert_with(ModeListing::new).extend(listing);
            }
        }
        Ok(merged)
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Child(index) => self.children[index].open(&inner),
            _ => Err(crate::error::ArcError::Usage("cannot open the union root".into())),
        }
    }

    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Child(index) => self.children[index].read(&inner, size, offset),
            _ => Err(crate::error::ArcError::Usage("cannot read the union root".into())),
        }
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Child(index) => self.children[index].list_xattr(&inner),
            _ => Ok(Vec::new()),
        }
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Child(index) => self.children[index].get_xattr(&inner, key),
            _ => Ok(None),
        }
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            // All children are grafted at '/', so the inner mount point
            // needs no prefixing.
            Userdata::Child(index) => self.children[index].resolve(&inner),
            _ => Ok(ResolvedSource {
                mount_point: "/".into(),
                info:        info.clone(),
                host_path:   None,
            }),
        }
    }

    fn statfs(&mut self) -> StatFs {
        let stats: Vec<StatFs> = self.children.iter_mut().map(|c| c.statfs()).collect();
        crate::mountsource::merge_statfs(&stats)
    }

    fn teardown(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.teardown()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mountsource::folder::FolderMountSource;

    fn two_folders() -> (tempfile::TempDir, tempfile::TempDir, UnionMountSource) {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("ufo"), b"iriya in folder 1\n").unwrap();
        std::fs::write(a.path().join("only-a"), b"a").unwrap();
        std::fs::write(b.path().join("ufo"), b"iriya\n").unwrap();
        std::fs::write(b.path().join("only-b"), b"b").unwrap();
        let union = UnionMountSource::new(vec![
            Box::new(FolderMountSource::new(a.path()).unwrap()),
            Box::new(FolderMountSource::new(b.path()).unwrap()),
        ]);
        (a, b, union)
    }

    #[test]
    fn rightmost_wins() {
        let (_a, _b, mut union) = two_folders();
        let info = union.lookup("/ufo", 0).unwrap().unwrap();
        assert_eq!(union.read(&info, 64, 0).unwrap(), b"iriya\n");
    }

    #[test]
    fn versions_span_children() {
        let (_a, _b, mut union) = two_folders();
        assert_eq!(union.versions("/ufo").unwrap(), 2);

        // Version 1 = oldest = leftmost child's entry.
        let oldest = union.lookup("/ufo", 1).unwrap().unwrap();
        assert_eq!(union.read(&oldest, 64, 0).unwrap(), b"iriya in folder 1\n");

        // Version 2 = newest; same as version 0.
        let newest = union.lookup("/ufo", 2).unwrap().unwrap();
        assert_eq!(union.read(&newest, 64, 0).unwrap(), b"iriya\n");

        // Negative: -1 = second newest.
        let second = union.lookup("/ufo", -1).unwrap().unwrap();
        assert_eq!(union.read(&second, 64, 0).unwrap(), b"iriya in folder 1\n");
    }

    #[test]
    fn listings_merge() {
        let (_a, _b, mut union) = two_folders();
        let listing = union.list("/").unwrap().unwrap();
        let names: Vec<&String> = listing.keys().collect();
        assert_eq!(names, vec!["only-a", "only-b", "ufo"]);
    }

    #[test]
    fn miss_is_none() {
        let (_a, _b, mut union) = two_folders();
        assert!(union.lookup("/nothing", 0).unwrap().is_none());
        assert_eq!(union.versions("/nothing").unwrap(), 0);
        assert!(union.list("/nothing").unwrap().is_none());
    }
}

//! Auto-mount layer: files that are themselves archives get expanded in
//! place, recursively, up to a configurable depth.
//!
//! For every file it sees, the layer consults a cheap suffix predicate
//! (plus a split-part check for `foo.001`-style sets) before paying for a
//! real nested mount.  The nested mount is grafted at the file's own path,
//! optionally with the archive suffix stripped or a regex rewrite applied
//! to the mount point.
//!
//! Depth is bounded by summing one per crossed archive boundary; eager
//! mode expands everything at construction, lazy mode mounts on first
//! access.  Lazy mounting guards against re-entrant attempts on the same
//! path — the case where an index file is being written inside the tree
//! that is being walked.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::error::{ArcError, Result};
use crate::formats::detect::{collect_split_parts, split_first_part, strip_archive_suffix};
use crate::mountsource::{
    join_paths, normalize_path, FileInfo, Listing, ModeListing, MountSource, ResolvedSource,
    StatFs, Userdata,
};
use crate::stencil::{shared_source, JoinedFile, SeekableSource, SharedSource};

/// What the opener callback receives to mount a nested archive.
pub enum NestedInput {
    /// The archive is a real host file (cheapest: index files can be
    /// written next to it).
    HostFile(std::path::PathBuf),
    /// The archive lives inside another mount source.
    Stream {
        stream: SharedSource,
        size:   u64,
        name:   String,
    },
}

/// Mounts a nested archive, with `remaining_depth` recursion budget left
/// below it.  Injected by the factory to avoid a module cycle.
pub type NestedOpener =
    Box<dyn FnMut(NestedInput, u32) -> Result<Box<dyn MountSource>> + Send>;

#[derive(Clone)]
pub struct AutoMountOptions {
    pub max_depth:    u32,
    pub lazy:         bool,
    /// Strip the archive suffix from the mount point (`a.tar` → `a`).
    pub strip_suffix: bool,
    /// Regex rewrite applied to mount points: (pattern, replacement).
    pub transform:    Option<(String, String)>,
}

impl Default for AutoMountOptions {
    fn default() -> Self {
        Self { max_depth: 1, lazy: false, strip_suffix: false, transform: None }
    }
}

struct MountInfo {
    source:          Box<dyn MountSource>,
    root_info:       FileInfo,
    recursion_depth: u32,
}

pub struct AutoMountLayer {
    mounted:     HashMap<String, MountInfo>,
    options:     AutoMountOptions,
    transform:   Option<(Regex, String)>,
    opener:      NestedOpener,
    /// Paths currently being mounted; breaks lazy-mount re-entrancy.
    in_progress: HashSet<String>,
}

impl AutoMountLayer {
    pub fn new(
        root:    Box<dyn MountSource>,
        options: AutoMountOptions,
        opener:  NestedOpener,
    ) -> Result<Self> {
        let transform = match &options.transform {
            Some((pattern, replacement)) => Some((
                Regex::new(pattern).map_err(|e| {
                    ArcError::Usage(format!("bad mount-point transform regex: {e}"))
                })?,
                replacement.clone(),
            )),
            None => None,
        };

        let mut root_info = crate::mountsource::root_file_info(Vec::new());
        root_info.userdata.push(Userdata::MountPoint("/".into()));

        let mut layer = Self {
            mounted: HashMap::from([(
                "/".to_string(),
                MountInfo { source: root, root_info, recursion_depth: 0 },
            )]),
            options,
            transform,
            opener,
            in_progress: HashSet::new(),
        };

        if !layer.options.lazy {
            layer.mount_eagerly()?;
        }
        Ok(layer)
    }

    /// Breadth-first walk mounting every archive within the depth bound.
    fn mount_eagerly(&mut self) -> Result<()> {
        let mut folders = vec!["/".to_string()];
        while !folders.is_empty() {
            let mut next = Vec::new();
            for folder in folders {
                if self.recursion_depth(&folder)? > self.options.max_depth {
                    continue;
                }
                let Some(listing) = self.list_mode(&folder)? else { continue };
                for (name, mode) in listing {
                    let path = join_paths(&folder, &name);
                    if mode & 0o170000 == 0o040000 {
                        next.push(path);
                    } else if let Some(mount_point) = self.try_to_mount(&path)? {
                        next.push(mount_point);
                    }
                }
            }
            folders = next;
        }
        Ok(())
    }

    /// Longest mounted prefix of `path` and the path below it.  Never
    /// triggers new mounts.
    fn simply_find_mounted(&self, path: &str) -> (String, String) {
        let normalized = normalize_path(path);
        let mut left = normalized.clone();
        loop {
            if self.mounted.contains_key(&left) {
                let rest = &normalized[left.len()..];
                let rest = if rest.is_empty() { "/".to_string() } else { rest.to_string() };
                return (left, rest);
            }
            match left.rsplit_once('/') {
                Some(("", _)) | None => break,
                Some((parent, _)) => left = parent.to_string(),
            }
        }
        ("/".to_string(), normalized)
    }

    /// Archive boundaries crossed on the way to `path`.
    fn recursion_depth(&mut self, path: &str) -> Result<u32> {
        let (mount_point, inner) = self.simply_find_mounted(path);
        let info = self.mounted.get_mut(&mount_point).unwrap();
        let base = info.recursion_depth;
        let entry_depth = match info.source.lookup(&inner, 0)? {
            Some(found) => {
                1 + found
                    .userdata
                    .iter()
                    .filter_map(|token| match token {
                        Userdata::Entry(locator) => Some(locator.recursion_depth),
                        _ => None,
                    })
                    .sum::<u32>()
            }
            None => 0,
        };
        Ok(base + entry_depth)
    }

    /// Attempt to mount the file at `path`.  Returns the mount point on
    /// success; any failure is logged and swallowed so one broken nested
    /// archive never takes the tree down.
    fn try_to_mount(&mut self, path: &str) -> Result<Option<String>> {
        let path = normalize_path(path);
        if self.in_progress.contains(&path) {
            return Ok(None);
        }

        let recursion_depth = self.recursion_depth(&path)?;
        if recursion_depth > self.options.max_depth {
            return Ok(None);
        }

        let name = path.rsplit('/').next().unwrap_or("");
        let stripped = strip_archive_suffix(name);
        let is_split_first = stripped.is_none() && split_first_part(name).is_some();
        if stripped.is_none() && !is_split_first {
            return Ok(None);
        }

        // Mount-point shaping: optional suffix strip, optional rewrite.
        let mut mount_point = if self.options.strip_suffix {
            match stripped {
                Some(stem) => {
                    let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                    join_paths(if parent.is_empty() { "/" } else { parent }, stem)
                }
                None => path.clone(),
            }
        } else {
            path.clone()
        };
        if let Some((regex, replacement)) = &self.transform {
            mount_point = normalize_path(&regex.replace(&mount_point, replacement.as_str()));
        }
        if self.mounted.contains_key(&mount_point) {
            return Ok(None);
        }

        let (parent_mount, inner_path) = self.simply_find_mounted(&path);

        self.in_progress.insert(path.clone());
        let outcome = self.mount_inner(&path, &parent_mount, &inner_path, &mount_point,
                                       is_split_first, recursion_depth);
        self.in_progress.remove(&path);

        match outcome {
            Ok(mounted) => Ok(mounted),
            Err(error) => {
                log::warn!("mounting of {path} failed: {error}");
                Ok(None)
            }
        }
    }

    fn mount_inner(
        &mut self,
        path:            &str,
        parent_mount:    &str,
        inner_path:      &str,
        mount_point:     &str,
        is_split_first:  bool,
        recursion_depth: u32,
    ) -> Result<Option<String>> {
        let parent = self.mounted.get_mut(parent_mount).unwrap();
        let Some(archive_info) = parent.source.lookup(inner_path, 0)? else {
            return Ok(None);
        };
        // Entries a recursive indexer already expanded must not be
        // mounted a second time.
        if archive_info.userdata.iter().any(|token| {
            matches!(token, Userdata::Entry(locator)
                if locator.is_archive && locator.recursion_depth > 0)
        }) {
            return Ok(None);
        }

        let name = path.rsplit('/').next().unwrap_or("").to_string();
        let remaining = self.options.max_depth.saturating_sub(recursion_depth);

        let input = if is_split_first {
            // Expensive check last: list the folder and join the parts.
            let folder = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            let folder = if folder.is_empty() { "/" } else { folder };
            let (_, folder_inner) = self.simply_find_mounted(folder);
            let parent = self.mounted.get_mut(parent_mount).unwrap();
            let Some(listing) = parent.source.list_mode(&folder_inner)? else {
                return Ok(None);
            };
            let siblings: Vec<String> = listing.into_keys().collect();
            let Some(parts) = collect_split_parts(&name, &siblings) else {
                return Ok(None);
            };
            let mut streams = Vec::new();
            for part in &parts {
                let part_path = join_paths(&folder_inner, part);
                let info = parent.source.lookup(&part_path, 0)?.ok_or_else(|| {
                    ArcError::Usage(format!("split part {part_path} vanished"))
                })?;
                streams.push(shared_source_from_box(parent.source.open(&info)?));
            }
            let joined = JoinedFile::new(streams)?;
            let size = joined.size();
            NestedInput::Stream {
                stream: shared_source(joined),
                size,
                name: name.clone(),
            }
        } else {
            let parent = self.mounted.get_mut(parent_mount).unwrap();
            let resolved = parent.source.resolve(&archive_info)?;
            match resolved.host_path {
                // Host files open by path so nested index files can be
                // written beside them.
                Some(host_path) => NestedInput::HostFile(host_path),
                None => {
                    let stream = shared_source_from_box(parent.source.open(&archive_info)?);
                    NestedInput::Stream { stream, size: archive_info.size, name: name.clone() }
                }
            }
        };

        let source = (self.opener)(input, remaining)?;

        let mut root_info = archive_info.clone();
        root_info.mode = (root_info.mode & 0o777) | 0o040000;
        root_info.linkname.clear();
        root_info.userdata = vec![Userdata::MountPoint(mount_point.to_string())];

        self.mounted.insert(
            mount_point.to_string(),
            MountInfo { source, root_info, recursion_depth },
        );
        log::info!("recursively mounted {mount_point}");
        Ok(Some(mount_point.to_string()))
    }

    /// Like [`Self::simply_find_mounted`], but in lazy mode first tries to
    /// mount every ancestor component.
    fn find_mounted(&mut self, path: &str) -> Result<(String, String)> {
        if self.options.lazy && self.options.max_depth > 0 {
            let normalized = normalize_path(path);
            let mut sub_path = String::new();
            for part in normalized.trim_matches('/').split('/') {
                if part.is_empty() {
                    continue;
                }
                sub_path = join_paths(&sub_path, part);
                if self.recursion_depth(&sub_path)? > self.options.max_depth {
                    break;
                }
                if !self.mounted.contains_key(&sub_path) {
                    self.try_to_mount(&sub_path)?;
                }
            }
        }
        Ok(self.simply_find_mounted(path))
    }

    /// Overlay mount points onto a directory listing; a mounted archive
    /// file shows up as a directory.
    fn append_mount_points(&self, folder: &str, listing: &mut Listing) {
        for (mount_point, info) in &self.mounted {
            if mount_point == "/" {
                continue;
            }
            let Some((parent, name)) = mount_point.rsplit_once('/') else { continue };
            let parent = if parent.is_empty() { "/" } else { parent };
            if parent == folder && !name.is_empty() {
                listing.insert(name.to_string(), info.root_info.clone());
            }
        }
    }
}

fn shared_source_from_box(stream: Box<dyn SeekableSource>) -> SharedSource {
    std::sync::Arc::new(std::sync::Mutex::new(stream))
}

impl MountSource for AutoMountLayer {
    fn is_immutable(&self) -> bool {
        self.mounted["/"].source.is_immutable()
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        let (mount_point, inner) = self.find_mounted(path)?;
        let path = normalize_path(path);

        // A mount-point root has versions from two worlds: the archive
        // file in the outer tree and the mounted root itself.
        let original_versions = if mount_point != "/" && inner == "/" {
            self.mounted.get_mut("/").unwrap().source.versions(&path)? as i64
        } else {
            0
        };

        let total = self.versions(&path)? as i64;
        let version = if total > 1 {
            ((version - 1).rem_euclid(total) + 1) % total
        } else {
            version
        };

        if version == 0 && inner == "/" {
            return Ok(Some(self.mounted[&mount_point].root_info.clone()));
        }

        if total <= 1 || inner != "/" || version == 0 || version > original_versions {
            let info = self
                .mounted
                .get_mut(&mount_point)
                .unwrap()
                .source
                .lookup(&inner, version - original_versions)?;
            return Ok(info.map(|i| i.with_userdata(Userdata::MountPoint(mount_point))));
        }

        // Remaining case: one of the outer tree's versions of the archive
        // file itself.
        let info = self
            .mounted
            .get_mut("/")
            .unwrap()
            .source
            .lookup(&path, version % original_versions)?;
        Ok(info.map(|i| i.with_userdata(Userdata::MountPoint("/".to_string()))))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        let (mount_point, inner) = self.simply_find_mounted(path);
        let mut total = self
            .mounted
            .get_mut(&mount_point)
            .unwrap()
            .source
            .versions(&inner)?;
        if mount_point != "/" && inner == "/" {
            total += self.mounted.get_mut("/").unwrap().source.versions(path)?;
        }
        Ok(total)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        let (mount_point, inner) = self.find_mounted(path)?;
        let listing = self.mounted.get_mut(&mount_point).unwrap().source.list(&inner)?;
        Ok(listing.map(|mut listing| {
            for info in listing.values_mut() {
                info.userdata.push(Userdata::MountPoint(mount_point.clone()));
            }
            self.append_mount_points(&normalize_path(path), &mut listing);
            listing
        }))
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        let (mount_point, inner) = self.find_mounted(path)?;
        let listing = self.mounted.get_mut(&mount_point).unwrap().source.list_mode(&inner)?;
        Ok(listing.map(|mut listing| {
            let folder = normalize_path(path);
            for (point, info) in &self.mounted {
                if point == "/" {
                    continue;
                }
                if let Some((parent, name)) = point.rsplit_once('/') {
                    let parent = if parent.is_empty() { "/" } else { parent };
                    if parent == folder && !name.is_empty() {
                        listing.insert(name.to_string(), info.root_info.mode);
                    }
                }
            }
            listing
        }))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, inner) = info.pop_userdata()?;
        let Userdata::MountPoint(mount_point) = token else {
            return Err(ArcError::Usage("not an auto-mount entry".into()));
        };
        self.mounted
            .get_mut(&mount_point)
            .ok_or_else(|| ArcError::Usage(format!("mount point {mount_point} vanished")))?
            .source
            .open(&inner)
    }

    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        let (token, inner) = info.pop_userdata()?;
        let Userdata::MountPoint(mount_point) = token else {
            return Err(ArcError::Usage("not an auto-mount entry".into()));
        };
        self.mounted
            .get_mut(&mount_point)
            .ok_or_else(|| ArcError::Usage(format!("mount point {mount_point} vanished")))?
            .source
            .read(&inner, size, offset)
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::MountPoint(mount_point) if !inner.userdata.is_empty() => {
                match self.mounted.get_mut(&mount_point) {
                    Some(mount) => mount.source.list_xattr(&inner),
                    None => Ok(Vec::new()),
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::MountPoint(mount_point) if !inner.userdata.is_empty() => {
                match self.mounted.get_mut(&mount_point) {
                    Some(mount) => mount.source.get_xattr(&inner, key),
                    None => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        let (token, inner) = info.pop_userdata()?;
        let Userdata::MountPoint(mount_point) = token else {
            return Ok(ResolvedSource {
                mount_point: "/".into(),
                info:        info.clone(),
                host_path:   None,
            });
        };
        let mount = self
            .mounted
            .get_mut(&mount_point)
            .ok_or_else(|| ArcError::Usage(format!("mount point {mount_point} vanished")))?;
        let mut resolved = mount.source.resolve(&inner)?;
        resolved.mount_point = join_paths(&mount_point, resolved.mount_point.trim_start_matches('/'));
        Ok(resolved)
    }

    fn statfs(&mut self) -> StatFs {
        let stats: Vec<StatFs> =
            self.mounted.values_mut().map(|m| m.source.statfs()).collect();
        crate::mountsource::merge_statfs(&stats)
    }

    fn teardown(&mut self) -> Result<()> {
        for mount in self.mounted.values_mut() {
            mount.source.teardown()?;
        }
        Ok(())
    }
}

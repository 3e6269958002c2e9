//! Subvolumes layer: each child mounted under `/<name>/…`.
//!
//! Unlike the union layer this one is mutable — subvolumes can be mounted
//! and unmounted while the tree is live, so `is_immutable` is false and
//! nothing above may cache through it.

use std::collections::BTreeMap;

use crate::error::{ArcError, Result};
use crate::mountsource::{
    normalize_path, root_file_info, FileInfo, Listing, ModeListing, MountSource, ResolvedSource,
    StatFs, Userdata,
};
use crate::stencil::SeekableSource;

pub struct SubvolumesMountSource {
    subvolumes: BTreeMap<String, Box<dyn MountSource>>,
}

impl SubvolumesMountSource {
    pub fn new() -> Self {
        Self { subvolumes: BTreeMap::new() }
    }

    pub fn mount(&mut self, name: &str, source: Box<dyn MountSource>) -> Result<()> {
        let name = name.trim_matches('/').to_string();
        if name.is_empty() || name.contains('/') {
            return Err(ArcError::Usage(format!(
                "subvolume names must be plain folder names, got {name:?}"
            )));
        }
        if self.subvolumes.contains_key(&name) {
            return Err(ArcError::Usage(format!("subvolume {name} is already mounted")));
        }
        self.subvolumes.insert(name, source);
        Ok(())
    }

    pub fn unmount(&mut self, name: &str) -> Option<Box<dyn MountSource>> {
        self.subvolumes.remove(name.trim_matches('/'))
    }

    /// Split `/name/rest` into the owning subvolume and the inner path.
    fn split(&self, path: &str) -> Option<(String, String)> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let (name, rest) = match trimmed.split_once('/') {
            Some((name, rest)) => (name, format!("/{rest}")),
            None => (trimmed, "/".to_string()),
        };
        self.subvolumes
            .contains_key(name)
            .then(|| (name.to_string(), rest))
    }

    fn subvolume_root_info(&self, name: &str) -> FileInfo {
        root_file_info(vec![Userdata::Subvolume(name.to_string())])
    }
}

impl Default for SubvolumesMountSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MountSource for SubvolumesMountSource {
    fn is_immutable(&self) -> bool {
        false
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Some(root_file_info(vec![Userdata::Synthetic])));
        }
        let Some((name, rest)) = self.split(&path) else {
            return Ok(None);
        };
        if rest == "/" && !(-1..=1).contains(&version) {
            return Ok(None);
        }
        let source = self.subvolumes.get_mut(&name).unwrap();
        Ok(source
            .lookup(&rest, version)?
            .map(|info| info.with_userdata(Userdata::Subvolume(name))))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(1);
        }
        let Some((name, rest)) = self.split(&path) else {
            return Ok(0);
        };
        self.subvolumes.get_mut(&name).unwrap().versions(&rest)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        let path = normalize_path(path);
        if path == "/" {
            let listing = self
                .subvolumes
                .keys()
                .map(|name| (name.clone(), self.subvolume_root_info(name)))
                .collect();
            return Ok(Some(listing));
        }
        let Some((name, rest)) = self.split(&path) else {
            return Ok(None);
        };
        Ok(self.subvolumes.get_mut(&name).unwrap().list(&rest)?.map(|listing| {
            listing
                .into_iter()
                .map(|(child, info)| (child, info.with_userdata(Userdata::Subvolume(name.clone()))))
                .collect()
        }))
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Some(
                self.subvolumes.keys().map(|name| (name.clone(), 0o040555)).collect(),
            ));
        }
        let Some((name, rest)) = self.split(&path) else {
            return Ok(None);
        };
        self.subvolumes.get_mut(&name).unwrap().list_mode(&rest)
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Subvolume(name) => self
                .subvolumes
                .get_mut(&name)
                .ok_or_else(|| ArcError::Usage(format!("subvolume {name} was unmounted")))?
                .open(&inner),
            _ => Err(ArcError::Usage("cannot open the subvolume root".into())),
        }
    }

    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Subvolume(name) => self
                .subvolumes
                .get_mut(&name)
                .ok_or_else(|| ArcError::Usage(format!("subvolume {name} was unmounted")))?
                .read(&inner, size, offset),
            _ => Err(ArcError::Usage("cannot read the subvolume root".into())),
        }
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Subvolume(name) => match self.subvolumes.get_mut(&name) {
                Some(source) => source.list_xattr(&inner),
                None => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Subvolume(name) => match self.subvolumes.get_mut(&name) {
                Some(source) => source.get_xattr(&inner, key),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        let (token, inner) = info.pop_userdata()?;
        match token {
            Userdata::Subvolume(name) => {
                let source = self
                    .subvolumes
                    .get_mut(&name)
                    .ok_or_else(|| ArcError::Usage(format!("subvolume {name} was unmounted")))?;
                let mut resolved = source.resolve(&inner)?;
                resolved.mount_point =
                    crate::mountsource::join_paths(&format!("/{name}"), &resolved.mount_point);
                Ok(resolved)
            }
            _ => Ok(ResolvedSource {
                mount_point: "/".into(),
                info:        info.clone(),
                host_path:   None,
            }),
        }
    }

    fn statfs(&mut self) -> StatFs {
        let stats: Vec<StatFs> = self.subvolumes.values_mut().map(|s| s.statfs()).collect();
        crate::mountsource::merge_statfs(&stats)
    }

    fn teardown(&mut self) -> Result<()> {
        for source in self.subvolumes.values_mut() {
            source.teardown()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mountsource::singlefile::SingleFileMountSource;
    use crate::stencil::shared_buffer;

    fn single(name: &str, data: &[u8]) -> Box<dyn MountSource> {
        Box::new(
            SingleFileMountSource::new(name, shared_buffer(data.to_vec()), data.len() as u64, 0.0)
                .unwrap(),
        )
    }

    #[test]
    fn mounts_appear_under_names() {
        let mut subvolumes = SubvolumesMountSource::new();
        subvolumes.mount("first", single("data", b"one")).unwrap();
        subvolumes.mount("second", single("data", b"two")).unwrap();

        let root = subvolumes.list("/").unwrap().unwrap();
        assert_eq!(root.keys().collect::<Vec<_>>(), vec!["first", "second"]);

        let info = subvolumes.lookup("/second/data", 0).unwrap().unwrap();
        assert_eq!(subvolumes.read(&info, 3, 0).unwrap(), b"two");
        assert!(subvolumes.lookup("/third/data", 0).unwrap().is_none());
    }

    #[test]
    fn runtime_unmount() {
        let mut subvolumes = SubvolumesMountSource::new();
        subvolumes.mount("vol", single("f", b"x")).unwrap();
        assert!(subvolumes.lookup("/vol", 0).unwrap().is_some());
        assert!(subvolumes.unmount("vol").is_some());
        assert!(subvolumes.lookup("/vol", 0).unwrap().is_none());
        assert!(!subvolumes.is_immutable());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut subvolumes = SubvolumesMountSource::new();
        subvolumes.mount("a", single("f", b"")).unwrap();
        assert!(subvolumes.mount("a", single("g", b"")).is_err());
        assert!(subvolumes.mount("a/b", single("g", b"")).is_err());
    }
}

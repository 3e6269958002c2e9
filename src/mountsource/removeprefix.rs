//! Remove-prefix layer: moves a mount source into a virtual subfolder by
//! stripping a constant prefix from every incoming path.
//!
//! With prefix `/sub/dir`, a request for `/sub/dir/x` delegates `/x`; the
//! intermediate components `/sub` and `/sub/dir` answer as synthetic
//! directories owned by this layer.

use crate::error::{ArcError, Result};
use crate::mountsource::{
    normalize_path, root_file_info, FileInfo, Listing, ModeListing, MountSource, ResolvedSource,
    StatFs, Userdata,
};
use crate::stencil::SeekableSource;

pub struct RemovePrefixMountSource {
    /// Normalized, with trailing slash, e.g. `/sub/dir/`.
    prefix: String,
    child:  Box<dyn MountSource>,
}

enum Parsed {
    /// Path is inside the prefix; delegate this inner path.
    Inner(String),
    /// Path is an ancestor of the prefix; the next component is returned.
    Ancestor(String),
    Outside,
}

impl RemovePrefixMountSource {
    pub fn new(prefix: &str, child: Box<dyn MountSource>) -> Result<Self> {
        let normalized = normalize_path(prefix);
        if normalized == "/" {
            return Err(ArcError::Usage("an empty prefix strips nothing".into()));
        }
        Ok(Self { prefix: format!("{normalized}/"), child })
    }

    fn parse(&self, path: &str) -> Parsed {
        let mut padded = normalize_path(path);
        if !padded.ends_with('/') {
            padded.push('/');
        }
        if padded.starts_with(&self.prefix) {
            let inner = &padded[self.prefix.len() - 1..padded.len() - 1];
            return Parsed::Inner(if inner.is_empty() { "/".into() } else { inner.into() });
        }
        if self.prefix.starts_with(&padded) {
            let next = self.prefix[padded.len()..]
                .split('/')
                .next()
                .unwrap_or("")
                .to_string();
            return Parsed::Ancestor(next);
        }
        Parsed::Outside
    }

    fn synthetic_dir(&self) -> FileInfo {
        root_file_info(vec![Userdata::Synthetic])
    }
}

impl MountSource for RemovePrefixMountSource {
    fn is_immutable(&self) -> bool {
        self.child.is_immutable()
    }

    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        match self.parse(path) {
            Parsed::Inner(inner) => self.child.lookup(&inner, version),
            Parsed::Ancestor(_) if (-1..=1).contains(&version) && version != -1 => {
                Ok(Some(self.synthetic_dir()))
            }
            _ => Ok(None),
        }
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        match self.parse(path) {
            Parsed::Inner(inner) => self.child.versions(&inner),
            Parsed::Ancestor(_) => Ok(1),
            Parsed::Outside => Ok(0),
        }
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        match self.parse(path) {
            Parsed::Inner(inner) => self.child.list(&inner),
            Parsed::Ancestor(next) => {
                let mut listing = Listing::new();
                listing.insert(next, self.synthetic_dir());
                Ok(Some(listing))
            }
            Parsed::Outside => Ok(None),
        }
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        match self.parse(path) {
            Parsed::Inner(inner) => self.child.list_mode(&inner),
            Parsed::Ancestor(next) => {
                let mut listing = ModeListing::new();
                listing.insert(next, 0o040555);
                Ok(Some(listing))
            }
            Parsed::Outside => Ok(None),
        }
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        if info.userdata.last() == Some(&Userdata::Synthetic) {
            return Err(ArcError::Usage("cannot open a synthetic prefix directory".into()));
        }
        self.child.open(info)
    }

    fn read(&mut self, info: &FileInfo, size: usize, offset: u64) -> Result<Vec<u8>> {
        if info.userdata.last() == Some(&Userdata::Synthetic) {
            return Err(ArcError::Usage("cannot read a synthetic prefix directory".into()));
        }
        self.child.read(info, size, offset)
    }

    fn list_xattr(&mut self, info: &FileInfo) -> Result<Vec<String>> {
        if info.userdata.last() == Some(&Userdata::Synthetic) {
            return Ok(Vec::new());
        }
        self.child.list_xattr(info)
    }

    fn get_xattr(&mut self, info: &FileInfo, key: &str) -> Result<Option<Vec<u8>>> {
        if info.userdata.last() == Some(&Userdata::Synthetic) {
            return Ok(None);
        }
        self.child.get_xattr(info, key)
    }

    fn resolve(&mut self, info: &FileInfo) -> Result<ResolvedSource> {
        if info.userdata.last() == Some(&Userdata::Synthetic) {
            return Ok(ResolvedSource {
                mount_point: "/".into(),
                info:        info.clone(),
                host_path:   None,
            });
        }
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
    use crate::mountsource::singlefile::SingleFileMountSource;
    use crate::stencil::shared_buffer;

    fn layer() -> RemovePrefixMountSource {
        let inner =
            SingleFileMountSource::new("data", shared_buffer(b"payload".to_vec()), 7, 0.0).unwrap();
        RemovePrefixMountSource::new("/sub/dir", Box::new(inner)).unwrap()
    }

    #[test]
    fn inner_paths_are_stripped() {
        let mut source = layer();
        let info = source.lookup("/sub/dir/data", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 7, 0).unwrap(), b"payload");
        assert!(source.lookup("/sub/other", 0).unwrap().is_none());
    }

    #[test]
    fn ancestors_are_synthesized() {
        let mut source = layer();
        assert!(source.lookup("/sub", 0).unwrap().unwrap().is_dir());
        let listing = source.list("/sub").unwrap().unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["dir"]);
        let root = source.list("/").unwrap().unwrap();
        assert_eq!(root.keys().collect::<Vec<_>>(), vec!["sub"]);
    }

    #[test]
    fn outside_misses() {
        let mut source = layer();
        assert!(source.list("/unrelated").unwrap().is_none());
        assert_eq!(source.versions("/unrelated").unwrap(), 0);
        assert_eq!(source.versions("/sub").unwrap(), 1);
    }
}

//! One byte stream exposed as a single file at the root.
//!
//! Used for raw compressed streams (`foo.gz` mounts as `/foo`) and for
//! joined split files handed to nested mounts.

use std::sync::Arc;

use crate::error::{ArcError, Result};
use crate::mountsource::{
    normalize_path, root_file_info, FileInfo, Listing, MountSource, StatFs, Userdata,
};
use crate::stencil::{SeekableSource, SharedSource, Stencil, StenciledFile};

pub struct SingleFileMountSource {
    name:   String,
    stream: SharedSource,
    size:   u64,
    mtime:  f64,
}

impl SingleFileMountSource {
    pub fn new(name: &str, stream: SharedSource, size: u64, mtime: f64) -> Result<Self> {
        let name = name.trim_matches('/').to_string();
        if name.is_empty() || name.contains('/') {
            return Err(ArcError::Usage(format!(
                "single-file mounts need a plain file name, got {name:?}"
            )));
        }
        Ok(Self { name, stream, size, mtime })
    }

    fn file_info(&self) -> FileInfo {
        FileInfo {
            size:     self.size,
            mtime:    self.mtime,
            mode:     0o100444,
            linkname: String::new(),
            uid:      0,
            gid:      0,
            userdata: vec![Userdata::Synthetic],
        }
    }
}

impl MountSource for SingleFileMountSource {
    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        if !(-1..=1).contains(&version) {
            return Ok(None);
        }
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Some(root_file_info(vec![Userdata::Synthetic])));
        }
        if version == -1 {
            return Ok(None);
        }
        Ok((path.trim_start_matches('/') == self.name).then(|| self.file_info()))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        Ok((normalize_path(path).trim_start_matches('/') == self.name) as u32)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        if normalize_path(path) != "/" {
            return Ok(None);
        }
        let mut listing = Listing::new();
        listing.insert(self.name.clone(), self.file_info());
        Ok(Some(listing))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        if info.is_dir() {
            return Err(ArcError::Usage("cannot open a directory".into()));
        }
        Ok(Box::new(StenciledFile::new(vec![Stencil::new(
            Arc::clone(&self.stream),
            0,
            self.size,
        )])))
    }

    fn statfs(&mut self) -> StatFs {
        StatFs { files: 1, blocks: self.size / (256 * 1024) + 1, ..StatFs::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stencil::shared_buffer;

    #[test]
    fn exposes_one_file() {
        let mut source =
            SingleFileMountSource::new("foo", shared_buffer(b"payload".to_vec()), 7, 3.0).unwrap();
        let listing = source.list("/").unwrap().unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["foo"]);

        let info = source.lookup("/foo", 0).unwrap().unwrap();
        assert_eq!(info.size, 7);
        assert_eq!(source.read(&info, 7, 0).unwrap(), b"payload");
        assert!(source.lookup("/bar", 0).unwrap().is_none());
        assert!(source.list("/foo").unwrap().is_none());
    }

    #[test]
    fn rejects_nested_names() {
        assert!(SingleFileMountSource::new("a/b", shared_buffer(vec![]), 0, 0.0).is_err());
        assert!(SingleFileMountSource::new("", shared_buffer(vec![]), 0, 0.0).is_err());
    }
}

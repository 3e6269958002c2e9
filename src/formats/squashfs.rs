//! SquashFS backend, on top of `backhand`.
//!
//! The library parses the superblock, inode and directory tables; this
//! wrapper flattens its node tree into the common table-of-contents shape
//! and serves file payloads by decompressing them through the library's
//! per-file reader.

use std::collections::BTreeMap;
use std::io::Read;

use backhand::{FilesystemReader, InnerNode, Squashfs};

use crate::error::{ArcError, Result};
use crate::index::FileKind;
use crate::mountsource::{
    normalize_path, EntryLocator, FileInfo, Listing, MountSource, StatFs, Userdata,
};
use crate::stencil::{shared_buffer, SeekableSource, SharedSource, Stencil, StenciledFile};

struct TocEntry {
    mode:     u32,
    mtime:    f64,
    uid:      u32,
    gid:      u32,
    size:     u64,
    linkname: String,
    kind:     FileKind,
}

pub struct SquashfsMountSource {
    fs:    FilesystemReader<'static>,
    toc:   BTreeMap<String, TocEntry>,
    files: u64,
}

impl SquashfsMountSource {
    /// Open from a shared byte source (the stream is wrapped in a stencil
    /// view so nested squashfs images work too).
    pub fn open(stream: SharedSource, stream_size: u64) -> Result<Self> {
        let view = std::io::BufReader::new(StenciledFile::new(vec![Stencil::new(
            stream,
            0,
            stream_size,
        )]));
        let squashfs = Squashfs::from_reader(view).map_err(|e| ArcError::Format {
            offset: 0,
            message: format!("squashfs superblock: {e}"),
        })?;
        let fs = squashfs.into_filesystem_reader().map_err(|e| ArcError::Format {
            offset: 0,
            message: format!("squashfs tables: {e}"),
        })?;

        let mut toc = BTreeMap::new();
        let mut files = 0u64;
        for node in fs.files() {
            let full = normalize_path(&node.fullpath.to_string_lossy());
            if full == "/" {
                continue;
            }
            let header = node.header;
            let (kind, size, linkname) = match &node.inner {
                InnerNode::File(file) => {
                    (FileKind::Regular, file.basic.file_size as u64, String::new())
                }
                InnerNode::Symlink(link) => {
                    (FileKind::Symlink, 0, link.link.to_string_lossy().into_owned())
                }
                InnerNode::Dir(_) => (FileKind::Directory, 0, String::new()),
                InnerNode::CharacterDevice(_) => (FileKind::CharDevice, 0, String::new()),
                InnerNode::BlockDevice(_) => (FileKind::BlockDevice, 0, String::new()),
                InnerNode::NamedPipe => (FileKind::Fifo, 0, String::new()),
                InnerNode::Socket => (FileKind::Socket, 0, String::new()),
            };
            if kind == FileKind::Regular {
                files += 1;
            }
            toc.insert(full, TocEntry {
                mode:     header.permissions as u32,
                mtime:    header.mtime as f64,
                uid:      header.uid as u32,
                gid:      header.gid as u32,
                size,
                linkname,
                kind,
            });
        }

        Ok(Self { fs, toc, files })
    }

    fn info_for(&self, path: &str, entry: &TocEntry) -> FileInfo {
        let type_bits = match entry.kind {
            FileKind::Directory   => 0o040000,
            FileKind::Symlink     => 0o120000,
            FileKind::CharDevice  => 0o020000,
            FileKind::BlockDevice => 0o060000,
            _                     => 0o100000,
        };
        FileInfo {
            size:     entry.size,
            mtime:    entry.mtime,
            mode:     type_bits | (entry.mode & 0o7777),
            linkname: entry.linkname.clone(),
            uid:      entry.uid,
            gid:      entry.gid,
            userdata: vec![Userdata::Entry(EntryLocator {
                path:            path.to_string(),
                header_offset:   0,
                offset:          0,
                size:            entry.size,
                kind:            entry.kind,
                is_sparse:       false,
                is_archive:      false,
                recursion_depth: 0,
            })],
        }
    }

    fn payload(&self, path: &str) -> Result<Vec<u8>> {
        for node in self.fs.files() {
            if normalize_path(&node.fullpath.to_string_lossy()) != path {
                continue;
            }
            let InnerNode::File(file) = &node.inner else {
                return Err(ArcError::Usage("not a regular squashfs file".into()));
            };
            let reader_file = self.fs.file(&file.basic);
            let mut buf_read = vec![0u8; self.fs.block_size as usize];
            let mut buf_decompress = Vec::new();
            let mut reader = reader_file.reader(&mut buf_read, &mut buf_decompress);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).map_err(|e| ArcError::CorruptBlock {
                codec:   "squashfs",
                offset:  0,
                message: format!("{path}: {e}"),
            })?;
            return Ok(out);
        }
        Err(ArcError::Format {
            offset:  0,
            message: format!("squashfs entry {path} vanished"),
        })
    }
}

impl MountSource for SquashfsMountSource {
    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        if !(-1..=1).contains(&version) {
            return Ok(None);
        }
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Some(crate::mountsource::root_file_info(vec![Userdata::Synthetic])));
        }
        if version == -1 {
            return Ok(None);
        }
        Ok(self.toc.get(&path).map(|entry| self.info_for(&path, entry)))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        Ok(self.toc.contains_key(&normalize_path(path)) as u32)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        let dir = normalize_path(path);
        if dir != "/" {
            match self.toc.get(&dir) {
                Some(entry) if entry.kind == FileKind::Directory => {}
                _ => return Ok(None),
            }
        }
        let prefix = if dir == "/" { String::from("/") } else { format!("{dir}/") };
        let mut listing = Listing::new();
        for (path, entry) in self.toc.range(prefix.clone()..) {
            let Some(rest) = path.strip_prefix(&prefix) else { break };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            listing.insert(rest.to_string(), self.info_for(path, entry));
        }
        Ok(Some(listing))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, _) = info.pop_userdata()?;
        let Userdata::Entry(locator) = token else {
            return Err(ArcError::Usage("not a squashfs entry".into()));
        };
        let data = self.payload(&locator.path)?;
        let size = data.len() as u64;
        Ok(Box::new(StenciledFile::new(vec![Stencil::new(shared_buffer(data), 0, size)])))
    }

    fn statfs(&mut self) -> StatFs {
        StatFs { files: self.files, ..StatFs::default() }
    }
}

// Tests for this backend live in the integration suite; creating images
// needs the library's writer, which the unit scope here does not pull in.

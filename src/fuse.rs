//! The FUSE adapter: VFS callbacks mapped onto mount-source operations.
//!
//! `fuser` addresses files by inode, the mount-source contract by path, so
//! the adapter owns the translation table (root = 1, monotonically
//! assigned, never recycled while mounted) next to a 64-bit file-handle
//! table and the root stat cached at init.
//!
//! Write handling is deliberately lazy: `open` with write flags does NOT
//! copy the file up — many editors open read-write but never write.  The
//! handle starts as a read stream plus the recorded flags; the first
//! actual `write` closes it, copies up through the overlay, reopens the
//! host file, and swaps the handle in place.
//!
//! The session is single-threaded by mandate: the index connection is
//! used only from this thread, and any worker pools live inside the
//! codec readers, joined before their calls return.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};

use crate::error::{ArcError, Result};
use crate::mountsource::{join_paths, FileInfo, MountSource, StatFs};
use crate::overlay::WriteOverlay;
use crate::stencil::SeekableSource;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Kernel-visible block size; large on purpose to steer clients toward
/// big reads — every call pays the full layer-stack overhead.
pub const BLOCK_SIZE: u32 = 256 * 1024;

// ── Mounted tree ──────────────────────────────────────────────────────────────

/// The tree under the adapter: plain read-only, or wrapped in a write
/// overlay whose write operations the adapter drives directly.
pub enum MountedTree {
    ReadOnly(Box<dyn MountSource>),
    Writable(WriteOverlay),
}

impl MountedTree {
    fn source(&mut self) -> &mut dyn MountSource {
        match self {
            MountedTree::ReadOnly(source) => source.as_mut(),
            MountedTree::Writable(overlay) => overlay,
        }
    }

    fn overlay(&mut self) -> Option<&mut WriteOverlay> {
        match self {
            MountedTree::Writable(overlay) => Some(overlay),
            MountedTree::ReadOnly(_) => None,
        }
    }
}

// ── File handles ──────────────────────────────────────────────────────────────

enum Handle {
    /// Read stream over the mount source.  `write_intent` records the
    /// open flags so the first write can trigger the copy-up.
    Stream {
        stream:       Box<dyn SeekableSource>,
        path:         String,
        write_intent: bool,
    },
    /// Host file in the overlay folder (post copy-up or fresh creation).
    Host(std::fs::File),
}

// ── The adapter ───────────────────────────────────────────────────────────────

pub struct FuseOperations {
    tree:        MountedTree,
    inode_paths: HashMap<u64, String>,
    path_inodes: HashMap<String, u64>,
    next_inode:  u64,
    handles:     HashMap<u64, Handle>,
    next_handle: u64,
    /// Cached at init; the root never changes for the mount's lifetime.
    root_attr:   FileAttr,
    mount_uid:   u32,
    mount_gid:   u32,
}

fn errno_of(error: &ArcError) -> i32 {
    error.errno()
}

fn timestamp(mtime: f64) -> SystemTime {
    if mtime <= 0.0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs_f64(mtime)
    }
}

fn file_type_of(mode: u32) -> FileType {
    match mode & 0o170000 {
        0o040000 => FileType::Directory,
        0o120000 => FileType::Symlink,
        0o020000 => FileType::CharDevice,
        0o060000 => FileType::BlockDevice,
        0o010000 => FileType::NamedPipe,
        0o140000 => FileType::Socket,
        _        => FileType::RegularFile,
    }
}

impl FuseOperations {
    pub fn new(tree: MountedTree) -> Self {
        let mount_uid = unsafe { libc::getuid() };
        let mount_gid = unsafe { libc::getgid() };
        let root_attr = FileAttr {
            ino:     ROOT_INO,
            size:    0,
            blocks:  1,
            atime:   UNIX_EPOCH,
            mtime:   UNIX_EPOCH,
            ctime:   UNIX_EPOCH,
            crtime:  UNIX_EPOCH,
            kind:    FileType::Directory,
            perm:    0o555,
            nlink:   1,
            uid:     mount_uid,
            gid:     mount_gid,
            rdev:    0,
            blksize: BLOCK_SIZE,
            flags:   0,
        };
        let mut adapter = Self {
            tree,
            inode_paths: HashMap::new(),
            path_inodes: HashMap::new(),
            next_inode: ROOT_INO + 1,
            handles: HashMap::new(),
            next_handle: 1,
            root_attr,
            mount_uid,
            mount_gid,
        };
        adapter.inode_paths.insert(ROOT_INO, "/".into());
        adapter.path_inodes.insert("/".into(), ROOT_INO);
        adapter
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_inodes.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inode_paths.insert(ino, path.to_string());
        self.path_inodes.insert(path.to_string(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inode_paths.get(&ino).cloned()
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.path_inodes.remove(path) {
            self.inode_paths.remove(&ino);
        }
    }

    fn attr_for(&mut self, path: &str, info: &FileInfo) -> FileAttr {
        let ino = self.inode_for(path);
        let mtime = timestamp(info.mtime);
        let block_size = BLOCK_SIZE as u64;
        FileAttr {
            ino,
            size:    info.size,
            // ceil(size / blksize) + 1
            blocks:  (info.size + block_size - 1) / block_size + 1,
            atime:   mtime,
            mtime,
            ctime:   mtime,
            crtime:  mtime,
            kind:    file_type_of(info.mode),
            perm:    (info.mode & 0o7777) as u16,
            nlink:   1,
            uid:     if info.uid == 0 { self.mount_uid } else { info.uid },
            gid:     if info.gid == 0 { self.mount_gid } else { info.gid },
            rdev:    0,
            blksize: BLOCK_SIZE,
            flags:   0,
        }
    }

    fn lookup_info(&mut self, path: &str) -> Result<Option<FileInfo>> {
        self.tree.source().lookup(path, 0)
    }

    fn allocate_handle(&mut self, handle: Handle) -> u64 {
        let fh = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(fh, handle);
        fh
    }

    /// First write on a read handle: copy up and swap in the host file.
    fn promote_to_host(&mut self, fh: u64) -> std::result::Result<(), i32> {
        let path = match self.handles.get(&fh) {
            Some(Handle::Stream { path, write_intent: true, .. }) => path.clone(),
            Some(Handle::Stream { .. }) => return Err(libc::EBADF),
            Some(Handle::Host(_)) => return Ok(()),
            None => return Err(libc::EBADF),
        };
        let Some(overlay) = self.tree.overlay() else {
            return Err(libc::EROFS);
        };
        let file = overlay.open_for_write(&path).map_err(|e| errno_of(&e))?;
        self.handles.insert(fh, Handle::Host(file));
        Ok(())
    }
}

impl Filesystem for FuseOperations {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_paths(&parent_path, &name.to_string_lossy());
        match self.lookup_info(&path) {
            Ok(Some(info)) => {
                let attr = self.attr_for(&path, &info);
                reply.entry(&TTL, &attr, 0);
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &self.root_attr);
            return;
        }
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.lookup_info(&path) {
            Ok(Some(info)) => {
                let attr = self.attr_for(&path, &info);
                reply.attr(&TTL, &attr);
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.lookup_info(&path) {
            Ok(Some(info)) if !info.linkname.is_empty() => {
                reply.data(info.linkname.as_bytes())
            }
            Ok(Some(_)) => reply.error(libc::EINVAL),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req:   &Request<'_>,
        ino:    u64,
        _fh:    u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let listing = match self.tree.source().list_mode(&path) {
            Ok(Some(listing)) => listing,
            Ok(None) => {
                reply.error(libc::ENOTDIR);
                return;
            }
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(listing.len() + 2);
        entries.push((ino, FileType::Directory, ".".into()));
        entries.push((ROOT_INO, FileType::Directory, "..".into()));
        for (name, mode) in listing {
            let child_path = join_paths(&path, &name);
            let child_ino = self.inode_for(&child_path);
            entries.push((child_ino, file_type_of(mode), name));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate() {
            let next_offset = i as i64 + 1;
            if next_offset > offset && reply.add(entry_ino, next_offset, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let write_intent = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        if write_intent && self.tree.overlay().is_none() {
            reply.error(libc::EROFS);
            return;
        }

        let info = match self.lookup_info(&path) {
            Ok(Some(info)) => info,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        match self.tree.source().open(&info) {
            Ok(stream) => {
                let fh = self.allocate_handle(Handle::Stream { stream, path, write_intent });
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req:   &Request<'_>,
        _ino:   u64,
        fh:     u64,
        offset: i64,
        size:   u32,
        _flags: i32,
        _lock:  Option<u64>,
        reply:  ReplyData,
    ) {
        use std::io::{Read, Seek, SeekFrom};
        match self.handles.get_mut(&fh) {
            Some(Handle::Stream { stream, .. }) => {
                let outcome = (|| -> std::io::Result<Vec<u8>> {
                    stream.seek(SeekFrom::Start(offset.max(0) as u64))?;
                    let mut buf = vec![0u8; size as usize];
                    let mut filled = 0usize;
                    while filled < buf.len() {
                        match stream.read(&mut buf[filled..])? {
                            0 => break,
                            n => filled += n,
                        }
                    }
                    buf.truncate(filled);
                    Ok(buf)
                })();
                match outcome {
                    Ok(data) => reply.data(&data),
                    Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            Some(Handle::Host(file)) => {
                use std::os::unix::fs::FileExt;
                let mut buf = vec![0u8; size as usize];
                match file.read_at(&mut buf, offset.max(0) as u64) {
                    Ok(n) => {
                        buf.truncate(n);
                        reply.data(&buf);
                    }
                    Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req:   &Request<'_>,
        _ino:   u64,
        fh:     u64,
        _flags: i32,
        _lock:  Option<u64>,
        _flush: bool,
        reply:  ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats: StatFs = self.tree.source().statfs();
        let bsize = stats.block_size.max(BLOCK_SIZE);
        reply.statfs(
            stats.blocks,
            stats.bfree,
            stats.bavail,
            stats.files,
            stats.ffree,
            bsize,
            stats.name_max,
            bsize,
        );
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let keys = match self.lookup_info(&path) {
            Ok(Some(info)) => match self.tree.source().list_xattr(&info) {
                Ok(keys) => keys,
                Err(e) => {
                    reply.error(errno_of(&e));
                    return;
                }
            },
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        let mut packed = Vec::new();
        for key in keys {
            packed.extend_from_slice(key.as_bytes());
            packed.push(0);
        }
        if size == 0 {
            reply.size(packed.len() as u32);
        } else if packed.len() as u32 <= size {
            reply.data(&packed);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    // Positioned xattr reads (a macOS resource-fork concept) are not part
    // of the Linux callback; a kernel that sent one would get EOPNOTSUPP
    // from the library's unimplemented-callback path.
    fn getxattr(
        &mut self,
        _req:  &Request<'_>,
        ino:   u64,
        name:  &OsStr,
        size:  u32,
        reply: ReplyXattr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let key = name.to_string_lossy();
        let value = match self.lookup_info(&path) {
            Ok(Some(info)) => match self.tree.source().get_xattr(&info, &key) {
                Ok(Some(value)) => value,
                Ok(None) => {
                    reply.error(libc::ENODATA);
                    return;
                }
                Err(e) => {
                    reply.error(errno_of(&e));
                    return;
                }
            },
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() as u32 <= size {
            reply.data(&value);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    // ── Write path ───────────────────────────────────────────────────────────

    fn create(
        &mut self,
        _req:   &Request<'_>,
        parent: u64,
        name:   &OsStr,
        mode:   u32,
        _umask: u32,
        _flags: i32,
        reply:  fuser::ReplyCreate,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_paths(&parent_path, &name.to_string_lossy());
        let Some(overlay) = self.tree.overlay() else {
            reply.error(libc::EROFS);
            return;
        };
        match overlay.create(&path, mode) {
            Ok(file) => {
                let info = match self.lookup_info(&path) {
                    Ok(Some(info)) => info,
                    _ => {
                        reply.error(libc::EIO);
                        return;
                    }
                };
                let attr = self.attr_for(&path, &info);
                let fh = self.allocate_handle(Handle::Host(file));
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn write(
        &mut self,
        _req:    &Request<'_>,
        _ino:    u64,
        fh:      u64,
        offset:  i64,
        data:    &[u8],
        _wflags: u32,
        _flags:  i32,
        _lock:   Option<u64>,
        reply:   ReplyWrite,
    ) {
        if let Err(errno) = self.promote_to_host(fh) {
            reply.error(errno);
            return;
        }
        match self.handles.get_mut(&fh) {
            Some(Handle::Host(file)) => {
                use std::os::unix::fs::FileExt;
                match file.write_at(data, offset.max(0) as u64) {
                    Ok(n) => reply.written(n as u32),
                    Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
                }
            }
            _ => reply.error(libc::EBADF),
        }
    }

    fn setattr(
        &mut self,
        _req:    &Request<'_>,
        ino:     u64,
        mode:    Option<u32>,
        uid:     Option<u32>,
        gid:     Option<u32>,
        size:    Option<u64>,
        _atime:  Option<TimeOrNow>,
        mtime:   Option<TimeOrNow>,
        _ctime:  Option<SystemTime>,
        _fh:     Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags:  Option<u32>,
        reply:   ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(overlay) = self.tree.overlay() else {
            reply.error(libc::EROFS);
            return;
        };

        let outcome = (|| -> Result<()> {
            if let Some(mode) = mode {
                overlay.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                overlay.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                overlay.truncate(&path, size)?;
            }
            if let Some(mtime) = mtime {
                let seconds = match mtime {
                    TimeOrNow::SpecificTime(t) => t
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                    TimeOrNow::Now => SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                };
                overlay.utimens(&path, seconds)?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => match self.lookup_info(&path) {
                Ok(Some(info)) => {
                    let attr = self.attr_for(&path, &info);
                    reply.attr(&TTL, &attr);
                }
                _ => reply.error(libc::ENOENT),
            },
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req:   &Request<'_>,
        parent: u64,
        name:   &OsStr,
        mode:   u32,
        _umask: u32,
        reply:  ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_paths(&parent_path, &name.to_string_lossy());
        let Some(overlay) = self.tree.overlay() else {
            reply.error(libc::EROFS);
            return;
        };
        match overlay.mkdir(&path, mode) {
            Ok(()) => match self.lookup_info(&path) {
                Ok(Some(info)) => {
                    let attr = self.attr_for(&path, &info);
                    reply.entry(&TTL, &attr, 0);
                }
                _ => reply.error(libc::EIO),
            },
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_paths(&parent_path, &name.to_string_lossy());
        let Some(overlay) = self.tree.overlay() else {
            reply.error(libc::EROFS);
            return;
        };
        match overlay.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_paths(&parent_path, &name.to_string_lossy());
        let Some(overlay) = self.tree.overlay() else {
            reply.error(libc::EROFS);
            return;
        };
        match overlay.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        _req:      &Request<'_>,
        parent:    u64,
        name:      &OsStr,
        newparent: u64,
        newname:   &OsStr,
        _flags:    u32,
        reply:     ReplyEmpty,
    ) {
        let (Some(old_parent), Some(new_parent)) =
            (self.path_of(parent), self.path_of(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let old = join_paths(&old_parent, &name.to_string_lossy());
        let new = join_paths(&new_parent, &newname.to_string_lossy());
        let Some(overlay) = self.tree.overlay() else {
            reply.error(libc::EROFS);
            return;
        };
        match overlay.rename(&old, &new) {
            Ok(()) => {
                self.forget_path(&old);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req:   &Request<'_>,
        parent: u64,
        name:   &OsStr,
        target: &std::path::Path,
        reply:  ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_paths(&parent_path, &name.to_string_lossy());
        let Some(overlay) = self.tree.overlay() else {
            reply.error(libc::EROFS);
            return;
        };
        match overlay.symlink(&path, &target.to_string_lossy()) {
            Ok(()) => match self.lookup_info(&path) {
                Ok(Some(info)) => {
                    let attr = self.attr_for(&path, &info);
                    reply.entry(&TTL, &attr, 0);
                }
                _ => reply.error(libc::EIO),
            },
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn flush(
        &mut self,
        _req:  &Request<'_>,
        _ino:  u64,
        fh:    u64,
        _lock: u64,
        reply: ReplyEmpty,
    ) {
        match self.handles.get_mut(&fh) {
            Some(Handle::Host(file)) => match file.sync_data() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            },
            Some(Handle::Stream { .. }) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(
        &mut self,
        _req:      &Request<'_>,
        _ino:      u64,
        fh:        u64,
        _datasync: bool,
        reply:     ReplyEmpty,
    ) {
        match self.handles.get_mut(&fh) {
            Some(Handle::Host(file)) => match file.sync_all() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            },
            Some(Handle::Stream { .. }) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn destroy(&mut self) {
        self.handles.clear();
        if let Err(e) = self.tree.source().teardown() {
            log::warn!("teardown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_to_file_type() {
        assert_eq!(file_type_of(0o100644), FileType::RegularFile);
        assert_eq!(file_type_of(0o040755), FileType::Directory);
        assert_eq!(file_type_of(0o120777), FileType::Symlink);
        assert_eq!(file_type_of(0o010600), FileType::NamedPipe);
    }

    #[test]
    fn timestamps_clamp_at_epoch() {
        assert_eq!(timestamp(-5.0), UNIX_EPOCH);
        assert_eq!(timestamp(0.0), UNIX_EPOCH);
        assert!(timestamp(1.5) > UNIX_EPOCH);
    }

    #[test]
    fn inode_table_is_stable() {
        use crate::mountsource::singlefile::SingleFileMountSource;
        use crate::stencil::shared_buffer;
        let source =
            SingleFileMountSource::new("f", shared_buffer(b"x".to_vec()), 1, 0.0).unwrap();
        let mut ops = FuseOperations::new(MountedTree::ReadOnly(Box::new(source)));

        let first = ops.inode_for("/f");
        let second = ops.inode_for("/f");
        assert_eq!(first, second);
        assert_ne!(first, ROOT_INO);
        assert_eq!(ops.path_of(first).unwrap(), "/f");
    }
}

//! ZIP backend: central-directory enumeration into the archive index.
//!
//! ZIP is already random access at entry granularity, so no seek table is
//! involved.  Stored (uncompressed) entries are served as zero-copy
//! stencils over the payload range; deflated or encrypted entries are
//! decompressed into memory on open.  Duplicate names version exactly like
//! overwritten TAR members, keyed by the local-header offset.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{ArcError, Result};
use crate::index::{
    split_path, ArchiveIndex, FileKind, Fingerprint, IndexBuilder, IndexConfig, IndexLocation,
    IndexedEntry,
};
use crate::mountsource::{
    normalize_path, EntryLocator, FileInfo, Listing, ModeListing, MountSource, StatFs, Userdata,
};
use crate::stencil::{shared_buffer, SeekableSource, SharedSource, Stencil, StenciledFile};

pub struct ZipMountSource {
    stream:      SharedSource,
    stream_size: u64,
    archive:     ZipArchive<StenciledFile>,
    index:       ArchiveIndex,
    /// data_start → central-directory entry number, for reopening.
    by_offset:   HashMap<u64, usize>,
    passwords:   Vec<Vec<u8>>,
    /// Entry numbers known to be stored uncompressed and unencrypted.
    stored:      HashMap<usize, (u64, u64)>,
    name:        String,
}

fn zip_err(e: ZipError) -> ArcError {
    match e {
        ZipError::Io(io) => ArcError::Io(io),
        other => ArcError::Format { offset: 0, message: other.to_string() },
    }
}

/// Epoch seconds from a zip DOS timestamp, without external time crates.
fn dos_datetime_to_epoch(dt: zip::DateTime) -> f64 {
    let (year, month, day) = (dt.year() as i64, dt.month() as i64, dt.day() as i64);
    let (hour, minute, second) = (dt.hour() as i64, dt.minute() as i64, dt.second() as i64);
    // Days since epoch via the civil-date algorithm.
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146097 + doe - 719468;
    (days * 86400 + hour * 3600 + minute * 60 + second) as f64
}

impl ZipMountSource {
    pub fn open(
        stream:      SharedSource,
        stream_size: u64,
        location:    IndexLocation,
        fingerprint: &Fingerprint,
        passwords:   &[String],
        name:        &str,
    ) -> Result<Self> {
        let view = StenciledFile::new(vec![Stencil::new(Arc::clone(&stream), 0, stream_size)]);
        let mut archive = ZipArchive::new(view).map_err(zip_err)?;

        let mut by_offset = HashMap::new();
        let mut stored = HashMap::new();

        // Reuse a valid index; otherwise enumerate the central directory.
        let config = IndexConfig::default();
        let index = match location.path() {
            Some(path) if path.is_file() => {
                let existing = ArchiveIndex::open(path)?;
                if existing.validate(fingerprint, &config, false) {
                    Some(existing)
                } else {
                    None
                }
            }
            _ => None,
        };
        let index = match index {
            Some(index) => {
                Self::scan_offsets(&mut archive, &mut by_offset, &mut stored)?;
                index
            }
            None => {
                let mut builder =
                    IndexBuilder::create(location.path().filter(|_| location.writable()))?;
                Self::enumerate(&mut archive, &mut builder, &mut by_offset, &mut stored)?;
                builder.finalize(&config, fingerprint)?
            }
        };

        Ok(Self {
            stream,
            stream_size,
            archive,
            index,
            by_offset,
            passwords: passwords.iter().map(|p| p.as_bytes().to_vec()).collect(),
            stored,
            name: name.to_string(),
        })
    }

    fn scan_offsets(
        archive:   &mut ZipArchive<StenciledFile>,
        by_offset: &mut HashMap<u64, usize>,
        stored:    &mut HashMap<usize, (u64, u64)>,
    ) -> Result<()> {
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i).map_err(zip_err)?;
            by_offset.insert(file.data_start(), i);
            if file.compression() == zip::CompressionMethod::Stored && !file.encrypted() {
                stored.insert(i, (file.data_start(), file.size()));
            }
        }
        Ok(())
    }

    fn enumerate(
        archive:   &mut ZipArchive<StenciledFile>,
        builder:   &mut IndexBuilder,
        by_offset: &mut HashMap<u64, usize>,
        stored:    &mut HashMap<usize, (u64, u64)>,
    ) -> Result<()> {
        let mut known_dirs = std::collections::HashSet::new();
        for i in 0..archive.len() {
            let (full_path, is_dir, unix_mode, data_start, header_start, size, mtime, encrypted, is_stored) = {
                let file = archive.by_index_raw(i).map_err(zip_err)?;
                let raw_name = String::from_utf8_lossy(file.name_raw()).into_owned();
                (
                    normalize_path(&raw_name),
                    raw_name.ends_with('/'),
                    file.unix_mode(),
                    file.data_start(),
                    file.header_start(),
                    file.size(),
                    dos_datetime_to_epoch(file.last_modified().unwrap_or_default()),
                    file.encrypted(),
                    file.compression() == zip::CompressionMethod::Stored,
                )
            };
            if full_path == "/" {
                continue;
            }
            let (parent, name) = split_path(&full_path);

            let (kind, mode) = match unix_mode {
                Some(mode) if mode & 0o170000 == 0o120000 => (FileKind::Symlink, mode),
                Some(mode) if mode & 0o170000 == 0o040000 => (FileKind::Directory, mode),
                Some(mode) if is_dir => (FileKind::Directory, 0o040000 | (mode & 0o7777)),
                Some(mode) => (FileKind::Regular, 0o100000 | (mode & 0o7777)),
                None if is_dir => (FileKind::Directory, 0o040755),
                None => (FileKind::Regular, 0o100644),
            };

            by_offset.insert(data_start, i);
            if is_stored && !encrypted {
                stored.insert(i, (data_start, size));
            }

            // Symlink targets are the (tiny) entry payload.
            let linkname = if kind == FileKind::Symlink && !encrypted {
                let mut file = archive.by_index(i).map_err(zip_err)?;
                let mut target = String::new();
                let _ = file.read_to_string(&mut target);
                target
            } else {
                String::new()
            };

            // Parent chain for archives that omit directory entries.
            let mut accumulated = String::new();
            for part in parent.trim_matches('/').split('/').filter(|p| !p.is_empty()) {
                let dir_parent =
                    if accumulated.is_empty() { "/".to_string() } else { accumulated.clone() };
                accumulated = crate::mountsource::join_paths(&dir_parent, part);
                if known_dirs.insert(accumulated.clone()) {
                    builder.add_entry(&IndexedEntry {
                        path: dir_parent,
                        name: part.to_string(),
                        header_offset: 0,
                        offset: 0,
                        size: 0,
                        mtime: 0.0,
                        mode: 0o040755,
                        linkname: String::new(),
                        uid: 0,
                        gid: 0,
                        kind: FileKind::Directory,
                        is_sparse: false,
                        recursion_depth: 0,
                    })?;
                }
            }
            if kind == FileKind::Directory {
                known_dirs.insert(full_path.clone());
            }

            builder.add_entry(&IndexedEntry {
                path: parent,
                name,
                header_offset: header_start,
                offset: data_start,
                size,
                mtime,
                mode,
                linkname,
                uid: 0,
                gid: 0,
                kind,
                is_sparse: false,
                recursion_depth: 0,
            })?;
        }
        Ok(())
    }

    fn info_from_entry(&self, entry: &IndexedEntry) -> FileInfo {
        FileInfo {
            size:     entry.size,
            mtime:    entry.mtime,
            mode:     entry.mode,
            linkname: entry.linkname.clone(),
            uid:      entry.uid,
            gid:      entry.gid,
            userdata: vec![Userdata::Entry(EntryLocator {
                path:            entry.full_path(),
                header_offset:   entry.header_offset,
                offset:          entry.offset,
                size:            entry.size,
                kind:            entry.kind,
                is_sparse:       false,
                is_archive:      crate::formats::detect::strip_archive_suffix(&entry.name).is_some(),
                recursion_depth: entry.recursion_depth,
            })],
        }
    }

    /// Decompress one entry fully, trying configured passwords in order.
    fn extract(&mut self, entry_number: usize, path: &str) -> Result<Vec<u8>> {
        let encrypted = {
            let file = self.archive.by_index_raw(entry_number).map_err(zip_err)?;
            file.encrypted()
        };

        if !encrypted {
            let mut file = self.archive.by_index(entry_number).map_err(zip_err)?;
            let mut out = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut out)?;
            return Ok(out);
        }

        for password in &self.passwords {
            match self.archive.by_index_decrypt(entry_number, password) {
                Ok(mut file) => {
                    let mut out = Vec::with_capacity(file.size() as usize);
                    file.read_to_end(&mut out)?;
                    return Ok(out);
                }
                Err(ZipError::InvalidPassword) => continue, // wrong password
                Err(e) => return Err(zip_err(e)),
            }
        }
        Err(ArcError::PasswordExhausted {
            path:  path.to_string(),
            tried: self.passwords.len(),
        })
    }
}

impl MountSource for ZipMountSource {
    fn lookup(&mut self, path: &str, version: i64) -> Result<Option<FileInfo>> {
        Ok(self.index.lookup(path, version)?.map(|e| self.info_from_entry(&e)))
    }

    fn versions(&mut self, path: &str) -> Result<u32> {
        self.index.versions(path)
    }

    fn list(&mut self, path: &str) -> Result<Option<Listing>> {
        Ok(self.index.list(path)?.map(|entries| {
            entries
                .into_iter()
                .map(|e| (e.name.clone(), self.info_from_entry(&e)))
                .collect()
        }))
    }

    fn list_mode(&mut self, path: &str) -> Result<Option<ModeListing>> {
        Ok(self.index.list_mode(path)?.map(|rows| rows.into_iter().collect()))
    }

    fn open(&mut self, info: &FileInfo) -> Result<Box<dyn SeekableSource>> {
        let (token, _) = info.pop_userdata()?;
        let Userdata::Entry(locator) = token else {
            return Err(ArcError::Usage("not a ZIP entry".into()));
        };
        let entry_number = *self.by_offset.get(&locator.offset).ok_or(ArcError::Format {
            offset: locator.offset,
            message: "ZIP entry vanished from the central directory".into(),
        })?;

        // Stored and unencrypted: a zero-copy stencil over the payload.
        if let Some(&(data_start, size)) = self.stored.get(&entry_number) {
            return Ok(Box::new(StenciledFile::new(vec![Stencil::new(
                Arc::clone(&self.stream),
                data_start,
                size,
            )])));
        }

        let data = self.extract(entry_number, &locator.path)?;
        Ok(Box::new(StenciledFile::new(vec![Stencil::new(
            shared_buffer(data),
            0,
            locator.size,
        )])))
    }

    fn statfs(&mut self) -> StatFs {
        StatFs {
            files: self.index.entry_count().unwrap_or(0),
            blocks: self.stream_size / (256 * 1024) + 1,
            ..StatFs::default()
        }
    }
}

impl std::fmt::Debug for ZipMountSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipMountSource")
            .field("name", &self.name)
            .field("entries", &self.archive.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), FileOptions::default()).unwrap();
            } else {
                writer
                    .start_file(*name, FileOptions::default().unix_permissions(0o644))
                    .unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn mount(bytes: Vec<u8>) -> ZipMountSource {
        let size = bytes.len() as u64;
        let fingerprint = Fingerprint { size, mtime: None, head_hash: "zip".into() };
        ZipMountSource::open(
            shared_buffer(bytes),
            size,
            IndexLocation::Memory,
            &fingerprint,
            &[],
            "test.zip",
        )
        .unwrap()
    }

    #[test]
    fn list_and_read() {
        let mut source = mount(build_zip(&[("hello.txt", b"hi there"), ("sub/inner.txt", b"deep")]));
        let root = source.list("/").unwrap().unwrap();
        let names: Vec<&String> = root.keys().collect();
        assert_eq!(names, vec!["hello.txt", "sub"]);

        let info = source.lookup("/hello.txt", 0).unwrap().unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(source.read(&info, 8, 0).unwrap(), b"hi there");

        let inner = source.lookup("/sub/inner.txt", 0).unwrap().unwrap();
        assert_eq!(source.read(&inner, 4, 0).unwrap(), b"deep");
        assert!(source.is_directory("/sub").unwrap());
    }

    #[test]
    fn positioned_reads() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let mut source = mount(build_zip(&[("data.bin", &payload)]));
        let info = source.lookup("/data.bin", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 16, 1000).unwrap(), &payload[1000..1016]);
    }

    #[test]
    fn missing_entries() {
        let mut source = mount(build_zip(&[("a", b"x")]));
        assert!(source.lookup("/nope", 0).unwrap().is_none());
        assert!(source.list("/a").unwrap().is_none());
        assert_eq!(source.versions("/a").unwrap(), 1);
    }
}

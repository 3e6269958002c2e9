//! Backend selection and mount-tree assembly.
//!
//! `open_mount_source` turns one path (folder, archive file, compressed
//! stream, or first split part) into a mount source: magic bytes pick the
//! backend, extensions only disambiguate, and a user-prioritized backend
//! list is honored before the default order.  `assemble_tree` stacks the
//! compositing layers for a whole mount: union over all inputs, the
//! auto-mount recursion layer when asked for, and the file-version layer
//! on top.

use std::fs;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ArcError, Result};
use crate::formats::detect::{
    collect_split_parts, detect_archive, split_first_part, strip_archive_suffix, ArchiveFormat,
    DETECT_HEAD_LEN,
};
use crate::formats::{SqlarMountSource, SquashfsMountSource, TarMountSource, ZipMountSource};
use crate::formats::tar::TarOptions;
use crate::index::location::{locate, remove_stale};
use crate::index::{ArchiveIndex, Fingerprint, IndexConfig, IndexLocation};
use crate::mountsource::automount::{AutoMountLayer, AutoMountOptions, NestedInput, NestedOpener};
use crate::mountsource::folder::FolderMountSource;
use crate::mountsource::singlefile::SingleFileMountSource;
use crate::mountsource::union::UnionMountSource;
use crate::mountsource::versioning::FileVersionLayer;
use crate::mountsource::MountSource;
use crate::seekindex::{
    peek_head, Bzip2Reader, Codec, GzipReader, SeekTable, XzReader, ZstdReader,
};
use crate::stencil::{shared_source, JoinedFile, SharedSource, Stencil, StenciledFile};

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MountOptions {
    // Index behavior
    pub index_file:      Option<PathBuf>,
    pub index_folders:   Vec<PathBuf>,
    pub recreate_index:  bool,
    pub verify_mtime:    bool,
    // Recursion
    pub recursion_depth: u32,
    pub lazy:            bool,
    pub strip_recursive_tar_extension: bool,
    pub transform_recursive_mount_point: Option<(String, String)>,
    // Archive quirks
    pub ignore_zeros:    bool,
    pub gnu_incremental: Option<bool>,
    pub encoding:        String,
    // Performance
    pub gzip_seek_point_spacing: u64,
    pub parallelization: usize,
    // Passwords
    pub passwords:       Vec<String>,
    // Backend priority
    pub prioritized_backends: Vec<ArchiveFormat>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            index_file:      None,
            index_folders:   Vec::new(),
            recreate_index:  false,
            verify_mtime:    false,
            recursion_depth: 0,
            lazy:            false,
            strip_recursive_tar_extension: false,
            transform_recursive_mount_point: None,
            ignore_zeros:    false,
            gnu_incremental: None,
            encoding:        "utf-8".into(),
            gzip_seek_point_spacing: crate::seekindex::gzip::DEFAULT_SPACING,
            parallelization: 1,
            passwords:       Vec::new(),
            prioritized_backends: Vec::new(),
        }
    }
}

impl MountOptions {
    fn tar_options(&self) -> TarOptions {
        TarOptions {
            ignore_zeros:    self.ignore_zeros,
            recursive:       self.recursion_depth > 0,
            gnu_incremental: self.gnu_incremental,
            encoding:        self.encoding.clone(),
        }
    }
}

// ── Entry points ──────────────────────────────────────────────────────────────

/// Open one input path as a mount source.
pub fn open_mount_source(path: &Path, options: &MountOptions) -> Result<Box<dyn MountSource>> {
    if path.is_dir() {
        return Ok(Box::new(FolderMountSource::new(path)?));
    }
    if !path.is_file() {
        return Err(ArcError::Usage(format!("{} does not exist", path.display())));
    }

    let mtime = fs::metadata(path)
        .ok()
        .map(|m| m.mtime() as f64 + m.mtime_nsec() as f64 * 1e-9);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".into());

    // First part of a split set: join the siblings before detection.
    // The joined stream has no single backing file, so backends treat it
    // like a nested stream (no host-path shortcuts).
    if let Some(stem) = split_first_part(&name) {
        let stem = stem.to_string();
        if let Some(joined) = try_join_split_parts(path, &name)? {
            let size = joined.size();
            return open_stream(shared_source(joined), size, &stem, mtime, None, options);
        }
    }

    let file = fs::File::open(path)?;
    let size = file.metadata()?.len();
    open_stream(shared_source(file), size, &name, mtime, Some(path), options)
}

/// Assemble the full mount tree over several input paths.
pub fn assemble_tree(paths: &[PathBuf], options: &MountOptions) -> Result<Box<dyn MountSource>> {
    if paths.is_empty() {
        return Err(ArcError::Usage("no archive or folder paths given".into()));
    }

    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        sources.push(open_mount_source(path, options)?);
    }
    let base: Box<dyn MountSource> = if sources.len() == 1 {
        sources.pop().unwrap()
    } else {
        Box::new(UnionMountSource::new(sources))
    };

    let base: Box<dyn MountSource> = if options.recursion_depth > 0 {
        let auto_options = AutoMountOptions {
            max_depth:    options.recursion_depth,
            lazy:         options.lazy,
            strip_suffix: options.strip_recursive_tar_extension,
            transform:    options.transform_recursive_mount_point.clone(),
        };
        Box::new(AutoMountLayer::new(base, auto_options, nested_opener(options.clone()))?)
    } else {
        base
    };

    Ok(Box::new(FileVersionLayer::new(base)))
}

/// The auto-mount layer's callback for nested archives.
fn nested_opener(options: MountOptions) -> NestedOpener {
    Box::new(move |input, _remaining| {
        // Nested mounts inherit every option except the recursion knobs;
        // the top layer owns the global depth budget.
        let mut nested = options.clone();
        nested.recursion_depth = 0;
        nested.index_file = None;
        match input {
            NestedInput::HostFile(path) => open_mount_source(&path, &nested),
            NestedInput::Stream { stream, size, name } => {
                open_stream(stream, size, &name, None, None, &nested)
            }
        }
    })
}

// ── Split files ───────────────────────────────────────────────────────────────

fn try_join_split_parts(path: &Path, name: &str) -> Result<Option<StenciledFile>> {
    let Some(folder) = path.parent() else { return Ok(None) };
    let mut siblings = Vec::new();
    for entry in fs::read_dir(folder)? {
        siblings.push(entry?.file_name().to_string_lossy().into_owned());
    }
    let Some(parts) = collect_split_parts(name, &siblings) else {
        return Ok(None);
    };

    log::info!("joining {} split parts starting at {}", parts.len(), path.display());
    let mut streams: Vec<SharedSource> = Vec::with_capacity(parts.len());
    for part in parts {
        streams.push(shared_source(fs::File::open(folder.join(part))?));
    }
    Ok(Some(JoinedFile::new(streams)?))
}

// ── Stream opening ────────────────────────────────────────────────────────────

/// Detect and open a seekable byte stream.  `host_path` is set when the
/// stream is a real file (enables sibling index files).
pub fn open_stream(
    stream:    SharedSource,
    size:      u64,
    name:      &str,
    mtime:     Option<f64>,
    host_path: Option<&Path>,
    options:   &MountOptions,
) -> Result<Box<dyn MountSource>> {
    let head = {
        let mut view = full_view(&stream, size);
        peek_head(&mut view, DETECT_HEAD_LEN)?
    };

    // Outer compression first: the archive magic hides inside.
    if let Some(codec) = Codec::detect(&head) {
        return open_compressed(stream, size, name, mtime, host_path, codec, options);
    }

    let detected = detect_archive(&head);
    let candidates = backend_order(detected, options);
    let mut last_error: Option<ArcError> = None;
    for format in candidates {
        match open_archive(format, &stream, size, name, mtime, host_path, options) {
            Ok(source) => return Ok(source),
            Err(e @ ArcError::MissingBackend { .. }) => return Err(e),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ArcError::Usage(format!("{name} is not a recognized archive or compressed stream"))
    }))
}

/// Candidate backends: the detected format first unless the user's
/// priority list reorders it.
fn backend_order(detected: Option<ArchiveFormat>, options: &MountOptions) -> Vec<ArchiveFormat> {
    let mut order = Vec::new();
    for &format in &options.prioritized_backends {
        if Some(format) == detected || detected.is_none() {
            order.push(format);
        }
    }
    if let Some(format) = detected {
        if !order.contains(&format) {
            order.push(format);
        }
    }
    order
}

fn open_archive(
    format:    ArchiveFormat,
    stream:    &SharedSource,
    size:      u64,
    name:      &str,
    mtime:     Option<f64>,
    host_path: Option<&Path>,
    options:   &MountOptions,
) -> Result<Box<dyn MountSource>> {
    if !format.is_supported() {
        return Err(ArcError::MissingBackend { format: format.name() });
    }
    match format {
        ArchiveFormat::Tar => open_tar(
            Arc::clone(stream),
            size,
            Arc::clone(stream),
            size,
            None,
            name,
            mtime,
            host_path,
            options,
        ),
        ArchiveFormat::Zip => {
            let fingerprint = fingerprint_of(stream, size, mtime, options)?;
            let location = index_location(name, host_path, options)?;
            Ok(Box::new(ZipMountSource::open(
                Arc::clone(stream),
                size,
                location,
                &fingerprint,
                &options.passwords,
                name,
            )?))
        }
        ArchiveFormat::Sqlar => match host_path {
            Some(path) => Ok(Box::new(SqlarMountSource::open(path)?)),
            None => Ok(Box::new(SqlarMountSource::from_stream(full_view(stream, size))?)),
        },
        ArchiveFormat::SquashFs => {
            Ok(Box::new(SquashfsMountSource::open(Arc::clone(stream), size)?))
        }
        _ => Err(ArcError::MissingBackend { format: format.name() }),
    }
}

// ── Compressed streams ────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn open_compressed(
    raw:       SharedSource,
    raw_size:  u64,
    name:      &str,
    mtime:     Option<f64>,
    host_path: Option<&Path>,
    codec:     Codec,
    options:   &MountOptions,
) -> Result<Box<dyn MountSource>> {
    // A valid existing TAR index short-circuits the expensive scan: the
    // persisted seek table restores the codec reader directly.
    let location = index_location(name, host_path, options)?;
    let fingerprint = fingerprint_of(&raw, raw_size, mtime, options)?;

    if options.recreate_index {
        if let Some(path) = location.path() {
            remove_stale(path)?;
        }
    } else if let Some(path) = location.path().filter(|p| p.is_file()) {
        if let Some((index, table)) = reuse_index(path, &fingerprint, codec, options)? {
            let (stream, stream_size) =
                codec_reader_with_table(Arc::clone(&raw), codec, table, options)?;
            log::info!("reusing index for {name}");
            return Ok(Box::new(TarMountSource::from_index(stream, stream_size, index)?));
        }
    }

    // Full scan path: build the seek table, sniff the decompressed head.
    let (stream, stream_size, table) = codec_reader_scan(Arc::clone(&raw), codec, options)?;
    let head = {
        let mut view = full_view(&stream, stream_size);
        peek_head(&mut view, DETECT_HEAD_LEN)?
    };

    if detect_archive(&head) == Some(ArchiveFormat::Tar) {
        return open_tar(
            stream,
            stream_size,
            raw,
            raw_size,
            Some(&table),
            name,
            mtime,
            host_path,
            options,
        );
    }

    // A raw compressed stream mounts as one synthetic file.
    let inner_name = strip_archive_suffix(name).unwrap_or(name);
    Ok(Box::new(SingleFileMountSource::new(
        inner_name,
        stream,
        stream_size,
        mtime.unwrap_or(0.0),
    )?))
}

/// Open the persisted index if schema, fingerprint, config, and seek table
/// all check out.
fn reuse_index(
    path:        &Path,
    fingerprint: &Fingerprint,
    codec:       Codec,
    options:     &MountOptions,
) -> Result<Option<(ArchiveIndex, SeekTable)>> {
    let index = match ArchiveIndex::open(path) {
        Ok(index) => index,
        Err(_) => return Ok(None),
    };

    // Auto-detected flags compare against what the stored walk decided.
    let stored: Option<IndexConfig> = index
        .metadata("config")
        .ok()
        .flatten()
        .and_then(|json| serde_json::from_str(&json).ok());
    let expected = options.tar_options().to_index_config(
        options.gnu_incremental.unwrap_or_else(|| {
            stored.as_ref().map(|c| c.gnu_incremental).unwrap_or(false)
        }),
    );

    if !index.validate(fingerprint, &expected, options.verify_mtime) {
        return Ok(None);
    }
    match index.seek_table(codec) {
        Ok(Some(table)) => Ok(Some((index, table))),
        Ok(None) | Err(_) => {
            // A missing or corrupt seek-table blob forces a full rebuild.
            log::info!("seek table missing or unreadable in {}; rebuilding", path.display());
            Ok(None)
        }
    }
}

fn codec_reader_scan(
    raw:     SharedSource,
    codec:   Codec,
    options: &MountOptions,
) -> Result<(SharedSource, u64, SeekTable)> {
    let raw_size = stream_len(&raw)?;
    let view = full_view(&raw, raw_size);
    match codec {
        Codec::Gzip => {
            let reader = GzipReader::open(view, options.gzip_seek_point_spacing)?;
            let size = reader.size();
            let table = reader.seek_table().clone();
            Ok((shared_source(reader), size, table))
        }
        Codec::Bzip2 => {
            let reader = Bzip2Reader::open(view)?;
            let size = reader.size();
            let table = reader.seek_table().clone();
            Ok((shared_source(reader), size, table))
        }
        Codec::Xz => {
            let reader = XzReader::open(view)?.with_parallelism(options.parallelization);
            let size = reader.size();
            let table = reader.seek_table().clone();
            Ok((shared_source(reader), size, table))
        }
        Codec::Zstd => {
            let reader = ZstdReader::open(view)?.with_parallelism(options.parallelization);
            let size = reader.size();
            let table = reader.seek_table().clone();
            Ok((shared_source(reader), size, table))
        }
    }
}

fn codec_reader_with_table(
    raw:     SharedSource,
    codec:   Codec,
    table:   SeekTable,
    options: &MountOptions,
) -> Result<(SharedSource, u64)> {
    let raw_size = stream_len(&raw)?;
    let view = full_view(&raw, raw_size);
    let size = table.decoded_size;
    let stream: SharedSource = match codec {
        Codec::Gzip => shared_source(GzipReader::with_table(view, table)?),
        Codec::Bzip2 => shared_source(Bzip2Reader::with_table(view, table)?),
        Codec::Xz => {
            shared_source(XzReader::with_table(view, table)?.with_parallelism(options.parallelization))
        }
        Codec::Zstd => {
            shared_source(ZstdReader::with_table(view, table)?.with_parallelism(options.parallelization))
        }
    };
    Ok((stream, size))
}

// ── TAR ───────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn open_tar(
    stream:      SharedSource,
    stream_size: u64,
    raw:         SharedSource,
    raw_size:    u64,
    seek_table:  Option<&SeekTable>,
    name:        &str,
    mtime:       Option<f64>,
    host_path:   Option<&Path>,
    options:     &MountOptions,
) -> Result<Box<dyn MountSource>> {
    let location = index_location(name, host_path, options)?;
    let fingerprint = fingerprint_of(&raw, raw_size, mtime, options)?;

    if options.recreate_index {
        if let Some(path) = location.path() {
            remove_stale(path)?;
        }
    } else if seek_table.is_none() {
        // Uncompressed TAR: index reuse is decided here (the compressed
        // path already did it before scanning).
        if let Some(path) = location.path().filter(|p| p.is_file()) {
            if let Ok(index) = ArchiveIndex::open(path) {
                let stored: Option<IndexConfig> = index
                    .metadata("config")
                    .ok()
                    .flatten()
                    .and_then(|json| serde_json::from_str(&json).ok());
                let expected = options.tar_options().to_index_config(
                    options.gnu_incremental.unwrap_or_else(|| {
                        stored.as_ref().map(|c| c.gnu_incremental).unwrap_or(false)
                    }),
                );
                if index.validate(&fingerprint, &expected, options.verify_mtime) {
                    log::info!("reusing index for {name}");
                    return Ok(Box::new(TarMountSource::from_index(stream, stream_size, index)?));
                }
            }
        }
    }

    Ok(Box::new(TarMountSource::build(
        stream,
        stream_size,
        location,
        &options.tar_options(),
        &fingerprint,
        seek_table,
    )?))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn full_view(stream: &SharedSource, size: u64) -> StenciledFile {
    StenciledFile::new(vec![Stencil::new(Arc::clone(stream), 0, size)])
}

fn stream_len(stream: &SharedSource) -> Result<u64> {
    let mut guard = stream
        .lock()
        .map_err(|_| ArcError::Usage("stream lock poisoned".into()))?;
    Ok(guard.seek(SeekFrom::End(0))?)
}

fn fingerprint_of(
    stream: &SharedSource,
    size:   u64,
    mtime:  Option<f64>,
    _options: &MountOptions,
) -> Result<Fingerprint> {
    let mut view = full_view(stream, size);
    Fingerprint::of_stream(&mut view, mtime)
}

fn index_location(
    name:      &str,
    host_path: Option<&Path>,
    options:   &MountOptions,
) -> Result<IndexLocation> {
    match host_path {
        Some(path) => locate(
            path,
            options.index_file.as_deref(),
            (!options.index_folders.is_empty()).then_some(&options.index_folders[..]),
        ),
        None => {
            // Nested streams have no durable identity to key a sibling
            // index on; keep those indexes in memory.
            let _ = name;
            Ok(IndexLocation::Memory)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, std::io::Cursor::new(data)).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn opens_folders_and_tars() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("a.tar");
        write_tar(&tar_path, &[("bar", b"foo\n")]);

        let mut source = open_mount_source(&tar_path, &MountOptions::default()).unwrap();
        let info = source.lookup("/bar", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 4, 0).unwrap(), b"foo\n");
        // A sibling index file appeared.
        assert!(dir.path().join("a.tar.index.sqlite").exists());

        let mut folder = open_mount_source(dir.path(), &MountOptions::default()).unwrap();
        assert!(folder.lookup("/a.tar", 0).unwrap().is_some());
    }

    #[test]
    fn opens_compressed_tar_and_reuses_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.tar.gz");
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            header.set_path("bar").unwrap();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, std::io::Cursor::new(b"foo\n")).unwrap();
            builder.finish().unwrap();
        }
        let mut encoder = flate2::write::GzEncoder::new(
            fs::File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap();

        {
            let mut source = open_mount_source(&path, &MountOptions::default()).unwrap();
            let info = source.lookup("/bar", 0).unwrap().unwrap();
            assert_eq!(source.read(&info, 4, 0).unwrap(), b"foo\n");
        }
        assert!(dir.path().join("b.tar.gz.index.sqlite").exists());

        // Second open reuses the persisted index and seek table.
        let mut source = open_mount_source(&path, &MountOptions::default()).unwrap();
        let info = source.lookup("/bar", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 4, 0).unwrap(), b"foo\n");
    }

    #[test]
    fn raw_compressed_stream_mounts_as_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            fs::File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(b"just text\n").unwrap();
        encoder.finish().unwrap();

        let mut source = open_mount_source(&path, &MountOptions::default()).unwrap();
        let listing = source.list("/").unwrap().unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["notes.txt"]);
        let info = source.lookup("/notes.txt", 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 10, 0).unwrap(), b"just text\n");
    }

    #[test]
    fn split_archive_parts_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        // A bzip2-compressed payload split in two numbered parts.
        let mut compressed = Vec::new();
        {
            let mut encoder = bzip2::write::BzEncoder::new(
                &mut compressed,
                bzip2::Compression::best(),
            );
            encoder.write_all(b"foobar").unwrap();
            encoder.finish().unwrap();
        }
        let half = compressed.len() / 2;
        fs::write(dir.path().join("foo.001"), &compressed[..half]).unwrap();
        fs::write(dir.path().join("foo.002"), &compressed[half..]).unwrap();

        let mut source =
            open_mount_source(&dir.path().join("foo.001"), &MountOptions::default()).unwrap();
        let listing = source.list("/").unwrap().unwrap();
        assert_eq!(listing.len(), 1);
        let name = listing.keys().next().unwrap().clone();
        let info = source.lookup(&format!("/{name}"), 0).unwrap().unwrap();
        assert_eq!(source.read(&info, 6, 0).unwrap(), b"foobar");
    }

    #[test]
    fn unsupported_formats_name_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.rar");
        fs::write(&path, b"Rar!\x1a\x07\x00filler").unwrap();
        match open_mount_source(&path, &MountOptions::default()) {
            Err(ArcError::MissingBackend { format }) => assert_eq!(format, "rar"),
            Err(other) => panic!("expected MissingBackend, got {other}"),
            Ok(_) => panic!("expected MissingBackend, got a mounted source"),
        }
    }

    #[test]
    fn assemble_union_with_versions() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("ufo"), b"iriya in folder 1\n").unwrap();
        fs::write(b.path().join("ufo"), b"iriya\n").unwrap();

        let mut tree = assemble_tree(
            &[a.path().to_path_buf(), b.path().to_path_buf()],
            &MountOptions::default(),
        )
        .unwrap();

        let info = tree.lookup("/ufo", 0).unwrap().unwrap();
        assert_eq!(tree.read(&info, 64, 0).unwrap(), b"iriya\n");
        assert_eq!(tree.versions("/ufo").unwrap(), 2);
        let old = tree.lookup("/ufo.versions/1", 0).unwrap().unwrap();
        assert_eq!(tree.read(&old, 64, 0).unwrap(), b"iriya in folder 1\n");
    }
}

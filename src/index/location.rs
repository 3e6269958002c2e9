//! Where the index lives: search order, write fallback, and staging of
//! compressed index files.
//!
//! Search/write order per mount:
//! 1. the explicit `--index-file` path (a URL or compressed file is staged
//!    into a temp dir first and opened read-only),
//! 2. each `--index-folders` entry in order, else the default list: the
//!    archive's own directory, then the per-user cache directory
//!    (`$XDG_CACHE_HOME/arcmount` or `~/.cache/arcmount`).
//!
//! The first folder that accepts a write probe wins.  If none does, the
//! index is built in memory and skipped for persistence; archives past a
//! size threshold get a warning because the next mount pays the full walk
//! again.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{ArcError, Result};

/// In-memory indexes above this entry count warn about lost persistence.
pub const IN_MEMORY_WARN_ENTRIES: u64 = 1000;

/// Where a mount's index was decided to live.
#[derive(Debug)]
pub enum IndexLocation {
    /// Persisted (or to be persisted) at this path.
    File(PathBuf),
    /// Read-only staged copy (decompressed explicit index); never written.
    StagedReadOnly(PathBuf, tempfile::TempDir),
    /// No writable folder; keep it in memory.
    Memory,
}

impl IndexLocation {
    pub fn path(&self) -> Option<&Path> {
        match self {
            IndexLocation::File(p) => Some(p),
            IndexLocation::StagedReadOnly(p, _) => Some(p),
            IndexLocation::Memory => None,
        }
    }

    pub fn writable(&self) -> bool {
        matches!(self, IndexLocation::File(_))
    }
}

/// `<archive>.index.sqlite`, the conventional sibling name.
pub fn index_file_name(archive: &Path) -> String {
    let base = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".into());
    format!("{base}.index.sqlite")
}

/// Default folder search order for an archive at `archive`.
pub fn default_index_folders(archive: &Path) -> Vec<PathBuf> {
    let mut folders = Vec::new();
    if let Some(parent) = archive.parent() {
        folders.push(parent.to_path_buf());
    }
    if let Some(cache) = user_cache_dir() {
        folders.push(cache);
    }
    folders
}

fn user_cache_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))?;
    Some(base.join("arcmount"))
}

/// True for anything that looks like a remote URL rather than a path.
pub fn is_url(path: &str) -> bool {
    path.contains("://")
}

/// Resolve where to read/write the index for `archive`.
///
/// `explicit` short-circuits everything; folders are otherwise probed in
/// order and the first writable one wins.  An existing valid-looking index
/// file in any folder is preferred over creating one elsewhere, so a
/// read-only archive directory with a prebuilt index still works.
pub fn locate(
    archive:  &Path,
    explicit: Option<&Path>,
    folders:  Option<&[PathBuf]>,
) -> Result<IndexLocation> {
    if let Some(explicit) = explicit {
        let text = explicit.to_string_lossy();
        if is_url(&text) {
            return Err(ArcError::Usage(format!(
                "remote index URLs are not supported by this build: {text}"
            )));
        }
        if let Some(staged) = stage_compressed_index(explicit)? {
            return Ok(staged);
        }
        return Ok(IndexLocation::File(explicit.to_path_buf()));
    }

    let defaults;
    let folders = match folders {
        Some(f) if !f.is_empty() => f,
        _ => {
            defaults = default_index_folders(archive);
            &defaults[..]
        }
    };
    let file_name = index_file_name(archive);

    // An index that already exists anywhere on the search path is used in
    // place, even if its folder is not writable.
    for folder in folders {
        let candidate = folder.join(&file_name);
        if candidate.is_file() {
            return Ok(IndexLocation::File(candidate));
        }
    }

    for folder in folders {
        if probe_writable(folder) {
            return Ok(IndexLocation::File(folder.join(&file_name)));
        }
    }

    log::info!("no writable index folder found; building the index in memory");
    Ok(IndexLocation::Memory)
}

/// A folder is writable iff a probe file can actually be created in it.
/// Permission bits alone lie on read-only mounts and network shares.
fn probe_writable(folder: &Path) -> bool {
    if !folder.is_dir() && fs::create_dir_all(folder).is_err() {
        return false;
    }
    let probe = folder.join(".arcmount.writable");
    match fs::OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// If `path` names a compressed index (`*.gz`, `*.xz`, `*.zst`), stage a
/// decompressed copy in a temp dir and return it read-only.  Plain paths
/// return None.
pub fn stage_compressed_index(path: &Path) -> Result<Option<IndexLocation>> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let open = |path: &Path| -> Result<fs::File> {
        fs::File::open(path).map_err(|e| {
            ArcError::Usage(format!("cannot open index file {}: {e}", path.display()))
        })
    };

    let decompress: Box<dyn FnOnce(&mut dyn Write) -> io::Result<u64>> = match extension.as_str() {
        "gz" => {
            let file = open(path)?;
            Box::new(move |out| {
                let mut decoder = flate2::read::MultiGzDecoder::new(file);
                io::copy(&mut decoder, out)
            })
        }
        "xz" => {
            let file = open(path)?;
            Box::new(move |out| {
                let mut decoder = xz2::read::XzDecoder::new(file);
                io::copy(&mut decoder, out)
            })
        }
        "zst" | "zstd" => {
            let file = open(path)?;
            Box::new(move |out| {
                let mut decoder = zstd::stream::read::Decoder::new(file)?;
                io::copy(&mut decoder, out)
            })
        }
        _ => return Ok(None),
    };

    let staging = tempfile::TempDir::new()?;
    let staged_path = staging.path().join("staged.index.sqlite");
    let mut out = fs::File::create(&staged_path)?;
    decompress(&mut out).map_err(|e| {
        ArcError::Usage(format!("cannot decompress index file {}: {e}", path.display()))
    })?;
    out.sync_all()?;

    log::info!("staged compressed index {} for read-only use", path.display());
    Ok(Some(IndexLocation::StagedReadOnly(staged_path, staging)))
}

/// Sanity helper used by tests and the CLI `--recreate-index` path.
pub fn remove_stale(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let tmp = path.with_extension("sqlite.tmp");
    if tmp.exists() {
        fs::remove_file(tmp)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn index_name_is_sibling_convention() {
        assert_eq!(index_file_name(Path::new("/data/foo.tar")), "foo.tar.index.sqlite");
    }

    #[test]
    fn locate_prefers_existing_index() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.tar");
        fs::write(&archive, b"x").unwrap();
        let existing = dir.path().join("a.tar.index.sqlite");
        fs::write(&existing, b"not really sqlite").unwrap();

        let location = locate(&archive, None, Some(&[dir.path().to_path_buf()])).unwrap();
        assert_eq!(location.path().unwrap(), existing.as_path());
    }

    #[test]
    fn locate_falls_through_to_writable_folder() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("b.tar");
        fs::write(&archive, b"x").unwrap();
        let location = locate(&archive, None, Some(&[dir.path().to_path_buf()])).unwrap();
        assert!(location.writable());
        assert_eq!(
            location.path().unwrap().file_name().unwrap().to_str().unwrap(),
            "b.tar.index.sqlite"
        );
    }

    #[test]
    fn url_index_is_a_user_error() {
        let err = locate(
            Path::new("/tmp/a.tar"),
            Some(Path::new("https://example.com/a.index.sqlite")),
            None,
        );
        assert!(matches!(err, Err(ArcError::Usage(_))));
    }

    #[test]
    fn staged_gzip_index() {
        let dir = tempfile::tempdir().unwrap();
        let compressed_path = dir.path().join("idx.index.sqlite.gz");
        let payload = b"pretend this is sqlite";
        {
            let file = fs::File::create(&compressed_path).unwrap();
            let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            enc.write_all(payload).unwrap();
            enc.finish().unwrap();
        }

        let staged = stage_compressed_index(&compressed_path).unwrap().unwrap();
        let staged_path = staged.path().unwrap();
        assert_eq!(fs::read(staged_path).unwrap(), payload);
        assert!(!staged.writable());
    }
}

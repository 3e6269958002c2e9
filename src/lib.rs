//! # arcmount — archives as random-access filesystems
//!
//! Core guarantees:
//! - Sequential compression formats (gzip, bzip2, xz, zstd) are served with
//!   O(log n) seek-point lookup and near-constant-time reads at arbitrary
//!   offsets, backed by per-codec seek tables
//! - Archive metadata lives in a persistent SQLite index; creation is atomic
//!   (temp file + rename) and reuse is gated on a source fingerprint
//! - Mount sources compose: union, subvolumes, recursive auto-mounting,
//!   file versioning, prefix stripping, link resolution, write overlay
//! - The FUSE session is single-threaded; any parallelism (block decoding
//!   worker pools) is owned by a reader and joined before its call returns
//! - Reads recover locally: a corrupt block yields EIO for that range only,
//!   the mount stays up

pub mod error;
pub mod stencil;
pub mod seekindex;
pub mod index;
pub mod formats;
pub mod mountsource;
pub mod overlay;
pub mod fuse;

// Flat re-exports for the most common types.
pub use error::{ArcError, Result};
pub use stencil::{JoinedFile, SeekableSource, SharedSource, StenciledFile, Stencil};
pub use seekindex::{Codec, SeekPoint, SeekTable};
pub use index::{ArchiveIndex, IndexConfig, IndexLocation};
pub use mountsource::{FileInfo, FileKind, MountSource, Userdata};
pub use mountsource::factory::{open_mount_source, MountOptions};
pub use overlay::WriteOverlay;

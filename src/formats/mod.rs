//! Archive format backends.
//!
//! Each backend enumerates a format's entries into the archive index and
//! serves entry payloads through the mount-source contract.  The TAR
//! reader is the central case: it is the only backend that needs the
//! seek-index layer underneath, and the only one with in-archive
//! versioning semantics.

pub mod detect;
pub mod tar;
pub mod zip;
pub mod sqlar;
pub mod squashfs;

pub use detect::{detect_format, ArchiveFormat, Detected};
pub use tar::TarMountSource;
pub use zip::ZipMountSource;
pub use sqlar::SqlarMountSource;
pub use squashfs::SquashfsMountSource;

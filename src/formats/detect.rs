//! Magic-byte sniffing, extension heuristics, and split-file grouping.
//!
//! Magic bytes decide; extensions only break ties (a `.tar` with ZIP magic
//! is a ZIP).  Compression codecs and archive formats are detected
//! separately because they stack: a `.tar.gz` is first a gzip stream, and
//! only the decompressed head reveals the TAR inside.

use std::io::{Read, Seek};

use crate::seekindex::{peek_head, Codec};

/// Bytes of head needed for every magic check (the TAR magic sits at 257).
pub const DETECT_HEAD_LEN: usize = 512;

// ── Archive formats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    Zip,
    Sqlar,
    SquashFs,
    Rar,
    SevenZip,
    Ext4,
    Fat,
}

impl ArchiveFormat {
    pub fn name(self) -> &'static str {
        match self {
            ArchiveFormat::Tar      => "tar",
            ArchiveFormat::Zip      => "zip",
            ArchiveFormat::Sqlar    => "sqlar",
            ArchiveFormat::SquashFs => "squashfs",
            ArchiveFormat::Rar      => "rar",
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Ext4     => "ext4",
            ArchiveFormat::Fat      => "fat",
        }
    }

    /// Backends actually shipped in this build.  The others are recognized
    /// and reported as missing, mirroring optional-dependency behavior.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            ArchiveFormat::Tar | ArchiveFormat::Zip | ArchiveFormat::Sqlar | ArchiveFormat::SquashFs
        )
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "tar"      => Some(ArchiveFormat::Tar),
            "zip"      => Some(ArchiveFormat::Zip),
            "sqlar"    => Some(ArchiveFormat::Sqlar),
            "squashfs" => Some(ArchiveFormat::SquashFs),
            "rar"      => Some(ArchiveFormat::Rar),
            "7z"       => Some(ArchiveFormat::SevenZip),
            "ext4"     => Some(ArchiveFormat::Ext4),
            "fat"      => Some(ArchiveFormat::Fat),
            _          => None,
        }
    }
}

/// What the sniffer concluded about a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detected {
    /// Outermost compression, if any.
    pub compression: Option<Codec>,
    /// Archive format of the (possibly still compressed) content.  None
    /// for a raw compressed stream with unknown content or no match.
    pub archive:     Option<ArchiveFormat>,
}

/// Sniff the head of a raw stream.  For compressed streams, only the
/// compression is detected here; callers re-sniff the decompressed head.
pub fn detect_format<R: Read + Seek>(reader: &mut R) -> std::io::Result<Detected> {
    let head = peek_head(reader, DETECT_HEAD_LEN)?;
    Ok(Detected {
        compression: Codec::detect(&head),
        archive:     detect_archive(&head),
    })
}

/// Match archive magics against an uncompressed head.
pub fn detect_archive(head: &[u8]) -> Option<ArchiveFormat> {
    if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        return Some(ArchiveFormat::Zip);
    }
    if head.starts_with(b"SQLite format 3\0") {
        // Every SQLAR is a SQLite file; the backend verifies the `sqlar`
        // table exists before claiming it.
        return Some(ArchiveFormat::Sqlar);
    }
    if head.starts_with(b"hsqs") || head.starts_with(b"sqsh") {
        return Some(ArchiveFormat::SquashFs);
    }
    if head.starts_with(b"Rar!\x1a\x07") {
        return Some(ArchiveFormat::Rar);
    }
    if head.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]) {
        return Some(ArchiveFormat::SevenZip);
    }
    if is_tar_header(head) {
        return Some(ArchiveFormat::Tar);
    }
    // EXT4: superblock magic 0xEF53 at offset 0x438 — past our head
    // window for the common 512-byte sniff, so check only when available.
    if head.len() > 0x439 && head[0x438] == 0x53 && head[0x439] == 0xef {
        return Some(ArchiveFormat::Ext4);
    }
    if is_fat_header(head) {
        return Some(ArchiveFormat::Fat);
    }
    None
}

/// ustar/GNU magic at offset 257, or a plausible v7 header: non-empty
/// NUL-terminated name plus a valid octal checksum field.
fn is_tar_header(head: &[u8]) -> bool {
    if head.len() < 512 {
        return false;
    }
    if &head[257..262] == b"ustar" {
        return true;
    }
    // v7 fallback: verify the header checksum.
    let stored = parse_octal(&head[148..156]);
    let Some(stored) = stored else { return false };
    let mut sum = 0u64;
    for (i, &b) in head[..512].iter().enumerate() {
        sum += if (148..156).contains(&i) { b' ' as u64 } else { b as u64 };
    }
    head[0] != 0 && sum == stored
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text: Vec<u8> = field
        .iter()
        .copied()
        .filter(|&b| b != b' ' && b != 0)
        .collect();
    if text.is_empty() {
        return None;
    }
    let mut value = 0u64;
    for b in text {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        value = value * 8 + (b - b'0') as u64;
    }
    Some(value)
}

/// FAT boot sector: x86 jump opcode and the 0x55AA signature at 510.
fn is_fat_header(head: &[u8]) -> bool {
    head.len() >= 512
        && matches!(head[0], 0xeb | 0xe9)
        && head[510] == 0x55
        && head[511] == 0xaa
}

// ── Extension heuristics ──────────────────────────────────────────────────────

/// Suffixes that mark a file as an archive worth recursing into.
pub fn archive_suffixes() -> &'static [&'static str] {
    &[
        "tar", "tgz", "tbz2", "tbz", "tb2", "txz", "tzst",
        "tar.gz", "tar.bz2", "tar.xz", "tar.zst", "tar.zstd",
        "zip", "sqlar", "squashfs", "sfs", "snap",
        "gz", "bz2", "xz", "zst", "zstd",
    ]
}

/// Strip one recognized archive suffix, returning the stem, or None when
/// the name carries no archive suffix.
pub fn strip_archive_suffix(name: &str) -> Option<&str> {
    let lower = name.to_lowercase();
    // Longest suffixes first so "x.tar.gz" strips to "x", not "x.tar".
    let mut suffixes: Vec<&str> = archive_suffixes().to_vec();
    suffixes.sort_by_key(|s| std::cmp::Reverse(s.len()));
    for suffix in suffixes {
        let dotted = format!(".{suffix}");
        if lower.ends_with(&dotted) && name.len() > dotted.len() {
            return Some(&name[..name.len() - dotted.len()]);
        }
    }
    None
}

// ── Split files ───────────────────────────────────────────────────────────────

/// Does `name` look like the first part of a split file (`foo.001`,
/// `foo.000`, `foo.aa`)?  Returns the stem.
pub fn split_first_part(name: &str) -> Option<&str> {
    let (stem, suffix) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    let bytes = suffix.as_bytes();
    let all_digits = !bytes.is_empty() && bytes.iter().all(u8::is_ascii_digit);
    if all_digits {
        let value: u64 = suffix.parse().ok()?;
        return (value <= 1).then_some(stem);
    }
    let all_a = !bytes.is_empty() && bytes.iter().all(|&b| b == b'a');
    let all_upper_a = !bytes.is_empty() && bytes.iter().all(|&b| b == b'A');
    (all_a || all_upper_a).then_some(stem)
}

/// Given the first part's name and its sibling names, return every part
/// in order, or None when the numbering has gaps.
pub fn collect_split_parts(first: &str, siblings: &[String]) -> Option<Vec<String>> {
    let (stem, suffix) = first.rsplit_once('.')?;
    let width = suffix.len();
    let numeric = suffix.bytes().all(|b| b.is_ascii_digit());

    let mut parts: Vec<(u64, String)> = Vec::new();
    for name in siblings {
        let Some((s, ext)) = name.rsplit_once('.') else { continue };
        if s != stem || ext.len() != width {
            continue;
        }
        let rank = if numeric {
            let Ok(v) = ext.parse::<u64>() else { continue };
            v
        } else if ext.bytes().all(|b| b.is_ascii_lowercase())
            || ext.bytes().all(|b| b.is_ascii_uppercase())
        {
            // Base-26 rank of an alphabetic suffix ("aa" = 0, "ab" = 1).
            ext.bytes()
                .fold(0u64, |acc, b| acc * 26 + (b.to_ascii_lowercase() - b'a') as u64)
        } else {
            continue;
        };
        parts.push((rank, name.clone()));
    }
    parts.sort();
    parts.dedup();

    // The numbering must be contiguous starting at the first part's rank.
    let start = parts.first()?.0;
    for (i, (rank, _)) in parts.iter().enumerate() {
        if *rank != start + i as u64 {
            return None;
        }
    }
    (parts.len() > 1).then(|| parts.into_iter().map(|(_, name)| name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn detects_compressed_streams() {
        let mut gz = Cursor::new(vec![0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff]);
        let d = detect_format(&mut gz).unwrap();
        assert_eq!(d.compression, Some(Codec::Gzip));
        assert_eq!(d.archive, None);
    }

    #[test]
    fn detects_zip_and_squashfs() {
        assert_eq!(detect_archive(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(detect_archive(b"hsqs...."), Some(ArchiveFormat::SquashFs));
        assert_eq!(detect_archive(b"SQLite format 3\0"), Some(ArchiveFormat::Sqlar));
        assert_eq!(detect_archive(b"Rar!\x1a\x07\x00"), Some(ArchiveFormat::Rar));
        assert_eq!(
            detect_archive(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]),
            Some(ArchiveFormat::SevenZip)
        );
    }

    #[test]
    fn detects_ustar() {
        let mut head = vec![0u8; 512];
        head[..4].copy_from_slice(b"foo\0");
        head[257..262].copy_from_slice(b"ustar");
        assert_eq!(detect_archive(&head), Some(ArchiveFormat::Tar));
    }

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_archive_suffix("a.tar.gz"), Some("a"));
        assert_eq!(strip_archive_suffix("a.tgz"), Some("a"));
        assert_eq!(strip_archive_suffix("a.tar"), Some("a"));
        assert_eq!(strip_archive_suffix("archive.zip"), Some("archive"));
        assert_eq!(strip_archive_suffix("readme.txt"), None);
        assert_eq!(strip_archive_suffix(".tar"), None);
    }

    #[test]
    fn split_part_detection() {
        assert_eq!(split_first_part("foo.001"), Some("foo"));
        assert_eq!(split_first_part("foo.000"), Some("foo"));
        assert_eq!(split_first_part("foo.aa"), Some("foo"));
        assert_eq!(split_first_part("foo.002"), None);
        assert_eq!(split_first_part("foo.ab"), None);
        assert_eq!(split_first_part("foo.txt"), None);
    }

    #[test]
    fn split_collection() {
        let siblings: Vec<String> = ["foo.001", "foo.002", "foo.003", "bar.001", "foo.01"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parts = collect_split_parts("foo.001", &siblings).unwrap();
        assert_eq!(parts, vec!["foo.001", "foo.002", "foo.003"]);

        // Gap in numbering → not a split set.
        let gappy: Vec<String> = ["foo.001", "foo.003"].iter().map(|s| s.to_string()).collect();
        assert!(collect_split_parts("foo.001", &gappy).is_none());
    }
}

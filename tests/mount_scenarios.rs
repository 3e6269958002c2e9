//! End-to-end scenarios exercised at the mount-source level: the same
//! operations the FUSE adapter issues, without a kernel mount.

use std::io::{Cursor, Write};
use std::path::PathBuf;

use arcmount::mountsource::factory::{assemble_tree, open_mount_source, MountOptions};
use arcmount::mountsource::MountSource;
use arcmount::overlay::WriteOverlay;

fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000);
        header.set_cksum();
        builder.append(&header, Cursor::new(data)).unwrap();
    }
    builder.into_inner().unwrap()
}

fn write_file(dir: &std::path::Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn read_all(source: &mut dyn MountSource, path: &str) -> Vec<u8> {
    let info = source.lookup(path, 0).unwrap().unwrap();
    source.read(&info, info.size as usize, 0).unwrap()
}

#[test]
fn single_file_tar() {
    let dir = tempfile::tempdir().unwrap();
    let tar_path = write_file(dir.path(), "single.tar", &build_tar(&[("bar", b"foo\n")]));

    let mut tree = assemble_tree(&[tar_path], &MountOptions::default()).unwrap();
    let listing = tree.list("/").unwrap().unwrap();
    assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["bar"]);
    assert_eq!(read_all(tree.as_mut(), "/bar"), b"foo\n");

    let info = tree.lookup("/bar", 0).unwrap().unwrap();
    assert!(tree.list_xattr(&info).unwrap().is_empty());
}

#[test]
fn nested_recursive_tar() {
    let dir = tempfile::tempdir().unwrap();
    let inner = build_tar(&[("foo/fighter/ufo", b"iriya\n")]);
    let outer = build_tar(&[
        ("foo/fighter/ufo", b"outer content\n"),
        ("foo/lighter.tar", &inner),
    ]);
    let tar_path = write_file(dir.path(), "nested.tar", &outer);

    let options = MountOptions { recursion_depth: u32::MAX, ..Default::default() };
    let mut tree = assemble_tree(&[tar_path], &options).unwrap();

    assert_eq!(
        read_all(tree.as_mut(), "/foo/lighter.tar/foo/fighter/ufo"),
        b"iriya\n"
    );
    // The outer sibling file is untouched by the recursion.
    assert_eq!(read_all(tree.as_mut(), "/foo/fighter/ufo"), b"outer content\n");
}

#[test]
fn union_with_overwrite_and_versions() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    write_file(a.path(), "ufo", b"iriya in folder 1\n");
    write_file(b.path(), "ufo", b"iriya\n");

    let mut tree = assemble_tree(
        &[a.path().to_path_buf(), b.path().to_path_buf()],
        &MountOptions::default(),
    )
    .unwrap();

    // The rightmost input wins; both stay reachable through versions.
    assert_eq!(read_all(tree.as_mut(), "/ufo"), b"iriya\n");
    assert_eq!(tree.versions("/ufo").unwrap(), 2);
    assert_eq!(read_all(tree.as_mut(), "/ufo.versions/1"), b"iriya in folder 1\n");
    assert_eq!(read_all(tree.as_mut(), "/ufo.versions/2"), b"iriya\n");

    let listing = tree.list("/").unwrap().unwrap();
    assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["ufo"]);
}

#[test]
fn gzip_random_access() {
    // Multi-member gzip of pseudo-random bytes; every member start is a
    // seek point, so probes far into the stream never decode from zero.
    let mut state = 0x9e3779b97f4a7c15u64;
    let mut data = Vec::with_capacity(8 * 1024 * 1024);
    for _ in 0..8 * 1024 * 1024 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        data.push((state >> 33) as u8);
    }

    let dir = tempfile::tempdir().unwrap();
    let mut compressed = Vec::new();
    for chunk in data.chunks(1024 * 1024) {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(chunk).unwrap();
        compressed.extend(encoder.finish().unwrap());
    }
    let path = write_file(dir.path(), "random.bin.gz", &compressed);

    let mut source = open_mount_source(&path, &MountOptions::default()).unwrap();
    let info = source.lookup("/random.bin", 0).unwrap().unwrap();
    assert_eq!(info.size, data.len() as u64);

    let len = data.len() as u64;
    for offset in [0, 1024 * 1024, 1024 * 1024 + 1, 7 * 1024 * 1024, len - 1] {
        let byte = source.read(&info, 1, offset).unwrap();
        assert_eq!(byte[0], data[offset as usize], "offset {offset}");
    }
}

#[test]
fn write_overlay_scenario() {
    let archive_dir = tempfile::tempdir().unwrap();
    let overlay_dir = tempfile::tempdir().unwrap();
    let tar_path = write_file(archive_dir.path(), "base.tar", &build_tar(&[("a", b"x")]));

    {
        let tree = assemble_tree(&[tar_path.clone()], &MountOptions::default()).unwrap();
        let mut overlay = WriteOverlay::new(overlay_dir.path(), tree).unwrap();

        assert_eq!(read_all(&mut overlay, "/a"), b"x");

        overlay.unlink("/a").unwrap();
        assert!(overlay.lookup("/a", 0).unwrap().is_none());
        assert_eq!(overlay.versions("/a").unwrap(), 0);

        let mut file = overlay.create("/a", 0o644).unwrap();
        file.write_all(b"y").unwrap();
        drop(file);
        assert_eq!(read_all(&mut overlay, "/a"), b"y");
    }

    // Close and remount: the overlay state survives in the sidecar.
    let tree = assemble_tree(&[tar_path], &MountOptions::default()).unwrap();
    let mut overlay = WriteOverlay::new(overlay_dir.path(), tree).unwrap();
    assert_eq!(read_all(&mut overlay, "/a"), b"y");
}

#[test]
fn split_archive() {
    let dir = tempfile::tempdir().unwrap();
    let mut compressed = Vec::new();
    {
        let mut encoder =
            bzip2::write::BzEncoder::new(&mut compressed, bzip2::Compression::best());
        encoder.write_all(b"foobar").unwrap();
        encoder.finish().unwrap();
    }
    let half = compressed.len() / 2;
    write_file(dir.path(), "foo.001", &compressed[..half]);
    write_file(dir.path(), "foo.002", &compressed[half..]);

    let mut source =
        open_mount_source(&dir.path().join("foo.001"), &MountOptions::default()).unwrap();
    let listing = source.list("/").unwrap().unwrap();
    assert_eq!(listing.len(), 1);
    let name = listing.keys().next().unwrap().clone();
    assert_eq!(read_all(source.as_mut(), &format!("/{name}")), b"foobar");
}

#[test]
fn index_roundtrip_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let tar_path = write_file(
        dir.path(),
        "stable.tar",
        &build_tar(&[("one", b"1"), ("two", b"22"), ("sub/three", b"333")]),
    );

    let snapshot = |source: &mut dyn MountSource| {
        let mut rows = Vec::new();
        let mut pending = vec!["/".to_string()];
        while let Some(folder) = pending.pop() {
            for (name, info) in source.list(&folder).unwrap().unwrap() {
                let path = if folder == "/" { format!("/{name}") } else { format!("{folder}/{name}") };
                if info.is_dir() {
                    pending.push(path.clone());
                }
                rows.push((path, info.size, info.mode));
            }
        }
        rows.sort();
        rows
    };

    let first = {
        let mut source = open_mount_source(&tar_path, &MountOptions::default()).unwrap();
        snapshot(source.as_mut())
    };
    assert!(dir.path().join("stable.tar.index.sqlite").exists());

    // Second process lifetime: the persisted index must answer alike.
    let second = {
        let mut source = open_mount_source(&tar_path, &MountOptions::default()).unwrap();
        snapshot(source.as_mut())
    };
    assert_eq!(first, second);
}

#[test]
fn zip_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("greeting.txt", zip::write::FileOptions::default())
        .unwrap();
    writer.write_all(b"hello zip").unwrap();
    let bytes = writer.finish().unwrap().into_inner();
    let path = write_file(dir.path(), "x.zip", &bytes);

    let mut source = open_mount_source(&path, &MountOptions::default()).unwrap();
    assert_eq!(read_all(source.as_mut(), "/greeting.txt"), b"hello zip");
}

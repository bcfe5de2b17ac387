//! Integration tests for the full layer-disk pipeline: directory tree →
//! ext4 image → verity hash tree → GPT-labelled disk.

use std::io::Cursor;
use std::os::unix::fs::symlink;

use gcs_imagefs::{dirtree, gpt, verity, BLOCK_SIZE};

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// A small but representative layer: nested directories, a regular file
/// with contents, a symlink, and a hard link.
fn build_layer_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
    std::fs::create_dir_all(dir.path().join("etc")).unwrap();
    std::fs::write(dir.path().join("usr/bin/app"), vec![0xC3u8; 10_000]).unwrap();
    std::fs::write(dir.path().join("etc/hostname"), b"layer-test\n").unwrap();
    symlink("/usr/bin/app", dir.path().join("usr/bin/app-link")).unwrap();
    std::fs::hard_link(
        dir.path().join("etc/hostname"),
        dir.path().join("etc/hostname.bak"),
    )
    .unwrap();
    dir
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

// ============================================================================
// TREE → EXT4
// ============================================================================

#[test]
fn tree_to_ext4_produces_consistent_image() {
    let tree = build_layer_tree();
    let mut image = Cursor::new(Vec::new());
    let size = dirtree::write_from_dir(tree.path(), &mut image).unwrap();
    let image = image.into_inner();

    assert_eq!(size as usize, image.len());
    assert_eq!(image.len() % BLOCK_SIZE, 0);
    // Superblock magic, and the block count covers the image exactly.
    assert_eq!(read_u16(&image, 1024 + 56), 0xEF53);
    assert_eq!(read_u32(&image, 1024 + 4) as usize * BLOCK_SIZE, image.len());
    // Fully packed: no free blocks.
    assert_eq!(read_u32(&image, 1024 + 12), 0);
}

#[test]
fn identical_trees_produce_identical_images() {
    // Two passes over the same tree give byte-identical images, which is
    // what makes layer digests reproducible.
    let tree = build_layer_tree();
    let mut a = Cursor::new(Vec::new());
    let mut b = Cursor::new(Vec::new());
    dirtree::write_from_dir(tree.path(), &mut a).unwrap();
    dirtree::write_from_dir(tree.path(), &mut b).unwrap();
    assert_eq!(a.into_inner(), b.into_inner());
}

// ============================================================================
// EXT4 → VERITY → GPT
// ============================================================================

#[test]
fn full_pipeline_root_hash_verifies_against_tree() {
    let tree = build_layer_tree();
    let mut image = Cursor::new(Vec::new());
    let fs_size = dirtree::write_from_dir(tree.path(), &mut image).unwrap();
    let image = image.into_inner();

    let mut disk = Cursor::new(Vec::new());
    let info = gpt::write_disk(Cursor::new(&image), fs_size, &mut disk, true).unwrap();
    let disk = disk.into_inner();
    let root_hash = info.root_hash.expect("verity requested");

    // Recompute the tree independently over the filesystem bytes embedded
    // in the partition; the root hashes must agree.
    let body = gpt::FIRST_USABLE_LBA as usize * gpt::LBA_SIZE as usize;
    let embedded_fs = &disk[body..body + fs_size as usize];
    assert_eq!(embedded_fs, &image[..]);
    let tree = verity::build_tree(Cursor::new(embedded_fs), fs_size).unwrap();
    assert_eq!(tree.root_hash, root_hash);

    // Verity superblock sits right after the filesystem and describes it.
    let sb = body + fs_size as usize;
    assert_eq!(&disk[sb..sb + 8], b"verity\0\0");
    assert_eq!(
        u64::from_le_bytes(disk[sb + 72..sb + 80].try_into().unwrap()),
        fs_size / BLOCK_SIZE as u64
    );
}

#[test]
fn disk_label_is_well_formed() {
    let tree = build_layer_tree();
    let mut image = Cursor::new(Vec::new());
    let fs_size = dirtree::write_from_dir(tree.path(), &mut image).unwrap();
    let image = image.into_inner();

    let mut disk = Cursor::new(Vec::new());
    let info = gpt::write_disk(Cursor::new(&image), fs_size, &mut disk, false).unwrap();
    let disk = disk.into_inner();
    assert_eq!(disk.len() as u64, info.disk_size);

    // PMBR: signature and a protective partition starting at LBA 1.
    assert_eq!(&disk[510..512], [0x55, 0xAA]);
    assert_eq!(disk[446 + 4], 0xEE);

    // Primary and backup headers carry the same disk GUID and reference
    // each other.
    let primary = &disk[512..1024];
    let backup = &disk[disk.len() - 512..];
    assert_eq!(&primary[0..8], b"EFI PART");
    assert_eq!(&backup[0..8], b"EFI PART");
    assert_eq!(&primary[56..72], &backup[56..72]); // disk GUID
    let alternate = u64::from_le_bytes(primary[32..40].try_into().unwrap());
    assert_eq!(alternate as usize * 512, disk.len() - 512);
    assert_eq!(u64::from_le_bytes(backup[32..40].try_into().unwrap()), 1);
}

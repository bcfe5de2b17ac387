//! Build an ext4 image from an on-disk directory tree.
//!
//! Preserves mode, uid/gid, mtime, extended attributes, symlink targets, and
//! hard links. Entries are visited parents-first in name order so the
//! resulting inode numbering is deterministic for identical input trees.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use walkdir::WalkDir;

use gcs_shared::{GcsError, GcsResult};

use crate::ext4::{Attributes, Timestamp, Writer};

/// Write the tree rooted at `root` into a new ext4 image on `out`.
/// Returns the image size in bytes.
pub fn write_from_dir<W: Write + Seek>(root: &Path, out: W) -> GcsResult<u64> {
    let mut writer = Writer::new(out)?;
    // (dev, ino) of multiply-linked files seen so far → image path.
    let mut hard_links: HashMap<(u64, u64), String> = HashMap::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            GcsError::Unexpected(format!("walk {}: {}", root.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| GcsError::Unexpected("walked path outside root".to_string()))?;
        let rel = rel.to_str().ok_or_else(|| {
            GcsError::InvalidArgument(format!("non-UTF-8 path {:?}", rel))
        })?;

        let meta = entry
            .metadata()
            .map_err(|e| GcsError::Unexpected(format!("stat {}: {}", entry.path().display(), e)))?;

        let file_type = entry.file_type();
        if file_type.is_file() && meta.nlink() > 1 {
            let key = (meta.dev(), meta.ino());
            if let Some(target) = hard_links.get(&key) {
                writer.link(target, rel)?;
                continue;
            }
            hard_links.insert(key, rel.to_string());
        }

        let mut attrs = Attributes {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec() as u32),
            atime: Timestamp::new(meta.atime(), meta.atime_nsec() as u32),
            ctime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
            ..Default::default()
        };

        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| {
                GcsError::io(format!("readlink {}", entry.path().display()), e)
            })?;
            attrs.link_target = Some(target.into_os_string().into_encoded_bytes());
        } else {
            // Symlink xattrs are not portable through the xattr crate; every
            // other type carries its attributes over.
            attrs.xattrs = read_xattrs(entry.path())?;
        }

        if file_type.is_char_device() || file_type.is_block_device() {
            attrs.device = Some(split_rdev(meta.rdev()));
        }

        writer.create(rel, &attrs)?;
        if file_type.is_file() {
            let mut f = File::open(entry.path())
                .map_err(|e| GcsError::io(format!("open {}", entry.path().display()), e))?;
            io::copy(&mut f, &mut writer)
                .map_err(|e| GcsError::io(format!("copy {}", entry.path().display()), e))?;
        }
    }

    let size = writer.finish()?;
    tracing::debug!(root = %root.display(), size, "ext4 image written from tree");
    Ok(size)
}

fn read_xattrs(path: &Path) -> GcsResult<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let names = match xattr::list(path) {
        Ok(names) => names,
        // Filesystems without xattr support simply contribute none.
        Err(_) => return Ok(out),
    };
    for name in names {
        let name = match name.to_str() {
            Some(n) => n.to_string(),
            None => continue,
        };
        if let Ok(Some(value)) = xattr::get(path, &name) {
            out.push((name, value));
        }
    }
    Ok(out)
}

/// Decompose a Linux `st_rdev` into `(major, minor)`.
fn split_rdev(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xFFF) | ((rdev >> 32) & !0xFFF);
    let minor = (rdev & 0xFF) | ((rdev >> 12) & !0xFF);
    (major as u32, minor as u32)
}

//! Compact read-only ext4 image writer.
//!
//! The writer emits a valid filesystem in a single forward pass over a
//! `Write + Seek` sink: file data and directory blocks stream out as they are
//! produced, and [`Writer::finish`] appends the inode table and bitmaps, then
//! seeks back to fill in the group descriptors (block 1) and superblock
//! (byte 1024). Images are fully packed: every block below the end of the
//! image is allocated.
//!
//! Layout produced:
//!
//! ```text
//! | block 0: superblock | block 1: descriptors | data / dirs / xattr blocks |
//! | inode table | per-group block+inode bitmaps |
//! ```

mod format;
pub mod xattr;

use std::collections::HashMap;
use std::io::{self, Seek, SeekFrom, Write};

use gcs_shared::{GcsError, GcsResult};

pub use format::{BLOCK_SIZE, INODE_SIZE, MAX_INLINE_FILE, MAX_INLINE_SYMLINK};

use format::*;
use xattr::{place_entries, write_block as write_xattr_block, write_inline, XattrEntry};

/// Seconds + nanoseconds timestamp attached to an inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Timestamp { secs, nanos }
    }
}

/// Attributes for a new filesystem object.
///
/// `mode` carries the file-type bits (`S_IFREG`, `S_IFDIR`, ...); the
/// convenience constructors fill them in.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub xattrs: Vec<(String, Vec<u8>)>,
    /// Symlink target; requires `S_IFLNK` in `mode`.
    pub link_target: Option<Vec<u8>>,
    /// Device `(major, minor)`; requires `S_IFCHR`/`S_IFBLK` in `mode`.
    pub device: Option<(u32, u32)>,
}

impl Attributes {
    pub fn regular(mode: u32) -> Self {
        Attributes {
            mode: u32::from(S_IFREG) | (mode & 0o7777),
            ..Default::default()
        }
    }

    pub fn directory(mode: u32) -> Self {
        Attributes {
            mode: u32::from(S_IFDIR) | (mode & 0o7777),
            ..Default::default()
        }
    }

    pub fn symlink(target: impl Into<Vec<u8>>) -> Self {
        Attributes {
            mode: u32::from(S_IFLNK) | 0o777,
            link_target: Some(target.into()),
            ..Default::default()
        }
    }
}

/// Writer options.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Store small regular files in the inode (`i_block` plus the xattr
    /// tail) instead of allocating a data block.
    pub inline_data: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options { inline_data: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    logical: u32,
    physical: u32,
    len: u32,
}

#[derive(Debug)]
struct Inode {
    mode: u16,
    uid: u32,
    gid: u32,
    size: u64,
    atime: Timestamp,
    ctime: Timestamp,
    mtime: Timestamp,
    crtime: Timestamp,
    links: u16,
    flags: u32,
    /// Raw `i_block` content: extent tree root, inline data head, symlink
    /// target, or device number.
    block_data: [u8; 60],
    /// 512-byte sectors charged to this inode.
    sectors: u64,
    /// Attributes as given; split between the inode tail and the external
    /// block at finish time, once the inline-data slot size is known.
    xattrs: Vec<XattrEntry>,
    /// Regular xattr entries kept in the inode tail.
    inline_xattrs: Vec<XattrEntry>,
    /// The synthetic `system.data` slot for inline files; serialized before
    /// the regular entries.
    inline_data_xattr: Option<XattrEntry>,
    /// Block number of the external xattr block, once written.
    xattr_block: u32,
    /// Directory children as `(name, inode)`, real entries only.
    children: Option<Vec<(Vec<u8>, u32)>>,
    /// Parent inode, directories only.
    parent: u32,
}

impl Default for Inode {
    fn default() -> Self {
        Inode {
            mode: Default::default(),
            uid: Default::default(),
            gid: Default::default(),
            size: Default::default(),
            atime: Default::default(),
            ctime: Default::default(),
            mtime: Default::default(),
            crtime: Default::default(),
            links: Default::default(),
            flags: Default::default(),
            block_data: [0; 60],
            sectors: Default::default(),
            xattrs: Default::default(),
            inline_xattrs: Default::default(),
            inline_data_xattr: Default::default(),
            xattr_block: Default::default(),
            children: Default::default(),
            parent: Default::default(),
        }
    }
}

impl Inode {
    fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

struct CurrentFile {
    inode: u32,
    /// Head of the file, kept in memory while inline storage is possible.
    buf: Vec<u8>,
    /// First data block on disk, once streaming started.
    start_block: u32,
    blocks_on_disk: u32,
    size: u64,
}

/// Single-pass ext4 image writer.
pub struct Writer<W: Write + Seek> {
    out: W,
    options: Options,
    /// Next free block; blocks 0 and 1 are reserved for the superblock and
    /// group descriptors.
    block: u32,
    inodes: Vec<Inode>,
    paths: HashMap<String, u32>,
    cur: Option<CurrentFile>,
    inline_used: bool,
    finished: bool,
}

impl<W: Write + Seek> Writer<W> {
    /// Start a new image. The root directory and `lost+found` are created
    /// with default attributes; `create("/", ...)` replaces the root's.
    pub fn new(out: W) -> GcsResult<Self> {
        Self::with_options(out, Options::default())
    }

    pub fn with_options(mut out: W, options: Options) -> GcsResult<Self> {
        // Reserve blocks 0 (superblock) and 1 (group descriptors).
        out.seek(SeekFrom::Start(0))
            .map_err(|e| GcsError::io("seek image start", e))?;
        out.write_all(&[0u8; 2 * BLOCK_SIZE])
            .map_err(|e| GcsError::io("reserve metadata blocks", e))?;

        let mut w = Writer {
            out,
            options,
            block: 2,
            inodes: Vec::new(),
            paths: HashMap::new(),
            cur: None,
            inline_used: false,
            finished: false,
        };

        // Inodes 1..=10 are reserved; 2 is the root, the rest stay zeroed.
        for _ in 0..10 {
            w.inodes.push(Inode::default());
        }
        let root = w.inode_mut(ROOT_INODE);
        root.mode = S_IFDIR | 0o755;
        root.links = 2;
        root.children = Some(Vec::new());
        root.parent = ROOT_INODE;
        w.paths.insert(String::new(), ROOT_INODE);

        let lf = w.alloc_inode();
        debug_assert_eq!(lf, LOST_AND_FOUND_INODE);
        let node = w.inode_mut(lf);
        node.mode = S_IFDIR | 0o700;
        node.links = 2;
        node.children = Some(Vec::new());
        node.parent = ROOT_INODE;
        w.add_child(ROOT_INODE, b"lost+found", lf)?;
        w.inode_mut(ROOT_INODE).links += 1;
        w.paths.insert("lost+found".to_string(), lf);

        Ok(w)
    }

    /// Create a filesystem object. Regular files become the current file;
    /// stream their contents through the `io::Write` impl before the next
    /// `create`/`link`/`finish` call.
    pub fn create(&mut self, path: &str, attrs: &Attributes) -> GcsResult<u32> {
        self.finalize_current()?;
        let path = normalize_path(path)?;

        let file_type = (attrs.mode as u16) & S_IFMT;
        if path.is_empty() {
            // Replacing root attributes; type must stay a directory.
            if file_type != S_IFDIR {
                return Err(GcsError::InvalidArgument(
                    "root must be a directory".to_string(),
                ));
            }
            self.apply_attrs(ROOT_INODE, attrs)?;
            return Ok(ROOT_INODE);
        }

        if self.paths.contains_key(&path) {
            return Err(GcsError::InvalidArgument(format!(
                "path {:?} already exists",
                path
            )));
        }

        let (parent_path, name) = split_parent(&path);
        let parent = *self.paths.get(parent_path).ok_or_else(|| {
            GcsError::InvalidArgument(format!("parent directory {:?} missing", parent_path))
        })?;
        if !self.inode(parent).is_dir() {
            return Err(GcsError::InvalidArgument(format!(
                "parent {:?} is not a directory",
                parent_path
            )));
        }

        let ino = self.alloc_inode();
        self.apply_attrs(ino, attrs)?;
        let node = self.inode_mut(ino);
        node.links = 1;
        node.parent = parent;

        match file_type {
            S_IFDIR => {
                let node = self.inode_mut(ino);
                node.links = 2;
                node.children = Some(Vec::new());
                self.inode_mut(parent).links += 1;
            }
            S_IFLNK => {
                let target = attrs
                    .link_target
                    .clone()
                    .ok_or_else(|| GcsError::InvalidArgument("symlink without target".into()))?;
                self.write_symlink(ino, &target)?;
            }
            S_IFREG => {
                self.cur = Some(CurrentFile {
                    inode: ino,
                    buf: Vec::new(),
                    start_block: 0,
                    blocks_on_disk: 0,
                    size: 0,
                });
            }
            S_IFCHR | S_IFBLK => {
                let (major, minor) = attrs.device.ok_or_else(|| {
                    GcsError::InvalidArgument("device node without device number".into())
                })?;
                let node = self.inode_mut(ino);
                if major < 256 && minor < 256 {
                    node.block_data[0..4].copy_from_slice(&((major << 8) | minor).to_le_bytes());
                } else {
                    let dev = (minor & 0xFF) | (major << 8) | ((minor & !0xFF) << 12);
                    node.block_data[4..8].copy_from_slice(&dev.to_le_bytes());
                }
            }
            S_IFIFO | S_IFSOCK => {}
            _ => {
                return Err(GcsError::InvalidArgument(format!(
                    "unsupported file type in mode {:#o}",
                    attrs.mode
                )))
            }
        }

        self.add_child(parent, name.as_bytes(), ino)?;
        self.paths.insert(path, ino);
        Ok(ino)
    }

    /// Add a hard link to an existing non-directory object.
    pub fn link(&mut self, target: &str, path: &str) -> GcsResult<()> {
        self.finalize_current()?;
        let target = normalize_path(target)?;
        let path = normalize_path(path)?;

        let target_ino = *self
            .paths
            .get(&target)
            .ok_or_else(|| GcsError::InvalidArgument(format!("link target {:?} missing", target)))?;
        if self.inode(target_ino).is_dir() {
            return Err(GcsError::InvalidArgument(
                "hard links to directories are not allowed".to_string(),
            ));
        }
        if self.paths.contains_key(&path) {
            return Err(GcsError::InvalidArgument(format!(
                "path {:?} already exists",
                path
            )));
        }

        let (parent_path, name) = split_parent(&path);
        let parent = *self.paths.get(parent_path).ok_or_else(|| {
            GcsError::InvalidArgument(format!("parent directory {:?} missing", parent_path))
        })?;
        self.add_child(parent, name.as_bytes(), target_ino)?;
        self.inode_mut(target_ino).links += 1;
        self.paths.insert(path, target_ino);
        Ok(())
    }

    /// Finish the image: flush directories, xattr blocks, the inode table,
    /// bitmaps, group descriptors, and the superblock. Returns the image
    /// size in bytes.
    pub fn finish(&mut self) -> GcsResult<u64> {
        if self.finished {
            return Err(GcsError::Unexpected("image already finished".to_string()));
        }
        self.finalize_current()?;

        // Directory data blocks, in inode order so child inode numbers in
        // any parent are already final.
        for ino in 1..=self.inode_count() {
            if self.inode(ino).children.is_some() {
                self.write_directory(ino)?;
            }
        }

        // Extended attributes: the inline-data slot claims inode-tail space
        // first, then regular entries fill the remainder and overflow into a
        // dedicated block.
        for ino in 1..=self.inode_count() {
            let node = self.inode_mut(ino);
            if node.xattrs.is_empty() {
                continue;
            }
            let reserved = node
                .inline_data_xattr
                .as_ref()
                .map(XattrEntry::total_len)
                .unwrap_or(0);
            let entries = std::mem::take(&mut node.xattrs);
            let placed = place_entries(entries, reserved)?;
            self.inode_mut(ino).inline_xattrs = placed.inline;
            if !placed.block.is_empty() {
                let block = self.alloc_block();
                self.write_data_block(block, &write_xattr_block(&placed.block))?;
                let node = self.inode_mut(ino);
                node.xattr_block = block;
                node.sectors += (BLOCK_SIZE / 512) as u64;
            }
        }

        let inode_count = self.inode_count();
        let data_blocks = self.block;
        let (groups, inodes_per_group) = pick_geometry(inode_count, data_blocks)?;
        let table_blocks_per_group = inodes_per_group / 16;

        // Inode table, padded to the chosen geometry.
        let table_start = self.block;
        self.out
            .seek(SeekFrom::Start(u64::from(table_start) * BLOCK_SIZE as u64))
            .map_err(|e| GcsError::io("seek inode table", e))?;
        let mut table = vec![0u8; (groups * table_blocks_per_group) as usize * BLOCK_SIZE];
        for ino in 1..=inode_count {
            let offset = (ino as usize - 1) * INODE_SIZE;
            self.serialize_inode(ino, &mut table[offset..offset + INODE_SIZE]);
        }
        self.out
            .write_all(&table)
            .map_err(|e| GcsError::io("write inode table", e))?;
        self.block += groups * table_blocks_per_group;

        // Bitmaps: two blocks per group. The image is fully packed, so every
        // block below the end is allocated, and padding bits past the disk
        // end are marked allocated as well.
        let bitmap_start = self.block;
        let total_blocks = bitmap_start + 2 * groups;
        for g in 0..groups {
            let block_bitmap = [0xFFu8; BLOCK_SIZE];
            self.out
                .write_all(&block_bitmap)
                .map_err(|e| GcsError::io("write block bitmap", e))?;

            let mut inode_bitmap = [0u8; BLOCK_SIZE];
            for i in 0..MAX_INODES_PER_GROUP {
                let ino = g * inodes_per_group + i + 1;
                let used = i >= inodes_per_group || ino <= inode_count;
                if used {
                    inode_bitmap[(i / 8) as usize] |= 1u8 << (i % 8);
                }
            }
            self.out
                .write_all(&inode_bitmap)
                .map_err(|e| GcsError::io("write inode bitmap", e))?;
        }
        self.block = total_blocks;

        // Group descriptors at block 1.
        let mut gd_block = vec![0u8; BLOCK_SIZE];
        for g in 0..groups {
            let used_inodes =
                (inode_count.saturating_sub(g * inodes_per_group)).min(inodes_per_group);
            let dirs_in_group = (1..=inode_count)
                .filter(|&ino| (ino - 1) / inodes_per_group == g && self.inode(ino).is_dir())
                .count() as u16;
            let off = g as usize * GROUP_DESCRIPTOR_SIZE;
            let mut w = FieldWriter::new(&mut gd_block[off..off + GROUP_DESCRIPTOR_SIZE]);
            w.u32(bitmap_start + 2 * g); // bg_block_bitmap
            w.u32(bitmap_start + 2 * g + 1); // bg_inode_bitmap
            w.u32(table_start + g * table_blocks_per_group); // bg_inode_table
            w.u16(0); // bg_free_blocks_count
            w.u16((inodes_per_group - used_inodes) as u16); // bg_free_inodes_count
            w.u16(dirs_in_group); // bg_used_dirs_count
        }
        self.out
            .seek(SeekFrom::Start(BLOCK_SIZE as u64))
            .map_err(|e| GcsError::io("seek group descriptors", e))?;
        self.out
            .write_all(&gd_block)
            .map_err(|e| GcsError::io("write group descriptors", e))?;

        self.write_superblock(groups, inodes_per_group, total_blocks)?;

        self.out
            .seek(SeekFrom::Start(u64::from(total_blocks) * BLOCK_SIZE as u64))
            .map_err(|e| GcsError::io("seek image end", e))?;
        self.out
            .flush()
            .map_err(|e| GcsError::io("flush image", e))?;
        self.finished = true;
        Ok(u64::from(total_blocks) * BLOCK_SIZE as u64)
    }

    /// Consume the writer, returning the underlying sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    // ====================
    // Internals
    // ====================

    fn inode(&self, ino: u32) -> &Inode {
        &self.inodes[ino as usize - 1]
    }

    fn inode_mut(&mut self, ino: u32) -> &mut Inode {
        &mut self.inodes[ino as usize - 1]
    }

    fn inode_count(&self) -> u32 {
        self.inodes.len() as u32
    }

    fn alloc_inode(&mut self) -> u32 {
        self.inodes.push(Inode::default());
        self.inodes.len() as u32
    }

    fn alloc_block(&mut self) -> u32 {
        let b = self.block;
        self.block += 1;
        b
    }

    fn apply_attrs(&mut self, ino: u32, attrs: &Attributes) -> GcsResult<()> {
        let entries = attrs
            .xattrs
            .iter()
            .map(|(name, value)| XattrEntry::new(name, value))
            .collect::<GcsResult<Vec<_>>>()?;

        let node = self.inode_mut(ino);
        node.mode = (attrs.mode & 0xFFFF) as u16;
        node.uid = attrs.uid;
        node.gid = attrs.gid;
        node.atime = attrs.atime;
        node.ctime = attrs.ctime;
        node.mtime = attrs.mtime;
        node.crtime = attrs.ctime;
        node.xattrs = entries;
        Ok(())
    }

    fn add_child(&mut self, parent: u32, name: &[u8], child: u32) -> GcsResult<()> {
        if name.is_empty() || name.len() > 255 || name.contains(&0) || name.contains(&b'/') {
            return Err(GcsError::InvalidArgument(format!(
                "invalid file name {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        self.inode_mut(parent)
            .children
            .as_mut()
            .expect("parent verified as directory")
            .push((name.to_vec(), child));
        Ok(())
    }

    fn write_data_block(&mut self, block: u32, data: &[u8]) -> GcsResult<()> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        self.out
            .seek(SeekFrom::Start(u64::from(block) * BLOCK_SIZE as u64))
            .map_err(|e| GcsError::io("seek data block", e))?;
        self.out
            .write_all(data)
            .map_err(|e| GcsError::io("write data block", e))?;
        Ok(())
    }

    fn write_symlink(&mut self, ino: u32, target: &[u8]) -> GcsResult<()> {
        if target.is_empty() || target.len() > BLOCK_SIZE {
            return Err(GcsError::InvalidArgument(
                "symlink target length out of range".to_string(),
            ));
        }
        if target.len() <= MAX_INLINE_SYMLINK {
            let node = self.inode_mut(ino);
            node.block_data[..target.len()].copy_from_slice(target);
            node.size = target.len() as u64;
            return Ok(());
        }
        // Long targets take a single data block addressed by an extent.
        let block = self.alloc_block();
        let mut data = [0u8; BLOCK_SIZE];
        data[..target.len()].copy_from_slice(target);
        self.write_data_block(block, &data)?;
        let extents = vec![Extent {
            logical: 0,
            physical: block,
            len: 1,
        }];
        self.install_extents(ino, &extents)?;
        let node = self.inode_mut(ino);
        node.size = target.len() as u64;
        node.sectors += (BLOCK_SIZE / 512) as u64;
        Ok(())
    }

    fn finalize_current(&mut self) -> GcsResult<()> {
        let Some(mut cur) = self.cur.take() else {
            return Ok(());
        };

        let inline = self.options.inline_data
            && cur.blocks_on_disk == 0
            && cur.buf.len() <= MAX_INLINE_FILE;
        if inline {
            let head_len = cur.buf.len().min(60);
            let tail = cur.buf.split_off(head_len);
            let node = self.inode_mut(cur.inode);
            node.block_data[..head_len].copy_from_slice(&cur.buf);
            node.flags |= EXT4_INLINE_DATA_FL;
            node.size = cur.size;
            node.inline_data_xattr = Some(XattrEntry::new("system.data", &tail)?);
            self.inline_used = true;
            return Ok(());
        }

        // Stream whatever is still buffered, padding the tail block.
        if !cur.buf.is_empty() {
            let mut data = std::mem::take(&mut cur.buf);
            let padded = (data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
            data.resize(padded, 0);
            if cur.blocks_on_disk == 0 {
                cur.start_block = self.block;
            }
            self.out
                .seek(SeekFrom::Start(u64::from(self.block) * BLOCK_SIZE as u64))
                .map_err(|e| GcsError::io("seek file data", e))?;
            self.out
                .write_all(&data)
                .map_err(|e| GcsError::io("write file data", e))?;
            let blocks = (padded / BLOCK_SIZE) as u32;
            self.block += blocks;
            cur.blocks_on_disk += blocks;
        }

        let extents = contiguous_extents(cur.start_block, cur.blocks_on_disk);
        self.install_extents(cur.inode, &extents)?;

        let node = self.inode_mut(cur.inode);
        node.size = cur.size;
        node.sectors += u64::from(cur.blocks_on_disk) * (BLOCK_SIZE / 512) as u64;
        Ok(())
    }

    /// Install an extent tree for `extents` into the inode, writing index
    /// blocks to disk when more than four leaves are needed.
    fn install_extents(&mut self, ino: u32, extents: &[Extent]) -> GcsResult<()> {
        if extents.len() > EXTENTS_IN_INODE * EXTENTS_PER_BLOCK {
            return Err(GcsError::InvalidArgument("file too big".to_string()));
        }

        let mut root = [0u8; 60];
        if extents.len() <= EXTENTS_IN_INODE {
            let mut w = FieldWriter::new(&mut root);
            w.u16(EXTENT_HEADER_MAGIC);
            w.u16(extents.len() as u16);
            w.u16(EXTENTS_IN_INODE as u16);
            w.u16(0); // depth
            w.u32(0); // generation
            for e in extents {
                write_extent_leaf(&mut w, e);
            }
        } else {
            // Depth-1 tree: up to four on-disk leaf blocks of 340 extents.
            let chunks: Vec<&[Extent]> = extents.chunks(EXTENTS_PER_BLOCK).collect();
            let mut index_entries = Vec::with_capacity(chunks.len());
            let mut extra_sectors = 0u64;
            for chunk in &chunks {
                let block = self.alloc_block();
                let mut data = [0u8; BLOCK_SIZE];
                {
                    let mut w = FieldWriter::new(&mut data);
                    w.u16(EXTENT_HEADER_MAGIC);
                    w.u16(chunk.len() as u16);
                    w.u16(EXTENTS_PER_BLOCK as u16);
                    w.u16(0); // depth
                    w.u32(0);
                    for e in *chunk {
                        write_extent_leaf(&mut w, e);
                    }
                }
                self.write_data_block(block, &data)?;
                index_entries.push((chunk[0].logical, block));
                extra_sectors += (BLOCK_SIZE / 512) as u64;
            }

            let mut w = FieldWriter::new(&mut root);
            w.u16(EXTENT_HEADER_MAGIC);
            w.u16(index_entries.len() as u16);
            w.u16(EXTENTS_IN_INODE as u16);
            w.u16(1); // depth
            w.u32(0);
            for (logical, block) in &index_entries {
                w.u32(*logical);
                w.u32(*block); // ei_leaf_lo
                w.u16(0); // ei_leaf_hi
                w.u16(0); // ei_unused
            }
            self.inode_mut(ino).sectors += extra_sectors;
        }

        let node = self.inode_mut(ino);
        node.block_data = root;
        node.flags |= EXT4_EXTENTS_FL;
        Ok(())
    }

    /// Serialize a directory's children and install its extents.
    fn write_directory(&mut self, ino: u32) -> GcsResult<()> {
        let parent = self.inode(ino).parent;
        let mut children = self.inode(ino).children.clone().unwrap_or_default();
        children.sort_by_key(|&(_, child)| child);

        let mut entries: Vec<(Vec<u8>, u32, u8)> = Vec::with_capacity(children.len() + 2);
        entries.push((b".".to_vec(), ino, FT_DIR));
        entries.push((b"..".to_vec(), parent, FT_DIR));
        for (name, child) in children {
            let file_type = dirent_file_type(self.inode(child).mode);
            entries.push((name, child, file_type));
        }

        let blocks = serialize_dirents(&entries);
        let start_block = self.block;
        self.out
            .seek(SeekFrom::Start(u64::from(self.block) * BLOCK_SIZE as u64))
            .map_err(|e| GcsError::io("seek directory block", e))?;
        for block in &blocks {
            self.out
                .write_all(block)
                .map_err(|e| GcsError::io("write directory block", e))?;
        }
        self.block += blocks.len() as u32;

        let extents = contiguous_extents(start_block, blocks.len() as u32);
        self.install_extents(ino, &extents)?;
        let node = self.inode_mut(ino);
        node.size = (blocks.len() * BLOCK_SIZE) as u64;
        node.sectors += blocks.len() as u64 * (BLOCK_SIZE / 512) as u64;
        Ok(())
    }

    fn serialize_inode(&self, ino: u32, buf: &mut [u8]) {
        let node = self.inode(ino);
        if node.mode == 0 {
            return; // reserved placeholder, stays zeroed
        }
        let (atime, atime_extra) = encode_timestamp(node.atime.secs, node.atime.nanos);
        let (ctime, ctime_extra) = encode_timestamp(node.ctime.secs, node.ctime.nanos);
        let (mtime, mtime_extra) = encode_timestamp(node.mtime.secs, node.mtime.nanos);
        let (crtime, crtime_extra) = encode_timestamp(node.crtime.secs, node.crtime.nanos);

        let mut w = FieldWriter::new(buf);
        w.u16(node.mode);
        w.u16((node.uid & 0xFFFF) as u16);
        w.u32((node.size & 0xFFFF_FFFF) as u32);
        w.u32(atime);
        w.u32(ctime);
        w.u32(mtime);
        w.u32(0); // i_dtime
        w.u16((node.gid & 0xFFFF) as u16);
        w.u16(node.links);
        w.u32((node.sectors & 0xFFFF_FFFF) as u32);
        w.u32(node.flags);
        w.u32(0); // i_osd1
        w.bytes(&node.block_data);
        w.u32(0); // i_generation
        w.u32(node.xattr_block); // i_file_acl
        w.u32((node.size >> 32) as u32);
        w.u32(0); // i_obso_faddr
        w.u16((node.sectors >> 32) as u16); // l_i_blocks_high
        w.u16(0); // l_i_file_acl_high
        w.u16((node.uid >> 16) as u16);
        w.u16((node.gid >> 16) as u16);
        w.u16(0); // l_i_checksum_lo
        w.u16(0); // reserved
        w.u16(INODE_EXTRA_ISIZE);
        w.u16(0); // i_checksum_hi
        w.u32(ctime_extra);
        w.u32(mtime_extra);
        w.u32(atime_extra);
        w.u32(crtime);
        w.u32(crtime_extra);

        if node.inline_data_xattr.is_some() || !node.inline_xattrs.is_empty() {
            let leading: Vec<XattrEntry> = node.inline_data_xattr.clone().into_iter().collect();
            let tail = &mut buf[INODE_SIZE - INODE_XATTR_SPACE..];
            write_inline(tail, &leading, &node.inline_xattrs);
        }
    }

    fn write_superblock(
        &mut self,
        groups: u32,
        inodes_per_group: u32,
        total_blocks: u32,
    ) -> GcsResult<()> {
        let mut incompat = INCOMPAT_FILETYPE | INCOMPAT_EXTENTS | INCOMPAT_FLEX_BG;
        if self.inline_used {
            incompat |= INCOMPAT_INLINE_DATA;
        }

        let mut sb = [0u8; 1024];
        let mut w = FieldWriter::new(&mut sb);
        w.u32(groups * inodes_per_group); // s_inodes_count
        w.u32(total_blocks); // s_blocks_count_lo
        w.u32(0); // s_r_blocks_count
        w.u32(0); // s_free_blocks_count: fully packed
        w.u32(groups * inodes_per_group - self.inode_count()); // s_free_inodes_count
        w.u32(0); // s_first_data_block
        w.u32(2); // s_log_block_size: 4096
        w.u32(2); // s_log_cluster_size
        w.u32(BLOCKS_PER_GROUP); // s_blocks_per_group
        w.u32(BLOCKS_PER_GROUP); // s_clusters_per_group
        w.u32(inodes_per_group); // s_inodes_per_group
        w.u32(0); // s_mtime
        w.u32(0); // s_wtime
        w.u16(0); // s_mnt_count
        w.u16(0xFFFF); // s_max_mnt_count
        w.u16(SUPERBLOCK_MAGIC);
        w.u16(1); // s_state: clean
        w.u16(1); // s_errors: continue
        w.u16(0); // s_minor_rev_level
        w.u32(0); // s_lastcheck
        w.u32(0); // s_checkinterval
        w.u32(0); // s_creator_os: linux
        w.u32(1); // s_rev_level: dynamic
        w.u16(0); // s_def_resuid
        w.u16(0); // s_def_resgid
        w.u32(FIRST_FREE_INODE); // s_first_ino
        w.u16(INODE_SIZE as u16); // s_inode_size
        w.u16(0); // s_block_group_nr
        w.u32(COMPAT_SPARSE_SUPER2 | COMPAT_EXT_ATTR); // s_feature_compat
        w.u32(incompat); // s_feature_incompat
        w.u32(RO_COMPAT_LARGE_FILE | RO_COMPAT_HUGE_FILE | RO_COMPAT_EXTRA_ISIZE | RO_COMPAT_READONLY);

        w.seek(348);
        w.u16(INODE_EXTRA_ISIZE); // s_min_extra_isize
        w.u16(INODE_EXTRA_ISIZE); // s_want_extra_isize
        w.seek(372);
        // One flex group spans every possible group, so metadata may live
        // anywhere on the disk.
        w.u8(7); // s_log_groups_per_flex

        self.out
            .seek(SeekFrom::Start(SUPERBLOCK_OFFSET))
            .map_err(|e| GcsError::io("seek superblock", e))?;
        self.out
            .write_all(&sb)
            .map_err(|e| GcsError::io("write superblock", e))?;
        Ok(())
    }
}

impl<W: Write + Seek> Write for Writer<W> {
    /// Append data to the current regular file.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let inline_cap = if self.options.inline_data {
            MAX_INLINE_FILE
        } else {
            0
        };
        let Some(cur) = self.cur.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no file is being written",
            ));
        };
        cur.size += data.len() as u64;
        cur.buf.extend_from_slice(data);

        // Once the file can no longer be inlined, stream whole blocks out.
        if cur.buf.len() > inline_cap && cur.buf.len() >= BLOCK_SIZE {
            let whole = cur.buf.len() / BLOCK_SIZE * BLOCK_SIZE;
            let rest = cur.buf.split_off(whole);
            let flushed = std::mem::replace(&mut cur.buf, rest);
            if cur.blocks_on_disk == 0 {
                cur.start_block = self.block;
            }
            self.out
                .seek(SeekFrom::Start(u64::from(self.block) * BLOCK_SIZE as u64))?;
            self.out.write_all(&flushed)?;
            let blocks = (whole / BLOCK_SIZE) as u32;
            self.block += blocks;
            self.cur.as_mut().unwrap().blocks_on_disk += blocks;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_extent_leaf(w: &mut FieldWriter<'_>, e: &Extent) {
    w.u32(e.logical);
    w.u16(e.len as u16);
    w.u16(0); // ee_start_hi
    w.u32(e.physical); // ee_start_lo
}

/// Split a contiguous run of blocks into extents no longer than the format
/// allows.
fn contiguous_extents(start: u32, count: u32) -> Vec<Extent> {
    let mut extents = Vec::new();
    let mut done = 0u32;
    while done < count {
        let len = (count - done).min(MAX_BLOCKS_PER_EXTENT);
        extents.push(Extent {
            logical: done,
            physical: start + done,
            len,
        });
        done += len;
    }
    extents
}

/// Pick the smallest `(groups, inodes_per_group)` able to hold the image.
fn pick_geometry(inodes: u32, data_blocks: u32) -> GcsResult<(u32, u32)> {
    for groups in 1..=MAX_GROUPS {
        let mut ipg = 512;
        while ipg <= MAX_INODES_PER_GROUP {
            let table_blocks = ipg / 16;
            if inodes <= ipg * groups
                && data_blocks <= (BLOCKS_PER_GROUP - table_blocks - 2) * groups
            {
                return Ok((groups, ipg));
            }
            ipg *= 2;
        }
    }
    Err(GcsError::InvalidArgument("disk too big".to_string()))
}

/// Pack directory entries `(name, inode, file_type)` into 4096-byte blocks.
/// The trailing record of each block is extended to cover the block.
fn serialize_dirents(entries: &[(Vec<u8>, u32, u8)]) -> Vec<[u8; BLOCK_SIZE]> {
    let mut blocks: Vec<[u8; BLOCK_SIZE]> = Vec::new();
    let mut block = [0u8; BLOCK_SIZE];
    let mut pos = 0usize;
    let mut last_rec_pos = 0usize;

    for (name, ino, file_type) in entries {
        let rec_len = 8 + ((name.len() + 3) & !3);
        if pos + rec_len > BLOCK_SIZE {
            // Extend the previous record over the remainder of the block.
            let stretch = (BLOCK_SIZE - last_rec_pos) as u16;
            block[last_rec_pos + 4..last_rec_pos + 6].copy_from_slice(&stretch.to_le_bytes());
            blocks.push(block);
            block = [0u8; BLOCK_SIZE];
            pos = 0;
            last_rec_pos = 0;
        }
        let mut w = FieldWriter::new(&mut block[pos..pos + rec_len]);
        w.u32(*ino);
        w.u16(rec_len as u16);
        w.u8(name.len() as u8);
        w.u8(*file_type);
        w.bytes(name);
        last_rec_pos = pos;
        pos += rec_len;
    }

    // Terminal record pads its block.
    let stretch = (BLOCK_SIZE - last_rec_pos) as u16;
    block[last_rec_pos + 4..last_rec_pos + 6].copy_from_slice(&stretch.to_le_bytes());
    blocks.push(block);
    blocks
}

fn normalize_path(path: &str) -> GcsResult<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(GcsError::InvalidArgument(format!(
                    "path {:?} escapes the image root",
                    path
                )))
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_writer() -> Writer<Cursor<Vec<u8>>> {
        Writer::new(Cursor::new(Vec::new())).unwrap()
    }

    fn read_u16(img: &[u8], off: usize) -> u16 {
        u16::from_le_bytes(img[off..off + 2].try_into().unwrap())
    }

    fn read_u32(img: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(img[off..off + 4].try_into().unwrap())
    }

    /// Inode table start from group 0's descriptor.
    fn inode_table_block(img: &[u8]) -> u32 {
        read_u32(img, BLOCK_SIZE + 8)
    }

    fn inode_offset(img: &[u8], ino: u32) -> usize {
        inode_table_block(img) as usize * BLOCK_SIZE + (ino as usize - 1) * INODE_SIZE
    }

    #[test]
    fn test_empty_image_superblock() {
        let mut w = new_writer();
        let size = w.finish().unwrap();
        let img = w.into_inner().into_inner();
        assert_eq!(size as usize, img.len());

        assert_eq!(read_u16(&img, 1024 + 56), 0xEF53);
        // 11 inodes exist: 10 reserved plus lost+found.
        let inodes_count = read_u32(&img, 1024);
        let free_inodes = read_u32(&img, 1024 + 16);
        assert_eq!(inodes_count - free_inodes, 11);
        // Fully packed image: no free blocks.
        assert_eq!(read_u32(&img, 1024 + 12), 0);
        // Block count matches the written size.
        assert_eq!(read_u32(&img, 1024 + 4) as usize * BLOCK_SIZE, img.len());
    }

    #[test]
    fn test_root_directory_entries_ordered_by_inode() {
        let mut w = new_writer();
        w.create("dir", &Attributes::directory(0o755)).unwrap();
        w.create("file", &Attributes::regular(0o644)).unwrap();
        let size = w.finish().unwrap();
        let img = w.into_inner().into_inner();
        assert_eq!(size as usize, img.len());

        // Root's first directory block: ".", "..", then children by inode
        // number: lost+found (11), dir (12), file (13).
        let root_off = inode_offset(&img, 2);
        let root_extent_block = read_u32(&img, root_off + 40 + 12 + 8);
        let dir = &img[root_extent_block as usize * BLOCK_SIZE..][..BLOCK_SIZE];

        let mut pos = 0;
        let mut seen = Vec::new();
        loop {
            let ino = read_u32(dir, pos);
            let rec_len = read_u16(dir, pos + 4) as usize;
            let name_len = dir[pos + 6] as usize;
            seen.push((ino, dir[pos + 8..pos + 8 + name_len].to_vec()));
            pos += rec_len;
            if pos >= BLOCK_SIZE {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                (2, b".".to_vec()),
                (2, b"..".to_vec()),
                (11, b"lost+found".to_vec()),
                (12, b"dir".to_vec()),
                (13, b"file".to_vec()),
            ]
        );
    }

    #[test]
    fn test_inline_file_at_threshold() {
        let mut w = new_writer();
        w.create("small", &Attributes::regular(0o644)).unwrap();
        w.write_all(&vec![0xAB; MAX_INLINE_FILE]).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        let flags = read_u32(&img, off + 32);
        assert_ne!(flags & EXT4_INLINE_DATA_FL, 0, "file at threshold inlines");
        assert_eq!(flags & EXT4_EXTENTS_FL, 0);
        // First 60 bytes live in i_block.
        assert_eq!(&img[off + 40..off + 100], &[0xAB; 60][..]);
        assert_eq!(read_u32(&img, off + 4), MAX_INLINE_FILE as u32);
        // Superblock advertises inline data.
        assert_ne!(read_u32(&img, 1024 + 96) & INCOMPAT_INLINE_DATA, 0);
    }

    #[test]
    fn test_file_over_threshold_uses_extents() {
        let mut w = new_writer();
        w.create("big", &Attributes::regular(0o644)).unwrap();
        w.write_all(&vec![0xCD; MAX_INLINE_FILE + 1]).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        let flags = read_u32(&img, off + 32);
        assert_eq!(flags & EXT4_INLINE_DATA_FL, 0);
        assert_ne!(flags & EXT4_EXTENTS_FL, 0);
        // Extent header in i_block: magic, one entry, depth 0.
        assert_eq!(read_u16(&img, off + 40), EXTENT_HEADER_MAGIC);
        assert_eq!(read_u16(&img, off + 42), 1);
        assert_eq!(read_u16(&img, off + 46), 0);
        // The data block holds the contents, zero padded.
        let data_block = read_u32(&img, off + 40 + 12 + 8) as usize;
        let data = &img[data_block * BLOCK_SIZE..][..BLOCK_SIZE];
        assert_eq!(&data[..MAX_INLINE_FILE + 1], &vec![0xCD; MAX_INLINE_FILE + 1][..]);
        assert_eq!(data[MAX_INLINE_FILE + 1], 0);
    }

    #[test]
    fn test_inline_disabled_small_file_gets_block() {
        let mut w = Writer::with_options(
            Cursor::new(Vec::new()),
            Options { inline_data: false },
        )
        .unwrap();
        w.create("small", &Attributes::regular(0o644)).unwrap();
        w.write_all(b"tiny").unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        assert_ne!(read_u32(&img, off + 32) & EXT4_EXTENTS_FL, 0);
        // No inline feature advertised.
        assert_eq!(read_u32(&img, 1024 + 96) & INCOMPAT_INLINE_DATA, 0);
    }

    #[test]
    fn test_symlink_inline_vs_extent_boundary() {
        let mut w = new_writer();
        w.create("short", &Attributes::symlink(vec![b'a'; 59])).unwrap();
        w.create("long", &Attributes::symlink(vec![b'b'; 60])).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let short_off = inode_offset(&img, 12);
        assert_eq!(read_u32(&img, short_off + 32) & EXT4_EXTENTS_FL, 0);
        assert_eq!(&img[short_off + 40..short_off + 40 + 59], &[b'a'; 59][..]);
        assert_eq!(read_u32(&img, short_off + 4), 59);

        let long_off = inode_offset(&img, 13);
        assert_ne!(read_u32(&img, long_off + 32) & EXT4_EXTENTS_FL, 0);
        assert_eq!(read_u32(&img, long_off + 4), 60);
    }

    #[test]
    fn test_hard_link_shares_inode_and_counts_links() {
        let mut w = new_writer();
        w.create("orig", &Attributes::regular(0o644)).unwrap();
        w.write_all(b"shared").unwrap();
        w.link("orig", "alias").unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        assert_eq!(read_u16(&img, off + 26), 2); // links_count
    }

    #[test]
    fn test_hard_link_to_directory_rejected() {
        let mut w = new_writer();
        w.create("d", &Attributes::directory(0o755)).unwrap();
        assert!(w.link("d", "dlink").is_err());
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut w = new_writer();
        w.create("x", &Attributes::regular(0o644)).unwrap();
        let err = w.create("x", &Attributes::regular(0o644)).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut w = new_writer();
        assert!(w.create("no/such/dir", &Attributes::regular(0o644)).is_err());
    }

    #[test]
    fn test_path_escape_rejected() {
        let mut w = new_writer();
        assert!(w.create("../evil", &Attributes::regular(0o644)).is_err());
    }

    #[test]
    fn test_uid_gid_mode_mtime_recorded() {
        let mut w = new_writer();
        let mut attrs = Attributes::regular(0o640);
        attrs.uid = 1000;
        attrs.gid = 70000; // exercises the high 16 bits
        attrs.mtime = Timestamp::new(1_700_000_000, 500);
        w.create("f", &attrs).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        assert_eq!(read_u16(&img, off) & 0o7777, 0o640);
        assert_eq!(read_u16(&img, off + 2), 1000);
        assert_eq!(read_u16(&img, off + 24), (70000u32 & 0xFFFF) as u16);
        assert_eq!(read_u16(&img, off + 122), (70000u32 >> 16) as u16); // l_i_gid_high
        assert_eq!(read_u32(&img, off + 16), 1_700_000_000);
        assert_eq!(read_u32(&img, off + 136) >> 2, 500); // mtime nanos
    }

    #[test]
    fn test_user_xattr_lands_in_inode_tail() {
        let mut w = new_writer();
        let mut attrs = Attributes::directory(0o755);
        attrs.xattrs.push(("user.foo".to_string(), b"bar".to_vec()));
        w.create("d", &attrs).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        let tail = &img[off + 152..off + 256];
        assert_eq!(read_u32(tail, 0), xattr::XATTR_HEADER_MAGIC);
        assert_eq!(tail[4], 3); // name_len "foo"
        assert_eq!(tail[5], 1); // user. index
        // Value sits at the end of the tail region, 4-byte aligned.
        let value_offs = read_u16(tail, 6) as usize + 4;
        assert_eq!(&tail[value_offs..value_offs + 3], b"bar");
    }

    #[test]
    fn test_inline_file_data_slot_leads_user_xattrs() {
        let mut w = new_writer();
        let mut attrs = Attributes::regular(0o644);
        attrs.xattrs.push(("user.foo".to_string(), b"bar".to_vec()));
        w.create("f", &attrs).unwrap();
        w.write_all(&[0x11; 70]).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        let tail = &img[off + 152..off + 256];
        // system.data first: 10 bytes beyond i_block live in its value.
        assert_eq!(tail[4], 4); // "data"
        assert_eq!(tail[5], 7); // system. index
        let data_offs = read_u16(tail, 6) as usize + 4;
        assert_eq!(
            u32::from_le_bytes(tail[12..16].try_into().unwrap()),
            10 // e_value_size
        );
        assert_eq!(&tail[data_offs..data_offs + 10], &[0x11; 10]);
        // user.foo follows the 20-byte system.data record.
        assert_eq!(tail[24], 3);
        assert_eq!(tail[25], 1);
    }

    #[test]
    fn test_large_xattr_spills_to_block() {
        let mut w = new_writer();
        let mut attrs = Attributes::regular(0o644);
        attrs
            .xattrs
            .push(("user.big".to_string(), vec![0x5A; 300]));
        w.create("f", &attrs).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let off = inode_offset(&img, 12);
        let acl_block = read_u32(&img, off + 104);
        assert_ne!(acl_block, 0);
        let block = &img[acl_block as usize * BLOCK_SIZE..][..BLOCK_SIZE];
        assert_eq!(read_u32(block, 0), xattr::XATTR_HEADER_MAGIC);
    }

    #[test]
    fn test_extent_split_at_max_run_length() {
        let extents = contiguous_extents(100, MAX_BLOCKS_PER_EXTENT + 5);
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].len, MAX_BLOCKS_PER_EXTENT);
        assert_eq!(extents[1].logical, MAX_BLOCKS_PER_EXTENT);
        assert_eq!(extents[1].physical, 100 + MAX_BLOCKS_PER_EXTENT);
        assert_eq!(extents[1].len, 5);
    }

    #[test]
    fn test_extent_count_limit() {
        let too_many: Vec<Extent> = (0..(EXTENTS_IN_INODE * EXTENTS_PER_BLOCK + 1) as u32)
            .map(|i| Extent {
                logical: i,
                physical: i,
                len: 1,
            })
            .collect();
        let mut w = new_writer();
        let ino = w.create("f", &Attributes::regular(0o644)).unwrap();
        w.finalize_current().unwrap();
        let err = w.install_extents(ino, &too_many).unwrap_err();
        assert!(err.to_string().contains("file too big"));
    }

    #[test]
    fn test_geometry_minimal_for_small_image() {
        assert_eq!(pick_geometry(11, 10).unwrap(), (1, 512));
    }

    #[test]
    fn test_geometry_grows_inodes_before_groups() {
        // 600 inodes still fit one group with ipg 1024.
        assert_eq!(pick_geometry(600, 10).unwrap(), (1, 1024));
    }

    #[test]
    fn test_geometry_adds_groups_for_blocks() {
        let per_group = BLOCKS_PER_GROUP - 512 / 16 - 2;
        assert_eq!(pick_geometry(11, per_group).unwrap(), (1, 512));
        assert_eq!(pick_geometry(11, per_group + 1).unwrap().0, 2);
    }

    #[test]
    fn test_geometry_rejects_oversized_disk() {
        assert!(pick_geometry(11, u32::MAX).is_err());
    }

    #[test]
    fn test_dirent_block_padding() {
        // Two entries: the trailing record's rec_len covers the block.
        let entries = vec![
            (b".".to_vec(), 2u32, FT_DIR),
            (b"..".to_vec(), 2u32, FT_DIR),
        ];
        let blocks = serialize_dirents(&entries);
        assert_eq!(blocks.len(), 1);
        let b = blocks[0];
        assert_eq!(read_u16(&b, 4), 12); // "." record
        assert_eq!(read_u16(&b, 12 + 4), (BLOCK_SIZE - 12) as u16);
    }

    #[test]
    fn test_dirents_spanning_blocks() {
        // Names long enough that 4096 bytes cannot hold them all.
        let entries: Vec<(Vec<u8>, u32, u8)> = (0..40)
            .map(|i| (vec![b'n'; 250], 12 + i, FT_REG_FILE))
            .collect();
        let blocks = serialize_dirents(&entries);
        assert!(blocks.len() > 1);
        // Every block's records chain exactly to the block end.
        for b in &blocks {
            let mut pos = 0usize;
            loop {
                let rec = read_u16(b, pos + 4) as usize;
                assert!(rec >= 8 && rec % 4 == 0);
                pos += rec;
                if pos == BLOCK_SIZE {
                    break;
                }
                assert!(pos < BLOCK_SIZE);
            }
        }
    }

    #[test]
    fn test_many_entries_single_directory() {
        let mut w = new_writer();
        w.create("d", &Attributes::directory(0o755)).unwrap();
        for i in 0..5000 {
            w.create(&format!("d/f{:05}", i), &Attributes::regular(0o644))
                .unwrap();
        }
        let size = w.finish().unwrap();
        let img = w.into_inner().into_inner();
        assert_eq!(size as usize, img.len());
        // Directory spans many blocks; its size reflects that.
        let off = inode_offset(&img, 12);
        let dir_size = read_u32(&img, off + 4) as usize;
        assert!(dir_size > 10 * BLOCK_SIZE);
        assert_eq!(dir_size % BLOCK_SIZE, 0);
    }

    #[test]
    fn test_device_node_encoding() {
        let mut w = new_writer();
        let mut attrs = Attributes {
            mode: u32::from(S_IFCHR) | 0o600,
            device: Some((1, 3)), // /dev/null
            ..Default::default()
        };
        w.create("null", &attrs).unwrap();
        attrs.mode = u32::from(S_IFBLK) | 0o600;
        attrs.device = Some((259, 5)); // major > 255 forces the new encoding
        w.create("nvme", &attrs).unwrap();
        w.finish().unwrap();
        let img = w.into_inner().into_inner();

        let null_off = inode_offset(&img, 12);
        assert_eq!(read_u32(&img, null_off + 40), (1 << 8) | 3);
        let nvme_off = inode_offset(&img, 13);
        assert_eq!(read_u32(&img, nvme_off + 44), (5 & 0xFF) | (259 << 8));
    }
}

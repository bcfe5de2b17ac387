//! Extended-attribute packing.
//!
//! Names are compressed with the standard prefix indices; entries land in the
//! inode's tail first and overflow into a single dedicated xattr block,
//! sorted by `(index, name length, name)`.

use gcs_shared::{GcsError, GcsResult};

use super::format::{FieldWriter, BLOCK_SIZE, INODE_XATTR_SPACE};

pub const XATTR_HEADER_MAGIC: u32 = 0xEA02_0000;
/// Size of the external-block header.
pub const XATTR_BLOCK_HEADER_SIZE: usize = 32;
/// Size of an entry record before its (4-byte padded) name.
pub const XATTR_ENTRY_SIZE: usize = 16;

/// Known name prefixes, longest match first so `system.posix_acl_*` and
/// `system.richacl` win over plain `system.`.
const PREFIXES: &[(&str, u8)] = &[
    ("system.posix_acl_access", 2),
    ("system.posix_acl_default", 3),
    ("system.richacl", 8),
    ("user.", 1),
    ("trusted.", 4),
    ("security.", 6),
    ("system.", 7),
];

/// A single attribute after prefix compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    pub index: u8,
    /// Name with its prefix stripped. The full-name prefixes (`posix_acl_*`,
    /// `richacl`) compress to an empty suffix.
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl XattrEntry {
    pub fn new(full_name: &str, value: &[u8]) -> GcsResult<Self> {
        if full_name.is_empty() || full_name.len() > 255 {
            return Err(GcsError::InvalidArgument(format!(
                "invalid xattr name {:?}",
                full_name
            )));
        }
        let (index, suffix) = compress_name(full_name);
        Ok(XattrEntry {
            index,
            name: suffix.as_bytes().to_vec(),
            value: value.to_vec(),
        })
    }

    /// Bytes this entry's record (name included, value excluded) occupies.
    pub fn record_len(&self) -> usize {
        XATTR_ENTRY_SIZE + ((self.name.len() + 3) & !3)
    }

    /// Total footprint: record plus 4-byte-aligned value.
    pub fn total_len(&self) -> usize {
        self.record_len() + ((self.value.len() + 3) & !3)
    }
}

fn compress_name(full: &str) -> (u8, &str) {
    for (prefix, index) in PREFIXES {
        if let Some(rest) = full.strip_prefix(prefix) {
            return (*index, rest);
        }
    }
    (0, full)
}

/// Per-entry hash: rotate-left-5 over name bytes, then rotate-left-16 over
/// 32-bit little-endian chunks of the value, tail zero-padded.
pub fn entry_hash(entry: &XattrEntry) -> u32 {
    let mut hash: u32 = 0;
    for &b in &entry.name {
        hash = hash.rotate_left(5) ^ u32::from(b);
    }
    for chunk in entry.value.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash = hash.rotate_left(16) ^ u32::from_le_bytes(word);
    }
    hash
}

/// Sort key for block placement.
fn sort_key(e: &XattrEntry) -> (u8, usize, Vec<u8>) {
    (e.index, e.name.len(), e.name.clone())
}

/// Split entries between the inode tail and the external block.
///
/// `reserved` holds space already claimed in the inode tail (the inline-data
/// slot); those bytes are unavailable to regular attributes.
pub struct XattrPlacement {
    pub inline: Vec<XattrEntry>,
    pub block: Vec<XattrEntry>,
}

pub fn place_entries(mut entries: Vec<XattrEntry>, reserved: usize) -> GcsResult<XattrPlacement> {
    entries.sort_by_key(sort_key);

    let mut inline = Vec::new();
    let mut block = Vec::new();
    // 4 bytes of header magic precede inline entries; `reserved` bytes are
    // already claimed by the inline-data slot.
    let mut inline_used = 4 + reserved;

    for entry in entries {
        if inline_used + entry.total_len() <= INODE_XATTR_SPACE {
            inline_used += entry.total_len();
            inline.push(entry);
        } else {
            block.push(entry);
        }
    }

    // The block keeps a terminating null entry after the records.
    let block_used: usize = XATTR_BLOCK_HEADER_SIZE
        + 4
        + block.iter().map(XattrEntry::total_len).sum::<usize>();
    if block_used > BLOCK_SIZE {
        return Err(GcsError::InvalidArgument(
            "extended attributes exceed a single xattr block".to_string(),
        ));
    }

    Ok(XattrPlacement { inline, block })
}

/// Serialize entries into the inode tail region (after `i_extra_isize`).
///
/// Layout: header magic, then entry records growing up and values growing
/// down from the end of the region. `leading` entries (the inline-data slot)
/// are emitted first, before the sorted regular entries.
pub fn write_inline(region: &mut [u8], leading: &[XattrEntry], entries: &[XattrEntry]) {
    debug_assert_eq!(region.len(), INODE_XATTR_SPACE);
    let mut w = FieldWriter::new(region);
    w.u32(XATTR_HEADER_MAGIC);

    let mut value_end = INODE_XATTR_SPACE;
    let mut record_pos = 4;
    for entry in leading.iter().chain(entries) {
        let value_padded = (entry.value.len() + 3) & !3;
        value_end -= value_padded;
        w.seek(record_pos);
        w.u8(entry.name.len() as u8);
        w.u8(entry.index);
        // In-inode value offsets are relative to the first entry, i.e. the
        // byte after the header magic.
        w.u16((value_end - 4) as u16);
        w.u32(0); // e_value_inum
        w.u32(entry.value.len() as u32);
        w.u32(entry_hash(entry));
        w.bytes(&entry.name);
        record_pos += entry.record_len();
        w.seek(value_end);
        w.bytes(&entry.value);
    }
    // Terminating null entry is the zero fill already present.
}

/// Serialize entries into a dedicated xattr block.
pub fn write_block(entries: &[XattrEntry]) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    {
        let mut w = FieldWriter::new(&mut block);
        w.u32(XATTR_HEADER_MAGIC);
        w.u32(1); // h_refcount
        w.u32(1); // h_blocks
        w.u32(0); // h_hash
        w.u32(0); // h_checksum
        w.skip(12); // reserved

        let mut value_end = BLOCK_SIZE;
        let mut record_pos = XATTR_BLOCK_HEADER_SIZE;
        for entry in entries {
            let value_padded = (entry.value.len() + 3) & !3;
            value_end -= value_padded;
            w.seek(record_pos);
            w.u8(entry.name.len() as u8);
            w.u8(entry.index);
            w.u16(value_end as u16);
            w.u32(0);
            w.u32(entry.value.len() as u32);
            w.u32(entry_hash(entry));
            w.bytes(&entry.name);
            record_pos += entry.record_len();
            w.seek(value_end);
            w.bytes(&entry.value);
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_compression() {
        let e = XattrEntry::new("user.foo", b"v").unwrap();
        assert_eq!(e.index, 1);
        assert_eq!(e.name, b"foo");

        let e = XattrEntry::new("security.selinux", b"v").unwrap();
        assert_eq!(e.index, 6);
        assert_eq!(e.name, b"selinux");

        let e = XattrEntry::new("system.posix_acl_access", b"v").unwrap();
        assert_eq!(e.index, 2);
        assert!(e.name.is_empty());

        let e = XattrEntry::new("system.data", b"v").unwrap();
        assert_eq!(e.index, 7);
        assert_eq!(e.name, b"data");

        let e = XattrEntry::new("noprefix", b"v").unwrap();
        assert_eq!(e.index, 0);
        assert_eq!(e.name, b"noprefix");
    }

    #[test]
    fn test_entry_hash_name_only() {
        let e = XattrEntry::new("user.a", b"").unwrap();
        // Single byte 'a': rol5(0) ^ 0x61 = 0x61.
        assert_eq!(entry_hash(&e), 0x61);
    }

    #[test]
    fn test_entry_hash_value_padding() {
        // A 1-byte and a 4-byte value differing only in trailing zeros hash
        // identically within one chunk (tail is zero-padded).
        let short = XattrEntry::new("user.x", &[0xAB]).unwrap();
        let padded = XattrEntry::new("user.x", &[0xAB, 0, 0, 0]).unwrap();
        assert_eq!(entry_hash(&short), entry_hash(&padded));
    }

    #[test]
    fn test_small_entries_stay_inline() {
        let entries = vec![
            XattrEntry::new("user.a", b"1").unwrap(),
            XattrEntry::new("user.b", b"2").unwrap(),
        ];
        let placed = place_entries(entries, 0).unwrap();
        assert_eq!(placed.inline.len(), 2);
        assert!(placed.block.is_empty());
    }

    #[test]
    fn test_large_entry_spills_to_block() {
        let entries = vec![
            XattrEntry::new("user.small", b"1").unwrap(),
            XattrEntry::new("user.big", &vec![0u8; 200]).unwrap(),
        ];
        let placed = place_entries(entries, 0).unwrap();
        assert_eq!(placed.inline.len(), 1);
        assert_eq!(placed.block.len(), 1);
        assert_eq!(placed.block[0].name, b"big");
    }

    #[test]
    fn test_block_entries_sorted_by_index_then_name() {
        let entries = vec![
            XattrEntry::new("trusted.z", &vec![0u8; 2000]).unwrap(),
            XattrEntry::new("user.bb", &vec![0u8; 2000]).unwrap(),
            XattrEntry::new("user.a", &vec![0u8; 2000]).unwrap(),
        ];
        // All spill; order in the block must be (index, len, name).
        let placed = place_entries(entries, 60).unwrap();
        let names: Vec<&[u8]> = placed.block.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![b"a".as_slice(), b"bb".as_slice(), b"z".as_slice()]);
        assert_eq!(placed.block[0].index, 1);
        assert_eq!(placed.block[2].index, 4);
    }

    #[test]
    fn test_oversized_attribute_set_rejected() {
        let entries = vec![XattrEntry::new("user.huge", &vec![0u8; BLOCK_SIZE]).unwrap()];
        assert!(place_entries(entries, 0).is_err());
    }

    #[test]
    fn test_write_block_layout() {
        let entries = vec![XattrEntry::new("user.foo", b"bar").unwrap()];
        let block = write_block(&entries);
        assert_eq!(u32::from_le_bytes(block[0..4].try_into().unwrap()), XATTR_HEADER_MAGIC);
        assert_eq!(u32::from_le_bytes(block[4..8].try_into().unwrap()), 1);
        // First entry record sits right after the 32-byte header.
        assert_eq!(block[32], 3); // name_len "foo"
        assert_eq!(block[33], 1); // user. prefix
        let value_offs = u16::from_le_bytes(block[34..36].try_into().unwrap()) as usize;
        assert_eq!(&block[value_offs..value_offs + 3], b"bar");
    }
}

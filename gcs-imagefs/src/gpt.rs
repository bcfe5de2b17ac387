//! GPT labelling for layer disks.
//!
//! Emits a protective MBR, a primary GPT header with its 128-entry partition
//! array, the partition body (the ext4 image, optionally followed by verity
//! metadata), and the backup entry array + header at the end of the disk.
//! CRCs are CRC32-IEEE, computed with the header's own CRC field zeroed.

use std::io::{Read, Seek, SeekFrom, Write};

use flate2::Crc;
use uuid::Uuid;

use gcs_shared::{GcsError, GcsResult};

use crate::verity;
use crate::BLOCK_SIZE;

/// Logical block size used by the partition label.
pub const LBA_SIZE: u64 = 512;
/// GPT header signature.
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
/// Revision 1.0 as encoded on disk.
pub const GPT_REVISION: u32 = 0x0001_0000;
/// Fixed header size; the rest of the LBA is zero.
pub const GPT_HEADER_SIZE: u32 = 92;
/// Entries in the partition array.
pub const GPT_ENTRY_COUNT: u32 = 128;
/// Bytes per partition entry.
pub const GPT_ENTRY_SIZE: u32 = 128;
/// LBAs reserved for the entry array.
pub const GPT_ENTRY_LBAS: u64 = (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as u64 / LBA_SIZE;
/// First LBA a partition may occupy: PMBR + header + entry array.
pub const FIRST_USABLE_LBA: u64 = 2 + GPT_ENTRY_LBAS;

/// Linux filesystem data partition type.
pub const LINUX_FS_TYPE_GUID: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

/// Result of building a labelled disk.
#[derive(Debug, Clone, Copy)]
pub struct DiskInfo {
    /// Total disk size in bytes.
    pub disk_size: u64,
    /// dm-verity root hash, when verity metadata was appended.
    pub root_hash: Option<[u8; 32]>,
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Encode an LBA as a CHS triple (255 heads, 63 sectors per track),
/// clamped to `FF FF FF` once the address exceeds what CHS can carry.
fn chs(lba: u32) -> [u8; 3] {
    if lba >= 0xFF_FFFF {
        return [0xFF, 0xFF, 0xFF];
    }
    let cylinder = lba / (255 * 63);
    let rem = lba % (255 * 63);
    let head = rem / 63;
    let sector = rem % 63 + 1;
    [
        head as u8,
        (sector as u8 & 0x3F) | ((cylinder >> 2) & 0xC0) as u8,
        (cylinder & 0xFF) as u8,
    ]
}

/// The 512-byte protective MBR at LBA 0.
pub fn protective_mbr(disk_lbas: u64) -> [u8; LBA_SIZE as usize] {
    let mut mbr = [0u8; LBA_SIZE as usize];
    let entry = &mut mbr[446..462];
    entry[1..4].copy_from_slice(&[0x00, 0x02, 0x00]); // starting CHS
    entry[4] = 0xEE; // protective OS type
    let size_in_lba = disk_lbas.min(0xFFFF_FFFF) as u32;
    entry[5..8].copy_from_slice(&chs(size_in_lba));
    entry[8..12].copy_from_slice(&1u32.to_le_bytes()); // starting LBA
    entry[12..16].copy_from_slice(&size_in_lba.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

struct HeaderParams {
    my_lba: u64,
    alternate_lba: u64,
    first_usable: u64,
    last_usable: u64,
    disk_guid: Uuid,
    entries_lba: u64,
    entries_crc: u32,
}

fn gpt_header(p: &HeaderParams) -> [u8; LBA_SIZE as usize] {
    let mut lba = [0u8; LBA_SIZE as usize];
    lba[0..8].copy_from_slice(GPT_SIGNATURE);
    lba[8..12].copy_from_slice(&GPT_REVISION.to_le_bytes());
    lba[12..16].copy_from_slice(&GPT_HEADER_SIZE.to_le_bytes());
    // 16..20: header CRC, filled below
    lba[24..32].copy_from_slice(&p.my_lba.to_le_bytes());
    lba[32..40].copy_from_slice(&p.alternate_lba.to_le_bytes());
    lba[40..48].copy_from_slice(&p.first_usable.to_le_bytes());
    lba[48..56].copy_from_slice(&p.last_usable.to_le_bytes());
    lba[56..72].copy_from_slice(&p.disk_guid.to_bytes_le());
    lba[72..80].copy_from_slice(&p.entries_lba.to_le_bytes());
    lba[80..84].copy_from_slice(&GPT_ENTRY_COUNT.to_le_bytes());
    lba[84..88].copy_from_slice(&GPT_ENTRY_SIZE.to_le_bytes());
    lba[88..92].copy_from_slice(&p.entries_crc.to_le_bytes());

    let crc = crc32(&lba[..GPT_HEADER_SIZE as usize]);
    lba[16..20].copy_from_slice(&crc.to_le_bytes());
    lba
}

fn partition_entry(unique_guid: Uuid, first_lba: u64, last_lba: u64) -> [u8; GPT_ENTRY_SIZE as usize] {
    let mut entry = [0u8; GPT_ENTRY_SIZE as usize];
    entry[0..16].copy_from_slice(&LINUX_FS_TYPE_GUID.to_bytes_le());
    entry[16..32].copy_from_slice(&unique_guid.to_bytes_le());
    entry[32..40].copy_from_slice(&first_lba.to_le_bytes());
    entry[40..48].copy_from_slice(&last_lba.to_le_bytes());
    entry
}

/// Wrap a finished ext4 image in a GPT-labelled disk, optionally appending a
/// dm-verity superblock and hash tree to the partition body.
///
/// `fs` supplies exactly `fs_size` bytes (a multiple of the filesystem block
/// size); with verity enabled it is read twice-worth of hashing in one pass:
/// blocks are hashed as they are copied.
pub fn write_disk<R, W>(mut fs: R, fs_size: u64, mut out: W, with_verity: bool) -> GcsResult<DiskInfo>
where
    R: Read,
    W: Write + Seek,
{
    if fs_size == 0 || fs_size % BLOCK_SIZE as u64 != 0 {
        return Err(GcsError::InvalidArgument(format!(
            "filesystem size {} is not a positive multiple of {}",
            fs_size, BLOCK_SIZE
        )));
    }
    let data_blocks = fs_size / BLOCK_SIZE as u64;

    // Layout is fully determined up front so headers can be emitted in a
    // single forward pass.
    let verity_bytes = if with_verity {
        (1 + verity::tree_blocks(data_blocks)) * BLOCK_SIZE as u64
    } else {
        0
    };
    let partition_first = FIRST_USABLE_LBA;
    let partition_lbas = (fs_size + verity_bytes) / LBA_SIZE;
    let partition_last = partition_first + partition_lbas - 1;
    let backup_entries_lba = partition_last + 1;
    let backup_header_lba = backup_entries_lba + GPT_ENTRY_LBAS;
    let disk_lbas = backup_header_lba + 1;

    let disk_guid = Uuid::new_v4();
    let mut entries = vec![0u8; (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as usize];
    entries[..GPT_ENTRY_SIZE as usize]
        .copy_from_slice(&partition_entry(Uuid::new_v4(), partition_first, partition_last));
    let entries_crc = crc32(&entries);

    out.seek(SeekFrom::Start(0))
        .map_err(|e| GcsError::io("seek disk start", e))?;
    out.write_all(&protective_mbr(disk_lbas))
        .map_err(|e| GcsError::io("write protective MBR", e))?;
    out.write_all(&gpt_header(&HeaderParams {
        my_lba: 1,
        alternate_lba: backup_header_lba,
        first_usable: FIRST_USABLE_LBA,
        last_usable: partition_last,
        disk_guid,
        entries_lba: 2,
        entries_crc,
    }))
    .map_err(|e| GcsError::io("write primary GPT header", e))?;
    out.write_all(&entries)
        .map_err(|e| GcsError::io("write partition entries", e))?;

    // Partition body: copy the filesystem, hashing blocks on the way through
    // when verity is requested.
    let mut leaf_hashes = Vec::new();
    let mut block = [0u8; BLOCK_SIZE];
    for _ in 0..data_blocks {
        fs.read_exact(&mut block)
            .map_err(|e| GcsError::io("read filesystem block", e))?;
        if with_verity {
            leaf_hashes.extend_from_slice(&verity::hash_block(&block));
        }
        out.write_all(&block)
            .map_err(|e| GcsError::io("write filesystem block", e))?;
    }

    let mut root_hash = None;
    if with_verity {
        let tree = verity::from_leaf_hashes(leaf_hashes, data_blocks);
        out.write_all(&verity::superblock(data_blocks))
            .map_err(|e| GcsError::io("write verity superblock", e))?;
        out.write_all(&tree.packed)
            .map_err(|e| GcsError::io("write verity tree", e))?;
        root_hash = Some(tree.root_hash);
    }

    out.write_all(&entries)
        .map_err(|e| GcsError::io("write backup partition entries", e))?;
    out.write_all(&gpt_header(&HeaderParams {
        my_lba: backup_header_lba,
        alternate_lba: 1,
        first_usable: FIRST_USABLE_LBA,
        last_usable: partition_last,
        disk_guid,
        entries_lba: backup_entries_lba,
        entries_crc,
    }))
    .map_err(|e| GcsError::io("write backup GPT header", e))?;
    out.flush().map_err(|e| GcsError::io("flush disk", e))?;

    let info = DiskInfo {
        disk_size: disk_lbas * LBA_SIZE,
        root_hash,
    };
    tracing::debug!(
        disk_size = info.disk_size,
        verity = with_verity,
        "layer disk written"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_pmbr_signature_and_type() {
        let mbr = protective_mbr(0x10000);
        assert_eq!(mbr[510], 0x55);
        assert_eq!(mbr[511], 0xAA);
        assert_eq!(mbr[446 + 4], 0xEE);
        assert_eq!(
            u32::from_le_bytes(mbr[446 + 8..446 + 12].try_into().unwrap()),
            1
        );
    }

    #[test]
    fn test_pmbr_size_clamps_to_u32() {
        let mbr = protective_mbr(0x2_0000_0000);
        assert_eq!(
            u32::from_le_bytes(mbr[446 + 12..446 + 16].try_into().unwrap()),
            0xFFFF_FFFF
        );
        assert_eq!(&mbr[446 + 5..446 + 8], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_pmbr_large_disk_chs_clamped() {
        let mbr = protective_mbr(0xFF_FFFF);
        assert_eq!(&mbr[446 + 5..446 + 8], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_header_crc_round_trips() {
        let params = HeaderParams {
            my_lba: 1,
            alternate_lba: 99,
            first_usable: FIRST_USABLE_LBA,
            last_usable: 60,
            disk_guid: Uuid::nil(),
            entries_lba: 2,
            entries_crc: 0xDEAD_BEEF,
        };
        let lba = gpt_header(&params);
        assert_eq!(&lba[0..8], b"EFI PART");
        assert_eq!(u32::from_le_bytes(lba[8..12].try_into().unwrap()), 0x0001_0000);
        assert_eq!(u32::from_le_bytes(lba[12..16].try_into().unwrap()), 92);

        // Recompute the CRC with the field zeroed; it must match.
        let mut copy = lba;
        let stored = u32::from_le_bytes(copy[16..20].try_into().unwrap());
        copy[16..20].fill(0);
        assert_eq!(crc32(&copy[..92]), stored);
        // Bytes past the fixed header stay zero.
        assert_eq!(&lba[92..], &[0u8; 512 - 92][..]);
    }

    #[test]
    fn test_write_disk_layout() {
        // Two filesystem blocks of recognizable bytes.
        let fs: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        let mut out = Cursor::new(Vec::new());
        let info = write_disk(Cursor::new(&fs), fs.len() as u64, &mut out, false).unwrap();

        let disk = out.into_inner();
        assert_eq!(disk.len() as u64, info.disk_size);
        assert!(info.root_hash.is_none());

        // PMBR, then the primary header at LBA 1.
        assert_eq!(&disk[510..512], &[0x55, 0xAA]);
        assert_eq!(&disk[512..520], b"EFI PART");
        // Partition body begins at the first usable LBA.
        let body = FIRST_USABLE_LBA as usize * LBA_SIZE as usize;
        assert_eq!(&disk[body..body + fs.len()], &fs[..]);
        // Backup header sits on the final LBA.
        let last = disk.len() - 512;
        assert_eq!(&disk[last..last + 8], b"EFI PART");
    }

    #[test]
    fn test_write_disk_with_verity_appends_tree() {
        let fs = vec![0xA5u8; 4 * BLOCK_SIZE];
        let mut out = Cursor::new(Vec::new());
        let info = write_disk(Cursor::new(&fs), fs.len() as u64, &mut out, true).unwrap();
        let disk = out.into_inner();

        let root = info.root_hash.expect("verity requested");
        // Verity superblock directly after the filesystem.
        let sb_off = FIRST_USABLE_LBA as usize * LBA_SIZE as usize + fs.len();
        assert_eq!(&disk[sb_off..sb_off + 8], b"verity\0\0");
        assert_eq!(
            u64::from_le_bytes(disk[sb_off + 72..sb_off + 80].try_into().unwrap()),
            4
        );

        // Independent tree over the same data yields the same root.
        let tree = verity::build_tree(Cursor::new(&fs), fs.len() as u64).unwrap();
        assert_eq!(tree.root_hash, root);
        let tree_off = sb_off + BLOCK_SIZE;
        assert_eq!(&disk[tree_off..tree_off + tree.packed.len()], &tree.packed[..]);
    }

    #[test]
    fn test_write_disk_rejects_unaligned_input() {
        let fs = vec![0u8; 100];
        let mut out = Cursor::new(Vec::new());
        assert!(write_disk(Cursor::new(&fs), 100, &mut out, false).is_err());
    }

    #[test]
    fn test_partition_entry_type_guid_mixed_endian() {
        let entry = partition_entry(Uuid::nil(), 34, 99);
        // First field of 0FC63DAF-... little-endian on disk.
        assert_eq!(&entry[0..4], &[0xAF, 0x3D, 0xC6, 0x0F]);
        assert_eq!(u64::from_le_bytes(entry[32..40].try_into().unwrap()), 34);
        assert_eq!(u64::from_le_bytes(entry[40..48].try_into().unwrap()), 99);
    }
}

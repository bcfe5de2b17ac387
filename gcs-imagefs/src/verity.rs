//! dm-verity Merkle tree construction.
//!
//! Every 4096-byte data block is hashed as `sha256(salt || block)` with a
//! 32-byte zero salt. Each layer's hashes are packed and zero-padded to a
//! block boundary, then hashed again into the next layer until a single
//! block remains. Layers are stored top first; the root hash is
//! `sha256(salt || top_block)` and is what the host programs into the
//! device-mapper table.

use std::io::Read;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use gcs_shared::{GcsError, GcsResult};

use crate::BLOCK_SIZE;

/// Salt length; the salt itself is all zeros.
pub const SALT_SIZE: usize = 32;
/// SHA-256 digest length.
pub const HASH_SIZE: usize = 32;
/// Digests per hash-tree block.
pub const HASHES_PER_BLOCK: u64 = (BLOCK_SIZE / HASH_SIZE) as u64;
/// Superblock signature, "verity" NUL-padded.
pub const VERITY_SIGNATURE: [u8; 8] = *b"verity\0\0";

/// Completed hash tree: packed layers (top first) plus the root hash.
pub struct MerkleTree {
    /// Packed layers, top layer first, each a whole number of blocks.
    pub packed: Vec<u8>,
    pub root_hash: [u8; HASH_SIZE],
    pub data_blocks: u64,
}

/// `sha256(salt || block)` over one full data or hash block.
pub fn hash_block(block: &[u8]) -> [u8; HASH_SIZE] {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    let mut hasher = Sha256::new();
    hasher.update([0u8; SALT_SIZE]);
    hasher.update(block);
    hasher.finalize().into()
}

/// Pad a layer of packed hashes to a block boundary.
fn pad_layer(mut layer: Vec<u8>) -> Vec<u8> {
    let padded = (layer.len() + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
    layer.resize(padded, 0);
    layer
}

/// Build the tree over `data_size` bytes read from `data`.
pub fn build_tree<R: Read>(mut data: R, data_size: u64) -> GcsResult<MerkleTree> {
    if data_size == 0 || data_size % BLOCK_SIZE as u64 != 0 {
        return Err(GcsError::InvalidArgument(format!(
            "verity data size {} is not a positive multiple of the block size",
            data_size
        )));
    }
    let data_blocks = data_size / BLOCK_SIZE as u64;

    // Leaf layer: one digest per data block.
    let mut leaf = Vec::with_capacity((data_blocks as usize) * HASH_SIZE);
    let mut block = [0u8; BLOCK_SIZE];
    for _ in 0..data_blocks {
        data.read_exact(&mut block)
            .map_err(|e| GcsError::io("read verity data block", e))?;
        leaf.extend_from_slice(&hash_block(&block));
    }

    Ok(from_leaf_hashes(leaf, data_blocks))
}

/// Finish a tree whose leaf digests were already computed (e.g. while the
/// data was being copied somewhere else).
pub fn from_leaf_hashes(leaf: Vec<u8>, data_blocks: u64) -> MerkleTree {
    debug_assert_eq!(leaf.len() as u64, data_blocks * HASH_SIZE as u64);

    let mut layers = vec![pad_layer(leaf)];
    while layers.last().unwrap().len() > BLOCK_SIZE {
        let below = layers.last().unwrap();
        let mut above = Vec::with_capacity(below.len() / BLOCK_SIZE * HASH_SIZE);
        for b in below.chunks(BLOCK_SIZE) {
            above.extend_from_slice(&hash_block(b));
        }
        layers.push(pad_layer(above));
    }

    let top: &[u8] = layers.last().unwrap();
    let root_hash = hash_block(top);

    // Top first on disk.
    let mut packed = Vec::new();
    for layer in layers.iter().rev() {
        packed.extend_from_slice(layer);
    }
    MerkleTree {
        packed,
        root_hash,
        data_blocks,
    }
}

/// Total hash-tree size in blocks for a given data size; lets disk builders
/// lay out the image before hashing.
pub fn tree_blocks(data_blocks: u64) -> u64 {
    let mut total = 0;
    let mut n = data_blocks;
    loop {
        n = n.div_ceil(HASHES_PER_BLOCK);
        total += n;
        if n <= 1 {
            break;
        }
    }
    total
}

/// The fixed 512-byte verity superblock, padded to a full block for placement
/// immediately after the filesystem.
pub fn superblock(data_blocks: u64) -> [u8; BLOCK_SIZE] {
    let mut sb = [0u8; BLOCK_SIZE];
    sb[0..8].copy_from_slice(&VERITY_SIGNATURE);
    sb[8..12].copy_from_slice(&1u32.to_le_bytes()); // version
    sb[12..16].copy_from_slice(&1u32.to_le_bytes()); // hash type
    sb[16..32].copy_from_slice(Uuid::new_v4().as_bytes());
    sb[32..38].copy_from_slice(b"sha256"); // algorithm, NUL padded to 32
    sb[64..68].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes()); // data block size
    sb[68..72].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes()); // hash block size
    sb[72..80].copy_from_slice(&data_blocks.to_le_bytes());
    sb[80..82].copy_from_slice(&(SALT_SIZE as u16).to_le_bytes());
    // salt itself: 32 zero bytes at offset 88, already zeroed
    sb
}

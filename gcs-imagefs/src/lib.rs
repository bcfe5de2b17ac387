//! Builders for the on-disk layer-image format mounted by the uVM.
//!
//! A layer image is a compact read-only ext4 filesystem, optionally followed
//! by a dm-verity superblock and Merkle tree, wrapped in a GPT-labelled disk:
//!
//! ```text
//! | PMBR | GPT header | entries | ext4 filesystem | verity sb | hash tree | backup GPT |
//! ```
//!
//! [`ext4::Writer`] produces the filesystem in a single forward pass;
//! [`verity`] computes the hash tree; [`gpt`] emits the partition label.

pub mod dirtree;
pub mod ext4;
pub mod gpt;
pub mod verity;

/// Block size shared by the filesystem and the verity hash tree.
pub const BLOCK_SIZE: usize = 4096;

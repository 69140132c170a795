use crate::inode::INODES_PER_BLOCK;
use crate::prelude::*;

use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Magic number identifying the filesystem.
const MAGIC: u32 = 0x7366_7331; // "sfs1"

/// Block holding the super block.
pub(crate) const SUPER_BLOCK_BID: Bid = 0;
/// Block holding the inode allocation bitmap.
pub(crate) const INODE_BITMAP_BID: Bid = 1;
/// Block holding the block allocation bitmap.
pub(crate) const BLOCK_BITMAP_BID: Bid = 2;
/// First block of the inode table.
pub(crate) const INODE_TABLE_BID: Bid = 3;

/// The in-memory super block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SuperBlock {
    inodes_count: u32,
    blocks_count: u32,
    free_inodes_count: u32,
    free_blocks_count: u32,
}

impl SuperBlock {
    /// Builds the super block of a freshly formatted filesystem. All inode
    /// slots and blocks start out free; the caller reserves the metadata
    /// region.
    pub fn new(inodes_count: u32, blocks_count: u32) -> Self {
        Self {
            inodes_count,
            blocks_count,
            free_inodes_count: inodes_count,
            free_blocks_count: blocks_count,
        }
    }

    pub fn inodes_count(&self) -> u32 {
        self.inodes_count
    }

    pub fn blocks_count(&self) -> u32 {
        self.blocks_count
    }

    pub fn free_inodes_count(&self) -> u32 {
        self.free_inodes_count
    }

    pub fn free_blocks_count(&self) -> u32 {
        self.free_blocks_count
    }

    pub fn inc_free_inodes(&mut self) {
        self.free_inodes_count += 1;
    }

    pub fn dec_free_inodes(&mut self) {
        debug_assert!(self.free_inodes_count > 0);
        self.free_inodes_count -= 1;
    }

    pub fn inc_free_blocks(&mut self) {
        self.free_blocks_count += 1;
    }

    pub fn dec_free_blocks(&mut self) {
        debug_assert!(self.free_blocks_count > 0);
        self.free_blocks_count -= 1;
    }

    /// Number of blocks occupied by the inode table.
    pub fn inode_table_blocks(&self) -> u32 {
        (self.inodes_count as usize).div_ceil(INODES_PER_BLOCK) as u32
    }

    /// First block past the metadata region.
    pub fn data_start_bid(&self) -> Bid {
        INODE_TABLE_BID + self.inode_table_blocks()
    }
}

impl TryFrom<RawSuperBlock> for SuperBlock {
    type Error = crate::error::Error;

    fn try_from(raw: RawSuperBlock) -> Result<Self> {
        if raw.magic != MAGIC {
            return Err(Error::BadMagic);
        }
        if raw.block_size as usize != BLOCK_SIZE {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            inodes_count: raw.inodes_count,
            blocks_count: raw.blocks_count,
            free_inodes_count: raw.free_inodes_count,
            free_blocks_count: raw.free_blocks_count,
        })
    }
}

/// The raw super block on device.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct RawSuperBlock {
    pub magic: u32,
    pub block_size: u32,
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_inodes_count: u32,
    pub free_blocks_count: u32,
    reserved: [u32; 10],
}

const_assert!(core::mem::size_of::<RawSuperBlock>() == 64);

impl From<&SuperBlock> for RawSuperBlock {
    fn from(super_block: &SuperBlock) -> Self {
        Self {
            magic: MAGIC,
            block_size: BLOCK_SIZE as u32,
            inodes_count: super_block.inodes_count,
            blocks_count: super_block.blocks_count,
            free_inodes_count: super_block.free_inodes_count,
            free_blocks_count: super_block.free_blocks_count,
            reserved: [0u32; 10],
        }
    }
}

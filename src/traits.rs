use crate::error::Result;

/// Size of a block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Block id on the device.
pub type Bid = u32;

/// The block-granular storage the filesystem is built on.
///
/// Reads and writes are synchronous and whole-block; `buf` must be exactly
/// [`BLOCK_SIZE`] bytes long. All methods may fail with [`Error::IoError`].
///
/// [`Error::IoError`]: crate::error::Error::IoError
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, bid: Bid, buf: &mut [u8]) -> Result<()>;

    fn write_block(&self, bid: Bid, buf: &[u8]) -> Result<()>;

    /// Tags a block whose content has been mutated for write-back.
    fn mark_dirty(&self, bid: Bid) -> Result<()>;

    fn total_blocks(&self) -> u64;
}

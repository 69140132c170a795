use crate::inode::{
    FilePerm, FileType, Inode, InodeDesc, ProvisionalInode, RawInode, INODES_PER_BLOCK, INODE_SIZE,
};
use crate::prelude::*;
use crate::super_block::{
    RawSuperBlock, SuperBlock, BLOCK_BITMAP_BID, INODE_BITMAP_BID, INODE_TABLE_BID, SUPER_BLOCK_BID,
};

use id_alloc::IdAlloc;
use zerocopy::{FromBytes, IntoBytes};

/// The root inode number.
///
/// Inode number 0 never refers to a live inode; it marks an unused
/// directory-entry slot. Inode number 1 is reserved.
pub const ROOT_INO: u32 = 2;

/// The filesystem.
///
/// Owns the super block, the inode and block allocators and the arena of
/// live inodes, all backed by a [`BlockDevice`]. Directory-entry records
/// reference inodes by number; [`SimpleFs::lookup_inode`] is the only way to
/// turn a number back into a live inode.
pub struct SimpleFs {
    block_device: Arc<dyn BlockDevice>,
    super_block: RwLock<Dirty<SuperBlock>>,
    inode_bitmap: RwLock<Dirty<IdAlloc>>,
    block_bitmap: RwLock<Dirty<IdAlloc>>,
    inode_cache: RwLock<BTreeMap<u32, Arc<Inode>>>,
    self_ref: Weak<Self>,
}

impl SimpleFs {
    /// Opens an existing filesystem from the `block_device`.
    pub fn open(block_device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let super_block = {
            let mut buf = vec![0u8; BLOCK_SIZE];
            block_device.read_block(SUPER_BLOCK_BID, &mut buf)?;
            let raw = RawSuperBlock::read_from_bytes(&buf[..core::mem::size_of::<RawSuperBlock>()])
                .unwrap();
            SuperBlock::try_from(raw)?
        };

        let load_bitmap = |bid: Bid, capacity: usize| -> Result<IdAlloc> {
            if capacity == 0 || capacity > BLOCK_SIZE * 8 {
                return Err(Error::InvalidParam);
            }
            let mut buf = vec![0u8; BLOCK_SIZE];
            block_device.read_block(bid, &mut buf)?;
            Ok(IdAlloc::from_bytes_with_capacity(&buf, capacity))
        };
        let inode_bitmap = load_bitmap(INODE_BITMAP_BID, super_block.inodes_count() as usize)?;
        let block_bitmap = load_bitmap(BLOCK_BITMAP_BID, super_block.blocks_count() as usize)?;

        let fs = Arc::new_cyclic(|weak_ref| Self {
            block_device,
            super_block: RwLock::new(Dirty::new(super_block)),
            inode_bitmap: RwLock::new(Dirty::new(inode_bitmap)),
            block_bitmap: RwLock::new(Dirty::new(block_bitmap)),
            inode_cache: RwLock::new(BTreeMap::new()),
            self_ref: weak_ref.clone(),
        });
        info!("opened filesystem: {:?}", fs);
        Ok(fs)
    }

    /// Writes a fresh, empty filesystem onto the `block_device` and opens it.
    ///
    /// The metadata region (super block, both bitmaps and the inode table)
    /// is zeroed, the root directory is created, and all metadata is synced
    /// so a subsequent [`SimpleFs::open`] sees a valid image.
    pub fn format(block_device: Arc<dyn BlockDevice>, inodes_count: u32) -> Result<Arc<Self>> {
        let blocks_count = block_device.total_blocks() as u32;
        if inodes_count == 0
            || inodes_count as usize > BLOCK_SIZE * 8
            || blocks_count as usize > BLOCK_SIZE * 8
        {
            return Err(Error::InvalidParam);
        }

        let mut super_block = SuperBlock::new(inodes_count, blocks_count);
        let data_start_bid = super_block.data_start_bid();
        if data_start_bid >= blocks_count {
            return Err(Error::NoSpace);
        }

        // Zero the metadata region; a cleared inode table slot is what makes
        // stale entry references detectable later.
        let zeroed = vec![0u8; BLOCK_SIZE];
        for bid in 0..data_start_bid {
            block_device.write_block(bid, &zeroed)?;
            block_device.mark_dirty(bid)?;
        }

        let mut block_bitmap = IdAlloc::with_capacity(blocks_count as usize);
        for bid in 0..data_start_bid {
            block_bitmap.alloc_specific(bid as usize);
            super_block.dec_free_blocks();
        }
        let mut inode_bitmap = IdAlloc::with_capacity(inodes_count as usize);
        // Inode number 1 is reserved.
        inode_bitmap.alloc_specific(0);
        super_block.dec_free_inodes();

        let fs = Arc::new_cyclic(|weak_ref| Self {
            block_device,
            super_block: RwLock::new(Dirty::new_dirty(super_block)),
            inode_bitmap: RwLock::new(Dirty::new_dirty(inode_bitmap)),
            block_bitmap: RwLock::new(Dirty::new_dirty(block_bitmap)),
            inode_cache: RwLock::new(BTreeMap::new()),
            self_ref: weak_ref.clone(),
        });

        let root = fs
            .alloc_inode(FileType::Dir, FilePerm::from_bits_truncate(0o755))?
            .publish();
        debug_assert_eq!(root.ino(), ROOT_INO);
        fs.sync_all()?;
        info!("formatted filesystem: {:?}", fs);
        Ok(fs)
    }

    /// Returns the block device.
    pub fn block_device(&self) -> &dyn BlockDevice {
        self.block_device.as_ref()
    }

    /// Returns the root directory inode.
    pub fn root_inode(&self) -> Result<Arc<Inode>> {
        self.lookup_inode(ROOT_INO)
    }

    pub fn free_inodes_count(&self) -> u32 {
        self.super_block.read().free_inodes_count()
    }

    pub fn free_blocks_count(&self) -> u32 {
        self.super_block.read().free_blocks_count()
    }

    /// Resolves an inode number to a live inode.
    ///
    /// Fails with `StaleReference` when the number is out of range, the slot
    /// is not allocated, or the on-disk inode was never initialized — i.e.
    /// the reference no longer (or not yet) denotes a live inode.
    pub(crate) fn lookup_inode(&self, ino: u32) -> Result<Arc<Inode>> {
        if ino == 0 || ino > self.super_block.read().inodes_count() {
            return Err(Error::StaleReference);
        }

        // The fast path
        if let Some(inode) = self.inode_cache.read().get(&ino) {
            return Ok(inode.clone());
        }
        if !self.inode_bitmap.read().is_allocated((ino - 1) as usize) {
            return Err(Error::StaleReference);
        }

        // The slow path: load the on-disk inode, then insert it into the
        // cache unless another caller raced us to it.
        let inode = {
            let raw = self.read_raw_inode(ino)?;
            let desc = InodeDesc::try_from(raw)?;
            Inode::new(ino, Dirty::new(desc), self.self_ref.clone())
        };
        let mut inode_cache = self.inode_cache.write();
        if let Some(existing) = inode_cache.get(&ino) {
            return Ok(existing.clone());
        }
        inode_cache.insert(ino, inode.clone());
        Ok(inode)
    }

    /// Obtains a free inode slot and returns it in the locked, provisional
    /// state. The slot is marked allocated but its on-disk image stays
    /// zeroed and the inode is absent from the cache, so it cannot be
    /// resolved by number until it is published.
    pub(crate) fn alloc_inode(
        &self,
        file_type: FileType,
        file_perm: FilePerm,
    ) -> Result<ProvisionalInode> {
        let inode_idx = self.inode_bitmap.write().alloc().ok_or(Error::NoSpace)?;
        self.super_block.write().dec_free_inodes();

        let ino = inode_idx as u32 + 1;
        let inode = Inode::new(ino, InodeDesc::new(file_type, file_perm), self.self_ref.clone());
        Ok(ProvisionalInode::new(inode))
    }

    /// Makes a published inode resolvable by number.
    pub(crate) fn publish_inode(&self, inode: Arc<Inode>) {
        self.inode_cache.write().insert(inode.ino(), inode);
    }

    /// Frees an inode slot whose link count reached zero.
    ///
    /// The on-disk slot is zeroed first so that any directory entry still
    /// holding the number fails to resolve instead of reading stale data.
    pub(crate) fn free_inode(&self, ino: u32) -> Result<()> {
        self.clear_raw_inode(ino)?;
        self.inode_bitmap.write().free((ino - 1) as usize);
        self.super_block.write().inc_free_inodes();
        self.inode_cache.write().remove(&ino);
        Ok(())
    }

    /// Allocates a free data block.
    pub(crate) fn alloc_block(&self) -> Result<Bid> {
        let block_idx = self.block_bitmap.write().alloc().ok_or(Error::NoSpace)?;
        self.super_block.write().dec_free_blocks();
        Ok(block_idx as Bid)
    }

    /// Frees a data block.
    pub(crate) fn free_block(&self, bid: Bid) -> Result<()> {
        self.block_bitmap.write().free(bid as usize);
        self.super_block.write().inc_free_blocks();
        Ok(())
    }

    /// Writes back the metadata of an inode to its slot in the inode table.
    pub(crate) fn write_raw_inode(&self, ino: u32, raw_inode: &RawInode) -> Result<()> {
        let (bid, offset) = self.raw_inode_pos(ino);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.block_device.read_block(bid, &mut buf)?;
        buf[offset..offset + INODE_SIZE].copy_from_slice(raw_inode.as_bytes());
        self.write_meta_block(bid, &buf)
    }

    fn read_raw_inode(&self, ino: u32) -> Result<RawInode> {
        let (bid, offset) = self.raw_inode_pos(ino);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.block_device.read_block(bid, &mut buf)?;
        Ok(RawInode::read_from_bytes(&buf[offset..offset + INODE_SIZE]).unwrap())
    }

    fn clear_raw_inode(&self, ino: u32) -> Result<()> {
        let (bid, offset) = self.raw_inode_pos(ino);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.block_device.read_block(bid, &mut buf)?;
        buf[offset..offset + INODE_SIZE].fill(0);
        self.write_meta_block(bid, &buf)
    }

    fn raw_inode_pos(&self, ino: u32) -> (Bid, usize) {
        let inode_idx = (ino - 1) as usize;
        let bid = INODE_TABLE_BID + (inode_idx / INODES_PER_BLOCK) as Bid;
        let offset = (inode_idx % INODES_PER_BLOCK) * INODE_SIZE;
        (bid, offset)
    }

    fn write_meta_block(&self, bid: Bid, buf: &[u8]) -> Result<()> {
        self.block_device.write_block(bid, buf)?;
        self.block_device.mark_dirty(bid)
    }

    /// Writes back all cached inodes and then the filesystem metadata.
    ///
    /// Inodes whose link count dropped to zero are reclaimed here; syncing
    /// them first may therefore still modify the bitmaps and super block.
    pub fn sync_all(&self) -> Result<()> {
        let inodes: Vec<Arc<Inode>> = self.inode_cache.read().values().cloned().collect();
        for inode in inodes {
            inode.sync_metadata()?;
        }
        self.sync_metadata()
    }

    /// Writes back the super block and both bitmaps if they are dirty.
    pub fn sync_metadata(&self) -> Result<()> {
        if self.super_block.read().is_dirty() {
            let mut super_block = self.super_block.write();
            let raw = RawSuperBlock::from(&**super_block);
            let mut buf = vec![0u8; BLOCK_SIZE];
            buf[..core::mem::size_of::<RawSuperBlock>()].copy_from_slice(raw.as_bytes());
            self.write_meta_block(SUPER_BLOCK_BID, &buf)?;
            super_block.clear_dirty();
        }
        self.sync_bitmap(&self.inode_bitmap, INODE_BITMAP_BID)?;
        self.sync_bitmap(&self.block_bitmap, BLOCK_BITMAP_BID)?;
        Ok(())
    }

    fn sync_bitmap(&self, bitmap: &RwLock<Dirty<IdAlloc>>, bid: Bid) -> Result<()> {
        if !bitmap.read().is_dirty() {
            return Ok(());
        }
        let mut bitmap = bitmap.write();
        let mut buf = vec![0u8; BLOCK_SIZE];
        let bytes = bitmap.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        self.write_meta_block(bid, &buf)?;
        bitmap.clear_dirty();
        Ok(())
    }
}

impl Debug for SimpleFs {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("SimpleFs")
            .field("super_block", &self.super_block.read())
            .field("inode_bitmap", &self.inode_bitmap.read())
            .field("block_bitmap", &self.block_bitmap.read())
            .finish()
    }
}

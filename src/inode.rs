use crate::dir::{DirEntry, DirEntryReader, DirEntryWriter, MAX_NAME_LEN};
use crate::fs::SimpleFs;
use crate::prelude::*;

use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use int_to_c_enum::TryFromInt;
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of an on-disk inode in bytes.
pub(crate) const INODE_SIZE: usize = 128;
/// Number of inode slots per inode-table block.
pub(crate) const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Number of direct block pointers per inode.
pub(crate) const DIRECT_PTR_CNT: usize = 12;

/// An in-memory inode.
///
/// The mutable metadata lives behind a per-inode lock. The lock backs the
/// serialization contract of the namespace operations: the caller must
/// serialize all operations on a given directory, and the lock makes a
/// violation of that contract safe, not correct.
pub struct Inode {
    ino: u32,
    caps: Capabilities,
    desc: RwLock<Dirty<InodeDesc>>,
    is_freed: AtomicBool,
    fs: Weak<SimpleFs>,
}

impl Inode {
    pub(crate) fn new(ino: u32, desc: Dirty<InodeDesc>, fs: Weak<SimpleFs>) -> Arc<Self> {
        // The capability set is attached exactly once, before the inode can
        // be observed by anyone else.
        let caps = Capabilities::for_type(desc.type_);
        Arc::new(Self {
            ino,
            caps,
            desc: RwLock::new(desc),
            is_freed: AtomicBool::new(false),
            fs,
        })
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn fs(&self) -> Arc<SimpleFs> {
        self.fs.upgrade().unwrap()
    }

    /// The set of operation families this inode supports.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn file_type(&self) -> FileType {
        self.desc.read().type_
    }

    pub fn file_perm(&self) -> FilePerm {
        self.desc.read().perm
    }

    pub fn set_file_perm(&self, perm: FilePerm) -> Result<()> {
        self.require(Capabilities::FILE_METADATA)?;
        self.desc.write().perm = perm;
        Ok(())
    }

    pub fn file_size(&self) -> usize {
        self.desc.read().size as usize
    }

    pub fn hard_links(&self) -> u16 {
        self.desc.read().hard_links
    }

    pub fn blocks_count(&self) -> u32 {
        self.desc.read().blocks_count
    }

    pub(crate) fn inc_hard_links(&self) {
        self.desc.write().hard_links += 1;
    }

    pub(crate) fn dec_hard_links(&self) {
        let mut desc = self.desc.write();
        debug_assert!(desc.hard_links > 0);
        desc.hard_links -= 1;
    }

    fn require(&self, caps: Capabilities) -> Result<()> {
        if self.caps.contains(caps) {
            Ok(())
        } else {
            Err(Error::OpNotSupported)
        }
    }
}

// Namespace operations.
//
// Every method below requires the caller to hold exclusive access to this
// directory for the whole operation; the filesystem serializes nothing
// across operations on its own.
impl Inode {
    /// Creates a regular file named `name` in this directory.
    ///
    /// The new inode and its directory entry become visible atomically: a
    /// failure after the inode slot was acquired rolls the slot back before
    /// the error is returned, so no orphaned inode and no dangling entry
    /// can be observed afterwards.
    pub fn create(&self, name: &str, file_type: FileType, file_perm: FilePerm) -> Result<Arc<Self>> {
        if !self.caps.contains(Capabilities::DIR_ENTRIES) {
            return Err(Error::NotDir);
        }
        if file_type != FileType::File {
            return Err(Error::OpNotSupported);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }
        if DirEntryReader::new(self).find(name)?.is_some() {
            return Err(Error::Exist);
        }

        let provisional = self.fs().alloc_inode(file_type, file_perm)?;
        debug!("creating \"{}\" with inode {}", name, provisional.ino());
        match DirEntryWriter::new(self).insert(name, provisional.ino()) {
            Ok(_) => Ok(provisional.publish()),
            Err(e) => {
                provisional.rollback();
                Err(e)
            }
        }
    }

    /// Looks up `name` in this directory.
    ///
    /// A missing name is a negative result, not an error: the caller is the
    /// one publishing lookup results and decides what to do with `None`.
    /// Negative lookups have no side effects.
    pub fn lookup(&self, name: &str) -> Result<Option<Arc<Self>>> {
        if !self.caps.contains(Capabilities::DIR_ENTRIES) {
            return Err(Error::NotDir);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }

        let Some((ino, _)) = DirEntryReader::new(self).find(name)? else {
            return Ok(None);
        };
        self.fs().lookup_inode(ino).map(Some)
    }

    /// Removes the entry `name` and drops one link of the inode it named.
    ///
    /// The link count is decremented only after the entry was deleted; a
    /// deletion failure leaves both the directory and the inode exactly as
    /// they were. Reclamation of an inode whose count reached zero happens
    /// at sync time.
    pub fn unlink(&self, name: &str) -> Result<()> {
        if !self.caps.contains(Capabilities::DIR_ENTRIES) {
            return Err(Error::NotDir);
        }

        let Some((ino, slot)) = DirEntryReader::new(self).find(name)? else {
            return Err(Error::NotFound);
        };
        let inode = self.fs().lookup_inode(ino)?;
        if inode.file_type() == FileType::Dir {
            return Err(Error::IsDir);
        }

        debug!("deleting \"{}\" with inode {}", name, ino);
        DirEntryWriter::new(self).delete(slot)?;
        inode.dec_hard_links();
        Ok(())
    }

    /// Creates a symlink named `name` pointing at `target`.
    ///
    /// The target is stored through the inode's block mapping and must fit
    /// in a single block including its terminator.
    pub fn symlink(&self, name: &str, target: &str) -> Result<Arc<Self>> {
        if !self.caps.contains(Capabilities::DIR_ENTRIES) {
            return Err(Error::NotDir);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }
        if target.len() + 1 >= BLOCK_SIZE {
            return Err(Error::NameTooLong);
        }
        if DirEntryReader::new(self).find(name)?.is_some() {
            return Err(Error::Exist);
        }

        let provisional = self
            .fs()
            .alloc_inode(FileType::Symlink, FilePerm::from_bits_truncate(0o777))?;
        if let Err(e) = provisional.inode().write_link(target) {
            error!(
                "failed to write target of symlink inode {}: {:?}",
                provisional.ino(),
                e
            );
            provisional.rollback();
            return Err(e);
        }
        debug!("creating symlink \"{}\" with inode {}", name, provisional.ino());
        match DirEntryWriter::new(self).insert(name, provisional.ino()) {
            Ok(_) => Ok(provisional.publish()),
            Err(e) => {
                provisional.rollback();
                Err(e)
            }
        }
    }

    /// Lists the directory's valid entries in scan order.
    pub fn read_dir(&self) -> Result<Vec<DirEntry>> {
        if !self.caps.contains(Capabilities::DIR_ENTRIES) {
            return Err(Error::NotDir);
        }

        let mut reader = DirEntryReader::new(self);
        let mut entries = Vec::new();
        while let Some((_, entry)) = reader.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn entry_count(&self) -> Result<usize> {
        Ok(self.read_dir()?.len())
    }
}

// File content and symlink payload, both over the direct block mapping.
impl Inode {
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.require(Capabilities::FILE_CONTENT)?;

        let file_size = self.file_size();
        let start = file_size.min(offset);
        let end = file_size.min(offset + buf.len());

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut read_len = 0;
        let mut pos = start;
        while pos < end {
            let file_bid = (pos / BLOCK_SIZE) as u32;
            let begin = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - begin).min(end - pos);
            self.read_block_at(file_bid, &mut block)?;
            buf[read_len..read_len + len].copy_from_slice(&block[begin..begin + len]);
            read_len += len;
            pos += len;
        }
        Ok(read_len)
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        self.require(Capabilities::FILE_CONTENT)?;

        let end = offset + buf.len();
        while (self.blocks_count() as usize) * BLOCK_SIZE < end {
            self.append_block()?;
        }

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut written = 0;
        let mut pos = offset;
        while pos < end {
            let file_bid = (pos / BLOCK_SIZE) as u32;
            let begin = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - begin).min(end - pos);
            if len < BLOCK_SIZE {
                self.read_block_at(file_bid, &mut block)?;
            }
            block[begin..begin + len].copy_from_slice(&buf[written..written + len]);
            self.write_block_at(file_bid, &block)?;
            written += len;
            pos += len;
        }

        if end > self.file_size() {
            self.desc.write().size = end as u32;
        }
        Ok(buf.len())
    }

    /// Stores the null-terminated `target` in the inode's first data block.
    pub fn write_link(&self, target: &str) -> Result<()> {
        self.require(Capabilities::SYMLINK_TARGET)?;
        if target.len() + 1 > BLOCK_SIZE {
            return Err(Error::NameTooLong);
        }

        if self.blocks_count() == 0 {
            self.append_block()?;
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..target.len()].copy_from_slice(target.as_bytes());
        self.write_block_at(0, &block)?;

        self.desc.write().size = target.len() as u32;
        Ok(())
    }

    pub fn read_link(&self) -> Result<String> {
        self.require(Capabilities::SYMLINK_TARGET)?;

        let size = self.file_size();
        if size == 0 {
            return Ok(String::new());
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        self.read_block_at(0, &mut block)?;
        String::from_utf8(block[..size].to_vec()).map_err(|_| Error::InvalidParam)
    }
}

// Block mapping.
impl Inode {
    /// Maps an inode-relative block to its device block.
    fn device_bid(&self, file_bid: u32) -> Result<Bid> {
        let desc = self.desc.read();
        if file_bid >= desc.blocks_count {
            return Err(Error::InvalidParam);
        }
        Ok(desc.data[file_bid as usize])
    }

    pub(crate) fn read_block_at(&self, file_bid: u32, buf: &mut [u8]) -> Result<()> {
        let bid = self.device_bid(file_bid)?;
        self.fs().block_device().read_block(bid, buf)
    }

    /// Writes one mapped block and marks it dirty for write-back.
    pub(crate) fn write_block_at(&self, file_bid: u32, buf: &[u8]) -> Result<()> {
        let bid = self.device_bid(file_bid)?;
        let fs = self.fs();
        fs.block_device().write_block(bid, buf)?;
        fs.block_device().mark_dirty(bid)
    }

    /// Grows the mapping by one zeroed block and returns its inode-relative
    /// id. Fails with `NoSpace` once all direct pointers are in use.
    pub(crate) fn append_block(&self) -> Result<u32> {
        self.require(Capabilities::BLOCK_MAPPING)?;

        let fs = self.fs();
        let mut desc = self.desc.write();
        let file_bid = desc.blocks_count;
        if file_bid as usize >= DIRECT_PTR_CNT {
            return Err(Error::NoSpace);
        }
        let device_bid = fs.alloc_block()?;
        // Zero the fresh block before linking it into the mapping.
        let zeroed = vec![0u8; BLOCK_SIZE];
        if let Err(e) = fs
            .block_device()
            .write_block(device_bid, &zeroed)
            .and_then(|_| fs.block_device().mark_dirty(device_bid))
        {
            fs.free_block(device_bid)?;
            return Err(e);
        }

        desc.data[file_bid as usize] = device_bid;
        desc.blocks_count = file_bid + 1;
        if desc.type_ == FileType::Dir {
            desc.size = desc.blocks_count * BLOCK_SIZE as u32;
        }
        Ok(file_bid)
    }
}

// Write-back and reclamation.
impl Inode {
    /// Writes the inode's metadata back to its inode-table slot.
    ///
    /// An inode whose link count dropped to zero is reclaimed instead: its
    /// data blocks and its slot return to the allocators.
    pub fn sync_metadata(&self) -> Result<()> {
        if self.is_freed.load(Ordering::Relaxed) {
            return Ok(());
        }
        if !self.desc.read().is_dirty() {
            return Ok(());
        }
        if self.desc.read().hard_links == 0 {
            return self.release();
        }

        let fs = self.fs();
        let mut desc = self.desc.write();
        let raw_inode = RawInode::from(&**desc);
        fs.write_raw_inode(self.ino, &raw_inode)?;
        desc.clear_dirty();
        Ok(())
    }

    /// Returns the inode's blocks and slot to the allocators. Idempotent.
    pub(crate) fn release(&self) -> Result<()> {
        if self.is_freed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let data_blocks: Vec<Bid> = {
            let desc = self.desc.read();
            desc.data[..desc.blocks_count as usize].to_vec()
        };
        let fs = self.fs();
        for bid in data_blocks {
            fs.free_block(bid)?;
        }
        fs.free_inode(self.ino)
    }
}

impl Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("caps", &self.caps)
            .field("desc", &self.desc.read())
            .finish()
    }
}

/// An inode between allocation and its first directory entry.
///
/// The running operation owns the inode exclusively: the slot is marked
/// allocated, the link count already holds the optimistic 1, but the inode
/// is absent from the inode cache and its on-disk slot is still zeroed, so
/// it cannot be resolved by number. `publish` and `rollback` consume the
/// value; exactly one of them must be called.
pub(crate) struct ProvisionalInode {
    inode: Arc<Inode>,
    state: ProvisionalState,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ProvisionalState {
    Locked,
    Published,
    RolledBack,
}

impl ProvisionalInode {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            state: ProvisionalState::Locked,
        }
    }

    pub fn ino(&self) -> u32 {
        self.inode.ino()
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Locked -> Published: the inode becomes resolvable by number. Must
    /// follow the directory-entry insertion that names it.
    pub fn publish(mut self) -> Arc<Inode> {
        self.state = ProvisionalState::Published;
        let inode = self.inode.clone();
        inode.fs().publish_inode(inode.clone());
        inode
    }

    /// Locked -> RolledBack: undoes the optimistic link and returns the
    /// slot (and any data blocks already acquired) to the allocators.
    pub fn rollback(mut self) {
        self.state = ProvisionalState::RolledBack;
        self.inode.dec_hard_links();
        if let Err(e) = self.inode.release() {
            error!("failed to release inode {} on rollback: {:?}", self.inode.ino(), e);
        }
    }
}

impl Drop for ProvisionalInode {
    fn drop(&mut self) {
        debug_assert!(
            self.state != ProvisionalState::Locked,
            "provisional inode dropped without publish or rollback"
        );
    }
}

/// The in-memory inode descriptor.
///
/// It mirrors the on-disk inode and carries everything about an object
/// except its name.
pub(crate) struct InodeDesc {
    type_: FileType,
    perm: FilePerm,
    uid: u16,
    gid: u16,
    size: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    hard_links: u16,
    blocks_count: u32,
    data: [Bid; DIRECT_PTR_CNT],
}

impl InodeDesc {
    /// A descriptor for a freshly allocated inode, with the link count
    /// already holding the optimistic 1 of the entry about to name it.
    pub fn new(type_: FileType, perm: FilePerm) -> Dirty<Self> {
        Dirty::new_dirty(Self {
            type_,
            perm,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            hard_links: 1,
            blocks_count: 0,
            data: [0; DIRECT_PTR_CNT],
        })
    }
}

impl TryFrom<RawInode> for InodeDesc {
    type Error = crate::error::Error;

    fn try_from(raw: RawInode) -> Result<Self> {
        let type_ = FileType::from_raw_mode(raw.mode)?;
        Ok(Self {
            type_,
            perm: FilePerm::from_raw_mode(raw.mode),
            uid: raw.uid,
            gid: raw.gid,
            size: raw.size,
            atime: raw.atime,
            ctime: raw.ctime,
            mtime: raw.mtime,
            hard_links: raw.hard_links,
            blocks_count: raw.blocks_count,
            data: raw.data,
        })
    }
}

impl Debug for InodeDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("InodeDesc")
            .field("type_", &self.type_)
            .field("size", &self.size)
            .field("hard_links", &self.hard_links)
            .field("blocks_count", &self.blocks_count)
            .finish()
    }
}

/// The raw inode on device.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct RawInode {
    /// File mode (type and permissions). A mode of 0 marks a slot that was
    /// never initialized or has been freed.
    pub mode: u16,
    pub uid: u16,
    /// Size in bytes.
    pub size: u32,
    /// Access time.
    pub atime: u32,
    /// Creation time.
    pub ctime: u32,
    /// Modification time.
    pub mtime: u32,
    /// Deletion time.
    pub dtime: u32,
    pub gid: u16,
    /// Hard links count.
    pub hard_links: u16,
    /// Blocks count.
    pub blocks_count: u32,
    /// File flags.
    pub flags: u32,
    /// Pointers to blocks.
    pub data: [u32; DIRECT_PTR_CNT],
    /// File version (for NFS).
    pub generation: u32,
    reserved: [u32; 10],
}

const_assert!(core::mem::size_of::<RawInode>() == INODE_SIZE);

impl From<&InodeDesc> for RawInode {
    fn from(desc: &InodeDesc) -> Self {
        Self {
            mode: desc.type_ as u16 | desc.perm.bits(),
            uid: desc.uid,
            size: desc.size,
            atime: desc.atime,
            ctime: desc.ctime,
            mtime: desc.mtime,
            dtime: 0,
            gid: desc.gid,
            hard_links: desc.hard_links,
            blocks_count: desc.blocks_count,
            flags: 0,
            data: desc.data,
            generation: 0,
            reserved: [0u32; 10],
        }
    }
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromInt)]
pub enum FileType {
    /// Directory
    Dir = 0o040000,
    /// Regular file
    File = 0o100000,
    /// Symbolic link
    Symlink = 0o120000,
}

impl FileType {
    pub(crate) fn from_raw_mode(mode: u16) -> Result<Self> {
        const TYPE_MASK: u16 = 0o170000;
        Self::try_from(mode & TYPE_MASK).map_err(|_| Error::StaleReference)
    }
}

bitflags! {
    pub struct FilePerm: u16 {
        /// set-user-ID
        const S_ISUID = 0o4000;
        /// set-group-ID
        const S_ISGID = 0o2000;
        /// sticky bit
        const S_ISVTX = 0o1000;
        /// read by owner
        const S_IRUSR = 0o0400;
        /// write by owner
        const S_IWUSR = 0o0200;
        /// execute/search by owner
        const S_IXUSR = 0o0100;
        /// read by group
        const S_IRGRP = 0o0040;
        /// write by group
        const S_IWGRP = 0o0020;
        /// execute/search by group
        const S_IXGRP = 0o0010;
        /// read by others
        const S_IROTH = 0o0004;
        /// write by others
        const S_IWOTH = 0o0002;
        /// execute/search by others
        const S_IXOTH = 0o0001;
    }
}

impl FilePerm {
    pub fn from_raw_mode(mode: u16) -> Self {
        const PERM_MASK: u16 = 0o7777;
        Self::from_bits_truncate(mode & PERM_MASK)
    }
}

bitflags! {
    /// The operation families an inode supports.
    ///
    /// The set is attached exactly once, at allocation, and derived from
    /// the on-disk type tag on every load; it is part of the stable format
    /// contract.
    pub struct Capabilities: u8 {
        /// Reading and writing file content.
        const FILE_CONTENT = 1 << 0;
        /// Reading and changing file metadata.
        const FILE_METADATA = 1 << 1;
        /// Mapping inode-relative blocks to device blocks.
        const BLOCK_MAPPING = 1 << 2;
        /// Storing and reading a symlink target.
        const SYMLINK_TARGET = 1 << 3;
        /// Holding directory-entry records.
        const DIR_ENTRIES = 1 << 4;
    }
}

impl Capabilities {
    pub fn for_type(type_: FileType) -> Self {
        match type_ {
            FileType::File => Self::FILE_CONTENT | Self::FILE_METADATA | Self::BLOCK_MAPPING,
            FileType::Symlink => Self::SYMLINK_TARGET | Self::BLOCK_MAPPING,
            FileType::Dir => Self::DIR_ENTRIES | Self::FILE_METADATA | Self::BLOCK_MAPPING,
        }
    }
}

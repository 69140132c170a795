use crate::inode::Inode;
use crate::prelude::*;

use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Max length of a directory-entry name.
pub const MAX_NAME_LEN: usize = 255;

/// Size of an on-disk directory-entry record.
pub(crate) const DIR_ENTRY_SIZE: usize = 264;
/// Number of record slots per directory block.
pub(crate) const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

const ENTRY_VALID: u8 = 1;

/// The raw directory-entry record on device.
///
/// An inode number of 0 and a cleared valid flag both mark the slot as
/// unused and reusable.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct RawDirEntry {
    ino: u32,
    name_len: u8,
    valid: u8,
    reserved: [u8; 2],
    name: [u8; MAX_NAME_LEN],
    pad: [u8; 1],
}

const_assert!(core::mem::size_of::<RawDirEntry>() == DIR_ENTRY_SIZE);

impl RawDirEntry {
    fn new(ino: u32, name: &str) -> Self {
        debug_assert!(ino != 0 && name.len() <= MAX_NAME_LEN);
        let mut name_buf = [0u8; MAX_NAME_LEN];
        name_buf[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            ino,
            name_len: name.len() as u8,
            valid: ENTRY_VALID,
            reserved: [0u8; 2],
            name: name_buf,
            pad: [0u8; 1],
        }
    }

    fn is_valid(&self) -> bool {
        self.valid == ENTRY_VALID && self.ino != 0
    }

    fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

/// A directory entry decoded from its on-disk record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    name: String,
    ino: u32,
}

impl DirEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }
}

impl From<&RawDirEntry> for DirEntry {
    fn from(raw: &RawDirEntry) -> Self {
        Self {
            name: String::from_utf8_lossy(raw.name()).into_owned(),
            ino: raw.ino,
        }
    }
}

/// Position of an entry record inside a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntrySlot {
    file_bid: u32,
    index: usize,
}

fn record_range(index: usize) -> core::ops::Range<usize> {
    index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE
}

/// Sequential reader over a directory's entry records.
///
/// Only the underlying block reads can fail; a name that is not present is
/// reported as an empty result, never as an error.
pub(crate) struct DirEntryReader<'a> {
    dir: &'a Inode,
    block: Vec<u8>,
    file_bid: u32,
    index: usize,
    loaded: bool,
}

impl<'a> DirEntryReader<'a> {
    pub fn new(dir: &'a Inode) -> Self {
        Self {
            dir,
            block: vec![0u8; BLOCK_SIZE],
            file_bid: 0,
            index: 0,
            loaded: false,
        }
    }

    /// Returns the next valid entry, or `None` at the end of the directory.
    pub fn next_entry(&mut self) -> Result<Option<(DirEntrySlot, DirEntry)>> {
        loop {
            if self.file_bid >= self.dir.blocks_count() {
                return Ok(None);
            }
            if !self.loaded {
                self.dir.read_block_at(self.file_bid, &mut self.block)?;
                self.loaded = true;
            }
            while self.index < ENTRIES_PER_BLOCK {
                let index = self.index;
                self.index += 1;
                let raw = RawDirEntry::read_from_bytes(&self.block[record_range(index)]).unwrap();
                if raw.is_valid() {
                    let slot = DirEntrySlot {
                        file_bid: self.file_bid,
                        index,
                    };
                    return Ok(Some((slot, DirEntry::from(&raw))));
                }
            }
            self.file_bid += 1;
            self.index = 0;
            self.loaded = false;
        }
    }

    /// Returns the first valid record matching `name`, with its location.
    pub fn find(&mut self, name: &str) -> Result<Option<(u32, DirEntrySlot)>> {
        while let Some((slot, entry)) = self.next_entry()? {
            if entry.name() == name {
                return Ok(Some((entry.ino(), slot)));
            }
        }
        Ok(None)
    }
}

/// Mutating access to a directory's entry records.
///
/// Every mutation writes the affected block through the block device and
/// marks it dirty for write-back.
pub(crate) struct DirEntryWriter<'a> {
    dir: &'a Inode,
}

impl<'a> DirEntryWriter<'a> {
    pub fn new(dir: &'a Inode) -> Self {
        Self { dir }
    }

    /// Inserts a `name -> ino` record, reusing the first free slot or
    /// growing the directory by one block.
    ///
    /// A valid record with the same name makes the insertion fail with
    /// `Exist` rather than overwrite. Fails with `NoSpace` when no slot is
    /// free and the directory cannot grow.
    pub fn insert(&mut self, name: &str, ino: u32) -> Result<DirEntrySlot> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }

        let mut free_slot: Option<DirEntrySlot> = None;
        let mut block = vec![0u8; BLOCK_SIZE];
        for file_bid in 0..self.dir.blocks_count() {
            self.dir.read_block_at(file_bid, &mut block)?;
            for index in 0..ENTRIES_PER_BLOCK {
                let raw = RawDirEntry::read_from_bytes(&block[record_range(index)]).unwrap();
                if raw.is_valid() {
                    if raw.name() == name.as_bytes() {
                        return Err(Error::Exist);
                    }
                } else if free_slot.is_none() {
                    free_slot = Some(DirEntrySlot { file_bid, index });
                }
            }
        }

        let slot = match free_slot {
            Some(slot) => slot,
            None => DirEntrySlot {
                file_bid: self.dir.append_block()?,
                index: 0,
            },
        };
        self.write_record(slot, &RawDirEntry::new(ino, name))?;
        Ok(slot)
    }

    /// Marks the record at `slot` invalid.
    ///
    /// Fails with `NotFound` when the asserted location no longer holds a
    /// valid record; in that case nothing is modified.
    pub fn delete(&mut self, slot: DirEntrySlot) -> Result<()> {
        if slot.file_bid >= self.dir.blocks_count() || slot.index >= ENTRIES_PER_BLOCK {
            return Err(Error::NotFound);
        }

        let mut block = vec![0u8; BLOCK_SIZE];
        self.dir.read_block_at(slot.file_bid, &mut block)?;
        let raw = RawDirEntry::read_from_bytes(&block[record_range(slot.index)]).unwrap();
        if !raw.is_valid() {
            return Err(Error::NotFound);
        }
        block[record_range(slot.index)].fill(0);
        self.dir.write_block_at(slot.file_bid, &block)
    }

    fn write_record(&mut self, slot: DirEntrySlot, raw: &RawDirEntry) -> Result<()> {
        let mut block = vec![0u8; BLOCK_SIZE];
        self.dir.read_block_at(slot.file_bid, &mut block)?;
        block[record_range(slot.index)].copy_from_slice(raw.as_bytes());
        self.dir.write_block_at(slot.file_bid, &block)
    }
}

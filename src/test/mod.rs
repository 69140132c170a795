use crate::dir::{DirEntryReader, DirEntryWriter, ENTRIES_PER_BLOCK};
use crate::error::{Error, Result};
use crate::fs::{SimpleFs, ROOT_INO};
use crate::inode::{Capabilities, FilePerm, FileType, Inode, DIRECT_PTR_CNT};
use crate::traits::{Bid, BlockDevice, BLOCK_SIZE};

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// An in-memory block device that records which blocks were marked dirty.
#[derive(Debug)]
struct MemDisk {
    blocks: Mutex<Vec<u8>>,
    dirty: Mutex<BTreeSet<Bid>>,
}

impl MemDisk {
    fn new(total_blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(vec![0u8; total_blocks * BLOCK_SIZE]),
            dirty: Mutex::new(BTreeSet::new()),
        })
    }

    fn dirty_marks(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, bid: Bid, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock().unwrap();
        let offset = bid as usize * BLOCK_SIZE;
        if buf.len() != BLOCK_SIZE || offset + BLOCK_SIZE > blocks.len() {
            return Err(Error::IoError);
        }
        buf.copy_from_slice(&blocks[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, bid: Bid, buf: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock().unwrap();
        let offset = bid as usize * BLOCK_SIZE;
        if buf.len() != BLOCK_SIZE || offset + BLOCK_SIZE > blocks.len() {
            return Err(Error::IoError);
        }
        blocks[offset..offset + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn mark_dirty(&self, bid: Bid) -> Result<()> {
        self.dirty.lock().unwrap().insert(bid);
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        (self.blocks.lock().unwrap().len() / BLOCK_SIZE) as u64
    }
}

fn new_fs(total_blocks: usize, inodes_count: u32) -> (Arc<MemDisk>, Arc<SimpleFs>) {
    let disk = MemDisk::new(total_blocks);
    let fs = SimpleFs::format(disk.clone(), inodes_count).unwrap();
    (disk, fs)
}

fn perm(bits: u16) -> FilePerm {
    FilePerm::from_bits_truncate(bits)
}

fn names(dir: &Inode) -> Vec<String> {
    dir.read_dir()
        .unwrap()
        .iter()
        .map(|entry| entry.name().to_string())
        .collect()
}

#[test]
fn test_format_and_reopen() {
    let (disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    assert_eq!(root.ino(), ROOT_INO);
    assert_eq!(root.file_type(), FileType::Dir);

    let file = root.create("hello", FileType::File, perm(0o644)).unwrap();
    fs.sync_all().unwrap();
    drop(root);
    drop(fs);

    let fs = SimpleFs::open(disk).unwrap();
    let root = fs.root_inode().unwrap();
    let found = root.lookup("hello").unwrap().unwrap();
    assert_eq!(found.ino(), file.ino());
    assert_eq!(found.file_type(), FileType::File);
}

#[test]
fn test_open_rejects_unformatted_device() {
    let disk = MemDisk::new(16);
    assert_eq!(SimpleFs::open(disk).unwrap_err(), Error::BadMagic);
}

#[test]
fn test_format_rejects_zero_inodes() {
    let disk = MemDisk::new(16);
    assert_eq!(
        SimpleFs::format(disk, 0).unwrap_err(),
        Error::InvalidParam
    );
}

#[test]
fn test_create_then_lookup() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();

    let file = root.create("file", FileType::File, perm(0o644)).unwrap();
    let found = root.lookup("file").unwrap().unwrap();
    assert_eq!(found.ino(), file.ino());
    assert_eq!(found.file_type(), FileType::File);
    assert_eq!(found.hard_links(), 1);
    assert!(found
        .capabilities()
        .contains(Capabilities::FILE_CONTENT | Capabilities::BLOCK_MAPPING));
}

#[test]
fn test_overlong_name_is_rejected() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    let free_inodes = fs.free_inodes_count();
    let long_name = "x".repeat(256);

    assert_eq!(
        root.create(&long_name, FileType::File, perm(0o644)).unwrap_err(),
        Error::NameTooLong
    );
    assert_eq!(root.lookup(&long_name).unwrap_err(), Error::NameTooLong);
    assert_eq!(root.symlink(&long_name, "/target").unwrap_err(), Error::NameTooLong);

    // No entry and no inode came into existence.
    assert_eq!(root.entry_count().unwrap(), 0);
    assert_eq!(fs.free_inodes_count(), free_inodes);
}

#[test]
fn test_duplicate_name_is_rejected() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    let free_inodes = fs.free_inodes_count();

    root.create("dup", FileType::File, perm(0o644)).unwrap();
    assert_eq!(
        root.create("dup", FileType::File, perm(0o644)).unwrap_err(),
        Error::Exist
    );
    assert_eq!(root.symlink("dup", "/target").unwrap_err(), Error::Exist);

    assert_eq!(root.entry_count().unwrap(), 1);
    assert_eq!(fs.free_inodes_count(), free_inodes - 1);
}

#[test]
fn test_unlink_removes_exactly_one_entry() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();

    root.create("a", FileType::File, perm(0o644)).unwrap();
    root.create("b", FileType::File, perm(0o644)).unwrap();
    let a = root.lookup("a").unwrap().unwrap();
    assert_eq!(names(&root), vec!["a", "b"]);

    root.unlink("a").unwrap();
    assert_eq!(names(&root), vec!["b"]);
    assert!(root.lookup("a").unwrap().is_none());
    assert_eq!(a.hard_links(), 0);
}

#[test]
fn test_unlink_missing_name_fails_not_found() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    root.create("keep", FileType::File, perm(0o644)).unwrap();

    let before = root.read_dir().unwrap();
    assert_eq!(root.unlink("missing").unwrap_err(), Error::NotFound);
    assert_eq!(root.read_dir().unwrap(), before);
}

#[test]
fn test_unlink_then_sync_reclaims_inode_slot() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    let free_inodes = fs.free_inodes_count();

    root.create("tmp", FileType::File, perm(0o644)).unwrap();
    assert_eq!(fs.free_inodes_count(), free_inodes - 1);

    root.unlink("tmp").unwrap();
    fs.sync_all().unwrap();
    assert_eq!(fs.free_inodes_count(), free_inodes);
}

#[test]
fn test_symlink_roundtrip() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();

    const TARGET: &str = "/some/where/else";
    root.symlink("ln", TARGET).unwrap();

    let sym = root.lookup("ln").unwrap().unwrap();
    assert_eq!(sym.file_type(), FileType::Symlink);
    assert!(sym.capabilities().contains(Capabilities::SYMLINK_TARGET));
    assert_eq!(sym.read_link().unwrap(), TARGET);
}

#[test]
fn test_symlink_target_length_bounds() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();

    // One byte below the bound fits together with its terminator.
    let longest = "t".repeat(BLOCK_SIZE - 2);
    root.symlink("long", &longest).unwrap();
    let sym = root.lookup("long").unwrap().unwrap();
    assert_eq!(sym.read_link().unwrap(), longest);

    let free_inodes = fs.free_inodes_count();
    let too_long = "t".repeat(BLOCK_SIZE - 1);
    assert_eq!(
        root.symlink("longer", &too_long).unwrap_err(),
        Error::NameTooLong
    );
    assert!(root.lookup("longer").unwrap().is_none());
    assert_eq!(fs.free_inodes_count(), free_inodes);
}

#[test]
fn test_create_rolls_back_when_directory_is_full() {
    let (_disk, fs) = new_fs(64, 256);
    let root = fs.root_inode().unwrap();

    let capacity = DIRECT_PTR_CNT * ENTRIES_PER_BLOCK;
    for i in 0..capacity {
        root.create(&format!("f{}", i), FileType::File, perm(0o644))
            .unwrap();
    }

    let free_inodes = fs.free_inodes_count();
    assert_eq!(
        root.create("overflow", FileType::File, perm(0o644)).unwrap_err(),
        Error::NoSpace
    );
    // The provisionally allocated slot was returned and no entry exists.
    assert_eq!(fs.free_inodes_count(), free_inodes);
    assert!(root.lookup("overflow").unwrap().is_none());
    assert_eq!(root.entry_count().unwrap(), capacity);
}

#[test]
fn test_symlink_rollback_frees_payload_block() {
    let (_disk, fs) = new_fs(64, 256);
    let root = fs.root_inode().unwrap();

    let capacity = DIRECT_PTR_CNT * ENTRIES_PER_BLOCK;
    for i in 0..capacity {
        root.create(&format!("f{}", i), FileType::File, perm(0o644))
            .unwrap();
    }

    let free_inodes = fs.free_inodes_count();
    let free_blocks = fs.free_blocks_count();
    assert_eq!(root.symlink("sym", "/target").unwrap_err(), Error::NoSpace);
    // Both the inode slot and the already-written payload block returned.
    assert_eq!(fs.free_inodes_count(), free_inodes);
    assert_eq!(fs.free_blocks_count(), free_blocks);
}

#[test]
fn test_negative_lookup_has_no_side_effects() {
    let (disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    root.create("present", FileType::File, perm(0o644)).unwrap();

    let dirty_before = disk.dirty_marks();
    assert!(root.lookup("ghost").unwrap().is_none());
    assert!(root.lookup("ghost").unwrap().is_none());
    assert_eq!(disk.dirty_marks(), dirty_before);
}

#[test]
fn test_delete_on_stale_location_fails_not_found() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    root.create("a", FileType::File, perm(0o644)).unwrap();

    let (_, slot) = DirEntryReader::new(&root).find("a").unwrap().unwrap();
    DirEntryWriter::new(&root).delete(slot).unwrap();
    assert_eq!(root.entry_count().unwrap(), 0);
    assert_eq!(
        DirEntryWriter::new(&root).delete(slot).unwrap_err(),
        Error::NotFound
    );
}

#[test]
fn test_insert_reuses_freed_slot() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();

    root.create("a", FileType::File, perm(0o644)).unwrap();
    root.create("b", FileType::File, perm(0o644)).unwrap();
    root.unlink("a").unwrap();
    root.create("c", FileType::File, perm(0o644)).unwrap();

    // "c" occupies the slot "a" gave up, so it scans first.
    assert_eq!(names(&root), vec!["c", "b"]);
}

#[test]
fn test_file_write_read_across_blocks() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    let file = root.create("data", FileType::File, perm(0o644)).unwrap();

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    file.write_at(100, &payload).unwrap();
    assert_eq!(file.file_size(), 5100);

    let mut read_buf = vec![0u8; payload.len()];
    file.read_at(100, &mut read_buf).unwrap();
    assert_eq!(read_buf, payload);

    // The gap before the payload reads back as zeros.
    let mut head = vec![0xffu8; 100];
    file.read_at(0, &mut head).unwrap();
    assert!(head.iter().all(|&b| b == 0));
}

#[test]
fn test_capability_gating() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();
    let file = root.create("f", FileType::File, perm(0o644)).unwrap();
    let sym = root.symlink("s", "/t").unwrap();

    assert_eq!(file.write_link("/elsewhere").unwrap_err(), Error::OpNotSupported);
    assert_eq!(file.read_link().unwrap_err(), Error::OpNotSupported);
    assert_eq!(sym.read_at(0, &mut [0u8; 8]).unwrap_err(), Error::OpNotSupported);
    assert_eq!(
        file.create("sub", FileType::File, perm(0o644)).unwrap_err(),
        Error::NotDir
    );
    assert_eq!(file.unlink("sub").unwrap_err(), Error::NotDir);
    assert_eq!(
        root.create("d", FileType::Dir, perm(0o755)).unwrap_err(),
        Error::OpNotSupported
    );
}

#[test]
fn test_lookup_through_stale_entry_fails() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();

    let file = root.create("a", FileType::File, perm(0o644)).unwrap();
    let ino = file.ino();
    root.unlink("a").unwrap();
    // Plant an entry that still references the dying inode, then let the
    // sync pass reclaim the slot.
    DirEntryWriter::new(&root).insert("zombie", ino).unwrap();
    drop(file);
    fs.sync_all().unwrap();

    assert_eq!(root.lookup("zombie").unwrap_err(), Error::StaleReference);
}

#[test]
fn test_lookup_missing_is_repeatable() {
    let (_disk, fs) = new_fs(64, 64);
    let root = fs.root_inode().unwrap();

    assert!(root.lookup("nope").unwrap().is_none());
    assert!(root.lookup("nope").unwrap().is_none());
    assert_eq!(root.entry_count().unwrap(), 0);
}

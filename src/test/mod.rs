// SPDX-License-Identifier: MPL-2.0

//! Tests running the whole filesystem against an in-memory disk.

use std::sync::Mutex;

use crate::prelude::*;
use crate::{BlockDevice, Ext2, Ext2Bid, Error, FilePerm, FileType, BLOCK_SIZE, ROOT_INO};

/// A disk backed by a `Vec<u8>`.
struct MemDisk {
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    fn new(total_blocks: Ext2Bid) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; total_blocks as usize * BLOCK_SIZE]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, bid: Ext2Bid, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let begin = bid as usize * BLOCK_SIZE;
        if begin + buf.len() > data.len() {
            return Err(Error::IoError);
        }
        buf.copy_from_slice(&data[begin..begin + buf.len()]);
        Ok(())
    }

    fn write_block(&self, bid: Ext2Bid, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let begin = bid as usize * BLOCK_SIZE;
        if begin + buf.len() > data.len() {
            return Err(Error::IoError);
        }
        data[begin..begin + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn total_blocks(&self) -> Ext2Bid {
        (self.data.lock().unwrap().len() / BLOCK_SIZE) as Ext2Bid
    }
}

fn new_fs_on(total_blocks: Ext2Bid) -> (Arc<MemDisk>, Arc<Ext2>) {
    let disk = MemDisk::new(total_blocks);
    Ext2::format(disk.as_ref(), 512, 64).unwrap();
    let fs = Ext2::open(disk.clone()).unwrap();
    (disk, fs)
}

fn new_fs(total_blocks: Ext2Bid) -> Arc<Ext2> {
    new_fs_on(total_blocks).1
}

fn file_perm() -> FilePerm {
    FilePerm::from_bits_truncate(0o644)
}

fn dir_perm() -> FilePerm {
    FilePerm::from_bits_truncate(0o755)
}

fn list_names(dir: &crate::Ext2Inode) -> Vec<String> {
    let mut names = Vec::new();
    let mut visitor = |name: &str, _ino: u32, _type: FileType, _offset: usize| {
        names.push(name.to_string());
        Ok(())
    };
    dir.readdir_at(0, &mut visitor).unwrap();
    names
}

#[test]
fn format_then_open() {
    let fs = new_fs(1025);
    let super_block = fs.super_block();
    assert_eq!(super_block.total_blocks(), 1025);
    assert_eq!(super_block.block_groups_count(), 2);
    assert_eq!(super_block.first_usable_ino(), 11);
    assert_eq!(super_block.inode_size(), 128);
    assert!(fs.free_blocks_count() > 0);
}

#[test]
fn open_rejects_blank_disk() {
    let disk = MemDisk::new(64);
    assert_eq!(Ext2::open(disk).unwrap_err(), Error::BadMagic);
}

#[test]
fn root_dir_after_format() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    assert_eq!(root.ino(), ROOT_INO);
    assert_eq!(root.file_type(), FileType::Dir);
    assert_eq!(root.hard_links(), 2);
    assert_eq!(list_names(&root), [".", ".."]);

    let self_ref = root.lookup(".").unwrap();
    assert!(Arc::ptr_eq(&root, &self_ref));
}

#[test]
fn create_and_lookup() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();

    let file = root.create("foo", FileType::File, file_perm()).unwrap();
    assert!(file.ino() >= fs.super_block().first_usable_ino());
    assert_eq!(file.file_type(), FileType::File);
    assert_eq!(file.hard_links(), 1);
    assert_eq!(file.file_size(), 0);

    let looked_up = root.lookup("foo").unwrap();
    assert!(Arc::ptr_eq(&file, &looked_up));
    assert_eq!(root.lookup("bar").unwrap_err(), Error::NotFound);
    assert_eq!(
        root.create("foo", FileType::File, file_perm()).unwrap_err(),
        Error::Exist
    );
    assert_eq!(
        file.create("sub", FileType::File, file_perm()).unwrap_err(),
        Error::NotDir
    );
    let long_name = "x".repeat(256);
    assert_eq!(
        root.create(&long_name, FileType::File, file_perm()).unwrap_err(),
        Error::NameTooLong
    );
}

#[test]
fn read_write_across_blocks() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let file = root.create("data", FileType::File, file_perm()).unwrap();

    let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    assert_eq!(file.write_at(100, &payload).unwrap(), payload.len());
    assert_eq!(file.file_size(), 3100);

    let mut buf = vec![0u8; payload.len()];
    assert_eq!(file.read_at(100, &mut buf).unwrap(), payload.len());
    assert_eq!(buf, payload);

    // The gap before the written range reads back as zeroes.
    let mut head = vec![0xffu8; 100];
    assert_eq!(file.read_at(0, &mut head).unwrap(), 100);
    assert!(head.iter().all(|&b| b == 0));

    // Reads stop at end of file.
    let mut tail = vec![0u8; 200];
    assert_eq!(file.read_at(3000, &mut tail).unwrap(), 100);
    assert_eq!(file.read_at(5000, &mut tail).unwrap(), 0);
}

#[test]
fn crossing_into_indirect_takes_a_pointer_block() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let file = root.create("grow", FileType::File, file_perm()).unwrap();
    let free_at_start = fs.free_blocks_count();

    // Twelve blocks fit in the direct pointers.
    file.write_at(0, &vec![1u8; 12 * BLOCK_SIZE]).unwrap();
    assert_eq!(file.blocks_count(), 12);
    assert_eq!(fs.free_blocks_count(), free_at_start - 12);

    // The thirteenth costs two: the data block and the indirect block.
    file.write_at(12 * BLOCK_SIZE, &vec![2u8; BLOCK_SIZE]).unwrap();
    assert_eq!(file.blocks_count(), 13);
    assert_eq!(fs.free_blocks_count(), free_at_start - 14);

    file.resize(0).unwrap();
    assert_eq!(file.blocks_count(), 0);
    assert_eq!(file.file_size(), 0);
    assert_eq!(fs.free_blocks_count(), free_at_start);
}

#[test]
fn truncate_keeps_leading_content() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let file = root.create("trunc", FileType::File, file_perm()).unwrap();
    let free_at_start = fs.free_blocks_count();

    let payload: Vec<u8> = (0..13 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    file.write_at(0, &payload).unwrap();

    file.resize(5 * BLOCK_SIZE).unwrap();
    assert_eq!(file.blocks_count(), 5);
    assert_eq!(fs.free_blocks_count(), free_at_start - 5);

    let mut buf = vec![0u8; 5 * BLOCK_SIZE];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), buf.len());
    assert_eq!(buf, payload[..5 * BLOCK_SIZE]);
}

#[test]
fn hard_links_share_an_inode() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let file = root.create("a", FileType::File, file_perm()).unwrap();
    file.write_at(0, b"shared").unwrap();

    root.link(&file, "b").unwrap();
    assert_eq!(file.hard_links(), 2);
    assert!(Arc::ptr_eq(&file, &root.lookup("b").unwrap()));

    root.unlink("a").unwrap();
    assert_eq!(file.hard_links(), 1);
    assert_eq!(root.lookup("a").unwrap_err(), Error::NotFound);

    let mut buf = [0u8; 6];
    let via_b = root.lookup("b").unwrap();
    via_b.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");
}

#[test]
fn unlinked_inode_is_reclaimed_on_last_drop() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let free_blocks = fs.free_blocks_count();
    let free_inodes = fs.free_inodes_count();

    let file = root.create("tmp", FileType::File, file_perm()).unwrap();
    let ino = file.ino();
    file.write_at(0, &vec![7u8; 2 * BLOCK_SIZE]).unwrap();
    root.unlink("tmp").unwrap();

    // Still open: the storage stays until the last reference goes away.
    assert_eq!(file.hard_links(), 0);
    assert_eq!(fs.free_blocks_count(), free_blocks - 2);
    let mut buf = [0u8; 1];
    assert_eq!(file.read_at(0, &mut buf).unwrap(), 1);

    drop(file);
    assert_eq!(fs.free_blocks_count(), free_blocks);
    assert_eq!(fs.free_inodes_count(), free_inodes);

    // First-fit hands the freed inode number out again.
    let reborn = root.create("fresh", FileType::File, file_perm()).unwrap();
    assert_eq!(reborn.ino(), ino);
}

#[test]
fn mkdir_and_rmdir() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();

    let dir = root.create("d", FileType::Dir, dir_perm()).unwrap();
    assert_eq!(dir.hard_links(), 2);
    assert_eq!(root.hard_links(), 3);
    assert_eq!(list_names(&dir), [".", ".."]);
    assert!(Arc::ptr_eq(&root, &dir.lookup("..").unwrap()));

    dir.create("inner", FileType::File, file_perm()).unwrap();
    assert_eq!(root.rmdir("d").unwrap_err(), Error::DirNotEmpty);
    assert_eq!(root.unlink("d").unwrap_err(), Error::IsDir);

    dir.unlink("inner").unwrap();
    root.rmdir("d").unwrap();
    assert_eq!(root.hard_links(), 2);
    assert_eq!(root.lookup("d").unwrap_err(), Error::NotFound);
    drop(dir);

    assert_eq!(root.rmdir("missing").unwrap_err(), Error::NotFound);
}

#[test]
fn removed_entry_slot_is_reused() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    root.create("aa", FileType::File, file_perm()).unwrap();
    root.create("bb", FileType::File, file_perm()).unwrap();
    assert_eq!(root.blocks_count(), 1);

    root.unlink("aa").unwrap();
    root.create("cc", FileType::File, file_perm()).unwrap();
    // The new entry takes the freed slot instead of growing the directory.
    assert_eq!(root.blocks_count(), 1);
    assert_eq!(list_names(&root), [".", "..", "cc", "bb"]);
}

#[test]
fn readdir_resumes_from_returned_offset() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    root.create("one", FileType::File, file_perm()).unwrap();
    root.create("two", FileType::File, file_perm()).unwrap();

    let mut first_batch = Vec::new();
    let mut visitor = |name: &str, _: u32, _: FileType, _: usize| {
        if first_batch.len() == 2 {
            return Err(Error::InvalidParam);
        }
        first_batch.push(name.to_string());
        Ok(())
    };
    let offset = root.readdir_at(0, &mut visitor).unwrap();
    assert_eq!(first_batch, [".", ".."]);

    let mut rest = Vec::new();
    let mut visitor = |name: &str, _: u32, _: FileType, _: usize| {
        rest.push(name.to_string());
        Ok(())
    };
    root.readdir_at(offset, &mut visitor).unwrap();
    assert_eq!(rest, ["one", "two"]);
}

#[test]
fn symlink_switches_between_fast_and_slow() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let link = root.create("ln", FileType::Symlink, file_perm()).unwrap();
    let free_at_start = fs.free_blocks_count();

    link.write_link("short/target").unwrap();
    assert_eq!(link.blocks_count(), 0);
    assert_eq!(link.file_size(), 12);
    assert_eq!(link.read_link().unwrap(), "short/target");
    assert_eq!(fs.free_blocks_count(), free_at_start);

    let long_target = "very/".repeat(30);
    link.write_link(&long_target).unwrap();
    assert_eq!(link.blocks_count(), 1);
    assert_eq!(link.read_link().unwrap(), long_target);
    assert_eq!(fs.free_blocks_count(), free_at_start - 1);

    link.write_link("back").unwrap();
    assert_eq!(link.blocks_count(), 0);
    assert_eq!(link.read_link().unwrap(), "back");
    assert_eq!(fs.free_blocks_count(), free_at_start);

    assert_eq!(root.read_link().unwrap_err(), Error::InvalidParam);
}

#[test]
fn failed_growth_rolls_back() {
    // One undersized group: everything must fit in 39 blocks.
    let fs = new_fs(40);
    let root = fs.root_inode().unwrap();
    let file = root.create("big", FileType::File, file_perm()).unwrap();
    let free_at_start = fs.free_blocks_count();
    assert_eq!(free_at_start, 26);

    // 27 data blocks plus one pointer block cannot fit.
    assert_eq!(file.resize(27 * BLOCK_SIZE).unwrap_err(), Error::NoSpace);
    assert_eq!(file.blocks_count(), 0);
    assert_eq!(fs.free_blocks_count(), free_at_start);

    // 25 data blocks plus the pointer block is exactly the free space.
    file.resize(25 * BLOCK_SIZE).unwrap();
    assert_eq!(fs.free_blocks_count(), 0);
    assert_eq!(file.write_at(25 * BLOCK_SIZE, b"x").unwrap_err(), Error::NoSpace);

    file.resize(0).unwrap();
    assert_eq!(fs.free_blocks_count(), free_at_start);
    assert_eq!(file.write_at(0, b"x").unwrap(), 1);
}

#[test]
fn inode_exhaustion_reports_no_space() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let free_inodes = fs.free_inodes_count();

    for idx in 0..free_inodes {
        root.create(&format!("f{}", idx), FileType::File, file_perm()).unwrap();
    }
    assert_eq!(fs.free_inodes_count(), 0);
    assert_eq!(
        root.create("straw", FileType::File, file_perm()).unwrap_err(),
        Error::NoSpace
    );

    root.unlink("f0").unwrap();
    root.create("straw", FileType::File, file_perm()).unwrap();
}

#[test]
fn metadata_survives_reopen() {
    let (disk, fs) = new_fs_on(1025);
    {
        let root = fs.root_inode().unwrap();
        let file = root.create("keep", FileType::File, file_perm()).unwrap();
        file.write_at(0, b"persistent").unwrap();
        file.set_file_perm(FilePerm::from_bits_truncate(0o600)).unwrap();
        file.set_uid(1000).unwrap();
        file.set_mtime(Duration::from_secs(1_700_000_000)).unwrap();

        let dir = root.create("sub", FileType::Dir, dir_perm()).unwrap();
        dir.create("nested", FileType::File, file_perm()).unwrap();
        fs.sync_all().unwrap();
    }
    drop(fs);

    let fs = Ext2::open(disk).unwrap();
    let root = fs.root_inode().unwrap();
    let file = root.lookup("keep").unwrap();
    assert_eq!(file.file_perm(), FilePerm::from_bits_truncate(0o600));
    assert_eq!(file.uid(), 1000);
    assert_eq!(file.mtime(), Duration::from_secs(1_700_000_000));
    let mut buf = vec![0u8; 10];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"persistent");

    let dir = root.lookup("sub").unwrap();
    assert_eq!(list_names(&dir), [".", "..", "nested"]);
}

#[test]
fn sized_create_rolls_back_when_blocks_run_out() {
    // One undersized group: everything must fit in 39 blocks.
    let fs = new_fs(40);
    let root = fs.root_inode().unwrap();
    let free_blocks = fs.free_blocks_count();
    let free_inodes = fs.free_inodes_count();

    // 27 data blocks plus one pointer block cannot fit; neither the entry
    // nor the inode nor any block may survive the failure.
    assert_eq!(
        root.create_with_size("big", FileType::File, file_perm(), 27 * BLOCK_SIZE)
            .unwrap_err(),
        Error::NoSpace
    );
    assert_eq!(root.lookup("big").unwrap_err(), Error::NotFound);
    assert_eq!(fs.free_blocks_count(), free_blocks);
    assert_eq!(fs.free_inodes_count(), free_inodes);

    // A fitting size allocates and zeroes everything inside the one call.
    let file = root
        .create_with_size("fits", FileType::File, file_perm(), 10 * BLOCK_SIZE)
        .unwrap();
    assert_eq!(file.file_size(), 10 * BLOCK_SIZE);
    assert_eq!(file.blocks_count(), 10);
    assert_eq!(fs.free_blocks_count(), free_blocks - 10);
    let mut buf = vec![0xffu8; BLOCK_SIZE];
    assert_eq!(file.read_at(9 * BLOCK_SIZE, &mut buf).unwrap(), BLOCK_SIZE);
    assert!(buf.iter().all(|&b| b == 0));

    assert_eq!(
        root.create_with_size("d", FileType::Dir, dir_perm(), BLOCK_SIZE)
            .unwrap_err(),
        Error::InvalidParam
    );
}

#[test]
fn double_free_keeps_counts_intact() {
    let fs = new_fs(1025);
    let free_blocks = fs.free_blocks_count();
    let bid = fs.alloc_blocks(0, 1).unwrap()[0];
    assert_eq!(fs.free_blocks_count(), free_blocks - 1);
    fs.free_block(bid);
    assert_eq!(fs.free_blocks_count(), free_blocks);
    fs.free_block(bid);
    assert_eq!(fs.free_blocks_count(), free_blocks);

    let free_inodes = fs.free_inodes_count();
    let inode = fs.create_inode(0, FileType::File, file_perm()).unwrap();
    assert_eq!(fs.free_inodes_count(), free_inodes - 1);
    fs.free_inode(inode.ino(), false).unwrap();
    assert_eq!(fs.free_inodes_count(), free_inodes);
    fs.free_inode(inode.ino(), false).unwrap();
    assert_eq!(fs.free_inodes_count(), free_inodes);
}

#[test]
fn parent_is_cached_through_create_and_lookup() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let dir = root.create("d", FileType::Dir, dir_perm()).unwrap();
    let file = dir.create("f", FileType::File, file_perm()).unwrap();

    assert_eq!(file.parent_ino(), Some(dir.ino()));
    assert!(Arc::ptr_eq(&file.parent().unwrap(), &dir));
    assert!(Arc::ptr_eq(&dir.parent().unwrap(), &root));
    // The root is its own parent, answered through `..`.
    assert_eq!(root.parent().unwrap().ino(), ROOT_INO);

    // A file fetched by number alone has no parent to report until a
    // directory resolves it.
    let ino = file.ino();
    drop(file);
    let by_number = fs.lookup_inode(ino).unwrap();
    assert!(by_number.parent_ino().is_none());
    assert_eq!(by_number.parent().unwrap_err(), Error::NotFound);

    let by_name = dir.lookup("f").unwrap();
    assert!(Arc::ptr_eq(&by_name, &by_number));
    assert_eq!(by_name.parent_ino(), Some(dir.ino()));
    assert!(Arc::ptr_eq(&by_name.parent().unwrap(), &dir));
}

#[test]
fn doubly_indirect_blocks_round_trip() {
    let fs = new_fs(400);
    let root = fs.root_inode().unwrap();
    let file = root.create("deep", FileType::File, file_perm()).unwrap();
    let free_at_start = fs.free_blocks_count();

    let blocks = 270;
    let mut payload = vec![0u8; blocks * BLOCK_SIZE];
    for (idx, chunk) in payload.chunks_mut(BLOCK_SIZE).enumerate() {
        chunk.fill(idx as u8);
    }
    file.write_at(0, &payload).unwrap();
    // 270 data blocks plus the indirect root, the doubly indirect root and
    // one doubly indirect leaf.
    assert_eq!(file.blocks_count(), 270);
    assert_eq!(fs.free_blocks_count(), free_at_start - 270 - 3);

    // A freshly loaded inode walks the pointer tree from disk.
    let file = {
        drop(file);
        root.lookup("deep").unwrap()
    };
    let mut back = vec![0u8; blocks * BLOCK_SIZE];
    assert_eq!(file.read_at(0, &mut back).unwrap(), back.len());
    assert_eq!(back, payload);

    file.resize(100 * BLOCK_SIZE).unwrap();
    assert_eq!(fs.free_blocks_count(), free_at_start - 100 - 1);
    let mut tail = vec![0u8; BLOCK_SIZE];
    file.read_at(99 * BLOCK_SIZE, &mut tail).unwrap();
    assert!(tail.iter().all(|&b| b == 99));

    file.resize(0).unwrap();
    assert_eq!(fs.free_blocks_count(), free_at_start);
}

#[test]
fn inodes_spill_into_the_next_group() {
    let fs = new_fs(1025);
    let root = fs.root_inode().unwrap();
    let inodes_per_group = fs.super_block().inodes_per_group();

    // More files than one group has inodes.
    for idx in 0..inodes_per_group + 10 {
        root.create(&format!("f{}", idx), FileType::File, file_perm()).unwrap();
    }
    let spilled = root.lookup(&format!("f{}", inodes_per_group + 5)).unwrap();
    assert!(spilled.ino() > inodes_per_group);
    let mut buf = [0u8; 4];
    spilled.write_at(0, b"far!").unwrap();
    spilled.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"far!");
}

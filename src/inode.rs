// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::block_ptr::{BlockListShape, BLOCK_PTR_CNT, MAX_BLOCK_CNT};
use crate::dir::{DirEntry, DirEntryReader, DirEntryWriter, DirentVisitor, MAX_FNAME_LEN};
use crate::fs::Ext2;
use crate::prelude::*;

/// Symlink targets up to this length live inside the inode's block pointer
/// array instead of in a data block.
pub const FAST_SYMLINK_MAX_LEN: usize = BLOCK_PTR_CNT * core::mem::size_of::<u32>();

/// The inode of the ext2 filesystem.
///
/// At most one live `Ext2Inode` exists per inode number; the per-group inode
/// cache hands out clones of the same `Arc`.
pub struct Ext2Inode {
    ino: u32,
    block_group_idx: usize,
    inner: RwLock<Inner>,
    fs: Weak<Ext2>,
}

struct Inner {
    desc: Dirty<InodeDesc>,
    /// Device block ids of the data blocks, in file order. Built on demand.
    block_list: Option<Vec<Ext2Bid>>,
    /// Name-to-ino map of a directory's entries. Built on demand.
    lookup_cache: Option<BTreeMap<String, u32>>,
    /// The directory this inode was last created in or resolved through.
    parent_ino: Option<u32>,
    is_freed: bool,
}

impl Ext2Inode {
    pub(crate) fn new(
        ino: u32,
        block_group_idx: usize,
        desc: Dirty<InodeDesc>,
        fs: Weak<Ext2>,
    ) -> Self {
        Self {
            ino,
            block_group_idx,
            inner: RwLock::new(Inner {
                desc,
                block_list: None,
                lookup_cache: None,
                parent_ino: None,
                is_freed: false,
            }),
            fs,
        }
    }

    /// Writes the `.` and `..` entries of a freshly created directory.
    pub(crate) fn init(&self, parent_ino: u32) -> Result<()> {
        if self.file_type() != FileType::Dir {
            return Ok(());
        }
        let fs = self.fs();
        let mut inner = self.inner.write();
        let mut content = Vec::new();
        let mut writer = DirEntryWriter::new(&mut content);
        writer.append_entry(DirEntry::self_entry(self.ino))?;
        writer.append_entry(DirEntry::parent_entry(parent_ino))?;
        drop(writer);
        inner.write_dir_content(&fs, self.block_group_idx, content)?;
        // One link for `.`, one for the parent's entry.
        inner.desc.hard_links = 2;
        Ok(())
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn fs(&self) -> Arc<Ext2> {
        self.fs.upgrade().unwrap()
    }

    pub fn file_type(&self) -> FileType {
        self.inner.read().desc.type_
    }

    pub fn file_perm(&self) -> FilePerm {
        self.inner.read().desc.perm
    }

    pub fn uid(&self) -> u32 {
        self.inner.read().desc.uid
    }

    pub fn gid(&self) -> u32 {
        self.inner.read().desc.gid
    }

    pub fn file_size(&self) -> usize {
        self.inner.read().desc.size
    }

    /// The number of data blocks the file occupies, metadata excluded.
    pub fn blocks_count(&self) -> u32 {
        self.inner.read().desc.blocks_count
    }

    pub fn file_flags(&self) -> FileFlags {
        self.inner.read().desc.flags
    }

    pub fn hard_links(&self) -> u16 {
        self.inner.read().desc.hard_links
    }

    /// Returns the cached inode number of the directory this inode was last
    /// created in or resolved through, if known.
    pub fn parent_ino(&self) -> Option<u32> {
        self.inner.read().parent_ino
    }

    /// Returns the parent directory of this inode.
    ///
    /// Directories can always answer through their `..` entry; other inodes
    /// rely on the identifier cached at creation or lookup time.
    pub fn parent(&self) -> Result<Arc<Self>> {
        if let Some(ino) = self.parent_ino() {
            return self.fs().lookup_inode(ino);
        }
        if self.file_type() == FileType::Dir {
            let parent = self.lookup("..")?;
            self.set_parent_ino(parent.ino);
            return Ok(parent);
        }
        Err(Error::NotFound)
    }

    fn set_parent_ino(&self, parent_ino: u32) {
        self.inner.write().parent_ino = Some(parent_ino);
    }

    pub fn atime(&self) -> Duration {
        self.inner.read().desc.atime
    }

    pub fn mtime(&self) -> Duration {
        self.inner.read().desc.mtime
    }

    pub fn ctime(&self) -> Duration {
        self.inner.read().desc.ctime
    }

    pub fn set_file_perm(&self, perm: FilePerm) -> Result<()> {
        self.inner.write().desc.perm = perm;
        self.flush()
    }

    pub fn set_uid(&self, uid: u32) -> Result<()> {
        self.inner.write().desc.uid = uid;
        self.flush()
    }

    pub fn set_gid(&self, gid: u32) -> Result<()> {
        self.inner.write().desc.gid = gid;
        self.flush()
    }

    pub fn set_atime(&self, time: Duration) -> Result<()> {
        self.inner.write().desc.atime = time;
        self.flush()
    }

    pub fn set_mtime(&self, time: Duration) -> Result<()> {
        self.inner.write().desc.mtime = time;
        self.flush()
    }

    pub fn set_ctime(&self, time: Duration) -> Result<()> {
        self.inner.write().desc.ctime = time;
        self.flush()
    }

    pub(crate) fn inc_hard_links(&self) {
        self.inner.write().desc.hard_links += 1;
    }

    pub(crate) fn dec_hard_links(&self) {
        let mut inner = self.inner.write();
        debug_assert!(inner.desc.hard_links > 0);
        inner.desc.hard_links -= 1;
    }

    /// Makes the inode reclaimable once every reference to it is gone.
    fn discard(&self) {
        self.inner.write().desc.hard_links = 0;
    }

    /// Grows or truncates a regular file to `new_size` bytes.
    pub fn resize(&self, new_size: usize) -> Result<()> {
        match self.file_type() {
            FileType::File => {}
            FileType::Dir => return Err(Error::IsDir),
            _ => return Err(Error::InvalidParam),
        }
        let fs = self.fs();
        self.inner
            .write()
            .resize(&fs, self.block_group_idx, new_size)?;
        self.flush()
    }

    /// Reads at most `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at end of file.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        match self.file_type() {
            FileType::File => {}
            FileType::Dir => return Err(Error::IsDir),
            _ => return Err(Error::InvalidParam),
        }
        let fs = self.fs();
        self.inner.write().read_at(&fs, offset, buf)
    }

    /// Writes `buf` at `offset`, growing the file if the write extends it.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        match self.file_type() {
            FileType::File => {}
            FileType::Dir => return Err(Error::IsDir),
            _ => return Err(Error::InvalidParam),
        }
        let fs = self.fs();
        let write_len = self
            .inner
            .write()
            .write_at(&fs, self.block_group_idx, offset, buf)?;
        self.flush()?;
        Ok(write_len)
    }

    /// Creates a new empty inode and links it into this directory under
    /// `name`.
    pub fn create(&self, name: &str, file_type: FileType, perm: FilePerm) -> Result<Arc<Self>> {
        self.create_with_size(name, file_type, perm, 0)
    }

    /// Creates a new inode of `size` bytes and links it into this directory.
    ///
    /// The initial blocks are allocated before the directory entry is
    /// written, so a failed allocation leaves neither an entry nor an inode
    /// behind. A nonzero `size` is only meaningful for regular files.
    pub fn create_with_size(
        &self,
        name: &str,
        file_type: FileType,
        perm: FilePerm,
        size: usize,
    ) -> Result<Arc<Self>> {
        if self.file_type() != FileType::Dir {
            return Err(Error::NotDir);
        }
        if size > 0 && file_type != FileType::File {
            return Err(Error::InvalidParam);
        }
        check_fname(name)?;
        let fs = self.fs();
        let child = {
            let mut inner = self.inner.write();
            match inner.lookup_ino(&fs, name) {
                Ok(_) => return Err(Error::Exist),
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }

            let child = fs.create_inode(self.block_group_idx, file_type, perm)?;
            child.set_parent_ino(self.ino);
            let result: Result<()> = (|| {
                child.init(self.ino)?;
                if size > 0 {
                    child.inner.write().resize(&fs, child.block_group_idx, size)?;
                }
                let mut content = inner.read_dir_content(&fs)?;
                DirEntryWriter::new(&mut content)
                    .append_entry(DirEntry::new(child.ino, name, file_type))?;
                inner.write_dir_content(&fs, self.block_group_idx, content)
            })();
            if let Err(err) = result {
                child.discard();
                return Err(err);
            }

            if file_type == FileType::Dir {
                // The child's `..` entry.
                inner.desc.hard_links += 1;
            }
            if let Some(cache) = inner.lookup_cache.as_mut() {
                cache.insert(name.to_string(), child.ino);
            }
            child
        };
        child.flush()?;
        self.flush()?;
        Ok(child)
    }

    /// Looks up the named entry of this directory.
    pub fn lookup(&self, name: &str) -> Result<Arc<Self>> {
        if self.file_type() != FileType::Dir {
            return Err(Error::NotDir);
        }
        if name.len() > MAX_FNAME_LEN {
            return Err(Error::NameTooLong);
        }
        let fs = self.fs();
        let ino = self.inner.write().lookup_ino(&fs, name)?;
        let inode = fs.lookup_inode(ino)?;
        if name != "." && name != ".." {
            inode.set_parent_ino(self.ino);
        }
        Ok(inode)
    }

    /// Links an existing non-directory inode into this directory.
    pub fn link(&self, inode: &Arc<Ext2Inode>, name: &str) -> Result<()> {
        if self.file_type() != FileType::Dir {
            return Err(Error::NotDir);
        }
        if inode.file_type() == FileType::Dir {
            return Err(Error::IsDir);
        }
        check_fname(name)?;
        let fs = self.fs();
        {
            let mut inner = self.inner.write();
            match inner.lookup_ino(&fs, name) {
                Ok(_) => return Err(Error::Exist),
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }
            let mut content = inner.read_dir_content(&fs)?;
            DirEntryWriter::new(&mut content)
                .append_entry(DirEntry::new(inode.ino, name, inode.file_type()))?;
            inner.write_dir_content(&fs, self.block_group_idx, content)?;
            if let Some(cache) = inner.lookup_cache.as_mut() {
                cache.insert(name.to_string(), inode.ino);
            }
        }
        inode.inc_hard_links();
        inode.set_parent_ino(self.ino);
        inode.sync_metadata()?;
        self.flush()
    }

    /// Removes the named non-directory entry.
    pub fn unlink(&self, name: &str) -> Result<()> {
        if self.file_type() != FileType::Dir {
            return Err(Error::NotDir);
        }
        if name == "." || name == ".." {
            return Err(Error::InvalidParam);
        }
        let fs = self.fs();
        let child = {
            let mut inner = self.inner.write();
            let ino = inner.lookup_ino(&fs, name)?;
            let child = fs.lookup_inode(ino)?;
            if child.file_type() == FileType::Dir {
                return Err(Error::IsDir);
            }
            let mut content = inner.read_dir_content(&fs)?;
            DirEntryWriter::new(&mut content).remove_entry(name)?;
            inner.write_dir_content(&fs, self.block_group_idx, content)?;
            if let Some(cache) = inner.lookup_cache.as_mut() {
                cache.remove(name);
            }
            child
        };
        child.dec_hard_links();
        child.sync_metadata()?;
        self.flush()
    }

    /// Removes the named empty directory.
    pub fn rmdir(&self, name: &str) -> Result<()> {
        if self.file_type() != FileType::Dir {
            return Err(Error::NotDir);
        }
        if name == "." || name == ".." {
            return Err(Error::InvalidParam);
        }
        let fs = self.fs();
        let child = {
            let mut inner = self.inner.write();
            let ino = inner.lookup_ino(&fs, name)?;
            let child = fs.lookup_inode(ino)?;
            if child.file_type() != FileType::Dir {
                return Err(Error::NotDir);
            }
            if child.entry_count()? > 2 {
                return Err(Error::DirNotEmpty);
            }
            let mut content = inner.read_dir_content(&fs)?;
            DirEntryWriter::new(&mut content).remove_entry(name)?;
            inner.write_dir_content(&fs, self.block_group_idx, content)?;
            if let Some(cache) = inner.lookup_cache.as_mut() {
                cache.remove(name);
            }
            // The child's `..` entry goes away with the child.
            inner.desc.hard_links -= 1;
            child
        };
        // One for `.`, one for the removed entry.
        child.dec_hard_links();
        child.dec_hard_links();
        child.sync_metadata()?;
        self.flush()
    }

    /// Visits the entries of this directory starting at `offset`.
    ///
    /// Returns the offset to resume from. `offset` must lie on a record
    /// boundary, e.g. a value a previous call handed to the visitor.
    pub fn readdir_at(&self, offset: usize, visitor: &mut dyn DirentVisitor) -> Result<usize> {
        if self.file_type() != FileType::Dir {
            return Err(Error::NotDir);
        }
        let fs = self.fs();
        let content = self.inner.write().read_dir_content(&fs)?;

        let mut reader = DirEntryReader::new(&content, offset);
        let mut cur_offset = offset;
        loop {
            let (entry_offset, entry) = match reader.read_entry() {
                Ok(pair) => pair,
                Err(Error::NotFound) => break,
                Err(err) if cur_offset == offset => return Err(err),
                Err(_) => break,
            };
            let next_offset = entry_offset + entry.record_len();
            if let Err(err) = visitor.visit(entry.name(), entry.ino(), entry.type_(), next_offset) {
                if cur_offset == offset {
                    return Err(err);
                }
                break;
            }
            cur_offset = next_offset;
        }
        Ok(cur_offset)
    }

    pub(crate) fn entry_count(&self) -> Result<usize> {
        let fs = self.fs();
        let mut inner = self.inner.write();
        let content = inner.read_dir_content(&fs)?;
        let mut reader = DirEntryReader::new(&content, 0);
        let mut count = 0;
        loop {
            match reader.read_entry() {
                Ok(_) => count += 1,
                Err(Error::NotFound) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(count)
    }

    /// Sets the target of this symlink.
    pub fn write_link(&self, target: &str) -> Result<()> {
        if self.file_type() != FileType::Symlink {
            return Err(Error::InvalidParam);
        }
        let fs = self.fs();
        {
            let mut inner = self.inner.write();
            // Drop whatever storage the previous target used.
            if inner.desc.size > FAST_SYMLINK_MAX_LEN {
                inner.resize(&fs, self.block_group_idx, 0)?;
            }
            inner.desc.data = [0; BLOCK_PTR_CNT];
            inner.desc.size = 0;

            if target.len() <= FAST_SYMLINK_MAX_LEN {
                inner.desc.data.as_mut_bytes()[..target.len()]
                    .copy_from_slice(target.as_bytes());
                inner.desc.size = target.len();
            } else {
                inner.block_list = Some(Vec::new());
                inner.resize(&fs, self.block_group_idx, target.len())?;
                inner.write_at(&fs, self.block_group_idx, 0, target.as_bytes())?;
            }
        }
        self.flush()
    }

    /// Reads the target of this symlink.
    pub fn read_link(&self) -> Result<String> {
        if self.file_type() != FileType::Symlink {
            return Err(Error::InvalidParam);
        }
        let fs = self.fs();
        let mut inner = self.inner.write();
        let size = inner.desc.size;
        if size <= FAST_SYMLINK_MAX_LEN {
            let target = String::from_utf8_lossy(&inner.desc.data.as_bytes()[..size]);
            Ok(target.to_string())
        } else {
            let mut buf = vec![0u8; size];
            inner.read_at(&fs, 0, &mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        }
    }

    /// Writes back the on-disk inode record if it changed.
    pub fn sync_metadata(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.desc.is_dirty() || inner.is_freed {
            return Ok(());
        }
        self.fs().sync_inode(self.ino, &RawInode::from(&*inner.desc))?;
        inner.desc.clear_dirty();
        Ok(())
    }

    /// Writes back everything about this inode.
    ///
    /// Data writes go straight to the device, so only metadata remains.
    pub fn sync_all(&self) -> Result<()> {
        self.sync_metadata()
    }

    fn flush(&self) -> Result<()> {
        self.sync_metadata()?;
        self.fs().sync_metadata()
    }

    fn reclaim(fs: &Ext2, ino: u32, group_idx: usize, inner: &mut Inner) -> Result<()> {
        let is_dir = inner.desc.type_ == FileType::Dir;
        inner.resize(fs, group_idx, 0)?;
        fs.sync_inode(ino, &RawInode::from(&*inner.desc))?;
        fs.free_inode(ino, is_dir)?;
        fs.sync_metadata()
    }
}

impl Debug for Ext2Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Ext2Inode")
            .field("ino", &self.ino)
            .field("desc", &*self.inner.read().desc)
            .finish()
    }
}

impl Drop for Ext2Inode {
    fn drop(&mut self) {
        let Some(fs) = self.fs.upgrade() else {
            return;
        };
        let ino = self.ino;
        let group_idx = self.block_group_idx;
        let inner = self.inner.get_mut();
        if inner.desc.hard_links == 0 && !inner.is_freed {
            if let Err(err) = Self::reclaim(&fs, ino, group_idx, inner) {
                warn!("failed to reclaim inode {}: {:?}", ino, err);
            }
            inner.is_freed = true;
        } else if inner.desc.is_dirty() {
            if let Err(err) = fs.sync_inode(ino, &RawInode::from(&*inner.desc)) {
                warn!("failed to sync inode {}: {:?}", ino, err);
            } else {
                inner.desc.clear_dirty();
            }
        }
    }
}

impl Inner {
    fn block_list(&mut self, fs: &Ext2) -> Result<&Vec<Ext2Bid>> {
        if self.block_list.is_none() {
            self.block_list = Some(fs.block_list_for_inode(&self.desc)?);
        }
        Ok(self.block_list.get_or_insert_with(Vec::new))
    }

    /// Resolves the device block id of the `idx`-th data block, through the
    /// cached block list if one is built and by walking the pointer tree
    /// otherwise.
    fn device_bid(&mut self, fs: &Ext2, idx: u32) -> Result<Ext2Bid> {
        debug_assert!(idx < self.desc.blocks_count);
        if let Some(block_list) = self.block_list.as_ref() {
            return block_list.get(idx as usize).copied().ok_or(Error::BadBlockList);
        }
        fs.resolve_bid(&self.desc, idx)
    }

    fn read_at(&mut self, fs: &Ext2, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let file_size = self.desc.size;
        if offset >= file_size || buf.is_empty() {
            return Ok(0);
        }
        let read_len = buf.len().min(file_size - offset);

        let mut block_buf = vec![0u8; BLOCK_SIZE];
        let mut cur = offset;
        while cur < offset + read_len {
            let begin = cur % BLOCK_SIZE;
            let len = (BLOCK_SIZE - begin).min(offset + read_len - cur);
            let bid = self.device_bid(fs, (cur / BLOCK_SIZE) as u32)?;
            let dst = &mut buf[cur - offset..cur - offset + len];
            if len == BLOCK_SIZE {
                fs.block_device().read_block(bid, dst)?;
            } else {
                fs.block_device().read_block(bid, &mut block_buf)?;
                dst.copy_from_slice(&block_buf[begin..begin + len]);
            }
            cur += len;
        }
        Ok(read_len)
    }

    fn write_at(
        &mut self,
        fs: &Ext2,
        group_idx: usize,
        offset: usize,
        buf: &[u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len();
        if end > self.desc.size {
            self.resize(fs, group_idx, end)?;
        }

        let mut block_buf = vec![0u8; BLOCK_SIZE];
        let mut cur = offset;
        while cur < end {
            let begin = cur % BLOCK_SIZE;
            let len = (BLOCK_SIZE - begin).min(end - cur);
            let bid = self.device_bid(fs, (cur / BLOCK_SIZE) as u32)?;
            let src = &buf[cur - offset..cur - offset + len];
            if len == BLOCK_SIZE {
                fs.block_device().write_block(bid, src)?;
            } else {
                fs.block_device().read_block(bid, &mut block_buf)?;
                block_buf[begin..begin + len].copy_from_slice(src);
                fs.block_device().write_block(bid, &block_buf)?;
            }
            cur += len;
        }
        Ok(buf.len())
    }

    fn resize(&mut self, fs: &Ext2, group_idx: usize, new_size: usize) -> Result<()> {
        let old_blocks = self.desc.blocks_count;
        if new_size.div_ceil(BLOCK_SIZE) > MAX_BLOCK_CNT as usize {
            return Err(Error::InvalidParam);
        }
        let new_blocks = new_size.div_ceil(BLOCK_SIZE) as u32;

        if new_blocks > old_blocks {
            // Growing also takes pointer blocks, so check the whole bill
            // before allocating anything.
            let meta_needed = BlockListShape::compute(new_blocks).meta_blocks
                - BlockListShape::compute(old_blocks).meta_blocks;
            if fs.free_blocks_count() < (new_blocks - old_blocks) + meta_needed {
                return Err(Error::NoSpace);
            }

            let mut block_list = self.block_list(fs)?.clone();
            let new_data = fs.alloc_blocks(group_idx, new_blocks - old_blocks)?;
            debug_assert!(new_data.iter().all(|&bid| fs.is_block_allocated(bid)));

            // Freshly allocated blocks read back as zeroes.
            let result: Result<()> = (|| {
                let zeroes = vec![0u8; BLOCK_SIZE];
                for &bid in &new_data {
                    fs.block_device().write_block(bid, &zeroes)?;
                }
                block_list.extend_from_slice(&new_data);
                fs.write_block_list_for_inode(group_idx, &mut self.desc, &block_list)
            })();
            if let Err(err) = result {
                for &bid in &new_data {
                    fs.free_block(bid);
                }
                return Err(err);
            }
            self.desc.blocks_count = new_blocks;
            self.block_list = Some(block_list);
        } else if new_blocks < old_blocks {
            let mut block_list = self.block_list(fs)?.clone();
            let truncated = block_list.split_off(new_blocks as usize);
            fs.write_block_list_for_inode(group_idx, &mut self.desc, &block_list)?;
            for bid in truncated {
                fs.free_block(bid);
            }
            self.desc.blocks_count = new_blocks;
            self.block_list = Some(block_list);
        }

        self.desc.size = new_size;
        Ok(())
    }

    fn read_dir_content(&mut self, fs: &Ext2) -> Result<Vec<u8>> {
        let mut content = vec![0u8; self.desc.size];
        self.read_at(fs, 0, &mut content)?;
        Ok(content)
    }

    fn write_dir_content(&mut self, fs: &Ext2, group_idx: usize, content: Vec<u8>) -> Result<()> {
        debug_assert!(content.len() % BLOCK_SIZE == 0);
        if content.len() != self.desc.size {
            self.resize(fs, group_idx, content.len())?;
        }
        self.write_at(fs, group_idx, 0, &content)?;
        Ok(())
    }

    fn lookup_ino(&mut self, fs: &Ext2, name: &str) -> Result<u32> {
        if self.lookup_cache.is_none() {
            let content = self.read_dir_content(fs)?;
            let mut cache = BTreeMap::new();
            let mut reader = DirEntryReader::new(&content, 0);
            loop {
                match reader.read_entry() {
                    Ok((_, entry)) => {
                        cache.insert(entry.name().to_string(), entry.ino());
                    }
                    Err(Error::NotFound) => break,
                    Err(err) => return Err(err),
                }
            }
            self.lookup_cache = Some(cache);
        }
        self.lookup_cache
            .as_ref()
            .and_then(|cache| cache.get(name).copied())
            .ok_or(Error::NotFound)
    }
}

fn check_fname(name: &str) -> Result<()> {
    if name.len() > MAX_FNAME_LEN {
        return Err(Error::NameTooLong);
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidParam);
    }
    Ok(())
}

/// The in-memory inode descriptor, the typed view of a `RawInode`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InodeDesc {
    pub type_: FileType,
    pub perm: FilePerm,
    pub uid: u32,
    pub gid: u32,
    /// File size in bytes.
    pub size: usize,
    pub atime: Duration,
    pub ctime: Duration,
    pub mtime: Duration,
    pub dtime: Duration,
    pub hard_links: u16,
    /// Number of data blocks, metadata excluded.
    pub blocks_count: u32,
    pub flags: FileFlags,
    /// Block pointers, or the target bytes of a fast symlink.
    pub data: [u32; BLOCK_PTR_CNT],
}

impl InodeDesc {
    pub fn new(type_: FileType, perm: FilePerm) -> Self {
        Self {
            type_,
            perm,
            uid: 0,
            gid: 0,
            size: 0,
            atime: Duration::ZERO,
            ctime: Duration::ZERO,
            mtime: Duration::ZERO,
            dtime: Duration::ZERO,
            hard_links: 1,
            blocks_count: 0,
            flags: FileFlags::empty(),
            data: [0; BLOCK_PTR_CNT],
        }
    }
}

impl TryFrom<RawInode> for InodeDesc {
    type Error = crate::error::Error;

    fn try_from(raw: RawInode) -> Result<Self> {
        let type_ = FileType::from_raw_mode(raw.mode)?;
        if raw.blocks > MAX_BLOCK_CNT {
            return Err(Error::BadBlockList);
        }
        let size = if type_ == FileType::File {
            ((raw.size_high as u64) << 32 | raw.size as u64) as usize
        } else {
            raw.size as usize
        };
        Ok(Self {
            type_,
            perm: FilePerm::from_bits_truncate(raw.mode),
            uid: (raw.osd2.uid_high as u32) << 16 | raw.uid as u32,
            gid: (raw.osd2.gid_high as u32) << 16 | raw.gid as u32,
            size,
            atime: Duration::from_secs(raw.atime as u64),
            ctime: Duration::from_secs(raw.ctime as u64),
            mtime: Duration::from_secs(raw.mtime as u64),
            dtime: Duration::from_secs(raw.dtime as u64),
            hard_links: raw.links_count,
            blocks_count: raw.blocks,
            flags: FileFlags::from_bits_truncate(raw.flags),
            data: raw.block,
        })
    }
}

const_assert!(core::mem::size_of::<RawInode>() == 128);

/// The original 128-byte on-disk inode record.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct RawInode {
    /// File type and permissions.
    pub mode: u16,
    /// Low 16 bits of the owner uid.
    pub uid: u16,
    /// Low 32 bits of the file size.
    pub size: u32,
    /// Access time, seconds since the epoch.
    pub atime: u32,
    /// Change time.
    pub ctime: u32,
    /// Modification time.
    pub mtime: u32,
    /// Deletion time.
    pub dtime: u32,
    /// Low 16 bits of the group gid.
    pub gid: u16,
    /// Number of hard links.
    pub links_count: u16,
    /// Number of data blocks.
    pub blocks: u32,
    /// File flags.
    pub flags: u32,
    reserved1: u32,
    /// Block pointers, or the target bytes of a fast symlink.
    pub block: [u32; BLOCK_PTR_CNT],
    /// File version, used by NFS.
    pub generation: u32,
    /// Extended attribute block.
    pub file_acl: u32,
    /// High 32 bits of the file size (regular files only).
    pub size_high: u32,
    /// Location of the file fragment (obsolete).
    pub frag_addr: u32,
    pub osd2: Osd2,
}

impl From<&InodeDesc> for RawInode {
    fn from(desc: &InodeDesc) -> Self {
        Self {
            mode: desc.type_ as u16 | desc.perm.bits(),
            uid: desc.uid as u16,
            size: desc.size as u32,
            atime: desc.atime.as_secs() as u32,
            ctime: desc.ctime.as_secs() as u32,
            mtime: desc.mtime.as_secs() as u32,
            dtime: desc.dtime.as_secs() as u32,
            gid: desc.gid as u16,
            links_count: desc.hard_links,
            blocks: desc.blocks_count,
            flags: desc.flags.bits(),
            reserved1: 0,
            block: desc.data,
            generation: 0,
            file_acl: 0,
            size_high: if desc.type_ == FileType::File {
                (desc.size as u64 >> 32) as u32
            } else {
                0
            },
            frag_addr: 0,
            osd2: Osd2 {
                frag: 0,
                frag_size: 0,
                pad: 0,
                uid_high: (desc.uid >> 16) as u16,
                gid_high: (desc.gid >> 16) as u16,
                reserved2: 0,
            },
        }
    }
}

/// OS-dependent tail of the on-disk inode (Linux flavour).
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct Osd2 {
    /// Fragment number (obsolete).
    pub frag: u8,
    /// Fragment size (obsolete).
    pub frag_size: u8,
    pad: u16,
    /// High 16 bits of the owner uid.
    pub uid_high: u16,
    /// High 16 bits of the group gid.
    pub gid_high: u16,
    reserved2: u32,
}

/// The type of an inode, as encoded in the high bits of the mode field.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// FIFO special file
    Fifo = 0o010000,
    /// Character device
    Char = 0o020000,
    /// Directory
    Dir = 0o040000,
    /// Block device
    Block = 0o060000,
    /// Regular file
    File = 0o100000,
    /// Symbolic link
    Symlink = 0o120000,
    /// Socket
    Socket = 0o140000,
}

impl FileType {
    const TYPE_MASK: u16 = 0o170000;

    pub(crate) fn from_raw_mode(mode: u16) -> Result<Self> {
        match mode & Self::TYPE_MASK {
            0o010000 => Ok(Self::Fifo),
            0o020000 => Ok(Self::Char),
            0o040000 => Ok(Self::Dir),
            0o060000 => Ok(Self::Block),
            0o100000 => Ok(Self::File),
            0o120000 => Ok(Self::Symlink),
            0o140000 => Ok(Self::Socket),
            _ => Err(Error::InvalidParam),
        }
    }

    /// The type indicator stored in directory entries.
    pub(crate) fn dirent_tag(&self) -> u8 {
        match self {
            Self::File => 1,
            Self::Dir => 2,
            Self::Char => 3,
            Self::Block => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
        }
    }

    pub(crate) fn from_dirent_tag(tag: u8) -> Self {
        match tag {
            2 => Self::Dir,
            3 => Self::Char,
            4 => Self::Block,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            _ => Self::File,
        }
    }
}

bitflags! {
    /// The permission bits of the mode field.
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
        /// execute by owner
        const S_IXUSR = 0o0100;
        /// read by group
        const S_IRGRP = 0o0040;
        /// write by group
        const S_IWGRP = 0o0020;
        /// execute by group
        const S_IXGRP = 0o0010;
        /// read by others
        const S_IROTH = 0o0004;
        /// write by others
        const S_IWOTH = 0o0002;
        /// execute by others
        const S_IXOTH = 0o0001;
    }
}

bitflags! {
    /// The behaviour flags of an inode.
    pub struct FileFlags: u32 {
        /// Secure deletion
        const SECURE_DEL = 1 << 0;
        /// Undelete
        const UNDELETE = 1 << 1;
        /// Compress file
        const COMPRESS = 1 << 2;
        /// Synchronous updates
        const SYNC_UPDATE = 1 << 3;
        /// Immutable file
        const IMMUTABLE = 1 << 4;
        /// Writes to file may only append
        const APPEND_ONLY = 1 << 5;
        /// Do not dump file
        const NO_DUMP = 1 << 6;
        /// Do not update atime
        const NO_ATIME = 1 << 7;
        /// Hash-indexed directory
        const INDEX_DIR = 1 << 12;
        /// AFS directory
        const IMAGIC = 1 << 13;
        /// Journal file data
        const JOURNAL_DATA = 1 << 14;
        /// File tail should not be merged
        const NO_TAIL = 1 << 15;
        /// Synchronous directory modifications
        const DIR_SYNC = 1 << 16;
        /// Top of directory hierarchies
        const TOP_DIR = 1 << 17;
        /// Reserved for ext2 library
        const RESERVED = 1 << 31;
    }
}

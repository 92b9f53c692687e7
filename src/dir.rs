// SPDX-License-Identifier: MPL-2.0

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::inode::FileType;
use crate::prelude::*;

/// The upper bound of the file name length.
pub const MAX_FNAME_LEN: usize = 255;

/// The header of a directory entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct DirEntryHeader {
    /// Inode number
    ino: u32,
    /// Directory entry length
    record_len: u16,
    /// Name Length
    name_len: u8,
    /// Type indicator
    inode_type: u8,
}

const DIR_ENTRY_HEADER_LEN: usize = core::mem::size_of::<DirEntryHeader>();
const_assert!(DIR_ENTRY_HEADER_LEN == 8);

/// A directory entry.
#[derive(Clone, Debug)]
pub(crate) struct DirEntry {
    header: DirEntryHeader,
    name: String,
}

impl DirEntry {
    /// Constructs a new entry with the minimal record length for its name.
    pub(crate) fn new(ino: u32, name: &str, file_type: FileType) -> Self {
        debug_assert!(name.len() <= MAX_FNAME_LEN);
        let header = DirEntryHeader {
            ino,
            record_len: (DIR_ENTRY_HEADER_LEN + name.len()).div_ceil(4) as u16 * 4,
            name_len: name.len() as u8,
            inode_type: file_type.dirent_tag(),
        };
        Self {
            header,
            name: name.to_string(),
        }
    }

    /// Constructs the `.` entry of a directory.
    pub(crate) fn self_entry(self_ino: u32) -> Self {
        Self::new(self_ino, ".", FileType::Dir)
    }

    /// Constructs the `..` entry of a directory.
    pub(crate) fn parent_entry(parent_ino: u32) -> Self {
        Self::new(parent_ino, "..", FileType::Dir)
    }

    pub fn ino(&self) -> u32 {
        self.header.ino
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_(&self) -> FileType {
        FileType::from_dirent_tag(self.header.inode_type)
    }

    /// Returns the stored record length, which may exceed `actual_len` when
    /// this entry absorbs the slack at the end of its predecessor or block.
    pub fn record_len(&self) -> usize {
        self.header.record_len as usize
    }

    /// Returns the length this entry really occupies, 4-byte aligned.
    pub fn actual_len(&self) -> usize {
        (DIR_ENTRY_HEADER_LEN + self.name.len()).div_ceil(4) * 4
    }

    fn set_record_len(&mut self, record_len: usize) {
        debug_assert!(record_len >= self.actual_len());
        self.header.record_len = record_len as u16;
    }
}

/// Reads `DirEntry`s from the byte content of a directory.
///
/// The content must consist of whole blocks, with the records of each block
/// tiling it exactly.
pub(crate) struct DirEntryReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DirEntryReader<'a> {
    pub(crate) fn new(buf: &'a [u8], from_offset: usize) -> Self {
        Self {
            buf,
            offset: from_offset,
        }
    }

    /// Reads the next live entry, skipping over holes (records with a zero
    /// inode number).
    ///
    /// Returns `NotFound` at the end of the content and `BadDirEntry` if a
    /// record is malformed.
    pub(crate) fn read_entry(&mut self) -> Result<(usize, DirEntry)> {
        loop {
            if self.offset >= self.buf.len() {
                return Err(Error::NotFound);
            }

            let offset = self.offset;
            let block_remain = BLOCK_SIZE - offset % BLOCK_SIZE;
            if block_remain < DIR_ENTRY_HEADER_LEN {
                return Err(Error::BadDirEntry);
            }
            let header =
                DirEntryHeader::read_from_bytes(&self.buf[offset..offset + DIR_ENTRY_HEADER_LEN])
                    .map_err(|_| Error::BadDirEntry)?;
            let record_len = header.record_len as usize;
            if record_len < DIR_ENTRY_HEADER_LEN + header.name_len as usize
                || record_len % 4 != 0
                || record_len > block_remain
            {
                return Err(Error::BadDirEntry);
            }
            self.offset += record_len;

            if header.ino == 0 {
                continue;
            }

            let name_bytes =
                &self.buf[offset + DIR_ENTRY_HEADER_LEN..offset + DIR_ENTRY_HEADER_LEN + header.name_len as usize];
            let name = String::from_utf8_lossy(name_bytes).to_string();
            return Ok((offset, DirEntry { header, name }));
        }
    }
}

impl Iterator for DirEntryReader<'_> {
    type Item = (usize, DirEntry);

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().ok()
    }
}

/// Writes `DirEntry`s into the byte content of a directory, growing it by
/// whole blocks when no existing record has room.
pub(crate) struct DirEntryWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> DirEntryWriter<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>) -> Self {
        debug_assert!(buf.len() % BLOCK_SIZE == 0);
        Self { buf }
    }

    /// Appends a new entry, reusing a hole or the slack of an existing record
    /// if one is large enough, and appending a fresh block otherwise.
    pub(crate) fn append_entry(&mut self, mut new_entry: DirEntry) -> Result<()> {
        let needed_len = new_entry.actual_len();

        let mut offset = 0;
        while offset < self.buf.len() {
            let (record_offset, record) = self.peek_record(offset)?;
            let record_len = record.record_len as usize;

            if record.ino == 0 && record_len >= needed_len {
                // An entire hole record is reused in place.
                new_entry.set_record_len(record_len);
                self.write_entry(record_offset, &new_entry);
                return Ok(());
            }

            let actual_len =
                (DIR_ENTRY_HEADER_LEN + record.name_len as usize).div_ceil(4) * 4;
            if record.ino != 0 && record_len - actual_len >= needed_len {
                // The record is split and the new entry takes its slack.
                let mut shrunk = record;
                shrunk.record_len = actual_len as u16;
                self.buf[record_offset..record_offset + DIR_ENTRY_HEADER_LEN]
                    .copy_from_slice(shrunk.as_bytes());
                new_entry.set_record_len(record_len - actual_len);
                self.write_entry(record_offset + actual_len, &new_entry);
                return Ok(());
            }

            offset = record_offset + record_len;
        }

        // No room anywhere, a fresh block holds the entry alone.
        let new_block_offset = self.buf.len();
        self.buf.resize(new_block_offset + BLOCK_SIZE, 0);
        new_entry.set_record_len(BLOCK_SIZE);
        self.write_entry(new_block_offset, &new_entry);
        Ok(())
    }

    /// Removes the named entry.
    ///
    /// Its record is merged into the preceding record of the same block, or
    /// turned into a hole if it leads the block.
    pub(crate) fn remove_entry(&mut self, name: &str) -> Result<DirEntry> {
        let mut prev: Option<(usize, DirEntryHeader)> = None;

        let mut offset = 0;
        while offset < self.buf.len() {
            let (record_offset, record) = self.peek_record(offset)?;
            let record_len = record.record_len as usize;

            let name_matches = record.ino != 0 && {
                let name_bytes = &self.buf[record_offset + DIR_ENTRY_HEADER_LEN
                    ..record_offset + DIR_ENTRY_HEADER_LEN + record.name_len as usize];
                name_bytes == name.as_bytes()
            };
            if name_matches {
                let removed = DirEntry {
                    header: record,
                    name: name.to_string(),
                };
                match prev {
                    Some((prev_offset, mut prev_header))
                        if prev_offset / BLOCK_SIZE == record_offset / BLOCK_SIZE =>
                    {
                        prev_header.record_len += record.record_len;
                        self.buf[prev_offset..prev_offset + DIR_ENTRY_HEADER_LEN]
                            .copy_from_slice(prev_header.as_bytes());
                    }
                    _ => {
                        // Leading record of its block becomes a hole.
                        let mut hole = record;
                        hole.ino = 0;
                        self.buf[record_offset..record_offset + DIR_ENTRY_HEADER_LEN]
                            .copy_from_slice(hole.as_bytes());
                    }
                }
                return Ok(removed);
            }

            prev = Some((record_offset, record));
            offset = record_offset + record_len;
        }
        Err(Error::NotFound)
    }

    fn peek_record(&self, offset: usize) -> Result<(usize, DirEntryHeader)> {
        let block_remain = BLOCK_SIZE - offset % BLOCK_SIZE;
        if block_remain < DIR_ENTRY_HEADER_LEN || offset + DIR_ENTRY_HEADER_LEN > self.buf.len() {
            return Err(Error::BadDirEntry);
        }
        let header =
            DirEntryHeader::read_from_bytes(&self.buf[offset..offset + DIR_ENTRY_HEADER_LEN])
                .map_err(|_| Error::BadDirEntry)?;
        let record_len = header.record_len as usize;
        if record_len < DIR_ENTRY_HEADER_LEN + header.name_len as usize
            || record_len % 4 != 0
            || record_len > block_remain
        {
            return Err(Error::BadDirEntry);
        }
        Ok((offset, header))
    }

    fn write_entry(&mut self, offset: usize, entry: &DirEntry) {
        self.buf[offset..offset + DIR_ENTRY_HEADER_LEN].copy_from_slice(entry.header.as_bytes());
        let name_offset = offset + DIR_ENTRY_HEADER_LEN;
        self.buf[name_offset..name_offset + entry.name.len()]
            .copy_from_slice(entry.name.as_bytes());
        // The alignment padding never leaks stale name bytes.
        let padding_end = offset + entry.actual_len();
        self.buf[name_offset + entry.name.len()..padding_end].fill(0);
    }
}

/// A visitor for the entries of a directory.
pub trait DirentVisitor {
    /// Visits one entry.
    ///
    /// `offset` is the offset of the record following this entry; resuming a
    /// scan there continues right after it.
    fn visit(&mut self, name: &str, ino: u32, type_: FileType, offset: usize) -> Result<()>;
}

impl<F> DirentVisitor for F
where
    F: FnMut(&str, u32, FileType, usize) -> Result<()>,
{
    fn visit(&mut self, name: &str, ino: u32, type_: FileType, offset: usize) -> Result<()> {
        self(name, ino, type_, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_dir_content(self_ino: u32, parent_ino: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = DirEntryWriter::new(&mut buf);
        writer.append_entry(DirEntry::self_entry(self_ino)).unwrap();
        writer.append_entry(DirEntry::parent_entry(parent_ino)).unwrap();
        buf
    }

    fn names_of(buf: &[u8]) -> Vec<String> {
        DirEntryReader::new(buf, 0)
            .map(|(_, entry)| entry.name().to_string())
            .collect()
    }

    #[test]
    fn records_tile_each_block_exactly() {
        let mut buf = new_dir_content(2, 2);
        let mut writer = DirEntryWriter::new(&mut buf);
        for name in ["alpha", "beta", "gamma"] {
            writer.append_entry(DirEntry::new(11, name, FileType::File)).unwrap();
        }

        assert_eq!(buf.len(), BLOCK_SIZE);
        let mut sum = 0;
        for (offset, entry) in DirEntryReader::new(&buf, 0) {
            assert_eq!(offset, sum);
            assert_eq!(offset % 4, 0);
            sum += entry.record_len();
        }
        assert_eq!(sum, BLOCK_SIZE);
    }

    #[test]
    fn last_record_absorbs_block_slack() {
        let buf = new_dir_content(2, 2);
        let entries: Vec<_> = DirEntryReader::new(&buf, 0).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.record_len(), 12);
        assert_eq!(entries[1].1.record_len(), BLOCK_SIZE - 12);
    }

    #[test]
    fn removal_merges_into_predecessor() {
        let mut buf = new_dir_content(2, 2);
        {
            let mut writer = DirEntryWriter::new(&mut buf);
            writer.append_entry(DirEntry::new(11, "a", FileType::File)).unwrap();
            writer.append_entry(DirEntry::new(12, "b", FileType::File)).unwrap();
            writer.remove_entry("a").unwrap();
        }
        assert_eq!(names_of(&buf), [".", "..", "b"]);

        // The merged slack is immediately reusable.
        let mut writer = DirEntryWriter::new(&mut buf);
        writer.append_entry(DirEntry::new(13, "c", FileType::File)).unwrap();
        assert_eq!(buf.len(), BLOCK_SIZE);
        assert_eq!(names_of(&buf), [".", "..", "c", "b"]);
    }

    #[test]
    fn leading_record_becomes_a_hole() {
        let mut buf = new_dir_content(2, 2);
        {
            let mut writer = DirEntryWriter::new(&mut buf);
            writer.remove_entry(".").unwrap();
        }
        assert_eq!(names_of(&buf), [".."]);

        let mut writer = DirEntryWriter::new(&mut buf);
        writer.append_entry(DirEntry::new(11, "re", FileType::File)).unwrap();
        assert_eq!(buf.len(), BLOCK_SIZE);
        assert_eq!(names_of(&buf), ["re", ".."]);
    }

    #[test]
    fn growth_appends_a_whole_block() {
        let mut buf = new_dir_content(2, 2);
        let mut writer = DirEntryWriter::new(&mut buf);
        // A name too long for the first block's slack.
        let long_name = "n".repeat(MAX_FNAME_LEN);
        for _ in 0..5 {
            writer.append_entry(DirEntry::new(11, &long_name, FileType::File)).unwrap();
        }
        assert_eq!(buf.len() % BLOCK_SIZE, 0);
        assert!(buf.len() > BLOCK_SIZE);
        assert_eq!(DirEntryReader::new(&buf, 0).count(), 7);
    }

    #[test]
    fn missing_name_is_not_found() {
        let mut buf = new_dir_content(2, 2);
        let mut writer = DirEntryWriter::new(&mut buf);
        assert_eq!(writer.remove_entry("ghost").unwrap_err(), Error::NotFound);
    }
}

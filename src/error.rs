// SPDX-License-Identifier: MPL-2.0

pub type Result<T> = core::result::Result<T, self::Error>;

/// Errors
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    BadMagic,
    BadBitMap,
    BadDirEntry,
    BadBlockList,
    NotSupported,
    IsDir,
    NotDir,
    NotFound,
    Exist,
    InvalidParam,
    NoSpace,
    DirNotEmpty,
    NameTooLong,
    IoError,
}

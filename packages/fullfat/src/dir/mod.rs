//! Directory records: 32-byte short entries and the long-name groups that
//! precede them.

mod create;
mod cursor;
mod find;
pub mod names;

#[cfg(test)]
mod tests;

use heapless::String;

use crate::bytes::{le_u16, le_u32, put_le_u16, put_le_u32};
use crate::config::NAME_BYTES_MAX;
use crate::time::DateTime;

pub use create::NewEntry;
pub(crate) use cursor::DirCursor;
pub use find::DirIter;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LFN: u8 = 0x0F;

pub(crate) const DIRENT_SIZE: usize = 32;
pub(crate) const ENTRIES_PER_SECTOR: u32 = 16;
pub(crate) const END_OF_DIR: u8 = 0x00;
pub(crate) const DELETED: u8 = 0xE5;
pub(crate) const E5_ESCAPE: u8 = 0x05;
pub(crate) const LFN_LAST: u8 = 0x40;
pub(crate) const CASE_LOWER_BASE: u8 = 0x08;
pub(crate) const CASE_LOWER_EXT: u8 = 0x10;

const OFF_ATTR: usize = 11;
const OFF_CASE: usize = 12;
const OFF_CREATE_TIME: usize = 14;
const OFF_CREATE_DATE: usize = 16;
const OFF_ACCESS_DATE: usize = 18;
const OFF_CLUSTER_HI: usize = 20;
const OFF_MODIFY_TIME: usize = 22;
const OFF_MODIFY_DATE: usize = 24;
const OFF_CLUSTER_LO: usize = 26;
const OFF_SIZE: usize = 28;

pub(crate) type RawEntry = [u8; DIRENT_SIZE];

pub(crate) fn raw_attr(raw: &RawEntry) -> u8 {
    raw[OFF_ATTR]
}

pub(crate) fn raw_cluster(raw: &RawEntry) -> u32 {
    ((le_u16(raw, OFF_CLUSTER_HI) as u32) << 16) | le_u16(raw, OFF_CLUSTER_LO) as u32
}

pub(crate) fn set_raw_cluster(raw: &mut RawEntry, cluster: u32) {
    put_le_u16(raw, OFF_CLUSTER_HI, (cluster >> 16) as u16);
    put_le_u16(raw, OFF_CLUSTER_LO, cluster as u16);
}

pub(crate) fn raw_size(raw: &RawEntry) -> u32 {
    le_u32(raw, OFF_SIZE)
}

pub(crate) fn set_raw_size(raw: &mut RawEntry, size: u32) {
    put_le_u32(raw, OFF_SIZE, size);
}

pub(crate) fn set_raw_created(raw: &mut RawEntry, at: DateTime) {
    put_le_u16(raw, OFF_CREATE_TIME, at.pack_time());
    put_le_u16(raw, OFF_CREATE_DATE, at.pack_date());
}

pub(crate) fn set_raw_modified(raw: &mut RawEntry, at: DateTime) {
    put_le_u16(raw, OFF_MODIFY_TIME, at.pack_time());
    put_le_u16(raw, OFF_MODIFY_DATE, at.pack_date());
}

pub(crate) fn set_raw_accessed(raw: &mut RawEntry, at: DateTime) {
    put_le_u16(raw, OFF_ACCESS_DATE, at.pack_date());
}

/// One file or directory as seen by a directory scan.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub(crate) name: String<NAME_BYTES_MAX>,
    pub(crate) short_name: [u8; 11],
    pub(crate) attr: u8,
    pub(crate) cluster: u32,
    pub(crate) size: u32,
    pub(crate) created: DateTime,
    pub(crate) modified: DateTime,
    pub(crate) accessed: DateTime,
    pub(crate) dir_cluster: u32,
    pub(crate) index: u32,
    pub(crate) lfn_count: u8,
}

impl DirEntry {
    pub(crate) fn from_raw(raw: &RawEntry, name: String<NAME_BYTES_MAX>, dir_cluster: u32, index: u32, lfn_count: u8) -> Self {
        let mut short_name = [0u8; 11];
        short_name.copy_from_slice(&raw[..11]);
        Self {
            name,
            short_name,
            attr: raw[OFF_ATTR],
            cluster: raw_cluster(raw),
            size: raw_size(raw),
            created: DateTime::unpack(le_u16(raw, OFF_CREATE_DATE), le_u16(raw, OFF_CREATE_TIME)),
            modified: DateTime::unpack(le_u16(raw, OFF_MODIFY_DATE), le_u16(raw, OFF_MODIFY_TIME)),
            accessed: DateTime::unpack(le_u16(raw, OFF_ACCESS_DATE), 0),
            dir_cluster,
            index,
            lfn_count,
        }
    }

    /// Long name when a valid group is present, else the short name in lowercase.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &[u8; 11] {
        &self.short_name
    }

    pub fn attributes(&self) -> u8 {
        self.attr
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attr & ATTR_READ_ONLY != 0
    }

    pub fn first_cluster(&self) -> u32 {
        self.cluster
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn created(&self) -> DateTime {
        self.created
    }

    pub fn modified(&self) -> DateTime {
        self.modified
    }

    pub fn accessed(&self) -> DateTime {
        self.accessed
    }

    pub fn has_long_name(&self) -> bool {
        self.lfn_count > 0
    }

    /// Slot index of the short entry within its directory.
    pub fn index(&self) -> u32 {
        self.index
    }
}

pub(crate) fn encode_short_entry(
    short_name: &[u8; 11],
    case: u8,
    attr: u8,
    cluster: u32,
    size: u32,
    created: DateTime,
    modified: DateTime,
) -> RawEntry {
    let mut raw = [0u8; DIRENT_SIZE];
    raw[..11].copy_from_slice(short_name);
    raw[OFF_ATTR] = attr;
    raw[OFF_CASE] = case;
    set_raw_created(&mut raw, created);
    set_raw_accessed(&mut raw, modified);
    set_raw_modified(&mut raw, modified);
    set_raw_cluster(&mut raw, cluster);
    set_raw_size(&mut raw, size);
    raw
}

/// Splits at the last `/` or `\` into parent path and final name.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind(['/', '\\']) {
        Some(at) => (&path[..at], &path[at + 1..]),
        None => ("", path),
    }
}

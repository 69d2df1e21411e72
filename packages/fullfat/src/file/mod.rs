//! Open file handles: mode checks, position tracking, close-time trimming.

mod io;
mod ops;
pub(crate) mod registry;


use core::ops::BitOr;
use core::str::FromStr;

use crate::dir::{
    set_raw_accessed, set_raw_cluster, set_raw_modified, set_raw_size, split_path, DirCursor, NewEntry, ATTR_ARCHIVE,
    ATTR_DIRECTORY, ATTR_READ_ONLY,
};
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::volume::Volume;

/// Access mode fixed when a file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    pub const APPEND: Self = Self(0x04);
    pub const CREATE: Self = Self(0x08);
    pub const TRUNCATE: Self = Self(0x10);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & (Self::WRITE.0 | Self::APPEND.0) != 0
    }

    /// `r`, `w`, `a` with optional `+`; `b` is accepted and ignored.
    pub fn parse(mode: &str) -> Result<Self, FatError> {
        let invalid = FatErrorKind::InvalidMode.at(FatOp::Open);
        let mut bits = Self(0);
        let mut base = false;
        for c in mode.chars() {
            bits = match c {
                'r' if !base => bits | Self::READ,
                'w' if !base => bits | Self::WRITE | Self::CREATE | Self::TRUNCATE,
                'a' if !base => bits | Self::WRITE | Self::APPEND | Self::CREATE,
                '+' if base => bits | Self::READ | Self::WRITE,
                'b' => bits,
                _ => return Err(invalid),
            };
            if matches!(c, 'r' | 'w' | 'a') {
                base = true;
            }
        }
        if base {
            Ok(bits)
        } else {
            Err(invalid)
        }
    }
}

impl BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl FromStr for OpenMode {
    type Err = FatError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        Self::parse(mode)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i64),
    End(i64),
}

/// An open file. Dropping it without [`File::close`] releases the handle
/// but skips the directory-entry update.
pub struct File<'v, D: BlockDevice> {
    vol: &'v Volume<D>,
    id: u32,
    mode: OpenMode,
    size: u32,
    pointer: u32,
    object_cluster: u32,
    dir_cluster: u32,
    dir_entry: u32,
    chain_len: u32,
    end_cluster: u32,
    current_cluster: u32,
    addr_current_cluster: u32,
    written: bool,
    closed: bool,
}

impl<'v, D: BlockDevice> File<'v, D> {
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn first_cluster(&self) -> u32 {
        self.object_cluster
    }

    /// Fails once the handle was released or its media invalidated.
    pub fn check_valid(&self) -> Result<(), FatError> {
        self.vol.files.check(self.id, FatOp::CheckValid)
    }

    /// Trims clusters the write path allocated ahead, rewrites the directory
    /// entry if anything changed, flushes and releases the handle.
    pub async fn close(mut self) -> Result<(), FatError> {
        let result = self.finish().await;
        self.vol.files.release(self.id);
        self.closed = true;
        result
    }

    async fn finish(&mut self) -> Result<(), FatError> {
        self.vol.files.check(self.id, FatOp::Close)?;
        if !self.mode.is_writable() {
            return Ok(());
        }
        if self.object_cluster != 0 {
            let needed = self.size.div_ceil(self.vol.part.cluster_bytes());
            if needed == 0 {
                self.vol.unlink_chain(self.object_cluster, false).await?;
                self.object_cluster = 0;
                self.chain_len = 0;
                self.written = true;
            } else if self.chain_len > needed {
                let last = self.vol.traverse(self.object_cluster, needed - 1).await?;
                self.vol.unlink_chain(last, true).await?;
                self.chain_len = needed;
                self.end_cluster = last;
            }
        }
        if self.written {
            let _dir = self.vol.dir_lock.lock().await;
            let mut cursor = DirCursor::new(self.vol, self.dir_cluster).await?;
            let mut raw = cursor.fetch(self.vol, self.dir_entry).await?;
            let now = self.vol.now();
            set_raw_size(&mut raw, self.size);
            set_raw_cluster(&mut raw, self.object_cluster);
            set_raw_modified(&mut raw, now);
            set_raw_accessed(&mut raw, now);
            cursor.push(self.vol, self.dir_entry, &raw).await?;
        }
        self.vol.flush().await?;
        log::debug!(
            "fullfat: close entry={}:{} size={} clusters={}",
            self.dir_cluster,
            self.dir_entry,
            self.size,
            self.chain_len
        );
        Ok(())
    }
}

impl<D: BlockDevice> Drop for File<'_, D> {
    fn drop(&mut self) {
        if !self.closed {
            self.vol.files.release(self.id);
            if self.written {
                log::warn!("fullfat: dropped_unclosed entry={}:{}", self.dir_cluster, self.dir_entry);
            }
        }
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Opens or creates the file at `path`. A new file gets one cluster up front.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<File<'_, D>, FatError> {
        let op = FatOp::Open;
        let (parent, name) = split_path(path);
        if name.is_empty() {
            return Err(FatErrorKind::InvalidPath.at(op));
        }
        let dir = self.find_dir(parent).await?;
        let writable = mode.is_writable();

        let (entry, created) = match self.find_entry_in_dir(dir, name, 0).await? {
            Some(entry) => {
                if entry.attr & ATTR_DIRECTORY != 0 {
                    return Err(FatErrorKind::ObjectIsADir.at(op));
                }
                if writable && entry.attr & ATTR_READ_ONLY != 0 {
                    return Err(FatErrorKind::FileIsReadOnly.at(op));
                }
                (entry, false)
            }
            None if mode.contains(OpenMode::CREATE) => {
                let cluster = self.create_cluster_chain().await?;
                let new = NewEntry {
                    name,
                    attr: ATTR_ARCHIVE,
                    cluster,
                    size: 0,
                    at: self.now(),
                };
                match self.create_dirent(dir, &new).await {
                    Ok(entry) => (entry, true),
                    Err(err) => {
                        self.unlink_chain(cluster, false).await?;
                        return Err(err);
                    }
                }
            }
            None => return Err(FatErrorKind::FileNotFound.at(op)),
        };

        let id = self.files.register(entry.dir_cluster, entry.index, writable)?;
        let object_cluster = entry.cluster;
        let (chain_len, end_cluster) = if self.part.is_valid_cluster(object_cluster) {
            match self.chain_length(object_cluster).await {
                Ok(chain) => chain,
                Err(err) => {
                    self.files.release(id);
                    return Err(err);
                }
            }
        } else {
            (0, 0)
        };
        let truncate = writable && mode.contains(OpenMode::TRUNCATE) && entry.size > 0;
        log::debug!(
            "fullfat: open path={} mode={:#04x} created={} size={}",
            path,
            mode.bits(),
            created,
            entry.size
        );
        Ok(File {
            vol: self,
            id,
            mode,
            size: if truncate { 0 } else { entry.size },
            pointer: 0,
            object_cluster,
            dir_cluster: entry.dir_cluster,
            dir_entry: entry.index,
            chain_len,
            end_cluster,
            current_cluster: 0,
            addr_current_cluster: object_cluster,
            written: truncate,
            closed: false,
        })
    }
}

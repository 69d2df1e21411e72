#![cfg_attr(not(test), no_std)]

pub mod cache;
pub mod config;
pub mod device;
pub mod dir;
pub mod error;
pub mod fat;
pub mod file;
pub mod format;
pub mod partition;
pub mod time;
pub mod volume;

mod bytes;
#[cfg(test)]
mod test_support;

pub use cache::{BufferCache, LeaseMode, SectorLease};
pub use config::VolumeConfig;
pub use device::{BlockDevice, MemoryDisk, MemoryDiskError};
pub use dir::{DirEntry, DirIter};
pub use error::{FatError, FatErrorKind, FatOp};
pub use file::{File, OpenMode, SeekFrom};
pub use format::{format_partition, FormatOptions};
pub use partition::{FatType, Partition};
pub use time::{DateTime, TimeFields};
pub use volume::Volume;

pub const SECTOR_SIZE: usize = 512;

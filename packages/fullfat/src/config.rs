use crate::time::DateTime;

pub const CACHE_SECTORS_MAX: usize = 16;
pub const CACHE_SECTORS_DEFAULT: usize = 8;
pub const MAX_OPEN_FILES: usize = 8;
/// Longest long name in UTF-16 units.
pub const NAME_UNITS_MAX: usize = 255;
/// UTF-8 room for `NAME_UNITS_MAX` units; no unit takes more than three bytes.
pub const NAME_BYTES_MAX: usize = NAME_UNITS_MAX * 3;
pub const DIR_ENTRIES_MAX: u32 = 0xFFFF;
pub const SHORT_NAME_SUFFIX_MAX: u32 = 999_999;

fn fat_epoch() -> DateTime {
    DateTime::FAT_EPOCH
}

#[derive(Clone, Copy)]
pub struct VolumeConfig {
    /// Sector buffers kept by the cache, clamped to `1..=CACHE_SECTORS_MAX`.
    pub cache_sectors: usize,
    /// Take the FAT32 FSInfo free count and next-free hint at face value when
    /// both signatures are intact.
    pub trust_fsinfo: bool,
    /// Source of timestamps written into directory entries.
    pub clock: fn() -> DateTime,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cache_sectors: CACHE_SECTORS_DEFAULT,
            trust_fsinfo: true,
            clock: fat_epoch,
        }
    }
}

impl VolumeConfig {
    pub(crate) fn cache_slots(&self) -> usize {
        self.cache_sectors.clamp(1, CACHE_SECTORS_MAX)
    }
}

/// Calendar time as stored in directory entries.
///
/// FAT keeps seconds at two-second resolution, so packing drops the low bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    pub const FAT_EPOCH: Self = Self {
        year: 1980,
        month: 1,
        day: 1,
        hour: 0,
        minute: 0,
        second: 0,
    };

    pub fn pack_time(&self) -> u16 {
        ((self.hour as u16) << 11) | ((self.minute as u16) << 5) | (self.second as u16 / 2)
    }

    pub fn pack_date(&self) -> u16 {
        let year = self.year.saturating_sub(1980).min(127);
        (year << 9) | ((self.month as u16) << 5) | self.day as u16
    }

    pub fn unpack(date: u16, time: u16) -> Self {
        Self {
            year: 1980 + (date >> 9),
            month: ((date >> 5) & 0x0F) as u8,
            day: (date & 0x1F) as u8,
            hour: (time >> 11) as u8,
            minute: ((time >> 5) & 0x3F) as u8,
            second: ((time & 0x1F) * 2) as u8,
        }
    }
}

/// Selects which timestamps `Volume::set_time` rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeFields(u8);

impl TimeFields {
    pub const CREATED: Self = Self(0x01);
    pub const MODIFIED: Self = Self(0x02);
    pub const ACCESSED: Self = Self(0x04);
    pub const ALL: Self = Self(0x07);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for TimeFields {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

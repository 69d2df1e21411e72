use heapless::String;

use super::names::{short_name_checksum, short_name_text, wildcard_match, LFN_ENTRIES_MAX, LFN_UNITS_PER_ENTRY, LFN_UNIT_OFFSETS};
use super::{raw_attr, split_path, DirCursor, DirEntry, RawEntry, ATTR_DIRECTORY, ATTR_LFN, ATTR_VOLUME_ID, DELETED, END_OF_DIR, LFN_LAST};
use crate::config::{DIR_ENTRIES_MAX, NAME_BYTES_MAX};
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::volume::Volume;

/// Accumulates a long-name group until its short entry arrives.
struct LfnCollector {
    units: [u16; LFN_ENTRIES_MAX * LFN_UNITS_PER_ENTRY],
    count: u8,
    expected: u8,
    checksum: u8,
    active: bool,
}

impl LfnCollector {
    fn new() -> Self {
        Self {
            units: [0xFFFF; LFN_ENTRIES_MAX * LFN_UNITS_PER_ENTRY],
            count: 0,
            expected: 0,
            checksum: 0,
            active: false,
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.count = 0;
        self.expected = 0;
    }

    fn push(&mut self, raw: &RawEntry) {
        let ordinal = raw[0] & 0x1F;
        if ordinal == 0 || ordinal as usize > LFN_ENTRIES_MAX {
            self.reset();
            return;
        }
        if raw[0] & LFN_LAST != 0 {
            self.active = true;
            self.count = ordinal;
            self.checksum = raw[13];
        } else if !self.active || ordinal != self.expected || raw[13] != self.checksum {
            self.reset();
            return;
        }
        let start = (ordinal as usize - 1) * LFN_UNITS_PER_ENTRY;
        for (k, offset) in LFN_UNIT_OFFSETS.iter().enumerate() {
            self.units[start + k] = u16::from_le_bytes([raw[*offset], raw[*offset + 1]]);
        }
        self.expected = ordinal - 1;
    }

    /// Decoded long name if the group is complete and belongs to `short`.
    fn take(&self, short: &[u8; 11]) -> Option<String<NAME_BYTES_MAX>> {
        if !self.active || self.expected != 0 || self.checksum != short_name_checksum(short) {
            return None;
        }
        let total = self.count as usize * LFN_UNITS_PER_ENTRY;
        let units = self.units[..total].iter().copied().take_while(|unit| *unit != 0x0000 && *unit != 0xFFFF);
        let mut name = String::new();
        for c in char::decode_utf16(units) {
            name.push(c.unwrap_or(char::REPLACEMENT_CHARACTER)).ok()?;
        }
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

/// Walks entries from `start`, decoding long names, and returns the first
/// one `accept` takes. Deleted slots and volume labels are skipped; the
/// end-of-directory marker stops the scan.
pub(crate) async fn scan_dir<D, F>(vol: &Volume<D>, cursor: &mut DirCursor, start: u32, mut accept: F) -> Result<Option<DirEntry>, FatError>
where
    D: BlockDevice,
    F: FnMut(&DirEntry) -> bool,
{
    let mut lfn = LfnCollector::new();
    for index in start..DIR_ENTRIES_MAX {
        let raw = match cursor.fetch(vol, index).await {
            Ok(raw) => raw,
            Err(err) if err.is(FatErrorKind::EndOfDir) => return Ok(None),
            Err(err) => return Err(err),
        };
        match raw[0] {
            END_OF_DIR => return Ok(None),
            DELETED => {
                lfn.reset();
                continue;
            }
            _ => {}
        }
        let attr = raw_attr(&raw);
        if attr & ATTR_LFN == ATTR_LFN {
            lfn.push(&raw);
            continue;
        }
        if attr & ATTR_VOLUME_ID != 0 {
            lfn.reset();
            continue;
        }
        let mut short = [0u8; 11];
        short.copy_from_slice(&raw[..11]);
        let (name, lfn_count) = match lfn.take(&short) {
            Some(name) => (name, lfn.count),
            None => {
                let mut name = String::new();
                short_name_text(&short, &mut name);
                (name, 0)
            }
        };
        lfn.reset();
        let entry = DirEntry::from_raw(&raw, name, cursor.dir_cluster(), index, lfn_count);
        if accept(&entry) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn name_matches(entry: &DirEntry, name: &str) -> bool {
    if entry.name.eq_ignore_ascii_case(name) {
        return true;
    }
    if entry.lfn_count == 0 {
        return false;
    }
    let mut short: String<16> = String::new();
    short_name_text(&entry.short_name, &mut short);
    short.eq_ignore_ascii_case(name)
}

/// Directory listing, optionally filtered by a wildcard pattern.
pub struct DirIter<'v, D: BlockDevice> {
    vol: &'v Volume<D>,
    cursor: DirCursor,
    next_index: u32,
    pattern: String<NAME_BYTES_MAX>,
    invert: bool,
    done: bool,
}

impl<D: BlockDevice> DirIter<'_, D> {
    pub fn dir_cluster(&self) -> u32 {
        self.cursor.dir_cluster()
    }

    pub async fn next_entry(&mut self) -> Result<Option<DirEntry>, FatError> {
        if self.done {
            return Ok(None);
        }
        let Self {
            vol,
            cursor,
            next_index,
            pattern,
            invert,
            ..
        } = self;
        let found = scan_dir(*vol, cursor, *next_index, |entry| {
            pattern.is_empty() || wildcard_match(pattern.as_str(), entry.name()) != *invert
        })
        .await?;
        match &found {
            Some(entry) => self.next_index = entry.index + 1,
            None => self.done = true,
        }
        Ok(found)
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Looks up `name` in one directory, matching long or short names without
    /// regard to case. Only entries carrying every bit of `attr_mask` qualify.
    pub async fn find_entry_in_dir(&self, dir_cluster: u32, name: &str, attr_mask: u8) -> Result<Option<DirEntry>, FatError> {
        let mut cursor = DirCursor::new(self, dir_cluster).await?;
        scan_dir(self, &mut cursor, 0, |entry| {
            entry.attr & attr_mask == attr_mask && name_matches(entry, name)
        })
        .await
    }

    /// First cluster of the directory at `path`. The root resolves to its own
    /// cluster (the fixed-root sentinel on FAT12/16).
    pub async fn find_dir(&self, path: &str) -> Result<u32, FatError> {
        let mut cluster = self.part.root_dir_cluster;
        for segment in path.split(['/', '\\']).filter(|s| !s.is_empty() && *s != ".") {
            let entry = self
                .find_entry_in_dir(cluster, segment, ATTR_DIRECTORY)
                .await?
                .ok_or(FatErrorKind::InvalidPath.at(FatOp::FindDir))?;
            cluster = self.part.resolve_dir_cluster(entry.cluster);
        }
        Ok(cluster)
    }

    /// Resolves `path` to its entry. The root has no entry of its own.
    pub async fn find_entry(&self, path: &str) -> Result<Option<DirEntry>, FatError> {
        let (parent, name) = split_path(path.trim_end_matches(['/', '\\']));
        if name.is_empty() {
            return Ok(None);
        }
        let dir = self.find_dir(parent).await?;
        self.find_entry_in_dir(dir, name, 0).await
    }

    /// Lists the directory named by everything up to the last separator.
    /// The final component is a wildcard filter (empty lists everything);
    /// a trailing `:` inverts it.
    pub async fn read_dir(&self, path: &str) -> Result<DirIter<'_, D>, FatError> {
        let (parent, filter) = split_path(path);
        let dir = self.find_dir(parent).await?;
        let (filter, invert) = match filter.strip_suffix(':') {
            Some(filter) => (filter, true),
            None => (filter, false),
        };
        let mut pattern = String::new();
        pattern
            .push_str(filter)
            .map_err(|_| FatErrorKind::NameTooLong.at(FatOp::FindNext))?;
        Ok(DirIter {
            vol: self,
            cursor: DirCursor::new(self, dir).await?,
            next_index: 0,
            pattern,
            invert,
            done: false,
        })
    }
}

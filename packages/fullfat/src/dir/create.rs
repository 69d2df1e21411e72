use heapless::Vec;

use super::find::scan_dir;
use super::names::{fits_short_name, is_valid_long_name, lfn_entry, short_name_checksum, ShortBasis, LFN_UNITS_PER_ENTRY};
use super::{
    encode_short_entry, raw_attr, split_path, DirCursor, DirEntry, RawEntry, ATTR_DIRECTORY, ATTR_LFN, ATTR_VOLUME_ID, DELETED,
    END_OF_DIR, LFN_LAST,
};
use crate::config::{DIR_ENTRIES_MAX, NAME_UNITS_MAX, SHORT_NAME_SUFFIX_MAX};
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::time::DateTime;
use crate::volume::Volume;

/// Fields of an entry about to be written.
#[derive(Clone, Copy, Debug)]
pub struct NewEntry<'a> {
    pub name: &'a str,
    pub attr: u8,
    pub cluster: u32,
    pub size: u32,
    pub at: DateTime,
}

struct ShortName {
    raw: [u8; 11],
    case: u8,
    needs_lfn: bool,
}

impl<D: BlockDevice> Volume<D> {
    pub(crate) async fn short_name_exists(&self, dir_cluster: u32, short: &[u8; 11]) -> Result<bool, FatError> {
        let mut cursor = DirCursor::new(self, dir_cluster).await?;
        for index in 0..DIR_ENTRIES_MAX {
            let raw = match cursor.fetch(self, index).await {
                Ok(raw) => raw,
                Err(err) if err.is(FatErrorKind::EndOfDir) => break,
                Err(err) => return Err(err),
            };
            if raw[0] == END_OF_DIR {
                break;
            }
            let attr = raw_attr(&raw);
            if raw[0] == DELETED || attr & ATTR_LFN == ATTR_LFN || attr & ATTR_VOLUME_ID != 0 {
                continue;
            }
            if raw[..11] == short[..] {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn create_short_name(&self, dir_cluster: u32, name: &str) -> Result<ShortName, FatError> {
        if let Some((raw, case)) = fits_short_name(name) {
            if self.short_name_exists(dir_cluster, &raw).await? {
                return Err(FatErrorKind::ObjectExists.at(FatOp::CreateShortName));
            }
            return Ok(ShortName {
                raw,
                case,
                needs_lfn: false,
            });
        }
        let basis = ShortBasis::from_long(name);
        for n in 1..=SHORT_NAME_SUFFIX_MAX {
            let raw = basis.numbered(n);
            if !self.short_name_exists(dir_cluster, &raw).await? {
                return Ok(ShortName {
                    raw,
                    case: 0,
                    needs_lfn: true,
                });
            }
        }
        Err(FatErrorKind::DirectoryFull.at(FatOp::CreateShortName))
    }

    /// Grows a directory by one zeroed cluster. The fixed FAT12/16 root can't grow.
    pub(crate) async fn extend_directory_with(&self, cursor: &mut DirCursor) -> Result<(), FatError> {
        if cursor.is_fixed_root() {
            return Err(FatErrorKind::CantExtendRootDir.at(FatOp::ExtendDirectory));
        }
        if self.free_clusters() == 0 {
            let counted = self.count_free_clusters().await?;
            self.increase_free(counted);
            if counted == 0 {
                return Err(FatErrorKind::NoFreeClusters.at(FatOp::ExtendDirectory));
            }
        }
        let cluster = {
            let _fat = self.fat_lock.lock().await;
            let end = self.find_end_of_chain(cursor.dir_cluster()).await?;
            self.link_free_cluster(end).await?
        };
        self.clear_cluster(cluster).await?;
        cursor.grew();
        log::debug!("fullfat: extend_dir dir={} cluster={}", cursor.dir_cluster(), cluster);
        Ok(())
    }

    pub async fn extend_directory(&self, dir_cluster: u32) -> Result<(), FatError> {
        let _dir = self.dir_lock.lock().await;
        let mut cursor = DirCursor::new(self, dir_cluster).await?;
        self.extend_directory_with(&mut cursor).await
    }

    async fn reserve_tail(&self, cursor: &mut DirCursor, start: u32, needed: u32) -> Result<u32, FatError> {
        if start + needed > DIR_ENTRIES_MAX {
            return Err(FatErrorKind::DirectoryFull.at(FatOp::FindFreeDirent));
        }
        while cursor.capacity(self) < start + needed {
            self.extend_directory_with(cursor).await?;
        }
        Ok(start)
    }

    /// Index of the first run of `needed` consecutive free slots, growing the
    /// directory when the run has to start at its end.
    pub(crate) async fn find_free_dirent(&self, cursor: &mut DirCursor, needed: u32) -> Result<u32, FatError> {
        let mut run_start = 0u32;
        let mut run = 0u32;
        for index in 0..DIR_ENTRIES_MAX {
            let raw = match cursor.fetch(self, index).await {
                Ok(raw) => raw,
                Err(err) if err.is(FatErrorKind::EndOfDir) => {
                    let start = if run == 0 { index } else { run_start };
                    return self.reserve_tail(cursor, start, needed).await;
                }
                Err(err) => return Err(err),
            };
            match raw[0] {
                END_OF_DIR => {
                    let start = if run == 0 { index } else { run_start };
                    return self.reserve_tail(cursor, start, needed).await;
                }
                DELETED => {
                    if run == 0 {
                        run_start = index;
                    }
                    run += 1;
                    if run == needed {
                        return Ok(run_start);
                    }
                }
                _ => run = 0,
            }
        }
        Err(FatErrorKind::DirectoryFull.at(FatOp::FindFreeDirent))
    }

    /// Writes the long-name group and short entry for `new`. Callers hold the directory lock.
    pub(crate) async fn create_dirent_locked(&self, dir_cluster: u32, new: &NewEntry<'_>) -> Result<DirEntry, FatError> {
        let op = FatOp::CreateDirent;
        if !is_valid_long_name(new.name) {
            let kind = if new.name.encode_utf16().count() > NAME_UNITS_MAX {
                FatErrorKind::NameTooLong
            } else {
                FatErrorKind::InvalidName
            };
            return Err(kind.at(op));
        }
        if self.find_entry_in_dir(dir_cluster, new.name, 0).await?.is_some() {
            return Err(FatErrorKind::ObjectExists.at(op));
        }

        let short = self.create_short_name(dir_cluster, new.name).await?;
        let mut units: Vec<u16, NAME_UNITS_MAX> = Vec::new();
        if short.needs_lfn {
            for unit in new.name.encode_utf16() {
                units.push(unit).map_err(|_| FatErrorKind::NameTooLong.at(op))?;
            }
        }
        let lfn_count = units.len().div_ceil(LFN_UNITS_PER_ENTRY) as u32;

        let mut cursor = DirCursor::new(self, dir_cluster).await?;
        let start = self.find_free_dirent(&mut cursor, lfn_count + 1).await?;
        let checksum = short_name_checksum(&short.raw);
        for k in 0..lfn_count {
            let ordinal = (lfn_count - k) as u8;
            let raw = lfn_entry(&units, ordinal, k == 0, checksum);
            cursor.push(self, start + k, &raw).await?;
        }
        let raw = encode_short_entry(&short.raw, short.case, new.attr, new.cluster, new.size, new.at, new.at);
        let index = start + lfn_count;
        cursor.push(self, index, &raw).await?;
        log::debug!(
            "fullfat: create_dirent dir={} index={} lfn={} cluster={}",
            cursor.dir_cluster(),
            index,
            lfn_count,
            new.cluster
        );

        let mut name = heapless::String::new();
        name.push_str(new.name)
            .map_err(|_| FatErrorKind::NameTooLong.at(op))?;
        Ok(DirEntry::from_raw(&raw, name, cursor.dir_cluster(), index, lfn_count as u8))
    }

    pub async fn create_dirent(&self, dir_cluster: u32, new: &NewEntry<'_>) -> Result<DirEntry, FatError> {
        let _dir = self.dir_lock.lock().await;
        self.create_dirent_locked(dir_cluster, new).await
    }

    /// Marks the long-name slots in front of short entry `index` as deleted.
    /// Only a run whose ordinals count up from 1 and whose checksum matches
    /// `short` belongs to the entry.
    pub(crate) async fn rm_lfns(&self, cursor: &mut DirCursor, index: u32, short: &[u8; 11]) -> Result<(), FatError> {
        let checksum = short_name_checksum(short);
        let mut expected = 1u8;
        let mut at = index;
        while at > 0 {
            at -= 1;
            let mut raw = cursor.fetch(self, at).await?;
            if raw[0] == DELETED
                || raw_attr(&raw) & ATTR_LFN != ATTR_LFN
                || raw[13] != checksum
                || raw[0] & 0x1F != expected
            {
                break;
            }
            let first_of_group = raw[0] & LFN_LAST != 0;
            raw[0] = DELETED;
            cursor.push(self, at, &raw).await?;
            if first_of_group {
                break;
            }
            expected += 1;
        }
        Ok(())
    }

    /// Deletes short entry `index` and its long-name group. Callers hold the
    /// directory lock.
    pub(crate) async fn remove_dirent_locked(&self, dir_cluster: u32, index: u32) -> Result<(), FatError> {
        let mut cursor = DirCursor::new(self, dir_cluster).await?;
        let mut raw: RawEntry = cursor.fetch(self, index).await?;
        let mut short = [0u8; 11];
        short.copy_from_slice(&raw[..11]);
        raw[0] = DELETED;
        cursor.push(self, index, &raw).await?;
        self.rm_lfns(&mut cursor, index, &short).await
    }

    /// Creates the directory at `path` with its `.` and `..` entries.
    pub async fn mkdir(&self, path: &str) -> Result<DirEntry, FatError> {
        let (parent_path, name) = split_path(path.trim_end_matches(['/', '\\']));
        if !is_valid_long_name(name) {
            return Err(FatErrorKind::InvalidName.at(FatOp::MkDir));
        }
        let parent = self.find_dir(parent_path).await?;
        let _dir = self.dir_lock.lock().await;
        if self.find_entry_in_dir(parent, name, 0).await?.is_some() {
            return Err(FatErrorKind::ObjectExists.at(FatOp::MkDir));
        }

        let cluster = self.create_cluster_chain().await?;
        let at = self.now();
        let created = async {
            self.clear_cluster(cluster).await?;
            let new = NewEntry {
                name,
                attr: ATTR_DIRECTORY,
                cluster,
                size: 0,
                at,
            };
            self.create_dirent_locked(parent, &new).await
        }
        .await;
        let entry = match created {
            Ok(entry) => entry,
            Err(err) => {
                self.unlink_chain(cluster, false).await?;
                return Err(err);
            }
        };

        let dotdot = if parent == self.part.root_dir_cluster { 0 } else { parent };
        let linked = async {
            let mut cursor = DirCursor::new(self, cluster).await?;
            let dot = encode_short_entry(b".          ", 0, ATTR_DIRECTORY, cluster, 0, at, at);
            cursor.push(self, 0, &dot).await?;
            let up = encode_short_entry(b"..         ", 0, ATTR_DIRECTORY, dotdot, 0, at, at);
            cursor.push(self, 1, &up).await
        }
        .await;
        if let Err(err) = linked {
            log::warn!("fullfat: mkdir_rollback path={} err={:?}", path, err);
            self.remove_dirent_locked(entry.dir_cluster, entry.index).await?;
            self.unlink_chain(cluster, false).await?;
            return Err(FatError::new(err.kind(), FatOp::MkDir));
        }
        self.flush().await?;
        log::info!("fullfat: mkdir path={} cluster={}", path, cluster);
        Ok(entry)
    }

    /// True when the directory holds nothing besides `.` and `..`.
    pub async fn is_dir_empty(&self, dir_cluster: u32) -> Result<bool, FatError> {
        let mut cursor = DirCursor::new(self, dir_cluster).await?;
        let other = scan_dir(self, &mut cursor, 0, |entry| entry.name() != "." && entry.name() != "..").await?;
        Ok(other.is_none())
    }
}

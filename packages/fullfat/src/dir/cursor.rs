use super::{RawEntry, DIRENT_SIZE, ENTRIES_PER_SECTOR};
use crate::cache::LeaseMode;
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::volume::Volume;

/// Position within one directory's cluster chain, remembered between
/// consecutive entry accesses so forward scans don't re-walk the chain.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DirCursor {
    dir_cluster: u32,
    fixed_root: bool,
    chain_len: u32,
    cluster_index: u32,
    cluster: u32,
}

impl DirCursor {
    pub(crate) async fn new<D: BlockDevice>(vol: &Volume<D>, dir_cluster: u32) -> Result<Self, FatError> {
        let dir_cluster = vol.part.resolve_dir_cluster(dir_cluster);
        if vol.part.has_fixed_root(dir_cluster) {
            return Ok(Self {
                dir_cluster,
                fixed_root: true,
                chain_len: 0,
                cluster_index: 0,
                cluster: dir_cluster,
            });
        }
        let (chain_len, _) = vol.chain_length(dir_cluster).await?;
        Ok(Self {
            dir_cluster,
            fixed_root: false,
            chain_len,
            cluster_index: 0,
            cluster: dir_cluster,
        })
    }

    pub(crate) fn dir_cluster(&self) -> u32 {
        self.dir_cluster
    }

    pub(crate) fn is_fixed_root(&self) -> bool {
        self.fixed_root
    }

    pub(crate) fn entries_per_cluster<D: BlockDevice>(vol: &Volume<D>) -> u32 {
        vol.part.sectors_per_cluster * ENTRIES_PER_SECTOR
    }

    /// Entry slots currently backed by storage.
    pub(crate) fn capacity<D: BlockDevice>(&self, vol: &Volume<D>) -> u32 {
        if self.fixed_root {
            vol.part.root_entries
        } else {
            self.chain_len * Self::entries_per_cluster(vol)
        }
    }

    pub(crate) fn grew(&mut self) {
        self.chain_len += 1;
    }

    async fn locate<D: BlockDevice>(&mut self, vol: &Volume<D>, index: u32) -> Result<(u32, usize), FatError> {
        let offset = (index % ENTRIES_PER_SECTOR) as usize * DIRENT_SIZE;
        if self.fixed_root {
            if index >= vol.part.root_entries {
                return Err(FatErrorKind::EndOfDir.at(FatOp::FindNext));
            }
            return Ok((vol.part.root_dir_lba + index / ENTRIES_PER_SECTOR, offset));
        }
        let per_cluster = Self::entries_per_cluster(vol);
        let target = index / per_cluster;
        if target >= self.chain_len {
            return Err(FatErrorKind::EndOfDir.at(FatOp::FindNext));
        }
        if target > self.cluster_index {
            self.cluster = vol.traverse(self.cluster, target - self.cluster_index).await?;
        } else if target < self.cluster_index {
            self.cluster = vol.traverse(self.dir_cluster, target).await?;
        }
        self.cluster_index = target;
        let lba = vol.part.cluster_to_lba(self.cluster) + (index % per_cluster) / ENTRIES_PER_SECTOR;
        Ok((lba, offset))
    }

    pub(crate) async fn fetch<D: BlockDevice>(&mut self, vol: &Volume<D>, index: u32) -> Result<RawEntry, FatError> {
        let (lba, offset) = self.locate(vol, index).await?;
        let sector = vol.cache.lend(lba, LeaseMode::Read).await?;
        let mut raw = [0u8; DIRENT_SIZE];
        raw.copy_from_slice(&sector.bytes()[offset..offset + DIRENT_SIZE]);
        Ok(raw)
    }

    pub(crate) async fn push<D: BlockDevice>(&mut self, vol: &Volume<D>, index: u32, raw: &RawEntry) -> Result<(), FatError> {
        let (lba, offset) = self.locate(vol, index).await?;
        let mut sector = vol.cache.lend(lba, LeaseMode::Write).await?;
        sector.bytes_mut()[offset..offset + DIRENT_SIZE].copy_from_slice(raw);
        Ok(())
    }
}

//! File allocation table access and cluster-chain management.
//!
//! Single-entry reads and writes take no lock. Anything that spans several
//! entries (find + link, unlink) runs under `Volume::fat_lock`.

use core::sync::atomic::Ordering;

use crate::cache::LeaseMode;
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::partition::FatType;
use crate::volume::Volume;
use crate::SECTOR_SIZE;

impl<D: BlockDevice> Volume<D> {
    async fn read_table_bytes(&self, offset: u32, out: &mut [u8]) -> Result<(), FatError> {
        let mut done = 0usize;
        while done < out.len() {
            let pos = offset + done as u32;
            let lba = self.part.fat_begin_lba + pos / SECTOR_SIZE as u32;
            let at = pos as usize % SECTOR_SIZE;
            let take = (out.len() - done).min(SECTOR_SIZE - at);
            let sector = self.cache.lend(lba, LeaseMode::Read).await?;
            out[done..done + take].copy_from_slice(&sector.bytes()[at..at + take]);
            done += take;
        }
        Ok(())
    }

    async fn write_table_bytes(&self, offset: u32, data: &[u8]) -> Result<(), FatError> {
        for copy in 0..self.part.num_fats {
            let base = self.part.fat_begin_lba + copy * self.part.sectors_per_fat;
            let mut done = 0usize;
            while done < data.len() {
                let pos = offset + done as u32;
                let lba = base + pos / SECTOR_SIZE as u32;
                let at = pos as usize % SECTOR_SIZE;
                let take = (data.len() - done).min(SECTOR_SIZE - at);
                let mut sector = self.cache.lend(lba, LeaseMode::Write).await?;
                sector.bytes_mut()[at..at + take].copy_from_slice(&data[done..done + take]);
                done += take;
            }
        }
        Ok(())
    }

    fn check_cluster(&self, cluster: u32, op: FatOp) -> Result<(), FatError> {
        if self.part.is_valid_cluster(cluster) {
            Ok(())
        } else {
            Err(FatErrorKind::InvalidCluster(cluster).at(op))
        }
    }

    /// Next-cluster value stored in the slot for `cluster`, masked to the FAT width.
    pub async fn get_entry(&self, cluster: u32) -> Result<u32, FatError> {
        self.check_cluster(cluster, FatOp::GetEntry)?;
        let fat_type = self.part.fat_type;
        let offset = fat_type.entry_offset(cluster);
        let mut raw = [0u8; 4];
        let width = fat_type.entry_bytes();
        self.read_table_bytes(offset, &mut raw[..width]).await?;
        let value = u32::from_le_bytes(raw);
        Ok(match fat_type {
            FatType::Fat12 if cluster & 1 == 1 => value >> 4,
            _ => value,
        } & fat_type.mask())
    }

    /// Writes the slot for `cluster` in every FAT copy.
    pub async fn put_entry(&self, cluster: u32, value: u32) -> Result<(), FatError> {
        self.check_cluster(cluster, FatOp::PutEntry)?;
        let fat_type = self.part.fat_type;
        let offset = fat_type.entry_offset(cluster);
        let width = fat_type.entry_bytes();
        let value = value & fat_type.mask();
        let new = match fat_type {
            FatType::Fat12 => {
                let mut raw = [0u8; 4];
                self.read_table_bytes(offset, &mut raw[..width]).await?;
                let old = u32::from_le_bytes(raw);
                if cluster & 1 == 1 {
                    (old & 0x000F) | (value << 4)
                } else {
                    (old & 0xF000) | value
                }
            }
            // FAT32 top nibble is written as zero.
            FatType::Fat16 | FatType::Fat32 => value,
        };
        self.write_table_bytes(offset, &new.to_le_bytes()[..width]).await
    }

    /// A free slot met mid-chain is treated as the end rather than corruption.
    pub fn is_end_of_chain(&self, value: u32) -> bool {
        let value = value & self.part.fat_type.mask();
        value == 0 || value >= self.part.fat_type.end_of_chain()
    }

    fn end_of_chain_marker(&self) -> u32 {
        self.part.fat_type.mask()
    }

    /// First free cluster at or after the hint, wrapping once. Callers hold the FAT lock.
    pub(crate) async fn find_free_cluster(&self) -> Result<u32, FatError> {
        let end = self.part.num_clusters + 2;
        if self.part.num_clusters == 0 {
            return Err(FatErrorKind::NoFreeClusters.at(FatOp::FindFreeCluster));
        }
        let hint = self.last_free.load(Ordering::Relaxed).clamp(2, end - 1);
        for cluster in (hint..end).chain(2..hint) {
            if self.get_entry(cluster).await? == 0 {
                self.last_free.store(cluster, Ordering::Relaxed);
                return Ok(cluster);
            }
        }
        Err(FatErrorKind::NoFreeClusters.at(FatOp::FindFreeCluster))
    }

    /// Allocates one cluster and links it after `tail`. Callers hold the FAT lock.
    pub(crate) async fn link_free_cluster(&self, tail: u32) -> Result<u32, FatError> {
        let next = self.find_free_cluster().await?;
        self.put_entry(next, self.end_of_chain_marker()).await?;
        if tail != 0 {
            self.put_entry(tail, next).await?;
        }
        self.decrease_free(1);
        Ok(next)
    }

    /// Starts a new one-cluster chain and returns its first cluster.
    pub async fn create_cluster_chain(&self) -> Result<u32, FatError> {
        let _fat = self.fat_lock.lock().await;
        self.link_free_cluster(0).await
    }

    /// Appends one cluster after the chain's last cluster `tail`.
    pub async fn extend_chain(&self, tail: u32) -> Result<u32, FatError> {
        self.check_cluster(tail, FatOp::ExtendChain)?;
        let _fat = self.fat_lock.lock().await;
        self.link_free_cluster(tail).await
    }

    pub(crate) async fn unlink_chain_locked(&self, start: u32, truncate: bool) -> Result<u32, FatError> {
        self.check_cluster(start, FatOp::UnlinkChain)?;
        let mut cluster = start;
        let mut freed = 0u32;
        let mut lowest = u32::MAX;
        let mut first = true;
        for _ in 0..=self.part.num_clusters {
            let next = self.get_entry(cluster).await?;
            if first && truncate {
                self.put_entry(cluster, self.end_of_chain_marker()).await?;
            } else {
                self.put_entry(cluster, 0).await?;
                freed += 1;
                lowest = lowest.min(cluster);
            }
            first = false;
            if self.is_end_of_chain(next) {
                if lowest < self.last_free.load(Ordering::Relaxed) {
                    self.last_free.store(lowest, Ordering::Relaxed);
                }
                self.increase_free(freed);
                return Ok(freed);
            }
            cluster = next;
        }
        Err(FatErrorKind::CorruptChain.at(FatOp::UnlinkChain))
    }

    /// Frees every cluster of the chain from `start`. With `truncate`, `start`
    /// itself stays allocated as the new end of chain. Returns clusters freed.
    pub async fn unlink_chain(&self, start: u32, truncate: bool) -> Result<u32, FatError> {
        let _fat = self.fat_lock.lock().await;
        self.unlink_chain_locked(start, truncate).await
    }

    /// Full linear scan of the table.
    pub async fn count_free_clusters(&self) -> Result<u32, FatError> {
        let mut free = 0u32;
        for cluster in 2..self.part.num_clusters + 2 {
            if self.get_entry(cluster).await? == 0 {
                free += 1;
            }
        }
        Ok(free)
    }

    /// Follows `count` links from `start`.
    pub async fn traverse(&self, start: u32, count: u32) -> Result<u32, FatError> {
        let mut cluster = start;
        for _ in 0..count {
            let next = self.get_entry(cluster).await?;
            if self.is_end_of_chain(next) {
                return Err(FatErrorKind::CorruptChain.at(FatOp::Traverse));
            }
            cluster = next;
        }
        Ok(cluster)
    }

    /// Length of the chain from `start` and its last cluster.
    pub async fn chain_length(&self, start: u32) -> Result<(u32, u32), FatError> {
        let mut cluster = start;
        for length in 1..=self.part.num_clusters {
            let next = self.get_entry(cluster).await?;
            if self.is_end_of_chain(next) {
                return Ok((length, cluster));
            }
            cluster = next;
        }
        Err(FatErrorKind::CorruptChain.at(FatOp::Traverse))
    }

    pub async fn find_end_of_chain(&self, start: u32) -> Result<u32, FatError> {
        Ok(self.chain_length(start).await?.1)
    }

    pub async fn clear_cluster(&self, cluster: u32) -> Result<(), FatError> {
        let lba = self.part.cluster_to_lba(cluster);
        for sector in 0..self.part.sectors_per_cluster {
            self.cache
                .lend(lba + sector, LeaseMode::WriteOnly)
                .await?
                .bytes_mut()
                .fill(0);
        }
        Ok(())
    }
}

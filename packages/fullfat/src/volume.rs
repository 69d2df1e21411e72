use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

use crate::bytes::put_le_u32;
use crate::cache::{BufferCache, LeaseMode};
use crate::config::VolumeConfig;
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::file::registry::OpenFiles;
use crate::partition::{
    first_fat_partition_lba, is_boot_record, parse_fsinfo, FatType, Partition, FSINFO_FREE_COUNT,
    FSINFO_NEXT_FREE,
};
use crate::time::DateTime;

/// A mounted FAT volume.
///
/// All engines borrow the volume shared; the FAT table, directory contents
/// and open-file list each sit behind their own lock.
pub struct Volume<D: BlockDevice> {
    pub(crate) cache: BufferCache<D>,
    pub(crate) part: Partition,
    pub(crate) config: VolumeConfig,
    pub(crate) free_count: AtomicU32,
    pub(crate) last_free: AtomicU32,
    pub(crate) fat_lock: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) dir_lock: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) files: OpenFiles,
}

impl<D: BlockDevice> Volume<D> {
    /// Mounts the first FAT partition on the device, or the whole device when
    /// sector 0 is itself a boot record.
    pub async fn mount(device: D, config: VolumeConfig) -> Result<Self, FatError> {
        let cache = BufferCache::new(device, config.cache_slots());

        let begin_lba = {
            let sector0 = cache.lend(0, LeaseMode::Read).await?;
            let sector0 = sector0.bytes();
            if is_boot_record(sector0) {
                0
            } else {
                first_fat_partition_lba(sector0)
                    .ok_or(FatErrorKind::NotFatFormatted.at(FatOp::Mount))?
            }
        };
        let part = {
            let boot = cache.lend(begin_lba, LeaseMode::Read).await?;
            Partition::parse(boot.bytes(), begin_lba)?
        };

        let volume = Self {
            cache,
            part,
            config,
            free_count: AtomicU32::new(0),
            last_free: AtomicU32::new(2),
            fat_lock: Mutex::new(()),
            dir_lock: Mutex::new(()),
            files: OpenFiles::new(),
        };

        let mut free = None;
        if let (Some(lba), true) = (part.fsinfo_lba, config.trust_fsinfo) {
            let info = {
                let sector = volume.cache.lend(lba, LeaseMode::Read).await?;
                parse_fsinfo(sector.bytes())
            };
            if let Some(info) = info {
                free = info.free_count;
                if let Some(hint) = info.next_free.filter(|hint| part.is_valid_cluster(*hint)) {
                    volume.last_free.store(hint, Ordering::Relaxed);
                }
            }
        }
        let free = match free {
            Some(free) => free,
            None => volume.count_free_clusters().await?,
        };
        volume.free_count.store(free, Ordering::Relaxed);

        log::info!(
            "fullfat: mount type={:?} begin={} clusters={} cluster_bytes={} free={}",
            part.fat_type,
            begin_lba,
            part.num_clusters,
            part.cluster_bytes(),
            free
        );
        Ok(volume)
    }

    pub fn partition(&self) -> &Partition {
        &self.part
    }

    pub fn fat_type(&self) -> FatType {
        self.part.fat_type
    }

    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    /// Cached free-cluster count, maintained by every allocation and unlink.
    pub fn free_clusters(&self) -> u32 {
        self.free_count.load(Ordering::Relaxed)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_clusters() as u64 * self.part.cluster_bytes() as u64
    }

    pub(crate) fn now(&self) -> DateTime {
        (self.config.clock)()
    }

    pub(crate) fn decrease_free(&self, count: u32) {
        let _ = self
            .free_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |free| {
                Some(free.saturating_sub(count))
            });
    }

    pub(crate) fn increase_free(&self, count: u32) {
        let limit = self.part.num_clusters;
        let _ = self
            .free_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |free| {
                Some(free.saturating_add(count).min(limit))
            });
    }

    pub async fn flush(&self) -> Result<(), FatError> {
        self.cache.flush().await
    }

    /// Marks every open handle as belonging to removed media and drops
    /// cached sectors without writing them.
    pub async fn invalidate(&self) {
        let count = self.files.invalidate_all();
        self.cache.discard().await;
        log::warn!("fullfat: invalidate handles={}", count);
    }

    async fn write_fsinfo(&self) -> Result<(), FatError> {
        let Some(lba) = self.part.fsinfo_lba else {
            return Ok(());
        };
        let mut sector = self.cache.lend(lba, LeaseMode::Read).await?;
        if parse_fsinfo(sector.bytes()).is_none() {
            return Ok(());
        }
        let free = self.free_clusters();
        let hint = self.last_free.load(Ordering::Relaxed);
        let bytes = sector.bytes_mut();
        put_le_u32(bytes, FSINFO_FREE_COUNT, free);
        put_le_u32(bytes, FSINFO_NEXT_FREE, hint);
        Ok(())
    }

    /// Writes back FSInfo and every dirty sector, then hands the device back.
    pub async fn unmount(self) -> Result<D, FatError> {
        if !self.files.is_empty() {
            return Err(FatErrorKind::ActiveHandles.at(FatOp::Unmount));
        }
        self.write_fsinfo().await?;
        self.cache.flush().await?;
        log::info!("fullfat: unmount free={}", self.free_clusters());
        Ok(self.cache.into_device())
    }
}

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use heapless::Vec;

use crate::config::CACHE_SECTORS_MAX;
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::SECTOR_SIZE;

const NO_SECTOR: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseMode {
    /// Load the sector from the device before lending it.
    Read,
    /// Load the sector, and expect the borrower to modify it.
    Write,
    /// Hand out a zeroed buffer without reading; the borrower overwrites it.
    WriteOnly,
}

struct CacheSlot {
    lba: u32,
    dirty: bool,
    last_used: u32,
    data: [u8; SECTOR_SIZE],
}

impl CacheSlot {
    const fn empty() -> Self {
        Self {
            lba: NO_SECTOR,
            dirty: false,
            last_used: 0,
            data: [0; SECTOR_SIZE],
        }
    }
}

struct CacheInner<D> {
    device: D,
    slots: Vec<CacheSlot, CACHE_SECTORS_MAX>,
    capacity: usize,
    tick: u32,
}

/// Write-back sector cache shared by every engine on a volume.
///
/// A lease holds the cache lock for its lifetime, so lenders of the same
/// sector are serialized and a lease must be dropped before the next cache
/// call on the same task.
pub struct BufferCache<D: BlockDevice> {
    inner: Mutex<CriticalSectionRawMutex, CacheInner<D>>,
}

/// A borrowed sector buffer. Dirty buffers are persisted on flush or eviction.
pub struct SectorLease<'a, D: BlockDevice> {
    inner: MutexGuard<'a, CriticalSectionRawMutex, CacheInner<D>>,
    slot: usize,
}

impl<D: BlockDevice> SectorLease<'_, D> {
    pub fn lba(&self) -> u32 {
        self.inner.slots[self.slot].lba
    }

    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.inner.slots[self.slot].data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        let slot = &mut self.inner.slots[self.slot];
        slot.dirty = true;
        &mut slot.data
    }
}

fn device_error<E: core::fmt::Debug>(op: FatOp, lba: u32, err: E) -> FatError {
    log::warn!("fullfat: device_error op={:?} lba={} err={:?}", op, lba, err);
    FatErrorKind::DeviceDriverFailed.at(op)
}

fn short_transfer(op: FatOp, lba: u32, expected: usize, got: usize) -> FatError {
    log::warn!(
        "fullfat: short_transfer op={:?} lba={} expected={} got={}",
        op,
        lba,
        expected,
        got
    );
    FatErrorKind::DeviceDriverFailed.at(op)
}

impl<D: BlockDevice> CacheInner<D> {
    async fn write_back(&mut self, index: usize) -> Result<(), FatError> {
        let CacheInner { device, slots, .. } = self;
        let slot = &mut slots[index];
        if !slot.dirty || slot.lba == NO_SECTOR {
            return Ok(());
        }
        let written = device
            .write_blocks(slot.lba, &slot.data)
            .await
            .map_err(|err| device_error(FatOp::BlockWrite, slot.lba, err))?;
        if written != 1 {
            return Err(short_transfer(FatOp::BlockWrite, slot.lba, 1, written));
        }
        slot.dirty = false;
        Ok(())
    }

    fn find(&self, lba: u32) -> Option<usize> {
        self.slots.iter().position(|slot| slot.lba == lba)
    }

    async fn victim(&mut self) -> Result<usize, FatError> {
        if self.slots.len() < self.capacity && self.slots.push(CacheSlot::empty()).is_ok() {
            return Ok(self.slots.len() - 1);
        }
        let mut victim = 0usize;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.lba == NO_SECTOR {
                victim = index;
                break;
            }
            if slot.last_used < self.slots[victim].last_used {
                victim = index;
            }
        }
        self.write_back(victim).await?;
        self.slots[victim].lba = NO_SECTOR;
        Ok(victim)
    }
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(device: D, sectors: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                device,
                slots: Vec::new(),
                capacity: sectors.clamp(1, CACHE_SECTORS_MAX),
                tick: 0,
            }),
        }
    }

    pub async fn lend(&self, lba: u32, mode: LeaseMode) -> Result<SectorLease<'_, D>, FatError> {
        let mut inner = self.inner.lock().await;
        inner.tick = inner.tick.wrapping_add(1);
        let tick = inner.tick;

        let slot = match inner.find(lba) {
            Some(slot) => slot,
            None => {
                let slot = inner.victim().await?;
                if mode == LeaseMode::WriteOnly {
                    inner.slots[slot].data.fill(0);
                } else {
                    let CacheInner { device, slots, .. } = &mut *inner;
                    let read = device
                        .read_blocks(lba, &mut slots[slot].data)
                        .await
                        .map_err(|err| device_error(FatOp::BlockRead, lba, err))?;
                    if read != 1 {
                        return Err(short_transfer(FatOp::BlockRead, lba, 1, read));
                    }
                }
                inner.slots[slot].lba = lba;
                inner.slots[slot].dirty = false;
                slot
            }
        };
        inner.slots[slot].last_used = tick;
        Ok(SectorLease { inner, slot })
    }

    /// Reads whole sectors straight from the device, overlaying any cached
    /// copies so the result matches what a lease would see.
    pub async fn read_blocks(&self, lba: u32, buf: &mut [u8]) -> Result<(), FatError> {
        let mut inner = self.inner.lock().await;
        let CacheInner { device, slots, .. } = &mut *inner;
        let count = buf.len() / SECTOR_SIZE;
        let read = device
            .read_blocks(lba, buf)
            .await
            .map_err(|err| device_error(FatOp::BlockRead, lba, err))?;
        if read != count {
            return Err(short_transfer(FatOp::BlockRead, lba, count, read));
        }
        for slot in slots.iter() {
            if slot.lba != NO_SECTOR && slot.lba >= lba && slot.lba < lba + count as u32 {
                let at = (slot.lba - lba) as usize * SECTOR_SIZE;
                buf[at..at + SECTOR_SIZE].copy_from_slice(&slot.data);
            }
        }
        Ok(())
    }

    /// Writes whole sectors straight to the device and refreshes cached copies.
    pub async fn write_blocks(&self, lba: u32, buf: &[u8]) -> Result<(), FatError> {
        let mut inner = self.inner.lock().await;
        let CacheInner { device, slots, .. } = &mut *inner;
        let count = buf.len() / SECTOR_SIZE;
        let written = device
            .write_blocks(lba, buf)
            .await
            .map_err(|err| device_error(FatOp::BlockWrite, lba, err))?;
        if written != count {
            return Err(short_transfer(FatOp::BlockWrite, lba, count, written));
        }
        for slot in slots.iter_mut() {
            if slot.lba != NO_SECTOR && slot.lba >= lba && slot.lba < lba + count as u32 {
                let at = (slot.lba - lba) as usize * SECTOR_SIZE;
                slot.data.copy_from_slice(&buf[at..at + SECTOR_SIZE]);
                slot.dirty = false;
            }
        }
        Ok(())
    }

    /// Persists every dirty sector. Later reads observe all prior writes.
    pub async fn flush(&self) -> Result<(), FatError> {
        let mut inner = self.inner.lock().await;
        for index in 0..inner.slots.len() {
            inner.write_back(index).await?;
        }
        Ok(())
    }

    /// Drops every cached sector without writing, for media that is gone.
    pub async fn discard(&self) {
        let mut inner = self.inner.lock().await;
        inner.slots.clear();
    }

    pub async fn dirty_sectors(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.slots.iter().filter(|slot| slot.dirty).count()
    }

    pub async fn block_count(&self) -> u32 {
        self.inner.lock().await.device.block_count()
    }

    pub fn into_device(self) -> D {
        self.inner.into_inner().device
    }
}

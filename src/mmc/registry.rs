use core::fmt::Write as _;

use embassy_futures::select::{select, Either};
use embassy_time::Timer;
use heapless::Vec;
use sdcard::{CardChange, CardEvent, MmcHost, SdCard, SdConfig};

use super::block::MmcBlockDevice;
use super::signals::{DeviceChange, DeviceName, MmcSignals};
use crate::config::{
    MMC_DETECT_POLL_MS, MMC_DEVICE_PREFIX, MMC_FLAG_INITIALISE_REQUEST, MMC_FLAG_INVALIDATE, MMC_HOSTS_MAX,
};
use crate::error::BtError;

struct MmcSlot<H: MmcHost> {
    card: SdCard<H>,
    device: Option<DeviceName>,
    last_present: bool,
}

/// Owns every registered host controller and its card driver.
///
/// Host index `i` always publishes its card as `mmc{i}`. The registry is
/// driven from a single task; other contexts only talk to it through the
/// shared [`MmcSignals`].
pub struct MmcRegistry<'s, H: MmcHost, const N: usize = MMC_HOSTS_MAX> {
    signals: &'s MmcSignals<N>,
    slots: Vec<MmcSlot<H>, N>,
}

impl<'s, H: MmcHost, const N: usize> MmcRegistry<'s, H, N> {
    pub fn new(signals: &'s MmcSignals<N>) -> Self {
        Self {
            signals,
            slots: Vec::new(),
        }
    }

    pub fn signals(&self) -> &'s MmcSignals<N> {
        self.signals
    }

    /// Adds a host controller and returns its index. A card already in the
    /// slot is queued for bring-up as if it had just been inserted.
    pub fn register_host(&mut self, mut host: H, config: SdConfig) -> Result<usize, BtError> {
        let present = match host.is_card_present() {
            Ok(present) => present,
            Err(err) => {
                log::warn!("mmc: presence_check_failed err={:?}", err);
                false
            }
        };
        let index = self.slots.len();
        let slot = MmcSlot {
            card: SdCard::new(host, config),
            device: None,
            last_present: present,
        };
        if self.slots.push(slot).is_err() {
            log::warn!("mmc: host_table_full max={}", N);
            return Err(BtError::NoSpace);
        }
        log::info!("mmc: host_registered index={} present={}", index, present);
        if present {
            self.signals.post_event(index, CardEvent::Detected)?;
        }
        Ok(index)
    }

    pub fn host_count(&self) -> usize {
        self.slots.len()
    }

    pub fn card(&self, host: usize) -> Option<&SdCard<H>> {
        self.slots.get(host).map(|slot| &slot.card)
    }

    pub fn card_mut(&mut self, host: usize) -> Option<&mut SdCard<H>> {
        self.slots.get_mut(host).map(|slot| &mut slot.card)
    }

    pub fn device_name(&self, host: usize) -> Option<&str> {
        self.slots.get(host)?.device.as_ref().map(|name| name.as_str())
    }

    pub fn find_device(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.device.as_ref().is_some_and(|device| device.as_str() == name))
    }

    /// Block device view of a registered card.
    pub fn open_device(&mut self, name: &str) -> Result<MmcBlockDevice<'_, H>, BtError> {
        let index = self.find_device(name).ok_or(BtError::NoDevice)?;
        self.block_device(index).ok_or(BtError::NoDevice)
    }

    pub fn block_device(&mut self, host: usize) -> Option<MmcBlockDevice<'_, H>> {
        let slot = self.slots.get_mut(host)?;
        slot.device.as_ref()?;
        MmcBlockDevice::new(&mut slot.card)
    }

    /// Applies every pending request. Invalidation is handled before
    /// initialisation so a quick remove/insert ends with the new card.
    /// Returns the number of hosts that had work queued.
    pub async fn service(&mut self) -> usize {
        let signals = self.signals;
        let mut serviced = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let flags = signals.take_flags(index);
            if flags == 0 {
                continue;
            }
            serviced += 1;
            if flags & MMC_FLAG_INVALIDATE != 0 {
                slot.apply(index, CardEvent::Removed, signals).await;
            }
            if flags & MMC_FLAG_INITIALISE_REQUEST != 0 {
                slot.apply(index, CardEvent::Detected, signals).await;
            }
        }
        serviced
    }

    /// Polls card-detect on every host and queues an event for each edge.
    /// Only presence is sampled; no command reaches the card.
    pub fn poll_presence(&mut self) {
        let signals = self.signals;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let present = match slot.card.host_mut().is_card_present() {
                Ok(present) => present,
                Err(err) => {
                    log::debug!("mmc: presence_poll_failed index={} err={:?}", index, err);
                    continue;
                }
            };
            if present == slot.last_present {
                continue;
            }
            slot.last_present = present;
            let event = if present {
                CardEvent::Detected
            } else {
                CardEvent::Removed
            };
            log::debug!("mmc: presence_edge index={} event={:?}", index, event);
            if let Err(err) = signals.post_event(index, event) {
                log::warn!("mmc: post_failed index={} err={:?}", index, err);
            }
        }
    }

    /// Sleeps until a host posts an event or the poll interval passes, then
    /// services every host.
    pub async fn wait_and_service(&mut self) -> usize {
        let signals = self.signals;
        if let Either::Second(()) = select(signals.wait(), Timer::after_millis(MMC_DETECT_POLL_MS)).await {
            self.poll_presence();
        }
        self.service().await
    }

    /// Detection task body. Never returns.
    pub async fn run(&mut self) {
        loop {
            self.wait_and_service().await;
        }
    }
}

impl<H: MmcHost> MmcSlot<H> {
    async fn apply<const N: usize>(&mut self, index: usize, event: CardEvent, signals: &MmcSignals<N>) {
        match self.card.handle_event(event).await {
            CardChange::Registered(info) => {
                let name = device_name(index);
                log::info!(
                    "mmc: device_added name={} blocks={} block_size={}",
                    name.as_str(),
                    info.block_count(),
                    info.block_size()
                );
                self.device = Some(name.clone());
                signals.publish(DeviceChange::Added {
                    host: index,
                    name,
                    block_size: info.block_size(),
                    blocks: info.block_count(),
                });
            }
            CardChange::Unregistered => {
                if let Some(name) = self.device.take() {
                    log::info!("mmc: device_removed name={}", name.as_str());
                    signals.publish(DeviceChange::Removed { host: index, name });
                }
            }
            CardChange::BringUpFailed(err) => {
                log::debug!("mmc: device_skipped index={} err={:?}", index, err);
            }
            CardChange::Unchanged => {}
        }
    }
}

fn device_name(index: usize) -> DeviceName {
    let mut name = DeviceName::new();
    // Fits: the prefix is three bytes and MMC_HOSTS_MAX stays single digit.
    let _ = write!(name, "{}{}", MMC_DEVICE_PREFIX, index);
    name
}

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, TrySendError};
use embassy_sync::signal::Signal;
use heapless::String;
use sdcard::CardEvent;

use crate::config::{
    MMC_CHANGE_QUEUE_DEPTH, MMC_DEVICE_NAME_MAX, MMC_FLAG_INITIALISE_REQUEST, MMC_FLAG_INVALIDATE, MMC_HOSTS_MAX,
};
use crate::error::BtError;

pub type DeviceName = String<MMC_DEVICE_NAME_MAX>;

/// Block devices coming and going, in the order the detection task saw them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceChange {
    Added {
        host: usize,
        name: DeviceName,
        block_size: u32,
        blocks: u32,
    },
    Removed {
        host: usize,
        name: DeviceName,
    },
}

/// State shared between event posters (host drivers, possibly from
/// interrupt context) and the detection task.
pub struct MmcSignals<const N: usize = MMC_HOSTS_MAX> {
    flags: [AtomicU32; N],
    wake: Signal<CriticalSectionRawMutex, ()>,
    changes: Channel<CriticalSectionRawMutex, DeviceChange, MMC_CHANGE_QUEUE_DEPTH>,
}

impl<const N: usize> MmcSignals<N> {
    pub const fn new() -> Self {
        Self {
            flags: [const { AtomicU32::new(0) }; N],
            wake: Signal::new(),
            changes: Channel::new(),
        }
    }

    /// Records a card event for `host` and wakes the detection task.
    ///
    /// A removal cancels a pending initialise request, so a card pulled
    /// before the task ran is never brought up.
    pub fn post_event(&self, host: usize, event: CardEvent) -> Result<(), BtError> {
        let flags = self.flags.get(host).ok_or(BtError::NoDevice)?;
        match event {
            CardEvent::Detected => {
                flags.fetch_or(MMC_FLAG_INITIALISE_REQUEST, Ordering::AcqRel);
            }
            CardEvent::Removed => {
                flags.fetch_and(!MMC_FLAG_INITIALISE_REQUEST, Ordering::AcqRel);
                flags.fetch_or(MMC_FLAG_INVALIDATE, Ordering::AcqRel);
            }
        }
        self.wake.signal(());
        Ok(())
    }

    pub(crate) fn take_flags(&self, host: usize) -> u32 {
        self.flags.get(host).map_or(0, |flags| flags.swap(0, Ordering::AcqRel))
    }

    pub fn pending(&self, host: usize) -> u32 {
        self.flags.get(host).map_or(0, |flags| flags.load(Ordering::Acquire))
    }

    pub(crate) async fn wait(&self) {
        self.wake.wait().await
    }

    pub(crate) fn publish(&self, change: DeviceChange) {
        if let Err(TrySendError::Full(change)) = self.changes.try_send(change) {
            log::warn!("mmc: change_drop change={:?}", change);
        }
    }

    /// Receiving end for whoever mounts filesystems on new devices.
    pub fn changes(&self) -> Receiver<'_, CriticalSectionRawMutex, DeviceChange, MMC_CHANGE_QUEUE_DEPTH> {
        self.changes.receiver()
    }

    pub fn try_next_change(&self) -> Option<DeviceChange> {
        self.changes.try_receive().ok()
    }
}

impl<const N: usize> Default for MmcSignals<N> {
    fn default() -> Self {
        Self::new()
    }
}

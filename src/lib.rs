#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod fs;
pub mod mmc;

pub use error::BtError;
pub use fs::FatFs;
pub use mmc::{DeviceChange, DeviceName, MmcBlockDevice, MmcRegistry, MmcSignals};

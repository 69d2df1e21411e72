#![cfg_attr(not(test), no_std)]

pub mod card;
pub mod command;
pub mod config;
pub mod csd;
pub mod error;
pub mod host;
mod machine;
pub mod spi;

pub use card::{CardChange, CardInfo, SdCard};
pub use command::{MmcCommand, ResponseType};
pub use config::SdConfig;
pub use csd::{Cid, Csd};
pub use error::{CardError, HostError};
pub use host::{BusWidth, CardEvent, HostCaps, MmcHost};
pub use machine::CardPhase;
pub use spi::{AlwaysPresent, CardDetect, DetectPin, SpiHost};

pub const SD_BLOCK_SIZE: usize = 512;

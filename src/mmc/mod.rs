//! Host controller registry and card-detect plumbing.

pub mod block;
pub mod registry;
pub mod signals;

pub use block::MmcBlockDevice;
pub use registry::MmcRegistry;
pub use signals::{DeviceChange, DeviceName, MmcSignals};

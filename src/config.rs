/// Host slots a registry can hold.
pub const MMC_HOSTS_MAX: usize = 4;
/// Block devices appear as `mmc0`, `mmc1`, ...
pub const MMC_DEVICE_PREFIX: &str = "mmc";
pub const MMC_DEVICE_NAME_MAX: usize = 8;
/// Device add/remove notices kept for consumers before new ones are dropped.
pub const MMC_CHANGE_QUEUE_DEPTH: usize = 8;
/// Presence poll period for hosts that cannot raise detect events.
pub const MMC_DETECT_POLL_MS: u64 = 250;

/// Per-host request bits set by event posters and consumed by the detection task.
pub const MMC_FLAG_INITIALISE_REQUEST: u32 = 0x0000_0001;
pub const MMC_FLAG_INVALIDATE: u32 = 0x0000_0002;

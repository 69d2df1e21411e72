pub const SD_SETTLE_MS: u64 = 10;
pub const SD_IO_RETRIES: u8 = 3;
pub const SD_ACMD41_POLL_MS: u64 = 1;

/// Timing knobs for bring-up and block I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdConfig {
    /// Delay between a detect event and the first command.
    pub settle_ms: u64,
    /// Attempts per block transfer before a timeout is reported.
    pub io_retries: u8,
    /// Pause between ACMD41 polls while the card is still busy.
    pub acmd41_poll_ms: u64,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            settle_ms: SD_SETTLE_MS,
            io_retries: SD_IO_RETRIES,
            acmd41_poll_ms: SD_ACMD41_POLL_MS,
        }
    }
}

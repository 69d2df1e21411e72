use crate::command::MmcCommand;
use crate::error::HostError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostCaps {
    /// Commands travel over SPI framing rather than the native SD bus.
    pub spi_mode: bool,
    /// The host can drive a 4-bit data bus.
    pub wide_bus: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
}

/// Events a host reports about its slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardEvent {
    Detected,
    Removed,
}

/// Operations a host controller offers to the card layer.
///
/// `request` runs one command; the data phase of a block command follows in
/// `read_blocks`/`write_blocks`, bracketed by `select`/`deselect`. Block
/// transfers return the number of 512-byte blocks moved.
#[allow(async_fn_in_trait)]
pub trait MmcHost {
    fn capabilities(&self) -> HostCaps;

    fn is_card_present(&mut self) -> Result<bool, HostError>;

    async fn initialise(&mut self) -> Result<(), HostError>;

    async fn request(&mut self, command: &mut MmcCommand) -> Result<(), HostError>;

    async fn read_blocks(&mut self, buf: &mut [u8]) -> Result<usize, HostError>;

    async fn write_blocks(&mut self, buf: &[u8], multi: bool) -> Result<usize, HostError>;

    async fn set_bus_width(&mut self, _width: BusWidth) -> Result<(), HostError> {
        Ok(())
    }

    fn select(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), HostError> {
        Ok(())
    }
}

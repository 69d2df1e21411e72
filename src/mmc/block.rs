use fullfat::BlockDevice;
use sdcard::{CardError, MmcHost, SdCard, SD_BLOCK_SIZE};

/// A ready card seen as raw sector storage.
pub struct MmcBlockDevice<'a, H: MmcHost> {
    card: &'a mut SdCard<H>,
    blocks: u32,
}

impl<'a, H: MmcHost> MmcBlockDevice<'a, H> {
    /// `None` unless the card finished bring-up.
    pub fn new(card: &'a mut SdCard<H>) -> Option<Self> {
        let blocks = card.info()?.block_count();
        Some(Self { card, blocks })
    }

    pub fn card(&self) -> &SdCard<H> {
        self.card
    }
}

impl<H: MmcHost> BlockDevice for MmcBlockDevice<'_, H> {
    type Error = CardError;

    fn block_size(&self) -> usize {
        SD_BLOCK_SIZE
    }

    fn block_count(&self) -> u32 {
        self.blocks
    }

    async fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, CardError> {
        self.card.read_blocks(lba, buf).await
    }

    async fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<usize, CardError> {
        self.card.write_blocks(lba, buf).await
    }
}

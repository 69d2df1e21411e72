use crate::SECTOR_SIZE;

/// Raw sector storage underneath a volume.
///
/// Buffers are always whole sectors; the returned count is the number of
/// sectors transferred.
#[allow(async_fn_in_trait)]
pub trait BlockDevice {
    type Error: core::fmt::Debug;

    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn block_count(&self) -> u32;

    async fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, Self::Error>;

    async fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<usize, Self::Error>;
}

impl<T: BlockDevice> BlockDevice for &mut T {
    type Error = T::Error;

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn block_count(&self) -> u32 {
        (**self).block_count()
    }

    async fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).read_blocks(lba, buf).await
    }

    async fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<usize, Self::Error> {
        (**self).write_blocks(lba, buf).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryDiskError {
    OutOfRange { lba: u32, blocks: usize },
    Misaligned(usize),
}

/// A RAM-backed block device over a caller-owned byte slice.
pub struct MemoryDisk<'a> {
    data: &'a mut [u8],
}

impl<'a> MemoryDisk<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data
    }

    fn span(&self, lba: u32, len: usize) -> Result<core::ops::Range<usize>, MemoryDiskError> {
        if len % SECTOR_SIZE != 0 {
            return Err(MemoryDiskError::Misaligned(len));
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start + len;
        if end > self.data.len() {
            return Err(MemoryDiskError::OutOfRange {
                lba,
                blocks: len / SECTOR_SIZE,
            });
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDisk<'_> {
    type Error = MemoryDiskError;

    fn block_count(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }

    async fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let span = self.span(lba, buf.len())?;
        buf.copy_from_slice(&self.data[span]);
        Ok(buf.len() / SECTOR_SIZE)
    }

    async fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<usize, Self::Error> {
        let span = self.span(lba, buf.len())?;
        self.data[span].copy_from_slice(buf);
        Ok(buf.len() / SECTOR_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn memory_disk_rejects_out_of_range() {
        let mut backing = [0u8; SECTOR_SIZE * 2];
        let mut disk = MemoryDisk::new(&mut backing);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.block_count(), 2);
        assert!(block_on(disk.read_blocks(1, &mut buf)).is_ok());
        assert_eq!(
            block_on(disk.read_blocks(2, &mut buf)),
            Err(MemoryDiskError::OutOfRange { lba: 2, blocks: 1 })
        );
        assert_eq!(
            block_on(disk.write_blocks(0, &buf[..100])),
            Err(MemoryDiskError::Misaligned(100))
        );
    }
}

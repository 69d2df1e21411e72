use super::{File, OpenMode, SeekFrom};
use crate::cache::LeaseMode;
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::SECTOR_SIZE;

impl<D: BlockDevice> File<'_, D> {
    pub fn tell(&self) -> u32 {
        self.pointer
    }

    pub fn is_eof(&self) -> bool {
        self.pointer >= self.size
    }

    pub fn bytes_left(&self) -> u32 {
        self.size.saturating_sub(self.pointer)
    }

    /// Brings `addr_current_cluster` in line with the file pointer, walking
    /// forward when possible and from the first cluster otherwise.
    async fn set_cluster(&mut self) -> Result<(), FatError> {
        let target = self.pointer / self.vol.part.cluster_bytes();
        if target == self.current_cluster && self.addr_current_cluster != 0 {
            return Ok(());
        }
        self.addr_current_cluster = if target > self.current_cluster && self.addr_current_cluster != 0 {
            self.vol.traverse(self.addr_current_cluster, target - self.current_cluster).await?
        } else {
            self.vol.traverse(self.object_cluster, target).await?
        };
        self.current_cluster = target;
        Ok(())
    }

    /// Number of physically consecutive clusters from the current one, at most `limit`.
    async fn sequential_clusters(&self, limit: u32) -> Result<u32, FatError> {
        let mut cluster = self.addr_current_cluster;
        let mut run = 1;
        while run < limit {
            let next = self.vol.get_entry(cluster).await?;
            if next != cluster + 1 {
                break;
            }
            cluster = next;
            run += 1;
        }
        Ok(run)
    }

    fn skip_clusters(&mut self, run: u32) {
        // Run members are consecutive, so the last one is a plain offset.
        self.addr_current_cluster += run - 1;
        self.current_cluster += run - 1;
    }

    /// Makes the chain cover `bytes + 1` bytes, rolling back on failure.
    async fn extend_file(&mut self, bytes: u64) -> Result<(), FatError> {
        let cluster_bytes = self.vol.part.cluster_bytes() as u64;
        let needed = (bytes + 1).div_ceil(cluster_bytes) as u32;
        if self.chain_len >= needed {
            return Ok(());
        }
        let _fat = self.vol.fat_lock.lock().await;
        if self.object_cluster == 0 {
            let first = self.vol.link_free_cluster(0).await?;
            self.object_cluster = first;
            self.end_cluster = first;
            self.addr_current_cluster = first;
            self.current_cluster = 0;
            self.chain_len = 1;
            self.written = true;
        }
        let tail = self.end_cluster;
        let mut added = 0u32;
        while self.chain_len < needed {
            match self.vol.link_free_cluster(self.end_cluster).await {
                Ok(next) => {
                    self.end_cluster = next;
                    self.chain_len += 1;
                    added += 1;
                }
                Err(err) => {
                    if added > 0 {
                        self.vol.unlink_chain_locked(tail, true).await?;
                        self.chain_len -= added;
                        self.end_cluster = tail;
                    }
                    log::warn!("fullfat: extend_file_failed wanted={} have={}", needed, self.chain_len);
                    return Err(FatError::new(err.kind(), FatOp::ExtendFile));
                }
            }
        }
        Ok(())
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FatError> {
        self.vol.files.check(self.id, FatOp::Read)?;
        if !self.mode.contains(OpenMode::READ) {
            return Err(FatErrorKind::NotOpenedInReadMode.at(FatOp::Read));
        }
        let len = buf.len().min(self.bytes_left() as usize);
        let cluster_bytes = self.vol.part.cluster_bytes() as usize;
        let mut done = 0usize;
        while done < len {
            self.set_cluster().await?;
            let in_cluster = self.pointer as usize % cluster_bytes;
            let in_sector = self.pointer as usize % SECTOR_SIZE;
            let lba = self.vol.part.cluster_to_lba(self.addr_current_cluster) + (in_cluster / SECTOR_SIZE) as u32;
            let remaining = len - done;

            let take = if in_sector != 0 || remaining < SECTOR_SIZE {
                let take = remaining.min(SECTOR_SIZE - in_sector);
                let sector = self.vol.cache.lend(lba, LeaseMode::Read).await?;
                buf[done..done + take].copy_from_slice(&sector.bytes()[in_sector..in_sector + take]);
                take
            } else if in_cluster == 0 && remaining >= cluster_bytes {
                let run = self.sequential_clusters((remaining / cluster_bytes) as u32).await?;
                let take = run as usize * cluster_bytes;
                self.vol.cache.read_blocks(lba, &mut buf[done..done + take]).await?;
                self.skip_clusters(run);
                take
            } else {
                let take = (remaining / SECTOR_SIZE).min((cluster_bytes - in_cluster) / SECTOR_SIZE) * SECTOR_SIZE;
                self.vol.cache.read_blocks(lba, &mut buf[done..done + take]).await?;
                take
            };
            done += take;
            self.pointer += take as u32;
        }
        Ok(done)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, FatError> {
        self.vol.files.check(self.id, FatOp::Write)?;
        if !self.mode.is_writable() {
            return Err(FatErrorKind::NotOpenedInWriteMode.at(FatOp::Write));
        }
        if data.is_empty() {
            return Ok(0);
        }
        if self.mode.contains(OpenMode::APPEND) {
            self.pointer = self.size;
        }
        let end = self.pointer as u64 + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(FatErrorKind::FileTooLarge.at(FatOp::Write));
        }
        self.extend_file(end).await?;
        self.written = true;

        let cluster_bytes = self.vol.part.cluster_bytes() as usize;
        let mut done = 0usize;
        while done < data.len() {
            self.set_cluster().await?;
            let in_cluster = self.pointer as usize % cluster_bytes;
            let in_sector = self.pointer as usize % SECTOR_SIZE;
            let lba = self.vol.part.cluster_to_lba(self.addr_current_cluster) + (in_cluster / SECTOR_SIZE) as u32;
            let remaining = data.len() - done;

            let take = if in_sector != 0 || remaining < SECTOR_SIZE {
                let take = remaining.min(SECTOR_SIZE - in_sector);
                let fresh = in_sector == 0 && self.pointer >= self.size;
                let mode = if fresh { LeaseMode::WriteOnly } else { LeaseMode::Write };
                let mut sector = self.vol.cache.lend(lba, mode).await?;
                sector.bytes_mut()[in_sector..in_sector + take].copy_from_slice(&data[done..done + take]);
                take
            } else if in_cluster == 0 && remaining >= cluster_bytes {
                let run = self.sequential_clusters((remaining / cluster_bytes) as u32).await?;
                let take = run as usize * cluster_bytes;
                self.vol.cache.write_blocks(lba, &data[done..done + take]).await?;
                self.skip_clusters(run);
                take
            } else {
                let take = (remaining / SECTOR_SIZE).min((cluster_bytes - in_cluster) / SECTOR_SIZE) * SECTOR_SIZE;
                self.vol.cache.write_blocks(lba, &data[done..done + take]).await?;
                take
            };
            done += take;
            self.pointer += take as u32;
            if self.pointer > self.size {
                self.size = self.pointer;
            }
        }
        Ok(done)
    }

    /// Next byte, or `None` at end of file.
    pub async fn getc(&mut self) -> Result<Option<u8>, FatError> {
        let mut byte = [0u8; 1];
        Ok(match self.read(&mut byte).await? {
            0 => None,
            _ => Some(byte[0]),
        })
    }

    pub async fn putc(&mut self, byte: u8) -> Result<(), FatError> {
        self.write(&[byte]).await.map(|_| ())
    }

    /// Reads one line into `buf` without its terminator; `\r` is dropped.
    /// Stops early when `buf` is full. `None` once nothing is left to read.
    pub async fn get_line(&mut self, buf: &mut [u8]) -> Result<Option<usize>, FatError> {
        if self.is_eof() {
            self.vol.files.check(self.id, FatOp::Read)?;
            return Ok(None);
        }
        let mut len = 0usize;
        while len < buf.len() {
            match self.getc().await? {
                None | Some(b'\n') => break,
                Some(b'\r') => {}
                Some(byte) => {
                    buf[len] = byte;
                    len += 1;
                }
            }
        }
        Ok(Some(len))
    }

    /// Moves the file pointer after writing back cached sectors. The target
    /// must lie within `0..=size`.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u32, FatError> {
        self.vol.files.check(self.id, FatOp::Seek)?;
        self.vol.flush().await?;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pointer as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if target < 0 || target > self.size as i64 {
            return Err(FatErrorKind::InvalidSeek.at(FatOp::Seek));
        }
        self.pointer = target as u32;
        Ok(self.pointer)
    }
}

//! Filesystem plugin boundary. FullFAT errors are translated to [`BtError`]
//! here and nowhere else.

use fullfat::{BlockDevice, DirEntry, File, OpenMode, Volume, VolumeConfig};

use crate::error::BtError;

/// A mounted FAT volume as the rest of the system uses it.
pub struct FatFs<D: BlockDevice> {
    volume: Volume<D>,
}

impl<D: BlockDevice> FatFs<D> {
    pub async fn mount(device: D, config: VolumeConfig) -> Result<Self, BtError> {
        let volume = Volume::mount(device, config).await.map_err(|err| {
            log::warn!("fs: mount_failed err={:?}", err);
            BtError::from(err)
        })?;
        Ok(Self { volume })
    }

    /// Flushes and hands the device back. Refused while files are open.
    pub async fn unmount(self) -> Result<D, BtError> {
        Ok(self.volume.unmount().await?)
    }

    pub fn volume(&self) -> &Volume<D> {
        &self.volume
    }

    pub async fn open(&self, path: &str, mode: &str) -> Result<File<'_, D>, BtError> {
        let mode = OpenMode::parse(mode)?;
        Ok(self.volume.open(path, mode).await?)
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), BtError> {
        self.volume.mkdir(path).await?;
        Ok(())
    }

    /// Removes a file or an empty directory, whichever `path` names.
    pub async fn unlink(&self, path: &str) -> Result<(), BtError> {
        let entry = self.stat(path).await?;
        if entry.is_dir() {
            self.volume.rm_dir(path).await?;
        } else {
            self.volume.rm_file(path).await?;
        }
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), BtError> {
        self.volume.move_entry(from, to).await?;
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> Result<DirEntry, BtError> {
        self.volume.find_entry(path).await?.ok_or(BtError::NotFound)
    }

    pub async fn sync(&self) -> Result<(), BtError> {
        Ok(self.volume.flush().await?)
    }

    /// Marks every open handle stale after the medium went away.
    pub async fn media_removed(&self) {
        self.volume.invalidate().await;
    }

    pub fn free_bytes(&self) -> u64 {
        self.volume.free_bytes()
    }
}

use super::OpenMode;
use crate::dir::{
    set_raw_accessed, set_raw_cluster, set_raw_created, set_raw_modified, split_path, DirCursor, DirEntry, NewEntry,
    ATTR_DIRECTORY,
};
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::time::{DateTime, TimeFields};
use crate::volume::Volume;

impl<D: BlockDevice> Volume<D> {
    async fn existing_entry(&self, path: &str, missing: FatErrorKind, op: FatOp) -> Result<DirEntry, FatError> {
        self.find_entry(path)
            .await
            .map_err(|err| FatError::new(err.kind(), op))?
            .ok_or(missing.at(op))
    }

    /// Deletes a file. Fails like a write-mode open would: read-only, directory
    /// or already-open files are refused.
    pub async fn rm_file(&self, path: &str) -> Result<(), FatError> {
        let file = self
            .open(path, OpenMode::WRITE)
            .await
            .map_err(|err| FatError::new(err.kind(), FatOp::RmFile))?;
        let (dir_cluster, dir_entry, cluster) = (file.dir_cluster, file.dir_entry, file.object_cluster);
        let removed = async {
            {
                let _dir = self.dir_lock.lock().await;
                self.remove_dirent_locked(dir_cluster, dir_entry).await?;
            }
            if self.part.is_valid_cluster(cluster) {
                self.unlink_chain(cluster, false).await?;
            }
            self.flush().await
        }
        .await;
        drop(file);
        log::info!("fullfat: rm_file path={} ok={}", path, removed.is_ok());
        removed
    }

    /// Deletes an empty directory.
    pub async fn rm_dir(&self, path: &str) -> Result<(), FatError> {
        let op = FatOp::RmDir;
        let entry = self.existing_entry(path, FatErrorKind::FileNotFound, op).await?;
        if !entry.is_dir() {
            return Err(FatErrorKind::NotADirectory.at(op));
        }
        let cluster = self.part.resolve_dir_cluster(entry.cluster);
        if !self.is_dir_empty(cluster).await? {
            return Err(FatErrorKind::DirNotEmpty.at(op));
        }
        {
            let _dir = self.dir_lock.lock().await;
            self.remove_dirent_locked(entry.dir_cluster, entry.index).await?;
        }
        if self.part.is_valid_cluster(cluster) {
            self.unlink_chain(cluster, false).await?;
        }
        self.flush().await?;
        log::info!("fullfat: rm_dir path={} cluster={}", path, cluster);
        Ok(())
    }

    /// True when `ancestor` is `dir` or one of its parents.
    async fn is_within(&self, dir: u32, ancestor: u32) -> Result<bool, FatError> {
        let root = self.part.root_dir_cluster;
        let mut current = dir;
        for _ in 0..self.part.num_clusters {
            if current == ancestor {
                return Ok(true);
            }
            if current == root {
                return Ok(false);
            }
            match self.find_entry_in_dir(current, "..", ATTR_DIRECTORY).await? {
                Some(parent) => current = self.part.resolve_dir_cluster(parent.cluster),
                None => return Ok(false),
            }
        }
        Err(FatErrorKind::CorruptChain.at(FatOp::Move))
    }

    /// Moves or renames a file or directory. The destination must not exist.
    pub async fn move_entry(&self, source: &str, destination: &str) -> Result<DirEntry, FatError> {
        let op = FatOp::Move;
        let entry = self.existing_entry(source, FatErrorKind::SourceNotFound, op).await?;
        if self.files.is_open(entry.dir_cluster, entry.index) {
            return Err(FatErrorKind::FileAlreadyOpen.at(op));
        }
        let (parent, name) = split_path(destination.trim_end_matches(['/', '\\']));
        let target_dir = self.find_dir(parent).await?;
        if self.find_entry_in_dir(target_dir, name, 0).await?.is_some() {
            return Err(FatErrorKind::DestinationExists.at(op));
        }
        let moved_dir = entry.is_dir().then(|| self.part.resolve_dir_cluster(entry.cluster));
        if let Some(moved) = moved_dir {
            if self.is_within(target_dir, moved).await? {
                return Err(FatErrorKind::InvalidPath.at(op));
            }
        }

        let _dir = self.dir_lock.lock().await;
        let mut source_cursor = DirCursor::new(self, entry.dir_cluster).await?;
        let old = source_cursor.fetch(self, entry.index).await?;
        let new = NewEntry {
            name,
            attr: entry.attr,
            cluster: entry.cluster,
            size: entry.size,
            at: entry.created,
        };
        let created = self.create_dirent_locked(target_dir, &new).await?;

        let mut target_cursor = DirCursor::new(self, target_dir).await?;
        let mut raw = target_cursor.fetch(self, created.index).await?;
        raw[13..].copy_from_slice(&old[13..]);
        target_cursor.push(self, created.index, &raw).await?;
        self.remove_dirent_locked(entry.dir_cluster, entry.index).await?;

        if let Some(moved) = moved_dir {
            let mut cursor = DirCursor::new(self, moved).await?;
            let mut up = cursor.fetch(self, 1).await?;
            if &up[..2] == b".." {
                let parent = if target_dir == self.part.root_dir_cluster { 0 } else { target_dir };
                set_raw_cluster(&mut up, parent);
                cursor.push(self, 1, &up).await?;
            }
        }
        self.flush().await?;
        log::info!("fullfat: move from={} to={}", source, destination);
        Ok(created)
    }

    /// Stamps the selected time fields of the entry at `path`.
    pub async fn set_time(&self, path: &str, at: DateTime, fields: TimeFields) -> Result<(), FatError> {
        let op = FatOp::SetTime;
        let entry = self.existing_entry(path, FatErrorKind::FileNotFound, op).await?;
        let _dir = self.dir_lock.lock().await;
        let mut cursor = DirCursor::new(self, entry.dir_cluster).await?;
        let mut raw = cursor.fetch(self, entry.index).await?;
        if fields.contains(TimeFields::CREATED) {
            set_raw_created(&mut raw, at);
        }
        if fields.contains(TimeFields::MODIFIED) {
            set_raw_modified(&mut raw, at);
        }
        if fields.contains(TimeFields::ACCESSED) {
            set_raw_accessed(&mut raw, at);
        }
        cursor.push(self, entry.index, &raw).await?;
        self.flush().await
    }
}

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use heapless::Vec;

use crate::config::MAX_OPEN_FILES;
use crate::error::{FatError, FatErrorKind, FatOp};

#[derive(Clone, Copy, Debug)]
struct OpenRecord {
    id: u32,
    dir_cluster: u32,
    dir_entry: u32,
    writable: bool,
    valid: bool,
}

/// Handles currently open on a volume, keyed by the location of their
/// directory entry.
pub(crate) struct OpenFiles {
    records: Mutex<CriticalSectionRawMutex, RefCell<Vec<OpenRecord, MAX_OPEN_FILES>>>,
    next_id: AtomicU32,
}

impl OpenFiles {
    pub(crate) const fn new() -> Self {
        Self {
            records: Mutex::new(RefCell::new(Vec::new())),
            next_id: AtomicU32::new(1),
        }
    }

    /// A writer excludes every other handle on the same entry; readers share.
    pub(crate) fn register(&self, dir_cluster: u32, dir_entry: u32, writable: bool) -> Result<u32, FatError> {
        self.records.lock(|records| {
            let mut records = records.borrow_mut();
            let conflict = records
                .iter()
                .any(|r| r.dir_cluster == dir_cluster && r.dir_entry == dir_entry && (r.writable || writable));
            if conflict {
                return Err(FatErrorKind::FileAlreadyOpen.at(FatOp::Open));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            records
                .push(OpenRecord {
                    id,
                    dir_cluster,
                    dir_entry,
                    writable,
                    valid: true,
                })
                .map_err(|_| FatErrorKind::TooManyOpenFiles.at(FatOp::Open))?;
            Ok(id)
        })
    }

    pub(crate) fn release(&self, id: u32) {
        self.records.lock(|records| {
            records.borrow_mut().retain(|r| r.id != id);
        });
    }

    pub(crate) fn check(&self, id: u32, op: FatOp) -> Result<(), FatError> {
        self.records.lock(|records| match records.borrow().iter().find(|r| r.id == id) {
            None => Err(FatErrorKind::BadHandle.at(op)),
            Some(record) if !record.valid => Err(FatErrorKind::MediaRemoved.at(op)),
            Some(_) => Ok(()),
        })
    }

    pub(crate) fn is_open(&self, dir_cluster: u32, dir_entry: u32) -> bool {
        self.records.lock(|records| {
            records
                .borrow()
                .iter()
                .any(|r| r.dir_cluster == dir_cluster && r.dir_entry == dir_entry)
        })
    }

    /// Marks every handle stale. Returns how many there were.
    pub(crate) fn invalidate_all(&self) -> usize {
        self.records.lock(|records| {
            let mut records = records.borrow_mut();
            for record in records.iter_mut() {
                record.valid = false;
            }
            records.len()
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock(|records| records.borrow().len())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_exclude_everyone() {
        let files = OpenFiles::new();
        let reader = files.register(2, 5, false).unwrap();
        files.register(2, 5, false).unwrap();
        assert_eq!(
            files.register(2, 5, true).unwrap_err().kind(),
            FatErrorKind::FileAlreadyOpen
        );
        files.register(2, 6, true).unwrap();
        assert_eq!(
            files.register(2, 6, false).unwrap_err().kind(),
            FatErrorKind::FileAlreadyOpen
        );
        files.release(reader);
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn table_is_bounded() {
        let files = OpenFiles::new();
        for entry in 0..MAX_OPEN_FILES as u32 {
            files.register(2, entry, false).unwrap();
        }
        assert_eq!(
            files.register(2, 99, false).unwrap_err().kind(),
            FatErrorKind::TooManyOpenFiles
        );
    }

    #[test]
    fn invalidated_handles_report_media_removed() {
        let files = OpenFiles::new();
        let id = files.register(3, 0, true).unwrap();
        assert_eq!(files.invalidate_all(), 1);
        assert_eq!(files.check(id, FatOp::Read).unwrap_err().kind(), FatErrorKind::MediaRemoved);
        files.release(id);
        assert_eq!(files.check(id, FatOp::Read).unwrap_err().kind(), FatErrorKind::BadHandle);
        assert!(files.is_empty());
    }
}

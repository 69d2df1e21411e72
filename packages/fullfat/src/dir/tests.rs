use core::cell::Cell;

use embassy_futures::block_on;

use super::names::short_name_checksum;
use super::{DirCursor, NewEntry, ATTR_ARCHIVE, ATTR_DIRECTORY, DELETED};
use crate::config::VolumeConfig;
use crate::device::{BlockDevice, MemoryDisk, MemoryDiskError};
use crate::error::FatErrorKind;
use crate::test_support::{fat12_image, fat16_image, fat32_image, fill_root, fill_volume, mount};
use crate::time::DateTime;
use crate::volume::Volume;

async fn names_in<D: BlockDevice>(vol: &Volume<D>, pattern: &str) -> Vec<String> {
    let mut iter = vol.read_dir(pattern).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = iter.next_entry().await.unwrap() {
        names.push(entry.name().to_string());
    }
    names
}

/// Memory disk whose reads of one sector fail.
struct FlakyDisk<'a> {
    disk: MemoryDisk<'a>,
    bad_lba: &'a Cell<u32>,
}

impl BlockDevice for FlakyDisk<'_> {
    type Error = MemoryDiskError;

    fn block_count(&self) -> u32 {
        self.disk.block_count()
    }

    async fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if lba == self.bad_lba.get() {
            return Err(MemoryDiskError::OutOfRange { lba, blocks: 1 });
        }
        self.disk.read_blocks(lba, buf).await
    }

    async fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<usize, Self::Error> {
        self.disk.write_blocks(lba, buf).await
    }
}

fn file(name: &str) -> NewEntry<'_> {
    NewEntry {
        name,
        attr: ATTR_ARCHIVE,
        cluster: 0,
        size: 0,
        at: DateTime::FAT_EPOCH,
    }
}

#[test]
fn long_names_come_back_from_lookup() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    let names = [
        "Quarterly Report (final).pdf",
        "a",
        "MixedCase.Txt",
        "exactly-thirteen",
        "name with spaces and a rather long tail that spans several fragments.dat",
        "ünïcode ☃.txt",
    ];
    block_on(async {
        for name in names {
            vol.create_dirent(root, &file(name)).await.unwrap();
        }
        for name in names {
            let found = vol.find_entry_in_dir(root, name, 0).await.unwrap().unwrap();
            assert_eq!(found.name(), name);
            assert_eq!(found.attributes(), ATTR_ARCHIVE);
        }
        let upper = vol.find_entry_in_dir(root, "MIXEDCASE.TXT", 0).await.unwrap();
        assert!(upper.is_some());
    });
}

#[test]
fn plain_short_names_skip_long_entries() {
    let mut image = fat16_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        let upper = vol.create_dirent(root, &file("README.TXT")).await.unwrap();
        let lower = vol.create_dirent(root, &file("notes.md")).await.unwrap();
        assert!(!upper.has_long_name());
        assert!(!lower.has_long_name());
        assert_eq!(lower.short_name(), b"NOTES   MD ");

        let found = vol.find_entry_in_dir(root, "readme.txt", 0).await.unwrap().unwrap();
        assert_eq!(found.name(), "readme.txt");
        assert_eq!(found.index(), 0);
        assert_eq!(vol.find_entry_in_dir(root, "notes.md", 0).await.unwrap().unwrap().index(), 1);
    });
}

#[test]
fn colliding_aliases_get_distinct_suffixes() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        let one = vol.create_dirent(root, &file("Long Name One.txt")).await.unwrap();
        let two = vol.create_dirent(root, &file("Long Name Two.txt")).await.unwrap();
        assert_eq!(one.short_name(), b"LONGNA~1TXT");
        assert_eq!(two.short_name(), b"LONGNA~2TXT");
        let by_alias = vol.find_entry_in_dir(root, "longna~2.txt", 0).await.unwrap().unwrap();
        assert_eq!(by_alias.name(), "Long Name Two.txt");
    });
}

#[test]
fn duplicates_and_bad_names_are_refused() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        vol.create_dirent(root, &file("Data.bin")).await.unwrap();
        let err = vol.create_dirent(root, &file("DATA.BIN")).await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::ObjectExists);
        let err = vol.create_dirent(root, &file("what?.txt")).await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::InvalidName);
        let long = "x".repeat(256);
        let err = vol.create_dirent(root, &file(&long)).await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::NameTooLong);
    });
}

#[test]
fn checksum_mismatch_falls_back_to_short_name() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        let entry = vol.create_dirent(root, &file("Broken Group.txt")).await.unwrap();
        assert_eq!(entry.index(), 2);
        let mut cursor = DirCursor::new(&vol, root).await.unwrap();
        let mut slot = cursor.fetch(&vol, 1).await.unwrap();
        assert_eq!(slot[13], short_name_checksum(entry.short_name()));
        slot[13] ^= 0xFF;
        cursor.push(&vol, 1, &slot).await.unwrap();

        let found = vol.find_entry_in_dir(root, "broken~1.txt", 0).await.unwrap().unwrap();
        assert!(!found.has_long_name());
        assert!(vol.find_entry_in_dir(root, "Broken Group.txt", 0).await.unwrap().is_none());
    });
}

#[test]
fn fixed_root_cannot_grow() {
    let mut image = fat12_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    let slots = vol.partition().root_entries;
    block_on(async {
        let mut name = String::new();
        for n in 0..slots {
            name.clear();
            name.push_str(&format!("F{n}.BIN"));
            vol.create_dirent(root, &file(&name)).await.unwrap();
        }
        let err = vol.create_dirent(root, &file("LAST.BIN")).await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::CantExtendRootDir);
        let err = vol.extend_directory(root).await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::CantExtendRootDir);
    });
}

#[test]
fn chained_directory_grows_by_zeroed_clusters() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    let per_cluster = vol.partition().sectors_per_cluster * 16;
    block_on(async {
        let free = vol.free_clusters();
        for n in 0..per_cluster + 3 {
            vol.create_dirent(root, &file(&format!("G{n}.DAT"))).await.unwrap();
        }
        assert_eq!(vol.chain_length(root).await.unwrap().0, 2);
        assert_eq!(vol.free_clusters(), free - 1);
        let last = vol.find_entry_in_dir(root, "g130.dat", 0).await.unwrap().unwrap();
        assert_eq!(last.index(), per_cluster + 2);
    });
}

#[test]
fn deleted_slots_are_reused_for_whole_groups() {
    let mut image = fat16_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        let gone = vol.create_dirent(root, &file("First long file.txt")).await.unwrap();
        vol.create_dirent(root, &file("KEEP.TXT")).await.unwrap();
        {
            let _dir = vol.dir_lock.lock().await;
            vol.remove_dirent_locked(root, gone.index()).await.unwrap();
        }
        let mut cursor = DirCursor::new(&vol, root).await.unwrap();
        for index in 0..=gone.index() {
            assert_eq!(cursor.fetch(&vol, index).await.unwrap()[0], DELETED);
        }
        assert!(vol.find_entry_in_dir(root, "First long file.txt", 0).await.unwrap().is_none());

        let reused = vol.create_dirent(root, &file("Second one.txt")).await.unwrap();
        assert_eq!(reused.index(), gone.index());
        let tail = vol.create_dirent(root, &file("Much longer than the first.txt")).await.unwrap();
        assert!(tail.index() > gone.index() + 1);
    });
}

#[test]
fn mkdir_links_parent_and_resolves_paths() {
    let mut image = fat16_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        let docs = vol.mkdir("/docs").await.unwrap();
        let deep = vol.mkdir("/docs/Deeper Level").await.unwrap();
        assert!(docs.is_dir());

        assert_eq!(vol.find_dir("/").await.unwrap(), root);
        assert_eq!(vol.find_dir("/docs").await.unwrap(), docs.first_cluster());
        assert_eq!(vol.find_dir("\\DOCS\\deeper level\\").await.unwrap(), deep.first_cluster());
        assert_eq!(vol.find_dir("/docs/Deeper Level/..").await.unwrap(), docs.first_cluster());
        assert_eq!(vol.find_dir("/docs/..").await.unwrap(), root);
        let err = vol.find_dir("/nothing/here").await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::InvalidPath);

        assert!(vol.is_dir_empty(deep.first_cluster()).await.unwrap());
        assert!(!vol.is_dir_empty(docs.first_cluster()).await.unwrap());
        let err = vol.mkdir("/docs").await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::ObjectExists);
    });
}

#[test]
fn listing_filters_with_wildcards() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        for name in ["alpha.txt", "beta.txt", "gamma.log", "Delta Notes.txt"] {
            vol.create_dirent(root, &file(name)).await.unwrap();
        }
        vol.mkdir("/sub").await.unwrap();

        assert_eq!(names_in(&vol, "/").await, ["alpha.txt", "beta.txt", "gamma.log", "Delta Notes.txt", "sub"]);
        assert_eq!(names_in(&vol, "/*.txt").await, ["alpha.txt", "beta.txt", "Delta Notes.txt"]);
        assert_eq!(names_in(&vol, "/*.txt:").await, ["gamma.log", "sub"]);
        assert_eq!(names_in(&vol, "/sub/").await, [".", ".."]);
        let dirs: Vec<bool> = {
            let mut iter = vol.read_dir("/s*").await.unwrap();
            let mut dirs = Vec::new();
            while let Some(entry) = iter.next_entry().await.unwrap() {
                dirs.push(entry.attributes() & ATTR_DIRECTORY != 0);
            }
            dirs
        };
        assert_eq!(dirs, [true]);
    });
}

#[test]
fn non_ascii_long_names_use_utf16_limit() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    let widest = "字".repeat(255);
    let mixed = format!("{}.текст", "ß".repeat(100));
    block_on(async {
        for name in [widest.as_str(), mixed.as_str()] {
            vol.create_dirent(root, &file(name)).await.unwrap();
            let found = vol.find_entry_in_dir(root, name, 0).await.unwrap().unwrap();
            assert_eq!(found.name(), name);
        }
        let listed = names_in(&vol, "/").await;
        assert_eq!(listed, [widest.clone(), mixed.clone()]);

        let over = "字".repeat(256);
        let err = vol.create_dirent(root, &file(&over)).await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::NameTooLong);
    });
}

#[test]
fn removal_keeps_long_entries_of_another_name() {
    let mut image = fat16_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        let entry = vol.create_dirent(root, &file("Stray Group.txt")).await.unwrap();
        assert_eq!(entry.index(), 2);
        let mut cursor = DirCursor::new(&vol, root).await.unwrap();
        let mut short = cursor.fetch(&vol, entry.index()).await.unwrap();
        short[..11].copy_from_slice(b"PLAIN   TXT");
        cursor.push(&vol, entry.index(), &short).await.unwrap();
        {
            let _dir = vol.dir_lock.lock().await;
            vol.remove_dirent_locked(root, entry.index()).await.unwrap();
        }
        assert_eq!(cursor.fetch(&vol, 2).await.unwrap()[0], DELETED);
        for index in 0..2 {
            assert_ne!(cursor.fetch(&vol, index).await.unwrap()[0], DELETED);
        }
    });
}

#[test]
fn removal_stops_at_out_of_order_long_entries() {
    let mut image = fat16_image();
    let vol = mount(&mut image);
    let root = vol.partition().root_dir_cluster;
    block_on(async {
        let entry = vol.create_dirent(root, &file("Ordered Group.txt")).await.unwrap();
        assert_eq!(entry.index(), 2);
        let mut cursor = DirCursor::new(&vol, root).await.unwrap();
        let mut nearest = cursor.fetch(&vol, 1).await.unwrap();
        assert_eq!(nearest[0], 1);
        nearest[0] = 3;
        cursor.push(&vol, 1, &nearest).await.unwrap();
        {
            let _dir = vol.dir_lock.lock().await;
            vol.remove_dirent_locked(root, entry.index()).await.unwrap();
        }
        assert_eq!(cursor.fetch(&vol, 2).await.unwrap()[0], DELETED);
        assert_eq!(cursor.fetch(&vol, 1).await.unwrap()[0], 3);
        assert_ne!(cursor.fetch(&vol, 0).await.unwrap()[0], DELETED);
    });
}

#[test]
fn mkdir_on_full_volume_releases_everything() {
    let mut image = fat32_image();
    let vol = mount(&mut image);
    block_on(async {
        let taken = fill_volume(&vol, 0).await;
        let err = vol.mkdir("/none").await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::NoFreeClusters);
        assert_eq!(vol.free_clusters(), 0);

        fill_root(&vol).await;
        vol.unlink_chain(taken[0], false).await.unwrap();
        let cached = vol.free_clusters();
        let counted = vol.count_free_clusters().await.unwrap();
        assert_eq!((cached, counted), (1, 1));

        let err = vol.mkdir("/Needs Room").await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::NoFreeClusters);
        assert_eq!(vol.free_clusters(), cached);
        assert_eq!(vol.count_free_clusters().await.unwrap(), counted);
        assert!(vol.find_entry("/Needs Room").await.unwrap().is_none());
    });
}

#[test]
fn mkdir_rolls_back_when_dot_entries_fail() {
    let mut image = fat16_image();
    let bad_lba = Cell::new(u32::MAX);
    let disk = FlakyDisk {
        disk: MemoryDisk::new(&mut image),
        bad_lba: &bad_lba,
    };
    let config = VolumeConfig {
        cache_sectors: 1,
        ..VolumeConfig::default()
    };
    let vol = block_on(Volume::mount(disk, config)).unwrap();
    block_on(async {
        let next = vol.create_cluster_chain().await.unwrap();
        vol.unlink_chain(next, false).await.unwrap();
        let free = vol.free_clusters();
        bad_lba.set(vol.partition().cluster_to_lba(next));

        let err = vol.mkdir("/fresh").await.unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::DeviceDriverFailed);
        bad_lba.set(u32::MAX);
        assert!(vol.find_entry("/fresh").await.unwrap().is_none());
        assert_eq!(vol.free_clusters(), free);
        assert_eq!(vol.count_free_clusters().await.unwrap(), free);
        assert_eq!(vol.get_entry(next).await.unwrap(), 0);
    });
}

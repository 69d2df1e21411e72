use embassy_futures::block_on;

use crate::config::VolumeConfig;
use crate::device::{BlockDevice, MemoryDisk};
use crate::dir::{NewEntry, ATTR_ARCHIVE};
use crate::error::FatErrorKind;
use crate::format::{format_partition, FormatOptions};
use crate::partition::FatType;
use crate::time::DateTime;
use crate::volume::Volume;
use crate::SECTOR_SIZE;

pub(crate) fn formatted(sectors: u32, options: FormatOptions) -> Vec<u8> {
    let mut image = vec![0u8; sectors as usize * SECTOR_SIZE];
    block_on(format_partition(&mut MemoryDisk::new(&mut image), options)).unwrap();
    image
}

/// 4 MiB FAT32: 4 reserved sectors, one FAT, 8 sectors per cluster.
pub(crate) fn fat32_image() -> Vec<u8> {
    formatted(
        8192,
        FormatOptions {
            sectors_per_cluster: 8,
            reserved_sectors: Some(4),
            num_fats: 1,
            fat_type: Some(FatType::Fat32),
            ..FormatOptions::default()
        },
    )
}

/// Floppy-sized FAT12 with one sector per cluster and two FAT copies.
pub(crate) fn fat12_image() -> Vec<u8> {
    formatted(
        2880,
        FormatOptions {
            sectors_per_cluster: 1,
            ..FormatOptions::default()
        },
    )
}

pub(crate) fn fat16_image() -> Vec<u8> {
    formatted(
        20_000,
        FormatOptions {
            sectors_per_cluster: 2,
            ..FormatOptions::default()
        },
    )
}

pub(crate) fn mount(image: &mut [u8]) -> Volume<MemoryDisk<'_>> {
    block_on(Volume::mount(MemoryDisk::new(image), VolumeConfig::default())).unwrap()
}

/// Allocates one-cluster chains until only `keep` clusters are free and
/// returns them.
pub(crate) async fn fill_volume<D: BlockDevice>(vol: &Volume<D>, keep: u32) -> Vec<u32> {
    let mut taken = Vec::new();
    while vol.free_clusters() > keep {
        taken.push(vol.create_cluster_chain().await.unwrap());
    }
    assert_eq!(vol.count_free_clusters().await.unwrap(), keep);
    taken
}

/// Adds short-named entries to the root until it needs a cluster the
/// volume no longer has.
pub(crate) async fn fill_root<D: BlockDevice>(vol: &Volume<D>) {
    let root = vol.partition().root_dir_cluster;
    for n in 0.. {
        let name = format!("R{n}.BIN");
        let entry = NewEntry {
            name: &name,
            attr: ATTR_ARCHIVE,
            cluster: 0,
            size: 0,
            at: DateTime::FAT_EPOCH,
        };
        if let Err(err) = vol.create_dirent(root, &entry).await {
            assert_eq!(err.kind(), FatErrorKind::NoFreeClusters);
            return;
        }
    }
}

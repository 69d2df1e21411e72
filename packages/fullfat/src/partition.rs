use crate::bytes::{le_u16, le_u32};
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::SECTOR_SIZE;

pub(crate) const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
pub(crate) const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
pub(crate) const FSINFO_FREE_COUNT: usize = 488;
pub(crate) const FSINFO_NEXT_FREE: usize = 492;
const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Stand-in cluster number for the fixed FAT12/16 root directory region.
pub const FIXED_ROOT_CLUSTER: u32 = 1;

const FAT12_MAX_CLUSTERS: u32 = 4085;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub(crate) fn end_of_chain(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    pub(crate) fn mask(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Byte offset of a cluster's slot from the start of a FAT copy.
    pub(crate) fn entry_offset(self, cluster: u32) -> u32 {
        match self {
            FatType::Fat12 => cluster + cluster / 2,
            FatType::Fat16 => cluster * 2,
            FatType::Fat32 => cluster * 4,
        }
    }

    pub(crate) fn entry_bytes(self) -> usize {
        match self {
            FatType::Fat12 | FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Partition {
    pub fat_type: FatType,
    pub begin_lba: u32,
    pub total_sectors: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub sectors_per_fat: u32,
    pub fat_begin_lba: u32,
    pub root_dir_cluster: u32,
    pub root_dir_lba: u32,
    pub root_dir_sectors: u32,
    pub root_entries: u32,
    pub first_data_lba: u32,
    pub num_clusters: u32,
    pub fsinfo_lba: Option<u32>,
    pub volume_label: [u8; 11],
}

impl Partition {
    pub fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster * SECTOR_SIZE as u32
    }

    /// Clusters 0 and 1 resolve to the root directory region.
    pub fn cluster_to_lba(&self, cluster: u32) -> u32 {
        if cluster > 1 {
            (cluster - 2) * self.sectors_per_cluster + self.first_data_lba
        } else {
            self.root_dir_lba
        }
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.num_clusters + 2
    }

    pub(crate) fn has_fixed_root(&self, dir_cluster: u32) -> bool {
        self.fat_type != FatType::Fat32 && dir_cluster <= FIXED_ROOT_CLUSTER
    }

    /// A `..` entry of 0 means the root directory.
    pub(crate) fn resolve_dir_cluster(&self, cluster: u32) -> u32 {
        if cluster == 0 {
            self.root_dir_cluster
        } else {
            cluster
        }
    }

    pub fn parse(boot: &[u8; SECTOR_SIZE], begin_lba: u32) -> Result<Self, FatError> {
        let invalid = FatErrorKind::InvalidBootSector.at(FatOp::Mount);
        if boot[510] != 0x55 || boot[511] != 0xAA {
            return Err(FatErrorKind::NotFatFormatted.at(FatOp::Mount));
        }

        let bytes_per_sector = le_u16(boot, 11);
        if bytes_per_sector as usize != SECTOR_SIZE {
            return Err(FatErrorKind::UnsupportedSectorSize(bytes_per_sector).at(FatOp::Mount));
        }
        let sectors_per_cluster = boot[13] as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(invalid);
        }
        let reserved_sectors = le_u16(boot, 14) as u32;
        let num_fats = boot[16] as u32;
        if reserved_sectors == 0 || num_fats == 0 {
            return Err(invalid);
        }
        let root_entries = le_u16(boot, 17) as u32;
        let total_16 = le_u16(boot, 19) as u32;
        let total_sectors = if total_16 != 0 { total_16 } else { le_u32(boot, 32) };
        let fat_size_16 = le_u16(boot, 22) as u32;
        let is_fat32_layout = fat_size_16 == 0;
        let sectors_per_fat = if is_fat32_layout { le_u32(boot, 36) } else { fat_size_16 };
        if total_sectors == 0 || sectors_per_fat == 0 {
            return Err(invalid);
        }

        let root_dir_sectors = (root_entries * 32).div_ceil(SECTOR_SIZE as u32);
        let fat_begin_lba = begin_lba + reserved_sectors;
        let root_dir_lba = fat_begin_lba + num_fats * sectors_per_fat;
        let first_data_lba = root_dir_lba + root_dir_sectors;
        let meta = reserved_sectors + num_fats * sectors_per_fat + root_dir_sectors;
        if total_sectors <= meta {
            return Err(invalid);
        }
        let num_clusters = (total_sectors - meta) / sectors_per_cluster;
        if num_clusters == 0 {
            return Err(invalid);
        }

        let (fat_type, root_dir_cluster, fsinfo_lba, label_at) = if is_fat32_layout {
            let root = le_u32(boot, 44);
            if root < 2 || root >= num_clusters + 2 {
                return Err(invalid);
            }
            let fsinfo = le_u16(boot, 48) as u32;
            let fsinfo_lba = if fsinfo != 0 && fsinfo != 0xFFFF && fsinfo < reserved_sectors {
                Some(begin_lba + fsinfo)
            } else {
                None
            };
            (FatType::Fat32, root, fsinfo_lba, 71)
        } else if num_clusters < FAT12_MAX_CLUSTERS {
            (FatType::Fat12, FIXED_ROOT_CLUSTER, None, 43)
        } else {
            (FatType::Fat16, FIXED_ROOT_CLUSTER, None, 43)
        };

        let mut volume_label = [b' '; 11];
        if boot[label_at - 5] == 0x29 {
            volume_label.copy_from_slice(&boot[label_at..label_at + 11]);
        }

        Ok(Self {
            fat_type,
            begin_lba,
            total_sectors,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            fat_begin_lba,
            root_dir_cluster,
            root_dir_lba: if is_fat32_layout { first_data_lba } else { root_dir_lba },
            root_dir_sectors,
            root_entries,
            first_data_lba,
            num_clusters,
            fsinfo_lba,
            volume_label,
        })
    }
}

/// Looks like a partition boot record rather than a master boot record.
pub fn is_boot_record(sector: &[u8; SECTOR_SIZE]) -> bool {
    let jump = (sector[0] == 0xEB && sector[2] == 0x90) || sector[0] == 0xE9;
    jump && (sector[21] & 0xF0) == 0xF0 && sector[510] == 0x55 && sector[511] == 0xAA
}

/// Start LBA of the first FAT partition listed in an MBR.
pub fn first_fat_partition_lba(sector: &[u8; SECTOR_SIZE]) -> Option<u32> {
    if sector[510] != 0x55 || sector[511] != 0xAA {
        return None;
    }
    (0..4).find_map(|i| {
        let base = 446 + i * 16;
        let is_fat = matches!(sector[base + 4], 0x01 | 0x04 | 0x06 | 0x0B | 0x0C | 0x0E);
        let start = le_u32(sector, base + 8);
        (is_fat && start != 0).then_some(start)
    })
}

/// Number of partitions a device sector 0 describes.
pub fn partition_count(sector: &[u8; SECTOR_SIZE]) -> usize {
    if is_boot_record(sector) {
        return 1;
    }
    if sector[510] != 0x55 || sector[511] != 0xAA {
        return 0;
    }
    (0..4)
        .filter(|i| {
            let base = 446 + i * 16;
            sector[base + 4] != 0 && le_u32(sector, base + 8) != 0
        })
        .count()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FsInfo {
    pub free_count: Option<u32>,
    pub next_free: Option<u32>,
}

/// Only the two signatures are checked; the counts themselves are taken on
/// trust apart from the all-ones "unknown" marker.
pub(crate) fn parse_fsinfo(sector: &[u8; SECTOR_SIZE]) -> Option<FsInfo> {
    if le_u32(sector, 0) != FSINFO_LEAD_SIG || le_u32(sector, 484) != FSINFO_STRUCT_SIG {
        return None;
    }
    let known = |value: u32| (value != FSINFO_UNKNOWN).then_some(value);
    Some(FsInfo {
        free_count: known(le_u32(sector, FSINFO_FREE_COUNT)),
        next_free: known(le_u32(sector, FSINFO_NEXT_FREE)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{put_le_u16, put_le_u32};

    fn fat32_boot() -> [u8; SECTOR_SIZE] {
        let mut boot = [0u8; SECTOR_SIZE];
        boot[0] = 0xEB;
        boot[2] = 0x90;
        put_le_u16(&mut boot, 11, 512);
        boot[13] = 8;
        put_le_u16(&mut boot, 14, 4);
        boot[16] = 1;
        boot[21] = 0xF8;
        put_le_u32(&mut boot, 32, 8192);
        put_le_u32(&mut boot, 36, 8);
        put_le_u32(&mut boot, 44, 2);
        put_le_u16(&mut boot, 48, 1);
        boot[510] = 0x55;
        boot[511] = 0xAA;
        boot
    }

    #[test]
    fn parses_fat32_geometry() {
        let part = Partition::parse(&fat32_boot(), 0).unwrap();
        assert_eq!(part.fat_type, FatType::Fat32);
        assert_eq!(part.fat_begin_lba, 4);
        assert_eq!(part.first_data_lba, 12);
        assert_eq!(part.num_clusters, (8192 - 12) / 8);
        assert_eq!(part.cluster_to_lba(2), 12);
        assert_eq!(part.cluster_to_lba(3), 20);
        assert_eq!(part.fsinfo_lba, Some(1));
        assert!(is_boot_record(&fat32_boot()));
    }

    #[test]
    fn small_fat16_layout_is_fat12() {
        let mut boot = fat32_boot();
        put_le_u16(&mut boot, 22, 3);
        put_le_u16(&mut boot, 17, 512);
        put_le_u16(&mut boot, 19, 2880);
        boot[13] = 1;
        let part = Partition::parse(&boot, 0).unwrap();
        assert_eq!(part.fat_type, FatType::Fat12);
        assert_eq!(part.root_dir_sectors, 32);
        assert_eq!(part.root_dir_lba, 7);
        assert_eq!(part.cluster_to_lba(1), 7);
        assert_eq!(part.cluster_to_lba(2), 39);
    }

    #[test]
    fn rejects_layout_without_data_clusters() {
        let mut boot = fat32_boot();
        put_le_u16(&mut boot, 22, 1);
        put_le_u16(&mut boot, 17, 16);
        put_le_u16(&mut boot, 19, 10);
        put_le_u16(&mut boot, 14, 1);
        boot[13] = 8;
        let err = Partition::parse(&boot, 0).unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::InvalidBootSector);
    }

    #[test]
    fn rejects_foreign_sector_size() {
        let mut boot = fat32_boot();
        put_le_u16(&mut boot, 11, 4096);
        let err = Partition::parse(&boot, 0).unwrap_err();
        assert_eq!(err.kind(), FatErrorKind::UnsupportedSectorSize(4096));
    }

    #[test]
    fn finds_first_fat_partition_in_mbr() {
        let mut mbr = [0u8; SECTOR_SIZE];
        mbr[446 + 16 + 4] = 0x0C;
        put_le_u32(&mut mbr, 446 + 16 + 8, 2048);
        mbr[446 + 4] = 0x83;
        put_le_u32(&mut mbr, 446 + 8, 63);
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        assert_eq!(first_fat_partition_lba(&mbr), Some(2048));
        assert_eq!(partition_count(&mbr), 2);
        assert!(!is_boot_record(&mbr));
    }

    #[test]
    fn fsinfo_needs_both_signatures() {
        let mut sector = [0u8; SECTOR_SIZE];
        put_le_u32(&mut sector, 0, FSINFO_LEAD_SIG);
        put_le_u32(&mut sector, FSINFO_FREE_COUNT, 77);
        put_le_u32(&mut sector, FSINFO_NEXT_FREE, FSINFO_UNKNOWN);
        assert_eq!(parse_fsinfo(&sector), None);
        put_le_u32(&mut sector, 484, FSINFO_STRUCT_SIG);
        assert_eq!(
            parse_fsinfo(&sector),
            Some(FsInfo {
                free_count: Some(77),
                next_free: None
            })
        );
    }
}

use crate::bytes::{put_le_u16, put_le_u32};
use crate::device::BlockDevice;
use crate::error::{FatError, FatErrorKind, FatOp};
use crate::partition::{FatType, FSINFO_FREE_COUNT, FSINFO_LEAD_SIG, FSINFO_NEXT_FREE, FSINFO_STRUCT_SIG};
use crate::SECTOR_SIZE;

const ROOT_ENTRIES_FIXED: u32 = 512;
const FAT12_MAX_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65525;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FAT32_BACKUP_BOOT: u32 = 6;
const OEM_NAME: &[u8; 8] = b"FULLFAT2";
const VOLUME_SERIAL: u32 = 0x4655_4C4C;

#[derive(Clone, Copy, Debug)]
pub struct FormatOptions {
    /// First sector of the partition on the device.
    pub begin_lba: u32,
    /// Partition length; the rest of the device when `None`.
    pub total_sectors: Option<u32>,
    pub sectors_per_cluster: u8,
    /// Defaults to 1 for FAT12/16 and 32 for FAT32.
    pub reserved_sectors: Option<u16>,
    pub num_fats: u8,
    /// Chosen from the resulting cluster count when `None`.
    pub fat_type: Option<FatType>,
    pub label: [u8; 11],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            begin_lba: 0,
            total_sectors: None,
            sectors_per_cluster: 8,
            reserved_sectors: None,
            num_fats: 2,
            fat_type: None,
            label: *b"NO NAME    ",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    fat_type: FatType,
    reserved: u32,
    sectors_per_fat: u32,
    root_sectors: u32,
    clusters: u32,
}

fn fat_bytes(fat_type: FatType, entries: u32) -> u32 {
    match fat_type {
        FatType::Fat12 => (entries * 3).div_ceil(2),
        FatType::Fat16 => entries * 2,
        FatType::Fat32 => entries * 4,
    }
}

fn geometry(total: u32, options: &FormatOptions, fat_type: FatType) -> Option<Geometry> {
    let spc = options.sectors_per_cluster as u32;
    let fats = options.num_fats as u32;
    let reserved = match (options.reserved_sectors, fat_type) {
        (Some(reserved), _) => reserved as u32,
        (None, FatType::Fat32) => 32,
        (None, _) => 1,
    };
    let root_sectors = match fat_type {
        FatType::Fat32 => 0,
        _ => ROOT_ENTRIES_FIXED * 32 / SECTOR_SIZE as u32,
    };
    let mut sectors_per_fat = 1u32;
    loop {
        let meta = reserved + fats * sectors_per_fat + root_sectors;
        let clusters = total.checked_sub(meta)? / spc;
        let needed = fat_bytes(fat_type, clusters + 2).div_ceil(SECTOR_SIZE as u32);
        if needed <= sectors_per_fat {
            return Some(Geometry {
                fat_type,
                reserved,
                sectors_per_fat,
                root_sectors,
                clusters,
            });
        }
        sectors_per_fat = needed;
    }
}

fn pick_geometry(total: u32, options: &FormatOptions) -> Option<Geometry> {
    let fits = |geo: &Geometry| match geo.fat_type {
        FatType::Fat12 => geo.clusters >= 2 && geo.clusters < FAT12_MAX_CLUSTERS,
        FatType::Fat16 => geo.clusters >= FAT12_MAX_CLUSTERS && geo.clusters < FAT16_MAX_CLUSTERS,
        FatType::Fat32 => geo.clusters >= 2,
    };
    if let Some(fat_type) = options.fat_type {
        return geometry(total, options, fat_type).filter(fits);
    }
    let fat16 = geometry(total, options, FatType::Fat16)?;
    let fat_type = if fat16.clusters < FAT12_MAX_CLUSTERS {
        FatType::Fat12
    } else if fat16.clusters < FAT16_MAX_CLUSTERS {
        FatType::Fat16
    } else {
        FatType::Fat32
    };
    geometry(total, options, fat_type).filter(fits)
}

async fn write_sector<D: BlockDevice>(device: &mut D, lba: u32, sector: &[u8; SECTOR_SIZE]) -> Result<(), FatError> {
    match device.write_blocks(lba, sector).await {
        Ok(1) => Ok(()),
        Ok(count) => {
            log::warn!("fullfat: format short_write lba={} count={}", lba, count);
            Err(FatErrorKind::DeviceDriverFailed.at(FatOp::Format))
        }
        Err(err) => {
            log::warn!("fullfat: format write_error lba={} err={:?}", lba, err);
            Err(FatErrorKind::DeviceDriverFailed.at(FatOp::Format))
        }
    }
}

fn boot_sector(geo: &Geometry, options: &FormatOptions, total: u32) -> [u8; SECTOR_SIZE] {
    let mut boot = [0u8; SECTOR_SIZE];
    let fat32 = geo.fat_type == FatType::Fat32;
    boot[..3].copy_from_slice(if fat32 { &[0xEB, 0x58, 0x90] } else { &[0xEB, 0x3C, 0x90] });
    boot[3..11].copy_from_slice(OEM_NAME);
    put_le_u16(&mut boot, 11, SECTOR_SIZE as u16);
    boot[13] = options.sectors_per_cluster;
    put_le_u16(&mut boot, 14, geo.reserved as u16);
    boot[16] = options.num_fats;
    boot[21] = 0xF8;
    put_le_u16(&mut boot, 24, 63);
    put_le_u16(&mut boot, 26, 255);
    put_le_u32(&mut boot, 28, options.begin_lba);

    let small = !fat32 && total < 0x1_0000;
    put_le_u16(&mut boot, 19, if small { total as u16 } else { 0 });
    put_le_u32(&mut boot, 32, if small { 0 } else { total });

    if fat32 {
        put_le_u32(&mut boot, 36, geo.sectors_per_fat);
        put_le_u32(&mut boot, 44, FAT32_ROOT_CLUSTER);
        put_le_u16(&mut boot, 48, 1);
        let backup = if geo.reserved > FAT32_BACKUP_BOOT + 1 { FAT32_BACKUP_BOOT } else { 0 };
        put_le_u16(&mut boot, 50, backup as u16);
        boot[64] = 0x80;
        boot[66] = 0x29;
        put_le_u32(&mut boot, 67, VOLUME_SERIAL);
        boot[71..82].copy_from_slice(&options.label);
        boot[82..90].copy_from_slice(b"FAT32   ");
    } else {
        put_le_u16(&mut boot, 17, ROOT_ENTRIES_FIXED as u16);
        put_le_u16(&mut boot, 22, geo.sectors_per_fat as u16);
        boot[36] = 0x80;
        boot[38] = 0x29;
        put_le_u32(&mut boot, 39, VOLUME_SERIAL);
        boot[43..54].copy_from_slice(&options.label);
        let name: &[u8; 8] = if geo.fat_type == FatType::Fat12 { b"FAT12   " } else { b"FAT16   " };
        boot[54..62].copy_from_slice(name);
    }
    boot[510] = 0x55;
    boot[511] = 0xAA;
    boot
}

/// Lays down an empty FAT file system and returns the type chosen.
///
/// FAT16 is picked while the FAT16 cluster count stays under 65525, FAT12
/// below 4085 and FAT32 above; a forced type must fit its cluster range.
pub async fn format_partition<D: BlockDevice>(device: &mut D, options: FormatOptions) -> Result<FatType, FatError> {
    let bad_geometry = FatErrorKind::InvalidFormatGeometry.at(FatOp::Format);
    if options.sectors_per_cluster == 0
        || !options.sectors_per_cluster.is_power_of_two()
        || options.num_fats == 0
    {
        return Err(bad_geometry);
    }
    let total = match options.total_sectors {
        Some(total) => total,
        None => device
            .block_count()
            .checked_sub(options.begin_lba)
            .ok_or(bad_geometry)?,
    };
    let geo = pick_geometry(total, &options).ok_or(bad_geometry)?;
    let fat32 = geo.fat_type == FatType::Fat32;
    if fat32 && geo.reserved < 2 {
        return Err(bad_geometry);
    }

    let begin = options.begin_lba;
    let fat_begin = begin + geo.reserved;
    let root_begin = fat_begin + options.num_fats as u32 * geo.sectors_per_fat;
    let root_sectors = if fat32 {
        options.sectors_per_cluster as u32
    } else {
        geo.root_sectors
    };

    let zero = [0u8; SECTOR_SIZE];
    for lba in fat_begin..root_begin + root_sectors {
        write_sector(device, lba, &zero).await?;
    }

    let mut first = [0u8; SECTOR_SIZE];
    match geo.fat_type {
        FatType::Fat12 => first[..3].copy_from_slice(&[0xF8, 0xFF, 0xFF]),
        FatType::Fat16 => {
            put_le_u16(&mut first, 0, 0xFFF8);
            put_le_u16(&mut first, 2, 0xFFFF);
        }
        FatType::Fat32 => {
            put_le_u32(&mut first, 0, 0x0FFF_FFF8);
            put_le_u32(&mut first, 4, 0xFFFF_FFFF);
            put_le_u32(&mut first, 8, 0x0FFF_FFFF);
        }
    }
    for copy in 0..options.num_fats as u32 {
        write_sector(device, fat_begin + copy * geo.sectors_per_fat, &first).await?;
    }

    let boot = boot_sector(&geo, &options, total);
    write_sector(device, begin, &boot).await?;

    if fat32 {
        let mut info = [0u8; SECTOR_SIZE];
        put_le_u32(&mut info, 0, FSINFO_LEAD_SIG);
        put_le_u32(&mut info, 484, FSINFO_STRUCT_SIG);
        put_le_u32(&mut info, FSINFO_FREE_COUNT, geo.clusters - 1);
        put_le_u32(&mut info, FSINFO_NEXT_FREE, FAT32_ROOT_CLUSTER);
        info[510] = 0x55;
        info[511] = 0xAA;
        write_sector(device, begin + 1, &info).await?;
        if geo.reserved > FAT32_BACKUP_BOOT + 1 {
            write_sector(device, begin + FAT32_BACKUP_BOOT, &boot).await?;
            write_sector(device, begin + FAT32_BACKUP_BOOT + 1, &info).await?;
        }
    }

    log::info!(
        "fullfat: format type={:?} begin={} sectors={} clusters={} fat_sectors={}",
        geo.fat_type,
        begin,
        total,
        geo.clusters,
        geo.sectors_per_fat
    );
    Ok(geo.fat_type)
}

/// Writes a master boot record describing one partition.
pub async fn write_partition_table<D: BlockDevice>(
    device: &mut D,
    begin_lba: u32,
    sectors: u32,
    partition_type: u8,
) -> Result<(), FatError> {
    let mut mbr = [0u8; SECTOR_SIZE];
    let entry = 446;
    mbr[entry] = 0x00;
    mbr[entry + 4] = partition_type;
    put_le_u32(&mut mbr, entry + 8, begin_lba);
    put_le_u32(&mut mbr, entry + 12, sectors);
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    write_sector(device, 0, &mbr).await
}

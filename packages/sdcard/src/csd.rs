//! CSD and CID register decoding.

use heapless::String;

use crate::SD_BLOCK_SIZE;

/// Register bytes in wire order from a 136-bit response whose most
/// significant word sits in `response[3]`.
fn register_bytes(response: &[u32; 4]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(response.iter().rev()) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

fn register_bits(reg: &[u8; 16], msb: u8, lsb: u8) -> u32 {
    let mut value = 0u32;
    for bit in (lsb..=msb).rev() {
        let byte_idx = (127 - bit) / 8;
        let bit_in_byte = bit % 8;
        let b = (reg[byte_idx as usize] >> bit_in_byte) & 1;
        value = (value << 1) | (b as u32);
    }
    value
}

/// Geometry taken from the CSD, already in 512-byte blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Csd {
    pub version: u8,
    pub block_size: u32,
    pub blocks: u32,
    pub tran_speed: u8,
}

impl Csd {
    pub fn decode(response: &[u32; 4]) -> Self {
        let reg = register_bytes(response);
        let version = register_bits(&reg, 127, 126) as u8;
        let blocks = match version {
            0 => {
                let c_size = register_bits(&reg, 73, 62) as u64;
                let c_size_mult = register_bits(&reg, 49, 47);
                let read_bl_len = register_bits(&reg, 83, 80);
                let bytes = ((c_size + 1) << (c_size_mult + 2)) << read_bl_len;
                (bytes / SD_BLOCK_SIZE as u64).min(u32::MAX as u64) as u32
            }
            1 => register_bits(&reg, 69, 48).saturating_mul(1024),
            _ => 0,
        };
        if version > 1 {
            log::warn!("sdcard: csd_version_unsupported version={}", version);
        }
        Self {
            version,
            block_size: SD_BLOCK_SIZE as u32,
            blocks,
            tran_speed: register_bits(&reg, 103, 96) as u8,
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.blocks as u64 * self.block_size as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer: u8,
    pub oem: [u8; 2],
    pub product: String<5>,
    pub revision: u8,
    pub serial: u32,
    pub year: u16,
    pub month: u8,
}

impl Cid {
    pub fn decode(response: &[u32; 4]) -> Self {
        let reg = register_bytes(response);
        let mut product = String::new();
        for &byte in &reg[3..8] {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            };
            let _ = product.push(c);
        }
        Self {
            manufacturer: reg[0],
            oem: [reg[1], reg[2]],
            product,
            revision: reg[8],
            serial: u32::from_be_bytes([reg[9], reg[10], reg[11], reg[12]]),
            year: 2000 + register_bits(&reg, 19, 12) as u16,
            month: register_bits(&reg, 11, 8) as u8,
        }
    }
}

//! SD command opcodes and the request/response record passed to hosts.

pub const SD_CMD0: u8 = 0;
pub const SD_CMD2: u8 = 2;
pub const SD_CMD3: u8 = 3;
pub const SD_CMD7: u8 = 7;
pub const SD_CMD8: u8 = 8;
pub const SD_CMD9: u8 = 9;
pub const SD_CMD10: u8 = 10;
pub const SD_CMD12: u8 = 12;
pub const SD_CMD13: u8 = 13;
pub const SD_CMD16: u8 = 16;
pub const SD_CMD17: u8 = 17;
pub const SD_CMD18: u8 = 18;
pub const SD_CMD24: u8 = 24;
pub const SD_CMD25: u8 = 25;
pub const SD_CMD55: u8 = 55;
pub const SD_CMD58: u8 = 58;
pub const SD_ACMD6: u8 = 6;
pub const SD_ACMD41: u8 = 41;

/// CMD8 argument: 2.7-3.6 V window plus the 0xAA check pattern.
pub const SD_IF_COND_ARG: u32 = 0x0000_01AA;
pub const SD_OCR_BUSY: u32 = 1 << 31;
pub const SD_OCR_CCS: u32 = 1 << 30;
pub const SD_ACMD41_ARG_NATIVE: u32 = 0x40FF_8000;
pub const SD_ACMD41_ARG_SPI: u32 = 0x4000_0000;

/// R1 card-status bits that flag a failed command.
pub const SD_R1_ERRORS: u32 = 0xFDF8_0000;
/// R6 status bits carried next to the RCA.
pub const SD_R6_COM_CRC_ERROR: u32 = 1 << 15;
pub const SD_R6_ILLEGAL_COMMAND: u32 = 1 << 14;
pub const SD_R6_ERROR: u32 = 1 << 13;
pub const SD_R6_READY_FOR_DATA: u32 = 1 << 8;

/// SPI-mode R1 idle bit.
pub const SD_SPI_R1_IDLE: u32 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    None,
    R1,
    R1b,
    R2,
    R3,
    R6,
    R7,
    /// R1 followed by a 16-byte register block (CSD/CID over SPI).
    R1Data,
}

/// One command exchange. `response[3]` holds the most significant word of
/// a 136-bit response; short responses land in `response[0]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmcCommand {
    pub opcode: u8,
    pub arg: u32,
    pub response: [u32; 4],
    pub crc: bool,
    pub response_type: ResponseType,
}

impl MmcCommand {
    pub const fn new(opcode: u8, arg: u32, response_type: ResponseType) -> Self {
        Self {
            opcode,
            arg,
            response: [0; 4],
            crc: true,
            response_type,
        }
    }

    pub fn status(&self) -> u32 {
        self.response[0]
    }

    /// Current state field of an R1 card status (bits 12:9).
    pub fn current_state(&self) -> u32 {
        (self.response[0] >> 9) & 0x0F
    }
}

/// Card states reported in R1 bits 12:9.
pub const SD_STATE_TRAN: u32 = 4;
pub const SD_STATE_DATA: u32 = 5;
pub const SD_STATE_DIS: u32 = 8;

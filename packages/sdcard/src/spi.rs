//! SD host over a plain SPI bus.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

use crate::command::{MmcCommand, ResponseType, SD_CMD0, SD_CMD8};
use crate::error::HostError;
use crate::host::{HostCaps, MmcHost};
use crate::SD_BLOCK_SIZE;

pub const SD_SPI_R1_POLLS: usize = 10;
pub const SD_SPI_TOKEN_POLLS: usize = 50_000;
pub const SD_SPI_BUSY_POLLS: usize = 200_000;
pub const SD_SPI_IDLE_BYTES: usize = 10;

const TOKEN_START_BLOCK: u8 = 0xFE;
const TOKEN_START_MULTI_WRITE: u8 = 0xFC;
const TOKEN_STOP_TRAN: u8 = 0xFD;
const DATA_ACCEPTED: u8 = 0x05;

/// Slot presence for hosts without an interrupt line.
pub trait CardDetect {
    fn is_present(&mut self) -> Result<bool, HostError>;
}

/// For slots whose detect line is not wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysPresent;

impl CardDetect for AlwaysPresent {
    fn is_present(&mut self) -> Result<bool, HostError> {
        Ok(true)
    }
}

/// A detect switch read through a GPIO; `active_high` selects its polarity.
pub struct DetectPin<P> {
    pin: P,
    active_high: bool,
}

impl<P: InputPin> DetectPin<P> {
    pub fn new(pin: P, active_high: bool) -> Self {
        Self { pin, active_high }
    }
}

impl<P: InputPin> CardDetect for DetectPin<P> {
    fn is_present(&mut self) -> Result<bool, HostError> {
        let high = self.pin.is_high().map_err(|_| HostError::Bus)?;
        Ok(high == self.active_high)
    }
}

pub struct SpiHost<S, CS, D> {
    spi: S,
    cs: CS,
    detect: D,
}

impl<S, CS, D> SpiHost<S, CS, D>
where
    S: SpiBus,
    CS: OutputPin,
    D: CardDetect,
{
    /// Takes the bus with chip select released.
    pub fn new(spi: S, mut cs: CS, detect: D) -> Result<Self, HostError> {
        cs.set_high().map_err(|_| HostError::Bus)?;
        Ok(Self { spi, cs, detect })
    }

    pub fn release(self) -> (S, CS, D) {
        (self.spi, self.cs, self.detect)
    }

    fn transfer_byte(&mut self, byte: u8) -> Result<u8, HostError> {
        let mut frame = [byte];
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(|_| HostError::Bus)?;
        Ok(frame[0])
    }

    fn wait_ready(&mut self) -> Result<(), HostError> {
        for _ in 0..SD_SPI_BUSY_POLLS {
            if self.transfer_byte(0xFF)? == 0xFF {
                return Ok(());
            }
        }
        Err(HostError::Timeout)
    }

    fn wait_token(&mut self) -> Result<u8, HostError> {
        for _ in 0..SD_SPI_TOKEN_POLLS {
            let token = self.transfer_byte(0xFF)?;
            if token != 0xFF {
                return Ok(token);
            }
        }
        Err(HostError::Timeout)
    }

    fn read_block_into(&mut self, out: &mut [u8]) -> Result<(), HostError> {
        let token = self.wait_token()?;
        if token != TOKEN_START_BLOCK {
            return Err(HostError::DataToken(token));
        }
        out.fill(0xFF);
        self.spi.transfer_in_place(out).map_err(|_| HostError::Bus)?;
        // CRC16 is not checked in SPI mode.
        self.transfer_byte(0xFF)?;
        self.transfer_byte(0xFF)?;
        Ok(())
    }

    /// CMD0 and CMD8 are always checked by the card; other frames carry a
    /// real CRC only when the command asks for one.
    fn crc_for(command: &MmcCommand, head: &[u8; 5]) -> u8 {
        if command.crc || matches!(command.opcode, SD_CMD0 | SD_CMD8) {
            (crc7(head) << 1) | 0x01
        } else {
            0x01
        }
    }
}

/// CRC7 (x^7 + x^3 + 1) over a command head.
pub fn crc7(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in bytes {
        let mut data = byte;
        for _ in 0..8 {
            crc <<= 1;
            if (data ^ crc) & 0x80 != 0 {
                crc ^= 0x09;
            }
            data <<= 1;
        }
    }
    crc & 0x7F
}

impl<S, CS, D> MmcHost for SpiHost<S, CS, D>
where
    S: SpiBus,
    CS: OutputPin,
    D: CardDetect,
{
    fn capabilities(&self) -> HostCaps {
        HostCaps {
            spi_mode: true,
            wide_bus: false,
        }
    }

    fn is_card_present(&mut self) -> Result<bool, HostError> {
        self.detect.is_present()
    }

    async fn initialise(&mut self) -> Result<(), HostError> {
        self.cs.set_high().map_err(|_| HostError::Bus)?;
        let idle = [0xFFu8; SD_SPI_IDLE_BYTES];
        self.spi.write(&idle).map_err(|_| HostError::Bus)?;
        self.spi.flush().map_err(|_| HostError::Bus)
    }

    async fn request(&mut self, command: &mut MmcCommand) -> Result<(), HostError> {
        self.wait_ready()?;
        let arg = command.arg;
        let head = [
            0x40 | command.opcode,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
        ];
        let frame = [head[0], head[1], head[2], head[3], head[4], Self::crc_for(command, &head)];
        self.spi.write(&frame).map_err(|_| HostError::Bus)?;

        let mut r1 = 0xFF;
        for _ in 0..SD_SPI_R1_POLLS {
            r1 = self.transfer_byte(0xFF)?;
            if r1 & 0x80 == 0 {
                break;
            }
        }
        if r1 & 0x80 != 0 {
            return Err(HostError::Timeout);
        }

        command.response = [r1 as u32, 0, 0, 0];
        match command.response_type {
            ResponseType::R1b => {
                for _ in 0..SD_SPI_BUSY_POLLS {
                    if self.transfer_byte(0xFF)? != 0x00 {
                        return Ok(());
                    }
                }
                return Err(HostError::Timeout);
            }
            ResponseType::R2 => {
                let second = self.transfer_byte(0xFF)?;
                command.response[0] = (r1 as u32) << 8 | second as u32;
            }
            ResponseType::R3 | ResponseType::R7 => {
                let mut tail = [0xFFu8; 4];
                self.spi.transfer_in_place(&mut tail).map_err(|_| HostError::Bus)?;
                command.response[0] = u32::from_be_bytes(tail);
            }
            ResponseType::R1Data => {
                if r1 != 0 {
                    return Err(HostError::Status(r1));
                }
                let mut block = [0u8; 16];
                self.read_block_into(&mut block)?;
                for (word, chunk) in block.chunks_exact(4).enumerate() {
                    command.response[3 - word] =
                        u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
            ResponseType::None | ResponseType::R1 | ResponseType::R6 => {}
        }
        Ok(())
    }

    async fn read_blocks(&mut self, buf: &mut [u8]) -> Result<usize, HostError> {
        let mut read = 0;
        for block in buf.chunks_exact_mut(SD_BLOCK_SIZE) {
            self.read_block_into(block)?;
            read += 1;
        }
        Ok(read)
    }

    async fn write_blocks(&mut self, buf: &[u8], multi: bool) -> Result<usize, HostError> {
        let token = if multi {
            TOKEN_START_MULTI_WRITE
        } else {
            TOKEN_START_BLOCK
        };
        let mut written = 0;
        let mut rejected = None;
        for block in buf.chunks_exact(SD_BLOCK_SIZE) {
            self.wait_ready()?;
            self.transfer_byte(token)?;
            self.spi.write(block).map_err(|_| HostError::Bus)?;
            self.transfer_byte(0xFF)?;
            self.transfer_byte(0xFF)?;
            let response = self.transfer_byte(0xFF)?;
            if response & DATA_ACCEPTED != DATA_ACCEPTED {
                rejected = Some(response & 0x1F);
                break;
            }
            written += 1;
        }
        self.wait_ready()?;
        if multi {
            self.transfer_byte(TOKEN_STOP_TRAN)?;
            // Skip the byte the card sends before it raises busy.
            self.transfer_byte(0xFF)?;
            self.wait_ready()?;
        }
        match rejected {
            Some(response) if written == 0 => Err(HostError::WriteRejected(response)),
            _ => Ok(written),
        }
    }

    fn select(&mut self) -> Result<(), HostError> {
        self.cs.set_low().map_err(|_| HostError::Bus)
    }

    fn deselect(&mut self) -> Result<(), HostError> {
        self.cs.set_high().map_err(|_| HostError::Bus)?;
        self.transfer_byte(0xFF).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;
    use std::collections::VecDeque;

    use embassy_futures::block_on;
    use embedded_hal::digital::{ErrorKind, ErrorType as PinErrorType};
    use embedded_hal::spi::ErrorType as SpiErrorType;

    use super::*;
    use crate::command::{SD_CMD17, SD_CMD9};

    /// Records every byte sent and answers from a script, 0xFF once it runs dry.
    #[derive(Default)]
    struct ScriptedBus {
        sent: Vec<u8>,
        replies: VecDeque<u8>,
    }

    impl ScriptedBus {
        fn reply(&mut self, bytes: &[u8]) {
            self.replies.extend(bytes.iter().copied());
        }
    }

    impl SpiErrorType for ScriptedBus {
        type Error = Infallible;
    }

    impl SpiBus for ScriptedBus {
        fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            for word in words {
                self.sent.push(0xFF);
                *word = self.replies.pop_front().unwrap_or(0xFF);
            }
            Ok(())
        }

        fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
            for &word in words {
                self.sent.push(word);
                self.replies.pop_front();
            }
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
            for (i, slot) in read.iter_mut().enumerate() {
                self.sent.push(write.get(i).copied().unwrap_or(0xFF));
                *slot = self.replies.pop_front().unwrap_or(0xFF);
            }
            Ok(())
        }

        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            for word in words {
                self.sent.push(*word);
                *word = self.replies.pop_front().unwrap_or(0xFF);
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    struct Pin;

    impl PinErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    impl InputPin for Pin {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(false)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(true)
        }
    }

    /// Chip select that fails every transition.
    struct BrokenPin;

    impl PinErrorType for BrokenPin {
        type Error = ErrorKind;
    }

    impl OutputPin for BrokenPin {
        fn set_low(&mut self) -> Result<(), ErrorKind> {
            Err(ErrorKind::Other)
        }

        fn set_high(&mut self) -> Result<(), ErrorKind> {
            Err(ErrorKind::Other)
        }
    }

    fn host(bus: ScriptedBus) -> SpiHost<ScriptedBus, Pin, AlwaysPresent> {
        SpiHost::new(bus, Pin, AlwaysPresent).unwrap()
    }

    #[test]
    fn broken_chip_select_fails_construction() {
        assert!(matches!(
            SpiHost::new(ScriptedBus::default(), BrokenPin, AlwaysPresent),
            Err(HostError::Bus)
        ));
    }

    #[test]
    fn crc7_matches_known_command_frames() {
        assert_eq!(crc7(&[0x40, 0, 0, 0, 0]), 0x4A);
        assert_eq!(crc7(&[0x48, 0, 0, 0x01, 0xAA]), 0x43);
        assert_eq!(crc7(&[0x77, 0, 0, 0, 0]), 0x32);
        assert_eq!(crc7(&[0x69, 0x40, 0, 0, 0]), 0x3B);
    }

    #[test]
    fn unchecked_commands_send_dummy_crc() {
        let mut host = host(ScriptedBus::default());
        let mut command = MmcCommand::new(SD_CMD17, 0, ResponseType::R1);
        command.crc = false;
        assert_eq!(block_on(host.request(&mut command)), Err(HostError::Timeout));
        let mut checked = MmcCommand::new(SD_CMD17, 0, ResponseType::R1);
        assert_eq!(block_on(host.request(&mut checked)), Err(HostError::Timeout));

        let (bus, _, _) = host.release();
        let frame = 1 + 6 + SD_SPI_R1_POLLS;
        assert_eq!(bus.sent[6], 0x01);
        assert_eq!(bus.sent[frame + 6], (crc7(&[0x51, 0, 0, 0, 0]) << 1) | 0x01);
    }

    #[test]
    fn command_frames_carry_fixed_crcs() {
        let mut bus = ScriptedBus::default();
        // ready byte, 6 frame bytes, then R1 on the second poll
        bus.reply(&[0xFF, 0, 0, 0, 0, 0, 0, 0xFF, 0x01]);
        let mut host = host(bus);
        let mut command = MmcCommand::new(SD_CMD0, 0, ResponseType::None);
        block_on(host.request(&mut command)).unwrap();
        assert_eq!(command.status(), 0x01);

        let (bus, _, _) = host.release();
        assert_eq!(&bus.sent[1..7], &[0x40, 0, 0, 0, 0, 0x95]);
    }

    #[test]
    fn cmd8_reads_four_trailing_bytes() {
        let mut bus = ScriptedBus::default();
        bus.reply(&[0xFF, 0, 0, 0, 0, 0, 0, 0x01, 0x00, 0x00, 0x01, 0xAA]);
        let mut host = host(bus);
        let mut command = MmcCommand::new(SD_CMD8, 0x1AA, ResponseType::R7);
        block_on(host.request(&mut command)).unwrap();
        assert_eq!(command.status(), 0x0000_01AA);

        let (bus, _, _) = host.release();
        assert_eq!(&bus.sent[1..7], &[0x48, 0, 0, 0x01, 0xAA, 0x87]);
    }

    #[test]
    fn silent_card_times_out_after_ten_polls() {
        let mut host = host(ScriptedBus::default());
        let mut command = MmcCommand::new(SD_CMD17, 0, ResponseType::R1);
        assert_eq!(block_on(host.request(&mut command)), Err(HostError::Timeout));
        let (bus, _, _) = host.release();
        assert_eq!(bus.sent.len(), 1 + 6 + SD_SPI_R1_POLLS);
    }

    #[test]
    fn register_blocks_fill_response_most_significant_first() {
        let mut bus = ScriptedBus::default();
        bus.reply(&[0xFF, 0, 0, 0, 0, 0, 0, 0x00, 0xFF, 0xFE]);
        let register: Vec<u8> = (1..=16).collect();
        bus.reply(&register);
        bus.reply(&[0x12, 0x34]);
        let mut host = host(bus);
        let mut command = MmcCommand::new(SD_CMD9, 0, ResponseType::R1Data);
        block_on(host.request(&mut command)).unwrap();
        assert_eq!(command.response[3], 0x0102_0304);
        assert_eq!(command.response[0], 0x0D0E_0F10);
    }

    #[test]
    fn single_block_write_uses_start_token() {
        let mut bus = ScriptedBus::default();
        // ready, token, 512 data, 2 crc, then an accepted data response
        bus.reply(&[0xFF, 0xFF]);
        bus.reply(&[0u8; SD_BLOCK_SIZE]);
        bus.reply(&[0xFF, 0xFF, 0xE5]);
        let mut host = host(bus);
        let data = [0xA5u8; SD_BLOCK_SIZE];
        assert_eq!(block_on(host.write_blocks(&data, false)), Ok(1));
        let (bus, _, _) = host.release();
        assert_eq!(bus.sent[1], TOKEN_START_BLOCK);
        assert_eq!(&bus.sent[2..2 + SD_BLOCK_SIZE], &data[..]);
        assert!(!bus.sent.contains(&TOKEN_STOP_TRAN));
    }

    #[test]
    fn rejected_block_is_reported() {
        let mut bus = ScriptedBus::default();
        bus.reply(&[0xFF, 0xFF]);
        bus.reply(&[0u8; SD_BLOCK_SIZE]);
        bus.reply(&[0xFF, 0xFF, 0x0B]);
        let mut host = host(bus);
        let data = [0u8; SD_BLOCK_SIZE];
        assert_eq!(
            block_on(host.write_blocks(&data, false)),
            Err(HostError::WriteRejected(0x0B))
        );
    }

    #[test]
    fn detect_pin_honours_polarity() {
        assert!(!DetectPin::new(Pin, true).is_present().unwrap());
        assert!(DetectPin::new(Pin, false).is_present().unwrap());
    }
}

use std::collections::HashMap;

use bitthunder::config::MMC_FLAG_INITIALISE_REQUEST;
use bitthunder::{BtError, DeviceChange, FatFs, MmcRegistry, MmcSignals};
use embassy_futures::block_on;
use fullfat::{format_partition, BlockDevice, FormatOptions, VolumeConfig};
use sdcard::command::*;
use sdcard::{BusWidth, CardError, CardEvent, HostCaps, HostError, MmcCommand, MmcHost, SdConfig, SD_BLOCK_SIZE};

const CID: [u8; 16] = [
    0x03, b'S', b'D', b'S', b'U', b'0', b'8', b'G', 0x80, 0x12, 0x34, 0x56, 0x78, 0x01, 0x5A, 0x01,
];

fn words(reg: [u8; 16]) -> [u32; 4] {
    let word = |i: usize| u32::from_be_bytes([reg[i], reg[i + 1], reg[i + 2], reg[i + 3]]);
    [word(12), word(8), word(4), word(0)]
}

fn csd_v2(c_size: u32) -> [u32; 4] {
    let mut reg = [0u8; 16];
    reg[0] = 0x40;
    reg[3] = 0x32;
    reg[5] = 0x5B;
    reg[7] = ((c_size >> 16) & 0x3F) as u8;
    reg[8] = (c_size >> 8) as u8;
    reg[9] = c_size as u8;
    words(reg)
}

/// Native-mode high-capacity card with sparse backing storage.
struct CardSim {
    present: bool,
    csd: [u32; 4],
    sent: Vec<u8>,
    read_timeouts: usize,
    blocks: HashMap<u32, [u8; SD_BLOCK_SIZE]>,
    data_lba: u32,
}

impl CardSim {
    fn with_c_size(c_size: u32) -> Self {
        Self {
            present: true,
            csd: csd_v2(c_size),
            sent: Vec::new(),
            read_timeouts: 0,
            blocks: HashMap::new(),
            data_lba: 0,
        }
    }
}

impl MmcHost for CardSim {
    fn capabilities(&self) -> HostCaps {
        HostCaps {
            spi_mode: false,
            wide_bus: true,
        }
    }

    fn is_card_present(&mut self) -> Result<bool, HostError> {
        Ok(self.present)
    }

    async fn initialise(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    async fn request(&mut self, command: &mut MmcCommand) -> Result<(), HostError> {
        self.sent.push(command.opcode);
        if command.opcode == SD_CMD18 && self.read_timeouts > 0 {
            self.read_timeouts -= 1;
            return Err(HostError::Timeout);
        }
        command.response = [0; 4];
        match command.opcode {
            SD_CMD8 => command.response[0] = command.arg,
            SD_CMD55 => command.response[0] = 1 << 5,
            SD_ACMD41 => command.response[0] = SD_OCR_BUSY | SD_OCR_CCS | 0x00FF_8000,
            SD_CMD2 => command.response = words(CID),
            SD_CMD3 => command.response[0] = 0x1234 << 16 | SD_R6_READY_FOR_DATA,
            SD_CMD9 => command.response = self.csd,
            SD_CMD13 => command.response[0] = SD_STATE_TRAN << 9,
            SD_CMD17 | SD_CMD18 | SD_CMD24 | SD_CMD25 => {
                self.data_lba = command.arg;
                command.response[0] = SD_STATE_TRAN << 9;
            }
            _ => {}
        }
        Ok(())
    }

    async fn read_blocks(&mut self, buf: &mut [u8]) -> Result<usize, HostError> {
        for (i, chunk) in buf.chunks_exact_mut(SD_BLOCK_SIZE).enumerate() {
            let lba = self.data_lba + i as u32;
            match self.blocks.get(&lba) {
                Some(block) => chunk.copy_from_slice(block),
                None => chunk.fill(0),
            }
        }
        Ok(buf.len() / SD_BLOCK_SIZE)
    }

    async fn write_blocks(&mut self, buf: &[u8], _multi: bool) -> Result<usize, HostError> {
        for (i, chunk) in buf.chunks_exact(SD_BLOCK_SIZE).enumerate() {
            let mut block = [0u8; SD_BLOCK_SIZE];
            block.copy_from_slice(chunk);
            self.blocks.insert(self.data_lba + i as u32, block);
        }
        Ok(buf.len() / SD_BLOCK_SIZE)
    }

    async fn set_bus_width(&mut self, _width: BusWidth) -> Result<(), HostError> {
        Ok(())
    }
}

fn quick() -> SdConfig {
    SdConfig {
        settle_ms: 0,
        acmd41_poll_ms: 0,
        ..SdConfig::default()
    }
}

#[test]
fn inserted_card_registers_one_block_device() {
    let signals: MmcSignals = MmcSignals::new();
    let mut registry = MmcRegistry::new(&signals);
    let mut empty = CardSim::with_c_size(1000);
    empty.present = false;

    assert_eq!(registry.register_host(CardSim::with_c_size(1000), quick()), Ok(0));
    assert_eq!(registry.register_host(empty, quick()), Ok(1));
    assert_eq!(signals.pending(0), MMC_FLAG_INITIALISE_REQUEST);
    assert_eq!(signals.pending(1), 0);

    assert_eq!(block_on(registry.service()), 1);
    let Some(DeviceChange::Added {
        host,
        name,
        block_size,
        blocks,
    }) = signals.try_next_change()
    else {
        panic!("no device added");
    };
    assert_eq!((host, name.as_str()), (0, "mmc0"));
    assert_eq!(block_size, 512);
    assert_eq!(blocks, 1000 * 1024);
    assert_eq!(signals.try_next_change(), None);

    assert!(registry.card(0).unwrap().info().unwrap().sdhc);
    assert_eq!(registry.find_device("mmc0"), Some(0));
    assert_eq!(registry.device_name(1), None);
    assert!(registry.card(1).unwrap().host().sent.is_empty());
}

#[test]
fn removed_card_gets_no_commands_until_reinserted() {
    let signals: MmcSignals = MmcSignals::new();
    let mut registry = MmcRegistry::new(&signals);
    registry.register_host(CardSim::with_c_size(1000), quick()).unwrap();
    block_on(registry.service());
    signals.try_next_change().unwrap();

    registry.card_mut(0).unwrap().host_mut().present = false;
    signals.post_event(0, CardEvent::Removed).unwrap();
    block_on(registry.service());
    assert_eq!(
        signals.try_next_change(),
        Some(DeviceChange::Removed {
            host: 0,
            name: "mmc0".try_into().unwrap(),
        })
    );
    assert_eq!(registry.open_device("mmc0").err(), Some(BtError::NoDevice));

    let quiet = registry.card(0).unwrap().host().sent.len();
    for _ in 0..3 {
        registry.poll_presence();
        block_on(registry.service());
    }
    assert_eq!(registry.card(0).unwrap().host().sent.len(), quiet);
    assert_eq!(signals.try_next_change(), None);

    registry.card_mut(0).unwrap().host_mut().present = true;
    registry.poll_presence();
    block_on(registry.service());
    assert!(matches!(signals.try_next_change(), Some(DeviceChange::Added { host: 0, .. })));
    assert_eq!(registry.card(0).unwrap().host().sent[quiet], SD_CMD0);
}

#[test]
fn posted_event_wakes_the_detection_loop() {
    let signals: MmcSignals = MmcSignals::new();
    let mut registry = MmcRegistry::new(&signals);
    let mut host = CardSim::with_c_size(1000);
    host.present = false;
    registry.register_host(host, quick()).unwrap();

    registry.card_mut(0).unwrap().host_mut().present = true;
    signals.post_event(0, CardEvent::Detected).unwrap();
    assert_eq!(block_on(registry.wait_and_service()), 1);
    assert_eq!(registry.device_name(0), Some("mmc0"));
}

#[test]
fn exhausted_read_retries_leave_the_buffer_alone() {
    let signals: MmcSignals = MmcSignals::new();
    let mut registry = MmcRegistry::new(&signals);
    registry.register_host(CardSim::with_c_size(1000), quick()).unwrap();
    block_on(registry.service());
    registry.card_mut(0).unwrap().host_mut().read_timeouts = 3;

    let mut device = registry.open_device("mmc0").unwrap();
    let mut buf = [0xAAu8; 2 * SD_BLOCK_SIZE];
    let result = block_on(device.read_blocks(8, &mut buf));
    assert_eq!(result, Err(CardError::Timeout(SD_CMD18)));
    assert_eq!(BtError::from(CardError::Timeout(SD_CMD18)), BtError::Io);
    assert!(buf.iter().all(|&b| b == 0xAA));

    let sent = &registry.card(0).unwrap().host().sent;
    assert_eq!(sent.iter().filter(|&&op| op == SD_CMD18).count(), 3);
}

#[test]
fn fat_volume_round_trips_through_the_card() {
    let signals: MmcSignals = MmcSignals::new();
    let mut registry = MmcRegistry::new(&signals);
    registry.register_host(CardSim::with_c_size(16), quick()).unwrap();
    block_on(registry.service());

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    {
        let mut device = registry.open_device("mmc0").unwrap();
        assert_eq!(device.block_count(), 16 * 1024);
        block_on(format_partition(&mut device, FormatOptions::default())).unwrap();

        let fs = block_on(FatFs::mount(device, VolumeConfig::default())).unwrap();
        block_on(async {
            fs.mkdir("/data").await.unwrap();
            let mut file = fs.open("/data/hello.txt", "w").await.unwrap();
            assert_eq!(file.write(&payload).await.unwrap(), payload.len());
            file.close().await.unwrap();
        });
        block_on(fs.unmount()).unwrap();
    }

    let device = registry.open_device("mmc0").unwrap();
    let fs = block_on(FatFs::mount(device, VolumeConfig::default())).unwrap();
    block_on(async {
        assert_eq!(fs.stat("/data/hello.txt").await.unwrap().size(), 10_000);
        let mut file = fs.open("/data/hello.txt", "r").await.unwrap();
        let mut back = vec![0u8; 12_000];
        let mut total = 0;
        loop {
            let read = file.read(&mut back[total..]).await.unwrap();
            if read == 0 {
                break;
            }
            total += read;
        }
        assert_eq!(&back[..total], &payload[..]);
        file.close().await.unwrap();
    });
}

//! Card bring-up and block transfers on top of an [`MmcHost`].

use embassy_time::Timer;
use statig::blocking::IntoStateMachineExt as _;

use crate::command::*;
use crate::config::SdConfig;
use crate::csd::{Cid, Csd};
use crate::error::CardError;
use crate::host::{BusWidth, CardEvent, MmcHost};
use crate::machine::{CardAction, CardMachine, CardPhase, DispatchContext, MachineEvent};
use crate::SD_BLOCK_SIZE;

/// Everything bring-up learned about the inserted card.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CardInfo {
    pub rca: u16,
    pub sdhc: bool,
    pub csd: Csd,
    pub cid: Cid,
    pub bus_width: BusWidth,
    /// Command frames carry a checked CRC. Set for cards that echo the
    /// interface-condition pattern.
    pub crc: bool,
}

impl CardInfo {
    pub fn block_size(&self) -> u32 {
        self.csd.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.csd.blocks
    }
}

/// Result of feeding a slot event to the card driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CardChange {
    Unchanged,
    Registered(CardInfo),
    Unregistered,
    BringUpFailed(CardError),
}

pub struct SdCard<H: MmcHost> {
    host: H,
    config: SdConfig,
    machine: statig::blocking::StateMachine<CardMachine>,
    info: Option<CardInfo>,
    crc: bool,
}

impl<H: MmcHost> SdCard<H> {
    pub fn new(host: H, config: SdConfig) -> Self {
        Self {
            host,
            config,
            machine: CardMachine::default().state_machine(),
            info: None,
            crc: true,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn phase(&self) -> CardPhase {
        self.machine.inner().phase
    }

    pub fn insertions(&self) -> u32 {
        self.machine.inner().insertions
    }

    pub fn info(&self) -> Option<&CardInfo> {
        self.info.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.info.is_some()
    }

    fn dispatch(&mut self, event: MachineEvent) -> CardAction {
        let mut context = DispatchContext::default();
        self.machine.handle_with_context(&event, &mut context);
        context.action
    }

    /// Feeds one slot event through the card state machine, running bring-up
    /// when a card arrives. A missing card ends bring-up without a warning;
    /// other failures are logged. Either way the slot stays idle until the
    /// next detection.
    pub async fn handle_event(&mut self, event: CardEvent) -> CardChange {
        match self.dispatch(MachineEvent::Slot(event)) {
            CardAction::Nothing => CardChange::Unchanged,
            CardAction::Teardown => {
                self.info = None;
                log::info!("sdcard: card_removed");
                CardChange::Unregistered
            }
            CardAction::Initialise => match self.initialise().await {
                Ok(info) => {
                    self.info = Some(info.clone());
                    self.dispatch(MachineEvent::BringUpDone);
                    CardChange::Registered(info)
                }
                Err(CardError::NoCard) => {
                    self.dispatch(MachineEvent::BringUpFailed);
                    CardChange::BringUpFailed(CardError::NoCard)
                }
                Err(err) => {
                    log::warn!("sdcard: bring_up_failed err={:?}", err);
                    self.dispatch(MachineEvent::BringUpFailed);
                    CardChange::BringUpFailed(err)
                }
            },
        }
    }

    fn spi_mode(&self) -> bool {
        self.host.capabilities().spi_mode
    }

    fn frame(&self, opcode: u8, arg: u32, response_type: ResponseType) -> MmcCommand {
        let mut command = MmcCommand::new(opcode, arg, response_type);
        command.crc = self.crc;
        command
    }

    async fn command(&mut self, opcode: u8, arg: u32, response_type: ResponseType) -> Result<MmcCommand, CardError> {
        self.host.select().map_err(|err| CardError::from_host(opcode, err))?;
        let mut command = self.frame(opcode, arg, response_type);
        let sent = self.host.request(&mut command).await;
        let released = self.host.deselect();
        sent.and(released).map_err(|err| CardError::from_host(opcode, err))?;
        Ok(command)
    }

    async fn app_command(
        &mut self,
        rca: u16,
        opcode: u8,
        arg: u32,
        response_type: ResponseType,
    ) -> Result<MmcCommand, CardError> {
        self.command(SD_CMD55, (rca as u32) << 16, ResponseType::R1).await?;
        self.command(opcode, arg, response_type).await
    }

    fn check_r1(&self, command: &MmcCommand) -> Result<(), CardError> {
        let errors = if self.spi_mode() { 0xFE } else { SD_R1_ERRORS };
        if command.status() & errors != 0 {
            return Err(CardError::Protocol {
                cmd: command.opcode,
                status: command.status(),
            });
        }
        Ok(())
    }

    /// Runs the card from idle to the transfer state.
    ///
    /// Every command timeout aborts the sequence; there is no rollback, the
    /// caller simply keeps the slot unregistered. The operating-condition
    /// poll has no attempt limit and ends only when the card reports ready.
    pub async fn initialise(&mut self) -> Result<CardInfo, CardError> {
        let spi = self.spi_mode();
        Timer::after_millis(self.config.settle_ms).await;
        let present = self
            .host
            .is_card_present()
            .map_err(|err| CardError::from_host(SD_CMD0, err))?;
        if !present {
            log::debug!("sdcard: bring_up_skipped reason=no_card");
            return Err(CardError::NoCard);
        }
        self.host
            .initialise()
            .await
            .map_err(|err| CardError::from_host(SD_CMD0, err))?;

        self.crc = true;
        self.command(SD_CMD0, 0, ResponseType::None).await?;

        let cond = self.command(SD_CMD8, SD_IF_COND_ARG, ResponseType::R7).await?;
        let echoed = cond.status() & 0xFFF == SD_IF_COND_ARG;
        self.crc = echoed;
        log::debug!("sdcard: if_cond echo={:#05x} v2={} crc={}", cond.status() & 0xFFF, echoed, self.crc);

        let (op_arg, op_response) = if spi {
            (SD_ACMD41_ARG_SPI, ResponseType::R1)
        } else {
            (SD_ACMD41_ARG_NATIVE, ResponseType::R3)
        };
        let mut polls = 0u32;
        let mut ocr = loop {
            let op = self.app_command(0, SD_ACMD41, op_arg, op_response).await?;
            let ready = if spi {
                op.status() & SD_SPI_R1_IDLE == 0
            } else {
                op.status() & SD_OCR_BUSY != 0
            };
            if ready {
                break op.status();
            }
            polls = polls.wrapping_add(1);
            Timer::after_millis(self.config.acmd41_poll_ms).await;
        };
        log::debug!("sdcard: op_cond ready polls={}", polls);

        if spi {
            ocr = self.command(SD_CMD58, 0, ResponseType::R3).await?.status();
        }
        let sdhc = ocr & SD_OCR_CCS != 0;

        let cid = if spi {
            self.command(SD_CMD10, 0, ResponseType::R1Data).await?
        } else {
            self.command(SD_CMD2, 0, ResponseType::R2).await?
        };
        let cid = Cid::decode(&cid.response);

        let rca = if spi {
            0
        } else {
            let relative = self.command(SD_CMD3, 0, ResponseType::R6).await?;
            let status = relative.status();
            log::debug!(
                "sdcard: rca={:#06x} crc_error={} illegal={} error={} ready_for_data={}",
                status >> 16,
                status & SD_R6_COM_CRC_ERROR != 0,
                status & SD_R6_ILLEGAL_COMMAND != 0,
                status & SD_R6_ERROR != 0,
                status & SD_R6_READY_FOR_DATA != 0
            );
            (status >> 16) as u16
        };

        let csd = if spi {
            self.command(SD_CMD9, 0, ResponseType::R1Data).await?
        } else {
            self.command(SD_CMD9, (rca as u32) << 16, ResponseType::R2).await?
        };
        let csd = Csd::decode(&csd.response);

        if !spi {
            self.command(SD_CMD7, (rca as u32) << 16, ResponseType::R1b).await?;
            let status = self.command(SD_CMD13, (rca as u32) << 16, ResponseType::R1).await?;
            let state = status.current_state();
            if state != SD_STATE_TRAN && state != SD_STATE_DIS {
                log::warn!("sdcard: select_failed state={}", state);
                return Err(CardError::Protocol {
                    cmd: SD_CMD7,
                    status: status.status(),
                });
            }
        }

        if !sdhc {
            let blocklen = self.command(SD_CMD16, SD_BLOCK_SIZE as u32, ResponseType::R1).await?;
            self.check_r1(&blocklen)?;
        }

        let bus_width = self.negotiate_bus_width(rca).await;
        let info = CardInfo {
            rca,
            sdhc,
            csd,
            cid,
            bus_width,
            crc: self.crc,
        };
        log::info!(
            "sdcard: ready rca={:#06x} sdhc={} blocks={} product={} width={:?}",
            info.rca,
            info.sdhc,
            info.csd.blocks,
            info.cid.product.as_str(),
            info.bus_width
        );
        Ok(info)
    }

    /// Tries to move to a 4-bit bus. Failure keeps the 1-bit bus.
    async fn negotiate_bus_width(&mut self, rca: u16) -> BusWidth {
        let caps = self.host.capabilities();
        if caps.spi_mode || !caps.wide_bus {
            return BusWidth::One;
        }
        let switched = match self.app_command(rca, SD_ACMD6, 2, ResponseType::R1).await {
            Ok(reply) => match self.check_r1(&reply) {
                Ok(()) => self
                    .host
                    .set_bus_width(BusWidth::Four)
                    .await
                    .map_err(|err| CardError::from_host(SD_ACMD6, err)),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        match switched {
            Ok(()) => BusWidth::Four,
            Err(err) => {
                log::warn!("sdcard: bus_width_unchanged err={:?}", err);
                BusWidth::One
            }
        }
    }

    fn transfer_target(&self, buf_len: usize) -> Result<(u16, bool, usize), CardError> {
        let info = self.info.as_ref().ok_or(CardError::NotReady)?;
        if buf_len % SD_BLOCK_SIZE != 0 {
            return Err(CardError::Misaligned(buf_len));
        }
        Ok((info.rca, info.sdhc, buf_len / SD_BLOCK_SIZE))
    }

    fn address(sdhc: bool, lba: u32) -> u32 {
        if sdhc {
            lba
        } else {
            lba.saturating_mul(SD_BLOCK_SIZE as u32)
        }
    }

    /// Stops a transfer a previous aborted request left running.
    async fn stop_if_sending(&mut self, rca: u16) -> Result<(), CardError> {
        if self.spi_mode() {
            return Ok(());
        }
        let status = self.command(SD_CMD13, (rca as u32) << 16, ResponseType::R1).await?;
        if status.current_state() == SD_STATE_DATA {
            log::debug!("sdcard: stopping_stale_transfer");
            self.command(SD_CMD12, 0, ResponseType::R1b).await?;
            self.command(SD_CMD13, (rca as u32) << 16, ResponseType::R1).await?;
        }
        Ok(())
    }

    async fn read_once(&mut self, opcode: u8, arg: u32, rca: u16, buf: &mut [u8]) -> Result<usize, CardError> {
        self.stop_if_sending(rca).await?;
        let blocks = buf.len() / SD_BLOCK_SIZE;
        self.host.select().map_err(|err| CardError::from_host(opcode, err))?;
        let result = async {
            let mut command = self.frame(opcode, arg, ResponseType::R1);
            self.host
                .request(&mut command)
                .await
                .map_err(|err| CardError::from_host(opcode, err))?;
            self.check_r1(&command)?;
            let read = self
                .host
                .read_blocks(buf)
                .await
                .map_err(|err| CardError::from_host(opcode, err))?;
            if blocks > 1 {
                let mut stop = self.frame(SD_CMD12, 0, ResponseType::R1b);
                self.host
                    .request(&mut stop)
                    .await
                    .map_err(|err| CardError::from_host(SD_CMD12, err))?;
            }
            if read != blocks {
                return Err(CardError::BadResponse(opcode));
            }
            Ok::<usize, CardError>(read)
        }
        .await;
        let released = self.host.deselect().map_err(|err| CardError::from_host(opcode, err));
        let read = result?;
        released?;
        Ok(read)
    }

    async fn write_once(&mut self, opcode: u8, arg: u32, rca: u16, buf: &[u8]) -> Result<usize, CardError> {
        self.stop_if_sending(rca).await?;
        let blocks = buf.len() / SD_BLOCK_SIZE;
        let multi = blocks > 1;
        let spi = self.spi_mode();
        self.host.select().map_err(|err| CardError::from_host(opcode, err))?;
        let result = async {
            let mut command = self.frame(opcode, arg, ResponseType::R1);
            self.host
                .request(&mut command)
                .await
                .map_err(|err| CardError::from_host(opcode, err))?;
            self.check_r1(&command)?;
            let written = self
                .host
                .write_blocks(buf, multi)
                .await
                .map_err(|err| CardError::from_host(opcode, err))?;
            if multi && !spi {
                let mut stop = self.frame(SD_CMD12, 0, ResponseType::R1b);
                self.host
                    .request(&mut stop)
                    .await
                    .map_err(|err| CardError::from_host(SD_CMD12, err))?;
            }
            if written != blocks {
                return Err(CardError::BadResponse(opcode));
            }
            Ok::<usize, CardError>(written)
        }
        .await;
        let released = self.host.deselect().map_err(|err| CardError::from_host(opcode, err));
        let written = result?;
        released?;
        Ok(written)
    }

    /// Reads whole blocks starting at `lba`. A command timeout is retried up
    /// to the configured attempt count; `buf` is untouched unless the card
    /// accepted the read command.
    pub async fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, CardError> {
        let (rca, sdhc, blocks) = self.transfer_target(buf.len())?;
        if blocks == 0 {
            return Ok(0);
        }
        let opcode = if blocks == 1 { SD_CMD17 } else { SD_CMD18 };
        let arg = Self::address(sdhc, lba);
        let mut last = CardError::Timeout(opcode);
        for attempt in 1..=self.config.io_retries {
            match self.read_once(opcode, arg, rca, buf).await {
                Ok(read) => return Ok(read),
                Err(err) if err.is_timeout() => {
                    log::warn!("sdcard: read_retry lba={} blocks={} attempt={} err={:?}", lba, blocks, attempt, err);
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        log::warn!("sdcard: read_failed lba={} blocks={}", lba, blocks);
        Err(last)
    }

    /// Writes whole blocks starting at `lba`. A single block goes out as
    /// CMD24; longer runs use CMD25 and end with a stop.
    pub async fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<usize, CardError> {
        let (rca, sdhc, blocks) = self.transfer_target(buf.len())?;
        if blocks == 0 {
            return Ok(0);
        }
        let opcode = if blocks == 1 { SD_CMD24 } else { SD_CMD25 };
        let arg = Self::address(sdhc, lba);
        let mut last = CardError::Timeout(opcode);
        for attempt in 1..=self.config.io_retries {
            match self.write_once(opcode, arg, rca, buf).await {
                Ok(written) => return Ok(written),
                Err(err) if err.is_timeout() => {
                    log::warn!("sdcard: write_retry lba={} blocks={} attempt={} err={:?}", lba, blocks, attempt, err);
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        log::warn!("sdcard: write_failed lba={} blocks={}", lba, blocks);
        Err(last)
    }
}

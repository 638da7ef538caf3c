//! Typed flash commands built on top of [`crate::spi_engine::transfer`].
//! Every method here builds an opcode, an optional big-endian address, and
//! an optional payload, then interprets the result.

use std::time::Instant;

use crate::controller::{max_sector_count, sector_for, ControllerState, Vendor};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::register_bus::{control, offset, status, RegisterBus};
use crate::spi_engine::{self, POLL_TIMEOUT};

const OP_WRITE_ENABLE: u8 = 0x06;
const OP_STATUS_READ: u8 = 0x05;
const OP_IDCODE_READ: u8 = 0x9F;
const OP_EXTENDED_ADDRESS_WRITE: u8 = 0xC5;
const OP_BULK_ERASE: u8 = 0xC7;
pub const OP_PAGE_PROGRAM_MACRONIX: u8 = 0x02;
pub const OP_QUAD_WRITE_MICRON: u8 = 0x32;
pub const OP_QUAD_READ: u8 = 0x6B;

/// 4 KiB/32 KiB/64 KiB subsector erase opcodes.
pub const ERASE_4K: u8 = 0x20;
pub const ERASE_32K: u8 = 0x52;
pub const ERASE_64K: u8 = 0xD8;

/// Payload bytes exchanged by [`FlashCommands::write_page`]/
/// [`FlashCommands::read_page`].
pub const WRITE_DATA_SIZE: usize = 128;
const IDCODE_READ_BYTES: usize = 5;
const STATUS_READ_BYTES: usize = 2;
const QUAD_READ_DUMMY_BYTES: usize = 4;
const FLASH_SR_IS_READY_MASK: u8 = 0x01;

/// Flash-command layer: owns the register bus, the session's controller
/// state, and the shared scratch buffers callers fill before a transfer.
///
/// Bytes `0..4` of `write_buf` are reserved for opcode + address; page data
/// starts at offset 4.
#[derive(Debug)]
pub struct FlashCommands<D: Device> {
    bus: RegisterBus<D>,
    pub state: ControllerState,
    write_buf: [u8; 4 + WRITE_DATA_SIZE],
    read_buf: [u8; 4 + WRITE_DATA_SIZE + 4],
}

impl<D: Device> FlashCommands<D> {
    pub fn new(bus: RegisterBus<D>, state: ControllerState) -> Self {
        Self {
            bus,
            state,
            write_buf: [0u8; 4 + WRITE_DATA_SIZE],
            read_buf: [0u8; 4 + WRITE_DATA_SIZE + 4],
        }
    }

    pub fn bus(&mut self) -> &mut RegisterBus<D> {
        &mut self.bus
    }

    /// Retargets subsequent commands at a different physical flash chip.
    /// The Extended Address Register is per-chip hardware state, so the
    /// cached `selected_sector` from the previous chip must not survive the
    /// switch.
    pub fn switch_slave(&mut self, slave_index: u8) {
        self.state.slave_index = slave_index;
        self.state.invalidate_sector();
    }

    /// The region of the write buffer callers fill before [`Self::write_page`]
    /// (offset 4, exactly [`WRITE_DATA_SIZE`] bytes).
    pub fn write_page_data_mut(&mut self) -> &mut [u8] {
        &mut self.write_buf[4..4 + WRITE_DATA_SIZE]
    }

    fn reset_fifos(&mut self) -> Result<()> {
        let control_reg = self.bus.read32(offset::CONTROL)?;
        self.bus.write32(
            offset::CONTROL,
            control_reg | control::TX_FIFO_RESET | control::RX_FIFO_RESET,
        )
    }

    /// Sends opcode `0x06`. Fails immediately if `tx-full` was already set,
    /// rather than entering `transfer` and discovering it there.
    pub fn write_enable(&mut self) -> Result<()> {
        let status_reg = self.bus.read32(offset::STATUS)?;
        if status_reg & status::TX_FULL != 0 {
            return Err(Error::ProtocolError("tx fifo full during write enable"));
        }
        spi_engine::transfer(&mut self.bus, &self.state, &[OP_WRITE_ENABLE], None, 1)?;
        spi_engine::wait_tx_empty(&mut self.bus)
    }

    /// Polls up to [`POLL_TIMEOUT`], sending `0x05` and treating
    /// `recv[1] & 1 == 0` as ready.
    pub fn is_flash_ready(&mut self) -> Result<()> {
        let start = Instant::now();
        loop {
            let mut recv = [0u8; STATUS_READ_BYTES];
            spi_engine::transfer(
                &mut self.bus,
                &self.state,
                &[OP_STATUS_READ, 0],
                Some(&mut recv),
                STATUS_READ_BYTES,
            )?;
            if recv[1] & FLASH_SR_IS_READY_MASK == 0 {
                return Ok(());
            }
            if start.elapsed() >= POLL_TIMEOUT {
                return Err(Error::Timeout("flash ready"));
            }
        }
    }

    /// Sends `0x9F` twice (the first read is a throwaway hardware quirk) and
    /// classifies the response, caching vendor and sector count on success.
    pub fn read_id_code(&mut self) -> Result<()> {
        self.is_flash_ready()?;

        let send = [OP_IDCODE_READ, 0, 0, 0, 0];
        let mut recv = [0u8; IDCODE_READ_BYTES];
        spi_engine::transfer(&mut self.bus, &self.state, &send, Some(&mut recv), IDCODE_READ_BYTES)?;
        spi_engine::transfer(&mut self.bus, &self.state, &send, Some(&mut recv), IDCODE_READ_BYTES)?;

        if recv[3] == 0xFF {
            return Err(Error::DeviceUnsupported("JEDEC capacity byte read as 0xFF".into()));
        }
        let all_ff = recv[1..].iter().all(|&b| b == 0xFF);
        if all_ff {
            return Err(Error::DeviceUnsupported("JEDEC id code read as all 0xFF".into()));
        }

        let sectors = max_sector_count(recv[3])
            .ok_or_else(|| Error::DeviceUnsupported(format!("unrecognized JEDEC capacity byte 0x{:02X}", recv[3])))?;

        self.state.flash_vendor = Vendor::from_jedec_byte(recv[1]);
        self.state.max_sector_count = sectors;
        Ok(())
    }

    /// Writes the Extended Address Register iff `getSector(addr)` differs
    /// from the cached sector; fails if the sector exceeds the chip's
    /// capacity.
    pub fn set_sector(&mut self, addr: u32) -> Result<()> {
        let sector = sector_for(addr);
        if u32::from(sector) >= self.state.max_sector_count {
            return Err(Error::DeviceUnsupported(format!(
                "sector {} exceeds chip capacity of {} sectors",
                sector, self.state.max_sector_count
            )));
        }
        if self.state.selected_sector == Some(sector) {
            return Ok(());
        }
        self.write_register(OP_EXTENDED_ADDRESS_WRITE, u32::from(sector), 1)?;
        self.state.selected_sector = Some(sector);
        Ok(())
    }

    /// Erases a 4 KiB/32 KiB/64 KiB subsector containing `addr`.
    pub fn sector_erase(&mut self, addr: u32, erase_cmd: u8) -> Result<()> {
        self.is_flash_ready()?;
        self.set_sector(addr)?;
        self.write_enable()?;
        self.reset_fifos()?;

        let send = [erase_cmd, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8];
        spi_engine::transfer(&mut self.bus, &self.state, &send, None, send.len())?;
        spi_engine::wait_tx_empty(&mut self.bus)
    }

    /// Erases the entire attached chip.
    pub fn bulk_erase(&mut self) -> Result<()> {
        self.is_flash_ready()?;
        self.write_enable()?;
        spi_engine::transfer(&mut self.bus, &self.state, &[OP_BULK_ERASE], None, 1)?;
        spi_engine::wait_tx_empty(&mut self.bus)
    }

    /// Programs exactly [`WRITE_DATA_SIZE`] bytes at `addr`, taken from the
    /// region [`Self::write_page_data_mut`] returns. `write_cmd` is `0x02`
    /// for Macronix, `0x32` for Micron — the two vendors' page-program
    /// opcodes differ even though the address/payload framing is identical.
    pub fn write_page(&mut self, addr: u32, write_cmd: u8) -> Result<()> {
        self.is_flash_ready()?;
        self.set_sector(addr)?;
        self.write_enable()?;
        self.reset_fifos()?;

        self.write_buf[0] = write_cmd;
        self.write_buf[1] = (addr >> 16) as u8;
        self.write_buf[2] = (addr >> 8) as u8;
        self.write_buf[3] = addr as u8;

        let len = 4 + WRITE_DATA_SIZE;
        spi_engine::transfer(&mut self.bus, &self.state, &self.write_buf, None, len)?;
        spi_engine::wait_tx_empty(&mut self.bus)
    }

    /// Reads exactly [`WRITE_DATA_SIZE`] bytes from `addr` using quad
    /// fast-read (`0x6B` plus 4 dummy bytes), leaving the RX FIFO reset.
    pub fn read_page(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        assert_eq!(out.len(), WRITE_DATA_SIZE);
        self.is_flash_ready()?;
        self.set_sector(addr)?;
        self.reset_fifos()?;

        let send = [OP_QUAD_READ, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8];
        let len = send.len() + WRITE_DATA_SIZE + QUAD_READ_DUMMY_BYTES;
        assert!(len <= self.read_buf.len());

        let mut padded_send = [0u8; 4 + WRITE_DATA_SIZE + 4];
        padded_send[..send.len()].copy_from_slice(&send);

        spi_engine::transfer(&mut self.bus, &self.state, &padded_send, Some(&mut self.read_buf), len)?;
        spi_engine::wait_tx_empty(&mut self.bus)?;
        self.reset_fifos()?;

        let data_start = send.len() + QUAD_READ_DUMMY_BYTES;
        out.copy_from_slice(&self.read_buf[data_start..data_start + WRITE_DATA_SIZE]);
        Ok(())
    }

    /// Reads `n` bytes of a flash status/config register.
    pub fn read_register(&mut self, cmd: u8, n: usize) -> Result<Vec<u8>> {
        self.is_flash_ready()?;
        let mut send = vec![0u8; n];
        send[0] = cmd;
        let mut recv = vec![0u8; n];
        spi_engine::transfer(&mut self.bus, &self.state, &send, Some(&mut recv), n)?;
        Ok(recv)
    }

    /// Writes a flash status/config register. `extra_bytes` is the number of
    /// value bytes following the opcode (0, 1, or 2).
    pub fn write_register(&mut self, cmd: u8, value: u32, extra_bytes: usize) -> Result<()> {
        assert!(extra_bytes <= 2, "writeRegister supports at most 2 value bytes");
        self.is_flash_ready()?;
        self.write_enable()?;
        self.reset_fifos()?;

        let mut send = vec![0u8; 1 + extra_bytes];
        send[0] = cmd;
        match extra_bytes {
            0 => {}
            1 => send[1] = value as u8,
            2 => {
                send[1] = (value >> 8) as u8;
                send[2] = value as u8;
            }
            _ => unreachable!(),
        }
        spi_engine::transfer(&mut self.bus, &self.state, &send, None, send.len())?;
        spi_engine::wait_tx_empty(&mut self.bus)
    }
}

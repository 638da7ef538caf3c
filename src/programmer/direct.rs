//! Direct-MMIO programming path: the core drives [`FlashCommands`] itself
//! instead of delegating to a kernel driver.

use crate::bitstream_guard::{self, guard_address};
use crate::controller::{ControllerState, Vendor};
use crate::device::Device;
use crate::error::Result;
use crate::flash_commands::{FlashCommands, OP_PAGE_PROGRAM_MACRONIX, OP_QUAD_WRITE_MICRON, ERASE_4K, WRITE_DATA_SIZE};
use crate::mcs::{extent_bytes, parse_extents, Extent};
use crate::register_bus::{control, offset, RegisterBus, SOFTWARE_RESET_MAGIC};

use super::{busy_wait, PAGE_DELAY};

/// The erase granularity used while clearing an extent's address range
/// ahead of programming.
const SUBSECTOR_SIZE: u32 = 0x1000;

/// Soft-resets the controller, drives it into the start state, invalidates
/// the cached sector, and identifies the attached chip. Aborts (via
/// [`FlashCommands::read_id_code`]'s error) if the chip can't be classified,
/// since every later opcode depends on knowing which vendor's write command
/// to issue.
pub fn prepare<D: Device>(bus: RegisterBus<D>, slave_index: u8) -> Result<FlashCommands<D>> {
    let mut cmd = FlashCommands::new(bus, ControllerState::new(slave_index));
    reset_and_detect(&mut cmd)?;
    Ok(cmd)
}

fn reset_and_detect<D: Device>(cmd: &mut FlashCommands<D>) -> Result<()> {
    cmd.bus().write32(offset::SOFTWARE_RESET, SOFTWARE_RESET_MAGIC)?;
    cmd.bus().write32(offset::CONTROL, control::START_STATE)?;
    cmd.state.invalidate_sector();
    cmd.read_id_code()
}

pub(crate) fn write_cmd_for(vendor: Option<Vendor>) -> u8 {
    match vendor {
        Some(Vendor::Macronix) => OP_PAGE_PROGRAM_MACRONIX,
        _ => OP_QUAD_WRITE_MICRON,
    }
}

fn erase_extent<D: Device>(cmd: &mut FlashCommands<D>, extent: &Extent, addr_shift: u32) -> Result<()> {
    let mut addr = extent.start_address + addr_shift;
    let end = extent.end_address + addr_shift;
    while addr < end {
        cmd.sector_erase(addr, ERASE_4K)?;
        addr += SUBSECTOR_SIZE;
    }
    Ok(())
}

fn program_extent<D: Device>(cmd: &mut FlashCommands<D>, mcs: &str, extent: &Extent, addr_shift: u32) -> Result<()> {
    let data = extent_bytes(mcs, extent)?;
    let write_cmd = write_cmd_for(cmd.state.flash_vendor);
    let base = extent.start_address + addr_shift;
    for (page_index, chunk) in data.chunks(WRITE_DATA_SIZE).enumerate() {
        cmd.write_page_data_mut().fill(0xFF);
        cmd.write_page_data_mut()[..chunk.len()].copy_from_slice(chunk);
        let addr = base + (page_index * WRITE_DATA_SIZE) as u32;
        cmd.write_page(addr, write_cmd)?;
        busy_wait(PAGE_DELAY);
    }
    Ok(())
}

/// Programs a single flash chip from one MCS image: installs the bitstream
/// guard if the image isn't golden, erases every affected extent, writes
/// every extent, then removes the guard. `cmd` must already have been
/// produced by [`prepare`].
pub fn program<D: Device>(cmd: &mut FlashCommands<D>, mcs: &str) -> Result<()> {
    let extents = parse_extents(mcs)?;
    let golden = extents.first().map_or(true, |e| e.start_address == 0);
    let addr_shift = if golden { 0 } else { bitstream_guard::GUARD_BLOCK_SIZE };

    if !golden {
        bitstream_guard::install_single(cmd, guard_address(false))?;
    }

    for extent in &extents {
        erase_extent(cmd, extent, addr_shift)?;
    }
    for extent in &extents {
        program_extent(cmd, mcs, extent, addr_shift)?;
    }

    if !golden {
        bitstream_guard::remove_single(cmd, guard_address(false))?;
    }
    Ok(())
}

/// Programs a dual-flash card from two MCS images, one per physical chip:
/// the whole single-chip sequence runs once with slave 0 targeted, then
/// again with slave 1. Both chips share one [`RegisterBus`]; only the
/// targeted slave changes between halves.
pub fn program_dual<D: Device>(bus: RegisterBus<D>, mcs: [&str; 2]) -> Result<()> {
    let mut cmd = prepare(bus, 0)?;

    let extents0 = parse_extents(mcs[0])?;
    let golden = extents0.first().map_or(true, |e| e.start_address == 0);
    let addr_shift = if golden { 0 } else { bitstream_guard::GUARD_BLOCK_SIZE };
    let guard_addr = guard_address(true);

    if !golden {
        bitstream_guard::install_dual(&mut cmd, guard_addr, 0, 1)?;
    }

    cmd.switch_slave(0);
    for extent in &extents0 {
        erase_extent(&mut cmd, extent, addr_shift)?;
    }
    for extent in &extents0 {
        program_extent(&mut cmd, mcs[0], extent, addr_shift)?;
    }

    cmd.switch_slave(1);
    reset_and_detect(&mut cmd)?;
    let extents1 = parse_extents(mcs[1])?;
    for extent in &extents1 {
        erase_extent(&mut cmd, extent, addr_shift)?;
    }
    for extent in &extents1 {
        program_extent(&mut cmd, mcs[1], extent, addr_shift)?;
    }

    if !golden {
        bitstream_guard::remove_dual(&mut cmd, guard_addr, 0, 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use std::collections::VecDeque;

    fn golden_mcs() -> String {
        format!(
            ":020000040000FA\n:04000000DEADBEEF00\n:00000001FF\n"
        )
    }

    fn non_golden_mcs() -> String {
        format!(
            ":020000040100F9\n:04000000CAFEBABE00\n:00000001FF\n"
        )
    }

    fn ready_device() -> MockDevice {
        let mut dev = MockDevice::new();
        // Ready check (2 bytes) + 2x IDCODE_READ (5 bytes) identifying a
        // Macronix chip with 2 sectors.
        let id = [0x00, 0xC2, 0x00, 0x19, 0x00];
        let mut queue = VecDeque::from(vec![0x00, 0x00]);
        queue.extend(id.iter().copied());
        queue.extend(id.iter().copied());
        dev.response_bytes = queue;
        dev
    }

    #[test]
    fn golden_image_skips_guard_and_writes_slave_zero() {
        let bus = RegisterBus::new(ready_device());
        let mut cmd = prepare(bus, 0).unwrap();
        let mcs = golden_mcs();
        program(&mut cmd, &mcs).unwrap();
        assert_eq!(cmd.state.slave_index, 0);
        // No erase targeting the guard address should have been issued.
        let sent = cmd.bus().device_mut().sent.clone();
        let guard_erase = [ERASE_4K, 0x00, 0x20, 0x00];
        assert!(!sent.windows(4).any(|w| w == guard_erase));
    }

    #[test]
    fn non_golden_image_installs_and_removes_guard() {
        let bus = RegisterBus::new(ready_device());
        let mut cmd = prepare(bus, 0).unwrap();
        let mcs = non_golden_mcs();
        program(&mut cmd, &mcs).unwrap();
        let sent = cmd.bus().device_mut().sent.clone();
        let guard_erase = [ERASE_4K, 0x00, 0x20, 0x00];
        assert!(sent.windows(4).any(|w| w == guard_erase));
    }
}

//! The bitstream guard: a sentinel configuration-engine program written
//! ahead of the real bitstream so that, if programming is interrupted, the
//! card's configuration engine finds the guard instead of a half-written
//! bitstream and refuses to boot it.

use crate::device::Device;
use crate::error::Result;
use crate::flash_commands::{FlashCommands, ERASE_4K, WRITE_DATA_SIZE};
use crate::programmer::direct::write_cmd_for;
use crate::striper::stripe;

/// Size of the guarded block and the amount every write is shifted down by
/// once a guard is installed.
pub const GUARD_BLOCK_SIZE: u32 = 0x1000;

/// Guard address for a single-flash card.
pub const GUARD_ADDRESS_SINGLE: u32 = 0x0100_2000;

/// Guard address for a dual-flash card (the single-flash address, halved —
/// each physical flash only sees every other nibble of the real address
/// space once bytes are striped across the pair).
pub const GUARD_ADDRESS_DUAL: u32 = GUARD_ADDRESS_SINGLE / 2;

/// The 11-word configuration-engine sentinel program, placed at byte offset
/// 128 of the guard block; every other byte of the block is `0xFF`.
const GUARD_WORDS: [u32; 11] = [
    0xFFFF_FFFF, // DUMMY
    0xBB00_0000, // BUSWIDTH1
    0x4400_2211, // BUSWIDTH2
    0xFFFF_FFFF, // DUMMY
    0xFFFF_FFFF, // DUMMY
    0x6655_99AA, // SYNC
    0x0000_0020, // NOOP
    0x0120_0230, // TIMER
    0x0200_0040, // WDT_ENABLE
    0x0000_0020, // NOOP
    0x0000_0020, // NOOP
];

const GUARD_WORD_OFFSET: usize = 128;

/// Builds the full 4 KiB guard block: `0xFF` everywhere except the sentinel
/// program at [`GUARD_WORD_OFFSET`].
pub(crate) fn guard_block() -> Vec<u8> {
    let mut block = vec![0xFFu8; GUARD_BLOCK_SIZE as usize];
    for (i, word) in GUARD_WORDS.iter().enumerate() {
        block[GUARD_WORD_OFFSET + i * 4..GUARD_WORD_OFFSET + i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    block
}

fn write_block<D: Device>(cmd: &mut FlashCommands<D>, addr: u32, block: &[u8]) -> Result<()> {
    cmd.sector_erase(addr, ERASE_4K)?;
    let write_cmd = write_cmd_for(cmd.state.flash_vendor);
    for (page_index, page) in block.chunks(WRITE_DATA_SIZE).enumerate() {
        cmd.write_page_data_mut().fill(0xFF);
        cmd.write_page_data_mut()[..page.len()].copy_from_slice(page);
        let page_addr = addr + (page_index * WRITE_DATA_SIZE) as u32;
        cmd.write_page(page_addr, write_cmd)?;
    }
    Ok(())
}

/// Installs the guard on a single-flash card.
pub fn install_single<D: Device>(cmd: &mut FlashCommands<D>, addr: u32) -> Result<()> {
    write_block(cmd, addr, &guard_block())
}

/// Installs the guard on a dual-flash card: the block is striped in half and
/// each half is written to its own chip, retargeting `cmd` between writes
/// since the two chips share one controller.
pub fn install_dual<D: Device>(cmd: &mut FlashCommands<D>, addr: u32, slave_a: u8, slave_b: u8) -> Result<()> {
    let (half_a, half_b) = stripe(&guard_block());
    cmd.switch_slave(slave_a);
    write_block(cmd, addr, &half_a)?;
    cmd.switch_slave(slave_b);
    write_block(cmd, addr, &half_b)
}

/// Removes a previously installed single-flash guard by erasing its
/// subsector. Must only be called after the real bitstream has been fully
/// programmed: if this call itself fails partway, the card is left wedged
/// until re-flashed.
pub fn remove_single<D: Device>(cmd: &mut FlashCommands<D>, addr: u32) -> Result<()> {
    cmd.sector_erase(addr, ERASE_4K)
}

/// Removes a dual-flash guard from both chips.
pub fn remove_dual<D: Device>(cmd: &mut FlashCommands<D>, addr: u32, slave_a: u8, slave_b: u8) -> Result<()> {
    cmd.switch_slave(slave_a);
    cmd.sector_erase(addr, ERASE_4K)?;
    cmd.switch_slave(slave_b);
    cmd.sector_erase(addr, ERASE_4K)
}

/// The guard address to use for a session, given whether the card is
/// dual-flash.
pub fn guard_address(dual_flash: bool) -> u32 {
    if dual_flash {
        GUARD_ADDRESS_DUAL
    } else {
        GUARD_ADDRESS_SINGLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerState;
    use crate::device::mock::MockDevice;
    use crate::register_bus::RegisterBus;

    fn commands() -> FlashCommands<MockDevice> {
        let bus = RegisterBus::new(MockDevice::new());
        let mut state = ControllerState::new(0);
        state.max_sector_count = 4;
        FlashCommands::new(bus, state)
    }

    #[test]
    fn guard_block_has_sentinel_at_offset_128() {
        let block = guard_block();
        assert_eq!(block.len(), GUARD_BLOCK_SIZE as usize);
        assert_eq!(&block[..GUARD_WORD_OFFSET], &vec![0xFFu8; GUARD_WORD_OFFSET][..]);
        assert_eq!(&block[GUARD_WORD_OFFSET..GUARD_WORD_OFFSET + 4], &0xFFFF_FFFFu32.to_be_bytes());
        assert_eq!(
            &block[GUARD_WORD_OFFSET + 4..GUARD_WORD_OFFSET + 8],
            &0xBB00_0000u32.to_be_bytes()
        );
    }

    #[test]
    fn dual_flash_guard_address_is_halved() {
        assert_eq!(guard_address(false), 0x0100_2000);
        assert_eq!(guard_address(true), 0x0080_1000);
    }

    #[test]
    fn install_then_remove_issues_matching_erase_at_guard_address() {
        let mut cmd = commands();
        let addr = guard_address(false);
        install_single(&mut cmd, addr).unwrap();
        remove_single(&mut cmd, addr).unwrap();
        // The erase opcode + 3-byte address appears at both the start
        // (install) and the end (remove) of the transcript.
        let sent = cmd.bus().device_mut().sent.clone();
        let needle = [ERASE_4K, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8];
        assert!(sent.windows(4).any(|w| w == needle));
    }

    #[test]
    fn dual_install_retargets_both_slaves() {
        let mut cmd = commands();
        cmd.state.max_sector_count = 4;
        let addr = guard_address(true);
        install_dual(&mut cmd, addr, 0, 1).unwrap();
        assert_eq!(cmd.state.slave_index, 1);
        remove_dual(&mut cmd, addr, 0, 1).unwrap();
        assert_eq!(cmd.state.slave_index, 1);
    }
}

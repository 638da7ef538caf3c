//! Whole-chip erase by subsector sweep: used instead of
//! [`crate::flash_commands::FlashCommands::bulk_erase`] when the caller wants
//! progress feedback and the ability to stop cleanly on the first failing
//! erase rather than handing control to the chip's own bulk-erase cycle.

use crate::device::Device;
use crate::error::Result;
use crate::flash_commands::{FlashCommands, ERASE_32K};

/// Erase granularity used while sweeping the whole chip.
const SUBSECTOR_SIZE: u32 = 0x8000;

/// A progress mark is emitted every this many erases, i.e. every 4 MiB
/// (`128 * 0x8000 == 0x40_0000`).
const ERASES_PER_PROGRESS_MARK: u32 = 128;

/// Erases every subsector of the attached chip, from address 0 up to
/// `maxSectorCount << 24`, calling `on_progress` once per
/// [`ERASES_PER_PROGRESS_MARK`] erases completed. Stops at the first failing
/// erase, leaving the chip partially erased: there is no guard protecting a
/// chip-wide erase, so an interruption here always requires a re-flash.
pub fn erase_chip<D: Device>(cmd: &mut FlashCommands<D>, mut on_progress: impl FnMut(u32)) -> Result<()> {
    let end = cmd.state.max_sector_count << 24;
    let mut addr = 0u32;
    let mut erases = 0u32;
    while addr < end {
        cmd.sector_erase(addr, ERASE_32K)?;
        addr += SUBSECTOR_SIZE;
        erases += 1;
        if erases % ERASES_PER_PROGRESS_MARK == 0 {
            on_progress(addr);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerState;
    use crate::device::mock::MockDevice;
    use crate::register_bus::RegisterBus;

    fn commands(sectors: u32) -> FlashCommands<MockDevice> {
        let bus = RegisterBus::new(MockDevice::new());
        let mut state = ControllerState::new(0);
        state.max_sector_count = sectors;
        FlashCommands::new(bus, state)
    }

    #[test]
    fn erases_whole_single_sector_chip() {
        let mut cmd = commands(1);
        erase_chip(&mut cmd, |_| {}).unwrap();
        let sent = cmd.bus().device_mut().sent.clone();
        let erase_count = sent.chunks(4).filter(|w| w.first() == Some(&ERASE_32K)).count();
        assert_eq!(erase_count, (0x0100_0000u32 / SUBSECTOR_SIZE) as usize);
    }

    #[test]
    fn reports_progress_every_4_mib() {
        let mut cmd = commands(1);
        let mut marks = 0;
        erase_chip(&mut cmd, |_| marks += 1).unwrap();
        let total_erases = 0x0100_0000u32 / SUBSECTOR_SIZE;
        assert_eq!(marks, total_erases / ERASES_PER_PROGRESS_MARK);
    }

    #[test]
    fn stops_at_first_failing_erase() {
        let mut cmd = commands(1);
        cmd.bus().device_mut().force_command_err = true;
        let err = erase_chip(&mut cmd, |_| {}).unwrap_err();
        assert!(matches!(err, crate::error::Error::ControllerError));
    }
}

//! The low-level transfer primitive: loads the TX FIFO, asserts the slave
//! select, polls `tx-empty`/`rx-empty`, drains the RX FIFO, and returns the
//! controller to the inhibited, no-slave state.
//!
//! This is deliberately a free function rather than a method on a struct: it
//! needs only a [`RegisterBus`] and the session's cached `slave_index`, and
//! keeping it stateless makes it straightforward to unit test against a
//! [`crate::device::mock::MockDevice`] driven purely by register writes.

use std::time::{Duration, Instant};

use crate::controller::ControllerState;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::register_bus::{control, offset, status, RegisterBus};

/// The poll deadline used for both `tx-empty` and flash-ready waits. A
/// high-resolution busy-wait is preserved here rather than a thread sleep;
/// `Instant` gives the same blocking, non-sleeping semantics without pulling
/// in a platform timer API.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(3);

/// Computes the active-low slave-select mask for `slave_index`: all bits set
/// except the one selecting this slave. An out-of-range `slave_index` (32 or
/// higher) can't clear any bit of a `u32`, which is exactly the "no slave
/// selected" condition validated below.
fn slave_select_mask(slave_index: u8) -> u32 {
    match 1u32.checked_shl(u32::from(slave_index)) {
        Some(bit) => !bit,
        None => u32::MAX,
    }
}

/// Exchanges `send_buf` for `recv_buf` over the SPI bus, exchanging exactly
/// `byte_count` bytes. `send_buf` and `recv_buf` (when present) must each be
/// at least `byte_count` bytes; callers that don't care about the response
/// pass `None`.
///
/// On return, the flash has observed the exact `send_buf` byte sequence and
/// `recv_buf` (if given) holds exactly `byte_count` response bytes. The
/// controller is left inhibited with no slave asserted.
pub fn transfer<D: Device>(
    bus: &mut RegisterBus<D>,
    state: &ControllerState,
    send_buf: &[u8],
    mut recv_buf: Option<&mut [u8]>,
    byte_count: usize,
) -> Result<()> {
    assert!(send_buf.len() >= byte_count, "send_buf shorter than byte_count");
    if let Some(ref buf) = recv_buf {
        assert!(buf.len() >= byte_count, "recv_buf shorter than byte_count");
    }

    let mask = slave_select_mask(state.slave_index);

    let control_reg = bus.read32(offset::CONTROL)?;
    if control_reg & control::MASTER_MODE != 0
        && control_reg & control::LOOPBACK == 0
        && mask == u32::MAX
    {
        return Err(Error::ProtocolError("no slave selected"));
    }

    check_command_error(bus)?;

    // Fill the TX FIFO with as many bytes as it will take.
    let mut send_pos = fill_tx_fifo(bus, send_buf, 0)?;

    bus.write32(offset::SLAVE_SELECT, mask)?;

    // Start the transfer by releasing the transmit inhibit.
    let control_reg = bus.read32(offset::CONTROL)?;
    bus.write32(offset::CONTROL, control_reg & !control::TRANS_INHIBIT)?;

    let mut remaining = byte_count;
    let mut recv_pos = 0usize;
    while remaining > 0 {
        wait_tx_empty(bus)?;

        // Inhibit the transmitter while we refill/drain.
        let control_reg = bus.read32(offset::CONTROL)?;
        bus.write32(offset::CONTROL, control_reg | control::TRANS_INHIBIT)?;

        loop {
            let status_reg = bus.read32(offset::STATUS)?;
            if status_reg & status::RX_EMPTY != 0 {
                break;
            }
            let data = bus.read32(offset::DATA_RX)?;
            if let Some(ref mut buf) = recv_buf {
                if recv_pos < byte_count {
                    buf[recv_pos] = data as u8;
                }
            }
            recv_pos += 1;
            remaining = remaining.saturating_sub(1);
            check_command_error(bus)?;
            if remaining == 0 {
                break;
            }
        }

        if send_pos < send_buf.len() {
            send_pos = fill_tx_fifo(bus, send_buf, send_pos)?;
            let control_reg = bus.read32(offset::CONTROL)?;
            bus.write32(offset::CONTROL, control_reg & !control::TRANS_INHIBIT)?;
        }
    }

    // Stop the transfer and deassert all slaves.
    let control_reg = bus.read32(offset::CONTROL)?;
    bus.write32(offset::CONTROL, control_reg | control::TRANS_INHIBIT)?;
    bus.write32(offset::SLAVE_SELECT, u32::MAX)?;

    Ok(())
}

fn fill_tx_fifo<D: Device>(bus: &mut RegisterBus<D>, send_buf: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let status_reg = bus.read32(offset::STATUS)?;
        if status_reg & status::TX_FULL != 0 || pos >= send_buf.len() {
            break;
        }
        bus.write32(offset::DATA_TX, u32::from(send_buf[pos]))?;
        pos += 1;
        check_command_error(bus)?;
    }
    Ok(pos)
}

fn check_command_error<D: Device>(bus: &mut RegisterBus<D>) -> Result<()> {
    let status_reg = bus.read32(offset::STATUS)?;
    if status_reg & status::COMMAND_ERR != 0 {
        return Err(Error::ControllerError);
    }
    Ok(())
}

/// Polls `tx-empty` until set, failing with [`Error::Timeout`] after
/// [`POLL_TIMEOUT`].
pub fn wait_tx_empty<D: Device>(bus: &mut RegisterBus<D>) -> Result<()> {
    let start = Instant::now();
    loop {
        let status_reg = bus.read32(offset::STATUS)?;
        if status_reg & status::TX_EMPTY != 0 {
            return Ok(());
        }
        if start.elapsed() >= POLL_TIMEOUT {
            return Err(Error::Timeout("tx-empty"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;

    fn ready_bus() -> RegisterBus<MockDevice> {
        RegisterBus::new(MockDevice::new())
    }

    #[test]
    fn slave_select_mask_clears_one_bit() {
        assert_eq!(slave_select_mask(0), !1u32);
        assert_eq!(slave_select_mask(1), !2u32);
    }

    #[test]
    fn rejects_no_slave_selected_when_mastered_and_not_looped_back() {
        let mut bus = ready_bus();
        bus.write32(offset::CONTROL, control::MASTER_MODE).unwrap();
        let state = ControllerState::new(32); // out-of-range: can't clear a bit
        let err = transfer(&mut bus, &state, &[0x06], None, 1).unwrap_err();
        assert!(matches!(err, Error::ProtocolError(_)));
    }

    #[test]
    fn rejects_pending_command_error() {
        let mut bus = ready_bus();
        bus.device_mut().force_command_err = true;
        let state = ControllerState::new(0);
        let err = transfer(&mut bus, &state, &[0x06], None, 1).unwrap_err();
        assert!(matches!(err, Error::ControllerError));
    }

    #[test]
    fn deasserts_slaves_and_restores_inhibit_on_success() {
        let mut bus = ready_bus();
        let state = ControllerState::new(0);
        transfer(&mut bus, &state, &[0x06], None, 1).unwrap();
        let control_reg = bus.read32(offset::CONTROL).unwrap();
        assert_ne!(control_reg & control::TRANS_INHIBIT, 0);
        let ssr = bus.read32(offset::SLAVE_SELECT).unwrap();
        assert_eq!(ssr, u32::MAX);
    }
}

//! The collaborators this crate consumes but never constructs.
//!
//! The BAR mmap, the character-device endpoint, and the query interface that
//! exposes PCIe identity are owned by the host application. The core only
//! ever talks to these two small traits, which keeps the register-level
//! state machines in [`crate::spi_engine`] and [`crate::flash_commands`]
//! testable without any hardware at all — see the `MockDevice` used
//! throughout this crate's tests.

use std::io;

/// A memory-mapped register window plus the handful of PCIe identity queries
/// the core needs to decide on dual-QSPI and the flash BAR base.
pub trait Device {
    /// Reads `buf.len()` bytes starting at `offset` within the device's BAR.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` starting at `offset` within the device's BAR.
    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// The PCIe device ID, used to infer dual-QSPI topology.
    fn pcie_device_id(&self) -> u16;

    /// The PCIe vendor ID, used by revert-to-manufacturing policy selection.
    fn pcie_vendor_id(&self) -> u16;

    /// The controller's register base offset within the BAR, if the device
    /// exposes one; callers fall back to a platform default otherwise.
    fn flash_bar_offset(&self) -> Option<u64>;
}

/// A seekable byte-stream endpoint, typically the kernel's `"flash"`
/// character device, through which the driver path delegates erase/program
/// work instead of issuing raw QSPI transfers itself.
pub trait FlashStream {
    /// Writes `buf` at `addr`, where `addr` already encodes the slave index
    /// in its high bits (see [`crate::programmer::driver::slave_addr`]).
    fn seek_write(&mut self, addr: u64, buf: &[u8]) -> io::Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::register_bus::{control, offset, status};
    use std::collections::VecDeque;

    /// A software model of the AXI-QSPI register file: FIFO fill/drain is
    /// serviced synchronously whenever the transmitter isn't inhibited, so
    /// tests don't need real timing to exercise [`crate::spi_engine::transfer`]
    /// and the [`crate::flash_commands::FlashCommands`] built on it.
    #[derive(Debug)]
    pub struct MockDevice {
        control: u32,
        ssr: u32,
        tx_fifo: VecDeque<u8>,
        rx_fifo: VecDeque<u8>,
        tx_capacity: usize,
        /// Bytes clocked out of the TX FIFO, in order, across the whole
        /// session — lets a test assert the exact wire sequence.
        pub sent: Vec<u8>,
        /// Pre-programmed response bytes, consumed one per byte clocked in.
        /// Once exhausted, `status_byte` is returned for every remaining
        /// byte of the transaction.
        pub response_bytes: VecDeque<u8>,
        /// Fallback byte once `response_bytes` is exhausted; also used by
        /// tests that want every flash-status read to say "busy forever".
        pub status_byte: u8,
        pub force_command_err: bool,
        pub pcie_device_id: u16,
        pub pcie_vendor_id: u16,
    }

    impl MockDevice {
        pub fn new() -> Self {
            Self {
                control: 0,
                ssr: u32::MAX,
                tx_fifo: VecDeque::new(),
                rx_fifo: VecDeque::new(),
                tx_capacity: 256,
                sent: Vec::new(),
                response_bytes: VecDeque::new(),
                status_byte: 0x00,
                force_command_err: false,
                pcie_device_id: 0x0000,
                pcie_vendor_id: 0x0000,
            }
        }

        /// Drains the TX FIFO into the RX FIFO while the transmitter is not
        /// inhibited, simulating the hardware clocking bytes in lock-step.
        fn service(&mut self) {
            while self.control & control::TRANS_INHIBIT == 0 && !self.tx_fifo.is_empty() {
                let byte = self.tx_fifo.pop_front().unwrap();
                self.sent.push(byte);
                let resp = self.response_bytes.pop_front().unwrap_or(self.status_byte);
                self.rx_fifo.push_back(resp);
            }
        }

        fn status_reg(&self) -> u32 {
            let mut s = 0u32;
            if self.rx_fifo.is_empty() {
                s |= status::RX_EMPTY;
            }
            if self.tx_fifo.is_empty() {
                s |= status::TX_EMPTY;
            }
            if self.tx_fifo.len() >= self.tx_capacity {
                s |= status::TX_FULL;
            }
            if self.force_command_err {
                s |= status::COMMAND_ERR;
            }
            s
        }
    }

    impl Device for MockDevice {
        fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            assert_eq!(buf.len(), 4, "MockDevice only models 32-bit register access");
            let value = match offset {
                offset::CONTROL => self.control,
                offset::STATUS => self.status_reg(),
                offset::DATA_RX => self.rx_fifo.pop_front().unwrap_or(0) as u32,
                offset::SLAVE_SELECT => self.ssr,
                offset::TX_FIFO_OCCUPANCY => self.tx_fifo.len() as u32,
                offset::RX_FIFO_OCCUPANCY => self.rx_fifo.len() as u32,
                _ => 0,
            };
            buf.copy_from_slice(&value.to_le_bytes());
            Ok(())
        }

        fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
            assert_eq!(buf.len(), 4, "MockDevice only models 32-bit register access");
            let mut b = [0u8; 4];
            b.copy_from_slice(buf);
            let value = u32::from_le_bytes(b);
            match offset {
                offset::CONTROL => {
                    self.control = value;
                    self.service();
                }
                offset::DATA_TX => {
                    self.tx_fifo.push_back(value as u8);
                    self.service();
                }
                offset::SLAVE_SELECT => self.ssr = value,
                offset::SOFTWARE_RESET => {
                    if value == crate::register_bus::SOFTWARE_RESET_MAGIC {
                        self.control = 0;
                        self.tx_fifo.clear();
                        self.rx_fifo.clear();
                    }
                }
                _ => {}
            }
            Ok(())
        }

        fn pcie_device_id(&self) -> u16 {
            self.pcie_device_id
        }

        fn pcie_vendor_id(&self) -> u16 {
            self.pcie_vendor_id
        }

        fn flash_bar_offset(&self) -> Option<u64> {
            Some(0)
        }
    }
}

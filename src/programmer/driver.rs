//! Character-device programming path: instead of driving the AXI-QSPI
//! registers directly, pages are written through the kernel's `"flash"`
//! character device node, which performs the register-level sequencing on
//! the card's behalf.

use crate::bitstream_guard::{self, guard_address, guard_block};
use crate::device::FlashStream;
use crate::error::Result;
use crate::flash_commands::WRITE_DATA_SIZE;
use crate::mcs::{extent_bytes, parse_extents, Extent};
use crate::striper::stripe;

use super::{busy_wait, PAGE_DELAY};

/// Encodes a (slave, byte-offset) pair into the single 64-bit address the
/// driver's `seek`/`write` interface expects: the slave index occupies the
/// top byte, leaving the low 56 bits for the flash-relative offset.
pub fn slave_addr(slave: u8, offset: u32) -> u64 {
    ((slave as u64) << 56) | offset as u64
}

fn write_chunked<S: FlashStream>(stream: &mut S, slave: u8, addr: u32, data: &[u8]) -> Result<()> {
    for (chunk_index, chunk) in data.chunks(WRITE_DATA_SIZE).enumerate() {
        let chunk_addr = addr + (chunk_index * WRITE_DATA_SIZE) as u32;
        stream.seek_write(slave_addr(slave, chunk_addr), chunk)?;
        busy_wait(PAGE_DELAY);
    }
    Ok(())
}

fn program_extent<S: FlashStream>(stream: &mut S, slave: u8, mcs: &str, extent: &Extent, addr_shift: u32) -> Result<()> {
    let data = extent_bytes(mcs, extent)?;
    write_chunked(stream, slave, extent.start_address + addr_shift, &data)
}

/// Installs the guard block through the character device: the driver's write
/// path performs its own erase-before-write, so unlike [`super::direct`] no
/// explicit erase precedes it.
fn install_guard_single<S: FlashStream>(stream: &mut S, slave: u8, addr: u32) -> Result<()> {
    write_chunked(stream, slave, addr, &guard_block())
}

fn install_guard_dual<S: FlashStream>(stream: &mut S, addr: u32, slave_a: u8, slave_b: u8) -> Result<()> {
    let (half_a, half_b) = stripe(&guard_block());
    write_chunked(stream, slave_a, addr, &half_a)?;
    write_chunked(stream, slave_b, addr, &half_b)
}

fn remove_guard<S: FlashStream>(stream: &mut S, slave: u8, addr: u32) -> Result<()> {
    // The guard subsector is overwritten with erased-state bytes rather than
    // erased directly: the character device has no standalone erase ioctl,
    // only seek+write.
    write_chunked(stream, slave, addr, &[0xFFu8; bitstream_guard::GUARD_BLOCK_SIZE as usize])
}

/// Programs a single flash chip from one MCS image through the character
/// device.
pub fn program<S: FlashStream>(stream: &mut S, slave: u8, mcs: &str) -> Result<()> {
    let extents = parse_extents(mcs)?;
    let golden = extents.first().map_or(true, |e| e.start_address == 0);
    let addr_shift = if golden { 0 } else { bitstream_guard::GUARD_BLOCK_SIZE };

    if !golden {
        install_guard_single(stream, slave, guard_address(false))?;
    }
    for extent in &extents {
        program_extent(stream, slave, mcs, extent, addr_shift)?;
    }
    if !golden {
        remove_guard(stream, slave, guard_address(false))?;
    }
    Ok(())
}

/// Programs a dual-flash card from two MCS images through the character
/// device, one physical chip at a time.
pub fn program_dual<S: FlashStream>(stream: &mut S, mcs: [&str; 2]) -> Result<()> {
    let extents0 = parse_extents(mcs[0])?;
    let golden = extents0.first().map_or(true, |e| e.start_address == 0);
    let addr_shift = if golden { 0 } else { bitstream_guard::GUARD_BLOCK_SIZE };
    let guard_addr = guard_address(true);

    if !golden {
        install_guard_dual(stream, guard_addr, 0, 1)?;
    }

    for extent in &extents0 {
        program_extent(stream, 0, mcs[0], extent, addr_shift)?;
    }
    let extents1 = parse_extents(mcs[1])?;
    for extent in &extents1 {
        program_extent(stream, 1, mcs[1], extent, addr_shift)?;
    }

    if !golden {
        remove_guard(stream, 0, guard_addr)?;
        remove_guard(stream, 1, guard_addr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingStream {
        writes: Vec<(u64, Vec<u8>)>,
        fail_after: Option<usize>,
    }

    impl RecordingStream {
        fn new() -> Self {
            RecordingStream { writes: Vec::new(), fail_after: None }
        }
    }

    impl FlashStream for RecordingStream {
        fn seek_write(&mut self, addr: u64, buf: &[u8]) -> std::io::Result<()> {
            if let Some(limit) = self.fail_after {
                if self.writes.len() >= limit {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected failure"));
                }
            }
            self.writes.push((addr, buf.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn slave_addr_encodes_slave_in_top_byte() {
        assert_eq!(slave_addr(0, 0x1234), 0x1234);
        assert_eq!(slave_addr(1, 0x1234), (1u64 << 56) | 0x1234);
    }

    fn golden_mcs() -> String {
        ":020000040000FA\n:04000000DEADBEEF00\n:00000001FF\n".to_string()
    }

    fn non_golden_mcs() -> String {
        ":020000040100F9\n:04000000CAFEBABE00\n:00000001FF\n".to_string()
    }

    #[test]
    fn golden_program_skips_guard_writes() {
        let mut stream = RecordingStream::new();
        let mcs = golden_mcs();
        program(&mut stream, 0, &mcs).unwrap();
        let guard_word_addr = slave_addr(0, guard_address(false));
        assert!(!stream.writes.iter().any(|(a, _)| *a == guard_word_addr));
        assert!(stream.writes.iter().all(|(a, _)| a >> 56 == 0));
    }

    #[test]
    fn non_golden_program_writes_guard_then_removes_it() {
        let mut stream = RecordingStream::new();
        let mcs = non_golden_mcs();
        program(&mut stream, 0, &mcs).unwrap();
        let guard_addr = slave_addr(0, guard_address(false));
        let guard_writes: Vec<_> = stream.writes.iter().filter(|(a, _)| *a == guard_addr).collect();
        // One install write, one all-0xFF removal write.
        assert_eq!(guard_writes.len(), 2);
        assert!(guard_writes[1].1.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn dual_program_targets_both_slaves() {
        let mut stream = RecordingStream::new();
        let mcs0 = golden_mcs();
        let mcs1 = golden_mcs();
        program_dual(&mut stream, [&mcs0, &mcs1]).unwrap();
        assert!(stream.writes.iter().any(|(a, _)| a >> 56 == 0));
        assert!(stream.writes.iter().any(|(a, _)| a >> 56 == 1));
    }

    #[test]
    fn write_failure_propagates() {
        let mut stream = RecordingStream::new();
        stream.fail_after = Some(0);
        let mcs = golden_mcs();
        assert!(program(&mut stream, 0, &mcs).is_err());
    }
}

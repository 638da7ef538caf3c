//! Intel-HEX (MCS) parsing: groups `:LLAAAATT...CC` lines into contiguous
//! extents, detects golden images, and (for the driver path) flattens a
//! stream into contiguous `(addr, bytes)` runs.
//!
//! This does its own line-level decoding rather than building on a generic
//! Intel-HEX crate: extents need a restartable byte cursor into the original
//! text (`data_pos`) so a later pass can re-walk the same lines while
//! filling 128-byte write buffers, which a plain line iterator doesn't
//! expose.

use crate::error::{Error, Result};

/// A contiguous run of firmware bytes, as produced by a single extended
/// linear address (type 0x04) record followed by its type-0x00 data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub start_address: u32,
    pub end_address: u32,
    pub data_count: u32,
    /// Byte offset into the original MCS text where this extent's first
    /// data line begins — a restartable cursor for [`extent_bytes`].
    pub data_pos: usize,
}

struct Line<'a> {
    len: u8,
    address: u16,
    record_type: u8,
    data_hex: &'a str,
}

fn parse_line(line: &str) -> Result<Line<'_>> {
    if !line.starts_with(':') {
        return Err(Error::InvalidInput(format!("line does not start with ':': {:?}", line)));
    }
    if line.len() < 11 {
        return Err(Error::InvalidInput(format!("line too short: {:?}", line)));
    }
    let len = u8::from_str_radix(&line[1..3], 16)
        .map_err(|_| Error::InvalidInput("malformed length field".into()))?;
    let address = u16::from_str_radix(&line[3..7], 16)
        .map_err(|_| Error::InvalidInput("malformed address field".into()))?;
    let record_type = u8::from_str_radix(&line[7..9], 16)
        .map_err(|_| Error::InvalidInput("malformed record type field".into()))?;
    let data_end = 9 + usize::from(len) * 2;
    if line.len() < data_end {
        return Err(Error::InvalidInput(format!("line shorter than declared length: {:?}", line)));
    }
    Ok(Line { len, address, record_type, data_hex: &line[9..data_end] })
}

fn decode_hex_bytes(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::InvalidInput("odd-length data field".into()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| Error::InvalidInput("malformed data byte".into())))
        .collect()
}

/// Parses an MCS text into its extent list, in order of appearance.
pub fn parse_extents(mcs: &str) -> Result<Vec<Extent>> {
    let mut extents = Vec::new();
    let mut current: Option<Extent> = None;
    let mut terminated = false;

    let mut pos = 0usize;
    for raw_line in mcs.split_inclusive('\n') {
        let line_end = pos + raw_line.len();
        let line = raw_line.trim_end_matches(['\r', '\n']);
        pos = line_end;
        if line.is_empty() {
            continue;
        }
        let parsed = parse_line(line)?;

        match parsed.record_type {
            0x00 => {
                let extent = current
                    .as_mut()
                    .ok_or_else(|| Error::InvalidInput("data record before any extended address record".into()))?;
                if parsed.len > 16 {
                    return Err(Error::InvalidInput("data record longer than 16 bytes".into()));
                }
                let expected = extent.data_count + (extent.start_address & 0xFFFF);
                if u32::from(parsed.address) != expected {
                    if extent.data_count == 0 && extent.start_address != 0 {
                        extent.start_address += u32::from(parsed.address);
                        extent.end_address += u32::from(parsed.address);
                    } else {
                        return Err(Error::InvalidInput("address is not contiguous".into()));
                    }
                }
                extent.data_count += u32::from(parsed.len);
                extent.end_address += u32::from(parsed.len);
            }
            0x01 => {
                if let Some(extent) = current.take() {
                    extents.push(extent);
                }
                terminated = true;
                break;
            }
            0x02 => {
                return Err(Error::InvalidInput("segmented address records are not supported".into()));
            }
            0x04 => {
                if parsed.address != 0 {
                    return Err(Error::InvalidInput("extended linear address record with nonzero offset".into()));
                }
                if parsed.len != 2 {
                    return Err(Error::InvalidInput("extended linear address record must carry 2 bytes".into()));
                }
                let value = u32::from(
                    u16::from_str_radix(parsed.data_hex, 16)
                        .map_err(|_| Error::InvalidInput("malformed extended address value".into()))?,
                );
                if let Some(extent) = current.take() {
                    extents.push(extent);
                }
                current = Some(Extent {
                    start_address: value << 16,
                    end_address: value << 16,
                    data_count: 0,
                    data_pos: pos,
                });
            }
            other => {
                return Err(Error::InvalidInput(format!("unsupported record type 0x{:02X}", other)));
            }
        }
    }

    if !terminated {
        return Err(Error::InvalidInput("MCS stream missing EOF record".into()));
    }

    extents.retain(|e| e.data_count > 0);
    Ok(extents)
}

/// Materializes the bytes described by `extent`, re-walking `mcs` from its
/// `data_pos` cursor. Non-data records encountered along the way (only the
/// terminal EOF line is expected) are skipped.
pub fn extent_bytes(mcs: &str, extent: &Extent) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(extent.data_count as usize);
    let mut pos = extent.data_pos;
    let mut remaining = extent.data_count;

    while remaining > 0 {
        if pos >= mcs.len() {
            return Err(Error::InvalidInput("MCS stream ended before extent data was fully read".into()));
        }
        let rest = &mcs[pos..];
        let line_len = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
        let raw_line = &rest[..line_len];
        pos += line_len;
        let line = raw_line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        let parsed = parse_line(line)?;
        remaining = remaining.saturating_sub(u32::from(parsed.len));
        if parsed.record_type == 0x00 {
            out.extend(decode_hex_bytes(parsed.data_hex)?);
        }
    }
    Ok(out)
}

/// An MCS is golden iff its first type-0x04 record's decoded value is 0.
pub fn is_golden(mcs: &str) -> bool {
    for raw_line in mcs.split_inclusive('\n') {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        if let Ok(parsed) = parse_line(line) {
            if parsed.record_type == 0x04 {
                return u16::from_str_radix(parsed.data_hex, 16).unwrap_or(1) == 0;
            }
        }
    }
    false
}

/// Streamed mode: flattens the MCS into contiguous `(address, bytes)` runs,
/// one per extent, for the driver path's single-write-per-page
/// character-device protocol.
pub fn parse_streamed(mcs: &str) -> Result<Vec<(u32, Vec<u8>)>> {
    parse_extents(mcs)?
        .into_iter()
        .map(|extent| {
            let bytes = extent_bytes(mcs, &extent)?;
            Ok((extent.start_address, bytes))
        })
        .collect()
}

//! The data half of `ControllerState`: everything a session needs to
//! remember between commands, with no behaviour of its own.

/// JEDEC manufacturer identifiers this crate recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Micron,
    Macronix,
}

impl Vendor {
    pub(crate) fn from_jedec_byte(byte: u8) -> Option<Vendor> {
        match byte {
            0x20 => Some(Vendor::Micron),
            0xC2 => Some(Vendor::Macronix),
            _ => None,
        }
    }
}

/// Decodes the JEDEC capacity byte (ID byte[3]) into a 128-Mbit sector
/// count.
pub(crate) fn max_sector_count(capacity_byte: u8) -> Option<u32> {
    match capacity_byte {
        0x38 | 0x17 | 0x18 => Some(1),
        0x39 | 0x19 => Some(2),
        0x3A | 0x20 => Some(4),
        0x3B | 0x21 => Some(8),
        0x3C | 0x22 => Some(16),
        _ => None,
    }
}

/// The 16 MiB "128-Mbit sector" selected by a 32-bit address's bits 27:24.
pub fn sector_for(addr: u32) -> u8 {
    ((addr >> 24) & 0xF) as u8
}

/// Session-scoped controller state: which physical flash is targeted, which
/// Extended Address Register value is cached, and what was learned about the
/// attached chip from its JEDEC ID.
///
/// This exists only as a field of [`crate::flash_commands::FlashCommands`];
/// nothing outside a session observes or mutates it, replacing the
/// file-scope globals a C implementation would otherwise use for this.
#[derive(Debug, Clone)]
pub struct ControllerState {
    /// Which physical flash chip (0 or 1) the next transfer targets.
    pub slave_index: u8,
    /// The Extended Address Register value last written, or `None` if it has
    /// never been written (or was invalidated by a controller reset).
    pub selected_sector: Option<u8>,
    /// The detected JEDEC manufacturer, once `read_id_code` has succeeded.
    pub flash_vendor: Option<Vendor>,
    /// The number of 128-Mbit sectors the attached chip exposes.
    pub max_sector_count: u32,
}

impl ControllerState {
    /// The state immediately after a controller soft-reset: no sector
    /// cached, chip not yet identified.
    pub fn new(slave_index: u8) -> Self {
        Self {
            slave_index,
            selected_sector: None,
            flash_vendor: None,
            max_sector_count: 0,
        }
    }

    /// Invalidates the cached sector, as happens on every controller
    /// soft-reset. Intentionally *not* called by bulk erase: bulk erase
    /// wipes the whole chip, so sector tracking across it is meaningless and
    /// callers must not rely on it.
    pub fn invalidate_sector(&mut self) {
        self.selected_sector = None;
    }
}

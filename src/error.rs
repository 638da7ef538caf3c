use std::fmt::{self, Display};
use std::io;

/// The error type used throughout this crate.
///
/// Every fallible operation returns one of these variants; there is no
/// abrupt-exit path left in the core (see the "Exception-for-error and
/// abrupt-exit patterns" design note). A binary built on top of this crate
/// prints [`Display`] and translates the variant to a process exit code.
#[derive(Debug)]
pub enum Error {
    /// A malformed MCS line, a rejected record type, non-contiguous extent
    /// addresses, or over-long record data.
    InvalidInput(String),

    /// The flash chip's JEDEC ID could not be classified: the ID-code read
    /// returned all `0xFF`, the capacity byte was unrecognized, or dual-QSPI
    /// was required but the device doesn't support it.
    DeviceUnsupported(String),

    /// A 3-second poll deadline (`tx-empty` or flash-ready) was exceeded.
    Timeout(&'static str),

    /// Status register bit 10 (command error) was observed set.
    ControllerError,

    /// A protocol precondition was violated: no slave selected while in
    /// master mode and not in loopback, or an unexpected status combination.
    ProtocolError(&'static str),

    /// A `Device`/`FlashStream` read or write failed.
    Io(io::Error),

    /// A sector erase or page write failed while installing or removing the
    /// bitstream guard. The card is left safe if the failure happened before
    /// removal, wedged until re-flashed if it happened during removal.
    GuardFailure(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Error::DeviceUnsupported(msg) => write!(f, "device unsupported: {}", msg),
            Error::Timeout(op) => write!(f, "timed out waiting for {}", op),
            Error::ControllerError => f.write_str("controller reported a command error"),
            Error::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::GuardFailure(msg) => write!(f, "bitstream guard failure: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// A `Result` alias pinned to this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

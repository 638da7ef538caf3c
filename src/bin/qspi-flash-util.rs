use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{error, info};
use structopt::StructOpt;

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use axi_qspi_flash::device::{Device, FlashStream};
use axi_qspi_flash::register_bus::RegisterBus;
use axi_qspi_flash::toplevel::{self, Strategy};

#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(subcommand)]
    operation: Operations,

    /// PCI resource file exposing the card's BAR (e.g. /sys/bus/pci/devices/.../resource0)
    #[structopt(long, default_value = "/dev/null", env = "FLASH_BAR_PATH")]
    bar_path: PathBuf,

    /// Kernel "flash" character device node, if the driver path is to be used
    #[structopt(long, env = "FLASH_CHAR_DEVICE")]
    char_device: Option<PathBuf>,

    /// PCIe device ID, used to infer dual-QSPI topology
    #[structopt(long, parse(try_from_str = parse_hex_u16), default_value = "0000")]
    pcie_device_id: u16,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,
}

#[derive(Debug, StructOpt)]
enum Operations {
    /// Program a single-flash card from one MCS file
    Program {
        /// Path to the MCS (Intel-HEX) firmware image
        mcs: PathBuf,
    },
    /// Program a dual-flash (stacked) card from two MCS files
    ProgramDual {
        /// MCS image for physical flash 0
        mcs_a: PathBuf,
        /// MCS image for physical flash 1
        mcs_b: PathBuf,
    },
    /// Erase the entire attached chip, subsector by subsector
    EraseChip,
}

fn parse_hex_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// A `Device` backed by a PCI resource file, using positioned reads/writes so
/// no file-offset state needs tracking between calls.
struct PciBarDevice {
    file: File,
    pcie_device_id: u16,
    pcie_vendor_id: u16,
}

impl std::fmt::Debug for PciBarDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciBarDevice").field("pcie_device_id", &self.pcie_device_id).finish()
    }
}

impl Device for PciBarDevice {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn pcie_device_id(&self) -> u16 {
        self.pcie_device_id
    }

    fn pcie_vendor_id(&self) -> u16 {
        self.pcie_vendor_id
    }

    fn flash_bar_offset(&self) -> Option<u64> {
        None
    }
}

/// A `FlashStream` backed by the kernel's `"flash"` character device: each
/// write seeks then writes, since the device has no positioned-write ioctl.
struct CharDeviceFlash {
    file: File,
}

impl FlashStream for CharDeviceFlash {
    fn seek_write(&mut self, addr: u64, buf: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(buf)
    }
}

fn read_mcs(path: &PathBuf) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| {
        error!("failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    })
}

fn main() {
    let opts = Options::from_args();

    TermLogger::init(opts.log_level, simplelog::Config::default(), TerminalMode::Mixed).unwrap();

    let dual = toplevel::is_dual_qspi(opts.pcie_device_id);
    let char_device = opts.char_device.as_ref().map(|path| {
        OpenOptions::new().read(true).write(true).open(path).unwrap_or_else(|e| {
            error!("failed to open {}: {}", path.display(), e);
            std::process::exit(1);
        })
    });
    // The core never reads environment variables itself; the binary
    // resolves FLASH_VIA_USER once and passes the decision in.
    let force_direct = std::env::var_os("FLASH_VIA_USER").is_some();
    let strategy = Strategy::resolve(char_device.is_some(), force_direct);
    info!("strategy={:?} dual_qspi={}", strategy, dual);

    let result = match (&opts.operation, strategy) {
        (Operations::Program { mcs }, Strategy::Direct) => {
            let device = open_bar(&opts);
            let bus = RegisterBus::new(device);
            toplevel::program_single(bus, &read_mcs(mcs))
        }
        (Operations::Program { mcs }, Strategy::Driver) => {
            let mut stream = CharDeviceFlash { file: char_device.unwrap() };
            toplevel::program_single_via_driver(&mut stream, &read_mcs(mcs))
        }
        (Operations::ProgramDual { mcs_a, mcs_b }, Strategy::Direct) => {
            let device = open_bar(&opts);
            let bus = RegisterBus::new(device);
            let data_a = read_mcs(mcs_a);
            let data_b = read_mcs(mcs_b);
            toplevel::program_dual(bus, [data_a.as_str(), data_b.as_str()])
        }
        (Operations::ProgramDual { mcs_a, mcs_b }, Strategy::Driver) => {
            let mut stream = CharDeviceFlash { file: char_device.unwrap() };
            let data_a = read_mcs(mcs_a);
            let data_b = read_mcs(mcs_b);
            toplevel::program_dual_via_driver(&mut stream, [data_a.as_str(), data_b.as_str()])
        }
        (Operations::EraseChip, _) => {
            let device = open_bar(&opts);
            let bus = RegisterBus::new(device);
            let mut cmd = axi_qspi_flash::programmer::direct::prepare(bus, 0).unwrap_or_else(|e| {
                error!("failed to identify attached flash: {}", e);
                std::process::exit(1);
            });
            axi_qspi_flash::full_erase::erase_chip(&mut cmd, |addr| info!("erased through 0x{:08x}", addr))
        }
    };

    match result {
        Ok(()) => info!("done"),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn open_bar(opts: &Options) -> PciBarDevice {
    let file = OpenOptions::new().read(true).write(true).open(&opts.bar_path).unwrap_or_else(|e| {
        error!("failed to open {}: {}", opts.bar_path.display(), e);
        std::process::exit(1);
    });
    PciBarDevice { file, pcie_device_id: opts.pcie_device_id, pcie_vendor_id: 0x10EE }
}

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::parse_size;

use dfu_host::{find_dfu_devices, UsbTransport};
use error::CliError;
use detach::*;
use list::*;
use read::*;
use write::*;

mod detach;
mod error;
mod list;
mod read;
mod write;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices and their interfaces
    List {
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "df11")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// read firmware from the device into a file
    Read {
        /// output file (raw binary)
        file: PathBuf,
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "df11")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
        /// interface candidate index (see `list`)
        #[clap(short, long, default_value_t = 0)]
        interface: usize,
        /// start address (ex: 0x08000000, DfuSe only)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// length (ex: 64K, 2MB)
        #[clap(short, long, value_parser=parse_length)]
        length: Option<u32>,
    },
    /// write a firmware file to the device
    Write {
        /// input file (raw binary)
        file: PathBuf,
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "df11")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
        /// interface candidate index (see `list`)
        #[clap(short, long, default_value_t = 0)]
        interface: usize,
        /// start address (ex: 0x08000000, DfuSe only)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
    },
    /// switch a runtime-mode device into its bootloader
    Detach {
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "df11")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
        /// interface candidate index (see `list`)
        #[clap(short, long, default_value_t = 0)]
        interface: usize,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            vendor: None,
            product: None,
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_length(s: &str) -> Result<u32, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e: std::num::TryFromIntError| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::List { vendor, product } => list_dfu_devices(*vendor, *product),
        Commands::Read {
            file,
            vendor,
            product,
            interface,
            start_address,
            length,
        } => get_dfu_device(vendor, product).and_then(|device| {
            read_file(file, device, *interface, *start_address, *length)
        }),
        Commands::Write {
            file,
            vendor,
            product,
            interface,
            start_address,
        } => get_dfu_device(vendor, product).and_then(|device| {
            write_file(file, device, *interface, *start_address)
        }),
        Commands::Detach {
            vendor,
            product,
            interface,
        } => get_dfu_device(vendor, product)
            .and_then(|device| detach_device(device, *interface)),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn get_dfu_device(
    vid: &Option<u16>,
    pid: &Option<u16>,
) -> Result<UsbTransport, CliError> {
    let devices = find_dfu_devices(*vid, *pid)?;
    if devices.is_empty() {
        return Err(CliError::NoDFUDevice);
    }
    if devices.len() > 1 {
        return Err(CliError::ManyDFUDevices);
    }
    Ok(devices.into_iter().next().unwrap())
}

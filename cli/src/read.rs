use std::{
    io::{self, Write},
    path::PathBuf,
};

use dfu_host::{DfuEvent, Session, UsbTransport};

use crate::CliError;

pub(crate) fn upload(
    device: UsbTransport,
    interface: usize,
    start_address: Option<u32>,
    length: Option<u32>,
) -> Result<Vec<u8>, CliError> {
    let mut session = Session::new(device);
    session.set_event_hook(render_progress);
    session.connect(interface)?;

    if let Some(address) = start_address {
        if !session.set_start_address(address) {
            log::warn!("plain DFU device, start address ignored");
        }
    }

    let data = session.read(length.map(|l| l as usize))?;
    println!();
    session.close()?;
    Ok(data)
}

pub(crate) fn read_file(
    file: &PathBuf,
    device: UsbTransport,
    interface: usize,
    start_address: Option<u32>,
    length: Option<u32>,
) -> Result<(), CliError> {
    let data = upload(device, interface, start_address, length)?;
    std::fs::write(file, &data)?;
    println!("Read {} bytes into {}", data.len(), file.display());
    Ok(())
}

fn render_progress(event: &DfuEvent) {
    if let DfuEvent::Progress { done, total } = event {
        match total {
            Some(total) if *total > 0 => {
                let filled = (60 * done) / total;
                print!(
                    "\r  Reading {:3}% [{}]",
                    (100 * done) / total,
                    "#".repeat(filled) + &" ".repeat(60 - filled)
                );
            }
            _ => print!("\r  Reading {done} bytes"),
        }
        let _ = io::stdout().flush();
    }
}

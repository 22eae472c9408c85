use std::{
    io::{self, Write},
    path::PathBuf,
};

use dfu_host::{DfuEvent, Session, UsbTransport};

use crate::CliError;

pub(crate) fn write_file(
    file: &PathBuf,
    device: UsbTransport,
    interface: usize,
    start_address: Option<u32>,
) -> Result<(), CliError> {
    let data = std::fs::read(file)?;
    download(&data, device, interface, start_address)
}

pub(crate) fn download(
    data: &[u8],
    device: UsbTransport,
    interface: usize,
    start_address: Option<u32>,
) -> Result<(), CliError> {
    let mut session = Session::new(device);
    session.set_event_hook(render_progress);
    session.connect(interface)?;

    match start_address {
        Some(address) => {
            if !session.set_start_address(address) {
                log::warn!("plain DFU device, start address ignored");
            }
        }
        None => {
            // default to the first writable segment of the map
            if let Some(address) = session
                .memory_map()
                .and_then(|map| map.first_writable())
                .map(|segment| segment.start())
            {
                session.set_start_address(address);
            }
        }
    }

    let dfuse = session.is_dfuse();
    session.write(data)?;
    if dfuse {
        // the DfuSe engine leaves the device manifesting; reset it into
        // the new firmware
        session.reset()?;
    }
    println!("Wrote {} bytes", data.len());
    session.close()?;
    Ok(())
}

fn render_progress(event: &DfuEvent) {
    match event {
        DfuEvent::EraseStart => println!("Erasing..."),
        DfuEvent::EraseProgress { done, total } => bar("Erasing", *done as usize, *total as usize),
        DfuEvent::EraseEnd => println!(),
        DfuEvent::WriteProgress { done, total } => bar("Flashing", *done, *total),
        DfuEvent::WriteEnd { .. } => println!(),
        _ => {}
    }
}

fn bar(label: &str, done: usize, total: usize) {
    if total == 0 {
        return;
    }
    let filled = (60 * done) / total;
    print!(
        "\r  {} {:3}% [{}]",
        label,
        (100 * done) / total,
        "#".repeat(filled) + &" ".repeat(60 - filled)
    );
    let _ = io::stdout().flush();
}

use dfu_host::{
    find_dfu_devices, ControlTransport, MemSegment, MemoryMap, Session, UsbTransport,
};

use crate::CliError;

pub(crate) fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DFU device found");
        return Ok(());
    }
    for device in devices {
        print_device(device)?;
    }
    Ok(())
}

fn print_device(device: UsbTransport) -> Result<(), CliError> {
    println!(
        "ID {:04x}:{:04x} {}",
        device.vendor_id(),
        device.product_id(),
        device.product_string().unwrap_or_default(),
    );

    let mut session = Session::new(device);
    session.init()?;
    for (index, candidate) in session.candidates().iter().enumerate() {
        let name = candidate.interface_name.as_deref().unwrap_or("");
        println!(
            "  [{}] cfg={} intf={} alt={} proto={:#04x} {}",
            index,
            candidate.configuration_value,
            candidate.interface_number,
            candidate.alternate_setting,
            candidate.interface_protocol,
            name,
        );
        if let Ok(map) = MemoryMap::parse(name) {
            for segment in map.segments.iter() {
                print_segment("      ", segment);
            }
        }
    }
    session.close()?;
    Ok(())
}

fn print_segment(prefix: &str, segment: &MemSegment) {
    let mut sector_size = segment.sector_size();
    let sector_char = if sector_size >= 1024 {
        sector_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:3} sectors of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start(),
        segment.sectors(),
        sector_size,
        sector_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}

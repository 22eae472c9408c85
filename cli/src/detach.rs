use dfu_host::{Session, UsbTransport};

use crate::CliError;

/// Ask a runtime-mode device to drop into its bootloader and wait for it
/// to leave the bus.
pub(crate) fn detach_device(
    device: UsbTransport,
    interface: usize,
) -> Result<(), CliError> {
    let mut session = Session::new(device);
    session.connect(interface)?;

    println!("Detaching...");
    session.detach()?;
    session.wait_disconnected(30_000)?;
    println!("Device detached");
    Ok(())
}

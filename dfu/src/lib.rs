//! Host-side USB Device Firmware Upgrade (DFU) driver
//!
//! Implements the DFU 1.1 protocol plus the STMicroelectronics
//! extensions (aka "DfuSe", DFU 1.1a) that add explicit memory-address
//! targeting and sector erase. A [`Session`] enumerates the DFU
//! interfaces of one device, claims a selection and drives the device's
//! state machine through reads, writes, erases and manifestation.
//!
//! The protocol engines are transport-agnostic: they run over any
//! [`ControlTransport`]. The [`usb`] module provides the production
//! implementation on top of [`nusb`]; tests drive the engines with a
//! scripted fake.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! ```no_run
//! use dfu_host::{find_dfu_devices, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = find_dfu_devices(Some(0x0483), Some(0xdf11))?
//!     .into_iter()
//!     .next()
//!     .ok_or("no DFU device")?;
//! let mut session = Session::new(transport);
//! session.connect(0)?;
//! let firmware = std::fs::read("firmware.bin")?;
//! session.write(&firmware)?;
//! # Ok(())
//! # }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

use std::time::Duration;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;

mod connection;
mod descriptor;
mod dfuse;
mod engine;
mod error;
mod events;
mod memory;
mod session;
mod status;
mod transport;
pub mod usb;

// Re-exports
pub use connection::DfuConnection;
pub use descriptor::{
    ConfigurationDescriptor, DescriptorRecord, FunctionalDescriptor,
    InterfaceDescriptor, DFUSE_VERSION_NUMBER, DFU_CLASS, DFU_PROTOCOL_DFU_MODE,
    DFU_PROTOCOL_RUNTIME, DFU_SUBCLASS,
};
pub use dfuse::DfuSe;
pub use engine::Engine;
pub use error::DfuError;
pub use events::{CancelToken, DfuEvent};
pub use memory::{MemSegment, MemoryMap};
pub use session::{InterfaceSelection, Session, SessionOptions, SessionState};
pub use status::{State, Status, StatusReport};
pub use transport::{
    ControlRequest, ControlTransport, DisconnectHook, Recipient, RequestType,
    TransportError,
};
pub use usb::{find_dfu_devices, UsbTransport};

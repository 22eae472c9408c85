//! Production [`ControlTransport`] backed by [`nusb`].

use std::sync::Mutex;

use nusb::transfer::{ControlIn, ControlOut, ControlType, TransferError};
use nusb::MaybeFuture;

use crate::descriptor::{DFU_CLASS, DFU_SUBCLASS};
use crate::transport::{
    ControlRequest, ControlTransport, DisconnectHook, Recipient, RequestType,
    TransportError,
};
use crate::DEFAULT_TIMEOUT;

/// One USB device, opened lazily.
pub struct UsbTransport {
    info: nusb::DeviceInfo,
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
    hooks: Mutex<Vec<DisconnectHook>>,
}

impl UsbTransport {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        Self {
            info,
            device: None,
            interface: None,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.info
    }

    fn device(&self) -> Result<&nusb::Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::DeviceUnavailable)
    }

    fn note_error(&self, err: &TransportError) {
        if matches!(err, TransportError::Disconnected) {
            if let Ok(mut hooks) = self.hooks.lock() {
                for hook in hooks.iter_mut() {
                    hook(Some(err.clone()));
                }
            }
        }
    }

    fn map_control(request: ControlRequest) -> (ControlType, nusb::transfer::Recipient) {
        let control_type = match request.request_type {
            RequestType::Standard => ControlType::Standard,
            RequestType::Class => ControlType::Class,
        };
        let recipient = match request.recipient {
            Recipient::Device => nusb::transfer::Recipient::Device,
            Recipient::Interface => nusb::transfer::Recipient::Interface,
        };
        (control_type, recipient)
    }
}

fn map_usb_error(err: nusb::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

fn map_transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Io(other.to_string()),
    }
}

impl ControlTransport for UsbTransport {
    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_none() {
            log::debug!(
                "opening {:04x}:{:04x}",
                self.info.vendor_id(),
                self.info.product_id()
            );
            self.device = Some(self.info.open().wait().map_err(map_usb_error)?);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        self.device = None;
        Ok(())
    }

    fn is_attached(&self) -> bool {
        match nusb::list_devices().wait() {
            Ok(mut devices) => devices.any(|dev| dev.id() == self.info.id()),
            Err(_) => false,
        }
    }

    fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    fn product_string(&self) -> Option<String> {
        self.info.product_string().map(str::to_string)
    }

    fn serial_number(&self) -> Option<String> {
        self.info.serial_number().map(str::to_string)
    }

    fn num_configurations(&self) -> u8 {
        match self.device.as_ref() {
            Some(device) => device.configurations().count() as u8,
            None => 1,
        }
    }

    fn active_configuration(&self) -> Result<u8, TransportError> {
        let config = self
            .device()?
            .active_configuration()
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(config.configuration_value())
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        self.device()?
            .set_configuration(value)
            .wait()
            .map_err(map_usb_error)
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError> {
        let interface = self
            .device()?
            .claim_interface(number)
            .wait()
            .map_err(map_usb_error)?;
        self.interface = Some(interface);
        Ok(())
    }

    fn select_alternate(&mut self, interface: u8, alternate: u8)
        -> Result<(), TransportError> {
        let claimed = self
            .interface
            .as_ref()
            .filter(|i| i.interface_number() == interface)
            .ok_or(TransportError::DeviceUnavailable)?;
        claimed
            .set_alt_setting(alternate)
            .wait()
            .map_err(map_usb_error)
    }

    fn control_in(&self, request: ControlRequest, length: u16)
        -> Result<Vec<u8>, TransportError> {
        let (control_type, recipient) = Self::map_control(request);
        let setup = ControlIn {
            control_type,
            recipient,
            request: request.request,
            value: request.value,
            index: request.index,
            length,
        };
        let result = match (&request.recipient, self.interface.as_ref()) {
            (Recipient::Interface, Some(interface)) => {
                interface.control_in(setup, DEFAULT_TIMEOUT).wait()
            }
            _ => self.device()?.control_in(setup, DEFAULT_TIMEOUT).wait(),
        };
        result.map_err(|err| {
            let err = map_transfer_error(err);
            self.note_error(&err);
            err
        })
    }

    fn control_out(&self, request: ControlRequest, data: &[u8])
        -> Result<usize, TransportError> {
        let (control_type, recipient) = Self::map_control(request);
        let setup = ControlOut {
            control_type,
            recipient,
            request: request.request,
            value: request.value,
            index: request.index,
            data,
        };
        let result = match (&request.recipient, self.interface.as_ref()) {
            (Recipient::Interface, Some(interface)) => {
                interface.control_out(setup, DEFAULT_TIMEOUT).wait()
            }
            _ => self.device()?.control_out(setup, DEFAULT_TIMEOUT).wait(),
        };
        match result {
            Ok(()) => Ok(data.len()),
            Err(err) => {
                let err = map_transfer_error(err);
                self.note_error(&err);
                Err(err)
            }
        }
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.device()?.reset().wait().map_err(|err| {
            let err = map_usb_error(err);
            self.note_error(&err);
            err
        })
    }

    fn on_disconnect(&mut self, hook: DisconnectHook) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(hook);
        }
    }
}

fn is_dfu_device(info: &nusb::DeviceInfo) -> bool {
    info.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Enumerate DFU-capable devices, optionally filtered by vendor and
/// product id.
pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<UsbTransport>, TransportError> {
    Ok(nusb::list_devices()
        .wait()
        .map_err(map_usb_error)?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .map(UsbTransport::new)
        .collect())
}

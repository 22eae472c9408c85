//! The control-transfer capability required from a USB backend.
//!
//! The protocol engines never talk to a USB stack directly; they drive a
//! [`ControlTransport`]. The production implementation lives in
//! [`crate::usb`], tests substitute a scripted fake.

use thiserror::Error;

/// Errors surfaced by a [`ControlTransport`] implementation.
///
/// The engines filter on variants, never on message text. The first three
/// variants mean "the device already left the bus" and are suppressed
/// during manifestation and reset, where losing the device is the
/// expected outcome.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Device disconnected")]
    Disconnected,
    #[error("Device unavailable")]
    DeviceUnavailable,
    #[error("Transport cannot reset the device")]
    ResetUnsupported,
    #[error("Endpoint stalled")]
    Stall,
    #[error("Access denied: {0}")]
    Access(String),
    #[error("USB error: {0}")]
    Io(String),
}

impl TransportError {
    /// True for errors that mean the device is already gone.
    pub fn device_gone(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected
                | TransportError::DeviceUnavailable
                | TransportError::ResetUnsupported
        )
    }
}

/// Type of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
}

/// Recipient of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
}

/// Setup fields of a control transfer, without the data stage.
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Callback invoked when the transport notices the device left the bus.
pub type DisconnectHook = Box<dyn FnMut(Option<TransportError>) + Send>;

/// Abstract USB control-transfer capability.
///
/// One implementor wraps exactly one device. Transfer methods take
/// `&self` so a claimed connection can be shared with the protocol
/// engines; implementations with mutable internals use interior
/// mutability.
pub trait ControlTransport {
    fn is_open(&self) -> bool;
    fn open(&mut self) -> Result<(), TransportError>;
    fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the device is still present on the bus.
    fn is_attached(&self) -> bool;

    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;
    fn product_string(&self) -> Option<String>;
    fn serial_number(&self) -> Option<String>;
    fn num_configurations(&self) -> u8;

    /// `bConfigurationValue` of the currently selected configuration.
    fn active_configuration(&self) -> Result<u8, TransportError>;

    fn select_configuration(&mut self, value: u8) -> Result<(), TransportError>;
    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError>;
    fn select_alternate(&mut self, interface: u8, alternate: u8)
        -> Result<(), TransportError>;

    /// IN control transfer; returns at most `length` bytes.
    fn control_in(&self, request: ControlRequest, length: u16)
        -> Result<Vec<u8>, TransportError>;

    /// OUT control transfer; returns the number of bytes written.
    fn control_out(&self, request: ControlRequest, data: &[u8])
        -> Result<usize, TransportError>;

    /// USB device reset.
    fn reset(&self) -> Result<(), TransportError>;

    /// Register a hook invoked when the transport notices a disconnect.
    fn on_disconnect(&mut self, hook: DisconnectHook);
}

use thiserror::Error;

use crate::status::{State, Status};
use crate::transport::TransportError;

/// Errors reported by the driver.
#[derive(Debug, Clone, Error)]
pub enum DfuError {
    /// The underlying control transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Operation issued before `connect` or after `close`.
    #[error("Not connected")]
    NotConnected,
    /// The session has no DFU interface candidate with this index.
    #[error("No DFU interface with index {0}")]
    InterfaceNotFound(usize),
    /// A USB descriptor could not be parsed.
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(&'static str),
    /// A DfuSe memory map string could not be parsed.
    #[error("Malformed memory map: {0}")]
    MalformedMemoryMap(String),
    /// The device reported a non-OK status or an unexpected state.
    #[error("Device reported \"{status}\" in state \"{state}\" during {phase}")]
    Protocol {
        state: State,
        status: Status,
        phase: &'static str,
    },
    /// A DfuSe operation targets an address outside the memory map.
    #[error("Address {0:#010x} is outside the device memory map")]
    AddressOutOfMap(u32),
    /// A DfuSe operation was attempted without a parsed memory map.
    #[error("No memory map")]
    NoMemoryMap,
    /// A wait did not complete within its window.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    /// The operation was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,
}

//! DFU protocol primitives over a claimed interface.
//!
//! [`DfuConnection`] issues the seven DFU class requests and the DfuSe
//! block-0 commands, and runs the status poll loop. It borrows the
//! transport; the session keeps ownership of the claim.

use std::thread;
use std::time::Duration;

use crate::descriptor::FunctionalDescriptor;
use crate::error::DfuError;
use crate::status::{State, StatusReport};
use crate::transport::{ControlRequest, ControlTransport, Recipient, RequestType};
use crate::DEFAULT_TRANSFER_SIZE;

const DFU_REQUEST_DETACH: u8 = 0;
const DFU_REQUEST_DNLOAD: u8 = 1;
const DFU_REQUEST_UPLOAD: u8 = 2;
const DFU_REQUEST_GETSTATUS: u8 = 3;
const DFU_REQUEST_CLRSTATUS: u8 = 4;
const DFU_REQUEST_GETSTATE: u8 = 5;
const DFU_REQUEST_ABORT: u8 = 6;

const STATUS_REPLY_LEN: u16 = 6;

const DFUSE_CMD_GET_COMMANDS: u8 = 0x00;
const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;
const DFUSE_CMD_ERASE_SECTOR: u8 = 0x41;

/// DFU class requests against one claimed interface.
pub struct DfuConnection<'t, T: ControlTransport> {
    transport: &'t T,
    interface_number: u8,
    functional: FunctionalDescriptor,
}

impl<'t, T: ControlTransport> DfuConnection<'t, T> {
    pub fn new(
        transport: &'t T,
        interface_number: u8,
        functional: FunctionalDescriptor,
    ) -> Self {
        Self {
            transport,
            interface_number,
            functional,
        }
    }

    pub fn functional(&self) -> &FunctionalDescriptor {
        &self.functional
    }

    /// Transfer size to chunk reads and writes with.
    pub fn transfer_size(&self) -> u16 {
        if self.functional.transfer_size > 0 {
            self.functional.transfer_size
        } else {
            DEFAULT_TRANSFER_SIZE
        }
    }

    fn class_request(&self, request: u8, value: u16) -> ControlRequest {
        ControlRequest {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: self.interface_number as u16,
        }
    }

    fn request_out(&self, request: u8, value: u16, data: &[u8]) -> Result<usize, DfuError> {
        Ok(self
            .transport
            .control_out(self.class_request(request, value), data)?)
    }

    fn request_in(&self, request: u8, value: u16, length: u16) -> Result<Vec<u8>, DfuError> {
        Ok(self
            .transport
            .control_in(self.class_request(request, value), length)?)
    }

    /// DFU_DETACH; `timeout_ms` is how long the device will wait for the
    /// following USB reset.
    pub fn detach(&self, timeout_ms: u16) -> Result<(), DfuError> {
        log::debug!("detaching (timeout {timeout_ms} ms)");
        self.request_out(DFU_REQUEST_DETACH, timeout_ms, &[])?;
        Ok(())
    }

    /// DFU_DNLOAD of one block.
    pub fn dnload(&self, block_num: u16, data: &[u8]) -> Result<usize, DfuError> {
        log::trace!("DNLOAD block {} ({} bytes)", block_num, data.len());
        self.request_out(DFU_REQUEST_DNLOAD, block_num, data)
    }

    /// DFU_UPLOAD of one block of at most `length` bytes.
    pub fn upload(&self, block_num: u16, length: u16) -> Result<Vec<u8>, DfuError> {
        log::trace!("UPLOAD block {block_num} ({length} bytes)");
        self.request_in(DFU_REQUEST_UPLOAD, block_num, length)
    }

    pub fn get_status(&self) -> Result<StatusReport, DfuError> {
        let data = self.request_in(DFU_REQUEST_GETSTATUS, 0, STATUS_REPLY_LEN)?;
        let report = StatusReport::from_bytes(&data)?;
        log::trace!(
            "status {:?} state {:?} poll {} ms",
            report.status,
            report.state,
            report.poll_timeout_ms
        );
        Ok(report)
    }

    pub fn clear_status(&self) -> Result<(), DfuError> {
        self.request_out(DFU_REQUEST_CLRSTATUS, 0, &[])?;
        Ok(())
    }

    pub fn get_state(&self) -> Result<State, DfuError> {
        let data = self.request_in(DFU_REQUEST_GETSTATE, 0, 1)?;
        let raw = *data
            .first()
            .ok_or(DfuError::MalformedDescriptor("empty GETSTATE reply"))?;
        State::from_raw(raw).ok_or(DfuError::MalformedDescriptor("unknown DFU state"))
    }

    pub fn abort(&self) -> Result<(), DfuError> {
        self.request_out(DFU_REQUEST_ABORT, 0, &[])?;
        Ok(())
    }

    /// Poll GET_STATUS until `predicate` matches the reported state or
    /// the device enters the error state.
    ///
    /// The device's reported poll timeout is slept between polls; it is
    /// a backpressure signal, not a suggestion. There is no iteration
    /// cap, the device's timeouts govern overall wall time.
    pub fn poll_until(
        &self,
        predicate: impl Fn(State) -> bool,
    ) -> Result<StatusReport, DfuError> {
        loop {
            let report = self.get_status()?;
            if predicate(report.state) || report.state == State::DfuError {
                return Ok(report);
            }
            thread::sleep(Duration::from_millis(report.poll_timeout_ms as u64));
        }
    }

    /// Poll until the device reaches `expected`, failing on a non-OK
    /// status or on any other terminal state.
    pub fn poll_until_state(
        &self,
        expected: State,
        phase: &'static str,
    ) -> Result<StatusReport, DfuError> {
        let report = self.poll_until(|state| state == expected)?;
        report.ok(phase)?;
        if report.state != expected {
            return Err(DfuError::Protocol {
                state: report.state,
                status: report.status,
                phase,
            });
        }
        Ok(report)
    }

    /// Abort whatever transfer is in progress and drive the device back
    /// to `dfuIDLE`, clearing an error status on the way.
    pub fn abort_to_idle(&self) -> Result<(), DfuError> {
        self.abort()?;
        let mut state = self.get_state()?;
        if state == State::DfuError {
            self.clear_status()?;
            state = self.get_state()?;
        }
        if state != State::DfuIdle {
            return Err(DfuError::Protocol {
                state,
                status: crate::status::Status::Ok,
                phase: "abort to idle",
            });
        }
        Ok(())
    }

    /// Abort to idle only when the device is not already idle.
    pub fn ensure_idle(&self) -> Result<(), DfuError> {
        let report = self.get_status()?;
        if report.state != State::DfuIdle {
            self.abort_to_idle()?;
        }
        Ok(())
    }

    /// USB reset of the whole device.
    pub fn usb_reset(&self) -> Result<(), DfuError> {
        log::debug!("resetting device");
        Ok(self.transport.reset()?)
    }

    fn dfuse_command(
        &self,
        command: u8,
        param: Option<u32>,
        phase: &'static str,
    ) -> Result<(), DfuError> {
        let mut payload = vec![command];
        if let Some(param) = param {
            payload.extend_from_slice(&param.to_le_bytes());
        }
        self.dnload(0, &payload)?;
        let report = self.poll_until(|state| state != State::DfuDnbusy)?;
        report.ok(phase)
    }

    /// DfuSe SET_ADDRESS; subsequent data blocks are programmed relative
    /// to this pointer. Leaves the device in `dfuDNLOAD_IDLE`.
    pub fn dfuse_set_address(&self, address: u32) -> Result<(), DfuError> {
        log::trace!("set address {address:#010x}");
        self.dfuse_command(DFUSE_CMD_SET_ADDRESS, Some(address), "set address")
    }

    /// DfuSe ERASE_SECTOR for the sector containing `address`.
    pub fn dfuse_erase_sector(&self, address: u32) -> Result<(), DfuError> {
        log::trace!("erase sector {address:#010x}");
        self.dfuse_command(DFUSE_CMD_ERASE_SECTOR, Some(address), "erase")
    }

    /// DfuSe GET_COMMANDS probe.
    pub fn dfuse_get_commands(&self) -> Result<(), DfuError> {
        self.dfuse_command(DFUSE_CMD_GET_COMMANDS, None, "get commands")
    }
}

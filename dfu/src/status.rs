//! DFU states, status codes and the GET_STATUS report.

use std::fmt;

use bytes::Buf;

use crate::error::DfuError;

/// DFU device state, section 6.1.2 of the DFU 1.1 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnbusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
}

impl State {
    pub fn from_raw(value: u8) -> Option<Self> {
        Some(match value {
            0 => State::AppIdle,
            1 => State::AppDetach,
            2 => State::DfuIdle,
            3 => State::DfuDnloadSync,
            4 => State::DfuDnbusy,
            5 => State::DfuDnloadIdle,
            6 => State::DfuManifestSync,
            7 => State::DfuManifest,
            8 => State::DfuManifestWaitReset,
            9 => State::DfuUploadIdle,
            10 => State::DfuError,
            _ => return None,
        })
    }
}

impl From<State> for u8 {
    fn from(state: State) -> u8 {
        state as u8
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use State::*;

        write!(
            f,
            "{}",
            match self {
                AppIdle => "application idle",
                AppDetach => "application detach",
                DfuIdle => "DFU idle",
                DfuDnloadSync => "download synchronization",
                DfuDnbusy => "download busy",
                DfuDnloadIdle => "download idle",
                DfuManifestSync => "manifest synchronization",
                DfuManifest => "manifestation in progress",
                DfuManifestWaitReset => "waiting for reset after manifestation",
                DfuUploadIdle => "upload idle",
                DfuError => "error",
            }
        )
    }
}

/// DFU status code, section 6.1.2 of the DFU 1.1 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotdone,
    ErrFirmware,
    ErrVendor,
    ErrUsbr,
    ErrPor,
    ErrUnknown,
    ErrStalledpkt,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        use Status::*;

        match value {
            0x00 => Ok,
            0x01 => ErrTarget,
            0x02 => ErrFile,
            0x03 => ErrWrite,
            0x04 => ErrErase,
            0x05 => ErrCheckErased,
            0x06 => ErrProg,
            0x07 => ErrVerify,
            0x08 => ErrAddress,
            0x09 => ErrNotdone,
            0x0A => ErrFirmware,
            0x0B => ErrVendor,
            0x0C => ErrUsbr,
            0x0D => ErrPor,
            0x0F => ErrStalledpkt,
            _ => ErrUnknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Status::*;

        write!(
            f,
            "{}",
            match self {
                Ok => "no error",
                ErrTarget => "file is not targeted for this device",
                ErrFile => "file fails a vendor-specific verification test",
                ErrWrite => "device is unable to write memory",
                ErrErase => "memory erase failed",
                ErrCheckErased => "memory erase check failed",
                ErrProg => "program memory function failed",
                ErrVerify => "programmed memory failed verification",
                ErrAddress => "received address is out of range",
                ErrNotdone => "device does not think it has all of the data yet",
                ErrFirmware => "device firmware is corrupt",
                ErrVendor => "vendor-specific error",
                ErrUsbr => "unexpected USB reset signaling",
                ErrPor => "unexpected power on reset",
                ErrUnknown => "unknown error",
                ErrStalledpkt => "device stalled an unexpected request",
            }
        )
    }
}

/// Decoded 6-byte GET_STATUS reply.
///
/// `poll_timeout_ms` is how long the host must wait before the next
/// GET_STATUS; the device uses it as a backpressure signal. The field is
/// 24 bits on the wire and kept truncated to 24 bits here.
#[derive(Debug, Clone, Copy)]
pub struct StatusReport {
    pub status: Status,
    pub poll_timeout_ms: u32,
    pub state: State,
}

impl StatusReport {
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, DfuError> {
        if bytes.len() < 6 {
            return Err(DfuError::MalformedDescriptor(
                "status reply shorter than 6 bytes",
            ));
        }

        let status = Status::from(bytes.get_u8());
        let poll_timeout_ms = bytes.get_uint_le(3) as u32 & 0xFF_FFFF;
        let state = State::from_raw(bytes.get_u8())
            .ok_or(DfuError::MalformedDescriptor("unknown DFU state"))?;
        // the remaining byte is iString, which we ignore

        Ok(StatusReport {
            status,
            poll_timeout_ms,
            state,
        })
    }

    /// Fail with a protocol error when the device reported a problem.
    pub fn ok(&self, phase: &'static str) -> Result<(), DfuError> {
        if self.status != Status::Ok {
            Err(DfuError::Protocol {
                state: self.state,
                status: self.status,
                phase,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_status_report() {
        let report =
            StatusReport::from_bytes(&[0x00, 0xE8, 0x03, 0x00, 0x05, 0x00]).unwrap();
        assert_eq!(report.status, Status::Ok);
        assert_eq!(report.poll_timeout_ms, 1000);
        assert_eq!(report.state, State::DfuDnloadIdle);
    }

    #[test]
    fn poll_timeout_is_24_bit() {
        let report =
            StatusReport::from_bytes(&[0x00, 0xFF, 0xFF, 0xFF, 0x02, 0x00]).unwrap();
        assert_eq!(report.poll_timeout_ms, 0xFF_FFFF);
    }

    #[test]
    fn short_reply_is_rejected() {
        assert!(matches!(
            StatusReport::from_bytes(&[0x00, 0xE8, 0x03]),
            Err(DfuError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn error_status_fails_ok_check() {
        let report =
            StatusReport::from_bytes(&[0x03, 0x00, 0x00, 0x00, 0x0A, 0x00]).unwrap();
        assert_eq!(report.status, Status::ErrWrite);
        assert!(matches!(
            report.ok("download"),
            Err(DfuError::Protocol {
                state: State::DfuError,
                status: Status::ErrWrite,
                phase: "download",
            })
        ));
    }
}

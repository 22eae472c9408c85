//! Protocol engines and the plain DFU 1.1 read/write flows.

use crate::connection::DfuConnection;
use crate::dfuse::DfuSe;
use crate::error::DfuError;
use crate::events::{CancelToken, DfuEvent, EventSink};
use crate::status::State;
use crate::transport::ControlTransport;

/// Protocol engine selected at connect time.
///
/// DfuSe is chosen when the functional descriptor advertises DFU 1.1a
/// (`bcdDFUVersion` 0x011A) and the alternate setting's protocol byte is
/// 0x02; everything else runs the plain DFU 1.1 flows.
pub enum Engine {
    Dfu,
    DfuSe(DfuSe),
}

impl Engine {
    pub fn is_dfuse(&self) -> bool {
        matches!(self, Engine::DfuSe(_))
    }

    pub(crate) fn read<T: ControlTransport>(
        &self,
        conn: &DfuConnection<T>,
        xfer_size: u16,
        max_size: Option<usize>,
        events: &mut EventSink,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, DfuError> {
        match self {
            Engine::Dfu => upload(conn, xfer_size, max_size, 0, events, cancel),
            Engine::DfuSe(dfuse) => dfuse.read(conn, xfer_size, max_size, events, cancel),
        }
    }

    pub(crate) fn write<T: ControlTransport>(
        &self,
        conn: &DfuConnection<T>,
        xfer_size: u16,
        data: &[u8],
        events: &mut EventSink,
        cancel: &CancelToken,
    ) -> Result<(), DfuError> {
        match self {
            Engine::Dfu => download(conn, xfer_size, data, events, cancel),
            Engine::DfuSe(dfuse) => dfuse.write(conn, xfer_size, data, events, cancel),
        }
    }
}

/// Abort back to idle and bail out when the caller cancelled.
pub(crate) fn check_cancel<T: ControlTransport>(
    conn: &DfuConnection<T>,
    cancel: &CancelToken,
) -> Result<(), DfuError> {
    if cancel.is_cancelled() {
        log::debug!("operation cancelled, aborting to idle");
        if let Err(err) = conn.abort_to_idle() {
            log::warn!("abort after cancellation failed: {err}");
        }
        return Err(DfuError::Cancelled);
    }
    Ok(())
}

/// Plain DFU upload loop.
///
/// Reads blocks of `xfer_size` starting at `first_block` until the
/// device returns a short block or `max_size` is reached. When the read
/// is cut off by `max_size` the device is still in `dfuUPLOAD_IDLE` and
/// must be aborted back to idle.
pub(crate) fn upload<T: ControlTransport>(
    conn: &DfuConnection<T>,
    xfer_size: u16,
    max_size: Option<usize>,
    first_block: u16,
    events: &mut EventSink,
    cancel: &CancelToken,
) -> Result<Vec<u8>, DfuError> {
    debug_assert!(xfer_size > 0);

    let mut image = Vec::new();
    if max_size == Some(0) {
        return Ok(image);
    }

    log::debug!(
        "reading up to {} bytes in blocks of {}",
        max_size.map_or_else(|| "?".to_string(), |max| max.to_string()),
        xfer_size
    );

    let mut block = first_block;
    let mut short_block = false;
    loop {
        if let Some(max) = max_size {
            if image.len() >= max {
                break;
            }
        }
        check_cancel(conn, cancel)?;

        let request = max_size
            .map_or(xfer_size as usize, |max| {
                (max - image.len()).min(xfer_size as usize)
            }) as u16;
        let chunk = conn.upload(block, request)?;
        let received = chunk.len();
        image.extend_from_slice(&chunk);
        events.emit(DfuEvent::Progress {
            done: image.len(),
            total: max_size,
        });

        block = block.wrapping_add(1);
        if received < request as usize {
            // the device signalled the end of the image
            short_block = true;
            break;
        }
    }

    if !short_block {
        // cut off by max_size; the device still expects UPLOAD requests
        conn.abort_to_idle()?;
    }

    log::debug!("read {} bytes", image.len());
    Ok(image)
}

/// Plain DFU download flow: data blocks, empty commit block,
/// manifestation, device reset.
pub(crate) fn download<T: ControlTransport>(
    conn: &DfuConnection<T>,
    xfer_size: u16,
    data: &[u8],
    events: &mut EventSink,
    cancel: &CancelToken,
) -> Result<(), DfuError> {
    debug_assert!(xfer_size > 0);

    log::debug!("writing {} bytes in blocks of {}", data.len(), xfer_size);
    events.emit(DfuEvent::WriteStart);

    let mut sent = 0usize;
    let mut block: u16 = 0;
    for chunk in data.chunks(xfer_size as usize) {
        check_cancel(conn, cancel)?;
        conn.dnload(block, chunk)?;
        conn.poll_until_state(State::DfuDnloadIdle, "download")?;
        sent += chunk.len();
        block = block.wrapping_add(1);
        events.emit(DfuEvent::WriteProgress {
            done: sent,
            total: data.len(),
        });
    }

    // the zero-length block that commits the image
    conn.dnload(block, &[])?;
    manifest(conn)?;

    events.emit(DfuEvent::WriteEnd { total: sent });
    Ok(())
}

fn manifest<T: ControlTransport>(conn: &DfuConnection<T>) -> Result<(), DfuError> {
    if conn.functional().manifestation_tolerant {
        let report = conn
            .poll_until(|state| matches!(state, State::DfuIdle | State::DfuManifestWaitReset))?;
        report.ok("manifest")?;
        if report.state == State::DfuManifestWaitReset {
            log::debug!("device is not manifestation tolerant after all; expect it to drop off the bus");
        }
    } else {
        // one status poll to kick manifestation off; the device may
        // already be unable to answer
        match conn.get_status() {
            Ok(_) => {}
            Err(DfuError::Transport(err)) => {
                log::trace!("status poll during manifestation failed: {err}");
            }
            Err(err) => return Err(err),
        }
    }
    reset_ignoring_departure(conn)
}

/// USB reset, tolerating the device having already left the bus.
pub(crate) fn reset_ignoring_departure<T: ControlTransport>(
    conn: &DfuConnection<T>,
) -> Result<(), DfuError> {
    match conn.usb_reset() {
        Ok(()) => Ok(()),
        Err(DfuError::Transport(err)) if err.device_gone() => {
            log::debug!("device left the bus before reset: {err}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

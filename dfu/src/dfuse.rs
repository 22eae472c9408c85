//! DfuSe (DFU 1.1a) engine: explicit address targeting and sector erase.
//!
//! DfuSe reserves block numbers 0 and 1; block 0 carries commands
//! (SET_ADDRESS, ERASE_SECTOR, GET_COMMANDS), data transfers start at
//! block 2 and the device computes the address from the block number
//! relative to the last SET_ADDRESS.

use crate::connection::DfuConnection;
use crate::engine::{check_cancel, upload};
use crate::error::DfuError;
use crate::events::{CancelToken, DfuEvent, EventSink};
use crate::memory::MemoryMap;
use crate::status::State;
use crate::transport::ControlTransport;

/// Data transfers start here; blocks 0 and 1 are reserved.
const FIRST_DATA_BLOCK: u16 = 2;

/// Address-targeted engine state.
pub struct DfuSe {
    map: Option<MemoryMap>,
    start_address: Option<u32>,
}

impl DfuSe {
    pub fn new(map: Option<MemoryMap>) -> Self {
        Self {
            map,
            start_address: None,
        }
    }

    pub fn memory_map(&self) -> Option<&MemoryMap> {
        self.map.as_ref()
    }

    /// Override the address reads and writes start at. Unset means the
    /// first segment of the memory map.
    pub fn set_start_address(&mut self, address: u32) {
        self.start_address = Some(address);
    }

    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    fn resolve_start(&self) -> Result<u32, DfuError> {
        match self.start_address {
            Some(address) => Ok(address),
            None => Ok(self
                .map
                .as_ref()
                .ok_or(DfuError::NoMemoryMap)?
                .segments
                .first()
                .start()),
        }
    }

    /// Erase every sector overlapping `[start, start + length)`.
    ///
    /// Non-erasable segments are skipped without a command but still
    /// count toward progress, the caller wants to know how far along the
    /// range we are.
    fn erase(
        &self,
        conn: &DfuConnection<impl ControlTransport>,
        map: &MemoryMap,
        start: u32,
        length: usize,
        events: &mut EventSink,
        cancel: &CancelToken,
    ) -> Result<(), DfuError> {
        if length == 0 {
            return Ok(());
        }
        let last = start
            .checked_add(length as u32 - 1)
            .ok_or(DfuError::AddressOutOfMap(start))?;

        let first_segment = map
            .segment_for(start)
            .ok_or(DfuError::AddressOutOfMap(start))?;
        let last_segment = map
            .segment_for(last)
            .ok_or(DfuError::AddressOutOfMap(last))?;

        let erase_start = first_segment.sector_start(start);
        let erase_end = last_segment.sector_end(last);
        let total = erase_end - erase_start;
        log::debug!("erasing {erase_start:#010x}..{erase_end:#010x} ({total} bytes)");

        let mut addr = erase_start;
        while addr < erase_end {
            let segment = map
                .segment_for(addr)
                .ok_or(DfuError::AddressOutOfMap(addr))?;
            if !segment.erasable() {
                log::debug!(
                    "skipping non-erasable {:#010x}..{:#010x}",
                    addr,
                    segment.end()
                );
                addr = segment.end();
                events.emit(DfuEvent::EraseProgress {
                    done: addr.min(erase_end) - erase_start,
                    total,
                });
                continue;
            }

            check_cancel(conn, cancel)?;
            conn.dfuse_erase_sector(segment.sector_start(addr))?;
            addr = segment.sector_end(addr);
            events.emit(DfuEvent::EraseProgress {
                done: addr.min(erase_end) - erase_start,
                total,
            });
        }

        Ok(())
    }

    /// Address-targeted download: erase the affected sectors, program
    /// each chunk at its address, then commit.
    pub(crate) fn write(
        &self,
        conn: &DfuConnection<impl ControlTransport>,
        xfer_size: u16,
        data: &[u8],
        events: &mut EventSink,
        cancel: &CancelToken,
    ) -> Result<(), DfuError> {
        let map = self.map.as_ref().ok_or(DfuError::NoMemoryMap)?;
        let start = self.resolve_start()?;
        if map.segment_for(start).is_none() && !data.is_empty() {
            return Err(DfuError::AddressOutOfMap(start));
        }

        if !data.is_empty() {
            events.emit(DfuEvent::EraseStart);
            self.erase(conn, map, start, data.len(), events, cancel)?;
            events.emit(DfuEvent::EraseEnd);
        }

        log::debug!(
            "writing {} bytes at {start:#010x} in blocks of {xfer_size}",
            data.len()
        );
        events.emit(DfuEvent::WriteStart);
        let mut sent = 0usize;
        for chunk in data.chunks(xfer_size as usize) {
            check_cancel(conn, cancel)?;
            conn.dfuse_set_address(start + sent as u32)?;
            conn.dnload(FIRST_DATA_BLOCK, chunk)?;
            conn.poll_until_state(State::DfuDnloadIdle, "download")?;
            sent += chunk.len();
            events.emit(DfuEvent::WriteProgress {
                done: sent,
                total: data.len(),
            });
        }
        events.emit(DfuEvent::WriteEnd { total: sent });

        // point the device back at the image and send the zero-length
        // download that enters manifestation; the session performs the
        // USB reset when the caller asks for it
        conn.dfuse_set_address(start)?;
        conn.dnload(0, &[])?;
        let report = conn.poll_until(|state| state == State::DfuManifest)?;
        report.ok("manifest")
    }

    /// Address-targeted upload.
    pub(crate) fn read(
        &self,
        conn: &DfuConnection<impl ControlTransport>,
        xfer_size: u16,
        max_size: Option<usize>,
        events: &mut EventSink,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, DfuError> {
        let start = self.resolve_start()?;

        let in_map = self
            .map
            .as_ref()
            .is_some_and(|map| map.segment_for(start).is_some());
        if !in_map {
            log::warn!("read address {start:#010x} is outside the memory map");
            events.emit(DfuEvent::Error(DfuError::AddressOutOfMap(start)));
        }

        // bound the read by what is contiguously readable from here
        let max_size = match self.map.as_ref() {
            Some(map) if in_map => {
                let readable = map.contiguous_readable_from(start) as usize;
                Some(max_size.map_or(readable, |max| max.min(readable)))
            }
            _ => max_size,
        };

        conn.ensure_idle()?;
        conn.dfuse_set_address(start)?;
        // SET_ADDRESS leaves the device in download-idle; abort back to
        // idle before switching to upload
        conn.abort_to_idle()?;

        upload(conn, xfer_size, max_size, FIRST_DATA_BLOCK, events, cancel)
    }
}

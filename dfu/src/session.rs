//! Session controller: enumerates DFU interfaces on one device, opens a
//! selection and exposes the read/write surface.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::connection::DfuConnection;
use crate::descriptor::{
    ConfigurationDescriptor, FunctionalDescriptor, DFUSE_VERSION_NUMBER,
    DFU_PROTOCOL_DFU_MODE,
};
use crate::dfuse::DfuSe;
use crate::engine::{self, Engine};
use crate::error::DfuError;
use crate::events::{CancelToken, DfuEvent, EventSink};
use crate::memory::MemoryMap;
use crate::status::StatusReport;
use crate::transport::{
    ControlRequest, ControlTransport, Recipient, RequestType, TransportError,
};

const GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_CONFIGURATION: u16 = 0x02;
const DESCRIPTOR_TYPE_STRING: u16 = 0x03;
const LANG_ID_EN_US: u16 = 0x0409;

const DISCONNECT_POLL: Duration = Duration::from_millis(100);

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Initialized,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Re-read every interface-name string descriptor after configuring
    /// the device when enumeration left names empty. Some bootloaders
    /// only answer string requests once configured.
    pub force_interfaces_name: bool,
}

/// One DFU-capable alternate setting found during enumeration.
#[derive(Debug, Clone)]
pub struct InterfaceSelection {
    pub configuration_value: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_protocol: u8,
    pub string_index: u8,
    pub interface_name: Option<String>,
}

#[derive(Default)]
struct DisconnectFlag {
    hit: AtomicBool,
    cause: Mutex<Option<TransportError>>,
}

/// Lifecycle container owning the transport, the claimed interface and
/// the protocol engine.
pub struct Session<T: ControlTransport> {
    transport: T,
    options: SessionOptions,
    state: SessionState,
    configurations: Vec<ConfigurationDescriptor>,
    candidates: Vec<InterfaceSelection>,
    selection: Option<InterfaceSelection>,
    functional: Option<FunctionalDescriptor>,
    engine: Option<Engine>,
    events: EventSink,
    cancel: CancelToken,
    disconnect: Arc<DisconnectFlag>,
}

impl<T: ControlTransport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, SessionOptions::default())
    }

    pub fn with_options(transport: T, options: SessionOptions) -> Self {
        Self {
            transport,
            options,
            state: SessionState::New,
            configurations: Vec::new(),
            candidates: Vec::new(),
            selection: None,
            functional: None,
            engine: None,
            events: EventSink::new(),
            cancel: CancelToken::new(),
            disconnect: Arc::new(DisconnectFlag::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// DFU-capable alternate settings found by [`Session::init`].
    pub fn candidates(&self) -> &[InterfaceSelection] {
        &self.candidates
    }

    pub fn functional_descriptor(&self) -> Option<&FunctionalDescriptor> {
        self.functional.as_ref()
    }

    pub fn memory_map(&self) -> Option<&MemoryMap> {
        match self.engine.as_ref()? {
            Engine::DfuSe(dfuse) => dfuse.memory_map(),
            Engine::Dfu => None,
        }
    }

    pub fn is_dfuse(&self) -> bool {
        self.engine.as_ref().is_some_and(Engine::is_dfuse)
    }

    /// Install the sink that lifecycle and progress events are
    /// delivered to.
    pub fn set_event_hook(&mut self, hook: impl FnMut(&DfuEvent) + 'static) {
        self.events.set(hook);
    }

    /// Token callers can fire from another context to cancel the
    /// operation in flight.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Parse descriptors and populate the candidate interface list.
    pub fn init(&mut self) -> Result<(), DfuError> {
        if self.state == SessionState::Closed {
            return Err(DfuError::NotConnected);
        }
        if !self.transport.is_open() {
            self.transport.open()?;
        }

        let flag = Arc::clone(&self.disconnect);
        self.transport.on_disconnect(Box::new(move |cause| {
            if let Ok(mut slot) = flag.cause.lock() {
                *slot = cause;
            }
            flag.hit.store(true, Ordering::SeqCst);
        }));

        self.configurations.clear();
        self.candidates.clear();
        for index in 0..self.transport.num_configurations() {
            let raw = fetch_configuration_descriptor(&self.transport, index)?;
            self.configurations.push(ConfigurationDescriptor::parse(&raw)?);
        }

        for config in &self.configurations {
            for alternate in config.dfu_alternates() {
                self.candidates.push(InterfaceSelection {
                    configuration_value: config.configuration_value,
                    interface_number: alternate.interface_number,
                    alternate_setting: alternate.alternate_setting,
                    interface_protocol: alternate.interface_protocol,
                    string_index: alternate.string_index,
                    interface_name: None,
                });
            }
        }
        log::debug!("found {} DFU interface candidate(s)", self.candidates.len());

        let language = fetch_languages(&self.transport)
            .ok()
            .and_then(|languages| languages.first().copied())
            .unwrap_or(LANG_ID_EN_US);
        for candidate in &mut self.candidates {
            if candidate.string_index != 0 {
                candidate.interface_name =
                    fetch_string(&self.transport, candidate.string_index, language).ok();
            }
        }

        if self.options.force_interfaces_name
            && self.candidates.iter().any(|c| c.interface_name.is_none())
        {
            self.recover_interface_names()?;
        }

        self.state = SessionState::Initialized;
        self.events.emit(DfuEvent::Init);
        Ok(())
    }

    /// Re-read interface-name strings after configuring the device.
    ///
    /// Walks every configuration descriptor for the string indexes of
    /// its alternate settings, fetches each distinct non-zero index and
    /// back-fills the candidates.
    fn recover_interface_names(&mut self) -> Result<(), DfuError> {
        if !self.transport.is_open() {
            self.transport.open()?;
        }
        self.transport.select_configuration(1)?;

        let mut indexes = BTreeSet::new();
        for config in &self.configurations {
            for interface in config.interfaces() {
                if interface.string_index != 0 {
                    indexes.insert(interface.string_index);
                }
            }
        }

        let mut names = BTreeMap::new();
        for index in indexes {
            match fetch_string(&self.transport, index, LANG_ID_EN_US) {
                Ok(name) => {
                    names.insert(index, name);
                }
                Err(err) => {
                    log::warn!("could not read string descriptor {index}: {err}");
                }
            }
        }

        for candidate in &mut self.candidates {
            if candidate.interface_name.is_none() {
                candidate.interface_name = names.get(&candidate.string_index).cloned();
            }
        }
        Ok(())
    }

    /// Open the candidate with this index: select its configuration,
    /// claim the interface, select the alternate setting and instantiate
    /// the matching engine.
    pub fn connect(&mut self, index: usize) -> Result<(), DfuError> {
        match self.state {
            SessionState::New => self.init()?,
            SessionState::Closed => return Err(DfuError::NotConnected),
            _ => {}
        }

        let candidate = self
            .candidates
            .get(index)
            .cloned()
            .ok_or(DfuError::InterfaceNotFound(index))?;

        if !self.transport.is_open() {
            self.transport.open()?;
        }
        self.transport
            .select_configuration(candidate.configuration_value)?;
        self.transport.claim_interface(candidate.interface_number)?;
        self.transport
            .select_alternate(candidate.interface_number, candidate.alternate_setting)?;

        // first functional descriptor of the active configuration; fall
        // back to any configuration carrying one
        let active = self
            .transport
            .active_configuration()
            .unwrap_or(candidate.configuration_value);
        let functional = self
            .configurations
            .iter()
            .find(|c| c.configuration_value == active)
            .and_then(|c| c.functional_descriptor().copied())
            .or_else(|| {
                self.configurations
                    .iter()
                    .find_map(|c| c.functional_descriptor().copied())
            })
            .ok_or(DfuError::MalformedDescriptor(
                "no DFU functional descriptor found",
            ))?;

        let engine = if functional.dfu_version == DFUSE_VERSION_NUMBER
            && candidate.interface_protocol == DFU_PROTOCOL_DFU_MODE
        {
            let map = candidate.interface_name.as_deref().and_then(|name| {
                match MemoryMap::parse(name) {
                    Ok(map) => Some(map),
                    Err(err) => {
                        log::warn!("could not parse memory map from {name:?}: {err}");
                        None
                    }
                }
            });
            Engine::DfuSe(DfuSe::new(map))
        } else {
            Engine::Dfu
        };
        log::debug!(
            "connected to interface {} alt {} ({})",
            candidate.interface_number,
            candidate.alternate_setting,
            if engine.is_dfuse() { "DfuSe" } else { "DFU" },
        );

        self.selection = Some(candidate);
        self.functional = Some(functional);
        self.engine = Some(engine);
        self.state = SessionState::Connected;
        self.events.emit(DfuEvent::Connect);
        Ok(())
    }

    fn connected(&self) -> Result<(u8, FunctionalDescriptor), DfuError> {
        if self.state != SessionState::Connected {
            return Err(DfuError::NotConnected);
        }
        let interface = self
            .selection
            .as_ref()
            .ok_or(DfuError::NotConnected)?
            .interface_number;
        let functional = self.functional.ok_or(DfuError::NotConnected)?;
        Ok((interface, functional))
    }

    /// Read firmware from the device, at most `max_size` bytes.
    pub fn read(&mut self, max_size: Option<usize>) -> Result<Vec<u8>, DfuError> {
        let (interface, functional) = self.connected()?;
        let conn = DfuConnection::new(&self.transport, interface, functional);
        let xfer_size = conn.transfer_size();
        let result = match self.engine.as_ref() {
            Some(engine) => {
                engine.read(&conn, xfer_size, max_size, &mut self.events, &self.cancel)
            }
            None => Err(DfuError::NotConnected),
        };
        self.finish(result)
    }

    /// Write firmware to the device. Plain DFU ends with a device reset;
    /// DfuSe leaves the device in manifestation, call
    /// [`Session::reset`] or [`Session::close`] afterwards.
    pub fn write(&mut self, data: &[u8]) -> Result<(), DfuError> {
        let (interface, functional) = self.connected()?;
        let conn = DfuConnection::new(&self.transport, interface, functional);
        let xfer_size = conn.transfer_size();
        let result = match self.engine.as_ref() {
            Some(engine) => {
                engine.write(&conn, xfer_size, data, &mut self.events, &self.cancel)
            }
            None => Err(DfuError::NotConnected),
        };
        self.finish(result)
    }

    /// Override the DfuSe start address. Returns false when the engine
    /// is plain DFU and ignores addresses.
    pub fn set_start_address(&mut self, address: u32) -> bool {
        match self.engine.as_mut() {
            Some(Engine::DfuSe(dfuse)) => {
                dfuse.set_start_address(address);
                true
            }
            _ => false,
        }
    }

    /// Ask a runtime-mode device to switch into its bootloader.
    pub fn detach(&mut self) -> Result<(), DfuError> {
        let (interface, functional) = self.connected()?;
        let conn = DfuConnection::new(&self.transport, interface, functional);
        let result = conn.detach(functional.detach_timeout).and_then(|()| {
            if functional.will_detach {
                Ok(())
            } else {
                // the device waits for a reset to re-enumerate
                engine::reset_ignoring_departure(&conn)
            }
        });
        self.finish(result)
    }

    /// Abort whatever transfer is in progress back to `dfuIDLE`.
    pub fn abort_to_idle(&mut self) -> Result<(), DfuError> {
        let (interface, functional) = self.connected()?;
        let conn = DfuConnection::new(&self.transport, interface, functional);
        let result = conn.abort_to_idle();
        self.finish(result)
    }

    /// One GET_STATUS round trip.
    pub fn get_status(&mut self) -> Result<StatusReport, DfuError> {
        let (interface, functional) = self.connected()?;
        let conn = DfuConnection::new(&self.transport, interface, functional);
        let result = conn.get_status();
        self.finish(result)
    }

    /// USB reset, tolerating a device that already left the bus.
    pub fn reset(&mut self) -> Result<(), DfuError> {
        if self.state != SessionState::Connected {
            return Err(DfuError::NotConnected);
        }
        match self.transport.reset() {
            Ok(()) => Ok(()),
            Err(err) if err.device_gone() => {
                log::debug!("device left the bus before reset: {err}");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Wait until the device leaves the bus. `timeout_ms == 0` waits
    /// indefinitely.
    pub fn wait_disconnected(&mut self, timeout_ms: u64) -> Result<(), DfuError> {
        let started = Instant::now();
        loop {
            if self.disconnect.hit.load(Ordering::SeqCst) {
                let cause = self
                    .disconnect
                    .cause
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take());
                self.mark_disconnected(cause);
                return Ok(());
            }
            if !self.transport.is_attached() {
                self.mark_disconnected(None);
                return Ok(());
            }
            if timeout_ms != 0 && started.elapsed() >= Duration::from_millis(timeout_ms) {
                return Err(DfuError::Timeout("device disconnect"));
            }
            thread::sleep(DISCONNECT_POLL);
        }
    }

    /// Release the claimed interface and the transport.
    pub fn close(&mut self) -> Result<(), DfuError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.engine = None;
        self.selection = None;
        self.functional = None;
        if self.transport.is_open() {
            self.transport.close()?;
        }
        self.state = SessionState::Closed;
        self.events.emit(DfuEvent::Disconnect(None));
        Ok(())
    }

    fn mark_disconnected(&mut self, cause: Option<TransportError>) {
        log::debug!("device disconnected");
        self.engine = None;
        self.selection = None;
        self.functional = None;
        self.state = SessionState::Closed;
        self.events.emit(DfuEvent::Disconnect(cause));
    }

    /// Deliver the terminal error event and fold transport-reported
    /// disconnection into the session state.
    fn finish<R>(&mut self, result: Result<R, DfuError>) -> Result<R, DfuError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.events.emit(DfuEvent::Error(err.clone()));
                if self.disconnect.hit.load(Ordering::SeqCst)
                    || matches!(&err, DfuError::Transport(t) if matches!(t, TransportError::Disconnected))
                {
                    let cause = match &err {
                        DfuError::Transport(t) => Some(t.clone()),
                        _ => None,
                    };
                    self.mark_disconnected(cause);
                }
                Err(err)
            }
        }
    }
}

fn standard_in<T: ControlTransport>(
    transport: &T,
    value: u16,
    index: u16,
    length: u16,
) -> Result<Vec<u8>, TransportError> {
    transport.control_in(
        ControlRequest {
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: GET_DESCRIPTOR,
            value,
            index,
        },
        length,
    )
}

/// Fetch the raw bytes of one configuration descriptor: header first for
/// `wTotalLength`, then the whole thing.
fn fetch_configuration_descriptor<T: ControlTransport>(
    transport: &T,
    index: u8,
) -> Result<Vec<u8>, DfuError> {
    let value = DESCRIPTOR_TYPE_CONFIGURATION << 8 | index as u16;
    let header = standard_in(transport, value, 0, 9)?;
    if header.len() < 9 {
        return Err(DfuError::MalformedDescriptor(
            "configuration descriptor header",
        ));
    }
    let total_length = u16::from_le_bytes([header[2], header[3]]);
    Ok(standard_in(transport, value, 0, total_length)?)
}

/// Fetch a raw string descriptor: one byte for `bLength`, then the full
/// record.
fn fetch_string_raw<T: ControlTransport>(
    transport: &T,
    index: u8,
    lang_id: u16,
) -> Result<Vec<u8>, DfuError> {
    let value = DESCRIPTOR_TYPE_STRING << 8 | index as u16;
    let head = standard_in(transport, value, lang_id, 1)?;
    let length = *head
        .first()
        .ok_or(DfuError::MalformedDescriptor("empty string descriptor"))?;
    if length < 2 {
        return Err(DfuError::MalformedDescriptor(
            "string descriptor length below 2",
        ));
    }
    Ok(standard_in(transport, value, lang_id, length as u16)?)
}

/// Decode a string descriptor as little-endian UCS-2.
fn fetch_string<T: ControlTransport>(
    transport: &T,
    index: u8,
    lang_id: u16,
) -> Result<String, DfuError> {
    let data = fetch_string_raw(transport, index, lang_id)?;
    let end = data.len().min(data.first().copied().unwrap_or(0) as usize);
    let units: Vec<u16> = data[2.min(end)..end]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// String descriptor zero: the language-ID array.
fn fetch_languages<T: ControlTransport>(transport: &T) -> Result<Vec<u16>, DfuError> {
    let data = fetch_string_raw(transport, 0, 0)?;
    Ok(data[2.min(data.len())..]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

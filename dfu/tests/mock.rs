//! Scripted fake transport shared by the integration tests.
//!
//! Models one USB device with a DFU bootloader: descriptors, string
//! table, and the DFU state machine. Every wire operation is recorded so
//! tests can assert exact request sequences.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use dfu_host::{
    ControlRequest, ControlTransport, DisconnectHook, Recipient, RequestType, State,
    TransportError,
};

/// Non-camel case naming to match the names in the DFU 1.1 spec.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
enum Request {
    DFU_DETACH = 0,
    DFU_DNLOAD = 1,
    DFU_UPLOAD = 2,
    DFU_GETSTATUS = 3,
    DFU_CLRSTATUS = 4,
    DFU_GETSTATE = 5,
    DFU_ABORT = 6,
}

const GET_DESCRIPTOR: u8 = 0x06;
const DESC_CONFIGURATION: u8 = 0x02;
const DESC_STRING: u8 = 0x03;

/// Recorded wire operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Dnload { block: u16, data: Vec<u8> },
    Upload { block: u16, length: u16 },
    GetStatus,
    ClrStatus,
    GetState,
    Abort,
    Detach { timeout: u16 },
    Reset,
    SelectConfiguration(u8),
    ClaimInterface(u8),
    SelectAlternate { interface: u8, alternate: u8 },
}

/// One alternate setting in a mock configuration.
#[derive(Debug, Clone, Copy)]
pub struct MockAlt {
    pub interface: u8,
    pub alternate: u8,
    pub string_index: u8,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub value: u8,
    pub alternates: Vec<MockAlt>,
}

#[derive(Clone)]
pub struct MockDeviceBuilder {
    manifestation_tolerant: bool,
    will_detach: bool,
    dfuse: bool,
    transfer_size: u16,
    poll_timeout_ms: u32,
    busy_polls: u16,
    upload_image: Vec<u8>,
    strings: BTreeMap<u8, String>,
    configs: Vec<MockConfig>,
    strings_need_configuration: bool,
    reset_error: Option<TransportError>,
}

impl Default for MockDeviceBuilder {
    fn default() -> Self {
        Self {
            manifestation_tolerant: true,
            will_detach: false,
            dfuse: false,
            transfer_size: 1024,
            poll_timeout_ms: 0,
            busy_polls: 0,
            upload_image: Vec::new(),
            strings: BTreeMap::new(),
            configs: vec![MockConfig {
                value: 1,
                alternates: vec![MockAlt {
                    interface: 0,
                    alternate: 0,
                    string_index: 0,
                }],
            }],
            strings_need_configuration: false,
            reset_error: None,
        }
    }
}

impl MockDeviceBuilder {
    pub fn manifestation_tolerant(mut self, tolerant: bool) -> Self {
        self.manifestation_tolerant = tolerant;
        self
    }

    pub fn will_detach(mut self, will_detach: bool) -> Self {
        self.will_detach = will_detach;
        self
    }

    pub fn dfuse(mut self, dfuse: bool) -> Self {
        self.dfuse = dfuse;
        self
    }

    pub fn transfer_size(mut self, size: u16) -> Self {
        self.transfer_size = size;
        self
    }

    pub fn poll_timeout_ms(mut self, timeout: u32) -> Self {
        self.poll_timeout_ms = timeout;
        self
    }

    /// GET_STATUS polls to answer with `dfuDNBUSY` before going idle.
    pub fn busy_polls(mut self, polls: u16) -> Self {
        self.busy_polls = polls;
        self
    }

    pub fn upload_image(mut self, image: Vec<u8>) -> Self {
        self.upload_image = image;
        self
    }

    pub fn string(mut self, index: u8, value: &str) -> Self {
        self.strings.insert(index, value.to_string());
        self
    }

    /// DfuSe with this memory layout in the interface name.
    pub fn memory_layout(mut self, layout: &str) -> Self {
        self.dfuse = true;
        self.strings.insert(4, layout.to_string());
        self.configs = vec![MockConfig {
            value: 1,
            alternates: vec![MockAlt {
                interface: 0,
                alternate: 0,
                string_index: 4,
            }],
        }];
        self
    }

    pub fn configs(mut self, configs: Vec<MockConfig>) -> Self {
        self.configs = configs;
        self
    }

    /// Stall string-descriptor reads until a configuration is selected.
    pub fn strings_need_configuration(mut self) -> Self {
        self.strings_need_configuration = true;
        self
    }

    pub fn reset_error(mut self, error: TransportError) -> Self {
        self.reset_error = Some(error);
        self
    }

    pub fn build(self) -> MockDevice {
        let dfu_version: u16 = if self.dfuse { 0x011A } else { 0x0110 };
        let mut attributes = 0x01; // bitCanDnload
        attributes |= 0x02; // bitCanUpload
        if self.manifestation_tolerant {
            attributes |= 0x04;
        }
        if self.will_detach {
            attributes |= 0x08;
        }

        let configs = self
            .configs
            .iter()
            .map(|config| {
                let bytes = config_bytes(config, attributes, self.transfer_size, dfu_version);
                (config.value, bytes)
            })
            .collect();

        MockDevice {
            inner: Arc::new(Mutex::new(Inner {
                configs,
                strings: self.strings,
                strings_need_configuration: self.strings_need_configuration,
                open: false,
                attached: true,
                configured: None,
                claimed: None,
                state: State::DfuIdle,
                status: 0,
                busy_polls: self.busy_polls,
                busy_left: 0,
                poll_timeout_ms: self.poll_timeout_ms,
                manifestation_tolerant: self.manifestation_tolerant,
                dfuse: self.dfuse,
                downloaded: Vec::new(),
                erased: Vec::new(),
                address_pointer: None,
                upload_image: self.upload_image,
                upload_offset: 0,
                inject_status: None,
                reset_error: self.reset_error,
                reset_count: 0,
                ops: Vec::new(),
                hooks: Vec::new(),
            })),
        }
    }
}

fn config_bytes(config: &MockConfig, attributes: u8, xfer: u16, version: u16) -> Vec<u8> {
    let mut body = Vec::new();
    for alt in &config.alternates {
        body.extend([
            9,
            0x04,
            alt.interface,
            alt.alternate,
            0,
            0xFE,
            0x01,
            0x02,
            alt.string_index,
        ]);
    }
    body.extend([
        9,
        0x21,
        attributes,
        0xE8,
        0x03,
        xfer as u8,
        (xfer >> 8) as u8,
        version as u8,
        (version >> 8) as u8,
    ]);

    let total = (9 + body.len()) as u16;
    let mut bytes = vec![
        9,
        0x02,
        total as u8,
        (total >> 8) as u8,
        config.alternates.len() as u8,
        config.value,
        0,
        0x80,
        50,
    ];
    bytes.extend(body);
    bytes
}

struct Inner {
    configs: Vec<(u8, Vec<u8>)>,
    strings: BTreeMap<u8, String>,
    strings_need_configuration: bool,
    open: bool,
    attached: bool,
    configured: Option<u8>,
    claimed: Option<u8>,
    state: State,
    status: u8,
    busy_polls: u16,
    busy_left: u16,
    poll_timeout_ms: u32,
    manifestation_tolerant: bool,
    dfuse: bool,
    downloaded: Vec<u8>,
    erased: Vec<u32>,
    address_pointer: Option<u32>,
    upload_image: Vec<u8>,
    upload_offset: usize,
    inject_status: Option<u8>,
    reset_error: Option<TransportError>,
    reset_count: usize,
    ops: Vec<Op>,
    hooks: Vec<DisconnectHook>,
}

impl Inner {
    fn status_reply(&mut self) -> Vec<u8> {
        self.ops.push(Op::GetStatus);

        let reported = match self.state {
            State::DfuDnloadSync => {
                if self.busy_left > 0 {
                    self.busy_left -= 1;
                    State::DfuDnbusy
                } else {
                    self.state = State::DfuDnloadIdle;
                    State::DfuDnloadIdle
                }
            }
            State::DfuManifestSync => {
                if self.manifestation_tolerant {
                    self.state = State::DfuIdle;
                    State::DfuIdle
                } else {
                    self.state = State::DfuManifestWaitReset;
                    State::DfuManifest
                }
            }
            state => state,
        };

        let timeout = self.poll_timeout_ms;
        vec![
            self.status,
            timeout as u8,
            (timeout >> 8) as u8,
            (timeout >> 16) as u8,
            reported.into(),
            0,
        ]
    }

    fn upload_reply(&mut self, block: u16, length: u16) -> Vec<u8> {
        self.ops.push(Op::Upload { block, length });

        let remaining = self.upload_image.len() - self.upload_offset;
        let n = (length as usize).min(remaining);
        let chunk = self.upload_image[self.upload_offset..self.upload_offset + n].to_vec();
        self.upload_offset += n;
        self.state = if n < length as usize {
            State::DfuIdle
        } else {
            State::DfuUploadIdle
        };
        chunk
    }

    fn dnload(&mut self, block: u16, data: &[u8]) {
        self.ops.push(Op::Dnload {
            block,
            data: data.to_vec(),
        });

        if let Some(code) = self.inject_status.take() {
            self.status = code;
            self.state = State::DfuError;
            return;
        }

        if self.dfuse && block == 0 {
            if data.is_empty() {
                // leave command: enter manifestation
                self.state = State::DfuManifest;
                return;
            }
            match data[0] {
                0x21 => {
                    assert_eq!(data.len(), 5, "SET_ADDRESS payload must be 5 bytes");
                    let addr = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                    self.address_pointer = Some(addr);
                }
                0x41 => {
                    assert_eq!(data.len(), 5, "ERASE_SECTOR payload must be 5 bytes");
                    let addr = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                    self.erased.push(addr);
                }
                0x00 => {
                    assert_eq!(data.len(), 1, "GET_COMMANDS payload must be 1 byte");
                }
                cmd => panic!("unsupported DfuSe command {cmd:#04x}"),
            }
            self.busy_left = self.busy_polls;
            self.state = State::DfuDnloadSync;
            return;
        }

        if data.is_empty() {
            self.busy_left = self.busy_polls;
            self.state = State::DfuManifestSync;
        } else {
            self.downloaded.extend_from_slice(data);
            self.busy_left = self.busy_polls;
            self.state = State::DfuDnloadSync;
        }
    }

    fn string_reply(&self, index: u8, length: u16) -> Result<Vec<u8>, TransportError> {
        if index == 0 {
            let bytes = vec![4, DESC_STRING, 0x09, 0x04];
            return Ok(truncate(bytes, length));
        }
        if self.strings_need_configuration && self.configured.is_none() {
            return Err(TransportError::Stall);
        }
        let value = self
            .strings
            .get(&index)
            .ok_or(TransportError::Stall)?;
        let mut bytes = vec![(2 + 2 * value.encode_utf16().count()) as u8, DESC_STRING];
        for unit in value.encode_utf16() {
            bytes.extend(unit.to_le_bytes());
        }
        Ok(truncate(bytes, length))
    }
}

fn truncate(mut bytes: Vec<u8>, length: u16) -> Vec<u8> {
    bytes.truncate(length as usize);
    bytes
}

/// Shared handle to the scripted device; clone one for the session and
/// keep one for assertions.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<Mutex<Inner>>,
}

impl MockDevice {
    pub fn builder() -> MockDeviceBuilder {
        MockDeviceBuilder::default()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().unwrap().ops.clone()
    }

    /// Recorded DFU requests only, descriptor traffic filtered out.
    pub fn dfu_ops(&self) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| {
                !matches!(
                    op,
                    Op::SelectConfiguration(_)
                        | Op::ClaimInterface(_)
                        | Op::SelectAlternate { .. }
                )
            })
            .collect()
    }

    pub fn downloaded(&self) -> Vec<u8> {
        self.inner.lock().unwrap().downloaded.clone()
    }

    pub fn erased(&self) -> Vec<u32> {
        self.inner.lock().unwrap().erased.clone()
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    pub fn was_reset(&self) -> bool {
        self.inner.lock().unwrap().reset_count > 0
    }

    /// Make the next DNLOAD fail with this DFU status code.
    pub fn inject_status(&self, code: u8) {
        self.inner.lock().unwrap().inject_status = Some(code);
    }

    pub fn set_state(&self, state: State) {
        self.inner.lock().unwrap().state = state;
    }

    /// Simulate the device dropping off the bus.
    pub fn unplug(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.attached = false;
        let mut hooks = std::mem::take(&mut inner.hooks);
        drop(inner);
        for hook in hooks.iter_mut() {
            hook(Some(TransportError::Disconnected));
        }
    }
}

impl ControlTransport for MockDevice {
    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.attached {
            return Err(TransportError::DeviceUnavailable);
        }
        inner.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        inner.claimed = None;
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().attached
    }

    fn vendor_id(&self) -> u16 {
        0x0483
    }

    fn product_id(&self) -> u16 {
        0xDF11
    }

    fn product_string(&self) -> Option<String> {
        Some("STM32 BOOTLOADER".to_string())
    }

    fn serial_number(&self) -> Option<String> {
        Some("385B35703330".to_string())
    }

    fn num_configurations(&self) -> u8 {
        self.inner.lock().unwrap().configs.len() as u8
    }

    fn active_configuration(&self) -> Result<u8, TransportError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .configured
            .unwrap_or_else(|| inner.configs[0].0))
    }

    fn select_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(Op::SelectConfiguration(value));
        inner.configured = Some(value);
        Ok(())
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(Op::ClaimInterface(number));
        inner.claimed = Some(number);
        Ok(())
    }

    fn select_alternate(&mut self, interface: u8, alternate: u8)
        -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(Op::SelectAlternate {
            interface,
            alternate,
        });
        Ok(())
    }

    fn control_in(&self, request: ControlRequest, length: u16)
        -> Result<Vec<u8>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.attached {
            return Err(TransportError::Disconnected);
        }

        match request.request_type {
            RequestType::Standard => {
                assert_eq!(request.recipient, Recipient::Device);
                assert_eq!(request.request, GET_DESCRIPTOR);
                let descriptor_type = (request.value >> 8) as u8;
                let index = request.value as u8;
                match descriptor_type {
                    DESC_CONFIGURATION => {
                        let bytes = inner
                            .configs
                            .get(index as usize)
                            .map(|(_, bytes)| bytes.clone())
                            .ok_or(TransportError::Stall)?;
                        Ok(truncate(bytes, length))
                    }
                    DESC_STRING => inner.string_reply(index, length),
                    other => panic!("unexpected descriptor type {other:#04x}"),
                }
            }
            RequestType::Class => {
                assert_eq!(request.recipient, Recipient::Interface);
                assert_eq!(Some(request.index as u8), inner.claimed);
                let request_code =
                    Request::from_u8(request.request).expect("unknown DFU request");
                match request_code {
                    Request::DFU_GETSTATUS => {
                        assert_eq!(request.value, 0);
                        Ok(truncate(inner.status_reply(), length))
                    }
                    Request::DFU_GETSTATE => {
                        inner.ops.push(Op::GetState);
                        Ok(vec![inner.state.into()])
                    }
                    Request::DFU_UPLOAD => Ok(inner.upload_reply(request.value, length)),
                    other => panic!("unexpected IN request {other:?}"),
                }
            }
        }
    }

    fn control_out(&self, request: ControlRequest, data: &[u8])
        -> Result<usize, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.attached {
            return Err(TransportError::Disconnected);
        }

        assert_eq!(request.request_type, RequestType::Class);
        assert_eq!(request.recipient, Recipient::Interface);
        assert_eq!(Some(request.index as u8), inner.claimed);

        let request_code = Request::from_u8(request.request).expect("unknown DFU request");
        match request_code {
            Request::DFU_DNLOAD => inner.dnload(request.value, data),
            Request::DFU_CLRSTATUS => {
                inner.ops.push(Op::ClrStatus);
                inner.status = 0;
                if inner.state == State::DfuError {
                    inner.state = State::DfuIdle;
                }
            }
            Request::DFU_ABORT => {
                inner.ops.push(Op::Abort);
                // a device in dfuERROR ignores ABORT and waits for CLRSTATUS
                if inner.state != State::DfuError {
                    inner.state = State::DfuIdle;
                }
            }
            Request::DFU_DETACH => {
                inner.ops.push(Op::Detach {
                    timeout: request.value,
                });
                inner.state = State::AppDetach;
            }
            other => panic!("unexpected OUT request {other:?}"),
        }
        Ok(data.len())
    }

    fn reset(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(Op::Reset);
        if let Some(error) = inner.reset_error.clone() {
            return Err(error);
        }
        inner.reset_count += 1;
        inner.state = State::DfuIdle;
        Ok(())
    }

    fn on_disconnect(&mut self, hook: DisconnectHook) {
        self.inner.lock().unwrap().hooks.push(hook);
    }
}

pub fn setup() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .parse_default_env()
        .try_init();
}

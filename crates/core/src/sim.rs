//! In-process loopback peer.
//!
//! Implements every lower-layer contract against a scripted HID keyboard so
//! the host can be exercised end to end without a controller: classic
//! signalling is answered by posting the peer's responses, GATT requests are
//! completed synchronously from the stored attribute database, and the
//! uhid side records what it was given.

use crate::dispatch::EventPoster;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, L2capEvent};
use crate::hogp::uuids;
use crate::pdu::{self, control, handshake, HidPdu, PduHeader, TransactionType};
use crate::stack::{
    AppId, ConfigResult, ConnectResult, GattCallbacks, GattCharacteristic, GattClient,
    GattDescriptor, GattService, GattStatus, HostStack, L2cap, L2capConfig, L2capMode,
    PairedDevices, SdpClient, Security, SecurityDirection, UhidFactory, UhidSink,
    PSM_HID_CONTROL, PSM_HID_INTERRUPT,
};
use crate::types::{DeviceAddress, HidInfo, PnpInfo, ReportType, SdpRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, info, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Peer behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOptions {
    /// Fail every security request.
    pub reject_security: bool,
    /// Never answer the battery level read.
    pub silent_battery: bool,
}

/// GAP security status reported when `reject_security` is set.
pub const SECURITY_REJECTED: u16 = 0x05;

/// ATT "attribute not found".
pub const ATT_ATTRIBUTE_NOT_FOUND: GattStatus = 0x0A;

/// A small boot-keyboard report descriptor.
pub const KEYBOARD_REPORT_MAP: &[u8] = &[
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x85, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15,
    0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, 0x95, 0x06, 0x75, 0x08, 0x26, 0xFF,
    0x00, 0x19, 0x00, 0x2A, 0xFF, 0x00, 0x81, 0x00, 0x85, 0x02, 0x05, 0x08, 0x19, 0x01, 0x29,
    0x05, 0x95, 0x05, 0x75, 0x01, 0x91, 0x02, 0x95, 0x03, 0x91, 0x01, 0xC0,
];

/// Attribute handles of the loopback keyboard's GATT database.
pub mod handles {
    pub const DIS: u16 = 0x0001;
    pub const PNP_ID: u16 = 0x0003;
    pub const BATTERY: u16 = 0x0005;
    pub const BATTERY_LEVEL: u16 = 0x0007;
    pub const HID: u16 = 0x0009;
    pub const HID_INFORMATION: u16 = 0x000B;
    pub const REPORT_MAP: u16 = 0x000D;
    pub const INPUT_REPORT: u16 = 0x000F;
    pub const INPUT_REF: u16 = 0x0010;
    pub const INPUT_CCC: u16 = 0x0011;
    pub const OUTPUT_REPORT: u16 = 0x0013;
    pub const OUTPUT_REF: u16 = 0x0014;
    pub const FEATURE_REPORT: u16 = 0x0016;
    pub const FEATURE_REF: u16 = 0x0017;
}

/// PnP identity the loopback keyboard reports over both transports.
pub const KEYBOARD_PNP: PnpInfo = PnpInfo {
    vendor_id: 0x046D,
    product_id: 0xC31C,
    version: 0x0111,
};

fn keyboard_hid_info() -> HidInfo {
    HidInfo {
        bcd_hid: 0x0111,
        country_code: 0,
        flags: 0x02,
        descriptor: KEYBOARD_REPORT_MAP.to_vec(),
    }
}

// ---------------------------------------------------------------------------
// uhid
// ---------------------------------------------------------------------------

/// One call made on a [`RecordingUhid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UhidCall {
    Open,
    Close,
    Destroy,
    Data(Vec<u8>),
    ControlData(Vec<u8>),
    Handshake(u8),
    HidInfo {
        name: String,
        pnp: PnpInfo,
        hid: HidInfo,
    },
}

/// uhid sink that logs and records every call.
#[derive(Debug, Default)]
pub struct RecordingUhid {
    calls: Mutex<Vec<UhidCall>>,
}

impl RecordingUhid {
    pub fn calls(&self) -> Vec<UhidCall> {
        lock(&self.calls).clone()
    }

    pub fn take(&self) -> Vec<UhidCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    fn record(&self, call: UhidCall) {
        trace!(?call, "uhid");
        lock(&self.calls).push(call);
    }
}

impl UhidSink for RecordingUhid {
    fn open(&self) {
        self.record(UhidCall::Open);
    }

    fn close(&self) {
        self.record(UhidCall::Close);
    }

    fn destroy(&self) {
        self.record(UhidCall::Destroy);
    }

    fn send_data(&self, data: &[u8]) {
        self.record(UhidCall::Data(data.to_vec()));
    }

    fn send_control_data(&self, data: &[u8]) {
        self.record(UhidCall::ControlData(data.to_vec()));
    }

    fn send_handshake(&self, code: u8) {
        self.record(UhidCall::Handshake(code));
    }

    fn send_hid_info(&self, name: &str, pnp: &PnpInfo, hid: &HidInfo) {
        self.record(UhidCall::HidInfo {
            name: name.to_string(),
            pnp: *pnp,
            hid: hid.clone(),
        });
    }
}

/// Hands out one [`RecordingUhid`] per address, reused across machines.
#[derive(Debug, Default)]
pub struct RecordingUhidFactory {
    sinks: Mutex<HashMap<DeviceAddress, Arc<RecordingUhid>>>,
}

impl RecordingUhidFactory {
    pub fn sink(&self, address: &DeviceAddress) -> Option<Arc<RecordingUhid>> {
        lock(&self.sinks).get(address).cloned()
    }
}

impl UhidFactory for RecordingUhidFactory {
    fn create(&self, address: &DeviceAddress) -> Arc<dyn UhidSink> {
        lock(&self.sinks)
            .entry(address.clone())
            .or_default()
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Paired-device registry
// ---------------------------------------------------------------------------

/// Paired-device registry populated by the caller.
#[derive(Debug, Default)]
pub struct LoopbackPaired {
    classic: Mutex<HashSet<DeviceAddress>>,
    ble: Mutex<HashSet<DeviceAddress>>,
    names: Mutex<HashMap<DeviceAddress, String>>,
}

impl LoopbackPaired {
    pub fn add_classic(&self, address: DeviceAddress, name: Option<&str>) {
        self.add_name(&address, name);
        lock(&self.classic).insert(address);
    }

    pub fn add_ble(&self, address: DeviceAddress, name: Option<&str>) {
        self.add_name(&address, name);
        lock(&self.ble).insert(address);
    }

    fn add_name(&self, address: &DeviceAddress, name: Option<&str>) {
        if let Some(name) = name {
            lock(&self.names).insert(address.clone(), name.to_string());
        }
    }
}

impl PairedDevices for LoopbackPaired {
    fn is_classic_paired(&self, address: &DeviceAddress) -> bool {
        lock(&self.classic).contains(address)
    }

    fn is_ble_paired(&self, address: &DeviceAddress) -> bool {
        lock(&self.ble).contains(address)
    }

    fn device_name(&self, address: &DeviceAddress) -> Option<String> {
        lock(&self.names).get(address).cloned()
    }
}

// ---------------------------------------------------------------------------
// Classic: security, SDP and L2CAP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PeerChannel {
    address: DeviceAddress,
    psm: u16,
    /// The peer opened this channel.
    inbound: bool,
}

/// Classic side of the loopback peer.
pub struct LoopbackClassic {
    options: PeerOptions,
    poster: OnceLock<Arc<dyn EventPoster>>,
    next_lcid: AtomicU16,
    next_id: AtomicU8,
    channels: Mutex<HashMap<u16, PeerChannel>>,
}

impl LoopbackClassic {
    pub fn new(options: PeerOptions) -> Self {
        Self {
            options,
            poster: OnceLock::new(),
            next_lcid: AtomicU16::new(0x0040),
            next_id: AtomicU8::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn attach(&self, poster: Arc<dyn EventPoster>) {
        if self.poster.set(poster).is_err() {
            warn!("loopback classic peer already attached");
        }
    }

    fn post(&self, address: &DeviceAddress, kind: EventKind) {
        match self.poster.get() {
            Some(poster) => poster.post(Event::new(address.clone(), kind)),
            None => warn!(%address, event = kind.name(), "loopback peer not attached, dropping"),
        }
    }

    fn post_l2cap(&self, address: &DeviceAddress, event: L2capEvent) {
        self.post(address, EventKind::L2cap(event));
    }

    fn alloc_lcid(&self) -> u16 {
        self.next_lcid.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_id(&self) -> u8 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn peer_config() -> L2capConfig {
        L2capConfig {
            mtu: 672,
            flush_timeout: 0xFFFF,
            mode: L2capMode::Basic,
        }
    }

    fn channel(&self, lcid: u16) -> Result<PeerChannel> {
        lock(&self.channels)
            .get(&lcid)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown channel 0x{lcid:04X}")))
    }

    fn lcid_for(&self, address: &DeviceAddress, psm: u16) -> Option<u16> {
        lock(&self.channels)
            .iter()
            .find(|(_, c)| c.address == *address && c.psm == psm)
            .map(|(lcid, _)| *lcid)
    }

    /// The peer opens the control channel, as a reconnecting keyboard would.
    pub fn peer_connect(&self, address: &DeviceAddress) {
        let lcid = self.alloc_lcid();
        lock(&self.channels).insert(
            lcid,
            PeerChannel {
                address: address.clone(),
                psm: PSM_HID_CONTROL,
                inbound: true,
            },
        );
        info!(%address, lcid, "peer opening control channel");
        self.post_l2cap(
            address,
            L2capEvent::ConnectIndication {
                lcid,
                id: self.alloc_id(),
                psm: PSM_HID_CONTROL,
            },
        );
    }

    /// The peer sends an input report on the interrupt channel.
    pub fn inject_input(&self, address: &DeviceAddress, report: &[u8]) -> Result<()> {
        let lcid = self
            .lcid_for(address, PSM_HID_INTERRUPT)
            .ok_or_else(|| Error::NotConnected(address.to_string()))?;
        let header = PduHeader::new(TransactionType::Data, ReportType::Input.as_u8())?;
        let payload = HidPdu::new(header, report.to_vec()).encode();
        self.post_l2cap(address, L2capEvent::Data { lcid, payload });
        Ok(())
    }

    /// The peer signals virtual cable unplug on the control channel.
    pub fn unplug(&self, address: &DeviceAddress) -> Result<()> {
        let lcid = self
            .lcid_for(address, PSM_HID_CONTROL)
            .ok_or_else(|| Error::NotConnected(address.to_string()))?;
        let payload = pdu::encode_control(control::VIRTUAL_CABLE_UNPLUG)?;
        self.post_l2cap(address, L2capEvent::Data { lcid, payload });
        Ok(())
    }

    fn answer(&self, channel: &PeerChannel, lcid: u16, pdu: HidPdu) {
        match pdu.header.kind {
            TransactionType::SetReport => {
                let result = match (pdu.report_type(), pdu.split_report_id()) {
                    (Some(report_type), Some((report_id, data))) => {
                        trace!(address = %channel.address, ?report_type, report_id, len = data.len(), "peer SET_REPORT");
                        handshake::SUCCESSFUL
                    }
                    _ => handshake::ERR_INVALID_PARAMETER,
                };
                self.post_l2cap(
                    &channel.address,
                    L2capEvent::Data {
                        lcid,
                        payload: vec![result],
                    },
                );
            }
            TransactionType::GetReport => {
                let mut payload = vec![0xA0 | (pdu.header.param & 0x03)];
                if let Some(&id) = pdu.body.first() {
                    payload.push(id);
                }
                payload.extend_from_slice(&[0x00, 0x00]);
                self.post_l2cap(&channel.address, L2capEvent::Data { lcid, payload });
            }
            other => debug!(address = %channel.address, kind = ?other, "peer ignoring PDU"),
        }
    }
}

impl Security for LoopbackClassic {
    fn request_security(
        &self,
        address: &DeviceAddress,
        direction: SecurityDirection,
        psm: u16,
    ) -> Result<()> {
        let status = if self.options.reject_security {
            SECURITY_REJECTED
        } else {
            0
        };
        debug!(%address, ?direction, psm = format_args!("0x{psm:04X}"), status, "peer security");
        self.post(address, EventKind::Security { direction, status });
        Ok(())
    }
}

impl SdpClient for LoopbackClassic {
    fn discover(&self, address: &DeviceAddress) -> Result<()> {
        self.post(
            address,
            EventKind::SdpComplete(Some(SdpRecord {
                pnp: KEYBOARD_PNP,
                hid: keyboard_hid_info(),
            })),
        );
        Ok(())
    }
}

impl L2cap for LoopbackClassic {
    fn connect_req(&self, address: &DeviceAddress, psm: u16) -> Result<u16> {
        let lcid = self.alloc_lcid();
        lock(&self.channels).insert(
            lcid,
            PeerChannel {
                address: address.clone(),
                psm,
                inbound: false,
            },
        );
        self.post_l2cap(
            address,
            L2capEvent::ConnectResponse {
                lcid,
                result: ConnectResult::Success,
            },
        );
        self.post_l2cap(
            address,
            L2capEvent::ConfigRequest {
                lcid,
                id: self.alloc_id(),
                config: Self::peer_config(),
            },
        );
        Ok(lcid)
    }

    fn connect_rsp(&self, lcid: u16, _id: u8, result: ConnectResult) -> Result<()> {
        let Some(channel) = lock(&self.channels).get(&lcid).cloned() else {
            // Rejected before we ever tracked it.
            return Ok(());
        };
        if result != ConnectResult::Success {
            lock(&self.channels).remove(&lcid);
            return Ok(());
        }
        self.post_l2cap(
            &channel.address,
            L2capEvent::ConfigRequest {
                lcid,
                id: self.alloc_id(),
                config: Self::peer_config(),
            },
        );
        Ok(())
    }

    fn config_req(&self, lcid: u16, _config: &L2capConfig) -> Result<()> {
        let channel = self.channel(lcid)?;
        self.post_l2cap(
            &channel.address,
            L2capEvent::ConfigResponse {
                lcid,
                result: ConfigResult::Success,
            },
        );
        if channel.inbound && channel.psm == PSM_HID_CONTROL {
            let intr = self.alloc_lcid();
            lock(&self.channels).insert(
                intr,
                PeerChannel {
                    address: channel.address.clone(),
                    psm: PSM_HID_INTERRUPT,
                    inbound: true,
                },
            );
            self.post_l2cap(
                &channel.address,
                L2capEvent::ConnectIndication {
                    lcid: intr,
                    id: self.alloc_id(),
                    psm: PSM_HID_INTERRUPT,
                },
            );
        }
        Ok(())
    }

    fn config_rsp(
        &self,
        _lcid: u16,
        _id: u8,
        _config: &L2capConfig,
        _result: ConfigResult,
    ) -> Result<()> {
        Ok(())
    }

    fn disconnect_req(&self, lcid: u16) -> Result<()> {
        let channel = lock(&self.channels)
            .remove(&lcid)
            .ok_or_else(|| Error::Transport(format!("unknown channel 0x{lcid:04X}")))?;
        self.post_l2cap(&channel.address, L2capEvent::DisconnectResponse { lcid });
        Ok(())
    }

    fn disconnect_rsp(&self, lcid: u16, _id: u8) -> Result<()> {
        lock(&self.channels).remove(&lcid);
        Ok(())
    }

    fn send_data(&self, lcid: u16, data: &[u8]) -> Result<()> {
        let channel = self.channel(lcid)?;
        trace!(address = %channel.address, lcid, data = format_args!("{:02X?}", data), "peer RX");
        let pdu = HidPdu::decode(data)?;
        self.answer(&channel, lcid, pdu);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GATT
// ---------------------------------------------------------------------------

/// GATT client backed by an in-memory attribute database.
///
/// Requests complete synchronously from inside the call unless the handle
/// has been silenced, in which case no completion is ever delivered.
pub struct LoopbackGatt {
    services: Mutex<Vec<GattService>>,
    values: Mutex<HashMap<u16, Vec<u8>>>,
    silent: Mutex<HashSet<u16>>,
    failing: Mutex<HashMap<u16, GattStatus>>,
    writes: Mutex<Vec<(u16, Vec<u8>)>>,
    apps: Mutex<HashMap<AppId, Arc<dyn GattCallbacks>>>,
    next_app: AtomicU32,
}

fn descriptor(uuid: u16, handle: u16) -> GattDescriptor {
    GattDescriptor { uuid, handle }
}

fn characteristic(
    uuid: u16,
    handle: u16,
    properties: u8,
    descriptors: Vec<GattDescriptor>,
) -> GattCharacteristic {
    GattCharacteristic {
        uuid,
        handle,
        properties,
        descriptors,
    }
}

impl LoopbackGatt {
    /// Keyboard with Device Information, Battery and HID services: input
    /// report 1, output report 2 and feature report 3.
    pub fn keyboard() -> Self {
        const READ: u8 = 0x02;
        const WRITE: u8 = 0x08;
        const NOTIFY: u8 = 0x10;
        let services = vec![
            GattService {
                uuid: uuids::DEVICE_INFORMATION_SERVICE,
                handle: handles::DIS,
                characteristics: vec![characteristic(uuids::PNP_ID, handles::PNP_ID, READ, vec![])],
            },
            GattService {
                uuid: uuids::BATTERY_SERVICE,
                handle: handles::BATTERY,
                characteristics: vec![characteristic(
                    uuids::BATTERY_LEVEL,
                    handles::BATTERY_LEVEL,
                    READ,
                    vec![],
                )],
            },
            GattService {
                uuid: uuids::HID_SERVICE,
                handle: handles::HID,
                characteristics: vec![
                    characteristic(uuids::HID_INFORMATION, handles::HID_INFORMATION, READ, vec![]),
                    characteristic(uuids::REPORT_MAP, handles::REPORT_MAP, READ, vec![]),
                    characteristic(
                        uuids::REPORT,
                        handles::INPUT_REPORT,
                        READ | NOTIFY,
                        vec![
                            descriptor(uuids::REPORT_REFERENCE, handles::INPUT_REF),
                            descriptor(uuids::CLIENT_CHARACTERISTIC_CONFIG, handles::INPUT_CCC),
                        ],
                    ),
                    characteristic(
                        uuids::REPORT,
                        handles::OUTPUT_REPORT,
                        READ | WRITE,
                        vec![descriptor(uuids::REPORT_REFERENCE, handles::OUTPUT_REF)],
                    ),
                    characteristic(
                        uuids::REPORT,
                        handles::FEATURE_REPORT,
                        READ | WRITE,
                        vec![descriptor(uuids::REPORT_REFERENCE, handles::FEATURE_REF)],
                    ),
                ],
            },
        ];
        let pnp = KEYBOARD_PNP;
        let mut pnp_id = vec![0x02];
        pnp_id.extend_from_slice(&pnp.vendor_id.to_le_bytes());
        pnp_id.extend_from_slice(&pnp.product_id.to_le_bytes());
        pnp_id.extend_from_slice(&pnp.version.to_le_bytes());
        let values = HashMap::from([
            (handles::PNP_ID, pnp_id),
            (handles::BATTERY_LEVEL, vec![87]),
            (handles::HID_INFORMATION, vec![0x11, 0x01, 0x00, 0x02]),
            (handles::REPORT_MAP, KEYBOARD_REPORT_MAP.to_vec()),
            (handles::INPUT_REPORT, vec![0x00; 8]),
            (handles::INPUT_REF, vec![0x01, 0x01]),
            (handles::INPUT_CCC, vec![0x00, 0x00]),
            (handles::OUTPUT_REPORT, vec![0x00]),
            (handles::OUTPUT_REF, vec![0x02, 0x02]),
            (handles::FEATURE_REPORT, vec![0xAA, 0x55]),
            (handles::FEATURE_REF, vec![0x03, 0x03]),
        ]);
        Self {
            services: Mutex::new(services),
            values: Mutex::new(values),
            silent: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            apps: Mutex::new(HashMap::new()),
            next_app: AtomicU32::new(1),
        }
    }

    /// Never complete requests on `handle`.
    pub fn silence(&self, handle: u16) {
        lock(&self.silent).insert(handle);
    }

    /// Complete requests on `handle` with `status`.
    pub fn fail(&self, handle: u16, status: GattStatus) {
        lock(&self.failing).insert(handle, status);
    }

    pub fn set_value(&self, handle: u16, value: Vec<u8>) {
        lock(&self.values).insert(handle, value);
    }

    /// Drop a descriptor from the database.
    pub fn remove_descriptor(&self, handle: u16) {
        for service in lock(&self.services).iter_mut() {
            for chr in &mut service.characteristics {
                chr.descriptors.retain(|d| d.handle != handle);
            }
        }
    }

    /// Send a notification on `handle` to every registered application.
    pub fn notify(&self, handle: u16, value: Vec<u8>) {
        let apps: Vec<_> = lock(&self.apps).values().cloned().collect();
        for callbacks in apps {
            callbacks.on_characteristic_changed(handle, value.clone());
        }
    }

    /// Successful writes, in order.
    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    /// Number of registered applications.
    pub fn registered(&self) -> usize {
        lock(&self.apps).len()
    }

    fn callbacks(&self, app: AppId) -> Result<Arc<dyn GattCallbacks>> {
        lock(&self.apps)
            .get(&app)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown GATT application {app}")))
    }

    fn is_silent(&self, handle: u16) -> bool {
        let silent = lock(&self.silent).contains(&handle);
        if silent {
            trace!(handle = format_args!("0x{handle:04X}"), "GATT request left unanswered");
        }
        silent
    }

    fn read(&self, handle: u16) -> (GattStatus, Vec<u8>) {
        if let Some(&status) = lock(&self.failing).get(&handle) {
            return (status, Vec::new());
        }
        match lock(&self.values).get(&handle) {
            Some(value) => (0, value.clone()),
            None => (ATT_ATTRIBUTE_NOT_FOUND, Vec::new()),
        }
    }

    fn write(&self, handle: u16, value: &[u8]) -> GattStatus {
        if let Some(&status) = lock(&self.failing).get(&handle) {
            return status;
        }
        lock(&self.writes).push((handle, value.to_vec()));
        lock(&self.values).insert(handle, value.to_vec());
        0
    }
}

impl GattClient for LoopbackGatt {
    fn register_application(
        &self,
        address: &DeviceAddress,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> Result<AppId> {
        let app = self.next_app.fetch_add(1, Ordering::Relaxed);
        lock(&self.apps).insert(app, callbacks);
        debug!(%address, app, "loopback GATT application registered");
        Ok(app)
    }

    fn deregister_application(&self, app: AppId) {
        lock(&self.apps).remove(&app);
    }

    fn connect(&self, app: AppId) -> Result<()> {
        self.callbacks(app)?.on_connection_state_changed(true, 0);
        Ok(())
    }

    fn disconnect(&self, app: AppId) -> Result<()> {
        self.callbacks(app)?.on_connection_state_changed(false, 0);
        Ok(())
    }

    fn discover_services(&self, app: AppId) -> Result<()> {
        self.callbacks(app)?.on_services_discovered(0);
        Ok(())
    }

    fn services(&self, _app: AppId) -> Vec<GattService> {
        lock(&self.services).clone()
    }

    fn read_characteristic(&self, app: AppId, handle: u16) -> Result<()> {
        let callbacks = self.callbacks(app)?;
        if !self.is_silent(handle) {
            let (status, value) = self.read(handle);
            callbacks.on_characteristic_read(handle, status, value);
        }
        Ok(())
    }

    fn write_characteristic(&self, app: AppId, handle: u16, value: &[u8]) -> Result<()> {
        let callbacks = self.callbacks(app)?;
        if !self.is_silent(handle) {
            callbacks.on_characteristic_write(handle, self.write(handle, value));
        }
        Ok(())
    }

    fn read_descriptor(&self, app: AppId, handle: u16) -> Result<()> {
        let callbacks = self.callbacks(app)?;
        if !self.is_silent(handle) {
            let (status, value) = self.read(handle);
            callbacks.on_descriptor_read(handle, status, value);
        }
        Ok(())
    }

    fn write_descriptor(&self, app: AppId, handle: u16, value: &[u8]) -> Result<()> {
        let callbacks = self.callbacks(app)?;
        if !self.is_silent(handle) {
            callbacks.on_descriptor_write(handle, self.write(handle, value));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// A complete loopback peer.
pub struct Loopback {
    pub classic: Arc<LoopbackClassic>,
    pub gatt: Arc<LoopbackGatt>,
    pub paired: Arc<LoopbackPaired>,
    pub uhid: Arc<RecordingUhidFactory>,
}

impl Loopback {
    pub fn new(options: PeerOptions) -> Self {
        let gatt = LoopbackGatt::keyboard();
        if options.silent_battery {
            gatt.silence(handles::BATTERY_LEVEL);
        }
        Self {
            classic: Arc::new(LoopbackClassic::new(options)),
            gatt: Arc::new(gatt),
            paired: Arc::new(LoopbackPaired::default()),
            uhid: Arc::new(RecordingUhidFactory::default()),
        }
    }

    pub fn stack(&self) -> HostStack {
        HostStack {
            l2cap: self.classic.clone(),
            security: self.classic.clone(),
            sdp: self.classic.clone(),
            gatt: self.gatt.clone(),
            paired: self.paired.clone(),
            uhid: self.uhid.clone(),
        }
    }

    /// Route the peer's classic responses into the host's event queue.
    pub fn attach(&self, poster: Arc<dyn EventPoster>) {
        self.classic.attach(poster);
    }
}

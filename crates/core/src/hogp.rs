//! BLE HID-over-GATT session.
//!
//! GATT discovery and report I/O run on the session's [`WorkQueue`] as
//! blocking [`GattWait`] calls; connection state changes and input
//! notifications are posted back to the dispatcher.

use crate::dispatch::EventPoster;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, GattEvent};
use crate::gatt_wait::{GattOp, GattOutcome, GattWait};
use crate::pdu::handshake;
use crate::session::HidSession;
use crate::stack::{AppId, GattCallbacks, GattClient, GattService, GattStatus, UhidSink};
use crate::types::{
    DeviceAddress, HidInfo, OutboundReport, PnpInfo, ReportRequest, ReportType,
};
use crate::work_queue::WorkQueue;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// 16-bit GATT UUIDs used by HOGP.
pub mod uuids {
    pub const DEVICE_INFORMATION_SERVICE: u16 = 0x180A;
    pub const HID_SERVICE: u16 = 0x1812;
    pub const BATTERY_SERVICE: u16 = 0x180F;

    pub const PNP_ID: u16 = 0x2A50;
    pub const HID_INFORMATION: u16 = 0x2A4A;
    pub const REPORT_MAP: u16 = 0x2A4B;
    pub const REPORT: u16 = 0x2A4D;
    pub const BATTERY_LEVEL: u16 = 0x2A19;

    pub const REPORT_REFERENCE: u16 = 0x2908;
    pub const CLIENT_CHARACTERISTIC_CONFIG: u16 = 0x2902;
}

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];

/// Session progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HogpState {
    Unused,
    Connecting,
    Discovering,
    Connected,
    Disconnecting,
}

/// One HID Report characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub report_id: u8,
    pub report_type: ReportType,
    pub handle: u16,
    pub ccc_handle: Option<u16>,
}

/// Everything learned during discovery. Replaced wholesale when a
/// discovery succeeds.
#[derive(Debug, Clone, Default)]
struct Discovered {
    pnp: PnpInfo,
    hid: HidInfo,
    /// Keyed by characteristic value handle.
    reports: BTreeMap<u16, ReportEntry>,
    battery_level: Option<u8>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HogpShared {
    address: DeviceAddress,
    gatt: Arc<dyn GattClient>,
    poster: Arc<dyn EventPoster>,
    sink: Arc<dyn UhidSink>,
    app: AppId,
    state: Mutex<HogpState>,
    discovered: Mutex<Discovered>,
    wait: GattWait,
}

/// Callback adapter registered with the GATT client.
struct HogpCallbacks(Weak<HogpShared>);

impl HogpCallbacks {
    fn complete(&self, op: GattOp, status: GattStatus, value: Vec<u8>) {
        if let Some(shared) = self.0.upgrade() {
            shared.wait.complete(op, GattOutcome { status, value });
        }
    }
}

impl GattCallbacks for HogpCallbacks {
    fn on_connection_state_changed(&self, connected: bool, status: GattStatus) {
        if let Some(shared) = self.0.upgrade() {
            shared.post(EventKind::Gatt(GattEvent::ConnectionStateChanged { connected, status }));
        }
    }

    fn on_services_discovered(&self, status: GattStatus) {
        self.complete(GattOp::DiscoverServices, status, Vec::new());
    }

    fn on_characteristic_read(&self, handle: u16, status: GattStatus, value: Vec<u8>) {
        self.complete(GattOp::ReadCharacteristic(handle), status, value);
    }

    fn on_characteristic_write(&self, handle: u16, status: GattStatus) {
        self.complete(GattOp::WriteCharacteristic(handle), status, Vec::new());
    }

    fn on_descriptor_read(&self, handle: u16, status: GattStatus, value: Vec<u8>) {
        self.complete(GattOp::ReadDescriptor(handle), status, value);
    }

    fn on_descriptor_write(&self, handle: u16, status: GattStatus) {
        self.complete(GattOp::WriteDescriptor(handle), status, Vec::new());
    }

    fn on_characteristic_changed(&self, handle: u16, value: Vec<u8>) {
        if let Some(shared) = self.0.upgrade() {
            shared.post(EventKind::Gatt(GattEvent::Notification { handle, value }));
        }
    }
}

impl HogpShared {
    fn post(&self, kind: EventKind) {
        self.poster.post(Event::new(self.address.clone(), kind));
    }

    fn state(&self) -> HogpState {
        *lock(&self.state)
    }

    fn set_state(&self, state: HogpState) {
        *lock(&self.state) = state;
    }

    fn read_characteristic(&self, handle: u16) -> Result<Vec<u8>> {
        self.wait.call(GattOp::ReadCharacteristic(handle), || {
            self.gatt.read_characteristic(self.app, handle)
        })
    }

    fn write_characteristic(&self, handle: u16, value: &[u8]) -> Result<()> {
        self.wait
            .call(GattOp::WriteCharacteristic(handle), || {
                self.gatt.write_characteristic(self.app, handle, value)
            })
            .map(drop)
    }

    fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        self.wait.call(GattOp::ReadDescriptor(handle), || {
            self.gatt.read_descriptor(self.app, handle)
        })
    }

    fn write_descriptor(&self, handle: u16, value: &[u8]) -> Result<()> {
        self.wait
            .call(GattOp::WriteDescriptor(handle), || {
                self.gatt.write_descriptor(self.app, handle, value)
            })
            .map(drop)
    }

    /// Discovery job body: runs on the work queue.
    fn run_discovery(&self) {
        match self.discover() {
            Ok(found) => {
                let mut state = lock(&self.state);
                if *state != HogpState::Discovering {
                    debug!(address = %self.address, state = ?*state, "discovery finished after teardown started");
                    return;
                }
                *lock(&self.discovered) = found;
                *state = HogpState::Connected;
                drop(state);
                info!(address = %self.address, "HOGP discovery complete");
                self.post(EventKind::OpenComplete);
            }
            Err(e) => {
                error!(address = %self.address, error = %e, class = ?e.class(), "HOGP discovery failed");
                self.set_state(HogpState::Disconnecting);
                if let Err(e) = self.gatt.disconnect(self.app) {
                    warn!(address = %self.address, error = %e, "GATT disconnect failed");
                    self.set_state(HogpState::Unused);
                    self.post(EventKind::CloseComplete);
                }
            }
        }
    }

    fn discover(&self) -> Result<Discovered> {
        self.wait
            .call(GattOp::DiscoverServices, || self.gatt.discover_services(self.app))?;
        let services = self.gatt.services(self.app);
        let find = |uuid: u16| services.iter().find(|s| s.uuid == uuid);

        let mut found = Discovered::default();

        match find(uuids::DEVICE_INFORMATION_SERVICE) {
            Some(dis) => found.pnp = self.read_pnp(dis)?,
            None => warn!(address = %self.address, "no Device Information service"),
        }

        if let Some(bas) = find(uuids::BATTERY_SERVICE) {
            match self.read_battery(bas) {
                Ok(level) => found.battery_level = Some(level),
                Err(e) => warn!(address = %self.address, error = %e, "battery level unavailable"),
            }
        }

        let hid = find(uuids::HID_SERVICE).ok_or(Error::Missing("HID service"))?;
        self.read_hid_service(hid, &mut found)?;
        self.enable_notifications(&found.reports)?;

        debug!(
            address = %self.address,
            vendor = format_args!("0x{:04X}", found.pnp.vendor_id),
            product = format_args!("0x{:04X}", found.pnp.product_id),
            reports = found.reports.len(),
            battery = ?found.battery_level,
            "HOGP attributes discovered"
        );
        Ok(found)
    }

    fn read_pnp(&self, dis: &GattService) -> Result<PnpInfo> {
        let chr = dis
            .characteristic(uuids::PNP_ID)
            .ok_or(Error::Missing("PnP ID characteristic"))?;
        PnpInfo::from_pnp_id(&self.read_characteristic(chr.handle)?)
    }

    fn read_battery(&self, bas: &GattService) -> Result<u8> {
        let chr = bas
            .characteristic(uuids::BATTERY_LEVEL)
            .ok_or(Error::Missing("battery level characteristic"))?;
        let value = self.read_characteristic(chr.handle)?;
        value.first().copied().ok_or(Error::Malformed {
            what: "battery level",
            len: 0,
        })
    }

    fn read_hid_service(&self, hid: &GattService, found: &mut Discovered) -> Result<()> {
        let info = hid
            .characteristic(uuids::HID_INFORMATION)
            .ok_or(Error::Missing("HID Information characteristic"))?;
        found.hid = HidInfo::from_hid_information(&self.read_characteristic(info.handle)?)?;

        let map = hid
            .characteristic(uuids::REPORT_MAP)
            .ok_or(Error::Missing("Report Map characteristic"))?;
        found.hid.descriptor = self.read_characteristic(map.handle)?;

        for chr in hid.characteristics.iter().filter(|c| c.uuid == uuids::REPORT) {
            let reference = chr
                .descriptor(uuids::REPORT_REFERENCE)
                .ok_or(Error::Missing("Report Reference descriptor"))?;
            let value = self.read_descriptor(reference.handle)?;
            let &[report_id, raw_type] = value.as_slice() else {
                return Err(Error::Malformed {
                    what: "Report Reference",
                    len: value.len(),
                });
            };
            let report_type = ReportType::from_u8(raw_type).ok_or(Error::Malformed {
                what: "Report Reference type",
                len: value.len(),
            })?;
            let entry = ReportEntry {
                report_id,
                report_type,
                handle: chr.handle,
                ccc_handle: chr
                    .descriptor(uuids::CLIENT_CHARACTERISTIC_CONFIG)
                    .map(|d| d.handle),
            };
            trace!(address = %self.address, handle = format_args!("0x{:04X}", chr.handle), ?entry, "report characteristic");
            found.reports.insert(chr.handle, entry);
        }
        Ok(())
    }

    fn enable_notifications(&self, reports: &BTreeMap<u16, ReportEntry>) -> Result<()> {
        for entry in reports.values().filter(|r| r.report_type == ReportType::Input) {
            let Some(ccc) = entry.ccc_handle else {
                warn!(
                    address = %self.address,
                    report_id = entry.report_id,
                    "input report without CCCD, notifications unavailable"
                );
                continue;
            };
            self.write_descriptor(ccc, &ENABLE_NOTIFICATION)?;
        }
        Ok(())
    }

    fn find_report(&self, report_type: ReportType, report_id: u8) -> Option<ReportEntry> {
        lock(&self.discovered)
            .reports
            .values()
            .find(|r| r.report_type == report_type && r.report_id == report_id)
            .cloned()
    }

    /// Report job body: runs on the work queue.
    fn run_send_report(&self, report: &OutboundReport) {
        if let Err(e) = self.send_report(report) {
            warn!(address = %self.address, error = %e, request = ?report.request, "report I/O failed");
            let code = match e {
                Error::ReportNotFound { .. } => handshake::ERR_INVALID_REPORT_ID,
                _ => handshake::ERR_UNKNOWN,
            };
            self.sink.send_handshake(code);
        }
    }

    fn send_report(&self, report: &OutboundReport) -> Result<()> {
        let entry = self
            .find_report(report.report_type, report.report_id)
            .ok_or(Error::ReportNotFound {
                report_type: report.report_type.as_u8(),
                report_id: report.report_id,
            })?;
        match report.request {
            ReportRequest::GetReport => {
                let value = self.read_characteristic(entry.handle)?;
                let mut data = Vec::with_capacity(value.len() + 1);
                if entry.report_id != 0 {
                    data.push(entry.report_id);
                }
                data.extend_from_slice(&value);
                self.sink.send_control_data(&data);
            }
            ReportRequest::SetReport => {
                let payload = report_payload(report)?;
                self.write_characteristic(entry.handle, payload)?;
                self.sink.send_handshake(handshake::SUCCESSFUL);
            }
            ReportRequest::Data => {
                let payload = report_payload(report)?;
                self.write_characteristic(entry.handle, payload)?;
            }
        }
        Ok(())
    }

    fn forward_input(&self, handle: u16, value: &[u8]) {
        let entry = lock(&self.discovered).reports.get(&handle).cloned();
        let Some(entry) = entry else {
            debug!(address = %self.address, handle = format_args!("0x{handle:04X}"), "notification for unknown handle");
            return;
        };
        if entry.report_type != ReportType::Input {
            debug!(address = %self.address, handle = format_args!("0x{handle:04X}"), "notification on non-input report");
            return;
        }
        let mut data = Vec::with_capacity(value.len() + 1);
        if entry.report_id != 0 {
            data.push(entry.report_id);
        }
        data.extend_from_slice(value);
        self.sink.send_data(&data);
    }
}

/// Strip the leading report id; an id-only buffer carries nothing to write.
fn report_payload(report: &OutboundReport) -> Result<&[u8]> {
    if report.data.len() <= 1 {
        return Err(Error::Malformed {
            what: "report buffer",
            len: report.data.len(),
        });
    }
    Ok(&report.data[1..])
}

/// One device's HOGP session.
pub struct BleSession {
    shared: Arc<HogpShared>,
    queue: WorkQueue,
}

impl BleSession {
    pub fn new(
        address: DeviceAddress,
        gatt: Arc<dyn GattClient>,
        poster: Arc<dyn EventPoster>,
        sink: Arc<dyn UhidSink>,
        gatt_timeout: Duration,
    ) -> Result<Self> {
        let mut registration = Ok(AppId::default());
        let shared = Arc::new_cyclic(|weak: &Weak<HogpShared>| {
            let callbacks = Arc::new(HogpCallbacks(weak.clone()));
            registration = gatt.register_application(&address, callbacks);
            HogpShared {
                address: address.clone(),
                app: registration.as_ref().copied().unwrap_or_default(),
                gatt,
                poster,
                sink,
                state: Mutex::new(HogpState::Unused),
                discovered: Mutex::new(Discovered::default()),
                wait: GattWait::new(gatt_timeout),
            }
        });
        let app = registration?;
        debug!(%address, app, "GATT application registered");
        Ok(Self {
            shared,
            queue: WorkQueue::new(format!("hogp-{address}")),
        })
    }

    pub fn state(&self) -> HogpState {
        self.shared.state()
    }

    pub fn battery_level(&self) -> Option<u8> {
        lock(&self.shared.discovered).battery_level
    }

    pub fn reports(&self) -> Vec<ReportEntry> {
        lock(&self.shared.discovered).reports.values().cloned().collect()
    }

    /// True when no queued GATT work is pending or running.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    fn on_connection_state(&mut self, connected: bool, status: GattStatus) {
        if connected && status == 0 {
            if self.state() != HogpState::Connecting {
                debug!(address = %self.shared.address, state = ?self.state(), "unsolicited GATT connection");
                return;
            }
            self.shared.set_state(HogpState::Discovering);
            let shared = Arc::clone(&self.shared);
            self.queue.submit(move || shared.run_discovery());
            return;
        }
        if status != 0 {
            warn!(address = %self.shared.address, status, "GATT connection failed");
        }
        self.shared.set_state(HogpState::Unused);
        *lock(&self.shared.discovered) = Discovered::default();
        self.shared.post(EventKind::CloseComplete);
    }
}

impl HidSession for BleSession {
    fn connect(&mut self) -> Result<()> {
        if self.state() == HogpState::Connected {
            self.shared.post(EventKind::OpenComplete);
            return Ok(());
        }
        self.shared.set_state(HogpState::Connecting);
        if let Err(e) = self.shared.gatt.connect(self.shared.app) {
            self.shared.set_state(HogpState::Unused);
            return Err(e);
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.state() == HogpState::Unused {
            self.shared.post(EventKind::CloseComplete);
            return Ok(());
        }
        self.shared.set_state(HogpState::Disconnecting);
        if let Err(e) = self.shared.gatt.disconnect(self.shared.app) {
            self.shared.set_state(HogpState::Unused);
            *lock(&self.shared.discovered) = Discovered::default();
            return Err(e);
        }
        Ok(())
    }

    fn send_report(&mut self, report: OutboundReport) -> Result<()> {
        if self.state() != HogpState::Connected {
            return Err(Error::NotConnected(self.shared.address.to_string()));
        }
        let shared = Arc::clone(&self.shared);
        self.queue.submit(move || shared.run_send_report(&report));
        Ok(())
    }

    fn process_event(&mut self, kind: &EventKind) -> bool {
        match kind {
            EventKind::Gatt(GattEvent::ConnectionStateChanged { connected, status }) => {
                self.on_connection_state(*connected, *status)
            }
            EventKind::Gatt(GattEvent::Notification { handle, value }) => {
                self.shared.forward_input(*handle, value)
            }
            _ => return false,
        }
        true
    }

    fn hid_metadata(&self) -> Option<(PnpInfo, HidInfo)> {
        if self.state() != HogpState::Connected {
            return None;
        }
        let found = lock(&self.shared.discovered);
        Some((found.pnp, found.hid.clone()))
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        self.shared.gatt.deregister_application(self.shared.app);
    }
}

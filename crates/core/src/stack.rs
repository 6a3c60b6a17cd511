//! Contracts for the lower-layer collaborators the HID host drives.
//!
//! Requests are fire-and-forget: a synchronous `Err` means the primitive
//! refused the request outright. Results arrive later, either as posted
//! [`Event`](crate::event::Event)s (L2CAP, security, SDP) or through
//! [`GattCallbacks`] on the GATT client's own thread.

use crate::error::Result;
use crate::types::{DeviceAddress, HidInfo, PnpInfo};
use std::sync::Arc;

/// HID control channel PSM.
pub const PSM_HID_CONTROL: u16 = 0x0011;
/// HID interrupt channel PSM.
pub const PSM_HID_INTERRUPT: u16 = 0x0013;

/// L2CAP connection response results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConnectResult {
    Success = 0,
    Pending = 1,
    PsmNotSupported = 2,
    SecurityBlock = 3,
    NoResources = 4,
}

impl ConnectResult {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::Pending,
            2 => Self::PsmNotSupported,
            3 => Self::SecurityBlock,
            _ => Self::NoResources,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// L2CAP configuration response results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConfigResult {
    Success = 0,
    UnacceptableParameters = 1,
    Rejected = 2,
    UnknownOptions = 3,
}

impl ConfigResult {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::UnacceptableParameters,
            3 => Self::UnknownOptions,
            _ => Self::Rejected,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// L2CAP retransmission and flow control mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum L2capMode {
    #[default]
    Basic,
    Retransmission,
    FlowControl,
    EnhancedRetransmission,
    Streaming,
}

/// Options carried by a configuration request/response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2capConfig {
    pub mtu: u16,
    pub flush_timeout: u16,
    pub mode: L2capMode,
}

/// L2CAP channel primitives.
pub trait L2cap: Send + Sync {
    /// Open an outgoing channel; returns the local channel id.
    fn connect_req(&self, address: &DeviceAddress, psm: u16) -> Result<u16>;
    fn connect_rsp(&self, lcid: u16, id: u8, result: ConnectResult) -> Result<()>;
    fn config_req(&self, lcid: u16, config: &L2capConfig) -> Result<()>;
    fn config_rsp(&self, lcid: u16, id: u8, config: &L2capConfig, result: ConfigResult)
        -> Result<()>;
    fn disconnect_req(&self, lcid: u16) -> Result<()>;
    fn disconnect_rsp(&self, lcid: u16, id: u8) -> Result<()>;
    fn send_data(&self, lcid: u16, data: &[u8]) -> Result<()>;
}

/// Direction of a GAP security request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityDirection {
    Incoming,
    Outgoing,
}

/// GAP security negotiation. The result is posted as
/// [`EventKind::Security`](crate::event::EventKind::Security).
pub trait Security: Send + Sync {
    fn request_security(
        &self,
        address: &DeviceAddress,
        direction: SecurityDirection,
        psm: u16,
    ) -> Result<()>;
}

/// Classic SDP client. The result is posted as
/// [`EventKind::SdpComplete`](crate::event::EventKind::SdpComplete).
pub trait SdpClient: Send + Sync {
    fn discover(&self, address: &DeviceAddress) -> Result<()>;
}

/// Paired-device registry kept by the adapters.
pub trait PairedDevices: Send + Sync {
    fn is_classic_paired(&self, address: &DeviceAddress) -> bool;
    fn is_ble_paired(&self, address: &DeviceAddress) -> bool;
    fn device_name(&self, address: &DeviceAddress) -> Option<String>;
}

/// GATT client application handle.
pub type AppId = u32;

/// A discovered GATT descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    pub uuid: u16,
    pub handle: u16,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: u16,
    pub handle: u16,
    pub properties: u8,
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    pub fn descriptor(&self, uuid: u16) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

/// A discovered GATT primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: u16,
    pub handle: u16,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: u16) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Status code reported by GATT callbacks. Zero is success.
pub type GattStatus = u16;

/// GATT completion callbacks, invoked on the GATT client's thread.
pub trait GattCallbacks: Send + Sync {
    fn on_connection_state_changed(&self, connected: bool, status: GattStatus);
    fn on_services_discovered(&self, status: GattStatus);
    fn on_characteristic_read(&self, handle: u16, status: GattStatus, value: Vec<u8>);
    fn on_characteristic_write(&self, handle: u16, status: GattStatus);
    fn on_descriptor_read(&self, handle: u16, status: GattStatus, value: Vec<u8>);
    fn on_descriptor_write(&self, handle: u16, status: GattStatus);
    fn on_characteristic_changed(&self, handle: u16, value: Vec<u8>);
}

/// GATT client primitives.
pub trait GattClient: Send + Sync {
    fn register_application(
        &self,
        address: &DeviceAddress,
        callbacks: Arc<dyn GattCallbacks>,
    ) -> Result<AppId>;
    fn deregister_application(&self, app: AppId);
    fn connect(&self, app: AppId) -> Result<()>;
    fn disconnect(&self, app: AppId) -> Result<()>;
    fn discover_services(&self, app: AppId) -> Result<()>;
    /// Services found by the last completed discovery.
    fn services(&self, app: AppId) -> Vec<GattService>;
    fn read_characteristic(&self, app: AppId, handle: u16) -> Result<()>;
    fn write_characteristic(&self, app: AppId, handle: u16, value: &[u8]) -> Result<()>;
    fn read_descriptor(&self, app: AppId, handle: u16) -> Result<()>;
    fn write_descriptor(&self, app: AppId, handle: u16, value: &[u8]) -> Result<()>;
}

/// Virtual HID device sink for one remote device.
pub trait UhidSink: Send + Sync {
    fn open(&self);
    fn close(&self);
    fn destroy(&self);
    fn send_data(&self, data: &[u8]);
    fn send_control_data(&self, data: &[u8]);
    fn send_handshake(&self, code: u8);
    fn send_hid_info(&self, name: &str, pnp: &PnpInfo, hid: &HidInfo);
}

/// Creates the uhid sink for a device when its state machine is built.
pub trait UhidFactory: Send + Sync {
    fn create(&self, address: &DeviceAddress) -> Arc<dyn UhidSink>;
}

/// Every collaborator a state machine needs, shared by all devices.
#[derive(Clone)]
pub struct HostStack {
    pub l2cap: Arc<dyn L2cap>,
    pub security: Arc<dyn Security>,
    pub sdp: Arc<dyn SdpClient>,
    pub gatt: Arc<dyn GattClient>,
    pub paired: Arc<dyn PairedDevices>,
    pub uhid: Arc<dyn UhidFactory>,
}

//! Events routed through the shared queue to a device's state machine.

use crate::stack::{ConfigResult, ConnectResult, GattStatus, L2capConfig, SecurityDirection};
use crate::types::{DeviceAddress, OutboundReport, SdpRecord};

/// One unit of work for one device. Immutable once posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub address: DeviceAddress,
    pub kind: EventKind,
}

impl Event {
    pub fn new(address: DeviceAddress, kind: EventKind) -> Self {
        Self { address, kind }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// What happened, with the payload that kind carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// API: bring the device up.
    Open,
    /// API: tear the device down.
    Close,
    /// API: send a report to the device.
    SendReport(OutboundReport),
    /// Transport finished bringing the session up.
    OpenComplete,
    /// Transport finished tearing the session down (or failed to bring it up).
    CloseComplete,
    ConnectTimeout,
    DisconnectTimeout,
    /// Classic SDP discovery finished; `None` on failure.
    SdpComplete(Option<SdpRecord>),
    /// GAP security result.
    Security {
        direction: SecurityDirection,
        status: u16,
    },
    L2cap(L2capEvent),
    Gatt(GattEvent),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::SendReport(_) => "send-report",
            Self::OpenComplete => "open-complete",
            Self::CloseComplete => "close-complete",
            Self::ConnectTimeout => "connect-timeout",
            Self::DisconnectTimeout => "disconnect-timeout",
            Self::SdpComplete(_) => "sdp-complete",
            Self::Security { .. } => "security-result",
            Self::L2cap(ev) => ev.name(),
            Self::Gatt(ev) => ev.name(),
        }
    }

    /// API requests that must wait while the device is in a transient state.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, Self::Open | Self::Close)
    }
}

/// L2CAP indications and confirmations for a device's channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capEvent {
    ConnectIndication { lcid: u16, id: u8, psm: u16 },
    ConnectResponse { lcid: u16, result: ConnectResult },
    ConfigRequest { lcid: u16, id: u8, config: L2capConfig },
    ConfigResponse { lcid: u16, result: ConfigResult },
    DisconnectRequest { lcid: u16, id: u8 },
    DisconnectResponse { lcid: u16 },
    DisconnectAbnormal { lcid: u16, reason: u8 },
    Data { lcid: u16, payload: Vec<u8> },
    RemoteBusy { lcid: u16, busy: bool },
}

impl L2capEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectIndication { .. } => "l2cap-connect-ind",
            Self::ConnectResponse { .. } => "l2cap-connect-rsp",
            Self::ConfigRequest { .. } => "l2cap-config-req",
            Self::ConfigResponse { .. } => "l2cap-config-rsp",
            Self::DisconnectRequest { .. } => "l2cap-disconnect-req",
            Self::DisconnectResponse { .. } => "l2cap-disconnect-rsp",
            Self::DisconnectAbnormal { .. } => "l2cap-disconnect-abnormal",
            Self::Data { .. } => "l2cap-data",
            Self::RemoteBusy { .. } => "l2cap-remote-busy",
        }
    }
}

/// GATT events that must be serialized with the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged { connected: bool, status: GattStatus },
    Notification { handle: u16, value: Vec<u8> },
}

impl GattEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "gatt-connection-state",
            Self::Notification { .. } => "gatt-notification",
        }
    }
}

//! Shared value types: device identity, connection states and HID metadata.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bluetooth device address in `AA:BB:CC:DD:EE:FF` form (upper-case hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let octets: Vec<&str> = s.split(':').collect();
        let well_formed = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !well_formed {
            return Err(Error::Malformed {
                what: "device address",
                len: s.len(),
            });
        }
        Ok(Self(s.to_ascii_uppercase()))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which Bluetooth transport a paired device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Unknown,
    Classic,
    Ble,
}

/// Externally visible connection state.
///
/// The discriminants are the codes reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Connecting or connected: counts against the connection cap.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Device identification from the Device Information service or SDP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnpInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u16,
}

/// Length of the GATT PnP ID characteristic value.
pub const PNP_ID_LEN: usize = 7;

impl PnpInfo {
    /// Parse the 7-byte PnP ID layout: source, vendor, product, version (LE).
    pub fn from_pnp_id(value: &[u8]) -> Result<Self> {
        if value.len() < PNP_ID_LEN {
            return Err(Error::Malformed {
                what: "PnP ID",
                len: value.len(),
            });
        }
        Ok(Self {
            vendor_id: u16::from_le_bytes([value[1], value[2]]),
            product_id: u16::from_le_bytes([value[3], value[4]]),
            version: u16::from_le_bytes([value[5], value[6]]),
        })
    }
}

/// HID metadata handed to the uhid sink when a session opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HidInfo {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub flags: u8,
    /// Raw report descriptor (Report Map / SDP descriptor list).
    pub descriptor: Vec<u8>,
}

/// Length of the GATT HID Information characteristic value.
pub const HID_INFORMATION_LEN: usize = 4;

impl HidInfo {
    /// Parse the 4-byte HID Information layout. The descriptor is filled later.
    pub fn from_hid_information(value: &[u8]) -> Result<Self> {
        if value.len() < HID_INFORMATION_LEN {
            return Err(Error::Malformed {
                what: "HID information",
                len: value.len(),
            });
        }
        Ok(Self {
            bcd_hid: u16::from_le_bytes([value[0], value[1]]),
            country_code: value[2],
            flags: value[3],
            descriptor: Vec::new(),
        })
    }
}

/// Result of classic SDP discovery for a HID device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpRecord {
    pub pnp: PnpInfo,
    pub hid: HidInfo,
}

/// HID report type, as used by both the PDU param nibble and the GATT
/// Report Reference descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

impl ReportType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Input),
            2 => Some(Self::Output),
            3 => Some(Self::Feature),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Kind of outbound report operation requested by the uhid side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRequest {
    GetReport,
    SetReport,
    /// Output report pushed without a reply.
    Data,
}

/// An outbound report request. For `SetReport` and `Data`, `data[0]` is the
/// report id and the payload follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReport {
    pub request: ReportRequest,
    pub report_type: ReportType,
    pub report_id: u8,
    /// Requested buffer size for `GetReport` (0 = not specified).
    pub buffer_size: u16,
    pub data: Vec<u8>,
}

impl OutboundReport {
    pub fn get(report_type: ReportType, report_id: u8) -> Self {
        Self {
            request: ReportRequest::GetReport,
            report_type,
            report_id,
            buffer_size: 0,
            data: Vec::new(),
        }
    }

    pub fn set(report_type: ReportType, data: Vec<u8>) -> Self {
        Self {
            request: ReportRequest::SetReport,
            report_type,
            report_id: data.first().copied().unwrap_or(0),
            buffer_size: 0,
            data,
        }
    }

    pub fn output(data: Vec<u8>) -> Self {
        Self {
            request: ReportRequest::Data,
            report_type: ReportType::Output,
            report_id: data.first().copied().unwrap_or(0),
            buffer_size: 0,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parses_and_normalizes() {
        let addr: DeviceAddress = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:00:11:22");
        assert_eq!(addr.to_string(), "AA:BB:CC:00:11:22");
    }

    #[test]
    fn address_rejects_bad_forms() {
        assert!("AA:BB:CC:00:11".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:00:11:ZZ".parse::<DeviceAddress>().is_err());
        assert!("AABBCC001122".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn connection_state_codes() {
        assert_eq!(ConnectionState::Connecting.code(), 0);
        assert_eq!(ConnectionState::Connected.code(), 1);
        assert_eq!(ConnectionState::Disconnecting.code(), 2);
        assert_eq!(ConnectionState::Disconnected.code(), 3);
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Disconnecting.is_active());
    }

    #[test]
    fn pnp_id_layout() {
        let value = [0x02, 0x6D, 0x04, 0x8D, 0xC0, 0x10, 0x01];
        let pnp = PnpInfo::from_pnp_id(&value).unwrap();
        assert_eq!(pnp.vendor_id, 0x046D);
        assert_eq!(pnp.product_id, 0xC08D);
        assert_eq!(pnp.version, 0x0110);
    }

    #[test]
    fn pnp_id_too_short() {
        assert!(PnpInfo::from_pnp_id(&[0x02, 0x6D, 0x04]).is_err());
    }

    #[test]
    fn hid_information_layout() {
        let info = HidInfo::from_hid_information(&[0x11, 0x01, 0x21, 0x02]).unwrap();
        assert_eq!(info.bcd_hid, 0x0111);
        assert_eq!(info.country_code, 0x21);
        assert_eq!(info.flags, 0x02);
        assert!(info.descriptor.is_empty());
    }

    #[test]
    fn set_report_takes_id_from_first_byte() {
        let report = OutboundReport::set(ReportType::Feature, vec![0x05, 0x01]);
        assert_eq!(report.report_id, 0x05);
        assert_eq!(report.request, ReportRequest::SetReport);
    }
}

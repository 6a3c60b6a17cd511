//! HID transaction PDUs carried over the classic L2CAP channels.
//!
//! Every PDU starts with one header byte: transaction type in the upper
//! nibble, a type-specific parameter in the lower nibble. The body that
//! follows depends on the type:
//! - GET_REPORT: optional report id, then an optional LE16 buffer size
//!   (present when param bit 3 is set)
//! - SET_REPORT / DATA: the report bytes, starting with the report id when
//!   the device uses ids
//! - HANDSHAKE / HID_CONTROL: no body

use crate::error::{Error, Result};
use crate::types::{OutboundReport, ReportRequest, ReportType};

/// HID transaction types (upper header nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionType {
    Handshake = 0x0,
    HidControl = 0x1,
    GetReport = 0x4,
    SetReport = 0x5,
    GetProtocol = 0x6,
    SetProtocol = 0x7,
    Data = 0xA,
}

impl TransactionType {
    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Handshake),
            0x1 => Some(Self::HidControl),
            0x4 => Some(Self::GetReport),
            0x5 => Some(Self::SetReport),
            0x6 => Some(Self::GetProtocol),
            0x7 => Some(Self::SetProtocol),
            0xA => Some(Self::Data),
            _ => None,
        }
    }
}

/// HANDSHAKE result codes (param nibble), also forwarded to the uhid sink.
pub mod handshake {
    pub const SUCCESSFUL: u8 = 0x0;
    pub const NOT_READY: u8 = 0x1;
    pub const ERR_INVALID_REPORT_ID: u8 = 0x2;
    pub const ERR_UNSUPPORTED_REQUEST: u8 = 0x3;
    pub const ERR_INVALID_PARAMETER: u8 = 0x4;
    pub const ERR_UNKNOWN: u8 = 0xE;
    pub const ERR_FATAL: u8 = 0xF;
}

/// HID_CONTROL operations (param nibble).
pub mod control {
    pub const SUSPEND: u8 = 0x3;
    pub const EXIT_SUSPEND: u8 = 0x4;
    pub const VIRTUAL_CABLE_UNPLUG: u8 = 0x5;
}

/// GET_REPORT param flag: a 16-bit buffer size follows the report id.
pub const GET_REPORT_SIZE_FLAG: u8 = 0x08;

/// Header byte split into its two nibbles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub kind: TransactionType,
    pub param: u8,
}

impl PduHeader {
    /// Build a header, rejecting params that do not fit in four bits.
    pub fn new(kind: TransactionType, param: u8) -> Result<Self> {
        if param > 0x0F {
            return Err(Error::Pdu(format!("param 0x{param:02X} exceeds 4 bits")));
        }
        Ok(Self { kind, param })
    }

    pub fn to_byte(self) -> u8 {
        ((self.kind as u8) << 4) | self.param
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        let kind = TransactionType::from_nibble(byte >> 4)
            .ok_or_else(|| Error::Pdu(format!("unknown transaction type 0x{:X}", byte >> 4)))?;
        Ok(Self {
            kind,
            param: byte & 0x0F,
        })
    }
}

/// A decoded HID PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidPdu {
    pub header: PduHeader,
    pub body: Vec<u8>,
}

impl HidPdu {
    pub fn new(header: PduHeader, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.body.len());
        buf.push(self.header.to_byte());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&first, rest) = frame
            .split_first()
            .ok_or_else(|| Error::Pdu("empty frame".into()))?;
        Ok(Self {
            header: PduHeader::from_byte(first)?,
            body: rest.to_vec(),
        })
    }

    /// Report type encoded in the low two param bits of report transactions.
    pub fn report_type(&self) -> Option<ReportType> {
        ReportType::from_u8(self.header.param & 0x03)
    }

    /// Split the body of a report-carrying PDU into `(report_id, payload)`.
    pub fn split_report_id(&self) -> Option<(u8, &[u8])> {
        self.body.split_first().map(|(id, rest)| (*id, rest))
    }
}

/// Build the PDU for an outbound report request.
pub fn encode_report(report: &OutboundReport) -> Result<Vec<u8>> {
    let report_type = report.report_type.as_u8();
    let pdu = match report.request {
        ReportRequest::GetReport => {
            let mut param = report_type;
            let mut body = Vec::with_capacity(3);
            if report.report_id != 0 {
                body.push(report.report_id);
            }
            if report.buffer_size != 0 {
                param |= GET_REPORT_SIZE_FLAG;
                body.extend_from_slice(&report.buffer_size.to_le_bytes());
            }
            HidPdu::new(PduHeader::new(TransactionType::GetReport, param)?, body)
        }
        ReportRequest::SetReport => HidPdu::new(
            PduHeader::new(TransactionType::SetReport, report_type)?,
            report.data.clone(),
        ),
        ReportRequest::Data => HidPdu::new(
            PduHeader::new(TransactionType::Data, report_type)?,
            report.data.clone(),
        ),
    };
    Ok(pdu.encode())
}

/// Build a HID_CONTROL PDU.
pub fn encode_control(operation: u8) -> Result<Vec<u8>> {
    Ok(HidPdu::new(PduHeader::new(TransactionType::HidControl, operation)?, Vec::new()).encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_nibbles() {
        let header = PduHeader::new(TransactionType::SetReport, 0x02).unwrap();
        assert_eq!(header.to_byte(), 0x52);
        assert_eq!(PduHeader::from_byte(0xA1).unwrap().kind, TransactionType::Data);
        assert_eq!(PduHeader::from_byte(0xA1).unwrap().param, 0x01);
    }

    #[test]
    fn header_rejects_wide_param() {
        assert!(PduHeader::new(TransactionType::Handshake, 0x10).is_err());
    }

    #[test]
    fn decode_rejects_unknown_type_and_empty() {
        assert!(HidPdu::decode(&[0x20]).is_err());
        assert!(HidPdu::decode(&[]).is_err());
    }

    #[test]
    fn set_report_decodes_on_receiving_side() {
        let report = OutboundReport::set(ReportType::Output, vec![0x05, 0x01, 0x02, 0x03]);
        let frame = encode_report(&report).unwrap();
        assert_eq!(frame, vec![0x52, 0x05, 0x01, 0x02, 0x03]);

        let pdu = HidPdu::decode(&frame).unwrap();
        assert_eq!(pdu.header.kind, TransactionType::SetReport);
        assert_eq!(pdu.header.param, 0x02);
        assert_eq!(pdu.report_type(), Some(ReportType::Output));
        let (id, payload) = pdu.split_report_id().unwrap();
        assert_eq!(id, 0x05);
        assert_eq!(payload, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn get_report_with_id_and_size() {
        let mut report = OutboundReport::get(ReportType::Feature, 0x07);
        report.buffer_size = 0x0102;
        let frame = encode_report(&report).unwrap();
        assert_eq!(frame, vec![0x4B, 0x07, 0x02, 0x01]);
    }

    #[test]
    fn get_report_without_id_or_size_is_header_only() {
        let report = OutboundReport::get(ReportType::Input, 0);
        assert_eq!(encode_report(&report).unwrap(), vec![0x41]);
    }

    #[test]
    fn output_data_goes_as_data_transaction() {
        let report = OutboundReport::output(vec![0x01, 0x04]);
        assert_eq!(encode_report(&report).unwrap(), vec![0xA2, 0x01, 0x04]);
    }

    #[test]
    fn virtual_cable_unplug_control() {
        assert_eq!(encode_control(control::VIRTUAL_CABLE_UNPLUG).unwrap(), vec![0x15]);
    }
}

//! Transport-specific session behind a device state machine.
//!
//! The kind is resolved once when the machine is built; after that every
//! transport action goes through [`HidSession`] and never re-checks it.

use crate::classic::ClassicSession;
use crate::error::Result;
use crate::event::EventKind;
use crate::hogp::BleSession;
use crate::types::{HidInfo, OutboundReport, PnpInfo, TransportKind};

/// What a state machine needs from a transport.
pub trait HidSession: Send {
    /// Start bringing the session up. Completion is posted as
    /// `OpenComplete`, failure as `CloseComplete`.
    fn connect(&mut self) -> Result<()>;

    /// Start tearing the session down. Completion is posted as
    /// `CloseComplete`.
    fn disconnect(&mut self) -> Result<()>;

    fn send_report(&mut self, report: OutboundReport) -> Result<()>;

    /// Handle a transport event. Returns `false` if the kind is not one
    /// this transport consumes.
    fn process_event(&mut self, kind: &EventKind) -> bool;

    /// PnP and HID metadata for the uhid sink, once known.
    fn hid_metadata(&self) -> Option<(PnpInfo, HidInfo)>;
}

/// The session variant chosen for a device.
pub enum Session {
    Classic(ClassicSession),
    Ble(BleSession),
}

impl Session {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Classic(_) => TransportKind::Classic,
            Self::Ble(_) => TransportKind::Ble,
        }
    }

    pub fn as_dyn(&mut self) -> &mut dyn HidSession {
        match self {
            Self::Classic(s) => s,
            Self::Ble(s) => s,
        }
    }

    pub fn as_ref_dyn(&self) -> &dyn HidSession {
        match self {
            Self::Classic(s) => s,
            Self::Ble(s) => s,
        }
    }
}

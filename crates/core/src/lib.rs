//! hid-host-core: Bluetooth HID host connection management.
//!
//! Drives classic HID (control/interrupt L2CAP channels) and BLE HID over
//! GATT devices through one per-device state machine, relaying reports to
//! and from a virtual HID (uhid) sink. Lower layers are reached through the
//! traits in [`stack`]; [`sim`] provides a loopback implementation.

pub mod classic;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod gatt_wait;
pub mod hogp;
#[cfg(test)]
pub mod mock;
pub mod pdu;
pub mod service;
pub mod session;
pub mod sim;
pub mod stack;
pub mod state_machine;
pub mod types;
pub mod work_queue;

pub use config::HostConfig;
pub use error::{Error, ErrorClass, Result};
pub use service::{EventLoop, HidHostService};
pub use types::{ConnectionState, DeviceAddress, OutboundReport, ReportType, TransportKind};

//! Error types for hid-host-core.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A lower-layer primitive refused the request synchronously.
    #[error("transport error: {0}")]
    Transport(String),

    /// Link-layer security was not granted.
    #[error("security rejected: status {0}")]
    SecurityRejected(u16),

    /// The peer or the local stack refused an L2CAP connection.
    #[error("L2CAP connection refused: result {0}")]
    ConnectRefused(u16),

    /// L2CAP configuration was not accepted.
    #[error("L2CAP configuration rejected: result {0}")]
    ConfigRejected(u16),

    /// A GATT operation completed with a failure status.
    #[error("GATT operation failed: status {0}")]
    GattStatus(u16),

    /// A bounded wait elapsed without a result.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Data did not have the expected layout.
    #[error("malformed {what}: {len} bytes")]
    Malformed { what: &'static str, len: usize },

    /// A required service, characteristic or descriptor is absent.
    #[error("missing {0}")]
    Missing(&'static str),

    /// No report with the requested type and id exists.
    #[error("report not found: type {report_type}, id {report_id}")]
    ReportNotFound { report_type: u8, report_id: u8 },

    /// HID PDU could not be built or parsed.
    #[error("invalid PDU: {0}")]
    Pdu(String),

    /// The device has no active session.
    #[error("device not connected: {0}")]
    NotConnected(String),

    /// The device is neither a classic nor a BLE paired device.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The connection cap has been reached.
    #[error("too many connections (max {0})")]
    TooManyConnections(usize),

    /// Configuration could not be loaded or is out of range.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure is handled by the layer that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport refused or failed: abort the attempt, never retry here.
    Transient,
    /// A timer or bounded wait elapsed.
    Timeout,
    /// Protocol or resource inconsistency: log and abort the operation.
    Inconsistency,
    /// The caller addressed a device in the wrong state.
    Misuse,
}

impl ErrorClass {
    /// Classify an error for logging and propagation decisions.
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Transport(_)
            | Error::SecurityRejected(_)
            | Error::ConnectRefused(_)
            | Error::ConfigRejected(_)
            | Error::GattStatus(_) => Self::Transient,
            Error::Timeout(_) => Self::Timeout,
            Error::Malformed { .. }
            | Error::Missing(_)
            | Error::ReportNotFound { .. }
            | Error::Pdu(_)
            | Error::UnknownDevice(_)
            | Error::Config(_) => Self::Inconsistency,
            Error::NotConnected(_) | Error::TooManyConnections(_) => Self::Misuse,
        }
    }
}

impl Error {
    /// Shorthand for [`ErrorClass::classify`].
    pub fn class(&self) -> ErrorClass {
        ErrorClass::classify(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_transport_failures_as_transient() {
        assert_eq!(Error::SecurityRejected(5).class(), ErrorClass::Transient);
        assert_eq!(Error::ConfigRejected(1).class(), ErrorClass::Transient);
        assert_eq!(Error::GattStatus(0x0E).class(), ErrorClass::Transient);
    }

    #[test]
    fn classify_timeout() {
        let err = Error::Timeout("read 0x002A".into());
        assert_eq!(err.class(), ErrorClass::Timeout);
    }

    #[test]
    fn classify_inconsistency() {
        let err = Error::Malformed {
            what: "report reference",
            len: 3,
        };
        assert_eq!(err.class(), ErrorClass::Inconsistency);
        assert_eq!(Error::Missing("HID service").class(), ErrorClass::Inconsistency);
    }

    #[test]
    fn classify_misuse() {
        let err = Error::NotConnected("AA:BB:CC:DD:EE:FF".into());
        assert_eq!(err.class(), ErrorClass::Misuse);
    }

    #[test]
    fn display_includes_detail() {
        let err = Error::ReportNotFound {
            report_type: 2,
            report_id: 5,
        };
        assert_eq!(err.to_string(), "report not found: type 2, id 5");
    }
}

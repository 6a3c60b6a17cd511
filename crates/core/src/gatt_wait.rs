//! Turns asynchronous GATT completions into bounded blocking calls.
//!
//! Each BLE session owns one [`GattWait`]. `call` holds the operation lock
//! for the whole issue-and-wait sequence, so at most one wait is ever
//! outstanding per device. The pending-result slot records which operation
//! it expects; completions for anything else (including late completions of
//! an operation that already timed out) are discarded.

use crate::error::{Error, Result};
use crate::stack::GattStatus;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// A GATT operation whose completion a caller waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOp {
    DiscoverServices,
    ReadCharacteristic(u16),
    WriteCharacteristic(u16),
    ReadDescriptor(u16),
    WriteDescriptor(u16),
}

impl fmt::Display for GattOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::ReadCharacteristic(h) => write!(f, "characteristic read 0x{h:04X}"),
            Self::WriteCharacteristic(h) => write!(f, "characteristic write 0x{h:04X}"),
            Self::ReadDescriptor(h) => write!(f, "descriptor read 0x{h:04X}"),
            Self::WriteDescriptor(h) => write!(f, "descriptor write 0x{h:04X}"),
        }
    }
}

/// Completion delivered by a GATT callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattOutcome {
    pub status: GattStatus,
    pub value: Vec<u8>,
}

#[derive(Default)]
struct Slot {
    expected: Option<GattOp>,
    result: Option<GattOutcome>,
}

/// Single-slot, mutex-guarded pending result with a condition variable.
pub struct GattWait {
    op_lock: Mutex<()>,
    slot: Mutex<Slot>,
    ready: Condvar,
    timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GattWait {
    pub fn new(timeout: Duration) -> Self {
        Self {
            op_lock: Mutex::new(()),
            slot: Mutex::new(Slot::default()),
            ready: Condvar::new(),
            timeout,
        }
    }

    /// Issue `request` and block until its completion arrives or the
    /// timeout elapses. Returns the completion value on success status.
    ///
    /// `request` runs without the slot lock held, so a GATT client may
    /// complete synchronously from inside it.
    pub fn call<F>(&self, op: GattOp, request: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Result<()>,
    {
        let _op = lock(&self.op_lock);
        {
            let mut slot = lock(&self.slot);
            slot.expected = Some(op);
            slot.result = None;
        }

        if let Err(e) = request() {
            lock(&self.slot).expected = None;
            return Err(e);
        }

        let slot = lock(&self.slot);
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, self.timeout, |s| s.result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.expected = None;
        let outcome = slot.result.take();
        drop(slot);

        match outcome {
            None => {
                debug!(%op, timeout_ms = self.timeout.as_millis() as u64, "GATT wait timed out");
                Err(Error::Timeout(format!("{op} after {:?}", self.timeout)))
            }
            Some(GattOutcome { status, .. }) if status != 0 => Err(Error::GattStatus(status)),
            Some(GattOutcome { value, .. }) => Ok(value),
        }
    }

    /// Deliver a completion from the GATT thread. Returns `false` when no
    /// caller is waiting for `op`; the completion is then dropped.
    pub fn complete(&self, op: GattOp, outcome: GattOutcome) -> bool {
        let mut slot = lock(&self.slot);
        if slot.expected != Some(op) || slot.result.is_some() {
            trace!(%op, status = outcome.status, "discarding unexpected GATT completion");
            return false;
        }
        slot.result = Some(outcome);
        self.ready.notify_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn ok(value: &[u8]) -> GattOutcome {
        GattOutcome {
            status: 0,
            value: value.to_vec(),
        }
    }

    #[test]
    fn completion_from_other_thread_wakes_caller() {
        let wait = Arc::new(GattWait::new(Duration::from_secs(2)));
        let remote = Arc::clone(&wait);
        let value = wait
            .call(GattOp::ReadCharacteristic(0x10), move || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    remote.complete(GattOp::ReadCharacteristic(0x10), ok(&[1, 2]));
                });
                Ok(())
            })
            .unwrap();
        assert_eq!(value, vec![1, 2]);
    }

    #[test]
    fn synchronous_completion_inside_request() {
        let wait = GattWait::new(Duration::from_millis(100));
        let value = wait
            .call(GattOp::ReadDescriptor(0x21), || {
                assert!(wait.complete(GattOp::ReadDescriptor(0x21), ok(&[5, 1])));
                Ok(())
            })
            .unwrap();
        assert_eq!(value, vec![5, 1]);
    }

    #[test]
    fn missing_completion_times_out() {
        let wait = GattWait::new(Duration::from_millis(30));
        let start = Instant::now();
        let err = wait
            .call(GattOp::WriteCharacteristic(0x30), || Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn failure_status_is_reported() {
        let wait = GattWait::new(Duration::from_millis(100));
        let err = wait
            .call(GattOp::WriteDescriptor(0x22), || {
                wait.complete(
                    GattOp::WriteDescriptor(0x22),
                    GattOutcome {
                        status: 0x03,
                        value: Vec::new(),
                    },
                );
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::GattStatus(0x03)));
    }

    #[test]
    fn late_completion_does_not_leak_into_next_call() {
        let wait = GattWait::new(Duration::from_millis(20));
        assert!(wait.call(GattOp::ReadCharacteristic(0x10), || Ok(())).is_err());
        // The stale completion arrives after the caller gave up.
        assert!(!wait.complete(GattOp::ReadCharacteristic(0x10), ok(&[0xFF])));

        let value = wait
            .call(GattOp::ReadCharacteristic(0x11), || {
                assert!(!wait.complete(GattOp::ReadCharacteristic(0x10), ok(&[0xEE])));
                assert!(wait.complete(GattOp::ReadCharacteristic(0x11), ok(&[0x01])));
                Ok(())
            })
            .unwrap();
        assert_eq!(value, vec![0x01]);
    }

    #[test]
    fn request_error_clears_expectation() {
        let wait = GattWait::new(Duration::from_millis(50));
        let err = wait
            .call(GattOp::DiscoverServices, || {
                Err(Error::Transport("busy".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!wait.complete(GattOp::DiscoverServices, ok(&[])));
    }
}

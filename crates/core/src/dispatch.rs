//! Posting and timer contracts between state machines and the dispatcher.
//!
//! Everything that happens on a foreign thread (transport callbacks, timer
//! expiry) re-enters the state machine only by posting an [`Event`].

use crate::event::Event;
use crate::types::{ConnectionState, DeviceAddress};
use std::time::Duration;

/// Enqueue an event on the shared FIFO.
pub trait EventPoster: Send + Sync {
    fn post(&self, event: Event);
}

/// A scheduled single-shot timer.
pub trait TimerHandle: Send {
    /// Stop the timer. A timer that already fired is unaffected.
    fn cancel(&self);
}

/// Schedules events to be posted after a delay.
pub trait TimerScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, event: Event) -> Box<dyn TimerHandle>;
}

/// Receives edge-triggered connection state changes.
pub trait StateObserver: Send + Sync {
    fn on_connection_state_changed(&self, address: &DeviceAddress, state: ConnectionState);
}

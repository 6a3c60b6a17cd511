//! HID host service: public API, device registry and the event loop.
//!
//! Every event for every device goes through one unbounded FIFO and is
//! handled on the task running [`EventLoop::run`], so state machines are
//! only ever touched from that task.

use crate::config::HostConfig;
use crate::dispatch::{EventPoster, StateObserver, TimerHandle, TimerScheduler};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, L2capEvent};
use crate::stack::{HostStack, PSM_HID_CONTROL};
use crate::state_machine::{DeviceStateMachine, MachineContext};
use crate::types::{ConnectionState, DeviceAddress, OutboundReport};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

enum Command {
    Event(Event),
    Shutdown,
}

/// Posts onto the service queue from any thread.
#[derive(Clone)]
struct QueuePoster(mpsc::UnboundedSender<Command>);

impl EventPoster for QueuePoster {
    fn post(&self, event: Event) {
        if self.0.send(Command::Event(event)).is_err() {
            trace!("service stopped, event dropped");
        }
    }
}

struct TokioTimer(AbortHandle);

impl TimerHandle for TokioTimer {
    fn cancel(&self) {
        self.0.abort();
    }
}

/// Single-shot timers as sleeping tasks that post their event on expiry.
struct TokioTimers {
    handle: Handle,
    poster: QueuePoster,
}

impl TimerScheduler for TokioTimers {
    fn schedule(&self, delay: Duration, event: Event) -> Box<dyn TimerHandle> {
        let poster = self.poster.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(address = %event.address, event = event.name(), "timer fired");
            poster.post(event);
        });
        Box::new(TokioTimer(task.abort_handle()))
    }
}

type Snapshot = Arc<RwLock<HashMap<DeviceAddress, ConnectionState>>>;

/// Handle to a running HID host.
#[derive(Clone)]
pub struct HidHostService {
    poster: QueuePoster,
    snapshot: Snapshot,
    max_connections: usize,
}

/// The dispatcher side: owns every device's state machine.
pub struct EventLoop {
    rx: mpsc::UnboundedReceiver<Command>,
    ctx: MachineContext,
    machines: HashMap<DeviceAddress, DeviceStateMachine>,
    snapshot: Snapshot,
}

impl HidHostService {
    /// Build the service and its event loop. Must be called from inside a
    /// tokio runtime; the timers run on it.
    pub fn new(
        config: HostConfig,
        stack: HostStack,
        observer: Arc<dyn StateObserver>,
    ) -> Result<(Self, EventLoop)> {
        config.validate()?;
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let poster = QueuePoster(tx);
        let snapshot = Snapshot::default();
        let max_connections = config.max_connections;
        let ctx = MachineContext {
            config,
            stack,
            poster: Arc::new(poster.clone()),
            timers: Arc::new(TokioTimers {
                handle,
                poster: poster.clone(),
            }),
            observer,
        };
        info!(max_connections, "HID host service created");
        Ok((
            Self {
                poster,
                snapshot: snapshot.clone(),
                max_connections,
            },
            EventLoop {
                rx,
                ctx,
                machines: HashMap::new(),
                snapshot,
            },
        ))
    }

    /// Poster for lower-layer callbacks.
    pub fn poster(&self) -> Arc<dyn EventPoster> {
        Arc::new(self.poster.clone())
    }

    fn post(&self, address: &DeviceAddress, kind: EventKind) {
        self.poster.post(Event::new(address.clone(), kind));
    }

    pub fn connection_state(&self, address: &DeviceAddress) -> ConnectionState {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Devices currently in any of `states`, sorted by address.
    pub fn devices_by_states(&self, states: &[ConnectionState]) -> Vec<DeviceAddress> {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        let mut devices: Vec<DeviceAddress> = snapshot
            .iter()
            .filter(|(_, state)| states.contains(state))
            .map(|(address, _)| address.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Ask for a device to be brought up.
    pub fn connect(&self, address: &DeviceAddress) -> Result<()> {
        if !self.connection_state(address).is_active() {
            let active = self
                .devices_by_states(&[ConnectionState::Connecting, ConnectionState::Connected])
                .len();
            if active >= self.max_connections {
                warn!(%address, active, "connection limit reached");
                return Err(Error::TooManyConnections(self.max_connections));
            }
        }
        debug!(%address, "connect requested");
        self.post(address, EventKind::Open);
        Ok(())
    }

    /// Ask for a device to be torn down.
    pub fn disconnect(&self, address: &DeviceAddress) -> Result<()> {
        if self.connection_state(address) == ConnectionState::Disconnected {
            return Err(Error::NotConnected(address.to_string()));
        }
        debug!(%address, "disconnect requested");
        self.post(address, EventKind::Close);
        Ok(())
    }

    /// Queue an outbound report for a connected device.
    pub fn send_report(&self, address: &DeviceAddress, report: OutboundReport) -> Result<()> {
        if self.connection_state(address) != ConnectionState::Connected {
            return Err(Error::NotConnected(address.to_string()));
        }
        self.post(address, EventKind::SendReport(report));
        Ok(())
    }

    /// Stop the event loop. Pending events are dropped.
    pub fn shutdown(&self) {
        if self.poster.0.send(Command::Shutdown).is_err() {
            debug!("service already stopped");
        }
    }
}

/// Only these events may bring a new state machine into existence.
fn creates_machine(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Open
            | EventKind::L2cap(L2capEvent::ConnectIndication {
                psm: PSM_HID_CONTROL,
                ..
            })
    )
}

impl EventLoop {
    /// Process events until shutdown or until every sender is gone.
    pub async fn run(mut self) {
        info!("HID host event loop started");
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Event(event) => self.handle(event),
                Command::Shutdown => break,
            }
        }
        self.machines.clear();
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("HID host event loop stopped");
    }

    fn handle(&mut self, event: Event) {
        let address = event.address.clone();
        if !self.machines.contains_key(&address) {
            if !creates_machine(&event.kind) {
                debug!(%address, event = event.name(), "no state machine for device, dropping");
                return;
            }
            let mut machine = DeviceStateMachine::new(address.clone(), self.ctx.clone());
            machine.init();
            self.machines.insert(address.clone(), machine);
        }
        let Some(machine) = self.machines.get_mut(&address) else {
            return;
        };
        machine.dispatch(event);
        let state = machine.state();
        let remove = machine.is_marked_for_removal();

        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if remove {
            self.machines.remove(&address);
            snapshot.remove(&address);
            debug!(%address, "state machine removed");
        } else {
            snapshot.insert(address, state);
        }
    }
}

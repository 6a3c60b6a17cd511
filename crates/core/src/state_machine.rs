//! Per-device connection state machine.
//!
//! Four externally visible states. Entry and exit actions arm and cancel
//! the connect/disconnect timers, open and close the uhid device, replay
//! deferred API requests and emit edge-triggered notifications. Transport
//! work is delegated to the device's [`Session`].

use crate::classic::ClassicSession;
use crate::config::HostConfig;
use crate::dispatch::{EventPoster, StateObserver, TimerHandle, TimerScheduler};
use crate::error::Error;
use crate::event::{Event, EventKind, L2capEvent};
use crate::hogp::BleSession;
use crate::session::Session;
use crate::stack::{HostStack, UhidSink, PSM_HID_CONTROL};
use crate::types::{ConnectionState, DeviceAddress, TransportKind};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Shared collaborators handed to every machine.
#[derive(Clone)]
pub struct MachineContext {
    pub config: HostConfig,
    pub stack: HostStack,
    pub poster: Arc<dyn EventPoster>,
    pub timers: Arc<dyn TimerScheduler>,
    pub observer: Arc<dyn StateObserver>,
}

/// Connection state machine for one remote device.
pub struct DeviceStateMachine {
    address: DeviceAddress,
    ctx: MachineContext,
    state: ConnectionState,
    session: Option<Session>,
    sink: Arc<dyn UhidSink>,
    name: String,
    deferred: VecDeque<Event>,
    connect_timer: Option<Box<dyn TimerHandle>>,
    disconnect_timer: Option<Box<dyn TimerHandle>>,
    /// Last state reported to the observer.
    notified: ConnectionState,
    /// Set on the first exit from Disconnected.
    left_disconnected: bool,
    removal_requested: bool,
    uhid_open: bool,
}

impl DeviceStateMachine {
    pub fn new(address: DeviceAddress, ctx: MachineContext) -> Self {
        let sink = ctx.stack.uhid.create(&address);
        let name = ctx
            .stack
            .paired
            .device_name(&address)
            .unwrap_or_else(|| address.to_string());
        Self {
            address,
            ctx,
            state: ConnectionState::Disconnected,
            session: None,
            sink,
            name,
            deferred: VecDeque::new(),
            connect_timer: None,
            disconnect_timer: None,
            notified: ConnectionState::Disconnected,
            left_disconnected: false,
            removal_requested: false,
            uhid_open: false,
        }
    }

    /// Resolve the transport kind from the paired registry and build the
    /// matching session. Classic wins when both are paired.
    pub fn init(&mut self) {
        let stack = &self.ctx.stack;
        let config = &self.ctx.config;
        self.session = if stack.paired.is_classic_paired(&self.address) {
            Some(Session::Classic(ClassicSession::new(
                self.address.clone(),
                stack.l2cap.clone(),
                stack.security.clone(),
                stack.sdp.clone(),
                self.ctx.poster.clone(),
                self.sink.clone(),
                config.l2cap_mtu,
                config.l2cap_flush_timeout,
            )))
        } else if stack.paired.is_ble_paired(&self.address) {
            match BleSession::new(
                self.address.clone(),
                stack.gatt.clone(),
                self.ctx.poster.clone(),
                self.sink.clone(),
                config.gatt_timeout(),
            ) {
                Ok(session) => Some(Session::Ble(session)),
                Err(e) => {
                    warn!(address = %self.address, error = %e, "GATT registration failed");
                    None
                }
            }
        } else {
            None
        };
        info!(address = %self.address, kind = ?self.transport_kind(), name = %self.name, "device state machine created");
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.session
            .as_ref()
            .map_or(TransportKind::Unknown, Session::kind)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Battery level read during BLE discovery.
    pub fn battery_level(&self) -> Option<u8> {
        match &self.session {
            Some(Session::Ble(session)) => session.battery_level(),
            _ => None,
        }
    }

    /// The registry should drop this machine.
    pub fn is_marked_for_removal(&self) -> bool {
        self.removal_requested
    }

    /// Handle one event. Returns `false` when the current state does not
    /// handle it.
    pub fn dispatch(&mut self, event: Event) -> bool {
        if self.session.is_none() {
            let e = Error::UnknownDevice(self.address.to_string());
            warn!(error = %e, class = ?e.class(), event = event.name(), "dropping device");
            self.request_removal();
            return false;
        }
        trace!(address = %self.address, state = %self.state, event = event.name(), "dispatch");
        let name = event.name();
        let handled = match self.state {
            ConnectionState::Disconnected => self.on_disconnected(event.kind),
            ConnectionState::Connecting => self.on_connecting(event.kind),
            ConnectionState::Connected => self.on_connected(event.kind),
            ConnectionState::Disconnecting => self.on_disconnecting(event.kind),
        };
        if !handled {
            debug!(address = %self.address, state = %self.state, event = name, "event not handled");
        }
        handled
    }

    fn on_disconnected(&mut self, kind: EventKind) -> bool {
        match kind {
            EventKind::Open => {
                self.open();
                true
            }
            EventKind::Close => {
                debug!(address = %self.address, "already disconnected");
                true
            }
            EventKind::L2cap(L2capEvent::ConnectIndication {
                psm: PSM_HID_CONTROL,
                ..
            }) if self.transport_kind() == TransportKind::Classic => {
                info!(address = %self.address, "peer connecting");
                self.transition(ConnectionState::Connecting);
                self.forward(&kind)
            }
            kind => self.forward(&kind),
        }
    }

    fn on_connecting(&mut self, kind: EventKind) -> bool {
        match kind {
            kind if kind.is_deferrable() => {
                self.defer(kind);
                true
            }
            EventKind::OpenComplete => {
                self.transition(ConnectionState::Connected);
                true
            }
            EventKind::CloseComplete => {
                self.transition(ConnectionState::Disconnected);
                true
            }
            EventKind::ConnectTimeout => {
                warn!(address = %self.address, "connect timed out");
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.as_dyn().disconnect() {
                        debug!(address = %self.address, error = %e, "teardown after timeout failed");
                    }
                }
                self.transition(ConnectionState::Disconnected);
                true
            }
            EventKind::SendReport(_) => {
                warn!(address = %self.address, "not connected, dropping report");
                false
            }
            kind => self.forward(&kind),
        }
    }

    fn on_connected(&mut self, kind: EventKind) -> bool {
        match kind {
            EventKind::Open => {
                debug!(address = %self.address, "already connected");
                true
            }
            EventKind::Close => {
                let result = match self.session.as_mut() {
                    Some(session) => session.as_dyn().disconnect(),
                    None => return false,
                };
                match result {
                    Ok(()) => self.transition(ConnectionState::Disconnecting),
                    Err(e) => {
                        warn!(address = %self.address, error = %e, class = ?e.class(), "disconnect failed");
                        self.transition(ConnectionState::Disconnected);
                    }
                }
                true
            }
            EventKind::SendReport(report) => {
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.as_dyn().send_report(report) {
                        warn!(address = %self.address, error = %e, "send report failed");
                    }
                }
                true
            }
            EventKind::CloseComplete => {
                info!(address = %self.address, "session closed by peer");
                self.transition(ConnectionState::Disconnected);
                true
            }
            kind => self.forward(&kind),
        }
    }

    fn on_disconnecting(&mut self, kind: EventKind) -> bool {
        match kind {
            kind if kind.is_deferrable() => {
                self.defer(kind);
                true
            }
            EventKind::CloseComplete => {
                self.transition(ConnectionState::Disconnected);
                true
            }
            EventKind::DisconnectTimeout => {
                warn!(address = %self.address, "disconnect timed out, returning to connected");
                self.transition(ConnectionState::Connected);
                true
            }
            EventKind::SendReport(_) => {
                warn!(address = %self.address, "disconnecting, dropping report");
                false
            }
            kind => self.forward(&kind),
        }
    }

    fn forward(&mut self, kind: &EventKind) -> bool {
        self.session
            .as_mut()
            .is_some_and(|session| session.as_dyn().process_event(kind))
    }

    fn open(&mut self) {
        self.transition(ConnectionState::Connecting);
        let result = match self.session.as_mut() {
            Some(session) => session.as_dyn().connect(),
            None => return,
        };
        if let Err(e) = result {
            warn!(address = %self.address, error = %e, class = ?e.class(), "connect failed");
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn defer(&mut self, kind: EventKind) {
        debug!(address = %self.address, state = %self.state, event = kind.name(), "deferring");
        self.deferred.push_back(Event::new(self.address.clone(), kind));
    }

    fn replay_deferred(&mut self) {
        for event in self.deferred.drain(..) {
            self.ctx.poster.post(event);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        let prev = self.state;
        if prev == next {
            return;
        }
        debug!(address = %self.address, from = %prev, to = %next, "state transition");
        self.exit(prev);
        self.state = next;
        self.enter(next);
    }

    fn exit(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => cancel(&mut self.connect_timer),
            ConnectionState::Disconnecting => cancel(&mut self.disconnect_timer),
            ConnectionState::Disconnected => self.left_disconnected = true,
            ConnectionState::Connected => {}
        }
    }

    fn enter(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => {
                self.connect_timer = Some(self.ctx.timers.schedule(
                    self.ctx.config.connect_timeout(),
                    Event::new(self.address.clone(), EventKind::ConnectTimeout),
                ));
                self.notify(state);
            }
            ConnectionState::Disconnecting => {
                self.disconnect_timer = Some(self.ctx.timers.schedule(
                    self.ctx.config.disconnect_timeout(),
                    Event::new(self.address.clone(), EventKind::DisconnectTimeout),
                ));
                self.notify(state);
            }
            ConnectionState::Connected => {
                self.open_uhid();
                self.replay_deferred();
                self.notify(state);
            }
            ConnectionState::Disconnected => {
                if self.uhid_open {
                    self.sink.close();
                    self.uhid_open = false;
                }
                self.replay_deferred();
                if self.left_disconnected {
                    self.request_removal();
                    self.notify(state);
                }
            }
        }
    }

    fn open_uhid(&mut self) {
        if self.uhid_open {
            return;
        }
        self.sink.open();
        let metadata = self
            .session
            .as_ref()
            .and_then(|session| session.as_ref_dyn().hid_metadata());
        match metadata {
            Some((pnp, hid)) => self.sink.send_hid_info(&self.name, &pnp, &hid),
            None => warn!(address = %self.address, "no HID metadata for uhid device"),
        }
        self.uhid_open = true;
    }

    fn notify(&mut self, state: ConnectionState) {
        if self.notified == state {
            return;
        }
        self.notified = state;
        info!(address = %self.address, state = %state, code = state.code(), "connection state changed");
        self.ctx
            .observer
            .on_connection_state_changed(&self.address, state);
    }

    fn request_removal(&mut self) {
        if self.removal_requested {
            return;
        }
        self.removal_requested = true;
        debug!(address = %self.address, "device marked for removal");
        self.sink.destroy();
    }
}

fn cancel(timer: &mut Option<Box<dyn TimerHandle>>) {
    if let Some(timer) = timer.take() {
        timer.cancel();
    }
}

impl Drop for DeviceStateMachine {
    fn drop(&mut self) {
        cancel(&mut self.connect_timer);
        cancel(&mut self.disconnect_timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockStack, RecordingObserver};
    use crate::sim::UhidCall;
    use crate::stack::SecurityDirection;
    use crate::types::{OutboundReport, SdpRecord};
    use std::time::Duration;

    fn classic_machine(mock: &MockStack) -> DeviceStateMachine {
        mock.paired.add_classic(mock.address.clone(), Some("Keyboard K810"));
        let mut sm = DeviceStateMachine::new(mock.address.clone(), mock.context());
        sm.init();
        sm
    }

    fn ev(mock: &MockStack, kind: EventKind) -> Event {
        Event::new(mock.address.clone(), kind)
    }

    fn states(observer: &RecordingObserver) -> Vec<ConnectionState> {
        observer.states()
    }

    #[test]
    fn open_arms_connect_timer_and_starts_sdp() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        assert_eq!(sm.transport_kind(), TransportKind::Classic);
        assert!(sm.dispatch(ev(&mock, EventKind::Open)));
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(mock.sdp.count(), 1);
        assert_eq!(
            mock.timers.armed(),
            vec![(Duration::from_secs(60), EventKind::ConnectTimeout)]
        );
        assert_eq!(states(&mock.observer), vec![ConnectionState::Connecting]);
    }

    #[test]
    fn open_complete_opens_uhid_with_record() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        let record = SdpRecord::default();
        assert!(sm.dispatch(ev(&mock, EventKind::SdpComplete(Some(record.clone())))));
        assert!(sm.dispatch(ev(&mock, EventKind::OpenComplete)));

        assert_eq!(sm.state(), ConnectionState::Connected);
        assert!(mock.timers.armed().is_empty());
        assert_eq!(
            mock.uhid.calls(),
            vec![
                UhidCall::Open,
                UhidCall::HidInfo {
                    name: "Keyboard K810".into(),
                    pnp: record.pnp,
                    hid: record.hid,
                },
            ]
        );
        assert_eq!(
            states(&mock.observer),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn name_falls_back_to_address() {
        let mock = MockStack::new();
        mock.paired.add_classic(mock.address.clone(), None);
        let sm = DeviceStateMachine::new(mock.address.clone(), mock.context());
        assert_eq!(sm.name(), mock.address.as_str());
    }

    #[test]
    fn api_requests_defer_while_connecting_and_replay_on_connected() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        assert!(sm.dispatch(ev(&mock, EventKind::Close)));
        assert_eq!(sm.deferred_len(), 1);
        assert_eq!(sm.state(), ConnectionState::Connecting);

        mock.poster.take();
        sm.dispatch(ev(&mock, EventKind::OpenComplete));
        assert_eq!(sm.deferred_len(), 0);
        assert_eq!(mock.poster.kinds(), vec![EventKind::Close]);
    }

    #[test]
    fn deferred_requests_replay_in_arrival_order() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        assert!(sm.dispatch(ev(&mock, EventKind::Open)));
        assert!(sm.dispatch(ev(&mock, EventKind::Close)));
        assert_eq!(sm.deferred_len(), 2);

        mock.poster.take();
        sm.dispatch(ev(&mock, EventKind::OpenComplete));
        assert_eq!(sm.deferred_len(), 0);
        assert_eq!(mock.poster.kinds(), vec![EventKind::Open, EventKind::Close]);
    }

    #[test]
    fn refused_disconnect_goes_to_disconnected() {
        let mock = MockStack::new();
        mock.l2cap.refuse_disconnect();
        let mut sm = classic_machine(&mock);
        let ind = EventKind::L2cap(L2capEvent::ConnectIndication {
            lcid: 0x40,
            id: 1,
            psm: PSM_HID_CONTROL,
        });
        sm.dispatch(ev(&mock, ind));
        sm.dispatch(ev(
            &mock,
            EventKind::Security {
                direction: SecurityDirection::Incoming,
                status: 0,
            },
        ));
        sm.dispatch(ev(&mock, EventKind::OpenComplete));
        assert_eq!(sm.state(), ConnectionState::Connected);

        assert!(sm.dispatch(ev(&mock, EventKind::Close)));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.is_marked_for_removal());
        assert!(mock.timers.armed().is_empty());
        assert!(mock.uhid.calls().contains(&UhidCall::Close));
        assert_eq!(
            states(&mock.observer),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn full_cycle_marks_removal_once() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        sm.dispatch(ev(&mock, EventKind::OpenComplete));
        assert!(sm.dispatch(ev(&mock, EventKind::Close)));
        // No channels are bound, so the session reports closed at once.
        assert_eq!(sm.state(), ConnectionState::Disconnecting);
        assert_eq!(
            mock.timers.armed(),
            vec![(Duration::from_secs(60), EventKind::DisconnectTimeout)]
        );
        sm.dispatch(ev(&mock, EventKind::CloseComplete));

        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.is_marked_for_removal());
        assert!(mock.timers.armed().is_empty());
        assert_eq!(
            states(&mock.observer),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
        let calls = mock.uhid.calls();
        assert!(calls.contains(&UhidCall::Close));
        assert_eq!(calls.iter().filter(|c| **c == UhidCall::Destroy).count(), 1);

        // Another round trip through Disconnected does not destroy again.
        sm.dispatch(ev(&mock, EventKind::Open));
        sm.dispatch(ev(&mock, EventKind::CloseComplete));
        let destroys = mock
            .uhid
            .calls()
            .iter()
            .filter(|c| **c == UhidCall::Destroy)
            .count();
        assert_eq!(destroys, 1);
    }

    #[test]
    fn connect_timeout_forces_disconnected() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        assert!(sm.dispatch(ev(&mock, EventKind::ConnectTimeout)));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.is_marked_for_removal());
        assert_eq!(
            states(&mock.observer),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn disconnect_timeout_returns_to_connected_without_reopening_uhid() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        sm.dispatch(ev(&mock, EventKind::OpenComplete));
        sm.dispatch(ev(&mock, EventKind::Close));
        assert!(sm.dispatch(ev(&mock, EventKind::DisconnectTimeout)));
        assert_eq!(sm.state(), ConnectionState::Connected);
        let opens = mock
            .uhid
            .calls()
            .iter()
            .filter(|c| **c == UhidCall::Open)
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn stale_timeout_is_ignored() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        sm.dispatch(ev(&mock, EventKind::OpenComplete));
        assert!(!sm.dispatch(ev(&mock, EventKind::ConnectTimeout)));
        assert_eq!(sm.state(), ConnectionState::Connected);
    }

    #[test]
    fn failed_connect_goes_straight_back() {
        let mock = MockStack::new();
        mock.sdp.refuse();
        let mut sm = classic_machine(&mock);
        assert!(sm.dispatch(ev(&mock, EventKind::Open)));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.is_marked_for_removal());
        assert_eq!(
            states(&mock.observer),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn report_outside_connected_is_dropped() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        let report = OutboundReport::output(vec![0x01, 0x02]);
        assert!(!sm.dispatch(ev(&mock, EventKind::SendReport(report))));
        assert!(mock.l2cap.calls().is_empty());
    }

    #[test]
    fn unknown_transport_requests_removal() {
        let mock = MockStack::new();
        let mut sm = DeviceStateMachine::new(mock.address.clone(), mock.context());
        sm.init();
        assert_eq!(sm.transport_kind(), TransportKind::Unknown);
        assert!(!sm.dispatch(ev(&mock, EventKind::Open)));
        assert!(sm.is_marked_for_removal());
        assert!(!sm.dispatch(ev(&mock, EventKind::Open)));
        assert_eq!(mock.uhid.calls(), vec![UhidCall::Destroy]);
    }

    #[test]
    fn peer_control_connect_moves_to_connecting() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        let ind = EventKind::L2cap(L2capEvent::ConnectIndication {
            lcid: 0x40,
            id: 1,
            psm: PSM_HID_CONTROL,
        });
        assert!(sm.dispatch(ev(&mock, ind)));
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(
            mock.security.calls(),
            vec![(SecurityDirection::Incoming, PSM_HID_CONTROL)]
        );
    }

    #[test]
    fn duplicate_states_are_not_renotified() {
        let mock = MockStack::new();
        let mut sm = classic_machine(&mock);
        sm.dispatch(ev(&mock, EventKind::Open));
        sm.dispatch(ev(&mock, EventKind::OpenComplete));
        sm.dispatch(ev(&mock, EventKind::Close));
        sm.dispatch(ev(&mock, EventKind::DisconnectTimeout));
        sm.dispatch(ev(&mock, EventKind::Open));
        assert_eq!(
            states(&mock.observer),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn ble_machine_resolves_ble_session() {
        let mock = MockStack::new();
        mock.paired.add_ble(mock.address.clone(), None);
        let mut sm = DeviceStateMachine::new(mock.address.clone(), mock.context());
        sm.init();
        assert_eq!(sm.transport_kind(), TransportKind::Ble);
        assert_eq!(mock.gatt.registered(), 1);
        drop(sm);
        assert_eq!(mock.gatt.registered(), 0);
    }
}

//! Recording fakes for unit and integration tests.
//!
//! Each fake stores what it was asked to do behind a `Mutex` so tests can
//! assert on the exact sequence of calls.

use crate::config::HostConfig;
use crate::dispatch::{EventPoster, StateObserver, TimerHandle, TimerScheduler};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::sim::{LoopbackGatt, LoopbackPaired, RecordingUhid};
use crate::stack::{
    ConfigResult, ConnectResult, HostStack, L2cap, L2capConfig, SdpClient, Security,
    SecurityDirection, UhidFactory, UhidSink,
};
use crate::state_machine::MachineContext;
use crate::types::{ConnectionState, DeviceAddress};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Poll `done` until it holds, failing the test after two seconds.
pub fn wait_until(done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// One request made on [`MockL2cap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capCall {
    ConnectReq { psm: u16, lcid: u16 },
    ConnectRsp { lcid: u16, id: u8, result: ConnectResult },
    ConfigReq { lcid: u16 },
    ConfigRsp { lcid: u16, id: u8, result: ConfigResult },
    DisconnectReq { lcid: u16 },
    DisconnectRsp { lcid: u16, id: u8 },
    SendData { lcid: u16, data: Vec<u8> },
}

/// L2CAP that records requests and hands out sequential channel ids.
pub struct MockL2cap {
    calls: Mutex<Vec<L2capCall>>,
    next_lcid: Mutex<u16>,
    refuse_disconnect: AtomicBool,
}

impl Default for MockL2cap {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_lcid: Mutex::new(0x0040),
            refuse_disconnect: AtomicBool::new(false),
        }
    }
}

impl MockL2cap {
    pub fn set_next_lcid(&self, lcid: u16) {
        *self.next_lcid.lock().unwrap() = lcid;
    }

    /// Make every later `disconnect_req` fail synchronously.
    pub fn refuse_disconnect(&self) {
        self.refuse_disconnect.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<L2capCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<L2capCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn record(&self, call: L2capCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl L2cap for MockL2cap {
    fn connect_req(&self, _address: &DeviceAddress, psm: u16) -> Result<u16> {
        let lcid = {
            let mut next = self.next_lcid.lock().unwrap();
            let lcid = *next;
            *next += 1;
            lcid
        };
        self.record(L2capCall::ConnectReq { psm, lcid })?;
        Ok(lcid)
    }

    fn connect_rsp(&self, lcid: u16, id: u8, result: ConnectResult) -> Result<()> {
        self.record(L2capCall::ConnectRsp { lcid, id, result })
    }

    fn config_req(&self, lcid: u16, _config: &L2capConfig) -> Result<()> {
        self.record(L2capCall::ConfigReq { lcid })
    }

    fn config_rsp(
        &self,
        lcid: u16,
        id: u8,
        _config: &L2capConfig,
        result: ConfigResult,
    ) -> Result<()> {
        self.record(L2capCall::ConfigRsp { lcid, id, result })
    }

    fn disconnect_req(&self, lcid: u16) -> Result<()> {
        if self.refuse_disconnect.load(Ordering::SeqCst) {
            return Err(Error::Transport("L2CAP disconnect refused".into()));
        }
        self.record(L2capCall::DisconnectReq { lcid })
    }

    fn disconnect_rsp(&self, lcid: u16, id: u8) -> Result<()> {
        self.record(L2capCall::DisconnectRsp { lcid, id })
    }

    fn send_data(&self, lcid: u16, data: &[u8]) -> Result<()> {
        self.record(L2capCall::SendData {
            lcid,
            data: data.to_vec(),
        })
    }
}

/// Security that records requests; results are fed in by the test.
#[derive(Default)]
pub struct MockSecurity {
    calls: Mutex<Vec<(SecurityDirection, u16)>>,
}

impl MockSecurity {
    pub fn calls(&self) -> Vec<(SecurityDirection, u16)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Security for MockSecurity {
    fn request_security(
        &self,
        _address: &DeviceAddress,
        direction: SecurityDirection,
        psm: u16,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((direction, psm));
        Ok(())
    }
}

/// SDP client that counts discoveries, optionally refusing them.
#[derive(Default)]
pub struct MockSdp {
    count: AtomicUsize,
    refuse: AtomicBool,
}

impl MockSdp {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

impl SdpClient for MockSdp {
    fn discover(&self, _address: &DeviceAddress) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport("SDP busy".into()));
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poster that collects events instead of queueing them.
#[derive(Default)]
pub struct MockPoster {
    events: Mutex<Vec<Event>>,
}

impl MockPoster {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }
}

impl EventPoster for MockPoster {
    fn post(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

struct ManualTimer {
    delay: Duration,
    event: Event,
    cancelled: Arc<AtomicBool>,
}

struct ManualHandle(Arc<AtomicBool>);

impl TimerHandle for ManualHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Timers that never fire on their own.
#[derive(Default)]
pub struct ManualTimers {
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualTimers {
    /// Delay and event of every timer not yet cancelled.
    pub fn armed(&self) -> Vec<(Duration, EventKind)> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .map(|t| (t.delay, t.event.kind.clone()))
            .collect()
    }
}

impl TimerScheduler for ManualTimers {
    fn schedule(&self, delay: Duration, event: Event) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.timers.lock().unwrap().push(ManualTimer {
            delay,
            event,
            cancelled: cancelled.clone(),
        });
        Box::new(ManualHandle(cancelled))
    }
}

/// Observer that records every notification.
#[derive(Default)]
pub struct RecordingObserver {
    changes: Mutex<Vec<(DeviceAddress, ConnectionState)>>,
}

impl RecordingObserver {
    pub fn changes(&self) -> Vec<(DeviceAddress, ConnectionState)> {
        self.changes.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.changes().into_iter().map(|(_, s)| s).collect()
    }
}

impl StateObserver for RecordingObserver {
    fn on_connection_state_changed(&self, address: &DeviceAddress, state: ConnectionState) {
        self.changes.lock().unwrap().push((address.clone(), state));
    }
}

/// Hands every device the same recording sink.
pub struct SharedUhidFactory(pub Arc<RecordingUhid>);

impl UhidFactory for SharedUhidFactory {
    fn create(&self, _address: &DeviceAddress) -> Arc<dyn UhidSink> {
        self.0.clone()
    }
}

/// All fakes for one device under test.
pub struct MockStack {
    pub address: DeviceAddress,
    pub config: HostConfig,
    pub l2cap: Arc<MockL2cap>,
    pub security: Arc<MockSecurity>,
    pub sdp: Arc<MockSdp>,
    pub gatt: Arc<LoopbackGatt>,
    pub paired: Arc<LoopbackPaired>,
    pub uhid: Arc<RecordingUhid>,
    pub poster: Arc<MockPoster>,
    pub timers: Arc<ManualTimers>,
    pub observer: Arc<RecordingObserver>,
}

impl MockStack {
    pub fn new() -> Self {
        Self {
            address: "00:1B:DC:0F:AA:01".parse().unwrap(),
            config: HostConfig::default(),
            l2cap: Arc::new(MockL2cap::default()),
            security: Arc::new(MockSecurity::default()),
            sdp: Arc::new(MockSdp::default()),
            gatt: Arc::new(LoopbackGatt::keyboard()),
            paired: Arc::new(LoopbackPaired::default()),
            uhid: Arc::new(RecordingUhid::default()),
            poster: Arc::new(MockPoster::default()),
            timers: Arc::new(ManualTimers::default()),
            observer: Arc::new(RecordingObserver::default()),
        }
    }

    pub fn uhid_sink(&self) -> Arc<dyn UhidSink> {
        self.uhid.clone()
    }

    pub fn stack(&self) -> HostStack {
        HostStack {
            l2cap: self.l2cap.clone(),
            security: self.security.clone(),
            sdp: self.sdp.clone(),
            gatt: self.gatt.clone(),
            paired: self.paired.clone(),
            uhid: Arc::new(SharedUhidFactory(self.uhid.clone())),
        }
    }

    pub fn context(&self) -> MachineContext {
        MachineContext {
            config: self.config.clone(),
            stack: self.stack(),
            poster: self.poster.clone(),
            timers: self.timers.clone(),
            observer: self.observer.clone(),
        }
    }
}

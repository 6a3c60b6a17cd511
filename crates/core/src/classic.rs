//! Classic HID transport: the control and interrupt L2CAP channels.
//!
//! Bring-up order (initiator): SDP record → outgoing security on the
//! control PSM → control channel connect → both-direction config of the
//! control channel → interrupt channel connect → both-direction config of
//! the interrupt channel → open-complete. As acceptor the peer opens both
//! channels; the control channel is gated by incoming security and the
//! interrupt channel is accepted only while we wait for it.

use crate::dispatch::EventPoster;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, L2capEvent};
use crate::pdu::{self, control, handshake, HidPdu, TransactionType};
use crate::session::HidSession;
use crate::stack::{
    ConfigResult, ConnectResult, L2cap, L2capConfig, L2capMode, SdpClient, Security,
    SecurityDirection, UhidSink, PSM_HID_CONTROL, PSM_HID_INTERRUPT,
};
use crate::types::{
    DeviceAddress, HidInfo, OutboundReport, PnpInfo, ReportRequest, ReportType, SdpRecord,
};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Connection progress of the channel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capState {
    Unused,
    Security,
    ConnectingControl,
    ConnectingInterrupt,
    Config,
    Connected,
    Disconnecting,
}

/// Which configuration directions have completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigFlags(u8);

impl ConfigFlags {
    pub const HIS_CONTROL: u8 = 0x01;
    pub const MY_CONTROL: u8 = 0x02;
    pub const HIS_INTERRUPT: u8 = 0x04;
    pub const MY_INTERRUPT: u8 = 0x08;
    pub const CONTROL_DONE: u8 = Self::HIS_CONTROL | Self::MY_CONTROL;
    pub const ALL: u8 = 0x0F;

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn contains(self, flags: u8) -> bool {
        self.0 & flags == flags
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Control,
    Interrupt,
}

/// One device's classic HID session.
pub struct ClassicSession {
    address: DeviceAddress,
    l2cap: Arc<dyn L2cap>,
    security: Arc<dyn Security>,
    sdp: Arc<dyn SdpClient>,
    poster: Arc<dyn EventPoster>,
    sink: Arc<dyn UhidSink>,
    local_config: L2capConfig,
    ctrl_lcid: u16,
    intr_lcid: u16,
    state: L2capState,
    flags: ConfigFlags,
    initiator: bool,
    /// Inbound control connection waiting on incoming security.
    pending_accept: Option<(u16, u8)>,
    record: Option<SdpRecord>,
    sdp_in_progress: bool,
    remote_busy: bool,
}

impl ClassicSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: DeviceAddress,
        l2cap: Arc<dyn L2cap>,
        security: Arc<dyn Security>,
        sdp: Arc<dyn SdpClient>,
        poster: Arc<dyn EventPoster>,
        sink: Arc<dyn UhidSink>,
        mtu: u16,
        flush_timeout: u16,
    ) -> Self {
        Self {
            address,
            l2cap,
            security,
            sdp,
            poster,
            sink,
            local_config: L2capConfig {
                mtu,
                flush_timeout,
                mode: L2capMode::Basic,
            },
            ctrl_lcid: 0,
            intr_lcid: 0,
            state: L2capState::Unused,
            flags: ConfigFlags::default(),
            initiator: false,
            pending_accept: None,
            record: None,
            sdp_in_progress: false,
            remote_busy: false,
        }
    }

    pub fn state(&self) -> L2capState {
        self.state
    }

    pub fn flags(&self) -> ConfigFlags {
        self.flags
    }

    pub fn control_lcid(&self) -> u16 {
        self.ctrl_lcid
    }

    pub fn interrupt_lcid(&self) -> u16 {
        self.intr_lcid
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_remote_busy(&self) -> bool {
        self.remote_busy
    }

    fn post(&self, kind: EventKind) {
        self.poster.post(Event::new(self.address.clone(), kind));
    }

    fn post_closed(&mut self) {
        self.state = L2capState::Unused;
        self.post(EventKind::CloseComplete);
    }

    fn channel(&self, lcid: u16) -> Option<Channel> {
        if lcid == 0 {
            None
        } else if lcid == self.ctrl_lcid {
            Some(Channel::Control)
        } else if lcid == self.intr_lcid {
            Some(Channel::Interrupt)
        } else {
            None
        }
    }

    fn release(&mut self, lcid: u16) {
        match self.channel(lcid) {
            Some(Channel::Control) => self.ctrl_lcid = 0,
            Some(Channel::Interrupt) => self.intr_lcid = 0,
            None => {}
        }
    }

    /// Give up on the session: tear down what is open, or report closed.
    fn abort(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(address = %self.address, error = %e, class = ?e.class(), "teardown failed");
            self.post_closed();
        }
    }

    fn start_outgoing_security(&mut self) -> Result<()> {
        debug!(address = %self.address, psm = format_args!("0x{:04X}", PSM_HID_CONTROL), "requesting outgoing security");
        self.security
            .request_security(&self.address, SecurityDirection::Outgoing, PSM_HID_CONTROL)
    }

    fn on_sdp_complete(&mut self, record: Option<SdpRecord>) {
        self.sdp_in_progress = false;
        let Some(record) = record else {
            warn!(address = %self.address, "SDP discovery failed");
            self.post_closed();
            return;
        };
        debug!(
            address = %self.address,
            vendor = format_args!("0x{:04X}", record.pnp.vendor_id),
            product = format_args!("0x{:04X}", record.pnp.product_id),
            descriptor_len = record.hid.descriptor.len(),
            "SDP record received"
        );
        self.record = Some(record);
        if let Err(e) = self.start_outgoing_security() {
            warn!(address = %self.address, error = %e, "security request refused");
            self.post_closed();
        }
    }

    fn on_security(&mut self, direction: SecurityDirection, status: u16) {
        match direction {
            SecurityDirection::Outgoing => self.on_outgoing_security(status),
            SecurityDirection::Incoming => self.on_incoming_security(status),
        }
    }

    fn on_outgoing_security(&mut self, status: u16) {
        if status != 0 {
            let e = Error::SecurityRejected(status);
            warn!(address = %self.address, error = %e, "outgoing security failed");
            self.post_closed();
            return;
        }
        match self.l2cap.connect_req(&self.address, PSM_HID_CONTROL) {
            Ok(lcid) => {
                debug!(address = %self.address, lcid, "control channel connecting");
                self.ctrl_lcid = lcid;
                self.initiator = true;
                self.flags.clear();
                self.state = L2capState::ConnectingControl;
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "control connect request failed");
                self.post_closed();
            }
        }
    }

    fn on_incoming_security(&mut self, status: u16) {
        let Some((lcid, id)) = self.pending_accept.take() else {
            warn!(address = %self.address, "incoming security result without pending connection");
            return;
        };
        if status != 0 {
            warn!(address = %self.address, lcid, status, "incoming security failed");
            if let Err(e) = self.l2cap.connect_rsp(lcid, id, ConnectResult::SecurityBlock) {
                debug!(address = %self.address, error = %e, "connect response failed");
            }
            self.post_closed();
            return;
        }
        if let Err(e) = self.l2cap.connect_rsp(lcid, id, ConnectResult::Success) {
            warn!(address = %self.address, error = %e, "accepting control channel failed");
            self.post_closed();
            return;
        }
        self.ctrl_lcid = lcid;
        self.state = L2capState::Config;
        self.send_config_req(lcid);
    }

    fn send_config_req(&mut self, lcid: u16) {
        if let Err(e) = self.l2cap.config_req(lcid, &self.local_config) {
            warn!(address = %self.address, lcid, error = %e, "config request failed");
            self.abort();
        }
    }

    fn on_connect_indication(&mut self, lcid: u16, id: u8, psm: u16) {
        match psm {
            PSM_HID_CONTROL => {
                if self.state != L2capState::Unused {
                    warn!(address = %self.address, state = ?self.state, "control connect while busy, rejecting");
                    self.reject(lcid, id, ConnectResult::NoResources);
                    return;
                }
                self.flags.clear();
                self.initiator = false;
                if let Err(e) = self.security.request_security(
                    &self.address,
                    SecurityDirection::Incoming,
                    PSM_HID_CONTROL,
                ) {
                    warn!(address = %self.address, error = %e, "incoming security request refused");
                    self.reject(lcid, id, ConnectResult::NoResources);
                    self.post_closed();
                    return;
                }
                self.pending_accept = Some((lcid, id));
                self.state = L2capState::Security;
            }
            PSM_HID_INTERRUPT => {
                if self.ctrl_lcid == 0 || self.state != L2capState::ConnectingInterrupt {
                    warn!(address = %self.address, state = ?self.state, "unexpected interrupt connect, rejecting");
                    self.reject(lcid, id, ConnectResult::NoResources);
                    return;
                }
                if let Err(e) = self.l2cap.connect_rsp(lcid, id, ConnectResult::Success) {
                    warn!(address = %self.address, error = %e, "accepting interrupt channel failed");
                    self.abort();
                    return;
                }
                self.intr_lcid = lcid;
                self.state = L2capState::Config;
                self.send_config_req(lcid);
            }
            other => {
                debug!(address = %self.address, psm = format_args!("0x{other:04X}"), "PSM not handled");
                self.reject(lcid, id, ConnectResult::PsmNotSupported);
            }
        }
    }

    fn reject(&self, lcid: u16, id: u8, result: ConnectResult) {
        if let Err(e) = self.l2cap.connect_rsp(lcid, id, result) {
            debug!(address = %self.address, lcid, error = %e, "reject response failed");
        }
    }

    fn on_connect_response(&mut self, lcid: u16, result: ConnectResult) {
        if self.channel(lcid).is_none() {
            warn!(address = %self.address, lcid, "connect response for unknown channel");
            return;
        }
        match result {
            ConnectResult::Pending => {
                debug!(address = %self.address, lcid, "connect pending");
            }
            ConnectResult::Success => {
                self.state = L2capState::Config;
                self.send_config_req(lcid);
            }
            refused => {
                let e = Error::ConnectRefused(refused.as_u16());
                warn!(address = %self.address, lcid, error = %e, "channel refused");
                self.release(lcid);
                self.abort();
            }
        }
    }

    fn on_config_request(&mut self, lcid: u16, id: u8, config: L2capConfig) {
        if config.mode == L2capMode::EnhancedRetransmission {
            debug!(address = %self.address, lcid, "peer proposed ERTM, answering unacceptable parameters");
            if let Err(e) = self.l2cap.config_rsp(
                lcid,
                id,
                &self.local_config,
                ConfigResult::UnacceptableParameters,
            ) {
                debug!(address = %self.address, error = %e, "config response failed");
            }
            return;
        }
        let Some(channel) = self.channel(lcid) else {
            warn!(address = %self.address, lcid, "config request for unknown channel");
            if let Err(e) = self.l2cap.config_rsp(lcid, id, &config, ConfigResult::Rejected) {
                debug!(address = %self.address, error = %e, "config response failed");
            }
            return;
        };
        if let Err(e) = self.l2cap.config_rsp(lcid, id, &config, ConfigResult::Success) {
            warn!(address = %self.address, lcid, error = %e, "config response failed");
            self.abort();
            return;
        }
        self.flags.set(match channel {
            Channel::Control => ConfigFlags::HIS_CONTROL,
            Channel::Interrupt => ConfigFlags::HIS_INTERRUPT,
        });
        self.check_configured(channel);
    }

    fn on_config_response(&mut self, lcid: u16, result: ConfigResult) {
        let Some(channel) = self.channel(lcid) else {
            warn!(address = %self.address, lcid, "config response for unknown channel");
            return;
        };
        if result != ConfigResult::Success {
            let e = Error::ConfigRejected(result.as_u16());
            warn!(address = %self.address, lcid, error = %e, "configuration rejected");
            self.abort();
            return;
        }
        self.flags.set(match channel {
            Channel::Control => ConfigFlags::MY_CONTROL,
            Channel::Interrupt => ConfigFlags::MY_INTERRUPT,
        });
        self.check_configured(channel);
    }

    fn check_configured(&mut self, channel: Channel) {
        if matches!(self.state, L2capState::Connected | L2capState::Disconnecting) {
            return;
        }
        if self.flags.contains(ConfigFlags::ALL) {
            info!(address = %self.address, ctrl = self.ctrl_lcid, intr = self.intr_lcid, "HID channels configured");
            self.state = L2capState::Connected;
            self.post(EventKind::OpenComplete);
            return;
        }
        if channel != Channel::Control
            || !self.flags.contains(ConfigFlags::CONTROL_DONE)
            || self.intr_lcid != 0
        {
            return;
        }
        self.state = L2capState::ConnectingInterrupt;
        if !self.initiator {
            debug!(address = %self.address, "control configured, waiting for peer interrupt channel");
            return;
        }
        match self.l2cap.connect_req(&self.address, PSM_HID_INTERRUPT) {
            Ok(lcid) => {
                debug!(address = %self.address, lcid, "interrupt channel connecting");
                self.intr_lcid = lcid;
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "interrupt connect request failed");
                self.abort();
            }
        }
    }

    fn on_disconnect_request(&mut self, lcid: u16, id: u8) {
        if let Err(e) = self.l2cap.disconnect_rsp(lcid, id) {
            debug!(address = %self.address, lcid, error = %e, "disconnect response failed");
        }
        self.state = L2capState::Disconnecting;
        self.release(lcid);
        if self.ctrl_lcid == 0 && self.intr_lcid == 0 {
            self.post_closed();
        }
    }

    fn on_disconnect_response(&mut self, lcid: u16) {
        self.release(lcid);
        if self.intr_lcid == 0 && self.ctrl_lcid != 0 {
            if let Err(e) = self.l2cap.disconnect_req(self.ctrl_lcid) {
                warn!(address = %self.address, error = %e, "control disconnect failed");
                self.ctrl_lcid = 0;
            }
        }
        if self.ctrl_lcid == 0 && self.intr_lcid == 0 {
            self.post_closed();
        }
    }

    fn on_disconnect_abnormal(&mut self, lcid: u16, reason: u8) {
        warn!(address = %self.address, lcid, reason, "channel lost");
        self.release(lcid);
        let sibling = if self.ctrl_lcid != 0 {
            self.ctrl_lcid
        } else {
            self.intr_lcid
        };
        if sibling != 0 {
            self.state = L2capState::Disconnecting;
            if self.l2cap.disconnect_req(sibling).is_ok() {
                return;
            }
            self.ctrl_lcid = 0;
            self.intr_lcid = 0;
        }
        self.post_closed();
    }

    fn on_data(&mut self, lcid: u16, payload: &[u8]) {
        trace!(address = %self.address, lcid, data = format_args!("{:02X?}", payload), "HID RX");
        let Some(channel) = self.channel(lcid) else {
            debug!(address = %self.address, lcid, "data on unknown channel");
            return;
        };
        let pdu = match HidPdu::decode(payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!(address = %self.address, error = %e, "dropping undecodable PDU");
                return;
            }
        };
        match pdu.header.kind {
            TransactionType::Handshake => self.sink.send_handshake(pdu.header.param),
            TransactionType::HidControl => {
                if pdu.header.param == control::VIRTUAL_CABLE_UNPLUG {
                    info!(address = %self.address, "virtual cable unplug");
                    self.post(EventKind::Close);
                } else {
                    debug!(address = %self.address, op = pdu.header.param, "ignoring HID_CONTROL");
                }
            }
            TransactionType::Data => {
                let Some((report_id, _)) = pdu.split_report_id() else {
                    debug!(address = %self.address, lcid, "empty DATA PDU");
                    return;
                };
                let report_type = pdu.report_type();
                match channel {
                    Channel::Interrupt if report_type == Some(ReportType::Input) => {
                        self.sink.send_data(&pdu.body)
                    }
                    Channel::Interrupt => {
                        debug!(address = %self.address, report_id, ?report_type, "non-input report on interrupt channel");
                    }
                    Channel::Control => self.sink.send_control_data(&pdu.body),
                }
            }
            other => {
                debug!(address = %self.address, kind = ?other, "unsupported transaction from device");
            }
        }
    }

    fn on_l2cap(&mut self, event: &L2capEvent) {
        match event {
            L2capEvent::ConnectIndication { lcid, id, psm } => {
                self.on_connect_indication(*lcid, *id, *psm)
            }
            L2capEvent::ConnectResponse { lcid, result } => self.on_connect_response(*lcid, *result),
            L2capEvent::ConfigRequest { lcid, id, config } => {
                self.on_config_request(*lcid, *id, *config)
            }
            L2capEvent::ConfigResponse { lcid, result } => self.on_config_response(*lcid, *result),
            L2capEvent::DisconnectRequest { lcid, id } => self.on_disconnect_request(*lcid, *id),
            L2capEvent::DisconnectResponse { lcid } => self.on_disconnect_response(*lcid),
            L2capEvent::DisconnectAbnormal { lcid, reason } => {
                self.on_disconnect_abnormal(*lcid, *reason)
            }
            L2capEvent::Data { lcid, payload } => self.on_data(*lcid, payload),
            L2capEvent::RemoteBusy { lcid, busy } => {
                debug!(address = %self.address, lcid, busy, "remote busy");
                self.remote_busy = *busy;
            }
        }
    }
}

impl HidSession for ClassicSession {
    fn connect(&mut self) -> Result<()> {
        if self.record.is_some() {
            return self.start_outgoing_security();
        }
        if !self.sdp_in_progress {
            debug!(address = %self.address, "starting SDP discovery");
            self.sdp.discover(&self.address)?;
            self.sdp_in_progress = true;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let lcid = if self.intr_lcid != 0 {
            self.intr_lcid
        } else {
            self.ctrl_lcid
        };
        if lcid == 0 {
            self.post_closed();
            return Ok(());
        }
        self.state = L2capState::Disconnecting;
        if let Err(e) = self.l2cap.disconnect_req(lcid) {
            // Nothing more will arrive for these channels.
            self.ctrl_lcid = 0;
            self.intr_lcid = 0;
            self.state = L2capState::Unused;
            return Err(e);
        }
        Ok(())
    }

    fn send_report(&mut self, report: OutboundReport) -> Result<()> {
        if self.state != L2capState::Connected {
            return Err(Error::NotConnected(self.address.to_string()));
        }
        if self.remote_busy {
            warn!(address = %self.address, "peer busy, dropping report");
            self.sink.send_handshake(handshake::NOT_READY);
            return Ok(());
        }
        let lcid = match report.request {
            ReportRequest::Data => self.intr_lcid,
            ReportRequest::GetReport | ReportRequest::SetReport => self.ctrl_lcid,
        };
        let frame = pdu::encode_report(&report)?;
        trace!(address = %self.address, lcid, data = format_args!("{:02X?}", frame), "HID TX");
        self.l2cap.send_data(lcid, &frame)
    }

    fn process_event(&mut self, kind: &EventKind) -> bool {
        match kind {
            EventKind::SdpComplete(record) => self.on_sdp_complete(record.clone()),
            EventKind::Security { direction, status } => self.on_security(*direction, *status),
            EventKind::L2cap(event) => self.on_l2cap(event),
            _ => return false,
        }
        true
    }

    fn hid_metadata(&self) -> Option<(PnpInfo, HidInfo)> {
        self.record.as_ref().map(|r| (r.pnp, r.hid.clone()))
    }
}

//! L2CAP Core Manager implementation
//!
//! This module provides the core L2CAP manager that handles:
//! - Channel management
//! - Data routing
//! - Signaling commands
//! - Connection setup and teardown
//!
//! The manager owns every channel on one ACL link and performs no I/O of its
//! own. ACL packets from the link go in through [`L2capManager::handle_acl`],
//! packets for the link come out of [`L2capManager::poll_transmit`], and the
//! upper layer collects [`ChannelEvent`]s from [`L2capManager::poll_event`].
//! Time only moves when the caller passes an `Instant` in.

use crate::hci::{AclPacket, AclRecombiner};
use crate::l2cap::channel::Channel;
use crate::l2cap::config::{NegotiatedParameters, RequestOutcome, ResponseOutcome};
use crate::l2cap::constants::*;
use crate::l2cap::packet::L2capHeader;
use crate::l2cap::psm::{Psm, PsmAllocator};
use crate::l2cap::signaling::{split_commands, SignalId, SignalingMessage};
use crate::l2cap::types::*;
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Channel events for the upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Both configuration directions completed, data may flow
    Connected {
        cid: ChannelId,
        psm: Psm,
        params: NegotiatedParameters,
    },
    /// A complete SDU arrived
    Data { cid: ChannelId, data: Vec<u8> },
    /// The channel is gone and its CID may be reused
    Disconnected { cid: ChannelId, reason: CloseReason },
    /// Answer to [`L2capManager::echo`]
    EchoResponse { data: Vec<u8> },
    /// Answer to [`L2capManager::request_information`]
    InformationResponse {
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
}

/// Type of signaling transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingTransaction {
    /// Connection request for this local CID
    Connect(ChannelId),
    /// Configuration request for this local CID
    Configure(ChannelId),
    /// Disconnection request for this local CID
    Disconnect(ChannelId),
    Echo,
    /// Information request of this type
    Information(u16),
}

/// L2CAP Manager responsible for handling L2CAP operations
pub struct L2capManager {
    config: L2capConfig,

    /// Channels mapped by local CID
    channels: HashMap<ChannelId, Channel>,

    /// Registered PSMs and the configuration their channels use
    psm_registrations: HashMap<Psm, ChannelConfig>,

    dynamic_psms: PsmAllocator,

    /// Next available dynamic CID
    next_cid: ChannelId,

    /// Requests waiting for a response, by signal identifier
    pending_transactions: HashMap<SignalId, SignalingTransaction>,

    /// Next available signaling identifier
    next_signal_id: SignalId,

    recombiner: AclRecombiner,
    outbound: VecDeque<AclPacket>,
    events: VecDeque<ChannelEvent>,
}

impl L2capManager {
    /// Create a new L2CAP Manager for one ACL link
    pub fn new(config: L2capConfig) -> Self {
        Self {
            config,
            channels: HashMap::new(),
            psm_registrations: HashMap::new(),
            dynamic_psms: PsmAllocator::new(),
            next_cid: L2CAP_DYNAMIC_CID_MIN,
            pending_transactions: HashMap::new(),
            next_signal_id: 1,
            recombiner: AclRecombiner::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &L2capConfig {
        &self.config
    }

    /// Look up a channel by local CID
    pub fn channel(&self, cid: ChannelId) -> Option<&Channel> {
        self.channels.get(&cid)
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.keys().copied()
    }

    /// Accept incoming connections for `psm`, configured with `config`
    pub fn register_psm(&mut self, psm: Psm, config: ChannelConfig) -> L2capResult<()> {
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("invalid PSM {}", psm)));
        }
        config.validate()?;

        if self.psm_registrations.contains_key(&psm) {
            return Err(L2capError::InvalidParameter(format!(
                "PSM {} already registered",
                psm
            )));
        }

        debug!("Registered {} in {} mode", psm, config.mode);
        self.psm_registrations.insert(psm, config);
        Ok(())
    }

    /// Register a service on the next unused dynamic PSM
    pub fn register_dynamic_psm(&mut self, config: ChannelConfig) -> L2capResult<Psm> {
        let registrations = &self.psm_registrations;
        let psm = self
            .dynamic_psms
            .allocate(|psm| registrations.contains_key(&psm))
            .ok_or(L2capError::ResourceLimitReached)?;
        self.register_psm(psm, config)?;
        Ok(psm)
    }

    /// Unregister a PSM. Channels already open on it are unaffected.
    pub fn unregister_psm(&mut self, psm: Psm) -> L2capResult<()> {
        if self.psm_registrations.remove(&psm).is_none() {
            return Err(L2capError::PsmNotRegistered);
        }
        Ok(())
    }

    /// Allocate a new dynamic CID
    fn allocate_cid(&mut self) -> L2capResult<ChannelId> {
        if self.channels.len() >= self.config.max_channels {
            return Err(L2capError::ResourceLimitReached);
        }

        let starting_cid = self.next_cid;
        loop {
            let candidate = self.next_cid;
            self.next_cid = if self.next_cid == L2CAP_DYNAMIC_CID_MAX {
                L2CAP_DYNAMIC_CID_MIN
            } else {
                self.next_cid + 1
            };

            if !self.channels.contains_key(&candidate) {
                return Ok(candidate);
            }
            // Check if we've gone full circle
            if self.next_cid == starting_cid {
                return Err(L2capError::ResourceLimitReached);
            }
        }
    }

    /// Allocate the next signal identifier, never 0 and never one still
    /// waiting for a response
    fn allocate_signal_id(&mut self) -> SignalId {
        let mut id = self.next_signal_id;
        for _ in 0..u8::MAX {
            id = self.next_signal_id;
            self.next_signal_id = self.next_signal_id.wrapping_add(1).max(1);
            if !self.pending_transactions.contains_key(&id) {
                break;
            }
        }
        id
    }

    /// Open a channel to `psm` on the peer
    ///
    /// Returns the local CID right away; [`ChannelEvent::Connected`] follows
    /// once connection and configuration complete.
    pub fn connect(&mut self, psm: Psm, config: ChannelConfig) -> L2capResult<ChannelId> {
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("invalid PSM {}", psm)));
        }
        config.validate()?;

        let local_cid = self.allocate_cid()?;
        let mut channel = Channel::new(local_cid, psm, ChannelRole::Initiator, config);
        channel.set_state(L2capChannelState::WaitConnectRsp);
        self.channels.insert(local_cid, channel);

        info!("Connecting channel 0x{:04x} to {}", local_cid, psm);
        self.send_request(SignalingTransaction::Connect(local_cid), |identifier| {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm: psm.value(),
                source_cid: local_cid,
            }
        });

        Ok(local_cid)
    }

    /// Send an SDU on an open channel
    pub fn send(&mut self, cid: ChannelId, data: &[u8], now: Instant) -> L2capResult<()> {
        let channel = self
            .channels
            .get_mut(&cid)
            .ok_or(L2capError::ChannelNotFound(cid))?;
        channel.send_sdu(data, now)?;
        self.service_channel(cid);
        Ok(())
    }

    /// Close a channel at the upper layer's request
    pub fn close(&mut self, cid: ChannelId) -> L2capResult<()> {
        let state = self
            .channels
            .get(&cid)
            .map(Channel::state)
            .ok_or(L2capError::ChannelNotFound(cid))?;

        match state {
            L2capChannelState::WaitDisconnect => Err(L2capError::InvalidState),
            L2capChannelState::WaitConfig | L2capChannelState::Open => {
                self.disconnect_channel(cid, CloseReason::LocalRequest);
                Ok(())
            }
            // The peer has not named its endpoint yet, nothing to disconnect
            L2capChannelState::Closed | L2capChannelState::WaitConnectRsp => {
                self.destroy_channel(cid, CloseReason::LocalRequest);
                Ok(())
            }
        }
    }

    /// Tell the peer whether the upper layer can take more data
    pub fn set_local_busy(&mut self, cid: ChannelId, busy: bool, now: Instant) -> L2capResult<()> {
        self.channels
            .get_mut(&cid)
            .ok_or(L2capError::ChannelNotFound(cid))?
            .set_local_busy(busy, now)?;
        self.service_channel(cid);
        Ok(())
    }

    /// Send an Echo Request, answered by [`ChannelEvent::EchoResponse`]
    pub fn echo(&mut self, data: &[u8]) -> SignalId {
        let data = data.to_vec();
        self.send_request(SignalingTransaction::Echo, |identifier| {
            SignalingMessage::EchoRequest { identifier, data }
        })
    }

    /// Send an Information Request, answered by
    /// [`ChannelEvent::InformationResponse`]
    pub fn request_information(&mut self, info_type: u16) -> SignalId {
        self.send_request(SignalingTransaction::Information(info_type), |identifier| {
            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            }
        })
    }

    /// Next ACL packet for the link
    pub fn poll_transmit(&mut self) -> Option<AclPacket> {
        self.outbound.pop_front()
    }

    /// Next event for the upper layer
    pub fn poll_event(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }

    /// Earliest timer deadline across all channels
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.channels.values().filter_map(Channel::poll_timeout).min()
    }

    /// Fire every channel timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        let due: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.poll_timeout().is_some_and(|t| t <= now))
            .map(|(cid, _)| *cid)
            .collect();

        for cid in due {
            if let Some(channel) = self.channels.get_mut(&cid) {
                channel.handle_timeout(now);
            }
            self.service_channel(cid);
        }
    }

    /// The ACL link went away: every channel is closed without signaling
    pub fn handle_link_closed(&mut self) {
        info!("ACL link 0x{:03x} closed", self.config.handle);
        let cids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for cid in cids {
            self.destroy_channel(cid, CloseReason::LinkClosed);
        }
        self.pending_transactions.clear();
        self.recombiner.reset();
        self.outbound.clear();
    }

    /// Process one ACL data packet from the link
    ///
    /// Malformed ACL packets are returned as an error and otherwise ignored.
    /// Anything malformed above the ACL layer is logged and dropped.
    pub fn handle_acl(&mut self, data: &[u8], now: Instant) -> L2capResult<()> {
        let packet = AclPacket::parse(data).map_err(|e| {
            debug!("Dropping malformed ACL packet: {}", e);
            trace!("Dropped packet: {}", hex::encode(data));
            e
        })?;

        if packet.handle != self.config.handle {
            warn!(
                "Dropping ACL packet for handle 0x{:03x}, link is 0x{:03x}",
                packet.handle, self.config.handle
            );
            return Ok(());
        }

        if let Some(pdu) = self.recombiner.push(packet)? {
            self.handle_pdu(&pdu, now)?;
        }
        Ok(())
    }

    /// Route one complete basic frame by channel ID
    fn handle_pdu(&mut self, pdu: &[u8], now: Instant) -> L2capResult<()> {
        let header = L2capHeader::parse(pdu)?;
        trace!(
            "Received {} byte PDU on CID 0x{:04x}",
            pdu.len(),
            header.channel_id
        );

        match header.channel_id {
            L2CAP_SIGNALING_CID => self.handle_signaling_packet(pdu),
            cid => match self.channels.get_mut(&cid) {
                Some(channel) => {
                    channel.receive_pdu(pdu, now);
                    self.service_channel(cid);
                }
                None => debug!("Dropping PDU for unknown CID 0x{:04x}", cid),
            },
        }
        Ok(())
    }

    fn handle_signaling_packet(&mut self, pdu: &[u8]) {
        let payload = &pdu[L2CAP_BASIC_HEADER_SIZE..];

        if payload.len() > L2CAP_SIGNALING_MTU as usize {
            warn!("C-frame of {} bytes exceeds signaling MTU", payload.len());
            // Answer on the first command's identifier if we can read one
            let identifier = payload.get(1).copied().unwrap_or(0);
            if identifier != 0 {
                self.send_command_reject(
                    identifier,
                    L2CAP_REJECT_MTU_EXCEEDED,
                    L2CAP_SIGNALING_MTU.to_le_bytes().to_vec(),
                );
            }
            return;
        }

        let commands = match split_commands(payload) {
            Ok(commands) => commands,
            Err(e) => {
                warn!("Dropping malformed C-frame: {}", e);
                trace!("Dropped C-frame: {}", hex::encode(payload));
                return;
            }
        };

        for command in commands {
            let header = command.header;
            if header.identifier == 0 {
                debug!("Ignoring command 0x{:02x} with identifier 0", header.code);
                continue;
            }

            match SignalingMessage::parse(&command) {
                Ok(message) => {
                    trace!("Signaling <- {:?}", message);
                    self.handle_signaling_message(message);
                }
                // A reject is never answered with another reject
                Err(e) if header.code == L2CAP_COMMAND_REJECT => {
                    debug!("Dropping malformed Command Reject: {}", e);
                }
                Err(e) => {
                    debug!("Rejecting command 0x{:02x}: {}", header.code, e);
                    trace!("Rejected command: {}", hex::encode(command.params));
                    self.send_command_reject(
                        header.identifier,
                        L2CAP_REJECT_NOT_UNDERSTOOD,
                        Vec::new(),
                    );
                }
            }
        }
    }

    fn handle_signaling_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::CommandReject {
                identifier,
                reason,
                data,
            } => self.handle_command_reject(identifier, reason, &data),
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => self.handle_connection_request(identifier, psm, source_cid),
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                status,
            } => self.handle_connection_response(
                identifier,
                destination_cid,
                source_cid,
                result,
                status,
            ),
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
            } => self.handle_configure_request(identifier, destination_cid, flags, options),
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                flags,
                result,
                options,
            } => self.handle_configure_response(identifier, source_cid, flags, result, options),
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.handle_disconnection_request(identifier, destination_cid, source_cid),
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            } => self.handle_disconnection_response(identifier, destination_cid, source_cid),
            SignalingMessage::EchoRequest { identifier, data } => {
                self.send_signaling_message(SignalingMessage::EchoResponse { identifier, data });
            }
            SignalingMessage::EchoResponse { identifier, data } => {
                if self.take_transaction(identifier, SignalingTransaction::Echo) {
                    self.events.push_back(ChannelEvent::EchoResponse { data });
                }
            }
            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            } => self.handle_information_request(identifier, info_type),
            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            } => {
                if self.take_transaction(identifier, SignalingTransaction::Information(info_type)) {
                    self.events.push_back(ChannelEvent::InformationResponse {
                        info_type,
                        result,
                        data,
                    });
                }
            }
        }
    }

    /// Handle a connection request
    fn handle_connection_request(&mut self, identifier: SignalId, psm: u16, source_cid: ChannelId) {
        let respond = |manager: &mut Self, destination_cid: ChannelId, result: u16| {
            manager.send_signaling_message(SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                status: 0,
            });
        };

        let Some(config) = self.psm_registrations.get(&Psm::new(psm)).copied() else {
            debug!("Connection Request for unregistered PSM 0x{:04x}", psm);
            respond(self, L2CAP_NULL_CID, L2CAP_CONN_PSM_NOT_SUPPORTED);
            return;
        };

        if source_cid < L2CAP_DYNAMIC_CID_MIN {
            respond(self, L2CAP_NULL_CID, L2CAP_CONN_INVALID_SOURCE_CID);
            return;
        }
        if self.channels.values().any(|c| c.remote_cid() == source_cid) {
            respond(self, L2CAP_NULL_CID, L2CAP_CONN_SOURCE_CID_ALREADY_ALLOCATED);
            return;
        }

        let local_cid = match self.allocate_cid() {
            Ok(cid) => cid,
            Err(_) => {
                warn!("No CID available for incoming connection");
                respond(self, L2CAP_NULL_CID, L2CAP_CONN_NO_RESOURCES);
                return;
            }
        };

        let psm = Psm::new(psm);
        let mut channel = Channel::new(local_cid, psm, ChannelRole::Acceptor, config);
        channel.set_remote_cid(source_cid);
        channel.set_state(L2capChannelState::WaitConfig);
        self.channels.insert(local_cid, channel);

        info!(
            "Accepted connection to {} on CID 0x{:04x} (remote 0x{:04x})",
            psm, local_cid, source_cid
        );
        respond(self, local_cid, L2CAP_CONN_SUCCESS);
        self.send_configure_request(local_cid);
    }

    /// Handle a connection response
    fn handle_connection_response(
        &mut self,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
        result: u16,
        status: u16,
    ) {
        if !self.take_transaction(identifier, SignalingTransaction::Connect(source_cid)) {
            return;
        }
        if !self.channels.contains_key(&source_cid) {
            debug!("Connection Response for closed channel 0x{:04x}", source_cid);
            return;
        }

        match result {
            L2CAP_CONN_SUCCESS => {
                if let Some(channel) = self.channels.get_mut(&source_cid) {
                    channel.set_remote_cid(destination_cid);
                    channel.set_state(L2capChannelState::WaitConfig);
                }
                self.send_configure_request(source_cid);
            }
            L2CAP_CONN_PENDING => {
                debug!(
                    "Connection for 0x{:04x} pending (status 0x{:04x})",
                    source_cid, status
                );
                // The final response reuses the identifier
                self.pending_transactions
                    .insert(identifier, SignalingTransaction::Connect(source_cid));
            }
            refused => {
                info!(
                    "Connection for 0x{:04x} refused with result 0x{:04x}",
                    source_cid, refused
                );
                self.destroy_channel(source_cid, CloseReason::ConnectionRefused(refused));
            }
        }
    }

    fn handle_configure_request(
        &mut self,
        identifier: SignalId,
        destination_cid: ChannelId,
        flags: u16,
        options: ConfigOptions,
    ) {
        debug!("Handling Configure Request for CID 0x{:04x}", destination_cid);
        let Some(channel) = self.channels.get_mut(&destination_cid) else {
            warn!("Received Configure Request for unknown CID 0x{:04x}", destination_cid);
            self.send_invalid_cid_reject(identifier, destination_cid, L2CAP_NULL_CID);
            return;
        };

        match channel.state() {
            L2capChannelState::WaitConfig | L2capChannelState::Open => {}
            state => {
                debug!("Ignoring Configure Request in state {}", state);
                return;
            }
        }

        let remote_cid = channel.remote_cid();
        match channel.configuration_mut().on_request(flags, options) {
            RequestOutcome::Respond {
                flags,
                result,
                options,
            } => {
                self.send_signaling_message(SignalingMessage::ConfigureResponse {
                    identifier,
                    source_cid: remote_cid,
                    flags,
                    result: result.value(),
                    options,
                });
            }
            RequestOutcome::Disconnect(reason) => {
                self.disconnect_channel(destination_cid, reason);
                return;
            }
        }

        let needs_request = self
            .channels
            .get(&destination_cid)
            .is_some_and(|c| c.state() == L2capChannelState::WaitConfig && c.configuration().needs_request());
        if needs_request {
            self.send_configure_request(destination_cid);
        }
        self.try_open(destination_cid);
    }

    fn handle_configure_response(
        &mut self,
        identifier: SignalId,
        source_cid: ChannelId,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    ) {
        if !self.take_transaction(identifier, SignalingTransaction::Configure(source_cid)) {
            return;
        }
        let Some(channel) = self.channels.get_mut(&source_cid) else {
            return;
        };

        let result = ConfigureResult::from_u16(result);
        match channel.configuration_mut().on_response(flags, result, options) {
            ResponseOutcome::Wait => {
                // A Pending result is followed by the final response
                if result == ConfigureResult::Pending {
                    self.pending_transactions
                        .insert(identifier, SignalingTransaction::Configure(source_cid));
                }
            }
            ResponseOutcome::Accepted => self.try_open(source_cid),
            ResponseOutcome::Retry(options) => self.send_configure_options(source_cid, options),
            ResponseOutcome::Disconnect(reason) => self.disconnect_channel(source_cid, reason),
        }
    }

    fn handle_disconnection_request(
        &mut self,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    ) {
        let known = self
            .channels
            .get(&destination_cid)
            .is_some_and(|c| c.remote_cid() == source_cid);
        if !known {
            warn!(
                "Disconnection Request for unknown CID pair 0x{:04x}/0x{:04x}",
                destination_cid, source_cid
            );
            self.send_invalid_cid_reject(identifier, destination_cid, source_cid);
            return;
        }

        self.send_signaling_message(SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid,
            source_cid,
        });
        self.destroy_channel(destination_cid, CloseReason::RemoteRequest);
    }

    fn handle_disconnection_response(
        &mut self,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    ) {
        if !self.take_transaction(identifier, SignalingTransaction::Disconnect(source_cid)) {
            return;
        }
        debug!(
            "Disconnection of 0x{:04x} (remote 0x{:04x}) confirmed",
            source_cid, destination_cid
        );
        self.destroy_channel(source_cid, CloseReason::LocalRequest);
    }

    fn handle_information_request(&mut self, identifier: SignalId, info_type: u16) {
        let (result, data) = match info_type {
            L2CAP_INFO_EXTENDED_FEATURES => (
                L2CAP_INFO_SUCCESS,
                ExtendedFeatures::supported().bits().to_le_bytes().to_vec(),
            ),
            L2CAP_INFO_FIXED_CHANNELS => (
                L2CAP_INFO_SUCCESS,
                L2CAP_FIXED_CHANNELS_SUPPORTED.to_le_bytes().to_vec(),
            ),
            _ => (L2CAP_INFO_NOT_SUPPORTED, Vec::new()),
        };

        self.send_signaling_message(SignalingMessage::InformationResponse {
            identifier,
            info_type,
            result,
            data,
        });
    }

    fn handle_command_reject(&mut self, identifier: SignalId, reason: u16, data: &[u8]) {
        let Some(transaction) = self.pending_transactions.remove(&identifier) else {
            debug!("Command Reject for unknown identifier {}", identifier);
            return;
        };
        warn!(
            "Peer rejected {:?} with reason 0x{:04x} ({})",
            transaction,
            reason,
            hex::encode(data)
        );

        match transaction {
            SignalingTransaction::Connect(cid) => self.destroy_channel(
                cid,
                CloseReason::ProtocolViolation(format!(
                    "Connection Request rejected with reason 0x{:04x}",
                    reason
                )),
            ),
            SignalingTransaction::Configure(cid) => {
                self.disconnect_channel(cid, CloseReason::ConfigurationFailed)
            }
            // The peer no longer knows the channel
            SignalingTransaction::Disconnect(cid) => {
                self.destroy_channel(cid, CloseReason::LocalRequest)
            }
            SignalingTransaction::Echo | SignalingTransaction::Information(_) => {}
        }
    }

    /// Open the channel if both configuration directions are done
    fn try_open(&mut self, cid: ChannelId) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        if channel.state() != L2capChannelState::WaitConfig {
            return;
        }
        let Some(params) = channel.open() else {
            return;
        };

        info!(
            "L2CAP channel 0x{:04x} is OPEN in {} mode (MTU {}/{})",
            cid, params.mode, params.local_mtu, params.remote_mtu
        );
        let psm = channel.psm();
        self.events
            .push_back(ChannelEvent::Connected { cid, psm, params });
    }

    /// Move a channel's output to the link and its SDUs to the upper layer,
    /// then act on a failure of its data path
    fn service_channel(&mut self, cid: ChannelId) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };

        let mut pdus = Vec::new();
        while let Some(pdu) = channel.poll_pdu() {
            pdus.push(pdu);
        }
        while let Some(data) = channel.poll_sdu() {
            self.events.push_back(ChannelEvent::Data { cid, data });
        }
        let failure = channel.failure().cloned();

        for pdu in pdus {
            self.queue_pdu(&pdu);
        }

        if let Some(reason) = failure {
            let closing = self
                .channels
                .get(&cid)
                .is_some_and(|c| c.state() == L2capChannelState::WaitDisconnect);
            if !closing {
                self.disconnect_channel(cid, reason);
            }
        }
    }

    /// Start tearing a channel down with a Disconnection Request
    fn disconnect_channel(&mut self, cid: ChannelId, reason: CloseReason) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        if channel.remote_cid() == L2CAP_NULL_CID {
            self.destroy_channel(cid, reason);
            return;
        }
        if channel.state() == L2capChannelState::WaitDisconnect {
            return;
        }

        info!("Disconnecting channel 0x{:04x}: {}", cid, reason);
        let remote_cid = channel.remote_cid();
        channel.shutdown();
        channel.set_close_reason(reason);
        channel.set_state(L2capChannelState::WaitDisconnect);

        self.send_request(SignalingTransaction::Disconnect(cid), |identifier| {
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: remote_cid,
                source_cid: cid,
            }
        });
    }

    /// Forget a channel and tell the upper layer
    fn destroy_channel(&mut self, cid: ChannelId, reason: CloseReason) {
        let Some(mut channel) = self.channels.remove(&cid) else {
            return;
        };
        channel.shutdown();
        self.pending_transactions.retain(|_, t| match *t {
            SignalingTransaction::Connect(c)
            | SignalingTransaction::Configure(c)
            | SignalingTransaction::Disconnect(c) => c != cid,
            _ => true,
        });

        // A reason recorded when the teardown started wins
        let reason = channel.close_reason().cloned().unwrap_or(reason);
        info!("L2CAP channel 0x{:04x} closed: {}", cid, reason);
        self.events
            .push_back(ChannelEvent::Disconnected { cid, reason });
    }

    fn send_configure_request(&mut self, cid: ChannelId) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        let options = channel.configuration_mut().build_request();
        self.send_configure_options(cid, options);
    }

    fn send_configure_options(&mut self, cid: ChannelId, options: ConfigOptions) {
        let Some(remote_cid) = self.channels.get(&cid).map(Channel::remote_cid) else {
            return;
        };
        // A response to an earlier request no longer applies
        self.pending_transactions
            .retain(|_, t| *t != SignalingTransaction::Configure(cid));
        self.send_request(SignalingTransaction::Configure(cid), |identifier| {
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid: remote_cid,
                flags: 0,
                options,
            }
        });
    }

    fn send_invalid_cid_reject(&mut self, identifier: SignalId, local: ChannelId, remote: ChannelId) {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&local.to_le_bytes());
        data.extend_from_slice(&remote.to_le_bytes());
        self.send_command_reject(identifier, L2CAP_REJECT_INVALID_CID, data);
    }

    fn send_command_reject(&mut self, identifier: SignalId, reason: u16, data: Vec<u8>) {
        self.send_signaling_message(SignalingMessage::CommandReject {
            identifier,
            reason,
            data,
        });
    }

    /// Send a request and remember it until the matching response arrives
    fn send_request(
        &mut self,
        transaction: SignalingTransaction,
        build: impl FnOnce(SignalId) -> SignalingMessage,
    ) -> SignalId {
        let identifier = self.allocate_signal_id();
        self.pending_transactions.insert(identifier, transaction);
        self.send_signaling_message(build(identifier));
        identifier
    }

    /// Consume the transaction a response answers. Responses nobody asked
    /// for are dropped.
    fn take_transaction(&mut self, identifier: SignalId, expected: SignalingTransaction) -> bool {
        match self.pending_transactions.get(&identifier) {
            Some(transaction) if *transaction == expected => {
                self.pending_transactions.remove(&identifier);
                true
            }
            other => {
                debug!(
                    "Dropping response {} matching {:?}, expected {:?}",
                    identifier, other, expected
                );
                false
            }
        }
    }

    fn send_signaling_message(&mut self, message: SignalingMessage) {
        trace!("Signaling -> {:?}", message);
        let pdu = message.to_packet().to_bytes();
        self.queue_pdu(&pdu);
    }

    fn queue_pdu(&mut self, pdu: &[u8]) {
        self.outbound.extend(AclPacket::fragment(
            self.config.handle,
            pdu,
            self.config.acl_mtu,
        ));
    }
}

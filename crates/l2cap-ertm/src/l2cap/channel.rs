//! L2CAP Channel implementation
//!
//! A [`Channel`] is one connection-oriented endpoint on the link. It carries
//! the configuration session while the channel is being set up and, once both
//! directions are configured, a Basic or ERTM data path. Whether we opened
//! the channel or the peer did is recorded as a [`ChannelRole`]; both kinds
//! behave identically once open.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use log::{debug, trace, warn};

use super::config::{ConfigurationSession, NegotiatedParameters};
use super::ertm::ErtmEngine;
use super::packet::{EnhancedFrame, L2capPacket};
use super::psm::Psm;
use super::types::*;

/// How SDUs travel once the channel is open
enum DataPath {
    /// One SDU per basic frame, no acknowledgment
    Basic {
        outbound: VecDeque<Vec<u8>>,
        delivered: VecDeque<Vec<u8>>,
    },
    Ertm(Box<ErtmEngine>),
}

/// L2CAP Channel structure
pub struct Channel {
    /// Local Channel Identifier (CID)
    local_cid: ChannelId,
    /// Remote Channel Identifier (CID), zero until the peer names it
    remote_cid: ChannelId,
    psm: Psm,
    role: ChannelRole,
    state: L2capChannelState,
    config: ConfigurationSession,
    negotiated: Option<NegotiatedParameters>,
    data_path: Option<DataPath>,
    /// Reason recorded when we started tearing the channel down
    close_reason: Option<CloseReason>,
}

impl Channel {
    pub fn new(local_cid: ChannelId, psm: Psm, role: ChannelRole, config: ChannelConfig) -> Self {
        Self {
            local_cid,
            remote_cid: 0,
            psm,
            role,
            state: L2capChannelState::Closed,
            config: ConfigurationSession::new(config),
            negotiated: None,
            data_path: None,
            close_reason: None,
        }
    }

    /// Get the local Channel Identifier (CID)
    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    /// Get the remote Channel Identifier (CID)
    pub fn remote_cid(&self) -> ChannelId {
        self.remote_cid
    }

    pub(crate) fn set_remote_cid(&mut self, remote_cid: ChannelId) {
        self.remote_cid = remote_cid;
    }

    pub fn psm(&self) -> Psm {
        self.psm
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> L2capChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: L2capChannelState) {
        if self.state != state {
            debug!("Channel 0x{:04x}: {} -> {}", self.local_cid, self.state, state);
            self.state = state;
        }
    }

    /// Negotiation state for this channel
    pub fn configuration(&self) -> &ConfigurationSession {
        &self.config
    }

    pub(crate) fn configuration_mut(&mut self) -> &mut ConfigurationSession {
        &mut self.config
    }

    /// Parameters in force, available once the channel is open
    pub fn negotiated(&self) -> Option<&NegotiatedParameters> {
        self.negotiated.as_ref()
    }

    /// The ERTM engine of an open ERTM channel
    pub fn ertm(&self) -> Option<&ErtmEngine> {
        match &self.data_path {
            Some(DataPath::Ertm(engine)) => Some(engine),
            _ => None,
        }
    }

    pub(crate) fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub(crate) fn set_close_reason(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
    }

    /// Fix the negotiated parameters and start the data path
    ///
    /// Returns `None` while either configuration direction is outstanding.
    pub(crate) fn open(&mut self) -> Option<NegotiatedParameters> {
        let params = self.config.negotiated()?;

        let data_path = match params.mode {
            RetransmissionMode::EnhancedRetransmission => {
                DataPath::Ertm(Box::new(ErtmEngine::new(params.ertm, params.local_mtu)))
            }
            _ => DataPath::Basic {
                outbound: VecDeque::new(),
                delivered: VecDeque::new(),
            },
        };

        self.negotiated = Some(params);
        self.data_path = Some(data_path);
        self.set_state(L2capChannelState::Open);
        Some(params)
    }

    /// Queue an SDU for the peer
    pub fn send_sdu(&mut self, sdu: &[u8], now: Instant) -> L2capResult<()> {
        if self.state != L2capChannelState::Open {
            return Err(L2capError::NotConnected);
        }
        let params = self.negotiated.as_ref().ok_or(L2capError::NotConnected)?;
        if sdu.len() > params.remote_mtu as usize {
            return Err(L2capError::MtuExceeded);
        }

        match self.data_path.as_mut() {
            Some(DataPath::Basic { outbound, .. }) => {
                outbound.push_back(sdu.to_vec());
                Ok(())
            }
            Some(DataPath::Ertm(engine)) => engine.send_sdu(sdu, now),
            None => Err(L2capError::NotConnected),
        }
    }

    /// Process one complete basic frame addressed to this channel
    ///
    /// Malformed frames are logged and dropped without touching channel state.
    pub fn receive_pdu(&mut self, pdu: &[u8], now: Instant) {
        let (L2capChannelState::Open, Some(params)) = (self.state, self.negotiated) else {
            debug!(
                "Channel 0x{:04x} is {}, dropping {} byte PDU",
                self.local_cid,
                self.state,
                pdu.len()
            );
            return;
        };

        match self.data_path.as_mut() {
            Some(DataPath::Basic { delivered, .. }) => match L2capPacket::parse(pdu) {
                Ok(packet) if packet.payload.len() > params.local_mtu as usize => {
                    warn!(
                        "Channel 0x{:04x}: {} byte SDU exceeds MTU {}, dropping",
                        self.local_cid,
                        packet.payload.len(),
                        params.local_mtu
                    );
                }
                Ok(packet) => delivered.push_back(packet.payload),
                Err(e) => {
                    debug!("Channel 0x{:04x}: dropping malformed B-frame: {}", self.local_cid, e);
                    trace!("Dropped frame: {}", hex::encode(pdu));
                }
            },
            Some(DataPath::Ertm(engine)) => match EnhancedFrame::decode(pdu, params.fcs) {
                Ok((_, frame)) => engine.handle_frame(frame, now),
                Err(e) => {
                    debug!("Channel 0x{:04x}: dropping malformed frame: {}", self.local_cid, e);
                    trace!("Dropped frame: {}", hex::encode(pdu));
                }
            },
            None => {}
        }
    }

    /// Next encoded frame for the link
    pub fn poll_pdu(&mut self) -> Option<Vec<u8>> {
        let remote_cid = self.remote_cid;
        let fcs = self.negotiated.as_ref()?.fcs;
        match self.data_path.as_mut()? {
            DataPath::Basic { outbound, .. } => outbound
                .pop_front()
                .map(|sdu| L2capPacket::new(remote_cid, sdu).to_bytes()),
            DataPath::Ertm(engine) => engine
                .poll_transmit()
                .map(|frame| frame.encode(remote_cid, fcs)),
        }
    }

    /// Next SDU received from the peer
    pub fn poll_sdu(&mut self) -> Option<Vec<u8>> {
        match self.data_path.as_mut()? {
            DataPath::Basic { delivered, .. } => delivered.pop_front(),
            DataPath::Ertm(engine) => engine.poll_sdu(),
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.ertm().and_then(ErtmEngine::poll_timeout)
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(DataPath::Ertm(engine)) = self.data_path.as_mut() {
            engine.handle_timeout(now);
        }
    }

    /// Tell the peer we can (not) take more data. Basic channels have no
    /// flow control and ignore this.
    pub fn set_local_busy(&mut self, busy: bool, now: Instant) -> L2capResult<()> {
        match self.data_path.as_mut() {
            Some(DataPath::Ertm(engine)) => {
                engine.set_local_busy(busy, now);
                Ok(())
            }
            Some(DataPath::Basic { .. }) => Err(L2capError::NotSupported),
            None => Err(L2capError::NotConnected),
        }
    }

    /// Why the data path gave up on the channel, if it did
    pub fn failure(&self) -> Option<&CloseReason> {
        self.ertm().and_then(ErtmEngine::failure)
    }

    /// Stop timers and drop queued data
    pub(crate) fn shutdown(&mut self) {
        match self.data_path.as_mut() {
            Some(DataPath::Ertm(engine)) => engine.shutdown(),
            Some(DataPath::Basic { outbound, delivered }) => {
                outbound.clear();
                delivered.clear();
            }
            None => {}
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local_cid", &format_args!("0x{:04x}", self.local_cid))
            .field("remote_cid", &format_args!("0x{:04x}", self.remote_cid))
            .field("psm", &self.psm)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("mode", &self.config.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::config::RequestOutcome;
    use crate::l2cap::packet::SegmentationAndReassembly;

    const PSM: Psm = Psm::new(0x0033);

    fn open_channel(config: ChannelConfig, peer_request: ConfigOptions) -> Channel {
        let mut channel = Channel::new(0x0040, PSM, ChannelRole::Initiator, config);
        channel.set_remote_cid(0x0041);
        channel.set_state(L2capChannelState::WaitConfig);

        channel.configuration_mut().build_request();
        let outcome = channel.configuration_mut().on_request(0, peer_request);
        assert!(matches!(outcome, RequestOutcome::Respond { .. }));
        channel
            .configuration_mut()
            .on_response(0, ConfigureResult::Success, ConfigOptions::default());

        assert!(channel.open().is_some());
        channel
    }

    #[test]
    fn test_basic_channel_frames_sdus() {
        let mut channel = open_channel(ChannelConfig::default(), ConfigOptions::default());
        let now = Instant::now();

        channel.send_sdu(b"abc", now).unwrap();
        assert_eq!(
            channel.poll_pdu(),
            Some(vec![0x03, 0x00, 0x41, 0x00, b'a', b'b', b'c'])
        );
        assert_eq!(channel.poll_pdu(), None);

        channel.receive_pdu(&[0x02, 0x00, 0x40, 0x00, b'h', b'i'], now);
        assert_eq!(channel.poll_sdu(), Some(b"hi".to_vec()));

        channel.set_state(L2capChannelState::WaitDisconnect);
        channel.receive_pdu(&[0x02, 0x00, 0x40, 0x00, b'h', b'i'], now);
        assert_eq!(channel.poll_sdu(), None);
    }

    #[test]
    fn test_send_refused_before_open_and_above_mtu() {
        let now = Instant::now();
        let mut pending = Channel::new(0x0040, PSM, ChannelRole::Acceptor, ChannelConfig::default());
        assert!(matches!(
            pending.send_sdu(b"abc", now),
            Err(L2capError::NotConnected)
        ));

        let mut channel = open_channel(
            ChannelConfig::default(),
            ConfigOptions {
                mtu: Some(48),
                ..Default::default()
            },
        );
        assert!(matches!(
            channel.send_sdu(&[0u8; 49], now),
            Err(L2capError::MtuExceeded)
        ));
        assert!(channel.send_sdu(&[0u8; 48], now).is_ok());
    }

    #[test]
    fn test_ertm_channel_uses_remote_cid_and_fcs() {
        let request = ConfigOptions {
            retransmission: Some(RetransmissionFlowControl::ertm(&ErtmConfig::default())),
            fcs: Some(FcsType::Fcs16),
            ..Default::default()
        };
        let mut channel = open_channel(ChannelConfig::ertm(), request);
        let now = Instant::now();
        assert_eq!(channel.negotiated().map(|p| p.fcs), Some(FcsType::Fcs16));

        channel.send_sdu(b"abc", now).unwrap();
        let pdu = channel.poll_pdu().unwrap();
        let expected = EnhancedFrame::i_frame(
            0,
            0,
            false,
            SegmentationAndReassembly::Unsegmented,
            b"abc".to_vec(),
        )
        .encode(0x0041, FcsType::Fcs16);
        assert_eq!(pdu, expected);
        assert!(channel.poll_timeout().is_some());

        // Corrupted FCS is dropped without acknowledging anything
        let mut corrupt = EnhancedFrame::i_frame(
            0,
            1,
            false,
            SegmentationAndReassembly::Unsegmented,
            b"xyz".to_vec(),
        )
        .encode(0x0040, FcsType::Fcs16);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        channel.receive_pdu(&corrupt, now);
        assert_eq!(channel.poll_sdu(), None);
        assert_eq!(channel.ertm().unwrap().unacked_frames(), 1);
    }
}

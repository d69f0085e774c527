//! Configuration negotiation
//!
//! Each channel runs two independent negotiations: the peer accepting our
//! Configure Request (outbound) and us accepting the peer's (inbound). The
//! channel opens only once both have succeeded. The values that come out are
//! fixed for the life of the channel.

use super::constants::*;
use super::types::*;
use log::{debug, warn};
use std::time::Duration;

/// Progress of one direction of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing sent (outbound) or nothing accepted yet (inbound)
    Idle,
    /// Our Configure Request is waiting for a response
    RequestSent,
    /// This direction has been agreed
    Accepted,
}

/// What to do with a received Configure Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Answer with this Configure Response
    Respond {
        flags: u16,
        result: ConfigureResult,
        options: ConfigOptions,
    },
    /// Tear the channel down instead of answering
    Disconnect(CloseReason),
}

/// What to do after a received Configure Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Nothing to send yet
    Wait,
    /// The peer accepted our request
    Accepted,
    /// Send another Configure Request with these options
    Retry(ConfigOptions),
    /// Tear the channel down
    Disconnect(CloseReason),
}

/// ERTM parameters in force on an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErtmParameters {
    /// Unacknowledged I-frames we may have outstanding
    pub tx_window_size: u8,
    /// Transmissions per I-frame before giving up, 0 = unlimited
    pub max_transmit: u8,
    pub retransmission_timeout: Duration,
    pub monitor_timeout: Duration,
    /// Largest I-frame payload the peer accepts
    pub remote_mps: u16,
    /// Largest I-frame payload we accept
    pub local_mps: u16,
    /// Receive window we advertised
    pub rx_window_size: u8,
}

impl ErtmParameters {
    /// Parameters for a channel that never negotiated, built from local defaults
    pub fn from_config(config: &ErtmConfig) -> Self {
        Self {
            tx_window_size: config.tx_window_size,
            max_transmit: config.max_transmit,
            retransmission_timeout: config.retransmission_timeout(),
            monitor_timeout: config.monitor_timeout(),
            remote_mps: config.mps,
            local_mps: config.mps,
            rx_window_size: config.tx_window_size,
        }
    }
}

/// Result of a completed negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParameters {
    pub mode: RetransmissionMode,
    /// Largest SDU we accept
    pub local_mtu: u16,
    /// Largest SDU the peer accepts
    pub remote_mtu: u16,
    pub fcs: FcsType,
    pub flush_timeout: Option<u16>,
    pub ertm: ErtmParameters,
}

/// Per-channel negotiation state
#[derive(Debug, Clone)]
pub struct ConfigurationSession {
    local: ChannelConfig,
    /// Mode currently being proposed
    mode: RetransmissionMode,
    outbound: NegotiationState,
    inbound: NegotiationState,
    /// Options of our last Configure Request
    proposal: ConfigOptions,
    /// Fragments of a continued Configure Request from the peer
    pending_request: Option<ConfigOptions>,
    /// Fragments of a continued Configure Response from the peer
    pending_response: Option<ConfigOptions>,
    /// Accepted peer request
    peer_request: ConfigOptions,
    /// Accepted response to our request
    peer_response: ConfigOptions,
    attempts: u8,
}

impl ConfigurationSession {
    pub fn new(local: ChannelConfig) -> Self {
        Self {
            mode: local.mode,
            local,
            outbound: NegotiationState::Idle,
            inbound: NegotiationState::Idle,
            proposal: ConfigOptions::default(),
            pending_request: None,
            pending_response: None,
            peer_request: ConfigOptions::default(),
            peer_response: ConfigOptions::default(),
            attempts: 0,
        }
    }

    pub fn outbound(&self) -> NegotiationState {
        self.outbound
    }

    pub fn inbound(&self) -> NegotiationState {
        self.inbound
    }

    pub fn mode(&self) -> RetransmissionMode {
        self.mode
    }

    /// Both directions agreed
    pub fn is_complete(&self) -> bool {
        self.outbound == NegotiationState::Accepted && self.inbound == NegotiationState::Accepted
    }

    /// Our side still has to send a Configure Request
    pub fn needs_request(&self) -> bool {
        self.outbound == NegotiationState::Idle
    }

    /// Build our Configure Request from the local preferences
    pub fn build_request(&mut self) -> ConfigOptions {
        let mut options = ConfigOptions {
            mtu: Some(self.local.mtu),
            ..Default::default()
        };

        if self.mode == RetransmissionMode::EnhancedRetransmission {
            let mut rfc = RetransmissionFlowControl::ertm(&self.local.ertm);
            // Time-outs are chosen by the responder
            rfc.retransmission_timeout = 0;
            rfc.monitor_timeout = 0;
            options.retransmission = Some(rfc);
            options.fcs = Some(self.local.fcs);
        }

        self.proposal = options.clone();
        self.outbound = NegotiationState::RequestSent;
        self.attempts += 1;
        options
    }

    /// Handle one Configure Request PDU from the peer
    pub fn on_request(&mut self, flags: u16, options: ConfigOptions) -> RequestOutcome {
        if self.inbound == NegotiationState::Accepted {
            warn!("Rejecting reconfiguration of an already configured channel");
            return RequestOutcome::Respond {
                flags: 0,
                result: ConfigureResult::Rejected,
                options: ConfigOptions::default(),
            };
        }

        let merged = match self.pending_request.take() {
            Some(mut pending) => {
                pending.merge(options);
                pending
            }
            None => options,
        };

        if flags & L2CAP_CONF_FLAG_CONTINUATION != 0 {
            debug!("Configure Request continues, holding options");
            self.pending_request = Some(merged);
            return RequestOutcome::Respond {
                flags: L2CAP_CONF_FLAG_CONTINUATION,
                result: ConfigureResult::Success,
                options: ConfigOptions::default(),
            };
        }

        self.evaluate_request(merged)
    }

    fn evaluate_request(&mut self, request: ConfigOptions) -> RequestOutcome {
        // Anything we do not implement and the peer did not mark as a hint
        let mut unknown: Vec<UnknownOption> = request
            .unknown
            .iter()
            .filter(|o| !o.hint)
            .cloned()
            .collect();
        if let Some(window) = request.ext_window_size {
            if !request.is_hint(L2CAP_CONF_EXT_WINDOW) {
                unknown.push(UnknownOption {
                    option_type: L2CAP_CONF_EXT_WINDOW,
                    hint: false,
                    data: window.to_le_bytes().to_vec(),
                });
            }
        }
        if !unknown.is_empty() {
            debug!("Configure Request carries {} unknown options", unknown.len());
            return RequestOutcome::Respond {
                flags: 0,
                result: ConfigureResult::UnknownOptions,
                options: ConfigOptions {
                    unknown,
                    ..Default::default()
                },
            };
        }

        let mut counter = ConfigOptions::default();
        let requested = request
            .retransmission
            .unwrap_or_else(RetransmissionFlowControl::basic);

        if !requested.mode.is_supported() {
            counter.retransmission = Some(self.preferred_rfc());
        } else if requested.mode != self.mode {
            match (self.mode, requested.mode) {
                (RetransmissionMode::EnhancedRetransmission, RetransmissionMode::Basic) => {
                    if self.local.mode_mandatory {
                        return RequestOutcome::Disconnect(CloseReason::ProtocolViolation(
                            "peer requested Basic mode on an ERTM-only channel".into(),
                        ));
                    }
                    debug!("Falling back to Basic mode at the peer's request");
                    self.mode = RetransmissionMode::Basic;
                    // Our ERTM proposal no longer matches, propose again
                    self.outbound = NegotiationState::Idle;
                    self.pending_response = None;
                }
                _ => counter.retransmission = Some(self.preferred_rfc()),
            }
        }

        if let Some(mtu) = request.mtu {
            if mtu < L2CAP_MIN_MTU {
                counter.mtu = Some(L2CAP_MIN_MTU);
            }
        }

        if counter.retransmission.is_none()
            && requested.mode == RetransmissionMode::EnhancedRetransmission
        {
            let window_ok = (1..=L2CAP_MAX_TX_WINDOW).contains(&requested.tx_window_size);
            if !window_ok || requested.max_pdu_size == 0 {
                let mut rfc = requested;
                rfc.tx_window_size = requested.tx_window_size.clamp(1, L2CAP_MAX_TX_WINDOW);
                if rfc.max_pdu_size == 0 {
                    rfc.max_pdu_size = self.local.ertm.mps;
                }
                counter.retransmission = Some(rfc);
            }
        }

        if !counter.is_empty() {
            debug!("Configure Request has unacceptable parameters: {:?}", counter);
            return RequestOutcome::Respond {
                flags: 0,
                result: ConfigureResult::UnacceptableParameters,
                options: counter,
            };
        }

        let mut response = ConfigOptions::default();
        if requested.mode == RetransmissionMode::EnhancedRetransmission {
            // Echo the peer's values and fill in the time-outs it should use
            let mut rfc = requested;
            rfc.retransmission_timeout = self.local.ertm.retransmission_timeout;
            rfc.monitor_timeout = self.local.ertm.monitor_timeout;
            response.retransmission = Some(rfc);
        }

        self.peer_request = request;
        self.inbound = NegotiationState::Accepted;

        RequestOutcome::Respond {
            flags: 0,
            result: ConfigureResult::Success,
            options: response,
        }
    }

    /// Handle one Configure Response PDU from the peer
    pub fn on_response(
        &mut self,
        flags: u16,
        result: ConfigureResult,
        options: ConfigOptions,
    ) -> ResponseOutcome {
        if self.outbound != NegotiationState::RequestSent {
            warn!("Unexpected Configure Response in state {:?}", self.outbound);
            return ResponseOutcome::Wait;
        }

        let merged = match self.pending_response.take() {
            Some(mut pending) => {
                pending.merge(options);
                pending
            }
            None => options,
        };

        if flags & L2CAP_CONF_FLAG_CONTINUATION != 0 {
            // More options follow once we ask with an empty request
            self.pending_response = Some(merged);
            return ResponseOutcome::Retry(ConfigOptions::default());
        }

        match result {
            ConfigureResult::Success => {
                if let Some(rfc) = merged.retransmission {
                    if rfc.mode != self.mode {
                        if let Err(reason) = self.switch_mode(rfc.mode) {
                            return ResponseOutcome::Disconnect(reason);
                        }
                        return self.resend();
                    }
                }
                self.peer_response = merged;
                self.outbound = NegotiationState::Accepted;
                ResponseOutcome::Accepted
            }
            ConfigureResult::Pending => ResponseOutcome::Wait,
            ConfigureResult::UnacceptableParameters => {
                if self.attempts >= L2CAP_MAX_CONFIG_ATTEMPTS {
                    return ResponseOutcome::Disconnect(CloseReason::ConfigurationFailed);
                }
                self.adopt_counter_proposal(merged)
            }
            ConfigureResult::UnknownOptions => {
                if self.attempts >= L2CAP_MAX_CONFIG_ATTEMPTS {
                    return ResponseOutcome::Disconnect(CloseReason::ConfigurationFailed);
                }
                let types: Vec<u8> = merged.unknown.iter().map(|o| o.option_type).collect();
                let before = self.proposal.clone();
                self.proposal.remove_types(&types);
                if self.proposal == before {
                    return ResponseOutcome::Disconnect(CloseReason::ConfigurationFailed);
                }
                self.resend()
            }
            ConfigureResult::Rejected | ConfigureResult::FlowSpecRejected => {
                ResponseOutcome::Disconnect(CloseReason::ConfigurationFailed)
            }
        }
    }

    fn adopt_counter_proposal(&mut self, counter: ConfigOptions) -> ResponseOutcome {
        if let Some(rfc) = counter.retransmission {
            if rfc.mode != self.mode {
                if let Err(reason) = self.switch_mode(rfc.mode) {
                    return ResponseOutcome::Disconnect(reason);
                }
            }
            match self.mode {
                RetransmissionMode::EnhancedRetransmission => {
                    let mut adopted = RetransmissionFlowControl::ertm(&self.local.ertm);
                    adopted.tx_window_size = rfc.tx_window_size.clamp(1, L2CAP_MAX_TX_WINDOW);
                    adopted.max_transmit = rfc.max_transmit;
                    if rfc.max_pdu_size != 0 {
                        adopted.max_pdu_size = rfc.max_pdu_size;
                    }
                    adopted.retransmission_timeout = 0;
                    adopted.monitor_timeout = 0;
                    self.local.ertm.tx_window_size = adopted.tx_window_size;
                    self.local.ertm.mps = adopted.max_pdu_size;
                    self.proposal.retransmission = Some(adopted);
                    if self.proposal.fcs.is_none() {
                        self.proposal.fcs = Some(self.local.fcs);
                    }
                }
                _ => {
                    self.proposal.retransmission = None;
                    self.proposal.fcs = None;
                }
            }
        }

        if let Some(mtu) = counter.mtu {
            if mtu < L2CAP_MIN_MTU {
                return ResponseOutcome::Disconnect(CloseReason::ConfigurationFailed);
            }
            self.local.mtu = mtu;
            self.proposal.mtu = Some(mtu);
        }
        if let Some(flush_timeout) = counter.flush_timeout {
            self.proposal.flush_timeout = Some(flush_timeout);
        }
        if let Some(fcs) = counter.fcs {
            if self.mode == RetransmissionMode::EnhancedRetransmission {
                self.local.fcs = fcs;
                self.proposal.fcs = Some(fcs);
            }
        }

        self.resend()
    }

    /// The peer wants a different mode than we proposed
    fn switch_mode(&mut self, peer_mode: RetransmissionMode) -> Result<(), CloseReason> {
        match (self.mode, peer_mode) {
            (RetransmissionMode::EnhancedRetransmission, RetransmissionMode::Basic) => {
                if self.local.mode_mandatory {
                    return Err(CloseReason::ProtocolViolation(
                        "peer refused ERTM on an ERTM-only channel".into(),
                    ));
                }
                debug!("Peer refused ERTM, falling back to Basic mode");
                self.mode = RetransmissionMode::Basic;
                self.proposal.retransmission = None;
                self.proposal.fcs = None;
                Ok(())
            }
            (RetransmissionMode::Basic, RetransmissionMode::EnhancedRetransmission) => {
                debug!("Peer asked for ERTM, switching");
                self.mode = RetransmissionMode::EnhancedRetransmission;
                let mut rfc = RetransmissionFlowControl::ertm(&self.local.ertm);
                rfc.retransmission_timeout = 0;
                rfc.monitor_timeout = 0;
                self.proposal.retransmission = Some(rfc);
                self.proposal.fcs = Some(self.local.fcs);
                Ok(())
            }
            _ => Err(CloseReason::ConfigurationFailed),
        }
    }

    fn resend(&mut self) -> ResponseOutcome {
        self.outbound = NegotiationState::RequestSent;
        self.attempts += 1;
        ResponseOutcome::Retry(self.proposal.clone())
    }

    fn preferred_rfc(&self) -> RetransmissionFlowControl {
        match self.mode {
            RetransmissionMode::EnhancedRetransmission => {
                RetransmissionFlowControl::ertm(&self.local.ertm)
            }
            _ => RetransmissionFlowControl::basic(),
        }
    }

    /// Parameters in force once both directions are accepted
    pub fn negotiated(&self) -> Option<NegotiatedParameters> {
        if !self.is_complete() {
            return None;
        }

        let ertm = self.mode == RetransmissionMode::EnhancedRetransmission;
        let fcs = if ertm
            && (self.proposal.fcs == Some(FcsType::Fcs16)
                || self.peer_request.fcs == Some(FcsType::Fcs16))
        {
            FcsType::Fcs16
        } else {
            FcsType::NoFcs
        };

        let mut params = ErtmParameters::from_config(&self.local.ertm);
        if let Some(rfc) = self.peer_request.retransmission {
            if ertm {
                params.tx_window_size = rfc.tx_window_size;
                params.max_transmit = rfc.max_transmit;
                params.remote_mps = rfc.max_pdu_size;
            }
        }
        if let Some(rfc) = self.peer_response.retransmission {
            if rfc.retransmission_timeout != 0 {
                params.retransmission_timeout =
                    Duration::from_millis(rfc.retransmission_timeout as u64);
            }
            if rfc.monitor_timeout != 0 {
                params.monitor_timeout = Duration::from_millis(rfc.monitor_timeout as u64);
            }
        }

        Some(NegotiatedParameters {
            mode: self.mode,
            local_mtu: self.proposal.mtu.unwrap_or(L2CAP_DEFAULT_MTU),
            remote_mtu: self.peer_request.mtu.unwrap_or(L2CAP_DEFAULT_MTU),
            fcs,
            flush_timeout: self.peer_request.flush_timeout,
            ertm: params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ertm_request(window: u8, max_transmit: u8) -> ConfigOptions {
        ConfigOptions {
            retransmission: Some(RetransmissionFlowControl {
                mode: RetransmissionMode::EnhancedRetransmission,
                tx_window_size: window,
                max_transmit,
                retransmission_timeout: 0,
                monitor_timeout: 0,
                max_pdu_size: 1010,
            }),
            fcs: Some(FcsType::NoFcs),
            ..Default::default()
        }
    }

    fn success() -> ConfigOptions {
        ConfigOptions::default()
    }

    #[test]
    fn test_basic_negotiation_completes() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());
        let request = session.build_request();
        assert_eq!(request.mtu, Some(L2CAP_DEFAULT_MTU));
        assert!(request.retransmission.is_none());
        assert_eq!(session.outbound(), NegotiationState::RequestSent);

        let outcome = session.on_request(
            0,
            ConfigOptions {
                mtu: Some(0x1234),
                ..Default::default()
            },
        );
        assert!(matches!(
            outcome,
            RequestOutcome::Respond {
                result: ConfigureResult::Success,
                ..
            }
        ));
        assert!(!session.is_complete());

        assert_eq!(
            session.on_response(0, ConfigureResult::Success, success()),
            ResponseOutcome::Accepted
        );
        assert!(session.is_complete());

        let params = session.negotiated().unwrap();
        assert_eq!(params.mode, RetransmissionMode::Basic);
        assert_eq!(params.remote_mtu, 0x1234);
        assert_eq!(params.local_mtu, L2CAP_DEFAULT_MTU);
        assert_eq!(params.fcs, FcsType::NoFcs);
    }

    #[test]
    fn test_mtu_below_floor_is_unacceptable() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());
        let outcome = session.on_request(
            0,
            ConfigOptions {
                mtu: Some(20),
                ..Default::default()
            },
        );

        match outcome {
            RequestOutcome::Respond {
                result, options, ..
            } => {
                assert_eq!(result, ConfigureResult::UnacceptableParameters);
                assert_eq!(options.mtu, Some(L2CAP_MIN_MTU));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.inbound(), NegotiationState::Idle);

        // The 48 byte minimum itself is fine
        let outcome = session.on_request(
            0,
            ConfigOptions {
                mtu: Some(48),
                ..Default::default()
            },
        );
        assert!(matches!(
            outcome,
            RequestOutcome::Respond {
                result: ConfigureResult::Success,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_mandatory_options_are_listed() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());

        let mut request = ConfigOptions {
            mtu: Some(100),
            ext_window_size: Some(20),
            ..Default::default()
        };
        request.unknown.push(UnknownOption {
            option_type: 0x7A,
            hint: true,
            data: vec![1],
        });

        match session.on_request(0, request) {
            RequestOutcome::Respond {
                result, options, ..
            } => {
                assert_eq!(result, ConfigureResult::UnknownOptions);
                // Only the mandatory extended window option, not the hint
                assert_eq!(options.unknown.len(), 1);
                assert_eq!(options.unknown[0].option_type, L2CAP_CONF_EXT_WINDOW);
                assert_eq!(options.unknown[0].data, vec![20, 0]);
                assert!(options.mtu.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // Nothing from that request was applied
        assert_eq!(session.inbound(), NegotiationState::Idle);
    }

    #[test]
    fn test_unknown_hint_options_are_ignored() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());
        let request = ConfigOptions {
            ext_window_size: Some(20),
            hints: vec![L2CAP_CONF_EXT_WINDOW],
            ..Default::default()
        };

        assert!(matches!(
            session.on_request(0, request),
            RequestOutcome::Respond {
                result: ConfigureResult::Success,
                ..
            }
        ));
    }

    #[test]
    fn test_continuation_accumulates_options() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());

        let first = session.on_request(
            L2CAP_CONF_FLAG_CONTINUATION,
            ConfigOptions {
                mtu: Some(0x1234),
                ..Default::default()
            },
        );
        assert_eq!(
            first,
            RequestOutcome::Respond {
                flags: L2CAP_CONF_FLAG_CONTINUATION,
                result: ConfigureResult::Success,
                options: ConfigOptions::default(),
            }
        );
        assert_eq!(session.inbound(), NegotiationState::Idle);

        let second = session.on_request(
            0,
            ConfigOptions {
                flush_timeout: Some(0xFFFF),
                ..Default::default()
            },
        );
        assert!(matches!(
            second,
            RequestOutcome::Respond {
                result: ConfigureResult::Success,
                flags: 0,
                ..
            }
        ));

        session.build_request();
        session.on_response(0, ConfigureResult::Success, success());
        let params = session.negotiated().unwrap();
        assert_eq!(params.remote_mtu, 0x1234);
        assert_eq!(params.flush_timeout, Some(0xFFFF));
    }

    #[test]
    fn test_mandatory_ertm_disconnects_on_basic_request() {
        let mut session = ConfigurationSession::new(ChannelConfig::ertm_mandatory());
        session.build_request();

        let outcome = session.on_request(
            0,
            ConfigOptions {
                retransmission: Some(RetransmissionFlowControl::basic()),
                ..Default::default()
            },
        );
        assert!(matches!(
            outcome,
            RequestOutcome::Disconnect(CloseReason::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_mandatory_ertm_disconnects_when_peer_counters_with_basic() {
        let mut session = ConfigurationSession::new(ChannelConfig::ertm_mandatory());
        session.build_request();

        let counter = ConfigOptions {
            retransmission: Some(RetransmissionFlowControl::basic()),
            ..Default::default()
        };
        assert!(matches!(
            session.on_response(0, ConfigureResult::UnacceptableParameters, counter),
            ResponseOutcome::Disconnect(CloseReason::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_optional_ertm_falls_back_to_basic() {
        let mut session = ConfigurationSession::new(ChannelConfig::ertm());
        let request = session.build_request();
        assert_eq!(
            request.retransmission.map(|r| r.mode),
            Some(RetransmissionMode::EnhancedRetransmission)
        );

        let counter = ConfigOptions {
            retransmission: Some(RetransmissionFlowControl::basic()),
            ..Default::default()
        };
        match session.on_response(0, ConfigureResult::UnacceptableParameters, counter) {
            ResponseOutcome::Retry(options) => {
                assert!(options.retransmission.is_none());
                assert!(options.fcs.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.mode(), RetransmissionMode::Basic);
    }

    #[test]
    fn test_ertm_parameters_follow_peer_request_and_response() {
        let mut session = ConfigurationSession::new(ChannelConfig::ertm());
        let request = session.build_request();
        let rfc = request.retransmission.unwrap();
        assert_eq!(rfc.retransmission_timeout, 0);
        assert_eq!(rfc.monitor_timeout, 0);

        match session.on_request(0, ertm_request(3, 5)) {
            RequestOutcome::Respond {
                result, options, ..
            } => {
                assert_eq!(result, ConfigureResult::Success);
                let echoed = options.retransmission.unwrap();
                assert_eq!(echoed.tx_window_size, 3);
                assert_eq!(echoed.retransmission_timeout, 2000);
                assert_eq!(echoed.monitor_timeout, 12000);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let mut response_rfc = RetransmissionFlowControl::ertm(&ErtmConfig::default());
        response_rfc.retransmission_timeout = 1000;
        response_rfc.monitor_timeout = 10;
        let response = ConfigOptions {
            retransmission: Some(response_rfc),
            ..Default::default()
        };
        assert_eq!(
            session.on_response(0, ConfigureResult::Success, response),
            ResponseOutcome::Accepted
        );

        let params = session.negotiated().unwrap();
        assert_eq!(params.mode, RetransmissionMode::EnhancedRetransmission);
        assert_eq!(params.ertm.tx_window_size, 3);
        assert_eq!(params.ertm.max_transmit, 5);
        assert_eq!(params.ertm.retransmission_timeout, Duration::from_millis(1000));
        assert_eq!(params.ertm.monitor_timeout, Duration::from_millis(10));
        assert_eq!(params.ertm.rx_window_size, L2CAP_ERTM_DEFAULT_TX_WINDOW);
        assert_eq!(params.fcs, FcsType::NoFcs);
    }

    #[test]
    fn test_fcs_enabled_when_either_side_requests_it() {
        let mut session = ConfigurationSession::new(ChannelConfig::ertm());
        session.build_request();

        let mut request = ertm_request(10, 20);
        request.fcs = Some(FcsType::Fcs16);
        session.on_request(0, request);
        session.on_response(0, ConfigureResult::Success, success());

        assert_eq!(session.negotiated().unwrap().fcs, FcsType::Fcs16);
    }

    #[test]
    fn test_unsupported_mode_gets_counter_proposal() {
        let mut session = ConfigurationSession::new(ChannelConfig::ertm());
        let request = ConfigOptions {
            retransmission: Some(RetransmissionFlowControl {
                mode: RetransmissionMode::Streaming,
                ..RetransmissionFlowControl::basic()
            }),
            ..Default::default()
        };

        match session.on_request(0, request) {
            RequestOutcome::Respond {
                result, options, ..
            } => {
                assert_eq!(result, ConfigureResult::UnacceptableParameters);
                assert_eq!(
                    options.retransmission.map(|r| r.mode),
                    Some(RetransmissionMode::EnhancedRetransmission)
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_reconfiguration_is_rejected() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());
        session.build_request();
        session.on_request(0, ConfigOptions::default());
        session.on_response(0, ConfigureResult::Success, success());
        assert!(session.is_complete());

        assert!(matches!(
            session.on_request(0, ConfigOptions::default()),
            RequestOutcome::Respond {
                result: ConfigureResult::Rejected,
                ..
            }
        ));
        // Negotiated values are unchanged
        assert!(session.is_complete());
    }

    #[test]
    fn test_retry_after_unacceptable_then_give_up() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());
        session.build_request();

        let counter = ConfigOptions {
            mtu: Some(100),
            ..Default::default()
        };
        for _ in 1..L2CAP_MAX_CONFIG_ATTEMPTS {
            match session.on_response(0, ConfigureResult::UnacceptableParameters, counter.clone()) {
                ResponseOutcome::Retry(options) => assert_eq!(options.mtu, Some(100)),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(
            session.on_response(0, ConfigureResult::UnacceptableParameters, counter),
            ResponseOutcome::Disconnect(CloseReason::ConfigurationFailed)
        );
    }

    #[test]
    fn test_unknown_options_response_drops_listed_option() {
        let mut session = ConfigurationSession::new(ChannelConfig::ertm());
        session.build_request();

        let response = ConfigOptions {
            unknown: vec![UnknownOption {
                option_type: L2CAP_CONF_FCS,
                hint: false,
                data: vec![0],
            }],
            ..Default::default()
        };
        match session.on_response(0, ConfigureResult::UnknownOptions, response) {
            ResponseOutcome::Retry(options) => {
                assert!(options.fcs.is_none());
                assert!(options.retransmission.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_continued_response_requests_more() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());
        session.build_request();

        assert_eq!(
            session.on_response(L2CAP_CONF_FLAG_CONTINUATION, ConfigureResult::Success, success()),
            ResponseOutcome::Retry(ConfigOptions::default())
        );
        assert_eq!(
            session.on_response(0, ConfigureResult::Success, success()),
            ResponseOutcome::Accepted
        );
    }

    #[test]
    fn test_rejected_response_disconnects() {
        let mut session = ConfigurationSession::new(ChannelConfig::default());
        session.build_request();
        assert_eq!(
            session.on_response(0, ConfigureResult::Rejected, success()),
            ResponseOutcome::Disconnect(CloseReason::ConfigurationFailed)
        );
    }
}

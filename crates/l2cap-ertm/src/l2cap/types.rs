//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use super::constants::*;
use crate::error::CodecError;
use bitflags::bitflags;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Channel identifier
pub type ChannelId = u16;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Retransmission attempts exhausted")]
    Timeout,

    #[error("Invalid channel identifier 0x{0:04x}")]
    InvalidCid(u16),

    #[error("Channel 0x{0:04x} not found")]
    ChannelNotFound(ChannelId),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("MTU exceeded")]
    MtuExceeded,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("PSM not registered")]
    PsmNotRegistered,

    #[error("Connection not established")]
    NotConnected,
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Why a channel was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The local upper layer asked for the close
    LocalRequest,
    /// The peer sent a Disconnection Request
    RemoteRequest,
    /// Retransmission or poll attempts exceeded max-transmit
    Timeout,
    /// The peer broke the ERTM or configuration protocol
    ProtocolViolation(String),
    /// Configuration could not converge
    ConfigurationFailed,
    /// The peer refused the Connection Request with this result code
    ConnectionRefused(u16),
    /// The underlying ACL link went away
    LinkClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalRequest => write!(f, "closed locally"),
            Self::RemoteRequest => write!(f, "closed by peer"),
            Self::Timeout => write!(f, "max transmit exceeded"),
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
            Self::ConfigurationFailed => write!(f, "configuration failed"),
            Self::ConnectionRefused(result) => write!(f, "connection refused (0x{:04x})", result),
            Self::LinkClosed => write!(f, "link closed"),
        }
    }
}

/// Quality of Service (QoS) Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosFlowSpec {
    /// QoS service type
    pub service_type: u8,
    /// Token rate (bytes/second)
    pub token_rate: u32,
    /// Token bucket size (bytes)
    pub token_bucket_size: u32,
    /// Peak bandwidth (bytes/second)
    pub peak_bandwidth: u32,
    /// Latency (microseconds)
    pub latency: u32,
    /// Delay variation (microseconds)
    pub delay_variation: u32,
}

impl Default for QosFlowSpec {
    fn default() -> Self {
        Self {
            service_type: 0x01, // Best effort
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: 0xFFFFFFFF,
            delay_variation: 0xFFFFFFFF,
        }
    }
}

/// Retransmission and Flow Control modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmissionMode {
    /// Basic L2CAP mode (no retransmission or flow control)
    Basic = 0,
    /// Retransmission mode
    Retransmission = 1,
    /// Flow control mode
    FlowControl = 2,
    /// Enhanced Retransmission mode
    EnhancedRetransmission = 3,
    /// Streaming mode
    Streaming = 4,
}

impl RetransmissionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Basic),
            1 => Some(Self::Retransmission),
            2 => Some(Self::FlowControl),
            3 => Some(Self::EnhancedRetransmission),
            4 => Some(Self::Streaming),
            _ => None,
        }
    }

    /// Modes this implementation can run a channel in
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Basic | Self::EnhancedRetransmission)
    }
}

impl fmt::Display for RetransmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "Basic"),
            Self::Retransmission => write!(f, "Retransmission"),
            Self::FlowControl => write!(f, "Flow Control"),
            Self::EnhancedRetransmission => write!(f, "ERTM"),
            Self::Streaming => write!(f, "Streaming"),
        }
    }
}

/// Retransmission and Flow Control option
///
/// Field order on the wire: mode, TxWindow, MaxTransmit, retransmission
/// time-out, monitor time-out, MPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmissionFlowControl {
    pub mode: RetransmissionMode,
    /// Transmit window size (1..=63)
    pub tx_window_size: u8,
    /// Transmissions of a single I-frame before the channel is closed, 0 = unlimited
    pub max_transmit: u8,
    /// Retransmission time-out (ms)
    pub retransmission_timeout: u16,
    /// Monitor time-out (ms)
    pub monitor_timeout: u16,
    /// Maximum PDU payload size
    pub max_pdu_size: u16,
}

impl RetransmissionFlowControl {
    /// An RFC option selecting Basic mode
    pub fn basic() -> Self {
        Self {
            mode: RetransmissionMode::Basic,
            tx_window_size: 0,
            max_transmit: 0,
            retransmission_timeout: 0,
            monitor_timeout: 0,
            max_pdu_size: 0,
        }
    }

    /// An RFC option selecting ERTM with the given parameters
    pub fn ertm(config: &ErtmConfig) -> Self {
        Self {
            mode: RetransmissionMode::EnhancedRetransmission,
            tx_window_size: config.tx_window_size,
            max_transmit: config.max_transmit,
            retransmission_timeout: config.retransmission_timeout,
            monitor_timeout: config.monitor_timeout,
            max_pdu_size: config.mps,
        }
    }
}

impl Default for RetransmissionFlowControl {
    fn default() -> Self {
        Self::basic()
    }
}

/// Frame Check Sequence option value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FcsType {
    #[default]
    NoFcs = 0x00,
    Fcs16 = 0x01,
}

impl FcsType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::NoFcs,
            // Anything else selects the default 16-bit FCS
            _ => Self::Fcs16,
        }
    }

    /// Bytes appended to each I/S-frame
    pub fn size(&self) -> usize {
        match self {
            Self::NoFcs => 0,
            Self::Fcs16 => L2CAP_FCS_SIZE,
        }
    }
}

/// A configuration option this implementation does not interpret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOption {
    /// Option type without the hint bit
    pub option_type: u8,
    pub hint: bool,
    pub data: Vec<u8>,
}

/// L2CAP Configuration Options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
    /// Quality of Service
    pub qos: Option<QosFlowSpec>,
    /// Retransmission and Flow Control
    pub retransmission: Option<RetransmissionFlowControl>,
    /// Frame Check Sequence
    pub fcs: Option<FcsType>,
    /// Extended Window Size
    pub ext_window_size: Option<u16>,
    /// Known option types that arrived with the hint bit set
    pub hints: Vec<u8>,
    /// Options kept as raw TLVs
    pub unknown: Vec<UnknownOption>,
}

impl ConfigOptions {
    pub fn is_empty(&self) -> bool {
        self.mtu.is_none()
            && self.flush_timeout.is_none()
            && self.qos.is_none()
            && self.retransmission.is_none()
            && self.fcs.is_none()
            && self.ext_window_size.is_none()
            && self.unknown.is_empty()
    }

    /// Whether a known option type was flagged as a hint
    pub fn is_hint(&self, option_type: u8) -> bool {
        self.hints.contains(&option_type)
    }

    /// Fold a later fragment of a continued request into this one
    pub fn merge(&mut self, other: ConfigOptions) {
        if other.mtu.is_some() {
            self.mtu = other.mtu;
        }
        if other.flush_timeout.is_some() {
            self.flush_timeout = other.flush_timeout;
        }
        if other.qos.is_some() {
            self.qos = other.qos;
        }
        if other.retransmission.is_some() {
            self.retransmission = other.retransmission;
        }
        if other.fcs.is_some() {
            self.fcs = other.fcs;
        }
        if other.ext_window_size.is_some() {
            self.ext_window_size = other.ext_window_size;
        }
        for hint in other.hints {
            if !self.hints.contains(&hint) {
                self.hints.push(hint);
            }
        }
        self.unknown.extend(other.unknown);
    }

    /// Drop every option whose type appears in `types`
    pub fn remove_types(&mut self, types: &[u8]) {
        for option_type in types {
            match *option_type {
                L2CAP_CONF_MTU => self.mtu = None,
                L2CAP_CONF_FLUSH_TIMEOUT => self.flush_timeout = None,
                L2CAP_CONF_QOS => self.qos = None,
                L2CAP_CONF_RFC => self.retransmission = None,
                L2CAP_CONF_FCS => self.fcs = None,
                L2CAP_CONF_EXT_WINDOW => self.ext_window_size = None,
                _ => {}
            }
        }
        self.unknown.retain(|o| !types.contains(&o.option_type));
        self.hints.retain(|t| !types.contains(t));
    }
}

/// Configure Response result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureResult {
    Success,
    UnacceptableParameters,
    Rejected,
    UnknownOptions,
    Pending,
    FlowSpecRejected,
}

impl ConfigureResult {
    pub fn from_u16(value: u16) -> Self {
        match value {
            L2CAP_CONF_SUCCESS => Self::Success,
            L2CAP_CONF_UNACCEPTABLE_PARAMETERS => Self::UnacceptableParameters,
            L2CAP_CONF_UNKNOWN_OPTIONS => Self::UnknownOptions,
            L2CAP_CONF_PENDING => Self::Pending,
            L2CAP_CONF_FLOW_SPEC_REJECTED => Self::FlowSpecRejected,
            _ => Self::Rejected,
        }
    }

    pub fn value(&self) -> u16 {
        match self {
            Self::Success => L2CAP_CONF_SUCCESS,
            Self::UnacceptableParameters => L2CAP_CONF_UNACCEPTABLE_PARAMETERS,
            Self::Rejected => L2CAP_CONF_REJECTED,
            Self::UnknownOptions => L2CAP_CONF_UNKNOWN_OPTIONS,
            Self::Pending => L2CAP_CONF_PENDING,
            Self::FlowSpecRejected => L2CAP_CONF_FLOW_SPEC_REJECTED,
        }
    }
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    /// Channel is closed
    Closed,
    /// Connection Request sent, waiting for the response
    WaitConnectRsp,
    /// Connected, configuration in progress
    WaitConfig,
    /// Channel is open and ready for data transfer
    Open,
    /// Disconnection Request sent, waiting for the response
    WaitDisconnect,
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitConnectRsp => write!(f, "Waiting for connection response"),
            Self::WaitConfig => write!(f, "Waiting for configuration"),
            Self::Open => write!(f, "Open"),
            Self::WaitDisconnect => write!(f, "Waiting for disconnection"),
        }
    }
}

/// Which side opened the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// We sent the Connection Request
    Initiator,
    /// The peer sent the Connection Request
    Acceptor,
}

/// Local ERTM preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErtmConfig {
    /// Receive window advertised to the peer
    pub tx_window_size: u8,
    pub max_transmit: u8,
    /// Retransmission time-out (ms) we ask the peer to use, and fall back to
    pub retransmission_timeout: u16,
    /// Monitor time-out (ms) we ask the peer to use, and fall back to
    pub monitor_timeout: u16,
    /// Largest I-frame payload we accept
    pub mps: u16,
}

impl ErtmConfig {
    pub fn retransmission_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmission_timeout as u64)
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_timeout as u64)
    }
}

impl Default for ErtmConfig {
    fn default() -> Self {
        Self {
            tx_window_size: L2CAP_ERTM_DEFAULT_TX_WINDOW,
            max_transmit: L2CAP_ERTM_DEFAULT_MAX_TRANSMIT,
            retransmission_timeout: L2CAP_ERTM_DEFAULT_RETRANSMISSION_TIMEOUT_MS,
            monitor_timeout: L2CAP_ERTM_DEFAULT_MONITOR_TIMEOUT_MS,
            mps: L2CAP_ERTM_DEFAULT_MPS,
        }
    }
}

/// Per-channel configuration: what we propose and what we insist on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Basic or EnhancedRetransmission
    pub mode: RetransmissionMode,
    /// Disconnect rather than fall back to Basic mode
    pub mode_mandatory: bool,
    /// Largest SDU we can receive
    pub mtu: u16,
    pub fcs: FcsType,
    pub ertm: ErtmConfig,
}

impl ChannelConfig {
    /// A channel preferring ERTM
    pub fn ertm() -> Self {
        Self {
            mode: RetransmissionMode::EnhancedRetransmission,
            ..Self::default()
        }
    }

    /// A channel that must run in ERTM
    pub fn ertm_mandatory() -> Self {
        Self {
            mode_mandatory: true,
            ..Self::ertm()
        }
    }

    pub fn validate(&self) -> L2capResult<()> {
        if !self.mode.is_supported() {
            return Err(L2capError::NotSupported);
        }
        if self.mtu < L2CAP_MIN_MTU {
            return Err(L2capError::InvalidParameter(format!(
                "MTU {} below minimum {}",
                self.mtu, L2CAP_MIN_MTU
            )));
        }
        if self.mode == RetransmissionMode::EnhancedRetransmission
            && (self.ertm.tx_window_size == 0 || self.ertm.tx_window_size > L2CAP_MAX_TX_WINDOW)
        {
            return Err(L2capError::InvalidParameter(format!(
                "tx window {} out of range",
                self.ertm.tx_window_size
            )));
        }
        if self.ertm.retransmission_timeout == 0 || self.ertm.monitor_timeout == 0 {
            return Err(L2capError::InvalidParameter("zero ERTM time-out".into()));
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: RetransmissionMode::Basic,
            mode_mandatory: false,
            mtu: L2CAP_DEFAULT_MTU,
            fcs: FcsType::NoFcs,
            ertm: ErtmConfig::default(),
        }
    }
}

/// Link-wide configuration for an [`L2capManager`](super::core::L2capManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capConfig {
    /// ACL connection handle of the link
    pub handle: u16,
    /// Largest ACL payload the controller accepts
    pub acl_mtu: usize,
    /// Upper bound on simultaneously allocated dynamic channels
    pub max_channels: usize,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            handle: 0x0001,
            acl_mtu: crate::hci::constants::HCI_DEFAULT_ACL_MTU,
            max_channels: 64,
        }
    }
}

bitflags! {
    /// Extended feature mask reported in an Information Response
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtendedFeatures: u32 {
        const FLOW_CONTROL = 1 << 0;
        const RETRANSMISSION = 1 << 1;
        const BIDIRECTIONAL_QOS = 1 << 2;
        const ENHANCED_RETRANSMISSION = 1 << 3;
        const STREAMING = 1 << 4;
        const FCS_OPTION = 1 << 5;
        const EXTENDED_FLOW_SPEC = 1 << 6;
        const FIXED_CHANNELS = 1 << 7;
        const EXTENDED_WINDOW_SIZE = 1 << 8;
        const UNICAST_CONNECTIONLESS = 1 << 9;
    }
}

impl ExtendedFeatures {
    /// Features this implementation supports
    pub fn supported() -> Self {
        Self::ENHANCED_RETRANSMISSION | Self::FCS_OPTION | Self::FIXED_CHANNELS
    }
}

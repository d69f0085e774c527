//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the L2CAP implementation, which is responsible for:
//! - Multiplexing connection-oriented channels over one ACL link
//! - Negotiating each channel's mode and parameters
//! - Reliable, flow-controlled delivery in Enhanced Retransmission Mode
//! - Segmentation and reassembly of SDUs

pub mod channel;
pub mod config;
pub mod constants;
pub mod core;
pub mod ertm;
pub mod packet;
pub mod psm;
pub mod signaling;
pub mod types;

// Re-export the public API
pub use self::channel::Channel;
pub use self::config::{ConfigurationSession, NegotiatedParameters};
pub use self::core::{ChannelEvent, L2capManager};
pub use self::ertm::ErtmEngine;
pub use self::packet::{EnhancedFrame, L2capControlField, SegmentationAndReassembly, SupervisoryFunction};
pub use self::psm::Psm;
pub use self::types::*;

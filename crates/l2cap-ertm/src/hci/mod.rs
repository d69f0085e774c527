//! Bluetooth HCI (Host Controller Interface) ACL data framing
//!
//! The L2CAP layer exchanges ACL data packets with the link. Only the data
//! path is modelled here; controller commands and events are left to the
//! transport that owns the link.

pub mod constants;
pub mod packet;

#[cfg(test)]
mod tests;

pub use packet::{AclPacket, AclRecombiner, BroadcastFlag, PacketBoundary};

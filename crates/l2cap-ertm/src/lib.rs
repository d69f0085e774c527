//! l2cap-ertm - L2CAP connection-oriented channels with Enhanced Retransmission Mode
//!
//! This library implements the host side of Bluetooth L2CAP over a single ACL
//! link: the frame and signaling codecs, per-channel configuration
//! negotiation, and the ERTM transfer engine with its windowing,
//! retransmission and timers. It performs no I/O; the caller moves ACL
//! packets between [`L2capManager`] and the controller and supplies the
//! current time.

pub mod error;
pub mod hci;
pub mod l2cap;

// Re-export common types for convenience
pub use error::CodecError;
pub use hci::{AclPacket, AclRecombiner};
pub use l2cap::{
    Channel, ChannelConfig, ChannelEvent, CloseReason, ErtmConfig, L2capConfig, L2capError,
    L2capManager, L2capResult, Psm, RetransmissionMode,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_idle_manager() {
        let mut manager = L2capManager::new(L2capConfig::default());

        assert!(manager.poll_transmit().is_none());
        assert!(manager.poll_event().is_none());
        assert!(manager.poll_timeout().is_none());
        manager.handle_timeout(Instant::now());
        assert!(matches!(
            manager.send(0x0040, b"abc", Instant::now()),
            Err(L2capError::ChannelNotFound(0x0040))
        ));
    }
}

//! HCI protocol constants
//!
//! This module contains the constants needed to frame ACL data packets.

// H4 transport indicator for ACL data
pub const HCI_ACL_PKT: u8 = 0x02;

// ACL data header: handle + flags (2 bytes), data total length (2 bytes)
pub const HCI_ACL_HEADER_SIZE: usize = 4;

pub const HCI_ACL_HANDLE_MASK: u16 = 0x0FFF;
pub const HCI_ACL_PB_SHIFT: u16 = 12;
pub const HCI_ACL_BC_SHIFT: u16 = 14;
pub const HCI_ACL_FLAG_MASK: u16 = 0x0003;

// Largest valid connection handle
pub const HCI_ACL_MAX_HANDLE: u16 = 0x0EFF;

// Default controller ACL buffer size for BR/EDR
pub const HCI_DEFAULT_ACL_MTU: usize = 1021;

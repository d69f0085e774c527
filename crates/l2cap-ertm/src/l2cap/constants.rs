//! L2CAP protocol constants
//!
//! Values from the Bluetooth Core Specification, Vol 3, Part A.

// Basic frame header: length (2 bytes) + channel ID (2 bytes)
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
// Signaling command header: code, identifier, length (2 bytes)
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;
// Enhanced control field
pub const L2CAP_CONTROL_FIELD_SIZE: usize = 2;
// SDU length prefix carried by a START segment
pub const L2CAP_SDU_LENGTH_SIZE: usize = 2;
pub const L2CAP_FCS_SIZE: usize = 2;

// Fixed channel identifiers
pub const L2CAP_NULL_CID: u16 = 0x0000;
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;

// Dynamically allocated channel range
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;

// MTU values
pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_SIGNALING_MTU: u16 = 48;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_CONN_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONN_PENDING: u16 = 0x0001;
pub const L2CAP_CONN_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_CONN_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_CONN_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_CONN_INVALID_SOURCE_CID: u16 = 0x0006;
pub const L2CAP_CONN_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x0007;

// Configuration response results
pub const L2CAP_CONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONF_UNACCEPTABLE_PARAMETERS: u16 = 0x0001;
pub const L2CAP_CONF_REJECTED: u16 = 0x0002;
pub const L2CAP_CONF_UNKNOWN_OPTIONS: u16 = 0x0003;
pub const L2CAP_CONF_PENDING: u16 = 0x0004;
pub const L2CAP_CONF_FLOW_SPEC_REJECTED: u16 = 0x0005;

// Configuration flags
pub const L2CAP_CONF_FLAG_CONTINUATION: u16 = 0x0001;

// Configuration option types
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_QOS: u8 = 0x03;
pub const L2CAP_CONF_RFC: u8 = 0x04;
pub const L2CAP_CONF_FCS: u8 = 0x05;
pub const L2CAP_CONF_EXT_FLOW_SPEC: u8 = 0x06;
pub const L2CAP_CONF_EXT_WINDOW: u8 = 0x07;
pub const L2CAP_CONF_HINT: u8 = 0x80;
pub const L2CAP_CONF_TYPE_MASK: u8 = 0x7F;

// Option value lengths
pub const L2CAP_CONF_MTU_LEN: u8 = 2;
pub const L2CAP_CONF_FLUSH_TIMEOUT_LEN: u8 = 2;
pub const L2CAP_CONF_QOS_LEN: u8 = 22;
pub const L2CAP_CONF_RFC_LEN: u8 = 9;
pub const L2CAP_CONF_FCS_LEN: u8 = 1;
pub const L2CAP_CONF_EXT_WINDOW_LEN: u8 = 2;

// Information request types
pub const L2CAP_INFO_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_FIXED_CHANNELS: u16 = 0x0003;

// Information response results
pub const L2CAP_INFO_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_NOT_SUPPORTED: u16 = 0x0001;

// Fixed channels supported mask: signaling channel only
pub const L2CAP_FIXED_CHANNELS_SUPPORTED: u64 = 1 << L2CAP_SIGNALING_CID;

// Enhanced control field layout
pub const L2CAP_CTRL_FRAME_TYPE_MASK: u16 = 0x0001;
pub const L2CAP_CTRL_TXSEQ_MASK: u16 = 0x007E;
pub const L2CAP_CTRL_TXSEQ_SHIFT: u16 = 1;
pub const L2CAP_CTRL_SUPERVISORY_MASK: u16 = 0x000C;
pub const L2CAP_CTRL_SUPERVISORY_SHIFT: u16 = 2;
pub const L2CAP_CTRL_POLL: u16 = 0x0010;
pub const L2CAP_CTRL_FINAL: u16 = 0x0080;
pub const L2CAP_CTRL_REQSEQ_MASK: u16 = 0x3F00;
pub const L2CAP_CTRL_REQSEQ_SHIFT: u16 = 8;
pub const L2CAP_CTRL_SAR_MASK: u16 = 0xC000;
pub const L2CAP_CTRL_SAR_SHIFT: u16 = 14;

// Sequence numbers are 6 bits wide
pub const L2CAP_SEQ_MODULO: u8 = 64;
pub const L2CAP_MAX_TX_WINDOW: u8 = 63;

// ERTM defaults
pub const L2CAP_ERTM_DEFAULT_TX_WINDOW: u8 = 10;
pub const L2CAP_ERTM_DEFAULT_MAX_TRANSMIT: u8 = 20;
pub const L2CAP_ERTM_DEFAULT_RETRANSMISSION_TIMEOUT_MS: u16 = 2000;
pub const L2CAP_ERTM_DEFAULT_MONITOR_TIMEOUT_MS: u16 = 12000;
pub const L2CAP_ERTM_DEFAULT_MPS: u16 = 1010;

// Number of Configure Requests sent before giving up on a channel
pub const L2CAP_MAX_CONFIG_ATTEMPTS: u8 = 3;

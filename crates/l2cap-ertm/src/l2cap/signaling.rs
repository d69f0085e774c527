//! L2CAP Signaling channel implementation
//!
//! This module handles the command codec for the fixed signaling channel
//! (CID 0x0001): connection, configuration, disconnection, echo and
//! information commands, plus configuration option TLVs.

use super::constants::*;
use super::packet::*;
use super::types::*;
use crate::error::CodecError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// One command sliced out of a C-frame, not yet interpreted
#[derive(Debug, Clone, Copy)]
pub struct RawCommand<'a> {
    pub header: L2capCommandHeader,
    pub params: &'a [u8],
}

/// Split a C-frame payload into its commands
///
/// A C-frame may carry several commands back to back. A truncated trailing
/// command invalidates the whole frame.
pub fn split_commands(data: &[u8]) -> Result<Vec<RawCommand<'_>>, CodecError> {
    let mut commands = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let header = L2capCommandHeader::parse(&data[offset..])?;
        let start = offset + L2CAP_COMMAND_HEADER_SIZE;
        let end = start + header.length as usize;

        if end > data.len() {
            return Err(CodecError::LengthMismatch {
                declared: header.length as usize,
                actual: data.len() - start,
            });
        }

        commands.push(RawCommand {
            header,
            params: &data[start..end],
        });
        offset = end;
    }

    Ok(commands)
}

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request
    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },

    /// Connection Response
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    /// Configuration Request
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        options: ConfigOptions,
    },

    /// Configuration Response
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Echo Request
    EchoRequest { identifier: SignalId, data: Vec<u8> },

    /// Echo Response
    EchoResponse { identifier: SignalId, data: Vec<u8> },

    /// Information Request
    InformationRequest { identifier: SignalId, info_type: u16 },

    /// Information Response
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
}

fn read_u16(cursor: &mut Cursor<&[u8]>, code: u8) -> Result<u16, CodecError> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| CodecError::InvalidCommand {
            code,
            reason: "parameters too short",
        })
}

fn read_u32(cursor: &mut Cursor<&[u8]>, option_type: u8) -> Result<u32, CodecError> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CodecError::MalformedOption { option_type })
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. } => *identifier,
        }
    }

    /// Whether this command expects a response from the peer
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRequest { .. }
                | Self::ConfigureRequest { .. }
                | Self::DisconnectionRequest { .. }
                | Self::EchoRequest { .. }
                | Self::InformationRequest { .. }
        )
    }

    /// Parse configuration options from raw bytes
    ///
    /// Known options with a bad length are an error. Unknown option types are
    /// kept verbatim so they can be echoed in an Unknown Options response.
    pub fn parse_config_options(data: &[u8]) -> Result<ConfigOptions, CodecError> {
        let mut options = ConfigOptions::default();
        let mut offset = 0;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(CodecError::MalformedOption {
                    option_type: data[offset] & L2CAP_CONF_TYPE_MASK,
                });
            }

            let hint = data[offset] & L2CAP_CONF_HINT != 0;
            let option_type = data[offset] & L2CAP_CONF_TYPE_MASK;
            let option_length = data[offset + 1];
            let value_start = offset + 2;
            let value_end = value_start + option_length as usize;

            if value_end > data.len() {
                return Err(CodecError::MalformedOption { option_type });
            }

            let value = &data[value_start..value_end];
            let expect_len = |len: u8| {
                if option_length == len {
                    Ok(())
                } else {
                    Err(CodecError::MalformedOption { option_type })
                }
            };

            let known = match option_type {
                L2CAP_CONF_MTU => {
                    expect_len(L2CAP_CONF_MTU_LEN)?;
                    options.mtu = Some(u16::from_le_bytes([value[0], value[1]]));
                    true
                }
                L2CAP_CONF_FLUSH_TIMEOUT => {
                    expect_len(L2CAP_CONF_FLUSH_TIMEOUT_LEN)?;
                    options.flush_timeout = Some(u16::from_le_bytes([value[0], value[1]]));
                    true
                }
                L2CAP_CONF_QOS => {
                    expect_len(L2CAP_CONF_QOS_LEN)?;
                    // Byte 0 is flags, byte 1 the service type
                    let mut cursor = Cursor::new(&value[2..]);
                    options.qos = Some(QosFlowSpec {
                        service_type: value[1],
                        token_rate: read_u32(&mut cursor, option_type)?,
                        token_bucket_size: read_u32(&mut cursor, option_type)?,
                        peak_bandwidth: read_u32(&mut cursor, option_type)?,
                        latency: read_u32(&mut cursor, option_type)?,
                        delay_variation: read_u32(&mut cursor, option_type)?,
                    });
                    true
                }
                L2CAP_CONF_RFC => {
                    expect_len(L2CAP_CONF_RFC_LEN)?;
                    let mode = RetransmissionMode::from_u8(value[0])
                        .ok_or(CodecError::MalformedOption { option_type })?;
                    options.retransmission = Some(RetransmissionFlowControl {
                        mode,
                        tx_window_size: value[1],
                        max_transmit: value[2],
                        retransmission_timeout: u16::from_le_bytes([value[3], value[4]]),
                        monitor_timeout: u16::from_le_bytes([value[5], value[6]]),
                        max_pdu_size: u16::from_le_bytes([value[7], value[8]]),
                    });
                    true
                }
                L2CAP_CONF_FCS => {
                    expect_len(L2CAP_CONF_FCS_LEN)?;
                    options.fcs = Some(FcsType::from_u8(value[0]));
                    true
                }
                L2CAP_CONF_EXT_WINDOW => {
                    expect_len(L2CAP_CONF_EXT_WINDOW_LEN)?;
                    options.ext_window_size = Some(u16::from_le_bytes([value[0], value[1]]));
                    true
                }
                _ => {
                    options.unknown.push(UnknownOption {
                        option_type,
                        hint,
                        data: value.to_vec(),
                    });
                    false
                }
            };

            if known && hint && !options.hints.contains(&option_type) {
                options.hints.push(option_type);
            }

            offset = value_end;
        }

        Ok(options)
    }

    /// Serialize configuration options to bytes
    pub fn serialize_config_options(options: &ConfigOptions) -> Vec<u8> {
        let mut result = Vec::new();
        let type_byte = |option_type: u8| {
            if options.is_hint(option_type) {
                option_type | L2CAP_CONF_HINT
            } else {
                option_type
            }
        };

        if let Some(mtu) = options.mtu {
            result.push(type_byte(L2CAP_CONF_MTU));
            result.push(L2CAP_CONF_MTU_LEN);
            result.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(timeout) = options.flush_timeout {
            result.push(type_byte(L2CAP_CONF_FLUSH_TIMEOUT));
            result.push(L2CAP_CONF_FLUSH_TIMEOUT_LEN);
            result.extend_from_slice(&timeout.to_le_bytes());
        }

        if let Some(qos) = options.qos {
            result.push(type_byte(L2CAP_CONF_QOS));
            result.push(L2CAP_CONF_QOS_LEN);
            result.push(0); // Flags
            result.push(qos.service_type);
            result.extend_from_slice(&qos.token_rate.to_le_bytes());
            result.extend_from_slice(&qos.token_bucket_size.to_le_bytes());
            result.extend_from_slice(&qos.peak_bandwidth.to_le_bytes());
            result.extend_from_slice(&qos.latency.to_le_bytes());
            result.extend_from_slice(&qos.delay_variation.to_le_bytes());
        }

        if let Some(rfc) = options.retransmission {
            result.push(type_byte(L2CAP_CONF_RFC));
            result.push(L2CAP_CONF_RFC_LEN);
            result.push(rfc.mode as u8);
            result.push(rfc.tx_window_size);
            result.push(rfc.max_transmit);
            result.extend_from_slice(&rfc.retransmission_timeout.to_le_bytes());
            result.extend_from_slice(&rfc.monitor_timeout.to_le_bytes());
            result.extend_from_slice(&rfc.max_pdu_size.to_le_bytes());
        }

        if let Some(fcs) = options.fcs {
            result.push(type_byte(L2CAP_CONF_FCS));
            result.push(L2CAP_CONF_FCS_LEN);
            result.push(fcs as u8);
        }

        if let Some(window) = options.ext_window_size {
            result.push(type_byte(L2CAP_CONF_EXT_WINDOW));
            result.push(L2CAP_CONF_EXT_WINDOW_LEN);
            result.extend_from_slice(&window.to_le_bytes());
        }

        for unknown in &options.unknown {
            let hint = if unknown.hint { L2CAP_CONF_HINT } else { 0 };
            result.push(unknown.option_type | hint);
            result.push(unknown.data.len() as u8);
            result.extend_from_slice(&unknown.data);
        }

        result
    }

    /// Interpret one command from a C-frame
    pub fn parse(command: &RawCommand<'_>) -> Result<Self, CodecError> {
        let code = command.header.code;
        let identifier = command.header.identifier;
        let params = command.params;
        let mut cursor = Cursor::new(params);

        let message = match code {
            L2CAP_COMMAND_REJECT => Self::CommandReject {
                identifier,
                reason: read_u16(&mut cursor, code)?,
                data: params[2..].to_vec(),
            },

            L2CAP_CONNECTION_REQUEST => Self::ConnectionRequest {
                identifier,
                psm: read_u16(&mut cursor, code)?,
                source_cid: read_u16(&mut cursor, code)?,
            },

            L2CAP_CONNECTION_RESPONSE => Self::ConnectionResponse {
                identifier,
                destination_cid: read_u16(&mut cursor, code)?,
                source_cid: read_u16(&mut cursor, code)?,
                result: read_u16(&mut cursor, code)?,
                status: read_u16(&mut cursor, code)?,
            },

            L2CAP_CONFIGURE_REQUEST => {
                let destination_cid = read_u16(&mut cursor, code)?;
                let flags = read_u16(&mut cursor, code)?;
                Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    flags,
                    options: Self::parse_config_options(&params[4..])?,
                }
            }

            L2CAP_CONFIGURE_RESPONSE => {
                let source_cid = read_u16(&mut cursor, code)?;
                let flags = read_u16(&mut cursor, code)?;
                let result = read_u16(&mut cursor, code)?;
                Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags,
                    result,
                    options: Self::parse_config_options(&params[6..])?,
                }
            }

            L2CAP_DISCONNECTION_REQUEST => Self::DisconnectionRequest {
                identifier,
                destination_cid: read_u16(&mut cursor, code)?,
                source_cid: read_u16(&mut cursor, code)?,
            },

            L2CAP_DISCONNECTION_RESPONSE => Self::DisconnectionResponse {
                identifier,
                destination_cid: read_u16(&mut cursor, code)?,
                source_cid: read_u16(&mut cursor, code)?,
            },

            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: params.to_vec(),
            },

            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: params.to_vec(),
            },

            L2CAP_INFORMATION_REQUEST => Self::InformationRequest {
                identifier,
                info_type: read_u16(&mut cursor, code)?,
            },

            L2CAP_INFORMATION_RESPONSE => {
                let info_type = read_u16(&mut cursor, code)?;
                let result = read_u16(&mut cursor, code)?;
                Self::InformationResponse {
                    identifier,
                    info_type,
                    result,
                    data: params[4..].to_vec(),
                }
            }

            _ => {
                return Err(CodecError::InvalidCommand {
                    code,
                    reason: "unknown command code",
                })
            }
        };

        Ok(message)
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let code = self.command_code();
        let identifier = self.identifier();

        let mut params = match self {
            Self::CommandReject { reason, data, .. } => {
                let mut params = Vec::with_capacity(2 + data.len());
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
                params
            }

            Self::ConnectionRequest {
                psm, source_cid, ..
            } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&psm.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params
            }

            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                let mut params = Vec::with_capacity(8);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&status.to_le_bytes());
                params
            }

            Self::ConfigureRequest {
                destination_cid,
                flags,
                options,
                ..
            } => {
                let option_bytes = Self::serialize_config_options(options);
                let mut params = Vec::with_capacity(4 + option_bytes.len());
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&option_bytes);
                params
            }

            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } => {
                let option_bytes = Self::serialize_config_options(options);
                let mut params = Vec::with_capacity(6 + option_bytes.len());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&option_bytes);
                params
            }

            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params
            }

            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => data.clone(),

            Self::InformationRequest { info_type, .. } => info_type.to_le_bytes().to_vec(),

            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                let mut params = Vec::with_capacity(4 + data.len());
                params.extend_from_slice(&info_type.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(data);
                params
            }
        };

        let cmd_header = L2capCommandHeader::new(code, identifier, params.len() as u16);

        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.extend_from_slice(&cmd_header.to_bytes());
        result.append(&mut params);

        result
    }

    /// Create a signaling L2CAP packet (C-frame) from this message
    pub fn to_packet(&self) -> L2capPacket {
        L2capPacket::new(L2CAP_SIGNALING_CID, self.serialize())
    }
}

//! HCI ACL data packets
//!
//! L2CAP frames travel over the link inside ACL data packets. This module
//! frames, fragments and recombines them.

use crate::error::CodecError;
use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// ACL Packet Boundary flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketBoundary {
    /// First fragment of a non-automatically-flushable L2CAP PDU
    FirstNonFlushable = 0x00,
    /// Continuing fragment
    Continuing = 0x01,
    /// First fragment of an automatically-flushable L2CAP PDU
    FirstFlushable = 0x02,
    /// Complete L2CAP PDU
    Complete = 0x03,
}

impl PacketBoundary {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::FirstNonFlushable,
            0x01 => Self::Continuing,
            0x02 => Self::FirstFlushable,
            _ => Self::Complete,
        }
    }

    /// Whether this fragment starts a new L2CAP PDU
    pub fn is_start(&self) -> bool {
        !matches!(self, Self::Continuing)
    }
}

/// ACL Broadcast flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BroadcastFlag {
    PointToPoint = 0x00,
    ActiveBroadcast = 0x01,
    PiconetBroadcast = 0x02,
    Reserved = 0x03,
}

impl BroadcastFlag {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::PointToPoint,
            0x01 => Self::ActiveBroadcast,
            0x02 => Self::PiconetBroadcast,
            _ => Self::Reserved,
        }
    }
}

/// An HCI ACL data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    /// Connection handle (12 bits)
    pub handle: u16,
    pub packet_boundary: PacketBoundary,
    pub broadcast: BroadcastFlag,
    pub payload: Vec<u8>,
}

impl AclPacket {
    /// Create a point-to-point packet starting a new L2CAP PDU
    pub fn new(handle: u16, payload: Vec<u8>) -> Self {
        Self {
            handle: handle & HCI_ACL_HANDLE_MASK,
            packet_boundary: PacketBoundary::FirstFlushable,
            broadcast: BroadcastFlag::PointToPoint,
            payload,
        }
    }

    /// Split an L2CAP PDU into ACL packets no larger than `acl_mtu` bytes of payload
    pub fn fragment(handle: u16, pdu: &[u8], acl_mtu: usize) -> Vec<AclPacket> {
        let acl_mtu = acl_mtu.max(1);
        if pdu.is_empty() {
            return vec![AclPacket::new(handle, Vec::new())];
        }

        pdu.chunks(acl_mtu)
            .enumerate()
            .map(|(i, chunk)| {
                let mut packet = AclPacket::new(handle, chunk.to_vec());
                if i > 0 {
                    packet.packet_boundary = PacketBoundary::Continuing;
                }
                packet
            })
            .collect()
    }

    /// Parse an ACL packet (without the UART packet indicator)
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HCI_ACL_HEADER_SIZE {
            return Err(CodecError::too_short(
                "ACL header",
                HCI_ACL_HEADER_SIZE,
                data.len(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let handle_and_flags = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| CodecError::InvalidAclHeader("truncated handle"))?;
        let length = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| CodecError::InvalidAclHeader("truncated length"))? as usize;

        let handle = handle_and_flags & HCI_ACL_HANDLE_MASK;
        if handle > HCI_ACL_MAX_HANDLE {
            return Err(CodecError::InvalidAclHeader("reserved connection handle"));
        }

        let body = &data[HCI_ACL_HEADER_SIZE..];
        if body.len() != length {
            return Err(CodecError::LengthMismatch {
                declared: length,
                actual: body.len(),
            });
        }

        Ok(Self {
            handle,
            packet_boundary: PacketBoundary::from_u8(
                ((handle_and_flags >> HCI_ACL_PB_SHIFT) & HCI_ACL_FLAG_MASK) as u8,
            ),
            broadcast: BroadcastFlag::from_u8(
                ((handle_and_flags >> HCI_ACL_BC_SHIFT) & HCI_ACL_FLAG_MASK) as u8,
            ),
            payload: body.to_vec(),
        })
    }

    /// Serialize the packet (without the UART packet indicator)
    pub fn to_bytes(&self) -> Vec<u8> {
        let handle_and_flags = (self.handle & HCI_ACL_HANDLE_MASK)
            | ((self.packet_boundary as u16) << HCI_ACL_PB_SHIFT)
            | ((self.broadcast as u16) << HCI_ACL_BC_SHIFT);

        let mut result = Vec::with_capacity(HCI_ACL_HEADER_SIZE + self.payload.len());
        result.extend_from_slice(&handle_and_flags.to_le_bytes());
        result.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Serialize with the H4 packet indicator prepended
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + HCI_ACL_HEADER_SIZE + self.payload.len());
        packet.push(HCI_ACL_PKT);
        packet.extend_from_slice(&self.to_bytes());
        packet
    }
}

/// Rebuilds complete L2CAP PDUs from ACL fragments of one connection handle
#[derive(Debug, Default)]
pub struct AclRecombiner {
    buffer: Vec<u8>,
    in_progress: bool,
}

impl AclRecombiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one ACL packet. Returns a complete L2CAP PDU once all of its
    /// fragments have arrived.
    pub fn push(&mut self, packet: AclPacket) -> Result<Option<Vec<u8>>, CodecError> {
        if packet.packet_boundary.is_start() {
            if self.in_progress {
                log::warn!(
                    "Discarding {} bytes of incomplete PDU on handle 0x{:03x}",
                    self.buffer.len(),
                    packet.handle
                );
            }
            self.buffer = packet.payload;
            self.in_progress = true;
        } else {
            if !self.in_progress {
                return Err(CodecError::InvalidAclHeader(
                    "continuing fragment without a start",
                ));
            }
            self.buffer.extend_from_slice(&packet.payload);
        }

        // Need the basic header to know how long the PDU is
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let expected = 4 + u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.buffer.len() < expected {
            return Ok(None);
        }

        self.in_progress = false;
        let pdu = std::mem::take(&mut self.buffer);
        if pdu.len() > expected {
            return Err(CodecError::LengthMismatch {
                declared: expected,
                actual: pdu.len(),
            });
        }

        Ok(Some(pdu))
    }

    /// Drop any partially received PDU
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_progress = false;
    }
}

//! L2CAP Packet handling
//!
//! This module provides structures and functions for handling L2CAP packets:
//! basic frames, signaling command headers and the enhanced I/S-frames used
//! by Enhanced Retransmission Mode.

use super::constants::*;
use super::types::*;
use crate::error::CodecError;
use byteorder::{LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_16_ARC};
use std::io::Cursor;

/// CRC-16 (polynomial x^16 + x^15 + x^2 + 1, LSB first, zero init)
const L2CAP_FCS: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Compute the frame check sequence over `data`
pub fn compute_fcs(data: &[u8]) -> u16 {
    L2CAP_FCS.checksum(data)
}

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return Err(CodecError::too_short(
                "L2CAP header",
                L2CAP_BASIC_HEADER_SIZE,
                data.len(),
            ));
        }

        Ok(Self {
            length: u16::from_le_bytes([data[0], data[1]]),
            channel_id: u16::from_le_bytes([data[2], data[3]]),
        })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let length = self.length.to_le_bytes();
        let cid = self.channel_id.to_le_bytes();
        [length[0], length[1], cid[0], cid[1]]
    }
}

/// A basic L2CAP frame: header plus opaque information payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    pub header: L2capHeader,
    pub payload: Vec<u8>,
}

impl L2capPacket {
    /// Create a new L2CAP packet
    pub fn new(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            header: L2capHeader::new(payload.len() as u16, channel_id),
            payload,
        }
    }

    /// Parse a complete basic frame. The declared length must match the
    /// number of bytes supplied.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let header = L2capHeader::parse(data)?;
        let body = &data[L2CAP_BASIC_HEADER_SIZE..];

        if body.len() != header.length as usize {
            return Err(CodecError::LengthMismatch {
                declared: header.length as usize,
                actual: body.len(),
            });
        }

        Ok(Self {
            header,
            payload: body.to_vec(),
        })
    }

    /// Serialize the L2CAP packet to a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.size());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Get the full size of the packet in bytes
    pub fn size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.payload.len()
    }
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Command identifier
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    /// Create a new command header
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    /// Parse a command header from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < L2CAP_COMMAND_HEADER_SIZE {
            return Err(CodecError::too_short(
                "command header",
                L2CAP_COMMAND_HEADER_SIZE,
                data.len(),
            ));
        }

        Ok(Self {
            code: data[0],
            identifier: data[1],
            length: u16::from_le_bytes([data[2], data[3]]),
        })
    }

    /// Serialize the command header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_COMMAND_HEADER_SIZE] {
        let length = self.length.to_le_bytes();
        [self.code, self.identifier, length[0], length[1]]
    }
}

/// SAR field of an I-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationAndReassembly {
    Unsegmented = 0,
    Start = 1,
    End = 2,
    Continuation = 3,
}

impl SegmentationAndReassembly {
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => Self::Unsegmented,
            1 => Self::Start,
            2 => Self::End,
            _ => Self::Continuation,
        }
    }
}

/// S field of an S-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryFunction {
    /// RR
    ReceiverReady = 0,
    /// REJ
    Reject = 1,
    /// RNR
    ReceiverNotReady = 2,
    /// SREJ
    SelectiveReject = 3,
}

impl SupervisoryFunction {
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => Self::ReceiverReady,
            1 => Self::Reject,
            2 => Self::ReceiverNotReady,
            _ => Self::SelectiveReject,
        }
    }
}

/// Enhanced control field (2 bytes, little endian)
///
/// I-frame: `[0][TxSeq:6][F][ReqSeq:6][SAR:2]`
/// S-frame: `[1][0][S:2][P][00][F][ReqSeq:6][00]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capControlField {
    Information {
        tx_seq: u8,
        req_seq: u8,
        final_bit: bool,
        sar: SegmentationAndReassembly,
    },
    Supervisory {
        function: SupervisoryFunction,
        req_seq: u8,
        poll: bool,
        final_bit: bool,
    },
}

impl L2capControlField {
    /// Create a new control field for an Information frame (I-frame)
    pub fn new_i_frame(
        tx_seq: u8,
        req_seq: u8,
        final_bit: bool,
        sar: SegmentationAndReassembly,
    ) -> Self {
        Self::Information {
            tx_seq: tx_seq % L2CAP_SEQ_MODULO,
            req_seq: req_seq % L2CAP_SEQ_MODULO,
            final_bit,
            sar,
        }
    }

    /// Create a new control field for a Supervisory frame (S-frame)
    pub fn new_s_frame(
        function: SupervisoryFunction,
        req_seq: u8,
        poll: bool,
        final_bit: bool,
    ) -> Self {
        Self::Supervisory {
            function,
            req_seq: req_seq % L2CAP_SEQ_MODULO,
            poll,
            final_bit,
        }
    }

    /// Decode a control field value
    pub fn parse(control: u16) -> Self {
        let req_seq = ((control & L2CAP_CTRL_REQSEQ_MASK) >> L2CAP_CTRL_REQSEQ_SHIFT) as u8;
        let final_bit = control & L2CAP_CTRL_FINAL != 0;

        if control & L2CAP_CTRL_FRAME_TYPE_MASK == 0 {
            Self::Information {
                tx_seq: ((control & L2CAP_CTRL_TXSEQ_MASK) >> L2CAP_CTRL_TXSEQ_SHIFT) as u8,
                req_seq,
                final_bit,
                sar: SegmentationAndReassembly::from_bits(
                    (control & L2CAP_CTRL_SAR_MASK) >> L2CAP_CTRL_SAR_SHIFT,
                ),
            }
        } else {
            Self::Supervisory {
                function: SupervisoryFunction::from_bits(
                    (control & L2CAP_CTRL_SUPERVISORY_MASK) >> L2CAP_CTRL_SUPERVISORY_SHIFT,
                ),
                req_seq,
                poll: control & L2CAP_CTRL_POLL != 0,
                final_bit,
            }
        }
    }

    /// Convert the control field to a u16 value
    pub fn to_u16(&self) -> u16 {
        match *self {
            Self::Information {
                tx_seq,
                req_seq,
                final_bit,
                sar,
            } => {
                let mut control = ((tx_seq as u16) << L2CAP_CTRL_TXSEQ_SHIFT) & L2CAP_CTRL_TXSEQ_MASK;
                control |= ((req_seq as u16) << L2CAP_CTRL_REQSEQ_SHIFT) & L2CAP_CTRL_REQSEQ_MASK;
                control |= (sar as u16) << L2CAP_CTRL_SAR_SHIFT;
                if final_bit {
                    control |= L2CAP_CTRL_FINAL;
                }
                control
            }
            Self::Supervisory {
                function,
                req_seq,
                poll,
                final_bit,
            } => {
                let mut control = L2CAP_CTRL_FRAME_TYPE_MASK;
                control |= (function as u16) << L2CAP_CTRL_SUPERVISORY_SHIFT;
                control |= ((req_seq as u16) << L2CAP_CTRL_REQSEQ_SHIFT) & L2CAP_CTRL_REQSEQ_MASK;
                if poll {
                    control |= L2CAP_CTRL_POLL;
                }
                if final_bit {
                    control |= L2CAP_CTRL_FINAL;
                }
                control
            }
        }
    }

    /// Serialize the control field to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_CONTROL_FIELD_SIZE] {
        self.to_u16().to_le_bytes()
    }

    pub fn req_seq(&self) -> u8 {
        match *self {
            Self::Information { req_seq, .. } | Self::Supervisory { req_seq, .. } => req_seq,
        }
    }

    pub fn final_bit(&self) -> bool {
        match *self {
            Self::Information { final_bit, .. } | Self::Supervisory { final_bit, .. } => final_bit,
        }
    }
}

/// An I-frame or S-frame on an ERTM channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedFrame {
    pub control: L2capControlField,
    /// Information payload, including the SDU length of a START segment.
    /// Always empty for S-frames.
    pub payload: Vec<u8>,
}

impl EnhancedFrame {
    pub fn i_frame(
        tx_seq: u8,
        req_seq: u8,
        final_bit: bool,
        sar: SegmentationAndReassembly,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            control: L2capControlField::new_i_frame(tx_seq, req_seq, final_bit, sar),
            payload,
        }
    }

    pub fn s_frame(function: SupervisoryFunction, req_seq: u8, poll: bool, final_bit: bool) -> Self {
        Self {
            control: L2capControlField::new_s_frame(function, req_seq, poll, final_bit),
            payload: Vec::new(),
        }
    }

    pub fn is_i_frame(&self) -> bool {
        matches!(self.control, L2capControlField::Information { .. })
    }

    /// Serialize into a complete basic frame addressed to `channel_id`
    pub fn encode(&self, channel_id: u16, fcs: FcsType) -> Vec<u8> {
        let length = L2CAP_CONTROL_FIELD_SIZE + self.payload.len() + fcs.size();
        let mut result = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + length);

        result.extend_from_slice(&L2capHeader::new(length as u16, channel_id).to_bytes());
        result.extend_from_slice(&self.control.to_bytes());
        result.extend_from_slice(&self.payload);

        if fcs == FcsType::Fcs16 {
            let checksum = compute_fcs(&result);
            result.extend_from_slice(&checksum.to_le_bytes());
        }

        result
    }

    /// Parse a complete basic frame carrying an I-frame or S-frame
    ///
    /// With `FcsType::Fcs16` the trailing two bytes are verified against the
    /// CRC of everything before them.
    pub fn decode(data: &[u8], fcs: FcsType) -> Result<(u16, Self), CodecError> {
        let header = L2capHeader::parse(data)?;
        let frame_len = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        if data.len() != frame_len {
            return Err(CodecError::LengthMismatch {
                declared: header.length as usize,
                actual: data.len() - L2CAP_BASIC_HEADER_SIZE,
            });
        }

        let minimum = L2CAP_CONTROL_FIELD_SIZE + fcs.size();
        if (header.length as usize) < minimum {
            return Err(CodecError::too_short(
                "enhanced frame",
                minimum,
                header.length as usize,
            ));
        }

        let body_end = frame_len - fcs.size();
        if fcs == FcsType::Fcs16 {
            let received = u16::from_le_bytes([data[body_end], data[body_end + 1]]);
            let computed = compute_fcs(&data[..body_end]);
            if received != computed {
                return Err(CodecError::FcsMismatch { received, computed });
            }
        }

        let mut cursor = Cursor::new(&data[L2CAP_BASIC_HEADER_SIZE..]);
        let control = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| CodecError::too_short("control field", 2, 0))?;
        let control = L2capControlField::parse(control);

        let payload = data[L2CAP_BASIC_HEADER_SIZE + L2CAP_CONTROL_FIELD_SIZE..body_end].to_vec();
        if !payload.is_empty() && matches!(control, L2capControlField::Supervisory { .. }) {
            return Err(CodecError::LengthMismatch {
                declared: 0,
                actual: payload.len(),
            });
        }

        Ok((header.channel_id, Self { control, payload }))
    }
}

/// Prefix a START segment's payload with the total SDU length
pub fn write_sdu_length(sdu_length: u16, segment: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(L2CAP_SDU_LENGTH_SIZE + segment.len());
    payload.extend_from_slice(&sdu_length.to_le_bytes());
    payload.extend_from_slice(segment);
    payload
}

/// Split a START segment's payload into the SDU length and the data
pub fn read_sdu_length(payload: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    if payload.len() < L2CAP_SDU_LENGTH_SIZE {
        return Err(CodecError::too_short(
            "SDU length",
            L2CAP_SDU_LENGTH_SIZE,
            payload.len(),
        ));
    }
    Ok((
        u16::from_le_bytes([payload[0], payload[1]]),
        &payload[L2CAP_SDU_LENGTH_SIZE..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i_frame_with_fcs_vector() {
        let expected = [
            0x0E, 0x00, 0x40, 0x00, 0x02, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x38, 0x61,
        ];
        let frame = EnhancedFrame::i_frame(
            1,
            0,
            false,
            SegmentationAndReassembly::Unsegmented,
            (0u8..10).collect(),
        );

        assert_eq!(frame.encode(0x0040, FcsType::Fcs16), expected.to_vec());

        let (cid, decoded) = EnhancedFrame::decode(&expected, FcsType::Fcs16).unwrap();
        assert_eq!(cid, 0x0040);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_rr_frame_with_fcs_vector() {
        let expected = [0x04, 0x00, 0x40, 0x00, 0x01, 0x01, 0xD4, 0x14];
        let frame = EnhancedFrame::s_frame(SupervisoryFunction::ReceiverReady, 1, false, false);

        assert_eq!(frame.encode(0x0040, FcsType::Fcs16), expected.to_vec());
        assert_eq!(
            EnhancedFrame::decode(&expected, FcsType::Fcs16).unwrap().1,
            frame
        );
    }

    #[test]
    fn test_fcs_mismatch_is_reported() {
        let mut corrupted = vec![0x04, 0x00, 0x40, 0x00, 0x01, 0x01, 0xD4, 0x14];
        corrupted[5] = 0x02;

        match EnhancedFrame::decode(&corrupted, FcsType::Fcs16) {
            Err(CodecError::FcsMismatch { received, .. }) => assert_eq!(received, 0x14D4),
            other => panic!("expected FCS mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_control_field_bit_layout() {
        // S-frame SREJ, ReqSeq 5, P set
        let srej = L2capControlField::new_s_frame(SupervisoryFunction::SelectiveReject, 5, true, false);
        assert_eq!(srej.to_u16(), 0x0001 | (3 << 2) | 0x0010 | (5 << 8));

        // I-frame TxSeq 63, ReqSeq 63, F set, SAR continuation
        let i = L2capControlField::new_i_frame(63, 63, true, SegmentationAndReassembly::Continuation);
        assert_eq!(i.to_u16(), 0xFFFE);
        assert_eq!(L2capControlField::parse(0xFFFE), i);

        // Sequence numbers wrap into 6 bits
        let wrapped = L2capControlField::new_i_frame(64, 65, false, SegmentationAndReassembly::Unsegmented);
        assert_eq!(
            wrapped,
            L2capControlField::new_i_frame(0, 1, false, SegmentationAndReassembly::Unsegmented)
        );
    }

    #[test]
    fn test_s_frame_with_payload_is_rejected() {
        let bytes = [0x03, 0x00, 0x40, 0x00, 0x01, 0x00, 0xFF];
        assert!(EnhancedFrame::decode(&bytes, FcsType::NoFcs).is_err());
    }

    #[test]
    fn test_truncated_frames() {
        assert!(matches!(
            EnhancedFrame::decode(&[0x01, 0x00, 0x40, 0x00, 0x01], FcsType::NoFcs),
            Err(CodecError::TooShort { .. })
        ));
        assert!(matches!(
            L2capPacket::parse(&[0x05, 0x00, 0x40, 0x00, 0x01]),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_sdu_length_prefix() {
        let payload = write_sdu_length(9, b"abc");
        assert_eq!(payload, vec![9, 0, b'a', b'b', b'c']);

        let (length, data) = read_sdu_length(&payload).unwrap();
        assert_eq!(length, 9);
        assert_eq!(data, b"abc");
        assert!(read_sdu_length(&[1]).is_err());
    }
}

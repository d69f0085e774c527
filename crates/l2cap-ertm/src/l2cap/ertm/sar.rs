//! Segmentation and reassembly of SDUs over I-frames

use crate::l2cap::constants::L2CAP_SDU_LENGTH_SIZE;
use crate::l2cap::packet::{read_sdu_length, write_sdu_length, SegmentationAndReassembly};
use crate::l2cap::types::{L2capError, L2capResult};
use log::trace;

/// One I-frame's worth of an SDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sar: SegmentationAndReassembly,
    /// I-frame information payload, SDU length included for a START segment
    pub payload: Vec<u8>,
}

/// Split an SDU into I-frame payloads no larger than `mps`
pub fn segment_sdu(sdu: &[u8], mps: usize) -> Vec<Segment> {
    if sdu.len() <= mps {
        return vec![Segment {
            sar: SegmentationAndReassembly::Unsegmented,
            payload: sdu.to_vec(),
        }];
    }

    // The START segment gives up room for the SDU length
    let first = mps.saturating_sub(L2CAP_SDU_LENGTH_SIZE).max(1);
    let chunk = mps.max(1);

    let mut segments = vec![Segment {
        sar: SegmentationAndReassembly::Start,
        payload: write_sdu_length(sdu.len() as u16, &sdu[..first]),
    }];

    let mut rest = &sdu[first..];
    while rest.len() > chunk {
        let (head, tail) = rest.split_at(chunk);
        segments.push(Segment {
            sar: SegmentationAndReassembly::Continuation,
            payload: head.to_vec(),
        });
        rest = tail;
    }
    segments.push(Segment {
        sar: SegmentationAndReassembly::End,
        payload: rest.to_vec(),
    });

    trace!("Segmented {} byte SDU into {} I-frames", sdu.len(), segments.len());
    segments
}

/// Rebuilds SDUs from in-sequence I-frame payloads
#[derive(Debug, Clone)]
pub struct Reassembler {
    /// Largest SDU we agreed to receive
    max_sdu: usize,
    buffer: Vec<u8>,
    /// Declared length of the SDU in progress
    expected: Option<usize>,
}

impl Reassembler {
    pub fn new(max_sdu: usize) -> Self {
        Self {
            max_sdu,
            buffer: Vec::new(),
            expected: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.expected.is_some()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected = None;
    }

    /// Feed the next in-sequence payload, returning a completed SDU
    ///
    /// Any error leaves the reassembler empty. The caller treats it as a
    /// protocol violation.
    pub fn push(
        &mut self,
        sar: SegmentationAndReassembly,
        payload: &[u8],
    ) -> L2capResult<Option<Vec<u8>>> {
        let result = self.push_inner(sar, payload);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn push_inner(
        &mut self,
        sar: SegmentationAndReassembly,
        payload: &[u8],
    ) -> L2capResult<Option<Vec<u8>>> {
        match sar {
            SegmentationAndReassembly::Unsegmented => {
                if self.in_progress() {
                    return Err(violation("unsegmented SDU inside a segmented one"));
                }
                if payload.len() > self.max_sdu {
                    return Err(violation("SDU exceeds MTU"));
                }
                Ok(Some(payload.to_vec()))
            }
            SegmentationAndReassembly::Start => {
                if self.in_progress() {
                    return Err(violation("START segment before previous SDU ended"));
                }
                let (sdu_length, data) = read_sdu_length(payload)?;
                let sdu_length = sdu_length as usize;
                if sdu_length > self.max_sdu {
                    return Err(violation("declared SDU length exceeds MTU"));
                }
                if data.len() >= sdu_length {
                    return Err(violation("START segment holds the whole SDU"));
                }
                self.buffer.extend_from_slice(data);
                self.expected = Some(sdu_length);
                Ok(None)
            }
            SegmentationAndReassembly::Continuation | SegmentationAndReassembly::End => {
                let expected = self
                    .expected
                    .ok_or_else(|| violation("segment without a START"))?;
                self.buffer.extend_from_slice(payload);

                let is_end = sar == SegmentationAndReassembly::End;
                match self.buffer.len() {
                    n if n > expected => Err(violation("SDU longer than declared")),
                    n if n == expected && is_end => {
                        self.expected = None;
                        Ok(Some(std::mem::take(&mut self.buffer)))
                    }
                    _ if is_end => Err(violation("SDU shorter than declared")),
                    n if n == expected => Err(violation("CONTINUATION completes the SDU")),
                    _ => Ok(None),
                }
            }
        }
    }
}

fn violation(reason: &str) -> L2capError {
    L2capError::ProtocolViolation(format!("reassembly: {}", reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_sdu_is_unsegmented() {
        let segments = segment_sdu(b"abc", 11);
        assert_eq!(
            segments,
            vec![Segment {
                sar: SegmentationAndReassembly::Unsegmented,
                payload: b"abc".to_vec(),
            }]
        );
    }

    #[test]
    fn test_segments_respect_mps() {
        let sdu = b"abc".repeat(7);
        let segments = segment_sdu(&sdu, 11);

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].sar, SegmentationAndReassembly::Start);
        assert_eq!(&segments[0].payload[..2], &[21, 0]);
        assert_eq!(&segments[0].payload[2..], b"abcabcabc");
        assert_eq!(segments[1].sar, SegmentationAndReassembly::Continuation);
        assert_eq!(segments[1].payload, b"abcabcabcab");
        assert_eq!(segments[2].sar, SegmentationAndReassembly::End);
        assert_eq!(segments[2].payload, b"c");
        assert!(segments.iter().all(|s| s.payload.len() <= 11));
    }

    #[test]
    fn test_reassembly_reconstructs_sdu() {
        let sdu: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for mps in [3, 10, 48, 999] {
            let mut reassembler = Reassembler::new(1000);
            let mut delivered = Vec::new();
            for segment in segment_sdu(&sdu, mps) {
                if let Some(complete) = reassembler.push(segment.sar, &segment.payload).unwrap() {
                    delivered.push(complete);
                }
            }
            assert_eq!(delivered, vec![sdu.clone()], "mps {}", mps);
            assert!(!reassembler.in_progress());
        }
    }

    #[test]
    fn test_segment_without_start_is_violation() {
        let mut reassembler = Reassembler::new(100);
        assert!(matches!(
            reassembler.push(SegmentationAndReassembly::End, b"abc"),
            Err(L2capError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_length_mismatch_is_violation() {
        let mut reassembler = Reassembler::new(100);
        reassembler
            .push(SegmentationAndReassembly::Start, &[6, 0, b'a', b'b'])
            .unwrap();
        assert!(reassembler.push(SegmentationAndReassembly::End, b"c").is_err());
        assert!(!reassembler.in_progress());

        reassembler
            .push(SegmentationAndReassembly::Start, &[3, 0, b'a', b'b'])
            .unwrap();
        assert!(reassembler
            .push(SegmentationAndReassembly::Continuation, b"cd")
            .is_err());
    }

    #[test]
    fn test_restart_while_in_progress_is_violation() {
        let mut reassembler = Reassembler::new(100);
        reassembler
            .push(SegmentationAndReassembly::Start, &[6, 0, b'a'])
            .unwrap();
        assert!(reassembler
            .push(SegmentationAndReassembly::Start, &[6, 0, b'a'])
            .is_err());
    }

    #[test]
    fn test_oversized_sdu_is_violation() {
        let mut reassembler = Reassembler::new(48);
        assert!(reassembler
            .push(SegmentationAndReassembly::Start, &[49, 0, b'a'])
            .is_err());
        assert!(reassembler
            .push(SegmentationAndReassembly::Unsegmented, &[0u8; 49])
            .is_err());
    }
}

//! Enhanced Retransmission Mode transfer engine
//!
//! One [`ErtmEngine`] runs per ERTM channel. It owns the transmit and receive
//! sequence state, the retransmission and monitor timers, and SAR. The engine
//! never touches the link: frames to send are queued and collected with
//! [`ErtmEngine::poll_transmit`], completed SDUs with
//! [`ErtmEngine::poll_sdu`].
//!
//! Gaps in the received sequence are recovered with REJ only, one per gap.
//! SREJ from the peer is honoured but never sent.

pub mod sar;
pub mod timer;


use self::sar::{segment_sdu, Reassembler, Segment};
use self::timer::{ErtmTimer, TimerTable};
use super::config::ErtmParameters;
use super::constants::L2CAP_SEQ_MODULO;
use super::packet::{EnhancedFrame, L2capControlField, SegmentationAndReassembly, SupervisoryFunction};
use super::types::{CloseReason, L2capError, L2capResult};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::Instant;

/// Transmit side state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Sending normally
    Xmit,
    /// A poll is outstanding, waiting for the F-bit
    WaitF,
}

/// Receive side state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Receiving in sequence
    Recv,
    /// A REJ is outstanding for `expected_tx_seq`
    RejSent,
}

/// Distance from `from` to `to` in sequence space
fn seq_offset(to: u8, from: u8) -> u8 {
    (to + L2CAP_SEQ_MODULO - from) % L2CAP_SEQ_MODULO
}

fn seq_next(seq: u8) -> u8 {
    (seq + 1) % L2CAP_SEQ_MODULO
}

/// An I-frame sent and not yet acknowledged
#[derive(Debug, Clone)]
struct UnackedFrame {
    tx_seq: u8,
    sar: SegmentationAndReassembly,
    payload: Vec<u8>,
    transmissions: u8,
}

/// Where a received TxSeq falls relative to what we expect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxSeqClass {
    Expected,
    /// Ahead of the expected sequence number, something was lost
    Unexpected,
    /// Already received
    Duplicate,
}

#[derive(Debug)]
pub struct ErtmEngine {
    params: ErtmParameters,
    tx_state: TxState,
    rx_state: RxState,

    next_tx_seq: u8,
    expected_ack_seq: u8,
    expected_tx_seq: u8,

    /// Ordered from `expected_ack_seq`
    unacked: VecDeque<UnackedFrame>,
    /// Segments waiting for window space
    pending: VecDeque<Segment>,

    retry_count: u8,
    remote_busy: bool,
    local_busy: bool,
    rnr_sent: bool,
    rej_actioned: bool,
    srej_actioned: bool,
    srej_save_req_seq: u8,
    /// Bit per TxSeq already resent for an SREJ and not yet acknowledged
    srej_retransmitted: u64,

    timers: TimerTable,
    reassembler: Reassembler,

    outbound: VecDeque<EnhancedFrame>,
    delivered: VecDeque<Vec<u8>>,
    failure: Option<CloseReason>,
}

impl ErtmEngine {
    /// `local_mtu` bounds the SDUs we reassemble
    pub fn new(params: ErtmParameters, local_mtu: u16) -> Self {
        debug!(
            "ERTM engine: tx window {}, max transmit {}, remote MPS {}",
            params.tx_window_size, params.max_transmit, params.remote_mps
        );
        Self {
            params,
            tx_state: TxState::Xmit,
            rx_state: RxState::Recv,
            next_tx_seq: 0,
            expected_ack_seq: 0,
            expected_tx_seq: 0,
            unacked: VecDeque::new(),
            pending: VecDeque::new(),
            retry_count: 0,
            remote_busy: false,
            local_busy: false,
            rnr_sent: false,
            rej_actioned: false,
            srej_actioned: false,
            srej_save_req_seq: 0,
            srej_retransmitted: 0,
            timers: TimerTable::default(),
            reassembler: Reassembler::new(local_mtu as usize),
            outbound: VecDeque::new(),
            delivered: VecDeque::new(),
            failure: None,
        }
    }

    pub fn params(&self) -> &ErtmParameters {
        &self.params
    }

    pub fn tx_state(&self) -> TxState {
        self.tx_state
    }

    pub fn rx_state(&self) -> RxState {
        self.rx_state
    }

    pub fn next_tx_seq(&self) -> u8 {
        self.next_tx_seq
    }

    pub fn expected_ack_seq(&self) -> u8 {
        self.expected_ack_seq
    }

    pub fn expected_tx_seq(&self) -> u8 {
        self.expected_tx_seq
    }

    pub fn unacked_frames(&self) -> usize {
        self.unacked.len()
    }

    pub fn pending_segments(&self) -> usize {
        self.pending.len()
    }

    pub fn remote_busy(&self) -> bool {
        self.remote_busy
    }

    pub fn local_busy(&self) -> bool {
        self.local_busy
    }

    /// Set once the engine gave up on the channel
    pub fn failure(&self) -> Option<&CloseReason> {
        self.failure.as_ref()
    }

    /// Next frame to put on the wire
    pub fn poll_transmit(&mut self) -> Option<EnhancedFrame> {
        self.outbound.pop_front()
    }

    /// Next SDU completed for the upper layer
    pub fn poll_sdu(&mut self) -> Option<Vec<u8>> {
        self.delivered.pop_front()
    }

    /// Earliest armed timer
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.peek()
    }

    /// Cancel every timer and drop queued data
    pub fn shutdown(&mut self) {
        self.timers.stop_all();
        self.pending.clear();
        self.unacked.clear();
        self.srej_retransmitted = 0;
        self.reassembler.reset();
    }

    /// Segment an SDU and transmit as much as the window allows
    pub fn send_sdu(&mut self, sdu: &[u8], now: Instant) -> L2capResult<()> {
        if self.failure.is_some() {
            return Err(L2capError::NotConnected);
        }
        if sdu.len() > u16::MAX as usize {
            return Err(L2capError::MtuExceeded);
        }
        let mps = self.params.remote_mps as usize;
        self.pending.extend(segment_sdu(sdu, mps));
        self.send_pending_i_frames(false, now);
        Ok(())
    }

    /// Feed a decoded I-frame or S-frame
    pub fn handle_frame(&mut self, frame: EnhancedFrame, now: Instant) {
        if self.failure.is_some() {
            return;
        }
        match frame.control {
            L2capControlField::Information {
                tx_seq,
                req_seq,
                final_bit,
                sar,
            } => self.recv_i_frame(tx_seq, req_seq, final_bit, sar, frame.payload, now),
            L2capControlField::Supervisory {
                function,
                req_seq,
                poll,
                final_bit,
            } => {
                trace!("Received {:?} req_seq {} P={} F={}", function, req_seq, poll, final_bit);
                match function {
                    SupervisoryFunction::ReceiverReady => self.recv_rr(req_seq, poll, final_bit, now),
                    SupervisoryFunction::Reject => self.recv_rej(req_seq, poll, final_bit, now),
                    SupervisoryFunction::ReceiverNotReady => {
                        self.recv_rnr(req_seq, poll, final_bit, now)
                    }
                    SupervisoryFunction::SelectiveReject => {
                        self.recv_srej(req_seq, poll, final_bit, now)
                    }
                }
            }
        }
    }

    /// Fire every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            if self.failure.is_some() {
                return;
            }
            match timer {
                ErtmTimer::Retransmission => self.retrans_timer_expired(now),
                ErtmTimer::Monitor => self.monitor_timer_expired(now),
            }
        }
    }

    /// The upper layer can (not) take more data
    pub fn set_local_busy(&mut self, busy: bool, now: Instant) {
        if self.failure.is_some() || busy == self.local_busy {
            return;
        }
        self.local_busy = busy;
        if busy {
            debug!("Local busy, sending RNR");
            self.send_s_frame(SupervisoryFunction::ReceiverNotReady, false, false);
            self.rnr_sent = true;
        } else if self.rnr_sent {
            debug!("Local busy cleared, polling peer");
            self.rnr_sent = false;
            if self.tx_state == TxState::Xmit {
                self.send_s_frame(SupervisoryFunction::ReceiverReady, true, false);
                self.retry_count = 1;
                self.timers.stop(ErtmTimer::Retransmission);
                self.start_monitor_timer(now);
                self.tx_state = TxState::WaitF;
            } else {
                self.send_s_frame(SupervisoryFunction::ReceiverReady, false, false);
            }
        }
    }

    fn recv_i_frame(
        &mut self,
        tx_seq: u8,
        req_seq: u8,
        final_bit: bool,
        sar: SegmentationAndReassembly,
        payload: Vec<u8>,
        now: Instant,
    ) {
        trace!("Received I-frame tx_seq {} req_seq {} F={} {:?}", tx_seq, req_seq, final_bit, sar);
        if !self.with_valid_req_seq(req_seq) {
            return self.close(CloseReason::ProtocolViolation(format!(
                "invalid ReqSeq {}",
                req_seq
            )));
        }

        let class = self.classify_tx_seq(tx_seq);
        let poll_answered = self.pass_to_tx(req_seq, final_bit, now);

        if self.local_busy {
            // No room upstream, the peer retransmits once we clear busy
            trace!("Dropping I-frame {} while locally busy", tx_seq);
            return;
        }

        match class {
            TxSeqClass::Expected => {
                self.expected_tx_seq = seq_next(self.expected_tx_seq);
                if self.rx_state == RxState::RejSent {
                    debug!("Gap filled at tx_seq {}", tx_seq);
                    self.rx_state = RxState::Recv;
                }
                match self.reassembler.push(sar, &payload) {
                    Ok(Some(sdu)) => self.delivered.push_back(sdu),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Reassembly failed: {}", e);
                        let reason = match e {
                            L2capError::ProtocolViolation(reason) => reason,
                            other => other.to_string(),
                        };
                        return self.close(CloseReason::ProtocolViolation(reason));
                    }
                }
                if poll_answered {
                    self.retransmit_after_final(now);
                }
                if self.failure.is_none() {
                    self.send_ack(now);
                }
            }
            TxSeqClass::Unexpected => {
                if self.rx_state == RxState::Recv {
                    debug!(
                        "Missing tx_seq {} (received {}), sending REJ",
                        self.expected_tx_seq, tx_seq
                    );
                    self.send_s_frame(SupervisoryFunction::Reject, false, false);
                    self.rx_state = RxState::RejSent;
                }
            }
            TxSeqClass::Duplicate => {
                trace!("Duplicate I-frame {}", tx_seq);
            }
        }
    }

    fn recv_rr(&mut self, req_seq: u8, poll: bool, final_bit: bool, now: Instant) {
        if !self.check_req_seq(req_seq) {
            return;
        }
        if poll {
            self.pass_to_tx(req_seq, final_bit, now);
            self.clear_remote_busy(now);
            self.send_i_or_rr_or_rnr(now);
        } else if final_bit {
            self.remote_busy = false;
            if self.pass_to_tx(req_seq, true, now) {
                self.retransmit_after_final(now);
            }
            self.send_pending_i_frames(false, now);
        } else {
            self.pass_to_tx(req_seq, false, now);
            self.clear_remote_busy(now);
            self.send_pending_i_frames(false, now);
        }
    }

    fn recv_rej(&mut self, req_seq: u8, poll: bool, final_bit: bool, now: Instant) {
        if !self.check_req_seq(req_seq) {
            return;
        }
        self.remote_busy = false;
        self.pass_to_tx(req_seq, final_bit, now);

        if final_bit && self.rej_actioned {
            // Already retransmitted for the REJ that preceded this poll response
            self.rej_actioned = false;
        } else {
            self.retransmit_i_frames(poll, now);
            if self.tx_state == TxState::WaitF {
                self.rej_actioned = true;
            }
        }
        self.send_pending_i_frames(false, now);
    }

    fn recv_rnr(&mut self, req_seq: u8, poll: bool, final_bit: bool, now: Instant) {
        if !self.check_req_seq(req_seq) {
            return;
        }
        debug!("Remote busy");
        self.remote_busy = true;
        self.pass_to_tx(req_seq, final_bit, now);
        self.timers.stop(ErtmTimer::Retransmission);
        if poll {
            self.send_rr_or_rnr(false, true);
        }
    }

    fn recv_srej(&mut self, req_seq: u8, poll: bool, final_bit: bool, now: Instant) {
        if !self.check_req_seq(req_seq) {
            return;
        }
        self.remote_busy = false;

        if poll {
            // A polled SREJ also acknowledges everything before req_seq,
            // and starts a new recovery cycle
            self.pass_to_tx(req_seq, final_bit, now);
            self.srej_retransmitted = 0;
            self.retransmit_requested_i_frame(req_seq, true, now);
            if self.tx_state == TxState::WaitF {
                self.srej_actioned = true;
                self.srej_save_req_seq = req_seq;
            }
            self.send_pending_i_frames(false, now);
        } else if final_bit {
            self.recv_f_bit(now);
            if self.srej_actioned && self.srej_save_req_seq == req_seq {
                self.srej_actioned = false;
            } else {
                self.retransmit_requested_i_frame(req_seq, false, now);
            }
        } else {
            self.retransmit_requested_i_frame(req_seq, false, now);
            if self.tx_state == TxState::WaitF {
                self.srej_actioned = true;
                self.srej_save_req_seq = req_seq;
            }
        }
    }

    fn retrans_timer_expired(&mut self, now: Instant) {
        if self.tx_state != TxState::Xmit {
            return;
        }
        debug!("Retransmission timer expired, polling peer");
        self.send_rr_or_rnr(true, false);
        self.retry_count = 1;
        self.start_monitor_timer(now);
        self.tx_state = TxState::WaitF;
    }

    fn monitor_timer_expired(&mut self, now: Instant) {
        if self.tx_state != TxState::WaitF {
            return;
        }
        if self.retry_count_less_than_max_transmit() {
            self.retry_count += 1;
            debug!("Monitor timer expired, poll attempt {}", self.retry_count);
            self.send_rr_or_rnr(true, false);
            self.start_monitor_timer(now);
        } else {
            warn!("No response to {} polls, giving up", self.retry_count);
            self.close(CloseReason::Timeout);
        }
    }

    /// Acknowledge frames up to `req_seq` and handle the F-bit.
    /// Returns true if this answered our outstanding poll.
    fn pass_to_tx(&mut self, req_seq: u8, final_bit: bool, now: Instant) -> bool {
        self.process_req_seq(req_seq, now);
        final_bit && self.recv_f_bit(now)
    }

    fn recv_f_bit(&mut self, now: Instant) -> bool {
        if self.tx_state != TxState::WaitF {
            return false;
        }
        trace!("Poll answered");
        self.timers.stop(ErtmTimer::Monitor);
        self.tx_state = TxState::Xmit;
        if !self.unacked.is_empty() && !self.remote_busy {
            self.start_retrans_timer(now);
        }
        true
    }

    fn process_req_seq(&mut self, req_seq: u8, now: Instant) {
        let acked = seq_offset(req_seq, self.expected_ack_seq) as usize;
        if acked == 0 {
            return;
        }
        for frame in self.unacked.drain(..acked.min(self.unacked.len())) {
            self.srej_retransmitted &= !(1u64 << frame.tx_seq);
        }
        self.expected_ack_seq = req_seq;
        trace!("Acknowledged up to {}, {} unacked", req_seq, self.unacked.len());

        if self.unacked.is_empty() {
            self.timers.stop(ErtmTimer::Retransmission);
        } else if self.tx_state == TxState::Xmit && !self.remote_busy {
            self.start_retrans_timer(now);
        }
    }

    /// Poll response received: resend what is still unacknowledged
    fn retransmit_after_final(&mut self, now: Instant) {
        if self.rej_actioned {
            self.rej_actioned = false;
            return;
        }
        self.retransmit_i_frames(false, now);
    }

    fn clear_remote_busy(&mut self, now: Instant) {
        if self.remote_busy && !self.unacked.is_empty() && self.tx_state == TxState::Xmit {
            self.start_retrans_timer(now);
        }
        self.remote_busy = false;
    }

    /// Retransmit every unacknowledged frame, the first with F set if answering a poll
    fn retransmit_i_frames(&mut self, poll: bool, now: Instant) {
        self.srej_retransmitted = 0;
        let mut final_bit = poll;
        for index in 0..self.unacked.len() {
            if !self.retransmit_at(index, final_bit) {
                return;
            }
            final_bit = false;
        }
        if !self.unacked.is_empty() && self.tx_state == TxState::Xmit {
            self.start_retrans_timer(now);
        }
    }

    fn retransmit_requested_i_frame(&mut self, req_seq: u8, poll: bool, now: Instant) {
        let index = seq_offset(req_seq, self.expected_ack_seq) as usize;
        if index >= self.unacked.len() {
            warn!("SREJ for {} which is not outstanding", req_seq);
            return;
        }
        let bit = 1u64 << req_seq;
        if !poll && self.srej_retransmitted & bit != 0 {
            trace!("I-frame {} already resent for SREJ", req_seq);
            return;
        }
        if self.retransmit_at(index, poll) {
            self.srej_retransmitted |= bit;
            if self.tx_state == TxState::Xmit {
                self.start_retrans_timer(now);
            }
        }
    }

    /// Resend one unacked frame, closing the channel if it has been sent too often
    fn retransmit_at(&mut self, index: usize, final_bit: bool) -> bool {
        let max_transmit = self.params.max_transmit;
        let req_seq = self.expected_tx_seq;
        let Some(frame) = self.unacked.get_mut(index) else {
            return false;
        };
        if max_transmit != 0 && frame.transmissions >= max_transmit {
            warn!(
                "I-frame {} sent {} times, giving up",
                frame.tx_seq, frame.transmissions
            );
            self.close(CloseReason::Timeout);
            return false;
        }
        frame.transmissions += 1;
        trace!("Retransmitting I-frame {} (attempt {})", frame.tx_seq, frame.transmissions);
        let out = EnhancedFrame::i_frame(frame.tx_seq, req_seq, final_bit, frame.sar, frame.payload.clone());
        self.outbound.push_back(out);
        true
    }

    /// Answer a poll with data if we can, else with RR/RNR
    fn send_i_or_rr_or_rnr(&mut self, now: Instant) {
        let mut answered = false;
        if self.local_busy {
            self.send_s_frame(SupervisoryFunction::ReceiverNotReady, false, true);
            answered = true;
        }
        if !answered {
            answered = self.send_pending_i_frames(true, now) > 0;
        }
        if !answered {
            self.send_s_frame(SupervisoryFunction::ReceiverReady, false, true);
        }
    }

    /// Acknowledge received I-frames, piggybacking on data where possible
    fn send_ack(&mut self, now: Instant) {
        if self.local_busy {
            self.send_s_frame(SupervisoryFunction::ReceiverNotReady, false, false);
        } else if self.send_pending_i_frames(false, now) == 0 {
            self.send_s_frame(SupervisoryFunction::ReceiverReady, false, false);
        }
    }

    /// Transmit queued segments while the window has room, returning how many went out
    fn send_pending_i_frames(&mut self, final_bit: bool, now: Instant) -> usize {
        if self.tx_state == TxState::WaitF || self.remote_busy {
            return 0;
        }
        let mut sent = 0;
        let mut final_bit = final_bit;
        while self.unacked.len() < self.params.tx_window_size as usize {
            let Some(segment) = self.pending.pop_front() else {
                break;
            };
            self.send_data(segment, final_bit, now);
            final_bit = false;
            sent += 1;
        }
        sent
    }

    fn send_data(&mut self, segment: Segment, final_bit: bool, now: Instant) {
        let tx_seq = self.next_tx_seq;
        trace!("Sending I-frame {} ({:?}, {} bytes)", tx_seq, segment.sar, segment.payload.len());
        self.outbound.push_back(EnhancedFrame::i_frame(
            tx_seq,
            self.expected_tx_seq,
            final_bit,
            segment.sar,
            segment.payload.clone(),
        ));
        self.unacked.push_back(UnackedFrame {
            tx_seq,
            sar: segment.sar,
            payload: segment.payload,
            transmissions: 1,
        });
        self.next_tx_seq = seq_next(tx_seq);
        if !self.timers.is_armed(ErtmTimer::Retransmission) {
            self.start_retrans_timer(now);
        }
    }

    fn send_rr_or_rnr(&mut self, poll: bool, final_bit: bool) {
        let function = if self.local_busy {
            SupervisoryFunction::ReceiverNotReady
        } else {
            SupervisoryFunction::ReceiverReady
        };
        self.send_s_frame(function, poll, final_bit);
    }

    fn send_s_frame(&mut self, function: SupervisoryFunction, poll: bool, final_bit: bool) {
        trace!("Sending {:?} req_seq {} P={} F={}", function, self.expected_tx_seq, poll, final_bit);
        self.outbound.push_back(EnhancedFrame::s_frame(
            function,
            self.expected_tx_seq,
            poll,
            final_bit,
        ));
    }

    fn start_retrans_timer(&mut self, now: Instant) {
        self.timers
            .set(ErtmTimer::Retransmission, now + self.params.retransmission_timeout);
    }

    fn start_monitor_timer(&mut self, now: Instant) {
        self.timers.stop(ErtmTimer::Retransmission);
        self.timers.set(ErtmTimer::Monitor, now + self.params.monitor_timeout);
    }

    fn retry_count_less_than_max_transmit(&self) -> bool {
        self.params.max_transmit == 0 || self.retry_count < self.params.max_transmit
    }

    /// ReqSeq must lie between the oldest unacked frame and the next to send
    fn with_valid_req_seq(&self, req_seq: u8) -> bool {
        seq_offset(req_seq, self.expected_ack_seq) <= seq_offset(self.next_tx_seq, self.expected_ack_seq)
    }

    fn check_req_seq(&mut self, req_seq: u8) -> bool {
        if self.with_valid_req_seq(req_seq) {
            return true;
        }
        self.close(CloseReason::ProtocolViolation(format!(
            "invalid ReqSeq {}",
            req_seq
        )));
        false
    }

    fn classify_tx_seq(&self, tx_seq: u8) -> TxSeqClass {
        match seq_offset(tx_seq, self.expected_tx_seq) {
            0 => TxSeqClass::Expected,
            ahead if ahead < self.params.rx_window_size => TxSeqClass::Unexpected,
            _ => TxSeqClass::Duplicate,
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.failure.is_some() {
            return;
        }
        warn!("ERTM engine closing: {}", reason);
        self.shutdown();
        self.outbound.clear();
        self.failure = Some(reason);
    }
}

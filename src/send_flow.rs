//! SendFlow: the outbound half of a flow.
//!
//! Holds its own buffer accounting, but performs no carrier I/O and holds
//! no reference back to the owning `Session` (Design Note 9): transmission
//! is driven by `Session::transmit_flow`, which calls the pure,
//! carrier-agnostic methods here and applies the resulting side effects
//! (bumping `flowBytesSent`, writing frames, re-queuing) itself.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{NexusError, Result};
use crate::priority::{FlowId, Priority};
use crate::receipt::{WriteMessage, WriteReceipt};

/// Initial receive-window guess used before the first DATA_ACK arrives,
/// matching the reference transport (not `default_rcvbuf`, which is the
/// *receiver*-side default advertised by a RecvFlow).
pub const INITIAL_SEND_THROUGH_ALLOWED: u64 = 65536;

/// Initial local soft send-buffer cap.
pub const INITIAL_SNDBUF: u64 = 65536;

/// Outcome of one single-step transmit attempt, for the Session's
/// transmit-pass loop to interpret.
pub(crate) enum TransmitStep {
    /// Emit the flow-open frame; caller should re-poll this flow.
    EmitOpen,
    /// Emit DATA_ABANDON with this count-minus-one; the abandoned receipts
    /// are returned so the caller can defer their `on_abandoned` callbacks.
    EmitAbandon {
        count_minus_one: u64,
        receipts: Vec<WriteReceipt>,
    },
    /// Emit FLOW_CLOSE; caller should re-poll (buffer now fully drained).
    EmitClose,
    /// Emit one fragment frame. `sent_receipt` is set when this fragment
    /// completed a message, for the caller to defer its `on_sent` callback.
    EmitFragment {
        data: Bytes,
        last: bool,
        sent_receipt: Option<WriteReceipt>,
    },
    /// No work could be done this step (priority mismatch, window
    /// exhaustion, or nothing pending).
    NoWork,
}

pub struct SendFlow {
    pub(crate) flow_id: FlowId,
    priority: Priority,
    send_buffer: VecDeque<WriteMessage>,
    send_buffer_byte_length: u64,
    sent_byte_count: u64,
    send_through_allowed: u64,
    rcvbuf: u64,
    sndbuf: u64,
    open: bool,
    writable_pending: bool,
    should_notify_when_writable: bool,
    acked_position: u64,
    open_frame_pending: bool,
    close_frame_pending: bool,
    pub(crate) return_flow_id: Option<FlowId>,
    pub(crate) metadata: Bytes,
    handler: Option<Box<dyn crate::callbacks::SendFlowHandler>>,
}

impl SendFlow {
    pub(crate) fn new(flow_id: FlowId, metadata: Bytes, return_flow_id: Option<FlowId>) -> Self {
        SendFlow {
            flow_id,
            priority: Priority::default(),
            send_buffer: VecDeque::new(),
            send_buffer_byte_length: 0,
            sent_byte_count: 0,
            send_through_allowed: INITIAL_SEND_THROUGH_ALLOWED,
            rcvbuf: INITIAL_SEND_THROUGH_ALLOWED,
            sndbuf: INITIAL_SNDBUF,
            open: true,
            writable_pending: false,
            should_notify_when_writable: false,
            acked_position: 0,
            open_frame_pending: true,
            close_frame_pending: true,
            return_flow_id,
            metadata,
            handler: None,
        }
    }

    pub fn set_handler(&mut self, handler: impl crate::callbacks::SendFlowHandler + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub(crate) fn take_handler(&mut self) -> Option<Box<dyn crate::callbacks::SendFlowHandler>> {
        self.handler.take()
    }

    pub(crate) fn restore_handler(&mut self, handler: Box<dyn crate::callbacks::SendFlowHandler>) {
        self.handler = Some(handler);
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn set_priority_raw(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn sndbuf(&self) -> u64 {
        self.sndbuf
    }

    pub(crate) fn set_sndbuf(&mut self, sndbuf: u64) {
        self.sndbuf = sndbuf;
    }

    pub fn rcvbuf(&self) -> u64 {
        self.rcvbuf
    }

    pub fn buffer_length(&self) -> u64 {
        self.send_buffer_byte_length
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn writable(&self) -> bool {
        self.is_open() && self.buffer_length() < self.sndbuf
    }

    /// Age of the first not-yet-abandoned queued message, or zero.
    pub fn unsent_age(&self) -> Duration {
        for message in &self.send_buffer {
            if !message.receipt.is_abandoned() {
                return message.receipt.age();
            }
        }
        Duration::ZERO
    }

    pub(crate) fn enqueue_write(
        &mut self,
        payload: Bytes,
        start_by: Option<Duration>,
        end_by: Option<Duration>,
    ) -> Result<WriteReceipt> {
        if !self.open {
            return Err(NexusError::NotOpen(self.flow_id));
        }
        let receipt = WriteReceipt::new(start_by, end_by);
        self.send_buffer_byte_length += payload.len() as u64;
        self.send_buffer
            .push_back(WriteMessage::new(payload, receipt.clone()));
        Ok(receipt)
    }

    pub(crate) fn request_close(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        true
    }

    /// Abandons queued messages from the front whose age is at least `age`,
    /// stopping at the first younger one.
    pub(crate) fn abandon_queued_messages(&mut self, age: Duration) {
        for message in &self.send_buffer {
            if message.receipt.age() >= age {
                message.receipt.mark_abandoned();
            } else {
                break;
            }
        }
    }

    pub(crate) fn notify_when_writable(&mut self) -> bool {
        self.should_notify_when_writable = true;
        if !self.writable_pending {
            self.writable_pending = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear_writable_pending(&mut self) {
        self.writable_pending = false;
    }

    pub(crate) fn should_notify_when_writable(&self) -> bool {
        self.should_notify_when_writable
    }

    pub(crate) fn disarm_writable_notify(&mut self) {
        self.should_notify_when_writable = false;
    }

    /// Pops abandoned messages from the front of the buffer, returning their
    /// receipts.
    fn trim_send_buffer(&mut self) -> Vec<WriteReceipt> {
        let mut abandoned = Vec::new();
        while let Some(message) = self.send_buffer.front() {
            if message.receipt.is_abandoned() {
                message.receipt.mark_abandoned();
                self.send_buffer_byte_length -= message.payload.len() as u64;
                let message = self.send_buffer.pop_front().expect("checked above");
                abandoned.push(message.receipt);
            } else {
                break;
            }
        }
        abandoned
    }

    /// Whether this flow still needs a transmit turn (an open/close frame
    /// pending, data queued, or a close awaiting its final frame).
    pub(crate) fn has_pending_work(&self) -> bool {
        self.open_frame_pending
            || !self.send_buffer.is_empty()
            || (!self.open && self.close_frame_pending)
    }

    /// One single-step transmit attempt for priority `active_priority`.
    /// Mirrors `_transmit`; does not itself talk to the carrier.
    pub(crate) fn step(&mut self, active_priority: Priority, chunk_size: u64) -> TransmitStep {
        if active_priority != self.priority {
            return TransmitStep::NoWork;
        }

        if self.open_frame_pending {
            return TransmitStep::EmitOpen;
        }

        let abandoned = self.trim_send_buffer();
        if !abandoned.is_empty() {
            let count_minus_one = abandoned.len() as u64 - 1;
            return TransmitStep::EmitAbandon {
                count_minus_one,
                receipts: abandoned,
            };
        }

        if self.send_buffer.is_empty() && !self.open && self.close_frame_pending {
            return TransmitStep::EmitClose;
        }

        if self.sent_byte_count >= self.send_through_allowed {
            return TransmitStep::NoWork;
        }

        self.next_fragment(chunk_size)
    }

    fn next_fragment(&mut self, chunk_size: u64) -> TransmitStep {
        let Some(message) = self.send_buffer.front() else {
            return TransmitStep::NoWork;
        };
        if message.receipt.is_abandoned() {
            return TransmitStep::NoWork;
        }

        let window = self.send_through_allowed.saturating_sub(self.sent_byte_count);
        let take = chunk_size.min(window).min(message.remaining() as u64) as usize;
        if take == 0 {
            return TransmitStep::NoWork;
        }

        let message = self.send_buffer.front_mut().expect("checked above");
        let offset_from = message.offset;
        let offset_to = offset_from + take;
        let fragment = message.payload.slice(offset_from..offset_to);
        let is_last = offset_to == message.payload.len();
        message.offset = offset_to;
        message.receipt.mark_started();

        let sent_receipt = if is_last {
            let message = self.send_buffer.pop_front().expect("checked above");
            self.send_buffer_byte_length -= message.payload.len() as u64;
            message.receipt.mark_sent();
            Some(message.receipt)
        } else {
            None
        };

        TransmitStep::EmitFragment {
            data: fragment,
            last: is_last,
            sent_receipt,
        }
    }

    /// Records that `wire_bytes` were just sent as a frame of this flow
    /// (counted as encoded wire bytes -- code + flow-id VLU + payload --
    /// matching the reference transport's `len(fragmentMessage)`
    /// accounting, not just payload bytes).
    pub(crate) fn record_sent_wire_bytes(&mut self, wire_bytes: u64) {
        self.sent_byte_count += wire_bytes;
    }

    pub(crate) fn mark_open_sent(&mut self) {
        self.open_frame_pending = false;
    }

    pub(crate) fn mark_close_sent(&mut self) {
        self.close_frame_pending = false;
    }

    /// Applies a DATA_ACK; returns the delta to add to the session's
    /// `flowBytesAcked`.
    pub(crate) fn apply_ack(&mut self, position: u64, advertisement: u64) -> u64 {
        let delta = position.saturating_sub(self.acked_position);
        self.acked_position = self.acked_position.max(position);
        self.rcvbuf = advertisement;
        self.send_through_allowed = position + advertisement;
        delta
    }

    pub(crate) fn acked_position(&self) -> u64 {
        self.acked_position
    }

    /// Applies a remote-originated (or session-synthesized) exception:
    /// closes the flow and abandons everything unconditionally.
    pub(crate) fn apply_exception(&mut self) {
        self.open = false;
        self.abandon_queued_messages(Duration::ZERO);
    }

    /// Abandons every receipt still in the buffer and invokes their
    /// `on_abandoned` callback immediately; used at session close, where
    /// there is no further drive loop turn to defer through.
    pub(crate) fn drain_all_receipts_as_abandoned(&mut self) {
        for message in self.send_buffer.drain(..) {
            message.receipt.mark_abandoned();
            message.receipt.invoke_on_abandoned();
        }
        self.send_buffer_byte_length = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_flow() -> SendFlow {
        SendFlow::new(FlowId(0), Bytes::from_static(b"hi"), None)
    }

    #[test]
    fn write_enqueues_and_tracks_buffer_length() {
        let mut flow = new_flow();
        let receipt = flow.enqueue_write(Bytes::from_static(b"hello"), None, None).unwrap();
        assert_eq!(flow.buffer_length(), 5);
        assert!(!receipt.is_sent());
    }

    #[test]
    fn write_after_close_fails() {
        let mut flow = new_flow();
        flow.request_close();
        let err = flow.enqueue_write(Bytes::from_static(b"x"), None, None);
        assert!(matches!(err, Err(NexusError::NotOpen(_))));
    }

    #[test]
    fn first_step_emits_open_frame() {
        let mut flow = new_flow();
        flow.enqueue_write(Bytes::from_static(b"hello"), None, None).unwrap();
        assert!(matches!(
            flow.step(Priority::Routine, 1400),
            TransmitStep::EmitOpen
        ));
        flow.mark_open_sent();
        match flow.step(Priority::Routine, 1400) {
            TransmitStep::EmitFragment { data, last, sent_receipt } => {
                assert_eq!(&data[..], b"hello");
                assert!(last);
                assert!(sent_receipt.is_some());
            }
            _ => panic!("expected a fragment"),
        }
    }

    #[test]
    fn wrong_priority_yields_no_work() {
        let mut flow = new_flow();
        flow.mark_open_sent();
        flow.enqueue_write(Bytes::from_static(b"x"), None, None).unwrap();
        assert!(matches!(
            flow.step(Priority::Flash, 1400),
            TransmitStep::NoWork
        ));
    }

    #[test]
    fn fragmentation_respects_chunk_size_and_window() {
        let mut flow = new_flow();
        flow.mark_open_sent();
        let payload = Bytes::from(vec![0u8; 3500]);
        flow.enqueue_write(payload, None, None).unwrap();
        flow.apply_ack(0, 1000);

        let step = flow.step(Priority::Routine, 1400);
        match step {
            TransmitStep::EmitFragment { data, last, sent_receipt } => {
                assert_eq!(data.len(), 1000);
                assert!(!last);
                assert!(sent_receipt.is_none());
            }
            _ => panic!("expected first fragment capped by window"),
        }
        flow.record_sent_wire_bytes(1000);
        assert!(matches!(
            flow.step(Priority::Routine, 1400),
            TransmitStep::NoWork
        ));
    }

    #[test]
    fn abandon_before_send_produces_single_abandon_step() {
        let mut flow = new_flow();
        flow.mark_open_sent();
        flow.enqueue_write(Bytes::from_static(b"a"), Some(Duration::from_millis(1)), None)
            .unwrap();
        flow.enqueue_write(Bytes::from_static(b"b"), Some(Duration::from_millis(1)), None)
            .unwrap();
        flow.enqueue_write(Bytes::from_static(b"c"), Some(Duration::from_millis(1)), None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        match flow.step(Priority::Routine, 1400) {
            TransmitStep::EmitAbandon { count_minus_one, receipts } => {
                assert_eq!(count_minus_one, 2);
                assert_eq!(receipts.len(), 3);
            }
            _ => panic!("expected an abandon step"),
        }
        assert_eq!(flow.buffer_length(), 0);
    }

    #[test]
    fn ack_advances_monotonically() {
        let mut flow = new_flow();
        assert_eq!(flow.apply_ack(100, 500), 100);
        assert_eq!(flow.acked_position(), 100);
        assert_eq!(flow.apply_ack(50, 500), 0);
        assert_eq!(flow.acked_position(), 100);
        assert_eq!(flow.apply_ack(200, 500), 100);
        assert_eq!(flow.acked_position(), 200);
    }
}

//! RecvFlow: the inbound half of a flow.
//!
//! Like `SendFlow`, holds no back-reference to the owning `Session`;
//! reassembly and buffer accounting live here, while the ack/delivery
//! scheduling and carrier I/O are driven by `Session`.

use std::collections::VecDeque;
use std::str::Utf8Error;

use bytes::Bytes;

use crate::callbacks::RecvFlowHandler;
use crate::priority::{FlowId, Priority};

/// How a reassembled message's bytes are interpreted for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    Binary,
    Text,
    Unicode,
}

impl Default for RecvMode {
    fn default() -> Self {
        RecvMode::Binary
    }
}

/// A delivered, fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveredMessage {
    Binary(Bytes),
    Text(String),
    Unicode(String),
}

struct ReadMessage {
    message_number: u64,
    fragments: Vec<Bytes>,
    total_length: u64,
    complete: bool,
}

impl ReadMessage {
    fn new(message_number: u64) -> Self {
        ReadMessage {
            message_number,
            fragments: Vec::new(),
            total_length: 0,
            complete: false,
        }
    }

    fn add_fragment(&mut self, more: bool, bytes: Bytes) {
        self.total_length += bytes.len() as u64;
        self.fragments.push(bytes);
        if !more {
            self.complete = true;
        }
    }

    fn concat(&self) -> Bytes {
        if self.fragments.len() == 1 {
            return self.fragments[0].clone();
        }
        let mut buf = Vec::with_capacity(self.total_length as usize);
        for fragment in &self.fragments {
            buf.extend_from_slice(fragment);
        }
        Bytes::from(buf)
    }
}

/// Action the Session must still take after an inbound event on this flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlowAction {
    pub queue_delivery: bool,
    pub queue_ack: bool,
    pub queue_ack_immediate: bool,
}

impl FlowAction {
    const NONE: FlowAction = FlowAction {
        queue_delivery: false,
        queue_ack: false,
        queue_ack_immediate: false,
    };
}

pub struct RecvFlow {
    pub(crate) flow_id: FlowId,
    metadata: Bytes,
    pub(crate) associated_send_flow: Option<FlowId>,
    user_open: bool,
    open: bool,
    paused: bool,
    receive_buffer: VecDeque<ReadMessage>,
    receive_buffer_byte_length: u64,
    received_byte_count: u64,
    complete: bool,
    sent_complete: bool,
    sent_close_ack: bool,
    next_message_number: u64,
    delivery_pending: bool,
    mode: RecvMode,
    rcvbuf: u64,
    handler: Option<Box<dyn RecvFlowHandler>>,
}

impl RecvFlow {
    pub(crate) fn new(
        flow_id: FlowId,
        metadata: Bytes,
        associated_send_flow: Option<FlowId>,
        default_rcvbuf: u64,
    ) -> Self {
        RecvFlow {
            flow_id,
            metadata,
            associated_send_flow,
            user_open: false,
            open: true,
            paused: false,
            receive_buffer: VecDeque::new(),
            receive_buffer_byte_length: 0,
            received_byte_count: 0,
            complete: false,
            sent_complete: false,
            sent_close_ack: false,
            next_message_number: 1,
            delivery_pending: false,
            mode: RecvMode::default(),
            rcvbuf: default_rcvbuf,
            handler: None,
        }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    /// Best-effort UTF-8 interpretation of the opaque metadata bytes.
    pub fn metadata_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.metadata).ok()
    }

    pub fn associated_send_flow(&self) -> Option<FlowId> {
        self.associated_send_flow
    }

    pub fn is_open(&self) -> bool {
        self.open && self.user_open
    }

    pub fn buffer_length(&self) -> u64 {
        self.receive_buffer_byte_length
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn mode(&self) -> RecvMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RecvMode) {
        self.mode = mode;
    }

    pub fn rcvbuf(&self) -> u64 {
        self.rcvbuf
    }

    pub fn advertisement(&self) -> u64 {
        if self.paused {
            self.rcvbuf.saturating_sub(self.buffer_length())
        } else {
            self.rcvbuf
        }
    }

    pub fn set_handler(&mut self, handler: impl RecvFlowHandler + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub(crate) fn take_handler(&mut self) -> Option<Box<dyn RecvFlowHandler>> {
        self.handler.take()
    }

    pub(crate) fn restore_handler(&mut self, handler: Box<dyn RecvFlowHandler>) {
        self.handler = Some(handler);
    }

    /// Accepts the flow, allowing delivery. Must be called (synchronously,
    /// by app code inside its `on_recv_flow` callback) or the session will
    /// auto-close the flow as "not accepted".
    pub fn accept(&mut self) {
        if self.open {
            self.user_open = true;
        }
    }

    /// Sets the advertised receive window; returns whether this requests an
    /// immediate ACK (the value actually changed).
    pub(crate) fn set_rcvbuf(&mut self, value: u64) -> bool {
        let changed = value != self.rcvbuf;
        self.rcvbuf = value.max(0);
        changed
    }

    /// Sets paused state; returns the FlowAction the session must apply.
    /// Un-pausing reschedules delivery and, if it was paused, requests an
    /// immediate ACK -- this is the corrected behavior for the source's
    /// dead `self._queueDelivery` statement (see SPEC_FULL.md §4.3).
    pub(crate) fn set_paused(&mut self, value: bool) -> FlowAction {
        let was_paused = self.paused;
        self.paused = value;
        if self.paused {
            return FlowAction::NONE;
        }
        FlowAction {
            queue_delivery: !self.delivery_pending,
            queue_ack: was_paused,
            queue_ack_immediate: was_paused,
        }
    }

    pub(crate) fn mark_delivery_armed(&mut self) {
        self.delivery_pending = true;
    }

    pub(crate) fn clear_delivery_armed(&mut self) {
        self.delivery_pending = false;
    }

    pub(crate) fn delivery_pending(&self) -> bool {
        self.delivery_pending
    }

    pub(crate) fn sent_close_ack(&self) -> bool {
        self.sent_close_ack
    }

    pub(crate) fn mark_close_ack_sent(&mut self) {
        self.sent_close_ack = true;
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn received_byte_count(&self) -> u64 {
        self.received_byte_count
    }

    /// Applies one DATA_MORE/DATA_LAST fragment. `wire_bytes` is the full
    /// encoded frame length, matching the sender's wire-byte accounting.
    pub(crate) fn on_data(&mut self, more: bool, fragment: Bytes, wire_bytes: u64) -> FlowAction {
        self.received_byte_count += wire_bytes;
        self.receive_buffer_byte_length += fragment.len() as u64;

        let needs_new_message = match self.receive_buffer.back() {
            None => true,
            Some(last) => last.complete,
        };
        if needs_new_message {
            let message = ReadMessage::new(self.next_message_number);
            self.next_message_number += 1;
            self.receive_buffer.push_back(message);
        }
        let message = self.receive_buffer.back_mut().expect("just ensured");
        message.add_fragment(more, fragment);
        let became_complete = message.complete;

        FlowAction {
            queue_delivery: became_complete,
            queue_ack: true,
            queue_ack_immediate: false,
        }
    }

    /// Applies a DATA_ABANDON; `count_minus_one` decodes to `count`.
    pub(crate) fn on_data_abandon(&mut self, count_minus_one: u64) -> FlowAction {
        let mut count = count_minus_one + 1;
        if let Some(last) = self.receive_buffer.back() {
            if !last.complete {
                let dropped = self.receive_buffer.pop_back().expect("checked above");
                self.receive_buffer_byte_length -= dropped.total_length;
                count -= 1;
            }
        }
        self.next_message_number += count;
        FlowAction {
            queue_delivery: false,
            queue_ack: true,
            queue_ack_immediate: true,
        }
    }

    pub(crate) fn on_flow_close_message(&mut self) -> FlowAction {
        self.complete = true;
        let abandon_action = self.on_data_abandon(0);
        FlowAction {
            queue_delivery: true,
            queue_ack: abandon_action.queue_ack,
            queue_ack_immediate: true,
        }
    }

    /// Pops the next complete messages off the front of the buffer for
    /// delivery, stopping at the first incomplete one (a gap blocks
    /// delivery). Returns the decoded messages plus whether `on_complete`
    /// should now fire.
    pub(crate) fn drain_deliverable(
        &mut self,
    ) -> (Vec<(u64, Result<DeliveredMessage, Utf8Error>)>, bool) {
        let mut delivered = Vec::new();
        while !self.paused && self.is_open() {
            let Some(front) = self.receive_buffer.front() else {
                break;
            };
            if !front.complete {
                break;
            }
            let message = self.receive_buffer.pop_front().expect("checked above");
            self.receive_buffer_byte_length -= message.total_length;
            let number = message.message_number;
            let decoded = self.decode(message.concat());
            delivered.push((number, decoded));
        }

        let should_report_complete = self.complete && !self.sent_complete && self.is_open();
        if should_report_complete {
            self.sent_complete = true;
        }
        (delivered, should_report_complete)
    }

    fn decode(&self, bytes: Bytes) -> Result<DeliveredMessage, Utf8Error> {
        match self.mode {
            RecvMode::Binary => Ok(DeliveredMessage::Binary(bytes)),
            RecvMode::Text => std::str::from_utf8(&bytes).map(|s| DeliveredMessage::Text(s.to_string())),
            RecvMode::Unicode => {
                std::str::from_utf8(&bytes).map(|s| DeliveredMessage::Unicode(s.to_string()))
            }
        }
    }

    /// User-initiated close. Returns `Some(frame-worthy reason)` if a
    /// FLOW_EXCEPTION should be sent (the peer had not already completed).
    pub(crate) fn user_close(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.user_open = false;
        self.open = false;
        self.rcvbuf = 0;
        !self.complete
    }
}

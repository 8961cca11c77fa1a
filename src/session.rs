//! `Session`: the central coordinator owning every flow, the transmit
//! scheduler, ack coalescing, and the bandwidth-delay-product estimate.
//!
//! Mirrors the reference transport's single connection object, but holds no
//! event loop of its own: `receive`/`write`/`open_flow`/etc. are called
//! synchronously by the embedder, and anything the source deferred with
//! `callLater` is instead pushed onto `deferred` and drained by
//! `drive_pending` before the triggering call returns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::callbacks::SessionHandler;
use crate::carrier::Carrier;
use crate::config::SessionConfig;
use crate::error::{NexusError, Result};
use crate::frame::Frame;
use crate::priority::{FlowId, Priority, PRIORITY_LEVELS};
use crate::receipt::WriteReceipt;
use crate::recv_flow::RecvFlow;
use crate::rtt::RttEstimator;
use crate::send_flow::{SendFlow, TransmitStep};

/// Tasks deferred to a later point in the same `drive_pending` drain, the
/// translation of the reference transport's `callLater(...)`.
enum DeferredTask {
    TransmitPass,
    FlushAcks,
    DeliverData(FlowId),
    WritableNotify(FlowId),
    ReceiptSent(WriteReceipt),
    ReceiptAbandoned(WriteReceipt),
}

/// The in-flight bandwidth-delay-product probe: armed when data is sent past
/// the previous sample's anchor, resolved once the peer's cumulative ack
/// position reaches `anchor_position` so the elapsed time can be trusted as
/// an RTT sample.
struct RttProbe {
    armed_at: Instant,
    anchor_position: u64,
}

pub struct Session<C: Carrier> {
    carrier: C,
    config: SessionConfig,
    handler: Option<Box<dyn SessionHandler>>,

    send_flows: HashMap<FlowId, SendFlow>,
    recv_flows: HashMap<FlowId, RecvFlow>,

    free_send_ids: VecDeque<u64>,
    next_send_id: u64,

    priority_queues: [VecDeque<FlowId>; PRIORITY_LEVELS],
    queued: HashSet<FlowId>,
    transmit_pass_armed: bool,

    pending_acks: HashMap<FlowId, bool>,
    ack_flush_armed: bool,

    deferred: VecDeque<DeferredTask>,

    open: bool,
    paused: bool,

    total_sent_wire_bytes: u64,
    total_acked_bytes: u64,
    rtt_previous_position: u64,
    rtt: RttEstimator,
    rtt_probe: Option<RttProbe>,
    outstanding_thresh: u64,

    /// Bytes received across all flows since the last time this tripped an
    /// immediate ack flush (§4.1 / rtws.py's `recvAccumulator`).
    recv_accumulator: u64,
}

impl<C: Carrier> Session<C> {
    pub fn new(carrier: C, config: SessionConfig) -> Self {
        let rtt = RttEstimator::new(config.rtt_history_thresh, config.rtt_history_capacity);
        let outstanding_thresh = config.initial_outstanding_thresh;
        Session {
            carrier,
            config,
            handler: None,
            send_flows: HashMap::new(),
            recv_flows: HashMap::new(),
            free_send_ids: VecDeque::new(),
            next_send_id: 0,
            priority_queues: Default::default(),
            queued: HashSet::new(),
            transmit_pass_armed: false,
            pending_acks: HashMap::new(),
            ack_flush_armed: false,
            deferred: VecDeque::new(),
            open: true,
            paused: false,
            total_sent_wire_bytes: 0,
            total_acked_bytes: 0,
            rtt_previous_position: 0,
            rtt,
            rtt_probe: None,
            outstanding_thresh,
            recv_accumulator: 0,
        }
    }

    /// `Session::new(carrier, SessionConfig::default())`, for callers that
    /// don't need to tune any of the transport's knobs.
    pub fn with_defaults(carrier: C) -> Self {
        Self::new(carrier, SessionConfig::default())
    }

    pub fn set_handler(&mut self, handler: impl SessionHandler + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// `flowBytesSent - flowBytesAcked` (§3 invariant 2: always non-negative).
    pub fn bytes_inflight(&self) -> u64 {
        self.total_sent_wire_bytes
            .saturating_sub(self.total_acked_bytes)
    }

    /// The sliding-window minimum RTT sample, or `None` before the first
    /// measurement.
    pub fn base_rtt(&self) -> Option<Duration> {
        self.rtt.base_rtt()
    }

    /// The EWMA-smoothed RTT, or `None` before the first measurement.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.smoothed_rtt()
    }

    pub fn send_flow(&self, id: FlowId) -> Option<&SendFlow> {
        self.send_flows.get(&id)
    }

    pub fn send_flow_mut(&mut self, id: FlowId) -> Option<&mut SendFlow> {
        self.send_flows.get_mut(&id)
    }

    pub fn recv_flow(&self, id: FlowId) -> Option<&RecvFlow> {
        self.recv_flows.get(&id)
    }

    pub fn recv_flow_mut(&mut self, id: FlowId) -> Option<&mut RecvFlow> {
        self.recv_flows.get_mut(&id)
    }

    // ---- flow-id allocation ----------------------------------------

    /// Pulls one free send-flow id, minting a fresh batch first if the pool
    /// has dropped below `send_flow_id_refresh`. IDs are only ever minted
    /// (monotonically) or recycled back in via `FLOW_CLOSE_ACK`/a local
    /// `FLOW_EXCEPTION`, never guessed or reused out of order.
    fn next_free_send_id(&mut self) -> u64 {
        if self.free_send_ids.len() < self.config.send_flow_id_refresh {
            for _ in 0..self.config.send_flow_id_batch_size {
                self.free_send_ids.push_back(self.next_send_id);
                self.next_send_id += 1;
            }
        }
        self.free_send_ids
            .pop_front()
            .expect("just refilled above")
    }

    fn recycle_send_id(&mut self, id: FlowId) {
        self.free_send_ids.push_back(id.0);
    }

    // ---- opening flows ------------------------------------------------

    /// Opens a new locally-initiated flow and queues its FLOW_OPEN frame.
    pub fn open_flow(&mut self, metadata: impl Into<Bytes>, priority: Priority) -> Result<FlowId> {
        if !self.open {
            return Err(NexusError::SessionClosed);
        }
        let id = FlowId(self.next_free_send_id());
        let mut flow = SendFlow::new(id, metadata.into(), None);
        flow.set_priority_raw(priority);
        self.send_flows.insert(id, flow);
        self.queue_for_transmit(id);
        tracing::info!(flow_id = %id, priority = priority.as_u8(), "flow opened");
        Ok(id)
    }

    /// Opens a flow in reply to an inbound `flow`, so the peer can associate
    /// the two via FLOW_OPEN_RETURN.
    pub fn open_return_flow(
        &mut self,
        in_reply_to: FlowId,
        metadata: impl Into<Bytes>,
        priority: Priority,
    ) -> Result<FlowId> {
        if !self.open {
            return Err(NexusError::SessionClosed);
        }
        let id = FlowId(self.next_free_send_id());
        let mut flow = SendFlow::new(id, metadata.into(), Some(in_reply_to));
        flow.set_priority_raw(priority);
        self.send_flows.insert(id, flow);
        self.queue_for_transmit(id);
        Ok(id)
    }

    pub fn write(
        &mut self,
        flow: FlowId,
        payload: impl Into<Bytes>,
        start_by: Option<Duration>,
        end_by: Option<Duration>,
    ) -> Result<WriteReceipt> {
        let send_flow = self
            .send_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        let receipt = send_flow.enqueue_write(payload.into(), start_by, end_by)?;
        tracing::trace!(flow_id = %flow, "message enqueued");
        self.queue_for_transmit(flow);
        Ok(receipt)
    }

    pub fn close_flow(&mut self, flow: FlowId) -> Result<()> {
        let send_flow = self
            .send_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        if send_flow.request_close() {
            tracing::debug!(flow_id = %flow, "flow close requested");
            self.queue_for_transmit(flow);
        }
        Ok(())
    }

    /// Abandons queued messages from the front of `flow`'s send buffer whose
    /// receipt age is at least `age`, per `SendFlow::abandon_queued_messages`.
    /// Actual removal (and the DATA_ABANDON frame) happens on the flow's
    /// next transmit step, so this re-queues the flow for transmission.
    pub fn abandon_queued_messages(&mut self, flow: FlowId, age: Duration) -> Result<()> {
        let send_flow = self
            .send_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        send_flow.abandon_queued_messages(age);
        self.queue_for_transmit(flow);
        Ok(())
    }

    /// Changes `flow`'s transmit priority, moving it between the Session's
    /// priority queues if it is currently queued for transmission. A
    /// `SendFlow::step` call that observes a stale priority only ever
    /// returns `NoWork` (§4.2 point 1) -- this is the "setter" responsible
    /// for actually re-enqueuing the flow at its new level.
    pub fn set_priority(&mut self, flow: FlowId, priority: Priority) -> Result<()> {
        let send_flow = self
            .send_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        let old_priority = send_flow.priority();
        if old_priority == priority {
            return Ok(());
        }
        send_flow.set_priority_raw(priority);
        if self.queued.contains(&flow) {
            self.priority_queues[old_priority.index()].retain(|&id| id != flow);
            self.priority_queues[priority.index()].push_back(flow);
        }
        Ok(())
    }

    /// Sets `flow`'s local soft send-buffer cap. Raising `sndbuf` can make
    /// an already-full flow writable again, so this arms the deferred
    /// `on_writable` callback the same way an ack or a drained send would.
    pub fn set_sndbuf(&mut self, flow: FlowId, sndbuf: u64) -> Result<()> {
        let send_flow = self
            .send_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        send_flow.set_sndbuf(sndbuf);
        self.arm_writable_notify_if_pending(flow);
        Ok(())
    }

    /// Requests the send-flow's notify-when-writable hook (`on_writable`)
    /// fire the next time the flow has send-buffer headroom.
    pub fn notify_when_writable(&mut self, flow: FlowId) -> Result<()> {
        let send_flow = self
            .send_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        if send_flow.notify_when_writable() {
            self.deferred.push_back(DeferredTask::WritableNotify(flow));
        }
        Ok(())
    }

    /// App-initiated close of an inbound flow. If the peer has not already
    /// finished sending (no FLOW_CLOSE seen yet), sends FLOW_EXCEPTION with
    /// `reason` and leaves the flow in the map until the peer's resulting
    /// FLOW_CLOSE arrives and the handshake completes via
    /// `finish_recv_flow`. If the peer had already finished, the handshake
    /// is already in hand, so we finish it here directly.
    pub fn close_recv_flow(&mut self, flow: FlowId, reason: Option<(u64, &str)>) -> Result<()> {
        let recv_flow = self
            .recv_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        let needs_exception = recv_flow.user_close();
        if needs_exception {
            let (code, description) = reason.unwrap_or((0, ""));
            self.send_frame(Frame::FlowException {
                flow_id: flow,
                reason: Some((code, Bytes::copy_from_slice(description.as_bytes()))),
            })?;
        } else {
            self.finish_recv_flow(flow)?;
        }
        Ok(())
    }

    /// Sets `flow`'s advertised receive window. A changed value requests an
    /// immediate ACK (§4.3), since the peer needs to see the new
    /// advertisement promptly rather than waiting for the next coalesced
    /// flush.
    pub fn set_recv_rcvbuf(&mut self, flow: FlowId, value: u64) -> Result<()> {
        let recv_flow = self
            .recv_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        if recv_flow.set_rcvbuf(value) {
            let entry = self.pending_acks.entry(flow).or_insert(false);
            *entry = true;
            self.arm_ack_flush();
        }
        Ok(())
    }

    /// Sets `flow`'s paused state. Un-pausing reschedules delivery and
    /// requests an immediate ACK (§4.3, §9's decided fix for the source's
    /// dead `_queueDelivery` statement).
    pub fn set_recv_paused(&mut self, flow: FlowId, paused: bool) -> Result<()> {
        let recv_flow = self
            .recv_flows
            .get_mut(&flow)
            .ok_or(NexusError::UnknownFlow(flow))?;
        let action = recv_flow.set_paused(paused);
        self.apply_recv_flow_action(flow, action);
        Ok(())
    }

    fn queue_for_transmit(&mut self, flow: FlowId) {
        if self.queued.insert(flow) {
            let priority = self
                .send_flows
                .get(&flow)
                .map(|f| f.priority())
                .unwrap_or_default();
            self.priority_queues[priority.index()].push_back(flow);
        }
        self.arm_transmit_pass();
    }

    fn arm_transmit_pass(&mut self) {
        if !self.transmit_pass_armed {
            self.transmit_pass_armed = true;
            self.deferred.push_back(DeferredTask::TransmitPass);
        }
    }

    fn arm_ack_flush(&mut self) {
        if !self.ack_flush_armed {
            self.ack_flush_armed = true;
            self.deferred.push_back(DeferredTask::FlushAcks);
        }
    }

    // ---- inbound --------------------------------------------------

    /// Decodes and dispatches one inbound carrier message, then drains any
    /// deferred work it armed. Any protocol violation (malformed frame,
    /// unknown flow referenced where that is fatal, duplicate flow-open)
    /// terminates the session per §7 -- there is no partial recovery from a
    /// dispatch-level error, so this calls `stop()` before returning the
    /// error to the caller.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        match self.receive_inner(bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(error = %err, "protocol violation; closing session");
                self.stop();
                Err(err)
            }
        }
    }

    fn receive_inner(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = Frame::decode(bytes)?;
        self.dispatch(frame, bytes.len() as u64)?;
        self.drive_pending()
    }

    fn dispatch(&mut self, frame: Frame, wire_len: u64) -> Result<()> {
        match frame {
            Frame::FlowOpen { flow_id, metadata } => {
                self.on_flow_open(flow_id, metadata, None)
            }
            Frame::FlowOpenReturn {
                flow_id,
                return_flow_id,
                metadata,
            } => self.on_flow_open(flow_id, metadata, Some(return_flow_id)),
            Frame::DataLast { flow_id, payload } => self.on_data(flow_id, false, payload, wire_len),
            Frame::DataMore { flow_id, fragment } => self.on_data(flow_id, true, fragment, wire_len),
            Frame::DataAbandon {
                flow_id,
                count_minus_one,
            } => self.on_data_abandon(flow_id, count_minus_one),
            Frame::FlowClose { flow_id } => self.on_flow_close(flow_id),
            Frame::DataAck {
                flow_id,
                received,
                advertisement,
            } => self.on_data_ack(flow_id, received, advertisement),
            Frame::FlowCloseAck { flow_id } => self.on_flow_close_ack(flow_id),
            Frame::FlowException { flow_id, reason } => self.on_flow_exception(flow_id, reason),
            Frame::Ping { payload } => self.send_frame(Frame::PingReply { payload }),
            Frame::PingReply { .. } => Ok(()),
        }
    }

    /// Handles an inbound FLOW_OPEN/FLOW_OPEN_RETURN.
    ///
    /// Both of the reject paths here (return association not found, not
    /// accepted) still *insert* the RecvFlow and leave it in the map after
    /// sending FLOW_EXCEPTION, rather than discarding it on the spot. The
    /// peer's SendFlow reacts to that exception by closing itself and
    /// sending FLOW_CLOSE once its own close handshake runs (`on_flow_
    /// exception`); that FLOW_CLOSE must still find a RecvFlow here to reply
    /// to with FLOW_CLOSE_ACK; an eagerly-removed entry would make that
    /// later FLOW_CLOSE reference an unknown flow and wrongly terminate the
    /// whole session as a protocol violation. `finish_recv_flow` (driven off
    /// `RecvFlow::is_complete`, set when that FLOW_CLOSE arrives) is what
    /// actually removes the entry, the same pattern already used for a
    /// locally-exceptioned SendFlow awaiting its FLOW_CLOSE_ACK.
    fn on_flow_open(
        &mut self,
        flow_id: FlowId,
        metadata: Bytes,
        return_flow_id: Option<FlowId>,
    ) -> Result<()> {
        if self.recv_flows.contains_key(&flow_id) {
            return Err(NexusError::DuplicateFlowOpen(flow_id));
        }

        let recv_flow = RecvFlow::new(flow_id, metadata, return_flow_id, self.config.default_rcvbuf);
        self.recv_flows.insert(flow_id, recv_flow);

        if let Some(return_id) = return_flow_id {
            if !self.send_flows.contains_key(&return_id) {
                tracing::warn!(flow_id = %flow_id, return_flow_id = %return_id, "return association not found");
                self.send_frame(Frame::FlowException {
                    flow_id,
                    reason: Some((0, Bytes::from_static(b"return association not found"))),
                })?;
                return Ok(());
            }
            self.invoke_send_flow_recv_callback(return_id, flow_id);
        } else {
            self.invoke_session_recv_callback(flow_id);
        }

        let still_not_accepted = self
            .recv_flows
            .get(&flow_id)
            .map(|f| !f.is_open())
            .unwrap_or(false);
        if still_not_accepted {
            tracing::debug!(flow_id = %flow_id, "inbound flow not accepted");
            self.send_frame(Frame::FlowException {
                flow_id,
                reason: Some((0, Bytes::from_static(b"not accepted"))),
            })?;
        } else {
            tracing::info!(flow_id = %flow_id, return_flow_id = ?return_flow_id, "inbound flow accepted");
        }
        Ok(())
    }

    /// Runs one app callback, catching a panic rather than letting it
    /// unwind into the Session's own call stack (§7: "app-level callback
    /// exception ... logged; session continues"). Rust has no catchable
    /// exceptions, so a caught `panic!` is this crate's analogue.
    fn guard_callback<R>(what: &'static str, f: impl FnOnce() -> R + std::panic::UnwindSafe) -> Option<R> {
        match std::panic::catch_unwind(f) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(callback = what, "app callback panicked; session continues");
                None
            }
        }
    }

    fn invoke_session_recv_callback(&mut self, flow_id: FlowId) {
        if let Some(mut handler) = self.handler.take() {
            if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                Self::guard_callback("on_recv_flow", std::panic::AssertUnwindSafe(|| {
                    handler.on_recv_flow(flow);
                }));
            }
            self.handler = Some(handler);
        }
    }

    fn invoke_send_flow_recv_callback(&mut self, send_flow_id: FlowId, recv_flow_id: FlowId) {
        let handler = self
            .send_flows
            .get_mut(&send_flow_id)
            .and_then(|f| f.take_handler());
        if let Some(mut handler) = handler {
            if let Some(flow) = self.recv_flows.get_mut(&recv_flow_id) {
                Self::guard_callback("on_recv_flow", std::panic::AssertUnwindSafe(|| {
                    handler.on_recv_flow(flow);
                }));
            }
            if let Some(flow) = self.send_flows.get_mut(&send_flow_id) {
                flow.restore_handler(handler);
            }
        }
    }

    fn on_data(&mut self, flow_id: FlowId, more: bool, fragment: Bytes, wire_len: u64) -> Result<()> {
        let recv_flow = self
            .recv_flows
            .get_mut(&flow_id)
            .ok_or(NexusError::UnknownFlow(flow_id))?;
        let mut action = recv_flow.on_data(more, fragment, wire_len);

        self.recv_accumulator += wire_len;
        if self.recv_accumulator >= self.config.ack_thresh {
            self.recv_accumulator = 0;
            action.queue_ack_immediate = true;
        }
        self.apply_recv_flow_action(flow_id, action);
        Ok(())
    }

    fn on_data_abandon(&mut self, flow_id: FlowId, count_minus_one: u64) -> Result<()> {
        let recv_flow = self
            .recv_flows
            .get_mut(&flow_id)
            .ok_or(NexusError::UnknownFlow(flow_id))?;
        let action = recv_flow.on_data_abandon(count_minus_one);
        self.apply_recv_flow_action(flow_id, action);
        Ok(())
    }

    fn on_flow_close(&mut self, flow_id: FlowId) -> Result<()> {
        let recv_flow = self
            .recv_flows
            .get_mut(&flow_id)
            .ok_or(NexusError::UnknownFlow(flow_id))?;
        let action = recv_flow.on_flow_close_message();
        self.apply_recv_flow_action(flow_id, action);
        Ok(())
    }

    fn apply_recv_flow_action(&mut self, flow_id: FlowId, action: crate::recv_flow::FlowAction) {
        if action.queue_delivery {
            if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                if !flow.delivery_pending() {
                    flow.mark_delivery_armed();
                    self.deferred.push_back(DeferredTask::DeliverData(flow_id));
                }
            }
        }
        if action.queue_ack {
            let entry = self.pending_acks.entry(flow_id).or_insert(false);
            *entry = *entry || action.queue_ack_immediate;
            self.arm_ack_flush();
        }
    }

    /// Arms the deferred `on_writable` callback if the flow already has a
    /// notify request outstanding (`notify_when_writable()`) and has since
    /// become writable again -- the common tail of any send-side state
    /// change that can shrink `buffer_length` below `sndbuf` (an ack
    /// arriving, a send draining/abandoning the buffer).
    fn arm_writable_notify_if_pending(&mut self, flow_id: FlowId) {
        let Some(flow) = self.send_flows.get_mut(&flow_id) else {
            return;
        };
        if flow.writable() && flow.should_notify_when_writable() {
            self.deferred.push_back(DeferredTask::WritableNotify(flow_id));
        }
    }

    fn on_data_ack(&mut self, flow_id: FlowId, received: u64, advertisement: u64) -> Result<()> {
        let Some(send_flow) = self.send_flows.get_mut(&flow_id) else {
            return Ok(());
        };
        let delta = send_flow.apply_ack(received, advertisement);

        self.total_acked_bytes += delta;
        tracing::trace!(flow_id = %flow_id, received, advertisement, "ack applied");
        self.sample_rtt_if_ready();
        self.arm_writable_notify_if_pending(flow_id);
        self.queue_for_transmit(flow_id);
        Ok(())
    }

    fn on_flow_close_ack(&mut self, flow_id: FlowId) -> Result<()> {
        if self.send_flows.remove(&flow_id).is_some() {
            tracing::debug!(flow_id = %flow_id, "flow close acked");
            self.recycle_send_id(flow_id);
        }
        Ok(())
    }

    /// Transitions the flow to closed and abandons its queue unconditionally,
    /// but -- unlike session-wide `stop()` -- does NOT tear the flow down
    /// here. It re-enqueues for transmission so the still-pending FLOW_CLOSE
    /// frame actually goes out; the flow is only removed and its id recycled
    /// once the peer's FLOW_CLOSE_ACK arrives (`on_flow_close_ack`), allowing
    /// the close-ack exchange to complete normally.
    fn on_flow_exception(&mut self, flow_id: FlowId, reason: Option<(u64, Bytes)>) -> Result<()> {
        let Some(send_flow) = self.send_flows.get_mut(&flow_id) else {
            return Ok(());
        };
        send_flow.apply_exception();
        let (code, description) = reason.unwrap_or((0, Bytes::new()));
        tracing::debug!(flow_id = %flow_id, code, "flow exception received");
        let handler = send_flow.take_handler();
        if let Some(mut handler) = handler {
            if let Some(flow) = self.send_flows.get_mut(&flow_id) {
                Self::guard_callback("on_exception", std::panic::AssertUnwindSafe(|| {
                    handler.on_exception(flow, code, &description);
                }));
                flow.restore_handler(handler);
            }
        }
        self.queue_for_transmit(flow_id);
        Ok(())
    }

    // ---- deferred task drain ----------------------------------------

    /// Drains every deferred task armed so far (a transmit pass, an ack
    /// flush, pending deliveries, writable/receipt callbacks). `receive`
    /// calls this automatically; after a local `open_flow`/`write`/
    /// `close_flow` call the embedder drives it directly (e.g. on each
    /// turn of its own event loop) so frames actually reach the carrier.
    pub fn drive_pending(&mut self) -> Result<()> {
        while let Some(task) = self.deferred.pop_front() {
            match task {
                DeferredTask::TransmitPass => {
                    self.transmit_pass_armed = false;
                    self.run_transmit_pass()?;
                }
                DeferredTask::FlushAcks => {
                    self.ack_flush_armed = false;
                    self.flush_acks()?;
                }
                DeferredTask::DeliverData(flow_id) => {
                    self.deliver_data(flow_id)?;
                }
                DeferredTask::WritableNotify(flow_id) => {
                    self.notify_writable(flow_id);
                }
                DeferredTask::ReceiptSent(receipt) => receipt.invoke_on_sent(),
                DeferredTask::ReceiptAbandoned(receipt) => receipt.invoke_on_abandoned(),
            }
        }
        Ok(())
    }

    fn notify_writable(&mut self, flow_id: FlowId) {
        let Some(flow) = self.send_flows.get_mut(&flow_id) else {
            return;
        };
        flow.clear_writable_pending();
        if !flow.should_notify_when_writable() || !flow.writable() {
            return;
        }
        let Some(mut handler) = flow.take_handler() else {
            return;
        };
        let stay_armed = {
            let Some(flow) = self.send_flows.get_mut(&flow_id) else {
                return;
            };
            Self::guard_callback("on_writable", std::panic::AssertUnwindSafe(|| {
                handler.on_writable(flow)
            }))
            .unwrap_or(false)
        };
        if let Some(flow) = self.send_flows.get_mut(&flow_id) {
            flow.restore_handler(handler);
            if stay_armed {
                if flow.notify_when_writable() {
                    self.deferred.push_back(DeferredTask::WritableNotify(flow_id));
                }
            } else {
                flow.disarm_writable_notify();
            }
        }
    }

    fn deliver_data(&mut self, flow_id: FlowId) -> Result<()> {
        let Some(flow) = self.recv_flows.get_mut(&flow_id) else {
            return Ok(());
        };
        flow.clear_delivery_armed();
        let (messages, became_complete) = flow.drain_deliverable();
        // `became_complete` is gated on the flow still being open locally
        // (it drives the one-shot `on_complete` callback). `is_complete`
        // is not: a flow the app already closed still needs its
        // FLOW_CLOSE_ACK sent and its map entry retired once the peer's
        // FLOW_CLOSE arrives, even though it'll never see `on_complete`.
        let is_complete = self
            .recv_flows
            .get(&flow_id)
            .map(|f| f.is_complete())
            .unwrap_or(false);

        if !messages.is_empty() || became_complete {
            let Some(mut handler) = flow.take_handler() else {
                if is_complete {
                    self.finish_recv_flow(flow_id)?;
                }
                return Ok(());
            };
            for (number, message) in messages {
                if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                    Self::guard_callback("on_message", std::panic::AssertUnwindSafe(|| {
                        handler.on_message(flow, message, number);
                    }));
                }
            }
            if became_complete {
                tracing::info!(flow_id = %flow_id, "flow complete");
                if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                    Self::guard_callback("on_complete", std::panic::AssertUnwindSafe(|| {
                        handler.on_complete(flow);
                    }));
                }
            }
            if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                flow.restore_handler(handler);
            }
        }

        if is_complete {
            self.finish_recv_flow(flow_id)?;
        }
        Ok(())
    }

    /// Sends the closing FLOW_CLOSE_ACK and drops the flow from the
    /// session's map. Deliberately deferred until here (after delivery has
    /// fully drained and `on_complete` has fired) rather than performed
    /// eagerly when FLOW_CLOSE is received, so a `DeliverData` task already
    /// queued for this flow always finds it still present.
    fn finish_recv_flow(&mut self, flow_id: FlowId) -> Result<()> {
        let already_acked = self
            .recv_flows
            .get(&flow_id)
            .map(|f| f.sent_close_ack())
            .unwrap_or(true);
        if !already_acked {
            self.send_frame(Frame::FlowCloseAck { flow_id })?;
            if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                flow.mark_close_ack_sent();
            }
        }
        self.recv_flows.remove(&flow_id);
        Ok(())
    }

    fn flush_acks(&mut self) -> Result<()> {
        let due: Vec<FlowId> = self.pending_acks.keys().copied().collect();
        tracing::trace!(count = due.len(), "flushing coalesced acks");
        for flow_id in due {
            self.pending_acks.remove(&flow_id);
            let Some(flow) = self.recv_flows.get(&flow_id) else {
                continue;
            };
            let frame = Frame::DataAck {
                flow_id,
                received: flow.received_byte_count(),
                advertisement: flow.advertisement(),
            };
            self.send_frame(frame)?;
        }
        Ok(())
    }

    /// Resolves the in-flight RTT probe once enough of it has been
    /// acknowledged, then recomputes the outstanding-bytes cap from the
    /// observed bandwidth (Design Note: outstanding-bytes cap, SPEC_FULL.md
    /// §4.1). The probe itself is armed in `send_frame_and_record`.
    fn sample_rtt_if_ready(&mut self) {
        let Some(probe) = &self.rtt_probe else {
            return;
        };
        if self.total_acked_bytes < probe.anchor_position {
            return;
        }
        let elapsed = probe.armed_at.elapsed().max(Duration::from_micros(100));
        let bytes_sampled = self
            .total_sent_wire_bytes
            .saturating_sub(self.rtt_previous_position);
        self.rtt_previous_position = self.total_sent_wire_bytes;
        self.rtt.sample(elapsed);

        let needed = self
            .outstanding_thresh
            .saturating_sub(self.config.ack_thresh);
        if bytes_sampled >= needed {
            if let Some(base_rtt) = self.rtt.base_rtt() {
                let seconds = elapsed.as_secs_f64();
                let bandwidth = bytes_sampled as f64 / seconds;
                let delay = (base_rtt + self.config.max_additional_delay).as_secs_f64();
                let computed = (bandwidth * delay) as u64;
                self.outstanding_thresh = computed.max(self.config.min_outstanding_thresh);
            }
        }
        self.rtt_probe = None;
    }

    // ---- transmit scheduler ------------------------------------------

    /// Drains priority level 7 (FlashOverride) down to 0 (Background),
    /// fully exhausting one level -- round-robining among its queued flows
    /// -- before ever looking at the next lower one (§2: "drains higher
    /// priorities first, round-robins within a priority"). A level is
    /// considered exhausted once a full cycle through its queue produces no
    /// progress (every queued flow returned `NoWork`, e.g. all blocked on
    /// their receiver window), not merely once it's empty.
    fn run_transmit_pass(&mut self) -> Result<()> {
        let mut budget = self.config.send_thresh;
        tracing::trace!(budget, "transmit pass starting");
        'levels: for level in (0..PRIORITY_LEVELS).rev() {
            let priority = Priority::ALL[level];
            let mut stalled_in_a_row = 0usize;
            loop {
                if budget == 0 || !self.open || self.paused || self.bytes_inflight() >= self.outstanding_thresh {
                    break 'levels;
                }
                let queue_len = self.priority_queues[level].len();
                if queue_len == 0 {
                    break;
                }
                let Some(flow_id) = self.priority_queues[level].pop_front() else {
                    break;
                };
                let spent = self.transmit_one(flow_id, priority)?;
                let still_pending = self
                    .send_flows
                    .get(&flow_id)
                    .map(|f| f.has_pending_work())
                    .unwrap_or(false);
                if still_pending {
                    self.priority_queues[level].push_back(flow_id);
                } else {
                    self.queued.remove(&flow_id);
                }
                if spent > 0 {
                    stalled_in_a_row = 0;
                    budget = budget.saturating_sub(spent);
                } else {
                    stalled_in_a_row += 1;
                    if stalled_in_a_row >= queue_len {
                        // every flow currently queued at this level was
                        // given a turn and none could make progress.
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Performs one transmit step for `flow_id`, returning the wire bytes
    /// spent (0 on backpressure/no-work, so the caller doesn't loop forever
    /// on a flow that cannot currently make progress).
    fn transmit_one(&mut self, flow_id: FlowId, priority: Priority) -> Result<u64> {
        let Some(flow) = self.send_flows.get_mut(&flow_id) else {
            return Ok(0);
        };
        let step = flow.step(priority, self.config.chunk_size);
        match step {
            TransmitStep::NoWork => Ok(0),
            TransmitStep::EmitOpen => {
                let frame = if let Some(return_id) = flow.return_flow_id {
                    Frame::FlowOpenReturn {
                        flow_id,
                        return_flow_id: return_id,
                        metadata: flow.metadata.clone(),
                    }
                } else {
                    Frame::FlowOpen {
                        flow_id,
                        metadata: flow.metadata.clone(),
                    }
                };
                let wire_len = self.send_frame_and_record(frame, flow_id)?;
                if let Some(flow) = self.send_flows.get_mut(&flow_id) {
                    flow.mark_open_sent();
                }
                tracing::info!(flow_id = %flow_id, "flow open sent");
                Ok(wire_len)
            }
            TransmitStep::EmitClose => {
                let frame = Frame::FlowClose { flow_id };
                self.send_frame(frame)?;
                if let Some(flow) = self.send_flows.get_mut(&flow_id) {
                    flow.mark_close_sent();
                }
                Ok(1)
            }
            TransmitStep::EmitAbandon {
                count_minus_one,
                receipts,
            } => {
                let frame = Frame::DataAbandon {
                    flow_id,
                    count_minus_one,
                };
                self.send_frame(frame)?;
                for receipt in receipts {
                    receipt.mark_abandoned();
                    self.deferred.push_back(DeferredTask::ReceiptAbandoned(receipt));
                }
                self.arm_writable_notify_if_pending(flow_id);
                Ok(1)
            }
            TransmitStep::EmitFragment {
                data,
                last,
                sent_receipt,
            } => {
                let frame = if last {
                    Frame::DataLast {
                        flow_id,
                        payload: data,
                    }
                } else {
                    Frame::DataMore {
                        flow_id,
                        fragment: data,
                    }
                };
                let wire_len = self.send_frame_and_record(frame, flow_id)?;
                if let Some(receipt) = sent_receipt {
                    self.deferred.push_back(DeferredTask::ReceiptSent(receipt));
                }
                if last {
                    self.arm_writable_notify_if_pending(flow_id);
                }
                Ok(wire_len)
            }
        }
    }

    fn send_frame_and_record(&mut self, frame: Frame, flow_id: FlowId) -> Result<u64> {
        let mut buf = BytesMut::with_capacity(32);
        frame.encode_into(&mut buf);
        let wire_len = buf.len() as u64;
        self.carrier.send(buf.freeze())?;
        self.total_sent_wire_bytes += wire_len;
        if let Some(flow) = self.send_flows.get_mut(&flow_id) {
            flow.record_sent_wire_bytes(wire_len);
        }
        if self.rtt_probe.is_none() && self.total_sent_wire_bytes > self.rtt_previous_position {
            self.rtt_probe = Some(RttProbe {
                armed_at: Instant::now(),
                anchor_position: self.total_sent_wire_bytes,
            });
        }
        Ok(wire_len)
    }

    fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(16);
        frame.encode_into(&mut buf);
        self.carrier.send(buf.freeze())?;
        Ok(())
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.arm_transmit_pass();
        }
    }

    /// Tears down the session (§4.1 "Closing"): idempotent; cascades a
    /// synthetic exception to every open SendFlow (abandoning its buffer,
    /// with `on_abandoned`/`on_exception` firing synchronously -- there is
    /// no further drive-loop turn to defer them through) and a synthetic
    /// close to every RecvFlow (draining whatever was already deliverable
    /// and firing `on_complete` for accepted flows), then closes the
    /// carrier and fires `on_close` exactly once.
    pub fn stop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        tracing::info!("session closing");

        let send_ids: Vec<FlowId> = self.send_flows.keys().copied().collect();
        for flow_id in send_ids {
            let Some(flow) = self.send_flows.get_mut(&flow_id) else {
                continue;
            };
            flow.apply_exception();
            flow.drain_all_receipts_as_abandoned();
            if let Some(mut handler) = flow.take_handler() {
                if let Some(flow) = self.send_flows.get_mut(&flow_id) {
                    Self::guard_callback("on_exception", std::panic::AssertUnwindSafe(|| {
                        handler.on_exception(flow, 0, b"session closed");
                    }));
                }
            }
        }
        self.send_flows.clear();

        let recv_ids: Vec<FlowId> = self.recv_flows.keys().copied().collect();
        for flow_id in recv_ids {
            let Some(flow) = self.recv_flows.get_mut(&flow_id) else {
                continue;
            };
            if !flow.is_complete() {
                flow.on_flow_close_message();
            }
            let (messages, became_complete) = flow.drain_deliverable();
            if let Some(mut handler) = flow.take_handler() {
                for (number, message) in messages {
                    if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                        Self::guard_callback("on_message", std::panic::AssertUnwindSafe(|| {
                            handler.on_message(flow, message, number);
                        }));
                    }
                }
                if became_complete {
                    if let Some(flow) = self.recv_flows.get_mut(&flow_id) {
                        Self::guard_callback("on_complete", std::panic::AssertUnwindSafe(|| {
                            handler.on_complete(flow);
                        }));
                    }
                }
            }
        }
        self.recv_flows.clear();

        self.carrier.close();
        if let Some(mut handler) = self.handler.take() {
            Self::guard_callback("on_close", std::panic::AssertUnwindSafe(|| {
                handler.on_close();
            }));
            self.handler = Some(handler);
        }
        tracing::info!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::test_support::RecordingCarrier;
    use crate::recv_flow::DeliveredMessage;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn new_session() -> (Session<RecordingCarrier>, RecordingCarrier) {
        let carrier = RecordingCarrier::new();
        (Session::new(carrier.clone(), SessionConfig::default()), carrier)
    }

    struct AcceptingHandler;
    impl SessionHandler for AcceptingHandler {
        fn on_recv_flow(&mut self, flow: &mut RecvFlow) {
            flow.accept();
        }
    }

    #[test]
    fn open_write_close_matches_wire_trace() {
        let (mut session, carrier) = new_session();
        let flow = session.open_flow(Bytes::from_static(b"hi"), Priority::Routine).unwrap();
        session.write(flow, Bytes::from_static(b"hello"), None, None).unwrap();
        session.close_flow(flow).unwrap();
        session.drive_pending().unwrap();

        let sent = carrier.sent_frames();
        assert_eq!(&sent[0][..], b"\x10\x00hi");
        assert_eq!(&sent[1][..], b"\x1d\x00hello");
        assert_eq!(&sent[2][..], b"\x1c\x00");
    }

    #[test]
    fn rtt_sample_resolves_on_a_small_transfer() {
        // Scenario 1 is a handful of bytes -- far below outstanding_thresh -
        // ack_thresh. A sample must still resolve off the very first ack,
        // not only once enough bytes have piled up to justify recomputing
        // outstanding_thresh.
        let (mut session, _carrier) = new_session();
        let flow = session
            .open_flow(Bytes::from_static(b"hi"), Priority::Routine)
            .unwrap();
        session
            .write(flow, Bytes::from_static(b"hello"), None, None)
            .unwrap();
        session.drive_pending().unwrap();
        assert!(session.rtt().is_none());

        let mut ack = BytesMut::new();
        Frame::DataAck {
            flow_id: FlowId(0),
            received: 999,
            advertisement: SessionConfig::default().default_rcvbuf,
        }
        .encode_into(&mut ack);
        session.receive(&ack).unwrap();

        assert!(session.rtt().is_some());
        assert!(session.base_rtt().is_some());
    }

    #[test]
    fn inbound_flow_open_is_delivered_after_accept() {
        let (mut session, carrier) = new_session();
        session.set_handler(AcceptingHandler);

        session.receive(b"\x10\x00hi").unwrap();
        assert!(session.recv_flow(FlowId(0)).unwrap().is_open());

        let received = Rc::new(RefCell::new(Vec::new()));
        struct Collector(Rc<RefCell<Vec<DeliveredMessage>>>);
        impl crate::callbacks::RecvFlowHandler for Collector {
            fn on_message(
                &mut self,
                _flow: &mut crate::recv_flow::RecvFlow,
                message: Result<DeliveredMessage, std::str::Utf8Error>,
                _number: u64,
            ) {
                self.0.borrow_mut().push(message.unwrap());
            }
        }
        session
            .recv_flow_mut(FlowId(0))
            .unwrap()
            .set_handler(Collector(received.clone()));

        session.receive(b"\x1d\x00hello").unwrap();
        assert_eq!(
            received.borrow()[0],
            DeliveredMessage::Binary(Bytes::from_static(b"hello"))
        );

        session.receive(b"\x1c\x00").unwrap();
        assert!(carrier
            .sent_frames()
            .iter()
            .any(|f| &f[..] == b"\x5c\x00"));
        assert!(session.recv_flow(FlowId(0)).is_none());
    }

    #[test]
    fn flow_close_ack_removes_the_send_flow() {
        let (mut session, _carrier) = new_session();
        let flow = session.open_flow(Bytes::new(), Priority::Routine).unwrap();
        session.close_flow(flow).unwrap();
        session.drive_pending().unwrap();
        assert!(session.send_flow(flow).is_some());

        session.receive(&[0x5c, 0x00]).unwrap();
        assert!(session.send_flow(flow).is_none());
    }

    #[test]
    fn flow_exception_keeps_the_flow_until_close_ack_arrives() {
        let (mut session, carrier) = new_session();
        let flow = session.open_flow(Bytes::new(), Priority::Routine).unwrap();
        // Queued but not yet driven through a transmit pass, so the
        // exception finds it still sitting in the send buffer unsent.
        let receipt = session
            .write(flow, Bytes::from_static(b"in flight"), None, None)
            .unwrap();

        // Peer rejects the flow: 0x5e, flowID VLU(0), code VLU(0).
        session.receive(&[0x5e, 0x00, 0x00]).unwrap();
        assert!(receipt.is_abandoned());
        // The flow must still be enqueued -- re-enqueued for the close
        // handshake, not torn down on the spot -- and its FLOW_CLOSE frame
        // must actually have been transmitted.
        assert!(session.send_flow(flow).is_some());
        assert!(carrier.sent_frames().iter().any(|f| &f[..] == b"\x1c\x00"));

        session.receive(&[0x5c, 0x00]).unwrap();
        assert!(session.send_flow(flow).is_none());
    }

    struct RejectingHandler;
    impl SessionHandler for RejectingHandler {
        fn on_recv_flow(&mut self, _flow: &mut RecvFlow) {}
    }

    /// A flow the handler never calls `accept()` on is auto-closed with
    /// FLOW_EXCEPTION, but -- like an app-initiated `close_recv_flow` --
    /// stays in the map until the peer's own FLOW_CLOSE arrives.
    #[test]
    fn unaccepted_flow_is_retired_only_once_peer_flow_close_arrives() {
        let (mut session, carrier) = new_session();
        session.set_handler(RejectingHandler);

        session.receive(b"\x10\x00hi").unwrap();
        assert!(session.recv_flow(FlowId(0)).is_some());
        assert!(carrier.sent_frames().iter().any(|f| f[0] == 0x5e));

        session.receive(&[0x1c, 0x00]).unwrap();
        assert!(session.recv_flow(FlowId(0)).is_none());
        assert!(carrier.sent_frames().iter().any(|f| &f[..] == b"\x5c\x00"));
        assert!(session.is_open());
    }

    /// Mirror-image of `flow_exception_keeps_the_flow_until_close_ack_
    /// arrives`: an app-initiated `close_recv_flow` must leave the
    /// `RecvFlow` in place until the peer's own FLOW_CLOSE arrives, not
    /// remove it on the spot. Removing it immediately would make that
    /// later FLOW_CLOSE reference an unknown flow, which `receive` treats
    /// as a protocol violation and tears the whole session down.
    #[test]
    fn recv_flow_close_keeps_the_flow_until_peer_flow_close_arrives() {
        let (mut session, carrier) = new_session();
        session.set_handler(AcceptingHandler);

        // Peer opens flow 0, empty metadata: 0x10, flowID VLU(0).
        session.receive(&[0x10, 0x00]).unwrap();
        assert!(session.recv_flow(FlowId(0)).is_some());

        session
            .close_recv_flow(FlowId(0), Some((3, "no thanks")))
            .unwrap();
        assert!(session.recv_flow(FlowId(0)).is_some());
        assert!(carrier.sent_frames().iter().any(|f| f[0] == 0x5e));

        // Peer's FLOW_CLOSE for the same flow now arrives.
        session.receive(&[0x1c, 0x00]).unwrap();
        assert!(session.recv_flow(FlowId(0)).is_none());
        assert!(carrier.sent_frames().iter().any(|f| &f[..] == b"\x5c\x00"));
        assert!(session.is_open());
    }

    /// Raising `sndbuf` past `buffer_length` must arm the same deferred
    /// `on_writable` callback an ack or a drained send would, even with
    /// nothing ever transmitted -- isolates the `Session::set_sndbuf` arm
    /// from the transmit-step arms covered by the tests above.
    #[test]
    fn raising_sndbuf_past_buffer_length_fires_writable_notify() {
        let (mut session, _carrier) = new_session();
        let flow = session.open_flow(Bytes::new(), Priority::Routine).unwrap();

        struct NotifyOnce(Rc<RefCell<bool>>);
        impl crate::callbacks::SendFlowHandler for NotifyOnce {
            fn on_writable(&mut self, _flow: &mut SendFlow) -> bool {
                *self.0.borrow_mut() = true;
                false
            }
        }
        let fired = Rc::new(RefCell::new(false));
        session
            .send_flow_mut(flow)
            .unwrap()
            .set_handler(NotifyOnce(fired.clone()));

        session.set_sndbuf(flow, 0).unwrap();
        session.notify_when_writable(flow).unwrap();
        session.drive_pending().unwrap();
        assert!(!*fired.borrow(), "sndbuf 0 with an empty buffer is still not writable");

        session.set_sndbuf(flow, 10).unwrap();
        session.drive_pending().unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn stop_abandons_queued_writes_synchronously() {
        let (mut session, carrier) = new_session();
        let flow = session.open_flow(Bytes::new(), Priority::Routine).unwrap();
        let receipt = session
            .write(flow, Bytes::from_static(b"never sent"), None, None)
            .unwrap();
        session.stop();
        assert!(receipt.is_abandoned());
        assert!(carrier.is_closed());
    }
}

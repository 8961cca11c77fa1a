//! App-facing callback traits.
//!
//! One trait per Design Note 9's named callback group. Implementations are
//! stored as `Option<Box<dyn Trait>>` on the owning `Session`/`SendFlow`/
//! `RecvFlow`, taken out of the struct before invoking and restored
//! immediately after -- the take-then-restore idiom for self-referential
//! callback storage in safe Rust, since a callback may itself call back
//! into the (temporarily callback-less) owner.

use std::str::Utf8Error;

use crate::recv_flow::{DeliveredMessage, RecvFlow};
use crate::send_flow::SendFlow;

/// Session-level callbacks: a new inbound flow arrived, or the session
/// closed.
///
/// Neither callback is given the owning `Session` directly: `Session<C>` is
/// generic over its carrier, while `RecvFlow`/`SendFlow` (and therefore the
/// `Box<dyn Trait>` slots that hold these handlers) are not, so a handler
/// reached through those slots can never name `Session<C>`'s `C`. Handing
/// back the flow itself keeps the callback usable from any `Session<C>`.
pub trait SessionHandler {
    /// A RecvFlow has arrived. The handler must call `flow.accept()`
    /// synchronously if it wants to receive the flow's data; otherwise the
    /// session auto-closes it as "not accepted" once this call returns.
    fn on_recv_flow(&mut self, flow: &mut RecvFlow);

    /// Fires exactly once, after the session has finished closing.
    fn on_close(&mut self) {}
}

/// Per-SendFlow callbacks.
pub trait SendFlowHandler {
    /// Invoked while the flow is writable; return `true` to stay armed for
    /// the next writability transition, `false` to disarm.
    fn on_writable(&mut self, flow: &mut SendFlow) -> bool {
        let _ = flow;
        false
    }

    /// The peer (or the session, on a protocol-level auto-close) sent a
    /// FLOW_EXCEPTION for this flow.
    fn on_exception(&mut self, flow: &mut SendFlow, code: u64, description: &[u8]) {
        let _ = (flow, code, description);
    }

    /// A return flow opened against this SendFlow arrived. The handler must
    /// call `flow.accept()` synchronously to receive it, exactly as
    /// `SessionHandler::on_recv_flow` does for a non-return flow.
    fn on_recv_flow(&mut self, flow: &mut RecvFlow) {
        let _ = flow;
    }
}

/// Per-RecvFlow callbacks.
pub trait RecvFlowHandler {
    /// One reassembled message is ready for delivery, in increasing
    /// message-number order. `Err` carries a decode failure for
    /// `text`/`unicode` mode payloads; it is flow-local, not
    /// session-terminating.
    fn on_message(
        &mut self,
        flow: &mut RecvFlow,
        message: Result<DeliveredMessage, Utf8Error>,
        number: u64,
    );

    /// Fires once all deliverable messages have been dispatched and the
    /// peer has closed the flow.
    fn on_complete(&mut self, flow: &mut RecvFlow) {
        let _ = flow;
    }
}

//! The carrier: the external, reliable, ordered, message-framed channel a
//! [`crate::session::Session`] is layered on top of (e.g. a WebSocket).
//!
//! The carrier is an out-of-scope collaborator. The Session only ever calls
//! [`Carrier::send`] and [`Carrier::close`] on it; the reverse direction
//! (`receive`/`pause`/`resume`/`stop`) is driven by the embedding
//! application calling into the Session directly, not by the Session
//! calling back into the carrier.
use bytes::Bytes;

/// Deferred scheduling is internalized by `Session` itself (see
/// `Session::drive_pending`), so it is not part of this trait -- a trait
/// method that re-enters `&mut Session` cannot be expressed without
/// smuggling interior mutability through the carrier, which this crate
/// avoids.
pub trait Carrier {
    /// Enqueues one outbound framed message. Errors here are carrier I/O
    /// failures and propagate to the caller of whichever Session method
    /// triggered the send.
    fn send(&mut self, frame: Bytes) -> std::io::Result<()>;

    /// Tears down the carrier. Called at most once, from `Session::close`.
    fn close(&mut self);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// An in-memory carrier double that records every frame it was asked
    /// to send, for asserting on exact wire traces in integration tests.
    #[derive(Default, Clone)]
    pub struct RecordingCarrier {
        pub sent: Rc<RefCell<Vec<Bytes>>>,
        pub closed: Rc<RefCell<bool>>,
    }

    impl RecordingCarrier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent_frames(&self) -> Vec<Bytes> {
            self.sent.borrow().clone()
        }

        pub fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }
    }

    impl Carrier for RecordingCarrier {
        fn send(&mut self, frame: Bytes) -> std::io::Result<()> {
            self.sent.borrow_mut().push(frame);
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.borrow_mut() = true;
        }
    }
}

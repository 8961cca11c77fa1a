//! `WriteMessage` / `WriteReceipt`: the outbound message queue entry and the
//! cloneable handle an application holds to observe its fate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

/// Callbacks fired when a [`WriteReceipt`] reaches a terminal state.
///
/// Exactly one of `on_sent`/`on_abandoned` fires per receipt (property 5,
/// §8): once `sent` is set the receipt can never become abandoned.
pub trait ReceiptObserver {
    fn on_sent(&mut self) {}
    fn on_abandoned(&mut self) {}
}

struct ReceiptInner {
    origin: Instant,
    start_by: Option<Duration>,
    end_by: Option<Duration>,
    started: bool,
    sent: bool,
    abandoned_explicit: bool,
    observer: Option<Box<dyn ReceiptObserver + Send>>,
}

impl ReceiptInner {
    fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.origin)
    }

    fn is_abandoned(&self) -> bool {
        if self.sent {
            return false;
        }
        if self.abandoned_explicit {
            return true;
        }
        let age = self.age();
        if self.started {
            self.end_by.is_some_and(|end_by| age > end_by)
        } else {
            self.start_by.is_some_and(|start_by| age > start_by)
        }
    }
}

/// A cloneable handle returned by `SendFlow::write`, tracking a message's
/// deadlines and fulfillment status.
///
/// Held behind `Arc<parking_lot::Mutex<_>>` so the application may poll or
/// inspect it from outside the single-threaded drive loop without the core
/// needing a `&mut Session` borrow to answer `is_abandoned()`.
#[derive(Clone)]
pub struct WriteReceipt(Arc<Mutex<ReceiptInner>>);

impl WriteReceipt {
    pub fn new(start_by: Option<Duration>, end_by: Option<Duration>) -> Self {
        WriteReceipt(Arc::new(Mutex::new(ReceiptInner {
            origin: Instant::now(),
            start_by,
            end_by,
            started: false,
            sent: false,
            abandoned_explicit: false,
            observer: None,
        })))
    }

    pub fn set_observer(&self, observer: impl ReceiptObserver + Send + 'static) {
        self.0.lock().observer = Some(Box::new(observer));
    }

    pub fn age(&self) -> Duration {
        self.0.lock().age()
    }

    pub fn is_started(&self) -> bool {
        self.0.lock().started
    }

    pub fn is_sent(&self) -> bool {
        self.0.lock().sent
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.lock().is_abandoned()
    }

    /// Explicitly forces this receipt into the abandoned state, regardless
    /// of deadlines. A no-op if the message has already been fully sent.
    ///
    /// Invokes `on_abandoned` synchronously (unlike the session-driven
    /// abandonment paths, which defer the callback through
    /// `Session::drive_pending`): the app calling this directly is by
    /// definition not mid-dispatch inside the drive loop, so there is no
    /// re-entrancy hazard to defer around.
    pub fn abandon(&self) {
        let already_abandoned = {
            let mut inner = self.0.lock();
            if inner.sent {
                return;
            }
            let was = inner.abandoned_explicit;
            inner.abandoned_explicit = true;
            was
        };
        if !already_abandoned {
            self.invoke_on_abandoned();
        }
    }

    pub(crate) fn mark_started(&self) {
        self.0.lock().started = true;
    }

    /// Marks the message fully sent. Does not invoke `on_sent` directly --
    /// per the source, the callback fires on a later turn; the caller
    /// (`Session`) enqueues a [`crate::session::DeferredTask::ReceiptSent`]
    /// and `invoke_on_sent` is called when that task is drained.
    pub(crate) fn mark_sent(&self) {
        self.0.lock().sent = true;
    }

    /// Marks the message abandoned, without invoking `on_abandoned` --
    /// mirrors `mark_sent`'s deferred-callback split.
    pub(crate) fn mark_abandoned(&self) {
        self.0.lock().abandoned_explicit = true;
    }

    pub(crate) fn invoke_on_sent(&self) {
        let observer = self.0.lock().observer.take();
        if let Some(mut observer) = observer {
            observer.on_sent();
            self.0.lock().observer = Some(observer);
        }
    }

    pub(crate) fn invoke_on_abandoned(&self) {
        let observer = self.0.lock().observer.take();
        if let Some(mut observer) = observer {
            observer.on_abandoned();
            self.0.lock().observer = Some(observer);
        }
    }
}

/// One queued outbound message: payload, receipt, and the fragmentation
/// offset of the next byte to send.
pub(crate) struct WriteMessage {
    pub payload: Bytes,
    pub receipt: WriteReceipt,
    pub offset: usize,
}

impl WriteMessage {
    pub fn new(payload: Bytes, receipt: WriteReceipt) -> Self {
        WriteMessage {
            payload,
            receipt,
            offset: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagObserver(Arc<AtomicBool>, Arc<AtomicBool>);
    impl ReceiptObserver for FlagObserver {
        fn on_sent(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
        fn on_abandoned(&mut self) {
            self.1.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn not_started_past_start_by_is_abandoned() {
        let receipt = WriteReceipt::new(Some(Duration::from_millis(1)), None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(receipt.is_abandoned());
    }

    #[test]
    fn started_is_not_abandoned_by_start_by_alone() {
        let receipt = WriteReceipt::new(Some(Duration::from_millis(1)), None);
        receipt.mark_started();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!receipt.is_abandoned());
    }

    #[test]
    fn started_past_end_by_is_abandoned() {
        let receipt = WriteReceipt::new(None, Some(Duration::from_millis(1)));
        receipt.mark_started();
        std::thread::sleep(Duration::from_millis(5));
        assert!(receipt.is_abandoned());
    }

    #[test]
    fn once_sent_cannot_become_abandoned() {
        let receipt = WriteReceipt::new(Some(Duration::from_millis(1)), None);
        receipt.mark_started();
        receipt.mark_sent();
        std::thread::sleep(Duration::from_millis(5));
        assert!(receipt.is_sent());
        assert!(!receipt.is_abandoned());
    }

    #[test]
    fn explicit_abandon_short_circuits_deadlines() {
        let receipt = WriteReceipt::new(None, None);
        assert!(!receipt.is_abandoned());
        receipt.abandon();
        assert!(receipt.is_abandoned());
    }

    #[test]
    fn observers_fire_exactly_once_for_their_outcome() {
        let sent_flag = Arc::new(AtomicBool::new(false));
        let abandoned_flag = Arc::new(AtomicBool::new(false));
        let receipt = WriteReceipt::new(None, None);
        receipt.set_observer(FlagObserver(sent_flag.clone(), abandoned_flag.clone()));
        receipt.mark_sent();
        receipt.invoke_on_sent();
        assert!(sent_flag.load(Ordering::SeqCst));
        assert!(!abandoned_flag.load(Ordering::SeqCst));
    }
}

//! flowmux -- a multi-flow, message-oriented transport multiplexer layered
//! atop a reliable, ordered, message-framed byte carrier (such as a
//! WebSocket connection).
//!
//! Multiplexes many independent logical flows over one connection: each
//! flow carries an ordered stream of variable-length messages with
//! priority scheduling, per-flow receiver-advertised flow control,
//! message-level abandonment with deadlines, return-flow association, and
//! RTT/bandwidth-delay-product estimation driving a dynamic outstanding-
//! bytes cap. See `Session` for the entry point.

pub mod callbacks;
pub mod carrier;
pub mod config;
pub mod error;
pub mod frame;
pub mod priority;
pub mod receipt;
pub mod recv_flow;
pub mod rtt;
pub mod send_flow;
pub mod session;
pub mod vlu;

// Re-export key public types at crate root.
pub use callbacks::{RecvFlowHandler, SendFlowHandler, SessionHandler};
pub use carrier::Carrier;
pub use config::SessionConfig;
pub use error::{NexusError, Result};
pub use frame::{Frame, MessageCode};
pub use priority::{FlowId, Priority};
pub use receipt::{ReceiptObserver, WriteReceipt};
pub use recv_flow::{DeliveredMessage, RecvFlow, RecvMode};
pub use rtt::RttEstimator;
pub use send_flow::SendFlow;
pub use session::Session;

use thiserror::Error;

use crate::priority::FlowId;

/// All errors produced by the multiplexer core.
#[derive(Debug, Error)]
pub enum NexusError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("incomplete VLU: ran out of bytes before a terminator")]
    IncompleteVlu,

    #[error("unknown frame code 0x{0:02x}")]
    UnknownFrameCode(u8),

    #[error("flow {0} is unknown to this session")]
    UnknownFlow(FlowId),

    #[error("flow {0} is already open (duplicate FLOW_OPEN)")]
    DuplicateFlowOpen(FlowId),

    #[error("write on flow {0} after close")]
    NotOpen(FlowId),

    #[error("session is closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NexusError>;

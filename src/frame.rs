//! Wire frame codec.
//!
//! Every carrier message is one frame of the form `<code:1><body>`. Integer
//! fields are VLU-encoded (see [`crate::vlu`]); trailing byte fields (the
//! metadata/payload/fragment/description) run to the end of the carrier
//! message with no inner length prefix, since the carrier already frames
//! messages.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{NexusError, Result};
use crate::priority::FlowId;
use crate::vlu;

/// Message code identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    Ping = 0x01,
    FlowOpen = 0x10,
    DataAbandon = 0x1a,
    FlowClose = 0x1c,
    DataLast = 0x1d,
    FlowOpenReturn = 0x30,
    DataMore = 0x3d,
    PingReply = 0x41,
    DataAck = 0x5a,
    FlowCloseAck = 0x5c,
    FlowException = 0x5e,
}

impl TryFrom<u8> for MessageCode {
    type Error = NexusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageCode::Ping),
            0x10 => Ok(MessageCode::FlowOpen),
            0x1a => Ok(MessageCode::DataAbandon),
            0x1c => Ok(MessageCode::FlowClose),
            0x1d => Ok(MessageCode::DataLast),
            0x30 => Ok(MessageCode::FlowOpenReturn),
            0x3d => Ok(MessageCode::DataMore),
            0x41 => Ok(MessageCode::PingReply),
            0x5a => Ok(MessageCode::DataAck),
            0x5c => Ok(MessageCode::FlowCloseAck),
            0x5e => Ok(MessageCode::FlowException),
            other => Err(NexusError::UnknownFrameCode(other)),
        }
    }
}

/// A decoded (or to-be-encoded) wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    FlowOpen {
        flow_id: FlowId,
        metadata: Bytes,
    },
    FlowOpenReturn {
        flow_id: FlowId,
        return_flow_id: FlowId,
        metadata: Bytes,
    },
    DataLast {
        flow_id: FlowId,
        payload: Bytes,
    },
    DataMore {
        flow_id: FlowId,
        fragment: Bytes,
    },
    DataAbandon {
        flow_id: FlowId,
        count_minus_one: u64,
    },
    FlowClose {
        flow_id: FlowId,
    },
    DataAck {
        flow_id: FlowId,
        received: u64,
        advertisement: u64,
    },
    FlowCloseAck {
        flow_id: FlowId,
    },
    FlowException {
        flow_id: FlowId,
        reason: Option<(u64, Bytes)>,
    },
    Ping {
        payload: Bytes,
    },
    PingReply {
        payload: Bytes,
    },
}

fn ensure_nonempty(buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        return Err(NexusError::FrameTooShort {
            expected: 1,
            actual: 0,
        });
    }
    Ok(())
}

impl Frame {
    pub fn code(&self) -> MessageCode {
        match self {
            Frame::FlowOpen { .. } => MessageCode::FlowOpen,
            Frame::FlowOpenReturn { .. } => MessageCode::FlowOpenReturn,
            Frame::DataLast { .. } => MessageCode::DataLast,
            Frame::DataMore { .. } => MessageCode::DataMore,
            Frame::DataAbandon { .. } => MessageCode::DataAbandon,
            Frame::FlowClose { .. } => MessageCode::FlowClose,
            Frame::DataAck { .. } => MessageCode::DataAck,
            Frame::FlowCloseAck { .. } => MessageCode::FlowCloseAck,
            Frame::FlowException { .. } => MessageCode::FlowException,
            Frame::Ping { .. } => MessageCode::Ping,
            Frame::PingReply { .. } => MessageCode::PingReply,
        }
    }

    pub fn flow_id(&self) -> Option<FlowId> {
        match self {
            Frame::FlowOpen { flow_id, .. }
            | Frame::FlowOpenReturn { flow_id, .. }
            | Frame::DataLast { flow_id, .. }
            | Frame::DataMore { flow_id, .. }
            | Frame::DataAbandon { flow_id, .. }
            | Frame::FlowClose { flow_id }
            | Frame::DataAck { flow_id, .. }
            | Frame::FlowCloseAck { flow_id }
            | Frame::FlowException { flow_id, .. } => Some(*flow_id),
            Frame::Ping { .. } | Frame::PingReply { .. } => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.extend_from_slice(&[self.code() as u8]);
        match self {
            Frame::FlowOpen { flow_id, metadata } => {
                vlu::encode(flow_id.0, out);
                out.extend_from_slice(metadata);
            }
            Frame::FlowOpenReturn {
                flow_id,
                return_flow_id,
                metadata,
            } => {
                vlu::encode(flow_id.0, out);
                vlu::encode(return_flow_id.0, out);
                out.extend_from_slice(metadata);
            }
            Frame::DataLast { flow_id, payload } => {
                vlu::encode(flow_id.0, out);
                out.extend_from_slice(payload);
            }
            Frame::DataMore { flow_id, fragment } => {
                vlu::encode(flow_id.0, out);
                out.extend_from_slice(fragment);
            }
            Frame::DataAbandon {
                flow_id,
                count_minus_one,
            } => {
                vlu::encode(flow_id.0, out);
                if *count_minus_one > 0 {
                    vlu::encode(*count_minus_one, out);
                }
            }
            Frame::FlowClose { flow_id } => {
                vlu::encode(flow_id.0, out);
            }
            Frame::DataAck {
                flow_id,
                received,
                advertisement,
            } => {
                vlu::encode(flow_id.0, out);
                vlu::encode(*received, out);
                vlu::encode(*advertisement, out);
            }
            Frame::FlowCloseAck { flow_id } => {
                vlu::encode(flow_id.0, out);
            }
            Frame::FlowException { flow_id, reason } => {
                vlu::encode(flow_id.0, out);
                if let Some((code, description)) = reason {
                    vlu::encode(*code, out);
                    out.extend_from_slice(description);
                }
            }
            Frame::Ping { payload } | Frame::PingReply { payload } => {
                out.extend_from_slice(payload);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure_nonempty(buf)?;
        let code = MessageCode::try_from(buf[0])?;
        let mut cursor = &buf[1..];
        Ok(match code {
            MessageCode::FlowOpen => {
                let flow_id = decode_flow_id(&mut cursor)?;
                Frame::FlowOpen {
                    flow_id,
                    metadata: Bytes::copy_from_slice(cursor),
                }
            }
            MessageCode::FlowOpenReturn => {
                let flow_id = decode_flow_id(&mut cursor)?;
                let return_flow_id = decode_flow_id(&mut cursor)?;
                Frame::FlowOpenReturn {
                    flow_id,
                    return_flow_id,
                    metadata: Bytes::copy_from_slice(cursor),
                }
            }
            MessageCode::DataLast => {
                let flow_id = decode_flow_id(&mut cursor)?;
                Frame::DataLast {
                    flow_id,
                    payload: Bytes::copy_from_slice(cursor),
                }
            }
            MessageCode::DataMore => {
                let flow_id = decode_flow_id(&mut cursor)?;
                Frame::DataMore {
                    flow_id,
                    fragment: Bytes::copy_from_slice(cursor),
                }
            }
            MessageCode::DataAbandon => {
                let flow_id = decode_flow_id(&mut cursor)?;
                let count_minus_one = if cursor.is_empty() {
                    0
                } else {
                    decode_vlu(&mut cursor)?
                };
                Frame::DataAbandon {
                    flow_id,
                    count_minus_one,
                }
            }
            MessageCode::FlowClose => Frame::FlowClose {
                flow_id: decode_flow_id(&mut cursor)?,
            },
            MessageCode::DataAck => {
                let flow_id = decode_flow_id(&mut cursor)?;
                let received = decode_vlu(&mut cursor)?;
                let advertisement = decode_vlu(&mut cursor)?;
                Frame::DataAck {
                    flow_id,
                    received,
                    advertisement,
                }
            }
            MessageCode::FlowCloseAck => Frame::FlowCloseAck {
                flow_id: decode_flow_id(&mut cursor)?,
            },
            MessageCode::FlowException => {
                let flow_id = decode_flow_id(&mut cursor)?;
                let reason = if cursor.is_empty() {
                    None
                } else {
                    let code = decode_vlu(&mut cursor)?;
                    Some((code, Bytes::copy_from_slice(cursor)))
                };
                Frame::FlowException { flow_id, reason }
            }
            MessageCode::Ping => Frame::Ping {
                payload: Bytes::copy_from_slice(cursor),
            },
            MessageCode::PingReply => Frame::PingReply {
                payload: Bytes::copy_from_slice(cursor),
            },
        })
    }
}

fn decode_vlu(cursor: &mut &[u8]) -> Result<u64> {
    let (value, consumed) = vlu::decode(cursor)?;
    cursor.advance(consumed);
    Ok(value)
}

fn decode_flow_id(cursor: &mut &[u8]) -> Result<FlowId> {
    decode_vlu(cursor).map(FlowId)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn flow_open_round_trips() {
        round_trip(Frame::FlowOpen {
            flow_id: FlowId(0),
            metadata: Bytes::from_static(b"hi"),
        });
    }

    #[test]
    fn flow_open_return_round_trips() {
        round_trip(Frame::FlowOpenReturn {
            flow_id: FlowId(7),
            return_flow_id: FlowId(3),
            metadata: Bytes::new(),
        });
    }

    #[test]
    fn data_abandon_omits_count_when_zero() {
        let encoded = Frame::DataAbandon {
            flow_id: FlowId(1),
            count_minus_one: 0,
        }
        .encode();
        // code byte + one-byte flow id VLU, nothing else.
        assert_eq!(encoded.len(), 2);
        round_trip(Frame::DataAbandon {
            flow_id: FlowId(1),
            count_minus_one: 0,
        });
    }

    #[test]
    fn data_abandon_encodes_nonzero_count() {
        round_trip(Frame::DataAbandon {
            flow_id: FlowId(1),
            count_minus_one: 4,
        });
    }

    #[test]
    fn data_ack_round_trips() {
        round_trip(Frame::DataAck {
            flow_id: FlowId(9),
            received: 12345,
            advertisement: 2_097_151,
        });
    }

    #[test]
    fn flow_exception_without_reason_round_trips() {
        round_trip(Frame::FlowException {
            flow_id: FlowId(2),
            reason: None,
        });
    }

    #[test]
    fn flow_exception_with_reason_round_trips() {
        round_trip(Frame::FlowException {
            flow_id: FlowId(2),
            reason: Some((0, Bytes::from_static(b"not accepted"))),
        });
    }

    #[test]
    fn ping_and_pong_round_trip() {
        round_trip(Frame::Ping {
            payload: Bytes::from_static(b"ping!"),
        });
        round_trip(Frame::PingReply {
            payload: Bytes::from_static(b"ping!"),
        });
    }

    #[test]
    fn unknown_code_is_rejected() {
        let buf = [0x99u8, 0x00];
        assert!(matches!(
            Frame::decode(&buf),
            Err(NexusError::UnknownFrameCode(0x99))
        ));
    }

    #[test]
    fn empty_buffer_is_rejected() {
        assert!(matches!(
            Frame::decode(&[]),
            Err(NexusError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn scenario_open_write_close_trace_matches_wire_bytes() {
        let open = Frame::FlowOpen {
            flow_id: FlowId(0),
            metadata: Bytes::from_static(b"hi"),
        }
        .encode();
        assert_eq!(&open[..], b"\x10\x00hi");

        let data = Frame::DataLast {
            flow_id: FlowId(0),
            payload: Bytes::from_static(b"hello"),
        }
        .encode();
        assert_eq!(&data[..], b"\x1d\x00hello");

        let close = Frame::FlowClose { flow_id: FlowId(0) }.encode();
        assert_eq!(&close[..], b"\x1c\x00");
    }
}

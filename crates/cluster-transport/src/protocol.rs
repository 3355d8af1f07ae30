//! Wire framing for the cluster transport.
//!
//! Every message on a socket is a length-prefixed data frame:
//!
//! ```text
//! data frame:        [length:u32][message]
//! message:           [protocol_id:u16][protocol header][payload]
//! request/response:  [protocol_id=0][request_id:u64][partition_id:u32][payload]
//! single message:    [protocol_id=1][payload]
//! control:           [protocol_id=100..103][message_type:i32]
//! ```
//!
//! All integers are big-endian. Header lengths are constants, so offsets are
//! computable without looking at the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::routing::PartitionId;

/// Length of the outer data-frame length prefix.
pub const LENGTH_FIELD_LENGTH: usize = 4;

/// Length of the transport header (protocol discriminator).
pub const TRANSPORT_HEADER_LENGTH: usize = 2;

/// Length of the request/response correlation header.
pub const REQUEST_RESPONSE_HEADER_LENGTH: usize = 8;

/// Length of the partition envelope that leads every request/response payload.
pub const PARTITION_HEADER_LENGTH: usize = 4;

/// Length of a control message body.
pub const CONTROL_BODY_LENGTH: usize = 4;

/// Total on-wire length of a control frame, including the length prefix.
pub const CONTROL_FRAME_LENGTH: usize =
    LENGTH_FIELD_LENGTH + TRANSPORT_HEADER_LENGTH + CONTROL_BODY_LENGTH;

/// Prefix of the topic names that partition handlers subscribe under.
pub const COMMAND_API_TOPIC_PREFIX: &str = "command-api-";

const PROTOCOL_REQUEST_RESPONSE: u16 = 0;
const PROTOCOL_SINGLE_MESSAGE: u16 = 1;
const PROTOCOL_CONTROL_BASE: u16 = 100;

/// Control messages exchanged between the two ends of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// The sender is about to close the connection.
    Close,
    /// The sender will not send further messages.
    EndOfStream,
    /// Liveness signal sent on idle channels.
    KeepAlive,
    /// Reserved for future use; ignored on receipt.
    Reserved,
}

impl ControlMessage {
    fn ordinal(self) -> u16 {
        match self {
            ControlMessage::Close => 0,
            ControlMessage::EndOfStream => 1,
            ControlMessage::KeepAlive => 2,
            ControlMessage::Reserved => 3,
        }
    }

    fn from_ordinal(ordinal: u16) -> Option<Self> {
        match ordinal {
            0 => Some(ControlMessage::Close),
            1 => Some(ControlMessage::EndOfStream),
            2 => Some(ControlMessage::KeepAlive),
            3 => Some(ControlMessage::Reserved),
            _ => None,
        }
    }
}

/// Protocol discriminator carried in the transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    /// Correlated request or response, followed by a request id.
    RequestResponse,
    /// Fire-and-forget message, payload only.
    SingleMessage,
    /// Control message.
    Control(ControlMessage),
}

impl ProtocolId {
    /// Returns the raw discriminator value.
    pub fn as_u16(self) -> u16 {
        match self {
            ProtocolId::RequestResponse => PROTOCOL_REQUEST_RESPONSE,
            ProtocolId::SingleMessage => PROTOCOL_SINGLE_MESSAGE,
            ProtocolId::Control(control) => PROTOCOL_CONTROL_BASE + control.ordinal(),
        }
    }

    /// Parses a raw discriminator; `None` for ids this version does not know.
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            PROTOCOL_REQUEST_RESPONSE => Some(ProtocolId::RequestResponse),
            PROTOCOL_SINGLE_MESSAGE => Some(ProtocolId::SingleMessage),
            raw if raw >= PROTOCOL_CONTROL_BASE => {
                ControlMessage::from_ordinal(raw - PROTOCOL_CONTROL_BASE).map(ProtocolId::Control)
            }
            _ => None,
        }
    }
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A request or a response, depending on which side received it.
    RequestResponse {
        /// Correlation id chosen by the requesting side.
        request_id: u64,
        /// Partition the request is addressed to.
        partition_id: PartitionId,
        /// Opaque payload.
        payload: Bytes,
    },
    /// A fire-and-forget message.
    Single {
        /// Opaque payload.
        payload: Bytes,
    },
    /// A control message.
    Control(ControlMessage),
    /// A message with a protocol id this version does not understand.
    Unknown(u16),
}

impl Message {
    /// Decodes one message (without its length prefix).
    ///
    /// Unknown protocol ids decode to [`Message::Unknown`] so that newer peers
    /// can be tolerated; truncated headers are an error.
    pub fn decode(mut frame: Bytes) -> Result<Message> {
        if frame.len() < TRANSPORT_HEADER_LENGTH {
            return Err(invalid("transport header truncated"));
        }
        let raw = frame.get_u16();
        let protocol = match ProtocolId::from_u16(raw) {
            Some(protocol) => protocol,
            None => return Ok(Message::Unknown(raw)),
        };
        match protocol {
            ProtocolId::RequestResponse => {
                if frame.len() < REQUEST_RESPONSE_HEADER_LENGTH + PARTITION_HEADER_LENGTH {
                    return Err(invalid("request/response header truncated"));
                }
                let request_id = frame.get_u64();
                let partition_id = PartitionId::new(frame.get_u32());
                Ok(Message::RequestResponse {
                    request_id,
                    partition_id,
                    payload: frame,
                })
            }
            ProtocolId::SingleMessage => Ok(Message::Single { payload: frame }),
            ProtocolId::Control(control) => {
                if frame.len() < CONTROL_BODY_LENGTH {
                    return Err(invalid("control body truncated"));
                }
                let message_type = frame.get_i32();
                if message_type != i32::from(control.ordinal()) {
                    return Err(invalid("control message type does not match protocol id"));
                }
                Ok(Message::Control(control))
            }
        }
    }

    /// Returns the on-wire length of this message including its length prefix.
    pub fn framed_length(&self) -> usize {
        match self {
            Message::RequestResponse { payload, .. } => request_frame_length(payload.len()),
            Message::Single { payload } => message_frame_length(payload.len()),
            Message::Control(_) => CONTROL_FRAME_LENGTH,
            Message::Unknown(_) => LENGTH_FIELD_LENGTH + TRANSPORT_HEADER_LENGTH,
        }
    }

    /// Writes this message as a complete data frame.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        match self {
            Message::RequestResponse {
                request_id,
                partition_id,
                payload,
            } => write_request_frame(dst, *request_id, *partition_id, payload),
            Message::Single { payload } => write_message_frame(dst, payload),
            Message::Control(control) => write_control_frame(dst, *control),
            Message::Unknown(raw) => {
                dst.put_u32(TRANSPORT_HEADER_LENGTH as u32);
                dst.put_u16(*raw);
            }
        }
    }
}

/// On-wire length of a request/response frame carrying `payload_len` bytes.
pub fn request_frame_length(payload_len: usize) -> usize {
    LENGTH_FIELD_LENGTH
        + TRANSPORT_HEADER_LENGTH
        + REQUEST_RESPONSE_HEADER_LENGTH
        + PARTITION_HEADER_LENGTH
        + payload_len
}

/// On-wire length of a single-message frame carrying `payload_len` bytes.
pub fn message_frame_length(payload_len: usize) -> usize {
    LENGTH_FIELD_LENGTH + TRANSPORT_HEADER_LENGTH + payload_len
}

/// Writes a request/response data frame.
pub fn write_request_frame<B: BufMut>(
    dst: &mut B,
    request_id: u64,
    partition_id: PartitionId,
    payload: &[u8],
) {
    let message_len = request_frame_length(payload.len()) - LENGTH_FIELD_LENGTH;
    dst.put_u32(message_len as u32);
    dst.put_u16(PROTOCOL_REQUEST_RESPONSE);
    dst.put_u64(request_id);
    dst.put_u32(partition_id.as_u32());
    dst.put_slice(payload);
}

/// Writes a single-message data frame.
pub fn write_message_frame<B: BufMut>(dst: &mut B, payload: &[u8]) {
    let message_len = message_frame_length(payload.len()) - LENGTH_FIELD_LENGTH;
    dst.put_u32(message_len as u32);
    dst.put_u16(PROTOCOL_SINGLE_MESSAGE);
    dst.put_slice(payload);
}

/// Writes a control data frame.
pub fn write_control_frame<B: BufMut>(dst: &mut B, control: ControlMessage) {
    dst.put_u32((TRANSPORT_HEADER_LENGTH + CONTROL_BODY_LENGTH) as u32);
    dst.put_u16(ProtocolId::Control(control).as_u16());
    dst.put_i32(i32::from(control.ordinal()));
}

/// Splits one complete data frame off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame; the
/// buffer is left untouched in that case. A length prefix announcing more than
/// `max_message_size` bytes is an error: the stream cannot be resynchronized.
pub fn split_data_frame(buf: &mut BytesMut, max_message_size: usize) -> Result<Option<Bytes>> {
    if buf.len() < LENGTH_FIELD_LENGTH {
        return Ok(None);
    }
    let mut prefix = [0u8; LENGTH_FIELD_LENGTH];
    prefix.copy_from_slice(&buf[..LENGTH_FIELD_LENGTH]);
    let message_len = u32::from_be_bytes(prefix) as usize;
    if message_len > max_message_size {
        return Err(TransportError::PayloadTooLarge {
            size: message_len,
            max_size: max_message_size,
        });
    }
    if buf.len() < LENGTH_FIELD_LENGTH + message_len {
        return Ok(None);
    }
    buf.advance(LENGTH_FIELD_LENGTH);
    Ok(Some(buf.split_to(message_len).freeze()))
}

/// Returns the topic name partition handlers are registered under.
pub fn topic_name(partition_id: PartitionId) -> String {
    format!("{COMMAND_API_TOPIC_PREFIX}{}", partition_id.as_u32())
}

fn invalid(reason: &str) -> TransportError {
    TransportError::InvalidFrame {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(message: &Message) -> BytesMut {
        let mut buf = BytesMut::with_capacity(message.framed_length());
        message.encode(&mut buf);
        buf
    }

    #[test]
    fn test_header_offsets_are_fixed() {
        let mut buf = BytesMut::new();
        write_request_frame(&mut buf, 0x0102_0304_0506_0708, PartitionId::new(3), &[0xAA]);
        assert_eq!(buf.len(), request_frame_length(1));
        assert_eq!(&buf[0..4], &[0, 0, 0, 15]);
        assert_eq!(&buf[4..6], &[0, 0]);
        assert_eq!(&buf[6..14], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[14..18], &[0, 0, 0, 3]);
        assert_eq!(buf[18], 0xAA);
    }

    #[test]
    fn test_protocol_ids() {
        assert_eq!(ProtocolId::RequestResponse.as_u16(), 0);
        assert_eq!(ProtocolId::SingleMessage.as_u16(), 1);
        assert_eq!(ProtocolId::Control(ControlMessage::Close).as_u16(), 100);
        assert_eq!(ProtocolId::Control(ControlMessage::EndOfStream).as_u16(), 101);
        assert_eq!(ProtocolId::Control(ControlMessage::KeepAlive).as_u16(), 102);
        assert_eq!(ProtocolId::Control(ControlMessage::Reserved).as_u16(), 103);
        assert_eq!(ProtocolId::from_u16(2), None);
        assert_eq!(ProtocolId::from_u16(104), None);
    }

    #[test]
    fn test_control_roundtrip() {
        let mut buf = encode(&Message::Control(ControlMessage::KeepAlive));
        assert_eq!(buf.len(), CONTROL_FRAME_LENGTH);
        let frame = split_data_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(
            Message::decode(frame).unwrap(),
            Message::Control(ControlMessage::KeepAlive)
        );
    }

    #[test]
    fn test_unknown_protocol_is_not_an_error() {
        let frame = Bytes::from_static(&[0x00, 0x07, 0xde, 0xad]);
        assert_eq!(Message::decode(frame).unwrap(), Message::Unknown(7));
    }

    #[test]
    fn test_truncated_headers_are_rejected() {
        assert!(Message::decode(Bytes::from_static(&[0x00])).is_err());
        assert!(Message::decode(Bytes::from_static(&[0x00, 0x00, 0x01])).is_err());
        assert!(Message::decode(Bytes::from_static(&[0x00, 0x64, 0x00])).is_err());
    }

    #[test]
    fn test_split_waits_for_complete_frame() {
        let full = encode(&Message::Single {
            payload: Bytes::from_static(b"hello"),
        });
        let mut buf = BytesMut::from(&full[..6]);
        assert!(split_data_frame(&mut buf, 1024).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&full[6..]);
        let frame = split_data_frame(&mut buf, 1024).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(
            Message::decode(frame).unwrap(),
            Message::Single {
                payload: Bytes::from_static(b"hello")
            }
        );
    }

    #[test]
    fn test_split_rejects_oversize_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32(1 << 20);
        assert!(matches!(
            split_data_frame(&mut buf, 1024),
            Err(TransportError::PayloadTooLarge { size, max_size: 1024 }) if size == 1 << 20
        ));
    }

    #[test]
    fn test_split_consecutive_frames() {
        let mut buf = encode(&Message::Single {
            payload: Bytes::from_static(b"a"),
        });
        buf.extend_from_slice(&encode(&Message::Control(ControlMessage::Close)));
        let first = split_data_frame(&mut buf, 64).unwrap().unwrap();
        let second = split_data_frame(&mut buf, 64).unwrap().unwrap();
        assert!(split_data_frame(&mut buf, 64).unwrap().is_none());
        assert!(matches!(Message::decode(first).unwrap(), Message::Single { .. }));
        assert_eq!(
            Message::decode(second).unwrap(),
            Message::Control(ControlMessage::Close)
        );
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(topic_name(PartitionId::new(3)), "command-api-3");
    }

    proptest! {
        #[test]
        fn prop_request_roundtrip(
            request_id in any::<u64>(),
            partition in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let message = Message::RequestResponse {
                request_id,
                partition_id: PartitionId::new(partition),
                payload: Bytes::from(payload),
            };
            let mut buf = encode(&message);
            let frame = split_data_frame(&mut buf, 1 << 16).unwrap().unwrap();
            prop_assert_eq!(Message::decode(frame).unwrap(), message);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_unknown_ids_never_fail(
            raw in 2u16..100,
            tail in proptest::collection::vec(any::<u8>(), 0..16)
        ) {
            let mut buf = BytesMut::new();
            buf.put_u16(raw);
            buf.extend_from_slice(&tail);
            prop_assert_eq!(Message::decode(buf.freeze()).unwrap(), Message::Unknown(raw));
        }
    }
}

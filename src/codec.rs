//! Bit-exact binary codec for the wire messages.
//!
//! Every message is a self-contained datagram: a common `type:u8 | seq:u64`
//! header followed by type-specific fields. All multi-byte integers are
//! big-endian and strings are `u16`-length-prefixed UTF-8. Datagrams above
//! 64 KiB are rejected at the boundary in both directions.

use bytes::{Buf, BufMut};

use crate::error::CodecError;
use crate::member::{Member, MemberId, Status};
use crate::message::{GossipPayload, Message};

/// Hard upper bound on an encoded datagram.
pub const MAX_DATAGRAM: usize = 65_536;

const TYPE_PING: u8 = 0x01;
const TYPE_PING_REQ: u8 = 0x02;
const TYPE_ACK: u8 = 0x03;
const TYPE_NACK: u8 = 0x04;

const STATUS_ALIVE: u8 = 0;
const STATUS_SUSPECT: u8 = 1;
const STATUS_DEAD: u8 = 2;

/// Encode a message into a freshly allocated buffer.
///
/// The buffer is sized up front from the computed wire length, so encoding
/// performs exactly one allocation per message.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let len = encoded_len(message);
    if len > MAX_DATAGRAM {
        return Err(CodecError::TooLarge(len));
    }

    let mut buf = Vec::with_capacity(len);
    buf.put_u8(message.type_code());
    buf.put_u64(message.seq());
    match message {
        Message::Ping { payload, .. } => put_payload(&mut buf, payload),
        Message::PingReq {
            target, payload, ..
        } => {
            put_member_id(&mut buf, target);
            put_payload(&mut buf, payload);
        }
        Message::Ack {
            responder, payload, ..
        } => {
            put_member_id(&mut buf, responder);
            put_payload(&mut buf, payload);
        }
        Message::Nack { target, .. } => put_member_id(&mut buf, target),
    }

    debug_assert_eq!(buf.len(), len);
    Ok(buf)
}

/// Decode a single datagram.
pub fn decode(datagram: &[u8]) -> Result<Message, CodecError> {
    if datagram.len() > MAX_DATAGRAM {
        return Err(CodecError::TooLarge(datagram.len()));
    }

    let mut buf = datagram;
    if buf.remaining() < 9 {
        return Err(CodecError::Truncated);
    }
    let message_type = buf.get_u8();
    let seq = buf.get_u64();

    match message_type {
        TYPE_PING => Ok(Message::Ping {
            seq,
            payload: take_payload(&mut buf)?,
        }),
        TYPE_PING_REQ => Ok(Message::PingReq {
            seq,
            target: take_member_id(&mut buf)?,
            payload: take_payload(&mut buf)?,
        }),
        TYPE_ACK => Ok(Message::Ack {
            seq,
            responder: take_member_id(&mut buf)?,
            payload: take_payload(&mut buf)?,
        }),
        TYPE_NACK => Ok(Message::Nack {
            seq,
            target: take_member_id(&mut buf)?,
        }),
        other => Err(CodecError::BadType(other)),
    }
}

fn encoded_len(message: &Message) -> usize {
    // type + seq
    let header = 1 + 8;
    header
        + match message {
            Message::Ping { payload, .. } => payload_len(payload),
            Message::PingReq {
                target, payload, ..
            } => member_id_len(target) + payload_len(payload),
            Message::Ack {
                responder, payload, ..
            } => member_id_len(responder) + payload_len(payload),
            Message::Nack { target, .. } => member_id_len(target),
        }
}

fn member_id_len(id: &MemberId) -> usize {
    2 + id.id.len() + 2 + id.address.len()
}

fn payload_len(payload: &GossipPayload) -> usize {
    // count + { id, status, incarnation } per record
    2 + payload
        .iter()
        .map(|m| member_id_len(&m.id) + 1 + 8)
        .sum::<usize>()
}

fn put_member_id(buf: &mut Vec<u8>, id: &MemberId) {
    buf.put_u16(id.id.len() as u16);
    buf.put_slice(id.id.as_bytes());
    buf.put_u16(id.address.len() as u16);
    buf.put_slice(id.address.as_bytes());
}

fn put_payload(buf: &mut Vec<u8>, payload: &GossipPayload) {
    buf.put_u16(payload.len() as u16);
    for member in payload {
        put_member_id(buf, &member.id);
        buf.put_u8(status_byte(member.status));
        buf.put_u64(member.incarnation);
    }
}

fn status_byte(status: Status) -> u8 {
    match status {
        Status::Alive => STATUS_ALIVE,
        Status::Suspect => STATUS_SUSPECT,
        Status::Dead => STATUS_DEAD,
    }
}

fn take_member_id(buf: &mut &[u8]) -> Result<MemberId, CodecError> {
    let id = take_string(buf)?;
    let address = take_string(buf)?;
    Ok(MemberId { id, address })
}

fn take_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes).map_err(|_| CodecError::BadUtf8)
}

fn take_status(buf: &mut &[u8]) -> Result<Status, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    match buf.get_u8() {
        STATUS_ALIVE => Ok(Status::Alive),
        STATUS_SUSPECT => Ok(Status::Suspect),
        STATUS_DEAD => Ok(Status::Dead),
        other => Err(CodecError::BadType(other)),
    }
}

fn take_payload(buf: &mut &[u8]) -> Result<GossipPayload, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    let count = buf.get_u16() as usize;
    let mut payload = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = take_member_id(buf)?;
        let status = take_status(buf)?;
        if buf.remaining() < 8 {
            return Err(CodecError::Truncated);
        }
        let incarnation = buf.get_u64();
        payload.push(Member::new(id, status, incarnation));
    }
    Ok(payload)
}

//! The outer packet envelope: one tagged variant per datagram, selected by the first byte.

use crate::codec::{self, HazelMessage};
use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TYPE_NORMAL: u8 = 0x00;
pub const TYPE_RELIABLE: u8 = 0x01;
pub const TYPE_FRAGMENT: u8 = 0x05;
pub const TYPE_HELLO: u8 = 0x08;
pub const TYPE_DISCONNECT: u8 = 0x09;
pub const TYPE_ACK: u8 = 0x0A;
pub const TYPE_PING: u8 = 0x0C;

/// The parsed form of a DISCONNECT body.
///
/// A bare `[0x09]` is a forced disconnect without a reason. Otherwise the second byte is the
///  `graceful` flag; a graceful disconnect may carry a record whose payload starts with the
///  numeric reason code, optionally followed by a length-prefixed UTF-8 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub graceful: bool,
    pub reason: Option<u8>,
    pub message: Option<String>,
}

impl DisconnectInfo {
    pub fn forced() -> DisconnectInfo {
        DisconnectInfo {
            graceful: false,
            reason: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Normal {
        messages: Vec<HazelMessage>,
    },
    Reliable {
        nonce: u16,
        messages: Vec<HazelMessage>,
    },
    Hello {
        nonce: u16,
        version: u8,
        payload: Bytes,
    },
    Disconnect(DisconnectInfo),
    Ack {
        nonce: u16,
        missing_mask: u8,
    },
    Ping {
        nonce: u16,
    },
}

impl Packet {
    /// Parses a datagram. `Ok(None)` means the datagram is deliberately ignored (FRAGMENT or
    ///  an unknown type byte); an error means the connection must treat the peer as broken.
    pub fn deser(buf: &mut Bytes) -> Result<Option<Packet>, CodecError> {
        let packet = match codec::read_u8(buf)? {
            TYPE_NORMAL => Packet::Normal {
                messages: Self::deser_messages(buf)?,
            },
            TYPE_RELIABLE => Packet::Reliable {
                nonce: codec::read_u16(buf)?,
                messages: Self::deser_messages(buf)?,
            },
            TYPE_HELLO => Packet::Hello {
                nonce: codec::read_u16(buf)?,
                version: codec::read_u8(buf)?,
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            TYPE_DISCONNECT => Packet::Disconnect(Self::deser_disconnect(buf)?),
            TYPE_ACK => Packet::Ack {
                nonce: codec::read_u16(buf)?,
                missing_mask: codec::read_u8(buf)?,
            },
            TYPE_PING => Packet::Ping {
                nonce: codec::read_u16(buf)?,
            },
            TYPE_FRAGMENT => return Ok(None),
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }

    fn deser_messages(buf: &mut Bytes) -> Result<Vec<HazelMessage>, CodecError> {
        let mut messages = Vec::new();
        while buf.has_remaining() {
            messages.push(codec::read_hazel_message(buf)?);
        }
        Ok(messages)
    }

    fn deser_disconnect(buf: &mut Bytes) -> Result<DisconnectInfo, CodecError> {
        if !buf.has_remaining() {
            return Ok(DisconnectInfo::forced());
        }
        let graceful = codec::read_bool(buf)?;
        if !buf.has_remaining() {
            return Ok(DisconnectInfo {
                graceful,
                reason: None,
                message: None,
            });
        }

        let record = codec::read_hazel_message(buf)?;
        let mut payload = record.payload;
        let reason = codec::read_u8(&mut payload)?;
        let message = if payload.remaining() > 1 {
            Some(codec::read_string(&mut payload)?)
        } else {
            None
        };
        Ok(DisconnectInfo {
            graceful,
            reason: Some(reason),
            message,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Packet::Normal { messages } => {
                buf.put_u8(TYPE_NORMAL);
                Self::ser_messages(messages, buf);
            }
            Packet::Reliable { nonce, messages } => {
                buf.put_u8(TYPE_RELIABLE);
                buf.put_u16(*nonce);
                Self::ser_messages(messages, buf);
            }
            Packet::Hello {
                nonce,
                version,
                payload,
            } => {
                buf.put_u8(TYPE_HELLO);
                buf.put_u16(*nonce);
                buf.put_u8(*version);
                buf.put_slice(payload);
            }
            Packet::Disconnect(info) => {
                buf.put_u8(TYPE_DISCONNECT);
                codec::write_bool(info.graceful, buf);
                if let Some(reason) = info.reason {
                    let mut record_payload = BytesMut::with_capacity(
                        1 + info.message.as_deref().map(codec::string_len).unwrap_or(0),
                    );
                    record_payload.put_u8(reason);
                    if let Some(message) = &info.message {
                        codec::write_string(message, &mut record_payload);
                    }
                    codec::write_hazel_message(
                        &HazelMessage::new(0, record_payload.freeze()),
                        buf,
                    );
                }
            }
            Packet::Ack {
                nonce,
                missing_mask,
            } => {
                buf.put_u8(TYPE_ACK);
                buf.put_u16(*nonce);
                buf.put_u8(*missing_mask);
            }
            Packet::Ping { nonce } => {
                buf.put_u8(TYPE_PING);
                buf.put_u16(*nonce);
            }
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Packet::Normal { messages } => 1 + Self::messages_len(messages),
            Packet::Reliable { messages, .. } => 3 + Self::messages_len(messages),
            Packet::Hello { payload, .. } => 4 + payload.len(),
            Packet::Disconnect(info) => {
                let mut len = 2;
                if info.reason.is_some() {
                    len += 3 + 1 + info.message.as_deref().map(codec::string_len).unwrap_or(0);
                }
                len
            }
            Packet::Ack { .. } => 4,
            Packet::Ping { .. } => 3,
        }
    }

    /// Serialises into a freshly sized buffer and freezes it - the form the send path and the
    ///  retransmit table keep.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    fn ser_messages(messages: &[HazelMessage], buf: &mut BytesMut) {
        for message in messages {
            codec::write_hazel_message(message, buf);
        }
    }

    fn messages_len(messages: &[HazelMessage]) -> usize {
        messages.iter().map(HazelMessage::serialized_len).sum()
    }
}

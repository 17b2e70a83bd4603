//! Non-owning cursor over a received datagram, yielding one [`Message`] per
//! iteration (`spec.md` §4.2, §6.1).

use nom::number::complete::{le_u16, u8 as nom_u8};
use nom::IResult;

use crate::error::ParseError;
use crate::message::{Message, MessageKind, MessageType};

/// Iterates the concatenated messages inside one datagram buffer.
///
/// A single datagram may contain several messages back to back; the receiver
/// is required to iterate until the buffer is exhausted (`spec.md` §3). This
/// type is a plain [`Iterator`], so callers typically just `for` over it.
pub struct MessageIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether the cursor still points at a message.
    pub fn has_msg(&self) -> bool {
        self.pos < self.buf.len()
    }

    fn header(input: &[u8]) -> IResult<&[u8], (u8, u16, u16)> {
        let (input, tag) = nom_u8(input)?;
        let (input, msg_id) = le_u16(input)?;
        let (input, payload_len) = le_u16(input)?;
        Ok((input, (tag, msg_id, payload_len)))
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<Message<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_msg() {
            return None;
        }

        let offset = self.pos;
        let rest = &self.buf[offset..];

        let (after_header, (tag, msg_id, payload_len)) = match Self::header(rest) {
            Ok(parsed) => parsed,
            Err(_) => {
                // Fewer than 5 bytes remain; nothing more can be decoded.
                self.pos = self.buf.len();
                return Some(Err(ParseError::TruncatedHeader { offset }));
            }
        };

        let payload_len_usize = payload_len as usize;
        if after_header.len() < payload_len_usize {
            self.pos = self.buf.len();
            return Some(Err(ParseError::PayloadOverrun {
                offset,
                payload_len,
                remaining: after_header.len(),
            }));
        }

        let payload = &after_header[..payload_len_usize];
        // The framing is well-formed regardless of what follows, so we can
        // always advance past this record even if its contents are invalid.
        self.pos = offset + 5 + payload_len_usize;

        let Some(ty) = MessageType::from_tag(tag) else {
            return Some(Err(ParseError::UnknownTag { msg_id, tag }));
        };

        let kind = match ty {
            MessageType::Borrow if payload.len() >= 2 => MessageKind::Borrow {
                frame_duration_ms: payload[0],
                buffer_length_frames: payload[1],
            },
            MessageType::Borrow => {
                return Some(Err(ParseError::UnknownTag { msg_id, tag }));
            }
            MessageType::Lent => MessageKind::Lent,
            MessageType::Enqueue => {
                if payload.len() < 3 {
                    return Some(Err(ParseError::ShortEnqueuePayload {
                        msg_id,
                        payload_len,
                    }));
                }
                let declared_frame_len = u16::from_le_bytes([payload[1], payload[2]]);
                MessageKind::Enqueue {
                    frame_idx: payload[0],
                    declared_frame_len,
                    frame: &payload[3..],
                }
            }
            MessageType::Fail if payload.len() >= 3 => MessageKind::Fail {
                offending_msg_id: u16::from_le_bytes([payload[0], payload[1]]),
                error_code: payload[2],
            },
            MessageType::Fail => {
                return Some(Err(ParseError::UnknownTag { msg_id, tag }));
            }
        };

        Some(Ok(Message { id: msg_id, kind }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;

    #[test]
    fn builder_iter_round_trip_borrow() {
        let mut b = MessageBuilder::new();
        let bytes = b.build_borrow(20, 4).to_vec();

        let mut it = MessageIter::new(&bytes);
        let msg = it.next().unwrap().unwrap();
        assert_eq!(msg.id, 0);
        assert_eq!(
            msg.kind,
            MessageKind::Borrow {
                frame_duration_ms: 20,
                buffer_length_frames: 4,
            }
        );
        assert!(it.next().is_none());
    }

    #[test]
    fn builder_iter_round_trip_enqueue() {
        let mut b = MessageBuilder::new();
        let frame = [9u8, 8, 7, 6, 5, 4];
        let bytes = b.build_enqueue(3, &frame).to_vec();

        let mut it = MessageIter::new(&bytes);
        let msg = it.next().unwrap().unwrap();
        match msg.kind {
            MessageKind::Enqueue {
                frame_idx, frame: f, ..
            } => {
                assert_eq!(frame_idx, 3);
                assert_eq!(f, &frame);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(it.next().is_none());
    }

    #[test]
    fn multiple_messages_in_one_datagram() {
        let mut b = MessageBuilder::new();
        let mut datagram = Vec::new();
        datagram.extend_from_slice(b.build_lent());
        datagram.extend_from_slice(b.build_fail(1, 4));

        let kinds: Vec<_> = MessageIter::new(&datagram)
            .map(|r| r.unwrap().kind)
            .collect();
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0], MessageKind::Lent);
        assert!(matches!(kinds[1], MessageKind::Fail { .. }));
    }

    #[test]
    fn truncated_header_is_reported_and_halts_iteration() {
        let buf = [0x00u8, 0x01]; // only 2 of 5 header bytes
        let mut it = MessageIter::new(&buf);
        assert_eq!(
            it.next(),
            Some(Err(ParseError::TruncatedHeader { offset: 0 }))
        );
        assert!(it.next().is_none());
    }

    #[test]
    fn payload_overrun_is_reported() {
        // tag=LENT, id=0, payload_len=10, but nothing follows.
        let buf = [0x01u8, 0x00, 0x00, 0x0A, 0x00];
        let mut it = MessageIter::new(&buf);
        assert_eq!(
            it.next(),
            Some(Err(ParseError::PayloadOverrun {
                offset: 0,
                payload_len: 10,
                remaining: 0,
            }))
        );
    }

    #[test]
    fn unknown_tag_is_reported_but_advances() {
        // tag=0x7F (unknown), id=0, payload_len=0, followed by a valid LENT.
        let mut buf = vec![0x7Fu8, 0x00, 0x00, 0x00, 0x00];
        let mut b = MessageBuilder::new();
        buf.extend_from_slice(b.build_lent());

        let mut it = MessageIter::new(&buf);
        assert!(matches!(
            it.next(),
            Some(Err(ParseError::UnknownTag { tag: 0x7F, .. }))
        ));
        assert_eq!(it.next().unwrap().unwrap().kind, MessageKind::Lent);
    }

    #[test]
    fn short_enqueue_payload_is_reported() {
        // tag=ENQUEUE, id=0, payload_len=1, one payload byte.
        let buf = [0x02u8, 0x00, 0x00, 0x01, 0x00, 0xAA];
        let mut it = MessageIter::new(&buf);
        assert!(matches!(
            it.next(),
            Some(Err(ParseError::ShortEnqueuePayload {
                payload_len: 1,
                ..
            }))
        ));
    }
}

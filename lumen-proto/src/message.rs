//! The four wire messages (`spec.md` §3, §4.2) and the builder that assembles
//! them into a single growable buffer.

use tracing::trace;

/// Maximum payload length representable by the 16-bit `payload_len` field.
pub const MAX_PAYLOAD_LEN: usize = 65_535;

/// Size in bytes of the fixed header: `type:u8 | msg_id:u16-LE | payload_len:u16-LE`.
const HEADER_LEN: usize = 5;

/// The one-byte type tag at the front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Borrow = 0x00,
    Lent = 0x01,
    Enqueue = 0x02,
    Fail = 0xFF,
}

impl MessageType {
    /// Recognize a wire tag, returning `None` for anything outside
    /// `{0x00, 0x01, 0x02, 0xFF}`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(MessageType::Borrow),
            0x01 => Some(MessageType::Lent),
            0x02 => Some(MessageType::Enqueue),
            0xFF => Some(MessageType::Fail),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A fully decoded message, borrowing its variable-length fields from the
/// datagram buffer it was parsed out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    /// The id the sender assigned this message from its own counter.
    pub id: u16,
    pub kind: MessageKind<'a>,
}

/// The type-specific payload of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind<'a> {
    Borrow {
        frame_duration_ms: u8,
        buffer_length_frames: u8,
    },
    Lent,
    Enqueue {
        frame_idx: u8,
        /// `frame_byte_length` as declared on the wire. Not authoritative for
        /// slicing `frame` — see [`MessageKind::Enqueue::frame`] — but kept
        /// around since a sender/receiver mismatch here is itself useful
        /// diagnostic signal.
        declared_frame_len: u16,
        /// The sub-slice of the payload starting at offset 3, per `spec.md`
        /// §4.2: "ENQUEUE's frame view is a sub-slice starting at payload
        /// offset 3, length `payload_len − 3`."
        frame: &'a [u8],
    },
    Fail {
        offending_msg_id: u16,
        error_code: u8,
    },
}

/// Builds outgoing messages into a single reusable buffer.
///
/// Every `build_*` call resizes the internal buffer, writes the header and
/// payload, increments `next_msg_id`, and returns a borrow of the buffer.
/// Because the returned slice borrows `&self` through the call that produced
/// it, the borrow checker enforces the rule in `spec.md` §4.2 and §9
/// directly: you cannot call `build_*` again while still holding the
/// previous message's bytes, and you cannot retain the view past sending it.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    buf: Vec<u8>,
    next_msg_id: u16,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(32),
            next_msg_id: 0,
        }
    }

    /// The id that will be assigned to the *next* message built.
    pub fn next_msg_id(&self) -> u16 {
        self.next_msg_id
    }

    fn build(&mut self, ty: MessageType, payload: &[u8]) -> &[u8] {
        assert!(payload.len() <= MAX_PAYLOAD_LEN, "payload too large");

        let msg_len = HEADER_LEN + payload.len();
        self.buf.clear();
        self.buf.resize(msg_len, 0);

        self.buf[0] = ty.tag();
        self.buf[1..3].copy_from_slice(&self.next_msg_id.to_le_bytes());
        self.buf[3..5].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        self.buf[HEADER_LEN..].copy_from_slice(payload);

        trace!(msg_id = self.next_msg_id, ty = ?ty, payload_len = payload.len(), "built message");
        self.next_msg_id = self.next_msg_id.wrapping_add(1);

        &self.buf
    }

    pub fn build_borrow(&mut self, frame_duration_ms: u8, buffer_length_frames: u8) -> &[u8] {
        let payload = [frame_duration_ms, buffer_length_frames];
        self.build(MessageType::Borrow, &payload)
    }

    pub fn build_lent(&mut self) -> &[u8] {
        self.build(MessageType::Lent, &[])
    }

    /// Builds an `ENQUEUE` message. `frame` must be at most
    /// [`MAX_PAYLOAD_LEN`] `- 3` bytes.
    pub fn build_enqueue(&mut self, frame_idx: u8, frame: &[u8]) -> &[u8] {
        assert!(
            frame.len() <= MAX_PAYLOAD_LEN - 3,
            "frame too large to fit in one ENQUEUE payload"
        );
        let mut payload = Vec::with_capacity(3 + frame.len());
        payload.push(frame_idx);
        payload.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        payload.extend_from_slice(frame);
        self.build(MessageType::Enqueue, &payload)
    }

    pub fn build_fail(&mut self, offending_msg_id: u16, error_code: u8) -> &[u8] {
        let mut payload = [0u8; 3];
        payload[0..2].copy_from_slice(&offending_msg_id.to_le_bytes());
        payload[2] = error_code;
        self.build(MessageType::Fail, &payload)
    }
}

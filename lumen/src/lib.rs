//! `lumen` — real-time light-color streaming over UDP.
//!
//! A producer ("source") reserves exclusive use of a display ("sink") and
//! then streams fixed-duration color frames; the sink reconstructs a
//! time-paced playback despite jitter, reordering, and loss. This crate is a
//! thin facade over the four workspace members that do the actual work:
//!
//! - [`lumen_proto`] — the wire format, message codec, and the byte ring the
//!   sink uses to hold pending frames.
//! - [`lumen_net`] — the non-blocking UDP transport contract.
//! - [`lumen_sink`] — the display peer's reservation-and-playback state
//!   machine, re-exported here as [`Sink`].
//! - [`lumen_source`] — the producer peer's handshake and send-pacing state
//!   machine, re-exported here as [`Source`].
//!
//! Both engines are driven cooperatively: nothing happens except inside a
//! call to [`Sink::tick`]/[`Sink::get`] or [`Source::tick`]/[`Source::put`].
//! There is no background thread anywhere in this workspace.
//!
//! See `demos/demo.rs` for a minimal end-to-end producer/display pair on
//! loopback.

pub use lumen_net::{Endpoint, RecvOutcome, SendOutcome, Transport, TransportError, UdpTransport};
pub use lumen_proto::{
    ByteRing, Clock, ErrorCode, Message, MessageBuilder, MessageIter, MessageKind, MessageType,
    ParseError, SystemClock, LIBRARY_VERSION, MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
};
pub use lumen_sink::{
    SinkConfig, SinkConfigBuilder, SinkEngine as Sink, SinkError, SinkState,
    DEFAULT_MAX_RING_CAPACITY_FRAMES, DROP_TIMEOUT_MS, LENT_SEND_INTERVAL_MS,
};
pub use lumen_source::{
    SourceConfig, SourceConfigBuilder, SourceEngine as Source, SourceError, SourceState,
    DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_MAX_BUFFERED_FRAMES, DEFAULT_RETRY_TIMEOUT_MS,
};

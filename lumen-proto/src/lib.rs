//! Wire format, message codec, and supporting primitives for the `lumen`
//! light-color streaming protocol.
//!
//! This crate only knows about bytes: building and parsing the four message
//! kinds (`BORROW`, `LENT`, `ENQUEUE`, `FAIL`), the fixed-capacity byte ring
//! used to hold pending frames, the wire error codes, and the protocol/library
//! version constants. It has no notion of sockets, state machines, or clocks —
//! those live in `lumen-net`, `lumen-sink`, and `lumen-source`.

pub mod clock;
pub mod error;
pub mod iter;
pub mod message;
pub mod ring;
pub mod version;

pub use clock::{elapsed_ms, Clock, SystemClock};
pub use error::{ErrorCode, ParseError};
pub use iter::MessageIter;
pub use message::{Message, MessageBuilder, MessageKind, MessageType, MAX_PAYLOAD_LEN};
pub use ring::ByteRing;
pub use version::{LIBRARY_VERSION, PROTOCOL_VERSION};

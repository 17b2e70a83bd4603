//! Reservation state machine and timed playback for the display peer
//! (`spec.md` §4.4).
//!
//! A [`SinkEngine`] owns one UDP socket, one pending-frames [`ByteRing`], and
//! the scratch buffers for the currently displayed and currently received
//! frame. Progress only happens inside [`SinkEngine::tick`] and
//! [`SinkEngine::get`] — there is no background thread.

use std::time::Duration;

use bytes::Bytes;
use lumen_net::{Endpoint, RecvOutcome, SendOutcome, Transport, UdpTransport};
use lumen_proto::{
    elapsed_ms, ByteRing, Clock, ErrorCode, MessageBuilder, MessageIter, MessageKind, ParseError,
    SystemClock,
};
use tracing::{debug, trace, warn};

/// Preconfigured upper bound on ring capacity, in whole frames, unless
/// overridden via [`SinkConfigBuilder::max_ring_capacity_frames`]. Carried
/// over from the reference implementation's `pending_frames_capacity`.
pub const DEFAULT_MAX_RING_CAPACITY_FRAMES: usize = 128;

/// Silence past this many milliseconds since the last packet from the
/// current borrower drops the reservation (`spec.md` §4.4).
pub const DROP_TIMEOUT_MS: u32 = 1500;

/// Interval between unsolicited `LENT` heartbeats while reserved.
pub const LENT_SEND_INTERVAL_MS: u32 = 500;

/// Minimum accepted `frame_duration_ms` (`spec.md` Invariant 3).
pub const FRAME_DURATION_MS_MIN: u8 = 10;

/// Bytes of headroom added to `frame_byte_size` when sizing the receive
/// buffer, matching the reference's `lights_count*3 + 10` assertion.
const RECV_BUF_HEADROOM: usize = 10;

/// Constructor and runtime failures. Unlike the state machine's protocol
/// errors (which never leave the engine — see `spec.md` §7), these can only
/// happen at construction time, when there is no valid engine to return.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to bind sink transport: {0}")]
    Transport(#[from] lumen_net::TransportError),
}

/// Reservation status (`spec.md` §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Waiting for a `BORROW`.
    Open,
    /// Reserved by exactly one borrower endpoint.
    Lent,
    /// Terminal. All input is ignored, no output is produced.
    Error,
}

/// Construction parameters for a [`SinkEngine`].
#[derive(Debug, Clone)]
pub struct SinkConfig {
    port: u16,
    lights_count: u8,
    max_ring_capacity_frames: usize,
    recv_buf_size: usize,
}

impl SinkConfig {
    pub fn frame_byte_size(&self) -> usize {
        self.lights_count as usize * 3
    }
}

/// Builds a [`SinkConfig`], defaulting the ring and receive-buffer sizing to
/// the reference implementation's constants.
pub struct SinkConfigBuilder {
    port: u16,
    lights_count: u8,
    max_ring_capacity_frames: usize,
    recv_buf_size: Option<usize>,
}

impl SinkConfigBuilder {
    fn new(port: u16, lights_count: u8) -> Self {
        Self {
            port,
            lights_count,
            max_ring_capacity_frames: DEFAULT_MAX_RING_CAPACITY_FRAMES,
            recv_buf_size: None,
        }
    }

    /// Overrides the preconfigured ring-capacity upper bound that guards
    /// `BORROW`'s `buffer_length_frames` (`spec.md` Invariant 4).
    pub fn max_ring_capacity_frames(mut self, frames: usize) -> Self {
        self.max_ring_capacity_frames = frames;
        self
    }

    /// Overrides the receive buffer size. Must be at least
    /// `frame_byte_size + 3` to hold one `ENQUEUE` header plus a full frame;
    /// defaults to `frame_byte_size + 10`.
    pub fn recv_buf_size(mut self, bytes: usize) -> Self {
        self.recv_buf_size = Some(bytes);
        self
    }

    pub fn build(self) -> SinkConfig {
        let frame_byte_size = self.lights_count as usize * 3;
        SinkConfig {
            port: self.port,
            lights_count: self.lights_count,
            max_ring_capacity_frames: self.max_ring_capacity_frames,
            recv_buf_size: self
                .recv_buf_size
                .unwrap_or(frame_byte_size + RECV_BUF_HEADROOM),
        }
    }
}

/// The display peer: reservation state machine, pending-frames ring, and
/// timed playback.
pub struct SinkEngine<T: Transport = UdpTransport, C: Clock = SystemClock> {
    transport: T,
    clock: C,
    builder: MessageBuilder,
    recv_buf: Vec<u8>,

    state: SinkState,
    borrower: Option<Endpoint>,
    frame_duration_ms: u8,
    frame_byte_size: usize,
    max_ring_capacity_bytes: usize,

    ring: ByteRing,
    current_frame: Vec<u8>,
    last_enqueued_idx: Option<u8>,
    time_origin: Option<u32>,

    last_recv_time: u32,
    last_lent_time: u32,
}

impl SinkEngine<UdpTransport, SystemClock> {
    /// Starts building a [`SinkConfig`] for `port`/`lights_count`.
    pub fn builder(port: u16, lights_count: u8) -> SinkConfigBuilder {
        SinkConfigBuilder::new(port, lights_count)
    }

    /// Binds a UDP socket on `config.port` and returns an `Open` engine.
    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        let transport = UdpTransport::bind_port(config.port)?;
        Ok(Self::with_transport_and_clock(
            config,
            transport,
            SystemClock::new(),
        ))
    }
}

impl<T: Transport, C: Clock> SinkEngine<T, C> {
    /// Builds an engine over an already-bound transport and an arbitrary
    /// clock — the seam integration tests use to substitute a fake clock
    /// and a fake transport for deterministic timing.
    pub fn with_transport_and_clock(config: SinkConfig, transport: T, clock: C) -> Self {
        let frame_byte_size = config.frame_byte_size();
        Self {
            transport,
            clock,
            builder: MessageBuilder::new(),
            recv_buf: vec![0u8; config.recv_buf_size],

            state: SinkState::Open,
            borrower: None,
            frame_duration_ms: 0,
            frame_byte_size,
            max_ring_capacity_bytes: config.max_ring_capacity_frames * frame_byte_size,

            ring: ByteRing::new(0),
            current_frame: vec![0u8; frame_byte_size],
            last_enqueued_idx: None,
            time_origin: None,

            last_recv_time: 0,
            last_lent_time: 0,
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn borrower(&self) -> Option<Endpoint> {
        self.borrower
    }

    pub fn frame_byte_size(&self) -> usize {
        self.frame_byte_size
    }

    pub fn next_msg_id(&self) -> u16 {
        self.builder.next_msg_id()
    }

    /// The locally bound address, useful when [`SinkConfigBuilder`] was
    /// given port `0` and the OS picked one.
    pub fn local_endpoint(&self) -> std::io::Result<Endpoint> {
        self.transport.local_endpoint()
    }

    /// Runs one non-blocking receive-drain (bounded to one datagram per
    /// tick) followed by the heartbeat and drop-timeout checks.
    ///
    /// No-op once [`SinkState::Error`] is reached.
    pub fn tick(&mut self) {
        if self.state == SinkState::Error {
            return;
        }

        match self.transport.recv_from(&mut self.recv_buf) {
            RecvOutcome::Received(n, from) => self.handle_datagram(from, n),
            RecvOutcome::WouldBlock => {}
            RecvOutcome::Fatal => {
                warn!("sink transport failed fatally");
                self.state = SinkState::Error;
                return;
            }
        }

        self.check_drop_timeout();
        self.check_lent_heartbeat();
    }

    fn handle_datagram(&mut self, from: Endpoint, n: usize) {
        // `recv_buf` is reused as the scratch buffer across ticks; copy out
        // the bytes we actually received before re-borrowing `self` mutably.
        let datagram = Bytes::copy_from_slice(&self.recv_buf[..n]);
        for parsed in MessageIter::new(&datagram) {
            match parsed {
                Ok(msg) => {
                    let (msg_id, kind) = (msg.id, msg.kind);
                    self.handle_message(from, msg_id, kind);
                }
                Err(ParseError::UnknownTag { msg_id, tag }) => {
                    warn!(%from, msg_id, tag, "unknown message tag");
                    self.send_fail(from, msg_id, ErrorCode::BadMsg);
                }
                Err(ParseError::ShortEnqueuePayload { msg_id, .. }) => {
                    warn!(%from, msg_id, "enqueue payload too short");
                    match self.state {
                        SinkState::Open => {
                            self.send_fail(from, msg_id, ErrorCode::NotBorrowed);
                        }
                        SinkState::Lent if self.borrower == Some(from) => {
                            self.send_fail(from, msg_id, ErrorCode::BadMsg);
                            self.drop_borrower();
                        }
                        SinkState::Lent => {
                            self.send_fail(from, msg_id, ErrorCode::LentToOtherSource);
                        }
                        SinkState::Error => {}
                    }
                }
                Err(e @ (ParseError::TruncatedHeader { .. } | ParseError::PayloadOverrun { .. })) => {
                    warn!(%from, error = %e, "malformed datagram framing, discarding remainder");
                    break;
                }
            }
        }
    }

    fn handle_message(&mut self, from: Endpoint, msg_id: u16, kind: MessageKind<'_>) {
        match kind {
            MessageKind::Borrow {
                frame_duration_ms,
                buffer_length_frames,
            } => self.handle_borrow(from, msg_id, frame_duration_ms, buffer_length_frames),
            MessageKind::Enqueue {
                frame_idx, frame, ..
            } => self.handle_enqueue(from, msg_id, frame_idx, frame),
            MessageKind::Lent | MessageKind::Fail { .. } => {
                warn!(%from, msg_id, "sink does not accept this message type");
                self.send_fail(from, msg_id, ErrorCode::BadMsg);
            }
        }
    }

    fn handle_borrow(
        &mut self,
        from: Endpoint,
        msg_id: u16,
        frame_duration_ms: u8,
        buffer_length_frames: u8,
    ) {
        if self.state == SinkState::Lent && self.borrower != Some(from) {
            debug!(%from, "borrow request while lent to another source");
            self.send_fail(from, msg_id, ErrorCode::LentToOtherSource);
            return;
        }

        if frame_duration_ms < FRAME_DURATION_MS_MIN {
            self.send_fail(from, msg_id, ErrorCode::RequestedFrameDurationTooShort);
            if self.state == SinkState::Lent {
                self.drop_borrower();
            }
            return;
        }

        let requested_bytes = buffer_length_frames as usize * self.frame_byte_size;
        if requested_bytes > self.max_ring_capacity_bytes {
            self.send_fail(from, msg_id, ErrorCode::RequestedBufferTooLarge);
            if self.state == SinkState::Lent {
                self.drop_borrower();
            }
            return;
        }

        self.frame_duration_ms = frame_duration_ms;
        self.ring = ByteRing::new(requested_bytes);
        self.current_frame.iter_mut().for_each(|b| *b = 0);
        self.last_enqueued_idx = None;
        self.time_origin = None;
        self.borrower = Some(from);
        self.last_recv_time = self.clock.now_ms();
        self.last_lent_time = self.last_recv_time;
        self.state = SinkState::Lent;

        debug!(%from, frame_duration_ms, buffer_length_frames, "borrowed");
        self.send_lent(from);
    }

    fn handle_enqueue(&mut self, from: Endpoint, msg_id: u16, frame_idx: u8, frame: &[u8]) {
        match self.state {
            SinkState::Open => {
                self.send_fail(from, msg_id, ErrorCode::NotBorrowed);
            }
            SinkState::Lent if self.borrower == Some(from) => {
                self.last_recv_time = self.clock.now_ms();
                self.enqueue_ordered(frame_idx, frame);
            }
            SinkState::Lent => {
                self.send_fail(from, msg_id, ErrorCode::LentToOtherSource);
            }
            SinkState::Error => {}
        }
    }

    /// Applies the duplicate/advance/drop-as-late ordering policy
    /// (`spec.md` §4.4) to one incoming `ENQUEUE` frame.
    fn enqueue_ordered(&mut self, frame_idx: u8, frame: &[u8]) {
        let copies = match self.last_enqueued_idx {
            None => 1u16,
            Some(last) => {
                let diff = bounded_diff(last, frame_idx, 256);
                if diff == 0 {
                    trace!(frame_idx, "duplicate enqueue, dropping");
                    return;
                }
                if diff > 128 {
                    trace!(frame_idx, diff, "out-of-order enqueue, dropping");
                    return;
                }
                diff
            }
        };

        let needed = copies as usize * self.frame_byte_size;
        if needed > self.ring.free() {
            trace!(frame_idx, copies, "ring full, enqueue refused");
            return;
        }

        let mut filled = vec![0u8; self.frame_byte_size];
        pattern_fill(&mut filled, frame);
        for _ in 0..copies {
            let accepted = self.ring.enqueue(&filled);
            debug_assert!(accepted, "space was reserved above");
        }
        self.last_enqueued_idx = Some(frame_idx);
    }

    /// Exposes the currently displayed frame. Only meaningful while
    /// [`SinkState::Lent`]; returns `false` otherwise and leaves `out`
    /// untouched.
    pub fn get(&mut self, out: &mut [u8]) -> bool {
        if self.state != SinkState::Lent {
            return false;
        }

        let now = self.clock.now_ms();
        match self.time_origin {
            None => {
                if self.dequeue_current_frame() {
                    self.time_origin = Some(now);
                }
            }
            Some(mut origin) => {
                while elapsed_ms(origin, now) > self.frame_duration_ms as u32 {
                    if !self.dequeue_current_frame() {
                        break;
                    }
                    origin = origin.wrapping_add(self.frame_duration_ms as u32);
                }
                self.time_origin = Some(origin);
            }
        }

        pattern_fill(out, &self.current_frame);
        true
    }

    fn dequeue_current_frame(&mut self) -> bool {
        let mut next = vec![0u8; self.frame_byte_size];
        if self.ring.dequeue_into(&mut next) {
            self.current_frame = next;
            true
        } else {
            false
        }
    }

    fn check_drop_timeout(&mut self) {
        if self.state != SinkState::Lent {
            return;
        }
        let now = self.clock.now_ms();
        if elapsed_ms(self.last_recv_time, now) > DROP_TIMEOUT_MS {
            if let Some(borrower) = self.borrower {
                debug!(%borrower, "drop timeout, releasing borrower");
                self.send_fail_to(borrower, 0, ErrorCode::Timeout);
            }
            self.drop_borrower();
        }
    }

    fn check_lent_heartbeat(&mut self) {
        if self.state != SinkState::Lent {
            return;
        }
        let now = self.clock.now_ms();
        if elapsed_ms(self.last_lent_time, now) >= LENT_SEND_INTERVAL_MS {
            if let Some(borrower) = self.borrower {
                self.send_lent(borrower);
            }
            self.last_lent_time = now;
        }
    }

    fn drop_borrower(&mut self) {
        self.borrower = None;
        self.state = SinkState::Open;
    }

    fn send_lent(&mut self, to: Endpoint) {
        let bytes = self.builder.build_lent();
        send_best_effort(&mut self.transport, to, bytes);
    }

    fn send_fail(&mut self, to: Endpoint, offending_msg_id: u16, code: ErrorCode) {
        self.send_fail_to(to, offending_msg_id, code);
    }

    fn send_fail_to(&mut self, to: Endpoint, offending_msg_id: u16, code: ErrorCode) {
        let bytes = self.builder.build_fail(offending_msg_id, code.into());
        send_best_effort(&mut self.transport, to, bytes);
    }
}

/// `(b - a) mod cap` for the 8-bit frame-index sequence space.
fn bounded_diff(a: u8, b: u8, cap: u16) -> u16 {
    let a = a as i32;
    let b = b as i32;
    let cap = cap as i32;
    (((b - a) % cap + cap) % cap) as u16
}

/// Copies `src` into `dst`, repeating `src` if shorter or truncating it if
/// longer (`spec.md` §4.4's "pattern fill").
fn pattern_fill(dst: &mut [u8], src: &[u8]) {
    if src.is_empty() || dst.is_empty() {
        return;
    }
    if src.len() >= dst.len() {
        dst.copy_from_slice(&src[..dst.len()]);
        return;
    }
    for chunk in dst.chunks_mut(src.len()) {
        let n = chunk.len();
        chunk.copy_from_slice(&src[..n]);
    }
}

fn send_best_effort(transport: &mut impl Transport, to: Endpoint, bytes: &[u8]) {
    match transport.send_to(bytes, to) {
        SendOutcome::Sent(_) | SendOutcome::WouldBlock => {}
        SendOutcome::NoPeer | SendOutcome::Fatal => {
            trace!(%to, "send failed, ignoring per never-retry policy");
        }
    }
}

/// Blocks the calling thread for `ms` milliseconds. Exposed for embedders
/// driving [`SinkEngine::tick`] in a simple poll loop; the engine itself
/// never sleeps (`spec.md` §5).
pub fn sleep_ms(ms: u32) {
    std::thread::sleep(Duration::from_millis(ms as u64));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct FakeClock(Cell<u32>);

    impl FakeClock {
        fn advance(&self, ms: u32) {
            self.0.set(self.0.get().wrapping_add(ms));
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u32 {
            self.0.get()
        }
    }

    struct FakeTransport {
        local: Endpoint,
        inbox: VecDeque<(Vec<u8>, Endpoint)>,
        sent: Vec<(Vec<u8>, Endpoint)>,
    }

    impl FakeTransport {
        fn new(port: u16) -> Self {
            let addr: SocketAddr = ([127, 0, 0, 1], port).into();
            Self {
                local: Endpoint::new(addr),
                inbox: VecDeque::new(),
                sent: Vec::new(),
            }
        }

        fn push_incoming(&mut self, bytes: &[u8], from: Endpoint) {
            self.inbox.push_back((bytes.to_vec(), from));
        }

        fn sent_to(&self, to: Endpoint) -> Vec<&[u8]> {
            self.sent
                .iter()
                .filter(|(_, dest)| *dest == to)
                .map(|(b, _)| b.as_slice())
                .collect()
        }
    }

    impl Transport for FakeTransport {
        fn bind_any() -> Result<Self, lumen_net::TransportError> {
            Ok(Self::new(0))
        }

        fn bind_port(port: u16) -> Result<Self, lumen_net::TransportError> {
            Ok(Self::new(port))
        }

        fn resolve_and_connect(
            &mut self,
            _host: &str,
            _port: u16,
        ) -> Result<Endpoint, lumen_net::TransportError> {
            Ok(self.local)
        }

        fn set_peer(&mut self, _endpoint: Endpoint) {}
        fn clear_peer(&mut self) {}

        fn send(&mut self, _bytes: &[u8]) -> SendOutcome {
            SendOutcome::NoPeer
        }

        fn send_to(&mut self, bytes: &[u8], endpoint: Endpoint) -> SendOutcome {
            self.sent.push((bytes.to_vec(), endpoint));
            SendOutcome::Sent(bytes.len())
        }

        fn recv_from(&mut self, buf: &mut [u8]) -> RecvOutcome {
            match self.inbox.pop_front() {
                Some((bytes, from)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    RecvOutcome::Received(n, from)
                }
                None => RecvOutcome::WouldBlock,
            }
        }

        fn local_endpoint(&self) -> std::io::Result<Endpoint> {
            Ok(self.local)
        }
    }

    fn source_endpoint(port: u16) -> Endpoint {
        Endpoint::new(([127, 0, 0, 1], port).into())
    }

    fn new_engine() -> SinkEngine<FakeTransport, FakeClock> {
        let config = SinkEngine::builder(9000, 2).build();
        let transport = FakeTransport::new(9000);
        SinkEngine::with_transport_and_clock(config, transport, FakeClock::default())
    }

    #[test]
    fn open_to_lent_on_valid_borrow() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_borrow(20, 4), from);

        sink.tick();

        assert_eq!(sink.state(), SinkState::Lent);
        assert_eq!(sink.borrower(), Some(from));
        assert_eq!(sink.transport.sent_to(from).len(), 1);
    }

    #[test]
    fn borrow_with_too_short_duration_is_rejected() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(9, 4), from);

        sink.tick();

        assert_eq!(sink.state(), SinkState::Open);
        assert_eq!(sink.transport.sent_to(from).len(), 1);
        let fail = sink.transport.sent_to(from)[0];
        assert_eq!(fail[0], 0xFF);
    }

    #[test]
    fn borrow_requesting_oversized_buffer_is_rejected() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        // 2 lights -> frame_byte_size 6; 128 frame default cap -> 768 bytes;
        // requesting 255 frames (1530 bytes) exceeds it.
        sink.transport.push_incoming(b.build_borrow(20, 255), from);

        sink.tick();

        assert_eq!(sink.state(), SinkState::Open);
    }

    #[test]
    fn enqueue_from_non_borrower_gets_lent_to_other_source() {
        let mut sink = new_engine();
        let borrower = source_endpoint(9001);
        let stranger = source_endpoint(9002);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), borrower);
        sink.tick();

        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_enqueue(0, &[1, 2, 3, 4, 5, 6]), stranger);
        sink.tick();

        assert_eq!(sink.state(), SinkState::Lent);
        let fail = sink.transport.sent_to(stranger);
        assert_eq!(fail.len(), 1);
        assert_eq!(fail[0][0], 0xFF);
    }

    #[test]
    fn duplicate_enqueue_is_suppressed() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), from);
        sink.tick();

        let frame = [1u8, 2, 3, 4, 5, 6];
        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_enqueue(5, &frame), from);
        sink.tick();
        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_enqueue(5, &frame), from);
        sink.tick();

        assert_eq!(sink.last_enqueued_idx, Some(5));
        assert_eq!(sink.ring.len(), sink.frame_byte_size());
    }

    #[test]
    fn skip_duplicates_latest_payload_into_gaps() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), from);
        sink.tick();

        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_enqueue(0, &[1, 1, 1, 1, 1, 1]), from);
        sink.tick();

        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_enqueue(3, &[9, 9, 9, 9, 9, 9]), from);
        sink.tick();

        assert_eq!(sink.last_enqueued_idx, Some(3));
        assert_eq!(sink.ring.len(), 4 * sink.frame_byte_size());
    }

    #[test]
    fn out_of_order_late_packet_is_dropped() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), from);
        sink.tick();

        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_enqueue(10, &[1, 1, 1, 1, 1, 1]), from);
        sink.tick();
        let before = sink.ring.len();

        let mut b = MessageBuilder::new();
        sink.transport
            .push_incoming(b.build_enqueue(140, &[2, 2, 2, 2, 2, 2]), from);
        sink.tick();

        assert_eq!(sink.last_enqueued_idx, Some(10));
        assert_eq!(sink.ring.len(), before);
    }

    #[test]
    fn short_enqueue_payload_drops_borrower() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), from);
        sink.tick();

        // A raw short ENQUEUE: tag=0x02, id=0, payload_len=1, one byte.
        let raw = [0x02u8, 0x00, 0x00, 0x01, 0x00, 0xAA];
        sink.transport.push_incoming(&raw, from);
        sink.tick();

        assert_eq!(sink.state(), SinkState::Open);
        assert_eq!(sink.borrower(), None);
    }

    #[test]
    fn short_enqueue_payload_from_stranger_gets_lent_to_other_source() {
        let mut sink = new_engine();
        let borrower = source_endpoint(9001);
        let stranger = source_endpoint(9002);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), borrower);
        sink.tick();

        // A raw short ENQUEUE from a stranger: tag=0x02, id=0, payload_len=1, one byte.
        let raw = [0x02u8, 0x00, 0x00, 0x01, 0x00, 0xAA];
        sink.transport.push_incoming(&raw, stranger);
        sink.tick();

        assert_eq!(sink.state(), SinkState::Lent);
        assert_eq!(sink.borrower(), Some(borrower));
        let fail = sink.transport.sent_to(stranger);
        assert_eq!(fail.len(), 1);
        assert_eq!(fail[0][0], 0xFF);
        assert_eq!(fail[0][7], u8::from(ErrorCode::LentToOtherSource));
    }

    #[test]
    fn short_enqueue_payload_while_open_gets_not_borrowed() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);

        let raw = [0x02u8, 0x00, 0x00, 0x01, 0x00, 0xAA];
        sink.transport.push_incoming(&raw, from);
        sink.tick();

        assert_eq!(sink.state(), SinkState::Open);
        let fail = sink.transport.sent_to(from);
        assert_eq!(fail.len(), 1);
        assert_eq!(fail[0][7], u8::from(ErrorCode::NotBorrowed));
    }

    #[test]
    fn silence_past_drop_timeout_releases_borrower() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), from);
        sink.tick();

        sink.clock.advance(DROP_TIMEOUT_MS + 1);
        sink.tick();

        assert_eq!(sink.state(), SinkState::Open);
        let fails: Vec<_> = sink
            .transport
            .sent_to(from)
            .into_iter()
            .filter(|m| m[0] == 0xFF)
            .collect();
        assert_eq!(fails.len(), 1);
    }

    #[test]
    fn heartbeat_is_sent_after_interval() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), from);
        sink.tick();
        let sent_after_borrow = sink.transport.sent_to(from).len();

        sink.clock.advance(LENT_SEND_INTERVAL_MS);
        sink.tick();

        assert_eq!(sink.transport.sent_to(from).len(), sent_after_borrow + 1);
    }

    #[test]
    fn get_returns_false_when_not_lent() {
        let mut sink = new_engine();
        let mut out = [0u8; 6];
        assert!(!sink.get(&mut out));
    }

    #[test]
    fn get_paces_dequeues_by_frame_duration() {
        let mut sink = new_engine();
        let from = source_endpoint(9001);
        let mut b = MessageBuilder::new();
        sink.transport.push_incoming(b.build_borrow(20, 4), from);
        sink.tick();

        for idx in 0..3u8 {
            let frame = [idx; 6];
            let mut b = MessageBuilder::new();
            sink.transport.push_incoming(b.build_enqueue(idx, &frame), from);
            sink.tick();
        }

        let mut out = [0u8; 6];
        assert!(sink.get(&mut out));
        assert_eq!(out, [0u8; 6]);

        sink.clock.advance(21);
        assert!(sink.get(&mut out));
        assert_eq!(out, [1u8; 6]);

        sink.clock.advance(21);
        assert!(sink.get(&mut out));
        assert_eq!(out, [2u8; 6]);
    }

    #[test]
    fn bounded_diff_matches_spec_identity() {
        for a in 0u8..=255 {
            for b in (0u8..=255).step_by(37) {
                let fwd = bounded_diff(a, b, 256);
                let back = bounded_diff(b, a, 256);
                assert!(fwd + back == 0 || fwd + back == 256);
            }
        }
    }
}

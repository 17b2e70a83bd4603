//! Connection handshake and send-side pacing for the producer peer
//! (`spec.md` §4.5).
//!
//! A [`SourceEngine`] owns one UDP socket pointed at a sink and models the
//! sink's expected dequeue rate so [`SourceEngine::put`] can pace outgoing
//! `ENQUEUE` frames without the sink ever telling it how full its queue is.
//! The only suspension point anywhere in this workspace is `put`'s pacing
//! sleep (`spec.md` §5).

use std::time::Duration;

use bytes::Bytes;
use lumen_net::{Endpoint, RecvOutcome, SendOutcome, Transport, UdpTransport};
use lumen_proto::{
    elapsed_ms, Clock, ErrorCode, MessageBuilder, MessageIter, MessageKind, ParseError,
    SystemClock,
};
use tracing::{debug, trace, warn};

/// Default value of [`SourceConfig`]'s `max_buffered_frames` (`spec.md` §4.5).
pub const DEFAULT_MAX_BUFFERED_FRAMES: u8 = 16;

/// Default `retry_timeout_ms`: how long to wait for a `LENT` before
/// re-emitting `BORROW` while still [`SourceState::Waiting`].
pub const DEFAULT_RETRY_TIMEOUT_MS: u32 = 100;

/// Default `disconnect_timeout_ms`: silence past this, in either `Waiting`
/// or `Open`, is treated as an unrecoverable local failure.
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u32 = 750;

/// Poll interval used by the blocking [`SourceEngine::connect`] constructor
/// while it waits to leave [`SourceState::Waiting`]. Carried over from the
/// reference implementation's `blocking_make_refresh_interval`.
pub const BLOCKING_CONNECT_POLL_MS: u32 = 5;

/// Constructor and runtime failures. Unlike the state machine's protocol
/// errors (which move the engine into [`SourceState::Error`] rather than
/// ever returning an `Err` from `tick`), these can only happen when there is
/// no valid engine to return.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to bind source transport: {0}")]
    Transport(#[from] lumen_net::TransportError),
}

/// Connection status (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Waiting for the first `LENT` in response to a `BORROW`.
    Waiting,
    /// Reserved; frames may be streamed via [`SourceEngine::put`].
    Open,
    /// Terminal. All further calls are no-ops except state/message queries.
    Error,
}

/// Construction parameters for a [`SourceEngine`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    host: String,
    port: u16,
    frame_duration_ms: u8,
    max_buffered_frames: u8,
    retry_timeout_ms: u32,
    disconnect_timeout_ms: u32,
}

/// Builds a [`SourceConfig`], defaulting the pacing and timeout knobs to
/// `spec.md` §4.5's documented defaults.
pub struct SourceConfigBuilder {
    host: String,
    port: u16,
    frame_duration_ms: u8,
    max_buffered_frames: u8,
    retry_timeout_ms: u32,
    disconnect_timeout_ms: u32,
}

impl SourceConfigBuilder {
    fn new(host: impl Into<String>, port: u16, frame_duration_ms: u8) -> Self {
        Self {
            host: host.into(),
            port,
            frame_duration_ms,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
            retry_timeout_ms: DEFAULT_RETRY_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
        }
    }

    pub fn max_buffered_frames(mut self, frames: u8) -> Self {
        self.max_buffered_frames = frames;
        self
    }

    pub fn retry_timeout_ms(mut self, ms: u32) -> Self {
        self.retry_timeout_ms = ms;
        self
    }

    pub fn disconnect_timeout_ms(mut self, ms: u32) -> Self {
        self.disconnect_timeout_ms = ms;
        self
    }

    pub fn build(self) -> SourceConfig {
        SourceConfig {
            host: self.host,
            port: self.port,
            frame_duration_ms: self.frame_duration_ms,
            max_buffered_frames: self.max_buffered_frames,
            retry_timeout_ms: self.retry_timeout_ms,
            disconnect_timeout_ms: self.disconnect_timeout_ms,
        }
    }
}

/// The producer peer: handshake retries, lost-connection detection, and the
/// send-side pacing model for `put`.
pub struct SourceEngine<T: Transport = UdpTransport, C: Clock = SystemClock> {
    transport: T,
    clock: C,
    builder: MessageBuilder,
    recv_buf: Vec<u8>,

    state: SourceState,
    error_message: Option<String>,

    frame_duration_ms: u8,
    max_buffered_frames: u8,
    retry_timeout_ms: u32,
    disconnect_timeout_ms: u32,

    next_frame_idx: u8,
    first_borrow_time: u32,
    last_borrow_time: u32,
    last_frame_time: Option<u32>,
    last_lent_time: u32,
}

impl SourceEngine<UdpTransport, SystemClock> {
    /// Starts building a [`SourceConfig`] for `host`/`port`/`frame_duration_ms`.
    pub fn builder(
        host: impl Into<String>,
        port: u16,
        frame_duration_ms: u8,
    ) -> SourceConfigBuilder {
        SourceConfigBuilder::new(host, port, frame_duration_ms)
    }

    /// Binds a socket, resolves the sink, emits the first `BORROW`, and
    /// returns immediately in [`SourceState::Waiting`] (`async_make = true`
    /// in `spec.md` §4.5's terms).
    pub fn connect_async(config: SourceConfig) -> Result<Self, SourceError> {
        let transport = UdpTransport::bind_any()?;
        Self::with_transport_and_clock(config, transport, SystemClock::new())
    }

    /// As [`Self::connect_async`], but blocks — looping `tick` + a 5ms sleep
    /// — until the engine leaves [`SourceState::Waiting`]
    /// (`async_make = false` in `spec.md` §4.5's terms).
    pub fn connect(config: SourceConfig) -> Result<Self, SourceError> {
        let mut engine = Self::connect_async(config)?;
        while engine.state() == SourceState::Waiting {
            engine.tick();
            std::thread::sleep(Duration::from_millis(BLOCKING_CONNECT_POLL_MS as u64));
        }
        Ok(engine)
    }
}

impl<T: Transport, C: Clock> SourceEngine<T, C> {
    /// Builds an engine over an already-bound transport and an arbitrary
    /// clock — the seam integration tests use to substitute a fake clock and
    /// a fake transport for deterministic timing.
    pub fn with_transport_and_clock(
        config: SourceConfig,
        transport: T,
        clock: C,
    ) -> Result<Self, SourceError> {
        let mut engine = Self {
            transport,
            clock,
            builder: MessageBuilder::new(),
            recv_buf: vec![0u8; 16],

            state: SourceState::Waiting,
            error_message: None,

            frame_duration_ms: config.frame_duration_ms,
            max_buffered_frames: config.max_buffered_frames,
            retry_timeout_ms: config.retry_timeout_ms,
            disconnect_timeout_ms: config.disconnect_timeout_ms,

            next_frame_idx: 0,
            first_borrow_time: 0,
            last_borrow_time: 0,
            last_frame_time: None,
            last_lent_time: 0,
        };

        match engine.transport.resolve_and_connect(&config.host, config.port) {
            Ok(_) => {}
            Err(e) => {
                return Err(SourceError::Transport(e));
            }
        }

        let now = engine.clock.now_ms();
        engine.first_borrow_time = now;
        engine.last_borrow_time = now;
        engine.send_borrow();
        Ok(engine)
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// The human-readable message recorded alongside [`SourceState::Error`],
    /// if any (`spec.md` §7).
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn next_msg_id(&self) -> u16 {
        self.builder.next_msg_id()
    }

    /// The frame index the next [`Self::put`] will send.
    pub fn next_frame_idx(&self) -> u8 {
        self.next_frame_idx
    }

    pub fn frame_duration_ms(&self) -> u8 {
        self.frame_duration_ms
    }

    /// Non-blocking recv-drain followed by the handshake-retry/timeout and
    /// lost-connection checks appropriate to the current state.
    ///
    /// No-op once [`SourceState::Error`] is reached.
    pub fn tick(&mut self) {
        if self.state == SourceState::Error {
            return;
        }

        match self.transport.recv_from(&mut self.recv_buf) {
            RecvOutcome::Received(n, _from) => self.handle_datagram(n),
            RecvOutcome::WouldBlock => {}
            RecvOutcome::Fatal => {
                self.fail("transport failed fatally");
                return;
            }
        }

        match self.state {
            SourceState::Waiting => self.check_handshake_timers(),
            SourceState::Open => self.check_lost_connection(),
            SourceState::Error => {}
        }
    }

    fn handle_datagram(&mut self, n: usize) {
        let datagram = Bytes::copy_from_slice(&self.recv_buf[..n]);
        for parsed in MessageIter::new(&datagram) {
            match parsed {
                Ok(msg) => self.handle_message(msg.kind),
                Err(ParseError::UnknownTag { tag, .. }) => {
                    warn!(tag, "malformed message from sink");
                    self.fail("malformed message");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "malformed datagram framing from sink");
                    self.fail("malformed message");
                    return;
                }
            }
        }
    }

    fn handle_message(&mut self, kind: MessageKind<'_>) {
        if self.state == SourceState::Error {
            return;
        }
        match kind {
            MessageKind::Lent => self.handle_lent(),
            MessageKind::Fail { error_code, .. } => {
                let code = ErrorCode::from(error_code);
                warn!(%code, "sink reported failure");
                self.fail(&fail_message(code));
            }
            MessageKind::Borrow { .. } | MessageKind::Enqueue { .. } => {
                warn!("source does not accept this message type");
                self.fail("malformed message");
            }
        }
    }

    fn handle_lent(&mut self) {
        let now = self.clock.now_ms();
        match self.state {
            SourceState::Waiting => {
                debug!("borrowed, handshake complete");
                self.state = SourceState::Open;
                self.last_lent_time = now;
                self.last_frame_time = None;
            }
            SourceState::Open => {
                self.last_lent_time = now;
            }
            SourceState::Error => {}
        }
    }

    fn check_handshake_timers(&mut self) {
        let now = self.clock.now_ms();
        if elapsed_ms(self.first_borrow_time, now) > self.disconnect_timeout_ms {
            self.fail("borrow timed out");
            return;
        }
        if elapsed_ms(self.last_borrow_time, now) > self.retry_timeout_ms {
            self.send_borrow();
            self.last_borrow_time = now;
        }
    }

    fn check_lost_connection(&mut self) {
        let now = self.clock.now_ms();
        if elapsed_ms(self.last_lent_time, now) >= self.disconnect_timeout_ms {
            self.fail("connection lost");
        }
    }

    fn fail(&mut self, message: &str) {
        warn!(error_message = message, "source entering error state");
        self.state = SourceState::Error;
        self.error_message = Some(message.to_string());
    }

    fn send_borrow(&mut self) {
        let bytes = self
            .builder
            .build_borrow(self.frame_duration_ms, self.max_buffered_frames);
        send_best_effort(&mut self.transport, bytes);
    }

    /// Milliseconds remaining (saturating at 0) before the modeled remote
    /// queue has room for another frame. `0` when not [`SourceState::Open`]
    /// is represented as `-1` by [`Self::put_ready_timeout`] instead — see
    /// that method.
    fn queue_would_accept_now(&self) -> bool {
        self.put_ready_count() > 0
    }

    /// `⌊(now − last_frame_time) / frame_duration_ms⌋`, clamped to 0 when
    /// not [`SourceState::Open`]; equals `max_buffered_frames` before the
    /// first successful `put` (`spec.md` §4.5 — the queue is assumed empty
    /// at handshake).
    pub fn put_ready_count(&self) -> u32 {
        if self.state != SourceState::Open {
            return 0;
        }
        match self.last_frame_time {
            None => self.max_buffered_frames as u32,
            Some(last) => {
                let elapsed = elapsed_ms(last, self.clock.now_ms());
                elapsed / self.frame_duration_ms.max(1) as u32
            }
        }
    }

    /// `0` when [`Self::put_ready_count`] is already positive, `-1` when not
    /// [`SourceState::Open`], otherwise the milliseconds remaining until the
    /// next slot opens (`spec.md` §4.5).
    pub fn put_ready_timeout(&self) -> i64 {
        if self.state != SourceState::Open {
            return -1;
        }
        if self.queue_would_accept_now() {
            return 0;
        }
        let last = self.last_frame_time.unwrap_or_else(|| self.clock.now_ms());
        let target = last.wrapping_add(self.frame_duration_ms as u32);
        elapsed_ms(self.clock.now_ms(), target) as i64
    }

    /// Paces (sleeping if needed) and sends one `ENQUEUE` carrying `frame`.
    /// Only valid while [`SourceState::Open`]; returns `false` without
    /// sending otherwise. `frame` must be at most `65532` bytes.
    pub fn put(&mut self, frame: &[u8]) -> bool {
        if self.state != SourceState::Open {
            return false;
        }

        let timeout = self.put_ready_timeout();
        if timeout > 0 {
            std::thread::sleep(Duration::from_millis(timeout as u64));
        }

        let idx = self.next_frame_idx;
        let bytes = self.builder.build_enqueue(idx, frame);
        match send_best_effort_outcome(&mut self.transport, bytes) {
            SendOutcome::Sent(_) | SendOutcome::WouldBlock => {}
            SendOutcome::NoPeer | SendOutcome::Fatal => {
                trace!("put failed to send, frame dropped per never-retry policy");
                return false;
            }
        }

        self.next_frame_idx = self.next_frame_idx.wrapping_add(1);
        let now = self.clock.now_ms();
        self.last_frame_time = Some(match self.last_frame_time {
            None => {
                let lookback =
                    (self.max_buffered_frames.saturating_sub(1)) as u32 * self.frame_duration_ms as u32;
                now.wrapping_sub(lookback)
            }
            Some(last) => last.wrapping_add(self.frame_duration_ms as u32),
        });

        trace!(idx, "put sent one frame");
        true
    }
}

/// Maps a wire [`ErrorCode`] to the human-readable message the reference
/// implementation's `source_iterate_recv_buf` attaches to each `FAIL`
/// (`spec.md` §6.4, §7).
fn fail_message(code: ErrorCode) -> String {
    match code {
        ErrorCode::NotBorrowed => "the sink says we are not borrowing it".to_string(),
        ErrorCode::RequestedBufferTooLarge => "requested buffer size is too large".to_string(),
        ErrorCode::RequestedFrameDurationTooShort => {
            "requested frame duration is too short".to_string()
        }
        ErrorCode::LentToOtherSource => "the sink is lent to another source".to_string(),
        ErrorCode::BadMsg => "the sink reported a malformed message".to_string(),
        ErrorCode::Timeout => "the sink timed us out".to_string(),
        ErrorCode::Unrecognized(_) => {
            "the sink signalled an unrecoverable error state".to_string()
        }
    }
}

fn send_best_effort(transport: &mut impl Transport, bytes: &[u8]) {
    let _ = send_best_effort_outcome(transport, bytes);
}

fn send_best_effort_outcome(transport: &mut impl Transport, bytes: &[u8]) -> SendOutcome {
    let outcome = transport.send(bytes);
    if matches!(outcome, SendOutcome::Fatal) {
        trace!("send failed, ignoring per never-retry policy");
    }
    outcome
}

//! Connection state machine for one compile request.
//!
//! A connection moves strictly forward through its phases:
//!
//! ```text
//! AwaitingHeader -> AwaitingPayload -> Compiling -> SendingResponse -> Closing
//! ```
//!
//! Any phase may jump straight to `Closing`. The machine is generic over the
//! stream so the reactor can drive it with a mio socket while tests drive it
//! with scripted byte deliveries. Handlers drain the stream until it reports
//! `WouldBlock`, which is what edge-triggered readiness requires.

use crate::backend::{Artifact, CompileError, CompileStage};
use crate::protocol::{self, Header, ProtocolError, ShaderKind, HEADER_LEN};
use bytes::Bytes;
use slab::Slab;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Current phase of a connection. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    AwaitingHeader,
    AwaitingPayload,
    Compiling,
    SendingResponse,
    Closing,
}

/// Why a connection reached `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Response fully flushed.
    Completed,
    /// Header failed validation.
    Protocol(ProtocolError),
    /// Peer closed before the exchange finished.
    PeerClosed,
    /// Socket read or write failed.
    Io(io::ErrorKind),
    /// Backend rejected the source.
    CompileFailed(CompileStage),
    /// A buffer could not be allocated.
    Resource,
    /// No I/O progress within the idle timeout.
    IdleTimeout,
    /// Multiplexer reported an error or hangup.
    Hangup,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Completed => f.write_str("completed"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {e}"),
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Io(kind) => write!(f, "i/o error: {kind}"),
            CloseReason::CompileFailed(stage) => write!(f, "compile failed at {stage}"),
            CloseReason::Resource => f.write_str("allocation failed"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Hangup => f.write_str("hangup"),
        }
    }
}

/// What the reactor has to do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Waiting for more readiness; nothing to do.
    Pending,
    /// Payload just completed; the source must be compiled.
    Compile,
    /// A response is ready; write interest must be registered.
    Send,
    /// Connection reached `Closing` and must be released.
    Closed,
}

/// Outcome of a single non-blocking read.
enum Step {
    /// Bytes were consumed; keep draining.
    Continue,
    /// The stream has nothing more right now.
    Blocked,
    /// The payload is complete.
    Complete,
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    phase: Phase,
    header_buf: [u8; HEADER_LEN],
    header_filled: usize,
    kind: Option<ShaderKind>,
    payload: Vec<u8>,
    received: usize,
    response: Bytes,
    sent: usize,
    /// Reason recorded once the response is flushed.
    flush_reason: CloseReason,
    close_reason: Option<CloseReason>,
    last_activity: Instant,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection awaiting its header.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            phase: Phase::AwaitingHeader,
            header_buf: [0u8; HEADER_LEN],
            header_filled: 0,
            kind: None,
            payload: Vec::new(),
            received: 0,
            response: Bytes::new(),
            sent: 0,
            flush_reason: CloseReason::Completed,
            close_reason: None,
            last_activity: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn kind(&self) -> Option<ShaderKind> {
        self.kind
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn bytes_received(&self) -> usize {
        self.received
    }

    pub fn bytes_sent(&self) -> usize {
        self.sent
    }

    #[cfg(test)]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Handle read readiness.
    ///
    /// Returns `Progress::Compile` exactly once, on the transition into
    /// `Compiling`.
    pub fn on_readable(&mut self) -> Progress {
        loop {
            let step = match self.phase {
                Phase::AwaitingHeader => self.read_header(),
                Phase::AwaitingPayload => self.read_payload(),
                Phase::Closing => return Progress::Closed,
                Phase::Compiling | Phase::SendingResponse => return Progress::Pending,
            };

            match step {
                Ok(Step::Continue) => continue,
                Ok(Step::Blocked) => return Progress::Pending,
                Ok(Step::Complete) => return Progress::Compile,
                Err(reason) => {
                    self.close(reason);
                    return Progress::Closed;
                }
            }
        }
    }

    fn read_header(&mut self) -> Result<Step, CloseReason> {
        // Never read past the header: payload bytes stay in the socket until
        // the header has been validated.
        let n = match read_some(&mut self.stream, &mut self.header_buf[self.header_filled..])? {
            Some(n) => n,
            None => return Ok(Step::Blocked),
        };
        self.last_activity = Instant::now();
        self.header_filled += n;

        if self.header_filled == HEADER_LEN {
            let header = protocol::decode_header(&self.header_buf).map_err(CloseReason::Protocol)?;
            self.begin_payload(header)?;
        }
        Ok(Step::Continue)
    }

    fn begin_payload(&mut self, header: Header) -> Result<(), CloseReason> {
        let len = header.payload_len as usize;
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(len)
            .map_err(|_| CloseReason::Resource)?;
        payload.resize(len, 0);

        self.payload = payload;
        self.kind = Some(header.kind);
        self.advance(Phase::AwaitingPayload);
        Ok(())
    }

    fn read_payload(&mut self) -> Result<Step, CloseReason> {
        let n = match read_some(&mut self.stream, &mut self.payload[self.received..])? {
            Some(n) => n,
            None => return Ok(Step::Blocked),
        };
        self.last_activity = Instant::now();
        self.received += n;

        if self.received == self.payload.len() {
            self.advance(Phase::Compiling);
            return Ok(Step::Complete);
        }
        Ok(Step::Continue)
    }

    /// Move the received source out for compilation on another thread.
    ///
    /// Returns `None` unless the connection is `Compiling` with its source
    /// still in place.
    pub fn take_source(&mut self) -> Option<(ShaderKind, Vec<u8>)> {
        if self.phase != Phase::Compiling || self.payload.is_empty() {
            return None;
        }
        let kind = self.kind?;
        Some((kind, std::mem::take(&mut self.payload)))
    }

    /// Apply a compile result and prepare the response.
    ///
    /// A failure closes the connection without a response unless
    /// `failure_sentinel` is set, in which case a zero-length response is
    /// sent first.
    pub fn finish_compile(
        &mut self,
        result: Result<Artifact, CompileError>,
        failure_sentinel: bool,
    ) -> Progress {
        if self.phase != Phase::Compiling {
            return self.idle_progress();
        }
        self.payload = Vec::new();

        let stage = match result {
            Ok(artifact) if !artifact.bytes.is_empty() => {
                return match protocol::encode_response(&artifact.bytes) {
                    Ok(response) => self.begin_send(response, CloseReason::Completed),
                    Err(_) => {
                        self.close(CloseReason::Resource);
                        Progress::Closed
                    }
                };
            }
            Ok(_) => CompileStage::Emit,
            Err(e) => e.stage,
        };

        if failure_sentinel {
            self.begin_send(protocol::failure_response(), CloseReason::CompileFailed(stage))
        } else {
            self.close(CloseReason::CompileFailed(stage));
            Progress::Closed
        }
    }

    fn begin_send(&mut self, response: Bytes, reason: CloseReason) -> Progress {
        self.response = response;
        self.sent = 0;
        self.flush_reason = reason;
        self.last_activity = Instant::now();
        self.advance(Phase::SendingResponse);
        Progress::Send
    }

    /// Handle write readiness: flush as much of the response as the socket
    /// accepts. The connection closes once the last byte is written.
    pub fn on_writable(&mut self) -> Progress {
        if self.phase != Phase::SendingResponse {
            return self.idle_progress();
        }

        while self.sent < self.response.len() {
            match self.stream.write(&self.response[self.sent..]) {
                Ok(0) => {
                    self.close(CloseReason::Io(io::ErrorKind::WriteZero));
                    return Progress::Closed;
                }
                Ok(n) => {
                    self.sent += n;
                    self.last_activity = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::Pending,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(CloseReason::Io(e.kind()));
                    return Progress::Closed;
                }
            }
        }

        let _ = self.stream.flush();
        self.close(self.flush_reason);
        Progress::Closed
    }

    /// Deadline after which this connection counts as idle.
    ///
    /// `None` while compiling (the wait is on the backend, not the peer),
    /// once closing, and when the timeout lies beyond what `Instant` can
    /// represent.
    pub fn idle_deadline(&self, timeout: Duration) -> Option<Instant> {
        match self.phase {
            Phase::Compiling | Phase::Closing => None,
            _ => self.last_activity.checked_add(timeout),
        }
    }

    /// Force the connection into `Closing`. The first recorded reason wins.
    pub fn close(&mut self, reason: CloseReason) {
        if self.phase == Phase::Closing {
            return;
        }
        self.phase = Phase::Closing;
        self.close_reason = Some(reason);
        self.payload = Vec::new();
        self.response = Bytes::new();
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "phase moved from {:?} to {:?}", self.phase, next);
        self.phase = next;
    }

    fn idle_progress(&self) -> Progress {
        if self.phase == Phase::Closing {
            Progress::Closed
        } else {
            Progress::Pending
        }
    }
}

/// Non-blocking read: `Ok(None)` when nothing is available right now.
fn read_some<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<Option<usize>, CloseReason> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Err(CloseReason::PeerClosed),
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CloseReason::Io(e.kind())),
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slab keys double as
/// poll tokens.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: Option<usize>,
}

impl<T> ConnectionRegistry<T> {
    /// Create a registry; `None` means no cap beyond descriptor limits.
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.unwrap_or(1024).min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection.
    ///
    /// Returns the entry back if the registry is at capacity.
    pub fn insert(&mut self, conn: T) -> Result<usize, T> {
        if self.is_full() {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn is_full(&self) -> bool {
        self.max_connections
            .is_some_and(|max| self.connections.len() >= max)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.connections.try_remove(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.connections.iter_mut()
    }
}

//! Relay endpoint: one side of a relayed connection
//!
//! An [`Endpoint`] owns its descriptor exclusively and buffers traffic in
//! two segment queues: inbound (bytes read off the socket, waiting for the
//! caller) and outbound (bytes queued by the caller, waiting for the socket
//! to accept them). The outbound queue carries an optional high watermark:
//! a byte ceiling on queued-but-unsent data that the relay copy uses for
//! backpressure.
//!
//! Endpoints are created only through relay establishment
//! ([`crate::relay::prepare_relay`]) and are mutated only on the event-loop
//! thread. Dropping the endpoint is the single point where the descriptor
//! is released.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use bytes::Bytes;
use socket2::Socket;
use thiserror::Error;

/// How many bytes one readable event may pull per `recv` call
const READ_CHUNK: usize = 16 * 1024;

/// Connection lifecycle state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Connect issued, waiting for first-writable
    Connecting,
    /// Connection established, relaying
    Connected,
    /// A fatal fault was observed; only close is meaningful now
    Failed,
    /// Closed by the caller
    Closed,
}

/// Rejected enqueue: the endpoint can no longer accept outbound data
#[derive(Debug, Clone, Copy, Error)]
#[error("endpoint is not writable in state {state:?}")]
pub struct EnqueueError {
    pub state: EndpointState,
}

/// A queue of byte segments in their native (non-contiguous) form.
///
/// Segments are cheaply reference-counted [`Bytes`]; iterating them avoids
/// the flat intermediate copy a contiguous buffer would force.
#[derive(Debug, Default)]
pub struct RelayBuffer {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl RelayBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total queued bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a segment; empty segments are dropped
    pub fn push_segment(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    /// Iterate the queued segments front to back
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    pub(crate) fn front(&self) -> Option<&Bytes> {
        self.segments.front()
    }

    /// Drop up to `n` bytes from the front of the queue, returning how many
    /// were actually dropped.
    pub fn consume(&mut self, mut n: usize) -> usize {
        let mut consumed = 0;
        while n > 0 {
            let Some(seg) = self.segments.pop_front() else {
                break;
            };
            if seg.len() <= n {
                n -= seg.len();
                consumed += seg.len();
                self.len -= seg.len();
            } else {
                self.segments.push_front(seg.slice(n..));
                consumed += n;
                self.len -= n;
                n = 0;
            }
        }
        consumed
    }

    /// Remove and return the front segment
    pub fn pop_segment(&mut self) -> Option<Bytes> {
        let seg = self.segments.pop_front()?;
        self.len -= seg.len();
        Some(seg)
    }
}

/// Result of pumping the socket into the inbound queue
#[derive(Debug, Default)]
pub(crate) struct FillOutcome {
    pub gained: usize,
    pub eof: bool,
    pub error: Option<io::Error>,
}

/// Result of pumping the outbound queue into the socket
#[derive(Debug, Default)]
pub(crate) struct FlushOutcome {
    pub flushed: usize,
    pub error: Option<io::Error>,
}

/// One side of a relayed connection.
///
/// See the module docs for the ownership and threading rules.
#[derive(Debug)]
pub struct Endpoint {
    socket: Socket,
    peer: Option<SocketAddr>,
    state: EndpointState,
    inbound: RelayBuffer,
    outbound: RelayBuffer,
    write_high_watermark: Option<usize>,
    connect_deadline: Option<Instant>,
    eof_delivered: bool,
}

impl Endpoint {
    pub(crate) fn new(socket: Socket) -> Self {
        Self {
            socket,
            peer: None,
            state: EndpointState::Connecting,
            inbound: RelayBuffer::new(),
            outbound: RelayBuffer::new(),
            write_high_watermark: None,
            connect_deadline: None,
            eof_delivered: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> EndpointState {
        self.state
    }

    /// Destination this endpoint was pointed at, if connect was issued
    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bytes buffered inbound (read off the socket, not yet consumed)
    #[must_use]
    pub fn queued_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Bytes buffered outbound (queued but not yet accepted by the socket)
    #[must_use]
    pub fn queued_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Ceiling on queued-but-unsent outbound bytes; `None` means unbounded
    #[must_use]
    pub const fn write_high_watermark(&self) -> Option<usize> {
        self.write_high_watermark
    }

    pub fn set_write_high_watermark(&mut self, watermark: Option<usize>) {
        self.write_high_watermark = watermark;
    }

    /// View of the inbound segment queue
    #[must_use]
    pub const fn inbound(&self) -> &RelayBuffer {
        &self.inbound
    }

    /// Drop up to `n` consumed bytes from the inbound queue
    pub fn drain_inbound(&mut self, n: usize) -> usize {
        self.inbound.consume(n)
    }

    /// Remove and return the front inbound segment
    pub fn pop_inbound_segment(&mut self) -> Option<Bytes> {
        self.inbound.pop_segment()
    }

    /// Queue bytes for transmission.
    ///
    /// The watermark does not bound direct enqueues; it caps only what the
    /// relay copy transfers. Flushing happens on the endpoint's next
    /// writable readiness.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] once the endpoint has failed or been closed.
    pub fn enqueue_outbound(&mut self, data: Bytes) -> Result<(), EnqueueError> {
        match self.state {
            EndpointState::Connecting | EndpointState::Connected => {
                self.outbound.push_segment(data);
                Ok(())
            }
            EndpointState::Failed | EndpointState::Closed => {
                Err(EnqueueError { state: self.state })
            }
        }
    }

    pub(crate) const fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn set_state(&mut self, state: EndpointState) {
        self.state = state;
    }

    pub(crate) fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub(crate) const fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    pub(crate) fn set_connect_deadline(&mut self, deadline: Option<Instant>) {
        self.connect_deadline = deadline;
    }

    pub(crate) fn eof_delivered(&self) -> bool {
        self.eof_delivered
    }

    pub(crate) fn mark_eof_delivered(&mut self) {
        self.eof_delivered = true;
    }

    /// `SO_ERROR` as a plain errno, 0 when the query itself fails
    pub(crate) fn pending_errno(&self) -> i32 {
        match self.socket.take_error() {
            Ok(Some(e)) => e.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// Read everything currently available into the inbound queue.
    ///
    /// Loops until `EAGAIN` (required under edge-triggered readiness), EOF,
    /// or a read fault.
    pub(crate) fn fill_inbound(&mut self) -> FillOutcome {
        let fd = self.socket.as_raw_fd();
        let mut buf = [0u8; READ_CHUNK];
        let mut outcome = FillOutcome::default();

        loop {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len(), 0) };
            if n > 0 {
                #[allow(clippy::cast_sign_loss)] // n is positive here
                let n = n as usize;
                self.inbound.push_segment(Bytes::copy_from_slice(&buf[..n]));
                outcome.gained += n;
                continue;
            }
            if n == 0 {
                outcome.eof = true;
                return outcome;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return outcome,
                io::ErrorKind::Interrupted => {}
                _ => {
                    outcome.error = Some(err);
                    return outcome;
                }
            }
        }
    }

    /// Write as much queued outbound data as the socket will take.
    pub(crate) fn flush_outbound(&mut self) -> FlushOutcome {
        let fd = self.socket.as_raw_fd();
        let mut outcome = FlushOutcome::default();

        loop {
            let (ptr, len) = match self.outbound.front() {
                Some(seg) => (seg.as_ptr(), seg.len()),
                None => return outcome,
            };
            let n = unsafe { libc::send(fd, ptr.cast::<libc::c_void>(), len, libc::MSG_NOSIGNAL) };
            if n >= 0 {
                #[allow(clippy::cast_sign_loss)] // n is non-negative here
                let n = n as usize;
                self.outbound.consume(n);
                outcome.flushed += n;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return outcome,
                io::ErrorKind::Interrupted => {}
                _ => {
                    outcome.error = Some(err);
                    return outcome;
                }
            }
        }
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

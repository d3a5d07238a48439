//! Single-threaded readiness dispatch loop
//!
//! One [`EventLoop`] per thread owns every endpoint registered with it. All
//! descriptors are non-blocking; "waiting" means a callback returns and the
//! loop resumes it when the kernel next reports readiness. Callbacks for a
//! single endpoint fire in the order the loop observes readiness for it; no
//! ordering is guaranteed across endpoints.
//!
//! On readable readiness the loop pumps the socket into the endpoint's
//! inbound queue before firing `on_readable`; on writable readiness it
//! drains the outbound queue before firing `on_writable`. Faults observed
//! while pumping are delivered through `on_error`; after that fires,
//! tearing the endpoint down is the caller's job.
//!
//! Closing an endpoint is the sole cancellation primitive: it deregisters
//! the descriptor and drops it exactly once. A retained [`EndpointId`] for
//! a closed endpoint makes every later operation a safe no-op.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::Socket;
use tracing::{debug, trace};

use crate::copy::{relay_copy, RelayCopyResult};
use crate::endpoint::{Endpoint, EndpointState, EnqueueError};
use crate::error::{EndpointError, RelayError};

/// Handle to an endpoint owned by an [`EventLoop`].
///
/// Ids are never reused, so a handle kept past `close` simply stops
/// resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(usize);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint#{}", self.0)
    }
}

/// Callback invoked when new inbound bytes arrived
pub type ReadableFn = Box<dyn FnMut(&mut EventLoop, EndpointId)>;
/// Callback invoked on connect completion and whenever the outbound queue
/// fully drains
pub type WritableFn = Box<dyn FnMut(&mut EventLoop, EndpointId)>;
/// Callback invoked on a runtime fault; teardown is then the caller's job
pub type ErrorFn = Box<dyn FnMut(&mut EventLoop, EndpointId, EndpointError)>;

/// The callback triple a caller wires onto an endpoint at prepare time
pub struct EndpointCallbacks {
    pub on_readable: ReadableFn,
    pub on_writable: WritableFn,
    pub on_error: ErrorFn,
}

impl EndpointCallbacks {
    pub fn new(on_readable: ReadableFn, on_writable: WritableFn, on_error: ErrorFn) -> Self {
        Self {
            on_readable,
            on_writable,
            on_error,
        }
    }

    /// Callbacks that ignore every event; useful for tests and probes
    #[must_use]
    pub fn sink() -> Self {
        Self {
            on_readable: Box::new(|_, _| {}),
            on_writable: Box::new(|_, _| {}),
            on_error: Box::new(|_, _, _| {}),
        }
    }
}

impl std::fmt::Debug for EndpointCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCallbacks").finish_non_exhaustive()
    }
}

/// Shared, registration-only view of the loop's readiness registry.
///
/// Cloneable and process-wide; it carries no endpoint state and performs no
/// internal mutation beyond kernel-side registration.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    registry: Arc<Registry>,
}

impl DispatchHandle {
    /// Register a descriptor for the given readiness interest
    ///
    /// # Errors
    ///
    /// Propagates the registry error.
    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.registry.register(&mut SourceFd(&fd), token, interest)
    }

    /// Change a registered descriptor's readiness interest
    ///
    /// # Errors
    ///
    /// Propagates the registry error.
    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.registry.reregister(&mut SourceFd(&fd), token, interest)
    }

    /// Remove a descriptor from the registry
    ///
    /// # Errors
    ///
    /// Propagates the registry error.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }
}

struct Slot {
    endpoint: Endpoint,
    callbacks: Option<EndpointCallbacks>,
}

/// Flattened readiness event, decoupled from the poll buffer
#[derive(Debug, Clone, Copy)]
struct Polled {
    index: usize,
    readable: bool,
    writable: bool,
    faulted: bool,
}

/// The single-threaded readiness loop that owns all relay endpoints
pub struct EventLoop {
    poll: Poll,
    events: Events,
    handle: DispatchHandle,
    slots: HashMap<usize, Slot>,
    next_token: usize,
    pending_errors: VecDeque<(EndpointId, EndpointError)>,
}

impl EventLoop {
    /// Create a new loop with its own poll instance.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the poller cannot be created.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            handle: DispatchHandle {
                registry: Arc::new(registry),
            },
            slots: HashMap::new(),
            next_token: 0,
            pending_errors: VecDeque::new(),
        })
    }

    /// The shared registration handle
    #[must_use]
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Number of live endpoints
    #[must_use]
    pub fn active_endpoints(&self) -> usize {
        self.slots.len()
    }

    /// Borrow an endpoint; `None` once it was closed
    #[must_use]
    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.slots.get(&id.0).map(|slot| &slot.endpoint)
    }

    /// Mutably borrow an endpoint; `None` once it was closed
    pub fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.slots.get_mut(&id.0).map(|slot| &mut slot.endpoint)
    }

    /// Replace an endpoint's callback triple, returning the previous one.
    /// `None` if the endpoint was closed.
    pub fn set_callbacks(
        &mut self,
        id: EndpointId,
        callbacks: EndpointCallbacks,
    ) -> Option<EndpointCallbacks> {
        let slot = self.slots.get_mut(&id.0)?;
        slot.callbacks.replace(callbacks)
    }

    /// Close an endpoint: deregister the descriptor, release it, and make
    /// the id permanently stale. Safe to call with a stale id.
    pub fn close(&mut self, id: EndpointId) -> bool {
        let Some(mut slot) = self.slots.remove(&id.0) else {
            return false;
        };
        let fd = slot.endpoint.as_raw_fd();
        if let Err(e) = self.handle.deregister(fd) {
            debug!("deregister of {} failed: {}", id, e);
        }
        slot.endpoint.set_state(EndpointState::Closed);
        trace!("{} closed", id);
        // the descriptor is released exactly once, when the endpoint drops
        true
    }

    /// Register a fully configured socket as a new endpoint, armed for
    /// write readiness (the connect-completion signal).
    ///
    /// Construction is all-or-nothing: on any failure the socket is dropped
    /// (closing the descriptor) and no endpoint exists.
    pub(crate) fn install(
        &mut self,
        socket: Socket,
        write_high_watermark: Option<usize>,
        callbacks: EndpointCallbacks,
    ) -> Result<EndpointId, RelayError> {
        let index = self.next_token;
        let fd = socket.as_raw_fd();

        self.handle
            .register(fd, Token(index), Interest::WRITABLE)
            .map_err(|e| RelayError::Registration(e.to_string()))?;
        self.next_token += 1;

        let mut endpoint = Endpoint::new(socket);
        endpoint.set_write_high_watermark(write_high_watermark);
        self.slots.insert(
            index,
            Slot {
                endpoint,
                callbacks: Some(callbacks),
            },
        );

        let id = EndpointId(index);
        trace!("{} installed (fd {})", id, fd);
        Ok(id)
    }

    /// Queue bytes on an endpoint and try to push them out immediately.
    ///
    /// A write fault is not returned here; it arrives through the
    /// endpoint's error callback on a later loop turn.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError`] if the endpoint is stale, failed, or closed.
    pub fn enqueue(&mut self, id: EndpointId, data: Bytes) -> Result<(), EnqueueError> {
        let Some(slot) = self.slots.get_mut(&id.0) else {
            return Err(EnqueueError {
                state: EndpointState::Closed,
            });
        };
        slot.endpoint.enqueue_outbound(data)?;
        self.flush_now(id);
        Ok(())
    }

    /// Relay-copy between two endpoints owned by this loop, then try to
    /// push the destination's queue out immediately (edge-triggered
    /// readiness never re-fires for data we never attempted to write).
    ///
    /// Returns `None` if either id is stale or both refer to the same
    /// endpoint.
    pub fn copy(
        &mut self,
        dst: EndpointId,
        src: EndpointId,
        skip: usize,
    ) -> Option<RelayCopyResult> {
        if dst.0 == src.0 {
            return None;
        }
        let mut src_slot = self.slots.remove(&src.0)?;
        let Some(dst_slot) = self.slots.get_mut(&dst.0) else {
            self.slots.insert(src.0, src_slot);
            return None;
        };
        let result = relay_copy(&mut dst_slot.endpoint, &mut src_slot.endpoint, skip);
        self.slots.insert(src.0, src_slot);

        if result.bytes_transferred > 0 {
            self.flush_now(dst);
        }
        Some(result)
    }

    /// Run one dispatch turn: deliver deferred errors, poll readiness for
    /// at most `max_wait` (clamped to the nearest connect deadline), pump
    /// and fire callbacks, then expire overdue connects.
    ///
    /// Returns the number of readiness events dispatched.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if polling fails for a reason other
    /// than an interrupted syscall.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        self.deliver_pending_errors();

        let timeout = self.poll_timeout(max_wait);
        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                self.events = events;
                return Err(e);
            }
        }

        let polled: Vec<Polled> = events
            .iter()
            .map(|event| Polled {
                index: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
                faulted: event.is_error(),
            })
            .collect();
        self.events = events;

        let dispatched = polled.len();
        for event in polled {
            self.dispatch(event);
        }
        self.expire_deadlines();

        Ok(dispatched)
    }

    /// Poll wait, clamped so overdue connect deadlines are noticed promptly
    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let now = Instant::now();
        let nearest = self
            .slots
            .values()
            .filter(|slot| slot.endpoint.state() == EndpointState::Connecting)
            .filter_map(|slot| slot.endpoint.connect_deadline())
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));
        match (max_wait, nearest) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    fn dispatch(&mut self, event: Polled) {
        let id = EndpointId(event.index);
        let Some(slot) = self.slots.get_mut(&event.index) else {
            // readiness for an endpoint closed earlier this turn
            return;
        };

        let mut fire_readable = false;
        let mut fire_writable = false;
        let mut error: Option<EndpointError> = None;

        match slot.endpoint.state() {
            EndpointState::Connecting => {
                if event.faulted {
                    let errno = slot.endpoint.pending_errno();
                    slot.endpoint.set_state(EndpointState::Failed);
                    error = Some(EndpointError::ConnectFailed { errno });
                } else if event.writable {
                    slot.endpoint.set_state(EndpointState::Connected);
                    slot.endpoint.set_connect_deadline(None);
                    let fd = slot.endpoint.as_raw_fd();
                    let rearm = self.handle.reregister(
                        fd,
                        Token(event.index),
                        Interest::READABLE | Interest::WRITABLE,
                    );
                    if let Err(e) = rearm {
                        slot.endpoint.set_state(EndpointState::Failed);
                        error = Some(EndpointError::Dispatch {
                            errno: e.raw_os_error().unwrap_or(0),
                        });
                    } else {
                        // anything queued before the connect completed goes
                        // out now; this edge will not re-fire for it
                        if slot.endpoint.queued_outbound() > 0 {
                            let flush = slot.endpoint.flush_outbound();
                            if let Some(e) = flush.error {
                                slot.endpoint.set_state(EndpointState::Failed);
                                error = Some(EndpointError::Write {
                                    errno: e.raw_os_error().unwrap_or(0),
                                });
                            }
                        }
                        if error.is_none() && slot.endpoint.queued_outbound() == 0 {
                            fire_writable = true;
                        }
                    }
                }
            }
            EndpointState::Connected => {
                if event.readable || event.faulted {
                    let fill = slot.endpoint.fill_inbound();
                    if fill.gained > 0 {
                        fire_readable = true;
                    }
                    if let Some(e) = fill.error {
                        slot.endpoint.set_state(EndpointState::Failed);
                        error = Some(EndpointError::Read {
                            errno: e.raw_os_error().unwrap_or(0),
                        });
                    } else if fill.eof && !slot.endpoint.eof_delivered() {
                        slot.endpoint.mark_eof_delivered();
                        error = Some(EndpointError::Eof);
                    }
                }
                if event.writable && slot.endpoint.state() == EndpointState::Connected {
                    let flush = slot.endpoint.flush_outbound();
                    if let Some(e) = flush.error {
                        slot.endpoint.set_state(EndpointState::Failed);
                        error = Some(EndpointError::Write {
                            errno: e.raw_os_error().unwrap_or(0),
                        });
                    } else if slot.endpoint.queued_outbound() == 0 {
                        fire_writable = true;
                    }
                }
            }
            // stale readiness after a fault; the caller owns teardown
            EndpointState::Failed | EndpointState::Closed => return,
        }

        if !fire_readable && !fire_writable && error.is_none() {
            return;
        }
        let Some(callbacks) = slot.callbacks.take() else {
            return;
        };
        self.fire(id, callbacks, fire_readable, fire_writable, error);
    }

    /// Invoke callbacks with the slot's triple taken out, so a callback can
    /// re-enter the loop (close, copy, enqueue) without aliasing.
    fn fire(
        &mut self,
        id: EndpointId,
        mut callbacks: EndpointCallbacks,
        readable: bool,
        writable: bool,
        error: Option<EndpointError>,
    ) {
        if readable {
            (callbacks.on_readable)(self, id);
        }
        if writable && self.slots.contains_key(&id.0) {
            (callbacks.on_writable)(self, id);
        }
        if let Some(err) = error {
            if self.slots.contains_key(&id.0) {
                trace!("{} error callback: {}", id, err);
                (callbacks.on_error)(self, id, err);
            }
        }
        // put the triple back unless the endpoint is gone or a callback
        // installed a replacement
        if let Some(slot) = self.slots.get_mut(&id.0) {
            if slot.callbacks.is_none() {
                slot.callbacks = Some(callbacks);
            }
        }
    }

    /// Deferred runtime errors (from flush attempts outside the dispatch
    /// path) are delivered at the start of the next turn.
    fn deliver_pending_errors(&mut self) {
        while let Some((id, err)) = self.pending_errors.pop_front() {
            let Some(slot) = self.slots.get_mut(&id.0) else {
                continue;
            };
            let Some(callbacks) = slot.callbacks.take() else {
                continue;
            };
            self.fire(id, callbacks, false, false, Some(err));
        }
    }

    /// Fail endpoints whose connect-phase write deadline passed
    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.endpoint.state() == EndpointState::Connecting
                    && slot
                        .endpoint
                        .connect_deadline()
                        .is_some_and(|deadline| deadline <= now)
            })
            .map(|(index, _)| *index)
            .collect();

        for index in expired {
            let id = EndpointId(index);
            let Some(slot) = self.slots.get_mut(&index) else {
                continue;
            };
            debug!("{} connect deadline expired", id);
            slot.endpoint.set_state(EndpointState::Failed);
            slot.endpoint.set_connect_deadline(None);
            let Some(callbacks) = slot.callbacks.take() else {
                continue;
            };
            self.fire(id, callbacks, false, false, Some(EndpointError::ConnectTimedOut));
        }
    }

    /// Best-effort flush outside the dispatch path; faults are deferred to
    /// the next turn's error delivery.
    fn flush_now(&mut self, id: EndpointId) {
        let Some(slot) = self.slots.get_mut(&id.0) else {
            return;
        };
        if slot.endpoint.state() != EndpointState::Connected
            || slot.endpoint.queued_outbound() == 0
        {
            return;
        }
        let flush = slot.endpoint.flush_outbound();
        if let Some(e) = flush.error {
            slot.endpoint.set_state(EndpointState::Failed);
            self.pending_errors.push_back((
                id,
                EndpointError::Write {
                    errno: e.raw_os_error().unwrap_or(0),
                },
            ));
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("active_endpoints", &self.slots.len())
            .field("next_token", &self.next_token)
            .finish_non_exhaustive()
    }
}

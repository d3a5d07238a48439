//! Relay connection establishment
//!
//! Builds non-blocking endpoints toward an upstream relay target and wires
//! them into the event loop. Setup is multi-step and every step is
//! fallible; construction is all-or-nothing. A partially built endpoint is
//! only ever a local `Socket` plus, at the very end, a registration; on
//! any earlier failure the socket drops (closing the descriptor) and the
//! caller never sees a half-initialized endpoint.
//!
//! The fast-open variant transmits initial payload as part of the
//! handshake where the kernel supports it; the tri-state outcome
//! (pending / unsupported / fatal) is an explicit tagged result so every
//! call site handles all of them.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use crate::addr::format_addr;
use crate::config::RelayOptions;
use crate::error::RelayError;
use crate::event::{EndpointCallbacks, EndpointId, EventLoop};
use crate::sockopt;

/// Outcome of a fast-open connect attempt.
///
/// Every variant demands a different follow-up from the caller, so none of
/// them may be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FastOpenOutcome {
    /// The kernel accepted the first `n` bytes into the handshake; resume
    /// sending from byte `n` (the relay copy's `skip` parameter exists for
    /// exactly this)
    ConsumedBytes(usize),
    /// No fast-open cookie yet; the connect proceeds normally and the
    /// caller must resend the initial data once writable
    Pending,
    /// The kernel or platform lacks fast-open; the endpoint fell back to a
    /// classic connect and the caller must resend the initial data
    Unsupported,
    /// The transmit failed outright; the endpoint has been torn down
    Fatal(i32),
}

/// Post-connect health of an endpoint, read from `SO_ERROR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectHealth {
    /// The connection fully established
    Connected,
    /// The pending connect completed with this errno
    ConnectFailed(i32),
}

/// Create a non-blocking relay endpoint, optionally pinned to an
/// interface, registered for write readiness (the connect-completion
/// signal) with the caller's callbacks installed.
///
/// # Errors
///
/// Any step failing returns the corresponding [`RelayError`] with the
/// descriptor and any partial state already released: nothing leaks, and
/// no partially valid endpoint is ever returned.
pub fn prepare_relay(
    ev: &mut EventLoop,
    options: &RelayOptions,
    callbacks: EndpointCallbacks,
) -> Result<EndpointId, RelayError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| RelayError::SocketCreation(e.to_string()))?;

    if let Some(interface) = options.bind_interface.as_deref() {
        if !interface.is_empty() {
            sockopt::bind_to_device(&socket, interface)?;
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| RelayError::socket_option("O_NONBLOCK", e.to_string()))?;

    sockopt::apply_keepalive(&socket, options.keepalive_idle, options.keepalive_interval)?;

    // the endpoint comes into existence only after registration succeeds;
    // dropping `socket` on any earlier failure closed the descriptor
    ev.install(socket, options.write_high_watermark, callbacks)
}

/// Issue a non-blocking connect toward `destination`.
///
/// `EINPROGRESS` is the expected pending state: completion arrives as the
/// endpoint's first writable readiness event, after which the caller
/// should confirm with [`check_health`]. `write_timeout` bounds only the
/// time to that first writable event.
///
/// # Errors
///
/// Any other connect failure tears the endpoint down and returns
/// `RelayError::Connect` with the errno.
pub fn connect_relay(
    ev: &mut EventLoop,
    id: EndpointId,
    destination: SocketAddr,
    write_timeout: Option<Duration>,
) -> Result<(), RelayError> {
    let connect_result = {
        let Some(endpoint) = ev.endpoint_mut(id) else {
            return Err(RelayError::EndpointClosed);
        };
        endpoint.socket().connect(&destination.into())
    };

    match connect_result {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(0);
            debug!(
                "connect to {} failed: {}",
                format_addr(Some(destination)),
                e
            );
            ev.close(id);
            return Err(RelayError::Connect { errno });
        }
    }

    arm_pending_connect(ev, id, destination, write_timeout);
    Ok(())
}

/// Attempt a connect that carries `initial_data` in the handshake.
///
/// See [`FastOpenOutcome`] for the follow-up each outcome demands. On
/// platforms without `MSG_FASTOPEN` this degrades to the `Unsupported`
/// fallback path, never a crash.
pub fn connect_relay_fast_open(
    ev: &mut EventLoop,
    id: EndpointId,
    destination: SocketAddr,
    write_timeout: Option<Duration>,
    initial_data: &[u8],
) -> FastOpenOutcome {
    let Some(endpoint) = ev.endpoint(id) else {
        return FastOpenOutcome::Fatal(libc::EBADF);
    };
    let fd = endpoint.as_raw_fd();
    let remote: SockAddr = destination.into();

    let transmit = fast_open_transmit(fd, initial_data, &remote);
    resolve_fast_open(ev, id, destination, write_timeout, transmit)
}

/// Turn the raw transmit result into the caller-visible outcome, arming or
/// tearing down the endpoint accordingly.
fn resolve_fast_open(
    ev: &mut EventLoop,
    id: EndpointId,
    destination: SocketAddr,
    write_timeout: Option<Duration>,
    transmit: Transmit,
) -> FastOpenOutcome {
    match transmit {
        Transmit::Sent(n) => {
            debug!(
                "fast-open to {}: cookie found, {} bytes rode the handshake",
                format_addr(Some(destination)),
                n
            );
            arm_pending_connect(ev, id, destination, write_timeout);
            FastOpenOutcome::ConsumedBytes(n)
        }
        Transmit::Error(errno) => match classify_fast_open_errno(errno) {
            FastOpenClass::Pending => {
                debug!(
                    "fast-open to {}: no cookie, falling through to pending connect",
                    format_addr(Some(destination))
                );
                arm_pending_connect(ev, id, destination, write_timeout);
                FastOpenOutcome::Pending
            }
            FastOpenClass::Unsupported => {
                debug!("fast-open not supported, using classic connect");
                match connect_relay(ev, id, destination, write_timeout) {
                    Ok(()) => FastOpenOutcome::Unsupported,
                    Err(RelayError::Connect { errno }) => FastOpenOutcome::Fatal(errno),
                    Err(_) => FastOpenOutcome::Fatal(0),
                }
            }
            FastOpenClass::Fatal => {
                debug!(
                    "fast-open to {} failed (errno {})",
                    format_addr(Some(destination)),
                    errno
                );
                ev.close(id);
                FastOpenOutcome::Fatal(errno)
            }
        },
    }
}

/// Read the endpoint's pending error state after connect completion.
///
/// # Errors
///
/// Returns `RelayError::EndpointClosed` for a stale handle, and
/// `RelayError::Internal` when the `SO_ERROR` query itself fails; "could
/// not check" is never reported as "checked and failed".
pub fn check_health(ev: &EventLoop, id: EndpointId) -> Result<ConnectHealth, RelayError> {
    let endpoint = ev.endpoint(id).ok_or(RelayError::EndpointClosed)?;
    match endpoint.socket().take_error() {
        Ok(None) => Ok(ConnectHealth::Connected),
        Ok(Some(e)) => Ok(ConnectHealth::ConnectFailed(e.raw_os_error().unwrap_or(0))),
        Err(e) => Err(RelayError::Internal(e.to_string())),
    }
}

fn arm_pending_connect(
    ev: &mut EventLoop,
    id: EndpointId,
    destination: SocketAddr,
    write_timeout: Option<Duration>,
) {
    if let Some(endpoint) = ev.endpoint_mut(id) {
        endpoint.set_peer(destination);
        endpoint.set_connect_deadline(write_timeout.map(|timeout| Instant::now() + timeout));
    }
}

enum Transmit {
    Sent(usize),
    Error(i32),
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fast_open_transmit(fd: std::os::unix::io::RawFd, data: &[u8], remote: &SockAddr) -> Transmit {
    let n = unsafe {
        libc::sendto(
            fd,
            data.as_ptr().cast::<libc::c_void>(),
            data.len(),
            libc::MSG_FASTOPEN,
            remote.as_ptr().cast::<libc::sockaddr>(),
            remote.len(),
        )
    };
    if n >= 0 {
        #[allow(clippy::cast_sign_loss)] // n is non-negative here
        let sent = n as usize;
        Transmit::Sent(sent)
    } else {
        Transmit::Error(
            std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0),
        )
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fast_open_transmit(
    _fd: std::os::unix::io::RawFd,
    _data: &[u8],
    _remote: &SockAddr,
) -> Transmit {
    Transmit::Error(libc::EOPNOTSUPP)
}

#[derive(Debug, PartialEq, Eq)]
enum FastOpenClass {
    Pending,
    Unsupported,
    Fatal,
}

fn classify_fast_open_errno(errno: i32) -> FastOpenClass {
    if errno == libc::EINPROGRESS || errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
        FastOpenClass::Pending
    } else if errno == libc::EOPNOTSUPP
        || errno == libc::EPROTONOSUPPORT
        || errno == libc::ENOPROTOOPT
    {
        FastOpenClass::Unsupported
    } else {
        FastOpenClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::endpoint::EndpointState;
    use std::net::TcpListener;

    fn open_fds() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    /// Fresh loop + endpoint + loopback listener for driving
    /// `resolve_fast_open` with a chosen transmit result
    fn fast_open_fixture() -> (EventLoop, EndpointId, TcpListener) {
        let mut ev = EventLoop::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let id = prepare_relay(
            &mut ev,
            &RelayOptions::default(),
            EndpointCallbacks::sink(),
        )
        .unwrap();
        (ev, id, listener)
    }

    #[test]
    fn test_simulated_eopnotsupp_falls_back_to_classic_connect() {
        let (mut ev, id, listener) = fast_open_fixture();
        let destination = listener.local_addr().unwrap();

        let outcome = resolve_fast_open(
            &mut ev,
            id,
            destination,
            Some(Duration::from_secs(5)),
            Transmit::Error(libc::EOPNOTSUPP),
        );
        assert_eq!(outcome, FastOpenOutcome::Unsupported);
        // the fallback issued a classic connect, not a teardown
        assert_eq!(ev.endpoint(id).unwrap().state(), EndpointState::Connecting);
        assert_eq!(ev.endpoint(id).unwrap().peer(), Some(destination));
        ev.close(id);
    }

    #[test]
    fn test_simulated_cookie_miss_leaves_connect_pending() {
        let (mut ev, id, listener) = fast_open_fixture();
        let destination = listener.local_addr().unwrap();

        let outcome = resolve_fast_open(
            &mut ev,
            id,
            destination,
            Some(Duration::from_secs(5)),
            Transmit::Error(libc::EINPROGRESS),
        );
        assert_eq!(outcome, FastOpenOutcome::Pending);
        assert_eq!(ev.endpoint(id).unwrap().state(), EndpointState::Connecting);
        ev.close(id);
    }

    #[test]
    fn test_simulated_accepted_payload_reports_consumed_bytes() {
        let (mut ev, id, listener) = fast_open_fixture();
        let destination = listener.local_addr().unwrap();

        let outcome = resolve_fast_open(
            &mut ev,
            id,
            destination,
            Some(Duration::from_secs(5)),
            Transmit::Sent(5),
        );
        assert_eq!(outcome, FastOpenOutcome::ConsumedBytes(5));
        assert_eq!(ev.endpoint(id).unwrap().state(), EndpointState::Connecting);
        assert_eq!(ev.endpoint(id).unwrap().peer(), Some(destination));
        ev.close(id);
    }

    #[test]
    fn test_simulated_fatal_transmit_tears_the_endpoint_down() {
        let (mut ev, id, listener) = fast_open_fixture();
        let destination = listener.local_addr().unwrap();

        let outcome = resolve_fast_open(
            &mut ev,
            id,
            destination,
            Some(Duration::from_secs(5)),
            Transmit::Error(libc::ECONNRESET),
        );
        assert_eq!(outcome, FastOpenOutcome::Fatal(libc::ECONNRESET));
        assert!(ev.endpoint(id).is_none());
        assert_eq!(ev.active_endpoints(), 0);
    }

    #[test]
    fn test_fast_open_errno_classification() {
        assert_eq!(
            classify_fast_open_errno(libc::EINPROGRESS),
            FastOpenClass::Pending
        );
        assert_eq!(
            classify_fast_open_errno(libc::EAGAIN),
            FastOpenClass::Pending
        );
        assert_eq!(
            classify_fast_open_errno(libc::EOPNOTSUPP),
            FastOpenClass::Unsupported
        );
        assert_eq!(
            classify_fast_open_errno(libc::EPROTONOSUPPORT),
            FastOpenClass::Unsupported
        );
        assert_eq!(
            classify_fast_open_errno(libc::ENOPROTOOPT),
            FastOpenClass::Unsupported
        );
        assert_eq!(
            classify_fast_open_errno(libc::ECONNREFUSED),
            FastOpenClass::Fatal
        );
        assert_eq!(classify_fast_open_errno(libc::EACCES), FastOpenClass::Fatal);
    }

    // Concurrently running tests also open and close descriptors, so a
    // single before/after count is racy. Repeating the operation makes a
    // real leak grow by the iteration count while unrelated churn stays
    // within the margin.
    const LEAK_ITERATIONS: usize = 32;
    const LEAK_MARGIN: usize = 4;

    #[test]
    fn test_prepare_failure_leaks_nothing() {
        let mut ev = EventLoop::new().unwrap();
        let before = open_fds();

        // fails at the bind-to-device step whether privileged (ENODEV) or
        // not (EPERM)
        let options = RelayOptions {
            bind_interface: Some("zzzzzzzzzzzzzzz".into()),
            ..RelayOptions::default()
        };
        for _ in 0..LEAK_ITERATIONS {
            let result = prepare_relay(&mut ev, &options, EndpointCallbacks::sink());
            assert!(matches!(result, Err(RelayError::BindDevice { .. })));
        }
        assert_eq!(ev.active_endpoints(), 0);
        assert!(open_fds() <= before + LEAK_MARGIN);
    }

    #[test]
    fn test_prepare_rejects_oversized_interface_name() {
        let mut ev = EventLoop::new().unwrap();
        let before = open_fds();
        let options = RelayOptions {
            bind_interface: Some("an_interface_name_way_past_ifnamsiz".into()),
            ..RelayOptions::default()
        };
        for _ in 0..LEAK_ITERATIONS {
            assert!(prepare_relay(&mut ev, &options, EndpointCallbacks::sink()).is_err());
        }
        assert_eq!(ev.active_endpoints(), 0);
        assert!(open_fds() <= before + LEAK_MARGIN);
    }

    #[test]
    fn test_prepare_and_close_releases_descriptor() {
        let mut ev = EventLoop::new().unwrap();
        let before = open_fds();

        for _ in 0..LEAK_ITERATIONS {
            let id = prepare_relay(
                &mut ev,
                &RelayOptions::default(),
                EndpointCallbacks::sink(),
            )
            .unwrap();
            assert_eq!(ev.active_endpoints(), 1);
            ev.close(id);
        }
        assert_eq!(ev.active_endpoints(), 0);
        assert!(open_fds() <= before + LEAK_MARGIN);
    }

    #[test]
    fn test_connect_on_closed_endpoint_is_an_error_not_a_fault() {
        let mut ev = EventLoop::new().unwrap();
        let id = prepare_relay(
            &mut ev,
            &RelayOptions::default(),
            EndpointCallbacks::sink(),
        )
        .unwrap();
        ev.close(id);

        let destination: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = connect_relay(&mut ev, id, destination, None);
        assert!(matches!(result, Err(RelayError::EndpointClosed)));
        assert!(matches!(
            check_health(&ev, id),
            Err(RelayError::EndpointClosed)
        ));
        assert_eq!(
            connect_relay_fast_open(&mut ev, id, destination, None, b"x"),
            FastOpenOutcome::Fatal(libc::EBADF)
        );
    }

    #[test]
    fn test_options_resolved_from_config() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        let mut ev = EventLoop::new().unwrap();
        let id = prepare_relay(&mut ev, &config.options(), EndpointCallbacks::sink()).unwrap();
        assert_eq!(
            ev.endpoint(id).unwrap().write_high_watermark(),
            Some(256 * 1024)
        );
        ev.close(id);
    }
}

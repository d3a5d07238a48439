//! Socket option utilities for transparent redirection
//!
//! Low-level socket options the relay depends on:
//! - `IP_TRANSPARENT`: lets the socket receive redirected traffic and send
//!   replies carrying the original (pre-redirect) source address, so the
//!   kernel routes return traffic correctly. Requires `CAP_NET_ADMIN`.
//! - `TCP_FASTOPEN`: arms the kernel's fast-open queue so initial payload
//!   can ride the connection handshake.
//! - `SO_BINDTODEVICE`: pins outbound traffic to a named interface,
//!   independent of the routing tables.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Socket, TcpKeepalive};
use tracing::debug;

use crate::error::RelayError;

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `IP_RECVORIGDSTADDR` (`SOL_IP` level)
///
/// When enabled on a datagram socket, each received packet carries its
/// original destination in ancillary data.
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// Outcome of arming the fast-open queue.
///
/// Platform absence of the option is a reported non-error outcome, never
/// conflated with a real configuration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastOpenSupport {
    /// The fast-open backlog was configured
    Enabled,
    /// The platform or kernel does not support `TCP_FASTOPEN`
    NotSupported,
}

/// Set `IP_TRANSPARENT` so the socket may participate in kernel-redirected
/// flows.
///
/// # Errors
///
/// Returns `RelayError::PermissionDenied` if `CAP_NET_ADMIN` is missing,
/// `RelayError::SocketOption` for any other failure.
pub fn mark_transparent(fd: RawFd) -> Result<(), RelayError> {
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            IP_TRANSPARENT,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(RelayError::PermissionDenied);
        }
        return Err(RelayError::socket_option("IP_TRANSPARENT", err.to_string()));
    }

    Ok(())
}

/// Enable `IP_RECVORIGDSTADDR` on a datagram socket so received packets
/// carry their pre-redirect destination in ancillary data.
///
/// # Errors
///
/// Returns `RelayError::SocketOption` if setsockopt fails.
pub fn enable_recv_original_destination(fd: RawFd) -> Result<(), RelayError> {
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            IP_RECVORIGDSTADDR,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(RelayError::socket_option(
            "IP_RECVORIGDSTADDR",
            err.to_string(),
        ));
    }

    Ok(())
}

/// Arm the kernel's fast-open queue on a stream socket.
///
/// # Errors
///
/// Returns `RelayError::SocketOption` only for real configuration failures;
/// missing kernel/platform support is `Ok(FastOpenSupport::NotSupported)`.
pub fn enable_fast_open_queue(fd: RawFd) -> Result<FastOpenSupport, RelayError> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    {
        #[cfg(target_os = "macos")]
        let qlen: libc::c_int = 1;
        #[cfg(not(target_os = "macos"))]
        let qlen: libc::c_int = 5;

        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_FASTOPEN,
                std::ptr::addr_of!(qlen).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if ret != 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOPROTOOPT | libc::EOPNOTSUPP) => {
                    debug!("TCP_FASTOPEN not supported by this kernel");
                    return Ok(FastOpenSupport::NotSupported);
                }
                _ => {
                    return Err(RelayError::socket_option("TCP_FASTOPEN", err.to_string()));
                }
            }
        }

        Ok(FastOpenSupport::Enabled)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        let _ = fd;
        Ok(FastOpenSupport::NotSupported)
    }
}

/// Set `SO_BINDTODEVICE` to pin the socket to a specific interface.
///
/// # Errors
///
/// Returns `RelayError::BindDevice` if the name does not fit `IFNAMSIZ` or
/// setsockopt fails.
pub fn bind_to_device(socket: &Socket, interface: &str) -> Result<(), RelayError> {
    // Interface name must be null-terminated and fit in IFNAMSIZ (16 bytes)
    if interface.len() > 15 {
        return Err(RelayError::bind_device(
            interface,
            "interface name too long (max 15 chars)",
        ));
    }

    let fd = socket.as_raw_fd();

    let mut ifname = [0u8; 16];
    ifname[..interface.len()].copy_from_slice(interface.as_bytes());

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr().cast::<libc::c_void>(),
            ifname.len() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(RelayError::bind_device(interface, err.to_string()));
    }

    debug!("bound relay socket to interface {}", interface);
    Ok(())
}

/// Apply TCP keepalive so dead upstreams are detected on long-lived relays.
///
/// # Errors
///
/// Returns `RelayError::SocketOption` if the option cannot be applied.
pub fn apply_keepalive(
    socket: &Socket,
    idle: Duration,
    interval: Duration,
) -> Result<(), RelayError> {
    let keepalive = TcpKeepalive::new().with_time(idle).with_interval(interval);

    socket
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| RelayError::socket_option("TCP_KEEPALIVE", e.to_string()))
}

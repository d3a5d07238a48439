//! Error types for tproxy-relay
//!
//! Errors are split by subsystem: [`RelayError`] covers relay connection
//! establishment and socket options, [`DatagramError`] covers the
//! original-destination datagram path. Runtime faults on an established
//! endpoint are never returned from the triggering call; they are delivered
//! through the endpoint's error callback as an [`EndpointError`] on a later
//! event-loop turn.

use std::io;

use thiserror::Error;

/// Errors raised while establishing a relay endpoint or applying socket
/// options. All of these are returned synchronously, with any partially
/// acquired resources already released.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Failed to create the relay socket
    #[error("failed to create relay socket: {0}")]
    SocketCreation(String),

    /// Failed to bind the socket to a network interface (`SO_BINDTODEVICE`)
    #[error("failed to bind to interface {interface}: {reason}")]
    BindDevice { interface: String, reason: String },

    /// Failed to set a socket option
    #[error("failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to register the descriptor with the event loop
    #[error("failed to register with event loop: {0}")]
    Registration(String),

    /// Non-blocking connect failed with something other than `EINPROGRESS`
    #[error("connect failed (errno {errno})")]
    Connect { errno: i32 },

    /// Fast-open transmit failed fatally (not a cookie miss, not a
    /// missing-support condition)
    #[error("fast-open transmit failed (errno {errno})")]
    FastOpenFatal { errno: i32 },

    /// Permission denied (`IP_TRANSPARENT` requires `CAP_NET_ADMIN`)
    #[error("permission denied: transparent mode requires CAP_NET_ADMIN")]
    PermissionDenied,

    /// The endpoint handle refers to an endpoint that was already closed
    #[error("endpoint is closed")]
    EndpointClosed,

    /// A diagnostic query itself failed (e.g. the `SO_ERROR` read during a
    /// health check). Distinct from "checked and the connect had failed".
    #[error("socket diagnostic query failed: {0}")]
    Internal(String),

    /// Invalid relay configuration
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),
}

impl RelayError {
    /// Check if this error is recoverable by retrying against another
    /// candidate destination (retry policy itself is the caller's job).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::FastOpenFatal { .. } => true,
            Self::SocketCreation(_)
            | Self::BindDevice { .. }
            | Self::SocketOption { .. }
            | Self::Registration(_)
            | Self::PermissionDenied
            | Self::EndpointClosed
            | Self::Internal(_)
            | Self::InvalidConfig(_) => false,
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind-to-device error
    pub fn bind_device(interface: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BindDevice {
            interface: interface.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the datagram original-destination path.
///
/// Every variant is scoped to a single datagram; the receiving socket stays
/// usable.
#[derive(Debug, Error)]
pub enum DatagramError {
    /// The reported source-address length did not match `sockaddr_in`
    #[error("unexpected source address length {actual} instead of {expected}")]
    AddressLength { expected: usize, actual: usize },

    /// The payload filled the receive buffer, so the datagram may have been
    /// truncated. Never reported as success: the relayed protocol's framing
    /// may depend on exact datagram boundaries.
    #[error("truncated datagram of {len} bytes from {source_addr}, dropping it")]
    Truncated { len: usize, source_addr: String },

    /// The ancillary control block was clipped (`MSG_CTRUNC`), so the
    /// original destination may be missing or corrupt
    #[error("ancillary control data truncated")]
    ControlTruncated,

    /// No usable original-destination entry was found in the ancillary data
    #[error("no original destination in ancillary data")]
    OriginalDestinationMissing,

    /// The receive call itself failed
    #[error("recvmsg failed: {0}")]
    Recv(#[from] io::Error),
}

impl DatagramError {
    /// All validation failures leave the socket usable; `Recv` is
    /// recoverable for the transient kinds only.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AddressLength { .. }
            | Self::Truncated { .. }
            | Self::ControlTruncated
            | Self::OriginalDestinationMissing => true,
            Self::Recv(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        }
    }
}

/// Runtime fault on an established endpoint, delivered through the
/// endpoint's registered error callback.
///
/// Once one of these fires, teardown of the endpoint is the caller's
/// responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The connect-phase write timeout expired before first-writable
    #[error("connect timed out")]
    ConnectTimedOut,

    /// The pending connect completed with a failure
    #[error("connect failed (errno {errno})")]
    ConnectFailed { errno: i32 },

    /// A read from the descriptor failed
    #[error("read failed (errno {errno})")]
    Read { errno: i32 },

    /// A write to the descriptor failed
    #[error("write failed (errno {errno})")]
    Write { errno: i32 },

    /// Re-arming readiness interest failed
    #[error("readiness registration failed (errno {errno})")]
    Dispatch { errno: i32 },

    /// The peer closed the connection
    #[error("peer closed the connection")]
    Eof,
}

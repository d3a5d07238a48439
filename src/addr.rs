//! Diagnostic address formatting
//!
//! Renders socket addresses into a fixed inline buffer for log messages.
//! Formatting is total: an unknown or unset address family renders as a
//! placeholder, output never exceeds the buffer, and nothing here can fail
//! the operation being logged.

use std::fmt::{self, Write};
use std::net::SocketAddr;

/// Inline buffer capacity. Sized for the longest rendering: a bracketed
/// IPv6 address with an embedded IPv4 tail plus a five-digit port.
pub const ADDR_DISPLAY_CAPACITY: usize = 54;

/// Rendered for an address whose family is unknown or unset
const PLACEHOLDER: &str = "???:???";

/// A rendered address backed by a fixed inline buffer.
///
/// Implements [`fmt::Write`] with silent truncation at capacity, so it can
/// never grow past [`ADDR_DISPLAY_CAPACITY`] bytes and never allocates.
#[derive(Debug, Clone, Copy)]
pub struct AddrDisplay {
    buf: [u8; ADDR_DISPLAY_CAPACITY],
    len: usize,
}

impl AddrDisplay {
    const fn empty() -> Self {
        Self {
            buf: [0; ADDR_DISPLAY_CAPACITY],
            len: 0,
        }
    }

    /// Rendered text
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or(PLACEHOLDER)
    }

    /// Length of the rendered text in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if nothing was rendered
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Write for AddrDisplay {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = ADDR_DISPLAY_CAPACITY - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl fmt::Display for AddrDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render an address as `host:port` (IPv4), `[host]:port` (IPv6), or
/// `???:???` when the family is unknown.
#[must_use]
pub fn format_addr(addr: Option<SocketAddr>) -> AddrDisplay {
    let mut out = AddrDisplay::empty();
    let result = match addr {
        Some(SocketAddr::V4(v4)) => write!(out, "{}:{}", v4.ip(), v4.port()),
        Some(SocketAddr::V6(v6)) => write!(out, "[{}]:{}", v6.ip(), v6.port()),
        None => out.write_str(PLACEHOLDER),
    };
    debug_assert!(result.is_ok());
    out
}

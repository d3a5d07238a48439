//! tproxy-relay: transport core for transparent network redirectors
//!
//! This crate is the transport layer of a TPROXY-style transparent
//! redirector. It establishes outbound connections toward an upstream
//! relay target on behalf of intercepted client connections, moves bytes
//! between endpoints under explicit backpressure, and recovers the
//! kernel-recorded pre-redirect destination for datagram traffic.
//!
//! # Architecture
//!
//! ```text
//! Client → kernel redirect → (proxy negotiation) → tproxy-relay → Upstream
//!                                                      ↓
//!                                     readiness loop + watermarked copy
//! ```
//!
//! Proxy-protocol negotiation, listener setup, and process bootstrap live
//! outside this crate; they consume the endpoint handles, relay-copy
//! primitive, and original-destination lookups exposed here.
//!
//! # Quick Start
//!
//! ```no_run
//! use tproxy_relay::config::RelayConfig;
//! use tproxy_relay::event::{EndpointCallbacks, EventLoop};
//! use tproxy_relay::relay::{connect_relay, prepare_relay};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::default();
//! config.validate()?;
//! let options = config.options();
//!
//! let mut ev = EventLoop::new()?;
//! let id = prepare_relay(&mut ev, &options, EndpointCallbacks::sink())?;
//! connect_relay(&mut ev, id, "198.51.100.10:1080".parse()?, options.connect_timeout)?;
//!
//! loop {
//!     ev.run_once(None)?;
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`addr`]: bounded diagnostic address formatting
//! - [`config`]: relay configuration types
//! - [`copy`]: flow-controlled relay copy
//! - [`datagram`]: original-destination recovery for redirected datagrams
//! - [`endpoint`]: the buffered endpoint primitive
//! - [`error`]: error types
//! - [`event`]: single-threaded readiness dispatch loop
//! - [`relay`]: relay connection establishment
//! - [`sockopt`]: transparent-redirect socket options

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod addr;
pub mod config;
pub mod copy;
pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod relay;
pub mod sockopt;

// Re-export commonly used types at the crate root
pub use addr::{format_addr, AddrDisplay};
pub use config::{RelayConfig, RelayOptions};
pub use copy::{relay_copy, RelayCopyResult};
pub use datagram::{recv_with_original_destination, RedirectedDatagram};
pub use endpoint::{Endpoint, EndpointState, RelayBuffer};
pub use error::{DatagramError, EndpointError, RelayError};
pub use event::{DispatchHandle, EndpointCallbacks, EndpointId, EventLoop};
pub use relay::{
    check_health, connect_relay, connect_relay_fast_open, prepare_relay, ConnectHealth,
    FastOpenOutcome,
};
pub use sockopt::{
    enable_fast_open_queue, enable_recv_original_destination, mark_transparent, FastOpenSupport,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

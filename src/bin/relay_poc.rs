//! Relay transport proof of concept
//!
//! Establishes a non-blocking relay connection toward the address given on
//! the command line, confirms connect health on first-writable, sends an
//! optional probe payload, and prints whatever the upstream answers.
//!
//! ```bash
//! RUST_LOG=debug cargo run --bin relay_poc -- 127.0.0.1:8080 "HEAD / HTTP/1.0\r\n\r\n"
//! ```

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tproxy_relay::config::RelayConfig;
use tproxy_relay::event::{EndpointCallbacks, ErrorFn, EventLoop, ReadableFn, WritableFn};
use tproxy_relay::relay::{check_health, connect_relay, prepare_relay, ConnectHealth};
use tproxy_relay::{format_addr, EndpointError};

#[derive(Default)]
struct PocState {
    greeted: bool,
    finished: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let destination: SocketAddr = args
        .next()
        .context("usage: relay_poc <host:port> [payload]")?
        .parse()
        .context("destination must be host:port")?;
    let payload = args.next().unwrap_or_else(|| "ping\r\n".into());

    let config = RelayConfig::default();
    config.validate()?;
    let options = config.options();

    let state = Rc::new(RefCell::new(PocState::default()));

    let on_readable: ReadableFn = {
        let state = Rc::clone(&state);
        Box::new(move |ev: &mut EventLoop, id| {
            let Some(endpoint) = ev.endpoint_mut(id) else {
                return;
            };
            while let Some(segment) = endpoint.pop_inbound_segment() {
                info!(
                    "upstream answered {} bytes: {:?}",
                    segment.len(),
                    String::from_utf8_lossy(&segment)
                );
            }
            state.borrow_mut().finished = true;
        })
    };

    let on_writable: WritableFn = {
        let state = Rc::clone(&state);
        let payload = Bytes::from(payload.into_bytes());
        Box::new(move |ev: &mut EventLoop, id| {
            if state.borrow().greeted {
                return;
            }
            match check_health(ev, id) {
                Ok(ConnectHealth::Connected) => {
                    debug!("relay established, sending {} byte probe", payload.len());
                    if ev.enqueue(id, payload.clone()).is_err() {
                        state.borrow_mut().finished = true;
                    }
                    state.borrow_mut().greeted = true;
                }
                Ok(ConnectHealth::ConnectFailed(errno)) => {
                    error!("connect failed (errno {errno})");
                    ev.close(id);
                    state.borrow_mut().finished = true;
                }
                Err(e) => {
                    error!("health check failed: {e}");
                    ev.close(id);
                    state.borrow_mut().finished = true;
                }
            }
        })
    };

    let on_error: ErrorFn = {
        let state = Rc::clone(&state);
        Box::new(move |ev: &mut EventLoop, id, err: EndpointError| {
            match err {
                EndpointError::Eof => info!("upstream closed the connection"),
                other => error!("relay fault: {other}"),
            }
            ev.close(id);
            state.borrow_mut().finished = true;
        })
    };

    let mut ev = EventLoop::new()?;
    let id = prepare_relay(
        &mut ev,
        &options,
        EndpointCallbacks::new(on_readable, on_writable, on_error),
    )?;
    info!(
        "connecting to {} via {:?}",
        format_addr(Some(destination)),
        options.bind_interface
    );
    connect_relay(&mut ev, id, destination, options.connect_timeout)?;

    for _ in 0..600 {
        ev.run_once(Some(Duration::from_millis(100)))?;
        if state.borrow().finished {
            ev.close(id);
            return Ok(());
        }
    }
    bail!("no response within 60s");
}

//! Loopback integration tests for the relay transport
//!
//! Everything here runs against real sockets on 127.0.0.1 with no
//! privileges required: establishment, connect-completion callbacks,
//! health checks, watermarked relaying, and descriptor accounting.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use tproxy_relay::config::RelayOptions;
use tproxy_relay::event::{EndpointCallbacks, EventLoop};
use tproxy_relay::relay::{
    check_health, connect_relay, connect_relay_fast_open, prepare_relay, ConnectHealth,
    FastOpenOutcome,
};
use tproxy_relay::{EndpointError, EndpointState, RelayError};

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

fn run_until(ev: &mut EventLoop, mut done: impl FnMut(&mut EventLoop) -> bool) {
    for _ in 0..200 {
        ev.run_once(Some(Duration::from_millis(50))).unwrap();
        if done(ev) {
            return;
        }
    }
    panic!("condition not reached within the polling budget");
}

/// Callbacks that record connect completion and collect every error
fn recording_callbacks(
    connected: &Rc<RefCell<bool>>,
    errors: &Rc<RefCell<Vec<EndpointError>>>,
) -> EndpointCallbacks {
    let connected = Rc::clone(connected);
    let errors = Rc::clone(errors);
    EndpointCallbacks::new(
        Box::new(|_, _| {}),
        Box::new(move |_, _| *connected.borrow_mut() = true),
        Box::new(move |_, _, e| errors.borrow_mut().push(e)),
    )
}

#[test]
fn test_full_relay_lifecycle() {
    let mut ev = EventLoop::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();

    let connected = Rc::new(RefCell::new(false));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let id = prepare_relay(
        &mut ev,
        &RelayOptions::default(),
        recording_callbacks(&connected, &errors),
    )
    .unwrap();
    connect_relay(&mut ev, id, upstream_addr, Some(Duration::from_secs(5))).unwrap();

    run_until(&mut ev, |_| *connected.borrow());
    assert_eq!(ev.endpoint(id).unwrap().state(), EndpointState::Connected);
    assert_eq!(check_health(&ev, id).unwrap(), ConnectHealth::Connected);
    assert_eq!(ev.endpoint(id).unwrap().peer(), Some(upstream_addr));

    let (mut upstream, _) = listener.accept().unwrap();

    // upstream -> endpoint inbound queue
    upstream.write_all(b"from upstream").unwrap();
    run_until(&mut ev, |ev| {
        ev.endpoint(id).map_or(false, |e| e.queued_inbound() == 13)
    });

    // endpoint outbound queue -> upstream
    ev.enqueue(id, Bytes::from_static(b"to upstream")).unwrap();
    let mut buf = [0u8; 11];
    upstream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"to upstream");

    assert!(errors.borrow().is_empty());
    ev.close(id);
}

#[test]
fn test_repeated_relay_cycles_do_not_leak_descriptors() {
    let mut ev = EventLoop::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();

    // concurrent tests churn a few descriptors of their own, so the check
    // is amplified: a leak grows with the cycle count, churn does not
    let before = open_fds();
    for _ in 0..32 {
        let id = prepare_relay(
            &mut ev,
            &RelayOptions::default(),
            EndpointCallbacks::sink(),
        )
        .unwrap();
        connect_relay(&mut ev, id, upstream_addr, Some(Duration::from_secs(5))).unwrap();
        // closing mid-connect is a supported teardown path
        ev.close(id);
    }
    assert_eq!(ev.active_endpoints(), 0);
    assert!(open_fds() <= before + 4);
}

#[test]
fn test_refused_connect_surfaces_errno_and_tears_down() {
    let mut ev = EventLoop::new().unwrap();

    // grab a loopback port, then free it so the connect is refused
    let doomed_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let connected = Rc::new(RefCell::new(false));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let id = prepare_relay(
        &mut ev,
        &RelayOptions::default(),
        recording_callbacks(&connected, &errors),
    )
    .unwrap();

    match connect_relay(&mut ev, id, doomed_addr, Some(Duration::from_secs(5))) {
        // refusal observed synchronously; the endpoint is already gone
        Err(RelayError::Connect { errno }) => {
            assert_eq!(errno, libc::ECONNREFUSED);
            assert!(ev.endpoint(id).is_none());
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(()) => {
            // pending connect: the failure arrives through the error
            // callback on a later turn
            run_until(&mut ev, |_| !errors.borrow().is_empty());
            assert!(matches!(
                errors.borrow().first(),
                Some(EndpointError::ConnectFailed { .. })
            ));
            assert_eq!(ev.endpoint(id).unwrap().state(), EndpointState::Failed);
            assert!(!*connected.borrow());
            ev.close(id);
        }
    }
}

#[test]
fn test_unreachable_connect_times_out_or_fails() {
    let mut ev = EventLoop::new().unwrap();

    let connected = Rc::new(RefCell::new(false));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let id = prepare_relay(
        &mut ev,
        &RelayOptions::default(),
        recording_callbacks(&connected, &errors),
    )
    .unwrap();

    // TEST-NET-1 is reserved for documentation and should not be routable
    let blackhole: SocketAddr = "192.0.2.1:12345".parse().unwrap();
    match connect_relay(&mut ev, id, blackhole, Some(Duration::from_millis(300))) {
        Err(RelayError::Connect { .. }) => return, // no route at all
        Err(e) => panic!("unexpected error: {e}"),
        Ok(()) => {}
    }

    run_until(&mut ev, |_| !errors.borrow().is_empty());
    // either the write deadline expired or the network said no first
    assert!(matches!(
        errors.borrow().first(),
        Some(EndpointError::ConnectTimedOut | EndpointError::ConnectFailed { .. })
    ));
    assert_eq!(ev.endpoint(id).unwrap().state(), EndpointState::Failed);
    assert!(!*connected.borrow());
    ev.close(id);
}

#[test]
fn test_fast_open_attempt_is_never_fatal_on_loopback() {
    let mut ev = EventLoop::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();

    let id = prepare_relay(
        &mut ev,
        &RelayOptions::default(),
        EndpointCallbacks::sink(),
    )
    .unwrap();

    let outcome = connect_relay_fast_open(
        &mut ev,
        id,
        upstream_addr,
        Some(Duration::from_secs(5)),
        b"early payload",
    );

    // which arm fires depends on the kernel's fast-open configuration, but
    // a loopback attempt must never be fatal and must leave the endpoint
    // connecting (classic fallback included)
    match outcome {
        FastOpenOutcome::Pending
        | FastOpenOutcome::Unsupported
        | FastOpenOutcome::ConsumedBytes(_) => {
            assert_eq!(ev.endpoint(id).unwrap().state(), EndpointState::Connecting);
        }
        FastOpenOutcome::Fatal(errno) => panic!("fast open fatal (errno {errno})"),
    }

    ev.close(id);
}

#[test]
fn test_watermarked_relay_drains_under_backpressure() {
    let mut ev = EventLoop::new().unwrap();

    let upstream_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client_listener = TcpListener::bind("127.0.0.1:0").unwrap();

    let src_connected = Rc::new(RefCell::new(false));
    let dst_connected = Rc::new(RefCell::new(false));
    let errors = Rc::new(RefCell::new(Vec::new()));

    let src = prepare_relay(
        &mut ev,
        &RelayOptions::default(),
        recording_callbacks(&src_connected, &errors),
    )
    .unwrap();
    let dst_options = RelayOptions {
        write_high_watermark: Some(4096),
        ..RelayOptions::default()
    };
    let dst = prepare_relay(
        &mut ev,
        &dst_options,
        recording_callbacks(&dst_connected, &errors),
    )
    .unwrap();

    connect_relay(
        &mut ev,
        src,
        upstream_listener.local_addr().unwrap(),
        Some(Duration::from_secs(5)),
    )
    .unwrap();
    connect_relay(
        &mut ev,
        dst,
        client_listener.local_addr().unwrap(),
        Some(Duration::from_secs(5)),
    )
    .unwrap();
    run_until(&mut ev, |_| {
        *src_connected.borrow() && *dst_connected.borrow()
    });

    let (mut upstream, _) = upstream_listener.accept().unwrap();
    let (mut client, _) = client_listener.accept().unwrap();

    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    upstream.write_all(&body).unwrap();
    run_until(&mut ev, |ev| {
        ev.endpoint(src)
            .map_or(false, |e| e.queued_inbound() == body.len())
    });

    // relay src -> dst in watermark-bounded passes; the loop's immediate
    // flush keeps draining the destination so every pass gets headroom
    let mut relayed = 0;
    for _ in 0..100 {
        let result = ev.copy(dst, src, 0).unwrap();
        assert!(result.bytes_transferred <= 4096);
        relayed += result.bytes_transferred;
        if !result.reached_cap {
            break;
        }
        ev.run_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(relayed, body.len());

    let mut received = vec![0u8; body.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, body);
    assert!(errors.borrow().is_empty());

    ev.close(src);
    ev.close(dst);
}

#[test]
fn test_stale_handles_after_close_are_safe_noops() {
    let mut ev = EventLoop::new().unwrap();
    let id = prepare_relay(
        &mut ev,
        &RelayOptions::default(),
        EndpointCallbacks::sink(),
    )
    .unwrap();

    assert!(ev.close(id));
    assert!(!ev.close(id));
    assert!(ev.endpoint(id).is_none());
    assert!(ev.copy(id, id, 0).is_none());
    assert!(ev.enqueue(id, Bytes::from_static(b"late")).is_err());
    assert!(matches!(
        check_health(&ev, id),
        Err(RelayError::EndpointClosed)
    ));
    // the loop keeps running fine with the stale id retired
    ev.run_once(Some(Duration::from_millis(10))).unwrap();
}

//! Original-destination recovery for redirected datagrams
//!
//! A kernel redirect rule rewrites where a datagram is delivered but
//! records where it was originally addressed in ancillary control data.
//! This module performs the single-shot receive that recovers both the
//! payload and that pre-redirect destination; without it a datagram cannot
//! be relayed.
//!
//! Duplicate original-destination entries are resolved last-wins, matching
//! the kernel-observed behavior this layer was built against; every other
//! ancillary entry is skipped with a debug log, since some kernels attach
//! metadata this layer does not need.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use bytes::Bytes;
use tracing::debug;

use crate::addr::format_addr;
use crate::error::DatagramError;
use crate::sockopt::IP_RECVORIGDSTADDR;

/// Control message buffer size (enough for `sockaddr_in` entries)
const CMSG_BUFFER_SIZE: usize = 64;

/// One received datagram with its redirect metadata recovered
#[derive(Debug, Clone)]
pub struct RedirectedDatagram {
    /// Datagram payload
    pub payload: Bytes,
    /// Address the datagram actually came from
    pub source: SocketAddrV4,
    /// Pre-redirect destination the sender was addressing
    pub original_destination: SocketAddrV4,
}

impl RedirectedDatagram {
    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Receive one datagram together with its original destination.
///
/// Performs a single `recvmsg` requesting ancillary control data, then
/// validates in order: source-address length, payload truncation (a
/// datagram filling the whole buffer is dropped, never reported short),
/// control truncation, and finally the ancillary walk for the
/// original-destination entry (IPv4 only, last-wins on duplicates).
///
/// # Errors
///
/// Returns a [`DatagramError`] scoped to this datagram; the socket stays
/// usable. `Recv` with a `WouldBlock` kind means the caller's readiness
/// loop should simply retry later.
pub fn recv_with_original_destination(
    fd: RawFd,
    buffer_capacity: usize,
) -> Result<RedirectedDatagram, DatagramError> {
    recv_with_control_capacity(fd, buffer_capacity, CMSG_BUFFER_SIZE)
}

/// Control space below what the pending ancillary entries need makes the
/// kernel set `MSG_CTRUNC`; the cap is a parameter so that path can be
/// exercised directly.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
#[allow(clippy::cast_sign_loss)] // recvmsg result is checked before casting
fn recv_with_control_capacity(
    fd: RawFd,
    buffer_capacity: usize,
    control_capacity: usize,
) -> Result<RedirectedDatagram, DatagramError> {
    let mut buf = vec![0u8; buffer_capacity];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut src_addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut cmsg_buf: [u8; CMSG_BUFFER_SIZE] = [0; CMSG_BUFFER_SIZE];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = control_capacity.min(CMSG_BUFFER_SIZE);

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(DatagramError::Recv(io::Error::last_os_error()));
    }
    let len = n as usize;

    let expected = mem::size_of::<libc::sockaddr_in>();
    if msg.msg_namelen as usize != expected {
        return Err(DatagramError::AddressLength {
            expected,
            actual: msg.msg_namelen as usize,
        });
    }

    let source = SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(src_addr.sin_addr.s_addr)),
        u16::from_be(src_addr.sin_port),
    );

    if len >= buffer_capacity {
        return Err(DatagramError::Truncated {
            len,
            source_addr: format_addr(Some(source.into())).as_str().to_owned(),
        });
    }

    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(DatagramError::ControlTruncated);
    }

    let original_destination =
        decode_original_destination(&msg).ok_or(DatagramError::OriginalDestinationMissing)?;

    Ok(RedirectedDatagram {
        payload: Bytes::copy_from_slice(&buf[..len]),
        source,
        original_destination,
    })
}

/// Walk the ancillary entries for an original-destination address.
///
/// Last-wins on duplicate matching entries; foreign entries are skipped
/// with a debug log. Returns `None` when no entry matched or the decoded
/// family is not IPv4.
#[allow(clippy::cast_ptr_alignment)] // read_unaligned handles CMSG_DATA alignment
pub(crate) fn decode_original_destination(msg: &libc::msghdr) -> Option<SocketAddrV4> {
    let mut found: Option<libc::sockaddr_in> = None;

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        let min_len =
            unsafe { libc::CMSG_LEN(mem::size_of::<libc::sockaddr_in>() as libc::c_uint) };

        if header.cmsg_level == libc::SOL_IP
            && header.cmsg_type == IP_RECVORIGDSTADDR
            && header.cmsg_len as u64 >= u64::from(min_len)
        {
            if found.is_some() {
                debug!("duplicate original-destination entry, keeping the last");
            }
            let data = unsafe { libc::CMSG_DATA(cmsg) }.cast::<libc::sockaddr_in>();
            found = Some(unsafe { std::ptr::read_unaligned(data) });
        } else {
            debug!(
                "skipping unexpected cmsg (level, type) = ({}, {})",
                header.cmsg_level, header.cmsg_type
            );
        }

        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }

    let addr = found?;
    if addr.sin_family != libc::AF_INET as libc::sa_family_t {
        return None;
    }
    Some(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}

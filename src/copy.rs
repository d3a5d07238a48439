//! Flow-controlled relay copy
//!
//! Moves buffered bytes from one endpoint's inbound queue to another's
//! outbound queue under the destination's high watermark. The `skip`
//! parameter resumes the transfer past a prefix the caller already
//! delivered by other means (a payload consumed during fast-open
//! negotiation), so that prefix is never resent.
//!
//! Backpressure works by re-invocation, not by waiting: when the result
//! says the cap was reached, the caller calls again after the destination's
//! next writable readiness event has drained its queue.

use crate::endpoint::Endpoint;

/// Result of one relay copy invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCopyResult {
    /// Bytes moved onto the destination's outbound queue
    pub bytes_transferred: usize,
    /// More source data remained but the destination's watermark stopped
    /// the transfer; retry after the destination drains. Not an error.
    pub reached_cap: bool,
}

/// Copy from `src`'s inbound queue onto `dst`'s outbound queue, resuming
/// from byte offset `skip` within the source queue.
///
/// Transfers `min(watermark headroom, available)` bytes by enqueueing
/// zero-copy sub-slices of the source's native segments; no flat
/// intermediate copy is made. The transferred bytes and the skipped prefix
/// are drained from the source, so a follow-up call continues with
/// `skip = 0`.
///
/// A `skip` beyond the queued bytes yields a zero-byte result, not an
/// error. If the destination stops accepting segments mid-iteration
/// (already failed or closed), the partial count is returned; the fatal
/// condition itself reaches the caller through the destination's error
/// callback on a later event-loop turn, never through this return value.
pub fn relay_copy(dst: &mut Endpoint, src: &mut Endpoint, skip: usize) -> RelayCopyResult {
    let cap = match dst.write_high_watermark() {
        Some(watermark) => watermark.saturating_sub(dst.queued_outbound()),
        None => usize::MAX,
    };
    let available = src.queued_inbound().saturating_sub(skip);
    let reached_cap = available > cap;
    let budget = available.min(cap);

    if budget == 0 {
        return RelayCopyResult {
            bytes_transferred: 0,
            reached_cap,
        };
    }

    let mut remaining_skip = skip;
    let mut transferred = 0usize;

    for segment in src.inbound().segments() {
        if transferred == budget {
            break;
        }
        if remaining_skip >= segment.len() {
            remaining_skip -= segment.len();
            continue;
        }
        let take = (segment.len() - remaining_skip).min(budget - transferred);
        let chunk = segment.slice(remaining_skip..remaining_skip + take);
        remaining_skip = 0;
        if dst.enqueue_outbound(chunk).is_err() {
            break;
        }
        transferred += take;
    }

    // The skipped prefix was already delivered during connection setup;
    // drop it together with what was just moved.
    src.drain_inbound(skip + transferred);

    RelayCopyResult {
        bytes_transferred: transferred,
        reached_cap,
    }
}

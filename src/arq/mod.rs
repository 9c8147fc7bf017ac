//! Reliable delivery over an unreliable datagram substrate.
//!
//! A compact ARQ (automatic repeat request) discipline:
//!
//! - Cumulative acknowledgements over a bounded sliding window
//! - Retransmission with exponential backoff, paced to one segment per tick
//! - Out-of-order reassembly with strictly in-order delivery upstream
//! - RTT estimation per Jacobson, honoring Karn's rule
//! - PING/PONG keepalive with an idle cutoff
//!
//! The engine is substrate-agnostic: it emits fully formed segments through a
//! caller-supplied [`SegmentSink`] and consumes raw inbound segments through
//! [`ArqConn::on_receive`].

mod conn;
mod rtt;
mod segment;

pub use conn::{
    ArqConn, ArqStats, CloseCause, SegmentSink, IDLE_TIMEOUT, KEEPALIVE_TICK, RETRANSMIT_TICK,
};
pub use rtt::{RttEstimator, INITIAL_RTO, MAX_RTO, MIN_RTO};
pub use segment::{Flag, Segment, HEADER_SIZE, MAX_SEGMENT};

/// Upper bound on unacknowledged segments in flight.
pub const MAX_IN_FLIGHT: usize = 256;

/// A segment is abandoned (and the connection torn down) after this many
/// retransmissions.
pub const MAX_RETRIES: u32 = 10;

/// Capacity of the in-order delivery queue to the upper layer.
pub const DELIVERY_QUEUE: usize = 64;

//! Substrate implementations.
//!
//! Two ways onto the wire, one server core:
//!
//! - **UDP**: raw datagrams, one envelope per datagram, reliability supplied
//!   by the ARQ engine. Ingress is fanned out to a fixed set of workers by a
//!   hash of the peer address, so packets from one peer are always processed
//!   in arrival order.
//! - **TCP**: the stream is already reliable; each envelope is wrapped in a
//!   2-byte big-endian length prefix instead.

mod frame;
mod tcp;
mod udp;

pub use frame::{encode_frame, FrameReader, FrameWriter, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use tcp::run_tcp_substrate;
pub use udp::{peer_hash, run_udp_substrate, WORKER_COUNT, WORKER_QUEUE};

use std::time::Duration;

/// Per-frame read deadline on the stream substrate.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Per-frame write deadline on the stream substrate.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

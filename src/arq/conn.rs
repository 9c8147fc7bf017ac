//! The ARQ connection state machine.
//!
//! One [`ArqConn`] per peer, symmetric on both endpoints. Send and receive
//! sides are guarded by separate locks, the RTT estimator by a third; no lock
//! is ever held across a sink invocation or an await point. Violating that
//! rule deadlocks the in-process loopback pair used by the tests, which is
//! exactly why they drive two connections through synchronous sinks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use crate::arq::rtt::RttEstimator;
use crate::arq::segment::{Flag, Segment, MAX_SEGMENT};
use crate::arq::{DELIVERY_QUEUE, MAX_IN_FLIGHT, MAX_RETRIES};
use crate::error::{Error, Result};

/// Interval between retransmission scans.
pub const RETRANSMIT_TICK: Duration = Duration::from_millis(50);

/// Interval between keepalive probes.
pub const KEEPALIVE_TICK: Duration = Duration::from_secs(15);

/// The connection is declared dead after this long without any inbound
/// segment.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Delivers a fully formed segment to the substrate.
///
/// Implementations must not assume any ARQ lock is held — and the connection
/// guarantees none is.
pub trait SegmentSink: Send + Sync + 'static {
    /// Emit one segment.
    fn send_segment(&self, frame: &[u8]) -> Result<()>;
}

impl<F> SegmentSink for F
where
    F: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
{
    fn send_segment(&self, frame: &[u8]) -> Result<()> {
        self(frame)
    }
}

/// Why a connection reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed locally or by a peer FIN
    Closed,
    /// Retransmit cap reached or liveness idle exceeded
    Timeout,
}

impl CloseCause {
    /// The error surfaced to callers blocked on this connection.
    pub fn to_error(self) -> Error {
        match self {
            CloseCause::Closed => Error::Closed,
            CloseCause::Timeout => Error::Timeout,
        }
    }
}

struct InFlight {
    payload: Bytes,
    sent_at: Instant,
    retries: u32,
}

struct SendState {
    next_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,
}

struct RecvState {
    next_seq: u32,
    out_of_order: BTreeMap<u32, Bytes>,
    last_received: Instant,
    delivery: Option<mpsc::Sender<Bytes>>,
}

/// Per-connection counters.
///
/// `rtt_samples` and `retransmits` together verify Karn's rule: a
/// retransmitted segment increments the latter and never the former.
#[derive(Default)]
pub struct ArqStats {
    /// Segments handed to the sink (first transmissions)
    pub segments_sent: AtomicU64,
    /// Segments accepted by `on_receive`
    pub segments_received: AtomicU64,
    /// Segments re-emitted by the retransmission timer
    pub retransmits: AtomicU64,
    /// Fresh samples consumed by the RTT estimator
    pub rtt_samples: AtomicU64,
    /// Payloads dropped because the delivery queue was full
    pub delivery_dropped: AtomicU64,
}

/// A reliable, ordered connection over an unreliable datagram substrate.
pub struct ArqConn {
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    rtt: RwLock<RttEstimator>,

    window_open: Notify,
    delivery_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,

    sink: Arc<dyn SegmentSink>,
    closed: AtomicBool,
    cause: Mutex<Option<CloseCause>>,
    stats: ArqStats,
}

impl ArqConn {
    /// Create a connection and spawn its retransmission and keepalive tasks.
    ///
    /// The background tasks hold only weak handles: dropping every `Arc`
    /// tears the connection down without further ceremony.
    pub fn new(sink: impl SegmentSink) -> Arc<Self> {
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE);

        let conn = Arc::new(Self {
            send: Mutex::new(SendState {
                next_seq: 1,
                in_flight: BTreeMap::new(),
            }),
            recv: Mutex::new(RecvState {
                next_seq: 1,
                out_of_order: BTreeMap::new(),
                last_received: Instant::now(),
                delivery: Some(delivery_tx),
            }),
            rtt: RwLock::new(RttEstimator::new()),
            window_open: Notify::new(),
            delivery_rx: tokio::sync::Mutex::new(delivery_rx),
            sink: Arc::new(sink),
            closed: AtomicBool::new(false),
            cause: Mutex::new(None),
            stats: ArqStats::default(),
        });

        tokio::spawn(Self::retransmit_loop(Arc::downgrade(&conn)));
        tokio::spawn(Self::keepalive_loop(Arc::downgrade(&conn)));

        conn
    }

    /// Send a payload, splitting it into segments of at most
    /// [`MAX_SEGMENT`](crate::arq::MAX_SEGMENT) bytes.
    ///
    /// Suspends while the in-flight window is full, until an ACK frees space
    /// or the connection closes.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        for chunk in payload.chunks(MAX_SEGMENT) {
            self.send_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn send_chunk(&self, chunk: &[u8]) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(self.close_error());
            }

            let frame = {
                let mut send = self.send.lock();
                if send.in_flight.len() < MAX_IN_FLIGHT {
                    let seq = send.next_seq;
                    send.next_seq += 1;

                    let payload = Bytes::copy_from_slice(chunk);
                    send.in_flight.insert(
                        seq,
                        InFlight {
                            payload: payload.clone(),
                            sent_at: Instant::now(),
                            retries: 0,
                        },
                    );
                    let ack = self.recv.lock().next_seq - 1;
                    Some(Segment::data(seq, ack, payload).encode())
                } else {
                    None
                }
            };

            match frame {
                Some(frame) => {
                    self.stats.segments_sent.fetch_add(1, Ordering::Relaxed);
                    // Lock released above: the sink may synchronously feed a
                    // loopback peer without deadlocking.
                    return self.sink.send_segment(&frame);
                }
                None => {
                    let notified = self.window_open.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // Re-check after registering, so an ACK landing in the
                    // gap cannot strand us.
                    if self.is_closed()
                        || self.send.lock().in_flight.len() < MAX_IN_FLIGHT
                    {
                        continue;
                    }
                    notified.await;
                }
            }
        }
    }

    /// Feed one raw inbound segment into the state machine.
    pub fn on_receive(&self, data: &[u8]) -> Result<()> {
        let seg = Segment::decode(data)?;
        self.stats.segments_received.fetch_add(1, Ordering::Relaxed);

        self.recv.lock().last_received = Instant::now();
        self.process_ack(seg.ack);

        match seg.flag {
            Flag::Data => self.handle_data(seg.seq, seg.payload),
            Flag::Ack | Flag::Pong => Ok(()),
            Flag::Ping => {
                let pong = Segment::pong().encode();
                self.sink.send_segment(&pong)
            }
            Flag::Fin => {
                self.close_with(CloseCause::Closed);
                Ok(())
            }
        }
    }

    /// Dequeue the next in-order payload, waiting until one is available or
    /// the connection closes.
    pub async fn recv(&self) -> Result<Bytes> {
        let mut rx = self.delivery_rx.lock().await;
        match rx.recv().await {
            Some(payload) => Ok(payload),
            None => Err(self.close_error()),
        }
    }

    /// Like [`recv`](Self::recv), with a bounded wait.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Close the connection. Idempotent; every call reports the cause
    /// recorded by the first.
    pub fn close(&self) -> CloseCause {
        self.close_with(CloseCause::Closed)
    }

    /// Whether the connection has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Counters for diagnostics and tests.
    pub fn stats(&self) -> &ArqStats {
        &self.stats
    }

    /// Current smoothed round-trip estimate.
    pub fn rtt(&self) -> Duration {
        self.rtt.read().srtt()
    }

    /// How long since the peer was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.recv.lock().last_received.elapsed()
    }

    fn close_error(&self) -> Error {
        self.cause.lock().unwrap_or(CloseCause::Closed).to_error()
    }

    fn close_with(&self, cause: CloseCause) -> CloseCause {
        {
            let mut slot = self.cause.lock();
            if let Some(existing) = *slot {
                return existing;
            }
            *slot = Some(cause);
            self.closed.store(true, Ordering::Release);
        }

        // Dropping the sender ends `recv` once queued payloads drain.
        self.recv.lock().delivery.take();

        // FIN is best-effort and sent outside every lock.
        let fin = Segment::fin().encode();
        let _ = self.sink.send_segment(&fin);

        self.window_open.notify_waiters();
        cause
    }

    /// Remove everything at or below `ack` from the in-flight window,
    /// sampling RTT only from never-retransmitted segments.
    fn process_ack(&self, ack: u32) {
        let mut samples = Vec::new();
        let mut freed = false;
        {
            let mut send = self.send.lock();
            let acked: Vec<u32> = send
                .in_flight
                .range(..=ack)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in acked {
                if let Some(entry) = send.in_flight.remove(&seq) {
                    if entry.retries == 0 {
                        samples.push(entry.sent_at.elapsed());
                    }
                    freed = true;
                }
            }
        }

        if !samples.is_empty() {
            let mut rtt = self.rtt.write();
            for sample in samples {
                rtt.on_sample(sample);
                self.stats.rtt_samples.fetch_add(1, Ordering::Relaxed);
            }
        }
        if freed {
            self.window_open.notify_waiters();
        }
    }

    fn handle_data(&self, seq: u32, payload: Bytes) -> Result<()> {
        let ack_value;
        {
            let mut recv = self.recv.lock();
            if seq < recv.next_seq {
                // Duplicate of something already delivered; just re-ack.
            } else if seq == recv.next_seq {
                Self::deliver(&mut recv, payload, &self.stats);
                recv.next_seq += 1;
                while let Some(buffered) = {
                    let next = recv.next_seq;
                    recv.out_of_order.remove(&next)
                } {
                    Self::deliver(&mut recv, buffered, &self.stats);
                    recv.next_seq += 1;
                }
            } else {
                // Out of order: buffer it, first arrival wins.
                recv.out_of_order.entry(seq).or_insert(payload);
            }
            ack_value = recv.next_seq - 1;
        }

        let ack = Segment::ack(ack_value).encode();
        self.sink.send_segment(&ack)
    }

    fn deliver(recv: &mut RecvState, payload: Bytes, stats: &ArqStats) {
        if payload.is_empty() {
            return;
        }
        if let Some(tx) = &recv.delivery {
            if tx.try_send(payload).is_err() {
                stats.delivery_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn retransmit_loop(conn: Weak<Self>) {
        let mut tick = tokio::time::interval(RETRANSMIT_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(conn) = conn.upgrade() else { return };
            if conn.is_closed() {
                return;
            }
            conn.tick_retransmit();
        }
    }

    /// Scan the in-flight window and re-emit at most one expired segment,
    /// backing the timeout off once per tick.
    fn tick_retransmit(&self) {
        let mut expired: Option<(u32, Bytes)> = None;
        let mut fatal = false;
        {
            let mut send = self.send.lock();
            let rto = self.rtt.read().rto();
            let now = Instant::now();
            for (&seq, entry) in send.in_flight.iter_mut() {
                if now.duration_since(entry.sent_at) > rto {
                    if entry.retries >= MAX_RETRIES {
                        fatal = true;
                        break;
                    }
                    entry.retries += 1;
                    entry.sent_at = now;
                    expired = Some((seq, entry.payload.clone()));
                    self.rtt.write().backoff();
                    break;
                }
            }
        }

        if fatal {
            self.close_with(CloseCause::Timeout);
            return;
        }

        if let Some((seq, payload)) = expired {
            self.stats.retransmits.fetch_add(1, Ordering::Relaxed);
            let ack = self.recv.lock().next_seq - 1;
            let frame = Segment::data(seq, ack, payload).encode();
            let _ = self.sink.send_segment(&frame);
        }
    }

    async fn keepalive_loop(conn: Weak<Self>) {
        let mut tick = tokio::time::interval(KEEPALIVE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(conn) = conn.upgrade() else { return };
            if conn.is_closed() {
                return;
            }
            if conn.idle_for() > IDLE_TIMEOUT {
                conn.close_with(CloseCause::Timeout);
                return;
            }
            let ping = Segment::ping().encode();
            let _ = conn.sink.send_segment(&ping);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A synchronous loopback: segments go straight into the peer's
    /// `on_receive` on the caller's stack. Any lock held across a sink call
    /// deadlocks here immediately.
    #[derive(Clone, Default)]
    struct Loopback {
        peer: Arc<Mutex<Option<Arc<ArqConn>>>>,
        drop_data_once: Arc<Mutex<std::collections::HashSet<u32>>>,
        lossy: bool,
    }

    impl Loopback {
        fn lossy() -> Self {
            Self {
                lossy: true,
                ..Self::default()
            }
        }
    }

    impl SegmentSink for Loopback {
        fn send_segment(&self, frame: &[u8]) -> Result<()> {
            if self.lossy {
                if let Ok(seg) = Segment::decode(frame) {
                    if seg.flag == Flag::Data && self.drop_data_once.lock().insert(seg.seq) {
                        // First transmission of each DATA segment is lost.
                        return Ok(());
                    }
                }
            }
            let peer = self.peer.lock().clone();
            if let Some(peer) = peer {
                let _ = peer.on_receive(frame);
            }
            Ok(())
        }
    }

    fn pair() -> (Arc<ArqConn>, Arc<ArqConn>) {
        pair_with(Loopback::default(), Loopback::default())
    }

    fn pair_with(a_sink: Loopback, b_sink: Loopback) -> (Arc<ArqConn>, Arc<ArqConn>) {
        let a = ArqConn::new(a_sink.clone());
        let b = ArqConn::new(b_sink.clone());
        *a_sink.peer.lock() = Some(b.clone());
        *b_sink.peer.lock() = Some(a.clone());
        (a, b)
    }

    #[tokio::test]
    async fn test_basic_send_recv() {
        let (a, b) = pair();
        a.send(b"Hello, ARQ!").await.unwrap();
        let got = b.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.as_ref(), b"Hello, ARQ!");
    }

    #[tokio::test]
    async fn test_ordered_delivery() {
        let (a, b) = pair();
        let messages = ["msg1", "msg2", "msg3", "msg4", "msg5"];
        for msg in messages {
            a.send(msg.as_bytes()).await.unwrap();
        }
        for expected in messages {
            let got = b.recv_timeout(Duration::from_secs(2)).await.unwrap();
            assert_eq!(got.as_ref(), expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_large_payload_reassembly() {
        let (a, b) = pair();
        let large: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        a.send(&large).await.unwrap();

        let mut result = Vec::new();
        let mut chunks = 0;
        while result.len() < large.len() {
            let chunk = b.recv_timeout(Duration::from_secs(2)).await.unwrap();
            result.extend_from_slice(&chunk);
            chunks += 1;
        }
        assert_eq!(result, large);
        assert!(chunks <= 5, "expected at most 5 chunks, got {chunks}");
    }

    #[tokio::test]
    async fn test_segmentation_boundary() {
        let (a, b) = pair();

        a.send(&vec![0xABu8; MAX_SEGMENT]).await.unwrap();
        let first = b.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(first.len(), MAX_SEGMENT);

        a.send(&vec![0xCDu8; MAX_SEGMENT + 1]).await.unwrap();
        let c1 = b.recv_timeout(Duration::from_secs(2)).await.unwrap();
        let c2 = b.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(c1.len(), MAX_SEGMENT);
        assert_eq!(c2.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_and_duplicates() {
        let sink = Loopback::default();
        let conn = ArqConn::new(sink);

        let s1 = Segment::data(1, 0, Bytes::from_static(b"first")).encode();
        let s2 = Segment::data(2, 0, Bytes::from_static(b"second")).encode();
        let s3 = Segment::data(3, 0, Bytes::from_static(b"third")).encode();

        // Arrival order: 3, 1, 3 (dup), 2
        conn.on_receive(&s3).unwrap();
        conn.on_receive(&s1).unwrap();
        conn.on_receive(&s3).unwrap();
        conn.on_receive(&s2).unwrap();

        for expected in [&b"first"[..], b"second", b"third"] {
            let got = conn.recv_timeout(Duration::from_secs(1)).await.unwrap();
            assert_eq!(got.as_ref(), expected);
        }
        // Nothing further: the duplicate was not delivered twice.
        assert!(conn
            .recv_timeout(Duration::from_millis(50))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retransmit_under_loss_and_karns_rule() {
        // Every DATA segment loses its first transmission.
        let (a, b) = pair_with(Loopback::lossy(), Loopback::default());

        a.send(b"survives loss").await.unwrap();
        let got = b.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.as_ref(), b"survives loss");

        // Delivered exactly once.
        assert!(b.recv_timeout(Duration::from_millis(100)).await.is_err());

        // The segment went out again, and its ACK produced no RTT sample.
        assert!(a.stats().retransmits.load(Ordering::Relaxed) >= 1);
        assert_eq!(a.stats().rtt_samples.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_rtt_sampled_on_clean_path() {
        let (a, b) = pair();
        a.send(b"clean").await.unwrap();
        b.recv_timeout(Duration::from_secs(2)).await.unwrap();

        assert_eq!(a.stats().retransmits.load(Ordering::Relaxed), 0);
        assert!(a.stats().rtt_samples.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_propagates() {
        let (a, b) = pair();

        assert_eq!(a.close(), CloseCause::Closed);
        assert_eq!(a.close(), CloseCause::Closed);
        assert!(a.is_closed());

        // FIN reached the peer.
        assert!(b.is_closed());

        // Waiters observe the terminal error.
        assert!(matches!(a.recv().await, Err(Error::Closed)));
        assert!(matches!(a.send(b"late").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let (_a, b) = pair();
        let err = b.recv_timeout(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (a, b) = pair();
        let before = b.stats().segments_received.load(Ordering::Relaxed);
        a.sink.send_segment(&Segment::ping().encode()).unwrap();
        // b received the ping; a received the pong it triggered.
        assert!(b.stats().segments_received.load(Ordering::Relaxed) > before);
        assert!(a.stats().segments_received.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_empty_send_is_a_no_op() {
        let (a, _b) = pair();
        a.send(b"").await.unwrap();
        assert_eq!(a.stats().segments_sent.load(Ordering::Relaxed), 0);
    }
}

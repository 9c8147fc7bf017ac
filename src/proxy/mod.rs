//! Per-request target connections and the bidirectional byte pump.
//!
//! Each CONNECT binds a peer-minted request id to one outbound socket. The
//! table owns the records; every record runs one relay task that pumps
//! peer→target writes off a bounded channel and wraps target→peer reads as
//! DATA responses. Records die on either side closing, on idle, or with the
//! enclosing session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::arq::ArqConn;
use crate::error::{Error, Result};
use crate::protocol::{
    build_close, build_data_response, target_of, Network, TargetAddr, STATUS_DIAL_FAILED,
    STATUS_OK,
};
use crate::server::ServerMetrics;

/// Deadline for dialing a target.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for each write toward a target.
pub const TARGET_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for each read from a target.
pub const TARGET_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Target records idle longer than this are reaped.
pub const TARGET_IDLE: Duration = Duration::from_secs(5 * 60);

/// Read chunk size for target→peer traffic.
pub const READ_CHUNK: usize = 32 * 1024;

/// Capacity of the per-record peer→target queue.
const FORWARD_QUEUE: usize = 64;

/// How a session sends control-protocol messages back to its peer.
///
/// The datagram variant goes through the session's ARQ; the stream variant
/// feeds a writer task that seals each message into a length-prefixed frame.
#[derive(Clone)]
pub enum PeerLink {
    /// Reliable path over the unreliable substrate
    Arq(Arc<ArqConn>),
    /// Queue drained by a stream-substrate writer task
    Framed(mpsc::Sender<Vec<u8>>),
}

impl PeerLink {
    /// Send one control-protocol message to the peer.
    pub async fn send(&self, msg: Vec<u8>) -> Result<()> {
        match self {
            PeerLink::Arq(arq) => arq.send(&msg).await,
            PeerLink::Framed(tx) => tx.send(msg).await.map_err(|_| Error::Closed),
        }
    }
}

/// One live outbound connection.
struct TargetRecord {
    req_id: u32,
    network: Network,
    peer: SocketAddr,
    last_activity: Mutex<Instant>,
}

impl TargetRecord {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

struct TargetEntry {
    record: Arc<TargetRecord>,
    forward_tx: mpsc::Sender<Vec<u8>>,
}

struct TableInner {
    targets: RwLock<HashMap<u32, TargetEntry>>,
    metrics: Arc<ServerMetrics>,
}

impl TableInner {
    /// The single removal path; keeps the active-target gauge honest no
    /// matter who tears the record down.
    fn remove(&self, req_id: u32) -> Option<TargetEntry> {
        let entry = self.targets.write().remove(&req_id);
        if entry.is_some() {
            self.metrics.on_target_closed();
        }
        entry
    }
}

/// The reqid-keyed table of target records for one peer session.
#[derive(Clone)]
pub struct TargetTable {
    inner: Arc<TableInner>,
}

impl TargetTable {
    /// Create an empty table reporting into the given collector.
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                targets: RwLock::new(HashMap::new()),
                metrics,
            }),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.inner.targets.read().len()
    }

    /// Whether the table has no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle a CONNECT: dial the target, write any initial payload, answer
    /// with a status byte, and start the relay.
    pub async fn open_target(
        &self,
        req_id: u32,
        network: Network,
        addr: &TargetAddr,
        port: u16,
        initial: Vec<u8>,
        link: PeerLink,
        peer: SocketAddr,
    ) {
        let target = target_of(addr, port);
        tracing::info!(%peer, req_id, %target, ?network, "connect");

        let mut io = match timeout(DIAL_TIMEOUT, dial(network, &target)).await {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => {
                tracing::debug!(req_id, %target, error = %e, "dial failed");
                let _ = link
                    .send(build_data_response(req_id, STATUS_DIAL_FAILED, &[]))
                    .await;
                return;
            }
            Err(_) => {
                tracing::debug!(req_id, %target, "dial timed out");
                let _ = link
                    .send(build_data_response(req_id, STATUS_DIAL_FAILED, &[]))
                    .await;
                return;
            }
        };

        if !initial.is_empty() {
            match timeout(TARGET_WRITE_TIMEOUT, io.write_all(&initial)).await {
                Ok(Ok(())) => {}
                _ => {
                    tracing::debug!(req_id, %target, "initial payload write failed");
                    let _ = link
                        .send(build_data_response(req_id, STATUS_DIAL_FAILED, &[]))
                        .await;
                    return;
                }
            }
        }

        let record = Arc::new(TargetRecord {
            req_id,
            network,
            peer,
            last_activity: Mutex::new(Instant::now()),
        });
        let (forward_tx, forward_rx) = mpsc::channel(FORWARD_QUEUE);

        // Replacing a reused reqid closes the previous record.
        if self
            .inner
            .targets
            .write()
            .insert(
                req_id,
                TargetEntry {
                    record: record.clone(),
                    forward_tx,
                },
            )
            .is_some()
        {
            self.inner.metrics.on_target_closed();
        }
        self.inner.metrics.on_target_opened();

        if link
            .send(build_data_response(req_id, STATUS_OK, &[]))
            .await
            .is_err()
        {
            self.close_target(req_id);
            return;
        }

        tokio::spawn(run_relay(
            record,
            io,
            forward_rx,
            link,
            Arc::downgrade(&self.inner),
        ));
    }

    /// Forward peer payload to a target; unknown reqids are dropped silently.
    pub async fn forward(&self, req_id: u32, payload: Vec<u8>) {
        let entry = {
            let targets = self.inner.targets.read();
            targets
                .get(&req_id)
                .map(|e| (e.record.clone(), e.forward_tx.clone()))
        };
        let Some((record, forward_tx)) = entry else {
            return;
        };

        record.touch();
        if forward_tx.send(payload).await.is_err() {
            self.close_target(req_id);
        }
    }

    /// Remove and close one record.
    pub fn close_target(&self, req_id: u32) {
        if let Some(entry) = self.inner.remove(req_id) {
            tracing::info!(
                peer = %entry.record.peer,
                req_id,
                network = ?entry.record.network,
                "target closed"
            );
        }
    }

    /// Close records idle longer than `max_idle`.
    pub fn reap_idle(&self, max_idle: Duration) {
        let expired: Vec<u32> = self
            .inner
            .targets
            .read()
            .values()
            .filter(|e| e.record.idle_for() > max_idle)
            .map(|e| e.record.req_id)
            .collect();
        for req_id in expired {
            tracing::debug!(req_id, "reaping idle target");
            self.close_target(req_id);
        }
    }

    /// Drop every record.
    pub fn close_all(&self) {
        let mut targets = self.inner.targets.write();
        for _ in targets.drain() {
            self.inner.metrics.on_target_closed();
        }
    }
}

/// An outbound socket of either flavor.
enum TargetIo {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl TargetIo {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            TargetIo::Tcp(stream) => stream.write_all(buf).await,
            TargetIo::Udp(socket) => socket.send(buf).await.map(|_| ()),
        }
    }
}

async fn dial(network: Network, target: &str) -> Result<TargetIo> {
    match network {
        Network::Tcp => {
            let stream = TcpStream::connect(target).await?;
            stream.set_nodelay(true)?;
            Ok(TargetIo::Tcp(stream))
        }
        Network::Udp => {
            let addr = tokio::net::lookup_host(target)
                .await?
                .next()
                .ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no address for target",
                    ))
                })?;
            let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            Ok(TargetIo::Udp(socket))
        }
    }
}

/// Pump bytes both ways until either side ends, then unregister and tell the
/// peer the stream is gone.
async fn run_relay(
    record: Arc<TargetRecord>,
    io: TargetIo,
    mut forward_rx: mpsc::Receiver<Vec<u8>>,
    link: PeerLink,
    table: Weak<TableInner>,
) {
    let req_id = record.req_id;

    match io {
        TargetIo::Tcp(stream) => {
            let (mut rd, mut wr) = stream.into_split();

            let to_target = async {
                while let Some(buf) = forward_rx.recv().await {
                    match timeout(TARGET_WRITE_TIMEOUT, wr.write_all(&buf)).await {
                        Ok(Ok(())) => record.touch(),
                        _ => break,
                    }
                }
            };

            let to_peer = async {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match timeout(TARGET_READ_TIMEOUT, rd.read(&mut buf)).await {
                        Ok(Ok(n)) if n > 0 => {
                            record.touch();
                            let resp = build_data_response(req_id, STATUS_OK, &buf[..n]);
                            if link.send(resp).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            };

            tokio::select! {
                _ = to_target => {}
                _ = to_peer => {}
            }
        }
        TargetIo::Udp(socket) => {
            let to_target = async {
                while let Some(buf) = forward_rx.recv().await {
                    match timeout(TARGET_WRITE_TIMEOUT, socket.send(&buf)).await {
                        Ok(Ok(_)) => record.touch(),
                        _ => break,
                    }
                }
            };

            let to_peer = async {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match timeout(TARGET_READ_TIMEOUT, socket.recv(&mut buf)).await {
                        Ok(Ok(n)) if n > 0 => {
                            record.touch();
                            let resp = build_data_response(req_id, STATUS_OK, &buf[..n]);
                            if link.send(resp).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            };

            tokio::select! {
                _ = to_target => {}
                _ = to_peer => {}
            }
        }
    }

    if let Some(inner) = table.upgrade() {
        inner.remove(req_id);
    }
    let _ = link.send(build_close(req_id)).await;
}

//! Per-peer session state for the datagram substrate.
//!
//! A session is keyed by the peer's stringified address and owns that peer's
//! ARQ connection plus its table of target records. Inbound envelopes are
//! opened, then fed to the session's ARQ; a per-session delivery loop pulls
//! reassembled control messages off the ARQ and dispatches them into the
//! proxy fabric. The map holds the only strong handles besides the delivery
//! loop itself, so removal plus close is the single teardown path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;

use crate::arq::ArqConn;
use crate::crypto::EnvelopeCipher;
use crate::error::Result;
use crate::protocol::ControlMessage;
use crate::proxy::{PeerLink, TargetTable, TARGET_IDLE};
use crate::server::ServerMetrics;

/// Sessions idle longer than this are retired.
pub const SESSION_IDLE: Duration = Duration::from_secs(10 * 60);

/// Interval between sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// State for one peer, alive as long as the peer is.
pub struct PeerSession {
    peer: SocketAddr,
    arq: Arc<ArqConn>,
    targets: TargetTable,
    last_activity: Mutex<Instant>,
}

impl PeerSession {
    /// The peer's network address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The session's reliable connection.
    pub fn arq(&self) -> &Arc<ArqConn> {
        &self.arq
    }

    /// The session's target records.
    pub fn targets(&self) -> &TargetTable {
        &self.targets
    }

    /// Time since the peer last produced a valid envelope.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Tear the session down: terminal ARQ close plus target cleanup.
    pub fn close(&self) {
        self.arq.close();
        self.targets.close_all();
    }
}

/// All live peer sessions for the datagram substrate.
pub struct SessionManager {
    envelope: Arc<EnvelopeCipher>,
    socket: Arc<UdpSocket>,
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    metrics: Arc<ServerMetrics>,
}

impl SessionManager {
    /// Create a manager bound to one UDP socket and envelope cipher.
    pub fn new(
        envelope: Arc<EnvelopeCipher>,
        socket: Arc<UdpSocket>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            envelope,
            socket,
            sessions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Process one inbound datagram.
    ///
    /// Envelope failures are absorbed silently: an observer must not be able
    /// to distinguish a phantom server from noise.
    pub fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        self.metrics.on_packet_in();

        let plaintext = match self.envelope.open(data) {
            Ok(p) => p,
            Err(e) => {
                self.metrics.on_open_failure();
                tracing::debug!(%from, error = %e, "dropping undecipherable datagram");
                return;
            }
        };

        let session = self.session_for(from);
        session.touch();
        if let Err(e) = session.arq.on_receive(&plaintext) {
            tracing::debug!(%from, error = %e, "invalid segment");
        }
    }

    /// Look up the peer's session, provisioning one on first contact.
    fn session_for(&self, from: SocketAddr) -> Arc<PeerSession> {
        let key = from.to_string();
        if let Some(session) = self.sessions.read().get(&key) {
            return session.clone();
        }

        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(&key) {
            return session.clone();
        }

        // The sink captures only the substrate handle and the peer address;
        // sealing happens here so ARQ never sees key material.
        let envelope = self.envelope.clone();
        let socket = self.socket.clone();
        let sink_metrics = self.metrics.clone();
        let sink = move |frame: &[u8]| -> Result<()> {
            let sealed = envelope.seal(frame)?;
            match socket.try_send_to(&sealed, from) {
                Ok(_) => {
                    sink_metrics.on_packet_out();
                    Ok(())
                }
                // Full socket buffer is datagram loss; ARQ recovers.
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e.into()),
            }
        };

        let session = Arc::new(PeerSession {
            peer: from,
            arq: ArqConn::new(sink),
            targets: TargetTable::new(Arc::clone(&self.metrics)),
            last_activity: Mutex::new(Instant::now()),
        });
        sessions.insert(key, session.clone());
        self.metrics.on_session_opened();
        tracing::info!(peer = %from, "session opened");

        tokio::spawn(Self::delivery_loop(session.clone()));
        session
    }

    /// Pull reassembled messages off the session's ARQ and dispatch them.
    async fn delivery_loop(session: Arc<PeerSession>) {
        let link = PeerLink::Arq(session.arq.clone());
        loop {
            let msg = match session.arq.recv().await {
                Ok(msg) => msg,
                Err(_) => break,
            };
            session.touch();

            match ControlMessage::parse(&msg) {
                Ok(ControlMessage::Connect {
                    req_id,
                    network,
                    addr,
                    port,
                    initial,
                }) => {
                    session
                        .targets
                        .open_target(
                            req_id,
                            network,
                            &addr,
                            port,
                            initial,
                            link.clone(),
                            session.peer,
                        )
                        .await;
                }
                Ok(ControlMessage::Data { req_id, payload }) => {
                    session.targets.forward(req_id, payload).await;
                }
                Ok(ControlMessage::Close { req_id }) => {
                    session.targets.close_target(req_id);
                }
                // A probe or a buggy variant; the session survives it.
                Err(e) => {
                    tracing::debug!(peer = %session.peer, error = %e, "unparseable control message");
                }
            }
        }
        session.targets.close_all();
        tracing::debug!(peer = %session.peer, "delivery loop ended");
    }

    /// Periodic sweep with the production thresholds.
    pub fn sweep(&self) {
        self.reap_idle(SESSION_IDLE, TARGET_IDLE);
    }

    /// Retire sessions idle past `session_idle` (or with a dead ARQ) and
    /// targets idle past `target_idle`.
    pub fn reap_idle(&self, session_idle: Duration, target_idle: Duration) {
        let expired: Vec<(String, Arc<PeerSession>)> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.arq.is_closed() || s.idle_for() > session_idle)
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        if !expired.is_empty() {
            let mut sessions = self.sessions.write();
            for (key, _) in &expired {
                sessions.remove(key);
            }
        }
        for (_, session) in expired {
            session.close();
            self.metrics.on_session_closed();
            tracing::info!(peer = %session.peer, "session retired");
        }

        for session in self.sessions.read().values() {
            session.targets.reap_idle(target_idle);
        }
    }

    /// Close every session (shutdown path).
    pub fn close_all(&self) {
        let drained: Vec<Arc<PeerSession>> = {
            let mut sessions = self.sessions.write();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.close();
            self.metrics.on_session_closed();
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

//! UDP substrate with per-peer ordered processing.
//!
//! One task reads datagrams and fans them out to a fixed set of workers by a
//! hash of the sender address, so every packet from a given peer is handled
//! by the same worker in arrival order. Worker queues are bounded; overflow
//! is dropped, which is just datagram loss as far as the peer can tell.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::server::ServerMetrics;
use crate::session::SessionManager;

/// Number of ingress workers.
pub const WORKER_COUNT: usize = 8;

/// Per-worker queue capacity.
pub const WORKER_QUEUE: usize = 1024;

/// Largest datagram we will accept.
const MAX_DATAGRAM: usize = 65535;

/// Hash a peer address onto a worker index domain.
///
/// Multiply-by-31 over the IP bytes, then the port, absolute value. Stable
/// per peer, which is all the fan-out needs.
pub fn peer_hash(addr: &SocketAddr) -> usize {
    let mut h: i64 = 0;
    match addr.ip() {
        IpAddr::V4(ip) => {
            for b in ip.octets() {
                h = h.wrapping_mul(31).wrapping_add(i64::from(b));
            }
        }
        IpAddr::V6(ip) => {
            for b in ip.octets() {
                h = h.wrapping_mul(31).wrapping_add(i64::from(b));
            }
        }
    }
    h = h.wrapping_mul(31).wrapping_add(i64::from(addr.port()));
    h.unsigned_abs() as usize
}

/// Run the datagram substrate until shutdown.
pub async fn run_udp_substrate(
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionManager>,
    metrics: Arc<ServerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers = Vec::with_capacity(WORKER_COUNT);
    for _ in 0..WORKER_COUNT {
        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(WORKER_QUEUE);
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Some((data, from)) = rx.recv().await {
                sessions.handle_packet(&data, from);
            }
        });
        workers.push(tx);
    }

    tracing::info!(workers = WORKER_COUNT, "udp substrate running");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((0, _)) => continue,
                    Ok((n, from)) => {
                        let idx = peer_hash(&from) % WORKER_COUNT;
                        if workers[idx].try_send((buf[..n].to_vec(), from)).is_err() {
                            metrics.on_worker_drop();
                            tracing::debug!(worker = idx, %from, "worker queue full, dropping datagram");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "udp receive error");
                    }
                }
            }
        }
    }

    tracing::info!("udp substrate stopped");
    // Dropping the senders drains and ends the workers.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arq::ArqConn;
    use crate::crypto::{generate_psk, EnvelopeCipher};
    use crate::error::Result;
    use crate::protocol::{build_close, build_data_response, STATUS_OK, TYPE_CONNECT, TYPE_DATA};
    use bytes::BufMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_peer_hash_is_stable() {
        let a = addr("10.1.2.3:5000");
        assert_eq!(peer_hash(&a), peer_hash(&a));
    }

    #[test]
    fn test_peer_hash_distinguishes_port_and_ip() {
        assert_ne!(
            peer_hash(&addr("10.1.2.3:5000")),
            peer_hash(&addr("10.1.2.3:5001"))
        );
        assert_ne!(
            peer_hash(&addr("10.1.2.3:5000")),
            peer_hash(&addr("10.1.2.4:5000"))
        );
    }

    #[test]
    fn test_peer_hash_handles_ipv6() {
        let a = addr("[2001:db8::1]:443");
        let b = addr("[2001:db8::2]:443");
        assert_eq!(peer_hash(&a), peer_hash(&a));
        assert_ne!(peer_hash(&a), peer_hash(&b));
    }

    #[test]
    fn test_worker_index_in_range() {
        for port in 0..1000u16 {
            let a = SocketAddr::new(IpAddr::V4([192, 168, 0, 1].into()), port);
            assert!(peer_hash(&a) % WORKER_COUNT < WORKER_COUNT);
        }
    }

    async fn spawn_echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn connect_msg(req_id: u32, target: SocketAddr, initial: &[u8]) -> Vec<u8> {
        let mut msg = vec![TYPE_CONNECT];
        msg.put_u32(req_id);
        msg.put_u8(0x01); // tcp
        msg.put_u8(0x01); // ipv4
        match target.ip() {
            IpAddr::V4(ip) => msg.put_slice(&ip.octets()),
            IpAddr::V6(_) => unreachable!(),
        }
        msg.put_u16(target.port());
        msg.put_slice(initial);
        msg
    }

    /// Full CONNECT/DATA/CLOSE cycle through the datagram substrate, driving
    /// the server with a real ARQ peer over loopback UDP.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_udp_connect_data_cycle() {
        let target = spawn_echo_target().await;

        let psk = generate_psk();
        let envelope = Arc::new(EnvelopeCipher::new(&psk, 30).unwrap());
        let server_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server_sock.local_addr().unwrap();
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&envelope),
            Arc::clone(&server_sock),
            Arc::new(ServerMetrics::new()),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_udp_substrate(
            server_sock,
            Arc::clone(&sessions),
            Arc::new(ServerMetrics::new()),
            shutdown_rx,
        ));

        // Client side: its own envelope cipher and ARQ endpoint.
        let client_env = Arc::new(EnvelopeCipher::new(&psk, 30).unwrap());
        let client_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        client_sock.connect(server_addr).await.unwrap();

        let sink_env = Arc::clone(&client_env);
        let sink_sock = Arc::clone(&client_sock);
        let client_arq = ArqConn::new(move |frame: &[u8]| -> Result<()> {
            let sealed = sink_env.seal(frame)?;
            match sink_sock.try_send(&sealed) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e.into()),
            }
        });

        let pump_sock = Arc::clone(&client_sock);
        let pump_env = Arc::clone(&client_env);
        let pump_arq = Arc::clone(&client_arq);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let Ok(n) = pump_sock.recv(&mut buf).await else {
                    break;
                };
                if let Ok(plaintext) = pump_env.open(&buf[..n]) {
                    let _ = pump_arq.on_receive(&plaintext);
                }
            }
        });

        // CONNECT with an initial payload; the status reply arrives first.
        client_arq
            .send(&connect_msg(7, target, b"ping"))
            .await
            .unwrap();
        let status = client_arq
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.as_ref(), &build_data_response(7, STATUS_OK, &[])[..]);

        // The echoed initial payload follows as a DATA response.
        let echoed = client_arq
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            echoed.as_ref(),
            &build_data_response(7, STATUS_OK, b"ping")[..]
        );

        // DATA forwarding round-trips too.
        let mut data = vec![TYPE_DATA];
        data.put_u32(7);
        data.put_slice(b"again");
        client_arq.send(&data).await.unwrap();
        let echoed = client_arq
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            echoed.as_ref(),
            &build_data_response(7, STATUS_OK, b"again")[..]
        );

        // CLOSE tears the stream down server-side.
        client_arq.send(&build_close(7)).await.unwrap();

        let _ = shutdown_tx.send(true);
    }
}

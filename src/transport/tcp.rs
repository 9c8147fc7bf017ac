//! TCP substrate: length-prefixed envelopes over an already-reliable stream.
//!
//! Each connection is its own session: the ARQ layer is bypassed, a writer
//! task seals outbound messages into frames, and the read loop feeds opened
//! envelopes straight to the control protocol. A stream peer that cannot
//! produce valid ciphertext is presumed hostile and disconnected.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::crypto::EnvelopeCipher;
use crate::error::{Error, Result};
use crate::protocol::ControlMessage;
use crate::proxy::{PeerLink, TargetTable};
use crate::server::ServerMetrics;
use crate::transport::{FrameReader, FrameWriter, READ_TIMEOUT, WRITE_TIMEOUT};

/// Capacity of the per-connection response queue feeding the writer task.
const RESPONSE_QUEUE: usize = 256;

/// Run the stream substrate until shutdown.
pub async fn run_tcp_substrate(
    listener: TcpListener,
    envelope: Arc<EnvelopeCipher>,
    metrics: Arc<ServerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("tcp substrate running");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let envelope = Arc::clone(&envelope);
                        let metrics = Arc::clone(&metrics);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            metrics.on_stream_opened();
                            if let Err(e) =
                                handle_stream(stream, peer, envelope, Arc::clone(&metrics), shutdown)
                                    .await
                            {
                                tracing::debug!(%peer, error = %e, "stream session ended");
                            }
                            metrics.on_stream_closed();
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                    }
                }
            }
        }
    }

    tracing::info!("tcp substrate stopped");
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    envelope: Arc<EnvelopeCipher>,
    metrics: Arc<ServerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    tracing::debug!(%peer, "stream session opened");

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, READ_TIMEOUT);
    let mut writer = FrameWriter::new(write_half, WRITE_TIMEOUT);

    // Writer task: seals each outbound message and frames it. Ends when the
    // last sender (link clones held by target relays) is gone.
    let (response_tx, mut response_rx) = mpsc::channel::<Vec<u8>>(RESPONSE_QUEUE);
    let writer_envelope = Arc::clone(&envelope);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = response_rx.recv().await {
            let sealed = match writer_envelope.seal(&msg) {
                Ok(sealed) => sealed,
                Err(e) => {
                    tracing::debug!(error = %e, "seal failed");
                    break;
                }
            };
            if writer.write_frame(&sealed).await.is_err() {
                break;
            }
        }
    });

    let link = PeerLink::Framed(response_tx);
    let targets = TargetTable::new(Arc::clone(&metrics));

    let result = loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            frame = reader.read_frame() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        let plaintext = match envelope.open(&frame) {
            Ok(plaintext) => plaintext,
            Err(e) if e.is_auth_failure() => {
                metrics.on_open_failure();
                break Err(e);
            }
            Err(e) => {
                // Under-length envelope inside a well-formed frame; skip it.
                tracing::debug!(%peer, error = %e, "unopenable frame");
                continue;
            }
        };

        match ControlMessage::parse(&plaintext) {
            Ok(ControlMessage::Connect {
                req_id,
                network,
                addr,
                port,
                initial,
            }) => {
                targets
                    .open_target(req_id, network, &addr, port, initial, link.clone(), peer)
                    .await;
            }
            Ok(ControlMessage::Data { req_id, payload }) => {
                targets.forward(req_id, payload).await;
            }
            Ok(ControlMessage::Close { req_id }) => {
                targets.close_target(req_id);
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "unparseable control message");
            }
        }
    };

    targets.close_all();
    drop(link);
    let _ = writer_task.await;
    tracing::debug!(%peer, "stream session closed");
    result
}

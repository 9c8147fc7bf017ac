//! Server wiring.
//!
//! Binds both substrates on the configured address, provisions the shared
//! envelope cipher, and runs the background maintenance loop (replay-ledger
//! eviction plus session/target reaping). Shutdown is a watch channel that
//! every loop observes at its next suspension point.

mod metrics;

pub use metrics::{MetricsSnapshot, ServerMetrics};

use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use crate::config::Config;
use crate::crypto::EnvelopeCipher;
use crate::error::Result;
use crate::session::{SessionManager, SWEEP_INTERVAL};
use crate::transport::{run_tcp_substrate, run_udp_substrate};

/// Main server instance.
pub struct Server {
    config: Config,
    envelope: Arc<EnvelopeCipher>,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Create a server from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let envelope = Arc::new(EnvelopeCipher::new(&config.psk, config.time_window)?);
        Ok(Self {
            config,
            envelope,
            metrics: Arc::new(ServerMetrics::new()),
        })
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Bind both substrates and serve until the shutdown signal flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listen = self.config.listen_addr();

        let udp = Arc::new(UdpSocket::bind(&listen).await?);
        let tcp = TcpListener::bind(&listen).await?;
        tracing::info!(%listen, "phantom server listening (udp + tcp)");

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&self.envelope),
            Arc::clone(&udp),
            Arc::clone(&self.metrics),
        ));

        // Maintenance: replay/subkey eviction and idle reaping share a tick.
        let maint_envelope = Arc::clone(&self.envelope);
        let maint_sessions = Arc::clone(&sessions);
        let mut maint_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = maint_shutdown.changed() => return,
                    _ = tick.tick() => {
                        maint_envelope.maintain();
                        maint_sessions.sweep();
                    }
                }
            }
        });

        tokio::join!(
            run_udp_substrate(
                udp,
                Arc::clone(&sessions),
                Arc::clone(&self.metrics),
                shutdown.clone(),
            ),
            run_tcp_substrate(
                tcp,
                Arc::clone(&self.envelope),
                Arc::clone(&self.metrics),
                shutdown,
            ),
        );

        // Orderly teardown: every session emits FIN best-effort.
        sessions.close_all();
        tracing::info!("server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_psk;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".into(),
            psk: generate_psk(),
            time_window: 30,
            log_level: "info".into(),
        }
    }

    #[test]
    fn test_new_validates_config() {
        assert!(Server::new(test_config()).is_ok());

        let mut bad = test_config();
        bad.psk = "AAAA".into();
        assert!(Server::new(bad).is_err());
    }

    #[tokio::test]
    async fn test_run_binds_and_shuts_down() {
        let server = Server::new(test_config()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { server.run(shutdown_rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("shutdown should be prompt")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_is_an_error() {
        let mut config = test_config();
        config.listen = "256.256.256.256:1".into();
        let server = Server::new(config).unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(server.run(rx).await.is_err());
    }
}

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::Shared;
use crate::error::RelayError;
use crate::network::tls::TlsConfig;

/// Time allowed for an inbound TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts inbound peers and hands them to the client as non-reconnecting handlers
pub struct Listener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl Listener {
    pub async fn bind(bind_addr: &str, tls: &TlsConfig) -> Result<Self, RelayError> {
        let acceptor = tls.acceptor().ok_or(RelayError::NoServerIdentity)?;
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub(crate) async fn run(self, shared: Weak<Shared>, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("👂 Listening for peers on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("❌ Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = stream.set_nodelay(true);
                let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream));
                let tls = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = handshake => match result {
                        Ok(Ok(tls)) => tls,
                        Ok(Err(e)) => {
                            debug!("❌ TLS handshake with {} failed: {}", remote, e);
                            return;
                        }
                        Err(_) => {
                            debug!("⏱️ TLS handshake with {} timed out", remote);
                            return;
                        }
                    }
                };

                if let Some(shared) = shared.upgrade() {
                    shared.register_inbound(TlsStream::from(tls), remote).await;
                }
            });
        }

        info!("👂 Listener stopped");
    }
}

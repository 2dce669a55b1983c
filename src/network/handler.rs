//! Peer connection handler.
//!
//! One `Handler` owns one TLS connection to one peer. Outbound handlers may
//! reconnect with jittered exponential backoff; inbound handlers (accepted by
//! the listener) close for good when their link drops. Every received frame
//! is handed to a [`FrameSink`], normally the owning client.
//!
//! Writes never block the caller: `send` queues the frame on a bounded
//! per-link queue drained by a writer task. A full queue drops the frame.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_rustls::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::network::connection_state::{Backoff, ConnectionStateMachine, HandlerState};
use crate::network::tls::TlsConfig;
use crate::network::wire;

pub type PeerStream = TlsStream<TcpStream>;

/// Upper bound on a single frame write before the link is considered dead
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames waiting for the writer task of one link
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Time allowed for the TLS close_notify when a link ends
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiver of frames read by handlers
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Called once per received frame body, in stream order for each handler.
    async fn on_frame(&self, origin: &str, body: Bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

pub struct Handler {
    /// Peer key: dialed `host:port` or the accepted remote address
    peer: String,
    direction: Direction,
    state: ConnectionStateMachine,
    reconnect: AtomicBool,
    /// Queue feeding the current link's writer task
    outbound: SyncMutex<Option<mpsc::Sender<Bytes>>>,
    /// Cancelled when the current link must be torn down
    link: SyncMutex<CancellationToken>,
    shutdown: CancellationToken,
    reconnects: AtomicU32,
    frames_rx: AtomicU64,
    frames_tx: AtomicU64,
}

impl Handler {
    fn new(peer: String, direction: Direction, reconnect: bool, shutdown: CancellationToken) -> Self {
        Self {
            state: ConnectionStateMachine::new(peer.clone()),
            peer,
            direction,
            reconnect: AtomicBool::new(reconnect),
            outbound: SyncMutex::new(None),
            link: SyncMutex::new(CancellationToken::new()),
            shutdown,
            reconnects: AtomicU32::new(0),
            frames_rx: AtomicU64::new(0),
            frames_tx: AtomicU64::new(0),
        }
    }

    /// Dial `peer` and start the receive loop.
    ///
    /// If the first handshake fails and `reconnect` is set, the handler is
    /// still returned and keeps retrying in the background. Otherwise the
    /// failure is returned.
    pub async fn connect(
        peer: &str,
        tls: Arc<TlsConfig>,
        sink: Weak<dyn FrameSink>,
        reconnect: bool,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, RelayError> {
        let handler = Arc::new(Self::new(
            peer.to_string(),
            Direction::Outbound,
            reconnect,
            parent.child_token(),
        ));

        info!("🔗 [OUTBOUND] Connecting to {}", peer);

        let reader = match tls.dial(peer).await {
            Ok(stream) => {
                info!("✅ [OUTBOUND] Connected to {}", peer);
                Some(handler.install(stream))
            }
            Err(e) if reconnect => {
                // stays Connecting while the background retries run
                warn!("⚠️ [OUTBOUND] Initial connection to {} failed, will retry: {}", peer, e);
                None
            }
            Err(e) => {
                handler.state.mark_closed();
                return Err(RelayError::Connect {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        tokio::spawn(handler.clone().run(Some(tls), sink, reader));
        Ok(handler)
    }

    /// Adopt an accepted inbound stream and start the receive loop.
    pub async fn accept(
        stream: PeerStream,
        remote: SocketAddr,
        sink: Weak<dyn FrameSink>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let handler = Arc::new(Self::new(
            remote.to_string(),
            Direction::Inbound,
            false,
            parent.child_token(),
        ));

        let reader = handler.install(stream);
        info!("🔗 [INBOUND] Accepted connection from {}", remote);

        tokio::spawn(handler.clone().run(None, sink, Some(reader)));
        handler
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> HandlerState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Closed for good; maintenance reaps these
    pub fn is_dead(&self) -> bool {
        self.state().is_closed()
    }

    /// Successful re-dials after a lost link
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_rx.load(Ordering::Relaxed)
    }

    /// Frames accepted into the outbound queue
    pub fn frames_sent(&self) -> u64 {
        self.frames_tx.load(Ordering::Relaxed)
    }

    /// Queue a pre-encoded frame for the writer task. Never waits: false when
    /// not connected or when the link's queue is full.
    pub fn send(&self, frame: Bytes) -> bool {
        if !self.is_connected() {
            return false;
        }

        let outbound = self.outbound.lock();
        let Some(queue) = outbound.as_ref() else {
            return false;
        };

        match queue.try_send(frame) {
            Ok(()) => {
                self.frames_tx.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("⚠️ Outbound queue to {} full, dropping frame", self.peer);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop reconnecting, end the receive loop and shut the socket down.
    pub async fn close(&self) {
        self.reconnect.store(false, Ordering::SeqCst);
        // the link token is a child, so this also stops the writer task
        self.shutdown.cancel();
        self.outbound.lock().take();

        if self.state.mark_closed() {
            info!("🔌 Closed connection to {}", self.peer);
        }
    }

    /// Split the stream, start a writer task on a fresh link token and mark connected.
    fn install(&self, stream: PeerStream) -> ReadHalf<PeerStream> {
        let (reader, writer) = tokio::io::split(stream);
        let link = self.shutdown.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        *self.link.lock() = link.clone();
        *self.outbound.lock() = Some(queue_tx);
        tokio::spawn(write_loop(self.peer.clone(), writer, queue_rx, link));

        self.state.mark_connected();
        reader
    }

    fn teardown_link(&self) {
        self.link.lock().cancel();
        self.outbound.lock().take();
    }

    async fn run(
        self: Arc<Self>,
        tls: Option<Arc<TlsConfig>>,
        sink: Weak<dyn FrameSink>,
        mut reader: Option<ReadHalf<PeerStream>>,
    ) {
        let mut backoff = Backoff::default();

        'session: loop {
            let mut rd = match reader.take() {
                Some(rd) => rd,
                None => {
                    let Some(tls) = tls.as_ref() else { break };
                    if !self.reconnect.load(Ordering::SeqCst) {
                        break;
                    }

                    let delay = backoff.next_delay();
                    debug!(
                        "⏳ Reconnecting to {} in {:?} (attempt {})",
                        self.peer,
                        delay,
                        backoff.attempt()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    if !self.state().is_connecting() {
                        self.state.mark_connecting();
                    }
                    let dialed = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        dialed = tls.dial(&self.peer) => dialed,
                    };

                    match dialed {
                        Ok(stream) => {
                            backoff.reset();
                            self.reconnects.fetch_add(1, Ordering::Relaxed);
                            info!("🔄 Reconnected to {}", self.peer);
                            self.install(stream)
                        }
                        Err(e) => {
                            debug!("❌ Reconnect to {} failed: {}", self.peer, e);
                            self.state.mark_disconnected();
                            continue;
                        }
                    }
                }
            };

            let link = self.link.lock().clone();
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'session,
                    _ = link.cancelled() => {
                        debug!("🔌 Link to {} torn down after write failure", self.peer);
                        break;
                    }
                    result = wire::read_frame(&mut rd) => match result {
                        Ok(Some(body)) => {
                            self.frames_rx.fetch_add(1, Ordering::Relaxed);
                            match sink.upgrade() {
                                Some(sink) => sink.on_frame(&self.peer, body).await,
                                None => break 'session,
                            }
                        }
                        Ok(None) => {
                            info!("🔌 [{:?}] Connection to {} closed by peer (EOF)", self.direction, self.peer);
                            break;
                        }
                        Err(e) => {
                            warn!("❌ [{:?}] Error reading from {}: {}", self.direction, self.peer, e);
                            break;
                        }
                    }
                }
            }

            drop(rd);
            self.teardown_link();
            if self.shutdown.is_cancelled() {
                break;
            }
            self.state.mark_disconnected();
        }

        self.teardown_link();
        if self.state.mark_closed() {
            info!("🔌 [{:?}] Handler for {} stopped", self.direction, self.peer);
        }
    }
}

/// Drain one link's outbound queue. A failed or stalled write tears the link down.
async fn write_loop(
    peer: String,
    mut writer: WriteHalf<PeerStream>,
    mut queue: mpsc::Receiver<Bytes>,
    link: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = link.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = link.cancelled() => break,
            written = tokio::time::timeout(SEND_TIMEOUT, wire::write_frame(&mut writer, &frame)) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("❌ Write to {} failed: {}", peer, e);
                link.cancel();
                break;
            }
            Err(_) => {
                warn!("⏱️ Write to {} stalled for {:?}, dropping link", peer, SEND_TIMEOUT);
                link.cancel();
                break;
            }
        }
    }

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tls::PeerVerification;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<(String, Bytes)>);

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn on_frame(&self, origin: &str, body: Bytes) {
            let _ = self.0.send((origin.to_string(), body));
        }
    }

    fn tls() -> Arc<TlsConfig> {
        Arc::new(
            TlsConfig::new_self_signed(
                vec!["localhost".to_string()],
                PeerVerification::InsecureSkipVerify,
            )
            .unwrap(),
        )
    }

    async fn wait_for(handler: &Handler, pred: impl Fn(HandlerState) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !pred(handler.state()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler did not reach expected state");
    }

    #[tokio::test]
    async fn test_connect_failure_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn FrameSink> = Arc::new(ChannelSink(tx));
        let result = Handler::connect(
            &addr.to_string(),
            tls(),
            Arc::downgrade(&sink),
            false,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(RelayError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_with_reconnect_returns_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn FrameSink> = Arc::new(ChannelSink(tx));
        let handler = Handler::connect(
            &addr.to_string(),
            tls(),
            Arc::downgrade(&sink),
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!handler.is_connected());
        assert!(!handler.is_dead());
        // retries run in the background while the handler reports Connecting
        assert!(handler.state().is_connecting());
        assert!(!handler.send(Bytes::from_static(b"\x00\x00")));

        handler.close().await;
        assert!(handler.is_dead());
        // idempotent
        handler.close().await;
        assert!(handler.is_dead());
    }

    #[tokio::test]
    async fn test_frames_reach_sink_and_send_writes() {
        let tls = tls();
        let acceptor = tls.acceptor().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(stream).await.unwrap();
            // push one frame to the client, then echo what it sends
            wire::write_frame(&mut stream, &wire::encode_frame(b"from server").unwrap())
                .await
                .unwrap();
            let body = wire::read_frame(&mut stream).await.unwrap().unwrap();
            let _ = server_tx.send(body);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn FrameSink> = Arc::new(ChannelSink(tx));
        let handler = Handler::connect(
            &addr.to_string(),
            tls,
            Arc::downgrade(&sink),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(handler.is_connected());

        let (origin, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(origin, addr.to_string());
        assert_eq!(body.as_ref(), b"from server");

        assert!(handler.send(wire::encode_frame(b"from client").unwrap()));
        let echoed = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.as_ref(), b"from client");
        assert_eq!(handler.frames_sent(), 1);
        assert_eq!(handler.frames_received(), 1);

        handler.close().await;
    }

    #[tokio::test]
    async fn test_non_reconnecting_handler_closes_on_eof() {
        let tls = tls();
        let acceptor = tls.acceptor().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(stream).await.unwrap();
            let _ = stream.shutdown().await;
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn FrameSink> = Arc::new(ChannelSink(tx));
        let handler = Handler::connect(
            &addr.to_string(),
            tls,
            Arc::downgrade(&sink),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        wait_for(&handler, |s| s.is_closed()).await;
        assert!(handler.is_dead());
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_drops_link() {
        let tls = tls();
        let acceptor = tls.acceptor().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // first session: drop right after the handshake
            let (stream, _) = listener.accept().await.unwrap();
            let mut first = acceptor.accept(stream).await.unwrap();
            let _ = first.shutdown().await;
            drop(first);

            // second session: stay up and report the first frame
            let (stream, _) = listener.accept().await.unwrap();
            let mut second = acceptor.accept(stream).await.unwrap();
            let body = wire::read_frame(&mut second).await.unwrap().unwrap();
            let _ = server_tx.send(body);
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn FrameSink> = Arc::new(ChannelSink(tx));
        let handler = Handler::connect(
            &addr.to_string(),
            tls,
            Arc::downgrade(&sink),
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while handler.reconnects() == 0 || !handler.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler did not reconnect");

        assert!(handler.send(wire::encode_frame(b"after reconnect").unwrap()));
        let body = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body.as_ref(), b"after reconnect");

        handler.close().await;
        assert!(handler.is_dead());
    }

    #[tokio::test]
    async fn test_send_never_waits_on_stalled_peer() {
        let tls = tls();
        let acceptor = tls.acceptor().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // completes the handshake, then never reads
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _stalled = acceptor.accept(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn FrameSink> = Arc::new(ChannelSink(tx));
        let handler = Handler::connect(
            &addr.to_string(),
            tls,
            Arc::downgrade(&sink),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let frame = wire::encode_frame(&vec![0u8; 60_000]).unwrap();
        let started = std::time::Instant::now();
        let mut rejected = 0;
        for _ in 0..(OUTBOUND_QUEUE_CAPACITY * 4) {
            if !handler.send(frame.clone()) {
                rejected += 1;
            }
            tokio::task::yield_now().await;
        }

        // well under SEND_TIMEOUT: no send waited for the socket
        assert!(started.elapsed() < Duration::from_secs(4));
        // the socket buffers fill up, then the queue, then frames are dropped
        assert!(rejected > 0);
        handler.close().await;
    }
}

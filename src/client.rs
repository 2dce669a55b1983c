//! Relay client: owns the peer handlers, the dedup cache and the inbound queue.
//!
//! Every packet that arrives from any peer is checked against the dedup cache.
//! A new packet is re-broadcast byte-for-byte to every other peer and then
//! delivered to the application through [`Client::accept`]. Duplicates are
//! dropped, which also stops relay loops in a cyclic overlay.
//!
//! Relaying never waits on the application or on a slow peer: deliveries are
//! dropped when the inbound queue is full, and writes go to per-peer queues.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::RelayError;
use crate::network::connection_state::HandlerState;
use crate::network::dedup::DedupCache;
use crate::network::handler::{Direction, FrameSink, Handler, PeerStream};
use crate::network::peer_discovery::HostList;
use crate::network::server::Listener;
use crate::network::tls::TlsConfig;
use crate::network::wire::{self, MAX_FRAME_SIZE};
use crate::packet::{Packet, PacketHash, PacketId};

/// A packet delivered to the application
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Bytes,
    pub hash: PacketHash,
    pub id: PacketId,
    /// Handler key of the peer it first arrived from
    pub peer: String,
}

/// Snapshot of one handler
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer: String,
    pub direction: Direction,
    pub state: HandlerState,
    pub reconnects: u32,
    pub frames_received: u64,
    pub frames_sent: u64,
}

/// What happened to one received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// New packet: relayed to `peers` handlers and queued for the application
    Relayed { peers: usize },
    Duplicate,
    Malformed,
}

pub(crate) struct Shared {
    me: Weak<Shared>,
    config: NetworkConfig,
    tls: Arc<TlsConfig>,
    handlers: DashMap<String, Arc<Handler>>,
    /// Every address ever dialed; discovery never re-dials these
    known: SyncMutex<HashSet<String>>,
    cache: SyncMutex<DedupCache>,
    inbound_tx: mpsc::Sender<Delivery>,
    host_list: Option<HostList>,
    shutdown: CancellationToken,
}

impl Shared {
    fn sink(&self) -> Weak<dyn FrameSink> {
        self.me.clone()
    }

    async fn connect_peer(&self, peer: &str, reconnect: bool) -> Result<bool, RelayError> {
        if peer.trim().is_empty() {
            return Err(RelayError::InvalidAddress(peer.to_string()));
        }
        if self.shutdown.is_cancelled() {
            return Ok(false);
        }
        self.known.lock().insert(peer.to_string());

        if self.handlers.contains_key(peer) {
            return Ok(false);
        }

        let handler =
            Handler::connect(peer, self.tls.clone(), self.sink(), reconnect, &self.shutdown).await?;

        // the client may have closed while the dial was in flight
        if self.shutdown.is_cancelled() {
            handler.close().await;
            return Ok(false);
        }

        let raced = match self.handlers.entry(peer.to_string()) {
            Entry::Occupied(_) => Some(handler),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                None
            }
        };

        // lost a race with a concurrent dial to the same address
        if let Some(handler) = raced {
            handler.close().await;
            return Ok(false);
        }
        Ok(true)
    }

    pub(crate) async fn register_inbound(&self, stream: PeerStream, remote: SocketAddr) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let handler = Handler::accept(stream, remote, self.sink(), &self.shutdown).await;
        if let Some(previous) = self.handlers.insert(handler.peer().to_string(), handler) {
            previous.close().await;
        }
    }

    fn snapshot(&self) -> Vec<Arc<Handler>> {
        self.handlers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Queue `frame` on every handler except `exclude`. Returns how many accepted it.
    fn broadcast_except(&self, frame: &Bytes, exclude: Option<&str>) -> usize {
        self.handlers
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != exclude)
            .filter(|entry| entry.value().send(frame.clone()))
            .count()
    }

    fn process_frame(&self, origin: &str, body: Bytes) -> FrameOutcome {
        let packet = match Packet::unpack(body.clone()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("🗑️ Dropping malformed frame from {}: {}", origin, e);
                return FrameOutcome::Malformed;
            }
        };

        let hash = packet.hash();
        if !self.cache.lock().check_and_insert(hash, Instant::now()) {
            return FrameOutcome::Duplicate;
        }

        // Relay the received bytes verbatim
        let frame = match wire::encode_frame(&body) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("🗑️ Cannot re-frame packet {} from {}: {}", packet.id(), origin, e);
                return FrameOutcome::Malformed;
            }
        };
        let peers = self.broadcast_except(&frame, Some(origin));
        debug!(
            "📨 New packet {} from {}, relayed to {} peer(s)",
            packet.id(),
            origin,
            peers
        );

        let id = packet.id();
        let delivery = Delivery {
            id,
            hash,
            payload: packet.into_payload(),
            peer: origin.to_string(),
        };
        // already relayed and marked seen; only the local copy is lost
        match self.inbound_tx.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("⚠️ Inbound queue full, dropping delivery of packet {}", id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Inbound queue closed, packet {} not delivered", id);
            }
        }

        FrameOutcome::Relayed { peers }
    }

    /// Drop handlers that are closed for good
    fn reap_dead(&self) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|peer, handler| {
            let alive = !handler.is_dead();
            if !alive {
                info!("🧹 Removing dead handler for {}", peer);
            }
            alive
        });
        before - self.handlers.len()
    }

    fn prune_cache(&self) -> usize {
        self.cache.lock().prune(Instant::now())
    }

    async fn poll_host_list(&self, host_list: &HostList) {
        let peers = match host_list.fetch().await {
            Ok(peers) => peers,
            Err(e) => {
                debug!("Host list poll of {} failed: {}", host_list.url(), e);
                return;
            }
        };

        for peer in peers {
            if !self.known.lock().insert(peer.clone()) {
                continue;
            }
            info!("🔍 Discovered new peer {}", peer);

            let Some(shared) = self.me.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(e) = shared.connect_peer(&peer, false).await {
                    debug!("Discovered peer {} unreachable: {}", peer, e);
                }
            });
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.maintenance_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let poll_interval = self.config.host_list_interval();
        let mut last_poll: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            self.reap_dead();

            let pruned = self.prune_cache();
            if pruned > 0 {
                debug!("🧹 Pruned {} expired dedup entries", pruned);
            }

            if let Some(host_list) = &self.host_list {
                if last_poll.map_or(true, |at| at.elapsed() >= poll_interval) {
                    last_poll = Some(Instant::now());
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.poll_host_list(host_list) => {}
                    }
                }
            }
        }

        debug!("Maintenance loop stopped");
    }
}

#[async_trait]
impl FrameSink for Shared {
    async fn on_frame(&self, origin: &str, body: Bytes) {
        self.process_frame(origin, body);
    }
}

/// Application handle to the relay network
pub struct Client {
    shared: Arc<Shared>,
    inbound_rx: Mutex<mpsc::Receiver<Delivery>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Dial every configured peer (with reconnect) and start maintenance.
    /// A peer that cannot be reached is logged, not fatal.
    pub async fn new(config: NetworkConfig, tls: TlsConfig) -> Result<Self, RelayError> {
        let host_list = match &config.host_list_url {
            Some(url) => Some(HostList::new(url.clone(), config.default_port)?),
            None => None,
        };
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let initial_peers = config.peers.clone();

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            cache: SyncMutex::new(DedupCache::new(config.dedup_retention())),
            config,
            tls: Arc::new(tls),
            handlers: DashMap::new(),
            known: SyncMutex::new(HashSet::new()),
            inbound_tx,
            host_list,
            shutdown: CancellationToken::new(),
        });

        for peer in &initial_peers {
            if let Err(e) = shared.connect_peer(peer, true).await {
                warn!("⚠️ Skipping peer {}: {}", peer, e);
            }
        }

        let maintenance = tokio::spawn(shared.clone().maintenance_loop());
        info!("🚀 Relay client started with {} peer(s)", shared.handlers.len());

        Ok(Self {
            shared,
            inbound_rx: Mutex::new(inbound_rx),
            tasks: SyncMutex::new(vec![maintenance]),
        })
    }

    /// Accept inbound peers on `bind_addr`. Returns the bound address.
    pub async fn listen(&self, bind_addr: &str) -> Result<SocketAddr, RelayError> {
        let listener = Listener::bind(bind_addr, &self.shared.tls).await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(listener.run(self.shared.me.clone(), self.shared.shutdown.clone()));
        self.tasks.lock().push(task);
        Ok(addr)
    }

    /// Add a peer at runtime. `Ok(false)` if a handler for it already exists
    /// or the client is closed.
    pub async fn connect_peer(&self, peer: &str, reconnect: bool) -> Result<bool, RelayError> {
        self.shared.connect_peer(peer, reconnect).await
    }

    /// Wrap `payload` in a fresh packet and send it to every peer.
    ///
    /// Returns how many handlers accepted the write, and the packet id.
    /// Fails with `InvalidPacketSize` before writing anything if the packed
    /// packet exceeds the frame limit.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(usize, PacketId), RelayError> {
        let packet = Packet::new(payload);
        if packet.packed_len() > MAX_FRAME_SIZE {
            return Err(RelayError::InvalidPacketSize {
                size: packet.packed_len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let frame = wire::encode_frame(&packet.pack())?;
        // Echoes of our own packet are duplicates
        self.shared
            .cache
            .lock()
            .check_and_insert(packet.hash(), Instant::now());

        let delivered = self.shared.broadcast_except(&frame, None);
        debug!("📤 Sent packet {} to {} peer(s)", packet.id(), delivered);
        Ok((delivered, packet.id()))
    }

    /// Queue a pre-encoded frame on every handler. Returns how many accepted it.
    pub async fn broadcast(&self, frame: &[u8]) -> usize {
        self.shared.broadcast_except(&Bytes::copy_from_slice(frame), None)
    }

    /// Wait for the next new packet from any peer.
    /// Returns `None` once the client is closed and the queue is drained.
    pub async fn accept(&self) -> Option<Delivery> {
        let mut rx = self.inbound_rx.lock().await;
        if let Ok(delivery) = rx.try_recv() {
            return Some(delivery);
        }
        tokio::select! {
            delivery = rx.recv() => delivery,
            _ = self.shared.shutdown.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Feed a raw frame body through the receive path as if `origin` sent it
    pub async fn ingest(&self, origin: &str, body: Bytes) -> FrameOutcome {
        self.shared.process_frame(origin, body)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .snapshot()
            .into_iter()
            .map(|h| PeerInfo {
                peer: h.peer().to_string(),
                direction: h.direction(),
                state: h.state(),
                reconnects: h.reconnects(),
                frames_received: h.frames_received(),
                frames_sent: h.frames_sent(),
            })
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.shared
            .handlers
            .iter()
            .filter(|entry| entry.value().is_connected())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop maintenance and the listener, then close every handler. Idempotent.
    pub async fn close(&self) {
        if self.shared.shutdown.is_cancelled() && self.shared.handlers.is_empty() {
            return;
        }
        self.shared.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let handlers = self.shared.snapshot();
        join_all(handlers.iter().map(|h| h.close())).await;
        self.shared.handlers.clear();

        info!("🛑 Relay client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tls::PeerVerification;
    use std::time::Duration;

    fn tls() -> TlsConfig {
        TlsConfig::new_self_signed(
            vec!["localhost".to_string()],
            PeerVerification::InsecureSkipVerify,
        )
        .unwrap()
    }

    async fn client() -> Client {
        Client::new(NetworkConfig::default(), tls()).await.unwrap()
    }

    #[tokio::test]
    async fn test_send_without_peers_delivers_zero() {
        let client = client().await;
        let (delivered, _id) = client.send(&b"nobody listening"[..]).await.unwrap();
        assert_eq!(delivered, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_packet() {
        let client = client().await;

        let largest = vec![0u8; MAX_FRAME_SIZE - crate::packet::PACKET_ID_LEN];
        assert!(client.send(largest).await.is_ok());

        let too_big = vec![0u8; MAX_FRAME_SIZE - crate::packet::PACKET_ID_LEN + 1];
        let result = client.send(too_big).await;
        assert!(matches!(
            result,
            Err(RelayError::InvalidPacketSize { size, max }) if size == MAX_FRAME_SIZE + 1 && max == MAX_FRAME_SIZE
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_frame_delivered_once() {
        let client = client().await;
        let packet = Packet::new(&b"once"[..]);

        let first = client.ingest("peer-a:7400", packet.pack()).await;
        let second = client.ingest("peer-b:7400", packet.pack()).await;
        assert_eq!(first, FrameOutcome::Relayed { peers: 0 });
        assert_eq!(second, FrameOutcome::Duplicate);

        let delivery = client.accept().await.unwrap();
        assert_eq!(delivery.payload.as_ref(), b"once");
        assert_eq!(delivery.hash, packet.hash());
        assert_eq!(delivery.id, packet.id());
        assert_eq!(delivery.peer, "peer-a:7400");

        let nothing_more = tokio::time::timeout(Duration::from_millis(200), client.accept()).await;
        assert!(nothing_more.is_err());
        client.close().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped() {
        let client = client().await;
        let outcome = client.ingest("peer-a:7400", Bytes::from_static(b"short")).await;
        assert_eq!(outcome, FrameOutcome::Malformed);

        // the client keeps working afterwards
        let packet = Packet::new(&b"fine"[..]);
        assert!(matches!(
            client.ingest("peer-a:7400", packet.pack()).await,
            FrameOutcome::Relayed { .. }
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn test_own_packet_echo_is_duplicate() {
        let client = client().await;
        let (_, id) = client.send(&b"mine"[..]).await.unwrap();

        let echo = Packet::from_parts(id, &b"mine"[..]);
        assert_eq!(client.ingest("peer-a:7400", echo.pack()).await, FrameOutcome::Duplicate);
        client.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_initial_peer_is_not_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = NetworkConfig {
            peers: vec![addr.clone()],
            ..NetworkConfig::default()
        };
        let client = Client::new(config, tls()).await.unwrap();

        let peers = client.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer, addr);
        assert_eq!(peers[0].direction, Direction::Outbound);
        assert_eq!(client.connected_count(), 0);

        // still only one handler per address
        assert!(!client.connect_peer(&addr, true).await.unwrap());
        client.close().await;
    }

    #[tokio::test]
    async fn test_maintenance_reaps_dead_handlers() {
        let server = Client::new(NetworkConfig::default(), tls()).await.unwrap();
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let client = client().await;
        assert!(client.connect_peer(&addr.to_string(), false).await.unwrap());
        assert_eq!(client.peers().len(), 1);

        // closing the server drops the link; the non-reconnecting handler dies
        server.close().await;

        tokio::time::timeout(Duration::from_secs(10), async {
            while !client.peers().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("dead handler was not reaped");
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_accept() {
        let client = client().await;
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert!(client.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_full_inbound_queue_does_not_stall_receive_path() {
        let config = NetworkConfig {
            inbound_queue_capacity: 1,
            ..NetworkConfig::default()
        };
        let client = Client::new(config, tls()).await.unwrap();

        let first = Packet::new(&b"first"[..]);
        let second = Packet::new(&b"second"[..]);
        let outcomes = tokio::time::timeout(Duration::from_secs(1), async {
            (
                client.ingest("peer-a:7400", first.pack()).await,
                client.ingest("peer-a:7400", second.pack()).await,
            )
        })
        .await
        .expect("receive path blocked on a full queue");
        assert_eq!(outcomes.0, FrameOutcome::Relayed { peers: 0 });
        assert_eq!(outcomes.1, FrameOutcome::Relayed { peers: 0 });

        // the second packet was still recorded as seen
        assert_eq!(client.ingest("peer-b:7400", second.pack()).await, FrameOutcome::Duplicate);

        assert_eq!(client.accept().await.unwrap().hash, first.hash());
        let dropped = tokio::time::timeout(Duration::from_millis(200), client.accept()).await;
        assert!(dropped.is_err());
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_host_list_poll() {
        // accepts the HTTP connection and never answers
        let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = http.accept().await {
                held.push(stream);
            }
        });

        let config = NetworkConfig {
            host_list_url: Some(format!("http://{}/peers.json", http_addr)),
            ..NetworkConfig::default()
        };
        let client = Client::new(config, tls()).await.unwrap();
        // let the first poll get in flight
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        client.close().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_after_close_adds_nothing() {
        let server = Client::new(NetworkConfig::default(), tls()).await.unwrap();
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let client = client().await;
        client.close().await;

        assert!(!client.connect_peer(&addr.to_string(), true).await.unwrap());
        assert!(client.peers().is_empty());
        server.close().await;
    }
}

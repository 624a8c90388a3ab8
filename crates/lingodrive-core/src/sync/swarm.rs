//! Swarm discovery over iroh-gossip
//!
//! A [`Swarm`] owns the node's endpoint. Joining a drive's discovery topic
//! subscribes to the gossip swarm for it; in client mode every neighbor the
//! swarm reports (and every bootstrap peer) is dialed on the drive ALPN and
//! the resulting [`PeerConnection`]s are handed out on the join's
//! connection stream.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Swarm                                                       │
//! │  ├── Endpoint (QUIC, StaticProvider discovery)               │
//! │  ├── Gossip   (topic membership)                             │
//! │  └── Router   gossip | blobs | drive (server role)           │
//! │                                                              │
//! │  TopicJoin (one per drive)                                   │
//! │  ├── event loop: NeighborUp -> dial -> PeerConnection        │
//! │  ├── find_peers(): open a search window                      │
//! │  └── flush():  wait until searching/dialing settles          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::Connection;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::handler::{DriveProtocolHandler, DriveRegistry};
use super::protocol::DRIVE_ALPN;
use crate::blobs::BlobStore;
use crate::error::{DriveError, DriveResult};

/// Gossip carries only membership for drive topics, so a small limit is
/// plenty.
const MAX_GOSSIP_MESSAGE_SIZE: usize = 64 * 1024;

/// Bound on a single dial attempt
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Capacity of a join's connection stream
const CONNECTION_CHANNEL_CAPACITY: usize = 64;

/// A live drive-protocol connection to one peer
#[derive(Debug, Clone)]
pub struct PeerConnection {
    /// Remote endpoint id
    pub remote: EndpointId,
    /// The QUIC connection (drive ALPN)
    pub connection: Connection,
}

/// Roles taken when joining a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Dial discovered peers and yield connections
    pub client: bool,
    /// Announce on the topic so readers can find this node
    pub server: bool,
}

impl JoinOptions {
    /// Reader only
    pub const fn client_only() -> Self {
        Self {
            client: true,
            server: false,
        }
    }

    /// Publisher only
    pub const fn server_only() -> Self {
        Self {
            client: false,
            server: true,
        }
    }
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self::client_only()
    }
}

/// Outcome of [`TopicJoin::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Connections established so far on this join
    pub connected: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct JoinState {
    searching: usize,
    dialing: usize,
    connected: usize,
}

impl JoinState {
    fn settled(&self) -> bool {
        self.dialing == 0 && (self.connected > 0 || self.searching == 0)
    }
}

/// Options for binding a [`Swarm`]
#[derive(Debug, Clone, Default)]
pub struct SwarmOptions {
    /// Endpoint identity; generated when `None`
    pub secret_key: Option<SecretKey>,
    /// Register the drive protocol handler (server role)
    pub serve: bool,
}

/// The node's networking stack: endpoint, gossip and router
#[derive(Debug)]
pub struct Swarm {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for adding out-of-band peer addresses
    static_provider: StaticProvider,
    registry: DriveRegistry,
    serving: bool,
}

impl Swarm {
    /// Bind an endpoint and spawn the router.
    ///
    /// The blobs protocol is always served so peers can fetch content this
    /// node holds. The drive protocol is served only when `options.serve`.
    pub async fn bind(blobs: &BlobStore, options: SwarmOptions) -> DriveResult<Self> {
        let secret_key = options
            .secret_key
            .unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let static_provider = StaticProvider::new();

        let mut alpns = vec![GOSSIP_ALPN.to_vec(), iroh_blobs::ALPN.to_vec()];
        if options.serve {
            alpns.push(DRIVE_ALPN.to_vec());
        }

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(alpns)
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| DriveError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, serve = options.serve, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_GOSSIP_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let registry = DriveRegistry::new();
        let mut router_builder = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(iroh_blobs::ALPN, blobs.protocol());

        if options.serve {
            router_builder = router_builder.accept(
                DriveProtocolHandler::alpn(),
                DriveProtocolHandler::new(registry.clone()),
            );
            info!("Drive protocol handler registered");
        }

        let router = router_builder.spawn();
        debug!("Router spawned");

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            registry,
            serving: options.serve,
        })
    }

    /// Get this node's endpoint ID
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Get this node's current EndpointAddr
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Get a reference to the underlying endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Drives this node serves (only consulted when serving)
    pub fn registry(&self) -> &DriveRegistry {
        &self.registry
    }

    /// Whether the drive protocol handler is registered
    pub fn is_serving(&self) -> bool {
        self.serving
    }

    /// Add a peer's address to the static discovery provider
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(peer = %endpoint_addr.id, "Adding peer address to static discovery");
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Join a discovery topic.
    ///
    /// `bootstrap` peers are passed to gossip and, in client mode, dialed
    /// directly as well.
    pub async fn join(
        &self,
        topic: TopicId,
        options: JoinOptions,
        bootstrap: Vec<EndpointId>,
    ) -> DriveResult<TopicJoin> {
        let own_id = self.endpoint.id();
        let bootstrap: Vec<EndpointId> = bootstrap.into_iter().filter(|id| *id != own_id).collect();
        info!(?topic, peers = bootstrap.len(), ?options, "Joining discovery topic");
        if options.server && !self.serving {
            warn!(?topic, "Server role requested but drive protocol is not served");
        }

        let gossip_topic = self
            .gossip
            .subscribe(topic, bootstrap.clone())
            .await
            .map_err(|e| DriveError::Connection(format!("Failed to join topic: {}", e)))?;
        let (sender, receiver) = gossip_topic.split();

        let (state, _) = watch::channel(JoinState::default());
        let state = Arc::new(state);
        let (conn_tx, conn_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);

        let mut dialer = Dialer {
            endpoint: self.endpoint.clone(),
            state: state.clone(),
            connections: conn_tx,
            dialed: HashSet::new(),
            tasks: JoinSet::new(),
            enabled: options.client,
        };
        for peer in &bootstrap {
            dialer.dial(*peer);
        }

        let task = tokio::spawn(run_topic_loop(topic, receiver, dialer));

        Ok(TopicJoin {
            topic,
            state,
            connections: Some(conn_rx),
            _sender: sender,
            task,
        })
    }

    /// Shut down the router and close the endpoint.
    pub async fn shutdown(&self) {
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Router shutdown failed");
        }
        self.endpoint.close().await;
        info!("Swarm shut down");
    }
}

/// Dials peers for one join; owned by the join's event loop.
struct Dialer {
    endpoint: Endpoint,
    state: Arc<watch::Sender<JoinState>>,
    connections: mpsc::Sender<PeerConnection>,
    dialed: HashSet<EndpointId>,
    tasks: JoinSet<()>,
    enabled: bool,
}

impl Dialer {
    fn dial(&mut self, peer: EndpointId) {
        if !self.enabled || !self.dialed.insert(peer) {
            return;
        }

        self.state.send_modify(|s| s.dialing += 1);
        let endpoint = self.endpoint.clone();
        let state = self.state.clone();
        let connections = self.connections.clone();

        self.tasks.spawn(async move {
            debug!(peer = %peer.fmt_short(), "Dialing peer");
            let result = tokio::time::timeout(DIAL_TIMEOUT, endpoint.connect(peer, DRIVE_ALPN)).await;
            let connected = match result {
                Ok(Ok(connection)) => {
                    info!(peer = %peer.fmt_short(), "Connected to drive peer");
                    connections
                        .send(PeerConnection {
                            remote: peer,
                            connection,
                        })
                        .await
                        .is_ok()
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer.fmt_short(), error = %e, "Dial failed");
                    false
                }
                Err(_) => {
                    debug!(peer = %peer.fmt_short(), "Dial timed out");
                    false
                }
            };
            state.send_modify(|s| {
                s.dialing -= 1;
                if connected {
                    s.connected += 1;
                }
            });
        });

        while self.tasks.try_join_next().is_some() {}
    }

    /// Allow a later re-dial of `peer`.
    fn forget(&mut self, peer: &EndpointId) {
        self.dialed.remove(peer);
    }
}

async fn run_topic_loop(topic: TopicId, mut receiver: GossipReceiver, mut dialer: Dialer) {
    use n0_future::StreamExt;

    loop {
        match receiver.try_next().await {
            Ok(Some(Event::NeighborUp(peer))) => {
                info!(?topic, peer = %peer.fmt_short(), "Neighbor joined");
                dialer.dial(peer);
            }
            Ok(Some(Event::NeighborDown(peer))) => {
                info!(?topic, peer = %peer.fmt_short(), "Neighbor left");
                dialer.forget(&peer);
            }
            Ok(Some(Event::Received(msg))) => {
                debug!(?topic, from = %msg.delivered_from.fmt_short(), "Ignoring gossip payload");
            }
            Ok(Some(Event::Lagged)) => {
                warn!(?topic, "Lagged behind on topic");
            }
            Ok(None) => {
                debug!(?topic, "Topic subscription closed");
                break;
            }
            Err(e) => {
                warn!(?topic, error = ?e, "Error receiving from topic");
                break;
            }
        }
    }

    // Keep in-flight dials alive until they settle.
    while dialer.tasks.join_next().await.is_some() {}
}

/// Guard for an open peer-search window.
///
/// While at least one guard is alive, [`TopicJoin::flush`] keeps waiting
/// for a first connection.
#[derive(Debug)]
pub struct FindingPeers {
    state: Arc<watch::Sender<JoinState>>,
    open: bool,
}

impl FindingPeers {
    /// Close the search window.
    pub fn done(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.send_modify(|s| s.searching -= 1);
        }
    }
}

impl Drop for FindingPeers {
    fn drop(&mut self) {
        self.close();
    }
}

/// Membership of one discovery topic.
///
/// Dropping the join (or calling [`TopicJoin::leave`]) unsubscribes and
/// aborts in-flight dials.
#[derive(Debug)]
pub struct TopicJoin {
    topic: TopicId,
    state: Arc<watch::Sender<JoinState>>,
    connections: Option<mpsc::Receiver<PeerConnection>>,
    _sender: GossipSender,
    task: JoinHandle<()>,
}

impl TopicJoin {
    /// The joined topic
    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// Open a peer-search window.
    pub fn find_peers(&self) -> FindingPeers {
        self.state.send_modify(|s| s.searching += 1);
        FindingPeers {
            state: self.state.clone(),
            open: true,
        }
    }

    /// Wait until no dial is in flight and either a connection exists or
    /// no search window is open.
    pub async fn flush(&self) -> FlushOutcome {
        let mut rx = self.state.subscribe();
        let connected = match rx.wait_for(JoinState::settled).await {
            Ok(state) => state.connected,
            Err(_) => self.state.borrow().connected,
        };
        FlushOutcome { connected }
    }

    /// Connections established so far
    pub fn connected(&self) -> usize {
        self.state.borrow().connected
    }

    /// Next connection from the stream, `None` once taken or ended.
    pub async fn next_connection(&mut self) -> Option<PeerConnection> {
        self.connections.as_mut()?.recv().await
    }

    /// Take the connection stream to consume it elsewhere.
    pub fn take_connections(&mut self) -> Option<mpsc::Receiver<PeerConnection>> {
        self.connections.take()
    }

    /// Leave the topic and stop dialing.
    pub fn leave(self) {
        info!(topic = ?self.topic, "Leaving discovery topic");
        drop(self);
    }
}

impl Drop for TopicJoin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_state_settled() {
        let mut s = JoinState::default();
        assert!(s.settled());

        s.searching = 1;
        assert!(!s.settled());

        s.connected = 1;
        assert!(s.settled());

        s.dialing = 1;
        assert!(!s.settled());
    }

    #[test]
    fn test_finding_peers_guard() {
        let (state, _) = watch::channel(JoinState::default());
        let state = Arc::new(state);

        let guard = FindingPeers {
            state: state.clone(),
            open: true,
        };
        state.send_modify(|s| s.searching += 1);
        assert_eq!(state.borrow().searching, 1);

        guard.done();
        assert_eq!(state.borrow().searching, 0);
    }

    #[test]
    fn test_join_options_default_is_client() {
        assert_eq!(JoinOptions::default(), JoinOptions::client_only());
        assert!(JoinOptions::server_only().server);
    }

    #[tokio::test]
    async fn test_flush_without_peers_settles() {
        let swarm = Swarm::bind(&BlobStore::new_memory(), SwarmOptions::default())
            .await
            .unwrap();
        let join = swarm
            .join(TopicId::from_bytes([3u8; 32]), JoinOptions::client_only(), vec![])
            .await
            .unwrap();

        // No search window: flush returns immediately.
        let outcome = join.flush().await;
        assert_eq!(outcome.connected, 0);

        // Window open: flush waits until the guard is dropped.
        let guard = join.find_peers();
        let pending = tokio::time::timeout(Duration::from_millis(100), join.flush()).await;
        assert!(pending.is_err());
        drop(guard);
        assert_eq!(join.flush().await.connected, 0);

        join.leave();
        swarm.shutdown().await;
    }
}

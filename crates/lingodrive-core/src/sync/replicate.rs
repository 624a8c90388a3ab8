//! Replication transport
//!
//! The [`Replicator`] attaches peer connections to every open drive
//! session. For each (connection, session) pair it opens one drive
//! protocol stream, verifies every manifest the peer pushes, fetches the
//! blobs it names from that same peer and hands the result to the session.
//!
//! A connection is attached at most once per remote id while it is alive.
//! When it closes it is detached, and a later dial may attach it again.
//! A failing stream is re-opened with backoff for as long as both its
//! connection and its session are alive; the session keeps whatever it
//! already accepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use iroh::endpoint::Connection;
use iroh::{Endpoint, EndpointId};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::protocol::{framed, recv_message, send_message, DriveMessage};
use super::swarm::PeerConnection;
use crate::blobs::BlobStore;
use crate::drive::DriveSession;
use crate::error::{DriveError, DriveResult};

/// Wait before the first re-subscribe after a failed stream
const RETRY_INITIAL: Duration = Duration::from_millis(250);

/// Upper bound on the wait between re-subscribes
const RETRY_MAX: Duration = Duration::from_secs(30);

struct ReplicatorInner {
    endpoint: Endpoint,
    blobs: BlobStore,
    peers: RwLock<HashMap<EndpointId, Connection>>,
    sessions: RwLock<Vec<DriveSession>>,
    tasks: Mutex<JoinSet<()>>,
}

/// Streams drive data between sessions and peer connections.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("peers", &self.peer_count())
            .field("sessions", &self.inner.sessions.read().len())
            .finish()
    }
}

impl Replicator {
    /// Create a replicator fetching blobs through `endpoint` into `blobs`.
    pub fn new(endpoint: Endpoint, blobs: BlobStore) -> Self {
        Self {
            inner: Arc::new(ReplicatorInner {
                endpoint,
                blobs,
                peers: RwLock::new(HashMap::new()),
                sessions: RwLock::new(Vec::new()),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Attach a peer connection to replication for every open session.
    ///
    /// Returns `false` if a live connection to the same peer is already
    /// attached; the new connection is left untouched in that case.
    pub fn replicate(&self, peer: PeerConnection) -> bool {
        let PeerConnection { remote, connection } = peer;

        {
            let mut peers = self.inner.peers.write();
            if let Some(existing) = peers.get(&remote) {
                if existing.close_reason().is_none() {
                    debug!(peer = %remote.fmt_short(), "Peer already attached");
                    return false;
                }
            }
            peers.insert(remote, connection.clone());
        }

        let sessions: Vec<DriveSession> = self
            .inner
            .sessions
            .read()
            .iter()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect();

        info!(peer = %remote.fmt_short(), sessions = sessions.len(), "Peer attached to replication");
        for session in sessions {
            self.spawn_stream(remote, connection.clone(), session);
        }

        let inner = Arc::downgrade(&self.inner);
        self.spawn(async move {
            let reason = connection.closed().await;
            debug!(peer = %remote.fmt_short(), %reason, "Peer connection closed");
            if let Some(inner) = inner.upgrade() {
                let mut peers = inner.peers.write();
                if peers
                    .get(&remote)
                    .is_some_and(|c| c.stable_id() == connection.stable_id())
                {
                    peers.remove(&remote);
                }
            }
        });
        true
    }

    /// Start replicating `session` on every attached connection, and on
    /// connections attached later.
    pub fn add_session(&self, session: DriveSession) {
        {
            let mut sessions = self.inner.sessions.write();
            sessions.retain(|s| !s.is_closed());
            if sessions.iter().any(|s| s.key() == session.key()) {
                debug!(drive = %session.key().short(), "Session already replicated");
                return;
            }
            sessions.push(session.clone());
        }

        let peers: Vec<(EndpointId, Connection)> = self
            .inner
            .peers
            .read()
            .iter()
            .filter(|(_, c)| c.close_reason().is_none())
            .map(|(id, c)| (*id, c.clone()))
            .collect();

        debug!(drive = %session.key().short(), peers = peers.len(), "Session added to replication");
        for (remote, connection) in peers {
            self.spawn_stream(remote, connection, session.clone());
        }
    }

    /// Stop replicating `session`. Its streams end once it is closed.
    pub fn remove_session(&self, session: &DriveSession) {
        self.inner
            .sessions
            .write()
            .retain(|s| s.key() != session.key());
    }

    /// Number of live attached peers
    pub fn peer_count(&self) -> usize {
        self.inner
            .peers
            .read()
            .values()
            .filter(|c| c.close_reason().is_none())
            .count()
    }

    /// Abort all streams and forget every peer and session.
    pub fn shutdown(&self) {
        self.inner.tasks.lock().abort_all();
        self.inner.peers.write().clear();
        self.inner.sessions.write().clear();
        debug!("Replicator stopped");
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn spawn_stream(&self, remote: EndpointId, connection: Connection, session: DriveSession) {
        let endpoint = self.inner.endpoint.clone();
        let blobs = self.inner.blobs.clone();
        let inner = Arc::downgrade(&self.inner);

        self.spawn(async move {
            let drive = session.key().short();
            let peer = remote.fmt_short().to_string();
            let mut backoff = RETRY_INITIAL;

            loop {
                let before = session.version();
                let result = tokio::select! {
                    _ = session.closed() => {
                        debug!(%drive, %peer, "Session closed, ending stream");
                        return;
                    }
                    result = run_stream(&endpoint, &blobs, remote, &connection, &session) => result,
                };
                let error = match result {
                    Ok(()) => {
                        debug!(%drive, %peer, "Replication stream ended");
                        return;
                    }
                    Err(e) => e,
                };

                if connection.close_reason().is_some() {
                    warn!(%drive, %peer, error = %error, "Replication stream failed, connection gone");
                    return;
                }
                let replicated = inner.upgrade().is_some_and(|inner| {
                    inner.sessions.read().iter().any(|s| s.key() == session.key())
                });
                if !replicated {
                    return;
                }

                if session.version() != before {
                    backoff = RETRY_INITIAL;
                }
                warn!(
                    %drive,
                    %peer,
                    error = %error,
                    retry_ms = backoff.as_millis() as u64,
                    "Replication stream failed, resubscribing"
                );
                tokio::select! {
                    _ = session.closed() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        });
    }
}

async fn run_stream(
    endpoint: &Endpoint,
    blobs: &BlobStore,
    remote: EndpointId,
    connection: &Connection,
    session: &DriveSession,
) -> DriveResult<()> {
    let drive = *session.drive();

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| DriveError::Network(format!("Failed to open stream: {}", e)))?;
    let (mut writer, mut reader) = framed(send, recv);

    send_message(
        &mut writer,
        &DriveMessage::Subscribe {
            drive,
            known_version: session.version(),
        },
    )
    .await?;

    while let Some(message) = recv_message(&mut reader).await? {
        match message {
            DriveMessage::Manifest(signed) => {
                let manifest = signed.verify(&drive)?;
                if session
                    .version()
                    .is_some_and(|current| manifest.version <= current)
                {
                    debug!(version = manifest.version, "Skipping stale manifest");
                    continue;
                }

                for entry in manifest.entries.values() {
                    blobs.fetch_from(entry.blob_hash(), remote, endpoint).await?;
                }
                session.accept(signed, manifest)?;
            }
            DriveMessage::NotHosted => {
                debug!(peer = %remote.fmt_short(), "Peer does not host drive");
                return Ok(());
            }
            DriveMessage::Error { reason } => {
                return Err(DriveError::Network(format!("Peer error: {}", reason)));
            }
            DriveMessage::Subscribe { .. } => {
                return Err(DriveError::Network(
                    "Unexpected Subscribe from server".to_string(),
                ));
            }
        }
    }

    Ok(())
}

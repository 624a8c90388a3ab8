//! Reader-side connection to one remote drive
//!
//! ```text
//! ┌─────────┐  first verified manifest  ┌───────┐   close()   ┌────────┐
//! │ Opening │ ────────────────────────▶ │ Ready │ ──────────▶ │ Closed │
//! └─────────┘                           └───────┘             └────────┘
//!      │                 close()                                  ▲
//!      └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Content operations wait for `Ready` instead of failing. The manifest is
//! only ever replaced through [`DriveSession::accept`], which the replicator
//! calls after verifying a manifest and fetching its blobs.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use iroh_gossip::proto::TopicId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DriveHead, DriveManifest, ManifestEntry, SignedManifest};
use crate::blobs::BlobStore;
use crate::error::{DriveError, DriveResult};
use crate::key::{DriveKey, DRIVE_KEY_LEN};
use crate::storage::Storage;
use crate::sync::derive_discovery_topic;

/// Capacity of the per-session change channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a [`DriveSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first verified manifest
    Opening,
    /// Content is available
    Ready,
    /// Released; terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Opening => write!(f, "opening"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Emitted once per accepted remote manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Session change counter after the change
    pub seq: u64,
    /// Manifest version now current
    pub version: u64,
    /// Number of files in the new tree
    pub entries: usize,
}

/// Consistent view of the session content at one `seq`
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Change counter the manifest belongs to
    pub seq: u64,
    /// The content tree
    pub manifest: DriveManifest,
}

#[derive(Default)]
struct Content {
    seq: u64,
    manifest: Option<DriveManifest>,
}

struct SessionInner {
    key: DriveKey,
    drive: [u8; DRIVE_KEY_LEN],
    topic: TopicId,
    blobs: BlobStore,
    storage: Option<Storage>,
    /// Highest manifest version written to `storage`
    persisted: Mutex<u64>,
    state: watch::Sender<SessionState>,
    content: RwLock<Content>,
    head: watch::Sender<Option<DriveHead>>,
    changes: broadcast::Sender<ChangeEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

/// One logical connection to a remote drive.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DriveSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for DriveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveSession")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("seq", &self.seq())
            .finish()
    }
}

impl DriveSession {
    /// Open a session for `key`.
    ///
    /// The session starts `Opening`. If `storage` holds a verified manifest
    /// for this drive and every blob it names is in `blobs`, that manifest
    /// is restored and the session is `Ready` immediately.
    pub async fn open(
        key: DriveKey,
        blobs: BlobStore,
        storage: Option<Storage>,
    ) -> DriveResult<Self> {
        let drive = key.require_drive_len()?;
        let topic = derive_discovery_topic(&key);

        let (state, _) = watch::channel(SessionState::Opening);
        let (head, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let session = Self {
            inner: Arc::new(SessionInner {
                key,
                drive,
                topic,
                blobs,
                storage,
                persisted: Mutex::new(0),
                state,
                content: RwLock::new(Content::default()),
                head,
                changes,
                forwarders: Mutex::new(Vec::new()),
            }),
        };

        session.restore().await;
        info!(drive = %session.inner.key.short(), state = %session.state(), "Drive session opened");
        Ok(session)
    }

    async fn restore(&self) {
        let Some(storage) = &self.inner.storage else {
            return;
        };

        let signed = match storage.load_drive_head(&self.inner.key) {
            Ok(Some(signed)) => signed,
            Ok(None) => return,
            Err(e) => {
                warn!(drive = %self.inner.key.short(), error = %e, "Failed to load persisted drive head");
                return;
            }
        };

        let manifest = match signed.verify(&self.inner.drive) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(drive = %self.inner.key.short(), error = %e, "Persisted drive head does not verify");
                return;
            }
        };
        *self.inner.persisted.lock() = manifest.version;

        for entry in manifest.entries.values() {
            match self.inner.blobs.has_blob(&entry.blob_hash()).await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    debug!(
                        drive = %self.inner.key.short(),
                        version = manifest.version,
                        "Persisted drive head incomplete locally, waiting for peers"
                    );
                    return;
                }
            }
        }

        let version = manifest.version;
        self.inner.content.write().manifest = Some(manifest);
        self.inner
            .head
            .send_replace(Some(DriveHead { version, signed }));
        self.mark_ready();
        info!(drive = %self.inner.key.short(), version, "Restored drive from local state");
    }

    fn mark_ready(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Opening {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// The drive key this session reads
    pub fn key(&self) -> &DriveKey {
        &self.inner.key
    }

    /// The drive public key as fixed bytes
    pub fn drive(&self) -> &[u8; DRIVE_KEY_LEN] {
        &self.inner.drive
    }

    /// Discovery topic of the drive; available before `Ready`
    pub fn discovery_key(&self) -> TopicId {
        self.inner.topic
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Number of accepted remote manifests
    pub fn seq(&self) -> u64 {
        self.inner.content.read().seq
    }

    /// Current manifest version, `None` before the first manifest
    pub fn version(&self) -> Option<u64> {
        self.inner
            .content
            .read()
            .manifest
            .as_ref()
            .map(|m| m.version)
    }

    /// Wait until the session is `Ready`.
    ///
    /// Fails with `SessionClosed` if the session closes first.
    pub async fn ready(&self) -> DriveResult<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != SessionState::Opening)
            .await
            .map_err(|_| DriveError::SessionClosed)?;

        match state {
            SessionState::Ready => Ok(()),
            _ => Err(DriveError::SessionClosed),
        }
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Content tree and `seq` as of now, after waiting for `Ready`.
    pub async fn snapshot(&self) -> DriveResult<SessionSnapshot> {
        self.ready().await?;
        let content = self.inner.content.read();
        let manifest = content
            .manifest
            .clone()
            .ok_or_else(|| DriveError::InvalidOperation("ready session without manifest".into()))?;
        Ok(SessionSnapshot {
            seq: content.seq,
            manifest,
        })
    }

    /// Paths and blob references of the current tree.
    pub async fn entries(&self) -> DriveResult<Vec<(String, ManifestEntry)>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.manifest.entries.into_iter().collect())
    }

    /// Read one file. `Ok(None)` means the path is not in the drive.
    pub async fn get(&self, path: &str) -> DriveResult<Option<Bytes>> {
        self.ready().await?;
        let entry = {
            let content = self.inner.content.read();
            content
                .manifest
                .as_ref()
                .and_then(|m| m.get(path).copied())
        };

        match entry {
            Some(entry) => self.read_entry(&entry).await.map(Some),
            None => Ok(None),
        }
    }

    /// Read the blob behind a manifest entry.
    pub async fn read_entry(&self, entry: &ManifestEntry) -> DriveResult<Bytes> {
        self.inner
            .blobs
            .get_bytes(&entry.blob_hash())
            .await?
            .ok_or_else(|| {
                DriveError::Blob(format!("Blob {} missing from local store", entry.blob_hash()))
            })
    }

    /// Subscribe to change events.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    /// Invoke `callback` once per accepted manifest, in acceptance order.
    ///
    /// If the callback falls behind the channel, it is invoked once with the
    /// current state. The forwarder stops when the session closes.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe_changes();
        let session = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(drive = %session.key().short(), skipped, "Change handler lagged");
                        let event = {
                            let content = session.inner.content.read();
                            ChangeEvent {
                                seq: content.seq,
                                version: content.manifest.as_ref().map_or(0, |m| m.version),
                                entries: content.manifest.as_ref().map_or(0, |m| m.len()),
                            }
                        };
                        callback(event);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut forwarders = self.inner.forwarders.lock();
        forwarders.retain(|h| !h.is_finished());
        forwarders.push(handle);
    }

    /// Receiver of the latest signed head, for serving this drive onward
    pub fn head_watch(&self) -> watch::Receiver<Option<DriveHead>> {
        self.inner.head.subscribe()
    }

    /// Install a verified manifest whose blobs are all stored locally.
    ///
    /// Manifests not newer than the current one are ignored and return
    /// `Ok(None)`. Otherwise `seq` advances by one, the head is persisted
    /// and one [`ChangeEvent`] is broadcast.
    pub(crate) fn accept(
        &self,
        signed: SignedManifest,
        manifest: DriveManifest,
    ) -> DriveResult<Option<ChangeEvent>> {
        if self.is_closed() {
            return Err(DriveError::SessionClosed);
        }
        if manifest.drive != self.inner.drive {
            return Err(DriveError::Signature(
                "manifest belongs to a different drive".to_string(),
            ));
        }

        let mut content = self.inner.content.write();
        if let Some(current) = &content.manifest {
            if manifest.version <= current.version {
                return Ok(None);
            }
        }

        content.seq += 1;
        let event = ChangeEvent {
            seq: content.seq,
            version: manifest.version,
            entries: manifest.len(),
        };

        content.manifest = Some(manifest);
        self.inner.head.send_replace(Some(DriveHead {
            version: event.version,
            signed: signed.clone(),
        }));
        self.mark_ready();
        let _ = self.inner.changes.send(event.clone());
        drop(content);

        self.persist_head(&signed, event.version);

        info!(
            drive = %self.inner.key.short(),
            seq = event.seq,
            version = event.version,
            entries = event.entries,
            "Accepted drive manifest"
        );
        Ok(Some(event))
    }

    /// Write `signed` to storage unless a newer head is already there.
    ///
    /// Runs outside the content lock, so readers never wait on the commit.
    fn persist_head(&self, signed: &SignedManifest, version: u64) {
        let Some(storage) = &self.inner.storage else {
            return;
        };
        let mut persisted = self.inner.persisted.lock();
        if version <= *persisted {
            return;
        }
        match storage.save_drive_head(&self.inner.key, signed) {
            Ok(()) => *persisted = version,
            Err(e) => {
                warn!(drive = %self.inner.key.short(), error = %e, "Failed to persist drive head")
            }
        }
    }

    /// Close the session. Idempotent.
    ///
    /// Wakes `ready()` waiters with `SessionClosed`, stops change
    /// forwarders and ends replication streams for this drive.
    pub fn close(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        for handle in self.inner.forwarders.lock().drain(..) {
            handle.abort();
        }
        self.inner.head.send_replace(None);
        info!(drive = %self.inner.key.short(), "Drive session closed");
    }
}

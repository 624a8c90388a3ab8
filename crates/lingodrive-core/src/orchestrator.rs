//! Connection orchestrator
//!
//! Drives one connect attempt through its stages:
//!
//! ```text
//! ValidateKey ─▶ ProbeModules ─▶ OpenStore ─▶ JoinSwarm ─▶ OpenSession
//!      │               │                                        │
//!      ▼               ▼                                        ▼
//!   Failed          Fallback                               AwaitReady ─▶ Failed
//!                                                               │
//!                              Ready ◀─ InitialMirror ◀─ RegisterChangeHandler
//! ```
//!
//! Stores and the network stack are created on first use and kept for the
//! life of the orchestrator. Each connect owns a session, a topic join and
//! a mirror scheduler; `disconnect` releases exactly those.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use iroh::{EndpointAddr, EndpointId, SecretKey};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::config::Config;
use crate::dictionary::Dictionary;
use crate::drive::DriveSession;
use crate::error::{DriveError, DriveResult};
use crate::key::{self, DriveKey};
use crate::mirror::{LocalSnapshot, MirrorScheduler};
use crate::probe::{AvailabilityState, ModuleProbe};
use crate::source::DataSource;
use crate::status::{DataSourceKind, StatusEvent, STATUS_CHANNEL_CAPACITY};
use crate::storage::Storage;
use crate::sync::{JoinOptions, Replicator, Swarm, SwarmOptions, TopicJoin};

/// Where the orchestrator is in a connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectState {
    /// Nothing connected
    Idle,
    ValidateKey,
    ProbeModules,
    OpenStore,
    JoinSwarm,
    OpenSession,
    AwaitReady,
    RegisterChangeHandler,
    InitialMirror,
    /// Connected over peer-to-peer and mirrored
    Ready,
    /// Reading from the local fallback directory
    Fallback,
    /// The last attempt failed; `connect` may be retried
    Failed(String),
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectState::Idle => write!(f, "idle"),
            ConnectState::ValidateKey => write!(f, "validate key"),
            ConnectState::ProbeModules => write!(f, "probe modules"),
            ConnectState::OpenStore => write!(f, "open store"),
            ConnectState::JoinSwarm => write!(f, "join swarm"),
            ConnectState::OpenSession => write!(f, "open session"),
            ConnectState::AwaitReady => write!(f, "await ready"),
            ConnectState::RegisterChangeHandler => write!(f, "register change handler"),
            ConnectState::InitialMirror => write!(f, "initial mirror"),
            ConnectState::Ready => write!(f, "ready"),
            ConnectState::Fallback => write!(f, "fallback"),
            ConnectState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Persistent state and content stores
struct Stores {
    storage: Storage,
    blobs: BlobStore,
}

/// Endpoint, gossip and replication
struct Network {
    swarm: Swarm,
    replicator: Replicator,
}

/// Everything one peer-to-peer connect owns
struct ActiveConnection {
    network: Arc<Network>,
    session: DriveSession,
    join: Option<TopicJoin>,
    scheduler: Option<MirrorScheduler>,
    tasks: Vec<JoinHandle<()>>,
    serving: bool,
}

impl ActiveConnection {
    fn release(self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        self.session.close();
        self.network.replicator.remove_session(&self.session);
        if self.serving {
            self.network.swarm.registry().unregister(self.session.key());
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Some(join) = self.join {
            join.leave();
        }
        debug!(drive = %self.session.key().short(), "Connection released");
    }
}

/// Dictionary parsed from a drive session, valid at one change counter
struct CachedDictionary {
    seq: u64,
    dictionary: Arc<Dictionary>,
}

/// Resolves once `shutdown` is requested after `rx` was created.
async fn cancelled(mut rx: watch::Receiver<u64>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn cancelled_error() -> DriveError {
    DriveError::Connection("connect cancelled by shutdown".to_string())
}

/// Top-level connect/sync state machine.
pub struct Orchestrator {
    config: Config,
    probe: ModuleProbe,
    status: broadcast::Sender<StatusEvent>,
    state: watch::Sender<ConnectState>,
    connect_lock: tokio::sync::Mutex<()>,
    /// Bumped by `shutdown` to abandon connects already under way
    cancel: watch::Sender<u64>,
    stores: RwLock<Option<Arc<Stores>>>,
    network: RwLock<Option<Arc<Network>>>,
    peer_addrs: Mutex<Vec<EndpointAddr>>,
    active: Mutex<Option<ActiveConnection>>,
    source: RwLock<Option<DataSource>>,
    dictionary: Mutex<Option<CachedDictionary>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &*self.state.borrow())
            .field("availability", &self.probe.state())
            .field("source", &self.source_kind())
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator probing the standard capability set.
    pub fn new(config: Config) -> Self {
        let probe = ModuleProbe::standard(config.p2p.enabled, config.blob_dir());
        Self::with_probe(config, probe)
    }

    /// Orchestrator with a caller-supplied probe.
    pub fn with_probe(config: Config, probe: ModuleProbe) -> Self {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectState::Idle);
        Self {
            config,
            probe,
            status,
            state,
            connect_lock: tokio::sync::Mutex::new(()),
            cancel: watch::channel(0).0,
            stores: RwLock::new(None),
            network: RwLock::new(None),
            peer_addrs: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            source: RwLock::new(None),
            dictionary: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Status events for a presentation layer
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn state(&self) -> ConnectState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectState> {
        self.state.subscribe()
    }

    /// Availability reported by the module probe
    pub fn availability(&self) -> AvailabilityState {
        self.probe.state()
    }

    /// Kind of the selected data source, if connected
    pub fn source_kind(&self) -> Option<DataSourceKind> {
        self.source.read().as_ref().map(DataSource::kind)
    }

    /// The current peer-to-peer session, if any
    pub fn session(&self) -> Option<DriveSession> {
        self.active.lock().as_ref().map(|a| a.session.clone())
    }

    /// Wait until the current connection's mirror has no pass running or
    /// pending.
    pub async fn wait_mirror_idle(&self) {
        let scheduler = self
            .active
            .lock()
            .as_ref()
            .and_then(|a| a.scheduler.clone());
        if let Some(scheduler) = scheduler {
            scheduler.wait_idle().await;
        }
    }

    /// Endpoint id once the network stack exists
    pub fn endpoint_id(&self) -> Option<EndpointId> {
        self.network.read().as_ref().map(|n| n.swarm.endpoint_id())
    }

    /// Make a peer's address known to discovery, now and for later binds.
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        if let Some(network) = self.network.read().as_ref() {
            network.swarm.add_peer_addr(addr.clone());
        }
        self.peer_addrs.lock().push(addr);
    }

    fn emit(&self, event: StatusEvent) {
        debug!(status = %event, "Status");
        let _ = self.status.send(event);
    }

    fn enter(&self, state: ConnectState) {
        debug!(state = %state, "Connect stage");
        self.state.send_replace(state);
    }

    fn fail<T>(&self, error: DriveError) -> DriveResult<T> {
        warn!(error = %error, "Connect failed");
        self.enter(ConnectState::Failed(error.to_string()));
        self.emit(StatusEvent::Error(error.to_string()));
        Err(error)
    }

    /// Connect to the drive named by `raw_key`.
    ///
    /// Any previous connection is released first. Returns the selected data
    /// source kind. A failed attempt leaves the orchestrator ready for
    /// another `connect`.
    ///
    /// A concurrent `shutdown` abandons the attempt with a `Connection`
    /// error and releases whatever it had opened.
    pub async fn connect(&self, raw_key: &str) -> DriveResult<DataSourceKind> {
        let cancel = self.cancel.subscribe();
        let _guard = tokio::select! {
            guard = self.connect_lock.lock() => guard,
            _ = cancelled(cancel.clone()) => return self.fail(cancelled_error()),
        };
        self.release_active();

        self.emit(StatusEvent::Initializing);
        self.enter(ConnectState::ValidateKey);
        let key = match key::validate(raw_key) {
            Ok(key) => key,
            Err(e) => return self.fail(e),
        };

        self.enter(ConnectState::ProbeModules);
        self.emit(StatusEvent::ProbingModules);
        if self.probe.probe() != AvailabilityState::Available {
            info!(drive = %key.short(), failures = ?self.probe.failures(), "Peer-to-peer unavailable, using local fallback");
            self.select_source(DataSource::LocalFallback(self.config.fallback_dir.clone()));
            self.enter(ConnectState::Fallback);
            return Ok(DataSourceKind::LocalFallback);
        }

        if let Err(e) = key.require_drive_len() {
            return self.fail(e);
        }

        match self.connect_p2p(key, cancel).await {
            Ok(active) => {
                self.select_source(DataSource::PeerToPeer(active.session.clone()));
                *self.active.lock() = Some(active);
                self.enter(ConnectState::Ready);
                self.emit(StatusEvent::Ready);
                Ok(DataSourceKind::PeerToPeer)
            }
            Err(e) => self.fail(e),
        }
    }

    async fn connect_p2p(
        &self,
        key: DriveKey,
        cancel: watch::Receiver<u64>,
    ) -> DriveResult<ActiveConnection> {
        self.enter(ConnectState::OpenStore);
        self.emit(StatusEvent::OpeningStore);
        let stores = self.stores().await?;

        self.enter(ConnectState::JoinSwarm);
        self.emit(StatusEvent::JoiningSwarm);
        let network = self.network(&stores).await?;

        self.enter(ConnectState::OpenSession);
        let session =
            DriveSession::open(key, stores.blobs.clone(), Some(stores.storage.clone())).await?;
        let mut active = ActiveConnection {
            network: network.clone(),
            session: session.clone(),
            join: None,
            scheduler: None,
            tasks: Vec::new(),
            serving: false,
        };

        match self.join_and_mirror(&mut active, cancel).await {
            Ok(()) => Ok(active),
            Err(e) => {
                active.release();
                Err(e)
            }
        }
    }

    async fn join_and_mirror(
        &self,
        active: &mut ActiveConnection,
        cancel: watch::Receiver<u64>,
    ) -> DriveResult<()> {
        let session = active.session.clone();
        let network = active.network.clone();
        let p2p = &self.config.p2p;

        network.replicator.add_session(session.clone());
        if p2p.serve {
            network
                .swarm
                .registry()
                .register(session.key(), session.head_watch())?;
            active.serving = true;
        }

        let mut bootstrap = p2p.bootstrap_ids()?;
        match EndpointId::from_bytes(session.drive()) {
            Ok(publisher) => bootstrap.insert(0, publisher),
            Err(e) => warn!(drive = %session.key().short(), error = %e, "Drive key is not a dialable endpoint id"),
        }

        let options = JoinOptions {
            client: true,
            server: p2p.serve,
        };
        let mut join = network
            .swarm
            .join(session.discovery_key(), options, bootstrap)
            .await?;

        if let Some(mut connections) = join.take_connections() {
            let replicator = network.replicator.clone();
            let status = self.status.clone();
            active.tasks.push(tokio::spawn(async move {
                while let Some(peer) = connections.recv().await {
                    let short = peer.remote.fmt_short().to_string();
                    if replicator.replicate(peer) {
                        let _ = status.send(StatusEvent::PeerConnected { peer: short });
                    }
                }
            }));
        }

        let window = join.find_peers();
        let window_len = p2p.discovery_window();
        active.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(window_len).await;
            window.done();
        }));

        let flushed = tokio::select! {
            flushed = tokio::time::timeout(p2p.join_timeout(), join.flush()) => Some(flushed),
            _ = cancelled(cancel.clone()) => None,
        };
        active.join = Some(join);
        let Some(flushed) = flushed else {
            return Err(cancelled_error());
        };
        match flushed {
            Ok(outcome) if outcome.connected > 0 => {
                info!(drive = %session.key().short(), peers = outcome.connected, "Discovery flushed");
            }
            Ok(_) => {
                warn!(drive = %session.key().short(), "No peers found for drive");
            }
            Err(_) => {
                warn!(drive = %session.key().short(), timeout_secs = p2p.join_timeout_secs, "Discovery did not settle in time");
            }
        }

        self.enter(ConnectState::AwaitReady);
        self.emit(StatusEvent::AwaitingReady);
        let ready = tokio::select! {
            ready = tokio::time::timeout(p2p.ready_timeout(), session.ready()) => ready,
            _ = cancelled(cancel) => return Err(cancelled_error()),
        };
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(DriveError::Connection(e.to_string())),
            Err(_) => {
                return Err(DriveError::Connection(format!(
                    "drive {} not ready within {}s",
                    session.key().short(),
                    p2p.ready_timeout_secs
                )))
            }
        }

        self.enter(ConnectState::RegisterChangeHandler);
        let snapshot = LocalSnapshot::open(self.config.mirror_dir(session.key())).await?;
        let scheduler = MirrorScheduler::new(session.clone(), snapshot, Some(self.status.clone()));
        scheduler.follow_changes();
        active.scheduler = Some(scheduler.clone());

        self.enter(ConnectState::InitialMirror);
        if let Err(e) = scheduler.run_now().await {
            warn!(drive = %session.key().short(), error = %e, "Initial mirror failed");
        }
        Ok(())
    }

    async fn stores(&self) -> DriveResult<Arc<Stores>> {
        if let Some(stores) = self.stores.read().clone() {
            return Ok(stores);
        }

        std::fs::create_dir_all(&self.config.data_dir)?;
        let storage = Storage::new(self.config.state_db_path())?;
        let blobs = BlobStore::new_persistent(&self.config.blob_dir()).await?;
        let stores = Arc::new(Stores { storage, blobs });
        *self.stores.write() = Some(stores.clone());
        info!(data_dir = %self.config.data_dir.display(), "Stores opened");
        Ok(stores)
    }

    async fn network(&self, stores: &Stores) -> DriveResult<Arc<Network>> {
        if let Some(network) = self.network.read().clone() {
            return Ok(network);
        }

        let secret_key = match stores.storage.load_endpoint_secret_key()? {
            Some(bytes) => {
                debug!("Loaded persistent endpoint secret key");
                SecretKey::from(bytes)
            }
            None => {
                let secret_key = SecretKey::generate(&mut rand::rng());
                stores.storage.save_endpoint_secret_key(&secret_key.to_bytes())?;
                info!("Generated new endpoint secret key");
                secret_key
            }
        };

        let swarm = Swarm::bind(
            &stores.blobs,
            SwarmOptions {
                secret_key: Some(secret_key),
                serve: self.config.p2p.serve,
            },
        )
        .await?;
        for addr in self.peer_addrs.lock().iter() {
            swarm.add_peer_addr(addr.clone());
        }

        let replicator = Replicator::new(swarm.endpoint().clone(), stores.blobs.clone());
        let network = Arc::new(Network { swarm, replicator });
        *self.network.write() = Some(network.clone());
        Ok(network)
    }

    fn select_source(&self, source: DataSource) {
        let kind = source.kind();
        *self.source.write() = Some(source);
        *self.dictionary.lock() = None;
        info!(source = %kind, "Data source selected");
        self.emit(StatusEvent::DataSource(kind));
    }

    fn current_source(&self) -> DriveResult<DataSource> {
        self.source
            .read()
            .clone()
            .ok_or_else(|| DriveError::InvalidOperation("not connected".to_string()))
    }

    /// Read a document through the selected data source.
    pub async fn read(&self, path: &str) -> DriveResult<Bytes> {
        self.current_source()?.read(path).await
    }

    /// Translate `text` using `translations.json` from the data source.
    ///
    /// A missing dictionary is not an error: the text is returned as is.
    pub async fn translate(&self, text: &str, from: &str, to: &str) -> DriveResult<String> {
        let source = self.current_source()?;
        let kind = source.kind();
        // Fallback files change without a counter, so they are read every time.
        let seq = match &source {
            DataSource::PeerToPeer(session) => Some(session.seq()),
            DataSource::LocalFallback(_) => None,
        };

        let cached = seq.and_then(|seq| {
            self.dictionary
                .lock()
                .as_ref()
                .filter(|c| c.seq == seq)
                .map(|c| c.dictionary.clone())
        });

        let dictionary = match cached {
            Some(dictionary) => dictionary,
            None => match source.dictionary().await {
                Ok(dictionary) => {
                    let dictionary = Arc::new(dictionary);
                    if let Some(seq) = seq {
                        *self.dictionary.lock() = Some(CachedDictionary {
                            seq,
                            dictionary: dictionary.clone(),
                        });
                    }
                    dictionary
                }
                Err(DriveError::NotFound(path)) => {
                    warn!(%path, source = %kind, "Translations unavailable");
                    return Ok(text.to_string());
                }
                Err(e) => return Err(e),
            },
        };

        Ok(dictionary.translate(text, from, to))
    }

    /// Release the current connection, if any.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.release_active();
    }

    fn release_active(&self) {
        let active = self.active.lock().take();
        let had_source = self.source.write().take().is_some();
        *self.dictionary.lock() = None;

        if let Some(active) = active {
            active.release();
        }
        if had_source {
            self.enter(ConnectState::Idle);
            self.emit(StatusEvent::Disconnected);
        }
    }

    /// Release everything: connection, replication, endpoint and stores.
    ///
    /// A connect in progress is abandoned rather than waited for.
    pub async fn shutdown(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
        self.disconnect().await;

        let network = self.network.write().take();
        if let Some(network) = network {
            network.replicator.shutdown();
            network.swarm.shutdown().await;
        }
        self.stores.write().take();
        info!("Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Capability;

    struct Fixed(bool);

    impl Capability for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn acquire(&self) -> DriveResult<()> {
            if self.0 {
                Ok(())
            } else {
                Err(DriveError::ModuleUnavailable("test".into()))
            }
        }
    }

    fn orchestrator_with(base: &std::path::Path, available: bool) -> Orchestrator {
        Orchestrator::with_probe(
            Config::with_base(base),
            ModuleProbe::new(vec![Box::new(Fixed(available))]),
        )
    }

    fn fallback_orchestrator(base: &std::path::Path) -> Orchestrator {
        orchestrator_with(base, false)
    }

    /// Peer-to-peer orchestrator with short discovery and the given ready wait
    fn p2p_orchestrator(base: &std::path::Path, ready_timeout_secs: u64) -> Orchestrator {
        let mut config = Config::with_base(base);
        config.p2p.join_timeout_secs = 1;
        config.p2p.ready_timeout_secs = ready_timeout_secs;
        config.p2p.discovery_window_secs = 1;
        Orchestrator::with_probe(config, ModuleProbe::new(vec![Box::new(Fixed(true))]))
    }

    /// A well-formed key of a drive nobody hosts
    fn unhosted_key(seed: u8) -> String {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
        hex::encode(signing_key.verifying_key().to_bytes())
    }

    #[test]
    fn test_connect_state_display() {
        assert_eq!(ConnectState::AwaitReady.to_string(), "await ready");
        assert_eq!(
            ConnectState::Failed("InvalidKey: empty".into()).to_string(),
            "failed: InvalidKey: empty"
        );
    }

    #[tokio::test]
    async fn test_invalid_key_touches_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Config::with_base(temp.path()));

        let err = orchestrator.connect("deadbee").await.unwrap_err();
        assert!(err.is_user_error());
        assert!(matches!(orchestrator.state(), ConnectState::Failed(_)));
        assert_eq!(orchestrator.availability(), AvailabilityState::Unattempted);
        assert!(orchestrator.endpoint_id().is_none());
        assert!(!temp.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_short_key_fails_before_stores() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(temp.path(), true);

        let err = orchestrator.connect("deadbeef").await.unwrap_err();
        assert!(err.to_string().contains("wrong length"));
        assert_eq!(orchestrator.availability(), AvailabilityState::Available);
        assert!(orchestrator.endpoint_id().is_none());
        assert!(!temp.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_fallback_and_retry() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = fallback_orchestrator(temp.path());

        assert!(orchestrator.connect("").await.is_err());
        let kind = orchestrator.connect("deadbeef").await.unwrap();
        assert_eq!(kind, DataSourceKind::LocalFallback);
        assert_eq!(orchestrator.state(), ConnectState::Fallback);
        assert_eq!(orchestrator.source_kind(), Some(DataSourceKind::LocalFallback));
    }

    #[tokio::test]
    async fn test_read_before_connect_fails() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = fallback_orchestrator(temp.path());
        assert!(matches!(
            orchestrator.read("translations.json").await,
            Err(DriveError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_translate_without_dictionary_passes_through() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = fallback_orchestrator(temp.path());
        orchestrator.connect("deadbeef").await.unwrap();

        let text = orchestrator.translate("Hello", "en", "es").await.unwrap();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_disconnect_emits_and_resets() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = fallback_orchestrator(temp.path());
        orchestrator.connect("deadbeef").await.unwrap();

        let mut status = orchestrator.subscribe_status();
        orchestrator.disconnect().await;
        assert_eq!(status.recv().await.unwrap(), StatusEvent::Disconnected);
        assert_eq!(orchestrator.state(), ConnectState::Idle);
        assert!(orchestrator.source_kind().is_none());

        // A second disconnect has nothing to release.
        orchestrator.disconnect().await;
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fallback_translate_sees_edited_dictionary() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = fallback_orchestrator(temp.path());
        let fallback = temp.path().join("fallback");
        std::fs::create_dir_all(&fallback).unwrap();
        let translations = fallback.join(crate::dictionary::TRANSLATIONS_FILE);

        std::fs::write(&translations, r#"{"en": {"hello": "hello"}, "es": {"hello": "hola"}}"#)
            .unwrap();
        orchestrator.connect("deadbeef").await.unwrap();
        assert_eq!(orchestrator.translate("Hello", "en", "es").await.unwrap(), "hola");

        std::fs::write(&translations, r#"{"en": {"hello": "hello"}, "es": {"hello": "buenas"}}"#)
            .unwrap();
        assert_eq!(orchestrator.translate("Hello", "en", "es").await.unwrap(), "buenas");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_drive_times_out_and_allows_retry() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = p2p_orchestrator(temp.path(), 1);

        let err = orchestrator.connect(&unhosted_key(7)).await.unwrap_err();
        assert!(matches!(err, DriveError::Connection(_)), "{err}");
        assert!(err.to_string().contains("not ready"));
        assert!(orchestrator.session().is_none());
        assert!(orchestrator.source_kind().is_none());
        assert!(matches!(orchestrator.state(), ConnectState::Failed(_)));

        // The failed attempt released everything; another one runs normally.
        let mut states = orchestrator.subscribe_state();
        let err = orchestrator.connect(&unhosted_key(8)).await.unwrap_err();
        assert!(matches!(err, DriveError::Connection(_)), "{err}");
        assert!(states.has_changed().unwrap());
        assert!(orchestrator.session().is_none());

        orchestrator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_abandons_connect_in_progress() {
        let temp = tempfile::tempdir().unwrap();
        let orchestrator = Arc::new(p2p_orchestrator(temp.path(), 600));

        let mut states = orchestrator.subscribe_state();
        let connect = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.connect(&unhosted_key(9)).await })
        };
        tokio::time::timeout(
            std::time::Duration::from_secs(30),
            states.wait_for(|state| *state == ConnectState::AwaitReady),
        )
        .await
        .unwrap()
        .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(10), orchestrator.shutdown())
            .await
            .expect("shutdown waited for the connect");

        let err = connect.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"), "{err}");
        assert!(orchestrator.session().is_none());
        assert!(orchestrator.endpoint_id().is_none());
    }
}

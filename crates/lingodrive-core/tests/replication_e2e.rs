//! End-to-end replication tests
//!
//! A [`Publisher`] serves a temp directory as a drive; an [`Orchestrator`]
//! connects with the drive key, replicates it over iroh and mirrors it into
//! its own snapshot directory.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use lingodrive_core::{
    BlobStore, Config, ConnectState, DataSourceKind, LocalSnapshot, Orchestrator, Publisher,
    StatusEvent, Storage, TRANSLATIONS_FILE,
};
use tempfile::TempDir;

const TRANSLATIONS: &str = r#"{
    "en": {"hello": "hello", "world": "world", "good_morning": "good morning"},
    "es": {"hello": "hola", "world": "mundo", "good_morning": "buenos días"}
}"#;

/// A publishing node with its own state and source directory
struct TestPublisher {
    publisher: Publisher,
    source: TempDir,
    _state: TempDir,
}

impl TestPublisher {
    async fn start() -> anyhow::Result<Self> {
        let source = tempfile::tempdir()?;
        std::fs::write(source.path().join(TRANSLATIONS_FILE), TRANSLATIONS)?;
        std::fs::create_dir_all(source.path().join("notes"))?;
        std::fs::write(source.path().join("notes/readme.txt"), "read me")?;

        let state = tempfile::tempdir()?;
        let storage = Storage::new(state.path().join("host.redb"))?;
        let publisher =
            Publisher::start(source.path(), BlobStore::new_memory(), storage, Vec::new()).await?;

        Ok(Self {
            publisher,
            source,
            _state: state,
        })
    }

    fn write(&self, path: &str, contents: &str) {
        let target = self.source.path().join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(target, contents).unwrap();
    }
}

fn reader_config(base: &Path) -> Config {
    let mut config = Config::with_base(base);
    config.p2p.join_timeout_secs = 10;
    config.p2p.ready_timeout_secs = 30;
    config.p2p.discovery_window_secs = 2;
    config
}

/// Poll until `check` holds or the timeout passes.
async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok()
}

/// Relative paths of every file under a mirror directory
async fn mirrored_files(dir: &Path) -> anyhow::Result<BTreeSet<String>> {
    Ok(LocalSnapshot::open(dir).await?.written().clone())
}

/// Paths the reader's current session holds
async fn session_files(reader: &Orchestrator) -> anyhow::Result<BTreeSet<String>> {
    let session = reader
        .session()
        .ok_or_else(|| anyhow::anyhow!("no session"))?;
    Ok(session.snapshot().await?.manifest.entries.keys().cloned().collect())
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_replicates_and_mirrors() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let host = TestPublisher::start().await?;
    let reader_dir = tempfile::tempdir()?;
    let config = reader_config(reader_dir.path());
    let mirror = config.mirror_dir(host.publisher.key());

    let reader = Orchestrator::new(config);
    reader.add_peer_addr(host.publisher.endpoint_addr());
    let mut events = reader.subscribe_status();

    let kind = reader.connect(&host.publisher.key().to_hex()).await?;
    assert_eq!(kind, DataSourceKind::PeerToPeer);
    assert_eq!(reader.state(), ConnectState::Ready);

    // Mirror is byte-identical to the source.
    for path in [TRANSLATIONS_FILE, "notes/readme.txt"] {
        let original = std::fs::read(host.source.path().join(path))?;
        let mirrored = std::fs::read(mirror.join(path))?;
        assert_eq!(mirrored, original, "{} differs", path);
    }

    let seen = drain(&mut events);
    for expected in [
        StatusEvent::Initializing,
        StatusEvent::ProbingModules,
        StatusEvent::OpeningStore,
        StatusEvent::JoiningSwarm,
        StatusEvent::AwaitingReady,
        StatusEvent::DataSource(DataSourceKind::PeerToPeer),
        StatusEvent::Ready,
    ] {
        assert!(seen.contains(&expected), "missing {:?} in {:?}", expected, seen);
    }
    assert!(seen
        .iter()
        .any(|e| matches!(e, StatusEvent::Mirrored { files: 2, .. })));

    assert_eq!(reader.translate("Hello World", "en", "es").await?, "hola mundo");
    assert_eq!(reader.translate("good morning", "en", "es").await?, "buenos días");
    assert_eq!(reader.read("notes/readme.txt").await?.as_ref(), b"read me");

    reader.shutdown().await;
    host.publisher.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_source_changes_follow_into_mirror() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let host = TestPublisher::start().await?;
    let reader_dir = tempfile::tempdir()?;
    let config = reader_config(reader_dir.path());
    let mirror = config.mirror_dir(host.publisher.key());

    let reader = Orchestrator::new(config);
    reader.add_peer_addr(host.publisher.endpoint_addr());
    reader.connect(&host.publisher.key().to_hex()).await?;
    assert!(mirror.join("notes/readme.txt").exists());

    // New file and a changed dictionary.
    host.write("notes/extra.txt", "more");
    host.write(
        TRANSLATIONS_FILE,
        r#"{"en": {"hello": "hello"}, "es": {"hello": "buenas"}}"#,
    );
    assert_eq!(host.publisher.rescan().await?, Some(2));

    assert!(
        wait_for(Duration::from_secs(20), || mirror.join("notes/extra.txt").exists()).await,
        "new file never reached the mirror"
    );
    reader.wait_mirror_idle().await;
    assert_eq!(reader.session().and_then(|s| s.version()), Some(2));
    assert_eq!(reader.translate("hello", "en", "es").await?, "buenas");

    // Removal prunes the mirror.
    std::fs::remove_file(host.source.path().join("notes/readme.txt"))?;
    assert_eq!(host.publisher.rescan().await?, Some(3));

    assert!(
        wait_for(Duration::from_secs(20), || !mirror
            .join("notes/readme.txt")
            .exists())
        .await,
        "removed file still mirrored"
    );
    assert_eq!(std::fs::read(mirror.join("notes/extra.txt"))?, b"more");

    reader.shutdown().await;
    host.publisher.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_to_other_drive_releases_previous() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let first = TestPublisher::start().await?;
    first.write("only-first.txt", "1");
    first.publisher.rescan().await?;
    let second = TestPublisher::start().await?;
    second.write("only-second.txt", "2");
    second.publisher.rescan().await?;

    let reader_dir = tempfile::tempdir()?;
    let config = reader_config(reader_dir.path());
    let first_mirror = config.mirror_dir(first.publisher.key());
    let second_mirror = config.mirror_dir(second.publisher.key());
    let reader = Orchestrator::new(config);
    reader.add_peer_addr(first.publisher.endpoint_addr());
    reader.add_peer_addr(second.publisher.endpoint_addr());

    reader.connect(&first.publisher.key().to_hex()).await?;
    let first_session = reader.session().unwrap();
    reader.wait_mirror_idle().await;
    assert!(first_mirror.join("only-first.txt").exists());

    reader.connect(&second.publisher.key().to_hex()).await?;
    assert!(first_session.is_closed());
    assert_eq!(reader.session().unwrap().key(), second.publisher.key());
    assert_eq!(reader.read("only-second.txt").await?.as_ref(), b"2");

    // The second drive's mirror holds exactly its own tree.
    reader.wait_mirror_idle().await;
    let expected = session_files(&reader).await?;
    assert!(expected.contains("only-second.txt"));
    assert!(!expected.contains("only-first.txt"));
    assert_eq!(mirrored_files(&second_mirror).await?, expected);

    reader.shutdown().await;
    first.publisher.shutdown().await;
    second.publisher.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_prunes_files_removed_while_offline() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let host = TestPublisher::start().await?;
    let reader_dir = tempfile::tempdir()?;
    let mirror = reader_config(reader_dir.path()).mirror_dir(host.publisher.key());

    {
        let reader = Orchestrator::new(reader_config(reader_dir.path()));
        reader.add_peer_addr(host.publisher.endpoint_addr());
        reader.connect(&host.publisher.key().to_hex()).await?;
        reader.wait_mirror_idle().await;
        assert!(mirror.join("notes/readme.txt").exists());
        reader.shutdown().await;
    }

    std::fs::remove_file(host.source.path().join("notes/readme.txt"))?;
    assert_eq!(host.publisher.rescan().await?, Some(2));

    // A fresh node state sharing the old mirror directory.
    let restart_dir = tempfile::tempdir()?;
    let mut config = reader_config(restart_dir.path());
    config.snapshot_dir = reader_config(reader_dir.path()).snapshot_dir;
    let reader = Orchestrator::new(config);
    reader.add_peer_addr(host.publisher.endpoint_addr());
    reader.connect(&host.publisher.key().to_hex()).await?;

    assert!(
        wait_for(Duration::from_secs(20), || !mirror
            .join("notes/readme.txt")
            .exists())
        .await,
        "file removed while offline still mirrored"
    );
    reader.wait_mirror_idle().await;
    assert_eq!(mirrored_files(&mirror).await?, session_files(&reader).await?);
    assert!(!mirror.join("notes").exists());

    reader.shutdown().await;
    host.publisher.shutdown().await;
    Ok(())
}

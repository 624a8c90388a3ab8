//! Block store - iroh-blobs integration for drive content
//!
//! Every file of a drive is stored as one content-addressed blob. Manifests
//! only carry hashes, so the store is shared by all sessions and hosts of a
//! node and identical files across drives are stored once.
//!
//! # Storage Modes
//!
//! - **Memory**: In-memory storage, lost on restart. Use for tests.
//! - **Persistent**: FsStore-based, persisted to `data_dir/blobs/`.

use std::path::Path;

use bytes::Bytes;
use iroh::{Endpoint, EndpointId};
use iroh_blobs::store::fs::FsStore;
use iroh_blobs::store::mem::MemStore;
use iroh_blobs::Hash;
use tracing::{debug, info};

use crate::error::{DriveError, DriveResult};

/// The underlying store type (memory or persistent)
#[derive(Clone)]
enum StoreInner {
    Memory(MemStore),
    Persistent(FsStore),
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreInner::Memory(_) => write!(f, "MemStore"),
            StoreInner::Persistent(_) => write!(f, "FsStore"),
        }
    }
}

/// Content-addressed storage for drive files.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone, Debug)]
pub struct BlobStore {
    inner: StoreInner,
}

impl BlobStore {
    /// Create a block store backed by memory.
    pub fn new_memory() -> Self {
        info!("Creating in-memory block store");
        Self {
            inner: StoreInner::Memory(MemStore::new()),
        }
    }

    /// Create a block store persisted under `path`.
    ///
    /// The directory is created if it doesn't exist.
    pub async fn new_persistent(path: &Path) -> DriveResult<Self> {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            DriveError::Blob(format!("Failed to create blob directory {:?}: {}", path, e))
        })?;

        info!(?path, "Creating persistent block store with FsStore");
        let store = FsStore::load(path).await.map_err(|e| {
            DriveError::Blob(format!("Failed to load FsStore at {:?}: {}", path, e))
        })?;

        Ok(Self {
            inner: StoreInner::Persistent(store),
        })
    }

    /// Check if this is a persistent (FsStore) block store.
    pub fn is_persistent(&self) -> bool {
        matches!(self.inner, StoreInner::Persistent(_))
    }

    /// The store as the generic iroh-blobs API handle.
    pub fn store(&self) -> iroh_blobs::api::Store {
        match &self.inner {
            StoreInner::Memory(store) => store.as_ref().clone(),
            StoreInner::Persistent(store) => store.clone().into(),
        }
    }

    fn blobs(&self) -> &iroh_blobs::api::blobs::Blobs {
        match &self.inner {
            StoreInner::Memory(store) => store.blobs(),
            StoreInner::Persistent(store) => store.blobs(),
        }
    }

    /// Import bytes and return their BLAKE3 hash.
    pub async fn import_bytes(&self, data: impl Into<Bytes>) -> DriveResult<Hash> {
        let data: Bytes = data.into();
        let len = data.len();

        let tag = self
            .blobs()
            .add_bytes(data)
            .temp_tag()
            .await
            .map_err(|e| DriveError::Blob(format!("Failed to import blob: {}", e)))?;

        let hash = tag.hash();
        debug!(%hash, len, "Imported blob");
        Ok(hash)
    }

    /// Read a complete blob.
    ///
    /// Returns `None` if the blob isn't stored locally.
    pub async fn get_bytes(&self, hash: &Hash) -> DriveResult<Option<Bytes>> {
        if !self.has_blob(hash).await? {
            return Ok(None);
        }

        let data = self
            .blobs()
            .get_bytes(*hash)
            .await
            .map_err(|e| DriveError::Blob(format!("Failed to get blob: {}", e)))?;

        Ok(Some(data))
    }

    /// Check if a complete blob exists in the local store.
    pub async fn has_blob(&self, hash: &Hash) -> DriveResult<bool> {
        self.blobs()
            .has(*hash)
            .await
            .map_err(|e| DriveError::Blob(format!("Failed to check blob: {}", e)))
    }

    /// Size of a complete blob, `None` if absent or partial.
    pub async fn blob_size(&self, hash: &Hash) -> DriveResult<Option<u64>> {
        use iroh_blobs::api::blobs::BlobStatus;

        let status = self
            .blobs()
            .status(*hash)
            .await
            .map_err(|e| DriveError::Blob(format!("Failed to get blob status: {}", e)))?;

        match status {
            BlobStatus::Complete { size, .. } => Ok(Some(size)),
            BlobStatus::Partial { .. } | BlobStatus::NotFound => Ok(None),
        }
    }

    /// Fetch a blob from a specific peer over the blobs protocol.
    ///
    /// A no-op if the blob is already complete locally.
    pub async fn fetch_from(
        &self,
        hash: Hash,
        peer: EndpointId,
        endpoint: &Endpoint,
    ) -> DriveResult<()> {
        use n0_future::StreamExt;

        if self.has_blob(&hash).await? {
            return Ok(());
        }

        debug!(%hash, %peer, "Fetching blob from peer");
        let downloader = self.store().downloader(endpoint);
        let mut stream = downloader
            .download(hash, vec![peer])
            .stream()
            .await
            .map_err(|e| DriveError::Blob(format!("Failed to start download: {}", e)))?;

        while let Some(event) = stream.next().await {
            debug!(%hash, ?event, "Download progress");
        }

        if !self.has_blob(&hash).await? {
            return Err(DriveError::Blob(format!(
                "Peer {} did not provide blob {}",
                peer.fmt_short(),
                hash
            )));
        }

        debug!(%hash, "Blob fetch complete");
        Ok(())
    }

    /// The iroh-blobs protocol handler serving this store, for the Router.
    pub fn protocol(&self) -> iroh_blobs::BlobsProtocol {
        iroh_blobs::BlobsProtocol::new(&self.store(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_import_and_get_bytes() {
        let store = BlobStore::new_memory();
        let data = Bytes::from_static(b"{\"en\":{}}");

        let hash = store.import_bytes(data.clone()).await.unwrap();
        let hash2 = store.import_bytes(data.clone()).await.unwrap();
        assert_eq!(hash, hash2);
        assert_eq!(hash, Hash::new(b"{\"en\":{}}"));

        let retrieved = store.get_bytes(&hash).await.unwrap();
        assert_eq!(retrieved.unwrap(), data);
    }

    #[tokio::test]
    async fn test_get_nonexistent_blob() {
        let store = BlobStore::new_memory();
        let fake_hash = Hash::from_bytes([0u8; 32]);

        assert!(store.get_bytes(&fake_hash).await.unwrap().is_none());
        assert!(!store.has_blob(&fake_hash).await.unwrap());
        assert!(store.blob_size(&fake_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_size() {
        let store = BlobStore::new_memory();
        let hash = store.import_bytes(vec![7u8; 1000]).await.unwrap();
        assert_eq!(store.blob_size(&hash).await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn test_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new_persistent(&dir.path().join("blobs"))
            .await
            .unwrap();
        assert!(store.is_persistent());

        let hash = store.import_bytes(b"persist me".to_vec()).await.unwrap();
        let data = store.get_bytes(&hash).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"persist me");
        assert!(dir.path().join("blobs").exists());
    }
}

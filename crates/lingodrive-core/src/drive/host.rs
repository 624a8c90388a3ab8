//! Publishing side of a drive
//!
//! A [`DriveHost`] owns the drive's signing key. It imports files into the
//! block store, commits a new signed manifest whenever the tree changes and
//! publishes the head for the drive protocol handler to serve.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use rand::RngCore;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{validate_path, DriveHead, DriveManifest, ManifestEntry};
use crate::blobs::BlobStore;
use crate::error::{DriveError, DriveResult};
use crate::key::DriveKey;
use crate::storage::Storage;

/// Publisher of one drive
pub struct DriveHost {
    signing_key: SigningKey,
    key: DriveKey,
    blobs: BlobStore,
    storage: Option<Storage>,
    manifest: RwLock<DriveManifest>,
    head: watch::Sender<Option<DriveHead>>,
}

impl std::fmt::Debug for DriveHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveHost")
            .field("key", &self.key)
            .field("version", &self.version())
            .finish()
    }
}

impl DriveHost {
    /// Host a drive signed by `signing_key`.
    ///
    /// Resumes from the head persisted in `storage`, if any.
    pub fn new(signing_key: SigningKey, blobs: BlobStore, storage: Option<Storage>) -> Self {
        let drive = signing_key.verifying_key().to_bytes();
        let key = DriveKey::from(drive);

        let mut manifest = DriveManifest::empty(drive);
        let mut head = None;
        if let Some(storage) = &storage {
            match storage.load_drive_head(&key) {
                Ok(Some(signed)) => match signed.verify(&drive) {
                    Ok(restored) => {
                        debug!(drive = %key.short(), version = restored.version, "Resumed hosted drive");
                        head = Some(DriveHead {
                            version: restored.version,
                            signed,
                        });
                        manifest = restored;
                    }
                    Err(e) => warn!(drive = %key.short(), error = %e, "Discarding unverifiable head"),
                },
                Ok(None) => {}
                Err(e) => warn!(drive = %key.short(), error = %e, "Failed to load hosted drive head"),
            }
        }

        let (head, _) = watch::channel(head);
        Self {
            signing_key,
            key,
            blobs,
            storage,
            manifest: RwLock::new(manifest),
            head,
        }
    }

    /// Host a drive with a fresh random key.
    pub fn generate(blobs: BlobStore, storage: Option<Storage>) -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::new(SigningKey::from_bytes(&seed), blobs, storage)
    }

    /// Host the drive published from `source`, reusing its key across
    /// restarts.
    pub fn for_source(source: &Path, blobs: BlobStore, storage: Storage) -> DriveResult<Self> {
        let label = source.to_string_lossy().into_owned();
        let seed = match storage.load_hosted_drive(&label)? {
            Some(seed) => seed,
            None => {
                let mut seed = [0u8; 32];
                rand::rng().fill_bytes(&mut seed);
                storage.save_hosted_drive(&label, &seed)?;
                info!(source = %label, "Created new drive key for source directory");
                seed
            }
        };
        Ok(Self::new(SigningKey::from_bytes(&seed), blobs, Some(storage)))
    }

    /// Public key of the drive
    pub fn key(&self) -> &DriveKey {
        &self.key
    }

    /// The drive's signing key; also used as the endpoint identity when
    /// serving, so the drive key doubles as the bootstrap peer id.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Latest committed version (0 before the first commit)
    pub fn version(&self) -> u64 {
        self.manifest.read().version
    }

    /// Copy of the current manifest
    pub fn manifest(&self) -> DriveManifest {
        self.manifest.read().clone()
    }

    /// Receiver of the latest signed head
    pub fn head_watch(&self) -> watch::Receiver<Option<DriveHead>> {
        self.head.subscribe()
    }

    /// Add or replace one file and commit.
    pub async fn put(&self, path: &str, data: impl Into<Bytes>) -> DriveResult<u64> {
        validate_path(path)?;
        let entry = self.import(data.into()).await?;

        let mut entries = self.manifest.read().entries.clone();
        entries.insert(path.to_string(), entry);
        self.commit(entries).map(|v| v.unwrap_or_else(|| self.version()))
    }

    /// Remove one file and commit. Returns `NotFound` if absent.
    pub fn remove(&self, path: &str) -> DriveResult<u64> {
        let mut entries = self.manifest.read().entries.clone();
        if entries.remove(path).is_none() {
            return Err(DriveError::NotFound(path.to_string()));
        }
        self.commit(entries).map(|v| v.unwrap_or_else(|| self.version()))
    }

    /// Replace the whole tree with the files under `dir`.
    ///
    /// Commits only when the tree differs from the current one; returns the
    /// new version in that case.
    pub async fn import_dir(&self, dir: &Path) -> DriveResult<Option<u64>> {
        let mut entries = BTreeMap::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&current).await?;
            while let Some(item) = read_dir.next_entry().await? {
                let file_type = item.file_type().await?;
                let full = item.path();
                if file_type.is_dir() {
                    pending.push(full);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let Some(path) = drive_path(dir, &full) else {
                    warn!(path = ?full, "Skipping file with unsupported name");
                    continue;
                };
                let data = tokio::fs::read(&full).await?;
                entries.insert(path, self.import(Bytes::from(data)).await?);
            }
        }

        self.commit(entries)
    }

    async fn import(&self, data: Bytes) -> DriveResult<ManifestEntry> {
        let len = data.len() as u64;
        let hash = self.blobs.import_bytes(data).await?;
        Ok(ManifestEntry {
            hash: *hash.as_bytes(),
            len,
        })
    }

    /// Commit `entries` as the next version, unless nothing changed.
    fn commit(&self, entries: BTreeMap<String, ManifestEntry>) -> DriveResult<Option<u64>> {
        let mut manifest = self.manifest.write();
        if manifest.version > 0 && manifest.entries == entries {
            return Ok(None);
        }

        let next = DriveManifest {
            drive: manifest.drive,
            version: manifest.version + 1,
            entries,
        };
        let signed = next.sign(&self.signing_key)?;

        if let Some(storage) = &self.storage {
            storage.save_drive_head(&self.key, &signed)?;
        }

        let version = next.version;
        let files = next.len();
        *manifest = next;
        self.head.send_replace(Some(DriveHead { version, signed }));

        info!(drive = %self.key.short(), version, files, "Committed drive manifest");
        Ok(Some(version))
    }
}

/// Relative `/`-separated drive path of `full` under `root`.
fn drive_path(root: &Path, full: &Path) -> Option<String> {
    let relative = full.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    let path = parts.join("/");
    validate_path(&path).ok()?;
    Some(path)
}

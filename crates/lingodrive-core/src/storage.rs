//! Persistent node state using redb.
//!
//! Stores:
//! - The node's endpoint secret key (stable identity across restarts)
//! - The last verified manifest per drive, so sessions resume offline
//! - Signing keys of drives this node publishes, keyed by source directory

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::drive::SignedManifest;
use crate::error::{DriveError, DriveResult};
use crate::key::DriveKey;

const NODE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("node");
const DRIVE_HEADS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("drive_heads");
const HOSTED_DRIVES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hosted_drives");

const ENDPOINT_SECRET_KEY: &str = "endpoint_secret_key";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (or create) the state database at `path`.
    ///
    /// Creates the parent directory and all tables.
    pub fn new(path: impl AsRef<Path>) -> DriveResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(NODE_TABLE)?;
            let _ = write_txn.open_table(DRIVE_HEADS_TABLE)?;
            let _ = write_txn.open_table(HOSTED_DRIVES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn put(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> DriveResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> DriveResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Node identity
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the endpoint secret key.
    pub fn save_endpoint_secret_key(&self, secret: &[u8; 32]) -> DriveResult<()> {
        self.put(NODE_TABLE, ENDPOINT_SECRET_KEY, secret)
    }

    /// Load the endpoint secret key, if one was saved.
    pub fn load_endpoint_secret_key(&self) -> DriveResult<Option<[u8; 32]>> {
        self.get(NODE_TABLE, ENDPOINT_SECRET_KEY)?
            .map(|bytes| {
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    DriveError::Storage(format!(
                        "Endpoint secret key has {} bytes, expected 32",
                        bytes.len()
                    ))
                })
            })
            .transpose()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Drive heads
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist the latest verified manifest of a drive.
    pub fn save_drive_head(&self, drive: &DriveKey, head: &SignedManifest) -> DriveResult<()> {
        self.put(DRIVE_HEADS_TABLE, &drive.to_hex(), &head.encode()?)
    }

    /// Load the latest persisted manifest of a drive.
    ///
    /// The caller still has to verify it.
    pub fn load_drive_head(&self, drive: &DriveKey) -> DriveResult<Option<SignedManifest>> {
        self.get(DRIVE_HEADS_TABLE, &drive.to_hex())?
            .map(|bytes| SignedManifest::decode(&bytes))
            .transpose()
    }

    /// Forget a drive's persisted head.
    pub fn delete_drive_head(&self, drive: &DriveKey) -> DriveResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DRIVE_HEADS_TABLE)?;
            table.remove(drive.to_hex().as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Keys of all drives with a persisted head.
    pub fn list_drive_heads(&self) -> DriveResult<Vec<DriveKey>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DRIVE_HEADS_TABLE)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            let key = crate::key::validate(key.value())?;
            keys.push(key);
        }
        Ok(keys)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Hosted drives
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the signing key seed of a drive published from `source`.
    pub fn save_hosted_drive(&self, source: &str, seed: &[u8; 32]) -> DriveResult<()> {
        self.put(HOSTED_DRIVES_TABLE, source, seed)
    }

    /// Load the signing key seed of the drive published from `source`.
    pub fn load_hosted_drive(&self, source: &str) -> DriveResult<Option<[u8; 32]>> {
        self.get(HOSTED_DRIVES_TABLE, source)?
            .map(|bytes| {
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    DriveError::Storage(format!("Hosted drive key for {} is corrupt", source))
                })
            })
            .transpose()
    }
}

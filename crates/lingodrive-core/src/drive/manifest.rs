//! Signed drive manifests
//!
//! A manifest is the metadata record of a drive: a version number and the
//! content tree, mapping each relative path to the BLAKE3 hash and length of
//! its blob. Manifests travel as [`SignedManifest`]s, signed by the drive's
//! ed25519 key, so any peer can relay them and readers verify them against
//! the drive key they asked for.
//!
//! ## Structure
//!
//! ```text
//! SignedManifest:
//! ┌─────────────────────────────────────────────────────────┐
//! │  manifest: postcard(DriveManifest)                      │
//! │    drive: [u8; 32]     - drive public key               │
//! │    version: u64        - monotonic commit counter       │
//! │    entries: path -> { hash: [u8; 32], len: u64 }        │
//! │  signature: ed25519 over the manifest bytes             │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use iroh_blobs::Hash;
use serde::{Deserialize, Serialize};

use crate::error::{DriveError, DriveResult};
use crate::key::DRIVE_KEY_LEN;

/// One file in a drive's content tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// BLAKE3 hash of the file content (iroh-blobs hash)
    pub hash: [u8; 32],
    /// Content length in bytes
    pub len: u64,
}

impl ManifestEntry {
    /// The blob hash of this entry
    pub fn blob_hash(&self) -> Hash {
        Hash::from_bytes(self.hash)
    }
}

/// Versioned content tree of a drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveManifest {
    /// Public key of the drive this manifest belongs to
    pub drive: [u8; DRIVE_KEY_LEN],
    /// Commit counter, strictly increasing per drive
    pub version: u64,
    /// Relative path -> blob
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl DriveManifest {
    /// Empty manifest at version 0
    pub fn empty(drive: [u8; DRIVE_KEY_LEN]) -> Self {
        Self {
            drive,
            version: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Number of files in the tree
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree has no files
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up one path
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    /// Sign this manifest with the drive's key
    pub fn sign(&self, signing_key: &SigningKey) -> DriveResult<SignedManifest> {
        if signing_key.verifying_key().to_bytes() != self.drive {
            return Err(DriveError::Signature(
                "signing key does not match manifest drive".to_string(),
            ));
        }

        let manifest = postcard::to_allocvec(self).map_err(|e| {
            DriveError::Serialization(format!("Failed to encode manifest: {}", e))
        })?;
        let signature = signing_key.sign(&manifest);

        Ok(SignedManifest {
            manifest,
            signature: signature.to_bytes().to_vec(),
        })
    }
}

/// Check that a drive path is safe to materialize under a snapshot root.
///
/// Paths are `/`-separated and relative. Empty, `.` and `..` components are
/// rejected, as are backslashes and NUL bytes.
pub fn validate_path(path: &str) -> DriveResult<()> {
    let bad = |why: &str| DriveError::Signature(format!("Unsafe path {:?}: {}", path, why));

    if path.is_empty() {
        return Err(bad("empty"));
    }
    if path.starts_with('/') {
        return Err(bad("absolute"));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(bad("forbidden character"));
    }
    for component in path.split('/') {
        match component {
            "" => return Err(bad("empty component")),
            "." | ".." => return Err(bad("relative component")),
            _ => {}
        }
    }
    Ok(())
}

/// Manifest bytes plus the drive's signature over them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedManifest {
    /// postcard-encoded [`DriveManifest`]
    pub manifest: Vec<u8>,
    /// ed25519 signature (64 bytes)
    pub signature: Vec<u8>,
}

impl SignedManifest {
    /// Verify the signature against `drive` and decode the manifest.
    ///
    /// Also rejects manifests addressed to another drive and manifests with
    /// unsafe paths.
    pub fn verify(&self, drive: &[u8; DRIVE_KEY_LEN]) -> DriveResult<DriveManifest> {
        let verifying_key = VerifyingKey::from_bytes(drive)
            .map_err(|e| DriveError::Signature(format!("Invalid drive key: {}", e)))?;

        let signature_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| DriveError::Signature("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&signature_bytes);

        verifying_key
            .verify(&self.manifest, &signature)
            .map_err(|e| DriveError::Signature(format!("Manifest signature rejected: {}", e)))?;

        let manifest: DriveManifest = postcard::from_bytes(&self.manifest).map_err(|e| {
            DriveError::Serialization(format!("Failed to decode manifest: {}", e))
        })?;

        if &manifest.drive != drive {
            return Err(DriveError::Signature(
                "manifest belongs to a different drive".to_string(),
            ));
        }
        for path in manifest.entries.keys() {
            validate_path(path)?;
        }

        Ok(manifest)
    }

    /// Encode for persistence
    pub fn encode(&self) -> DriveResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| DriveError::Serialization(format!("Failed to encode signed manifest: {}", e)))
    }

    /// Decode from persistence
    pub fn decode(bytes: &[u8]) -> DriveResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| DriveError::Serialization(format!("Failed to decode signed manifest: {}", e)))
    }
}

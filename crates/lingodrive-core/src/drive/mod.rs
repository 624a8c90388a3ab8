//! Drives: signed manifests, reader sessions and the publishing host

mod host;
mod manifest;
mod session;

pub use host::DriveHost;
pub use manifest::{validate_path, DriveManifest, ManifestEntry, SignedManifest};
pub use session::{ChangeEvent, DriveSession, SessionSnapshot, SessionState};

/// The latest signed manifest of a drive, as served to peers.
///
/// Hosts and sessions publish their head on a `watch` channel; the drive
/// protocol handler streams every new head to subscribed readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveHead {
    /// Manifest version
    pub version: u64,
    /// The signed manifest itself
    pub signed: SignedManifest,
}

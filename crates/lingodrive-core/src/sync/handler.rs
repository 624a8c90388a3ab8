//! Serving side of the drive protocol
//!
//! Registered with the Router under [`DRIVE_ALPN`]. Each incoming stream
//! carries one `Subscribe`; the handler answers from the [`DriveRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::ProtocolHandler;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::protocol::{framed, recv_message, send_message, DriveMessage, DRIVE_ALPN};
use crate::drive::DriveHead;
use crate::error::{DriveError, DriveResult};
use crate::key::{DriveKey, DRIVE_KEY_LEN};

type HeadWatch = watch::Receiver<Option<DriveHead>>;

/// Drives this node can serve, keyed by drive public key.
///
/// Entries whose publisher has gone away are pruned on lookup.
#[derive(Clone, Default)]
pub struct DriveRegistry {
    drives: Arc<RwLock<HashMap<[u8; DRIVE_KEY_LEN], HeadWatch>>>,
}

impl std::fmt::Debug for DriveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveRegistry")
            .field("drives", &self.drives.read().len())
            .finish()
    }
}

impl DriveRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `drive` from `head`, replacing any previous registration.
    pub fn register(&self, drive: &DriveKey, head: HeadWatch) -> DriveResult<()> {
        let bytes = drive.require_drive_len()?;
        self.drives.write().insert(bytes, head);
        debug!(drive = %drive.short(), "Drive registered for serving");
        Ok(())
    }

    /// Stop serving `drive`.
    pub fn unregister(&self, drive: &DriveKey) {
        if let Ok(bytes) = drive.require_drive_len() {
            self.drives.write().remove(&bytes);
        }
    }

    /// Number of registered drives
    pub fn len(&self) -> usize {
        self.drives.read().len()
    }

    /// Whether no drive is registered
    pub fn is_empty(&self) -> bool {
        self.drives.read().is_empty()
    }

    fn lookup(&self, drive: &[u8; DRIVE_KEY_LEN]) -> Option<HeadWatch> {
        let mut drives = self.drives.write();
        let closed = drives
            .get(drive)
            .map(|rx| rx.has_changed().is_err())
            .unwrap_or(false);
        if closed {
            drives.remove(drive);
            return None;
        }
        drives.get(drive).cloned()
    }
}

/// Protocol handler streaming drive manifests to subscribed readers
#[derive(Clone, Debug)]
pub struct DriveProtocolHandler {
    registry: DriveRegistry,
}

impl DriveProtocolHandler {
    /// Create a handler serving from `registry`
    pub fn new(registry: DriveRegistry) -> Self {
        Self { registry }
    }

    /// Get the ALPN identifier for this protocol
    pub const fn alpn() -> &'static [u8] {
        DRIVE_ALPN
    }

    /// Accept streams until the connection closes; each is served in its
    /// own task.
    async fn handle_connection(connection: Connection, registry: DriveRegistry) -> DriveResult<()> {
        let remote_id = connection.remote_id();
        debug!(peer = %remote_id.fmt_short(), "Handling drive connection");

        let mut streams = tokio::task::JoinSet::new();
        loop {
            let (send, recv) = match connection.accept_bi().await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(peer = %remote_id.fmt_short(), reason = %e, "Drive connection ended");
                    break;
                }
            };

            let registry = registry.clone();
            streams.spawn(async move {
                if let Err(e) = Self::serve_stream(send, recv, registry).await {
                    warn!(peer = %remote_id.fmt_short(), error = %e, "Drive stream failed");
                }
            });
            while streams.try_join_next().is_some() {}
        }

        streams.abort_all();
        Ok(())
    }

    async fn serve_stream(
        send: iroh::endpoint::SendStream,
        recv: iroh::endpoint::RecvStream,
        registry: DriveRegistry,
    ) -> DriveResult<()> {
        let (mut writer, mut reader) = framed(send, recv);

        let (drive, mut known_version) = match recv_message(&mut reader).await? {
            Some(DriveMessage::Subscribe {
                drive,
                known_version,
            }) => (drive, known_version),
            Some(other) => {
                send_message(
                    &mut writer,
                    &DriveMessage::Error {
                        reason: "expected Subscribe".to_string(),
                    },
                )
                .await?;
                return Err(DriveError::Network(format!(
                    "Unexpected first message: {:?}",
                    other
                )));
            }
            None => return Ok(()),
        };
        let short = DriveKey::from(drive).short();

        let Some(mut head) = registry.lookup(&drive) else {
            debug!(drive = %short, "Subscribe for drive not hosted here");
            send_message(&mut writer, &DriveMessage::NotHosted).await?;
            return Ok(());
        };

        info!(drive = %short, ?known_version, "Serving drive subscription");
        loop {
            let current = head.borrow_and_update().clone();
            match current {
                Some(current) if known_version.map_or(true, |known| current.version > known) => {
                    send_message(&mut writer, &DriveMessage::Manifest(current.signed)).await?;
                    debug!(drive = %short, version = current.version, "Sent manifest");
                    known_version = Some(current.version);
                }
                Some(_) => {}
                // Publisher closed
                None if known_version.is_some() => break,
                // Registered but nothing to serve yet
                None => {}
            }

            tokio::select! {
                changed = head.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = recv_message(&mut reader) => {
                    // The reader only ever finishes its half
                    match next {
                        Ok(None) | Err(_) => break,
                        Ok(Some(msg)) => {
                            warn!(drive = %short, ?msg, "Ignoring message after Subscribe");
                        }
                    }
                }
            }
        }

        debug!(drive = %short, "Drive subscription ended");
        Ok(())
    }
}

impl ProtocolHandler for DriveProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let registry = self.registry.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting drive connection");

            if let Err(e) = Self::handle_connection(conn, registry).await {
                error!(error = ?e, "Failed to handle drive connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_prune() {
        let registry = DriveRegistry::new();
        let key = DriveKey::from([1u8; 32]);

        let (tx, rx) = watch::channel(None);
        registry.register(&key, rx).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&[1u8; 32]).is_some());

        drop(tx);
        assert!(registry.lookup(&[1u8; 32]).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_rejects_short_key() {
        let registry = DriveRegistry::new();
        let (_tx, rx) = watch::channel(None);
        let short = crate::key::validate("deadbeef").unwrap();
        assert!(registry.register(&short, rx).is_err());
    }

    #[test]
    fn test_unregister() {
        let registry = DriveRegistry::new();
        let key = DriveKey::from([2u8; 32]);
        let (_tx, rx) = watch::channel(None);
        registry.register(&key, rx).unwrap();
        registry.unregister(&key);
        assert!(registry.is_empty());
    }
}

//! Where lookups read their documents from
//!
//! Selected once per connect: the replicated drive when peer-to-peer mode is
//! available, a plain directory otherwise.

use std::path::PathBuf;

use bytes::Bytes;
use tracing::debug;

use crate::dictionary::{Dictionary, TRANSLATIONS_FILE};
use crate::drive::{validate_path, DriveSession};
use crate::error::{DriveError, DriveResult};
use crate::mirror::read_optional;
use crate::status::DataSourceKind;

/// A readable document tree
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Content of a replicated drive session
    PeerToPeer(DriveSession),
    /// Files under a local directory
    LocalFallback(PathBuf),
}

impl DataSource {
    pub fn kind(&self) -> DataSourceKind {
        match self {
            DataSource::PeerToPeer(_) => DataSourceKind::PeerToPeer,
            DataSource::LocalFallback(_) => DataSourceKind::LocalFallback,
        }
    }

    /// Read one document.
    ///
    /// # Errors
    ///
    /// `NotFound` if the path is absent. A peer-to-peer read waits for the
    /// session to become ready.
    pub async fn read(&self, path: &str) -> DriveResult<Bytes> {
        validate_path(path)?;
        let found = match self {
            DataSource::PeerToPeer(session) => session.get(path).await?,
            DataSource::LocalFallback(root) => {
                let file = path.split('/').fold(root.clone(), |acc, part| acc.join(part));
                read_optional(&file).await?
            }
        };
        debug!(path, source = %self.kind(), found = found.is_some(), "Data source read");
        found.ok_or_else(|| DriveError::NotFound(path.to_string()))
    }

    /// Load and parse `translations.json`.
    pub async fn dictionary(&self) -> DriveResult<Dictionary> {
        let data = self.read(TRANSLATIONS_FILE).await?;
        Dictionary::from_json(&data)
    }
}

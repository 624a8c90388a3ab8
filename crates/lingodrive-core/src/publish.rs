//! Serving a local directory as a drive
//!
//! The publisher's endpoint identity is the drive's signing key, so the
//! drive key a reader pastes is also the endpoint id it bootstraps from.

use std::path::{Path, PathBuf};

use iroh::{EndpointAddr, EndpointId, SecretKey};
use tracing::info;

use crate::blobs::BlobStore;
use crate::drive::DriveHost;
use crate::error::DriveResult;
use crate::key::DriveKey;
use crate::storage::Storage;
use crate::sync::{derive_discovery_topic, JoinOptions, Swarm, SwarmOptions, TopicJoin};

/// A directory published as a drive and served to readers.
#[derive(Debug)]
pub struct Publisher {
    source: PathBuf,
    host: DriveHost,
    swarm: Swarm,
    join: Option<TopicJoin>,
}

impl Publisher {
    /// Import `source`, bind an endpoint under the drive key and start
    /// serving.
    pub async fn start(
        source: &Path,
        blobs: BlobStore,
        storage: Storage,
        bootstrap: Vec<EndpointId>,
    ) -> DriveResult<Self> {
        let host = DriveHost::for_source(source, blobs.clone(), storage)?;
        Self::serve(source, host, &blobs, bootstrap).await
    }

    /// Serve an existing host, importing `source` into it first.
    pub async fn serve(
        source: &Path,
        host: DriveHost,
        blobs: &BlobStore,
        bootstrap: Vec<EndpointId>,
    ) -> DriveResult<Self> {
        host.import_dir(source).await?;

        let swarm = Swarm::bind(
            blobs,
            SwarmOptions {
                secret_key: Some(SecretKey::from(host.signing_key().to_bytes())),
                serve: true,
            },
        )
        .await?;
        swarm.registry().register(host.key(), host.head_watch())?;

        let join = swarm
            .join(
                derive_discovery_topic(host.key()),
                JoinOptions::server_only(),
                bootstrap,
            )
            .await?;

        info!(
            drive = %host.key(),
            version = host.version(),
            source = %source.display(),
            "Publishing drive"
        );
        Ok(Self {
            source: source.to_path_buf(),
            host,
            swarm,
            join: Some(join),
        })
    }

    pub fn key(&self) -> &DriveKey {
        self.host.key()
    }

    pub fn host(&self) -> &DriveHost {
        &self.host
    }

    pub fn version(&self) -> u64 {
        self.host.version()
    }

    /// Address readers can dial directly
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.swarm.endpoint_addr()
    }

    /// Re-import the source directory. Returns the new version if the tree
    /// changed.
    pub async fn rescan(&self) -> DriveResult<Option<u64>> {
        self.host.import_dir(&self.source).await
    }

    /// Stop serving and close the endpoint.
    pub async fn shutdown(mut self) {
        self.swarm.registry().unregister(self.host.key());
        if let Some(join) = self.join.take() {
            join.leave();
        }
        self.swarm.shutdown().await;
    }
}

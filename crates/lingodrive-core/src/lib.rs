//! lingodrive core library
//!
//! Replicated-drive sync client with a local mirror and dictionary lookup.
//!
//! ## Overview
//!
//! A drive is a signed, versioned tree of files published under an ed25519
//! public key. Readers paste that key, join the drive's discovery topic on
//! iroh-gossip, replicate the manifest and its blobs from any peer that has
//! them, and mirror the tree into a local directory that follows every
//! change. When peer-to-peer networking is unavailable, lookups read a local
//! fallback directory instead.
//!
//! ## Core Principles
//!
//! - **Verify, then accept**: every manifest is signature-checked against the
//!   drive key before its content reaches a session
//! - **Local-first**: the last verified manifest is persisted, so a drive
//!   whose blobs are stored locally opens without peers
//! - **Degrade, don't crash**: missing P2P capabilities select the local
//!   data source instead of failing
//!
//! ## Quick Start
//!
//! ```ignore
//! use lingodrive_core::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(Config::default());
//!     let mut status = orchestrator.subscribe_status();
//!     tokio::spawn(async move {
//!         while let Ok(event) = status.recv().await {
//!             println!("{}", event);
//!         }
//!     });
//!
//!     orchestrator.connect("<64 hex chars>").await?;
//!     println!("{}", orchestrator.translate("Hello world", "en", "es").await?);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod blobs;
pub mod config;
pub mod dictionary;
pub mod drive;
pub mod error;
pub mod key;
pub mod logging;
pub mod mirror;
pub mod orchestrator;
pub mod probe;
pub mod publish;
pub mod source;
pub mod status;
pub mod storage;
pub mod sync;

// Re-exports
pub use blobs::BlobStore;
pub use config::{Config, LoggingConfig, P2pConfig};
pub use dictionary::{Dictionary, TRANSLATIONS_FILE};
pub use drive::{
    ChangeEvent, DriveHead, DriveHost, DriveManifest, DriveSession, ManifestEntry,
    SessionSnapshot, SessionState, SignedManifest,
};
pub use error::{DriveError, DriveResult, InvalidKeyReason};
pub use key::{validate, DriveKey, DRIVE_KEY_LEN};
pub use mirror::{CoalescingRunner, LocalSnapshot, MirrorScheduler, MirrorSynchronizer};
pub use orchestrator::{ConnectState, Orchestrator};
pub use probe::{AvailabilityState, Capability, ModuleProbe};
pub use publish::Publisher;
pub use source::DataSource;
pub use status::{DataSourceKind, StatusEvent};
pub use storage::Storage;
pub use sync::{
    derive_discovery_topic, FlushOutcome, JoinOptions, PeerConnection, Replicator, Swarm,
    SwarmOptions, TopicJoin, DRIVE_ALPN,
};

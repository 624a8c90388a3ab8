//! Status events for a presentation layer
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  StatusEvent: what the orchestrator is doing right now          │
//! │  ├── Initializing / ProbingModules / OpeningStore               │
//! │  ├── JoiningSwarm / PeerConnected / AwaitingReady               │
//! │  ├── Mirroring / Mirrored / Ready                               │
//! │  ├── DataSource: peer-to-peer | local fallback                  │
//! │  └── Error / Disconnected                                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are broadcast; the core does not care how they are rendered.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capacity of the status broadcast channel
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Where lookups read `translations.json` from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSourceKind {
    /// A replicated drive session
    PeerToPeer,
    /// A plain local directory
    LocalFallback,
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceKind::PeerToPeer => write!(f, "peer-to-peer"),
            DataSourceKind::LocalFallback => write!(f, "local fallback"),
        }
    }
}

/// Discrete status events emitted during connect and sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A connect attempt started
    Initializing,
    /// Checking peer-to-peer capabilities
    ProbingModules,
    /// Opening the state and block stores
    OpeningStore,
    /// Joining the drive's discovery swarm
    JoiningSwarm,
    /// A peer connection was attached to replication
    PeerConnected {
        /// Short peer id
        peer: String,
    },
    /// Waiting for the first verified manifest
    AwaitingReady,
    /// A mirror pass started
    Mirroring,
    /// A mirror pass completed
    Mirrored {
        /// Files written
        files: usize,
        /// Session change counter the pass reflects
        seq: u64,
    },
    /// Connected and mirrored
    Ready,
    /// Connect failed
    Error(String),
    /// The data source was selected
    DataSource(DataSourceKind),
    /// The connection was released
    Disconnected,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Initializing => write!(f, "initializing"),
            StatusEvent::ProbingModules => write!(f, "probing modules"),
            StatusEvent::OpeningStore => write!(f, "opening store"),
            StatusEvent::JoiningSwarm => write!(f, "joining swarm"),
            StatusEvent::PeerConnected { peer } => write!(f, "peer connected: {}", peer),
            StatusEvent::AwaitingReady => write!(f, "awaiting drive"),
            StatusEvent::Mirroring => write!(f, "mirroring"),
            StatusEvent::Mirrored { files, seq } => {
                write!(f, "mirrored {} files (seq {})", files, seq)
            }
            StatusEvent::Ready => write!(f, "ready"),
            StatusEvent::Error(reason) => write!(f, "error: {}", reason),
            StatusEvent::DataSource(kind) => write!(f, "data source: {}", kind),
            StatusEvent::Disconnected => write!(f, "disconnected"),
        }
    }
}

//! Peer-to-peer layer: discovery, drive protocol and replication
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Swarm                                                          │
//! │  ├── Endpoint (QUIC transport, NAT traversal)                   │
//! │  ├── Gossip (discovery topic membership)                        │
//! │  └── Router (gossip, blobs, drive protocol)                     │
//! │                                                                 │
//! │  TopicJoin (per drive)                                          │
//! │  └── yields PeerConnections for discovered neighbors            │
//! │                                                                 │
//! │  Replicator                                                     │
//! │  ├── one drive stream per (connection, session)                 │
//! │  └── verify manifest -> fetch blobs -> session.accept()         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod handler;
pub mod protocol;
pub mod replicate;
pub mod swarm;
pub mod topic;

pub use handler::{DriveProtocolHandler, DriveRegistry};
pub use protocol::{DriveMessage, DRIVE_ALPN};
pub use replicate::Replicator;
pub use swarm::{FindingPeers, FlushOutcome, JoinOptions, PeerConnection, Swarm, SwarmOptions, TopicJoin};
pub use topic::derive_discovery_topic;

//! Module availability probe
//!
//! Peer-to-peer mode needs three things from the environment: a UDP socket
//! for the QUIC endpoint, a writable block store directory and a working
//! wire codec. Each is a [`Capability`]; [`ModuleProbe::probe`] tries all of
//! them once and memoizes the verdict.

use std::fmt;
use std::net::UdpSocket;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{DriveError, DriveResult};
use crate::sync::DriveMessage;

/// Outcome of probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    /// `probe` has not run yet
    Unattempted,
    /// Every capability was acquired
    Available,
    /// At least one capability failed
    Unavailable,
}

impl fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailabilityState::Unattempted => write!(f, "unattempted"),
            AvailabilityState::Available => write!(f, "available"),
            AvailabilityState::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// One environment primitive peer-to-peer mode depends on
pub trait Capability: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Try to acquire the primitive.
    fn acquire(&self) -> DriveResult<()>;
}

/// The drive engine: a UDP socket can be bound.
#[derive(Debug, Clone)]
pub struct DriveEngine {
    enabled: bool,
}

impl DriveEngine {
    /// Check the drive engine; `enabled = false` always fails.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Capability for DriveEngine {
    fn name(&self) -> &str {
        "drive engine"
    }

    fn acquire(&self) -> DriveResult<()> {
        if !self.enabled {
            return Err(DriveError::ModuleUnavailable(
                "peer-to-peer disabled by config".to_string(),
            ));
        }
        UdpSocket::bind(("0.0.0.0", 0))
            .map(|_| ())
            .map_err(|e| DriveError::ModuleUnavailable(format!("cannot bind UDP socket: {}", e)))
    }
}

/// The block store engine: its directory can be created and written.
#[derive(Debug, Clone)]
pub struct BlockStoreEngine {
    dir: PathBuf,
}

impl BlockStoreEngine {
    /// Check `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Capability for BlockStoreEngine {
    fn name(&self) -> &str {
        "block store engine"
    }

    fn acquire(&self) -> DriveResult<()> {
        let unavailable = |e: std::io::Error| {
            DriveError::ModuleUnavailable(format!("block store at {:?}: {}", self.dir, e))
        };
        std::fs::create_dir_all(&self.dir).map_err(unavailable)?;
        let marker = self.dir.join(".lingodrive-probe");
        std::fs::write(&marker, b"probe").map_err(unavailable)?;
        std::fs::remove_file(&marker).map_err(unavailable)?;
        Ok(())
    }
}

/// The binary codec: a drive message survives a postcard round-trip.
#[derive(Debug, Clone, Default)]
pub struct BinaryCodec;

impl Capability for BinaryCodec {
    fn name(&self) -> &str {
        "binary codec"
    }

    fn acquire(&self) -> DriveResult<()> {
        let message = DriveMessage::Subscribe {
            drive: [0u8; 32],
            known_version: Some(1),
        };
        let decoded = DriveMessage::decode(&message.encode()?)?;
        if decoded != message {
            return Err(DriveError::ModuleUnavailable(
                "codec round-trip mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ProbeState {
    availability: AvailabilityState,
    failures: Vec<String>,
}

/// Probes capabilities once and remembers the result.
pub struct ModuleProbe {
    capabilities: Vec<Box<dyn Capability>>,
    state: Mutex<ProbeState>,
}

impl fmt::Debug for ModuleProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleProbe")
            .field(
                "capabilities",
                &self.capabilities.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("state", &self.state.lock())
            .finish()
    }
}

impl ModuleProbe {
    /// Probe the given capabilities.
    pub fn new(capabilities: Vec<Box<dyn Capability>>) -> Self {
        Self {
            capabilities,
            state: Mutex::new(ProbeState {
                availability: AvailabilityState::Unattempted,
                failures: Vec::new(),
            }),
        }
    }

    /// The standard capability set for a node.
    pub fn standard(p2p_enabled: bool, blob_dir: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            Box::new(DriveEngine::new(p2p_enabled)),
            Box::new(BlockStoreEngine::new(blob_dir)),
            Box::new(BinaryCodec),
        ])
    }

    /// Try every capability on the first call; return the cached state
    /// afterwards.
    pub fn probe(&self) -> AvailabilityState {
        let mut state = self.state.lock();
        if state.availability != AvailabilityState::Unattempted {
            return state.availability;
        }

        let mut failures = Vec::new();
        for capability in &self.capabilities {
            if let Err(e) = capability.acquire() {
                warn!(capability = capability.name(), error = %e, "Capability unavailable");
                failures.push(format!("{}: {}", capability.name(), e));
            }
        }

        state.availability = if failures.is_empty() {
            AvailabilityState::Available
        } else {
            AvailabilityState::Unavailable
        };
        state.failures = failures;
        info!(availability = %state.availability, "Module probe complete");
        state.availability
    }

    /// Current state without probing
    pub fn state(&self) -> AvailabilityState {
        self.state.lock().availability
    }

    /// Reasons recorded by the probe
    pub fn failures(&self) -> Vec<String> {
        self.state.lock().failures.clone()
    }
}

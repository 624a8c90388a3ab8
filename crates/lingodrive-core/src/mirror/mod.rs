//! Mirroring a drive session into a local directory
//!
//! [`MirrorSynchronizer::sync`] performs one full-tree pass.
//! [`MirrorScheduler`] binds a session to a snapshot and runs passes through
//! a [`CoalescingRunner`], so change bursts collapse into at most one
//! follow-up pass.

mod coalesce;
mod snapshot;

pub use coalesce::CoalescingRunner;
pub use snapshot::LocalSnapshot;

pub(crate) use snapshot::read_optional;

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::drive::DriveSession;
use crate::error::{DriveError, DriveResult};
use crate::status::StatusEvent;

/// Copies a session's content tree into a [`LocalSnapshot`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MirrorSynchronizer;

impl MirrorSynchronizer {
    /// Run one pass and return the number of files written.
    ///
    /// The tree is captured once at pass start; changes accepted while the
    /// pass runs are picked up by the next pass. Paths written by the
    /// previous pass that are no longer in the tree are removed.
    pub async fn sync(session: &DriveSession, target: &mut LocalSnapshot) -> DriveResult<usize> {
        Self::pass(session, target).await.map(|(files, _)| files)
    }

    /// One pass, also returning the `seq` the pass reflects.
    async fn pass(session: &DriveSession, target: &mut LocalSnapshot) -> DriveResult<(usize, u64)> {
        let snapshot = session.snapshot().await?;
        let seq = snapshot.seq;
        debug!(drive = %session.key().short(), seq, files = snapshot.manifest.len(), "Mirror pass started");

        let mut current = BTreeSet::new();
        for (path, entry) in &snapshot.manifest.entries {
            let data = session
                .read_entry(entry)
                .await
                .map_err(|e| DriveError::SyncPass(format!("{}: {}", path, e)))?;
            target
                .write_file(path, &data)
                .await
                .map_err(|e| DriveError::SyncPass(format!("{}: {}", path, e)))?;
            current.insert(path.clone());
        }

        let stale: Vec<String> = target.written().difference(&current).cloned().collect();
        for path in &stale {
            if let Err(e) = target.remove_file(path).await {
                warn!(path = %path, error = %e, "Failed to remove stale snapshot file");
            }
        }

        let written = current.len();
        target.set_written(current);
        info!(
            drive = %session.key().short(),
            seq,
            files = written,
            removed = stale.len(),
            root = ?target.root(),
            "Mirror pass complete"
        );
        Ok((written, seq))
    }
}

struct SchedulerState {
    session: DriveSession,
    snapshot: tokio::sync::Mutex<LocalSnapshot>,
    status: Option<broadcast::Sender<StatusEvent>>,
    last: Mutex<Option<Result<usize, String>>>,
}

impl SchedulerState {
    fn emit(&self, event: StatusEvent) {
        if let Some(status) = &self.status {
            let _ = status.send(event);
        }
    }

    async fn run_pass(&self) {
        self.emit(StatusEvent::Mirroring);
        let mut snapshot = self.snapshot.lock().await;

        let result = match MirrorSynchronizer::pass(&self.session, &mut snapshot).await {
            Ok((files, seq)) => {
                self.emit(StatusEvent::Mirrored { files, seq });
                Ok(files)
            }
            Err(e) => {
                warn!(drive = %self.session.key().short(), error = %e, "SyncPassError: mirror pass failed");
                Err(e.to_string())
            }
        };
        *self.last.lock() = Some(result);
    }
}

/// Re-mirrors one session on demand, never running two passes at once.
#[derive(Clone)]
pub struct MirrorScheduler {
    state: Arc<SchedulerState>,
    runner: CoalescingRunner,
}

impl std::fmt::Debug for MirrorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorScheduler")
            .field("drive", self.state.session.key())
            .field("runner", &self.runner)
            .finish()
    }
}

impl MirrorScheduler {
    /// Bind `session` to `snapshot`. Status events go to `status` if given.
    pub fn new(
        session: DriveSession,
        snapshot: LocalSnapshot,
        status: Option<broadcast::Sender<StatusEvent>>,
    ) -> Self {
        let state = Arc::new(SchedulerState {
            session,
            snapshot: tokio::sync::Mutex::new(snapshot),
            status,
            last: Mutex::new(None),
        });

        let pass_state = state.clone();
        let runner = CoalescingRunner::new(move || {
            let state = pass_state.clone();
            async move { state.run_pass().await }
        });

        Self { state, runner }
    }

    /// Request a pass.
    pub fn trigger(&self) {
        if !self.runner.trigger() {
            debug!(drive = %self.state.session.key().short(), "Mirror pass coalesced");
        }
    }

    /// Run a pass now and wait for it (and any coalesced follow-up).
    ///
    /// Returns the outcome of the last completed pass.
    pub async fn run_now(&self) -> DriveResult<usize> {
        self.runner.trigger();
        self.runner.wait_idle().await;
        match self.last_result() {
            Some(Ok(files)) => Ok(files),
            Some(Err(reason)) => Err(DriveError::SyncPass(reason)),
            None => Err(DriveError::SyncPass("no pass completed".to_string())),
        }
    }

    /// Wait until no pass is running or pending.
    pub async fn wait_idle(&self) {
        self.runner.wait_idle().await;
    }

    /// Completed passes
    pub fn passes(&self) -> u64 {
        self.runner.passes()
    }

    /// Outcome of the last completed pass
    pub fn last_result(&self) -> Option<Result<usize, String>> {
        self.state.last.lock().clone()
    }

    /// Forward the session's change events into passes.
    pub fn follow_changes(&self) {
        let scheduler = self.clone();
        self.state.session.on_change(move |event| {
            debug!(seq = event.seq, version = event.version, "Change event, scheduling mirror");
            scheduler.trigger();
        });
    }

    /// Abort any in-flight pass.
    pub fn stop(&self) {
        self.runner.stop();
    }
}

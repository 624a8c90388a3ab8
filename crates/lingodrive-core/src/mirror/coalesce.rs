//! Coalescing of rapid triggers into sequential passes
//!
//! A two-flag latch decides what a trigger does:
//!
//! | running | pending | trigger does                    |
//! |---------|---------|---------------------------------|
//! | false   | -       | start a pass                    |
//! | true    | any     | set `pending`                   |
//!
//! When a pass ends with `pending` set, the flag is cleared and exactly one
//! more pass runs. Passes never overlap and the backlog is at most one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type PassFn = dyn Fn() -> BoxFuture<'static, ()> + Send + Sync;

#[derive(Debug, Default)]
struct Latch {
    running: bool,
    pending: bool,
}

struct RunnerInner {
    latch: Mutex<Latch>,
    pass: Box<PassFn>,
    completed: AtomicU64,
    idle: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Runs a pass on trigger, coalescing triggers that arrive mid-pass.
#[derive(Clone)]
pub struct CoalescingRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for CoalescingRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let latch = self.inner.latch.lock();
        f.debug_struct("CoalescingRunner")
            .field("running", &latch.running)
            .field("pending", &latch.pending)
            .field("passes", &self.passes())
            .finish()
    }
}

impl CoalescingRunner {
    /// Create a runner for `pass`.
    pub fn new<F, Fut>(pass: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(RunnerInner {
                latch: Mutex::new(Latch::default()),
                pass: Box::new(move || -> BoxFuture<'static, ()> { Box::pin(pass()) }),
                completed: AtomicU64::new(0),
                idle,
                task: Mutex::new(None),
            }),
        }
    }

    /// Request a pass. Returns `true` if this trigger started one.
    pub fn trigger(&self) -> bool {
        let mut latch = self.inner.latch.lock();
        if latch.running {
            latch.pending = true;
            return false;
        }
        latch.running = true;
        self.inner.idle.send_replace(false);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                (inner.pass)().await;
                inner.completed.fetch_add(1, Ordering::SeqCst);

                let again = {
                    let mut latch = inner.latch.lock();
                    if latch.pending {
                        latch.pending = false;
                        true
                    } else {
                        latch.running = false;
                        inner.idle.send_replace(true);
                        false
                    }
                };
                if !again {
                    break;
                }
            }
        });
        // Stored under the latch, before the task can clear `running`.
        *self.inner.task.lock() = Some(handle);
        true
    }

    /// Resolves when no pass is running or pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Whether a pass is in flight
    pub fn is_running(&self) -> bool {
        self.inner.latch.lock().running
    }

    /// Number of completed passes
    pub fn passes(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Abort the in-flight pass, if any, and reset the latch.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
        }
        let mut latch = self.inner.latch.lock();
        latch.running = false;
        latch.pending = false;
        self.inner.idle.send_replace(true);
    }
}

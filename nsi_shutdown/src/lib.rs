//! Drain background work before tearing down shared state
//!
//! This crate provides the types used to shut down a component that owns long-lived background
//! tasks.
//!
//! # Coordinate shutdown with the [`Drainer`] type
//!
//! A [`Drainer`] is owned by the component whose state the background tasks read. Tasks are
//! started through [`spawn_local`][Drainer::spawn_local], or hold a [`DrainLock`] obtained from
//! [`lock`][Drainer::lock], so that [`drain`][Drainer::drain] knows about them. Draining signals
//! every task through the shared [`CancellationToken`] and then waits until all of them have
//! exited, so no task outlives the state it reads.
use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::{
    sync::CancellationToken,
    task::{TaskTracker, task_tracker::TaskTrackerToken},
};
use tracing::{debug, info};

/// Tracks background tasks and drains them on shutdown
#[derive(Debug, Default)]
pub struct Drainer {
    token: CancellationToken,
    tasks: TaskTracker,
}

impl Drainer {
    /// Create a [`Drainer`] with no tracked tasks
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Take a [`DrainLock`] that keeps [`drain`][Drainer::drain] from completing until it is
    /// dropped
    pub fn lock(&self) -> DrainLock {
        DrainLock {
            token: self.token.clone(),
            _keepalive: self.tasks.token(),
        }
    }

    /// Spawn a task on the current thread's `LocalSet` and track it
    ///
    /// # Panics
    ///
    /// Panics when called outside of a `LocalSet`.
    pub fn spawn_local<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.tasks.spawn_local(task)
    }

    /// Whether draining has begun
    pub fn is_draining(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tracked tasks and outstanding locks
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Signal tracked tasks to exit without waiting for them
    pub fn begin_drain(&self) {
        if !self.token.is_cancelled() {
            debug!("begin draining background tasks");
        }
        self.token.cancel();
    }

    /// Signal tracked tasks to exit and wait until every one of them has
    ///
    /// Safe to call more than once, later calls return once the tasks are gone.
    pub async fn drain(&self) {
        self.begin_drain();
        self.tasks.close();
        self.tasks.wait().await;
        info!("background tasks drained");
    }
}

/// Keeps a [`Drainer`] from completing its [`drain`][Drainer::drain]
///
/// Holders are expected to watch [`wait_for_drain`][DrainLock::wait_for_drain] and release the
/// lock once they have stopped touching the drained state.
#[derive(Debug, Clone)]
pub struct DrainLock {
    token: CancellationToken,
    _keepalive: TaskTrackerToken,
}

impl DrainLock {
    /// Whether the issuing [`Drainer`] has begun draining
    pub fn is_draining(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Future that completes when the issuing [`Drainer`] begins draining
    pub async fn wait_for_drain(&self) {
        self.token.cancelled().await;
    }

    /// A token that is cancelled when draining begins, or earlier if cancelled directly
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

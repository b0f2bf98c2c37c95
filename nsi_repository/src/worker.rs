//! Worker threads that own the per-thread namespace caches.
//!
//! Each worker is a named OS thread driving a current-thread tokio runtime and a `LocalSet`, so
//! jobs sent to it may use `!Send` state such as [`Access`](crate::Access) handles.

use std::{future::Future, panic::AssertUnwindSafe, thread::JoinHandle};

use futures::{
    FutureExt,
    future::{LocalBoxFuture, try_join_all},
};
use nsi_clap_blocks::worker::WorkerPoolConfig;
use tokio::{
    sync::{mpsc, oneshot},
    task::LocalSet,
};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot determine the number of worker threads: {0}")]
    Parallelism(#[source] std::io::Error),

    #[error("failed to start worker thread {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("no worker thread with index {index}, the pool has {len}")]
    NoSuchWorker { index: usize, len: usize },

    #[error("worker thread {name} has exited")]
    WorkerGone { name: String },

    #[error("job on worker thread {name} was dropped before it completed")]
    JobLost { name: String },

    #[error("job on worker thread {name} panicked")]
    Panicked { name: String },
}

#[derive(Debug)]
struct Worker {
    name: String,
    jobs: mpsc::UnboundedSender<Job>,
    thread: JoinHandle<()>,
}

/// A fixed set of single-threaded workers.
///
/// Jobs are closures that produce a future on the target worker; the future runs as a local
/// task there and its output is sent back to the caller.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(config: &WorkerPoolConfig) -> Result<Self, Error> {
        let num_threads = config
            .resolved_num_threads()
            .map_err(Error::Parallelism)?
            .get();

        let workers = (0..num_threads)
            .map(|index| spawn_worker(config, config.thread_name(index)))
            .collect::<Result<Vec<_>, _>>()?;

        info!(num_threads, "started worker threads");
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Run `f` on the worker at `index` and return the output of the future it creates.
    pub async fn run_on<F, Fut>(&self, index: usize, f: F) -> Result<Fut::Output, Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        let worker = self.workers.get(index).ok_or(Error::NoSuchWorker {
            index,
            len: self.workers.len(),
        })?;

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let outcome = AssertUnwindSafe(f()).catch_unwind().await;
                // the caller may have stopped waiting
                let _ = tx.send(outcome.map_err(|_| ()));
            }
            .boxed_local()
        });

        worker.jobs.send(job).map_err(|_| Error::WorkerGone {
            name: worker.name.clone(),
        })?;

        match rx.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(())) => Err(Error::Panicked {
                name: worker.name.clone(),
            }),
            Err(_) => Err(Error::JobLost {
                name: worker.name.clone(),
            }),
        }
    }

    /// Run a copy of `f` on every worker, returning the outputs in worker order.
    pub async fn run_on_all<F, Fut>(&self, f: F) -> Result<Vec<Fut::Output>, Error>
    where
        F: FnOnce() -> Fut + Clone + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        try_join_all((0..self.workers.len()).map(|index| self.run_on(index, f.clone()))).await
    }

    /// Stop accepting jobs and wait for every worker thread to exit.
    ///
    /// A worker exits once all of its local tasks have completed. Background tasks of a
    /// repository only complete after its shutdown, so shut repositories down before joining.
    /// Blocks the calling thread, which must not be one of the workers.
    pub fn join(self) -> Result<(), Error> {
        let mut result = Ok(());
        for Worker { name, jobs, thread } in self.workers {
            drop(jobs);
            if thread.join().is_err() {
                warn!(%name, "worker thread panicked");
                result = Err(Error::Panicked { name });
            }
        }
        result
    }
}

fn spawn_worker(config: &WorkerPoolConfig, name: String) -> Result<Worker, Error> {
    let spawn_error = |source| Error::Spawn {
        name: name.clone(),
        source,
    };
    let runtime = config.runtime_builder().build().map_err(spawn_error)?;
    let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

    let thread_name = name.clone();
    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let local = LocalSet::new();
            local.spawn_local(async move {
                while let Some(job) = rx.recv().await {
                    tokio::task::spawn_local(job());
                }
            });
            // runs until the job channel is closed and every local task has completed
            runtime.block_on(local);
            debug!(name = %thread_name, "worker thread exited");
        })
        .map_err(spawn_error)?;

    Ok(Worker { name, jobs, thread })
}

//! Config for the worker threads that own the per-thread namespace caches.

use std::num::NonZeroUsize;

/// CLI config for the worker thread pool.
#[derive(Debug, Clone, clap::Parser)]
pub struct WorkerPoolConfig {
    /// Set the number of worker threads.
    ///
    /// Every worker thread builds its own interface to each namespace it serves.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-worker-threads", env = "NSI_NUM_WORKER_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,

    /// Prefix of the worker thread names.
    #[clap(
        long = "worker-thread-name",
        env = "NSI_WORKER_THREAD_NAME",
        default_value = "nsi worker",
        action
    )]
    pub thread_name: String,
}

impl WorkerPoolConfig {
    /// Config for `n` worker threads using the default thread name.
    pub fn with_threads(n: NonZeroUsize) -> Self {
        Self {
            num_threads: Some(n),
            thread_name: "nsi worker".to_owned(),
        }
    }

    /// Resolve the number of worker threads to start.
    pub fn resolved_num_threads(&self) -> Result<NonZeroUsize, std::io::Error> {
        match self.num_threads {
            None => std::thread::available_parallelism(),
            Some(n) => Ok(n),
        }
    }

    /// Name of the worker thread at `index` (zero based).
    pub fn thread_name(&self, index: usize) -> String {
        format!("{} {}", self.thread_name, index + 1)
    }

    /// Creates the builder for the runtime driving a single worker thread.
    ///
    /// Workers run cooperative tasks on a `LocalSet`, so each gets a current-thread runtime
    /// with timers and IO enabled.
    pub fn runtime_builder(&self) -> tokio::runtime::Builder {
        let mut builder = tokio::runtime::Builder::new_current_thread();
        builder.enable_time();
        builder.enable_io();
        builder
    }
}

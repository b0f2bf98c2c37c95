//! Test doubles for code built on the repository.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    thread::ThreadId,
};

use async_trait::async_trait;
use nsi_id::{NamespaceId, NodeId, ShardId};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    builder::InterfaceBuilder,
    error::DynError,
    metadata::{Directory, Snapshot},
};

/// Interface produced by [`TestBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInterface {
    pub namespace: NamespaceId,
    /// Unique per successful build, so tests can tell a reused interface from a rebuilt one.
    pub serial: u64,
    /// Shard primaries seen in the directory snapshot the handshake ran against.
    pub primaries: BTreeMap<ShardId, NodeId>,
    /// Thread the interface was built on.
    pub thread: ThreadId,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InjectedFailure(String);

#[derive(Debug, Default)]
struct State {
    next_serial: u64,
    builds: HashMap<NamespaceId, usize>,
    teardowns: HashMap<NamespaceId, usize>,
    live: usize,
    failures: HashMap<NamespaceId, VecDeque<String>>,
    in_flight: HashMap<(ThreadId, NamespaceId), usize>,
    max_concurrent: HashMap<(ThreadId, NamespaceId), usize>,
    torn_down_elsewhere: usize,
}

/// An easy-to-mock [`InterfaceBuilder`].
///
/// Records every build and teardown, can fail the next handshake of a namespace and can hold
/// all handshakes until released.
#[derive(Debug)]
pub struct TestBuilder {
    state: Mutex<State>,
    blocked: watch::Sender<bool>,
}

impl TestBuilder {
    pub fn new() -> Self {
        let (blocked, _rx) = watch::channel(false);
        Self {
            state: Mutex::default(),
            blocked,
        }
    }

    /// Fail the next handshake for `namespace` with `message`.
    pub fn fail_next(&self, namespace: NamespaceId, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .entry(namespace)
            .or_default()
            .push_back(message.into());
    }

    /// Hold all handshakes until [`unblock_global`](Self::unblock_global) is called.
    ///
    /// Injected failures are reported after the block is lifted.
    pub fn block_global(&self) {
        let was_blocked = self.blocked.send_replace(true);
        assert!(!was_blocked, "already blocked");
    }

    /// Release all held handshakes.
    pub fn unblock_global(&self) {
        self.blocked.send_replace(false);
    }

    /// Number of handshakes started for `namespace`, on all threads, including failed ones.
    pub fn build_count(&self, namespace: NamespaceId) -> usize {
        self.state
            .lock()
            .builds
            .get(&namespace)
            .copied()
            .unwrap_or_default()
    }

    pub fn teardown_count(&self, namespace: NamespaceId) -> usize {
        self.state
            .lock()
            .teardowns
            .get(&namespace)
            .copied()
            .unwrap_or_default()
    }

    /// Handshakes for `namespace` currently running, on all threads.
    pub fn in_flight(&self, namespace: NamespaceId) -> usize {
        self.state
            .lock()
            .in_flight
            .iter()
            .filter(|((_, ns), _)| *ns == namespace)
            .map(|(_, n)| n)
            .sum()
    }

    /// The largest number of handshakes for `namespace` that ever ran at the same time on a
    /// single thread.
    pub fn max_concurrent_builds(&self, namespace: NamespaceId) -> usize {
        self.state
            .lock()
            .max_concurrent
            .iter()
            .filter(|((_, ns), _)| *ns == namespace)
            .map(|(_, n)| *n)
            .max()
            .unwrap_or_default()
    }

    /// Interfaces built and not yet torn down, over all namespaces and threads.
    pub fn live_interfaces(&self) -> usize {
        self.state.lock().live
    }

    /// Interfaces torn down on a thread other than the one that built them.
    pub fn torn_down_elsewhere(&self) -> usize {
        self.state.lock().torn_down_elsewhere
    }

    fn start(&self, key: (ThreadId, NamespaceId)) {
        let mut state = self.state.lock();
        *state.builds.entry(key.1).or_default() += 1;
        let running = state.in_flight.entry(key).or_default();
        *running += 1;
        let running = *running;
        let max = state.max_concurrent.entry(key).or_default();
        *max = (*max).max(running);
    }

    fn finish(
        &self,
        key: (ThreadId, NamespaceId),
        primaries: BTreeMap<ShardId, NodeId>,
    ) -> Result<TestInterface, DynError> {
        let mut state = self.state.lock();
        if let Some(running) = state.in_flight.get_mut(&key) {
            *running -= 1;
        }

        let (thread, namespace) = key;
        if let Some(message) = state
            .failures
            .get_mut(&namespace)
            .and_then(VecDeque::pop_front)
        {
            return Err(Arc::new(InjectedFailure(message)));
        }

        state.next_serial += 1;
        state.live += 1;
        Ok(TestInterface {
            namespace,
            serial: state.next_serial,
            primaries,
            thread,
        })
    }
}

impl Default for TestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestBuilder {
    fn drop(&mut self) {
        // prevent double-panic (i.e. aborts)
        if !std::thread::panicking() {
            for failures in self.state.lock().failures.values() {
                assert!(failures.is_empty(), "injected failure left");
            }
        }
    }
}

#[async_trait]
impl InterfaceBuilder for TestBuilder {
    type Interface = TestInterface;

    async fn build(
        &self,
        namespace: NamespaceId,
        directory: Arc<Snapshot<Directory>>,
    ) -> Result<Self::Interface, DynError> {
        let key = (std::thread::current().id(), namespace);
        self.start(key);

        let mut blocked = self.blocked.subscribe();
        // the sender lives as long as `self`
        let _ = blocked.wait_for(|blocked| !blocked).await;

        self.finish(key, directory.primaries(&namespace))
    }

    fn teardown(&self, namespace: NamespaceId, interface: Self::Interface) {
        assert_eq!(interface.namespace, namespace, "torn down under the wrong namespace");
        let mut state = self.state.lock();
        *state.teardowns.entry(namespace).or_default() += 1;
        state.live = state
            .live
            .checked_sub(1)
            .expect("more teardowns than builds");
        if interface.thread != std::thread::current().id() {
            state.torn_down_elsewhere += 1;
        }
    }
}

//! Read-only views of cluster metadata consumed by the repository.
//!
//! Both the namespace configuration and the directory of shard primaries are delivered as
//! versioned [`Snapshot`]s over a [`tokio::sync::watch`] channel: a receiver can read the
//! latest snapshot at any time and wait for the next one.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Deref,
    sync::Arc,
};

use nsi_id::{NamespaceId, NodeId, ShardId};
use tokio::sync::watch;

/// Receiving side of a [`MetadataFeed`].
pub type FeedReceiver<T> = watch::Receiver<Arc<Snapshot<T>>>;

/// A point-in-time view of some metadata, tagged with a monotonically increasing version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<T> {
    version: u64,
    value: T,
}

impl<T> Snapshot<T> {
    pub fn new(version: u64, value: T) -> Self {
        Self { version, value }
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// Publishing side of a versioned metadata subscription.
///
/// The configuration layer owns one of these per kind of metadata and calls
/// [`update`](Self::update) whenever its view changes. Consumers obtain receivers through
/// [`subscribe`](Self::subscribe).
#[derive(Debug)]
pub struct MetadataFeed<T> {
    tx: watch::Sender<Arc<Snapshot<T>>>,
}

impl<T> MetadataFeed<T>
where
    T: Clone,
{
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::new(0, initial)));
        Self { tx }
    }

    pub fn subscribe(&self) -> FeedReceiver<T> {
        self.tx.subscribe()
    }

    /// The latest snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        Arc::clone(&self.tx.borrow())
    }

    /// Apply `f` to a copy of the current value and publish the result as the next version.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(|current| {
            let mut value = current.value.clone();
            f(&mut value);
            *current = Arc::new(Snapshot::new(current.version + 1, value));
        });
    }
}

impl<T> Default for MetadataFeed<T>
where
    T: Clone + Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// What the configuration currently says about a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceStatus {
    /// The namespace has not been created (yet).
    Unknown,
    /// The namespace exists.
    Live,
    /// The namespace was deleted. Deletion is permanent.
    Deleted,
}

/// The set of namespaces defined in the cluster configuration.
///
/// Deleted namespaces leave a tombstone behind so that a namespace that was removed can be told
/// apart from one that has not been created yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    live: BTreeSet<NamespaceId>,
    deleted: BTreeSet<NamespaceId>,
}

impl NamespaceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define `namespace`. Has no effect on a deleted namespace.
    ///
    /// Returns `true` if the namespace was newly added.
    pub fn insert(&mut self, namespace: NamespaceId) -> bool {
        if self.deleted.contains(&namespace) {
            return false;
        }
        self.live.insert(namespace)
    }

    /// Delete `namespace`, leaving a tombstone.
    ///
    /// Returns `true` if the namespace was live.
    pub fn delete(&mut self, namespace: NamespaceId) -> bool {
        self.deleted.insert(namespace);
        self.live.remove(&namespace)
    }

    pub fn status(&self, namespace: &NamespaceId) -> NamespaceStatus {
        if self.live.contains(namespace) {
            NamespaceStatus::Live
        } else if self.deleted.contains(namespace) {
            NamespaceStatus::Deleted
        } else {
            NamespaceStatus::Unknown
        }
    }
}

impl FromIterator<NamespaceId> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = NamespaceId>>(iter: I) -> Self {
        Self {
            live: iter.into_iter().collect(),
            deleted: BTreeSet::new(),
        }
    }
}

/// What a single node advertises in the directory: the shards it is primary for, per namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDirectory {
    primaries: BTreeMap<NamespaceId, BTreeSet<ShardId>>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_primary(mut self, namespace: NamespaceId, shard: ShardId) -> Self {
        self.primaries.entry(namespace).or_default().insert(shard);
        self
    }

    pub fn shards(&self, namespace: &NamespaceId) -> impl Iterator<Item = &ShardId> {
        self.primaries.get(namespace).into_iter().flatten()
    }
}

/// Directory of live nodes and the shards they are primary for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    nodes: BTreeMap<NodeId, NodeDirectory>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace what `node` advertises.
    pub fn set_node(&mut self, node: NodeId, directory: NodeDirectory) {
        self.nodes.insert(node, directory);
    }

    /// Drop `node` from the directory, e.g. because it left the cluster.
    pub fn remove_node(&mut self, node: &NodeId) -> Option<NodeDirectory> {
        self.nodes.remove(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Map from shard to the node that is currently primary for it, for one namespace.
    ///
    /// If more than one node claims a shard (e.g. during a hand-over) the node with the
    /// greatest id wins, so every thread derives the same map from the same snapshot.
    pub fn primaries(&self, namespace: &NamespaceId) -> BTreeMap<ShardId, NodeId> {
        let mut out = BTreeMap::new();
        for (node, directory) in &self.nodes {
            for shard in directory.shards(namespace) {
                out.insert(*shard, *node);
            }
        }
        out
    }
}

//! Per-thread namespace caches.
//!
//! Every worker thread owns one [`NamespaceCache`] per repository. Entries and the interfaces
//! they hold never leave that thread, so nothing in here is locked.

use std::{any::Any, cell::RefCell, collections::HashMap, rc::Rc, sync::Arc};

use nsi_id::{NamespaceId, RepositoryId};
use nsi_shutdown::DrainLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    builder::InterfaceBuilder,
    entry::CacheEntry,
    metadata::{NamespaceSet, NamespaceStatus},
    repository::Shared,
    task::BuilderTask,
};

thread_local! {
    /// The caches of every repository that has been used on this thread.
    static CACHES: RefCell<HashMap<RepositoryId, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

struct CachedNamespace<I> {
    entry: Rc<CacheEntry<I>>,
    retire: CancellationToken,
}

/// The namespace cache of one repository on one worker thread.
///
/// Holds a [`DrainLock`], so the repository's drain completes only once the cache is gone.
pub(crate) struct NamespaceCache<B: InterfaceBuilder> {
    shared: Arc<Shared<B>>,
    lock: DrainLock,
    entries: RefCell<HashMap<NamespaceId, CachedNamespace<B::Interface>>>,
}

impl<B: InterfaceBuilder> NamespaceCache<B> {
    /// Get the calling thread's cache for the repository owning `shared`, starting it if needed.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a `LocalSet`.
    pub(crate) fn local(shared: &Arc<Shared<B>>) -> Rc<Self> {
        CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            if let Some(cache) = caches.get(&shared.id) {
                return Rc::clone(cache)
                    .downcast::<Self>()
                    .expect("repository ids are unique");
            }

            let cache = Rc::new(Self {
                shared: Arc::clone(shared),
                lock: shared.drainer.lock(),
                entries: RefCell::new(HashMap::new()),
            });
            shared
                .drainer
                .spawn_local(Rc::clone(&cache).watch_namespaces());
            caches.insert(shared.id, Rc::clone(&cache) as Rc<dyn Any>);
            debug!(repository = %shared.id, "started per-thread namespace cache");
            cache
        })
    }

    /// Number of entries cached on the calling thread for the repository owning `shared`.
    pub(crate) fn local_len(shared: &Shared<B>) -> usize {
        CACHES
            .try_with(|caches| {
                caches
                    .borrow()
                    .get(&shared.id)
                    .and_then(|cache| Rc::clone(cache).downcast::<Self>().ok())
                    .map(|cache| cache.entries.borrow().len())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Get the entry for `namespace`, creating it and its builder task on first use.
    pub(crate) fn get_or_create(self: &Rc<Self>, namespace: NamespaceId) -> Rc<CacheEntry<B::Interface>> {
        if let Some(cached) = self.entries.borrow().get(&namespace) {
            return Rc::clone(&cached.entry);
        }

        let entry = Rc::new(CacheEntry::new(namespace));
        let retire = self.lock.child_token();
        let task = BuilderTask::new(Rc::clone(&entry), Arc::clone(&self.shared), retire.clone());

        let cache = Rc::clone(self);
        let task_entry = Rc::clone(&entry);
        self.shared.drainer.spawn_local(async move {
            task.run().await;
            cache.remove(namespace, &task_entry);
        });

        self.entries.borrow_mut().insert(
            namespace,
            CachedNamespace {
                entry: Rc::clone(&entry),
                retire,
            },
        );
        debug!(%namespace, "created namespace cache entry");
        entry
    }

    /// Retire `namespace`: no new handles, and its task exits once the interface is unreferenced.
    fn retire(&self, namespace: &NamespaceId) {
        if let Some(cached) = self.entries.borrow().get(namespace) {
            cached.entry.mark_retired();
            cached.retire.cancel();
        }
    }

    fn remove(&self, namespace: NamespaceId, entry: &Rc<CacheEntry<B::Interface>>) {
        let mut entries = self.entries.borrow_mut();
        if entries
            .get(&namespace)
            .is_some_and(|cached| Rc::ptr_eq(&cached.entry, entry))
        {
            entries.remove(&namespace);
        }
    }

    /// Retire every cached namespace that `namespaces` marks as deleted and return how many.
    fn retire_deleted(&self, namespaces: &NamespaceSet) -> usize {
        let deleted: Vec<_> = self
            .entries
            .borrow()
            .keys()
            .filter(|namespace| namespaces.status(namespace) == NamespaceStatus::Deleted)
            .copied()
            .collect();
        for namespace in &deleted {
            info!(%namespace, "namespace deleted, retiring its interface");
            self.retire(namespace);
        }
        deleted.len()
    }

    /// Follow the configuration feed until the repository drains.
    async fn watch_namespaces(self: Rc<Self>) {
        let mut namespaces = self.shared.namespaces.clone();
        let initial = Arc::clone(&namespaces.borrow_and_update());
        self.retire_deleted(&initial);

        loop {
            let changed = tokio::select! {
                biased;
                _ = self.lock.wait_for_drain() => false,
                res = namespaces.changed() => res.is_ok(),
            };
            if !changed {
                break;
            }

            // intermediate versions may be skipped, so compare the cached namespaces against the
            // latest set rather than against the previous one
            let current = Arc::clone(&namespaces.borrow_and_update());
            let retired = self.retire_deleted(&current);
            debug!(
                version = current.version(),
                retired,
                "namespace configuration changed"
            );
        }

        // the configuration feed closing leaves nothing to follow, but the cache stays usable
        // until the repository drains
        self.lock.wait_for_drain().await;

        let _ = CACHES.try_with(|caches| caches.borrow_mut().remove(&self.shared.id));
        debug!(repository = %self.shared.id, "stopped per-thread namespace cache");
    }
}

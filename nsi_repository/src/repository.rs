//! The concrete namespace interface repository.

use std::{fmt::Debug, rc::Rc, sync::Arc};

use nsi_clap_blocks::repository::RepositoryConfig;
use nsi_id::{NamespaceId, RepositoryId};
use nsi_shutdown::Drainer;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    access::{Access, NamespaceRepo},
    builder::InterfaceBuilder,
    cache::NamespaceCache,
    entry::CacheEntry,
    error::{Error, Result, Unavailable},
    metadata::{Directory, FeedReceiver, NamespaceSet, NamespaceStatus},
};

/// State shared by the repository handle and every per-thread cache and builder task.
#[derive(Debug)]
pub(crate) struct Shared<B> {
    pub(crate) id: RepositoryId,
    pub(crate) builder: B,
    pub(crate) namespaces: FeedReceiver<NamespaceSet>,
    pub(crate) directory: FeedReceiver<Directory>,
    pub(crate) config: RepositoryConfig,
    pub(crate) drainer: Drainer,
}

/// Caches namespace interfaces per worker thread and manages their lifecycle.
///
/// The repository itself is `Send + Sync` and is shared by all worker threads. Every thread that
/// calls [`acquire`](Self::acquire) gets its own cache: interfaces built on one thread are never
/// used on another. Calls must happen inside a tokio `LocalSet`.
///
/// [`shutdown`](Self::shutdown) retires every interface on every thread and waits until all
/// background work has exited. Dropping the repository only signals the shutdown.
pub struct Repository<B: InterfaceBuilder> {
    shared: Arc<Shared<B>>,
}

impl<B: InterfaceBuilder> Repository<B> {
    pub fn new(
        builder: B,
        namespaces: FeedReceiver<NamespaceSet>,
        directory: FeedReceiver<Directory>,
        config: RepositoryConfig,
    ) -> Self {
        let id = RepositoryId::new();
        info!(
            repository = %id,
            interface_expiration = ?config.interface_expiration,
            "namespace interface repository started"
        );
        Self {
            shared: Arc::new(Shared {
                id,
                builder,
                namespaces,
                directory,
                config,
                drainer: Drainer::new(),
            }),
        }
    }

    pub fn id(&self) -> RepositoryId {
        self.shared.id
    }

    /// Acquire access to the interface of `namespace` on the calling worker thread.
    ///
    /// Waits for the interface to be built if necessary. An unknown namespace is waited for until
    /// the configuration defines it.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a `LocalSet`.
    pub async fn acquire(
        &self,
        namespace: NamespaceId,
        cancel: &CancellationToken,
    ) -> Result<Access<B::Interface>> {
        Access::new(self, namespace, cancel).await
    }

    /// Number of namespaces cached on the calling thread.
    pub fn local_entry_count(&self) -> usize {
        NamespaceCache::local_len(&self.shared)
    }

    /// Number of background tasks and per-thread caches, across all threads, that shutdown waits
    /// for.
    pub fn running_tasks(&self) -> usize {
        self.shared.drainer.running()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.drainer.is_draining()
    }

    /// Retire every namespace interface and wait for all background work to exit.
    ///
    /// Interfaces that are still referenced are torn down once their last handle is released,
    /// and handshakes in flight run to completion first, so this only returns after every
    /// [`Access`] has been dropped.
    pub async fn shutdown(&self) {
        info!(repository = %self.shared.id, "shutting down namespace interface repository");
        self.shared.drainer.drain().await;
        info!(repository = %self.shared.id, "namespace interface repository shut down");
    }
}

impl<B: InterfaceBuilder> NamespaceRepo for Repository<B> {
    type Interface = B::Interface;

    fn get_cache_entry(
        &self,
        namespace: NamespaceId,
    ) -> Result<Rc<CacheEntry<Self::Interface>>> {
        if self.shared.drainer.is_draining() {
            return Err(Error::ShutDown);
        }
        if self.shared.namespaces.borrow().status(&namespace) == NamespaceStatus::Deleted {
            return Err(Error::Unavailable {
                namespace,
                reason: Unavailable::Deleted,
            });
        }

        Ok(NamespaceCache::local(&self.shared).get_or_create(namespace))
    }
}

impl<B: InterfaceBuilder> Drop for Repository<B> {
    fn drop(&mut self) {
        self.shared.drainer.begin_drain();
    }
}

impl<B: InterfaceBuilder> Debug for Repository<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("id", &self.shared.id)
            .field("builder", &self.shared.builder)
            .field("config", &self.shared.config)
            .field("running_tasks", &self.shared.drainer.running())
            .field("shut_down", &self.shared.drainer.is_draining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{future::Future, time::Duration};

    use assert_matches::assert_matches;
    use nsi_id::{NodeId, ShardId};
    use tokio::task::LocalSet;

    use super::*;
    use crate::{
        metadata::{MetadataFeed, NodeDirectory},
        test_util::TestBuilder,
    };

    const EXPIRATION: Duration = Duration::from_secs(60);

    struct Fixture {
        namespaces: MetadataFeed<NamespaceSet>,
        directory: MetadataFeed<Directory>,
        builder: Arc<TestBuilder>,
        repo: Repository<Arc<TestBuilder>>,
    }

    impl Fixture {
        fn new(live: &[NamespaceId]) -> Self {
            let namespaces = MetadataFeed::new(live.iter().copied().collect::<NamespaceSet>());
            let directory = MetadataFeed::new(Directory::new());
            let builder = Arc::new(TestBuilder::new());
            let repo = Repository::new(
                Arc::clone(&builder),
                namespaces.subscribe(),
                directory.subscribe(),
                RepositoryConfig::with_expiration(EXPIRATION),
            );
            Self {
                namespaces,
                directory,
                builder,
                repo,
            }
        }
    }

    async fn in_local_set<F: Future>(f: F) -> F::Output {
        LocalSet::new().run_until(f).await
    }

    /// Let spawned local tasks run until they are all parked.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn concurrent_acquires_share_one_handshake() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();

            fx.builder.block_global();
            let acquires = futures::future::join_all(
                (0..8).map(|_| fx.repo.acquire(ns, &cancel)),
            );
            let unblock = async {
                settle().await;
                assert_eq!(fx.builder.in_flight(ns), 1);
                fx.builder.unblock_global();
            };
            let (handles, ()) = tokio::join!(acquires, unblock);

            let handles: Vec<_> = handles.into_iter().map(|h| h.unwrap()).collect();
            assert_eq!(fx.builder.build_count(ns), 1);
            assert_eq!(fx.builder.max_concurrent_builds(ns), 1);
            let serial = handles[0].get_interface().serial;
            assert!(handles.iter().all(|h| h.get_interface().serial == serial));
            assert_eq!(fx.repo.local_entry_count(), 1);

            drop(handles);
            fx.repo.shutdown().await;
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn interface_is_reused_within_grace_and_torn_down_after() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();

            let first = fx.repo.acquire(ns, &cancel).await.unwrap();
            let serial = first.get_interface().serial;
            drop(first);

            tokio::time::sleep(EXPIRATION / 2).await;
            let again = fx.repo.acquire(ns, &cancel).await.unwrap();
            assert_eq!(again.get_interface().serial, serial);
            assert_eq!(fx.builder.build_count(ns), 1);
            drop(again);

            // the grace period restarts with every release
            tokio::time::sleep(EXPIRATION / 2).await;
            settle().await;
            assert_eq!(fx.builder.teardown_count(ns), 0);

            tokio::time::sleep(EXPIRATION).await;
            settle().await;
            assert_eq!(fx.builder.teardown_count(ns), 1);

            let rebuilt = fx.repo.acquire(ns, &cancel).await.unwrap();
            assert_ne!(rebuilt.get_interface().serial, serial);
            assert_eq!(fx.builder.build_count(ns), 2);
            drop(rebuilt);

            fx.repo.shutdown().await;
            assert_eq!(fx.builder.teardown_count(ns), 2);
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn live_handles_are_never_torn_down() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();

            let handle = fx.repo.acquire(ns, &cancel).await.unwrap();
            tokio::time::sleep(EXPIRATION * 10).await;
            settle().await;
            assert_eq!(fx.builder.teardown_count(ns), 0);
            assert_eq!(handle.get_interface().namespace, ns);
            drop(handle);

            fx.repo.shutdown().await;
            assert_eq!(fx.builder.teardown_count(ns), 1);
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cancelled_acquire_leaves_the_handshake_alone() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();
            let impatient = CancellationToken::new();

            fx.builder.block_global();
            let patient = fx.repo.acquire(ns, &cancel);
            let interrupted = async {
                let acquire = fx.repo.acquire(ns, &impatient);
                let cancel_soon = async {
                    settle().await;
                    impatient.cancel();
                };
                let (res, ()) = tokio::join!(acquire, cancel_soon);
                assert_matches!(res, Err(Error::Interrupted { namespace }) if namespace == ns);
                fx.builder.unblock_global();
            };
            let (handle, ()) = tokio::join!(patient, interrupted);

            let handle = handle.unwrap();
            assert_eq!(fx.builder.build_count(ns), 1);
            drop(handle);
            fx.repo.shutdown().await;
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn handshake_failure_is_reported_and_retried_on_demand() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();

            fx.builder.fail_next(ns, "shard 3 primary timed out");
            let err = fx.repo.acquire(ns, &cancel).await.unwrap_err();
            assert_matches!(
                &err,
                Error::Unavailable {
                    reason: Unavailable::Handshake(_),
                    ..
                }
            );
            assert!(err.is_retryable());

            let handle = fx.repo.acquire(ns, &cancel).await.unwrap();
            assert_eq!(fx.builder.build_count(ns), 2);
            assert_eq!(fx.builder.teardown_count(ns), 0);
            drop(handle);

            fx.repo.shutdown().await;
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn deleted_namespace_keeps_live_handles_but_rejects_new_ones() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();

            let handle = fx.repo.acquire(ns, &cancel).await.unwrap();
            fx.namespaces.update(|set| {
                set.delete(ns);
            });
            settle().await;

            assert_eq!(handle.get_interface().namespace, ns);
            assert_eq!(fx.builder.teardown_count(ns), 0);
            let copy = handle.clone();
            assert_matches!(
                fx.repo.acquire(ns, &cancel).await,
                Err(Error::Unavailable {
                    reason: Unavailable::Deleted,
                    ..
                })
            );

            drop(handle);
            drop(copy);
            settle().await;
            // retirement skips the grace period
            assert_eq!(fx.builder.teardown_count(ns), 1);
            assert_eq!(fx.repo.local_entry_count(), 0);

            fx.repo.shutdown().await;
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unknown_namespace_is_built_once_defined() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let node = NodeId::new();
            let fx = Fixture::new(&[]);
            let cancel = CancellationToken::new();

            let acquire = fx.repo.acquire(ns, &cancel);
            let define = async {
                settle().await;
                assert_eq!(fx.builder.build_count(ns), 0);
                fx.directory.update(|directory| {
                    directory.set_node(
                        node,
                        NodeDirectory::new().with_primary(ns, ShardId::from(1)),
                    );
                });
                fx.namespaces.update(|set| {
                    set.insert(ns);
                });
            };
            let (handle, ()) = tokio::join!(acquire, define);

            let handle = handle.unwrap();
            assert_eq!(handle.get_interface().primaries.len(), 1);
            assert_eq!(
                handle.get_interface().primaries.get(&ShardId::from(1)),
                Some(&node)
            );
            drop(handle);
            fx.repo.shutdown().await;
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unknown_namespace_deleted_while_waiting() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[]);
            let cancel = CancellationToken::new();

            let acquire = fx.repo.acquire(ns, &cancel);
            let delete = async {
                settle().await;
                fx.namespaces.update(|set| {
                    set.delete(ns);
                });
            };
            let (res, ()) = tokio::join!(acquire, delete);

            assert_matches!(
                res,
                Err(Error::Unavailable {
                    reason: Unavailable::Deleted,
                    ..
                })
            );
            assert_eq!(fx.builder.build_count(ns), 0);
            fx.repo.shutdown().await;
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn abandoned_unknown_namespaces_leave_nothing_behind() {
        in_local_set(async {
            let fx = Fixture::new(&[]);
            let cancel = CancellationToken::new();
            let unknown: Vec<_> = (0..100).map(|_| NamespaceId::new()).collect();

            let acquires =
                futures::future::join_all(unknown.iter().map(|ns| fx.repo.acquire(*ns, &cancel)));
            let give_up = async {
                settle().await;
                assert_eq!(fx.repo.local_entry_count(), unknown.len());
                cancel.cancel();
            };
            let (results, ()) = tokio::join!(acquires, give_up);
            for res in results {
                assert_matches!(res, Err(Error::Interrupted { .. }));
            }

            settle().await;
            assert_eq!(fx.repo.local_entry_count(), 0);
            // only the per-thread watcher and the cache's drain lock remain
            assert_eq!(fx.repo.running_tasks(), 2);

            // a namespace defined later starts over with a fresh entry
            let ns = unknown[0];
            fx.namespaces.update(|set| {
                set.insert(ns);
            });
            let handle = fx.repo.acquire(ns, &CancellationToken::new()).await.unwrap();
            assert_eq!(handle.get_interface().namespace, ns);
            assert_eq!(fx.repo.local_entry_count(), 1);
            drop(handle);

            fx.repo.shutdown().await;
            assert_eq!(fx.builder.build_count(ns), 1);
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn moved_primaries_rebuild_the_interface() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let (old, new) = (NodeId::new(), NodeId::new());
            let shard = ShardId::from(1);
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();
            fx.directory.update(|directory| {
                directory.set_node(old, NodeDirectory::new().with_primary(ns, shard));
            });

            let handle = fx.repo.acquire(ns, &cancel).await.unwrap();
            let serial = handle.get_interface().serial;
            assert_eq!(handle.get_interface().primaries.get(&shard), Some(&old));

            // changes for other namespaces keep the interface
            fx.directory.update(|directory| {
                directory.set_node(
                    new,
                    NodeDirectory::new().with_primary(NamespaceId::new(), shard),
                );
            });
            settle().await;
            drop(handle);
            settle().await;
            let reused = fx.repo.acquire(ns, &cancel).await.unwrap();
            assert_eq!(reused.get_interface().serial, serial);

            // a referenced interface survives the move and goes away on release
            fx.directory.update(|directory| {
                directory.remove_node(&old);
                directory.set_node(new, NodeDirectory::new().with_primary(ns, shard));
            });
            settle().await;
            assert_eq!(fx.builder.teardown_count(ns), 0);
            drop(reused);
            settle().await;
            assert_eq!(fx.builder.teardown_count(ns), 1);

            let rebuilt = fx.repo.acquire(ns, &cancel).await.unwrap();
            assert_ne!(rebuilt.get_interface().serial, serial);
            assert_eq!(rebuilt.get_interface().primaries.get(&shard), Some(&new));
            assert_eq!(fx.builder.build_count(ns), 2);
            drop(rebuilt);

            // an unreferenced interface does not wait for the grace period
            settle().await;
            fx.directory.update(|directory| {
                directory.set_node(old, NodeDirectory::new().with_primary(ns, ShardId::from(2)));
            });
            settle().await;
            assert_eq!(fx.builder.teardown_count(ns), 2);

            fx.repo.shutdown().await;
            assert_eq!(fx.builder.build_count(ns), 2);
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn deletion_during_a_failing_handshake_reports_deleted() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();

            fx.builder.block_global();
            fx.builder.fail_next(ns, "shard owner went away");
            let acquire = fx.repo.acquire(ns, &cancel);
            let delete = async {
                settle().await;
                assert_eq!(fx.builder.in_flight(ns), 1);
                fx.namespaces.update(|set| {
                    set.delete(ns);
                });
                settle().await;
                fx.builder.unblock_global();
            };
            let (res, ()) = tokio::join!(acquire, delete);

            let err = res.unwrap_err();
            assert_matches!(
                err,
                Error::Unavailable {
                    reason: Unavailable::Deleted,
                    ..
                }
            );
            assert!(!err.is_retryable());

            settle().await;
            assert_eq!(fx.repo.local_entry_count(), 0);
            assert_eq!(fx.builder.build_count(ns), 1);
            assert_matches!(
                fx.repo.acquire(ns, &cancel).await,
                Err(Error::Unavailable {
                    reason: Unavailable::Deleted,
                    ..
                })
            );
            fx.repo.shutdown().await;
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn shutdown_retires_requests_for_unknown_namespaces() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[]);
            let cancel = CancellationToken::new();

            let acquire = fx.repo.acquire(ns, &cancel);
            let shutdown = async {
                settle().await;
                fx.repo.shutdown().await;
            };
            let (res, ()) = tokio::join!(acquire, shutdown);

            let err = res.unwrap_err();
            assert_matches!(
                err,
                Error::Unavailable {
                    reason: Unavailable::Retired,
                    ..
                }
            );
            assert!(!err.is_retryable());
            assert_eq!(fx.builder.build_count(ns), 0);
            assert_eq!(fx.repo.running_tasks(), 0);
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn shutdown_waits_for_handles_and_handshakes() {
        in_local_set(async {
            let held = NamespaceId::new();
            let building = NamespaceId::new();
            let fx = Fixture::new(&[held, building]);
            let cancel = CancellationToken::new();

            let handle = fx.repo.acquire(held, &cancel).await.unwrap();
            fx.builder.block_global();

            let in_flight = async {
                let res = fx.repo.acquire(building, &cancel).await;
                assert!(res.is_ok(), "handshake in flight was abandoned");
            };
            let shutdown = async {
                settle().await;
                assert_eq!(fx.builder.in_flight(building), 1);

                let drain = fx.repo.shutdown();
                let release = async {
                    settle().await;
                    assert!(fx.repo.is_shut_down());
                    assert_matches!(
                        fx.repo.acquire(NamespaceId::new(), &cancel).await,
                        Err(Error::ShutDown)
                    );
                    // shutdown neither abandons the handshake nor preempts the handle
                    assert_eq!(fx.builder.teardown_count(held), 0);
                    fx.builder.unblock_global();
                    settle().await;
                    drop(handle);
                };
                tokio::join!(drain, release);
            };
            tokio::join!(in_flight, shutdown);

            assert_eq!(fx.repo.running_tasks(), 0);
            assert_eq!(fx.builder.in_flight(building), 0);
            assert_eq!(fx.builder.teardown_count(held), 1);
            assert_eq!(fx.repo.local_entry_count(), 0);
        })
        .await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn dropping_the_repository_signals_shutdown() {
        in_local_set(async {
            let ns = NamespaceId::new();
            let fx = Fixture::new(&[ns]);
            let cancel = CancellationToken::new();

            drop(fx.repo.acquire(ns, &cancel).await.unwrap());
            let Fixture { builder, repo, .. } = fx;
            drop(repo);
            settle().await;

            assert_eq!(builder.teardown_count(ns), 1);
        })
        .await;
    }
}

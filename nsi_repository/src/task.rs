//! The background task that builds and tears down one namespace interface on one thread.

use std::{collections::BTreeMap, rc::Rc, sync::Arc};

use nsi_id::{NamespaceId, NodeId, ShardId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    builder::InterfaceBuilder,
    entry::CacheEntry,
    error::Unavailable,
    metadata::{Directory, FeedReceiver, NamespaceSet, NamespaceStatus},
    repository::Shared,
};

/// Lifecycle phase of a namespace interface.
#[derive(Debug)]
enum Phase<I> {
    /// Nothing built, nobody asked.
    Idle,
    /// Waiting for a handle to ask for the interface.
    WaitingForReference,
    /// Waiting for the namespace to be defined, then running the handshake.
    Constructing,
    /// The interface is published and usable.
    Active(Rc<I>),
    /// The interface is unreferenced and about to be torn down.
    Destroying(Rc<I>),
    /// The task exits and never touches the entry again.
    Retired,
}

impl<I> Phase<I> {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WaitingForReference => "waiting_for_reference",
            Self::Constructing => "constructing",
            Self::Active(_) => "active",
            Self::Destroying(_) => "destroying",
            Self::Retired => "retired",
        }
    }
}

/// What ended the wait for the namespace to be defined.
enum Defined {
    Status(NamespaceStatus),
    Released,
    Retired,
}

/// What ended the grace period of an unreferenced interface.
enum Grace {
    Expired,
    Referenced,
    PrimariesMoved,
    Retired,
}

/// Drives the [`CacheEntry`] of one namespace on one worker thread through
/// construct → active → destroy cycles until the namespace is retired.
///
/// Retirement (namespace deletion or repository shutdown) is observed through `retire`. A
/// handshake in flight always runs to completion, and a referenced interface is only torn down
/// once its last handle is gone. An interface whose shard primaries moved in the directory is
/// torn down as soon as it is unreferenced and rebuilt on the next request.
pub(crate) struct BuilderTask<B: InterfaceBuilder> {
    namespace: NamespaceId,
    entry: Rc<CacheEntry<B::Interface>>,
    shared: Arc<Shared<B>>,
    namespaces: FeedReceiver<NamespaceSet>,
    directory: FeedReceiver<Directory>,
    /// Shard primaries the current interface was built against.
    built_against: BTreeMap<ShardId, NodeId>,
    retire: CancellationToken,
}

impl<B: InterfaceBuilder> BuilderTask<B> {
    pub(crate) fn new(
        entry: Rc<CacheEntry<B::Interface>>,
        shared: Arc<Shared<B>>,
        retire: CancellationToken,
    ) -> Self {
        Self {
            namespace: entry.namespace(),
            namespaces: shared.namespaces.clone(),
            directory: shared.directory.clone(),
            built_against: BTreeMap::new(),
            entry,
            shared,
            retire,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            debug!(namespace = %self.namespace, phase = phase.name(), "namespace interface phase");
            phase = match phase {
                Phase::Idle => Phase::WaitingForReference,
                Phase::WaitingForReference => self.wait_for_reference().await,
                Phase::Constructing => self.construct().await,
                Phase::Active(interface) => self.hold(interface).await,
                Phase::Destroying(interface) => self.destroy(interface),
                Phase::Retired => break,
            };
        }

        self.entry.mark_retired();
        self.entry.publish_failure(Unavailable::Retired);
        info!(namespace = %self.namespace, "namespace interface retired");
    }

    async fn wait_for_reference(&self) -> Phase<B::Interface> {
        tokio::select! {
            biased;
            _ = self.retire.cancelled() => Phase::Retired,
            _ = self.entry.wait_for_waiters() => Phase::Constructing,
        }
    }

    async fn construct(&mut self) -> Phase<B::Interface> {
        let namespace = self.namespace;

        // Nothing is in flight yet, so waiting for the namespace to show up in the configuration
        // can be abandoned.
        let defined = tokio::select! {
            biased;
            _ = self.retire.cancelled() => Defined::Retired,
            _ = self.entry.wait_unreferenced() => Defined::Released,
            status = wait_until_defined(&mut self.namespaces, namespace) => Defined::Status(status),
        };

        match defined {
            Defined::Retired => {
                let reason = match self.namespaces.borrow().status(&namespace) {
                    NamespaceStatus::Deleted => Unavailable::Deleted,
                    _ => Unavailable::Retired,
                };
                self.entry.publish_failure(reason);
                return Phase::Retired;
            }
            Defined::Released
                if self.namespaces.borrow().status(&namespace) == NamespaceStatus::Unknown =>
            {
                // the entry is dropped, a later request for this namespace starts over
                debug!(%namespace, "every waiter left before the namespace was defined");
                return Phase::Retired;
            }
            Defined::Released => return Phase::WaitingForReference,
            Defined::Status(NamespaceStatus::Deleted) => {
                self.entry.publish_failure(Unavailable::Deleted);
                return Phase::Retired;
            }
            Defined::Status(_) => {}
        }

        let directory = Arc::clone(&self.directory.borrow_and_update());
        self.built_against = directory.primaries(&namespace);
        debug!(
            %namespace,
            directory_version = directory.version(),
            shards = self.built_against.len(),
            "starting namespace interface handshake"
        );

        match self.shared.builder.build(namespace, directory).await {
            Ok(interface) => {
                let interface = Rc::new(interface);
                self.entry.publish(Rc::clone(&interface));
                Phase::Active(interface)
            }
            Err(error) => {
                let deleted =
                    self.namespaces.borrow().status(&namespace) == NamespaceStatus::Deleted;
                if deleted {
                    debug!(%namespace, ?error, "namespace deleted during handshake");
                    self.entry.publish_failure(Unavailable::Deleted);
                    return Phase::Retired;
                }

                warn!(%namespace, ?error, "namespace interface handshake failed");
                self.entry.publish_failure(Unavailable::Handshake(error));
                if self.retire.is_cancelled() {
                    Phase::Retired
                } else {
                    Phase::WaitingForReference
                }
            }
        }
    }

    async fn hold(&mut self, interface: Rc<B::Interface>) -> Phase<B::Interface> {
        let expiration = self.shared.config.interface_expiration;
        let mut stale = false;
        loop {
            // live handles are never preempted, not even by retirement or moved primaries
            while self.entry.ref_count() > 0 {
                let changed = tokio::select! {
                    biased;
                    _ = self.entry.wait_unreferenced() => false,
                    _ = directory_changed(&mut self.directory) => true,
                };
                if changed && !stale && self.primaries_moved() {
                    info!(
                        namespace = %self.namespace,
                        "shard primaries moved, rebuilding the interface once released"
                    );
                    stale = true;
                }
            }
            if stale || self.retire.is_cancelled() {
                return Phase::Destroying(interface);
            }

            let deadline = Instant::now() + expiration;
            let grace = loop {
                let grace = tokio::select! {
                    biased;
                    _ = self.retire.cancelled() => Grace::Retired,
                    _ = self.entry.referenced_again() => Grace::Referenced,
                    _ = directory_changed(&mut self.directory) => Grace::PrimariesMoved,
                    _ = tokio::time::sleep_until(deadline) => Grace::Expired,
                };
                match grace {
                    Grace::PrimariesMoved if !self.primaries_moved() => continue,
                    grace => break grace,
                }
            };

            match grace {
                Grace::Referenced => {
                    debug!(namespace = %self.namespace, "namespace interface reused");
                }
                Grace::PrimariesMoved => {
                    info!(
                        namespace = %self.namespace,
                        "shard primaries moved, dropping the interface"
                    );
                    stale = true;
                }
                Grace::Expired | Grace::Retired if self.entry.ref_count() == 0 => {
                    return Phase::Destroying(interface);
                }
                Grace::Expired | Grace::Retired => {}
            }
        }
    }

    /// Whether the directory now names other primaries than the interface was built against.
    fn primaries_moved(&mut self) -> bool {
        self.directory.borrow_and_update().primaries(&self.namespace) != self.built_against
    }

    fn destroy(&self, interface: Rc<B::Interface>) -> Phase<B::Interface> {
        let published = self.entry.reset();
        drop(published);

        match Rc::try_unwrap(interface) {
            Ok(interface) => self.shared.builder.teardown(self.namespace, interface),
            Err(interface) => error!(
                namespace = %self.namespace,
                references = Rc::strong_count(&interface),
                "namespace interface still shared at teardown"
            ),
        }

        if self.retire.is_cancelled() {
            Phase::Retired
        } else {
            Phase::Idle
        }
    }
}

/// Wait until the configuration says whether `namespace` exists.
///
/// Pends forever if the configuration feed goes away while the namespace is still unknown.
async fn wait_until_defined(
    namespaces: &mut FeedReceiver<NamespaceSet>,
    namespace: NamespaceId,
) -> NamespaceStatus {
    match namespaces
        .wait_for(|set| set.status(&namespace) != NamespaceStatus::Unknown)
        .await
    {
        Ok(set) => set.status(&namespace),
        Err(_) => std::future::pending().await,
    }
}

/// Wait for the next directory version. Pends forever once the directory feed is gone.
async fn directory_changed(directory: &mut FeedReceiver<Directory>) {
    if directory.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use nsi_id::NamespaceId;

use crate::{
    error::DynError,
    metadata::{Directory, Snapshot},
};

/// Builds and tears down routing interfaces to namespaces.
///
/// Building an interface performs the handshake with the primary of every shard of the
/// namespace, which takes several network round trips. The repository calls
/// [`build`](Self::build) at most once at a time per (worker thread, namespace) and never
/// abandons a build that is in flight.
#[async_trait]
pub trait InterfaceBuilder: Debug + Send + Sync + 'static {
    /// The routing interface produced by the handshake.
    type Interface: Debug + Send + 'static;

    /// Perform the handshake for `namespace` against the shard primaries in `directory`.
    async fn build(
        &self,
        namespace: NamespaceId,
        directory: Arc<Snapshot<Directory>>,
    ) -> Result<Self::Interface, DynError>;

    /// Tear down an interface that is no longer referenced.
    ///
    /// Called on the worker thread that built the interface, with no suspension between the
    /// decision to destroy and this call.
    fn teardown(&self, namespace: NamespaceId, interface: Self::Interface) {
        let _ = namespace;
        drop(interface);
    }
}

#[async_trait]
impl<T> InterfaceBuilder for Arc<T>
where
    T: InterfaceBuilder,
{
    type Interface = T::Interface;

    async fn build(
        &self,
        namespace: NamespaceId,
        directory: Arc<Snapshot<Directory>>,
    ) -> Result<Self::Interface, DynError> {
        T::build(self, namespace, directory).await
    }

    fn teardown(&self, namespace: NamespaceId, interface: Self::Interface) {
        T::teardown(self, namespace, interface)
    }
}

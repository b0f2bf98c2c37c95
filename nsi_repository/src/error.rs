use std::sync::Arc;

use nsi_id::NamespaceId;

/// Error produced by an [`InterfaceBuilder`](crate::InterfaceBuilder) that could not complete a
/// handshake, e.g. because a shard owner was unreachable or timed out.
pub type DynError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors returned when acquiring access to a namespace interface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The caller's cancellation signal fired before the interface was ready.
    #[error("interrupted while waiting for the interface to namespace {namespace}")]
    Interrupted { namespace: NamespaceId },

    /// No interface could be provided for the namespace.
    #[error("interface to namespace {namespace} is unavailable")]
    Unavailable {
        namespace: NamespaceId,
        #[source]
        reason: Unavailable,
    },

    /// The repository has shut down and accepts no new requests.
    #[error("namespace repository is shut down")]
    ShutDown,
}

impl Error {
    /// Whether a later `acquire` for the same namespace may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Interrupted { .. } => true,
            Self::Unavailable { reason, .. } => matches!(reason, Unavailable::Handshake(_)),
            Self::ShutDown => false,
        }
    }
}

/// Why an interface is unavailable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Unavailable {
    /// The namespace was deleted from the cluster configuration.
    #[error("namespace was deleted")]
    Deleted,

    /// The interface was retired, either because its namespace disappeared or because the
    /// repository is shutting down.
    #[error("namespace interface was retired")]
    Retired,

    /// The handshake with the shard owners failed.
    #[error("handshake with shard owners failed")]
    Handshake(#[source] DynError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

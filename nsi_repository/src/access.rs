//! Reference-counted access to namespace interfaces.

use std::{fmt::Debug, rc::Rc};

use nsi_id::NamespaceId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    entry::CacheEntry,
    error::{Error, Result, Unavailable},
};

/// Source of [`CacheEntry`]s for the calling worker thread.
///
/// Implementations must hand out the same entry for the same namespace on the same thread for
/// as long as any [`Access`] referencing it is alive.
pub trait NamespaceRepo {
    /// The routing interface stored in the entries.
    type Interface: 'static;

    /// Get the entry for `namespace` on the calling thread, creating it if needed.
    fn get_cache_entry(&self, namespace: NamespaceId)
    -> Result<Rc<CacheEntry<Self::Interface>>>;
}

/// Counts as one reference on its entry for as long as it lives.
struct Reference<I> {
    entry: Rc<CacheEntry<I>>,
}

impl<I> Reference<I> {
    fn new(entry: Rc<CacheEntry<I>>) -> Self {
        entry.incref();
        Self { entry }
    }
}

impl<I> Clone for Reference<I> {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.entry))
    }
}

impl<I> Drop for Reference<I> {
    fn drop(&mut self) {
        self.entry.decref();
    }
}

struct Held<I> {
    reference: Reference<I>,
    interface: Rc<I>,
}

/// Access to the interface of one namespace on the current worker thread.
///
/// While an `Access` (or any clone of it) is alive, the interface it exposes is not torn down.
/// Cloning is cheap and never waits. A default `Access` refers to nothing.
///
/// `Access` is neither `Send` nor `Sync`: a task on another thread must acquire its own.
pub struct Access<I> {
    held: Option<Held<I>>,
}

impl<I: 'static> Access<I> {
    /// Acquire access to the interface for `namespace`.
    ///
    /// Waits until the interface has been constructed. Fails with [`Error::Interrupted`] if
    /// `cancel` fires first, in which case the reference taken on the entry is released without
    /// affecting the construction or other waiters.
    pub async fn new<R>(repo: &R, namespace: NamespaceId, cancel: &CancellationToken) -> Result<Self>
    where
        R: NamespaceRepo<Interface = I> + ?Sized,
    {
        let entry = repo.get_cache_entry(namespace)?;
        if entry.is_retired() {
            return Err(Error::Unavailable {
                namespace,
                reason: Unavailable::Retired,
            });
        }

        let mut slot = entry.subscribe();
        let reference = Reference::new(entry);

        let published = async {
            match slot.wait_for(Option::is_some).await {
                Ok(published) => published.clone().unwrap_or(Err(Unavailable::Retired)),
                Err(_) => Err(Unavailable::Retired),
            }
        };

        let outcome = tokio::select! {
            biased;
            outcome = published => Some(outcome),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(Ok(interface)) => Ok(Self {
                held: Some(Held {
                    reference,
                    interface,
                }),
            }),
            Some(Err(reason)) => Err(Error::Unavailable { namespace, reason }),
            None => {
                debug!(%namespace, "interrupted while waiting for namespace interface");
                Err(Error::Interrupted { namespace })
            }
        }
    }
}

impl<I> Access<I> {
    /// The interface this handle keeps alive.
    ///
    /// # Panics
    ///
    /// Panics on a default (empty) handle.
    pub fn get_interface(&self) -> &I {
        &self
            .held
            .as_ref()
            .expect("get_interface called on an empty namespace access")
            .interface
    }

    /// The namespace this handle refers to, `None` for an empty handle.
    pub fn namespace(&self) -> Option<NamespaceId> {
        self.held
            .as_ref()
            .map(|held| held.reference.entry.namespace())
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_none()
    }
}

impl<I> Default for Access<I> {
    fn default() -> Self {
        Self { held: None }
    }
}

impl<I> Clone for Access<I> {
    fn clone(&self) -> Self {
        Self {
            held: self.held.as_ref().map(|held| Held {
                reference: held.reference.clone(),
                interface: Rc::clone(&held.interface),
            }),
        }
    }
}

impl<I> Debug for Access<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Access")
            .field("entry", &self.held.as_ref().map(|held| &held.reference.entry))
            .finish()
    }
}

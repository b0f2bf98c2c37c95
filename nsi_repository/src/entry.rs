//! Per-thread record of one namespace's interface.

use std::{
    cell::{Cell, RefCell},
    fmt::Debug,
    rc::Rc,
};

use nsi_id::NamespaceId;
use tokio::sync::{Notify, watch};

use crate::error::Unavailable;

/// Value of the single-assignment slot: unset, or the outcome of one construction attempt.
pub(crate) type Published<I> = Option<Result<Rc<I>, Unavailable>>;

/// Cache entry for one namespace on one worker thread.
///
/// The entry outlives many build/teardown cycles of the interface it tracks. It holds:
///
/// * a single-assignment slot for the interface. Handles waiting for construction subscribe to
///   it; the builder task fills it once per attempt and swaps in a fresh, unset slot after a
///   failure or a teardown.
/// * the number of live [`Access`](crate::Access) handles on this thread.
/// * wake signals fired when that count becomes zero and when it becomes nonzero.
///
/// Entries use `Rc`/`Cell` and are therefore confined to the thread that created them.
pub struct CacheEntry<I> {
    namespace: NamespaceId,
    slot: RefCell<watch::Sender<Published<I>>>,
    ref_count: Cell<usize>,
    became_zero: Notify,
    became_nonzero: Notify,
    demand: Notify,
    retired: Cell<bool>,
}

impl<I> CacheEntry<I> {
    pub fn new(namespace: NamespaceId) -> Self {
        Self {
            namespace,
            slot: RefCell::new(unset_slot()),
            ref_count: Cell::new(0),
            became_zero: Notify::new(),
            became_nonzero: Notify::new(),
            demand: Notify::new(),
            retired: Cell::new(false),
        }
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    /// Number of live handles referencing this entry.
    pub fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    /// Whether the namespace was retired. Retired entries accept no new handles.
    pub fn is_retired(&self) -> bool {
        self.retired.get()
    }

    /// The currently published interface, if construction completed.
    pub fn interface(&self) -> Option<Rc<I>> {
        match &*self.slot.borrow().borrow() {
            Some(Ok(interface)) => Some(Rc::clone(interface)),
            _ => None,
        }
    }

    /// Whether handles are waiting for the current, unset slot.
    pub fn has_waiters(&self) -> bool {
        let slot = self.slot.borrow();
        slot.receiver_count() > 0 && slot.borrow().is_none()
    }

    /// Publish a constructed interface, waking every handle waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already filled.
    pub fn publish(&self, interface: Rc<I>) {
        let previous = self.slot.borrow().send_replace(Some(Ok(interface)));
        assert!(
            previous.is_none(),
            "namespace interface for {} published twice",
            self.namespace
        );
    }

    /// Fail every handle waiting for the current slot and install a fresh, unset one so that a
    /// later request starts a new attempt.
    pub fn publish_failure(&self, reason: Unavailable) {
        let failed = self.slot.replace(unset_slot());
        failed.send_if_modified(|published| {
            if published.is_none() {
                *published = Some(Err(reason));
                true
            } else {
                false
            }
        });
    }

    /// Clear the slot, returning the interface that was published in it.
    ///
    /// Synchronous, so nothing can observe the interface between the decision to destroy it and
    /// this call.
    pub fn reset(&self) -> Option<Rc<I>> {
        let previous = self.slot.replace(unset_slot());
        match previous.send_replace(None) {
            Some(Ok(interface)) => Some(interface),
            _ => None,
        }
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.set(true);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Published<I>> {
        let rx = self.slot.borrow().subscribe();
        if rx.borrow().is_none() {
            self.demand.notify_one();
        }
        rx
    }

    pub(crate) fn incref(&self) {
        let n = self.ref_count.get() + 1;
        self.ref_count.set(n);
        if n == 1 {
            self.became_nonzero.notify_one();
        }
    }

    pub(crate) fn decref(&self) {
        let n = self
            .ref_count
            .get()
            .checked_sub(1)
            .expect("namespace entry reference count underflow");
        self.ref_count.set(n);
        if n == 0 {
            self.became_zero.notify_one();
        }
    }

    /// Wait until some handle waits for construction.
    pub(crate) async fn wait_for_waiters(&self) {
        while !self.has_waiters() {
            tokio::select! {
                _ = self.demand.notified() => {}
                _ = self.became_nonzero.notified() => {}
            }
        }
    }

    /// Wait until no handle references the entry.
    pub(crate) async fn wait_unreferenced(&self) {
        while self.ref_count.get() > 0 {
            self.became_zero.notified().await;
        }
    }

    /// Wait for the next zero to nonzero transition of the reference count.
    pub(crate) async fn referenced_again(&self) {
        self.became_nonzero.notified().await;
    }
}

fn unset_slot<I>() -> watch::Sender<Published<I>> {
    let (tx, _rx) = watch::channel(None);
    tx
}

impl<I> Debug for CacheEntry<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("namespace", &self.namespace)
            .field("ref_count", &self.ref_count.get())
            .field("published", &self.slot.borrow().borrow().is_some())
            .field("retired", &self.retired.get())
            .finish()
    }
}

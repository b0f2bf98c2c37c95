//! Per-thread caching and lifecycle management of namespace interfaces.
//!
//! Building the routing interface to a namespace takes a handshake with the primary of every
//! shard of that namespace. A [`Repository`] builds each interface once per worker thread,
//! hands out reference-counted [`Access`] handles to it and tears it down again once it has
//! been unreferenced for a while, the namespace is deleted or the repository shuts down.
//!
//! ```text
//!  configuration feed ──► per-thread cache ──► cache entry ◄── Access handles
//!                                 │                 ▲
//!                                 └─► builder task ─┘ (handshake, publish, teardown)
//! ```
//!
//! Everything per thread is built on `Rc` and `Cell`: caches, entries and handles never cross
//! threads, and the compiler enforces it. Worker threads are expected to run a tokio
//! current-thread runtime with a `LocalSet`, such as the ones provided by
//! [`worker::WorkerPool`].

mod access;
mod builder;
mod cache;
mod entry;
pub mod error;
pub mod metadata;
mod repository;
mod task;
pub mod test_util;
pub mod worker;

pub use access::{Access, NamespaceRepo};
pub use builder::InterfaceBuilder;
pub use entry::CacheEntry;
pub use error::{DynError, Error, Result, Unavailable};
pub use repository::Repository;

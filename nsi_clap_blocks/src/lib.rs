//! Configuration blocks for the namespace interface repository.
//!
//! Each block is a `clap::Parser` so it can be flattened into the command line of whichever
//! process embeds the repository.

pub mod repository;
pub mod worker;

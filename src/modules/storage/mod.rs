//! Storage module for chunk staging and finished files
//!
//! Provides the local-disk store used for in-flight chunk directories,
//! advisory chunk locks, and merged file destinations.

mod local_store;

pub use local_store::{ChunkLock, LocalStore, ResolvedDestination};

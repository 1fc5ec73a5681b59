//! Durable key/value storage for RepSync.
//!
//! The sync layer persists its pending-mutation queue through the
//! [`KeyValueStore`] trait: a flat string-to-string map where a successful
//! `set` is durable once it returns.
//!
//! # Backends
//! - [`MemoryStore`]: process-local, for tests and development
//! - [`FileStore`]: one file per key under a root directory

pub mod local;
pub mod memory;
pub mod provider;

pub use local::FileStore;
pub use memory::MemoryStore;
pub use provider::KeyValueStore;

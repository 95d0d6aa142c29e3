//! Persisted stream registry
//!
//! Durable id -> source URL mapping, loaded at startup and rewritten after
//! every add or remove.

pub mod store;

pub use store::{Registry, RegistryError, RegistryStore, StreamConfig};

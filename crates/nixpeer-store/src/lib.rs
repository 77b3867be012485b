//! nixpeer-store: the `Store` capability and its backends.
//!
//! `LocalStore` serves this machine's Nix store, `DiscoveryStore` finds
//! content on other instances, and `PrefixStore` namespaces either one
//! under an HTTP path prefix.

pub mod discovery;
pub mod local;
pub mod prefix;
pub mod store;

#[cfg(test)]
mod testing;

pub use discovery::{DiscoverySettings, DiscoveryStore, LanNeighbourhood, Neighbourhood, StaticNeighbourhood};
pub use local::{LocalServer, LocalStore};
pub use prefix::PrefixStore;
pub use store::{NarStream, Store, StoreError};

//! nixpeer-core: binary-cache records, discovery wire format, configuration.
//! All other nixpeer crates depend on this one.

pub mod config;
pub mod narinfo;
pub mod wire;

pub use narinfo::{CacheInfo, Compression, NarInfo, RecordError};
pub use wire::{Packet, WireError};

#![forbid(unsafe_code)]
//! uxfs public API facade.
//!
//! Re-exports the mount handle and namespace operations from `uxfs-core`
//! through a stable external interface. This is the crate that downstream
//! consumers (mount daemons, tooling) depend on.

pub use uxfs_core::*;

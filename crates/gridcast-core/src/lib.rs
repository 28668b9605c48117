//! gridcast-core: Shared library for the gridcast sync substrate.
//!
//! This crate provides:
//! - Control-plane frame definitions and wire format codec
//! - Content-addressed hashing and content-set diffing
//! - Debounced filesystem watcher
//! - Replicated mapping document
//! - Node identity and settings persistence
//! - Interface discovery (preferred IP + subnet broadcast)
//! - Bulk-transport wire format
//! - Logging setup

pub mod constants;
pub mod content;
pub mod error;
pub mod identity;
pub mod logging;
pub mod mapping;
pub mod netinfo;
pub mod protocol;
pub mod transfer;
pub mod watcher;

pub use error::{Error, Result};
pub use identity::NodeId;
pub use logging::{init_logging, LogFormat};

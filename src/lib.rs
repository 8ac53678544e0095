//! Formlink – a protocol engine for a remote line-of-business UI
//!
//! This crate drives a WebSocket-based form protocol on behalf of automated
//! callers and mirrors page state locally:
//! - Correlation of synchronous acknowledgements with pushed event batches
//! - Parsing of the server's control tree into typed field/repeater/action metadata
//! - Classification of change records across the legacy and modern wire dialects
//! - An incremental per-page value cache that never regresses to stale values
//! - A two-tier page context store and a filter state cache
//!
//! Transport and authentication are supplied by the embedding application
//! through the [`engine::correlator::Session`] trait.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Protocol engine modules
pub mod engine;

// Re-export key types for convenience
pub use engine::context::{PageContext, PageContextId};
pub use engine::correlator::{Session, SessionDirectory, SessionRegistry};
pub use engine::error::{EngineError, Result};
pub use engine::pages::{ActOutcome, OpenedPage, WriteFailure, WriteReceipt};
pub use engine::records::Record;
pub use engine::{Engine, EngineConfig};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

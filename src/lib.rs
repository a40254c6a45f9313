//! doccache - An embeddable, write-through key-value cache persisted as one JSON document
//!
//! doccache keeps a small amount of application state (settings, recent files,
//! window geometry) in a single human-readable JSON file and makes sure every
//! change reaches disk before the call that made it returns.
//!
//! # Key Features
//!
//! - **Write-through**: Every mutation rewrites the document atomically (temp file + rename)
//! - **Self-healing**: A corrupt document is backed up next to itself and replaced with an empty one
//! - **Nested documents**: Any node of the tree can persist the whole document it belongs to
//! - **Typed access**: Strings, numbers, booleans, string lists, raw nodes and serde types
//! - **Shutdown flushing**: Open stores are flushed on Ctrl-C and at the end of `main`
//!
//! # Quick Start
//!
//! ```rust
//! use doccache::DocumentStore;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = DocumentStore::open(dir.path().join("settings.json")).unwrap();
//!
//! store.set("theme", "dark").unwrap();
//! let width = store.get_or_insert("width", 1024_i64).unwrap();
//! assert_eq!(width, 1024);
//! assert_eq!(store.get::<String>("theme").unwrap().as_deref(), Some("dark"));
//! assert_eq!(store.keys(), ["theme", "width"]);
//! ```
//!
//! # Architecture
//!
//! The document is a tree of [`Node`]s. Each node knows its parent, and the
//! root records the file it belongs to under the reserved key
//! [`FILE_BINDING_KEY`], so writing any node resolves to writing its root.
//!
//! The core types you'll work with:
//! - [`DocumentStore`] - Thread-safe, write-through view of one document
//! - [`Node`] - Shared handle to a value in the document tree
//! - [`IntoNode`] / [`FromNode`] - Conversions between native values and nodes
//! - [`lifecycle::ShutdownGuard`] - Flushes every open store when dropped
//!
//! # Non-goals
//!
//! doccache intentionally does NOT provide:
//! - Cross-process file locking (last writer wins)
//! - Schema validation or migrations
//! - Transactions spanning several keys
//! - Datasets that do not comfortably fit in memory

pub mod convert;
pub mod error;
pub mod lifecycle;
pub mod ownership;
pub mod persistence;
pub mod store;
pub mod types;

pub use convert::{FromNode, IntoNode, Json};
pub use error::{CacheError, Result};
pub use lifecycle::{flush_all, install, install_interrupt_handler, FlushReport, ShutdownGuard};
pub use persistence::LoadOutcome;
pub use store::{DocumentStore, Entries, StoreConfig, StoreStatus};
pub use types::{is_reserved, Node, Value, ValueKind, FILE_BINDING_KEY, RESERVED_PREFIX};

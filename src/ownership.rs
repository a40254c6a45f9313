//! Tree-rooted write propagation.
//!
//! A caller holding any node of a document can persist the whole document
//! without knowing where it lives: walk the parent links to the root, read the
//! root's file binding, and write the root there.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::error::Result;
use crate::lifecycle;
use crate::persistence;
use crate::types::{Node, Value, FILE_BINDING_KEY};

/// The node with no parent above `node`.
pub fn root_of(node: &Node) -> Node {
    let mut current = node.clone();
    let mut depth = 0usize;
    while let Some(parent) = current.parent() {
        current = parent;
        depth += 1;
    }
    trace!(depth, "Resolved document root");
    current
}

/// The path recorded in `root`'s file binding, if it has one.
pub fn file_binding(root: &Node) -> Option<PathBuf> {
    let binding = root.get_raw(FILE_BINDING_KEY)?;
    let value = binding.read();
    match &*value {
        Value::String(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => None,
    }
}

/// Persist the document owning `node`.
///
/// Returns `Ok(false)` without touching disk when the root carries no file
/// binding, e.g. for free-standing trees or nodes detached from their store.
/// When the root belongs to an open, registered store the write is taken
/// under that store's lock.
pub fn write_node(node: &Node) -> Result<bool> {
    let root = root_of(node);
    let Some(path) = file_binding(&root) else {
        trace!("No file binding on root, nothing to write");
        return Ok(false);
    };

    if let Some(store) = lifecycle::store_for_root(&root) {
        store.flush()?;
    } else {
        persistence::write(&path, &root)?;
    }
    debug!("Propagated write to {:?}", path);
    Ok(true)
}

impl Node {
    /// Write the whole owning document to its bound file.
    /// See [`write_node`].
    pub fn persist(&self) -> Result<bool> {
        write_node(self)
    }
}

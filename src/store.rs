use crate::convert::{FromNode, IntoNode};
use crate::error::{CacheError, Result};
use crate::lifecycle;
use crate::persistence::{self, LoadOutcome};
use crate::types::{check_readable, check_writable, is_reserved, Node, Value, FILE_BINDING_KEY};
use anyhow::anyhow;
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on waiting for the store lock during shutdown and drop flushes
    pub lock_timeout: Duration,
    /// Add the store to the process-wide registry flushed at shutdown
    pub register_for_shutdown: bool,
    /// Flush once more when the store is dropped
    pub flush_on_drop: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            register_for_shutdown: true,
            flush_on_drop: true,
        }
    }
}

impl StoreConfig {
    /// Config for testing (short timeouts, not registered for shutdown).
    pub fn for_testing() -> Self {
        Self {
            lock_timeout: Duration::from_millis(200),
            register_for_shutdown: false,
            flush_on_drop: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub path: PathBuf,
    pub n_entries: usize,
    pub loaded: LoadOutcome,
    pub registered: bool,
}

/// State shared between a store and the shutdown registry.
pub(crate) struct StoreShared {
    path: PathBuf,
    root: Node,
    /// Held for the full duration of every mutation plus its flush
    lock: Mutex<()>,
    config: StoreConfig,
    loaded: LoadOutcome,
}

impl StoreShared {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn root(&self) -> &Node {
        &self.root
    }

    /// Blocking flush under the store lock.
    pub(crate) fn flush(&self) -> Result<()> {
        let guard = self.lock.lock();
        self.write_locked(&guard)
    }

    fn write_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<()> {
        persistence::write(&self.path, &self.root)?;
        Ok(())
    }

    /// Flush unless the lock cannot be taken within `lock_timeout`.
    /// Returns `Ok(false)` on timeout.
    pub(crate) fn flush_with_timeout(&self) -> Result<bool> {
        let Some(guard) = self.lock.try_lock_for(self.config.lock_timeout) else {
            return Ok(false);
        };
        self.write_locked(&guard)?;
        Ok(true)
    }
}

/// A key-value cache persisted as one JSON document.
///
/// Every mutation is written through to disk before it returns. Keys starting
/// with [`RESERVED_PREFIX`](crate::RESERVED_PREFIX) are internal; the root
/// always carries [`FILE_BINDING_KEY`] recording where the document lives.
pub struct DocumentStore {
    shared: Arc<StoreShared>,
}

impl DocumentStore {
    /// Open or create the document at `path` with the default config.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config<P: Into<PathBuf>>(path: P, config: StoreConfig) -> Result<Self> {
        let path = path.into();
        let path = std::path::absolute(&path).unwrap_or(path);
        // The binding must name exactly this file
        let Some(binding) = path.to_str().map(str::to_owned) else {
            return Err(anyhow!("Document path is not valid UTF-8: {:?}", path).into());
        };

        let (root, loaded) = persistence::read_with_outcome(&path)?;
        if let LoadOutcome::Recovered { backup } = &loaded {
            warn!("Opened {:?} empty after corruption, backup at {:?}", path, backup);
        }

        let binding = Node::new(Value::String(binding));
        root.insert_raw(FILE_BINDING_KEY, binding)?;

        let shared = Arc::new(StoreShared {
            path,
            root,
            lock: Mutex::new(()),
            config,
            loaded,
        });

        {
            let guard = shared.lock.lock();
            shared.write_locked(&guard)?;
        }

        if shared.config.register_for_shutdown {
            lifecycle::register(&shared);
        }

        info!(
            "Opened document store: {:?} ({} entries)",
            shared.path,
            shared.root.len()
        );
        Ok(Self { shared })
    }

    /// Open `file` inside the platform config directory under `app`.
    /// Falls back to the working directory when there is no config directory.
    pub fn open_in_config_dir(app: &str, file: &str) -> Result<Self> {
        let path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(app)
            .join(file);
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// The document root. Mutations made through it (or through any node
    /// below it) reach disk on the next flush, e.g. [`Node::persist`].
    pub fn root(&self) -> &Node {
        &self.shared.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.shared.lock.lock()
    }

    /// Typed read. `Ok(None)` when the key is absent.
    pub fn get<T: FromNode>(&self, key: &str) -> Result<Option<T>> {
        check_readable(key)?;
        let _guard = self.lock();
        match self.shared.root.get_raw(key) {
            Some(node) => T::from_node(&node).map(Some).map_err(|e| e.with_key(key)),
            None => Ok(None),
        }
    }

    /// Typed read that treats absence as [`CacheError::MissingValue`].
    pub fn require<T: FromNode>(&self, key: &str) -> Result<T> {
        self.get(key)?
            .ok_or_else(|| CacheError::MissingValue(key.to_string()))
    }

    /// Typed read that stores and flushes `default` when the key is absent.
    pub fn get_or_insert<T: IntoNode + FromNode>(&self, key: &str, default: T) -> Result<T> {
        check_writable(key)?;
        let guard = self.lock();
        if let Some(node) = self.shared.root.get_raw(key) {
            return T::from_node(&node).map_err(|e| e.with_key(key));
        }

        let node = default.into_node()?;
        self.shared.root.insert_raw(key, node.clone())?;
        self.shared.write_locked(&guard)?;
        debug!(key, "Materialized default value");
        // Read back through the attached node: it may be a copy of `node`
        let attached = self.shared.root.get_raw(key).unwrap_or(node);
        T::from_node(&attached).map_err(|e| e.with_key(key))
    }

    /// Insert or replace `key`, then flush.
    pub fn set<T: IntoNode>(&self, key: &str, value: T) -> Result<()> {
        check_writable(key)?;
        let node = value.into_node()?;
        let guard = self.lock();
        self.shared.root.insert_raw(key, node)?;
        self.shared.write_locked(&guard)
    }

    /// The live node stored under `key`.
    pub fn get_node(&self, key: &str) -> Result<Option<Node>> {
        self.get::<Node>(key)
    }

    pub fn set_node(&self, key: &str, node: Node) -> Result<()> {
        self.set(key, node)
    }

    /// Remove `key`, then flush. Returns whether an entry existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        check_writable(key)?;
        let guard = self.lock();
        let removed = self.shared.root.remove_raw(key)?;
        if removed.is_none() {
            return Ok(false);
        }
        self.shared.write_locked(&guard)?;
        Ok(true)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        check_readable(key)?;
        let _guard = self.lock();
        Ok(self.shared.root.get_raw(key).is_some())
    }

    /// Number of public entries.
    pub fn len(&self) -> usize {
        let _guard = self.lock();
        self.shared.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Public keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let _guard = self.lock();
        self.shared.root.keys()
    }

    /// Public top-level entries in insertion order.
    ///
    /// The iterator is a snapshot of the entry handles taken at call time;
    /// clone it to iterate again from the start.
    pub fn entries(&self) -> Entries {
        let _guard = self.lock();
        let items: Vec<(String, Node)> = self
            .shared
            .root
            .entries_raw()
            .into_iter()
            .filter(|(key, _)| !is_reserved(key))
            .collect();
        Entries {
            items: items.into(),
            pos: 0,
        }
    }

    /// Write the whole document to disk now.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            path: self.shared.path.clone(),
            n_entries: self.len(),
            loaded: self.shared.loaded.clone(),
            registered: lifecycle::is_registered(&self.shared),
        }
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        if self.shared.config.flush_on_drop {
            match self.shared.flush_with_timeout() {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Timed out waiting for store lock, skipping final flush of {:?}",
                    self.shared.path
                ),
                Err(e) => warn!("Final flush of {:?} failed: {e}", self.shared.path),
            }
        }
        lifecycle::deregister(&self.shared);
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("path", &self.shared.path)
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Iterator over the public entries of a [`DocumentStore`].
#[derive(Clone)]
pub struct Entries {
    items: Arc<[(String, Node)]>,
    pos: usize,
}

impl Iterator for Entries {
    type Item = (String, Node);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.get(self.pos)?.clone();
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.items.len() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Entries {}

impl<'a> IntoIterator for &'a DocumentStore {
    type Item = (String, Node);
    type IntoIter = Entries;

    fn into_iter(self) -> Entries {
        self.entries()
    }
}

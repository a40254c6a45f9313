//! Process-wide shutdown flushing.
//!
//! Open stores register a weak handle here. [`flush_all`] writes every one
//! that is still alive; it runs from the Ctrl-C handler and from
//! [`ShutdownGuard`]'s drop at the end of `main`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::store::StoreShared;
use crate::types::Node;

/// Exit status used after an interrupt, as a shell reports SIGINT.
const INTERRUPT_EXIT_CODE: i32 = 130;

const REGISTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

static REGISTRY: Mutex<Vec<Weak<StoreShared>>> = Mutex::new(Vec::new());

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn register(store: &Arc<StoreShared>) {
    let mut registry = REGISTRY.lock();
    registry.retain(|weak| weak.strong_count() > 0);
    registry.push(Arc::downgrade(store));
    debug!("Registered {:?} for shutdown flush", store.path());
}

pub(crate) fn deregister(store: &StoreShared) {
    let ptr: *const StoreShared = store;
    REGISTRY
        .lock()
        .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), ptr));
}

pub(crate) fn is_registered(store: &StoreShared) -> bool {
    let ptr: *const StoreShared = store;
    REGISTRY
        .lock()
        .iter()
        .any(|weak| std::ptr::eq(weak.as_ptr(), ptr))
}

/// The registered store whose document root is `root`, if any.
pub(crate) fn store_for_root(root: &Node) -> Option<Arc<StoreShared>> {
    REGISTRY
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .find(|store| store.root().ptr_eq(root))
}

fn snapshot() -> Option<Vec<Arc<StoreShared>>> {
    let registry = REGISTRY.try_lock_for(REGISTRY_LOCK_TIMEOUT)?;
    Some(registry.iter().filter_map(Weak::upgrade).collect())
}

/// Paths of all registered stores still open, in registration order.
pub fn live_stores() -> Vec<PathBuf> {
    snapshot()
        .unwrap_or_default()
        .iter()
        .map(|store| store.path().to_path_buf())
        .collect()
}

/// Outcome of [`flush_all`], by store path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: Vec<PathBuf>,
    /// Stores whose lock could not be taken within their `lock_timeout`
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Flush every live registered store. Never panics and never returns an
/// error; problems are logged and reported.
pub fn flush_all() -> FlushReport {
    let mut report = FlushReport::default();
    let Some(stores) = snapshot() else {
        warn!("Timed out waiting for store registry, nothing flushed");
        return report;
    };

    for store in stores {
        let path = store.path().to_path_buf();
        match store.flush_with_timeout() {
            Ok(true) => report.flushed.push(path),
            Ok(false) => {
                warn!("Timed out waiting for store lock, skipping {:?}", path);
                report.skipped.push(path);
            }
            Err(e) => {
                warn!("Failed to flush {:?}: {e}", path);
                report.failed.push(path);
            }
        }
    }

    info!(
        "Flushed {} stores ({} skipped, {} failed)",
        report.flushed.len(),
        report.skipped.len(),
        report.failed.len()
    );
    report
}

/// Install the Ctrl-C handler that flushes all stores and exits.
///
/// Only the first call installs anything; it returns `true` when this call
/// did. The handler runs on its own thread so it works whether or not the
/// host program uses an async runtime.
pub fn install_interrupt_handler() -> bool {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let spawned = std::thread::Builder::new()
        .name("doccache-interrupt".into())
        .spawn(wait_for_interrupt);
    if let Err(e) = spawned {
        warn!("Failed to spawn interrupt handler thread: {e}");
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        return false;
    }
    true
}

fn wait_for_interrupt() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Failed to start interrupt handler runtime: {e}");
            return;
        }
    };

    match runtime.block_on(tokio::signal::ctrl_c()) {
        Ok(()) => {
            info!("Interrupted, flushing open stores");
            flush_all();
            std::process::exit(INTERRUPT_EXIT_CODE);
        }
        Err(e) => warn!("Failed to listen for Ctrl-C: {e}"),
    }
}

/// Flushes all registered stores when dropped.
///
/// Hold one for the lifetime of `main`:
///
/// ```no_run
/// fn main() {
///     let _shutdown = doccache::install();
///     let store = doccache::DocumentStore::open("settings.json").unwrap();
///     store.set("launched", true).unwrap();
/// }
/// ```
#[must_use = "stores are flushed when the guard is dropped"]
#[derive(Debug)]
pub struct ShutdownGuard {
    _private: (),
}

/// Install the interrupt handler and return the normal-exit guard.
pub fn install() -> ShutdownGuard {
    install_interrupt_handler();
    ShutdownGuard { _private: () }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        flush_all();
    }
}

//! CallGuard - serialized, status-translated native calls
//!
//! Design: all native activity of a `Bridge` runs inside `guarded`:
//! 1. Same-thread re-entry is refused unless it comes from a callback of
//!    the innermost guarded call (the callback path)
//! 2. The process-wide native lock serializes outermost calls across
//!    threads; nested calls on the callback path already hold it
//! 3. Per-object locks are taken through the lock orderer and released in
//!    reverse, once, on every path including unwind
//! 4. The native status and accumulated messages are read after the call
//!    and turned into a `BridgeError`; callback failures recorded in the
//!    call's frame take precedence over the status they caused

pub(crate) mod state;
pub mod status;

#[cfg(test)]
mod tests;

pub use state::{guard_depth, in_callback};

use crate::callback::{self, CallbackSlots, Failure, FrameOutcome, TransformRegistry};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handle::{DeferredReleaseQueue, Lifecycle};
use crate::lock::{self, LockSet};
use crate::logging;
use crate::native::{LoopbackLibrary, NativeApi, NativeHandle, StatusCode};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use state::DepthGuard;
use status::ErrorStatus;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL: Lazy<RwLock<Option<Bridge>>> = Lazy::new(|| RwLock::new(None));

/// Counters kept by one bridge
#[derive(Default)]
pub(crate) struct StatCounters {
    pub(crate) native_calls: AtomicU64,
    pub(crate) native_failures: AtomicU64,
    pub(crate) callbacks_fired: AtomicU64,
    pub(crate) callback_failures: AtomicU64,
    pub(crate) releases: AtomicU64,
    pub(crate) deferred_releases: AtomicU64,
}

/// Snapshot of a bridge's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub native_calls: u64,
    pub native_failures: u64,
    pub callbacks_fired: u64,
    pub callback_failures: u64,
    pub releases: u64,
    pub deferred_releases: u64,
}

struct BridgeInner {
    id: u64,
    api: Arc<dyn NativeApi>,
    native_lock: Mutex<()>,
    config: BridgeConfig,
    transforms: TransformRegistry,
    deferred: DeferredReleaseQueue,
    stats: StatCounters,
}

/// Shared access point to one native library
///
/// Cloning is cheap; every clone refers to the same process lock.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Wrap `api`, installing the bridge's error reporter and graphics
    /// trampolines into it
    pub fn new(api: Arc<dyn NativeApi>, config: BridgeConfig) -> Self {
        api.install_error_reporter(Some(status::put_err_trampoline));
        api.install_grf(Some(callback::GRF_TRAMPOLINES));
        let id = NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "astbridge::native", bridge = id, api = api.name(), "bridge created");
        Self {
            inner: Arc::new(BridgeInner {
                id,
                api,
                native_lock: Mutex::new(()),
                config,
                transforms: TransformRegistry::new(),
                deferred: DeferredReleaseQueue::new(),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Bridge over a fresh in-process library with default configuration
    pub fn loopback() -> Self {
        Self::new(Arc::new(LoopbackLibrary::new()), BridgeConfig::default())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn api(&self) -> &dyn NativeApi {
        &*self.inner.api
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle::new(self)
    }

    pub fn stats(&self) -> BridgeStats {
        let stats = &self.inner.stats;
        BridgeStats {
            native_calls: stats.native_calls.load(Ordering::Relaxed),
            native_failures: stats.native_failures.load(Ordering::Relaxed),
            callbacks_fired: stats.callbacks_fired.load(Ordering::Relaxed),
            callback_failures: stats.callback_failures.load(Ordering::Relaxed),
            releases: stats.releases.load(Ordering::Relaxed),
            deferred_releases: stats.deferred_releases.load(Ordering::Relaxed),
        }
    }

    /// Releases queued for the next outermost guarded call
    pub fn pending_releases(&self) -> usize {
        self.inner.deferred.len()
    }

    pub fn same_bridge(&self, other: &Bridge) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn counters(&self) -> &StatCounters {
        &self.inner.stats
    }

    pub(crate) fn transforms(&self) -> &TransformRegistry {
        &self.inner.transforms
    }

    pub(crate) fn deferred(&self) -> &DeferredReleaseQueue {
        &self.inner.deferred
    }

    /// Run `body` as one guarded native call
    ///
    /// `locks` are held for the duration of `body` and `slots` are the
    /// targets its callbacks may reach. A panic raised by a callback is
    /// resumed here once every lock has been released.
    pub fn guarded<T>(
        &self,
        op: &'static str,
        locks: &LockSet,
        slots: CallbackSlots<'_>,
        body: impl FnOnce(&dyn NativeApi) -> T,
    ) -> Result<T> {
        let nested = state::check_entry(self.id(), op).map_err(|error| {
            logging::log_fatal(op, &error.to_string());
            error
        })?;
        logging::log_native_call(op, locks.len(), nested);
        let _timer = logging::perf::track(op);
        self.inner.stats.native_calls.fetch_add(1, Ordering::Relaxed);

        let api = self.api();
        let errors = &self.inner.config.errors;
        let process = if nested {
            None
        } else {
            Some(self.inner.native_lock.lock())
        };
        let reentry = if nested {
            Some(Reentry::save(api))
        } else {
            self.drain_deferred();
            None
        };
        status::reset(errors.max_message_len, &errors.separator);
        api.clear_status();

        let run = {
            let _depth = DepthGuard::enter(self.id());
            let frame = callback::arm(self, slots);
            match lock::lock_all(api, locks, self.inner.config.locking.wait) {
                Err(error) => Err(error),
                Ok(held) => {
                    let value = body(api);
                    let unlocked = held.unlock_all();
                    Ok((value, unlocked, frame.finish()))
                }
            }
        };

        let native_status = api.status();
        let message = status::take();
        api.clear_status();
        drop(reentry);
        drop(process);

        let settled = match run {
            Err(error) => Err(error),
            Ok((value, unlocked, outcome)) => unlocked
                .and_then(|()| settle(op, value, outcome, native_status, message)),
        };
        match &settled {
            Ok(_) => logging::log_native_return(op),
            Err(error) => {
                self.inner.stats.native_failures.fetch_add(1, Ordering::Relaxed);
                match error.status() {
                    Some(status) if !error.is_fatal() => {
                        logging::log_native_error(op, status, &error.to_string())
                    }
                    _ => logging::log_fatal(op, &error.to_string()),
                }
            }
        }
        settled
    }

    /// Annul releases queued while no guard could be entered
    fn drain_deferred(&self) {
        if !self.inner.deferred.has_pending() {
            return;
        }
        let api = self.api();
        let errors = &self.inner.config.errors;
        for handle in self.inner.deferred.drain() {
            status::reset(errors.max_message_len, &errors.separator);
            api.clear_status();
            api.annul(handle);
            if api.status().is_ok() {
                self.inner.stats.releases.fetch_add(1, Ordering::Relaxed);
                logging::log_dispose(handle, "deferred");
            } else {
                let loud = self.inner.config.lifecycle.warn_on_implicit_failure;
                logging::log_release_failure(handle, &status::take(), loud);
                api.clear_status();
            }
        }
    }

    /// Annul `handle` from inside a guarded call of this bridge on the
    /// current thread, leaving the outer call's status untouched
    pub(crate) fn release_in_place(&self, handle: NativeHandle) -> Result<()> {
        let api = self.api();
        let outer = Reentry::save(api);
        api.clear_status();
        api.annul(handle);
        let released = api.status();
        let message = status::take();
        drop(outer);
        if released.is_ok() {
            Ok(())
        } else {
            Err(BridgeError::NativeOperation {
                status: released,
                message,
            })
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("id", &self.inner.id)
            .field("api", &self.inner.api.name())
            .field("pending_releases", &self.inner.deferred.len())
            .finish()
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        for handle in self.deferred.drain() {
            self.api.annul(handle);
            if self.api.status().is_ok() {
                logging::log_dispose(handle, "deferred");
            } else {
                logging::log_release_failure(handle, &status::take(), false);
                self.api.clear_status();
            }
        }
    }
}

/// Outer call's status and messages, put back when a nested call ends
struct Reentry<'a> {
    api: &'a dyn NativeApi,
    status: StatusCode,
    saved: Option<ErrorStatus>,
}

impl<'a> Reentry<'a> {
    fn save(api: &'a dyn NativeApi) -> Self {
        Self {
            api,
            status: api.status(),
            saved: Some(status::save()),
        }
    }
}

impl Drop for Reentry<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            status::restore(saved);
        }
        self.api.clear_status();
        if !self.status.is_ok() {
            self.api.set_status(self.status);
        }
    }
}

/// Turn what one guarded call left behind into its result
fn settle<T>(
    op: &str,
    value: T,
    outcome: FrameOutcome,
    native_status: StatusCode,
    message: String,
) -> Result<T> {
    if let Some(fatal) = outcome.fatal {
        return Err(BridgeError::BridgeFatal(fatal));
    }
    if native_status == StatusCode::BRIDGE_FATAL {
        let message = if message.is_empty() {
            format!("{} reported a bridge invariant violation", op)
        } else {
            message
        };
        return Err(BridgeError::BridgeFatal(message));
    }
    match outcome.failure {
        Some(Failure::Panic(payload)) => panic::resume_unwind(payload),
        Some(Failure::Error(source)) => Err(BridgeError::CallbackPropagated {
            status: if native_status.is_ok() {
                StatusCode::CALLBACK_FAILED
            } else {
                native_status
            },
            message,
            source,
        }),
        None if !native_status.is_ok() => Err(BridgeError::NativeOperation {
            status: native_status,
            message: if message.is_empty() {
                format!("{} failed", op)
            } else {
                message
            },
        }),
        None => Ok(value),
    }
}

/// Install the process-wide bridge, returning the one it replaces
pub fn init(bridge: Bridge) -> Option<Bridge> {
    tracing::debug!(target: "astbridge::native", bridge = bridge.id(), "process bridge installed");
    GLOBAL.write().replace(bridge)
}

/// The process-wide bridge
pub fn global() -> Result<Bridge> {
    GLOBAL.read().clone().ok_or(BridgeError::NotInitialized)
}

/// Remove the process-wide bridge; it is dropped once its last clone is
pub fn teardown() -> Option<Bridge> {
    let bridge = GLOBAL.write().take();
    if let Some(bridge) = &bridge {
        tracing::debug!(target: "astbridge::native", bridge = bridge.id(), "process bridge removed");
    }
    bridge
}

//! Lock orderer - deadlock-free acquisition of per-object native locks
//!
//! Design: every operation names the handles it touches in a `LockSet`,
//! which keeps them in one global total order (handle address):
//! 1. Duplicates and null handles are dropped on insertion
//! 2. `lock_all` acquires in ascending order and rolls back on failure
//! 3. `HeldLocks` releases in exactly the reverse order, once, including
//!    on unwind
//!
//! Nested objects are covered by the wrapped library: locking a container
//! also locks what it holds. The library must never lock anything outside
//! the supplied set; the bridge cannot check this.

use crate::error::{BridgeError, Result};
use crate::logging;
use crate::native::{NativeApi, NativeHandle};
use smallvec::SmallVec;

#[cfg(test)]
mod tests;

type Handles = SmallVec<[NativeHandle; 4]>;

/// Ordered, deduplicated set of handles one operation needs locked
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct LockSet {
    handles: Handles,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(handles: impl IntoIterator<Item = NativeHandle>) -> Self {
        handles.into_iter().collect()
    }

    /// Insert in address order; null and already-present handles are skipped
    pub fn push(&mut self, handle: NativeHandle) {
        if handle.is_null() {
            return;
        }
        if let Err(at) = self.handles.binary_search(&handle) {
            self.handles.insert(at, handle);
        }
    }

    pub fn with(mut self, handle: NativeHandle) -> Self {
        self.push(handle);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.handles.binary_search(&handle).is_ok()
    }

    /// Handles in acquisition order
    pub fn as_slice(&self) -> &[NativeHandle] {
        &self.handles
    }

    pub fn iter(&self) -> impl Iterator<Item = NativeHandle> + '_ {
        self.handles.iter().copied()
    }
}

impl FromIterator<NativeHandle> for LockSet {
    fn from_iter<I: IntoIterator<Item = NativeHandle>>(iter: I) -> Self {
        let mut set = LockSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<NativeHandle> for LockSet {
    fn extend<I: IntoIterator<Item = NativeHandle>>(&mut self, iter: I) {
        for handle in iter {
            self.push(handle);
        }
    }
}

/// Locks taken by `lock_all`, released in reverse by `unlock_all` or on drop
#[must_use = "dropping HeldLocks releases the locks immediately"]
pub struct HeldLocks<'a> {
    api: &'a dyn NativeApi,
    held: Handles,
}

/// Acquire every lock in `set`, in set order
///
/// On failure the locks already taken are released in reverse and the
/// failure is reported as `BridgeFatal`: a lock primitive failing means the
/// threading protocol has broken down.
pub fn lock_all<'a>(api: &'a dyn NativeApi, set: &LockSet, wait: bool) -> Result<HeldLocks<'a>> {
    let mut held = HeldLocks {
        api,
        held: Handles::new(),
    };
    for handle in set.iter() {
        if !api.lock(handle, wait) {
            let message = format!(
                "failed to lock {:?} ({} of {} acquired)",
                handle,
                held.held.len(),
                set.len()
            );
            logging::log_lock_failure(handle, "lock", &message);
            // Drop releases what was taken, newest first
            drop(held);
            return Err(BridgeError::BridgeFatal(message));
        }
        logging::log_lock_acquire(handle, wait);
        held.held.push(handle);
    }
    Ok(held)
}

impl<'a> HeldLocks<'a> {
    /// Handles currently held, in acquisition order
    pub fn handles(&self) -> &[NativeHandle] {
        &self.held
    }

    /// Release in reverse acquisition order
    ///
    /// Every lock is attempted even after a failure; any failure is
    /// reported as `BridgeFatal`.
    pub fn unlock_all(mut self) -> Result<()> {
        let mut failed = Vec::new();
        while let Some(handle) = self.held.pop() {
            if self.api.unlock(handle) {
                logging::log_lock_release(handle);
            } else {
                logging::log_lock_failure(handle, "unlock", "unlock primitive failed");
                failed.push(handle);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::BridgeFatal(format!(
                "failed to unlock {:?}",
                failed
            )))
        }
    }
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        while let Some(handle) = self.held.pop() {
            if self.api.unlock(handle) {
                logging::log_lock_release(handle);
            } else {
                logging::log_lock_failure(handle, "unlock", "unlock primitive failed during unwind");
            }
        }
    }
}

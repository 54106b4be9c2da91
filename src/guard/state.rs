//! Per-thread guard bookkeeping
//!
//! `depth` counts guarded calls active on this thread, `callback_depth`
//! the managed callbacks currently running inside them. A callback always
//! runs inside a guarded call, so `callback_depth` is `depth` (a callback
//! is running in the innermost call) or `depth - 1`.

use crate::error::{BridgeError, Result};
use std::cell::Cell;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
    static BRIDGE: Cell<u64> = const { Cell::new(0) };
}

/// Check a guarded call may start here; returns whether it is nested
///
/// Nesting is only legal from inside a callback of the innermost guarded
/// call, on the same bridge.
pub(crate) fn check_entry(bridge_id: u64, op: &str) -> Result<bool> {
    let depth = DEPTH.with(Cell::get);
    if depth == 0 {
        return Ok(false);
    }
    if CALLBACK_DEPTH.with(Cell::get) < depth {
        return Err(BridgeError::Reentrancy(format!(
            "{} called while this thread is already inside a guarded native call",
            op
        )));
    }
    if BRIDGE.with(Cell::get) != bridge_id {
        return Err(BridgeError::Reentrancy(format!(
            "{} called from a callback of a different bridge",
            op
        )));
    }
    Ok(true)
}

/// Whether a guarded call on `bridge_id` could start on this thread now
pub(crate) fn can_enter(bridge_id: u64) -> bool {
    check_entry(bridge_id, "").is_ok()
}

/// Whether this thread is inside a guarded call of `bridge_id`, and so
/// holds its process lock
pub(crate) fn holds(bridge_id: u64) -> bool {
    DEPTH.with(Cell::get) > 0 && BRIDGE.with(Cell::get) == bridge_id
}

/// Number of guarded calls active on the current thread
pub fn guard_depth() -> usize {
    DEPTH.with(Cell::get)
}

/// Whether a managed callback is running on the current thread
pub fn in_callback() -> bool {
    CALLBACK_DEPTH.with(Cell::get) > 0
}

/// Marks one active guarded call on this thread
pub(crate) struct DepthGuard {
    previous_bridge: u64,
}

impl DepthGuard {
    pub(crate) fn enter(bridge_id: u64) -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        let previous_bridge = BRIDGE.with(|bridge| bridge.replace(bridge_id));
        Self { previous_bridge }
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
        BRIDGE.with(|bridge| bridge.set(self.previous_bridge));
    }
}

/// Marks a managed callback running on this thread
pub(crate) struct CallbackScope(());

impl CallbackScope {
    pub(crate) fn enter() -> Self {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        CallbackScope(())
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

//! HandleBox and LifecycleManager - ownership of native handles
//!
//! Design: a `HandleBox` holds exactly one native handle and a tagged
//! ownership state (Uninitialized -> Owned -> Released). `Lifecycle` is the
//! only code that creates, installs or annuls handles:
//! 1. `create`/`query` run the native constructor under a guard and hand
//!    the new object back unlocked
//! 2. `dispose` is the single release path, for explicit disposal and for
//!    drop alike; the state flip makes it exactly-once
//! 3. A release that cannot enter a guard on this thread is performed in
//!    place or queued for the next outermost guarded call

mod deferred;

#[cfg(test)]
mod tests;

pub use deferred::DeferredReleaseQueue;

use crate::callback::CallbackSlots;
use crate::error::{BridgeError, Result};
use crate::guard::{state, Bridge};
use crate::lock::LockSet;
use crate::logging;
use crate::native::{NativeApi, NativeHandle, StatusCode};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnershipState {
    /// Construction has not completed; no handle is held
    Uninitialized,
    Owned,
    /// The handle has been annulled or queued for annulling
    Released,
}

struct Slot {
    handle: NativeHandle,
    state: OwnershipState,
}

/// One native handle and its ownership state
///
/// A `HandleBox` does not release anything when dropped; the wrapper
/// owning it disposes through `Lifecycle`.
pub struct HandleBox {
    slot: Mutex<Slot>,
}

impl HandleBox {
    pub fn uninitialized() -> Self {
        Self {
            slot: Mutex::new(Slot {
                handle: NativeHandle::NULL,
                state: OwnershipState::Uninitialized,
            }),
        }
    }

    pub(crate) fn owned(handle: NativeHandle) -> Self {
        Self {
            slot: Mutex::new(Slot {
                handle,
                state: OwnershipState::Owned,
            }),
        }
    }

    pub fn state(&self) -> OwnershipState {
        self.slot.lock().state
    }

    /// The handle, while it is owned
    pub fn handle(&self) -> Result<NativeHandle> {
        let slot = self.slot.lock();
        match slot.state {
            OwnershipState::Owned => Ok(slot.handle),
            OwnershipState::Released => Err(BridgeError::DisposedObject),
            OwnershipState::Uninitialized => Err(BridgeError::NotConstructed),
        }
    }

    pub fn is_released(&self) -> bool {
        self.state() == OwnershipState::Released
    }

    /// Move to Released, returning the handle if it was owned
    pub(crate) fn release(&self) -> Option<NativeHandle> {
        let mut slot = self.slot.lock();
        let owned = slot.state == OwnershipState::Owned;
        slot.state = OwnershipState::Released;
        let handle = std::mem::replace(&mut slot.handle, NativeHandle::NULL);
        owned.then_some(handle)
    }

    pub(crate) fn install(&self, handle: NativeHandle) {
        let mut slot = self.slot.lock();
        slot.handle = handle;
        slot.state = OwnershipState::Owned;
    }
}

impl fmt::Debug for HandleBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("HandleBox")
            .field("handle", &slot.handle)
            .field("state", &slot.state)
            .finish()
    }
}

/// Creates, wraps and releases native objects for one bridge
#[derive(Clone, Copy)]
pub struct Lifecycle<'a> {
    bridge: &'a Bridge,
}

impl<'a> Lifecycle<'a> {
    pub fn new(bridge: &'a Bridge) -> Self {
        Self { bridge }
    }

    /// Run a native constructor and take ownership of what it returns
    ///
    /// Any failure, including a null result, is `NativeConstruction`
    /// unless it is a bridge protocol error; nothing is left allocated.
    pub fn create(
        &self,
        op: &'static str,
        locks: &LockSet,
        slots: CallbackSlots<'_>,
        ctor: impl FnOnce(&dyn NativeApi) -> NativeHandle,
    ) -> Result<HandleBox> {
        let result = self.query(op, locks, slots, ctor).and_then(|created| {
            created.ok_or_else(|| BridgeError::NativeConstruction {
                status: StatusCode::ERROR,
                message: format!("{} returned no object", op),
            })
        });
        result.map_err(|error| match error {
            BridgeError::NativeOperation { status, message } => {
                BridgeError::NativeConstruction { status, message }
            }
            other => other,
        })
    }

    /// Run a native call that may return an object; null means none
    pub fn query(
        &self,
        op: &'static str,
        locks: &LockSet,
        slots: CallbackSlots<'_>,
        call: impl FnOnce(&dyn NativeApi) -> NativeHandle,
    ) -> Result<Option<HandleBox>> {
        let returned = self.bridge.guarded(op, locks, slots, |api| {
            let handle = call(api);
            if handle.is_null() {
                return Ok(handle);
            }
            // Returned objects arrive locked by this thread
            if !api.status().is_ok() {
                api.annul(handle);
                return Ok(NativeHandle::NULL);
            }
            if api.unlock(handle) {
                logging::log_lock_release(handle);
                Ok(handle)
            } else {
                logging::log_lock_failure(handle, "unlock", "could not unlock a returned object");
                api.annul(handle);
                Err(BridgeError::BridgeFatal(format!(
                    "{} returned {:?}, which could not be unlocked",
                    op, handle
                )))
            }
        })??;
        Ok((!returned.is_null()).then(|| HandleBox::owned(returned)))
    }

    /// Take sole ownership of an unlocked handle the bridge did not create
    pub fn wrap(&self, handle: NativeHandle) -> Result<HandleBox> {
        if handle.is_null() {
            return Err(BridgeError::invalid_argument("cannot wrap a null handle"));
        }
        Ok(HandleBox::owned(handle))
    }

    /// Release `target`'s handle; returns whether this call released it
    pub fn dispose(&self, target: &HandleBox) -> Result<bool> {
        match target.release() {
            Some(handle) => {
                self.release(handle, "explicit")?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop-driven disposal: failures are logged, never raised
    pub fn dispose_implicit(&self, target: &HandleBox) {
        if let Some(handle) = target.release() {
            if let Err(error) = self.release(handle, "implicit") {
                let loud = self.bridge.config().lifecycle.warn_on_implicit_failure;
                logging::log_release_failure(handle, &error.to_string(), loud);
            }
        }
    }

    /// Dispose `target`'s current handle, then give it `fresh`'s
    pub fn replace(&self, target: &HandleBox, fresh: HandleBox) -> Result<()> {
        let handle = fresh.handle()?;
        let disposed = match target.release() {
            Some(old) => self.release(old, "replaced"),
            None => Ok(()),
        };
        target.install(handle);
        disposed
    }

    fn release(&self, handle: NativeHandle, how: &str) -> Result<()> {
        let bridge = self.bridge;
        let lifecycle = &bridge.config().lifecycle;
        if state::can_enter(bridge.id()) {
            bridge.guarded("annul", &LockSet::new(), CallbackSlots::none(), |api| {
                api.annul(handle)
            })?;
        } else if state::holds(bridge.id()) && !lifecycle.defer_reentrant_release {
            bridge.release_in_place(handle)?;
        } else {
            let pending = bridge.deferred().defer(handle);
            bridge.counters().deferred_releases.fetch_add(1, Ordering::Relaxed);
            logging::log_release_deferred(handle, pending);
            return Ok(());
        }
        bridge.counters().releases.fetch_add(1, Ordering::Relaxed);
        logging::log_dispose(handle, how);
        Ok(())
    }
}

//! Managed wrappers over native objects
//!
//! Every wrapper owns one `HandleBox` and the `Bridge` it was made with.
//! Operations check the handle before any native call, so a disposed
//! wrapper fails with `DisposedObject` without touching the library.
//! Dropping a wrapper disposes it implicitly.

mod channel;
mod frame;
mod mapping;
mod plot;


pub use channel::Channel;
pub use frame::Frame;
pub use mapping::{IntraMap, Mapping};
pub use plot::Plot;

use crate::callback::CallbackSlots;
use crate::error::{BridgeError, Result};
use crate::guard::Bridge;
use crate::handle::{HandleBox, OwnershipState};
use crate::lock::LockSet;
use crate::native::{AttrType, AttrValue, NativeApi, NativeHandle};
use std::fmt;

/// Native class of an object, as reported by its `Class` attribute
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Frame,
    UnitMap,
    ZoomMap,
    IntraMap,
    Channel,
    Plot,
    Other(String),
}

impl ObjectKind {
    pub fn from_class(class: &str) -> Self {
        match class {
            "Frame" => Self::Frame,
            "UnitMap" => Self::UnitMap,
            "ZoomMap" => Self::ZoomMap,
            "IntraMap" => Self::IntraMap,
            "Channel" => Self::Channel,
            "Plot" => Self::Plot,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::UnitMap | Self::ZoomMap | Self::IntraMap)
    }
}

/// A native object of any class
pub struct AstObject {
    bridge: Bridge,
    handle: HandleBox,
}

impl AstObject {
    pub(crate) fn from_box(bridge: &Bridge, handle: HandleBox) -> Self {
        Self {
            bridge: bridge.clone(),
            handle,
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn handle(&self) -> Result<NativeHandle> {
        self.handle.handle()
    }

    pub fn state(&self) -> OwnershipState {
        self.handle.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.is_released()
    }

    /// Release the native object now; later calls are no-ops
    ///
    /// Returns whether this call performed the release.
    pub fn dispose(&self) -> Result<bool> {
        self.bridge.lifecycle().dispose(&self.handle)
    }

    /// Dispose the current native object and take over `fresh`'s
    pub fn replace(&self, fresh: AstObject) -> Result<()> {
        if !self.bridge.same_bridge(&fresh.bridge) {
            return Err(BridgeError::invalid_argument(
                "cannot replace an object with one from a different bridge",
            ));
        }
        let handle = fresh.handle()?;
        // Released here so dropping `fresh` leaves the handle alone
        fresh.handle.release();
        self.bridge.lifecycle().replace(&self.handle, HandleBox::owned(handle))
    }

    /// Guarded call with this object locked
    pub(crate) fn call<T>(
        &self,
        op: &'static str,
        body: impl FnOnce(&dyn NativeApi, NativeHandle) -> T,
    ) -> Result<T> {
        let handle = self.handle()?;
        self.bridge
            .guarded(op, &LockSet::of([handle]), CallbackSlots::none(), |api| body(api, handle))
    }

    pub fn get(&self, name: &str, ty: AttrType) -> Result<AttrValue> {
        self.call("astGet", |api, handle| api.get_attr(handle, name, ty))?
            .ok_or_else(|| BridgeError::invalid_argument(format!("attribute {} returned no value", name)))
    }

    pub fn get_c(&self, name: &str) -> Result<String> {
        match self.get(name, AttrType::C)? {
            AttrValue::C(value) => Ok(value),
            other => Ok(other.to_native_string()),
        }
    }

    pub fn get_d(&self, name: &str) -> Result<f64> {
        match self.get(name, AttrType::D)? {
            AttrValue::D(value) => Ok(value),
            other => Err(mistyped(name, &other)),
        }
    }

    pub fn get_f(&self, name: &str) -> Result<f32> {
        match self.get(name, AttrType::F)? {
            AttrValue::F(value) => Ok(value),
            other => Err(mistyped(name, &other)),
        }
    }

    pub fn get_i(&self, name: &str) -> Result<i32> {
        match self.get(name, AttrType::I)? {
            AttrValue::I(value) => Ok(value),
            other => Err(mistyped(name, &other)),
        }
    }

    pub fn get_l(&self, name: &str) -> Result<i64> {
        match self.get(name, AttrType::L)? {
            AttrValue::L(value) => Ok(value),
            other => Err(mistyped(name, &other)),
        }
    }

    pub fn set_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        self.call("astSet", |api, handle| api.set_attr(handle, name, &value))
    }

    pub fn set_c(&self, name: &str, value: &str) -> Result<()> {
        self.set_attr(name, AttrValue::C(value.to_string()))
    }

    pub fn set_d(&self, name: &str, value: f64) -> Result<()> {
        self.set_attr(name, AttrValue::D(value))
    }

    pub fn set_f(&self, name: &str, value: f32) -> Result<()> {
        self.set_attr(name, AttrValue::F(value))
    }

    pub fn set_i(&self, name: &str, value: i32) -> Result<()> {
        self.set_attr(name, AttrValue::I(value))
    }

    pub fn set_l(&self, name: &str, value: i64) -> Result<()> {
        self.set_attr(name, AttrValue::L(value))
    }

    /// Apply a comma-separated `name=value` list; `%` is passed literally
    pub fn set(&self, settings: &str) -> Result<()> {
        let escaped = settings.replace('%', "%%");
        self.call("astSet", |api, handle| api.set(handle, &escaped))
    }

    pub fn test(&self, name: &str) -> Result<bool> {
        self.call("astTest", |api, handle| api.test_attr(handle, name))
    }

    pub fn clear(&self, name: &str) -> Result<()> {
        self.call("astClear", |api, handle| api.clear_attr(handle, name))
    }

    pub fn class(&self) -> Result<String> {
        self.get_c("Class")
    }

    pub fn kind(&self) -> Result<ObjectKind> {
        self.class().map(|class| ObjectKind::from_class(&class))
    }

    /// Deep copy, owned by a new wrapper
    pub fn copy(&self) -> Result<AstObject> {
        self.derive("astCopy", |api, handle| api.copy(handle))
    }

    /// New reference to the same native object
    pub fn clone_ref(&self) -> Result<AstObject> {
        self.derive("astClone", |api, handle| api.clone_handle(handle))
    }

    fn derive(
        &self,
        op: &'static str,
        ctor: impl FnOnce(&dyn NativeApi, NativeHandle) -> NativeHandle,
    ) -> Result<AstObject> {
        let handle = self.handle()?;
        let created = self.bridge.lifecycle().create(
            op,
            &LockSet::of([handle]),
            CallbackSlots::none(),
            |api| ctor(api, handle),
        )?;
        Ok(AstObject::from_box(&self.bridge, created))
    }

    /// Fail with `WrongClass` unless `accept` holds for this object's class
    pub(crate) fn expect_class(
        &self,
        expected: &'static str,
        accept: impl FnOnce(&ObjectKind) -> bool,
    ) -> Result<()> {
        let class = self.class()?;
        if accept(&ObjectKind::from_class(&class)) {
            Ok(())
        } else {
            Err(BridgeError::WrongClass {
                expected,
                found: class,
            })
        }
    }
}

fn mistyped(name: &str, value: &AttrValue) -> BridgeError {
    BridgeError::invalid_argument(format!(
        "attribute {} returned a {:?} value",
        name,
        value.attr_type()
    ))
}

impl fmt::Debug for AstObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AstObject")
            .field("bridge", &self.bridge.id())
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for AstObject {
    fn drop(&mut self) {
        self.bridge.lifecycle().dispose_implicit(&self.handle);
    }
}

use super::{AstObject, ObjectKind};
use crate::callback::CallbackSlots;
use crate::error::{BridgeError, Result};
use crate::guard::Bridge;
use crate::lock::LockSet;
use std::ops::Deref;

/// A coordinate system with `naxes` axes
#[derive(Debug)]
pub struct Frame {
    object: AstObject,
}

impl Frame {
    pub fn new(bridge: &Bridge, naxes: i32) -> Result<Self> {
        let handle = bridge.lifecycle().create(
            "astFrame",
            &LockSet::new(),
            CallbackSlots::none(),
            |api| api.new_frame(naxes),
        )?;
        Ok(Self {
            object: AstObject::from_box(bridge, handle),
        })
    }

    pub fn naxes(&self) -> Result<i32> {
        self.object.get_i("Naxes")
    }

    pub fn title(&self) -> Result<String> {
        self.object.get_c("Title")
    }

    pub fn set_title(&self, title: &str) -> Result<()> {
        self.object.set_c("Title", title)
    }

    pub fn label(&self, axis: i32) -> Result<String> {
        self.object.get_c(&axis_attr("Label", axis)?)
    }

    pub fn set_label(&self, axis: i32, label: &str) -> Result<()> {
        self.object.set_c(&axis_attr("Label", axis)?, label)
    }

    pub fn into_object(self) -> AstObject {
        self.object
    }
}

fn axis_attr(name: &str, axis: i32) -> Result<String> {
    if axis < 1 {
        return Err(BridgeError::invalid_argument(format!(
            "axis index {} is invalid: axes are numbered from 1",
            axis
        )));
    }
    Ok(format!("{}({})", name, axis))
}

impl Deref for Frame {
    type Target = AstObject;

    fn deref(&self) -> &AstObject {
        &self.object
    }
}

impl TryFrom<AstObject> for Frame {
    type Error = BridgeError;

    fn try_from(object: AstObject) -> Result<Self> {
        object.expect_class("Frame", |kind| *kind == ObjectKind::Frame)?;
        Ok(Self { object })
    }
}

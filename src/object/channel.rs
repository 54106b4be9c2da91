use super::{AstObject, ObjectKind};
use crate::callback::{sink_trampoline, source_trampoline, CallbackSlots, Sink, Source};
use crate::error::{BridgeError, Result};
use crate::guard::Bridge;
use crate::lock::LockSet;
use std::ops::Deref;

/// Reads and writes objects as text, a line at a time
///
/// The lines come from, or go to, the `Source` or `Sink` passed to each
/// call; a Channel keeps no stream of its own.
#[derive(Debug)]
pub struct Channel {
    object: AstObject,
}

impl Channel {
    pub fn new(bridge: &Bridge) -> Result<Self> {
        let handle = bridge.lifecycle().create(
            "astChannel",
            &LockSet::new(),
            CallbackSlots::none(),
            |api| api.new_channel(Some(source_trampoline), Some(sink_trampoline)),
        )?;
        Ok(Self {
            object: AstObject::from_box(bridge, handle),
        })
    }

    /// Read the next object from `source`; `None` at end of input
    pub fn read(&self, source: &mut dyn Source) -> Result<Option<AstObject>> {
        let handle = self.object.handle()?;
        let bridge = self.object.bridge();
        let read = bridge.lifecycle().query(
            "astRead",
            &LockSet::of([handle]),
            CallbackSlots::none().source(source),
            |api| api.channel_read(handle),
        )?;
        Ok(read.map(|created| AstObject::from_box(bridge, created)))
    }

    /// Write `object` to `sink`; returns the number of objects written
    pub fn write(&self, object: &AstObject, sink: &mut dyn Sink) -> Result<usize> {
        if !self.object.bridge().same_bridge(object.bridge()) {
            return Err(BridgeError::invalid_argument(
                "cannot write an object belonging to a different bridge",
            ));
        }
        let channel = self.object.handle()?;
        let target = object.handle()?;
        let written = self.object.bridge().guarded(
            "astWrite",
            &LockSet::of([channel, target]),
            CallbackSlots::none().sink(sink),
            |api| api.channel_write(channel, target),
        )?;
        Ok(written.max(0) as usize)
    }

    pub fn into_object(self) -> AstObject {
        self.object
    }
}

impl Deref for Channel {
    type Target = AstObject;

    fn deref(&self) -> &AstObject {
        &self.object
    }
}

impl TryFrom<AstObject> for Channel {
    type Error = BridgeError;

    fn try_from(object: AstObject) -> Result<Self> {
        object.expect_class("Channel", |kind| *kind == ObjectKind::Channel)?;
        Ok(Self { object })
    }
}

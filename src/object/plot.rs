use super::{AstObject, Frame, ObjectKind};
use crate::callback::{CallbackSlots, Grf};
use crate::error::{BridgeError, Result};
use crate::grf::DisplayList;
use crate::guard;
use crate::lock::LockSet;
use crate::native::{NativeApi, NativeHandle};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::Deref;

/// A 2-d plotting surface drawing through its own `Grf`
///
/// The Plot holds a copy of the Frame it was made from. Drawing calls
/// reach `grf` through the graphics trampolines for their duration only.
pub struct Plot<G: Grf + Send = DisplayList> {
    object: AstObject,
    grf: Mutex<G>,
}

impl<G: Grf + Send> Plot<G> {
    /// `graphbox` is the plotting area in graphics units and `basebox`
    /// the same corners in `frame` coordinates, both as x1, y1, x2, y2
    pub fn new(frame: &Frame, graphbox: [f32; 4], basebox: [f64; 4], grf: G) -> Result<Self> {
        let source = frame.handle()?;
        let bridge = frame.bridge();
        let handle = bridge.lifecycle().create(
            "astPlot",
            &LockSet::of([source]),
            CallbackSlots::none(),
            |api| api.new_plot(source, &graphbox, &basebox),
        )?;
        Ok(Self {
            object: AstObject::from_box(bridge, handle),
            grf: Mutex::new(grf),
        })
    }

    /// Wrap an object already known to be a Plot
    pub fn from_object(object: AstObject, grf: G) -> Result<Self> {
        object.expect_class("Plot", |kind| *kind == ObjectKind::Plot)?;
        Ok(Self {
            object,
            grf: Mutex::new(grf),
        })
    }

    fn draw<T>(&self, op: &'static str, body: impl FnOnce(&dyn NativeApi, NativeHandle) -> T) -> Result<T> {
        let handle = self.object.handle()?;
        let mut grf = self.lock_grf(op)?;
        self.object.bridge().guarded(
            op,
            &LockSet::of([handle]),
            CallbackSlots::none().grf(&mut *grf),
            |api| body(api, handle),
        )
    }

    /// Inside a guarded call the grf may be held further up this stack, or
    /// by a thread waiting for the process lock, so it is never waited for
    fn lock_grf(&self, op: &str) -> Result<MutexGuard<'_, G>> {
        if guard::guard_depth() > 0 {
            self.grf.try_lock().ok_or_else(|| {
                BridgeError::Reentrancy(format!("{} called while this Plot's grf is in use", op))
            })
        } else {
            Ok(self.grf.lock())
        }
    }

    /// Draw the outline of the plotting area; returns whether anything was drawn
    pub fn border(&self) -> Result<bool> {
        self.draw("astBorder", |api, handle| api.plot_border(handle))
    }

    /// Draw grid lines, axis labels and title
    pub fn grid(&self) -> Result<()> {
        self.draw("astGrid", |api, handle| api.plot_grid(handle))
    }

    /// Draw a marker at each point; `points` holds one row per axis
    pub fn mark(&self, points: &[&[f64]], marktype: i32) -> Result<()> {
        let Some(first) = points.first() else {
            return Err(BridgeError::invalid_argument("astMark: no coordinates supplied"));
        };
        let nmark = first.len();
        for row in points {
            if row.len() < nmark {
                return Err(BridgeError::invalid_argument(format!(
                    "Supplied array has only {} elements (needs {})",
                    row.len(),
                    nmark
                )));
            }
        }
        let flat: Vec<f64> = points.iter().flat_map(|row| row[..nmark].iter().copied()).collect();
        let ncoord = points.len() as i32;
        self.draw("astMark", |api, handle| {
            api.plot_mark(handle, nmark as i32, ncoord, nmark as i32, &flat, marktype)
        })
    }

    /// Draw `text` at `pos` with justification such as `"CC"` or `"BL"`
    pub fn text(&self, text: &str, pos: [f64; 2], up: [f32; 2], just: &str) -> Result<()> {
        self.draw("astText", |api, handle| api.plot_text(handle, text, &pos, &up, just))
    }

    /// Lower-left and upper-right corners of what the last drawing call drew
    pub fn bounding_box(&self) -> Result<([f32; 2], [f32; 2])> {
        self.object
            .call("astBoundingBox", |api, handle| api.plot_bounding_box(handle))
    }

    /// The Plot's own Frame, as a new wrapper sharing the native object
    pub fn frame(&self) -> Result<Frame> {
        let handle = self.object.handle()?;
        let bridge = self.object.bridge();
        let queried = bridge.lifecycle().query(
            "astGetFrame",
            &LockSet::of([handle]),
            CallbackSlots::none(),
            |api| api.get_frame(handle, 1),
        )?;
        let created = queried.ok_or_else(|| BridgeError::NativeOperation {
            status: crate::native::StatusCode::ERROR,
            message: "astGetFrame returned no Frame".to_string(),
        })?;
        Frame::try_from(AstObject::from_box(bridge, created))
    }

    /// The graphics target
    ///
    /// Outside a guarded call this waits for a running drawing call to
    /// finish; inside one it fails with `Reentrancy` instead of waiting.
    pub fn grf(&self) -> Result<MutexGuard<'_, G>> {
        self.lock_grf("Plot::grf")
    }

    pub fn into_parts(self) -> (AstObject, G) {
        (self.object, self.grf.into_inner())
    }
}

impl<G: Grf + Send> Deref for Plot<G> {
    type Target = AstObject;

    fn deref(&self) -> &AstObject {
        &self.object
    }
}

impl<G: Grf + Send> fmt::Debug for Plot<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plot").field("object", &self.object).finish()
    }
}

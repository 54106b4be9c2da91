//! Journaling decorator over any `NativeApi`
//!
//! Forwards every call unchanged, traces it, and keeps an in-memory record
//! of lock, unlock and annul activity so the ordering and balance of native
//! calls can be checked after the fact.

use super::{
    AttrType, AttrValue, GrfFns, NativeApi, NativeHandle, PutErrFn, SinkFn, SourceFn, StatusCode,
    TranFn,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeEvent {
    Lock {
        handle: NativeHandle,
        thread: ThreadId,
        wait: bool,
        ok: bool,
    },
    Unlock {
        handle: NativeHandle,
        thread: ThreadId,
        ok: bool,
    },
    Annul {
        handle: NativeHandle,
        thread: ThreadId,
    },
    /// Any other entry point, by name
    Call {
        name: &'static str,
        thread: ThreadId,
    },
}

impl NativeEvent {
    pub fn thread(&self) -> ThreadId {
        match self {
            NativeEvent::Lock { thread, .. }
            | NativeEvent::Unlock { thread, .. }
            | NativeEvent::Annul { thread, .. }
            | NativeEvent::Call { thread, .. } => *thread,
        }
    }
}

pub struct JournalingApi {
    inner: Arc<dyn NativeApi>,
    events: Mutex<Vec<NativeEvent>>,
}

impl JournalingApi {
    pub fn new(inner: Arc<dyn NativeApi>) -> Self {
        Self {
            inner,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn NativeApi> {
        &self.inner
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<NativeEvent> {
        self.events.lock().clone()
    }

    pub fn take_events(&self) -> Vec<NativeEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Successful lock acquisitions, in order
    pub fn locks(&self) -> Vec<NativeHandle> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                NativeEvent::Lock { handle, ok: true, .. } => Some(*handle),
                _ => None,
            })
            .collect()
    }

    /// Successful unlocks, in order
    pub fn unlocks(&self) -> Vec<NativeHandle> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                NativeEvent::Unlock { handle, ok: true, .. } => Some(*handle),
                _ => None,
            })
            .collect()
    }

    pub fn annuls(&self) -> Vec<NativeHandle> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                NativeEvent::Annul { handle, .. } => Some(*handle),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: NativeEvent) {
        self.events.lock().push(event);
    }

    fn call(&self, name: &'static str) {
        trace!(target: "astbridge::native", call = name, backend = self.inner.name(), "native call");
        self.push(NativeEvent::Call {
            name,
            thread: std::thread::current().id(),
        });
    }
}

impl NativeApi for JournalingApi {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn set_status(&self, status: StatusCode) {
        self.inner.set_status(status)
    }

    fn clear_status(&self) {
        self.inner.clear_status()
    }

    fn install_error_reporter(&self, reporter: Option<PutErrFn>) {
        self.inner.install_error_reporter(reporter)
    }

    fn lock(&self, handle: NativeHandle, wait: bool) -> bool {
        let ok = self.inner.lock(handle, wait);
        trace!(target: "astbridge::lock", ?handle, wait, ok, "native lock");
        self.push(NativeEvent::Lock {
            handle,
            thread: std::thread::current().id(),
            wait,
            ok,
        });
        ok
    }

    fn unlock(&self, handle: NativeHandle) -> bool {
        let ok = self.inner.unlock(handle);
        trace!(target: "astbridge::lock", ?handle, ok, "native unlock");
        self.push(NativeEvent::Unlock {
            handle,
            thread: std::thread::current().id(),
            ok,
        });
        ok
    }

    fn annul(&self, handle: NativeHandle) {
        trace!(target: "astbridge::native", ?handle, "native annul");
        self.push(NativeEvent::Annul {
            handle,
            thread: std::thread::current().id(),
        });
        self.inner.annul(handle)
    }

    fn clone_handle(&self, handle: NativeHandle) -> NativeHandle {
        self.call("clone");
        self.inner.clone_handle(handle)
    }

    fn copy(&self, handle: NativeHandle) -> NativeHandle {
        self.call("copy");
        self.inner.copy(handle)
    }

    fn get_attr(&self, handle: NativeHandle, name: &str, ty: AttrType) -> Option<AttrValue> {
        self.call("get_attr");
        self.inner.get_attr(handle, name, ty)
    }

    fn set_attr(&self, handle: NativeHandle, name: &str, value: &AttrValue) {
        self.call("set_attr");
        self.inner.set_attr(handle, name, value)
    }

    fn set(&self, handle: NativeHandle, settings: &str) {
        self.call("set");
        self.inner.set(handle, settings)
    }

    fn test_attr(&self, handle: NativeHandle, name: &str) -> bool {
        self.call("test_attr");
        self.inner.test_attr(handle, name)
    }

    fn clear_attr(&self, handle: NativeHandle, name: &str) {
        self.call("clear_attr");
        self.inner.clear_attr(handle, name)
    }

    fn new_frame(&self, naxes: i32) -> NativeHandle {
        self.call("new_frame");
        self.inner.new_frame(naxes)
    }

    fn new_unit_map(&self, ncoord: i32) -> NativeHandle {
        self.call("new_unit_map");
        self.inner.new_unit_map(ncoord)
    }

    fn new_zoom_map(&self, ncoord: i32, zoom: f64) -> NativeHandle {
        self.call("new_zoom_map");
        self.inner.new_zoom_map(ncoord, zoom)
    }

    fn new_channel(&self, source: Option<SourceFn>, sink: Option<SinkFn>) -> NativeHandle {
        self.call("new_channel");
        self.inner.new_channel(source, sink)
    }

    fn intra_reg(
        &self,
        name: &str,
        nin: i32,
        nout: i32,
        tran: TranFn,
        flags: u32,
        purpose: &str,
        author: &str,
        contact: &str,
    ) {
        self.call("intra_reg");
        self.inner
            .intra_reg(name, nin, nout, tran, flags, purpose, author, contact)
    }

    fn new_intra_map(&self, name: &str, nin: i32, nout: i32) -> NativeHandle {
        self.call("new_intra_map");
        self.inner.new_intra_map(name, nin, nout)
    }

    fn channel_read(&self, channel: NativeHandle) -> NativeHandle {
        self.call("channel_read");
        self.inner.channel_read(channel)
    }

    fn channel_write(&self, channel: NativeHandle, object: NativeHandle) -> i32 {
        self.call("channel_write");
        self.inner.channel_write(channel, object)
    }

    fn tran_n(
        &self,
        map: NativeHandle,
        npoint: i32,
        ncoord_in: i32,
        indim: i32,
        input: &[f64],
        forward: bool,
        ncoord_out: i32,
        outdim: i32,
        output: &mut [f64],
    ) {
        self.call("tran_n");
        self.inner.tran_n(
            map, npoint, ncoord_in, indim, input, forward, ncoord_out, outdim, output,
        )
    }

    fn simplify(&self, map: NativeHandle) -> NativeHandle {
        self.call("simplify");
        self.inner.simplify(map)
    }

    fn invert(&self, map: NativeHandle) {
        self.call("invert");
        self.inner.invert(map)
    }

    fn new_plot(&self, frame: NativeHandle, graphbox: &[f32; 4], basebox: &[f64; 4]) -> NativeHandle {
        self.call("new_plot");
        self.inner.new_plot(frame, graphbox, basebox)
    }

    fn get_frame(&self, frameset: NativeHandle, index: i32) -> NativeHandle {
        self.call("get_frame");
        self.inner.get_frame(frameset, index)
    }

    fn install_grf(&self, grf: Option<GrfFns>) {
        self.inner.install_grf(grf)
    }

    fn plot_border(&self, plot: NativeHandle) -> bool {
        self.call("plot_border");
        self.inner.plot_border(plot)
    }

    fn plot_grid(&self, plot: NativeHandle) {
        self.call("plot_grid");
        self.inner.plot_grid(plot)
    }

    fn plot_mark(&self, plot: NativeHandle, nmark: i32, ncoord: i32, indim: i32, input: &[f64], marktype: i32) {
        self.call("plot_mark");
        self.inner.plot_mark(plot, nmark, ncoord, indim, input, marktype)
    }

    fn plot_text(&self, plot: NativeHandle, text: &str, pos: &[f64], up: &[f32; 2], just: &str) {
        self.call("plot_text");
        self.inner.plot_text(plot, text, pos, up, just)
    }

    fn plot_bounding_box(&self, plot: NativeHandle) -> ([f32; 2], [f32; 2]) {
        self.call("plot_bounding_box");
        self.inner.plot_bounding_box(plot)
    }
}

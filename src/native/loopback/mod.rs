//! Loopback library - an in-process implementation of the native surface
//!
//! Design: behaves like the wrapped C library as far as the bridge can
//! observe it:
//! 1. Handles are opaque addresses into a handle table; several handles
//!    may refer to one refcounted object
//! 2. Every object carries a thread-affinity lock; a Plot's lock also
//!    covers the Frame it contains
//! 3. Errors go to a per-thread status slot plus the installed reporter
//! 4. Work functions call back through plain C function pointers, never
//!    while holding any of the library's own mutexes

mod channel;
mod mapping;
pub(crate) mod object;
mod plot;

#[cfg(test)]
mod tests;

use crate::native::{
    AttrType, AttrValue, GrfFns, NativeApi, NativeHandle, PutErrFn, SinkFn, SourceFn, StatusCode,
    TranFn,
};
use dashmap::DashMap;
use object::{AttrDesc, Body, Holder, Kind, NativeObject, ValueKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::trace;

/// Failure raised inside the library, reported through the status slot
#[derive(Debug)]
pub(crate) struct Fault {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
}

impl Fault {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

pub(crate) type Fallible<T> = Result<T, Fault>;

/// A registered IntraMap transformation
#[derive(Clone)]
pub(crate) struct IntraClass {
    pub(crate) tran: TranFn,
    pub(crate) nin: i32,
    pub(crate) nout: i32,
    pub(crate) flags: u32,
    pub(crate) purpose: String,
    pub(crate) author: String,
    pub(crate) contact: String,
}

pub struct LoopbackLibrary {
    handles: RwLock<HashMap<usize, Arc<NativeObject>>>,
    next_handle: AtomicUsize,
    status: DashMap<ThreadId, StatusCode>,
    reporter: RwLock<Option<PutErrFn>>,
    intra: DashMap<String, IntraClass>,
    grf: RwLock<Option<GrfFns>>,
}

impl Default for LoopbackLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackLibrary {
    const FIRST_HANDLE: usize = 0x1000;
    const HANDLE_STRIDE: usize = 0x10;

    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicUsize::new(Self::FIRST_HANDLE),
            status: DashMap::new(),
            reporter: RwLock::new(None),
            intra: DashMap::new(),
            grf: RwLock::new(None),
        }
    }

    /// Number of handles not yet annulled
    pub fn live_handles(&self) -> usize {
        self.handles.read().len()
    }

    /// Number of distinct objects reachable through a live handle
    pub fn live_objects(&self) -> usize {
        let handles = self.handles.read();
        let mut ids: Vec<u64> = handles.values().map(|obj| obj.id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Whether `handle` refers to a live object
    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.handles.read().contains_key(&handle.addr())
    }

    /// Whether the calling thread currently holds the object's lock
    pub fn is_locked_by_current_thread(&self, handle: NativeHandle) -> bool {
        self.lookup(handle)
            .map(|obj| obj.is_locked_by(current()))
            .unwrap_or(false)
    }

    /// Metadata of a registered IntraMap transformation
    pub fn intra_registration(&self, name: &str) -> Option<(u32, String, String, String)> {
        self.intra.get(name).map(|class| {
            (
                class.flags,
                class.purpose.clone(),
                class.author.clone(),
                class.contact.clone(),
            )
        })
    }

    fn lookup(&self, handle: NativeHandle) -> Option<Arc<NativeObject>> {
        self.handles.read().get(&handle.addr()).cloned()
    }

    pub(crate) fn insert(&self, object: Arc<NativeObject>) -> NativeHandle {
        let addr = self
            .next_handle
            .fetch_add(Self::HANDLE_STRIDE, Ordering::Relaxed);
        object.refcount.fetch_add(1, Ordering::AcqRel);
        self.handles.write().insert(addr, object);
        NativeHandle::from_addr(addr)
    }

    pub(crate) fn resolve(&self, handle: NativeHandle) -> Fallible<Arc<NativeObject>> {
        self.lookup(handle).ok_or_else(|| {
            Fault::new(
                StatusCode::INVALID_OBJECT,
                format!("Invalid object handle {:#x}", handle.addr()),
            )
        })
    }

    /// Resolve a handle the calling thread must have locked
    pub(crate) fn owned(&self, handle: NativeHandle) -> Fallible<Arc<NativeObject>> {
        let obj = self.resolve(handle)?;
        if !obj.is_locked_by(current()) {
            return Err(Fault::new(
                StatusCode::LOCK_ERROR,
                format!(
                    "The {} ({:#x}) is not locked by the current thread",
                    obj.class(),
                    handle.addr()
                ),
            ));
        }
        Ok(obj)
    }

    pub(crate) fn create(&self, body: Body) -> NativeHandle {
        self.insert(NativeObject::new(body, current()))
    }

    pub(crate) fn intra_class(&self, name: &str) -> Option<IntraClass> {
        self.intra.get(name).map(|class| class.clone())
    }

    pub(crate) fn grf_fns(&self) -> Option<GrfFns> {
        *self.grf.read()
    }

    /// First error wins the status slot; every message reaches the reporter
    pub(crate) fn report(&self, status: StatusCode, message: &str) {
        trace!(target: "astbridge::native", %status, message, "loopback error");
        if self.status().is_ok() {
            self.set_status(status);
        }
        let reporter = *self.reporter.read();
        if let Some(reporter) = reporter {
            let text = CString::new(message.replace('\0', " ")).unwrap_or_default();
            reporter(status.0, text.as_ptr());
        }
    }

    fn run<T>(&self, fallback: T, op: impl FnOnce() -> Fallible<T>) -> T {
        if !self.status().is_ok() {
            return fallback;
        }
        match op() {
            Ok(value) => value,
            Err(fault) => {
                self.report(fault.status, &fault.message);
                fallback
            }
        }
    }

    /// Stop when a callback has left the status slot set
    pub(crate) fn after_callback(&self, context: &str) -> Fallible<()> {
        let status = self.status();
        if status.is_ok() {
            Ok(())
        } else {
            Err(Fault::new(status, format!("{}: callback reported an error", context)))
        }
    }

    fn describe(&self, obj: &NativeObject, name: &str) -> Fallible<AttrDesc> {
        let body = obj.body.lock();
        object::describe(&body.kind, body.naxes(), name).ok_or_else(|| {
            Fault::new(
                StatusCode::BAD_ATTRIBUTE,
                format!(
                    "\"{}\" is not a valid attribute of a {}",
                    name.trim(),
                    body.kind.class()
                ),
            )
        })
    }

    /// Object whose store holds `desc`
    fn holder(&self, obj: &Arc<NativeObject>, desc: &AttrDesc) -> Arc<NativeObject> {
        if desc.holder == Holder::Frame {
            if let Kind::Plot(plot) = &obj.body.lock().kind {
                return plot.frame.clone();
            }
        }
        obj.clone()
    }

    pub(crate) fn read_attr(&self, obj: &Arc<NativeObject>, desc: &AttrDesc) -> String {
        if desc.key == "RefCount" {
            return obj.refcount.load(Ordering::Acquire).to_string();
        }
        let target = self.holder(obj, desc);
        let body = target.body.lock();
        if let (Kind::ZoomMap { zoom, .. }, "Zoom") = (&body.kind, desc.key.as_str()) {
            return format!("{}", zoom);
        }
        if let Some(value) = body.attrs.get(&desc.key) {
            return value.clone();
        }
        let flags = match &body.kind {
            Kind::IntraMap { fname, .. } => self.intra.get(fname).map(|c| c.flags).unwrap_or(0),
            _ => 0,
        };
        object::default_value(&body, &desc.key, flags)
    }

    pub(crate) fn write_attr(&self, obj: &Arc<NativeObject>, name: &str, value: &str) -> Fallible<()> {
        let desc = self.describe(obj, name)?;
        if desc.read_only {
            return Err(Fault::new(
                StatusCode::READ_ONLY,
                format!("The {} attribute of a {} cannot be set", desc.key, obj.class()),
            ));
        }
        let value = object::normalize(&desc, value)?;
        let target = self.holder(obj, &desc);
        let mut body = target.body.lock();
        if let Kind::ZoomMap { zoom, .. } = &mut body.kind {
            if desc.key == "Zoom" {
                let parsed: f64 = value.parse().unwrap_or(0.0);
                if parsed == 0.0 {
                    return Err(Fault::new(
                        StatusCode::BAD_VALUE,
                        "ZoomMap zoom factor must be non-zero",
                    ));
                }
                *zoom = parsed;
                return Ok(());
            }
        }
        let value = match desc.key.as_str() {
            "Invert" if value != "0" => "1".to_string(),
            _ => value,
        };
        body.attrs.insert(desc.key, value);
        Ok(())
    }

    fn new_object(&self, body: Body) -> NativeHandle {
        let handle = self.create(body);
        trace!(target: "astbridge::native", ?handle, "loopback object created");
        handle
    }
}

pub(crate) fn current() -> ThreadId {
    std::thread::current().id()
}

fn convert(desc: &AttrDesc, raw: &str, ty: AttrType) -> Fallible<AttrValue> {
    let cannot = |what: &str| {
        Fault::new(
            StatusCode::BAD_VALUE,
            format!(
                "The {} attribute value \"{}\" cannot be read as {}",
                desc.key, raw, what
            ),
        )
    };
    let number = || raw.trim().parse::<f64>().ok().filter(|v| v.is_finite());
    match ty {
        AttrType::C => Ok(AttrValue::C(raw.to_string())),
        AttrType::D => number().map(AttrValue::D).ok_or_else(|| cannot("a double")),
        AttrType::F => number()
            .map(|v| AttrValue::F(v as f32))
            .ok_or_else(|| cannot("a float")),
        AttrType::I => number()
            .filter(|v| *v >= i32::MIN as f64 && *v <= i32::MAX as f64)
            .map(|v| AttrValue::I(v.round() as i32))
            .ok_or_else(|| cannot("an integer")),
        AttrType::L => match raw.trim().parse::<i64>() {
            Ok(v) => Ok(AttrValue::L(v)),
            Err(_) if desc.kind != ValueKind::Text => number()
                .map(|v| AttrValue::L(v.round() as i64))
                .ok_or_else(|| cannot("a long integer")),
            Err(_) => Err(cannot("a long integer")),
        },
    }
}

/// Split a printf-style settings string into (name, value) pairs
fn parse_settings(settings: &str) -> Fallible<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for item in settings.split(',') {
        if item.trim().is_empty() {
            continue;
        }
        let (name, value) = item.split_once('=').ok_or_else(|| {
            Fault::new(
                StatusCode::BAD_VALUE,
                format!("Invalid attribute setting \"{}\"", item.trim()),
            )
        })?;

        let mut text = String::with_capacity(value.len());
        let mut chars = value.trim().chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                text.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => text.push('%'),
                other => {
                    return Err(Fault::new(
                        StatusCode::BAD_VALUE,
                        format!(
                            "Unsupported format directive \"%{}\" in setting \"{}\"",
                            other.map(String::from).unwrap_or_default(),
                            item.trim()
                        ),
                    ))
                }
            }
        }
        pairs.push((name.trim().to_string(), text));
    }
    Ok(pairs)
}

impl NativeApi for LoopbackLibrary {
    fn name(&self) -> &str {
        "loopback"
    }

    fn status(&self) -> StatusCode {
        self.status
            .get(&current())
            .map(|status| *status)
            .unwrap_or(StatusCode::OK)
    }

    fn set_status(&self, status: StatusCode) {
        if status.is_ok() {
            self.status.remove(&current());
        } else {
            self.status.insert(current(), status);
        }
    }

    fn clear_status(&self) {
        self.status.remove(&current());
    }

    fn install_error_reporter(&self, reporter: Option<PutErrFn>) {
        *self.reporter.write() = reporter;
    }

    fn lock(&self, handle: NativeHandle, wait: bool) -> bool {
        let obj = match self.resolve(handle) {
            Ok(obj) => obj,
            Err(fault) => {
                self.report(fault.status, &fault.message);
                return false;
            }
        };
        let me = current();
        if !obj.acquire(me, wait) {
            self.report(
                StatusCode::LOCK_ERROR,
                &format!("The {} ({:#x}) is locked by another thread", obj.class(), handle.addr()),
            );
            return false;
        }
        let children = obj.children();
        for (taken, child) in children.iter().enumerate() {
            if !child.acquire(me, wait) {
                for held in children[..taken].iter().rev() {
                    held.release(me);
                }
                obj.release(me);
                self.report(
                    StatusCode::LOCK_ERROR,
                    &format!(
                        "A {} inside the {} ({:#x}) is locked by another thread",
                        child.class(),
                        obj.class(),
                        handle.addr()
                    ),
                );
                return false;
            }
        }
        true
    }

    fn unlock(&self, handle: NativeHandle) -> bool {
        let obj = match self.resolve(handle) {
            Ok(obj) => obj,
            Err(fault) => {
                self.report(fault.status, &fault.message);
                return false;
            }
        };
        let me = current();
        if !obj.is_locked_by(me) {
            self.report(
                StatusCode::LOCK_ERROR,
                &format!(
                    "The {} ({:#x}) cannot be unlocked: it is not locked by the current thread",
                    obj.class(),
                    handle.addr()
                ),
            );
            return false;
        }
        for child in obj.children().iter().rev() {
            child.release(me);
        }
        obj.release(me)
    }

    fn annul(&self, handle: NativeHandle) {
        let obj = match self.resolve(handle) {
            Ok(obj) => obj,
            Err(fault) => {
                self.report(fault.status, &fault.message);
                return;
            }
        };
        if !obj.is_available_to(current()) {
            self.report(
                StatusCode::LOCK_ERROR,
                &format!(
                    "The {} ({:#x}) cannot be annulled: it is locked by another thread",
                    obj.class(),
                    handle.addr()
                ),
            );
            return;
        }
        self.handles.write().remove(&handle.addr());
        let remaining = obj.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(target: "astbridge::native", ?handle, remaining, "loopback handle annulled");
    }

    fn clone_handle(&self, handle: NativeHandle) -> NativeHandle {
        self.run(NativeHandle::NULL, || {
            let obj = self.owned(handle)?;
            obj.acquire(current(), false);
            for child in obj.children() {
                child.acquire(current(), false);
            }
            Ok(self.insert(obj))
        })
    }

    fn copy(&self, handle: NativeHandle) -> NativeHandle {
        self.run(NativeHandle::NULL, || {
            let obj = self.owned(handle)?;
            Ok(self.insert(obj.duplicate(current())))
        })
    }

    fn get_attr(&self, handle: NativeHandle, name: &str, ty: AttrType) -> Option<AttrValue> {
        self.run(None, || {
            let obj = self.owned(handle)?;
            let desc = self.describe(&obj, name)?;
            let raw = self.read_attr(&obj, &desc);
            convert(&desc, &raw, ty).map(Some)
        })
    }

    fn set_attr(&self, handle: NativeHandle, name: &str, value: &AttrValue) {
        self.run((), || {
            let obj = self.owned(handle)?;
            self.write_attr(&obj, name, &value.to_native_string())
        })
    }

    fn set(&self, handle: NativeHandle, settings: &str) {
        self.run((), || {
            let obj = self.owned(handle)?;
            for (name, value) in parse_settings(settings)? {
                self.write_attr(&obj, &name, &value)?;
            }
            Ok(())
        })
    }

    fn test_attr(&self, handle: NativeHandle, name: &str) -> bool {
        self.run(false, || {
            let obj = self.owned(handle)?;
            let desc = self.describe(&obj, name)?;
            if desc.read_only {
                return Ok(false);
            }
            let target = self.holder(&obj, &desc);
            let body = target.body.lock();
            Ok(match (&body.kind, desc.key.as_str()) {
                (Kind::ZoomMap { zoom, .. }, "Zoom") => *zoom != 1.0,
                _ => body.attrs.contains_key(&desc.key),
            })
        })
    }

    fn clear_attr(&self, handle: NativeHandle, name: &str) {
        self.run((), || {
            let obj = self.owned(handle)?;
            let desc = self.describe(&obj, name)?;
            if desc.read_only {
                return Err(Fault::new(
                    StatusCode::READ_ONLY,
                    format!("The {} attribute of a {} cannot be cleared", desc.key, obj.class()),
                ));
            }
            let target = self.holder(&obj, &desc);
            let mut body = target.body.lock();
            if let Kind::ZoomMap { zoom, .. } = &mut body.kind {
                if desc.key == "Zoom" {
                    *zoom = 1.0;
                    return Ok(());
                }
            }
            body.attrs.remove(&desc.key);
            Ok(())
        })
    }

    fn new_frame(&self, naxes: i32) -> NativeHandle {
        self.run(NativeHandle::NULL, || {
            if naxes < 1 {
                return Err(Fault::new(
                    StatusCode::BAD_VALUE,
                    format!("Invalid number of Frame axes ({})", naxes),
                ));
            }
            Ok(self.new_object(Body::new(Kind::Frame { naxes })))
        })
    }

    fn new_unit_map(&self, ncoord: i32) -> NativeHandle {
        self.run(NativeHandle::NULL, || {
            mapping::check_ncoord(ncoord)?;
            Ok(self.new_object(Body::new(Kind::UnitMap { ncoord })))
        })
    }

    fn new_zoom_map(&self, ncoord: i32, zoom: f64) -> NativeHandle {
        self.run(NativeHandle::NULL, || {
            mapping::check_ncoord(ncoord)?;
            if zoom == 0.0 || !zoom.is_finite() {
                return Err(Fault::new(
                    StatusCode::BAD_VALUE,
                    format!("Invalid ZoomMap zoom factor ({})", zoom),
                ));
            }
            Ok(self.new_object(Body::new(Kind::ZoomMap { ncoord, zoom })))
        })
    }

    fn new_channel(&self, source: Option<SourceFn>, sink: Option<SinkFn>) -> NativeHandle {
        self.run(NativeHandle::NULL, || {
            Ok(self.new_object(Body::new(Kind::Channel { source, sink })))
        })
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
        self.run((), || {
            mapping::register_intra(
                self,
                name,
                IntraClass {
                    tran,
                    nin,
                    nout,
                    flags,
                    purpose: purpose.to_string(),
                    author: author.to_string(),
                    contact: contact.to_string(),
                },
            )
        })
    }

    fn new_intra_map(&self, name: &str, nin: i32, nout: i32) -> NativeHandle {
        self.run(NativeHandle::NULL, || {
            let kind = mapping::intra_kind(self, name, nin, nout)?;
            Ok(self.new_object(Body::new(kind)))
        })
    }

    fn channel_read(&self, channel: NativeHandle) -> NativeHandle {
        self.run(NativeHandle::NULL, || channel::read(self, channel))
    }

    fn channel_write(&self, channel: NativeHandle, object: NativeHandle) -> i32 {
        self.run(0, || channel::write(self, channel, object))
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
        self.run((), || {
            mapping::tran_n(
                self,
                map,
                mapping::Layout {
                    npoint,
                    ncoord_in,
                    indim,
                    ncoord_out,
                    outdim,
                },
                input,
                forward,
                output,
            )
        })
    }

    fn simplify(&self, map: NativeHandle) -> NativeHandle {
        self.run(NativeHandle::NULL, || mapping::simplify(self, map))
    }

    fn invert(&self, map: NativeHandle) {
        self.run((), || mapping::invert(self, map))
    }

    fn new_plot(&self, frame: NativeHandle, graphbox: &[f32; 4], basebox: &[f64; 4]) -> NativeHandle {
        self.run(NativeHandle::NULL, || plot::new_plot(self, frame, graphbox, basebox))
    }

    fn get_frame(&self, frameset: NativeHandle, index: i32) -> NativeHandle {
        self.run(NativeHandle::NULL, || plot::get_frame(self, frameset, index))
    }

    fn install_grf(&self, grf: Option<GrfFns>) {
        *self.grf.write() = grf;
    }

    fn plot_border(&self, plot: NativeHandle) -> bool {
        self.run(false, || plot::border(self, plot))
    }

    fn plot_grid(&self, plot: NativeHandle) {
        self.run((), || plot::grid(self, plot))
    }

    fn plot_mark(&self, plot: NativeHandle, nmark: i32, ncoord: i32, indim: i32, input: &[f64], marktype: i32) {
        self.run((), || plot::mark(self, plot, nmark, ncoord, indim, input, marktype))
    }

    fn plot_text(&self, plot: NativeHandle, text: &str, pos: &[f64], up: &[f32; 2], just: &str) {
        self.run((), || plot::text(self, plot, text, pos, up, just))
    }

    fn plot_bounding_box(&self, plot: NativeHandle) -> ([f32; 2], [f32; 2]) {
        self.run(([0.0; 2], [0.0; 2]), || plot::bounding_box(self, plot))
    }
}

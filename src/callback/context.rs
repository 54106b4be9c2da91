//! CallbackContext - thread-local frames of armed callback targets
//!
//! Every guarded call pushes one frame (Idle -> Armed) and pops it when the
//! native call returns (Armed -> Idle), on unwind too. Trampolines only
//! ever look at the innermost frame, so a callback cannot reach a target
//! armed by an earlier, later or enclosing call.

use super::{Grf, Sink, Source};
use crate::error::CallbackError;
use crate::guard::{self, state::CallbackScope, Bridge};
use crate::logging;
use crate::native::StatusCode;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ffi::{c_char, CString};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static NEXT_CALL: Cell<u64> = const { Cell::new(0) };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Source,
    Sink,
    Transform,
    Grf,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotKind::Source => "source",
            SlotKind::Sink => "sink",
            SlotKind::Transform => "transform",
            SlotKind::Grf => "grf",
        })
    }
}

/// Targets a guarded call arms for its callbacks
///
/// The borrows last for the whole guarded call; trampolines reach them
/// through the thread-local frame.
#[derive(Default)]
pub struct CallbackSlots<'a> {
    source: Option<&'a mut dyn Source>,
    sink: Option<&'a mut dyn Sink>,
    grf: Option<&'a mut dyn Grf>,
}

impl<'a> CallbackSlots<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: &'a mut dyn Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: &'a mut dyn Sink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn grf(mut self, grf: &'a mut dyn Grf) -> Self {
        self.grf = Some(grf);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.sink.is_none() && self.grf.is_none()
    }
}

/// What a callback left behind for the guard
pub(crate) enum Failure {
    Error(CallbackError),
    Panic(Box<dyn Any + Send + 'static>),
}

pub(crate) struct FrameOutcome {
    pub(crate) failure: Option<Failure>,
    pub(crate) fatal: Option<String>,
}

struct Frame {
    call_id: u64,
    bridge: Bridge,
    source: Option<*mut dyn Source>,
    sink: Option<*mut dyn Sink>,
    grf: Option<*mut dyn Grf>,
    /// Last line handed to the library; valid until the next source call
    line: Option<CString>,
    failure: Option<Failure>,
    fatal: Option<String>,
}

// The transmutes below only widen the trait-object lifetime bound. The
// pointers are dereferenced by trampolines while the owning guarded call,
// which holds the original borrows for `'a`, is still on the stack.
fn erase_source<'a>(source: &'a mut (dyn Source + 'a)) -> *mut dyn Source {
    let ptr: *mut (dyn Source + 'a) = source;
    unsafe { std::mem::transmute::<*mut (dyn Source + 'a), *mut (dyn Source + 'static)>(ptr) }
}

fn erase_sink<'a>(sink: &'a mut (dyn Sink + 'a)) -> *mut dyn Sink {
    let ptr: *mut (dyn Sink + 'a) = sink;
    unsafe { std::mem::transmute::<*mut (dyn Sink + 'a), *mut (dyn Sink + 'static)>(ptr) }
}

fn erase_grf<'a>(grf: &'a mut (dyn Grf + 'a)) -> *mut dyn Grf {
    let ptr: *mut (dyn Grf + 'a) = grf;
    unsafe { std::mem::transmute::<*mut (dyn Grf + 'a), *mut (dyn Grf + 'static)>(ptr) }
}

/// Frame pushed for one guarded call; popped by `finish` or on drop
pub(crate) struct ArmedFrame<'a> {
    call_id: u64,
    done: bool,
    _slots: PhantomData<&'a mut ()>,
}

/// Idle -> Armed
pub(crate) fn arm<'a>(bridge: &Bridge, slots: CallbackSlots<'a>) -> ArmedFrame<'a> {
    let call_id = NEXT_CALL.with(|next| {
        let id = next.get() + 1;
        next.set(id);
        id
    });
    let frame = Frame {
        call_id,
        bridge: bridge.clone(),
        source: slots.source.map(erase_source),
        sink: slots.sink.map(erase_sink),
        grf: slots.grf.map(erase_grf),
        line: None,
        failure: None,
        fatal: None,
    };
    FRAMES.with(|frames| frames.borrow_mut().push(frame));
    ArmedFrame {
        call_id,
        done: false,
        _slots: PhantomData,
    }
}

fn pop(call_id: u64) -> Option<Frame> {
    FRAMES
        .try_with(|frames| {
            let mut frames = frames.borrow_mut();
            let at = frames.iter().rposition(|frame| frame.call_id == call_id)?;
            Some(frames.remove(at))
        })
        .ok()
        .flatten()
}

impl ArmedFrame<'_> {
    /// Armed -> Idle, handing over what the callbacks recorded
    pub(crate) fn finish(mut self) -> FrameOutcome {
        self.done = true;
        match pop(self.call_id) {
            Some(frame) => FrameOutcome {
                failure: frame.failure,
                fatal: frame.fatal,
            },
            None => FrameOutcome {
                failure: None,
                fatal: Some(format!("callback frame {} vanished", self.call_id)),
            },
        }
    }
}

impl Drop for ArmedFrame<'_> {
    fn drop(&mut self) {
        if !self.done {
            drop(pop(self.call_id));
        }
    }
}

/// Number of armed frames on this thread
pub(crate) fn depth() -> usize {
    FRAMES.try_with(|frames| frames.borrow().len()).unwrap_or(0)
}

/// A resolved callback target
pub(crate) struct Call<P> {
    pub(crate) call_id: u64,
    pub(crate) bridge: Bridge,
    pub(crate) target: P,
}

enum Lookup<P> {
    Found(Call<P>),
    NoSlot(Bridge, u64),
    NoFrame,
}

fn lookup<P>(pick: impl FnOnce(&Frame) -> Option<P>) -> Lookup<P> {
    FRAMES.with(|frames| {
        let frames = frames.borrow();
        match frames.last() {
            None => Lookup::NoFrame,
            Some(frame) => match pick(frame) {
                Some(target) => Lookup::Found(Call {
                    call_id: frame.call_id,
                    bridge: frame.bridge.clone(),
                    target,
                }),
                None => Lookup::NoSlot(frame.bridge.clone(), frame.call_id),
            },
        }
    })
}

/// Innermost frame's target, or a recorded fatal violation
fn resolve<P>(kind: SlotKind, pick: impl FnOnce(&Frame) -> Option<P>) -> Option<Call<P>> {
    match lookup(pick) {
        Lookup::Found(call) => Some(call),
        Lookup::NoSlot(bridge, call_id) => {
            let message = format!("{} callback fired but the active call armed no {} target", kind, kind);
            logging::log_fatal("trampoline", &message);
            FRAMES.with(|frames| {
                let mut frames = frames.borrow_mut();
                if let Some(frame) = frames.iter_mut().rev().find(|f| f.call_id == call_id) {
                    frame.fatal.get_or_insert(message.clone());
                }
            });
            guard::status::push(StatusCode::BRIDGE_FATAL, &message);
            bridge.api().set_status(StatusCode::BRIDGE_FATAL);
            None
        }
        Lookup::NoFrame => {
            let message = format!("{} callback fired outside any guarded call", kind);
            logging::log_fatal("trampoline", &message);
            guard::status::push(StatusCode::BRIDGE_FATAL, &message);
            if let Ok(bridge) = guard::global() {
                bridge.api().set_status(StatusCode::BRIDGE_FATAL);
            }
            None
        }
    }
}

pub(crate) fn resolve_source() -> Option<Call<*mut dyn Source>> {
    resolve(SlotKind::Source, |frame| frame.source)
}

pub(crate) fn resolve_sink() -> Option<Call<*mut dyn Sink>> {
    resolve(SlotKind::Sink, |frame| frame.sink)
}

pub(crate) fn resolve_grf() -> Option<Call<*mut dyn Grf>> {
    resolve(SlotKind::Grf, |frame| frame.grf)
}

/// Any active frame; object-scoped callbacks only need the bridge
pub(crate) fn resolve_bridge(kind: SlotKind) -> Option<Call<()>> {
    resolve(kind, |_| Some(()))
}

/// Keep `line` alive in the frame and return a pointer the library may read
pub(crate) fn keep_line(call_id: u64, line: CString) -> *const c_char {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        match frames.iter_mut().rev().find(|frame| frame.call_id == call_id) {
            Some(frame) => frame.line.insert(line).as_ptr(),
            None => std::ptr::null(),
        }
    })
}

fn record(call_id: u64, failure: Failure) {
    let _ = FRAMES.try_with(|frames| {
        let mut frames = frames.borrow_mut();
        if let Some(frame) = frames.iter_mut().rev().find(|frame| frame.call_id == call_id) {
            // First failure wins
            if frame.failure.is_none() {
                frame.failure = Some(failure);
            }
        }
    });
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a managed callback for `call`
///
/// Returns `None` when the callback failed: the failure is stored in the
/// frame and the library sees `CALLBACK_FAILED` in its status slot.
pub(crate) fn invoke<P, R>(
    call: &Call<P>,
    kind: SlotKind,
    callback: impl FnOnce() -> Result<R, CallbackError>,
) -> Option<R> {
    let counters = call.bridge.counters();
    counters.callbacks_fired.fetch_add(1, Ordering::Relaxed);

    let outcome = {
        let _scope = CallbackScope::enter();
        panic::catch_unwind(AssertUnwindSafe(callback))
    };
    let failure = match outcome {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(error)) => {
            logging::log_callback_failure(&kind.to_string(), &error.to_string());
            Failure::Error(error)
        }
        Err(payload) => {
            logging::log_callback_failure(&kind.to_string(), &panic_message(&*payload));
            Failure::Panic(payload)
        }
    };

    counters.callback_failures.fetch_add(1, Ordering::Relaxed);
    let api = call.bridge.api();
    if api.status().is_ok() {
        api.set_status(StatusCode::CALLBACK_FAILED);
    }
    record(call.call_id, failure);
    None
}

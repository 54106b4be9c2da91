//! Graphics callbacks used while a Plot draws

use super::context::{self, SlotKind};
use super::contract;
use crate::error::CallbackError;
use crate::native::grf_codes;
use crate::native::{GrfFns, BAD};
use std::ffi::{c_char, c_int, CStr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GrfAttr {
    Style,
    Width,
    Size,
    Font,
    Colour,
}

impl GrfAttr {
    pub fn from_code(code: c_int) -> Option<Self> {
        match code {
            grf_codes::STYLE => Some(Self::Style),
            grf_codes::WIDTH => Some(Self::Width),
            grf_codes::SIZE => Some(Self::Size),
            grf_codes::FONT => Some(Self::Font),
            grf_codes::COLOUR => Some(Self::Colour),
            _ => None,
        }
    }

    pub fn code(self) -> c_int {
        match self {
            Self::Style => grf_codes::STYLE,
            Self::Width => grf_codes::WIDTH,
            Self::Size => grf_codes::SIZE,
            Self::Font => grf_codes::FONT,
            Self::Colour => grf_codes::COLOUR,
        }
    }
}

/// Kind of primitive a graphics attribute applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    Text,
    Line,
    Mark,
}

impl Primitive {
    pub fn from_code(code: c_int) -> Option<Self> {
        match code {
            grf_codes::TEXT => Some(Self::Text),
            grf_codes::LINE => Some(Self::Line),
            grf_codes::MARK => Some(Self::Mark),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Escape sequences inside text strings
    Escapes,
    /// Vertical "M" justification of text
    MJust,
    /// Axis scales reported through `Grf::scales`
    Scales,
}

impl Capability {
    pub fn from_code(code: c_int) -> Option<Self> {
        match code {
            grf_codes::CAP_ESC => Some(Self::Escapes),
            grf_codes::CAP_MJUST => Some(Self::MJust),
            grf_codes::CAP_SCALES => Some(Self::Scales),
            _ => None,
        }
    }
}

/// Rendering target for Plot drawing
///
/// Coordinates are in graphics units; `(f32, f32)` pairs are `(x, y)`.
pub trait Grf {
    /// Set `attr` for primitives of kind `prim` when `value` is given;
    /// returns the previous value either way
    fn attr(&mut self, attr: GrfAttr, value: Option<f64>, prim: Primitive) -> Result<f64, CallbackError>;

    fn cap(&mut self, cap: Capability, value: i32) -> Result<i32, CallbackError>;

    fn flush(&mut self) -> Result<(), CallbackError>;

    fn line(&mut self, xs: &[f32], ys: &[f32]) -> Result<(), CallbackError>;

    fn mark(&mut self, xs: &[f32], ys: &[f32], marktype: i32) -> Result<(), CallbackError>;

    fn text(&mut self, text: &str, at: (f32, f32), just: &str, up: (f32, f32)) -> Result<(), CallbackError>;

    /// Character height as (vertical text, horizontal text)
    fn qch(&mut self) -> Result<(f32, f32), CallbackError>;

    /// Corners of the box `text` would occupy
    fn tx_ext(
        &mut self,
        text: &str,
        at: (f32, f32),
        just: &str,
        up: (f32, f32),
    ) -> Result<([f32; 4], [f32; 4]), CallbackError>;

    /// Graphics units per millimetre along each axis
    fn scales(&mut self) -> Result<(f32, f32), CallbackError>;
}

/// Run `draw` against the armed grf; `None` means it failed or was absent
fn with_grf<R>(draw: impl FnOnce(&mut dyn Grf) -> Result<R, CallbackError>) -> Option<R> {
    let call = context::resolve_grf()?;
    context::invoke(&call, SlotKind::Grf, || {
        let grf = unsafe { &mut *call.target };
        draw(grf)
    })
}

fn status(done: Option<()>) -> c_int {
    c_int::from(done.is_some())
}

unsafe fn string_arg(ptr: *const c_char, what: &str) -> Result<String, CallbackError> {
    if ptr.is_null() {
        return Err(contract(format!("graphics {} argument is null", what)));
    }
    Ok(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

unsafe fn points(n: c_int, x: *const f32, y: *const f32) -> (Vec<f32>, Vec<f32>) {
    let n = n.max(0) as usize;
    if n == 0 || x.is_null() || y.is_null() {
        return (Vec::new(), Vec::new());
    }
    (
        std::slice::from_raw_parts(x, n).to_vec(),
        std::slice::from_raw_parts(y, n).to_vec(),
    )
}

unsafe extern "C" fn attr_trampoline(attr: c_int, value: f64, old: *mut f64, prim: c_int) -> c_int {
    let done = with_grf(|grf| {
        let attr = GrfAttr::from_code(attr).ok_or_else(|| contract(format!("unknown graphics attribute {}", attr)))?;
        let prim = Primitive::from_code(prim).ok_or_else(|| contract(format!("unknown graphics primitive {}", prim)))?;
        let value = if value == BAD { None } else { Some(value) };
        grf.attr(attr, value, prim)
    });
    match done {
        Some(previous) => {
            if !old.is_null() {
                *old = previous;
            }
            1
        }
        None => 0,
    }
}

extern "C" fn cap_trampoline(cap: c_int, value: c_int) -> c_int {
    let Some(cap) = Capability::from_code(cap) else {
        return 0;
    };
    with_grf(|grf| grf.cap(cap, value)).unwrap_or(0)
}

extern "C" fn flush_trampoline() -> c_int {
    status(with_grf(|grf| grf.flush()))
}

unsafe extern "C" fn line_trampoline(n: c_int, x: *const f32, y: *const f32) -> c_int {
    let (xs, ys) = points(n, x, y);
    status(with_grf(|grf| grf.line(&xs, &ys)))
}

unsafe extern "C" fn mark_trampoline(n: c_int, x: *const f32, y: *const f32, marktype: c_int) -> c_int {
    let (xs, ys) = points(n, x, y);
    status(with_grf(|grf| grf.mark(&xs, &ys, marktype)))
}

unsafe extern "C" fn text_trampoline(
    text: *const c_char,
    x: f32,
    y: f32,
    just: *const c_char,
    upx: f32,
    upy: f32,
) -> c_int {
    let text = string_arg(text, "text");
    let just = string_arg(just, "justification");
    status(with_grf(|grf| grf.text(&text?, (x, y), &just?, (upx, upy))))
}

unsafe extern "C" fn qch_trampoline(chv: *mut f32, chh: *mut f32) -> c_int {
    match with_grf(|grf| grf.qch()) {
        Some((v, h)) => {
            if !chv.is_null() {
                *chv = v;
            }
            if !chh.is_null() {
                *chh = h;
            }
            1
        }
        None => 0,
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn txext_trampoline(
    text: *const c_char,
    x: f32,
    y: f32,
    just: *const c_char,
    upx: f32,
    upy: f32,
    xb: *mut f32,
    yb: *mut f32,
) -> c_int {
    let text = string_arg(text, "text");
    let just = string_arg(just, "justification");
    match with_grf(|grf| grf.tx_ext(&text?, (x, y), &just?, (upx, upy))) {
        Some((xs, ys)) => {
            if !xb.is_null() && !yb.is_null() {
                std::slice::from_raw_parts_mut(xb, 4).copy_from_slice(&xs);
                std::slice::from_raw_parts_mut(yb, 4).copy_from_slice(&ys);
            }
            1
        }
        None => 0,
    }
}

unsafe extern "C" fn scales_trampoline(alpha: *mut f32, beta: *mut f32) -> c_int {
    match with_grf(|grf| grf.scales()) {
        Some((a, b)) => {
            if !alpha.is_null() {
                *alpha = a;
            }
            if !beta.is_null() {
                *beta = b;
            }
            1
        }
        None => 0,
    }
}

/// Table installed into the library once per bridge
pub(crate) const TRAMPOLINES: GrfFns = GrfFns {
    attr: attr_trampoline,
    cap: cap_trampoline,
    flush: flush_trampoline,
    line: line_trampoline,
    mark: mark_trampoline,
    text: text_trampoline,
    qch: qch_trampoline,
    txext: txext_trampoline,
    scales: scales_trampoline,
};

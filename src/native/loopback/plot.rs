//! Plot work functions, drawn through the installed grf table

use super::object::{Body, Kind, NativeObject, PlotState};
use super::{current, Fallible, Fault, LoopbackLibrary};
use crate::native::grf_codes::{self, CAP_SCALES};
use crate::native::{GrfFns, NativeHandle, StatusCode, BAD};
use core::ffi::c_int;
use std::ffi::CString;
use std::sync::Arc;

type Extent = ([f32; 2], [f32; 2]);

/// Grid lines are drawn at these fractions of each axis
const GRID_FRACTIONS: [f32; 3] = [0.25, 0.5, 0.75];

pub(super) fn new_plot(
    lib: &LoopbackLibrary,
    frame: NativeHandle,
    graphbox: &[f32; 4],
    basebox: &[f64; 4],
) -> Fallible<NativeHandle> {
    let source = lib.owned(frame)?;
    {
        let body = source.body.lock();
        match body.kind {
            Kind::Frame { naxes: 2 } => {}
            Kind::Frame { naxes } => {
                return Err(Fault::new(
                    StatusCode::BAD_VALUE,
                    format!("A Plot needs a 2-dimensional Frame, not {}-dimensional", naxes),
                ))
            }
            ref other => {
                return Err(Fault::new(
                    StatusCode::BAD_CLASS,
                    format!("astPlot requires a Frame, but was given a {}", other.class()),
                ))
            }
        }
    }
    if graphbox[0] == graphbox[2] || graphbox[1] == graphbox[3] {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!("The plotting area {:?} has zero width or height", graphbox),
        ));
    }
    if basebox[0] == basebox[2] || basebox[1] == basebox[3] {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!("The base box {:?} has zero width or height", basebox),
        ));
    }

    let plot = PlotState {
        frame: source.duplicate(current()),
        graphbox: *graphbox,
        basebox: *basebox,
        bbox: None,
    };
    Ok(lib.create(Body::new(Kind::Plot(plot))))
}

pub(super) fn get_frame(lib: &LoopbackLibrary, frameset: NativeHandle, index: i32) -> Fallible<NativeHandle> {
    let obj = lib.owned(frameset)?;
    let frame = match &obj.body.lock().kind {
        Kind::Plot(plot) => plot.frame.clone(),
        other => {
            return Err(Fault::new(
                StatusCode::BAD_CLASS,
                format!("astGetFrame requires a Plot, but was given a {}", other.class()),
            ))
        }
    };
    if index != 1 {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!("Frame index {} is invalid: the Plot holds 1 Frame", index),
        ));
    }
    frame.acquire(current(), false);
    Ok(lib.insert(frame))
}

/// Snapshot of what a drawing operation needs, taken without holding locks
struct Canvas {
    obj: Arc<NativeObject>,
    graphbox: [f32; 4],
    basebox: [f64; 4],
    colour: Option<f64>,
    width: Option<f64>,
    style: Option<f64>,
    size: Option<f64>,
    font: Option<f64>,
}

impl Canvas {
    fn open(lib: &LoopbackLibrary, plot: NativeHandle) -> Fallible<Self> {
        let obj = lib.owned(plot)?;
        let body = obj.body.lock();
        let state = match &body.kind {
            Kind::Plot(state) => state,
            other => {
                return Err(Fault::new(
                    StatusCode::BAD_CLASS,
                    format!("A Plot is required, but was given a {}", other.class()),
                ))
            }
        };
        let set = |key: &str| body.attrs.get(key).and_then(|v| v.parse::<f64>().ok());
        let canvas = Canvas {
            obj: obj.clone(),
            graphbox: state.graphbox,
            basebox: state.basebox,
            colour: set("Colour"),
            width: set("Width"),
            style: set("Style"),
            size: set("Size"),
            font: set("Font"),
        };
        drop(body);
        Ok(canvas)
    }

    fn to_graphics(&self, x: f64, y: f64) -> (f32, f32) {
        let [gx1, gy1, gx2, gy2] = self.graphbox;
        let [bx1, by1, bx2, by2] = self.basebox;
        let gx = gx1 as f64 + (x - bx1) * (gx2 - gx1) as f64 / (bx2 - bx1);
        let gy = gy1 as f64 + (y - by1) * (gy2 - gy1) as f64 / (by2 - by1);
        (gx as f32, gy as f32)
    }

    fn line_style(&self) -> Vec<(c_int, f64)> {
        [
            (grf_codes::COLOUR, self.colour),
            (grf_codes::WIDTH, self.width),
            (grf_codes::STYLE, self.style),
        ]
        .into_iter()
        .filter_map(|(code, value)| value.map(|v| (code, v)))
        .collect()
    }

    fn mark_style(&self) -> Vec<(c_int, f64)> {
        [(grf_codes::COLOUR, self.colour), (grf_codes::SIZE, self.size)]
            .into_iter()
            .filter_map(|(code, value)| value.map(|v| (code, v)))
            .collect()
    }

    fn text_style(&self) -> Vec<(c_int, f64)> {
        [
            (grf_codes::COLOUR, self.colour),
            (grf_codes::FONT, self.font),
            (grf_codes::SIZE, self.size),
        ]
        .into_iter()
        .filter_map(|(code, value)| value.map(|v| (code, v)))
        .collect()
    }

    fn outline(&self) -> ([f32; 5], [f32; 5]) {
        let [x1, y1, x2, y2] = self.graphbox;
        ([x1, x2, x2, x1, x1], [y1, y1, y2, y2, y1])
    }

    fn record(&self, extent: Option<Extent>) {
        if let Kind::Plot(state) = &mut self.obj.body.lock().kind {
            state.bbox = extent;
        }
    }
}

/// Calls into the grf table, checking the status slot after each one
struct Painter<'a> {
    lib: &'a LoopbackLibrary,
    fns: GrfFns,
}

impl<'a> Painter<'a> {
    fn new(lib: &'a LoopbackLibrary) -> Fallible<Self> {
        let fns = lib.grf_fns().ok_or_else(|| {
            Fault::new(StatusCode::GRAPHICS_ERROR, "No graphics functions have been installed")
        })?;
        Ok(Self { lib, fns })
    }

    fn check(&self, ok: c_int, what: &str) -> Fallible<()> {
        self.lib.after_callback(what)?;
        if ok == 0 {
            return Err(Fault::new(
                StatusCode::GRAPHICS_ERROR,
                format!("{}: graphics function failed", what),
            ));
        }
        Ok(())
    }

    fn attr(&self, code: c_int, value: f64, prim: c_int) -> Fallible<f64> {
        let mut old = BAD;
        let ok = unsafe { (self.fns.attr)(code, value, &mut old, prim) };
        self.check(ok, "astGAttr")?;
        Ok(old)
    }

    /// Apply `style`, draw, then put the previous values back
    fn styled<T>(
        &self,
        style: &[(c_int, f64)],
        prim: c_int,
        draw: impl FnOnce(&Self) -> Fallible<T>,
    ) -> Fallible<T> {
        let mut saved = Vec::with_capacity(style.len());
        for &(code, value) in style {
            saved.push((code, self.attr(code, value, prim)?));
        }
        let drawn = draw(self)?;
        for (code, old) in saved.into_iter().rev() {
            self.attr(code, old, prim)?;
        }
        Ok(drawn)
    }

    fn line(&self, xs: &[f32], ys: &[f32]) -> Fallible<()> {
        let ok = unsafe { (self.fns.line)(xs.len() as c_int, xs.as_ptr(), ys.as_ptr()) };
        self.check(ok, "astGLine")
    }

    fn mark(&self, xs: &[f32], ys: &[f32], marktype: i32) -> Fallible<()> {
        let ok = unsafe { (self.fns.mark)(xs.len() as c_int, xs.as_ptr(), ys.as_ptr(), marktype) };
        self.check(ok, "astGMark")
    }

    fn text(&self, text: &CString, at: (f32, f32), just: &CString, up: [f32; 2]) -> Fallible<Extent> {
        let ok = unsafe {
            (self.fns.text)(text.as_ptr(), at.0, at.1, just.as_ptr(), up[0], up[1])
        };
        self.check(ok, "astGText")?;

        let mut xb = [0f32; 4];
        let mut yb = [0f32; 4];
        let ok = unsafe {
            (self.fns.txext)(
                text.as_ptr(),
                at.0,
                at.1,
                just.as_ptr(),
                up[0],
                up[1],
                xb.as_mut_ptr(),
                yb.as_mut_ptr(),
            )
        };
        self.check(ok, "astGTxExt")?;
        Ok(extent(&xb, &yb).unwrap_or(([at.0, at.1], [at.0, at.1])))
    }

    fn qch(&self) -> Fallible<(f32, f32)> {
        let (mut chv, mut chh) = (0f32, 0f32);
        let ok = unsafe { (self.fns.qch)(&mut chv, &mut chh) };
        self.check(ok, "astGQch")?;
        Ok((chv, chh))
    }

    /// Axis scales, or (1, 1) when the grf cannot report them
    fn scales(&self) -> Fallible<(f32, f32)> {
        let capable = (self.fns.cap)(CAP_SCALES, 1);
        self.lib.after_callback("astGCap")?;
        if capable == 0 {
            return Ok((1.0, 1.0));
        }
        let (mut alpha, mut beta) = (1f32, 1f32);
        let ok = unsafe { (self.fns.scales)(&mut alpha, &mut beta) };
        self.check(ok, "astGScales")?;
        Ok((alpha, beta))
    }

    fn flush(&self) -> Fallible<()> {
        let ok = (self.fns.flush)();
        self.check(ok, "astGFlush")
    }
}

fn extent(xs: &[f32], ys: &[f32]) -> Option<Extent> {
    if xs.is_empty() {
        return None;
    }
    let fold = |values: &[f32]| {
        values
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
    };
    let (xlo, xhi) = fold(xs);
    let (ylo, yhi) = fold(ys);
    Some(([xlo, ylo], [xhi, yhi]))
}

fn union(a: Option<Extent>, b: Extent) -> Extent {
    match a {
        None => b,
        Some((lo, hi)) => (
            [lo[0].min(b.0[0]), lo[1].min(b.0[1])],
            [hi[0].max(b.1[0]), hi[1].max(b.1[1])],
        ),
    }
}

fn c_text(text: &str) -> Fallible<CString> {
    CString::new(text).map_err(|_| {
        Fault::new(StatusCode::BAD_VALUE, "Plotted text may not contain NUL characters")
    })
}

fn check_just(just: &str) -> Fallible<CString> {
    let bytes = just.as_bytes();
    let valid = bytes.len() == 2 && b"TCBM".contains(&bytes[0]) && b"LCR".contains(&bytes[1]);
    if !valid {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!("Invalid text justification \"{}\"", just),
        ));
    }
    c_text(just)
}

pub(super) fn border(lib: &LoopbackLibrary, plot: NativeHandle) -> Fallible<bool> {
    let canvas = Canvas::open(lib, plot)?;
    let painter = Painter::new(lib)?;
    let (xs, ys) = canvas.outline();
    painter.styled(&canvas.line_style(), grf_codes::LINE, |p| p.line(&xs, &ys))?;
    canvas.record(extent(&xs, &ys));
    Ok(true)
}

pub(super) fn grid(lib: &LoopbackLibrary, plot: NativeHandle) -> Fallible<()> {
    let canvas = Canvas::open(lib, plot)?;
    let painter = Painter::new(lib)?;
    let [x1, y1, x2, y2] = canvas.graphbox;

    let (title, label1, label2) = {
        let frame = match &canvas.obj.body.lock().kind {
            Kind::Plot(state) => state.frame.clone(),
            _ => return Ok(()),
        };
        let body = frame.body.lock();
        let get = |key: &str| {
            body.attrs
                .get(key)
                .cloned()
                .unwrap_or_else(|| super::object::default_value(&body, key, 0))
        };
        (get("Title"), get("Label(1)"), get("Label(2)"))
    };

    let (xs, ys) = canvas.outline();
    painter.styled(&canvas.line_style(), grf_codes::LINE, |p| {
        p.line(&xs, &ys)?;
        for fraction in GRID_FRACTIONS {
            let x = x1 + (x2 - x1) * fraction;
            p.line(&[x, x], &[y1, y2])?;
            let y = y1 + (y2 - y1) * fraction;
            p.line(&[x1, x2], &[y, y])?;
        }
        Ok(())
    })?;
    let mut bbox = extent(&xs, &ys);

    let (chv, chh) = painter.qch()?;
    let (_, beta) = painter.scales()?;
    let upward = if beta < 0.0 { -1.0 } else { 1.0 };
    let below = if y1 <= y2 { y1 } else { y2 };
    let above = if y1 <= y2 { y2 } else { y1 };
    let xmid = 0.5 * (x1 + x2);
    let ymid = 0.5 * (y1 + y2);

    let texts = [
        (label1, (xmid, below - 1.5 * chv), "TC", [0.0, upward]),
        (label2, (x1.min(x2) - 1.5 * chh, ymid), "BC", [-1.0, 0.0]),
        (title, (xmid, above + chv), "BC", [0.0, upward]),
    ];
    let labels = painter.styled(&canvas.text_style(), grf_codes::TEXT, |p| {
        let mut drawn = Vec::with_capacity(texts.len());
        for (text, at, just, up) in &texts {
            drawn.push(p.text(&c_text(text)?, *at, &c_text(just)?, *up)?);
        }
        Ok(drawn)
    })?;
    for label in labels {
        bbox = Some(union(bbox, label));
    }
    painter.flush()?;
    canvas.record(bbox);
    Ok(())
}

pub(super) fn mark(
    lib: &LoopbackLibrary,
    plot: NativeHandle,
    nmark: i32,
    ncoord: i32,
    indim: i32,
    input: &[f64],
    marktype: i32,
) -> Fallible<()> {
    let canvas = Canvas::open(lib, plot)?;
    if ncoord != 2 {
        return Err(Fault::new(
            StatusCode::BAD_COORDS,
            format!("The Plot has 2 axes but {} coordinates were supplied", ncoord),
        ));
    }
    if nmark < 0 || indim < nmark || input.len() < (ncoord * indim) as usize {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!("Invalid marker array: {} markers, dimension {}", nmark, indim),
        ));
    }
    let indim = indim as usize;
    let (xs, ys): (Vec<f32>, Vec<f32>) = (0..nmark as usize)
        .map(|i| (input[i], input[indim + i]))
        .filter(|(x, y)| *x != BAD && *y != BAD && x.is_finite() && y.is_finite())
        .map(|(x, y)| canvas.to_graphics(x, y))
        .unzip();
    if xs.is_empty() {
        canvas.record(None);
        return Ok(());
    }

    let painter = Painter::new(lib)?;
    painter.styled(&canvas.mark_style(), grf_codes::MARK, |p| {
        p.mark(&xs, &ys, marktype)
    })?;
    canvas.record(extent(&xs, &ys));
    Ok(())
}

pub(super) fn text(
    lib: &LoopbackLibrary,
    plot: NativeHandle,
    text: &str,
    pos: &[f64],
    up: &[f32; 2],
    just: &str,
) -> Fallible<()> {
    let canvas = Canvas::open(lib, plot)?;
    if pos.len() < 2 {
        return Err(Fault::new(
            StatusCode::BAD_COORDS,
            format!("The Plot has 2 axes but {} coordinates were supplied", pos.len()),
        ));
    }
    let just = check_just(just)?;
    let content = c_text(text)?;
    if pos[0] == BAD || pos[1] == BAD {
        canvas.record(None);
        return Ok(());
    }
    let at = canvas.to_graphics(pos[0], pos[1]);

    let painter = Painter::new(lib)?;
    let drawn = painter.styled(&canvas.text_style(), grf_codes::TEXT, |p| {
        p.text(&content, at, &just, *up)
    })?;
    canvas.record(Some(drawn));
    Ok(())
}

pub(super) fn bounding_box(lib: &LoopbackLibrary, plot: NativeHandle) -> Fallible<Extent> {
    let obj = lib.owned(plot)?;
    let body = obj.body.lock();
    match &body.kind {
        Kind::Plot(state) => Ok(state.bbox.unwrap_or(([0.0; 2], [0.0; 2]))),
        other => Err(Fault::new(
            StatusCode::BAD_CLASS,
            format!("astBoundingBox requires a Plot, but was given a {}", other.class()),
        )),
    }
}

//! Coordinate transformation work functions

use super::object::{Body, Kind};
use super::{current, Fallible, Fault, IntraClass, LoopbackLibrary};
use crate::native::intra_flags::{NO_FORWARD, NO_INVERSE};
use crate::native::{NativeHandle, StatusCode, BAD};
use core::ffi::c_int;

/// Array geometry of one tranN call
pub(super) struct Layout {
    pub(super) npoint: i32,
    pub(super) ncoord_in: i32,
    pub(super) indim: i32,
    pub(super) ncoord_out: i32,
    pub(super) outdim: i32,
}

enum Plan {
    Unit,
    Zoom(f64),
    Intra(String),
}

pub(super) fn check_ncoord(ncoord: i32) -> Fallible<()> {
    if ncoord < 1 {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!("Invalid number of coordinates ({})", ncoord),
        ));
    }
    Ok(())
}

pub(super) fn register_intra(lib: &LoopbackLibrary, name: &str, class: IntraClass) -> Fallible<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!("Invalid IntraMap transformation name \"{}\"", name),
        ));
    }
    check_ncoord(class.nin)?;
    check_ncoord(class.nout)?;
    if let Some(existing) = lib.intra.get(name) {
        if existing.tran as usize != class.tran as usize {
            return Err(Fault::new(
                StatusCode::BAD_VALUE,
                format!(
                    "An IntraMap transformation function named \"{}\" is already registered",
                    name
                ),
            ));
        }
    }
    lib.intra.insert(name.to_string(), class);
    Ok(())
}

pub(super) fn intra_kind(lib: &LoopbackLibrary, name: &str, nin: i32, nout: i32) -> Fallible<Kind> {
    let class = lib.intra_class(name).ok_or_else(|| {
        Fault::new(
            StatusCode::BAD_VALUE,
            format!(
                "The IntraMap transformation function \"{}\" has not been registered",
                name
            ),
        )
    })?;
    if class.nin != nin || class.nout != nout {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!(
                "The transformation function \"{}\" maps {} to {} coordinates, not {} to {}",
                name, class.nin, class.nout, nin, nout
            ),
        ));
    }
    Ok(Kind::IntraMap {
        fname: name.to_string(),
        nin,
        nout,
    })
}

fn not_a_mapping(class: &str, what: &str) -> Fault {
    Fault::new(
        StatusCode::BAD_CLASS,
        format!("{} requires a Mapping, but was given a {}", what, class),
    )
}

pub(super) fn tran_n(
    lib: &LoopbackLibrary,
    map: NativeHandle,
    layout: Layout,
    input: &[f64],
    forward: bool,
    output: &mut [f64],
) -> Fallible<()> {
    let obj = lib.owned(map)?;
    let (plan, shape, inverted) = {
        let body = obj.body.lock();
        let plan = match &body.kind {
            Kind::UnitMap { .. } => Plan::Unit,
            Kind::ZoomMap { zoom, .. } => Plan::Zoom(*zoom),
            Kind::IntraMap { fname, .. } => Plan::Intra(fname.clone()),
            other => return Err(not_a_mapping(other.class(), "astTranN")),
        };
        let shape = body.mapping_shape().unwrap_or((0, 0));
        (plan, shape, body.inverted())
    };

    let Layout {
        npoint,
        ncoord_in,
        indim,
        ncoord_out,
        outdim,
    } = layout;
    let (want_in, want_out) = if forward { shape } else { (shape.1, shape.0) };
    if ncoord_in != want_in {
        return Err(Fault::new(
            StatusCode::BAD_COORDS,
            format!(
                "The number of input coordinates ({}) does not match the number required ({})",
                ncoord_in, want_in
            ),
        ));
    }
    if ncoord_out != want_out {
        return Err(Fault::new(
            StatusCode::BAD_COORDS,
            format!(
                "The number of output coordinates ({}) does not match the number produced ({})",
                ncoord_out, want_out
            ),
        ));
    }
    if npoint < 0 || indim < npoint || outdim < npoint {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            format!(
                "Invalid array dimensions (indim {}, outdim {}) for {} points",
                indim, outdim, npoint
            ),
        ));
    }
    let (npoint, indim, outdim) = (npoint as usize, indim as usize, outdim as usize);
    if input.len() < ncoord_in as usize * indim || output.len() < ncoord_out as usize * outdim {
        return Err(Fault::new(
            StatusCode::BAD_VALUE,
            "Coordinate arrays are smaller than their stated dimensions",
        ));
    }

    let direct = forward != inverted;
    match plan {
        Plan::Unit => {
            for coord in 0..ncoord_in as usize {
                output[coord * outdim..coord * outdim + npoint]
                    .copy_from_slice(&input[coord * indim..coord * indim + npoint]);
            }
        }
        Plan::Zoom(zoom) => {
            for coord in 0..ncoord_in as usize {
                for point in 0..npoint {
                    let value = input[coord * indim + point];
                    output[coord * outdim + point] = if value == BAD {
                        BAD
                    } else if direct {
                        value * zoom
                    } else {
                        value / zoom
                    };
                }
            }
        }
        Plan::Intra(fname) => {
            let class = lib.intra_class(&fname).ok_or_else(|| {
                Fault::new(
                    StatusCode::NO_TRANSFORM,
                    format!("The transformation function \"{}\" is not registered", fname),
                )
            })?;
            let blocked = if direct { NO_FORWARD } else { NO_INVERSE };
            if class.flags & blocked != 0 {
                return Err(Fault::new(
                    StatusCode::NO_TRANSFORM,
                    format!(
                        "The {} transformation of IntraMap \"{}\" is not defined",
                        if direct { "forward" } else { "inverse" },
                        fname
                    ),
                ));
            }

            let in_rows: Vec<*const f64> = (0..ncoord_in as usize)
                .map(|coord| input[coord * indim..].as_ptr())
                .collect();
            let base = output.as_mut_ptr();
            // Rows lie within `output`, checked above
            let out_rows: Vec<*mut f64> = (0..ncoord_out as usize)
                .map(|coord| unsafe { base.add(coord * outdim) })
                .collect();
            unsafe {
                (class.tran)(
                    map,
                    npoint as c_int,
                    ncoord_in,
                    in_rows.as_ptr(),
                    direct as c_int,
                    ncoord_out,
                    out_rows.as_ptr(),
                );
            }
            lib.after_callback("astTranN")?;
        }
    }
    Ok(())
}

pub(super) fn simplify(lib: &LoopbackLibrary, map: NativeHandle) -> Fallible<NativeHandle> {
    let obj = lib.owned(map)?;
    let rebuilt = {
        let body = obj.body.lock();
        let kind = match &body.kind {
            Kind::ZoomMap { ncoord, zoom } if *zoom == 1.0 => Some(Kind::UnitMap { ncoord: *ncoord }),
            Kind::ZoomMap { ncoord, zoom } if body.inverted() => Some(Kind::ZoomMap {
                ncoord: *ncoord,
                zoom: 1.0 / *zoom,
            }),
            Kind::UnitMap { ncoord } => Some(Kind::UnitMap { ncoord: *ncoord }),
            Kind::ZoomMap { .. } | Kind::IntraMap { .. } => None,
            other => return Err(not_a_mapping(other.class(), "astSimplify")),
        };
        kind.map(|kind| {
            let mut attrs = body.attrs.clone();
            attrs.remove("Invert");
            if matches!(kind, Kind::UnitMap { .. }) {
                attrs.retain(|key, _| key == "ID" || key == "Ident");
            }
            Body { kind, attrs }
        })
    };
    Ok(match rebuilt {
        Some(body) => lib.create(body),
        None => lib.insert(obj.duplicate(current())),
    })
}

pub(super) fn invert(lib: &LoopbackLibrary, map: NativeHandle) -> Fallible<()> {
    let obj = lib.owned(map)?;
    let mut body = obj.body.lock();
    if !body.kind.is_mapping() {
        return Err(not_a_mapping(body.kind.class(), "astInvert"));
    }
    let flipped = if body.inverted() { "0" } else { "1" };
    body.attrs.insert("Invert".to_string(), flipped.to_string());
    Ok(())
}

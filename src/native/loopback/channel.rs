//! Channel work functions: text serialization through source/sink callbacks
//!
//! Objects are written as a block of lines:
//!
//! ```text
//! Begin ZoomMap   # Zoom about the origin
//!    Nin = 2
//!    Zoom = 4
//!    Ident = "scale"
//! End ZoomMap
//! ```

use super::object::{self, Body, Kind, NativeObject, ValueKind};
use super::{Fallible, Fault, LoopbackLibrary};
use crate::native::{NativeHandle, StatusCode};
use std::ffi::{CStr, CString};
use std::sync::Arc;

fn description(kind: &Kind) -> &'static str {
    match kind {
        Kind::Frame { .. } => "Coordinate system description",
        Kind::UnitMap { .. } => "Unit (null) Mapping",
        Kind::ZoomMap { .. } => "Zoom about the origin",
        Kind::IntraMap { .. } => "Map with user-defined transformation",
        Kind::Channel { .. } => "I/O channel",
        Kind::Plot(_) => "Plotting surface",
    }
}

pub(super) fn write(lib: &LoopbackLibrary, channel: NativeHandle, object: NativeHandle) -> Fallible<i32> {
    let chan = lib.owned(channel)?;
    let (sink, comment) = {
        let body = chan.body.lock();
        let sink = match &body.kind {
            Kind::Channel { sink, .. } => *sink,
            other => return Err(not_a_channel(other.class(), "astWrite")),
        };
        let comment = body.attrs.get("Comment").map(|v| v != "0").unwrap_or(true);
        (sink, comment)
    };
    let sink = sink.ok_or_else(|| {
        Fault::new(StatusCode::WRITE_ERROR, "astWrite: the Channel has no sink function")
    })?;

    let obj = lib.owned(object)?;
    for line in serialize(&obj, comment)? {
        let text = CString::new(line).map_err(|_| {
            Fault::new(
                StatusCode::WRITE_ERROR,
                "astWrite: attribute values may not contain NUL characters",
            )
        })?;
        sink(text.as_ptr());
        lib.after_callback("astWrite")?;
    }
    Ok(1)
}

fn serialize(obj: &Arc<NativeObject>, comment: bool) -> Fallible<Vec<String>> {
    let body = obj.body.lock();
    let class = body.kind.class();
    let fields = object::structural_fields(&body.kind).ok_or_else(|| {
        Fault::new(
            StatusCode::WRITE_ERROR,
            format!("astWrite: objects of class {} cannot be written", class),
        )
    })?;

    let mut lines = Vec::with_capacity(fields.len() + body.attrs.len() + 2);
    if comment {
        lines.push(format!("Begin {}   # {}", class, description(&body.kind)));
    } else {
        lines.push(format!("Begin {}", class));
    }
    for (key, value) in fields {
        lines.push(format!("   {} = {}", key, value));
    }
    for (key, value) in &body.attrs {
        let text = match object::describe(&body.kind, body.naxes(), key) {
            Some(desc) if desc.kind != ValueKind::Text => value.clone(),
            _ => object::quote(value),
        };
        lines.push(format!("   {} = {}", key, text));
    }
    lines.push(format!("End {}", class));
    Ok(lines)
}

pub(super) fn read(lib: &LoopbackLibrary, channel: NativeHandle) -> Fallible<NativeHandle> {
    let chan = lib.owned(channel)?;
    let source = match &chan.body.lock().kind {
        Kind::Channel { source, .. } => *source,
        other => return Err(not_a_channel(other.class(), "astRead")),
    };
    let source = source.ok_or_else(|| {
        Fault::new(StatusCode::READ_ERROR, "astRead: the Channel has no source function")
    })?;

    let mut class: Option<String> = None;
    let mut fields: Vec<(String, String)> = Vec::new();
    loop {
        let ptr = source();
        lib.after_callback("astRead")?;
        if ptr.is_null() {
            return match class {
                None => Ok(NativeHandle::NULL),
                Some(class) => Err(Fault::new(
                    StatusCode::READ_ERROR,
                    format!("astRead: end of input reached before \"End {}\"", class),
                )),
            };
        }
        // Copied at once: the pointer is only valid until the next call
        let raw = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        let line = strip_comment(&raw).trim();
        if line.is_empty() {
            continue;
        }

        if class.is_none() {
            let name = line
                .strip_prefix("Begin ")
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    Fault::new(
                        StatusCode::READ_ERROR,
                        format!("astRead: expected \"Begin <class>\" but read \"{}\"", line),
                    )
                })?;
            class = Some(name.to_string());
            continue;
        }

        let name = class.as_deref().unwrap_or_default();
        if let Some(end) = line.strip_prefix("End") {
            if end.trim().eq_ignore_ascii_case(name) {
                let body = build(lib, name, fields)?;
                return Ok(lib.create(body));
            }
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            Fault::new(
                StatusCode::READ_ERROR,
                format!("astRead: unrecognised input line \"{}\"", line),
            )
        })?;
        fields.push((key.trim().to_string(), value.trim().to_string()));
    }
}

/// Drop a `#` comment that is not inside a quoted value
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (at, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '#' if !quoted => return &line[..at],
            _ => {}
        }
    }
    line
}

fn build(lib: &LoopbackLibrary, class: &str, mut fields: Vec<(String, String)>) -> Fallible<Body> {
    let mut take = |name: &str| -> Fallible<String> {
        let at = fields
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                Fault::new(
                    StatusCode::READ_ERROR,
                    format!("astRead: the {} is missing its {} value", class, name),
                )
            })?;
        Ok(object::unquote(&fields.remove(at).1))
    };
    let int = |value: String, name: &str| -> Fallible<i32> {
        value.parse().map_err(|_| {
            Fault::new(
                StatusCode::READ_ERROR,
                format!("astRead: invalid {} value \"{}\"", name, value),
            )
        })
    };

    let kind = match class {
        "Frame" => Kind::Frame {
            naxes: int(take("Naxes")?, "Naxes")?,
        },
        "UnitMap" => Kind::UnitMap {
            ncoord: int(take("Nin")?, "Nin")?,
        },
        "ZoomMap" => {
            let ncoord = int(take("Nin")?, "Nin")?;
            let zoom = take("Zoom")?;
            let zoom = zoom.parse::<f64>().map_err(|_| {
                Fault::new(
                    StatusCode::READ_ERROR,
                    format!("astRead: invalid Zoom value \"{}\"", zoom),
                )
            })?;
            Kind::ZoomMap { ncoord, zoom }
        }
        "IntraMap" => {
            let nin = int(take("Nin")?, "Nin")?;
            let nout = int(take("Nout")?, "Nout")?;
            let fname = take("Fname")?;
            super::mapping::intra_kind(lib, &fname, nin, nout)
                .map_err(|fault| Fault::new(StatusCode::READ_ERROR, fault.message))?
        }
        other => {
            return Err(Fault::new(
                StatusCode::READ_ERROR,
                format!("astRead: objects of class \"{}\" cannot be read", other),
            ))
        }
    };

    let mut body = Body::new(kind);
    for (key, value) in fields {
        let desc = object::describe(&body.kind, body.naxes(), &key)
            .filter(|desc| !desc.read_only)
            .ok_or_else(|| {
                Fault::new(
                    StatusCode::READ_ERROR,
                    format!("astRead: \"{}\" is not a valid {} attribute", key, class),
                )
            })?;
        let value = match desc.kind {
            ValueKind::Text => object::unquote(&value),
            _ => object::normalize(&desc, &value)?,
        };
        body.attrs.insert(desc.key, value);
    }
    Ok(body)
}

fn not_a_channel(class: &str, what: &str) -> Fault {
    Fault::new(
        StatusCode::BAD_CLASS,
        format!("{} requires a Channel, but was given a {}", what, class),
    )
}

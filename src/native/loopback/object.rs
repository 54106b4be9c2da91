//! Native object model: lock state, class payloads, attribute store

use super::Fault;
use crate::native::{SinkFn, SourceFn, StatusCode};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// One native object, shared by every handle that refers to it
pub(crate) struct NativeObject {
    pub(crate) id: u64,
    /// Number of live handles
    pub(crate) refcount: AtomicUsize,
    lock: Mutex<LockState>,
    released: Condvar,
    pub(crate) body: Mutex<Body>,
}

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl NativeObject {
    /// New object, locked by `owner`
    pub(crate) fn new(body: Body, owner: ThreadId) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            refcount: AtomicUsize::new(0),
            lock: Mutex::new(LockState {
                owner: Some(owner),
                depth: 1,
            }),
            released: Condvar::new(),
            body: Mutex::new(body),
        })
    }

    pub(crate) fn class(&self) -> &'static str {
        self.body.lock().kind.class()
    }

    /// Objects whose lock follows this one's
    pub(crate) fn children(&self) -> Vec<Arc<NativeObject>> {
        match &self.body.lock().kind {
            Kind::Plot(plot) => vec![plot.frame.clone()],
            _ => Vec::new(),
        }
    }

    pub(crate) fn is_locked_by(&self, me: ThreadId) -> bool {
        self.lock.lock().owner == Some(me)
    }

    /// True if unlocked or held by `me`
    pub(crate) fn is_available_to(&self, me: ThreadId) -> bool {
        let state = self.lock.lock();
        state.owner.is_none() || state.owner == Some(me)
    }

    pub(crate) fn acquire(&self, me: ThreadId, wait: bool) -> bool {
        let mut state = self.lock.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return true;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return true;
                }
                Some(_) if wait => self.released.wait(&mut state),
                Some(_) => return false,
            }
        }
    }

    pub(crate) fn release(&self, me: ThreadId) -> bool {
        let mut state = self.lock.lock();
        if state.owner != Some(me) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
        true
    }

    /// Deep copy, locked by `owner` together with its children
    pub(crate) fn duplicate(&self, owner: ThreadId) -> Arc<NativeObject> {
        let body = self.body.lock().duplicate(owner);
        NativeObject::new(body, owner)
    }
}

pub(crate) struct Body {
    pub(crate) kind: Kind,
    /// Explicitly set attributes, keyed by canonical name
    pub(crate) attrs: BTreeMap<String, String>,
}

impl Body {
    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
        }
    }

    pub(crate) fn duplicate(&self, owner: ThreadId) -> Body {
        let kind = match &self.kind {
            Kind::Frame { naxes } => Kind::Frame { naxes: *naxes },
            Kind::UnitMap { ncoord } => Kind::UnitMap { ncoord: *ncoord },
            Kind::ZoomMap { ncoord, zoom } => Kind::ZoomMap {
                ncoord: *ncoord,
                zoom: *zoom,
            },
            Kind::IntraMap { fname, nin, nout } => Kind::IntraMap {
                fname: fname.clone(),
                nin: *nin,
                nout: *nout,
            },
            Kind::Channel { source, sink } => Kind::Channel {
                source: *source,
                sink: *sink,
            },
            Kind::Plot(plot) => Kind::Plot(PlotState {
                frame: plot.frame.duplicate(owner),
                graphbox: plot.graphbox,
                basebox: plot.basebox,
                bbox: plot.bbox,
            }),
        };
        Body {
            kind,
            attrs: self.attrs.clone(),
        }
    }

    pub(crate) fn inverted(&self) -> bool {
        self.attrs.get("Invert").map(|v| v != "0").unwrap_or(false)
    }

    pub(crate) fn naxes(&self) -> i32 {
        match &self.kind {
            Kind::Frame { naxes } => *naxes,
            Kind::Plot(_) => 2,
            _ => 0,
        }
    }

    /// (Nin, Nout) as seen by a caller, after inversion
    pub(crate) fn mapping_shape(&self) -> Option<(i32, i32)> {
        let (nin, nout) = match &self.kind {
            Kind::UnitMap { ncoord } | Kind::ZoomMap { ncoord, .. } => (*ncoord, *ncoord),
            Kind::IntraMap { nin, nout, .. } => (*nin, *nout),
            _ => return None,
        };
        Some(if self.inverted() { (nout, nin) } else { (nin, nout) })
    }
}

pub(crate) enum Kind {
    Frame { naxes: i32 },
    UnitMap { ncoord: i32 },
    ZoomMap { ncoord: i32, zoom: f64 },
    IntraMap { fname: String, nin: i32, nout: i32 },
    Channel {
        source: Option<SourceFn>,
        sink: Option<SinkFn>,
    },
    Plot(PlotState),
}

impl Kind {
    pub(crate) fn class(&self) -> &'static str {
        match self {
            Kind::Frame { .. } => "Frame",
            Kind::UnitMap { .. } => "UnitMap",
            Kind::ZoomMap { .. } => "ZoomMap",
            Kind::IntraMap { .. } => "IntraMap",
            Kind::Channel { .. } => "Channel",
            Kind::Plot(_) => "Plot",
        }
    }

    pub(crate) fn is_mapping(&self) -> bool {
        matches!(
            self,
            Kind::UnitMap { .. } | Kind::ZoomMap { .. } | Kind::IntraMap { .. }
        )
    }
}

pub(crate) struct PlotState {
    pub(crate) frame: Arc<NativeObject>,
    /// Graphics-space box: x1, y1, x2, y2
    pub(crate) graphbox: [f32; 4],
    /// Base-frame box: x1, y1, x2, y2
    pub(crate) basebox: [f64; 4],
    /// Extent of the most recent drawing operation
    pub(crate) bbox: Option<([f32; 2], [f32; 2])>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ValueKind {
    Text,
    Int,
    Float,
}

/// Where an attribute lives
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Holder {
    Own,
    /// Stored on the frame held by a Plot
    Frame,
}

#[derive(Clone, Debug)]
pub(crate) struct AttrDesc {
    pub(crate) key: String,
    pub(crate) kind: ValueKind,
    pub(crate) read_only: bool,
    pub(crate) holder: Holder,
}

fn split_index(name: &str) -> Option<(String, Option<i32>)> {
    let name = name.trim();
    match name.find('(') {
        None => Some((name.to_ascii_lowercase(), None)),
        Some(open) => {
            let inner = name[open + 1..].strip_suffix(')')?;
            let index = inner.trim().parse::<i32>().ok()?;
            Some((name[..open].trim().to_ascii_lowercase(), Some(index)))
        }
    }
}

/// Resolve an attribute name against the class of `kind`
pub(crate) fn describe(kind: &Kind, naxes: i32, name: &str) -> Option<AttrDesc> {
    use ValueKind::*;

    let (base, index) = split_index(name)?;
    let own = |key: &str, kind, read_only| AttrDesc {
        key: key.to_string(),
        kind,
        read_only,
        holder: Holder::Own,
    };

    if index.is_none() {
        match base.as_str() {
            "class" => return Some(own("Class", Text, true)),
            "id" => return Some(own("ID", Text, false)),
            "ident" => return Some(own("Ident", Text, false)),
            "refcount" => return Some(own("RefCount", Int, true)),
            _ => {}
        }
    }

    let frame_like = matches!(kind, Kind::Frame { .. } | Kind::Plot(_));
    if frame_like {
        let holder = if matches!(kind, Kind::Plot(_)) {
            Holder::Frame
        } else {
            Holder::Own
        };
        let framed = |key: String, read_only| AttrDesc {
            key,
            kind: Text,
            read_only,
            holder,
        };
        match (base.as_str(), index) {
            ("title", None) => return Some(framed("Title".into(), false)),
            ("domain", None) => return Some(framed("Domain".into(), false)),
            ("naxes", None) => {
                return Some(AttrDesc {
                    kind: Int,
                    ..framed("Naxes".into(), true)
                })
            }
            ("label", Some(i)) if (1..=naxes).contains(&i) => {
                return Some(framed(format!("Label({})", i), false))
            }
            ("unit", Some(i)) if (1..=naxes).contains(&i) => {
                return Some(framed(format!("Unit({})", i), false))
            }
            _ => {}
        }
    }

    if index.is_some() {
        return None;
    }

    if kind.is_mapping() {
        match base.as_str() {
            "nin" => return Some(own("Nin", Int, true)),
            "nout" => return Some(own("Nout", Int, true)),
            "invert" => return Some(own("Invert", Int, false)),
            "tranforward" => return Some(own("TranForward", Int, true)),
            "traninverse" => return Some(own("TranInverse", Int, true)),
            "report" => return Some(own("Report", Int, false)),
            _ => {}
        }
    }

    match (kind, base.as_str()) {
        (Kind::ZoomMap { .. }, "zoom") => Some(own("Zoom", Float, false)),
        (Kind::IntraMap { .. }, "intraflag") => Some(own("IntraFlag", Text, false)),
        (Kind::Channel { .. }, "comment") => Some(own("Comment", Int, false)),
        (Kind::Channel { .. }, "full") => Some(own("Full", Int, false)),
        (Kind::Plot(_), "colour") | (Kind::Plot(_), "color") => Some(own("Colour", Int, false)),
        (Kind::Plot(_), "width") => Some(own("Width", Float, false)),
        (Kind::Plot(_), "style") => Some(own("Style", Int, false)),
        (Kind::Plot(_), "size") => Some(own("Size", Float, false)),
        (Kind::Plot(_), "font") => Some(own("Font", Int, false)),
        (Kind::Plot(_), "grid") => Some(own("Grid", Int, false)),
        (Kind::Plot(_), "border") => Some(own("Border", Int, false)),
        _ => None,
    }
}

/// Canonical textual form of a value for attribute `desc`
pub(crate) fn normalize(desc: &AttrDesc, value: &str) -> Result<String, Fault> {
    let trimmed = value.trim();
    match desc.kind {
        ValueKind::Text => Ok(value.to_string()),
        ValueKind::Int => trimmed
            .parse::<i64>()
            .map(|v| v.to_string())
            .or_else(|_| {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.fract() == 0.0 && v.is_finite())
                    .map(|v| (v as i64).to_string())
                    .ok_or(())
            })
            .map_err(|_| bad_value(desc, value, "an integer")),
        ValueKind::Float => trimmed
            .parse::<f64>()
            .map(|v| format!("{}", v))
            .map_err(|_| bad_value(desc, value, "a floating point number")),
    }
}

fn bad_value(desc: &AttrDesc, value: &str, wanted: &str) -> Fault {
    Fault::new(
        StatusCode::BAD_VALUE,
        format!(
            "Invalid value \"{}\" for attribute {}: expected {}",
            value, desc.key, wanted
        ),
    )
}

/// Value used when the attribute has not been set
pub(crate) fn default_value(body: &Body, key: &str, intra_flags: u32) -> String {
    use crate::native::intra_flags::{NO_FORWARD, NO_INVERSE};

    let shape = body.mapping_shape();
    let inverted = body.inverted();
    match key {
        "Class" => body.kind.class().to_string(),
        "Title" => format!("{}-d coordinate system", body.naxes()),
        "Naxes" => body.naxes().to_string(),
        "Nin" => shape.map(|s| s.0).unwrap_or(0).to_string(),
        "Nout" => shape.map(|s| s.1).unwrap_or(0).to_string(),
        "Invert" | "Report" | "Full" | "Grid" => "0".to_string(),
        "TranForward" | "TranInverse" => {
            let mut blocked = match key {
                "TranForward" => NO_FORWARD,
                _ => NO_INVERSE,
            };
            if inverted {
                blocked = if blocked == NO_FORWARD { NO_INVERSE } else { NO_FORWARD };
            }
            if intra_flags & blocked == 0 { "1" } else { "0" }.to_string()
        }
        "Zoom" => match body.kind {
            Kind::ZoomMap { zoom, .. } => format!("{}", zoom),
            _ => "1".to_string(),
        },
        "Comment" | "Colour" | "Style" | "Font" | "Border" => "1".to_string(),
        "Width" | "Size" => "1".to_string(),
        _ => match key.strip_prefix("Label(") {
            Some(rest) => format!("Axis {}", rest.trim_end_matches(')')),
            None => String::new(),
        },
    }
}

/// Class-specific fields written ahead of the attribute list
pub(crate) fn structural_fields(kind: &Kind) -> Option<Vec<(&'static str, String)>> {
    match kind {
        Kind::Frame { naxes } => Some(vec![("Naxes", naxes.to_string())]),
        Kind::UnitMap { ncoord } => Some(vec![("Nin", ncoord.to_string())]),
        Kind::ZoomMap { ncoord, zoom } => Some(vec![
            ("Nin", ncoord.to_string()),
            ("Zoom", format!("{}", zoom)),
        ]),
        Kind::IntraMap { fname, nin, nout } => Some(vec![
            ("Nin", nin.to_string()),
            ("Nout", nout.to_string()),
            ("Fname", quote(fname)),
        ]),
        Kind::Channel { .. } | Kind::Plot(_) => None,
    }
}

pub(crate) fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

pub(crate) fn unquote(value: &str) -> String {
    let value = value.trim();
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => value.to_string(),
    }
}

//! DisplayList - a `Grf` that records what a Plot draws
//!
//! Primitives are stored with the graphics state in force when they were
//! drawn, so a caller can replay them onto any real surface. Text metrics
//! assume a fixed-pitch font.

use crate::callback::{Capability, Grf, GrfAttr, Primitive};
use crate::error::CallbackError;


/// Character height at `Size` 1, in graphics units
pub const CHAR_HEIGHT: f32 = 12.0;

/// Advance of one character as a fraction of its height
const CHAR_ASPECT: f32 = 0.6;

/// Colour decoded from the packed ARGB attribute value
///
/// The packed form keeps opaque white as 0; every other value carries
/// its alpha in the top byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Colour {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Colour {
    pub const BLACK: Colour = Colour::rgb(0, 0, 0);
    pub const WHITE: Colour = Colour::rgb(0xff, 0xff, 0xff);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha: 0xff,
        }
    }

    pub fn decode(value: f64) -> Self {
        let packed = match value as i64 as u32 {
            0 => 0xffff_ffff,
            packed => packed,
        };
        let [alpha, red, green, blue] = packed.to_be_bytes();
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    pub fn encode(self) -> f64 {
        let packed = u32::from_be_bytes([self.alpha, self.red, self.green, self.blue]);
        if packed == 0xffff_ffff {
            0.0
        } else {
            f64::from(packed as i32)
        }
    }
}

/// Attribute values applied to one primitive
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GraphicsState {
    pub style: f64,
    /// Line width; never below 1
    pub width: f64,
    /// Multiple of the default character size
    pub size: f64,
    pub font: f64,
    /// Packed ARGB, see `Colour`
    pub colour: f64,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            style: 1.0,
            width: 1.0,
            size: 1.0,
            font: 0.0,
            colour: Colour::BLACK.encode(),
        }
    }
}

impl GraphicsState {
    pub fn colour(&self) -> Colour {
        Colour::decode(self.colour)
    }

    fn slot(&mut self, attr: GrfAttr) -> &mut f64 {
        match attr {
            GrfAttr::Style => &mut self.style,
            GrfAttr::Width => &mut self.width,
            GrfAttr::Size => &mut self.size,
            GrfAttr::Font => &mut self.font,
            GrfAttr::Colour => &mut self.colour,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DisplayItem {
    Line {
        xs: Vec<f32>,
        ys: Vec<f32>,
        state: GraphicsState,
    },
    Mark {
        xs: Vec<f32>,
        ys: Vec<f32>,
        marktype: i32,
        state: GraphicsState,
    },
    Text {
        text: String,
        at: (f32, f32),
        just: String,
        up: (f32, f32),
        state: GraphicsState,
    },
}

#[derive(Clone, Debug, Default)]
pub struct DisplayList {
    items: Vec<DisplayItem>,
    state: GraphicsState,
    flushes: usize,
}

impl DisplayList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[DisplayItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Current graphics state
    pub fn state(&self) -> &GraphicsState {
        &self.state
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn lines(&self) -> impl Iterator<Item = (&[f32], &[f32])> + '_ {
        self.items.iter().filter_map(|item| match item {
            DisplayItem::Line { xs, ys, .. } => Some((xs.as_slice(), ys.as_slice())),
            _ => None,
        })
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> + '_ {
        self.items.iter().filter_map(|item| match item {
            DisplayItem::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Forget recorded items; the graphics state is kept
    pub fn clear(&mut self) {
        self.items.clear();
        self.flushes = 0;
    }

    fn char_height(&self) -> f32 {
        CHAR_HEIGHT * self.state.size as f32
    }
}

fn same_length(xs: &[f32], ys: &[f32]) -> Result<(), CallbackError> {
    if xs.len() == ys.len() {
        Ok(())
    } else {
        Err(format!("{} x coordinates but {} y coordinates", xs.len(), ys.len()).into())
    }
}

/// Offset of the justification point from the box's lower left corner
fn justify(just: &str, width: f32, height: f32) -> Result<(f32, f32), CallbackError> {
    let mut chars = just.chars();
    let (vertical, horizontal) = match (chars.next(), chars.next(), chars.next()) {
        (Some(v), Some(h), None) => (v, h),
        _ => return Err(format!("invalid justification \"{}\"", just).into()),
    };
    let dy = match vertical {
        'B' | 'M' => 0.0,
        'C' => 0.5 * height,
        'T' => height,
        _ => return Err(format!("invalid vertical justification '{}'", vertical).into()),
    };
    let dx = match horizontal {
        'L' => 0.0,
        'C' => 0.5 * width,
        'R' => width,
        _ => return Err(format!("invalid horizontal justification '{}'", horizontal).into()),
    };
    Ok((dx, dy))
}

impl Grf for DisplayList {
    fn attr(&mut self, attr: GrfAttr, value: Option<f64>, _prim: Primitive) -> Result<f64, CallbackError> {
        let slot = self.state.slot(attr);
        let old = *slot;
        if let Some(value) = value {
            *slot = match attr {
                GrfAttr::Width => value.max(1.0),
                _ => value,
            };
        }
        Ok(old)
    }

    fn cap(&mut self, cap: Capability, _value: i32) -> Result<i32, CallbackError> {
        Ok(match cap {
            Capability::Escapes => 0,
            Capability::MJust | Capability::Scales => 1,
        })
    }

    fn flush(&mut self) -> Result<(), CallbackError> {
        self.flushes += 1;
        Ok(())
    }

    fn line(&mut self, xs: &[f32], ys: &[f32]) -> Result<(), CallbackError> {
        same_length(xs, ys)?;
        self.items.push(DisplayItem::Line {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            state: self.state,
        });
        Ok(())
    }

    fn mark(&mut self, xs: &[f32], ys: &[f32], marktype: i32) -> Result<(), CallbackError> {
        same_length(xs, ys)?;
        self.items.push(DisplayItem::Mark {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            marktype,
            state: self.state,
        });
        Ok(())
    }

    fn text(&mut self, text: &str, at: (f32, f32), just: &str, up: (f32, f32)) -> Result<(), CallbackError> {
        justify(just, 0.0, 0.0)?;
        self.items.push(DisplayItem::Text {
            text: text.to_string(),
            at,
            just: just.to_string(),
            up,
            state: self.state,
        });
        Ok(())
    }

    fn qch(&mut self) -> Result<(f32, f32), CallbackError> {
        let height = self.char_height();
        Ok((height, height))
    }

    fn tx_ext(
        &mut self,
        text: &str,
        at: (f32, f32),
        just: &str,
        up: (f32, f32),
    ) -> Result<([f32; 4], [f32; 4]), CallbackError> {
        let height = self.char_height();
        let width = CHAR_ASPECT * height * text.chars().count() as f32;
        let (dx, dy) = justify(just, width, height)?;

        let norm = (up.0 * up.0 + up.1 * up.1).sqrt();
        if norm == 0.0 {
            return Err("text up vector has zero length".into());
        }
        let (ux, uy) = (up.0 / norm, up.1 / norm);
        let (rx, ry) = (uy, -ux);

        let corners = [(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)];
        let mut xs = [0f32; 4];
        let mut ys = [0f32; 4];
        for (i, (cx, cy)) in corners.into_iter().enumerate() {
            let (lx, ly) = (cx - dx, cy - dy);
            xs[i] = at.0 + rx * lx + ux * ly;
            ys[i] = at.1 + ry * lx + uy * ly;
        }
        Ok((xs, ys))
    }

    fn scales(&mut self) -> Result<(f32, f32), CallbackError> {
        Ok((1.0, 1.0))
    }
}

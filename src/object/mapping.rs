//! Mappings: coordinate transformations, built-in and user-defined

use super::{AstObject, ObjectKind};
use crate::callback::{tran_trampoline, transform_flags, CallbackSlots, Registration, Transformer};
use crate::error::{BridgeError, Result};
use crate::guard::Bridge;
use crate::lock::LockSet;
use crate::native::{AttrType, AttrValue, NativeApi, NativeHandle};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug)]
pub struct Mapping {
    object: AstObject,
}

impl Mapping {
    fn create(
        bridge: &Bridge,
        op: &'static str,
        ctor: impl FnOnce(&dyn NativeApi) -> NativeHandle,
    ) -> Result<Self> {
        let handle = bridge
            .lifecycle()
            .create(op, &LockSet::new(), CallbackSlots::none(), ctor)?;
        Ok(Self {
            object: AstObject::from_box(bridge, handle),
        })
    }

    /// Identity transformation of `ncoord` coordinates
    pub fn unit(bridge: &Bridge, ncoord: i32) -> Result<Self> {
        Self::create(bridge, "astUnitMap", |api| api.new_unit_map(ncoord))
    }

    /// Multiplication of every coordinate by `zoom`
    pub fn zoom(bridge: &Bridge, ncoord: i32, zoom: f64) -> Result<Self> {
        Self::create(bridge, "astZoomMap", |api| api.new_zoom_map(ncoord, zoom))
    }

    pub fn nin(&self) -> Result<i32> {
        self.object.get_i("Nin")
    }

    pub fn nout(&self) -> Result<i32> {
        self.object.get_i("Nout")
    }

    pub fn is_inverted(&self) -> Result<bool> {
        Ok(self.object.get_i("Invert")? != 0)
    }

    pub fn invert(&self) -> Result<()> {
        self.object.call("astInvert", |api, handle| api.invert(handle))
    }

    /// Equivalent, possibly simpler, mapping
    pub fn simplify(&self) -> Result<AstObject> {
        let handle = self.object.handle()?;
        let simplified = self.object.bridge().lifecycle().create(
            "astSimplify",
            &LockSet::of([handle]),
            CallbackSlots::none(),
            |api| api.simplify(handle),
        )?;
        Ok(AstObject::from_box(self.object.bridge(), simplified))
    }

    /// Transform points of a 1-d mapping
    pub fn tran1(&self, xin: &[f64], forward: bool) -> Result<Vec<f64>> {
        let mut rows = self.tran_n(&[xin], forward)?;
        one_row(&mut rows)
    }

    /// Transform points of a 2-d mapping
    pub fn tran2(&self, xin: &[f64], yin: &[f64], forward: bool) -> Result<(Vec<f64>, Vec<f64>)> {
        let rows = self.tran_n(&[xin, yin], forward)?;
        let mut rows = rows.into_iter();
        match (rows.next(), rows.next()) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(BridgeError::invalid_argument(
                "tran2 needs a mapping with 2 output coordinates",
            )),
        }
    }

    /// Transform `input[coord][point]`, one row per input coordinate
    ///
    /// Rows longer than the first are truncated to its length.
    pub fn tran_n(&self, input: &[&[f64]], forward: bool) -> Result<Vec<Vec<f64>>> {
        if input.is_empty() {
            return Err(BridgeError::invalid_argument("tranN: illegal ncoord_in == 0"));
        }
        let npoint = input[0].len();
        for row in input {
            if row.len() < npoint {
                return Err(BridgeError::invalid_argument(format!(
                    "Supplied array has only {} elements (needs {})",
                    row.len(),
                    npoint
                )));
            }
        }
        let ncoord_in = input.len();
        let flat: Vec<f64> = input.iter().flat_map(|row| row[..npoint].iter().copied()).collect();

        let transformed = self.object.call("astTranN", |api, handle| {
            let out_name = if forward { "Nout" } else { "Nin" };
            let ncoord_out = match api.get_attr(handle, out_name, AttrType::I) {
                Some(AttrValue::I(n)) if n > 0 => n,
                _ => return None,
            };
            let ncoord_out = ncoord_out as usize;
            let mut output = vec![0.0; ncoord_out * npoint];
            api.tran_n(
                handle,
                npoint as i32,
                ncoord_in as i32,
                npoint as i32,
                &flat,
                forward,
                ncoord_out as i32,
                npoint as i32,
                &mut output,
            );
            Some((ncoord_out, output))
        })?;

        let (ncoord_out, output) = transformed
            .ok_or_else(|| BridgeError::invalid_argument("mapping reported no output coordinates"))?;
        if npoint == 0 {
            return Ok(vec![Vec::new(); ncoord_out]);
        }
        Ok(output.chunks(npoint).map(<[f64]>::to_vec).collect())
    }

    pub fn into_object(self) -> AstObject {
        self.object
    }
}

fn one_row(rows: &mut Vec<Vec<f64>>) -> Result<Vec<f64>> {
    if rows.len() > 1 {
        return Err(BridgeError::invalid_argument(format!(
            "tran1 needs a mapping with 1 output coordinate, not {}",
            rows.len()
        )));
    }
    Ok(rows.pop().unwrap_or_default())
}

impl Deref for Mapping {
    type Target = AstObject;

    fn deref(&self) -> &AstObject {
        &self.object
    }
}

impl TryFrom<AstObject> for Mapping {
    type Error = BridgeError;

    fn try_from(object: AstObject) -> Result<Self> {
        object.expect_class("Mapping", ObjectKind::is_mapping)?;
        Ok(Self { object })
    }
}

/// Mapping whose transformation is a Rust `Transformer`
///
/// The transformer stays registered while this wrapper, or another
/// wrapper of the same registration, is alive and not disposed.
#[derive(Debug)]
pub struct IntraMap {
    mapping: Mapping,
    registration: Mutex<Option<Arc<Registration>>>,
}

impl IntraMap {
    pub fn new(bridge: &Bridge, transformer: Arc<dyn Transformer>, nin: i32, nout: i32) -> Result<Self> {
        let registration = bridge.transforms().register(transformer);
        let transformer = registration.transformer().clone();
        let name = registration.native_name().to_string();
        let flag = AttrValue::C(registration.key().to_string());

        let mapping = Mapping::create(bridge, "astIntraMap", |api| {
            api.intra_reg(
                &name,
                nin,
                nout,
                tran_trampoline,
                transform_flags(&*transformer),
                transformer.purpose(),
                transformer.author(),
                transformer.contact(),
            );
            let handle = api.new_intra_map(&name, nin, nout);
            if !handle.is_null() {
                api.set_attr(handle, "IntraFlag", &flag);
            }
            handle
        })?;
        Ok(Self {
            mapping,
            registration: Mutex::new(Some(registration)),
        })
    }

    pub fn registration(&self) -> Option<Arc<Registration>> {
        self.registration.lock().clone()
    }

    /// Dispose the native object and drop this wrapper's registration
    pub fn dispose(&self) -> Result<bool> {
        let disposed = self.mapping.dispose();
        self.registration.lock().take();
        disposed
    }
}

impl Deref for IntraMap {
    type Target = Mapping;

    fn deref(&self) -> &Mapping {
        &self.mapping
    }
}

impl TryFrom<AstObject> for IntraMap {
    type Error = BridgeError;

    /// Reattaches the transformer registered under the object's `IntraFlag`
    fn try_from(object: AstObject) -> Result<Self> {
        object.expect_class("IntraMap", |kind| *kind == ObjectKind::IntraMap)?;
        let key = object.get_c("IntraFlag")?;
        let registration = object.bridge().transforms().lookup(&key);
        Ok(Self {
            mapping: Mapping { object },
            registration: Mutex::new(registration),
        })
    }
}

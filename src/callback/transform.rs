//! Object-scoped transformation callbacks for IntraMaps
//!
//! Each IntraMap gets a registry key, stored in the native object's
//! `IntraFlag` attribute. The one transform trampoline reads that
//! attribute from the mapping it is called for and dispatches to the
//! registered `Transformer`. Registrations live as long as some wrapper
//! holds their `Arc`; the last drop removes the key.

use super::context::{self, SlotKind};
use super::contract;
use crate::error::CallbackError;
use crate::native::intra_flags::{NO_FORWARD, NO_INVERSE, SIMP_FI, SIMP_IF};
use crate::native::{AttrType, AttrValue, NativeApi, NativeHandle};
use dashmap::DashMap;
use std::ffi::c_int;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// User-supplied coordinate transformation
pub trait Transformer: Send + Sync {
    /// Transform `npoint` points given as one row per input coordinate;
    /// must return `ncoord_out` rows of `npoint` values
    fn transform(
        &self,
        npoint: usize,
        input: &[&[f64]],
        forward: bool,
        ncoord_out: usize,
    ) -> Result<Vec<Vec<f64>>, CallbackError>;

    /// Base of the name the transformation is registered under
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn has_forward(&self) -> bool {
        true
    }

    fn has_inverse(&self) -> bool {
        true
    }

    /// Forward followed by inverse simplifies to a unit mapping
    fn simp_fi(&self) -> bool {
        false
    }

    /// Inverse followed by forward simplifies to a unit mapping
    fn simp_if(&self) -> bool {
        false
    }

    fn purpose(&self) -> &str {
        ""
    }

    fn author(&self) -> &str {
        ""
    }

    fn contact(&self) -> &str {
        ""
    }
}

/// Native registration flags describing `transformer`
pub(crate) fn flags(transformer: &dyn Transformer) -> u32 {
    let mut flags = 0;
    if !transformer.has_forward() {
        flags |= NO_FORWARD;
    }
    if !transformer.has_inverse() {
        flags |= NO_INVERSE;
    }
    if transformer.simp_fi() {
        flags |= SIMP_FI;
    }
    if transformer.simp_if() {
        flags |= SIMP_IF;
    }
    flags
}

/// Registered transformation names may only hold word characters
fn sanitize(name: &str) -> String {
    let base = name.split('<').next().unwrap_or(name);
    let base = base.rsplit("::").next().unwrap_or(base);
    let clean: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if clean.is_empty() {
        "transform".to_string()
    } else {
        clean
    }
}

type Entries = DashMap<String, Weak<Registration>>;

/// Process-wide table from `IntraFlag` key to transformer
pub struct TransformRegistry {
    entries: Arc<Entries>,
    next: AtomicU64,
}

/// One registered transformer; dropping the last `Arc` deregisters it
pub struct Registration {
    key: String,
    native_name: String,
    transformer: Arc<dyn Transformer>,
    entries: Weak<Entries>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next: AtomicU64::new(0),
        }
    }

    pub fn register(&self, transformer: Arc<dyn Transformer>) -> Arc<Registration> {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let key = format!("astbridge:{}", seq);
        let native_name = format!("{}_{}", sanitize(transformer.name()), seq);
        let registration = Arc::new(Registration {
            key: key.clone(),
            native_name,
            transformer,
            entries: Arc::downgrade(&self.entries),
        });
        self.entries.insert(key, Arc::downgrade(&registration));
        debug!(
            target: "astbridge::callback",
            key = %registration.key,
            native_name = %registration.native_name,
            "transformer registered"
        );
        registration
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<Registration>> {
        // The shard guard is released before upgrading: a concurrent final
        // drop removes the entry from this same map
        let weak = self.entries.get(key).map(|entry| entry.value().clone())?;
        weak.upgrade()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Registration {
    /// Value stored in the native object's `IntraFlag` attribute
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Name the transformation is registered under natively
    pub fn native_name(&self) -> &str {
        &self.native_name
    }

    pub fn transformer(&self) -> &Arc<dyn Transformer> {
        &self.transformer
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("native_name", &self.native_name)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.remove(&self.key);
            debug!(target: "astbridge::callback", key = %self.key, "transformer deregistered");
        }
    }
}

fn intra_flag(api: &dyn NativeApi, this: NativeHandle) -> Result<String, CallbackError> {
    match api.get_attr(this, "IntraFlag", AttrType::C) {
        Some(AttrValue::C(key)) => Ok(key),
        _ => Err(contract(format!(
            "could not read the IntraFlag of mapping {:?}",
            this
        ))),
    }
}

fn check_shape(rows: &[Vec<f64>], npoint: usize, ncoord_out: usize) -> Result<(), CallbackError> {
    if rows.len() != ncoord_out {
        return Err(contract(format!(
            "transformer returned {} output coordinates (needs {})",
            rows.len(),
            ncoord_out
        )));
    }
    if let Some(short) = rows.iter().find(|row| row.len() < npoint) {
        return Err(contract(format!(
            "transformer returned a row of {} points (needs {})",
            short.len(),
            npoint
        )));
    }
    Ok(())
}

/// Installed as the transformation function of every IntraMap
pub(crate) unsafe extern "C" fn tran_trampoline(
    this: NativeHandle,
    npoint: c_int,
    ncoord_in: c_int,
    ptr_in: *const *const f64,
    forward: c_int,
    ncoord_out: c_int,
    ptr_out: *const *mut f64,
) {
    let Some(call) = context::resolve_bridge(SlotKind::Transform) else {
        return;
    };
    let npoint = npoint.max(0) as usize;
    let ncoord_in = ncoord_in.max(0) as usize;
    let ncoord_out = ncoord_out.max(0) as usize;

    let output = context::invoke(&call, SlotKind::Transform, || {
        // Copied before the callback runs: the rows belong to the library
        let rows = input_rows(ptr_in, ncoord_in, npoint)?;
        let targets = output_rows(ptr_out, ncoord_out, npoint)?;
        let key = intra_flag(call.bridge.api(), this)?;
        let registration = call.bridge.transforms().lookup(&key).ok_or_else(|| {
            contract(format!("IntraMap transformation \"{}\" is no longer registered", key))
        })?;
        let input: Vec<&[f64]> = rows.iter().map(Vec::as_slice).collect();
        let result = registration
            .transformer()
            .transform(npoint, &input, forward != 0, ncoord_out)?;
        check_shape(&result, npoint, ncoord_out)?;
        Ok((targets, result))
    });

    if let Some((targets, result)) = output {
        for (target, row) in targets.into_iter().zip(&result) {
            std::slice::from_raw_parts_mut(target, npoint).copy_from_slice(&row[..npoint]);
        }
    }
}

unsafe fn input_rows(
    ptr_in: *const *const f64,
    ncoord: usize,
    npoint: usize,
) -> Result<Vec<Vec<f64>>, CallbackError> {
    if npoint == 0 {
        return Ok(vec![Vec::new(); ncoord]);
    }
    if ptr_in.is_null() {
        return Err(contract("transformation input array is null"));
    }
    (0..ncoord)
        .map(|coord| {
            let row = *ptr_in.add(coord);
            if row.is_null() {
                Err(contract(format!("transformation input row {} is null", coord)))
            } else {
                Ok(std::slice::from_raw_parts(row, npoint).to_vec())
            }
        })
        .collect()
}

/// Output row pointers; none when there are no points to write
unsafe fn output_rows(
    ptr_out: *const *mut f64,
    ncoord: usize,
    npoint: usize,
) -> Result<Vec<*mut f64>, CallbackError> {
    if npoint == 0 {
        return Ok(Vec::new());
    }
    if ptr_out.is_null() {
        return Err(contract("transformation output array is null"));
    }
    (0..ncoord)
        .map(|coord| {
            let row = *ptr_out.add(coord);
            if row.is_null() {
                Err(contract(format!("transformation output row {} is null", coord)))
            } else {
                Ok(row)
            }
        })
        .collect()
}

//! Native call surface - the contract the bridge consumes
//!
//! Design: the wrapped library is reached only through the `NativeApi`
//! trait, so the process-wide bridge state can be pointed at any
//! implementation of it:
//! 1. Ordinary entry points that report failure through a status slot
//! 2. Per-object lock/unlock primitives taking a "wait" flag
//! 3. Registration functions taking fixed-signature C callbacks
//!
//! None of the callback signatures carry a user-data parameter. The
//! bridge recovers its target from thread-local state or from the
//! native object's own attribute store (see `crate::callback`).

pub mod journal;
pub mod loopback;

pub use journal::{JournalingApi, NativeEvent};
pub use loopback::LoopbackLibrary;

use core::ffi::{c_char, c_int, c_void};
use core::fmt;

/// Opaque, pointer-sized reference to one native object
///
/// Ownership is tracked by `crate::handle::HandleBox`, never by this value.
/// The total order is address order, which is what the lock orderer sorts by.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeHandle(*mut c_void);

// Handles are plain addresses; the native library owns what they point to.
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(core::ptr::null_mut());

    #[inline]
    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn from_addr(addr: usize) -> Self {
        Self(addr as *mut c_void)
    }

    #[inline]
    pub fn as_raw(self) -> *mut c_void {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({:#x})", self.addr())
    }
}

/// Native status code, as held in the library's error-status slot
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StatusCode(pub c_int);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);
    /// Generic failure outside the library proper
    pub const ERROR: StatusCode = StatusCode(148_013_866);
    pub const BAD_ATTRIBUTE: StatusCode = StatusCode(233_933_314);
    pub const BAD_VALUE: StatusCode = StatusCode(233_933_330);
    pub const READ_ONLY: StatusCode = StatusCode(233_933_338);
    pub const INVALID_OBJECT: StatusCode = StatusCode(233_933_346);
    pub const LOCK_ERROR: StatusCode = StatusCode(233_933_354);
    pub const BAD_COORDS: StatusCode = StatusCode(233_933_362);
    pub const READ_ERROR: StatusCode = StatusCode(233_933_370);
    pub const WRITE_ERROR: StatusCode = StatusCode(233_933_378);
    pub const NO_TRANSFORM: StatusCode = StatusCode(233_933_386);
    pub const TRANSFORM_ERROR: StatusCode = StatusCode(233_933_394);
    pub const GRAPHICS_ERROR: StatusCode = StatusCode(233_933_402);
    pub const BAD_CLASS: StatusCode = StatusCode(233_933_410);
    /// Set by a trampoline when the managed callback failed
    pub const CALLBACK_FAILED: StatusCode = StatusCode(233_933_418);
    /// Set by a trampoline that could not determine its target
    pub const BRIDGE_FATAL: StatusCode = StatusCode(233_933_426);

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Symbolic name of the status, `AST__XXX` style
    pub fn name(self) -> &'static str {
        match self {
            Self::OK => "SAI__OK",
            Self::ERROR => "SAI__ERROR",
            Self::BAD_ATTRIBUTE => "AST__BADAT",
            Self::BAD_VALUE => "AST__ATTIN",
            Self::READ_ONLY => "AST__NOWRT",
            Self::INVALID_OBJECT => "AST__OBJIN",
            Self::LOCK_ERROR => "AST__LCKERR",
            Self::BAD_COORDS => "AST__NCPIN",
            Self::READ_ERROR => "AST__RDERR",
            Self::WRITE_ERROR => "AST__WRERR",
            Self::NO_TRANSFORM => "AST__TRNND",
            Self::TRANSFORM_ERROR => "AST__ITFER",
            Self::GRAPHICS_ERROR => "AST__GRFER",
            Self::BAD_CLASS => "AST__BADCL",
            Self::CALLBACK_FAILED => "AST__CBFAIL",
            Self::BRIDGE_FATAL => "AST__BRFATL",
            _ => "AST__UNKNOWN",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Stream source: returns the next line, or null at end of input
pub type SourceFn = extern "C" fn() -> *const c_char;

/// Stream sink: receives one line of output
pub type SinkFn = extern "C" fn(*const c_char);

/// Error reporter: receives every message the library emits
pub type PutErrFn = extern "C" fn(c_int, *const c_char);

/// Coordinate transform registered for an IntraMap
///
/// Arguments: the mapping, npoint, ncoord_in, per-coordinate input
/// pointers, forward flag, ncoord_out, per-coordinate output pointers.
pub type TranFn = unsafe extern "C" fn(
    NativeHandle,
    c_int,
    c_int,
    *const *const f64,
    c_int,
    c_int,
    *const *mut f64,
);

/// Rendering primitives the library calls while drawing a Plot
///
/// Every entry returns 1 on success and 0 on failure, except `cap`
/// which returns the capability value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GrfFns {
    pub attr: unsafe extern "C" fn(c_int, f64, *mut f64, c_int) -> c_int,
    pub cap: extern "C" fn(c_int, c_int) -> c_int,
    pub flush: extern "C" fn() -> c_int,
    pub line: unsafe extern "C" fn(c_int, *const f32, *const f32) -> c_int,
    pub mark: unsafe extern "C" fn(c_int, *const f32, *const f32, c_int) -> c_int,
    pub text: unsafe extern "C" fn(*const c_char, f32, f32, *const c_char, f32, f32) -> c_int,
    pub qch: unsafe extern "C" fn(*mut f32, *mut f32) -> c_int,
    pub txext: unsafe extern "C" fn(
        *const c_char,
        f32,
        f32,
        *const c_char,
        f32,
        f32,
        *mut f32,
        *mut f32,
    ) -> c_int,
    pub scales: unsafe extern "C" fn(*mut f32, *mut f32) -> c_int,
}

/// Graphics attribute selectors passed to `GrfFns::attr`
pub mod grf_codes {
    use core::ffi::c_int;

    pub const STYLE: c_int = 0;
    pub const WIDTH: c_int = 1;
    pub const SIZE: c_int = 2;
    pub const FONT: c_int = 3;
    pub const COLOUR: c_int = 4;

    pub const TEXT: c_int = 0;
    pub const LINE: c_int = 1;
    pub const MARK: c_int = 2;

    pub const CAP_ESC: c_int = 0;
    pub const CAP_MJUST: c_int = 1;
    pub const CAP_SCALES: c_int = 2;
}

/// "No value" marker used by the library for doubles
pub const BAD: f64 = -f64::MAX;

/// Registration flags for `NativeApi::intra_reg`
pub mod intra_flags {
    pub const NO_FORWARD: u32 = 1;
    pub const NO_INVERSE: u32 = 2;
    pub const SIMP_FI: u32 = 4;
    pub const SIMP_IF: u32 = 8;
}

/// Native type letter of an attribute accessor
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttrType {
    C,
    D,
    F,
    I,
    L,
}

/// Attribute value, tagged by native type letter
#[derive(Clone, PartialEq, Debug)]
pub enum AttrValue {
    C(String),
    D(f64),
    F(f32),
    I(i32),
    L(i64),
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            Self::C(_) => AttrType::C,
            Self::D(_) => AttrType::D,
            Self::F(_) => AttrType::F,
            Self::I(_) => AttrType::I,
            Self::L(_) => AttrType::L,
        }
    }

    /// Formatted the way the library stores it
    pub fn to_native_string(&self) -> String {
        match self {
            Self::C(s) => s.clone(),
            Self::D(v) => format!("{}", v),
            Self::F(v) => format!("{}", v),
            Self::I(v) => v.to_string(),
            Self::L(v) => v.to_string(),
        }
    }
}

/// The wrapped library's entry points
///
/// Conventions shared by every method:
/// - failure is reported by setting the status slot (and emitting a
///   message through the installed error reporter), never by panicking;
/// - a method called while the status slot is already set does nothing
///   and returns a neutral value (`lock`, `unlock` and `annul` excepted);
/// - when a callback leaves the status slot set, the method stops at once;
/// - objects passed in must be locked by the calling thread, except for
///   `annul`, `lock` and `unlock`;
/// - handles returned are new references, locked by the calling thread.
pub trait NativeApi: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    fn status(&self) -> StatusCode;
    fn set_status(&self, status: StatusCode);
    fn clear_status(&self);
    fn install_error_reporter(&self, reporter: Option<PutErrFn>);

    fn lock(&self, handle: NativeHandle, wait: bool) -> bool;
    fn unlock(&self, handle: NativeHandle) -> bool;

    fn annul(&self, handle: NativeHandle);
    fn clone_handle(&self, handle: NativeHandle) -> NativeHandle;
    fn copy(&self, handle: NativeHandle) -> NativeHandle;

    fn get_attr(&self, handle: NativeHandle, name: &str, ty: AttrType) -> Option<AttrValue>;
    fn set_attr(&self, handle: NativeHandle, name: &str, value: &AttrValue);
    /// Printf-style settings string; a literal `%` must arrive as `%%`
    fn set(&self, handle: NativeHandle, settings: &str);
    fn test_attr(&self, handle: NativeHandle, name: &str) -> bool;
    fn clear_attr(&self, handle: NativeHandle, name: &str);

    fn new_frame(&self, naxes: i32) -> NativeHandle;
    fn new_unit_map(&self, ncoord: i32) -> NativeHandle;
    fn new_zoom_map(&self, ncoord: i32, zoom: f64) -> NativeHandle;
    fn new_channel(&self, source: Option<SourceFn>, sink: Option<SinkFn>) -> NativeHandle;

    #[allow(clippy::too_many_arguments)]
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
    );
    fn new_intra_map(&self, name: &str, nin: i32, nout: i32) -> NativeHandle;

    /// Returns the object read, or null at end of input
    fn channel_read(&self, channel: NativeHandle) -> NativeHandle;
    /// Returns the number of objects written
    fn channel_write(&self, channel: NativeHandle, object: NativeHandle) -> i32;

    /// `input` holds `ncoord_in` rows of `indim`, `output` `ncoord_out` rows of `outdim`
    #[allow(clippy::too_many_arguments)]
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
    );
    fn simplify(&self, map: NativeHandle) -> NativeHandle;
    fn invert(&self, map: NativeHandle);

    fn new_plot(&self, frame: NativeHandle, graphbox: &[f32; 4], basebox: &[f64; 4]) -> NativeHandle;
    /// Frame `index` of a frame set (1-based); plots hold a base frame only
    fn get_frame(&self, frameset: NativeHandle, index: i32) -> NativeHandle;
    fn install_grf(&self, grf: Option<GrfFns>);
    fn plot_border(&self, plot: NativeHandle) -> bool;
    fn plot_grid(&self, plot: NativeHandle);
    fn plot_mark(&self, plot: NativeHandle, nmark: i32, ncoord: i32, indim: i32, input: &[f64], marktype: i32);
    fn plot_text(&self, plot: NativeHandle, text: &str, pos: &[f64], up: &[f32; 2], just: &str);
    fn plot_bounding_box(&self, plot: NativeHandle) -> ([f32; 2], [f32; 2]);
}

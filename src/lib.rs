//! astbridge - thread-safe bridge to a refcounted native object library
//!
//! Lets many Rust threads drive a native library that uses manual
//! reference counting, per-object thread-affinity locks and C callbacks
//! without user-data parameters.
//!
//! Layers, leaves first:
//! - `handle`: HandleBox ownership states and the LifecycleManager
//! - `lock`: LockSet ordering and balanced lock/unlock
//! - `guard`: the process-wide native lock and status translation
//! - `callback`: thread-local callback frames and C trampolines
//! - `object`: typed wrappers over the native classes

pub mod callback;
pub mod config;
pub mod error;
pub mod grf;
pub mod guard;
pub mod handle;
pub mod lock;
pub mod logging;
pub mod native;
pub mod object;

// Re-export core types
pub use callback::{CallbackSlots, Grf, Sink, Source, Transformer};
pub use config::BridgeConfig;
pub use error::{BridgeError, CallbackError, Result};
pub use grf::DisplayList;
pub use guard::{Bridge, BridgeStats};
pub use handle::{HandleBox, Lifecycle, OwnershipState};
pub use lock::{HeldLocks, LockSet};
pub use native::{NativeApi, NativeHandle, StatusCode};
pub use object::{AstObject, Channel, Frame, IntraMap, Mapping, ObjectKind, Plot};

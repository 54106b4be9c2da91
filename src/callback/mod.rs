//! Callbacks from native code into Rust
//!
//! Design: the library's callback signatures carry no user-data pointer,
//! so targets are found out of band:
//! 1. Call-scoped targets (stream source/sink, graphics) are armed in a
//!    thread-local frame for the length of one guarded call
//! 2. Object-scoped targets (IntraMap transformations) are found through a
//!    key stored in the native object's own `IntraFlag` attribute
//! 3. Trampolines copy native arguments, run the callback under
//!    `catch_unwind`, and turn any failure into a status the library
//!    understands; the failure itself is handed to the guard

mod context;
mod grf;
mod stream;
mod transform;


pub use context::{CallbackSlots, SlotKind};
pub use grf::{Capability, Grf, GrfAttr, Primitive};
pub use stream::{LineBuffer, ReaderSource, Sink, Source, WriterSink};
pub use transform::{Registration, TransformRegistry, Transformer};

pub(crate) use context::{arm, Failure, FrameOutcome};
pub(crate) use grf::TRAMPOLINES as GRF_TRAMPOLINES;
pub(crate) use stream::{sink_trampoline, source_trampoline};
pub(crate) use transform::{flags as transform_flags, tran_trampoline};

use crate::error::{CallbackContractError, CallbackError};

/// Callback error for a result that breaks the native contract
pub(crate) fn contract(message: impl Into<String>) -> CallbackError {
    Box::new(CallbackContractError(message.into()))
}

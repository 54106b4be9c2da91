//! Bridge error taxonomy
//!
//! Ordinary, recoverable failures (`NativeOperation`, `DisposedObject`, ...)
//! are returned to the direct caller. `CallbackPropagated` reaches the caller
//! of the outer guarded call. `Reentrancy` and `BridgeFatal` mark a broken
//! threading or callback protocol and should not be retried.

use crate::native::StatusCode;
use std::error::Error as StdError;
use std::fmt;

/// Error raised by a managed callback (source, sink, transformer, grf)
pub type CallbackError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug)]
pub enum BridgeError {
    /// The native call reported failure through its status slot
    NativeOperation { status: StatusCode, message: String },
    /// A native constructor failed; the wrapper was never initialized
    NativeConstruction { status: StatusCode, message: String },
    /// A managed callback failed inside a native call
    CallbackPropagated {
        status: StatusCode,
        message: String,
        source: CallbackError,
    },
    /// Guarded call entered on a thread that already holds the native lock
    Reentrancy(String),
    /// Lock primitive failure or trampoline fired with no target
    BridgeFatal(String),
    /// Operation on a wrapper whose handle has been released
    DisposedObject,
    /// Operation on a wrapper whose construction never completed
    NotConstructed,
    /// Argument rejected before any native call was made
    InvalidArgument(String),
    /// Returned object is not of the requested class
    WrongClass { expected: &'static str, found: String },
    /// No process-wide bridge has been installed
    NotInitialized,
    Config(String),
}

impl BridgeError {
    /// Native status associated with the error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::NativeOperation { status, .. }
            | Self::NativeConstruction { status, .. }
            | Self::CallbackPropagated { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the error indicates a bridge protocol violation
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Reentrancy(_) | Self::BridgeFatal(_))
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NativeOperation { status, message } => {
                write!(f, "{} [{}]", message, status.name())
            }
            Self::NativeConstruction { status, message } => {
                write!(f, "Native construction failed: {} [{}]", message, status.name())
            }
            Self::CallbackPropagated { message, source, .. } => {
                if message.is_empty() {
                    write!(f, "Callback failed: {}", source)
                } else {
                    write!(f, "Callback failed: {} ({})", source, message)
                }
            }
            Self::Reentrancy(msg) => write!(f, "Re-entrant native call: {}", msg),
            Self::BridgeFatal(msg) => write!(f, "Fatal bridge error: {}", msg),
            Self::DisposedObject => write!(f, "Object has been disposed"),
            Self::NotConstructed => write!(f, "Object construction did not complete"),
            Self::InvalidArgument(msg) => write!(f, "{}", msg),
            Self::WrongClass { expected, found } => {
                write!(f, "Expected {} object, found {}", expected, found)
            }
            Self::NotInitialized => write!(f, "Bridge has not been initialized"),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl StdError for BridgeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::CallbackPropagated { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Error for a managed callback that did not fail but gave a bad result
#[derive(Debug)]
pub struct CallbackContractError(pub String);

impl fmt::Display for CallbackContractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for CallbackContractError {}

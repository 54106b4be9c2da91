//! ErrorStatus - per-thread native message buffer
//!
//! The wrapped library reports each error message through a registered
//! reporter function. `put_err_trampoline` appends them to the current
//! thread's buffer; the guard resets the buffer on entry and takes the
//! text when the native call returns.

use crate::native::StatusCode;
use core::ffi::{c_char, c_int};
use std::cell::RefCell;
use std::ffi::CStr;

const ELLIPSIS: &str = "...";

thread_local! {
    static STATUS: RefCell<ErrorStatus> = RefCell::new(ErrorStatus::default());
}

/// Accumulated native error messages of one guarded call
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorStatus {
    message: String,
    first: Option<StatusCode>,
    truncated: bool,
    limit: usize,
    separator: String,
}

impl Default for ErrorStatus {
    fn default() -> Self {
        Self::new(1024, "\n")
    }
}

impl ErrorStatus {
    pub fn new(limit: usize, separator: &str) -> Self {
        Self {
            message: String::new(),
            first: None,
            truncated: false,
            limit,
            separator: separator.to_string(),
        }
    }

    /// Append one message; text beyond the limit is cut and marked `...`
    pub fn push(&mut self, status: StatusCode, text: &str) {
        if self.first.is_none() && !status.is_ok() {
            self.first = Some(status);
        }
        if self.truncated || text.is_empty() {
            return;
        }
        if !self.message.is_empty() {
            self.message.push_str(&self.separator);
        }
        self.message.push_str(text);
        if self.message.len() > self.limit {
            let mut cut = self.limit;
            while !self.message.is_char_boundary(cut) {
                cut -= 1;
            }
            self.message.truncate(cut);
            self.message.push_str(ELLIPSIS);
            self.truncated = true;
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Status of the first non-OK message
    pub fn first_status(&self) -> Option<StatusCode> {
        self.first
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    fn cleared(&self) -> Self {
        Self::new(self.limit, &self.separator)
    }
}

/// Clear the buffer and set its limits for the next guarded call
pub(crate) fn reset(limit: usize, separator: &str) {
    let _ = STATUS.try_with(|status| *status.borrow_mut() = ErrorStatus::new(limit, separator));
}

/// Take the accumulated text, leaving the buffer empty
pub(crate) fn take() -> String {
    STATUS
        .try_with(|status| {
            let mut status = status.borrow_mut();
            let fresh = status.cleared();
            std::mem::replace(&mut *status, fresh).message
        })
        .unwrap_or_default()
}

/// Set the buffer aside for a nested call
pub(crate) fn save() -> ErrorStatus {
    STATUS
        .try_with(|status| {
            let mut status = status.borrow_mut();
            let fresh = status.cleared();
            std::mem::replace(&mut *status, fresh)
        })
        .unwrap_or_default()
}

pub(crate) fn restore(saved: ErrorStatus) {
    let _ = STATUS.try_with(|status| *status.borrow_mut() = saved);
}

pub(crate) fn push(status: StatusCode, text: &str) {
    let _ = STATUS.try_with(|buffer| {
        if let Ok(mut buffer) = buffer.try_borrow_mut() {
            buffer.push(status, text);
        }
    });
}

/// Snapshot of the current thread's buffer
pub fn current() -> ErrorStatus {
    STATUS
        .try_with(|status| status.borrow().clone())
        .unwrap_or_default()
}

/// Error reporter installed into the native library
pub extern "C" fn put_err_trampoline(status: c_int, message: *const c_char) {
    if message.is_null() {
        return;
    }
    // Only read here: the library owns the string
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    push(StatusCode(status), &text);
}

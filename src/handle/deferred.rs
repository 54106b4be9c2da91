//! Releases postponed until the next outermost guarded call
//!
//! A wrapper dropped on a thread that is inside a guarded call, but not
//! in a callback of it, cannot start a guarded call of its own. Its handle
//! is queued here and annulled by the next call that takes the process
//! lock.

use crate::native::NativeHandle;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct DeferredReleaseQueue {
    queue: Mutex<VecDeque<NativeHandle>>,

    /// Lets the guard skip the mutex when nothing is queued
    pending: AtomicU64,
}

impl Default for DeferredReleaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredReleaseQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(8)),
            pending: AtomicU64::new(0),
        }
    }

    /// Queue `handle`; returns the number now pending
    pub fn defer(&self, handle: NativeHandle) -> u64 {
        self.queue.lock().push_back(handle);
        self.pending.fetch_add(1, Ordering::Release) + 1
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Take every queued handle, oldest first
    pub fn drain(&self) -> Vec<NativeHandle> {
        let mut queue = self.queue.lock();
        let drained: Vec<NativeHandle> = queue.drain(..).collect();
        self.pending.fetch_sub(drained.len() as u64, Ordering::Release);
        drained
    }
}

// Copyright 2023 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The exclusive lock and its lock-holder record.
//!
//! `parking_lot::Mutex` is used instead of `std::sync::Mutex` specifically
//! because it supports `try_lock_for(Duration)`, which is the bounded
//! wait the pump loop needs without reaching for a separate timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

/// Tracks which thread, if any, currently holds the exclusive lock.
///
/// Kept as a *separate* primitive from the exclusive lock itself (a small
/// `std::sync::Mutex`) so that reading the holder for an assertion or for
/// `close()`'s interrupt check never contends with operator execution.
#[derive(Default)]
pub(crate) struct LockHolder(Mutex<Option<ThreadId>>);

impl LockHolder {
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn set(&self, holder: Option<ThreadId>) {
        *self.0.lock() = holder;
    }

    pub fn current(&self) -> Option<ThreadId> {
        *self.0.lock()
    }

    /// Every public entry point must not be called by a thread that already
    /// holds the exclusive lock (self-deadlock guard). Contract violations
    /// panic rather than return an error: they indicate a programming bug,
    /// not a recoverable condition.
    pub fn assert_not_reentrant(&self) {
        if self.current() == Some(thread::current().id()) {
            panic!("driver re-entered by the thread that already holds its exclusive lock");
        }
    }
}

/// The exclusive lock guarding all operator invocations and all mutations
/// of the applied-sources map, paired with its holder record.
pub(crate) struct ExclusiveLock<T> {
    mutex: Mutex<T>,
    holder: LockHolder,
    /// Cooperative cancellation token. Rust has no portable cross-thread
    /// "interrupt a blocking call" primitive, so `close()` sets this instead
    /// of interrupting whatever thread the holder record names; the pump
    /// loop consults it between operator-pair iterations.
    cancel_requested: AtomicBool,
}

/// Bounded wait used by `process()`'s lock acquisition.
pub(crate) const PUMP_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

impl<T> ExclusiveLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            holder: LockHolder::new(),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn assert_not_reentrant(&self) {
        self.holder.assert_not_reentrant();
    }

    pub fn current_holder(&self) -> Option<ThreadId> {
        self.holder.current()
    }

    pub fn request_cancellation(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Acquire with a bounded wait, recording the holder on success.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.assert_not_reentrant();
        let guard = self.mutex.try_lock_for(timeout)?;
        self.holder.set(Some(thread::current().id()));
        Some(guard)
    }

    /// Zero-wait acquisition, used by `close()` and `updateSource()`, which
    /// must never block the caller.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.assert_not_reentrant();
        let guard = self.mutex.try_lock()?;
        self.holder.set(Some(thread::current().id()));
        Some(guard)
    }

    /// Clear the holder record. Must be called exactly once per successful
    /// acquisition, right before the underlying guard actually drops.
    pub fn clear_holder(&self) {
        self.holder.set(None);
    }
}

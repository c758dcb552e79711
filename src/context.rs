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

//! `DriverContext` aggregates the accounting shared between a driver and the
//! task that owns it. The task-level scheduler, split catalogs, and query
//! planner that produce and drive it live outside this crate; what is here
//! is the minimal surface the Driver itself calls into, namely
//! `start`/`is_done`/`failed`/`finished`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque identifier for the distributed SQL task a driver belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

/// Shared accounting and lifecycle signalling between a [`crate::Driver`]
/// and the task that owns it.
pub struct DriverContext {
    task_id: TaskId,
    started: AtomicBool,
    done: AtomicBool,
    cancelled: AtomicBool,
    failure: Mutex<Option<Arc<anyhow::Error>>>,
    finished: AtomicBool,
}

impl DriverContext {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Called once per pump quantum before any operator is touched.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the wider task this driver belongs to has already decided to
    /// stop driving it (e.g. the query failed elsewhere). The pump loop
    /// treats this the same as having pumped everything there is to pump.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.failure.lock().is_some()
    }

    /// Mark the task done from outside the driver (e.g. the scheduler
    /// cancelling the whole query). Idempotent.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Report an operator failure observed while pumping. Does not unwind
    /// anything by itself; the caller is expected to propagate the error
    /// after calling this.
    pub fn failed(&self, err: &anyhow::Error) {
        error!(task_id = %self.task_id, error = %err, "driver pump failed");
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(anyhow::anyhow!("{err}")));
        }
        self.done.store(true, Ordering::Release);
    }

    pub fn failure(&self) -> Option<Arc<anyhow::Error>> {
        self.failure.lock().clone()
    }

    /// Called exactly once, at the end of the destruction sequence.
    pub fn finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Ambient hook recording that destruction observed the cooperative
    /// cancellation token set (this crate's stand-in for restoring a
    /// thread's interrupt flag).
    pub fn note_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("task_id", &self.task_id)
            .field("done", &self.done.load(Ordering::Relaxed))
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

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

//! The Driver: a single-pipeline operator execution engine (see the crate
//! root docs for the full contract).

use std::any::Any;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use parking_lot::MutexGuard;

use crate::context::DriverContext;
use crate::error::{accumulate, DriverError, Suppressed};
use crate::lock::{ExclusiveLock, PUMP_LOCK_TIMEOUT};
use crate::operator::{Blocked, Operator};
use crate::source::{PlanNodeId, TaskSource};
use crate::sources::{AppliedSources, StagedSources};

/// Tunables for the driver's concurrency protocol. The struct exists so a
/// task-level scheduler can tune them without the Driver hard-coding magic
/// durations.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Bounded wait `process()` uses when trying to acquire the exclusive
    /// lock before giving up and returning `NOT_BLOCKED` to let the caller
    /// reschedule.
    pub pump_lock_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pump_lock_timeout: PUMP_LOCK_TIMEOUT,
        }
    }
}

/// Everything mutated only while the exclusive lock is held: the operator
/// list itself and the applied-sources map.
struct DriverInner {
    operators: Vec<Box<dyn Operator>>,
    applied: AppliedSources,
}

/// A single-pipeline execution engine. See the crate root docs.
pub struct Driver {
    context: Arc<DriverContext>,
    config: DriverConfig,
    source_ids: Vec<PlanNodeId>,
    source_index: HashMap<PlanNodeId, usize>,
    staged: StagedSources,
    state: crate::state::StateCell,
    lock: ExclusiveLock<DriverInner>,
}

impl Driver {
    /// Build a driver over a non-empty, ordered operator chain.
    ///
    /// Panics if `operators` is empty: an empty pipeline is a contract
    /// violation, not a recoverable condition.
    pub fn new(context: Arc<DriverContext>, operators: Vec<Box<dyn Operator>>) -> Self {
        if operators.is_empty() {
            panic!("{}", DriverError::EmptyPipeline);
        }

        let mut operators = operators;
        let mut source_index = HashMap::new();
        for (idx, op) in operators.iter_mut().enumerate() {
            if let Some(src) = op.as_source_operator_mut() {
                let id = src.source_id();
                assert!(
                    source_index.insert(id, idx).is_none(),
                    "duplicate source operator for {id}"
                );
            }
        }
        let source_ids: Vec<PlanNodeId> = source_index.keys().copied().collect();

        Self {
            context,
            config: DriverConfig::default(),
            staged: StagedSources::new(source_ids.iter().copied()),
            source_index,
            state: crate::state::StateCell::new(),
            lock: ExclusiveLock::new(DriverInner {
                applied: AppliedSources::new(source_ids.iter().copied()),
                operators,
            }),
            source_ids,
        }
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn driver_context(&self) -> &Arc<DriverContext> {
        &self.context
    }

    pub fn source_ids(&self) -> &[PlanNodeId] {
        &self.source_ids
    }

    /// Stage a `TaskSource` update lock-free, then opportunistically drain it
    /// if the lock happens to be free. It is expected and safe for the
    /// actual apply to happen on a different thread: a zero-wait acquisition
    /// that fails simply leaves the update staged for the next `process()`
    /// to pick up.
    pub fn update_source(&self, source: TaskSource) {
        self.lock.assert_not_reentrant();
        self.staged.stage(source);
        if let Some(inner) = self.lock.try_lock() {
            self.release_after_drain(inner);
        }
    }

    /// Request cancellation. CASes `Alive -> NeedDestruction`; if this call
    /// loses that race, it is a no-op (`close()` is idempotent). If the
    /// exclusive lock is free, destruction runs inline; otherwise the
    /// cooperative cancellation token is set so the thread currently
    /// pumping unwinds at its next checkpoint and destruction runs on that
    /// thread's lock release instead.
    pub fn close(&self) {
        self.lock.assert_not_reentrant();
        if !self.state.try_request_destruction() {
            return;
        }
        if let Some(inner) = self.lock.try_lock() {
            self.release_after_drain(inner);
        } else {
            self.lock.request_cancellation();
        }
    }

    /// Whether this driver has nothing further to do.
    ///
    /// Must not be called while already holding the exclusive lock. When
    /// the lock is free, this also opportunistically advances
    /// `Alive -> NeedDestruction` upon observing natural completion, so
    /// that the *next* lock release tears the driver down. When the lock
    /// is contended, this conservatively reports based on state and
    /// context alone; the last operator's status is unknown without the
    /// lock, so a caller may see a stale `false`.
    pub fn is_finished(&self) -> bool {
        self.lock.assert_not_reentrant();
        if let Some(inner) = self.lock.try_lock() {
            let last_finished = inner
                .operators
                .last()
                .map(|op| op.is_finished())
                .unwrap_or(false);
            let finished = self.state.get() != crate::state::DriverState::Alive
                || self.context.is_done()
                || last_finished;
            if finished {
                self.state.try_request_destruction();
            }
            self.release_after_drain(inner);
            finished
        } else {
            self.state.get() != crate::state::DriverState::Alive || self.context.is_done()
        }
    }

    /// Drain-then-destroy-then-clear-holder-then-release, for the three
    /// entry points that acquire the lock only to release it again
    /// immediately (`process()` instead uses [`Guard`], since it must keep
    /// the lock held across the pump loop's early-return points).
    fn release_after_drain(&self, mut inner: MutexGuard<'_, DriverInner>) {
        let pending_panic = self.drain_and_destroy(&mut inner);
        self.lock.clear_holder();
        drop(inner);
        if let Some(err) = pending_panic {
            panic!("{err}");
        }
    }

    /// Run one cooperative quantum.
    ///
    /// An operator failure from `finish`/`get_output`/`add_input` is
    /// reported to the context and then propagated to the caller rather than
    /// unwinding the thread; only contract violations (empty pipeline,
    /// re-entry) panic.
    pub fn process(&self) -> anyhow::Result<Blocked> {
        self.lock.assert_not_reentrant();
        let Some(inner) = self.lock.try_lock_for(self.config.pump_lock_timeout) else {
            return Ok(Blocked::NotBlocked);
        };
        let mut guard = Guard::new(self, inner);

        self.context.start();
        if self.staged.is_dirty() {
            self.drain_staged_sources(&mut guard);
        }

        let n = guard.operators.len();
        for (i, j) in (0..n).tuple_windows() {
            if self.context.is_done() || self.lock.is_cancellation_requested() {
                break;
            }

            let (left, right) = guard.operators.split_at_mut(j);
            let cur = &mut left[i];
            let nxt = &mut right[0];

            let mut cur_blocked = cur.is_blocked();
            if !cur_blocked.is_ready() {
                cur.operator_context().record_blocked();
                return Ok(pending_or_not_blocked(cur_blocked));
            }
            let mut nxt_blocked = nxt.is_blocked();
            if !nxt_blocked.is_ready() {
                nxt.operator_context().record_blocked();
                return Ok(pending_or_not_blocked(nxt_blocked));
            }

            if cur.is_finished() {
                nxt.finish().map_err(|e| {
                    self.context.failed(&e);
                    e
                })?;
                nxt.operator_context().record_finish();
                // Intentionally no `break`: keep scanning so a finish can
                // cascade through the rest of the pipeline within the same
                // quantum.
            } else if nxt.needs_input() {
                let page = cur.get_output().map_err(|e| {
                    self.context.failed(&e);
                    e
                })?;
                if let Some(page) = page {
                    if !page.is_empty() {
                        nxt.add_input(page).map_err(|e| {
                            self.context.failed(&e);
                            e
                        })?;
                    }
                }
            }
        }

        Ok(Blocked::NotBlocked)
    }

    /// Repeatedly call [`Self::process`] until either a returned handle is
    /// not yet ready, the driver is finished, or `duration` elapses.
    pub fn process_for(&self, duration: Duration) -> anyhow::Result<Blocked> {
        let deadline = Instant::now() + duration;
        loop {
            let mut blocked = self.process()?;
            if !blocked.is_ready() {
                return Ok(blocked);
            }
            if self.is_finished() {
                return Ok(Blocked::NotBlocked);
            }
            if Instant::now() >= deadline {
                return Ok(Blocked::NotBlocked);
            }
        }
    }

    fn drain_staged_sources(&self, inner: &mut DriverInner) {
        for ts in self.staged.snapshot() {
            let delta = inner.applied.merge(&ts);
            if delta.is_empty() {
                continue;
            }
            let idx = self.source_index[&ts.plan_node_id()];
            let op = inner.operators[idx]
                .as_source_operator_mut()
                .expect("source index points at a non-source operator");
            for split in delta.new_splits {
                if let Err(e) = op.add_split(split) {
                    self.context.failed(&e);
                }
            }
            if delta.newly_no_more_splits {
                if let Err(e) = op.no_more_splits() {
                    self.context.failed(&e);
                }
            }
        }
    }

    /// The lock-and-drain guard's actual work: drain staged sources
    /// while alive, then run destruction exactly once if the state has
    /// advanced to `NeedDestruction`. Returns the error to propagate, if
    /// any, so the caller can decide how (panicking once the holder record
    /// has been cleared and the lock is about to be released).
    fn drain_and_destroy(&self, inner: &mut DriverInner) -> Option<anyhow::Error> {
        if self.state.get() == crate::state::DriverState::Alive {
            self.drain_staged_sources(inner);
        }
        if self.state.try_advance_to_destroyed() {
            self.run_destruction_sequence(inner)
        } else {
            None
        }
    }

    /// Finish then close every operator, accumulating failures
    /// without letting one stop the rest.
    fn run_destruction_sequence(&self, inner: &mut DriverInner) -> Option<anyhow::Error> {
        let mut in_flight: Option<Suppressed> = None;

        for op in inner.operators.iter_mut() {
            if let Err(e) = op.finish() {
                accumulate(&mut in_flight, e);
            }
        }

        let was_cancelled = self.lock.is_cancellation_requested();

        for op in inner.operators.iter_mut() {
            let op: &mut dyn Operator = op.as_mut();
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| op.close())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "operator close failed during driver destruction");
                    accumulate(&mut in_flight, e);
                }
                Err(payload) => {
                    accumulate(&mut in_flight, anyhow::anyhow!("operator close panicked: {}", panic_message(&payload)));
                }
            }
        }

        self.context.finished();

        if was_cancelled {
            self.context.note_cancelled();
        }

        in_flight.map(|s| {
            let err = s.into_anyhow();
            self.context.failed(&err);
            err
        })
    }
}

fn pending_or_not_blocked(blocked: Blocked) -> Blocked {
    match blocked.into_future() {
        Some(fut) => Blocked::Pending(fut),
        None => Blocked::NotBlocked,
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// RAII scoped acquisition of the exclusive lock. On drop, guarantees on
/// every exit path, including unwinding, that staged sources are drained
/// (while alive) and destruction runs (if requested) strictly before the
/// lock-holder record is cleared and the underlying mutex guard itself is
/// released.
struct Guard<'d> {
    driver: &'d Driver,
    inner: MutexGuard<'d, DriverInner>,
}

impl<'d> Guard<'d> {
    fn new(driver: &'d Driver, inner: MutexGuard<'d, DriverInner>) -> Self {
        Self { driver, inner }
    }
}

impl Deref for Guard<'_> {
    type Target = DriverInner;
    fn deref(&self) -> &DriverInner {
        &self.inner
    }
}

impl DerefMut for Guard<'_> {
    fn deref_mut(&mut self) -> &mut DriverInner {
        &mut self.inner
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let pending_panic = self.driver.drain_and_destroy(&mut self.inner);
        self.driver.lock.clear_holder();
        if let Some(err) = pending_panic {
            panic!("{err}");
        }
    }
}

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

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::task::noop_waker_ref;

use crate::source::{PlanNodeId, ScheduledSplit};

/// A batch of columnar rows passed between operators. Opaque to the driver
/// beyond a row count, which is only used to decide whether `getOutput`
/// produced anything worth pushing downstream.
#[derive(Debug, Clone)]
pub struct Page {
    rows: usize,
    bytes: Bytes,
}

impl Page {
    pub fn new(rows: usize, bytes: Bytes) -> Self {
        Self { rows, bytes }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// The back-pressure handle returned by [`Operator::is_blocked`].
///
/// `NotBlocked` is the always-ready sentinel; `Pending` wraps an arbitrary
/// completion future the external scheduler is expected to poll or register
/// a waker against.
pub enum Blocked {
    NotBlocked,
    Pending(BoxFuture<'static, ()>),
}

/// The singleton already-complete back-pressure handle.
pub const NOT_BLOCKED: fn() -> Blocked = || Blocked::NotBlocked;

impl Blocked {
    pub fn pending(fut: impl Future<Output = ()> + Send + 'static) -> Self {
        Blocked::Pending(Box::pin(fut))
    }

    /// Whether this handle is already complete, without requiring the
    /// caller to run inside an async executor. Polled once with a no-op
    /// waker: the driver's `process()` is a plain synchronous call, so a
    /// future that isn't ready yet is simply handed back to the caller
    /// as-is rather than awaited here.
    pub fn is_ready(&mut self) -> bool {
        match self {
            Blocked::NotBlocked => true,
            Blocked::Pending(fut) => {
                let waker = noop_waker_ref();
                let mut cx = Context::from_waker(waker);
                matches!(Pin::new(fut).poll(&mut cx), Poll::Ready(()))
            }
        }
    }

    /// Consume `self`, returning the future to hand back to the caller as a
    /// suspension point, or `None` if it was already `NotBlocked`.
    pub fn into_future(self) -> Option<BoxFuture<'static, ()>> {
        match self {
            Blocked::NotBlocked => None,
            Blocked::Pending(fut) => Some(fut),
        }
    }
}

impl fmt::Debug for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocked::NotBlocked => write!(f, "Blocked::NotBlocked"),
            Blocked::Pending(_) => write!(f, "Blocked::Pending(..)"),
        }
    }
}

/// Per-operator accounting, owned by the operator and aggregated into the
/// driver's [`crate::DriverContext`]. Real executors track rows/bytes and
/// wall-clock time here; this crate only needs enough to let the pump
/// record blocked/finished transitions and timings without caring about an
/// operator's internals.
#[derive(Debug, Default)]
pub struct OperatorContext {
    name: String,
    blocked_calls: AtomicU64,
    finish_calls: AtomicU64,
}

impl OperatorContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocked_calls: AtomicU64::new(0),
            finish_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn record_blocked(&self) {
        self.blocked_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finish(&self) {
        self.finish_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocked_calls(&self) -> u64 {
        self.blocked_calls.load(Ordering::Relaxed)
    }

    pub fn finish_calls(&self) -> u64 {
        self.finish_calls.load(Ordering::Relaxed)
    }
}

/// A stage in the pipeline. Operators form a linear chain: operator *i*
/// produces pages consumed by operator *i+1*.
///
/// Every method here is synchronous on purpose: an operator that needs
/// to wait must say so through [`Operator::is_blocked`] rather than block
/// inside any other method, since the driver invokes these while holding
/// its single exclusive lock.
pub trait Operator: Send {
    fn operator_context(&self) -> &OperatorContext;

    /// Whether this operator can usefully accept more input right now.
    fn needs_input(&self) -> bool;

    /// Hand a page produced by the previous operator to this one. Only
    /// called when `needs_input()` was true and the page was non-empty.
    fn add_input(&mut self, page: Page) -> anyhow::Result<()>;

    /// Produce the next output page, or `None` if there is nothing ready
    /// yet (which is not the same as finished; an operator with nothing
    /// ready should instead report itself via `is_blocked`).
    fn get_output(&mut self) -> anyhow::Result<Option<Page>>;

    /// Signal that no further input will arrive; the operator should flush
    /// whatever it is holding and transition towards `is_finished() == true`.
    fn finish(&mut self) -> anyhow::Result<()>;

    /// Whether this operator has nothing further to produce.
    fn is_finished(&self) -> bool;

    /// Report back-pressure: a handle that completes when this operator can
    /// next make progress. Operators that are always ready to proceed
    /// should return [`NOT_BLOCKED`].
    fn is_blocked(&mut self) -> Blocked;

    /// Release any externally owned resources (network streams, file
    /// handles, scanners, ...). Optional: most operators have nothing to
    /// close and can rely on the default no-op.
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Down-cast to the source-operator sub-capability, for operators that
    /// ingest external splits. Overridden by `impl SourceOperator`s.
    fn as_source_operator_mut(&mut self) -> Option<&mut dyn SourceOperator> {
        None
    }
}

/// The sub-capability of an [`Operator`] that ingests externally delivered
/// splits. At most one source operator exists per [`PlanNodeId`] within a
/// driver.
pub trait SourceOperator: Operator {
    fn source_id(&self) -> PlanNodeId;

    /// Deliver one split. Called at most once per split.
    fn add_split(&mut self, split: ScheduledSplit) -> anyhow::Result<()>;

    /// Signal that no further splits will be assigned to this source.
    fn no_more_splits(&mut self) -> anyhow::Result<()>;
}

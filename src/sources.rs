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

//! The two source maps: a lock-free, many-writer staged map that callers of
//! [`crate::Driver::update_source`] coalesce into, and a lock-protected
//! applied map that the pump drains it into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::source::{PlanNodeId, ScheduledSplit, TaskSource};

/// Lock-free mapping from `PlanNodeId` to the latest staged [`TaskSource`].
///
/// The set of ids is fixed at construction time (it is the driver's set of
/// source operators), so the "put-if-absent" step is really just a
/// CAS from `None`.
pub struct StagedSources {
    slots: HashMap<PlanNodeId, ArcSwapOption<TaskSource>>,
    dirty: AtomicBool,
}

impl StagedSources {
    pub fn new(source_ids: impl IntoIterator<Item = PlanNodeId>) -> Self {
        let slots = source_ids
            .into_iter()
            .map(|id| (id, ArcSwapOption::from(None)))
            .collect();
        Self {
            slots,
            dirty: AtomicBool::new(false),
        }
    }

    /// Stage `incoming`, coalescing lock-free with whatever is already
    /// pending for its id. Silently ignored if the id is not owned by this
    /// driver (it belongs to a sibling driver in the same task).
    pub fn stage(&self, incoming: TaskSource) {
        let Some(slot) = self.slots.get(&incoming.plan_node_id()) else {
            return;
        };
        loop {
            let current = slot.load_full();
            let next = match &current {
                None => Arc::new(incoming.clone()),
                Some(c) => {
                    if c.contributes_nothing(&incoming) {
                        return;
                    }
                    Arc::new(c.merge_value(&incoming))
                }
            };
            let prev = slot.compare_and_swap(&current, Some(next));
            if same_arc(&prev, &current) {
                self.dirty.store(true, Ordering::Release);
                return;
            }
            // Another thread advanced the slot between our load and our CAS;
            // retry against whatever is there now.
        }
    }

    /// `true` if anything has been staged since the last [`Self::drain`].
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Snapshot every currently-staged entry. Called only by the thread
    /// holding the exclusive lock, but the read itself stays lock-free so it
    /// never blocks a concurrent `stage`.
    pub fn snapshot(&self) -> Vec<Arc<TaskSource>> {
        self.dirty.store(false, Ordering::Release);
        self.slots
            .values()
            .filter_map(|slot| slot.load_full())
            .collect()
    }
}

fn same_arc<T>(a: &arc_swap::Guard<Option<Arc<T>>>, b: &Option<Arc<T>>) -> bool {
    match (a.as_ref().map(Arc::as_ptr), b.as_ref().map(Arc::as_ptr)) {
        (None, None) => true,
        (Some(x), Some(y)) => std::ptr::eq(x, y),
        _ => false,
    }
}

/// The result of merging one staged [`TaskSource`] into the applied map:
/// the splits that became newly visible, and whether `no_more_splits`
/// newly became true.
#[derive(Debug, Default)]
pub struct AppliedDelta {
    pub new_splits: Vec<ScheduledSplit>,
    pub newly_no_more_splits: bool,
}

impl AppliedDelta {
    pub fn is_empty(&self) -> bool {
        self.new_splits.is_empty() && !self.newly_no_more_splits
    }
}

/// Mapping from `PlanNodeId` to the `TaskSource` last applied to the
/// operator. Mutated only while the exclusive lock is held.
pub struct AppliedSources {
    applied: HashMap<PlanNodeId, TaskSource>,
}

impl AppliedSources {
    pub fn new(source_ids: impl IntoIterator<Item = PlanNodeId>) -> Self {
        let applied = source_ids.into_iter().map(|id| (id, TaskSource::empty(id))).collect();
        Self { applied }
    }

    /// Merge one staged `TaskSource` into the applied map, returning the
    /// delta that needs to be pushed onto the matching source operator.
    ///
    /// Panics if `incoming`'s id is not one of this driver's source ids;
    /// that would mean [`StagedSources`] let through an id it shouldn't
    /// have, which is a Driver bug, not a caller error.
    pub fn merge(&mut self, incoming: &TaskSource) -> AppliedDelta {
        let current = self
            .applied
            .get(&incoming.plan_node_id())
            .expect("staged source id not owned by this driver");
        if current.contributes_nothing(incoming) {
            return AppliedDelta::default();
        }
        let merged = current.merge_value(incoming);
        let new_splits: Vec<ScheduledSplit> = merged.splits_new_since(current).cloned().collect();
        let newly_no_more_splits = merged.is_no_more_splits() && !current.is_no_more_splits();
        self.applied.insert(incoming.plan_node_id(), merged);
        AppliedDelta {
            new_splits,
            newly_no_more_splits,
        }
    }
}

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

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Opaque identifier for a source position in the query plan. At most one
/// [`SourceOperator`](crate::SourceOperator) per `PlanNodeId` exists within a
/// single driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanNodeId(pub u64);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlanNodeId({})", self.0)
    }
}

/// Stable identity of a [`Split`](SplitMetaData). Splits are opaque to the
/// driver beyond this id, which is what gives `ScheduledSplit` its value
/// equality.
pub type SplitId = Arc<str>;

/// A unit of data-source work (file range, shard, partition, ...). The
/// driver never looks inside one; it only needs a stable id to dedupe and
/// hand to the owning [`SourceOperator`](crate::SourceOperator).
pub trait SplitMetaData: fmt::Debug + Send + Sync {
    fn id(&self) -> SplitId;
}

/// A split together with the scheduling metadata the task source attaches to
/// it. Set membership uses value equality on the split's id alone, so the
/// same split staged twice (even via differently-constructed `Arc`s)
/// collapses to one entry.
#[derive(Debug, Clone)]
pub struct ScheduledSplit {
    pub split: Arc<dyn SplitMetaData>,
    pub sequence_id: u64,
}

impl ScheduledSplit {
    pub fn new(split: Arc<dyn SplitMetaData>, sequence_id: u64) -> Self {
        Self { split, sequence_id }
    }

    pub fn id(&self) -> SplitId {
        self.split.id()
    }
}

impl PartialEq for ScheduledSplit {
    fn eq(&self, other: &Self) -> bool {
        self.split.id() == other.split.id()
    }
}

impl Eq for ScheduledSplit {}

impl Hash for ScheduledSplit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.split.id().hash(state);
    }
}

/// An immutable message delivering a new split set, and possibly a terminal
/// marker, for one source id.
///
/// `TaskSource::merge_value` is the value-level half of the `update`
/// contract: the applied-sources map (lock-protected) uses it
/// directly. The lock-free staged-sources map needs an
/// identity-preserving variant instead, which lives on
/// [`crate::sources::StagedSources`] since it operates on `Arc<TaskSource>`.
#[derive(Debug, Clone)]
pub struct TaskSource {
    plan_node_id: PlanNodeId,
    splits: HashSet<ScheduledSplit>,
    no_more_splits: bool,
}

impl TaskSource {
    pub fn new(plan_node_id: PlanNodeId, splits: HashSet<ScheduledSplit>, no_more_splits: bool) -> Self {
        Self {
            plan_node_id,
            splits,
            no_more_splits,
        }
    }

    pub fn empty(plan_node_id: PlanNodeId) -> Self {
        Self::new(plan_node_id, HashSet::new(), false)
    }

    pub fn plan_node_id(&self) -> PlanNodeId {
        self.plan_node_id
    }

    pub fn splits(&self) -> &HashSet<ScheduledSplit> {
        &self.splits
    }

    pub fn is_no_more_splits(&self) -> bool {
        self.no_more_splits
    }

    /// Splits present in `self` but not in `earlier`. Used by the
    /// applied-sources merge to compute what is newly visible.
    pub fn splits_new_since<'a>(&'a self, earlier: &TaskSource) -> impl Iterator<Item = &'a ScheduledSplit> {
        self.splits.iter().filter(move |s| !earlier.splits.contains(*s))
    }

    /// Value-level merge: the union of both split sets and the logical-or of
    /// `no_more_splits`. Does not attempt the identity shortcut; that only
    /// matters for the lock-free staged map's CAS loop, not here.
    pub fn merge_value(&self, other: &TaskSource) -> TaskSource {
        debug_assert_eq!(self.plan_node_id, other.plan_node_id);
        let mut splits = self.splits.clone();
        splits.extend(other.splits.iter().cloned());
        TaskSource {
            plan_node_id: self.plan_node_id,
            splits,
            no_more_splits: self.no_more_splits || other.no_more_splits,
        }
    }

    /// Whether merging `other` into `self` would contribute anything new.
    pub fn contributes_nothing(&self, other: &TaskSource) -> bool {
        (other.no_more_splits && !self.no_more_splits) == false
            && other.splits.iter().all(|s| self.splits.contains(s))
    }
}

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

//! The single-pipeline operator execution engine for a compute task.
//!
//! A [`Driver`] owns an ordered, non-empty chain of [`Operator`]s and pumps
//! pages from one end to the other one cooperative quantum at a time,
//! while absorbing split assignments and close requests that arrive
//! concurrently from other threads. See [`Driver`] for the full contract.

#[macro_use]
extern crate tracing;

mod context;
mod driver;
mod error;
mod lock;
mod operator;
mod source;
mod sources;
mod state;

pub use context::{DriverContext, TaskId};
pub use driver::{Driver, DriverConfig};
pub use error::{DriverError, DriverResult, Suppressed};
pub use operator::{Blocked, Operator, OperatorContext, Page, SourceOperator, NOT_BLOCKED};
pub use source::{PlanNodeId, ScheduledSplit, SplitId, SplitMetaData, TaskSource};

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

use std::sync::atomic::{AtomicU8, Ordering};

/// The driver's three-valued lifecycle. Transitions are monotone:
/// `Alive -> NeedDestruction -> Destroyed`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriverState {
    Alive = 0,
    NeedDestruction = 1,
    Destroyed = 2,
}

impl DriverState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DriverState::Alive,
            1 => DriverState::NeedDestruction,
            _ => DriverState::Destroyed,
        }
    }
}

/// Lock-free, monotone state cell backing the driver lifecycle.
///
/// All writes are compare-and-swap; there is no way to observe or perform a
/// backward transition through this type.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(DriverState::Alive as u8))
    }

    pub fn get(&self) -> DriverState {
        DriverState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempt `Alive -> NeedDestruction`. Returns `true` iff this call made
    /// the transition (i.e. the caller "won" the race).
    pub fn try_request_destruction(&self) -> bool {
        self.0
            .compare_exchange(
                DriverState::Alive as u8,
                DriverState::NeedDestruction as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Attempt `NeedDestruction -> Destroyed`. Returns `true` iff this call
    /// made the transition; `destroyIfNecessary` must run only when this
    /// returns `true`, which is what guarantees it runs at most once.
    pub fn try_advance_to_destroyed(&self) -> bool {
        self.0
            .compare_exchange(
                DriverState::NeedDestruction as u8,
                DriverState::Destroyed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

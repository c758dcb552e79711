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

/// Errors that indicate a caller violated the Driver's contract rather than
/// a failure of the pipeline itself. Contract violations are not meant to
/// be recovered from; callers hitting one have a bug.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("a driver must own at least one operator")]
    EmptyPipeline,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A primary failure together with any number of failures that occurred
/// while trying to clean up after it.
///
/// The destruction sequence must attempt every operator's `finish`
/// and `close` even after one of them fails, and report all of it without
/// losing the first, most relevant, cause. `anyhow::Error` has no public
/// notion of suppressed causes of its own, so this wraps it.
#[derive(Debug)]
pub struct Suppressed {
    primary: anyhow::Error,
    suppressed: Vec<anyhow::Error>,
}

impl Suppressed {
    pub fn new(primary: anyhow::Error) -> Self {
        Self {
            primary,
            suppressed: Vec::new(),
        }
    }

    /// Attach another failure observed while already unwinding from `primary`.
    pub fn suppress(&mut self, err: anyhow::Error) {
        self.suppressed.push(err);
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        anyhow::Error::new(self)
    }
}

impl fmt::Display for Suppressed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        for (i, s) in self.suppressed.iter().enumerate() {
            write!(f, "\n  suppressed[{i}]: {s}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Suppressed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.primary.source()
    }
}

/// Accumulate a fallible step into an in-flight error slot, suppressing
/// onto whatever is already there instead of discarding one or the other.
///
/// Used by the destruction sequence, where every operator's `finish`/`close`
/// must be attempted regardless of earlier failures.
pub(crate) fn accumulate(slot: &mut Option<Suppressed>, err: anyhow::Error) {
    match slot {
        Some(existing) => existing.suppress(err),
        None => *slot = Some(Suppressed::new(err)),
    }
}
